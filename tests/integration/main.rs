//! Filesystem core tests against the in-process store. No FUSE needed.

#[path = "../helpers/mod.rs"]
mod helpers;

mod files;
mod grafts;
mod lookup;
mod rename;
