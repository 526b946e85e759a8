use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;

use bucketfs::backend::local::DirStore;
use bucketfs::backend::memory::MemoryStore;
use bucketfs::backend::{Backend, ObjectBackend};
use bucketfs::config::{load_mounts, Cli, Command, FsConfig};
use bucketfs::fs::handles::{FileHandle, HandleTable};
use bucketfs::fs::inodes::InodeTable;
use bucketfs::fs::mount::Mount;
use bucketfs::fs::BucketFs;

/// Write-end of the self-pipe used for signal notification.
static SIGNAL_PIPE: AtomicI32 = AtomicI32::new(-1);

const STOP_BYTE: u8 = 0;
const STATS_BYTE: u8 = 1;

extern "C" fn signal_handler(sig: libc::c_int) {
    let fd = SIGNAL_PIPE.load(Ordering::Relaxed);
    if fd >= 0 {
        let byte = if sig == libc::SIGUSR1 { STATS_BYTE } else { STOP_BYTE };
        unsafe {
            libc::write(fd, [byte].as_ptr() as *const libc::c_void, 1);
        }
    }
}

enum ShutdownAction {
    /// Second signal: force unmount.
    ForceUnmount,
    /// FUSE session ended on its own, or first-signal probe unmount succeeded.
    ExternalUnmount,
}

/// Attempt a regular (non-forced) unmount. Returns true if the mount was
/// removed, i.e. it was not busy.
fn try_unmount(mountpoint: &Path) -> bool {
    std::process::Command::new("umount")
        .arg(mountpoint)
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

/// Block until shutdown conditions are met. Two-phase ctrl-C:
/// - First signal when the mount is not busy: immediate clean unmount.
/// - First signal when it is busy: warn and wait.
/// - Second signal: force unmount.
///
/// SIGUSR1 logs inode statistics and keeps waiting.
fn wait_for_shutdown(
    guard: &std::thread::JoinHandle<std::io::Result<()>>,
    file_handles: &HandleTable<FileHandle>,
    inodes: &InodeTable,
    mountpoint: &Path,
) -> ShutdownAction {
    let mut pipe_fds = [0 as libc::c_int; 2];
    assert_eq!(
        unsafe { libc::pipe(pipe_fds.as_mut_ptr()) },
        0,
        "failed to create signal pipe"
    );

    SIGNAL_PIPE.store(pipe_fds[1], Ordering::Relaxed);

    unsafe {
        use nix::sys::signal::{signal, SigHandler, Signal};
        signal(Signal::SIGINT, SigHandler::Handler(signal_handler)).ok();
        signal(Signal::SIGTERM, SigHandler::Handler(signal_handler)).ok();
        signal(Signal::SIGUSR1, SigHandler::Handler(signal_handler)).ok();
    }

    let mut first_signal_received = false;
    let mut poll_ticks: u32 = 0;

    let action = loop {
        let mut pfd = libc::pollfd {
            fd: pipe_fds[0],
            events: libc::POLLIN,
            revents: 0,
        };
        let ret = unsafe { libc::poll(&mut pfd, 1, 200) };

        if ret > 0 {
            let mut buf = [0u8; 1];
            unsafe {
                libc::read(pipe_fds[0], buf.as_mut_ptr() as *mut libc::c_void, 1);
            }

            if buf[0] == STATS_BYTE {
                info!(
                    "{} inodes live, {} forgotten, {} open files",
                    inodes.len(),
                    inodes.forgotten(),
                    file_handles.len()
                );
                continue;
            }

            if first_signal_received {
                eprintln!("bucketfs: force unmounting...");
                break ShutdownAction::ForceUnmount;
            }

            if guard.is_finished() {
                break ShutdownAction::ExternalUnmount;
            }

            if try_unmount(mountpoint) {
                eprintln!("bucketfs: unmounting (received signal)...");
                break ShutdownAction::ExternalUnmount;
            }

            first_signal_received = true;
            let open_files = file_handles.list_open();
            if open_files.is_empty() {
                eprintln!("bucketfs: mount is busy, processes are using the mountpoint");
            } else {
                eprintln!("bucketfs: mount is busy, {} open file(s):", open_files.len());
                let display_cap = 10;
                for info in open_files.iter().take(display_cap) {
                    match info.tgid {
                        Some(tgid) => eprintln!("  {}  (pid {})", info.path, tgid),
                        None => eprintln!("  {}", info.path),
                    }
                }
                if open_files.len() > display_cap {
                    eprintln!("  and {} more...", open_files.len() - display_cap);
                }
            }
            eprintln!("Close open files to unmount cleanly, or press ctrl-C again to force unmount.");
            continue;
        }

        if guard.is_finished() {
            break ShutdownAction::ExternalUnmount;
        }

        if first_signal_received {
            poll_ticks += 1;
            if poll_ticks % 5 == 0 && try_unmount(mountpoint) {
                eprintln!("bucketfs: all clear, unmounting...");
                break ShutdownAction::ExternalUnmount;
            }
        }
    };

    SIGNAL_PIPE.store(-1, Ordering::Relaxed);
    unsafe {
        libc::close(pipe_fds[0]);
        libc::close(pipe_fds[1]);
    }

    action
}

fn open_store(path: &Path, memory: bool) -> Arc<dyn ObjectBackend> {
    if memory {
        Arc::new(MemoryStore::new("memory"))
    } else {
        Arc::new(DirStore::new(path))
    }
}

/// Build the filesystem with its root store initialised and every graft from
/// `mounts` applied.
fn build_fs(
    config: &FsConfig,
    store: &Path,
    memory: bool,
    mounts: &[bucketfs::config::MountSpec],
) -> bucketfs::error::Result<BucketFs> {
    let backend = Arc::new(Backend::new(open_store(store, memory), config.request_timeout));
    backend.init()?;
    let fs = BucketFs::new(config.clone(), backend);

    let grafts = mounts
        .iter()
        .map(|spec| {
            let backend = Arc::new(Backend::new(
                Arc::new(DirStore::new(&spec.store)),
                config.request_timeout,
            ));
            Arc::new(Mount::new(&spec.path, backend, &spec.prefix))
        })
        .collect();
    fs.mount_all(grafts)?;
    Ok(fs)
}

fn main() {
    let cli = Cli::parse();

    match cli.command {
        Command::Mount {
            store,
            mountpoint,
            memory,
            mounts,
            log_file,
            options,
            dir_mode,
            file_mode,
            uid,
            gid,
            stat_cache_ttl,
            type_cache_ttl,
            http_timeout,
            no_implicit_dir,
            debug_fuse,
        } => {
            let store = if memory {
                store
            } else {
                let store = std::fs::canonicalize(&store).unwrap_or_else(|e| {
                    eprintln!("Error: store directory {:?}: {}", store, e);
                    std::process::exit(1);
                });
                if !store.is_dir() {
                    eprintln!("Error: store path is not a directory: {:?}", store);
                    std::process::exit(1);
                }
                store
            };

            if !mountpoint.exists() {
                if let Err(e) = std::fs::create_dir_all(&mountpoint) {
                    eprintln!("Error creating mountpoint {:?}: {}", mountpoint, e);
                    std::process::exit(1);
                }
            }

            let mountpoint = std::fs::canonicalize(&mountpoint).unwrap_or_else(|e| {
                eprintln!("Error: mountpoint {:?}: {}", mountpoint, e);
                std::process::exit(1);
            });

            if is_stale_fuse_mount(&mountpoint) {
                eprintln!(
                    "Error: {} is a stale FUSE mount (previous bucketfs session didn't clean up).\n\
                     Fix with:  umount -f {}",
                    mountpoint.display(),
                    mountpoint.display(),
                );
                std::process::exit(1);
            }

            // Set up logging
            let log_dir = log_file.parent().unwrap_or_else(|| Path::new("/tmp"));
            let log_name = log_file
                .file_name()
                .unwrap_or_else(|| std::ffi::OsStr::new("bucketfs.log"));
            let file_appender = tracing_appender::rolling::never(log_dir, log_name);
            let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

            let default_level = if debug_fuse { "debug" } else { "info" };
            let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

            let subscriber = tracing_subscriber::registry()
                .with(env_filter)
                .with(
                    fmt::layer()
                        .with_writer(non_blocking)
                        .with_ansi(false)
                        .with_target(false),
                )
                .with(
                    fmt::layer()
                        .with_writer(std::io::stderr)
                        .with_target(false),
                );
            tracing::subscriber::set_global_default(subscriber)
                .expect("Failed to set tracing subscriber");

            std::panic::set_hook(Box::new(|panic| {
                let backtrace = std::backtrace::Backtrace::force_capture();
                error!("{}\n{}", panic, backtrace);
            }));

            let defaults = FsConfig::default();
            let config = FsConfig {
                dir_mode,
                file_mode,
                uid: uid.unwrap_or(defaults.uid),
                gid: gid.unwrap_or(defaults.gid),
                stat_cache_ttl,
                type_cache_ttl,
                request_timeout: (!http_timeout.is_zero()).then_some(http_timeout),
                explicit_dir: no_implicit_dir,
                debug_fuse,
                ..defaults
            };

            let grafts = match mounts {
                Some(ref path) => load_mounts(path).unwrap_or_else(|e| {
                    eprintln!("Error: {}", e);
                    std::process::exit(1);
                }),
                None => Vec::new(),
            };

            info!(
                "bucketfs starting: store={}, mountpoint={}, grafts={}",
                if memory { "<memory>".to_string() } else { store.display().to_string() },
                mountpoint.display(),
                grafts.len()
            );

            let fs = build_fs(&config, &store, memory, &grafts).unwrap_or_else(|e| {
                error!("Failed to open store: {}", e);
                std::process::exit(1);
            });

            // Keep the shared tables reachable from main once the filesystem
            // has moved into the FUSE session.
            let mut file_handles = Arc::clone(&fs.file_handles);
            let mut inodes = Arc::clone(&fs.inodes);

            let mut fuse_config = fuser::Config::default();
            fuse_config.mount_options = vec![
                fuser::MountOption::FSName("bucketfs".to_string()),
                fuser::MountOption::AutoUnmount,
                fuser::MountOption::DefaultPermissions,
            ];
            fuse_config
                .mount_options
                .extend(options.iter().map(|o| fuser::MountOption::CUSTOM(o.clone())));
            fuse_config.acl = fuser::SessionACL::All;

            info!("Mounting bucketfs filesystem...");

            let session = match fuser::spawn_mount2(fs, &mountpoint, &fuse_config) {
                Ok(session) => session,
                Err(e) => {
                    if e.raw_os_error() == Some(libc::EPERM) || e.to_string().contains("allow_other") {
                        fuse_config.acl = fuser::SessionACL::Owner;
                        info!("Retrying mount without allow_other...");
                        let retry_fs = build_fs(&config, &store, memory, &grafts).unwrap_or_else(|e| {
                            error!("Failed to open store: {}", e);
                            std::process::exit(1);
                        });
                        file_handles = Arc::clone(&retry_fs.file_handles);
                        inodes = Arc::clone(&retry_fs.inodes);
                        match fuser::spawn_mount2(retry_fs, &mountpoint, &fuse_config) {
                            Ok(session) => session,
                            Err(e) => {
                                error!("Failed to mount: {}", e);
                                std::process::exit(1);
                            }
                        }
                    } else {
                        error!("Failed to mount: {}", e);
                        std::process::exit(1);
                    }
                }
            };

            info!("bucketfs mounted at {}", mountpoint.display());

            let action = wait_for_shutdown(&session.guard, &file_handles, &inodes, &mountpoint);

            match action {
                ShutdownAction::ForceUnmount => {
                    if let Err(e) = session.umount_and_join() {
                        error!("Error during unmount, trying force unmount: {}", e);
                        let mp = mountpoint.to_string_lossy();
                        let _ = std::process::Command::new("umount")
                            .args(["-f", &*mp])
                            .status();
                    }
                }
                ShutdownAction::ExternalUnmount => {
                    if let Err(e) = session.join() {
                        error!("Error joining FUSE session: {}", e);
                    }
                }
            }

            eprintln!("bucketfs: unmounted {}", mountpoint.display());
        }
        Command::Unmount { mountpoint } => {
            unmount(&mountpoint);
        }
    }
}

/// Check if `path` is a stale FUSE mount: listed as a fuse volume but no
/// longer functional.
fn is_stale_fuse_mount(path: &Path) -> bool {
    let output = match std::process::Command::new("mount").output() {
        Ok(o) => o,
        Err(_) => return false,
    };
    let stdout = String::from_utf8_lossy(&output.stdout);
    let path_str = path.to_string_lossy();
    let is_fuse_mount = stdout.lines().any(|line| {
        line.contains(path_str.as_ref()) && (line.contains("fuse") || line.contains("macfuse"))
    });
    if !is_fuse_mount {
        return false;
    }
    std::fs::read_dir(path).is_err()
}

fn unmount(mountpoint: &PathBuf) {
    let mountpoint = std::fs::canonicalize(mountpoint).unwrap_or_else(|e| {
        eprintln!("Error: mountpoint {:?}: {}", mountpoint, e);
        std::process::exit(1);
    });
    let mp = mountpoint.to_string_lossy();
    eprintln!("Unmounting {}...", mp);

    let busy = |o: &std::process::Output| {
        String::from_utf8_lossy(&o.stderr).contains("busy")
            || String::from_utf8_lossy(&o.stdout).contains("busy")
    };

    for cmd in [vec!["umount", &*mp], vec!["fusermount", "-u", &*mp], vec!["diskutil", "unmount", &*mp]] {
        let output = std::process::Command::new(cmd[0]).args(&cmd[1..]).output();
        match output {
            Ok(ref o) if o.status.success() => {
                eprintln!("Successfully unmounted {}", mp);
                return;
            }
            Ok(ref o) if busy(o) => {
                eprintln!(
                    "Mount point is busy. Make sure no shells or processes are using {}, then try again.",
                    mp
                );
                std::process::exit(1);
            }
            _ => {}
        }
    }

    let status = std::process::Command::new("umount")
        .args(["-f", &*mp])
        .status();

    if matches!(status, Ok(s) if s.success()) {
        eprintln!("Successfully unmounted {} (forced)", mp);
        return;
    }

    eprintln!("Failed to unmount {}. Try: sudo umount -f {}", mp, mp);
    std::process::exit(1);
}
