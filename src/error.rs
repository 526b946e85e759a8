use thiserror::Error;

use crate::backend::BackendError;

#[derive(Error, Debug)]
pub enum FsError {
    #[error("backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("no such file or directory")]
    NotFound,

    #[error("entry already exists")]
    Exists,

    #[error("directory not empty")]
    NotEmpty,

    #[error("not a directory")]
    NotDir,

    #[error("is a directory")]
    IsDir,

    #[error("rename across backends")]
    CrossDevice,

    #[error("invalid argument")]
    Invalid,

    #[error("operation not supported")]
    Unsupported,

    #[error("no such attribute")]
    NoAttr,

    #[error("result does not fit in the supplied buffer")]
    Range,

    #[error("operation not permitted")]
    NotPermitted,

    #[error("file too large")]
    FileTooLarge,

    #[error("out of memory")]
    OutOfMemory,

    /// A request named an inode id that is not in the table.
    #[error("unknown inode {0}")]
    UnknownInode(u64),

    /// A request named a handle id that is not open.
    #[error("unknown handle {0}")]
    BadHandle(u64),

    #[error("configuration error: {0}")]
    Config(String),

    /// A request handler panicked or could not inspect the caller.
    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, FsError>;

impl FsError {
    /// The errno reported to the kernel for this error.
    pub fn errno(&self) -> i32 {
        match self {
            FsError::Backend(e) => e.errno().unwrap_or(libc::EIO),
            FsError::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
            FsError::NotFound => libc::ENOENT,
            FsError::Exists => libc::EEXIST,
            FsError::NotEmpty => libc::ENOTEMPTY,
            FsError::NotDir => libc::ENOTDIR,
            FsError::IsDir => libc::EISDIR,
            FsError::CrossDevice => libc::EXDEV,
            FsError::Invalid => libc::EINVAL,
            FsError::Unsupported => libc::ENOTSUP,
            FsError::NoAttr => libc::ENODATA,
            FsError::Range => libc::ERANGE,
            FsError::NotPermitted => libc::EPERM,
            FsError::FileTooLarge => libc::EFBIG,
            FsError::OutOfMemory => libc::ENOMEM,
            FsError::UnknownInode(_) | FsError::BadHandle(_) | FsError::Internal(_) => libc::EIO,
            FsError::Config(_) => libc::EINVAL,
        }
    }

    /// True when the error means "the entry does not exist", whichever layer
    /// produced it.
    pub fn is_not_found(&self) -> bool {
        match self {
            FsError::NotFound => true,
            FsError::Backend(e) => e.is_not_found(),
            _ => false,
        }
    }

    /// True for internal invariant violations that must only fail the
    /// current request.
    pub fn is_invariant_violation(&self) -> bool {
        matches!(
            self,
            FsError::UnknownInode(_) | FsError::BadHandle(_) | FsError::Internal(_)
        )
    }
}
