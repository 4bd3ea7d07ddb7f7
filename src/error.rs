//! Error taxonomy of the I/O engine.
//!
//! The kinds matter: the retry policy in the read and write paths matches on
//! them (transport and integrity errors are retried with the offending
//! replica excluded, permission and semantic errors surface immediately).

use thiserror::Error;

use crate::common::chunk_part::ChunkPartType;
use crate::protocol::{NetworkAddress, Status};

#[derive(Error, Debug, Clone)]
pub enum FsError {
    // transport
    #[error("operation timed out")]
    Timeout,
    #[error("connecting to {0} failed")]
    Connect(NetworkAddress),
    #[error("protocol error: {0}")]
    Protocol(String),

    // integrity
    #[error("crc mismatch reading chunk {chunk_id:#018x} part {part} from {address}")]
    ChunkCrc {
        address: NetworkAddress,
        part: ChunkPartType,
        chunk_id: u64,
    },
    #[error("chunk version mismatch (got {got}, expected {expected})")]
    VersionMismatch { got: u32, expected: u32 },
    #[error("master rejected lock id")]
    LockId,

    // availability
    #[error("no valid copies of requested chunk data")]
    NoValidCopies,
    #[error("chunkserver overloaded")]
    ChunkserverOverloaded,

    // permission / semantic
    #[error("permission denied")]
    Eacces,
    #[error("operation not permitted")]
    Eperm,
    #[error("no such file or directory")]
    Enoent,
    #[error("file exists")]
    Eexist,
    #[error("directory not empty")]
    Enotempty,
    #[error("not a directory")]
    Enotdir,
    #[error("name too long")]
    Enametoolong,
    #[error("file too large")]
    Efbig,
    #[error("invalid argument")]
    Einval,
    #[error("attribute not found")]
    Enoattr,
    #[error("operation not supported")]
    Enotsup,
    #[error("no space left on device")]
    Enospc,
    #[error("interrupted")]
    Eintr,
    #[error("I/O error: {0}")]
    Io(String),

    // quota / limits
    #[error("group not registered with master")]
    GroupNotRegistered,
    #[error("I/O limit exceeded")]
    LimitExceeded,

    // fatal, session level
    #[error("session with master lost")]
    SessionLost,
    #[error("master requires a password")]
    PasswordNeeded,
}

impl FsError {
    /// Transport errors are retried against another replica or after a
    /// reconnect. Integrity errors additionally poison the offending replica.
    pub fn is_transport(&self) -> bool {
        matches!(self, FsError::Timeout | FsError::Connect(_) | FsError::Protocol(_))
    }

    pub fn is_integrity(&self) -> bool {
        matches!(
            self,
            FsError::ChunkCrc { .. } | FsError::VersionMismatch { .. } | FsError::LockId
        )
    }

    pub fn is_retryable(&self) -> bool {
        self.is_transport() || self.is_integrity() || matches!(self, FsError::ChunkserverOverloaded)
    }

    /// Errno for the FUSE boundary.
    pub fn to_errno(&self) -> i32 {
        match self {
            FsError::Timeout => libc::ETIMEDOUT,
            FsError::Connect(_) => libc::ECONNREFUSED,
            FsError::Protocol(_) => libc::EIO,
            FsError::ChunkCrc { .. } => libc::EIO,
            FsError::VersionMismatch { .. } => libc::EIO,
            FsError::LockId => libc::EIO,
            FsError::NoValidCopies => libc::EIO,
            FsError::ChunkserverOverloaded => libc::EAGAIN,
            FsError::Eacces => libc::EACCES,
            FsError::Eperm => libc::EPERM,
            FsError::Enoent => libc::ENOENT,
            FsError::Eexist => libc::EEXIST,
            FsError::Enotempty => libc::ENOTEMPTY,
            FsError::Enotdir => libc::ENOTDIR,
            FsError::Enametoolong => libc::ENAMETOOLONG,
            FsError::Efbig => libc::EFBIG,
            FsError::Einval => libc::EINVAL,
            FsError::Enoattr => libc::ENODATA,
            FsError::Enotsup => libc::ENOTSUP,
            FsError::Enospc => libc::ENOSPC,
            FsError::Eintr => libc::EINTR,
            FsError::Io(_) => libc::EIO,
            FsError::GroupNotRegistered => libc::EPERM,
            FsError::LimitExceeded => libc::EDQUOT,
            FsError::SessionLost => libc::EIO,
            FsError::PasswordNeeded => libc::EACCES,
        }
    }
}

/// Map a wire status to an error. `Status::Ok` is not an error; callers
/// check it before converting.
pub fn status_to_error(status: Status) -> FsError {
    match status {
        Status::Ok => FsError::Io("status ok converted to error".into()),
        Status::Eperm => FsError::Eperm,
        Status::Enotdir => FsError::Enotdir,
        Status::Enoent => FsError::Enoent,
        Status::Eacces => FsError::Eacces,
        Status::Eexist => FsError::Eexist,
        Status::Einval => FsError::Einval,
        Status::Enotempty => FsError::Enotempty,
        Status::ChunkLost | Status::NoChunk => FsError::NoValidCopies,
        Status::OutOfMemory => FsError::Io("master out of memory".into()),
        Status::IndexTooBig => FsError::Efbig,
        Status::Locked | Status::ChunkBusy => FsError::ChunkserverOverloaded,
        Status::NoChunkservers => FsError::NoValidCopies,
        Status::Eio => FsError::Io("remote I/O error".into()),
        Status::Enospc => FsError::Enospc,
        Status::Enametoolong => FsError::Enametoolong,
        Status::Efbig => FsError::Efbig,
        Status::Enoattr | Status::Enodata => FsError::Enoattr,
        Status::Enotsup => FsError::Enotsup,
        Status::WrongLockId => FsError::LockId,
        Status::NotPossible => FsError::Einval,
        Status::GroupNotRegistered => FsError::GroupNotRegistered,
        Status::Eintr => FsError::Eintr,
    }
}

pub type Result<T> = std::result::Result<T, FsError>;
