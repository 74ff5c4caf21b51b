//! Error types for vision/NPU operations

use thiserror::Error;

/// Core result type
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errno values reported through the vertex ioctl surface
pub mod errno {
    pub const ENOENT: i32 = 2;
    pub const EINTR: i32 = 4;
    pub const EIO: i32 = 5;
    pub const EAGAIN: i32 = 11;
    pub const ENOMEM: i32 = 12;
    pub const EFAULT: i32 = 14;
    pub const EBUSY: i32 = 16;
    pub const EEXIST: i32 = 17;
    pub const EINVAL: i32 = 22;
    pub const ENOSPC: i32 = 28;
}

/// Core error type
#[derive(Debug, Error)]
pub enum Error {
    /// Operation invoked while the state bitmask lacks a required bit
    #[error("invalid state: {0}")]
    InvalidState(&'static str),
    /// Colorspace not present in the format table
    #[error("unknown colorspace 0x{0:08x}")]
    InvalidFormat(u32),
    /// Malformed request field
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// Fixed-capacity pool exceeded
    #[error("{what} exhausted (limit {limit})")]
    ResourceExhausted { what: &'static str, limit: usize },
    /// Re-queued bundle declares a shape different from its first qbuf
    #[error("bundle shape conflict: {0}")]
    Conflict(String),
    /// Bundle is not in the DEQUEUED state
    #[error("bundle {0} already queued")]
    AlreadyQueued(u32),
    /// Non-blocking dequeue on an empty done list
    #[error("operation would block")]
    WouldBlock,
    /// Queue still holds in-flight bundles, or a single-user channel is taken
    #[error("resource busy")]
    Busy,
    /// DMA-buf import or user memory copy failed
    #[error("mapping failed: {0}")]
    Mapping(String),
    /// Malformed golden description text
    #[error("parse error at line {line}, column {column}: {reason}")]
    Parse {
        line: usize,
        column: usize,
        reason: String,
    },
    /// Lookup of a slot, file or vector failed
    #[error("not found: {0}")]
    NotFound(String),
    /// Compute engine returned a non-zero result code
    #[error("device error (code {0})")]
    Device(u32),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Negative errno handed back to ioctl callers
    pub fn errno(&self) -> i32 {
        let code = match self {
            Error::InvalidState(_)
            | Error::InvalidFormat(_)
            | Error::InvalidArgument(_)
            | Error::Conflict(_)
            | Error::AlreadyQueued(_)
            | Error::Parse { .. } => errno::EINVAL,
            Error::ResourceExhausted { .. } => errno::ENOSPC,
            Error::WouldBlock => errno::EAGAIN,
            Error::Busy => errno::EBUSY,
            Error::Mapping(_) => errno::EFAULT,
            Error::NotFound(_) => errno::ENOENT,
            Error::Device(_) => errno::EIO,
            Error::Io(e) if e.kind() == std::io::ErrorKind::NotFound => errno::ENOENT,
            Error::Io(e) if e.kind() == std::io::ErrorKind::Interrupted => errno::EINTR,
            Error::Io(_) => errno::EIO,
        };
        -code
    }

    /// Errors that callers poll around and which are not worth an error log
    pub fn is_would_block(&self) -> bool {
        matches!(self, Error::WouldBlock)
    }
}
