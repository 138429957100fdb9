//! Error types for remote memory operations

/// Error type for remote process memory operations
#[derive(Debug, thiserror::Error)]
pub enum MemoryError {
    /// Remote allocation or region reservation failed
    #[error("remote allocation of {len} bytes failed: {reason}")]
    Allocation { len: usize, reason: String },

    /// Remote write was rejected or incomplete
    #[error("remote write of {len} bytes at {addr:x} failed: {reason}")]
    Write {
        addr: usize,
        len: usize,
        reason: String,
    },

    /// Remote read was rejected or incomplete
    #[error("remote read of {len} bytes at {addr:x} failed: {reason}")]
    Read {
        addr: usize,
        len: usize,
        reason: String,
    },

    /// Page protection change failed
    #[error("protection change at {addr:x} failed: {reason}")]
    Protect { addr: usize, reason: String },

    /// The process handle is no longer valid (target exited mid-operation)
    #[error("target process is unavailable")]
    TargetUnavailable,

    /// A structured read named a field the offset table does not define
    #[error("no offset registered for field '{0}'")]
    UnknownField(String),
}

/// Result type for remote memory operations
pub type MemoryResult<T> = Result<T, MemoryError>;
