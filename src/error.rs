// Error taxonomy
use std::sync::Arc;

/// Errors raised by the memory model, the lane runtime and the host runtime.
///
/// The type is `Clone` so a failed completion token can hand the very same
/// error to every waiter.
#[derive(Debug, Clone, thiserror::Error)]
pub enum PimError {
    #[error("invalid machine configuration: {0}")]
    InvalidConfig(String),

    #[error("argument block must be exactly {expected} bytes, got {got}")]
    ArgBlockSize { expected: usize, got: usize },

    #[error("argument block magic mismatch: {0:#010x}")]
    ArgBlockMagic(u32),

    #[error("argument block schema version {got} is not supported (expected {expected})")]
    ArgBlockVersion { expected: u16, got: u16 },

    #[error("kernel selector {0} is out of range")]
    UnknownKernel(u16),

    #[error("element type tag {0} is out of range")]
    UnknownElementType(u16),

    #[error("element mismatch: {0}")]
    ElementMismatch(String),

    #[error("scratchpad exhausted: requested {requested} bytes, {available} of {capacity} left")]
    ScratchpadExhausted {
        requested: usize,
        available: usize,
        capacity: usize,
    },

    #[error("bulk memory range {offset}..{end} outside node capacity {capacity}")]
    OutOfBulkMemory { offset: i64, end: i64, capacity: usize },

    #[error("overlapping writes: {first} and {second} both write {location}")]
    OverlappingWrites {
        first: String,
        second: String,
        location: String,
    },

    #[error("read/write conflict: {writer} writes {location} while {reader} reads it")]
    ReadWriteConflict {
        writer: String,
        reader: String,
        location: String,
    },

    #[error("invalid region: {0}")]
    InvalidRegion(String),

    #[error("unknown execution node {0}")]
    UnknownNode(usize),

    #[error("staging error: {0}")]
    Staging(String),

    #[error("lane {lane} panicked: {message}")]
    LanePanicked { lane: usize, message: String },

    #[error("runtime error: {0}")]
    Runtime(String),

    #[error("I/O error: {0}")]
    Io(Arc<std::io::Error>),
}

impl From<std::io::Error> for PimError {
    fn from(err: std::io::Error) -> Self {
        PimError::Io(Arc::new(err))
    }
}

impl From<serde_json::Error> for PimError {
    fn from(err: serde_json::Error) -> Self {
        PimError::InvalidConfig(err.to_string())
    }
}

impl PimError {
    /// True for the fatal configuration class: raised before any lane runs.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            PimError::InvalidConfig(_)
                | PimError::ArgBlockSize { .. }
                | PimError::ArgBlockMagic(_)
                | PimError::ArgBlockVersion { .. }
                | PimError::UnknownKernel(_)
                | PimError::UnknownElementType(_)
                | PimError::ElementMismatch(_)
                | PimError::ScratchpadExhausted { .. }
                | PimError::OutOfBulkMemory { .. }
                | PimError::OverlappingWrites { .. }
                | PimError::ReadWriteConflict { .. }
                | PimError::InvalidRegion(_)
                | PimError::UnknownNode(_)
        )
    }
}

/// Convenience alias for `Result<T, PimError>`.
pub type Result<T> = std::result::Result<T, PimError>;
