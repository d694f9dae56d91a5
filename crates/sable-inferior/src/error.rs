/// Error type of this crate.
#[derive(thiserror::Error, Debug)]
pub enum PortError {
    /// An I/O error occurred while driving the inferior.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// A memory access fell outside the inferior's address space.
    #[error("Invalid inferior address {0:#x}")]
    InvalidAddress(u64),

    /// The inferior is gone (exited or killed).
    #[error("Inferior has exited")]
    InferiorGone,

    /// The transport does not support the requested operation.
    #[error("Operation not supported by this transport: {0}")]
    Unsupported(&'static str),
}

/// Result type of this crate.
pub type Result<T> = core::result::Result<T, PortError>;
