/// Errors that can occur in transport operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The device is working on another xfer and cannot accept a new one.
    #[error("device busy with another xfer")]
    Busy,

    /// No device is attached behind the interface.
    #[error("no transport device")]
    NoDevice,

    /// The device is not initialized or was already closed.
    #[error("transport not running")]
    NotRunning,

    /// Both sides of one xfer must exchange the same number of bytes.
    #[error("asymmetric xfer sizes (local {local}, remote {remote})")]
    SizeMismatch { local: usize, remote: usize },

    /// The physical exchange failed.
    #[error("xfer failed: {0}")]
    XferFailed(String),
}

pub type Result<T> = std::result::Result<T, TransportError>;
