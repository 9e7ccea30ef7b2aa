use iccom_transport::TransportError;

/// Errors surfaced to consumers of the engine API.
///
/// Protocol-level faults (corrupted frames, parse failures, duplicates) are
/// recovered internally and never appear here; they are only counted and
/// rate-limited into the log.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The channel id is outside the 15-bit channel range.
    #[error("invalid channel {0} (max {max})", max = iccom_wire::MAX_CHANNEL)]
    InvalidChannel(u16),

    /// Posting an empty message is not allowed.
    #[error("message data is empty")]
    EmptyMessage,

    /// The engine is shutting down; no further calls are served.
    #[error("engine is shutting down")]
    ShuttingDown,

    /// The underlying transport refused an operation.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// The configured frame geometry cannot carry any packet.
    #[error("invalid engine configuration: {0}")]
    InvalidConfig(#[from] iccom_wire::WireError),
}

pub type Result<T> = std::result::Result<T, EngineError>;
