use thiserror::Error;

/// Errors surfaced by the core's control-plane operations.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Connection attempt timed out after {0} s")]
    ConnectionTimeout(u64),

    #[error("Another scan or connect is already in flight")]
    ConnectionBusy,

    #[error("Operation cancelled")]
    Cancelled,

    #[error("No device is connected")]
    NotConnected,

    #[error("Streaming already started")]
    AlreadyStreaming,

    #[error("Streaming is not active")]
    NotStreaming,

    #[error("A recording session is already active: {0}")]
    RecordingAlreadyActive(String),

    #[error("No recording session is active")]
    NoActiveRecording,

    #[error("Recording destination not writable: {0}")]
    DestinationNotWritable(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Encoding error: {0}")]
    Encode(String),

    #[error("Telemetry store error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

impl CoreError {
    /// Machine-readable error kind for the control-plane surface.
    pub fn kind(&self) -> &'static str {
        match self {
            CoreError::DeviceNotFound(_) => "device_not_found",
            CoreError::ConnectionTimeout(_) => "connection_timeout",
            CoreError::ConnectionBusy => "connection_busy",
            CoreError::Cancelled => "cancelled",
            CoreError::NotConnected => "not_connected",
            CoreError::AlreadyStreaming => "already_streaming",
            CoreError::NotStreaming => "not_streaming",
            CoreError::RecordingAlreadyActive(_) => "recording_already_active",
            CoreError::NoActiveRecording => "no_active_recording",
            CoreError::DestinationNotWritable(_) => "destination_not_writable",
            CoreError::Transport(_) => "transport",
            CoreError::Encode(_) => "encode",
            CoreError::Database(_) => "database",
            CoreError::Io(_) => "io",
            CoreError::Serialization(_) => "serialization",
        }
    }
}
