use thiserror::Error;

/// Backing image manager error types
#[derive(Error, Debug)]
pub enum ImageError {
    /// Operation requested in a state that does not allow it
    #[error("invalid state {state} for {operation}")]
    InvalidState { operation: String, state: String },

    /// A pull or receive transfer is already running for this image
    #[error("a transfer is already in flight, cannot {operation}")]
    TransferInFlight { operation: String },

    /// Outbound send concurrency cap reached
    #[error("image {name} is already sending data to {limit} receivers")]
    SendingLimitReached { name: String, limit: i32 },

    /// Work directory or file preparation failed
    #[error("file error: {0}")]
    FileError(String),

    /// Pull-from-URL transfer failed
    #[error("download error: {0}")]
    DownloadError(String),

    /// Inbound or outbound sync transfer failed
    #[error("sync error: {0}")]
    SyncError(String),

    /// The inbound sync server was shut down cleanly
    #[error("sync server closed")]
    SyncServerClosed,

    /// Port lease or release failed
    #[error("port error: {0}")]
    PortError(String),

    /// Bytes reported by the progress sink disagree with bytes written
    #[error("processed size {processed} doesn't match written size {written}")]
    SizeMismatch { processed: i64, written: i64 },

    /// Recorded size is impossible for the current state
    #[error("invalid size {size} for downloaded file")]
    InvalidSize { size: i64 },

    /// I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

/// Result type alias for backing image operations
pub type Result<T> = std::result::Result<T, ImageError>;
