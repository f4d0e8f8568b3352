/// Result alias that carries the custom [`LipSyncError`] type.
pub type Result<T> = std::result::Result<T, LipSyncError>;

/// Common error type for the core crate.
#[derive(Debug, thiserror::Error)]
pub enum LipSyncError {
    /// Malformed audio or job parameters. Never retried.
    #[error("invalid input: {0}")]
    InvalidInput(String),
    /// A binary motion buffer ended before a declared section did.
    #[error("truncated data: needed {needed} bytes, {available} available")]
    TruncatedData { needed: usize, available: usize },
    /// The buffer does not start with a recognised motion header.
    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),
    /// An execution backend could not be brought up.
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),
    /// The secondary motion converter is missing from the active backend.
    #[error("secondary conversion unavailable: {0}")]
    SecondaryConversionUnavailable(String),
    /// Transport failure or an error envelope returned by a remote endpoint.
    #[error("dispatch failed: {0}")]
    Dispatch(String),
    #[error("job did not finish within {0:?}")]
    Timeout(std::time::Duration),
    #[error("job was cancelled")]
    Cancelled,
    /// Free-form message for collaborator failures that carry no structure.
    #[error("{0}")]
    Message(String),
    /// Wrapper around standard IO errors.
    #[error("{0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Json(#[from] serde_json::Error),
    #[error("{0}")]
    Wav(#[from] hound::Error),
    #[error("{0}")]
    Fft(#[from] realfft::FftError),
}

impl LipSyncError {
    /// Creates a new error that simply wraps the provided message.
    pub fn msg<T: Into<String>>(msg: T) -> Self {
        Self::Message(msg.into())
    }

    /// Shorthand for [`LipSyncError::InvalidInput`].
    pub fn invalid<T: Into<String>>(msg: T) -> Self {
        Self::InvalidInput(msg.into())
    }
}

impl From<&str> for LipSyncError {
    fn from(value: &str) -> Self {
        Self::msg(value)
    }
}

impl From<String> for LipSyncError {
    fn from(value: String) -> Self {
        Self::Message(value)
    }
}
