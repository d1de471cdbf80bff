use thiserror::Error;

#[derive(Error, Debug)]
pub enum UploadError {
    #[error("Payload is empty")]
    EmptyPayload,

    #[error("Unsupported mime type: {0}")]
    UnsupportedMimeType(String),

    #[error("Payload too large: {size} bytes (max {max})")]
    PayloadTooLarge {
        size: u64,
        max: u64,
    },

    #[error("Invalid config: {0}")]
    InvalidConfig(String),

    #[error("Upload queue shut down")]
    QueueShutdown,

    #[error("IO error {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML error {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Base64 error {0}")]
    Base64(#[from] base64::DecodeError),
}

impl UploadError {
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig(message.into())
    }

    /// 是否属于入队时的校验错误
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            UploadError::EmptyPayload
                | UploadError::UnsupportedMimeType(_)
                | UploadError::PayloadTooLarge { .. }
        )
    }
}

/// Error alias
pub type Result<T, E = UploadError> = std::result::Result<T, E>;

/// 传输层错误，由 [`UploadTransport`](super::traits::UploadTransport) 返回
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransportError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Request timed out")]
    Timeout,

    #[error("Server error: status code {status_code}, message: {message}")]
    Status {
        status_code: u16,
        message: String,
    },

    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

impl TransportError {
    pub fn status(status_code: u16, message: impl Into<String>) -> Self {
        Self::Status {
            status_code,
            message: message.into(),
        }
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::Network(message.into())
    }
}
