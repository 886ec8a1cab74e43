use bookgen_core::ChatError;
use reqwest::StatusCode;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("failed to parse response: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid backend configuration: {0}")]
    InvalidConfig(String),
    #[error("unexpected http status {status}: {body}")]
    HttpStatus { status: StatusCode, body: String },
    #[error("backend returned an empty response")]
    EmptyResponse,
    #[error("unexpected response format: {0}")]
    UnexpectedFormat(String),
}

impl AdapterError {
    pub fn invalid_config(message: impl Into<String>) -> Self {
        AdapterError::InvalidConfig(message.into())
    }

    /// Failures that never produced a usable HTTP response.
    pub fn is_transport(&self) -> bool {
        match self {
            AdapterError::Http(err) => !err.is_decode() && !err.is_status(),
            _ => false,
        }
    }
}

impl From<AdapterError> for ChatError {
    fn from(err: AdapterError) -> Self {
        match err {
            AdapterError::Http(source) if !source.is_decode() && !source.is_status() => {
                ChatError::transport(source)
            }
            other => ChatError::backend(other.to_string()),
        }
    }
}
