use shared::error::{ApiException, ErrorCode};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error(transparent)]
    Api(#[from] ApiException),
    #[error("unexpected response status {status}: {body}")]
    UnexpectedStatus { status: u16, body: String },
    #[error("server_url must start with http:// or https://, got '{0}'")]
    InvalidServerUrl(String),
}

/// Error code reported by the server or service, if the failure carries one.
pub fn error_code(err: &anyhow::Error) -> Option<ErrorCode> {
    if let Some(api) = err.downcast_ref::<ApiException>() {
        return Some(api.code);
    }
    match err.downcast_ref::<SourceError>() {
        Some(SourceError::Api(api)) => Some(api.code),
        _ => None,
    }
}

/// Short human-readable reason for a failed call, used in per-item reports.
pub fn describe_failure(err: &anyhow::Error) -> String {
    if let Some(api) = err.downcast_ref::<ApiException>() {
        return api.message.clone();
    }
    match err.downcast_ref::<SourceError>() {
        Some(SourceError::Api(api)) => return api.message.clone(),
        Some(other) => return other.to_string(),
        None => {}
    }
    format!("{err:#}")
}
