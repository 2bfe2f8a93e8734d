use std::time::Duration;

use thiserror::Error;

/// Failure taxonomy shared by the fetcher, the content source and the feed queue.
///
/// Values are `Clone` so the queue can keep the last failure in its broadcast state.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    #[error("no network connection")]
    Offline,
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("transient failure: {message}")]
    Transient { status: Option<u16>, message: String },
    #[error("request to {url} failed with status {status}")]
    Terminal { status: u16, url: String },
    #[error("gave up after {attempts} attempts: {last}")]
    ExhaustedRetries { attempts: u32, last: Box<FetchError> },
    #[error("no content available: {0}")]
    NoContentAvailable(String),
    #[error("request cancelled")]
    Cancelled,
    #[error("malformed response: {0}")]
    Decode(String),
}

impl FetchError {
    /// Whether another attempt may succeed. Only timeouts and transient
    /// failures qualify; everything else surfaces to the caller unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(self, FetchError::Timeout(_) | FetchError::Transient { .. })
    }

    pub fn is_offline(&self) -> bool {
        match self {
            FetchError::Offline => true,
            FetchError::ExhaustedRetries { last, .. } => last.is_offline(),
            _ => false,
        }
    }

    /// Status code of the last HTTP response behind this failure, if one was received.
    pub fn status(&self) -> Option<u16> {
        match self {
            FetchError::Transient { status, .. } => *status,
            FetchError::Terminal { status, .. } => Some(*status),
            FetchError::ExhaustedRetries { last, .. } => last.status(),
            _ => None,
        }
    }
}

pub fn is_retryable_status(status: u16) -> bool {
    status == 429 || (500..600).contains(&status)
}
