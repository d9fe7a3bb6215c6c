use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error categories for logging and for callers deciding how to surface a failure
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ErrorCategory {
    /// The transfer never produced a response (unreachable host, reset connection)
    Network,
    /// A response arrived with a non-2xx status
    Http,
    /// The payload could not be encoded or decoded as JSON
    Parsing,
    /// The pending request was discarded before it settled
    Abandoned,
}

/// Failure reported by a host network primitive before any response exists.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct TransportError {
    pub url: String,
    pub message: String,
}

impl TransportError {
    pub fn new(url: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            message: message.into(),
        }
    }
}

/// Failure of a request issued through the request cache.
///
/// `Clone` so a single outcome can be handed to every caller that joined the
/// same in-flight transfer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LoadError {
    #[error("Failed to load {url}: {status} {status_text}")]
    Status {
        url: String,
        status: u16,
        status_text: String,
    },
    #[error("Failed to load {url}: {message}")]
    Transport { url: String, message: String },
    #[error("Invalid JSON from {url}: {message}")]
    Parse { url: String, message: String },
    #[error("Failed to encode request body for {url}: {message}")]
    Encode { url: String, message: String },
    #[error("Request for {url} was abandoned before it settled")]
    Abandoned { url: String },
}

impl LoadError {
    pub fn url(&self) -> &str {
        match self {
            LoadError::Status { url, .. }
            | LoadError::Transport { url, .. }
            | LoadError::Parse { url, .. }
            | LoadError::Encode { url, .. }
            | LoadError::Abandoned { url } => url,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            LoadError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            LoadError::Status { .. } => ErrorCategory::Http,
            LoadError::Transport { .. } => ErrorCategory::Network,
            LoadError::Parse { .. } | LoadError::Encode { .. } => ErrorCategory::Parsing,
            LoadError::Abandoned { .. } => ErrorCategory::Abandoned,
        }
    }
}

impl From<TransportError> for LoadError {
    fn from(e: TransportError) -> Self {
        LoadError::Transport {
            url: e.url,
            message: e.message,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_error_names_locator_and_status() {
        let err = LoadError::Status {
            url: "https://api.example.com/data/a.json".into(),
            status: 404,
            status_text: "Not Found".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("https://api.example.com/data/a.json"));
        assert!(msg.contains("404"));
        assert_eq!(err.status(), Some(404));
        assert_eq!(err.category(), ErrorCategory::Http);
    }

    #[test]
    fn transport_errors_keep_their_locator() {
        let err: LoadError = TransportError::new("/x", "connection refused").into();
        assert_eq!(err.url(), "/x");
        assert_eq!(err.category(), ErrorCategory::Network);
        assert_eq!(err.status(), None);
    }
}
