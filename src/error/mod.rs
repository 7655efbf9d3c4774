//! Error types and handlers for registry operations

pub mod handlers;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, RegistryError>;

/// Broad category of a [`RegistryError`], used for reporting and exit codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Connectivity,
    Authorization,
    Transient,
    Integrity,
    Data,
    Status,
    Local,
}

#[derive(Debug, Error)]
pub enum RegistryError {
    /// Registry or proxy could not be reached at all
    #[error("Connectivity error: {0}")]
    Connectivity(String),

    /// SOCKS5 negotiation or tunnel failure
    #[error("Proxy error: {0}")]
    Proxy(String),

    #[error(
        "Unauthorized request to {url} (challenge: {})",
        .challenge.as_deref().unwrap_or("none")
    )]
    Unauthorized {
        url: String,
        challenge: Option<String>,
    },

    /// Timeouts and dropped connections, eligible for retry
    #[error("Transient network error: {0}")]
    Transient(String),

    #[error("Unexpected status {status} from {url}")]
    Status { url: String, status: u16 },

    #[error("Integrity check failed for {digest}: {reason}")]
    Integrity { digest: String, reason: String },

    /// Empty catalog or tag list, with a command the operator can run by hand
    #[error("{what}; verify manually with: {hint}")]
    NotFound { what: String, hint: String },

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl RegistryError {
    /// Whether the transport may retry the request that produced this error
    pub fn is_transient(&self) -> bool {
        matches!(self, RegistryError::Transient(_))
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            RegistryError::Connectivity(_) | RegistryError::Proxy(_) => ErrorKind::Connectivity,
            RegistryError::Unauthorized { .. } => ErrorKind::Authorization,
            RegistryError::Transient(_) => ErrorKind::Transient,
            RegistryError::Integrity { .. } => ErrorKind::Integrity,
            RegistryError::NotFound { .. } | RegistryError::Parse(_) => ErrorKind::Data,
            RegistryError::Status { .. } => ErrorKind::Status,
            RegistryError::Io(_) | RegistryError::Config(_) => ErrorKind::Local,
        }
    }

    /// Process exit code for a run that ended with this error
    pub fn exit_code(&self) -> u8 {
        match self.kind() {
            ErrorKind::Local => 2,
            ErrorKind::Connectivity | ErrorKind::Transient => 3,
            ErrorKind::Authorization => 4,
            _ => 1,
        }
    }
}

impl From<serde_json::Error> for RegistryError {
    fn from(err: serde_json::Error) -> Self {
        RegistryError::Parse(err.to_string())
    }
}

impl From<url::ParseError> for RegistryError {
    fn from(err: url::ParseError) -> Self {
        RegistryError::Config(format!("invalid URL: {}", err))
    }
}

impl From<http::header::InvalidHeaderValue> for RegistryError {
    fn from(err: http::header::InvalidHeaderValue) -> Self {
        RegistryError::Config(format!("invalid header value: {}", err))
    }
}

impl From<http::header::InvalidHeaderName> for RegistryError {
    fn from(err: http::header::InvalidHeaderName) -> Self {
        RegistryError::Config(format!("invalid header name: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_transient_errors_are_retryable() {
        assert!(RegistryError::Transient("reset".into()).is_transient());
        assert!(!RegistryError::Connectivity("refused".into()).is_transient());
        assert!(
            !RegistryError::Status {
                url: "http://r/v2/".into(),
                status: 500
            }
            .is_transient()
        );
    }

    #[test]
    fn test_unauthorized_display_carries_challenge() {
        let err = RegistryError::Unauthorized {
            url: "https://r/v2/_catalog".into(),
            challenge: Some("Basic realm=\"Registry\"".into()),
        };
        let text = err.to_string();
        assert!(text.contains("https://r/v2/_catalog"));
        assert!(text.contains("Basic realm=\"Registry\""));
        assert_eq!(err.kind(), ErrorKind::Authorization);
    }

    #[test]
    fn test_not_found_display_carries_hint() {
        let err = RegistryError::NotFound {
            what: "no tags found for alpine".into(),
            hint: "curl http://r:5000/v2/alpine/tags/list".into(),
        };
        assert!(err.to_string().contains("curl http://r:5000/v2/alpine/tags/list"));
        assert_eq!(err.kind(), ErrorKind::Data);
    }

    #[test]
    fn test_exit_codes_by_kind() {
        assert_eq!(RegistryError::Config("x".into()).exit_code(), 2);
        assert_eq!(RegistryError::Proxy("x".into()).exit_code(), 3);
        assert_eq!(RegistryError::Parse("x".into()).exit_code(), 1);
    }
}
