//! Classification of low-level network failures into [`RegistryError`] variants

use crate::error::RegistryError;
use std::error::Error as StdError;
use std::io;

/// Message fragments that identify a connection the peer (or a proxy) dropped
const CLOSED_CONNECTION_MARKERS: &[&str] = &[
    "connection closed",
    "connection reset",
    "broken pipe",
    "unexpected eof",
    "incomplete message",
    "use of closed network connection",
];

/// Network error categorization and handling
pub struct NetworkErrorHandler;

impl NetworkErrorHandler {
    /// Categorize a reqwest failure for the request to `url`
    pub fn handle_network_error(error: &reqwest::Error, url: &str) -> RegistryError {
        if error.is_timeout() {
            RegistryError::Transient(format!("request to {} timed out: {}", url, error))
        } else if Self::is_connection_closed(error) {
            RegistryError::Transient(format!("connection closed during request to {}: {}", url, error))
        } else if error.is_connect() {
            RegistryError::Connectivity(format!("failed to connect for {}: {}", url, Self::chain(error)))
        } else if error.is_decode() || error.is_body() {
            RegistryError::Transient(format!("failed reading body from {}: {}", url, error))
        } else {
            RegistryError::Connectivity(format!("request to {} failed: {}", url, Self::chain(error)))
        }
    }

    /// Categorize a hyper failure on a tunneled connection
    pub fn handle_hyper_error(error: &hyper::Error, url: &str) -> RegistryError {
        if error.is_timeout() || Self::is_connection_closed(error) {
            RegistryError::Transient(format!("tunneled request to {} failed: {}", url, error))
        } else {
            RegistryError::Connectivity(format!("tunneled request to {} failed: {}", url, Self::chain(error)))
        }
    }

    /// Categorize an I/O failure while talking to `peer`
    pub fn handle_io_error(error: &io::Error, peer: &str) -> RegistryError {
        match error.kind() {
            io::ErrorKind::TimedOut => RegistryError::Transient(format!("timed out talking to {}", peer)),
            _ if Self::is_closed_io_kind(error.kind()) => {
                RegistryError::Transient(format!("connection to {} closed: {}", peer, error))
            }
            _ => RegistryError::Connectivity(format!("I/O error talking to {}: {}", peer, error)),
        }
    }

    /// Walk the source chain looking for a dropped or reset connection
    pub fn is_connection_closed(error: &(dyn StdError + 'static)) -> bool {
        let mut current: Option<&(dyn StdError + 'static)> = Some(error);
        while let Some(err) = current {
            if let Some(io_err) = err.downcast_ref::<io::Error>() {
                if Self::is_closed_io_kind(io_err.kind()) {
                    return true;
                }
            }
            if let Some(hyper_err) = err.downcast_ref::<hyper::Error>() {
                if hyper_err.is_closed() || hyper_err.is_incomplete_message() || hyper_err.is_canceled() {
                    return true;
                }
            }
            let message = err.to_string().to_lowercase();
            if CLOSED_CONNECTION_MARKERS.iter().any(|marker| message.contains(marker)) {
                return true;
            }
            current = err.source();
        }
        false
    }

    fn is_closed_io_kind(kind: io::ErrorKind) -> bool {
        matches!(
            kind,
            io::ErrorKind::ConnectionReset
                | io::ErrorKind::ConnectionAborted
                | io::ErrorKind::BrokenPipe
                | io::ErrorKind::UnexpectedEof
                | io::ErrorKind::NotConnected
        )
    }

    /// Render an error together with its sources, "outer: inner: root"
    fn chain(error: &(dyn StdError + 'static)) -> String {
        let mut rendered = error.to_string();
        let mut current = error.source();
        while let Some(err) = current {
            let text = err.to_string();
            if !rendered.contains(&text) {
                rendered.push_str(": ");
                rendered.push_str(&text);
            }
            current = err.source();
        }
        rendered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fmt;

    #[derive(Debug)]
    struct Wrapper(io::Error);

    impl fmt::Display for Wrapper {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "error sending request")
        }
    }

    impl StdError for Wrapper {
        fn source(&self) -> Option<&(dyn StdError + 'static)> {
            Some(&self.0)
        }
    }

    #[test]
    fn test_closed_connection_found_in_source_chain() {
        let err = Wrapper(io::Error::new(io::ErrorKind::ConnectionReset, "peer reset"));
        assert!(NetworkErrorHandler::is_connection_closed(&err));
    }

    #[test]
    fn test_closed_connection_found_by_message() {
        let err = io::Error::other("read: use of closed network connection");
        assert!(NetworkErrorHandler::is_connection_closed(&err));
    }

    #[test]
    fn test_refused_connection_is_not_transient() {
        let err = io::Error::new(io::ErrorKind::ConnectionRefused, "refused");
        assert!(!NetworkErrorHandler::is_connection_closed(&err));
        let classified = NetworkErrorHandler::handle_io_error(&err, "proxy:1080");
        assert!(matches!(classified, RegistryError::Connectivity(_)));
    }

    #[test]
    fn test_io_timeout_is_transient() {
        let err = io::Error::new(io::ErrorKind::TimedOut, "deadline");
        assert!(NetworkErrorHandler::handle_io_error(&err, "proxy:1080").is_transient());
    }
}
