//! Registry module for Docker Registry HTTP API v2 interactions
//!
//! The [`Transport`] moves bytes; the operations under [`operations`] know the API
//! endpoints; the [`RepositoryDumper`] ties them together per repository.

pub mod dumper;
pub mod operations;
pub mod progress;
pub mod rate_limit;
pub mod retry;
pub mod transport;

use crate::config::{AuthConfig, Endpoint};
use crate::error::Result;
use crate::logging::Logger;
use std::sync::Arc;

pub use dumper::{DumpSummary, RepositoryDumper, RepositoryReport};
pub use operations::{ApiVersion, BlobOperations, CatalogOperations, ManifestOperations, RepositoryOperations};
pub use rate_limit::RateLimiter;
pub use retry::{Backoff, RetryPolicy};
pub use transport::{RegistryResponse, Transport};

/// Everything an operation needs to talk to one registry
#[derive(Clone)]
pub struct RegistrySession {
    transport: Arc<Transport>,
    endpoint: Endpoint,
    auth: Arc<AuthConfig>,
    output: Logger,
    curl_flags: String,
}

impl RegistrySession {
    pub fn new(transport: Arc<Transport>, endpoint: Endpoint, auth: AuthConfig, output: Logger) -> Self {
        let curl_flags = auth.curl_flags();
        Self {
            transport,
            endpoint,
            auth: Arc::new(auth),
            output,
            curl_flags,
        }
    }

    /// Extra curl flags for manual verification hints, e.g. proxy or `-k`
    pub fn with_curl_flags(mut self, flags: &str) -> Self {
        if !flags.is_empty() {
            if !self.curl_flags.is_empty() {
                self.curl_flags.push(' ');
            }
            self.curl_flags.push_str(flags);
        }
        self
    }

    pub fn transport(&self) -> &Arc<Transport> {
        &self.transport
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn auth(&self) -> &AuthConfig {
        &self.auth
    }

    pub fn output(&self) -> &Logger {
        &self.output
    }

    /// GET that must answer 200
    pub async fn fetch(&self, url: &str) -> Result<RegistryResponse> {
        self.transport.request(url, &self.auth).await
    }

    /// Command an operator can run to check `url` by hand
    pub fn curl_hint(&self, url: &str) -> String {
        if self.curl_flags.is_empty() {
            format!("curl -s '{}'", url)
        } else {
            format!("curl -s {} '{}'", self.curl_flags, url)
        }
    }
}
