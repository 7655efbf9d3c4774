//! Configuration for a dump run: registry endpoint, credentials and tuning knobs

use crate::error::{RegistryError, Result};
use crate::proxy::ProxyConfig;
use http::{HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

pub const DEFAULT_PORT: u16 = 5000;
pub const DEFAULT_RATE_LIMIT: u32 = 3;
pub const DEFAULT_CONCURRENCY: usize = 5;
pub const DEFAULT_PAGE_SIZE: usize = 100;
pub const DEFAULT_OUTPUT_DIR: &str = "docker_dump";
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_USER_AGENT: &str = concat!("registry-dumper/", env!("CARGO_PKG_VERSION"));

/// Credentials and extra headers attached to every registry request
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthConfig {
    pub username: Option<String>,
    pub password: Option<String>,
    pub bearer: Option<String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

impl AuthConfig {
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn basic(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: Some(username.into()),
            password: Some(password.into()),
            ..Self::default()
        }
    }

    pub fn with_bearer(mut self, token: impl Into<String>) -> Self {
        self.bearer = Some(token.into());
        self
    }

    /// Add one custom header, validating that it can go on the wire
    pub fn with_header(mut self, name: &str, value: &str) -> Result<Self> {
        HeaderName::from_bytes(name.as_bytes())?;
        HeaderValue::from_str(value)?;
        self.headers.insert(name.to_string(), value.to_string());
        Ok(self)
    }

    /// Merge headers from a JSON object of string to string. An empty string adds nothing.
    pub fn with_headers_json(mut self, json: &str) -> Result<Self> {
        if json.trim().is_empty() {
            return Ok(self);
        }
        let parsed: BTreeMap<String, String> = serde_json::from_str(json)
            .map_err(|e| RegistryError::Config(format!("invalid custom headers JSON: {}", e)))?;
        for (name, value) in parsed {
            self = self.with_header(&name, &value)?;
        }
        Ok(self)
    }

    /// Username and password, when both are present and the username is non-empty
    pub fn basic_credentials(&self) -> Option<(&str, &str)> {
        match (self.username.as_deref(), self.password.as_deref()) {
            (Some(user), Some(pass)) if !user.is_empty() => Some((user, pass)),
            _ => None,
        }
    }

    pub fn bearer_token(&self) -> Option<&str> {
        self.bearer.as_deref().filter(|token| !token.is_empty())
    }

    pub fn is_anonymous(&self) -> bool {
        self.basic_credentials().is_none() && self.bearer_token().is_none() && self.headers.is_empty()
    }

    /// curl flags that reproduce these credentials, secrets elided
    pub fn curl_flags(&self) -> String {
        let mut flags = Vec::new();
        if let Some((user, _)) = self.basic_credentials() {
            flags.push(format!("-u '{}:<password>'", user));
        } else if self.bearer_token().is_some() {
            flags.push("-H 'Authorization: Bearer <token>'".to_string());
        }
        for name in self.headers.keys() {
            flags.push(format!("-H '{}: <value>'", name));
        }
        flags.join(" ")
    }
}

impl fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthConfig")
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("bearer", &self.bearer.as_ref().map(|_| "<redacted>"))
            .field("headers", &self.headers.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }
}

/// Registry location: scheme, host and port
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub scheme: Scheme,
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(scheme: Scheme, host: impl Into<String>, port: u16) -> Result<Self> {
        let host = host.into();
        if host.is_empty() {
            return Err(RegistryError::Config("registry host cannot be empty".to_string()));
        }
        if port == 0 {
            return Err(RegistryError::Config("registry port must be between 1 and 65535".to_string()));
        }
        Ok(Self { scheme, host, port })
    }

    /// Parse `scheme://host[:port]`. A port in the URL wins over `default_port`.
    pub fn parse(input: &str, default_port: u16) -> Result<Self> {
        let trimmed = input.trim().trim_end_matches('/');
        if !trimmed.contains("://") {
            return Err(RegistryError::Config(format!(
                "registry URL '{}' must include a scheme (http:// or https://)",
                input
            )));
        }

        let url = Url::parse(trimmed)
            .map_err(|e| RegistryError::Config(format!("invalid registry URL '{}': {}", input, e)))?;
        let scheme = match url.scheme() {
            "http" => Scheme::Http,
            "https" => Scheme::Https,
            other => {
                return Err(RegistryError::Config(format!(
                    "unsupported registry scheme '{}': use http or https",
                    other
                )));
            }
        };
        if !matches!(url.path(), "" | "/") || url.query().is_some() {
            return Err(RegistryError::Config(format!(
                "registry URL '{}' must not contain a path or query",
                input
            )));
        }

        let host = url
            .host_str()
            .ok_or_else(|| RegistryError::Config(format!("registry URL '{}' has no host", input)))?;
        // Url drops a port equal to the scheme default, so read it from the authority instead.
        let port = explicit_port(trimmed).unwrap_or(default_port);

        Self::new(scheme, host, port)
    }

    /// `host:port`
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Host without IPv6 brackets, as sent in a SOCKS5 CONNECT or a TLS SNI
    pub fn bare_host(&self) -> &str {
        self.host.trim_start_matches('[').trim_end_matches(']')
    }

    pub fn base_url(&self) -> String {
        format!("{}://{}", self.scheme.as_str(), self.authority())
    }

    pub fn version_url(&self) -> String {
        format!("{}/v2/", self.base_url())
    }

    pub fn catalog_url(&self, page_size: usize) -> String {
        format!("{}/v2/_catalog?n={}", self.base_url(), page_size)
    }

    pub fn tags_url(&self, repository: &str) -> String {
        format!("{}/v2/{}/tags/list", self.base_url(), repository)
    }

    pub fn manifest_url(&self, repository: &str, reference: &str) -> String {
        format!("{}/v2/{}/manifests/{}", self.base_url(), repository, reference)
    }

    pub fn blob_url(&self, repository: &str, digest: &str) -> String {
        format!("{}/v2/{}/blobs/{}", self.base_url(), repository, digest)
    }
}

fn explicit_port(input: &str) -> Option<u16> {
    let rest = input.split_once("://")?.1;
    let authority = rest.split(['/', '?', '#']).next()?;
    let host_port = authority.rsplit('@').next()?;
    if host_port.ends_with(']') {
        return None;
    }
    let (_, port) = host_port.rsplit_once(':')?;
    port.parse().ok()
}

/// Everything a dump run needs, assembled from the command line
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DumpConfig {
    pub endpoint: Endpoint,
    pub auth: AuthConfig,
    pub output_dir: PathBuf,
    pub rate_limit: u32,
    pub concurrency: usize,
    pub page_size: usize,
    pub timeout: Duration,
    pub connect_timeout: Duration,
    pub insecure: bool,
    pub proxy: Option<ProxyConfig>,
    pub user_agent: String,
}

impl DumpConfig {
    pub fn new(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            auth: AuthConfig::anonymous(),
            output_dir: PathBuf::from(DEFAULT_OUTPUT_DIR),
            rate_limit: DEFAULT_RATE_LIMIT,
            concurrency: DEFAULT_CONCURRENCY,
            page_size: DEFAULT_PAGE_SIZE,
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
            insecure: false,
            proxy: None,
            user_agent: DEFAULT_USER_AGENT.to_string(),
        }
    }

    pub fn with_auth(mut self, auth: AuthConfig) -> Self {
        self.auth = auth;
        self
    }

    pub fn with_output_dir(mut self, output_dir: impl Into<PathBuf>) -> Self {
        self.output_dir = output_dir.into();
        self
    }

    pub fn with_rate_limit(mut self, rate_limit: u32) -> Self {
        self.rate_limit = rate_limit;
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    pub fn with_insecure(mut self, insecure: bool) -> Self {
        self.insecure = insecure;
        self
    }

    pub fn with_proxy(mut self, proxy: Option<ProxyConfig>) -> Self {
        self.proxy = proxy;
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.rate_limit == 0 {
            return Err(RegistryError::Config("rate limit must be at least 1 request per second".to_string()));
        }
        if self.concurrency == 0 {
            return Err(RegistryError::Config("concurrency must be at least 1".to_string()));
        }
        if self.page_size == 0 {
            return Err(RegistryError::Config("page size must be at least 1".to_string()));
        }
        if self.timeout.is_zero() || self.connect_timeout.is_zero() {
            return Err(RegistryError::Config("timeouts must be greater than 0".to_string()));
        }
        if self.output_dir.as_os_str().is_empty() {
            return Err(RegistryError::Config("output directory cannot be empty".to_string()));
        }
        if self.user_agent.trim().is_empty() {
            return Err(RegistryError::Config("user agent cannot be empty".to_string()));
        }
        HeaderValue::from_str(&self.user_agent)?;
        Ok(())
    }
}
