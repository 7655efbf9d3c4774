//! Outbound proxy support
//!
//! HTTP and HTTPS proxies are handed to reqwest. SOCKS5 proxies get a dedicated
//! tunnel: a single long-lived connection negotiated by [`socks5`] and shared by
//! every request through [`tunnel::TunnelSlot`].

pub mod socks5;
pub mod tunnel;

use crate::error::{RegistryError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use url::Url;

pub const DEFAULT_SOCKS5_PORT: u16 = 1080;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyKind {
    Http,
    Https,
    Socks5,
}

/// Parsed `--proxy` setting plus its credentials
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyConfig {
    pub kind: ProxyKind,
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl ProxyConfig {
    /// Parse a proxy URL. Explicit credentials win over userinfo embedded in the URL.
    pub fn parse(raw: &str, username: Option<String>, password: Option<String>) -> Result<Self> {
        let url = Url::parse(raw.trim())
            .map_err(|e| RegistryError::Config(format!("invalid proxy URL '{}': {}", raw, e)))?;

        let kind = match url.scheme() {
            "http" => ProxyKind::Http,
            "https" => ProxyKind::Https,
            "socks5" | "socks5h" => ProxyKind::Socks5,
            other => {
                return Err(RegistryError::Config(format!(
                    "unsupported proxy scheme '{}': use http, https, socks5 or socks5h",
                    other
                )));
            }
        };

        let host = url
            .host_str()
            .filter(|host| !host.is_empty())
            .ok_or_else(|| RegistryError::Config(format!("proxy URL '{}' has no host", raw)))?
            .to_string();

        let port = match (url.port_or_known_default(), kind) {
            (Some(port), _) => port,
            (None, ProxyKind::Socks5) => DEFAULT_SOCKS5_PORT,
            (None, _) => {
                return Err(RegistryError::Config(format!("proxy URL '{}' has no port", raw)));
            }
        };
        if port == 0 {
            return Err(RegistryError::Config(format!("proxy URL '{}' has port 0", raw)));
        }

        let url_username = Some(url.username().to_string()).filter(|u| !u.is_empty());
        let url_password = url.password().map(str::to_string);

        Ok(Self {
            kind,
            host,
            port,
            username: username.or(url_username),
            password: password.or(url_password),
        })
    }

    /// `host:port` as dialed, with IPv6 literals bracketed
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Credentials usable for authentication, only when both halves are present
    pub fn credentials(&self) -> Option<(&str, &str)> {
        match (self.username.as_deref(), self.password.as_deref()) {
            (Some(user), Some(pass)) if !user.is_empty() => Some((user, pass)),
            _ => None,
        }
    }

    fn scheme(&self) -> &'static str {
        match self.kind {
            ProxyKind::Http => "http",
            ProxyKind::Https => "https",
            ProxyKind::Socks5 => "socks5h",
        }
    }

    /// Proxy URL without credentials
    pub fn display_url(&self) -> String {
        format!("{}://{}", self.scheme(), self.address())
    }

    /// reqwest proxy for the HTTP and HTTPS kinds
    pub fn reqwest_proxy(&self) -> Result<reqwest::Proxy> {
        if self.kind == ProxyKind::Socks5 {
            return Err(RegistryError::Config(
                "SOCKS5 proxies are served by the tunnel backend".to_string(),
            ));
        }
        let proxy = reqwest::Proxy::all(self.display_url())
            .map_err(|e| RegistryError::Config(format!("invalid proxy {}: {}", self.display_url(), e)))?;
        Ok(match self.credentials() {
            Some((user, pass)) => proxy.basic_auth(user, pass),
            None => proxy,
        })
    }

    /// curl flags that reproduce this proxy setting, password elided
    pub fn curl_flags(&self) -> String {
        let mut flags = format!("--proxy {}", self.display_url());
        if let Some((user, _)) = self.credentials() {
            flags.push_str(&format!(" --proxy-user '{}:<password>'", user));
        }
        flags
    }
}

impl fmt::Debug for ProxyConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyConfig")
            .field("kind", &self.kind)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}
