//! Command-line argument parsing

use crate::config::{
    AuthConfig, DEFAULT_CONCURRENCY, DEFAULT_PAGE_SIZE, DEFAULT_PORT, DEFAULT_RATE_LIMIT, DumpConfig, Endpoint,
};
use crate::error::{RegistryError, Result};
use crate::proxy::ProxyConfig;
use clap::Parser;
use std::time::Duration;

#[derive(Parser, Debug, Clone)]
#[command(name = "registry-dumper")]
#[command(about = "Enumerate a Docker registry and dump manifests, configs and layers to disk")]
#[command(version, author)]
pub struct Args {
    /// Registry URL
    #[arg(long = "url", help = "Registry URL, e.g. https://registry.example.com")]
    pub url: String,

    #[arg(
        long = "port",
        default_value_t = DEFAULT_PORT,
        help = "Registry port, used when the URL has none"
    )]
    pub port: u16,

    #[arg(long = "username", short = 'u', help = "Username for basic authentication")]
    pub username: Option<String>,

    #[arg(long = "password", short = 'p', help = "Password for basic authentication")]
    pub password: Option<String>,

    #[arg(long = "bearer", help = "Bearer token, used when no username/password is given")]
    pub bearer: Option<String>,

    #[arg(
        long = "headers",
        help = "Extra request headers as a JSON object, e.g. '{\"X-Api-Key\":\"...\"}'"
    )]
    pub headers: Option<String>,

    #[arg(
        long = "rate",
        default_value_t = DEFAULT_RATE_LIMIT,
        help = "Maximum requests per second across all workers"
    )]
    pub rate: u32,

    #[arg(
        long = "concurrency",
        short = 'j',
        default_value_t = DEFAULT_CONCURRENCY,
        help = "Number of repositories dumped concurrently"
    )]
    pub concurrency: usize,

    #[arg(
        long = "page-size",
        default_value_t = DEFAULT_PAGE_SIZE,
        help = "Catalog page size"
    )]
    pub page_size: usize,

    #[arg(
        long = "dir",
        short = 'o',
        default_value = crate::config::DEFAULT_OUTPUT_DIR,
        help = "Output directory for dumped artifacts"
    )]
    pub dir: String,

    #[arg(
        long = "insecure",
        short = 'k',
        help = "Skip TLS certificate verification for the registry and the proxy"
    )]
    pub insecure: bool,

    #[arg(
        long = "proxy",
        help = "Proxy URL: http://, https://, socks5:// or socks5h://"
    )]
    pub proxy: Option<String>,

    #[arg(long = "proxy-username", help = "Proxy username")]
    pub proxy_username: Option<String>,

    #[arg(long = "proxy-password", help = "Proxy password")]
    pub proxy_password: Option<String>,

    #[arg(
        long = "timeout",
        short = 't',
        default_value_t = crate::config::DEFAULT_TIMEOUT_SECS,
        help = "Request timeout in seconds"
    )]
    pub timeout: u64,

    #[arg(
        long = "connect-timeout",
        default_value_t = crate::config::DEFAULT_CONNECT_TIMEOUT_SECS,
        help = "Connection timeout in seconds, also used when dialing the proxy"
    )]
    pub connect_timeout: u64,

    #[arg(long = "user-agent", help = "User-Agent header sent with every request")]
    pub user_agent: Option<String>,

    #[arg(long = "verbose", short = 'v', help = "Enable verbose output")]
    pub verbose: bool,

    #[arg(long = "quiet", short = 'q', conflicts_with = "verbose", help = "Only print errors")]
    pub quiet: bool,

    #[arg(long = "list", help = "List repositories in the catalog")]
    pub list: bool,

    #[arg(long = "dump", value_name = "REPOSITORY", help = "Dump a single repository")]
    pub dump: Option<String>,

    #[arg(long = "dump-all", help = "Dump every repository in the catalog")]
    pub dump_all: bool,
}

impl Args {
    /// Whether any of --list, --dump or --dump-all was given
    pub fn has_action(&self) -> bool {
        self.list || self.dump.is_some() || self.dump_all
    }

    pub fn validate(&self) -> Result<()> {
        match (&self.username, &self.password) {
            (Some(_), None) => Err(RegistryError::Config(
                "Password is required when username is provided".to_string(),
            )),
            (None, Some(_)) => Err(RegistryError::Config(
                "Username is required when password is provided".to_string(),
            )),
            _ => Ok(()),
        }?;

        if self.proxy.is_none() && (self.proxy_username.is_some() || self.proxy_password.is_some()) {
            return Err(RegistryError::Config(
                "--proxy-username/--proxy-password require --proxy".to_string(),
            ));
        }

        if let Some(repository) = &self.dump {
            if repository.trim().is_empty() {
                return Err(RegistryError::Config("--dump needs a repository name".to_string()));
            }
        }
        Ok(())
    }

    pub fn auth_config(&self) -> Result<AuthConfig> {
        let mut auth = match (&self.username, &self.password) {
            (Some(username), Some(password)) => AuthConfig::basic(username, password),
            _ => AuthConfig::anonymous(),
        };
        if let Some(token) = &self.bearer {
            auth = auth.with_bearer(token);
        }
        match &self.headers {
            Some(json) => auth.with_headers_json(json),
            None => Ok(auth),
        }
    }

    pub fn proxy_config(&self) -> Result<Option<ProxyConfig>> {
        self.proxy
            .as_deref()
            .map(|raw| ProxyConfig::parse(raw, self.proxy_username.clone(), self.proxy_password.clone()))
            .transpose()
    }

    /// Validated configuration for the run
    pub fn to_config(&self) -> Result<DumpConfig> {
        self.validate()?;
        let endpoint = Endpoint::parse(&self.url, self.port)?;

        let mut config = DumpConfig::new(endpoint)
            .with_auth(self.auth_config()?)
            .with_output_dir(&self.dir)
            .with_rate_limit(self.rate)
            .with_concurrency(self.concurrency)
            .with_page_size(self.page_size)
            .with_timeout(Duration::from_secs(self.timeout))
            .with_connect_timeout(Duration::from_secs(self.connect_timeout))
            .with_insecure(self.insecure)
            .with_proxy(self.proxy_config()?);
        if let Some(user_agent) = &self.user_agent {
            config = config.with_user_agent(user_agent);
        }

        config.validate()?;
        Ok(config)
    }
}
