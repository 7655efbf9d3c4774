//! Registry Dumper Library
//!
//! Enumerates a Docker Registry HTTP API v2 endpoint and dumps each repository's
//! manifest, config blob and layer blobs to disk, verifying every blob against its
//! SHA256 digest. Requests share one rate limiter and may travel through an HTTP(S)
//! proxy or a reused SOCKS5 tunnel.

pub mod cli;
pub mod config;
pub mod digest;
pub mod error;
pub mod image;
pub mod logging;
pub mod output;
pub mod proxy;
pub mod registry;

pub use config::{AuthConfig, DumpConfig, Endpoint};
pub use error::{RegistryError, Result};
pub use logging::Logger;
pub use registry::{DumpSummary, RegistrySession, RepositoryDumper, RepositoryReport, Transport};
