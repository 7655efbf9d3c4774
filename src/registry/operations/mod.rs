//! Registry operations, one struct per API area
//!
//! - catalog: API version probe and paginated repository listing
//! - repository: tag listing and tag selection
//! - manifest: manifest fetch, persistence and parsing
//! - blob: verified blob downloads

pub mod blob_operations;
pub mod catalog_operations;
pub mod manifest_operations;
pub mod repository_operations;

pub use blob_operations::{BlobDownload, BlobOperations};
pub use catalog_operations::{ApiVersion, CatalogOperations};
pub use manifest_operations::ManifestOperations;
pub use repository_operations::RepositoryOperations;
