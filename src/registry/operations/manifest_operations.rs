//! Manifest operations for registry client
//!
//! Fetches a manifest (GET /v2/{name}/manifests/{reference}), stores the bytes exactly as
//! served, and parses them permissively.

use crate::error::{RegistryError, Result};
use crate::image::Manifest;
use crate::output::{ArtifactLayout, write_atomic};
use crate::registry::RegistrySession;
use std::path::PathBuf;

/// A fetched manifest and where it was written
#[derive(Debug, Clone)]
pub struct StoredManifest {
    pub manifest: Manifest,
    pub path: PathBuf,
    pub size: usize,
}

#[derive(Clone)]
pub struct ManifestOperations {
    session: RegistrySession,
}

impl ManifestOperations {
    pub fn new(session: RegistrySession) -> Self {
        Self { session }
    }

    /// Raw manifest bytes as served by the registry
    pub async fn fetch_manifest(&self, repository: &str, reference: &str) -> Result<bytes::Bytes> {
        let url = self.session.endpoint().manifest_url(repository, reference);
        self.session
            .output()
            .verbose(&format!("Fetching manifest {}:{}", repository, reference));
        self.session.fetch(&url).await?.bytes().await
    }

    /// Fetch, persist as `manifest.json`, then parse.
    /// The file is written before parsing, so an unparseable manifest is still kept.
    pub async fn fetch_and_store(
        &self,
        repository: &str,
        reference: &str,
        layout: &ArtifactLayout,
    ) -> Result<StoredManifest> {
        let bytes = self.fetch_manifest(repository, reference).await?;
        let path = write_atomic(&layout.manifest_path(repository)?, &bytes).await?;
        self.session
            .output()
            .success(&format!("Manifest saved to {}", path.display()));

        let manifest = Manifest::parse(&bytes).map_err(|e| match e {
            RegistryError::Parse(msg) => RegistryError::Parse(format!(
                "{} from {}",
                msg,
                self.session.endpoint().manifest_url(repository, reference)
            )),
            other => other,
        })?;

        if manifest.skipped_layers() > 0 {
            self.session.output().warning(&format!(
                "{}: skipping {} layer(s) with an empty digest",
                repository,
                manifest.skipped_layers()
            ));
        }
        if manifest.blob_count() == 0 {
            self.session.output().warning(&format!(
                "{}: manifest{} references no blobs",
                repository,
                if manifest.media_type.is_empty() {
                    String::new()
                } else {
                    format!(" ({})", manifest.media_type)
                }
            ));
        }

        Ok(StoredManifest {
            manifest,
            path,
            size: bytes.len(),
        })
    }
}
