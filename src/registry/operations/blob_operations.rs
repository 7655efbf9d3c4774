//! Blob operations for registry client
//!
//! Downloads blobs (GET /v2/{name}/blobs/{digest}) straight to disk. The body is hashed
//! while it streams into a temp file, and the file is renamed into place only when the
//! computed digest matches the one the manifest advertised.

use crate::digest::{self, DigestUtils, StreamingDigest};
use crate::error::Result;
use crate::image::Descriptor;
use crate::output::TempArtifact;
use crate::registry::RegistrySession;
use futures::StreamExt;
use std::path::{Path, PathBuf};

/// A verified blob on disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobDownload {
    pub digest: String,
    pub path: PathBuf,
    pub size: u64,
}

#[derive(Clone)]
pub struct BlobOperations {
    session: RegistrySession,
}

impl BlobOperations {
    pub fn new(session: RegistrySession) -> Self {
        Self { session }
    }

    /// Stream the blob to `destination`, verifying its digest before publishing
    pub async fn download(&self, repository: &str, descriptor: &Descriptor, destination: &Path) -> Result<BlobDownload> {
        let expected = descriptor.digest.as_str();
        DigestUtils::ensure_verifiable(expected)?;

        let url = self.session.endpoint().blob_url(repository, expected);
        let output = self.session.output();
        output.verbose(&format!(
            "Downloading blob {} from {}",
            DigestUtils::format_digest_short(expected),
            repository
        ));

        let response = self.session.fetch(&url).await?;
        let label = format!("{} {}", repository, DigestUtils::format_digest_short(expected));
        let mut body = response.into_progress_stream(label, output.clone());

        let mut artifact = TempArtifact::create(destination).await?;
        let mut hasher = StreamingDigest::new();
        while let Some(chunk) = body.next().await {
            let chunk = chunk?;
            hasher.update(&chunk);
            artifact.write_all(&chunk).await?;
        }

        let size = hasher.bytes_hashed();
        // On mismatch the artifact guard deletes the temp file.
        digest::verify(expected, &hasher.finalize())?;
        let path = artifact.publish().await?;

        Ok(BlobDownload {
            digest: expected.to_string(),
            path,
            size,
        })
    }
}
