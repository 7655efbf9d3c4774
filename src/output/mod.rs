//! On-disk layout of a dump and crash-safe artifact writing
//!
//! Every artifact is written to a hidden `.partial` temp file next to its final path and
//! renamed into place only once complete. A final path therefore either does not exist or
//! holds the full content. Leftover temp files from an interrupted run are swept before a
//! repository is dumped again.

use crate::error::{RegistryError, Result};
use crate::image::{ArtifactKind, Descriptor};
use std::path::{Component, Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;

pub const PARTIAL_SUFFIX: &str = ".partial";
pub const MANIFEST_FILE: &str = "manifest.json";

/// Maps repositories and blobs to paths under the output directory
#[derive(Debug, Clone)]
pub struct ArtifactLayout {
    root: PathBuf,
}

impl ArtifactLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `<root>/<repository>`, rejecting names that would escape the root
    pub fn repository_dir(&self, repository: &str) -> Result<PathBuf> {
        let relative = Path::new(repository);
        let safe = !repository.is_empty()
            && relative
                .components()
                .all(|component| matches!(component, Component::Normal(_)));
        if !safe {
            return Err(RegistryError::Parse(format!(
                "repository name '{}' is not a safe relative path",
                repository
            )));
        }
        Ok(self.root.join(relative))
    }

    pub fn manifest_path(&self, repository: &str) -> Result<PathBuf> {
        Ok(self.repository_dir(repository)?.join(MANIFEST_FILE))
    }

    /// Path for a config or layer blob. The digest must already be validated.
    pub fn blob_path(&self, repository: &str, kind: ArtifactKind, descriptor: &Descriptor) -> Result<PathBuf> {
        Ok(self.repository_dir(repository)?.join(kind.file_name(descriptor)))
    }
}

/// Temp file that is deleted on drop unless published
pub struct TempArtifact {
    temp_path: PathBuf,
    final_path: PathBuf,
    file: Option<fs::File>,
    published: bool,
}

impl TempArtifact {
    /// Create `.<name>.<uuid>.partial` beside `final_path`, creating parent directories
    pub async fn create(final_path: &Path) -> Result<Self> {
        let parent = final_path
            .parent()
            .filter(|parent| !parent.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let name = final_path
            .file_name()
            .ok_or_else(|| RegistryError::Config(format!("{} has no file name", final_path.display())))?;

        fs::create_dir_all(parent).await?;
        let temp_name = format!(
            ".{}.{}{}",
            name.to_string_lossy(),
            uuid::Uuid::new_v4().simple(),
            PARTIAL_SUFFIX
        );
        let temp_path = parent.join(temp_name);
        let file = fs::File::create(&temp_path).await?;

        Ok(Self {
            temp_path,
            final_path: final_path.to_path_buf(),
            file: Some(file),
            published: false,
        })
    }

    pub fn temp_path(&self) -> &Path {
        &self.temp_path
    }

    pub async fn write_all(&mut self, chunk: &[u8]) -> Result<()> {
        match self.file.as_mut() {
            Some(file) => Ok(file.write_all(chunk).await?),
            None => Err(RegistryError::Config(format!(
                "{} already closed",
                self.temp_path.display()
            ))),
        }
    }

    /// Flush, fsync and rename over the final path
    pub async fn publish(mut self) -> Result<PathBuf> {
        if let Some(mut file) = self.file.take() {
            file.flush().await?;
            file.sync_all().await?;
        }
        fs::rename(&self.temp_path, &self.final_path).await?;
        self.published = true;
        Ok(self.final_path.clone())
    }
}

impl Drop for TempArtifact {
    fn drop(&mut self) {
        if !self.published {
            self.file.take();
            let _ = std::fs::remove_file(&self.temp_path);
        }
    }
}

/// Write a complete in-memory artifact so readers never see a partial file
pub async fn write_atomic(final_path: &Path, bytes: &[u8]) -> Result<PathBuf> {
    let mut artifact = TempArtifact::create(final_path).await?;
    artifact.write_all(bytes).await?;
    artifact.publish().await
}

/// Remove `.partial` leftovers in `dir`. A missing directory counts as clean.
pub async fn sweep_partials(dir: &Path) -> Result<usize> {
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e.into()),
    };

    let mut removed = 0;
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.starts_with('.') && name.ends_with(PARTIAL_SUFFIX) && entry.file_type().await?.is_file() {
            fs::remove_file(entry.path()).await?;
            removed += 1;
        }
    }
    Ok(removed)
}
