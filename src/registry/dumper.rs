//! Repository dumper: bounded fan-out over repositories
//!
//! Each repository runs its own pipeline (tag, manifest, config blob, layer blobs) in a
//! spawned task. A semaphore caps how many run at once. Failures stay inside their
//! repository and are collected into the [`DumpSummary`].

use crate::error::{RegistryError, Result};
use crate::image::{ArtifactKind, Descriptor};
use crate::logging::Logger;
use crate::output::{ArtifactLayout, sweep_partials};
use crate::registry::RegistrySession;
use crate::registry::operations::{
    BlobDownload, BlobOperations, CatalogOperations, ManifestOperations, RepositoryOperations,
};
use futures::future;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinError;

#[derive(Debug)]
pub struct BlobFailure {
    pub kind: ArtifactKind,
    pub digest: String,
    pub error: RegistryError,
}

/// Outcome of one repository whose manifest was fetched
#[derive(Debug)]
pub struct RepositoryReport {
    pub repository: String,
    pub tag: String,
    pub manifest_path: PathBuf,
    pub verified: Vec<BlobDownload>,
    pub failed: Vec<BlobFailure>,
}

impl RepositoryReport {
    /// Every referenced blob was downloaded and verified
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn bytes_downloaded(&self) -> u64 {
        self.verified.iter().map(|blob| blob.size).sum()
    }
}

#[derive(Debug, Default)]
pub struct DumpSummary {
    pub succeeded: Vec<RepositoryReport>,
    pub failed: Vec<(String, RegistryError)>,
}

impl DumpSummary {
    pub fn total(&self) -> usize {
        self.succeeded.len() + self.failed.len()
    }

    /// Repositories that finished with at least one failed blob
    pub fn incomplete(&self) -> usize {
        self.succeeded.iter().filter(|report| !report.is_complete()).count()
    }

    pub fn log(&self, output: &Logger) {
        let bytes: u64 = self.succeeded.iter().map(RepositoryReport::bytes_downloaded).sum();
        output.summary_kv(
            "Dump summary",
            &[
                ("Repositories", self.total().to_string()),
                ("Dumped", self.succeeded.len().to_string()),
                ("With failed blobs", self.incomplete().to_string()),
                ("Failed", self.failed.len().to_string()),
                ("Downloaded", output.format_size(bytes)),
            ],
        );
        for (repository, error) in &self.failed {
            output.error(&format!("{}: {}", repository, error));
        }
    }
}

/// Run `worker` over `items` in spawned tasks, at most `limit` at a time.
/// Results come back in input order; a panicking worker yields a `JoinError`.
pub(crate) async fn fan_out<T, R, F, Fut>(
    items: Vec<T>,
    limit: usize,
    worker: F,
) -> Vec<std::result::Result<R, JoinError>>
where
    T: Send + 'static,
    R: Send + 'static,
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = R> + Send + 'static,
{
    let semaphore = Arc::new(Semaphore::new(limit.max(1)));
    let worker = Arc::new(worker);

    let handles: Vec<_> = items
        .into_iter()
        .map(|item| {
            let semaphore = Arc::clone(&semaphore);
            let worker = Arc::clone(&worker);
            tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok();
                worker(item).await
            })
        })
        .collect();

    future::join_all(handles).await
}

#[derive(Clone)]
pub struct RepositoryDumper {
    session: RegistrySession,
    layout: ArtifactLayout,
    concurrency: usize,
    page_size: usize,
}

impl RepositoryDumper {
    pub fn new(session: RegistrySession, output_dir: impl Into<PathBuf>, concurrency: usize, page_size: usize) -> Self {
        Self {
            session,
            layout: ArtifactLayout::new(output_dir),
            concurrency: concurrency.max(1),
            page_size,
        }
    }

    pub fn layout(&self) -> &ArtifactLayout {
        &self.layout
    }

    /// Dump the first tag of one repository
    pub async fn dump_repository(&self, repository: &str) -> Result<RepositoryReport> {
        let output = self.session.output();
        output.subsection(&format!("Dumping {}", repository));

        let dir = self.layout.repository_dir(repository)?;
        let swept = sweep_partials(&dir).await?;
        if swept > 0 {
            output.detail(&format!("Removed {} stale partial file(s) from {}", swept, dir.display()));
        }

        let tag = RepositoryOperations::new(self.session.clone())
            .select_tag(repository)
            .await?;
        output.info(&format!("{}: using tag {}", repository, tag));

        let stored = ManifestOperations::new(self.session.clone())
            .fetch_and_store(repository, &tag, &self.layout)
            .await?;

        let mut report = RepositoryReport {
            repository: repository.to_string(),
            tag,
            manifest_path: stored.path,
            verified: Vec::new(),
            failed: Vec::new(),
        };

        let blobs = BlobOperations::new(self.session.clone());
        let manifest = stored.manifest;
        let targets = manifest
            .config_descriptor()
            .map(|config| (ArtifactKind::Config, config))
            .into_iter()
            .chain(manifest.layer_descriptors().map(|layer| (ArtifactKind::Layer, layer)));

        for (kind, descriptor) in targets {
            self.fetch_blob(&blobs, &mut report, kind, descriptor).await;
        }

        if report.is_complete() {
            output.success(&format!(
                "{}:{} dumped ({} blob(s), {})",
                report.repository,
                report.tag,
                report.verified.len(),
                output.format_size(report.bytes_downloaded())
            ));
        } else {
            output.warning(&format!(
                "{}:{} dumped with {} failed blob(s)",
                report.repository,
                report.tag,
                report.failed.len()
            ));
        }
        Ok(report)
    }

    async fn fetch_blob(
        &self,
        blobs: &BlobOperations,
        report: &mut RepositoryReport,
        kind: ArtifactKind,
        descriptor: &Descriptor,
    ) {
        let output = self.session.output();
        let result = match self.layout.blob_path(&report.repository, kind, descriptor) {
            Ok(path) => blobs.download(&report.repository, descriptor, &path).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(download) => {
                output.success(&format!(
                    "{} {} verified ({}) -> {}",
                    kind.label(),
                    crate::digest::DigestUtils::format_digest_short(&download.digest),
                    output.format_size(download.size),
                    download.path.display()
                ));
                report.verified.push(download);
            }
            Err(error) => {
                output.error(&format!(
                    "{}: {} {} failed: {}",
                    report.repository,
                    kind.label(),
                    descriptor.digest,
                    error
                ));
                report.failed.push(BlobFailure {
                    kind,
                    digest: descriptor.digest.clone(),
                    error,
                });
            }
        }
    }

    /// Dump the given repositories with bounded concurrency; never fails as a whole
    pub async fn dump_repositories(&self, repositories: Vec<String>) -> DumpSummary {
        let output = self.session.output().clone();
        output.info(&format!(
            "Dumping {} repositories with {} concurrent workers",
            repositories.len(),
            self.concurrency
        ));

        let names = repositories.clone();
        let dumper = self.clone();
        let results = fan_out(repositories, self.concurrency, move |repository: String| {
            let dumper = dumper.clone();
            async move { dumper.dump_repository(&repository).await }
        })
        .await;

        let mut summary = DumpSummary::default();
        for (repository, joined) in names.into_iter().zip(results) {
            match joined {
                Ok(Ok(report)) => summary.succeeded.push(report),
                Ok(Err(error)) => {
                    output.error(&format!("Error dumping {}: {}", repository, error));
                    summary.failed.push((repository, error));
                }
                Err(join_error) => {
                    let error = RegistryError::Config(format!("worker for {} aborted: {}", repository, join_error));
                    output.error(&error.to_string());
                    summary.failed.push((repository, error));
                }
            }
        }
        summary
    }

    /// List the catalog, then dump every repository in it.
    /// Only a failed catalog listing fails the whole call.
    pub async fn dump_all_repositories(&self) -> Result<DumpSummary> {
        let repositories = CatalogOperations::new(self.session.clone(), self.page_size)
            .list_repositories()
            .await?;
        Ok(self.dump_repositories(repositories).await)
    }
}
