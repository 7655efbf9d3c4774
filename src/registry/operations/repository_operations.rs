//! Repository operations for registry client
//!
//! Implements Docker Registry v2 repository-level operations:
//! - Tag listing (GET /v2/{name}/tags/list)
//! - Tag selection for a dump

use crate::error::{RegistryError, Result};
use crate::image::manifest::null_as_default;
use crate::registry::RegistrySession;
use serde::Deserialize;

#[derive(Debug, Deserialize)]
struct TagList {
    #[serde(default, deserialize_with = "null_as_default")]
    tags: Vec<String>,
}

#[derive(Clone)]
pub struct RepositoryOperations {
    session: RegistrySession,
}

impl RepositoryOperations {
    pub fn new(session: RegistrySession) -> Self {
        Self { session }
    }

    /// List all tags in repository, in the order the registry returns them
    pub async fn list_tags(&self, repository: &str) -> Result<Vec<String>> {
        let url = self.session.endpoint().tags_url(repository);
        self.session
            .output()
            .verbose(&format!("Listing tags for repository: {}", repository));

        let body = self.session.fetch(&url).await?.bytes().await?;
        let list: TagList = serde_json::from_slice(&body)
            .map_err(|e| RegistryError::Parse(format!("invalid tag list from {}: {}", url, e)))?;
        Ok(list.tags)
    }

    /// The first tag served; no sorting and no preference for `latest`
    pub async fn select_tag(&self, repository: &str) -> Result<String> {
        let tags = self.list_tags(repository).await?;
        self.session
            .output()
            .detail(&format!("{} has {} tag(s)", repository, tags.len()));

        tags.into_iter().next().ok_or_else(|| RegistryError::NotFound {
            what: format!("no tags found for repository {}", repository),
            hint: self.session.curl_hint(&self.session.endpoint().tags_url(repository)),
        })
    }
}
