//! Catalog operations for registry client
//!
//! Implements Docker Registry v2 registry-level operations:
//! - API version check (GET /v2/)
//! - Repository listing (GET /v2/_catalog) with `Link` header pagination

use crate::error::{RegistryError, Result};
use crate::image::manifest::null_as_default;
use crate::registry::RegistrySession;
use http::header::LINK;
use serde::Deserialize;
use std::collections::HashSet;
use url::Url;

pub const API_VERSION_HEADER: &str = "Docker-Distribution-API-Version";
pub const DEFAULT_API_VERSION: &str = "registry/2.0";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiVersion {
    pub version: String,
    /// The probe was answered with 401
    pub auth_required: bool,
}

#[derive(Debug, Deserialize)]
struct CatalogPage {
    #[serde(default, deserialize_with = "null_as_default")]
    repositories: Vec<String>,
}

#[derive(Clone)]
pub struct CatalogOperations {
    session: RegistrySession,
    page_size: usize,
}

impl CatalogOperations {
    pub fn new(session: RegistrySession, page_size: usize) -> Self {
        Self {
            session,
            page_size: page_size.max(1),
        }
    }

    /// Probe `/v2/`; 200 and 401 both prove a v2 registry is answering
    pub async fn check_api_version(&self) -> Result<ApiVersion> {
        let url = self.session.endpoint().version_url();
        let response = self
            .session
            .transport()
            .send(&url, self.session.auth())
            .await
            .map_err(|e| match e {
                RegistryError::Transient(msg) => RegistryError::Connectivity(msg),
                other => other,
            })?;

        let status = response.status();
        if status != 200 && status != 401 {
            return Err(RegistryError::Connectivity(format!(
                "unable to determine registry API version at {} (status {})",
                url, status
            )));
        }

        let version = response
            .header(API_VERSION_HEADER)
            .filter(|value| !value.is_empty())
            .unwrap_or(DEFAULT_API_VERSION)
            .to_string();
        self.session
            .output()
            .verbose(&format!("Registry at {} reports API version {}", url, version));

        Ok(ApiVersion {
            version,
            auth_required: status == 401,
        })
    }

    /// Every repository in the catalog, across all pages, in the order served
    pub async fn list_repositories(&self) -> Result<Vec<String>> {
        let first_page = self.session.endpoint().catalog_url(self.page_size);
        let mut url = first_page.clone();
        let mut visited = HashSet::new();
        let mut repositories = Vec::new();

        loop {
            visited.insert(url.clone());
            let response = self.session.fetch(&url).await?;
            let next = match response.header(LINK.as_str()) {
                Some(link) => next_page_url(&url, link)?,
                None => None,
            };

            let body = response.bytes().await?;
            let page: CatalogPage = serde_json::from_slice(&body)
                .map_err(|e| RegistryError::Parse(format!("invalid catalog page from {}: {}", url, e)))?;
            self.session.output().detail(&format!(
                "Catalog page {} returned {} repositories",
                visited.len(),
                page.repositories.len()
            ));
            repositories.extend(page.repositories);

            match next {
                Some(next) if !visited.contains(&next) => url = next,
                _ => break,
            }
        }

        if repositories.is_empty() {
            return Err(RegistryError::NotFound {
                what: "no repositories found in catalog".to_string(),
                hint: self.session.curl_hint(&first_page),
            });
        }
        Ok(repositories)
    }
}

/// Target of the `rel="next"` entry in an RFC 5988 `Link` header, if any
pub fn parse_next_link(header: &str) -> Option<&str> {
    header.split(',').find_map(|entry| {
        let (target, params) = entry.trim().split_once(';')?;
        let target = target.trim().strip_prefix('<')?.strip_suffix('>')?;
        let is_next = params.split(';').any(|param| {
            let Some((key, value)) = param.trim().split_once('=') else {
                return false;
            };
            key.trim().eq_ignore_ascii_case("rel")
                && value
                    .trim()
                    .trim_matches('"')
                    .split_whitespace()
                    .any(|rel| rel.eq_ignore_ascii_case("next"))
        });
        is_next.then_some(target)
    })
}

/// Resolve the next-page link against the page that carried it
pub fn next_page_url(current: &str, link_header: &str) -> Result<Option<String>> {
    let Some(target) = parse_next_link(link_header) else {
        return Ok(None);
    };
    let base = Url::parse(current)?;
    let next = base
        .join(target)
        .map_err(|e| RegistryError::Parse(format!("invalid Link target '{}': {}", target, e)))?;
    Ok(Some(next.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_next_link() {
        assert_eq!(
            parse_next_link(r#"</v2/_catalog?last=b&n=2>; rel="next""#),
            Some("/v2/_catalog?last=b&n=2")
        );
        assert_eq!(
            parse_next_link(r#"<http://a/prev>; rel="prev", <http://a/next>; rel=next"#),
            Some("http://a/next")
        );
        assert_eq!(parse_next_link(r#"</v2/_catalog?last=b>; rel="last""#), None);
        assert_eq!(parse_next_link("garbage"), None);
    }

    #[test]
    fn test_next_page_url_resolves_relative_and_absolute() {
        let current = "http://registry.local:5000/v2/_catalog?n=2";
        assert_eq!(
            next_page_url(current, r#"</v2/_catalog?last=b&n=2>; rel="next""#).unwrap(),
            Some("http://registry.local:5000/v2/_catalog?last=b&n=2".to_string())
        );
        assert_eq!(
            next_page_url(current, r#"<http://mirror:5000/v2/_catalog?last=b>; rel="next""#).unwrap(),
            Some("http://mirror:5000/v2/_catalog?last=b".to_string())
        );
        assert_eq!(next_page_url(current, r#"<x>; rel="prev""#).unwrap(), None);
    }
}
