use crate::digest::DigestUtils;
use crate::error::{RegistryError, Result};
use serde::{Deserialize, Deserializer, Serialize};

pub const DOCKER_MANIFEST_V2: &str = "application/vnd.docker.distribution.manifest.v2+json";
pub const DOCKER_CONFIG_V1: &str = "application/vnd.docker.container.image.v1+json";
pub const DOCKER_LAYER_GZIP: &str = "application/vnd.docker.image.rootfs.diff.tar.gzip";
pub const OCI_CONFIG_V1: &str = "application/vnd.oci.image.config.v1+json";
pub const OCI_LAYER_GZIP: &str = "application/vnd.oci.image.layer.v1.tar+gzip";

/// Accept `null` where a default value is expected
pub(crate) fn null_as_default<'de, D, T>(deserializer: D) -> std::result::Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Reference to a blob inside a manifest
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Descriptor {
    #[serde(rename = "mediaType", default, deserialize_with = "null_as_default")]
    pub media_type: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub digest: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub size: u64,
}

impl Descriptor {
    pub fn new(media_type: impl Into<String>, digest: impl Into<String>) -> Self {
        Self {
            media_type: media_type.into(),
            digest: digest.into(),
            size: 0,
        }
    }

    pub fn has_digest(&self) -> bool {
        !self.digest.is_empty()
    }
}

/// Image manifest, read permissively: absent or null fields fall back to defaults
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Manifest {
    #[serde(rename = "schemaVersion", default, deserialize_with = "null_as_default")]
    pub schema_version: u32,
    #[serde(rename = "mediaType", default, deserialize_with = "null_as_default")]
    pub media_type: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub config: Descriptor,
    #[serde(default, deserialize_with = "null_as_default")]
    pub layers: Vec<Descriptor>,
}

impl Manifest {
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| RegistryError::Parse(format!("invalid manifest: {}", e)))
    }

    /// Config descriptor, when the manifest names one
    pub fn config_descriptor(&self) -> Option<&Descriptor> {
        Some(&self.config).filter(|config| config.has_digest())
    }

    /// Layers that carry a digest, in manifest order
    pub fn layer_descriptors(&self) -> impl Iterator<Item = &Descriptor> {
        self.layers.iter().filter(|layer| layer.has_digest())
    }

    /// Layers skipped because their digest is empty
    pub fn skipped_layers(&self) -> usize {
        self.layers.iter().filter(|layer| !layer.has_digest()).count()
    }

    /// Number of blobs a dump of this manifest will fetch
    pub fn blob_count(&self) -> usize {
        usize::from(self.config_descriptor().is_some()) + self.layer_descriptors().count()
    }
}

/// Role of a blob within the image, which decides its on-disk name
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactKind {
    Config,
    Layer,
}

impl ArtifactKind {
    pub fn extension(&self, media_type: &str) -> &'static str {
        match (self, media_type) {
            (ArtifactKind::Config, DOCKER_CONFIG_V1 | OCI_CONFIG_V1) => ".json",
            (ArtifactKind::Layer, DOCKER_LAYER_GZIP | OCI_LAYER_GZIP) => ".tar.gz",
            _ => ".bin",
        }
    }

    /// `<kind>_sha256_<hex><ext>` for the blob's descriptor
    pub fn file_name(&self, descriptor: &Descriptor) -> String {
        format!(
            "{}_{}{}",
            self.prefix(),
            DigestUtils::to_file_component(&descriptor.digest),
            self.extension(&descriptor.media_type)
        )
    }

    fn prefix(&self) -> &'static str {
        match self {
            ArtifactKind::Config => "config",
            ArtifactKind::Layer => "layer",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            ArtifactKind::Config => "Config",
            ArtifactKind::Layer => "Layer",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_schema2_manifest() {
        let raw = br#"{
            "schemaVersion": 2,
            "mediaType": "application/vnd.docker.distribution.manifest.v2+json",
            "config": {"mediaType": "application/vnd.docker.container.image.v1+json", "size": 1470, "digest": "sha256:aaa"},
            "layers": [
                {"mediaType": "application/vnd.docker.image.rootfs.diff.tar.gzip", "size": 10, "digest": "sha256:bbb"},
                {"mediaType": "application/vnd.docker.image.rootfs.diff.tar.gzip", "digest": ""}
            ]
        }"#;
        let manifest = Manifest::parse(raw).unwrap();
        assert_eq!(manifest.schema_version, 2);
        assert_eq!(manifest.config_descriptor().unwrap().digest, "sha256:aaa");
        assert_eq!(manifest.layer_descriptors().count(), 1);
        assert_eq!(manifest.skipped_layers(), 1);
        assert_eq!(manifest.blob_count(), 2);
    }

    #[test]
    fn test_parse_tolerates_missing_and_null_fields() {
        let manifest = Manifest::parse(br#"{"config": null, "layers": null, "extra": [1]}"#).unwrap();
        assert!(manifest.config_descriptor().is_none());
        assert_eq!(manifest.blob_count(), 0);

        let manifest = Manifest::parse(b"{}").unwrap();
        assert!(manifest.layers.is_empty());
    }

    #[test]
    fn test_parse_rejects_non_json() {
        assert!(matches!(Manifest::parse(b"<html>"), Err(RegistryError::Parse(_))));
    }

    #[test]
    fn test_extension_rules() {
        assert_eq!(ArtifactKind::Config.extension(DOCKER_CONFIG_V1), ".json");
        assert_eq!(ArtifactKind::Config.extension(OCI_CONFIG_V1), ".json");
        assert_eq!(ArtifactKind::Config.extension("text/plain"), ".bin");
        assert_eq!(ArtifactKind::Layer.extension(DOCKER_LAYER_GZIP), ".tar.gz");
        assert_eq!(ArtifactKind::Layer.extension(OCI_LAYER_GZIP), ".tar.gz");
        assert_eq!(ArtifactKind::Layer.extension(DOCKER_CONFIG_V1), ".bin");
        assert_eq!(ArtifactKind::Layer.extension(""), ".bin");
    }

    #[test]
    fn test_file_name() {
        let layer = Descriptor::new(DOCKER_LAYER_GZIP, "sha256:abc");
        assert_eq!(ArtifactKind::Layer.file_name(&layer), "layer_sha256_abc.tar.gz");
        let config = Descriptor::new(OCI_CONFIG_V1, "sha256:def");
        assert_eq!(ArtifactKind::Config.file_name(&config), "config_sha256_def.json");
    }
}
