//! Image metadata as served by the registry
//!
//! Only the fields needed to locate blobs are modeled; everything else in a manifest is
//! kept verbatim on disk and ignored here.

pub mod manifest;

pub use manifest::{ArtifactKind, Descriptor, Manifest};
