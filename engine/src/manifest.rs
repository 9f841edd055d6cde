//! Manifest and manifest-index models.
//!
//! Covers both the OCI and Docker schema-2 media types. An index is resolved
//! to a single platform's manifest digest before any blob work starts.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use regmirror_core::config::Platform;
use regmirror_core::error::{MirrorError, Result};

pub const OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
pub const OCI_INDEX: &str = "application/vnd.oci.image.index.v1+json";
pub const DOCKER_MANIFEST: &str = "application/vnd.docker.distribution.manifest.v2+json";
pub const DOCKER_MANIFEST_LIST: &str =
    "application/vnd.docker.distribution.manifest.list.v2+json";

/// Accept header value for manifest requests.
pub const MANIFEST_ACCEPT: &str = "application/vnd.oci.image.manifest.v1+json, \
     application/vnd.oci.image.index.v1+json, \
     application/vnd.docker.distribution.manifest.v2+json, \
     application/vnd.docker.distribution.manifest.list.v2+json";

/// Reference to a blob (config or layer) by digest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Descriptor {
    #[serde(rename = "mediaType")]
    pub media_type: String,
    pub digest: String,
    pub size: u64,
}

/// Single-platform image manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageManifest {
    #[serde(rename = "schemaVersion")]
    pub schema_version: u32,
    #[serde(rename = "mediaType", default)]
    pub media_type: Option<String>,
    pub config: Descriptor,
    pub layers: Vec<Descriptor>,
}

impl ImageManifest {
    /// Config blob first, then layers in manifest order.
    pub fn blobs(&self) -> impl Iterator<Item = &Descriptor> {
        std::iter::once(&self.config).chain(self.layers.iter())
    }
}

/// Platform fields of an index entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlatformSpec {
    pub architecture: String,
    pub os: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
}

/// One manifest entry inside an index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexEntry {
    #[serde(rename = "mediaType")]
    pub media_type: String,
    pub digest: String,
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<PlatformSpec>,
}

/// Multi-platform manifest index (manifest list).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageIndex {
    #[serde(rename = "schemaVersion")]
    pub schema_version: u32,
    #[serde(rename = "mediaType", default)]
    pub media_type: Option<String>,
    pub manifests: Vec<IndexEntry>,
}

impl ImageIndex {
    /// Digest of the entry matching {os, architecture} exactly.
    ///
    /// No fallback: a missing platform fails the image, never silently
    /// defaults to another entry.
    pub fn select_platform(&self, reference: &str, platform: &Platform) -> Result<String> {
        self.manifests
            .iter()
            .find(|entry| {
                entry
                    .platform
                    .as_ref()
                    .is_some_and(|p| platform.matches(&p.os, &p.architecture))
            })
            .map(|entry| entry.digest.clone())
            .ok_or_else(|| MirrorError::PlatformNotFound {
                reference: reference.to_string(),
                platform: platform.to_string(),
            })
    }
}

/// Manifest payload classified by schema.
#[derive(Debug, Clone)]
pub enum ManifestKind {
    Index(ImageIndex),
    Manifest(ImageManifest),
}

/// Classify raw manifest bytes.
///
/// The declared media type wins when present; otherwise the document shape
/// decides ("manifests" array → index, "config" + "layers" → manifest).
pub fn parse_manifest(bytes: &[u8], content_type: Option<&str>) -> Result<ManifestKind> {
    match content_type {
        Some(OCI_INDEX) | Some(DOCKER_MANIFEST_LIST) => {
            let index: ImageIndex = serde_json::from_slice(bytes)?;
            return Ok(ManifestKind::Index(index));
        }
        Some(OCI_MANIFEST) | Some(DOCKER_MANIFEST) => {
            let manifest: ImageManifest = serde_json::from_slice(bytes)?;
            return Ok(ManifestKind::Manifest(manifest));
        }
        Some(other) if !other.starts_with("application/json") => {
            return Err(MirrorError::UnsupportedMediaType(other.to_string()));
        }
        _ => {}
    }

    let value: serde_json::Value = serde_json::from_slice(bytes)?;
    if value.get("manifests").is_some() {
        Ok(ManifestKind::Index(serde_json::from_value(value)?))
    } else if value.get("config").is_some() && value.get("layers").is_some() {
        Ok(ManifestKind::Manifest(serde_json::from_value(value)?))
    } else {
        Err(MirrorError::UnsupportedMediaType(
            value
                .get("mediaType")
                .and_then(|m| m.as_str())
                .unwrap_or("unknown manifest schema")
                .to_string(),
        ))
    }
}

/// A manifest as fetched: raw bytes (digest identity) plus the parsed form.
#[derive(Debug, Clone)]
pub struct FetchedManifest {
    /// Digest of `bytes`.
    pub digest: String,
    pub media_type: String,
    pub bytes: Vec<u8>,
    pub manifest: ImageManifest,
}

impl FetchedManifest {
    pub fn new(bytes: Vec<u8>, media_type: String, manifest: ImageManifest) -> Self {
        let digest = sha256_digest(&bytes);
        Self {
            digest,
            media_type,
            bytes,
            manifest,
        }
    }
}

/// `sha256:<hex>` of a byte slice.
pub fn sha256_digest(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("sha256:{}", hex::encode(hasher.finalize()))
}

/// Hex part of a `sha256:<hex>` digest.
pub fn digest_hex(digest: &str) -> Result<&str> {
    match digest.split_once(':') {
        Some(("sha256", hex)) if hex.len() == 64 && hex.chars().all(|c| c.is_ascii_hexdigit()) => {
            Ok(hex)
        }
        _ => Err(MirrorError::Store(format!(
            "invalid digest '{}'",
            digest
        ))),
    }
}
