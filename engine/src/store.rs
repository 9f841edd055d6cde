//! Local content-addressed registry store.
//!
//! Writes the stock docker-distribution storage tree so the data dir can be
//! served directly by a standard registry server:
//!
//! ```text
//! <root>/docker/registry/v2/
//! ├── blobs/sha256/<xx>/<hex>/data
//! └── repositories/<repo>/
//!     ├── _layers/sha256/<hex>/link
//!     └── _manifests/
//!         ├── revisions/sha256/<hex>/link
//!         └── tags/<tag>/
//!             ├── current/link
//!             └── index/sha256/<hex>/link
//! ```
//!
//! Blobs are staged under `tmp/` and renamed into place only after the
//! content hashed to its declared digest, so a half-written blob is never
//! observable. A per-digest in-flight guard keeps two workers pulling a
//! shared base layer from double-fetching or clobbering each other.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tokio::sync::Notify;

use regmirror_core::error::{MirrorError, Result};

use crate::manifest::{digest_hex, FetchedManifest};
use crate::reference::ImageReference;

/// Content-addressed registry store rooted at a data directory.
#[derive(Debug)]
pub struct RegistryStore {
    v2: PathBuf,
    in_flight: DashMap<String, Arc<Notify>>,
}

impl RegistryStore {
    /// Open a store at `root`, which must already exist and be writable.
    pub fn open(root: &Path) -> Result<Self> {
        if !root.is_dir() {
            return Err(MirrorError::Config(format!(
                "registry data dir {} does not exist",
                root.display()
            )));
        }

        let v2 = root.join("docker").join("registry").join("v2");
        for dir in ["blobs/sha256", "repositories", "tmp"] {
            std::fs::create_dir_all(v2.join(dir)).map_err(|e| {
                MirrorError::Config(format!(
                    "registry data dir {} is not writable: {}",
                    root.display(),
                    e
                ))
            })?;
        }

        Ok(Self {
            v2,
            in_flight: DashMap::new(),
        })
    }

    fn blob_dir(&self, hex: &str) -> PathBuf {
        self.v2
            .join("blobs")
            .join("sha256")
            .join(&hex[..2])
            .join(hex)
    }

    /// Final on-disk path of a blob's content.
    pub fn blob_path(&self, digest: &str) -> Result<PathBuf> {
        Ok(self.blob_dir(digest_hex(digest)?).join("data"))
    }

    /// True when the blob is fully committed to the store.
    pub fn has_blob(&self, digest: &str) -> bool {
        digest_hex(digest)
            .map(|hex| self.blob_dir(hex).join("data").is_file())
            .unwrap_or(false)
    }

    /// Claim the right to write a blob.
    ///
    /// Returns `None` when the blob is already present (including when another
    /// worker finished it while we waited on the in-flight guard). At most one
    /// live writer exists per digest.
    pub async fn begin_blob(&self, digest: &str) -> Result<Option<BlobWriter<'_>>> {
        let hex = digest_hex(digest)?.to_string();
        loop {
            if self.has_blob(digest) {
                return Ok(None);
            }
            match self.in_flight.entry(digest.to_string()) {
                Entry::Vacant(slot) => {
                    let notify = Arc::new(Notify::new());
                    slot.insert(notify);
                    return Ok(Some(BlobWriter::create(self, digest, &hex).await?));
                }
                Entry::Occupied(slot) => {
                    let notify = slot.get().clone();
                    drop(slot);
                    let notified = notify.notified();
                    tokio::pin!(notified);
                    notified.as_mut().enable();
                    // The writer may have finished between lookup and enable
                    if !self.in_flight.contains_key(digest) {
                        continue;
                    }
                    notified.await;
                }
            }
        }
    }

    fn release(&self, digest: &str) {
        if let Some((_, notify)) = self.in_flight.remove(digest) {
            notify.notify_waiters();
        }
    }

    /// Record a repository-local link to a blob.
    pub async fn link_layer(&self, repository: &str, digest: &str) -> Result<()> {
        let hex = digest_hex(digest)?;
        let link = self
            .repository_dir(repository)
            .join("_layers")
            .join("sha256")
            .join(hex)
            .join("link");
        self.write_link(&link, digest).await
    }

    /// Persist a manifest: its bytes as a blob, a revision link, and the tag
    /// links that make the reference resolvable by name.
    ///
    /// Returns true when the manifest blob was newly written.
    pub async fn write_manifest(
        &self,
        reference: &ImageReference,
        manifest: &FetchedManifest,
    ) -> Result<bool> {
        let hex = digest_hex(&manifest.digest)?.to_string();
        let newly_written = if self.has_blob(&manifest.digest) {
            false
        } else if let Some(mut writer) = self.begin_blob(&manifest.digest).await? {
            writer.write_chunk(&manifest.bytes).await?;
            writer.commit().await?;
            true
        } else {
            false
        };

        let manifests_dir = self.repository_dir(&reference.repository).join("_manifests");

        let revision = manifests_dir
            .join("revisions")
            .join("sha256")
            .join(&hex)
            .join("link");
        self.write_link(&revision, &manifest.digest).await?;

        let tag_dir = manifests_dir.join("tags").join(reference.tag_or_default());
        self.write_link(&tag_dir.join("current").join("link"), &manifest.digest)
            .await?;
        self.write_link(
            &tag_dir.join("index").join("sha256").join(&hex).join("link"),
            &manifest.digest,
        )
        .await?;

        tracing::debug!(
            reference = %reference,
            digest = %manifest.digest,
            "Manifest persisted"
        );
        Ok(newly_written)
    }

    /// All committed blob digests, for inspection and tests.
    pub fn blob_digests(&self) -> Vec<String> {
        let mut digests = Vec::new();
        let shards = self.v2.join("blobs").join("sha256");
        let Ok(entries) = std::fs::read_dir(&shards) else {
            return digests;
        };
        for shard in entries.flatten() {
            let Ok(blobs) = std::fs::read_dir(shard.path()) else {
                continue;
            };
            for blob in blobs.flatten() {
                if blob.path().join("data").is_file() {
                    if let Some(hex) = blob.file_name().to_str() {
                        digests.push(format!("sha256:{}", hex));
                    }
                }
            }
        }
        digests.sort();
        digests
    }

    fn repository_dir(&self, repository: &str) -> PathBuf {
        self.v2.join("repositories").join(repository)
    }

    fn tmp_path(&self, hex: &str) -> PathBuf {
        self.v2.join("tmp").join(format!("{}.partial", hex))
    }

    /// Write a small link file atomically (stage then rename).
    async fn write_link(&self, path: &Path, digest: &str) -> Result<()> {
        let parent = path
            .parent()
            .ok_or_else(|| MirrorError::Store(format!("link path {} has no parent", path.display())))?;
        tokio::fs::create_dir_all(parent).await?;
        let staged = path.with_extension("tmp");
        tokio::fs::write(&staged, digest.as_bytes()).await?;
        tokio::fs::rename(&staged, path).await?;
        Ok(())
    }
}

/// In-progress blob write: hashes what it receives and only becomes visible
/// in the store after `commit` verified the digest.
pub struct BlobWriter<'s> {
    store: &'s RegistryStore,
    digest: String,
    hex: String,
    tmp_path: PathBuf,
    file: Option<tokio::fs::File>,
    hasher: Sha256,
    written: u64,
    committed: bool,
}

impl<'s> BlobWriter<'s> {
    async fn create(store: &'s RegistryStore, digest: &str, hex: &str) -> Result<BlobWriter<'s>> {
        let tmp_path = store.tmp_path(hex);
        let file = tokio::fs::File::create(&tmp_path).await.map_err(|e| {
            // claimed the guard but could not stage; release before failing
            store.release(digest);
            MirrorError::Store(format!(
                "failed to stage blob at {}: {}",
                tmp_path.display(),
                e
            ))
        })?;
        Ok(BlobWriter {
            store,
            digest: digest.to_string(),
            hex: hex.to_string(),
            tmp_path,
            file: Some(file),
            hasher: Sha256::new(),
            written: 0,
            committed: false,
        })
    }

    /// Append one chunk, updating the running digest.
    pub async fn write_chunk(&mut self, chunk: &[u8]) -> Result<()> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| MirrorError::Store("blob writer already finished".to_string()))?;
        self.hasher.update(chunk);
        file.write_all(chunk).await?;
        self.written += chunk.len() as u64;
        Ok(())
    }

    /// Total bytes written so far.
    pub fn written(&self) -> u64 {
        self.written
    }

    /// Verify the accumulated digest and move the blob into its final
    /// content-addressed path. On mismatch nothing becomes visible.
    pub async fn commit(mut self) -> Result<()> {
        if let Some(mut file) = self.file.take() {
            file.flush().await?;
        }

        let actual = format!("sha256:{}", hex::encode(self.hasher.clone().finalize()));
        if actual != self.digest {
            // Drop cleans up the staged file and releases the guard
            return Err(MirrorError::DigestMismatch {
                expected: self.digest.clone(),
                actual,
            });
        }

        let data_path = self.store.blob_dir(&self.hex).join("data");
        if let Some(parent) = data_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::rename(&self.tmp_path, &data_path).await?;
        self.committed = true;

        tracing::debug!(digest = %self.digest, size = self.written, "Blob committed");
        Ok(())
    }
}

impl Drop for BlobWriter<'_> {
    fn drop(&mut self) {
        if !self.committed {
            let _ = std::fs::remove_file(&self.tmp_path);
        }
        self.store.release(&self.digest);
    }
}
