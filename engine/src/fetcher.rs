//! Fetcher seam between the scheduler and the registry client.
//!
//! The saver only talks to this trait, so the scheduling and store logic can
//! be exercised against a stub without a registry on the wire.

use std::pin::Pin;

use async_trait::async_trait;
use futures::{Stream, StreamExt};

use regmirror_core::config::Platform;
use regmirror_core::error::Result;

use crate::auth::Credential;
use crate::manifest::FetchedManifest;
use crate::reference::ImageReference;

/// Fetches manifests and blob streams from a source registry.
#[async_trait]
pub trait ImageFetcher: Send + Sync {
    /// Retrieve the manifest for `reference`, resolving a manifest index to
    /// the entry matching `platform`.
    async fn fetch_manifest(
        &self,
        reference: &ImageReference,
        platform: &Platform,
        credential: &Credential,
    ) -> Result<FetchedManifest>;

    /// Open a streaming read of one blob by digest.
    async fn fetch_blob(
        &self,
        reference: &ImageReference,
        digest: &str,
        credential: &Credential,
    ) -> Result<BlobStream>;
}

type ChunkStream = Pin<Box<dyn Stream<Item = Result<Vec<u8>>> + Send>>;

/// A blob body as a sequence of chunks.
///
/// The consumer is responsible for hashing what it reads; the stream itself
/// only surfaces transport errors.
pub struct BlobStream {
    inner: ChunkStream,
}

impl BlobStream {
    pub fn from_response(response: reqwest::Response) -> Self {
        let inner = response
            .bytes_stream()
            .map(|chunk| chunk.map(|b| b.to_vec()).map_err(Into::into));
        Self {
            inner: Box::pin(inner),
        }
    }

    /// A single-chunk stream over in-memory bytes.
    pub fn from_bytes(data: Vec<u8>) -> Self {
        Self::from_chunks(vec![Ok(data)])
    }

    /// A stream over preassembled chunk results.
    pub fn from_chunks(chunks: Vec<Result<Vec<u8>>>) -> Self {
        Self {
            inner: Box::pin(futures::stream::iter(chunks)),
        }
    }

    /// Next chunk, `None` at end of stream.
    pub async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>> {
        self.inner.next().await.transpose()
    }
}

impl std::fmt::Debug for BlobStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlobStream").finish_non_exhaustive()
    }
}
