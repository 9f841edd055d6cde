//! Concurrent image pull scheduling.
//!
//! One pipeline per image (manifest, blobs, links, tag), fanned out under a
//! semaphore so at most `max_pull_procs` pipelines hold the network at once.
//! Failures are isolated per image; the report keeps input order.

use std::path::Path;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use regmirror_core::config::{Platform, PullConfig};
use regmirror_core::error::{MirrorError, Result};

use crate::auth::AuthResolver;
use crate::client::RegistryClient;
use crate::fetcher::ImageFetcher;
use crate::reference::ImageReference;
use crate::retry::{with_backoff, RetryPolicy};
use crate::store::RegistryStore;

/// Result of pulling one image.
#[derive(Debug)]
pub struct PullOutcome {
    /// The reference as parsed (fully qualified).
    pub reference: String,
    /// Failure cause, `None` on success.
    pub error: Option<MirrorError>,
    /// Digests of the blobs this pull newly committed to the store.
    pub blobs_written: Vec<String>,
}

impl PullOutcome {
    fn succeeded(reference: String, blobs_written: Vec<String>) -> Self {
        Self {
            reference,
            error: None,
            blobs_written,
        }
    }

    fn failed(reference: String, error: MirrorError) -> Self {
        Self {
            reference,
            error: Some(error),
            blobs_written: Vec::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Per-image outcomes in input order.
#[derive(Debug, Default)]
pub struct PullReport {
    pub outcomes: Vec<PullOutcome>,
}

impl PullReport {
    pub fn succeeded(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_success()).count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes.len() - self.succeeded()
    }

    pub fn all_succeeded(&self) -> bool {
        self.failed() == 0
    }
}

/// Pulls a set of images into a local registry store.
pub struct ImageSaver {
    fetcher: Arc<dyn ImageFetcher>,
    resolver: AuthResolver,
    max_pull_procs: usize,
    retry: RetryPolicy,
    cancel: CancellationToken,
}

impl ImageSaver {
    /// A saver backed by the real registry client.
    pub fn new(config: &PullConfig, resolver: AuthResolver) -> Self {
        Self::with_fetcher(
            Arc::new(RegistryClient::new(config.basic_auth)),
            resolver,
            config.max_pull_procs,
        )
    }

    /// A saver over any fetcher, used by tests to substitute a stub.
    pub fn with_fetcher(
        fetcher: Arc<dyn ImageFetcher>,
        resolver: AuthResolver,
        max_pull_procs: usize,
    ) -> Self {
        Self {
            fetcher,
            resolver,
            max_pull_procs: max_pull_procs.max(1),
            retry: RetryPolicy::default(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Token that aborts in-flight pipelines when cancelled.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Pull every image in `images` into the store rooted at `data_dir`.
    ///
    /// Configuration problems (empty list, unparseable reference, unusable
    /// data dir) fail the whole run before any network activity. Once the
    /// fan-out starts, each image fails or succeeds on its own.
    pub async fn save_images(
        &self,
        images: &[String],
        data_dir: &Path,
        platform: &Platform,
    ) -> Result<PullReport> {
        if images.is_empty() {
            return Err(MirrorError::Config("no images to pull".to_string()));
        }

        let references = images
            .iter()
            .map(|image| ImageReference::parse(image))
            .collect::<Result<Vec<_>>>()?;

        let store = Arc::new(RegistryStore::open(data_dir)?);
        let semaphore = Arc::new(Semaphore::new(self.max_pull_procs));
        let mut tasks = JoinSet::new();

        // Close the semaphore on cancel so pipelines parked on a permit stop
        // waiting instead of running after the cancelled ones drain.
        let closer = {
            let semaphore = semaphore.clone();
            let cancel = self.cancel.clone();
            tokio::spawn(async move {
                cancel.cancelled().await;
                semaphore.close();
            })
        };

        tracing::info!(
            images = references.len(),
            max_pull_procs = self.max_pull_procs,
            platform = %platform,
            "Starting image pull"
        );

        for (index, reference) in references.iter().enumerate() {
            let reference = reference.clone();
            let credential = self.resolver.resolve(&reference.registry);
            let fetcher = self.fetcher.clone();
            let store = store.clone();
            let platform = platform.clone();
            let retry = self.retry.clone();
            let cancel = self.cancel.clone();
            let semaphore = semaphore.clone();

            tasks.spawn(async move {
                // acquire_owned errors once the semaphore is closed on cancel
                let permit = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => None,
                    permit = semaphore.acquire_owned() => permit.ok(),
                };
                let Some(_permit) = permit else {
                    return (
                        index,
                        PullOutcome::failed(reference.full_reference(), MirrorError::Cancelled),
                    );
                };

                let result = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => Err(MirrorError::Cancelled),
                    result = pull_image(&*fetcher, &store, &reference, &platform, &credential, &retry) => result,
                };

                let name = reference.full_reference();
                let outcome = match result {
                    Ok(blobs_written) => {
                        tracing::info!(
                            reference = %name,
                            blobs_written = blobs_written.len(),
                            "Image pulled"
                        );
                        PullOutcome::succeeded(name, blobs_written)
                    }
                    Err(error) => {
                        tracing::warn!(reference = %name, error = %error, "Image pull failed");
                        PullOutcome::failed(name, error)
                    }
                };
                (index, outcome)
            });
        }

        let mut slots: Vec<Option<PullOutcome>> = Vec::new();
        slots.resize_with(references.len(), || None);
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, outcome)) => slots[index] = Some(outcome),
                Err(join_error) => {
                    tracing::error!(error = %join_error, "Pull task panicked");
                }
            }
        }
        closer.abort();

        let outcomes = slots
            .into_iter()
            .zip(references)
            .map(|(slot, reference)| {
                slot.unwrap_or_else(|| {
                    PullOutcome::failed(
                        reference.full_reference(),
                        MirrorError::Store("pull task aborted".to_string()),
                    )
                })
            })
            .collect();

        let report = PullReport { outcomes };
        tracing::info!(
            succeeded = report.succeeded(),
            failed = report.failed(),
            "Image pull finished"
        );
        Ok(report)
    }
}

/// The pipeline for one image: manifest, then each blob, then the tag links.
///
/// Returns the digests of the blobs this pull newly wrote. Blob transfers are
/// retried end to end because the digest check happens while streaming, so a
/// broken stream means starting the blob over.
async fn pull_image(
    fetcher: &dyn ImageFetcher,
    store: &RegistryStore,
    reference: &ImageReference,
    platform: &Platform,
    credential: &crate::auth::Credential,
    retry: &RetryPolicy,
) -> Result<Vec<String>> {
    let manifest = fetcher
        .fetch_manifest(reference, platform, credential)
        .await?;
    tracing::debug!(
        reference = %reference,
        digest = %manifest.digest,
        layers = manifest.manifest.layers.len(),
        "Fetched manifest"
    );

    let mut blobs_written = Vec::new();
    for descriptor in manifest.manifest.blobs() {
        if store.has_blob(&descriptor.digest) {
            tracing::debug!(digest = %descriptor.digest, "Blob already present");
        } else {
            let written = with_backoff(retry, "fetch_blob", || async {
                let Some(mut writer) = store.begin_blob(&descriptor.digest).await? else {
                    // another worker committed it while we waited
                    return Ok(false);
                };
                let mut stream = fetcher
                    .fetch_blob(reference, &descriptor.digest, credential)
                    .await?;
                while let Some(chunk) = stream.next_chunk().await? {
                    writer.write_chunk(&chunk).await?;
                }
                writer.commit().await?;
                Ok(true)
            })
            .await?;
            if written {
                blobs_written.push(descriptor.digest.clone());
            }
        }
        store.link_layer(&reference.repository, &descriptor.digest).await?;
    }

    store.write_manifest(reference, &manifest).await?;
    Ok(blobs_written)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome(reference: &str, error: Option<MirrorError>) -> PullOutcome {
        PullOutcome {
            reference: reference.to_string(),
            error,
            blobs_written: Vec::new(),
        }
    }

    #[test]
    fn test_report_counts() {
        let report = PullReport {
            outcomes: vec![
                outcome("docker.io/library/a:1", None),
                outcome(
                    "docker.io/library/b:1",
                    Some(MirrorError::Network {
                        message: "reset".to_string(),
                    }),
                ),
                outcome("docker.io/library/c:1", None),
            ],
        };
        assert_eq!(report.succeeded(), 2);
        assert_eq!(report.failed(), 1);
        assert!(!report.all_succeeded());
    }

    #[test]
    fn test_empty_report_all_succeeded() {
        assert!(PullReport::default().all_succeeded());
    }

    #[tokio::test]
    async fn test_empty_image_list_is_config_error() {
        let saver = ImageSaver::with_fetcher(
            Arc::new(NoopFetcher),
            AuthResolver::default(),
            2,
        );
        let tmp = tempfile::TempDir::new().unwrap();
        let err = saver
            .save_images(&[], tmp.path(), &Platform::default())
            .await
            .unwrap_err();
        assert!(matches!(err, MirrorError::Config(_)));
    }

    #[tokio::test]
    async fn test_invalid_reference_fails_run() {
        let saver = ImageSaver::with_fetcher(
            Arc::new(NoopFetcher),
            AuthResolver::default(),
            2,
        );
        let tmp = tempfile::TempDir::new().unwrap();
        let err = saver
            .save_images(
                &["good/image:1".to_string(), "bad@sha256:short".to_string()],
                tmp.path(),
                &Platform::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, MirrorError::InvalidReference { .. }));
    }

    struct NoopFetcher;

    #[async_trait::async_trait]
    impl ImageFetcher for NoopFetcher {
        async fn fetch_manifest(
            &self,
            _reference: &ImageReference,
            _platform: &Platform,
            _credential: &crate::auth::Credential,
        ) -> Result<crate::manifest::FetchedManifest> {
            unimplemented!("not reached in these tests")
        }

        async fn fetch_blob(
            &self,
            _reference: &ImageReference,
            _digest: &str,
            _credential: &crate::auth::Credential,
        ) -> Result<crate::fetcher::BlobStream> {
            unimplemented!("not reached in these tests")
        }
    }
}
