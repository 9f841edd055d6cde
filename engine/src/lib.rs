//! Pull engine: registry client, local store, and concurrent scheduler.
//!
//! The flow is `ImageSaver::save_images` → per-image pipeline → `RegistryClient`
//! (or any [`ImageFetcher`]) for the wire, `RegistryStore` for disk.

pub mod auth;
pub mod client;
pub mod fetcher;
pub mod manifest;
pub mod reference;
pub mod retry;
pub mod saver;
pub mod store;

pub use auth::{AuthResolver, Credential};
pub use client::RegistryClient;
pub use fetcher::{BlobStream, ImageFetcher};
pub use manifest::{FetchedManifest, ImageIndex, ImageManifest, ManifestKind};
pub use reference::ImageReference;
pub use retry::RetryPolicy;
pub use saver::{ImageSaver, PullOutcome, PullReport};
pub use store::{BlobWriter, RegistryStore};
