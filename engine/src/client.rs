//! Registry distribution client.
//!
//! Speaks the v2 pull protocol: manifest GET with media-type negotiation,
//! bearer token exchange on 401 challenges, and streaming blob reads. Manifest
//! requests are retried on transient failures; blob bodies are not retried
//! here because the store hashes them as they stream, so the saver restarts
//! the whole blob transfer instead.

use std::collections::HashMap;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE, WWW_AUTHENTICATE};
use reqwest::{Response, StatusCode};
use serde::Deserialize;
use tokio::sync::RwLock;

use regmirror_core::config::Platform;
use regmirror_core::error::{MirrorError, Result};

use crate::auth::Credential;
use crate::fetcher::{BlobStream, ImageFetcher};
use crate::manifest::{
    parse_manifest, sha256_digest, FetchedManifest, ManifestKind, MANIFEST_ACCEPT,
};
use crate::reference::ImageReference;
use crate::retry::{with_backoff, RetryPolicy};

/// HTTP client for pulling from v2 registries.
pub struct RegistryClient {
    http: reqwest::Client,
    /// Send credentials as HTTP basic auth on every request instead of
    /// exchanging them for bearer tokens.
    basic_auth: bool,
    retry: RetryPolicy,
    /// Bearer tokens cached per registry/repository scope.
    tokens: RwLock<HashMap<String, String>>,
}

#[derive(Deserialize)]
struct TokenResponse {
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    access_token: Option<String>,
}

/// Parsed `WWW-Authenticate: Bearer realm=...,service=...` challenge.
struct BearerChallenge {
    realm: String,
    service: Option<String>,
}

impl RegistryClient {
    pub fn new(basic_auth: bool) -> Self {
        Self::with_retry(basic_auth, RetryPolicy::default())
    }

    pub fn with_retry(basic_auth: bool, retry: RetryPolicy) -> Self {
        Self {
            http: reqwest::Client::new(),
            basic_auth,
            retry,
            tokens: RwLock::new(HashMap::new()),
        }
    }

    /// Plain HTTP for local registries, HTTPS everywhere else.
    fn base_url(registry: &str) -> String {
        let host = registry.split(':').next().unwrap_or(registry);
        let scheme = if host == "localhost" || host == "127.0.0.1" {
            "http"
        } else {
            "https"
        };
        format!("{}://{}", scheme, registry)
    }

    fn manifest_url(reference: &ImageReference, manifest_ref: &str) -> String {
        format!(
            "{}/v2/{}/manifests/{}",
            Self::base_url(&reference.registry),
            reference.repository,
            manifest_ref
        )
    }

    fn blob_url(reference: &ImageReference, digest: &str) -> String {
        format!(
            "{}/v2/{}/blobs/{}",
            Self::base_url(&reference.registry),
            reference.repository,
            digest
        )
    }

    fn scope_key(reference: &ImageReference) -> String {
        format!("{}/{}", reference.registry, reference.repository)
    }

    /// GET `url` with whatever auth we currently hold for the repository,
    /// answering a bearer challenge once before giving up.
    async fn authorized_get(
        &self,
        url: &str,
        reference: &ImageReference,
        credential: &Credential,
        accept: Option<&str>,
    ) -> Result<Response> {
        let response = self
            .send(url, reference, credential, accept, false)
            .await?;
        if response.status() != StatusCode::UNAUTHORIZED || self.basic_auth {
            return Ok(response);
        }

        let challenge = response
            .headers()
            .get(WWW_AUTHENTICATE)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_bearer_challenge);
        let Some(challenge) = challenge else {
            return Ok(response);
        };

        self.exchange_token(&challenge, reference, credential).await?;
        self.send(url, reference, credential, accept, true).await
    }

    async fn send(
        &self,
        url: &str,
        reference: &ImageReference,
        credential: &Credential,
        accept: Option<&str>,
        token_required: bool,
    ) -> Result<Response> {
        let mut request = self.http.get(url);
        if let Some(accept) = accept {
            request = request.header(ACCEPT, accept);
        }

        if self.basic_auth {
            if let Credential::Basic { username, password } = credential {
                request = request.header(AUTHORIZATION, basic_header(username, password));
            }
        } else {
            let tokens = self.tokens.read().await;
            if let Some(token) = tokens.get(&Self::scope_key(reference)) {
                request = request.header(AUTHORIZATION, format!("Bearer {}", token));
            } else if token_required {
                return Err(MirrorError::AuthRejected {
                    registry: reference.registry.clone(),
                    message: "token exchange produced no token".to_string(),
                });
            }
        }

        Ok(request.send().await?)
    }

    /// Trade credentials for a bearer token at the challenge's realm and
    /// cache it for the repository scope.
    async fn exchange_token(
        &self,
        challenge: &BearerChallenge,
        reference: &ImageReference,
        credential: &Credential,
    ) -> Result<()> {
        let scope = format!("repository:{}:pull", reference.repository);
        let mut request = self.http.get(&challenge.realm).query(&[("scope", scope.as_str())]);
        if let Some(ref service) = challenge.service {
            request = request.query(&[("service", service.as_str())]);
        }
        if let Credential::Basic { username, password } = credential {
            request = request.basic_auth(username, Some(password));
        }

        tracing::debug!(
            registry = %reference.registry,
            realm = %challenge.realm,
            "Exchanging credentials for bearer token"
        );
        let response = request.send().await?;
        if response.status() == StatusCode::UNAUTHORIZED
            || response.status() == StatusCode::FORBIDDEN
        {
            return Err(self.auth_error(reference, credential, "token exchange refused"));
        }
        if !response.status().is_success() {
            return Err(MirrorError::Network {
                message: format!(
                    "token endpoint {} returned {}",
                    challenge.realm,
                    response.status()
                ),
            });
        }

        let body: TokenResponse = response.json().await?;
        let token = body
            .token
            .or(body.access_token)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| {
                self.auth_error(reference, credential, "token endpoint returned no token")
            })?;

        self.tokens
            .write()
            .await
            .insert(Self::scope_key(reference), token);
        Ok(())
    }

    fn auth_error(
        &self,
        reference: &ImageReference,
        credential: &Credential,
        message: &str,
    ) -> MirrorError {
        if credential.is_anonymous() {
            MirrorError::AuthRequired {
                registry: reference.registry.clone(),
            }
        } else {
            MirrorError::AuthRejected {
                registry: reference.registry.clone(),
                message: message.to_string(),
            }
        }
    }

    /// Map a non-success status to the pull error taxonomy.
    fn check_status(
        &self,
        response: Response,
        reference: &ImageReference,
        credential: &Credential,
        requested: &str,
    ) -> Result<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        Err(match status {
            StatusCode::UNAUTHORIZED => {
                self.auth_error(reference, credential, "registry returned 401")
            }
            StatusCode::FORBIDDEN => MirrorError::AuthRejected {
                registry: reference.registry.clone(),
                message: "registry returned 403".to_string(),
            },
            StatusCode::NOT_FOUND => MirrorError::ReferenceNotFound {
                registry: reference.registry.clone(),
                reference: requested.to_string(),
            },
            _ => MirrorError::Network {
                message: format!(
                    "{} returned {} for {}",
                    reference.registry, status, requested
                ),
            },
        })
    }

    /// One manifest GET, without index resolution.
    async fn get_manifest_once(
        &self,
        reference: &ImageReference,
        manifest_ref: &str,
        credential: &Credential,
    ) -> Result<(Vec<u8>, Option<String>)> {
        let url = Self::manifest_url(reference, manifest_ref);
        let response = self
            .authorized_get(&url, reference, credential, Some(MANIFEST_ACCEPT))
            .await?;
        let requested = format!("{}/{}", reference.repository, manifest_ref);
        let response = self.check_status(response, reference, credential, &requested)?;

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.split(';').next().unwrap_or(v).trim().to_string());
        let bytes = response.bytes().await?.to_vec();

        // Content fetched by digest must hash to that digest
        if manifest_ref.starts_with("sha256:") {
            let actual = sha256_digest(&bytes);
            if actual != manifest_ref {
                return Err(MirrorError::DigestMismatch {
                    expected: manifest_ref.to_string(),
                    actual,
                });
            }
        }

        Ok((bytes, content_type))
    }

    /// Fetch by tag or digest, resolving a manifest index to the platform's
    /// single-image manifest.
    async fn resolve_manifest(
        &self,
        reference: &ImageReference,
        platform: &Platform,
        credential: &Credential,
    ) -> Result<FetchedManifest> {
        let (bytes, content_type) = self
            .get_manifest_once(reference, reference.manifest_ref(), credential)
            .await?;

        let (bytes, content_type) = match parse_manifest(&bytes, content_type.as_deref())? {
            ManifestKind::Manifest(manifest) => {
                let media_type = content_type
                    .or_else(|| manifest.media_type.clone())
                    .unwrap_or_else(|| crate::manifest::OCI_MANIFEST.to_string());
                return Ok(FetchedManifest::new(bytes, media_type, manifest));
            }
            ManifestKind::Index(index) => {
                let digest =
                    index.select_platform(&reference.full_reference(), platform)?;
                tracing::debug!(
                    reference = %reference,
                    platform = %platform,
                    digest = %digest,
                    "Resolved manifest index entry"
                );
                self.get_manifest_once(reference, &digest, credential).await?
            }
        };

        match parse_manifest(&bytes, content_type.as_deref())? {
            ManifestKind::Manifest(manifest) => {
                let media_type = content_type
                    .or_else(|| manifest.media_type.clone())
                    .unwrap_or_else(|| crate::manifest::OCI_MANIFEST.to_string());
                Ok(FetchedManifest::new(bytes, media_type, manifest))
            }
            // An index pointing at another index is out of scope
            ManifestKind::Index(_) => Err(MirrorError::UnsupportedMediaType(
                "nested manifest index".to_string(),
            )),
        }
    }
}

#[async_trait]
impl ImageFetcher for RegistryClient {
    async fn fetch_manifest(
        &self,
        reference: &ImageReference,
        platform: &Platform,
        credential: &Credential,
    ) -> Result<FetchedManifest> {
        with_backoff(&self.retry, "fetch_manifest", || {
            self.resolve_manifest(reference, platform, credential)
        })
        .await
    }

    async fn fetch_blob(
        &self,
        reference: &ImageReference,
        digest: &str,
        credential: &Credential,
    ) -> Result<BlobStream> {
        let url = Self::blob_url(reference, digest);
        let response = self
            .authorized_get(&url, reference, credential, None)
            .await?;
        let requested = format!("{}@{}", reference.repository, digest);
        let response = self.check_status(response, reference, credential, &requested)?;
        Ok(BlobStream::from_response(response))
    }
}

fn basic_header(username: &str, password: &str) -> String {
    format!(
        "Basic {}",
        BASE64.encode(format!("{}:{}", username, password))
    )
}

/// Parse the `Bearer realm="...",service="..."` challenge header.
fn parse_bearer_challenge(header: &str) -> Option<BearerChallenge> {
    let params = header.strip_prefix("Bearer ")?;
    let mut realm = None;
    let mut service = None;
    for part in params.split(',') {
        let (key, value) = part.trim().split_once('=')?;
        let value = value.trim_matches('"').to_string();
        match key.trim() {
            "realm" => realm = Some(value),
            "service" => service = Some(value),
            _ => {}
        }
    }
    Some(BearerChallenge {
        realm: realm?,
        service,
    })
}
