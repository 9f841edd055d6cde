//! Registry client against a mock v2 registry.

use std::sync::Arc;

use tempfile::TempDir;
use wiremock::matchers::{header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use regmirror_core::config::Platform;
use regmirror_core::error::MirrorError;
use regmirror_engine::auth::{AuthResolver, Credential};
use regmirror_engine::client::RegistryClient;
use regmirror_engine::fetcher::ImageFetcher;
use regmirror_engine::manifest::{sha256_digest, DOCKER_MANIFEST, OCI_INDEX, OCI_MANIFEST};
use regmirror_engine::reference::ImageReference;
use regmirror_engine::retry::RetryPolicy;
use regmirror_engine::saver::ImageSaver;
use regmirror_engine::store::RegistryStore;

const CONFIG_BLOB: &[u8] = br#"{"architecture":"amd64","os":"linux"}"#;
const LAYER_BLOB: &[u8] = b"compressed layer bytes";

fn manifest_bytes() -> Vec<u8> {
    serde_json::to_vec(&serde_json::json!({
        "schemaVersion": 2,
        "mediaType": OCI_MANIFEST,
        "config": {
            "mediaType": "application/vnd.oci.image.config.v1+json",
            "digest": sha256_digest(CONFIG_BLOB),
            "size": CONFIG_BLOB.len()
        },
        "layers": [{
            "mediaType": "application/vnd.oci.image.layer.v1.tar+gzip",
            "digest": sha256_digest(LAYER_BLOB),
            "size": LAYER_BLOB.len()
        }]
    }))
    .unwrap()
}

fn index_bytes(manifest_digest: &str) -> Vec<u8> {
    serde_json::to_vec(&serde_json::json!({
        "schemaVersion": 2,
        "mediaType": OCI_INDEX,
        "manifests": [
            {
                "mediaType": OCI_MANIFEST,
                "digest": manifest_digest,
                "size": 1,
                "platform": { "architecture": "amd64", "os": "linux" }
            },
            {
                "mediaType": OCI_MANIFEST,
                "digest": "sha256:4444444444444444444444444444444444444444444444444444444444444444",
                "size": 1,
                "platform": { "architecture": "s390x", "os": "linux" }
            }
        ]
    }))
    .unwrap()
}

fn reference_on(server: &MockServer, repo_and_tag: &str) -> ImageReference {
    let address = server.address();
    ImageReference::parse(&format!(
        "127.0.0.1:{}/{}",
        address.port(),
        repo_and_tag
    ))
    .unwrap()
}

async fn mount_blob(server: &MockServer, repo: &str, content: &[u8]) {
    Mock::given(method("GET"))
        .and(path(format!("/v2/{}/blobs/{}", repo, sha256_digest(content))))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(content.to_vec()))
        .mount(server)
        .await;
}

fn client() -> RegistryClient {
    RegistryClient::with_retry(false, RetryPolicy::immediate(3))
}

#[tokio::test]
async fn test_anonymous_pull_end_to_end() {
    let server = MockServer::start().await;
    let bytes = manifest_bytes();

    Mock::given(method("GET"))
        .and(path("/v2/org/app/manifests/v1"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_bytes(bytes.clone())
                .insert_header("Content-Type", OCI_MANIFEST),
        )
        .mount(&server)
        .await;
    mount_blob(&server, "org/app", CONFIG_BLOB).await;
    mount_blob(&server, "org/app", LAYER_BLOB).await;

    let reference = reference_on(&server, "org/app:v1");
    let tmp = TempDir::new().unwrap();
    let saver = ImageSaver::with_fetcher(Arc::new(client()), AuthResolver::default(), 2)
        .with_retry(RetryPolicy::immediate(2));

    let report = saver
        .save_images(
            &[reference.full_reference()],
            tmp.path(),
            &Platform::default(),
        )
        .await
        .unwrap();

    assert!(report.all_succeeded());
    let store = RegistryStore::open(tmp.path()).unwrap();
    assert!(store.has_blob(&sha256_digest(CONFIG_BLOB)));
    assert!(store.has_blob(&sha256_digest(LAYER_BLOB)));
    assert!(store.has_blob(&sha256_digest(&bytes)));
}

#[tokio::test]
async fn test_bearer_token_exchange() {
    let server = MockServer::start().await;
    let realm = format!("http://127.0.0.1:{}/token", server.address().port());

    // with the issued token the manifest is served
    Mock::given(method("GET"))
        .and(path("/v2/org/private/manifests/v1"))
        .and(header("Authorization", "Bearer issued-token"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_bytes(manifest_bytes())
                .insert_header("Content-Type", OCI_MANIFEST),
        )
        .mount(&server)
        .await;
    // without it the registry challenges
    Mock::given(method("GET"))
        .and(path("/v2/org/private/manifests/v1"))
        .respond_with(ResponseTemplate::new(401).insert_header(
            "WWW-Authenticate",
            format!(r#"Bearer realm="{}",service="test-registry""#, realm).as_str(),
        ))
        .mount(&server)
        .await;
    // the token endpoint requires the basic credentials
    Mock::given(method("GET"))
        .and(path("/token"))
        .and(query_param("scope", "repository:org/private:pull"))
        .and(query_param("service", "test-registry"))
        .and(header("Authorization", "Basic YWRtaW46c2VjcmV0"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(serde_json::json!({ "token": "issued-token" })),
        )
        .mount(&server)
        .await;

    let reference = reference_on(&server, "org/private:v1");
    let credential = Credential::basic("admin", "secret");
    let manifest = client()
        .fetch_manifest(&reference, &Platform::default(), &credential)
        .await
        .unwrap();
    assert_eq!(manifest.manifest.layers.len(), 1);
}

#[tokio::test]
async fn test_basic_auth_mode_skips_token_exchange() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/v2/org/app/manifests/v1"))
        .and(header("Authorization", "Basic YWRtaW46c2VjcmV0"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_bytes(manifest_bytes())
                .insert_header("Content-Type", OCI_MANIFEST),
        )
        .mount(&server)
        .await;

    let reference = reference_on(&server, "org/app:v1");
    let client = RegistryClient::with_retry(true, RetryPolicy::immediate(1));
    let manifest = client
        .fetch_manifest(
            &reference,
            &Platform::default(),
            &Credential::basic("admin", "secret"),
        )
        .await
        .unwrap();
    assert_eq!(manifest.media_type, OCI_MANIFEST);
}

#[tokio::test]
async fn test_unauthorized_without_challenge_maps_by_credential() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v2/org/app/manifests/v1"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;

    let reference = reference_on(&server, "org/app:v1");

    let err = client()
        .fetch_manifest(&reference, &Platform::default(), &Credential::Anonymous)
        .await
        .unwrap_err();
    assert!(matches!(err, MirrorError::AuthRequired { .. }));

    let err = client()
        .fetch_manifest(
            &reference,
            &Platform::default(),
            &Credential::basic("user", "wrong"),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, MirrorError::AuthRejected { .. }));
}

#[tokio::test]
async fn test_missing_manifest_is_not_found() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v2/org/nosuch/manifests/v1"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let reference = reference_on(&server, "org/nosuch:v1");
    let err = client()
        .fetch_manifest(&reference, &Platform::default(), &Credential::Anonymous)
        .await
        .unwrap_err();
    assert!(matches!(err, MirrorError::ReferenceNotFound { .. }));
}

#[tokio::test]
async fn test_index_resolves_to_platform_manifest() {
    let server = MockServer::start().await;
    let manifest = manifest_bytes();
    let manifest_digest = sha256_digest(&manifest);

    Mock::given(method("GET"))
        .and(path("/v2/org/multi/manifests/v1"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_bytes(index_bytes(&manifest_digest))
                .insert_header("Content-Type", OCI_INDEX),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("/v2/org/multi/manifests/{}", manifest_digest)))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_bytes(manifest.clone())
                .insert_header("Content-Type", OCI_MANIFEST),
        )
        .mount(&server)
        .await;

    let reference = reference_on(&server, "org/multi:v1");
    let fetched = client()
        .fetch_manifest(&reference, &Platform::default(), &Credential::Anonymous)
        .await
        .unwrap();
    assert_eq!(fetched.digest, manifest_digest);
}

#[tokio::test]
async fn test_index_without_requested_platform_fails_hard() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v2/org/multi/manifests/v1"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_bytes(index_bytes(
                    "sha256:5555555555555555555555555555555555555555555555555555555555555555",
                ))
                .insert_header("Content-Type", OCI_INDEX),
        )
        .mount(&server)
        .await;

    let reference = reference_on(&server, "org/multi:v1");
    let err = client()
        .fetch_manifest(&reference, &Platform::linux("riscv64"), &Credential::Anonymous)
        .await
        .unwrap_err();
    assert!(matches!(err, MirrorError::PlatformNotFound { .. }));
}

#[tokio::test]
async fn test_corrupt_blob_is_rejected_and_never_persisted() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v2/org/app/manifests/v1"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_bytes(manifest_bytes())
                .insert_header("Content-Type", DOCKER_MANIFEST),
        )
        .mount(&server)
        .await;
    mount_blob(&server, "org/app", CONFIG_BLOB).await;
    // layer endpoint returns bytes that do not match the declared digest
    Mock::given(method("GET"))
        .and(path(format!(
            "/v2/org/app/blobs/{}",
            sha256_digest(LAYER_BLOB)
        )))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"tampered".to_vec()))
        .mount(&server)
        .await;

    let reference = reference_on(&server, "org/app:v1");
    let tmp = TempDir::new().unwrap();
    let saver = ImageSaver::with_fetcher(Arc::new(client()), AuthResolver::default(), 2)
        .with_retry(RetryPolicy::immediate(2));

    let report = saver
        .save_images(
            &[reference.full_reference()],
            tmp.path(),
            &Platform::default(),
        )
        .await
        .unwrap();

    assert_eq!(report.failed(), 1);
    assert!(matches!(
        report.outcomes[0].error,
        Some(MirrorError::DigestMismatch { .. })
    ));
    let store = RegistryStore::open(tmp.path()).unwrap();
    assert!(!store.has_blob(&sha256_digest(LAYER_BLOB)));
}

#[tokio::test]
async fn test_manifest_fetch_retries_transient_5xx() {
    let server = MockServer::start().await;
    // two failures, then success
    Mock::given(method("GET"))
        .and(path("/v2/org/flaky/manifests/v1"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(2)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v2/org/flaky/manifests/v1"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_bytes(manifest_bytes())
                .insert_header("Content-Type", OCI_MANIFEST),
        )
        .mount(&server)
        .await;

    let reference = reference_on(&server, "org/flaky:v1");
    let fetched = client()
        .fetch_manifest(&reference, &Platform::default(), &Credential::Anonymous)
        .await
        .unwrap();
    assert_eq!(fetched.manifest.schema_version, 2);
}

#[tokio::test]
async fn test_manifest_fetched_by_digest_is_verified() {
    let server = MockServer::start().await;
    let bytes = manifest_bytes();
    let wrong_digest =
        "sha256:6666666666666666666666666666666666666666666666666666666666666666";

    Mock::given(method("GET"))
        .and(path(format!("/v2/org/app/manifests/{}", wrong_digest)))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_bytes(bytes)
                .insert_header("Content-Type", OCI_MANIFEST),
        )
        .mount(&server)
        .await;

    let reference = ImageReference::parse(&format!(
        "127.0.0.1:{}/org/app@{}",
        server.address().port(),
        wrong_digest
    ))
    .unwrap();
    let err = client()
        .fetch_manifest(&reference, &Platform::default(), &Credential::Anonymous)
        .await
        .unwrap_err();
    assert!(matches!(err, MirrorError::DigestMismatch { .. }));
}
