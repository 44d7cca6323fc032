use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tempfile::TempDir;

use super::*;
use crate::api::{
    ApiRequest, CreateEdgeClientBody, GetCertBody, MockProvisionApi, MockProxyDirectory,
    ProxyEndpoint,
};
use crate::credential::CredentialStatus;
use crate::hierarchy::Tier;
use crate::pki::testing::{self_signed, TestAuthority};
use crate::pki::{CertRequest, MockCsrGenerator};
use crate::retry::RetryConfig;
use crate::store::{files, FsStore};

/// Filesystem store whose writes to one file name fail a set number of times
struct FlakyWrites {
    inner: FsStore,
    file_name: &'static str,
    remaining_failures: AtomicU32,
}

impl FlakyWrites {
    fn new(file_name: &'static str, failures: u32) -> Self {
        Self {
            inner: FsStore::new(),
            file_name,
            remaining_failures: AtomicU32::new(failures),
        }
    }
}

#[async_trait]
impl CredentialStore for FlakyWrites {
    async fn read(&self, path: &Path) -> io::Result<Option<Vec<u8>>> {
        self.inner.read(path).await
    }

    async fn exists(&self, path: &Path) -> bool {
        self.inner.exists(path).await
    }

    async fn write(&self, path: &Path, contents: &[u8]) -> io::Result<()> {
        let targeted = path.file_name().is_some_and(|n| n == self.file_name);
        if targeted
            && self
                .remaining_failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
        {
            return Err(io::Error::new(io::ErrorKind::Other, "disk full"));
        }
        self.inner.write(path, contents).await
    }

    async fn create_dir(&self, path: &Path) -> io::Result<()> {
        self.inner.create_dir(path).await
    }

    async fn remove(&self, path: &Path) -> io::Result<()> {
        self.inner.remove(path).await
    }
}

fn fast_retry() -> RetryConfig {
    RetryConfig::with_max_attempts(2).with_initial_delay(Duration::from_millis(1))
}

fn test_config(root: &Path) -> ProvisionConfig {
    ProvisionConfig {
        directory_retry: fast_retry(),
        persist_retry: fast_retry(),
        request_timeout: Duration::from_secs(5),
        ..ProvisionConfig::default().with_root_dir(root)
    }
}

async fn write_metadata(store: &dyn CredentialStore, dir: &Path, fqdn: &str, uid: &str, tier: Tier) {
    let meta = EntityMetadata {
        fqdn: fqdn.to_string(),
        uid: uid.to_string(),
        parent_fqdn: None,
        name: None,
        level: Some(tier),
    };
    store.create_dir(dir).await.unwrap();
    store
        .write(&dir.join(files::METADATA), &meta.to_json_bytes().unwrap())
        .await
        .unwrap();
}

async fn provision_node(store: &dyn CredentialStore, dir: &Path, fqdn: &str, tier: Tier) {
    let (cert, key) = self_signed(fqdn);
    write_metadata(store, dir, fqdn, &format!("{}-uid", fqdn), tier).await;
    store.write(&dir.join(files::X509), cert.as_bytes()).await.unwrap();
    store.write(&dir.join(files::PRIVATE_KEY), key.as_bytes()).await.unwrap();
}

/// dev1 and app1 provisioned under a fresh root
async fn provisioned_root(store: &dyn CredentialStore) -> TempDir {
    let root = tempfile::tempdir().unwrap();
    let dev_dir = root.path().join("dev1");
    provision_node(store, &dev_dir, "dev1", Tier::Developer).await;
    provision_node(store, &dev_dir.join("app1"), "app1", Tier::App).await;
    root
}

fn one_proxy() -> MockProxyDirectory {
    let mut directory = MockProxyDirectory::new();
    directory.expect_candidates().returning(|_| {
        Ok(vec![ProxyEndpoint {
            endpoint: "proxy.example".to_string(),
        }])
    });
    directory
}

fn real_csr() -> MockCsrGenerator {
    let mut csr = MockCsrGenerator::new();
    csr.expect_generate().returning(CertRequest::new);
    csr
}

fn service(
    root: &Path,
    store: Arc<dyn CredentialStore>,
    api: MockProvisionApi,
    directory: MockProxyDirectory,
    csr: MockCsrGenerator,
) -> EdgeClientService {
    EdgeClientService::new(
        test_config(root),
        store,
        Arc::new(api),
        Arc::new(directory),
        Arc::new(csr),
    )
}

/// API whose GetCert signs the submitted CSR with an in-process CA
fn signing_api(api: &mut MockProvisionApi, expected_uid: &'static str, times: usize) {
    signing_api_for(api, "app1", expected_uid, times);
}

fn signing_api_for(
    api: &mut MockProvisionApi,
    signer: &'static str,
    expected_uid: &'static str,
    times: usize,
) {
    let ca = TestAuthority::new("ca.beameio.net");
    let ca_pem = ca.ca_cert_pem().to_string();
    api.expect_get_cert()
        .withf(move |req: &ApiRequest<GetCertBody>| {
            req.body.uid == expected_uid
                && req.body.csr.contains("BEGIN CERTIFICATE REQUEST")
                && req.auth.signer_fqdn() == signer
        })
        .times(times)
        .returning(move |req| {
            Ok(json!({
                "x509": ca.sign_csr(&req.body.csr),
                "ca": ca_pem.clone(),
            }))
        });
}

fn edge_dir(root: &Path, edge: &str) -> std::path::PathBuf {
    root.join("dev1").join("app1").join(edge)
}

/// CSR generator that records every private key it hands out
fn recording_csr(keys: Arc<Mutex<Vec<String>>>) -> MockCsrGenerator {
    let mut csr = MockCsrGenerator::new();
    csr.expect_generate().returning(move |hostname| {
        let request = CertRequest::new(hostname)?;
        keys.lock().unwrap().push(request.private_key_pem().to_string());
        Ok(request)
    });
    csr
}

async fn read_file(store: &dyn CredentialStore, path: &Path) -> Option<Vec<u8>> {
    store.read(path).await.unwrap()
}

// =============================================================================
// Registration
// =============================================================================

/// Story: registering under a provisioned app creates the edge directory
#[tokio::test]
async fn story_register_creates_edge_directory() {
    let store = Arc::new(FsStore::new());
    let root = provisioned_root(store.as_ref()).await;

    let mut api = MockProvisionApi::new();
    api.expect_create_edge_client()
        .withf(|req: &ApiRequest<CreateEdgeClientBody>| {
            req.body.host == "proxy.example" && req.auth.signer_fqdn() == "app1"
        })
        .times(1)
        .returning(|_| Ok(json!({"hostname": "edge1.dev1.app1", "uid": "u1"})));
    api.expect_get_cert().times(0);

    let svc = service(root.path(), store.clone(), api, one_proxy(), MockCsrGenerator::new());
    let meta = svc.register_edge_client("dev1", "app1").await.unwrap();

    assert_eq!(meta.fqdn, "edge1.dev1.app1");
    assert_eq!(meta.uid, "u1");
    assert_eq!(meta.parent_fqdn.as_deref(), Some("app1"));
    assert_eq!(meta.level, Some(Tier::Edge));

    let dir = edge_dir(root.path(), "edge1.dev1.app1");
    assert!(store.exists(&dir.join(files::METADATA)).await);
    assert!(!store.exists(&dir.join(files::X509)).await);
}

/// Story: a registration response without a hostname is never a success
#[tokio::test]
async fn story_registration_without_hostname_is_rejected() {
    let store = Arc::new(FsStore::new());
    let root = provisioned_root(store.as_ref()).await;

    let mut api = MockProvisionApi::new();
    api.expect_create_edge_client()
        .times(1)
        .returning(|_| Ok(json!({"uid": "u1"})));

    let svc = service(root.path(), store, api, one_proxy(), MockCsrGenerator::new());
    let err = svc.register_edge_client("dev1", "app1").await.unwrap_err();

    assert!(matches!(
        err,
        Error::UnexpectedResponse {
            action: crate::api::ApiAction::CreateEdgeClient,
            ..
        }
    ));

    let app_dir = root.path().join("dev1").join("app1");
    let child_dirs = std::fs::read_dir(&app_dir)
        .unwrap()
        .filter(|e| e.as_ref().unwrap().path().is_dir())
        .count();
    assert_eq!(child_dirs, 0, "no edge directory may be created");
}

#[tokio::test]
async fn test_assigned_hostname_with_path_syntax_is_rejected() {
    let store = Arc::new(FsStore::new());
    let root = provisioned_root(store.as_ref()).await;

    let mut api = MockProvisionApi::new();
    api.expect_create_edge_client()
        .returning(|_| Ok(json!({"hostname": "../escape", "uid": "u1"})));

    let svc = service(root.path(), store, api, one_proxy(), MockCsrGenerator::new());
    let err = svc.register_edge_client("dev1", "app1").await.unwrap_err();
    assert!(matches!(err, Error::UnexpectedResponse { .. }));
}

#[tokio::test]
async fn test_remote_registration_failure_names_the_app() {
    let store = Arc::new(FsStore::new());
    let root = provisioned_root(store.as_ref()).await;

    let mut api = MockProvisionApi::new();
    api.expect_create_edge_client()
        .times(1)
        .returning(|_| Err(RemoteError::new(Some(409), "quota exceeded")));

    let svc = service(root.path(), store, api, one_proxy(), MockCsrGenerator::new());
    let err = svc.register_edge_client("dev1", "app1").await.unwrap_err();

    match err {
        Error::Registration { hostname, source } => {
            assert_eq!(hostname, "app1");
            assert_eq!(source.status, Some(409));
        }
        other => panic!("Expected Registration, got {:?}", other),
    }
}

#[tokio::test]
async fn test_no_proxy_stops_before_registration() {
    let store = Arc::new(FsStore::new());
    let root = provisioned_root(store.as_ref()).await;

    let mut directory = MockProxyDirectory::new();
    directory.expect_candidates().returning(|_| Ok(vec![]));
    let mut api = MockProvisionApi::new();
    api.expect_create_edge_client().times(0);

    let svc = service(root.path(), store, api, directory, MockCsrGenerator::new());
    let err = svc.register_edge_client("dev1", "app1").await.unwrap_err();
    assert!(matches!(err, Error::NoProxyAvailable { .. }));
}

/// Story: invalid hostnames fail before any collaborator is touched
#[tokio::test]
async fn story_invalid_hostname_makes_no_calls() {
    let mut store = crate::store::MockCredentialStore::new();
    store.expect_exists().times(0);
    store.expect_read().times(0);
    let mut directory = MockProxyDirectory::new();
    directory.expect_candidates().times(0);
    let mut api = MockProvisionApi::new();
    api.expect_create_edge_client().times(0);
    api.expect_get_cert().times(0);
    let mut csr = MockCsrGenerator::new();
    csr.expect_generate().times(0);

    let svc = service(Path::new("/creds"), Arc::new(store), api, directory, csr);

    for (dev, app) in [("", "app1"), ("dev1", ""), ("", "")] {
        let err = svc.register_edge_client(dev, app).await.unwrap_err();
        assert!(matches!(err, Error::InvalidHostname { .. }), "{:?}", err);
    }
    let err = svc.get_cert("dev1", "app1", "").await.unwrap_err();
    assert!(matches!(err, Error::InvalidHostname { tier: Tier::Edge, .. }));
    let err = svc.create_edge_client("", "app1").await.unwrap_err();
    assert!(matches!(err, Error::InvalidHostname { tier: Tier::Developer, .. }));
}

#[tokio::test]
async fn test_cancelled_service_stops_before_proxy_selection() {
    let store = Arc::new(FsStore::new());
    let root = provisioned_root(store.as_ref()).await;

    let mut directory = MockProxyDirectory::new();
    directory.expect_candidates().times(0);
    let mut api = MockProvisionApi::new();
    api.expect_create_edge_client().times(0);

    let svc = service(root.path(), store, api, directory, MockCsrGenerator::new());
    svc.cancellation_token().cancel();

    let err = svc.register_edge_client("dev1", "app1").await.unwrap_err();
    assert!(matches!(err, Error::Cancelled));
}

/// Story: a registration that could not be written is saved without re-registering
#[tokio::test]
async fn story_unsaved_registration_can_be_saved() {
    let root = provisioned_root(&FsStore::new()).await;
    let store = Arc::new(FlakyWrites::new(files::METADATA, 2));

    let mut api = MockProvisionApi::new();
    api.expect_create_edge_client()
        .times(1)
        .returning(|_| Ok(json!({"hostname": "edge1", "uid": "u1"})));

    let svc = service(root.path(), store.clone(), api, one_proxy(), MockCsrGenerator::new());
    let err = svc.register_edge_client("dev1", "app1").await.unwrap_err();
    assert!(matches!(err, Error::Persistence { .. }));
    let payload = err.unsaved_registration().cloned().expect("registration must be exposed");
    assert_eq!(payload.hostname, "edge1");

    let dir = edge_dir(root.path(), "edge1");
    assert!(!store.exists(&dir.join(files::METADATA)).await);

    let meta = svc.save_registration("dev1", "app1", &payload).await.unwrap();
    assert_eq!(meta.fqdn, "edge1");
    assert_eq!(meta.uid, "u1");
    assert_eq!(meta.parent_fqdn.as_deref(), Some("app1"));
    assert!(store.exists(&dir.join(files::METADATA)).await);
}

#[tokio::test]
async fn test_save_registration_rejects_path_syntax() {
    let store = Arc::new(FsStore::new());
    let root = provisioned_root(store.as_ref()).await;

    let svc = service(
        root.path(),
        store,
        MockProvisionApi::new(),
        MockProxyDirectory::new(),
        MockCsrGenerator::new(),
    );
    let payload = crate::api::RegistrationPayload {
        hostname: "../escape".to_string(),
        uid: "u1".to_string(),
        name: None,
    };
    let err = svc.save_registration("dev1", "app1", &payload).await.unwrap_err();
    assert!(matches!(err, Error::UnexpectedResponse { .. }));
}

// =============================================================================
// Certificate issuance
// =============================================================================

/// Story: a missing developer blocks issuance before a CSR exists
#[tokio::test]
async fn story_missing_developer_blocks_issuance() {
    let store = Arc::new(FsStore::new());
    let root = tempfile::tempdir().unwrap();

    let mut csr = MockCsrGenerator::new();
    csr.expect_generate().times(0);
    let mut api = MockProvisionApi::new();
    api.expect_get_cert().times(0);
    let mut directory = MockProxyDirectory::new();
    directory.expect_candidates().times(0);

    let svc = service(root.path(), store, api, directory, csr);
    let err = svc.get_cert("dev1", "app1", "edge1").await.unwrap_err();

    assert!(matches!(
        err,
        Error::HierarchyValidation {
            tier: Tier::Developer,
            ..
        }
    ));
}

/// Story: a registered edge client gets a certificate that loads back
#[tokio::test]
async fn story_issued_certificate_is_saved_and_loaded() {
    let store = Arc::new(FsStore::new());
    let root = provisioned_root(store.as_ref()).await;
    let dir = edge_dir(root.path(), "edge1");
    write_metadata(store.as_ref(), &dir, "edge1", "u1", Tier::Edge).await;

    let mut api = MockProvisionApi::new();
    signing_api(&mut api, "u1", 1);

    let svc = service(root.path(), store.clone(), api, MockProxyDirectory::new(), real_csr());
    let meta = svc.get_cert("dev1", "app1", "edge1").await.unwrap();
    assert_eq!(meta.uid, "u1");

    let credential = svc.load_credential("dev1", "app1", Some("edge1")).await.unwrap();
    assert!(credential.has_certificate());
    assert!(credential.has_private_key());
    assert!(credential.status().contains(CredentialStatus::BEAME_ISSUED));
    assert_eq!(credential.common_name().unwrap(), "edge1");

    assert!(store.exists(&dir.join(files::CA)).await);
    assert!(!store.exists(&dir.join(files::PKCS7)).await);
    assert!(!store.exists(&dir.join(files::CSR)).await, "CSR is transient");
    assert!(svc.pending_certificate(&dir).is_none());
}

#[tokio::test]
async fn test_edge_without_metadata_is_not_issued() {
    let store = Arc::new(FsStore::new());
    let root = provisioned_root(store.as_ref()).await;

    let mut csr = MockCsrGenerator::new();
    csr.expect_generate().times(0);
    let mut api = MockProvisionApi::new();
    api.expect_get_cert().times(0);

    let svc = service(root.path(), store, api, MockProxyDirectory::new(), csr);
    let err = svc.get_cert("dev1", "app1", "edge1").await.unwrap_err();
    assert!(matches!(err, Error::HierarchyValidation { tier: Tier::Edge, .. }));
}

#[tokio::test]
async fn test_csr_failure_makes_no_remote_call() {
    let store = Arc::new(FsStore::new());
    let root = provisioned_root(store.as_ref()).await;
    write_metadata(store.as_ref(), &edge_dir(root.path(), "edge1"), "edge1", "u1", Tier::Edge).await;

    let mut csr = MockCsrGenerator::new();
    csr.expect_generate().times(1).returning(|_| {
        Err(crate::pki::PkiError::KeyGenerationFailed("no entropy".to_string()))
    });
    let mut api = MockProvisionApi::new();
    api.expect_get_cert().times(0);

    let svc = service(root.path(), store, api, MockProxyDirectory::new(), csr);
    let err = svc.get_cert("dev1", "app1", "edge1").await.unwrap_err();

    match err {
        Error::CsrGeneration { hostname, reason } => {
            assert_eq!(hostname, "edge1");
            assert!(reason.contains("no entropy"));
        }
        other => panic!("Expected CsrGeneration, got {:?}", other),
    }
}

#[tokio::test]
async fn test_remote_issuance_failure_names_the_edge() {
    let store = Arc::new(FsStore::new());
    let root = provisioned_root(store.as_ref()).await;
    write_metadata(store.as_ref(), &edge_dir(root.path(), "edge1"), "edge1", "u1", Tier::Edge).await;

    let mut api = MockProvisionApi::new();
    api.expect_get_cert()
        .times(1)
        .returning(|_| Err(RemoteError::new(Some(500), "signer offline")));

    let svc = service(root.path(), store, api, MockProxyDirectory::new(), real_csr());
    let err = svc.get_cert("dev1", "app1", "edge1").await.unwrap_err();

    assert!(matches!(err, Error::CertIssuance { ref hostname, .. } if hostname == "edge1"));
    assert!(err.unsaved_certificate().is_none());
    assert!(svc.pending_certificate(&edge_dir(root.path(), "edge1")).is_none());
}

/// Story: a save failure after issuance keeps the certificate for the retry
///
/// The second call must save the held certificate rather than ask the CA
/// for another one.
#[tokio::test]
async fn story_persistence_failure_keeps_issued_certificate() {
    let root = provisioned_root(&FsStore::new()).await;
    let store = Arc::new(FlakyWrites::new(files::X509, 2));
    write_metadata(store.as_ref(), &edge_dir(root.path(), "edge1"), "edge1", "u1", Tier::Edge).await;

    let mut api = MockProvisionApi::new();
    signing_api(&mut api, "u1", 1);
    let mut csr = MockCsrGenerator::new();
    csr.expect_generate().times(1).returning(CertRequest::new);

    let svc = service(root.path(), store, api, MockProxyDirectory::new(), csr);

    let err = svc.get_cert("dev1", "app1", "edge1").await.unwrap_err();
    assert!(matches!(err, Error::Persistence { .. }));
    assert!(!matches!(err, Error::CertIssuance { .. }));
    let unsaved = err.unsaved_certificate().expect("issued certificate must be exposed");
    assert!(unsaved.payload.x509.contains("BEGIN CERTIFICATE"));
    assert!(unsaved.private_key_pem.contains("PRIVATE KEY"));
    let dir = edge_dir(root.path(), "edge1");
    assert!(svc.pending_certificate(&dir).is_some());

    let meta = svc.get_cert("dev1", "app1", "edge1").await.unwrap();
    assert_eq!(meta.uid, "u1");
    assert!(svc.pending_certificate(&dir).is_none());

    let credential = svc.load_credential("dev1", "app1", Some("edge1")).await.unwrap();
    assert!(credential.has_certificate());
    assert!(credential.has_private_key());
}

#[tokio::test]
async fn test_explicit_save_of_unsaved_certificate() {
    let root = provisioned_root(&FsStore::new()).await;
    let store = Arc::new(FlakyWrites::new(files::X509, 2));
    write_metadata(store.as_ref(), &edge_dir(root.path(), "edge1"), "edge1", "u1", Tier::Edge).await;

    let mut api = MockProvisionApi::new();
    signing_api(&mut api, "u1", 1);

    let svc = service(root.path(), store, api, MockProxyDirectory::new(), real_csr());
    let err = svc.get_cert("dev1", "app1", "edge1").await.unwrap_err();
    let issued = err.unsaved_certificate().cloned().unwrap();

    svc.save_issued_certificate(&issued).await.unwrap();

    assert!(svc.pending_certificate(&issued.edge_dir).is_none());
    let credential = svc.load_credential("dev1", "app1", Some("edge1")).await.unwrap();
    assert!(credential.has_certificate());
}

/// Story: edge names are only unique under their app
///
/// A certificate held for dev1/app1/edge1 must never be written into
/// dev1/app2/edge1; the second app gets its own certificate from the CA.
#[tokio::test]
async fn story_edge_names_are_scoped_to_their_app() {
    let provisioning = FsStore::new();
    let root = provisioned_root(&provisioning).await;
    let app2_dir = root.path().join("dev1").join("app2");
    provision_node(&provisioning, &app2_dir, "app2", Tier::App).await;

    let store = Arc::new(FlakyWrites::new(files::X509, 2));
    let app1_edge = edge_dir(root.path(), "edge1");
    let app2_edge = app2_dir.join("edge1");
    write_metadata(store.as_ref(), &app1_edge, "edge1", "u1", Tier::Edge).await;
    write_metadata(store.as_ref(), &app2_edge, "edge1", "u2", Tier::Edge).await;

    let mut api = MockProvisionApi::new();
    signing_api_for(&mut api, "app1", "u1", 1);
    signing_api_for(&mut api, "app2", "u2", 1);

    let svc = service(root.path(), store.clone(), api, MockProxyDirectory::new(), real_csr());

    let err = svc.get_cert("dev1", "app1", "edge1").await.unwrap_err();
    let held = err.unsaved_certificate().cloned().expect("app1 certificate must be held");
    assert_eq!(held.edge_dir, app1_edge);

    let meta = svc.get_cert("dev1", "app2", "edge1").await.unwrap();
    assert_eq!(meta.uid, "u2");

    let app2_cert = read_file(store.as_ref(), &app2_edge.join(files::X509)).await.unwrap();
    assert_ne!(app2_cert, held.payload.x509.as_bytes(), "app1 certificate leaked into app2");
    assert!(svc.pending_certificate(&app2_edge).is_none());

    let still_held = svc.pending_certificate(&app1_edge).expect("app1 entry must survive");
    assert_eq!(still_held.payload.x509, held.payload.x509);
    assert!(!store.exists(&app1_edge.join(files::X509)).await);
}

/// Story: a failed re-issue leaves the working credential alone
///
/// The new key is only written together with the certificate issued for it,
/// so a CA failure neither replaces the key nor leaves a stray CSR.
#[tokio::test]
async fn story_failed_reissue_keeps_existing_credential() {
    let store = Arc::new(FsStore::new());
    let root = provisioned_root(store.as_ref()).await;
    let dir = edge_dir(root.path(), "edge1");
    write_metadata(store.as_ref(), &dir, "edge1", "u1", Tier::Edge).await;

    let ca = TestAuthority::new("ca.beameio.net");
    let calls = AtomicU32::new(0);
    let mut api = MockProvisionApi::new();
    api.expect_get_cert().times(2).returning(move |req| {
        if calls.fetch_add(1, Ordering::SeqCst) == 0 {
            Ok(json!({"x509": ca.sign_csr(&req.body.csr)}))
        } else {
            Err(RemoteError::new(Some(500), "signer offline"))
        }
    });

    let keys = Arc::new(Mutex::new(Vec::new()));
    let svc = service(
        root.path(),
        store.clone(),
        api,
        MockProxyDirectory::new(),
        recording_csr(keys.clone()),
    );

    svc.get_cert("dev1", "app1", "edge1").await.unwrap();
    let key_before = read_file(store.as_ref(), &dir.join(files::PRIVATE_KEY)).await.unwrap();
    let cert_before = read_file(store.as_ref(), &dir.join(files::X509)).await.unwrap();
    assert_eq!(key_before, keys.lock().unwrap()[0].as_bytes());

    let err = svc.get_cert("dev1", "app1", "edge1").await.unwrap_err();
    assert!(matches!(err, Error::CertIssuance { .. }));

    let keys = keys.lock().unwrap().clone();
    assert_eq!(keys.len(), 2);
    let key_after = read_file(store.as_ref(), &dir.join(files::PRIVATE_KEY)).await.unwrap();
    assert_eq!(key_after, key_before);
    assert_ne!(key_after, keys[1].as_bytes(), "unsigned key must not be written");
    assert_eq!(read_file(store.as_ref(), &dir.join(files::X509)).await.unwrap(), cert_before);
    assert!(!store.exists(&dir.join(files::CSR)).await, "CSR must be cleaned up");

    let credential = svc.load_credential("dev1", "app1", Some("edge1")).await.unwrap();
    assert!(credential.has_certificate());
    assert!(credential.has_private_key());
}

#[tokio::test]
async fn test_malformed_issuance_response_removes_csr() {
    let store = Arc::new(FsStore::new());
    let root = provisioned_root(store.as_ref()).await;
    let dir = edge_dir(root.path(), "edge1");
    write_metadata(store.as_ref(), &dir, "edge1", "u1", Tier::Edge).await;

    let mut api = MockProvisionApi::new();
    api.expect_get_cert()
        .times(1)
        .returning(|_| Ok(json!({"ca": "-----BEGIN CERTIFICATE-----"})));

    let svc = service(root.path(), store.clone(), api, MockProxyDirectory::new(), real_csr());
    let err = svc.get_cert("dev1", "app1", "edge1").await.unwrap_err();

    assert!(matches!(err, Error::UnexpectedResponse { .. }));
    assert!(!store.exists(&dir.join(files::CSR)).await);
    assert!(!store.exists(&dir.join(files::PRIVATE_KEY)).await);
}

// =============================================================================
// Full pipeline
// =============================================================================

/// Story: create_edge_client registers and then issues in one call
#[tokio::test]
async fn story_create_edge_client_end_to_end() {
    let store = Arc::new(FsStore::new());
    let root = provisioned_root(store.as_ref()).await;

    let mut api = MockProvisionApi::new();
    api.expect_create_edge_client()
        .times(1)
        .returning(|_| Ok(json!({"hostname": "edge1.dev1.app1", "uid": "u1", "name": "kiosk"})));
    signing_api(&mut api, "u1", 1);

    let svc = service(root.path(), store, api, one_proxy(), real_csr());
    let meta = svc.create_edge_client("dev1", "app1").await.unwrap();

    assert_eq!(meta.fqdn, "edge1.dev1.app1");
    assert_eq!(meta.name.as_deref(), Some("kiosk"));

    let credential = svc
        .load_credential("dev1", "app1", Some("edge1.dev1.app1"))
        .await
        .unwrap();
    assert_eq!(credential.common_name().unwrap(), "edge1.dev1.app1");
    assert_eq!(credential.get("uid").as_deref(), Some("u1"));
}

#[tokio::test]
async fn test_concurrent_creates_for_different_edges() {
    let store = Arc::new(FsStore::new());
    let root = provisioned_root(store.as_ref()).await;

    let counter = Arc::new(AtomicU32::new(0));
    let mut api = MockProvisionApi::new();
    api.expect_create_edge_client().times(2).returning(move |_| {
        let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(json!({"hostname": format!("edge{}", n), "uid": format!("u{}", n)}))
    });
    let ca = TestAuthority::new("ca.beameio.net");
    api.expect_get_cert()
        .times(2)
        .returning(move |req| Ok(json!({"x509": ca.sign_csr(&req.body.csr)})));

    let svc = service(root.path(), store, api, one_proxy(), real_csr());
    let (a, b) = tokio::join!(
        svc.create_edge_client("dev1", "app1"),
        svc.create_edge_client("dev1", "app1"),
    );

    let mut names = vec![a.unwrap().fqdn, b.unwrap().fqdn];
    names.sort();
    assert_eq!(names, ["edge1", "edge2"]);

    for edge in ["edge1", "edge2"] {
        let credential = svc.load_credential("dev1", "app1", Some(edge)).await.unwrap();
        assert!(credential.has_certificate(), "{} should have a certificate", edge);
    }
}
