//! Remote provisioning API surface
//!
//! Requests to the registration and certificate authorities are built as
//! [`ApiRequest`] values that own their [`AuthToken`], so two operations
//! running concurrently for different entities never share auth state.

pub mod http;

use std::fmt;
use std::path::Path;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::hierarchy::Tier;
use crate::pki::CertificateInfo;
use crate::store::{files, read_string, CredentialStore};
use crate::{Error, Result};

/// Remote action
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ApiAction {
    /// Register a new edge client under an app
    CreateEdgeClient,
    /// Exchange a CSR for a signed certificate
    GetCert,
}

impl ApiAction {
    /// Path of the action relative to the provisioning endpoint
    pub fn path(&self) -> &'static str {
        match self {
            ApiAction::CreateEdgeClient => "/api/v1/edge/client/register",
            ApiAction::GetCert => "/api/v1/edge/client/getcert",
        }
    }
}

impl fmt::Display for ApiAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApiAction::CreateEdgeClient => f.write_str("CreateEdgeClient"),
            ApiAction::GetCert => f.write_str("GetCert"),
        }
    }
}

/// Failure reported by (or while reaching) a remote service
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("{}{}", status_prefix(.status), .message)]
pub struct RemoteError {
    /// HTTP status, if a response was received
    pub status: Option<u16>,
    /// Error detail
    pub message: String,
}

fn status_prefix(status: &Option<u16>) -> String {
    status.map(|s| format!("status {}: ", s)).unwrap_or_default()
}

impl RemoteError {
    /// Create a remote error
    pub fn new(status: Option<u16>, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

/// Credentials of the parent entity that authenticate a request
///
/// The child has no credentials yet, so requests on its behalf are made
/// with the parent's certificate and private key.
#[derive(Clone)]
pub struct AuthToken {
    signer_fqdn: String,
    cert_pem: String,
    key_pem: String,
    fingerprint: String,
}

impl AuthToken {
    /// Build a token from PEM material
    pub fn from_pem(
        signer_fqdn: impl Into<String>,
        cert_pem: impl Into<String>,
        key_pem: impl Into<String>,
    ) -> std::result::Result<Self, crate::pki::PkiError> {
        let cert_pem = cert_pem.into();
        let info = CertificateInfo::from_pem(&cert_pem)?;
        Ok(Self {
            signer_fqdn: signer_fqdn.into(),
            cert_pem,
            key_pem: key_pem.into(),
            fingerprint: info.fingerprint,
        })
    }

    /// Load the signer's certificate and key from its credential directory
    pub async fn load<S: CredentialStore + ?Sized>(
        store: &S,
        tier: Tier,
        signer_fqdn: &str,
        dir: &Path,
    ) -> Result<Self> {
        let cert_pem = read_required(store, tier, signer_fqdn, &dir.join(files::X509)).await?;
        let key_pem = read_required(store, tier, signer_fqdn, &dir.join(files::PRIVATE_KEY)).await?;

        Self::from_pem(signer_fqdn, cert_pem, key_pem).map_err(|e| {
            Error::hierarchy(tier, signer_fqdn, format!("unusable certificate: {}", e))
        })
    }

    /// Fqdn of the signing entity
    pub fn signer_fqdn(&self) -> &str {
        &self.signer_fqdn
    }

    /// Signer certificate PEM
    pub fn cert_pem(&self) -> &str {
        &self.cert_pem
    }

    /// Signer private key PEM
    pub fn key_pem(&self) -> &str {
        &self.key_pem
    }

    /// SHA-256 fingerprint of the signer certificate
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }
}

impl fmt::Debug for AuthToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Never expose key material in debug output
        f.debug_struct("AuthToken")
            .field("signer_fqdn", &self.signer_fqdn)
            .field("fingerprint", &self.fingerprint)
            .finish()
    }
}

async fn read_required<S: CredentialStore + ?Sized>(
    store: &S,
    tier: Tier,
    hostname: &str,
    path: &Path,
) -> Result<String> {
    let name = path.file_name().map(|n| n.to_string_lossy()).unwrap_or_default();
    read_string(store, path)
        .await
        .map_err(|e| Error::hierarchy(tier, hostname, format!("cannot read {}: {}", name, e)))?
        .ok_or_else(|| Error::hierarchy(tier, hostname, format!("{} not found", name)))
}

/// Authenticated request for one remote action
#[derive(Clone, Debug)]
pub struct ApiRequest<T> {
    /// Action being invoked
    pub action: ApiAction,
    /// JSON body
    pub body: T,
    /// Authentication context of this request only
    pub auth: AuthToken,
}

/// Body of a `CreateEdgeClient` request
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateEdgeClientBody {
    /// Proxy endpoint the edge client will be served through
    pub host: String,
}

/// Body of a `GetCert` request
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetCertBody {
    /// PEM CSR
    pub csr: String,
    /// Uid assigned at registration
    pub uid: String,
}

/// Result of a successful registration
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrationPayload {
    /// Server-assigned hostname of the new entity
    pub hostname: String,
    /// Server-assigned unique id
    pub uid: String,
    /// Display name, if the server sent one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

#[derive(Deserialize)]
struct RawRegistration {
    hostname: Option<String>,
    uid: Option<String>,
    name: Option<String>,
}

impl RegistrationPayload {
    /// Validate a raw `CreateEdgeClient` response
    pub fn from_response(value: serde_json::Value) -> Result<Self> {
        let action = ApiAction::CreateEdgeClient;
        let raw: RawRegistration = serde_json::from_value(value)
            .map_err(|e| Error::unexpected_response(action, e.to_string()))?;

        let hostname = raw
            .hostname
            .filter(|h| !h.is_empty())
            .ok_or_else(|| Error::unexpected_response(action, "response has no hostname"))?;
        let uid = raw
            .uid
            .filter(|u| !u.is_empty())
            .ok_or_else(|| Error::unexpected_response(action, "response has no uid"))?;

        Ok(Self {
            hostname,
            uid,
            name: raw.name,
        })
    }
}

/// Signed certificate material returned by the CA
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertPayload {
    /// Leaf certificate PEM
    pub x509: String,
    /// Issuing CA certificate PEM
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca: Option<String>,
    /// PKCS#7 chain
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pkcs7: Option<String>,
}

impl CertPayload {
    /// Validate a raw `GetCert` response
    pub fn from_response(value: serde_json::Value) -> Result<Self> {
        let payload: CertPayload = serde_json::from_value(value)
            .map_err(|e| Error::unexpected_response(ApiAction::GetCert, e.to_string()))?;
        if payload.x509.trim().is_empty() {
            return Err(Error::unexpected_response(
                ApiAction::GetCert,
                "response has an empty x509",
            ));
        }
        Ok(payload)
    }
}

/// Candidate registration proxy
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyEndpoint {
    /// Network address of the proxy
    pub endpoint: String,
}

/// Directory / load-balancer service listing registration proxies
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ProxyDirectory: Send + Sync {
    /// List candidate proxies known to the directory at `endpoint`
    async fn candidates(&self, endpoint: &str) -> std::result::Result<Vec<ProxyEndpoint>, RemoteError>;
}

/// Registration and certificate authority
///
/// Responses are returned raw; the caller validates required fields.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ProvisionApi: Send + Sync {
    /// Register a new edge client under the signing app
    async fn create_edge_client(
        &self,
        request: ApiRequest<CreateEdgeClientBody>,
    ) -> std::result::Result<serde_json::Value, RemoteError>;

    /// Submit a CSR for signing
    async fn get_cert(
        &self,
        request: ApiRequest<GetCertBody>,
    ) -> std::result::Result<serde_json::Value, RemoteError>;
}
