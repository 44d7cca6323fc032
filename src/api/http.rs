//! HTTP implementations of the remote collaborators
//!
//! Requests present the parent entity's certificate and key as the TLS
//! client identity. A client is built per request from that request's
//! [`AuthToken`], so no identity leaks between operations.

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, info};

use super::{
    ApiRequest, AuthToken, CreateEdgeClientBody, GetCertBody, ProvisionApi, ProxyDirectory,
    ProxyEndpoint, RemoteError,
};

/// Join a base endpoint and a path without doubling slashes
pub(crate) fn join_url(base: &str, path: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), path.trim_start_matches('/'))
}

/// Provisioning API over HTTPS
#[derive(Clone, Debug)]
pub struct HttpProvisionApi {
    base_url: String,
    timeout: Duration,
    ca_cert_pem: Option<String>,
}

impl HttpProvisionApi {
    /// Create a client for the provisioning API at `base_url`
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            base_url: base_url.into(),
            timeout,
            ca_cert_pem: None,
        }
    }

    /// Trust an additional root CA when verifying the server
    pub fn with_ca_cert(mut self, ca_cert_pem: impl Into<String>) -> Self {
        self.ca_cert_pem = Some(ca_cert_pem.into());
        self
    }

    fn client_for(&self, auth: &AuthToken) -> Result<reqwest::Client, RemoteError> {
        let identity_pem = format!("{}\n{}", auth.cert_pem(), auth.key_pem());
        let identity = reqwest::Identity::from_pem(identity_pem.as_bytes())
            .map_err(|e| RemoteError::new(None, format!("invalid client identity: {}", e)))?;

        let mut builder = reqwest::Client::builder()
            .use_rustls_tls()
            .identity(identity)
            .timeout(self.timeout);

        if let Some(ca) = &self.ca_cert_pem {
            let ca_cert = reqwest::Certificate::from_pem(ca.as_bytes())
                .map_err(|e| RemoteError::new(None, format!("invalid CA certificate: {}", e)))?;
            builder = builder.add_root_certificate(ca_cert);
        }

        builder
            .build()
            .map_err(|e| RemoteError::new(None, format!("failed to build HTTP client: {}", e)))
    }

    async fn post<T: Serialize + Send + Sync>(
        &self,
        request: &ApiRequest<T>,
    ) -> Result<serde_json::Value, RemoteError> {
        let url = join_url(&self.base_url, request.action.path());
        info!(
            url = %url,
            action = %request.action,
            signer = %request.auth.signer_fqdn(),
            "Calling provisioning API"
        );

        let client = self.client_for(&request.auth)?;
        let response = client
            .post(&url)
            .json(&request.body)
            .send()
            .await
            .map_err(|e| RemoteError::new(None, e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RemoteError::new(Some(status.as_u16()), body));
        }

        response
            .json()
            .await
            .map_err(|e| RemoteError::new(Some(status.as_u16()), format!("invalid JSON body: {}", e)))
    }
}

#[async_trait]
impl ProvisionApi for HttpProvisionApi {
    async fn create_edge_client(
        &self,
        request: ApiRequest<CreateEdgeClientBody>,
    ) -> Result<serde_json::Value, RemoteError> {
        self.post(&request).await
    }

    async fn get_cert(
        &self,
        request: ApiRequest<GetCertBody>,
    ) -> Result<serde_json::Value, RemoteError> {
        self.post(&request).await
    }
}

/// Load-balancer directory over HTTPS
#[derive(Clone, Debug)]
pub struct HttpProxyDirectory {
    client: reqwest::Client,
}

impl HttpProxyDirectory {
    /// Create a directory client with the given request timeout
    pub fn new(timeout: Duration) -> Result<Self, RemoteError> {
        let client = reqwest::Client::builder()
            .use_rustls_tls()
            .timeout(timeout)
            .build()
            .map_err(|e| RemoteError::new(None, format!("failed to build HTTP client: {}", e)))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl ProxyDirectory for HttpProxyDirectory {
    async fn candidates(&self, endpoint: &str) -> Result<Vec<ProxyEndpoint>, RemoteError> {
        let url = join_url(endpoint, "/instances");
        debug!(url = %url, "Querying proxy directory");

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| RemoteError::new(None, e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RemoteError::new(Some(status.as_u16()), body));
        }

        response
            .json()
            .await
            .map_err(|e| RemoteError::new(Some(status.as_u16()), format!("invalid JSON body: {}", e)))
    }
}
