//! Edge client provisioning
//!
//! [`EdgeClientService`] drives the pipelines that mint an edge client
//! under an existing developer and app:
//!
//! ```text
//! register_edge_client: validate -> gate(app) -> proxy -> CreateEdgeClient -> persist metadata
//! get_cert:             validate -> gate(edge) -> CSR -> GetCert -> persist certificate -> reload
//! create_edge_client:   register_edge_client, then get_cert for the assigned hostname
//! ```
//!
//! Steps run strictly in order and stop at the first failure. Cancellation
//! is checked between steps and raced against every remote call.

mod issue;
mod register;

#[cfg(test)]
mod tests;

use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::api::{ProvisionApi, ProxyDirectory, RemoteError};
use crate::config::ProvisionConfig;
use crate::credential::{Credential, EntityMetadata};
use crate::hierarchy::HostnameChain;
use crate::pki::CsrGenerator;
use crate::proxy::ProxySelector;
use crate::retry::retry_with_backoff;
use crate::store::CredentialStore;
use crate::{Error, Result};

pub use issue::IssuedCertificate;

/// Provisions edge clients under developer/app credentials held locally
pub struct EdgeClientService {
    config: ProvisionConfig,
    store: Arc<dyn CredentialStore>,
    api: Arc<dyn ProvisionApi>,
    proxies: ProxySelector,
    csr: Arc<dyn CsrGenerator>,
    /// Per-directory guards; registration locks the app dir, issuance the edge dir
    locks: DashMap<PathBuf, Arc<Mutex<()>>>,
    /// Certificates issued remotely but not yet written to disk, by edge dir
    pending: DashMap<PathBuf, IssuedCertificate>,
    cancel: CancellationToken,
}

impl EdgeClientService {
    /// Create a service over the given collaborators
    pub fn new(
        config: ProvisionConfig,
        store: Arc<dyn CredentialStore>,
        api: Arc<dyn ProvisionApi>,
        directory: Arc<dyn ProxyDirectory>,
        csr: Arc<dyn CsrGenerator>,
    ) -> Self {
        let proxies = ProxySelector::new(
            directory,
            config.directory_retry.clone(),
            config.request_timeout,
        );
        Self {
            config,
            store,
            api,
            proxies,
            csr,
            locks: DashMap::new(),
            pending: DashMap::new(),
            cancel: CancellationToken::new(),
        }
    }

    /// Use an externally owned cancellation token
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Token that aborts in-flight operations when cancelled
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Active configuration
    pub fn config(&self) -> &ProvisionConfig {
        &self.config
    }

    /// Register a new edge client, then issue its certificate
    pub async fn create_edge_client(&self, developer: &str, app: &str) -> Result<EntityMetadata> {
        let registered = self.register_edge_client(developer, app).await?;
        info!(
            developer = %developer,
            app = %app,
            edge = %registered.fqdn,
            "Edge client registered, requesting certificate"
        );
        self.get_cert(developer, app, &registered.fqdn).await
    }

    /// Load the credential record of the deepest tier named
    pub async fn load_credential(
        &self,
        developer: &str,
        app: &str,
        edge: Option<&str>,
    ) -> Result<Credential> {
        let chain = HostnameChain::new(developer, app, edge)?;
        let paths = chain.paths(&self.config.root_dir);
        let tier = chain.deepest_tier();
        let dir = paths
            .dir(tier)
            .ok_or_else(|| Error::invalid_hostname(tier, format!("{} hostname missing", tier)))?;

        Ok(Credential::load(
            self.store.as_ref(),
            chain.deepest_hostname(),
            dir,
            &self.config.ca_domain_suffix,
        )
        .await)
    }

    /// Certificate issued for the edge client in `edge_dir` that is still
    /// waiting to be saved
    ///
    /// Keyed by directory: edge hostnames are only unique under their app.
    pub fn pending_certificate(&self, edge_dir: &Path) -> Option<IssuedCertificate> {
        self.pending.get(edge_dir).map(|entry| entry.value().clone())
    }

    fn lock_for(&self, dir: &Path) -> Arc<Mutex<()>> {
        Arc::clone(&self.locks.entry(dir.to_path_buf()).or_default())
    }

    fn check_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        Ok(())
    }

    async fn cancellable<T>(&self, fut: impl Future<Output = Result<T>>) -> Result<T> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(Error::Cancelled),
            result = fut => result,
        }
    }

    /// Run a remote call bounded by the request timeout
    async fn remote<T>(
        &self,
        call: impl Future<Output = std::result::Result<T, RemoteError>>,
    ) -> Result<std::result::Result<T, RemoteError>> {
        let timeout = self.config.request_timeout;
        self.cancellable(async move {
            Ok(tokio::time::timeout(timeout, call)
                .await
                .unwrap_or_else(|_| Err(RemoteError::new(None, format!("timed out after {:?}", timeout)))))
        })
        .await
    }

    async fn write_with_retry(&self, path: &Path, contents: &[u8]) -> io::Result<()> {
        let store = self.store.as_ref();
        retry_with_backoff(
            &self.config.persist_retry,
            "credential write",
            |_: &io::Error| true,
            move || async move { store.write(path, contents).await },
        )
        .await
    }
}
