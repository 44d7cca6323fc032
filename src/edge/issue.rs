//! Edge client certificate issuance

use std::fmt;
use std::path::{Path, PathBuf};

use tracing::{debug, error, info, warn};

use super::EdgeClientService;
use crate::api::{ApiAction, ApiRequest, AuthToken, CertPayload, GetCertBody};
use crate::credential::{Credential, EntityMetadata};
use crate::error::UnsavedMaterial;
use crate::hierarchy::{ensure_parent_credentials, HostnameChain, Tier};
use crate::pki::CertRequest;
use crate::store::files;
use crate::{Error, Result};

/// Certificate material returned by the CA for one edge client
///
/// Carries the private key generated for the request, so the key and the
/// certificate that matches it are always written together.
#[derive(Clone)]
pub struct IssuedCertificate {
    /// Edge hostname
    pub hostname: String,
    /// Directory the material belongs in
    pub edge_dir: PathBuf,
    /// Private key the CSR was generated from
    pub private_key_pem: String,
    /// Signed material
    pub payload: CertPayload,
}

impl fmt::Debug for IssuedCertificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IssuedCertificate")
            .field("hostname", &self.hostname)
            .field("edge_dir", &self.edge_dir)
            .field("payload", &self.payload)
            .finish_non_exhaustive()
    }
}

impl EdgeClientService {
    /// Issue a certificate for an already registered edge client
    ///
    /// A fresh key pair and CSR are generated locally; only the CSR leaves
    /// the machine. Existing key material is left untouched until a new
    /// certificate has been issued. If an earlier call got a certificate for
    /// this edge directory but could not save it, that certificate is saved
    /// instead of requesting a new one.
    pub async fn get_cert(&self, developer: &str, app: &str, edge: &str) -> Result<EntityMetadata> {
        let chain = HostnameChain::new(developer, app, Some(edge))?;
        let paths = chain.paths(&self.config.root_dir);
        let edge_dir = paths
            .dir(Tier::Edge)
            .ok_or_else(|| Error::invalid_hostname(Tier::Edge, "edge client hostname missing"))?;
        let store = self.store.as_ref();

        let lock = self.lock_for(edge_dir);
        let _guard = lock.lock().await;

        info!(chain = %chain, "Requesting edge client certificate");
        let metadata = ensure_parent_credentials(store, &chain, &paths, Tier::Edge).await?;
        if metadata.uid.trim().is_empty() {
            return Err(Error::hierarchy(Tier::Edge, edge, "metadata has no uid"));
        }

        if let Some(issued) = self.pending_certificate(edge_dir) {
            info!(edge = %edge, dir = %edge_dir.display(), "Saving certificate issued by an earlier request");
            self.persist_certificate(&issued).await?;
            return self.reload(edge, edge_dir).await;
        }

        let auth = AuthToken::load(store, Tier::App, chain.app(), &paths.app_dir).await?;

        self.check_cancelled()?;
        let request = self
            .csr
            .generate(edge)
            .map_err(|e| Error::csr_generation(edge, e.to_string()))?;
        self.save_csr(edge, edge_dir, &request).await?;
        debug!(edge = %edge, "CSR generated");

        let payload = match self
            .request_certificate(edge, &request, &metadata.uid, auth)
            .await
            .and_then(CertPayload::from_response)
        {
            Ok(payload) => payload,
            Err(e) => {
                self.remove_csr(edge_dir).await;
                if let Error::CertIssuance { source, .. } = &e {
                    error!(edge = %edge, error = %source, "Certificate issuance failed");
                }
                return Err(e);
            }
        };

        let issued = IssuedCertificate {
            hostname: edge.to_string(),
            edge_dir: edge_dir.to_path_buf(),
            private_key_pem: request.private_key_pem().to_string(),
            payload,
        };
        info!(edge = %edge, "Certificate issued");

        // Held until written so a failed save can be retried without re-issuing
        self.pending.insert(issued.edge_dir.clone(), issued.clone());
        self.persist_certificate(&issued).await?;

        self.reload(edge, edge_dir).await
    }

    /// Write a previously issued certificate to its edge directory
    pub async fn save_issued_certificate(&self, issued: &IssuedCertificate) -> Result<()> {
        let lock = self.lock_for(&issued.edge_dir);
        let _guard = lock.lock().await;
        self.persist_certificate(issued).await
    }

    async fn request_certificate(
        &self,
        edge: &str,
        request: &CertRequest,
        uid: &str,
        auth: AuthToken,
    ) -> Result<serde_json::Value> {
        self.check_cancelled()?;
        self.remote(self.api.get_cert(ApiRequest {
            action: ApiAction::GetCert,
            body: GetCertBody {
                csr: request.csr_pem().to_string(),
                uid: uid.to_string(),
            },
            auth,
        }))
        .await?
        .map_err(|source| Error::CertIssuance {
            hostname: edge.to_string(),
            source,
        })
    }

    async fn save_csr(&self, edge: &str, edge_dir: &Path, request: &CertRequest) -> Result<()> {
        self.store
            .create_dir(edge_dir)
            .await
            .map_err(|e| Error::csr_generation(edge, format!("cannot create {}: {}", edge_dir.display(), e)))?;

        self.write_with_retry(&edge_dir.join(files::CSR), request.csr_pem().as_bytes())
            .await
            .map_err(|e| Error::csr_generation(edge, format!("cannot write {}: {}", files::CSR, e)))
    }

    async fn remove_csr(&self, edge_dir: &Path) {
        let csr_path = edge_dir.join(files::CSR);
        if let Err(e) = self.store.remove(&csr_path).await {
            warn!(path = %csr_path.display(), error = %e, "Could not remove CSR");
        }
    }

    async fn persist_certificate(&self, issued: &IssuedCertificate) -> Result<()> {
        let payload = &issued.payload;

        // Key and certificate are replaced as a pair; a partial write stays pending
        for (name, contents) in [
            (files::PRIVATE_KEY, Some(&issued.private_key_pem)),
            (files::X509, Some(&payload.x509)),
            (files::CA, payload.ca.as_ref()),
            (files::PKCS7, payload.pkcs7.as_ref()),
        ] {
            let Some(contents) = contents else {
                continue;
            };
            let path = issued.edge_dir.join(name);
            if let Err(e) = self.write_with_retry(&path, contents.as_bytes()).await {
                error!(edge = %issued.hostname, path = %path.display(), error = %e, "Issued certificate not saved");
                self.pending.insert(issued.edge_dir.clone(), issued.clone());
                return Err(Error::persistence(
                    &issued.hostname,
                    path,
                    e,
                    Some(UnsavedMaterial::Certificate(issued.clone())),
                ));
            }
        }

        self.pending.remove(&issued.edge_dir);
        self.remove_csr(&issued.edge_dir).await;

        info!(edge = %issued.hostname, dir = %issued.edge_dir.display(), "Certificate saved");
        Ok(())
    }

    async fn reload(&self, edge: &str, edge_dir: &Path) -> Result<EntityMetadata> {
        let credential = Credential::load(
            self.store.as_ref(),
            edge,
            edge_dir,
            &self.config.ca_domain_suffix,
        )
        .await;

        if !credential.has_certificate() {
            warn!(edge = %edge, status = ?credential.status(), "Saved certificate did not load");
        }

        credential
            .metadata()
            .cloned()
            .ok_or_else(|| Error::hierarchy(Tier::Edge, edge, "metadata not found"))
    }
}
