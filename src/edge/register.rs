//! Edge client registration

use std::path::Path;

use tracing::{debug, error, info};

use super::EdgeClientService;
use crate::api::{
    ApiAction, ApiRequest, AuthToken, CreateEdgeClientBody, RegistrationPayload,
};
use crate::credential::EntityMetadata;
use crate::error::UnsavedMaterial;
use crate::hierarchy::{ensure_parent_credentials, HostnameChain, Tier};
use crate::store::files;
use crate::{Error, Result};

impl EdgeClientService {
    /// Register a new edge client under `developer`/`app`
    ///
    /// The request is authenticated with the app's certificate and key. The
    /// server assigns the edge hostname; its directory is created and the
    /// metadata written there is returned.
    pub async fn register_edge_client(&self, developer: &str, app: &str) -> Result<EntityMetadata> {
        let chain = HostnameChain::new(developer, app, None)?;
        let paths = chain.paths(&self.config.root_dir);
        let store = self.store.as_ref();

        let lock = self.lock_for(&paths.app_dir);
        let _guard = lock.lock().await;

        info!(chain = %chain, "Registering edge client");
        ensure_parent_credentials(store, &chain, &paths, Tier::App).await?;
        let auth = AuthToken::load(store, Tier::App, chain.app(), &paths.app_dir).await?;

        self.check_cancelled()?;
        let proxy = self
            .cancellable(
                self.proxies
                    .select_best_proxy(&self.config.load_balancer_endpoint),
            )
            .await?;

        self.check_cancelled()?;
        let request = ApiRequest {
            action: ApiAction::CreateEdgeClient,
            body: CreateEdgeClientBody {
                host: proxy.endpoint,
            },
            auth,
        };
        let response = self
            .remote(self.api.create_edge_client(request))
            .await?
            .map_err(|source| {
                error!(app = %chain.app(), error = %source, "Edge client registration failed");
                Error::Registration {
                    hostname: chain.app().to_string(),
                    source,
                }
            })?;

        let payload = RegistrationPayload::from_response(response)?;
        info!(edge = %payload.hostname, uid = %payload.uid, "Edge client registered");

        self.store_registration(&chain, &payload).await
    }

    /// Save a registration that succeeded remotely but could not be written
    ///
    /// Takes the payload carried by a persistence error and writes the edge
    /// metadata without contacting the server again.
    pub async fn save_registration(
        &self,
        developer: &str,
        app: &str,
        payload: &RegistrationPayload,
    ) -> Result<EntityMetadata> {
        let chain = HostnameChain::new(developer, app, None)?;
        let paths = chain.paths(&self.config.root_dir);

        let lock = self.lock_for(&paths.app_dir);
        let _guard = lock.lock().await;

        self.store_registration(&chain, payload).await
    }

    async fn store_registration(
        &self,
        chain: &HostnameChain,
        payload: &RegistrationPayload,
    ) -> Result<EntityMetadata> {
        // The assigned hostname becomes a directory name
        let edge_chain = chain.with_edge(&payload.hostname).map_err(|e| {
            Error::unexpected_response(ApiAction::CreateEdgeClient, e.to_string())
        })?;
        let edge_paths = edge_chain.paths(&self.config.root_dir);
        let edge_dir = edge_paths.dir(Tier::Edge).ok_or_else(|| {
            Error::unexpected_response(ApiAction::CreateEdgeClient, "no edge hostname assigned")
        })?;

        let metadata = EntityMetadata::for_registered_edge(payload, chain.app());
        self.persist_registration(payload, &metadata, edge_dir).await?;

        ensure_parent_credentials(self.store.as_ref(), &edge_chain, &edge_paths, Tier::Edge).await
    }

    async fn persist_registration(
        &self,
        payload: &RegistrationPayload,
        metadata: &EntityMetadata,
        edge_dir: &Path,
    ) -> Result<()> {
        let unsaved = || Some(UnsavedMaterial::Registration(payload.clone()));

        self.store
            .create_dir(edge_dir)
            .await
            .map_err(|e| Error::persistence(&payload.hostname, edge_dir, e, unsaved()))?;

        let path = edge_dir.join(files::METADATA);
        let bytes = metadata.to_json_bytes()?;
        self.write_with_retry(&path, &bytes)
            .await
            .map_err(|e| Error::persistence(&payload.hostname, &path, e, unsaved()))?;

        debug!(path = %path.display(), "Edge metadata saved");
        Ok(())
    }
}
