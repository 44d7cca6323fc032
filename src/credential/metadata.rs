//! Entity metadata stored next to each credential

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::api::RegistrationPayload;
use crate::hierarchy::Tier;
use crate::store::{files, read_string, CredentialStore};
use crate::{Error, Result};

/// Contents of `metadata.json`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityMetadata {
    /// Hostname of the entity
    #[serde(alias = "hostname")]
    pub fqdn: String,
    /// Unique id assigned by the registration authority
    pub uid: String,
    /// Hostname of the owning entity
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_fqdn: Option<String>,
    /// Display name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Tier of the entity
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub level: Option<Tier>,
}

impl EntityMetadata {
    /// Metadata for an edge client just registered under `parent_fqdn`
    pub fn for_registered_edge(payload: &RegistrationPayload, parent_fqdn: &str) -> Self {
        Self {
            fqdn: payload.hostname.clone(),
            uid: payload.uid.clone(),
            parent_fqdn: Some(parent_fqdn.to_string()),
            name: payload.name.clone(),
            level: Some(Tier::Edge),
        }
    }

    /// Case-insensitive field lookup
    pub fn get(&self, field: &str) -> Option<String> {
        match field.to_ascii_lowercase().as_str() {
            "fqdn" | "hostname" => Some(self.fqdn.clone()),
            "uid" => Some(self.uid.clone()),
            "parent_fqdn" => self.parent_fqdn.clone(),
            "name" => self.name.clone(),
            "level" => self.level.map(|t| t.to_string()),
            _ => None,
        }
    }

    /// Read `metadata.json` from `dir`
    ///
    /// A missing or unreadable file means the tier is not provisioned.
    pub async fn load<S: CredentialStore + ?Sized>(
        store: &S,
        tier: Tier,
        hostname: &str,
        dir: &Path,
    ) -> Result<Self> {
        let text = read_string(store, &dir.join(files::METADATA))
            .await
            .map_err(|e| Error::hierarchy(tier, hostname, format!("cannot read metadata: {}", e)))?
            .ok_or_else(|| Error::hierarchy(tier, hostname, "metadata not found"))?;

        serde_json::from_str(&text)
            .map_err(|e| Error::hierarchy(tier, hostname, format!("corrupt metadata: {}", e)))
    }

    /// Serialize to pretty JSON
    pub fn to_json_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }
}
