//! Proof that an entity's ancestry exists locally
//!
//! Nothing may be sent to the registration or certificate authority on
//! behalf of an entity until every ancestor's key and certificate are on
//! disk. Checks run strictly top-down and stop at the first failure.

use tracing::debug;

use super::{CredentialPaths, HostnameChain, Tier};
use crate::credential::EntityMetadata;
use crate::store::{files, CredentialStore};
use crate::{Error, Result};

/// Verify the chain down to `target` and return the target tier's metadata
///
/// Developer and app key material must exist (for tiers at or above
/// `target`). The target tier only needs its metadata: an edge client has
/// no certificate until issuance completes.
pub async fn ensure_parent_credentials<S: CredentialStore + ?Sized>(
    store: &S,
    chain: &HostnameChain,
    paths: &CredentialPaths,
    target: Tier,
) -> Result<EntityMetadata> {
    let target_hostname = chain
        .hostname(target)
        .ok_or_else(|| Error::invalid_hostname(target, format!("{} hostname missing", target)))?;
    let target_dir = paths
        .dir(target)
        .ok_or_else(|| Error::invalid_hostname(target, format!("{} hostname missing", target)))?;

    for tier in [Tier::Developer, Tier::App] {
        if tier > target {
            break;
        }
        // Both tiers are always present in a chain
        let (Some(hostname), Some(dir)) = (chain.hostname(tier), paths.dir(tier)) else {
            continue;
        };

        for name in files::NODE_FILES {
            if !store.exists(&dir.join(name)).await {
                return Err(Error::hierarchy(tier, hostname, format!("{} not found", name)));
            }
        }
        debug!(tier = %tier, hostname = %hostname, "Tier credentials present");
    }

    let metadata = EntityMetadata::load(store, target, target_hostname, target_dir).await?;
    debug!(chain = %chain, target = %target, uid = %metadata.uid, "Hierarchy validated");
    Ok(metadata)
}
