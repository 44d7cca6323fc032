//! Developer → App → Edge naming hierarchy
//!
//! Every credential lives in a directory named after its hostname, nested
//! under its ancestors: `<root>/<developer>/<app>/<edge>/`. A child segment
//! is meaningless without all of its ancestors, so paths can only be built
//! from a [`HostnameChain`] whose segments have already been validated.

pub mod gate;

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

pub use gate::ensure_parent_credentials;

/// Tier of an entity in the naming hierarchy
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    /// Root identity owning apps
    Developer,
    /// Application ("atom") owned by a developer
    App,
    /// Leaf edge client owned by an app
    Edge,
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Tier::Developer => "developer",
            Tier::App => "app",
            Tier::Edge => "edge client",
        };
        f.write_str(name)
    }
}

/// Check that a hostname is usable as a tier name and a directory segment
///
/// Runs before any filesystem or network work.
pub fn validate_hostname(tier: Tier, name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(Error::invalid_hostname(tier, format!("{} hostname missing", tier)));
    }
    if name.contains('/') || name.contains('\\') {
        return Err(Error::invalid_hostname(
            tier,
            format!("'{}' contains a path separator", name),
        ));
    }
    if name == "." || name == ".." {
        return Err(Error::invalid_hostname(
            tier,
            format!("'{}' is not a hostname", name),
        ));
    }
    Ok(())
}

/// Validated (developer, app, edge?) hostname tuple
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HostnameChain {
    developer: String,
    app: String,
    edge: Option<String>,
}

impl HostnameChain {
    /// Validate segments strictly in developer → app → edge order
    pub fn new(developer: &str, app: &str, edge: Option<&str>) -> Result<Self> {
        validate_hostname(Tier::Developer, developer)?;
        validate_hostname(Tier::App, app)?;
        if let Some(edge) = edge {
            validate_hostname(Tier::Edge, edge)?;
        }
        Ok(Self {
            developer: developer.to_string(),
            app: app.to_string(),
            edge: edge.map(str::to_string),
        })
    }

    /// Chain for an edge client registered under this chain's app
    pub fn with_edge(&self, edge: &str) -> Result<Self> {
        validate_hostname(Tier::Edge, edge)?;
        Ok(Self {
            developer: self.developer.clone(),
            app: self.app.clone(),
            edge: Some(edge.to_string()),
        })
    }

    /// Developer hostname
    pub fn developer(&self) -> &str {
        &self.developer
    }

    /// App hostname
    pub fn app(&self) -> &str {
        &self.app
    }

    /// Edge hostname, when the chain reaches the edge tier
    pub fn edge(&self) -> Option<&str> {
        self.edge.as_deref()
    }

    /// Hostname of the given tier, if the chain reaches it
    pub fn hostname(&self, tier: Tier) -> Option<&str> {
        match tier {
            Tier::Developer => Some(&self.developer),
            Tier::App => Some(&self.app),
            Tier::Edge => self.edge.as_deref(),
        }
    }

    /// Deepest tier present in the chain
    pub fn deepest_tier(&self) -> Tier {
        if self.edge.is_some() {
            Tier::Edge
        } else {
            Tier::App
        }
    }

    /// Hostname of the deepest tier
    pub fn deepest_hostname(&self) -> &str {
        self.edge.as_deref().unwrap_or(&self.app)
    }

    /// Build directory paths for this chain under `root`
    pub fn paths(&self, root: &Path) -> CredentialPaths {
        let developer_dir = root.join(&self.developer);
        let app_dir = developer_dir.join(&self.app);
        let edge_dir = self.edge.as_ref().map(|edge| app_dir.join(edge));
        CredentialPaths {
            developer_dir,
            app_dir,
            edge_dir,
        }
    }
}

impl fmt::Display for HostnameChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.developer, self.app)?;
        if let Some(edge) = &self.edge {
            write!(f, "/{}", edge)?;
        }
        Ok(())
    }
}

/// Directory paths of every tier in a validated chain
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CredentialPaths {
    /// `<root>/<developer>/`
    pub developer_dir: PathBuf,
    /// `<root>/<developer>/<app>/`
    pub app_dir: PathBuf,
    /// `<root>/<developer>/<app>/<edge>/`
    pub edge_dir: Option<PathBuf>,
}

impl CredentialPaths {
    /// Directory of the given tier, if the chain reaches it
    pub fn dir(&self, tier: Tier) -> Option<&Path> {
        match tier {
            Tier::Developer => Some(&self.developer_dir),
            Tier::App => Some(&self.app_dir),
            Tier::Edge => self.edge_dir.as_deref(),
        }
    }
}
