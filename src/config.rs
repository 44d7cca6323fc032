//! Provisioning configuration
//!
//! Environment access goes through [`EnvConfig`] so configuration can be
//! tested without touching process-global state.

use std::path::PathBuf;
use std::time::Duration;

use crate::retry::RetryConfig;

/// Default CA domain; certificates issued under it are "beame issued"
pub const DEFAULT_CA_DOMAIN_SUFFIX: &str = "beameio.net";

/// Default directory / load-balancer endpoint
pub const DEFAULT_LOAD_BALANCER_ENDPOINT: &str = "https://lb-dev.beameio.net";

/// Default provisioning API endpoint
pub const DEFAULT_PROVISION_API_ENDPOINT: &str = "https://prov-dev.beameio.net";

/// Default timeout for each remote call
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Read access to environment variables
#[cfg_attr(test, mockall::automock)]
pub trait EnvConfig: Send + Sync {
    /// Value of an environment variable, if set
    fn var(&self, name: &str) -> Option<String>;
}

/// Reads from the process environment
#[derive(Clone, Debug, Default)]
pub struct OsEnvConfig;

impl EnvConfig for OsEnvConfig {
    fn var(&self, name: &str) -> Option<String> {
        std::env::var(name).ok()
    }
}

/// Settings shared by every provisioning operation
#[derive(Clone, Debug, PartialEq)]
pub struct ProvisionConfig {
    /// Root of the credential directory tree
    pub root_dir: PathBuf,
    /// Directory service listing registration proxies
    pub load_balancer_endpoint: String,
    /// Registration / certificate authority endpoint
    pub provision_api_endpoint: String,
    /// Issuer domain that marks a certificate as beame issued
    pub ca_domain_suffix: String,
    /// Bound on each remote call
    pub request_timeout: Duration,
    /// Retries for directory queries
    pub directory_retry: RetryConfig,
    /// Retries for local writes after a remote side effect
    pub persist_retry: RetryConfig,
}

impl Default for ProvisionConfig {
    fn default() -> Self {
        Self {
            root_dir: PathBuf::from(".beame"),
            load_balancer_endpoint: DEFAULT_LOAD_BALANCER_ENDPOINT.to_string(),
            provision_api_endpoint: DEFAULT_PROVISION_API_ENDPOINT.to_string(),
            ca_domain_suffix: DEFAULT_CA_DOMAIN_SUFFIX.to_string(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            directory_retry: RetryConfig::default(),
            persist_retry: RetryConfig::default().with_initial_delay(Duration::from_millis(50)),
        }
    }
}

impl ProvisionConfig {
    /// Build a config from environment variables, falling back to defaults
    ///
    /// | Variable | Field |
    /// |---|---|
    /// | `BEAME_CREDS_DIR` | `root_dir` (else `$HOME/.beame`) |
    /// | `BEAME_LOAD_BALANCER` | `load_balancer_endpoint` |
    /// | `BEAME_PROVISION_API` | `provision_api_endpoint` |
    /// | `BEAME_CA_DOMAIN` | `ca_domain_suffix` |
    /// | `BEAME_REQUEST_TIMEOUT_SECS` | `request_timeout` |
    pub fn from_env(env: &dyn EnvConfig) -> Self {
        let defaults = Self::default();

        let root_dir = env
            .var("BEAME_CREDS_DIR")
            .map(PathBuf::from)
            .or_else(|| env.var("HOME").map(|home| PathBuf::from(home).join(".beame")))
            .unwrap_or(defaults.root_dir);

        let request_timeout = env
            .var("BEAME_REQUEST_TIMEOUT_SECS")
            .and_then(|s| s.parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or(defaults.request_timeout);

        Self {
            root_dir,
            load_balancer_endpoint: env
                .var("BEAME_LOAD_BALANCER")
                .unwrap_or(defaults.load_balancer_endpoint),
            provision_api_endpoint: env
                .var("BEAME_PROVISION_API")
                .unwrap_or(defaults.provision_api_endpoint),
            ca_domain_suffix: env
                .var("BEAME_CA_DOMAIN")
                .unwrap_or(defaults.ca_domain_suffix),
            request_timeout,
            ..defaults
        }
    }

    /// Override the credential root
    pub fn with_root_dir(mut self, root_dir: impl Into<PathBuf>) -> Self {
        self.root_dir = root_dir.into();
        self
    }
}
