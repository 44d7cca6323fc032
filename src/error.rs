//! Error types for credential provisioning

use std::path::PathBuf;

use thiserror::Error;

use crate::api::{ApiAction, RegistrationPayload, RemoteError};
use crate::edge::IssuedCertificate;
use crate::hierarchy::Tier;

/// Remote material that was minted server-side but could not be written locally
#[derive(Debug, Clone)]
pub enum UnsavedMaterial {
    /// A registration succeeded but its metadata was not persisted
    Registration(RegistrationPayload),
    /// A certificate was issued but not persisted
    Certificate(IssuedCertificate),
}

/// Main error type for provisioning operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Hostname segment is empty or not a usable path component
    #[error("invalid {tier} hostname: {reason}")]
    InvalidHostname {
        /// Tier the hostname belongs to
        tier: Tier,
        /// Why it was rejected
        reason: String,
    },

    /// An ancestor tier's credentials are not present locally
    #[error("hierarchy validation failed for {tier} {hostname}: {reason}")]
    HierarchyValidation {
        /// Tier that failed validation
        tier: Tier,
        /// Hostname of that tier
        hostname: String,
        /// What is missing
        reason: String,
    },

    /// The directory service returned nothing usable
    #[error("no proxy available from {endpoint}: {reason}")]
    NoProxyAvailable {
        /// Directory endpoint that was queried
        endpoint: String,
        /// Failure detail
        reason: String,
    },

    /// Remote registration failed
    #[error("registration under {hostname} failed: {source}")]
    Registration {
        /// Parent hostname the registration was made under
        hostname: String,
        /// Remote failure
        #[source]
        source: RemoteError,
    },

    /// Remote service answered with a payload missing required fields
    #[error("unexpected response from {action}: {detail}")]
    UnexpectedResponse {
        /// Action that was called
        action: ApiAction,
        /// What was wrong with the payload
        detail: String,
    },

    /// CSR or key generation failed, nothing was sent remotely
    #[error("CSR generation for {hostname} failed: {reason}")]
    CsrGeneration {
        /// Hostname the CSR was for
        hostname: String,
        /// Failure detail
        reason: String,
    },

    /// Remote certificate issuance failed
    #[error("certificate issuance for {hostname} failed: {source}")]
    CertIssuance {
        /// Hostname the certificate was requested for
        hostname: String,
        /// Remote failure
        #[source]
        source: RemoteError,
    },

    /// Local write failed after a remote side effect already happened
    #[error("failed to persist {} for {hostname}: {source}", path.display())]
    Persistence {
        /// Hostname whose material was being written
        hostname: String,
        /// File or directory that could not be written
        path: PathBuf,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
        /// Material that must not be lost
        unsaved: Option<Box<UnsavedMaterial>>,
    },

    /// A certificate query was made on a record without a certificate
    #[error("no certificate loaded for {fqdn}")]
    NoCertificateLoaded {
        /// Record fqdn
        fqdn: String,
    },

    /// Operation was cancelled between steps
    #[error("operation cancelled")]
    Cancelled,

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl Error {
    /// Create an invalid hostname error
    pub fn invalid_hostname(tier: Tier, reason: impl Into<String>) -> Self {
        Self::InvalidHostname {
            tier,
            reason: reason.into(),
        }
    }

    /// Create a hierarchy validation error
    pub fn hierarchy(tier: Tier, hostname: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::HierarchyValidation {
            tier,
            hostname: hostname.into(),
            reason: reason.into(),
        }
    }

    /// Create a no-proxy error
    pub fn no_proxy(endpoint: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::NoProxyAvailable {
            endpoint: endpoint.into(),
            reason: reason.into(),
        }
    }

    /// Create an unexpected response error
    pub fn unexpected_response(action: ApiAction, detail: impl Into<String>) -> Self {
        Self::UnexpectedResponse {
            action,
            detail: detail.into(),
        }
    }

    /// Create a CSR generation error
    pub fn csr_generation(hostname: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::CsrGeneration {
            hostname: hostname.into(),
            reason: reason.into(),
        }
    }

    /// Create a persistence error
    pub fn persistence(
        hostname: impl Into<String>,
        path: impl Into<PathBuf>,
        source: std::io::Error,
        unsaved: Option<UnsavedMaterial>,
    ) -> Self {
        Self::Persistence {
            hostname: hostname.into(),
            path: path.into(),
            source,
            unsaved: unsaved.map(Box::new),
        }
    }

    /// Create a serialization error
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// Certificate that was issued remotely but not saved, if any
    pub fn unsaved_certificate(&self) -> Option<&IssuedCertificate> {
        match self {
            Self::Persistence { unsaved, .. } => match unsaved.as_deref() {
                Some(UnsavedMaterial::Certificate(issued)) => Some(issued),
                _ => None,
            },
            _ => None,
        }
    }

    /// Registration that succeeded remotely but was not saved, if any
    pub fn unsaved_registration(&self) -> Option<&RegistrationPayload> {
        match self {
            Self::Persistence { unsaved, .. } => match unsaved.as_deref() {
                Some(UnsavedMaterial::Registration(payload)) => Some(payload),
                _ => None,
            },
            _ => None,
        }
    }

    /// True for errors detected locally before any network call
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::InvalidHostname { .. } | Self::HierarchyValidation { .. }
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}
