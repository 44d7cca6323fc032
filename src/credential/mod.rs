//! In-memory view of one entity's credential directory
//!
//! A [`Credential`] is a snapshot: it is built from whatever files exist on
//! disk and is replaced, not mutated, when the directory changes. Its
//! [`CredentialStatus`] is a pure function of the loaded files.

mod metadata;

use std::path::{Path, PathBuf};

use bitflags::bitflags;
use serde::Serialize;
use tracing::{debug, warn};

use crate::pki::CertificateInfo;
use crate::store::{files, read_string, CredentialStore};
use crate::{Error, Result};

pub use metadata::EntityMetadata;

bitflags! {
    /// Derived state of a credential
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct CredentialStatus: u32 {
        /// A certificate was loaded and parsed
        const HAS_CERT = 1 << 0;
        /// A private key file was loaded
        const HAS_PRIVATE_KEY = 1 << 1;
        /// Certificate issuer belongs to the system CA domain
        const BEAME_ISSUED = 1 << 2;
        /// Certificate issuer is outside the system CA domain
        const NON_BEAME_CERT = 1 << 3;
        /// No metadata file was read
        const DIR_NOT_READ = 1 << 4;
    }
}

impl CredentialStatus {
    /// Names of the set flags
    pub fn flag_names(&self) -> Vec<&'static str> {
        self.iter_names().map(|(name, _)| name).collect()
    }
}

/// What was found in a credential directory
#[derive(Clone, Copy, Debug)]
pub struct LoadedFiles<'a> {
    /// Parsed certificate, if one was loaded
    pub certificate: Option<&'a CertificateInfo>,
    /// Whether a private key file was loaded
    pub private_key: bool,
    /// Whether a metadata file was read
    pub metadata: bool,
}

/// Derive the status of a credential from its loaded files
pub fn compute_status(files: &LoadedFiles<'_>, ca_domain_suffix: &str) -> CredentialStatus {
    let mut status = CredentialStatus::empty();

    if let Some(cert) = files.certificate {
        status |= CredentialStatus::HAS_CERT;
        status |= if cert.is_issued_under(ca_domain_suffix) {
            CredentialStatus::BEAME_ISSUED
        } else {
            CredentialStatus::NON_BEAME_CERT
        };
    }
    if files.private_key {
        status |= CredentialStatus::HAS_PRIVATE_KEY;
    }
    if !files.metadata {
        status |= CredentialStatus::DIR_NOT_READ;
    }

    status
}

/// Lifecycle of a [`Credential`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoadState {
    /// Created empty, nothing read
    Uninitialized,
    /// Files read, status not yet derived
    DirRead,
    /// Status derived from the files
    StatusComputed,
}

/// Raw contents of a credential directory
#[derive(Clone, Debug, Default)]
pub struct DirContents {
    /// `x509.pem`
    pub x509: Option<String>,
    /// `private_key.pem`
    pub private_key: Option<String>,
    /// `ca.pem`
    pub ca: Option<String>,
    /// `pkcs7.pem`
    pub pkcs7: Option<String>,
    /// `csr.pem`
    pub csr: Option<String>,
    /// `metadata.json`
    pub metadata: Option<EntityMetadata>,
}

async fn read_optional<S: CredentialStore + ?Sized>(store: &S, dir: &Path, name: &str) -> Option<String> {
    match read_string(store, &dir.join(name)).await {
        Ok(contents) => contents,
        Err(e) => {
            warn!(dir = %dir.display(), file = name, error = %e, "Ignoring unreadable credential file");
            None
        }
    }
}

impl DirContents {
    /// Read every known file; missing or unreadable files are left empty
    pub async fn read<S: CredentialStore + ?Sized>(store: &S, dir: &Path) -> Self {
        let metadata = match read_optional(store, dir, files::METADATA).await {
            Some(text) => match serde_json::from_str(&text) {
                Ok(meta) => Some(meta),
                Err(e) => {
                    warn!(dir = %dir.display(), error = %e, "Ignoring corrupt metadata");
                    None
                }
            },
            None => None,
        };

        Self {
            x509: read_optional(store, dir, files::X509).await,
            private_key: read_optional(store, dir, files::PRIVATE_KEY).await,
            ca: read_optional(store, dir, files::CA).await,
            pkcs7: read_optional(store, dir, files::PKCS7).await,
            csr: read_optional(store, dir, files::CSR).await,
            metadata,
        }
    }
}

/// Credential record for one fqdn
#[derive(Clone, Debug)]
pub struct Credential {
    fqdn: String,
    dir: Option<PathBuf>,
    contents: DirContents,
    certificate: Option<CertificateInfo>,
    status: CredentialStatus,
    state: LoadState,
}

impl Credential {
    /// Empty record that has not read anything yet
    pub fn new(fqdn: impl Into<String>) -> Self {
        Self {
            fqdn: fqdn.into(),
            dir: None,
            contents: DirContents::default(),
            certificate: None,
            status: CredentialStatus::empty(),
            state: LoadState::Uninitialized,
        }
    }

    /// Load the record for `fqdn` from `dir`
    ///
    /// Never fails: absent files are reflected in the status.
    pub async fn load<S: CredentialStore + ?Sized>(
        store: &S,
        fqdn: &str,
        dir: &Path,
        ca_domain_suffix: &str,
    ) -> Self {
        let mut credential = Self::new(fqdn);
        credential.dir = Some(dir.to_path_buf());
        credential.contents = DirContents::read(store, dir).await;
        credential.state = LoadState::DirRead;
        credential.compute(ca_domain_suffix);
        credential
    }

    /// Record keyed by the common name of a standalone certificate
    pub fn from_x509(x509_pem: &str, ca_domain_suffix: &str) -> Result<Self> {
        let info = CertificateInfo::from_pem(x509_pem)
            .map_err(|e| Error::serialization(format!("invalid certificate: {}", e)))?;
        let fqdn = info
            .common_name
            .clone()
            .ok_or_else(|| Error::serialization("certificate has no common name"))?;

        let mut credential = Self::new(fqdn);
        credential.contents.x509 = Some(x509_pem.to_string());
        credential.state = LoadState::DirRead;
        credential.compute(ca_domain_suffix);
        Ok(credential)
    }

    fn compute(&mut self, ca_domain_suffix: &str) {
        self.certificate = self.contents.x509.as_deref().and_then(|pem| {
            match CertificateInfo::from_pem(pem) {
                Ok(info) => Some(info),
                Err(e) => {
                    warn!(fqdn = %self.fqdn, error = %e, "Certificate could not be parsed");
                    None
                }
            }
        });

        if let Some(cn) = self.certificate.as_ref().and_then(|c| c.common_name.as_deref()) {
            if cn != self.fqdn {
                warn!(fqdn = %self.fqdn, common_name = %cn, "Certificate common name does not match fqdn");
            }
        }

        self.status = compute_status(
            &LoadedFiles {
                certificate: self.certificate.as_ref(),
                private_key: self.contents.private_key.is_some(),
                metadata: self.contents.metadata.is_some(),
            },
            ca_domain_suffix,
        );
        self.state = LoadState::StatusComputed;

        debug!(fqdn = %self.fqdn, status = ?self.status, "Credential status computed");
    }

    /// Fqdn this record is keyed by
    pub fn fqdn(&self) -> &str {
        &self.fqdn
    }

    /// Directory the record was loaded from
    pub fn dir(&self) -> Option<&Path> {
        self.dir.as_deref()
    }

    /// Derived status flags
    pub fn status(&self) -> CredentialStatus {
        self.status
    }

    /// Load lifecycle state
    pub fn state(&self) -> LoadState {
        self.state
    }

    /// Whether a certificate was loaded and parsed
    pub fn has_certificate(&self) -> bool {
        self.status.contains(CredentialStatus::HAS_CERT)
    }

    /// Whether a private key was loaded
    pub fn has_private_key(&self) -> bool {
        self.status.contains(CredentialStatus::HAS_PRIVATE_KEY)
    }

    /// Whether a public key could be derived from the certificate
    pub fn has_public_key(&self) -> bool {
        self.certificate.is_some()
    }

    /// Common name of the loaded certificate
    pub fn common_name(&self) -> Result<&str> {
        self.certificate
            .as_ref()
            .and_then(|c| c.common_name.as_deref())
            .ok_or_else(|| Error::NoCertificateLoaded {
                fqdn: self.fqdn.clone(),
            })
    }

    /// DNS alternative names of the loaded certificate
    pub fn alt_names(&self) -> Result<&[String]> {
        self.certificate
            .as_ref()
            .map(|c| c.alt_names.as_slice())
            .ok_or_else(|| Error::NoCertificateLoaded {
                fqdn: self.fqdn.clone(),
            })
    }

    /// Public key derived from the certificate
    pub fn public_key_pem(&self) -> Option<&str> {
        self.certificate.as_ref().map(|c| c.public_key_pem.as_str())
    }

    /// Parsed certificate fields
    pub fn certificate_info(&self) -> Option<&CertificateInfo> {
        self.certificate.as_ref()
    }

    /// Certificate PEM
    pub fn x509_pem(&self) -> Option<&str> {
        self.contents.x509.as_deref()
    }

    /// Private key PEM
    pub fn private_key_pem(&self) -> Option<&str> {
        self.contents.private_key.as_deref()
    }

    /// Pending CSR, present only during issuance
    pub fn csr_pem(&self) -> Option<&str> {
        self.contents.csr.as_deref()
    }

    /// Entity metadata
    pub fn metadata(&self) -> Option<&EntityMetadata> {
        self.contents.metadata.as_ref()
    }

    /// Case-insensitive metadata lookup
    pub fn get(&self, field: &str) -> Option<String> {
        self.metadata().and_then(|m| m.get(field))
    }

    /// Serializable projection of the record; never includes the private key
    pub fn to_json(&self) -> CredentialJson {
        CredentialJson {
            fqdn: self.fqdn.clone(),
            status: self.status.flag_names(),
            common_name: self.certificate.as_ref().and_then(|c| c.common_name.clone()),
            issuer: self
                .certificate
                .as_ref()
                .and_then(|c| c.issuer_common_name.clone()),
            serial: self.certificate.as_ref().map(|c| c.serial.clone()),
            fingerprint: self.certificate.as_ref().map(|c| c.fingerprint.clone()),
            not_after: self.certificate.as_ref().map(|c| c.not_after),
            x509: self.contents.x509.clone(),
            ca: self.contents.ca.clone(),
            metadata: self.contents.metadata.clone(),
        }
    }
}

/// JSON view of a [`Credential`]
#[derive(Clone, Debug, Serialize)]
pub struct CredentialJson {
    /// Record fqdn
    pub fqdn: String,
    /// Set status flag names
    pub status: Vec<&'static str>,
    /// Certificate common name
    #[serde(skip_serializing_if = "Option::is_none")]
    pub common_name: Option<String>,
    /// Issuer common name
    #[serde(skip_serializing_if = "Option::is_none")]
    pub issuer: Option<String>,
    /// Certificate serial number
    #[serde(skip_serializing_if = "Option::is_none")]
    pub serial: Option<String>,
    /// Certificate fingerprint
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
    /// Certificate expiry, unix seconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub not_after: Option<i64>,
    /// Certificate PEM
    #[serde(skip_serializing_if = "Option::is_none")]
    pub x509: Option<String>,
    /// CA certificate PEM
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ca: Option<String>,
    /// Metadata
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<EntityMetadata>,
}
