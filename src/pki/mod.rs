//! CSR generation and X.509 inspection
//!
//! Edge clients generate their key pair locally; only the CSR is sent to the
//! certificate authority. Certificates read back from disk are inspected here
//! to derive the common name, issuer and public key of a credential.

use aws_lc_rs::digest::{digest, SHA256};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
#[cfg(test)]
use mockall::automock;
use rcgen::{string::Ia5String, CertificateParams, DistinguishedName, DnType, DnValue, KeyPair, SanType};
use thiserror::Error;
use x509_parser::prelude::*;

/// PKI errors
#[derive(Debug, Error)]
pub enum PkiError {
    /// Hostname cannot be used as a certificate subject
    #[error("invalid subject: {0}")]
    InvalidSubject(String),

    /// CSR generation failed
    #[error("CSR generation failed: {0}")]
    CsrGenerationFailed(String),

    /// Key generation failed
    #[error("key generation failed: {0}")]
    KeyGenerationFailed(String),

    /// Certificate parsing error
    #[error("certificate parsing error: {0}")]
    ParseError(String),
}

/// Result type for PKI operations
pub type Result<T> = std::result::Result<T, PkiError>;

/// Locally generated key pair and CSR for one hostname
pub struct CertRequest {
    /// Private key PEM (kept on this machine)
    key_pem: String,
    /// CSR PEM (sent to the CA)
    csr_pem: String,
}

impl CertRequest {
    /// Generate a new key pair and a CSR whose subject is `hostname`
    pub fn new(hostname: &str) -> Result<Self> {
        let san = Ia5String::try_from(hostname.to_string())
            .map_err(|e| PkiError::InvalidSubject(format!("{}: {}", hostname, e)))?;

        let key_pair = KeyPair::generate().map_err(|e| {
            PkiError::KeyGenerationFailed(format!("failed to generate key for {}: {}", hostname, e))
        })?;

        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, DnValue::Utf8String(hostname.to_string()));
        params.distinguished_name = dn;
        params.subject_alt_names = vec![SanType::DnsName(san)];

        let csr = params.serialize_request(&key_pair).map_err(|e| {
            PkiError::CsrGenerationFailed(format!("failed to create CSR: {}", e))
        })?;
        let csr_pem = csr.pem().map_err(|e| {
            PkiError::CsrGenerationFailed(format!("failed to serialize CSR: {}", e))
        })?;

        Ok(Self {
            key_pem: key_pair.serialize_pem(),
            csr_pem,
        })
    }

    /// CSR in PEM format
    pub fn csr_pem(&self) -> &str {
        &self.csr_pem
    }

    /// Private key in PEM format
    pub fn private_key_pem(&self) -> &str {
        &self.key_pem
    }
}

impl std::fmt::Debug for CertRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertRequest")
            .field("csr_pem", &self.csr_pem)
            .finish_non_exhaustive()
    }
}

/// Source of key pairs and CSRs
#[cfg_attr(test, automock)]
pub trait CsrGenerator: Send + Sync {
    /// Generate a key pair and CSR for `hostname`
    fn generate(&self, hostname: &str) -> Result<CertRequest>;
}

/// CSR generator backed by rcgen
#[derive(Clone, Debug, Default)]
pub struct RcgenCsrGenerator;

impl CsrGenerator for RcgenCsrGenerator {
    fn generate(&self, hostname: &str) -> Result<CertRequest> {
        CertRequest::new(hostname)
    }
}

/// Fields extracted from a parsed certificate
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CertificateInfo {
    /// Subject common name
    pub common_name: Option<String>,
    /// Issuer common name
    pub issuer_common_name: Option<String>,
    /// Issuer organization
    pub issuer_organization: Option<String>,
    /// DNS subject alternative names
    pub alt_names: Vec<String>,
    /// Serial number, colon-separated hex
    pub serial: String,
    /// Start of validity, unix seconds
    pub not_before: i64,
    /// End of validity, unix seconds
    pub not_after: i64,
    /// SubjectPublicKeyInfo as PEM
    pub public_key_pem: String,
    /// SHA-256 of the DER certificate, base64url
    pub fingerprint: String,
}

fn first_common_name(name: &X509Name<'_>) -> Option<String> {
    name.iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .map(str::to_string)
}

fn matches_domain(value: &str, suffix: &str) -> bool {
    let value = value.to_ascii_lowercase();
    let suffix = suffix.trim_start_matches('.').to_ascii_lowercase();
    !suffix.is_empty() && (value == suffix || value.ends_with(&format!(".{}", suffix)))
}

impl CertificateInfo {
    /// Parse the first certificate in a PEM document
    pub fn from_pem(pem_data: &str) -> Result<Self> {
        let block = ::pem::parse(pem_data.as_bytes())
            .map_err(|e| PkiError::ParseError(format!("failed to parse PEM: {}", e)))?;
        if block.tag() != "CERTIFICATE" {
            return Err(PkiError::ParseError(format!(
                "expected CERTIFICATE block, found {}",
                block.tag()
            )));
        }
        Self::from_der(block.contents())
    }

    /// Parse a DER certificate
    pub fn from_der(der: &[u8]) -> Result<Self> {
        let (_, cert) = X509Certificate::from_der(der)
            .map_err(|e| PkiError::ParseError(format!("failed to parse certificate: {}", e)))?;

        let alt_names = match cert.subject_alternative_name() {
            Ok(Some(ext)) => ext
                .value
                .general_names
                .iter()
                .filter_map(|name| match name {
                    GeneralName::DNSName(dns) => Some(dns.to_string()),
                    _ => None,
                })
                .collect(),
            _ => Vec::new(),
        };

        let issuer_organization = cert
            .issuer()
            .iter_organization()
            .next()
            .and_then(|o| o.as_str().ok())
            .map(str::to_string);

        let public_key_pem =
            ::pem::encode(&::pem::Pem::new("PUBLIC KEY", cert.public_key().raw.to_vec()));

        Ok(Self {
            common_name: first_common_name(cert.subject()),
            issuer_common_name: first_common_name(cert.issuer()),
            issuer_organization,
            alt_names,
            serial: cert.raw_serial_as_string(),
            not_before: cert.validity().not_before.timestamp(),
            not_after: cert.validity().not_after.timestamp(),
            public_key_pem,
            fingerprint: URL_SAFE_NO_PAD.encode(digest(&SHA256, der).as_ref()),
        })
    }

    /// Whether the issuer belongs to the CA domain `suffix`
    ///
    /// Matches the issuer common name or organization at a domain label
    /// boundary, so `ca.beameio.net` matches `beameio.net` but
    /// `notbeameio.net` does not.
    pub fn is_issued_under(&self, suffix: &str) -> bool {
        [&self.issuer_common_name, &self.issuer_organization]
            .into_iter()
            .flatten()
            .any(|value| matches_domain(value, suffix))
    }
}
