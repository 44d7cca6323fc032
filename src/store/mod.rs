//! Low-level credential file persistence
//!
//! The orchestration layer only talks to storage through [`CredentialStore`],
//! so tests can inject failing or recording stores.

use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use tracing::debug;

/// File names inside a credential directory
pub mod files {
    /// PEM private key
    pub const PRIVATE_KEY: &str = "private_key.pem";
    /// PEM X.509 certificate
    pub const X509: &str = "x509.pem";
    /// PEM issuing CA certificate
    pub const CA: &str = "ca.pem";
    /// PKCS#7 certificate chain
    pub const PKCS7: &str = "pkcs7.pem";
    /// Transient certificate signing request
    pub const CSR: &str = "csr.pem";
    /// JSON metadata
    pub const METADATA: &str = "metadata.json";

    /// Files that prove a tier's credentials exist
    pub const NODE_FILES: [&str; 2] = [PRIVATE_KEY, X509];
}

/// Storage for credential directories
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Read a file; `Ok(None)` when it does not exist
    async fn read(&self, path: &Path) -> io::Result<Option<Vec<u8>>>;

    /// Whether a file or directory exists
    async fn exists(&self, path: &Path) -> bool;

    /// Write a file, replacing any previous contents
    async fn write(&self, path: &Path, contents: &[u8]) -> io::Result<()>;

    /// Create a directory and its parents; existing directories are fine
    async fn create_dir(&self, path: &Path) -> io::Result<()>;

    /// Remove a file; a missing file is fine
    async fn remove(&self, path: &Path) -> io::Result<()>;
}

/// Read a UTF-8 file; `Ok(None)` when it does not exist
pub async fn read_string<S: CredentialStore + ?Sized>(
    store: &S,
    path: &Path,
) -> io::Result<Option<String>> {
    match store.read(path).await? {
        Some(bytes) => String::from_utf8(bytes)
            .map(Some)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e)),
        None => Ok(None),
    }
}

/// Filesystem-backed store
#[derive(Clone, Debug, Default)]
pub struct FsStore;

impl FsStore {
    /// Create a new filesystem store
    pub fn new() -> Self {
        Self
    }
}

fn staging_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

#[async_trait]
impl CredentialStore for FsStore {
    async fn read(&self, path: &Path) -> io::Result<Option<Vec<u8>>> {
        match tokio::fs::read(path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn exists(&self, path: &Path) -> bool {
        tokio::fs::try_exists(path).await.unwrap_or(false)
    }

    async fn write(&self, path: &Path, contents: &[u8]) -> io::Result<()> {
        // Write-then-rename so readers never observe a half-written PEM
        let staging = staging_path(path);
        tokio::fs::write(&staging, contents).await?;
        tokio::fs::rename(&staging, path).await?;
        debug!(path = %path.display(), bytes = contents.len(), "Wrote credential file");
        Ok(())
    }

    async fn create_dir(&self, path: &Path) -> io::Result<()> {
        tokio::fs::create_dir_all(path).await
    }

    async fn remove(&self, path: &Path) -> io::Result<()> {
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}
