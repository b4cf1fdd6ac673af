//! Opaque blob storage for raw files
//!
//! The core never interprets blob refs; `put` hands back an opaque token and
//! `get` resolves it. The local implementation content-addresses files under
//! the platform data dir.

use sha2::{Digest, Sha256};
use std::path::PathBuf;

use crate::error::{Error, Result};

/// Storage for raw uploaded bytes
pub trait BlobStore: Send + Sync {
    /// Store bytes, returning an opaque blob ref
    fn put(&self, bytes: &[u8]) -> Result<String>;
    /// Fetch bytes by blob ref
    fn get(&self, blob_ref: &str) -> Result<Vec<u8>>;
}

/// Filesystem blob store; refs are sha-256 hex of the content
pub struct LocalBlobStore {
    root: PathBuf,
}

impl LocalBlobStore {
    /// Create a blob store rooted at an explicit directory
    pub fn new(root: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    /// Create a blob store under the platform data dir
    /// (~/.local/share/glean/blobs on Linux)
    pub fn default_location() -> Result<Self> {
        let root = dirs::data_dir()
            .ok_or_else(|| Error::Blob("No platform data directory".to_string()))?
            .join("glean")
            .join("blobs");
        Self::new(root)
    }

    fn path_for(&self, blob_ref: &str) -> Result<PathBuf> {
        // Refs are hex digests; reject anything that could traverse paths
        if blob_ref.is_empty() || !blob_ref.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(Error::Blob(format!("Malformed blob ref: {}", blob_ref)));
        }
        Ok(self.root.join(blob_ref))
    }
}

impl BlobStore for LocalBlobStore {
    fn put(&self, bytes: &[u8]) -> Result<String> {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        let blob_ref = hex::encode(hasher.finalize());

        let path = self.path_for(&blob_ref)?;
        if !path.exists() {
            std::fs::write(&path, bytes)?;
        }
        Ok(blob_ref)
    }

    fn get(&self, blob_ref: &str) -> Result<Vec<u8>> {
        let path = self.path_for(blob_ref)?;
        std::fs::read(&path).map_err(|e| {
            Error::Blob(format!("Blob {} unreadable: {}", blob_ref, e))
        })
    }
}
