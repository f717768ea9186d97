//! Reference-to-digest map store.
//!
//! Persists the last-resolved content digest of each image reference so
//! pull-policy decisions (`Never`, `IfNotPresent`) can be made without
//! network access. Entries are written only after a successful pull.
//!
//! ## Storage Model
//!
//! One file per reference under `<cache>/digests/`, named by the SHA-256 of
//! the normalized reference string (references contain `/` and `:` and are
//! not safe as filenames). The file body is the digest, e.g.
//! `sha256:abcd...`. Writes are atomic via temp file + rename so concurrent
//! readers never observe a partial entry.

use std::fs;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tracing::debug;

use crate::constants::DIGEST_CACHE_DIR;
use crate::error::{Error, Result};
use crate::reference::ImageReference;

/// Persistent map from image reference to last-known content digest.
pub struct DigestStore {
    dir: PathBuf,
}

impl DigestStore {
    /// Creates a digest store under the supplied cache directory.
    pub fn new(cache_dir: &Path) -> Result<Self> {
        let dir = cache_dir.join(DIGEST_CACHE_DIR);
        fs::create_dir_all(&dir).map_err(|e| Error::CacheIo {
            path: dir.clone(),
            reason: e.to_string(),
        })?;
        Ok(Self { dir })
    }

    /// Returns the cached digest for a reference, if any. Never touches the
    /// network.
    pub fn hash(&self, reference: &ImageReference) -> Result<Option<String>> {
        let path = self.entry_path(reference);
        match fs::read_to_string(&path) {
            Ok(s) => {
                let digest = s.trim().to_string();
                // A corrupt entry is treated as absent rather than poisoning
                // every future policy decision for this reference.
                if digest.starts_with("sha256:")
                    && digest.len() == "sha256:".len() + 64
                    && digest["sha256:".len()..].chars().all(|c| c.is_ascii_hexdigit())
                {
                    Ok(Some(digest))
                } else {
                    debug!(reference = %reference, "discarding corrupt digest cache entry");
                    let _ = fs::remove_file(&path);
                    Ok(None)
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::CacheIo {
                path,
                reason: e.to_string(),
            }),
        }
    }

    /// Records the resolved digest for a reference. Called only after a
    /// successful pull.
    pub fn record(&self, reference: &ImageReference, digest: &str) -> Result<()> {
        let path = self.entry_path(reference);
        let tmp = path.with_extension(format!("tmp.{}", uuid::Uuid::new_v4()));
        fs::write(&tmp, digest).map_err(|e| Error::CacheIo {
            path: tmp.clone(),
            reason: e.to_string(),
        })?;
        fs::rename(&tmp, &path).map_err(|e| {
            let _ = fs::remove_file(&tmp);
            Error::CacheIo {
                path: path.clone(),
                reason: e.to_string(),
            }
        })?;
        debug!(reference = %reference, digest, "recorded digest");
        Ok(())
    }

    /// Forgets the cached digest for a reference, if present.
    pub fn forget(&self, reference: &ImageReference) -> Result<()> {
        let path = self.entry_path(reference);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::CacheIo {
                path,
                reason: e.to_string(),
            }),
        }
    }

    fn entry_path(&self, reference: &ImageReference) -> PathBuf {
        let key = hex::encode(Sha256::digest(reference.to_string().as_bytes()));
        self.dir.join(key)
    }
}
