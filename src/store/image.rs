//! Content-addressed image cache.
//!
//! Caches pulled image manifests, configs, and **uncompressed** layer tar
//! archives on disk, keyed by digest. Uncompressed storage lets bundlers
//! extract layers without paying gunzip cost on every run.
//!
//! ## Storage Model
//!
//! ```text
//! <cache>/images/
//! ├── manifests/sha256/ab/abcd1234...   (manifest JSON, keyed by image digest)
//! ├── configs/sha256/cd/cdef5678...     (config JSON, keyed by config digest)
//! └── layers/sha256/ef/ef9a0b1c...      (uncompressed tar, keyed by the
//!                                        manifest's compressed layer digest)
//! ```
//!
//! The first two hex characters form a shard directory to prevent filesystem
//! performance degradation with many files.
//!
//! ## Security Model
//!
//! - **Digest verification**: every blob's content hash is computed and
//!   compared against the supplied digest before storage. A mismatch is a
//!   pull failure, never a cache write.
//! - **Path traversal protection**: digests are validated (sha256 + hex
//!   only) before constructing paths.
//! - **Atomic writes**: temp file + rename, so concurrent readers never
//!   observe a partially written entry and concurrent writers of the same
//!   digest converge on identical content.

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::constants::{IMAGE_CACHE_DIR, MAX_LAYER_SIZE};
use crate::error::{Error, Result};

/// An OCI content descriptor, as it appears in a manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    pub media_type: String,
    pub digest: String,
    pub size: u64,
}

/// The subset of an OCI image manifest the runner consumes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    #[serde(default)]
    pub schema_version: u32,
    pub config: Descriptor,
    pub layers: Vec<Descriptor>,
}

impl Manifest {
    /// Parses a manifest from its raw JSON bytes.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes)
            .map_err(|e| Error::ResponseDecode(format!("manifest: {}", e)))
    }
}

/// The subset of an OCI image config the runner consumes when building the
/// container entrypoint.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImageConfig {
    #[serde(default)]
    pub config: RuntimeConfig,
}

/// Process defaults from the image config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RuntimeConfig {
    #[serde(default)]
    pub entrypoint: Vec<String>,
    #[serde(default)]
    pub cmd: Vec<String>,
    #[serde(default)]
    pub env: Vec<String>,
    #[serde(default)]
    pub working_dir: String,
}

impl ImageConfig {
    /// Parses an image config from its raw JSON bytes.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes)
            .map_err(|e| Error::ResponseDecode(format!("image config: {}", e)))
    }
}

/// Content-addressed store of manifests, configs, and uncompressed layers.
///
/// Shared across all concurrent runs; every write is atomic from the
/// perspective of a concurrent reader.
pub struct ImageStore {
    base_dir: PathBuf,
}

impl ImageStore {
    /// Creates an image store under the supplied cache directory.
    pub fn new(cache_dir: &Path) -> Result<Self> {
        let base_dir = cache_dir.join(IMAGE_CACHE_DIR);
        for sub in ["manifests", "configs", "layers"] {
            let dir = base_dir.join(sub);
            fs::create_dir_all(&dir).map_err(|e| Error::CacheIo {
                path: dir,
                reason: e.to_string(),
            })?;
        }
        Ok(Self { base_dir })
    }

    /// Returns the base directory of the store.
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    // =========================================================================
    // Layers
    // =========================================================================

    /// Checks whether a layer is cached.
    pub fn has_layer(&self, digest: &str) -> bool {
        self.entry_path("layers", digest).exists()
    }

    /// Path of a cached uncompressed layer tar. The file may not exist.
    pub fn layer_path(&self, digest: &str) -> PathBuf {
        self.entry_path("layers", digest)
    }

    /// Verifies and stores a fetched layer.
    ///
    /// `compressed` is the blob as served by the registry; its hash must
    /// match `digest`. Gzip layers are decompressed before storage so
    /// bundlers read plain tar. Returns the cached layer path.
    pub fn put_layer(&self, digest: &str, media_type: &str, compressed: &[u8]) -> Result<PathBuf> {
        verify_digest(digest, compressed)?;

        let tar = if media_type.ends_with("tar+gzip") || media_type.ends_with("tar.gzip") {
            let mut decoder = GzDecoder::new(compressed);
            let mut buf = Vec::new();
            // take() bounds decompression so a gzip bomb cannot fill the disk.
            decoder
                .by_ref()
                .take(MAX_LAYER_SIZE * 8)
                .read_to_end(&mut buf)
                .map_err(|e| Error::CacheIo {
                    path: self.layer_path(digest),
                    reason: format!("decompress: {}", e),
                })?;
            buf
        } else {
            compressed.to_vec()
        };

        let path = self.entry_path("layers", digest);
        self.write_atomic(&path, &tar)?;
        debug!(digest, bytes = tar.len(), "cached layer");
        Ok(path)
    }

    // =========================================================================
    // Manifests and configs
    // =========================================================================

    /// Verifies and stores a manifest by its image digest.
    pub fn put_manifest(&self, digest: &str, bytes: &[u8]) -> Result<()> {
        verify_digest(digest, bytes)?;
        self.write_atomic(&self.entry_path("manifests", digest), bytes)
    }

    /// Returns a cached manifest, if present.
    pub fn manifest(&self, digest: &str) -> Result<Option<Manifest>> {
        match fs::read(self.entry_path("manifests", digest)) {
            Ok(bytes) => Manifest::parse(&bytes).map(Some),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::CacheIo {
                path: self.entry_path("manifests", digest),
                reason: e.to_string(),
            }),
        }
    }

    /// Verifies and stores an image config by its digest.
    pub fn put_config(&self, digest: &str, bytes: &[u8]) -> Result<()> {
        verify_digest(digest, bytes)?;
        self.write_atomic(&self.entry_path("configs", digest), bytes)
    }

    /// Returns a cached image config, if present.
    pub fn config(&self, digest: &str) -> Result<Option<ImageConfig>> {
        match fs::read(self.entry_path("configs", digest)) {
            Ok(bytes) => ImageConfig::parse(&bytes).map(Some),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::CacheIo {
                path: self.entry_path("configs", digest),
                reason: e.to_string(),
            }),
        }
    }

    /// True when the manifest, its config, and every layer it names are all
    /// cached. Used by the `IfNotPresent` pull policy.
    pub fn complete(&self, digest: &str) -> Result<bool> {
        let Some(manifest) = self.manifest(digest)? else {
            return Ok(false);
        };
        if !self.entry_path("configs", &manifest.config.digest).exists() {
            return Ok(false);
        }
        Ok(manifest.layers.iter().all(|l| self.has_layer(&l.digest)))
    }

    // =========================================================================
    // Internals
    // =========================================================================

    /// Maps a digest to a sharded path under `kind`.
    ///
    /// # Security
    ///
    /// Validates the digest format so a hostile digest cannot traverse out
    /// of the store directory.
    fn entry_path(&self, kind: &str, digest: &str) -> PathBuf {
        let (algo, hash) = digest.split_once(':').unwrap_or(("sha256", digest));

        let safe_algo = match algo {
            "sha256" | "sha384" | "sha512" => algo,
            _ => {
                warn!(algo, "invalid digest algorithm, defaulting to sha256");
                "sha256"
            }
        };

        let safe_hash: String = hash.chars().filter(|c| c.is_ascii_hexdigit()).collect();
        if safe_hash.is_empty() {
            return self.base_dir.join(kind).join("invalid").join("empty");
        }

        let prefix = &safe_hash[..2.min(safe_hash.len())];
        self.base_dir
            .join(kind)
            .join(safe_algo)
            .join(prefix)
            .join(&safe_hash)
    }

    fn write_atomic(&self, path: &Path, data: &[u8]) -> Result<()> {
        if path.exists() {
            debug!(path = %path.display(), "cache entry already exists");
            return Ok(());
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| Error::CacheIo {
                path: parent.to_path_buf(),
                reason: e.to_string(),
            })?;
        }
        // Unique temp name: concurrent writers of the same digest use
        // different temp files and the final rename is atomic.
        let tmp = path.with_extension(format!("tmp.{}", uuid::Uuid::new_v4()));
        fs::write(&tmp, data).map_err(|e| Error::CacheIo {
            path: tmp.clone(),
            reason: e.to_string(),
        })?;
        fs::rename(&tmp, path).map_err(|e| {
            let _ = fs::remove_file(&tmp);
            Error::CacheIo {
                path: path.to_path_buf(),
                reason: e.to_string(),
            }
        })
    }
}

/// Verifies that `data` hashes to `digest`. Only SHA-256 is accepted so
/// every stored blob is verified.
fn verify_digest(digest: &str, data: &[u8]) -> Result<()> {
    let (algo, expected) = digest.split_once(':').unwrap_or(("sha256", digest));
    if algo != "sha256" {
        return Err(Error::PullFailed {
            reference: digest.to_string(),
            reason: format!("unsupported digest algorithm '{}'", algo),
        });
    }
    let computed = hex::encode(Sha256::digest(data));
    if computed != expected {
        return Err(Error::PullFailed {
            reference: digest.to_string(),
            reason: format!("digest mismatch: computed sha256:{}", computed),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn digest_of(data: &[u8]) -> String {
        format!("sha256:{}", hex::encode(Sha256::digest(data)))
    }

    #[test]
    fn test_layer_roundtrip_uncompressed_media() {
        let temp = TempDir::new().unwrap();
        let store = ImageStore::new(temp.path()).unwrap();

        let data = b"plain tar bytes";
        let digest = digest_of(data);
        let path = store
            .put_layer(&digest, "application/vnd.oci.image.layer.v1.tar", data)
            .unwrap();
        assert!(store.has_layer(&digest));
        assert_eq!(fs::read(path).unwrap(), data);
    }

    #[test]
    fn test_gzip_layer_stored_uncompressed() {
        use flate2::write::GzEncoder;
        use flate2::Compression;
        use std::io::Write;

        let temp = TempDir::new().unwrap();
        let store = ImageStore::new(temp.path()).unwrap();

        let tar = b"tar archive content";
        let mut enc = GzEncoder::new(Vec::new(), Compression::default());
        enc.write_all(tar).unwrap();
        let gz = enc.finish().unwrap();
        let digest = digest_of(&gz);

        let path = store
            .put_layer(&digest, "application/vnd.oci.image.layer.v1.tar+gzip", &gz)
            .unwrap();
        assert_eq!(fs::read(path).unwrap(), tar);
    }

    #[test]
    fn test_digest_mismatch_rejected() {
        let temp = TempDir::new().unwrap();
        let store = ImageStore::new(temp.path()).unwrap();

        let wrong = "sha256:0000000000000000000000000000000000000000000000000000000000000000";
        let err = store
            .put_layer(wrong, "application/vnd.oci.image.layer.v1.tar", b"data")
            .unwrap_err();
        assert!(matches!(err, Error::PullFailed { .. }));
        assert!(!store.has_layer(wrong));
    }

    #[test]
    fn test_completeness() {
        let temp = TempDir::new().unwrap();
        let store = ImageStore::new(temp.path()).unwrap();

        let config = br#"{"config":{}}"#.to_vec();
        let config_digest = digest_of(&config);
        let layer = b"layer tar".to_vec();
        let layer_digest = digest_of(&layer);

        let manifest = serde_json::json!({
            "schemaVersion": 2,
            "config": {
                "mediaType": "application/vnd.oci.image.config.v1+json",
                "digest": config_digest,
                "size": config.len(),
            },
            "layers": [{
                "mediaType": "application/vnd.oci.image.layer.v1.tar",
                "digest": layer_digest,
                "size": layer.len(),
            }],
        });
        let manifest_bytes = serde_json::to_vec(&manifest).unwrap();
        let manifest_digest = digest_of(&manifest_bytes);

        store.put_manifest(&manifest_digest, &manifest_bytes).unwrap();
        assert!(!store.complete(&manifest_digest).unwrap());

        store.put_config(&config_digest, &config).unwrap();
        assert!(!store.complete(&manifest_digest).unwrap());

        store
            .put_layer(&layer_digest, "application/vnd.oci.image.layer.v1.tar", &layer)
            .unwrap();
        assert!(store.complete(&manifest_digest).unwrap());
    }

    #[test]
    fn test_entry_path_is_sharded_and_safe() {
        let temp = TempDir::new().unwrap();
        let store = ImageStore::new(temp.path()).unwrap();

        let path = store.layer_path("sha256:abcd1234");
        let s = path.to_string_lossy();
        assert!(s.contains("sha256"));
        assert!(s.contains("/ab/"));
        assert!(s.ends_with("abcd1234"));

        // Traversal characters are stripped, not interpreted.
        let hostile = store.layer_path("sha256:../../etc/passwd");
        assert!(hostile.starts_with(store.base_dir()));
    }
}
