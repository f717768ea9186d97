//! Image pulling with policy-driven caching.
//!
//! The [`CachingPuller`] is the single entry point for turning an image
//! reference into locally cached content. It resolves the reference to a
//! digest (from the reference itself, the digest cache, or the registry,
//! depending on [`ImagePullPolicy`]), downloads whatever the image cache is
//! missing, and returns an [`Image`] handle pointing at cached layer
//! archives.
//!
//! ## Security Model
//!
//! - References are validated before any network use (length, character
//!   allowlist, digest format).
//! - Every fetched blob is hash-verified before it is cached.
//! - Layer count and size are bounded by `MAX_LAYERS` and `MAX_LAYER_SIZE`.
//! - All network operations are bounded by `IMAGE_PULL_TIMEOUT`.
//! - Concurrent pulls of the same digest are serialized, so one download
//!   serves all waiters and the cache is written once.

use std::collections::HashMap;
use std::os::unix::io::AsRawFd;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use oci_distribution::client::{ClientConfig, ClientProtocol};
use oci_distribution::secrets::RegistryAuth;
use oci_distribution::{Client, Reference, RegistryOperation};
use serde::Deserialize;
use sha2::{Digest as _, Sha256};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info};

use crate::constants::{IMAGE_PULL_TIMEOUT, MAX_LAYERS, MAX_LAYER_SIZE, PULL_LOCKS_DIR};
use crate::error::{Error, Result};
use crate::protocol::{ImagePullAuth, ImagePullPolicy};
use crate::reference::ImageReference;
use crate::store::digest::DigestStore;
use crate::store::image::{Descriptor, ImageConfig, ImageStore, Manifest};

/// A pulled image layer, backed by an uncompressed tar in the image cache.
#[derive(Debug, Clone)]
pub struct Layer {
    /// Digest of the compressed blob, as named by the manifest.
    pub digest: String,
    /// Path of the cached uncompressed tar archive.
    pub archive: PathBuf,
}

/// Handle to an image whose content is fully present in the cache.
///
/// Layers are ordered bottom-to-top: `layers()[0]` is the base layer and
/// later layers override earlier ones during extraction.
#[derive(Debug, Clone)]
pub struct Image {
    digest: String,
    layers: Vec<Layer>,
    config: ImageConfig,
}

impl Image {
    /// Creates an image handle from cached content.
    pub fn new(digest: String, layers: Vec<Layer>, config: ImageConfig) -> Self {
        Self {
            digest,
            layers,
            config,
        }
    }

    /// Resolved content digest of the image manifest.
    pub fn digest(&self) -> &str {
        &self.digest
    }

    /// Layers in extraction order.
    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    /// Parsed image config.
    pub fn config(&self) -> &ImageConfig {
        &self.config
    }

    #[cfg(test)]
    pub(crate) fn for_tests(digest: &str, layers: Vec<Layer>) -> Self {
        Self::new(digest.to_string(), layers, ImageConfig::default())
    }
}

// =============================================================================
// Registry Client
// =============================================================================

/// Fetches image content from a registry.
///
/// The trait boundary exists so pull-policy behavior can be tested without
/// a registry; production code uses [`RemoteClient`].
#[async_trait]
pub trait RegistryClient: Send + Sync {
    /// Fetches the manifest for a reference, resolving multi-platform
    /// indexes to the host platform. Returns the raw manifest bytes and the
    /// registry-reported digest.
    async fn fetch_manifest(
        &self,
        reference: &ImageReference,
        auth: &ImagePullAuth,
    ) -> Result<(Vec<u8>, String)>;

    /// Fetches a blob (layer or config) named by a manifest descriptor.
    async fn fetch_blob(
        &self,
        reference: &ImageReference,
        descriptor: &Descriptor,
        auth: &ImagePullAuth,
    ) -> Result<Vec<u8>>;
}

/// Registry client backed by `oci-distribution` over HTTPS.
#[derive(Default)]
pub struct RemoteClient;

impl RemoteClient {
    /// Creates a remote registry client.
    pub fn new() -> Self {
        Self
    }

    fn client() -> Client {
        Client::new(ClientConfig {
            protocol: ClientProtocol::Https,
            ..Default::default()
        })
    }

    fn oci_reference(reference: &ImageReference) -> Result<Reference> {
        reference
            .to_string()
            .parse()
            .map_err(|e| Error::InvalidImageReference {
                reference: reference.to_string(),
                reason: format!("{}", e),
            })
    }
}

const MANIFEST_MEDIA_TYPES: &[&str] = &[
    "application/vnd.oci.image.manifest.v1+json",
    "application/vnd.oci.image.index.v1+json",
    "application/vnd.docker.distribution.manifest.v2+json",
    "application/vnd.docker.distribution.manifest.list.v2+json",
];

/// Minimal view of a manifest used to detect a multi-platform index.
#[derive(Deserialize)]
struct IndexProbe {
    #[serde(default)]
    manifests: Vec<IndexEntry>,
}

#[derive(Deserialize)]
struct IndexEntry {
    digest: String,
    #[serde(default)]
    platform: Option<IndexPlatform>,
}

#[derive(Deserialize)]
struct IndexPlatform {
    os: String,
    architecture: String,
}

/// OCI architecture name of the host.
fn host_arch() -> &'static str {
    match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        "arm" => "arm",
        other => other,
    }
}

#[async_trait]
impl RegistryClient for RemoteClient {
    async fn fetch_manifest(
        &self,
        reference: &ImageReference,
        auth: &ImagePullAuth,
    ) -> Result<(Vec<u8>, String)> {
        let oci_ref = Self::oci_reference(reference)?;
        let registry_auth = resolve_auth(reference, auth)?;
        let client = Self::client();

        let (bytes, digest) = client
            .pull_manifest_raw(&oci_ref, &registry_auth, MANIFEST_MEDIA_TYPES)
            .await
            .map_err(|e| Error::PullFailed {
                reference: reference.to_string(),
                reason: e.to_string(),
            })?;

        // A multi-platform index names per-platform manifests; resolve to
        // the host platform and fetch the real manifest.
        let probe: IndexProbe = serde_json::from_slice(&bytes).unwrap_or(IndexProbe {
            manifests: Vec::new(),
        });
        if probe.manifests.is_empty() {
            return Ok((bytes, digest));
        }

        let arch = host_arch();
        let entry = probe
            .manifests
            .iter()
            .find(|m| {
                m.platform
                    .as_ref()
                    .is_some_and(|p| p.os == "linux" && p.architecture == arch)
            })
            .ok_or_else(|| {
                let available: Vec<String> = probe
                    .manifests
                    .iter()
                    .filter_map(|m| m.platform.as_ref())
                    .map(|p| format!("{}/{}", p.os, p.architecture))
                    .collect();
                Error::PullFailed {
                    reference: reference.to_string(),
                    reason: format!(
                        "no manifest for linux/{}; available: {}",
                        arch,
                        available.join(", ")
                    ),
                }
            })?;

        debug!(
            reference = %reference,
            digest = %entry.digest,
            "resolved platform manifest from index"
        );

        let platform_ref = Self::oci_reference(&reference.with_digest(&entry.digest))?;
        client
            .pull_manifest_raw(&platform_ref, &registry_auth, MANIFEST_MEDIA_TYPES)
            .await
            .map_err(|e| Error::PullFailed {
                reference: reference.to_string(),
                reason: format!("platform manifest: {}", e),
            })
    }

    async fn fetch_blob(
        &self,
        reference: &ImageReference,
        descriptor: &Descriptor,
        auth: &ImagePullAuth,
    ) -> Result<Vec<u8>> {
        let oci_ref = Self::oci_reference(reference)?;
        let registry_auth = resolve_auth(reference, auth)?;
        let client = Self::client();

        client
            .auth(&oci_ref, &registry_auth, RegistryOperation::Pull)
            .await
            .map_err(|e| Error::AuthResolution {
                reference: reference.to_string(),
                reason: e.to_string(),
            })?;

        let desc = oci_distribution::manifest::OciDescriptor {
            digest: descriptor.digest.clone(),
            size: descriptor.size as i64,
            media_type: descriptor.media_type.clone(),
            urls: None,
            annotations: None,
        };

        let mut data = Vec::new();
        client
            .pull_blob(&oci_ref, &desc, &mut data)
            .await
            .map_err(|e| Error::PullFailed {
                reference: reference.to_string(),
                reason: format!("blob {}: {}", descriptor.digest, e),
            })?;
        Ok(data)
    }
}

/// Maps request credentials onto registry authentication.
///
/// Tokens win over basic credentials; an `auth` entry alone is rejected
/// because its encoding is owned by whoever produced it.
///
/// Token credentials ride the docker `<token>` username convention:
/// registries that hand out identity/registry tokens accept them as the
/// password for that reserved username.
fn resolve_auth(reference: &ImageReference, auth: &ImagePullAuth) -> Result<RegistryAuth> {
    if auth.is_anonymous() {
        return Ok(RegistryAuth::Anonymous);
    }
    if !auth.registry_token.is_empty() {
        return Ok(RegistryAuth::Basic(
            "<token>".to_string(),
            auth.registry_token.clone(),
        ));
    }
    if !auth.identity_token.is_empty() {
        return Ok(RegistryAuth::Basic(
            "<token>".to_string(),
            auth.identity_token.clone(),
        ));
    }
    if !auth.username.is_empty() && !auth.password.is_empty() {
        return Ok(RegistryAuth::Basic(
            auth.username.clone(),
            auth.password.clone(),
        ));
    }
    Err(Error::AuthResolution {
        reference: reference.to_string(),
        reason: "credentials must include a token or both username and password".to_string(),
    })
}

// =============================================================================
// Caching Puller
// =============================================================================

/// Policy-driven image puller over the digest and image caches.
pub struct CachingPuller {
    client: Box<dyn RegistryClient>,
    digests: DigestStore,
    images: ImageStore,
    default_registry: String,
    /// Per-digest locks serializing concurrent pulls within this process.
    inflight: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    /// Directory of per-digest lock files serializing pulls across
    /// processes sharing the cache.
    locks_dir: PathBuf,
}

impl CachingPuller {
    /// Creates a puller over the supplied cache directory.
    pub fn new(
        client: Box<dyn RegistryClient>,
        cache_dir: &std::path::Path,
        default_registry: &str,
    ) -> Result<Self> {
        let locks_dir = cache_dir.join(PULL_LOCKS_DIR);
        std::fs::create_dir_all(&locks_dir).map_err(|e| Error::CacheIo {
            path: locks_dir.clone(),
            reason: e.to_string(),
        })?;
        Ok(Self {
            client,
            digests: DigestStore::new(cache_dir)?,
            images: ImageStore::new(cache_dir)?,
            default_registry: default_registry.to_string(),
            inflight: Mutex::new(HashMap::new()),
            locks_dir,
        })
    }

    /// Resolves a reference to a fully cached [`Image`] under the supplied
    /// pull policy.
    ///
    /// ## Policy Behavior
    ///
    /// | Policy | Digest source | Network |
    /// |--------|---------------|---------|
    /// | `Never` | reference pin or digest cache | never |
    /// | `IfNotPresent` | cache when complete, else registry | on cache miss |
    /// | `Always` | registry | always (cached layers still reused) |
    pub async fn image(
        &self,
        raw_reference: &str,
        policy: ImagePullPolicy,
        auth: &ImagePullAuth,
    ) -> Result<Image> {
        let reference = ImageReference::parse(raw_reference, &self.default_registry)?;

        // Resolve the digest, fetching the manifest at most once.
        let mut fetched: Option<(Vec<u8>, String)> = None;
        let digest = match reference.digest() {
            Some(pinned) => pinned.to_string(),
            None => match policy {
                ImagePullPolicy::Never => {
                    self.digests
                        .hash(&reference)?
                        .ok_or_else(|| Error::NotCached {
                            reference: reference.to_string(),
                        })?
                }
                ImagePullPolicy::IfNotPresent => match self.digests.hash(&reference)? {
                    Some(d) if self.images.complete(&d)? => d,
                    _ => {
                        let (bytes, d) =
                            self.client.fetch_manifest(&reference, auth).await?;
                        fetched = Some((bytes, d.clone()));
                        d
                    }
                },
                ImagePullPolicy::Always => {
                    let (bytes, d) = self.client.fetch_manifest(&reference, auth).await?;
                    fetched = Some((bytes, d.clone()));
                    d
                }
            },
        };

        // Single flight: one download populates the cache for all waiters.
        // Every run happens in its own sandbox process, so the in-process
        // mutex alone cannot exclude anything; the file lock does the real
        // work and the mutex keeps one process from piling blocked threads
        // onto it.
        let _guard = self.lock(&digest).await;
        let _flock = self.lock_shared_cache(&digest).await?;

        if self.images.complete(&digest)? {
            debug!(reference = %reference, digest, "image cache hit");
        } else if policy == ImagePullPolicy::Never {
            return Err(Error::NotCached {
                reference: reference.to_string(),
            });
        } else {
            let (manifest_bytes, reported) = match fetched {
                Some(f) => f,
                None => self.client.fetch_manifest(&reference, auth).await?,
            };
            if reported != digest {
                return Err(Error::PullFailed {
                    reference: reference.to_string(),
                    reason: format!(
                        "registry resolved {} but {} was required",
                        reported, digest
                    ),
                });
            }
            self.pull(&reference, &digest, &manifest_bytes, auth).await?;
        }

        // Tag-to-digest mapping is recorded only after the content landed,
        // so `Never` can trust it.
        if reference.digest().is_none() {
            self.digests.record(&reference, &digest)?;
        }

        self.load(&digest)
    }

    /// Downloads everything the cache is missing for a manifest.
    async fn pull(
        &self,
        reference: &ImageReference,
        digest: &str,
        manifest_bytes: &[u8],
        auth: &ImagePullAuth,
    ) -> Result<()> {
        let manifest = Manifest::parse(manifest_bytes)?;
        if manifest.layers.len() > MAX_LAYERS {
            return Err(Error::PullFailed {
                reference: reference.to_string(),
                reason: format!(
                    "too many layers: {} > {}",
                    manifest.layers.len(),
                    MAX_LAYERS
                ),
            });
        }

        info!(
            reference = %reference,
            digest,
            layers = manifest.layers.len(),
            "pulling image"
        );

        for layer in &manifest.layers {
            if self.images.has_layer(&layer.digest) {
                debug!(digest = %layer.digest, "layer already cached");
                continue;
            }
            if layer.size > MAX_LAYER_SIZE {
                return Err(Error::ImageTooLarge {
                    size: layer.size,
                    limit: MAX_LAYER_SIZE,
                });
            }

            debug!(digest = %layer.digest, size = layer.size, "fetching layer");
            let blob = self.fetch_timed(reference, layer, auth).await?;
            self.images.put_layer(&layer.digest, &layer.media_type, &blob)?;
        }

        if self.images.config(&manifest.config.digest)?.is_none() {
            let blob = self.fetch_timed(reference, &manifest.config, auth).await?;
            self.images.put_config(&manifest.config.digest, &blob)?;
        }

        // The manifest is written last so a completeness check never
        // observes a manifest whose content is still in flight.
        self.images.put_manifest(digest, manifest_bytes)?;
        Ok(())
    }

    async fn fetch_timed(
        &self,
        reference: &ImageReference,
        descriptor: &Descriptor,
        auth: &ImagePullAuth,
    ) -> Result<Vec<u8>> {
        tokio::time::timeout(
            IMAGE_PULL_TIMEOUT,
            self.client.fetch_blob(reference, descriptor, auth),
        )
        .await
        .map_err(|_| Error::PullFailed {
            reference: reference.to_string(),
            reason: format!(
                "blob {} timed out after {:?}",
                descriptor.digest, IMAGE_PULL_TIMEOUT
            ),
        })?
    }

    /// Builds an [`Image`] handle from cached content.
    fn load(&self, digest: &str) -> Result<Image> {
        let manifest = self
            .images
            .manifest(digest)?
            .ok_or_else(|| Error::NotCached {
                reference: digest.to_string(),
            })?;
        let config = self
            .images
            .config(&manifest.config.digest)?
            .ok_or_else(|| Error::NotCached {
                reference: manifest.config.digest.clone(),
            })?;

        let layers = manifest
            .layers
            .iter()
            .map(|l| Layer {
                digest: l.digest.clone(),
                archive: self.images.layer_path(&l.digest),
            })
            .collect();

        Ok(Image::new(digest.to_string(), layers, config))
    }

    async fn lock(&self, digest: &str) -> OwnedMutexGuard<()> {
        let entry = {
            let mut map = self.inflight.lock().await;
            map.entry(digest.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        entry.lock_owned().await
    }

    /// Takes the cross-process lock for a digest. The lock file is named by
    /// a hash of the digest, so untrusted digest strings cannot name paths.
    async fn lock_shared_cache(&self, digest: &str) -> Result<PullLock> {
        let name = hex::encode(Sha256::digest(digest.as_bytes()));
        PullLock::acquire(self.locks_dir.join(format!("{}.lock", name))).await
    }
}

/// Held for the duration of a cache-filling pull.
///
/// Backed by an advisory `flock` on a per-digest file, so the exclusion
/// spans every runner process sharing the cache directory, not just tasks
/// inside one. Released when the descriptor closes on drop.
struct PullLock {
    _file: std::fs::File,
}

impl PullLock {
    async fn acquire(path: PathBuf) -> Result<Self> {
        let label = path.clone();
        let file = tokio::task::spawn_blocking(move || -> Result<std::fs::File> {
            let file = std::fs::File::create(&path).map_err(|e| Error::CacheIo {
                path: path.clone(),
                reason: e.to_string(),
            })?;
            if unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX) } != 0 {
                return Err(Error::CacheIo {
                    path,
                    reason: format!("flock: {}", std::io::Error::last_os_error()),
                });
            }
            Ok(file)
        })
        .await
        .map_err(|e| Error::CacheIo {
            path: label,
            reason: format!("lock task: {}", e),
        })??;
        Ok(Self { _file: file })
    }
}
