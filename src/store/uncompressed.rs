//! Uncompressed bundling strategy.
//!
//! Extracts every image layer into a fresh root filesystem for each run.
//! Simple and dependency-free: no mount privileges needed and no disk
//! beyond one full extraction per run, at the cost of re-extracting the
//! image every time.

use std::fs;

use async_trait::async_trait;
use std::path::PathBuf;
use tracing::debug;

use crate::error::{Error, Result};
use crate::pull::Image;
use crate::spec::RuntimeSpec;

use super::{apply_layer, run_dir, write_spec, Bundle, Bundler};

/// Bundler that materializes a rootfs by extracting all layers per run.
pub struct UncompressedBundler {
    cache_dir: PathBuf,
}

impl UncompressedBundler {
    /// Creates an uncompressed bundler rooted at the cache directory.
    pub fn new(cache_dir: &std::path::Path) -> Result<Self> {
        Ok(Self {
            cache_dir: cache_dir.to_path_buf(),
        })
    }
}

#[async_trait]
impl Bundler for UncompressedBundler {
    fn name(&self) -> &str {
        "uncompressed"
    }

    async fn bundle(&self, image: &Image, run_id: &str, spec: &RuntimeSpec) -> Result<Bundle> {
        let dir = run_dir(&self.cache_dir, run_id)?;

        // A half-built bundle must not outlive a failed build.
        let result = (|| {
            let rootfs = dir.join("rootfs");
            fs::create_dir_all(&rootfs).map_err(|e| {
                Error::BundleCreation(format!("cannot create rootfs: {}", e))
            })?;

            let mut total = 0u64;
            for layer in image.layers() {
                debug!(run_id, digest = %layer.digest, "extracting layer");
                apply_layer(&layer.archive, &rootfs, &mut total)?;
            }

            write_spec(&dir, spec)?;
            Ok(rootfs)
        })();

        match result {
            Ok(rootfs) => Ok(Bundle::new(run_id, dir, rootfs, false)),
            Err(e) => {
                let _ = fs::remove_dir_all(&dir);
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pull::{Image, Layer};
    use crate::spec::RuntimeSpec;
    use crate::store::testutil::write_layer;
    use sha2::{Digest as _, Sha256};
    use tempfile::TempDir;

    fn test_image(temp: &TempDir, layers: &[(&str, &[(&str, &[u8])])]) -> Image {
        let built: Vec<Layer> = layers
            .iter()
            .map(|(name, entries)| {
                let path = write_layer(temp.path(), name, entries);
                let digest = format!(
                    "sha256:{}",
                    hex::encode(Sha256::digest(std::fs::read(&path).unwrap()))
                );
                Layer {
                    digest,
                    archive: path,
                }
            })
            .collect();
        Image::for_tests("sha256:feed", built)
    }

    #[tokio::test]
    async fn test_bundle_extracts_ordered_layers() {
        let temp = TempDir::new().unwrap();
        let image = test_image(
            &temp,
            &[
                ("base.tar", &[("etc/conf", b"base" as &[u8])]),
                ("upper.tar", &[("etc/conf", b"upper"), ("bin/fn", b"elf")]),
            ],
        );

        let bundler = UncompressedBundler::new(temp.path()).unwrap();
        let spec = RuntimeSpec::base(&image, "run-1");
        let bundle = bundler.bundle(&image, "run-1", &spec).await.unwrap();

        // Later layers win.
        assert_eq!(
            std::fs::read(bundle.rootfs().join("etc/conf")).unwrap(),
            b"upper"
        );
        assert!(bundle.rootfs().join("bin/fn").exists());
        assert!(bundle.path().join("config.json").exists());

        bundle.cleanup().unwrap();
        assert!(!bundle.path().exists());
    }

    #[tokio::test]
    async fn test_failed_bundle_leaves_nothing() {
        let temp = TempDir::new().unwrap();
        let image = test_image(&temp, &[("evil.tar", &[("../escape", b"x" as &[u8])])]);

        let bundler = UncompressedBundler::new(temp.path()).unwrap();
        let spec = RuntimeSpec::base(&image, "run-2");
        let err = bundler.bundle(&image, "run-2", &spec).await.unwrap_err();
        assert!(matches!(err, Error::PathTraversal { .. }));
        assert!(!temp.path().join("runs/run-2").exists());
    }

    #[tokio::test]
    async fn test_concurrent_runs_are_isolated() {
        let temp = TempDir::new().unwrap();
        let image = test_image(&temp, &[("base.tar", &[("etc/conf", b"x" as &[u8])])]);
        let bundler = UncompressedBundler::new(temp.path()).unwrap();

        let spec_a = RuntimeSpec::base(&image, "run-a");
        let spec_b = RuntimeSpec::base(&image, "run-b");
        let (a, b) = tokio::join!(
            bundler.bundle(&image, "run-a", &spec_a),
            bundler.bundle(&image, "run-b", &spec_b),
        );
        let (a, b) = (a.unwrap(), b.unwrap());
        assert_ne!(a.path(), b.path());

        a.cleanup().unwrap();
        // Cleaning one run never touches the other.
        assert!(b.rootfs().join("etc/conf").exists());
        b.cleanup().unwrap();
    }
}
