//! OCI runtime bundle stores.
//!
//! Converts a pulled [`Image`] plus a finalized runtime spec into an OCI
//! runtime bundle (rootfs + `config.json`) on disk. Two interchangeable
//! strategies implement the same [`Bundler`] contract:
//!
//! - [`uncompressed::UncompressedBundler`]: extracts every layer into a
//!   fresh rootfs for each run. No extra disk beyond one extraction per
//!   run; higher per-run latency.
//! - [`overlay::OverlayBundler`]: caches extracted per-layer directories
//!   and unions them with an overlay mount. Faster starts, roughly double
//!   the on-disk footprint.
//!
//! The strategy is chosen once at startup by [`select_bundler`] and fixed
//! for the process lifetime; it is never switched mid-run.

pub mod digest;
pub mod image;
pub mod overlay;
pub mod uncompressed;

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::constants::{MAX_ROOTFS_SIZE, RUNS_DIR};
use crate::error::{Error, Result};
use crate::pull::Image;
use crate::spec::RuntimeSpec;

/// An OCI runtime bundle for one function run.
///
/// Exactly one bundle exists per run. It is exclusively owned by the run
/// that created it and removed again when the run ends, whether the run
/// succeeded, failed, or timed out.
#[derive(Debug)]
pub struct Bundle {
    run_id: String,
    path: PathBuf,
    rootfs: PathBuf,
    /// True when the rootfs is an overlay mount that must be unmounted
    /// before the bundle directory can be removed.
    overlay_mounted: bool,
    cleaned: AtomicBool,
}

impl Bundle {
    fn new(run_id: &str, path: PathBuf, rootfs: PathBuf, overlay_mounted: bool) -> Self {
        Self {
            run_id: run_id.to_string(),
            path,
            rootfs,
            overlay_mounted,
            cleaned: AtomicBool::new(false),
        }
    }

    /// The run this bundle belongs to.
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Bundle directory (contains `config.json` and the rootfs).
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Root filesystem directory within the bundle.
    pub fn rootfs(&self) -> &Path {
        &self.rootfs
    }

    /// Removes the bundle from disk.
    ///
    /// Idempotent: the removal runs at most once; later calls return `Ok`
    /// without touching the filesystem, so every exit path of a run may
    /// attempt cleanup safely.
    pub fn cleanup(&self) -> Result<()> {
        if self.cleaned.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        if self.overlay_mounted {
            unmount(&self.rootfs)?;
        }

        fs::remove_dir_all(&self.path).map_err(|e| Error::Cleanup {
            path: self.path.clone(),
            reason: e.to_string(),
        })?;
        debug!(run_id = %self.run_id, "removed bundle");
        Ok(())
    }
}

impl Drop for Bundle {
    fn drop(&mut self) {
        // Last line of defense; the run path calls cleanup() explicitly.
        if !self.cleaned.load(Ordering::SeqCst) {
            warn!(run_id = %self.run_id, "bundle dropped without cleanup");
            let _ = self.cleanup();
        }
    }
}

/// Creates an OCI runtime bundle from an image and a finalized spec.
#[async_trait]
pub trait Bundler: Send + Sync {
    /// The strategy name, for logs.
    fn name(&self) -> &str;

    /// Materializes the bundle for `run_id` and writes its `config.json`.
    async fn bundle(&self, image: &Image, run_id: &str, spec: &RuntimeSpec) -> Result<Bundle>;
}

/// Selects the bundling strategy for this process.
///
/// Probes whether overlayfs is usable at the cache location; if not, the
/// uncompressed strategy is used for the process lifetime.
pub fn select_bundler(cache_dir: &Path) -> Result<Box<dyn Bundler>> {
    if overlay::supported(cache_dir) {
        info!("using overlay bundler");
        Ok(Box::new(overlay::OverlayBundler::new(cache_dir)?))
    } else {
        info!("overlayfs unavailable, using uncompressed bundler");
        Ok(Box::new(uncompressed::UncompressedBundler::new(cache_dir)?))
    }
}

/// Returns the per-run bundle directory for `run_id`, creating it.
fn run_dir(cache_dir: &Path, run_id: &str) -> Result<PathBuf> {
    let dir = cache_dir.join(RUNS_DIR).join(run_id);
    fs::create_dir_all(&dir).map_err(|e| Error::BundleCreation(format!(
        "cannot create run dir {}: {}",
        dir.display(),
        e
    )))?;
    Ok(dir)
}

/// Serializes the finalized spec as the bundle's `config.json`.
fn write_spec(bundle_dir: &Path, spec: &RuntimeSpec) -> Result<()> {
    let json = serde_json::to_string_pretty(spec)
        .map_err(|e| Error::BundleCreation(format!("cannot serialize config.json: {}", e)))?;
    fs::write(bundle_dir.join("config.json"), json)
        .map_err(|e| Error::BundleCreation(format!("cannot write config.json: {}", e)))
}

/// Applies one uncompressed layer tar onto `rootfs`.
///
/// Handles OCI whiteouts (`.wh.` file deletions and `.wh..wh..opq` opaque
/// directories), rejects path traversal, and accumulates extracted size
/// into `total` against [`MAX_ROOTFS_SIZE`].
fn apply_layer(layer_tar: &Path, rootfs: &Path, total: &mut u64) -> Result<()> {
    let file = fs::File::open(layer_tar).map_err(|e| Error::CacheIo {
        path: layer_tar.to_path_buf(),
        reason: e.to_string(),
    })?;
    let mut archive = tar::Archive::new(file);
    archive.set_preserve_permissions(true);
    archive.set_unpack_xattrs(false);

    let fail = |e: std::io::Error| Error::BundleCreation(format!(
        "cannot extract layer {}: {}",
        layer_tar.display(),
        e
    ));

    for entry in archive.entries().map_err(fail)? {
        let mut entry = entry.map_err(fail)?;
        let path = entry.path().map_err(fail)?.into_owned();

        // SECURITY: reject traversal before any filesystem operation.
        let path_str = path.to_string_lossy();
        if path_str.starts_with('/') || path.components().any(|c| {
            matches!(c, std::path::Component::ParentDir)
        }) {
            return Err(Error::PathTraversal {
                path: path_str.to_string(),
            });
        }

        let filename = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
        let parent = path.parent().unwrap_or(Path::new(""));

        // Opaque whiteout: the directory's lower-layer contents vanish.
        if filename == ".wh..wh..opq" {
            let dir = rootfs.join(parent);
            if dir.exists() {
                for child in fs::read_dir(&dir).map_err(fail)? {
                    let child = child.map_err(fail)?.path();
                    let _ = fs::remove_file(&child);
                    let _ = fs::remove_dir_all(&child);
                }
            }
            continue;
        }

        // Plain whiteout: delete the named lower-layer entry.
        if let Some(target) = filename.strip_prefix(".wh.") {
            let target_path = rootfs.join(parent).join(target);
            if target_path.exists() {
                let _ = fs::remove_file(&target_path);
                let _ = fs::remove_dir_all(&target_path);
            }
            continue;
        }

        *total += entry.size();
        if *total > MAX_ROOTFS_SIZE {
            return Err(Error::ImageTooLarge {
                size: *total,
                limit: MAX_ROOTFS_SIZE,
            });
        }

        entry.unpack_in(rootfs).map_err(fail)?;
    }

    Ok(())
}

#[cfg(target_os = "linux")]
fn unmount(path: &Path) -> Result<()> {
    use std::ffi::CString;
    let c = CString::new(path.as_os_str().as_encoded_bytes()).map_err(|_| Error::Cleanup {
        path: path.to_path_buf(),
        reason: "path contains NUL".to_string(),
    })?;
    // MNT_DETACH: lazy unmount so cleanup cannot wedge on a busy mount.
    let rc = unsafe { libc::umount2(c.as_ptr(), libc::MNT_DETACH) };
    if rc != 0 {
        let err = std::io::Error::last_os_error();
        // Already unmounted is fine; cleanup must stay idempotent.
        if err.raw_os_error() != Some(libc::EINVAL) {
            return Err(Error::Cleanup {
                path: path.to_path_buf(),
                reason: format!("umount2: {}", err),
            });
        }
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn unmount(_path: &Path) -> Result<()> {
    Ok(())
}

#[cfg(test)]
pub(crate) mod testutil {
    //! Helpers for fabricating layer tars in tests.

    use std::path::Path;

    /// Builds an uncompressed tar with the given (path, contents) entries.
    ///
    /// Entry names are written straight into the header bytes, so hostile
    /// names (absolute paths, dot-dot components) survive into the archive;
    /// `append_data` would refuse them while building and the extraction
    /// checks would never see them.
    pub fn build_layer_tar(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        for (path, data) in entries {
            let mut header = tar::Header::new_gnu();
            {
                let name = &mut header.as_gnu_mut().unwrap().name;
                name[..path.len()].copy_from_slice(path.as_bytes());
            }
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append(&header, *data).unwrap();
        }
        builder.into_inner().unwrap()
    }

    /// Writes a layer tar to `dir` and returns its path.
    pub fn write_layer(dir: &Path, name: &str, entries: &[(&str, &[u8])]) -> std::path::PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, build_layer_tar(entries)).unwrap();
        path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_bundle_cleanup_exactly_once() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join("bundle");
        let rootfs = dir.join("rootfs");
        fs::create_dir_all(&rootfs).unwrap();

        let bundle = Bundle::new("run-1", dir.clone(), rootfs, false);
        bundle.cleanup().unwrap();
        assert!(!dir.exists());

        // Second call is a no-op, not an error.
        bundle.cleanup().unwrap();
    }

    #[test]
    fn test_bundle_drop_cleans_up() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join("bundle");
        fs::create_dir_all(dir.join("rootfs")).unwrap();

        {
            let _bundle = Bundle::new("run-2", dir.clone(), dir.join("rootfs"), false);
        }
        assert!(!dir.exists());
    }

    #[test]
    fn test_apply_layer_whiteout() {
        let temp = TempDir::new().unwrap();
        let rootfs = temp.path().join("rootfs");
        fs::create_dir_all(&rootfs).unwrap();
        let mut total = 0u64;

        let base = testutil::write_layer(
            temp.path(),
            "base.tar",
            &[("etc/keep.conf", b"keep"), ("etc/gone.conf", b"gone")],
        );
        apply_layer(&base, &rootfs, &mut total).unwrap();
        assert!(rootfs.join("etc/gone.conf").exists());

        let upper = testutil::write_layer(temp.path(), "upper.tar", &[("etc/.wh.gone.conf", b"")]);
        apply_layer(&upper, &rootfs, &mut total).unwrap();
        assert!(!rootfs.join("etc/gone.conf").exists());
        assert!(rootfs.join("etc/keep.conf").exists());
    }

    #[test]
    fn test_apply_layer_opaque_whiteout() {
        let temp = TempDir::new().unwrap();
        let rootfs = temp.path().join("rootfs");
        fs::create_dir_all(&rootfs).unwrap();
        let mut total = 0u64;

        let base = testutil::write_layer(
            temp.path(),
            "base.tar",
            &[("data/a.txt", b"a"), ("data/b.txt", b"b")],
        );
        apply_layer(&base, &rootfs, &mut total).unwrap();

        let upper = testutil::write_layer(
            temp.path(),
            "upper.tar",
            &[("data/.wh..wh..opq", b""), ("data/c.txt", b"c")],
        );
        apply_layer(&upper, &rootfs, &mut total).unwrap();
        assert!(!rootfs.join("data/a.txt").exists());
        assert!(!rootfs.join("data/b.txt").exists());
        assert!(rootfs.join("data/c.txt").exists());
    }

    #[test]
    fn test_apply_layer_rejects_traversal() {
        let temp = TempDir::new().unwrap();
        let rootfs = temp.path().join("rootfs");
        fs::create_dir_all(&rootfs).unwrap();
        let mut total = 0u64;

        let evil = testutil::write_layer(temp.path(), "evil.tar", &[("../escape", b"x")]);
        let err = apply_layer(&evil, &rootfs, &mut total).unwrap_err();
        assert!(matches!(err, Error::PathTraversal { .. }));
    }
}
