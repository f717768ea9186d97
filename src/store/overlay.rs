//! Overlay bundling strategy.
//!
//! Caches each image layer as an extracted, overlay-ready directory (one
//! extraction per layer, amortized across runs) and builds a run's rootfs
//! as an overlay union mount over the ordered layer chain. Container starts
//! are fast once layers are cached, at the cost of roughly double the disk
//! footprint (the uncompressed layer tar cache plus these directories).
//!
//! ## Whiteout Translation
//!
//! OCI tar whiteouts (`.wh.` entries) are translated to overlayfs native
//! form during layer extraction: deletions become 0:0 character devices and
//! opaque markers become the `user.overlay.opaque` xattr, matching the
//! `userxattr` mount option used for rootless mounts.
//!
//! ## Capability Probe
//!
//! [`supported`] attempts a real overlay mount under the cache directory
//! once at startup. If the kernel or filesystem refuses it, the process
//! permanently falls back to the uncompressed strategy.

use std::fs;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::constants::{MAX_ROOTFS_SIZE, OVERLAY_CACHE_DIR};
use crate::error::{Error, Result};
use crate::pull::Image;
use crate::spec::RuntimeSpec;

use super::{run_dir, unmount, write_spec, Bundle, Bundler};

/// Bundler that unions cached layer directories with an overlay mount.
pub struct OverlayBundler {
    cache_dir: PathBuf,
    layers_dir: PathBuf,
}

impl OverlayBundler {
    /// Creates an overlay bundler rooted at the cache directory.
    pub fn new(cache_dir: &Path) -> Result<Self> {
        let layers_dir = cache_dir.join(OVERLAY_CACHE_DIR).join("layers");
        fs::create_dir_all(&layers_dir).map_err(|e| Error::CacheIo {
            path: layers_dir.clone(),
            reason: e.to_string(),
        })?;
        Ok(Self {
            cache_dir: cache_dir.to_path_buf(),
            layers_dir,
        })
    }

    /// Returns the cached overlay-ready directory for a layer, extracting
    /// it on first use.
    ///
    /// Extraction lands in a unique scratch directory that is renamed into
    /// place, so concurrent extractions of the same layer are benign: one
    /// rename wins, the rest are discarded.
    fn layer_dir(&self, digest: &str, archive: &Path) -> Result<PathBuf> {
        let safe: String = digest.chars().filter(|c| c.is_ascii_hexdigit()).collect();
        if safe.is_empty() {
            return Err(Error::BundleCreation(format!("invalid layer digest '{}'", digest)));
        }
        let dir = self.layers_dir.join(&safe);
        if dir.exists() {
            return Ok(dir);
        }

        let scratch = self
            .layers_dir
            .join(format!(".extract.{}", uuid::Uuid::new_v4()));
        fs::create_dir_all(&scratch).map_err(|e| Error::CacheIo {
            path: scratch.clone(),
            reason: e.to_string(),
        })?;

        if let Err(e) = extract_overlay_layer(archive, &scratch) {
            let _ = fs::remove_dir_all(&scratch);
            return Err(e);
        }

        match fs::rename(&scratch, &dir) {
            Ok(()) => {}
            // Lost the race to a concurrent extraction of the same digest.
            Err(_) if dir.exists() => {
                let _ = fs::remove_dir_all(&scratch);
            }
            Err(e) => {
                let _ = fs::remove_dir_all(&scratch);
                return Err(Error::CacheIo {
                    path: dir.clone(),
                    reason: e.to_string(),
                });
            }
        }

        debug!(digest, "cached overlay layer");
        Ok(dir)
    }
}

#[async_trait]
impl Bundler for OverlayBundler {
    fn name(&self) -> &str {
        "overlay"
    }

    async fn bundle(&self, image: &Image, run_id: &str, spec: &RuntimeSpec) -> Result<Bundle> {
        if image.layers().is_empty() {
            return Err(Error::BundleCreation("image has no layers".to_string()));
        }

        let mut lowers = Vec::with_capacity(image.layers().len());
        for layer in image.layers() {
            lowers.push(self.layer_dir(&layer.digest, &layer.archive)?);
        }

        let dir = run_dir(&self.cache_dir, run_id)?;
        let result = (|| {
            let upper = dir.join("upper");
            let work = dir.join("work");
            let rootfs = dir.join("rootfs");
            for d in [&upper, &work, &rootfs] {
                fs::create_dir_all(d).map_err(|e| {
                    Error::BundleCreation(format!("cannot create {}: {}", d.display(), e))
                })?;
            }

            // overlayfs lists the topmost lowerdir first.
            let lowerdir = lowers
                .iter()
                .rev()
                .map(|p| p.to_string_lossy().into_owned())
                .collect::<Vec<_>>()
                .join(":");
            mount_overlay(&lowerdir, &upper, &work, &rootfs)?;

            write_spec(&dir, spec).map_err(|e| {
                let _ = unmount(&rootfs);
                e
            })?;
            Ok(rootfs)
        })();

        match result {
            Ok(rootfs) => Ok(Bundle::new(run_id, dir, rootfs, true)),
            Err(e) => {
                let _ = fs::remove_dir_all(&dir);
                Err(e)
            }
        }
    }
}

/// Probes whether overlayfs is usable at the supplied cache location.
///
/// Performs a real mount of a throwaway overlay; anything short of a
/// successful mount (missing kernel support, unsuitable backing filesystem,
/// insufficient privilege) reports unsupported.
pub fn supported(cache_dir: &Path) -> bool {
    #[cfg(not(target_os = "linux"))]
    {
        let _ = cache_dir;
        false
    }

    #[cfg(target_os = "linux")]
    {
        let probe = cache_dir
            .join(OVERLAY_CACHE_DIR)
            .join(format!(".probe.{}", uuid::Uuid::new_v4()));
        let lower = probe.join("lower");
        let upper = probe.join("upper");
        let work = probe.join("work");
        let merged = probe.join("merged");
        for d in [&lower, &upper, &work, &merged] {
            if fs::create_dir_all(d).is_err() {
                let _ = fs::remove_dir_all(&probe);
                return false;
            }
        }

        let ok = mount_overlay(&lower.to_string_lossy(), &upper, &work, &merged).is_ok();
        if ok {
            let _ = unmount(&merged);
        } else {
            warn!(dir = %cache_dir.display(), "overlay probe mount failed");
        }
        let _ = fs::remove_dir_all(&probe);
        ok
    }
}

/// Extracts a layer tar into an overlay-ready directory, translating OCI
/// whiteouts to overlayfs native form.
fn extract_overlay_layer(layer_tar: &Path, dest: &Path) -> Result<()> {
    let file = fs::File::open(layer_tar).map_err(|e| Error::CacheIo {
        path: layer_tar.to_path_buf(),
        reason: e.to_string(),
    })?;
    let mut archive = tar::Archive::new(file);
    archive.set_preserve_permissions(true);

    let fail = |e: std::io::Error| Error::BundleCreation(format!(
        "cannot extract layer {}: {}",
        layer_tar.display(),
        e
    ));

    let mut total = 0u64;
    for entry in archive.entries().map_err(fail)? {
        let mut entry = entry.map_err(fail)?;
        let path = entry.path().map_err(fail)?.into_owned();

        let path_str = path.to_string_lossy();
        if path_str.starts_with('/')
            || path
                .components()
                .any(|c| matches!(c, std::path::Component::ParentDir))
        {
            return Err(Error::PathTraversal {
                path: path_str.to_string(),
            });
        }

        let filename = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
        let parent = path.parent().unwrap_or(Path::new(""));

        if filename == ".wh..wh..opq" {
            let dir = dest.join(parent);
            fs::create_dir_all(&dir).map_err(fail)?;
            set_opaque(&dir)?;
            continue;
        }

        if let Some(target) = filename.strip_prefix(".wh.") {
            let dir = dest.join(parent);
            fs::create_dir_all(&dir).map_err(fail)?;
            whiteout_device(&dir.join(target))?;
            continue;
        }

        total += entry.size();
        if total > MAX_ROOTFS_SIZE {
            return Err(Error::ImageTooLarge {
                size: total,
                limit: MAX_ROOTFS_SIZE,
            });
        }

        entry.unpack_in(dest).map_err(fail)?;
    }

    Ok(())
}

#[cfg(target_os = "linux")]
fn mount_overlay(lowerdir: &str, upper: &Path, work: &Path, merged: &Path) -> Result<()> {
    use std::ffi::CString;

    // userxattr lets an unprivileged user namespace manage overlay metadata.
    let data = format!(
        "lowerdir={},upperdir={},workdir={},userxattr",
        lowerdir,
        upper.display(),
        work.display()
    );
    let source = CString::new("overlay").expect("static string");
    let fstype = CString::new("overlay").expect("static string");
    let target = CString::new(merged.as_os_str().as_encoded_bytes())
        .map_err(|_| Error::BundleCreation("mount target contains NUL".to_string()))?;
    let data = CString::new(data)
        .map_err(|_| Error::BundleCreation("mount options contain NUL".to_string()))?;

    let rc = unsafe {
        libc::mount(
            source.as_ptr(),
            target.as_ptr(),
            fstype.as_ptr(),
            0,
            data.as_ptr() as *const libc::c_void,
        )
    };
    if rc != 0 {
        return Err(Error::BundleCreation(format!(
            "overlay mount at {}: {}",
            merged.display(),
            std::io::Error::last_os_error()
        )));
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn mount_overlay(_lowerdir: &str, _upper: &Path, _work: &Path, _merged: &Path) -> Result<()> {
    Err(Error::BundleCreation(
        "overlayfs requires Linux".to_string(),
    ))
}

#[cfg(target_os = "linux")]
fn whiteout_device(path: &Path) -> Result<()> {
    use std::ffi::CString;
    let c = CString::new(path.as_os_str().as_encoded_bytes())
        .map_err(|_| Error::BundleCreation("whiteout path contains NUL".to_string()))?;
    let rc = unsafe { libc::mknod(c.as_ptr(), libc::S_IFCHR | 0o600, libc::makedev(0, 0)) };
    if rc != 0 {
        return Err(Error::BundleCreation(format!(
            "cannot create whiteout {}: {}",
            path.display(),
            std::io::Error::last_os_error()
        )));
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn whiteout_device(_path: &Path) -> Result<()> {
    Ok(())
}

#[cfg(target_os = "linux")]
fn set_opaque(dir: &Path) -> Result<()> {
    use std::ffi::CString;
    let c = CString::new(dir.as_os_str().as_encoded_bytes())
        .map_err(|_| Error::BundleCreation("opaque path contains NUL".to_string()))?;
    let name = CString::new("user.overlay.opaque").expect("static string");
    let rc = unsafe {
        libc::setxattr(
            c.as_ptr(),
            name.as_ptr(),
            b"y".as_ptr() as *const libc::c_void,
            1,
            0,
        )
    };
    if rc != 0 {
        return Err(Error::BundleCreation(format!(
            "cannot mark {} opaque: {}",
            dir.display(),
            std::io::Error::last_os_error()
        )));
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn set_opaque(_dir: &Path) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::testutil::write_layer;
    use tempfile::TempDir;

    #[test]
    fn test_layer_dir_extracts_once() {
        let temp = TempDir::new().unwrap();
        let bundler = OverlayBundler::new(temp.path()).unwrap();

        let tar = write_layer(temp.path(), "l.tar", &[("bin/fn", b"elf" as &[u8])]);
        let digest = "sha256:abcdef0123456789";

        let first = bundler.layer_dir(digest, &tar).unwrap();
        assert!(first.join("bin/fn").exists());

        // Second call reuses the cached directory without re-reading the tar.
        std::fs::remove_file(&tar).unwrap();
        let second = bundler.layer_dir(digest, &tar).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_layer_dir_rejects_traversal() {
        let temp = TempDir::new().unwrap();
        let bundler = OverlayBundler::new(temp.path()).unwrap();

        let tar = write_layer(temp.path(), "evil.tar", &[("../../escape", b"x" as &[u8])]);
        let err = bundler.layer_dir("sha256:1234", &tar).unwrap_err();
        assert!(matches!(err, Error::PathTraversal { .. }));
        // Nothing half-extracted remains.
        let leftovers: Vec<_> = std::fs::read_dir(temp.path().join("overlay/layers"))
            .unwrap()
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_probe_does_not_panic() {
        // Result depends on kernel and privileges; it must simply not
        // error out or leave probe debris behind.
        let temp = TempDir::new().unwrap();
        let _ = supported(temp.path());
        let overlay_dir = temp.path().join(OVERLAY_CACHE_DIR);
        if overlay_dir.exists() {
            let probes: Vec<_> = std::fs::read_dir(&overlay_dir)
                .unwrap()
                .filter_map(|e| e.ok())
                .filter(|e| e.file_name().to_string_lossy().starts_with(".probe."))
                .collect();
            assert!(probes.is_empty());
        }
    }
}
