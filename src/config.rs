//! Runner configuration.
//!
//! One explicit, validated configuration value constructed at startup and
//! threaded by reference through every component. There is no ambient or
//! global mutable state; components that need a path or a default receive
//! it from here.

use std::path::PathBuf;

use crate::constants::{
    DEFAULT_CACHE_DIR, DEFAULT_MAP_ROOT_GID, DEFAULT_MAP_ROOT_UID, DEFAULT_MAX_STDIO_BYTES,
    DEFAULT_REGISTRY, DEFAULT_RUNTIME, ID_MAP_SIZE,
};
use crate::error::{Error, Result};

/// Address the server listens on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Listen {
    /// TCP socket, e.g. `0.0.0.0:9547`.
    Tcp(String),
    /// Unix domain socket path.
    Unix(PathBuf),
}

/// Runner configuration.
///
/// Defaults match the constants in [`crate::constants`]; every field can be
/// overridden from the CLI. Construct with [`Config::default`] and adjust
/// named fields, then call [`Config::validate`] once before use.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory used for caching function images and containers.
    pub cache_dir: PathBuf,
    /// Low-level OCI runtime binary to invoke (e.g. `crun`).
    pub runtime: String,
    /// Default registry used to qualify bare image references.
    pub registry: String,
    /// Image used when the request does not name one.
    pub default_image: Option<String>,
    /// Maximum size of captured stdout and stderr. Zero means unbounded.
    pub max_stdio_bytes: u64,
    /// Host UID that maps to UID 0 in the function's user namespace.
    /// Ignored when the runner lacks CAP_SETUID and CAP_SETGID.
    pub map_root_uid: u32,
    /// Host GID that maps to GID 0 in the function's user namespace.
    /// Ignored when the runner lacks CAP_SETUID and CAP_SETGID.
    pub map_root_gid: u32,
    /// Address at which to listen for function run requests.
    pub listen: Listen,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cache_dir: PathBuf::from(DEFAULT_CACHE_DIR),
            runtime: DEFAULT_RUNTIME.to_string(),
            registry: DEFAULT_REGISTRY.to_string(),
            default_image: None,
            max_stdio_bytes: DEFAULT_MAX_STDIO_BYTES,
            map_root_uid: DEFAULT_MAP_ROOT_UID,
            map_root_gid: DEFAULT_MAP_ROOT_GID,
            listen: Listen::Tcp("0.0.0.0:9547".to_string()),
        }
    }
}

impl Config {
    /// Validates the configuration and ensures the cache directory exists.
    pub fn validate(&self) -> Result<()> {
        if self.runtime.is_empty() {
            return Err(Error::Config("runtime binary name is empty".to_string()));
        }
        if self.registry.is_empty() {
            return Err(Error::Config("default registry is empty".to_string()));
        }
        // The mapped range must fit in the 32-bit ID space.
        if self.map_root_uid.checked_add(ID_MAP_SIZE).is_none() {
            return Err(Error::Config(format!(
                "map-root-uid {} leaves no room for {} mapped UIDs",
                self.map_root_uid, ID_MAP_SIZE
            )));
        }
        if self.map_root_gid.checked_add(ID_MAP_SIZE).is_none() {
            return Err(Error::Config(format!(
                "map-root-gid {} leaves no room for {} mapped GIDs",
                self.map_root_gid, ID_MAP_SIZE
            )));
        }
        std::fs::create_dir_all(&self.cache_dir).map_err(|e| Error::CacheIo {
            path: self.cache_dir.clone(),
            reason: e.to_string(),
        })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config_validates() {
        let temp = TempDir::new().unwrap();
        let cfg = Config {
            cache_dir: temp.path().join("cache"),
            ..Config::default()
        };
        cfg.validate().unwrap();
        assert!(cfg.cache_dir.exists());
    }

    #[test]
    fn test_overflowing_id_map_rejected() {
        let temp = TempDir::new().unwrap();
        let cfg = Config {
            cache_dir: temp.path().to_path_buf(),
            map_root_uid: u32::MAX - 10,
            ..Config::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_empty_runtime_rejected() {
        let cfg = Config {
            runtime: String::new(),
            ..Config::default()
        };
        assert!(cfg.validate().is_err());
    }
}
