//! # Runner Constants
//!
//! Defines resource limits, timeouts, and default paths for the function
//! runner. These constants are the **single source of truth** for
//! security-critical bounds throughout the codebase.
//!
//! ## Security Rationale
//!
//! All limits are chosen to prevent resource exhaustion from malicious or
//! malformed OCI images while allowing legitimate workloads. Each constant
//! documents the bound and the attack it mitigates.
//!
//! ## Cross-References
//!
//! - [`crate::pull`]: Uses size limits and timeouts for image pulling
//! - [`crate::store`]: Uses size limits for layer extraction
//! - [`crate::invoke`]: Uses the default run timeout
//! - [`crate::launcher`]: Uses the ID-mapping defaults

use std::time::Duration;

// =============================================================================
// Size Limits
// =============================================================================

/// Maximum OCI image reference length in bytes.
///
/// **Security**: Prevents injection attacks via overly long image names.
/// Registry implementations may have lower limits.
pub const MAX_IMAGE_REF_LEN: usize = 512;

/// Maximum size of a single compressed OCI layer (512 MiB).
///
/// **Security**: Prevents disk exhaustion during layer download. Each layer
/// is validated against this limit before writing to the layer cache.
pub const MAX_LAYER_SIZE: u64 = 512 * 1024 * 1024;

/// Maximum total extracted rootfs size (4 GiB).
///
/// **Security**: The ultimate bound on disk usage from a single image.
/// Enforced during tar extraction, accumulating across all layers.
///
/// **Attack Vector**: Compression bombs (small compressed, huge uncompressed).
pub const MAX_ROOTFS_SIZE: u64 = 4 * 1024 * 1024 * 1024;

/// Maximum number of layers in an OCI image.
///
/// **Security**: Prevents excessive extraction time and disk I/O from images
/// with pathological layer counts.
pub const MAX_LAYERS: usize = 128;

// =============================================================================
// Timeouts
// =============================================================================

/// Time after which the external OCI runtime is killed if the request does
/// not specify a timeout.
pub const DEFAULT_RUN_TIMEOUT: Duration = Duration::from_secs(25);

/// Timeout for image pull operations (5 minutes).
///
/// **Security**: Prevents indefinite hangs from unresponsive registries or
/// network partitions. Includes manifest fetch and all layer downloads.
pub const IMAGE_PULL_TIMEOUT: Duration = Duration::from_secs(300);

// =============================================================================
// Cache Layout
// =============================================================================
//
// All paths are relative to the configured cache directory. Per-run bundle
// directories are ephemeral; everything else outlives individual runs.
// =============================================================================

/// Default directory used for caching function images and containers.
pub const DEFAULT_CACHE_DIR: &str = "/fncell";

/// Subdirectory for the content-addressed image cache (manifests, configs,
/// uncompressed layer tarballs keyed by digest).
pub const IMAGE_CACHE_DIR: &str = "images";

/// Subdirectory for the reference-to-digest map store.
pub const DIGEST_CACHE_DIR: &str = "digests";

/// Subdirectory for overlay-ready extracted layer directories.
///
/// Only populated when the overlay bundler is in use. Roughly doubles the
/// on-disk footprint per image in exchange for faster container starts.
pub const OVERLAY_CACHE_DIR: &str = "overlay";

/// Subdirectory for per-digest pull lock files. Pulls of one digest are
/// serialized across every process sharing the cache directory.
pub const PULL_LOCKS_DIR: &str = "locks";

/// Subdirectory for ephemeral per-run OCI runtime bundles, named by run ID.
pub const RUNS_DIR: &str = "runs";

/// Subdirectory the external OCI runtime should use for its `--root` state.
pub const RUNTIME_ROOT_DIR: &str = "runtime";

// =============================================================================
// Defaults
// =============================================================================

/// Default low-level OCI runtime binary to invoke.
pub const DEFAULT_RUNTIME: &str = "crun";

/// Default registry used to qualify bare image references.
pub const DEFAULT_REGISTRY: &str = "index.docker.io";

/// Default maximum size of captured stdout and stderr. Zero means unbounded.
pub const DEFAULT_MAX_STDIO_BYTES: u64 = 0;

// =============================================================================
// User Namespace Mapping
// =============================================================================

/// Number of contiguous UIDs and GIDs mapped into the function's user
/// namespace when the runner holds CAP_SETUID and CAP_SETGID.
///
/// 65536 IDs give the sandboxed process a full conventional ID range, so
/// software that switches to distinct non-zero users keeps working.
pub const ID_MAP_SIZE: u32 = 65536;

/// Default host UID that maps to UID 0 inside the function's user namespace.
/// The following [`ID_MAP_SIZE`] UIDs must be available.
pub const DEFAULT_MAP_ROOT_UID: u32 = 100_000;

/// Default host GID that maps to GID 0 inside the function's user namespace.
/// The following [`ID_MAP_SIZE`] GIDs must be available.
pub const DEFAULT_MAP_ROOT_GID: u32 = 100_000;

// =============================================================================
// OCI Spec
// =============================================================================

/// OCI Runtime Spec version for generated `config.json`.
///
/// See: <https://github.com/opencontainers/runtime-spec/releases>
pub const OCI_RUNTIME_SPEC_VERSION: &str = "1.0.2";

/// Valid characters for OCI image references.
///
/// The `@` is for digest references like `fn@sha256:abc...`.
/// The `:` is for tag references like `fn:v1`.
pub const IMAGE_REF_VALID_CHARS: &str =
    "abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789-_./:@";
