//! Error types for the function runner.
//!
//! Each variant identifies the pipeline stage that produced the failure, so
//! the RPC caller receives one error naming the failing stage and its cause.

use std::path::PathBuf;
use std::time::Duration;

/// Result type alias for runner operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while running a function.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    // =========================================================================
    // Image/Registry Errors
    // =========================================================================
    /// Failed to parse an image reference.
    #[error("invalid image reference '{reference}': {reason}")]
    InvalidImageReference { reference: String, reason: String },

    /// Failed to resolve registry credentials.
    #[error("cannot resolve registry auth for '{reference}': {reason}")]
    AuthResolution { reference: String, reason: String },

    /// Image pull failed. Includes digest mismatches detected on fetched
    /// content.
    #[error("cannot pull image '{reference}': {reason}")]
    PullFailed { reference: String, reason: String },

    /// A reference could not be resolved from the digest cache and the pull
    /// policy forbids contacting the registry.
    #[error("cannot resolve '{reference}' from cache (pull policy Never)")]
    NotCached { reference: String },

    /// Cache read or write failed.
    #[error("cache I/O at {path}: {reason}")]
    CacheIo { path: PathBuf, reason: String },

    // =========================================================================
    // Bundle Errors
    // =========================================================================
    /// Failed to create an OCI runtime bundle.
    #[error("cannot create OCI runtime bundle: {0}")]
    BundleCreation(String),

    /// Path traversal attempt detected in a layer archive.
    #[error("path traversal detected in layer: {path}")]
    PathTraversal { path: String },

    /// Image exceeded a size limit.
    #[error("image exceeds size limit: {size} > {limit} bytes")]
    ImageTooLarge { size: u64, limit: u64 },

    /// Failed to parse a resource limit quantity.
    #[error("cannot parse resource limit '{quantity}': {reason}")]
    LimitParse { quantity: String, reason: String },

    // =========================================================================
    // Launch/Invoke Errors
    // =========================================================================
    /// Failed to establish the rootless user namespace boundary.
    #[error("cannot set up sandbox namespaces: {0}")]
    NamespaceSetup(String),

    /// Failed to spawn the external OCI runtime.
    #[error("cannot spawn OCI runtime '{runtime}': {reason}")]
    RuntimeSpawn { runtime: String, reason: String },

    /// The run did not complete before its deadline.
    #[error("function run timed out after {timeout:?}")]
    RuntimeTimeout { timeout: Duration },

    /// The external OCI runtime exited non-zero.
    #[error("OCI runtime exited with status {status}: {}", String::from_utf8_lossy(stderr))]
    RuntimeNonZeroExit { status: i32, stderr: Vec<u8> },

    // =========================================================================
    // Protocol Errors
    // =========================================================================
    /// Failed to decode a request or response message.
    #[error("cannot decode message: {0}")]
    ResponseDecode(String),

    // =========================================================================
    // Cleanup Errors
    // =========================================================================
    /// Bundle cleanup failed. Only surfaced when the run otherwise succeeded;
    /// never replaces an earlier primary failure.
    #[error("cannot clean up bundle at {path}: {reason}")]
    Cleanup { path: PathBuf, reason: String },

    // =========================================================================
    // I/O Errors
    // =========================================================================
    /// Generic I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid runner configuration.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl Error {
    /// Short stage tag for logs and wire errors.
    pub fn stage(&self) -> &'static str {
        match self {
            Self::InvalidImageReference { .. } => "reference",
            Self::AuthResolution { .. } => "auth",
            Self::PullFailed { .. } | Self::NotCached { .. } => "pull",
            Self::CacheIo { .. } => "cache",
            Self::BundleCreation(_)
            | Self::PathTraversal { .. }
            | Self::ImageTooLarge { .. } => "bundle",
            Self::LimitParse { .. } => "spec",
            Self::NamespaceSetup(_) => "launch",
            Self::RuntimeSpawn { .. }
            | Self::RuntimeTimeout { .. }
            | Self::RuntimeNonZeroExit { .. } => "invoke",
            Self::ResponseDecode(_) => "protocol",
            Self::Cleanup { .. } => "cleanup",
            Self::Io(_) => "io",
            Self::Config(_) => "config",
        }
    }
}
