//! # fncell - Rootless OCI Function Runner
//!
//! Runs short-lived functions packaged as OCI container images, without
//! requiring root. A function reads its request from stdin and writes its
//! response to stdout; fncell handles everything around that: pulling and
//! caching the image, materializing a runtime bundle, and invoking an
//! external OCI runtime inside unprivileged namespaces.
//!
//! ## Architecture
//!
//! ```text
//! caller ──NDJSON──▶ server (stage 1)
//!                      │ re-exec self, unshare user/mount/pid namespaces
//!                      ▼
//!                    sandbox (stage 2)
//!                      │ pull ─▶ digest cache + image cache
//!                      │ bundle ─▶ overlay or uncompressed rootfs
//!                      │ invoke ─▶ crun run --bundle ...
//!                      ▼
//!                    function (container)
//! ```
//!
//! The server process never touches function content; every run happens in
//! a short-lived sandbox child with its own ID mapping.
//!
//! ## Caching
//!
//! Image content is content-addressed and shared across runs: a digest
//! cache maps references to manifests, and an image cache holds manifests,
//! configs, and uncompressed layers. Concurrent pulls of the same digest
//! are serialized so each blob is downloaded once.
//!
//! ## Example
//!
//! ```rust,ignore
//! use fncell::config::Config;
//! use fncell::server::{serve, FunctionRunner};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> fncell::Result<()> {
//!     let runner = FunctionRunner::new(Config::default())?;
//!     serve(Arc::new(runner)).await
//! }
//! ```

pub mod config;
pub mod constants;
pub mod error;
pub mod invoke;
pub mod launcher;
pub mod protocol;
pub mod pull;
pub mod reference;
pub mod sandbox;
pub mod server;
pub mod spec;
pub mod store;

pub use config::{Config, Listen};
pub use error::{Error, Result};
pub use protocol::{RunFunctionRequest, RunFunctionResponse, WireMessage};
pub use pull::{CachingPuller, Image, RegistryClient, RemoteClient};
pub use reference::ImageReference;
pub use server::FunctionRunner;
pub use store::{select_bundler, Bundle, Bundler};
