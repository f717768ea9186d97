//! Sandbox-stage run pipeline.
//!
//! This is the code the re-executed sandbox child runs after its
//! namespaces are in place: pull the image, build a bundle, invoke the
//! runtime, and emit exactly one wire message describing the outcome.
//!
//! The raw request bytes are forwarded to the function unmodified; the
//! pipeline only reads the runner-owned `config` section.

use tracing::{debug, info};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::invoke::Invoker;
use crate::protocol::{
    decode_request, decode_response, NetworkPolicy, RunFunctionRequestConfig, RunFunctionResponse,
    WireMessage,
};
use crate::pull::{CachingPuller, RegistryClient, RemoteClient};
use crate::spec::RuntimeSpec;
use crate::store::select_bundler;

/// Runs one function from raw request bytes to a terminal wire message.
///
/// Never panics or exits early: every failure becomes a
/// [`WireMessage::Error`] naming its pipeline stage.
pub async fn run(config: &Config, raw_request: &[u8]) -> WireMessage {
    match run_with_client(config, raw_request, Box::new(RemoteClient::new())).await {
        Ok(response) => WireMessage::Ok { response },
        Err(e) => WireMessage::from_error(&e),
    }
}

/// Pipeline body, generic over the registry client so tests can run it
/// against an in-memory registry.
pub async fn run_with_client(
    config: &Config,
    raw_request: &[u8],
    client: Box<dyn RegistryClient>,
) -> Result<RunFunctionResponse> {
    let request = decode_request(raw_request)?;
    let req_config = request.config.clone().unwrap_or_default();

    let image_ref = resolve_image(&req_config, config.default_image.as_deref())?;
    let pull_config = req_config.image_pull_config.unwrap_or_default();
    let auth = pull_config.auth.unwrap_or_default();
    let run_config = req_config.run_function_config.unwrap_or_default();

    // One deadline covers the whole run: the pull spends from the same
    // budget the function executes on. The fixed pull timeout still bounds
    // individual blob fetches inside.
    let deadline = run_config.timeout();
    let started = std::time::Instant::now();

    let puller = CachingPuller::new(client, &config.cache_dir, &config.registry)?;
    let image = tokio::time::timeout(
        deadline,
        puller.image(&image_ref, pull_config.pull_policy, &auth),
    )
    .await
    .map_err(|_| Error::PullFailed {
        reference: image_ref.clone(),
        reason: format!("timed out after {:?}", deadline),
    })??;
    debug!(image = %image_ref, digest = %image.digest(), "image resolved");

    let run_id = uuid::Uuid::new_v4().to_string();
    let mut spec = RuntimeSpec::base(&image, &run_id);
    if let Some(limits) = run_config.resources.as_ref().and_then(|r| r.limits.as_ref()) {
        if let Some(cpu) = &limits.cpu {
            spec.with_cpu_limit(cpu)?;
        }
        if let Some(memory) = &limits.memory {
            spec.with_memory_limit(memory)?;
        }
    }
    if run_config.network.as_ref().map(|n| n.policy) == Some(NetworkPolicy::Runner) {
        spec.with_host_network()?;
    }

    let bundler = select_bundler(&config.cache_dir)?;
    let bundle = bundler.bundle(&image, &run_id, &spec).await?;
    info!(
        run_id = %run_id,
        image = %image_ref,
        bundler = bundler.name(),
        "running function"
    );

    let invoker = Invoker::new(&config.runtime, &config.cache_dir);
    let remaining = deadline.saturating_sub(started.elapsed());
    let stdout = invoker
        .invoke_and_cleanup(&bundle, raw_request, remaining, config.max_stdio_bytes)
        .await?;

    decode_response(&stdout)
}

/// Picks the image for a run: the request's image, else the configured
/// default.
fn resolve_image(
    req_config: &RunFunctionRequestConfig,
    default_image: Option<&str>,
) -> Result<String> {
    req_config
        .image
        .as_deref()
        .or(default_image)
        .map(str::to_string)
        .ok_or_else(|| {
            Error::Config("request names no image and no default image is configured".to_string())
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_image_prefers_request() {
        let req = RunFunctionRequestConfig {
            image: Some("example.com/fn:v1".to_string()),
            ..Default::default()
        };
        assert_eq!(
            resolve_image(&req, Some("example.com/default:v1")).unwrap(),
            "example.com/fn:v1"
        );
    }

    #[test]
    fn test_resolve_image_falls_back_to_default() {
        let req = RunFunctionRequestConfig::default();
        assert_eq!(
            resolve_image(&req, Some("example.com/default:v1")).unwrap(),
            "example.com/default:v1"
        );
    }

    #[test]
    fn test_resolve_image_requires_some_image() {
        let req = RunFunctionRequestConfig::default();
        assert!(matches!(
            resolve_image(&req, None),
            Err(Error::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_malformed_request_is_protocol_error() {
        let config = Config {
            cache_dir: tempfile::TempDir::new().unwrap().path().to_path_buf(),
            ..Config::default()
        };
        let msg = run(&config, b"not json").await;
        match msg {
            WireMessage::Error { stage, .. } => assert_eq!(stage, "protocol"),
            other => panic!("unexpected message: {:?}", other),
        }
    }
}
