//! Function run server.
//!
//! Listens on a TCP or Unix socket and speaks newline-delimited JSON: one
//! request line in, one terminal [`WireMessage`] line out. Each connection
//! is served by its own task and may carry any number of sequential
//! requests.
//!
//! The server process itself never touches function content. Every run is
//! handed to a sandbox child via the [`Launcher`]; whatever wire message
//! the child produced is forwarded verbatim to the caller.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, UnixListener};
use tracing::{debug, error, info, warn};

use crate::config::{Config, Listen};
use crate::constants::IMAGE_PULL_TIMEOUT;
use crate::error::{Error, Result};
use crate::launcher::{IdMapping, Launcher};
use crate::protocol::{decode_request, WireMessage};

/// Slack added to the sandbox wait deadline beyond the run and pull
/// timeouts, covering namespace setup and bundle extraction.
const SANDBOX_GRACE: Duration = Duration::from_secs(60);

/// Stage-1 façade: validates requests and drives sandbox children.
pub struct FunctionRunner {
    config: Config,
    launcher: Launcher,
}

impl FunctionRunner {
    /// Creates a runner, probing capabilities to pick the ID mapping.
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        let mapping = IdMapping::detect(config.map_root_uid, config.map_root_gid)?;

        let mut sandbox_args = vec![
            format!("--cache-dir={}", config.cache_dir.display()),
            format!("--runtime={}", config.runtime),
            format!("--registry={}", config.registry),
            format!("--max-stdio-bytes={}", config.max_stdio_bytes),
        ];
        if let Some(image) = &config.default_image {
            sandbox_args.push(format!("--default-image={}", image));
        }

        let launcher = Launcher::new(sandbox_args, mapping)?;
        Ok(Self { config, launcher })
    }

    /// The validated configuration this runner serves with.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Handles one request line, always producing a terminal message.
    pub async fn run(&self, raw_request: &[u8]) -> WireMessage {
        match self.dispatch(raw_request).await {
            Ok(msg) => msg,
            Err(e) => {
                warn!(error = %e, "run failed before reaching the function");
                WireMessage::from_error(&e)
            }
        }
    }

    async fn dispatch(&self, raw_request: &[u8]) -> Result<WireMessage> {
        // Decoded only to validate the envelope and read the deadline; the
        // sandbox receives the caller's original bytes untouched.
        let request = decode_request(raw_request)?;
        let timeout = request
            .config
            .as_ref()
            .and_then(|c| c.run_function_config.as_ref())
            .map(|c| c.timeout())
            .unwrap_or_else(|| crate::protocol::RunFunctionConfig::default().timeout());

        let wait_timeout = timeout + IMAGE_PULL_TIMEOUT + SANDBOX_GRACE;

        let stdout = self.launcher.run(raw_request, wait_timeout).await?;
        serde_json::from_slice(&stdout).map_err(|e| {
            Error::ResponseDecode(format!("sandbox produced no wire message: {}", e))
        })
    }
}

// =============================================================================
// Socket serving
// =============================================================================

/// Serves function runs until the process is stopped.
pub async fn serve(runner: Arc<FunctionRunner>) -> Result<()> {
    match runner.config().listen.clone() {
        Listen::Tcp(addr) => {
            let listener = TcpListener::bind(&addr).await.map_err(|e| {
                Error::Config(format!("bind {}: {}", addr, e))
            })?;
            info!(%addr, "listening");
            loop {
                let (stream, peer) = listener.accept().await.map_err(Error::Io)?;
                debug!(%peer, "connection accepted");
                let runner = Arc::clone(&runner);
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(runner, stream).await {
                        warn!(%peer, error = %e, "connection failed");
                    }
                });
            }
        }
        Listen::Unix(path) => {
            // A previous run's stale socket would make bind fail.
            if path.exists() {
                std::fs::remove_file(&path).map_err(Error::Io)?;
            }
            let listener = UnixListener::bind(&path).map_err(|e| {
                Error::Config(format!("bind {}: {}", path.display(), e))
            })?;
            info!(path = %path.display(), "listening");
            loop {
                let (stream, _) = listener.accept().await.map_err(Error::Io)?;
                let runner = Arc::clone(&runner);
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(runner, stream).await {
                        warn!(error = %e, "connection failed");
                    }
                });
            }
        }
    }
}

/// Serves one connection: a sequence of request lines, each answered with
/// exactly one wire message line.
async fn handle_connection<S>(runner: Arc<FunctionRunner>, stream: S) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let (read_half, mut write_half) = tokio::io::split(stream);
    let mut lines = BufReader::new(read_half).lines();

    while let Some(line) = lines.next_line().await.map_err(Error::Io)? {
        if line.trim().is_empty() {
            continue;
        }

        let message = runner.run(line.as_bytes()).await;
        let mut encoded = serde_json::to_vec(&message)
            .map_err(|e| Error::ResponseDecode(format!("wire message: {}", e)))?;
        encoded.push(b'\n');

        if let Err(e) = write_half.write_all(&encoded).await {
            error!(error = %e, "client went away mid-response");
            return Err(Error::Io(e));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn runner(temp: &TempDir) -> Arc<FunctionRunner> {
        let config = Config {
            cache_dir: temp.path().join("cache"),
            ..Config::default()
        };
        Arc::new(FunctionRunner::new(config).unwrap())
    }

    #[tokio::test]
    async fn test_malformed_request_line_gets_error_message() {
        let temp = TempDir::new().unwrap();
        let msg = runner(&temp).run(b"not json").await;
        match msg {
            WireMessage::Error { stage, .. } => assert_eq!(stage, "protocol"),
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_connection_answers_each_line() {
        let temp = TempDir::new().unwrap();
        let runner = runner(&temp);

        let (client, server) = tokio::io::duplex(4096);
        let server_task = tokio::spawn(handle_connection(runner, server));

        let (read_half, mut write_half) = tokio::io::split(client);
        write_half.write_all(b"garbage\n\nmore garbage\n").await.unwrap();
        write_half.shutdown().await.unwrap();

        let mut lines = BufReader::new(read_half).lines();
        let mut responses = Vec::new();
        while let Some(line) = lines.next_line().await.unwrap() {
            responses.push(line);
        }
        server_task.await.unwrap().unwrap();

        // Two non-empty requests, two terminal messages; the blank line is
        // skipped.
        assert_eq!(responses.len(), 2);
        for line in responses {
            let msg: WireMessage = serde_json::from_str(&line).unwrap();
            assert!(matches!(msg, WireMessage::Error { .. }));
        }
    }
}
