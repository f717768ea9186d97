//! External OCI runtime invocation.
//!
//! Runs a bundled function by shelling out to an OCI runtime (crun by
//! default), feeding the request over the container's stdin and collecting
//! the response from its stdout. The runtime keeps its state under the
//! cache directory so concurrent runs never collide on `/run`.
//!
//! Streams are read concurrently while waiting, so a function that fills
//! its stderr pipe cannot deadlock the run. When a run outlives its
//! deadline the container process is killed and the run fails with
//! [`Error::RuntimeTimeout`].

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, warn};

use crate::constants::RUNTIME_ROOT_DIR;
use crate::error::{Error, Result};
use crate::store::Bundle;

/// Invokes an external OCI runtime against bundles.
pub struct Invoker {
    runtime: String,
    runtime_root: PathBuf,
}

impl Invoker {
    /// Creates an invoker for the named runtime binary, with runtime state
    /// kept under the cache directory.
    pub fn new(runtime: &str, cache_dir: &Path) -> Self {
        Self {
            runtime: runtime.to_string(),
            runtime_root: cache_dir.join(RUNTIME_ROOT_DIR),
        }
    }

    /// Runs the bundle's container to completion.
    ///
    /// `max_stdio_bytes` bounds how much of the container's stdout and
    /// stderr is retained; zero means unbounded. Exceeding output is
    /// truncated, not failed, so a chatty function still gets its response
    /// delivered.
    pub async fn invoke(
        &self,
        bundle: &Bundle,
        request: &[u8],
        timeout: Duration,
        max_stdio_bytes: u64,
    ) -> Result<Vec<u8>> {
        let mut child = tokio::process::Command::new(&self.runtime)
            .arg(format!("--root={}", self.runtime_root.display()))
            .arg("run")
            .arg(format!("--bundle={}", bundle.path().display()))
            .arg(bundle.run_id())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::RuntimeSpawn {
                runtime: self.runtime.clone(),
                reason: e.to_string(),
            })?;

        debug!(run_id = %bundle.run_id(), runtime = %self.runtime, "container started");

        let mut stdin = child.stdin.take().ok_or_else(|| Error::RuntimeSpawn {
            runtime: self.runtime.clone(),
            reason: "stdin unavailable".to_string(),
        })?;
        let stdout = child.stdout.take().ok_or_else(|| Error::RuntimeSpawn {
            runtime: self.runtime.clone(),
            reason: "stdout unavailable".to_string(),
        })?;
        let stderr = child.stderr.take().ok_or_else(|| Error::RuntimeSpawn {
            runtime: self.runtime.clone(),
            reason: "stderr unavailable".to_string(),
        })?;

        // Streams are drained while the request is still being written; a
        // function may start talking before it has read all of its input.
        let stdout_task = tokio::spawn(read_limited(stdout, max_stdio_bytes));
        let stderr_task = tokio::spawn(read_limited(stderr, max_stdio_bytes));

        let request = request.to_vec();
        let stdin_task = tokio::spawn(async move {
            let _ = stdin.write_all(&request).await;
            // Dropping stdin closes it; EOF is the function's signal that
            // the request is complete.
        });

        let status = match tokio::time::timeout(timeout, child.wait()).await {
            Ok(waited) => waited.map_err(|e| Error::RuntimeSpawn {
                runtime: self.runtime.clone(),
                reason: format!("wait: {}", e),
            })?,
            Err(_) => {
                let _ = child.kill().await;
                stdin_task.abort();
                stdout_task.abort();
                stderr_task.abort();
                return Err(Error::RuntimeTimeout { timeout });
            }
        };

        let _ = stdin_task.await;
        let stdout = stdout_task
            .await
            .map_err(|e| Error::ResponseDecode(format!("stdout reader: {}", e)))??;
        let stderr = stderr_task
            .await
            .map_err(|e| Error::ResponseDecode(format!("stderr reader: {}", e)))??;

        if !status.success() {
            return Err(Error::RuntimeNonZeroExit {
                status: status.code().unwrap_or(-1),
                stderr,
            });
        }

        debug!(
            run_id = %bundle.run_id(),
            response_bytes = stdout.len(),
            "container finished"
        );
        Ok(stdout)
    }

    /// Invokes the bundle and removes it afterwards.
    ///
    /// The bundle is removed exactly once on every path. A cleanup failure
    /// is only surfaced when the run itself succeeded; it never masks the
    /// run's own error.
    pub async fn invoke_and_cleanup(
        &self,
        bundle: &Bundle,
        request: &[u8],
        timeout: Duration,
        max_stdio_bytes: u64,
    ) -> Result<Vec<u8>> {
        let result = self.invoke(bundle, request, timeout, max_stdio_bytes).await;
        match (result, bundle.cleanup()) {
            (Ok(response), Ok(())) => Ok(response),
            (Ok(_), Err(cleanup)) => Err(cleanup),
            (Err(run), Ok(())) => Err(run),
            (Err(run), Err(cleanup)) => {
                warn!(run_id = %bundle.run_id(), error = %cleanup, "bundle cleanup failed");
                Err(run)
            }
        }
    }
}

/// Reads a stream to EOF, retaining at most `limit` bytes (zero for
/// unbounded).
async fn read_limited<R>(mut reader: R, limit: u64) -> Result<Vec<u8>>
where
    R: tokio::io::AsyncRead + Unpin + Send,
{
    let mut buf = Vec::new();
    if limit == 0 {
        reader.read_to_end(&mut buf).await.map_err(Error::Io)?;
        return Ok(buf);
    }

    (&mut reader)
        .take(limit)
        .read_to_end(&mut buf)
        .await
        .map_err(Error::Io)?;

    // Drain the rest so the writer is never blocked on a full pipe.
    let mut sink = [0u8; 4096];
    loop {
        match reader.read(&mut sink).await {
            Ok(0) => break,
            Ok(_) => continue,
            Err(e) => return Err(Error::Io(e)),
        }
    }
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pull::{Image, Layer};
    use crate::spec::RuntimeSpec;
    use crate::store::testutil::write_layer;
    use crate::store::uncompressed::UncompressedBundler;
    use crate::store::Bundler;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    /// Installs a shell script standing in for the OCI runtime.
    fn fake_runtime(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("fake-runtime");
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    async fn bundle(temp: &TempDir, run_id: &str) -> Bundle {
        let layer_path = write_layer(temp.path(), "base.tar", &[("etc/conf", b"x" as &[u8])]);
        let image = Image::for_tests(
            "sha256:feed",
            vec![Layer {
                digest: "sha256:feed".to_string(),
                archive: layer_path,
            }],
        );
        let bundler = UncompressedBundler::new(temp.path()).unwrap();
        let spec = RuntimeSpec::base(&image, run_id);
        bundler.bundle(&image, run_id, &spec).await.unwrap()
    }

    fn invoker(temp: &TempDir, script: &Path) -> Invoker {
        Invoker::new(&script.to_string_lossy(), temp.path())
    }

    #[tokio::test]
    async fn test_invoke_pipes_request_to_response() {
        let temp = TempDir::new().unwrap();
        let runtime = fake_runtime(temp.path(), "cat");
        let bundle = bundle(&temp, "run-1").await;

        let response = invoker(&temp, &runtime)
            .invoke(&bundle, b"hello function", Duration::from_secs(5), 0)
            .await
            .unwrap();
        assert_eq!(response, b"hello function");
        bundle.cleanup().unwrap();
    }

    #[tokio::test]
    async fn test_nonzero_exit_carries_stderr() {
        let temp = TempDir::new().unwrap();
        let runtime = fake_runtime(temp.path(), "echo boom >&2; exit 3");
        let bundle = bundle(&temp, "run-2").await;

        let err = invoker(&temp, &runtime)
            .invoke(&bundle, b"", Duration::from_secs(5), 0)
            .await
            .unwrap_err();
        match err {
            Error::RuntimeNonZeroExit { status, stderr } => {
                assert_eq!(status, 3);
                assert!(String::from_utf8_lossy(&stderr).contains("boom"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
        bundle.cleanup().unwrap();
    }

    #[tokio::test]
    async fn test_timeout_kills_container() {
        let temp = TempDir::new().unwrap();
        let runtime = fake_runtime(temp.path(), "sleep 30");
        let bundle = bundle(&temp, "run-3").await;

        let err = invoker(&temp, &runtime)
            .invoke(&bundle, b"", Duration::from_millis(200), 0)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::RuntimeTimeout { .. }));
        bundle.cleanup().unwrap();
    }

    #[tokio::test]
    async fn test_output_is_truncated_at_limit() {
        let temp = TempDir::new().unwrap();
        let runtime = fake_runtime(temp.path(), "printf 'aaaaaaaaaa'");
        let bundle = bundle(&temp, "run-4").await;

        let response = invoker(&temp, &runtime)
            .invoke(&bundle, b"", Duration::from_secs(5), 4)
            .await
            .unwrap();
        assert_eq!(response, b"aaaa");
        bundle.cleanup().unwrap();
    }

    #[tokio::test]
    async fn test_missing_runtime_is_spawn_error() {
        let temp = TempDir::new().unwrap();
        let bundle = bundle(&temp, "run-5").await;

        let err = Invoker::new("/nonexistent/crun", temp.path())
            .invoke(&bundle, b"", Duration::from_secs(5), 0)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::RuntimeSpawn { .. }));
        bundle.cleanup().unwrap();
    }

    #[tokio::test]
    async fn test_invoke_and_cleanup_removes_bundle_on_all_paths() {
        let temp = TempDir::new().unwrap();

        let ok_runtime = fake_runtime(temp.path(), "cat");
        let bundle_ok = bundle(&temp, "run-6").await;
        let path = bundle_ok.path().to_path_buf();
        invoker(&temp, &ok_runtime)
            .invoke_and_cleanup(&bundle_ok, b"req", Duration::from_secs(5), 0)
            .await
            .unwrap();
        assert!(!path.exists());

        let bad_runtime = fake_runtime(temp.path(), "exit 1");
        let bundle_err = bundle(&temp, "run-7").await;
        let path = bundle_err.path().to_path_buf();
        let err = invoker(&temp, &bad_runtime)
            .invoke_and_cleanup(&bundle_err, b"req", Duration::from_secs(5), 0)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::RuntimeNonZeroExit { .. }));
        assert!(!path.exists());
    }
}
