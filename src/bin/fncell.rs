//! fncell - rootless OCI function runner
//!
//! Runs short-lived functions packaged as OCI images, without requiring
//! root. Functions speak over stdin/stdout and are isolated in user, PID,
//! and mount namespaces via an external OCI runtime (crun by default).
//!
//! ## Usage
//!
//! ```sh
//! fncell start [--listen <addr>] [--cache-dir <path>]
//! fncell run <image> < request.json
//! fncell version
//! ```
//!
//! The `sandbox` subcommand is internal: `start` re-executes this binary
//! with it to run one function inside fresh namespaces.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing_subscriber::EnvFilter;

use fncell::config::{Config, Listen};
use fncell::launcher::{enter_namespaces, parse_sync_fds};
use fncell::protocol::{RunFunctionRequestConfig, WireMessage};
use fncell::server::{serve, FunctionRunner};
use fncell::{protocol, sandbox};

// =============================================================================
// CLI Parsing
// =============================================================================

#[derive(Debug)]
enum Command {
    /// Serve function runs over a socket.
    Start { config: Config },
    /// Run a single function from stdin and print the result.
    Run { config: Config, image: String },
    /// Internal: sandbox stage spawned by `start`/`run`.
    Sandbox { config: Config, sync_fds: Option<String> },
    Version,
    Help,
}

/// One parsed `--flag value` / `--flag=value` option.
fn take_option(args: &[String], i: &mut usize, flag: &str) -> Result<Option<String>, String> {
    let arg = &args[*i];
    if let Some(value) = arg.strip_prefix(&format!("{}=", flag)) {
        *i += 1;
        return Ok(Some(value.to_string()));
    }
    if arg == flag {
        if *i + 1 < args.len() {
            let value = args[*i + 1].clone();
            *i += 2;
            return Ok(Some(value));
        }
        return Err(format!("{} requires a value", flag));
    }
    Ok(None)
}

/// Parses the configuration flags shared by all subcommands, returning the
/// arguments it did not consume.
fn parse_config(args: &[String]) -> Result<(Config, Vec<String>), String> {
    let mut config = Config::default();
    let mut rest = Vec::new();
    let mut i = 0;

    while i < args.len() {
        if let Some(v) = take_option(args, &mut i, "--cache-dir")? {
            config.cache_dir = PathBuf::from(v);
        } else if let Some(v) = take_option(args, &mut i, "--runtime")? {
            config.runtime = v;
        } else if let Some(v) = take_option(args, &mut i, "--registry")? {
            config.registry = v;
        } else if let Some(v) = take_option(args, &mut i, "--default-image")? {
            config.default_image = Some(v);
        } else if let Some(v) = take_option(args, &mut i, "--max-stdio-bytes")? {
            config.max_stdio_bytes = v
                .parse()
                .map_err(|_| format!("--max-stdio-bytes: '{}' is not a byte count", v))?;
        } else if let Some(v) = take_option(args, &mut i, "--map-root-uid")? {
            config.map_root_uid = v
                .parse()
                .map_err(|_| format!("--map-root-uid: '{}' is not a UID", v))?;
        } else if let Some(v) = take_option(args, &mut i, "--map-root-gid")? {
            config.map_root_gid = v
                .parse()
                .map_err(|_| format!("--map-root-gid: '{}' is not a GID", v))?;
        } else if let Some(v) = take_option(args, &mut i, "--listen")? {
            config.listen = Listen::Tcp(v);
        } else if let Some(v) = take_option(args, &mut i, "--unix-socket")? {
            config.listen = Listen::Unix(PathBuf::from(v));
        } else {
            rest.push(args[i].clone());
            i += 1;
        }
    }
    Ok((config, rest))
}

fn parse_args() -> Result<Command, String> {
    let args: Vec<String> = std::env::args().skip(1).collect();

    let Some(command) = args.first() else {
        return Ok(Command::Help);
    };

    match command.as_str() {
        "start" => {
            let (config, rest) = parse_config(&args[1..])?;
            if let Some(unknown) = rest.first() {
                return Err(format!("unknown option: {}", unknown));
            }
            Ok(Command::Start { config })
        }
        "run" => {
            let (config, rest) = parse_config(&args[1..])?;
            let image = rest
                .first()
                .cloned()
                .ok_or_else(|| "run requires <image>".to_string())?;
            Ok(Command::Run { config, image })
        }
        "sandbox" => {
            let mut sync_fds = None;
            let mut remaining = Vec::new();
            let mut i = 1;
            while i < args.len() {
                if let Some(v) = take_option(&args, &mut i, "--sync-fds")? {
                    sync_fds = Some(v);
                } else {
                    remaining.push(args[i].clone());
                    i += 1;
                }
            }
            let (config, rest) = parse_config(&remaining)?;
            if let Some(unknown) = rest.first() {
                return Err(format!("unknown option: {}", unknown));
            }
            Ok(Command::Sandbox { config, sync_fds })
        }
        "version" | "--version" | "-v" => Ok(Command::Version),
        "help" | "--help" | "-h" => Ok(Command::Help),
        unknown => Err(format!("unknown command: {}", unknown)),
    }
}

// =============================================================================
// Command Implementations
// =============================================================================

async fn cmd_start(config: Config) -> Result<(), String> {
    let runner = FunctionRunner::new(config).map_err(|e| e.to_string())?;
    serve(Arc::new(runner)).await.map_err(|e| e.to_string())
}

/// One-shot mode: a request on stdin, a wire message on stdout.
async fn cmd_run(config: Config, image: String) -> Result<(), String> {
    let mut raw = Vec::new();
    tokio::io::stdin()
        .read_to_end(&mut raw)
        .await
        .map_err(|e| format!("read request from stdin: {}", e))?;

    // An empty stdin still makes a valid request for the named image.
    let mut request = if raw.is_empty() {
        protocol::RunFunctionRequest::default()
    } else {
        protocol::decode_request(&raw).map_err(|e| e.to_string())?
    };
    request
        .config
        .get_or_insert_with(RunFunctionRequestConfig::default)
        .image = Some(image);
    let encoded = protocol::encode_request(&request).map_err(|e| e.to_string())?;

    let runner = FunctionRunner::new(config).map_err(|e| e.to_string())?;
    let message = runner.run(&encoded).await;

    let mut out = serde_json::to_vec(&message).map_err(|e| e.to_string())?;
    out.push(b'\n');
    tokio::io::stdout()
        .write_all(&out)
        .await
        .map_err(|e| e.to_string())?;

    match message {
        WireMessage::Ok { .. } => Ok(()),
        WireMessage::Error { stage, message } => Err(format!("{}: {}", stage, message)),
    }
}

/// Sandbox stage. Stdout belongs to the wire protocol; all diagnostics go
/// to stderr. Namespace entry already happened in `main`, before any
/// runtime thread existed.
async fn cmd_sandbox(config: Config) -> Result<(), String> {
    let mut raw = Vec::new();
    tokio::io::stdin()
        .read_to_end(&mut raw)
        .await
        .map_err(|e| format!("read request: {}", e))?;

    let message = sandbox::run(&config, &raw).await;
    let failed = matches!(message, WireMessage::Error { .. });

    let mut out = serde_json::to_vec(&message).map_err(|e| e.to_string())?;
    out.push(b'\n');
    let mut stdout = tokio::io::stdout();
    stdout.write_all(&out).await.map_err(|e| e.to_string())?;
    stdout.flush().await.map_err(|e| e.to_string())?;

    if failed {
        std::process::exit(1);
    }
    Ok(())
}

fn cmd_version() {
    println!("fncell version {}", env!("CARGO_PKG_VERSION"));
}

fn cmd_help() {
    println!(
        r#"fncell - rootless OCI function runner

USAGE:
    fncell <command> [options]

COMMANDS:
    start                 Serve function runs over a socket
    run <image>           Run one function: request on stdin, result on stdout
    version               Show version info
    help                  Show this help

OPTIONS:
    --listen <addr>           TCP listen address (default: 0.0.0.0:9547)
    --unix-socket <path>      Listen on a Unix socket instead of TCP
    --cache-dir <path>        Image and bundle cache directory (default: /fncell)
    --runtime <name>          OCI runtime binary (default: crun)
    --registry <host>         Default registry for bare references
    --default-image <ref>     Image used when a request names none
    --max-stdio-bytes <n>     Cap captured function output (0 = unbounded)
    --map-root-uid <uid>      Host UID mapped to container root (default: 100000)
    --map-root-gid <gid>      Host GID mapped to container root (default: 100000)

EXAMPLES:
    fncell start --unix-socket /run/fncell.sock --cache-dir /var/cache/fncell
    echo '{{}}' | fncell run example.com/team/fn:v1
"#
    );
}

// =============================================================================
// Main
// =============================================================================

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let command = match parse_args() {
        Ok(command) => command,
        Err(e) => {
            eprintln!("error: {}", e);
            cmd_help();
            return ExitCode::FAILURE;
        }
    };

    // Unsharing a user namespace requires a single-threaded process, so
    // the sandbox stage enters its namespaces before the async runtime
    // spawns any worker.
    let command = match command {
        Command::Sandbox { config, sync_fds } => {
            if let Some(fds) = sync_fds {
                let entered = parse_sync_fds(&fds).and_then(|(r, g)| enter_namespaces(r, g));
                if let Err(e) = entered {
                    eprintln!("error: {}", e);
                    return ExitCode::FAILURE;
                }
            }
            Command::Sandbox {
                config,
                sync_fds: None,
            }
        }
        other => other,
    };

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("error: start async runtime: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let result = runtime.block_on(async {
        match command {
            Command::Start { config } => cmd_start(config).await,
            Command::Run { config, image } => cmd_run(config, image).await,
            Command::Sandbox { config, .. } => cmd_sandbox(config).await,
            Command::Version => {
                cmd_version();
                Ok(())
            }
            Command::Help => {
                cmd_help();
                Ok(())
            }
        }
    });

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}
