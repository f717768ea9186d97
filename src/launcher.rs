//! Privilege-separated sandbox launcher.
//!
//! Function content never runs in the server process. For each request the
//! launcher re-executes the current binary as a short-lived sandbox child;
//! the child's first act is to unshare fresh user, mount, and PID
//! namespaces, after which the two stages speak over stdin/stdout.
//!
//! ## ID Mapping
//!
//! A process cannot write its own ID maps once it has unshared a user
//! namespace, so the parent writes the child's `uid_map`/`gid_map`. The
//! stages synchronize over a pair of inherited pipes:
//!
//! ```text
//! child:  unshare(NEWUSER|NEWNS|NEWPID) ── ready ──▶ parent
//! parent: write setgroups, gid_map, uid_map ── go ──▶ child
//! child:  pull, bundle, invoke
//! ```
//!
//! Two mappings exist:
//!
//! - [`IdMapping::Range`]: a 65536-wide range rooted at a configured host
//!   ID, used when the server holds `CAP_SETUID` and `CAP_SETGID`. Gives
//!   containers a full ID range, so images with non-root users work.
//! - [`IdMapping::Current`]: maps only the server's own UID/GID to root,
//!   the single mapping an unprivileged process may write. Degraded but
//!   functional for images that run as root.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::constants::ID_MAP_SIZE;
use crate::error::{Error, Result};

/// Bit positions of relevant capabilities in `CapEff`.
const CAP_SETGID: u32 = 6;
const CAP_SETUID: u32 = 7;

/// How the sandbox child's user namespace is mapped onto host IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdMapping {
    /// Map container IDs `0..65536` onto host IDs starting at the given
    /// root UID/GID. Requires `CAP_SETUID`/`CAP_SETGID`.
    Range { root_uid: u32, root_gid: u32 },
    /// Map container root onto the server's own UID/GID only.
    Current,
}

impl IdMapping {
    /// Picks the widest mapping the server's capabilities allow.
    pub fn detect(map_root_uid: u32, map_root_gid: u32) -> Result<Self> {
        let caps = effective_capabilities()?;
        if has_capability(caps, CAP_SETUID) && has_capability(caps, CAP_SETGID) {
            Ok(Self::Range {
                root_uid: map_root_uid,
                root_gid: map_root_gid,
            })
        } else {
            warn!(
                "CAP_SETUID/CAP_SETGID unavailable, mapping only the current \
                 user into containers"
            );
            Ok(Self::Current)
        }
    }

    fn uid_map(&self) -> String {
        match self {
            Self::Range { root_uid, .. } => format!("0 {} {}\n", root_uid, ID_MAP_SIZE),
            Self::Current => format!("0 {} 1\n", unsafe { libc::geteuid() }),
        }
    }

    fn gid_map(&self) -> String {
        match self {
            Self::Range { root_gid, .. } => format!("0 {} {}\n", root_gid, ID_MAP_SIZE),
            Self::Current => format!("0 {} 1\n", unsafe { libc::getegid() }),
        }
    }
}

/// True when `bit` is set in the effective capability mask.
fn has_capability(cap_eff: u64, bit: u32) -> bool {
    cap_eff & (1 << bit) != 0
}

/// Reads this process's effective capability mask from `/proc`.
fn effective_capabilities() -> Result<u64> {
    let status = std::fs::read_to_string("/proc/self/status")
        .map_err(|e| Error::NamespaceSetup(format!("read /proc/self/status: {}", e)))?;
    parse_cap_eff(&status)
}

fn parse_cap_eff(status: &str) -> Result<u64> {
    let line = status
        .lines()
        .find(|l| l.starts_with("CapEff:"))
        .ok_or_else(|| Error::NamespaceSetup("no CapEff in /proc/self/status".to_string()))?;
    let hex = line["CapEff:".len()..].trim();
    u64::from_str_radix(hex, 16)
        .map_err(|e| Error::NamespaceSetup(format!("malformed CapEff '{}': {}", hex, e)))
}

// =============================================================================
// Launcher (parent side)
// =============================================================================

/// Spawns sandbox children for function runs.
pub struct Launcher {
    exe: PathBuf,
    /// Arguments passed to the sandbox stage (cache dir, registry, ...).
    sandbox_args: Vec<String>,
    mapping: IdMapping,
}

impl Launcher {
    /// Creates a launcher that re-executes the current binary.
    pub fn new(sandbox_args: Vec<String>, mapping: IdMapping) -> Result<Self> {
        // The path is resolved once at startup; a replaced binary on disk
        // must not change what gets executed mid-flight.
        let exe = std::fs::read_link("/proc/self/exe")
            .map_err(|e| Error::NamespaceSetup(format!("resolve /proc/self/exe: {}", e)))?;
        Ok(Self {
            exe,
            sandbox_args,
            mapping,
        })
    }

    #[cfg(test)]
    pub(crate) fn with_exe(exe: PathBuf, sandbox_args: Vec<String>, mapping: IdMapping) -> Self {
        Self {
            exe,
            sandbox_args,
            mapping,
        }
    }

    /// Runs one sandboxed function: writes `request` to the child's stdin
    /// and returns its stdout, which carries the child's wire response.
    ///
    /// A non-zero child exit with no stdout is a launch failure; a child
    /// that produced output gets to report its own, more precise, error.
    #[cfg(target_os = "linux")]
    pub async fn run(&self, request: &[u8], wait_timeout: Duration) -> Result<Vec<u8>> {
        let SyncPipes {
            ready_r,
            ready_w,
            go_r,
            go_w,
        } = SyncPipes::new()?;
        let mapping = self.mapping;

        // The child side inherits the two pipe ends by fd number.
        let mut command = tokio::process::Command::new(&self.exe);
        command
            .arg("sandbox")
            .arg(format!("--sync-fds={},{}", ready_w, go_r))
            .args(&self.sandbox_args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // The pipes are close-on-exec; only this child gets its two ends.
        unsafe {
            command.pre_exec(move || {
                for fd in [ready_w, go_r] {
                    if libc::fcntl(fd, libc::F_SETFD, 0) == -1 {
                        return Err(std::io::Error::last_os_error());
                    }
                }
                Ok(())
            });
        }
        let spawned = command.spawn();

        // The parent's copies of the child-side ends must go away, or a
        // child that dies before the handshake leaves the ready read
        // blocked forever.
        unsafe {
            libc::close(ready_w);
            libc::close(go_r);
        }

        let mut child = match spawned {
            Ok(child) => child,
            Err(e) => {
                unsafe {
                    libc::close(ready_r);
                    libc::close(go_w);
                }
                return Err(Error::NamespaceSetup(format!("spawn sandbox: {}", e)));
            }
        };

        let pid = match child.id() {
            Some(pid) => pid,
            None => {
                unsafe {
                    libc::close(ready_r);
                    libc::close(go_w);
                }
                return Err(Error::NamespaceSetup(
                    "sandbox exited during spawn".to_string(),
                ));
            }
        };

        // The handshake is short but blocking, so it runs off the runtime.
        let handshake = tokio::task::spawn_blocking(move || -> Result<()> {
            let mapped = wait_ready(ready_r).and_then(|_| write_id_maps(pid, &mapping));
            if let Err(e) = mapped {
                unsafe { libc::close(go_w) };
                return Err(e);
            }
            signal_go(go_w)
        })
        .await
        .map_err(|e| Error::NamespaceSetup(format!("handshake task: {}", e)))?;

        if let Err(e) = handshake {
            let _ = child.kill().await;
            return Err(e);
        }

        debug!(pid, "sandbox namespaces mapped");

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::NamespaceSetup("sandbox stdin unavailable".to_string()))?;
        stdin
            .write_all(request)
            .await
            .map_err(|e| Error::NamespaceSetup(format!("write request to sandbox: {}", e)))?;
        drop(stdin);

        let output = tokio::time::timeout(wait_timeout, child.wait_with_output())
            .await
            .map_err(|_| Error::RuntimeTimeout {
                timeout: wait_timeout,
            })?
            .map_err(|e| Error::NamespaceSetup(format!("wait for sandbox: {}", e)))?;

        if output.stdout.is_empty() && !output.status.success() {
            return Err(Error::NamespaceSetup(format!(
                "sandbox exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(output.stdout)
    }

    #[cfg(not(target_os = "linux"))]
    pub async fn run(&self, _request: &[u8], _wait_timeout: Duration) -> Result<Vec<u8>> {
        Err(Error::NamespaceSetup(
            "sandboxing requires Linux namespaces".to_string(),
        ))
    }
}

// =============================================================================
// Sandbox stage (child side)
// =============================================================================

/// Parses the `--sync-fds=<ready>,<go>` argument value.
pub fn parse_sync_fds(value: &str) -> Result<(i32, i32)> {
    let (ready, go) = value
        .split_once(',')
        .ok_or_else(|| Error::Config(format!("malformed --sync-fds '{}'", value)))?;
    let parse = |s: &str| {
        s.parse::<i32>()
            .map_err(|_| Error::Config(format!("malformed --sync-fds '{}'", value)))
    };
    Ok((parse(ready)?, parse(go)?))
}

/// Entered by the sandbox stage before anything else: unshares the
/// namespaces, then blocks until the parent has written this process's ID
/// maps.
///
/// The PID namespace applies to children of this process, which is where
/// the container runtime puts the function.
#[cfg(target_os = "linux")]
pub fn enter_namespaces(ready_fd: i32, go_fd: i32) -> Result<()> {
    let flags = libc::CLONE_NEWUSER | libc::CLONE_NEWNS | libc::CLONE_NEWPID;
    if unsafe { libc::unshare(flags) } != 0 {
        return Err(Error::NamespaceSetup(format!(
            "unshare: {}",
            std::io::Error::last_os_error()
        )));
    }

    let byte = [1u8];
    if unsafe { libc::write(ready_fd, byte.as_ptr().cast(), 1) } != 1 {
        return Err(Error::NamespaceSetup(
            "launcher went away before ID mapping".to_string(),
        ));
    }
    let mut buf = [0u8];
    let n = unsafe { libc::read(go_fd, buf.as_mut_ptr().cast(), 1) };
    unsafe {
        libc::close(ready_fd);
        libc::close(go_fd);
    }
    if n != 1 {
        return Err(Error::NamespaceSetup(
            "launcher went away during ID mapping".to_string(),
        ));
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub fn enter_namespaces(_ready_fd: i32, _go_fd: i32) -> Result<()> {
    Err(Error::NamespaceSetup(
        "sandboxing requires Linux namespaces".to_string(),
    ))
}

/// The two pipes backing the parent/child handshake.
///
/// Created close-on-exec so children spawned concurrently elsewhere in the
/// process (other runs' sandboxes, invoked runtimes) cannot inherit stray
/// copies and keep a pipe end alive past its owner. The intended sandbox
/// child re-enables its two ends just before exec.
#[cfg(target_os = "linux")]
struct SyncPipes {
    ready_r: i32,
    ready_w: i32,
    go_r: i32,
    go_w: i32,
}

#[cfg(target_os = "linux")]
impl SyncPipes {
    fn new() -> Result<Self> {
        let mut ready = [0i32; 2];
        let mut go = [0i32; 2];
        unsafe {
            if libc::pipe2(ready.as_mut_ptr(), libc::O_CLOEXEC) != 0 {
                return Err(Error::NamespaceSetup(format!(
                    "create sync pipes: {}",
                    std::io::Error::last_os_error()
                )));
            }
            if libc::pipe2(go.as_mut_ptr(), libc::O_CLOEXEC) != 0 {
                let e = std::io::Error::last_os_error();
                libc::close(ready[0]);
                libc::close(ready[1]);
                return Err(Error::NamespaceSetup(format!("create sync pipes: {}", e)));
            }
        }
        Ok(Self {
            ready_r: ready[0],
            ready_w: ready[1],
            go_r: go[0],
            go_w: go[1],
        })
    }
}

#[cfg(target_os = "linux")]
fn wait_ready(ready_r: i32) -> Result<()> {
    let mut buf = [0u8];
    let n = unsafe { libc::read(ready_r, buf.as_mut_ptr().cast(), 1) };
    unsafe { libc::close(ready_r) };
    if n != 1 {
        return Err(Error::NamespaceSetup(
            "sandbox exited before unsharing namespaces".to_string(),
        ));
    }
    Ok(())
}

#[cfg(target_os = "linux")]
fn signal_go(go_w: i32) -> Result<()> {
    let byte = [1u8];
    let n = unsafe { libc::write(go_w, byte.as_ptr().cast(), 1) };
    unsafe { libc::close(go_w) };
    if n != 1 {
        return Err(Error::NamespaceSetup(
            "sandbox went away during ID mapping".to_string(),
        ));
    }
    Ok(())
}

/// Writes the child's ID maps from the parent side.
///
/// `setgroups` must be denied before an unprivileged process may write
/// `gid_map`.
#[cfg(target_os = "linux")]
fn write_id_maps(pid: u32, mapping: &IdMapping) -> Result<()> {
    let proc_dir = format!("/proc/{}", pid);
    let write = |name: &str, content: &str| -> Result<()> {
        std::fs::write(format!("{}/{}", proc_dir, name), content)
            .map_err(|e| Error::NamespaceSetup(format!("write {}: {}", name, e)))
    };

    write("setgroups", "deny")?;
    write("gid_map", &mapping.gid_map())?;
    write("uid_map", &mapping.uid_map())
}
