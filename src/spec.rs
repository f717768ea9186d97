//! OCI runtime spec generation.
//!
//! Builds the base execution spec for a function run and exposes fallible
//! mutators that add resource limits and network policy before the bundle
//! is finalized. Resource quantities use Kubernetes-style notation:
//! `500m` CPU is half a core, `500Mi` memory is 500 * 1024 * 1024 bytes.

use serde::{Deserialize, Serialize};

use crate::constants::OCI_RUNTIME_SPEC_VERSION;
use crate::error::{Error, Result};
use crate::pull::Image;

/// CFS scheduler period used for CPU quotas, in microseconds.
const CPU_PERIOD_USEC: u64 = 100_000;

/// cgroups default CPU shares, corresponding to one full core.
const CPU_SHARES_PER_CORE: u64 = 1024;

// =============================================================================
// Spec Model
// =============================================================================

/// OCI Runtime Spec (`config.json`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeSpec {
    pub oci_version: String,
    pub root: Root,
    pub process: Process,
    pub hostname: String,
    pub mounts: Vec<Mount>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub linux: Option<Linux>,
}

/// Root filesystem config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Root {
    pub path: String,
    pub readonly: bool,
}

/// Process config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Process {
    pub terminal: bool,
    pub user: User,
    pub args: Vec<String>,
    pub env: Vec<String>,
    pub cwd: String,
}

/// In-container user identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub uid: u32,
    pub gid: u32,
}

/// Mount config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Mount {
    pub destination: String,
    #[serde(rename = "type")]
    pub mount_type: String,
    pub source: String,
    #[serde(default)]
    pub options: Vec<String>,
}

/// Linux-specific config.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Linux {
    pub namespaces: Vec<Namespace>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resources: Option<Resources>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub masked_paths: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub readonly_paths: Vec<String>,
}

/// Namespace config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Namespace {
    #[serde(rename = "type")]
    pub ns_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

/// Resource limits.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Resources {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory: Option<MemoryLimit>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu: Option<CpuLimit>,
}

/// Memory ceiling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryLimit {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<i64>,
}

/// CPU quota/period/shares.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CpuLimit {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shares: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quota: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub period: Option<u64>,
}

// =============================================================================
// Construction and Mutators
// =============================================================================

impl RuntimeSpec {
    /// Builds the base rootless spec for a run.
    ///
    /// The container gets fresh mount, PID, IPC, UTS, and network
    /// namespaces (the user namespace belongs to the launcher's sandbox
    /// stage, which the container shares), the image's entrypoint, and no
    /// resource limits. Mutators below add limits and network policy.
    pub fn base(image: &Image, run_id: &str) -> Self {
        let cfg = &image.config().config;

        let mut args: Vec<String> = cfg.entrypoint.clone();
        args.extend(cfg.cmd.iter().cloned());
        if args.is_empty() {
            args.push("/bin/sh".to_string());
        }

        let mut env = cfg.env.clone();
        if !env.iter().any(|e| e.starts_with("PATH=")) {
            env.push(
                "PATH=/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin".to_string(),
            );
        }

        let cwd = if cfg.working_dir.is_empty() {
            "/".to_string()
        } else {
            cfg.working_dir.clone()
        };

        Self {
            oci_version: OCI_RUNTIME_SPEC_VERSION.to_string(),
            root: Root {
                path: "rootfs".to_string(),
                readonly: false,
            },
            process: Process {
                terminal: false,
                user: User { uid: 0, gid: 0 },
                args,
                env,
                cwd,
            },
            hostname: run_id.to_string(),
            mounts: default_mounts(),
            linux: Some(Linux {
                namespaces: vec![
                    Namespace { ns_type: "pid".to_string(), path: None },
                    Namespace { ns_type: "ipc".to_string(), path: None },
                    Namespace { ns_type: "uts".to_string(), path: None },
                    Namespace { ns_type: "mount".to_string(), path: None },
                    Namespace { ns_type: "network".to_string(), path: None },
                ],
                resources: None,
                masked_paths: [
                    "/proc/acpi",
                    "/proc/kcore",
                    "/proc/keys",
                    "/proc/latency_stats",
                    "/proc/sched_debug",
                    "/proc/timer_list",
                    "/sys/firmware",
                ]
                .iter()
                .map(|s| s.to_string())
                .collect(),
                readonly_paths: [
                    "/proc/bus",
                    "/proc/fs",
                    "/proc/irq",
                    "/proc/sys",
                    "/proc/sysrq-trigger",
                ]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            }),
        }
    }

    /// Limits container CPU to a Kubernetes-style quantity of cores, e.g.
    /// `500m` for half a core.
    pub fn with_cpu_limit(&mut self, quantity: &str) -> Result<()> {
        let millis = parse_cpu_millis(quantity)?;
        let cpu = CpuLimit {
            shares: Some(millis * CPU_SHARES_PER_CORE / 1000),
            quota: Some((millis * CPU_PERIOD_USEC / 1000) as i64),
            period: Some(CPU_PERIOD_USEC),
        };
        self.resources_mut().cpu = Some(cpu);
        Ok(())
    }

    /// Limits container memory to a Kubernetes-style byte quantity, e.g.
    /// `500Mi` for 500 * 1024 * 1024 bytes.
    pub fn with_memory_limit(&mut self, quantity: &str) -> Result<()> {
        let bytes = parse_memory_bytes(quantity)?;
        self.resources_mut().memory = Some(MemoryLimit {
            limit: Some(bytes as i64),
        });
        Ok(())
    }

    /// Configures the container to share the launcher's network namespace
    /// by omitting network namespace isolation.
    pub fn with_host_network(&mut self) -> Result<()> {
        if let Some(linux) = &mut self.linux {
            linux.namespaces.retain(|ns| ns.ns_type != "network");
        }
        Ok(())
    }

    /// True when the spec creates a private network namespace.
    pub fn has_network_namespace(&self) -> bool {
        self.linux
            .as_ref()
            .is_some_and(|l| l.namespaces.iter().any(|ns| ns.ns_type == "network"))
    }

    fn resources_mut(&mut self) -> &mut Resources {
        self.linux
            .get_or_insert_with(|| Linux {
                namespaces: Vec::new(),
                resources: None,
                masked_paths: Vec::new(),
                readonly_paths: Vec::new(),
            })
            .resources
            .get_or_insert_with(Resources::default)
    }
}

fn default_mounts() -> Vec<Mount> {
    vec![
        Mount {
            destination: "/proc".to_string(),
            mount_type: "proc".to_string(),
            source: "proc".to_string(),
            options: vec![],
        },
        Mount {
            destination: "/dev".to_string(),
            mount_type: "tmpfs".to_string(),
            source: "tmpfs".to_string(),
            options: vec![
                "nosuid".to_string(),
                "strictatime".to_string(),
                "mode=755".to_string(),
                "size=65536k".to_string(),
            ],
        },
        Mount {
            destination: "/dev/pts".to_string(),
            mount_type: "devpts".to_string(),
            source: "devpts".to_string(),
            options: vec![
                "nosuid".to_string(),
                "noexec".to_string(),
                "newinstance".to_string(),
                "ptmxmode=0666".to_string(),
            ],
        },
        Mount {
            destination: "/dev/shm".to_string(),
            mount_type: "tmpfs".to_string(),
            source: "shm".to_string(),
            options: vec![
                "nosuid".to_string(),
                "noexec".to_string(),
                "nodev".to_string(),
                "mode=1777".to_string(),
                "size=65536k".to_string(),
            ],
        },
        Mount {
            destination: "/sys".to_string(),
            mount_type: "sysfs".to_string(),
            source: "sysfs".to_string(),
            options: vec![
                "nosuid".to_string(),
                "noexec".to_string(),
                "nodev".to_string(),
                "ro".to_string(),
            ],
        },
    ]
}

// =============================================================================
// Quantity Parsing
// =============================================================================

/// Parses a CPU quantity into millicores. Accepts `500m`, `1`, `2`, `0.5`.
fn parse_cpu_millis(quantity: &str) -> Result<u64> {
    let bad = |reason: &str| Error::LimitParse {
        quantity: quantity.to_string(),
        reason: reason.to_string(),
    };

    if quantity.is_empty() {
        return Err(bad("empty quantity"));
    }

    if let Some(millis) = quantity.strip_suffix('m') {
        return millis
            .parse::<u64>()
            .map_err(|_| bad("millicores must be a whole number"));
    }

    let cores: f64 = quantity
        .parse()
        .map_err(|_| bad("expected cores (e.g. '1', '0.5') or millicores (e.g. '500m')"))?;
    if !cores.is_finite() || cores < 0.0 {
        return Err(bad("cores must be a non-negative number"));
    }
    Ok((cores * 1000.0).round() as u64)
}

/// Parses a memory quantity into bytes. Accepts plain integers, decimal
/// suffixes (`k`, `M`, `G`, `T`) and binary suffixes (`Ki`, `Mi`, `Gi`,
/// `Ti`).
fn parse_memory_bytes(quantity: &str) -> Result<u64> {
    let bad = |reason: &str| Error::LimitParse {
        quantity: quantity.to_string(),
        reason: reason.to_string(),
    };

    if quantity.is_empty() {
        return Err(bad("empty quantity"));
    }

    let (number, multiplier): (&str, u64) = if let Some(n) = quantity.strip_suffix("Ki") {
        (n, 1 << 10)
    } else if let Some(n) = quantity.strip_suffix("Mi") {
        (n, 1 << 20)
    } else if let Some(n) = quantity.strip_suffix("Gi") {
        (n, 1 << 30)
    } else if let Some(n) = quantity.strip_suffix("Ti") {
        (n, 1 << 40)
    } else if let Some(n) = quantity.strip_suffix('k') {
        (n, 1_000)
    } else if let Some(n) = quantity.strip_suffix('M') {
        (n, 1_000_000)
    } else if let Some(n) = quantity.strip_suffix('G') {
        (n, 1_000_000_000)
    } else if let Some(n) = quantity.strip_suffix('T') {
        (n, 1_000_000_000_000)
    } else {
        (quantity, 1)
    };

    let value: u64 = number
        .parse()
        .map_err(|_| bad("expected an integer with optional k/M/G/T or Ki/Mi/Gi/Ti suffix"))?;
    value
        .checked_mul(multiplier)
        .ok_or_else(|| bad("quantity overflows 64 bits"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pull::Image;
    use crate::store::image::ImageConfig;

    fn image() -> Image {
        let config: ImageConfig = serde_json::from_str(
            r#"{"config":{"Entrypoint":["/fn"],"Cmd":["--serve"],"Env":["A=1"],"WorkingDir":"/work"}}"#,
        )
        .unwrap();
        Image::new("sha256:feed".to_string(), Vec::new(), config)
    }

    #[test]
    fn test_base_spec_from_image_config() {
        let spec = RuntimeSpec::base(&image(), "run-1");
        assert_eq!(spec.process.args, vec!["/fn", "--serve"]);
        assert_eq!(spec.process.cwd, "/work");
        assert!(spec.process.env.iter().any(|e| e == "A=1"));
        assert!(spec.process.env.iter().any(|e| e.starts_with("PATH=")));
        assert_eq!(spec.process.user.uid, 0);
        assert!(spec.has_network_namespace());
        assert!(spec.linux.as_ref().unwrap().resources.is_none());
    }

    #[test]
    fn test_cpu_limit_half_core() {
        let mut spec = RuntimeSpec::base(&image(), "run-1");
        spec.with_cpu_limit("500m").unwrap();
        let cpu = spec.linux.unwrap().resources.unwrap().cpu.unwrap();
        assert_eq!(cpu.quota, Some(50_000));
        assert_eq!(cpu.period, Some(100_000));
        assert_eq!(cpu.shares, Some(512));
    }

    #[test]
    fn test_cpu_limit_whole_and_fractional_cores() {
        let mut spec = RuntimeSpec::base(&image(), "run-1");
        spec.with_cpu_limit("2").unwrap();
        let cpu = spec.linux.as_ref().unwrap().resources.as_ref().unwrap().cpu.clone().unwrap();
        assert_eq!(cpu.quota, Some(200_000));

        spec.with_cpu_limit("0.25").unwrap();
        let cpu = spec.linux.unwrap().resources.unwrap().cpu.unwrap();
        assert_eq!(cpu.quota, Some(25_000));
    }

    #[test]
    fn test_memory_limit_quantities() {
        assert_eq!(parse_memory_bytes("500Mi").unwrap(), 524_288_000);
        assert_eq!(parse_memory_bytes("1Gi").unwrap(), 1 << 30);
        assert_eq!(parse_memory_bytes("500M").unwrap(), 500_000_000);
        assert_eq!(parse_memory_bytes("1024").unwrap(), 1024);

        let mut spec = RuntimeSpec::base(&image(), "run-1");
        spec.with_memory_limit("500Mi").unwrap();
        let mem = spec.linux.unwrap().resources.unwrap().memory.unwrap();
        assert_eq!(mem.limit, Some(524_288_000));
    }

    #[test]
    fn test_malformed_quantities_rejected() {
        let mut spec = RuntimeSpec::base(&image(), "run-1");
        assert!(matches!(
            spec.with_cpu_limit("half"),
            Err(Error::LimitParse { .. })
        ));
        assert!(matches!(
            spec.with_memory_limit("500Zi"),
            Err(Error::LimitParse { .. })
        ));
        assert!(matches!(
            spec.with_memory_limit(""),
            Err(Error::LimitParse { .. })
        ));
    }

    #[test]
    fn test_host_network_removes_namespace() {
        let mut spec = RuntimeSpec::base(&image(), "run-1");
        spec.with_host_network().unwrap();
        assert!(!spec.has_network_namespace());
        // The other namespaces stay.
        let ns = &spec.linux.as_ref().unwrap().namespaces;
        assert!(ns.iter().any(|n| n.ns_type == "pid"));
        assert!(ns.iter().any(|n| n.ns_type == "mount"));
    }

    #[test]
    fn test_empty_entrypoint_falls_back_to_shell() {
        let img = Image::new(
            "sha256:feed".to_string(),
            Vec::new(),
            ImageConfig::default(),
        );
        let spec = RuntimeSpec::base(&img, "run-1");
        assert_eq!(spec.process.args, vec!["/bin/sh"]);
    }
}
