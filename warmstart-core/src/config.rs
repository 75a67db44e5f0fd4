// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! YAML configuration parser with strict schema validation.
//!
//! Validates orchestrator settings at boot-up time.
//! Any invalid field results in a HardValidationError that prevents startup.

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::control_plane::MachineConfig;
use crate::error::{HardValidationError, LifecycleError, LifecycleResult};
use crate::network::Ipv4Cidr;

/// Kernel command line used for every guest.
pub const DEFAULT_KERNEL_ARGS: &str = "ro noapic reboot=k panic=1 pci=off nomodules systemd.log_color=false systemd.unit=firecracker.target init=/sbin/overlay-init tsc=reliable quiet 8250.nr_uarts=0 ipv6.disable=1";

const MIN_MEM_SIZE_MIB: u32 = 128;
const MAX_MEM_SIZE_MIB: u32 = 32 * 1024;
const MAX_VCPU_COUNT: u32 = 32;

/// Raw orchestrator configuration as parsed from YAML (before validation).
#[derive(Debug, Deserialize)]
struct RawOrchestratorConfig {
    #[serde(default = "default_snapshots_enabled")]
    snapshots_enabled: bool,
    #[serde(default = "default_snapshot_dir")]
    snapshot_dir: String,
    #[serde(default)]
    host_iface: String,
    #[serde(default = "default_snapshotter")]
    snapshotter: String,
    #[serde(default = "default_vcpu_count")]
    vcpu_count: u32,
    #[serde(default = "default_mem_size_mib")]
    mem_size_mib: u32,
    #[serde(default = "default_kernel_args")]
    kernel_args: String,
    #[serde(default = "default_vm_create_timeout_secs")]
    vm_create_timeout_secs: u32,
    #[serde(default = "default_cold_boot_timeout_ms")]
    cold_boot_timeout_ms: u64,
    #[serde(default = "default_snapshot_timeout_ms")]
    snapshot_timeout_ms: u64,
    #[serde(default = "default_restore_timeout_ms")]
    restore_timeout_ms: u64,
    #[serde(default = "default_teardown_timeout_ms")]
    teardown_timeout_ms: u64,
    #[serde(default = "default_stop_grace_ms")]
    stop_grace_ms: u64,
    #[serde(default)]
    network: RawNetworkConfig,
    #[serde(default)]
    dns: RawDnsConfig,
}

fn default_snapshots_enabled() -> bool {
    true
}

fn default_snapshot_dir() -> String {
    "/var/lib/warmstart/snapshots".to_string()
}

fn default_snapshotter() -> String {
    "devmapper".to_string()
}

fn default_vcpu_count() -> u32 {
    1
}

fn default_mem_size_mib() -> u32 {
    256
}

fn default_kernel_args() -> String {
    DEFAULT_KERNEL_ARGS.to_string()
}

fn default_vm_create_timeout_secs() -> u32 {
    100
}

fn default_cold_boot_timeout_ms() -> u64 {
    5 * 60 * 1000
}

fn default_snapshot_timeout_ms() -> u64 {
    3 * 60 * 1000
}

fn default_restore_timeout_ms() -> u64 {
    2 * 60 * 1000
}

fn default_teardown_timeout_ms() -> u64 {
    2 * 60 * 1000
}

fn default_stop_grace_ms() -> u64 {
    500 // some guests need extra time to die after the task exits
}

impl Default for RawOrchestratorConfig {
    fn default() -> Self {
        Self {
            snapshots_enabled: default_snapshots_enabled(),
            snapshot_dir: default_snapshot_dir(),
            host_iface: String::new(),
            snapshotter: default_snapshotter(),
            vcpu_count: default_vcpu_count(),
            mem_size_mib: default_mem_size_mib(),
            kernel_args: default_kernel_args(),
            vm_create_timeout_secs: default_vm_create_timeout_secs(),
            cold_boot_timeout_ms: default_cold_boot_timeout_ms(),
            snapshot_timeout_ms: default_snapshot_timeout_ms(),
            restore_timeout_ms: default_restore_timeout_ms(),
            teardown_timeout_ms: default_teardown_timeout_ms(),
            stop_grace_ms: default_stop_grace_ms(),
            network: RawNetworkConfig::default(),
            dns: RawDnsConfig::default(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawNetworkConfig {
    #[serde(default = "default_cidr")]
    cidr: String,
}

fn default_cidr() -> String {
    "172.16.0.0/16".to_string()
}

impl Default for RawNetworkConfig {
    fn default() -> Self {
        Self {
            cidr: default_cidr(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawDnsConfig {
    #[serde(default = "default_cluster_lookup")]
    cluster_lookup: bool,
    #[serde(default = "default_fallback")]
    fallback: Vec<String>,
}

fn default_cluster_lookup() -> bool {
    true
}

fn default_fallback() -> Vec<String> {
    vec!["8.8.8.8".to_string()]
}

impl Default for RawDnsConfig {
    fn default() -> Self {
        Self {
            cluster_lookup: default_cluster_lookup(),
            fallback: default_fallback(),
        }
    }
}

/// Raw root configuration file.
#[derive(Debug, Default, Deserialize)]
struct RawConfig {
    #[serde(default)]
    orchestrator: RawOrchestratorConfig,
}

/// Per-operation deadlines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    pub cold_boot: Duration,
    pub snapshot: Duration,
    pub restore: Duration,
    pub teardown: Duration,
    /// Delay between task exit and task deletion.
    pub stop_grace: Duration,
}

/// Nameserver resolution settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsConfig {
    /// Look up the cluster DNS service address before falling back.
    pub cluster_lookup: bool,
    pub fallback: Vec<Ipv4Addr>,
}

/// Validated orchestrator configuration.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub snapshots_enabled: bool,
    pub snapshot_dir: PathBuf,
    pub host_iface: String,
    pub snapshotter: String,
    pub machine: MachineConfig,
    pub kernel_args: String,
    pub vm_create_timeout_secs: u32,
    pub timeouts: Timeouts,
    pub network: Ipv4Cidr,
    pub dns: DnsConfig,
}

impl OrchestratorConfig {
    /// Sets the snapshot mode on or off.
    pub fn with_snapshots(mut self, enabled: bool) -> Self {
        self.snapshots_enabled = enabled;
        self
    }

    /// Sets the base directory for snapshot artifacts.
    pub fn with_snapshot_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.snapshot_dir = dir.into();
        self
    }

    /// Sets the host interface the VMs link to.
    pub fn with_host_iface(mut self, iface: impl Into<String>) -> Self {
        self.host_iface = iface.into();
        self
    }

    pub fn with_timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Disables the cluster DNS lookup, using only the fallback resolvers.
    pub fn without_cluster_dns(mut self) -> Self {
        self.dns.cluster_lookup = false;
        self
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            snapshots_enabled: default_snapshots_enabled(),
            snapshot_dir: PathBuf::from(default_snapshot_dir()),
            host_iface: String::new(),
            snapshotter: default_snapshotter(),
            machine: MachineConfig {
                vcpu_count: default_vcpu_count(),
                mem_size_mib: default_mem_size_mib(),
            },
            kernel_args: default_kernel_args(),
            vm_create_timeout_secs: default_vm_create_timeout_secs(),
            timeouts: Timeouts {
                cold_boot: Duration::from_millis(default_cold_boot_timeout_ms()),
                snapshot: Duration::from_millis(default_snapshot_timeout_ms()),
                restore: Duration::from_millis(default_restore_timeout_ms()),
                teardown: Duration::from_millis(default_teardown_timeout_ms()),
                stop_grace: Duration::from_millis(default_stop_grace_ms()),
            },
            network: Ipv4Cidr::default(),
            dns: DnsConfig {
                cluster_lookup: default_cluster_lookup(),
                fallback: vec![Ipv4Addr::new(8, 8, 8, 8)],
            },
        }
    }
}

/// Complete validated configuration.
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub orchestrator: OrchestratorConfig,
}

/// Configuration loader with strict validation.
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load and validate configuration from a YAML file.
    /// Returns HardValidationError for any invalid fields.
    pub fn load_file(path: impl AsRef<Path>) -> LifecycleResult<Config> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(LifecycleError::ConfigNotFound {
                path: path.to_path_buf(),
            });
        }

        let content = std::fs::read_to_string(path).map_err(|e| LifecycleError::Io {
            context: "reading config file",
            source: e,
        })?;

        Self::load_string(&content)
    }

    /// Load and validate configuration from a YAML string.
    pub fn load_string(content: &str) -> LifecycleResult<Config> {
        let raw: RawConfig = if content.trim().is_empty() {
            RawConfig::default()
        } else {
            serde_yaml::from_str(content).map_err(|e| LifecycleError::ConfigParse {
                message: format!("YAML parse error: {}", e),
            })?
        };

        Ok(Config {
            orchestrator: Self::validate_orchestrator(raw.orchestrator)?,
        })
    }

    /// Validate orchestrator configuration.
    fn validate_orchestrator(raw: RawOrchestratorConfig) -> Result<OrchestratorConfig, HardValidationError> {
        let snapshot_dir = PathBuf::from(&raw.snapshot_dir);
        if !snapshot_dir.is_absolute() {
            return Err(HardValidationError::InvalidFieldValue {
                field: "snapshot_dir",
                value: raw.snapshot_dir,
                reason: "Snapshot directory must be an absolute path".to_string(),
            });
        }

        if raw.snapshotter.is_empty() {
            return Err(HardValidationError::MissingRequiredField {
                field: "snapshotter",
                context: "orchestrator".to_string(),
            });
        }

        if raw.vcpu_count == 0 || raw.vcpu_count > MAX_VCPU_COUNT {
            return Err(HardValidationError::InvalidFieldValue {
                field: "vcpu_count",
                value: raw.vcpu_count.to_string(),
                reason: format!("Must be between 1 and {}", MAX_VCPU_COUNT),
            });
        }

        if !(MIN_MEM_SIZE_MIB..=MAX_MEM_SIZE_MIB).contains(&raw.mem_size_mib) {
            return Err(HardValidationError::InvalidFieldValue {
                field: "mem_size_mib",
                value: raw.mem_size_mib.to_string(),
                reason: format!(
                    "Must be between {} and {} MiB",
                    MIN_MEM_SIZE_MIB, MAX_MEM_SIZE_MIB
                ),
            });
        }

        if raw.vm_create_timeout_secs == 0 {
            return Err(HardValidationError::InvalidFieldValue {
                field: "vm_create_timeout_secs",
                value: "0".to_string(),
                reason: "Timeout must be greater than 0".to_string(),
            });
        }

        let timeouts = Timeouts {
            cold_boot: Self::non_zero_ms("cold_boot_timeout_ms", raw.cold_boot_timeout_ms)?,
            snapshot: Self::non_zero_ms("snapshot_timeout_ms", raw.snapshot_timeout_ms)?,
            restore: Self::non_zero_ms("restore_timeout_ms", raw.restore_timeout_ms)?,
            teardown: Self::non_zero_ms("teardown_timeout_ms", raw.teardown_timeout_ms)?,
            stop_grace: Duration::from_millis(raw.stop_grace_ms),
        };

        let network: Ipv4Cidr = raw.network.cidr.parse()?;

        let mut fallback = Vec::with_capacity(raw.dns.fallback.len());
        for ns in &raw.dns.fallback {
            let addr = ns
                .parse::<Ipv4Addr>()
                .map_err(|e| HardValidationError::InvalidFieldValue {
                    field: "dns.fallback",
                    value: ns.clone(),
                    reason: e.to_string(),
                })?;
            fallback.push(addr);
        }
        if fallback.is_empty() {
            return Err(HardValidationError::MissingRequiredField {
                field: "dns.fallback",
                context: "orchestrator".to_string(),
            });
        }

        Ok(OrchestratorConfig {
            snapshots_enabled: raw.snapshots_enabled,
            snapshot_dir,
            host_iface: raw.host_iface,
            snapshotter: raw.snapshotter,
            machine: MachineConfig {
                vcpu_count: raw.vcpu_count,
                mem_size_mib: raw.mem_size_mib,
            },
            kernel_args: raw.kernel_args,
            vm_create_timeout_secs: raw.vm_create_timeout_secs,
            timeouts,
            network,
            dns: DnsConfig {
                cluster_lookup: raw.dns.cluster_lookup,
                fallback,
            },
        })
    }

    fn non_zero_ms(field: &'static str, ms: u64) -> Result<Duration, HardValidationError> {
        if ms == 0 {
            return Err(HardValidationError::InvalidFieldValue {
                field,
                value: "0".to_string(),
                reason: "Timeout must be greater than 0".to_string(),
            });
        }
        Ok(Duration::from_millis(ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const VALID_CONFIG: &str = r#"
orchestrator:
  snapshots_enabled: false
  snapshot_dir: /tmp/warmstart/snapshots
  host_iface: eth0
  vcpu_count: 2
  mem_size_mib: 512
  restore_timeout_ms: 60000
  network:
    cidr: 10.10.0.0/24
  dns:
    cluster_lookup: false
    fallback: ["1.1.1.1", "8.8.8.8"]
"#;

    #[test]
    fn test_valid_config() {
        let config = ConfigLoader::load_string(VALID_CONFIG).unwrap().orchestrator;
        assert!(!config.snapshots_enabled);
        assert_eq!(config.host_iface, "eth0");
        assert_eq!(config.machine.vcpu_count, 2);
        assert_eq!(config.machine.mem_size_mib, 512);
        assert_eq!(config.timeouts.restore, Duration::from_secs(60));
        assert_eq!(config.network.prefix(), 24);
        assert!(!config.dns.cluster_lookup);
        assert_eq!(config.dns.fallback.len(), 2);
    }

    #[test]
    fn test_defaults_applied() {
        let config = ConfigLoader::load_string("").unwrap().orchestrator;
        assert!(config.snapshots_enabled);
        assert_eq!(config.snapshotter, "devmapper");
        assert_eq!(config.machine.vcpu_count, 1);
        assert_eq!(config.machine.mem_size_mib, 256);
        assert_eq!(config.vm_create_timeout_secs, 100);
        assert_eq!(config.timeouts.cold_boot, Duration::from_secs(300));
        assert_eq!(config.timeouts.snapshot, Duration::from_secs(180));
        assert_eq!(config.timeouts.restore, Duration::from_secs(120));
        assert_eq!(config.timeouts.stop_grace, Duration::from_millis(500));
        assert_eq!(config.dns.fallback, vec![Ipv4Addr::new(8, 8, 8, 8)]);
    }

    #[test]
    fn test_relative_snapshot_dir_rejected() {
        let yaml = r#"
orchestrator:
  snapshot_dir: snapshots
"#;
        assert!(ConfigLoader::load_string(yaml).is_err());
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let yaml = r#"
orchestrator:
  snapshot_timeout_ms: 0
"#;
        assert!(ConfigLoader::load_string(yaml).is_err());
    }

    #[test]
    fn test_memory_out_of_bounds() {
        let yaml = r#"
orchestrator:
  mem_size_mib: 64
"#;
        assert!(ConfigLoader::load_string(yaml).is_err());
    }

    #[test]
    fn test_bad_nameserver_rejected() {
        let yaml = r#"
orchestrator:
  dns:
    fallback: ["dns.google"]
"#;
        assert!(ConfigLoader::load_string(yaml).is_err());
    }

    #[test]
    fn test_default_matches_empty_file() {
        let loaded = ConfigLoader::load_string("").unwrap().orchestrator;
        let built = OrchestratorConfig::default();
        assert_eq!(loaded.snapshot_dir, built.snapshot_dir);
        assert_eq!(loaded.machine, built.machine);
        assert_eq!(loaded.kernel_args, built.kernel_args);
        assert_eq!(loaded.timeouts, built.timeouts);
        assert_eq!(loaded.network, built.network);
        assert_eq!(loaded.dns, built.dns);
    }

    #[test]
    fn test_builder_options() {
        let config = OrchestratorConfig::default()
            .with_snapshots(false)
            .with_host_iface("ens3")
            .without_cluster_dns();
        assert!(!config.snapshots_enabled);
        assert_eq!(config.host_iface, "ens3");
        assert!(!config.dns.cluster_lookup);
    }
}
