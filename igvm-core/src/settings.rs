//! Fleet-wide constants.
//!
//! Ported from the reference implementation's `settings` module: tunables
//! that used to be plain module globals become `const`s or a small
//! `FleetSettings` struct that the CLI layer can override from its config
//! file without touching this crate.

use std::collections::HashMap;

use serde::Deserialize;

/// Swap file size created on every new guest, in MiB.
pub const DEFAULT_SWAP_SIZE_MIB: u64 = 1024;

/// Memory withheld from guest admission on every hypervisor, in MiB.
pub const HOST_RESERVED_MEMORY_MIB: u64 = 2 * 1024;

/// Disk space withheld for the root partition, in GiB.
pub const HOST_RESERVED_ROOT_GIB: u64 = 10;

/// Disk space withheld for swap, in GiB.
pub const HOST_RESERVED_SWAP_GIB: u64 = 16;

/// Default vCPU ceiling used when sizing `<vcpu>` independent of the VM's
/// requested `num_cpu` (the domain is always defined wide enough to grow
/// into, then pinned down to the live count).
pub const KVM_DEFAULT_MAX_CPUS: u32 = 24;

/// Memory hotplug granularity: `mem-set`/domain memory must be a multiple
/// of `128 MiB * num_numa_nodes`.
pub const MEMORY_HOTPLUG_GRANULARITY_MIB: u64 = 128;

/// Number of `<maxMemory slots=.. >` hotplug DIMM slots offered per domain.
pub const MAX_MEMORY_SLOTS: u32 = 16;

/// Abandoned-lock timeout for `igvm_locked`, in seconds.
pub const LOCK_TIMEOUT_SECS: i64 = 2 * 60 * 60;

/// Retention window for `retired` VMs before the housekeeping sweep deletes
/// them, in days.
pub const RETIRED_VM_DELETION_DAYS: i64 = 7;

/// Retention window for a migrated-away guest's renamed source LV before the
/// housekeeping sweep removes it outright, in days. Kept shorter than
/// [`RETIRED_VM_DELETION_DAYS`] since this storage backs no inventory object
/// any more and exists only to let a bad migration be recovered from.
pub const MIGRATED_LV_DELETION_DAYS: i64 = 3;

/// Suffix appended to a source LV's name when it's kept around after a
/// migration instead of being destroyed immediately (`<lv_name>.migrated.<unix_ts>`).
pub const MIGRATED_LV_SUFFIX: &str = "migrated";

/// Upper bound on concurrent constraint/preference evaluations during
/// hypervisor selection (spec §5: "bounded parallel pool (<= 32
/// concurrent checks)").
pub const SELECTOR_MAX_CONCURRENCY: usize = 32;

/// `puppet cert clean`/`puppetserver ca clean` retry count (spec §7:
/// "puppet cert clean → retry up to 10× (CRL regeneration race)").
pub const PUPPET_CERT_CLEAN_RETRIES: u32 = 10;

/// CPU model lookup table keyed by `hardware_model`, mirroring
/// `KVM_HWMODEL_TO_CPUMODEL` in the reference settings module. Only models
/// qemu >= 2.3 can expose; anything absent here falls back to
/// `host-passthrough`.
pub fn cpu_model_for_hardware(hardware_model: &str) -> Option<&'static str> {
    static TABLE: &[(&str, &str)] = &[
        ("Dell_M610", "Nehalem"),
        ("Dell_M710", "Nehalem"),
        ("Dell_M620", "SandyBridge"),
        ("Dell_M630", "SandyBridge"),
        ("Dell_R620", "SandyBridge"),
    ];
    TABLE
        .iter()
        .find(|(hw, _)| *hw == hardware_model)
        .map(|(_, model)| *model)
}

/// Block device name a guest's root disk is attached as, keyed by
/// hypervisor kind.
pub fn vm_block_device_name(hypervisor_kind: &str) -> &'static str {
    match hypervisor_kind {
        "xen" => "xvda1",
        _ => "vda",
    }
}

/// Fleet-wide settings that the CLI's config file may override; everything
/// here has a sensible production default so a bare `igvm` invocation with
/// no config file still works.
#[derive(Debug, Clone)]
pub struct FleetSettings {
    /// `IGVM_SSH_USER` equivalent: user to connect to hypervisors/guests as.
    pub ssh_user: String,
    /// `IGVM_MODE`: production or testing; testing restricts hypervisor
    /// selection to `environment=testing` hosts.
    pub mode: Mode,
    /// Puppet CA hosts eligible to sign/clean a new guest's certificate.
    pub puppet_ca_masters: Vec<String>,
    /// How to resolve a VM's `puppet_ca` attribute into the actual host to
    /// run `puppet cert clean` on, keyed by the `puppet_ca` value itself
    /// (spec §4.G, ported from `igvm/puppet.py::get_puppet_ca`'s
    /// `servertype` dispatch). A `puppet_ca` absent from this map is
    /// resolved as [`PuppetCaKind::Vm`] (the CA host named directly).
    pub puppet_ca_kind: HashMap<String, PuppetCaKind>,
    /// Default resolvers written into a freshly built guest's
    /// `/etc/resolv.conf` fallback.
    pub default_dns_servers: Vec<String>,
    /// Extra per-project migration URI overrides, keyed by `(src_os,
    /// dst_os)`, falling back to a single default template otherwise.
    pub migration_uri_template: String,
}

/// Resolution strategy for a VM's `puppet_ca` attribute (ported from
/// `igvm/puppet.py::get_puppet_ca`'s `servertype` check, which only
/// accepts `vm`/`public_domain`/`loadbalancer`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PuppetCaKind {
    /// `puppet_ca` names the signing host directly.
    Vm,
    /// `puppet_ca` names a domain fronting a pool of CA nodes; resolve to
    /// whichever pool member is online.
    PublicDomain,
    /// `puppet_ca` names a load balancer VM fronting a pool of CA nodes;
    /// resolve to whichever pool member is online.
    LoadBalancer,
}

/// `IGVM_MODE` environment variable value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Production,
    Testing,
}

impl Mode {
    pub fn from_env() -> Self {
        match std::env::var("IGVM_MODE").as_deref() {
            Ok("testing") => Mode::Testing,
            _ => Mode::Production,
        }
    }
}

impl Default for FleetSettings {
    fn default() -> Self {
        Self {
            ssh_user: std::env::var("IGVM_SSH_USER").unwrap_or_else(|_| "igvm".to_string()),
            mode: Mode::from_env(),
            puppet_ca_masters: Vec::new(),
            puppet_ca_kind: HashMap::new(),
            default_dns_servers: vec!["8.8.8.8".to_string(), "8.8.4.4".to_string()],
            migration_uri_template: "qemu+tls://{host}/system".to_string(),
        }
    }
}

impl FleetSettings {
    /// Render the libvirt migration target URI for a destination host.
    pub fn migration_uri(&self, dst_host: &str) -> String {
        self.migration_uri_template.replace("{host}", dst_host)
    }
}

/// Per-hardware-model maximum guest memory, used to size
/// `<maxMemory slots=16 unit='MiB'>`. Kept separate from the CPU model
/// table since the two are looked up independently in the source.
pub fn max_memory_mib_for_hardware(hardware_model: &str, current_mib: u64) -> u64 {
    let configured: HashMap<&str, u64> = HashMap::from([
        ("Dell_M610", 98_304u64),
        ("Dell_M710", 98_304u64),
        ("Dell_M620", 196_608u64),
        ("Dell_M630", 262_144u64),
        ("Dell_R620", 262_144u64),
    ]);
    configured
        .get(hardware_model)
        .copied()
        .unwrap_or(current_mib)
        .max(current_mib)
}
