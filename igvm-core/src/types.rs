//! The inventory data model: VM and hypervisor records as read from and
//! written back to the external inventory service ("serveradmin").

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Lifecycle state of a VM record, per spec §3:
/// `new -> (build) -> stopped -> (start) -> running <-> stopped -> (delete) -> retired`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VmLifecycleState {
    New,
    Stopped,
    Running,
    Maintenance,
    Retired,
}

/// Hypervisor admission state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HypervisorState {
    Online,
    /// Online and servable, but only to operations that pass
    /// `--ignore-reserved` (spec's `online_reserved`, ported from the
    /// reference CLI's "Force build/migration/... on a Host which has the
    /// state online_reserved" flag help text). A host gets this state when
    /// capacity is being held back for planned work without taking it out
    /// of the fleet entirely.
    #[serde(rename = "online_reserved")]
    OnlineReserved,
    Maintenance,
    Retired,
}

impl HypervisorState {
    /// Whether a hypervisor in this state may be selected for new
    /// placement or have a resize/migration applied to it. `Online` always
    /// admits; `OnlineReserved` only admits when the caller passed
    /// `--ignore-reserved`; `Maintenance`/`Retired` never admit.
    pub fn admits_operations(self, ignore_reserved: bool) -> bool {
        match self {
            HypervisorState::Online => true,
            HypervisorState::OnlineReserved => ignore_reserved,
            HypervisorState::Maintenance | HypervisorState::Retired => false,
        }
    }
}

/// Which virtualization technology a hypervisor runs. Xen is specified but
/// optional per spec §9; this crate's pipelines refuse to operate on a
/// hypervisor whose kind is not `Kvm`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HypervisorKind {
    Kvm,
    Xen,
}

/// A VM's inventory record (spec §3 "Inventory record").
///
/// This is the typed projection of the opaque attribute map the real
/// inventory service exposes; `dirty` tracks which fields have been
/// mutated locally so `commit` can push a minimal, conflict-checkable
/// write (spec §4.A: "a record behaves like a dirty-tracking dictionary").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmRecord {
    pub hostname: String,
    pub object_id: u64,
    pub intern_ip: std::net::IpAddr,
    pub memory_mib: u64,
    pub num_cpu: u32,
    pub disk_size_gib: u64,
    pub os: String,
    pub state: VmLifecycleState,
    pub puppet_ca: String,
    pub puppet_master: String,
    pub mac: HashSet<String>,
    pub sshfp: HashSet<String>,
    /// Hostname of the hosting hypervisor. Named `xen_host` in the
    /// reference inventory schema for historical reasons; kept as the
    /// field name here too since it is the literal attribute the
    /// inventory gateway reads and writes.
    pub xen_host: String,
    pub route_network: String,
    pub project: Option<String>,
    pub function: Option<String>,
    /// Serveradmin attributes this crate has no typed field for (e.g.
    /// `game_world`, `game_market`), consulted by selector constraints and
    /// preferences that are themselves generic over attribute name (spec
    /// §4.K `ServeradminAttribute`, `GameMasterDbDistribution`).
    #[serde(default)]
    pub extra: HashMap<String, String>,

    #[serde(skip)]
    pub(crate) dirty: HashSet<&'static str>,
}

impl VmRecord {
    /// Mark a field dirty. Setters on this type call this directly instead
    /// of exposing `pub` fields plus a separate tracking call, so dirtiness
    /// can never be forgotten.
    fn touch(&mut self, field: &'static str) {
        self.dirty.insert(field);
    }

    pub fn set_xen_host(&mut self, host: impl Into<String>) {
        self.xen_host = host.into();
        self.touch("xen_host");
    }

    pub fn set_memory_mib(&mut self, mib: u64) {
        self.memory_mib = mib;
        self.touch("memory_mib");
    }

    pub fn set_num_cpu(&mut self, n: u32) {
        self.num_cpu = n;
        self.touch("num_cpu");
    }

    pub fn set_disk_size_gib(&mut self, gib: u64) {
        self.disk_size_gib = gib;
        self.touch("disk_size_gib");
    }

    pub fn set_state(&mut self, state: VmLifecycleState) {
        self.state = state;
        self.touch("state");
    }

    pub fn set_intern_ip(&mut self, ip: std::net::IpAddr) {
        self.intern_ip = ip;
        self.touch("intern_ip");
    }

    pub fn set_hostname(&mut self, hostname: impl Into<String>) {
        self.hostname = hostname.into();
        self.touch("hostname");
    }

    pub fn add_sshfp(&mut self, entry: impl Into<String>) {
        self.sshfp.insert(entry.into());
        self.touch("sshfp");
    }

    pub fn add_mac(&mut self, entry: impl Into<String>) {
        self.mac.insert(entry.into());
        self.touch("mac");
    }

    /// Set an opaque attribute (e.g. `retired_since`), marking the whole
    /// `extra` map dirty so a commit pushes the updated value.
    pub fn set_extra(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.extra.insert(key.into(), value.into());
        self.touch("extra");
    }

    /// Domain name as defined in libvirt: `<object_id>_<hostname>` (spec §6
    /// "Domain-name scheme").
    pub fn domain_name(&self) -> String {
        format!("{}_{}", self.object_id, self.hostname)
    }

    /// Whether any field has been mutated locally since the last commit.
    pub fn is_dirty(&self) -> bool {
        !self.dirty.is_empty()
    }

    pub fn dirty_fields(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.dirty.iter().copied()
    }

    pub(crate) fn clear_dirty(&mut self) {
        self.dirty.clear();
    }
}

/// A hypervisor's inventory record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HypervisorRecord {
    pub hostname: String,
    pub object_id: u64,
    pub hypervisor: HypervisorKind,
    pub state: HypervisorState,
    pub vlan_networks: HashSet<String>,
    pub num_cpu: u32,
    pub memory_mib: u64,
    pub disk_size_gib: u64,
    pub hardware_model: String,
    pub environment: String,
    /// Hostnames of VMs this hypervisor reports hosting. Populated by the
    /// inventory gateway as a join, not stored verbatim on the remote
    /// record.
    pub vms: Vec<String>,
    pub cpu_util_pct: f64,
    /// Advisory per-resource lock (spec §4.F "Locking"); `None` means
    /// unlocked. Holds the Unix timestamp the lock was acquired.
    pub igvm_locked: Option<i64>,
    /// Serveradmin attributes this crate has no typed field for, e.g.
    /// `bladecenter` (co-residency grouping) consulted by selector
    /// constraints (spec §4.K `Bladecenter`).
    #[serde(default)]
    pub extra: HashMap<String, String>,

    #[serde(skip)]
    pub(crate) dirty: HashSet<&'static str>,
}

impl HypervisorRecord {
    fn touch(&mut self, field: &'static str) {
        self.dirty.insert(field);
    }

    pub fn acquire_lock(&mut self, now_unix: i64) {
        self.igvm_locked = Some(now_unix);
        self.touch("igvm_locked");
    }

    pub fn release_lock(&mut self) {
        self.igvm_locked = None;
        self.touch("igvm_locked");
    }

    /// Whether the lock, if any, is still valid (spec §4.F: "a lock older
    /// than the timeout ... is considered abandoned").
    pub fn is_locked(&self, now_unix: i64, timeout_secs: i64) -> bool {
        match self.igvm_locked {
            Some(ts) => now_unix - ts < timeout_secs,
            None => false,
        }
    }

    pub fn is_dirty(&self) -> bool {
        !self.dirty.is_empty()
    }

    pub(crate) fn clear_dirty(&mut self) {
        self.dirty.clear();
    }

    /// Free memory available for new guest admission, after the per-host
    /// reserve (spec §8 invariant: `sum(vm.memory) + HOST_RESERVED_MEMORY <= H.memory`).
    pub fn free_memory_mib(&self, used_by_vms_mib: u64) -> i64 {
        self.memory_mib as i64
            - used_by_vms_mib as i64
            - crate::settings::HOST_RESERVED_MEMORY_MIB as i64
    }

    /// Number of physical NUMA nodes, read from `/sys` on a live host by
    /// the libvirt gateway and cached here for XML synthesis and
    /// constraint checks that don't want to re-read sysfs.
    pub fn num_numa_nodes(&self, topology: &NumaTopology) -> usize {
        topology.nodes.len().max(1)
    }
}

/// Physical CPU topology of a hypervisor, as read from
/// `/sys/devices/system/node/node*/cpulist` (spec §4.H synthesis).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NumaTopology {
    /// One entry per NUMA node; each is the set of physical CPU numbers
    /// that node owns, in ascending order.
    pub nodes: Vec<Vec<u32>>,
}

impl NumaTopology {
    pub fn num_nodes(&self) -> usize {
        self.nodes.len().max(1)
    }

    /// libvirt `cpuset` string for node `node_idx` (e.g. `"0-5,12-17"`).
    pub fn cpuset_for_node(&self, node_idx: usize) -> String {
        let Some(cpus) = self.nodes.get(node_idx) else {
            return String::new();
        };
        compress_ranges(cpus)
    }
}

/// Compress a sorted list of integers into a libvirt-style range string,
/// e.g. `[0,1,2,5,6]` -> `"0-2,5-6"`.
fn compress_ranges(values: &[u32]) -> String {
    if values.is_empty() {
        return String::new();
    }
    let mut ranges = Vec::new();
    let mut start = values[0];
    let mut prev = values[0];
    for &v in &values[1..] {
        if v == prev + 1 {
            prev = v;
            continue;
        }
        ranges.push((start, prev));
        start = v;
        prev = v;
    }
    ranges.push((start, prev));
    ranges
        .into_iter()
        .map(|(a, b)| if a == b { a.to_string() } else { format!("{}-{}", a, b) })
        .collect::<Vec<_>>()
        .join(",")
}

/// State read back from a live libvirt domain, compared against inventory
/// by `vm_sync_from_hypervisor` / the `sync` command (spec §4.F, §8
/// scenario 5).
#[derive(Debug, Clone, PartialEq)]
pub struct LiveDomainState {
    pub memory_mib: u64,
    pub num_cpu: u32,
    pub disk_size_gib: u64,
    pub running: bool,
}

/// Values the build/resize commands take from the CLI, independent of the
/// inventory record, grouped here so pipeline functions take one struct
/// instead of a long argument list.
#[derive(Debug, Clone, Default)]
pub struct BuildOptions {
    pub local_image: Option<String>,
    pub postboot_script: Option<String>,
    pub no_puppet: bool,
    pub ignore_reserved: bool,
}

#[derive(Debug, Clone, Default)]
pub struct MigrateOptions {
    pub target_hypervisor: Option<String>,
    pub new_ip: Option<std::net::IpAddr>,
    pub run_puppet: bool,
    pub maintenance: bool,
    pub offline: bool,
    pub offline_transport: OfflineTransport,
    pub ignore_reserved: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OfflineTransport {
    #[default]
    Netcat,
    Drbd,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compress_ranges_groups_consecutive_runs() {
        assert_eq!(compress_ranges(&[0, 1, 2, 5, 6]), "0-2,5-6");
        assert_eq!(compress_ranges(&[3]), "3");
        assert_eq!(compress_ranges(&[]), "");
    }

    #[test]
    fn online_reserved_only_admits_operations_when_forced() {
        assert!(HypervisorState::Online.admits_operations(false));
        assert!(HypervisorState::Online.admits_operations(true));
        assert!(!HypervisorState::OnlineReserved.admits_operations(false));
        assert!(HypervisorState::OnlineReserved.admits_operations(true));
        assert!(!HypervisorState::Maintenance.admits_operations(true));
        assert!(!HypervisorState::Retired.admits_operations(true));
    }

    #[test]
    fn hypervisor_lock_expires_after_timeout() {
        let mut hv = test_hv();
        hv.acquire_lock(1000);
        assert!(hv.is_locked(1500, 3600));
        assert!(!hv.is_locked(5000, 3600));
    }

    fn test_hv() -> HypervisorRecord {
        HypervisorRecord {
            hostname: "hv1".into(),
            object_id: 1,
            hypervisor: HypervisorKind::Kvm,
            state: HypervisorState::Online,
            vlan_networks: HashSet::new(),
            num_cpu: 24,
            memory_mib: 131072,
            disk_size_gib: 2000,
            hardware_model: "Dell_M630".into(),
            environment: "production".into(),
            vms: Vec::new(),
            cpu_util_pct: 0.0,
            igvm_locked: None,
            extra: HashMap::new(),
            dirty: HashSet::new(),
        }
    }
}
