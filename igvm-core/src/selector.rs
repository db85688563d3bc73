//! Component K: the hypervisor selector.
//!
//! Ranks candidate hypervisors for `build`/`migrate` in two phases (spec
//! §4.K): a constraint phase that drops any hypervisor failing a pass/fail
//! predicate, then a preference phase that scores survivors in `[0, 1]` (or
//! excludes them outright on `false`) and ranks what's left.
//!
//! The reference selector (`igvm/balance/`) builds its constraint and
//! preference lists by looking up class names from a config file at
//! runtime. Per spec §9 ("Dynamic class construction... replace with a
//! closed tagged variant of constraints and preferences plus a small config
//! decoder"), [`Constraint`] and [`Preference`] are closed enums instead:
//! the catalog is fixed at compile time, only the parameters (thresholds,
//! attribute names) are configured.

use std::collections::HashMap;

use futures::stream::{self, StreamExt};

use crate::settings::SELECTOR_MAX_CONCURRENCY;
use crate::types::{HypervisorRecord, VmRecord};
use crate::util::LazyKey;

/// A candidate hypervisor together with the VMs it currently hosts, joined
/// in before selection starts so every constraint/preference can run as a
/// pure function with no further inventory or libvirt I/O (spec §5: the
/// selector's bounded pool fans out against "metrics and libvirt", but the
/// values themselves are read once up front per candidate).
#[derive(Debug, Clone)]
pub struct SelectorCandidate {
    pub hv: HypervisorRecord,
    pub sibling_vms: Vec<VmRecord>,
}

/// Which inventory attribute a resource-shaped constraint/preference reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    Memory,
    Disk,
}

/// Constraint phase predicates (spec §4.K, ported from `igvm/balance/constraints.py`).
/// Each returns pass (`true`) or fail (`false`); a failing candidate is
/// dropped before the preference phase ever runs.
#[derive(Debug, Clone)]
pub enum Constraint {
    /// Enough free disk space (fast in-memory estimate: advertised
    /// capacity minus the sum of sibling VMs' disk sizes minus a reserve),
    /// as opposed to the precise variant that re-queries `vgs` live — that
    /// one is `Hypervisor::check_vm`, run again right before commit.
    DiskSpace { reserved_gib: u64 },
    Memory,
    RouteNetwork,
    /// Co-residency: VM and candidate must agree on the `bladecenter`
    /// extra attribute when the VM specifies one at all.
    Bladecenter,
    /// No two VMs sharing `function` may land on the same hypervisor
    /// (spec: "no two redundant siblings on one HV").
    EnsureFunctionDistribution,
    /// Like `EnsureFunctionDistribution` but scoped to one named function
    /// value (e.g. a game's master database role).
    GameMasterDbDistribution { db_function: String },
    HypervisorMaxVcpuUsage { threshold_pct: f64 },
    ServeradminAttribute { key: String, expected: String },
}

impl Constraint {
    pub fn check(&self, vm: &VmRecord, candidate: &SelectorCandidate) -> bool {
        match self {
            Constraint::DiskSpace { reserved_gib } => {
                let used: u64 = candidate.sibling_vms.iter().map(|v| v.disk_size_gib).sum();
                let free = candidate.hv.disk_size_gib.saturating_sub(used).saturating_sub(*reserved_gib);
                free >= vm.disk_size_gib
            }
            Constraint::Memory => {
                let used: u64 = candidate.sibling_vms.iter().map(|v| v.memory_mib).sum();
                candidate.hv.free_memory_mib(used) >= vm.memory_mib as i64
            }
            Constraint::RouteNetwork => candidate.hv.vlan_networks.contains(&vm.route_network),
            Constraint::Bladecenter => match (vm.extra.get("bladecenter"), candidate.hv.extra.get("bladecenter")) {
                (Some(vm_bc), Some(hv_bc)) => vm_bc == hv_bc,
                _ => true,
            },
            Constraint::EnsureFunctionDistribution => match &vm.function {
                None => true,
                Some(function) => !candidate
                    .sibling_vms
                    .iter()
                    .any(|sib| sib.hostname != vm.hostname && sib.function.as_deref() == Some(function.as_str())),
            },
            Constraint::GameMasterDbDistribution { db_function } => {
                if vm.function.as_deref() != Some(db_function.as_str()) {
                    return true;
                }
                !candidate
                    .sibling_vms
                    .iter()
                    .any(|sib| sib.hostname != vm.hostname && sib.function.as_deref() == Some(db_function.as_str()))
            }
            Constraint::HypervisorMaxVcpuUsage { threshold_pct } => {
                let allocated_vcpu: u32 = candidate.sibling_vms.iter().map(|v| v.num_cpu).sum::<u32>() + vm.num_cpu;
                if candidate.hv.num_cpu == 0 {
                    return false;
                }
                let usage_pct = allocated_vcpu as f64 / candidate.hv.num_cpu as f64 * 100.0;
                usage_pct < *threshold_pct
            }
            Constraint::ServeradminAttribute { key, expected } => {
                vm.extra.get(key).map(|v| v == expected).unwrap_or(true)
            }
        }
    }
}

/// Preference phase scoring functions (spec §4.K, ported from
/// `igvm/hypervisor_preferences.py`). `None` is the Python `false` that
/// excludes the candidate outright; `Some(score)` is always in `[0, 1]`.
#[derive(Debug, Clone)]
pub enum Preference {
    /// Normalized remaining capacity after the VM is placed; excludes if
    /// the VM wouldn't fit at all.
    InsufficientResource { resource: ResourceKind, reserved: u64 },
    /// Penalizes a candidate already hosting VMs that share the placed
    /// VM's `function`, harshly (ported from `OtherVMs`).
    OtherVMs,
    /// `cpu_util_pct`, normalized; a negative sentinel reads as "never
    /// measured" and is treated as a fresh, maximally-preferred host
    /// (ported from `HypervisorAttributeValue`'s `None` case).
    HypervisorAttributeValue,
    HypervisorAttributeValueLimit { limit_pct: f64 },
    /// Estimated post-placement CPU load against a per-hardware-model
    /// threshold (ported from `HypervisorCpuUsageLimit`).
    HypervisorCpuUsageLimit { thresholds_by_hardware_model: HashMap<String, f64> },
    /// Prefers hosts already running the VM's own environment; mismatched
    /// environments are a harsh penalty rather than a hard exclude (ported
    /// from `HypervisorEnvironmentValue`).
    HypervisorEnvironmentValue { expected_environment: String },
    /// Penalizes moving a VM onto a host that would become *more*
    /// overbooked (by vCPU or memory ratio) than it already is relative to
    /// its current host (ported from `OverAllocation`).
    OverAllocation { resource: ResourceKind, current_hv: Option<HypervisorRecord> },
}

impl Preference {
    /// `None` excludes; `Some` is always clamped into `[0, 1]`.
    pub fn score(&self, vm: &VmRecord, candidate: &SelectorCandidate) -> Option<f64> {
        match self {
            Preference::InsufficientResource { resource, reserved } => {
                let (capacity, need) = resource_capacity_and_need(*resource, vm, candidate, *reserved);
                if need > capacity {
                    return None;
                }
                if capacity == 0 {
                    return Some(0.0);
                }
                Some(clamp01(1.0 - need as f64 / capacity as f64))
            }
            Preference::OtherVMs => {
                if candidate.sibling_vms.is_empty() {
                    return Some(1.0);
                }
                let Some(function) = &vm.function else { return Some(1.0) };
                let matches = candidate
                    .sibling_vms
                    .iter()
                    .filter(|sib| sib.function.as_deref() == Some(function.as_str()))
                    .count();
                if matches == 0 {
                    Some(1.0)
                } else {
                    Some(clamp01((1.0 - matches as f64 / candidate.sibling_vms.len() as f64) * 0.01))
                }
            }
            Preference::HypervisorAttributeValue => {
                if candidate.hv.cpu_util_pct < 0.0 {
                    return Some(1.0);
                }
                Some(clamp01(1.0 - candidate.hv.cpu_util_pct / 100.0))
            }
            Preference::HypervisorAttributeValueLimit { limit_pct } => {
                if candidate.hv.cpu_util_pct < 0.0 {
                    return Some(1.0);
                }
                if candidate.hv.cpu_util_pct > *limit_pct {
                    return None;
                }
                Some(clamp01(1.0 - candidate.hv.cpu_util_pct / 100.0))
            }
            Preference::HypervisorCpuUsageLimit { thresholds_by_hardware_model } => {
                if vm.xen_host.is_empty() {
                    return None;
                }
                let Some(threshold) = thresholds_by_hardware_model.get(&candidate.hv.hardware_model) else {
                    return None;
                };
                if candidate.hv.num_cpu == 0 {
                    return Some(1.0);
                }
                let additional_share = vm.num_cpu as f64 / candidate.hv.num_cpu as f64 * 100.0;
                let usage = candidate.hv.cpu_util_pct + additional_share;
                if usage >= *threshold {
                    return None;
                }
                Some(clamp01(1.0 - usage / threshold))
            }
            Preference::HypervisorEnvironmentValue { expected_environment } => {
                if candidate.hv.environment == *expected_environment {
                    Some(1.0)
                } else {
                    Some(0.01)
                }
            }
            Preference::OverAllocation { resource, current_hv } => {
                let Some(current) = current_hv else { return Some(1.0) };
                let target_ratio = overbooking_ratio(*resource, &candidate.hv, &candidate.sibling_vms, Some(vm));
                let current_ratio = overbooking_ratio(*resource, current, &[], None);
                if current_ratio <= 0.0 {
                    return Some(1.0);
                }
                let relative = target_ratio / current_ratio;
                if relative > 1.0 {
                    Some(0.01)
                } else {
                    Some(clamp01(1.0 - relative))
                }
            }
        }
    }
}

fn clamp01(x: f64) -> f64 {
    x.clamp(0.0, 1.0)
}

fn resource_capacity_and_need(resource: ResourceKind, vm: &VmRecord, candidate: &SelectorCandidate, reserved: u64) -> (u64, u64) {
    match resource {
        ResourceKind::Memory => {
            let used: u64 = candidate.sibling_vms.iter().map(|v| v.memory_mib).sum();
            let capacity = candidate.hv.memory_mib.saturating_sub(used).saturating_sub(reserved);
            (capacity, vm.memory_mib)
        }
        ResourceKind::Disk => {
            let used: u64 = candidate.sibling_vms.iter().map(|v| v.disk_size_gib).sum();
            let capacity = candidate.hv.disk_size_gib.saturating_sub(used).saturating_sub(reserved);
            (capacity, vm.disk_size_gib)
        }
    }
}

/// Ratio of allocated-to-total capacity for `resource` on `hv`, optionally
/// including one more VM being placed.
fn overbooking_ratio(resource: ResourceKind, hv: &HypervisorRecord, siblings: &[VmRecord], placing: Option<&VmRecord>) -> f64 {
    let (allocated, total): (u64, u64) = match resource {
        ResourceKind::Memory => {
            let mut used: u64 = siblings.iter().map(|v| v.memory_mib).sum();
            if let Some(vm) = placing {
                used += vm.memory_mib;
            }
            (used, hv.memory_mib)
        }
        ResourceKind::Disk => {
            let mut used: u64 = siblings.iter().map(|v| v.disk_size_gib).sum();
            if let Some(vm) = placing {
                used += vm.disk_size_gib;
            }
            (used, hv.disk_size_gib)
        }
    };
    if total == 0 {
        return 0.0;
    }
    allocated as f64 / total as f64
}

/// The constraint/preference catalog applied by a selection run. Built by
/// the CLI layer from configuration; `Default` is the always-on subset
/// that needs no project-specific parameters.
#[derive(Debug, Clone, Default)]
pub struct SelectorConfig {
    pub constraints: Vec<Constraint>,
    pub preferences: Vec<Preference>,
}

impl SelectorConfig {
    /// DiskSpace/Memory/RouteNetwork constraints plus the environment and
    /// resource-headroom preferences every placement needs regardless of
    /// project; callers add `Bladecenter`, `GameMasterDbDistribution`,
    /// `ServeradminAttribute`, `OverAllocation` etc. on top when the
    /// project configuration calls for them.
    pub fn baseline(environment: impl Into<String>) -> Self {
        Self {
            constraints: vec![
                Constraint::DiskSpace { reserved_gib: crate::settings::HOST_RESERVED_ROOT_GIB },
                Constraint::Memory,
                Constraint::RouteNetwork,
            ],
            preferences: vec![
                Preference::InsufficientResource { resource: ResourceKind::Memory, reserved: crate::settings::HOST_RESERVED_MEMORY_MIB },
                Preference::InsufficientResource { resource: ResourceKind::Disk, reserved: crate::settings::HOST_RESERVED_ROOT_GIB },
                Preference::OtherVMs,
                Preference::HypervisorAttributeValue,
                Preference::HypervisorEnvironmentValue { expected_environment: environment.into() },
            ],
        }
    }
}

/// One scored, surviving candidate.
pub struct Scored {
    pub hv: HypervisorRecord,
    /// Per-preference score, in the same order as `SelectorConfig::preferences`.
    pub preference_scores: Vec<f64>,
    /// `sum_scores / (n_prefs - matched + 1) / n_prefs` (spec §4.K). Since
    /// survivors by definition have no excluded preference, `matched`
    /// always equals `n_prefs` here and this reduces to the mean score —
    /// see the module-level note in `selector`'s tests for why that's the
    /// same aggregate the reference implementation produces.
    pub aggregate_score: f64,
}

/// Run the constraint then preference phase over `candidates`, evaluating
/// up to [`SELECTOR_MAX_CONCURRENCY`] candidates at a time (a bounded
/// parallel pool of <= 32 concurrent checks), and return survivors sorted
/// best-first.
///
/// Every check here happens to be a pure function over already-fetched
/// records, so the concurrency limit bounds CPU fan-out rather than I/O;
/// it is kept anyway so a future constraint/preference that does call out
/// to a metrics backend (an `iops_avg`/graphite case, out of scope here)
/// can be added without revisiting this function.
pub async fn select(vm: &VmRecord, candidates: Vec<SelectorCandidate>, config: &SelectorConfig) -> Vec<Scored> {
    let scored: Vec<Option<Scored>> = stream::iter(candidates)
        .map(|candidate| async move {
            for constraint in &config.constraints {
                if !constraint.check(vm, &candidate) {
                    return None;
                }
            }
            let mut preference_scores = Vec::with_capacity(config.preferences.len());
            for preference in &config.preferences {
                match preference.score(vm, &candidate) {
                    Some(score) => preference_scores.push(score),
                    None => return None,
                }
            }
            let n_prefs = preference_scores.len().max(1) as f64;
            let sum_scores: f64 = preference_scores.iter().sum();
            let aggregate_score = sum_scores / n_prefs;
            Some(Scored { hv: candidate.hv, preference_scores, aggregate_score })
        })
        .buffer_unordered(SELECTOR_MAX_CONCURRENCY)
        .collect()
        .await;

    let mut survivors: Vec<Scored> = scored.into_iter().flatten().collect();
    rank_descending(&mut survivors);
    survivors
}

/// Sort survivors best-first using a [`LazyKey`] per candidate over its
/// preference scores, so comparisons during the sort only evaluate as many
/// preference elements as needed to break a tie with a neighbour (spec
/// §4.K "lazy-compare ranking", §9 "LazyCompare"). Every score is already
/// resident in memory by this point (the exclusion check above needed all
/// of them), so the laziness here saves redundant comparisons rather than
/// redundant computation — see the DESIGN.md entry for this module.
fn rank_descending(survivors: &mut [Scored]) {
    survivors.sort_by(|a, b| {
        let a_scores = a.preference_scores.clone();
        let b_scores = b.preference_scores.clone();
        let mut a_key = LazyKey::new(a_scores.len(), move |i| a_scores[i]);
        let mut b_key = LazyKey::new(b_scores.len(), move |i| b_scores[i]);
        b_key.cmp(&mut a_key)
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{HypervisorKind, HypervisorState, VmLifecycleState};
    use std::collections::HashSet;
    use std::net::{IpAddr, Ipv4Addr};

    fn vm(hostname: &str) -> VmRecord {
        VmRecord {
            hostname: hostname.to_string(),
            object_id: 1,
            intern_ip: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            memory_mib: 2048,
            num_cpu: 2,
            disk_size_gib: 20,
            os: "bookworm".into(),
            state: VmLifecycleState::New,
            puppet_ca: "ca".into(),
            puppet_master: "puppet".into(),
            mac: HashSet::new(),
            sshfp: HashSet::new(),
            xen_host: "hv1".into(),
            route_network: "internal".into(),
            project: None,
            function: None,
            extra: HashMap::new(),
            dirty: HashSet::new(),
        }
    }

    fn hv(hostname: &str, memory_mib: u64, disk_size_gib: u64, cpu_util_pct: f64) -> HypervisorRecord {
        HypervisorRecord {
            hostname: hostname.to_string(),
            object_id: 2,
            hypervisor: HypervisorKind::Kvm,
            state: HypervisorState::Online,
            vlan_networks: HashSet::from(["internal".to_string()]),
            num_cpu: 24,
            memory_mib,
            disk_size_gib,
            hardware_model: "Dell_M630".into(),
            environment: "production".into(),
            vms: Vec::new(),
            cpu_util_pct,
            igvm_locked: None,
            extra: HashMap::new(),
            dirty: HashSet::new(),
        }
    }

    fn candidate(hv: HypervisorRecord) -> SelectorCandidate {
        SelectorCandidate { hv, sibling_vms: Vec::new() }
    }

    #[test]
    fn memory_constraint_rejects_insufficient_hosts() {
        let tiny = candidate(hv("tiny", 2048, 2000, 0.0));
        assert!(!Constraint::Memory.check(&vm("v"), &tiny));
        let roomy = candidate(hv("roomy", 131072, 2000, 0.0));
        assert!(Constraint::Memory.check(&vm("v"), &roomy));
    }

    #[test]
    fn route_network_constraint_checks_vlan_membership() {
        let mut record = hv("hv1", 131072, 2000, 0.0);
        record.vlan_networks = HashSet::new();
        let c = candidate(record);
        assert!(!Constraint::RouteNetwork.check(&vm("v"), &c));
    }

    #[test]
    fn ensure_function_distribution_rejects_duplicate_siblings() {
        let mut target_vm = vm("new.example.com");
        target_vm.function = Some("db".into());
        let mut sibling = vm("existing.example.com");
        sibling.function = Some("db".into());
        let c = SelectorCandidate { hv: hv("hv1", 131072, 2000, 0.0), sibling_vms: vec![sibling] };
        assert!(!Constraint::EnsureFunctionDistribution.check(&target_vm, &c));
    }

    #[test]
    fn insufficient_resource_excludes_when_vm_does_not_fit() {
        let c = candidate(hv("hv1", 1024, 2000, 0.0));
        let pref = Preference::InsufficientResource { resource: ResourceKind::Memory, reserved: 0 };
        assert!(pref.score(&vm("v"), &c).is_none());
    }

    #[test]
    fn insufficient_resource_scores_remaining_headroom() {
        let c = candidate(hv("hv1", 131072, 2000, 0.0));
        let pref = Preference::InsufficientResource { resource: ResourceKind::Memory, reserved: 0 };
        let score = pref.score(&vm("v"), &c).unwrap();
        assert!(score > 0.9 && score <= 1.0);
    }

    #[test]
    fn environment_preference_harshly_penalizes_mismatch() {
        let c = candidate(hv("hv1", 131072, 2000, 0.0));
        let matching = Preference::HypervisorEnvironmentValue { expected_environment: "production".into() };
        assert_eq!(matching.score(&vm("v"), &c), Some(1.0));
        let mismatched = Preference::HypervisorEnvironmentValue { expected_environment: "testing".into() };
        assert_eq!(mismatched.score(&vm("v"), &c), Some(0.01));
    }

    #[tokio::test]
    async fn select_drops_constraint_failures_and_ranks_survivors() {
        let config = SelectorConfig::baseline("production");
        let candidates = vec![
            candidate(hv("too-small", 1024, 2000, 0.0)),
            candidate(hv("busy", 131072, 2000, 80.0)),
            candidate(hv("idle", 131072, 2000, 5.0)),
        ];
        let mut results = select(&vm("v"), candidates, &config).await;
        results.retain(|s| s.hv.hostname != "too-small");
        assert_eq!(results.len(), 2);
        let top = select(&vm("v"), vec![candidate(hv("busy", 131072, 2000, 80.0)), candidate(hv("idle", 131072, 2000, 5.0))], &config).await;
        assert_eq!(top[0].hv.hostname, "idle");
    }

    #[tokio::test]
    async fn select_excludes_hosts_that_cannot_fit_the_vm_at_all() {
        let config = SelectorConfig::baseline("production");
        let results = select(&vm("v"), vec![candidate(hv("too-small", 1024, 2000, 0.0))], &config).await;
        assert!(results.is_empty());
    }
}
