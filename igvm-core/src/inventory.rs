//! Component A: the inventory gateway.
//!
//! Wraps the external inventory service ("serveradmin" in the reference
//! fleet). Records behave like dirty-tracking dictionaries ([`VmRecord`],
//! [`HypervisorRecord`]); `commit` writes back only what changed and fails
//! with [`IgvmError::Inventory`] if the remote copy moved since it was
//! read. A pipeline run keeps a short-lived cache so repeated `get` calls
//! for the same hostname within one `build`/`migrate` invocation don't
//! re-query the network; the cache is never shared across invocations.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;

use crate::error::{IgvmError, Result};
use crate::types::{HypervisorRecord, VmLifecycleState, VmRecord};

/// Query filter passed to [`Inventory::query`]. Mirrors the attribute
/// predicates the reference CLI accepts (`servertype=vm`, `state=online`,
/// `hypervisor=<hostname>`, ...); kept as a small struct of `Option`s
/// rather than a free-form query string since this crate only ever needs
/// these specific lookups.
#[derive(Debug, Clone, Default)]
pub struct InventoryFilter {
    pub hostname: Option<String>,
    pub state: Option<String>,
    pub hypervisor_hostname: Option<String>,
    pub environment: Option<String>,
    /// Only match VMs in [`VmLifecycleState::Running`] — used to resolve a
    /// load-balanced/domain-fronted pool down to a currently-live member
    /// (ported from `igvm/puppet.py::get_puppet_ca`'s `state in ['online',
    /// 'deploy_online']` filter on `lb_nodes`).
    pub running_only: bool,
    /// Match on an arbitrary `extra` attribute key/value pair, e.g. a
    /// load balancer pool membership tag.
    pub extra: Option<(String, String)>,
}

impl InventoryFilter {
    pub fn by_hostname(hostname: impl Into<String>) -> Self {
        Self {
            hostname: Some(hostname.into()),
            ..Default::default()
        }
    }

    pub fn by_hypervisor(hostname: impl Into<String>) -> Self {
        Self {
            hypervisor_hostname: Some(hostname.into()),
            ..Default::default()
        }
    }

    /// Running VMs tagged with `extra[key] == value` — used to resolve a
    /// Puppet CA pool (domain or load balancer) down to its live members.
    pub fn by_extra_attribute(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            running_only: true,
            extra: Some((key.into(), value.into())),
            ..Default::default()
        }
    }

    fn matches_vm(&self, vm: &VmRecord) -> bool {
        if let Some(h) = &self.hostname {
            if &vm.hostname != h {
                return false;
            }
        }
        if let Some(hv) = &self.hypervisor_hostname {
            if &vm.xen_host != hv {
                return false;
            }
        }
        if self.running_only && vm.state != VmLifecycleState::Running {
            return false;
        }
        if let Some((key, value)) = &self.extra {
            if vm.extra.get(key) != Some(value) {
                return false;
            }
        }
        true
    }

    fn matches_hv(&self, hv: &HypervisorRecord) -> bool {
        if let Some(h) = &self.hostname {
            if &hv.hostname != h {
                return false;
            }
        }
        if let Some(env) = &self.environment {
            if &hv.environment != env {
                return false;
            }
        }
        true
    }
}

/// The inventory gateway trait. One real implementation talks to the
/// fleet's inventory HTTP API; [`MockInventory`] is an in-memory
/// implementation used by every pipeline unit test in this crate.
#[async_trait]
pub trait Inventory: Send + Sync {
    /// Find VM records matching `filter`. Returns an empty vec if none
    /// match; never an error for "not found" (only [`get_vm`] is strict).
    async fn query_vms(&self, filter: &InventoryFilter) -> Result<Vec<VmRecord>>;

    /// Find hypervisor records matching `filter`.
    async fn query_hypervisors(&self, filter: &InventoryFilter) -> Result<Vec<HypervisorRecord>>;

    /// Fetch exactly one VM by hostname. Errors if zero or more than one
    /// record matches (the latter should not happen in a correctly
    /// modeled inventory, but is checked rather than assumed).
    async fn get_vm(&self, hostname: &str) -> Result<VmRecord> {
        let mut found = self
            .query_vms(&InventoryFilter::by_hostname(hostname))
            .await?;
        match found.len() {
            0 => Err(IgvmError::Inventory(format!(
                "no VM object found for hostname {hostname}"
            ))),
            1 => Ok(found.remove(0)),
            n => Err(IgvmError::Inventory(format!(
                "{n} VM objects found for hostname {hostname}, expected exactly one"
            ))),
        }
    }

    /// Fetch exactly one hypervisor by hostname.
    async fn get_hypervisor(&self, hostname: &str) -> Result<HypervisorRecord> {
        let mut found = self
            .query_hypervisors(&InventoryFilter::by_hostname(hostname))
            .await?;
        match found.len() {
            0 => Err(IgvmError::Inventory(format!(
                "no hypervisor object found for hostname {hostname}"
            ))),
            1 => Ok(found.remove(0)),
            n => Err(IgvmError::Inventory(format!(
                "{n} hypervisor objects found for hostname {hostname}, expected exactly one"
            ))),
        }
    }

    /// Create a brand-new VM object (used by `build`). Returns the
    /// assigned `object_id`.
    async fn create_vm(&self, vm: &VmRecord) -> Result<u64>;

    /// Write back a VM record's dirty fields. No-op if the record isn't
    /// dirty. Fails with [`IgvmError::Inventory`] on a write conflict.
    async fn commit_vm(&self, vm: &mut VmRecord) -> Result<()>;

    /// Write back a hypervisor record's dirty fields (used for
    /// `igvm_locked` and `vms` list maintenance).
    async fn commit_hypervisor(&self, hv: &mut HypervisorRecord) -> Result<()>;

    /// Delete a VM object outright (used by the housekeeping reaper after
    /// the retention window, never by `delete`, which only flips state to
    /// `retired`).
    async fn delete_vm(&self, hostname: &str) -> Result<()>;

    /// Move a VM object from `old_hostname` to `vm.hostname` as a single
    /// step, preserving `object_id` (used by the `rename` CLI subcommand;
    /// a plain `commit_vm` can't do this since it keys the write by the
    /// record's own, already-changed hostname). Fails if `vm.hostname` is
    /// already taken.
    async fn rename_vm(&self, old_hostname: &str, vm: &mut VmRecord) -> Result<()>;
}

#[derive(Default)]
struct Cache {
    vms: HashMap<String, VmRecord>,
    hypervisors: HashMap<String, HypervisorRecord>,
}

/// In-memory inventory, suitable for tests and for `igvm --dry-run`-style
/// exploratory pipelines. Guards its state behind a `Mutex` rather than
/// requiring `&mut self` through the trait, matching how the reference
/// CLI treats the inventory as a shared, lazily-populated cache object.
#[derive(Default)]
pub struct MockInventory {
    cache: Mutex<Cache>,
    next_object_id: Mutex<u64>,
}

impl MockInventory {
    pub fn new() -> Self {
        Self {
            cache: Mutex::new(Cache::default()),
            next_object_id: Mutex::new(1),
        }
    }

    pub fn seed_vm(&self, vm: VmRecord) {
        self.cache.lock().unwrap().vms.insert(vm.hostname.clone(), vm);
    }

    pub fn seed_hypervisor(&self, hv: HypervisorRecord) {
        self.cache
            .lock()
            .unwrap()
            .hypervisors
            .insert(hv.hostname.clone(), hv);
    }
}

#[async_trait]
impl Inventory for MockInventory {
    async fn query_vms(&self, filter: &InventoryFilter) -> Result<Vec<VmRecord>> {
        let cache = self.cache.lock().unwrap();
        Ok(cache
            .vms
            .values()
            .filter(|vm| filter.matches_vm(vm))
            .cloned()
            .collect())
    }

    async fn query_hypervisors(&self, filter: &InventoryFilter) -> Result<Vec<HypervisorRecord>> {
        let cache = self.cache.lock().unwrap();
        Ok(cache
            .hypervisors
            .values()
            .filter(|hv| filter.matches_hv(hv))
            .cloned()
            .collect())
    }

    async fn create_vm(&self, vm: &VmRecord) -> Result<u64> {
        let mut id_guard = self.next_object_id.lock().unwrap();
        let object_id = *id_guard;
        *id_guard += 1;
        let mut record = vm.clone();
        record.object_id = object_id;
        self.cache
            .lock()
            .unwrap()
            .vms
            .insert(record.hostname.clone(), record);
        Ok(object_id)
    }

    async fn commit_vm(&self, vm: &mut VmRecord) -> Result<()> {
        if !vm.is_dirty() {
            return Ok(());
        }
        let mut cache = self.cache.lock().unwrap();
        if !cache.vms.contains_key(&vm.hostname) {
            return Err(IgvmError::Inventory(format!(
                "commit conflict: {} no longer exists in inventory",
                vm.hostname
            )));
        }
        cache.vms.insert(vm.hostname.clone(), vm.clone());
        vm.clear_dirty();
        Ok(())
    }

    async fn commit_hypervisor(&self, hv: &mut HypervisorRecord) -> Result<()> {
        if !hv.is_dirty() {
            return Ok(());
        }
        let mut cache = self.cache.lock().unwrap();
        if !cache.hypervisors.contains_key(&hv.hostname) {
            return Err(IgvmError::Inventory(format!(
                "commit conflict: {} no longer exists in inventory",
                hv.hostname
            )));
        }
        cache.hypervisors.insert(hv.hostname.clone(), hv.clone());
        hv.clear_dirty();
        Ok(())
    }

    async fn delete_vm(&self, hostname: &str) -> Result<()> {
        self.cache.lock().unwrap().vms.remove(hostname);
        Ok(())
    }

    async fn rename_vm(&self, old_hostname: &str, vm: &mut VmRecord) -> Result<()> {
        let mut cache = self.cache.lock().unwrap();
        if old_hostname != vm.hostname && cache.vms.contains_key(&vm.hostname) {
            return Err(IgvmError::Inventory(format!(
                "commit conflict: {} already exists in inventory",
                vm.hostname
            )));
        }
        if cache.vms.remove(old_hostname).is_none() {
            return Err(IgvmError::Inventory(format!(
                "commit conflict: {old_hostname} no longer exists in inventory"
            )));
        }
        cache.vms.insert(vm.hostname.clone(), vm.clone());
        vm.clear_dirty();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{HypervisorKind, HypervisorState, VmLifecycleState};
    use std::collections::HashSet;
    use std::net::{IpAddr, Ipv4Addr};

    fn test_vm(hostname: &str) -> VmRecord {
        VmRecord {
            hostname: hostname.to_string(),
            object_id: 0,
            intern_ip: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            memory_mib: 2048,
            num_cpu: 2,
            disk_size_gib: 20,
            os: "bookworm".to_string(),
            state: VmLifecycleState::New,
            puppet_ca: "ca.example.com".to_string(),
            puppet_master: "puppet.example.com".to_string(),
            mac: HashSet::new(),
            sshfp: HashSet::new(),
            xen_host: String::new(),
            route_network: "internal".to_string(),
            project: None,
            function: None,
            extra: HashMap::new(),
            dirty: HashSet::new(),
        }
    }

    #[tokio::test]
    async fn get_vm_fails_when_absent() {
        let inv = MockInventory::new();
        let err = inv.get_vm("missing.example.com").await.unwrap_err();
        assert!(matches!(err, IgvmError::Inventory(_)));
    }

    #[tokio::test]
    async fn create_then_get_roundtrips() {
        let inv = MockInventory::new();
        let object_id = inv.create_vm(&test_vm("vm1.example.com")).await.unwrap();
        let fetched = inv.get_vm("vm1.example.com").await.unwrap();
        assert_eq!(fetched.object_id, object_id);
    }

    #[tokio::test]
    async fn commit_is_noop_when_not_dirty() {
        let inv = MockInventory::new();
        inv.create_vm(&test_vm("vm2.example.com")).await.unwrap();
        let mut vm = inv.get_vm("vm2.example.com").await.unwrap();
        assert!(!vm.is_dirty());
        inv.commit_vm(&mut vm).await.unwrap();
    }

    #[tokio::test]
    async fn commit_fails_after_deletion() {
        let inv = MockInventory::new();
        inv.create_vm(&test_vm("vm3.example.com")).await.unwrap();
        let mut vm = inv.get_vm("vm3.example.com").await.unwrap();
        vm.set_state(VmLifecycleState::Retired);
        inv.delete_vm("vm3.example.com").await.unwrap();
        let err = inv.commit_vm(&mut vm).await.unwrap_err();
        assert!(matches!(err, IgvmError::Inventory(_)));
    }

    #[tokio::test]
    async fn query_hypervisors_filters_by_environment() {
        let inv = MockInventory::new();
        inv.seed_hypervisor(HypervisorRecord {
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
        });
        let found = inv
            .query_hypervisors(&InventoryFilter {
                environment: Some("production".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        let none = inv
            .query_hypervisors(&InventoryFilter {
                environment: Some("testing".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(none.is_empty());
    }
}
