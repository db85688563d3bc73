//! Component M-adjacent: the single-VM lifecycle operations that sit
//! alongside `build`/`migrate` but don't warrant their own module —
//! start/stop/restart/delete/info/sync/rebuild/rename and the three
//! resize commands (spec §6). Ported from the reference `igvm/commands.py`
//! (`mem_set`/`disk_set`/`vm_start`/`vm_stop`/`vm_restart`/`vm_delete`);
//! the remaining ops (`vcpu_set`, `sync`, `rebuild`, `rename`) are not in
//! the retrieved source excerpt but follow the same shape.

use std::sync::Arc;

use tracing::{info, instrument, warn};

use crate::build::{self, BuildEnv};
use crate::error::{IgvmError, Result};
use crate::executor::Executor;
use crate::hypervisor::{discover_numa_topology, vlan_tag_for, Hypervisor};
use crate::inventory::Inventory;
use crate::libvirt::LibvirtGateway;
use crate::settings::FleetSettings;
use crate::transaction::{run_in_transaction, Transaction};
use crate::types::{BuildOptions, VmLifecycleState, VmRecord};
use crate::util::parse_size;
use crate::vm::{Vm, VmInfo};

/// Collaborators every op in this module needs; same shape as
/// [`crate::build::BuildEnv`]/[`crate::migrate::MigrateEnv`] minus the
/// image fetcher those pipelines alone need.
pub struct OpsEnv {
    pub inventory: Arc<dyn Inventory>,
    pub libvirt: Arc<dyn LibvirtGateway>,
    pub executor: Arc<dyn Executor>,
    pub settings: FleetSettings,
}

/// Load a VM record and the `Hypervisor` it's currently defined on,
/// failing with `InvalidState` if it was never built (spec §8
/// idempotence: every op here assumes `build` already ran).
async fn load_defined_vm(env: &OpsEnv, vm_hostname: &str) -> Result<(VmRecord, Hypervisor)> {
    let vm_record = env.inventory.get_vm(vm_hostname).await?;
    let hv_record = env.inventory.get_hypervisor(&vm_record.xen_host).await?;
    let numa = discover_numa_topology(&env.executor, &hv_record.hostname).await?;
    let hypervisor = Hypervisor::new(hv_record, numa, env.inventory.clone(), env.libvirt.clone(), env.executor.clone());
    if !hypervisor.vm_defined(&vm_record).await? {
        return Err(IgvmError::InvalidState(format!(
            "{vm_hostname} is not built yet or is not actually running on {}",
            hypervisor.hostname()
        )));
    }
    Ok((vm_record, hypervisor))
}

/// Refuse to operate on a hypervisor in `online_reserved` state unless the
/// caller passed `--ignore-reserved` (spec §6). Shared by the three resize
/// ops; `build`/`rebuild` gate the same state at selection time instead,
/// since they pick their hypervisor rather than inherit one.
fn check_hypervisor_admits(hypervisor: &Hypervisor, ignore_reserved: bool) -> Result<()> {
    if !hypervisor.record.state.admits_operations(ignore_reserved) {
        return Err(IgvmError::InvalidState(format!(
            "{} has state {:?}; pass --ignore-reserved to force",
            hypervisor.hostname(),
            hypervisor.record.state
        )));
    }
    Ok(())
}

/// `igvm start <vm>` (ported from `vm_start`): a no-op if already running.
#[instrument(skip(env))]
pub async fn start(env: &OpsEnv, vm_hostname: &str) -> Result<()> {
    run_in_transaction(None, |tx| start_inner(env, vm_hostname, tx)).await
}

async fn start_inner(env: &OpsEnv, vm_hostname: &str, tx: &mut Transaction) -> Result<()> {
    let (vm_record, hypervisor) = load_defined_vm(env, vm_hostname).await?;
    let mut vm = Vm::new(vm_record, hypervisor, env.executor.clone(), env.inventory.clone());
    if vm.is_running().await? {
        info!(vm = vm_hostname, "already running");
        return Ok(());
    }
    vm.start(tx).await
}

/// `igvm stop <vm> [--force]` (ported from `vm_stop`): graceful ACPI
/// shutdown unless `force`, which hard-destroys the domain instead. A
/// no-op if already stopped.
#[instrument(skip(env))]
pub async fn stop(env: &OpsEnv, vm_hostname: &str, force: bool) -> Result<()> {
    let (vm_record, hypervisor) = load_defined_vm(env, vm_hostname).await?;
    let mut vm = Vm::new(vm_record, hypervisor, env.executor.clone(), env.inventory.clone());
    if !vm.is_running().await? {
        info!(vm = vm_hostname, "already stopped");
        return Ok(());
    }
    if force {
        vm.hypervisor.stop_vm_force(&vm.record).await?;
        vm.record.set_state(VmLifecycleState::Stopped);
        vm.commit().await?;
    } else {
        vm.shutdown().await?;
    }
    info!(vm = vm_hostname, "stopped");
    Ok(())
}

/// `igvm restart <vm> [--force] [--no-redefine]` (ported from
/// `vm_restart`): stop then start. `--no-redefine` skips re-synthesizing
/// the domain XML (otherwise a restart also picks up any inventory
/// changes that haven't been pushed to libvirt yet, matching `start_vm`'s
/// normal behavior of trusting whatever is already defined).
#[instrument(skip(env))]
pub async fn restart(env: &OpsEnv, vm_hostname: &str, force: bool, no_redefine: bool) -> Result<()> {
    run_in_transaction(None, |tx| restart_inner(env, vm_hostname, force, no_redefine, tx)).await
}

async fn restart_inner(env: &OpsEnv, vm_hostname: &str, force: bool, no_redefine: bool, tx: &mut Transaction) -> Result<()> {
    let (vm_record, hypervisor) = load_defined_vm(env, vm_hostname).await?;
    if !hypervisor.vm_running(&vm_record).await? {
        return Err(IgvmError::InvalidState(format!("{vm_hostname} is not running")));
    }
    let mut vm = Vm::new(vm_record, hypervisor, env.executor.clone(), env.inventory.clone());

    if force {
        vm.hypervisor.stop_vm_force(&vm.record).await?;
    } else {
        vm.hypervisor.stop_vm(&vm.record).await?;
    }

    if !no_redefine {
        let mac_address = vm
            .record
            .mac
            .iter()
            .next()
            .cloned()
            .ok_or_else(|| IgvmError::Config(format!("{vm_hostname} has no MAC address on record")))?;
        let vlan_tag = vlan_tag_for(&vm.hypervisor.record, &vm.record.route_network);
        vm.hypervisor.define_vm(&vm.record, &mac_address, vlan_tag, tx).await?;
    }

    vm.start(tx).await?;
    info!(vm = vm_hostname, "restarted");
    Ok(())
}

/// `igvm delete <vm> [--force] [--retire]` (ported from `vm_delete`).
/// Refuses a running VM unless `--force` (which stops it first).
/// `--retire` marks the inventory object `retired` instead of deleting it
/// outright, handing it to the housekeeping reaper's retention window;
/// without it the object and its storage are removed immediately.
#[instrument(skip(env))]
pub async fn delete(env: &OpsEnv, vm_hostname: &str, force: bool, retire: bool) -> Result<()> {
    let (mut vm_record, hypervisor) = load_defined_vm(env, vm_hostname).await?;

    if hypervisor.vm_running(&vm_record).await? {
        if !force {
            return Err(IgvmError::InvalidState(format!(
                "{vm_hostname} is still running; pass --force or stop it first"
            )));
        }
        hypervisor.stop_vm_force(&vm_record).await?;
    }

    hypervisor.undefine_vm(&vm_record).await?;
    hypervisor.destroy_vm_storage(&vm_record).await?;

    if retire {
        vm_record.set_state(VmLifecycleState::Retired);
        env.inventory.commit_vm(&mut vm_record).await?;
        info!(vm = vm_hostname, "undefined, storage removed, marked retired");
    } else {
        env.inventory.delete_vm(vm_hostname).await?;
        info!(vm = vm_hostname, "undefined, storage removed, inventory object deleted");
    }
    Ok(())
}

/// `igvm info <vm>` (ported from `VM.info`).
pub async fn info(env: &OpsEnv, vm_hostname: &str) -> Result<VmInfo> {
    let (vm_record, hypervisor) = load_defined_vm(env, vm_hostname).await?;
    let vm = Vm::new(vm_record, hypervisor, env.executor.clone(), env.inventory.clone());
    vm.info().await
}

/// `igvm sync <vm>` (spec §8 scenario 5): pull the authoritative
/// memory/vCPU/disk-size/running values back from the live domain and
/// overwrite whatever inventory currently holds, committing only the
/// fields that actually differ. A second call against an unchanged domain
/// is therefore a no-op commit (nothing dirtied).
#[instrument(skip(env))]
pub async fn sync(env: &OpsEnv, vm_hostname: &str) -> Result<()> {
    let (mut vm_record, hypervisor) = load_defined_vm(env, vm_hostname).await?;
    let live = hypervisor.vm_sync_from_hypervisor(&vm_record).await?;

    if live.memory_mib != vm_record.memory_mib {
        vm_record.set_memory_mib(live.memory_mib);
    }
    if live.num_cpu != vm_record.num_cpu {
        vm_record.set_num_cpu(live.num_cpu);
    }
    if live.disk_size_gib != vm_record.disk_size_gib {
        vm_record.set_disk_size_gib(live.disk_size_gib);
    }
    let target_state = if live.running { VmLifecycleState::Running } else { VmLifecycleState::Stopped };
    if vm_record.state != VmLifecycleState::Retired && vm_record.state != target_state {
        vm_record.set_state(target_state);
    }

    if vm_record.is_dirty() {
        env.inventory.commit_vm(&mut vm_record).await?;
        info!(vm = vm_hostname, "inventory resynced from live domain");
    } else {
        info!(vm = vm_hostname, "already in sync");
    }
    Ok(())
}

/// `igvm rebuild <vm> [--force]`: undefine the domain and wipe its
/// storage, reset the inventory object to `new`, then run the full build
/// pipeline again from scratch. `--force` is required whenever the VM is
/// currently running, since this throws away the guest filesystem.
#[instrument(skip(env, build_env, opts))]
pub async fn rebuild(env: &OpsEnv, build_env: &BuildEnv, vm_hostname: &str, force: bool, opts: &BuildOptions) -> Result<()> {
    let (mut vm_record, hypervisor) = load_defined_vm(env, vm_hostname).await?;

    if hypervisor.vm_running(&vm_record).await? && !force {
        return Err(IgvmError::InvalidState(format!(
            "{vm_hostname} is running; pass --force to rebuild it (this destroys the guest filesystem)"
        )));
    }
    if hypervisor.vm_running(&vm_record).await? {
        hypervisor.stop_vm_force(&vm_record).await?;
    }

    hypervisor.undefine_vm(&vm_record).await?;
    hypervisor.destroy_vm_storage(&vm_record).await?;

    vm_record.set_state(VmLifecycleState::New);
    env.inventory.commit_vm(&mut vm_record).await?;

    warn!(vm = vm_hostname, "rebuilding from scratch, guest filesystem discarded");
    build::buildvm(build_env, vm_hostname, opts).await
}

/// `igvm rename <vm> <new> [--offline]` (ported from `VM.rename`): update
/// guest-side hostname files, flip the inventory hostname, and redefine
/// the libvirt domain under its new `<object_id>_<hostname>` name.
///
/// The reference implementation always stops the guest around a rename
/// because the domain name is derived from the hostname and libvirt names
/// are immutable. `--offline` makes that explicit in this port: with it,
/// the guest is shut down first and every step (including the hostname
/// file writes, done via chroot) runs while it's off; without it, the
/// guest keeps running under its current libvirt definition while the
/// persistent one is swapped out from under it, so it only picks up its
/// new identity the next time someone restarts it.
#[instrument(skip(env))]
pub async fn rename(env: &OpsEnv, vm_hostname: &str, new_hostname: &str, offline: bool) -> Result<()> {
    run_in_transaction(None, |tx| rename_inner(env, vm_hostname, new_hostname, offline, tx)).await
}

async fn rename_inner(env: &OpsEnv, vm_hostname: &str, new_hostname: &str, offline: bool, tx: &mut Transaction) -> Result<()> {
    let (vm_record, hypervisor) = load_defined_vm(env, vm_hostname).await?;
    if new_hostname == vm_record.hostname {
        return Err(IgvmError::Config(format!("{vm_hostname} is already named \"{new_hostname}\"")));
    }
    let was_running = hypervisor.vm_running(&vm_record).await?;

    let mut vm = Vm::new(vm_record, hypervisor, env.executor.clone(), env.inventory.clone());
    if offline && was_running {
        vm.shutdown().await?;
    }

    let old_record = vm.record.clone();
    vm.record.set_hostname(new_hostname);
    vm.check_serveradmin_config()?;
    write_hostname_files(&vm, new_hostname).await?;

    let mac_address = vm
        .record
        .mac
        .iter()
        .next()
        .cloned()
        .ok_or_else(|| IgvmError::Config(format!("{vm_hostname} has no MAC address on record")))?;
    let vlan_tag = vlan_tag_for(&vm.hypervisor.record, &vm.record.route_network);
    vm.hypervisor.rename_vm(&old_record, &vm.record, &mac_address, vlan_tag, tx).await?;
    vm.commit().await?;

    if offline && was_running {
        vm.start(tx).await?;
    }
    info!(from = %old_record.hostname, to = new_hostname, "renamed");
    Ok(())
}

async fn write_hostname_files(vm: &Vm, new_hostname: &str) -> Result<()> {
    vm.run_raw(&format!("echo {new_hostname} > /etc/hostname")).await?;
    vm.run_raw(&format!("echo {new_hostname} > /etc/mailname")).await?;
    vm.run_raw(&format!(
        "sed -i '/^{0}/d' /etc/hosts && echo '{0}\t{1}' >> /etc/hosts",
        vm.record.intern_ip, new_hostname
    ))
    .await?;
    Ok(())
}

/// `igvm disk-set <vm> <size>` (ported from `disk_set`). `size` takes a
/// bare number of GiB, a `<N>G`/`<N>T` suffix, or a `+`/`-` prefix for a
/// relative change; shrinking is always rejected. Refuses to touch a
/// hypervisor in `online_reserved` state unless `ignore_reserved` is set
/// (spec §6, `--ignore-reserved`).
#[instrument(skip(env))]
pub async fn disk_set(env: &OpsEnv, vm_hostname: &str, size: &str, ignore_reserved: bool) -> Result<()> {
    let (mut vm_record, hypervisor) = load_defined_vm(env, vm_hostname).await?;
    check_hypervisor_admits(&hypervisor, ignore_reserved)?;

    let new_gib = resolve_relative_size(size, vm_record.disk_size_gib, 'g')?;
    if new_gib < vm_record.disk_size_gib {
        return Err(IgvmError::Config("cannot shrink the disk".into()));
    }
    if new_gib == vm_record.disk_size_gib {
        info!(vm = vm_hostname, "disk size unchanged");
        return Ok(());
    }

    hypervisor.resize_vm_storage(&vm_record, new_gib).await?;
    if hypervisor.vm_running(&vm_record).await? {
        // Update QEMU's view of the backing device before asking the guest
        // to rescan it; without this the LV is bigger but the virtio-blk
        // frontend the guest sees still reports the old size, so the
        // rescan+growfs below would be a silent no-op (ported from
        // `commands.py::disk_set`'s `lvresize` -> `blockresize` -> guest
        // rescan sequence).
        hypervisor.blockresize_vm_storage(&vm_record, new_gib).await?;
        let vm = Vm::new(vm_record.clone(), hypervisor, env.executor.clone(), env.inventory.clone());
        vm.grow_root_filesystem().await?;
    } else {
        info!(vm = vm_hostname, "VM is not running; filesystem will be grown on next boot's rescan");
    }

    vm_record.set_disk_size_gib(new_gib);
    env.inventory.commit_vm(&mut vm_record).await?;
    info!(vm = vm_hostname, new_gib, "disk grown");
    Ok(())
}

/// `igvm mem-set <vm> <size> [--offline]` (ported from `mem_set`). `size`
/// is MiB, with the same `+`/`-` relative syntax as `disk_set`; must
/// resolve to a multiple of `128 * num_numa_nodes` MiB. Online uses DIMM
/// hotplug and only supports growing; `--offline` redefines the domain
/// with the new static size, which also allows shrinking. Refuses to
/// touch a hypervisor in `online_reserved` state unless `ignore_reserved`
/// is set (spec §6, `--ignore-reserved`).
#[instrument(skip(env))]
pub async fn mem_set(env: &OpsEnv, vm_hostname: &str, size: &str, offline: bool, ignore_reserved: bool) -> Result<()> {
    let (mut vm_record, hypervisor) = load_defined_vm(env, vm_hostname).await?;
    check_hypervisor_admits(&hypervisor, ignore_reserved)?;

    let new_mib = resolve_relative_size(size, vm_record.memory_mib, 'm')?;
    let granularity = 128 * hypervisor.num_numa_nodes().max(1) as u64;
    if new_mib % granularity != 0 {
        return Err(IgvmError::Config(format!("memory_mib must be a multiple of {granularity} MiB")));
    }
    if new_mib == vm_record.memory_mib {
        info!(vm = vm_hostname, "memory size unchanged");
        return Ok(());
    }

    if offline {
        run_in_transaction(None, |tx| {
            redefine_with_new_record(env, vm_record, hypervisor, tx, move |r| r.set_memory_mib(new_mib))
        })
        .await?;
    } else {
        hypervisor.vm_set_memory(&vm_record, new_mib).await?;
        vm_record.set_memory_mib(new_mib);
        env.inventory.commit_vm(&mut vm_record).await?;
    }
    info!(vm = vm_hostname, new_mib, offline, "memory resized");
    Ok(())
}

/// `igvm vcpu-set <vm> <count> [--offline]`. Online grows/shrinks the live
/// vCPU count within `Hypervisor::vm_set_num_cpu`'s cap and re-pins;
/// `--offline` redefines the domain with the new static `<vcpu>` count.
/// Refuses to touch a hypervisor in `online_reserved` state unless
/// `ignore_reserved` is set (spec §6, `--ignore-reserved`).
#[instrument(skip(env))]
pub async fn vcpu_set(env: &OpsEnv, vm_hostname: &str, count: u32, offline: bool, ignore_reserved: bool) -> Result<()> {
    let (mut vm_record, hypervisor) = load_defined_vm(env, vm_hostname).await?;
    check_hypervisor_admits(&hypervisor, ignore_reserved)?;
    if count == 0 {
        return Err(IgvmError::Config("num_cpu must be > 0".into()));
    }
    if count == vm_record.num_cpu {
        info!(vm = vm_hostname, "vCPU count unchanged");
        return Ok(());
    }

    if offline {
        run_in_transaction(None, |tx| {
            redefine_with_new_record(env, vm_record, hypervisor, tx, move |r| r.set_num_cpu(count))
        })
        .await?;
    } else {
        hypervisor.vm_set_num_cpu(&vm_record, count).await?;
        vm_record.set_num_cpu(count);
        env.inventory.commit_vm(&mut vm_record).await?;
    }
    info!(vm = vm_hostname, count, offline, "vCPU count changed");
    Ok(())
}

/// Shared `--offline` path for `mem_set`/`vcpu_set`: stop the domain if
/// running, apply `mutate` to the record, redefine it with the new static
/// value, commit, and restart if it had been running. Offline redefinition
/// is how this crate supports a memory *shrink* (never available live)
/// and lets both resize commands share one transaction shape.
async fn redefine_with_new_record(
    env: &OpsEnv,
    mut vm_record: VmRecord,
    hypervisor: Hypervisor,
    tx: &mut Transaction,
    mutate: impl FnOnce(&mut VmRecord),
) -> Result<()> {
    let was_running = hypervisor.vm_running(&vm_record).await?;
    if was_running {
        hypervisor.stop_vm(&vm_record).await?;
    }
    mutate(&mut vm_record);
    let mac_address = vm_record
        .mac
        .iter()
        .next()
        .cloned()
        .ok_or_else(|| IgvmError::Config(format!("{} has no MAC address on record", vm_record.hostname)))?;
    let vlan_tag = vlan_tag_for(&hypervisor.record, &vm_record.route_network);
    hypervisor.define_vm(&vm_record, &mac_address, vlan_tag, tx).await?;
    env.inventory.commit_vm(&mut vm_record).await?;
    if was_running {
        hypervisor.start_vm(&vm_record, tx).await?;
    }
    Ok(())
}

/// Resolve a `mem_set`/`disk_set`-style size argument: `+N`/`-N` is
/// relative to `current`, anything else is absolute (ported from
/// `igvm/commands.py`'s inlined prefix handling in `mem_set`/`disk_set`).
fn resolve_relative_size(text: &str, current: u64, unit: char) -> Result<u64> {
    if let Some(rest) = text.strip_prefix('+') {
        Ok(current + parse_size(rest, unit)?)
    } else if let Some(rest) = text.strip_prefix('-') {
        let delta = parse_size(rest, unit)?;
        current.checked_sub(delta).ok_or_else(|| IgvmError::Config("size delta exceeds current size".into()))
    } else {
        parse_size(text, unit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::MockExecutor;
    use crate::libvirt::MockLibvirtGateway;
    use crate::inventory::MockInventory;
    use crate::types::{HypervisorKind, HypervisorState};
    use std::collections::{HashMap, HashSet};
    use std::net::{IpAddr, Ipv4Addr};

    const NUMA_CMD: &str = "for d in /sys/devices/system/node/node[0-9]*; do cat \"$d/cpulist\"; done";

    fn test_hv() -> crate::types::HypervisorRecord {
        crate::types::HypervisorRecord {
            hostname: "hv1".into(),
            object_id: 1,
            hypervisor: HypervisorKind::Kvm,
            state: HypervisorState::Online,
            vlan_networks: HashSet::from(["internal".to_string()]),
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

    fn test_vm(hostname: &str, state: VmLifecycleState) -> VmRecord {
        VmRecord {
            hostname: hostname.to_string(),
            object_id: 42,
            intern_ip: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 5)),
            memory_mib: 2048,
            num_cpu: 2,
            disk_size_gib: 20,
            os: "bookworm".to_string(),
            state,
            puppet_ca: "ca.example.com".to_string(),
            puppet_master: "puppet.example.com".to_string(),
            mac: HashSet::from(["aa:bb:cc:00:00:01".to_string()]),
            sshfp: HashSet::new(),
            xen_host: "hv1".to_string(),
            route_network: "internal".to_string(),
            project: None,
            function: None,
            extra: HashMap::new(),
            dirty: HashSet::new(),
        }
    }

    fn test_env(inventory: Arc<MockInventory>, libvirt: Arc<MockLibvirtGateway>, executor: Arc<MockExecutor>) -> OpsEnv {
        OpsEnv {
            inventory,
            libvirt,
            executor,
            settings: FleetSettings::default(),
        }
    }

    async fn seed_defined(inventory: &Arc<MockInventory>, libvirt: &Arc<MockLibvirtGateway>, executor: &Arc<MockExecutor>, vm: VmRecord) -> String {
        executor.stub(NUMA_CMD, "0-23");
        inventory.seed_hypervisor(test_hv());
        let domain_name = vm.domain_name();
        libvirt.define_domain("hv1", &format!("<domain><name>{domain_name}</name></domain>")).await.unwrap();
        inventory.seed_vm(vm);
        domain_name
    }

    #[tokio::test]
    async fn start_is_a_noop_when_already_running() {
        let inventory = Arc::new(MockInventory::new());
        let libvirt = Arc::new(MockLibvirtGateway::new());
        let executor = Arc::new(MockExecutor::new());
        let vm = test_vm("vm1.example.com", VmLifecycleState::Running);
        let domain_name = seed_defined(&inventory, &libvirt, &executor, vm).await;
        libvirt.start_domain("hv1", &domain_name).await.unwrap();

        let env = test_env(inventory, libvirt, executor);
        start(&env, "vm1.example.com").await.unwrap();
    }

    #[tokio::test]
    async fn delete_without_retire_removes_the_inventory_object() {
        let inventory = Arc::new(MockInventory::new());
        let libvirt = Arc::new(MockLibvirtGateway::new());
        let executor = Arc::new(MockExecutor::new());
        executor.stub("lvs --noheadings -o name,vg_name,lv_size --unit m --nosuffix", "42_vm2.example.com vg0 20480");
        executor.stub("lvremove -f /dev/vg0/42_vm2.example.com", "");
        let vm = test_vm("vm2.example.com", VmLifecycleState::Stopped);
        seed_defined(&inventory, &libvirt, &executor, vm).await;

        let env = test_env(inventory.clone(), libvirt, executor);
        delete(&env, "vm2.example.com", false, false).await.unwrap();

        assert!(inventory.get_vm("vm2.example.com").await.is_err());
    }

    #[tokio::test]
    async fn delete_refuses_a_running_vm_without_force() {
        let inventory = Arc::new(MockInventory::new());
        let libvirt = Arc::new(MockLibvirtGateway::new());
        let executor = Arc::new(MockExecutor::new());
        let vm = test_vm("vm3.example.com", VmLifecycleState::Running);
        let domain_name = seed_defined(&inventory, &libvirt, &executor, vm).await;
        libvirt.start_domain("hv1", &domain_name).await.unwrap();

        let env = test_env(inventory, libvirt, executor);
        let err = delete(&env, "vm3.example.com", false, false).await.unwrap_err();
        assert!(matches!(err, IgvmError::InvalidState(_)));
    }

    #[tokio::test]
    async fn delete_with_retire_keeps_the_object_but_marks_it_retired() {
        let inventory = Arc::new(MockInventory::new());
        let libvirt = Arc::new(MockLibvirtGateway::new());
        let executor = Arc::new(MockExecutor::new());
        executor.stub("lvs --noheadings -o name,vg_name,lv_size --unit m --nosuffix", "42_vm4.example.com vg0 20480");
        executor.stub("lvremove -f /dev/vg0/42_vm4.example.com", "");
        let vm = test_vm("vm4.example.com", VmLifecycleState::Stopped);
        seed_defined(&inventory, &libvirt, &executor, vm).await;

        let env = test_env(inventory.clone(), libvirt, executor);
        delete(&env, "vm4.example.com", false, true).await.unwrap();

        let record = inventory.get_vm("vm4.example.com").await.unwrap();
        assert_eq!(record.state, VmLifecycleState::Retired);
    }

    #[tokio::test]
    async fn disk_set_refuses_a_hypervisor_in_online_reserved_state() {
        let inventory = Arc::new(MockInventory::new());
        let libvirt = Arc::new(MockLibvirtGateway::new());
        let executor = Arc::new(MockExecutor::new());
        executor.stub(NUMA_CMD, "0-23");
        executor.stub("lvs --noheadings -o name,vg_name,lv_size --unit m --nosuffix", "42_vm9.example.com vg0 20480");
        executor.stub("lvresize /dev/vg0/42_vm9.example.com -L 30g", "");
        let mut hv = test_hv();
        hv.state = HypervisorState::OnlineReserved;
        inventory.seed_hypervisor(hv);
        let vm = test_vm("vm9.example.com", VmLifecycleState::Stopped);
        let domain_name = vm.domain_name();
        libvirt.define_domain("hv1", &format!("<domain><name>{domain_name}</name></domain>")).await.unwrap();
        inventory.seed_vm(vm);

        let env = test_env(inventory.clone(), libvirt.clone(), executor.clone());
        let err = disk_set(&env, "vm9.example.com", "30", false).await.unwrap_err();
        assert!(matches!(err, IgvmError::InvalidState(_)));

        disk_set(&env, "vm9.example.com", "30", true).await.unwrap();
        let record = inventory.get_vm("vm9.example.com").await.unwrap();
        assert_eq!(record.disk_size_gib, 30);
    }

    #[tokio::test]
    async fn disk_set_rejects_shrinking() {
        let inventory = Arc::new(MockInventory::new());
        let libvirt = Arc::new(MockLibvirtGateway::new());
        let executor = Arc::new(MockExecutor::new());
        let vm = test_vm("vm5.example.com", VmLifecycleState::Stopped);
        seed_defined(&inventory, &libvirt, &executor, vm).await;

        let env = test_env(inventory, libvirt, executor);
        let err = disk_set(&env, "vm5.example.com", "10", false).await.unwrap_err();
        assert!(matches!(err, IgvmError::Config(_)));
    }

    #[tokio::test]
    async fn disk_set_blockresizes_and_regrows_a_running_vms_filesystem() {
        let inventory = Arc::new(MockInventory::new());
        let libvirt = Arc::new(MockLibvirtGateway::new());
        let executor = Arc::new(MockExecutor::new());
        let vm = test_vm("vm7.example.com", VmLifecycleState::Running);
        let domain_name = seed_defined(&inventory, &libvirt, &executor, vm).await;
        libvirt.start_domain("hv1", &domain_name).await.unwrap();

        executor.stub("lvs --noheadings -o name,vg_name,lv_size --unit m --nosuffix", "42_vm7.example.com vg0 20480");
        executor.stub("lvresize /dev/vg0/42_vm7.example.com -L 30g", "");
        executor.stub("echo 1 > /sys/class/block/vda/device/rescan", "");
        executor.stub("xfs_growfs /", "");

        let env = test_env(inventory.clone(), libvirt.clone(), executor);
        disk_set(&env, "vm7.example.com", "30", false).await.unwrap();

        let resizes = libvirt.blockresizes.lock().unwrap();
        assert_eq!(resizes.len(), 1);
        assert_eq!(resizes[0].1, domain_name);
        assert_eq!(resizes[0].2, 30 * 1024 * 1024 * 1024);
        drop(resizes);

        let record = inventory.get_vm("vm7.example.com").await.unwrap();
        assert_eq!(record.disk_size_gib, 30);
    }

    #[tokio::test]
    async fn disk_set_skips_guest_rescan_for_a_stopped_vm() {
        let inventory = Arc::new(MockInventory::new());
        let libvirt = Arc::new(MockLibvirtGateway::new());
        let executor = Arc::new(MockExecutor::new());
        let vm = test_vm("vm8.example.com", VmLifecycleState::Stopped);
        seed_defined(&inventory, &libvirt, &executor, vm).await;

        executor.stub("lvs --noheadings -o name,vg_name,lv_size --unit m --nosuffix", "42_vm8.example.com vg0 20480");
        executor.stub("lvresize /dev/vg0/42_vm8.example.com -L 30g", "");

        let env = test_env(inventory.clone(), libvirt.clone(), executor);
        disk_set(&env, "vm8.example.com", "30", false).await.unwrap();

        assert!(libvirt.blockresizes.lock().unwrap().is_empty());
        let record = inventory.get_vm("vm8.example.com").await.unwrap();
        assert_eq!(record.disk_size_gib, 30);
    }

    #[tokio::test]
    async fn mem_set_online_rejects_a_size_not_divisible_by_the_granularity() {
        let inventory = Arc::new(MockInventory::new());
        let libvirt = Arc::new(MockLibvirtGateway::new());
        let executor = Arc::new(MockExecutor::new());
        let vm = test_vm("vm6.example.com", VmLifecycleState::Running);
        let domain_name = seed_defined(&inventory, &libvirt, &executor, vm).await;
        libvirt.start_domain("hv1", &domain_name).await.unwrap();

        let env = test_env(inventory, libvirt, executor);
        let err = mem_set(&env, "vm6.example.com", "4097", false, false).await.unwrap_err();
        assert!(matches!(err, IgvmError::Config(_)));
    }

    #[tokio::test]
    async fn resolve_relative_size_handles_plus_and_minus() {
        assert_eq!(resolve_relative_size("+1G", 2048, 'm').unwrap(), 2048 + 1024);
        assert_eq!(resolve_relative_size("1024", 2048, 'm').unwrap(), 1024);
        assert!(resolve_relative_size("-4G", 2048, 'm').is_err());
    }
}
