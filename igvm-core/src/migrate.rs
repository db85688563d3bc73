//! Component J: the migration pipeline.
//!
//! Moves a guest from its current hypervisor to another. Three transports
//! are supported (spec §4.J):
//!
//! - **offline**: the guest is shut down, its disk ships whole to the
//!   destination (netcat or DRBD, selected by [`OfflineTransport`]), then
//!   the domain is redefined and started on the destination.
//! - **online, shared storage unaffected**: a plain libvirt live migration
//!   (`migrateToURI3` with `NON_SHARED_DISK`, handled entirely by
//!   [`Hypervisor::vm_migrate_online`]) — used whenever `!opts.offline`.
//!
//! Ported from the reference `migratevm.py`'s `migrate_*` family, which
//! fans the same steps out across Fabric host roles; here it is one
//! straight-line async function per transport, composed under a single
//! [`Transaction`].

use std::sync::Arc;

use tracing::{info, instrument, warn};

use crate::drbd::DrbdReplica;
use crate::error::{IgvmError, Result};
use crate::executor::{Executor, RunOpts};
use crate::hypervisor::{discover_numa_topology, vlan_tag_for, Hypervisor};
use crate::inventory::{Inventory, InventoryFilter};
use crate::libvirt::LibvirtGateway;
use crate::selector::{self, SelectorCandidate, SelectorConfig};
use crate::settings::{FleetSettings, Mode};
use crate::transaction::{run_in_transaction, Transaction};
use crate::types::{
    HypervisorRecord, HypervisorState, MigrateOptions, OfflineTransport, VmLifecycleState, VmRecord,
};
use crate::xml::generate_mac_address;

/// Collaborators the migration pipeline needs, same shape as [`crate::build::BuildEnv`]
/// minus the image fetcher migration never touches.
pub struct MigrateEnv {
    pub inventory: Arc<dyn Inventory>,
    pub libvirt: Arc<dyn LibvirtGateway>,
    pub executor: Arc<dyn Executor>,
    pub settings: FleetSettings,
}

/// Run the full migration pipeline for `vm_hostname` (ported from
/// `migratevm.py::main`). The VM must already be `stopped` or `running`;
/// `new` and `retired` guests have no hypervisor worth migrating from.
#[instrument(skip(env, opts), fields(vm = %vm_hostname))]
pub async fn migratevm(env: &MigrateEnv, vm_hostname: &str, opts: &MigrateOptions) -> Result<()> {
    run_in_transaction(None, |tx| migratevm_inner(env, vm_hostname, opts, tx)).await
}

async fn migratevm_inner(
    env: &MigrateEnv,
    vm_hostname: &str,
    opts: &MigrateOptions,
    tx: &mut Transaction,
) -> Result<()> {
    // An online migration cannot change the guest's IP: the network device
    // stays plugged into whatever VLAN the source port group already wired
    // up, so a live move can never swap it underneath the running guest.
    // Reject before any mutation (spec §8 scenario 6), not partway through.
    if !opts.offline && opts.new_ip.is_some() {
        return Err(IgvmError::Config(
            "--newip requires --offline: online migration cannot change the guest's IP".into(),
        ));
    }

    let mut vm_record = env.inventory.get_vm(vm_hostname).await?;
    if !matches!(vm_record.state, VmLifecycleState::Running | VmLifecycleState::Stopped) {
        return Err(IgvmError::InvalidState(format!(
            "{vm_hostname} is {:?}, not eligible for migration",
            vm_record.state
        )));
    }
    let was_running = vm_record.state == VmLifecycleState::Running;

    let src_hostname = vm_record.xen_host.clone();
    let src_record = env.inventory.get_hypervisor(&src_hostname).await?;
    let src_numa = discover_numa_topology(&env.executor, &src_hostname).await?;
    let mut src = Hypervisor::new(
        src_record,
        src_numa,
        env.inventory.clone(),
        env.libvirt.clone(),
        env.executor.clone(),
    );

    // First precondition, before any lock/select/transfer step (ported from
    // `migratevm.py`'s `check_attributes`): refuse to migrate a VM whose
    // inventory record has drifted from what the source hypervisor actually
    // reports. Migrating stale memory/vcpu/running-state data would make it
    // the new "truth" on the destination.
    check_attributes_in_sync(&src, &vm_record, was_running).await?;

    let dst_record = match &opts.target_hypervisor {
        Some(host) => {
            let hv = env.inventory.get_hypervisor(host).await?;
            if !hv.state.admits_operations(opts.ignore_reserved) {
                return Err(IgvmError::InvalidState(format!(
                    "{host} has state {:?}; pass --ignore-reserved to force migration onto it",
                    hv.state
                )));
            }
            hv
        }
        None => select_destination(env, &vm_record, &src_hostname, opts.ignore_reserved).await?,
    };
    let dst_hostname = dst_record.hostname.clone();
    let dst_numa = discover_numa_topology(&env.executor, &dst_hostname).await?;
    let mut dst = Hypervisor::new(
        dst_record,
        dst_numa,
        env.inventory.clone(),
        env.libvirt.clone(),
        env.executor.clone(),
    );

    src.check_migration(&vm_record, &dst, opts.offline)?;

    // Lock both hypervisors before checking capacity, lowest hostname
    // first so two concurrent migrations crossing the same pair of hosts
    // in opposite directions can't deadlock each other's lock acquisition.
    let now_unix = chrono::Utc::now().timestamp();
    if src_hostname < dst_hostname {
        lock_hypervisor(env, &mut src, now_unix, tx).await?;
        lock_hypervisor(env, &mut dst, now_unix, tx).await?;
    } else {
        lock_hypervisor(env, &mut dst, now_unix, tx).await?;
        lock_hypervisor(env, &mut src, now_unix, tx).await?;
    }

    dst.check_vm(&vm_record).await?;

    let mac_address = vm_record
        .mac
        .iter()
        .next()
        .cloned()
        .unwrap_or_else(|| generate_mac_address(vm_record.object_id));
    let vlan_tag = vlan_tag_for(&dst.record, &vm_record.route_network);

    if opts.offline {
        migrate_offline(env, &mut vm_record, &src, &dst, opts, &mac_address, vlan_tag, was_running, now_unix, tx).await?;
    } else {
        migrate_online(&vm_record, &src, &dst).await?;
        src.undefine_vm(&vm_record).await?;
    }

    vm_record.set_xen_host(dst_hostname);
    if let Some(new_ip) = opts.new_ip {
        vm_record.set_intern_ip(new_ip);
    }
    env.inventory.commit_vm(&mut vm_record).await?;

    // checkpoint: the guest is defined (or already running) on the
    // destination and inventory now says so; undoing past this point
    // would strand a VM inventory claims lives somewhere it doesn't.
    tx.checkpoint();

    src.release_lock().await?;
    dst.release_lock().await?;

    Ok(())
}

async fn lock_hypervisor(env: &MigrateEnv, hv: &mut Hypervisor, now_unix: i64, tx: &mut Transaction) -> Result<()> {
    hv.acquire_lock(now_unix).await?;
    let inventory = env.inventory.clone();
    let hostname = hv.hostname().to_string();
    tx.on_rollback("release hypervisor lock", async move {
        let mut record = inventory.get_hypervisor(&hostname).await?;
        record.release_lock();
        inventory.commit_hypervisor(&mut record).await
    });
    Ok(())
}

/// Read the live domain back from the source hypervisor and refuse to
/// proceed if memory, vCPU count or running state on inventory have
/// drifted from what libvirt actually reports (spec §4.J precondition,
/// ported from `migratevm.py`'s `check_attributes`). `igvm sync` is the
/// documented remedy.
async fn check_attributes_in_sync(src: &Hypervisor, vm: &VmRecord, was_running: bool) -> Result<()> {
    let live = src.vm_sync_from_hypervisor(vm).await?;
    if live.memory_mib != vm.memory_mib {
        return Err(IgvmError::InconsistentAttribute(format!(
            "{}: inventory memory {} MiB does not match live domain memory {} MiB; run `igvm sync` first",
            vm.hostname, vm.memory_mib, live.memory_mib
        )));
    }
    if live.num_cpu != vm.num_cpu {
        return Err(IgvmError::InconsistentAttribute(format!(
            "{}: inventory num_cpu {} does not match live domain vcpu count {}; run `igvm sync` first",
            vm.hostname, vm.num_cpu, live.num_cpu
        )));
    }
    if live.running != was_running {
        return Err(IgvmError::InconsistentAttribute(format!(
            "{}: inventory state does not match live domain running={}; run `igvm sync` first",
            vm.hostname, live.running
        )));
    }
    Ok(())
}

/// Gather online, route-network-serving, environment-matched candidates
/// other than the VM's current hypervisor and rank them with the selector
/// (spec §4.K), exactly the same shape `build` uses for initial placement.
async fn select_destination(
    env: &MigrateEnv,
    vm: &VmRecord,
    exclude_hostname: &str,
    ignore_reserved: bool,
) -> Result<HypervisorRecord> {
    let environment = match env.settings.mode {
        Mode::Testing => "testing",
        Mode::Production => "production",
    };
    let filter = InventoryFilter { environment: Some(environment.to_string()), ..Default::default() };
    let hvs = env.inventory.query_hypervisors(&filter).await?;

    let mut candidates = Vec::new();
    for hv in hvs {
        if hv.hostname == exclude_hostname {
            continue;
        }
        if !hv.state.admits_operations(ignore_reserved) {
            continue;
        }
        if !hv.vlan_networks.contains(&vm.route_network) {
            continue;
        }
        let siblings = env
            .inventory
            .query_vms(&InventoryFilter::by_hypervisor(hv.hostname.clone()))
            .await?
            .into_iter()
            .filter(|v| v.state != VmLifecycleState::Retired && v.hostname != vm.hostname)
            .collect();
        candidates.push(SelectorCandidate { hv, sibling_vms: siblings });
    }

    let config = SelectorConfig::baseline(environment);
    let ranked = selector::select(vm, candidates, &config).await;
    ranked
        .into_iter()
        .next()
        .map(|scored| scored.hv)
        .ok_or_else(|| {
            IgvmError::Hypervisor(format!("no migration destination satisfies placement constraints for {}", vm.hostname))
        })
}

/// Online migration with no disk move: libvirt streams memory state (and,
/// since `NON_SHARED_DISK` is part of [`crate::libvirt::MigrateFlags::live_default`],
/// any disk blocks the destination doesn't already have) directly between
/// the two hosts. Re-pins vCPUs on the destination afterward since the
/// libvirt migration carries over the domain XML's `<cputune>` verbatim,
/// which still names the source host's physical CPU numbers — meaningless
/// once the guest is running on different silicon.
#[instrument(skip(vm, src, dst), fields(vm = %vm.hostname, src = %src.hostname(), dst = %dst.hostname()))]
async fn migrate_online(vm: &VmRecord, src: &Hypervisor, dst: &Hypervisor) -> Result<()> {
    src.vm_migrate_online(vm, dst).await?;
    dst.vm_set_num_cpu(vm, vm.num_cpu).await?;
    Ok(())
}

/// Offline migration: shut the guest down (if it was up), ship its disk to
/// the destination whole, optionally rerun Puppet inside a chroot when the
/// address changed, then define and (if it was running before) start it on
/// the new host (ported from `migratevm.py`'s offline path).
#[allow(clippy::too_many_arguments)]
#[instrument(skip(env, vm, src, dst, opts, tx), fields(vm = %vm.hostname, src = %src.hostname(), dst = %dst.hostname()))]
async fn migrate_offline(
    env: &MigrateEnv,
    vm: &mut VmRecord,
    src: &Hypervisor,
    dst: &Hypervisor,
    opts: &MigrateOptions,
    mac_address: &str,
    vlan_tag: Option<u32>,
    was_running: bool,
    now_unix: i64,
    tx: &mut Transaction,
) -> Result<()> {
    if opts.maintenance {
        vm.set_state(VmLifecycleState::Maintenance);
        env.inventory.commit_vm(vm).await?;
    }

    if was_running {
        src.stop_vm(vm).await?;
    }

    let dst_path = dst.create_vm_storage(vm, tx).await?;

    match opts.offline_transport {
        OfflineTransport::Netcat => ship_disk_netcat(src, dst, vm, &dst_path).await?,
        OfflineTransport::Drbd => ship_disk_drbd(env, src, dst, vm, &dst_path, tx).await?,
    }

    if opts.run_puppet && opts.new_ip.is_some() {
        info!(vm = %vm.hostname, "rerunning puppet inside migration chroot for new address");
        let mount_path = dst.mount_vm_storage(vm).await?;
        let puppet_result = run_puppet_in_chroot(&env.executor, dst.hostname(), &mount_path, &vm.hostname, tx).await;
        dst.umount_vm_storage(&mount_path).await?;
        puppet_result?;
    } else if opts.run_puppet {
        warn!(vm = %vm.hostname, "--run-puppet requested without --new-ip, nothing to rerun for an offline move");
    }

    dst.define_vm(vm, mac_address, vlan_tag, tx).await?;

    src.undefine_vm(vm).await?;
    src.mark_vm_storage_migrated(vm, now_unix).await?;

    if was_running {
        dst.start_vm(vm, tx).await?;
        vm.set_state(VmLifecycleState::Running);
    } else {
        vm.set_state(VmLifecycleState::Stopped);
    }

    Ok(())
}

/// Stream the source's whole disk device to a netcat receiver on the
/// destination (ported from `migratevm.py`'s default offline transport).
async fn ship_disk_netcat(src: &Hypervisor, dst: &Hypervisor, vm: &VmRecord, dst_path: &str) -> Result<()> {
    let port = dst.netcat_to_device(dst_path).await?;
    let size_bytes = vm.disk_size_gib * 1024 * 1024 * 1024;
    let src_path = src.vm_disk_path(vm).await?;
    if let Err(e) = src.device_to_netcat(&src_path, size_bytes, dst.hostname(), port).await {
        dst.kill_netcat(port).await.ok();
        return Err(e);
    }
    Ok(())
}

/// Ship the disk over a throwaway one-shot DRBD resource instead of a
/// netcat pipe, for network paths flaky enough that a dropped connection
/// shouldn't mean restarting the whole transfer (spec §4.E). Torn down
/// again once fully synced — the guest stays offline throughout, so there
/// is no reason to keep replicating afterward.
async fn ship_disk_drbd(
    env: &MigrateEnv,
    src: &Hypervisor,
    dst: &Hypervisor,
    vm: &VmRecord,
    dst_path: &str,
    tx: &mut Transaction,
) -> Result<()> {
    let src_path = src.vm_disk_path(vm).await?;
    let (src_vg, src_lv) = split_vg_lv(&src_path)?;
    let (dst_vg, dst_lv) = split_vg_lv(dst_path)?;
    let vm_name = vm.domain_name();

    let mut master = DrbdReplica::new(env.executor.clone(), src.hostname(), vm.intern_ip, src_vg, src_lv, vm_name.clone(), true);
    let mut slave = DrbdReplica::new(env.executor.clone(), dst.hostname(), vm.intern_ip, dst_vg, dst_lv, vm_name, false);

    master.prepare_metadata_device(tx).await?;
    slave.prepare_metadata_device(tx).await?;
    master.prepare_lv_override(tx).await?;
    master.build_config(&mut slave, tx).await?;
    slave.replicate_from_master(tx).await?;
    master.replicate_to_slave(tx).await?;
    slave.wait_for_sync().await?;

    master.stop().await?;
    slave.stop().await?;
    Ok(())
}

/// Split an LVM device path (`/dev/<vg>/<lv>`) into its components.
fn split_vg_lv(path: &str) -> Result<(String, String)> {
    let stripped = path
        .strip_prefix("/dev/")
        .ok_or_else(|| IgvmError::Storage(format!("not an LVM device path: {path}")))?;
    let mut parts = stripped.splitn(2, '/');
    let vg = parts
        .next()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| IgvmError::Storage(format!("malformed device path: {path}")))?
        .to_string();
    let lv = parts
        .next()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| IgvmError::Storage(format!("malformed device path: {path}")))?
        .to_string();
    Ok((vg, lv))
}

/// Run Puppet once inside the destination's mounted-but-not-booted guest
/// filesystem, the same chroot trick [`crate::vm::Vm`] uses during build
/// (needed here because the guest's IP is changing, so there is no address
/// to SSH into yet). A narrower copy of [`crate::vm::Vm::run_puppet`]
/// without certificate-clearing, since an offline migration keeps the
/// guest's existing Puppet certificate.
async fn run_puppet_in_chroot(
    executor: &Arc<dyn Executor>,
    host: &str,
    mount_path: &str,
    vm_hostname: &str,
    tx: &mut Transaction,
) -> Result<()> {
    let chroot_cmd = |cmd: &str| format!("chroot {mount_path} /bin/bash -c {}", crate::executor::shell_escape(cmd));

    executor.run(host, &chroot_cmd("echo 1 > /tmp/policy-rc.d.disabled"), RunOpts::default()).await?;
    let result = executor
        .run(
            host,
            &chroot_cmd("puppet agent --waitforcert=60 --onetime --no-daemonize --skip_tags=chroot_unsafe"),
            RunOpts::warn_only(),
        )
        .await;
    executor.run(host, &chroot_cmd("rm -f /tmp/policy-rc.d.disabled"), RunOpts::warn_only()).await.ok();

    let executor2 = executor.clone();
    let host2 = host.to_string();
    tx.on_rollback("stop stray puppet agent in migration chroot", async move {
        executor2.run(&host2, "pkill -f 'puppet agent'", RunOpts::warn_only()).await?;
        Ok(())
    });

    let out = result?;
    if !out.success {
        return Err(IgvmError::RemoteCommand(format!(
            "puppet run for {vm_hostname} inside migration chroot failed: {}",
            out.stderr
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::MockExecutor;
    use crate::inventory::MockInventory;
    use crate::libvirt::MockLibvirtGateway;
    use crate::types::{HypervisorKind, VmRecord};
    use std::collections::{HashMap, HashSet};
    use std::net::{IpAddr, Ipv4Addr};

    fn test_hv(hostname: &str) -> HypervisorRecord {
        HypervisorRecord {
            hostname: hostname.to_string(),
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
            cpu_util_pct: 5.0,
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
            disk_size_gib: 6,
            os: "bookworm".into(),
            state,
            puppet_ca: "ca.example.com".into(),
            puppet_master: "puppet.example.com".into(),
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

    fn test_env(inventory: Arc<MockInventory>, executor: Arc<MockExecutor>) -> MigrateEnv {
        test_env_with_libvirt(inventory, executor, Arc::new(MockLibvirtGateway::new()))
    }

    fn test_env_with_libvirt(
        inventory: Arc<MockInventory>,
        executor: Arc<MockExecutor>,
        libvirt: Arc<MockLibvirtGateway>,
    ) -> MigrateEnv {
        MigrateEnv {
            inventory,
            libvirt,
            executor,
            settings: FleetSettings::default(),
        }
    }

    /// Define a domain on `host` that reports the same memory/vcpu values
    /// `vm` already has on inventory, so `check_attributes_in_sync` finds
    /// nothing to complain about.
    async fn seed_domain_in_sync(libvirt: &MockLibvirtGateway, host: &str, vm: &VmRecord, running: bool) {
        let xml = format!(
            "<domain><name>{}</name><memory unit='MiB'>{}</memory><vcpu placement='static'>{}</vcpu></domain>",
            vm.domain_name(),
            vm.memory_mib,
            vm.num_cpu,
        );
        libvirt.define_domain(host, &xml).await.unwrap();
        if running {
            libvirt.start_domain(host, &vm.domain_name()).await.unwrap();
        }
    }

    const NUMA_CMD: &str = "for d in /sys/devices/system/node/node[0-9]*; do cat \"$d/cpulist\"; done";
    const VGS_CMD: &str = "vgs --noheadings -o vg_name,vg_free --unit g --nosuffix";
    const LVS_CMD: &str = "lvs --noheadings -o name,vg_name,lv_size --unit m --nosuffix";

    #[tokio::test]
    async fn migratevm_rejects_online_migration_with_new_ip() {
        let inv = Arc::new(MockInventory::new());
        inv.seed_vm(test_vm("vm1.example.com", VmLifecycleState::Running));
        let exec = Arc::new(MockExecutor::new());
        let env = test_env(inv, exec);

        let opts = MigrateOptions {
            target_hypervisor: Some("hv2".into()),
            new_ip: Some("10.20.6.253".parse().unwrap()),
            offline: false,
            ..Default::default()
        };
        let err = migratevm(&env, "vm1.example.com", &opts).await.unwrap_err();
        assert!(matches!(err, IgvmError::Config(_)));
    }

    #[tokio::test]
    async fn migratevm_rejects_vm_not_eligible() {
        let inv = Arc::new(MockInventory::new());
        inv.seed_vm(test_vm("vm1.example.com", VmLifecycleState::New));
        let exec = Arc::new(MockExecutor::new());
        let env = test_env(inv, exec);

        let err = migratevm(&env, "vm1.example.com", &MigrateOptions::default()).await.unwrap_err();
        assert!(matches!(err, IgvmError::InvalidState(_)));
    }

    #[tokio::test]
    async fn migratevm_fails_when_no_destination_satisfies_constraints() {
        let inv = Arc::new(MockInventory::new());
        let vm = test_vm("vm1.example.com", VmLifecycleState::Stopped);
        inv.seed_vm(vm.clone());
        inv.seed_hypervisor(test_hv("hv1"));
        let exec = Arc::new(MockExecutor::new());
        exec.stub(NUMA_CMD, "0-1\n");
        let libvirt = Arc::new(MockLibvirtGateway::new());
        seed_domain_in_sync(&libvirt, "hv1", &vm, false).await;
        let env = test_env_with_libvirt(inv, exec, libvirt);

        let err = migratevm(&env, "vm1.example.com", &MigrateOptions::default()).await.unwrap_err();
        assert!(matches!(err, IgvmError::Hypervisor(_)));
    }

    #[tokio::test]
    async fn migratevm_rejects_drifted_inventory() {
        let inv = Arc::new(MockInventory::new());
        let mut vm = test_vm("vm1.example.com", VmLifecycleState::Stopped);
        inv.seed_vm(vm.clone());
        inv.seed_hypervisor(test_hv("hv1"));
        inv.seed_hypervisor(test_hv("hv2"));
        let exec = Arc::new(MockExecutor::new());
        exec.stub(NUMA_CMD, "0-1\n");
        let libvirt = Arc::new(MockLibvirtGateway::new());
        // The live domain reports 4096 MiB, but inventory still says 2048.
        vm.memory_mib = 4096;
        seed_domain_in_sync(&libvirt, "hv1", &vm, false).await;
        let env = test_env_with_libvirt(inv, exec, libvirt);

        let opts = MigrateOptions { target_hypervisor: Some("hv2".into()), ..Default::default() };
        let err = migratevm(&env, "vm1.example.com", &opts).await.unwrap_err();
        assert!(matches!(err, IgvmError::InconsistentAttribute(_)));
    }

    #[tokio::test]
    async fn migratevm_refuses_an_online_reserved_target_unless_ignore_reserved() {
        let inv = Arc::new(MockInventory::new());
        let vm = test_vm("vm1.example.com", VmLifecycleState::Stopped);
        inv.seed_vm(vm.clone());
        inv.seed_hypervisor(test_hv("hv1"));
        let mut hv2 = test_hv("hv2");
        hv2.state = HypervisorState::OnlineReserved;
        inv.seed_hypervisor(hv2);
        let exec = Arc::new(MockExecutor::new());
        exec.stub(NUMA_CMD, "0-1\n");
        let libvirt = Arc::new(MockLibvirtGateway::new());
        seed_domain_in_sync(&libvirt, "hv1", &vm, false).await;
        let env = test_env_with_libvirt(inv, exec, libvirt);

        let opts = MigrateOptions { target_hypervisor: Some("hv2".into()), ..Default::default() };
        let err = migratevm(&env, "vm1.example.com", &opts).await.unwrap_err();
        assert!(matches!(err, IgvmError::InvalidState(_)));
    }

    #[tokio::test]
    async fn migratevm_offline_netcat_moves_a_stopped_vm_to_the_target_hypervisor() {
        let inv = Arc::new(MockInventory::new());
        let vm = test_vm("vm1.example.com", VmLifecycleState::Stopped);
        inv.seed_vm(vm.clone());
        inv.seed_hypervisor(test_hv("hv1"));
        inv.seed_hypervisor(test_hv("hv2"));
        let libvirt = Arc::new(MockLibvirtGateway::new());
        seed_domain_in_sync(&libvirt, "hv1", &vm, false).await;

        let exec = Arc::new(MockExecutor::new());
        exec.stub(NUMA_CMD, "0-1\n");
        exec.stub(VGS_CMD, "vg0 100\n");
        // first answer: no LV yet (create_vm_storage's duplicate check); second
        // answer: the LV that now exists, resolved by every vm_disk_path call
        // afterwards (source disk lookup, destination's own define_vm lookup,
        // and the final rename on the source). The rename's destination name
        // embeds the wall-clock migration timestamp, so it's left unstubbed
        // and falls through to MockExecutor's default success response.
        exec.stub(LVS_CMD, "");
        exec.stub(LVS_CMD, "42_vm1.example.com vg0 6144\n");
        exec.stub("lvcreate -L 6g -n 42_vm1.example.com vg0", "");
        exec.stub("stat -L -c '%T' /dev/vg0/42_vm1.example.com", "5");
        exec.stub_failure("pgrep -f '^/bin/nc.traditional -l -p 7005'", "");
        exec.stub("nohup /bin/nc.traditional -l -p 7005 | dd of=/dev/vg0/42_vm1.example.com obs=1048576 &", "");
        exec.stub(
            "dd if=/dev/vg0/42_vm1.example.com ibs=1048576 | pv -f -s 6442450944 | /bin/nc.traditional -q 1 hv2 7005",
            "",
        );

        let env = test_env_with_libvirt(inv.clone(), exec, libvirt);
        let opts = MigrateOptions {
            target_hypervisor: Some("hv2".into()),
            offline: true,
            ..Default::default()
        };

        let result = migratevm(&env, "vm1.example.com", &opts).await;
        assert!(result.is_ok(), "migratevm failed: {:?}", result.err());

        let vm = inv.get_vm("vm1.example.com").await.unwrap();
        assert_eq!(vm.xen_host, "hv2");
        assert_eq!(vm.state, VmLifecycleState::Stopped);
    }

    #[tokio::test]
    async fn migratevm_online_live_migration_keeps_the_vm_running() {
        let inv = Arc::new(MockInventory::new());
        let vm = test_vm("vm1.example.com", VmLifecycleState::Running);
        inv.seed_vm(vm.clone());
        inv.seed_hypervisor(test_hv("hv1"));
        inv.seed_hypervisor(test_hv("hv2"));
        let libvirt = Arc::new(MockLibvirtGateway::new());
        seed_domain_in_sync(&libvirt, "hv1", &vm, true).await;

        let exec = Arc::new(MockExecutor::new());
        exec.stub(NUMA_CMD, "0-1\n");
        exec.stub(VGS_CMD, "vg0 100\n");

        let env = test_env_with_libvirt(inv.clone(), exec, libvirt);
        let opts = MigrateOptions {
            target_hypervisor: Some("hv2".into()),
            offline: false,
            ..Default::default()
        };

        let result = migratevm(&env, "vm1.example.com", &opts).await;
        assert!(result.is_ok(), "migratevm failed: {:?}", result.err());

        let vm = inv.get_vm("vm1.example.com").await.unwrap();
        assert_eq!(vm.xen_host, "hv2");
        assert_eq!(vm.state, VmLifecycleState::Running);
    }
}
