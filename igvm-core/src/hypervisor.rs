//! Component F: the hypervisor object.
//!
//! Bundles a [`HypervisorRecord`] with the collaborators needed to act on
//! it — inventory (for locking and the `vms` join), libvirt (domain
//! lifecycle), the executor (storage/shell) — so `build`/`migrate` can call
//! one object instead of threading four handles through every function.
//! Ported from the reference `igvm/hypervisor.py`'s `Hypervisor`/`KVMHypervisor`
//! pair; Xen is out of scope here (spec §9), so there is only one kind.

use std::sync::Arc;
use std::time::Duration;

use tracing::{instrument, warn};

use crate::error::{IgvmError, Result};
use crate::executor::{Executor, RunOpts};
use crate::inventory::Inventory;
use crate::libvirt::{LibvirtGateway, MigrateFlags};
use crate::settings;
use crate::storage::StorageManager;
use crate::transaction::Transaction;
use crate::types::{HypervisorKind, HypervisorRecord, LiveDomainState, NumaTopology, VmRecord};
use crate::util::wait_until;
use crate::xml::{self, DomainXmlInput};

/// A hypervisor and everything needed to act on it. Holding `Arc<dyn _>`
/// collaborators rather than generics keeps `build`/`migrate`/`selector`
/// free of type parameters while still letting tests swap in mocks.
pub struct Hypervisor {
    pub record: HypervisorRecord,
    numa: NumaTopology,
    inventory: Arc<dyn Inventory>,
    libvirt: Arc<dyn LibvirtGateway>,
    executor: Arc<dyn Executor>,
}

impl Hypervisor {
    pub fn new(
        record: HypervisorRecord,
        numa: NumaTopology,
        inventory: Arc<dyn Inventory>,
        libvirt: Arc<dyn LibvirtGateway>,
        executor: Arc<dyn Executor>,
    ) -> Self {
        Self { record, numa, inventory, libvirt, executor }
    }

    pub fn hostname(&self) -> &str {
        &self.record.hostname
    }

    pub fn num_numa_nodes(&self) -> usize {
        self.record.num_numa_nodes(&self.numa)
    }

    fn storage(&self) -> StorageManager {
        StorageManager::new(self.executor.clone(), self.record.hostname.clone())
    }

    pub fn executor(&self) -> Arc<dyn Executor> {
        self.executor.clone()
    }

    /// Start a netcat receiver on this host for the `build`/offline-migrate
    /// disk transport (spec §4.I, §4.J, §6 "offline disk ship on 7000 +
    /// minor"). Returns the port the sender should connect to.
    pub async fn netcat_to_device(&self, device: &str) -> Result<u16> {
        self.storage().netcat_to_device(device).await
    }

    /// Ship `device` (`size_bytes` long) to `dest_host:port`'s netcat
    /// receiver.
    pub async fn device_to_netcat(&self, device: &str, size_bytes: u64, dest_host: &str, port: u16) -> Result<()> {
        self.storage().device_to_netcat(device, size_bytes, dest_host, port).await
    }

    pub async fn kill_netcat(&self, port: u16) -> Result<()> {
        self.storage().kill_netcat(port).await
    }

    /// Prime this host's `known_hosts` with the peer's SSH host key so a
    /// subsequent agent-forwarded `ssh` hop (source hypervisor dialing the
    /// destination to ship a disk, or vice versa) doesn't stall on a host
    /// key prompt (ported from `Hypervisor.accept_ssh_hostkey`).
    pub async fn accept_ssh_hostkey(&self, peer_host: &str) -> Result<()> {
        self.executor
            .run(
                &self.record.hostname,
                &format!("ssh-keyscan -H {peer_host} >> ~/.ssh/known_hosts"),
                RunOpts::warn_only(),
            )
            .await?;
        Ok(())
    }

    /// Refuse to act on anything but an online KVM hypervisor (spec §9:
    /// Xen is a placeholder only).
    fn require_kvm(&self) -> Result<()> {
        if self.record.hypervisor != HypervisorKind::Kvm {
            return Err(IgvmError::InvalidState(format!(
                "{} is not a KVM hypervisor",
                self.record.hostname
            )));
        }
        Ok(())
    }

    /// Verify this hypervisor could host `vm`: enough free memory, enough
    /// free disk on some volume group, and a matching VLAN (spec §4.F
    /// `check_vm`, ported from `Hypervisor.check_vm`/`KVMHypervisor.check_vm`).
    pub async fn check_vm(&self, vm: &VmRecord) -> Result<()> {
        self.require_kvm()?;

        if !self.record.vlan_networks.contains(&vm.route_network) {
            return Err(IgvmError::Network(format!(
                "{} does not serve VLAN {}",
                self.record.hostname, vm.route_network
            )));
        }

        let used_by_vms: u64 = 0; // actual VM memory sum is read from inventory by the selector;
                                  // here we only have this one VM's requirement to check against
                                  // the hypervisor's advertised free capacity.
        if self.record.free_memory_mib(used_by_vms) < vm.memory_mib as i64 {
            return Err(IgvmError::Hypervisor(format!(
                "{} does not have {} MiB free",
                self.record.hostname, vm.memory_mib
            )));
        }

        let vgs = self.storage().list_volume_groups().await?;
        let needed = vm.disk_size_gib + settings::HOST_RESERVED_ROOT_GIB;
        if !vgs.iter().any(|vg| vg.free_gib >= needed) {
            return Err(IgvmError::Storage(format!(
                "{} has no volume group with {} GiB free",
                self.record.hostname, needed
            )));
        }

        Ok(())
    }

    /// Validate a migration of `vm` from this hypervisor to `dst` (spec
    /// §4.F `check_migration`). Same-host migrations are always rejected;
    /// online migrations additionally require matching VLANs since the
    /// guest's network device cannot be swapped underneath it without a
    /// reboot.
    pub fn check_migration(&self, vm: &VmRecord, dst: &Hypervisor, offline: bool) -> Result<()> {
        if self.record.hostname == dst.record.hostname {
            return Err(IgvmError::InvalidState(format!(
                "{} is already the current hypervisor",
                dst.record.hostname
            )));
        }
        if !offline && !dst.record.vlan_networks.contains(&vm.route_network) {
            return Err(IgvmError::Network(format!(
                "online migration requires {} to already serve VLAN {}",
                dst.record.hostname, vm.route_network
            )));
        }
        Ok(())
    }

    /// Resolve the hypervisor-side LV path backing `vm`'s disk by asking
    /// LVM directly rather than assuming a fixed volume group, since
    /// `create_vm_storage` places the LV in whichever VG had room (spec
    /// §4.D `get_vm_volume`). Fails if no matching LV exists, or if its
    /// size disagrees with inventory by more than a rounding MiB.
    pub async fn vm_disk_path(&self, vm: &VmRecord) -> Result<String> {
        let lv = self
            .storage()
            .list_logical_volumes()
            .await?
            .into_iter()
            .find(|lv| lv.lv_name == vm.domain_name())
            .ok_or_else(|| {
                IgvmError::Storage(format!("no logical volume found for {}", vm.domain_name()))
            })?;
        let expected_mib = vm.disk_size_gib * 1024;
        if lv.size_mib + 1 < expected_mib {
            return Err(IgvmError::InconsistentAttribute(format!(
                "{} is {} MiB, inventory says {} GiB for {}",
                lv.path(), lv.size_mib, vm.disk_size_gib, vm.hostname
            )));
        }
        Ok(lv.path())
    }

    /// Create the guest's logical volume (spec §4.D, ported from
    /// `create_vm_storage`). Registers an `lvremove` rollback.
    #[instrument(skip(self, vm, tx), fields(hv = %self.record.hostname, vm = %vm.hostname))]
    pub async fn create_vm_storage(&self, vm: &VmRecord, tx: &mut Transaction) -> Result<String> {
        let path = self.storage().create_storage(&vm.domain_name(), vm.disk_size_gib).await?;
        let executor = self.executor.clone();
        let host = self.record.hostname.clone();
        let remove_path = path.clone();
        tx.on_rollback("remove VM storage", async move {
            let storage = StorageManager::new(executor, host);
            storage.remove_logical_volume(&remove_path).await
        });
        Ok(path)
    }

    /// `mkfs.xfs` + mount the guest's disk at a fresh temp directory,
    /// returning the mount path (ported from `format_vm_storage` +
    /// `mount_vm_storage`).
    pub async fn format_vm_storage(&self, vm: &VmRecord) -> Result<String> {
        let disk_path = self.vm_disk_path(vm).await?;
        self.storage().mount_storage(&disk_path, &vm.hostname).await
    }

    pub async fn mount_vm_storage(&self, vm: &VmRecord) -> Result<String> {
        let disk_path = self.vm_disk_path(vm).await?;
        self.storage().mount_temp(&disk_path, &format!("-{}", vm.hostname)).await
    }

    pub async fn umount_vm_storage(&self, mount_path: &str) -> Result<()> {
        self.storage().umount_temp(mount_path).await?;
        self.storage().remove_temp(mount_path).await
    }

    /// Remove the guest's logical volume outright. Refuses while the
    /// domain is still defined, matching the reference's guard against
    /// destroying storage out from under a live domain.
    pub async fn destroy_vm_storage(&self, vm: &VmRecord) -> Result<()> {
        if self.vm_defined(vm).await? {
            return Err(IgvmError::InvalidState(format!(
                "refusing to destroy storage for still-defined domain {}",
                vm.domain_name()
            )));
        }
        let disk_path = self.vm_disk_path(vm).await?;
        self.storage().remove_logical_volume(&disk_path).await
    }

    /// Rename the guest's now-orphaned LV to `<domain_name>.migrated.<now_unix>`
    /// instead of removing it, so a migration that turns out to be bad can
    /// still be recovered from the source's disk until
    /// [`settings::MIGRATED_LV_DELETION_DAYS`] elapses and the housekeeping
    /// sweep reaps it (spec §4.J). Refuses while the domain is still
    /// defined, same guard as [`Self::destroy_vm_storage`].
    pub async fn mark_vm_storage_migrated(&self, vm: &VmRecord, now_unix: i64) -> Result<()> {
        if self.vm_defined(vm).await? {
            return Err(IgvmError::InvalidState(format!(
                "refusing to rename storage for still-defined domain {}",
                vm.domain_name()
            )));
        }
        let disk_path = self.vm_disk_path(vm).await?;
        let new_name = format!("{}.{}.{now_unix}", vm.domain_name(), settings::MIGRATED_LV_SUFFIX);
        self.storage().rename_logical_volume(&disk_path, &new_name).await?;
        Ok(())
    }

    /// List every `.migrated.<unix_ts>` LV left behind by
    /// [`Self::mark_vm_storage_migrated`] on this host, together with the
    /// timestamp parsed back out of its name, for the housekeeping reaper.
    pub async fn list_migrated_storage(&self) -> Result<Vec<(String, i64)>> {
        let marker = format!(".{}.", settings::MIGRATED_LV_SUFFIX);
        Ok(self
            .storage()
            .list_logical_volumes()
            .await?
            .into_iter()
            .filter_map(|lv| {
                let (_, ts_str) = lv.lv_name.rsplit_once(&marker)?;
                let migrated_since: i64 = ts_str.parse().ok()?;
                Some((lv.path(), migrated_since))
            })
            .collect())
    }

    /// Remove a logical volume by its full `/dev/<vg>/<lv>` path, for
    /// reaping a migrated-away LV that backs no inventory object any more —
    /// unlike [`Self::destroy_vm_storage`], which takes a still-tracked [`VmRecord`].
    pub async fn remove_storage_path(&self, path: &str) -> Result<()> {
        self.storage().remove_logical_volume(path).await
    }

    /// Grow the guest's logical volume in place (spec §6 `disk-set`,
    /// ported from `igvm/utils/storage.py`'s `resize_logical_volume`
    /// caller). The filesystem inside the guest is grown separately, once
    /// the guest has rescanned the device — that step lives on [`crate::vm::Vm`]
    /// since it runs inside the guest, not on this hypervisor.
    pub async fn resize_vm_storage(&self, vm: &VmRecord, new_gib: u64) -> Result<()> {
        let disk_path = self.vm_disk_path(vm).await?;
        self.storage().resize_logical_volume(&disk_path, new_gib).await
    }

    /// Tell a *running* domain's QEMU process about the new backing-device
    /// size (`virsh blockresize`, spec §4.D). The LV must already have been
    /// grown with [`Self::resize_vm_storage`] before calling this; without
    /// it the guest's rescan of the block device finds nothing new to grow
    /// into, since QEMU still reports the old size to the virtio-blk
    /// frontend.
    pub async fn blockresize_vm_storage(&self, vm: &VmRecord, new_gib: u64) -> Result<()> {
        let block_dev = settings::vm_block_device_name("kvm");
        let new_size_bytes = new_gib * 1024 * 1024 * 1024;
        self.libvirt
            .blockresize_domain(&self.record.hostname, &vm.domain_name(), &block_dev, new_size_bytes)
            .await
    }

    /// Synthesize and define the domain XML (spec §4.H). Registers an
    /// `undefine` rollback.
    #[instrument(skip(self, vm, tx), fields(hv = %self.record.hostname, vm = %vm.hostname))]
    pub async fn define_vm(
        &self,
        vm: &VmRecord,
        mac_address: &str,
        vlan_tag: Option<u32>,
        tx: &mut Transaction,
    ) -> Result<()> {
        self.require_kvm()?;
        let qemu_version = self.libvirt.lib_version(&self.record.hostname).await?;
        let disk_path = self.vm_disk_path(vm).await?;
        let input = DomainXmlInput {
            vm,
            hv: &self.record,
            disk_path: &disk_path,
            mac_address,
            vlan_tag,
            numa: &self.numa,
            qemu_version,
        };
        let domain_xml = xml::synthesize_domain_xml(&input)?;
        self.libvirt.define_domain(&self.record.hostname, &domain_xml).await?;

        let libvirt = self.libvirt.clone();
        let host = self.record.hostname.clone();
        let domain_name = vm.domain_name();
        tx.on_rollback("undefine VM", async move {
            libvirt.undefine_domain(&host, &domain_name).await
        });
        Ok(())
    }

    pub async fn undefine_vm(&self, vm: &VmRecord) -> Result<()> {
        self.libvirt.undefine_domain(&self.record.hostname, &vm.domain_name()).await
    }

    pub async fn vm_defined(&self, vm: &VmRecord) -> Result<bool> {
        self.libvirt.domain_exists(&self.record.hostname, &vm.domain_name()).await
    }

    pub async fn vm_running(&self, vm: &VmRecord) -> Result<bool> {
        self.libvirt.domain_is_running(&self.record.hostname, &vm.domain_name()).await
    }

    /// Directly create or destroy the domain to match `should_run`, with no
    /// SSH wait and no rollback registered. Used by the housekeeping sweep
    /// to reconcile libvirt's running state against inventory outside of any
    /// single-VM transaction (spec: "Housekeeping daemon semantics").
    pub async fn set_domain_running(&self, vm: &VmRecord, should_run: bool) -> Result<()> {
        let domain_name = vm.domain_name();
        if should_run {
            self.libvirt.start_domain(&self.record.hostname, &domain_name).await
        } else {
            self.libvirt.destroy_domain(&self.record.hostname, &domain_name).await
        }
    }

    /// Start the domain, then wait for the guest's SSH port to answer
    /// (spec §4.I "wait for guest to come up").
    #[instrument(skip(self, vm, tx), fields(hv = %self.record.hostname, vm = %vm.hostname))]
    pub async fn start_vm(&self, vm: &VmRecord, tx: &mut Transaction) -> Result<()> {
        self.libvirt.start_domain(&self.record.hostname, &vm.domain_name()).await?;
        let libvirt = self.libvirt.clone();
        let host = self.record.hostname.clone();
        let domain_name = vm.domain_name();
        tx.on_rollback("shut down VM", async move {
            libvirt.destroy_domain(&host, &domain_name).await
        });
        wait_until(vm.intern_ip, 22, Duration::from_secs(60)).await
    }

    pub async fn stop_vm(&self, vm: &VmRecord) -> Result<()> {
        self.libvirt
            .shutdown_domain(&self.record.hostname, &vm.domain_name(), Duration::from_secs(60))
            .await
    }

    pub async fn stop_vm_force(&self, vm: &VmRecord) -> Result<()> {
        self.libvirt.destroy_domain(&self.record.hostname, &vm.domain_name()).await
    }

    pub async fn reboot_vm(&self, vm: &VmRecord) -> Result<()> {
        self.libvirt.reboot_domain(&self.record.hostname, &vm.domain_name()).await
    }

    /// Live-grow the vCPU count, then re-pin every vCPU NUMA-interleaved
    /// up to the new active count (spec §4.H "Live vCPU change").
    #[instrument(skip(self, vm), fields(hv = %self.record.hostname, vm = %vm.hostname))]
    pub async fn vm_set_num_cpu(&self, vm: &VmRecord, num_cpu: u32) -> Result<()> {
        let max_cpus = settings::KVM_DEFAULT_MAX_CPUS.max(vm.num_cpu).min(self.record.num_cpu);
        if num_cpu > max_cpus {
            return Err(IgvmError::Hypervisor(format!(
                "{} cannot receive more than {max_cpus} vCPUs",
                vm.domain_name()
            )));
        }
        let domain_name = vm.domain_name();
        self.libvirt.set_vcpus(&self.record.hostname, &domain_name, num_cpu).await?;

        for (vcpu, mask) in xml::vcpu_pin_masks(&self.numa, max_cpus, num_cpu) {
            self.libvirt.pin_vcpu(&self.record.hostname, &domain_name, vcpu, &mask).await?;
        }
        Ok(())
    }

    /// Live-grow memory via DIMM hotplug (spec §4.H "Live memory change"),
    /// falling back to an error if the delta isn't evenly divisible across
    /// NUMA nodes (shrinking memory live is not supported by qemu and is
    /// therefore not exposed here at all).
    #[instrument(skip(self, vm), fields(hv = %self.record.hostname, vm = %vm.hostname))]
    pub async fn vm_set_memory(&self, vm: &VmRecord, new_mib: u64) -> Result<()> {
        if new_mib <= vm.memory_mib {
            return Err(IgvmError::Config(
                "live memory change only supports growing a guest".into(),
            ));
        }
        let delta = new_mib - vm.memory_mib;
        let num_nodes = self.num_numa_nodes();
        for fragment in xml::dimm_attach_fragments(num_nodes, delta)? {
            self.libvirt
                .attach_device(&self.record.hostname, &vm.domain_name(), &fragment)
                .await?;
        }
        Ok(())
    }

    /// Drive a live migration of `vm` to `dst`, polling job stats once a
    /// second until libvirt reports no remaining bytes (spec §4.J "online,
    /// no disk move"). A SIGINT while the job is in flight aborts it via
    /// [`LibvirtGateway::abort_job`] and returns [`IgvmError::MigrationAborted`]
    /// instead of leaving the job running, so the caller's transaction
    /// unwinds (spec §4.J "KeyboardInterrupt aborts the job").
    #[instrument(skip(self, vm, dst), fields(src = %self.record.hostname, dst = %dst.record.hostname, vm = %vm.hostname))]
    pub async fn vm_migrate_online(&self, vm: &VmRecord, dst: &Hypervisor) -> Result<()> {
        let dest_uri = format!("qemu+tls://{}/system", dst.record.hostname);
        let domain_name = vm.domain_name();
        self.libvirt
            .migrate_to_uri3(&self.record.hostname, &domain_name, &dest_uri, MigrateFlags::live_default())
            .await?;

        loop {
            tokio::select! {
                biased;
                _ = tokio::signal::ctrl_c() => {
                    warn!(vm = %domain_name, "interrupt received, aborting in-flight migration");
                    self.libvirt.abort_job(&self.record.hostname, &domain_name).await?;
                    return Err(IgvmError::MigrationAborted(format!(
                        "migration of {domain_name} aborted by user interrupt"
                    )));
                }
                stats = self.libvirt.job_stats(&self.record.hostname, &domain_name) => {
                    let stats = stats?;
                    if stats.data_remaining == 0 && stats.memory_remaining == 0 {
                        break;
                    }
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }

        if self.libvirt.domain_is_running(&self.record.hostname, &domain_name).await? {
            return Err(IgvmError::MigrationError(format!(
                "{domain_name} is still running on {} after migration completed",
                self.record.hostname
            )));
        }
        Ok(())
    }

    /// Read the live domain's memory/vCPU count back for the `sync`
    /// command and the post-migration consistency check (spec §4.F
    /// `vm_sync_from_hypervisor`).
    pub async fn vm_sync_from_hypervisor(&self, vm: &VmRecord) -> Result<LiveDomainState> {
        let domain_name = vm.domain_name();
        let running = self.libvirt.domain_is_running(&self.record.hostname, &domain_name).await?;
        let domain_xml = self.libvirt.get_domain_xml(&self.record.hostname, &domain_name).await?;
        xml::parse_live_domain_state(&domain_xml, vm.disk_size_gib, running)
    }

    /// Estimate this hypervisor's overall CPU utilization if `vm` were
    /// added, by scaling its own reported `cpu_util_pct` by the VM's share
    /// of total vCPUs (spec §4.K, ported from `Hypervisor.estimate_cpu_usage`
    /// used by `HypervisorCpuUsageLimit`). Returns `None` when there isn't
    /// enough data yet (freshly admitted hypervisor).
    pub fn estimate_cpu_usage(&self, vm: &VmRecord) -> Option<f64> {
        if self.record.num_cpu == 0 {
            return None;
        }
        let additional_share = vm.num_cpu as f64 / self.record.num_cpu as f64 * 100.0;
        Some(self.record.cpu_util_pct + additional_share)
    }

    /// Acquire the advisory lock and commit it (spec §4.F "Locking").
    /// Fails if someone else's lock is still live.
    pub async fn acquire_lock(&mut self, now_unix: i64) -> Result<()> {
        if self.record.is_locked(now_unix, settings::LOCK_TIMEOUT_SECS) {
            return Err(IgvmError::InvalidState(format!(
                "{} is locked by another igvm run",
                self.record.hostname
            )));
        }
        self.record.acquire_lock(now_unix);
        self.inventory.commit_hypervisor(&mut self.record).await
    }

    pub async fn release_lock(&mut self) -> Result<()> {
        self.record.release_lock();
        self.inventory.commit_hypervisor(&mut self.record).await
    }

    /// Rename a domain in place: define it under the new name pointing at
    /// the same storage, then drop the old definition (ported from
    /// `rename_vm`; never touches storage, only the libvirt object).
    pub async fn rename_vm(
        &self,
        old_vm: &VmRecord,
        new_vm: &VmRecord,
        mac_address: &str,
        vlan_tag: Option<u32>,
        tx: &mut Transaction,
    ) -> Result<()> {
        self.define_vm(new_vm, mac_address, vlan_tag, tx).await?;
        self.libvirt.undefine_domain(&self.record.hostname, &old_vm.domain_name()).await?;
        Ok(())
    }

    /// Best-effort warning log when the remote libvirt connection needs a
    /// fresh pooled entry (spec §4.C "reconnect on failure"); pipelines
    /// call this after any [`IgvmError::Hypervisor`] bubbling out of a
    /// libvirt call, then retry once.
    pub async fn forget_connection(&self) {
        warn!(hv = %self.record.hostname, "dropping pooled libvirt connection after error");
        self.libvirt.forget_connection(&self.record.hostname).await;
    }
}

/// Read the physical NUMA topology off a live host by listing
/// `/sys/devices/system/node/node*/cpulist` (spec §4.H synthesis). Falls
/// back to a single node spanning no CPUs if the host doesn't expose NUMA
/// nodes at all (e.g. a single-socket box), matching the synthesizer's
/// `num_nodes().max(1)` treatment of an empty topology.
pub async fn discover_numa_topology(executor: &Arc<dyn Executor>, host: &str) -> Result<NumaTopology> {
    let out = executor
        .run(
            host,
            "for d in /sys/devices/system/node/node[0-9]*; do cat \"$d/cpulist\"; done",
            RunOpts::silent(),
        )
        .await?;
    let nodes: Vec<Vec<u32>> = out
        .stdout
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(parse_cpulist)
        .collect();
    Ok(NumaTopology { nodes })
}

/// Resolve the numeric 802.1Q tag a hypervisor uses for a given
/// route-network, stored as a `vlan_tag:<route_network>` entry in its
/// `extra` attributes since the inventory schema only models VLAN
/// membership (spec §4.H "VLAN tag from HV's network mapping").
pub fn vlan_tag_for(hv: &HypervisorRecord, route_network: &str) -> Option<u32> {
    hv.extra.get(&format!("vlan_tag:{route_network}")).and_then(|v| v.parse().ok())
}

fn parse_cpulist(cpulist: &str) -> Vec<u32> {
    let mut cpus = Vec::new();
    for part in cpulist.split(',') {
        match part.split_once('-') {
            Some((start, end)) => {
                if let (Ok(start), Ok(end)) = (start.parse(), end.parse()) {
                    cpus.extend(start..=end);
                }
            }
            None => {
                if let Ok(cpu) = part.parse() {
                    cpus.push(cpu);
                }
            }
        }
    }
    cpus
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inventory::MockInventory;
    use crate::libvirt::MockLibvirtGateway;
    use crate::executor::MockExecutor;
    use crate::types::{HypervisorState, VmLifecycleState};
    use std::collections::{HashMap, HashSet};
    use std::net::{IpAddr, Ipv4Addr};

    fn test_hv_record() -> HypervisorRecord {
        HypervisorRecord {
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
            cpu_util_pct: 10.0,
            igvm_locked: None,
            extra: HashMap::new(),
            dirty: HashSet::new(),
        }
    }

    fn test_vm_record() -> VmRecord {
        VmRecord {
            hostname: "vm1.example.com".into(),
            object_id: 42,
            intern_ip: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 5)),
            memory_mib: 4096,
            num_cpu: 2,
            disk_size_gib: 20,
            os: "bookworm".into(),
            state: VmLifecycleState::New,
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

    fn test_hypervisor() -> Hypervisor {
        Hypervisor::new(
            test_hv_record(),
            NumaTopology { nodes: vec![vec![0, 1], vec![2, 3]] },
            Arc::new(MockInventory::new()),
            Arc::new(MockLibvirtGateway::new()),
            Arc::new(MockExecutor::new()),
        )
    }

    #[test]
    fn check_migration_rejects_same_host() {
        let hv = test_hypervisor();
        let dst = test_hypervisor();
        let vm = test_vm_record();
        let err = hv.check_migration(&vm, &dst, true).unwrap_err();
        assert!(matches!(err, IgvmError::InvalidState(_)));
    }

    #[test]
    fn check_migration_rejects_vlan_mismatch_when_online() {
        let hv = test_hypervisor();
        let mut dst_record = test_hv_record();
        dst_record.hostname = "hv2".into();
        dst_record.vlan_networks = HashSet::new();
        let dst = Hypervisor::new(
            dst_record,
            NumaTopology::default(),
            Arc::new(MockInventory::new()),
            Arc::new(MockLibvirtGateway::new()),
            Arc::new(MockExecutor::new()),
        );
        let vm = test_vm_record();
        assert!(hv.check_migration(&vm, &dst, false).is_err());
        assert!(hv.check_migration(&vm, &dst, true).is_ok());
    }

    #[tokio::test]
    async fn check_vm_rejects_unserved_vlan() {
        let hv = test_hypervisor();
        let mut vm = test_vm_record();
        vm.route_network = "other".into();
        let err = hv.check_vm(&vm).await.unwrap_err();
        assert!(matches!(err, IgvmError::Network(_)));
    }

    #[test]
    fn estimate_cpu_usage_scales_by_vcpu_share() {
        let hv = test_hypervisor();
        let vm = test_vm_record();
        // vm has 2/24 vcpus -> ~8.33% additional load on top of 10% baseline.
        let estimate = hv.estimate_cpu_usage(&vm).unwrap();
        assert!((estimate - 18.33).abs() < 0.1);
    }

    #[tokio::test]
    async fn acquire_lock_fails_when_already_locked() {
        let mut hv = test_hypervisor();
        hv.record.acquire_lock(1000);
        let err = hv.acquire_lock(1100).await.unwrap_err();
        assert!(matches!(err, IgvmError::InvalidState(_)));
    }

    #[tokio::test]
    async fn vm_migrate_online_completes_once_job_stats_drain() {
        let src = test_hypervisor();
        let mut dst_record = test_hv_record();
        dst_record.hostname = "hv2".into();
        let dst = Hypervisor::new(
            dst_record,
            NumaTopology::default(),
            Arc::new(MockInventory::new()),
            Arc::new(MockLibvirtGateway::new()),
            Arc::new(MockExecutor::new()),
        );
        let vm = test_vm_record();
        // MockLibvirtGateway reports zero remaining bytes on the first poll
        // and stops tracking the domain as running once migrate_to_uri3 is
        // called, so the select loop's job-stats arm should win the race
        // against ctrl_c and return normally.
        src.vm_migrate_online(&vm, &dst).await.unwrap();
    }

    #[tokio::test]
    async fn discover_numa_topology_parses_cpulists() {
        let exec = MockExecutor::new();
        exec.stub(
            "for d in /sys/devices/system/node/node[0-9]*; do cat \"$d/cpulist\"; done",
            "0-2,5-6\n3-4,7\n",
        );
        let executor: Arc<dyn Executor> = Arc::new(exec);
        let topology = discover_numa_topology(&executor, "hv1").await.unwrap();
        assert_eq!(topology.nodes, vec![vec![0, 1, 2, 5, 6], vec![3, 4, 7]]);
    }
}
