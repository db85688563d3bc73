//! Component G: the VM object.
//!
//! Wraps a [`VmRecord`] together with the [`Hypervisor`] currently hosting
//! it and exposes the guest-facing operations `build`/`migrate`/the CLI
//! subcommands drive: lifecycle transitions, guest-side file prep, SSH
//! host-key/Puppet bookkeeping. Ported from the reference `igvm/vm.py`'s
//! `VM` class.
//!
//! The one piece of that class worth calling out specifically is the
//! `mounted` flag: while a guest is up, `run`/`put`/`get` talk to it over
//! SSH on its own `intern_ip`; during `build` (before the guest ever boots)
//! and during an offline migration's Puppet run, the same calls instead go
//! through a chroot of the guest's filesystem mounted on the hypervisor.
//! Flipping `mounted` is what lets the rest of this module call `self.run`
//! without caring which transport is live.

use std::sync::Arc;
use std::time::Duration;

use tracing::instrument;

use crate::error::{IgvmError, Result};
use crate::executor::{Executor, RunOpts, RunOutput};
use crate::hypervisor::Hypervisor;
use crate::inventory::{Inventory, InventoryFilter};
use crate::settings::{self, FleetSettings, PuppetCaKind};
use crate::transaction::Transaction;
use crate::types::{VmLifecycleState, VmRecord};
use crate::util::wait_until;

/// Snapshot returned by [`Vm::info`] for the `info` CLI subcommand (spec
/// §6 `info`, ported from `VM.info`).
#[derive(Debug, Clone)]
pub struct VmInfo {
    pub status: &'static str,
    pub hypervisor: String,
    pub memory_mib: u64,
    pub num_cpu: u32,
    pub disk_size_gib: u64,
    /// Only populated when the guest is running.
    pub memory_free_mib: Option<u64>,
    pub load_avg_1m: Option<f64>,
}

/// One SSH host-key fingerprint entry, rendered as a DNS `SSHFP` record
/// string (spec §4.G, ported from `VM.create_ssh_keys`).
struct SshKeyType {
    /// `ssh-keygen -t` algorithm name.
    keygen_type: &'static str,
    /// RFC 4255 algorithm number: RSA=1, DSA=2, ECDSA=3, Ed25519=4.
    key_id: u8,
}

const SSH_KEY_TYPES: &[SshKeyType] = &[
    SshKeyType { keygen_type: "rsa", key_id: 1 },
    SshKeyType { keygen_type: "ecdsa", key_id: 3 },
    SshKeyType { keygen_type: "ed25519", key_id: 4 },
];

pub struct Vm {
    pub record: VmRecord,
    pub hypervisor: Hypervisor,
    executor: Arc<dyn Executor>,
    inventory: Arc<dyn Inventory>,
    /// See the module doc: whether guest file access currently goes
    /// through a chroot on the hypervisor (`true`) or SSH to the guest
    /// itself (`false`).
    mounted: Option<String>,
}

impl Vm {
    pub fn new(
        record: VmRecord,
        hypervisor: Hypervisor,
        executor: Arc<dyn Executor>,
        inventory: Arc<dyn Inventory>,
    ) -> Self {
        Self { record, hypervisor, executor, inventory, mounted: None }
    }

    /// Switch guest file access to a chroot mounted at `mount_path` on the
    /// hypervisor (used while the guest isn't booted yet, e.g. during
    /// `build`).
    pub fn mount(&mut self, mount_path: impl Into<String>) {
        self.mounted = Some(mount_path.into());
    }

    pub fn unmount(&mut self) {
        self.mounted = None;
    }

    /// Run an arbitrary command against the guest (or its chroot, while
    /// `mounted`), discarding output. Exposed for CLI-driven ops (e.g.
    /// `rename`'s hostname-file rewrite) that don't otherwise need to reach
    /// into this module.
    pub async fn run_raw(&self, command: &str) -> Result<()> {
        self.run(command, RunOpts::silent()).await?;
        Ok(())
    }

    /// Run a command either inside the guest (via SSH to its own IP) or,
    /// while `mounted`, chrooted into its filesystem on the hypervisor.
    async fn run(&self, command: &str, opts: RunOpts) -> Result<RunOutput> {
        match &self.mounted {
            Some(mount_path) => {
                let chrooted = format!("chroot {mount_path} /bin/bash -c {}", crate::executor::shell_escape(command));
                self.executor.run(self.hypervisor.hostname(), &chrooted, opts).await
            }
            None => self.executor.run(&self.record.intern_ip.to_string(), command, opts).await,
        }
    }

    async fn put_bytes(&self, data: &[u8], remotepath: &str, mode: Option<&str>) -> Result<()> {
        match &self.mounted {
            Some(mount_path) => {
                self.executor
                    .put_bytes(self.hypervisor.hostname(), data, &format!("{mount_path}{remotepath}"), mode)
                    .await
            }
            None => self.executor.put_bytes(&self.record.intern_ip.to_string(), data, remotepath, mode).await,
        }
    }

    /// Validate the inventory record is internally consistent before any
    /// mutating operation runs (spec §4.G `check_serveradmin_config`,
    /// ported 1:1 from `VM.check_serveradmin_config`). `memory_mib > 0` is
    /// the correct, non-inverted check — a record with no memory set is
    /// simply incomplete, never a deliberate "unlimited" sentinel.
    pub fn check_serveradmin_config(&self) -> Result<()> {
        if self.record.memory_mib == 0 {
            return Err(IgvmError::Config("memory_mib must be set".into()));
        }
        let num_nodes = self.hypervisor.num_numa_nodes().max(1) as u64;
        if self.record.memory_mib % (settings::MEMORY_HOTPLUG_GRANULARITY_MIB * num_nodes) != 0 {
            return Err(IgvmError::Config(format!(
                "memory_mib must be a multiple of {} MiB",
                settings::MEMORY_HOTPLUG_GRANULARITY_MIB * num_nodes
            )));
        }
        if self.record.num_cpu == 0 {
            return Err(IgvmError::Config("num_cpu must be set".into()));
        }
        if self.record.disk_size_gib == 0 {
            return Err(IgvmError::Config("disk_size_gib must be set".into()));
        }
        if self.record.puppet_ca.is_empty() || self.record.puppet_master.is_empty() {
            return Err(IgvmError::Config("puppet_ca and puppet_master must be set".into()));
        }
        if self.record.hostname.is_empty() {
            return Err(IgvmError::Config("hostname must be set".into()));
        }
        Ok(())
    }

    pub async fn is_running(&self) -> Result<bool> {
        self.hypervisor.vm_running(&self.record).await
    }

    /// Start the domain and wait for it to come up, registering a
    /// `shutdown` rollback (ported from `VM.start`).
    #[instrument(skip(self, tx), fields(vm = %self.record.hostname))]
    pub async fn start(&mut self, tx: &mut Transaction) -> Result<()> {
        self.hypervisor.start_vm(&self.record, tx).await?;
        self.record.set_state(VmLifecycleState::Running);
        self.inventory.commit_vm(&mut self.record).await
    }

    /// Shut the domain down gracefully (ported from `VM.shutdown`). Callers
    /// that need this reversible register their own `start` rollback
    /// around the call, since only they know whether shutting the guest
    /// back down afterwards is actually the right compensation.
    #[instrument(skip(self), fields(vm = %self.record.hostname))]
    pub async fn shutdown(&mut self) -> Result<()> {
        self.hypervisor.stop_vm(&self.record).await?;
        self.record.set_state(VmLifecycleState::Stopped);
        self.inventory.commit_vm(&mut self.record).await
    }

    /// Poll until the domain's running state matches `running` or the
    /// budget expires (spec §4.I, ported from `VM.wait_for_running`).
    pub async fn wait_for_running(&self, running: bool, budget: Duration) -> Result<()> {
        crate::util::retry_wait_backoff(
            || async {
                self.hypervisor
                    .vm_running(&self.record)
                    .await
                    .map(|r| r == running)
                    .unwrap_or(false)
            },
            "VM did not reach expected running state",
            budget,
        )
        .await
    }

    /// Snapshot status for the `info` command (ported from `VM.info`).
    pub async fn info(&self) -> Result<VmInfo> {
        let running = self.is_running().await?;
        let status = match self.record.state {
            VmLifecycleState::New => "new",
            VmLifecycleState::Retired => "retired",
            _ if running => "running",
            _ => "stopped",
        };
        let (memory_free_mib, load_avg_1m) = if running {
            let out = self.run("cat /proc/loadavg", RunOpts::silent()).await.ok();
            let load = out.and_then(|o| o.stdout.split_whitespace().next().map(str::to_string))
                .and_then(|s| s.parse().ok());
            (None, load)
        } else {
            (None, None)
        };
        Ok(VmInfo {
            status,
            hypervisor: self.hypervisor.hostname().to_string(),
            memory_mib: self.record.memory_mib,
            num_cpu: self.record.num_cpu,
            disk_size_gib: self.record.disk_size_gib,
            memory_free_mib,
            load_avg_1m,
        })
    }

    /// Generate one host key per [`SSH_KEY_TYPES`] entry inside the guest
    /// filesystem and return their `SSHFP`-formatted fingerprints (ported
    /// from `VM.create_ssh_keys`). Ed25519 is skipped on `wheezy`, which
    /// predates OpenSSH support for it.
    pub async fn create_ssh_keys(&self) -> Result<Vec<String>> {
        let mut fingerprints = Vec::new();
        for key_type in SSH_KEY_TYPES {
            if key_type.keygen_type == "ed25519" && self.record.os == "wheezy" {
                continue;
            }
            let path = format!("/etc/ssh/ssh_host_{}_key", key_type.keygen_type);
            self.run(
                &format!("ssh-keygen -q -t {} -N '' -f {path}", key_type.keygen_type),
                RunOpts::default(),
            )
            .await?;
            for (fp_id, hash_flag) in [(1u8, "md5"), (2u8, "sha256")] {
                let out = self
                    .run(&format!("ssh-keygen -l -E {hash_flag} -f {path}.pub"), RunOpts::silent())
                    .await?;
                let hexdigest = out
                    .stdout
                    .split_whitespace()
                    .nth(1)
                    .unwrap_or_default()
                    .trim_start_matches(&format!("{hash_flag}:"))
                    .to_string();
                fingerprints.push(format!("{} {fp_id} {hexdigest}", key_type.key_id));
            }
        }
        Ok(fingerprints)
    }

    /// Copy a local postboot script into the guest at `/buildvm-postboot`,
    /// to be run once after first boot (ported from `VM.copy_postboot_script`).
    pub async fn copy_postboot_script(&self, local_path: &str) -> Result<()> {
        let data = tokio::fs::read(local_path)
            .await
            .map_err(|e| IgvmError::Storage(format!("reading postboot script {local_path}: {e}")))?;
        self.put_bytes(&data, "/buildvm-postboot", Some("0755")).await
    }

    /// Run the postboot script copied in by [`Vm::copy_postboot_script`]
    /// inside the now-running guest, then remove it (ported from
    /// `setup_vm`'s `run('/buildvm-postboot')`).
    pub async fn run_postboot_script(&self) -> Result<()> {
        self.run("/buildvm-postboot", RunOpts::default()).await?;
        self.run("rm -f /buildvm-postboot", RunOpts::warn_only()).await?;
        Ok(())
    }

    /// Rescan the virtio block device for its new size, then grow the xfs
    /// root filesystem onto it (spec §6 `disk-set`, run once the guest's
    /// hypervisor-side LV has already been grown). Only meaningful while
    /// the guest is up; `disk-set` on a stopped guest just resizes the LV.
    pub async fn grow_root_filesystem(&self) -> Result<()> {
        let block_dev = settings::vm_block_device_name("kvm");
        self.run(&format!("echo 1 > /sys/class/block/{block_dev}/device/rescan"), RunOpts::warn_only())
            .await?;
        self.run("xfs_growfs /", RunOpts::default()).await?;
        Ok(())
    }

    pub async fn create_swap(&self, size_mib: u64) -> Result<()> {
        self.run(&format!("fallocate -l {size_mib}M /swap"), RunOpts::default()).await?;
        self.run("chmod 600 /swap", RunOpts::default()).await?;
        self.run("mkswap /swap", RunOpts::default()).await?;
        Ok(())
    }

    /// Write the guest-side configuration files a fresh image needs before
    /// first boot (ported from `VM.prepare_vm`): hostname, mailname,
    /// `/etc/hosts`, `/etc/fstab`, `/etc/resolv.conf` (copied from the
    /// hypervisor's own, since the guest doesn't have its own resolver
    /// configured yet), and a swap entry.
    #[instrument(skip(self, settings), fields(vm = %self.record.hostname))]
    pub async fn prepare_vm(&self, settings: &FleetSettings) -> Result<()> {
        self.put_bytes(format!("{}\n", self.record.hostname).as_bytes(), "/etc/hostname", None).await?;
        self.put_bytes(format!("{}\n", self.record.hostname).as_bytes(), "/etc/mailname", None).await?;

        let hosts = format!(
            "127.0.0.1 localhost\n{} {}\n",
            self.record.intern_ip, self.record.hostname
        );
        self.put_bytes(hosts.as_bytes(), "/etc/hosts", None).await?;

        let block_dev = settings::vm_block_device_name("kvm");
        let fstab = format!(
            "/dev/{block_dev} / xfs defaults 0 1\n/swap none swap sw 0 0\n"
        );
        self.put_bytes(fstab.as_bytes(), "/etc/fstab", None).await?;

        let resolv = settings
            .default_dns_servers
            .iter()
            .map(|ns| format!("nameserver {ns}\n"))
            .collect::<String>();
        self.put_bytes(resolv.as_bytes(), "/etc/resolv.conf", None).await?;

        self.create_swap(settings::DEFAULT_SWAP_SIZE_MIB).await?;
        Ok(())
    }

    /// Resolve a VM's `puppet_ca` attribute to the actual host to run
    /// `puppet cert clean`/`puppetserver ca clean` on (spec §4.G, ported
    /// from `igvm/puppet.py::get_puppet_ca`). `puppet_ca` may name the CA
    /// host directly, or a domain/load-balancer fronting a pool of CA
    /// nodes, per `settings.puppet_ca_kind`; unlike the reference's random
    /// pick among live pool members, this returns the first one found
    /// (deterministic, since this crate carries no `rand` dependency —
    /// see DESIGN.md).
    async fn resolve_puppet_ca_host(&self, settings: &FleetSettings) -> Result<String> {
        let ca = &self.record.puppet_ca;
        match settings.puppet_ca_kind.get(ca).copied().unwrap_or(PuppetCaKind::Vm) {
            PuppetCaKind::Vm => Ok(ca.clone()),
            PuppetCaKind::PublicDomain | PuppetCaKind::LoadBalancer => {
                let pool = self
                    .inventory
                    .query_vms(&InventoryFilter::by_extra_attribute("puppet_ca_pool", ca))
                    .await?;
                pool.into_iter()
                    .next()
                    .map(|node| node.hostname)
                    .ok_or_else(|| IgvmError::Config(format!("no online Puppet CA pool member found for {ca}")))
            }
        }
    }

    /// Attempt `puppet cert clean` up to
    /// [`settings::PUPPET_CERT_CLEAN_RETRIES`] times, sleeping 1s between
    /// tries (spec §7 "puppet cert clean → retry up to 10× (CRL
    /// regeneration race)", ported from `igvm/puppet.py::clean_cert`). A
    /// "no certificate to clean" response is treated the same as success;
    /// any other failure is retried. Exhausting all retries is logged and
    /// swallowed rather than failing the whole Puppet run, matching the
    /// reference, which only logs an error and carries on.
    async fn clean_puppet_cert(&self, ca_host: &str) -> Result<()> {
        let command = format!("puppet cert clean {}", self.record.hostname);
        for retry in 1..=settings::PUPPET_CERT_CLEAN_RETRIES {
            let out = self.executor.run(ca_host, &command, RunOpts::warn_only()).await?;
            let nothing_to_clean = out.stderr.to_lowercase().contains("could not find")
                || out.stderr.to_lowercase().contains("no certificate");
            if out.success || nothing_to_clean {
                if retry > 1 {
                    tracing::info!(vm = %self.record.hostname, retry, "cleaned puppet certificate after retrying");
                }
                return Ok(());
            }
            if retry < settings::PUPPET_CERT_CLEAN_RETRIES {
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
        tracing::error!(
            vm = %self.record.hostname,
            retries = settings::PUPPET_CERT_CLEAN_RETRIES,
            "failed to clean puppet certificate after exhausting all retries"
        );
        Ok(())
    }

    /// Run Puppet once inside the guest, blocking autostart of anything
    /// Puppet would otherwise start mid-run (ported from `VM.run_puppet`
    /// via `igvm/puppet.py`). `clear_cert` wipes any existing certificate
    /// on `puppet_ca` first, for a rebuild. Registers a rollback that
    /// kills a still-running `puppet agent` if a later pipeline step fails.
    #[instrument(skip(self, settings, tx), fields(vm = %self.record.hostname))]
    pub async fn run_puppet(&self, clear_cert: bool, settings: &FleetSettings, tx: &mut Transaction) -> Result<()> {
        if clear_cert {
            let ca_host = self.resolve_puppet_ca_host(settings).await?;
            self.clean_puppet_cert(&ca_host).await?;
        }

        self.run("echo 1 > /tmp/policy-rc.d.disabled", RunOpts::default()).await?;
        let result = self
            .run(
                "puppet agent --waitforcert=60 --onetime --no-daemonize --skip_tags=chroot_unsafe",
                RunOpts::warn_only(),
            )
            .await;
        self.run("rm -f /tmp/policy-rc.d.disabled", RunOpts::warn_only()).await.ok();

        let executor = self.executor.clone();
        let host = self.record.intern_ip.to_string();
        tx.on_rollback("stop stray puppet agent", async move {
            executor.run(&host, "pkill -f 'puppet agent'", RunOpts::warn_only()).await?;
            Ok(())
        });

        let out = result?;
        if !out.success {
            return Err(IgvmError::RemoteCommand(format!(
                "puppet run on {} failed: {}",
                self.record.hostname, out.stderr
            )));
        }
        Ok(())
    }

    /// Persist any locally dirtied fields (hostname, state, sshfp, ...) to
    /// the inventory.
    pub async fn commit(&mut self) -> Result<()> {
        self.inventory.commit_vm(&mut self.record).await
    }

    pub fn add_sshfp_records(&mut self, fingerprints: Vec<String>) {
        for fp in fingerprints {
            self.record.add_sshfp(fp);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::MockExecutor;
    use crate::inventory::MockInventory;
    use crate::libvirt::MockLibvirtGateway;
    use crate::types::{HypervisorKind, HypervisorRecord, HypervisorState, NumaTopology};
    use std::collections::{HashMap, HashSet};
    use std::net::{IpAddr, Ipv4Addr};

    fn test_vm() -> Vm {
        let hv_record = HypervisorRecord {
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
        };
        let hypervisor = Hypervisor::new(
            hv_record,
            NumaTopology { nodes: vec![vec![0, 1], vec![2, 3]] },
            Arc::new(MockInventory::new()),
            Arc::new(MockLibvirtGateway::new()),
            Arc::new(MockExecutor::new()),
        );
        let record = VmRecord {
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
        };
        Vm::new(record, hypervisor, Arc::new(MockExecutor::new()), Arc::new(MockInventory::new()))
    }

    #[test]
    fn check_serveradmin_config_rejects_misaligned_memory() {
        let mut vm = test_vm();
        vm.record.memory_mib = 4097;
        let err = vm.check_serveradmin_config().unwrap_err();
        assert!(matches!(err, IgvmError::Config(_)));
    }

    #[test]
    fn check_serveradmin_config_accepts_aligned_memory() {
        let vm = test_vm();
        assert!(vm.check_serveradmin_config().is_ok());
    }

    #[test]
    fn check_serveradmin_config_rejects_zero_memory() {
        let mut vm = test_vm();
        vm.record.memory_mib = 0;
        assert!(vm.check_serveradmin_config().is_err());
    }

    #[tokio::test]
    async fn create_ssh_keys_skips_ed25519_on_wheezy() {
        let mut vm = test_vm();
        vm.record.os = "wheezy".to_string();
        let keys = vm.create_ssh_keys().await.unwrap();
        // rsa + ecdsa, 2 fingerprints each, no ed25519.
        assert_eq!(keys.len(), 4);
        assert!(keys.iter().all(|k| !k.starts_with("4 ")));
    }

    #[tokio::test]
    async fn create_ssh_keys_includes_ed25519_elsewhere() {
        let vm = test_vm();
        let keys = vm.create_ssh_keys().await.unwrap();
        assert_eq!(keys.len(), 6);
    }

    #[tokio::test]
    async fn resolve_puppet_ca_host_defaults_to_direct() {
        let vm = test_vm();
        let settings = FleetSettings::default();
        assert_eq!(vm.resolve_puppet_ca_host(&settings).await.unwrap(), "ca.example.com");
    }

    #[tokio::test]
    async fn resolve_puppet_ca_host_resolves_a_load_balanced_pool() {
        let mut vm = test_vm();
        vm.record.puppet_ca = "ca-pool.example.com".to_string();
        let inventory = Arc::new(MockInventory::new());
        let mut pool_member = vm.record.clone();
        pool_member.hostname = "ca-node1.example.com".to_string();
        pool_member.state = VmLifecycleState::Running;
        pool_member.extra.insert("puppet_ca_pool".to_string(), "ca-pool.example.com".to_string());
        inventory.seed_vm(pool_member);
        vm.inventory = inventory;

        let mut settings = FleetSettings::default();
        settings.puppet_ca_kind.insert("ca-pool.example.com".to_string(), PuppetCaKind::LoadBalancer);

        assert_eq!(vm.resolve_puppet_ca_host(&settings).await.unwrap(), "ca-node1.example.com");
    }

    #[tokio::test]
    async fn resolve_puppet_ca_host_errors_when_pool_has_no_online_member() {
        let mut vm = test_vm();
        vm.record.puppet_ca = "ca-pool.example.com".to_string();
        let mut settings = FleetSettings::default();
        settings.puppet_ca_kind.insert("ca-pool.example.com".to_string(), PuppetCaKind::PublicDomain);
        assert!(vm.resolve_puppet_ca_host(&settings).await.is_err());
    }

    #[tokio::test]
    async fn clean_puppet_cert_succeeds_on_first_try() {
        let executor = Arc::new(MockExecutor::new());
        executor.stub("puppet cert clean vm1.example.com", "");
        let mut vm = test_vm();
        vm.executor = executor.clone();
        vm.clean_puppet_cert("ca.example.com").await.unwrap();
        assert_eq!(executor.calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn clean_puppet_cert_retries_past_a_crl_race_then_succeeds() {
        let executor = Arc::new(MockExecutor::new());
        executor.stub_failure("puppet cert clean vm1.example.com", "Error 3 on SSL exception");
        executor.stub("puppet cert clean vm1.example.com", "");
        let mut vm = test_vm();
        vm.executor = executor.clone();
        vm.clean_puppet_cert("ca.example.com").await.unwrap();
        assert_eq!(executor.calls.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn clean_puppet_cert_treats_nothing_to_clean_as_success() {
        let executor = Arc::new(MockExecutor::new());
        executor.stub_failure("puppet cert clean vm1.example.com", "could not find a certificate");
        let mut vm = test_vm();
        vm.executor = executor.clone();
        vm.clean_puppet_cert("ca.example.com").await.unwrap();
        assert_eq!(executor.calls.lock().unwrap().len(), 1);
    }
}
