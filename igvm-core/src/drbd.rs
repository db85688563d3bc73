//! Component E: DRBD-based online-with-disk migration transport.
//!
//! Used instead of the plain netcat pipe when a migration must stay online
//! while the disk itself also moves (spec §4.E / §4.J "online, with disk
//! replication"). A [`DrbdReplica`] is one side of a one-shot, one-way
//! replication: the source host keeps serving its VM from the original LV
//! (device-mapper-swapped to read through `/dev/drbdN`) while the target
//! host's LV receives the same bytes, byte for byte, over the DRBD
//! protocol. Ported from the reference `igvm/drbd.py`.

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::error::{IgvmError, Result};
use crate::executor::{Executor, RunOpts};
use crate::transaction::Transaction;

/// One `DRBD` resource endpoint, either the source (master) or destination
/// (slave) side of a replication. `dev_minor` is discovered lazily and
/// cached, matching the reference `get_device_minor`.
pub struct DrbdReplica {
    executor: Arc<dyn Executor>,
    host: String,
    intern_ip: std::net::IpAddr,
    vg_name: String,
    lv_name: String,
    vm_name: String,
    is_master: bool,
    dev_minor: Option<u64>,
}

impl DrbdReplica {
    pub fn new(
        executor: Arc<dyn Executor>,
        host: impl Into<String>,
        intern_ip: std::net::IpAddr,
        vg_name: impl Into<String>,
        lv_name: impl Into<String>,
        vm_name: impl Into<String>,
        is_master: bool,
    ) -> Self {
        Self {
            executor,
            host: host.into(),
            intern_ip,
            vg_name: vg_name.into(),
            lv_name: lv_name.into(),
            vm_name: vm_name.into(),
            is_master,
            dev_minor: None,
        }
    }

    fn meta_disk(&self) -> String {
        format!("{}_meta", self.vm_name)
    }

    fn table_file(&self) -> String {
        format!("/tmp/{}_{}_table", self.vg_name, self.lv_name)
    }

    /// Register a rollback action that shells `command` on this replica's
    /// host, tolerating failure (the resource may already be half torn
    /// down by the time rollback runs).
    fn on_rollback(&self, tx: &mut Transaction, name: &'static str, command: String) {
        let executor = self.executor.clone();
        let host = self.host.clone();
        tx.on_rollback(name, async move {
            executor.run(&host, &command, RunOpts::warn_only()).await?;
            Ok(())
        });
    }

    async fn device_minor(&mut self) -> Result<u64> {
        if let Some(minor) = self.dev_minor {
            return Ok(minor);
        }
        let out = self
            .executor
            .run(
                &self.host,
                &format!("stat -L -c \"%T\" /dev/{}/{}", self.vg_name, self.lv_name),
                RunOpts::silent(),
            )
            .await?;
        let minor = u64::from_str_radix(out.stdout.trim(), 16)
            .map_err(|_| IgvmError::Storage("could not parse DRBD backing device minor".into()))?;
        self.dev_minor = Some(minor);
        Ok(minor)
    }

    async fn device_port(&mut self) -> Result<u64> {
        Ok(8000 + self.device_minor().await?)
    }

    async fn device_size_bytes(&self) -> Result<u64> {
        let out = self
            .executor
            .run(
                &self.host,
                &format!(
                    "lvs --noheadings -o lv_size --units b --nosuffix {}/{}",
                    self.vg_name, self.lv_name
                ),
                RunOpts::silent(),
            )
            .await?;
        out.stdout
            .trim()
            .trim_end_matches('B')
            .parse()
            .map_err(|_| IgvmError::Storage("could not parse LV size".into()))
    }

    /// One `on <host> { ... }` stanza of the `.res` file (ported from
    /// `get_host_config`).
    async fn host_config(&mut self) -> Result<String> {
        let port = self.device_port().await?;
        let minor = self.device_minor().await?;
        let disk = if self.is_master {
            format!("mapper/{}_orig", self.lv_name)
        } else {
            format!("{}/{}", self.vg_name, self.lv_name)
        };
        Ok(format!(
            "    on {} {{\n        address   {}:{port};\n        device    /dev/drbd{minor};\n        disk      /dev/{disk};\n        meta-disk /dev/{}/{};\n    }}",
            self.host, self.intern_ip, self.vg_name, self.meta_disk()
        ))
    }

    /// Create and zero the metadata device (256 MiB is sufficient up to
    /// ~7 TiB of synced storage, per the reference comment).
    pub async fn prepare_metadata_device(&self, tx: &mut Transaction) -> Result<()> {
        self.executor
            .run(&self.host, &format!("lvcreate -n {} -L256M {}", self.meta_disk(), self.vg_name), RunOpts::default())
            .await?;
        self.on_rollback(tx, "remove DRBD meta device", format!("lvremove -fy {}/{}", self.vg_name, self.meta_disk()));

        self.executor
            .run(
                &self.host,
                &format!("dd if=/dev/zero of=/dev/{}/{} bs=1048576 count=256", self.vg_name, self.meta_disk()),
                RunOpts::default(),
            )
            .await?;
        Ok(())
    }

    /// Dump the original LV's device-mapper table and re-map it under
    /// `<lv>_orig`, freeing the original name for DRBD to claim (master
    /// side only; ported from `prepare_lv_override`).
    pub async fn prepare_lv_override(&self, tx: &mut Transaction) -> Result<()> {
        self.executor
            .run(
                &self.host,
                &format!("dmsetup table /dev/{}/{} > {}", self.vg_name, self.lv_name, self.table_file()),
                RunOpts::default(),
            )
            .await?;
        self.executor
            .run(&self.host, &format!("dmsetup create {}_orig < {}", self.lv_name, self.table_file()), RunOpts::default())
            .await?;
        self.on_rollback(tx, "remove copy of original device", format!("dmsetup remove {}_orig", self.lv_name));
        Ok(())
    }

    /// Render and upload `/etc/drbd.d/<vm_name>.res` (ported from
    /// `build_config`). `peer` is the other endpoint of the replication.
    pub async fn build_config(&mut self, peer: &mut DrbdReplica, tx: &mut Transaction) -> Result<()> {
        let self_config = self.host_config().await?;
        let peer_config = peer.host_config().await?;
        let config = format!(
            "resource {} {{\n    net {{\n        protocol A;\n        max-buffers 24k;\n    }}\n    disk {{\n         no-disk-flushes;\n         no-md-flushes;\n         no-disk-barrier;\n         c-max-rate 750M;\n         resync-rate 750M;\n    }}\n{self_config}\n{peer_config}\n}}\n",
            self.vm_name
        );
        let remotepath = format!("/etc/drbd.d/{}.res", self.vm_name);
        self.executor.put_bytes(&self.host, config.as_bytes(), &remotepath, Some("0640")).await?;
        self.on_rollback(tx, "remove DRBD configuration file", format!("rm {remotepath}"));
        Ok(())
    }

    /// Master side: suspend the original LV, bring DRBD up as primary with
    /// `--overwrite-data-of-peer`, then swap the LV's device-mapper table
    /// to read through `/dev/drbdN` (ported from `replicate_to_slave`).
    pub async fn replicate_to_slave(&mut self, tx: &mut Transaction) -> Result<()> {
        let dev_size = self.device_size_bytes().await?;
        let lv_path = format!("/dev/{}/{}", self.vg_name, self.lv_name);

        self.executor.run(&self.host, &format!("dmsetup suspend {lv_path}"), RunOpts::default()).await?;
        self.on_rollback(tx, "resume original device", format!("dmsetup resume {lv_path}"));
        self.on_rollback(tx, "bring DRBD device down", format!("drbdadm down {}", self.vm_name));

        self.executor.run(&self.host, &format!("drbdadm create-md {}", self.vm_name), RunOpts::default()).await?;
        self.executor.run(&self.host, &format!("drbdadm up {}", self.vm_name), RunOpts::default()).await?;
        self.executor
            .run(&self.host, &format!("drbdadm -- --overwrite-data-of-peer primary {}", self.vm_name), RunOpts::default())
            .await?;

        let minor = self.device_minor().await?;
        self.executor
            .run(
                &self.host,
                &format!("dmsetup load {lv_path} --table \"0 {} linear /dev/drbd{minor} 0\"", dev_size / 512),
                RunOpts::default(),
            )
            .await?;
        // Rollback order matters: these run LIFO, so "restore table" fires
        // before "resume", mirroring the reference's registration order.
        self.on_rollback(tx, "resume LV device", format!("dmsetup resume {lv_path}"));
        self.on_rollback(tx, "restore LV device table", format!("dmsetup load {lv_path} < {}", self.table_file()));

        self.executor.run(&self.host, &format!("dmsetup resume {lv_path}"), RunOpts::default()).await?;
        Ok(())
    }

    /// Slave side: bring DRBD up and wait for the peer to connect
    /// (ported from `replicate_from_master`).
    pub async fn replicate_from_master(&self, tx: &mut Transaction) -> Result<()> {
        self.executor.run(&self.host, &format!("drbdadm create-md {}", self.vm_name), RunOpts::default()).await?;
        self.executor.run(&self.host, &format!("drbdadm up {}", self.vm_name), RunOpts::default()).await?;
        self.on_rollback(tx, "bring DRBD device down", format!("drbdadm down {}", self.vm_name));
        self.executor.run(&self.host, &format!("drbdadm wait-connect {}", self.vm_name), RunOpts::default()).await?;
        Ok(())
    }

    /// Poll `/proc/drbd` once a second, logging sync percentage/rate as
    /// they change, then block on `drbdsetup wait-sync` for the final
    /// handshake (spec §4.E "Progress display parses `/proc/drbd` and logs
    /// sync state", ported from `igvm/drbd.py`'s `show_proc_drbd`).
    pub async fn wait_for_sync(&mut self) -> Result<()> {
        let minor = self.device_minor().await?;
        info!(vm = %self.vm_name, minor, "waiting for DRBD sync");
        loop {
            let out = self.executor.run(&self.host, "cat /proc/drbd", RunOpts::silent()).await?;
            match parse_proc_drbd_progress(&out.stdout, minor) {
                Some(progress) if !progress.synced => {
                    info!(
                        vm = %self.vm_name,
                        minor,
                        percent = progress.percent,
                        rate_kb_s = progress.rate_kb_per_sec,
                        "drbd sync in progress"
                    );
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
                _ => break,
            }
        }
        self.executor.run(&self.host, &format!("drbdsetup wait-sync {minor}"), RunOpts::default()).await?;
        info!(vm = %self.vm_name, minor, "drbd sync complete");
        Ok(())
    }

    /// Tear the resource down: restore the original device-mapper table
    /// (master side), bring DRBD down, remove the meta device and config
    /// file (ported from `stop`).
    pub async fn stop(&self) -> Result<()> {
        let lv_path = format!("/dev/{}/{}", self.vg_name, self.lv_name);
        if self.is_master {
            self.executor
                .run(&self.host, &format!("dmsetup load {lv_path} < {}", self.table_file()), RunOpts::default())
                .await?;
            self.executor.run(&self.host, &format!("dmsetup resume {lv_path}"), RunOpts::default()).await?;
        }
        self.executor.run(&self.host, &format!("drbdadm down {}", self.vm_name), RunOpts::warn_only()).await?;
        if self.is_master {
            self.executor
                .run(&self.host, &format!("dmsetup remove {}_orig", self.lv_name), RunOpts::warn_only())
                .await?;
        }
        self.executor
            .run(&self.host, &format!("lvremove -fy {}/{}", self.vg_name, self.meta_disk()), RunOpts::warn_only())
            .await?;
        self.executor
            .run(&self.host, &format!("rm /etc/drbd.d/{}.res", self.vm_name), RunOpts::warn_only())
            .await?;
        Ok(())
    }
}

/// One resource's sync state, parsed out of `/proc/drbd` (ported from
/// `igvm/drbd.py`'s `show_proc_drbd`, which scrapes the same `sync'ed:
/// NN.N%` / `speed: N,NNN (N,NNN) K/sec` fields off the kernel's text
/// status file).
#[derive(Debug, Clone, Copy, PartialEq)]
struct DrbdSyncProgress {
    percent: f64,
    rate_kb_per_sec: Option<f64>,
    synced: bool,
}

/// Find the stanza for `minor` in `/proc/drbd`'s text and pull out its
/// `cs:` connection state plus, while still syncing, the `sync'ed:`
/// percentage and `speed:` rate. Returns `None` if the minor has no
/// stanza at all (resource already torn down).
fn parse_proc_drbd_progress(proc_drbd: &str, minor: u64) -> Option<DrbdSyncProgress> {
    let marker = format!("{minor}:");
    let mut lines = proc_drbd.lines().peekable();
    while let Some(line) = lines.next() {
        if !line.trim_start().starts_with(&marker) {
            continue;
        }
        let syncing = line.contains("cs:SyncSource") || line.contains("cs:SyncTarget");
        if !syncing {
            return Some(DrbdSyncProgress { percent: 100.0, rate_kb_per_sec: None, synced: true });
        }
        let mut percent = 0.0;
        let mut rate_kb_per_sec = None;
        while let Some(next) = lines.peek() {
            if next.trim_start().chars().next().is_some_and(|c| c.is_ascii_digit()) {
                break;
            }
            let next = lines.next().unwrap();
            if let Some(rest) = next.split("sync'ed:").nth(1) {
                if let Some(pct) = rest.trim().split('%').next() {
                    percent = pct.trim().parse().unwrap_or(0.0);
                }
            }
            if let Some(rest) = next.split("speed:").nth(1) {
                if let Some(token) = rest.trim().split_whitespace().next() {
                    rate_kb_per_sec = token.replace(',', "").parse().ok();
                }
            }
        }
        return Some(DrbdSyncProgress { percent, rate_kb_per_sec, synced: false });
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::MockExecutor;
    use std::net::{IpAddr, Ipv4Addr};

    fn ip() -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1))
    }

    #[tokio::test]
    async fn device_minor_is_cached_after_first_lookup() {
        let mock = MockExecutor::new();
        mock.stub("stat -L -c \"%T\" /dev/vg0/lv1", "b");
        let exec: Arc<dyn Executor> = Arc::new(mock);
        let mut replica = DrbdReplica::new(exec.clone(), "hv1", ip(), "vg0", "lv1", "vm1", true);
        assert_eq!(replica.device_minor().await.unwrap(), 0xb);
        assert_eq!(replica.device_port().await.unwrap(), 8000 + 0xb);
    }

    #[tokio::test]
    async fn prepare_metadata_device_registers_rollback() {
        let mock = MockExecutor::new();
        mock.stub("lvcreate -n vm1_meta -L256M vg0", "");
        mock.stub("dd if=/dev/zero of=/dev/vg0/vm1_meta bs=1048576 count=256", "");
        let exec: Arc<dyn Executor> = Arc::new(mock);
        let replica = DrbdReplica::new(exec, "hv1", ip(), "vg0", "lv1", "vm1", true);
        let mut tx = Transaction::new();
        replica.prepare_metadata_device(&mut tx).await.unwrap();
        assert_eq!(tx.len(), 1);
    }

    #[test]
    fn parse_proc_drbd_progress_reads_percent_and_rate_while_syncing() {
        let proc_drbd = "version: 8.4.11 (api:1/proto:86-101)\n\
 0: cs:SyncSource ro:Primary/Secondary ds:UpToDate/Inconsistent C r-----\n\
    ns:1048576 nr:0 dw:0 dr:1052356 al:0 bm:33 lo:0 pe:1 ua:0 ap:0 ep:1 wo:f oos:2097152\n\
\t[=====>..............] sync'ed: 33.4% (2048/3072)M\n\
\tfinish: 0:00:05 speed: 12,000 (12,000) K/sec\n";
        let progress = parse_proc_drbd_progress(proc_drbd, 0).unwrap();
        assert!(!progress.synced);
        assert!((progress.percent - 33.4).abs() < 0.01);
        assert_eq!(progress.rate_kb_per_sec, Some(12000.0));
    }

    #[test]
    fn parse_proc_drbd_progress_reports_synced_once_connected() {
        let proc_drbd = "version: 8.4.11 (api:1/proto:86-101)\n\
 0: cs:Connected ro:Secondary/Primary ds:UpToDate/UpToDate C r-----\n\
    ns:0 nr:2097152 dw:2097152 dr:0 al:0 bm:33 lo:0 pe:0 ua:0 ap:0 ep:1 wo:f oos:0\n";
        let progress = parse_proc_drbd_progress(proc_drbd, 0).unwrap();
        assert!(progress.synced);
    }

    #[test]
    fn parse_proc_drbd_progress_returns_none_for_missing_minor() {
        let proc_drbd = "version: 8.4.11 (api:1/proto:86-101)\n\
 1: cs:Connected ro:Secondary/Primary ds:UpToDate/UpToDate C r-----\n";
        assert!(parse_proc_drbd_progress(proc_drbd, 0).is_none());
    }

    #[tokio::test]
    async fn wait_for_sync_polls_until_connected_then_waits() {
        let mock = MockExecutor::new();
        mock.stub("stat -L -c \"%T\" /dev/vg0/lv1", "0");
        mock.stub(
            "cat /proc/drbd",
            "version: 8.4.11 (api:1/proto:86-101)\n 0: cs:Connected ro:Secondary/Primary ds:UpToDate/UpToDate C r-----\n",
        );
        mock.stub("drbdsetup wait-sync 0", "");
        let exec: Arc<dyn Executor> = Arc::new(mock);
        let mut replica = DrbdReplica::new(exec.clone(), "hv1", ip(), "vg0", "lv1", "vm1", true);
        replica.wait_for_sync().await.unwrap();
    }
}
