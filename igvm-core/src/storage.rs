//! Component D: LVM-backed guest storage and the netcat/DRBD transport
//! primitives migration uses to ship a disk between hypervisors.
//!
//! Every operation here runs through an [`Executor`] against a specific
//! hypervisor host rather than touching local block devices directly,
//! mirroring the reference `igvm/utils/storage.py` / `managevm/utils/storage.py`
//! pair (both shell out via Fabric's `run`).

use std::sync::Arc;

use tracing::{debug, info};

use crate::error::{IgvmError, Result};
use crate::executor::{Executor, RunOpts};
use crate::settings::vm_block_device_name;

/// A logical volume as reported by `lvs`.
#[derive(Debug, Clone)]
pub struct LogicalVolume {
    pub vg_name: String,
    pub lv_name: String,
    pub size_mib: u64,
}

impl LogicalVolume {
    pub fn path(&self) -> String {
        format!("/dev/{}/{}", self.vg_name, self.lv_name)
    }
}

/// A volume group as reported by `vgs`.
#[derive(Debug, Clone)]
pub struct VolumeGroup {
    pub name: String,
    pub free_gib: u64,
}

/// Storage manager for one hypervisor host. Holds nothing but the host
/// name and a shared [`Executor`]; every call is a fresh remote command.
pub struct StorageManager {
    executor: Arc<dyn Executor>,
    host: String,
}

impl StorageManager {
    pub fn new(executor: Arc<dyn Executor>, host: impl Into<String>) -> Self {
        Self { executor, host: host.into() }
    }

    /// `lvs --noheadings -o name,vg_name,lv_size --unit m --nosuffix`.
    pub async fn list_logical_volumes(&self) -> Result<Vec<LogicalVolume>> {
        let out = self
            .executor
            .run(
                &self.host,
                "lvs --noheadings -o name,vg_name,lv_size --unit m --nosuffix",
                RunOpts::silent(),
            )
            .await?;
        out.stdout
            .lines()
            .map(|line| {
                let mut fields = line.split_whitespace();
                let lv_name = fields.next().ok_or_else(|| malformed("lvs", line))?.to_string();
                let vg_name = fields.next().ok_or_else(|| malformed("lvs", line))?.to_string();
                let size: f64 = fields
                    .next()
                    .ok_or_else(|| malformed("lvs", line))?
                    .parse()
                    .map_err(|_| malformed("lvs", line))?;
                Ok(LogicalVolume { vg_name, lv_name, size_mib: size.ceil() as u64 })
            })
            .collect()
    }

    /// `vgs --noheadings -o vg_name,vg_free --unit g --nosuffix`.
    pub async fn list_volume_groups(&self) -> Result<Vec<VolumeGroup>> {
        let out = self
            .executor
            .run(&self.host, "vgs --noheadings -o vg_name,vg_free --unit g --nosuffix", RunOpts::silent())
            .await?;
        out.stdout
            .lines()
            .map(|line| {
                let mut fields = line.split_whitespace();
                let name = fields.next().ok_or_else(|| malformed("vgs", line))?.to_string();
                let free: f64 = fields
                    .next()
                    .ok_or_else(|| malformed("vgs", line))?
                    .parse()
                    .map_err(|_| malformed("vgs", line))?;
                Ok(VolumeGroup { name, free_gib: free as u64 })
            })
            .collect()
    }

    /// Create a new logical volume named `vm_name` in whichever volume
    /// group has enough free space, keeping a 5 GiB cushion (ported from
    /// `igvm/utils/storage.py::create_storage`). Fails if an LV by that
    /// name already exists anywhere, or no VG has room.
    pub async fn create_storage(&self, vm_name: &str, size_gib: u64) -> Result<String> {
        for lv in self.list_logical_volumes().await? {
            if lv.lv_name == vm_name {
                return Err(IgvmError::Storage(format!(
                    "logical volume {}/{} already exists",
                    lv.vg_name, vm_name
                )));
            }
        }

        let vg = self
            .list_volume_groups()
            .await?
            .into_iter()
            .find(|vg| vg.free_gib > size_gib + 5)
            .ok_or_else(|| IgvmError::Storage("not enough free space in any volume group".into()))?;

        let path = format!("/dev/{}/{}", vg.name, vm_name);
        let out = self
            .executor
            .run(
                &self.host,
                &format!("lvcreate -L {size_gib}g -n {vm_name} {}", vg.name),
                RunOpts::warn_only(),
            )
            .await?;
        if !out.success {
            return Err(IgvmError::Storage(format!("unable to create logical volume {path}")));
        }
        Ok(path)
    }

    pub async fn remove_logical_volume(&self, path: &str) -> Result<()> {
        self.executor.run(&self.host, &format!("lvremove -f {path}"), RunOpts::default()).await?;
        Ok(())
    }

    /// `lvrename`, returning the renamed LV's new path. Used to mark a
    /// migrated-away guest's LV for delayed deletion instead of removing it
    /// outright (spec §4.J: a bad migration must be recoverable from the
    /// source's disk until the retention window passes).
    pub async fn rename_logical_volume(&self, path: &str, new_name: &str) -> Result<String> {
        let (vg_name, _) = path
            .rsplit_once('/')
            .and_then(|(rest, lv)| rest.rsplit_once('/').map(|(_, vg)| (vg, lv)))
            .ok_or_else(|| IgvmError::Storage(format!("malformed logical volume path {path:?}")))?;
        self.executor.run(&self.host, &format!("lvrename {path} {new_name}"), RunOpts::default()).await?;
        Ok(format!("/dev/{vg_name}/{new_name}"))
    }

    pub async fn resize_logical_volume(&self, path: &str, size_gib: u64) -> Result<()> {
        self.executor.run(&self.host, &format!("lvresize {path} -L {size_gib}g"), RunOpts::default()).await?;
        Ok(())
    }

    /// `mkfs.xfs -f` then mount at a fresh temp directory suffixed with the
    /// guest hostname (ported from `mount_storage`).
    pub async fn mount_storage(&self, device: &str, hostname: &str) -> Result<String> {
        self.executor.run(&self.host, &format!("mkfs.xfs -f {device}"), RunOpts::default()).await?;
        self.mount_temp(device, &format!("-{hostname}")).await
    }

    pub async fn mount_temp(&self, device: &str, suffix: &str) -> Result<String> {
        let out = self
            .executor
            .run(&self.host, &format!("mktemp -d --suffix {suffix}"), RunOpts::silent())
            .await?;
        let mount_dir = out.stdout.trim().to_string();
        self.executor.run(&self.host, &format!("mount {device} {mount_dir}"), RunOpts::default()).await?;
        Ok(mount_dir)
    }

    pub async fn umount_temp(&self, device_or_path: &str) -> Result<()> {
        self.executor.run(&self.host, &format!("umount {device_or_path}"), RunOpts::warn_only()).await?;
        Ok(())
    }

    pub async fn remove_temp(&self, mount_path: &str) -> Result<()> {
        self.executor.run(&self.host, &format!("rm -rf {mount_path}"), RunOpts::default()).await?;
        Ok(())
    }

    /// Guest-visible root disk device name for `hypervisor_kind` (`vda` for
    /// kvm, `xvda1` for the legacy Xen path).
    pub fn vm_block_dev(&self, hypervisor_kind: &str) -> &'static str {
        vm_block_device_name(hypervisor_kind)
    }

    /// Start a listening netcat on this host piping into `device`, picking
    /// the receive port from the device's minor number the way
    /// `igvm/utils/storage.py::netcat_to_device` does (`7000 + minor`), so
    /// concurrent transfers to distinct devices never collide on a port.
    pub async fn netcat_to_device(&self, device: &str) -> Result<u16> {
        let out = self
            .executor
            .run(&self.host, &format!("stat -L -c '%T' {device}"), RunOpts::silent())
            .await?;
        let minor = u64::from_str_radix(out.stdout.trim(), 16)
            .map_err(|_| IgvmError::Storage(format!("could not parse device minor for {device}")))?;
        let port = 7000 + minor as u16;

        self.executor
            .run(
                &self.host,
                &format!("pgrep -f '^/bin/nc.traditional -l -p {port}'"),
                RunOpts::warn_only(),
            )
            .await
            .map(|out| {
                if out.success {
                    Err(IgvmError::Storage("listening netcat already present on destination".into()))
                } else {
                    Ok(())
                }
            })??;

        self.executor
            .run(
                &self.host,
                &format!("nohup /bin/nc.traditional -l -p {port} | dd of={device} obs=1048576 &"),
                RunOpts::silent(),
            )
            .await?;
        debug!(%device, port, "netcat receiver started");
        Ok(port)
    }

    /// Stream `device` (`size_bytes` long) to `host:port`'s netcat receiver.
    pub async fn device_to_netcat(&self, device: &str, size_bytes: u64, dest_host: &str, port: u16) -> Result<()> {
        info!(%device, %dest_host, port, "shipping device over netcat");
        let out = self
            .executor
            .run(
                &self.host,
                &format!(
                    "dd if={device} ibs=1048576 | pv -f -s {size_bytes} | /bin/nc.traditional -q 1 {dest_host} {port}"
                ),
                RunOpts::warn_only(),
            )
            .await?;
        if !out.success {
            return Err(IgvmError::Storage("copying data over netcat failed".into()));
        }
        Ok(())
    }

    pub async fn kill_netcat(&self, port: u16) -> Result<()> {
        self.executor
            .run(&self.host, &format!("pkill -f '^/bin/nc.traditional -l -p {port}'"), RunOpts::warn_only())
            .await?;
        Ok(())
    }
}

fn malformed(cmd: &str, line: &str) -> IgvmError {
    IgvmError::Storage(format!("malformed `{cmd}` output line: {line:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::MockExecutor;

    #[tokio::test]
    async fn create_storage_picks_vg_with_enough_room() {
        let exec = Arc::new(MockExecutor::new());
        exec.stub("lvs --noheadings -o name,vg_name,lv_size --unit m --nosuffix", "");
        exec.stub(
            "vgs --noheadings -o vg_name,vg_free --unit g --nosuffix",
            "vg_small 3\nvg_big 200\n",
        );
        exec.stub("lvcreate -L 20g -n vm1.example.com vg_big", "");

        let mgr = StorageManager::new(exec, "hv1");
        let path = mgr.create_storage("vm1.example.com", 20).await.unwrap();
        assert_eq!(path, "/dev/vg_big/vm1.example.com");
    }

    #[tokio::test]
    async fn create_storage_rejects_duplicate_name() {
        let exec = Arc::new(MockExecutor::new());
        exec.stub(
            "lvs --noheadings -o name,vg_name,lv_size --unit m --nosuffix",
            "vm1.example.com vg0 20480",
        );
        let mgr = StorageManager::new(exec, "hv1");
        let err = mgr.create_storage("vm1.example.com", 20).await.unwrap_err();
        assert!(matches!(err, IgvmError::Storage(_)));
    }

    #[tokio::test]
    async fn create_storage_fails_with_no_room() {
        let exec = Arc::new(MockExecutor::new());
        exec.stub("lvs --noheadings -o name,vg_name,lv_size --unit m --nosuffix", "");
        exec.stub("vgs --noheadings -o vg_name,vg_free --unit g --nosuffix", "vg0 3\n");
        let mgr = StorageManager::new(exec, "hv1");
        assert!(mgr.create_storage("vm1.example.com", 20).await.is_err());
    }

    #[tokio::test]
    async fn rename_logical_volume_keeps_the_same_volume_group() {
        let exec = Arc::new(MockExecutor::new());
        exec.stub("lvrename /dev/vg0/42_vm1.example.com 42_vm1.example.com.migrated.1700000000", "");
        let mgr = StorageManager::new(exec, "hv1");
        let new_path = mgr
            .rename_logical_volume("/dev/vg0/42_vm1.example.com", "42_vm1.example.com.migrated.1700000000")
            .await
            .unwrap();
        assert_eq!(new_path, "/dev/vg0/42_vm1.example.com.migrated.1700000000");
    }

    #[tokio::test]
    async fn netcat_to_device_derives_port_from_minor() {
        let exec = Arc::new(MockExecutor::new());
        exec.stub("stat -L -c '%T' /dev/vg0/vm1", "b");
        let mgr = StorageManager::new(exec, "hv1");
        let port = mgr.netcat_to_device("/dev/vg0/vm1").await.unwrap();
        assert_eq!(port, 7000 + 0xb);
    }
}
