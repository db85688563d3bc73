//! Command-line surface for the `igvm` binary : one whole-lifecycle
//! operation per invocation, every subcommand taking a `vm_hostname` plus
//! whatever sizing/transport flags it needs.

use std::net::IpAddr;
use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

use igvm_core::types::OfflineTransport;

/// Provision, migrate, resize, and decommission libvirt/KVM guests.
#[derive(Parser, Debug)]
#[command(name = "igvm")]
#[command(version)]
pub struct Args {
    /// Path to the fleet configuration file.
    #[arg(short, long, env = "IGVM_CONFIG", default_value = "/etc/igvm/igvm.yaml")]
    pub config: PathBuf,

    /// Suppress informational output (only warnings/errors).
    #[arg(short = 's', long, global = true)]
    pub silent: bool,

    /// Verbose output (debug-level logging).
    #[arg(short = 'v', long, global = true)]
    pub verbose: bool,

    /// Emit logs as single-line JSON instead of the human format.
    #[arg(long, value_enum, default_value_t = LogFormat::Human, global = true)]
    pub log_format: LogFormat,

    /// Force build/migrate/disk-set/mem-set/vcpu-set onto a hypervisor
    /// whose state is `online_reserved` (common flag; normally such hosts
    /// are skipped during placement and refused as an explicit target).
    #[arg(long, global = true)]
    pub ignore_reserved: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Human,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Provision a brand-new guest from a base image.
    Build {
        vm_hostname: String,
        /// Use a local image tarball instead of fetching one over HTTPS.
        #[arg(long)]
        localimage: Option<String>,
        /// Script to copy into the guest and run once, after first boot.
        #[arg(long)]
        postboot: Option<String>,
        /// Skip the Puppet bootstrap run.
        #[arg(long)]
        nopuppet: bool,
    },

    /// Move a guest to another hypervisor, live or offline.
    Migrate {
        vm_hostname: String,
        /// Destination hypervisor; omit to let the selector choose one.
        hypervisor_hostname: Option<String>,
        /// Change the guest's IP as part of the move (requires --offline).
        #[arg(long)]
        newip: Option<IpAddr>,
        /// Re-run Puppet on the destination after the move.
        #[arg(long)]
        runpuppet: bool,
        /// Mark the guest `maintenance` for the duration of the move.
        #[arg(long)]
        maintenance: bool,
        /// Power the guest off for the move instead of live-migrating it.
        #[arg(long)]
        offline: bool,
        /// Disk transport to use for an offline move.
        #[arg(long, value_enum, default_value_t = CliOfflineTransport::Netcat)]
        offline_transport: CliOfflineTransport,
    },

    /// Resize a guest's root disk. Shrinking is rejected.
    #[command(name = "disk-set")]
    DiskSet {
        vm_hostname: String,
        /// Absolute size (e.g. `40G`) or `+`/`-` relative to current.
        size: String,
    },

    /// Resize a guest's memory (MiB; must be a multiple of
    /// `128 * num_numa_nodes`).
    #[command(name = "mem-set")]
    MemSet {
        vm_hostname: String,
        /// Absolute size in MiB, or `+`/`-` relative to current.
        size: String,
        /// Redefine the domain statically instead of hotplugging live
        /// (the only way to shrink).
        #[arg(long)]
        offline: bool,
    },

    /// Resize a guest's vCPU count.
    #[command(name = "vcpu-set")]
    VcpuSet {
        vm_hostname: String,
        count: u32,
        /// Redefine the domain statically instead of resizing live.
        #[arg(long)]
        offline: bool,
    },

    /// Start a stopped guest.
    Start { vm_hostname: String },

    /// Stop a running guest.
    Stop {
        vm_hostname: String,
        /// Hard power-off instead of a graceful ACPI shutdown.
        #[arg(long)]
        force: bool,
    },

    /// Stop then start a guest.
    Restart {
        vm_hostname: String,
        /// Hard power-off instead of a graceful ACPI shutdown.
        #[arg(long)]
        force: bool,
        /// Skip re-synthesizing the domain XML before starting back up.
        #[arg(long)]
        no_redefine: bool,
    },

    /// Undefine a guest and remove its storage.
    Delete {
        vm_hostname: String,
        /// Allow deleting a still-running guest (stops it first).
        #[arg(long)]
        force: bool,
        /// Mark the inventory object `retired` instead of deleting it
        /// outright, handing it to the housekeeping reaper.
        #[arg(long)]
        retire: bool,
    },

    /// Print a guest's current status.
    Info { vm_hostname: String },

    /// Reconcile inventory's memory/vCPU/disk-size/running fields against
    /// what the live domain actually reports.
    Sync { vm_hostname: String },

    /// Wipe and reinstall a guest from scratch on its current hypervisor.
    Rebuild {
        vm_hostname: String,
        /// Required if the guest is currently running.
        #[arg(long)]
        force: bool,
        #[arg(long)]
        localimage: Option<String>,
        #[arg(long)]
        postboot: Option<String>,
        #[arg(long)]
        nopuppet: bool,
    },

    /// Rename a guest, updating both inventory and its libvirt definition.
    Rename {
        vm_hostname: String,
        new_hostname: String,
        /// Shut the guest down for the rename instead of leaving it
        /// running under its old definition until the next restart.
        #[arg(long)]
        offline: bool,
    },

    /// Run one pass of the retired-VM reaper across every online
    /// hypervisor ("housekeeping daemon semantics").
    Housekeep,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum CliOfflineTransport {
    Netcat,
    Drbd,
}

impl From<CliOfflineTransport> for OfflineTransport {
    fn from(value: CliOfflineTransport) -> Self {
        match value {
            CliOfflineTransport::Netcat => OfflineTransport::Netcat,
            CliOfflineTransport::Drbd => OfflineTransport::Drbd,
        }
    }
}
