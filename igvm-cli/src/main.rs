//! # igvm
//!
//! Command-line orchestration engine for provisioning, migrating, resizing
//! and decommissioning libvirt/KVM guests against an external inventory
//! service. One subcommand per invocation; see `igvm --help`.
//!
//! ```bash
//! igvm build new-vm.example.com
//! igvm migrate some-vm.example.com --offline
//! ```

use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing::{error, info};

mod cli;
mod config;

use cli::{Args, Command, LogFormat};
use config::Config;

use igvm_core::build::BuildEnv;
use igvm_core::executor::{Executor, MockExecutor, SshExecutor};
use igvm_core::housekeeping::{housekeep, HousekeepEnv};
use igvm_core::inventory::{Inventory, MockInventory};
#[cfg(feature = "libvirt")]
use igvm_core::libvirt::RealLibvirtGateway;
use igvm_core::libvirt::{LibvirtGateway, MockLibvirtGateway};
use igvm_core::migrate::MigrateEnv;
use igvm_core::ops::OpsEnv;
use igvm_core::types::{BuildOptions, MigrateOptions};
use igvm_core::{build, migrate, ops};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let level = if args.verbose {
        "debug"
    } else if args.silent {
        "warn"
    } else {
        "info"
    };
    match args.log_format {
        LogFormat::Human => igvm_common::init_logging(level)?,
        LogFormat::Json => igvm_common::init_logging_json(level)?,
    }

    let config = Config::load(&args.config)?.with_cli_overrides(&args);
    let settings = config.fleet_settings();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        mode = ?settings.mode,
        "igvm starting"
    );

    let inventory: Arc<dyn Inventory> = Arc::new(MockInventory::new());

    let libvirt: Arc<dyn LibvirtGateway> = if config.inventory.mock {
        Arc::new(MockLibvirtGateway::new())
    } else {
        #[cfg(feature = "libvirt")]
        {
            Arc::new(RealLibvirtGateway::new(settings.migration_uri_template.clone()))
        }
        #[cfg(not(feature = "libvirt"))]
        {
            Arc::new(MockLibvirtGateway::new())
        }
    };

    let executor: Arc<dyn Executor> = if config.inventory.mock {
        Arc::new(MockExecutor::new())
    } else {
        Arc::new(SshExecutor::new(Some(settings.ssh_user.clone())))
    };

    let ignore_reserved = args.ignore_reserved || config.fleet.ignore_reserved_by_default;
    let result = run_command(
        args.command,
        inventory,
        libvirt,
        executor,
        settings,
        config.image_base_url.clone(),
        ignore_reserved,
    )
    .await;

    if let Err(e) = result {
        error!(error = %e, "igvm failed");
        std::process::exit(1);
    }

    Ok(())
}

async fn run_command(
    command: Command,
    inventory: Arc<dyn Inventory>,
    libvirt: Arc<dyn LibvirtGateway>,
    executor: Arc<dyn Executor>,
    settings: igvm_core::settings::FleetSettings,
    image_base_url: String,
    ignore_reserved: bool,
) -> igvm_core::Result<()> {
    match command {
        Command::Build {
            vm_hostname,
            localimage,
            postboot,
            nopuppet,
        } => {
            let env = BuildEnv {
                inventory,
                libvirt,
                executor,
                settings,
                image_base_url,
            };
            let opts = BuildOptions {
                local_image: localimage,
                postboot_script: postboot,
                no_puppet: nopuppet,
                ignore_reserved,
            };
            build::buildvm(&env, &vm_hostname, &opts).await
        }

        Command::Migrate {
            vm_hostname,
            hypervisor_hostname,
            newip,
            runpuppet,
            maintenance,
            offline,
            offline_transport,
        } => {
            let env = MigrateEnv {
                inventory,
                libvirt,
                executor,
                settings,
            };
            let opts = MigrateOptions {
                target_hypervisor: hypervisor_hostname,
                new_ip: newip,
                run_puppet: runpuppet,
                maintenance,
                offline,
                offline_transport: offline_transport.into(),
                ignore_reserved,
            };
            migrate::migratevm(&env, &vm_hostname, &opts).await
        }

        Command::DiskSet { vm_hostname, size } => {
            let env = OpsEnv { inventory, libvirt, executor, settings };
            ops::disk_set(&env, &vm_hostname, &size, ignore_reserved).await
        }

        Command::MemSet { vm_hostname, size, offline } => {
            let env = OpsEnv { inventory, libvirt, executor, settings };
            ops::mem_set(&env, &vm_hostname, &size, offline, ignore_reserved).await
        }

        Command::VcpuSet { vm_hostname, count, offline } => {
            let env = OpsEnv { inventory, libvirt, executor, settings };
            ops::vcpu_set(&env, &vm_hostname, count, offline, ignore_reserved).await
        }

        Command::Start { vm_hostname } => {
            let env = OpsEnv { inventory, libvirt, executor, settings };
            ops::start(&env, &vm_hostname).await
        }

        Command::Stop { vm_hostname, force } => {
            let env = OpsEnv { inventory, libvirt, executor, settings };
            ops::stop(&env, &vm_hostname, force).await
        }

        Command::Restart { vm_hostname, force, no_redefine } => {
            let env = OpsEnv { inventory, libvirt, executor, settings };
            ops::restart(&env, &vm_hostname, force, no_redefine).await
        }

        Command::Delete { vm_hostname, force, retire } => {
            let env = OpsEnv { inventory, libvirt, executor, settings };
            ops::delete(&env, &vm_hostname, force, retire).await
        }

        Command::Info { vm_hostname } => {
            let env = OpsEnv { inventory, libvirt, executor, settings };
            let info = ops::info(&env, &vm_hostname).await?;
            println!("{info:#?}");
            Ok(())
        }

        Command::Sync { vm_hostname } => {
            let env = OpsEnv { inventory, libvirt, executor, settings };
            ops::sync(&env, &vm_hostname).await
        }

        Command::Rebuild {
            vm_hostname,
            force,
            localimage,
            postboot,
            nopuppet,
        } => {
            let build_env = BuildEnv {
                inventory: inventory.clone(),
                libvirt: libvirt.clone(),
                executor: executor.clone(),
                settings: settings.clone(),
                image_base_url,
            };
            let ops_env = OpsEnv { inventory, libvirt, executor, settings };
            let opts = BuildOptions {
                local_image: localimage,
                postboot_script: postboot,
                no_puppet: nopuppet,
                ignore_reserved,
            };
            ops::rebuild(&ops_env, &build_env, &vm_hostname, force, &opts).await
        }

        Command::Rename { vm_hostname, new_hostname, offline } => {
            let env = OpsEnv { inventory, libvirt, executor, settings };
            ops::rename(&env, &vm_hostname, &new_hostname, offline).await
        }

        Command::Housekeep => {
            let env = HousekeepEnv { inventory, libvirt, executor };
            let report = housekeep(&env, chrono::Utc::now().timestamp()).await?;
            println!("{report:#?}");
            Ok(())
        }
    }
}
