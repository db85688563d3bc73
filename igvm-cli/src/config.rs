//! Configuration for the `igvm` binary.
//!
//! Loads a YAML file, falling back to built-in defaults when the default
//! path is absent. Holds the fleet-wide constants (puppet CA masters,
//! default DNS servers, the image base URL) plus the inventory endpoint
//! and SSH user, with CLI-arg overrides layered on top via
//! [`Config::with_cli_overrides`].

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

use igvm_core::settings::{FleetSettings, Mode, PuppetCaKind};

use crate::cli::Args;

/// Top-level `igvm` configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// The external inventory service ("serveradmin" in the reference
    /// fleet) this binary reads and writes VM/hypervisor objects against.
    pub inventory: InventoryConfig,
    /// User, mode and fleet-wide defaults fed straight into
    /// [`FleetSettings`].
    pub fleet: FleetConfig,
    /// Base URL image fetch resolves `<os>.tar.gz`/`<os>.tar.gz.md5` against.
    pub image_base_url: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            inventory: InventoryConfig::default(),
            fleet: FleetConfig::default(),
            image_base_url: "https://images.example.com/igvm".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from a YAML file, falling back to defaults if
    /// `path` doesn't exist at all (but still erroring on a present-but-
    /// unparseable file).
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;

        let config: Config = serde_yaml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Apply global CLI flags that double as config overrides.
    pub fn with_cli_overrides(mut self, args: &Args) -> Self {
        if args.ignore_reserved {
            self.fleet.ignore_reserved_by_default = true;
        }
        self
    }

    /// Build the [`FleetSettings`] this binary's pipelines run against.
    pub fn fleet_settings(&self) -> FleetSettings {
        FleetSettings {
            ssh_user: self.fleet.ssh_user_resolved(),
            mode: self.fleet.mode(),
            puppet_ca_masters: self.fleet.puppet_ca_masters.clone(),
            puppet_ca_kind: self.fleet.puppet_ca_kind.clone(),
            default_dns_servers: self.fleet.default_dns_servers.clone(),
            migration_uri_template: self.fleet.migration_uri_template.clone(),
        }
    }
}

/// Inventory service connection settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct InventoryConfig {
    /// HTTP endpoint of the inventory service.
    pub endpoint: String,
    /// Bearer token used to authenticate against it.
    pub token: Option<String>,
    /// Talk to an in-memory inventory instead of `endpoint` — set by
    /// `igvm --dev`-style deployments and every integration test; the
    /// reference fleet's HTTP inventory client itself is out of scope
    /// here (see DESIGN.md), so this is presently the only backend the
    /// binary actually wires up regardless of `endpoint`.
    pub mock: bool,
}

impl Default for InventoryConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://inventory.example.com/api/".to_string(),
            token: None,
            mock: true,
        }
    }
}

/// Fleet-wide defaults, mirroring `igvm/settings.py`'s module constants.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FleetConfig {
    /// `IGVM_SSH_USER` equivalent; config-file value wins over the
    /// environment variable when both are set.
    pub ssh_user: Option<String>,
    /// `IGVM_MODE` equivalent (`"production"` or `"testing"`); config-file
    /// value wins over the environment variable when both are set.
    pub mode: Option<String>,
    /// Puppet CA hosts eligible to sign/clean a new guest's certificate.
    pub puppet_ca_masters: Vec<String>,
    /// `puppet_ca` attribute -> resolution strategy, for CA attributes
    /// that name a domain or load balancer instead of a host directly.
    pub puppet_ca_kind: HashMap<String, PuppetCaKind>,
    /// Default resolvers written into a freshly built guest's
    /// `/etc/resolv.conf` fallback.
    pub default_dns_servers: Vec<String>,
    /// Libvirt migration target URI template, `{host}` substituted.
    pub migration_uri_template: String,
    /// Proceed past tight reserved-headroom checks fleet-wide, not just
    /// for one invocation (overridden per-run by `--ignore-reserved`).
    pub ignore_reserved_by_default: bool,
}

impl Default for FleetConfig {
    fn default() -> Self {
        let defaults = FleetSettings::default();
        Self {
            ssh_user: None,
            mode: None,
            puppet_ca_masters: defaults.puppet_ca_masters,
            puppet_ca_kind: defaults.puppet_ca_kind,
            default_dns_servers: defaults.default_dns_servers,
            migration_uri_template: defaults.migration_uri_template,
            ignore_reserved_by_default: false,
        }
    }
}

impl FleetConfig {
    fn mode(&self) -> Mode {
        match self.mode.as_deref() {
            Some("testing") => Mode::Testing,
            Some("production") => Mode::Production,
            _ => Mode::from_env(),
        }
    }

    fn ssh_user_resolved(&self) -> String {
        self.ssh_user
            .clone()
            .unwrap_or_else(|| FleetSettings::default().ssh_user)
    }
}
