//! # igvm-core
//!
//! Orchestration engine for provisioning, migrating, resizing and
//! decommissioning libvirt/KVM virtual machines against an external
//! inventory service.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                  build / migrate pipelines                │
//! └───────────┬───────────────────────────────┬───────────────┘
//!             │                               │
//!     ┌───────▼────────┐            ┌─────────▼─────────┐
//!     │   Hypervisor    │            │         Vm         │
//!     │ (inventory +    │            │ (inventory +        │
//!     │  libvirt conn)  │            │  hypervisor ref)    │
//!     └───────┬─────────┘            └─────────┬──────────┘
//!             │                                 │
//!   ┌─────────┼───────────────┬─────────────────┼──────────┐
//!   ▼         ▼               ▼                 ▼          ▼
//! inventory  libvirt       storage            executor    drbd
//! (gateway)  (connections) (LVM/xfs)          (ssh exec)  (replication)
//! ```
//!
//! `selector` ranks candidate hypervisors for `build`/`migrate`;
//! `transaction` gives every pipeline LIFO rollback of partial work.

pub mod build;
pub mod drbd;
pub mod error;
pub mod executor;
pub mod housekeeping;
pub mod hypervisor;
pub mod inventory;
pub mod libvirt;
pub mod migrate;
pub mod ops;
pub mod selector;
pub mod settings;
pub mod storage;
pub mod transaction;
pub mod types;
pub mod util;
pub mod vm;
pub mod xml;

pub use error::{IgvmError, Result};
pub use hypervisor::Hypervisor;
pub use inventory::{Inventory, InventoryFilter, MockInventory};
pub use transaction::Transaction;
pub use types::*;
pub use vm::Vm;

#[cfg(feature = "libvirt")]
pub use libvirt::RealLibvirtGateway;
