//! Error types for the orchestration engine.

use thiserror::Error;

/// Errors that can occur while provisioning, migrating or resizing a guest.
///
/// A predicate raises one of these before any mutation happens. Once a
/// mutating step has started, individual failures are instead recorded as
/// rollback compensations on the active [`crate::transaction::Transaction`];
/// the error ultimately surfaced to the caller still comes from this enum.
#[derive(Error, Debug)]
pub enum IgvmError {
    /// Bad or missing inventory attribute.
    #[error("configuration error: {0}")]
    Config(String),

    /// Inventory query found nothing, or more than one record, matching a
    /// filter expected to be unique, or a commit lost a write race.
    #[error("inventory error: {0}")]
    Inventory(String),

    /// Operation is incompatible with the VM's or hypervisor's current
    /// state (e.g. `build` on an already-defined VM, `delete` on an
    /// already-retired one).
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// A host-side (libvirt/virsh) operation failed.
    #[error("hypervisor error: {0}")]
    Hypervisor(String),

    /// VLAN/IP mismatch between VM and hypervisor.
    #[error("network error: {0}")]
    Network(String),

    /// LVM, filesystem or disk-transport failure.
    #[error("storage error: {0}")]
    Storage(String),

    /// A remote shell command exited non-zero and was not run `warn_only`.
    #[error("remote command failed: {0}")]
    RemoteCommand(String),

    /// A value read back from the live hypervisor/domain disagrees with
    /// the value on record in the inventory.
    #[error("inconsistent attribute: {0}")]
    InconsistentAttribute(String),

    /// An operation did not complete within its allotted budget.
    #[error("timed out: {0}")]
    Timeout(String),

    /// Live migration was aborted by user interrupt.
    #[error("migration aborted: {0}")]
    MigrationAborted(String),

    /// Live migration failed for a reason other than user abort.
    #[error("migration failed: {0}")]
    MigrationError(String),

    /// Anything else - should be rare and always indicates a bug rather
    /// than an expected, recoverable failure.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Result type alias used throughout the orchestration engine.
pub type Result<T> = std::result::Result<T, IgvmError>;
