//! Component L: the transaction/rollback framework.
//!
//! A [`Transaction`] is a LIFO stack of compensating actions. Every mutating
//! pipeline step that succeeds registers the action that would undo it;
//! `checkpoint()` discards everything registered so far once a point of no
//! return has been reached (e.g. right after the inventory commit that
//! linearizes a migration). On failure the pipeline calls `rollback()`,
//! which runs the stack in reverse order and tolerates (logs, does not
//! propagate) any individual compensator failing, so one bad rollback step
//! never blocks the ones behind it.

use std::future::Future;
use std::pin::Pin;

use tracing::{debug, info, warn};

use crate::error::Result;

type RollbackFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;

/// LIFO stack of named compensating actions (spec §3 "Transaction", §4.L).
#[derive(Default)]
pub struct Transaction {
    actions: Vec<(String, RollbackFuture)>,
}

impl Transaction {
    pub fn new() -> Self {
        Self { actions: Vec::new() }
    }

    /// Register a compensating action. `action` is an already-bound future
    /// (typically an `async move { ... }` block closing over everything it
    /// needs) so the caller pays no cost unless rollback actually runs it.
    pub fn on_rollback<F>(&mut self, name: impl Into<String>, action: F)
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        self.actions.push((name.into(), Box::pin(action)));
    }

    /// Mark a safe state: everything registered so far becomes permanent
    /// and will not be undone even if a later step in the same transaction
    /// fails (spec §3 "Transaction checkpoint").
    pub fn checkpoint(&mut self) {
        if !self.actions.is_empty() {
            debug!(discarded = self.actions.len(), "transaction checkpoint reached");
        }
        self.actions.clear();
    }

    /// Run every registered action in reverse registration order. A failing
    /// compensator is logged and swallowed, never re-raised, so the rest of
    /// the stack still gets a chance to run (spec §4.L, §7).
    pub async fn rollback(&mut self) {
        if self.actions.is_empty() {
            return;
        }
        info!(steps = self.actions.len(), "rolling back transaction");
        for (name, action) in self.actions.drain(..).rev() {
            debug!(action = %name, "running rollback action");
            if let Err(e) = action.await {
                warn!(action = %name, error = %e, "rollback action failed, continuing");
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }
}

/// Runs `f` inside `tx`, creating and owning a fresh [`Transaction`] when
/// the caller didn't pass one in. Mirrors the reference `run_in_transaction`
/// decorator (spec §4.L): on `Ok`, an owned transaction is checkpointed; on
/// `Err`, it is rolled back. A transaction passed in by the caller is left
/// untouched either way — the caller owns its lifecycle.
pub async fn run_in_transaction<'a, F, Fut, T>(tx: Option<&'a mut Transaction>, f: F) -> Result<T>
where
    F: FnOnce(&mut Transaction) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    match tx {
        Some(tx) => f(tx).await,
        None => {
            let mut owned = Transaction::new();
            match f(&mut owned).await {
                Ok(v) => {
                    owned.checkpoint();
                    Ok(v)
                }
                Err(e) => {
                    owned.rollback().await;
                    Err(e)
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::IgvmError;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn rollback_runs_actions_in_lifo_order() {
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut tx = Transaction::new();
        for i in 0..3 {
            let order = order.clone();
            tx.on_rollback(format!("step-{i}"), async move {
                order.lock().unwrap().push(i);
                Ok(())
            });
        }
        tx.rollback().await;
        assert_eq!(*order.lock().unwrap(), vec![2, 1, 0]);
        assert!(tx.is_empty());
    }

    #[tokio::test]
    async fn checkpoint_drops_prior_actions() {
        let ran = Arc::new(AtomicUsize::new(0));
        let mut tx = Transaction::new();
        let ran2 = ran.clone();
        tx.on_rollback("a", async move {
            ran2.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        tx.checkpoint();
        tx.rollback().await;
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn a_failing_compensator_does_not_block_later_ones() {
        let ran = Arc::new(AtomicUsize::new(0));
        let mut tx = Transaction::new();
        tx.on_rollback("bad", async { Err(IgvmError::Internal("boom".into())) });
        let ran2 = ran.clone();
        tx.on_rollback("good", async move {
            ran2.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        tx.rollback().await;
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn run_in_transaction_checkpoints_on_success() {
        let result: Result<i32> = run_in_transaction(None, |tx| async move {
            tx.on_rollback("noop", async { Ok(()) });
            Ok(42)
        })
        .await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn run_in_transaction_rolls_back_on_error() {
        let ran = Arc::new(AtomicUsize::new(0));
        let ran2 = ran.clone();
        let result: Result<()> = run_in_transaction(None, |tx| async move {
            tx.on_rollback("undo", async move {
                ran2.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
            Err(IgvmError::Hypervisor("fail".into()))
        })
        .await;
        assert!(result.is_err());
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }
}
