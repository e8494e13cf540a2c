//! Persistence/transaction-manager seam.
//!
//! The engine requires scoped transactions with commit/rollback semantics
//! and a detectable "no active transaction" condition; atomicity itself is
//! the backing engine's concern. The executor enforces at most one open
//! transaction per flow.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;

/// Produces database transactions for flow side effects.
#[async_trait]
pub trait PersistenceManager: Send + Sync + 'static {
    /// Open a new transaction.
    async fn new_transaction(&self) -> Result<Box<dyn DbTransaction>>;
}

/// One open database transaction.
#[async_trait]
pub trait DbTransaction: Send + Sync {
    async fn commit(self: Box<Self>) -> Result<()>;
    async fn rollback(self: Box<Self>) -> Result<()>;
}

/// Counting in-memory persistence. Writes are applied by the storage layer
/// directly; this tracks the open/commit/rollback protocol so tests can
/// assert the transaction contract.
#[derive(Debug, Default)]
pub struct InMemoryPersistence {
    open: Arc<AtomicUsize>,
    committed: Arc<AtomicU64>,
    rolled_back: Arc<AtomicU64>,
}

impl InMemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Transactions currently open across all flows.
    pub fn open_count(&self) -> usize {
        self.open.load(Ordering::SeqCst)
    }

    /// Total committed transactions.
    pub fn committed_count(&self) -> u64 {
        self.committed.load(Ordering::SeqCst)
    }

    /// Total rolled-back transactions.
    pub fn rolled_back_count(&self) -> u64 {
        self.rolled_back.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PersistenceManager for InMemoryPersistence {
    async fn new_transaction(&self) -> Result<Box<dyn DbTransaction>> {
        self.open.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(InMemoryTransaction {
            open: Arc::clone(&self.open),
            committed: Arc::clone(&self.committed),
            rolled_back: Arc::clone(&self.rolled_back),
            closed: false,
        }))
    }
}

struct InMemoryTransaction {
    open: Arc<AtomicUsize>,
    committed: Arc<AtomicU64>,
    rolled_back: Arc<AtomicU64>,
    closed: bool,
}

#[async_trait]
impl DbTransaction for InMemoryTransaction {
    async fn commit(mut self: Box<Self>) -> Result<()> {
        self.closed = true;
        self.open.fetch_sub(1, Ordering::SeqCst);
        self.committed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn rollback(mut self: Box<Self>) -> Result<()> {
        self.closed = true;
        self.open.fetch_sub(1, Ordering::SeqCst);
        self.rolled_back.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

impl Drop for InMemoryTransaction {
    fn drop(&mut self) {
        // Dropping without commit counts as a rollback, mirroring scoped
        // transaction guards in real engines.
        if !self.closed {
            self.open.fetch_sub(1, Ordering::SeqCst);
            self.rolled_back.fetch_add(1, Ordering::SeqCst);
        }
    }
}
