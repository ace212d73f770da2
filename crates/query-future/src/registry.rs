use crate::handle::Pending;
use crate::{Batch, Config, ConnectionKey, Provider};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

/// Registry tracks the open Batch of each connection.
///
/// A Batch is open from its creation until it's claimed for execution,
/// at which point it's removed and the next deferred query of its
/// connection begins a new Batch. Registry is cheaply cloned, and all
/// clones share the same open batches.
///
/// Open batches are held weakly. A Batch lives only as long as the handles
/// registered in it, so a connection whose deferred queries are dropped
/// without being materialized releases its Batch and Provider.
pub struct Registry<P: Provider> {
    inner: Arc<Inner<P>>,
}

pub(crate) struct Inner<P: Provider> {
    // Acquired before a Batch's own lock, never after.
    open: Mutex<HashMap<ConnectionKey, Weak<Batch<P>>>>,
    next_id: AtomicU64,
    config: Arc<Config>,
}

impl<P: Provider> Clone for Registry<P> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<P: Provider> Default for Registry<P> {
    fn default() -> Self {
        Self::new(Config::default())
    }
}

impl<P: Provider> Registry<P> {
    pub fn new(config: Config) -> Self {
        Self {
            inner: Arc::new(Inner {
                open: Default::default(),
                next_id: AtomicU64::new(1),
                config: Arc::new(config),
            }),
        }
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Return the open Batch of `key`, if there is one.
    pub fn get(&self, key: ConnectionKey) -> Option<Arc<Batch<P>>> {
        lock(&self.inner.open).get(&key).and_then(Weak::upgrade)
    }

    /// Return the open Batch of `key`, creating one if there isn't one.
    pub fn get_or_create(&self, key: ConnectionKey, provider: &Arc<P>) -> Arc<Batch<P>> {
        let mut open = lock(&self.inner.open);
        self.inner.get_or_create(&mut open, key, provider)
    }

    /// Remove `batch` as the open Batch of `key`, but only if it still is.
    /// Returns true if it was removed.
    pub fn remove(&self, key: ConnectionKey, batch: &Arc<Batch<P>>) -> bool {
        let mut open = lock(&self.inner.open);
        remove_if_current(&mut open, key, batch)
    }

    /// Number of currently open batches, across all connections.
    pub fn open_batches(&self) -> usize {
        lock(&self.inner.open)
            .values()
            .filter(|batch| batch.strong_count() != 0)
            .count()
    }

    /// Register `pending` with the open Batch of `key`, returning that Batch.
    /// Lookup and registration happen under one lock, so a registration
    /// can never land in a Batch which has already been claimed.
    pub(crate) fn enlist(
        &self,
        key: ConnectionKey,
        provider: &Arc<P>,
        pending: Arc<dyn Pending<P>>,
    ) -> Arc<Batch<P>> {
        let mut open = lock(&self.inner.open);
        let batch = self.inner.get_or_create(&mut open, key, provider);
        batch.register(pending);
        batch
    }
}

impl<P: Provider> Inner<P> {
    fn get_or_create(
        self: &Arc<Self>,
        open: &mut HashMap<ConnectionKey, Weak<Batch<P>>>,
        key: ConnectionKey,
        provider: &Arc<P>,
    ) -> Arc<Batch<P>> {
        if let Some(batch) = open.get(&key).and_then(Weak::upgrade) {
            return batch;
        }
        // Prune batches whose handles have all been dropped.
        open.retain(|_, batch| batch.strong_count() != 0);

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(batch = id, %key, "opened deferred query batch");

        let batch = Arc::new(Batch::new(
            id,
            key,
            provider.clone(),
            self.config.clone(),
            Arc::downgrade(self),
        ));
        open.insert(key, Arc::downgrade(&batch));

        batch
    }

    /// Claim `batch` for execution: take its pending handles and close it.
    /// Returns None if it was already claimed.
    pub(crate) fn claim(&self, batch: &Arc<Batch<P>>) -> Option<Vec<Arc<dyn Pending<P>>>> {
        let mut open = lock(&self.open);
        let pending = batch.take_pending()?;

        remove_if_current(&mut open, batch.key(), batch);
        Some(pending)
    }
}

/// Claim `batch` through its Registry, if the Registry still exists.
pub(crate) fn claim<P: Provider>(
    registry: &Weak<Inner<P>>,
    batch: &Arc<Batch<P>>,
) -> Option<Vec<Arc<dyn Pending<P>>>> {
    match registry.upgrade() {
        Some(inner) => inner.claim(batch),
        // Without a Registry there's nothing to close, and nothing can register.
        None => batch.take_pending(),
    }
}

fn remove_if_current<P: Provider>(
    open: &mut HashMap<ConnectionKey, Weak<Batch<P>>>,
    key: ConnectionKey,
    batch: &Arc<Batch<P>>,
) -> bool {
    match open.get(&key) {
        Some(current) if std::ptr::eq(current.as_ptr(), Arc::as_ptr(batch)) => {
            open.remove(&key);
            tracing::trace!(batch = batch.id(), %key, "closed deferred query batch");
            true
        }
        _ => false,
    }
}

// A panic while holding the lock can't leave the map inconsistent:
// each critical section is a single insert or remove.
fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}
