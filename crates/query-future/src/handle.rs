use crate::{Batch, CancellationToken, Error, Provider, Segment};
use std::sync::{Arc, OnceLock};

/// Commit stores a staged value into its Slot. Commits are infallible,
/// which lets a batch stage every result before assigning any of them.
pub(crate) type Commit = Box<dyn FnOnce() + Send>;

/// Pending is the type-erased view of a Slot held by its Batch.
pub(crate) trait Pending<P: Provider>: Send + Sync {
    fn query(&self) -> &P::Query;
    fn has_value(&self) -> bool;
    /// Drain and decode `rows` into an owned value, returning a Commit
    /// which assigns it.
    fn stage(self: Arc<Self>, rows: Segment) -> Result<Commit, Error>;
}

/// Slot is the single-assignment result cell of a deferred query.
pub(crate) struct Slot<P: Provider, V> {
    query: P::Query,
    value: OnceLock<V>,
    decode: fn(Segment) -> Result<V, Error>,
}

impl<P: Provider, V> Slot<P, V> {
    pub fn new(query: P::Query, decode: fn(Segment) -> Result<V, Error>) -> Self {
        Self {
            query,
            value: OnceLock::new(),
            decode,
        }
    }
}

impl<P, V> Pending<P> for Slot<P, V>
where
    P: Provider,
    V: Send + Sync + 'static,
{
    fn query(&self) -> &P::Query {
        &self.query
    }

    fn has_value(&self) -> bool {
        self.value.get().is_some()
    }

    fn stage(self: Arc<Self>, rows: Segment) -> Result<Commit, Error> {
        let value = (self.decode)(rows)?;

        Ok(Box::new(move || {
            // A value may already be present if a bypass raced the batch.
            // Both came from the same query, and the first one wins.
            let _ = self.value.set(value);
        }))
    }
}

/// Deferred is a handle to the eventual result `V` of a deferred query.
/// It's the shared core of CollectionFuture and ScalarFuture.
pub struct Deferred<P: Provider, V> {
    slot: Arc<Slot<P, V>>,
    batch: Arc<Batch<P>>,
}

impl<P, V> Deferred<P, V>
where
    P: Provider,
    V: Send + Sync + 'static,
{
    pub(crate) fn new(slot: Arc<Slot<P, V>>, batch: Arc<Batch<P>>) -> Self {
        Self { slot, batch }
    }

    /// Returns true once a result has been assigned.
    pub fn has_value(&self) -> bool {
        self.slot.value.get().is_some()
    }

    /// Batch in which this query was registered.
    pub fn batch(&self) -> &Arc<Batch<P>> {
        &self.batch
    }

    /// Query which this handle defers.
    pub fn query(&self) -> &P::Query {
        &self.slot.query
    }

    /// Resolve the value of this handle, executing its batch if required.
    ///
    /// Returns None only if the batch executed successfully but this
    /// handle's query was not runnable.
    pub fn materialize(&self) -> Result<Option<&V>, Error> {
        if let Some(value) = self.slot.value.get() {
            return Ok(Some(value));
        }
        self.batch.execute()?;

        Ok(self.slot.value.get())
    }

    /// Resolve the value of this handle, executing its batch asynchronously
    /// if required. Fails with Error::Cancelled, leaving the batch untouched,
    /// if `cancel` is already cancelled.
    pub async fn materialize_async(&self, cancel: &CancellationToken) -> Result<Option<&V>, Error> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        if let Some(value) = self.slot.value.get() {
            return Ok(Some(value));
        }
        self.batch.execute_async(cancel).await?;

        Ok(self.slot.value.get())
    }

    /// Execute this handle's query immediately and on its own, ignoring its
    /// batch. The batch will skip this handle when it later executes.
    /// A handle which already holds a value returns it without executing.
    pub fn get_result_directly(&self) -> Result<&V, Error> {
        if let Some(value) = self.slot.value.get() {
            return Ok(value);
        }
        let provider = self.batch.provider();

        let rows = provider
            .execute(&self.slot.query)
            .map_err(|err| self.batch.execution_error(err))?;

        self.assign(rows)
    }

    /// Asynchronous variant of `get_result_directly`.
    pub async fn get_result_directly_async(&self, cancel: &CancellationToken) -> Result<&V, Error> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        if let Some(value) = self.slot.value.get() {
            return Ok(value);
        }
        let provider = self.batch.provider();

        let rows = provider
            .execute_async(&self.slot.query)
            .await
            .map_err(|err| self.batch.execution_error(err))?;

        self.assign(rows)
    }

    fn assign(&self, rows: Segment) -> Result<&V, Error> {
        let value = (self.slot.decode)(rows)?;

        // If the batch raced us here, its value wins and ours is dropped.
        Ok(self.slot.value.get_or_init(|| value))
    }
}
