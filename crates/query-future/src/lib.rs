//! Deferred query batching.
//!
//! Queries wrapped as futures through a [`Session`] are not executed when
//! they're built. They accumulate in the open [`Batch`] of their connection,
//! and the first time any one of them is materialized the whole batch runs
//! as a single round trip. Each result set is then handed back to the
//! future which registered the matching query.
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

mod batch;
mod collection;
mod config;
mod handle;
pub mod memory;
pub mod postgres;
mod provider;
mod registry;
mod scalar;

pub use batch::{Batch, Progress};
pub use collection::CollectionFuture;
pub use config::Config;
pub use handle::Deferred;
pub use provider::{BoxError, Capabilities, Provider};
pub use registry::Registry;
pub use scalar::ScalarFuture;

/// Re-export of the token used to cancel asynchronous materialization.
pub use tokio_util::sync::CancellationToken;

/// Row is a single result row, as produced by a Provider.
pub type Row = serde_json::Value;

/// Segment is the ordered rows of one result set of a batch.
pub type Segment = Vec<Row>;

#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    #[error("connection cannot be used for deferred queries: {0}")]
    Unusable(String),
    #[error("deferred query batch {batch} failed to execute")]
    Execution {
        batch: u64,
        #[source]
        source: Arc<dyn std::error::Error + Send + Sync>,
    },
    #[error("deferred query batch {batch} expected {expected} result sets, but the provider returned {actual}")]
    SegmentMismatch {
        batch: u64,
        expected: usize,
        actual: usize,
    },
    #[error("failed to decode a row of a deferred query")]
    Decode(#[source] Arc<serde_json::Error>),
    #[error("deferred query was cancelled")]
    Cancelled,
    #[error("deferred query batch {0} was abandoned before its execution completed")]
    Abandoned(u64),
    #[error("deferred query batch {0} is executing, and waiting on it would block this current-thread runtime")]
    WouldBlock(u64),
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Decode(Arc::new(err))
    }
}

/// ConnectionKey identifies a logical connection to which deferred queries
/// are bound. Queries sharing a ConnectionKey are batched together.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionKey(u64);

impl ConnectionKey {
    /// Allocate a ConnectionKey which is unique within this process.
    pub fn allocate() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for ConnectionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Session binds a Provider connection to a Registry, and is the entry point
/// for deferring queries.
pub struct Session<P: Provider> {
    provider: Arc<P>,
    registry: Registry<P>,
}

impl<P: Provider> Clone for Session<P> {
    fn clone(&self) -> Self {
        Self {
            provider: self.provider.clone(),
            registry: self.registry.clone(),
        }
    }
}

impl<P: Provider> Session<P> {
    pub fn new(provider: Arc<P>, registry: Registry<P>) -> Self {
        Self { provider, registry }
    }

    pub fn provider(&self) -> &Arc<P> {
        &self.provider
    }

    pub fn registry(&self) -> &Registry<P> {
        &self.registry
    }

    /// Defer a query whose result is a sequence of `T` rows.
    pub fn future<T>(&self, query: P::Query) -> Result<CollectionFuture<P, T>, Error>
    where
        T: serde::de::DeserializeOwned + Send + Sync + 'static,
    {
        Ok(CollectionFuture::new(self.defer(query, decode_collection::<T>)?))
    }

    /// Defer a query whose result is a single `T` value, such as a count.
    pub fn future_value<T>(&self, query: P::Query) -> Result<ScalarFuture<P, T>, Error>
    where
        T: serde::de::DeserializeOwned + Clone + Default + Send + Sync + 'static,
    {
        Ok(ScalarFuture::new(self.defer(query, decode_scalar::<T>)?))
    }

    /// Current open Batch of this session's connection, which is created if
    /// there isn't one. Use `Registry::get` to inspect without creating.
    pub fn batch(&self) -> Result<Arc<Batch<P>>, Error> {
        let key = self.provider.connection()?;
        Ok(self.registry.get_or_create(key, &self.provider))
    }

    fn defer<V>(
        &self,
        query: P::Query,
        decode: fn(Segment) -> Result<V, Error>,
    ) -> Result<Deferred<P, V>, Error>
    where
        V: Send + Sync + 'static,
    {
        // Resolve the connection before any batching state is touched.
        let key = self.provider.connection()?;
        let slot = Arc::new(handle::Slot::new(query, decode));
        let batch = self.registry.enlist(key, &self.provider, slot.clone());

        Ok(Deferred::new(slot, batch))
    }
}

fn decode_collection<T>(rows: Segment) -> Result<Vec<T>, Error>
where
    T: serde::de::DeserializeOwned,
{
    rows.into_iter()
        .map(|row| Ok(serde_json::from_value(row)?))
        .collect()
}

fn decode_scalar<T>(rows: Segment) -> Result<T, Error>
where
    T: serde::de::DeserializeOwned + Default,
{
    let Some(row) = rows.into_iter().next() else {
        return Ok(T::default());
    };

    // Rows of a single column (`SELECT count(*) ...`) are unwrapped to that column.
    let value = match row {
        serde_json::Value::Object(fields) if fields.len() == 1 => fields
            .into_iter()
            .next()
            .map(|(_name, value)| value)
            .unwrap_or_default(),
        row => row,
    };
    Ok(serde_json::from_value(value)?)
}
