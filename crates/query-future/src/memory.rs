//! In-memory Provider over tables of JSON rows.
//!
//! MemoryProvider is a test double for a database connection. Like most
//! in-memory stand-ins it can't run a combined command of several queries,
//! so batches over it use the one-query-at-a-time fallback unless
//! `with_batching` is used to emulate multiple result sets.
use crate::{BoxError, Capabilities, ConnectionKey, Error, Provider, Row, Segment};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};

/// Tables maps table names to their rows.
pub type Tables = BTreeMap<String, Vec<Row>>;

type Run = Arc<dyn Fn(&Tables) -> Result<Segment, BoxError> + Send + Sync>;

/// MemoryQuery is a query over the Tables of a MemoryProvider,
/// built up from a table scan and a chain of operators.
#[derive(Clone)]
pub struct MemoryQuery {
    run: Run,
    runnable: bool,
}

impl std::fmt::Debug for MemoryQuery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryQuery")
            .field("runnable", &self.runnable)
            .finish_non_exhaustive()
    }
}

impl MemoryQuery {
    /// Scan all rows of table `name`.
    pub fn table(name: impl Into<String>) -> Self {
        let name = name.into();

        Self::from_fn(move |tables| match tables.get(&name) {
            Some(rows) => Ok(rows.clone()),
            None => Err(format!("table {name:?} does not exist").into()),
        })
    }

    /// Query with a custom evaluation over Tables.
    pub fn from_fn<F>(run: F) -> Self
    where
        F: Fn(&Tables) -> Result<Segment, BoxError> + Send + Sync + 'static,
    {
        Self {
            run: Arc::new(run),
            runnable: true,
        }
    }

    /// Query which is known to be unable to run, such as one whose
    /// construction failed upstream. It's never executed, and materializes
    /// as an empty result.
    pub fn unusable() -> Self {
        Self {
            runnable: false,
            ..Self::from_fn(|_| Err("query is not runnable".into()))
        }
    }

    pub fn is_runnable(&self) -> bool {
        self.runnable
    }

    /// Retain only rows matching `predicate`.
    pub fn filter<F>(self, predicate: F) -> Self
    where
        F: Fn(&Row) -> bool + Send + Sync + 'static,
    {
        self.then(move |rows| Ok(rows.into_iter().filter(|row| predicate(row)).collect()))
    }

    /// Project each row to an object holding only `field`.
    pub fn select(self, field: impl Into<String>) -> Self {
        let field = field.into();

        self.then(move |rows| {
            Ok(rows
                .into_iter()
                .map(|row| {
                    let value = row.get(&field).cloned().unwrap_or_default();
                    let mut projected = serde_json::Map::new();
                    projected.insert(field.clone(), value);
                    serde_json::Value::Object(projected)
                })
                .collect())
        })
    }

    /// Retain at most the first `n` rows.
    pub fn take(self, n: usize) -> Self {
        self.then(move |mut rows| {
            rows.truncate(n);
            Ok(rows)
        })
    }

    /// Retain at most the first row.
    pub fn first(self) -> Self {
        self.take(1)
    }

    /// Replace rows with a single `{"count": N}` row.
    pub fn count(self) -> Self {
        self.then(|rows| Ok(vec![serde_json::json!({ "count": rows.len() })]))
    }

    /// Replace rows with a single `{"sum": N}` row summing `field`.
    /// Rows lacking a numeric `field` are skipped.
    pub fn sum(self, field: impl Into<String>) -> Self {
        let field = field.into();

        self.then(move |rows| {
            let values: Vec<&serde_json::Value> =
                rows.iter().filter_map(|row| row.get(&field)).collect();

            let sum = if values.iter().all(|v| v.is_i64()) {
                let sum: i64 = values.iter().filter_map(|v| v.as_i64()).sum();
                serde_json::Value::from(sum)
            } else {
                let sum: f64 = values.iter().filter_map(|v| v.as_f64()).sum();
                serde_json::Value::from(sum)
            };
            Ok(vec![serde_json::json!({ "sum": sum })])
        })
    }

    fn then<F>(self, next: F) -> Self
    where
        F: Fn(Segment) -> Result<Segment, BoxError> + Send + Sync + 'static,
    {
        let Self { run, runnable } = self;

        Self {
            run: Arc::new(move |tables: &Tables| next(run(tables)?)),
            runnable,
        }
    }
}

/// MemoryCommand is a combined command of MemoryQueries.
pub struct MemoryCommand {
    queries: Vec<MemoryQuery>,
}

impl MemoryCommand {
    pub fn len(&self) -> usize {
        self.queries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queries.is_empty()
    }
}

/// MemoryProvider is a Provider over in-memory Tables, standing in for a
/// single database connection.
pub struct MemoryProvider {
    key: ConnectionKey,
    tables: RwLock<Tables>,
    batching: bool,
    closed: AtomicBool,
    round_trips: AtomicUsize,
    fail_next: Mutex<Option<String>>,
}

impl Default for MemoryProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryProvider {
    pub fn new() -> Self {
        Self {
            key: ConnectionKey::allocate(),
            tables: Default::default(),
            batching: false,
            closed: AtomicBool::new(false),
            round_trips: AtomicUsize::new(0),
            fail_next: Mutex::new(None),
        }
    }

    /// Emulate a connection which runs combined commands in one round trip.
    pub fn with_batching(mut self) -> Self {
        self.batching = true;
        self
    }

    /// Append `rows` to table `name`, creating it if needed.
    pub fn insert(&self, name: &str, rows: impl IntoIterator<Item = Row>) {
        let mut tables = self.tables.write().unwrap_or_else(|err| err.into_inner());
        tables.entry(name.to_string()).or_default().extend(rows);
    }

    /// Remove all rows of table `name`, retaining the (empty) table.
    pub fn clear(&self, name: &str) {
        let mut tables = self.tables.write().unwrap_or_else(|err| err.into_inner());
        tables.entry(name.to_string()).or_default().clear();
    }

    /// Close the connection. Deferring further queries fails, as does
    /// executing those already deferred.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    /// Fail the next round trip with `message`.
    pub fn fail_next(&self, message: impl Into<String>) {
        *self.fail_next.lock().unwrap_or_else(|err| err.into_inner()) = Some(message.into());
    }

    /// Number of round trips made to this connection.
    pub fn round_trips(&self) -> usize {
        self.round_trips.load(Ordering::SeqCst)
    }

    fn round_trip(&self) -> Result<std::sync::RwLockReadGuard<'_, Tables>, BoxError> {
        self.round_trips.fetch_add(1, Ordering::SeqCst);

        if self.closed.load(Ordering::SeqCst) {
            return Err(format!("{} is closed", self.key).into());
        }
        if let Some(message) = self
            .fail_next
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .take()
        {
            return Err(message.into());
        }
        Ok(self.tables.read().unwrap_or_else(|err| err.into_inner()))
    }
}

impl Provider for MemoryProvider {
    type Query = MemoryQuery;
    type Command = MemoryCommand;

    fn connection(&self) -> Result<ConnectionKey, Error> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Unusable(format!("{} is closed", self.key)));
        }
        Ok(self.key)
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            multiple_result_sets: self.batching,
        }
    }

    fn is_runnable(&self, query: &MemoryQuery) -> bool {
        query.runnable
    }

    fn combine(&self, queries: &[&MemoryQuery]) -> Result<MemoryCommand, BoxError> {
        if !self.batching {
            return Err("memory connection does not support multiple result sets".into());
        }
        Ok(MemoryCommand {
            queries: queries.iter().map(|query| (*query).clone()).collect(),
        })
    }

    fn execute(&self, query: &MemoryQuery) -> Result<Segment, BoxError> {
        let tables = self.round_trip()?;
        (query.run)(&tables)
    }

    fn execute_combined(&self, command: &MemoryCommand) -> Result<Vec<Segment>, BoxError> {
        let tables = self.round_trip()?;
        command
            .queries
            .iter()
            .map(|query| (query.run)(&tables))
            .collect()
    }

    async fn execute_async(&self, query: &MemoryQuery) -> Result<Segment, BoxError> {
        tokio::task::yield_now().await;
        self.execute(query)
    }

    async fn execute_combined_async(
        &self,
        command: &MemoryCommand,
    ) -> Result<Vec<Segment>, BoxError> {
        tokio::task::yield_now().await;
        self.execute_combined(command)
    }
}
