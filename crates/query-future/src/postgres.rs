//! Postgres Provider built on a sqlx connection pool.
//!
//! Each deferred query is wrapped so that its rows are returned as JSONB
//! documents, and a batch is sent as one multi-statement command over the
//! simple query protocol. Postgres completes each statement with its own
//! CommandComplete message, which delimits the result set of one query.
use crate::{BoxError, Capabilities, ConnectionKey, Error, Provider, Segment};
use futures::TryStreamExt;
use sqlx::Row as _;

/// PgQuery is a single SQL query which returns rows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PgQuery {
    sql: String,
}

impl PgQuery {
    pub fn new(sql: impl Into<String>) -> Self {
        Self { sql: sql.into() }
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    // Rows of the query, each as a single JSONB column.
    fn as_jsonb(&self) -> String {
        let sql = self.sql.trim().trim_end_matches(';').trim_end();
        format!("SELECT to_jsonb(q) FROM ({sql}) AS q")
    }
}

/// PgCommand is the combined statement text of a batch of PgQueries.
#[derive(Debug)]
pub struct PgCommand {
    sql: String,
}

impl PgCommand {
    pub fn sql(&self) -> &str {
        &self.sql
    }
}

fn combine(queries: &[&PgQuery]) -> PgCommand {
    let statements: Vec<String> = queries.iter().map(|query| query.as_jsonb()).collect();

    PgCommand {
        sql: statements.join(";\n"),
    }
}

/// PgProvider executes deferred queries against a Postgres pool.
///
/// Blocking execution drives the pool on the Tokio runtime given at
/// construction. When called from within a runtime, that runtime must be
/// multi-threaded.
pub struct PgProvider {
    pool: sqlx::PgPool,
    key: ConnectionKey,
    runtime: tokio::runtime::Handle,
}

impl PgProvider {
    pub fn new(pool: sqlx::PgPool, runtime: tokio::runtime::Handle) -> Self {
        Self {
            pool,
            key: ConnectionKey::allocate(),
            runtime,
        }
    }

    pub fn pool(&self) -> &sqlx::PgPool {
        &self.pool
    }

    fn block_on<F: std::future::Future>(&self, fut: F) -> F::Output {
        match tokio::runtime::Handle::try_current() {
            Ok(_) => tokio::task::block_in_place(|| self.runtime.block_on(fut)),
            Err(_) => self.runtime.block_on(fut),
        }
    }
}

impl Provider for PgProvider {
    type Query = PgQuery;
    type Command = PgCommand;

    fn connection(&self) -> Result<ConnectionKey, Error> {
        if self.pool.is_closed() {
            return Err(Error::Unusable(format!(
                "postgres pool of {} is closed",
                self.key
            )));
        }
        Ok(self.key)
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            multiple_result_sets: true,
        }
    }

    fn combine(&self, queries: &[&PgQuery]) -> Result<PgCommand, BoxError> {
        Ok(combine(queries))
    }

    fn execute(&self, query: &PgQuery) -> Result<Segment, BoxError> {
        self.block_on(self.execute_async(query))
    }

    fn execute_combined(&self, command: &PgCommand) -> Result<Vec<Segment>, BoxError> {
        self.block_on(self.execute_combined_async(command))
    }

    async fn execute_async(&self, query: &PgQuery) -> Result<Segment, BoxError> {
        let rows = sqlx::query(&query.as_jsonb()).fetch_all(&self.pool).await?;

        let rows = rows
            .iter()
            .map(|row| row.try_get::<serde_json::Value, _>(0))
            .collect::<Result<Segment, sqlx::Error>>()?;

        Ok(rows)
    }

    async fn execute_combined_async(&self, command: &PgCommand) -> Result<Vec<Segment>, BoxError> {
        // Without bind arguments, sqlx uses the simple query protocol,
        // which permits multiple statements.
        let mut results = sqlx::Executor::fetch_many(&self.pool, command.sql.as_str());

        let mut segments = Vec::new();
        let mut rows = Vec::new();

        while let Some(result) = results.try_next().await? {
            // Rows are on the right, and each statement's completion on the left.
            match result.right() {
                Some(row) => rows.push(row.try_get::<serde_json::Value, _>(0)?),
                None => segments.push(std::mem::take(&mut rows)),
            }
        }
        tracing::trace!(key = %self.key, segments = segments.len(), "read combined result sets");

        Ok(segments)
    }
}
