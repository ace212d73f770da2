use crate::{ConnectionKey, Error, Segment};

/// Error type returned by Provider implementations.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Capabilities of a Provider's connection, consulted once per batch execution.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct Capabilities {
    /// Can the Provider run a combined command yielding multiple ordered
    /// result sets? If not, a batch falls back to executing its queries
    /// one at a time.
    pub multiple_result_sets: bool,
}

/// Provider is the row materialization protocol through which a Batch
/// executes queries. Queries are opaque: the batching core only hands them
/// back to the Provider which produced them.
pub trait Provider: Send + Sync + 'static {
    /// Executable query of this Provider.
    type Query: Send + Sync + 'static;
    /// Combined command of multiple queries, which executes as one unit.
    type Command: Send + Sync;

    /// Identity of the Provider's logical connection, or Error::Unusable
    /// if the connection cannot currently be used.
    fn connection(&self) -> Result<ConnectionKey, Error>;

    fn capabilities(&self) -> Capabilities;

    /// Returns false if `query` is already known to be unable to run.
    /// Such queries are left out of their batch, and materialize as empty.
    fn is_runnable(&self, _query: &Self::Query) -> bool {
        true
    }

    /// Combine `queries` into a Command whose execution yields one result
    /// set per query, in the given order.
    fn combine(&self, queries: &[&Self::Query]) -> Result<Self::Command, BoxError>;

    /// Execute a single query, blocking until its rows are available.
    fn execute(&self, query: &Self::Query) -> Result<Segment, BoxError>;

    /// Execute a combined Command, blocking until all of its result sets
    /// have been read.
    fn execute_combined(&self, command: &Self::Command) -> Result<Vec<Segment>, BoxError>;

    /// Execute a single query.
    fn execute_async(
        &self,
        query: &Self::Query,
    ) -> impl std::future::Future<Output = Result<Segment, BoxError>> + Send;

    /// Execute a combined Command, reading all of its result sets.
    fn execute_combined_async(
        &self,
        command: &Self::Command,
    ) -> impl std::future::Future<Output = Result<Vec<Segment>, BoxError>> + Send;
}
