use crate::handle::{Commit, Pending};
use crate::registry::{self, Inner};
use crate::{BoxError, CancellationToken, Config, ConnectionKey, Error, Provider, Segment};
use std::sync::{Arc, Mutex, Weak};

/// Progress of a Batch through its single execution.
#[derive(Debug, Clone)]
pub enum Progress {
    /// Accepting registrations.
    Open,
    /// Claimed by a caller and running.
    Executing,
    /// All pending queries were executed and their results assigned.
    Executed,
    /// Execution failed, and no pending query was assigned a result.
    Failed(Error),
}

impl Progress {
    pub fn is_finished(&self) -> bool {
        matches!(self, Progress::Executed | Progress::Failed(_))
    }

    fn outcome(&self) -> Result<(), Error> {
        match self {
            Progress::Failed(err) => Err(err.clone()),
            _ => Ok(()),
        }
    }
}

/// Batch is the set of deferred queries of one connection which execute
/// together. It executes at most once: the first caller to trigger it
/// claims its pending queries and closes it in its Registry, and any
/// concurrent trigger waits for that execution to finish.
pub struct Batch<P: Provider> {
    id: u64,
    key: ConnectionKey,
    provider: Arc<P>,
    config: Arc<Config>,
    registry: Weak<Inner<P>>,
    // Registration order is result-set order. None once claimed.
    pending: Mutex<Option<Vec<Arc<dyn Pending<P>>>>>,
    progress: tokio::sync::watch::Sender<Progress>,
}

/// Plan of how a claimed Batch executes.
enum Plan<'a, P: Provider> {
    /// Nothing remains to execute.
    Empty,
    /// Execute a single command yielding one result set per handle.
    Combined {
        handles: Vec<Arc<dyn Pending<P>>>,
        command: P::Command,
    },
    /// Execute each handle's query on its own.
    Individual {
        handles: Vec<Arc<dyn Pending<P>>>,
        queries: Vec<&'a P::Query>,
    },
}

impl<P: Provider> Batch<P> {
    pub(crate) fn new(
        id: u64,
        key: ConnectionKey,
        provider: Arc<P>,
        config: Arc<Config>,
        registry: Weak<Inner<P>>,
    ) -> Self {
        let (progress, _) = tokio::sync::watch::channel(Progress::Open);

        Self {
            id,
            key,
            provider,
            config,
            registry,
            pending: Mutex::new(Some(Vec::new())),
            progress,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn key(&self) -> ConnectionKey {
        self.key
    }

    pub fn provider(&self) -> &Arc<P> {
        &self.provider
    }

    pub fn progress(&self) -> Progress {
        self.progress.borrow().clone()
    }

    /// Number of registered queries which are waiting for this Batch to execute.
    pub fn pending_count(&self) -> usize {
        self.lock_pending().as_ref().map(Vec::len).unwrap_or_default()
    }

    /// Execute all pending queries of this Batch, blocking until complete.
    ///
    /// If another caller has already claimed the Batch, this call waits for
    /// that execution and returns its outcome. Calls after the Batch has
    /// executed return immediately. Waiting from within a current-thread
    /// Tokio runtime fails with Error::WouldBlock instead, as the execution
    /// may be a task of that same runtime.
    pub fn execute(self: &Arc<Self>) -> Result<(), Error> {
        let Some(pending) = registry::claim(&self.registry, self) else {
            return self.wait_blocking();
        };
        let guard = Completion::start(self);

        let result = self.run_blocking(pending);
        guard.finish(result)
    }

    /// Execute all pending queries of this Batch.
    ///
    /// A `cancel` which is already cancelled returns Error::Cancelled
    /// without touching the Batch. So does cancelling while waiting on
    /// another caller's execution, which carries on regardless. Once this
    /// call has claimed the Batch, its command runs to completion so that
    /// every pending query is either resolved or failed.
    pub async fn execute_async(self: &Arc<Self>, cancel: &CancellationToken) -> Result<(), Error> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let Some(pending) = registry::claim(&self.registry, self) else {
            return tokio::select! {
                biased;
                result = self.finished() => result,
                _ = cancel.cancelled() => Err(Error::Cancelled),
            };
        };
        let guard = Completion::start(self);

        let result = self.run_async(pending).await;
        guard.finish(result)
    }

    pub(crate) fn register(&self, pending: Arc<dyn Pending<P>>) {
        match self.lock_pending().as_mut() {
            Some(handles) => handles.push(pending),
            // Registry::enlist holds the registry lock, under which a claimed
            // Batch is no longer reachable.
            None => unreachable!("registration into a claimed batch"),
        }
    }

    pub(crate) fn take_pending(&self) -> Option<Vec<Arc<dyn Pending<P>>>> {
        let pending = self.lock_pending().take()?;
        self.progress.send_replace(Progress::Executing);
        Some(pending)
    }

    pub(crate) fn execution_error(&self, err: BoxError) -> Error {
        Error::Execution {
            batch: self.id,
            source: Arc::from(err),
        }
    }

    #[tracing::instrument(level = "debug", skip_all, fields(batch = self.id, key = %self.key))]
    fn run_blocking(&self, pending: Vec<Arc<dyn Pending<P>>>) -> Result<(), Error> {
        match self.plan(&pending)? {
            Plan::Empty => Ok(()),
            Plan::Combined { handles, command } => {
                let segments = self
                    .provider
                    .execute_combined(&command)
                    .map_err(|err| self.execution_error(err))?;
                self.distribute(handles, segments)
            }
            Plan::Individual { handles, queries } => {
                let segments = queries
                    .into_iter()
                    .map(|query| self.provider.execute(query))
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(|err| self.execution_error(err))?;
                self.distribute(handles, segments)
            }
        }
    }

    #[tracing::instrument(level = "debug", skip_all, fields(batch = self.id, key = %self.key))]
    async fn run_async(&self, pending: Vec<Arc<dyn Pending<P>>>) -> Result<(), Error> {
        match self.plan(&pending)? {
            Plan::Empty => Ok(()),
            Plan::Combined { handles, command } => {
                let segments = self
                    .provider
                    .execute_combined_async(&command)
                    .await
                    .map_err(|err| self.execution_error(err))?;
                self.distribute(handles, segments)
            }
            Plan::Individual { handles, queries } => {
                let mut segments = Vec::with_capacity(queries.len());
                for query in queries {
                    let segment = self
                        .provider
                        .execute_async(query)
                        .await
                        .map_err(|err| self.execution_error(err))?;
                    segments.push(segment);
                }
                self.distribute(handles, segments)
            }
        }
    }

    fn plan<'a>(&self, pending: &'a [Arc<dyn Pending<P>>]) -> Result<Plan<'a, P>, Error> {
        // Handles resolved through the bypass path, and queries which cannot
        // run, are not sent to the provider.
        let (handles, queries): (Vec<_>, Vec<_>) = pending
            .iter()
            .filter(|handle| !handle.has_value() && self.provider.is_runnable(handle.query()))
            .map(|handle| (handle.clone(), handle.query()))
            .unzip();

        if queries.is_empty() {
            tracing::debug!(pending = pending.len(), "no runnable deferred queries");
            return Ok(Plan::Empty);
        }

        let capabilities = self.provider.capabilities();
        let combine = self.config.allow_batching
            && capabilities.multiple_result_sets
            && !(queries.len() == 1 && self.config.bypass_single);

        tracing::debug!(
            queries = queries.len(),
            skipped = pending.len() - queries.len(),
            combine,
            "executing deferred query batch"
        );

        if !combine {
            return Ok(Plan::Individual { handles, queries });
        }
        let command = self
            .provider
            .combine(&queries)
            .map_err(|err| self.execution_error(err))?;

        Ok(Plan::Combined { handles, command })
    }

    // Assign segment `i` to handle `i`. Every segment is decoded before any
    // is assigned, so a failure leaves all handles unresolved.
    fn distribute(
        &self,
        handles: Vec<Arc<dyn Pending<P>>>,
        segments: Vec<Segment>,
    ) -> Result<(), Error> {
        if handles.len() != segments.len() {
            return Err(Error::SegmentMismatch {
                batch: self.id,
                expected: handles.len(),
                actual: segments.len(),
            });
        }

        let commits = handles
            .into_iter()
            .zip(segments)
            .map(|(handle, rows)| handle.stage(rows))
            .collect::<Result<Vec<Commit>, Error>>()?;

        for commit in commits {
            commit();
        }
        Ok(())
    }

    fn wait_blocking(&self) -> Result<(), Error> {
        {
            let progress = self.progress.borrow();
            if progress.is_finished() {
                return progress.outcome();
            }
        }

        match tokio::runtime::Handle::try_current() {
            Err(_) => futures::executor::block_on(self.finished()),
            Ok(handle)
                if matches!(
                    handle.runtime_flavor(),
                    tokio::runtime::RuntimeFlavor::CurrentThread
                ) =>
            {
                tracing::debug!(batch = self.id, key = %self.key, "refusing to block a current-thread runtime");
                Err(Error::WouldBlock(self.id))
            }
            Ok(_) => tokio::task::block_in_place(|| futures::executor::block_on(self.finished())),
        }
    }

    /// Wait for a claimed execution to finish, returning its outcome.
    async fn finished(&self) -> Result<(), Error> {
        let mut rx = self.progress.subscribe();

        // `self` owns the sender, so the channel cannot close while we wait.
        let result = match rx.wait_for(Progress::is_finished).await {
            Ok(progress) => progress.outcome(),
            Err(_) => Err(Error::Abandoned(self.id)),
        };
        result
    }

    fn lock_pending(&self) -> std::sync::MutexGuard<'_, Option<Vec<Arc<dyn Pending<P>>>>> {
        self.pending
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

/// Completion publishes the outcome of a claimed execution. If dropped
/// without finishing, as when an executing future is itself dropped,
/// the Batch is failed as abandoned so that no waiter hangs.
struct Completion<'a, P: Provider> {
    batch: &'a Batch<P>,
    finished: bool,
}

impl<'a, P: Provider> Completion<'a, P> {
    fn start(batch: &'a Batch<P>) -> Self {
        Self {
            batch,
            finished: false,
        }
    }

    fn finish(mut self, result: Result<(), Error>) -> Result<(), Error> {
        self.finished = true;

        let progress = match &result {
            Ok(()) => Progress::Executed,
            Err(err) => {
                tracing::warn!(batch = self.batch.id, key = %self.batch.key, error = %err, "deferred query batch failed");
                Progress::Failed(err.clone())
            }
        };
        self.batch.progress.send_replace(progress);

        result
    }
}

impl<'a, P: Provider> Drop for Completion<'a, P> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        tracing::warn!(batch = self.batch.id, key = %self.batch.key, "deferred query batch abandoned during execution");

        self.batch
            .progress
            .send_replace(Progress::Failed(Error::Abandoned(self.batch.id)));
    }
}
