use query_future::memory::{MemoryProvider, MemoryQuery};
use query_future::{
    BoxError, CancellationToken, Capabilities, Config, ConnectionKey, Error, Progress, Provider,
    Registry, Segment, Session,
};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Default, PartialEq, serde::Deserialize)]
struct Basic {
    id: u32,
    column_int: i64,
}

// Ten rows of `basics`, with `column_int` 0..10.
fn fixture(provider: MemoryProvider, config: Config) -> Session<MemoryProvider> {
    provider.insert(
        "basics",
        (0..10).map(|i| json!({"id": i + 1, "column_int": i})),
    );
    provider.clear("empty");

    Session::new(Arc::new(provider), Registry::new(config))
}

fn below(n: i64) -> MemoryQuery {
    MemoryQuery::table("basics").filter(move |row| row["column_int"].as_i64() < Some(n))
}

fn at_least(n: i64) -> MemoryQuery {
    MemoryQuery::table("basics").filter(move |row| row["column_int"].as_i64() >= Some(n))
}

#[test]
fn two_futures_resolve_in_one_round_trip() {
    let session = fixture(MemoryProvider::new().with_batching(), Config::default());

    let list1 = session.future::<Basic>(below(5)).unwrap();
    let list2 = session.future::<Basic>(at_least(5)).unwrap();

    assert_eq!(session.batch().unwrap().pending_count(), 2);

    let list = list1.to_list().unwrap();

    // The executed batch is closed, and a fresh one is empty.
    let key = session.provider().connection().unwrap();
    assert!(session.registry().get(key).is_none());
    assert_eq!(session.batch().unwrap().pending_count(), 0);

    assert!(list1.has_value());
    assert_eq!(list.len(), 5);
    assert_eq!(list1.to_list().unwrap().len(), 5);

    assert!(list2.has_value());
    assert_eq!(list2.to_list().unwrap().len(), 5);
    assert_eq!(
        list2.first_or_default().unwrap(),
        Basic {
            id: 6,
            column_int: 5
        }
    );

    assert_eq!(session.provider().round_trips(), 1);
}

#[test]
fn two_values_resolve_together() {
    let session = fixture(MemoryProvider::new().with_batching(), Config::default());

    let value1 = session.future_value::<i64>(below(5).count()).unwrap();
    let value2 = session.future_value::<i64>(at_least(5).count()).unwrap();
    let sum = session
        .future_value::<i64>(MemoryQuery::table("basics").sum("column_int"))
        .unwrap();

    assert_eq!(session.batch().unwrap().pending_count(), 3);

    assert_eq!(value1.value().unwrap(), 5);
    assert_eq!(session.batch().unwrap().pending_count(), 0);

    assert!(value2.has_value());
    assert_eq!(value2.value().unwrap(), 5);
    assert_eq!(sum.value().unwrap(), 45);
    assert_eq!(session.provider().round_trips(), 1);
}

#[test]
fn fallback_preserves_results() {
    // Without multiple result sets, each query runs on its own.
    let session = fixture(MemoryProvider::new(), Config::default());

    let list1 = session.future::<Basic>(below(3)).unwrap();
    let list2 = session.future::<Basic>(at_least(8)).unwrap();
    let count = session.future_value::<usize>(below(10).count()).unwrap();

    let ids: Vec<u32> = list2.iter().unwrap().map(|b| b.id).collect();
    assert_eq!(ids, vec![9, 10]);

    assert!(list1.has_value() && count.has_value());
    assert_eq!(list1.to_array().unwrap().len(), 3);
    assert_eq!(count.value().unwrap(), 10);
    assert_eq!(session.provider().round_trips(), 3);

    // Nothing runs again.
    let _ = list1.to_list().unwrap();
    let _ = list2.to_list().unwrap();
    assert_eq!(session.provider().round_trips(), 3);
}

#[test]
fn disabled_batching_runs_queries_individually() {
    let session = fixture(
        MemoryProvider::new().with_batching(),
        Config {
            allow_batching: false,
            ..Default::default()
        },
    );
    assert!(!session.registry().config().allow_batching);

    let futures: Vec<_> = (0..4)
        .map(|i| session.future::<Basic>(below(i)).unwrap())
        .collect();

    assert_eq!(futures[3].to_list().unwrap().len(), 3);
    assert!(futures.iter().all(|f| f.has_value()));
    assert_eq!(session.provider().round_trips(), 4);
}

#[test]
fn results_follow_registration_order() {
    let session = fixture(MemoryProvider::new().with_batching(), Config::default());

    let futures: Vec<_> = (0..10)
        .rev()
        .map(|i| {
            session
                .future::<Basic>(
                    MemoryQuery::table("basics")
                        .filter(move |row| row["column_int"] == json!(i)),
                )
                .unwrap()
        })
        .collect();

    // Materialize from the middle of the batch.
    let _ = futures[4].materialize().unwrap();

    for (future, expect) in futures.iter().zip((0..10).rev()) {
        assert!(future.has_value());
        assert_eq!(future.materialize().unwrap()[0].column_int, expect);
    }
    assert_eq!(session.provider().round_trips(), 1);
}

#[test]
fn fresh_batch_after_execution() {
    let session = fixture(MemoryProvider::new().with_batching(), Config::default());

    let first = session.future::<Basic>(below(2)).unwrap();
    let executed = first.deferred().batch().clone();
    first.materialize().unwrap();

    assert!(matches!(executed.progress(), Progress::Executed));
    assert_eq!(session.registry().open_batches(), 0);

    let second = session.future::<Basic>(below(4)).unwrap();
    let current = second.deferred().batch().clone();

    assert!(!Arc::ptr_eq(&executed, &current));
    assert_eq!(current.pending_count(), 1);
    assert_eq!(executed.pending_count(), 0);
    assert!(!second.has_value());

    assert_eq!(second.to_list().unwrap().len(), 4);
    assert_eq!(session.provider().round_trips(), 2);
}

#[test]
fn empty_results() {
    let session = fixture(MemoryProvider::new().with_batching(), Config::default());

    let rows = session.future::<Basic>(MemoryQuery::table("empty")).unwrap();
    let number = session
        .future_value::<i64>(MemoryQuery::table("empty").select("n").first())
        .unwrap();
    let name = session
        .future_value::<Option<String>>(MemoryQuery::table("empty").select("name"))
        .unwrap();

    assert_eq!(number.value().unwrap(), 0);
    assert_eq!(name.value().unwrap(), None);

    assert!(rows.has_value());
    assert_eq!(rows.iter().unwrap().count(), 0);
    assert_eq!(rows.iter().unwrap().count(), 0);
    assert_eq!(rows.to_list().unwrap(), Vec::new());
    assert_eq!(rows.first_or_default().unwrap(), Basic::default());
}

#[test]
fn unrunnable_queries_read_as_empty() {
    let session = fixture(MemoryProvider::new().with_batching(), Config::default());

    let broken = session.future::<Basic>(MemoryQuery::unusable()).unwrap();
    let broken_count = session
        .future_value::<i64>(MemoryQuery::unusable().count())
        .unwrap();
    let fine = session.future::<Basic>(below(1)).unwrap();

    assert!(broken.to_list().unwrap().is_empty());
    assert_eq!(broken_count.value().unwrap(), 0);
    assert!(!broken.has_value());
    assert_eq!(fine.to_list().unwrap().len(), 1);

    // Only `fine` was sent, and on its own.
    assert_eq!(session.provider().round_trips(), 1);
}

#[test]
fn execution_failure_reaches_every_sibling() {
    let session = fixture(MemoryProvider::new().with_batching(), Config::default());

    let list1 = session.future::<Basic>(below(5)).unwrap();
    let list2 = session.future::<Basic>(at_least(5)).unwrap();

    session.provider().fail_next("server closed the connection");

    let err = list1.to_list().unwrap_err();
    let Error::Execution { batch, source } = &err else {
        panic!("unexpected error {err:?}")
    };
    assert_eq!(source.to_string(), "server closed the connection");
    insta::assert_snapshot!(err.to_string(), @"deferred query batch 1 failed to execute");

    // The sibling was never resolved, and isn't masked as empty.
    assert!(!list1.has_value());
    assert!(!list2.has_value());
    assert!(matches!(
        list2.to_list(),
        Err(Error::Execution { batch: b, .. }) if b == *batch
    ));
    assert_eq!(session.provider().round_trips(), 1);

    // Later deferred queries use a new batch, which succeeds.
    let retry = session.future::<Basic>(below(5)).unwrap();
    assert_eq!(retry.to_list().unwrap().len(), 5);
}

#[test]
fn unusable_connection_fails_registration() {
    let session = fixture(MemoryProvider::new().with_batching(), Config::default());
    session.provider().close();

    assert!(matches!(
        session.future::<Basic>(below(5)),
        Err(Error::Unusable(_))
    ));
    assert!(matches!(
        session.future_value::<i64>(below(5).count()),
        Err(Error::Unusable(_))
    ));
    assert_eq!(session.registry().open_batches(), 0);
    assert_eq!(session.provider().round_trips(), 0);
}

#[test]
fn bypass_resolves_without_the_batch() {
    let session = fixture(MemoryProvider::new(), Config::default());

    let direct = session.future::<Basic>(below(2)).unwrap();
    let count = session.future_value::<i64>(below(7).count()).unwrap();
    let deferred = session.future::<Basic>(at_least(9)).unwrap();

    assert_eq!(direct.get_result_directly().unwrap().len(), 2);
    assert_eq!(count.get_result_directly().unwrap(), 7);
    assert_eq!(session.provider().round_trips(), 2);
    assert!(!deferred.has_value());

    // The batch skips handles which are already resolved.
    assert_eq!(session.batch().unwrap().pending_count(), 3);
    assert_eq!(deferred.to_list().unwrap().len(), 1);
    assert_eq!(session.provider().round_trips(), 3);

    assert_eq!(direct.to_list().unwrap().len(), 2);
    assert_eq!(session.provider().round_trips(), 3);
}

#[tokio::test]
async fn resolved_handles_are_not_executed_again() {
    let session = fixture(MemoryProvider::new().with_batching(), Config::default());
    let cancel = CancellationToken::new();

    let list = session.future::<Basic>(below(5)).unwrap();
    let count = session.future_value::<i64>(below(5).count()).unwrap();

    assert_eq!(list.to_list().unwrap().len(), 5);
    assert_eq!(session.provider().round_trips(), 1);

    assert_eq!(list.get_result_directly().unwrap().len(), 5);
    assert_eq!(
        list.get_result_directly_async(&cancel).await.unwrap().len(),
        5
    );
    assert_eq!(count.get_result_directly().unwrap(), 5);
    assert_eq!(count.get_result_directly_async(&cancel).await.unwrap(), 5);

    assert_eq!(session.provider().round_trips(), 1);
}

#[test]
fn registrations_racing_execution_run_exactly_once() {
    let session = fixture(MemoryProvider::new().with_batching(), Config::default());
    let runs = Arc::new(AtomicUsize::new(0));

    // Query for rows below `n`, which counts its executions.
    let counted = |n: usize| {
        let runs = runs.clone();
        MemoryQuery::from_fn(move |tables| {
            runs.fetch_add(1, Ordering::SeqCst);
            Ok(tables["basics"]
                .iter()
                .filter(|row| row["column_int"].as_u64() < Some(n as u64))
                .cloned()
                .collect())
        })
    };

    let futures: Vec<Vec<_>> = std::thread::scope(|scope| {
        let threads: Vec<_> = (0..8)
            .map(|thread| {
                let (session, counted) = (&session, &counted);

                scope.spawn(move || {
                    (0..25)
                        .map(|i| {
                            let n = (thread + i) % 10;
                            let future = session.future::<Basic>(counted(n)).unwrap();

                            // Even threads execute as they go, racing registrations of the others.
                            if thread % 2 == 0 && i % 5 == 4 {
                                assert_eq!(future.to_list().unwrap().len(), n);
                            }
                            (n, future)
                        })
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        threads.into_iter().map(|t| t.join().unwrap()).collect()
    });

    let (mut expect, mut actual) = (0, 0);
    for (n, future) in futures.iter().flatten() {
        actual += future.materialize().unwrap().len();
        expect += n;

        assert!(future.has_value());
        assert!(matches!(
            future.deferred().batch().progress(),
            Progress::Executed
        ));
    }

    assert_eq!(actual, expect);
    assert_eq!(runs.load(Ordering::SeqCst), 200);
    assert_eq!(session.registry().open_batches(), 0);
}

#[test]
fn concurrent_triggers_collapse_into_one_execution() {
    let session = fixture(MemoryProvider::new().with_batching(), Config::default());

    let futures: Vec<_> = (1..=8)
        .map(|i| session.future::<Basic>(below(i)).unwrap())
        .collect();

    std::thread::scope(|scope| {
        for (index, future) in futures.iter().enumerate() {
            scope.spawn(move || {
                assert_eq!(future.to_list().unwrap().len(), index + 1);
            });
        }
    });

    assert_eq!(session.provider().round_trips(), 1);
}

#[tokio::test]
async fn async_materialization() {
    let session = fixture(MemoryProvider::new().with_batching(), Config::default());
    let cancel = CancellationToken::new();

    let list1 = session.future::<Basic>(below(5)).unwrap();
    let list2 = session.future::<Basic>(at_least(5)).unwrap();
    let count = session.future_value::<i64>(below(3).count()).unwrap();

    assert_eq!(list1.to_list_async(&cancel).await.unwrap().len(), 5);
    assert!(list2.has_value() && count.has_value());

    assert_eq!(list2.to_array_async(&cancel).await.unwrap().len(), 5);
    assert_eq!(
        list2.first_or_default_async(&cancel).await.unwrap().column_int,
        5
    );
    assert_eq!(count.value_async(&cancel).await.unwrap(), 3);
    assert_eq!(session.provider().round_trips(), 1);

    let direct = session.future::<Basic>(below(1)).unwrap();
    assert_eq!(
        direct.get_result_directly_async(&cancel).await.unwrap().len(),
        1
    );
    assert_eq!(session.provider().round_trips(), 2);
}

#[tokio::test]
async fn async_fallback() {
    let session = fixture(MemoryProvider::new(), Config::default());
    let cancel = CancellationToken::new();

    let list1 = session.future::<Basic>(below(4)).unwrap();
    let list2 = session.future::<Basic>(at_least(4)).unwrap();

    assert_eq!(list2.to_list_async(&cancel).await.unwrap().len(), 6);
    assert_eq!(list1.to_list_async(&cancel).await.unwrap().len(), 4);
    assert_eq!(session.provider().round_trips(), 2);
}

#[tokio::test]
async fn cancelled_before_trigger() {
    let session = fixture(MemoryProvider::new().with_batching(), Config::default());

    let count = session.future_value::<i64>(below(5).count()).unwrap();

    let cancel = CancellationToken::new();
    cancel.cancel();

    assert!(matches!(
        count.value_async(&cancel).await,
        Err(Error::Cancelled)
    ));
    assert!(matches!(
        count.get_result_directly_async(&cancel).await,
        Err(Error::Cancelled)
    ));

    assert_eq!(session.provider().round_trips(), 0);
    assert!(!count.has_value());
    assert_eq!(count.deferred().batch().pending_count(), 1);
    assert!(matches!(count.deferred().batch().progress(), Progress::Open));

    // The batch is untouched and still runs when next triggered.
    assert_eq!(count.value().unwrap(), 5);
}

/// Gated is a batching MemoryProvider whose async combined commands
/// each wait for a permit of its gate before they run.
struct Gated {
    inner: MemoryProvider,
    gate: tokio::sync::Semaphore,
}

impl Provider for Gated {
    type Query = MemoryQuery;
    type Command = <MemoryProvider as Provider>::Command;

    fn connection(&self) -> Result<ConnectionKey, Error> {
        self.inner.connection()
    }
    fn capabilities(&self) -> Capabilities {
        self.inner.capabilities()
    }
    fn combine(&self, queries: &[&MemoryQuery]) -> Result<Self::Command, BoxError> {
        self.inner.combine(queries)
    }
    fn execute(&self, query: &MemoryQuery) -> Result<Segment, BoxError> {
        self.inner.execute(query)
    }
    fn execute_combined(&self, command: &Self::Command) -> Result<Vec<Segment>, BoxError> {
        self.inner.execute_combined(command)
    }
    async fn execute_async(&self, query: &MemoryQuery) -> Result<Segment, BoxError> {
        self.inner.execute_async(query).await
    }
    async fn execute_combined_async(
        &self,
        command: &Self::Command,
    ) -> Result<Vec<Segment>, BoxError> {
        let _permit = self.gate.acquire().await?;
        self.inner.execute_combined_async(command).await
    }
}

fn gated() -> Session<Gated> {
    let inner = MemoryProvider::new().with_batching();
    inner.insert(
        "basics",
        (0..10).map(|i| json!({"id": i + 1, "column_int": i})),
    );
    let provider = Gated {
        inner,
        gate: tokio::sync::Semaphore::new(0),
    };
    Session::new(Arc::new(provider), Registry::default())
}

#[tokio::test]
async fn cancelled_waiter_leaves_execution_running() {
    let session = gated();

    let list1 = Arc::new(session.future::<Basic>(below(5)).unwrap());
    let list2 = Arc::new(session.future::<Basic>(at_least(5)).unwrap());
    let batch = list1.deferred().batch().clone();

    let executing = tokio::spawn({
        let list1 = list1.clone();
        async move { list1.to_list_async(&CancellationToken::new()).await }
    });
    while matches!(batch.progress(), Progress::Open) {
        tokio::task::yield_now().await;
    }
    assert!(matches!(batch.progress(), Progress::Executing));

    let cancel = CancellationToken::new();
    let waiting = tokio::spawn({
        let (list2, cancel) = (list2.clone(), cancel.clone());
        async move { list2.to_list_async(&cancel).await }
    });
    tokio::task::yield_now().await;
    cancel.cancel();

    assert!(matches!(waiting.await.unwrap(), Err(Error::Cancelled)));
    assert!(!list2.has_value());

    // The claimed execution carries on, and resolves both handles.
    session.provider().gate.add_permits(1);

    assert_eq!(executing.await.unwrap().unwrap().len(), 5);
    assert!(matches!(batch.progress(), Progress::Executed));
    assert!(list2.has_value());
    assert_eq!(list2.to_list().unwrap().len(), 5);
    assert_eq!(session.provider().inner.round_trips(), 1);
}

#[tokio::test]
async fn dropped_execution_is_abandoned() {
    let session = gated();
    let cancel = CancellationToken::new();

    let list1 = session.future::<Basic>(below(5)).unwrap();
    let list2 = session.future::<Basic>(at_least(5)).unwrap();

    let timed_out = tokio::time::timeout(
        std::time::Duration::from_millis(20),
        list1.to_list_async(&cancel),
    )
    .await;
    assert!(timed_out.is_err());

    assert!(matches!(
        list1.deferred().batch().progress(),
        Progress::Failed(Error::Abandoned(_))
    ));
    assert!(matches!(list2.to_list(), Err(Error::Abandoned(_))));
    assert!(matches!(
        list1.to_list_async(&cancel).await,
        Err(Error::Abandoned(_))
    ));
    assert_eq!(session.provider().inner.round_trips(), 0);

    // A later query runs in a fresh batch.
    let retry = session.future::<Basic>(below(5)).unwrap();
    assert_eq!(retry.to_list_async(&cancel).await.unwrap().len(), 5);
}

#[tokio::test]
async fn blocking_wait_fails_on_current_thread_runtime() {
    let session = gated();

    let list1 = Arc::new(session.future::<Basic>(below(5)).unwrap());
    let list2 = session.future::<Basic>(at_least(5)).unwrap();
    let batch = list1.deferred().batch().clone();

    let executing = tokio::spawn({
        let list1 = list1.clone();
        async move { list1.to_list_async(&CancellationToken::new()).await }
    });
    while matches!(batch.progress(), Progress::Open) {
        tokio::task::yield_now().await;
    }

    // Blocking here would starve `executing`, which runs on this same thread.
    assert!(matches!(
        list2.to_list(),
        Err(Error::WouldBlock(id)) if id == batch.id()
    ));
    assert!(!list2.has_value());

    session.provider().gate.add_permits(1);
    assert_eq!(executing.await.unwrap().unwrap().len(), 5);

    // Once finished, blocking reads don't wait at all.
    assert_eq!(list2.to_list().unwrap().len(), 5);
    assert_eq!(session.provider().inner.round_trips(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn blocking_wait_on_multi_thread_runtime() {
    let session = gated();

    let list1 = Arc::new(session.future::<Basic>(below(5)).unwrap());
    let list2 = Arc::new(session.future::<Basic>(at_least(5)).unwrap());
    let batch = list1.deferred().batch().clone();

    let executing = tokio::spawn({
        let list1 = list1.clone();
        async move { list1.to_list_async(&CancellationToken::new()).await }
    });
    while matches!(batch.progress(), Progress::Open) {
        tokio::task::yield_now().await;
    }

    let provider = session.provider().clone();
    let opener = std::thread::spawn(move || {
        std::thread::sleep(std::time::Duration::from_millis(50));
        provider.gate.add_permits(1);
    });

    let waiting = tokio::task::spawn_blocking({
        let list2 = list2.clone();
        move || list2.to_list().map(|rows| rows.len())
    });
    assert_eq!(waiting.await.unwrap().unwrap(), 5);
    assert_eq!(executing.await.unwrap().unwrap().len(), 5);

    opener.join().unwrap();
    assert_eq!(session.provider().inner.round_trips(), 1);
}
