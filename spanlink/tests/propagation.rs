// Copyright Andeya Lee 2024
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.
//! End-to-end propagation scenarios across tasks, the blocking pool, and the
//! bounded worker pool.

use spanlink::pool::{PoolConfig, WorkerPool};
use spanlink::report::MemoryRecorder;
use spanlink::{execute_traced, spawn_blocking_traced, spawn_named, spawn_traced, Tracer, Transaction};
use std::sync::mpsc::channel;
use std::sync::Arc;
use std::time::Duration;

fn tracer() -> (Arc<MemoryRecorder>, Tracer) {
    let _ = tracing_subscriber::fmt().with_env_filter(tracing_subscriber::EnvFilter::from_default_env()).with_test_writer().try_init();
    let recorder = Arc::new(MemoryRecorder::default());
    let tracer = Tracer::new(recorder.clone());
    (recorder, tracer)
}

#[tokio::test]
async fn token_fan_out_on_the_pool_records_under_one_transaction() -> anyhow::Result<()> {
    let (recorder, tracer) = tracer();
    let pool = WorkerPool::build(PoolConfig::new(2))?;

    let transaction = tracer.begin("kp00903");
    let token = transaction.issue_token();

    let mut completions = Vec::new();
    for _ in 0..3 {
        completions.push(execute_traced(&pool, || std::thread::sleep(Duration::from_millis(5)))?);
    }
    for completion in completions {
        completion.await?;
    }

    token.expire();
    // Linking after expiry must not rebind anything, anywhere.
    token.link();
    transaction.end();

    let segments = recorder.segment_events();
    assert_eq!(segments.len(), 3);
    assert!(segments.iter().all(|event| event.transaction == transaction.id()));
    let transactions = recorder.transaction_events();
    assert_eq!(transactions.len(), 1);
    assert_eq!(transactions[0].segments, 3);

    pool.shutdown();
    Ok(())
}

#[tokio::test]
async fn unpropagated_pool_job_resolves_no_transaction() -> anyhow::Result<()> {
    let (recorder, tracer) = tracer();
    let pool = WorkerPool::build(PoolConfig::new(1))?;

    let transaction = tracer.begin("kp00902");
    let (send, results) = channel();
    pool.try_execute(None, move || {
        send.send(Transaction::current().is_none()).unwrap();
    })?;
    assert!(results.recv_timeout(Duration::from_secs(5))?);

    transaction.end();
    assert!(recorder.segment_events().is_empty());
    pool.shutdown();
    Ok(())
}

#[tokio::test]
async fn parent_segment_ends_after_all_joined_children() -> anyhow::Result<()> {
    let (recorder, tracer) = tracer();
    let transaction = tracer.begin("fan-out-join");
    let parent = transaction.start_segment("parent");

    let children: Vec<_> = [30u64, 10, 20]
        .into_iter()
        .map(|millis| {
            spawn_named(format!("child-{millis}"), async move {
                tokio::time::sleep(Duration::from_millis(millis)).await;
            })
        })
        .collect();
    futures::future::try_join_all(children).await?;

    parent.end();
    transaction.end();

    let segments = recorder.segment_events();
    assert_eq!(segments.len(), 4);
    // Completion order of the siblings is unconstrained; the join point
    // guarantees only that the parent closes last.
    assert_eq!(segments[3].name, "parent");
    assert!(segments[..3].iter().all(|event| event.name.starts_with("child-")));
    Ok(())
}

#[tokio::test]
async fn aborted_task_still_records_exactly_one_end() -> anyhow::Result<()> {
    let (recorder, tracer) = tracer();
    let transaction = tracer.begin("cancelled");

    let handle = spawn_named("sleeper", async {
        tokio::time::sleep(Duration::from_secs(60)).await;
    });
    tokio::task::yield_now().await;
    handle.abort();
    let err = handle.await.expect_err("task should be cancelled");
    assert!(err.is_cancelled());

    transaction.end();
    let segments = recorder.segment_events();
    assert_eq!(segments.len(), 1);
    assert_eq!(segments[0].name, "sleeper");
    Ok(())
}

#[tokio::test]
async fn manual_link_binds_the_job_without_leaking_to_later_jobs() -> anyhow::Result<()> {
    let (_recorder, tracer) = tracer();
    let pool = WorkerPool::build(PoolConfig::new(1))?;

    let transaction = tracer.begin("kp00903-manual");
    let token = transaction.issue_token();

    let (send, results) = channel();
    let linked = send.clone();
    pool.try_execute(None, move || {
        token.link();
        linked.send(Transaction::current().map(|t| t.id())).unwrap();
    })?;
    assert_eq!(results.recv_timeout(Duration::from_secs(5))?, Some(transaction.id()));

    // The worker isolates each job: the manual link must not bleed into the
    // next unpropagated job on the same thread.
    pool.try_execute(None, move || {
        send.send(Transaction::current().map(|t| t.id())).unwrap();
    })?;
    assert_eq!(results.recv_timeout(Duration::from_secs(5))?, None);

    transaction.end();
    pool.shutdown();
    Ok(())
}

#[tokio::test]
async fn expired_token_runs_work_unattributed() -> anyhow::Result<()> {
    let (recorder, tracer) = tracer();
    let pool = WorkerPool::build(PoolConfig::new(1))?;

    let transaction = tracer.begin("expired-carrier");
    let token = transaction.issue_token();
    token.expire();

    let (send, results) = channel();
    pool.try_execute(Some(spanlink::ContextCarrier::new(token)), move || {
        send.send(Transaction::current().is_none()).unwrap();
    })?;
    assert!(results.recv_timeout(Duration::from_secs(5))?);

    transaction.end();
    assert!(recorder.segment_events().is_empty());
    pool.shutdown();
    Ok(())
}

#[tokio::test]
async fn blocking_pool_work_is_reestablished_and_timed() -> anyhow::Result<()> {
    let (recorder, tracer) = tracer();
    let transaction = tracer.begin("blocking");

    let resolved = spawn_blocking_traced(|| Transaction::current().map(|t| t.id())).await?;
    assert_eq!(resolved, Some(transaction.id()));

    transaction.end();
    let segments = recorder.segment_events();
    assert_eq!(segments.len(), 1);
    assert_eq!(segments[0].transaction, transaction.id());
    Ok(())
}

#[tokio::test]
async fn nested_instrumented_fan_out_attributes_every_level() -> anyhow::Result<()> {
    let (recorder, tracer) = tracer();
    let transaction = tracer.begin("job7");

    let outer = spawn_named("job7", async {
        let children: Vec<_> = (0..3).map(|i| spawn_named(format!("job70{i}"), async {})).collect();
        futures::future::try_join_all(children).await.expect("children join");
    });
    outer.await?;

    transaction.end();
    let segments = recorder.segment_events();
    assert_eq!(segments.len(), 4);
    assert!(segments.iter().all(|event| event.transaction == transaction.id()));
    Ok(())
}

#[tokio::test]
async fn call_site_named_spawn_records_file_and_line() -> anyhow::Result<()> {
    let (recorder, tracer) = tracer();
    let transaction = tracer.begin("call-site");

    spawn_traced(async {}).await?;

    transaction.end();
    let segments = recorder.segment_events();
    assert_eq!(segments.len(), 1);
    assert!(segments[0].name.starts_with("(propagation.rs:"), "unexpected segment name: {}", segments[0].name);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 1)]
async fn concurrent_transactions_do_not_contaminate_each_other() -> anyhow::Result<()> {
    let (recorder, tracer) = tracer();
    let pool = Arc::new(WorkerPool::build(PoolConfig::new(2))?);

    let mut drivers = Vec::new();
    for name in ["t1", "t2"] {
        let tracer = tracer.clone();
        let pool = Arc::clone(&pool);
        drivers.push(tokio::spawn(tracer.scope(name, async move {
            let own = Transaction::current().expect("handler is bound").id();
            let mut completions = Vec::new();
            for _ in 0..3 {
                completions.push(execute_traced(&pool, || std::thread::sleep(Duration::from_millis(2))).expect("schedule"));
            }
            for completion in completions {
                completion.await.expect("completion");
            }
            own
        })));
    }
    let ids = futures::future::try_join_all(drivers).await?;

    assert_ne!(ids[0], ids[1]);
    for id in ids {
        let owned = recorder.segment_events().into_iter().filter(|event| event.transaction == id).count();
        assert_eq!(owned, 3);
    }
    Ok(())
}

// Two root transactions interleaving on a single runtime worker thread:
// each handler must resolve its own transaction after every resume, and
// spawned children must land under their own root.
#[tokio::test(flavor = "multi_thread", worker_threads = 1)]
async fn interleaved_root_transactions_stay_isolated_on_one_worker() -> anyhow::Result<()> {
    let (recorder, tracer) = tracer();

    let mut drivers = Vec::new();
    for name in ["t1", "t2"] {
        let tracer = tracer.clone();
        drivers.push(tokio::spawn(tracer.scope(name, async move {
            let own = Transaction::current().expect("handler is bound").id();
            for _ in 0..5 {
                tokio::time::sleep(Duration::from_millis(2)).await;
                assert_eq!(Transaction::current().map(|t| t.id()), Some(own), "{name} resumed under a foreign transaction");
            }
            spawn_named(format!("child-{name}"), async {}).await.expect("child join");
            own
        })));
    }
    let ids = futures::future::try_join_all(drivers).await?;
    assert_ne!(ids[0], ids[1]);

    let segments = recorder.segment_events();
    assert_eq!(segments.len(), 2);
    for (id, name) in ids.into_iter().zip(["t1", "t2"]) {
        assert!(
            segments.iter().any(|event| event.transaction == id && event.name == format!("child-{name}")),
            "child of {name} attributed to the wrong transaction"
        );
    }
    Ok(())
}
