// Copyright Andeya Lee 2024
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.
//! Walks the propagation scenarios an instrumented request handler runs
//! into: same-context fan-out, context lost across a thread pool, explicit
//! token propagation, and segments annotated with an outbound call.
//!
//! Every handler runs inside `Tracer::scope`, which binds its root
//! transaction around each poll; that keeps concurrent handlers on a shared
//! runtime from ever seeing each other's transaction.

use anyhow::{Context, Result};
use clap::Parser;
use spanlink::pool::{PoolConfig, WorkerPool};
use spanlink::report::MemoryRecorder;
use spanlink::{execute_traced, spawn_traced, ExternalCall, Tracer, Transaction};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[derive(Parser)]
struct Flags {
    /// Fan-out width per scenario.
    #[clap(long, default_value_t = 3)]
    jobs: usize,
    /// Worker threads in the blocking pool.
    #[clap(long, default_value_t = 2)]
    pool_size: usize,
}

fn init_tracing() {
    tracing_subscriber::fmt().with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))).init();
}

/// Sub-units spawned as tasks from the handler context: the combinator
/// carries the transaction for them, and each gets its own segment.
async fn same_context_fan_out(tracer: &Tracer, jobs: usize) -> Result<()> {
    tracer
        .scope("GET /same-context", async move {
            let handles: Vec<_> = (0..jobs)
                .map(|_| {
                    spawn_traced(async {
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    })
                })
                .collect();
            for handle in handles {
                handle.await?;
            }
            Ok(())
        })
        .await
}

/// A job scheduled on the pool without any carrier: attribution is lost
/// there, silently, and nothing crashes.
async fn lost_context(tracer: &Tracer, pool: &WorkerPool) -> Result<()> {
    tracer
        .scope("GET /lost-context", async move {
            let (send, recv) = std::sync::mpsc::channel();
            pool.try_execute(None, move || {
                let resolved = Transaction::current();
                send.send(resolved.is_none()).ok();
            })?;
            let lost = recv.recv_timeout(Duration::from_secs(5))?;
            info!(lost, "ambient lookup on the unpropagated worker");
            Ok(())
        })
        .await
}

/// The combinator opens a call-site segment per job and the carrier links
/// the worker for its duration; the token is expired once all jobs joined.
async fn token_fan_out(tracer: &Tracer, pool: &WorkerPool, jobs: usize) -> Result<()> {
    tracer
        .scope("GET /token-fan-out", async move {
            let transaction = Transaction::current().context("handler transaction not bound")?;
            let token = transaction.issue_token();
            let mut completions = Vec::new();
            for _ in 0..jobs {
                completions.push(execute_traced(pool, || std::thread::sleep(Duration::from_millis(10)))?);
            }
            for completion in completions {
                completion.await?;
            }
            token.expire();
            Ok(())
        })
        .await
}

/// A handler-side segment ended from the worker that finishes the work,
/// with outbound-call metadata attached before the end.
async fn segment_with_external(tracer: &Tracer, pool: &WorkerPool) -> Result<()> {
    tracer
        .scope("GET /external", async move {
            let transaction = Transaction::current().context("handler transaction not bound")?;
            let segment = transaction.start_segment("remote lookup");
            segment.annotate_external(ExternalCall::library("dummy http client").uri("https://www.example.com/hoge/fuga").procedure("foo"));
            let carrier = spanlink::ContextCarrier::new(transaction.issue_token());
            let remote_end = segment.clone();
            pool.try_execute(Some(carrier), move || {
                std::thread::sleep(Duration::from_millis(10));
                remote_end.end_async();
            })?;
            while !segment.is_ended() {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
            Ok(())
        })
        .await
}

#[tokio::main]
async fn main() -> Result<()> {
    let flags = Flags::parse();
    init_tracing();

    let recorder = Arc::new(MemoryRecorder::default());
    let tracer = Tracer::new(recorder.clone());
    let pool = WorkerPool::build(PoolConfig::new(flags.pool_size))?;

    same_context_fan_out(&tracer, flags.jobs).await?;
    lost_context(&tracer, &pool).await?;
    token_fan_out(&tracer, &pool, flags.jobs).await?;
    segment_with_external(&tracer, &pool).await?;

    pool.shutdown();

    for event in recorder.events() {
        match event {
            spanlink::Event::Segment(segment) => {
                info!(transaction = %segment.transaction, name = %segment.name, duration_ms = segment.duration.as_millis() as u64, external = segment.external.is_some(), "segment");
            },
            spanlink::Event::Transaction(transaction) => {
                info!(transaction = %transaction.transaction, name = %transaction.name, segments = transaction.segments, "transaction");
            },
        }
    }
    Ok(())
}
