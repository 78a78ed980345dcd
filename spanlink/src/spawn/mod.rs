// Copyright Andeya Lee 2024
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.
//!
//! Instrumented spawning: segment-per-spawn with automatic propagation.
//!
//! These combinators wrap "spawn a concurrent unit of work" so that a
//! segment named after the call site is opened before the work is scheduled,
//! the ambient transaction travels with the work via a [`ContextCarrier`],
//! and the segment is ended exactly once when the work completes, fails, or
//! is cancelled. When no transaction is ambient at the spawn site, the work
//! runs untraced; forgetting propagation is never an error.
//!
//! Propagation is explicit and opt-in at each boundary: work that spawns
//! further sub-units without these combinators gets no automatic segment and
//! no propagation for them.

use crate::context::ContextCarrier;
use crate::pool::{PoolError, WorkerPool};
use crate::segment::Segment;
use crate::transaction::Transaction;
use std::future::Future;
use std::panic::Location;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// Ends a segment exactly once, on the first of: explicit finish, drop.
///
/// Owning the segment through this guard is what makes cancellation safe: a
/// future dropped mid-flight, a panicking closure, and a job discarded by a
/// saturated scheduler all still close their span.
#[derive(Debug)]
pub(crate) struct SegmentCloser {
    segment: Option<Segment>,
}

impl SegmentCloser {
    pub(crate) fn new(segment: Segment) -> Self {
        Self { segment: Some(segment) }
    }

    pub(crate) fn finish(&mut self) {
        if let Some(segment) = self.segment.take() {
            segment.end_async();
        }
    }
}

impl Drop for SegmentCloser {
    fn drop(&mut self) {
        self.finish();
    }
}

#[derive(Debug)]
struct TraceScope {
    carrier: ContextCarrier,
    closer: SegmentCloser,
}

impl TraceScope {
    /// Captures the ambient transaction at the spawn site, if any.
    fn capture(name: String) -> Option<Self> {
        let transaction = Transaction::current()?;
        let segment = transaction.start_segment(name);
        Some(Self {
            carrier: ContextCarrier::new(transaction.issue_token()),
            closer: SegmentCloser::new(segment),
        })
    }
}

pin_project_lite::pin_project! {
    /// A future carrying its originating transaction across the spawn
    /// boundary.
    ///
    /// The carrier is activated around every poll, re-establishing the
    /// context each time the task resumes, on whichever thread that happens
    /// to be. When the trace scope is `None` the inner future runs as-is.
    #[derive(Debug)]
    pub struct Instrumented<F> {
        #[pin]
        inner: F,
        trace: Option<TraceScope>,
    }
}

impl<F: Future> Future for Instrumented<F> {
    type Output = F::Output;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        let _active = this.trace.as_ref().map(|trace| trace.carrier.activate());
        match this.inner.poll(cx) {
            Poll::Ready(output) => {
                if let Some(trace) = this.trace.as_mut() {
                    trace.closer.finish();
                }
                Poll::Ready(output)
            },
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Wraps a future with the ambient transaction and a segment covering its
/// whole lifetime, for handing to any executor. The segment ends when the
/// wrapped future completes or is dropped.
pub fn instrument<F: Future>(name: impl Into<String>, work: F) -> Instrumented<F> {
    let trace = TraceScope::capture(name.into());
    if trace.is_none() {
        tracing::trace!("no ambient transaction at spawn site, running untraced");
    }
    Instrumented { inner: work, trace }
}

/// Spawns `work` onto the tokio runtime under a segment named after the
/// calling source location. See [`spawn_named`].
#[track_caller]
pub fn spawn_traced<F>(work: F) -> JoinHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    spawn_named(call_site_name(Location::caller()), work)
}

/// Spawns `work` onto the tokio runtime under a segment with the given name.
///
/// The ambient transaction at the call site, if any, is re-established
/// inside the spawned task automatically. The segment ends exactly once:
/// on completion, on panic, or when the task is aborted and its future
/// dropped. Without an ambient transaction the work is spawned untraced.
pub fn spawn_named<F>(name: impl Into<String>, work: F) -> JoinHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    tokio::spawn(instrument(name, work))
}

/// Runs blocking `work` on the tokio blocking pool under a segment named
/// after the calling source location, with the ambient transaction
/// re-established around the closure.
#[track_caller]
pub fn spawn_blocking_traced<F, R>(work: F) -> JoinHandle<R>
where
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
{
    match TraceScope::capture(call_site_name(Location::caller())) {
        Some(TraceScope { carrier, mut closer }) => tokio::task::spawn_blocking(move || {
            let _active = carrier.activate();
            let output = work();
            closer.finish();
            output
        }),
        None => tokio::task::spawn_blocking(work),
    }
}

/// Schedules blocking `work` on a [`WorkerPool`] under a segment named after
/// the calling source location, returning a completion receiver.
///
/// The worker activates the attached carrier before the closure and restores
/// the previous ambient value after it. A saturated queue surfaces as
/// [`PoolError`]; the segment opened for the discarded job is still closed.
#[track_caller]
pub fn execute_traced<F, R>(pool: &WorkerPool, work: F) -> Result<oneshot::Receiver<R>, PoolError>
where
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
{
    let trace = TraceScope::capture(call_site_name(Location::caller()));
    let (carrier, mut closer) = match trace {
        Some(TraceScope { carrier, closer }) => (Some(carrier), Some(closer)),
        None => (None, None),
    };
    let (done, receiver) = oneshot::channel();
    pool.try_execute(carrier, move || {
        let output = work();
        if let Some(closer) = closer.as_mut() {
            closer.finish();
        }
        // The caller may have stopped listening; completion is best-effort.
        let _ = done.send(output);
    })?;
    Ok(receiver)
}

/// `(file:line)` of the spawn site, mirroring how externally-instrumented
/// frameworks label anonymous asynchronous work.
fn call_site_name(location: &Location<'_>) -> String {
    let file = location.file().rsplit(['/', '\\']).next().unwrap_or_default();
    format!("({}:{})", file, location.line())
}
