// Copyright Andeya Lee 2024
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.
//!
//! Entrypoint-facing root of the tracing facility.

use crate::context;
use crate::report::{NoopRecorder, Recorder};
use crate::transaction::Transaction;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

/// Owns the reporting sink and begins transactions.
///
/// An entrypoint dispatcher holds one `Tracer` and brackets every inbound
/// trigger with a root transaction, on the success and failure paths alike:
/// either [`scope`](Tracer::scope) around a handler future, or
/// [`begin`](Tracer::begin)/[`Transaction::end`] on a context it owns
/// outright.
#[derive(Debug, Clone)]
pub struct Tracer {
    recorder: Arc<dyn Recorder>,
}

impl Tracer {
    /// Creates a tracer reporting to the given sink.
    pub fn new(recorder: Arc<dyn Recorder>) -> Self {
        Self { recorder }
    }

    /// Creates a tracer that records nothing.
    pub fn noop() -> Self {
        Self::new(Arc::new(NoopRecorder))
    }

    /// The sink this tracer reports to.
    pub fn recorder(&self) -> Arc<dyn Recorder> {
        self.recorder.clone()
    }

    /// Begins a transaction bound to the calling execution context.
    ///
    /// The binding stays with the calling thread until
    /// [`Transaction::end`], which suits an entrypoint that owns its thread
    /// for the transaction's whole duration: a blocking dispatcher, a
    /// dedicated worker, a current-thread test. A handler running as a task
    /// on a shared multi-threaded runtime must use
    /// [`scope`](Tracer::scope) instead, so sibling tasks interleaving on
    /// the same worker thread between its polls cannot observe the
    /// transaction.
    pub fn begin(&self, name: impl Into<String>) -> Transaction {
        Transaction::begin(name.into(), self.recorder.clone())
    }

    /// Runs `handler` under a new root transaction bound around every poll.
    ///
    /// The transaction is re-established each time the handler resumes and
    /// unbound before its task yields the thread, the same treatment the
    /// spawn combinators give spawned work. It ends exactly once: when the
    /// handler completes, or when the returned future is dropped
    /// (cancellation).
    pub fn scope<F: Future>(&self, name: impl Into<String>, handler: F) -> Scoped<F> {
        Scoped {
            inner: handler,
            closer: TransactionCloser {
                transaction: Transaction::new(name.into(), self.recorder.clone()),
            },
        }
    }
}

/// Ends the root transaction on the first of: handler completion, drop.
#[derive(Debug)]
struct TransactionCloser {
    transaction: Transaction,
}

impl Drop for TransactionCloser {
    fn drop(&mut self) {
        self.transaction.end();
    }
}

pin_project_lite::pin_project! {
    /// A handler future running under its own root transaction.
    ///
    /// Sibling tasks scheduled onto the same runtime worker thread between
    /// this handler's polls never observe the transaction: the ambient
    /// binding exists only while the handler is actually being polled.
    #[derive(Debug)]
    pub struct Scoped<F> {
        #[pin]
        inner: F,
        closer: TransactionCloser,
    }
}

impl<F> Scoped<F> {
    /// The root transaction this handler runs under, e.g. for issuing
    /// tokens before the handler is scheduled.
    pub fn transaction(&self) -> &Transaction {
        &self.closer.transaction
    }
}

impl<F: Future> Future for Scoped<F> {
    type Output = F::Output;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        let poll = {
            let _active = context::bind(&this.closer.transaction);
            this.inner.poll(cx)
        };
        match poll {
            Poll::Ready(output) => {
                this.closer.transaction.end();
                Poll::Ready(output)
            },
            Poll::Pending => Poll::Pending,
        }
    }
}
