// Copyright Andeya Lee 2024
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.
//!
//! The root trace context for one logical unit of work.

use crate::context;
use crate::report::{Event, Recorder, SegmentId, TransactionEvent, TransactionId};
use crate::segment::Segment;
use crate::token::Token;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Instant, SystemTime};

/// The root context one inbound trigger's work is attributed to.
///
/// A transaction is a cheap clonable handle. It is bound to whichever
/// execution context currently holds it in its ambient slot; that binding is
/// mutable and is exactly what [`Token`]s and
/// [`ContextCarrier`](crate::context::ContextCarrier)s manipulate. On the
/// context that began it, identity is implicit; everywhere else it must be
/// carried explicitly.
#[derive(Debug, Clone)]
pub struct Transaction {
    inner: Arc<TransactionInner>,
}

#[derive(Debug)]
struct TransactionInner {
    id: TransactionId,
    name: String,
    recorder: Arc<dyn Recorder>,
    started_at: SystemTime,
    started: Instant,
    ended: AtomicBool,
    /// Segment ids in creation order, collected while active.
    segments: Mutex<Vec<SegmentId>>,
    /// Ambient value displaced when this transaction was bound at begin.
    previous: Mutex<Option<Transaction>>,
}

impl Transaction {
    /// Creates a transaction and binds it to the calling execution context.
    pub(crate) fn begin(name: String, recorder: Arc<dyn Recorder>) -> Self {
        let transaction = Self::new(name, recorder);
        let previous = context::swap(Some(transaction.clone()));
        *transaction.lock_previous() = previous;
        transaction
    }

    /// Creates a transaction without touching the ambient slot. Callers
    /// bind it themselves, e.g. around every poll of a scoped handler.
    pub(crate) fn new(name: String, recorder: Arc<dyn Recorder>) -> Self {
        Self {
            inner: Arc::new(TransactionInner {
                id: TransactionId::next(),
                name,
                recorder,
                started_at: SystemTime::now(),
                started: Instant::now(),
                ended: AtomicBool::new(false),
                segments: Mutex::new(Vec::new()),
                previous: Mutex::new(None),
            }),
        }
    }

    /// Resolves the transaction bound to the calling execution context.
    ///
    /// `None` is a normal, silent outcome meaning tracing is unavailable
    /// here: either nothing was bound, or propagation was skipped when this
    /// context was reached. Work running on the thread that began the
    /// transaction resolves it implicitly, without any token.
    pub fn current() -> Option<Transaction> {
        context::current()
    }

    /// The transaction's identity.
    pub fn id(&self) -> TransactionId {
        self.inner.id
    }

    /// The display name supplied at begin.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Whether [`end`](Transaction::end) has already taken effect.
    pub fn is_ended(&self) -> bool {
        self.inner.ended.load(Ordering::Acquire)
    }

    /// Mints a new live token bound to this transaction, for handing its
    /// identity across an execution-context boundary.
    pub fn issue_token(&self) -> Token {
        Token::new(self.clone())
    }

    /// Opens a segment under this transaction.
    pub fn start_segment(&self, name: impl Into<String>) -> Segment {
        let segment = Segment::start(name.into(), self.inner.id, self.inner.recorder.clone());
        if self.is_ended() {
            tracing::debug!(transaction = %self.inner.id, "segment started on ended transaction");
        } else {
            self.lock_segments().push(segment.id());
        }
        segment
    }

    /// Marks the transaction ended and reports it. Idempotent.
    ///
    /// If the calling context still holds this transaction as its ambient
    /// value, the value displaced at begin is restored, so pooled contexts
    /// fall back to whatever they were doing before.
    pub fn end(&self) {
        if self.inner.ended.swap(true, Ordering::AcqRel) {
            return;
        }
        let segments = self.lock_segments().len();
        self.inner.recorder.record(Event::Transaction(TransactionEvent {
            transaction: self.inner.id,
            name: self.inner.name.clone(),
            started_at: self.inner.started_at,
            duration: self.inner.started.elapsed(),
            segments,
        }));
        let previous = self.lock_previous().take();
        context::restore_if(self, previous);
    }

    fn lock_segments(&self) -> std::sync::MutexGuard<'_, Vec<SegmentId>> {
        self.inner.segments.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_previous(&self) -> std::sync::MutexGuard<'_, Option<Transaction>> {
        self.inner.previous.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
