// Copyright Andeya Lee 2024
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.
//!
//! Leaf timing units within a transaction.

use crate::report::{Event, ExternalCall, Recorder, SegmentEvent, SegmentId, TransactionId};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Instant, SystemTime};

/// A timed sub-span of work within a transaction.
///
/// The handle is cheap to clone and `Send`: a segment opened on one
/// execution context is routinely ended from another, which is the common
/// case when it brackets cross-context work. However many end calls race,
/// exactly one [`SegmentEvent`] reaches the recorder.
#[derive(Debug, Clone)]
pub struct Segment {
    inner: Arc<SegmentInner>,
}

#[derive(Debug)]
struct SegmentInner {
    id: SegmentId,
    name: String,
    transaction: TransactionId,
    recorder: Arc<dyn Recorder>,
    started_at: SystemTime,
    started: Instant,
    ended: AtomicBool,
    external: Mutex<Option<ExternalCall>>,
}

impl Segment {
    pub(crate) fn start(name: String, transaction: TransactionId, recorder: Arc<dyn Recorder>) -> Self {
        Self {
            inner: Arc::new(SegmentInner {
                id: SegmentId::next(),
                name,
                transaction,
                recorder,
                started_at: SystemTime::now(),
                started: Instant::now(),
                ended: AtomicBool::new(false),
                external: Mutex::new(None),
            }),
        }
    }

    /// The segment's identity.
    pub fn id(&self) -> SegmentId {
        self.inner.id
    }

    /// The segment's display name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Whether an end call has already taken effect.
    pub fn is_ended(&self) -> bool {
        self.inner.ended.load(Ordering::Acquire)
    }

    /// Attaches outbound-call metadata to be reported with the end event.
    /// A no-op once the segment has ended.
    pub fn annotate_external(&self, call: ExternalCall) {
        if self.is_ended() {
            tracing::debug!(segment = %self.inner.id, "ignoring external annotation on ended segment");
            return;
        }
        *self.lock_external() = Some(call);
    }

    /// Ends the segment. Idempotent: the second and later calls are no-ops.
    pub fn end(&self) {
        self.finish();
    }

    /// Ends the segment from any execution context.
    ///
    /// Behaviorally identical to [`end`](Segment::end); kept as a distinct
    /// entry point because completing from a context other than the opening
    /// one is part of the public contract, not an accident.
    pub fn end_async(&self) {
        self.finish();
    }

    fn finish(&self) {
        if self.inner.ended.swap(true, Ordering::AcqRel) {
            return;
        }
        let external = self.lock_external().take();
        self.inner.recorder.record(Event::Segment(SegmentEvent {
            transaction: self.inner.transaction,
            segment: self.inner.id,
            name: self.inner.name.clone(),
            started_at: self.inner.started_at,
            duration: self.inner.started.elapsed(),
            external,
        }));
    }

    fn lock_external(&self) -> std::sync::MutexGuard<'_, Option<ExternalCall>> {
        self.inner.external.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
