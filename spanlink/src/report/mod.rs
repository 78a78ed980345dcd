// Copyright Andeya Lee 2024
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.
//!
//! Reporting sink boundary.
//!
//! The tracing core emits completed spans as [`Event`]s through the
//! fire-and-forget [`Recorder`] contract. Retry, batching, and transport to a
//! remote collector are the sink's concern, not this crate's.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, SystemTime};
use tokio::sync::mpsc;

static TRANSACTION_ID: AtomicU64 = AtomicU64::new(0);
static SEGMENT_ID: AtomicU64 = AtomicU64::new(0);

/// Process-unique identity of a transaction.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct TransactionId(u64);

impl TransactionId {
    pub(crate) fn next() -> Self {
        TransactionId(TRANSACTION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Process-unique identity of a segment.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct SegmentId(u64);

impl SegmentId {
    pub(crate) fn next() -> Self {
        SegmentId(SEGMENT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for SegmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Metadata describing an outbound call performed inside a segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalCall {
    /// Client library that performed the call.
    pub library: String,
    /// Target endpoint.
    pub uri: String,
    /// Remote operation name.
    pub procedure: String,
}

impl ExternalCall {
    /// Starts building the annotation from the client library name.
    pub fn library(library: impl Into<String>) -> Self {
        Self {
            library: library.into(),
            uri: String::new(),
            procedure: String::new(),
        }
    }

    /// Set the target endpoint.
    pub fn uri(mut self, uri: impl Into<String>) -> Self {
        self.uri = uri.into();
        self
    }

    /// Set the remote operation name.
    pub fn procedure(mut self, procedure: impl Into<String>) -> Self {
        self.procedure = procedure.into();
        self
    }
}

/// A completed segment, emitted exactly once per segment.
#[derive(Debug, Clone)]
pub struct SegmentEvent {
    /// Owning transaction.
    pub transaction: TransactionId,
    /// The segment itself.
    pub segment: SegmentId,
    /// Display name, from the call site or caller-supplied.
    pub name: String,
    /// Wall-clock start.
    pub started_at: SystemTime,
    /// Time between start and the first effective end call.
    pub duration: Duration,
    /// Outbound-call annotation, when attached before the end.
    pub external: Option<ExternalCall>,
}

/// A completed transaction, emitted exactly once per transaction.
#[derive(Debug, Clone)]
pub struct TransactionEvent {
    /// The transaction.
    pub transaction: TransactionId,
    /// Display name supplied at begin.
    pub name: String,
    /// Wall-clock start.
    pub started_at: SystemTime,
    /// Time between begin and end.
    pub duration: Duration,
    /// Number of segments started under this transaction while active.
    pub segments: usize,
}

/// Everything the core reports to a sink.
#[derive(Debug, Clone)]
pub enum Event {
    /// A segment completed.
    Segment(SegmentEvent),
    /// A transaction completed.
    Transaction(TransactionEvent),
}

/// [`Recorder`] is the contract between the tracing core and a reporting sink.
///
/// `record` must not block and must not fail: a sink that cannot accept an
/// event drops it. The tracing layer never surfaces sink trouble to the
/// business code it observes.
pub trait Recorder: Send + Sync + 'static {
    /// Consume one completed-span event.
    fn record(&self, event: Event);
}

impl fmt::Debug for dyn Recorder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Recorder")
    }
}

/// Sink that discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopRecorder;

impl Recorder for NoopRecorder {
    fn record(&self, _: Event) {}
}

/// In-memory sink preserving record order. Intended for tests and demos.
#[derive(Debug, Default)]
pub struct MemoryRecorder {
    events: Mutex<Vec<Event>>,
}

impl MemoryRecorder {
    /// All recorded events, in record order.
    pub fn events(&self) -> Vec<Event> {
        self.lock().clone()
    }

    /// Recorded segment events only, in record order.
    pub fn segment_events(&self) -> Vec<SegmentEvent> {
        self.lock()
            .iter()
            .filter_map(|event| match event {
                Event::Segment(event) => Some(event.clone()),
                Event::Transaction(_) => None,
            })
            .collect()
    }

    /// Recorded transaction events only, in record order.
    pub fn transaction_events(&self) -> Vec<TransactionEvent> {
        self.lock()
            .iter()
            .filter_map(|event| match event {
                Event::Transaction(event) => Some(event.clone()),
                Event::Segment(_) => None,
            })
            .collect()
    }

    /// Drop everything recorded so far.
    pub fn clear(&self) {
        self.lock().clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Event>> {
        self.events.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Recorder for MemoryRecorder {
    fn record(&self, event: Event) {
        self.lock().push(event);
    }
}

/// Sink that forwards events over a bounded channel to an external drain.
///
/// When the drain falls behind and the channel fills up, the event is dropped
/// and noted at debug level. Tracing must never apply backpressure to the
/// code it observes.
#[derive(Debug, Clone)]
pub struct ChannelRecorder {
    sender: mpsc::Sender<Event>,
}

impl ChannelRecorder {
    /// Default channel capacity, used when zero is given.
    pub const DEFAULT_CAPACITY: usize = 256;

    /// Creates the recorder and the receiving end for the drain.
    /// Zero capacity means [`Self::DEFAULT_CAPACITY`].
    pub fn bounded(capacity: usize) -> (Self, mpsc::Receiver<Event>) {
        let capacity = if capacity == 0 { Self::DEFAULT_CAPACITY } else { capacity };
        let (sender, receiver) = mpsc::channel(capacity);
        (Self { sender }, receiver)
    }
}

impl Recorder for ChannelRecorder {
    fn record(&self, event: Event) {
        if let Err(err) = self.sender.try_send(event) {
            tracing::debug!("dropping trace event, drain unavailable: {err}");
        }
    }
}
