// Copyright Andeya Lee 2024
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.
//! In-process trace-context propagation for concurrent programs.
//!
//! One inbound trigger opens a [`Transaction`] — usually by running its
//! handler inside [`Tracer::scope`], which binds the transaction around
//! every poll so sibling tasks sharing a runtime worker thread never
//! observe it. The handler's work decomposes into
//! [`Segment`]s and sub-units spawned onto other tasks, the tokio blocking
//! pool, or a bounded [`pool::WorkerPool`]. On the context that began the
//! transaction, identity is implicit. Across any execution-context boundary
//! it must travel explicitly: as a [`Token`] linked by the callee, or as a
//! [`ContextCarrier`] the scheduler activates automatically, or through the
//! [`spawn_traced`]/[`spawn_blocking_traced`]/[`execute_traced`] combinators
//! that also bracket the spawned work in a call-site-named segment.
//!
//! Forgetting to propagate degrades silently: lookups on the far side
//! resolve to no transaction, work runs unattributed, and nothing crashes.
//! The tracing layer never surfaces its own trouble to business logic; the
//! only scheduling failure it passes through is the application's own
//! resource limit ([`pool::PoolError`]).
//!
//! ```no_run
//! use spanlink::report::MemoryRecorder;
//! use spanlink::Tracer;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() {
//!     let recorder = Arc::new(MemoryRecorder::default());
//!     let tracer = Tracer::new(recorder.clone());
//!
//!     tracer
//!         .scope("GET /hello", async {
//!             let jobs: Vec<_> = (0..3).map(|_| spanlink::spawn_traced(async { /* work */ })).collect();
//!             for job in jobs {
//!                 job.await.unwrap();
//!             }
//!         })
//!         .await;
//!
//!     assert_eq!(recorder.segment_events().len(), 3);
//! }
//! ```

pub mod context;
pub mod pool;
pub mod report;
mod segment;
pub mod spawn;
mod token;
mod tracer;
mod transaction;

pub use context::{ActiveContext, ContextCarrier};
pub use report::{Event, ExternalCall, Recorder};
pub use segment::Segment;
pub use spawn::{execute_traced, instrument, spawn_blocking_traced, spawn_named, spawn_traced, Instrumented};
pub use token::Token;
pub use tracer::{Scoped, Tracer};
pub use transaction::Transaction;
