//! flowvm-core — a durable business-process execution engine.
//!
//! The engine advances process instances over an immutable process graph,
//! persists the execution tree between steps through a unit-of-work store,
//! and resumes asynchronous work (timers, retries, continuations) through a
//! polled job subsystem. See [`engine::Engine`] for the caller surface and
//! [`worker::WorkerPool`] for the background host.

pub mod behavior;
pub mod calendar;
pub mod engine;
pub mod error;
pub mod events;
pub mod graph;
pub mod job;
pub mod store;
pub mod store_memory;
pub mod tree;
pub mod types;
pub mod worker;

pub use engine::{Engine, EngineConfig};
pub use error::{EngineError, Result};
pub use events::{EngineEvent, EngineListener, EventDispatcher, EventKind, RecordingListener};
pub use graph::{GraphBuilder, NodeKind, ProcessGraph};
pub use store::EngineStore;
pub use store_memory::MemoryStore;
pub use types::{Execution, ExecutionId, InstanceId, InstanceState, Job, JobId, JobKind, JobState};
pub use worker::WorkerPool;
