//! Per-worker event scheduling
//!
//! One ordered queue per worker, serviced by that worker's thread alone.
//! Timers, network completions, and inter-worker messages all arrive as
//! events; `Worker::wait_for` drains them in (trigger time, insertion order)
//! order and is re-entrant so blocking host APIs can nest waits.

mod event;
mod port;
mod queue;
mod registry;
mod timer;
mod worker;

pub use event::{Disposition, Event, EventKind};
pub use port::MessagePort;
pub use queue::EventQueue;
pub use registry::{global_registry, init_global_registry, WorkerRegistry};
pub use timer::{Timer, TimerContext, TimerId, TimerKind, DEFAULT_TIMER_ID_MASK};
pub use worker::{Wait, WaitOutcome, Worker, WorkerKind};
