//! Nyro host concurrency core
//!
//! This crate is the concurrency core of the Nyro embedding host: a
//! per-worker, single-threaded-cooperative event scheduler. Each worker owns
//! one ordered event queue, one timer registry, and the message ports it
//! participates in; dedicated and shared workers additionally own the OS
//! thread that services their queue. The script engine itself is a
//! collaborator behind the [`engine::ScriptEngine`] trait.
//!
//! # Example
//!
//! ```rust,ignore
//! use nyro_engine::{NoopEngineFactory, Wait, WorkerRegistry};
//! use std::sync::Arc;
//!
//! let registry = WorkerRegistry::new(Arc::new(NoopEngineFactory));
//! let root = registry.create_root(Arc::new(nyro_engine::NoopEngine), "main.ny");
//! let (child, port) = registry.spawn_dedicated(&root, "child.ny").unwrap();
//!
//! // Drive the root worker from the host thread
//! root.wait_for(Wait::from_millis(10), None);
//! registry.terminate_all();
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

/// Engine collaborator boundary: values, callbacks, and the engine traits
pub mod engine;

/// Error taxonomy
pub mod error;

/// Workers, events, timers, ports, and the registry
pub mod scheduler;

pub use engine::{Callback, EngineFactory, NoopEngine, NoopEngineFactory, ScriptEngine, Value};
pub use error::{ScriptError, WorkerError};
pub use scheduler::{
    global_registry, init_global_registry, Disposition, Event, EventKind, EventQueue, MessagePort,
    Timer, TimerContext, TimerId, TimerKind, Wait, WaitOutcome, Worker, WorkerKind,
    WorkerRegistry, DEFAULT_TIMER_ID_MASK,
};
