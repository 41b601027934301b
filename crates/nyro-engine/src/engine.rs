//! Script engine collaborator boundary
//!
//! The scheduler core never runs script itself. Everything it needs from the
//! engine is expressed through `ScriptEngine`: invoke a bound callback with
//! arguments, and evaluate a script once at worker startup. Hosts plug in a
//! real engine; tests plug in a recording fake.

use crate::error::ScriptError;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// A value crossing the engine boundary
///
/// The closed set of payload shapes events carry into callbacks. Buffers are
/// owned byte vectors; ownership transfer is explicit (see `Event::Read`).
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// The null value
    Null,

    /// A boolean
    Bool(bool),

    /// A double-precision number
    Number(f64),

    /// A string
    String(String),

    /// An owned binary buffer
    Buffer(Vec<u8>),
}

impl Value {
    /// The string payload, if this value is a string
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// The numeric payload, if this value is a number
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// The buffer payload, if this value is a buffer
    pub fn as_buffer(&self) -> Option<&[u8]> {
        match self {
            Value::Buffer(b) => Some(b),
            _ => None,
        }
    }
}

/// An opaque handle to an engine-owned script function
///
/// The scheduler only ever passes these back to the engine; it attaches no
/// meaning to the raw id beyond identity.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct Callback(u64);

static NEXT_CALLBACK_ID: AtomicU64 = AtomicU64::new(1);

impl Callback {
    /// Allocate a fresh callback handle (engines hand these out)
    pub fn new() -> Self {
        Callback(NEXT_CALLBACK_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Wrap an engine-assigned raw id
    pub fn from_raw(id: u64) -> Self {
        Callback(id)
    }

    /// The raw id the engine assigned
    pub fn as_raw(self) -> u64 {
        self.0
    }
}

impl Default for Callback {
    fn default() -> Self {
        Self::new()
    }
}

/// The engine collaborator consumed by the scheduler core
///
/// `call_function` runs synchronously on the calling worker's own thread,
/// inside `Event::process`. Re-entrant calls back into the worker's public
/// API from within a callback are expected and legal.
pub trait ScriptEngine: Send + Sync {
    /// Invoke a bound script function with the given arguments
    fn call_function(&self, target: &Callback, args: &[Value]) -> Result<Value, ScriptError>;

    /// Load and evaluate a script; used once, at worker startup
    fn evaluate_script(&self, url: &str) -> Result<(), ScriptError>;

    /// Check a script for syntax errors without running it
    fn check_syntax(&self, _source: &str) -> Result<(), ScriptError> {
        Ok(())
    }
}

/// Builds a per-thread engine instance for spawned workers
///
/// Dedicated and shared workers own their engine; it is created on the
/// worker's thread before the startup script is evaluated.
pub trait EngineFactory: Send + Sync {
    /// Create a fresh engine for one worker thread
    fn create_engine(&self) -> Result<Arc<dyn ScriptEngine>, ScriptError>;
}

/// A no-op engine: every call succeeds and returns null
///
/// Used as a default for hosts that drive workers purely with native events,
/// and by tests that do not care about callback side effects.
pub struct NoopEngine;

impl ScriptEngine for NoopEngine {
    fn call_function(&self, _target: &Callback, _args: &[Value]) -> Result<Value, ScriptError> {
        Ok(Value::Null)
    }

    fn evaluate_script(&self, _url: &str) -> Result<(), ScriptError> {
        Ok(())
    }
}

/// Factory producing `NoopEngine` instances
pub struct NoopEngineFactory;

impl EngineFactory for NoopEngineFactory {
    fn create_engine(&self) -> Result<Arc<dyn ScriptEngine>, ScriptError> {
        Ok(Arc::new(NoopEngine))
    }
}
