//! Error types for the worker scheduler core

use std::io;

/// An error raised by script code or by the engine while running it
///
/// Produced at the engine collaborator boundary (`ScriptEngine::call_function`
/// and friends). Inside event processing it is converted into
/// `Worker::broadcast_error` rather than propagated; it never aborts the
/// scheduler loop.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message} ({filename}:{lineno})")]
pub struct ScriptError {
    /// Human-readable error message
    pub message: String,

    /// Script URL or file the error originated from
    pub filename: String,

    /// 1-based line number, 0 when unknown
    pub lineno: u32,
}

impl ScriptError {
    /// Create a new script error
    pub fn new(message: impl Into<String>, filename: impl Into<String>, lineno: u32) -> Self {
        Self {
            message: message.into(),
            filename: filename.into(),
            lineno,
        }
    }
}

/// Errors surfaced to the caller that requested a worker operation
///
/// These are reported to the originating caller, never to the scheduler:
/// a failure local to one event must not abort the owning worker's loop.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    /// The worker's OS thread could not be spawned
    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[from] io::Error),

    /// A shared worker attempted to construct itself as its own child
    #[error("shared worker {url}#{name} cannot attach to itself")]
    RecursiveSharedWorker {
        /// Script URL of the shared worker
        url: String,
        /// Shared worker name
        name: String,
    },

    /// Script evaluation or engine construction failed
    #[error(transparent)]
    Script(#[from] ScriptError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_script_error_display() {
        let err = ScriptError::new("boom", "main.ny", 12);
        assert_eq!(err.to_string(), "boom (main.ny:12)");
    }

    #[test]
    fn test_recursive_shared_worker_display() {
        let err = WorkerError::RecursiveSharedWorker {
            url: "a.ny".to_string(),
            name: "cache".to_string(),
        };
        assert_eq!(err.to_string(), "shared worker a.ny#cache cannot attach to itself");
    }
}
