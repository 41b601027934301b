//! Two-ended message channel between workers
//!
//! A port has an asymmetric "outside" and "inside" end, each independently
//! closable. Posting toward a closed or absent peer is an expected no-op,
//! not an error. The port drops its internal worker references the instant
//! the second distinct end closes; a unidirectional port is born with its
//! outside end permanently closed.

use crate::engine::{Callback, Value};
use crate::scheduler::{Event, Worker};
use parking_lot::Mutex;
use std::sync::Arc;

/// One end of a port
struct PortEnd {
    /// Worker owning this end; None once the end has closed (or never existed)
    worker: Option<Arc<Worker>>,

    /// Set when this end has been closed
    closing: bool,

    /// Callback invoked for traffic arriving at this end
    target: Option<Callback>,
}

impl PortEnd {
    fn open(worker: &Arc<Worker>) -> Self {
        Self {
            worker: Some(Arc::clone(worker)),
            closing: false,
            target: None,
        }
    }

    /// An end that was never open (the outside of a unidirectional port)
    fn absent() -> Self {
        Self {
            worker: None,
            closing: true,
            target: None,
        }
    }

    fn owned_by(&self, worker: &Worker) -> bool {
        self.worker
            .as_ref()
            .is_some_and(|w| std::ptr::eq(Arc::as_ptr(w), worker))
    }
}

struct PortState {
    outside: PortEnd,
    inside: PortEnd,
}

/// A two-ended (or one-ended) channel connecting workers
pub struct MessagePort {
    state: Mutex<PortState>,
}

impl MessagePort {
    /// Create a bidirectional port between two workers
    pub fn connected(outside: &Arc<Worker>, inside: &Arc<Worker>) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(PortState {
                outside: PortEnd::open(outside),
                inside: PortEnd::open(inside),
            }),
        })
    }

    /// Create a unidirectional port: a live inside end only
    pub fn unidirectional(inside: &Arc<Worker>) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(PortState {
                outside: PortEnd::absent(),
                inside: PortEnd::open(inside),
            }),
        })
    }

    /// Bind the callback invoked for traffic arriving at `worker`'s end
    ///
    /// No-op if `worker` owns neither end or its end has closed.
    pub fn bind_target(&self, worker: &Worker, target: Callback) {
        let mut state = self.state.lock();
        if state.outside.owned_by(worker) {
            state.outside.target = Some(target);
        } else if state.inside.owned_by(worker) {
            state.inside.target = Some(target);
        }
    }

    /// Close the end owned by `worker`
    ///
    /// Resolves the end by worker identity (the ends are asymmetric), drops
    /// that end's worker reference, and marks it closed. Idempotent per end.
    /// Returns true once both ends are closed, at which point the port holds
    /// no worker references at all.
    pub fn close(&self, worker: &Worker) -> bool {
        // Dropped outside the lock: releasing the last Arc to a worker runs
        // its shutdown, which walks its own port list.
        let released;
        let fully_closed;
        {
            let mut state = self.state.lock();
            released = if state.outside.owned_by(worker) {
                state.outside.closing = true;
                state.outside.target = None;
                state.outside.worker.take()
            } else if state.inside.owned_by(worker) {
                state.inside.closing = true;
                state.inside.target = None;
                state.inside.worker.take()
            } else {
                None
            };
            fully_closed = state.outside.closing && state.inside.closing;
        }
        drop(released);
        fully_closed
    }

    /// The peer of `worker`'s end, or None if the peer is closed or absent
    ///
    /// The returned handle is transient; the port itself keeps no claim on
    /// it once both ends close.
    pub fn other(&self, worker: &Worker) -> Option<Arc<Worker>> {
        let state = self.state.lock();
        let peer = if state.outside.owned_by(worker) {
            &state.inside
        } else if state.inside.owned_by(worker) {
            &state.outside
        } else {
            return None;
        };
        if peer.closing {
            return None;
        }
        peer.worker.clone()
    }

    /// Whether `worker` owns the outside end of this port
    pub fn is_outside(&self, worker: &Worker) -> bool {
        self.state.lock().outside.owned_by(worker)
    }

    /// Whether both ends have closed
    pub fn is_fully_closed(&self) -> bool {
        let state = self.state.lock();
        state.outside.closing && state.inside.closing
    }

    /// Post a message toward `target`'s end
    ///
    /// Silently dropped when that end is closed, absent, or has no bound
    /// callback; messages to a closed peer are expected, not exceptional.
    /// Returns whether the message was enqueued.
    pub fn post_message(&self, target: &Arc<Worker>, data: Value) -> bool {
        let Some(callback) = self.deliverable_target(target) else {
            return false;
        };
        target.queue_event(Event::Message {
            target: callback,
            data,
        });
        true
    }

    /// Post an error report toward `target`'s end
    ///
    /// Same drop semantics as `post_message`. Returns whether the report was
    /// enqueued, which error broadcast uses to decide whether to walk up the
    /// dedicated-parent chain.
    pub fn post_error(&self, target: &Arc<Worker>, message: &str, filename: &str, lineno: u32) -> bool {
        let Some(callback) = self.deliverable_target(target) else {
            return false;
        };
        target.queue_event(Event::Error {
            target: callback,
            message: message.to_string(),
            filename: filename.to_string(),
            lineno,
        });
        true
    }

    /// The bound callback of `target`'s end, if that end can receive
    fn deliverable_target(&self, target: &Arc<Worker>) -> Option<Callback> {
        let state = self.state.lock();
        let end = if state.outside.owned_by(target) {
            &state.outside
        } else if state.inside.owned_by(target) {
            &state.inside
        } else {
            return None;
        };
        if end.closing {
            return None;
        }
        end.target
    }
}
