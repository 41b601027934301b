//! Event variants and the process/discard contract
//!
//! An event is one unit of deferred work: a closed, tagged variant carrying
//! its kind-specific payload. Processing invokes the bound callback through
//! the engine collaborator; discarding releases owned payload without
//! invoking anything. Some kinds are self-rescheduling and report
//! `Disposition::Continue` instead of ending their life.

use crate::engine::{Callback, ScriptEngine, Value};
use crate::scheduler::{TimerId, TimerKind, Worker};
use std::time::SystemTime;

/// Kind tag of an event, for matchers and predicates
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum EventKind {
    /// Timer fire
    Timer,
    /// Cross-worker message delivery
    Message,
    /// Error report delivery
    Error,
    /// Generic ready completion
    Completion,
    /// Buffer delivery with ownership transfer
    Read,
    /// Paginated directory scan page
    DirScan,
}

/// What became of a processed event
pub enum Disposition {
    /// The event's life ended; its payload was consumed or released
    Completed,

    /// Re-insert the same event into the owning queue at a new trigger time
    ///
    /// Interval timers continue at `previous_trigger + period` (never
    /// `now + period`, to avoid drift); paginated scans continue while more
    /// pages remain.
    Continue {
        /// The event to re-queue
        event: Event,
        /// Its next trigger time
        at: SystemTime,
    },
}

/// One unit of deferred work
#[derive(Debug)]
pub enum Event {
    /// Fire (or discard, if cleared) the timer registered under `id`
    Timer {
        /// Registry id in the owning worker's timer context
        id: TimerId,
    },

    /// Deliver a message posted through a port
    Message {
        /// Callback bound on the receiving port end
        target: Callback,
        /// The posted payload
        data: Value,
    },

    /// Deliver an error report posted through an error port
    Error {
        /// Error handler bound on the receiving port end
        target: Callback,
        /// Error message
        message: String,
        /// Originating script URL or file
        filename: String,
        /// Originating line number
        lineno: u32,
    },

    /// A generic ready completion from an external producer
    ///
    /// Socket data, an accepted connection, a watch notification: producers
    /// construct one of these with trigger time "now".
    Completion {
        /// Callback to invoke
        target: Callback,
        /// Completion arguments
        args: Vec<Value>,
    },

    /// Deliver an owned buffer, transferring ownership to the callback
    ///
    /// Two-path ownership: on process, the buffer moves out of the event
    /// into the callback's `Value::Buffer` argument and the slot is left
    /// empty; on discard without process, the event itself frees the buffer.
    Read {
        /// Callback receiving the buffer
        target: Callback,
        /// The owned buffer; `None` once ownership has transferred
        buffer: Option<Vec<u8>>,
    },

    /// Deliver one page of a directory scan, continuing while pages remain
    DirScan {
        /// Callback receiving each page
        target: Callback,
        /// Full entry listing being paged out
        entries: Vec<String>,
        /// Index of the first entry not yet delivered
        cursor: usize,
        /// Entries per page
        page_size: usize,
    },
}

impl Event {
    /// The event's kind tag
    pub fn kind(&self) -> EventKind {
        match self {
            Event::Timer { .. } => EventKind::Timer,
            Event::Message { .. } => EventKind::Message,
            Event::Error { .. } => EventKind::Error,
            Event::Completion { .. } => EventKind::Completion,
            Event::Read { .. } => EventKind::Read,
            Event::DirScan { .. } => EventKind::DirScan,
        }
    }

    /// The timer id this event would fire, if it is a timer event
    pub fn timer_id(&self) -> Option<TimerId> {
        match self {
            Event::Timer { id } => Some(*id),
            _ => None,
        }
    }

    /// Invoke the bound callback with kind-specific arguments
    ///
    /// Runs on the owning worker's thread with no scheduler lock held; the
    /// callback may re-enter the worker's API. A `ScriptError` from the
    /// engine is converted into `Worker::broadcast_error` and never escapes.
    /// `trigger` is the time this event was scheduled for, which
    /// self-rescheduling kinds use as the base of their next trigger.
    pub fn process(
        self,
        trigger: SystemTime,
        engine: &dyn ScriptEngine,
        worker: &Worker,
    ) -> Disposition {
        match self {
            Event::Timer { id } => Self::process_timer(id, trigger, engine, worker),

            Event::Message { target, data } => {
                if let Err(err) = engine.call_function(&target, &[data]) {
                    worker.broadcast_error(&err.message, &err.filename, err.lineno);
                }
                Disposition::Completed
            }

            Event::Error {
                target,
                message,
                filename,
                lineno,
            } => {
                // An error handler that itself throws is dropped; re-broadcasting
                // here could bounce between two workers forever.
                let args = [
                    Value::String(message),
                    Value::String(filename),
                    Value::Number(lineno as f64),
                ];
                let _ = engine.call_function(&target, &args);
                Disposition::Completed
            }

            Event::Completion { target, args } => {
                if let Err(err) = engine.call_function(&target, &args) {
                    worker.broadcast_error(&err.message, &err.filename, err.lineno);
                }
                Disposition::Completed
            }

            Event::Read { target, mut buffer } => {
                // Ownership transfer: the buffer moves into the callback's
                // argument and the event's slot is left empty.
                let Some(data) = buffer.take() else {
                    return Disposition::Completed;
                };
                if let Err(err) = engine.call_function(&target, &[Value::Buffer(data)]) {
                    worker.broadcast_error(&err.message, &err.filename, err.lineno);
                }
                Disposition::Completed
            }

            Event::DirScan {
                target,
                entries,
                cursor,
                page_size,
            } => {
                // Clamp both bounds; a cursor past the end must degrade to an
                // empty final page, never a panic that aborts the loop.
                let start = cursor.min(entries.len());
                let end = entries.len().min(start + page_size.max(1));
                let page: Vec<Value> = entries[start..end]
                    .iter()
                    .map(|name| Value::String(name.clone()))
                    .collect();
                if let Err(err) = engine.call_function(&target, &page) {
                    worker.broadcast_error(&err.message, &err.filename, err.lineno);
                }
                if end < entries.len() {
                    Disposition::Continue {
                        event: Event::DirScan {
                            target,
                            entries,
                            cursor: end,
                            page_size,
                        },
                        at: SystemTime::now(),
                    }
                } else {
                    Disposition::Completed
                }
            }
        }
    }

    fn process_timer(
        id: TimerId,
        trigger: SystemTime,
        engine: &dyn ScriptEngine,
        worker: &Worker,
    ) -> Disposition {
        // Snapshot under the worker lock, call with no lock held.
        let Some((kind, target, args)) = worker.timer_snapshot(id) else {
            return Disposition::Completed;
        };

        if kind.is_cleared() {
            // Cancel won the race: plain discard, frees the timer entry.
            worker.release_timer(id);
            return Disposition::Completed;
        }

        if let Err(err) = engine.call_function(&target, &args) {
            worker.broadcast_error(&err.message, &err.filename, err.lineno);
        }

        // The callback may have cleared this very timer; re-read before
        // deciding between re-arm and release.
        match worker.timer_snapshot(id) {
            Some((TimerKind::Interval(period), _, _)) => Disposition::Continue {
                event: Event::Timer { id },
                at: trigger + period,
            },
            Some(_) => {
                worker.release_timer(id);
                Disposition::Completed
            }
            None => Disposition::Completed,
        }
    }

    /// Release owned payload without invoking any callback
    ///
    /// Discarding a timer event frees its registry entry; this is the only
    /// path that ever frees a timer.
    pub fn discard(self, worker: &Worker) {
        match self {
            Event::Timer { id } => {
                worker.release_timer(id);
            }
            // Remaining kinds own plain values; dropping them releases
            // everything, including an untransferred Read buffer.
            Event::Message { .. }
            | Event::Error { .. }
            | Event::Completion { .. }
            | Event::Read { .. }
            | Event::DirScan { .. } => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::NoopEngine;
    use crate::error::ScriptError;
    use parking_lot::Mutex;
    use std::sync::Arc;

    /// Engine that records every call it receives
    struct RecordingEngine {
        calls: Mutex<Vec<(Callback, Vec<Value>)>>,
    }

    impl RecordingEngine {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                calls: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> Vec<(Callback, Vec<Value>)> {
            self.calls.lock().clone()
        }
    }

    impl ScriptEngine for RecordingEngine {
        fn call_function(&self, target: &Callback, args: &[Value]) -> Result<Value, ScriptError> {
            self.calls.lock().push((*target, args.to_vec()));
            Ok(Value::Null)
        }

        fn evaluate_script(&self, _url: &str) -> Result<(), ScriptError> {
            Ok(())
        }
    }

    fn test_worker() -> Arc<Worker> {
        Worker::create_root(Arc::new(NoopEngine), "test.ny")
    }

    #[test]
    fn test_message_invokes_target_with_data() {
        let engine = RecordingEngine::new();
        let worker = test_worker();
        let target = Callback::new();

        let event = Event::Message {
            target,
            data: Value::String("hello".to_string()),
        };
        let disposition = event.process(SystemTime::now(), engine.as_ref(), &worker);
        assert!(matches!(disposition, Disposition::Completed));

        let calls = engine.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, target);
        assert_eq!(calls[0].1, vec![Value::String("hello".to_string())]);
    }

    #[test]
    fn test_read_transfers_buffer_ownership() {
        let engine = RecordingEngine::new();
        let worker = test_worker();

        let event = Event::Read {
            target: Callback::new(),
            buffer: Some(vec![0xde, 0xad]),
        };
        event.process(SystemTime::now(), engine.as_ref(), &worker);

        let calls = engine.calls();
        assert_eq!(calls[0].1, vec![Value::Buffer(vec![0xde, 0xad])]);
    }

    #[test]
    fn test_read_discard_frees_buffer_without_callback() {
        let engine = RecordingEngine::new();
        let worker = test_worker();

        let event = Event::Read {
            target: Callback::new(),
            buffer: Some(vec![1, 2, 3]),
        };
        event.discard(&worker);
        assert!(engine.calls().is_empty());
    }

    #[test]
    fn test_dir_scan_continues_until_exhausted() {
        let engine = RecordingEngine::new();
        let worker = test_worker();
        let entries: Vec<String> = (0..5).map(|i| format!("file{i}")).collect();

        let mut event = Event::DirScan {
            target: Callback::new(),
            entries,
            cursor: 0,
            page_size: 2,
        };

        let mut pages = 0;
        loop {
            pages += 1;
            match event.process(SystemTime::now(), engine.as_ref(), &worker) {
                Disposition::Continue { event: next, .. } => event = next,
                Disposition::Completed => break,
            }
        }

        // 5 entries at 2 per page: 3 pages
        assert_eq!(pages, 3);
        let calls = engine.calls();
        assert_eq!(calls.len(), 3);
        assert_eq!(calls[0].1.len(), 2);
        assert_eq!(calls[2].1.len(), 1);
        assert_eq!(calls[2].1[0], Value::String("file4".to_string()));
    }

    #[test]
    fn test_dir_scan_cursor_past_end_completes_without_panic() {
        let engine = RecordingEngine::new();
        let worker = test_worker();

        let event = Event::DirScan {
            target: Callback::new(),
            entries: vec!["only".to_string()],
            cursor: 5,
            page_size: 2,
        };
        let disposition = event.process(SystemTime::now(), engine.as_ref(), &worker);
        assert!(matches!(disposition, Disposition::Completed));

        // Delivered as one empty final page
        let calls = engine.calls();
        assert_eq!(calls.len(), 1);
        assert!(calls[0].1.is_empty());
    }

    #[test]
    fn test_unknown_timer_id_completes_quietly() {
        let engine = RecordingEngine::new();
        let worker = test_worker();

        // A timer event whose registry entry is long gone
        let stale = {
            let id = worker
                .set_timeout(Callback::new(), Vec::new(), std::time::Duration::ZERO)
                .unwrap();
            worker.release_timer(id);
            Event::Timer { id }
        };
        let disposition = stale.process(SystemTime::now(), engine.as_ref(), &worker);
        assert!(matches!(disposition, Disposition::Completed));
        assert!(engine.calls().is_empty());
    }
}
