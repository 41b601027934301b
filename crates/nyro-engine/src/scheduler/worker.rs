//! Worker: one event queue, one timer registry, one servicing thread
//!
//! A worker serializes timers, completions, and inter-worker messages into
//! one ordered queue and drives them by invoking bound script callbacks.
//! Root workers are passive and serviced by the host; dedicated and shared
//! workers own an OS thread that runs the schedule loop. `wait_for` is the
//! scheduler core: it may be entered recursively on the owning thread, which
//! is how synchronous host APIs are faked on top of the async event model.

use crate::engine::{Callback, ScriptEngine, Value};
use crate::scheduler::{Disposition, Event, EventQueue, MessagePort, Timer, TimerContext, TimerId, TimerKind};
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant, SystemTime};

/// Worker kind
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum WorkerKind {
    /// Passive worker hosted in an existing thread; serviced only when the
    /// host explicitly drives it
    Root,

    /// Child of exactly one parent; terminated when its parent terminates
    Dedicated,

    /// Looked up by (url, name); independent lifetime, multiple attachers
    Shared,
}

/// Wait budget for one `wait_for` call
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Wait {
    /// Drain only currently-due events; never block
    Poll,

    /// Block up to the given duration
    For(Duration),

    /// Block until terminated, matched, or exited
    Indefinitely,
}

impl Wait {
    /// Millisecond convention of the host API: negative means indefinite,
    /// zero means poll, positive is a bounded wait
    pub fn from_millis(ms: i64) -> Self {
        match ms {
            ms if ms < 0 => Wait::Indefinitely,
            0 => Wait::Poll,
            ms => Wait::For(Duration::from_millis(ms as u64)),
        }
    }
}

/// Outcome of one `wait_for` call
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The worker's closing flag was observed
    Terminated,

    /// The budget elapsed (or, for `Poll`, the due events were drained, or
    /// the call was exited via `exit_wait`)
    TimedOut,

    /// An event satisfying the matcher was processed
    Matched,
}

/// State guarded by the worker's single short-held lock
///
/// The lock is never held while an event processes; re-entrant calls into
/// the worker's API from inside a callback are expected and legal.
struct WorkerState {
    queue: EventQueue,
    timers: TimerContext,
    message_ports: Vec<Arc<MessagePort>>,
    error_ports: Vec<Arc<MessagePort>>,
}

/// An execution unit owning one event queue and, except for root, one thread
pub struct Worker {
    kind: WorkerKind,
    url: String,
    name: Option<String>,

    /// Parent of a dedicated worker; unset for root and shared
    parent: Mutex<Option<Weak<Worker>>>,

    /// The engine servicing callbacks; spawned workers set this from their
    /// own thread before evaluating the startup script
    engine: Mutex<Option<Arc<dyn ScriptEngine>>>,

    state: Mutex<WorkerState>,
    wake: Condvar,

    /// Set by `terminate`, observed at the top of the wait loop
    closing: AtomicBool,

    /// Set by `exit_wait`; consumed by the innermost active `wait_for`
    exit_requested: AtomicBool,

    /// Depth of nested `wait_for` calls on the owning thread
    wait_depth: AtomicUsize,

    /// Total nanoseconds spent blocked inside `wait_for`
    idle_nanos: AtomicU64,

    /// One-shot latch for the shutdown sequence
    shutdown_done: AtomicBool,

    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Worker {
    /// Create a root worker hosted by the calling thread
    ///
    /// Root workers accumulate events and run them only when the host drives
    /// `wait_for` (or `run`); the host is also responsible for calling
    /// `shutdown` when done.
    pub fn create_root(engine: Arc<dyn ScriptEngine>, url: impl Into<String>) -> Arc<Self> {
        Self::detached(WorkerKind::Root, url.into(), None, Some(engine))
    }

    /// Create a worker without a thread; the registry spawns and wires it
    pub(crate) fn detached(
        kind: WorkerKind,
        url: String,
        name: Option<String>,
        engine: Option<Arc<dyn ScriptEngine>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            kind,
            url,
            name,
            parent: Mutex::new(None),
            engine: Mutex::new(engine),
            state: Mutex::new(WorkerState {
                queue: EventQueue::new(),
                timers: TimerContext::new(),
                message_ports: Vec::new(),
                error_ports: Vec::new(),
            }),
            wake: Condvar::new(),
            closing: AtomicBool::new(false),
            exit_requested: AtomicBool::new(false),
            wait_depth: AtomicUsize::new(0),
            idle_nanos: AtomicU64::new(0),
            shutdown_done: AtomicBool::new(false),
            thread: Mutex::new(None),
        })
    }

    /// This worker's kind
    pub fn kind(&self) -> WorkerKind {
        self.kind
    }

    /// Script URL this worker was created for
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Shared-worker name, if any
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Parent of a dedicated worker
    pub fn parent(&self) -> Option<Arc<Worker>> {
        self.parent.lock().as_ref().and_then(Weak::upgrade)
    }

    pub(crate) fn set_parent(&self, parent: &Arc<Worker>) {
        *self.parent.lock() = Some(Arc::downgrade(parent));
    }

    /// The engine currently servicing this worker's callbacks
    pub fn engine(&self) -> Option<Arc<dyn ScriptEngine>> {
        self.engine.lock().clone()
    }

    pub(crate) fn set_engine(&self, engine: Arc<dyn ScriptEngine>) {
        *self.engine.lock() = Some(engine);
    }

    pub(crate) fn set_thread(&self, handle: JoinHandle<()>) {
        *self.thread.lock() = Some(handle);
    }

    /// Whether termination has been requested
    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    /// Number of queued events not yet run
    pub fn pending_events(&self) -> usize {
        self.state.lock().queue.len()
    }

    /// Total time this worker has spent blocked waiting for work
    pub fn idle_time(&self) -> Duration {
        Duration::from_nanos(self.idle_nanos.load(Ordering::Relaxed))
    }

    /// Request termination; idempotent, callable from any thread
    ///
    /// Wakes a blocked `wait_for`. An event already mid-process finishes
    /// before the closing flag takes effect.
    pub fn terminate(&self) {
        self.closing.store(true, Ordering::Release);
        // Notify under the lock: the store must not land between a waiter's
        // under-lock re-check and its park, or the wakeup is lost and an
        // indefinite wait never observes the flag.
        let _state = self.state.lock();
        self.wake.notify_all();
    }

    /// Terminate and join the worker's thread, with a bounded wait
    pub fn terminate_and_join(&self) {
        self.terminate();

        if let Some(handle) = self.thread.lock().take() {
            if handle.thread().id() == std::thread::current().id() {
                // A worker cannot join itself; the loop exit runs shutdown.
                return;
            }
            let start = Instant::now();
            let timeout = Duration::from_secs(2);
            loop {
                if handle.is_finished() {
                    let _ = handle.join();
                    return;
                }
                if start.elapsed() > timeout {
                    drop(handle);
                    return;
                }
                std::thread::sleep(Duration::from_millis(5));
            }
        }
    }

    /// Make the innermost currently-active `wait_for` return early
    ///
    /// The call returns as soon as the event currently processing (if any)
    /// completes, without waiting out the remaining budget or draining
    /// further due events. Outer nested calls are unaffected.
    pub fn exit_wait(&self) {
        self.exit_requested.store(true, Ordering::Release);
        // Same lost-wakeup discipline as `terminate`.
        let _state = self.state.lock();
        self.wake.notify_all();
    }

    /// Enqueue an event with trigger time "now"
    pub fn queue_event(&self, event: Event) {
        self.queue_event_at(event, SystemTime::now());
    }

    /// Enqueue an event at an absolute trigger time; thread-safe
    ///
    /// Preserves (trigger time, insertion order) ordering and wakes a
    /// blocked `wait_for`. Events queued after shutdown are discarded.
    pub fn queue_event_at(&self, event: Event, at: SystemTime) {
        if self.shutdown_done.load(Ordering::Acquire) {
            event.discard(self);
            return;
        }
        {
            let mut state = self.state.lock();
            state.queue.push(event, at);
        }
        self.wake.notify_all();
    }

    /// Wait for and run events, the scheduler core
    ///
    /// Runs each due event in (trigger, insertion) order with the lock
    /// released across processing, blocking between events per the budget.
    /// A matcher turns this into a synchronous wait: due events keep running
    /// in order, and the call stops as soon as one the matcher accepts has
    /// been processed. May be called recursively on the owning thread from
    /// inside a callback.
    pub fn wait_for(&self, wait: Wait, matcher: Option<&dyn Fn(&Event) -> bool>) -> WaitOutcome {
        self.wait_depth.fetch_add(1, Ordering::AcqRel);
        let deadline = match wait {
            Wait::For(d) => Some(Instant::now() + d),
            _ => None,
        };

        let mut outcome = WaitOutcome::TimedOut;
        loop {
            if self.closing.load(Ordering::Acquire) {
                break;
            }
            if self.exit_requested.load(Ordering::Acquire) {
                break;
            }

            let due = {
                let mut state = self.state.lock();
                state.queue.pop_due(SystemTime::now())
            };

            if let Some((event, trigger)) = due {
                let matched = matcher.is_some_and(|m| m(&event));
                self.dispatch(event, trigger);
                if matched {
                    outcome = WaitOutcome::Matched;
                    break;
                }
                continue;
            }

            if matches!(wait, Wait::Poll) {
                break;
            }
            if let Some(d) = deadline {
                if Instant::now() >= d {
                    break;
                }
            }

            let mut state = self.state.lock();
            // Re-check under the lock: terminate/exit_wait/queue_event may
            // have fired between the unlocked checks and acquiring the lock,
            // and their notification would otherwise be lost.
            if self.closing.load(Ordering::Acquire) || self.exit_requested.load(Ordering::Acquire) {
                continue;
            }
            let now_wall = SystemTime::now();
            if state.queue.next_trigger().is_some_and(|t| t <= now_wall) {
                continue;
            }

            let until_event = state
                .queue
                .next_trigger()
                .map(|t| t.duration_since(now_wall).unwrap_or(Duration::ZERO));
            let until_deadline = deadline.map(|d| d.saturating_duration_since(Instant::now()));
            let slept_at = Instant::now();
            match (until_deadline, until_event) {
                (None, None) => {
                    self.wake.wait(&mut state);
                }
                (d, e) => {
                    let timeout = match (d, e) {
                        (Some(a), Some(b)) => a.min(b),
                        (Some(a), None) => a,
                        (None, Some(b)) => b,
                        (None, None) => unreachable!(),
                    };
                    self.wake.wait_for(&mut state, timeout);
                }
            }
            drop(state);
            self.idle_nanos
                .fetch_add(slept_at.elapsed().as_nanos() as u64, Ordering::Relaxed);
        }

        self.wait_depth.fetch_sub(1, Ordering::AcqRel);
        // Only the innermost active call can be executing on the owning
        // thread, so it alone consumes the exit request.
        self.exit_requested.store(false, Ordering::Release);

        if self.closing.load(Ordering::Acquire) {
            WaitOutcome::Terminated
        } else {
            outcome
        }
    }

    /// Process one popped event with no lock held
    fn dispatch(&self, event: Event, trigger: SystemTime) {
        let Some(engine) = self.engine() else {
            event.discard(self);
            return;
        };
        match event.process(trigger, engine.as_ref(), self) {
            Disposition::Completed => {}
            Disposition::Continue { event, at } => {
                self.queue_event_at(event, at);
            }
        }
    }

    /// Run the schedule loop until terminated, then shut down
    ///
    /// This is the body of a spawned worker's thread after script startup;
    /// a host may also use it to donate its own thread to a root worker.
    pub fn run(&self) {
        loop {
            match self.wait_for(Wait::Indefinitely, None) {
                WaitOutcome::Terminated => break,
                // An exit_wait pops one wait; the loop resumes.
                WaitOutcome::TimedOut | WaitOutcome::Matched => continue,
            }
        }
        self.shutdown();
    }

    // ---- timers -----------------------------------------------------------

    /// Arm a one-shot timer; `None` when the timer id space is exhausted
    pub fn set_timeout(&self, target: Callback, args: Vec<Value>, delay: Duration) -> Option<TimerId> {
        let id = self.state.lock().timers.insert(Timer::one_shot(target, args))?;
        self.queue_event_at(Event::Timer { id }, SystemTime::now() + delay);
        Some(id)
    }

    /// Arm an interval timer firing every `period`
    pub fn set_interval(&self, target: Callback, args: Vec<Value>, period: Duration) -> Option<TimerId> {
        let id = self
            .state
            .lock()
            .timers
            .insert(Timer::interval(period, target, args))?;
        self.queue_event_at(Event::Timer { id }, SystemTime::now() + period);
        Some(id)
    }

    /// Cancel a timer
    ///
    /// Marks the timer cleared and removes its pending event from the queue
    /// if it has not run yet. The registry entry itself is freed by the
    /// discard (or cleared-fire) of the timer's own event, which is what
    /// makes cancel racing with fire safe. Unknown ids are a no-op.
    pub fn clear_timer(&self, id: TimerId) {
        let removed = {
            let mut state = self.state.lock();
            if !state.timers.clear(id) {
                return;
            }
            state.queue.remove_if(|event| event.timer_id() == Some(id))
        };
        for event in removed {
            event.discard(self);
        }
    }

    /// Number of live (not cleared) timers
    pub fn live_timers(&self) -> usize {
        self.state.lock().timers.live_count()
    }

    /// Number of timer registry entries, cleared sentinels included
    pub fn registered_timers(&self) -> usize {
        self.state.lock().timers.len()
    }

    pub(crate) fn timer_snapshot(&self, id: TimerId) -> Option<(TimerKind, Callback, Vec<Value>)> {
        let state = self.state.lock();
        state
            .timers
            .get(id)
            .map(|timer| (timer.kind, timer.target, timer.args.clone()))
    }

    pub(crate) fn release_timer(&self, id: TimerId) {
        self.state.lock().timers.remove(id);
    }

    // ---- ports ------------------------------------------------------------

    /// Register a message port this worker participates in
    pub fn add_message_port(&self, port: Arc<MessagePort>) {
        self.state.lock().message_ports.push(port);
    }

    /// Drop a message port from this worker's list
    pub fn remove_message_port(&self, port: &Arc<MessagePort>) {
        self.state
            .lock()
            .message_ports
            .retain(|p| !Arc::ptr_eq(p, port));
    }

    /// Register an error port this worker participates in
    pub fn add_error_port(&self, port: Arc<MessagePort>) {
        self.state.lock().error_ports.push(port);
    }

    /// Drop an error port from this worker's list
    pub fn remove_error_port(&self, port: &Arc<MessagePort>) {
        self.state
            .lock()
            .error_ports
            .retain(|p| !Arc::ptr_eq(p, port));
    }

    /// Snapshot of the error ports this worker participates in
    ///
    /// Hosts use this to bind an error handler on their end of a
    /// spawn-time error port.
    pub fn error_ports(&self) -> Vec<Arc<MessagePort>> {
        self.state.lock().error_ports.clone()
    }

    /// Broadcast an error to this worker's error ports
    ///
    /// Returns whether any port delivered it. An undelivered error in a
    /// dedicated worker walks up the dedicated-parent chain; shared and root
    /// workers drop it after the broadcast attempt.
    pub fn broadcast_error(&self, message: &str, filename: &str, lineno: u32) -> bool {
        let ports: Vec<Arc<MessagePort>> = self.state.lock().error_ports.clone();

        let mut delivered = false;
        for port in &ports {
            if let Some(peer) = port.other(self) {
                delivered |= port.post_error(&peer, message, filename, lineno);
            }
        }

        if !delivered && self.kind == WorkerKind::Dedicated {
            if let Some(parent) = self.parent() {
                return parent.broadcast_error(message, filename, lineno);
            }
        }
        delivered
    }

    // ---- shutdown ---------------------------------------------------------

    /// Tear the worker down; idempotent
    ///
    /// Order matters: (1) error ports are released first, cascading
    /// termination into dedicated insides this worker is the outside of
    /// (shared workers are never cascaded); (2) message ports close from
    /// this end; (3) every timer is force-cleared; (4) every remaining
    /// queued event is discarded, never processed; (5) the engine is
    /// released. Spawned workers run this as their loop exits; the host
    /// runs it for root workers.
    pub fn shutdown(&self) {
        if self.shutdown_done.swap(true, Ordering::AcqRel) {
            return;
        }
        self.terminate();

        let (error_ports, message_ports) = {
            let mut state = self.state.lock();
            (
                std::mem::take(&mut state.error_ports),
                std::mem::take(&mut state.message_ports),
            )
        };

        for port in error_ports {
            if port.is_outside(self) {
                if let Some(peer) = port.other(self) {
                    if peer.kind() == WorkerKind::Dedicated {
                        peer.terminate_and_join();
                    }
                }
            }
            port.close(self);
        }

        for port in message_ports {
            port.close(self);
        }

        let events = {
            let mut state = self.state.lock();
            state.timers.clear_all();
            state.queue.drain()
        };
        for event in events {
            event.discard(self);
        }

        *self.engine.lock() = None;

        #[cfg(debug_assertions)]
        eprintln!("worker {} shut down", self.url);
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.shutdown();
    }
}
