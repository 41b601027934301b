//! Process-wide worker registry
//!
//! The registry owns every worker it creates: dedicated spawns, shared
//! lookups deduplicated by (url, name), and root workers hosted by the
//! embedder. It is an ordinary object with explicit construction so tests
//! inject their own; a process-wide instance is available behind an explicit
//! `init`/`global` pair, never a hidden singleton.

use crate::engine::{EngineFactory, ScriptEngine};
use crate::error::WorkerError;
use crate::scheduler::{MessagePort, Worker, WorkerKind};
use dashmap::DashMap;
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread;

static GLOBAL: OnceCell<Arc<WorkerRegistry>> = OnceCell::new();

/// Install the process-wide registry; returns false if one is already set
pub fn init_global_registry(registry: Arc<WorkerRegistry>) -> bool {
    GLOBAL.set(registry).is_ok()
}

/// The process-wide registry, if the host installed one
pub fn global_registry() -> Option<Arc<WorkerRegistry>> {
    GLOBAL.get().cloned()
}

/// Registry of all live workers in one host process
pub struct WorkerRegistry {
    /// Builds a per-thread engine for each spawned worker
    factory: Arc<dyn EngineFactory>,

    /// Every worker this registry created, in creation order
    workers: Mutex<Vec<Arc<Worker>>>,

    /// Shared workers deduplicated by (url, name)
    shared: DashMap<(String, String), Arc<Worker>>,
}

impl WorkerRegistry {
    /// Create a registry spawning engines from `factory`
    pub fn new(factory: Arc<dyn EngineFactory>) -> Arc<Self> {
        Arc::new(Self {
            factory,
            workers: Mutex::new(Vec::new()),
            shared: DashMap::new(),
        })
    }

    /// Create a passive root worker serviced by the host's own thread
    pub fn create_root(&self, engine: Arc<dyn ScriptEngine>, url: &str) -> Arc<Worker> {
        let worker = Worker::create_root(engine, url);
        self.workers.lock().push(Arc::clone(&worker));
        worker
    }

    /// Spawn a dedicated worker as a child of `parent`
    ///
    /// Creates the worker thread (engine from the factory, startup script
    /// evaluation, then the schedule loop) and wires the spawn-time port
    /// pair: a message port and an error port, both with `parent` outside
    /// and the child inside. Returns the child together with the message
    /// port the parent posts through.
    pub fn spawn_dedicated(
        &self,
        parent: &Arc<Worker>,
        url: &str,
    ) -> Result<(Arc<Worker>, Arc<MessagePort>), WorkerError> {
        let worker = Worker::detached(WorkerKind::Dedicated, url.to_string(), None, None);
        worker.set_parent(parent);

        // Wire before spawning so the child's thread finds its error port
        // installed when the startup script evaluates; a failed spawn must
        // then unwind the wiring, or the parent keeps live ports to a child
        // that will never run or terminate.
        let (message_port, error_port) = Self::wire_spawn_ports(parent, &worker);
        if let Err(err) = self.spawn_thread(&worker) {
            Self::unwire_spawn_ports(parent, &worker, &message_port, &error_port);
            return Err(err);
        }
        self.workers.lock().push(Arc::clone(&worker));
        Ok((worker, message_port))
    }

    fn wire_spawn_ports(
        parent: &Arc<Worker>,
        worker: &Arc<Worker>,
    ) -> (Arc<MessagePort>, Arc<MessagePort>) {
        let message_port = MessagePort::connected(parent, worker);
        parent.add_message_port(Arc::clone(&message_port));
        worker.add_message_port(Arc::clone(&message_port));

        let error_port = MessagePort::connected(parent, worker);
        parent.add_error_port(Arc::clone(&error_port));
        worker.add_error_port(Arc::clone(&error_port));

        (message_port, error_port)
    }

    fn unwire_spawn_ports(
        parent: &Arc<Worker>,
        worker: &Arc<Worker>,
        message_port: &Arc<MessagePort>,
        error_port: &Arc<MessagePort>,
    ) {
        parent.remove_message_port(message_port);
        parent.remove_error_port(error_port);
        worker.remove_message_port(message_port);
        worker.remove_error_port(error_port);
        for port in [message_port, error_port] {
            port.close(parent);
            port.close(worker);
        }
    }

    /// Look up or create the shared worker identified by (url, name)
    ///
    /// The first lookup creates and spawns the worker; subsequent lookups
    /// attach to the existing one. Returns the worker and whether this call
    /// created it. A shared worker attempting to construct itself as its own
    /// child is rejected and reported to the originating caller.
    pub fn shared_worker(
        &self,
        caller: Option<&Arc<Worker>>,
        url: &str,
        name: &str,
    ) -> Result<(Arc<Worker>, bool), WorkerError> {
        if let Some(caller) = caller {
            if caller.kind() == WorkerKind::Shared
                && caller.url() == url
                && caller.name() == Some(name)
            {
                return Err(WorkerError::RecursiveSharedWorker {
                    url: url.to_string(),
                    name: name.to_string(),
                });
            }
        }

        let key = (url.to_string(), name.to_string());
        if let Some(existing) = self.shared.get(&key) {
            return Ok((Arc::clone(existing.value()), false));
        }

        let worker = Worker::detached(
            WorkerKind::Shared,
            url.to_string(),
            Some(name.to_string()),
            None,
        );
        match self.shared.entry(key) {
            dashmap::mapref::entry::Entry::Occupied(entry) => {
                // Lost the creation race; attach to the winner.
                Ok((Arc::clone(entry.get()), false))
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                self.spawn_thread(&worker)?;
                entry.insert(Arc::clone(&worker));
                self.workers.lock().push(Arc::clone(&worker));
                Ok((worker, true))
            }
        }
    }

    /// Terminate and forget the shared worker under (url, name)
    pub fn terminate_shared(&self, url: &str, name: &str) -> bool {
        let key = (url.to_string(), name.to_string());
        match self.shared.remove(&key) {
            Some((_, worker)) => {
                worker.terminate_and_join();
                self.workers
                    .lock()
                    .retain(|w| !Arc::ptr_eq(w, &worker));
                true
            }
            None => false,
        }
    }

    /// Terminate every worker and join their threads
    ///
    /// Termination is requested for all workers first, then each thread is
    /// joined, so sibling workers shut down concurrently instead of one at
    /// a time.
    pub fn terminate_all(&self) {
        self.shared.clear();
        let workers = std::mem::take(&mut *self.workers.lock());
        for worker in &workers {
            worker.terminate();
        }
        for worker in &workers {
            worker.terminate_and_join();
        }
    }

    /// Number of workers this registry currently tracks
    pub fn worker_count(&self) -> usize {
        self.workers.lock().len()
    }

    fn spawn_thread(&self, worker: &Arc<Worker>) -> Result<(), WorkerError> {
        let factory = Arc::clone(&self.factory);
        let thread_worker = Arc::clone(worker);
        let handle = thread::Builder::new()
            .name(format!("nyro-worker-{}", worker.url()))
            .spawn(move || Self::worker_main(thread_worker, factory))?;
        worker.set_thread(handle);
        Ok(())
    }

    /// Body of a spawned worker thread: create the engine, evaluate the
    /// startup script, then run the schedule loop until terminated
    fn worker_main(worker: Arc<Worker>, factory: Arc<dyn EngineFactory>) {
        match factory.create_engine() {
            Ok(engine) => {
                worker.set_engine(Arc::clone(&engine));
                if let Err(err) = engine.evaluate_script(worker.url()) {
                    worker.broadcast_error(&err.message, &err.filename, err.lineno);
                }
                worker.run();
            }
            Err(err) => {
                worker.broadcast_error(&err.message, &err.filename, err.lineno);
                worker.shutdown();
            }
        }

        #[cfg(debug_assertions)]
        eprintln!("worker thread {} exited", worker.url());
    }
}

impl Drop for WorkerRegistry {
    fn drop(&mut self) {
        self.terminate_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{NoopEngine, NoopEngineFactory};
    use std::time::Duration;

    fn registry() -> Arc<WorkerRegistry> {
        WorkerRegistry::new(Arc::new(NoopEngineFactory))
    }

    #[test]
    fn test_spawn_dedicated_creates_running_child() {
        let registry = registry();
        let root = registry.create_root(Arc::new(NoopEngine), "main.ny");

        let (child, _port) = registry.spawn_dedicated(&root, "child.ny").unwrap();
        assert_eq!(child.kind(), WorkerKind::Dedicated);
        assert!(Arc::ptr_eq(&child.parent().unwrap(), &root));
        assert_eq!(registry.worker_count(), 2);

        registry.terminate_all();
        assert!(child.is_closing());
    }

    #[test]
    fn test_unwired_spawn_ports_leave_no_trace_in_parent() {
        let root = Worker::create_root(Arc::new(NoopEngine), "main.ny");
        let child = Worker::detached(WorkerKind::Dedicated, "child.ny".to_string(), None, None);
        child.set_parent(&root);

        let (message_port, error_port) = WorkerRegistry::wire_spawn_ports(&root, &child);
        // Local handle plus one inside end per port
        assert_eq!(Arc::strong_count(&child), 3);

        // The spawn-failure branch of spawn_dedicated
        WorkerRegistry::unwire_spawn_ports(&root, &child, &message_port, &error_port);
        assert!(message_port.is_fully_closed());
        assert!(error_port.is_fully_closed());
        assert_eq!(Arc::strong_count(&child), 1);
        assert!(root.error_ports().is_empty());
        assert_eq!(root.pending_events(), 0);
    }

    #[test]
    fn test_shared_workers_deduplicate_by_url_and_name() {
        let registry = registry();

        let (a, created_a) = registry.shared_worker(None, "svc.ny", "cache").unwrap();
        let (b, created_b) = registry.shared_worker(None, "svc.ny", "cache").unwrap();
        let (c, created_c) = registry.shared_worker(None, "svc.ny", "other").unwrap();

        assert!(created_a);
        assert!(!created_b);
        assert!(created_c);
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));

        registry.terminate_all();
    }

    #[test]
    fn test_shared_worker_rejects_self_construction() {
        let registry = registry();
        let (shared, _) = registry.shared_worker(None, "svc.ny", "cache").unwrap();

        // The Ok side carries a Worker, which has no Debug; take the error
        // without formatting the success type.
        let err = registry
            .shared_worker(Some(&shared), "svc.ny", "cache")
            .err()
            .unwrap();
        assert!(matches!(err, WorkerError::RecursiveSharedWorker { .. }));

        // A different key from the same caller is fine
        assert!(registry.shared_worker(Some(&shared), "svc.ny", "eggs").is_ok());

        registry.terminate_all();
    }

    #[test]
    fn test_terminate_shared_removes_entry() {
        let registry = registry();
        let (first, _) = registry.shared_worker(None, "svc.ny", "cache").unwrap();

        assert!(registry.terminate_shared("svc.ny", "cache"));
        assert!(!registry.terminate_shared("svc.ny", "cache"));
        assert!(first.is_closing());

        // The key is free again; a new lookup creates a fresh worker
        let (second, created) = registry.shared_worker(None, "svc.ny", "cache").unwrap();
        assert!(created);
        assert!(!Arc::ptr_eq(&first, &second));

        registry.terminate_all();
    }

    #[test]
    fn test_terminate_all_joins_every_worker() {
        let registry = registry();
        let root = registry.create_root(Arc::new(NoopEngine), "main.ny");

        let (child, _) = registry.spawn_dedicated(&root, "a.ny").unwrap();
        let (shared, _) = registry.shared_worker(None, "b.ny", "s").unwrap();

        registry.terminate_all();
        assert!(child.is_closing());
        assert!(shared.is_closing());
        assert_eq!(registry.worker_count(), 0);

        // Idempotent
        registry.terminate_all();
    }

    #[test]
    fn test_parent_termination_cascades_to_dedicated_subtree() {
        let registry = registry();
        let root = registry.create_root(Arc::new(NoopEngine), "main.ny");

        let (child, _) = registry.spawn_dedicated(&root, "child.ny").unwrap();
        let (grandchild, _) = registry.spawn_dedicated(&child, "grandchild.ny").unwrap();

        // Shutting the parent down walks its error ports and terminates
        // dedicated insides
        root.shutdown();
        thread::sleep(Duration::from_millis(100));

        assert!(child.is_closing());
        assert!(grandchild.is_closing());

        registry.terminate_all();
    }

    #[test]
    fn test_shared_worker_survives_attacher_shutdown() {
        let registry = registry();
        let root = registry.create_root(Arc::new(NoopEngine), "main.ny");
        let (shared, _) = registry.shared_worker(Some(&root), "svc.ny", "cache").unwrap();

        root.shutdown();
        thread::sleep(Duration::from_millis(50));

        // Shared workers are never cascaded
        assert!(!shared.is_closing());

        registry.terminate_all();
    }

    #[test]
    fn test_global_registry_install_once() {
        // The global cell is process-wide; only assert set-then-get coherence
        let registry = registry();
        if init_global_registry(Arc::clone(&registry)) {
            assert!(Arc::ptr_eq(&global_registry().unwrap(), &registry));
            assert!(!init_global_registry(WorkerRegistry::new(Arc::new(NoopEngineFactory))));
        } else {
            assert!(global_registry().is_some());
        }
    }
}
