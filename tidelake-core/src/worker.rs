//! The worker: a single-threaded cooperative scheduler for services.
//!
//! Grounded on `examples/original_source/core/core/worker.h`/`worker.cpp`.
//! [`WorkerHandle`] is the cross-thread handle (`Arc`-backed, `Send + Sync`)
//! that the [`crate::server::Server`] and other workers hold; [`WorkerInner`]
//! is the owner-thread-only state (`services_`/`mqueue_`/`caches_` in the
//! original) that every operation ultimately runs against via a task posted
//! to `tasks`. The split mirrors the original's `asio::io_service::post`
//! boundary — everything to the right of `post` runs serialized on the
//! worker's own thread.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures_channel::mpsc::UnboundedSender;

use crate::error::AddressingError;
use crate::ids;
use crate::message::{Message, MessageType};
use crate::server::ServerHandle;
use crate::service::ServiceHandler;

/// A unit of work posted to a worker's event loop. Must be `Send` even
/// though [`ServiceHandler`] itself need not be: the closure crosses
/// threads, but everything it touches that isn't `Send` (the handler
/// table, the per-tick cache) lives behind this boundary and is only ever
/// reached from inside a `Task` running on the owning thread.
pub(crate) type Task = Box<dyn FnOnce(&mut WorkerInner) + Send>;

struct CacheTable {
    next: u32,
    entries: HashMap<u32, Bytes>,
}

impl CacheTable {
    fn new() -> Self {
        CacheTable { next: 0, entries: HashMap::new() }
    }
}

struct ServiceSlot {
    handler: Box<dyn ServiceHandler>,
    name: Box<str>,
    ok: bool,
}

struct WorkerHandleInner {
    id: u8,
    serviceuid: AtomicU32,
    servicenum: AtomicU32,
    shared: AtomicBool,
    stopped: AtomicBool,
    /// Bulk same-worker traffic sent with `immediate = false`: a lock-guarded
    /// vector drained in one pass per tick, per spec.md §5, instead of one
    /// channel round-trip per message.
    deferred: Mutex<Vec<Message>>,
    tasks: UnboundedSender<Task>,
}

/// Cross-thread, cheaply-`Clone`-able reference to a worker. This is the
/// only way another thread (the `Server`, another worker, a TCP accept
/// callback on a different worker) may affect a worker's state; every
/// method either reads one of the handful of atomics or posts a `Task`.
#[derive(Clone)]
pub struct WorkerHandle(Arc<WorkerHandleInner>);

impl WorkerHandle {
    pub(crate) fn new(id: u8, tasks: UnboundedSender<Task>) -> Self {
        WorkerHandle(Arc::new(WorkerHandleInner {
            id,
            serviceuid: AtomicU32::new(1),
            servicenum: AtomicU32::new(0),
            shared: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
            deferred: Mutex::new(Vec::new()),
            tasks,
        }))
    }

    pub fn id(&self) -> u8 {
        self.0.id
    }

    /// Whether the `Server` may still place new services here.
    pub fn shared(&self) -> bool {
        self.0.shared.load(Ordering::Relaxed)
    }

    pub fn stopped(&self) -> bool {
        self.0.stopped.load(Ordering::Relaxed)
    }

    pub fn servicenum(&self) -> u32 {
        self.0.servicenum.load(Ordering::Relaxed)
    }

    fn next_service_id(&self) -> u32 {
        let counter = self.0.serviceuid.fetch_add(1, Ordering::Relaxed);
        ids::make_service_id(self.0.id, counter)
    }

    /// Enqueue an arbitrary callable to run on this worker's thread.
    /// Non-blocking, never fails: an unbounded channel backs it, matching
    /// the contract that `post` "never fails".
    pub fn post<F>(&self, task: F)
    where
        F: FnOnce(&mut WorkerInner) + Send + 'static,
    {
        // An unbounded sender only errors once every receiver has dropped,
        // i.e. the worker thread has already torn down; there is nothing
        // useful to do with that besides drop the task.
        let _ = self.0.tasks.unbounded_send(Box::new(task));
    }

    /// Deliver `msg` to a service living on this worker. `immediate` posts
    /// a one-message dispatch task; otherwise the message joins the
    /// deferred queue drained in bulk by the next `update()`.
    pub fn send(&self, msg: Message, immediate: bool) {
        if immediate {
            self.post(move |inner| inner.handle_one(msg));
        } else {
            self.0.deferred.lock().expect("deferred queue poisoned").push(msg);
        }
    }

    /// Build and insert a new service. `factory` runs on the worker's own
    /// thread and receives the freshly assigned [`ServiceContext`], so it
    /// may freely construct `!Send` state (e.g. a [`crate::tcp::TcpManager`])
    /// despite `factory` itself needing to be `Send` to cross into the
    /// posted task.
    pub fn add_service<F>(&self, name: impl Into<Box<str>>, factory: F) -> u32
    where
        F: FnOnce(&ServiceContext) -> Box<dyn ServiceHandler> + Send + 'static,
    {
        let id = self.next_service_id();
        let name: Box<str> = name.into();
        self.post(move |inner| {
            let ctx = inner.ctx_for(id, &name);
            let handler = factory(&ctx);
            inner.insert_service(id, name, handler);
        });
        id
    }

    /// Post destruction of `id`. `sender`/`respid` address the reply
    /// carrying the `{"name":..,"serviceid":..}` body; `crashed` selects
    /// the broadcast reason ("service crashed" vs "service exit").
    pub fn remove_service(&self, id: u32, sender: u32, respid: i32, crashed: bool) {
        self.post(move |inner| inner.remove_service(id, sender, respid, crashed));
    }

    /// One-shot: invoke every current service's `on_start`. Calling this
    /// twice re-invokes every service's hook again, per contract.
    pub fn start(&self) {
        self.post(|inner| inner.start_all());
    }

    /// Post a tick: per-service `on_update`, then drain+dispatch the
    /// deferred queue, then clear the per-tick cache.
    pub fn update(&self) {
        self.post(|inner| inner.tick());
    }

    /// Post an exit request to every live service; the worker becomes
    /// `stopped` once its service table empties out in response.
    pub fn stop(&self) {
        self.post(|inner| inner.begin_stop());
    }

    pub fn worker_time(&self, sender: u32, respid: i32) {
        self.post(move |inner| inner.report_worker_time(sender, respid));
    }
}

/// Owner-thread-only worker state: the service table, the per-tick cache,
/// and the bookkeeping `worker_time` needs. Reached only from inside a
/// [`Task`] running on the worker's own thread.
pub struct WorkerInner {
    id: u8,
    self_handle: WorkerHandle,
    server: ServerHandle,
    services: HashMap<u32, ServiceSlot>,
    cache: Rc<RefCell<CacheTable>>,
    exit_requested: bool,
    window_start: Instant,
    work_time: Duration,
}

impl WorkerInner {
    pub(crate) fn new(id: u8, self_handle: WorkerHandle, server: ServerHandle) -> Self {
        WorkerInner {
            id,
            self_handle,
            server,
            services: HashMap::new(),
            cache: Rc::new(RefCell::new(CacheTable::new())),
            exit_requested: false,
            window_start: Instant::now(),
            work_time: Duration::ZERO,
        }
    }

    /// Whether this worker has finished shutting down, i.e. `stop()` has
    /// been posted and its service table has since emptied out. Checked by
    /// `run_worker` to end the task loop without relying on every
    /// `UnboundedSender<Task>` dropping, which never happens on its own
    /// (this `WorkerInner` holds a sender to itself via both `self_handle`
    /// and `server`).
    pub(crate) fn stopped(&self) -> bool {
        self.self_handle.stopped()
    }

    fn ctx_for(&self, id: u32, name: &Box<str>) -> ServiceContext {
        ServiceContext {
            id,
            name: name.clone(),
            worker: self.self_handle.clone(),
            server: self.server.clone(),
            cache: self.cache.clone(),
        }
    }

    fn insert_service(&mut self, id: u32, name: Box<str>, handler: Box<dyn ServiceHandler>) {
        assert!(
            !self.services.contains_key(&id),
            "serviceid {id} repeated on worker {}",
            self.id
        );
        tracing::info!(worker = self.id, service = id, name = %name, "new service");
        self.services.insert(id, ServiceSlot { handler, name, ok: true });
        self.self_handle.0.servicenum.store(self.services.len() as u32, Ordering::Relaxed);
    }

    fn live_entries(&self) -> Vec<(u32, Box<str>)> {
        self.services
            .iter()
            .filter(|(_, slot)| slot.ok)
            .map(|(id, slot)| (*id, slot.name.clone()))
            .collect()
    }

    fn start_all(&mut self) {
        let mut crashed = Vec::new();
        for (id, name) in self.live_entries() {
            let ctx = self.ctx_for(id, &name);
            if let Some(slot) = self.services.get_mut(&id) {
                if slot.ok && !guard_call(self.id, id, &name, "on_start", || slot.handler.on_start(&ctx)) {
                    crashed.push(id);
                }
            }
        }
        for id in crashed {
            self.remove_service(id, 0, 0, true);
        }
    }

    fn begin_stop(&mut self) {
        if self.services.is_empty() {
            self.self_handle.0.stopped.store(true, Ordering::Relaxed);
            return;
        }
        self.exit_requested = true;
        let mut crashed = Vec::new();
        for (id, name) in self.live_entries() {
            let ctx = self.ctx_for(id, &name);
            if let Some(slot) = self.services.get_mut(&id) {
                if slot.ok && !guard_call(self.id, id, &name, "on_exit", || slot.handler.on_exit(&ctx)) {
                    crashed.push(id);
                }
            }
        }
        for id in crashed {
            self.remove_service(id, 0, 0, true);
        }
    }

    fn remove_service(&mut self, id: u32, sender: u32, respid: i32, crashed: bool) {
        match self.services.remove(&id) {
            Some(mut slot) => {
                let ctx = self.ctx_for(id, &slot.name);
                slot.handler.on_destroy(&ctx);

                if self.services.is_empty() {
                    self.self_handle.0.shared.store(true, Ordering::Relaxed);
                }
                self.self_handle.0.servicenum.store(self.services.len() as u32, Ordering::Relaxed);

                let body = format!(r#"{{"name":"{}","serviceid":{id}}}"#, slot.name);
                self.server.make_response(sender, "service destroy", Bytes::from(body), respid, MessageType::Socket);

                tracing::info!(worker = self.id, service = id, name = %slot.name, crashed, "service destroy");

                let reason: &'static str = if crashed { "service crashed" } else { "service exit" };
                self.server.broadcast(id, Message::broadcast(id, "exit", Bytes::from_static(reason.as_bytes())));
            }
            None => {
                self.server.make_response(
                    sender,
                    "error",
                    Bytes::from_static(b"remove_service:service not found"),
                    respid,
                    MessageType::Error,
                );
            }
        }

        if self.services.is_empty() && self.exit_requested {
            self.self_handle.0.stopped.store(true, Ordering::Relaxed);
        }
    }

    fn tick(&mut self) {
        let begin = Instant::now();

        let mut crashed = Vec::new();
        for (id, name) in self.live_entries() {
            let ctx = self.ctx_for(id, &name);
            if let Some(slot) = self.services.get_mut(&id) {
                if slot.ok && !guard_call(self.id, id, &name, "on_update", || slot.handler.on_update(&ctx)) {
                    crashed.push(id);
                }
            }
        }
        for id in crashed {
            self.remove_service(id, 0, 0, true);
        }

        let drained = std::mem::take(&mut *self.self_handle.0.deferred.lock().expect("deferred queue poisoned"));
        for msg in drained {
            self.handle_one(msg);
        }

        let mut cache = self.cache.borrow_mut();
        cache.entries.clear();
        cache.next = 0;
        drop(cache);

        self.work_time += begin.elapsed();
    }

    fn report_worker_time(&mut self, sender: u32, respid: i32) {
        let now = Instant::now();
        let total_ms = now.duration_since(self.window_start).as_millis().max(1) as f64;
        let busy_ms = self.work_time.as_millis() as f64;
        let percent = (busy_ms / total_ms * 100.0 * 100.0).round() / 100.0;
        let body = format!(r#"["worker{}",{percent:.2}]"#, self.id);
        self.server.make_response(sender, "", Bytes::from(body), respid, MessageType::Socket);
        self.window_start = now;
        self.work_time = Duration::ZERO;
    }

    /// Dispatch algorithm from spec.md §4.1: broadcasts fan out to every
    /// other live service; point-to-point messages to a dead receiver get
    /// an error reply instead of being dropped silently.
    fn handle_one(&mut self, msg: Message) {
        if msg.is_broadcast() {
            let sender = msg.sender;
            let mut crashed = Vec::new();
            for (id, name) in self.live_entries().into_iter().filter(|(id, _)| *id != sender) {
                let ctx = self.ctx_for(id, &name);
                if let Some(slot) = self.services.get_mut(&id) {
                    let msg = msg.clone();
                    if slot.ok && !guard_call(self.id, id, &name, "dispatch", || slot.handler.dispatch(&ctx, msg)) {
                        crashed.push(id);
                    }
                }
            }
            for id in crashed {
                self.remove_service(id, 0, 0, true);
            }
            return;
        }

        let name = match self.services.get(&msg.receiver) {
            Some(slot) if slot.ok => slot.name.clone(),
            _ => {
                tracing::debug!(worker = self.id, receiver = msg.receiver, "call dead service");
                self.server.make_response(
                    msg.sender,
                    "error",
                    Bytes::from(AddressingError::DeadService.to_string()),
                    msg.responseid,
                    MessageType::Error,
                );
                return;
            }
        };
        let id = msg.receiver;
        let ctx = self.ctx_for(id, &name);
        let crashed = if let Some(slot) = self.services.get_mut(&id) {
            !guard_call(self.id, id, &name, "dispatch", || slot.handler.dispatch(&ctx, msg))
        } else {
            false
        };
        if crashed {
            self.remove_service(id, 0, 0, true);
        }
    }
}

/// Run `f`, catching a panic that unwinds out of it. `ServiceHandler`
/// methods take `&mut self`, which isn't `UnwindSafe` by default (the
/// handler's invariants may be broken mid-panic) — matching
/// `monolake-services/src/common/panic.rs`'s own
/// `AssertUnwindSafe(...).catch_unwind()` wrapping of `inner.call(req)`,
/// the caller here is asserting that a crashed handler is about to be torn
/// down wholesale (`remove_service(crashed=true)`), not resumed.
fn guard_call<F: FnOnce()>(worker_id: u8, service_id: u32, name: &str, hook: &str, f: F) -> bool {
    match std::panic::catch_unwind(std::panic::AssertUnwindSafe(f)) {
        Ok(()) => true,
        Err(payload) => {
            tracing::error!(worker = worker_id, service = service_id, name, hook, panic = %panic_message(&payload), "service handler panicked");
            false
        }
    }
}

fn panic_message(payload: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Handed to a [`ServiceHandler`] on every call into it. Bundles the
/// service's own id/name, a [`WorkerHandle`] for operations local to this
/// worker, a [`ServerHandle`] for routing across workers, and the per-tick
/// cache table — cheap to clone, never sent to another thread.
#[derive(Clone)]
pub struct ServiceContext {
    id: u32,
    name: Box<str>,
    worker: WorkerHandle,
    server: ServerHandle,
    cache: Rc<RefCell<CacheTable>>,
}

impl ServiceContext {
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn worker_id(&self) -> u8 {
        ids::worker_of(self.id)
    }

    pub fn worker(&self) -> &WorkerHandle {
        &self.worker
    }

    pub fn server(&self) -> &ServerHandle {
        &self.server
    }

    /// Route `msg`, interleaved with other posted tasks on the destination
    /// worker (`immediate = true`), or joining its deferred queue for bulk
    /// same-worker traffic (`immediate = false`).
    pub fn send(&self, msg: Message, immediate: bool) {
        self.server.route(msg, immediate);
    }

    /// Convenience: build and send the reply to an in-flight request.
    pub fn reply(&self, to: &Message, header: impl Into<Box<str>>, payload: impl Into<Bytes>) {
        self.send(to.reply(header, payload), true);
    }

    /// Fan `msg` out to every other service on this worker.
    pub fn broadcast(&self, header: impl Into<Box<str>>, payload: impl Into<Bytes>) {
        self.server.broadcast(self.id, Message::broadcast(self.id, header, payload));
    }

    /// Stash `buf` for this tick; the returned id is valid only until the
    /// current `update()` tick finishes draining.
    pub fn make_cache(&self, buf: Bytes) -> u32 {
        let mut table = self.cache.borrow_mut();
        let id = table.next;
        table.next = table.next.wrapping_add(1);
        table.entries.insert(id, buf);
        id
    }

    pub fn get_cache(&self, id: u32) -> Option<Bytes> {
        self.cache.borrow().entries.get(&id).cloned()
    }

    /// Request removal of this service (fire-and-forget, sender `0`).
    pub fn exit(&self) {
        self.worker.remove_service(self.id, 0, 0, false);
    }
}
