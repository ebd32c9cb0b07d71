//! The minimal, CLI-free `Server` collaborator spec.md's Worker contract
//! depends on: worker-thread lifecycle, cross-worker routing, replies, and
//! broadcasts.
//!
//! Grounded on `examples/original_source/core/core/worker.cpp`'s uses of
//! `server_->make_response`/`get_server()->broadcast`, and on
//! `monolake-core/src/orchestrator/worker_manager.rs`'s `WorkerManager` for
//! the concrete thread-per-worker spawn shape (CPU pinning via
//! `monoio::utils::bind_to_cpu_set`, one `futures_channel::mpsc` channel per
//! worker).

pub mod runtime;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_channel::mpsc::{self, UnboundedReceiver};
use futures_util::StreamExt;

use crate::config::RuntimeConfig;
use crate::error::AddressingError;
use crate::ids;
use crate::message::{Message, MessageType};
use crate::service::ServiceHandler;
use crate::worker::{ServiceContext, Task, WorkerHandle, WorkerInner};
use runtime::RuntimeWrapper;

struct ServerInner {
    workers: Vec<WorkerHandle>,
    read_buffer_size: usize,
}

/// Cross-thread, `Clone`-able reference to the whole worker pool. Every
/// [`ServiceContext`] carries one of these so a service can route a
/// message, reply to a request, or broadcast regardless of which worker it
/// lives on.
#[derive(Clone)]
pub struct ServerHandle(Arc<ServerInner>);

impl ServerHandle {
    pub fn worker_count(&self) -> usize {
        self.0.workers.len()
    }

    /// `RuntimeConfig::read_buffer_size` as given to `Server::new`, for a
    /// [`crate::tcp::TcpManager`] to size its per-connection read buffer.
    pub fn read_buffer_size(&self) -> usize {
        self.0.read_buffer_size
    }

    fn worker_for(&self, id: u8) -> &WorkerHandle {
        assert!(id >= 1 && (id as usize) <= self.0.workers.len(), "unknown worker id {id}");
        &self.0.workers[(id - 1) as usize]
    }

    pub fn worker(&self, id: u8) -> WorkerHandle {
        self.worker_for(id).clone()
    }

    /// Cross-worker routing per spec.md §4.2: stay local if the receiver's
    /// worker byte matches, otherwise hand off to that worker's queue.
    /// Broadcasts fan out to every worker, each of which applies its own
    /// "everyone but the sender" rule.
    pub fn route(&self, msg: Message, immediate: bool) {
        if msg.is_broadcast() {
            for w in &self.0.workers {
                w.send(msg.clone(), immediate);
            }
            return;
        }
        let wid = ids::worker_of(msg.receiver);
        if wid == 0 || (wid as usize) > self.0.workers.len() {
            tracing::warn!(receiver = msg.receiver, error = %AddressingError::UnknownWorker);
            return;
        }
        self.0.workers[(wid - 1) as usize].send(msg, immediate);
    }

    /// Fan `msg` out to every worker, tagging it as a broadcast from
    /// `sender`. Used for the system "exit" notification on service
    /// removal, and available to application services via
    /// [`ServiceContext::broadcast`].
    pub fn broadcast(&self, sender: u32, mut msg: Message) {
        msg.sender = sender;
        msg.broadcast = true;
        for w in &self.0.workers {
            w.send(msg.clone(), true);
        }
    }

    /// Build and route the reply to a request. A `respid` of `0` means no
    /// reply was wanted and this is a no-op, matching the original's
    /// `make_response` guard — infrastructure-synthesized replies (dead
    /// service, transport errors) follow the same rule as user replies.
    pub fn make_response(
        &self,
        receiver: u32,
        header: impl Into<Box<str>>,
        body: impl Into<Bytes>,
        respid: i32,
        mtype: MessageType,
    ) {
        if respid == 0 {
            return;
        }
        debug_assert!(respid > 0, "make_response expects the original positive response id");
        let msg = Message {
            sender: 0,
            receiver,
            responseid: -respid,
            mtype,
            header: header.into(),
            payload: body.into(),
            broadcast: false,
        };
        self.route(msg, true);
    }

    pub fn remove_service(&self, id: u32, sender: u32, respid: i32, crashed: bool) {
        let wid = ids::worker_of(id);
        if wid == 0 || (wid as usize) > self.0.workers.len() {
            return;
        }
        self.0.workers[(wid - 1) as usize].remove_service(id, sender, respid, crashed);
    }

    pub(crate) fn tick_all(&self) {
        for w in &self.0.workers {
            w.update();
        }
    }
}

/// Drains posted tasks until the worker reports itself `stopped`. The loop
/// can't rely on `tasks` ever yielding `None`: `inner` itself holds a
/// `WorkerHandle` (its own sender) and a `ServerHandle` (every worker's
/// sender, including this one), so no `UnboundedSender<Task>` for this
/// worker is ever dropped while `inner` is alive. `stop()` posts a task that
/// eventually drives the service table empty and flips the `stopped` flag
/// from inside `inner` itself (see `WorkerInner::begin_stop`/`remove_service`);
/// checking it right after running each task is what actually ends the loop.
async fn run_worker(mut tasks: UnboundedReceiver<Task>, mut inner: WorkerInner) {
    while let Some(task) = tasks.next().await {
        task(&mut inner);
        if inner.stopped() {
            break;
        }
    }
}

/// Holds the background thread that calls [`ServerHandle::tick_all`] on a
/// fixed cadence (`RuntimeConfig::tick_interval_ms`), standing in for the
/// "process-chosen cadence" in spec.md §6. Dropping it without calling
/// [`Ticker::stop`] leaves the thread running — call `stop` during shutdown.
pub struct Ticker {
    stop: Arc<AtomicBool>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl Ticker {
    pub fn stop(mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(t) = self.thread.take() {
            let _ = t.join();
        }
    }
}

/// The worker pool plus the routing glue the Worker contract assumes.
/// Carries no CLI, config-file, or logging-sink responsibility: the
/// embedder parses its own config into a [`RuntimeConfig`] and installs a
/// `tracing` subscriber before constructing one.
pub struct Server {
    handle: ServerHandle,
    join_handles: Vec<std::thread::JoinHandle<()>>,
    config: RuntimeConfig,
}

impl Server {
    /// Spawn `config.worker_threads` OS threads, each running one
    /// single-threaded `monoio` runtime and one [`WorkerInner`] event loop.
    pub fn new(config: RuntimeConfig) -> Self {
        let n = config.worker_threads.max(1);
        assert!(n <= 255, "at most 255 workers: worker id is packed into a service id's top byte");

        let mut worker_handles = Vec::with_capacity(n);
        let mut receivers = Vec::with_capacity(n);
        for i in 0..n {
            let worker_id = (i + 1) as u8;
            let (tx, rx) = mpsc::unbounded();
            worker_handles.push(WorkerHandle::new(worker_id, tx));
            receivers.push(rx);
        }

        let handle = ServerHandle(Arc::new(ServerInner {
            workers: worker_handles.clone(),
            read_buffer_size: config.read_buffer_size,
        }));

        let join_handles = receivers
            .into_iter()
            .enumerate()
            .map(|(i, rx)| {
                let worker_id = (i + 1) as u8;
                let wh = worker_handles[i].clone();
                let server_handle = handle.clone();
                let cfg = config.clone();
                std::thread::Builder::new()
                    .name(format!("tidelake-worker-{worker_id}"))
                    .spawn(move || {
                        if cfg.cpu_affinity {
                            if let Err(e) = monoio::utils::bind_to_cpu_set([i]) {
                                tracing::warn!(worker = worker_id, error = %e, "failed to pin worker thread to a cpu core");
                            }
                        }
                        tracing::info!(worker = worker_id, "starting");
                        let mut runtime = RuntimeWrapper::from(&cfg);
                        let inner = WorkerInner::new(worker_id, wh, server_handle);
                        runtime.block_on(run_worker(rx, inner));
                        tracing::info!(worker = worker_id, "stopped");
                    })
                    .expect("failed to spawn worker thread")
            })
            .collect();

        Server { handle, join_handles, config }
    }

    pub fn handle(&self) -> ServerHandle {
        self.handle.clone()
    }

    pub fn worker(&self, id: u8) -> WorkerHandle {
        self.handle.worker(id)
    }

    pub fn worker_count(&self) -> usize {
        self.handle.worker_count()
    }

    /// Assign `worker_id` a new service id and post its construction.
    /// `factory` runs on the worker's own thread; see
    /// [`WorkerHandle::add_service`] for why it may only require `Send` on
    /// the factory itself, not on the handler it produces.
    pub fn add_service<F>(&self, worker_id: u8, name: impl Into<Box<str>>, factory: F) -> u32
    where
        F: FnOnce(&ServiceContext) -> Box<dyn ServiceHandler> + Send + 'static,
    {
        self.handle.worker_for(worker_id).add_service(name, factory)
    }

    /// One-shot convenience: invoke `on_start` on every service currently
    /// on every worker.
    pub fn start(&self) {
        for w in &self.handle.0.workers {
            w.start();
        }
    }

    /// Spawn the background ticker that drives every worker's `update()`
    /// at `config.tick_interval_ms`.
    pub fn spawn_ticker(&self) -> Ticker {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = stop.clone();
        let handle = self.handle.clone();
        let interval = Duration::from_millis(self.config.tick_interval_ms.max(1));
        let thread = std::thread::Builder::new()
            .name("tidelake-ticker".to_string())
            .spawn(move || {
                while !stop_flag.load(Ordering::Relaxed) {
                    handle.tick_all();
                    std::thread::sleep(interval);
                }
            })
            .expect("failed to spawn ticker thread");
        Ticker { stop, thread: Some(thread) }
    }

    /// Ask every worker to shut down: every live service gets `on_exit`,
    /// and each worker becomes `stopped` once its table empties out.
    pub fn stop(&self) {
        for w in &self.handle.0.workers {
            w.stop();
        }
    }

    pub fn all_stopped(&self) -> bool {
        self.handle.0.workers.iter().all(|w| w.stopped())
    }

    /// Block until every worker thread has exited. Call after `stop()` has
    /// been given a chance to drain every service.
    pub fn wait(mut self) {
        for jh in self.join_handles.drain(..) {
            let _ = jh.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;
    use std::time::Duration;

    use super::*;

    /// Records every message it's dispatched onto a channel, for the test
    /// thread to inspect. Stands in for a real service when only observing
    /// traffic matters.
    struct ProbeHandler {
        tx: mpsc::Sender<Message>,
    }

    impl ServiceHandler for ProbeHandler {
        fn dispatch(&mut self, _ctx: &ServiceContext, msg: Message) {
            let _ = self.tx.send(msg);
        }
    }

    /// Replies "pong"/"ok" to any request; ignores fire-and-forget traffic.
    struct PongHandler;

    impl ServiceHandler for PongHandler {
        fn dispatch(&mut self, ctx: &ServiceContext, msg: Message) {
            if msg.is_request() {
                ctx.reply(&msg, "pong", Bytes::from_static(b"ok"));
            }
        }
    }

    /// Panics on its first dispatch; used to exercise the "host catches
    /// handler panics" contract.
    struct PanicOnDispatch;

    impl ServiceHandler for PanicOnDispatch {
        fn dispatch(&mut self, _ctx: &ServiceContext, _msg: Message) {
            panic!("boom");
        }
    }

    fn single_worker() -> Server {
        Server::new(RuntimeConfig { worker_threads: 1, ..Default::default() })
    }

    /// S1: a request to a live service gets exactly one reply, with the
    /// response id negated and sender/receiver swapped.
    #[test]
    fn request_reply_round_trip() {
        let (tx, rx) = mpsc::channel();
        let server = single_worker();
        let id_a = server.add_service(1, "a", move |_ctx| Box::new(ProbeHandler { tx }) as Box<dyn ServiceHandler>);
        let id_b = server.add_service(1, "b", |_ctx| Box::new(PongHandler) as Box<dyn ServiceHandler>);
        server.start();

        server.handle().route(Message::new(id_a, id_b, 7, "ping", Bytes::from_static(b"hi")), true);

        let reply = rx.recv_timeout(Duration::from_secs(2)).expect("a never observed a reply");
        assert_eq!(reply.sender, id_b);
        assert_eq!(reply.receiver, id_a);
        assert_eq!(reply.responseid, -7);
        assert_eq!(&*reply.header, "pong");
        assert_eq!(&reply.payload[..], b"ok");

        server.stop();
        server.wait();
    }

    /// S2: routing a request to an absent receiver synthesizes one error
    /// reply rather than dropping the message silently.
    #[test]
    fn dead_receiver_gets_error_reply() {
        let (tx, rx) = mpsc::channel();
        let server = single_worker();
        let id_a = server.add_service(1, "a", move |_ctx| Box::new(ProbeHandler { tx }) as Box<dyn ServiceHandler>);
        server.start();

        let missing = ids::make_service_id(1, 100);
        server.handle().route(Message::new(id_a, missing, 5, "ping", Bytes::new()), true);

        let err = rx.recv_timeout(Duration::from_secs(2)).expect("a never observed the error reply");
        assert_eq!(err.sender, 0);
        assert_eq!(err.receiver, id_a);
        assert_eq!(err.responseid, -5);
        assert_eq!(&*err.header, "error");
        assert_eq!(&err.payload[..], b"call dead service.");
        assert_eq!(err.mtype, MessageType::Error);

        server.stop();
        server.wait();
    }

    /// S3: a broadcast reaches every other service sharing the sender's
    /// worker exactly once, and never the sender itself.
    #[test]
    fn broadcast_reaches_everyone_but_sender() {
        let (tx_a, rx_a) = mpsc::channel();
        let (tx_b, rx_b) = mpsc::channel();
        let (tx_c, rx_c) = mpsc::channel();
        let server = single_worker();
        let id_a = server.add_service(1, "a", move |_ctx| Box::new(ProbeHandler { tx: tx_a }) as Box<dyn ServiceHandler>);
        server.add_service(1, "b", move |_ctx| Box::new(ProbeHandler { tx: tx_b }) as Box<dyn ServiceHandler>);
        server.add_service(1, "c", move |_ctx| Box::new(ProbeHandler { tx: tx_c }) as Box<dyn ServiceHandler>);
        server.start();

        server.handle().broadcast(id_a, Message::broadcast(id_a, "hello", Bytes::new()));

        let at_b = rx_b.recv_timeout(Duration::from_secs(2)).expect("b missed the broadcast");
        let at_c = rx_c.recv_timeout(Duration::from_secs(2)).expect("c missed the broadcast");
        assert_eq!(&*at_b.header, "hello");
        assert_eq!(&*at_c.header, "hello");
        assert!(rx_b.try_recv().is_err(), "b received the broadcast more than once");
        assert!(rx_a.try_recv().is_err(), "the sender observed its own broadcast");

        server.stop();
        server.wait();
    }

    /// S4: a message addressed to a service on another worker is observed
    /// there, regardless of which thread posted it.
    #[test]
    fn cross_worker_routing_reaches_the_right_thread() {
        let (tx, rx) = mpsc::channel();
        let server = Server::new(RuntimeConfig { worker_threads: 2, ..Default::default() });
        let id_a = server.add_service(1, "a", |_ctx| Box::new(PongHandler) as Box<dyn ServiceHandler>);
        let id_x = server.add_service(2, "x", move |_ctx| Box::new(ProbeHandler { tx }) as Box<dyn ServiceHandler>);
        assert_eq!(ids::worker_of(id_x), 2);
        server.start();

        server.handle().route(Message::new(id_a, id_x, 0, "hello", Bytes::new()), true);

        let observed = rx.recv_timeout(Duration::from_secs(2)).expect("worker 2 never observed the message");
        assert_eq!(observed.sender, id_a);
        assert_eq!(observed.receiver, id_x);

        server.stop();
        server.wait();
    }

    /// A handler that panics mid-dispatch is torn down by the host rather
    /// than taking its worker thread down with it; peers see a "service
    /// crashed" exit broadcast the same way a clean `exit()` would look,
    /// save for the reason text. Expect noisy panic output on stderr from
    /// the caught unwind — that's the default panic hook, not a test
    /// failure.
    #[test]
    fn dispatch_panic_crashes_the_service_and_broadcasts() {
        let (tx, rx) = mpsc::channel();
        let server = single_worker();
        let id_a = server.add_service(1, "a", move |_ctx| Box::new(ProbeHandler { tx }) as Box<dyn ServiceHandler>);
        let id_bad = server.add_service(1, "bad", |_ctx| Box::new(PanicOnDispatch) as Box<dyn ServiceHandler>);
        server.start();

        server.handle().route(Message::new(id_a, id_bad, 0, "boom", Bytes::new()), true);

        let broadcast = rx.recv_timeout(Duration::from_secs(2)).expect("a never observed the crash broadcast");
        assert!(broadcast.is_broadcast());
        assert_eq!(broadcast.sender, id_bad);
        assert_eq!(&*broadcast.header, "exit");
        assert_eq!(&broadcast.payload[..], b"service crashed");

        server.stop();
        server.wait();
    }
}
