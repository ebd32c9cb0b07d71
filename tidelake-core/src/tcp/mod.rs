//! Protocol-aware TCP connection manager.
//!
//! Grounded on `examples/original_source/core/components/tcp/impl/tcp.cpp`
//! (the `tcp` moon component: `listen`/`async_accept`/`connect`/`read`/
//! `send`/`close`/`settimeout`/`setnodelay`, a 16-bit wrapping connection id
//! allocator, and a periodic idle sweep) and, for the concrete `monoio`
//! socket shape, on `monolake-services/src/tcp/listener.rs` and
//! `monolake-core/src/listener.rs`'s `TcpListener::bind_with_config`.
//!
//! A [`TcpManager`] is meant to live inside a [`crate::ServiceHandler`],
//! constructed once in the service's factory from its
//! [`crate::ServiceContext`]; every accepted or dialed connection then
//! delivers frames back to that same service as ordinary
//! [`crate::Message`]s (`mtype` = [`crate::MessageType::Socket`] for data,
//! `System` for lifecycle/close notifications).

mod connection;
mod framer;

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::Duration;

use bytes::Bytes;
use monoio::net::{ListenerOpts, TcpListener, TcpStream};

use crate::error::TransportError;
use crate::message::MessageType;
use crate::worker::ServiceContext;

use connection::ConnsMap;
use framer::ReadKind;

/// Which wire protocol a [`TcpManager`] speaks, selected once via
/// [`TcpManager::set_protocol`] before the first `listen`/`connect`.
/// Grounded on spec.md §4.3's three protocol variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    /// 4-byte big-endian length-prefixed frames, delivered eagerly.
    Default,
    /// No implicit framing; the service drives every read explicitly.
    Custom,
    /// RFC 6455 handshake plus text/binary/close data frames.
    WebSocket,
}

/// Owns the accept loop (if any), the live connection table, and the idle
/// timeout sweep for one service. Not `Send`/`Sync`: it is only ever
/// touched from the worker thread that owns the service holding it.
pub struct TcpManager {
    ctx: ServiceContext,
    protocol: Cell<Option<Protocol>>,
    conns: ConnsMap,
    next_connid: Rc<Cell<u16>>,
    listener: Rc<RefCell<Option<TcpListener>>>,
    timeout_secs: Rc<Cell<u32>>,
    checker_spawned: Cell<bool>,
    alive: Rc<Cell<bool>>,
    read_buffer_size: usize,
}

impl TcpManager {
    /// The per-connection read buffer is sized from
    /// `RuntimeConfig::read_buffer_size` as given to the owning `Server`,
    /// reached here through `ctx.server()`.
    pub fn new(ctx: &ServiceContext) -> Self {
        TcpManager {
            ctx: ctx.clone(),
            protocol: Cell::new(None),
            conns: Rc::new(RefCell::new(HashMap::new())),
            next_connid: Rc::new(Cell::new(1)),
            listener: Rc::new(RefCell::new(None)),
            timeout_secs: Rc::new(Cell::new(0)),
            checker_spawned: Cell::new(false),
            alive: Rc::new(Cell::new(true)),
            read_buffer_size: ctx.server().read_buffer_size(),
        }
    }

    /// Select the wire protocol. Must be called before `listen`/`connect`;
    /// calling it again once connections exist only affects connections
    /// accepted or dialed afterward.
    pub fn set_protocol(&self, protocol: Protocol) {
        self.protocol.set(Some(protocol));
    }

    fn protocol(&self) -> Protocol {
        self.protocol.get().unwrap_or(Protocol::Default)
    }

    /// Enable the idle-connection sweep: any connection that hasn't seen a
    /// byte in `seconds` gets closed and a `"timeout"` system message sent
    /// to this service. `seconds == 0` disables the sweep. The checker
    /// itself runs on a fixed 10-second cadence, matching the original
    /// component's `settimeout`.
    pub fn set_timeout(&self, seconds: u32) {
        self.timeout_secs.set(seconds);
        if !self.checker_spawned.get() {
            self.checker_spawned.set(true);
            self.spawn_timeout_checker();
        }
    }

    fn spawn_timeout_checker(&self) {
        let conns = self.conns.clone();
        let timeout_secs = self.timeout_secs.clone();
        let alive = self.alive.clone();
        let ctx = self.ctx.clone();
        monoio::spawn(async move {
            loop {
                monoio::time::sleep(Duration::from_secs(10)).await;
                if !alive.get() {
                    return;
                }
                let secs = timeout_secs.get();
                if secs == 0 {
                    continue;
                }
                connection::sweep_idle(&conns, &ctx, Duration::from_secs(secs as u64));
            }
        });
    }

    /// Bind `ip:port` and, for `Default`/`WebSocket`, start an accept loop
    /// that spawns a connection for every incoming socket automatically.
    /// `Custom` binds but waits for an explicit [`TcpManager::async_accept`]
    /// call per connection, matching spec.md §4.3's "accept is one-shot for
    /// the custom protocol" rule. Returns `false` on bind failure.
    pub fn listen(&self, ip: &str, port: u16) -> bool {
        let protocol = self.protocol();
        let addr: SocketAddr = match format!("{ip}:{port}").parse() {
            Ok(a) => a,
            Err(e) => {
                tracing::warn!(ip, port, error = %e, "invalid tcp listen address");
                return false;
            }
        };
        let opts = ListenerOpts::default();
        let listener = match TcpListener::bind_with_config(&addr, &opts) {
            Ok(l) => l,
            Err(e) => {
                tracing::warn!(ip, port, error = %TransportError::Listen(e), "tcp listen failed");
                return false;
            }
        };
        *self.listener.borrow_mut() = Some(listener);
        tracing::info!(service = self.ctx.id(), ip, port, ?protocol, "tcp listening");

        if !matches!(protocol, Protocol::Custom) {
            self.spawn_accept_loop(protocol);
        }
        true
    }

    fn spawn_accept_loop(&self, protocol: Protocol) {
        let listener = self.listener.clone();
        let conns = self.conns.clone();
        let next_connid = self.next_connid.clone();
        let ctx = self.ctx.clone();
        let alive = self.alive.clone();
        let read_buffer_size = self.read_buffer_size;
        monoio::spawn(async move {
            loop {
                if !alive.get() {
                    return;
                }
                let accepted = {
                    let guard = listener.borrow();
                    match guard.as_ref() {
                        Some(l) => l.accept().await,
                        None => return,
                    }
                };
                if !alive.get() {
                    return;
                }
                match accepted {
                    Ok((stream, _addr)) => {
                        let id = connection::allocate_connid(&conns, &next_connid);
                        connection::spawn_connection(id, stream, protocol, conns.clone(), ctx.clone(), alive.clone(), read_buffer_size);
                    }
                    Err(e) => {
                        tracing::warn!(service = ctx.id(), error = %TransportError::Accept(e), "tcp accept error");
                    }
                }
            }
        });
    }

    /// One-shot accept, for the `Custom` protocol only: accept exactly one
    /// connection and reply to `respid` with its connection id (as decimal
    /// text) or an error. A no-op for `Default`/`WebSocket`, which already
    /// auto-accept.
    pub fn async_accept(&self, respid: i32) {
        if !matches!(self.protocol(), Protocol::Custom) {
            return;
        }
        let listener = self.listener.clone();
        let conns = self.conns.clone();
        let next_connid = self.next_connid.clone();
        let ctx = self.ctx.clone();
        let alive = self.alive.clone();
        let read_buffer_size = self.read_buffer_size;
        monoio::spawn(async move {
            let accepted = {
                let guard = listener.borrow();
                match guard.as_ref() {
                    Some(l) => l.accept().await,
                    None => {
                        ctx.server().make_response(
                            ctx.id(),
                            "error",
                            Bytes::from_static(b"async_accept: not listening"),
                            respid,
                            MessageType::Error,
                        );
                        return;
                    }
                }
            };
            if !alive.get() {
                return;
            }
            match accepted {
                Ok((stream, _addr)) => {
                    let id = connection::allocate_connid(&conns, &next_connid);
                    connection::spawn_connection(id, stream, Protocol::Custom, conns.clone(), ctx.clone(), alive.clone(), read_buffer_size);
                    ctx.server().make_response(ctx.id(), "", Bytes::from(id.to_string()), respid, MessageType::Text);
                }
                Err(e) => {
                    ctx.server().make_response(
                        ctx.id(),
                        "error",
                        Bytes::from(TransportError::Accept(e).to_string()),
                        respid,
                        MessageType::Error,
                    );
                }
            }
        });
    }

    /// Dial `ip:port` in the background and reply to `respid` with the new
    /// connection id, or an error.
    pub fn async_connect(&self, ip: &str, port: u16, respid: i32) {
        let target = format!("{ip}:{port}");
        let conns = self.conns.clone();
        let next_connid = self.next_connid.clone();
        let ctx = self.ctx.clone();
        let alive = self.alive.clone();
        let protocol = self.protocol();
        let read_buffer_size = self.read_buffer_size;
        monoio::spawn(async move {
            match TcpStream::connect(&target).await {
                Ok(stream) => {
                    if !alive.get() {
                        return;
                    }
                    let id = connection::allocate_connid(&conns, &next_connid);
                    connection::spawn_connection(id, stream, protocol, conns.clone(), ctx.clone(), alive.clone(), read_buffer_size);
                    ctx.server().make_response(ctx.id(), "", Bytes::from(id.to_string()), respid, MessageType::Text);
                }
                Err(e) => {
                    ctx.server().make_response(
                        ctx.id(),
                        "error",
                        Bytes::from(TransportError::Connect(e).to_string()),
                        respid,
                        MessageType::Error,
                    );
                }
            }
        });
    }

    /// Dial `ip:port` and await the result directly rather than posting a
    /// reply message. There is no blocking-call primitive in an
    /// async-native runtime; this is that contract's natural rendition
    /// here, awaited from inside a handler that is itself driven to
    /// completion by the worker (see spec.md §4.3's `connect`).
    /// Returns `0` on failure.
    pub async fn connect(&self, ip: &str, port: u16) -> u32 {
        let target = format!("{ip}:{port}");
        match TcpStream::connect(&target).await {
            Ok(stream) => {
                let id = connection::allocate_connid(&self.conns, &self.next_connid);
                connection::spawn_connection(
                    id,
                    stream,
                    self.protocol(),
                    self.conns.clone(),
                    self.ctx.clone(),
                    self.alive.clone(),
                    self.read_buffer_size,
                );
                id as u32
            }
            Err(e) => {
                tracing::warn!(service = self.ctx.id(), error = %TransportError::Connect(e), "tcp connect failed");
                0
            }
        }
    }

    /// Request exactly one frame of `n` bytes from `connid`. Only
    /// meaningful for the `Custom` protocol; `Default`/`WebSocket`
    /// connections deliver frames on their own. Returns `false` if
    /// `connid` is unknown or already has a read pending.
    pub fn read(&self, connid: u32, n: usize, respid: i32) -> bool {
        connection::request_read(&self.conns, &self.ctx, connid as u16, ReadKind::Count(n), respid)
    }

    /// As [`TcpManager::read`], but satisfied by the first occurrence of
    /// `delim` rather than a fixed count.
    pub fn read_until(&self, connid: u32, delim: u8, respid: i32) -> bool {
        connection::request_read(&self.conns, &self.ctx, connid as u16, ReadKind::Delimiter(delim), respid)
    }

    /// Queue `data` for writing to `connid`. Returns `false` if `connid` is
    /// unknown or its writer half has already gone away.
    pub fn send(&self, connid: u32, data: impl Into<Bytes>) -> bool {
        connection::enqueue_send(&self.conns, connid as u16, data.into())
    }

    /// Close `connid`. Idempotent: closing an already-closing or unknown
    /// connection is a harmless no-op, per spec.md's testable property 9.
    pub fn close(&self, connid: u32) -> bool {
        connection::request_close(&self.conns, connid as u16)
    }

    /// Close `connid` and forget it immediately, without waiting for the
    /// connection task to notice the cancellation and remove itself.
    pub fn remove(&self, connid: u32) -> bool {
        let closed = connection::request_close(&self.conns, connid as u16);
        self.conns.borrow_mut().remove(&(connid as u16));
        closed
    }

    /// Best-effort Nagle disable. Applied when the connection's socket is
    /// split at event-loop startup; a request arriving after that point is
    /// recorded but cannot be retrofitted onto the already-split socket
    /// halves in this design, so it only takes effect for connections that
    /// haven't started their event loop yet.
    pub fn set_no_delay(&self, connid: u32) {
        connection::request_no_delay(&self.conns, connid as u16);
    }

    pub fn connection_count(&self) -> usize {
        self.conns.borrow().len()
    }

    /// The address actually bound by `listen`, e.g. to discover the real
    /// port after binding to `0`. `None` before `listen` succeeds or after
    /// `shutdown`.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.borrow().as_ref().and_then(|l| l.local_addr().ok())
    }

    /// Tear everything down: cancel the accept loop and the idle checker,
    /// force-close every live connection. Call from
    /// [`crate::ServiceHandler::on_destroy`].
    pub fn shutdown(&self) {
        self.alive.set(false);
        self.listener.borrow_mut().take();
        for (_, shared) in self.conns.borrow_mut().drain() {
            connection::force_close(&shared);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::net::TcpStream as StdTcpStream;
    use std::sync::mpsc;
    use std::time::Duration;

    use super::*;
    use crate::config::RuntimeConfig;
    use crate::message::Message;
    use crate::server::Server;
    use crate::service::ServiceHandler;
    use crate::worker::ServiceContext;

    /// Binds a `TcpManager` to an ephemeral port in its factory (so the
    /// bound address is known before `on_start` ever runs) and forwards
    /// every `Socket`/`System` message it's dispatched onto a channel.
    struct TcpProbe {
        tcp: TcpManager,
        tx: mpsc::Sender<Message>,
    }

    impl ServiceHandler for TcpProbe {
        fn dispatch(&mut self, _ctx: &ServiceContext, msg: Message) {
            let _ = self.tx.send(msg);
        }

        fn on_destroy(&mut self, _ctx: &ServiceContext) {
            self.tcp.shutdown();
        }
    }

    /// Bind a fresh listener on `127.0.0.1:0`, returning the server, its
    /// single worker's frame/close channel, and the address a peer should
    /// dial.
    fn listening_server(timeout_secs: u32) -> (Server, mpsc::Receiver<Message>, std::net::SocketAddr) {
        let (tx, rx) = mpsc::channel();
        let (addr_tx, addr_rx) = mpsc::channel();
        let server = Server::new(RuntimeConfig { worker_threads: 1, ..Default::default() });
        server.add_service(1, "tcp_probe", move |ctx| {
            let tcp = TcpManager::new(ctx);
            tcp.set_protocol(Protocol::Default);
            if timeout_secs > 0 {
                tcp.set_timeout(timeout_secs);
            }
            assert!(tcp.listen("127.0.0.1", 0), "test listener failed to bind");
            let addr = tcp.local_addr().expect("a just-bound listener reports its address");
            let _ = addr_tx.send(addr);
            Box::new(TcpProbe { tcp, tx }) as Box<dyn ServiceHandler>
        });
        server.start();
        let addr = addr_rx.recv_timeout(Duration::from_secs(2)).expect("service never bound its listener");
        (server, rx, addr)
    }

    /// S5: a peer that writes one length-prefixed frame is delivered to the
    /// owning service as a single `Socket` message carrying exactly that
    /// frame's payload.
    #[test]
    fn accepts_and_delivers_a_length_prefixed_frame() {
        let (server, rx, addr) = listening_server(0);

        let mut peer = StdTcpStream::connect(addr).expect("failed to connect to the test listener");
        peer.write_all(&[0, 0, 0, 4, 1, 2, 3, 4]).expect("failed to write the test frame");

        let msg = rx.recv_timeout(Duration::from_secs(2)).expect("service never observed the frame");
        assert_eq!(msg.mtype, MessageType::Socket);
        assert_eq!(&msg.payload[..], &[1, 2, 3, 4]);

        drop(peer);
        server.stop();
        server.wait();
    }

    /// S6: a connection idle past its configured timeout is closed by the
    /// sweep and the owning service is told why.
    ///
    /// Ignored by default: the idle sweep runs on a fixed 10-second
    /// cadence (see `spawn_timeout_checker`), so this test takes upwards
    /// of 10 real seconds. Run explicitly with `cargo test -- --ignored`.
    #[test]
    #[ignore]
    fn idle_connection_is_closed_and_reported() {
        let (server, rx, addr) = listening_server(1);

        let peer = StdTcpStream::connect(addr).expect("failed to connect to the test listener");

        let msg = rx.recv_timeout(Duration::from_secs(15)).expect("service never observed the idle timeout");
        assert_eq!(msg.mtype, MessageType::System);
        assert_eq!(&*msg.header, "timeout");

        drop(peer);
        server.stop();
        server.wait();
    }
}
