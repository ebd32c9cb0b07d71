//! Demo binary: a worker pool running a single echo service over the
//! default length-prefixed TCP protocol. Exercises the full path from
//! `tidelake-core` — config, `Server`, `ServiceHandler`, `TcpManager` — the
//! way a small standalone consumer of the crate would.
//!
//! No CLI parsing or config-file loading: the embedder is expected to
//! build its own `RuntimeConfig`, this binary just shows the shape.

use tidelake_core::config::RuntimeConfig;
use tidelake_core::tcp::{Protocol, TcpManager};
use tidelake_core::{Message, MessageType, Server, ServiceContext, ServiceHandler};

struct EchoService {
    tcp: TcpManager,
}

impl EchoService {
    fn new(ctx: &ServiceContext) -> Self {
        EchoService { tcp: TcpManager::new(ctx) }
    }
}

impl ServiceHandler for EchoService {
    fn on_start(&mut self, ctx: &ServiceContext) {
        self.tcp.set_protocol(Protocol::Default);
        self.tcp.set_timeout(300);
        if self.tcp.listen("127.0.0.1", 7878) {
            tracing::info!(service = ctx.id(), "echo service listening on 127.0.0.1:7878");
        } else {
            tracing::error!(service = ctx.id(), "echo service failed to bind 127.0.0.1:7878");
        }
    }

    fn dispatch(&mut self, ctx: &ServiceContext, msg: Message) {
        match msg.mtype {
            MessageType::Socket => {
                let connid = msg.sender;
                tracing::debug!(service = ctx.id(), connid, bytes = msg.payload.len(), "echoing frame");
                self.tcp.send(connid, msg.payload);
            }
            MessageType::System => {
                tracing::info!(service = ctx.id(), connid = msg.sender, reason = %msg.header, "connection closed");
            }
            _ => {}
        }
    }

    fn on_destroy(&mut self, _ctx: &ServiceContext) {
        self.tcp.shutdown();
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let config = RuntimeConfig::default();
    let server = Server::new(config);

    server.add_service(1, "echo", |ctx| Box::new(EchoService::new(ctx)) as Box<dyn ServiceHandler>);
    server.start();
    let ticker = server.spawn_ticker();

    tracing::info!("tidelake running, press enter to stop");
    let mut line = String::new();
    std::io::stdin().read_line(&mut line).ok();

    server.stop();
    ticker.stop();
    server.wait();
    Ok(())
}
