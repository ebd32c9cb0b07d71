//! The user-facing handler trait a service implements, and the context it's
//! invoked with.
//!
//! Grounded on the virtual dispatch hooks of the `service` base class in
//! `examples/original_source/core/core/worker.h`/`worker.cpp` (`start`,
//! `update`, `handle_message`, `destroy`) — reshaped as a plain Rust trait
//! rather than a vtable-based base class, in the spirit of
//! `monolake-core/src/service/mod.rs`'s `Service<Request>` trait without its
//! tower-layer machinery (stream composition doesn't apply to an actor
//! mailbox).

use crate::message::Message;
use crate::worker::ServiceContext;

/// Implemented by application code to receive messages dispatched by a
/// [`crate::worker::Worker`]. A handler is pinned to the worker thread that
/// owns it for its entire lifetime and is never required to be `Send`.
pub trait ServiceHandler: 'static {
    /// Invoked once by [`crate::server::Server::start`], after every
    /// current service has been inserted into its worker's table. Calling
    /// it a second time (the contract explicitly allows this) re-invokes
    /// every live service's hook again; implementations must tolerate that.
    fn on_start(&mut self, ctx: &ServiceContext) {
        let _ = ctx;
    }

    /// Handle one routed message. Called from the owning worker's thread
    /// only, never concurrently with another call into the same handler.
    fn dispatch(&mut self, ctx: &ServiceContext, msg: Message);

    /// Called once per worker tick, after the previous tick's deferred
    /// message queue has been drained and before the next one is.
    fn on_update(&mut self, ctx: &ServiceContext) {
        let _ = ctx;
    }

    /// Called by [`crate::worker::WorkerHandle::remove_service`] just
    /// before the service is erased from its worker's table. The handler
    /// gets one last chance to release resources (e.g. close its
    /// [`crate::tcp::TcpManager`]); anything it sends from here still
    /// routes normally.
    fn on_destroy(&mut self, ctx: &ServiceContext) {
        let _ = ctx;
    }

    /// Called on every still-live service when the owning worker is asked
    /// to stop. A well-behaved handler responds by finishing outstanding
    /// work and then calling [`ServiceContext::exit`] to request its own
    /// removal; the worker only becomes `stopped` once every service has
    /// done so.
    fn on_exit(&mut self, ctx: &ServiceContext) {
        ctx.exit();
    }
}
