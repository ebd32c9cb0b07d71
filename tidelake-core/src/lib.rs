//! In-process actor runtime and protocol-aware TCP connection manager.
//!
//! A fixed pool of single-threaded [`worker`]s hosts any number of
//! [`service`]s that exchange [`message::Message`]s through
//! [`server::Server`] routing; [`tcp`] frames inbound bytes for one of
//! three wire protocols and delivers complete frames to their owning
//! service as ordinary messages.

#[macro_use]
mod error;
pub use error::{AddressingError, AnyError, AnyResult, TransportError};

pub mod config;
pub mod ids;
pub mod message;
pub mod server;
pub mod service;
pub mod tcp;
pub mod worker;

pub use message::{Message, MessageType};
pub use server::{Server, ServerHandle};
pub use service::ServiceHandler;
pub use worker::{ServiceContext, WorkerHandle};
