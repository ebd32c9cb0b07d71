//! The message envelope that flows between services.
//!
//! Grounded on `examples/original_source/core/core/worker.h`'s `message`
//! struct and `worker.cpp`'s `make_response`/`handle_one`: sender and
//! receiver are service ids, `responseid` carries the request/reply sign
//! convention (positive = request awaiting a reply, negative = the reply
//! itself, zero = fire-and-forget).

use bytes::Bytes;

/// What kind of payload a [`Message`] is carrying, mirroring the `PTYPE_*`
/// tags read off the wire in `tcp.cpp`'s `make_response` calls
/// (`PTYPE_SYSTEM`, `PTYPE_SOCKET`, `PTYPE_TEXT`, `PTYPE_ERROR`) plus a
/// catch-all for ordinary service-to-service traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    /// Ordinary application traffic between services.
    User,
    /// Infrastructure-originated lifecycle notification (service exit,
    /// connection close cause).
    System,
    /// A framed payload delivered by a [`crate::tcp::TcpManager`], or data
    /// destined for one.
    Socket,
    /// A short textual reply, e.g. a connection id rendered as decimal text.
    Text,
    /// An error reply produced by the dispatcher or a manager (e.g. "call
    /// dead service", a transport failure) rather than by the receiving
    /// service.
    Error,
}

/// An envelope routed between services by a [`crate::worker::Worker`] or
/// across workers by the [`crate::server::Server`].
#[derive(Debug, Clone)]
pub struct Message {
    pub sender: u32,
    pub receiver: u32,
    /// Positive: a request, the receiver should reply with `-responseid`.
    /// Negative: a reply to an earlier request. Zero: no reply expected.
    pub responseid: i32,
    pub mtype: MessageType,
    pub header: Box<str>,
    pub payload: Bytes,
    /// When set, `receiver` is ignored and the message is fanned out to
    /// every other service sharing the sender's worker.
    pub broadcast: bool,
}

impl Message {
    pub fn new(
        sender: u32,
        receiver: u32,
        responseid: i32,
        header: impl Into<Box<str>>,
        payload: impl Into<Bytes>,
    ) -> Self {
        Message {
            sender,
            receiver,
            responseid,
            mtype: MessageType::User,
            header: header.into(),
            payload: payload.into(),
            broadcast: false,
        }
    }

    pub fn with_type(mut self, mtype: MessageType) -> Self {
        self.mtype = mtype;
        self
    }

    /// A message fanned out to every other service on the sender's worker.
    /// `receiver` carries no meaning for a broadcast and is left `0`.
    pub fn broadcast(sender: u32, header: impl Into<Box<str>>, payload: impl Into<Bytes>) -> Self {
        Message {
            sender,
            receiver: 0,
            responseid: 0,
            mtype: MessageType::System,
            header: header.into(),
            payload: payload.into(),
            broadcast: true,
        }
    }

    pub fn is_broadcast(&self) -> bool {
        self.broadcast
    }

    pub fn is_request(&self) -> bool {
        self.responseid > 0
    }

    pub fn is_reply(&self) -> bool {
        self.responseid < 0
    }

    /// Build the reply to this message, swapping sender/receiver and
    /// negating the response id. Debug-only assertion that this message was
    /// actually a request: replying to a fire-and-forget or to an existing
    /// reply is a programmer error, not a runtime condition to recover from.
    pub fn reply(&self, header: impl Into<Box<str>>, payload: impl Into<Bytes>) -> Message {
        debug_assert!(self.is_request(), "reply() called on a non-request message");
        Message {
            sender: self.receiver,
            receiver: self.sender,
            responseid: -self.responseid,
            mtype: MessageType::User,
            header: header.into(),
            payload: payload.into(),
            broadcast: false,
        }
    }

    pub fn error_reply(&self, reason: impl Into<Box<str>>) -> Message {
        debug_assert!(self.is_request(), "error_reply() called on a non-request message");
        Message {
            sender: self.receiver,
            receiver: self.sender,
            responseid: -self.responseid,
            mtype: MessageType::Error,
            header: reason.into(),
            payload: Bytes::new(),
            broadcast: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reply_negates_responseid_and_swaps_endpoints() {
        let req = Message::new(0x01000001, 0x02000001, 7, "ping", Bytes::from_static(b"hi"));
        let rep = req.reply("pong", Bytes::from_static(b"ok"));
        assert_eq!(rep.sender, req.receiver);
        assert_eq!(rep.receiver, req.sender);
        assert_eq!(rep.responseid, -7);
        assert!(rep.is_reply());
    }

    #[test]
    fn fire_and_forget_has_zero_responseid() {
        let msg = Message::new(1, 2, 0, "note", Bytes::new());
        assert!(!msg.is_request());
        assert!(!msg.is_reply());
    }

    #[test]
    fn broadcast_ignores_receiver() {
        let msg = Message::broadcast(1, "exit", Bytes::from_static(b"service exit"));
        assert!(msg.is_broadcast());
        assert_eq!(msg.receiver, 0);
        assert_eq!(msg.mtype, MessageType::System);
    }

    #[test]
    fn error_reply_carries_error_type_and_negated_id() {
        let req = Message::new(0x01000001, 0x01000099, 3, "ping", Bytes::new());
        let err = req.error_reply("call dead service.");
        assert_eq!(err.mtype, MessageType::Error);
        assert_eq!(err.responseid, -3);
        assert_eq!(&*err.header, "call dead service.");
    }
}
