//! Upper-layer event type (§6, §9).
//!
//! Replaces the source's single callback taking `(addr?, event_string,
//! peer_name, msg_id?)` with a tagged enum, per §9's explicit instruction.
//! The event-string constants named in §6 map one-to-one onto variants here.

use std::net::SocketAddr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Responder,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// `addr = null` with event `SESSIONS_READY` in the source (§6): the
    /// channel is bound and ready to handle datagrams.
    SessionsReady,
    HandshakeOk { addr: SocketAddr, role: Role, peer_name: String },
    SessionRestored { addr: SocketAddr, role: Role, peer_name: String },
    ReconnectTimeout { addr: SocketAddr },
    PeerSendingPending { addr: SocketAddr },
    SendMyPending { addr: SocketAddr },
    Ack { addr: SocketAddr, msg_id: String },
    Message { addr: SocketAddr, text: String, msg_id: Option<String> },
}
