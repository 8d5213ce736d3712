//! Service discovery boundary (§1, §6, §10.5).
//!
//! The mDNS-style discovery helper is an external collaborator: this crate
//! only names the shape of what it hands back. No implementation lives
//! here. Grounded on the teacher's `PeerInfo` struct, trimmed to the three
//! fields §6 actually specifies.

use std::net::IpAddr;

/// A `(nickname, ip, port)` triple surfaced by an external discovery
/// component. The channel accepts any address it is told about and does not
/// require that a peer was ever discovered before talking to it (§6).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerHint {
    pub nickname: String,
    pub ip: IpAddr,
    pub port: u16,
}
