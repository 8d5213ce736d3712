//! C3 — packet codec (§4.3).
//!
//! Frames and parses the nine wire packet types. Knows nothing about
//! sessions, contacts, or the store: a `Packet` is just bytes in, bytes out.
//! The wire layout is fixed-size binary (`struct.pack` in the original), not
//! JSON, so this is hand-written rather than routed through `serde_json`.

use crate::error::PacketError;

pub const TYPE_EPHEMERAL_KEY: u8 = 0x01;
pub const TYPE_MSG: u8 = 0x02;
pub const TYPE_ACK: u8 = 0x04;
pub const TYPE_RECONNECT_REQ: u8 = 0x05;
pub const TYPE_RECONNECT_RESP: u8 = 0x06;
pub const TYPE_PENDING_SEND: u8 = 0x07;
pub const TYPE_PENDING_DONE: u8 = 0x08;
pub const TYPE_HANDSHAKE_INIT: u8 = 0x10;
pub const TYPE_HANDSHAKE_RESP: u8 = 0x11;

/// Header size: 1-byte type + 4-byte connection id.
const HEADER_LEN: usize = 5;

/// The encrypted-certificate payload shared by `HandshakeInit`/`HandshakeResp`:
/// `static_pub[32] || nonce[12] || ChaCha20-Poly1305(temp_key, cert_der)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakePayload {
    pub static_pub: [u8; 32],
    pub nonce: [u8; 12],
    pub wrapped_cert: Vec<u8>,
}

/// The AEAD envelope shared by `Msg`/`Ack`: `nonce[12] || ciphertext`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AeadEnvelope {
    pub nonce: [u8; 12],
    pub ciphertext: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    EphemeralKey { public_key: [u8; 32] },
    Msg(AeadEnvelope),
    Ack(AeadEnvelope),
    ReconnectReq,
    ReconnectResp,
    PendingSend,
    PendingDone,
    HandshakeInit(HandshakePayload),
    HandshakeResp(HandshakePayload),
}

impl Packet {
    fn type_byte(&self) -> u8 {
        match self {
            Packet::EphemeralKey { .. } => TYPE_EPHEMERAL_KEY,
            Packet::Msg(_) => TYPE_MSG,
            Packet::Ack(_) => TYPE_ACK,
            Packet::ReconnectReq => TYPE_RECONNECT_REQ,
            Packet::ReconnectResp => TYPE_RECONNECT_RESP,
            Packet::PendingSend => TYPE_PENDING_SEND,
            Packet::PendingDone => TYPE_PENDING_DONE,
            Packet::HandshakeInit(_) => TYPE_HANDSHAKE_INIT,
            Packet::HandshakeResp(_) => TYPE_HANDSHAKE_RESP,
        }
    }

    /// Frame this packet behind a 5-byte header: type byte + `cid`, echoed
    /// but never interpreted (§4.3, §9: "opaque four-byte field").
    pub fn encode(&self, cid: u32) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN + 64);
        out.push(self.type_byte());
        out.extend_from_slice(&cid.to_be_bytes());

        match self {
            Packet::EphemeralKey { public_key } => out.extend_from_slice(public_key),
            Packet::Msg(env) | Packet::Ack(env) => {
                out.extend_from_slice(&env.nonce);
                out.extend_from_slice(&env.ciphertext);
            }
            Packet::ReconnectReq
            | Packet::ReconnectResp
            | Packet::PendingSend
            | Packet::PendingDone => {}
            Packet::HandshakeInit(p) | Packet::HandshakeResp(p) => {
                out.extend_from_slice(&p.static_pub);
                out.extend_from_slice(&p.nonce);
                out.extend_from_slice(&p.wrapped_cert);
            }
        }
        out
    }

    /// Parse a received datagram. Shorter-than-header datagrams and unknown
    /// type bytes are reported as errors for the caller to drop silently
    /// (§4.3: "shorter datagrams are dropped silently"; §7: malformed input
    /// is never surfaced above the drop point).
    pub fn decode(datagram: &[u8]) -> Result<(Packet, u32), PacketError> {
        if datagram.len() < HEADER_LEN {
            return Err(PacketError::TooShort);
        }
        let type_byte = datagram[0];
        let cid = u32::from_be_bytes([datagram[1], datagram[2], datagram[3], datagram[4]]);
        let payload = &datagram[HEADER_LEN..];

        let packet = match type_byte {
            TYPE_EPHEMERAL_KEY => {
                let public_key = fixed_32(payload).ok_or(PacketError::TooShort)?;
                Packet::EphemeralKey { public_key }
            }
            TYPE_MSG => Packet::Msg(decode_envelope(payload)?),
            TYPE_ACK => Packet::Ack(decode_envelope(payload)?),
            TYPE_RECONNECT_REQ => Packet::ReconnectReq,
            TYPE_RECONNECT_RESP => Packet::ReconnectResp,
            TYPE_PENDING_SEND => Packet::PendingSend,
            TYPE_PENDING_DONE => Packet::PendingDone,
            TYPE_HANDSHAKE_INIT => Packet::HandshakeInit(decode_handshake(payload)?),
            TYPE_HANDSHAKE_RESP => Packet::HandshakeResp(decode_handshake(payload)?),
            other => return Err(PacketError::UnknownType(other)),
        };
        Ok((packet, cid))
    }
}

fn fixed_32(payload: &[u8]) -> Option<[u8; 32]> {
    payload.get(..32)?.try_into().ok()
}

fn decode_envelope(payload: &[u8]) -> Result<AeadEnvelope, PacketError> {
    if payload.len() < 12 {
        return Err(PacketError::TooShort);
    }
    let nonce: [u8; 12] = payload[..12].try_into().unwrap();
    let ciphertext = payload[12..].to_vec();
    Ok(AeadEnvelope { nonce, ciphertext })
}

fn decode_handshake(payload: &[u8]) -> Result<HandshakePayload, PacketError> {
    if payload.len() < 32 + 12 {
        return Err(PacketError::TooShort);
    }
    let static_pub: [u8; 32] = payload[..32].try_into().unwrap();
    let nonce: [u8; 12] = payload[32..44].try_into().unwrap();
    let wrapped_cert = payload[44..].to_vec();
    Ok(HandshakePayload {
        static_pub,
        nonce,
        wrapped_cert,
    })
}
