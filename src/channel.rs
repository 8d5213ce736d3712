//! C4 — secure channel (§4.4), the hard part.
//!
//! Per-`addr` state machine: ephemeral handshake slot, established session,
//! or pending-reconnect marker. Grounded almost line-for-line on
//! `examples/original_source/scripts/protocol.py`'s `SecureIMProtocol`; the
//! "one UDP socket, per-peer `HashMap` state" shape comes from the teacher's
//! `signaling.rs`, adapted from blocking `std::thread` + `UdpSocket` to
//! `tokio::net::UdpSocket` + `tokio::select!` (§5's single-threaded
//! cooperative scheduler).

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use blake2::{Blake2s256, Digest};
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key as ChaChaKey, Nonce as ChaChaNonce};
use log::{debug, trace, warn};
use rand::RngCore;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::{interval, Duration, MissedTickBehavior};
use x25519_dalek::{PublicKey, StaticSecret};

use crate::config::Config;
use crate::credential::{parse_identity, CredentialProvider};
use crate::error::ChannelError;
use crate::event::{ChannelEvent, Role};
use crate::packet::{AeadEnvelope, HandshakePayload, Packet};
use crate::store::{ContactFields, Store};

/// Ephemeral handshake slot: short-lived key material used only to protect
/// the certificate in transit (§4.4, glossary "ephemeral key pair").
struct EphemeralSlot {
    private: Option<StaticSecret>,
    public: [u8; 32],
    temp_cipher: Option<ChaCha20Poly1305>,
}

struct EstablishedSession {
    cipher: ChaCha20Poly1305,
    peer_name: String,
    contact_key: String,
    consecutive_decrypt_failures: u32,
}

struct PendingReconnect {
    contact_key: String,
    timestamp: Instant,
}

enum PeerState {
    Ephemeral(EphemeralSlot),
    Established(EstablishedSession),
}

pub struct SecureChannel {
    socket: Arc<UdpSocket>,
    credential: Arc<dyn CredentialProvider>,
    store: Arc<Store>,
    config: Config,
    cid: u32,
    states: HashMap<SocketAddr, PeerState>,
    reconnect_pending: HashMap<SocketAddr, PendingReconnect>,
    pending_flush_done: HashMap<SocketAddr, bool>,
    events: mpsc::UnboundedSender<ChannelEvent>,
    ack_scanner: tokio::time::Interval,
    reconnect_scanner: tokio::time::Interval,
}

impl SecureChannel {
    pub async fn bind(
        bind_addr: SocketAddr,
        credential: Arc<dyn CredentialProvider>,
        store: Arc<Store>,
        config: Config,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ChannelEvent>), ChannelError> {
        let socket = UdpSocket::bind(bind_addr).await?;
        let (tx, rx) = mpsc::unbounded_channel();
        let mut cid_bytes = [0u8; 4];
        rand::thread_rng().fill_bytes(&mut cid_bytes);

        let mut ack_scanner = interval(config.ack_scan_interval());
        ack_scanner.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut reconnect_scanner = interval(config.reconnect_scan_interval());
        reconnect_scanner.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let channel = SecureChannel {
            socket: Arc::new(socket),
            credential,
            store,
            config,
            cid: u32::from_be_bytes(cid_bytes),
            states: HashMap::new(),
            reconnect_pending: HashMap::new(),
            pending_flush_done: HashMap::new(),
            events: tx,
            ack_scanner,
            reconnect_scanner,
        };
        // `addr = null` with event `SESSIONS_READY` in the source (§6).
        let _ = channel.events.send(ChannelEvent::SessionsReady);
        Ok((channel, rx))
    }

    /// Drive exactly one suspension point (§5: "receiving a datagram", "the
    /// ack-timeout scanner", "the reconnect-timeout scanner"), then return.
    /// Callers loop this alongside draining the event receiver, so that
    /// event handlers needing `&mut SecureChannel` (e.g. the forward
    /// coordinator's flush) never race the socket read — the single-threaded
    /// cooperative model of §5 needs no lock to make that true.
    pub async fn step(&mut self) -> Result<(), ChannelError> {
        let mut buf = [0u8; 2048];
        tokio::select! {
            result = self.socket.recv_from(&mut buf) => {
                let (len, addr) = result?;
                self.on_datagram(&buf[..len], addr);
            }
            _ = self.ack_scanner.tick() => {
                self.scan_ack_timeouts();
            }
            _ = self.reconnect_scanner.tick() => {
                self.scan_reconnect_timeouts();
            }
        }
        Ok(())
    }

    fn on_datagram(&mut self, datagram: &[u8], addr: SocketAddr) {
        let (packet, _cid) = match Packet::decode(datagram) {
            Ok(parsed) => parsed,
            Err(e) => {
                trace!("dropping malformed datagram from {addr}: {e}");
                return;
            }
        };

        self.touch_reconnect(addr);

        match packet {
            Packet::EphemeralKey { public_key } => self.on_ephemeral_key(addr, public_key),
            Packet::HandshakeInit(payload) => self.on_handshake(addr, payload, Role::Responder),
            Packet::HandshakeResp(payload) => self.on_handshake(addr, payload, Role::Initiator),
            Packet::Msg(env) => self.on_message(addr, env),
            Packet::Ack(env) => self.on_ack(addr, env),
            Packet::ReconnectReq => self.on_reconnect_req(addr),
            Packet::ReconnectResp => self.on_reconnect_resp(addr),
            Packet::PendingSend => self.on_pending_send(addr),
            Packet::PendingDone => self.on_pending_done(addr),
        }
    }

    /// Refresh the reconnect-pending timestamp on any traffic from `addr`
    /// (`touch_session` in the source: avoids a false timeout while a
    /// resumption exchange is actually in flight).
    fn touch_reconnect(&mut self, addr: SocketAddr) {
        if let Some(pending) = self.reconnect_pending.get_mut(&addr) {
            pending.timestamp = Instant::now();
        }
    }

    // ---- fresh handshake -------------------------------------------------

    /// Begin a fresh handshake as initiator: generate an ephemeral pair,
    /// store it, send `EphemeralKey` (§4.4).
    pub fn start_fresh_handshake(&mut self, addr: SocketAddr) {
        let (private, public) = generate_ephemeral();
        self.states.insert(
            addr,
            PeerState::Ephemeral(EphemeralSlot {
                private: Some(private),
                public,
                temp_cipher: None,
            }),
        );
        self.send_packet(addr, &Packet::EphemeralKey { public_key: public });
    }

    fn on_ephemeral_key(&mut self, addr: SocketAddr, peer_public: [u8; 32]) {
        // A stray/replayed `EphemeralKey` must never clobber an already
        // established session (§4.4); mirrors the guard at the top of
        // `on_handshake` for the handshake-packet path.
        if matches!(self.states.get(&addr), Some(PeerState::Established(_))) {
            return;
        }
        let is_initiator = matches!(self.states.get(&addr), Some(PeerState::Ephemeral(_)));

        if !is_initiator {
            let (private, public) = generate_ephemeral();
            self.states.insert(
                addr,
                PeerState::Ephemeral(EphemeralSlot {
                    private: Some(private),
                    public,
                    temp_cipher: None,
                }),
            );
            self.send_packet(addr, &Packet::EphemeralKey { public_key: public });
        }

        let Some(PeerState::Ephemeral(slot)) = self.states.get_mut(&addr) else {
            return;
        };
        let Some(private) = slot.private.take() else {
            return;
        };
        let shared = private.diffie_hellman(&PublicKey::from(peer_public));
        let temp_key = blake2s256(shared.as_bytes());
        slot.temp_cipher = Some(ChaCha20Poly1305::new(ChaChaKey::from_slice(&temp_key)));

        if is_initiator {
            self.send_handshake_packet(addr, true);
        } else {
            self.send_handshake_packet(addr, false);
        }
    }

    fn send_handshake_packet(&mut self, addr: SocketAddr, is_init: bool) {
        let Some(PeerState::Ephemeral(slot)) = self.states.get(&addr) else {
            return;
        };
        let Some(temp_cipher) = &slot.temp_cipher else {
            return;
        };

        let mut nonce_bytes = [0u8; 12];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let cert_der = self.credential.certificate_der();
        let wrapped_cert = match temp_cipher.encrypt(ChaChaNonce::from_slice(&nonce_bytes), cert_der) {
            Ok(ct) => ct,
            Err(e) => {
                warn!("failed to wrap certificate for {addr}: {e}");
                return;
            }
        };
        let payload = HandshakePayload {
            static_pub: self.credential.static_public_key(),
            nonce: nonce_bytes,
            wrapped_cert,
        };
        let packet = if is_init {
            Packet::HandshakeInit(payload)
        } else {
            Packet::HandshakeResp(payload)
        };
        self.send_packet(addr, &packet);
    }

    fn on_handshake(&mut self, addr: SocketAddr, payload: HandshakePayload, role: Role) {
        if matches!(self.states.get(&addr), Some(PeerState::Established(_))) {
            return;
        }
        let Some(PeerState::Ephemeral(slot)) = self.states.get(&addr) else {
            return;
        };
        let Some(temp_cipher) = &slot.temp_cipher else {
            return;
        };

        let cert_der = match temp_cipher.decrypt(
            ChaChaNonce::from_slice(&payload.nonce),
            payload.wrapped_cert.as_ref(),
        ) {
            Ok(plaintext) => plaintext,
            Err(_) => {
                debug!("certificate decryption failed for {addr}, discarding ephemeral slot");
                self.states.remove(&addr);
                return;
            }
        };

        let (peer_name, _serial) = parse_identity(&cert_der);
        let shared = self.credential.exchange(&payload.static_pub);
        let session_key = blake2s256(&shared);
        let cipher = ChaCha20Poly1305::new(ChaChaKey::from_slice(&session_key));

        let contact_key = self.resolve_contact_key(addr, &peer_name);
        if let Err(e) = self.store.upsert_contact(
            &contact_key,
            ContactFields {
                name: Some(peer_name.clone()),
                ip: Some(addr.ip().to_string()),
                port: Some(addr.port()),
                session_key: Some(hex::encode(session_key)),
                peer_cert: Some(hex::encode(&cert_der)),
            },
        ) {
            warn!("failed to persist contact {contact_key}: {e}");
        }

        self.states.insert(
            addr,
            PeerState::Established(EstablishedSession {
                cipher,
                peer_name: peer_name.clone(),
                contact_key,
                consecutive_decrypt_failures: 0,
            }),
        );

        let _ = self.events.send(ChannelEvent::HandshakeOk {
            addr,
            role,
            peer_name,
        });
    }

    /// Reuse an existing contact key whose `(ip, port)` matches, otherwise
    /// key by the peer's name (§4.4 step 4).
    fn resolve_contact_key(&self, addr: SocketAddr, peer_name: &str) -> String {
        let ip = addr.ip().to_string();
        let port = addr.port();
        for (key, contact) in self.store.contacts() {
            if contact.ip.as_deref() == Some(ip.as_str()) && contact.port == Some(port) {
                return key;
            }
        }
        peer_name.to_string()
    }

    /// The contact key an established session at `addr` is persisted under,
    /// if any. Used by the store-and-forward coordinator to flush pending
    /// messages without duplicating the channel's own bookkeeping.
    pub fn contact_key_for(&self, addr: SocketAddr) -> Option<String> {
        match self.states.get(&addr) {
            Some(PeerState::Established(session)) => Some(session.contact_key.clone()),
            _ => None,
        }
    }

    pub fn peer_name_for(&self, addr: SocketAddr) -> Option<String> {
        match self.states.get(&addr) {
            Some(PeerState::Established(session)) => Some(session.peer_name.clone()),
            _ => None,
        }
    }

    pub fn has_session(&self, addr: SocketAddr) -> bool {
        matches!(self.states.get(&addr), Some(PeerState::Established(_)))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.socket.local_addr().expect("bound socket always has a local address")
    }

    // ---- resumption -------------------------------------------------------

    /// Attempt resumption against a contact's stored `session_key`. Returns
    /// `false` if no stored key exists; the caller then falls back to a
    /// fresh handshake (§4.4).
    pub fn start_resumption(&mut self, addr: SocketAddr, contact_key: &str) -> bool {
        let Some(contact) = self.store.contact(contact_key) else {
            return false;
        };
        let Some(session_key) = self.store.session_key(contact_key) else {
            return false;
        };
        let cipher = ChaCha20Poly1305::new(ChaChaKey::from_slice(&session_key));
        self.states.insert(
            addr,
            PeerState::Established(EstablishedSession {
                cipher,
                peer_name: contact.name,
                contact_key: contact_key.to_string(),
                consecutive_decrypt_failures: 0,
            }),
        );
        self.reconnect_pending.insert(
            addr,
            PendingReconnect {
                contact_key: contact_key.to_string(),
                timestamp: Instant::now(),
            },
        );
        self.send_packet(addr, &Packet::ReconnectReq);
        true
    }

    fn on_reconnect_req(&mut self, addr: SocketAddr) {
        let ip = addr.ip().to_string();
        let port = addr.port();
        let matching = self.store.contacts().into_iter().find(|(_, c)| {
            c.ip.as_deref() == Some(ip.as_str()) && c.port == Some(port) && c.session_key.is_some()
        });
        let Some((contact_key, contact)) = matching else {
            return;
        };
        let Some(session_key) = self.store.session_key(&contact_key) else {
            return;
        };
        let cipher = ChaCha20Poly1305::new(ChaChaKey::from_slice(&session_key));
        self.states.insert(
            addr,
            PeerState::Established(EstablishedSession {
                cipher,
                peer_name: contact.name.clone(),
                contact_key: contact_key.clone(),
                consecutive_decrypt_failures: 0,
            }),
        );
        if let Err(e) = self.store.set_connected(&contact_key, true) {
            warn!("failed to mark {contact_key} connected: {e}");
        }
        self.send_packet(addr, &Packet::ReconnectResp);
        let _ = self.events.send(ChannelEvent::SessionRestored {
            addr,
            role: Role::Responder,
            peer_name: contact.name,
        });
    }

    fn on_reconnect_resp(&mut self, addr: SocketAddr) {
        let Some(pending) = self.reconnect_pending.remove(&addr) else {
            return;
        };
        let Some(PeerState::Established(session)) = self.states.get(&addr) else {
            return;
        };
        if let Err(e) = self.store.set_connected(&pending.contact_key, true) {
            warn!("failed to mark {} connected: {e}", pending.contact_key);
        }
        let _ = self.events.send(ChannelEvent::SessionRestored {
            addr,
            role: Role::Initiator,
            peer_name: session.peer_name.clone(),
        });
    }

    fn scan_reconnect_timeouts(&mut self) {
        let deadline = self.config.reconnect_deadline();
        let now = Instant::now();
        let timed_out: Vec<SocketAddr> = self
            .reconnect_pending
            .iter()
            .filter(|(_, info)| now.duration_since(info.timestamp) > deadline)
            .map(|(addr, _)| *addr)
            .collect();

        for addr in timed_out {
            self.reconnect_pending.remove(&addr);
            self.states.remove(&addr);
            let _ = self.events.send(ChannelEvent::ReconnectTimeout { addr });
        }
    }

    // ---- messaging ----------------------------------------------------

    /// Requires an established session. Returns `false` if none is
    /// installed or transport emission fails; the caller demotes the
    /// message to `pending` on `false` (§4.4).
    pub fn send(&mut self, addr: SocketAddr, text: &str, msg_id: Option<&str>) -> bool {
        let Some(PeerState::Established(session)) = self.states.get(&addr) else {
            return false;
        };
        let plaintext = match msg_id {
            Some(id) => format!("{id}|{text}"),
            None => text.to_string(),
        };
        let mut nonce_bytes = [0u8; 12];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let ciphertext = match session
            .cipher
            .encrypt(ChaChaNonce::from_slice(&nonce_bytes), plaintext.as_bytes())
        {
            Ok(ct) => ct,
            Err(_) => return false,
        };
        self.send_packet(
            addr,
            &Packet::Msg(AeadEnvelope {
                nonce: nonce_bytes,
                ciphertext,
            }),
        )
    }

    fn on_message(&mut self, addr: SocketAddr, env: AeadEnvelope) {
        let Some(PeerState::Established(session)) = self.states.get(&addr) else {
            return;
        };
        let plaintext = match session
            .cipher
            .decrypt(ChaChaNonce::from_slice(&env.nonce), env.ciphertext.as_ref())
        {
            Ok(pt) => pt,
            Err(_) => {
                self.on_message_decrypt_failure(addr);
                return;
            }
        };
        let Ok(text) = String::from_utf8(plaintext) else {
            return;
        };

        if let Some(PeerState::Established(session)) = self.states.get_mut(&addr) {
            session.consecutive_decrypt_failures = 0;
        }

        // Splits only on the first `|`: message text may itself contain `|`
        // bytes (§4.3).
        let (msg_id, body) = match text.split_once('|') {
            Some((id, rest)) => (Some(id.to_string()), rest.to_string()),
            None => (None, text),
        };

        if let Some(id) = &msg_id {
            self.send_ack(addr, id);
        }

        let _ = self.events.send(ChannelEvent::Message {
            addr,
            text: body,
            msg_id,
        });
    }

    /// §9 open question: the source never invalidates a session on `Msg`
    /// decryption failure alone. `Config::max_consecutive_decrypt_failures`
    /// is the conservative opt-in; unset (the default) reproduces the
    /// source's behaviour exactly.
    fn on_message_decrypt_failure(&mut self, addr: SocketAddr) {
        let Some(threshold) = self.config.max_consecutive_decrypt_failures else {
            return;
        };
        let Some(PeerState::Established(session)) = self.states.get_mut(&addr) else {
            return;
        };
        session.consecutive_decrypt_failures += 1;
        if session.consecutive_decrypt_failures < threshold {
            return;
        }
        let contact_key = session.contact_key.clone();
        warn!("tearing down session with {addr} after {threshold} consecutive decrypt failures");
        self.states.remove(&addr);
        self.pending_flush_done.remove(&addr);
        if let Err(e) = self.store.set_connected(&contact_key, false) {
            warn!("failed to mark {contact_key} disconnected: {e}");
        }
    }

    fn send_ack(&mut self, addr: SocketAddr, msg_id: &str) {
        let Some(PeerState::Established(session)) = self.states.get(&addr) else {
            return;
        };
        let mut nonce_bytes = [0u8; 12];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let Ok(ciphertext) = session
            .cipher
            .encrypt(ChaChaNonce::from_slice(&nonce_bytes), msg_id.as_bytes())
        else {
            return;
        };
        self.send_packet(
            addr,
            &Packet::Ack(AeadEnvelope {
                nonce: nonce_bytes,
                ciphertext,
            }),
        );
    }

    fn on_ack(&mut self, addr: SocketAddr, env: AeadEnvelope) {
        let Some(PeerState::Established(session)) = self.states.get(&addr) else {
            return;
        };
        let Ok(plaintext) = session
            .cipher
            .decrypt(ChaChaNonce::from_slice(&env.nonce), env.ciphertext.as_ref())
        else {
            return;
        };
        let Ok(msg_id) = String::from_utf8(plaintext) else {
            return;
        };
        let _ = self.events.send(ChannelEvent::Ack { addr, msg_id });
    }

    // ---- pending signalling --------------------------------------------

    pub fn send_pending_send(&mut self, addr: SocketAddr) {
        self.send_packet(addr, &Packet::PendingSend);
    }

    pub fn send_pending_done(&mut self, addr: SocketAddr) {
        self.send_packet(addr, &Packet::PendingDone);
    }

    fn on_pending_send(&mut self, addr: SocketAddr) {
        if !matches!(self.states.get(&addr), Some(PeerState::Established(_))) {
            return;
        }
        let _ = self.events.send(ChannelEvent::PeerSendingPending { addr });
    }

    /// Once-only-flush guard: a peer replaying `PendingDone` must not
    /// trigger a second `SendMyPending` (§4.5 step 2).
    fn on_pending_done(&mut self, addr: SocketAddr) {
        if !matches!(self.states.get(&addr), Some(PeerState::Established(_))) {
            return;
        }
        if *self.pending_flush_done.get(&addr).unwrap_or(&false) {
            return;
        }
        self.pending_flush_done.insert(addr, true);
        let _ = self.events.send(ChannelEvent::SendMyPending { addr });
    }

    pub fn reset_pending_flush_guard(&mut self, addr: SocketAddr) {
        self.pending_flush_done.remove(&addr);
    }

    // ---- ack timeout / teardown ----------------------------------------

    /// Session-bearing peer goes quiet longer than the ack timeout: tear
    /// down and requeue in-flight messages as `pending` (§4.4, §7, scenario
    /// 5). Driven by [`Store::check_timeouts`], which owns the per-message
    /// `sent_timestamp` bookkeeping.
    fn scan_ack_timeouts(&mut self) {
        let ack_timeout = self.config.ack_timeout().as_secs_f64();
        let addrs: Vec<(SocketAddr, String)> = self
            .states
            .iter()
            .filter_map(|(addr, state)| match state {
                PeerState::Established(session) => Some((*addr, session.contact_key.clone())),
                PeerState::Ephemeral(_) => None,
            })
            .collect();

        for (addr, contact_key) in addrs {
            match self.store.check_timeouts(&contact_key, ack_timeout) {
                Ok(true) => {
                    self.states.remove(&addr);
                    self.pending_flush_done.remove(&addr);
                    if let Err(e) = self.store.set_connected(&contact_key, false) {
                        warn!("failed to mark {contact_key} disconnected: {e}");
                    }
                }
                Ok(false) => {}
                Err(e) => warn!("ack-timeout scan failed for {contact_key}: {e}"),
            }
        }
    }

    fn send_packet(&self, addr: SocketAddr, packet: &Packet) -> bool {
        let bytes = packet.encode(self.cid);
        match self.socket.try_send_to(&bytes, addr) {
            Ok(_) => true,
            Err(e) => {
                debug!("send to {addr} failed: {e}");
                false
            }
        }
    }
}

fn generate_ephemeral() -> (StaticSecret, [u8; 32]) {
    let private = StaticSecret::random_from_rng(rand::thread_rng());
    let public = PublicKey::from(&private).to_bytes();
    (private, public)
}

fn blake2s256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Blake2s256::new();
    hasher.update(data);
    hasher.finalize().into()
}
