//! C5 — store-and-forward coordinator (§4.5).
//!
//! Grounded on `tui.py`'s `send_pending_messages` and its dispatch on
//! `HANDSHAKE_OK_*`/`SESSION_RESTORED_*`/`PEER_SENDING_PENDING`/
//! `SEND_MY_PENDING` events, translated from asyncio callbacks into an
//! explicit coordinator that owns no UI. In the absence of a terminal UI
//! (out of scope, §1) this is also the only consumer of [`ChannelEvent`] in
//! this crate, so it additionally performs the persistence side effects the
//! source's TUI layer used to do inline: appending received messages,
//! marking acks delivered, and falling back to a fresh handshake after a
//! reconnect timeout.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use log::{info, warn};

use crate::channel::SecureChannel;
use crate::event::{ChannelEvent, Role};
use crate::store::model::MessageStatus;
use crate::store::Store;

pub struct ForwardCoordinator {
    store: Arc<Store>,
    pace: Duration,
}

impl ForwardCoordinator {
    pub fn new(store: Arc<Store>, pace: Duration) -> Self {
        ForwardCoordinator { store, pace }
    }

    /// Dispatch a single channel event, performing whatever store mutation
    /// and/or flush it implies.
    pub async fn handle_event(&self, channel: &mut SecureChannel, event: ChannelEvent) {
        match event {
            ChannelEvent::SessionsReady => {
                info!("channel ready");
            }
            ChannelEvent::HandshakeOk { addr, role, peer_name } => {
                info!("handshake ok with {peer_name} ({addr}), role={role:?}");
                if role == Role::Initiator {
                    self.flush(channel, addr).await;
                }
            }
            ChannelEvent::SessionRestored { addr, role, peer_name } => {
                info!("session restored with {peer_name} ({addr}), role={role:?}");
                if role == Role::Initiator {
                    self.flush(channel, addr).await;
                }
            }
            ChannelEvent::ReconnectTimeout { addr } => {
                warn!("reconnect timed out for {addr}, falling back to fresh handshake");
                channel.start_fresh_handshake(addr);
            }
            ChannelEvent::PeerSendingPending { addr } => {
                info!("peer at {addr} is flushing its pending messages");
            }
            ChannelEvent::SendMyPending { addr } => {
                self.flush(channel, addr).await;
            }
            ChannelEvent::Ack { addr, msg_id } => {
                if let Some(contact_key) = channel.contact_key_for(addr) {
                    if let Err(e) =
                        self.store.set_message_status(&contact_key, &msg_id, MessageStatus::Delivered)
                    {
                        warn!("failed to mark {msg_id} delivered: {e}");
                    }
                }
            }
            ChannelEvent::Message { addr, text, msg_id } => {
                let Some(contact_key) = channel.contact_key_for(addr) else {
                    return;
                };
                let peer_name = channel.peer_name_for(addr).unwrap_or_else(|| contact_key.clone());
                if let Err(e) = self.store.append_message(
                    &contact_key,
                    &peer_name,
                    &text,
                    MessageStatus::Received,
                    None,
                    msg_id,
                ) {
                    warn!("failed to store message from {contact_key}: {e}");
                }
            }
        }
    }

    /// §4.5 steps 1-3: send `PendingSend`, flush every `pending` message for
    /// this contact in insertion order, pacing between each, then send
    /// `PendingDone`. Duplicate suppression across a replayed flush relies
    /// entirely on `Store::append_message`'s `msg_id` idempotence on the
    /// receiving side.
    async fn flush(&self, channel: &mut SecureChannel, addr: SocketAddr) {
        let Some(contact_key) = channel.contact_key_for(addr) else {
            return;
        };
        let pending = self.store.pending(&contact_key);

        channel.send_pending_send(addr);
        for msg in pending {
            if channel.send(addr, &msg.text, Some(&msg.id)) {
                if let Err(e) =
                    self.store.set_message_status(&contact_key, &msg.id, MessageStatus::Sent)
                {
                    warn!("failed to mark {} sent: {e}", msg.id);
                }
            }
            tokio::time::sleep(self.pace).await;
        }
        channel.send_pending_done(addr);
    }
}
