//! In-memory shape of the encrypted database blob (§3).

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Pending,
    Sent,
    Delivered,
    Received,
    System,
    Error,
}

/// The sentinel sender name for locally-generated notices (§3).
pub const SYSTEM_SENDER: &str = "Sys";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub sender: String,
    pub text: String,
    pub timestamp: String,
    pub status: MessageStatus,
    #[serde(default)]
    pub read: bool,
    /// Monotonic seconds snapshot, present only while `status == Sent` (§3).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sent_timestamp: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Contact {
    pub name: String,
    #[serde(default)]
    pub ip: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub is_connected: bool,
    #[serde(default)]
    pub last_seen: Option<String>,
    /// Hex-encoded 32-byte symmetric key, present once a session has been
    /// established at least once (§3).
    #[serde(default)]
    pub session_key: Option<String>,
    /// Hex-encoded DER of the last-seen peer certificate.
    #[serde(default)]
    pub peer_cert: Option<String>,
    #[serde(default)]
    pub msgs: Vec<Message>,
}

impl Contact {
    pub fn new(name: impl Into<String>) -> Self {
        Contact {
            name: name.into(),
            ip: None,
            port: None,
            is_connected: false,
            last_seen: None,
            session_key: None,
            peer_cert: None,
            msgs: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Model {
    #[serde(default)]
    pub contacts: BTreeMap<String, Contact>,
}
