//! C2 — encrypted store (§3, §4.2).
//!
//! A single `Mutex`-guarded in-memory [`model::Model`], persisted in full on
//! every mutation. Grounded method-for-method on
//! `examples/original_source/scripts/database.py`; the `Mutex`-guarded
//! single-writer shape mirrors the teacher's `db.rs` (there guarding a
//! `rusqlite::Connection`, here a plain `Model`).

pub mod crypto;
pub mod model;

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::Utc;
use log::{error, warn};

use crate::credential::CredentialProvider;
use crate::error::StoreError;
use model::{Contact, Message, MessageStatus, Model};

const CHALLENGE_FILENAME: &str = "C_value_chat.bin";

/// Fields an `upsert_contact` caller is allowed to change on an existing row
/// (§4.2: "only a fixed whitelist of fields may change").
#[derive(Debug, Default, Clone)]
pub struct ContactFields {
    pub name: Option<String>,
    pub ip: Option<String>,
    pub port: Option<u16>,
    pub session_key: Option<String>,
    pub peer_cert: Option<String>,
}

struct Paths {
    challenge: PathBuf,
    wrapped_key: PathBuf,
    blob: PathBuf,
}

pub struct Store {
    paths: Paths,
    db_key: crypto::DbKey,
    model: Mutex<Model>,
}

impl Store {
    /// Derive on-disk paths from `SHA-256(serial)[:16]`, ensure `C` and the
    /// wrapped `K_db` exist (creating them atomically if absent), then load
    /// and decrypt the database blob (§4.2, §6).
    pub fn open(
        data_dir: &Path,
        credential: &dyn CredentialProvider,
        serial: &[u8],
    ) -> Result<Self, StoreError> {
        fs::create_dir_all(data_dir)?;
        let stem = crypto::filename_stem(serial);
        let paths = Paths {
            challenge: data_dir.join(CHALLENGE_FILENAME),
            wrapped_key: data_dir.join(format!("kdb_enc_{stem}.bin")),
            blob: data_dir.join(format!("database_{stem}.json.enc")),
        };

        let challenge = ensure_challenge(&paths.challenge)?;
        let wrapping_key = crypto::derive_wrapping_key(credential, &challenge)?;
        let db_key = ensure_wrapped_key(&paths.wrapped_key, &wrapping_key)?;

        let model = load_model(&paths.blob, &db_key);

        let store = Store {
            paths,
            db_key,
            model: Mutex::new(model),
        };
        store.clean_duplicates_and_persist()?;
        Ok(store)
    }

    /// Snapshot of every contact, keyed by contact key.
    pub fn contacts(&self) -> Vec<(String, Contact)> {
        self.model
            .lock()
            .unwrap()
            .contacts
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub fn contact(&self, key: &str) -> Option<Contact> {
        self.model.lock().unwrap().contacts.get(key).cloned()
    }

    pub fn peer_cert(&self, key: &str) -> Option<Vec<u8>> {
        let guard = self.model.lock().unwrap();
        let hex_cert = guard.contacts.get(key)?.peer_cert.as_ref()?;
        hex::decode(hex_cert).ok()
    }

    pub fn session_key(&self, key: &str) -> Option<[u8; 32]> {
        let guard = self.model.lock().unwrap();
        let hex_key = guard.contacts.get(key)?.session_key.as_ref()?;
        let bytes = hex::decode(hex_key).ok()?;
        bytes.try_into().ok()
    }

    /// Create with defaults on first sight; on update, apply only the
    /// whitelisted fields (§4.2). Forbidden fields are not representable in
    /// [`ContactFields`], so there is nothing further to drop.
    pub fn upsert_contact(
        &self,
        key: &str,
        fields: ContactFields,
    ) -> Result<(), StoreError> {
        {
            let mut guard = self.model.lock().unwrap();
            guard
                .contacts
                .entry(key.to_string())
                .or_insert_with(|| Contact::new(fields.name.clone().unwrap_or_else(|| key.to_string())));
            let entry = guard.contacts.get_mut(key).unwrap();
            if let Some(name) = fields.name {
                entry.name = name;
            }
            if let Some(ip) = fields.ip {
                entry.ip = Some(ip);
            }
            if let Some(port) = fields.port {
                entry.port = Some(port);
            }
            if let Some(session_key) = fields.session_key {
                entry.session_key = Some(session_key);
            }
            if let Some(peer_cert) = fields.peer_cert {
                entry.peer_cert = Some(peer_cert);
            }
        }
        self.persist()
    }

    /// Flip `is_connected`; write `last_seen` when flipping to false (§4.2).
    pub fn set_connected(&self, key: &str, connected: bool) -> Result<(), StoreError> {
        {
            let mut guard = self.model.lock().unwrap();
            if let Some(contact) = guard.contacts.get_mut(key) {
                contact.is_connected = connected;
                if !connected {
                    contact.last_seen = Some(Utc::now().to_rfc3339());
                }
            } else {
                return Ok(());
            }
        }
        self.persist()
    }

    /// Idempotent on `msg_id`: a previously-seen id returns the existing row
    /// untouched (§4.2, §8 "message-id idempotence").
    pub fn append_message(
        &self,
        key: &str,
        sender: &str,
        text: &str,
        status: MessageStatus,
        timestamp: Option<String>,
        msg_id: Option<String>,
    ) -> Result<String, StoreError> {
        let mut guard = self.model.lock().unwrap();
        let contact = guard
            .contacts
            .entry(key.to_string())
            .or_insert_with(|| Contact::new(key.to_string()));

        if let Some(id) = &msg_id {
            if contact.msgs.iter().any(|m| &m.id == id) {
                return Ok(id.clone());
            }
        }

        let id = msg_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let sent_timestamp = if status == MessageStatus::Sent {
            Some(now_unix_seconds())
        } else {
            None
        };
        contact.msgs.push(Message {
            id: id.clone(),
            sender: sender.to_string(),
            text: text.to_string(),
            timestamp: timestamp.unwrap_or_else(|| Utc::now().to_rfc3339()),
            status,
            read: false,
            sent_timestamp,
        });
        drop(guard);
        self.persist()?;
        Ok(id)
    }

    /// Enforce the transitions of §3; write/clear `sent_timestamp`
    /// accordingly.
    pub fn set_message_status(
        &self,
        key: &str,
        msg_id: &str,
        status: MessageStatus,
    ) -> Result<(), StoreError> {
        {
            let mut guard = self.model.lock().unwrap();
            let Some(contact) = guard.contacts.get_mut(key) else {
                return Ok(());
            };
            let Some(msg) = contact.msgs.iter_mut().find(|m| m.id == msg_id) else {
                return Ok(());
            };
            if msg.status == MessageStatus::Delivered
                && matches!(status, MessageStatus::Sent | MessageStatus::Pending)
            {
                // §8 status monotonicity: delivered never regresses.
                return Ok(());
            }
            msg.status = status;
            msg.sent_timestamp = match status {
                MessageStatus::Sent => Some(now_unix_seconds()),
                _ => None,
            };
        }
        self.persist()
    }

    pub fn mark_read_all(&self, key: &str) -> Result<(), StoreError> {
        let changed = {
            let mut guard = self.model.lock().unwrap();
            let Some(contact) = guard.contacts.get_mut(key) else {
                return Ok(());
            };
            let mut changed = false;
            for msg in contact.msgs.iter_mut() {
                if msg.status == MessageStatus::Received && !msg.read {
                    msg.read = true;
                    changed = true;
                }
            }
            changed
        };
        if changed {
            self.persist()?;
        }
        Ok(())
    }

    pub fn mark_read(&self, key: &str, msg_id: &str) -> Result<(), StoreError> {
        {
            let mut guard = self.model.lock().unwrap();
            let Some(contact) = guard.contacts.get_mut(key) else {
                return Ok(());
            };
            let Some(msg) = contact.msgs.iter_mut().find(|m| m.id == msg_id) else {
                return Ok(());
            };
            msg.read = true;
        }
        self.persist()
    }

    pub fn pending(&self, key: &str) -> Vec<Message> {
        self.history(key)
            .into_iter()
            .filter(|m| m.status == MessageStatus::Pending)
            .collect()
    }

    pub fn history(&self, key: &str) -> Vec<Message> {
        self.model
            .lock()
            .unwrap()
            .contacts
            .get(key)
            .map(|c| c.msgs.clone())
            .unwrap_or_default()
    }

    pub fn unread_count(&self, key: &str) -> usize {
        self.history(key)
            .iter()
            .filter(|m| m.status == MessageStatus::Received && !m.read)
            .count()
    }

    /// For each message in status `sent`, if `now - sent_timestamp >
    /// threshold`, revert to `pending` (§4.2). Returns true iff at least one
    /// message changed.
    pub fn check_timeouts(&self, key: &str, threshold_seconds: f64) -> Result<bool, StoreError> {
        let changed = {
            let mut guard = self.model.lock().unwrap();
            let Some(contact) = guard.contacts.get_mut(key) else {
                return Ok(false);
            };
            let now = now_unix_seconds();
            let mut changed = false;
            for msg in contact.msgs.iter_mut() {
                if msg.status == MessageStatus::Sent {
                    if let Some(sent_at) = msg.sent_timestamp {
                        if now - sent_at > threshold_seconds {
                            msg.status = MessageStatus::Pending;
                            msg.sent_timestamp = None;
                            changed = true;
                        }
                    }
                }
            }
            changed
        };
        if changed {
            self.persist()?;
        }
        Ok(changed)
    }

    /// Re-serialise the whole model and rewrite the blob (§4.2: "all writes
    /// go through a single persist routine").
    fn persist(&self) -> Result<(), StoreError> {
        let json = {
            let guard = self.model.lock().unwrap();
            serde_json::to_vec(&*guard)?
        };
        let sealed = crypto::seal_model(&self.db_key, &json)?;
        write_atomic(&self.paths.blob, &sealed.to_bytes())?;
        Ok(())
    }

    fn clean_duplicates_and_persist(&self) -> Result<(), StoreError> {
        let removed = {
            let mut guard = self.model.lock().unwrap();
            clean_duplicates(&mut guard)
        };
        if removed {
            self.persist()?;
        }
        Ok(())
    }
}

/// Exact duplicate-collapse algorithm of `database.py::clean_duplicates`:
/// group contacts by shared `name`, keep the one with the most messages, and
/// on a tie at zero messages prefer a key that looks like `"ip:port"`.
fn clean_duplicates(model: &mut Model) -> bool {
    use std::collections::HashMap;

    let mut by_name: HashMap<String, Vec<String>> = HashMap::new();
    for (key, contact) in model.contacts.iter() {
        by_name.entry(contact.name.clone()).or_default().push(key.clone());
    }

    let mut to_remove = Vec::new();
    for (_, keys) in by_name {
        if keys.len() <= 1 {
            continue;
        }
        let mut best: Option<String> = None;
        let mut max_msgs: i64 = -1;
        for key in &keys {
            let count = model.contacts.get(key).map(|c| c.msgs.len()).unwrap_or(0) as i64;
            if count > max_msgs {
                max_msgs = count;
                best = Some(key.clone());
            }
        }
        if max_msgs == 0 {
            if let Some(ip_shaped) = keys.iter().find(|k| k.contains(':')) {
                best = Some(ip_shaped.clone());
            }
        }
        for key in &keys {
            if Some(key) != best.as_ref() {
                to_remove.push(key.clone());
            }
        }
    }

    let removed = !to_remove.is_empty();
    for key in to_remove {
        model.contacts.remove(&key);
    }
    removed
}

fn ensure_challenge(path: &Path) -> Result<[u8; 8], StoreError> {
    if !path.exists() {
        let mut bytes = [0u8; 8];
        rand::RngCore::fill_bytes(&mut rand::thread_rng(), &mut bytes);
        write_atomic(path, &bytes)?;
        restrict_to_owner(path)?;
    }
    let data = fs::read(path)?;
    if data.len() != 8 {
        return Err(StoreError::Crypto("installation challenge has wrong length".into()));
    }
    let mut challenge = [0u8; 8];
    challenge.copy_from_slice(&data);
    Ok(challenge)
}

fn ensure_wrapped_key(
    path: &Path,
    wrapping_key: &[u8; 32],
) -> Result<crypto::DbKey, StoreError> {
    if !path.exists() {
        let db_key = crypto::DbKey::random();
        let sealed = crypto::wrap_db_key(wrapping_key, &db_key)?;
        write_atomic(path, &sealed.to_bytes())?;
        return Ok(db_key);
    }
    let bytes = fs::read(path)?;
    let sealed = crypto::SealedBlob::from_bytes(&bytes)?;
    crypto::unwrap_db_key(wrapping_key, &sealed)
}

/// Loads and decrypts the blob; on any decode failure the store resets to an
/// empty contact map and logs, rather than silently discarding (§4.2).
fn load_model(path: &Path, db_key: &crypto::DbKey) -> Model {
    if !path.exists() {
        return Model::default();
    }
    let bytes = match fs::read(path) {
        Ok(b) => b,
        Err(e) => {
            error!("failed to read database blob: {e}");
            return Model::default();
        }
    };
    if bytes.is_empty() {
        return Model::default();
    }
    let sealed = match crypto::SealedBlob::from_bytes(&bytes) {
        Ok(s) => s,
        Err(e) => {
            warn!("database blob is malformed, resetting: {e}");
            return Model::default();
        }
    };
    let plaintext = match crypto::unseal_model(db_key, &sealed) {
        Ok(p) => p,
        Err(e) => {
            warn!("database blob failed to decrypt, resetting: {e}");
            return Model::default();
        }
    };
    match serde_json::from_slice(&plaintext) {
        Ok(model) => model,
        Err(e) => {
            warn!("database blob failed to parse, resetting: {e}");
            Model::default()
        }
    }
}

/// Lock the challenge file down to mode 0600 (§6): it is the root of the
/// key-wrap chain and never needs to be group- or world-readable.
#[cfg(unix)]
fn restrict_to_owner(path: &Path) -> Result<(), StoreError> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    Ok(())
}

#[cfg(not(unix))]
fn restrict_to_owner(_path: &Path) -> Result<(), StoreError> {
    Ok(())
}

fn write_atomic(path: &Path, contents: &[u8]) -> Result<(), StoreError> {
    let tmp_path = path.with_extension("tmp");
    fs::write(&tmp_path, contents)?;
    fs::rename(&tmp_path, path)?;
    Ok(())
}

fn now_unix_seconds() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}
