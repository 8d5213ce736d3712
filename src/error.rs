//! Per-component error enums. See DESIGN.md for the module-local `thiserror`
//! pattern this follows.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("no smart card present")]
    NoToken,
    #[error("incorrect PIN")]
    BadPin,
    #[error("no signing key on token")]
    NoKey,
    #[error("signing operation failed: {0}")]
    Signing(String),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("crypto error: {0}")]
    Crypto(String),
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("credential error: {0}")]
    Credential(#[from] CredentialError),
}

#[derive(Debug, Error)]
pub enum PacketError {
    #[error("datagram shorter than the 5-byte header")]
    TooShort,
    #[error("unknown packet type byte {0:#04x}")]
    UnknownType(u8),
}

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}
