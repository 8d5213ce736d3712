//! C1 — credential provider (§4.1).
//!
//! The hardware token driver is an external collaborator (§1, §6): everything
//! in this module depends only on the four `CredentialProvider` operations.
//! [`SoftwareCredential`] is the in-process stand-in used by tests and by
//! development builds; a PKCS#11-backed implementation would live outside
//! this crate and implement the same trait.

use rsa::pkcs1v15::SigningKey;
use rsa::sha2::Sha256;
use rsa::signature::{RandomizedSigner, SignatureEncoding};
use rsa::{RsaPrivateKey, RsaPublicKey};
use x25519_dalek::{PublicKey, StaticSecret};
use x509_parser::prelude::*;

use crate::error::CredentialError;

/// Role-suffix parentheticals the source strips from a certificate's common
/// name to recover the bare nickname (§3, `dnie_manager.py::get_user_name`).
const ROLE_SUFFIXES: &[&str] = &[
    "(AUTENTICACIÓN)",
    "(Autenticación)",
    "(AUTENTICACION)",
    "(FIRMA)",
    "(Firma)",
];

/// Strip the role-suffix parentheticals from a raw certificate CN.
pub fn strip_role_suffix(raw: &str) -> String {
    let mut out = raw.to_string();
    for suffix in ROLE_SUFFIXES {
        out = out.replace(suffix, "");
    }
    out.trim().to_string()
}

/// Read the common name and serial number out of a DER certificate.
///
/// Returns `("<cn>", serial)` with the role suffix already stripped from the
/// CN and `serial` the certificate's integer serial number rendered as its
/// decimal ASCII digit string (`dnie_manager.py::get_serial_number` returns
/// a Python `int`; `database.py` hashes `str(serial)`, i.e. the decimal
/// representation, never a hex encoding of the raw DER bytes). Falls back to
/// a placeholder name if the CN attribute is absent, never fails outright:
/// the channel must be able to proceed with an unreadable peer certificate
/// (it just won't have a friendly name for it).
pub fn parse_identity(cert_der: &[u8]) -> (String, Vec<u8>) {
    match X509Certificate::from_der(cert_der) {
        Ok((_, cert)) => {
            let cn = cert
                .subject()
                .iter_common_name()
                .next()
                .and_then(|a| a.as_str().ok())
                .map(strip_role_suffix)
                .unwrap_or_else(|| "Unknown".to_string());
            let serial = serial_to_decimal_ascii(cert.raw_serial());
            (cn, serial)
        }
        Err(_) => ("Unknown".to_string(), b"0".to_vec()),
    }
}

/// Render a big-endian unsigned integer (the raw DER bytes of an ASN.1
/// `INTEGER`, possibly with a leading zero sign-padding byte) as its decimal
/// ASCII digit string, e.g. `[0x01, 0x00]` -> `b"256"`. No bignum crate is
/// pulled in for this: repeated divide-by-ten over the byte buffer is plenty
/// for a certificate serial number of a handful of bytes.
fn serial_to_decimal_ascii(raw_serial: &[u8]) -> Vec<u8> {
    let mut value = raw_serial.to_vec();
    while value.len() > 1 && value[0] == 0 {
        value.remove(0);
    }
    if value.iter().all(|&b| b == 0) {
        return b"0".to_vec();
    }

    let mut digits = Vec::new();
    while !value.iter().all(|&b| b == 0) {
        let mut remainder: u32 = 0;
        for byte in value.iter_mut() {
            let acc = remainder * 256 + *byte as u32;
            *byte = (acc / 10) as u8;
            remainder = acc % 10;
        }
        digits.push(b'0' + remainder as u8);
        while value.len() > 1 && value[0] == 0 {
            value.remove(0);
        }
    }
    digits.reverse();
    digits
}

/// Everything downstream of the handshake needs: certificate bytes, the
/// per-process static X25519 keypair, and a signing oracle over arbitrary
/// bytes.
pub trait CredentialProvider {
    fn certificate_der(&self) -> &[u8];
    fn static_public_key(&self) -> [u8; 32];
    fn exchange(&self, peer_public: &[u8; 32]) -> [u8; 32];
    fn sign(&self, data: &[u8]) -> Result<Vec<u8>, CredentialError>;

    /// Nickname and stable identifier derived from the certificate's CN and
    /// serial number (§3).
    fn identity(&self) -> (String, Vec<u8>) {
        parse_identity(self.certificate_der())
    }
}

/// In-process stand-in for a smart card: an RSA-2048 signing key plus a
/// self-signed certificate carrying a common name, and a static X25519
/// keypair generated fresh for this process (§3: "freshly generated per
/// process").
pub struct SoftwareCredential {
    cert_der: Vec<u8>,
    rsa_key: RsaPrivateKey,
    static_secret: StaticSecret,
    static_public: PublicKey,
}

impl SoftwareCredential {
    /// Generate a brand-new software identity: fresh RSA signing key, fresh
    /// self-signed certificate bearing `common_name`, fresh X25519 static
    /// keypair.
    pub fn generate(common_name: &str) -> Result<Self, CredentialError> {
        let mut rng = rand::thread_rng();
        let rsa_key = RsaPrivateKey::new(&mut rng, 2048)
            .map_err(|e| CredentialError::Signing(e.to_string()))?;

        let cert_der = build_self_signed_cert(common_name)
            .map_err(|e| CredentialError::Signing(e.to_string()))?;

        let static_secret = StaticSecret::random_from_rng(rand::thread_rng());
        let static_public = PublicKey::from(&static_secret);

        Ok(SoftwareCredential {
            cert_der,
            rsa_key,
            static_secret,
            static_public,
        })
    }

    /// Reconstruct a software identity from previously-saved material, as if
    /// the same card had been reinserted. Used by tests to exercise
    /// process-restart behaviour without regenerating the identity.
    pub fn from_parts(cert_der: Vec<u8>, rsa_key: RsaPrivateKey) -> Self {
        let static_secret = StaticSecret::random_from_rng(rand::thread_rng());
        let static_public = PublicKey::from(&static_secret);
        SoftwareCredential {
            cert_der,
            rsa_key,
            static_secret,
            static_public,
        }
    }

    pub fn rsa_key(&self) -> &RsaPrivateKey {
        &self.rsa_key
    }

    pub fn rsa_public_key(&self) -> RsaPublicKey {
        RsaPublicKey::from(&self.rsa_key)
    }
}

impl CredentialProvider for SoftwareCredential {
    fn certificate_der(&self) -> &[u8] {
        &self.cert_der
    }

    fn static_public_key(&self) -> [u8; 32] {
        self.static_public.to_bytes()
    }

    fn exchange(&self, peer_public: &[u8; 32]) -> [u8; 32] {
        let peer = PublicKey::from(*peer_public);
        self.static_secret.diffie_hellman(&peer).to_bytes()
    }

    /// Deterministic PKCS#1 v1.5 signature over SHA-256, per §4.1. Used both
    /// to derive the key-wrap key from the challenge `C` and (eagerly, never
    /// transmitted — see SPEC_FULL.md §9 open question) to sign `static_pub`.
    fn sign(&self, data: &[u8]) -> Result<Vec<u8>, CredentialError> {
        let signing_key = SigningKey::<Sha256>::new(self.rsa_key.clone());
        let signature = signing_key.sign_with_rng(&mut rand::thread_rng(), data);
        Ok(signature.to_vec())
    }
}

fn build_self_signed_cert(common_name: &str) -> Result<Vec<u8>, rcgen::Error> {
    let mut params = rcgen::CertificateParams::new(Vec::new())?;
    let mut dn = rcgen::DistinguishedName::new();
    dn.push(rcgen::DnType::CommonName, common_name);
    params.distinguished_name = dn;
    let key_pair = rcgen::KeyPair::generate()?;
    let cert = params.self_signed(&key_pair)?;
    Ok(cert.der().to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_known_role_suffixes() {
        assert_eq!(strip_role_suffix("ALICE SAMPLE (AUTENTICACIÓN)"), "ALICE SAMPLE");
        assert_eq!(strip_role_suffix("BOB EXAMPLE (FIRMA)"), "BOB EXAMPLE");
        assert_eq!(strip_role_suffix("CAROL NOROLE"), "CAROL NOROLE");
    }

    #[test]
    fn generated_identity_roundtrips_cn() {
        let cred = SoftwareCredential::generate("ALICE").unwrap();
        let (name, _serial) = cred.identity();
        assert_eq!(name, "ALICE");
    }

    #[test]
    fn serial_renders_as_decimal_not_hex() {
        assert_eq!(serial_to_decimal_ascii(&[0x00]), b"0");
        assert_eq!(serial_to_decimal_ascii(&[0xff]), b"255");
        assert_eq!(serial_to_decimal_ascii(&[0x01, 0x00]), b"256");
        // Leading zero sign-padding byte (high bit of the next byte set)
        // must not change the decoded value.
        assert_eq!(serial_to_decimal_ascii(&[0x00, 0x80]), b"128");
    }

    #[test]
    fn exchange_is_symmetric() {
        let a = SoftwareCredential::generate("A").unwrap();
        let b = SoftwareCredential::generate("B").unwrap();

        let a_pub = a.static_public_key();
        let b_pub = b.static_public_key();

        assert_eq!(a.exchange(&b_pub), b.exchange(&a_pub));
    }

    #[test]
    fn sign_is_deterministic_given_same_key() {
        let cred = SoftwareCredential::generate("ALICE").unwrap();
        let msg = b"challenge bytes";
        let sig1 = cred.sign(msg).unwrap();
        let sig2 = cred.sign(msg).unwrap();
        assert_eq!(sig1, sig2);
    }
}
