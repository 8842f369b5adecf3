//! Application payload protection under the session key
//!
//! Publishes travel as hex text of the SM4-OFB ciphertext.

use std::sync::Arc;

use hkdf::Hkdf;
use sha2::Sha256;
use thiserror::Error;
use zeroize::Zeroizing;

use crate::cipher::{self, CipherError, KEY_LEN};
use crate::identity::DeviceIdentity;

#[derive(Error, Debug)]
pub enum PayloadError {
    #[error("No session key: the device has not authenticated")]
    NoSessionKey,

    #[error("Payload is not hex: {0}")]
    InvalidHex(String),

    #[error("Cipher error: {0}")]
    Cipher(#[from] CipherError),
}

/// SM4 key for a session key: itself if it is already 16 bytes, otherwise
/// an HKDF-SHA256 expansion of it (no salt, info `sm9-auth-payload-v1`).
///
/// A broker that keys SM4 with `R2` as-is only interoperates when
/// `auth.nonce_len` is 16. For any other length the broker must apply the
/// same expansion to `R2` before encrypting.
pub fn derive_payload_key(session_key: &[u8]) -> Zeroizing<[u8; KEY_LEN]> {
    let mut key = Zeroizing::new([0u8; KEY_LEN]);
    if session_key.len() == KEY_LEN {
        key.copy_from_slice(session_key);
    } else {
        let hk = Hkdf::<Sha256>::new(None, session_key);
        hk.expand(b"sm9-auth-payload-v1", &mut *key)
            .expect("16 bytes is a valid HKDF-SHA256 output length");
    }
    key
}

/// Encrypt and hex-encode an outbound payload.
pub fn seal(session_key: &[u8], plaintext: &[u8]) -> Result<String, PayloadError> {
    let key = derive_payload_key(session_key);
    Ok(hex::encode(cipher::encrypt(&key[..], plaintext)?))
}

/// Hex-decode and decrypt an inbound payload.
pub fn open(session_key: &[u8], payload: &[u8]) -> Result<Vec<u8>, PayloadError> {
    let text = std::str::from_utf8(payload).map_err(|e| PayloadError::InvalidHex(e.to_string()))?;
    let ciphertext =
        hex::decode(text.trim()).map_err(|e| PayloadError::InvalidHex(e.to_string()))?;

    let key = derive_payload_key(session_key);
    Ok(cipher::decrypt(&key[..], &ciphertext)?)
}

/// Decrypts inbound publishes with whatever session key the identity holds.
pub struct MessageHandler {
    identity: Arc<DeviceIdentity>,
}

impl MessageHandler {
    pub fn new(identity: Arc<DeviceIdentity>) -> Self {
        Self { identity }
    }

    /// Encrypt an outbound publish.
    pub fn seal(&self, plaintext: &[u8]) -> Result<String, PayloadError> {
        let session_key = self.identity.session_key().ok_or(PayloadError::NoSessionKey)?;
        seal(&session_key, plaintext)
    }

    pub fn handle(&self, topic: &str, payload: &[u8]) -> Result<Vec<u8>, PayloadError> {
        let session_key = self.identity.session_key().ok_or(PayloadError::NoSessionKey)?;

        match open(&session_key, payload) {
            Ok(plaintext) => {
                log::info!(
                    "Received on {}: {}",
                    topic,
                    String::from_utf8_lossy(&plaintext)
                );
                Ok(plaintext)
            }
            Err(e) => {
                log::error!("Cannot decrypt message on {}: {}", topic, e);
                Err(e)
            }
        }
    }
}
