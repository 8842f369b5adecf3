//! SM9 identity-based cryptography seam
//!
//! The SM9 pairing arithmetic itself lives in an external library. This module
//! fixes the shape of what the rest of the crate needs from it:
//! - `keys`: DER-encoded master public keys and per-identity private keys
//! - `IdentityCipher`: identity-based encrypt/decrypt
//! - `simulated`: an in-process key-generation centre for tests

pub mod keys;
pub mod simulated;

pub use keys::{EncryptMasterPublicKey, EncryptPrivateKey, PointGroup, SignMasterPublicKey, SignPrivateKey};
pub use simulated::SimulatedKgc;

use std::sync::Arc;

use thiserror::Error;

/// Structural problems with DER key material.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KeyError {
    #[error("Invalid hex: {0}")]
    InvalidHex(String),

    #[error("Truncated DER encoding")]
    Truncated,

    #[error("Unexpected DER tag 0x{0:02x} (expected BIT STRING)")]
    UnexpectedTag(u8),

    #[error("Unsupported DER length encoding")]
    UnsupportedLength,

    #[error("DER length mismatch: declared {declared}, actual {actual}")]
    LengthMismatch { declared: usize, actual: usize },

    #[error("BIT STRING has {0} unused bits")]
    UnusedBits(u8),

    #[error("Expected a {expected}-byte point, got {actual} bytes")]
    PointLength { expected: usize, actual: usize },

    #[error("Point is not in uncompressed form")]
    NotUncompressed,
}

/// Failures reported by the identity-based cipher.
#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("Encryption failed: {0}")]
    Encrypt(String),

    #[error("Decryption failed: {0}")]
    Decrypt(String),
}

/// Identity-based encryption as provided by an SM9 implementation.
///
/// `encrypt` targets the identity `(uid, hid)` under a master public key;
/// only the holder of the private key issued for that identity can `decrypt`.
/// Ciphertexts are opaque byte strings in whatever encoding the library uses.
pub trait IdentityCipher: Send + Sync {
    fn encrypt(
        &self,
        master: &EncryptMasterPublicKey,
        uid: &[u8],
        hid: u8,
        plaintext: &[u8],
    ) -> Result<Vec<u8>, CryptoError>;

    fn decrypt(
        &self,
        key: &EncryptPrivateKey,
        uid: &[u8],
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, CryptoError>;
}

impl<T: IdentityCipher + ?Sized> IdentityCipher for Arc<T> {
    fn encrypt(
        &self,
        master: &EncryptMasterPublicKey,
        uid: &[u8],
        hid: u8,
        plaintext: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        (**self).encrypt(master, uid, hid, plaintext)
    }

    fn decrypt(
        &self,
        key: &EncryptPrivateKey,
        uid: &[u8],
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        (**self).decrypt(key, uid, ciphertext)
    }
}
