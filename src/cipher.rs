//! SM4 in output-feedback mode
//!
//! Protects provisioned key material in transit (keyed by the provisioning
//! seed) and application payloads once a session key exists. OFB turns the
//! block cipher into a keystream, so ciphertext is as long as plaintext and
//! encryption and decryption are the same XOR.
//!
//! SECURITY: the platform protocol fixes the IV (`LEGACY_IV`) for every
//! message. Reusing a key with the same IV reuses the keystream, so two
//! messages under one key leak their XOR and equal plaintexts produce equal
//! ciphertexts. `SessionCipher::with_iv` exists so a per-message IV can be
//! adopted once the broker side supports carrying it.

use ofb::cipher::{Iv, Key, KeyIvInit, StreamCipher};
use thiserror::Error;
use zeroize::Zeroizing;

type Sm4Ofb = ofb::Ofb<sm4::Sm4>;

/// SM4 key length in bytes.
pub const KEY_LEN: usize = 16;

/// SM4 block (and IV) length in bytes.
pub const IV_LEN: usize = 16;

/// The fixed IV the key-management platform and broker use.
pub const LEGACY_IV: [u8; IV_LEN] = [
    0x00, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0a, 0x0b, 0x0c, 0x0d, 0x0e, 0x0f,
];

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CipherError {
    #[error("Invalid key length: expected 16 bytes, got {0}")]
    InvalidKeyLength(usize),

    #[error("Invalid IV length: expected 16 bytes, got {0}")]
    InvalidIvLength(usize),
}

/// An SM4-OFB key/IV pair.
pub struct SessionCipher {
    key: Zeroizing<[u8; KEY_LEN]>,
    iv: [u8; IV_LEN],
}

impl SessionCipher {
    /// Cipher using `LEGACY_IV`.
    pub fn new(key: &[u8]) -> Result<Self, CipherError> {
        Self::with_iv(key, &LEGACY_IV)
    }

    pub fn with_iv(key: &[u8], iv: &[u8]) -> Result<Self, CipherError> {
        let key: [u8; KEY_LEN] = key
            .try_into()
            .map_err(|_| CipherError::InvalidKeyLength(key.len()))?;
        let iv: [u8; IV_LEN] = iv
            .try_into()
            .map_err(|_| CipherError::InvalidIvLength(iv.len()))?;

        Ok(Self {
            key: Zeroizing::new(key),
            iv,
        })
    }

    /// XOR `data` with the keystream. The keystream restarts from the IV on
    /// every call.
    pub fn apply(&self, data: &[u8]) -> Vec<u8> {
        let mut buf = data.to_vec();
        let mut ofb = Sm4Ofb::new(
            Key::<Sm4Ofb>::from_slice(&self.key[..]),
            Iv::<Sm4Ofb>::from_slice(&self.iv),
        );
        ofb.apply_keystream(&mut buf);
        buf
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Vec<u8> {
        self.apply(plaintext)
    }

    pub fn decrypt(&self, ciphertext: &[u8]) -> Vec<u8> {
        self.apply(ciphertext)
    }
}

/// One-shot SM4-OFB encryption with `LEGACY_IV`.
pub fn encrypt(key: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, CipherError> {
    Ok(SessionCipher::new(key)?.encrypt(plaintext))
}

/// One-shot SM4-OFB decryption with `LEGACY_IV`.
pub fn decrypt(key: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>, CipherError> {
    Ok(SessionCipher::new(key)?.decrypt(ciphertext))
}
