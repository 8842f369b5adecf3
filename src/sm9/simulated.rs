//! In-process key-generation centre
//!
//! Stands in for an SM9 library plus its KGC so the provisioning and
//! handshake flows can be exercised end to end without a pairing library.
//! Keys are structurally valid DER points filled with HKDF output, and
//! "identity-based" encryption is AES-256-GCM under a key derived from the
//! recipient's private key. Only the KGC (which can re-derive any private
//! key from its master secret) can encrypt; only the private-key holder can
//! decrypt. This is not SM9 and offers none of its security properties.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use hkdf::Hkdf;
use rand::RngCore;
use sha2::Sha256;
use zeroize::{Zeroize, Zeroizing};

use super::keys::{encode_point_der, PointGroup};
use super::{
    CryptoError, EncryptMasterPublicKey, EncryptPrivateKey, IdentityCipher, KeyError,
    SignMasterPublicKey, SignPrivateKey,
};

const NONCE_LEN: usize = 12;

/// A key-generation centre holding a 32-byte master secret.
pub struct SimulatedKgc {
    master_secret: Zeroizing<[u8; 32]>,
    sign_master_public: SignMasterPublicKey,
    encrypt_master_public: EncryptMasterPublicKey,
}

impl SimulatedKgc {
    /// Create a KGC with a fresh random master secret.
    pub fn generate() -> Self {
        let mut secret = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut secret);
        let kgc = Self::from_secret(secret);
        secret.zeroize();
        kgc
    }

    /// Create a KGC from a fixed master secret (deterministic keys).
    pub fn from_secret(secret: [u8; 32]) -> Self {
        let master_secret = Zeroizing::new(secret);
        let sign_master_public =
            SignMasterPublicKey::from_der(&derive_point(&master_secret, b"sign-master", PointGroup::G2))
                .expect("derived point is a well-formed G2 encoding");
        let encrypt_master_public = EncryptMasterPublicKey::from_der(&derive_point(
            &master_secret,
            b"encrypt-master",
            PointGroup::G1,
        ))
        .expect("derived point is a well-formed G1 encoding");

        Self {
            master_secret,
            sign_master_public,
            encrypt_master_public,
        }
    }

    pub fn sign_master_public_key(&self) -> &SignMasterPublicKey {
        &self.sign_master_public
    }

    pub fn encrypt_master_public_key(&self) -> &EncryptMasterPublicKey {
        &self.encrypt_master_public
    }

    /// Issue the signing key for `(uid, hid)`.
    pub fn issue_sign_key(&self, uid: &[u8], hid: u8) -> Result<SignPrivateKey, KeyError> {
        let der = Zeroizing::new(derive_point(
            &self.master_secret,
            &identity_info(b"sign-key", uid, hid),
            PointGroup::G1,
        ));
        SignPrivateKey::from_der(&der)
    }

    /// Issue the decryption key for `(uid, hid)`.
    pub fn issue_encrypt_key(&self, uid: &[u8], hid: u8) -> Result<EncryptPrivateKey, KeyError> {
        let der = Zeroizing::new(derive_point(
            &self.master_secret,
            &identity_info(b"encrypt-key", uid, hid),
            PointGroup::G2,
        ));
        EncryptPrivateKey::from_der(&der)
    }
}

fn identity_info(role: &[u8], uid: &[u8], hid: u8) -> Vec<u8> {
    let mut info = Vec::with_capacity(role.len() + 1 + uid.len());
    info.extend_from_slice(role);
    info.push(hid);
    info.extend_from_slice(uid);
    info
}

/// Expand the master secret into a DER point of the given group.
fn derive_point(secret: &[u8; 32], info: &[u8], group: PointGroup) -> Vec<u8> {
    let hk = Hkdf::<Sha256>::new(Some(b"sim-sm9-kgc-v1".as_slice()), secret);
    let mut point = vec![0u8; group.point_len()];
    point[0] = 0x04;
    hk.expand(info, &mut point[1..])
        .expect("129 bytes is a valid HKDF-SHA256 output length");
    let der = encode_point_der(&point);
    point.zeroize();
    der
}

/// Symmetric key bound to a private key and the identity it was issued for.
fn transport_key(private_der: &[u8], uid: &[u8]) -> Zeroizing<[u8; 32]> {
    let hk = Hkdf::<Sha256>::new(Some(b"sim-sm9-enc-v1".as_slice()), private_der);
    let mut okm = Zeroizing::new([0u8; 32]);
    hk.expand(uid, &mut *okm)
        .expect("32 bytes is a valid HKDF-SHA256 output length");
    okm
}

impl IdentityCipher for SimulatedKgc {
    fn encrypt(
        &self,
        master: &EncryptMasterPublicKey,
        uid: &[u8],
        hid: u8,
        plaintext: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        if master != &self.encrypt_master_public {
            return Err(CryptoError::Encrypt(
                "master public key was not issued by this KGC".to_string(),
            ));
        }

        let recipient = self
            .issue_encrypt_key(uid, hid)
            .map_err(|e| CryptoError::Encrypt(e.to_string()))?;
        let key = transport_key(recipient.as_der(), uid);
        let cipher = Aes256Gcm::new_from_slice(&key[..])
            .map_err(|e| CryptoError::Encrypt(e.to_string()))?;

        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(nonce, plaintext)
            .map_err(|e| CryptoError::Encrypt(e.to_string()))?;

        // nonce (12 bytes) || ciphertext
        let mut result = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        result.extend_from_slice(&nonce_bytes);
        result.extend_from_slice(&ciphertext);
        Ok(result)
    }

    fn decrypt(
        &self,
        key: &EncryptPrivateKey,
        uid: &[u8],
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        if ciphertext.len() < NONCE_LEN {
            return Err(CryptoError::Decrypt(
                "ciphertext too short (missing nonce)".to_string(),
            ));
        }

        let key = transport_key(key.as_der(), uid);
        let cipher = Aes256Gcm::new_from_slice(&key[..])
            .map_err(|e| CryptoError::Decrypt(e.to_string()))?;

        let nonce = Nonce::from_slice(&ciphertext[..NONCE_LEN]);
        cipher
            .decrypt(nonce, &ciphertext[NONCE_LEN..])
            .map_err(|e| CryptoError::Decrypt(e.to_string()))
    }
}
