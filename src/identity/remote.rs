//! The authenticator's claimed identity
//!
//! Learned from AUTH packet user properties during a single handshake and
//! never persisted.
//!
//! A declared encryption master key is trusted as sent, even when it differs
//! from the one the device was provisioned with. Nothing in the handshake
//! authenticates it, so a peer that rewrote R1 on the way can get `R2`
//! encrypted to a master key it controls. Callers log that case.

use crate::handshake::packet::UserProperties;
use crate::sm9::{EncryptMasterPublicKey, SignMasterPublicKey};

use super::IdentityError;

pub const PROP_UID: &str = "uid";
pub const PROP_HID: &str = "hid";
pub const PROP_SIGN_MASTER_KEY: &str = "signMasterKey";
pub const PROP_ENCRYPT_MASTER_KEY: &str = "encryptMasterKey";
pub const PROP_DEVICE_NAME: &str = "deviceName";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RemoteIdentity {
    pub uid: Vec<u8>,
    pub hid: u8,
    pub sign_master_public_key: Option<SignMasterPublicKey>,
    pub encrypt_master_public_key: Option<EncryptMasterPublicKey>,
}

impl RemoteIdentity {
    /// Parse from handshake metadata.
    ///
    /// `uid` must be present and non-empty; `hid` must be the hex of exactly
    /// one byte. Master keys are optional but must be well formed if sent.
    pub fn from_properties(props: &UserProperties) -> Result<Self, IdentityError> {
        let uid = props
            .get(PROP_UID)
            .filter(|uid| !uid.is_empty())
            .ok_or_else(|| IdentityError::RemoteIdentityParse("missing uid".to_string()))?;

        let hid_hex = props
            .get(PROP_HID)
            .ok_or_else(|| IdentityError::RemoteIdentityParse("missing hid".to_string()))?;
        let hid = match hex::decode(hid_hex) {
            Ok(bytes) if bytes.len() == 1 => bytes[0],
            Ok(bytes) => {
                return Err(IdentityError::RemoteIdentityParse(format!(
                    "hid must be one byte, got {}",
                    bytes.len()
                )))
            }
            Err(e) => {
                return Err(IdentityError::RemoteIdentityParse(format!("hid: {}", e)));
            }
        };

        let sign_master_public_key = props
            .get(PROP_SIGN_MASTER_KEY)
            .filter(|v| !v.is_empty())
            .map(SignMasterPublicKey::from_hex)
            .transpose()
            .map_err(|e| IdentityError::RemoteIdentityParse(format!("{}: {}", PROP_SIGN_MASTER_KEY, e)))?;

        let encrypt_master_public_key = props
            .get(PROP_ENCRYPT_MASTER_KEY)
            .filter(|v| !v.is_empty())
            .map(EncryptMasterPublicKey::from_hex)
            .transpose()
            .map_err(|e| {
                IdentityError::RemoteIdentityParse(format!("{}: {}", PROP_ENCRYPT_MASTER_KEY, e))
            })?;

        Ok(Self {
            uid: uid.as_bytes().to_vec(),
            hid,
            sign_master_public_key,
            encrypt_master_public_key,
        })
    }

    /// The master key to encrypt to this peer under: its own if declared,
    /// otherwise `fallback` (both sides share one key-generation centre).
    pub fn encrypt_master_or<'a>(
        &'a self,
        fallback: &'a EncryptMasterPublicKey,
    ) -> &'a EncryptMasterPublicKey {
        self.encrypt_master_public_key.as_ref().unwrap_or(fallback)
    }

    /// True when the peer names an encryption master key other than `own`.
    pub fn declares_foreign_master(&self, own: &EncryptMasterPublicKey) -> bool {
        matches!(&self.encrypt_master_public_key, Some(key) if key != own)
    }
}
