//! This device's SM9 identity
//!
//! Master public keys are mandatory: without them the device cannot even
//! ask for keys. Private keys are optional; their absence means the device
//! is registered but not yet provisioned.

use std::sync::{PoisonError, RwLock};

use zeroize::Zeroizing;

use crate::config::UserConfig;
use crate::sm9::{
    EncryptMasterPublicKey, EncryptPrivateKey, KeyError, SignMasterPublicKey, SignPrivateKey,
};

use super::{IdentityError, KeyField};

/// Rewrite `field` only when it does not already hold `key`, so an
/// operator's spelling (case, padding) survives a save.
fn store_field<T, F>(field: &mut String, key: Option<&T>, parse: F, to_hex: fn(&T) -> String)
where
    T: PartialEq,
    F: Fn(&str) -> Result<T, KeyError>,
{
    match key {
        None => field.clear(),
        Some(key) if parse(field.as_str()).ok().as_ref() == Some(key) => {}
        Some(key) => *field = to_hex(key),
    }
}

/// Session key material agreed during the handshake.
pub type SessionKey = Zeroizing<Vec<u8>>;

/// Parse an optional hex key field. Empty means absent.
fn parse_field<T, F>(field: KeyField, hex: &str, parse: F) -> Result<Option<T>, IdentityError>
where
    F: Fn(&str) -> Result<T, KeyError>,
{
    if hex.trim().is_empty() {
        return Ok(None);
    }
    parse(hex)
        .map(Some)
        .map_err(|source| IdentityError::MalformedKey { field, source })
}

fn require_field(field: KeyField, hex: &str) -> Result<(), IdentityError> {
    if hex.trim().is_empty() {
        Err(IdentityError::IncompleteIdentity(field))
    } else {
        Ok(())
    }
}

/// A device's identity and key material.
pub struct DeviceIdentity {
    uid: Vec<u8>,
    /// Domain tag ("hid")
    hid: u8,
    sign_master_public_key: SignMasterPublicKey,
    encrypt_master_public_key: EncryptMasterPublicKey,
    sign_private_key: Option<SignPrivateKey>,
    encrypt_private_key: Option<EncryptPrivateKey>,
    session_key: RwLock<Option<SessionKey>>,
}

impl DeviceIdentity {
    /// Build a registered-but-unprovisioned identity from its master keys.
    pub fn new(
        uid: impl Into<Vec<u8>>,
        hid: u8,
        sign_master_public_key: SignMasterPublicKey,
        encrypt_master_public_key: EncryptMasterPublicKey,
    ) -> Self {
        Self {
            uid: uid.into(),
            hid,
            sign_master_public_key,
            encrypt_master_public_key,
            sign_private_key: None,
            encrypt_private_key: None,
            session_key: RwLock::new(None),
        }
    }

    /// Load from a configuration record.
    ///
    /// Fails with `IncompleteIdentity` if either master public key is
    /// missing (checked before anything is parsed), and with `MalformedKey`
    /// if any present field is not valid hex DER for its key type. Nothing
    /// is returned on failure, so there is no partially populated identity.
    pub fn load(conf: &UserConfig) -> Result<Self, IdentityError> {
        require_field(KeyField::SignMasterPublicKey, &conf.sign_master_public_key)?;
        require_field(KeyField::EncryptMasterPublicKey, &conf.encrypt_master_public_key)?;

        let sign_master_public_key = parse_field(
            KeyField::SignMasterPublicKey,
            &conf.sign_master_public_key,
            SignMasterPublicKey::from_hex,
        )?
        .ok_or(IdentityError::IncompleteIdentity(KeyField::SignMasterPublicKey))?;

        let encrypt_master_public_key = parse_field(
            KeyField::EncryptMasterPublicKey,
            &conf.encrypt_master_public_key,
            EncryptMasterPublicKey::from_hex,
        )?
        .ok_or(IdentityError::IncompleteIdentity(KeyField::EncryptMasterPublicKey))?;

        let sign_private_key = parse_field(
            KeyField::SignPrivateKey,
            &conf.sign_private_key,
            SignPrivateKey::from_hex,
        )?;
        let encrypt_private_key = parse_field(
            KeyField::EncryptPrivateKey,
            &conf.encrypt_private_key,
            EncryptPrivateKey::from_hex,
        )?;

        Ok(Self {
            uid: conf.uid.as_bytes().to_vec(),
            hid: conf.hid,
            sign_master_public_key,
            encrypt_master_public_key,
            sign_private_key,
            encrypt_private_key,
            session_key: RwLock::new(None),
        })
    }

    /// Like `load`, but collapses every failure into `None`.
    pub fn new_user(conf: &UserConfig) -> Option<Self> {
        match Self::load(conf) {
            Ok(identity) => Some(identity),
            Err(e) => {
                log::debug!("No usable identity in configuration: {}", e);
                None
            }
        }
    }

    /// Write the identity fields back into a configuration record.
    ///
    /// `eid` and `device_type` are left untouched. A key field that already
    /// decodes to the held key keeps its text; any other is written as
    /// lowercase hex. Absent private keys are written as empty strings.
    pub fn store(&self, conf: &mut UserConfig) {
        conf.uid = String::from_utf8_lossy(&self.uid).into_owned();
        conf.hid = self.hid;
        store_field(
            &mut conf.sign_master_public_key,
            Some(&self.sign_master_public_key),
            SignMasterPublicKey::from_hex,
            SignMasterPublicKey::to_hex,
        );
        store_field(
            &mut conf.encrypt_master_public_key,
            Some(&self.encrypt_master_public_key),
            EncryptMasterPublicKey::from_hex,
            EncryptMasterPublicKey::to_hex,
        );
        store_field(
            &mut conf.sign_private_key,
            self.sign_private_key.as_ref(),
            SignPrivateKey::from_hex,
            SignPrivateKey::to_hex,
        );
        store_field(
            &mut conf.encrypt_private_key,
            self.encrypt_private_key.as_ref(),
            EncryptPrivateKey::from_hex,
            EncryptPrivateKey::to_hex,
        );
    }

    /// Install freshly issued private keys (raw DER).
    ///
    /// Both keys are validated before either is stored.
    pub fn install_private_keys(
        &mut self,
        sign_der: &[u8],
        encrypt_der: &[u8],
    ) -> Result<(), IdentityError> {
        let sign = SignPrivateKey::from_der(sign_der).map_err(|source| {
            IdentityError::MalformedKey {
                field: KeyField::SignPrivateKey,
                source,
            }
        })?;
        let encrypt = EncryptPrivateKey::from_der(encrypt_der).map_err(|source| {
            IdentityError::MalformedKey {
                field: KeyField::EncryptPrivateKey,
                source,
            }
        })?;

        self.sign_private_key = Some(sign);
        self.encrypt_private_key = Some(encrypt);
        Ok(())
    }

    pub fn uid(&self) -> &[u8] {
        &self.uid
    }

    /// The uid as text, for logs and HTTP requests.
    pub fn uid_str(&self) -> String {
        String::from_utf8_lossy(&self.uid).into_owned()
    }

    pub fn hid(&self) -> u8 {
        self.hid
    }

    /// Hex of the single domain-tag byte, as sent in handshake metadata.
    pub fn hid_hex(&self) -> String {
        hex::encode([self.hid])
    }

    pub fn sign_master_public_key(&self) -> &SignMasterPublicKey {
        &self.sign_master_public_key
    }

    pub fn encrypt_master_public_key(&self) -> &EncryptMasterPublicKey {
        &self.encrypt_master_public_key
    }

    pub fn sign_private_key(&self) -> Option<&SignPrivateKey> {
        self.sign_private_key.as_ref()
    }

    pub fn encrypt_private_key(&self) -> Option<&EncryptPrivateKey> {
        self.encrypt_private_key.as_ref()
    }

    /// True once both private keys are present.
    pub fn is_provisioned(&self) -> bool {
        self.sign_private_key.is_some() && self.encrypt_private_key.is_some()
    }

    pub fn set_session_key(&self, key: &[u8]) {
        let mut slot = self
            .session_key
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        *slot = Some(Zeroizing::new(key.to_vec()));
    }

    pub fn clear_session_key(&self) {
        let mut slot = self
            .session_key
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        *slot = None;
    }

    /// Copy of the current session key, if a handshake has produced one.
    pub fn session_key(&self) -> Option<SessionKey> {
        self.session_key
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}
