//! Device and peer identities
//!
//! - `DeviceIdentity`: this device's id, domain tag and SM9 key material
//! - `RemoteIdentity`: what the broker-side authenticator claims to be,
//!   parsed from handshake metadata and discarded when the attempt ends

pub mod device;
pub mod remote;

pub use device::{DeviceIdentity, SessionKey};
pub use remote::RemoteIdentity;

use std::fmt;

use thiserror::Error;

use crate::sm9::KeyError;

/// Which key slot a piece of key material belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeyField {
    SignMasterPublicKey,
    EncryptMasterPublicKey,
    SignPrivateKey,
    EncryptPrivateKey,
}

impl KeyField {
    pub fn is_private(self) -> bool {
        matches!(self, KeyField::SignPrivateKey | KeyField::EncryptPrivateKey)
    }
}

impl fmt::Display for KeyField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Named after the configuration keys.
        let name = match self {
            KeyField::SignMasterPublicKey => "sign_master_public_key",
            KeyField::EncryptMasterPublicKey => "encrypt_master_public_key",
            KeyField::SignPrivateKey => "sign_private_key",
            KeyField::EncryptPrivateKey => "encrypt_private_key",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug)]
pub enum IdentityError {
    #[error("Incomplete identity: {0} is missing")]
    IncompleteIdentity(KeyField),

    #[error("Malformed {field}: {source}")]
    MalformedKey {
        field: KeyField,
        #[source]
        source: KeyError,
    },

    #[error("Invalid remote identity: {0}")]
    RemoteIdentityParse(String),
}

impl IdentityError {
    /// True when the failure is confined to private-key material, i.e. the
    /// identity can still be recovered by provisioning.
    pub fn needs_provisioning(&self) -> bool {
        matches!(self, IdentityError::MalformedKey { field, .. } if field.is_private())
    }
}
