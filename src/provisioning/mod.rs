//! First-run key provisioning
//!
//! A device that has its master public keys but no private keys applies for
//! them:
//!
//! 1. Draw a random 16-byte seed.
//! 2. Encrypt the seed to the platform's identity (`seed_label`).
//! 3. Register with the registration authority (failures are only logged).
//! 4. Poll the key-management platform until both keys are issued. They
//!    arrive SM4-OFB encrypted under the seed.
//! 5. Install the decrypted keys and persist the configuration.

pub mod authority;

pub use authority::{AuthorityError, HttpKeyAuthority, IssuedKeys, KeyAuthority};

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use rand::rngs::OsRng;
use rand::RngCore;
use thiserror::Error;
use zeroize::Zeroizing;

use crate::cipher::{self, CipherError};
use crate::config::{Config, ConfigError, ProvisioningConfig};
use crate::identity::{DeviceIdentity, IdentityError};
use crate::sm9::IdentityCipher;

/// Length of the provisioning seed, which doubles as the SM4 key.
pub const SEED_LEN: usize = 16;

#[derive(Error, Debug)]
pub enum ProvisioningError {
    #[error("Randomness unavailable: {0}")]
    RandomnessUnavailable(String),

    #[error("Seed encryption failed: {0}")]
    SeedEncryption(String),

    #[error("Key decryption failed: {0}")]
    KeyDecryption(#[from] CipherError),

    #[error("No keys issued after {0} polls")]
    PollLimitReached(u32),

    #[error("Poll task failed: {0}")]
    TaskFailed(String),

    #[error("Issued keys rejected: {0}")]
    Install(#[from] IdentityError),

    #[error("Failed to persist configuration: {0}")]
    Persist(#[from] ConfigError),
}

/// Registration payload sent to the registration authority.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProvisioningRequest {
    pub id: String,
    pub device_name: String,
    pub eid: String,
    pub device_type: String,
    /// Identity-based ciphertext of the seed
    pub encrypted_seed: Vec<u8>,
}

/// Decrypted private-key DER as issued by the platform.
pub struct ProvisioningResult {
    pub sign_key_material: Zeroizing<Vec<u8>>,
    pub encrypt_key_material: Zeroizing<Vec<u8>>,
}

/// Descriptive fields sent with the registration.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DeviceProfile {
    pub device_name: String,
    pub eid: String,
    pub device_type: String,
}

impl DeviceProfile {
    pub fn from_config(config: &Config) -> Self {
        Self {
            device_name: config.mqtt.client_name.clone(),
            eid: config.user.eid.clone(),
            device_type: config.user.device_type.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Provisioner
// ---------------------------------------------------------------------------

pub struct KeyProvisioner {
    cipher: Arc<dyn IdentityCipher>,
    authority: Arc<dyn KeyAuthority>,
    poll_interval: Duration,
    max_polls: Option<u32>,
    seed_label: String,
}

impl KeyProvisioner {
    pub fn new(
        cipher: Arc<dyn IdentityCipher>,
        authority: Arc<dyn KeyAuthority>,
        conf: &ProvisioningConfig,
    ) -> Self {
        Self {
            cipher,
            authority,
            poll_interval: Duration::from_secs(conf.poll_interval_secs),
            max_polls: conf.max_polls,
            seed_label: conf.seed_label.clone(),
        }
    }

    /// Obtain and install private keys for `identity`.
    ///
    /// Blocks until the platform issues keys, or until `max_polls` polls
    /// have come back empty.
    pub async fn provision(
        &self,
        identity: &mut DeviceIdentity,
        profile: &DeviceProfile,
    ) -> Result<(), ProvisioningError> {
        let mut seed = Zeroizing::new([0u8; SEED_LEN]);
        OsRng
            .try_fill_bytes(&mut *seed)
            .map_err(|e| ProvisioningError::RandomnessUnavailable(e.to_string()))?;

        let encrypted_seed = self
            .cipher
            .encrypt(
                identity.encrypt_master_public_key(),
                self.seed_label.as_bytes(),
                identity.hid(),
                &seed[..],
            )
            .map_err(|e| ProvisioningError::SeedEncryption(e.to_string()))?;

        let request = ProvisioningRequest {
            id: identity.uid_str(),
            device_name: profile.device_name.clone(),
            eid: profile.eid.clone(),
            device_type: profile.device_type.clone(),
            encrypted_seed,
        };

        log::info!("Registering device {}", request.id);
        if let Err(e) = self.authority.register(&request).await {
            // Polling proceeds regardless.
            log::warn!("Registration for {} failed: {}", request.id, e);
        }

        let poller = Poller {
            authority: self.authority.clone(),
            id: request.id.clone(),
            seed: seed.clone(),
            interval: self.poll_interval,
            max_polls: self.max_polls,
        };
        let result = tokio::spawn(poller.run())
            .await
            .map_err(|e| ProvisioningError::TaskFailed(e.to_string()))??;

        identity.install_private_keys(&result.sign_key_material, &result.encrypt_key_material)?;
        log::info!("Private keys installed for {}", request.id);
        Ok(())
    }

    /// `provision`, then write the new keys into `config` and save it.
    pub async fn run(
        &self,
        identity: &mut DeviceIdentity,
        config: &mut Config,
        path: &Path,
    ) -> Result<(), ProvisioningError> {
        let profile = DeviceProfile::from_config(config);
        self.provision(identity, &profile).await?;

        identity.store(&mut config.user);
        config.save(path)?;
        log::info!("Provisioned configuration saved to {}", path.display());
        Ok(())
    }
}

/// The polling half of provisioning, owned by its own task.
struct Poller {
    authority: Arc<dyn KeyAuthority>,
    id: String,
    seed: Zeroizing<[u8; SEED_LEN]>,
    interval: Duration,
    max_polls: Option<u32>,
}

impl Poller {
    async fn run(self) -> Result<ProvisioningResult, ProvisioningError> {
        let mut polls: u32 = 0;

        loop {
            if let Some(max) = self.max_polls {
                if polls >= max {
                    return Err(ProvisioningError::PollLimitReached(max));
                }
            }

            tokio::time::sleep(self.interval).await;
            polls += 1;

            let issued = match self.authority.query_keys(&self.id).await {
                Ok(issued) => issued,
                Err(e) => {
                    log::warn!("Key query {} for {} failed: {}", polls, self.id, e);
                    continue;
                }
            };

            if !issued.is_ready() {
                log::debug!("Keys for {} not issued yet (poll {})", self.id, polls);
                continue;
            }

            if let Some(result) = self.decode(&issued)? {
                return Ok(result);
            }
        }
    }

    /// `Ok(None)` when the platform returned something that is not hex.
    fn decode(&self, issued: &IssuedKeys) -> Result<Option<ProvisioningResult>, ProvisioningError> {
        let (sign, encrypt) = match (
            hex::decode(issued.sign_key.trim()),
            hex::decode(issued.encrypt_key.trim()),
        ) {
            (Ok(sign), Ok(encrypt)) => (Zeroizing::new(sign), Zeroizing::new(encrypt)),
            (Err(e), _) | (_, Err(e)) => {
                log::warn!("Issued keys for {} are not valid hex: {}", self.id, e);
                return Ok(None);
            }
        };

        Ok(Some(ProvisioningResult {
            sign_key_material: Zeroizing::new(cipher::decrypt(&self.seed[..], &sign)?),
            encrypt_key_material: Zeroizing::new(cipher::decrypt(&self.seed[..], &encrypt)?),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sm9::SimulatedKgc;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Platform that never issues anything.
    struct SilentPlatform {
        queries: Mutex<u32>,
    }

    #[async_trait]
    impl KeyAuthority for SilentPlatform {
        async fn register(&self, _request: &ProvisioningRequest) -> Result<(), AuthorityError> {
            Ok(())
        }

        async fn query_keys(&self, _id: &str) -> Result<IssuedKeys, AuthorityError> {
            *self.queries.lock().unwrap() += 1;
            Ok(IssuedKeys::default())
        }
    }

    /// Platform that rejects registration and only ever returns non-hex keys.
    struct NonHexPlatform {
        queries: Mutex<u32>,
    }

    #[async_trait]
    impl KeyAuthority for NonHexPlatform {
        async fn register(&self, _request: &ProvisioningRequest) -> Result<(), AuthorityError> {
            Err(AuthorityError::Status(500))
        }

        async fn query_keys(&self, _id: &str) -> Result<IssuedKeys, AuthorityError> {
            let mut queries = self.queries.lock().unwrap();
            *queries += 1;
            Ok(IssuedKeys {
                sign_key: "not-hex".to_string(),
                encrypt_key: "zz".to_string(),
            })
        }
    }

    fn unprovisioned(kgc: &SimulatedKgc) -> DeviceIdentity {
        DeviceIdentity::new(
            "dev-1",
            1,
            kgc.sign_master_public_key().clone(),
            kgc.encrypt_master_public_key().clone(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_limit_reached() {
        let kgc = Arc::new(SimulatedKgc::generate());
        let platform = Arc::new(SilentPlatform {
            queries: Mutex::new(0),
        });
        let conf = ProvisioningConfig {
            max_polls: Some(4),
            ..Default::default()
        };
        let provisioner = KeyProvisioner::new(kgc.clone(), platform.clone(), &conf);
        let mut identity = unprovisioned(&kgc);

        let err = provisioner
            .provision(&mut identity, &DeviceProfile::default())
            .await
            .unwrap_err();

        assert!(matches!(err, ProvisioningError::PollLimitReached(4)));
        assert_eq!(*platform.queries.lock().unwrap(), 4);
        assert!(!identity.is_provisioned());
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_hex_keys_are_retried() {
        let kgc = Arc::new(SimulatedKgc::generate());
        let platform = Arc::new(NonHexPlatform {
            queries: Mutex::new(0),
        });
        let conf = ProvisioningConfig {
            max_polls: Some(3),
            ..Default::default()
        };
        let provisioner = KeyProvisioner::new(kgc.clone(), platform.clone(), &conf);
        let mut identity = unprovisioned(&kgc);

        let err = provisioner
            .provision(&mut identity, &DeviceProfile::default())
            .await
            .unwrap_err();

        assert!(matches!(err, ProvisioningError::PollLimitReached(3)));
        assert_eq!(*platform.queries.lock().unwrap(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_poll_waits_one_interval() {
        let kgc = Arc::new(SimulatedKgc::generate());
        let platform = Arc::new(SilentPlatform {
            queries: Mutex::new(0),
        });
        let conf = ProvisioningConfig {
            max_polls: Some(1),
            ..Default::default()
        };
        let provisioner = KeyProvisioner::new(kgc.clone(), platform.clone(), &conf);
        let mut identity = unprovisioned(&kgc);

        let start = tokio::time::Instant::now();
        let _ = provisioner
            .provision(&mut identity, &DeviceProfile::default())
            .await;

        assert!(start.elapsed() >= Duration::from_secs(3));
    }

    #[test]
    fn test_profile_from_config() {
        let config = Config::from_yaml(
            "mqtt:\n  client_name: sensor-a\nuser:\n  uid: dev-1\n  eid: e-7\n  device_type: meter\naddr:\n  ra: x\n  platform: y\n",
        )
        .unwrap();

        let profile = DeviceProfile::from_config(&config);
        assert_eq!(profile.device_name, "sensor-a");
        assert_eq!(profile.eid, "e-7");
        assert_eq!(profile.device_type, "meter");
    }
}
