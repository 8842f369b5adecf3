//! Startup: load the identity, provisioning it first if needed

use std::path::Path;
use std::sync::Arc;

use thiserror::Error;

use crate::config::{Config, ConfigError};
use crate::identity::{DeviceIdentity, IdentityError};
use crate::provisioning::{
    AuthorityError, HttpKeyAuthority, KeyAuthority, KeyProvisioner, ProvisioningError,
};
use crate::sm9::IdentityCipher;

#[derive(Error, Debug)]
pub enum BootstrapError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Unusable identity: {0}")]
    Identity(#[from] IdentityError),

    #[error("Provisioning failed: {0}")]
    Provisioning(#[from] ProvisioningError),

    #[error("Key authority unavailable: {0}")]
    Authority(#[from] AuthorityError),
}

/// Load the configuration at `path` and return a provisioned identity.
///
/// Missing or malformed private keys trigger provisioning, after which the
/// configuration file is rewritten. Missing or malformed master keys are
/// fatal.
pub async fn ensure_provisioned(
    path: &Path,
    cipher: Arc<dyn IdentityCipher>,
    authority: Arc<dyn KeyAuthority>,
) -> Result<(Arc<DeviceIdentity>, Config), BootstrapError> {
    let config = Config::load(path)?;
    provision_loaded(config, path, cipher, authority).await
}

/// `ensure_provisioned` against the HTTP endpoints and request timeout named
/// in the configuration itself.
pub async fn ensure_provisioned_over_http(
    path: &Path,
    cipher: Arc<dyn IdentityCipher>,
) -> Result<(Arc<DeviceIdentity>, Config), BootstrapError> {
    let config = Config::load(path)?;
    let authority = Arc::new(HttpKeyAuthority::from_config(&config)?);
    provision_loaded(config, path, cipher, authority).await
}

async fn provision_loaded(
    mut config: Config,
    path: &Path,
    cipher: Arc<dyn IdentityCipher>,
    authority: Arc<dyn KeyAuthority>,
) -> Result<(Arc<DeviceIdentity>, Config), BootstrapError> {

    let mut identity = match DeviceIdentity::load(&config.user) {
        Ok(identity) if identity.is_provisioned() => {
            log::info!("Identity {} loaded", identity.uid_str());
            return Ok((Arc::new(identity), config));
        }
        Ok(identity) => {
            log::info!("Identity {} needs provisioning", identity.uid_str());
            identity
        }
        Err(e) if e.needs_provisioning() => {
            log::warn!("Stored private key unusable ({}), provisioning again", e);
            DeviceIdentity::load(&config.user.without_private_keys())?
        }
        Err(e) => return Err(e.into()),
    };

    let provisioner = KeyProvisioner::new(cipher, authority, &config.provisioning);
    provisioner.run(&mut identity, &mut config, path).await?;

    Ok((Arc::new(identity), config))
}
