// sm9-auth-client - SM9 device provisioning and MQTT v5 enhanced authentication

pub mod bootstrap;
pub mod cipher;
pub mod config;
pub mod handshake;
pub mod identity;
pub mod logging;
pub mod payload;
pub mod provisioning;
pub mod sm9;

pub use bootstrap::{ensure_provisioned, ensure_provisioned_over_http, BootstrapError};
pub use config::Config;
pub use handshake::{AuthHandler, HandshakeEngine, HandshakeState};
pub use identity::{DeviceIdentity, RemoteIdentity};
pub use payload::MessageHandler;
pub use provisioning::{HttpKeyAuthority, KeyAuthority, KeyProvisioner};
pub use sm9::IdentityCipher;
