//! Transport callback contract
//!
//! The MQTT v5 client owns the wire format. It hands the engine the pieces
//! of CONNECT and AUTH packets that enhanced authentication needs, and
//! expects the same pieces back.

use super::HandshakeError;

/// MQTT v5 AUTH reason codes used by enhanced authentication.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ReasonCode {
    Success = 0x00,
    ContinueAuthentication = 0x18,
    ReAuthenticate = 0x19,
}

impl ReasonCode {
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn from_u8(code: u8) -> Option<Self> {
        match code {
            0x00 => Some(ReasonCode::Success),
            0x18 => Some(ReasonCode::ContinueAuthentication),
            0x19 => Some(ReasonCode::ReAuthenticate),
            _ => None,
        }
    }
}

/// Ordered MQTT user properties. Keys may repeat; lookups return the first.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct UserProperties(Vec<(String, String)>);

impl UserProperties {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.push((key.into(), value.into()));
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for UserProperties {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

/// Authentication fields placed in the CONNECT packet.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectAuth {
    pub auth_method: String,
    pub auth_data: Vec<u8>,
    pub user_properties: UserProperties,
}

/// Authentication fields of an AUTH packet, in either direction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AuthPacket {
    pub reason_code: ReasonCode,
    pub auth_method: String,
    pub auth_data: Vec<u8>,
    pub user_properties: UserProperties,
}

impl AuthPacket {
    pub fn continue_with(auth_method: &str, auth_data: Vec<u8>) -> Self {
        Self {
            reason_code: ReasonCode::ContinueAuthentication,
            auth_method: auth_method.to_string(),
            auth_data,
            user_properties: UserProperties::new(),
        }
    }

    /// The abort response: ask the broker to start over.
    pub fn reauthenticate(auth_method: &str) -> Self {
        Self {
            reason_code: ReasonCode::ReAuthenticate,
            auth_method: auth_method.to_string(),
            auth_data: Vec::new(),
            user_properties: UserProperties::new(),
        }
    }
}

/// Callbacks the transport invokes during connection negotiation.
///
/// The transport calls these strictly in sequence for one attempt and never
/// concurrently for two attempts on the same handler.
pub trait AuthHandler: Send + Sync {
    /// Building the CONNECT packet for a new attempt.
    fn on_connect_packet_build(&self) -> Result<ConnectAuth, HandshakeError>;

    /// An AUTH packet arrived from the broker. Never fails: problems become a
    /// Re-authenticate response.
    fn on_auth_continuation(&self, packet: &AuthPacket) -> AuthPacket;

    /// The broker signalled that authentication is complete.
    fn on_authenticated(&self);
}
