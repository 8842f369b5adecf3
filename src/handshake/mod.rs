//! MQTT v5 enhanced-authentication engine
//!
//! Challenge-response over identity-based encryption:
//!
//! 1. CONNECT carries a fresh client nonce `R1` (hex text) and our identity.
//! 2. The broker answers with `hex(E_us(R1 || R2))`.
//! 3. We check the `R1` echo, keep `R2` as the session key, and reply with
//!    `hex(E_broker(R2))`.
//! 4. The broker signals completion.
//!
//! Failures never escape to the transport: they move the engine to `Failed`
//! and produce a Re-authenticate response.
//!
//! SECURITY: R1 travels in the clear and the peer names the master key `R2`
//! is encrypted under. A peer declaring a master key from another KGC is
//! still answered, so an active man-in-the-middle that rewrites the CONNECT
//! can read `R2`. Such peers are logged at `warn`.

pub mod packet;

pub use packet::{AuthHandler, AuthPacket, ConnectAuth, ReasonCode, UserProperties};

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use rand::rngs::OsRng;
use rand::RngCore;
use thiserror::Error;
use zeroize::Zeroizing;

use crate::config::{AuthConfig, MAX_NONCE_LEN, MIN_NONCE_LEN};
use crate::identity::remote::{
    PROP_DEVICE_NAME, PROP_ENCRYPT_MASTER_KEY, PROP_HID, PROP_SIGN_MASTER_KEY, PROP_UID,
};
use crate::identity::{DeviceIdentity, IdentityError, RemoteIdentity};
use crate::sm9::{CryptoError, IdentityCipher};

// ---------------------------------------------------------------------------
// State & errors
// ---------------------------------------------------------------------------

/// Observable state of one authentication attempt.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HandshakeState {
    Idle,
    ChallengeSent,
    AwaitingVerification,
    Authenticated,
    Failed { reason: String },
}

#[derive(Error, Debug)]
pub enum HandshakeError {
    #[error("Randomness unavailable: {0}")]
    RandomnessUnavailable(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Unexpected authentication method: {0}")]
    UnexpectedAuthMethod(String),

    #[error("Invalid authentication data: {0}")]
    InvalidAuthData(String),

    #[error("Challenge decryption failed: {0}")]
    Decrypt(#[source] CryptoError),

    #[error("Nonce length {0} outside 1..=64 bytes")]
    InvalidNonceLength(usize),

    #[error("Malformed challenge: expected {expected} bytes, got {actual}")]
    MalformedChallenge { expected: usize, actual: usize },

    #[error("Challenge echo does not match our nonce")]
    ChallengeMismatch,

    #[error(transparent)]
    RemoteIdentity(#[from] IdentityError),

    #[error("Device has no encryption private key")]
    MissingPrivateKey,

    #[error("Response encryption failed: {0}")]
    Encrypt(String),
}

// ---------------------------------------------------------------------------
// Nonce generation
// ---------------------------------------------------------------------------

/// Source of client challenge nonces. A trait so tests can fix `R1`.
pub trait NonceSource: Send + Sync {
    fn fill(&self, nonce: &mut [u8]) -> Result<(), HandshakeError>;
}

/// Operating-system randomness.
pub struct OsNonceSource;

impl NonceSource for OsNonceSource {
    fn fill(&self, nonce: &mut [u8]) -> Result<(), HandshakeError> {
        OsRng
            .try_fill_bytes(nonce)
            .map_err(|e| HandshakeError::RandomnessUnavailable(e.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// The nonce outstanding for the current attempt.
struct ChallengeState {
    local_nonce: Zeroizing<Vec<u8>>,
    local_nonce_hex: String,
}

struct EngineInner {
    state: HandshakeState,
    challenge: Option<ChallengeState>,
}

/// Drives the client side of the handshake for one device identity.
///
/// The transport serialises attempts, but the challenge still sits behind a
/// mutex so a misbehaving adapter cannot interleave two attempts.
pub struct HandshakeEngine {
    identity: Arc<DeviceIdentity>,
    cipher: Arc<dyn IdentityCipher>,
    nonces: Box<dyn NonceSource>,
    device_name: String,
    auth_method: String,
    nonce_len: usize,
    inner: Mutex<EngineInner>,
}

impl HandshakeEngine {
    pub fn new(
        identity: Arc<DeviceIdentity>,
        cipher: Arc<dyn IdentityCipher>,
        auth: &AuthConfig,
        device_name: impl Into<String>,
    ) -> Self {
        Self::with_nonce_source(identity, cipher, auth, device_name, Box::new(OsNonceSource))
    }

    /// Create with a custom nonce source (for testing).
    pub fn with_nonce_source(
        identity: Arc<DeviceIdentity>,
        cipher: Arc<dyn IdentityCipher>,
        auth: &AuthConfig,
        device_name: impl Into<String>,
        nonces: Box<dyn NonceSource>,
    ) -> Self {
        Self {
            identity,
            cipher,
            nonces,
            device_name: device_name.into(),
            auth_method: auth.method.clone(),
            nonce_len: auth.nonce_len,
            inner: Mutex::new(EngineInner {
                state: HandshakeState::Idle,
                challenge: None,
            }),
        }
    }

    pub fn state(&self) -> HandshakeState {
        self.lock().state.clone()
    }

    pub fn identity(&self) -> &Arc<DeviceIdentity> {
        &self.identity
    }

    fn lock(&self) -> MutexGuard<'_, EngineInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start a new attempt: draw `R1` and build the CONNECT authentication
    /// fields. Any previous attempt, and its session key, is abandoned.
    pub fn begin(&self) -> Result<ConnectAuth, HandshakeError> {
        let mut inner = self.lock();
        inner.challenge = None;
        self.identity.clear_session_key();

        if !(MIN_NONCE_LEN..=MAX_NONCE_LEN).contains(&self.nonce_len) {
            let e = HandshakeError::InvalidNonceLength(self.nonce_len);
            inner.state = HandshakeState::Failed {
                reason: e.to_string(),
            };
            return Err(e);
        }

        let mut nonce = Zeroizing::new(vec![0u8; self.nonce_len]);
        if let Err(e) = self.nonces.fill(&mut nonce) {
            inner.state = HandshakeState::Failed {
                reason: e.to_string(),
            };
            return Err(e);
        }
        let nonce_hex = hex::encode(&*nonce);

        let mut user_properties = UserProperties::new();
        user_properties.push(PROP_UID, self.identity.uid_str());
        user_properties.push(PROP_HID, self.identity.hid_hex());
        user_properties.push(
            PROP_SIGN_MASTER_KEY,
            self.identity.sign_master_public_key().to_hex(),
        );
        user_properties.push(
            PROP_ENCRYPT_MASTER_KEY,
            self.identity.encrypt_master_public_key().to_hex(),
        );
        user_properties.push(PROP_DEVICE_NAME, self.device_name.clone());

        let connect = ConnectAuth {
            auth_method: self.auth_method.clone(),
            auth_data: nonce_hex.as_bytes().to_vec(),
            user_properties,
        };

        inner.challenge = Some(ChallengeState {
            local_nonce: nonce,
            local_nonce_hex: nonce_hex,
        });
        inner.state = HandshakeState::ChallengeSent;
        log::debug!("Authentication challenge sent for {}", self.identity.uid_str());

        Ok(connect)
    }

    /// Handle the broker's AUTH continuation. Always returns a packet to
    /// send: the encrypted `R2` on success, Re-authenticate otherwise.
    pub fn continue_auth(&self, packet: &AuthPacket) -> AuthPacket {
        let mut inner = self.lock();

        match self.verify_challenge(&inner, packet) {
            Ok((session_key, response)) => {
                self.identity.set_session_key(&session_key);
                inner.challenge = None;
                inner.state = HandshakeState::AwaitingVerification;
                log::debug!("Challenge verified, awaiting completion");
                AuthPacket::continue_with(&self.auth_method, response)
            }
            Err(e) => {
                log::warn!("Authentication aborted: {}", e);
                inner.challenge = None;
                inner.state = HandshakeState::Failed {
                    reason: e.to_string(),
                };
                self.identity.clear_session_key();
                AuthPacket::reauthenticate(&self.auth_method)
            }
        }
    }

    /// Returns `(R2, hex(E_peer(R2)))`.
    fn verify_challenge(
        &self,
        inner: &EngineInner,
        packet: &AuthPacket,
    ) -> Result<(Zeroizing<Vec<u8>>, Vec<u8>), HandshakeError> {
        let challenge = match (&inner.state, &inner.challenge) {
            (HandshakeState::ChallengeSent, Some(challenge)) => challenge,
            (state, _) => {
                return Err(HandshakeError::InvalidState(format!(
                    "continuation received in state {:?}",
                    state
                )))
            }
        };

        if packet.reason_code != ReasonCode::ContinueAuthentication {
            return Err(HandshakeError::InvalidState(format!(
                "unexpected reason code {:?}",
                packet.reason_code
            )));
        }
        if packet.auth_method != self.auth_method {
            return Err(HandshakeError::UnexpectedAuthMethod(packet.auth_method.clone()));
        }

        let remote = RemoteIdentity::from_properties(&packet.user_properties)?;

        let ciphertext = std::str::from_utf8(&packet.auth_data)
            .map_err(|e| HandshakeError::InvalidAuthData(e.to_string()))
            .and_then(|text| {
                hex::decode(text.trim()).map_err(|e| HandshakeError::InvalidAuthData(e.to_string()))
            })?;

        let private_key = self
            .identity
            .encrypt_private_key()
            .ok_or(HandshakeError::MissingPrivateKey)?;
        let plaintext = Zeroizing::new(
            self.cipher
                .decrypt(private_key, self.identity.uid(), &ciphertext)
                .map_err(HandshakeError::Decrypt)?,
        );

        let expected = 2 * challenge.local_nonce.len();
        if challenge.local_nonce.is_empty() || plaintext.len() != expected {
            return Err(HandshakeError::MalformedChallenge {
                expected,
                actual: plaintext.len(),
            });
        }

        let (echo, remote_nonce) = plaintext.split_at(challenge.local_nonce.len());
        if hex::encode(echo) != challenge.local_nonce_hex {
            return Err(HandshakeError::ChallengeMismatch);
        }

        let own_master = self.identity.encrypt_master_public_key();
        if remote.declares_foreign_master(own_master) {
            log::warn!(
                "Peer {} declares an encryption master key from another KGC",
                String::from_utf8_lossy(&remote.uid)
            );
        }
        let master = remote.encrypt_master_or(own_master);
        let reply = self
            .cipher
            .encrypt(master, &remote.uid, remote.hid, remote_nonce)
            .map_err(|e| HandshakeError::Encrypt(e.to_string()))?;

        Ok((
            Zeroizing::new(remote_nonce.to_vec()),
            hex::encode(reply).into_bytes(),
        ))
    }

    /// The transport reports the handshake complete.
    pub fn complete(&self) {
        let mut inner = self.lock();
        let state = inner.state.clone();
        match state {
            HandshakeState::AwaitingVerification => {
                inner.state = HandshakeState::Authenticated;
                log::info!("Authenticated as {}", self.identity.uid_str());
            }
            HandshakeState::Authenticated => {}
            other => {
                let reason = format!("completion signalled in state {:?}", other);
                log::warn!("Authentication aborted: {}", reason);
                inner.challenge = None;
                inner.state = HandshakeState::Failed { reason };
                self.identity.clear_session_key();
            }
        }
    }
}

impl AuthHandler for HandshakeEngine {
    fn on_connect_packet_build(&self) -> Result<ConnectAuth, HandshakeError> {
        self.begin()
    }

    fn on_auth_continuation(&self, packet: &AuthPacket) -> AuthPacket {
        self.continue_auth(packet)
    }

    fn on_authenticated(&self) {
        self.complete()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sm9::SimulatedKgc;

    struct FixedNonce(Vec<u8>);

    impl NonceSource for FixedNonce {
        fn fill(&self, nonce: &mut [u8]) -> Result<(), HandshakeError> {
            nonce.copy_from_slice(&self.0[..nonce.len()]);
            Ok(())
        }
    }

    struct NoEntropy;

    impl NonceSource for NoEntropy {
        fn fill(&self, _nonce: &mut [u8]) -> Result<(), HandshakeError> {
            Err(HandshakeError::RandomnessUnavailable("no entropy".to_string()))
        }
    }

    fn auth_config(nonce_len: usize) -> AuthConfig {
        AuthConfig {
            nonce_len,
            ..Default::default()
        }
    }

    fn provisioned(kgc: &SimulatedKgc) -> Arc<DeviceIdentity> {
        let mut identity = DeviceIdentity::new(
            "dev-1",
            1,
            kgc.sign_master_public_key().clone(),
            kgc.encrypt_master_public_key().clone(),
        );
        let sign = kgc.issue_sign_key(b"dev-1", 1).unwrap();
        let encrypt = kgc.issue_encrypt_key(b"dev-1", 1).unwrap();
        identity
            .install_private_keys(sign.as_der(), encrypt.as_der())
            .unwrap();
        Arc::new(identity)
    }

    fn engine(kgc: &Arc<SimulatedKgc>, nonce: &[u8]) -> HandshakeEngine {
        HandshakeEngine::with_nonce_source(
            provisioned(kgc),
            kgc.clone(),
            &auth_config(nonce.len()),
            "sensor-a",
            Box::new(FixedNonce(nonce.to_vec())),
        )
    }

    fn broker_props() -> UserProperties {
        vec![("uid", "broker"), ("hid", "03")].into_iter().collect()
    }

    fn challenge_for(kgc: &SimulatedKgc, body: &[u8]) -> AuthPacket {
        let ct = kgc
            .encrypt(kgc.encrypt_master_public_key(), b"dev-1", 1, body)
            .unwrap();
        AuthPacket {
            user_properties: broker_props(),
            ..AuthPacket::continue_with("sm9", hex::encode(ct).into_bytes())
        }
    }

    #[test]
    fn test_begin_builds_connect_fields() {
        let kgc = Arc::new(SimulatedKgc::generate());
        let engine = engine(&kgc, &[0xaa, 0xbb, 0xcc, 0xdd]);

        let connect = engine.begin().unwrap();

        assert_eq!(connect.auth_method, "sm9");
        assert_eq!(connect.auth_data, b"aabbccdd");
        let keys: Vec<&str> = connect.user_properties.iter().map(|(k, _)| k).collect();
        assert_eq!(
            keys,
            vec!["uid", "hid", "signMasterKey", "encryptMasterKey", "deviceName"]
        );
        assert_eq!(connect.user_properties.get("uid"), Some("dev-1"));
        assert_eq!(connect.user_properties.get("hid"), Some("01"));
        assert_eq!(connect.user_properties.get("deviceName"), Some("sensor-a"));
        assert_eq!(engine.state(), HandshakeState::ChallengeSent);
    }

    #[test]
    fn test_default_nonce_is_random_each_attempt() {
        let kgc = Arc::new(SimulatedKgc::generate());
        let engine = HandshakeEngine::new(
            provisioned(&kgc),
            kgc.clone(),
            &AuthConfig::default(),
            "sensor-a",
        );

        let first = engine.begin().unwrap().auth_data;
        let second = engine.begin().unwrap().auth_data;

        assert_eq!(first.len(), 16);
        assert_ne!(first, second);
    }

    #[test]
    fn test_full_exchange() {
        let kgc = Arc::new(SimulatedKgc::generate());
        let engine = engine(&kgc, &[0xaa, 0xbb, 0xcc, 0xdd]);
        engine.begin().unwrap();

        let reply = engine.on_auth_continuation(&challenge_for(
            &kgc,
            &[0xaa, 0xbb, 0xcc, 0xdd, 0x11, 0x22, 0x33, 0x44],
        ));
        assert_eq!(reply.reason_code, ReasonCode::ContinueAuthentication);
        assert_eq!(engine.state(), HandshakeState::AwaitingVerification);

        let broker_key = kgc.issue_encrypt_key(b"broker", 3).unwrap();
        let ct = hex::decode(&reply.auth_data).unwrap();
        assert_eq!(
            kgc.decrypt(&broker_key, b"broker", &ct).unwrap(),
            vec![0x11, 0x22, 0x33, 0x44]
        );

        engine.on_authenticated();
        assert_eq!(engine.state(), HandshakeState::Authenticated);
        assert_eq!(
            engine.identity().session_key().unwrap().as_slice(),
            &[0x11, 0x22, 0x33, 0x44]
        );
    }

    #[test]
    fn test_nonce_mismatch_fails() {
        let kgc = Arc::new(SimulatedKgc::generate());
        let engine = engine(&kgc, &[0xaa, 0xbb, 0xcc, 0xdd]);
        engine.begin().unwrap();

        let reply = engine.on_auth_continuation(&challenge_for(
            &kgc,
            &[0xaa, 0xbb, 0xcc, 0xde, 0x11, 0x22, 0x33, 0x44],
        ));

        assert_eq!(reply.reason_code, ReasonCode::ReAuthenticate);
        assert!(matches!(engine.state(), HandshakeState::Failed { .. }));
        assert!(engine.identity().session_key().is_none());

        engine.on_authenticated();
        assert_ne!(engine.state(), HandshakeState::Authenticated);
    }

    #[test]
    fn test_wrong_length_challenge_fails() {
        let kgc = Arc::new(SimulatedKgc::generate());
        let engine = engine(&kgc, &[0xaa, 0xbb, 0xcc, 0xdd]);
        engine.begin().unwrap();

        let reply = engine.continue_auth(&challenge_for(&kgc, &[0xaa, 0xbb, 0xcc, 0xdd, 0x11]));

        assert_eq!(reply.reason_code, ReasonCode::ReAuthenticate);
        match engine.state() {
            HandshakeState::Failed { reason } => assert!(reason.contains("expected 8 bytes")),
            other => panic!("expected Failed, got {:?}", other),
        }
    }

    #[test]
    fn test_malformed_peer_messages_abort() {
        let kgc = Arc::new(SimulatedKgc::generate());
        let good = challenge_for(&kgc, &[0xaa, 0xbb, 0xcc, 0xdd, 1, 2, 3, 4]);

        let not_hex = AuthPacket {
            auth_data: b"not hex at all".to_vec(),
            ..good.clone()
        };
        let no_uid = AuthPacket {
            user_properties: vec![("hid", "03")].into_iter().collect(),
            ..good.clone()
        };
        let wrong_method = AuthPacket {
            auth_method: "scram".to_string(),
            ..good.clone()
        };
        let garbage_ct = AuthPacket {
            auth_data: b"00112233".to_vec(),
            ..good.clone()
        };

        for packet in [not_hex, no_uid, wrong_method, garbage_ct] {
            let engine = engine(&kgc, &[0xaa, 0xbb, 0xcc, 0xdd]);
            engine.begin().unwrap();

            let reply = engine.continue_auth(&packet);
            assert_eq!(reply.reason_code, ReasonCode::ReAuthenticate);
            assert!(reply.auth_data.is_empty());
            assert!(matches!(engine.state(), HandshakeState::Failed { .. }));
        }
    }

    #[test]
    fn test_continuation_before_begin_fails() {
        let kgc = Arc::new(SimulatedKgc::generate());
        let engine = engine(&kgc, &[0xaa, 0xbb, 0xcc, 0xdd]);

        let reply = engine.continue_auth(&challenge_for(&kgc, &[0xaa, 0xbb, 0xcc, 0xdd, 1, 2, 3, 4]));

        assert_eq!(reply.reason_code, ReasonCode::ReAuthenticate);
        assert!(matches!(engine.state(), HandshakeState::Failed { .. }));
    }

    #[test]
    fn test_replayed_continuation_rejected() {
        let kgc = Arc::new(SimulatedKgc::generate());
        let engine = engine(&kgc, &[0xaa, 0xbb, 0xcc, 0xdd]);
        engine.begin().unwrap();
        let packet = challenge_for(&kgc, &[0xaa, 0xbb, 0xcc, 0xdd, 1, 2, 3, 4]);

        assert_eq!(engine.continue_auth(&packet).reason_code, ReasonCode::ContinueAuthentication);
        assert_eq!(engine.continue_auth(&packet).reason_code, ReasonCode::ReAuthenticate);
    }

    #[test]
    fn test_unprovisioned_device_aborts() {
        let kgc = Arc::new(SimulatedKgc::generate());
        let identity = Arc::new(DeviceIdentity::new(
            "dev-1",
            1,
            kgc.sign_master_public_key().clone(),
            kgc.encrypt_master_public_key().clone(),
        ));
        let engine = HandshakeEngine::with_nonce_source(
            identity,
            kgc.clone(),
            &auth_config(4),
            "sensor-a",
            Box::new(FixedNonce(vec![0xaa, 0xbb, 0xcc, 0xdd])),
        );
        engine.begin().unwrap();

        let reply = engine.continue_auth(&challenge_for(&kgc, &[0xaa, 0xbb, 0xcc, 0xdd, 1, 2, 3, 4]));
        assert_eq!(reply.reason_code, ReasonCode::ReAuthenticate);
    }

    #[test]
    fn test_restart_clears_previous_session() {
        let kgc = Arc::new(SimulatedKgc::generate());
        let engine = engine(&kgc, &[0xaa, 0xbb, 0xcc, 0xdd]);
        engine.begin().unwrap();
        engine.continue_auth(&challenge_for(&kgc, &[0xaa, 0xbb, 0xcc, 0xdd, 1, 2, 3, 4]));
        engine.complete();
        assert!(engine.identity().session_key().is_some());

        engine.begin().unwrap();
        assert_eq!(engine.state(), HandshakeState::ChallengeSent);
        assert!(engine.identity().session_key().is_none());
    }

    #[test]
    fn test_completion_without_challenge_fails() {
        let kgc = Arc::new(SimulatedKgc::generate());
        let engine = engine(&kgc, &[0xaa, 0xbb, 0xcc, 0xdd]);
        engine.begin().unwrap();

        engine.complete();
        assert!(matches!(engine.state(), HandshakeState::Failed { .. }));
    }

    #[test]
    fn test_out_of_range_nonce_len_rejected() {
        let kgc = Arc::new(SimulatedKgc::generate());

        for nonce_len in [0, 65, 1 << 30] {
            let identity = provisioned(&kgc);
            let engine = HandshakeEngine::with_nonce_source(
                identity.clone(),
                kgc.clone(),
                &auth_config(nonce_len),
                "sensor-a",
                Box::new(FixedNonce(Vec::new())),
            );

            assert!(matches!(
                engine.begin(),
                Err(HandshakeError::InvalidNonceLength(n)) if n == nonce_len
            ));
            assert!(matches!(engine.state(), HandshakeState::Failed { .. }));

            // With no R1 on record, a challenge carrying only R2 never verifies.
            let reply = engine.continue_auth(&challenge_for(&kgc, &[]));
            assert_eq!(reply.reason_code, ReasonCode::ReAuthenticate);
            engine.complete();
            assert_ne!(engine.state(), HandshakeState::Authenticated);
            assert!(identity.session_key().is_none());
        }
    }

    #[test]
    fn test_randomness_failure_is_reported() {
        let kgc = Arc::new(SimulatedKgc::generate());
        let engine = HandshakeEngine::with_nonce_source(
            provisioned(&kgc),
            kgc.clone(),
            &auth_config(8),
            "sensor-a",
            Box::new(NoEntropy),
        );

        assert!(matches!(
            engine.on_connect_packet_build(),
            Err(HandshakeError::RandomnessUnavailable(_))
        ));
        assert!(matches!(engine.state(), HandshakeState::Failed { .. }));
    }
}
