//! SSH transport layer state machine (RFC 4253).
//!
//! Tracks the connection lifecycle from version exchange to encrypted
//! operation:
//!
//! 1. **VersionExchange** - exchange `SSH-2.0-…` identification strings
//! 2. **KexInit** - exchange SSH_MSG_KEXINIT
//! 3. **KeyExchange** - run the negotiated KEX method
//! 4. **NewKeys** - exchange SSH_MSG_NEWKEYS, install the derived keys
//! 5. **Encrypted** - normal operation
//!
//! The exchange hash of the first key exchange becomes the session
//! identifier and never changes afterwards, including across rekeys.
//!
//! # Rekeying
//!
//! The transport may return from Encrypted to KexInit once 2^32 bytes have
//! moved or an hour has passed; both sides keep processing the pipeline
//! until the new keys are swapped in atomically at NEWKEYS.

use crate::ssh::crypto::{CipherAlgorithm, DecryptionKey, EncryptionKey, MacAlgorithm, MacKey};
use crate::ssh::kex::{AlgorithmSuite, KexInit};
use crate::ssh::version::Version;
use tether_platform::{TetherError, TetherResult};

/// Bytes moved before a rekey is suggested (2^32, spec ceiling).
pub const REKEY_BYTES_LIMIT: u64 = 1 << 32;

/// Seconds elapsed before a rekey is suggested (one hour).
pub const REKEY_TIME_LIMIT: u64 = 3600;

/// Transport layer state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum State {
    /// Identification strings are being exchanged.
    VersionExchange,
    /// SSH_MSG_KEXINIT exchange.
    KexInit,
    /// The negotiated key exchange is running.
    KeyExchange,
    /// SSH_MSG_NEWKEYS exchange; keys about to be installed.
    NewKeys,
    /// Encrypted, authenticated operation.
    Encrypted,
}

/// Transport layer configuration.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Our identification string.
    pub version: Version,

    /// Our algorithm preference lists, fixed at transport creation.
    pub algorithms: AlgorithmSuite,

    /// Bytes before an automatic rekey.
    pub rekey_bytes_limit: u64,

    /// Seconds before an automatic rekey.
    pub rekey_time_limit: u64,

    /// Whether we are the client (true) or server (false).
    pub is_client: bool,
}

impl TransportConfig {
    /// Creates a transport configuration for the given role.
    pub fn new(is_client: bool) -> Self {
        Self {
            version: Version::default_tether(),
            algorithms: AlgorithmSuite::default(),
            rekey_bytes_limit: REKEY_BYTES_LIMIT,
            rekey_time_limit: REKEY_TIME_LIMIT,
            is_client,
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self::new(true)
    }
}

/// Negotiated encryption parameters for one transport.
#[derive(Debug)]
pub struct EncryptionParams {
    /// Cipher for the client-to-server direction.
    pub cipher_c2s: CipherAlgorithm,

    /// Cipher for the server-to-client direction.
    pub cipher_s2c: CipherAlgorithm,

    /// MAC for client-to-server (None for AEAD ciphers).
    pub mac_c2s: Option<MacAlgorithm>,

    /// MAC for server-to-client (None for AEAD ciphers).
    pub mac_s2c: Option<MacAlgorithm>,

    /// Key sealing our outgoing packets.
    pub encryption_key: Option<EncryptionKey>,

    /// Key opening incoming packets.
    pub decryption_key: Option<DecryptionKey>,

    /// Outgoing MAC state (if the cipher needs one).
    pub mac_key_out: Option<MacKey>,

    /// Incoming MAC state (if the cipher needs one).
    pub mac_key_in: Option<MacKey>,
}

impl EncryptionParams {
    /// Creates encryption parameters with no keys installed yet.
    pub fn new(
        cipher_c2s: CipherAlgorithm,
        cipher_s2c: CipherAlgorithm,
        mac_c2s: Option<MacAlgorithm>,
        mac_s2c: Option<MacAlgorithm>,
    ) -> Self {
        Self {
            cipher_c2s,
            cipher_s2c,
            mac_c2s,
            mac_s2c,
            encryption_key: None,
            decryption_key: None,
            mac_key_out: None,
            mac_key_in: None,
        }
    }

    /// Installs the derived keys. Called at NEWKEYS; the swap is atomic
    /// from the caller's perspective because the transport serializes all
    /// packet processing.
    pub fn install_keys(
        &mut self,
        encryption_key: Option<EncryptionKey>,
        decryption_key: Option<DecryptionKey>,
        mac_key_out: Option<MacKey>,
        mac_key_in: Option<MacKey>,
    ) {
        self.encryption_key = encryption_key;
        self.decryption_key = decryption_key;
        self.mac_key_out = mac_key_out;
        self.mac_key_in = mac_key_in;
    }

    /// Returns whether both directional keys are installed.
    pub fn is_active(&self) -> bool {
        self.encryption_key.is_some() && self.decryption_key.is_some()
    }
}

/// The transport state machine.
#[derive(Debug)]
pub struct TransportState {
    state: State,
    config: TransportConfig,
    peer_version: Option<Version>,
    peer_kex_init: Option<KexInit>,
    encryption_params: Option<EncryptionParams>,
    /// Exchange hash of the first KEX; immutable for the transport lifetime.
    session_id: Option<Vec<u8>>,
    bytes_transferred: u64,
    last_kex_time: u64,
}

impl TransportState {
    /// Creates a transport state machine in VersionExchange.
    pub fn new(config: TransportConfig) -> Self {
        Self {
            state: State::VersionExchange,
            config,
            peer_version: None,
            peer_kex_init: None,
            encryption_params: None,
            session_id: None,
            bytes_transferred: 0,
            last_kex_time: 0,
        }
    }

    /// Returns the current state.
    pub fn current(&self) -> &State {
        &self.state
    }

    /// Returns the configuration.
    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// Returns the peer's identification string, once received.
    pub fn peer_version(&self) -> Option<&Version> {
        self.peer_version.as_ref()
    }

    /// Returns the peer's KEXINIT, once received.
    pub fn peer_kex_init(&self) -> Option<&KexInit> {
        self.peer_kex_init.as_ref()
    }

    /// Returns the encryption parameters, once installed.
    pub fn encryption_params(&self) -> Option<&EncryptionParams> {
        self.encryption_params.as_ref()
    }

    /// Returns mutable encryption parameters, once installed.
    pub fn encryption_params_mut(&mut self) -> Option<&mut EncryptionParams> {
        self.encryption_params.as_mut()
    }

    /// Returns the session identifier (first exchange hash), once set.
    pub fn session_id(&self) -> Option<&[u8]> {
        self.session_id.as_deref()
    }

    /// Records the session identifier. Only the first call sticks; the id
    /// is immutable across rekeys.
    pub fn set_session_id(&mut self, exchange_hash: &[u8]) {
        if self.session_id.is_none() {
            self.session_id = Some(exchange_hash.to_vec());
        }
    }

    /// Returns whether packets are currently encrypted.
    pub fn is_encrypted(&self) -> bool {
        matches!(self.state, State::Encrypted)
            && self
                .encryption_params
                .as_ref()
                .is_some_and(|p| p.is_active())
    }

    /// Transitions to the next state.
    ///
    /// # Errors
    ///
    /// Returns [`TetherError::Protocol`] for a transition the protocol does
    /// not allow (e.g. VersionExchange straight to Encrypted).
    pub fn transition(&mut self, next_state: State) -> TetherResult<()> {
        let valid = match (&self.state, &next_state) {
            (State::VersionExchange, State::KexInit) => true,
            (State::KexInit, State::KeyExchange) => true,
            (State::KeyExchange, State::NewKeys) => true,
            (State::NewKeys, State::Encrypted) => true,
            // Rekeying re-enters KexInit from Encrypted
            (State::Encrypted, State::KexInit) => true,
            (s1, s2) if s1 == s2 => true,
            _ => false,
        };

        if !valid {
            return Err(TetherError::Protocol(format!(
                "Invalid state transition: {:?} -> {:?}",
                self.state, next_state
            )));
        }

        self.state = next_state;
        Ok(())
    }

    /// Records the peer's identification string.
    pub fn set_peer_version(&mut self, version: Version) {
        self.peer_version = Some(version);
    }

    /// Records the peer's KEXINIT.
    pub fn set_peer_kex_init(&mut self, kex_init: KexInit) {
        self.peer_kex_init = Some(kex_init);
    }

    /// Installs negotiated encryption parameters.
    pub fn set_encryption_params(&mut self, params: EncryptionParams) {
        self.encryption_params = Some(params);
    }

    /// Records bytes moved, for rekey tracking.
    pub fn add_bytes(&mut self, bytes: u64) {
        self.bytes_transferred = self.bytes_transferred.saturating_add(bytes);
    }

    /// Returns whether a rekey should be triggered.
    pub fn needs_rekey(&self, current_time: u64) -> bool {
        if !matches!(self.state, State::Encrypted) {
            return false;
        }

        self.bytes_transferred >= self.config.rekey_bytes_limit
            || current_time >= self.last_kex_time + self.config.rekey_time_limit
    }

    /// Resets rekey counters after a completed key exchange.
    pub fn reset_rekey_tracking(&mut self, current_time: u64) {
        self.bytes_transferred = 0;
        self.last_kex_time = current_time;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encrypted_state() -> TransportState {
        let mut state = TransportState::new(TransportConfig::default());
        state.transition(State::KexInit).unwrap();
        state.transition(State::KeyExchange).unwrap();
        state.transition(State::NewKeys).unwrap();
        state.transition(State::Encrypted).unwrap();
        state
    }

    #[test]
    fn test_transport_config_new() {
        let config = TransportConfig::new(true);
        assert!(config.is_client);
        assert_eq!(config.rekey_bytes_limit, 1 << 32);
        assert_eq!(config.rekey_time_limit, 3600);
    }

    #[test]
    fn test_transport_state_new() {
        let state = TransportState::new(TransportConfig::default());
        assert!(matches!(state.current(), State::VersionExchange));
        assert!(!state.is_encrypted());
        assert!(state.session_id().is_none());
    }

    #[test]
    fn test_state_transition_valid() {
        let state = encrypted_state();
        assert!(matches!(state.current(), State::Encrypted));
    }

    #[test]
    fn test_state_transition_rekey() {
        let mut state = encrypted_state();
        assert!(state.transition(State::KexInit).is_ok());
        assert!(matches!(state.current(), State::KexInit));
    }

    #[test]
    fn test_state_transition_invalid() {
        let mut state = TransportState::new(TransportConfig::default());
        match state.transition(State::Encrypted) {
            Err(TetherError::Protocol(msg)) => {
                assert!(msg.contains("Invalid state transition"));
            }
            other => panic!("Expected Protocol error, got {:?}", other),
        }
    }

    #[test]
    fn test_session_id_is_immutable() {
        let mut state = TransportState::new(TransportConfig::default());
        state.set_session_id(b"first-hash");
        state.set_session_id(b"rekey-hash");
        assert_eq!(state.session_id(), Some(&b"first-hash"[..]));
    }

    #[test]
    fn test_needs_rekey_bytes() {
        let mut state = encrypted_state();
        state.reset_rekey_tracking(0);

        state.add_bytes(1 << 31);
        assert!(!state.needs_rekey(10));

        state.add_bytes(1 << 31);
        assert!(state.needs_rekey(10));
    }

    #[test]
    fn test_needs_rekey_time() {
        let mut state = encrypted_state();
        state.reset_rekey_tracking(1000);

        assert!(!state.needs_rekey(2000));
        assert!(state.needs_rekey(1000 + 3600));
    }

    #[test]
    fn test_no_rekey_before_encrypted() {
        let state = TransportState::new(TransportConfig::default());
        assert!(!state.needs_rekey(u64::MAX / 2));
    }

    #[test]
    fn test_reset_rekey_tracking() {
        let mut state = TransportState::new(TransportConfig::default());
        state.add_bytes(12345);
        state.reset_rekey_tracking(1000);
        assert_eq!(state.bytes_transferred, 0);
        assert_eq!(state.last_kex_time, 1000);
    }
}
