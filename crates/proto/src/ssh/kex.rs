//! SSH key exchange messages and negotiation (RFC 4253 Section 7).
//!
//! Covers SSH_MSG_KEXINIT, SSH_MSG_NEWKEYS, and the first-match algorithm
//! negotiation rule: walk the client's preference list and take the first
//! name the server also supports.
//!
//! # Key Exchange Flow
//!
//! 1. Both sides send SSH_MSG_KEXINIT
//! 2. Algorithm negotiation (client's first match wins)
//! 3. Key exchange (curve25519 or DH group14, see [`crate::ssh::kex_dh`])
//! 4. Both sides send SSH_MSG_NEWKEYS and swap keys atomically
//!
//! # Example
//!
//! ```rust
//! use tether_proto::ssh::kex::{KexInit, NewKeys};
//!
//! let kexinit = KexInit::new_default();
//! assert!(kexinit.kex_algorithms().contains(&"curve25519-sha256".to_string()));
//!
//! let newkeys = NewKeys::new();
//! assert_eq!(newkeys.to_bytes(), vec![21]);
//! ```

use crate::ssh::message::MessageType;
use crate::ssh::wire;
use bytes::{BufMut, BytesMut};
use rand::RngCore;
use tether_platform::{TetherError, TetherResult};

/// Immutable algorithm preference lists for one side of a transport.
///
/// Constructed once at transport creation; the KEXINIT message is built
/// from it with a fresh cookie each time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlgorithmSuite {
    /// Key exchange algorithms, most preferred first.
    pub kex: Vec<String>,
    /// Server host key algorithms.
    pub host_key: Vec<String>,
    /// Encryption algorithms (both directions).
    pub encryption: Vec<String>,
    /// MAC algorithms for non-AEAD ciphers (both directions).
    pub mac: Vec<String>,
    /// Compression algorithms.
    pub compression: Vec<String>,
}

impl Default for AlgorithmSuite {
    fn default() -> Self {
        Self {
            kex: vec![
                "curve25519-sha256".to_string(),
                "curve25519-sha256@libssh.org".to_string(),
                "diffie-hellman-group14-sha256".to_string(),
            ],
            host_key: vec![
                "ssh-ed25519-cert-v01@openssh.com".to_string(),
                "ssh-ed25519".to_string(),
                "ecdsa-sha2-nistp256".to_string(),
                "rsa-sha2-512".to_string(),
                "rsa-sha2-256".to_string(),
            ],
            encryption: vec![
                "chacha20-poly1305@openssh.com".to_string(),
                "aes256-gcm@openssh.com".to_string(),
                "aes128-gcm@openssh.com".to_string(),
                "aes256-ctr".to_string(),
                "aes128-ctr".to_string(),
            ],
            mac: vec!["hmac-sha2-256".to_string(), "hmac-sha2-512".to_string()],
            compression: vec!["none".to_string()],
        }
    }
}

/// SSH_MSG_KEXINIT message (RFC 4253 Section 7.1).
///
/// Carries the sender's algorithm preference lists plus a random cookie.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KexInit {
    /// Random cookie (16 bytes)
    cookie: [u8; 16],
    kex_algorithms: Vec<String>,
    server_host_key_algorithms: Vec<String>,
    encryption_algorithms_client_to_server: Vec<String>,
    encryption_algorithms_server_to_client: Vec<String>,
    mac_algorithms_client_to_server: Vec<String>,
    mac_algorithms_server_to_client: Vec<String>,
    compression_algorithms_client_to_server: Vec<String>,
    compression_algorithms_server_to_client: Vec<String>,
    languages_client_to_server: Vec<String>,
    languages_server_to_client: Vec<String>,
    first_kex_packet_follows: bool,
}

impl KexInit {
    /// Creates a KEXINIT message from an algorithm suite with a fresh cookie.
    pub fn from_suite(suite: &AlgorithmSuite) -> Self {
        let mut cookie = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut cookie);

        Self {
            cookie,
            kex_algorithms: suite.kex.clone(),
            server_host_key_algorithms: suite.host_key.clone(),
            encryption_algorithms_client_to_server: suite.encryption.clone(),
            encryption_algorithms_server_to_client: suite.encryption.clone(),
            mac_algorithms_client_to_server: suite.mac.clone(),
            mac_algorithms_server_to_client: suite.mac.clone(),
            compression_algorithms_client_to_server: suite.compression.clone(),
            compression_algorithms_server_to_client: suite.compression.clone(),
            languages_client_to_server: vec![],
            languages_server_to_client: vec![],
            first_kex_packet_follows: false,
        }
    }

    /// Creates a KEXINIT message with the default algorithm suite.
    pub fn new_default() -> Self {
        Self::from_suite(&AlgorithmSuite::default())
    }

    /// Returns the cookie.
    pub fn cookie(&self) -> &[u8; 16] {
        &self.cookie
    }

    /// Returns the key exchange algorithms.
    pub fn kex_algorithms(&self) -> &[String] {
        &self.kex_algorithms
    }

    /// Returns the server host key algorithms.
    pub fn server_host_key_algorithms(&self) -> &[String] {
        &self.server_host_key_algorithms
    }

    /// Returns the encryption algorithms (client to server).
    pub fn encryption_algorithms_client_to_server(&self) -> &[String] {
        &self.encryption_algorithms_client_to_server
    }

    /// Returns the encryption algorithms (server to client).
    pub fn encryption_algorithms_server_to_client(&self) -> &[String] {
        &self.encryption_algorithms_server_to_client
    }

    /// Returns the MAC algorithms (client to server).
    pub fn mac_algorithms_client_to_server(&self) -> &[String] {
        &self.mac_algorithms_client_to_server
    }

    /// Returns the MAC algorithms (server to client).
    pub fn mac_algorithms_server_to_client(&self) -> &[String] {
        &self.mac_algorithms_server_to_client
    }

    /// Returns whether a guessed first KEX packet follows.
    pub fn first_kex_packet_follows(&self) -> bool {
        self.first_kex_packet_follows
    }

    /// Serializes the KEXINIT message (without packet framing).
    ///
    /// Format (RFC 4253 Section 7.1):
    /// ```text
    /// byte         SSH_MSG_KEXINIT (20)
    /// byte[16]     cookie
    /// name-list    kex_algorithms
    /// name-list    server_host_key_algorithms
    /// name-list    encryption_algorithms (c2s, s2c)
    /// name-list    mac_algorithms (c2s, s2c)
    /// name-list    compression_algorithms (c2s, s2c)
    /// name-list    languages (c2s, s2c)
    /// boolean      first_kex_packet_follows
    /// uint32       0 (reserved)
    /// ```
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();

        buf.put_u8(MessageType::KexInit as u8);
        buf.put_slice(&self.cookie);

        wire::put_name_list(&mut buf, &self.kex_algorithms);
        wire::put_name_list(&mut buf, &self.server_host_key_algorithms);
        wire::put_name_list(&mut buf, &self.encryption_algorithms_client_to_server);
        wire::put_name_list(&mut buf, &self.encryption_algorithms_server_to_client);
        wire::put_name_list(&mut buf, &self.mac_algorithms_client_to_server);
        wire::put_name_list(&mut buf, &self.mac_algorithms_server_to_client);
        wire::put_name_list(&mut buf, &self.compression_algorithms_client_to_server);
        wire::put_name_list(&mut buf, &self.compression_algorithms_server_to_client);
        wire::put_name_list(&mut buf, &self.languages_client_to_server);
        wire::put_name_list(&mut buf, &self.languages_server_to_client);

        wire::put_bool(&mut buf, self.first_kex_packet_follows);
        buf.put_u32(0);

        buf.to_vec()
    }

    /// Parses a KEXINIT message.
    ///
    /// # Errors
    ///
    /// Returns [`TetherError::Protocol`] on a wrong message number or any
    /// truncated name-list.
    pub fn from_bytes(data: &[u8]) -> TetherResult<Self> {
        if data.is_empty() {
            return Err(TetherError::Protocol("KEXINIT message is empty".to_string()));
        }

        if data[0] != MessageType::KexInit as u8 {
            return Err(TetherError::Protocol(format!(
                "Invalid message type: expected 20 (SSH_MSG_KEXINIT), got {}",
                data[0]
            )));
        }

        if data.len() < 17 {
            return Err(TetherError::Protocol(format!(
                "KEXINIT message too short: {} bytes (minimum 17)",
                data.len()
            )));
        }

        let mut cookie = [0u8; 16];
        cookie.copy_from_slice(&data[1..17]);

        let mut offset = 17;

        let kex_algorithms = wire::read_name_list(data, &mut offset)?;
        let server_host_key_algorithms = wire::read_name_list(data, &mut offset)?;
        let encryption_algorithms_client_to_server = wire::read_name_list(data, &mut offset)?;
        let encryption_algorithms_server_to_client = wire::read_name_list(data, &mut offset)?;
        let mac_algorithms_client_to_server = wire::read_name_list(data, &mut offset)?;
        let mac_algorithms_server_to_client = wire::read_name_list(data, &mut offset)?;
        let compression_algorithms_client_to_server = wire::read_name_list(data, &mut offset)?;
        let compression_algorithms_server_to_client = wire::read_name_list(data, &mut offset)?;
        let languages_client_to_server = wire::read_name_list(data, &mut offset)?;
        let languages_server_to_client = wire::read_name_list(data, &mut offset)?;

        let first_kex_packet_follows = wire::read_bool(data, &mut offset)?;
        let _reserved = wire::read_u32(data, &mut offset)?;

        Ok(Self {
            cookie,
            kex_algorithms,
            server_host_key_algorithms,
            encryption_algorithms_client_to_server,
            encryption_algorithms_server_to_client,
            mac_algorithms_client_to_server,
            mac_algorithms_server_to_client,
            compression_algorithms_client_to_server,
            compression_algorithms_server_to_client,
            languages_client_to_server,
            languages_server_to_client,
            first_kex_packet_follows,
        })
    }
}

/// SSH_MSG_NEWKEYS message (RFC 4253 Section 7.3).
///
/// A single byte; after it is exchanged both directions switch to the
/// newly derived keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NewKeys;

impl NewKeys {
    /// Creates a NEWKEYS message.
    pub fn new() -> Self {
        Self
    }

    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        vec![MessageType::NewKeys as u8]
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> TetherResult<Self> {
        if data.len() != 1 || data[0] != MessageType::NewKeys as u8 {
            return Err(TetherError::Protocol(
                "Invalid SSH_MSG_NEWKEYS message".to_string(),
            ));
        }
        Ok(Self)
    }
}

impl Default for NewKeys {
    fn default() -> Self {
        Self::new()
    }
}

/// Negotiates one algorithm from two preference lists.
///
/// Walks the client's list in order and returns the first name present in
/// the server's list (RFC 4253 Section 7.1).
///
/// # Errors
///
/// Returns [`TetherError::Protocol`] if the lists do not intersect; this is
/// fatal to the transport.
pub fn negotiate_algorithm(client: &[String], server: &[String]) -> TetherResult<String> {
    client
        .iter()
        .find(|alg| server.contains(alg))
        .cloned()
        .ok_or_else(|| {
            TetherError::Protocol(format!(
                "No common algorithm: client offers [{}], server offers [{}]",
                client.join(","),
                server.join(",")
            ))
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kexinit_default_algorithms() {
        let kexinit = KexInit::new_default();
        assert!(kexinit
            .kex_algorithms()
            .contains(&"curve25519-sha256".to_string()));
        assert!(kexinit
            .kex_algorithms()
            .contains(&"diffie-hellman-group14-sha256".to_string()));
        assert_eq!(kexinit.cookie().len(), 16);
    }

    #[test]
    fn test_kexinit_round_trip() {
        let original = KexInit::new_default();
        let parsed = KexInit::from_bytes(&original.to_bytes()).unwrap();

        assert_eq!(parsed, original);
    }

    #[test]
    fn test_kexinit_wrong_type() {
        let mut bytes = KexInit::new_default().to_bytes();
        bytes[0] = 99;
        assert!(KexInit::from_bytes(&bytes).is_err());
    }

    #[test]
    fn test_kexinit_truncated() {
        let bytes = KexInit::new_default().to_bytes();
        assert!(KexInit::from_bytes(&bytes[..40]).is_err());
    }

    #[test]
    fn test_newkeys_round_trip() {
        let newkeys = NewKeys::new();
        let bytes = newkeys.to_bytes();
        assert_eq!(bytes, vec![21]);
        assert!(NewKeys::from_bytes(&bytes).is_ok());
        assert!(NewKeys::from_bytes(&[22]).is_err());
    }

    #[test]
    fn test_negotiate_first_client_preference_wins() {
        let client = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let server = vec!["c".to_string(), "b".to_string()];

        // "b" comes before "c" on the client side, so "b" wins even though
        // the server prefers "c".
        assert_eq!(negotiate_algorithm(&client, &server).unwrap(), "b");
    }

    #[test]
    fn test_negotiate_no_intersection() {
        let client = vec!["a".to_string()];
        let server = vec!["b".to_string()];
        assert!(matches!(
            negotiate_algorithm(&client, &server),
            Err(TetherError::Protocol(_))
        ));
    }
}
