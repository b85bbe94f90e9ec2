//! Transport encryption and integrity (RFC 4253 Section 6.3-6.4).
//!
//! Cipher and MAC algorithm tables plus the directional key objects the
//! transport installs after key exchange:
//! - ChaCha20-Poly1305 and AES-GCM as AEAD ciphers (no separate MAC)
//! - AES-CTR with HMAC-SHA2 as the non-AEAD pairing
//!
//! Keys are created from the RFC 4253 Section 7.2 derivation output; each
//! direction keeps its own packet sequence counter for nonces and MACs.

use hmac::{Hmac, Mac};
use ring::aead::{
    Aad, BoundKey, Nonce, NonceSequence, OpeningKey, SealingKey, UnboundKey, AES_128_GCM,
    AES_256_GCM, CHACHA20_POLY1305,
};
use sha2::{Sha256, Sha512};
use tether_platform::{TetherError, TetherResult};
use zeroize::Zeroize;

/// Per-direction nonce counter for AEAD ciphers.
///
/// The 64-bit packet sequence number fills the last 8 nonce bytes.
struct Counter {
    value: u64,
}

impl Counter {
    fn new() -> Self {
        Self { value: 0 }
    }
}

impl NonceSequence for Counter {
    fn advance(&mut self) -> Result<Nonce, ring::error::Unspecified> {
        let mut nonce_bytes = [0u8; 12];
        nonce_bytes[4..12].copy_from_slice(&self.value.to_be_bytes());
        self.value = self.value.wrapping_add(1);
        Nonce::try_assume_unique_for_key(&nonce_bytes)
    }
}

/// Cipher algorithm for SSH packet encryption.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherAlgorithm {
    /// ChaCha20-Poly1305 AEAD cipher
    ChaCha20Poly1305,
    /// AES-128-GCM AEAD cipher
    Aes128Gcm,
    /// AES-256-GCM AEAD cipher
    Aes256Gcm,
    /// AES-128-CTR stream cipher (requires separate MAC)
    Aes128Ctr,
    /// AES-256-CTR stream cipher (requires separate MAC)
    Aes256Ctr,
}

impl CipherAlgorithm {
    /// Returns the algorithm name as negotiated in KEXINIT.
    pub fn name(&self) -> &'static str {
        match self {
            CipherAlgorithm::ChaCha20Poly1305 => "chacha20-poly1305@openssh.com",
            CipherAlgorithm::Aes128Gcm => "aes128-gcm@openssh.com",
            CipherAlgorithm::Aes256Gcm => "aes256-gcm@openssh.com",
            CipherAlgorithm::Aes128Ctr => "aes128-ctr",
            CipherAlgorithm::Aes256Ctr => "aes256-ctr",
        }
    }

    /// Returns the key size in bytes.
    pub fn key_size(&self) -> usize {
        match self {
            CipherAlgorithm::Aes128Gcm | CipherAlgorithm::Aes128Ctr => 16,
            _ => 32,
        }
    }

    /// Returns the IV/nonce size in bytes.
    pub fn iv_size(&self) -> usize {
        match self {
            CipherAlgorithm::Aes128Ctr | CipherAlgorithm::Aes256Ctr => 16,
            _ => 12,
        }
    }

    /// Returns the authentication tag size in bytes (0 for non-AEAD).
    pub fn tag_size(&self) -> usize {
        if self.is_aead() {
            16
        } else {
            0
        }
    }

    /// Returns true if this cipher authenticates its own payload.
    pub fn is_aead(&self) -> bool {
        matches!(
            self,
            CipherAlgorithm::ChaCha20Poly1305
                | CipherAlgorithm::Aes128Gcm
                | CipherAlgorithm::Aes256Gcm
        )
    }

    /// Parses a cipher algorithm from its negotiated name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "chacha20-poly1305@openssh.com" => Some(CipherAlgorithm::ChaCha20Poly1305),
            "aes128-gcm@openssh.com" => Some(CipherAlgorithm::Aes128Gcm),
            "aes256-gcm@openssh.com" => Some(CipherAlgorithm::Aes256Gcm),
            "aes128-ctr" => Some(CipherAlgorithm::Aes128Ctr),
            "aes256-ctr" => Some(CipherAlgorithm::Aes256Ctr),
            _ => None,
        }
    }

    fn aead_algorithm(&self) -> Option<&'static ring::aead::Algorithm> {
        match self {
            CipherAlgorithm::ChaCha20Poly1305 => Some(&CHACHA20_POLY1305),
            CipherAlgorithm::Aes128Gcm => Some(&AES_128_GCM),
            CipherAlgorithm::Aes256Gcm => Some(&AES_256_GCM),
            CipherAlgorithm::Aes128Ctr | CipherAlgorithm::Aes256Ctr => None,
        }
    }
}

fn check_key_material(algorithm: CipherAlgorithm, key_material: &[u8]) -> TetherResult<()> {
    if key_material.len() < algorithm.key_size() {
        return Err(TetherError::Crypto(format!(
            "Insufficient key material for {}: expected {}, got {}",
            algorithm.name(),
            algorithm.key_size(),
            key_material.len()
        )));
    }
    Ok(())
}

/// Sealing key for the outbound direction.
pub struct EncryptionKey {
    algorithm: CipherAlgorithm,
    key: Option<SealingKey<Counter>>,
}

impl std::fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptionKey")
            .field("algorithm", &self.algorithm)
            .field("key", &"<redacted>")
            .finish()
    }
}

impl EncryptionKey {
    /// Creates an encryption key from derived key material.
    ///
    /// # Errors
    ///
    /// Returns [`TetherError::Crypto`] if the material is too short or the
    /// key cannot be constructed.
    pub fn new(algorithm: CipherAlgorithm, key_material: &[u8]) -> TetherResult<Self> {
        check_key_material(algorithm, key_material)?;

        let key = match algorithm.aead_algorithm() {
            Some(aead) => {
                let unbound = UnboundKey::new(aead, &key_material[..algorithm.key_size()])
                    .map_err(|_| {
                        TetherError::Crypto(format!("Failed to create {} key", algorithm.name()))
                    })?;
                Some(SealingKey::new(unbound, Counter::new()))
            }
            // CTR mode pairs with a MacKey and is handled by the caller
            None => None,
        };

        Ok(Self { algorithm, key })
    }

    /// Encrypts data in place, appending the AEAD tag.
    pub fn encrypt(&mut self, data: &mut Vec<u8>) -> TetherResult<()> {
        match self.key {
            Some(ref mut key) => {
                key.seal_in_place_append_tag(Aad::empty(), data)
                    .map_err(|_| TetherError::Crypto("Encryption failed".to_string()))?;
                Ok(())
            }
            None => Err(TetherError::Crypto(
                "CTR mode requires a separate MAC pipeline".to_string(),
            )),
        }
    }

    /// Returns the algorithm.
    pub fn algorithm(&self) -> CipherAlgorithm {
        self.algorithm
    }
}

/// Opening key for the inbound direction.
pub struct DecryptionKey {
    algorithm: CipherAlgorithm,
    key: Option<OpeningKey<Counter>>,
}

impl std::fmt::Debug for DecryptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecryptionKey")
            .field("algorithm", &self.algorithm)
            .field("key", &"<redacted>")
            .finish()
    }
}

impl DecryptionKey {
    /// Creates a decryption key from derived key material.
    pub fn new(algorithm: CipherAlgorithm, key_material: &[u8]) -> TetherResult<Self> {
        check_key_material(algorithm, key_material)?;

        let key = match algorithm.aead_algorithm() {
            Some(aead) => {
                let unbound = UnboundKey::new(aead, &key_material[..algorithm.key_size()])
                    .map_err(|_| {
                        TetherError::Crypto(format!("Failed to create {} key", algorithm.name()))
                    })?;
                Some(OpeningKey::new(unbound, Counter::new()))
            }
            None => None,
        };

        Ok(Self { algorithm, key })
    }

    /// Decrypts data in place and strips the AEAD tag.
    ///
    /// # Errors
    ///
    /// A tag mismatch is a [`TetherError::Crypto`] failure, fatal to the
    /// transport.
    pub fn decrypt(&mut self, data: &mut Vec<u8>) -> TetherResult<()> {
        match self.key {
            Some(ref mut key) => {
                let plaintext_len = {
                    let plaintext = key.open_in_place(Aad::empty(), data).map_err(|_| {
                        TetherError::Crypto(
                            "Decryption failed or authentication tag mismatch".to_string(),
                        )
                    })?;
                    plaintext.len()
                };
                data.truncate(plaintext_len);
                Ok(())
            }
            None => Err(TetherError::Crypto(
                "CTR mode requires a separate MAC pipeline".to_string(),
            )),
        }
    }

    /// Returns the algorithm.
    pub fn algorithm(&self) -> CipherAlgorithm {
        self.algorithm
    }
}

/// MAC algorithm for non-AEAD ciphers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MacAlgorithm {
    /// HMAC-SHA256
    HmacSha256,
    /// HMAC-SHA512
    HmacSha512,
}

impl MacAlgorithm {
    /// Returns the algorithm name as negotiated in KEXINIT.
    pub fn name(&self) -> &'static str {
        match self {
            MacAlgorithm::HmacSha256 => "hmac-sha2-256",
            MacAlgorithm::HmacSha512 => "hmac-sha2-512",
        }
    }

    /// Returns the key size in bytes.
    pub fn key_size(&self) -> usize {
        match self {
            MacAlgorithm::HmacSha256 => 32,
            MacAlgorithm::HmacSha512 => 64,
        }
    }

    /// Returns the MAC output size in bytes.
    pub fn mac_size(&self) -> usize {
        self.key_size()
    }

    /// Parses a MAC algorithm from its negotiated name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "hmac-sha2-256" => Some(MacAlgorithm::HmacSha256),
            "hmac-sha2-512" => Some(MacAlgorithm::HmacSha512),
            _ => None,
        }
    }
}

/// Keyed MAC state for one direction.
///
/// The MAC covers `sequence_number || unencrypted_packet` per RFC 4253
/// Section 6.4; the sequence advances on every compute.
pub struct MacKey {
    algorithm: MacAlgorithm,
    key: Vec<u8>,
    sequence: u32,
}

impl std::fmt::Debug for MacKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MacKey")
            .field("algorithm", &self.algorithm)
            .field("key", &"<redacted>")
            .field("sequence", &self.sequence)
            .finish()
    }
}

impl MacKey {
    /// Creates a MAC key from derived key material.
    pub fn new(algorithm: MacAlgorithm, key_material: &[u8]) -> TetherResult<Self> {
        if key_material.len() < algorithm.key_size() {
            return Err(TetherError::Crypto(format!(
                "Insufficient key material for MAC: expected {}, got {}",
                algorithm.key_size(),
                key_material.len()
            )));
        }

        Ok(Self {
            algorithm,
            key: key_material[..algorithm.key_size()].to_vec(),
            sequence: 0,
        })
    }

    /// Computes the MAC over a packet and advances the sequence number.
    pub fn compute(&mut self, packet_data: &[u8]) -> Vec<u8> {
        let mut data = Vec::with_capacity(4 + packet_data.len());
        data.extend_from_slice(&self.sequence.to_be_bytes());
        data.extend_from_slice(packet_data);

        let mac = match self.algorithm {
            MacAlgorithm::HmacSha256 => {
                let mut mac =
                    Hmac::<Sha256>::new_from_slice(&self.key).expect("HMAC key size is valid");
                mac.update(&data);
                mac.finalize().into_bytes().to_vec()
            }
            MacAlgorithm::HmacSha512 => {
                let mut mac =
                    Hmac::<Sha512>::new_from_slice(&self.key).expect("HMAC key size is valid");
                mac.update(&data);
                mac.finalize().into_bytes().to_vec()
            }
        };

        self.sequence = self.sequence.wrapping_add(1);
        mac
    }

    /// Verifies a received MAC in constant time.
    ///
    /// # Errors
    ///
    /// Returns [`TetherError::Crypto`] on mismatch; fatal to the transport.
    pub fn verify(&mut self, packet_data: &[u8], received_mac: &[u8]) -> TetherResult<()> {
        let computed_mac = self.compute(packet_data);

        if computed_mac.len() != received_mac.len() {
            return Err(TetherError::Crypto("MAC length mismatch".to_string()));
        }

        use subtle::ConstantTimeEq;
        if computed_mac.ct_eq(received_mac).into() {
            Ok(())
        } else {
            Err(TetherError::Crypto("MAC verification failed".to_string()))
        }
    }

    /// Returns the algorithm.
    pub fn algorithm(&self) -> MacAlgorithm {
        self.algorithm
    }
}

impl Drop for MacKey {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}
