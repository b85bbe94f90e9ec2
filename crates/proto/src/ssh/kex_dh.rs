//! Diffie-Hellman key exchange methods (RFC 8268, RFC 8731).
//!
//! Implements the two mandatory key exchange methods:
//! - curve25519-sha256 (and the @libssh.org alias)
//! - diffie-hellman-group14-sha256
//!
//! and the RFC 4253 Section 7.2 derivation of the six session keys from the
//! shared secret, exchange hash, and session identifier.

use crate::ssh::wire;
use sha2::{Digest, Sha256};
use tether_platform::{TetherError, TetherResult};

use ring::agreement::{agree_ephemeral, EphemeralPrivateKey, UnparsedPublicKey, X25519};
use ring::rand::SystemRandom;
use zeroize::Zeroize;

/// Diffie-Hellman Group 14 parameters (RFC 3526): the 2048-bit MODP group.
mod dh_group14 {
    use num_bigint::BigUint;
    use once_cell::sync::Lazy;

    /// Group 14 prime (2048-bit)
    pub static P: Lazy<BigUint> = Lazy::new(|| {
        BigUint::from_bytes_be(
            &hex::decode(
                "FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD1\
             29024E088A67CC74020BBEA63B139B22514A08798E3404DD\
             EF9519B3CD3A431B302B0A6DF25F14374FE1356D6D51C245\
             E485B576625E7EC6F44C42E9A637ED6B0BFF5CB6F406B7ED\
             EE386BFB5A899FA5AE9F24117C4B1FE649286651ECE45B3D\
             C2007CB8A163BF0598DA48361C55D39A69163FA8FD24CF5F\
             83655D23DCA3AD961C62F356208552BB9ED529077096966D\
             670C354E4ABC9804F1746C08CA18217C32905E462E36CE3B\
             E39E772C180E86039B2783A2EC07A28FB5C55DF06F4C52C9\
             DE2BCBF6955817183995497CEA956AE515D2261898FA0510\
             15728E5A8AACAA68FFFFFFFFFFFFFFFF",
            )
            .expect("Invalid hex"),
        )
    });

    /// Group 14 generator
    pub static G: Lazy<BigUint> = Lazy::new(|| BigUint::from(2u32));
}

/// Diffie-Hellman Group 14 key exchange (diffie-hellman-group14-sha256).
pub struct DhGroup14Exchange {
    /// Private exponent x
    private_key: Vec<u8>,
    /// Public value g^x mod p
    public_key: Vec<u8>,
}

impl DhGroup14Exchange {
    /// Generates a fresh ephemeral key pair.
    ///
    /// # Example
    ///
    /// ```rust
    /// use tether_proto::ssh::kex_dh::DhGroup14Exchange;
    ///
    /// let exchange = DhGroup14Exchange::new();
    /// assert!(!exchange.public_key().is_empty());
    /// ```
    pub fn new() -> Self {
        use num_bigint::{BigUint, RandBigInt};
        use rand::thread_rng;

        let mut rng = thread_rng();

        let p_minus_one = dh_group14::P.clone() - 1u32;
        let x = rng.gen_biguint_range(&BigUint::from(2u32), &p_minus_one);
        let y = dh_group14::G.modpow(&x, &dh_group14::P);

        Self {
            private_key: x.to_bytes_be(),
            public_key: y.to_bytes_be(),
        }
    }

    /// Returns the public value.
    pub fn public_key(&self) -> &[u8] {
        &self.public_key
    }

    /// Computes the shared secret from the peer's public value.
    ///
    /// # Errors
    ///
    /// Returns [`TetherError::Protocol`] if the peer value is outside
    /// (1, p-1).
    pub fn compute_shared_secret(&self, peer_public: &[u8]) -> TetherResult<Vec<u8>> {
        use num_bigint::BigUint;

        let y_peer = BigUint::from_bytes_be(peer_public);

        if y_peer <= BigUint::from(1u32) || y_peer >= *dh_group14::P {
            return Err(TetherError::Protocol(
                "Invalid peer public key: out of range".to_string(),
            ));
        }

        let x = BigUint::from_bytes_be(&self.private_key);
        let k = y_peer.modpow(&x, &dh_group14::P);

        Ok(k.to_bytes_be())
    }
}

impl Default for DhGroup14Exchange {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for DhGroup14Exchange {
    fn drop(&mut self) {
        self.private_key.zeroize();
    }
}

/// Curve25519 key exchange (curve25519-sha256, RFC 8731).
pub struct Curve25519Exchange {
    private_key: EphemeralPrivateKey,
    public_key: [u8; 32],
}

impl Curve25519Exchange {
    /// Generates a fresh ephemeral key pair.
    ///
    /// # Errors
    ///
    /// Returns [`TetherError::Crypto`] if the system RNG fails.
    pub fn new() -> TetherResult<Self> {
        let rng = SystemRandom::new();
        let private_key = EphemeralPrivateKey::generate(&X25519, &rng)
            .map_err(|_| TetherError::Crypto("Failed to generate Curve25519 key".to_string()))?;

        let public_key = private_key
            .compute_public_key()
            .map_err(|_| TetherError::Crypto("Failed to compute Curve25519 public key".to_string()))?;

        let mut public_key_bytes = [0u8; 32];
        public_key_bytes.copy_from_slice(public_key.as_ref());

        Ok(Self {
            private_key,
            public_key: public_key_bytes,
        })
    }

    /// Returns the 32-byte public key.
    pub fn public_key(&self) -> &[u8; 32] {
        &self.public_key
    }

    /// Computes the shared secret, consuming the ephemeral private key.
    ///
    /// # Errors
    ///
    /// Returns [`TetherError::Crypto`] if the agreement fails (e.g. a
    /// low-order peer point).
    pub fn compute_shared_secret(self, peer_public: &[u8; 32]) -> TetherResult<Vec<u8>> {
        let peer_public_key = UnparsedPublicKey::new(&X25519, peer_public);

        agree_ephemeral(self.private_key, &peer_public_key, |key_material| {
            key_material.to_vec()
        })
        .map_err(|_| TetherError::Crypto("Curve25519 key agreement failed".to_string()))
    }
}

/// Computes the exchange hash H (RFC 4253 Section 8, RFC 8731 Section 3.3).
///
/// ```text
/// H = HASH(V_C || V_S || I_C || I_S || K_S || e-field || f-field || K)
/// ```
///
/// The identification strings travel without their CR LF; `client_public`
/// and `server_public` must already be encoded as the method requires
/// (SSH string for ECDH, mpint for classic DH); the shared secret is
/// encoded as an mpint here.
#[allow(clippy::too_many_arguments)]
pub fn exchange_hash(
    client_version: &str,
    server_version: &str,
    client_kexinit: &[u8],
    server_kexinit: &[u8],
    host_key_blob: &[u8],
    client_public: &[u8],
    server_public: &[u8],
    shared_secret: &[u8],
) -> Vec<u8> {
    let mut hasher = Sha256::new();

    let hash_string = |h: &mut Sha256, s: &[u8]| {
        h.update((s.len() as u32).to_be_bytes());
        h.update(s);
    };

    hash_string(
        &mut hasher,
        client_version.trim_end_matches("\r\n").as_bytes(),
    );
    hash_string(
        &mut hasher,
        server_version.trim_end_matches("\r\n").as_bytes(),
    );
    hash_string(&mut hasher, client_kexinit);
    hash_string(&mut hasher, server_kexinit);
    hash_string(&mut hasher, host_key_blob);
    // Already encoded per-method; hashed verbatim.
    hasher.update(client_public);
    hasher.update(server_public);
    hasher.update(wire::encode_mpint(shared_secret));

    hasher.finalize().to_vec()
}

/// Encodes an ECDH public value as its exchange-hash field (SSH string).
pub fn string_field(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + data.len());
    out.extend_from_slice(&(data.len() as u32).to_be_bytes());
    out.extend_from_slice(data);
    out
}

/// Derives one SSH session key (RFC 4253 Section 7.2).
///
/// ```text
/// Initial IV client to server:     HASH(K || H || "A" || session_id)
/// Initial IV server to client:     HASH(K || H || "B" || session_id)
/// Encryption key client to server: HASH(K || H || "C" || session_id)
/// Encryption key server to client: HASH(K || H || "D" || session_id)
/// Integrity key client to server:  HASH(K || H || "E" || session_id)
/// Integrity key server to client:  HASH(K || H || "F" || session_id)
/// ```
///
/// `K` is the shared secret encoded as an mpint, `H` the exchange hash,
/// and `session_id` the exchange hash of the first key exchange. If the
/// digest output is shorter than `key_length`, the key is extended with
/// `HASH(K || H || key_so_far)` blocks.
pub fn derive_key(
    shared_secret: &[u8],
    exchange_hash: &[u8],
    session_id: &[u8],
    key_type: u8,
    key_length: usize,
) -> Vec<u8> {
    let mut key = Vec::new();
    let mut hasher = Sha256::new();

    let k_mpint = wire::encode_mpint(shared_secret);

    hasher.update(&k_mpint);
    hasher.update(exchange_hash);
    hasher.update([key_type]);
    hasher.update(session_id);
    let block = hasher.finalize_reset();
    key.extend_from_slice(&block);

    while key.len() < key_length {
        hasher.update(&k_mpint);
        hasher.update(exchange_hash);
        hasher.update(&key);
        let block = hasher.finalize_reset();
        key.extend_from_slice(&block);
    }

    key.truncate(key_length);
    key
}
