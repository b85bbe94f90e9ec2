//! Public keys, signatures, and signers (RFC 4253 Section 6.6).
//!
//! A [`PublicKey`] is a value with three capabilities: marshal to SSH wire
//! form, report its algorithm name, and verify a signature. The supported
//! variants are RSA, ECDSA over the three NIST prime curves, Ed25519, and
//! OpenSSH certificates (which wrap a subject key and add identity; see
//! [`crate::ssh::cert`]).
//!
//! A [`Signer`] is the private-key counterpart: it exposes its public key
//! and signs bytes. Certificate signers wrap a base signer together with a
//! certificate.
//!
//! # Example
//!
//! ```rust
//! use tether_proto::ssh::pubkey::{Ed25519Keypair, Signer};
//!
//! let keypair = Ed25519Keypair::generate();
//! let signature = keypair.sign(b"exchange hash").unwrap();
//! keypair.public_key().verify(b"exchange hash", &signature).unwrap();
//! ```

use crate::ssh::cert::Certificate;
use crate::ssh::wire;
use bytes::{BufMut, BytesMut};
use num_bigint::BigUint;
use tether_platform::{TetherError, TetherResult};

use base64::Engine;
use ed25519_dalek as ed25519;
use sha2::{Digest, Sha256, Sha512};
use signature::{Signer as _, Verifier as _};

/// An SSH signature: an algorithm name plus the algorithm-specific blob,
/// serialized on the wire as two SSH strings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    /// Signature format name (e.g. "ssh-ed25519", "rsa-sha2-256").
    pub format: String,
    /// Algorithm-specific signature bytes.
    pub blob: Vec<u8>,
}

impl Signature {
    /// Serializes to the SSH signature wire form.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        wire::put_string(&mut buf, &self.format);
        wire::put_bytes(&mut buf, &self.blob);
        buf.to_vec()
    }

    /// Parses a signature from its wire form.
    pub fn from_bytes(data: &[u8]) -> TetherResult<Self> {
        let mut offset = 0;
        let sig = Self::read(data, &mut offset)?;
        if offset != data.len() {
            return Err(TetherError::Format(format!(
                "Trailing bytes after signature: {}",
                data.len() - offset
            )));
        }
        Ok(sig)
    }

    /// Reads a signature at a cursor.
    pub fn read(data: &[u8], offset: &mut usize) -> TetherResult<Self> {
        let format = wire::read_string(data, offset)?;
        let blob = wire::read_bytes(data, offset)?;
        Ok(Self { format, blob })
    }
}

/// ECDSA curve identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EcdsaCurve {
    /// NIST P-256 (secp256r1), paired with SHA-256
    NistP256,
    /// NIST P-384 (secp384r1), paired with SHA-384
    NistP384,
    /// NIST P-521 (secp521r1), paired with SHA-512
    NistP521,
}

impl EcdsaCurve {
    /// Returns the curve identifier used in SSH names ("nistp256", ...).
    pub fn name(&self) -> &'static str {
        match self {
            EcdsaCurve::NistP256 => "nistp256",
            EcdsaCurve::NistP384 => "nistp384",
            EcdsaCurve::NistP521 => "nistp521",
        }
    }

    /// Returns the full SSH algorithm name.
    pub fn algorithm(&self) -> &'static str {
        match self {
            EcdsaCurve::NistP256 => "ecdsa-sha2-nistp256",
            EcdsaCurve::NistP384 => "ecdsa-sha2-nistp384",
            EcdsaCurve::NistP521 => "ecdsa-sha2-nistp521",
        }
    }

    /// Returns the scalar field size in bytes.
    pub fn field_size(&self) -> usize {
        match self {
            EcdsaCurve::NistP256 => 32,
            EcdsaCurve::NistP384 => 48,
            EcdsaCurve::NistP521 => 66,
        }
    }

    /// Parses a curve from its SSH identifier.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "nistp256" => Some(EcdsaCurve::NistP256),
            "nistp384" => Some(EcdsaCurve::NistP384),
            "nistp521" => Some(EcdsaCurve::NistP521),
            _ => None,
        }
    }
}

/// An RSA public key (`ssh-rsa` wire format, SHA-2 signature variants).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RsaPublicKey {
    /// Public exponent e
    pub e: BigUint,
    /// Modulus n
    pub n: BigUint,
}

/// An ECDSA public key over one of the NIST prime curves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EcdsaPublicKey {
    /// The curve this key lives on
    pub curve: EcdsaCurve,
    /// SEC1-encoded point (uncompressed)
    pub point: Vec<u8>,
}

/// An Ed25519 public key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ed25519PublicKey(pub [u8; 32]);

/// A polymorphic SSH public key.
///
/// Certificates are a distinct variant: they marshal and verify like any
/// other key but additionally expose a subject key, identity and validity
/// (see [`Certificate`]).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublicKey {
    /// RSA key
    Rsa(RsaPublicKey),
    /// ECDSA key (P-256/P-384/P-521)
    Ecdsa(EcdsaPublicKey),
    /// Ed25519 key
    Ed25519(Ed25519PublicKey),
    /// OpenSSH certificate wrapping a subject key
    Certificate(Box<Certificate>),
}

impl PublicKey {
    /// Returns the SSH algorithm name of this key.
    pub fn algorithm(&self) -> String {
        match self {
            PublicKey::Rsa(_) => "ssh-rsa".to_string(),
            PublicKey::Ecdsa(k) => k.curve.algorithm().to_string(),
            PublicKey::Ed25519(_) => "ssh-ed25519".to_string(),
            PublicKey::Certificate(cert) => cert.algorithm(),
        }
    }

    /// Marshals this key to SSH wire form (algorithm name followed by the
    /// key-specific fields).
    pub fn marshal(&self) -> Vec<u8> {
        match self {
            PublicKey::Certificate(cert) => cert.marshal(),
            _ => {
                let mut buf = BytesMut::new();
                wire::put_string(&mut buf, &self.algorithm());
                self.marshal_inline(&mut buf);
                buf.to_vec()
            }
        }
    }

    /// Writes the key-specific fields without the leading algorithm name.
    ///
    /// Certificates embed subject keys in this form.
    pub(crate) fn marshal_inline(&self, buf: &mut BytesMut) {
        match self {
            PublicKey::Rsa(k) => {
                wire::put_mpint(buf, &k.e.to_bytes_be());
                wire::put_mpint(buf, &k.n.to_bytes_be());
            }
            PublicKey::Ecdsa(k) => {
                wire::put_string(buf, k.curve.name());
                wire::put_bytes(buf, &k.point);
            }
            PublicKey::Ed25519(k) => {
                wire::put_bytes(buf, &k.0);
            }
            PublicKey::Certificate(cert) => {
                // A certificate never appears inline inside another blob;
                // fall back to its full wire form.
                buf.put_slice(&cert.marshal());
            }
        }
    }

    /// Parses a public key from SSH wire form.
    ///
    /// # Errors
    ///
    /// Returns [`TetherError::Format`] for unknown algorithms or malformed
    /// key fields.
    pub fn parse(blob: &[u8]) -> TetherResult<Self> {
        let mut offset = 0;
        let algorithm = wire::read_string(blob, &mut offset)?;

        if algorithm.ends_with("-cert-v01@openssh.com") {
            let cert = Certificate::parse(blob)?;
            return Ok(PublicKey::Certificate(Box::new(cert)));
        }

        let key = Self::parse_inline(&algorithm, blob, &mut offset)?;
        if offset != blob.len() {
            return Err(TetherError::Format(format!(
                "Trailing bytes after {} key: {}",
                algorithm,
                blob.len() - offset
            )));
        }
        Ok(key)
    }

    /// Parses the key-specific fields of a non-certificate algorithm at a
    /// cursor.
    pub(crate) fn parse_inline(
        algorithm: &str,
        data: &[u8],
        offset: &mut usize,
    ) -> TetherResult<Self> {
        match algorithm {
            "ssh-rsa" => {
                let e = wire::read_mpint(data, offset)?;
                let n = wire::read_mpint(data, offset)?;
                Ok(PublicKey::Rsa(RsaPublicKey {
                    e: BigUint::from_bytes_be(&e),
                    n: BigUint::from_bytes_be(&n),
                }))
            }
            "ecdsa-sha2-nistp256" | "ecdsa-sha2-nistp384" | "ecdsa-sha2-nistp521" => {
                let curve_name = wire::read_string(data, offset)?;
                let curve = EcdsaCurve::from_name(&curve_name).ok_or_else(|| {
                    TetherError::Format(format!("Unknown ECDSA curve '{}'", curve_name))
                })?;
                if curve.algorithm() != algorithm {
                    return Err(TetherError::Format(format!(
                        "Curve '{}' does not match algorithm '{}'",
                        curve_name, algorithm
                    )));
                }
                let point = wire::read_bytes(data, offset)?;
                Ok(PublicKey::Ecdsa(EcdsaPublicKey { curve, point }))
            }
            "ssh-ed25519" => {
                let bytes = wire::read_bytes(data, offset)?;
                if bytes.len() != 32 {
                    return Err(TetherError::Format(format!(
                        "Ed25519 public key must be 32 bytes, got {}",
                        bytes.len()
                    )));
                }
                let mut key = [0u8; 32];
                key.copy_from_slice(&bytes);
                Ok(PublicKey::Ed25519(Ed25519PublicKey(key)))
            }
            other => Err(TetherError::Format(format!(
                "Unknown key algorithm \"{}\"",
                other
            ))),
        }
    }

    /// Verifies `signature` over `data` with this key.
    ///
    /// Certificates delegate to their subject key.
    ///
    /// # Errors
    ///
    /// Returns [`TetherError::Crypto`] on verification failure and
    /// [`TetherError::Format`] if the signature format does not match the
    /// key.
    pub fn verify(&self, data: &[u8], signature: &Signature) -> TetherResult<()> {
        match self {
            PublicKey::Rsa(key) => key.verify(data, signature),
            PublicKey::Ecdsa(key) => key.verify(data, signature),
            PublicKey::Ed25519(key) => key.verify(data, signature),
            PublicKey::Certificate(cert) => cert.key().verify(data, signature),
        }
    }

    /// Returns the SHA256 fingerprint in the OpenSSH display form.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.marshal());
        let digest = hasher.finalize();
        format!(
            "SHA256:{}",
            base64::engine::general_purpose::STANDARD_NO_PAD.encode(digest)
        )
    }
}

impl RsaPublicKey {
    fn to_crypto_key(&self) -> TetherResult<rsa::RsaPublicKey> {
        let n = rsa::BigUint::from_bytes_be(&self.n.to_bytes_be());
        let e = rsa::BigUint::from_bytes_be(&self.e.to_bytes_be());
        rsa::RsaPublicKey::new(n, e)
            .map_err(|e| TetherError::Format(format!("Invalid RSA public key: {}", e)))
    }

    fn verify(&self, data: &[u8], signature: &Signature) -> TetherResult<()> {
        let key = self.to_crypto_key()?;

        let (scheme, hashed) = match signature.format.as_str() {
            "ssh-rsa" => {
                let digest = sha1::Sha1::digest(data).to_vec();
                (rsa::Pkcs1v15Sign::new::<sha1::Sha1>(), digest)
            }
            "rsa-sha2-256" => {
                let digest = Sha256::digest(data).to_vec();
                (rsa::Pkcs1v15Sign::new::<Sha256>(), digest)
            }
            "rsa-sha2-512" => {
                let digest = Sha512::digest(data).to_vec();
                (rsa::Pkcs1v15Sign::new::<Sha512>(), digest)
            }
            other => {
                return Err(TetherError::Format(format!(
                    "Signature format '{}' does not match ssh-rsa key",
                    other
                )))
            }
        };

        key.verify(scheme, &hashed, &signature.blob)
            .map_err(|_| TetherError::Crypto("RSA signature verification failed".to_string()))
    }
}

impl EcdsaPublicKey {
    fn verify(&self, data: &[u8], signature: &Signature) -> TetherResult<()> {
        if signature.format != self.curve.algorithm() {
            return Err(TetherError::Format(format!(
                "Signature format '{}' does not match {} key",
                signature.format,
                self.curve.algorithm()
            )));
        }

        // The blob holds (mpint r, mpint s); normalize both to the fixed
        // field width the verifier expects.
        let mut offset = 0;
        let r = wire::read_mpint(&signature.blob, &mut offset)?;
        let s = wire::read_mpint(&signature.blob, &mut offset)?;
        let raw = fixed_scalar_pair(&r, &s, self.curve.field_size())?;

        let failed = || TetherError::Crypto("ECDSA signature verification failed".to_string());

        match self.curve {
            EcdsaCurve::NistP256 => {
                let key = p256::ecdsa::VerifyingKey::from_sec1_bytes(&self.point)
                    .map_err(|_| TetherError::Format("Invalid P-256 point".to_string()))?;
                let sig = p256::ecdsa::Signature::from_slice(&raw).map_err(|_| failed())?;
                key.verify(data, &sig).map_err(|_| failed())
            }
            EcdsaCurve::NistP384 => {
                let key = p384::ecdsa::VerifyingKey::from_sec1_bytes(&self.point)
                    .map_err(|_| TetherError::Format("Invalid P-384 point".to_string()))?;
                let sig = p384::ecdsa::Signature::from_slice(&raw).map_err(|_| failed())?;
                key.verify(data, &sig).map_err(|_| failed())
            }
            EcdsaCurve::NistP521 => {
                let key = p521::ecdsa::VerifyingKey::from_sec1_bytes(&self.point)
                    .map_err(|_| TetherError::Format("Invalid P-521 point".to_string()))?;
                let sig = p521::ecdsa::Signature::from_slice(&raw).map_err(|_| failed())?;
                key.verify(data, &sig).map_err(|_| failed())
            }
        }
    }
}

impl Ed25519PublicKey {
    fn verify(&self, data: &[u8], signature: &Signature) -> TetherResult<()> {
        if signature.format != "ssh-ed25519" {
            return Err(TetherError::Format(format!(
                "Signature format '{}' does not match ssh-ed25519 key",
                signature.format
            )));
        }
        if signature.blob.len() != 64 {
            return Err(TetherError::Format(format!(
                "Ed25519 signature must be 64 bytes, got {}",
                signature.blob.len()
            )));
        }

        let key = ed25519::VerifyingKey::from_bytes(&self.0)
            .map_err(|_| TetherError::Format("Invalid Ed25519 public key".to_string()))?;

        let mut sig_bytes = [0u8; 64];
        sig_bytes.copy_from_slice(&signature.blob);
        let sig = ed25519::Signature::from_bytes(&sig_bytes);

        key.verify(data, &sig)
            .map_err(|_| TetherError::Crypto("Ed25519 signature verification failed".to_string()))
    }
}

/// Left-pads (or validates) two scalars to `size` bytes each and
/// concatenates them.
fn fixed_scalar_pair(r: &[u8], s: &[u8], size: usize) -> TetherResult<Vec<u8>> {
    let mut out = vec![0u8; size * 2];
    for (scalar, slot) in [(r, 0), (s, 1)] {
        if scalar.len() > size {
            return Err(TetherError::Format(format!(
                "ECDSA scalar of {} bytes exceeds field size {}",
                scalar.len(),
                size
            )));
        }
        let start = slot * size + (size - scalar.len());
        out[start..(slot + 1) * size].copy_from_slice(scalar);
    }
    Ok(out)
}

/// A signing capability: a private key that exposes its public half and
/// signs byte strings.
pub trait Signer: Send + Sync {
    /// Returns the public key this signer signs for.
    fn public_key(&self) -> PublicKey;

    /// Signs `data` and returns the SSH signature.
    fn sign(&self, data: &[u8]) -> TetherResult<Signature>;
}

/// An Ed25519 keypair.
#[derive(Clone)]
pub struct Ed25519Keypair {
    signing_key: ed25519::SigningKey,
}

impl Ed25519Keypair {
    /// Generates a fresh keypair.
    pub fn generate() -> Self {
        let mut secret = [0u8; 32];
        rand::RngCore::fill_bytes(&mut rand::thread_rng(), &mut secret);
        Self {
            signing_key: ed25519::SigningKey::from_bytes(&secret),
        }
    }

    /// Restores a keypair from the 32-byte secret seed.
    pub fn from_seed(seed: &[u8]) -> TetherResult<Self> {
        if seed.len() != 32 {
            return Err(TetherError::Format(
                "Ed25519 seed must be 32 bytes".to_string(),
            ));
        }
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(seed);
        Ok(Self {
            signing_key: ed25519::SigningKey::from_bytes(&bytes),
        })
    }
}

impl Signer for Ed25519Keypair {
    fn public_key(&self) -> PublicKey {
        PublicKey::Ed25519(Ed25519PublicKey(
            self.signing_key.verifying_key().to_bytes(),
        ))
    }

    fn sign(&self, data: &[u8]) -> TetherResult<Signature> {
        let sig = self.signing_key.sign(data);
        Ok(Signature {
            format: "ssh-ed25519".to_string(),
            blob: sig.to_bytes().to_vec(),
        })
    }
}

impl std::fmt::Debug for Ed25519Keypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ed25519Keypair")
            .field(
                "public_key",
                &hex::encode(self.signing_key.verifying_key().as_bytes()),
            )
            .finish_non_exhaustive()
    }
}

/// An RSA keypair signing with rsa-sha2-256.
pub struct RsaKeypair {
    private: rsa::RsaPrivateKey,
}

impl RsaKeypair {
    /// Generates a fresh keypair of the given modulus size.
    ///
    /// # Errors
    ///
    /// Returns [`TetherError::Crypto`] if key generation fails.
    pub fn generate(bits: usize) -> TetherResult<Self> {
        let private = rsa::RsaPrivateKey::new(&mut rand::thread_rng(), bits)
            .map_err(|e| TetherError::Crypto(format!("RSA key generation failed: {}", e)))?;
        Ok(Self { private })
    }
}

impl Signer for RsaKeypair {
    fn public_key(&self) -> PublicKey {
        use rsa::traits::PublicKeyParts;
        let public = self.private.to_public_key();
        PublicKey::Rsa(RsaPublicKey {
            e: BigUint::from_bytes_be(&public.e().to_bytes_be()),
            n: BigUint::from_bytes_be(&public.n().to_bytes_be()),
        })
    }

    fn sign(&self, data: &[u8]) -> TetherResult<Signature> {
        let digest = Sha256::digest(data);
        let blob = self
            .private
            .sign(rsa::Pkcs1v15Sign::new::<Sha256>(), &digest)
            .map_err(|e| TetherError::Crypto(format!("RSA signing failed: {}", e)))?;
        Ok(Signature {
            format: "rsa-sha2-256".to_string(),
            blob,
        })
    }
}

impl std::fmt::Debug for RsaKeypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        use rsa::traits::PublicKeyParts;
        f.debug_struct("RsaKeypair")
            .field("bits", &(self.private.n().bits()))
            .finish_non_exhaustive()
    }
}

enum EcdsaSigningKey {
    NistP256(p256::ecdsa::SigningKey),
    NistP384(p384::ecdsa::SigningKey),
    NistP521(p521::ecdsa::SigningKey),
}

/// An ECDSA keypair over one of the NIST prime curves.
pub struct EcdsaKeypair {
    curve: EcdsaCurve,
    key: EcdsaSigningKey,
}

impl EcdsaKeypair {
    /// Generates a fresh keypair on the given curve.
    pub fn generate(curve: EcdsaCurve) -> Self {
        let mut rng = rand::thread_rng();
        let key = match curve {
            EcdsaCurve::NistP256 => {
                EcdsaSigningKey::NistP256(p256::ecdsa::SigningKey::random(&mut rng))
            }
            EcdsaCurve::NistP384 => {
                EcdsaSigningKey::NistP384(p384::ecdsa::SigningKey::random(&mut rng))
            }
            EcdsaCurve::NistP521 => {
                EcdsaSigningKey::NistP521(p521::ecdsa::SigningKey::random(&mut rng))
            }
        };
        Self { curve, key }
    }

    /// Returns the curve.
    pub fn curve(&self) -> EcdsaCurve {
        self.curve
    }
}

impl Signer for EcdsaKeypair {
    fn public_key(&self) -> PublicKey {
        let point = match &self.key {
            EcdsaSigningKey::NistP256(k) => k
                .verifying_key()
                .to_encoded_point(false)
                .as_bytes()
                .to_vec(),
            EcdsaSigningKey::NistP384(k) => k
                .verifying_key()
                .to_encoded_point(false)
                .as_bytes()
                .to_vec(),
            EcdsaSigningKey::NistP521(k) => p521::ecdsa::VerifyingKey::from(k)
                .to_encoded_point(false)
                .as_bytes()
                .to_vec(),
        };
        PublicKey::Ecdsa(EcdsaPublicKey {
            curve: self.curve,
            point,
        })
    }

    fn sign(&self, data: &[u8]) -> TetherResult<Signature> {
        // The inner blob is (mpint r, mpint s).
        let (r, s) = match &self.key {
            EcdsaSigningKey::NistP256(k) => {
                let sig: p256::ecdsa::Signature = k.sign(data);
                (sig.r().to_bytes().to_vec(), sig.s().to_bytes().to_vec())
            }
            EcdsaSigningKey::NistP384(k) => {
                let sig: p384::ecdsa::Signature = k.sign(data);
                (sig.r().to_bytes().to_vec(), sig.s().to_bytes().to_vec())
            }
            EcdsaSigningKey::NistP521(k) => {
                let sig: p521::ecdsa::Signature = k.sign(data);
                (sig.r().to_bytes().to_vec(), sig.s().to_bytes().to_vec())
            }
        };

        let mut blob = BytesMut::new();
        wire::put_mpint(&mut blob, &r);
        wire::put_mpint(&mut blob, &s);

        Ok(Signature {
            format: self.curve.algorithm().to_string(),
            blob: blob.to_vec(),
        })
    }
}

impl std::fmt::Debug for EcdsaKeypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EcdsaKeypair")
            .field("curve", &self.curve.name())
            .finish_non_exhaustive()
    }
}
