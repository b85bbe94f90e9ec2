//! OpenSSH certificates (PROTOCOL.certkeys).
//!
//! A certificate binds a subject public key to an identity: a key id, a
//! principal list, a validity window, critical options the verifier must
//! understand, and advisory extensions. The whole structure is signed by a
//! certificate authority whose key travels inside the certificate.
//!
//! Certificates are themselves public keys (they marshal, name an
//! algorithm, and verify signatures by delegating to the subject key), and
//! they wrap one; both capabilities are exposed here without an
//! inheritance chain.
//!
//! Wire layout, taking `ssh-rsa-cert-v01@openssh.com` as the example:
//!
//! ```text
//! string  "ssh-rsa-cert-v01@openssh.com"
//! string  nonce
//! mpint   e                 (subject key fields, inlined)
//! mpint   n
//! uint64  serial
//! uint32  type              (1 = user, 2 = host)
//! string  key id
//! string  valid principals  (packed strings)
//! uint64  valid after
//! uint64  valid before
//! string  critical options  (packed name/data tuples, sorted by name)
//! string  extensions        (same shape, sorted by name)
//! string  reserved
//! string  signature key
//! string  signature
//! ```
//!
//! Round-trip contract: parsing a blob and re-marshalling it reproduces the
//! input byte for byte, including tuple order.

use crate::ssh::pubkey::{PublicKey, Signature, Signer};
use crate::ssh::wire;
use bytes::{BufMut, BytesMut};
use rand::RngCore;
use std::collections::BTreeMap;
use tether_platform::{TetherError, TetherResult};

/// `valid_before` value meaning "never expires" (2^64 - 1).
pub const CERT_TIME_INFINITY: u64 = u64::MAX;

/// Certificate algorithm name suffix.
const CERT_ALGO_SUFFIX: &str = "-cert-v01@openssh.com";

/// Certificate type: what the subject key is certified as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum CertType {
    /// Certifies a user key, presented during user authentication.
    User = 1,
    /// Certifies a host key, presented during key exchange.
    Host = 2,
}

impl CertType {
    /// Converts from the wire value.
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            1 => Some(CertType::User),
            2 => Some(CertType::Host),
            _ => None,
        }
    }
}

/// An OpenSSH certificate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Certificate {
    /// CA-chosen random bytes, fresh per certificate.
    pub nonce: Vec<u8>,
    /// The subject public key (never itself a certificate).
    pub key: PublicKey,
    /// Issuer-assigned serial number.
    pub serial: u64,
    /// User or host certificate.
    pub cert_type: CertType,
    /// Free-form identifier chosen by the issuer.
    pub key_id: String,
    /// Login names (user) or hostnames (host) this certificate is valid
    /// for. Empty means valid for any principal.
    pub valid_principals: Vec<String>,
    /// Start of the validity window (seconds since the Unix epoch).
    pub valid_after: u64,
    /// End of the validity window, exclusive. [`CERT_TIME_INFINITY`]
    /// disables the upper bound.
    pub valid_before: u64,
    /// Options the verifier must understand; an unknown name fails
    /// authentication. Marshalled sorted by name.
    pub critical_options: BTreeMap<String, String>,
    /// Advisory extensions; unknown names are ignored.
    pub extensions: BTreeMap<String, String>,
    /// Reserved field, kept verbatim for round-trips.
    pub reserved: Vec<u8>,
    /// The certificate authority's public key.
    pub signature_key: Option<PublicKey>,
    /// Signature by `signature_key` over everything above.
    pub signature: Option<Signature>,
}

impl Certificate {
    /// Creates an unsigned certificate around a subject key.
    ///
    /// Validity defaults to always (`valid_after = 0`,
    /// `valid_before = CERT_TIME_INFINITY`).
    pub fn new(key: PublicKey, cert_type: CertType) -> Self {
        Self {
            nonce: Vec::new(),
            key,
            serial: 0,
            cert_type,
            key_id: String::new(),
            valid_principals: Vec::new(),
            valid_after: 0,
            valid_before: CERT_TIME_INFINITY,
            critical_options: BTreeMap::new(),
            extensions: BTreeMap::new(),
            reserved: Vec::new(),
            signature_key: None,
            signature: None,
        }
    }

    /// Returns the certificate algorithm name, derived from the subject
    /// key (e.g. `ssh-ed25519-cert-v01@openssh.com`).
    pub fn algorithm(&self) -> String {
        format!("{}{}", self.key.algorithm(), CERT_ALGO_SUFFIX)
    }

    /// Returns the subject public key.
    pub fn key(&self) -> &PublicKey {
        &self.key
    }

    /// Returns whether `t` falls inside the validity window
    /// (`valid_after <= t < valid_before`).
    pub fn valid_at(&self, t: u64) -> bool {
        t >= self.valid_after && (self.valid_before == CERT_TIME_INFINITY || t < self.valid_before)
    }

    /// Marshals the certificate to its full wire form.
    pub fn marshal(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        self.marshal_prefix(&mut buf);
        match &self.signature {
            Some(sig) => wire::put_bytes(&mut buf, &sig.to_bytes()),
            None => buf.put_u32(0),
        }
        buf.to_vec()
    }

    /// Returns the canonical encoding of every field up to (but not
    /// including) the signature: the bytes the CA signs.
    pub fn bytes_for_signing(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        self.marshal_prefix(&mut buf);
        buf.to_vec()
    }

    fn marshal_prefix(&self, buf: &mut BytesMut) {
        wire::put_string(buf, &self.algorithm());
        wire::put_bytes(buf, &self.nonce);
        self.key.marshal_inline(buf);
        buf.put_u64(self.serial);
        buf.put_u32(self.cert_type as u32);
        wire::put_string(buf, &self.key_id);

        let mut principals = BytesMut::new();
        for p in &self.valid_principals {
            wire::put_string(&mut principals, p);
        }
        wire::put_bytes(buf, &principals);

        buf.put_u64(self.valid_after);
        buf.put_u64(self.valid_before);

        wire::put_bytes(buf, &marshal_tuples(&self.critical_options));
        wire::put_bytes(buf, &marshal_tuples(&self.extensions));
        wire::put_bytes(buf, &self.reserved);

        match &self.signature_key {
            Some(key) => wire::put_bytes(buf, &key.marshal()),
            None => buf.put_u32(0),
        }
    }

    /// Parses a certificate from its full wire form.
    ///
    /// # Errors
    ///
    /// Returns [`TetherError::Format`] for an unknown algorithm, a type
    /// outside {1, 2}, or any truncated field.
    pub fn parse(blob: &[u8]) -> TetherResult<Self> {
        let mut offset = 0;
        let algorithm = wire::read_string(blob, &mut offset)?;

        let base_algo = algorithm.strip_suffix(CERT_ALGO_SUFFIX).ok_or_else(|| {
            TetherError::Format(format!("Unknown certificate algorithm \"{}\"", algorithm))
        })?;

        let nonce = wire::read_bytes(blob, &mut offset)?;
        let key = PublicKey::parse_inline(base_algo, blob, &mut offset)?;
        let serial = wire::read_u64(blob, &mut offset)?;

        let type_value = wire::read_u32(blob, &mut offset)?;
        let cert_type = CertType::from_u32(type_value).ok_or_else(|| {
            TetherError::Format(format!("Invalid certificate type {}", type_value))
        })?;

        let key_id = wire::read_string(blob, &mut offset)?;

        let principal_bytes = wire::read_bytes(blob, &mut offset)?;
        let mut valid_principals = Vec::new();
        let mut p_offset = 0;
        while p_offset < principal_bytes.len() {
            valid_principals.push(wire::read_string(&principal_bytes, &mut p_offset)?);
        }

        let valid_after = wire::read_u64(blob, &mut offset)?;
        let valid_before = wire::read_u64(blob, &mut offset)?;

        let critical_options = parse_tuples(&wire::read_bytes(blob, &mut offset)?)?;
        let extensions = parse_tuples(&wire::read_bytes(blob, &mut offset)?)?;
        let reserved = wire::read_bytes(blob, &mut offset)?;

        let sig_key_blob = wire::read_bytes(blob, &mut offset)?;
        let signature_key = if sig_key_blob.is_empty() {
            None
        } else {
            Some(PublicKey::parse(&sig_key_blob)?)
        };

        let sig_blob = wire::read_bytes(blob, &mut offset)?;
        let signature = if sig_blob.is_empty() {
            None
        } else {
            Some(Signature::from_bytes(&sig_blob)?)
        };

        if offset != blob.len() {
            return Err(TetherError::Format(format!(
                "Trailing bytes after certificate: {}",
                blob.len() - offset
            )));
        }

        Ok(Self {
            nonce,
            key,
            serial,
            cert_type,
            key_id,
            valid_principals,
            valid_after,
            valid_before,
            critical_options,
            extensions,
            reserved,
            signature_key,
            signature,
        })
    }

    /// Signs this certificate: draws a fresh 32-byte nonce, records the
    /// signer's public key as the authority key, and signs the canonical
    /// prefix.
    ///
    /// # Errors
    ///
    /// Returns [`TetherError::Format`] if the signer's key is itself a
    /// certificate, or the signer's failure unchanged.
    pub fn sign_cert(&mut self, signer: &dyn Signer) -> TetherResult<()> {
        let signature_key = signer.public_key();
        if matches!(signature_key, PublicKey::Certificate(_)) {
            return Err(TetherError::Format(
                "Certificates cannot be signed with a certificate key".to_string(),
            ));
        }

        let mut nonce = vec![0u8; 32];
        rand::thread_rng().fill_bytes(&mut nonce);
        self.nonce = nonce;
        self.signature_key = Some(signature_key);

        let signature = signer.sign(&self.bytes_for_signing())?;
        self.signature = Some(signature);
        Ok(())
    }

    /// Verifies the certificate signature against the embedded authority
    /// key.
    ///
    /// # Errors
    ///
    /// Returns [`TetherError::Crypto`] on a bad or missing signature.
    pub fn verify_signature(&self) -> TetherResult<()> {
        let key = self
            .signature_key
            .as_ref()
            .ok_or_else(|| TetherError::Crypto("Certificate has no signature key".to_string()))?;
        let signature = self
            .signature
            .as_ref()
            .ok_or_else(|| TetherError::Crypto("Certificate is unsigned".to_string()))?;
        key.verify(&self.bytes_for_signing(), signature)
    }
}

/// Marshals name/value tuples sorted by name.
///
/// An empty value serialises as a zero-length data blob; otherwise the data
/// blob holds the value as a single inner string.
fn marshal_tuples(tuples: &BTreeMap<String, String>) -> Vec<u8> {
    let mut buf = BytesMut::new();
    for (name, value) in tuples {
        wire::put_string(&mut buf, name);
        if value.is_empty() {
            buf.put_u32(0);
        } else {
            let mut inner = BytesMut::new();
            wire::put_string(&mut inner, value);
            wire::put_bytes(&mut buf, &inner);
        }
    }
    buf.to_vec()
}

/// Parses name/value tuples.
fn parse_tuples(data: &[u8]) -> TetherResult<BTreeMap<String, String>> {
    let mut tuples = BTreeMap::new();
    let mut offset = 0;
    while offset < data.len() {
        let name = wire::read_string(data, &mut offset)?;
        let inner = wire::read_bytes(data, &mut offset)?;
        let value = if inner.is_empty() {
            String::new()
        } else {
            let mut inner_offset = 0;
            let value = wire::read_string(&inner, &mut inner_offset)?;
            if inner_offset != inner.len() {
                return Err(TetherError::Format(format!(
                    "Trailing bytes in option \"{}\"",
                    name
                )));
            }
            value
        };
        tuples.insert(name, value);
    }
    Ok(tuples)
}

/// A signer that presents a certificate instead of a bare public key.
///
/// Wraps the certified key's signer; signatures come from the base signer,
/// the public key is the certificate.
pub struct CertSigner {
    certificate: Certificate,
    signer: Box<dyn Signer>,
}

impl CertSigner {
    /// Creates a certificate signer.
    ///
    /// # Errors
    ///
    /// Returns [`TetherError::Format`] if the certificate's subject key
    /// does not match the signer's public key.
    pub fn new(certificate: Certificate, signer: Box<dyn Signer>) -> TetherResult<Self> {
        if certificate.key.marshal() != signer.public_key().marshal() {
            return Err(TetherError::Format(
                "Signer and certificate public key mismatch".to_string(),
            ));
        }
        Ok(Self {
            certificate,
            signer,
        })
    }

    /// Returns the wrapped certificate.
    pub fn certificate(&self) -> &Certificate {
        &self.certificate
    }
}

impl Signer for CertSigner {
    fn public_key(&self) -> PublicKey {
        PublicKey::Certificate(Box::new(self.certificate.clone()))
    }

    fn sign(&self, data: &[u8]) -> TetherResult<Signature> {
        self.signer.sign(data)
    }
}

/// Certificate validation policy.
///
/// The embedder supplies the trust oracles; everything else (validity
/// windows, principals, critical options, signatures) is enforced here.
pub struct CertChecker {
    /// Critical option names this deployment understands. Any name outside
    /// this set fails validation.
    pub supported_critical_options: Vec<String>,

    /// Returns whether the given key is a trusted user certificate
    /// authority.
    pub is_user_authority: Option<Box<dyn Fn(&PublicKey) -> bool + Send + Sync>>,

    /// Returns whether the given key is a trusted host certificate
    /// authority for the dialed address (`host:port`).
    pub is_host_authority: Option<Box<dyn Fn(&PublicKey, &str) -> bool + Send + Sync>>,

    /// Time source, seconds since the Unix epoch. Defaults to the system
    /// clock.
    pub clock: Option<Box<dyn Fn() -> u64 + Send + Sync>>,

    /// Invoked for plain (non-certificate) host keys; arguments are the
    /// dialed address, the remote address, and the key.
    #[allow(clippy::type_complexity)]
    pub host_key_fallback:
        Option<Box<dyn Fn(&str, &str, &PublicKey) -> TetherResult<()> + Send + Sync>>,
}

impl Default for CertChecker {
    fn default() -> Self {
        Self {
            supported_critical_options: vec![
                "force-command".to_string(),
                "source-address".to_string(),
            ],
            is_user_authority: None,
            is_host_authority: None,
            clock: None,
            host_key_fallback: None,
        }
    }
}

impl CertChecker {
    fn now(&self) -> u64 {
        match &self.clock {
            Some(clock) => clock(),
            None => std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0),
        }
    }

    /// Validates a certificate against a requested principal: critical
    /// options, principal membership, validity window, and the authority
    /// signature. Authority trust is checked by the calling context
    /// ([`CertChecker::authenticate_user`] / [`CertChecker::check_host_key`]).
    ///
    /// # Errors
    ///
    /// - [`TetherError::Auth`] for an unknown critical option, a principal
    ///   outside `valid_principals`, or a time outside the window
    /// - [`TetherError::Crypto`] for a bad signature
    pub fn check_cert(&self, principal: &str, cert: &Certificate) -> TetherResult<()> {
        for option in cert.critical_options.keys() {
            if !self
                .supported_critical_options
                .iter()
                .any(|supported| supported == option)
            {
                return Err(TetherError::Auth(format!(
                    "Unsupported critical option \"{}\" in certificate",
                    option
                )));
            }
        }

        if !cert.valid_principals.is_empty()
            && !cert.valid_principals.iter().any(|p| p == principal)
        {
            return Err(TetherError::Auth(format!(
                "Principal \"{}\" not in the set of valid principals for certificate",
                principal
            )));
        }

        let now = self.now();
        if now < cert.valid_after {
            return Err(TetherError::Auth("Certificate is not yet valid".to_string()));
        }
        if cert.valid_before != CERT_TIME_INFINITY && now >= cert.valid_before {
            return Err(TetherError::Auth("Certificate has expired".to_string()));
        }

        cert.verify_signature()
    }

    /// Full user-authentication check: the certificate must be a user
    /// certificate issued by a trusted user authority and pass
    /// [`CertChecker::check_cert`] for the login name.
    pub fn authenticate_user(&self, user: &str, cert: &Certificate) -> TetherResult<()> {
        if cert.cert_type != CertType::User {
            return Err(TetherError::Auth(format!(
                "Certificate has type {:?}, expected User",
                cert.cert_type
            )));
        }

        let authority = cert
            .signature_key
            .as_ref()
            .ok_or_else(|| TetherError::Crypto("Certificate has no signature key".to_string()))?;

        let trusted = match &self.is_user_authority {
            Some(oracle) => oracle(authority),
            None => false,
        };
        if !trusted {
            return Err(TetherError::Policy(
                "Certificate signed by unrecognized user authority".to_string(),
            ));
        }

        self.check_cert(user, cert)
    }

    /// Validates a host key presented for `addr` (the `host:port` the
    /// caller dialed). Certificates must be host certificates issued by an
    /// authority trusted for that address; plain keys go to the fallback.
    pub fn check_host_key(&self, addr: &str, remote: &str, key: &PublicKey) -> TetherResult<()> {
        let cert = match key {
            PublicKey::Certificate(cert) => cert,
            _ => {
                return match &self.host_key_fallback {
                    Some(fallback) => fallback(addr, remote, key),
                    None => Err(TetherError::Policy(format!(
                        "No trust settled for plain host key at {}",
                        addr
                    ))),
                };
            }
        };

        if cert.cert_type != CertType::Host {
            return Err(TetherError::Auth(format!(
                "Certificate has type {:?}, expected Host",
                cert.cert_type
            )));
        }

        let authority = cert
            .signature_key
            .as_ref()
            .ok_or_else(|| TetherError::Crypto("Certificate has no signature key".to_string()))?;

        let trusted = match &self.is_host_authority {
            Some(oracle) => oracle(authority, addr),
            None => false,
        };
        if !trusted {
            return Err(TetherError::Policy(format!(
                "No authorities trusted for host {}",
                addr
            )));
        }

        let hostname = addr.rsplit_once(':').map(|(host, _)| host).unwrap_or(addr);
        self.check_cert(hostname, cert)
    }
}

impl std::fmt::Debug for CertChecker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertChecker")
            .field(
                "supported_critical_options",
                &self.supported_critical_options,
            )
            .field("is_user_authority", &self.is_user_authority.is_some())
            .field("is_host_authority", &self.is_host_authority.is_some())
            .field("clock", &self.clock.is_some())
            .field("host_key_fallback", &self.host_key_fallback.is_some())
            .finish()
    }
}
