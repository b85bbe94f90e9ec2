//! SSH (Secure Shell) protocol implementation.
//!
//! RFC 4251-4254 transport, authentication and connection protocols, the
//! OpenSSH certificate format, and an auto-reconnecting multiplexed
//! channel layer on top.
//!
//! # Architecture
//!
//! 1. **Packet layer** ([`packet`], [`stream`]) - binary framing and
//!    encrypted packet I/O (RFC 4253 Section 6)
//! 2. **Transport layer** ([`transport`], [`kex`], [`kex_dh`], [`crypto`])
//!    - key exchange, encryption, rekey thresholds (RFC 4253)
//! 3. **Authentication** ([`auth`], [`pubkey`], [`cert`],
//!    [`authorized_keys`]) - publickey (raw or certificate),
//!    keyboard-interactive (RFC 4252, RFC 4256, PROTOCOL.certkeys)
//! 4. **Connection layer** ([`connection`], [`channel`], [`buffer`],
//!    [`dispatcher`]) - multiplexed channels with per-channel windows and
//!    idle timers (RFC 4254)
//! 5. **Sessions** ([`client`], [`server`], [`session`]) - the client and
//!    server drivers plus the reconnect supervisor

pub mod auth;
pub mod authorized_keys;
pub mod buffer;
pub mod cert;
pub mod channel;
pub mod client;
pub mod connection;
pub mod crypto;
pub mod dispatcher;
pub mod kex;
pub mod kex_dh;
pub mod message;
pub mod packet;
pub mod pubkey;
pub mod server;
pub mod session;
pub mod stream;
pub mod transport;
pub mod version;
pub(crate) mod wire;

// Re-export main types
pub use auth::{
    constant_time_compare, construct_signature_data, AuthBanner, AuthFailure, AuthMethod,
    AuthPkOk, AuthRequest, AuthSuccess, InfoPrompt, InfoRequest, InfoResponse,
};
pub use authorized_keys::{marshal_authorized_key, parse_authorized_key, AuthorizedKey};
pub use buffer::{Buffer, IdleTimer};
pub use cert::{CertChecker, CertSigner, CertType, Certificate, CERT_TIME_INFINITY};
pub use channel::{Channel, ChannelState};
pub use client::{SshClient, SshClientConfig};
pub use connection::{
    ChannelClose, ChannelData, ChannelEof, ChannelExtendedData, ChannelFailure, ChannelOpen,
    ChannelOpenConfirmation, ChannelOpenFailure, ChannelOpenFailureReason, ChannelRequest,
    ChannelRequestType, ChannelSuccess, ChannelType, ChannelWindowAdjust, ExtendedDataType,
    MAX_PACKET_SIZE, MAX_WINDOW_SIZE,
};
pub use crypto::{CipherAlgorithm, DecryptionKey, EncryptionKey, MacAlgorithm, MacKey};
pub use dispatcher::Dispatcher;
pub use kex::{negotiate_algorithm, AlgorithmSuite, KexInit, NewKeys};
pub use kex_dh::{derive_key, Curve25519Exchange, DhGroup14Exchange};
pub use message::MessageType;
pub use packet::Packet;
pub use pubkey::{
    EcdsaCurve, EcdsaKeypair, EcdsaPublicKey, Ed25519Keypair, Ed25519PublicKey, PublicKey,
    RsaKeypair, RsaPublicKey, Signature, Signer,
};
pub use server::{KeyboardInteractiveAuth, SshServer, SshServerConfig, SshSession};
pub use session::{Endpoint, Supervisor, SupervisorConfig};
pub use stream::{PacketReader, PacketWriter};
pub use transport::{EncryptionParams, State, TransportConfig, TransportState};
pub use version::Version;
