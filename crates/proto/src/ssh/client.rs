//! SSH client.
//!
//! [`SshClient::connect`] dials, exchanges identification strings, runs
//! the key exchange (validating the host key through the configured
//! [`CertChecker`]), and leaves the transport encrypted. Authentication
//! then runs over the encrypted transport; once it succeeds the client
//! hands the stream halves to the [`Dispatcher`] and channels can be
//! opened.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use tether_proto::ssh::client::{SshClient, SshClientConfig};
//! use tether_proto::ssh::connection::ChannelType;
//! use tether_proto::ssh::pubkey::Ed25519Keypair;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut client = SshClient::connect("127.0.0.1:22", SshClientConfig::default()).await?;
//! let keypair = Ed25519Keypair::generate();
//! client.authenticate_publickey("deploy", &keypair).await?;
//!
//! let channel = client
//!     .open_channel(ChannelType::CustomInprocStream, Duration::from_secs(5))
//!     .await?;
//! channel.write(b"ping")?;
//! # Ok(())
//! # }
//! ```

use crate::ssh::auth::{
    construct_signature_data, AuthFailure, AuthMethod, AuthRequest, AuthSuccess, InfoRequest,
    InfoResponse,
};
use crate::ssh::cert::CertChecker;
use crate::ssh::channel::Channel;
use crate::ssh::connection::{ChannelOpen, ChannelType};
use crate::ssh::crypto::{CipherAlgorithm, DecryptionKey, EncryptionKey};
use crate::ssh::dispatcher::Dispatcher;
use crate::ssh::kex::{negotiate_algorithm, KexInit, NewKeys};
use crate::ssh::kex_dh::{
    derive_key, exchange_hash, string_field, Curve25519Exchange, DhGroup14Exchange,
};
use crate::ssh::message::MessageType;
use crate::ssh::pubkey::{PublicKey, Signature, Signer};
use crate::ssh::session::{create_keepalive_message, KeepaliveTask};
use crate::ssh::stream::{PacketReader, PacketWriter};
use crate::ssh::transport::{State, TransportConfig, TransportState};
use crate::ssh::version::Version;
use crate::ssh::wire;
use std::sync::Arc;
use std::time::Duration;
use tether_platform::{TetherError, TetherResult};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::debug;

/// SSH client configuration.
pub struct SshClientConfig {
    /// TCP connect timeout.
    pub connect_timeout: Duration,
    /// Software name for the identification string.
    pub software: String,
    /// Host key policy. The default checker trusts nothing; install the
    /// oracles (or a fallback) before connecting to a real peer.
    pub checker: CertChecker,
    /// Interval for SSH_MSG_IGNORE keepalives; `None` disables them.
    pub keepalive_interval: Option<Duration>,
}

impl Default for SshClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            software: format!("Tether_{}", env!("CARGO_PKG_VERSION")),
            checker: CertChecker::default(),
            keepalive_interval: None,
        }
    }
}

impl std::fmt::Debug for SshClientConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshClientConfig")
            .field("connect_timeout", &self.connect_timeout)
            .field("software", &self.software)
            .field("checker", &self.checker)
            .field("keepalive_interval", &self.keepalive_interval)
            .finish()
    }
}

/// An SSH client connection.
pub struct SshClient {
    /// Stream halves; taken by the dispatcher after authentication.
    reader: Option<PacketReader<OwnedReadHalf>>,
    writer: Option<PacketWriter<OwnedWriteHalf>>,
    dispatcher: Option<Dispatcher>,
    inbound_opens: Option<mpsc::UnboundedReceiver<ChannelOpen>>,
    keepalive: Option<KeepaliveTask>,

    transport: TransportState,
    config: SshClientConfig,
    server_addr: String,
    remote_addr: String,
    username: Option<String>,
    server_host_key: Option<PublicKey>,

    client_version: String,
    server_version: String,
    client_kexinit_payload: Vec<u8>,
    server_kexinit_payload: Vec<u8>,
}

impl SshClient {
    /// Connects, exchanges versions, and completes the key exchange.
    ///
    /// The returned client is encrypted but not yet authenticated.
    pub async fn connect(addr: &str, config: SshClientConfig) -> TetherResult<Self> {
        let stream = tokio::time::timeout(config.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| TetherError::Timeout(format!("Connecting to {}", addr)))?
            .map_err(TetherError::Io)?;

        let remote_addr = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_default();
        let (read_half, write_half) = stream.into_split();

        let mut client = Self {
            reader: Some(PacketReader::new(read_half)),
            writer: Some(PacketWriter::new(write_half)),
            dispatcher: None,
            inbound_opens: None,
            keepalive: None,
            transport: TransportState::new(TransportConfig::new(true)),
            config,
            server_addr: addr.to_string(),
            remote_addr,
            username: None,
            server_host_key: None,
            client_version: String::new(),
            server_version: String::new(),
            client_kexinit_payload: Vec::new(),
            server_kexinit_payload: Vec::new(),
        };

        client.version_exchange().await?;
        client.key_exchange().await?;

        Ok(client)
    }

    fn reader_mut(&mut self) -> TetherResult<&mut PacketReader<OwnedReadHalf>> {
        self.reader
            .as_mut()
            .ok_or_else(|| TetherError::Closed("handshake already completed".to_string()))
    }

    fn writer_mut(&mut self) -> TetherResult<&mut PacketWriter<OwnedWriteHalf>> {
        self.writer
            .as_mut()
            .ok_or_else(|| TetherError::Closed("handshake already completed".to_string()))
    }

    async fn send_payload(&mut self, payload: &[u8]) -> TetherResult<()> {
        self.writer_mut()?.write_payload(payload).await
    }

    async fn recv_payload(&mut self) -> TetherResult<Vec<u8>> {
        self.reader_mut()?.read_payload().await
    }

    async fn version_exchange(&mut self) -> TetherResult<()> {
        let our_version = Version::new(&self.config.software, None);
        self.client_version = our_version.to_string();
        self.writer_mut()?
            .write_raw(&our_version.to_wire_format())
            .await?;

        let line = self.reader_mut()?.read_identification_line().await?;
        let server_version = Version::parse(&line)?;
        self.server_version = server_version.to_string();

        self.transport.set_peer_version(server_version);
        self.transport.transition(State::KexInit)?;
        Ok(())
    }

    async fn key_exchange(&mut self) -> TetherResult<()> {
        let suite = self.transport.config().algorithms.clone();
        let our_kexinit = KexInit::from_suite(&suite);
        self.client_kexinit_payload = our_kexinit.to_bytes();
        let payload = self.client_kexinit_payload.clone();
        self.send_payload(&payload).await?;

        let server_payload = self.recv_payload().await?;
        let server_kexinit = KexInit::from_bytes(&server_payload)?;
        self.server_kexinit_payload = server_payload;
        self.transport.set_peer_kex_init(server_kexinit.clone());

        let kex_alg =
            negotiate_algorithm(our_kexinit.kex_algorithms(), server_kexinit.kex_algorithms())?;
        let cipher_alg = negotiate_algorithm(
            our_kexinit.encryption_algorithms_client_to_server(),
            server_kexinit.encryption_algorithms_client_to_server(),
        )?;
        let cipher = CipherAlgorithm::from_name(&cipher_alg).ok_or_else(|| {
            TetherError::Protocol(format!("Negotiated unknown cipher '{}'", cipher_alg))
        })?;
        if !cipher.is_aead() {
            return Err(TetherError::Protocol(format!(
                "Cipher '{}' requires the CTR pipeline",
                cipher_alg
            )));
        }

        self.transport.transition(State::KeyExchange)?;

        let (shared_secret, exchange_hash) = match kex_alg.as_str() {
            "curve25519-sha256" | "curve25519-sha256@libssh.org" => {
                self.run_curve25519().await?
            }
            "diffie-hellman-group14-sha256" => self.run_group14().await?,
            other => {
                return Err(TetherError::Protocol(format!(
                    "Unsupported KEX algorithm: {}",
                    other
                )))
            }
        };

        self.transport.set_session_id(&exchange_hash);
        let session_id = self
            .transport
            .session_id()
            .ok_or_else(|| TetherError::Protocol("No session identifier".to_string()))?
            .to_vec();

        // NEWKEYS exchange, then swap keys in.
        self.send_payload(&NewKeys::new().to_bytes()).await?;
        let newkeys = self.recv_payload().await?;
        NewKeys::from_bytes(&newkeys)?;

        self.transport.transition(State::NewKeys)?;

        let enc_material = derive_key(&shared_secret, &exchange_hash, &session_id, b'C', cipher.key_size());
        let dec_material = derive_key(&shared_secret, &exchange_hash, &session_id, b'D', cipher.key_size());

        self.writer_mut()?
            .install_key(EncryptionKey::new(cipher, &enc_material)?);
        self.reader_mut()?
            .install_key(DecryptionKey::new(cipher, &dec_material)?);

        self.transport.transition(State::Encrypted)?;
        debug!("Key exchange complete ({})", kex_alg);
        Ok(())
    }

    async fn run_curve25519(&mut self) -> TetherResult<(Vec<u8>, Vec<u8>)> {
        let ours = Curve25519Exchange::new()?;
        let our_public = ours.public_key().to_vec();

        let mut init = vec![MessageType::KexdhInit as u8];
        init.extend_from_slice(&string_field(&our_public));
        self.send_payload(&init).await?;

        let reply = self.recv_payload().await?;
        let (host_key_blob, server_public, signature_blob) = parse_kexdh_reply(&reply)?;

        if server_public.len() != 32 {
            return Err(TetherError::Protocol(format!(
                "Curve25519 public key must be 32 bytes, got {}",
                server_public.len()
            )));
        }
        let mut peer = [0u8; 32];
        peer.copy_from_slice(&server_public);
        let shared_secret = ours.compute_shared_secret(&peer)?;

        let hash = exchange_hash(
            &self.client_version,
            &self.server_version,
            &self.client_kexinit_payload,
            &self.server_kexinit_payload,
            &host_key_blob,
            &string_field(&our_public),
            &string_field(&server_public),
            &shared_secret,
        );

        self.verify_host_key(&host_key_blob, &hash, &signature_blob)?;
        Ok((shared_secret, hash))
    }

    async fn run_group14(&mut self) -> TetherResult<(Vec<u8>, Vec<u8>)> {
        let ours = DhGroup14Exchange::new();

        let mut init = vec![MessageType::KexdhInit as u8];
        init.extend_from_slice(&wire::encode_mpint(ours.public_key()));
        self.send_payload(&init).await?;

        let reply = self.recv_payload().await?;
        let (host_key_blob, server_public, signature_blob) = parse_kexdh_reply(&reply)?;
        let shared_secret = ours.compute_shared_secret(&server_public)?;

        let hash = exchange_hash(
            &self.client_version,
            &self.server_version,
            &self.client_kexinit_payload,
            &self.server_kexinit_payload,
            &host_key_blob,
            &wire::encode_mpint(ours.public_key()),
            &wire::encode_mpint(&server_public),
            &shared_secret,
        );

        self.verify_host_key(&host_key_blob, &hash, &signature_blob)?;
        Ok((shared_secret, hash))
    }

    /// Verifies the KEX signature and asks the policy checker whether the
    /// host key (plain or certificate) is trusted for the dialed address.
    fn verify_host_key(
        &mut self,
        host_key_blob: &[u8],
        hash: &[u8],
        signature_blob: &[u8],
    ) -> TetherResult<()> {
        let host_key = PublicKey::parse(host_key_blob)?;
        let signature = Signature::from_bytes(signature_blob)?;
        host_key.verify(hash, &signature)?;

        self.config
            .checker
            .check_host_key(&self.server_addr, &self.remote_addr, &host_key)?;

        self.server_host_key = Some(host_key);
        Ok(())
    }

    async fn request_userauth_service(&mut self) -> TetherResult<()> {
        let mut request = vec![MessageType::ServiceRequest as u8];
        let mut buf = bytes::BytesMut::new();
        wire::put_string(&mut buf, "ssh-userauth");
        request.extend_from_slice(&buf);
        self.send_payload(&request).await?;

        let reply = self.recv_payload().await?;
        if reply.is_empty() || reply[0] != MessageType::ServiceAccept as u8 {
            return Err(TetherError::Protocol(
                "Expected SSH_MSG_SERVICE_ACCEPT".to_string(),
            ));
        }
        Ok(())
    }

    /// Reads the next auth-relevant payload, skipping banners.
    async fn recv_auth_reply(&mut self) -> TetherResult<Vec<u8>> {
        loop {
            let payload = self.recv_payload().await?;
            if payload.first() == Some(&(MessageType::UserauthBanner as u8)) {
                continue;
            }
            return Ok(payload);
        }
    }

    /// Authenticates with the "none" method.
    ///
    /// # Errors
    ///
    /// Returns [`TetherError::Auth`] with the continuable methods if the
    /// server requires real authentication.
    pub async fn authenticate_none(&mut self, username: &str) -> TetherResult<()> {
        self.request_userauth_service().await?;
        let request = AuthRequest::new(username, "ssh-connection", AuthMethod::None);
        self.send_payload(&request.to_bytes()).await?;
        self.finish_auth(username).await
    }

    /// Authenticates with a public key or certificate signer.
    ///
    /// The signature covers the session identifier, so it cannot be
    /// replayed on another transport.
    pub async fn authenticate_publickey(
        &mut self,
        username: &str,
        signer: &dyn Signer,
    ) -> TetherResult<()> {
        self.request_userauth_service().await?;

        let public_key = signer.public_key();
        let algorithm = public_key.algorithm();
        let key_blob = public_key.marshal();

        let session_id = self
            .transport
            .session_id()
            .ok_or_else(|| TetherError::Protocol("No session identifier yet".to_string()))?
            .to_vec();

        let signed_data = construct_signature_data(
            &session_id,
            username,
            "ssh-connection",
            &algorithm,
            &key_blob,
        );
        let signature = signer.sign(&signed_data)?;

        let request = AuthRequest::new(
            username,
            "ssh-connection",
            AuthMethod::PublicKey {
                algorithm,
                public_key: key_blob,
                signature: Some(signature.to_bytes()),
            },
        );
        self.send_payload(&request.to_bytes()).await?;
        self.finish_auth(username).await
    }

    /// Authenticates with keyboard-interactive, answering prompts through
    /// `responder` (e.g. a one-time-password generator).
    pub async fn authenticate_keyboard_interactive<F>(
        &mut self,
        username: &str,
        mut responder: F,
    ) -> TetherResult<()>
    where
        F: FnMut(&InfoRequest) -> Vec<String>,
    {
        self.request_userauth_service().await?;

        let request = AuthRequest::new(
            username,
            "ssh-connection",
            AuthMethod::KeyboardInteractive {
                submethods: String::new(),
            },
        );
        self.send_payload(&request.to_bytes()).await?;

        loop {
            let reply = self.recv_auth_reply().await?;
            match reply.first().copied() {
                Some(b) if b == MessageType::UserauthSuccess as u8 => {
                    self.username = Some(username.to_string());
                    return Ok(());
                }
                Some(b) if b == MessageType::UserauthFailure as u8 => {
                    let failure = AuthFailure::from_bytes(&reply)?;
                    return Err(TetherError::Auth(format!(
                        "Authentication refused; methods that can continue: {}",
                        failure.methods_can_continue().join(",")
                    )));
                }
                Some(b) if b == MessageType::UserauthPkOk as u8 => {
                    // INFO_REQUEST in this method's context.
                    let info = InfoRequest::from_bytes(&reply)?;
                    let responses = responder(&info);
                    if responses.len() != info.prompts.len() {
                        return Err(TetherError::Auth(format!(
                            "Responder answered {} of {} prompts",
                            responses.len(),
                            info.prompts.len()
                        )));
                    }
                    self.send_payload(&InfoResponse::new(responses).to_bytes())
                        .await?;
                }
                _ => {
                    return Err(TetherError::Protocol(
                        "Unexpected message during keyboard-interactive auth".to_string(),
                    ))
                }
            }
        }
    }

    async fn finish_auth(&mut self, username: &str) -> TetherResult<()> {
        let reply = self.recv_auth_reply().await?;
        match reply.first().copied() {
            Some(b) if b == MessageType::UserauthSuccess as u8 => {
                AuthSuccess::from_bytes(&reply)?;
                self.username = Some(username.to_string());
                Ok(())
            }
            Some(b) if b == MessageType::UserauthFailure as u8 => {
                let failure = AuthFailure::from_bytes(&reply)?;
                Err(TetherError::Auth(format!(
                    "Authentication refused; methods that can continue: {}",
                    failure.methods_can_continue().join(",")
                )))
            }
            _ => Err(TetherError::Protocol(
                "Unexpected message during authentication".to_string(),
            )),
        }
    }

    /// Moves the transport into connection-protocol mode: the stream
    /// halves are handed to the dispatcher tasks. Called implicitly by
    /// [`SshClient::open_channel`].
    pub fn start_dispatch(&mut self) -> TetherResult<()> {
        if self.dispatcher.is_some() {
            return Ok(());
        }
        if !self.is_authenticated() {
            return Err(TetherError::Auth(
                "Authenticate before opening channels".to_string(),
            ));
        }

        let reader = self
            .reader
            .take()
            .ok_or_else(|| TetherError::Closed("transport already consumed".to_string()))?;
        let writer = self
            .writer
            .take()
            .ok_or_else(|| TetherError::Closed("transport already consumed".to_string()))?;

        let (opens_tx, opens_rx) = mpsc::unbounded_channel();
        self.inbound_opens = Some(opens_rx);
        let dispatcher = Dispatcher::start(reader, writer, opens_tx);

        if let Some(interval) = self.config.keepalive_interval {
            let outbound = dispatcher.outbound();
            let mut task = KeepaliveTask::new(interval);
            task.start(move || {
                let outbound = outbound.clone();
                async move {
                    outbound
                        .send(create_keepalive_message(16))
                        .map_err(|_| TetherError::Closed("transport writer gone".to_string()))
                }
            });
            self.keepalive = Some(task);
        }

        self.dispatcher = Some(dispatcher);
        Ok(())
    }

    /// Opens a logical channel, bounded by `deadline`.
    pub async fn open_channel(
        &mut self,
        channel_type: ChannelType,
        deadline: Duration,
    ) -> TetherResult<Arc<Channel>> {
        self.start_dispatch()?;
        let dispatcher = self
            .dispatcher
            .as_ref()
            .ok_or_else(|| TetherError::Closed("transport is down".to_string()))?;
        dispatcher.open_channel(channel_type, deadline).await
    }

    /// Returns the number of live channels.
    pub fn channel_count(&self) -> usize {
        self.dispatcher.as_ref().map_or(0, |d| d.channel_count())
    }

    /// Takes the queue of server-initiated channel opens. Available once
    /// dispatch has started; once the receiver is dropped, such opens are
    /// refused.
    pub fn take_inbound_opens(&mut self) -> Option<mpsc::UnboundedReceiver<ChannelOpen>> {
        self.inbound_opens.take()
    }

    /// Sends an SSH_MSG_IGNORE keepalive.
    pub async fn send_keepalive(&mut self) -> TetherResult<()> {
        let payload = create_keepalive_message(16);
        match &self.dispatcher {
            Some(dispatcher) => dispatcher
                .outbound()
                .send(payload)
                .map_err(|_| TetherError::Closed("transport writer gone".to_string())),
            None => self.send_payload(&payload).await,
        }
    }

    /// Returns the authenticated username, if any.
    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    /// Returns the dialed address.
    pub fn server_address(&self) -> &str {
        &self.server_addr
    }

    /// Returns whether authentication completed.
    pub fn is_authenticated(&self) -> bool {
        self.username.is_some()
    }

    /// Returns the server's host key as presented during key exchange.
    pub fn server_host_key(&self) -> Option<&PublicKey> {
        self.server_host_key.as_ref()
    }

    /// Returns the transport state machine.
    pub fn transport(&self) -> &TransportState {
        &self.transport
    }

    /// Tears down the connection: all channels fail with `Closed`.
    pub fn disconnect(&mut self) {
        if let Some(mut keepalive) = self.keepalive.take() {
            keepalive.stop();
        }
        if let Some(mut dispatcher) = self.dispatcher.take() {
            dispatcher.shutdown();
        }
        self.reader = None;
        self.writer = None;
    }
}

impl Drop for SshClient {
    fn drop(&mut self) {
        self.disconnect();
    }
}

/// Parses SSH_MSG_KEXDH_REPLY into (host key blob, server public value,
/// signature blob).
fn parse_kexdh_reply(payload: &[u8]) -> TetherResult<(Vec<u8>, Vec<u8>, Vec<u8>)> {
    if payload.is_empty() || payload[0] != MessageType::KexdhReply as u8 {
        return Err(TetherError::Protocol(
            "Expected SSH_MSG_KEXDH_REPLY".to_string(),
        ));
    }
    let mut offset = 1;
    let host_key_blob = wire::read_bytes(payload, &mut offset)?;
    let server_public = wire::read_bytes(payload, &mut offset)?;
    let signature_blob = wire::read_bytes(payload, &mut offset)?;
    Ok((host_key_blob, server_public, signature_blob))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = SshClientConfig::default();
        assert!(config.software.starts_with("Tether_"));
        assert!(config.keepalive_interval.is_none());
    }

    #[test]
    fn test_parse_kexdh_reply() {
        let mut payload = vec![MessageType::KexdhReply as u8];
        let mut buf = bytes::BytesMut::new();
        wire::put_bytes(&mut buf, b"hostkey");
        wire::put_bytes(&mut buf, b"serverpub");
        wire::put_bytes(&mut buf, b"signature");
        payload.extend_from_slice(&buf);

        let (host_key, public, sig) = parse_kexdh_reply(&payload).unwrap();
        assert_eq!(host_key, b"hostkey");
        assert_eq!(public, b"serverpub");
        assert_eq!(sig, b"signature");
    }

    #[test]
    fn test_parse_kexdh_reply_wrong_type() {
        assert!(parse_kexdh_reply(&[MessageType::KexdhInit as u8]).is_err());
    }
}
