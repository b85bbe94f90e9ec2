//! SSH server.
//!
//! [`SshServer`] listens for connections; each [`SshServer::accept`] runs
//! the version exchange, signs the key exchange with the host [`Signer`]
//! (a plain key or a [`crate::ssh::cert::CertSigner`] presenting a host
//! certificate), authenticates the user, and hands back an [`SshSession`]
//! whose channels are served through the dispatcher.
//!
//! User authentication policy is pluggable: certificates go through the
//! configured [`CertChecker`], raw public keys through the
//! `public_key_auth` callback, and keyboard-interactive responses through
//! the `keyboard_interactive` handler.

use crate::ssh::auth::{
    construct_signature_data, AuthFailure, AuthMethod, AuthPkOk, AuthRequest, AuthSuccess,
    InfoRequest, InfoResponse,
};
use crate::ssh::cert::CertChecker;
use crate::ssh::channel::{Channel, ChannelState};
use crate::ssh::connection::{
    ChannelOpen, ChannelOpenConfirmation, DEFAULT_MAX_PACKET_SIZE, DEFAULT_WINDOW_SIZE,
};
use crate::ssh::crypto::{CipherAlgorithm, DecryptionKey, EncryptionKey};
use crate::ssh::dispatcher::Dispatcher;
use crate::ssh::kex::{negotiate_algorithm, KexInit, NewKeys};
use crate::ssh::kex_dh::{
    derive_key, exchange_hash, string_field, Curve25519Exchange, DhGroup14Exchange,
};
use crate::ssh::message::MessageType;
use crate::ssh::pubkey::{PublicKey, Signature, Signer};
use crate::ssh::stream::{PacketReader, PacketWriter};
use crate::ssh::version::Version;
use crate::ssh::wire;
use std::sync::Arc;
use tether_platform::{TetherError, TetherResult};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Upper bound on authentication attempts per connection.
const MAX_AUTH_ATTEMPTS: usize = 10;

/// Keyboard-interactive policy: one prompt, one verdict.
pub struct KeyboardInteractiveAuth {
    /// Prompt text sent to the client (e.g. "Verification code: ").
    pub prompt: String,
    /// Returns whether the response authenticates the user.
    pub verify: Box<dyn Fn(&str, &str) -> bool + Send + Sync>,
}

/// SSH server configuration.
pub struct SshServerConfig {
    /// Software name for the identification string.
    pub software: String,
    /// Accept the "none" method (test setups only).
    pub no_client_auth: bool,
    /// Certificate policy for user certificates.
    pub checker: CertChecker,
    /// Approves raw (non-certificate) public keys for a user.
    pub public_key_auth: Option<Box<dyn Fn(&str, &PublicKey) -> bool + Send + Sync>>,
    /// Keyboard-interactive policy; `None` disables the method.
    pub keyboard_interactive: Option<KeyboardInteractiveAuth>,
}

impl Default for SshServerConfig {
    fn default() -> Self {
        Self {
            software: format!("Tether_{}", env!("CARGO_PKG_VERSION")),
            no_client_auth: false,
            checker: CertChecker::default(),
            public_key_auth: None,
            keyboard_interactive: None,
        }
    }
}

impl std::fmt::Debug for SshServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshServerConfig")
            .field("software", &self.software)
            .field("no_client_auth", &self.no_client_auth)
            .field("public_key_auth", &self.public_key_auth.is_some())
            .field(
                "keyboard_interactive",
                &self.keyboard_interactive.is_some(),
            )
            .finish()
    }
}

/// A listening SSH server.
pub struct SshServer {
    listener: TcpListener,
    host_signer: Arc<dyn Signer>,
    config: Arc<SshServerConfig>,
}

impl SshServer {
    /// Binds to `addr` with the given host signer.
    pub async fn bind(
        addr: &str,
        host_signer: Arc<dyn Signer>,
        config: SshServerConfig,
    ) -> TetherResult<Self> {
        let listener = TcpListener::bind(addr).await.map_err(TetherError::Io)?;
        Ok(Self {
            listener,
            host_signer,
            config: Arc::new(config),
        })
    }

    /// Returns the bound local address.
    pub fn local_addr(&self) -> TetherResult<std::net::SocketAddr> {
        self.listener.local_addr().map_err(TetherError::Io)
    }

    /// Accepts one connection and drives it through key exchange and
    /// authentication.
    pub async fn accept(&self) -> TetherResult<SshSession> {
        let (stream, peer) = self.listener.accept().await.map_err(TetherError::Io)?;
        debug!("Accepted connection from {}", peer);
        Handshake::new(stream, Arc::clone(&self.host_signer))
            .run(&self.config)
            .await
    }
}

/// One server-side handshake in progress.
struct Handshake {
    reader: PacketReader<OwnedReadHalf>,
    writer: PacketWriter<OwnedWriteHalf>,
    host_signer: Arc<dyn Signer>,
    client_version: String,
    server_version: String,
    client_kexinit_payload: Vec<u8>,
    server_kexinit_payload: Vec<u8>,
    session_id: Vec<u8>,
}

impl Handshake {
    fn new(stream: TcpStream, host_signer: Arc<dyn Signer>) -> Self {
        let (read_half, write_half) = stream.into_split();
        Self {
            reader: PacketReader::new(read_half),
            writer: PacketWriter::new(write_half),
            host_signer,
            client_version: String::new(),
            server_version: String::new(),
            client_kexinit_payload: Vec::new(),
            server_kexinit_payload: Vec::new(),
            session_id: Vec::new(),
        }
    }

    async fn run(mut self, config: &SshServerConfig) -> TetherResult<SshSession> {
        self.version_exchange(config).await?;
        self.key_exchange().await?;
        let username = self.authenticate(config).await?;

        // Connection-protocol mode: hand the halves to the dispatcher.
        let (opens_tx, opens_rx) = mpsc::unbounded_channel();
        let dispatcher = Dispatcher::start(self.reader, self.writer, opens_tx);

        Ok(SshSession {
            dispatcher,
            inbound_opens: opens_rx,
            username,
        })
    }

    async fn version_exchange(&mut self, config: &SshServerConfig) -> TetherResult<()> {
        let our_version = Version::new(&config.software, None);
        self.server_version = our_version.to_string();
        self.writer.write_raw(&our_version.to_wire_format()).await?;

        let line = self.reader.read_identification_line().await?;
        let client_version = Version::parse(&line)?;
        self.client_version = client_version.to_string();
        Ok(())
    }

    async fn key_exchange(&mut self) -> TetherResult<()> {
        let our_kexinit = KexInit::new_default();
        self.server_kexinit_payload = our_kexinit.to_bytes();
        self.writer
            .write_payload(&self.server_kexinit_payload.clone())
            .await?;

        let client_payload = self.reader.read_payload().await?;
        let client_kexinit = KexInit::from_bytes(&client_payload)?;
        self.client_kexinit_payload = client_payload;

        // Client preference order decides.
        let kex_alg = negotiate_algorithm(
            client_kexinit.kex_algorithms(),
            our_kexinit.kex_algorithms(),
        )?;
        let cipher_alg = negotiate_algorithm(
            client_kexinit.encryption_algorithms_client_to_server(),
            our_kexinit.encryption_algorithms_client_to_server(),
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

        let init = self.reader.read_payload().await?;
        if init.is_empty() || init[0] != MessageType::KexdhInit as u8 {
            return Err(TetherError::Protocol(
                "Expected SSH_MSG_KEXDH_INIT".to_string(),
            ));
        }
        let mut offset = 1;
        let client_public = wire::read_bytes(&init, &mut offset)?;

        let host_key_blob = self.host_signer.public_key().marshal();

        let (shared_secret, our_public_field, client_public_field) = match kex_alg.as_str() {
            "curve25519-sha256" | "curve25519-sha256@libssh.org" => {
                if client_public.len() != 32 {
                    return Err(TetherError::Protocol(
                        "Curve25519 public key must be 32 bytes".to_string(),
                    ));
                }
                let mut peer = [0u8; 32];
                peer.copy_from_slice(&client_public);

                let ours = Curve25519Exchange::new()?;
                let our_public = ours.public_key().to_vec();
                let shared = ours.compute_shared_secret(&peer)?;
                (
                    shared,
                    string_field(&our_public),
                    string_field(&client_public),
                )
            }
            "diffie-hellman-group14-sha256" => {
                let ours = DhGroup14Exchange::new();
                let shared = ours.compute_shared_secret(&client_public)?;
                (
                    shared,
                    wire::encode_mpint(ours.public_key()),
                    wire::encode_mpint(&client_public),
                )
            }
            other => {
                return Err(TetherError::Protocol(format!(
                    "Unsupported KEX algorithm: {}",
                    other
                )))
            }
        };

        let hash = exchange_hash(
            &self.client_version,
            &self.server_version,
            &self.client_kexinit_payload,
            &self.server_kexinit_payload,
            &host_key_blob,
            &client_public_field,
            &our_public_field,
            &shared_secret,
        );
        self.session_id = hash.clone();

        let signature = self.host_signer.sign(&hash)?;

        // byte 31, string K_S, string server public, string signature.
        let mut reply = vec![MessageType::KexdhReply as u8];
        let mut buf = bytes::BytesMut::new();
        wire::put_bytes(&mut buf, &host_key_blob);
        // our_public_field is already a string/mpint field; reuse verbatim.
        buf.extend_from_slice(&our_public_field);
        wire::put_bytes(&mut buf, &signature.to_bytes());
        reply.extend_from_slice(&buf);
        self.writer.write_payload(&reply).await?;

        // NEWKEYS both ways, then install keys.
        let newkeys = self.reader.read_payload().await?;
        NewKeys::from_bytes(&newkeys)?;
        self.writer.write_payload(&NewKeys::new().to_bytes()).await?;

        let enc_material = derive_key(
            &shared_secret,
            &hash,
            &self.session_id,
            b'D',
            cipher.key_size(),
        );
        let dec_material = derive_key(
            &shared_secret,
            &hash,
            &self.session_id,
            b'C',
            cipher.key_size(),
        );
        self.writer
            .install_key(EncryptionKey::new(cipher, &enc_material)?);
        self.reader
            .install_key(DecryptionKey::new(cipher, &dec_material)?);

        debug!("Server key exchange complete ({})", kex_alg);
        Ok(())
    }

    async fn authenticate(&mut self, config: &SshServerConfig) -> TetherResult<String> {
        let service = self.reader.read_payload().await?;
        if service.is_empty() || service[0] != MessageType::ServiceRequest as u8 {
            return Err(TetherError::Protocol(
                "Expected SSH_MSG_SERVICE_REQUEST".to_string(),
            ));
        }
        let mut offset = 1;
        let service_name = wire::read_string(&service, &mut offset)?;
        if service_name != "ssh-userauth" {
            return Err(TetherError::Protocol(format!(
                "Unknown service '{}'",
                service_name
            )));
        }

        let mut accept = vec![MessageType::ServiceAccept as u8];
        let mut buf = bytes::BytesMut::new();
        wire::put_string(&mut buf, "ssh-userauth");
        accept.extend_from_slice(&buf);
        self.writer.write_payload(&accept).await?;

        let mut methods = vec!["publickey".to_string()];
        if config.keyboard_interactive.is_some() {
            methods.push("keyboard-interactive".to_string());
        }

        for _ in 0..MAX_AUTH_ATTEMPTS {
            let payload = self.reader.read_payload().await?;
            let request = AuthRequest::from_bytes(&payload)?;
            let user = request.user_name().to_string();

            match request.method() {
                AuthMethod::None => {
                    if config.no_client_auth {
                        self.writer
                            .write_payload(&AuthSuccess::new().to_bytes())
                            .await?;
                        return Ok(user);
                    }
                    self.refuse(&methods).await?;
                }

                AuthMethod::PublicKey {
                    algorithm,
                    public_key,
                    signature: None,
                } => {
                    // Query phase: this key would be acceptable.
                    let pk_ok = AuthPkOk::new(algorithm.clone(), public_key.clone());
                    self.writer.write_payload(&pk_ok.to_bytes()).await?;
                }

                AuthMethod::PublicKey {
                    algorithm,
                    public_key,
                    signature: Some(signature),
                } => {
                    match self.check_publickey(config, &user, algorithm, public_key, signature) {
                        Ok(()) => {
                            self.writer
                                .write_payload(&AuthSuccess::new().to_bytes())
                                .await?;
                            return Ok(user);
                        }
                        Err(e) => {
                            if e.is_fatal_to_transport() {
                                return Err(e);
                            }
                            debug!("Publickey auth for '{}' refused: {}", user, e);
                            self.refuse(&methods).await?;
                        }
                    }
                }

                AuthMethod::KeyboardInteractive { .. } => {
                    let Some(policy) = &config.keyboard_interactive else {
                        self.refuse(&methods).await?;
                        continue;
                    };

                    let info = InfoRequest::single(&policy.prompt, false);
                    self.writer.write_payload(&info.to_bytes()).await?;

                    let reply = self.reader.read_payload().await?;
                    let response = InfoResponse::from_bytes(&reply)?;
                    let answer = response.responses.first().map(String::as_str).unwrap_or("");

                    if (policy.verify)(&user, answer) {
                        self.writer
                            .write_payload(&AuthSuccess::new().to_bytes())
                            .await?;
                        return Ok(user);
                    }
                    warn!("Keyboard-interactive auth for '{}' refused", user);
                    self.refuse(&methods).await?;
                }
            }
        }

        Err(TetherError::Auth(
            "Too many authentication attempts".to_string(),
        ))
    }

    async fn refuse(&mut self, methods: &[String]) -> TetherResult<()> {
        let failure = AuthFailure::new(methods.to_vec(), false);
        self.writer.write_payload(&failure.to_bytes()).await
    }

    /// Validates a signed publickey request: certificate policy or the raw
    /// key callback, then the signature over the session identifier.
    fn check_publickey(
        &self,
        config: &SshServerConfig,
        user: &str,
        algorithm: &str,
        public_key_blob: &[u8],
        signature_blob: &[u8],
    ) -> TetherResult<()> {
        let key = PublicKey::parse(public_key_blob)?;

        match &key {
            PublicKey::Certificate(cert) => {
                config.checker.authenticate_user(user, cert)?;
            }
            _ => {
                let approved = config
                    .public_key_auth
                    .as_ref()
                    .map(|auth| auth(user, &key))
                    .unwrap_or(false);
                if !approved {
                    return Err(TetherError::Policy(format!(
                        "Public key not authorized for '{}'",
                        user
                    )));
                }
            }
        }

        let signed_data = construct_signature_data(
            &self.session_id,
            user,
            "ssh-connection",
            algorithm,
            public_key_blob,
        );
        let signature = Signature::from_bytes(signature_blob)?;
        key.verify(&signed_data, &signature)
            .map_err(|_| TetherError::Auth("Publickey signature invalid".to_string()))
    }
}

/// An authenticated server-side session.
pub struct SshSession {
    dispatcher: Dispatcher,
    inbound_opens: mpsc::UnboundedReceiver<ChannelOpen>,
    username: String,
}

impl SshSession {
    /// Returns the authenticated username.
    pub fn username(&self) -> &str {
        &self.username
    }

    /// Returns the number of live channels.
    pub fn channel_count(&self) -> usize {
        self.dispatcher.channel_count()
    }

    /// Waits for the next peer-initiated channel, confirms it, and
    /// returns it.
    ///
    /// # Errors
    ///
    /// Returns [`TetherError::Closed`] once the transport is down.
    pub async fn accept_channel(&mut self) -> TetherResult<Arc<Channel>> {
        let open = self
            .inbound_opens
            .recv()
            .await
            .ok_or_else(|| TetherError::Closed("transport closed".to_string()))?;

        let local_id = self.dispatcher.allocate_channel_id();
        let (request_tx, request_rx) = mpsc::unbounded_channel();
        let channel = Arc::new(Channel::new(
            local_id,
            open.sender_channel(),
            DEFAULT_WINDOW_SIZE,
            open.initial_window_size(),
            open.maximum_packet_size(),
            ChannelState::Open,
            self.dispatcher.outbound(),
            request_rx,
        ));
        self.dispatcher
            .insert_channel(Arc::clone(&channel), request_tx);

        let confirm = ChannelOpenConfirmation::new(
            open.sender_channel(),
            local_id,
            DEFAULT_WINDOW_SIZE,
            DEFAULT_MAX_PACKET_SIZE,
        );
        self.dispatcher
            .outbound()
            .send(confirm.to_bytes())
            .map_err(|_| TetherError::Closed("transport writer gone".to_string()))?;

        debug!(
            "Accepted '{}' channel {} (remote {})",
            open.channel_type().name(),
            local_id,
            open.sender_channel()
        );
        Ok(channel)
    }

    /// Tears the session down.
    pub fn shutdown(&mut self) {
        self.dispatcher.shutdown();
    }
}
