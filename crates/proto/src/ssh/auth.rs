//! SSH user authentication protocol (RFC 4252, RFC 4256).
//!
//! Supported methods:
//! - "publickey" - a raw public key or an OpenSSH certificate, proven by a
//!   signature over the session identifier
//! - "keyboard-interactive" - prompt/response exchange (the carrier for
//!   one-time-password schemes)
//! - "none" - probes the server's accepted method list
//!
//! Message structs serialize with `to_bytes`/`from_bytes`; the transport
//! wraps them in packets.

use crate::ssh::message::MessageType;
use crate::ssh::wire;
use bytes::{BufMut, BytesMut};
use tether_platform::{TetherError, TetherResult};

/// SSH authentication method carried in a USERAUTH_REQUEST.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthMethod {
    /// No authentication; used to learn which methods may continue.
    None,
    /// Public key authentication. The blob may hold a plain key or a
    /// certificate; the signature is absent during the query phase.
    PublicKey {
        /// Algorithm name (e.g. "ssh-ed25519",
        /// "ssh-ed25519-cert-v01@openssh.com")
        algorithm: String,
        /// Public key or certificate blob
        public_key: Vec<u8>,
        /// Signature over the session identifier and request fields
        signature: Option<Vec<u8>>,
    },
    /// Keyboard-interactive authentication (RFC 4256).
    KeyboardInteractive {
        /// Comma-separated submethod hints, usually empty
        submethods: String,
    },
}

impl AuthMethod {
    /// Returns the method name.
    pub fn name(&self) -> &str {
        match self {
            AuthMethod::None => "none",
            AuthMethod::PublicKey { .. } => "publickey",
            AuthMethod::KeyboardInteractive { .. } => "keyboard-interactive",
        }
    }
}

/// SSH_MSG_USERAUTH_REQUEST message (RFC 4252 Section 5).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthRequest {
    user_name: String,
    service_name: String,
    method: AuthMethod,
}

impl AuthRequest {
    /// Creates an authentication request.
    pub fn new(user_name: &str, service_name: &str, method: AuthMethod) -> Self {
        Self {
            user_name: user_name.to_string(),
            service_name: service_name.to_string(),
            method,
        }
    }

    /// Returns the user name.
    pub fn user_name(&self) -> &str {
        &self.user_name
    }

    /// Returns the service name.
    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    /// Returns the authentication method.
    pub fn method(&self) -> &AuthMethod {
        &self.method
    }

    /// Serializes the request.
    ///
    /// Format (RFC 4252 Section 5):
    /// ```text
    /// byte      SSH_MSG_USERAUTH_REQUEST (50)
    /// string    user name
    /// string    service name
    /// string    method name
    /// ....      method specific fields
    /// ```
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();

        buf.put_u8(MessageType::UserauthRequest as u8);
        wire::put_string(&mut buf, &self.user_name);
        wire::put_string(&mut buf, &self.service_name);
        wire::put_string(&mut buf, self.method.name());

        match &self.method {
            AuthMethod::None => {}
            AuthMethod::PublicKey {
                algorithm,
                public_key,
                signature,
            } => {
                wire::put_bool(&mut buf, signature.is_some());
                wire::put_string(&mut buf, algorithm);
                wire::put_bytes(&mut buf, public_key);
                if let Some(sig) = signature {
                    wire::put_bytes(&mut buf, sig);
                }
            }
            AuthMethod::KeyboardInteractive { submethods } => {
                // string language tag (deprecated, empty)
                wire::put_string(&mut buf, "");
                wire::put_string(&mut buf, submethods);
            }
        }

        buf.to_vec()
    }

    /// Parses a request.
    ///
    /// # Errors
    ///
    /// Returns [`TetherError::Protocol`] for a malformed message and
    /// [`TetherError::Auth`] for an unsupported method name.
    pub fn from_bytes(data: &[u8]) -> TetherResult<Self> {
        if data.is_empty() || data[0] != MessageType::UserauthRequest as u8 {
            return Err(TetherError::Protocol(
                "Invalid SSH_MSG_USERAUTH_REQUEST message".to_string(),
            ));
        }

        let mut offset = 1;
        let user_name = wire::read_string(data, &mut offset)?;
        let service_name = wire::read_string(data, &mut offset)?;
        let method_name = wire::read_string(data, &mut offset)?;

        let method = match method_name.as_str() {
            "none" => AuthMethod::None,
            "publickey" => {
                let has_signature = wire::read_bool(data, &mut offset)?;
                let algorithm = wire::read_string(data, &mut offset)?;
                let public_key = wire::read_bytes(data, &mut offset)?;
                let signature = if has_signature {
                    Some(wire::read_bytes(data, &mut offset)?)
                } else {
                    None
                };
                AuthMethod::PublicKey {
                    algorithm,
                    public_key,
                    signature,
                }
            }
            "keyboard-interactive" => {
                let _language = wire::read_string(data, &mut offset)?;
                let submethods = wire::read_string(data, &mut offset)?;
                AuthMethod::KeyboardInteractive { submethods }
            }
            other => {
                return Err(TetherError::Auth(format!(
                    "Unsupported authentication method \"{}\"",
                    other
                )))
            }
        };

        Ok(Self {
            user_name,
            service_name,
            method,
        })
    }
}

/// SSH_MSG_USERAUTH_FAILURE message (RFC 4252 Section 5.1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthFailure {
    methods_can_continue: Vec<String>,
    partial_success: bool,
}

impl AuthFailure {
    /// Creates a failure response listing the methods that may continue.
    pub fn new(methods: Vec<String>, partial_success: bool) -> Self {
        Self {
            methods_can_continue: methods,
            partial_success,
        }
    }

    /// Returns the methods that can continue.
    pub fn methods_can_continue(&self) -> &[String] {
        &self.methods_can_continue
    }

    /// Returns whether the previous method partially succeeded.
    pub fn partial_success(&self) -> bool {
        self.partial_success
    }

    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::UserauthFailure as u8);
        wire::put_name_list(&mut buf, &self.methods_can_continue);
        wire::put_bool(&mut buf, self.partial_success);
        buf.to_vec()
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> TetherResult<Self> {
        if data.is_empty() || data[0] != MessageType::UserauthFailure as u8 {
            return Err(TetherError::Protocol(
                "Invalid SSH_MSG_USERAUTH_FAILURE message".to_string(),
            ));
        }
        let mut offset = 1;
        let methods_can_continue = wire::read_name_list(data, &mut offset)?;
        let partial_success = wire::read_bool(data, &mut offset)?;
        Ok(Self {
            methods_can_continue,
            partial_success,
        })
    }
}

/// SSH_MSG_USERAUTH_SUCCESS message (RFC 4252 Section 5.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthSuccess;

impl AuthSuccess {
    /// Creates a success response.
    pub fn new() -> Self {
        Self
    }

    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        vec![MessageType::UserauthSuccess as u8]
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> TetherResult<Self> {
        if data.len() != 1 || data[0] != MessageType::UserauthSuccess as u8 {
            return Err(TetherError::Protocol(
                "Invalid SSH_MSG_USERAUTH_SUCCESS message".to_string(),
            ));
        }
        Ok(Self)
    }
}

impl Default for AuthSuccess {
    fn default() -> Self {
        Self::new()
    }
}

/// SSH_MSG_USERAUTH_BANNER message (RFC 4252 Section 5.4).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthBanner {
    message: String,
}

impl AuthBanner {
    /// Creates a banner.
    pub fn new(message: String) -> Self {
        Self { message }
    }

    /// Returns the banner text.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::UserauthBanner as u8);
        wire::put_string(&mut buf, &self.message);
        wire::put_string(&mut buf, "");
        buf.to_vec()
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> TetherResult<Self> {
        if data.is_empty() || data[0] != MessageType::UserauthBanner as u8 {
            return Err(TetherError::Protocol(
                "Invalid SSH_MSG_USERAUTH_BANNER message".to_string(),
            ));
        }
        let mut offset = 1;
        let message = wire::read_string(data, &mut offset)?;
        let _language = wire::read_string(data, &mut offset)?;
        Ok(Self { message })
    }
}

/// SSH_MSG_USERAUTH_PK_OK message (RFC 4252 Section 7).
///
/// The server's answer to a signatureless publickey query: this key would
/// be acceptable, send the signed request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthPkOk {
    algorithm: String,
    public_key: Vec<u8>,
}

impl AuthPkOk {
    /// Creates a PK_OK response.
    pub fn new(algorithm: impl Into<String>, public_key: Vec<u8>) -> Self {
        Self {
            algorithm: algorithm.into(),
            public_key,
        }
    }

    /// Returns the echoed algorithm name.
    pub fn algorithm(&self) -> &str {
        &self.algorithm
    }

    /// Returns the echoed public key blob.
    pub fn public_key(&self) -> &[u8] {
        &self.public_key
    }

    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::UserauthPkOk as u8);
        wire::put_string(&mut buf, &self.algorithm);
        wire::put_bytes(&mut buf, &self.public_key);
        buf.to_vec()
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> TetherResult<Self> {
        if data.is_empty() || data[0] != MessageType::UserauthPkOk as u8 {
            return Err(TetherError::Protocol(
                "Invalid SSH_MSG_USERAUTH_PK_OK message".to_string(),
            ));
        }
        let mut offset = 1;
        let algorithm = wire::read_string(data, &mut offset)?;
        let public_key = wire::read_bytes(data, &mut offset)?;
        Ok(Self {
            algorithm,
            public_key,
        })
    }
}

/// One prompt inside an INFO_REQUEST.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InfoPrompt {
    /// Prompt text shown to the user.
    pub prompt: String,
    /// Whether the response may be echoed.
    pub echo: bool,
}

/// SSH_MSG_USERAUTH_INFO_REQUEST message (RFC 4256 Section 3.2).
///
/// Shares message number 60 with PK_OK; the active method disambiguates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InfoRequest {
    /// Instruction name, may be empty.
    pub name: String,
    /// Instruction text, may be empty.
    pub instruction: String,
    /// The prompts to answer, in order.
    pub prompts: Vec<InfoPrompt>,
}

impl InfoRequest {
    /// Creates an INFO_REQUEST with a single prompt.
    pub fn single(prompt: &str, echo: bool) -> Self {
        Self {
            name: String::new(),
            instruction: String::new(),
            prompts: vec![InfoPrompt {
                prompt: prompt.to_string(),
                echo,
            }],
        }
    }

    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::UserauthPkOk as u8); // 60, shared number
        wire::put_string(&mut buf, &self.name);
        wire::put_string(&mut buf, &self.instruction);
        wire::put_string(&mut buf, ""); // language tag, deprecated
        buf.put_u32(self.prompts.len() as u32);
        for prompt in &self.prompts {
            wire::put_string(&mut buf, &prompt.prompt);
            wire::put_bool(&mut buf, prompt.echo);
        }
        buf.to_vec()
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> TetherResult<Self> {
        if data.is_empty() || data[0] != MessageType::UserauthPkOk as u8 {
            return Err(TetherError::Protocol(
                "Invalid SSH_MSG_USERAUTH_INFO_REQUEST message".to_string(),
            ));
        }
        let mut offset = 1;
        let name = wire::read_string(data, &mut offset)?;
        let instruction = wire::read_string(data, &mut offset)?;
        let _language = wire::read_string(data, &mut offset)?;
        let count = wire::read_u32(data, &mut offset)? as usize;

        let mut prompts = Vec::with_capacity(count);
        for _ in 0..count {
            let prompt = wire::read_string(data, &mut offset)?;
            let echo = wire::read_bool(data, &mut offset)?;
            prompts.push(InfoPrompt { prompt, echo });
        }

        Ok(Self {
            name,
            instruction,
            prompts,
        })
    }
}

/// SSH_MSG_USERAUTH_INFO_RESPONSE message (RFC 4256 Section 3.4).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InfoResponse {
    /// Responses, one per prompt, in prompt order.
    pub responses: Vec<String>,
}

impl InfoResponse {
    /// Creates an INFO_RESPONSE.
    pub fn new(responses: Vec<String>) -> Self {
        Self { responses }
    }

    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::UserauthInfoResponse as u8);
        buf.put_u32(self.responses.len() as u32);
        for response in &self.responses {
            wire::put_string(&mut buf, response);
        }
        buf.to_vec()
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> TetherResult<Self> {
        if data.is_empty() || data[0] != MessageType::UserauthInfoResponse as u8 {
            return Err(TetherError::Protocol(
                "Invalid SSH_MSG_USERAUTH_INFO_RESPONSE message".to_string(),
            ));
        }
        let mut offset = 1;
        let count = wire::read_u32(data, &mut offset)? as usize;
        let mut responses = Vec::with_capacity(count);
        for _ in 0..count {
            responses.push(wire::read_string(data, &mut offset)?);
        }
        Ok(Self { responses })
    }
}

/// Constructs the bytes a publickey authentication signature covers
/// (RFC 4252 Section 7): the session identifier followed by the request
/// fields up to and including the public key blob.
pub fn construct_signature_data(
    session_id: &[u8],
    user_name: &str,
    service_name: &str,
    algorithm: &str,
    public_key: &[u8],
) -> Vec<u8> {
    let mut buf = BytesMut::new();
    wire::put_bytes(&mut buf, session_id);
    buf.put_u8(MessageType::UserauthRequest as u8);
    wire::put_string(&mut buf, user_name);
    wire::put_string(&mut buf, service_name);
    wire::put_string(&mut buf, "publickey");
    wire::put_bool(&mut buf, true);
    wire::put_string(&mut buf, algorithm);
    wire::put_bytes(&mut buf, public_key);
    buf.to_vec()
}

/// Compares two strings in constant time.
pub fn constant_time_compare(a: &str, b: &str) -> bool {
    use subtle::ConstantTimeEq;
    a.len() == b.len() && a.as_bytes().ct_eq(b.as_bytes()).into()
}
