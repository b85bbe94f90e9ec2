//! SSH connection protocol messages (RFC 4254).
//!
//! Typed codecs for the channel layer: OPEN, OPEN_CONFIRMATION,
//! OPEN_FAILURE, WINDOW_ADJUST, DATA, EXTENDED_DATA, EOF, CLOSE, REQUEST,
//! SUCCESS and FAILURE. The channel state machine itself lives in
//! [`crate::ssh::channel`]; the routing of these messages onto channels in
//! [`crate::ssh::dispatcher`].
//!
//! Channel types carried here:
//! - `custom-inproc-stream` - the logical stream the supervisor opens
//! - `session` - interactive/exec sessions
//! - `direct-tcpip` - forwarding to a downstream host:port

use crate::ssh::message::MessageType;
use crate::ssh::wire;
use bytes::{BufMut, BytesMut};
use tether_platform::{TetherError, TetherResult};

/// Maximum receive window a peer may advertise (16 MB).
pub const MAX_WINDOW_SIZE: u32 = 16 * 1024 * 1024;

/// Maximum packet size a peer may advertise (256 KB).
pub const MAX_PACKET_SIZE: u32 = 256 * 1024;

/// Default initial window advertised for new channels (1 MB).
pub const DEFAULT_WINDOW_SIZE: u32 = 1024 * 1024;

/// Default maximum packet size advertised for new channels (32 KB).
pub const DEFAULT_MAX_PACKET_SIZE: u32 = 32 * 1024;

/// Channel request name used for keepalive probes.
pub const KEEPALIVE_REQUEST: &str = "keepalive@openssh.com";

/// Channel type carried in a CHANNEL_OPEN.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelType {
    /// The supervisor's logical in-process stream.
    CustomInprocStream,
    /// Interactive session channel.
    Session,
    /// Direct TCP/IP forwarding (RFC 4254 Section 7.2).
    DirectTcpip {
        /// Host the peer should connect to
        host: String,
        /// Port the peer should connect to
        port: u32,
        /// Originator IP address
        originator_address: String,
        /// Originator port
        originator_port: u32,
    },
}

impl ChannelType {
    /// Returns the channel type name.
    pub fn name(&self) -> &str {
        match self {
            ChannelType::CustomInprocStream => "custom-inproc-stream",
            ChannelType::Session => "session",
            ChannelType::DirectTcpip { .. } => "direct-tcpip",
        }
    }
}

/// SSH_MSG_CHANNEL_OPEN message (RFC 4254 Section 5.1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelOpen {
    channel_type: ChannelType,
    sender_channel: u32,
    initial_window_size: u32,
    maximum_packet_size: u32,
}

impl ChannelOpen {
    /// Creates a channel open message.
    pub fn new(
        channel_type: ChannelType,
        sender_channel: u32,
        initial_window_size: u32,
        maximum_packet_size: u32,
    ) -> Self {
        Self {
            channel_type,
            sender_channel,
            initial_window_size,
            maximum_packet_size,
        }
    }

    /// Returns the channel type.
    pub fn channel_type(&self) -> &ChannelType {
        &self.channel_type
    }

    /// Returns the sender's channel number.
    pub fn sender_channel(&self) -> u32 {
        self.sender_channel
    }

    /// Returns the advertised initial window size.
    pub fn initial_window_size(&self) -> u32 {
        self.initial_window_size
    }

    /// Returns the advertised maximum packet size.
    pub fn maximum_packet_size(&self) -> u32 {
        self.maximum_packet_size
    }

    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();

        buf.put_u8(MessageType::ChannelOpen as u8);
        wire::put_string(&mut buf, self.channel_type.name());
        buf.put_u32(self.sender_channel);
        buf.put_u32(self.initial_window_size);
        buf.put_u32(self.maximum_packet_size);

        if let ChannelType::DirectTcpip {
            host,
            port,
            originator_address,
            originator_port,
        } = &self.channel_type
        {
            wire::put_string(&mut buf, host);
            buf.put_u32(*port);
            wire::put_string(&mut buf, originator_address);
            buf.put_u32(*originator_port);
        }

        buf.to_vec()
    }

    /// Parses from bytes.
    ///
    /// # Errors
    ///
    /// Returns [`TetherError::Protocol`] for malformed data or window and
    /// packet sizes above the caps.
    pub fn from_bytes(data: &[u8]) -> TetherResult<Self> {
        if data.is_empty() || data[0] != MessageType::ChannelOpen as u8 {
            return Err(TetherError::Protocol(
                "Invalid SSH_MSG_CHANNEL_OPEN message".to_string(),
            ));
        }

        let mut offset = 1;
        let type_name = wire::read_string(data, &mut offset)?;
        let sender_channel = wire::read_u32(data, &mut offset)?;
        let initial_window_size = wire::read_u32(data, &mut offset)?;
        let maximum_packet_size = wire::read_u32(data, &mut offset)?;

        if initial_window_size > MAX_WINDOW_SIZE {
            return Err(TetherError::Protocol(format!(
                "Initial window size {} exceeds maximum {}",
                initial_window_size, MAX_WINDOW_SIZE
            )));
        }

        if maximum_packet_size > MAX_PACKET_SIZE {
            return Err(TetherError::Protocol(format!(
                "Maximum packet size {} exceeds maximum {}",
                maximum_packet_size, MAX_PACKET_SIZE
            )));
        }

        let channel_type = match type_name.as_str() {
            "custom-inproc-stream" => ChannelType::CustomInprocStream,
            "session" => ChannelType::Session,
            "direct-tcpip" => {
                let host = wire::read_string(data, &mut offset)?;
                let port = wire::read_u32(data, &mut offset)?;
                let originator_address = wire::read_string(data, &mut offset)?;
                let originator_port = wire::read_u32(data, &mut offset)?;
                ChannelType::DirectTcpip {
                    host,
                    port,
                    originator_address,
                    originator_port,
                }
            }
            other => {
                return Err(TetherError::Protocol(format!(
                    "Unsupported channel type: '{}'",
                    other
                )))
            }
        };

        Ok(Self {
            channel_type,
            sender_channel,
            initial_window_size,
            maximum_packet_size,
        })
    }
}

/// SSH_MSG_CHANNEL_OPEN_CONFIRMATION message (RFC 4254 Section 5.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelOpenConfirmation {
    recipient_channel: u32,
    sender_channel: u32,
    initial_window_size: u32,
    maximum_packet_size: u32,
}

impl ChannelOpenConfirmation {
    /// Creates a channel open confirmation.
    pub fn new(
        recipient_channel: u32,
        sender_channel: u32,
        initial_window_size: u32,
        maximum_packet_size: u32,
    ) -> Self {
        Self {
            recipient_channel,
            sender_channel,
            initial_window_size,
            maximum_packet_size,
        }
    }

    /// Returns the recipient channel number.
    pub fn recipient_channel(&self) -> u32 {
        self.recipient_channel
    }

    /// Returns the sender channel number.
    pub fn sender_channel(&self) -> u32 {
        self.sender_channel
    }

    /// Returns the advertised initial window size.
    pub fn initial_window_size(&self) -> u32 {
        self.initial_window_size
    }

    /// Returns the advertised maximum packet size.
    pub fn maximum_packet_size(&self) -> u32 {
        self.maximum_packet_size
    }

    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::ChannelOpenConfirmation as u8);
        buf.put_u32(self.recipient_channel);
        buf.put_u32(self.sender_channel);
        buf.put_u32(self.initial_window_size);
        buf.put_u32(self.maximum_packet_size);
        buf.to_vec()
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> TetherResult<Self> {
        if data.is_empty() || data[0] != MessageType::ChannelOpenConfirmation as u8 {
            return Err(TetherError::Protocol(
                "Invalid SSH_MSG_CHANNEL_OPEN_CONFIRMATION message".to_string(),
            ));
        }
        let mut offset = 1;
        Ok(Self {
            recipient_channel: wire::read_u32(data, &mut offset)?,
            sender_channel: wire::read_u32(data, &mut offset)?,
            initial_window_size: wire::read_u32(data, &mut offset)?,
            maximum_packet_size: wire::read_u32(data, &mut offset)?,
        })
    }
}

/// Channel open failure reason codes (RFC 4254 Section 5.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ChannelOpenFailureReason {
    /// Administratively prohibited
    AdministrativelyProhibited = 1,
    /// Connect failed
    ConnectFailed = 2,
    /// Unknown channel type
    UnknownChannelType = 3,
    /// Resource shortage
    ResourceShortage = 4,
}

impl ChannelOpenFailureReason {
    /// Converts from the wire value.
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            1 => Some(Self::AdministrativelyProhibited),
            2 => Some(Self::ConnectFailed),
            3 => Some(Self::UnknownChannelType),
            4 => Some(Self::ResourceShortage),
            _ => None,
        }
    }

    /// Returns a human-readable description.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AdministrativelyProhibited => "Administratively prohibited",
            Self::ConnectFailed => "Connect failed",
            Self::UnknownChannelType => "Unknown channel type",
            Self::ResourceShortage => "Resource shortage",
        }
    }
}

/// SSH_MSG_CHANNEL_OPEN_FAILURE message (RFC 4254 Section 5.1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelOpenFailure {
    recipient_channel: u32,
    reason_code: ChannelOpenFailureReason,
    description: String,
    language_tag: String,
}

impl ChannelOpenFailure {
    /// Creates a channel open failure with the stock description.
    pub fn new(recipient_channel: u32, reason_code: ChannelOpenFailureReason) -> Self {
        Self {
            recipient_channel,
            reason_code,
            description: reason_code.as_str().to_string(),
            language_tag: String::new(),
        }
    }

    /// Returns the recipient channel number.
    pub fn recipient_channel(&self) -> u32 {
        self.recipient_channel
    }

    /// Returns the reason code.
    pub fn reason_code(&self) -> ChannelOpenFailureReason {
        self.reason_code
    }

    /// Returns the description.
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::ChannelOpenFailure as u8);
        buf.put_u32(self.recipient_channel);
        buf.put_u32(self.reason_code as u32);
        wire::put_string(&mut buf, &self.description);
        wire::put_string(&mut buf, &self.language_tag);
        buf.to_vec()
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> TetherResult<Self> {
        if data.is_empty() || data[0] != MessageType::ChannelOpenFailure as u8 {
            return Err(TetherError::Protocol(
                "Invalid SSH_MSG_CHANNEL_OPEN_FAILURE message".to_string(),
            ));
        }
        let mut offset = 1;
        let recipient_channel = wire::read_u32(data, &mut offset)?;
        let reason_code_u32 = wire::read_u32(data, &mut offset)?;
        let description = wire::read_string(data, &mut offset)?;
        let language_tag = wire::read_string(data, &mut offset)?;

        let reason_code = ChannelOpenFailureReason::from_u32(reason_code_u32).ok_or_else(|| {
            TetherError::Protocol(format!("Invalid failure reason code: {}", reason_code_u32))
        })?;

        Ok(Self {
            recipient_channel,
            reason_code,
            description,
            language_tag,
        })
    }
}

/// SSH_MSG_CHANNEL_WINDOW_ADJUST message (RFC 4254 Section 5.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelWindowAdjust {
    recipient_channel: u32,
    bytes_to_add: u32,
}

impl ChannelWindowAdjust {
    /// Creates a window adjust message.
    pub fn new(recipient_channel: u32, bytes_to_add: u32) -> Self {
        Self {
            recipient_channel,
            bytes_to_add,
        }
    }

    /// Returns the recipient channel number.
    pub fn recipient_channel(&self) -> u32 {
        self.recipient_channel
    }

    /// Returns the credit being granted.
    pub fn bytes_to_add(&self) -> u32 {
        self.bytes_to_add
    }

    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::ChannelWindowAdjust as u8);
        buf.put_u32(self.recipient_channel);
        buf.put_u32(self.bytes_to_add);
        buf.to_vec()
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> TetherResult<Self> {
        if data.is_empty() || data[0] != MessageType::ChannelWindowAdjust as u8 {
            return Err(TetherError::Protocol(
                "Invalid SSH_MSG_CHANNEL_WINDOW_ADJUST message".to_string(),
            ));
        }
        let mut offset = 1;
        Ok(Self {
            recipient_channel: wire::read_u32(data, &mut offset)?,
            bytes_to_add: wire::read_u32(data, &mut offset)?,
        })
    }
}

/// SSH_MSG_CHANNEL_DATA message (RFC 4254 Section 5.2).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelData {
    recipient_channel: u32,
    data: Vec<u8>,
}

impl ChannelData {
    /// Creates a channel data message.
    pub fn new(recipient_channel: u32, data: Vec<u8>) -> Self {
        Self {
            recipient_channel,
            data,
        }
    }

    /// Returns the recipient channel number.
    pub fn recipient_channel(&self) -> u32 {
        self.recipient_channel
    }

    /// Returns the payload.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::ChannelData as u8);
        buf.put_u32(self.recipient_channel);
        wire::put_bytes(&mut buf, &self.data);
        buf.to_vec()
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> TetherResult<Self> {
        if data.is_empty() || data[0] != MessageType::ChannelData as u8 {
            return Err(TetherError::Protocol(
                "Invalid SSH_MSG_CHANNEL_DATA message".to_string(),
            ));
        }
        let mut offset = 1;
        let recipient_channel = wire::read_u32(data, &mut offset)?;
        let payload = wire::read_bytes(data, &mut offset)?;
        Ok(Self {
            recipient_channel,
            data: payload,
        })
    }
}

/// Extended data type code (RFC 4254 Section 5.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ExtendedDataType {
    /// Stderr data
    Stderr = 1,
}

impl ExtendedDataType {
    /// Converts from the wire value.
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            1 => Some(Self::Stderr),
            _ => None,
        }
    }
}

/// SSH_MSG_CHANNEL_EXTENDED_DATA message (RFC 4254 Section 5.2).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelExtendedData {
    recipient_channel: u32,
    data_type_code: ExtendedDataType,
    data: Vec<u8>,
}

impl ChannelExtendedData {
    /// Creates an extended data message.
    pub fn new(recipient_channel: u32, data_type_code: ExtendedDataType, data: Vec<u8>) -> Self {
        Self {
            recipient_channel,
            data_type_code,
            data,
        }
    }

    /// Returns the recipient channel number.
    pub fn recipient_channel(&self) -> u32 {
        self.recipient_channel
    }

    /// Returns the data type code.
    pub fn data_type_code(&self) -> ExtendedDataType {
        self.data_type_code
    }

    /// Returns the payload.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::ChannelExtendedData as u8);
        buf.put_u32(self.recipient_channel);
        buf.put_u32(self.data_type_code as u32);
        wire::put_bytes(&mut buf, &self.data);
        buf.to_vec()
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> TetherResult<Self> {
        if data.is_empty() || data[0] != MessageType::ChannelExtendedData as u8 {
            return Err(TetherError::Protocol(
                "Invalid SSH_MSG_CHANNEL_EXTENDED_DATA message".to_string(),
            ));
        }
        let mut offset = 1;
        let recipient_channel = wire::read_u32(data, &mut offset)?;
        let data_type_code_u32 = wire::read_u32(data, &mut offset)?;
        let payload = wire::read_bytes(data, &mut offset)?;

        let data_type_code = ExtendedDataType::from_u32(data_type_code_u32).ok_or_else(|| {
            TetherError::Protocol(format!("Invalid extended data type: {}", data_type_code_u32))
        })?;

        Ok(Self {
            recipient_channel,
            data_type_code,
            data: payload,
        })
    }
}

/// SSH_MSG_CHANNEL_EOF message (RFC 4254 Section 5.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelEof {
    recipient_channel: u32,
}

impl ChannelEof {
    /// Creates a channel EOF message.
    pub fn new(recipient_channel: u32) -> Self {
        Self { recipient_channel }
    }

    /// Returns the recipient channel number.
    pub fn recipient_channel(&self) -> u32 {
        self.recipient_channel
    }

    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::ChannelEof as u8);
        buf.put_u32(self.recipient_channel);
        buf.to_vec()
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> TetherResult<Self> {
        if data.is_empty() || data[0] != MessageType::ChannelEof as u8 {
            return Err(TetherError::Protocol(
                "Invalid SSH_MSG_CHANNEL_EOF message".to_string(),
            ));
        }
        let mut offset = 1;
        Ok(Self {
            recipient_channel: wire::read_u32(data, &mut offset)?,
        })
    }
}

/// SSH_MSG_CHANNEL_CLOSE message (RFC 4254 Section 5.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelClose {
    recipient_channel: u32,
}

impl ChannelClose {
    /// Creates a channel close message.
    pub fn new(recipient_channel: u32) -> Self {
        Self { recipient_channel }
    }

    /// Returns the recipient channel number.
    pub fn recipient_channel(&self) -> u32 {
        self.recipient_channel
    }

    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::ChannelClose as u8);
        buf.put_u32(self.recipient_channel);
        buf.to_vec()
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> TetherResult<Self> {
        if data.is_empty() || data[0] != MessageType::ChannelClose as u8 {
            return Err(TetherError::Protocol(
                "Invalid SSH_MSG_CHANNEL_CLOSE message".to_string(),
            ));
        }
        let mut offset = 1;
        Ok(Self {
            recipient_channel: wire::read_u32(data, &mut offset)?,
        })
    }
}

/// Channel request payloads (RFC 4254 Section 6).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelRequestType {
    /// Keepalive probe; the peer answers with SUCCESS or FAILURE.
    Keepalive,
    /// Exit status of the remote process.
    ExitStatus {
        /// Exit status code
        exit_status: u32,
    },
    /// Any request this stack does not interpret; kept verbatim.
    Other {
        /// Request name
        name: String,
        /// Raw request payload
        data: Vec<u8>,
    },
}

impl ChannelRequestType {
    /// Returns the request name.
    pub fn name(&self) -> &str {
        match self {
            ChannelRequestType::Keepalive => KEEPALIVE_REQUEST,
            ChannelRequestType::ExitStatus { .. } => "exit-status",
            ChannelRequestType::Other { name, .. } => name,
        }
    }
}

/// SSH_MSG_CHANNEL_REQUEST message (RFC 4254 Section 6).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelRequest {
    recipient_channel: u32,
    request_type: ChannelRequestType,
    want_reply: bool,
}

impl ChannelRequest {
    /// Creates a channel request.
    pub fn new(recipient_channel: u32, request_type: ChannelRequestType, want_reply: bool) -> Self {
        Self {
            recipient_channel,
            request_type,
            want_reply,
        }
    }

    /// Returns the recipient channel number.
    pub fn recipient_channel(&self) -> u32 {
        self.recipient_channel
    }

    /// Returns the request type.
    pub fn request_type(&self) -> &ChannelRequestType {
        &self.request_type
    }

    /// Returns whether the peer wants a reply.
    pub fn want_reply(&self) -> bool {
        self.want_reply
    }

    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::ChannelRequest as u8);
        buf.put_u32(self.recipient_channel);
        wire::put_string(&mut buf, self.request_type.name());
        wire::put_bool(&mut buf, self.want_reply);

        match &self.request_type {
            ChannelRequestType::Keepalive => {}
            ChannelRequestType::ExitStatus { exit_status } => {
                buf.put_u32(*exit_status);
            }
            ChannelRequestType::Other { data, .. } => {
                buf.put_slice(data);
            }
        }

        buf.to_vec()
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> TetherResult<Self> {
        if data.is_empty() || data[0] != MessageType::ChannelRequest as u8 {
            return Err(TetherError::Protocol(
                "Invalid SSH_MSG_CHANNEL_REQUEST message".to_string(),
            ));
        }

        let mut offset = 1;
        let recipient_channel = wire::read_u32(data, &mut offset)?;
        let request_name = wire::read_string(data, &mut offset)?;
        let want_reply = wire::read_bool(data, &mut offset)?;

        let request_type = match request_name.as_str() {
            KEEPALIVE_REQUEST => ChannelRequestType::Keepalive,
            "exit-status" => ChannelRequestType::ExitStatus {
                exit_status: wire::read_u32(data, &mut offset)?,
            },
            _ => ChannelRequestType::Other {
                name: request_name,
                data: data[offset..].to_vec(),
            },
        };

        Ok(Self {
            recipient_channel,
            request_type,
            want_reply,
        })
    }
}

/// SSH_MSG_CHANNEL_SUCCESS message (RFC 4254 Section 6.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelSuccess {
    recipient_channel: u32,
}

impl ChannelSuccess {
    /// Creates a channel success message.
    pub fn new(recipient_channel: u32) -> Self {
        Self { recipient_channel }
    }

    /// Returns the recipient channel number.
    pub fn recipient_channel(&self) -> u32 {
        self.recipient_channel
    }

    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::ChannelSuccess as u8);
        buf.put_u32(self.recipient_channel);
        buf.to_vec()
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> TetherResult<Self> {
        if data.is_empty() || data[0] != MessageType::ChannelSuccess as u8 {
            return Err(TetherError::Protocol(
                "Invalid SSH_MSG_CHANNEL_SUCCESS message".to_string(),
            ));
        }
        let mut offset = 1;
        Ok(Self {
            recipient_channel: wire::read_u32(data, &mut offset)?,
        })
    }
}

/// SSH_MSG_CHANNEL_FAILURE message (RFC 4254 Section 6.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelFailure {
    recipient_channel: u32,
}

impl ChannelFailure {
    /// Creates a channel failure message.
    pub fn new(recipient_channel: u32) -> Self {
        Self { recipient_channel }
    }

    /// Returns the recipient channel number.
    pub fn recipient_channel(&self) -> u32 {
        self.recipient_channel
    }

    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::ChannelFailure as u8);
        buf.put_u32(self.recipient_channel);
        buf.to_vec()
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> TetherResult<Self> {
        if data.is_empty() || data[0] != MessageType::ChannelFailure as u8 {
            return Err(TetherError::Protocol(
                "Invalid SSH_MSG_CHANNEL_FAILURE message".to_string(),
            ));
        }
        let mut offset = 1;
        Ok(Self {
            recipient_channel: wire::read_u32(data, &mut offset)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_open_inproc_stream() {
        let open = ChannelOpen::new(ChannelType::CustomInprocStream, 0, 1048576, 32768);
        let parsed = ChannelOpen::from_bytes(&open.to_bytes()).unwrap();

        assert_eq!(parsed.channel_type(), &ChannelType::CustomInprocStream);
        assert_eq!(parsed.channel_type().name(), "custom-inproc-stream");
        assert_eq!(parsed.sender_channel(), 0);
        assert_eq!(parsed.initial_window_size(), 1048576);
        assert_eq!(parsed.maximum_packet_size(), 32768);
    }

    #[test]
    fn test_channel_open_direct_tcpip() {
        let open = ChannelOpen::new(
            ChannelType::DirectTcpip {
                host: "10.0.0.5".to_string(),
                port: 5432,
                originator_address: "127.0.0.1".to_string(),
                originator_port: 53412,
            },
            1,
            1048576,
            32768,
        );
        let parsed = ChannelOpen::from_bytes(&open.to_bytes()).unwrap();

        match parsed.channel_type() {
            ChannelType::DirectTcpip { host, port, .. } => {
                assert_eq!(host, "10.0.0.5");
                assert_eq!(*port, 5432);
            }
            other => panic!("Expected DirectTcpip, got {:?}", other),
        }
    }

    #[test]
    fn test_channel_open_unknown_type() {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::ChannelOpen as u8);
        wire::put_string(&mut buf, "x11");
        buf.put_u32(0);
        buf.put_u32(1024);
        buf.put_u32(1024);
        assert!(ChannelOpen::from_bytes(&buf).is_err());
    }

    #[test]
    fn test_channel_open_oversized_window() {
        let open = ChannelOpen::new(ChannelType::Session, 0, MAX_WINDOW_SIZE, 32768);
        let mut bytes = open.to_bytes();
        // Bump the advertised window past the cap.
        let window_offset = bytes.len() - 8;
        bytes[window_offset..window_offset + 4]
            .copy_from_slice(&(MAX_WINDOW_SIZE + 1).to_be_bytes());
        assert!(ChannelOpen::from_bytes(&bytes).is_err());
    }

    #[test]
    fn test_confirmation_round_trip() {
        let confirm = ChannelOpenConfirmation::new(0, 1, 1048576, 32768);
        let parsed = ChannelOpenConfirmation::from_bytes(&confirm.to_bytes()).unwrap();
        assert_eq!(parsed, confirm);
    }

    #[test]
    fn test_open_failure_round_trip() {
        let failure = ChannelOpenFailure::new(3, ChannelOpenFailureReason::ConnectFailed);
        let parsed = ChannelOpenFailure::from_bytes(&failure.to_bytes()).unwrap();
        assert_eq!(parsed.recipient_channel(), 3);
        assert_eq!(parsed.reason_code(), ChannelOpenFailureReason::ConnectFailed);
        assert_eq!(parsed.description(), "Connect failed");
    }

    #[test]
    fn test_window_adjust_round_trip() {
        let adjust = ChannelWindowAdjust::new(0, 524288);
        let parsed = ChannelWindowAdjust::from_bytes(&adjust.to_bytes()).unwrap();
        assert_eq!(parsed.bytes_to_add(), 524288);
    }

    #[test]
    fn test_data_round_trip() {
        let data = ChannelData::new(7, b"stream bytes".to_vec());
        let parsed = ChannelData::from_bytes(&data.to_bytes()).unwrap();
        assert_eq!(parsed.recipient_channel(), 7);
        assert_eq!(parsed.data(), b"stream bytes");
    }

    #[test]
    fn test_extended_data_round_trip() {
        let data = ChannelExtendedData::new(0, ExtendedDataType::Stderr, b"oops".to_vec());
        let parsed = ChannelExtendedData::from_bytes(&data.to_bytes()).unwrap();
        assert_eq!(parsed.data_type_code(), ExtendedDataType::Stderr);
        assert_eq!(parsed.data(), b"oops");
    }

    #[test]
    fn test_eof_close_round_trip() {
        let eof = ChannelEof::new(2);
        assert_eq!(ChannelEof::from_bytes(&eof.to_bytes()).unwrap(), eof);

        let close = ChannelClose::new(2);
        assert_eq!(ChannelClose::from_bytes(&close.to_bytes()).unwrap(), close);
    }

    #[test]
    fn test_keepalive_request_round_trip() {
        let request = ChannelRequest::new(0, ChannelRequestType::Keepalive, true);
        let parsed = ChannelRequest::from_bytes(&request.to_bytes()).unwrap();
        assert_eq!(parsed.request_type(), &ChannelRequestType::Keepalive);
        assert!(parsed.want_reply());
    }

    #[test]
    fn test_exit_status_round_trip() {
        let request =
            ChannelRequest::new(0, ChannelRequestType::ExitStatus { exit_status: 7 }, false);
        let parsed = ChannelRequest::from_bytes(&request.to_bytes()).unwrap();
        match parsed.request_type() {
            ChannelRequestType::ExitStatus { exit_status } => assert_eq!(*exit_status, 7),
            other => panic!("Expected ExitStatus, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_request_kept_verbatim() {
        let request = ChannelRequest::new(
            0,
            ChannelRequestType::Other {
                name: "env".to_string(),
                data: b"payload".to_vec(),
            },
            false,
        );
        let parsed = ChannelRequest::from_bytes(&request.to_bytes()).unwrap();
        assert_eq!(parsed, request);
    }

    #[test]
    fn test_success_failure_round_trip() {
        let success = ChannelSuccess::new(1);
        assert_eq!(
            ChannelSuccess::from_bytes(&success.to_bytes()).unwrap(),
            success
        );

        let failure = ChannelFailure::new(1);
        assert_eq!(
            ChannelFailure::from_bytes(&failure.to_bytes()).unwrap(),
            failure
        );
    }
}
