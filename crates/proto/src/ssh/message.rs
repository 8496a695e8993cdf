//! SSH protocol message types (RFC 4250 Section 4.1).
//!
//! This module defines the unambiguous SSH message numbers, the disconnect
//! reason codes, and the transport-layer generic messages (DISCONNECT,
//! IGNORE, DEBUG, UNIMPLEMENTED, SERVICE_REQUEST, SERVICE_ACCEPT).
//!
//! Message numbers 30-49 are reserved for the key-exchange method in use
//! and are reused between methods; those live as constants next to the kex
//! implementations instead of in [`MessageType`].
//!
//! # Example
//!
//! ```rust
//! use skiff_proto::ssh::message::MessageType;
//!
//! let msg_type = MessageType::KexInit;
//! assert_eq!(msg_type as u8, 20);
//! ```

use bytes::BytesMut;
use skiff_platform::{SkiffError, SkiffResult};

use crate::ssh::wire;

/// SSH message types with fixed numbers (RFC 4250 Section 4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    // Transport layer generic (1-19)
    /// Disconnect message - terminates the connection.
    Disconnect = 1,
    /// Ignore message - may carry arbitrary data, always discarded.
    Ignore = 2,
    /// Unimplemented message - response to an unknown message number.
    Unimplemented = 3,
    /// Debug message - debugging information.
    Debug = 4,
    /// Service request - request a service (e.g. "ssh-userauth").
    ServiceRequest = 5,
    /// Service accept - service request accepted.
    ServiceAccept = 6,
    /// Extension info (RFC 8308), tolerated but not acted upon.
    ExtInfo = 7,

    // Algorithm negotiation (20-29)
    /// Key exchange init - algorithm negotiation.
    KexInit = 20,
    /// New keys - newly derived keys take effect.
    NewKeys = 21,

    // User authentication generic (50-79)
    /// User authentication request.
    UserauthRequest = 50,
    /// User authentication failure.
    UserauthFailure = 51,
    /// User authentication success.
    UserauthSuccess = 52,
    /// User authentication banner.
    UserauthBanner = 53,

    // Connection protocol generic (80-127)
    /// Global request.
    GlobalRequest = 80,
    /// Global request success.
    RequestSuccess = 81,
    /// Global request failure.
    RequestFailure = 82,
    /// Channel open.
    ChannelOpen = 90,
    /// Channel open confirmation.
    ChannelOpenConfirmation = 91,
    /// Channel open failure.
    ChannelOpenFailure = 92,
    /// Channel window adjust.
    ChannelWindowAdjust = 93,
    /// Channel data.
    ChannelData = 94,
    /// Channel extended data (stderr).
    ChannelExtendedData = 95,
    /// Channel EOF.
    ChannelEof = 96,
    /// Channel close.
    ChannelClose = 97,
    /// Channel request.
    ChannelRequest = 98,
    /// Channel success.
    ChannelSuccess = 99,
    /// Channel failure.
    ChannelFailure = 100,
}

impl MessageType {
    /// Converts a byte to a message type.
    ///
    /// Returns `None` for unknown numbers and for the method-specific kex
    /// range (30-49), which only the active kex method can interpret.
    pub fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(MessageType::Disconnect),
            2 => Some(MessageType::Ignore),
            3 => Some(MessageType::Unimplemented),
            4 => Some(MessageType::Debug),
            5 => Some(MessageType::ServiceRequest),
            6 => Some(MessageType::ServiceAccept),
            7 => Some(MessageType::ExtInfo),
            20 => Some(MessageType::KexInit),
            21 => Some(MessageType::NewKeys),
            50 => Some(MessageType::UserauthRequest),
            51 => Some(MessageType::UserauthFailure),
            52 => Some(MessageType::UserauthSuccess),
            53 => Some(MessageType::UserauthBanner),
            80 => Some(MessageType::GlobalRequest),
            81 => Some(MessageType::RequestSuccess),
            82 => Some(MessageType::RequestFailure),
            90 => Some(MessageType::ChannelOpen),
            91 => Some(MessageType::ChannelOpenConfirmation),
            92 => Some(MessageType::ChannelOpenFailure),
            93 => Some(MessageType::ChannelWindowAdjust),
            94 => Some(MessageType::ChannelData),
            95 => Some(MessageType::ChannelExtendedData),
            96 => Some(MessageType::ChannelEof),
            97 => Some(MessageType::ChannelClose),
            98 => Some(MessageType::ChannelRequest),
            99 => Some(MessageType::ChannelSuccess),
            100 => Some(MessageType::ChannelFailure),
            _ => None,
        }
    }

    /// Returns the message type name.
    pub fn name(&self) -> &'static str {
        match self {
            MessageType::Disconnect => "SSH_MSG_DISCONNECT",
            MessageType::Ignore => "SSH_MSG_IGNORE",
            MessageType::Unimplemented => "SSH_MSG_UNIMPLEMENTED",
            MessageType::Debug => "SSH_MSG_DEBUG",
            MessageType::ServiceRequest => "SSH_MSG_SERVICE_REQUEST",
            MessageType::ServiceAccept => "SSH_MSG_SERVICE_ACCEPT",
            MessageType::ExtInfo => "SSH_MSG_EXT_INFO",
            MessageType::KexInit => "SSH_MSG_KEXINIT",
            MessageType::NewKeys => "SSH_MSG_NEWKEYS",
            MessageType::UserauthRequest => "SSH_MSG_USERAUTH_REQUEST",
            MessageType::UserauthFailure => "SSH_MSG_USERAUTH_FAILURE",
            MessageType::UserauthSuccess => "SSH_MSG_USERAUTH_SUCCESS",
            MessageType::UserauthBanner => "SSH_MSG_USERAUTH_BANNER",
            MessageType::GlobalRequest => "SSH_MSG_GLOBAL_REQUEST",
            MessageType::RequestSuccess => "SSH_MSG_REQUEST_SUCCESS",
            MessageType::RequestFailure => "SSH_MSG_REQUEST_FAILURE",
            MessageType::ChannelOpen => "SSH_MSG_CHANNEL_OPEN",
            MessageType::ChannelOpenConfirmation => "SSH_MSG_CHANNEL_OPEN_CONFIRMATION",
            MessageType::ChannelOpenFailure => "SSH_MSG_CHANNEL_OPEN_FAILURE",
            MessageType::ChannelWindowAdjust => "SSH_MSG_CHANNEL_WINDOW_ADJUST",
            MessageType::ChannelData => "SSH_MSG_CHANNEL_DATA",
            MessageType::ChannelExtendedData => "SSH_MSG_CHANNEL_EXTENDED_DATA",
            MessageType::ChannelEof => "SSH_MSG_CHANNEL_EOF",
            MessageType::ChannelClose => "SSH_MSG_CHANNEL_CLOSE",
            MessageType::ChannelRequest => "SSH_MSG_CHANNEL_REQUEST",
            MessageType::ChannelSuccess => "SSH_MSG_CHANNEL_SUCCESS",
            MessageType::ChannelFailure => "SSH_MSG_CHANNEL_FAILURE",
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({})", self.name(), *self as u8)
    }
}

/// Disconnect reason codes (RFC 4250 Section 3.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum DisconnectReason {
    /// SSH_DISCONNECT_HOST_NOT_ALLOWED_TO_CONNECT
    HostNotAllowedToConnect = 1,
    /// SSH_DISCONNECT_PROTOCOL_ERROR
    ProtocolError = 2,
    /// SSH_DISCONNECT_KEY_EXCHANGE_FAILED
    KeyExchangeFailed = 3,
    /// SSH_DISCONNECT_RESERVED
    Reserved = 4,
    /// SSH_DISCONNECT_MAC_ERROR
    MacError = 5,
    /// SSH_DISCONNECT_COMPRESSION_ERROR
    CompressionError = 6,
    /// SSH_DISCONNECT_SERVICE_NOT_AVAILABLE
    ServiceNotAvailable = 7,
    /// SSH_DISCONNECT_PROTOCOL_VERSION_NOT_SUPPORTED
    ProtocolVersionNotSupported = 8,
    /// SSH_DISCONNECT_HOST_KEY_NOT_VERIFIABLE
    HostKeyNotVerifiable = 9,
    /// SSH_DISCONNECT_CONNECTION_LOST
    ConnectionLost = 10,
    /// SSH_DISCONNECT_BY_APPLICATION
    ByApplication = 11,
    /// SSH_DISCONNECT_TOO_MANY_CONNECTIONS
    TooManyConnections = 12,
    /// SSH_DISCONNECT_AUTH_CANCELLED_BY_USER
    AuthCancelledByUser = 13,
    /// SSH_DISCONNECT_NO_MORE_AUTH_METHODS_AVAILABLE
    NoMoreAuthMethodsAvailable = 14,
    /// SSH_DISCONNECT_ILLEGAL_USER_NAME
    IllegalUserName = 15,
}

/// SSH_MSG_DISCONNECT (RFC 4253 Section 11.1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Disconnect {
    /// Reason code per RFC 4250 Section 3.2.
    pub reason_code: u32,
    /// Human-readable description.
    pub description: String,
    /// Language tag (usually empty).
    pub language: String,
}

impl Disconnect {
    /// Creates a new disconnect message.
    pub fn new(reason: DisconnectReason, description: &str) -> Self {
        Self {
            reason_code: reason as u32,
            description: description.to_string(),
            language: String::new(),
        }
    }

    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        wire::write_u8(&mut buf, MessageType::Disconnect as u8);
        wire::write_u32(&mut buf, self.reason_code);
        wire::write_utf8(&mut buf, &self.description);
        wire::write_utf8(&mut buf, &self.language);
        buf.to_vec()
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> SkiffResult<Self> {
        let mut offset = 0;
        let msg_type = wire::read_u8(data, &mut offset)?;
        if msg_type != MessageType::Disconnect as u8 {
            return Err(SkiffError::Protocol(format!(
                "expected SSH_MSG_DISCONNECT, got {}",
                msg_type
            )));
        }
        let reason_code = wire::read_u32(data, &mut offset)?;
        let description = String::from_utf8_lossy(&wire::read_string(data, &mut offset)?).into_owned();
        let language = String::from_utf8_lossy(&wire::read_string(data, &mut offset)?).into_owned();
        Ok(Self {
            reason_code,
            description,
            language,
        })
    }
}

/// SSH_MSG_DEBUG (RFC 4253 Section 11.3).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DebugMsg {
    /// Whether the message should be displayed unconditionally.
    pub always_display: bool,
    /// The debug text.
    pub message: String,
    /// Language tag.
    pub language: String,
}

impl DebugMsg {
    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> SkiffResult<Self> {
        let mut offset = 0;
        let msg_type = wire::read_u8(data, &mut offset)?;
        if msg_type != MessageType::Debug as u8 {
            return Err(SkiffError::Protocol(format!(
                "expected SSH_MSG_DEBUG, got {}",
                msg_type
            )));
        }
        let always_display = wire::read_bool(data, &mut offset)?;
        let message = String::from_utf8_lossy(&wire::read_string(data, &mut offset)?).into_owned();
        let language = String::from_utf8_lossy(&wire::read_string(data, &mut offset)?).into_owned();
        Ok(Self {
            always_display,
            message,
            language,
        })
    }
}

/// SSH_MSG_UNIMPLEMENTED (RFC 4253 Section 11.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Unimplemented {
    /// Sequence number of the rejected packet.
    pub sequence_number: u32,
}

impl Unimplemented {
    /// Creates a new unimplemented message for the given sequence number.
    pub fn new(sequence_number: u32) -> Self {
        Self { sequence_number }
    }

    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        wire::write_u8(&mut buf, MessageType::Unimplemented as u8);
        wire::write_u32(&mut buf, self.sequence_number);
        buf.to_vec()
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> SkiffResult<Self> {
        let mut offset = 0;
        let msg_type = wire::read_u8(data, &mut offset)?;
        if msg_type != MessageType::Unimplemented as u8 {
            return Err(SkiffError::Protocol(format!(
                "expected SSH_MSG_UNIMPLEMENTED, got {}",
                msg_type
            )));
        }
        Ok(Self {
            sequence_number: wire::read_u32(data, &mut offset)?,
        })
    }
}

/// SSH_MSG_SERVICE_REQUEST (RFC 4253 Section 10).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceRequest {
    /// Requested service name, e.g. "ssh-userauth".
    pub service: String,
}

impl ServiceRequest {
    /// Creates a new service request.
    pub fn new(service: &str) -> Self {
        Self {
            service: service.to_string(),
        }
    }

    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        wire::write_u8(&mut buf, MessageType::ServiceRequest as u8);
        wire::write_utf8(&mut buf, &self.service);
        buf.to_vec()
    }
}

/// SSH_MSG_SERVICE_ACCEPT (RFC 4253 Section 10).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceAccept {
    /// Accepted service name.
    pub service: String,
}

impl ServiceAccept {
    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> SkiffResult<Self> {
        let mut offset = 0;
        let msg_type = wire::read_u8(data, &mut offset)?;
        if msg_type != MessageType::ServiceAccept as u8 {
            return Err(SkiffError::Protocol(format!(
                "expected SSH_MSG_SERVICE_ACCEPT, got {}",
                msg_type
            )));
        }
        Ok(Self {
            service: wire::read_utf8(data, &mut offset)?,
        })
    }
}

/// Creates an SSH_MSG_IGNORE message with the given opaque payload.
pub fn ignore_message(data: &[u8]) -> Vec<u8> {
    let mut buf = BytesMut::new();
    wire::write_u8(&mut buf, MessageType::Ignore as u8);
    wire::write_string(&mut buf, data);
    buf.to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_type_conversion() {
        assert_eq!(MessageType::from_u8(20), Some(MessageType::KexInit));
        assert_eq!(MessageType::from_u8(21), Some(MessageType::NewKeys));
        assert_eq!(MessageType::from_u8(255), None);
        // The kex-specific range stays opaque here.
        assert_eq!(MessageType::from_u8(30), None);
        assert_eq!(MessageType::from_u8(34), None);
    }

    #[test]
    fn test_message_type_values() {
        assert_eq!(MessageType::Disconnect as u8, 1);
        assert_eq!(MessageType::KexInit as u8, 20);
        assert_eq!(MessageType::NewKeys as u8, 21);
        assert_eq!(MessageType::ChannelData as u8, 94);
    }

    #[test]
    fn test_message_type_display() {
        assert_eq!(format!("{}", MessageType::KexInit), "SSH_MSG_KEXINIT(20)");
    }

    #[test]
    fn test_disconnect_round_trip() {
        let msg = Disconnect::new(DisconnectReason::ProtocolError, "sequence error");
        let bytes = msg.to_bytes();
        assert_eq!(bytes[0], 1);
        let parsed = Disconnect::from_bytes(&bytes).unwrap();
        assert_eq!(parsed, msg);
        assert_eq!(parsed.reason_code, 2);
    }

    #[test]
    fn test_unimplemented_round_trip() {
        let msg = Unimplemented::new(42);
        let parsed = Unimplemented::from_bytes(&msg.to_bytes()).unwrap();
        assert_eq!(parsed.sequence_number, 42);
    }

    #[test]
    fn test_service_request_bytes() {
        let msg = ServiceRequest::new("ssh-userauth");
        let bytes = msg.to_bytes();
        assert_eq!(bytes[0], 5);
        assert_eq!(&bytes[5..], b"ssh-userauth");
    }

    #[test]
    fn test_service_accept_parse() {
        let mut buf = BytesMut::new();
        wire::write_u8(&mut buf, 6);
        wire::write_utf8(&mut buf, "ssh-userauth");
        let parsed = ServiceAccept::from_bytes(&buf).unwrap();
        assert_eq!(parsed.service, "ssh-userauth");
    }

    #[test]
    fn test_ignore_message() {
        let msg = ignore_message(b"ping");
        assert_eq!(msg[0], 2);
        let mut offset = 1;
        assert_eq!(wire::read_string(&msg, &mut offset).unwrap(), b"ping");
    }

    #[test]
    fn test_disconnect_reason_codes() {
        assert_eq!(DisconnectReason::ProtocolError as u32, 2);
        assert_eq!(DisconnectReason::MacError as u32, 5);
        assert_eq!(DisconnectReason::ByApplication as u32, 11);
        assert_eq!(DisconnectReason::IllegalUserName as u32, 15);
    }
}
