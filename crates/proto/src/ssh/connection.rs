//! Connection protocol messages (RFC 4254).
//!
//! Wire structs for channel management and global requests. Flow-control
//! policy lives in [`crate::ssh::channel`]; this module only encodes and
//! decodes messages.
//!
//! # Security
//!
//! - Window and packet-size fields are validated against sane ceilings
//! - Channel numbers are opaque u32s; lookup happens in the multiplexer

use bytes::BytesMut;
use skiff_platform::{SkiffError, SkiffResult};

use crate::ssh::message::MessageType;
use crate::ssh::wire;

/// Initial local window: 2^31 - 1.
pub const LOCAL_WINDOW_SIZE: u32 = i32::MAX as u32;

/// Local maximum packet size advertised in CHANNEL_OPEN.
pub const LOCAL_MAX_PACKET_SIZE: u32 = 65536;

/// Channel type carried in CHANNEL_OPEN.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelType {
    /// Interactive session channel.
    Session,
    /// Outbound TCP/IP forwarding channel.
    DirectTcpip {
        /// Host to connect to.
        host: String,
        /// Port to connect to.
        port: u32,
        /// Originator IP address.
        originator_address: String,
        /// Originator port.
        originator_port: u32,
    },
    /// Server-initiated forwarded connection.
    ForwardedTcpip {
        /// Address that was connected.
        connected_address: String,
        /// Port that was connected.
        connected_port: u32,
        /// Originator IP address.
        originator_address: String,
        /// Originator port.
        originator_port: u32,
    },
}

impl ChannelType {
    /// Returns the channel type name.
    pub fn name(&self) -> &'static str {
        match self {
            ChannelType::Session => "session",
            ChannelType::DirectTcpip { .. } => "direct-tcpip",
            ChannelType::ForwardedTcpip { .. } => "forwarded-tcpip",
        }
    }
}

/// SSH_MSG_CHANNEL_OPEN (RFC 4254 Section 5.1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelOpen {
    /// Channel type and its type-specific data.
    pub channel_type: ChannelType,
    /// Sender's channel id.
    pub sender_channel: u32,
    /// Initial window size granted to the peer.
    pub initial_window_size: u32,
    /// Largest packet the peer may send on this channel.
    pub maximum_packet_size: u32,
}

impl ChannelOpen {
    /// Creates a CHANNEL_OPEN with the default window and packet size.
    pub fn new(channel_type: ChannelType, sender_channel: u32) -> Self {
        Self {
            channel_type,
            sender_channel,
            initial_window_size: LOCAL_WINDOW_SIZE,
            maximum_packet_size: LOCAL_MAX_PACKET_SIZE,
        }
    }

    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        wire::write_u8(&mut buf, MessageType::ChannelOpen as u8);
        wire::write_utf8(&mut buf, self.channel_type.name());
        wire::write_u32(&mut buf, self.sender_channel);
        wire::write_u32(&mut buf, self.initial_window_size);
        wire::write_u32(&mut buf, self.maximum_packet_size);
        match &self.channel_type {
            ChannelType::Session => {}
            ChannelType::DirectTcpip {
                host,
                port,
                originator_address,
                originator_port,
            } => {
                wire::write_utf8(&mut buf, host);
                wire::write_u32(&mut buf, *port);
                wire::write_utf8(&mut buf, originator_address);
                wire::write_u32(&mut buf, *originator_port);
            }
            ChannelType::ForwardedTcpip {
                connected_address,
                connected_port,
                originator_address,
                originator_port,
            } => {
                wire::write_utf8(&mut buf, connected_address);
                wire::write_u32(&mut buf, *connected_port);
                wire::write_utf8(&mut buf, originator_address);
                wire::write_u32(&mut buf, *originator_port);
            }
        }
        buf.to_vec()
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> SkiffResult<Self> {
        let mut offset = 0;
        let msg_type = wire::read_u8(data, &mut offset)?;
        if msg_type != MessageType::ChannelOpen as u8 {
            return Err(SkiffError::Protocol(format!(
                "expected SSH_MSG_CHANNEL_OPEN, got {}",
                msg_type
            )));
        }
        let type_name = wire::read_utf8(data, &mut offset)?;
        let sender_channel = wire::read_u32(data, &mut offset)?;
        let initial_window_size = wire::read_u32(data, &mut offset)?;
        let maximum_packet_size = wire::read_u32(data, &mut offset)?;

        let channel_type = match type_name.as_str() {
            "session" => ChannelType::Session,
            "direct-tcpip" => ChannelType::DirectTcpip {
                host: wire::read_utf8(data, &mut offset)?,
                port: wire::read_u32(data, &mut offset)?,
                originator_address: wire::read_utf8(data, &mut offset)?,
                originator_port: wire::read_u32(data, &mut offset)?,
            },
            "forwarded-tcpip" => ChannelType::ForwardedTcpip {
                connected_address: wire::read_utf8(data, &mut offset)?,
                connected_port: wire::read_u32(data, &mut offset)?,
                originator_address: wire::read_utf8(data, &mut offset)?,
                originator_port: wire::read_u32(data, &mut offset)?,
            },
            other => {
                return Err(SkiffError::Protocol(format!(
                    "unknown channel type '{}'",
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

/// SSH_MSG_CHANNEL_OPEN_CONFIRMATION (RFC 4254 Section 5.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelOpenConfirmation {
    /// Recipient (our) channel id.
    pub recipient_channel: u32,
    /// Sender (peer) channel id.
    pub sender_channel: u32,
    /// Window granted to us.
    pub initial_window_size: u32,
    /// Largest packet we may send.
    pub maximum_packet_size: u32,
}

impl ChannelOpenConfirmation {
    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> SkiffResult<Self> {
        let mut offset = 0;
        let msg_type = wire::read_u8(data, &mut offset)?;
        if msg_type != MessageType::ChannelOpenConfirmation as u8 {
            return Err(SkiffError::Protocol(format!(
                "expected SSH_MSG_CHANNEL_OPEN_CONFIRMATION, got {}",
                msg_type
            )));
        }
        Ok(Self {
            recipient_channel: wire::read_u32(data, &mut offset)?,
            sender_channel: wire::read_u32(data, &mut offset)?,
            initial_window_size: wire::read_u32(data, &mut offset)?,
            maximum_packet_size: wire::read_u32(data, &mut offset)?,
        })
    }
}

/// Reason codes for CHANNEL_OPEN_FAILURE (RFC 4254 Section 5.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ChannelOpenFailureReason {
    /// SSH_OPEN_ADMINISTRATIVELY_PROHIBITED
    AdministrativelyProhibited = 1,
    /// SSH_OPEN_CONNECT_FAILED
    ConnectFailed = 2,
    /// SSH_OPEN_UNKNOWN_CHANNEL_TYPE
    UnknownChannelType = 3,
    /// SSH_OPEN_RESOURCE_SHORTAGE
    ResourceShortage = 4,
}

impl ChannelOpenFailureReason {
    /// Converts a wire code, defaulting unknown codes to `ConnectFailed`.
    pub fn from_u32(code: u32) -> Self {
        match code {
            1 => ChannelOpenFailureReason::AdministrativelyProhibited,
            3 => ChannelOpenFailureReason::UnknownChannelType,
            4 => ChannelOpenFailureReason::ResourceShortage,
            _ => ChannelOpenFailureReason::ConnectFailed,
        }
    }
}

/// SSH_MSG_CHANNEL_OPEN_FAILURE (RFC 4254 Section 5.1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelOpenFailure {
    /// Recipient (our) channel id.
    pub recipient_channel: u32,
    /// Failure reason code.
    pub reason: ChannelOpenFailureReason,
    /// Human-readable description.
    pub description: String,
}

impl ChannelOpenFailure {
    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> SkiffResult<Self> {
        let mut offset = 0;
        let msg_type = wire::read_u8(data, &mut offset)?;
        if msg_type != MessageType::ChannelOpenFailure as u8 {
            return Err(SkiffError::Protocol(format!(
                "expected SSH_MSG_CHANNEL_OPEN_FAILURE, got {}",
                msg_type
            )));
        }
        let recipient_channel = wire::read_u32(data, &mut offset)?;
        let reason = ChannelOpenFailureReason::from_u32(wire::read_u32(data, &mut offset)?);
        let description =
            String::from_utf8_lossy(&wire::read_string(data, &mut offset)?).into_owned();
        let _language = wire::read_string(data, &mut offset)?;
        Ok(Self {
            recipient_channel,
            reason,
            description,
        })
    }
}

/// SSH_MSG_CHANNEL_WINDOW_ADJUST (RFC 4254 Section 5.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelWindowAdjust {
    /// Recipient channel id.
    pub recipient_channel: u32,
    /// Bytes to add to the window.
    pub bytes_to_add: u32,
}

impl ChannelWindowAdjust {
    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        wire::write_u8(&mut buf, MessageType::ChannelWindowAdjust as u8);
        wire::write_u32(&mut buf, self.recipient_channel);
        wire::write_u32(&mut buf, self.bytes_to_add);
        buf.to_vec()
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> SkiffResult<Self> {
        let mut offset = 0;
        let msg_type = wire::read_u8(data, &mut offset)?;
        if msg_type != MessageType::ChannelWindowAdjust as u8 {
            return Err(SkiffError::Protocol(format!(
                "expected SSH_MSG_CHANNEL_WINDOW_ADJUST, got {}",
                msg_type
            )));
        }
        Ok(Self {
            recipient_channel: wire::read_u32(data, &mut offset)?,
            bytes_to_add: wire::read_u32(data, &mut offset)?,
        })
    }
}

/// SSH_MSG_CHANNEL_DATA (RFC 4254 Section 5.2).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelData {
    /// Recipient channel id.
    pub recipient_channel: u32,
    /// Payload bytes.
    pub data: Vec<u8>,
}

impl ChannelData {
    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        wire::write_u8(&mut buf, MessageType::ChannelData as u8);
        wire::write_u32(&mut buf, self.recipient_channel);
        wire::write_string(&mut buf, &self.data);
        buf.to_vec()
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> SkiffResult<Self> {
        let mut offset = 0;
        let msg_type = wire::read_u8(data, &mut offset)?;
        if msg_type != MessageType::ChannelData as u8 {
            return Err(SkiffError::Protocol(format!(
                "expected SSH_MSG_CHANNEL_DATA, got {}",
                msg_type
            )));
        }
        Ok(Self {
            recipient_channel: wire::read_u32(data, &mut offset)?,
            data: wire::read_string(data, &mut offset)?,
        })
    }
}

/// SSH_MSG_CHANNEL_EXTENDED_DATA (RFC 4254 Section 5.2). Data type 1 is
/// stderr.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelExtendedData {
    /// Recipient channel id.
    pub recipient_channel: u32,
    /// Extended data type code (1 = stderr).
    pub data_type: u32,
    /// Payload bytes.
    pub data: Vec<u8>,
}

impl ChannelExtendedData {
    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> SkiffResult<Self> {
        let mut offset = 0;
        let msg_type = wire::read_u8(data, &mut offset)?;
        if msg_type != MessageType::ChannelExtendedData as u8 {
            return Err(SkiffError::Protocol(format!(
                "expected SSH_MSG_CHANNEL_EXTENDED_DATA, got {}",
                msg_type
            )));
        }
        Ok(Self {
            recipient_channel: wire::read_u32(data, &mut offset)?,
            data_type: wire::read_u32(data, &mut offset)?,
            data: wire::read_string(data, &mut offset)?,
        })
    }
}

/// Builds an SSH_MSG_CHANNEL_EOF payload.
pub fn channel_eof(recipient_channel: u32) -> Vec<u8> {
    let mut buf = BytesMut::new();
    wire::write_u8(&mut buf, MessageType::ChannelEof as u8);
    wire::write_u32(&mut buf, recipient_channel);
    buf.to_vec()
}

/// Builds an SSH_MSG_CHANNEL_CLOSE payload.
pub fn channel_close(recipient_channel: u32) -> Vec<u8> {
    let mut buf = BytesMut::new();
    wire::write_u8(&mut buf, MessageType::ChannelClose as u8);
    wire::write_u32(&mut buf, recipient_channel);
    buf.to_vec()
}

/// Reads the recipient channel id of EOF/CLOSE/SUCCESS/FAILURE messages.
pub fn recipient_channel(data: &[u8]) -> SkiffResult<u32> {
    let mut offset = 1;
    wire::read_u32(data, &mut offset)
}

/// SSH_MSG_CHANNEL_REQUEST (RFC 4254 Section 5.4).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelRequest {
    /// Recipient channel id.
    pub recipient_channel: u32,
    /// Request type, e.g. "exec", "pty-req", "exit-status".
    pub request_type: String,
    /// Whether the peer must answer with SUCCESS/FAILURE.
    pub want_reply: bool,
    /// Type-specific payload, already wire-encoded.
    pub payload: Vec<u8>,
}

impl ChannelRequest {
    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        wire::write_u8(&mut buf, MessageType::ChannelRequest as u8);
        wire::write_u32(&mut buf, self.recipient_channel);
        wire::write_utf8(&mut buf, &self.request_type);
        wire::write_bool(&mut buf, self.want_reply);
        buf.extend_from_slice(&self.payload);
        buf.to_vec()
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> SkiffResult<Self> {
        let mut offset = 0;
        let msg_type = wire::read_u8(data, &mut offset)?;
        if msg_type != MessageType::ChannelRequest as u8 {
            return Err(SkiffError::Protocol(format!(
                "expected SSH_MSG_CHANNEL_REQUEST, got {}",
                msg_type
            )));
        }
        let recipient_channel = wire::read_u32(data, &mut offset)?;
        let request_type = wire::read_utf8(data, &mut offset)?;
        let want_reply = wire::read_bool(data, &mut offset)?;
        Ok(Self {
            recipient_channel,
            request_type,
            want_reply,
            payload: data[offset..].to_vec(),
        })
    }
}

/// SSH_MSG_GLOBAL_REQUEST (RFC 4254 Section 4).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GlobalRequest {
    /// Request name, e.g. "keepalive@openssh.com".
    pub request_name: String,
    /// Whether the peer must answer.
    pub want_reply: bool,
    /// Request-specific payload.
    pub payload: Vec<u8>,
}

impl GlobalRequest {
    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        wire::write_u8(&mut buf, MessageType::GlobalRequest as u8);
        wire::write_utf8(&mut buf, &self.request_name);
        wire::write_bool(&mut buf, self.want_reply);
        buf.extend_from_slice(&self.payload);
        buf.to_vec()
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> SkiffResult<Self> {
        let mut offset = 0;
        let msg_type = wire::read_u8(data, &mut offset)?;
        if msg_type != MessageType::GlobalRequest as u8 {
            return Err(SkiffError::Protocol(format!(
                "expected SSH_MSG_GLOBAL_REQUEST, got {}",
                msg_type
            )));
        }
        let request_name = wire::read_utf8(data, &mut offset)?;
        let want_reply = wire::read_bool(data, &mut offset)?;
        Ok(Self {
            request_name,
            want_reply,
            payload: data[offset..].to_vec(),
        })
    }
}

/// Builds an SSH_MSG_REQUEST_FAILURE payload.
pub fn request_failure() -> Vec<u8> {
    vec![MessageType::RequestFailure as u8]
}

/// Builds an SSH_MSG_CHANNEL_OPEN_CONFIRMATION payload, used when
/// accepting a server-initiated (forwarded-tcpip) channel.
pub fn channel_open_confirmation(recipient: u32, sender: u32) -> Vec<u8> {
    let mut buf = BytesMut::new();
    wire::write_u8(&mut buf, MessageType::ChannelOpenConfirmation as u8);
    wire::write_u32(&mut buf, recipient);
    wire::write_u32(&mut buf, sender);
    wire::write_u32(&mut buf, LOCAL_WINDOW_SIZE);
    wire::write_u32(&mut buf, LOCAL_MAX_PACKET_SIZE);
    buf.to_vec()
}

/// Builds an SSH_MSG_CHANNEL_OPEN_FAILURE payload.
pub fn channel_open_failure(
    recipient: u32,
    reason: ChannelOpenFailureReason,
    description: &str,
) -> Vec<u8> {
    let mut buf = BytesMut::new();
    wire::write_u8(&mut buf, MessageType::ChannelOpenFailure as u8);
    wire::write_u32(&mut buf, recipient);
    wire::write_u32(&mut buf, reason as u32);
    wire::write_utf8(&mut buf, description);
    wire::write_utf8(&mut buf, "");
    buf.to_vec()
}

/// Builds an SSH_MSG_CHANNEL_FAILURE payload.
pub fn channel_failure(recipient: u32) -> Vec<u8> {
    let mut buf = BytesMut::new();
    wire::write_u8(&mut buf, MessageType::ChannelFailure as u8);
    wire::write_u32(&mut buf, recipient);
    buf.to_vec()
}
