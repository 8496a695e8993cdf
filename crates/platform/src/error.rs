//! Error types for Skiff

use std::fmt;

/// Unified error type for all Skiff operations
#[derive(Debug)]
pub enum SkiffError {
    /// I/O error
    Io(std::io::Error),

    /// Configuration error
    Config(String),

    /// Protocol error: framing violation, unexpected state, unsupported version
    Protocol(String),

    /// A received packet or field could not be decoded
    MalformedPacket(String),

    /// An assembled or received packet exceeds the protocol ceiling
    PacketTooLarge(usize),

    /// Key exchange failed: no common algorithm, bad signature, strict-KEX
    /// violation, or the application rejected the host key
    KexFailed(String),

    /// Integrity check on a received packet failed
    MacFailure,

    /// AEAD open or block decryption failed
    Decryption(String),

    /// The underlying byte stream reached EOF or errored
    ConnectionLost,

    /// A blocking wait exceeded its budget
    Timeout(String),

    /// Authentication error, propagated from the authenticator
    Auth(String),

    /// Operation on a channel that is already closed
    ChannelClosed,

    /// The peer sent SSH_MSG_DISCONNECT
    Disconnected {
        /// Reason code per RFC 4250 Section 3.2
        code: u32,
        /// Human-readable description supplied by the peer
        description: String,
    },

    /// Other error
    Other(Box<dyn std::error::Error + Send + Sync>),
}

impl SkiffError {
    /// Returns whether this error tears down the whole transport.
    ///
    /// Per-operation timeouts, channel-level errors, and authentication
    /// round-trip failures leave the transport usable; everything else is
    /// fatal.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            SkiffError::Timeout(_) | SkiffError::ChannelClosed | SkiffError::Auth(_)
        )
    }
}

impl fmt::Display for SkiffError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkiffError::Io(e) => write!(f, "IO error: {}", e),
            SkiffError::Config(msg) => write!(f, "Configuration error: {}", msg),
            SkiffError::Protocol(msg) => write!(f, "Protocol error: {}", msg),
            SkiffError::MalformedPacket(msg) => write!(f, "Malformed packet: {}", msg),
            SkiffError::PacketTooLarge(size) => {
                write!(f, "Packet too large: {} bytes", size)
            }
            SkiffError::KexFailed(msg) => write!(f, "Key exchange failed: {}", msg),
            SkiffError::MacFailure => write!(f, "MAC verification failed"),
            SkiffError::Decryption(msg) => write!(f, "Decryption failed: {}", msg),
            SkiffError::ConnectionLost => write!(f, "Connection lost"),
            SkiffError::Timeout(msg) => write!(f, "Timed out: {}", msg),
            SkiffError::Auth(msg) => write!(f, "Authentication error: {}", msg),
            SkiffError::ChannelClosed => write!(f, "Channel is closed"),
            SkiffError::Disconnected { code, description } => {
                write!(f, "Disconnected by peer (code {}): {}", code, description)
            }
            SkiffError::Other(e) => write!(f, "Error: {}", e),
        }
    }
}

impl std::error::Error for SkiffError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SkiffError::Io(e) => Some(e),
            SkiffError::Other(e) => Some(e.as_ref()),
            _ => None,
        }
    }
}

impl From<std::io::Error> for SkiffError {
    fn from(err: std::io::Error) -> Self {
        SkiffError::Io(err)
    }
}

/// Result type for Skiff operations
pub type SkiffResult<T> = Result<T, SkiffError>;
