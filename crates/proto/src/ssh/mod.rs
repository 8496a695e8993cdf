//! SSH (Secure Shell) client transport.
//!
//! This module implements the client side of the SSH-2 protocol per
//! RFC 4251-4254 and the widely deployed OpenSSH extensions.
//!
//! # Architecture
//!
//! The implementation is layered:
//!
//! 1. **Wire codec** ([`wire`]) - SSH primitive types (RFC 4251 Section 5)
//! 2. **Packet layer** ([`packet`]) - binary packets, encryption, MAC,
//!    compression, sequence numbers (RFC 4253 Section 6)
//! 3. **Key exchange** ([`kex`], [`kex_dh`], [`kex_ecdh`], [`kex_hybrid`]) -
//!    algorithm negotiation, exchange-hash computation, key derivation
//! 4. **Transport state machine** ([`transport`]) - lifecycle, rekeying,
//!    strict-KEX
//! 5. **Connection layer** ([`connection`], [`channel`]) - multiplexed,
//!    flow-controlled channels (RFC 4254)
//! 6. **Client API** ([`client`]) - connect, authenticate hook, channels
//!
//! # Security Considerations
//!
//! - **Input validation**: packet parsing enforces the 35000-byte limit
//! - **Constant-time comparisons** for MACs and AEAD tags
//! - **Zeroization** of key material and ephemeral secrets on drop
//! - **Strict key exchange** (`kex-strict-*@openssh.com`) against
//!   prefix-truncation attacks
//! - **No unsafe code**
//!
//! # Example
//!
//! ```rust,no_run
//! use skiff_proto::ssh::client::SshClient;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut client = SshClient::connect("127.0.0.1:22").await?;
//! let channel = client.open_session_channel().await?;
//! channel.write(b"hello").await?;
//! # Ok(())
//! # }
//! ```
//!
//! # References
//!
//! - [RFC 4251](https://datatracker.ietf.org/doc/html/rfc4251) - Protocol Architecture
//! - [RFC 4253](https://datatracker.ietf.org/doc/html/rfc4253) - Transport Layer Protocol
//! - [RFC 4254](https://datatracker.ietf.org/doc/html/rfc4254) - Connection Protocol
//! - [OpenSSH PROTOCOL](https://github.com/openssh/openssh-portable/blob/master/PROTOCOL) - strict KEX, AEAD modes

pub mod algorithms;
pub mod auth;
pub mod channel;
pub mod client;
pub mod compress;
pub mod connection;
pub mod crypto;
pub mod hostkey;
pub mod kex;
pub mod kex_dh;
pub mod kex_ecdh;
pub mod kex_hybrid;
pub mod keys;
pub mod message;
pub mod packet;
pub mod session;
pub mod transport;
pub mod version;
pub mod wire;

// Re-export main types
pub use algorithms::{negotiate, AlgorithmCatalog, NegotiatedAlgorithms};
pub use auth::{AuthExchange, AuthOutcome, Authenticator, NoneAuthenticator};
pub use channel::{Channel, ChannelState};
pub use client::{BannerCallback, HostKeyCallback, SshClient, SshClientConfig};
pub use compress::CompressionAlgorithm;
pub use connection::{ChannelOpenFailureReason, ChannelType};
pub use crypto::{CipherAlgorithm, MacAlgorithm};
pub use hostkey::HostKeyAlgorithm;
pub use kex::{KexDriver, KexInit, KexMethod, KexOutcome, KexProgress};
pub use message::{DisconnectReason, MessageType};
pub use packet::{InboundPacket, PacketOpener, PacketSealer, MAX_PACKET_SIZE};
pub use transport::{State, TransportConfig, TransportState};
pub use version::Version;
