//! User authentication hook (RFC 4252 boundary).
//!
//! The authentication sub-protocols themselves (password, public key,
//! keyboard-interactive) live outside the transport core. The core only:
//!
//! - requests the `ssh-userauth` service once the transport is up,
//! - hands control to an [`Authenticator`] with a narrow send/receive
//!   surface ([`AuthExchange`]),
//! - activates delayed compression when the authenticator reports
//!   success.
//!
//! [`NoneAuthenticator`] implements the trivial "none" method, which is
//! enough to drive the hook in tests and against servers that require no
//! credentials.

use async_trait::async_trait;
use bytes::BytesMut;
use skiff_platform::{SkiffError, SkiffResult};
use tracing::debug;

use crate::ssh::client::{BannerCallback, IoReader, PacketSink};
use crate::ssh::message::{Disconnect, MessageType};
use crate::ssh::packet::PacketOpener;
use crate::ssh::wire;

/// Result of an authenticator run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthOutcome {
    /// The server accepted authentication.
    Success,
    /// The authenticator gave up.
    Failure,
}

/// The message surface an authenticator may use.
///
/// Sends go through the session's ordered writer; receives are filtered
/// so that transport chatter (IGNORE, DEBUG) never reaches the
/// authenticator and banners reach the application callback.
pub struct AuthExchange<'a> {
    pub(crate) sink: &'a PacketSink,
    pub(crate) opener: &'a mut PacketOpener,
    pub(crate) io: &'a mut IoReader,
    pub(crate) banner_cb: Option<&'a BannerCallback>,
}

impl AuthExchange<'_> {
    /// Sends one authentication message.
    pub fn send(&self, payload: Vec<u8>) -> SkiffResult<()> {
        self.sink.send_packet(payload)
    }

    /// Receives the next authentication-relevant message.
    pub async fn recv(&mut self) -> SkiffResult<Vec<u8>> {
        loop {
            let packet = self.opener.read_packet(self.io).await?;
            match packet.payload.first().copied().and_then(MessageType::from_u8) {
                Some(MessageType::Ignore) => continue,
                Some(MessageType::Debug) => {
                    debug!("peer debug message during auth");
                    continue;
                }
                Some(MessageType::ExtInfo) => {
                    debug!("ignoring SSH_MSG_EXT_INFO");
                    continue;
                }
                Some(MessageType::UserauthBanner) => {
                    let mut offset = 1;
                    if let Ok(text) = wire::read_utf8(&packet.payload, &mut offset) {
                        if let Some(cb) = self.banner_cb {
                            cb(&text);
                        }
                    }
                    continue;
                }
                Some(MessageType::Disconnect) => {
                    let msg = Disconnect::from_bytes(&packet.payload)?;
                    return Err(SkiffError::Disconnected {
                        code: msg.reason_code,
                        description: msg.description,
                    });
                }
                _ => return Ok(packet.payload),
            }
        }
    }
}

/// Runs the authentication conversation after the transport is up.
#[async_trait]
pub trait Authenticator: Send {
    /// Drives the sub-protocol to completion.
    async fn authenticate(&mut self, exchange: &mut AuthExchange<'_>) -> SkiffResult<AuthOutcome>;
}

/// The "none" authentication method (RFC 4252 Section 5.2).
pub struct NoneAuthenticator {
    /// User name to authenticate as.
    pub username: String,
}

#[async_trait]
impl Authenticator for NoneAuthenticator {
    async fn authenticate(&mut self, exchange: &mut AuthExchange<'_>) -> SkiffResult<AuthOutcome> {
        let mut buf = BytesMut::new();
        wire::write_u8(&mut buf, MessageType::UserauthRequest as u8);
        wire::write_utf8(&mut buf, &self.username);
        wire::write_utf8(&mut buf, "ssh-connection");
        wire::write_utf8(&mut buf, "none");
        exchange.send(buf.to_vec())?;

        let reply = exchange.recv().await?;
        match reply.first().copied().and_then(MessageType::from_u8) {
            Some(MessageType::UserauthSuccess) => Ok(AuthOutcome::Success),
            Some(MessageType::UserauthFailure) => Ok(AuthOutcome::Failure),
            other => Err(SkiffError::Auth(format!(
                "unexpected reply to none auth: {:?}",
                other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_outcome_equality() {
        assert_eq!(AuthOutcome::Success, AuthOutcome::Success);
        assert_ne!(AuthOutcome::Success, AuthOutcome::Failure);
    }
}
