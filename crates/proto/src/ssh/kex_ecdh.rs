//! Elliptic-curve key exchange (RFC 5656, RFC 8731).
//!
//! Implements curve25519-sha256 (and its `@libssh.org` alias) plus
//! ecdh-sha2-nistp256 / nistp384 / nistp521.
//!
//! The wire protocol is the same two-message shape for all curves:
//! the client sends `SSH_MSG_KEX_ECDH_INIT` with its ephemeral public
//! key `Q_C`, the server answers `SSH_MSG_KEX_ECDH_REPLY` with
//! `(K_S, Q_S, sig)`. `K` is the x-coordinate of the shared point
//! (the raw output for X25519), hashed as an mpint.

use bytes::BytesMut;
use p256::elliptic_curve::sec1::ToEncodedPoint;
use skiff_platform::{SkiffError, SkiffResult};

use crate::ssh::kex::{ExchangeContext, HashAlg, KexMethod, KexOutcome, KexProgress};
use crate::ssh::keys::SharedSecret;
use crate::ssh::wire;

/// SSH_MSG_KEX_ECDH_INIT (also used by the hybrid methods).
pub const MSG_KEX_ECDH_INIT: u8 = 30;
/// SSH_MSG_KEX_ECDH_REPLY (also used by the hybrid methods).
pub const MSG_KEX_ECDH_REPLY: u8 = 31;

/// curve25519-sha256 key exchange.
pub struct Curve25519Exchange {
    secret: Option<x25519_dalek::EphemeralSecret>,
    public: [u8; 32],
}

impl Curve25519Exchange {
    /// Generates an ephemeral X25519 key pair.
    pub fn new() -> SkiffResult<Self> {
        let secret = x25519_dalek::EphemeralSecret::random_from_rng(rand::rngs::OsRng);
        let public = x25519_dalek::PublicKey::from(&secret);
        Ok(Self {
            secret: Some(secret),
            public: *public.as_bytes(),
        })
    }
}

impl KexMethod for Curve25519Exchange {
    fn name(&self) -> &'static str {
        "curve25519-sha256"
    }

    fn hash(&self, data: &[u8]) -> Vec<u8> {
        HashAlg::Sha256.digest(data)
    }

    fn start(&mut self, _ctx: &ExchangeContext) -> SkiffResult<Vec<Vec<u8>>> {
        let mut buf = BytesMut::new();
        wire::write_u8(&mut buf, MSG_KEX_ECDH_INIT);
        wire::write_string(&mut buf, &self.public);
        Ok(vec![buf.to_vec()])
    }

    fn on_message(&mut self, payload: &[u8], ctx: &ExchangeContext) -> SkiffResult<KexProgress> {
        let mut offset = 0;
        let msg_type = wire::read_u8(payload, &mut offset)?;
        if msg_type != MSG_KEX_ECDH_REPLY {
            return Err(SkiffError::KexFailed(format!(
                "unexpected message {} during curve25519-sha256",
                msg_type
            )));
        }

        let host_key_blob = wire::read_string(payload, &mut offset)?;
        let server_public = wire::read_string(payload, &mut offset)?;
        let signature_blob = wire::read_string(payload, &mut offset)?;

        let server_array: [u8; 32] = server_public
            .as_slice()
            .try_into()
            .map_err(|_| SkiffError::KexFailed("bad X25519 public key length".to_string()))?;

        let secret = self
            .secret
            .take()
            .ok_or_else(|| SkiffError::KexFailed("duplicate ECDH reply".to_string()))?;
        let shared = secret.diffie_hellman(&x25519_dalek::PublicKey::from(server_array));
        if !shared.was_contributory() {
            return Err(SkiffError::KexFailed(
                "X25519 produced a non-contributory shared secret".to_string(),
            ));
        }
        let k = shared.as_bytes().to_vec();

        let mut hash_input = BytesMut::new();
        ctx.write_hash_prelude(&mut hash_input, &host_key_blob);
        wire::write_string(&mut hash_input, &self.public);
        wire::write_string(&mut hash_input, &server_public);
        wire::write_mpint(&mut hash_input, &k);
        let exchange_hash = self.hash(&hash_input);

        Ok(KexProgress::Done(Box::new(KexOutcome {
            exchange_hash,
            shared_secret: SharedSecret::Mpint(k),
            host_key_blob,
            signature_blob,
        })))
    }
}

/// NIST curves available for ecdh-sha2-*.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NistCurve {
    /// nistp256, hashed with SHA-256.
    P256,
    /// nistp384, hashed with SHA-384.
    P384,
    /// nistp521, hashed with SHA-512.
    P521,
}

impl NistCurve {
    fn hash(&self) -> HashAlg {
        match self {
            NistCurve::P256 => HashAlg::Sha256,
            NistCurve::P384 => HashAlg::Sha384,
            NistCurve::P521 => HashAlg::Sha512,
        }
    }
}

enum EcdhSecret {
    P256(Option<p256::ecdh::EphemeralSecret>),
    P384(Option<p384::ecdh::EphemeralSecret>),
    P521(Option<p521::ecdh::EphemeralSecret>),
}

/// ecdh-sha2-nistp{256,384,521} key exchange.
pub struct EcdhExchange {
    curve: NistCurve,
    secret: EcdhSecret,
    /// Uncompressed SEC1 encoding of our ephemeral public key.
    public: Vec<u8>,
}

impl EcdhExchange {
    /// Generates an ephemeral key pair on the given curve.
    pub fn new(curve: NistCurve) -> SkiffResult<Self> {
        let mut rng = rand::rngs::OsRng;
        let (secret, public) = match curve {
            NistCurve::P256 => {
                let secret = p256::ecdh::EphemeralSecret::random(&mut rng);
                let public = secret.public_key().to_encoded_point(false).as_bytes().to_vec();
                (EcdhSecret::P256(Some(secret)), public)
            }
            NistCurve::P384 => {
                let secret = p384::ecdh::EphemeralSecret::random(&mut rng);
                let public = secret.public_key().to_encoded_point(false).as_bytes().to_vec();
                (EcdhSecret::P384(Some(secret)), public)
            }
            NistCurve::P521 => {
                let secret = p521::ecdh::EphemeralSecret::random(&mut rng);
                let public = secret.public_key().to_encoded_point(false).as_bytes().to_vec();
                (EcdhSecret::P521(Some(secret)), public)
            }
        };
        Ok(Self {
            curve,
            secret,
            public,
        })
    }

    fn shared_secret(&mut self, server_public: &[u8]) -> SkiffResult<Vec<u8>> {
        let invalid = || SkiffError::KexFailed("invalid server ECDH public key".to_string());
        let spent = || SkiffError::KexFailed("duplicate ECDH reply".to_string());
        match &mut self.secret {
            EcdhSecret::P256(secret) => {
                let peer = p256::PublicKey::from_sec1_bytes(server_public).map_err(|_| invalid())?;
                let secret = secret.take().ok_or_else(spent)?;
                Ok(secret.diffie_hellman(&peer).raw_secret_bytes().to_vec())
            }
            EcdhSecret::P384(secret) => {
                let peer = p384::PublicKey::from_sec1_bytes(server_public).map_err(|_| invalid())?;
                let secret = secret.take().ok_or_else(spent)?;
                Ok(secret.diffie_hellman(&peer).raw_secret_bytes().to_vec())
            }
            EcdhSecret::P521(secret) => {
                let peer = p521::PublicKey::from_sec1_bytes(server_public).map_err(|_| invalid())?;
                let secret = secret.take().ok_or_else(spent)?;
                Ok(secret.diffie_hellman(&peer).raw_secret_bytes().to_vec())
            }
        }
    }
}

impl KexMethod for EcdhExchange {
    fn name(&self) -> &'static str {
        match self.curve {
            NistCurve::P256 => "ecdh-sha2-nistp256",
            NistCurve::P384 => "ecdh-sha2-nistp384",
            NistCurve::P521 => "ecdh-sha2-nistp521",
        }
    }

    fn hash(&self, data: &[u8]) -> Vec<u8> {
        self.curve.hash().digest(data)
    }

    fn start(&mut self, _ctx: &ExchangeContext) -> SkiffResult<Vec<Vec<u8>>> {
        let mut buf = BytesMut::new();
        wire::write_u8(&mut buf, MSG_KEX_ECDH_INIT);
        wire::write_string(&mut buf, &self.public);
        Ok(vec![buf.to_vec()])
    }

    fn on_message(&mut self, payload: &[u8], ctx: &ExchangeContext) -> SkiffResult<KexProgress> {
        let mut offset = 0;
        let msg_type = wire::read_u8(payload, &mut offset)?;
        if msg_type != MSG_KEX_ECDH_REPLY {
            return Err(SkiffError::KexFailed(format!(
                "unexpected message {} during {}",
                msg_type,
                self.name()
            )));
        }

        let host_key_blob = wire::read_string(payload, &mut offset)?;
        let server_public = wire::read_string(payload, &mut offset)?;
        let signature_blob = wire::read_string(payload, &mut offset)?;

        // The x-coordinate, big-endian with leading zeros stripped by the
        // mpint encoding.
        let k = self.shared_secret(&server_public)?;

        let mut hash_input = BytesMut::new();
        ctx.write_hash_prelude(&mut hash_input, &host_key_blob);
        wire::write_string(&mut hash_input, &self.public);
        wire::write_string(&mut hash_input, &server_public);
        wire::write_mpint(&mut hash_input, &k);
        let exchange_hash = self.hash(&hash_input);

        Ok(KexProgress::Done(Box::new(KexOutcome {
            exchange_hash,
            shared_secret: SharedSecret::Mpint(k),
            host_key_blob,
            signature_blob,
        })))
    }
}
