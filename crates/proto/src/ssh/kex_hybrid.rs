//! Hybrid post-quantum key exchange
//! (draft-kampanakis-curdle-ssh-pq-ke, OpenSSH PROTOCOL).
//!
//! Implements:
//!
//! - mlkem768x25519-sha256
//! - sntrup761x25519-sha512@openssh.com
//!
//! Both combine a KEM with X25519 over the ECDH message pair: the client
//! sends `C_INIT = ek || Q_C`, the server answers with
//! `S_REPLY = ct || Q_S`, and the shared secret is
//! `K = Hash(kem_shared || x25519_shared)`.
//!
//! Unlike every other method, `K` is already uniformly distributed and is
//! hashed as an SSH *string*, not an mpint.

use bytes::BytesMut;
use ml_kem::kem::Decapsulate as _;
use ml_kem::{EncodedSizeUser as _, KemCore as _};
use skiff_platform::{SkiffError, SkiffResult};

use crate::ssh::kex::{ExchangeContext, HashAlg, KexMethod, KexOutcome, KexProgress};
use crate::ssh::kex_ecdh::{MSG_KEX_ECDH_INIT, MSG_KEX_ECDH_REPLY};
use crate::ssh::keys::SharedSecret;
use crate::ssh::wire;

/// ML-KEM-768 encapsulation key size.
pub const MLKEM768_EK_BYTES: usize = 1184;
/// ML-KEM-768 ciphertext size.
pub const MLKEM768_CT_BYTES: usize = 1088;

/// sntrup761 public key size.
pub const SNTRUP761_PK_BYTES: usize = 1158;
/// sntrup761 ciphertext size.
pub const SNTRUP761_CT_BYTES: usize = 1039;

const X25519_BYTES: usize = 32;

/// mlkem768x25519-sha256 key exchange.
pub struct MlKem768X25519Exchange {
    decap_key: Option<ml_kem::kem::DecapsulationKey<ml_kem::MlKem768Params>>,
    x25519_secret: Option<x25519_dalek::EphemeralSecret>,
    /// `ek || Q_C`, as sent in C_INIT.
    client_init: Vec<u8>,
}

impl MlKem768X25519Exchange {
    /// Generates the ML-KEM-768 and X25519 ephemeral key pairs.
    pub fn new() -> SkiffResult<Self> {
        let mut rng = rand::thread_rng();
        let (decap_key, encap_key) = ml_kem::MlKem768::generate(&mut rng);

        let x25519_secret = x25519_dalek::EphemeralSecret::random_from_rng(rand::rngs::OsRng);
        let x25519_public = x25519_dalek::PublicKey::from(&x25519_secret);

        let mut client_init = Vec::with_capacity(MLKEM768_EK_BYTES + X25519_BYTES);
        client_init.extend_from_slice(encap_key.as_bytes().as_slice());
        client_init.extend_from_slice(x25519_public.as_bytes());

        Ok(Self {
            decap_key: Some(decap_key),
            x25519_secret: Some(x25519_secret),
            client_init,
        })
    }
}

impl KexMethod for MlKem768X25519Exchange {
    fn name(&self) -> &'static str {
        "mlkem768x25519-sha256"
    }

    fn hash(&self, data: &[u8]) -> Vec<u8> {
        HashAlg::Sha256.digest(data)
    }

    fn start(&mut self, _ctx: &ExchangeContext) -> SkiffResult<Vec<Vec<u8>>> {
        let mut buf = BytesMut::new();
        wire::write_u8(&mut buf, MSG_KEX_ECDH_INIT);
        wire::write_string(&mut buf, &self.client_init);
        Ok(vec![buf.to_vec()])
    }

    fn on_message(&mut self, payload: &[u8], ctx: &ExchangeContext) -> SkiffResult<KexProgress> {
        let mut offset = 0;
        let msg_type = wire::read_u8(payload, &mut offset)?;
        if msg_type != MSG_KEX_ECDH_REPLY {
            return Err(SkiffError::KexFailed(format!(
                "unexpected message {} during mlkem768x25519-sha256",
                msg_type
            )));
        }

        let host_key_blob = wire::read_string(payload, &mut offset)?;
        let server_reply = wire::read_string(payload, &mut offset)?;
        let signature_blob = wire::read_string(payload, &mut offset)?;

        if server_reply.len() != MLKEM768_CT_BYTES + X25519_BYTES {
            return Err(SkiffError::KexFailed(format!(
                "hybrid reply has {} bytes, expected {}",
                server_reply.len(),
                MLKEM768_CT_BYTES + X25519_BYTES
            )));
        }
        let (ct_bytes, server_pub) = server_reply.split_at(MLKEM768_CT_BYTES);

        let decap_key = self
            .decap_key
            .take()
            .ok_or_else(|| SkiffError::KexFailed("duplicate hybrid reply".to_string()))?;
        let ciphertext = ml_kem::Ciphertext::<ml_kem::MlKem768>::try_from(ct_bytes)
            .map_err(|_| SkiffError::KexFailed("bad ML-KEM ciphertext".to_string()))?;
        let kem_shared = decap_key
            .decapsulate(&ciphertext)
            .map_err(|_| SkiffError::KexFailed("ML-KEM decapsulation failed".to_string()))?;

        let server_array: [u8; 32] = server_pub
            .try_into()
            .map_err(|_| SkiffError::KexFailed("bad X25519 public key length".to_string()))?;
        let x25519_secret = self
            .x25519_secret
            .take()
            .ok_or_else(|| SkiffError::KexFailed("duplicate hybrid reply".to_string()))?;
        let x25519_shared =
            x25519_secret.diffie_hellman(&x25519_dalek::PublicKey::from(server_array));
        if !x25519_shared.was_contributory() {
            return Err(SkiffError::KexFailed(
                "X25519 produced a non-contributory shared secret".to_string(),
            ));
        }

        // K = Hash(kem_shared || x25519_shared), a byte string.
        let mut combined = Vec::with_capacity(64);
        combined.extend_from_slice(kem_shared.as_slice());
        combined.extend_from_slice(x25519_shared.as_bytes());
        let k = self.hash(&combined);

        let mut hash_input = BytesMut::new();
        ctx.write_hash_prelude(&mut hash_input, &host_key_blob);
        wire::write_string(&mut hash_input, &self.client_init);
        wire::write_string(&mut hash_input, &server_reply);
        wire::write_string(&mut hash_input, &k);
        let exchange_hash = self.hash(&hash_input);

        Ok(KexProgress::Done(Box::new(KexOutcome {
            exchange_hash,
            shared_secret: SharedSecret::Raw(k),
            host_key_blob,
            signature_blob,
        })))
    }
}

/// sntrup761x25519-sha512@openssh.com key exchange.
pub struct Sntrup761X25519Exchange {
    secret_key: Option<sntrup761::DecapsulationKey>,
    x25519_secret: Option<x25519_dalek::EphemeralSecret>,
    /// `pk || Q_C`, as sent in C_INIT.
    client_init: Vec<u8>,
}

impl Sntrup761X25519Exchange {
    /// Generates the sntrup761 and X25519 ephemeral key pairs.
    pub fn new() -> SkiffResult<Self> {
        let rng = sntrup761::rand::rngs::OsRng;
        let (public_key, secret_key) = sntrup761::generate_key(rng);

        let x25519_secret = x25519_dalek::EphemeralSecret::random_from_rng(rand::rngs::OsRng);
        let x25519_public = x25519_dalek::PublicKey::from(&x25519_secret);

        let mut client_init = Vec::with_capacity(SNTRUP761_PK_BYTES + X25519_BYTES);
        client_init.extend_from_slice(public_key.as_ref());
        client_init.extend_from_slice(x25519_public.as_bytes());

        Ok(Self {
            secret_key: Some(secret_key),
            x25519_secret: Some(x25519_secret),
            client_init,
        })
    }
}

impl KexMethod for Sntrup761X25519Exchange {
    fn name(&self) -> &'static str {
        "sntrup761x25519-sha512@openssh.com"
    }

    fn hash(&self, data: &[u8]) -> Vec<u8> {
        HashAlg::Sha512.digest(data)
    }

    fn start(&mut self, _ctx: &ExchangeContext) -> SkiffResult<Vec<Vec<u8>>> {
        let mut buf = BytesMut::new();
        wire::write_u8(&mut buf, MSG_KEX_ECDH_INIT);
        wire::write_string(&mut buf, &self.client_init);
        Ok(vec![buf.to_vec()])
    }

    fn on_message(&mut self, payload: &[u8], ctx: &ExchangeContext) -> SkiffResult<KexProgress> {
        let mut offset = 0;
        let msg_type = wire::read_u8(payload, &mut offset)?;
        if msg_type != MSG_KEX_ECDH_REPLY {
            return Err(SkiffError::KexFailed(format!(
                "unexpected message {} during sntrup761x25519",
                msg_type
            )));
        }

        let host_key_blob = wire::read_string(payload, &mut offset)?;
        let server_reply = wire::read_string(payload, &mut offset)?;
        let signature_blob = wire::read_string(payload, &mut offset)?;

        if server_reply.len() != SNTRUP761_CT_BYTES + X25519_BYTES {
            return Err(SkiffError::KexFailed(format!(
                "hybrid reply has {} bytes, expected {}",
                server_reply.len(),
                SNTRUP761_CT_BYTES + X25519_BYTES
            )));
        }
        let (ct_bytes, server_pub) = server_reply.split_at(SNTRUP761_CT_BYTES);

        let secret_key = self
            .secret_key
            .take()
            .ok_or_else(|| SkiffError::KexFailed("duplicate hybrid reply".to_string()))?;
        let ciphertext: sntrup761::Ciphertext = ct_bytes
            .try_into()
            .map_err(|_| SkiffError::KexFailed("bad sntrup761 ciphertext".to_string()))?;
        let kem_shared = secret_key.decapsulate(&ciphertext);

        let server_array: [u8; 32] = server_pub
            .try_into()
            .map_err(|_| SkiffError::KexFailed("bad X25519 public key length".to_string()))?;
        let x25519_secret = self
            .x25519_secret
            .take()
            .ok_or_else(|| SkiffError::KexFailed("duplicate hybrid reply".to_string()))?;
        let x25519_shared =
            x25519_secret.diffie_hellman(&x25519_dalek::PublicKey::from(server_array));
        if !x25519_shared.was_contributory() {
            return Err(SkiffError::KexFailed(
                "X25519 produced a non-contributory shared secret".to_string(),
            ));
        }

        let mut combined = Vec::with_capacity(64);
        combined.extend_from_slice(kem_shared.as_ref());
        combined.extend_from_slice(x25519_shared.as_bytes());
        let k = self.hash(&combined);

        let mut hash_input = BytesMut::new();
        ctx.write_hash_prelude(&mut hash_input, &host_key_blob);
        wire::write_string(&mut hash_input, &self.client_init);
        wire::write_string(&mut hash_input, &server_reply);
        wire::write_string(&mut hash_input, &k);
        let exchange_hash = self.hash(&hash_input);

        Ok(KexProgress::Done(Box::new(KexOutcome {
            exchange_hash,
            shared_secret: SharedSecret::Raw(k),
            host_key_blob,
            signature_blob,
        })))
    }
}
