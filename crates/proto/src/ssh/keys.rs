//! Session key derivation (RFC 4253 Section 7.2).
//!
//! Six byte-strings are derived from the shared secret `K` and the
//! exchange hash `H`:
//!
//! ```text
//! Initial IV client to server:     HASH(K || H || "A" || session_id)
//! Initial IV server to client:     HASH(K || H || "B" || session_id)
//! Encryption key client to server: HASH(K || H || "C" || session_id)
//! Encryption key server to client: HASH(K || H || "D" || session_id)
//! Integrity key client to server:  HASH(K || H || "E" || session_id)
//! Integrity key server to client:  HASH(K || H || "F" || session_id)
//! ```
//!
//! Each key is grown to the required length by appending
//! `HASH(K || H || key-so-far)`. `session_id` is the exchange hash of the
//! *first* key exchange and never changes, including during rekeys.
//!
//! `K` enters the hash in its negotiated encoding: an mpint for classic
//! and ECDH methods, a plain SSH string for the hybrid post-quantum
//! methods.

use zeroize::Zeroize;

use crate::ssh::algorithms::NegotiatedAlgorithms;
use crate::ssh::wire;

/// Hash function of the active kex method.
pub type KexHash = dyn Fn(&[u8]) -> Vec<u8> + Send + Sync;

/// The shared secret `K` in its hash encoding.
pub enum SharedSecret {
    /// Classic and ECDH methods: K is hashed as an mpint.
    Mpint(Vec<u8>),
    /// Hybrid KEM methods: K is already a digest and is hashed as a
    /// string, NOT an mpint.
    Raw(Vec<u8>),
}

impl SharedSecret {
    /// Returns the SSH encoding of `K` as it enters hashes.
    pub fn encoded(&self) -> Vec<u8> {
        match self {
            SharedSecret::Mpint(k) => wire::mpint_bytes(k),
            SharedSecret::Raw(k) => {
                let mut buf = bytes::BytesMut::new();
                wire::write_string(&mut buf, k);
                buf.to_vec()
            }
        }
    }
}

impl Drop for SharedSecret {
    fn drop(&mut self) {
        match self {
            SharedSecret::Mpint(k) | SharedSecret::Raw(k) => k.zeroize(),
        }
    }
}

impl std::fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SharedSecret(<redacted>)")
    }
}

/// Derived key streams for both directions. Zeroized on drop.
pub struct KeyMaterial {
    /// Initial IV, client to server.
    pub iv_c2s: Vec<u8>,
    /// Initial IV, server to client.
    pub iv_s2c: Vec<u8>,
    /// Encryption key, client to server.
    pub enc_c2s: Vec<u8>,
    /// Encryption key, server to client.
    pub enc_s2c: Vec<u8>,
    /// Integrity key, client to server.
    pub mac_c2s: Vec<u8>,
    /// Integrity key, server to client.
    pub mac_s2c: Vec<u8>,
}

impl Drop for KeyMaterial {
    fn drop(&mut self) {
        self.iv_c2s.zeroize();
        self.iv_s2c.zeroize();
        self.enc_c2s.zeroize();
        self.enc_s2c.zeroize();
        self.mac_c2s.zeroize();
        self.mac_s2c.zeroize();
    }
}

impl std::fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("KeyMaterial(<redacted>)")
    }
}

/// Derives one key stream with the given tag letter.
pub fn derive_key(
    hash: &KexHash,
    shared: &SharedSecret,
    exchange_hash: &[u8],
    session_id: &[u8],
    letter: u8,
    key_length: usize,
) -> Vec<u8> {
    let k = shared.encoded();

    let mut input = Vec::with_capacity(k.len() + exchange_hash.len() + 1 + session_id.len());
    input.extend_from_slice(&k);
    input.extend_from_slice(exchange_hash);
    input.push(letter);
    input.extend_from_slice(&session_id);
    let mut key = hash(&input);

    // Grow with HASH(K || H || K1 || ... || Kn) until long enough.
    while key.len() < key_length {
        let mut input = Vec::with_capacity(k.len() + exchange_hash.len() + key.len());
        input.extend_from_slice(&k);
        input.extend_from_slice(exchange_hash);
        input.extend_from_slice(&key);
        let block = hash(&input);
        key.extend_from_slice(&block);
    }

    key.truncate(key_length);
    key
}

/// Derives all six key streams sized for the negotiated algorithms.
pub fn derive_key_material(
    hash: &KexHash,
    shared: &SharedSecret,
    exchange_hash: &[u8],
    session_id: &[u8],
    negotiated: &NegotiatedAlgorithms,
) -> KeyMaterial {
    let mac_c2s_len = negotiated.mac_c2s.map(|m| m.key_size()).unwrap_or(0);
    let mac_s2c_len = negotiated.mac_s2c.map(|m| m.key_size()).unwrap_or(0);

    let derive = |letter: u8, len: usize| {
        derive_key(hash, shared, exchange_hash, session_id, letter, len)
    };

    KeyMaterial {
        iv_c2s: derive(b'A', negotiated.cipher_c2s.iv_size()),
        iv_s2c: derive(b'B', negotiated.cipher_s2c.iv_size()),
        enc_c2s: derive(b'C', negotiated.cipher_c2s.key_size()),
        enc_s2c: derive(b'D', negotiated.cipher_s2c.key_size()),
        mac_c2s: derive(b'E', mac_c2s_len),
        mac_s2c: derive(b'F', mac_s2c_len),
    }
}
