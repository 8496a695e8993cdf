//! SSH cryptographic primitives: ciphers and MACs.
//!
//! This module implements the cipher and MAC algorithms of the default
//! catalogue:
//!
//! - AES-128/192/256-CTR (stream, separate MAC)
//! - AES-128/192/256-CBC (block, separate MAC)
//! - AES-128/256-GCM (`aes*-gcm@openssh.com`, AEAD per RFC 5647)
//! - ChaCha20-Poly1305 (`chacha20-poly1305@openssh.com`, AEAD with a
//!   separate header key for the length field)
//! - HMAC-SHA1, HMAC-SHA2-256, HMAC-SHA2-512, each also in the
//!   `-etm@openssh.com` encrypt-then-MAC flavor
//!
//! # Security
//!
//! - MAC and tag comparisons are constant-time ([`subtle`])
//! - Key material is zeroized on drop
//! - AEAD nonces follow the per-mode rules: the GCM invocation counter
//!   increments once per packet, ChaCha20 uses the packet sequence number

use aes::{Aes128, Aes192, Aes256};
use chacha20::cipher::{KeyInit, KeyIvInit, StreamCipher, StreamCipherSeek};
use cipher::generic_array::GenericArray;
use cipher::{BlockDecryptMut, BlockEncryptMut};
use hmac::{Hmac, Mac};
use sha1::Sha1;
use sha2::{Sha256, Sha512};
use skiff_platform::{SkiffError, SkiffResult};
use subtle::ConstantTimeEq;
use zeroize::Zeroize;

type Aes128Ctr = ctr::Ctr128BE<Aes128>;
type Aes192Ctr = ctr::Ctr128BE<Aes192>;
type Aes256Ctr = ctr::Ctr128BE<Aes256>;

/// `chacha20-poly1305@openssh.com` uses a 64-bit nonce, not the 96-bit
/// IETF one.
type SshChaCha20 = chacha20::ChaCha20Legacy;

/// Cipher algorithm identifiers for the negotiated encryption slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherAlgorithm {
    /// aes128-ctr
    Aes128Ctr,
    /// aes192-ctr
    Aes192Ctr,
    /// aes256-ctr
    Aes256Ctr,
    /// aes128-gcm@openssh.com
    Aes128Gcm,
    /// aes256-gcm@openssh.com
    Aes256Gcm,
    /// chacha20-poly1305@openssh.com
    ChaCha20Poly1305,
    /// aes128-cbc
    Aes128Cbc,
    /// aes192-cbc
    Aes192Cbc,
    /// aes256-cbc
    Aes256Cbc,
}

impl CipherAlgorithm {
    /// Returns the algorithm name.
    pub fn name(&self) -> &'static str {
        match self {
            CipherAlgorithm::Aes128Ctr => "aes128-ctr",
            CipherAlgorithm::Aes192Ctr => "aes192-ctr",
            CipherAlgorithm::Aes256Ctr => "aes256-ctr",
            CipherAlgorithm::Aes128Gcm => "aes128-gcm@openssh.com",
            CipherAlgorithm::Aes256Gcm => "aes256-gcm@openssh.com",
            CipherAlgorithm::ChaCha20Poly1305 => "chacha20-poly1305@openssh.com",
            CipherAlgorithm::Aes128Cbc => "aes128-cbc",
            CipherAlgorithm::Aes192Cbc => "aes192-cbc",
            CipherAlgorithm::Aes256Cbc => "aes256-cbc",
        }
    }

    /// Parses a cipher algorithm from its name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "aes128-ctr" => Some(CipherAlgorithm::Aes128Ctr),
            "aes192-ctr" => Some(CipherAlgorithm::Aes192Ctr),
            "aes256-ctr" => Some(CipherAlgorithm::Aes256Ctr),
            "aes128-gcm@openssh.com" => Some(CipherAlgorithm::Aes128Gcm),
            "aes256-gcm@openssh.com" => Some(CipherAlgorithm::Aes256Gcm),
            "chacha20-poly1305@openssh.com" => Some(CipherAlgorithm::ChaCha20Poly1305),
            "aes128-cbc" => Some(CipherAlgorithm::Aes128Cbc),
            "aes192-cbc" => Some(CipherAlgorithm::Aes192Cbc),
            "aes256-cbc" => Some(CipherAlgorithm::Aes256Cbc),
            _ => None,
        }
    }

    /// Returns the key size in bytes.
    ///
    /// ChaCha20-Poly1305 consumes 64 bytes: 32 for the payload key and 32
    /// for the length-field key.
    pub fn key_size(&self) -> usize {
        match self {
            CipherAlgorithm::Aes128Ctr | CipherAlgorithm::Aes128Gcm | CipherAlgorithm::Aes128Cbc => 16,
            CipherAlgorithm::Aes192Ctr | CipherAlgorithm::Aes192Cbc => 24,
            CipherAlgorithm::Aes256Ctr | CipherAlgorithm::Aes256Gcm | CipherAlgorithm::Aes256Cbc => 32,
            CipherAlgorithm::ChaCha20Poly1305 => 64,
        }
    }

    /// Returns the IV size in bytes.
    pub fn iv_size(&self) -> usize {
        match self {
            CipherAlgorithm::Aes128Gcm | CipherAlgorithm::Aes256Gcm => 12,
            CipherAlgorithm::ChaCha20Poly1305 => 0,
            _ => 16,
        }
    }

    /// Returns the cipher block length used for packet alignment.
    ///
    /// Never below 8, per RFC 4253 Section 6.
    pub fn block_len(&self) -> usize {
        match self {
            CipherAlgorithm::ChaCha20Poly1305 => 8,
            _ => 16,
        }
    }

    /// Returns the authentication tag size in bytes (AEAD only).
    pub fn tag_size(&self) -> usize {
        if self.is_aead() {
            16
        } else {
            0
        }
    }

    /// Returns true for AEAD ciphers, which suppress the MAC slot.
    pub fn is_aead(&self) -> bool {
        matches!(
            self,
            CipherAlgorithm::Aes128Gcm
                | CipherAlgorithm::Aes256Gcm
                | CipherAlgorithm::ChaCha20Poly1305
        )
    }
}

/// Direction a cipher instance is constructed for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherDirection {
    /// Encrypting outbound packets.
    Encrypt,
    /// Decrypting inbound packets.
    Decrypt,
}

/// A live cipher instance bound to one direction.
pub enum Cipher {
    /// AES-CTR keystream (same operation both directions).
    Ctr128(Box<Aes128Ctr>),
    /// AES-192-CTR keystream.
    Ctr192(Box<Aes192Ctr>),
    /// AES-256-CTR keystream.
    Ctr256(Box<Aes256Ctr>),
    /// AES-CBC encryptor.
    CbcEnc128(Box<cbc::Encryptor<Aes128>>),
    /// AES-192-CBC encryptor.
    CbcEnc192(Box<cbc::Encryptor<Aes192>>),
    /// AES-256-CBC encryptor.
    CbcEnc256(Box<cbc::Encryptor<Aes256>>),
    /// AES-CBC decryptor.
    CbcDec128(Box<cbc::Decryptor<Aes128>>),
    /// AES-192-CBC decryptor.
    CbcDec192(Box<cbc::Decryptor<Aes192>>),
    /// AES-256-CBC decryptor.
    CbcDec256(Box<cbc::Decryptor<Aes256>>),
    /// AES-128-GCM with its running invocation counter.
    Gcm128 {
        /// Cipher instance.
        cipher: Box<aes_gcm::Aes128Gcm>,
        /// 4-byte fixed field plus 8-byte invocation counter (RFC 5647).
        nonce: [u8; 12],
    },
    /// AES-256-GCM with its running invocation counter.
    Gcm256 {
        /// Cipher instance.
        cipher: Box<aes_gcm::Aes256Gcm>,
        /// 4-byte fixed field plus 8-byte invocation counter (RFC 5647).
        nonce: [u8; 12],
    },
    /// OpenSSH ChaCha20-Poly1305 key pair.
    ChaChaPoly {
        /// K_2: encrypts the packet body, keyed per-packet by sequence number.
        main_key: [u8; 32],
        /// K_1: encrypts the 4-byte length field.
        header_key: [u8; 32],
    },
}

impl Cipher {
    /// Creates a cipher instance from derived key material.
    ///
    /// `key` and `iv` must be at least [`CipherAlgorithm::key_size`] and
    /// [`CipherAlgorithm::iv_size`] bytes; excess derived bytes are ignored.
    pub fn new(
        algorithm: CipherAlgorithm,
        direction: CipherDirection,
        key: &[u8],
        iv: &[u8],
    ) -> SkiffResult<Self> {
        if key.len() < algorithm.key_size() || iv.len() < algorithm.iv_size() {
            return Err(SkiffError::KexFailed(format!(
                "insufficient key material for {}",
                algorithm.name()
            )));
        }
        let key = &key[..algorithm.key_size()];
        let iv = &iv[..algorithm.iv_size()];

        let invalid =
            |_| SkiffError::KexFailed(format!("bad key/IV length for {}", algorithm.name()));

        Ok(match (algorithm, direction) {
            (CipherAlgorithm::Aes128Ctr, _) => {
                Cipher::Ctr128(Box::new(Aes128Ctr::new_from_slices(key, iv).map_err(invalid)?))
            }
            (CipherAlgorithm::Aes192Ctr, _) => {
                Cipher::Ctr192(Box::new(Aes192Ctr::new_from_slices(key, iv).map_err(invalid)?))
            }
            (CipherAlgorithm::Aes256Ctr, _) => {
                Cipher::Ctr256(Box::new(Aes256Ctr::new_from_slices(key, iv).map_err(invalid)?))
            }
            (CipherAlgorithm::Aes128Cbc, CipherDirection::Encrypt) => Cipher::CbcEnc128(Box::new(
                cbc::Encryptor::<Aes128>::new_from_slices(key, iv).map_err(invalid)?,
            )),
            (CipherAlgorithm::Aes192Cbc, CipherDirection::Encrypt) => Cipher::CbcEnc192(Box::new(
                cbc::Encryptor::<Aes192>::new_from_slices(key, iv).map_err(invalid)?,
            )),
            (CipherAlgorithm::Aes256Cbc, CipherDirection::Encrypt) => Cipher::CbcEnc256(Box::new(
                cbc::Encryptor::<Aes256>::new_from_slices(key, iv).map_err(invalid)?,
            )),
            (CipherAlgorithm::Aes128Cbc, CipherDirection::Decrypt) => Cipher::CbcDec128(Box::new(
                cbc::Decryptor::<Aes128>::new_from_slices(key, iv).map_err(invalid)?,
            )),
            (CipherAlgorithm::Aes192Cbc, CipherDirection::Decrypt) => Cipher::CbcDec192(Box::new(
                cbc::Decryptor::<Aes192>::new_from_slices(key, iv).map_err(invalid)?,
            )),
            (CipherAlgorithm::Aes256Cbc, CipherDirection::Decrypt) => Cipher::CbcDec256(Box::new(
                cbc::Decryptor::<Aes256>::new_from_slices(key, iv).map_err(invalid)?,
            )),
            (CipherAlgorithm::Aes128Gcm, _) => {
                let mut nonce = [0u8; 12];
                nonce.copy_from_slice(iv);
                Cipher::Gcm128 {
                    cipher: Box::new(
                        aes_gcm::Aes128Gcm::new_from_slice(key).map_err(invalid)?,
                    ),
                    nonce,
                }
            }
            (CipherAlgorithm::Aes256Gcm, _) => {
                let mut nonce = [0u8; 12];
                nonce.copy_from_slice(iv);
                Cipher::Gcm256 {
                    cipher: Box::new(
                        aes_gcm::Aes256Gcm::new_from_slice(key).map_err(invalid)?,
                    ),
                    nonce,
                }
            }
            (CipherAlgorithm::ChaCha20Poly1305, _) => {
                let mut main_key = [0u8; 32];
                let mut header_key = [0u8; 32];
                main_key.copy_from_slice(&key[..32]);
                header_key.copy_from_slice(&key[32..64]);
                Cipher::ChaChaPoly {
                    main_key,
                    header_key,
                }
            }
        })
    }

    /// Returns the algorithm this instance implements.
    pub fn algorithm(&self) -> CipherAlgorithm {
        match self {
            Cipher::Ctr128(_) => CipherAlgorithm::Aes128Ctr,
            Cipher::Ctr192(_) => CipherAlgorithm::Aes192Ctr,
            Cipher::Ctr256(_) => CipherAlgorithm::Aes256Ctr,
            Cipher::CbcEnc128(_) | Cipher::CbcDec128(_) => CipherAlgorithm::Aes128Cbc,
            Cipher::CbcEnc192(_) | Cipher::CbcDec192(_) => CipherAlgorithm::Aes192Cbc,
            Cipher::CbcEnc256(_) | Cipher::CbcDec256(_) => CipherAlgorithm::Aes256Cbc,
            Cipher::Gcm128 { .. } => CipherAlgorithm::Aes128Gcm,
            Cipher::Gcm256 { .. } => CipherAlgorithm::Aes256Gcm,
            Cipher::ChaChaPoly { .. } => CipherAlgorithm::ChaCha20Poly1305,
        }
    }

    /// Applies the stream or block transform in place (non-AEAD modes).
    ///
    /// `data` must be a whole number of cipher blocks for CBC.
    pub fn apply(&mut self, data: &mut [u8]) -> SkiffResult<()> {
        match self {
            Cipher::Ctr128(c) => c.apply_keystream(data),
            Cipher::Ctr192(c) => c.apply_keystream(data),
            Cipher::Ctr256(c) => c.apply_keystream(data),
            Cipher::CbcEnc128(c) => cbc_apply_enc(c.as_mut(), data)?,
            Cipher::CbcEnc192(c) => cbc_apply_enc(c.as_mut(), data)?,
            Cipher::CbcEnc256(c) => cbc_apply_enc(c.as_mut(), data)?,
            Cipher::CbcDec128(c) => cbc_apply_dec(c.as_mut(), data)?,
            Cipher::CbcDec192(c) => cbc_apply_dec(c.as_mut(), data)?,
            Cipher::CbcDec256(c) => cbc_apply_dec(c.as_mut(), data)?,
            _ => {
                return Err(SkiffError::Protocol(
                    "apply() called on an AEAD cipher".to_string(),
                ))
            }
        }
        Ok(())
    }

    /// Decrypts the 4-byte length prefix of an inbound AEAD packet.
    ///
    /// GCM transmits the length in cleartext, so this is a no-op there;
    /// ChaCha20 runs the header key over it.
    pub fn aead_open_length(&mut self, len_bytes: &mut [u8; 4], seq: u32) -> SkiffResult<()> {
        match self {
            Cipher::Gcm128 { .. } | Cipher::Gcm256 { .. } => Ok(()),
            Cipher::ChaChaPoly { header_key, .. } => {
                let mut cipher =
                    SshChaCha20::new_from_slices(header_key, &u64::from(seq).to_be_bytes())
                        .map_err(|_| SkiffError::Decryption("chacha20 header key".to_string()))?;
                cipher.apply_keystream(len_bytes);
                Ok(())
            }
            _ => Err(SkiffError::Protocol(
                "aead_open_length() called on a non-AEAD cipher".to_string(),
            )),
        }
    }

    /// Seals a framed record in place (AEAD modes).
    ///
    /// `record` holds `length(4) || padding_length || payload || padding`;
    /// the body is encrypted, the length handled per mode, and the tag
    /// appended.
    pub fn aead_seal(&mut self, record: &mut Vec<u8>, seq: u32) -> SkiffResult<()> {
        match self {
            Cipher::Gcm128 { cipher, nonce } => gcm_seal(cipher.as_ref(), nonce, record),
            Cipher::Gcm256 { cipher, nonce } => gcm_seal(cipher.as_ref(), nonce, record),
            Cipher::ChaChaPoly {
                main_key,
                header_key,
            } => chacha_seal(main_key, header_key, record, seq),
            _ => Err(SkiffError::Protocol(
                "aead_seal() called on a non-AEAD cipher".to_string(),
            )),
        }
    }

    /// Opens an AEAD packet body.
    ///
    /// `len_bytes` is the wire-format length prefix (still encrypted for
    /// ChaCha20 - pass the original wire bytes, not the output of
    /// [`Cipher::aead_open_length`]); `body` holds ciphertext plus tag.
    /// Returns the plaintext body (`padding_length || payload || padding`).
    pub fn aead_open(
        &mut self,
        len_bytes: [u8; 4],
        body: &mut Vec<u8>,
        seq: u32,
    ) -> SkiffResult<Vec<u8>> {
        match self {
            Cipher::Gcm128 { cipher, nonce } => gcm_open(cipher.as_ref(), nonce, len_bytes, body),
            Cipher::Gcm256 { cipher, nonce } => gcm_open(cipher.as_ref(), nonce, len_bytes, body),
            Cipher::ChaChaPoly {
                main_key,
                header_key: _,
            } => chacha_open(main_key, len_bytes, body, seq),
            _ => Err(SkiffError::Protocol(
                "aead_open() called on a non-AEAD cipher".to_string(),
            )),
        }
    }
}

impl std::fmt::Debug for Cipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cipher")
            .field("algorithm", &self.algorithm().name())
            .field("state", &"<redacted>")
            .finish()
    }
}

impl Drop for Cipher {
    fn drop(&mut self) {
        if let Cipher::ChaChaPoly {
            main_key,
            header_key,
        } = self
        {
            main_key.zeroize();
            header_key.zeroize();
        }
        // The RustCrypto cipher states are dropped by their own impls.
    }
}

fn cbc_apply_enc<C: BlockEncryptMut>(cipher: &mut C, data: &mut [u8]) -> SkiffResult<()> {
    if data.len() % 16 != 0 {
        return Err(SkiffError::Protocol(
            "CBC data is not block-aligned".to_string(),
        ));
    }
    for block in data.chunks_exact_mut(16) {
        cipher.encrypt_block_mut(GenericArray::from_mut_slice(block));
    }
    Ok(())
}

fn cbc_apply_dec<C: BlockDecryptMut>(cipher: &mut C, data: &mut [u8]) -> SkiffResult<()> {
    if data.len() % 16 != 0 {
        return Err(SkiffError::Protocol(
            "CBC data is not block-aligned".to_string(),
        ));
    }
    for block in data.chunks_exact_mut(16) {
        cipher.decrypt_block_mut(GenericArray::from_mut_slice(block));
    }
    Ok(())
}

fn gcm_seal<A: aes_gcm::aead::AeadInPlace>(
    cipher: &A,
    nonce: &mut [u8; 12],
    record: &mut Vec<u8>,
) -> SkiffResult<()> {
    let (aad, body) = record.split_at_mut(4);
    let tag = cipher
        .encrypt_in_place_detached(aes_gcm::Nonce::from_slice(&nonce[..]), aad, body)
        .map_err(|_| SkiffError::Decryption("GCM seal failed".to_string()))?;
    record.extend_from_slice(tag.as_slice());
    gcm_advance_nonce(nonce);
    Ok(())
}

fn gcm_open<A: aes_gcm::aead::AeadInPlace>(
    cipher: &A,
    nonce: &mut [u8; 12],
    len_bytes: [u8; 4],
    body: &mut Vec<u8>,
) -> SkiffResult<Vec<u8>> {
    if body.len() < 16 {
        return Err(SkiffError::MalformedPacket(
            "AEAD body shorter than tag".to_string(),
        ));
    }
    let tag_offset = body.len() - 16;
    let mut tag = [0u8; 16];
    tag.copy_from_slice(&body[tag_offset..]);
    body.truncate(tag_offset);

    cipher
        .decrypt_in_place_detached(
            aes_gcm::Nonce::from_slice(&nonce[..]),
            &len_bytes,
            body,
            aes_gcm::Tag::from_slice(&tag),
        )
        .map_err(|_| SkiffError::MacFailure)?;
    gcm_advance_nonce(nonce);
    Ok(std::mem::take(body))
}

/// Increments the 64-bit invocation counter portion of a GCM nonce
/// (RFC 5647 Section 7.1).
fn gcm_advance_nonce(nonce: &mut [u8; 12]) {
    let mut counter = u64::from_be_bytes(nonce[4..12].try_into().expect("8 bytes"));
    counter = counter.wrapping_add(1);
    nonce[4..12].copy_from_slice(&counter.to_be_bytes());
}

fn chacha_seal(
    main_key: &[u8; 32],
    header_key: &[u8; 32],
    record: &mut Vec<u8>,
    seq: u32,
) -> SkiffResult<()> {
    let nonce = u64::from(seq).to_be_bytes();
    let mut main = SshChaCha20::new_from_slices(main_key, &nonce)
        .map_err(|_| SkiffError::Decryption("chacha20 main key".to_string()))?;

    // Block 0 of the main keystream becomes the per-packet Poly1305 key.
    let mut poly_key = [0u8; poly1305::KEY_SIZE];
    main.apply_keystream(&mut poly_key);

    let mut header = SshChaCha20::new_from_slices(header_key, &nonce)
        .map_err(|_| SkiffError::Decryption("chacha20 header key".to_string()))?;
    header.apply_keystream(&mut record[..4]);

    main.seek(64u64);
    main.apply_keystream(&mut record[4..]);

    let tag = poly1305::Poly1305::new(GenericArray::from_slice(&poly_key))
        .compute_unpadded(record);
    record.extend_from_slice(tag.as_slice());
    poly_key.zeroize();
    Ok(())
}

fn chacha_open(
    main_key: &[u8; 32],
    len_bytes: [u8; 4],
    body: &mut Vec<u8>,
    seq: u32,
) -> SkiffResult<Vec<u8>> {
    if body.len() < poly1305::BLOCK_SIZE {
        return Err(SkiffError::MalformedPacket(
            "AEAD body shorter than tag".to_string(),
        ));
    }
    let nonce = u64::from(seq).to_be_bytes();
    let mut main = SshChaCha20::new_from_slices(main_key, &nonce)
        .map_err(|_| SkiffError::Decryption("chacha20 main key".to_string()))?;

    let mut poly_key = [0u8; poly1305::KEY_SIZE];
    main.apply_keystream(&mut poly_key);

    let tag_offset = body.len() - poly1305::BLOCK_SIZE;
    let expected = {
        let mut authed = Vec::with_capacity(4 + tag_offset);
        authed.extend_from_slice(&len_bytes);
        authed.extend_from_slice(&body[..tag_offset]);
        poly1305::Poly1305::new(GenericArray::from_slice(&poly_key)).compute_unpadded(&authed)
    };
    poly_key.zeroize();

    if !bool::from(expected.as_slice().ct_eq(&body[tag_offset..])) {
        return Err(SkiffError::MacFailure);
    }

    body.truncate(tag_offset);
    main.seek(64u64);
    main.apply_keystream(body);
    Ok(std::mem::take(body))
}

/// MAC algorithm identifiers for the negotiated integrity slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MacAlgorithm {
    /// hmac-sha2-256
    HmacSha256,
    /// hmac-sha2-512
    HmacSha512,
    /// hmac-sha1
    HmacSha1,
    /// hmac-sha2-256-etm@openssh.com
    HmacSha256Etm,
    /// hmac-sha2-512-etm@openssh.com
    HmacSha512Etm,
    /// hmac-sha1-etm@openssh.com
    HmacSha1Etm,
}

impl MacAlgorithm {
    /// Returns the algorithm name.
    pub fn name(&self) -> &'static str {
        match self {
            MacAlgorithm::HmacSha256 => "hmac-sha2-256",
            MacAlgorithm::HmacSha512 => "hmac-sha2-512",
            MacAlgorithm::HmacSha1 => "hmac-sha1",
            MacAlgorithm::HmacSha256Etm => "hmac-sha2-256-etm@openssh.com",
            MacAlgorithm::HmacSha512Etm => "hmac-sha2-512-etm@openssh.com",
            MacAlgorithm::HmacSha1Etm => "hmac-sha1-etm@openssh.com",
        }
    }

    /// Parses a MAC algorithm from its name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "hmac-sha2-256" => Some(MacAlgorithm::HmacSha256),
            "hmac-sha2-512" => Some(MacAlgorithm::HmacSha512),
            "hmac-sha1" => Some(MacAlgorithm::HmacSha1),
            "hmac-sha2-256-etm@openssh.com" => Some(MacAlgorithm::HmacSha256Etm),
            "hmac-sha2-512-etm@openssh.com" => Some(MacAlgorithm::HmacSha512Etm),
            "hmac-sha1-etm@openssh.com" => Some(MacAlgorithm::HmacSha1Etm),
            _ => None,
        }
    }

    /// Returns the key size in bytes.
    pub fn key_size(&self) -> usize {
        match self {
            MacAlgorithm::HmacSha256 | MacAlgorithm::HmacSha256Etm => 32,
            MacAlgorithm::HmacSha512 | MacAlgorithm::HmacSha512Etm => 64,
            MacAlgorithm::HmacSha1 | MacAlgorithm::HmacSha1Etm => 20,
        }
    }

    /// Returns the MAC output size in bytes.
    pub fn mac_size(&self) -> usize {
        self.key_size()
    }

    /// Returns true for encrypt-then-MAC variants: the MAC covers the
    /// cleartext length field plus the ciphertext, and the length field is
    /// transmitted unencrypted.
    pub fn is_etm(&self) -> bool {
        matches!(
            self,
            MacAlgorithm::HmacSha256Etm | MacAlgorithm::HmacSha512Etm | MacAlgorithm::HmacSha1Etm
        )
    }
}

/// Keyed MAC state for one direction.
///
/// The packet layer owns the sequence counter and passes it in explicitly.
pub struct MacKey {
    algorithm: MacAlgorithm,
    key: Vec<u8>,
}

impl MacKey {
    /// Creates a MAC key from derived key material.
    pub fn new(algorithm: MacAlgorithm, key_material: &[u8]) -> SkiffResult<Self> {
        if key_material.len() < algorithm.key_size() {
            return Err(SkiffError::KexFailed(format!(
                "insufficient key material for {}",
                algorithm.name()
            )));
        }
        Ok(Self {
            algorithm,
            key: key_material[..algorithm.key_size()].to_vec(),
        })
    }

    /// Returns the algorithm.
    pub fn algorithm(&self) -> MacAlgorithm {
        self.algorithm
    }

    /// Computes `MAC(key, seq || data)`.
    pub fn compute(&self, seq: u32, data: &[u8]) -> Vec<u8> {
        match self.algorithm {
            MacAlgorithm::HmacSha256 | MacAlgorithm::HmacSha256Etm => {
                let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(&self.key)
                    .expect("HMAC accepts any key size");
                mac.update(&seq.to_be_bytes());
                mac.update(data);
                mac.finalize().into_bytes().to_vec()
            }
            MacAlgorithm::HmacSha512 | MacAlgorithm::HmacSha512Etm => {
                let mut mac = <Hmac<Sha512> as Mac>::new_from_slice(&self.key)
                    .expect("HMAC accepts any key size");
                mac.update(&seq.to_be_bytes());
                mac.update(data);
                mac.finalize().into_bytes().to_vec()
            }
            MacAlgorithm::HmacSha1 | MacAlgorithm::HmacSha1Etm => {
                let mut mac = <Hmac<Sha1> as Mac>::new_from_slice(&self.key)
                    .expect("HMAC accepts any key size");
                mac.update(&seq.to_be_bytes());
                mac.update(data);
                mac.finalize().into_bytes().to_vec()
            }
        }
    }

    /// Verifies a received MAC in constant time.
    pub fn verify(&self, seq: u32, data: &[u8], received: &[u8]) -> SkiffResult<()> {
        let computed = self.compute(seq, data);
        if computed.len() == received.len() && bool::from(computed.ct_eq(received)) {
            Ok(())
        } else {
            Err(SkiffError::MacFailure)
        }
    }
}

impl std::fmt::Debug for MacKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MacKey")
            .field("algorithm", &self.algorithm)
            .field("key", &"<redacted>")
            .finish()
    }
}

impl Drop for MacKey {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cipher_algorithm_properties() {
        let chacha = CipherAlgorithm::ChaCha20Poly1305;
        assert_eq!(chacha.name(), "chacha20-poly1305@openssh.com");
        assert_eq!(chacha.key_size(), 64);
        assert_eq!(chacha.iv_size(), 0);
        assert_eq!(chacha.block_len(), 8);
        assert!(chacha.is_aead());

        let gcm = CipherAlgorithm::Aes128Gcm;
        assert_eq!(gcm.key_size(), 16);
        assert_eq!(gcm.iv_size(), 12);
        assert!(gcm.is_aead());

        let ctr = CipherAlgorithm::Aes256Ctr;
        assert_eq!(ctr.key_size(), 32);
        assert_eq!(ctr.block_len(), 16);
        assert!(!ctr.is_aead());
        assert_eq!(ctr.tag_size(), 0);
    }

    #[test]
    fn test_cipher_from_name() {
        assert_eq!(
            CipherAlgorithm::from_name("aes192-cbc"),
            Some(CipherAlgorithm::Aes192Cbc)
        );
        assert_eq!(
            CipherAlgorithm::from_name("chacha20-poly1305@openssh.com"),
            Some(CipherAlgorithm::ChaCha20Poly1305)
        );
        assert!(CipherAlgorithm::from_name("3des-cbc").is_none());
    }

    #[test]
    fn test_ctr_round_trip() {
        let key = [7u8; 32];
        let iv = [9u8; 16];
        let mut enc =
            Cipher::new(CipherAlgorithm::Aes256Ctr, CipherDirection::Encrypt, &key, &iv).unwrap();
        let mut dec =
            Cipher::new(CipherAlgorithm::Aes256Ctr, CipherDirection::Decrypt, &key, &iv).unwrap();

        let mut data = b"sixteen byte blk".to_vec();
        let original = data.clone();
        enc.apply(&mut data).unwrap();
        assert_ne!(data, original);
        dec.apply(&mut data).unwrap();
        assert_eq!(data, original);
    }

    #[test]
    fn test_cbc_round_trip() {
        let key = [3u8; 16];
        let iv = [5u8; 16];
        let mut enc =
            Cipher::new(CipherAlgorithm::Aes128Cbc, CipherDirection::Encrypt, &key, &iv).unwrap();
        let mut dec =
            Cipher::new(CipherAlgorithm::Aes128Cbc, CipherDirection::Decrypt, &key, &iv).unwrap();

        let mut data = vec![0xabu8; 48];
        let original = data.clone();
        enc.apply(&mut data).unwrap();
        dec.apply(&mut data).unwrap();
        assert_eq!(data, original);
    }

    #[test]
    fn test_cbc_rejects_partial_block() {
        let key = [3u8; 16];
        let iv = [5u8; 16];
        let mut enc =
            Cipher::new(CipherAlgorithm::Aes128Cbc, CipherDirection::Encrypt, &key, &iv).unwrap();
        let mut data = vec![0u8; 10];
        assert!(enc.apply(&mut data).is_err());
    }

    fn framed_record(payload: &[u8]) -> Vec<u8> {
        // length || padding_length || payload || 4 bytes padding
        let body_len = 1 + payload.len() + 4;
        let mut record = Vec::new();
        record.extend_from_slice(&(body_len as u32).to_be_bytes());
        record.push(4);
        record.extend_from_slice(payload);
        record.extend_from_slice(&[0u8; 4]);
        record
    }

    #[test]
    fn test_gcm_seal_open_round_trip() {
        let key = [1u8; 16];
        let iv = [2u8; 12];
        let mut seal =
            Cipher::new(CipherAlgorithm::Aes128Gcm, CipherDirection::Encrypt, &key, &iv).unwrap();
        let mut open =
            Cipher::new(CipherAlgorithm::Aes128Gcm, CipherDirection::Decrypt, &key, &iv).unwrap();

        let mut record = framed_record(b"hello gcm");
        let plain_body = record[4..].to_vec();
        seal.aead_seal(&mut record, 0).unwrap();

        let mut len_bytes = [0u8; 4];
        len_bytes.copy_from_slice(&record[..4]);
        // GCM leaves the length in cleartext.
        let mut probe = len_bytes;
        open.aead_open_length(&mut probe, 0).unwrap();
        assert_eq!(probe, len_bytes);

        let mut body = record[4..].to_vec();
        let opened = open.aead_open(len_bytes, &mut body, 0).unwrap();
        assert_eq!(opened, plain_body);
    }

    #[test]
    fn test_gcm_tamper_detected() {
        let key = [1u8; 32];
        let iv = [2u8; 12];
        let mut seal =
            Cipher::new(CipherAlgorithm::Aes256Gcm, CipherDirection::Encrypt, &key, &iv).unwrap();
        let mut open =
            Cipher::new(CipherAlgorithm::Aes256Gcm, CipherDirection::Decrypt, &key, &iv).unwrap();

        let mut record = framed_record(b"tamper me");
        seal.aead_seal(&mut record, 0).unwrap();
        let mut len_bytes = [0u8; 4];
        len_bytes.copy_from_slice(&record[..4]);
        let mut body = record[4..].to_vec();
        body[0] ^= 0x01;
        assert!(matches!(
            open.aead_open(len_bytes, &mut body, 0),
            Err(SkiffError::MacFailure)
        ));
    }

    #[test]
    fn test_chacha_seal_open_round_trip() {
        let key = [0x42u8; 64];
        let mut seal = Cipher::new(
            CipherAlgorithm::ChaCha20Poly1305,
            CipherDirection::Encrypt,
            &key,
            &[],
        )
        .unwrap();
        let mut open = Cipher::new(
            CipherAlgorithm::ChaCha20Poly1305,
            CipherDirection::Decrypt,
            &key,
            &[],
        )
        .unwrap();

        let mut record = framed_record(b"chacha payload");
        let plain_len: [u8; 4] = record[..4].try_into().unwrap();
        let plain_body = record[4..].to_vec();
        seal.aead_seal(&mut record, 3).unwrap();

        // The length field is encrypted on the wire.
        let mut wire_len: [u8; 4] = record[..4].try_into().unwrap();
        assert_ne!(wire_len, plain_len);
        let sealed_len = wire_len;
        open.aead_open_length(&mut wire_len, 3).unwrap();
        assert_eq!(wire_len, plain_len);

        let mut body = record[4..].to_vec();
        let opened = open.aead_open(sealed_len, &mut body, 3).unwrap();
        assert_eq!(opened, plain_body);
    }

    #[test]
    fn test_chacha_wrong_seq_fails() {
        let key = [0x42u8; 64];
        let mut seal = Cipher::new(
            CipherAlgorithm::ChaCha20Poly1305,
            CipherDirection::Encrypt,
            &key,
            &[],
        )
        .unwrap();
        let mut open = Cipher::new(
            CipherAlgorithm::ChaCha20Poly1305,
            CipherDirection::Decrypt,
            &key,
            &[],
        )
        .unwrap();

        let mut record = framed_record(b"seq matters");
        seal.aead_seal(&mut record, 1).unwrap();
        let sealed_len: [u8; 4] = record[..4].try_into().unwrap();
        let mut body = record[4..].to_vec();
        assert!(open.aead_open(sealed_len, &mut body, 2).is_err());
    }

    #[test]
    fn test_mac_algorithm_properties() {
        assert_eq!(MacAlgorithm::HmacSha256.key_size(), 32);
        assert_eq!(MacAlgorithm::HmacSha512.mac_size(), 64);
        assert_eq!(MacAlgorithm::HmacSha1.key_size(), 20);
        assert!(!MacAlgorithm::HmacSha256.is_etm());
        assert!(MacAlgorithm::HmacSha256Etm.is_etm());
        assert_eq!(
            MacAlgorithm::from_name("hmac-sha2-512-etm@openssh.com"),
            Some(MacAlgorithm::HmacSha512Etm)
        );
    }

    #[test]
    fn test_mac_compute_and_verify() {
        let key = vec![0x11u8; 32];
        let mac = MacKey::new(MacAlgorithm::HmacSha256, &key).unwrap();

        let tag = mac.compute(7, b"payload");
        assert_eq!(tag.len(), 32);
        assert!(mac.verify(7, b"payload", &tag).is_ok());
        // Wrong sequence number must fail.
        assert!(matches!(
            mac.verify(8, b"payload", &tag),
            Err(SkiffError::MacFailure)
        ));
        // Wrong data must fail.
        assert!(mac.verify(7, b"payloae", &tag).is_err());
    }

    #[test]
    fn test_mac_sha1() {
        let key = vec![0x22u8; 20];
        let mac = MacKey::new(MacAlgorithm::HmacSha1, &key).unwrap();
        let tag = mac.compute(0, b"data");
        assert_eq!(tag.len(), 20);
        assert!(mac.verify(0, b"data", &tag).is_ok());
    }

    #[test]
    fn test_gcm_nonce_advance() {
        let mut nonce = [0u8; 12];
        nonce[11] = 0xff;
        gcm_advance_nonce(&mut nonce);
        assert_eq!(nonce[11], 0x00);
        assert_eq!(nonce[10], 0x01);
    }
}
