//! SSH binary packet protocol (RFC 4253 Section 6).
//!
//! # Packet Format
//!
//! ```text
//! uint32    packet_length
//! byte      padding_length
//! byte[n1]  payload (n1 = packet_length - padding_length - 1)
//! byte[n2]  random padding (n2 = padding_length)
//! byte[m]   mac (MAC = Message Authentication Code)
//! ```
//!
//! # Constraints
//!
//! - `packet_length` does NOT include the MAC or the length field itself
//! - `padding_length` is between 4 and 255 bytes
//! - The padded record is a multiple of the cipher block size (minimum 8);
//!   for AEAD and encrypt-then-MAC modes the 4-byte length prefix is
//!   excluded from the alignment
//! - Maximum packet size: 35000 bytes
//!
//! # Modes
//!
//! [`PacketSealer`] and [`PacketOpener`] each hold one direction's cipher,
//! MAC, compression and sequence state. Four wire layouts exist:
//!
//! - plaintext (before NEWKEYS)
//! - cipher + MAC: encrypt the whole record, MAC over `seq || plaintext`
//! - cipher + ETM MAC: length stays cleartext, MAC over
//!   `seq || length || ciphertext`
//! - AEAD: length is associated data (GCM) or header-key encrypted
//!   (ChaCha20), tag replaces the MAC
//!
//! Sequence numbers wrap modulo 2^32, reset to zero at NEWKEYS under
//! strict-KEX, and must never wrap before the initial key exchange has
//! completed (prefix-truncation defence).

use rand::RngCore;
use skiff_platform::{SkiffError, SkiffResult};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::ssh::compress::{CompressionAlgorithm, Compressor, Decompressor};
use crate::ssh::crypto::{Cipher, MacKey};

/// Maximum packet size in bytes (65536 payload ceiling plus slack).
pub const MAX_PACKET_SIZE: usize = 35000;

/// Minimum total packet size before the MAC.
pub const MIN_PACKET_SIZE: usize = 16;

/// Minimum padding length in bytes (RFC 4253 Section 6).
pub const MIN_PADDING_LEN: usize = 4;

/// Maximum padding length in bytes (fits in u8).
pub const MAX_PADDING_LEN: usize = 255;

/// A packet received from the peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundPacket {
    /// Decrypted, decompressed payload.
    pub payload: Vec<u8>,
    /// Sequence number this packet was received under.
    pub seq: u32,
}

/// Computes the padding length for a record.
///
/// `aligned_len` is the record length subject to block alignment: the
/// whole record for classic modes, the record minus the 4-byte length
/// prefix for ETM and AEAD modes.
fn padding_for(aligned_len: usize, block_len: usize) -> usize {
    let mut padding = block_len - (aligned_len + MIN_PADDING_LEN) % block_len;
    padding += MIN_PADDING_LEN;
    if aligned_len + padding < MIN_PACKET_SIZE.min(block_len * 2) {
        padding += block_len;
    }
    padding
}

/// Outbound half of the record layer.
pub struct PacketSealer {
    cipher: Option<Cipher>,
    mac: Option<MacKey>,
    compressor: Compressor,
    seq: u32,
    initial_kex_done: bool,
}

impl PacketSealer {
    /// Creates a plaintext sealer, as used before the first NEWKEYS.
    pub fn new() -> Self {
        Self {
            cipher: None,
            mac: None,
            compressor: Compressor::new(CompressionAlgorithm::None),
            seq: 0,
            initial_kex_done: false,
        }
    }

    /// Returns the next outbound sequence number.
    pub fn seq(&self) -> u32 {
        self.seq
    }

    /// Installs newly derived keys. `compressor` of `None` keeps the
    /// current compression stream (rekey with an unchanged algorithm).
    pub fn install(
        &mut self,
        cipher: Option<Cipher>,
        mac: Option<MacKey>,
        compressor: Option<Compressor>,
    ) {
        self.cipher = cipher;
        self.mac = mac;
        if let Some(compressor) = compressor {
            self.compressor = compressor;
        }
    }

    /// Marks the initial key exchange complete, permitting sequence wrap.
    pub fn mark_initial_kex_complete(&mut self) {
        self.initial_kex_done = true;
    }

    /// Resets the sequence number to zero (strict-KEX, after NEWKEYS).
    pub fn reset_seq(&mut self) {
        self.seq = 0;
    }

    /// Enables the delayed outbound compressor after auth success.
    pub fn activate_compression(&mut self) {
        self.compressor.activate();
    }

    /// Builds the wire encoding of one packet and advances the sequence
    /// number.
    ///
    /// # Errors
    ///
    /// - [`SkiffError::PacketTooLarge`] if the sealed packet exceeds
    ///   [`MAX_PACKET_SIZE`]
    /// - [`SkiffError::KexFailed`] if the sequence number would wrap
    ///   before the initial key exchange completed
    pub fn seal(&mut self, payload: &[u8]) -> SkiffResult<Vec<u8>> {
        let payload = self.compressor.compress(payload)?;

        let aead = self
            .cipher
            .as_ref()
            .map(|c| c.algorithm().is_aead())
            .unwrap_or(false);
        let etm = self.mac.as_ref().map(|m| m.algorithm().is_etm()).unwrap_or(false);
        let block_len = self
            .cipher
            .as_ref()
            .map(|c| c.algorithm().block_len())
            .unwrap_or(8);

        // For AEAD/ETM the length field is excluded from alignment.
        let aligned_prefix = if aead || etm { 1 } else { 5 };
        let padding_len = padding_for(aligned_prefix + payload.len(), block_len);
        debug_assert!((MIN_PADDING_LEN..=MAX_PADDING_LEN).contains(&padding_len));

        let packet_length = 1 + payload.len() + padding_len;
        let mut record = Vec::with_capacity(4 + packet_length + 64);
        record.extend_from_slice(&(packet_length as u32).to_be_bytes());
        record.push(padding_len as u8);
        record.extend_from_slice(&payload);
        let pad_start = record.len();
        record.resize(pad_start + padding_len, 0);
        rand::thread_rng().fill_bytes(&mut record[pad_start..]);

        let seq = self.seq;
        match (&mut self.cipher, &self.mac) {
            (None, _) => {}
            (Some(cipher), _) if aead => {
                cipher.aead_seal(&mut record, seq)?;
            }
            (Some(cipher), Some(mac)) if etm => {
                cipher.apply(&mut record[4..])?;
                let tag = mac.compute(seq, &record);
                record.extend_from_slice(&tag);
            }
            (Some(cipher), Some(mac)) => {
                let tag = mac.compute(seq, &record);
                cipher.apply(&mut record)?;
                record.extend_from_slice(&tag);
            }
            (Some(_), None) => {
                return Err(SkiffError::Protocol(
                    "cipher installed without MAC".to_string(),
                ))
            }
        }

        if record.len() > MAX_PACKET_SIZE {
            return Err(SkiffError::PacketTooLarge(record.len()));
        }

        self.advance_seq()?;
        Ok(record)
    }

    fn advance_seq(&mut self) -> SkiffResult<()> {
        self.seq = self.seq.wrapping_add(1);
        if self.seq == 0 && !self.initial_kex_done {
            return Err(SkiffError::KexFailed(
                "sequence number wrapped during initial key exchange".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for PacketSealer {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for PacketSealer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketSealer")
            .field("seq", &self.seq)
            .field("encrypted", &self.cipher.is_some())
            .finish()
    }
}

/// Inbound half of the record layer.
pub struct PacketOpener {
    cipher: Option<Cipher>,
    mac: Option<MacKey>,
    decompressor: Decompressor,
    seq: u32,
    initial_kex_done: bool,
}

impl PacketOpener {
    /// Creates a plaintext opener, as used before the first NEWKEYS.
    pub fn new() -> Self {
        Self {
            cipher: None,
            mac: None,
            decompressor: Decompressor::new(CompressionAlgorithm::None),
            seq: 0,
            initial_kex_done: false,
        }
    }

    /// Returns the next inbound sequence number.
    pub fn seq(&self) -> u32 {
        self.seq
    }

    /// Installs newly derived keys. `decompressor` of `None` keeps the
    /// current decompression stream.
    pub fn install(
        &mut self,
        cipher: Option<Cipher>,
        mac: Option<MacKey>,
        decompressor: Option<Decompressor>,
    ) {
        self.cipher = cipher;
        self.mac = mac;
        if let Some(decompressor) = decompressor {
            self.decompressor = decompressor;
        }
    }

    /// Marks the initial key exchange complete, permitting sequence wrap.
    pub fn mark_initial_kex_complete(&mut self) {
        self.initial_kex_done = true;
    }

    /// Resets the sequence number to zero (strict-KEX, after NEWKEYS).
    pub fn reset_seq(&mut self) {
        self.seq = 0;
    }

    /// Enables the delayed inbound decompressor after auth success.
    pub fn activate_compression(&mut self) {
        self.decompressor.activate();
    }

    /// Reads, authenticates, decrypts and decompresses one packet.
    pub async fn read_packet<R>(&mut self, reader: &mut R) -> SkiffResult<InboundPacket>
    where
        R: AsyncRead + Unpin,
    {
        let aead = self
            .cipher
            .as_ref()
            .map(|c| c.algorithm().is_aead())
            .unwrap_or(false);
        let etm = self.mac.as_ref().map(|m| m.algorithm().is_etm()).unwrap_or(false);
        let block_len = self
            .cipher
            .as_ref()
            .map(|c| c.algorithm().block_len())
            .unwrap_or(8);
        let seq = self.seq;

        // Step 1: obtain the packet length.
        let (packet_length, first_block, wire_len_bytes) = if self.cipher.is_none() || aead || etm
        {
            let mut len_bytes = [0u8; 4];
            read_exact_or_lost(reader, &mut len_bytes).await?;
            let wire = len_bytes;
            if aead {
                self.cipher
                    .as_mut()
                    .expect("aead implies cipher")
                    .aead_open_length(&mut len_bytes, seq)?;
            }
            (u32::from_be_bytes(len_bytes) as usize, Vec::new(), wire)
        } else {
            // Classic mode: the length is inside the first encrypted block.
            let mut block = vec![0u8; block_len];
            read_exact_or_lost(reader, &mut block).await?;
            self.cipher
                .as_mut()
                .expect("classic mode has a cipher")
                .apply(&mut block)?;
            let len = u32::from_be_bytes([block[0], block[1], block[2], block[3]]) as usize;
            (len, block, [0u8; 4])
        };

        // Step 2: validate the length field.
        if packet_length < block_len.saturating_sub(4)
            || packet_length < 5
            || packet_length > MAX_PACKET_SIZE - 4
        {
            return Err(SkiffError::Protocol(format!(
                "invalid packet length {}",
                packet_length
            )));
        }
        let aligned = if aead || etm {
            packet_length % block_len == 0
        } else {
            (packet_length + 4) % block_len == 0
        };
        if !aligned {
            return Err(SkiffError::Protocol(format!(
                "packet length {} not aligned to block size {}",
                packet_length, block_len
            )));
        }

        // Step 3: read the remainder plus MAC/tag and recover the record.
        let tag_len = if aead {
            self.cipher.as_ref().expect("aead cipher").algorithm().tag_size()
        } else {
            self.mac.as_ref().map(|m| m.algorithm().mac_size()).unwrap_or(0)
        };

        let record = if aead {
            let mut body = vec![0u8; packet_length + tag_len];
            read_exact_or_lost(reader, &mut body).await?;
            self.cipher
                .as_mut()
                .expect("aead cipher")
                .aead_open(wire_len_bytes, &mut body, seq)?
        } else if etm {
            let mut body = vec![0u8; packet_length + tag_len];
            read_exact_or_lost(reader, &mut body).await?;
            let (ciphertext, tag) = body.split_at(packet_length);
            let mac = self.mac.as_ref().expect("etm implies mac");
            let mut authed = Vec::with_capacity(4 + packet_length);
            authed.extend_from_slice(&wire_len_bytes);
            authed.extend_from_slice(ciphertext);
            mac.verify(seq, &authed, tag)?;
            body.truncate(packet_length);
            self.cipher
                .as_mut()
                .expect("etm implies cipher")
                .apply(&mut body)?;
            body
        } else if self.cipher.is_some() {
            // Classic: first block already decrypted, decrypt the rest,
            // then verify the MAC over the plaintext record.
            let remaining = 4 + packet_length - first_block.len();
            let mut rest = vec![0u8; remaining + tag_len];
            read_exact_or_lost(reader, &mut rest).await?;
            let (ciphertext, tag) = rest.split_at_mut(remaining);
            self.cipher
                .as_mut()
                .expect("classic mode has a cipher")
                .apply(ciphertext)?;
            let mut record = first_block;
            record.extend_from_slice(ciphertext);
            let mac = self
                .mac
                .as_ref()
                .ok_or_else(|| SkiffError::Protocol("cipher installed without MAC".to_string()))?;
            mac.verify(seq, &record, tag)?;
            record.drain(..4);
            record
        } else {
            let mut body = vec![0u8; packet_length];
            read_exact_or_lost(reader, &mut body).await?;
            body
        };

        // Step 4: strip padding.
        if record.is_empty() {
            return Err(SkiffError::MalformedPacket("empty record".to_string()));
        }
        let padding_len = record[0] as usize;
        if padding_len < MIN_PADDING_LEN {
            return Err(SkiffError::MalformedPacket(format!(
                "padding too short: {} bytes",
                padding_len
            )));
        }
        if 1 + padding_len >= record.len() {
            return Err(SkiffError::MalformedPacket(format!(
                "padding length {} exceeds packet",
                padding_len
            )));
        }
        let payload = &record[1..record.len() - padding_len];

        // Step 5: decompress.
        let payload = self.decompressor.decompress(payload)?;

        self.advance_seq()?;
        Ok(InboundPacket { payload, seq })
    }

    fn advance_seq(&mut self) -> SkiffResult<()> {
        self.seq = self.seq.wrapping_add(1);
        if self.seq == 0 && !self.initial_kex_done {
            return Err(SkiffError::KexFailed(
                "sequence number wrapped during initial key exchange".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for PacketOpener {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for PacketOpener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketOpener")
            .field("seq", &self.seq)
            .field("encrypted", &self.cipher.is_some())
            .finish()
    }
}

async fn read_exact_or_lost<R>(reader: &mut R, buf: &mut [u8]) -> SkiffResult<()>
where
    R: AsyncRead + Unpin,
{
    reader.read_exact(buf).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            SkiffError::ConnectionLost
        } else {
            SkiffError::Io(e)
        }
    })?;
    Ok(())
}
