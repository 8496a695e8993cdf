//! Payload compression (RFC 4253 Section 6.2).
//!
//! The catalogue carries `none` and `zlib@openssh.com`. The OpenSSH
//! variant is "delayed": negotiated at kex time but inactive until user
//! authentication succeeds. Both directions keep their own zlib stream,
//! and that stream survives rekeys so the dictionary built up over the
//! connection is not lost.

use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};
use skiff_platform::{SkiffError, SkiffResult};

const CHUNK: usize = 4096;

/// Compression algorithm identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionAlgorithm {
    /// No compression.
    None,
    /// zlib compression, activated only after authentication succeeds.
    ZlibOpenSsh,
}

impl CompressionAlgorithm {
    /// Returns the algorithm name.
    pub fn name(&self) -> &'static str {
        match self {
            CompressionAlgorithm::None => "none",
            CompressionAlgorithm::ZlibOpenSsh => "zlib@openssh.com",
        }
    }

    /// Parses a compression algorithm from its name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "none" => Some(CompressionAlgorithm::None),
            "zlib@openssh.com" => Some(CompressionAlgorithm::ZlibOpenSsh),
            _ => None,
        }
    }
}

/// Outbound compression state for one direction.
pub struct Compressor {
    algorithm: CompressionAlgorithm,
    active: bool,
    stream: Option<Compress>,
}

impl Compressor {
    /// Creates a compressor for the negotiated algorithm.
    ///
    /// A `zlib@openssh.com` compressor starts inactive; call
    /// [`Compressor::activate`] once authentication succeeds.
    pub fn new(algorithm: CompressionAlgorithm) -> Self {
        let stream = match algorithm {
            CompressionAlgorithm::None => None,
            CompressionAlgorithm::ZlibOpenSsh => Some(Compress::new(Compression::default(), true)),
        };
        Self {
            algorithm,
            active: false,
            stream,
        }
    }

    /// Returns the algorithm.
    pub fn algorithm(&self) -> CompressionAlgorithm {
        self.algorithm
    }

    /// Returns whether payloads are currently being transformed.
    pub fn is_active(&self) -> bool {
        self.active && self.stream.is_some()
    }

    /// Enables the delayed compressor. No-op for `none`.
    pub fn activate(&mut self) {
        self.active = true;
    }

    /// Compresses a payload, or passes it through when inactive.
    pub fn compress(&mut self, data: &[u8]) -> SkiffResult<Vec<u8>> {
        if !self.active {
            return Ok(data.to_vec());
        }
        let Some(stream) = self.stream.as_mut() else {
            return Ok(data.to_vec());
        };

        let mut out = Vec::with_capacity(data.len() / 2 + 16);
        let mut chunk = [0u8; CHUNK];
        let mut input = data;
        loop {
            let in_before = stream.total_in();
            let out_before = stream.total_out();
            let status = stream
                .compress(input, &mut chunk, FlushCompress::Partial)
                .map_err(|e| SkiffError::Protocol(format!("zlib compress: {}", e)))?;
            let read = (stream.total_in() - in_before) as usize;
            let written = (stream.total_out() - out_before) as usize;
            out.extend_from_slice(&chunk[..written]);
            input = &input[read..];
            if matches!(status, Status::StreamEnd) || (input.is_empty() && written < CHUNK) {
                break;
            }
        }
        Ok(out)
    }
}

impl std::fmt::Debug for Compressor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Compressor")
            .field("algorithm", &self.algorithm.name())
            .field("active", &self.active)
            .finish()
    }
}

/// Inbound decompression state for one direction.
pub struct Decompressor {
    algorithm: CompressionAlgorithm,
    active: bool,
    stream: Option<Decompress>,
}

impl Decompressor {
    /// Creates a decompressor for the negotiated algorithm.
    pub fn new(algorithm: CompressionAlgorithm) -> Self {
        let stream = match algorithm {
            CompressionAlgorithm::None => None,
            CompressionAlgorithm::ZlibOpenSsh => Some(Decompress::new(true)),
        };
        Self {
            algorithm,
            active: false,
            stream,
        }
    }

    /// Returns the algorithm.
    pub fn algorithm(&self) -> CompressionAlgorithm {
        self.algorithm
    }

    /// Enables the delayed decompressor. No-op for `none`.
    pub fn activate(&mut self) {
        self.active = true;
    }

    /// Decompresses a payload, or passes it through when inactive.
    pub fn decompress(&mut self, data: &[u8]) -> SkiffResult<Vec<u8>> {
        if !self.active {
            return Ok(data.to_vec());
        }
        let Some(stream) = self.stream.as_mut() else {
            return Ok(data.to_vec());
        };

        let mut out = Vec::with_capacity(data.len() * 2 + 16);
        let mut chunk = [0u8; CHUNK];
        let mut input = data;
        loop {
            let in_before = stream.total_in();
            let out_before = stream.total_out();
            let status = stream
                .decompress(input, &mut chunk, FlushDecompress::None)
                .map_err(|e| SkiffError::MalformedPacket(format!("zlib decompress: {}", e)))?;
            let read = (stream.total_in() - in_before) as usize;
            let written = (stream.total_out() - out_before) as usize;
            out.extend_from_slice(&chunk[..written]);
            input = &input[read..];
            if matches!(status, Status::StreamEnd) || (input.is_empty() && written < CHUNK) {
                break;
            }
        }
        Ok(out)
    }
}

impl std::fmt::Debug for Decompressor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Decompressor")
            .field("algorithm", &self.algorithm.name())
            .field("active", &self.active)
            .finish()
    }
}
