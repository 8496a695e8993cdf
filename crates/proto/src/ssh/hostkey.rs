//! Server host key verification.
//!
//! During key exchange the server proves possession of its host key by
//! signing the exchange hash `H`. This module parses the wire-format key
//! and signature blobs and verifies the signature for the algorithms of
//! the default catalogue:
//!
//! - ssh-ed25519
//! - ecdsa-sha2-nistp256 / nistp384 / nistp521
//! - rsa-sha2-512 / rsa-sha2-256 / ssh-rsa
//!
//! For the RSA SHA-2 algorithms the *key* blob still carries the name
//! `ssh-rsa`; only the signature blob names the SHA-2 variant
//! (RFC 8332).

use ed25519_dalek::Verifier as _;
use ring::signature::{
    RsaPublicKeyComponents, RSA_PKCS1_2048_8192_SHA1_FOR_LEGACY_USE_ONLY,
    RSA_PKCS1_2048_8192_SHA256, RSA_PKCS1_2048_8192_SHA512,
};
use skiff_platform::{SkiffError, SkiffResult};

use crate::ssh::wire;

/// Host key algorithms of the default catalogue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostKeyAlgorithm {
    /// ssh-ed25519 (RFC 8709)
    SshEd25519,
    /// ecdsa-sha2-nistp256 (RFC 5656)
    EcdsaSha2Nistp256,
    /// ecdsa-sha2-nistp384 (RFC 5656)
    EcdsaSha2Nistp384,
    /// ecdsa-sha2-nistp521 (RFC 5656)
    EcdsaSha2Nistp521,
    /// rsa-sha2-512 (RFC 8332)
    RsaSha2_512,
    /// rsa-sha2-256 (RFC 8332)
    RsaSha2_256,
    /// ssh-rsa (RFC 4253, SHA-1, legacy)
    SshRsa,
}

impl HostKeyAlgorithm {
    /// Returns the algorithm name.
    pub fn name(&self) -> &'static str {
        match self {
            HostKeyAlgorithm::SshEd25519 => "ssh-ed25519",
            HostKeyAlgorithm::EcdsaSha2Nistp256 => "ecdsa-sha2-nistp256",
            HostKeyAlgorithm::EcdsaSha2Nistp384 => "ecdsa-sha2-nistp384",
            HostKeyAlgorithm::EcdsaSha2Nistp521 => "ecdsa-sha2-nistp521",
            HostKeyAlgorithm::RsaSha2_512 => "rsa-sha2-512",
            HostKeyAlgorithm::RsaSha2_256 => "rsa-sha2-256",
            HostKeyAlgorithm::SshRsa => "ssh-rsa",
        }
    }

    /// Parses a host key algorithm from its name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "ssh-ed25519" => Some(HostKeyAlgorithm::SshEd25519),
            "ecdsa-sha2-nistp256" => Some(HostKeyAlgorithm::EcdsaSha2Nistp256),
            "ecdsa-sha2-nistp384" => Some(HostKeyAlgorithm::EcdsaSha2Nistp384),
            "ecdsa-sha2-nistp521" => Some(HostKeyAlgorithm::EcdsaSha2Nistp521),
            "rsa-sha2-512" => Some(HostKeyAlgorithm::RsaSha2_512),
            "rsa-sha2-256" => Some(HostKeyAlgorithm::RsaSha2_256),
            "ssh-rsa" => Some(HostKeyAlgorithm::SshRsa),
            _ => None,
        }
    }

    /// Returns the key-blob name this algorithm expects.
    ///
    /// The RSA SHA-2 signature algorithms operate over `ssh-rsa` keys.
    pub fn key_blob_name(&self) -> &'static str {
        match self {
            HostKeyAlgorithm::RsaSha2_512
            | HostKeyAlgorithm::RsaSha2_256
            | HostKeyAlgorithm::SshRsa => "ssh-rsa",
            other => other.name(),
        }
    }
}

/// Returns the algorithm name embedded in a host key blob.
pub fn key_blob_algorithm(host_key_blob: &[u8]) -> SkiffResult<String> {
    let mut offset = 0;
    wire::read_utf8(host_key_blob, &mut offset)
}

/// Verifies the server's signature over `data` (the exchange hash).
///
/// `negotiated` is the host-key algorithm chosen during KEXINIT; the key
/// blob and the signature blob must both be consistent with it.
///
/// # Errors
///
/// Returns [`SkiffError::KexFailed`] on any mismatch or an invalid
/// signature.
pub fn verify_signature(
    negotiated: HostKeyAlgorithm,
    host_key_blob: &[u8],
    signature_blob: &[u8],
    data: &[u8],
) -> SkiffResult<()> {
    let mut key_offset = 0;
    let key_name = wire::read_utf8(host_key_blob, &mut key_offset)?;
    if key_name != negotiated.key_blob_name() {
        return Err(SkiffError::KexFailed(format!(
            "host key blob is {} but {} was negotiated",
            key_name,
            negotiated.name()
        )));
    }

    let mut sig_offset = 0;
    let sig_name = wire::read_utf8(signature_blob, &mut sig_offset)?;
    if sig_name != negotiated.name() {
        return Err(SkiffError::KexFailed(format!(
            "signature is {} but {} was negotiated",
            sig_name,
            negotiated.name()
        )));
    }
    let signature = wire::read_string(signature_blob, &mut sig_offset)?;

    match negotiated {
        HostKeyAlgorithm::SshEd25519 => {
            let key_bytes = wire::read_string(host_key_blob, &mut key_offset)?;
            let key_array: [u8; 32] = key_bytes
                .as_slice()
                .try_into()
                .map_err(|_| SkiffError::KexFailed("bad ed25519 key length".to_string()))?;
            let verifying_key = ed25519_dalek::VerifyingKey::from_bytes(&key_array)
                .map_err(|_| SkiffError::KexFailed("invalid ed25519 host key".to_string()))?;
            let sig_array: [u8; 64] = signature
                .as_slice()
                .try_into()
                .map_err(|_| SkiffError::KexFailed("bad ed25519 signature length".to_string()))?;
            verifying_key
                .verify(data, &ed25519_dalek::Signature::from_bytes(&sig_array))
                .map_err(|_| SkiffError::KexFailed("ed25519 signature invalid".to_string()))
        }
        HostKeyAlgorithm::EcdsaSha2Nistp256 => {
            let point = ecdsa_point(negotiated, host_key_blob, &mut key_offset, "nistp256")?;
            let sig = ecdsa_fixed_signature(&signature, 32)?;
            let verifying_key = p256::ecdsa::VerifyingKey::from_sec1_bytes(&point)
                .map_err(|_| SkiffError::KexFailed("invalid nistp256 host key".to_string()))?;
            let sig = p256::ecdsa::Signature::from_slice(&sig)
                .map_err(|_| SkiffError::KexFailed("invalid nistp256 signature".to_string()))?;
            verifying_key
                .verify(data, &sig)
                .map_err(|_| SkiffError::KexFailed("nistp256 signature invalid".to_string()))
        }
        HostKeyAlgorithm::EcdsaSha2Nistp384 => {
            let point = ecdsa_point(negotiated, host_key_blob, &mut key_offset, "nistp384")?;
            let sig = ecdsa_fixed_signature(&signature, 48)?;
            let verifying_key = p384::ecdsa::VerifyingKey::from_sec1_bytes(&point)
                .map_err(|_| SkiffError::KexFailed("invalid nistp384 host key".to_string()))?;
            let sig = p384::ecdsa::Signature::from_slice(&sig)
                .map_err(|_| SkiffError::KexFailed("invalid nistp384 signature".to_string()))?;
            verifying_key
                .verify(data, &sig)
                .map_err(|_| SkiffError::KexFailed("nistp384 signature invalid".to_string()))
        }
        HostKeyAlgorithm::EcdsaSha2Nistp521 => {
            let point = ecdsa_point(negotiated, host_key_blob, &mut key_offset, "nistp521")?;
            let sig = ecdsa_fixed_signature(&signature, 66)?;
            let verifying_key = p521::ecdsa::VerifyingKey::from_sec1_bytes(&point)
                .map_err(|_| SkiffError::KexFailed("invalid nistp521 host key".to_string()))?;
            let sig = p521::ecdsa::Signature::from_slice(&sig)
                .map_err(|_| SkiffError::KexFailed("invalid nistp521 signature".to_string()))?;
            verifying_key
                .verify(data, &sig)
                .map_err(|_| SkiffError::KexFailed("nistp521 signature invalid".to_string()))
        }
        HostKeyAlgorithm::RsaSha2_512 | HostKeyAlgorithm::RsaSha2_256 | HostKeyAlgorithm::SshRsa => {
            let e = wire::read_mpint(host_key_blob, &mut key_offset)?;
            let n = wire::read_mpint(host_key_blob, &mut key_offset)?;
            let params = match negotiated {
                HostKeyAlgorithm::RsaSha2_512 => &RSA_PKCS1_2048_8192_SHA512,
                HostKeyAlgorithm::RsaSha2_256 => &RSA_PKCS1_2048_8192_SHA256,
                _ => &RSA_PKCS1_2048_8192_SHA1_FOR_LEGACY_USE_ONLY,
            };
            RsaPublicKeyComponents { n: &n, e: &e }
                .verify(params, data, &signature)
                .map_err(|_| SkiffError::KexFailed("RSA signature invalid".to_string()))
        }
    }
}

/// Reads the curve-id and SEC1 point of an ECDSA key blob.
fn ecdsa_point(
    algorithm: HostKeyAlgorithm,
    blob: &[u8],
    offset: &mut usize,
    expected_curve: &str,
) -> SkiffResult<Vec<u8>> {
    let curve = wire::read_utf8(blob, offset)?;
    if curve != expected_curve {
        return Err(SkiffError::KexFailed(format!(
            "{} key carries curve id {}",
            algorithm.name(),
            curve
        )));
    }
    wire::read_string(blob, offset)
}

/// Converts the SSH `(mpint r, mpint s)` signature encoding to the fixed
/// `r || s` form, left-padding each scalar to the field size.
fn ecdsa_fixed_signature(signature: &[u8], field_len: usize) -> SkiffResult<Vec<u8>> {
    let mut offset = 0;
    let r = wire::read_mpint(signature, &mut offset)?;
    let s = wire::read_mpint(signature, &mut offset)?;
    if r.len() > field_len || s.len() > field_len {
        return Err(SkiffError::KexFailed(
            "ECDSA signature scalar too long".to_string(),
        ));
    }
    let mut fixed = vec![0u8; field_len * 2];
    fixed[field_len - r.len()..field_len].copy_from_slice(&r);
    fixed[2 * field_len - s.len()..].copy_from_slice(&s);
    Ok(fixed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;
    use ed25519_dalek::Signer as _;

    fn ed25519_blobs(data: &[u8]) -> (Vec<u8>, Vec<u8>) {
        let mut rng = rand::rngs::OsRng;
        let signing_key = ed25519_dalek::SigningKey::generate(&mut rng);
        let verifying_key = signing_key.verifying_key();

        let mut key_blob = BytesMut::new();
        wire::write_utf8(&mut key_blob, "ssh-ed25519");
        wire::write_string(&mut key_blob, verifying_key.as_bytes());

        let signature = signing_key.sign(data);
        let mut sig_blob = BytesMut::new();
        wire::write_utf8(&mut sig_blob, "ssh-ed25519");
        wire::write_string(&mut sig_blob, &signature.to_bytes());

        (key_blob.to_vec(), sig_blob.to_vec())
    }

    #[test]
    fn test_algorithm_names() {
        assert_eq!(HostKeyAlgorithm::SshEd25519.name(), "ssh-ed25519");
        assert_eq!(
            HostKeyAlgorithm::from_name("rsa-sha2-512"),
            Some(HostKeyAlgorithm::RsaSha2_512)
        );
        assert!(HostKeyAlgorithm::from_name("ssh-dss").is_none());
    }

    #[test]
    fn test_rsa_key_blob_name_aliasing() {
        assert_eq!(HostKeyAlgorithm::RsaSha2_256.key_blob_name(), "ssh-rsa");
        assert_eq!(HostKeyAlgorithm::RsaSha2_512.key_blob_name(), "ssh-rsa");
        assert_eq!(HostKeyAlgorithm::SshRsa.key_blob_name(), "ssh-rsa");
        assert_eq!(
            HostKeyAlgorithm::EcdsaSha2Nistp256.key_blob_name(),
            "ecdsa-sha2-nistp256"
        );
    }

    #[test]
    fn test_ed25519_verify_ok() {
        let data = b"exchange hash";
        let (key_blob, sig_blob) = ed25519_blobs(data);
        assert_eq!(key_blob_algorithm(&key_blob).unwrap(), "ssh-ed25519");
        verify_signature(HostKeyAlgorithm::SshEd25519, &key_blob, &sig_blob, data).unwrap();
    }

    #[test]
    fn test_ed25519_verify_bad_data() {
        let data = b"exchange hash";
        let (key_blob, sig_blob) = ed25519_blobs(data);
        let result =
            verify_signature(HostKeyAlgorithm::SshEd25519, &key_blob, &sig_blob, b"other data");
        assert!(matches!(result, Err(SkiffError::KexFailed(_))));
    }

    #[test]
    fn test_mismatched_negotiation_rejected() {
        let data = b"exchange hash";
        let (key_blob, sig_blob) = ed25519_blobs(data);
        let result =
            verify_signature(HostKeyAlgorithm::EcdsaSha2Nistp256, &key_blob, &sig_blob, data);
        assert!(matches!(result, Err(SkiffError::KexFailed(_))));
    }

    #[test]
    fn test_ecdsa_p256_verify_ok() {
        use p256::ecdsa::signature::Signer as _;

        let signing_key = p256::ecdsa::SigningKey::random(&mut rand::rngs::OsRng);
        let verifying_key = p256::ecdsa::VerifyingKey::from(&signing_key);
        let data = b"exchange hash";

        let mut key_blob = BytesMut::new();
        wire::write_utf8(&mut key_blob, "ecdsa-sha2-nistp256");
        wire::write_utf8(&mut key_blob, "nistp256");
        wire::write_string(
            &mut key_blob,
            verifying_key.to_encoded_point(false).as_bytes(),
        );

        let signature: p256::ecdsa::Signature = signing_key.sign(data);
        let (r, s) = {
            let bytes = signature.to_bytes();
            let bytes = bytes.as_slice();
            (bytes[..32].to_vec(), bytes[32..].to_vec())
        };
        let mut rs = BytesMut::new();
        wire::write_mpint(&mut rs, &r);
        wire::write_mpint(&mut rs, &s);
        let mut sig_blob = BytesMut::new();
        wire::write_utf8(&mut sig_blob, "ecdsa-sha2-nistp256");
        wire::write_string(&mut sig_blob, &rs);

        verify_signature(
            HostKeyAlgorithm::EcdsaSha2Nistp256,
            &key_blob,
            &sig_blob,
            data,
        )
        .unwrap();
    }

    #[test]
    fn test_ecdsa_fixed_signature_padding() {
        // r shorter than the field width must be left-padded.
        let mut rs = BytesMut::new();
        wire::write_mpint(&mut rs, &[0x01]);
        wire::write_mpint(&mut rs, &[0x02, 0x03]);
        let fixed = ecdsa_fixed_signature(&rs, 32).unwrap();
        assert_eq!(fixed.len(), 64);
        assert_eq!(fixed[31], 0x01);
        assert_eq!(&fixed[62..], &[0x02, 0x03]);
    }
}
