//! SSH protocol version exchange (RFC 4253 Section 4.2).
//!
//! The SSH protocol begins with an identification exchange where both
//! sides send a line of the form:
//!
//! ```text
//! SSH-protoversion-softwareversion SP comments CR LF
//! ```
//!
//! A server may precede its identification with free-form banner lines;
//! the client must skip them until a line starting with `SSH-` arrives.
//!
//! # Security
//!
//! - Maximum line length: 255 bytes (DoS prevention)
//! - Protocol version must be "2.0" or "1.99"
//! - No null bytes allowed in the identification string
//! - The number of banner lines before the identification is capped

use skiff_platform::{SkiffError, SkiffResult};
use tokio::io::{AsyncRead, AsyncReadExt};

/// Maximum length of an identification or banner line, terminator included.
pub const MAX_VERSION_LENGTH: usize = 255;

/// Maximum number of banner lines tolerated before the identification.
pub const MAX_BANNER_LINES: usize = 1024;

/// SSH identification string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Version {
    /// Protocol version (e.g. "2.0")
    proto_version: String,
    /// Software version (e.g. "Skiff_0.1.0")
    software_version: String,
    /// Optional comments
    comments: Option<String>,
}

impl Version {
    /// Creates a new SSH identification with protocol version "2.0".
    pub fn new(software: &str, comments: Option<&str>) -> Self {
        Self {
            proto_version: "2.0".to_string(),
            software_version: software.to_string(),
            comments: comments.map(String::from),
        }
    }

    /// Returns the default Skiff identification.
    pub fn default_skiff() -> Self {
        Self::new(&format!("Skiff_{}", env!("CARGO_PKG_VERSION")), None)
    }

    /// Parses an SSH identification line.
    ///
    /// # Errors
    ///
    /// Returns [`SkiffError::Protocol`] if the line is too long, does not
    /// start with `SSH-`, contains a null byte, or carries a protocol
    /// version other than "2.0" or "1.99".
    pub fn parse(line: &str) -> SkiffResult<Self> {
        let line = line.trim_end_matches("\r\n").trim_end_matches('\n');

        if line.len() > MAX_VERSION_LENGTH {
            return Err(SkiffError::Protocol(format!(
                "identification too long: {} bytes (max {})",
                line.len(),
                MAX_VERSION_LENGTH
            )));
        }

        if line.contains('\0') {
            return Err(SkiffError::Protocol(
                "identification contains null byte".to_string(),
            ));
        }

        if !line.starts_with("SSH-") {
            return Err(SkiffError::Protocol(format!(
                "identification must start with 'SSH-', got '{}'",
                line
            )));
        }

        let parts: Vec<&str> = line.splitn(3, '-').collect();
        if parts.len() < 3 {
            return Err(SkiffError::Protocol(format!(
                "invalid identification format: '{}'",
                line
            )));
        }

        let proto_version = parts[1];
        let rest = parts[2];

        if proto_version != "2.0" && proto_version != "1.99" {
            return Err(SkiffError::Protocol(format!(
                "unsupported protocol version: '{}' (expected '2.0' or '1.99')",
                proto_version
            )));
        }

        let (software_version, comments) = if let Some(space_pos) = rest.find(' ') {
            let software = rest[..space_pos].to_string();
            let comments = rest[space_pos + 1..].trim().to_string();
            (software, Some(comments))
        } else {
            (rest.to_string(), None)
        };

        Ok(Self {
            proto_version: proto_version.to_string(),
            software_version,
            comments,
        })
    }

    /// Returns the protocol version (e.g. "2.0").
    pub fn proto_version(&self) -> &str {
        &self.proto_version
    }

    /// Returns the software version (e.g. "Skiff_0.1.0").
    pub fn software(&self) -> &str {
        &self.software_version
    }

    /// Returns the comments, if any.
    pub fn comments(&self) -> Option<&str> {
        self.comments.as_deref()
    }

    /// Converts to wire format (with CR LF).
    pub fn to_wire_format(&self) -> Vec<u8> {
        format!("{}\r\n", self).into_bytes()
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SSH-{}-{}", self.proto_version, self.software_version)?;
        if let Some(comments) = &self.comments {
            write!(f, " {}", comments)?;
        }
        Ok(())
    }
}

/// Reads the peer's identification, skipping banner lines.
///
/// Lines that do not begin with `SSH-` are collected and returned so the
/// caller can surface them; reading stops at the first identification
/// line. Each line is capped at [`MAX_VERSION_LENGTH`] bytes and the
/// banner is capped at [`MAX_BANNER_LINES`] lines.
pub async fn read_identification<R>(reader: &mut R) -> SkiffResult<(Version, Vec<String>)>
where
    R: AsyncRead + Unpin,
{
    let mut banners = Vec::new();

    loop {
        let line = read_line(reader).await?;
        if line.starts_with("SSH-") {
            return Ok((Version::parse(&line)?, banners));
        }
        if banners.len() >= MAX_BANNER_LINES {
            return Err(SkiffError::Protocol(
                "too many banner lines before identification".to_string(),
            ));
        }
        banners.push(line.trim_end_matches(['\r', '\n']).to_string());
    }
}

async fn read_line<R>(reader: &mut R) -> SkiffResult<String>
where
    R: AsyncRead + Unpin,
{
    let mut buffer = Vec::with_capacity(64);
    let mut byte = [0u8; 1];

    loop {
        let n = reader.read(&mut byte).await.map_err(SkiffError::Io)?;
        if n == 0 {
            return Err(SkiffError::ConnectionLost);
        }
        buffer.push(byte[0]);
        if byte[0] == b'\n' {
            break;
        }
        if buffer.len() > MAX_VERSION_LENGTH {
            return Err(SkiffError::Protocol(
                "identification line too long".to_string(),
            ));
        }
    }

    Ok(String::from_utf8_lossy(&buffer).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_new() {
        let version = Version::new("Skiff_0.1.0", None);
        assert_eq!(version.proto_version(), "2.0");
        assert_eq!(version.software(), "Skiff_0.1.0");
        assert_eq!(version.comments(), None);
    }

    #[test]
    fn test_version_display() {
        let version = Version::new("Skiff_0.1.0", None);
        assert_eq!(version.to_string(), "SSH-2.0-Skiff_0.1.0");

        let with_comments = Version::new("Skiff_0.1.0", Some("client"));
        assert_eq!(with_comments.to_string(), "SSH-2.0-Skiff_0.1.0 client");
    }

    #[test]
    fn test_version_parse() {
        let version = Version::parse("SSH-2.0-OpenSSH_9.6").unwrap();
        assert_eq!(version.proto_version(), "2.0");
        assert_eq!(version.software(), "OpenSSH_9.6");
    }

    #[test]
    fn test_version_parse_with_comments() {
        let version = Version::parse("SSH-2.0-OpenSSH_9.6 Ubuntu-3ubuntu13").unwrap();
        assert_eq!(version.software(), "OpenSSH_9.6");
        assert_eq!(version.comments(), Some("Ubuntu-3ubuntu13"));
    }

    #[test]
    fn test_version_parse_legacy_199() {
        let version = Version::parse("SSH-1.99-Old_1.0\r\n").unwrap();
        assert_eq!(version.proto_version(), "1.99");
    }

    #[test]
    fn test_version_parse_invalid_prefix() {
        assert!(Version::parse("HTTP-2.0-Nope").is_err());
    }

    #[test]
    fn test_version_parse_unsupported_protocol() {
        let result = Version::parse("SSH-1.5-Ancient");
        match result {
            Err(SkiffError::Protocol(msg)) => {
                assert!(msg.contains("unsupported protocol version"));
            }
            _ => panic!("expected Protocol error"),
        }
    }

    #[test]
    fn test_version_parse_too_long() {
        let long = format!("SSH-2.0-{}", "A".repeat(300));
        assert!(Version::parse(&long).is_err());
    }

    #[test]
    fn test_version_parse_null_byte() {
        assert!(Version::parse("SSH-2.0-Te\0st").is_err());
    }

    #[test]
    fn test_version_wire_format() {
        let version = Version::new("Skiff_0.1.0", None);
        assert_eq!(version.to_wire_format(), b"SSH-2.0-Skiff_0.1.0\r\n");
    }

    #[tokio::test]
    async fn test_read_identification_plain() {
        let mut input: &[u8] = b"SSH-2.0-OpenSSH_9.6\r\n";
        let (version, banners) = read_identification(&mut input).await.unwrap();
        assert_eq!(version.software(), "OpenSSH_9.6");
        assert!(banners.is_empty());
    }

    #[tokio::test]
    async fn test_read_identification_skips_banner() {
        let mut input: &[u8] = b"Hello\r\nWelcome to example.org\r\nSSH-2.0-Foo_1.0\r\n";
        let (version, banners) = read_identification(&mut input).await.unwrap();
        assert_eq!(version.software(), "Foo_1.0");
        assert_eq!(banners, vec!["Hello".to_string(), "Welcome to example.org".to_string()]);
    }

    #[tokio::test]
    async fn test_read_identification_eof() {
        let mut input: &[u8] = b"banner without ident\r\n";
        assert!(matches!(
            read_identification(&mut input).await,
            Err(SkiffError::ConnectionLost)
        ));
    }

    #[tokio::test]
    async fn test_read_identification_line_too_long() {
        let line = vec![b'a'; 300];
        let mut input: &[u8] = &line;
        assert!(read_identification(&mut input).await.is_err());
    }
}
