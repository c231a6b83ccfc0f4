//! Identification string exchange (RFC 4253 Section 4.2).
//!
//! Both sides open the connection with a single line:
//!
//! ```text
//! SSH-protoversion-softwareversion SP comments CR LF
//! ```
//!
//! The server writes its line first, then reads the client's.
//!
//! # Limits
//!
//! - Maximum line length: 255 characters
//! - Must start with "SSH-2.0-" or "SSH-1.99-"
//! - No null bytes allowed
//!
//! # Example
//!
//! ```rust
//! use sshbind_proto::ssh::version::Version;
//!
//! let version = Version::new("sshbind_0.1.0", None);
//! assert_eq!(version.to_string(), "SSH-2.0-sshbind_0.1.0");
//!
//! let parsed = Version::parse("SSH-2.0-OpenSSH_8.9").unwrap();
//! assert_eq!(parsed.software(), "OpenSSH_8.9");
//! ```

use sshbind_platform::{SshError, SshResult};
use std::fmt;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum length of an identification line, CR LF included.
pub const MAX_VERSION_LENGTH: usize = 255;

/// SSH identification string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Version {
    proto_version: String,
    software_version: String,
    comments: Option<String>,
}

impl Version {
    /// Creates an identification for protocol version "2.0".
    pub fn new(software: &str, comments: Option<&str>) -> Self {
        Self {
            proto_version: "2.0".to_string(),
            software_version: software.to_string(),
            comments: comments.map(String::from),
        }
    }

    /// Parses an identification line (with or without CR LF).
    ///
    /// # Errors
    ///
    /// Returns [`SshError::KeyExchange`] if:
    /// - Line is too long (> 255 characters)
    /// - Line doesn't start with "SSH-"
    /// - Protocol version is not "2.0" or "1.99"
    /// - Line contains null bytes
    pub fn parse(line: &str) -> SshResult<Self> {
        let line = line.trim_end_matches("\r\n").trim_end_matches('\n');

        if line.len() > MAX_VERSION_LENGTH {
            return Err(SshError::KeyExchange(format!(
                "Version string too long: {} bytes (max {})",
                line.len(),
                MAX_VERSION_LENGTH
            )));
        }

        if line.contains('\0') {
            return Err(SshError::KeyExchange(
                "Version string contains null byte".to_string(),
            ));
        }

        let rest = line.strip_prefix("SSH-").ok_or_else(|| {
            SshError::KeyExchange(format!(
                "Invalid version string: must start with 'SSH-', got '{}'",
                line
            ))
        })?;

        let (proto_version, rest) = rest.split_once('-').ok_or_else(|| {
            SshError::KeyExchange(format!("Invalid version string format: '{}'", line))
        })?;

        if proto_version != "2.0" && proto_version != "1.99" {
            return Err(SshError::KeyExchange(format!(
                "Unsupported protocol version: '{}' (expected '2.0' or '1.99')",
                proto_version
            )));
        }

        let (software_version, comments) = match rest.split_once(' ') {
            Some((software, comments)) => (software, Some(comments.trim().to_string())),
            None => (rest, None),
        };

        if software_version.is_empty() {
            return Err(SshError::KeyExchange(format!(
                "Missing software version in '{}'",
                line
            )));
        }

        Ok(Self {
            proto_version: proto_version.to_string(),
            software_version: software_version.to_string(),
            comments,
        })
    }

    /// Returns the protocol version (e.g., "2.0").
    pub fn proto_version(&self) -> &str {
        &self.proto_version
    }

    /// Returns the software version (e.g., "OpenSSH_8.9").
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

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SSH-{}-{}", self.proto_version, self.software_version)?;
        if let Some(comments) = &self.comments {
            write!(f, " {}", comments)?;
        }
        Ok(())
    }
}

/// Sends `ours` and reads the peer's identification line.
///
/// The peer line is read one byte at a time so that nothing past its LF is
/// consumed; the binary packet stream starts right after it.
///
/// # Errors
///
/// Returns [`SshError::KeyExchange`] on I/O failure, EOF, an over-long line or
/// an unparsable identification.
pub async fn exchange<S>(stream: &mut S, ours: &Version) -> SshResult<Version>
where
    S: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    stream
        .write_all(&ours.to_wire_format())
        .await
        .map_err(|e| SshError::KeyExchange(format!("Failed to send version: {}", e)))?;
    stream
        .flush()
        .await
        .map_err(|e| SshError::KeyExchange(format!("Failed to send version: {}", e)))?;

    let mut line = Vec::with_capacity(64);
    loop {
        let byte = stream
            .read_u8()
            .await
            .map_err(|e| SshError::KeyExchange(format!("Failed to read version: {}", e)))?;
        line.push(byte);

        if byte == b'\n' {
            break;
        }
        if line.len() >= MAX_VERSION_LENGTH {
            return Err(SshError::KeyExchange(format!(
                "Version line exceeds {} bytes",
                MAX_VERSION_LENGTH
            )));
        }
    }

    let text = String::from_utf8(line)
        .map_err(|_| SshError::KeyExchange("Version line is not valid UTF-8".to_string()))?;
    Version::parse(&text)
}
