//! SSH protocol version exchange (RFC 4253 Section 4.2).
//!
//! The connection opens with both peers sending an identification string:
//!
//! ```text
//! SSH-protoversion-softwareversion SP comments CR LF
//! ```
//!
//! Example: `SSH-2.0-Tether_0.2.0`
//!
//! The identification strings of both sides are also inputs to the exchange
//! hash, so they are retained verbatim (without CR LF) after the exchange.

use tether_platform::{TetherError, TetherResult};

/// Maximum length of the SSH identification line (RFC 4253 Section 4.2).
pub const MAX_VERSION_LENGTH: usize = 255;

/// SSH identification string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Version {
    /// Protocol version (always "2.0" for anything we produce)
    proto_version: String,
    /// Software name and version (e.g. "Tether_0.2.0")
    software_version: String,
    /// Optional comments
    comments: Option<String>,
}

impl Version {
    /// Creates a new identification string with protocol version "2.0".
    ///
    /// # Example
    ///
    /// ```rust
    /// use tether_proto::ssh::version::Version;
    ///
    /// let version = Version::new("Tether_0.2.0", None);
    /// assert_eq!(version.to_string(), "SSH-2.0-Tether_0.2.0");
    /// ```
    pub fn new(software: &str, comments: Option<&str>) -> Self {
        Self {
            proto_version: "2.0".to_string(),
            software_version: software.to_string(),
            comments: comments.map(String::from),
        }
    }

    /// Returns this library's default identification string.
    pub fn default_tether() -> Self {
        Self::new(&format!("Tether_{}", env!("CARGO_PKG_VERSION")), None)
    }

    /// Parses an identification line (with or without trailing CR LF).
    ///
    /// # Errors
    ///
    /// Returns [`TetherError::Protocol`] if the line exceeds 255 bytes,
    /// contains a NUL byte, does not start with `SSH-`, or names a protocol
    /// version other than "2.0"/"1.99".
    pub fn parse(line: &str) -> TetherResult<Self> {
        let line = line.trim_end_matches("\r\n").trim_end_matches('\n');

        if line.len() > MAX_VERSION_LENGTH {
            return Err(TetherError::Protocol(format!(
                "Version string too long: {} bytes (max {})",
                line.len(),
                MAX_VERSION_LENGTH
            )));
        }

        if line.contains('\0') {
            return Err(TetherError::Protocol(
                "Version string contains null byte".to_string(),
            ));
        }

        if !line.starts_with("SSH-") {
            return Err(TetherError::Protocol(format!(
                "Invalid version string: must start with 'SSH-', got '{}'",
                line
            )));
        }

        let parts: Vec<&str> = line.splitn(3, '-').collect();
        if parts.len() < 3 {
            return Err(TetherError::Protocol(format!(
                "Invalid version string format: '{}'",
                line
            )));
        }

        let proto_version = parts[1];
        let rest = parts[2];

        if proto_version != "2.0" && proto_version != "1.99" {
            return Err(TetherError::Protocol(format!(
                "Unsupported protocol version: '{}' (expected '2.0' or '1.99')",
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

    /// Returns the software version (e.g. "Tether_0.2.0").
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_new() {
        let version = Version::new("Tether_0.2.0", None);
        assert_eq!(version.proto_version(), "2.0");
        assert_eq!(version.software(), "Tether_0.2.0");
        assert_eq!(version.comments(), None);
    }

    #[test]
    fn test_version_display() {
        let version = Version::new("Tether_0.2.0", Some("testing"));
        assert_eq!(version.to_string(), "SSH-2.0-Tether_0.2.0 testing");
    }

    #[test]
    fn test_version_parse() {
        let version = Version::parse("SSH-2.0-OpenSSH_8.9").unwrap();
        assert_eq!(version.proto_version(), "2.0");
        assert_eq!(version.software(), "OpenSSH_8.9");
        assert_eq!(version.comments(), None);
    }

    #[test]
    fn test_version_parse_with_comments() {
        let version = Version::parse("SSH-2.0-OpenSSH_8.9 Ubuntu-3ubuntu0.1").unwrap();
        assert_eq!(version.software(), "OpenSSH_8.9");
        assert_eq!(version.comments(), Some("Ubuntu-3ubuntu0.1"));
    }

    #[test]
    fn test_version_parse_with_crlf() {
        let version = Version::parse("SSH-2.0-OpenSSH_8.9\r\n").unwrap();
        assert_eq!(version.software(), "OpenSSH_8.9");
    }

    #[test]
    fn test_version_parse_invalid_prefix() {
        assert!(matches!(
            Version::parse("INVALID-2.0-Test"),
            Err(TetherError::Protocol(_))
        ));
    }

    #[test]
    fn test_version_parse_unsupported_protocol() {
        match Version::parse("SSH-1.0-OldClient") {
            Err(TetherError::Protocol(msg)) => {
                assert!(msg.contains("Unsupported protocol version"));
            }
            other => panic!("Expected Protocol error, got {:?}", other),
        }
    }

    #[test]
    fn test_version_parse_too_long() {
        let long_string = format!("SSH-2.0-{}", "A".repeat(300));
        assert!(Version::parse(&long_string).is_err());
    }

    #[test]
    fn test_version_parse_null_byte() {
        assert!(Version::parse("SSH-2.0-Test\0Bad").is_err());
    }

    #[test]
    fn test_version_wire_format() {
        let version = Version::new("Tether_0.2.0", None);
        assert_eq!(version.to_wire_format(), b"SSH-2.0-Tether_0.2.0\r\n");
    }

    #[test]
    fn test_version_round_trip() {
        let original = Version::new("Tether_0.2.0", Some("test"));
        let parsed = Version::parse(&original.to_string()).unwrap();
        assert_eq!(parsed.software(), original.software());
        assert_eq!(parsed.comments(), original.comments());
    }
}
