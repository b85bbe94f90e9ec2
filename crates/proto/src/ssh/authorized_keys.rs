//! OpenSSH authorized_keys text format.
//!
//! Each entry is one line:
//!
//! ```text
//! [options] <algorithm> <base64-blob> [comment]
//! ```
//!
//! [`parse_authorized_key`] decodes the first entry of its input and hands
//! back whatever follows, so a whole file can be consumed by calling it in
//! a loop. [`marshal_authorized_key`] produces the canonical line with a
//! trailing newline; for any parsed entry without options or comment the
//! two functions round-trip byte for byte.

use crate::ssh::pubkey::PublicKey;
use base64::Engine;
use tether_platform::{TetherError, TetherResult};

/// One parsed authorized_keys entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizedKey {
    /// The public key (possibly a certificate).
    pub key: PublicKey,
    /// Trailing comment, empty if absent.
    pub comment: String,
    /// Leading option tokens, empty if absent.
    pub options: Vec<String>,
}

/// Parses the first authorized-keys entry in `input`.
///
/// Returns the entry plus the unconsumed remainder (starting after the
/// entry's line terminator). Blank lines and `#` comments before the entry
/// are skipped.
///
/// # Errors
///
/// Returns [`TetherError::Format`] if no entry parses: bad base64, an
/// unknown algorithm, or an algorithm/blob mismatch.
///
/// # Example
///
/// ```rust
/// use tether_proto::ssh::authorized_keys::parse_authorized_key;
/// use tether_proto::ssh::pubkey::{Ed25519Keypair, Signer};
/// use tether_proto::ssh::authorized_keys::marshal_authorized_key;
///
/// let line = marshal_authorized_key(&Ed25519Keypair::generate().public_key());
/// let (entry, rest) = parse_authorized_key(&line).unwrap();
/// assert_eq!(entry.key.algorithm(), "ssh-ed25519");
/// assert!(rest.is_empty());
/// ```
pub fn parse_authorized_key(input: &[u8]) -> TetherResult<(AuthorizedKey, Vec<u8>)> {
    let mut rest = input;

    loop {
        let (line, remainder) = match rest.iter().position(|&b| b == b'\n') {
            Some(pos) => (&rest[..pos], &rest[pos + 1..]),
            None => (rest, &rest[rest.len()..]),
        };

        if line.is_empty() && remainder.is_empty() && rest.is_empty() {
            return Err(TetherError::Format(
                "No authorized key found in input".to_string(),
            ));
        }

        let text = std::str::from_utf8(line)
            .map_err(|_| TetherError::Format("Authorized key line is not UTF-8".to_string()))?
            .trim();

        if text.is_empty() || text.starts_with('#') {
            if remainder.is_empty() {
                return Err(TetherError::Format(
                    "No authorized key found in input".to_string(),
                ));
            }
            rest = remainder;
            continue;
        }

        let entry = parse_entry_line(text)?;
        return Ok((entry, remainder.to_vec()));
    }
}

fn parse_entry_line(line: &str) -> TetherResult<AuthorizedKey> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() < 2 {
        return Err(TetherError::Format(
            "Authorized key line has too few fields".to_string(),
        ));
    }

    // The algorithm token is the first field whose successor decodes as a
    // key blob of that algorithm; anything before it is an option.
    let mut options = Vec::new();
    for (idx, field) in fields.iter().enumerate() {
        if idx + 1 < fields.len() {
            if let Ok(key) = try_decode(field, fields[idx + 1]) {
                let comment = fields[idx + 2..].join(" ");
                return Ok(AuthorizedKey {
                    key,
                    comment,
                    options,
                });
            }
        }
        options.push(field.to_string());
    }

    Err(TetherError::Format(format!(
        "No parseable key in authorized_keys line starting \"{}\"",
        fields[0]
    )))
}

fn try_decode(algorithm: &str, blob_b64: &str) -> TetherResult<PublicKey> {
    let blob = base64::engine::general_purpose::STANDARD
        .decode(blob_b64)
        .map_err(|e| TetherError::Format(format!("Invalid base64 key data: {}", e)))?;

    let key = PublicKey::parse(&blob)?;
    if key.algorithm() != algorithm {
        return Err(TetherError::Format(format!(
            "Key algorithm \"{}\" does not match declared \"{}\"",
            key.algorithm(),
            algorithm
        )));
    }
    Ok(key)
}

/// Marshals a public key to its authorized_keys line, with trailing
/// newline.
///
/// For any blob `B` that parses to a key `K`, `marshal_authorized_key(K)`
/// trimmed of its newline equals the original line.
pub fn marshal_authorized_key(key: &PublicKey) -> Vec<u8> {
    let blob = key.marshal();
    let mut line = Vec::new();
    line.extend_from_slice(key.algorithm().as_bytes());
    line.push(b' ');
    line.extend_from_slice(
        base64::engine::general_purpose::STANDARD
            .encode(&blob)
            .as_bytes(),
    );
    line.push(b'\n');
    line
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::pubkey::{Ed25519Keypair, Signer};

    fn sample_line(comment: &str) -> Vec<u8> {
        let key = Ed25519Keypair::generate().public_key();
        let mut line = marshal_authorized_key(&key);
        if !comment.is_empty() {
            line.pop();
            line.push(b' ');
            line.extend_from_slice(comment.as_bytes());
            line.push(b'\n');
        }
        line
    }

    #[test]
    fn test_parse_simple_key() {
        let line = sample_line("user@host");
        let (entry, rest) = parse_authorized_key(&line).unwrap();

        assert_eq!(entry.key.algorithm(), "ssh-ed25519");
        assert_eq!(entry.comment, "user@host");
        assert!(entry.options.is_empty());
        assert!(rest.is_empty());
    }

    #[test]
    fn test_parse_key_without_comment() {
        let line = sample_line("");
        let (entry, _) = parse_authorized_key(&line).unwrap();
        assert_eq!(entry.comment, "");
    }

    #[test]
    fn test_parse_key_with_options() {
        let key = Ed25519Keypair::generate().public_key();
        let inner = marshal_authorized_key(&key);
        let mut line = b"no-port-forwarding,command=\"/usr/bin/ls\" ".to_vec();
        line.extend_from_slice(&inner);

        let (entry, _) = parse_authorized_key(&line).unwrap();
        assert_eq!(entry.key, key);
        assert_eq!(
            entry.options,
            vec!["no-port-forwarding,command=\"/usr/bin/ls\"".to_string()]
        );
    }

    #[test]
    fn test_parse_skips_comments_and_blanks() {
        let mut input = b"# trusted keys\n\n".to_vec();
        input.extend_from_slice(&sample_line("alice@laptop"));
        input.extend_from_slice(b"extra line\n");

        let (entry, rest) = parse_authorized_key(&input).unwrap();
        assert_eq!(entry.comment, "alice@laptop");
        assert_eq!(rest, b"extra line\n");
    }

    #[test]
    fn test_parse_empty_input_fails() {
        assert!(parse_authorized_key(b"").is_err());
        assert!(parse_authorized_key(b"# only comments\n").is_err());
    }

    #[test]
    fn test_parse_garbage_fails() {
        assert!(parse_authorized_key(b"ssh-ed25519 not-base64!!!\n").is_err());
    }

    #[test]
    fn test_marshal_round_trip() {
        let key = Ed25519Keypair::generate().public_key();
        let line = marshal_authorized_key(&key);

        let (entry, _) = parse_authorized_key(&line).unwrap();
        assert_eq!(entry.key, key);

        let again = marshal_authorized_key(&entry.key);
        assert_eq!(again, line);
    }
}
