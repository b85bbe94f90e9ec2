//! Protocol implementation for the tether stack.
//!
//! This crate provides an SSH (Secure Shell, protocol version 2)
//! client/server library with an auto-reconnecting multiplexed-channel
//! layer on top:
//!
//! - **Transport** - binary packet framing, key exchange, encryption and
//!   integrity (RFC 4253)
//! - **Authentication** - publickey with raw keys or OpenSSH
//!   certificates, and keyboard-interactive (RFC 4252, RFC 4256)
//! - **Certificates** - parse, marshal, sign and validate OpenSSH-format
//!   certificates with principals, validity windows, critical options and
//!   extensions
//! - **Channels** - multiplexed logical streams with per-channel
//!   flow-control windows, inbound buffers and idle timers (RFC 4254)
//! - **Supervision** - a single-owner state machine that keeps one client
//!   connection alive, reconnecting on loss and serializing all access
//!   through message passing
//!
//! # Example
//!
//! ```rust
//! use tether_proto::ssh::Packet;
//!
//! // Frame and unframe an SSH packet
//! let packet = Packet::new(b"SSH message payload".to_vec()).unwrap();
//! let wire_format = packet.to_bytes();
//!
//! let parsed = Packet::from_bytes(&wire_format).unwrap();
//! assert_eq!(parsed.payload(), b"SSH message payload");
//! ```
//!
//! # Security
//!
//! - All cryptographic operations use vetted libraries (`ring`, `dalek`,
//!   RustCrypto)
//! - Constant-time comparisons on authentication paths
//! - Secrets are wiped with `zeroize`
//!
//! # References
//!
//! - [RFC 4251](https://datatracker.ietf.org/doc/html/rfc4251) - SSH Protocol Architecture
//! - [RFC 4252](https://datatracker.ietf.org/doc/html/rfc4252) - SSH Authentication Protocol
//! - [RFC 4253](https://datatracker.ietf.org/doc/html/rfc4253) - SSH Transport Layer Protocol
//! - [RFC 4254](https://datatracker.ietf.org/doc/html/rfc4254) - SSH Connection Protocol
//! - OpenSSH `PROTOCOL.certkeys` - certificate format

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod ssh;
