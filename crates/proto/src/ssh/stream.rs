//! Encrypted packet I/O over a byte stream.
//!
//! [`PacketReader`] and [`PacketWriter`] own one direction of a transport
//! each. Before NEWKEYS they move cleartext frames; after key install the
//! packet body is sealed with the negotiated AEAD cipher (the length field
//! stays in the clear) and the tag rides at the end.
//!
//! The writer is driven by a single outbound task, so all writes to the
//! peer are serialized; the reader is owned by the dispatcher task.

use crate::ssh::crypto::{DecryptionKey, EncryptionKey};
use crate::ssh::packet::{Packet, MAX_PACKET_SIZE};
use tether_platform::{TetherError, TetherResult};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Outbound half: frames, seals, and writes payloads.
pub struct PacketWriter<W> {
    stream: W,
    key: Option<EncryptionKey>,
}

impl<W: AsyncWrite + Unpin> PacketWriter<W> {
    /// Creates a cleartext writer.
    pub fn new(stream: W) -> Self {
        Self { stream, key: None }
    }

    /// Installs the sealing key; subsequent packets are encrypted.
    pub fn install_key(&mut self, key: EncryptionKey) {
        self.key = Some(key);
    }

    /// Returns whether encryption is active.
    pub fn is_encrypted(&self) -> bool {
        self.key.is_some()
    }

    /// Frames `payload` and writes the whole packet. Either the full
    /// frame is handed to the stream or an error is returned.
    pub async fn write_payload(&mut self, payload: &[u8]) -> TetherResult<()> {
        let packet = Packet::new(payload.to_vec())?;
        let mut bytes = packet.to_bytes();

        if let Some(key) = &mut self.key {
            // Length field travels in the clear; the body is sealed and
            // the tag appended.
            let mut body = bytes.split_off(4);
            key.encrypt(&mut body)?;
            bytes.extend_from_slice(&body);
        }

        self.stream.write_all(&bytes).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Writes raw bytes (the identification line) without framing.
    pub async fn write_raw(&mut self, bytes: &[u8]) -> TetherResult<()> {
        self.stream.write_all(bytes).await?;
        self.stream.flush().await?;
        Ok(())
    }
}

/// Inbound half: reads, opens, and unframes packets.
pub struct PacketReader<R> {
    stream: R,
    key: Option<DecryptionKey>,
}

impl<R: AsyncRead + Unpin> PacketReader<R> {
    /// Creates a cleartext reader.
    pub fn new(stream: R) -> Self {
        Self { stream, key: None }
    }

    /// Installs the opening key; subsequent packets are decrypted.
    pub fn install_key(&mut self, key: DecryptionKey) {
        self.key = Some(key);
    }

    /// Returns whether decryption is active.
    pub fn is_encrypted(&self) -> bool {
        self.key.is_some()
    }

    /// Reads one packet and returns its payload.
    ///
    /// # Errors
    ///
    /// - [`TetherError::Eof`] on clean stream end
    /// - [`TetherError::Protocol`] on framing violations
    /// - [`TetherError::Crypto`] on tag mismatch
    pub async fn read_payload(&mut self) -> TetherResult<Vec<u8>> {
        let mut length_bytes = [0u8; 4];
        self.stream.read_exact(&mut length_bytes).await?;
        let packet_length = u32::from_be_bytes(length_bytes) as usize;

        if packet_length > MAX_PACKET_SIZE {
            return Err(TetherError::Protocol(format!(
                "Packet too large: {} bytes",
                packet_length
            )));
        }
        if packet_length < 5 {
            return Err(TetherError::Protocol(format!(
                "Packet too small: {} bytes",
                packet_length
            )));
        }

        // With AEAD active the body carries a trailing tag beyond the
        // declared packet length.
        let tag_len = self
            .key
            .as_ref()
            .map_or(0, |k| k.algorithm().tag_size());

        let mut body = vec![0u8; packet_length + tag_len];
        self.stream.read_exact(&mut body).await?;

        if let Some(key) = &mut self.key {
            key.decrypt(&mut body)?;
        }

        let mut frame = Vec::with_capacity(4 + body.len());
        frame.extend_from_slice(&length_bytes);
        frame.extend_from_slice(&body);

        let packet = Packet::from_bytes(&frame)?;
        Ok(packet.payload().to_vec())
    }

    /// Reads the peer's identification line (up to and including LF).
    pub async fn read_identification_line(&mut self) -> TetherResult<String> {
        let mut buffer = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            self.stream.read_exact(&mut byte).await?;
            buffer.push(byte[0]);
            if byte[0] == b'\n' {
                break;
            }
            if buffer.len() > 255 {
                return Err(TetherError::Protocol("Version string too long".to_string()));
            }
        }
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::crypto::CipherAlgorithm;

    #[tokio::test]
    async fn test_cleartext_round_trip() {
        let (client, server) = tokio::io::duplex(4096);
        let (server_rd, _server_wr) = tokio::io::split(server);
        let (_client_rd, client_wr) = tokio::io::split(client);

        let mut writer = PacketWriter::new(client_wr);
        let mut reader = PacketReader::new(server_rd);

        writer.write_payload(b"hello transport").await.unwrap();
        let payload = reader.read_payload().await.unwrap();
        assert_eq!(payload, b"hello transport");
    }

    #[tokio::test]
    async fn test_encrypted_round_trip() {
        let key_material = vec![0x11; 32];
        let (client, server) = tokio::io::duplex(4096);
        let (server_rd, _server_wr) = tokio::io::split(server);
        let (_client_rd, client_wr) = tokio::io::split(client);

        let mut writer = PacketWriter::new(client_wr);
        let mut reader = PacketReader::new(server_rd);

        writer.install_key(
            EncryptionKey::new(CipherAlgorithm::ChaCha20Poly1305, &key_material).unwrap(),
        );
        reader.install_key(
            DecryptionKey::new(CipherAlgorithm::ChaCha20Poly1305, &key_material).unwrap(),
        );

        writer.write_payload(b"sealed payload").await.unwrap();
        let payload = reader.read_payload().await.unwrap();
        assert_eq!(payload, b"sealed payload");
    }

    #[tokio::test]
    async fn test_key_mismatch_fails() {
        let (client, server) = tokio::io::duplex(4096);
        let (server_rd, _server_wr) = tokio::io::split(server);
        let (_client_rd, client_wr) = tokio::io::split(client);

        let mut writer = PacketWriter::new(client_wr);
        let mut reader = PacketReader::new(server_rd);

        writer.install_key(
            EncryptionKey::new(CipherAlgorithm::ChaCha20Poly1305, &[1u8; 32]).unwrap(),
        );
        reader.install_key(
            DecryptionKey::new(CipherAlgorithm::ChaCha20Poly1305, &[2u8; 32]).unwrap(),
        );

        writer.write_payload(b"sealed payload").await.unwrap();
        assert!(matches!(
            reader.read_payload().await,
            Err(TetherError::Crypto(_))
        ));
    }

    #[tokio::test]
    async fn test_identification_line() {
        let (client, server) = tokio::io::duplex(4096);
        let (server_rd, _server_wr) = tokio::io::split(server);
        let (_client_rd, client_wr) = tokio::io::split(client);

        let mut writer = PacketWriter::new(client_wr);
        let mut reader = PacketReader::new(server_rd);

        writer.write_raw(b"SSH-2.0-Tether_0.2.0\r\n").await.unwrap();
        let line = reader.read_identification_line().await.unwrap();
        assert_eq!(line, "SSH-2.0-Tether_0.2.0\r\n");
    }
}
