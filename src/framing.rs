//! Length-driven packet framing.
//!
//! Accumulates socket reads in a buffer and yields whole packets according
//! to the catalog's length rules. Compression and encryption are not
//! handled; the proxy expects a plaintext stream.

use bytes::{Bytes, BytesMut};
use tokio::io::AsyncReadExt;

use crate::proto::catalog::{packet_length, PacketLength, MAX_PACKET_LENGTH};
use crate::proto::ProtocolVersion;

const READ_CHUNK: usize = 16384;

#[derive(Debug)]
pub struct PacketFramer {
    buf: BytesMut,
    protocol: ProtocolVersion,
}

impl PacketFramer {
    pub fn new(protocol: ProtocolVersion) -> Self {
        Self {
            buf: BytesMut::with_capacity(READ_CHUNK),
            protocol,
        }
    }

    /// Switch the length table, e.g. once the peer has announced its
    /// revision. Only safe on a packet boundary.
    pub fn set_protocol(&mut self, protocol: ProtocolVersion) {
        self.protocol = protocol;
    }

    pub fn protocol(&self) -> ProtocolVersion {
        self.protocol
    }

    /// Append raw bytes received from the peer.
    pub fn feed(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Extract the next whole packet from the buffer, if one is complete.
    /// A malformed stream is unrecoverable: there is no way to find the
    /// next packet boundary past a corrupt length.
    pub fn next_packet(&mut self) -> std::io::Result<Option<Bytes>> {
        match packet_length(self.protocol, &self.buf) {
            PacketLength::Complete(len) => Ok(Some(self.buf.split_to(len).freeze())),
            PacketLength::Partial => Ok(None),
            PacketLength::Malformed => Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!(
                    "malformed packet stream at opcode 0x{:02x}",
                    self.buf.first().copied().unwrap_or(0)
                ),
            )),
        }
    }

    /// Read whole packets from `stream`, returning the next one. EOF
    /// before a packet boundary is a connection error.
    pub async fn read_packet<R: AsyncReadExt + Unpin>(
        &mut self,
        stream: &mut R,
    ) -> std::io::Result<Bytes> {
        loop {
            if let Some(packet) = self.next_packet()? {
                return Ok(packet);
            }
            if self.buf.len() > MAX_PACKET_LENGTH {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    "peer exceeded maximum packet size",
                ));
            }
            let read = stream.read_buf(&mut self.buf).await?;
            if read == 0 {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::ConnectionAborted,
                    "EOF while reading packet",
                ));
            }
        }
    }

    /// Bytes received but not yet consumed as a packet.
    pub fn unparsed_data(&self) -> &[u8] {
        &self.buf
    }
}
