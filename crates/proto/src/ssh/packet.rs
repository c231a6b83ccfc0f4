//! SSH binary packet protocol (RFC 4253 Section 6).
//!
//! # Packet Format
//!
//! ```text
//! uint32    packet_length
//! byte      padding_length
//! byte[n1]  payload (n1 = packet_length - padding_length - 1)
//! byte[n2]  random padding (n2 = padding_length)
//! ```
//!
//! # Constraints
//!
//! - `packet_length`: Does NOT include the `packet_length` field itself
//! - `padding_length`: Length of padding (minimum 4, maximum 255 bytes)
//! - Total `packet_length` + 4 (for length field) MUST be multiple of 8
//! - Maximum packet size: 35000 bytes (RFC 4253 Section 6.1)
//!
//! Packet protection (cipher and MAC) is supplied by the key-exchange
//! provider as a [`PacketProtection`] per direction. The codec applies it to
//! every packet once installed and pads to its cipher block size.
//!
//! # Example
//!
//! ```rust
//! use sshbind_proto::ssh::packet::Packet;
//!
//! let payload = b"SSH_MSG_SERVICE_REQUEST payload";
//! let packet = Packet::new(payload.to_vec()).unwrap();
//!
//! let bytes = packet.to_bytes();
//! let parsed = Packet::from_bytes(&bytes).unwrap();
//! assert_eq!(parsed.payload(), payload);
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};
use rand::RngCore;
use sshbind_platform::{SshError, SshResult};
use std::fmt;
use std::io;
use tokio_util::codec::{Decoder, Encoder};

/// Maximum packet size in bytes (RFC 4253 Section 6.1).
pub const MAX_PACKET_SIZE: usize = 35000;

/// Minimum padding length in bytes (RFC 4253 Section 6).
pub const MIN_PADDING_LEN: u8 = 4;

/// Maximum padding length in bytes (fits in u8).
pub const MAX_PADDING_LEN: u8 = 255;

const BLOCK_SIZE: usize = 8;

/// SSH binary packet.
///
/// # Invariants
///
/// - Padding length is between 4 and 255 bytes
/// - Total packet size ≤ 35000 bytes
/// - Packet is aligned to 8 bytes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    payload: Vec<u8>,
    padding: Vec<u8>,
}

impl Packet {
    /// Creates a new SSH packet with the given payload.
    ///
    /// The packet is padded with random bytes to at least 4 bytes and to a
    /// multiple of 8 bytes in total.
    ///
    /// # Errors
    ///
    /// Returns [`SshError::Dispatch`] if the padded packet would exceed
    /// [`MAX_PACKET_SIZE`].
    pub fn new(payload: Vec<u8>) -> SshResult<Self> {
        Self::with_block_size(payload, BLOCK_SIZE)
    }

    /// Creates a packet padded to a multiple of `block_size` (never less than 8).
    ///
    /// # Errors
    ///
    /// Same as [`Packet::new`].
    pub fn with_block_size(payload: Vec<u8>, block_size: usize) -> SshResult<Self> {
        let block_size = block_size.max(BLOCK_SIZE);
        // 4 bytes packet_length + 1 byte padding_length
        let unpadded_len = 5 + payload.len();

        let mut padding_len = MIN_PADDING_LEN as usize;
        while (unpadded_len + padding_len) % block_size != 0 {
            padding_len += 1;
        }

        let total_size = unpadded_len + padding_len;
        if total_size > MAX_PACKET_SIZE {
            return Err(SshError::Dispatch(format!(
                "Packet size {} exceeds maximum {}",
                total_size, MAX_PACKET_SIZE
            )));
        }

        let mut padding = vec![0u8; padding_len];
        rand::thread_rng().fill_bytes(&mut padding);

        Ok(Self { payload, padding })
    }

    /// Returns the payload of this packet.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Returns the padding of this packet.
    pub fn padding(&self) -> &[u8] {
        &self.padding
    }

    /// Consumes the packet, returning its payload.
    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }

    /// Serializes this packet to wire format.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(self.wire_len());
        self.write_to(&mut buf);
        buf.to_vec()
    }

    fn wire_len(&self) -> usize {
        5 + self.payload.len() + self.padding.len()
    }

    fn write_to(&self, buf: &mut BytesMut) {
        let packet_length = 1 + self.payload.len() + self.padding.len();

        buf.put_u32(packet_length as u32);
        buf.put_u8(self.padding.len() as u8);
        buf.put_slice(&self.payload);
        buf.put_slice(&self.padding);
    }

    /// Parses one complete packet from wire format.
    ///
    /// # Errors
    ///
    /// Returns [`SshError::Dispatch`] if:
    /// - Data is too short (< 5 bytes for header)
    /// - Packet size exceeds maximum (35000 bytes)
    /// - Padding length is invalid (< 4)
    /// - Data length doesn't match declared packet_length
    pub fn from_bytes(data: &[u8]) -> SshResult<Self> {
        if data.len() < 5 {
            return Err(SshError::Dispatch(format!(
                "Packet too short: {} bytes (minimum 5)",
                data.len()
            )));
        }

        let mut buf = data;
        let packet_length = buf.get_u32() as usize;

        if packet_length > MAX_PACKET_SIZE {
            return Err(SshError::Dispatch(format!(
                "Packet too large: {} bytes (maximum {})",
                packet_length, MAX_PACKET_SIZE
            )));
        }

        if buf.len() != packet_length {
            return Err(SshError::Dispatch(format!(
                "Incomplete packet: expected {} bytes, got {} bytes",
                packet_length,
                buf.len()
            )));
        }

        let padding_length = buf.get_u8() as usize;

        if padding_length < MIN_PADDING_LEN as usize {
            return Err(SshError::Dispatch(format!(
                "Padding too short: {} bytes (minimum {})",
                padding_length, MIN_PADDING_LEN
            )));
        }

        if packet_length < 1 + padding_length {
            return Err(SshError::Dispatch(format!(
                "Invalid packet: packet_length ({}) too small for padding ({})",
                packet_length, padding_length
            )));
        }

        let payload_length = packet_length - 1 - padding_length;
        let payload = buf[..payload_length].to_vec();
        buf.advance(payload_length);
        let padding = buf[..padding_length].to_vec();

        Ok(Self { payload, padding })
    }
}

/// Cipher and MAC state of one transport direction.
///
/// Installed on a [`Transport`](crate::ssh::transport::Transport) by the
/// key-exchange provider once new keys take effect. The codec hands over the
/// whole wire packet, `packet_length` field included, together with the
/// sequence number of that packet.
pub trait PacketProtection: Send {
    /// Cipher block size; outgoing packets are padded to a multiple of it.
    fn block_size(&self) -> usize {
        BLOCK_SIZE
    }

    /// Length of the MAC or AEAD tag that trails every packet.
    fn tag_len(&self) -> usize;

    /// Recovers the plaintext `packet_length` field from the first four
    /// received bytes. Called once per packet.
    fn decrypt_length(&mut self, sequence: u32, encrypted: [u8; 4]) -> [u8; 4];

    /// Encrypts `packet` in place and writes its tag.
    fn seal(&mut self, sequence: u32, packet: &mut [u8], tag: &mut [u8]);

    /// Verifies `tag` and decrypts `packet` in place.
    ///
    /// # Errors
    ///
    /// Returns an error when the tag does not authenticate the packet.
    fn open(&mut self, sequence: u32, packet: &mut [u8], tag: &[u8]) -> SshResult<()>;
}

/// Frames SSH packets over an async byte stream.
///
/// Decoding yields payloads, encoding takes payloads. Both directions keep
/// the RFC 4253 sequence numbers, which wrap at 2^32, and apply their
/// [`PacketProtection`] once one is installed.
#[derive(Default)]
pub struct PacketCodec {
    next_incoming: u32,
    last_incoming: Option<u32>,
    next_outgoing: u32,
    // packet_length of a partially received packet, already decrypted
    pending_length: Option<usize>,
    inbound: Option<Box<dyn PacketProtection>>,
    outbound: Option<Box<dyn PacketProtection>>,
}

impl fmt::Debug for PacketCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PacketCodec")
            .field("next_incoming", &self.next_incoming)
            .field("next_outgoing", &self.next_outgoing)
            .field("inbound_protected", &self.inbound.is_some())
            .field("outbound_protected", &self.outbound.is_some())
            .finish()
    }
}

impl PacketCodec {
    /// Creates a codec with both sequence numbers at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sequence number of the last decoded packet.
    pub fn last_incoming_sequence(&self) -> Option<u32> {
        self.last_incoming
    }

    /// Sequence number the next encoded packet will carry.
    pub fn outgoing_sequence(&self) -> u32 {
        self.next_outgoing
    }

    /// Protects every packet decoded from now on.
    pub fn set_inbound_protection(&mut self, protection: Box<dyn PacketProtection>) {
        self.inbound = Some(protection);
    }

    /// Protects every packet encoded from now on.
    pub fn set_outbound_protection(&mut self, protection: Box<dyn PacketProtection>) {
        self.outbound = Some(protection);
    }
}

fn invalid_data(err: SshError) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, err.message().to_string())
}

impl Decoder for PacketCodec {
    type Item = Bytes;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let packet_length = match self.pending_length {
            Some(length) => length,
            None => {
                if src.len() < 4 {
                    return Ok(None);
                }

                let mut field = [src[0], src[1], src[2], src[3]];
                if let Some(protection) = self.inbound.as_mut() {
                    field = protection.decrypt_length(self.next_incoming, field);
                }
                let length = u32::from_be_bytes(field) as usize;
                if length > MAX_PACKET_SIZE {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("packet length {} exceeds maximum {}", length, MAX_PACKET_SIZE),
                    ));
                }
                self.pending_length = Some(length);
                length
            }
        };

        let tag_len = self.inbound.as_ref().map_or(0, |protection| protection.tag_len());
        let total_len = 4 + packet_length + tag_len;
        if src.len() < total_len {
            src.reserve(total_len - src.len());
            return Ok(None);
        }
        self.pending_length = None;

        let mut frame = src.split_to(total_len);
        if let Some(protection) = self.inbound.as_mut() {
            let tag = frame.split_off(4 + packet_length);
            protection
                .open(self.next_incoming, &mut frame, &tag)
                .map_err(invalid_data)?;
        }
        let packet = Packet::from_bytes(&frame).map_err(invalid_data)?;

        self.last_incoming = Some(self.next_incoming);
        self.next_incoming = self.next_incoming.wrapping_add(1);

        Ok(Some(Bytes::from(packet.into_payload())))
    }
}

impl Encoder<Bytes> for PacketCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let block_size = self
            .outbound
            .as_ref()
            .map_or(BLOCK_SIZE, |protection| protection.block_size());
        let packet = Packet::with_block_size(item.to_vec(), block_size).map_err(|err| {
            io::Error::new(io::ErrorKind::InvalidInput, err.message().to_string())
        })?;

        match self.outbound.as_mut() {
            None => {
                dst.reserve(packet.wire_len());
                packet.write_to(dst);
            }
            Some(protection) => {
                let mut wire = BytesMut::with_capacity(packet.wire_len());
                packet.write_to(&mut wire);
                let mut tag = vec![0u8; protection.tag_len()];
                protection.seal(self.next_outgoing, &mut wire, &mut tag);

                dst.reserve(wire.len() + tag.len());
                dst.extend_from_slice(&wire);
                dst.extend_from_slice(&tag);
            }
        }
        self.next_outgoing = self.next_outgoing.wrapping_add(1);

        Ok(())
    }
}
