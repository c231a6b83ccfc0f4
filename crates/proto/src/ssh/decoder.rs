//! Message decoding and reply encoding.
//!
//! Sessions never parse payloads themselves: every received payload goes
//! through a [`WireDecoder`], and every reply produced by the dispatcher is
//! serialized by the same decoder. [`StandardDecoder`] implements the RFC
//! 4250-4254 layouts of the messages the engine handles; other message
//! numbers are passed through as [`Message::Other`].
//!
//! # Example
//!
//! ```rust
//! use sshbind_proto::ssh::decoder::{StandardDecoder, WireDecoder};
//! use sshbind_proto::ssh::message::{Message, Reply};
//!
//! let decoder = StandardDecoder;
//!
//! let mut payload = vec![5, 0, 0, 0, 12];
//! payload.extend_from_slice(b"ssh-userauth");
//! let message = decoder.decode(&payload).unwrap();
//! assert_eq!(message, Message::ServiceRequest { service: "ssh-userauth".to_string() });
//!
//! let bytes = decoder.encode(&Reply::AuthSuccess).unwrap();
//! assert_eq!(bytes, vec![52]);
//! ```

use crate::ssh::auth::AuthRequest;
use crate::ssh::message::{ChannelOpen, ChannelRequest, Message, MessageType, Reply};
use crate::ssh::wire::{write_bool, write_name_list, write_string, WireReader};
use bytes::{BufMut, BytesMut};
use sshbind_platform::{SshError, SshResult};

/// Converts payloads to messages and replies to payloads.
///
/// Errors from [`WireDecoder::decode`] are fatal to the session: the
/// framing can no longer be trusted.
pub trait WireDecoder: Send + Sync {
    /// Decodes one packet payload.
    fn decode(&self, payload: &[u8]) -> SshResult<Message>;

    /// Serializes one reply into a packet payload.
    fn encode(&self, reply: &Reply) -> SshResult<Vec<u8>>;
}

/// Decoder for the standard SSH message layouts.
#[derive(Debug, Clone, Copy, Default)]
pub struct StandardDecoder;

// Language tags are optional in practice; many clients omit them.
fn skip_language_tag(reader: &mut WireReader<'_>) -> SshResult<()> {
    if reader.remaining() > 0 {
        reader.read_string()?;
    }
    Ok(())
}

impl WireDecoder for StandardDecoder {
    fn decode(&self, payload: &[u8]) -> SshResult<Message> {
        let mut reader = WireReader::new(payload);
        let msg_type = reader
            .read_u8()
            .map_err(|_| SshError::Dispatch("Empty message payload".to_string()))?;

        let message = match MessageType::from_u8(msg_type) {
            Some(MessageType::Disconnect) => {
                let reason = reader.read_u32()?;
                let description = reader.read_string()?;
                skip_language_tag(&mut reader)?;
                Message::Disconnect {
                    reason,
                    description,
                }
            }
            Some(MessageType::Ignore) => Message::Ignore {
                data: reader.read_bytes()?,
            },
            Some(MessageType::Debug) => {
                let always_display = reader.read_bool()?;
                let message = reader.read_string()?;
                skip_language_tag(&mut reader)?;
                Message::Debug {
                    always_display,
                    message,
                }
            }
            Some(MessageType::ServiceRequest) => Message::ServiceRequest {
                service: reader.read_string()?,
            },
            Some(MessageType::UserauthRequest) => {
                return AuthRequest::from_bytes(payload).map(Message::Auth);
            }
            Some(MessageType::GlobalRequest) => Message::GlobalRequest {
                name: reader.read_string()?,
                want_reply: reader.read_bool()?,
                data: reader.read_rest(),
            },
            Some(MessageType::ChannelOpen) => Message::ChannelOpen(ChannelOpen {
                channel_type: reader.read_string()?,
                sender_channel: reader.read_u32()?,
                initial_window_size: reader.read_u32()?,
                maximum_packet_size: reader.read_u32()?,
                type_data: reader.read_rest(),
            }),
            Some(MessageType::ChannelRequest) => Message::ChannelRequest(ChannelRequest {
                recipient_channel: reader.read_u32()?,
                request_type: reader.read_string()?,
                want_reply: reader.read_bool()?,
                type_data: reader.read_rest(),
            }),
            Some(MessageType::ChannelClose) => Message::ChannelClose {
                recipient_channel: reader.read_u32()?,
            },
            _ => Message::Other {
                msg_type,
                payload: payload.to_vec(),
            },
        };

        Ok(message)
    }

    fn encode(&self, reply: &Reply) -> SshResult<Vec<u8>> {
        let mut buf = BytesMut::new();
        buf.put_u8(reply.message_type() as u8);

        match reply {
            Reply::Disconnect {
                reason,
                description,
            } => {
                buf.put_u32(*reason);
                write_string(&mut buf, description);
                write_string(&mut buf, "");
            }
            Reply::Unimplemented { sequence } => buf.put_u32(*sequence),
            Reply::ServiceAccept { service } => write_string(&mut buf, service),
            Reply::AuthBanner { message } => {
                write_string(&mut buf, message);
                write_string(&mut buf, "");
            }
            Reply::AuthFailure {
                methods,
                partial_success,
            } => {
                write_name_list(&mut buf, methods);
                write_bool(&mut buf, *partial_success);
            }
            Reply::AuthSuccess | Reply::RequestSuccess | Reply::RequestFailure => {}
            Reply::ChannelOpenConfirmation {
                recipient_channel,
                sender_channel,
                initial_window_size,
                maximum_packet_size,
            } => {
                buf.put_u32(*recipient_channel);
                buf.put_u32(*sender_channel);
                buf.put_u32(*initial_window_size);
                buf.put_u32(*maximum_packet_size);
            }
            Reply::ChannelOpenFailure {
                recipient_channel,
                reason,
                description,
            } => {
                buf.put_u32(*recipient_channel);
                buf.put_u32(*reason);
                write_string(&mut buf, description);
                write_string(&mut buf, "");
            }
            Reply::ChannelSuccess { recipient_channel }
            | Reply::ChannelFailure { recipient_channel }
            | Reply::ChannelClose { recipient_channel } => buf.put_u32(*recipient_channel),
        }

        Ok(buf.to_vec())
    }
}
