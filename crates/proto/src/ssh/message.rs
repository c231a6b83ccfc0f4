//! SSH protocol messages seen by the server engine.
//!
//! - [`MessageType`] - numeric message identifiers (RFC 4250 Section 4.1)
//! - [`Message`] - a decoded inbound message handed to handlers
//! - [`Reply`] - an outbound message produced by disposition handling
//!
//! # Message Categories
//!
//! - **Transport Layer Generic** (1-19): Disconnect, ignore, debug, service request
//! - **Algorithm Negotiation** (20-29): Key exchange initialization
//! - **Key Exchange Method** (30-49): Method-specific messages
//! - **User Authentication Generic** (50-79): Authentication protocol
//! - **Connection Protocol Generic** (80-127): Global requests and channels
//!
//! # Example
//!
//! ```rust
//! use sshbind_proto::ssh::message::MessageType;
//!
//! let msg_type = MessageType::UserauthRequest;
//! assert_eq!(msg_type as u8, 50);
//! ```

use crate::ssh::auth::AuthRequest;
use std::fmt;

/// SSH message types as defined in RFC 4250 Section 4.1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    // Transport layer generic (1-19)
    /// Disconnect message - terminates the connection.
    Disconnect = 1,
    /// Ignore message - can be used for padding or keep-alive.
    Ignore = 2,
    /// Unimplemented message - response to unknown message type.
    Unimplemented = 3,
    /// Debug message - debugging information.
    Debug = 4,
    /// Service request - request a service (e.g., "ssh-userauth").
    ServiceRequest = 5,
    /// Service accept - service request accepted.
    ServiceAccept = 6,

    // Algorithm negotiation (20-29)
    /// Key exchange init - algorithm negotiation.
    KexInit = 20,
    /// New keys - signals transition to new keys.
    NewKeys = 21,

    // Key exchange method specific (30-49)
    /// Diffie-Hellman/ECDH key exchange init.
    KexdhInit = 30,
    /// Diffie-Hellman/ECDH key exchange reply.
    KexdhReply = 31,

    // User authentication generic (50-79)
    /// User authentication request.
    UserauthRequest = 50,
    /// User authentication failure.
    UserauthFailure = 51,
    /// User authentication success.
    UserauthSuccess = 52,
    /// User authentication banner.
    UserauthBanner = 53,
    /// Method specific (PK_OK, INFO_REQUEST, ...).
    UserauthMethodSpecific = 60,
    /// Keyboard-interactive info response.
    UserauthInfoResponse = 61,

    // Connection protocol generic (80-127)
    /// Global request.
    GlobalRequest = 80,
    /// Request success.
    RequestSuccess = 81,
    /// Request failure.
    RequestFailure = 82,
    /// Channel open.
    ChannelOpen = 90,
    /// Channel open confirmation.
    ChannelOpenConfirmation = 91,
    /// Channel open failure.
    ChannelOpenFailure = 92,
    /// Channel window adjust.
    ChannelWindowAdjust = 93,
    /// Channel data.
    ChannelData = 94,
    /// Channel extended data (stderr).
    ChannelExtendedData = 95,
    /// Channel EOF.
    ChannelEof = 96,
    /// Channel close.
    ChannelClose = 97,
    /// Channel request.
    ChannelRequest = 98,
    /// Channel success.
    ChannelSuccess = 99,
    /// Channel failure.
    ChannelFailure = 100,
}

impl MessageType {
    /// Converts a byte to a message type.
    ///
    /// # Example
    ///
    /// ```rust
    /// use sshbind_proto::ssh::message::MessageType;
    ///
    /// assert_eq!(MessageType::from_u8(50), Some(MessageType::UserauthRequest));
    /// assert_eq!(MessageType::from_u8(255), None);
    /// ```
    pub fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(MessageType::Disconnect),
            2 => Some(MessageType::Ignore),
            3 => Some(MessageType::Unimplemented),
            4 => Some(MessageType::Debug),
            5 => Some(MessageType::ServiceRequest),
            6 => Some(MessageType::ServiceAccept),
            20 => Some(MessageType::KexInit),
            21 => Some(MessageType::NewKeys),
            30 => Some(MessageType::KexdhInit),
            31 => Some(MessageType::KexdhReply),
            50 => Some(MessageType::UserauthRequest),
            51 => Some(MessageType::UserauthFailure),
            52 => Some(MessageType::UserauthSuccess),
            53 => Some(MessageType::UserauthBanner),
            60 => Some(MessageType::UserauthMethodSpecific),
            61 => Some(MessageType::UserauthInfoResponse),
            80 => Some(MessageType::GlobalRequest),
            81 => Some(MessageType::RequestSuccess),
            82 => Some(MessageType::RequestFailure),
            90 => Some(MessageType::ChannelOpen),
            91 => Some(MessageType::ChannelOpenConfirmation),
            92 => Some(MessageType::ChannelOpenFailure),
            93 => Some(MessageType::ChannelWindowAdjust),
            94 => Some(MessageType::ChannelData),
            95 => Some(MessageType::ChannelExtendedData),
            96 => Some(MessageType::ChannelEof),
            97 => Some(MessageType::ChannelClose),
            98 => Some(MessageType::ChannelRequest),
            99 => Some(MessageType::ChannelSuccess),
            100 => Some(MessageType::ChannelFailure),
            _ => None,
        }
    }

    /// Returns the message type name.
    ///
    /// # Example
    ///
    /// ```rust
    /// use sshbind_proto::ssh::message::MessageType;
    ///
    /// assert_eq!(MessageType::ServiceRequest.name(), "SSH_MSG_SERVICE_REQUEST");
    /// ```
    pub fn name(&self) -> &'static str {
        match self {
            MessageType::Disconnect => "SSH_MSG_DISCONNECT",
            MessageType::Ignore => "SSH_MSG_IGNORE",
            MessageType::Unimplemented => "SSH_MSG_UNIMPLEMENTED",
            MessageType::Debug => "SSH_MSG_DEBUG",
            MessageType::ServiceRequest => "SSH_MSG_SERVICE_REQUEST",
            MessageType::ServiceAccept => "SSH_MSG_SERVICE_ACCEPT",
            MessageType::KexInit => "SSH_MSG_KEXINIT",
            MessageType::NewKeys => "SSH_MSG_NEWKEYS",
            MessageType::KexdhInit => "SSH_MSG_KEXDH_INIT",
            MessageType::KexdhReply => "SSH_MSG_KEXDH_REPLY",
            MessageType::UserauthRequest => "SSH_MSG_USERAUTH_REQUEST",
            MessageType::UserauthFailure => "SSH_MSG_USERAUTH_FAILURE",
            MessageType::UserauthSuccess => "SSH_MSG_USERAUTH_SUCCESS",
            MessageType::UserauthBanner => "SSH_MSG_USERAUTH_BANNER",
            MessageType::UserauthMethodSpecific => "SSH_MSG_USERAUTH_60",
            MessageType::UserauthInfoResponse => "SSH_MSG_USERAUTH_INFO_RESPONSE",
            MessageType::GlobalRequest => "SSH_MSG_GLOBAL_REQUEST",
            MessageType::RequestSuccess => "SSH_MSG_REQUEST_SUCCESS",
            MessageType::RequestFailure => "SSH_MSG_REQUEST_FAILURE",
            MessageType::ChannelOpen => "SSH_MSG_CHANNEL_OPEN",
            MessageType::ChannelOpenConfirmation => "SSH_MSG_CHANNEL_OPEN_CONFIRMATION",
            MessageType::ChannelOpenFailure => "SSH_MSG_CHANNEL_OPEN_FAILURE",
            MessageType::ChannelWindowAdjust => "SSH_MSG_CHANNEL_WINDOW_ADJUST",
            MessageType::ChannelData => "SSH_MSG_CHANNEL_DATA",
            MessageType::ChannelExtendedData => "SSH_MSG_CHANNEL_EXTENDED_DATA",
            MessageType::ChannelEof => "SSH_MSG_CHANNEL_EOF",
            MessageType::ChannelClose => "SSH_MSG_CHANNEL_CLOSE",
            MessageType::ChannelRequest => "SSH_MSG_CHANNEL_REQUEST",
            MessageType::ChannelSuccess => "SSH_MSG_CHANNEL_SUCCESS",
            MessageType::ChannelFailure => "SSH_MSG_CHANNEL_FAILURE",
        }
    }

    /// Whether the message belongs to the connection protocol (RFC 4254),
    /// which is only valid once the client is authenticated.
    pub fn is_connection_protocol(&self) -> bool {
        (*self as u8) >= 80
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.name(), *self as u8)
    }
}

/// Disconnect reason codes (RFC 4250 Section 4.2.2) used by the engine.
pub mod disconnect_reason {
    /// SSH_DISCONNECT_PROTOCOL_ERROR
    pub const PROTOCOL_ERROR: u32 = 2;
    /// SSH_DISCONNECT_SERVICE_NOT_AVAILABLE
    pub const SERVICE_NOT_AVAILABLE: u32 = 7;
    /// SSH_DISCONNECT_BY_APPLICATION
    pub const BY_APPLICATION: u32 = 11;
    /// SSH_DISCONNECT_NO_MORE_AUTH_METHODS_AVAILABLE
    pub const NO_MORE_AUTH_METHODS_AVAILABLE: u32 = 14;
}

/// SSH_OPEN_ADMINISTRATIVELY_PROHIBITED (RFC 4254 Section 5.1).
pub const OPEN_ADMINISTRATIVELY_PROHIBITED: u32 = 1;

/// Decoded SSH_MSG_CHANNEL_OPEN.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelOpen {
    /// Channel type (e.g., "session", "direct-tcpip").
    pub channel_type: String,
    /// Client's channel number.
    pub sender_channel: u32,
    /// Initial window size.
    pub initial_window_size: u32,
    /// Maximum packet size.
    pub maximum_packet_size: u32,
    /// Channel-type specific data, undecoded.
    pub type_data: Vec<u8>,
}

/// Decoded SSH_MSG_CHANNEL_REQUEST.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelRequest {
    /// Server-side channel number the request targets.
    pub recipient_channel: u32,
    /// Request type (e.g., "exec", "pty-req").
    pub request_type: String,
    /// Whether the client expects SUCCESS/FAILURE.
    pub want_reply: bool,
    /// Request-type specific data, undecoded.
    pub type_data: Vec<u8>,
}

/// A decoded protocol message.
///
/// Messages are immutable and only borrowed by handlers for the duration of
/// one dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// SSH_MSG_DISCONNECT
    Disconnect {
        /// Reason code.
        reason: u32,
        /// Human readable description.
        description: String,
    },
    /// SSH_MSG_IGNORE
    Ignore {
        /// Arbitrary data.
        data: Vec<u8>,
    },
    /// SSH_MSG_DEBUG
    Debug {
        /// Whether the client asked for the message to be displayed.
        always_display: bool,
        /// Debug text.
        message: String,
    },
    /// SSH_MSG_SERVICE_REQUEST
    ServiceRequest {
        /// Requested service name.
        service: String,
    },
    /// SSH_MSG_USERAUTH_REQUEST
    Auth(AuthRequest),
    /// SSH_MSG_GLOBAL_REQUEST
    GlobalRequest {
        /// Request name.
        name: String,
        /// Whether the client expects a reply.
        want_reply: bool,
        /// Request specific data, undecoded.
        data: Vec<u8>,
    },
    /// SSH_MSG_CHANNEL_OPEN
    ChannelOpen(ChannelOpen),
    /// SSH_MSG_CHANNEL_REQUEST
    ChannelRequest(ChannelRequest),
    /// SSH_MSG_CHANNEL_CLOSE
    ChannelClose {
        /// Server-side channel number.
        recipient_channel: u32,
    },
    /// Any other message, kept as its raw payload.
    Other {
        /// Message number.
        msg_type: u8,
        /// Full payload including the message number.
        payload: Vec<u8>,
    },
}

impl Message {
    /// Returns the message number.
    pub fn msg_type(&self) -> u8 {
        match self {
            Message::Disconnect { .. } => MessageType::Disconnect as u8,
            Message::Ignore { .. } => MessageType::Ignore as u8,
            Message::Debug { .. } => MessageType::Debug as u8,
            Message::ServiceRequest { .. } => MessageType::ServiceRequest as u8,
            Message::Auth(_) => MessageType::UserauthRequest as u8,
            Message::GlobalRequest { .. } => MessageType::GlobalRequest as u8,
            Message::ChannelOpen(_) => MessageType::ChannelOpen as u8,
            Message::ChannelRequest(_) => MessageType::ChannelRequest as u8,
            Message::ChannelClose { .. } => MessageType::ChannelClose as u8,
            Message::Other { msg_type, .. } => *msg_type,
        }
    }

    /// Returns the message type, if the number is one the engine knows.
    pub fn message_type(&self) -> Option<MessageType> {
        MessageType::from_u8(self.msg_type())
    }
}

/// An outbound message produced while applying a disposition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// SSH_MSG_DISCONNECT
    Disconnect {
        /// Reason code.
        reason: u32,
        /// Human readable description.
        description: String,
    },
    /// SSH_MSG_UNIMPLEMENTED
    Unimplemented {
        /// Sequence number of the rejected packet.
        sequence: u32,
    },
    /// SSH_MSG_SERVICE_ACCEPT
    ServiceAccept {
        /// Accepted service name.
        service: String,
    },
    /// SSH_MSG_USERAUTH_BANNER
    AuthBanner {
        /// Banner text.
        message: String,
    },
    /// SSH_MSG_USERAUTH_FAILURE
    AuthFailure {
        /// Methods that can continue.
        methods: Vec<&'static str>,
        /// Partial success flag.
        partial_success: bool,
    },
    /// SSH_MSG_USERAUTH_SUCCESS
    AuthSuccess,
    /// SSH_MSG_REQUEST_SUCCESS
    RequestSuccess,
    /// SSH_MSG_REQUEST_FAILURE
    RequestFailure,
    /// SSH_MSG_CHANNEL_OPEN_CONFIRMATION
    ChannelOpenConfirmation {
        /// Client's channel number.
        recipient_channel: u32,
        /// Server's channel number.
        sender_channel: u32,
        /// Initial window size.
        initial_window_size: u32,
        /// Maximum packet size.
        maximum_packet_size: u32,
    },
    /// SSH_MSG_CHANNEL_OPEN_FAILURE
    ChannelOpenFailure {
        /// Client's channel number.
        recipient_channel: u32,
        /// Reason code.
        reason: u32,
        /// Human readable description.
        description: String,
    },
    /// SSH_MSG_CHANNEL_SUCCESS
    ChannelSuccess {
        /// Client's channel number.
        recipient_channel: u32,
    },
    /// SSH_MSG_CHANNEL_FAILURE
    ChannelFailure {
        /// Client's channel number.
        recipient_channel: u32,
    },
    /// SSH_MSG_CHANNEL_CLOSE
    ChannelClose {
        /// Client's channel number.
        recipient_channel: u32,
    },
}

impl Reply {
    /// Returns the message type of this reply.
    pub fn message_type(&self) -> MessageType {
        match self {
            Reply::Disconnect { .. } => MessageType::Disconnect,
            Reply::Unimplemented { .. } => MessageType::Unimplemented,
            Reply::ServiceAccept { .. } => MessageType::ServiceAccept,
            Reply::AuthBanner { .. } => MessageType::UserauthBanner,
            Reply::AuthFailure { .. } => MessageType::UserauthFailure,
            Reply::AuthSuccess => MessageType::UserauthSuccess,
            Reply::RequestSuccess => MessageType::RequestSuccess,
            Reply::RequestFailure => MessageType::RequestFailure,
            Reply::ChannelOpenConfirmation { .. } => MessageType::ChannelOpenConfirmation,
            Reply::ChannelOpenFailure { .. } => MessageType::ChannelOpenFailure,
            Reply::ChannelSuccess { .. } => MessageType::ChannelSuccess,
            Reply::ChannelFailure { .. } => MessageType::ChannelFailure,
            Reply::ChannelClose { .. } => MessageType::ChannelClose,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_type_conversion() {
        assert_eq!(MessageType::from_u8(5), Some(MessageType::ServiceRequest));
        assert_eq!(MessageType::from_u8(98), Some(MessageType::ChannelRequest));
        assert_eq!(MessageType::from_u8(255), None);
    }

    #[test]
    fn test_message_type_display() {
        assert_eq!(
            format!("{}", MessageType::UserauthRequest),
            "SSH_MSG_USERAUTH_REQUEST(50)"
        );
    }

    #[test]
    fn test_connection_protocol_range() {
        assert!(MessageType::ChannelOpen.is_connection_protocol());
        assert!(MessageType::GlobalRequest.is_connection_protocol());
        assert!(!MessageType::UserauthRequest.is_connection_protocol());
        assert!(!MessageType::ServiceRequest.is_connection_protocol());
    }

    #[test]
    fn test_message_numbers() {
        let msg = Message::ServiceRequest {
            service: "ssh-userauth".to_string(),
        };
        assert_eq!(msg.msg_type(), 5);
        assert_eq!(msg.message_type(), Some(MessageType::ServiceRequest));

        let unknown = Message::Other {
            msg_type: 200,
            payload: vec![200],
        };
        assert_eq!(unknown.message_type(), None);
    }

    #[test]
    fn test_reply_message_type() {
        assert_eq!(Reply::AuthSuccess.message_type(), MessageType::UserauthSuccess);
        assert_eq!(
            Reply::ChannelFailure { recipient_channel: 0 }.message_type(),
            MessageType::ChannelFailure
        );
    }
}
