//! SSH server engine.
//!
//! # Architecture
//!
//! The engine is layered:
//!
//! 1. **Packet Layer** ([`packet`], [`transport`]) - Binary packet framing (RFC 4253 Section 6)
//! 2. **Handshake** ([`version`], [`kex`]) - Identification exchange and the
//!    key exchange collaborator (RFC 4253)
//! 3. **Messages** ([`message`], [`decoder`], [`auth`]) - Typed messages and
//!    replies (RFC 4252, RFC 4254)
//! 4. **Orchestration** ([`listener`], [`session`], [`dispatcher`],
//!    [`callbacks`]) - Accepting connections, the session state machine and
//!    handler dispatch
//!
//! Cryptography is not implemented here. A [`KeyExchanger`] performs the
//! key exchange, reports success or failure and installs a
//! [`PacketProtection`] per direction; the engine only orchestrates.
//!
//! # Example
//!
//! ```rust,no_run
//! use sshbind_proto::ssh::{
//!     handler_fn, AuthMethods, BindOption, Disposition, KeyExchanger, Listener, ListenerConfig,
//!     Message,
//! };
//! use std::sync::Arc;
//!
//! # async fn example(exchanger: Arc<dyn KeyExchanger>) -> sshbind_platform::SshResult<()> {
//! let mut listener = Listener::new(ListenerConfig::default(), exchanger)?;
//! listener.set_option(BindOption::BindPort, 2222)?;
//! listener.set_option(BindOption::RsaKey, "/tmp/test_rsa")?;
//! listener.listen().await?;
//!
//! let mut session = listener.accept(None).await?;
//! session.set_message_handler(handler_fn(|_info, message| match message {
//!     Message::Auth(request) if request.user_name() == "admin" => Ok(Disposition::Handled),
//!     _ => Ok(Disposition::Default),
//! }))?;
//! session.handle_key_exchange().await?;
//! session.set_auth_methods(AuthMethods::PASSWORD)?;
//! session.execute_message_callbacks(None).await?;
//! # Ok(())
//! # }
//! ```

pub mod auth;
pub mod callbacks;
pub mod decoder;
pub mod dispatcher;
pub mod kex;
pub mod listener;
pub mod message;
pub mod options;
pub mod packet;
pub mod session;
pub mod transport;
pub mod version;
pub mod wire;

pub use auth::{AuthMethod, AuthMethods, AuthRequest};
pub use callbacks::{
    handler_fn, Disposition, IncomingConnectionHandler, ListenerCallbacks, MessageHandler,
    SessionCallbacks,
};
pub use decoder::{StandardDecoder, WireDecoder};
pub use dispatcher::MessageDispatcher;
pub use kex::{exchange_kexinit, KexContext, KexInit, KexOutcome, KeyExchanger};
pub use listener::{Listener, ListenerShutdown};
pub use message::{ChannelOpen, ChannelRequest, Message, MessageType, Reply};
pub use options::{
    BindOption, HostKeyKind, HostKeySet, ListenerConfig, LogVerbosity, OptionValue,
    SessionConfig,
};
pub use packet::{Packet, PacketCodec, PacketProtection};
pub use session::{Session, SessionCloser, SessionInfo, SessionState};
pub use transport::{AsyncStream, Transport};
pub use version::Version;
