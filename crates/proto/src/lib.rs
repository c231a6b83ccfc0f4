//! Server-side SSH protocol engine.
//!
//! This crate turns a listening endpoint into authenticated SSH sessions and
//! dispatches the messages of each session to registered handlers:
//!
//! - **Listener** - bind configuration, host keys, accepting connections
//! - **Session** - per-connection state machine (key exchange, authentication,
//!   message pump)
//! - **Dispatcher** - applies handler dispositions and default replies
//! - **Callbacks** - typed per-listener and per-session handler registration
//!
//! Wire decoding and cryptography are collaborators plugged in through the
//! [`ssh::WireDecoder`] and [`ssh::KeyExchanger`] traits.
//!
//! # Features
//!
//! - `ssh` (default) - the SSH server engine
//!
//! # Example
//!
//! ```rust
//! use sshbind_proto::ssh::{BindOption, ListenerConfig};
//!
//! let mut config = ListenerConfig::default();
//! config.apply(BindOption::BindPort, 2222).unwrap();
//! config.apply(BindOption::RsaKey, "/etc/ssh/ssh_host_rsa_key").unwrap();
//! assert_eq!(config.bind_port, 2222);
//!
//! // Port given as text where an integer is expected
//! assert!(config.apply(BindOption::BindPort, "2222").is_err());
//! ```
//!
//! # References
//!
//! - [RFC 4252](https://datatracker.ietf.org/doc/html/rfc4252) - SSH Authentication Protocol
//! - [RFC 4253](https://datatracker.ietf.org/doc/html/rfc4253) - SSH Transport Layer Protocol
//! - [RFC 4254](https://datatracker.ietf.org/doc/html/rfc4254) - SSH Connection Protocol

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![forbid(unsafe_code)]

#[cfg(feature = "ssh")]
pub mod ssh;
