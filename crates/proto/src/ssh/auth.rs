//! SSH authentication protocol (RFC 4252).
//!
//! - [`AuthMethods`] - the bitmask of methods a session advertises and accepts
//! - [`AuthMethod`] - the method carried by one request, with its fields
//! - [`AuthRequest`] - SSH_MSG_USERAUTH_REQUEST
//!
//! # Example
//!
//! ```rust
//! use sshbind_proto::ssh::auth::{AuthMethod, AuthMethods, AuthRequest};
//!
//! let methods = AuthMethods::PASSWORD | AuthMethods::PUBLICKEY;
//! assert_eq!(methods.names(), vec!["publickey", "password"]);
//!
//! let request = AuthRequest::new(
//!     "alice",
//!     "ssh-connection",
//!     AuthMethod::Password("secret".to_string()),
//! );
//! assert!(methods.contains(request.method().flag()));
//! ```

use crate::ssh::message::MessageType;
use crate::ssh::wire::{write_bool, write_bytes, write_string, WireReader};
use bytes::{BufMut, BytesMut};
use sshbind_platform::{SshError, SshResult};
use std::fmt;
use std::ops::{BitAnd, BitOr, BitOrAssign};
use zeroize::Zeroize;

/// Bitmask of authentication methods.
///
/// The numeric values match the usual server-library convention, so masks
/// coming from configuration files or foreign callers can be converted
/// with [`AuthMethods::from_bits`].
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct AuthMethods(u32);

impl AuthMethods {
    /// No method at all.
    pub const EMPTY: Self = Self(0);
    /// "none"
    pub const NONE: Self = Self(0x0001);
    /// "password"
    pub const PASSWORD: Self = Self(0x0002);
    /// "publickey"
    pub const PUBLICKEY: Self = Self(0x0004);
    /// "hostbased"
    pub const HOSTBASED: Self = Self(0x0008);
    /// "keyboard-interactive"
    pub const INTERACTIVE: Self = Self(0x0010);
    /// "gssapi-with-mic"
    pub const GSSAPI_MIC: Self = Self(0x0020);
    /// Every known method.
    pub const ALL: Self = Self(0x003f);

    /// Advertisement order of the name-list sent in USERAUTH_FAILURE.
    const ADVERTISED: [(AuthMethods, &'static str); 5] = [
        (AuthMethods::GSSAPI_MIC, "gssapi-with-mic"),
        (AuthMethods::PUBLICKEY, "publickey"),
        (AuthMethods::HOSTBASED, "hostbased"),
        (AuthMethods::INTERACTIVE, "keyboard-interactive"),
        (AuthMethods::PASSWORD, "password"),
    ];

    /// Returns the raw bits.
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Converts raw bits, rejecting unknown flags.
    ///
    /// ```rust
    /// use sshbind_proto::ssh::auth::AuthMethods;
    ///
    /// assert_eq!(
    ///     AuthMethods::from_bits(0x0006),
    ///     Some(AuthMethods::PASSWORD | AuthMethods::PUBLICKEY)
    /// );
    /// assert_eq!(AuthMethods::from_bits(0x0040), None);
    /// ```
    pub const fn from_bits(bits: u32) -> Option<Self> {
        if bits & !Self::ALL.0 == 0 {
            Some(Self(bits))
        } else {
            None
        }
    }

    /// Converts raw bits, dropping unknown flags.
    pub const fn from_bits_truncate(bits: u32) -> Self {
        Self(bits & Self::ALL.0)
    }

    /// Whether every flag of `other` is set. An empty `other` is never contained.
    pub const fn contains(self, other: Self) -> bool {
        other.0 != 0 && self.0 & other.0 == other.0
    }

    /// Whether no flag is set.
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Method names to advertise, in the order clients expect.
    ///
    /// "none" is never advertised (RFC 4252 Section 5.2).
    pub fn names(self) -> Vec<&'static str> {
        Self::ADVERTISED
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect()
    }

    /// Parses a method name into its flag.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "none" => Some(Self::NONE),
            "password" => Some(Self::PASSWORD),
            "publickey" => Some(Self::PUBLICKEY),
            "hostbased" => Some(Self::HOSTBASED),
            "keyboard-interactive" => Some(Self::INTERACTIVE),
            "gssapi-with-mic" => Some(Self::GSSAPI_MIC),
            _ => None,
        }
    }
}

impl BitOr for AuthMethods {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for AuthMethods {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for AuthMethods {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self {
        Self(self.0 & rhs.0)
    }
}

impl fmt::Debug for AuthMethods {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("AuthMethods(EMPTY)");
        }
        let mut names = Vec::new();
        if self.contains(Self::NONE) {
            names.push("none");
        }
        names.extend(self.names());
        write!(f, "AuthMethods({})", names.join(" | "))
    }
}

/// SSH authentication method carried by a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthMethod {
    /// "none" - asks which methods can continue.
    None,
    /// "password"
    Password(String),
    /// "password" with the change flag set (RFC 4252 Section 8).
    PasswordChange {
        /// Current password
        old_password: String,
        /// Replacement password
        new_password: String,
    },
    /// "publickey"
    PublicKey {
        /// Algorithm name (e.g., "ssh-ed25519", "rsa-sha2-256")
        algorithm: String,
        /// Public key blob
        public_key: Vec<u8>,
        /// Signature (absent for the query phase)
        signature: Option<Vec<u8>>,
    },
    /// "hostbased"
    HostBased {
        /// Host key algorithm name
        algorithm: String,
        /// Client host key blob
        host_key: Vec<u8>,
        /// Client host name (FQDN)
        client_host: String,
        /// User name on the client host
        client_user: String,
        /// Signature
        signature: Vec<u8>,
    },
    /// "keyboard-interactive" (RFC 4256)
    KeyboardInteractive {
        /// Submethods hint
        submethods: String,
    },
    /// "gssapi-with-mic" (RFC 4462)
    GssapiWithMic {
        /// Supported mechanism OIDs, undecoded
        mechanisms: Vec<Vec<u8>>,
    },
    /// Any method name the engine does not know.
    Unknown(String),
}

impl AuthMethod {
    /// Returns the method name.
    pub fn name(&self) -> &str {
        match self {
            AuthMethod::None => "none",
            AuthMethod::Password(_) | AuthMethod::PasswordChange { .. } => "password",
            AuthMethod::PublicKey { .. } => "publickey",
            AuthMethod::HostBased { .. } => "hostbased",
            AuthMethod::KeyboardInteractive { .. } => "keyboard-interactive",
            AuthMethod::GssapiWithMic { .. } => "gssapi-with-mic",
            AuthMethod::Unknown(name) => name,
        }
    }

    /// Returns the bitmask flag for this method ([`AuthMethods::EMPTY`] for unknown ones).
    pub fn flag(&self) -> AuthMethods {
        match self {
            AuthMethod::None => AuthMethods::NONE,
            AuthMethod::Password(_) | AuthMethod::PasswordChange { .. } => AuthMethods::PASSWORD,
            AuthMethod::PublicKey { .. } => AuthMethods::PUBLICKEY,
            AuthMethod::HostBased { .. } => AuthMethods::HOSTBASED,
            AuthMethod::KeyboardInteractive { .. } => AuthMethods::INTERACTIVE,
            AuthMethod::GssapiWithMic { .. } => AuthMethods::GSSAPI_MIC,
            AuthMethod::Unknown(_) => AuthMethods::EMPTY,
        }
    }
}

impl Drop for AuthMethod {
    fn drop(&mut self) {
        match self {
            AuthMethod::Password(password) => password.zeroize(),
            AuthMethod::PasswordChange {
                old_password,
                new_password,
            } => {
                old_password.zeroize();
                new_password.zeroize();
            }
            _ => {}
        }
    }
}

/// SSH_MSG_USERAUTH_REQUEST message (RFC 4252 Section 5).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthRequest {
    user_name: String,
    service_name: String,
    method: AuthMethod,
}

impl AuthRequest {
    /// Creates a new authentication request.
    pub fn new(user_name: &str, service_name: &str, method: AuthMethod) -> Self {
        Self {
            user_name: user_name.to_string(),
            service_name: service_name.to_string(),
            method,
        }
    }

    /// Returns the user name.
    pub fn user_name(&self) -> &str {
        &self.user_name
    }

    /// Returns the service name.
    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    /// Returns the authentication method.
    pub fn method(&self) -> &AuthMethod {
        &self.method
    }

    /// Serializes the authentication request to bytes.
    ///
    /// Format (RFC 4252 Section 5):
    /// ```text
    /// byte      SSH_MSG_USERAUTH_REQUEST (50)
    /// string    user name
    /// string    service name
    /// string    method name
    /// ....      method specific fields
    /// ```
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();

        buf.put_u8(MessageType::UserauthRequest as u8);
        write_string(&mut buf, &self.user_name);
        write_string(&mut buf, &self.service_name);
        write_string(&mut buf, self.method.name());

        match &self.method {
            AuthMethod::None | AuthMethod::Unknown(_) => {}
            AuthMethod::Password(password) => {
                // not changing password
                write_bool(&mut buf, false);
                write_string(&mut buf, password);
            }
            AuthMethod::PasswordChange {
                old_password,
                new_password,
            } => {
                write_bool(&mut buf, true);
                write_string(&mut buf, old_password);
                write_string(&mut buf, new_password);
            }
            AuthMethod::PublicKey {
                algorithm,
                public_key,
                signature,
            } => {
                write_bool(&mut buf, signature.is_some());
                write_string(&mut buf, algorithm);
                write_bytes(&mut buf, public_key);
                if let Some(sig) = signature {
                    write_bytes(&mut buf, sig);
                }
            }
            AuthMethod::HostBased {
                algorithm,
                host_key,
                client_host,
                client_user,
                signature,
            } => {
                write_string(&mut buf, algorithm);
                write_bytes(&mut buf, host_key);
                write_string(&mut buf, client_host);
                write_string(&mut buf, client_user);
                write_bytes(&mut buf, signature);
            }
            AuthMethod::KeyboardInteractive { submethods } => {
                // language tag (deprecated)
                write_string(&mut buf, "");
                write_string(&mut buf, submethods);
            }
            AuthMethod::GssapiWithMic { mechanisms } => {
                buf.put_u32(mechanisms.len() as u32);
                for oid in mechanisms {
                    write_bytes(&mut buf, oid);
                }
            }
        }

        buf.to_vec()
    }

    /// Parses an authentication request from bytes.
    ///
    /// Unknown method names are kept as [`AuthMethod::Unknown`] so that the
    /// dispatcher can answer them with the advertised method list.
    ///
    /// # Errors
    ///
    /// Returns [`SshError::Dispatch`] if the data is truncated or malformed.
    pub fn from_bytes(data: &[u8]) -> SshResult<Self> {
        let mut reader = WireReader::new(data);

        let msg_type = reader.read_u8().map_err(|_| {
            SshError::Dispatch("USERAUTH_REQUEST message is empty".to_string())
        })?;
        if msg_type != MessageType::UserauthRequest as u8 {
            return Err(SshError::Dispatch(format!(
                "Invalid message type: expected 50 (SSH_MSG_USERAUTH_REQUEST), got {}",
                msg_type
            )));
        }

        let user_name = reader.read_string()?;
        let service_name = reader.read_string()?;
        let method_name = reader.read_string()?;

        let method = match method_name.as_str() {
            "none" => AuthMethod::None,
            "password" => {
                let changing = reader.read_bool()?;
                let password = reader.read_string()?;
                if changing {
                    AuthMethod::PasswordChange {
                        old_password: password,
                        new_password: reader.read_string()?,
                    }
                } else {
                    AuthMethod::Password(password)
                }
            }
            "publickey" => {
                let has_signature = reader.read_bool()?;
                let algorithm = reader.read_string()?;
                let public_key = reader.read_bytes()?;
                let signature = if has_signature {
                    Some(reader.read_bytes()?)
                } else {
                    None
                };

                AuthMethod::PublicKey {
                    algorithm,
                    public_key,
                    signature,
                }
            }
            "hostbased" => AuthMethod::HostBased {
                algorithm: reader.read_string()?,
                host_key: reader.read_bytes()?,
                client_host: reader.read_string()?,
                client_user: reader.read_string()?,
                signature: reader.read_bytes()?,
            },
            "keyboard-interactive" => {
                let _language = reader.read_string()?;
                AuthMethod::KeyboardInteractive {
                    submethods: reader.read_string()?,
                }
            }
            "gssapi-with-mic" => {
                let count = reader.read_u32()?;
                let mut mechanisms = Vec::new();
                for _ in 0..count {
                    mechanisms.push(reader.read_bytes()?);
                }
                AuthMethod::GssapiWithMic { mechanisms }
            }
            _ => AuthMethod::Unknown(method_name),
        };

        Ok(Self {
            user_name,
            service_name,
            method,
        })
    }
}
