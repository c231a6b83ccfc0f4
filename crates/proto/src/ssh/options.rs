//! Listener and session configuration.
//!
//! [`ListenerConfig`] holds everything a [`Listener`](crate::ssh::listener::Listener)
//! needs before it starts listening. Options can be set field by field or
//! through [`ListenerConfig::apply`], which checks the value type of every
//! [`BindOption`].
//!
//! # Example
//!
//! ```rust
//! use sshbind_proto::ssh::options::{BindOption, ListenerConfig, LogVerbosity};
//!
//! let mut config = ListenerConfig::default();
//! config.apply(BindOption::BindPortString, "2222").unwrap();
//! config.apply(BindOption::LogVerbosityString, "protocol").unwrap();
//!
//! assert_eq!(config.bind_port, 2222);
//! assert_eq!(config.log_verbosity, LogVerbosity::Protocol);
//! ```

use crate::ssh::auth::AuthMethods;
use sshbind_platform::{SshError, SshResult};
use std::fmt;
use std::path::{Path, PathBuf};

/// Keys accepted by [`ListenerConfig::apply`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BindOption {
    /// Local address to bind (string).
    BindAddress,
    /// Local port (integer).
    BindPort,
    /// Local port (string).
    BindPortString,
    /// Generic host key file (string path).
    HostKey,
    /// DSA host key file (string path).
    DsaKey,
    /// RSA host key file (string path).
    RsaKey,
    /// ECDSA host key file (string path).
    EcdsaKey,
    /// Pre-auth banner text (string).
    Banner,
    /// Diagnostic verbosity (integer).
    LogVerbosity,
    /// Diagnostic verbosity (string).
    LogVerbosityString,
}

impl BindOption {
    /// Whether the option expects an integer value.
    pub fn expects_int(&self) -> bool {
        matches!(self, BindOption::BindPort | BindOption::LogVerbosity)
    }
}

impl fmt::Display for BindOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BindOption::BindAddress => "BindAddress",
            BindOption::BindPort => "BindPort",
            BindOption::BindPortString => "BindPortString",
            BindOption::HostKey => "HostKey",
            BindOption::DsaKey => "DSAKey",
            BindOption::RsaKey => "RSAKey",
            BindOption::EcdsaKey => "ECDSAKey",
            BindOption::Banner => "Banner",
            BindOption::LogVerbosity => "LogVerbosity",
            BindOption::LogVerbosityString => "LogVerbosityString",
        };
        f.write_str(name)
    }
}

/// Value passed with a [`BindOption`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OptionValue {
    /// Integer value.
    Int(i64),
    /// String value.
    Str(String),
}

impl OptionValue {
    fn type_name(&self) -> &'static str {
        match self {
            OptionValue::Int(_) => "an integer",
            OptionValue::Str(_) => "a string",
        }
    }
}

impl From<i64> for OptionValue {
    fn from(value: i64) -> Self {
        OptionValue::Int(value)
    }
}

impl From<i32> for OptionValue {
    fn from(value: i32) -> Self {
        OptionValue::Int(value.into())
    }
}

impl From<u32> for OptionValue {
    fn from(value: u32) -> Self {
        OptionValue::Int(value.into())
    }
}

impl From<u16> for OptionValue {
    fn from(value: u16) -> Self {
        OptionValue::Int(value.into())
    }
}

impl From<&str> for OptionValue {
    fn from(value: &str) -> Self {
        OptionValue::Str(value.to_string())
    }
}

impl From<String> for OptionValue {
    fn from(value: String) -> Self {
        OptionValue::Str(value)
    }
}

/// Diagnostic verbosity levels, from silent to function tracing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(u8)]
pub enum LogVerbosity {
    /// No diagnostics.
    #[default]
    NoLog = 0,
    /// Warnings only.
    Warning = 1,
    /// Protocol events (state transitions).
    Protocol = 2,
    /// Every packet.
    Packet = 3,
    /// Function-level tracing.
    Functions = 4,
}

impl LogVerbosity {
    /// Converts a numeric level.
    pub fn from_level(level: i64) -> Option<Self> {
        match level {
            0 => Some(LogVerbosity::NoLog),
            1 => Some(LogVerbosity::Warning),
            2 => Some(LogVerbosity::Protocol),
            3 => Some(LogVerbosity::Packet),
            4 => Some(LogVerbosity::Functions),
            _ => None,
        }
    }

    /// Parses a level given as digits or as a name (case-insensitive).
    ///
    /// ```rust
    /// use sshbind_proto::ssh::options::LogVerbosity;
    ///
    /// assert_eq!(LogVerbosity::parse("3"), Some(LogVerbosity::Packet));
    /// assert_eq!(LogVerbosity::parse("warning"), Some(LogVerbosity::Warning));
    /// assert_eq!(LogVerbosity::parse("loud"), None);
    /// ```
    pub fn parse(text: &str) -> Option<Self> {
        let text = text.trim();
        if let Ok(level) = text.parse::<i64>() {
            return Self::from_level(level);
        }
        match text.to_ascii_lowercase().as_str() {
            "nolog" | "none" => Some(LogVerbosity::NoLog),
            "warning" | "warn" => Some(LogVerbosity::Warning),
            "protocol" => Some(LogVerbosity::Protocol),
            "packet" => Some(LogVerbosity::Packet),
            "functions" => Some(LogVerbosity::Functions),
            _ => None,
        }
    }
}

/// Host key slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HostKeyKind {
    /// Key of unspecified algorithm.
    Generic,
    /// RSA key.
    Rsa,
    /// DSA key.
    Dsa,
    /// ECDSA key.
    Ecdsa,
}

/// One configured host key file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostKeyEntry {
    /// Slot the key occupies.
    pub kind: HostKeyKind,
    /// Path of the key file, read by the key-exchange provider.
    pub path: PathBuf,
}

/// Host keys of a listener, at most one per [`HostKeyKind`].
///
/// The set is read-only shared data once the listener is listening.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostKeySet {
    entries: Vec<HostKeyEntry>,
}

impl HostKeySet {
    /// Creates an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the key for `kind`, replacing any previous one.
    pub fn insert(&mut self, kind: HostKeyKind, path: impl Into<PathBuf>) {
        let path = path.into();
        match self.entries.iter_mut().find(|entry| entry.kind == kind) {
            Some(entry) => entry.path = path,
            None => self.entries.push(HostKeyEntry { kind, path }),
        }
    }

    /// Returns the key path for `kind`.
    pub fn get(&self, kind: HostKeyKind) -> Option<&Path> {
        self.entries
            .iter()
            .find(|entry| entry.kind == kind)
            .map(|entry| entry.path.as_path())
    }

    /// Iterates over the configured keys in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &HostKeyEntry> {
        self.entries.iter()
    }

    /// Number of configured keys.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no key is configured.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Per-session policy, copied into every accepted session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Methods advertised until `set_auth_methods` is called.
    pub default_auth_methods: AuthMethods,
    /// Failed attempts (excluding "none") before the client is disconnected.
    pub max_auth_attempts: u32,
    /// Reject `set_auth_methods` after authentication instead of ignoring it.
    pub strict_auth_methods: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            default_auth_methods: AuthMethods::PASSWORD | AuthMethods::PUBLICKEY,
            max_auth_attempts: 6,
            strict_auth_methods: true,
        }
    }
}

/// Listener configuration.
///
/// Frozen once the listener starts listening.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerConfig {
    /// Local address to bind.
    pub bind_address: String,
    /// Local port to bind (0 picks an ephemeral port).
    pub bind_port: u16,
    /// Host key files.
    pub host_keys: HostKeySet,
    /// Banner sent before the first authentication reply.
    pub banner: Option<String>,
    /// Diagnostic verbosity.
    pub log_verbosity: LogVerbosity,
    /// Software part of the server identification string.
    pub server_software: String,
    /// Concurrently live sessions allowed per listener.
    pub max_sessions: usize,
    /// Policy for accepted sessions.
    pub session: SessionConfig,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            bind_port: 22,
            host_keys: HostKeySet::new(),
            banner: None,
            log_verbosity: LogVerbosity::default(),
            server_software: format!("sshbind_{}", env!("CARGO_PKG_VERSION")),
            max_sessions: 64,
            session: SessionConfig::default(),
        }
    }
}

fn expect_int(option: BindOption, value: &OptionValue) -> SshResult<i64> {
    match value {
        OptionValue::Int(v) => Ok(*v),
        other => Err(SshError::InvalidOption(format!(
            "{} expects an integer, got {}",
            option,
            other.type_name()
        ))),
    }
}

fn expect_str(option: BindOption, value: &OptionValue) -> SshResult<&str> {
    match value {
        OptionValue::Str(s) if s.is_empty() && option != BindOption::Banner => Err(
            SshError::InvalidOption(format!("{} must not be empty", option)),
        ),
        OptionValue::Str(s) => Ok(s.as_str()),
        other => Err(SshError::InvalidOption(format!(
            "{} expects a string, got {}",
            option,
            other.type_name()
        ))),
    }
}

fn port_from_int(option: BindOption, port: i64) -> SshResult<u16> {
    u16::try_from(port).map_err(|_| {
        SshError::InvalidOption(format!("{} {} is outside 0..=65535", option, port))
    })
}

impl ListenerConfig {
    /// Sets one option.
    ///
    /// Either the whole value is applied or, on error, the configuration is
    /// left untouched.
    ///
    /// # Errors
    ///
    /// Returns [`SshError::InvalidOption`] on a value of the wrong type or an
    /// out-of-range value.
    pub fn apply(&mut self, option: BindOption, value: impl Into<OptionValue>) -> SshResult<()> {
        let value = value.into();

        match option {
            BindOption::BindAddress => {
                self.bind_address = expect_str(option, &value)?.to_string();
            }
            BindOption::BindPort => {
                self.bind_port = port_from_int(option, expect_int(option, &value)?)?;
            }
            BindOption::BindPortString => {
                let text = expect_str(option, &value)?;
                let port = text.trim().parse::<i64>().map_err(|_| {
                    SshError::InvalidOption(format!("{} '{}' is not a number", option, text))
                })?;
                self.bind_port = port_from_int(option, port)?;
            }
            BindOption::HostKey => {
                let path = expect_str(option, &value)?;
                self.host_keys.insert(HostKeyKind::Generic, path);
            }
            BindOption::DsaKey => {
                let path = expect_str(option, &value)?;
                self.host_keys.insert(HostKeyKind::Dsa, path);
            }
            BindOption::RsaKey => {
                let path = expect_str(option, &value)?;
                self.host_keys.insert(HostKeyKind::Rsa, path);
            }
            BindOption::EcdsaKey => {
                let path = expect_str(option, &value)?;
                self.host_keys.insert(HostKeyKind::Ecdsa, path);
            }
            BindOption::Banner => {
                self.banner = Some(expect_str(option, &value)?.to_string());
            }
            BindOption::LogVerbosity => {
                let level = expect_int(option, &value)?;
                self.log_verbosity = LogVerbosity::from_level(level).ok_or_else(|| {
                    SshError::InvalidOption(format!("{} {} is outside 0..=4", option, level))
                })?;
            }
            BindOption::LogVerbosityString => {
                let text = expect_str(option, &value)?;
                self.log_verbosity = LogVerbosity::parse(text).ok_or_else(|| {
                    SshError::InvalidOption(format!("{} '{}' is not a level", option, text))
                })?;
            }
        }

        Ok(())
    }

    /// Checks values that cannot be validated field by field.
    ///
    /// # Errors
    ///
    /// Returns [`SshError::InvalidOption`] describing the first bad value.
    pub fn validate(&self) -> SshResult<()> {
        if self.bind_address.is_empty() {
            return Err(SshError::InvalidOption(
                "BindAddress must not be empty".to_string(),
            ));
        }
        if self.server_software.is_empty()
            || self
                .server_software
                .chars()
                .any(|c| c.is_whitespace() || c == '-' || c.is_control())
        {
            return Err(SshError::InvalidOption(format!(
                "server software '{}' is not a valid identification",
                self.server_software
            )));
        }
        if self.max_sessions == 0 {
            return Err(SshError::InvalidOption(
                "max_sessions must be at least 1".to_string(),
            ));
        }
        if self.session.max_auth_attempts == 0 {
            return Err(SshError::InvalidOption(
                "max_auth_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
