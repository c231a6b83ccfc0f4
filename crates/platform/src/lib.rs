//! # sshbind platform
//!
//! Types shared by every sshbind crate:
//! - The unified error type (`SshError`) and its closed taxonomy (`ErrorKind`)
//! - The `SshResult<T>` alias
//!
//! # Examples
//!
//! ```
//! use sshbind_platform::{ErrorKind, SshError, SshResult};
//!
//! fn parse_port(raw: &str) -> SshResult<u16> {
//!     raw.parse()
//!         .map_err(|_| SshError::InvalidOption(format!("'{}' is not a port", raw)))
//! }
//!
//! let err = parse_port("twenty-two").unwrap_err();
//! assert_eq!(err.kind(), ErrorKind::InvalidOption);
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod error;

pub use error::{ErrorKind, SshError, SshResult};

/// Platform version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
