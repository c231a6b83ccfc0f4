//! Key exchange (RFC 4253 Section 7).
//!
//! The cryptography of a key exchange lives outside this crate: a session
//! hands its [`Transport`] to a [`KeyExchanger`] and only looks at the
//! outcome. Providers can use [`KexInit`], [`negotiate_algorithm`] and
//! [`exchange_kexinit`] for the algorithm negotiation that every method
//! shares.
//!
//! # Key Exchange Flow
//!
//! 1. Both sides send SSH_MSG_KEXINIT
//! 2. Algorithm negotiation (first client preference the server supports)
//! 3. Method specific messages (DH, ECDH, ...)
//! 4. Both sides send SSH_MSG_NEWKEYS and switch keys
//!
//! # Example
//!
//! ```rust
//! use sshbind_proto::ssh::kex::KexInit;
//!
//! let kexinit = KexInit::new(&["curve25519-sha256"], &["ssh-ed25519"]);
//! let bytes = kexinit.to_bytes();
//! assert_eq!(bytes[0], 20); // SSH_MSG_KEXINIT
//!
//! let parsed = KexInit::from_bytes(&bytes).unwrap();
//! assert_eq!(parsed.kex_algorithms(), kexinit.kex_algorithms());
//! ```

use crate::ssh::message::MessageType;
use crate::ssh::options::HostKeySet;
use crate::ssh::transport::Transport;
use crate::ssh::version::Version;
use crate::ssh::wire::{write_bool, write_name_list, WireReader};
use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
use rand::RngCore;
use sshbind_platform::{SshError, SshResult};

/// Read-only inputs of one key exchange.
#[derive(Debug, Clone, Copy)]
pub struct KexContext<'a> {
    /// Host keys of the accepting listener.
    pub host_keys: &'a HostKeySet,
    /// Identification sent by the client.
    pub client_version: &'a Version,
    /// Identification sent by this server.
    pub server_version: &'a Version,
}

/// Result of a completed key exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KexOutcome {
    /// Exchange hash of the first key exchange (RFC 4253 Section 7.2).
    pub session_id: Vec<u8>,
    /// Negotiated key exchange method.
    pub kex_algorithm: String,
    /// Negotiated host key algorithm.
    pub host_key_algorithm: String,
}

/// Cryptographic provider performing the key exchange of a session.
///
/// Called with the transport right after the identification exchange. Once
/// NEWKEYS has been exchanged the provider installs its cipher and MAC with
/// [`Transport::set_outbound_protection`] and
/// [`Transport::set_inbound_protection`]; every later packet then goes
/// through them. Any error fails the session with a key exchange error.
#[async_trait]
pub trait KeyExchanger: Send + Sync {
    /// Runs the key exchange on `transport`.
    async fn exchange(
        &self,
        transport: &mut Transport,
        context: &KexContext<'_>,
    ) -> SshResult<KexOutcome>;
}

/// SSH_MSG_KEXINIT message (RFC 4253 Section 7.1).
///
/// Each algorithm list is ordered by preference (most preferred first).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KexInit {
    cookie: [u8; 16],
    kex_algorithms: Vec<String>,
    server_host_key_algorithms: Vec<String>,
    encryption_algorithms_client_to_server: Vec<String>,
    encryption_algorithms_server_to_client: Vec<String>,
    mac_algorithms_client_to_server: Vec<String>,
    mac_algorithms_server_to_client: Vec<String>,
    compression_algorithms_client_to_server: Vec<String>,
    compression_algorithms_server_to_client: Vec<String>,
    languages_client_to_server: Vec<String>,
    languages_server_to_client: Vec<String>,
    first_kex_packet_follows: bool,
}

fn to_list(names: &[&str]) -> Vec<String> {
    names.iter().map(|name| name.to_string()).collect()
}

impl KexInit {
    /// Creates a KEXINIT with a random cookie.
    ///
    /// Cipher and MAC lists default to modern AEAD and HMAC choices, no
    /// compression; use [`KexInit::with_ciphers`] and [`KexInit::with_macs`]
    /// to override them.
    pub fn new(kex_algorithms: &[&str], host_key_algorithms: &[&str]) -> Self {
        let mut cookie = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut cookie);

        let ciphers = to_list(&[
            "chacha20-poly1305@openssh.com",
            "aes256-gcm@openssh.com",
            "aes128-gcm@openssh.com",
            "aes256-ctr",
            "aes128-ctr",
        ]);
        let macs = to_list(&["hmac-sha2-256", "hmac-sha2-512"]);

        Self {
            cookie,
            kex_algorithms: to_list(kex_algorithms),
            server_host_key_algorithms: to_list(host_key_algorithms),
            encryption_algorithms_client_to_server: ciphers.clone(),
            encryption_algorithms_server_to_client: ciphers,
            mac_algorithms_client_to_server: macs.clone(),
            mac_algorithms_server_to_client: macs,
            compression_algorithms_client_to_server: vec!["none".to_string()],
            compression_algorithms_server_to_client: vec!["none".to_string()],
            languages_client_to_server: vec![],
            languages_server_to_client: vec![],
            first_kex_packet_follows: false,
        }
    }

    /// Replaces the cipher lists of both directions.
    pub fn with_ciphers(mut self, ciphers: &[&str]) -> Self {
        self.encryption_algorithms_client_to_server = to_list(ciphers);
        self.encryption_algorithms_server_to_client = to_list(ciphers);
        self
    }

    /// Replaces the MAC lists of both directions.
    pub fn with_macs(mut self, macs: &[&str]) -> Self {
        self.mac_algorithms_client_to_server = to_list(macs);
        self.mac_algorithms_server_to_client = to_list(macs);
        self
    }

    /// Returns the cookie.
    pub fn cookie(&self) -> &[u8; 16] {
        &self.cookie
    }

    /// Returns the key exchange algorithms.
    pub fn kex_algorithms(&self) -> &[String] {
        &self.kex_algorithms
    }

    /// Returns the host key algorithms.
    pub fn server_host_key_algorithms(&self) -> &[String] {
        &self.server_host_key_algorithms
    }

    /// Returns the client-to-server ciphers.
    pub fn encryption_algorithms_client_to_server(&self) -> &[String] {
        &self.encryption_algorithms_client_to_server
    }

    /// Returns the client-to-server MACs.
    pub fn mac_algorithms_client_to_server(&self) -> &[String] {
        &self.mac_algorithms_client_to_server
    }

    /// Returns whether a guessed key exchange packet follows.
    pub fn first_kex_packet_follows(&self) -> bool {
        self.first_kex_packet_follows
    }

    /// Serializes the message.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();

        buf.put_u8(MessageType::KexInit as u8);
        buf.put_slice(&self.cookie);

        write_name_list(&mut buf, &self.kex_algorithms);
        write_name_list(&mut buf, &self.server_host_key_algorithms);
        write_name_list(&mut buf, &self.encryption_algorithms_client_to_server);
        write_name_list(&mut buf, &self.encryption_algorithms_server_to_client);
        write_name_list(&mut buf, &self.mac_algorithms_client_to_server);
        write_name_list(&mut buf, &self.mac_algorithms_server_to_client);
        write_name_list(&mut buf, &self.compression_algorithms_client_to_server);
        write_name_list(&mut buf, &self.compression_algorithms_server_to_client);
        write_name_list(&mut buf, &self.languages_client_to_server);
        write_name_list(&mut buf, &self.languages_server_to_client);

        write_bool(&mut buf, self.first_kex_packet_follows);
        // reserved
        buf.put_u32(0);

        buf.to_vec()
    }

    /// Parses a KEXINIT message.
    ///
    /// # Errors
    ///
    /// Returns [`SshError::KeyExchange`] if the message is not a KEXINIT or
    /// is truncated.
    pub fn from_bytes(data: &[u8]) -> SshResult<Self> {
        let kex_err =
            |e: SshError| SshError::KeyExchange(format!("Malformed KEXINIT: {}", e.message()));
        let mut reader = WireReader::new(data);

        let msg_type = reader.read_u8().map_err(kex_err)?;
        if msg_type != MessageType::KexInit as u8 {
            return Err(SshError::KeyExchange(format!(
                "Invalid message type: expected 20 (SSH_MSG_KEXINIT), got {}",
                msg_type
            )));
        }

        if reader.remaining() < 16 {
            return Err(SshError::KeyExchange(format!(
                "KEXINIT message too short: {} bytes (minimum 17)",
                data.len()
            )));
        }
        let mut cookie = [0u8; 16];
        for byte in cookie.iter_mut() {
            *byte = reader.read_u8().map_err(kex_err)?;
        }

        let mut lists = Vec::with_capacity(10);
        for _ in 0..10 {
            lists.push(reader.read_name_list().map_err(kex_err)?);
        }
        let first_kex_packet_follows = reader.read_bool().map_err(kex_err)?;
        let _reserved = reader.read_u32().map_err(kex_err)?;

        let mut lists = lists.into_iter();
        let mut next = || lists.next().unwrap_or_default();

        Ok(Self {
            cookie,
            kex_algorithms: next(),
            server_host_key_algorithms: next(),
            encryption_algorithms_client_to_server: next(),
            encryption_algorithms_server_to_client: next(),
            mac_algorithms_client_to_server: next(),
            mac_algorithms_server_to_client: next(),
            compression_algorithms_client_to_server: next(),
            compression_algorithms_server_to_client: next(),
            languages_client_to_server: next(),
            languages_server_to_client: next(),
            first_kex_packet_follows,
        })
    }
}

/// Negotiates one algorithm: the first client preference the server supports
/// (RFC 4253 Section 7.1).
///
/// # Errors
///
/// Returns [`SshError::KeyExchange`] if no common algorithm is found.
///
/// ```rust
/// use sshbind_proto::ssh::kex::negotiate_algorithm;
///
/// let client = vec!["aes256-ctr".to_string(), "aes128-ctr".to_string()];
/// let server = vec!["aes128-ctr".to_string(), "aes256-ctr".to_string()];
///
/// assert_eq!(negotiate_algorithm(&client, &server).unwrap(), "aes256-ctr");
/// ```
pub fn negotiate_algorithm(client_list: &[String], server_list: &[String]) -> SshResult<String> {
    client_list
        .iter()
        .find(|alg| server_list.contains(alg))
        .cloned()
        .ok_or_else(|| {
            SshError::KeyExchange(format!(
                "No common algorithm: client={:?}, server={:?}",
                client_list, server_list
            ))
        })
}

/// Algorithms both sides agreed on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegotiatedAlgorithms {
    /// Key exchange method.
    pub kex: String,
    /// Host key algorithm.
    pub host_key: String,
    /// Client-to-server cipher.
    pub cipher: String,
    /// Client-to-server MAC.
    pub mac: String,
}

/// Sends the server KEXINIT, reads the client's and negotiates.
///
/// Returns the client KEXINIT together with the agreed algorithms.
///
/// # Errors
///
/// Returns [`SshError::KeyExchange`] on transport failure, an unexpected
/// message or no common algorithm.
pub async fn exchange_kexinit(
    transport: &mut Transport,
    server: &KexInit,
) -> SshResult<(KexInit, NegotiatedAlgorithms)> {
    transport
        .send_payload(server.to_bytes())
        .await
        .map_err(|e| SshError::KeyExchange(format!("Failed to send KEXINIT: {}", e)))?;

    let payload = transport
        .recv_payload()
        .await
        .map_err(|e| SshError::KeyExchange(format!("Failed to read KEXINIT: {}", e)))?
        .ok_or_else(|| SshError::KeyExchange("Connection closed during KEXINIT".to_string()))?;
    let client = KexInit::from_bytes(&payload)?;

    let negotiated = NegotiatedAlgorithms {
        kex: negotiate_algorithm(&client.kex_algorithms, &server.kex_algorithms)?,
        host_key: negotiate_algorithm(
            &client.server_host_key_algorithms,
            &server.server_host_key_algorithms,
        )?,
        cipher: negotiate_algorithm(
            &client.encryption_algorithms_client_to_server,
            &server.encryption_algorithms_client_to_server,
        )?,
        mac: negotiate_algorithm(
            &client.mac_algorithms_client_to_server,
            &server.mac_algorithms_client_to_server,
        )?,
    };

    Ok((client, negotiated))
}
