//! Listening endpoint that turns connections into sessions.
//!
//! A [`Listener`] is configured through [`Listener::set_option`], starts
//! listening with [`Listener::listen`] (or [`Listener::listen_on`] for a
//! pre-bound socket) and hands out one [`Session`] per accepted connection.
//! Configuration is frozen as soon as the listener listens or produces its
//! first session.
//!
//! Sessions can be pulled with [`Listener::accept`] or pushed to an
//! [`IncomingConnectionHandler`] by [`Listener::run`].
//!
//! # Example
//!
//! ```rust,no_run
//! use sshbind_proto::ssh::{BindOption, Listener, ListenerConfig};
//! # use sshbind_proto::ssh::KeyExchanger;
//! # use std::sync::Arc;
//!
//! # async fn example(exchanger: Arc<dyn KeyExchanger>) -> sshbind_platform::SshResult<()> {
//! let mut listener = Listener::new(ListenerConfig::default(), exchanger)?;
//! listener.set_option(BindOption::BindPort, 2222)?;
//! listener.set_option(BindOption::RsaKey, "/etc/ssh/ssh_host_rsa_key")?;
//! listener.listen().await?;
//!
//! loop {
//!     let mut session = listener.accept(None).await?;
//!     tokio::spawn(async move {
//!         if session.handle_key_exchange().await.is_ok() {
//!             while session.execute_message_callbacks(None).await.is_ok() {}
//!         }
//!     });
//! }
//! # }
//! ```

use crate::ssh::callbacks::{IncomingConnectionHandler, ListenerCallbacks};
use crate::ssh::decoder::{StandardDecoder, WireDecoder};
use crate::ssh::kex::KeyExchanger;
use crate::ssh::options::{
    BindOption, HostKeySet, ListenerConfig, LogVerbosity, OptionValue, SessionConfig,
};
use crate::ssh::session::Session;
use crate::ssh::transport::AsyncStream;
use crate::ssh::version::Version;
use futures_util::FutureExt;
use sshbind_platform::{SshError, SshResult};
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Read-only state shared by every session of one listener.
pub(crate) struct ListenerShared {
    pub(crate) host_keys: HostKeySet,
    pub(crate) banner: Option<String>,
    pub(crate) verbosity: LogVerbosity,
    pub(crate) server_version: Version,
    pub(crate) session: SessionConfig,
    pub(crate) key_exchanger: Arc<dyn KeyExchanger>,
    pub(crate) decoder: Arc<dyn WireDecoder>,
}

enum Endpoint {
    Configuring,
    Listening(TcpListener),
    Closed,
}

/// Shuts a [`Listener`] down from another task.
///
/// Shutdown is final: a pending or later accept closes the listener and
/// releases its socket.
#[derive(Debug, Clone)]
pub struct ListenerShutdown {
    token: CancellationToken,
}

impl ListenerShutdown {
    /// Requests shutdown; wakes a blocked accept.
    pub fn shutdown(&self) {
        self.token.cancel();
    }

    /// Whether shutdown has been requested.
    pub fn is_shutdown(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// SSH listening endpoint.
pub struct Listener {
    config: ListenerConfig,
    key_exchanger: Arc<dyn KeyExchanger>,
    decoder: Arc<dyn WireDecoder>,
    callbacks: ListenerCallbacks,
    endpoint: Endpoint,
    shared: Option<Arc<ListenerShared>>,
    sessions: Arc<Semaphore>,
    blocking: bool,
    next_session_id: u64,
    shutdown: CancellationToken,
}

impl fmt::Debug for Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let endpoint = match &self.endpoint {
            Endpoint::Configuring => "configuring",
            Endpoint::Listening(_) => "listening",
            Endpoint::Closed => "closed",
        };
        f.debug_struct("Listener")
            .field("config", &self.config)
            .field("endpoint", &endpoint)
            .field("blocking", &self.blocking)
            .field("callbacks", &self.callbacks)
            .finish_non_exhaustive()
    }
}

impl Listener {
    /// Creates a listener using [`StandardDecoder`].
    ///
    /// # Errors
    ///
    /// Returns [`SshError::InvalidOption`] if `config` does not validate.
    pub fn new(config: ListenerConfig, key_exchanger: Arc<dyn KeyExchanger>) -> SshResult<Self> {
        Self::with_decoder(config, key_exchanger, Arc::new(StandardDecoder))
    }

    /// Creates a listener with a custom wire decoder.
    pub fn with_decoder(
        config: ListenerConfig,
        key_exchanger: Arc<dyn KeyExchanger>,
        decoder: Arc<dyn WireDecoder>,
    ) -> SshResult<Self> {
        config.validate()?;
        let sessions = Arc::new(Semaphore::new(config.max_sessions));

        Ok(Self {
            config,
            key_exchanger,
            decoder,
            callbacks: ListenerCallbacks::default(),
            endpoint: Endpoint::Configuring,
            shared: None,
            sessions,
            blocking: true,
            next_session_id: 1,
            shutdown: CancellationToken::new(),
        })
    }

    /// Current configuration.
    pub fn config(&self) -> &ListenerConfig {
        &self.config
    }

    /// Sets one option.
    ///
    /// # Errors
    ///
    /// - [`SshError::InvalidOption`] on a value of the wrong type or range;
    ///   the configuration is unchanged
    /// - [`SshError::InvalidState`] once the configuration is frozen
    pub fn set_option(
        &mut self,
        option: BindOption,
        value: impl Into<OptionValue>,
    ) -> SshResult<()> {
        self.ensure_configurable()?;
        self.config.apply(option, value)
    }

    /// Switches [`Listener::accept`] between waiting and polling once.
    pub fn set_blocking(&mut self, blocking: bool) {
        self.blocking = blocking;
    }

    /// Whether [`Listener::accept`] waits for a connection.
    pub fn is_blocking(&self) -> bool {
        self.blocking
    }

    /// Registers the handler used by [`Listener::run`], replacing any
    /// previous one.
    pub fn set_incoming_connection_handler(&mut self, handler: Arc<dyn IncomingConnectionHandler>) {
        self.callbacks.set_incoming_connection_handler(handler);
    }

    /// Handle that shuts the listener down and stops [`Listener::run`].
    pub fn shutdown_handle(&self) -> ListenerShutdown {
        ListenerShutdown {
            token: self.shutdown.clone(),
        }
    }

    /// Binds the configured address and starts listening.
    ///
    /// # Errors
    ///
    /// - [`SshError::Bind`] when no host key is configured or the address
    ///   cannot be bound; the listener may be reconfigured and retried
    /// - [`SshError::InvalidState`] when already listening or closed
    pub async fn listen(&mut self) -> SshResult<()> {
        self.ensure_configurable()?;
        self.require_host_key()?;

        let address = (self.config.bind_address.as_str(), self.config.bind_port);
        let socket = TcpListener::bind(address).await.map_err(|e| {
            SshError::Bind(format!(
                "Failed to bind {}:{}: {}",
                self.config.bind_address, self.config.bind_port, e
            ))
        })?;

        self.start(socket)
    }

    /// Starts listening on a socket the caller already bound.
    ///
    /// Use this to hand over a descriptor obtained elsewhere (socket
    /// activation, a privileged parent) after wrapping it with
    /// `std::net::TcpListener::from`. The bound address wins over
    /// [`BindOption::BindAddress`] and [`BindOption::BindPort`].
    ///
    /// # Errors
    ///
    /// Same as [`Listener::listen`].
    pub fn listen_on(&mut self, socket: std::net::TcpListener) -> SshResult<()> {
        self.ensure_configurable()?;
        self.require_host_key()?;

        socket
            .set_nonblocking(true)
            .map_err(|e| SshError::Bind(format!("Failed to configure socket: {}", e)))?;
        let socket = TcpListener::from_std(socket)
            .map_err(|e| SshError::Bind(format!("Failed to register socket: {}", e)))?;

        self.start(socket)
    }

    fn start(&mut self, socket: TcpListener) -> SshResult<()> {
        let local = socket
            .local_addr()
            .map_err(|e| SshError::Bind(format!("Failed to query local address: {}", e)))?;
        self.freeze();
        self.endpoint = Endpoint::Listening(socket);
        info!(addr = %local, "listening");
        Ok(())
    }

    /// Address the listener is bound to.
    ///
    /// # Errors
    ///
    /// [`SshError::InvalidState`] unless listening.
    pub fn local_addr(&self) -> SshResult<SocketAddr> {
        self.socket()?
            .local_addr()
            .map_err(|e| SshError::InvalidState(format!("Failed to query local address: {}", e)))
    }

    /// Descriptor of the listening socket.
    ///
    /// # Errors
    ///
    /// [`SshError::InvalidState`] unless listening.
    #[cfg(unix)]
    pub fn raw_fd(&self) -> SshResult<std::os::unix::io::RawFd> {
        use std::os::unix::io::AsRawFd;
        Ok(self.socket()?.as_raw_fd())
    }

    /// Accepts the next connection.
    ///
    /// In blocking mode this waits for a connection, up to `deadline` when
    /// given. In non-blocking mode it polls the socket once.
    ///
    /// # Errors
    ///
    /// - [`SshError::Timeout`] when the deadline expires or, in non-blocking
    ///   mode, when no connection is pending
    /// - [`SshError::Allocation`] when `max_sessions` sessions are alive; the
    ///   connection is dropped
    /// - [`SshError::Accept`] on a socket error
    /// - [`SshError::InvalidState`] unless listening; once shut down the
    ///   listener closes itself and keeps returning this
    pub async fn accept(&mut self, deadline: Option<Duration>) -> SshResult<Session> {
        self.check_shutdown()?;

        let blocking = self.blocking;
        let socket = self.socket()?;
        let accepted = if blocking {
            let accept = async {
                tokio::select! {
                    biased;
                    _ = self.shutdown.cancelled() => None,
                    accepted = socket.accept() => Some(accepted),
                }
            };
            match deadline {
                Some(deadline) => tokio::time::timeout(deadline, accept).await.map_err(|_| {
                    SshError::Timeout(format!("no connection within {:?}", deadline))
                })?,
                None => accept.await,
            }
        } else {
            match socket.accept().now_or_never() {
                Some(accepted) => Some(accepted),
                None => return Err(SshError::Timeout("no pending connection".to_string())),
            }
        };

        let (stream, peer) = match accepted {
            Some(accepted) => {
                accepted.map_err(|e| SshError::Accept(format!("Failed to accept: {}", e)))?
            }
            None => {
                self.close();
                return Err(SshError::InvalidState("listener shut down".to_string()));
            }
        };

        if let Err(e) = stream.set_nodelay(true) {
            debug!(peer = %peer, error = %e, "set_nodelay failed");
        }
        self.new_session(Box::new(stream), Some(peer))
    }

    /// Turns an already connected socket into a session using this
    /// listener's configuration.
    ///
    /// The descriptor is independent of the listening socket; the listener
    /// does not need to be listening, but its configuration is frozen.
    ///
    /// # Errors
    ///
    /// - [`SshError::Accept`] if the descriptor is not a usable TCP socket
    /// - [`SshError::Bind`] when no host key is configured
    /// - [`SshError::Allocation`] when `max_sessions` sessions are alive
    #[cfg(unix)]
    pub fn accept_fd(&mut self, fd: std::os::fd::OwnedFd) -> SshResult<Session> {
        let stream = std::net::TcpStream::from(fd);
        stream
            .set_nonblocking(true)
            .map_err(|e| SshError::Accept(format!("Failed to configure descriptor: {}", e)))?;
        let stream = TcpStream::from_std(stream)
            .map_err(|e| SshError::Accept(format!("Failed to register descriptor: {}", e)))?;
        let peer = stream.peer_addr().ok();

        self.accept_stream(stream, peer)
    }

    /// Turns any connected byte stream into a session.
    ///
    /// # Errors
    ///
    /// Same as [`Listener::accept_fd`], minus descriptor errors.
    pub fn accept_stream<S>(&mut self, stream: S, peer: Option<SocketAddr>) -> SshResult<Session>
    where
        S: AsyncStream + 'static,
    {
        self.check_shutdown()?;
        if matches!(self.endpoint, Endpoint::Closed) {
            return Err(SshError::InvalidState("listener is closed".to_string()));
        }
        if self.shared.is_none() {
            self.require_host_key()?;
            self.freeze();
        }
        self.new_session(Box::new(stream), peer)
    }

    /// Accepts connections and hands each session to the registered
    /// incoming-connection handler.
    ///
    /// Returns `Ok(())` once shut down through [`Listener::shutdown_handle`];
    /// the listener is closed by then. Connections refused for capacity are
    /// logged and dropped; any other accept error ends the loop.
    ///
    /// # Errors
    ///
    /// - [`SshError::InvalidState`] without a registered handler or unless
    ///   listening
    /// - the first accept error other than [`SshError::Allocation`]
    pub async fn run(&mut self) -> SshResult<()> {
        let handler = self.callbacks.incoming_connection_handler().ok_or_else(|| {
            SshError::InvalidState("no incoming connection handler registered".to_string())
        })?;
        self.socket()?;

        let blocking = std::mem::replace(&mut self.blocking, true);
        let result = loop {
            match self.accept(None).await {
                Ok(session) => handler.on_incoming_connection(session),
                Err(SshError::Allocation(msg)) => warn!(reason = %msg, "connection refused"),
                Err(_) if self.shutdown.is_cancelled() => break Ok(()),
                Err(err) => break Err(err),
            }
        };
        self.blocking = blocking;
        if self.shutdown.is_cancelled() {
            self.close();
        }

        debug!("accept loop stopped");
        result
    }

    /// Stops listening and releases the socket.
    ///
    /// Sessions already accepted are not affected. Calling it again does
    /// nothing.
    pub fn close(&mut self) {
        if matches!(self.endpoint, Endpoint::Closed) {
            return;
        }
        self.shutdown.cancel();
        self.endpoint = Endpoint::Closed;
        info!("listener closed");
    }

    fn check_shutdown(&mut self) -> SshResult<()> {
        if self.shutdown.is_cancelled() {
            self.close();
            return Err(SshError::InvalidState("listener shut down".to_string()));
        }
        Ok(())
    }

    fn ensure_configurable(&self) -> SshResult<()> {
        match self.endpoint {
            Endpoint::Closed => Err(SshError::InvalidState("listener is closed".to_string())),
            _ if self.shared.is_some() => Err(SshError::InvalidState(
                "configuration is frozen once the listener is in use".to_string(),
            )),
            _ => Ok(()),
        }
    }

    fn require_host_key(&self) -> SshResult<()> {
        if self.config.host_keys.is_empty() {
            return Err(SshError::Bind("no host key configured".to_string()));
        }
        Ok(())
    }

    fn socket(&self) -> SshResult<&TcpListener> {
        match &self.endpoint {
            Endpoint::Listening(socket) => Ok(socket),
            Endpoint::Configuring => Err(SshError::InvalidState(
                "listener is not listening".to_string(),
            )),
            Endpoint::Closed => Err(SshError::InvalidState("listener is closed".to_string())),
        }
    }

    fn freeze(&mut self) {
        if self.shared.is_some() {
            return;
        }
        self.shared = Some(Arc::new(ListenerShared {
            host_keys: self.config.host_keys.clone(),
            banner: self.config.banner.clone(),
            verbosity: self.config.log_verbosity,
            server_version: Version::new(&self.config.server_software, None),
            session: self.config.session.clone(),
            key_exchanger: Arc::clone(&self.key_exchanger),
            decoder: Arc::clone(&self.decoder),
        }));
    }

    fn new_session(
        &mut self,
        stream: Box<dyn AsyncStream>,
        peer: Option<SocketAddr>,
    ) -> SshResult<Session> {
        let shared = self
            .shared
            .clone()
            .ok_or_else(|| SshError::InvalidState("listener is not configured".to_string()))?;

        let permit = Arc::clone(&self.sessions).try_acquire_owned().map_err(|_| {
            SshError::Allocation(format!(
                "session limit of {} reached",
                self.config.max_sessions
            ))
        })?;

        let id = self.next_session_id;
        self.next_session_id += 1;
        info!(session = id, peer = ?peer, "accepted connection");

        Ok(Session::new(id, stream, peer, shared, Some(permit)))
    }
}
