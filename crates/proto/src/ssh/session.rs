//! Server-side session state machine.
//!
//! A [`Session`] is created by the listener for each accepted connection and
//! owns that connection exclusively. The caller drives it:
//!
//! ```text
//! Created --handle_key_exchange--> KeyExchanged --set_auth_methods / pump--> AuthNegotiating
//!     --auth accepted--> Authenticated --disconnect / close--> Closed
//! ```
//!
//! `Failed` is reachable from every state through a key exchange or dispatch
//! error; a failed session rejects every further operation except
//! [`Session::close`].
//!
//! # Example
//!
//! ```rust,no_run
//! use sshbind_proto::ssh::{AuthMethods, Session};
//! use sshbind_platform::SshResult;
//!
//! async fn serve(mut session: Session) -> SshResult<()> {
//!     session.handle_key_exchange().await?;
//!     session.set_auth_methods(AuthMethods::PASSWORD)?;
//!     while session.is_open() {
//!         session.execute_message_callbacks(None).await?;
//!     }
//!     Ok(())
//! }
//! ```

use crate::ssh::auth::AuthMethods;
use crate::ssh::callbacks::MessageHandler;
use crate::ssh::dispatcher::MessageDispatcher;
use crate::ssh::kex::{KexContext, KexOutcome};
use crate::ssh::listener::ListenerShared;
use crate::ssh::message::{disconnect_reason, Reply};
use crate::ssh::options::LogVerbosity;
use crate::ssh::transport::{AsyncStream, Transport};
use crate::ssh::version::{self, Version};
use sshbind_platform::{SshError, SshResult};
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OwnedSemaphorePermit;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Upper bound for the DISCONNECT and shutdown writes of a closing session.
const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// Session lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// Accepted, key exchange not yet performed.
    Created,
    /// Key exchange completed.
    KeyExchanged,
    /// Authentication in progress.
    AuthNegotiating,
    /// Client authenticated.
    Authenticated,
    /// Closed by either side.
    Closed,
    /// Unusable after a fatal error.
    Failed,
}

impl SessionState {
    /// Whether no further protocol work is possible.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Closed | SessionState::Failed)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Created => "Created",
            SessionState::KeyExchanged => "KeyExchanged",
            SessionState::AuthNegotiating => "AuthNegotiating",
            SessionState::Authenticated => "Authenticated",
            SessionState::Closed => "Closed",
            SessionState::Failed => "Failed",
        };
        f.write_str(name)
    }
}

/// Snapshot of a session, handed to message handlers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    /// Listener-unique session number.
    pub id: u64,
    /// Remote address, if known.
    pub peer_addr: Option<SocketAddr>,
    /// Current state.
    pub state: SessionState,
    /// Methods currently advertised.
    pub auth_methods: AuthMethods,
    /// Authenticated user name.
    pub user: Option<String>,
    /// Session identifier from the key exchange.
    pub session_id: Option<Vec<u8>>,
}

/// Protocol state shared between the session and its dispatcher.
#[derive(Debug)]
pub(crate) struct SessionCore {
    pub(crate) id: u64,
    pub(crate) peer: Option<SocketAddr>,
    pub(crate) state: SessionState,
    pub(crate) auth_methods: AuthMethods,
    pub(crate) user: Option<String>,
    /// Banner still to be sent before the first auth reply.
    pub(crate) banner: Option<String>,
    pub(crate) auth_attempts: u32,
    pub(crate) max_auth_attempts: u32,
    /// Local channel number -> client channel number.
    pub(crate) channels: HashMap<u32, u32>,
    pub(crate) next_channel_id: u32,
    pub(crate) session_id: Option<Vec<u8>>,
    pub(crate) verbosity: LogVerbosity,
}

impl SessionCore {
    pub(crate) fn new(
        id: u64,
        peer: Option<SocketAddr>,
        auth_methods: AuthMethods,
        max_auth_attempts: u32,
        verbosity: LogVerbosity,
    ) -> Self {
        Self {
            id,
            peer,
            state: SessionState::Created,
            auth_methods,
            user: None,
            banner: None,
            auth_attempts: 0,
            max_auth_attempts,
            channels: HashMap::new(),
            next_channel_id: 0,
            session_id: None,
            verbosity,
        }
    }

    pub(crate) fn info(&self) -> SessionInfo {
        SessionInfo {
            id: self.id,
            peer_addr: self.peer,
            state: self.state,
            auth_methods: self.auth_methods,
            user: self.user.clone(),
            session_id: self.session_id.clone(),
        }
    }

    pub(crate) fn transition(&mut self, to: SessionState) {
        if self.state == to {
            return;
        }
        if self.verbosity >= LogVerbosity::Protocol {
            debug!(session = self.id, from = %self.state, to = %to, "session state");
        }
        self.state = to;
    }
}

/// Closes a session from another task.
///
/// A pump call blocked on the session returns [`SshError::Dispatch`]
/// promptly after [`SessionCloser::close`].
#[derive(Debug, Clone)]
pub struct SessionCloser {
    token: CancellationToken,
}

impl SessionCloser {
    /// Requests the session to close.
    pub fn close(&self) {
        self.token.cancel();
    }

    /// Whether close has been requested.
    pub fn is_closed(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// One client connection.
pub struct Session {
    core: SessionCore,
    transport: Transport,
    dispatcher: MessageDispatcher,
    shared: Arc<ListenerShared>,
    cancel: CancellationToken,
    strict_auth_methods: bool,
    client_version: Option<Version>,
    kex: Option<KexOutcome>,
    permit: Option<OwnedSemaphorePermit>,
    shut_down: bool,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.core.id)
            .field("peer", &self.core.peer)
            .field("state", &self.core.state)
            .field("auth_methods", &self.core.auth_methods)
            .finish_non_exhaustive()
    }
}

impl Session {
    pub(crate) fn new(
        id: u64,
        stream: Box<dyn AsyncStream>,
        peer: Option<SocketAddr>,
        shared: Arc<ListenerShared>,
        permit: Option<OwnedSemaphorePermit>,
    ) -> Self {
        let mut core = SessionCore::new(
            id,
            peer,
            shared.session.default_auth_methods,
            shared.session.max_auth_attempts,
            shared.verbosity,
        );
        core.banner = shared.banner.clone();

        Self {
            core,
            transport: Transport::new(stream, peer),
            dispatcher: MessageDispatcher::new(Arc::clone(&shared.decoder)),
            strict_auth_methods: shared.session.strict_auth_methods,
            shared,
            cancel: CancellationToken::new(),
            client_version: None,
            kex: None,
            permit,
            shut_down: false,
        }
    }

    /// Listener-unique session number.
    pub fn id(&self) -> u64 {
        self.core.id
    }

    /// Current state.
    pub fn state(&self) -> SessionState {
        self.core.state
    }

    /// Whether the session can still make progress.
    pub fn is_open(&self) -> bool {
        !self.core.state.is_terminal() && !self.cancel.is_cancelled()
    }

    /// Remote address, if known.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.core.peer
    }

    /// Methods currently advertised.
    pub fn auth_methods(&self) -> AuthMethods {
        self.core.auth_methods
    }

    /// Authenticated user name.
    pub fn user(&self) -> Option<&str> {
        self.core.user.as_deref()
    }

    /// Identification string sent by the client.
    pub fn client_version(&self) -> Option<&Version> {
        self.client_version.as_ref()
    }

    /// Outcome of the key exchange.
    pub fn kex_outcome(&self) -> Option<&KexOutcome> {
        self.kex.as_ref()
    }

    /// Snapshot of the session.
    pub fn info(&self) -> SessionInfo {
        self.core.info()
    }

    /// Returns a handle that closes this session from any task.
    pub fn closer(&self) -> SessionCloser {
        SessionCloser {
            token: self.cancel.clone(),
        }
    }

    fn fail(&mut self) {
        self.core.transition(SessionState::Failed);
        self.permit.take();
    }

    /// Performs the identification exchange and the key exchange.
    ///
    /// # Errors
    ///
    /// - [`SshError::InvalidState`] unless the session is in `Created`
    /// - [`SshError::KeyExchange`] if either exchange fails; the session is
    ///   then `Failed`
    pub async fn handle_key_exchange(&mut self) -> SshResult<()> {
        if self.core.state != SessionState::Created {
            return Err(SshError::InvalidState(format!(
                "key exchange requires state Created, session is {}",
                self.core.state
            )));
        }

        let cancel = self.cancel.clone();
        let shared = Arc::clone(&self.shared);
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            result = run_key_exchange(&mut self.transport, &shared) => Some(result),
        };

        match result {
            None => {
                self.finish_close().await;
                Err(SshError::KeyExchange(
                    "session closed during key exchange".to_string(),
                ))
            }
            Some(Ok((client_version, outcome))) => {
                info!(
                    session = self.core.id,
                    peer = ?self.core.peer,
                    client = %client_version,
                    kex = %outcome.kex_algorithm,
                    host_key = %outcome.host_key_algorithm,
                    "key exchange complete"
                );
                self.core.session_id = Some(outcome.session_id.clone());
                self.client_version = Some(client_version);
                self.kex = Some(outcome);
                self.core.transition(SessionState::KeyExchanged);
                Ok(())
            }
            Some(Err(err)) => {
                warn!(session = self.core.id, error = %err, "key exchange failed");
                self.fail();
                Err(match err {
                    SshError::KeyExchange(msg) => SshError::KeyExchange(msg),
                    other => SshError::KeyExchange(other.to_string()),
                })
            }
        }
    }

    /// Declares the authentication methods to advertise and accept.
    ///
    /// May be called before or after the key exchange; after it the session
    /// moves to `AuthNegotiating`.
    ///
    /// # Errors
    ///
    /// [`SshError::InvalidState`] on a closed or failed session, and on an
    /// authenticated one when `strict_auth_methods` is set (otherwise the
    /// call is ignored).
    pub fn set_auth_methods(&mut self, methods: AuthMethods) -> SshResult<()> {
        match self.core.state {
            SessionState::Created | SessionState::AuthNegotiating => {
                self.core.auth_methods = methods;
                Ok(())
            }
            SessionState::KeyExchanged => {
                self.core.auth_methods = methods;
                self.core.transition(SessionState::AuthNegotiating);
                Ok(())
            }
            SessionState::Authenticated if !self.strict_auth_methods => {
                debug!(session = self.core.id, "auth methods unchanged after authentication");
                Ok(())
            }
            state => Err(SshError::InvalidState(format!(
                "cannot change auth methods in state {}",
                state
            ))),
        }
    }

    /// Registers the handler for every pumped message.
    ///
    /// # Errors
    ///
    /// [`SshError::InvalidState`] if a handler is already registered or the
    /// session is closed or failed.
    pub fn set_message_handler(&mut self, handler: Arc<dyn MessageHandler>) -> SshResult<()> {
        if self.core.state.is_terminal() {
            return Err(SshError::InvalidState(format!(
                "cannot register a handler in state {}",
                self.core.state
            )));
        }
        self.dispatcher.set_message_handler(handler)
    }

    /// Receives one message and runs it through the handler.
    ///
    /// Waits until a message arrives, the optional `deadline` expires or the
    /// session is closed through a [`SessionCloser`].
    ///
    /// # Errors
    ///
    /// - [`SshError::InvalidState`] before the key exchange or on a closed
    ///   or failed session; nothing else happens
    /// - [`SshError::Timeout`] when the deadline expires; the session stays
    ///   usable
    /// - [`SshError::Dispatch`] on close, transport failure or an undecodable
    ///   message; the session is then `Closed` or `Failed`
    /// - [`SshError::Handler`] when the handler fails; the session is
    ///   unchanged
    pub async fn execute_message_callbacks(&mut self, deadline: Option<Duration>) -> SshResult<()> {
        match self.core.state {
            SessionState::Created => {
                return Err(SshError::InvalidState(
                    "key exchange has not been performed".to_string(),
                ))
            }
            state if state.is_terminal() => {
                return Err(SshError::InvalidState(format!(
                    "session is {}",
                    state
                )))
            }
            _ => {}
        }

        if self.cancel.is_cancelled() {
            self.finish_close().await;
            return Err(SshError::Dispatch("session closed".to_string()));
        }

        if self.core.state == SessionState::KeyExchanged {
            self.core.transition(SessionState::AuthNegotiating);
        }

        let cancel = self.cancel.clone();
        let received = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            received = recv_with_deadline(&mut self.transport, deadline) => Some(received),
        };

        let payload = match received {
            None => {
                self.finish_close().await;
                return Err(SshError::Dispatch("session closed".to_string()));
            }
            Some(Err(_elapsed)) => {
                return Err(SshError::Timeout(format!(
                    "no message within {:?}",
                    deadline.unwrap_or_default()
                )));
            }
            Some(Ok(Ok(Some(payload)))) => payload,
            Some(Ok(Ok(None))) => {
                self.fail();
                return Err(SshError::Dispatch(
                    "connection closed by peer".to_string(),
                ));
            }
            Some(Ok(Err(err))) => {
                self.fail();
                return Err(SshError::Dispatch(format!("transport error: {}", err)));
            }
        };

        let sequence = self.transport.incoming_sequence();
        if self.core.verbosity >= LogVerbosity::Packet {
            trace!(
                session = self.core.id,
                sequence,
                payload = %hex::encode(&payload),
                "received packet"
            );
        }

        let message = match self.dispatcher.decoder().decode(&payload) {
            Ok(message) => message,
            Err(err) => {
                self.fail();
                return Err(SshError::Dispatch(format!(
                    "undecodable message: {}",
                    err.message()
                )));
            }
        };

        let dispatch = self
            .dispatcher
            .dispatch(&mut self.core, &mut self.transport, message, sequence);
        let dispatched = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            result = dispatch => Some(result),
        };
        let result = match dispatched {
            Some(result) => result,
            None => {
                debug!(session = self.core.id, "closed while dispatching");
                self.finish_close().await;
                return Err(SshError::Dispatch("session closed".to_string()));
            }
        };

        match self.core.state {
            SessionState::Closed => self.finish_close().await,
            SessionState::Failed => {
                self.permit.take();
            }
            _ => {}
        }

        result
    }

    /// Closes the session.
    ///
    /// Sends a best-effort DISCONNECT once the key exchange is done and shuts
    /// the connection down. A peer that stops reading delays this by at most
    /// one second. Calling it again does nothing.
    pub async fn close(&mut self) {
        if matches!(
            self.core.state,
            SessionState::KeyExchanged | SessionState::AuthNegotiating | SessionState::Authenticated
        ) {
            let reply = Reply::Disconnect {
                reason: disconnect_reason::BY_APPLICATION,
                description: "closed by server".to_string(),
            };
            if let Ok(payload) = self.dispatcher.decoder().encode(&reply) {
                match tokio::time::timeout(CLOSE_GRACE, self.transport.send_payload(payload)).await
                {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => {
                        debug!(session = self.core.id, error = %err, "disconnect not delivered")
                    }
                    Err(_) => debug!(session = self.core.id, "disconnect write timed out"),
                }
            }
        }

        self.cancel.cancel();
        self.finish_close().await;
    }

    async fn finish_close(&mut self) {
        if self.shut_down {
            return;
        }
        self.shut_down = true;
        if self.core.state != SessionState::Failed {
            self.core.transition(SessionState::Closed);
        }
        match tokio::time::timeout(CLOSE_GRACE, self.transport.shutdown()).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => trace!(session = self.core.id, error = %err, "shutdown after close"),
            Err(_) => trace!(session = self.core.id, "shutdown after close timed out"),
        }
        self.permit.take();
        debug!(session = self.core.id, "session closed");
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run_key_exchange(
    transport: &mut Transport,
    shared: &ListenerShared,
) -> SshResult<(Version, KexOutcome)> {
    let client_version = version::exchange(transport.stream_mut(), &shared.server_version).await?;

    let context = KexContext {
        host_keys: &shared.host_keys,
        client_version: &client_version,
        server_version: &shared.server_version,
    };
    let outcome = shared.key_exchanger.exchange(transport, &context).await?;

    Ok((client_version, outcome))
}

async fn recv_with_deadline(
    transport: &mut Transport,
    deadline: Option<Duration>,
) -> Result<std::io::Result<Option<bytes::Bytes>>, tokio::time::error::Elapsed> {
    match deadline {
        Some(deadline) => tokio::time::timeout(deadline, transport.recv_payload()).await,
        None => Ok(transport.recv_payload().await),
    }
}
