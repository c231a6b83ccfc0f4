//! Handler registration for listeners and sessions.
//!
//! Two independent registration points exist:
//!
//! - [`ListenerCallbacks`] - one [`IncomingConnectionHandler`] per listener,
//!   replaced by each new registration.
//! - [`SessionCallbacks`] - one [`MessageHandler`] per session, registered at
//!   most once.
//!
//! Handlers are shared through `Arc` between the registering code and the
//! component that invokes them, and live as long as their listener or
//! session. There is no unregister operation.
//!
//! # Example
//!
//! ```rust
//! use sshbind_proto::ssh::callbacks::{handler_fn, Disposition, SessionCallbacks};
//! use sshbind_proto::ssh::message::Message;
//!
//! let mut callbacks = SessionCallbacks::default();
//! callbacks
//!     .set_message_handler(handler_fn(|_info, message| match message {
//!         Message::Auth(_) => Ok(Disposition::Handled),
//!         _ => Ok(Disposition::Default),
//!     }))
//!     .unwrap();
//! assert!(callbacks.message_handler().is_some());
//! ```

use crate::ssh::message::Message;
use crate::ssh::session::{Session, SessionInfo};
use async_trait::async_trait;
use sshbind_platform::{SshError, SshResult};
use std::fmt;
use std::sync::Arc;

/// A handler's verdict on one message.
///
/// The integer codes follow the usual server-library convention: 0 means
/// handled, 2 means partial authentication success, anything else asks for
/// default handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Disposition {
    /// Accept the message (code 0).
    Handled,
    /// Fall back to default handling, which denies most requests (code 1).
    Default,
    /// Authentication step succeeded but more are required (code 2).
    Partial,
}

impl Disposition {
    /// Interprets an integer disposition code.
    ///
    /// ```rust
    /// use sshbind_proto::ssh::callbacks::Disposition;
    ///
    /// assert_eq!(Disposition::from_code(0), Disposition::Handled);
    /// assert_eq!(Disposition::from_code(2), Disposition::Partial);
    /// assert_eq!(Disposition::from_code(-1), Disposition::Default);
    /// ```
    pub fn from_code(code: i32) -> Self {
        match code {
            0 => Disposition::Handled,
            2 => Disposition::Partial,
            _ => Disposition::Default,
        }
    }

    /// Returns the integer code.
    pub fn code(&self) -> i32 {
        match self {
            Disposition::Handled => 0,
            Disposition::Default => 1,
            Disposition::Partial => 2,
        }
    }
}

impl From<i32> for Disposition {
    fn from(code: i32) -> Self {
        Disposition::from_code(code)
    }
}

/// Receives every message pumped through a session.
///
/// The message is only borrowed for the duration of the call. Returning an
/// error surfaces as [`SshError::Handler`] from the pump and leaves the
/// session untouched.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Decides how `message` should be answered.
    async fn on_message(&self, session: &SessionInfo, message: &Message)
        -> SshResult<Disposition>;
}

/// [`MessageHandler`] built from a synchronous closure, see [`handler_fn`].
pub struct FnHandler<F> {
    f: F,
}

impl<F> fmt::Debug for FnHandler<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnHandler").finish_non_exhaustive()
    }
}

#[async_trait]
impl<F> MessageHandler for FnHandler<F>
where
    F: Fn(&SessionInfo, &Message) -> SshResult<Disposition> + Send + Sync,
{
    async fn on_message(
        &self,
        session: &SessionInfo,
        message: &Message,
    ) -> SshResult<Disposition> {
        (self.f)(session, message)
    }
}

/// Wraps a synchronous closure as a shareable [`MessageHandler`].
pub fn handler_fn<F>(f: F) -> Arc<dyn MessageHandler>
where
    F: Fn(&SessionInfo, &Message) -> SshResult<Disposition> + Send + Sync + 'static,
{
    Arc::new(FnHandler { f })
}

/// Receives every session accepted by [`Listener::run`](crate::ssh::listener::Listener::run).
///
/// Ownership of the session passes to the handler, which typically spawns a
/// task that drives it.
pub trait IncomingConnectionHandler: Send + Sync {
    /// Takes over a freshly accepted session.
    fn on_incoming_connection(&self, session: Session);
}

impl<F> IncomingConnectionHandler for F
where
    F: Fn(Session) + Send + Sync,
{
    fn on_incoming_connection(&self, session: Session) {
        self(session)
    }
}

/// Listener-level registry.
#[derive(Clone, Default)]
pub struct ListenerCallbacks {
    incoming: Option<Arc<dyn IncomingConnectionHandler>>,
}

impl fmt::Debug for ListenerCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerCallbacks")
            .field("incoming", &self.incoming.is_some())
            .finish()
    }
}

impl ListenerCallbacks {
    /// Registers the incoming-connection handler, replacing any previous one.
    pub fn set_incoming_connection_handler(&mut self, handler: Arc<dyn IncomingConnectionHandler>) {
        self.incoming = Some(handler);
    }

    /// Returns the registered handler.
    pub fn incoming_connection_handler(&self) -> Option<Arc<dyn IncomingConnectionHandler>> {
        self.incoming.clone()
    }
}

/// Session-level registry.
#[derive(Clone, Default)]
pub struct SessionCallbacks {
    message: Option<Arc<dyn MessageHandler>>,
}

impl fmt::Debug for SessionCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionCallbacks")
            .field("message", &self.message.is_some())
            .finish()
    }
}

impl SessionCallbacks {
    /// Registers the message handler.
    ///
    /// # Errors
    ///
    /// Returns [`SshError::InvalidState`] if a handler is already registered.
    pub fn set_message_handler(&mut self, handler: Arc<dyn MessageHandler>) -> SshResult<()> {
        if self.message.is_some() {
            return Err(SshError::InvalidState(
                "a message handler is already registered for this session".to_string(),
            ));
        }
        self.message = Some(handler);
        Ok(())
    }

    /// Returns the registered handler.
    pub fn message_handler(&self) -> Option<&Arc<dyn MessageHandler>> {
        self.message.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::auth::AuthMethods;
    use crate::ssh::session::SessionState;

    fn info() -> SessionInfo {
        SessionInfo {
            id: 1,
            peer_addr: None,
            state: SessionState::AuthNegotiating,
            auth_methods: AuthMethods::PASSWORD,
            user: None,
            session_id: None,
        }
    }

    #[test]
    fn test_disposition_codes() {
        for disposition in [Disposition::Handled, Disposition::Default, Disposition::Partial] {
            assert_eq!(Disposition::from_code(disposition.code()), disposition);
        }
        assert_eq!(Disposition::from(1), Disposition::Default);
        assert_eq!(Disposition::from(42), Disposition::Default);
    }

    #[test]
    fn test_second_message_handler_rejected() {
        let mut callbacks = SessionCallbacks::default();
        callbacks
            .set_message_handler(handler_fn(|_, _| Ok(Disposition::Handled)))
            .unwrap();

        let err = callbacks
            .set_message_handler(handler_fn(|_, _| Ok(Disposition::Default)))
            .unwrap_err();
        assert!(matches!(err, SshError::InvalidState(_)));
    }

    #[tokio::test]
    async fn test_fn_handler_invocation() {
        let handler = handler_fn(|session, message| {
            assert_eq!(session.id, 1);
            match message {
                Message::Ignore { .. } => Err(SshError::Handler("unexpected".to_string())),
                _ => Ok(Disposition::Partial),
            }
        });

        let service = Message::ServiceRequest {
            service: "ssh-userauth".to_string(),
        };
        assert_eq!(
            handler.on_message(&info(), &service).await.unwrap(),
            Disposition::Partial
        );

        let ignore = Message::Ignore { data: vec![] };
        assert!(handler.on_message(&info(), &ignore).await.is_err());
    }

    #[test]
    fn test_incoming_handler_last_registration_wins() {
        let mut callbacks = ListenerCallbacks::default();
        assert!(callbacks.incoming_connection_handler().is_none());

        let first: Arc<dyn IncomingConnectionHandler> = Arc::new(|_session: Session| {});
        let second: Arc<dyn IncomingConnectionHandler> = Arc::new(|_session: Session| {});
        callbacks.set_incoming_connection_handler(first.clone());
        callbacks.set_incoming_connection_handler(second.clone());

        let current = callbacks.incoming_connection_handler().unwrap();
        assert!(Arc::ptr_eq(&current, &second));
        assert!(!Arc::ptr_eq(&current, &first));
    }
}
