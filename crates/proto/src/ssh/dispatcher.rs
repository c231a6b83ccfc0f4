//! Message dispatcher.
//!
//! Hands one decoded message to the session's handler and applies the
//! returned [`Disposition`]: protocol replies are sent and the session state
//! is updated. Some messages never reach the handler:
//!
//! - authentication requests once the session is authenticated (ignored)
//! - authentication requests for a method that is not advertised (failure)
//! - connection protocol messages before authentication (default handling)
//!
//! A handler error is reported as [`SshError::Handler`] and nothing else
//! happens: no reply is sent and the session state is unchanged.

use crate::ssh::auth::{AuthMethod, AuthRequest};
use crate::ssh::callbacks::{Disposition, MessageHandler, SessionCallbacks};
use crate::ssh::decoder::WireDecoder;
use crate::ssh::message::{
    disconnect_reason, ChannelOpen, ChannelRequest, Message, Reply,
    OPEN_ADMINISTRATIVELY_PROHIBITED,
};
use crate::ssh::session::{SessionCore, SessionState};
use crate::ssh::transport::Transport;
use sshbind_platform::{SshError, SshResult};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Initial window offered for channels opened by the handler.
pub const CHANNEL_WINDOW_SIZE: u32 = 2 * 1024 * 1024;

/// Maximum packet size offered for channels opened by the handler.
pub const CHANNEL_MAX_PACKET: u32 = 32 * 1024;

/// Routes messages of one session to its registered handler.
pub struct MessageDispatcher {
    decoder: Arc<dyn WireDecoder>,
    callbacks: SessionCallbacks,
}

impl fmt::Debug for MessageDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageDispatcher")
            .field("callbacks", &self.callbacks)
            .finish_non_exhaustive()
    }
}

impl MessageDispatcher {
    /// Creates a dispatcher with no handler registered.
    pub fn new(decoder: Arc<dyn WireDecoder>) -> Self {
        Self {
            decoder,
            callbacks: SessionCallbacks::default(),
        }
    }

    /// Returns the decoder used for inbound messages and replies.
    pub fn decoder(&self) -> &Arc<dyn WireDecoder> {
        &self.decoder
    }

    /// Registers the message handler (once per session).
    pub fn set_message_handler(&mut self, handler: Arc<dyn MessageHandler>) -> SshResult<()> {
        self.callbacks.set_message_handler(handler)
    }

    /// Dispatches one message received as packet number `sequence`.
    pub(crate) async fn dispatch(
        &self,
        core: &mut SessionCore,
        transport: &mut Transport,
        message: Message,
        sequence: u32,
    ) -> SshResult<()> {
        match self.preempt(core, &message) {
            Some(Preempt::Ignore) => return Ok(()),
            Some(Preempt::Deny) => {
                return self
                    .apply(core, transport, &message, Disposition::Default, sequence)
                    .await;
            }
            None => {}
        }

        let disposition = match self.callbacks.message_handler() {
            Some(handler) => {
                let info = core.info();
                handler
                    .on_message(&info, &message)
                    .await
                    .map_err(|err| match err {
                        SshError::Handler(msg) => SshError::Handler(msg),
                        other => SshError::Handler(other.to_string()),
                    })?
            }
            None => Disposition::Default,
        };

        trace!(
            session = core.id,
            msg_type = message.msg_type(),
            disposition = disposition.code(),
            "handler returned"
        );

        self.apply(core, transport, &message, disposition, sequence)
            .await
    }

    fn preempt(&self, core: &SessionCore, message: &Message) -> Option<Preempt> {
        let authenticated = core.state == SessionState::Authenticated;

        match message {
            Message::Auth(_) if authenticated => {
                debug!(session = core.id, "ignoring auth request on authenticated session");
                Some(Preempt::Ignore)
            }
            Message::Auth(request) if !core.auth_methods.contains(request.method().flag()) => {
                debug!(
                    session = core.id,
                    method = request.method().name(),
                    "auth method not advertised"
                );
                Some(Preempt::Deny)
            }
            _ if !authenticated && message.msg_type() >= 80 => {
                debug!(
                    session = core.id,
                    msg_type = message.msg_type(),
                    "connection protocol message before authentication"
                );
                Some(Preempt::Deny)
            }
            _ => None,
        }
    }

    async fn apply(
        &self,
        core: &mut SessionCore,
        transport: &mut Transport,
        message: &Message,
        disposition: Disposition,
        sequence: u32,
    ) -> SshResult<()> {
        let handled = disposition == Disposition::Handled;

        match message {
            Message::ServiceRequest { service } => {
                if handled || service == "ssh-userauth" {
                    let reply = Reply::ServiceAccept {
                        service: service.clone(),
                    };
                    self.send(core, transport, &reply).await?;
                } else {
                    self.disconnect(
                        core,
                        transport,
                        disconnect_reason::SERVICE_NOT_AVAILABLE,
                        &format!("service '{}' not available", service),
                    )
                    .await?;
                }
            }
            Message::Auth(request) => {
                self.apply_auth(core, transport, request, disposition).await?;
            }
            Message::ChannelOpen(open) => {
                self.apply_channel_open(core, transport, open, handled)
                    .await?
            }
            Message::ChannelRequest(request) => {
                self.apply_channel_request(core, transport, request, handled)
                    .await?
            }
            Message::ChannelClose { recipient_channel } => {
                if let Some(client_channel) = core.channels.remove(recipient_channel) {
                    let reply = Reply::ChannelClose {
                        recipient_channel: client_channel,
                    };
                    self.send(core, transport, &reply).await?;
                }
            }
            Message::GlobalRequest { want_reply, .. } => {
                if *want_reply {
                    let reply = if handled {
                        Reply::RequestSuccess
                    } else {
                        Reply::RequestFailure
                    };
                    self.send(core, transport, &reply).await?;
                }
            }
            Message::Disconnect {
                reason,
                description,
            } => {
                debug!(session = core.id, reason, %description, "peer disconnected");
                core.transition(SessionState::Closed);
            }
            Message::Other { msg_type, .. } => {
                if !handled && message.message_type().is_none() {
                    debug!(session = core.id, msg_type, sequence, "unimplemented message");
                    self.send(core, transport, &Reply::Unimplemented { sequence })
                        .await?;
                }
            }
            Message::Ignore { .. } | Message::Debug { .. } => {}
        }

        Ok(())
    }

    async fn apply_auth(
        &self,
        core: &mut SessionCore,
        transport: &mut Transport,
        request: &AuthRequest,
        disposition: Disposition,
    ) -> SshResult<()> {
        if let Some(banner) = core.banner.take() {
            self.send(core, transport, &Reply::AuthBanner { message: banner })
                .await?;
        }

        match disposition {
            Disposition::Handled => {
                self.send(core, transport, &Reply::AuthSuccess).await?;
                core.user = Some(request.user_name().to_string());
                core.transition(SessionState::Authenticated);
                debug!(
                    session = core.id,
                    user = request.user_name(),
                    method = request.method().name(),
                    "authenticated"
                );
            }
            Disposition::Partial => {
                let reply = Reply::AuthFailure {
                    methods: core.auth_methods.names(),
                    partial_success: true,
                };
                self.send(core, transport, &reply).await?;
            }
            Disposition::Default => {
                let reply = Reply::AuthFailure {
                    methods: core.auth_methods.names(),
                    partial_success: false,
                };
                self.send(core, transport, &reply).await?;

                if *request.method() != AuthMethod::None {
                    core.auth_attempts += 1;
                    if core.auth_attempts >= core.max_auth_attempts {
                        warn!(
                            session = core.id,
                            attempts = core.auth_attempts,
                            "too many authentication failures"
                        );
                        self.disconnect(
                            core,
                            transport,
                            disconnect_reason::NO_MORE_AUTH_METHODS_AVAILABLE,
                            "too many authentication failures",
                        )
                        .await?;
                    }
                }
            }
        }

        Ok(())
    }

    async fn apply_channel_open(
        &self,
        core: &mut SessionCore,
        transport: &mut Transport,
        open: &ChannelOpen,
        handled: bool,
    ) -> SshResult<()> {
        let reply = if handled {
            let local_channel = core.next_channel_id;
            core.next_channel_id = core.next_channel_id.wrapping_add(1);
            core.channels.insert(local_channel, open.sender_channel);
            debug!(
                session = core.id,
                channel = local_channel,
                channel_type = %open.channel_type,
                "channel opened"
            );

            Reply::ChannelOpenConfirmation {
                recipient_channel: open.sender_channel,
                sender_channel: local_channel,
                initial_window_size: CHANNEL_WINDOW_SIZE,
                maximum_packet_size: CHANNEL_MAX_PACKET,
            }
        } else {
            Reply::ChannelOpenFailure {
                recipient_channel: open.sender_channel,
                reason: OPEN_ADMINISTRATIVELY_PROHIBITED,
                description: format!("channel type '{}' refused", open.channel_type),
            }
        };

        self.send(core, transport, &reply).await
    }

    async fn apply_channel_request(
        &self,
        core: &mut SessionCore,
        transport: &mut Transport,
        request: &ChannelRequest,
        handled: bool,
    ) -> SshResult<()> {
        if !request.want_reply {
            return Ok(());
        }

        // Unknown channels can only be answered with the number the client used.
        let (recipient_channel, known) = match core.channels.get(&request.recipient_channel) {
            Some(client_channel) => (*client_channel, true),
            None => (request.recipient_channel, false),
        };

        let reply = if handled && known {
            Reply::ChannelSuccess { recipient_channel }
        } else {
            Reply::ChannelFailure { recipient_channel }
        };

        self.send(core, transport, &reply).await
    }

    async fn disconnect(
        &self,
        core: &mut SessionCore,
        transport: &mut Transport,
        reason: u32,
        description: &str,
    ) -> SshResult<()> {
        let reply = Reply::Disconnect {
            reason,
            description: description.to_string(),
        };
        self.send(core, transport, &reply).await?;
        core.transition(SessionState::Closed);
        Ok(())
    }

    async fn send(
        &self,
        core: &mut SessionCore,
        transport: &mut Transport,
        reply: &Reply,
    ) -> SshResult<()> {
        let payload = match self.decoder.encode(reply) {
            Ok(payload) => payload,
            Err(err) => {
                core.transition(SessionState::Failed);
                return Err(SshError::Dispatch(format!(
                    "Failed to encode {}: {}",
                    reply.message_type(),
                    err.message()
                )));
            }
        };

        trace!(session = core.id, reply = %reply.message_type(), "sending reply");

        if let Err(err) = transport.send_payload(payload).await {
            core.transition(SessionState::Failed);
            return Err(SshError::Dispatch(format!(
                "Failed to send {}: {}",
                reply.message_type(),
                err
            )));
        }

        Ok(())
    }
}

enum Preempt {
    Ignore,
    Deny,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::auth::AuthMethods;
    use crate::ssh::callbacks::handler_fn;
    use crate::ssh::decoder::StandardDecoder;
    use crate::ssh::options::LogVerbosity;
    use crate::ssh::wire::WireReader;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn core(state: SessionState) -> SessionCore {
        let mut core = SessionCore::new(1, None, AuthMethods::PASSWORD, 3, LogVerbosity::NoLog);
        core.state = state;
        core
    }

    fn pair() -> (Transport, Transport) {
        let (server, client) = tokio::io::duplex(64 * 1024);
        (
            Transport::new(Box::new(server), None),
            Transport::new(Box::new(client), None),
        )
    }

    fn dispatcher_returning(
        disposition: Disposition,
        calls: Arc<AtomicUsize>,
    ) -> MessageDispatcher {
        let mut dispatcher = MessageDispatcher::new(Arc::new(StandardDecoder));
        dispatcher
            .set_message_handler(handler_fn(move |_, _| {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(disposition)
            }))
            .unwrap();
        dispatcher
    }

    fn password(user: &str) -> Message {
        Message::Auth(AuthRequest::new(
            user,
            "ssh-connection",
            AuthMethod::Password("pw".to_string()),
        ))
    }

    async fn next_type(client: &mut Transport) -> u8 {
        client.recv_payload().await.unwrap().unwrap()[0]
    }

    #[tokio::test]
    async fn test_auth_handled() {
        let calls = Arc::new(AtomicUsize::new(0));
        let dispatcher = dispatcher_returning(Disposition::Handled, calls.clone());
        let mut core = core(SessionState::AuthNegotiating);
        core.banner = Some("welcome".to_string());
        let (mut server, mut client) = pair();

        dispatcher
            .dispatch(&mut core, &mut server, password("alice"), 3)
            .await
            .unwrap();

        assert_eq!(core.state, SessionState::Authenticated);
        assert_eq!(core.user.as_deref(), Some("alice"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(next_type(&mut client).await, 53); // banner first
        assert_eq!(next_type(&mut client).await, 52);
    }

    #[tokio::test]
    async fn test_auth_default_and_partial() {
        let calls = Arc::new(AtomicUsize::new(0));
        let dispatcher = dispatcher_returning(Disposition::Partial, calls.clone());
        let mut core = core(SessionState::AuthNegotiating);
        core.auth_methods = AuthMethods::PASSWORD | AuthMethods::PUBLICKEY;
        let (mut server, mut client) = pair();

        dispatcher
            .dispatch(&mut core, &mut server, password("bob"), 3)
            .await
            .unwrap();

        let payload = client.recv_payload().await.unwrap().unwrap();
        let mut reader = WireReader::new(&payload);
        assert_eq!(reader.read_u8().unwrap(), 51);
        assert_eq!(reader.read_name_list().unwrap(), vec!["publickey", "password"]);
        assert!(reader.read_bool().unwrap());
        assert_eq!(core.state, SessionState::AuthNegotiating);
        assert_eq!(core.auth_attempts, 0);
    }

    #[tokio::test]
    async fn test_auth_method_not_advertised_skips_handler() {
        let calls = Arc::new(AtomicUsize::new(0));
        let dispatcher = dispatcher_returning(Disposition::Handled, calls.clone());
        let mut core = core(SessionState::AuthNegotiating);
        let (mut server, mut client) = pair();

        let none = Message::Auth(AuthRequest::new("carol", "ssh-connection", AuthMethod::None));
        dispatcher
            .dispatch(&mut core, &mut server, none, 3)
            .await
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(next_type(&mut client).await, 51);
        assert_eq!(core.auth_attempts, 0);
        assert_eq!(core.state, SessionState::AuthNegotiating);
    }

    #[tokio::test]
    async fn test_auth_attempts_exhausted() {
        let calls = Arc::new(AtomicUsize::new(0));
        let dispatcher = dispatcher_returning(Disposition::Default, calls);
        let mut core = core(SessionState::AuthNegotiating);
        let (mut server, mut client) = pair();

        for _ in 0..3 {
            dispatcher
                .dispatch(&mut core, &mut server, password("dave"), 3)
                .await
                .unwrap();
        }

        assert_eq!(core.state, SessionState::Closed);
        for _ in 0..3 {
            assert_eq!(next_type(&mut client).await, 51);
        }
        assert_eq!(next_type(&mut client).await, 1);
    }

    #[tokio::test]
    async fn test_auth_after_authenticated_ignored() {
        let calls = Arc::new(AtomicUsize::new(0));
        let dispatcher = dispatcher_returning(Disposition::Default, calls.clone());
        let mut core = core(SessionState::Authenticated);
        let (mut server, _client) = pair();

        dispatcher
            .dispatch(&mut core, &mut server, password("erin"), 3)
            .await
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(core.state, SessionState::Authenticated);
        assert_eq!(server.outgoing_sequence(), 0);
    }

    #[tokio::test]
    async fn test_handler_error_changes_nothing() {
        let mut dispatcher = MessageDispatcher::new(Arc::new(StandardDecoder));
        dispatcher
            .set_message_handler(handler_fn(|_, _| {
                Err(SshError::Dispatch("database unavailable".to_string()))
            }))
            .unwrap();
        let mut core = core(SessionState::AuthNegotiating);
        let (mut server, _client) = pair();

        let err = dispatcher
            .dispatch(&mut core, &mut server, password("frank"), 3)
            .await
            .unwrap_err();

        assert!(matches!(err, SshError::Handler(_)));
        assert_eq!(core.state, SessionState::AuthNegotiating);
        assert_eq!(core.auth_attempts, 0);
        assert_eq!(server.outgoing_sequence(), 0);
    }

    #[tokio::test]
    async fn test_channel_open_before_auth_denied() {
        let calls = Arc::new(AtomicUsize::new(0));
        let dispatcher = dispatcher_returning(Disposition::Handled, calls.clone());
        let mut core = core(SessionState::AuthNegotiating);
        let (mut server, mut client) = pair();

        let open = Message::ChannelOpen(ChannelOpen {
            channel_type: "session".to_string(),
            sender_channel: 5,
            initial_window_size: 1024,
            maximum_packet_size: 1024,
            type_data: vec![],
        });
        dispatcher
            .dispatch(&mut core, &mut server, open, 4)
            .await
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(next_type(&mut client).await, 92);
        assert!(core.channels.is_empty());
    }

    #[tokio::test]
    async fn test_channel_lifecycle() {
        let calls = Arc::new(AtomicUsize::new(0));
        let dispatcher = dispatcher_returning(Disposition::Handled, calls);
        let mut core = core(SessionState::Authenticated);
        let (mut server, mut client) = pair();

        let open = Message::ChannelOpen(ChannelOpen {
            channel_type: "session".to_string(),
            sender_channel: 5,
            initial_window_size: 1024,
            maximum_packet_size: 1024,
            type_data: vec![],
        });
        dispatcher.dispatch(&mut core, &mut server, open, 4).await.unwrap();

        let confirmation = client.recv_payload().await.unwrap().unwrap();
        let mut reader = WireReader::new(&confirmation);
        assert_eq!(reader.read_u8().unwrap(), 91);
        assert_eq!(reader.read_u32().unwrap(), 5);
        let local = reader.read_u32().unwrap();
        assert_eq!(reader.read_u32().unwrap(), CHANNEL_WINDOW_SIZE);
        assert_eq!(reader.read_u32().unwrap(), CHANNEL_MAX_PACKET);

        let request = Message::ChannelRequest(ChannelRequest {
            recipient_channel: local,
            request_type: "exec".to_string(),
            want_reply: true,
            type_data: vec![],
        });
        dispatcher.dispatch(&mut core, &mut server, request, 5).await.unwrap();
        assert_eq!(next_type(&mut client).await, 99);

        let close = Message::ChannelClose {
            recipient_channel: local,
        };
        dispatcher.dispatch(&mut core, &mut server, close, 6).await.unwrap();
        let echoed = client.recv_payload().await.unwrap().unwrap();
        assert_eq!(&echoed[..], &[97, 0, 0, 0, 5]);
        assert!(core.channels.is_empty());
    }

    #[tokio::test]
    async fn test_service_request_default() {
        let dispatcher = MessageDispatcher::new(Arc::new(StandardDecoder));
        let mut core = core(SessionState::AuthNegotiating);
        let (mut server, mut client) = pair();

        let userauth = Message::ServiceRequest {
            service: "ssh-userauth".to_string(),
        };
        dispatcher.dispatch(&mut core, &mut server, userauth, 3).await.unwrap();
        assert_eq!(next_type(&mut client).await, 6);

        let other = Message::ServiceRequest {
            service: "ssh-telepathy".to_string(),
        };
        dispatcher.dispatch(&mut core, &mut server, other, 4).await.unwrap();
        assert_eq!(next_type(&mut client).await, 1);
        assert_eq!(core.state, SessionState::Closed);
    }

    #[tokio::test]
    async fn test_unknown_message_unimplemented() {
        let dispatcher = MessageDispatcher::new(Arc::new(StandardDecoder));
        let mut core = core(SessionState::AuthNegotiating);
        let (mut server, mut client) = pair();

        let unknown = Message::Other {
            msg_type: 42,
            payload: vec![42],
        };
        dispatcher.dispatch(&mut core, &mut server, unknown, 9).await.unwrap();

        let payload = client.recv_payload().await.unwrap().unwrap();
        assert_eq!(&payload[..], &[3, 0, 0, 0, 9]);
    }

    #[tokio::test]
    async fn test_send_failure_fails_session() {
        let dispatcher = MessageDispatcher::new(Arc::new(StandardDecoder));
        let mut core = core(SessionState::AuthNegotiating);
        let (mut server, client) = pair();
        drop(client);

        let request = Message::ServiceRequest {
            service: "ssh-userauth".to_string(),
        };
        let err = dispatcher
            .dispatch(&mut core, &mut server, request, 3)
            .await
            .unwrap_err();

        assert!(matches!(err, SshError::Dispatch(_)));
        assert_eq!(core.state, SessionState::Failed);
    }
}
