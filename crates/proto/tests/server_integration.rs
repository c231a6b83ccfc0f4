//! End-to-end tests for the server engine.
//!
//! A minimal client (identification line, KEXINIT, then plain payloads)
//! talks to a real listener over TCP. The key exchange is stubbed: it
//! negotiates KEXINIT and, in one variant, installs a toy XOR protection
//! after NEWKEYS.

use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
use sshbind_platform::{SshError, SshResult};
use sshbind_proto::ssh::version::{self, Version};
use sshbind_proto::ssh::wire::{write_bool, write_bytes, write_string, WireReader};
use sshbind_proto::ssh::{
    exchange_kexinit, AuthMethod, AuthMethods, AuthRequest, BindOption, Disposition, KexContext,
    KexInit, KexOutcome, KeyExchanger, Listener, ListenerConfig, Message, MessageHandler,
    PacketProtection, Session, SessionInfo, SessionState, Transport,
};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::net::TcpStream;
use tokio::time::{timeout, Duration};

const KEX: &[&str] = &["curve25519-sha256"];
const HOST_KEY: &[&str] = &["ssh-ed25519"];
const WAIT: Duration = Duration::from_secs(5);

/// Negotiates KEXINIT and reports a fixed session id.
struct StubExchanger;

#[async_trait]
impl KeyExchanger for StubExchanger {
    async fn exchange(
        &self,
        transport: &mut Transport,
        context: &KexContext<'_>,
    ) -> SshResult<KexOutcome> {
        assert!(!context.host_keys.is_empty());
        let server = KexInit::new(KEX, HOST_KEY);
        let (_client, negotiated) = exchange_kexinit(transport, &server).await?;
        Ok(KexOutcome {
            session_id: vec![0x42; 32],
            kex_algorithm: negotiated.kex,
            host_key_algorithm: negotiated.host_key,
        })
    }
}

/// XORs packets with a fixed key; the tag is the keyed sequence number.
struct XorSealing(u8);

impl XorSealing {
    fn tag(&self, sequence: u32) -> [u8; 4] {
        sequence.to_be_bytes().map(|b| b ^ self.0)
    }
}

impl PacketProtection for XorSealing {
    fn tag_len(&self) -> usize {
        4
    }

    fn decrypt_length(&mut self, _sequence: u32, encrypted: [u8; 4]) -> [u8; 4] {
        encrypted.map(|b| b ^ self.0)
    }

    fn seal(&mut self, sequence: u32, packet: &mut [u8], tag: &mut [u8]) {
        packet.iter_mut().for_each(|b| *b ^= self.0);
        tag.copy_from_slice(&self.tag(sequence));
    }

    fn open(&mut self, sequence: u32, packet: &mut [u8], tag: &[u8]) -> SshResult<()> {
        if tag != &self.tag(sequence)[..] {
            return Err(SshError::Dispatch("bad tag".to_string()));
        }
        packet.iter_mut().for_each(|b| *b ^= self.0);
        Ok(())
    }
}

/// Exchanges SSH_MSG_NEWKEYS and switches both directions to [`XorSealing`].
async fn newkeys(transport: &mut Transport) -> SshResult<()> {
    transport
        .send_payload(vec![21])
        .await
        .map_err(|e| SshError::KeyExchange(e.to_string()))?;
    transport.set_outbound_protection(Box::new(XorSealing(0xa5)));

    match transport.recv_payload().await {
        Ok(Some(payload)) if payload[..] == [21] => {}
        other => {
            return Err(SshError::KeyExchange(format!("expected NEWKEYS, got {:?}", other)));
        }
    }
    transport.set_inbound_protection(Box::new(XorSealing(0xa5)));
    Ok(())
}

/// Negotiates KEXINIT, then protects the transport.
struct SealingExchanger;

#[async_trait]
impl KeyExchanger for SealingExchanger {
    async fn exchange(
        &self,
        transport: &mut Transport,
        _context: &KexContext<'_>,
    ) -> SshResult<KexOutcome> {
        let server = KexInit::new(KEX, HOST_KEY);
        let (_client, negotiated) = exchange_kexinit(transport, &server).await?;
        newkeys(transport).await?;
        Ok(KexOutcome {
            session_id: server.cookie().to_vec(),
            kex_algorithm: negotiated.kex,
            host_key_algorithm: negotiated.host_key,
        })
    }
}

/// Always fails after the identification exchange.
struct FailingExchanger;

#[async_trait]
impl KeyExchanger for FailingExchanger {
    async fn exchange(
        &self,
        _transport: &mut Transport,
        _context: &KexContext<'_>,
    ) -> SshResult<KexOutcome> {
        Err(SshError::KeyExchange("no common host key algorithm".to_string()))
    }
}

/// Records every message it sees and answers with a fixed disposition.
struct Recorder {
    disposition: Disposition,
    seen: Mutex<Vec<Message>>,
}

impl Recorder {
    fn new(disposition: Disposition) -> Arc<Self> {
        Arc::new(Self {
            disposition,
            seen: Mutex::new(Vec::new()),
        })
    }

    fn seen(&self) -> Vec<Message> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl MessageHandler for Recorder {
    async fn on_message(
        &self,
        _session: &SessionInfo,
        message: &Message,
    ) -> SshResult<Disposition> {
        self.seen.lock().unwrap().push(message.clone());
        Ok(self.disposition)
    }
}

struct TestClient {
    transport: Transport,
}

impl TestClient {
    async fn connect(addr: SocketAddr) -> SshResult<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| SshError::Accept(e.to_string()))?;
        let mut transport = Transport::new(Box::new(stream), Some(addr));
        let ours = Version::new("TestClient_1.0", None);
        let server = version::exchange(transport.stream_mut(), &ours).await?;
        assert_eq!(server.proto_version(), "2.0");
        Ok(Self { transport })
    }

    async fn connect_and_kex(addr: SocketAddr) -> SshResult<Self> {
        let mut client = Self::connect(addr).await?;
        let payload = client.recv().await;
        let server_init = KexInit::from_bytes(&payload)?;
        assert_eq!(server_init.kex_algorithms(), &["curve25519-sha256".to_string()]);
        client.send(KexInit::new(KEX, HOST_KEY).to_bytes()).await;
        Ok(client)
    }

    async fn send(&mut self, payload: Vec<u8>) {
        self.transport.send_payload(payload).await.unwrap();
    }

    async fn recv(&mut self) -> Vec<u8> {
        timeout(WAIT, self.transport.recv_payload())
            .await
            .expect("no reply from server")
            .unwrap()
            .expect("server closed the connection")
            .to_vec()
    }
}

fn password_auth(user: &str) -> Vec<u8> {
    AuthRequest::new(user, "ssh-connection", AuthMethod::Password("secret".to_string())).to_bytes()
}

fn ignore(data: &[u8]) -> Vec<u8> {
    let mut buf = BytesMut::new();
    buf.put_u8(2);
    write_bytes(&mut buf, data);
    buf.to_vec()
}

fn global_request(name: &str) -> Vec<u8> {
    let mut buf = BytesMut::new();
    buf.put_u8(80);
    write_string(&mut buf, name);
    write_bool(&mut buf, true);
    buf.to_vec()
}

fn channel_open(sender: u32) -> Vec<u8> {
    let mut buf = BytesMut::new();
    buf.put_u8(90);
    write_string(&mut buf, "session");
    buf.put_u32(sender);
    buf.put_u32(65536);
    buf.put_u32(16384);
    buf.to_vec()
}

async fn listening(mut config: ListenerConfig, exchanger: Arc<dyn KeyExchanger>) -> Listener {
    config.bind_address = "127.0.0.1".to_string();
    let mut listener = Listener::new(config, exchanger).unwrap();
    listener.set_option(BindOption::BindPort, 0).unwrap();
    listener.set_option(BindOption::RsaKey, "/tmp/test_rsa").unwrap();
    listener.listen().await.unwrap();
    listener
}

/// Accepts one connection and completes the key exchange with a test client.
async fn established(listener: &mut Listener) -> (Session, TestClient) {
    let addr = listener.local_addr().unwrap();
    let client = tokio::spawn(TestClient::connect_and_kex(addr));

    let mut session = listener.accept(Some(WAIT)).await.unwrap();
    assert_eq!(session.state(), SessionState::Created);
    session.handle_key_exchange().await.unwrap();

    let client = client.await.unwrap().unwrap();
    (session, client)
}

#[tokio::test]
async fn test_password_login_scenario() {
    let mut listener = listening(ListenerConfig::default(), Arc::new(StubExchanger)).await;
    let (mut session, mut client) = established(&mut listener).await;

    assert_eq!(session.state(), SessionState::KeyExchanged);
    assert_eq!(session.client_version().unwrap().software(), "TestClient_1.0");
    assert_eq!(session.kex_outcome().unwrap().kex_algorithm, "curve25519-sha256");

    session.set_auth_methods(AuthMethods::PASSWORD).unwrap();
    let recorder = Recorder::new(Disposition::from_code(0));
    session.set_message_handler(recorder.clone()).unwrap();

    client.send(password_auth("alice")).await;
    session.execute_message_callbacks(Some(WAIT)).await.unwrap();

    assert_eq!(session.state(), SessionState::Authenticated);
    assert_eq!(session.user(), Some("alice"));
    assert_eq!(client.recv().await, vec![52]);

    // Channels open once authenticated
    client.send(channel_open(5)).await;
    session.execute_message_callbacks(Some(WAIT)).await.unwrap();
    let reply = client.recv().await;
    let mut reader = WireReader::new(&reply);
    assert_eq!(reader.read_u8().unwrap(), 91);
    assert_eq!(reader.read_u32().unwrap(), 5);

    assert_eq!(recorder.seen().len(), 2);
}

#[tokio::test]
async fn test_protected_transport_after_key_exchange() {
    let mut listener = listening(ListenerConfig::default(), Arc::new(SealingExchanger)).await;
    let addr = listener.local_addr().unwrap();
    let client = tokio::spawn(async move {
        let mut client = TestClient::connect_and_kex(addr).await?;
        newkeys(&mut client.transport).await?;
        Ok::<_, SshError>(client)
    });

    let mut session = listener.accept(Some(WAIT)).await.unwrap();
    session.handle_key_exchange().await.unwrap();
    let mut client = client.await.unwrap().unwrap();
    assert_eq!(session.state(), SessionState::KeyExchanged);

    session.set_auth_methods(AuthMethods::PASSWORD).unwrap();
    let recorder = Recorder::new(Disposition::Handled);
    session.set_message_handler(recorder.clone()).unwrap();

    client.send(password_auth("alice")).await;
    session.execute_message_callbacks(Some(WAIT)).await.unwrap();

    assert_eq!(session.state(), SessionState::Authenticated);
    assert_eq!(client.recv().await, vec![52]);
    assert_eq!(recorder.seen().len(), 1);
}

#[tokio::test]
async fn test_messages_delivered_in_order() {
    let mut listener = listening(ListenerConfig::default(), Arc::new(StubExchanger)).await;
    let (mut session, mut client) = established(&mut listener).await;

    let recorder = Recorder::new(Disposition::Handled);
    session.set_message_handler(recorder.clone()).unwrap();

    for data in [b"m1", b"m2", b"m3"] {
        client.send(ignore(data)).await;
    }
    for _ in 0..3 {
        session.execute_message_callbacks(Some(WAIT)).await.unwrap();
    }

    let expected: Vec<Message> = [b"m1", b"m2", b"m3"]
        .iter()
        .map(|data| Message::Ignore { data: data.to_vec() })
        .collect();
    assert_eq!(recorder.seen(), expected);

    // Nothing further is pending
    let err = session
        .execute_message_callbacks(Some(Duration::from_millis(50)))
        .await
        .unwrap_err();
    assert!(matches!(err, SshError::Timeout(_)));
    assert_eq!(recorder.seen().len(), 3);
}

#[tokio::test]
async fn test_close_unblocks_pump() {
    let mut listener = listening(ListenerConfig::default(), Arc::new(StubExchanger)).await;
    let (mut session, _client) = established(&mut listener).await;

    let closer = session.closer();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        closer.close();
    });

    let err = timeout(WAIT, session.execute_message_callbacks(None))
        .await
        .expect("pump still blocked after close")
        .unwrap_err();
    assert!(matches!(err, SshError::Dispatch(_)));
    assert_eq!(session.state(), SessionState::Closed);

    let err = session.execute_message_callbacks(None).await.unwrap_err();
    assert!(matches!(err, SshError::InvalidState(_)));
}

#[tokio::test]
async fn test_pump_before_key_exchange() {
    let mut listener = listening(ListenerConfig::default(), Arc::new(StubExchanger)).await;
    let addr = listener.local_addr().unwrap();
    let _stream = TcpStream::connect(addr).await.unwrap();

    let mut session = listener.accept(Some(WAIT)).await.unwrap();
    let recorder = Recorder::new(Disposition::Handled);
    session.set_message_handler(recorder.clone()).unwrap();

    let err = session.execute_message_callbacks(Some(WAIT)).await.unwrap_err();
    assert!(matches!(err, SshError::InvalidState(_)));
    assert_eq!(session.state(), SessionState::Created);
    assert!(recorder.seen().is_empty());
}

#[tokio::test]
async fn test_key_exchange_failure_is_fatal() {
    let mut listener = listening(ListenerConfig::default(), Arc::new(FailingExchanger)).await;
    let addr = listener.local_addr().unwrap();
    let client = tokio::spawn(TestClient::connect(addr));

    let mut session = listener.accept(Some(WAIT)).await.unwrap();
    let err = session.handle_key_exchange().await.unwrap_err();
    assert!(matches!(err, SshError::KeyExchange(_)));
    assert!(err.is_fatal());
    assert_eq!(session.state(), SessionState::Failed);
    client.await.unwrap().unwrap();

    assert!(matches!(
        session.execute_message_callbacks(None).await,
        Err(SshError::InvalidState(_))
    ));
    assert!(matches!(
        session.handle_key_exchange().await,
        Err(SshError::InvalidState(_))
    ));
    assert!(matches!(
        session.set_auth_methods(AuthMethods::PASSWORD),
        Err(SshError::InvalidState(_))
    ));

    // Closing a failed session is still allowed
    session.close().await;
    assert_eq!(session.state(), SessionState::Failed);
}

struct FailingHandler;

#[async_trait]
impl MessageHandler for FailingHandler {
    async fn on_message(
        &self,
        _session: &SessionInfo,
        message: &Message,
    ) -> SshResult<Disposition> {
        match message {
            Message::Auth(_) => Err(SshError::Handler("user database unavailable".to_string())),
            _ => Ok(Disposition::Handled),
        }
    }
}

#[tokio::test]
async fn test_handler_error_leaves_session_untouched() {
    let mut listener = listening(ListenerConfig::default(), Arc::new(StubExchanger)).await;
    let (mut session, mut client) = established(&mut listener).await;
    session.set_auth_methods(AuthMethods::PASSWORD).unwrap();
    session.set_message_handler(Arc::new(FailingHandler)).unwrap();

    client.send(password_auth("bob")).await;
    let err = session.execute_message_callbacks(Some(WAIT)).await.unwrap_err();
    assert!(matches!(err, SshError::Handler(_)));
    assert!(!err.is_fatal());
    assert_eq!(session.state(), SessionState::AuthNegotiating);
    assert_eq!(session.user(), None);

    // No reply was sent for the failed auth: the next reply is for this request
    client.send(global_request("keepalive@openssh.com")).await;
    session.execute_message_callbacks(Some(WAIT)).await.unwrap();
    assert_eq!(client.recv().await, vec![82]);
}

#[tokio::test]
async fn test_advertised_methods_round_trip() {
    let mut listener = listening(ListenerConfig::default(), Arc::new(StubExchanger)).await;
    let (mut session, mut client) = established(&mut listener).await;

    session
        .set_auth_methods(AuthMethods::PASSWORD | AuthMethods::PUBLICKEY)
        .unwrap();
    let recorder = Recorder::new(Disposition::Handled);
    session.set_message_handler(recorder.clone()).unwrap();

    let query = AuthRequest::new("carol", "ssh-connection", AuthMethod::None).to_bytes();
    client.send(query).await;
    session.execute_message_callbacks(Some(WAIT)).await.unwrap();

    let reply = client.recv().await;
    let mut reader = WireReader::new(&reply);
    assert_eq!(reader.read_u8().unwrap(), 51);
    assert_eq!(reader.read_name_list().unwrap(), vec!["publickey", "password"]);
    assert!(!reader.read_bool().unwrap());

    // "none" was not advertised, so the handler never saw the request
    assert!(recorder.seen().is_empty());
    assert_eq!(session.state(), SessionState::AuthNegotiating);
}

#[tokio::test]
async fn test_banner_precedes_auth_reply() {
    let config = ListenerConfig {
        banner: Some("Authorized use only".to_string()),
        ..ListenerConfig::default()
    };
    let mut listener = listening(config, Arc::new(StubExchanger)).await;
    let (mut session, mut client) = established(&mut listener).await;
    session.set_message_handler(Recorder::new(Disposition::Default)).unwrap();

    client.send(password_auth("dave")).await;
    session.execute_message_callbacks(Some(WAIT)).await.unwrap();

    let banner = client.recv().await;
    let mut reader = WireReader::new(&banner);
    assert_eq!(reader.read_u8().unwrap(), 53);
    assert_eq!(reader.read_string().unwrap(), "Authorized use only");
    assert_eq!(client.recv().await[0], 51);

    // Only once
    client.send(password_auth("dave")).await;
    session.execute_message_callbacks(Some(WAIT)).await.unwrap();
    assert_eq!(client.recv().await[0], 51);
}

#[tokio::test]
async fn test_auth_attempt_limit_disconnects() {
    let mut config = ListenerConfig::default();
    config.session.max_auth_attempts = 2;
    let mut listener = listening(config, Arc::new(StubExchanger)).await;
    let (mut session, mut client) = established(&mut listener).await;
    session.set_message_handler(Recorder::new(Disposition::Default)).unwrap();

    client.send(password_auth("eve")).await;
    session.execute_message_callbacks(Some(WAIT)).await.unwrap();
    assert_eq!(client.recv().await[0], 51);

    client.send(password_auth("eve")).await;
    session.execute_message_callbacks(Some(WAIT)).await.unwrap();
    assert_eq!(client.recv().await[0], 51);

    let disconnect = client.recv().await;
    let mut reader = WireReader::new(&disconnect);
    assert_eq!(reader.read_u8().unwrap(), 1);
    assert_eq!(reader.read_u32().unwrap(), 14);
    assert_eq!(session.state(), SessionState::Closed);
}

#[tokio::test]
async fn test_session_limit_over_tcp() {
    let config = ListenerConfig {
        max_sessions: 1,
        ..ListenerConfig::default()
    };
    let mut listener = listening(config, Arc::new(StubExchanger)).await;
    let addr = listener.local_addr().unwrap();

    let _first = TcpStream::connect(addr).await.unwrap();
    let _second = TcpStream::connect(addr).await.unwrap();

    let session = listener.accept(Some(WAIT)).await.unwrap();
    let err = listener.accept(Some(WAIT)).await.unwrap_err();
    assert!(matches!(err, SshError::Allocation(_)));

    // Capacity returns once the live session goes away
    drop(session);
    let _third = TcpStream::connect(addr).await.unwrap();
    listener.accept(Some(WAIT)).await.unwrap();
}

#[tokio::test]
async fn test_run_hands_sessions_to_handler() {
    let mut listener = listening(ListenerConfig::default(), Arc::new(StubExchanger)).await;
    let addr = listener.local_addr().unwrap();

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    listener.set_incoming_connection_handler(Arc::new(move |session: Session| {
        let _ = tx.send(session);
    }));
    let shutdown = listener.shutdown_handle();
    let server = tokio::spawn(async move {
        let result = listener.run().await;
        (listener, result)
    });

    let _a = TcpStream::connect(addr).await.unwrap();
    let _b = TcpStream::connect(addr).await.unwrap();

    let first = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    let second = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(first.id(), 1);
    assert_eq!(second.id(), 2);
    assert_eq!(first.state(), SessionState::Created);

    shutdown.shutdown();
    let (listener, result) = timeout(WAIT, server).await.unwrap().unwrap();
    assert!(result.is_ok());
    assert!(matches!(listener.local_addr(), Err(SshError::InvalidState(_))));
    assert!(TcpStream::connect(addr).await.is_err());

    // Accepted sessions outlive the accept loop
    assert!(first.is_open());
}

#[cfg(unix)]
#[tokio::test]
async fn test_accept_fd_uses_supplied_socket() {
    use std::os::fd::OwnedFd;

    let mut config = ListenerConfig::default();
    config.apply(BindOption::EcdsaKey, "/tmp/test_ecdsa").unwrap();
    let mut listener = Listener::new(config, Arc::new(StubExchanger)).unwrap();

    // A socket accepted elsewhere, unrelated to the listener
    let external = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = external.local_addr().unwrap();
    let client = tokio::spawn(TestClient::connect_and_kex(addr));
    let (stream, peer) = external.accept().await.unwrap();
    let fd = OwnedFd::from(stream.into_std().unwrap());

    let mut session = listener.accept_fd(fd).unwrap();
    assert_eq!(session.peer_addr(), Some(peer));
    session.handle_key_exchange().await.unwrap();
    assert_eq!(session.state(), SessionState::KeyExchanged);
    client.await.unwrap().unwrap();

    // The listener itself never listened
    assert!(matches!(listener.local_addr(), Err(SshError::InvalidState(_))));
}
