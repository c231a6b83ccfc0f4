//! Simple SSH Server Example
//!
//! This example demonstrates how to:
//! - Configure and start a listener
//! - Hand every accepted session to its own task
//! - Authenticate users through a message handler
//!
//! The key exchanger used here only negotiates KEXINIT and performs no
//! cryptography, so real SSH clients will not get past the key exchange.
//! Plug a crypto provider in through `KeyExchanger` for real use.
//!
//! Usage:
//!   RUST_LOG=debug cargo run --example simple_server [port]

use async_trait::async_trait;
use sshbind_platform::SshResult;
use sshbind_proto::ssh::{
    exchange_kexinit, handler_fn, AuthMethod, AuthMethods, BindOption, Disposition, KexContext,
    KexInit, KexOutcome, KeyExchanger, Listener, ListenerConfig, Message, Session, Transport,
};
use std::env;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Negotiates algorithms without deriving any keys.
struct NegotiateOnly;

#[async_trait]
impl KeyExchanger for NegotiateOnly {
    async fn exchange(
        &self,
        transport: &mut Transport,
        context: &KexContext<'_>,
    ) -> SshResult<KexOutcome> {
        info!(client = %context.client_version, "negotiating algorithms");
        let server = KexInit::new(&["curve25519-sha256"], &["ssh-ed25519", "rsa-sha2-256"]);
        let (_client, negotiated) = exchange_kexinit(transport, &server).await?;

        Ok(KexOutcome {
            session_id: server.cookie().to_vec(),
            kex_algorithm: negotiated.kex,
            host_key_algorithm: negotiated.host_key,
        })
    }
}

async fn serve(mut session: Session) -> SshResult<()> {
    session.set_message_handler(handler_fn(|info, message| {
        let disposition = match message {
            Message::Auth(request) => match request.method() {
                AuthMethod::Password(password)
                    if request.user_name() == "demo" && password == "demo" =>
                {
                    Disposition::Handled
                }
                _ => Disposition::Default,
            },
            Message::ChannelOpen(open) if open.channel_type == "session" => Disposition::Handled,
            Message::ChannelRequest(request) if request.request_type == "exec" => {
                Disposition::Handled
            }
            _ => Disposition::Default,
        };
        info!(session = info.id, msg_type = message.msg_type(), ?disposition, "message");
        Ok(disposition)
    }))?;

    session.handle_key_exchange().await?;
    session.set_auth_methods(AuthMethods::PASSWORD | AuthMethods::PUBLICKEY)?;

    while session.is_open() {
        session.execute_message_callbacks(None).await?;
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let port = env::args().nth(1).unwrap_or_else(|| "2222".to_string());

    let mut listener = Listener::new(ListenerConfig::default(), Arc::new(NegotiateOnly))?;
    listener.set_option(BindOption::BindAddress, "127.0.0.1")?;
    listener.set_option(BindOption::BindPortString, port)?;
    listener.set_option(BindOption::HostKey, "/tmp/sshbind_host_key")?;
    listener.set_option(BindOption::Banner, "sshbind demo server\r\n")?;
    listener.set_option(BindOption::LogVerbosityString, "protocol")?;
    listener.listen().await?;

    info!(addr = %listener.local_addr()?, "ready, login with demo/demo");

    listener.set_incoming_connection_handler(Arc::new(|session: Session| {
        tokio::spawn(async move {
            let id = session.id();
            if let Err(e) = serve(session).await {
                warn!(session = id, error = %e, "session ended");
            }
        });
    }));

    let shutdown = listener.shutdown_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            shutdown.shutdown();
        }
    });

    listener.run().await?;
    Ok(())
}
