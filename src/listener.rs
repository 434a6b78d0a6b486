//! Listener and greeter
//!
//! Binds the cleartext listener (and the implicit-TLS one when
//! certificates are configured), admits each accepted connection into the
//! registry, greets it, and drives its session to one of three ends:
//! closed, upgraded via STARTTLS, or handed off to the backend master.

use crate::auth::AuthService;
use crate::config::Settings;
use crate::error::Result;
use crate::handoff::{HandoffStream, Identity, MasterClient};
use crate::registry::Registry;
use crate::session::{RunOutcome, Session};
use crate::tls;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tokio_rustls::server::TlsStream;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};

pub struct Server {
    settings: Arc<Settings>,
    registry: Arc<Registry>,
    auth: Arc<dyn AuthService>,
    master: MasterClient,
    acceptor: Option<TlsAcceptor>,
    local_addr: SocketAddr,
    tls_addr: Option<SocketAddr>,
    shutdown: CancellationToken,
}

impl Server {
    /// Bind the configured listeners and start accepting.
    ///
    /// Returns once the sockets are bound; accepting and the idle sweep run
    /// in background tasks until [`Server::shutdown`].
    pub async fn start(
        settings: Settings,
        auth: Arc<dyn AuthService>,
        master: MasterClient,
    ) -> Result<Arc<Self>> {
        // An attempt must be able to outlive the idle sweep, or the
        // registry could reap a session that is only waiting on the auth
        // daemon.
        if settings.auth_timeout <= settings.idle_timeout {
            return Err(crate::error::Error::Config(
                "auth timeout must exceed the idle timeout".to_string(),
            ));
        }

        let acceptor = match (&settings.ssl_cert, &settings.ssl_key) {
            (Some(cert), Some(key)) => Some(tls::load_acceptor(cert, key)?),
            _ => None,
        };

        let listener = TcpListener::bind(settings.listen).await?;
        let local_addr = listener.local_addr()?;
        let tls_listener = match (&acceptor, settings.tls_listen) {
            (Some(_), Some(addr)) => Some(TcpListener::bind(addr).await?),
            _ => None,
        };
        let tls_addr = match &tls_listener {
            Some(listener) => Some(listener.local_addr()?),
            None => None,
        };

        let registry = Arc::new(Registry::new(
            settings.max_logging_users,
            settings.idle_timeout,
        ));
        registry.spawn_sweeper();

        let server = Arc::new(Self {
            settings: Arc::new(settings),
            registry,
            auth,
            master,
            acceptor,
            local_addr,
            tls_addr,
            shutdown: CancellationToken::new(),
        });

        info!("listening on {local_addr}");
        tokio::spawn(accept_loop(Arc::clone(&server), listener, false));
        if let Some(tls_listener) = tls_listener {
            info!("listening on {} (imaps)", tls_addr.unwrap_or(local_addr));
            tokio::spawn(accept_loop(Arc::clone(&server), tls_listener, true));
        }

        Ok(server)
    }

    /// Address of the cleartext listener.
    #[must_use]
    pub const fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Address of the implicit-TLS listener, if bound.
    #[must_use]
    pub const fn tls_addr(&self) -> Option<SocketAddr> {
        self.tls_addr
    }

    #[must_use]
    pub fn session_count(&self) -> usize {
        self.registry.len()
    }

    /// Stop accepting and drain every live session silently.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        self.registry.shutdown();
    }
}

async fn accept_loop(server: Arc<Server>, listener: TcpListener, implicit_tls: bool) {
    loop {
        tokio::select! {
            () = server.shutdown.cancelled() => return,
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(conn) => conn,
                    Err(err) => {
                        warn!("accept failed: {err}");
                        continue;
                    }
                };
                if server.settings.process_per_connection {
                    handle_connection(Arc::clone(&server), stream, peer, implicit_tls).await;
                    return;
                }
                let server = Arc::clone(&server);
                tokio::spawn(async move {
                    handle_connection(server, stream, peer, implicit_tls).await;
                });
            }
        }
    }
}

async fn handle_connection(
    server: Arc<Server>,
    stream: TcpStream,
    peer: SocketAddr,
    implicit_tls: bool,
) {
    let span = if server.settings.verbose_proctitle {
        info_span!("imap-login", %peer)
    } else {
        info_span!("imap-login")
    };
    serve(server, stream, peer, implicit_tls).instrument(span).await;
}

async fn serve(server: Arc<Server>, stream: TcpStream, peer: SocketAddr, implicit_tls: bool) {
    let local = stream.local_addr().unwrap_or(server.settings.listen);
    let handle = server.registry.admit(peer);
    debug!(%peer, "connection accepted");

    if implicit_tls {
        let Some(acceptor) = server.acceptor.clone() else {
            return;
        };
        match acceptor.accept(stream).await {
            Ok(tls_stream) => {
                let mut session = Session::new(
                    tls_stream,
                    peer,
                    local,
                    true,
                    Arc::clone(&server.settings),
                    Arc::clone(&server.auth),
                    handle,
                );
                if session.send_greeting().await.is_err() {
                    return;
                }
                serve_tls(&server, session).await;
            }
            Err(err) => info!(%peer, "Disconnected: TLS handshake failed: {err}"),
        }
        return;
    }

    let mut session = Session::new(
        stream,
        peer,
        local,
        false,
        Arc::clone(&server.settings),
        Arc::clone(&server.auth),
        handle,
    );
    if session.send_greeting().await.is_err() {
        return;
    }

    match session.run().await {
        RunOutcome::Closed => {}
        RunOutcome::Handoff(identity) => {
            transfer(&server, HandoffStream::Plain(session.into_stream()), identity).await;
        }
        RunOutcome::Upgrade => {
            let Some(acceptor) = server.acceptor.clone() else {
                // STARTTLS only gets this far when certificates are
                // configured, so a missing acceptor is a startup bug.
                let mut stream = session.into_stream();
                let _ = stream.write_all(b"* BYE TLS initialization failed.\r\n").await;
                info!(%peer, "Disconnected: TLS initialization failed");
                return;
            };
            match session.into_tls(&acceptor).await {
                Ok(tls_session) => serve_tls(&server, tls_session).await,
                Err(err) => {
                    info!(%peer, "Disconnected: TLS initialization failed: {err}");
                }
            }
        }
    }
}

/// Drive a session that is already on an encrypted stream. STARTTLS is
/// refused by the command layer once TLS is active, so `Upgrade` cannot
/// come back here.
async fn serve_tls(server: &Server, mut session: Session<TlsStream<TcpStream>>) {
    match session.run().await {
        RunOutcome::Closed | RunOutcome::Upgrade => {}
        RunOutcome::Handoff(identity) => {
            transfer(
                server,
                HandoffStream::Tls(Box::new(session.into_stream())),
                identity,
            )
            .await;
        }
    }
}

async fn transfer(server: &Server, stream: HandoffStream, identity: Identity) {
    let user = identity.user.clone();
    if let Err(err) = server.master.transfer(stream, identity).await {
        warn!(%user, "Internal login failure: {err}");
    }
}
