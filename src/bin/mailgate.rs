#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::missing_errors_doc, clippy::missing_panics_doc)]

//! IMAP login front-end daemon

use clap::Parser;
use mailgate::auth::RemoteAuthService;
use mailgate::handoff::MasterClient;
use mailgate::{Server, Settings};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "mailgate")]
#[command(about = "Pre-authentication IMAP front-end")]
struct Args {
    /// Listen address, overriding MAILGATE_LISTEN
    #[arg(long)]
    listen: Option<std::net::SocketAddr>,

    /// Auth daemon address, overriding MAILGATE_AUTH_ADDR
    #[arg(long)]
    auth_addr: Option<std::net::SocketAddr>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    mailgate::tls::install_crypto_provider();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let mut settings = Settings::from_env()?;
    if let Some(listen) = args.listen {
        settings.listen = listen;
    }
    if let Some(auth_addr) = args.auth_addr {
        settings.auth_addr = auth_addr;
    }

    let auth = Arc::new(RemoteAuthService::start(
        settings.auth_addr,
        settings.auth_timeout,
    ));

    // Until a real backend consumes handoffs, log and drop them; the
    // client connection closes once the stream is dropped here.
    let (master, mut handoffs) = MasterClient::new(64);
    tokio::spawn(async move {
        while let Some(request) = handoffs.recv().await {
            warn!(
                user = %request.identity.user,
                "no backend master configured, dropping connection"
            );
            let _ = request.reply.send(Ok(()));
        }
    });

    let server = Server::start(settings, auth, master).await?;
    info!("mailgate running on {}", server.local_addr());

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    server.shutdown();

    Ok(())
}
