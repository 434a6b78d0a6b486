//! Backend master handoff
//!
//! After a successful login the session's socket and identity leave this
//! process: the listener sends them to the backend master, which takes over
//! the connection for authenticated IMAP. The master side is a channel
//! consumer so deployments (and tests) decide what "transfer" means.

use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_rustls::server::TlsStream;

/// The connection being handed off, in whichever transport state it
/// reached.
#[derive(Debug)]
pub enum HandoffStream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

/// Authenticated identity travelling with the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user: String,
    pub mechanism: String,
    pub ticket: String,
}

#[derive(Error, Debug)]
pub enum HandoffError {
    #[error("backend master unavailable")]
    Unavailable,
    #[error("backend master refused: {0}")]
    Refused(String),
}

/// One transfer request as the master consumer sees it. Dropping `reply`
/// without answering counts as a refusal; dropping the whole request aborts
/// the handoff.
#[derive(Debug)]
pub struct HandoffRequest {
    pub stream: HandoffStream,
    pub identity: Identity,
    pub reply: oneshot::Sender<Result<(), HandoffError>>,
}

/// Sender half used by the listener.
#[derive(Debug, Clone)]
pub struct MasterClient {
    requests: mpsc::Sender<HandoffRequest>,
}

impl MasterClient {
    /// Create a client and the request stream the backend master consumes.
    #[must_use]
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<HandoffRequest>) {
        let (requests, receiver) = mpsc::channel(capacity);
        (Self { requests }, receiver)
    }

    /// Transfer a connection and wait for the master's verdict.
    pub async fn transfer(
        &self,
        stream: HandoffStream,
        identity: Identity,
    ) -> Result<(), HandoffError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.requests
            .send(HandoffRequest {
                stream,
                identity,
                reply: reply_tx,
            })
            .await
            .map_err(|_| HandoffError::Unavailable)?;
        reply_rx.await.map_err(|_| HandoffError::Unavailable)?
    }
}
