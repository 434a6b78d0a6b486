//! Auth service broker
//!
//! The authentication service runs out of process. This module owns the
//! client side of that boundary: the [`AuthService`] trait the session
//! depends on, the [`AuthAttempt`] handle carrying one credential exchange
//! (continuation rounds included), and [`RemoteAuthService`], which speaks
//! newline-delimited JSON to the daemon and reconnects when it goes away.
//!
//! One attempt outlives at most one command exchange and is bounded by the
//! configured auth timeout, which must stay above the session idle timeout
//! so the registry sweep never reaps a session that is merely waiting on
//! the daemon.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// One SASL mechanism the auth service can drive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mechanism {
    pub name: String,
    /// Mechanisms that expose the credentials on the wire; hidden and
    /// refused on unsecured connections when plaintext auth is disabled.
    pub plaintext: bool,
}

impl Mechanism {
    #[must_use]
    pub fn new(name: &str, plaintext: bool) -> Self {
        Self {
            name: name.to_string(),
            plaintext,
        }
    }
}

/// Everything the auth service needs to evaluate one attempt.
#[derive(Debug, Clone)]
pub struct AuthRequest {
    pub mechanism: String,
    pub initial: Option<Vec<u8>>,
    pub peer_ip: IpAddr,
    pub local_ip: IpAddr,
    pub secured: bool,
    pub tls: bool,
}

/// Final outcome of an attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthVerdict {
    /// Credentials accepted; the session hands off to the backend.
    Success { user: String, ticket: String },
    /// Credentials rejected; the reason is sent in the tagged `NO`.
    Failed(String),
    /// The service disappeared or timed out mid-attempt.
    InternalError,
}

/// One step of an attempt as seen by the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthEvent {
    /// Server challenge; relay to the client as `+ <base64>`.
    Continue(Vec<u8>),
    Done(AuthVerdict),
}

/// What the session sends back into an attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptMessage {
    /// Decoded continuation response from the client.
    Respond(Vec<u8>),
    /// The attempt was cancelled. Sent at most once, then the channel
    /// closes; aborting an already-finished attempt is harmless.
    Abort,
}

/// Build the PLAIN initial response: NUL authzid NUL authcid NUL password.
#[must_use]
pub fn plain_initial(authzid: &str, authcid: &str, password: &str) -> Vec<u8> {
    format!("\0{authzid}\0{authcid}\0{password}").into_bytes()
}

/// Interface to the out-of-process authentication service.
pub trait AuthService: Send + Sync {
    /// Whether the daemon link is currently up. Sessions refuse to process
    /// commands while it is down.
    fn is_connected(&self) -> bool;

    /// Receiver that flips to `true` when the daemon link comes up; blocked
    /// sessions resume on it.
    fn connection_watch(&self) -> watch::Receiver<bool>;

    /// Mechanisms to advertise in the capability banner.
    fn mechanisms(&self) -> Vec<Mechanism>;

    /// Start an attempt. Continuations and the verdict arrive through the
    /// returned handle.
    fn begin(&self, request: AuthRequest) -> AuthAttempt;
}

/// Handle for one in-flight attempt. Dropping it aborts the attempt.
#[derive(Debug)]
pub struct AuthAttempt {
    events: mpsc::Receiver<AuthEvent>,
    outbound: mpsc::Sender<AttemptMessage>,
    deadline: tokio::time::Instant,
}

impl AuthAttempt {
    /// Assemble an attempt from its two channels. `AuthService`
    /// implementations feed `events` and consume the returned messages.
    #[must_use]
    pub fn from_channels(
        events: mpsc::Receiver<AuthEvent>,
        outbound: mpsc::Sender<AttemptMessage>,
        timeout: Duration,
    ) -> Self {
        Self {
            events,
            outbound,
            deadline: tokio::time::Instant::now() + timeout,
        }
    }

    /// Next step of the exchange. A vanished service and an expired attempt
    /// both surface as `Done(InternalError)`.
    pub async fn event(&mut self) -> AuthEvent {
        match tokio::time::timeout_at(self.deadline, self.events.recv()).await {
            Ok(Some(event)) => event,
            Ok(None) => AuthEvent::Done(AuthVerdict::InternalError),
            Err(_elapsed) => {
                warn!("auth attempt timed out");
                AuthEvent::Done(AuthVerdict::InternalError)
            }
        }
    }

    /// Forward the client's continuation response.
    pub async fn respond(&self, data: Vec<u8>) {
        let _ = self.outbound.send(AttemptMessage::Respond(data)).await;
    }
}

impl Drop for AuthAttempt {
    fn drop(&mut self) {
        let _ = self.outbound.try_send(AttemptMessage::Abort);
    }
}

// -- wire protocol ---------------------------------------------------------

#[derive(Serialize)]
#[serde(tag = "op", rename_all = "lowercase")]
enum DaemonRequest<'a> {
    Begin {
        id: u64,
        mech: &'a str,
        #[serde(skip_serializing_if = "Option::is_none")]
        initial: Option<String>,
        peer_ip: IpAddr,
        local_ip: IpAddr,
        secured: bool,
        tls: bool,
    },
    Continue {
        id: u64,
        data: String,
    },
    Abort {
        id: u64,
    },
}

#[derive(Deserialize)]
#[serde(tag = "event", rename_all = "lowercase")]
enum DaemonReply {
    Mechanisms { mechanisms: Vec<Mechanism> },
    Cont { id: u64, data: String },
    Ok { id: u64, user: String, ticket: String },
    No { id: u64, reason: String },
}

enum Command {
    Begin {
        id: u64,
        request: AuthRequest,
        events: mpsc::Sender<AuthEvent>,
    },
    Continue {
        id: u64,
        data: Vec<u8>,
    },
    Abort {
        id: u64,
    },
}

// -- remote implementation -------------------------------------------------

/// Auth service client over a TCP link to the daemon.
///
/// A background task owns the connection, multiplexes attempts by id, and
/// reconnects with a fixed backoff when the daemon drops. Attempts that
/// were in flight at disconnect time observe `InternalError`.
pub struct RemoteAuthService {
    inner: Arc<Inner>,
}

struct Inner {
    auth_timeout: Duration,
    commands: mpsc::Sender<Command>,
    connected_rx: watch::Receiver<bool>,
    mechanisms: Mutex<Vec<Mechanism>>,
    next_id: AtomicU64,
}

const RECONNECT_DELAY: Duration = Duration::from_secs(1);

impl RemoteAuthService {
    /// Connect to the daemon at `addr`. Returns immediately; the link is
    /// established (and re-established) in the background.
    #[must_use]
    pub fn start(addr: SocketAddr, auth_timeout: Duration) -> Self {
        let (commands_tx, commands_rx) = mpsc::channel(64);
        let (connected_tx, connected_rx) = watch::channel(false);
        let inner = Arc::new(Inner {
            auth_timeout,
            commands: commands_tx,
            connected_rx,
            mechanisms: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        });
        tokio::spawn(run_link(addr, commands_rx, connected_tx, Arc::clone(&inner)));
        Self { inner }
    }
}

impl AuthService for RemoteAuthService {
    fn is_connected(&self) -> bool {
        *self.inner.connected_rx.borrow()
    }

    fn connection_watch(&self) -> watch::Receiver<bool> {
        self.inner.connected_rx.clone()
    }

    fn mechanisms(&self) -> Vec<Mechanism> {
        self.inner.mechanisms.lock().unwrap().clone()
    }

    fn begin(&self, request: AuthRequest) -> AuthAttempt {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (events_tx, events_rx) = mpsc::channel(8);
        let (outbound_tx, mut outbound_rx) = mpsc::channel::<AttemptMessage>(8);
        let attempt = AuthAttempt::from_channels(events_rx, outbound_tx, self.inner.auth_timeout);

        // A full or closed command queue shows up to the session as a
        // closed event channel, i.e. InternalError.
        let _ = self.inner.commands.try_send(Command::Begin {
            id,
            request,
            events: events_tx,
        });

        // Tag this attempt's messages with its id on the shared link.
        let commands = self.inner.commands.clone();
        tokio::spawn(async move {
            while let Some(message) = outbound_rx.recv().await {
                let command = match message {
                    AttemptMessage::Respond(data) => Command::Continue { id, data },
                    AttemptMessage::Abort => Command::Abort { id },
                };
                if commands.send(command).await.is_err() {
                    return;
                }
            }
        });

        attempt
    }
}

async fn run_link(
    addr: SocketAddr,
    mut commands: mpsc::Receiver<Command>,
    connected: watch::Sender<bool>,
    inner: Arc<Inner>,
) {
    loop {
        let stream = match TcpStream::connect(addr).await {
            Ok(stream) => stream,
            Err(err) => {
                debug!("auth daemon at {addr} unreachable: {err}");
                tokio::time::sleep(RECONNECT_DELAY).await;
                continue;
            }
        };
        info!("connected to auth daemon at {addr}");
        let _ = connected.send(true);

        serve_link(stream, &mut commands, &inner).await;

        let _ = connected.send(false);
        inner.mechanisms.lock().unwrap().clear();
        warn!("lost connection to auth daemon at {addr}");
        tokio::time::sleep(RECONNECT_DELAY).await;
    }
}

/// Drive one established daemon connection until it breaks. Pending
/// attempts are dropped on exit, which their sessions observe as
/// `InternalError`.
async fn serve_link(stream: TcpStream, commands: &mut mpsc::Receiver<Command>, inner: &Inner) {
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();
    let mut pending: HashMap<u64, mpsc::Sender<AuthEvent>> = HashMap::new();

    loop {
        tokio::select! {
            command = commands.recv() => {
                let Some(command) = command else { return };
                let line = match command {
                    Command::Begin { id, request, events } => {
                        pending.insert(id, events);
                        DaemonRequest::Begin {
                            id,
                            mech: &request.mechanism,
                            initial: request.initial.as_deref().map(|b| BASE64.encode(b)),
                            peer_ip: request.peer_ip,
                            local_ip: request.local_ip,
                            secured: request.secured,
                            tls: request.tls,
                        }
                        .to_line()
                    }
                    Command::Continue { id, data } => DaemonRequest::Continue {
                        id,
                        data: BASE64.encode(data),
                    }
                    .to_line(),
                    Command::Abort { id } => {
                        if pending.remove(&id).is_none() {
                            continue;
                        }
                        DaemonRequest::Abort { id }.to_line()
                    }
                };
                if write_half.write_all(&line).await.is_err() {
                    return;
                }
            }
            line = lines.next_line() => {
                let Ok(Some(line)) = line else { return };
                match serde_json::from_str::<DaemonReply>(&line) {
                    Ok(DaemonReply::Mechanisms { mechanisms }) => {
                        *inner.mechanisms.lock().unwrap() = mechanisms;
                    }
                    Ok(reply) => dispatch_reply(reply, &mut pending).await,
                    Err(err) => {
                        warn!("unparseable auth daemon reply: {err}");
                        return;
                    }
                }
            }
        }
    }
}

async fn dispatch_reply(reply: DaemonReply, pending: &mut HashMap<u64, mpsc::Sender<AuthEvent>>) {
    let (id, event, done) = match reply {
        DaemonReply::Cont { id, data } => match BASE64.decode(data.as_bytes()) {
            Ok(challenge) => (id, AuthEvent::Continue(challenge), false),
            Err(_) => (id, AuthEvent::Done(AuthVerdict::InternalError), true),
        },
        DaemonReply::Ok { id, user, ticket } => {
            (id, AuthEvent::Done(AuthVerdict::Success { user, ticket }), true)
        }
        DaemonReply::No { id, reason } => (id, AuthEvent::Done(AuthVerdict::Failed(reason)), true),
        DaemonReply::Mechanisms { .. } => unreachable!("handled by caller"),
    };
    let delivered = match pending.get(&id) {
        Some(events) => events.send(event).await.is_ok(),
        None => false,
    };
    if !delivered {
        debug!("auth reply for finished attempt {id} dropped");
    }
    if done {
        pending.remove(&id);
    }
}

impl DaemonRequest<'_> {
    fn to_line(&self) -> Vec<u8> {
        let mut line = serde_json::to_vec(self).expect("daemon request serializes");
        line.push(b'\n');
        line
    }
}
