//! Per-connection pre-login session
//!
//! Owns one client connection from greeting until it is destroyed or
//! authenticated. Only the pre-login command set is understood; everything
//! after a successful login belongs to the backend the connection is
//! handed to.
//!
//! The run loop processes events strictly in arrival order and corks the
//! transport around each batch of buffered commands, so a tagged reply and
//! its preceding untagged lines always reach the client as one write.

use crate::auth::{AuthEvent, AuthRequest, AuthService, AuthVerdict, plain_initial};
use crate::config::{MAX_BAD_COMMANDS, Settings};
use crate::handoff::Identity;
use crate::parser::{Arg, ParseError, Parser};
use crate::registry::{DisconnectNotice, SessionHandle};
use crate::transport::{Transport, TransportError};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info};

/// How a session's run loop ended, as seen by the listener.
#[derive(Debug)]
pub enum RunOutcome {
    /// Connection is finished; the reason, if any, has been logged.
    Closed,
    /// STARTTLS was acknowledged and flushed; the caller runs the
    /// handshake and resumes with [`Session::into_tls`].
    Upgrade,
    /// Login succeeded; the caller transfers the stream and this identity
    /// to the backend master.
    Handoff(Identity),
}

enum Flow {
    /// Keep processing buffered commands.
    Next,
    /// Wait for more input.
    NeedMore,
    Exit(Exit),
}

enum Exit {
    Closed { reason: Option<String> },
    Upgrade,
    Handoff(Identity),
}

enum AuthInput {
    Line(String),
    Exit(Exit),
}

pub struct Session<S> {
    transport: Transport<S>,
    parser: Parser,
    peer: SocketAddr,
    local: SocketAddr,
    settings: Arc<Settings>,
    auth: Arc<dyn AuthService>,
    handle: SessionHandle,
    tls: bool,
    secured: bool,
    bad_commands: u32,
    auth_user: Option<String>,
    auth_mech: Option<String>,
}

impl<S: AsyncRead + AsyncWrite + Unpin> Session<S> {
    pub fn new(
        stream: S,
        peer: SocketAddr,
        local: SocketAddr,
        tls: bool,
        settings: Arc<Settings>,
        auth: Arc<dyn AuthService>,
        handle: SessionHandle,
    ) -> Self {
        // Loopback peers count as secured even in cleartext.
        let secured = tls || peer.ip().is_loopback();
        Self {
            transport: Transport::new(stream),
            parser: Parser::new(),
            peer,
            local,
            settings,
            auth,
            handle,
            tls,
            secured,
            bad_commands: 0,
            auth_user: None,
            auth_mech: None,
        }
    }

    #[must_use]
    pub const fn is_secured(&self) -> bool {
        self.secured
    }

    #[must_use]
    pub const fn is_tls(&self) -> bool {
        self.tls
    }

    /// Capability atoms for the current security level.
    #[must_use]
    pub fn capability(&self) -> String {
        let mut caps = self.settings.capability_string.clone();
        if self.settings.ssl_initialized() && !self.tls {
            caps.push_str(" STARTTLS");
        }
        if self.plaintext_blocked() {
            caps.push_str(" LOGINDISABLED");
        }
        for mech in self.auth.mechanisms() {
            if !mech.plaintext || !self.plaintext_blocked() {
                caps.push_str(" AUTH=");
                caps.push_str(&mech.name);
            }
        }
        caps
    }

    /// Send the `* OK` greeting, optionally embedding the capability list.
    pub async fn send_greeting(&mut self) -> Result<(), TransportError> {
        let mut line = String::from("* OK ");
        if self.settings.greeting_capability {
            line.push('[');
            line.push_str("CAPABILITY ");
            line.push_str(&self.capability());
            line.push_str("] ");
        }
        line.push_str(&self.settings.greeting);
        self.transport.send_line(&line).await
    }

    /// Drive the session until it closes, upgrades to TLS, or hands off.
    pub async fn run(&mut self) -> RunOutcome {
        loop {
            tokio::select! {
                notice = self.handle.control.recv() => {
                    let exit = self.notice_exit(notice).await;
                    return self.finish(exit);
                }
                read = self.transport.read_input() => {
                    if let Err(err) = read {
                        return self.finish_transport_error(err).await;
                    }
                    self.handle.touch();
                    let input = self.transport.take_input();
                    self.parser.feed(&input);

                    // No commands are accepted while the auth daemon is
                    // down; park until it comes back.
                    if !self.auth.is_connected() {
                        match self.wait_for_auth_daemon().await {
                            Ok(Flow::Exit(exit)) => return self.finish(exit),
                            Ok(_) => {}
                            Err(err) => return self.finish_transport_error(err).await,
                        }
                    }

                    match self.process_buffered().await {
                        Ok(Flow::Next | Flow::NeedMore) => {}
                        Ok(Flow::Exit(exit)) => return self.finish(exit),
                        Err(err) => return self.finish_transport_error(err).await,
                    }
                }
            }
        }
    }

    /// Give up the stream for the backend handoff.
    pub fn into_stream(self) -> S {
        self.transport.into_inner()
    }

    /// Run the TLS handshake and resume on the encrypted stream.
    ///
    /// The transport and parser are rebuilt from scratch: anything the
    /// client pipelined in cleartext after STARTTLS is discarded, not
    /// replayed into the secured session.
    pub async fn into_tls(
        self,
        acceptor: &tokio_rustls::TlsAcceptor,
    ) -> std::io::Result<Session<tokio_rustls::server::TlsStream<S>>> {
        let stream = self.transport.into_inner();
        let tls_stream = acceptor.accept(stream).await?;
        Ok(Session {
            transport: Transport::new(tls_stream),
            parser: Parser::new(),
            peer: self.peer,
            local: self.local,
            settings: self.settings,
            auth: self.auth,
            handle: self.handle,
            tls: true,
            secured: true,
            bad_commands: self.bad_commands,
            auth_user: self.auth_user,
            auth_mech: self.auth_mech,
        })
    }

    // -- input processing --

    /// Process every complete command already buffered, corking the
    /// replies into one batch.
    async fn process_buffered(&mut self) -> Result<Flow, TransportError> {
        self.transport.cork();
        let flow = self.process_commands().await;
        let uncorked = self.transport.uncork().await;
        let flow = flow?;
        uncorked?;
        Ok(flow)
    }

    async fn process_commands(&mut self) -> Result<Flow, TransportError> {
        loop {
            let tag = match self.parser.read_word() {
                Ok(Some(tag)) => tag,
                Ok(None) => return Ok(Flow::NeedMore),
                Err(err) => return self.parse_failure("*", &err).await,
            };
            if tag.is_empty() || tag == "*" {
                match self.command_error("*").await? {
                    Flow::Next => continue,
                    flow => return Ok(flow),
                }
            }

            let name = match self.parser.read_word() {
                Ok(Some(name)) => name.to_ascii_uppercase(),
                Ok(None) => return Ok(Flow::NeedMore),
                Err(err) => return self.parse_failure(&tag, &err).await,
            };

            let flow = match name.as_str() {
                "CAPABILITY" => self.cmd_capability(&tag).await?,
                "NOOP" => self.cmd_noop(&tag).await?,
                "LOGOUT" => self.cmd_logout(&tag).await?,
                "STARTTLS" => self.cmd_starttls(&tag).await?,
                "LOGIN" => self.cmd_login(&tag).await?,
                "AUTHENTICATE" => self.cmd_authenticate(&tag).await?,
                _ => {
                    debug!(peer = %self.peer, command = %name, "unknown command");
                    self.command_error(&tag).await?
                }
            };
            match flow {
                Flow::Next => {}
                flow => return Ok(flow),
            }
        }
    }

    // -- commands --

    async fn cmd_capability(&mut self, tag: &str) -> Result<Flow, TransportError> {
        self.parser.reset();
        let caps = self.capability();
        self.transport.send_line(&format!("* CAPABILITY {caps}")).await?;
        self.transport
            .send_line(&format!("{tag} OK Capability completed."))
            .await?;
        Ok(Flow::Next)
    }

    async fn cmd_noop(&mut self, tag: &str) -> Result<Flow, TransportError> {
        self.parser.reset();
        self.transport
            .send_line(&format!("{tag} OK NOOP completed."))
            .await?;
        Ok(Flow::Next)
    }

    async fn cmd_logout(&mut self, tag: &str) -> Result<Flow, TransportError> {
        self.parser.reset();
        self.transport.send_line("* BYE Logging out").await?;
        self.transport
            .send_line(&format!("{tag} OK Logout completed."))
            .await?;
        self.transport.flush().await?;
        Ok(Flow::Exit(Exit::Closed {
            reason: Some("Disconnected: Logged out".to_string()),
        }))
    }

    async fn cmd_starttls(&mut self, tag: &str) -> Result<Flow, TransportError> {
        self.parser.reset();
        if self.tls {
            return self.tagged_bad(tag, "TLS is already active.").await;
        }
        if !self.settings.ssl_initialized() {
            return self.tagged_bad(tag, "TLS support isn't enabled.").await;
        }
        self.transport
            .send_line(&format!("{tag} OK Begin TLS negotiation now."))
            .await?;
        // The acknowledgement must be on the wire, in cleartext, before the
        // handshake starts. A failed flush kills the session before any
        // handshake byte.
        self.transport.flush().await?;
        Ok(Flow::Exit(Exit::Upgrade))
    }

    async fn cmd_login(&mut self, tag: &str) -> Result<Flow, TransportError> {
        let args = match self.parser.read_args(2) {
            Ok(Some(args)) => args,
            Ok(None) => return Ok(Flow::NeedMore),
            Err(err) => return self.parse_failure(tag, &err).await,
        };
        self.parser.reset();
        let (Some(user), Some(password)) = (
            args.first().and_then(Arg::as_str),
            args.get(1).and_then(Arg::as_str),
        ) else {
            return self.tagged_bad_counted(tag, "Invalid arguments.").await;
        };
        if self.plaintext_blocked() {
            return self
                .tagged_no(tag, "Plaintext authentication disabled.")
                .await;
        }
        let initial = plain_initial("", user, password);
        self.auth_user = Some(user.to_string());
        self.run_auth(tag, "PLAIN", Some(initial)).await
    }

    async fn cmd_authenticate(&mut self, tag: &str) -> Result<Flow, TransportError> {
        let args = match self.parser.read_args(2) {
            Ok(Some(args)) => args,
            Ok(None) => return Ok(Flow::NeedMore),
            Err(err) => return self.parse_failure(tag, &err).await,
        };
        self.parser.reset();
        let Some(mech) = args.first().and_then(Arg::as_str) else {
            return self.tagged_bad_counted(tag, "Invalid arguments.").await;
        };
        let mech = mech.to_ascii_uppercase();

        let initial = match args.get(1).map(|arg| arg.as_str()) {
            None => None,
            // "=" is the SASL-IR spelling of an empty initial response.
            Some(Some("=")) => Some(Vec::new()),
            Some(Some(encoded)) => match BASE64.decode(encoded.as_bytes()) {
                Ok(decoded) => Some(decoded),
                Err(_) => {
                    return self
                        .tagged_bad_counted(tag, "Invalid base64 data in initial response.")
                        .await;
                }
            },
            Some(None) => return self.tagged_bad_counted(tag, "Invalid arguments.").await,
        };

        let Some(info) = self
            .auth
            .mechanisms()
            .into_iter()
            .find(|m| m.name.eq_ignore_ascii_case(&mech))
        else {
            return self
                .tagged_no(tag, "Unsupported authentication mechanism.")
                .await;
        };
        if info.plaintext && self.plaintext_blocked() {
            return self
                .tagged_no(tag, "Plaintext authentication disabled.")
                .await;
        }
        self.run_auth(tag, &mech, initial).await
    }

    // -- auth exchange --

    /// One full attempt against the auth service, continuation rounds
    /// included. No regular commands are accepted until it resolves.
    async fn run_auth(
        &mut self,
        tag: &str,
        mech: &str,
        initial: Option<Vec<u8>>,
    ) -> Result<Flow, TransportError> {
        self.auth_mech = Some(mech.to_string());
        let mut attempt = self.auth.begin(AuthRequest {
            mechanism: mech.to_string(),
            initial,
            peer_ip: self.peer.ip(),
            local_ip: self.local.ip(),
            secured: self.secured,
            tls: self.tls,
        });

        loop {
            tokio::select! {
                notice = self.handle.control.recv() => {
                    let exit = self.notice_exit(notice).await;
                    return Ok(Flow::Exit(exit));
                }
                event = attempt.event() => match event {
                    AuthEvent::Continue(challenge) => {
                        self.transport
                            .send_line(&format!("+ {}", BASE64.encode(&challenge)))
                            .await?;
                        self.transport.flush().await?;
                        match self.read_continuation_line().await? {
                            AuthInput::Exit(exit) => return Ok(Flow::Exit(exit)),
                            AuthInput::Line(line) => {
                                if line == "*" {
                                    drop(attempt);
                                    return self.tagged_bad(tag, "Authentication aborted.").await;
                                }
                                match BASE64.decode(line.as_bytes()) {
                                    Ok(data) => attempt.respond(data).await,
                                    Err(_) => {
                                        drop(attempt);
                                        return self
                                            .tagged_bad(
                                                tag,
                                                "Invalid base64 data in continued response",
                                            )
                                            .await;
                                    }
                                }
                            }
                        }
                    }
                    AuthEvent::Done(verdict) => return self.finish_auth(tag, verdict).await,
                },
            }
        }
    }

    async fn finish_auth(
        &mut self,
        tag: &str,
        verdict: AuthVerdict,
    ) -> Result<Flow, TransportError> {
        match verdict {
            AuthVerdict::Success { user, ticket } => {
                info!(peer = %self.peer, user = %user, "Login");
                self.auth_user = Some(user.clone());
                self.transport
                    .send_line(&format!("{tag} OK Logged in."))
                    .await?;
                self.transport.flush().await?;
                let mechanism = self
                    .auth_mech
                    .clone()
                    .unwrap_or_else(|| "PLAIN".to_string());
                Ok(Flow::Exit(Exit::Handoff(Identity {
                    user,
                    mechanism,
                    ticket,
                })))
            }
            AuthVerdict::Failed(reason) => {
                debug!(peer = %self.peer, "auth failed: {reason}");
                self.transport.send_line(&format!("{tag} NO {reason}")).await?;
                Ok(Flow::Next)
            }
            AuthVerdict::InternalError => {
                self.transport
                    .send_line(
                        "* BYE Internal login failure. Refer to server log for more information.",
                    )
                    .await?;
                self.transport.flush().await?;
                Ok(Flow::Exit(Exit::Closed {
                    reason: Some("Disconnected: Internal login failure".to_string()),
                }))
            }
        }
    }

    /// Read one raw line while a SASL exchange is outstanding.
    async fn read_continuation_line(&mut self) -> Result<AuthInput, TransportError> {
        loop {
            match self.parser.read_line() {
                Ok(Some(line)) => return Ok(AuthInput::Line(line)),
                Ok(None) => {}
                Err(err) => {
                    self.transport.send_line(&format!("* BYE {}", err.message)).await?;
                    self.transport.flush().await?;
                    return Ok(AuthInput::Exit(Exit::Closed {
                        reason: Some(format!("Disconnected: {}", err.message)),
                    }));
                }
            }
            tokio::select! {
                notice = self.handle.control.recv() => {
                    let exit = self.notice_exit(notice).await;
                    return Ok(AuthInput::Exit(exit));
                }
                read = self.transport.read_input() => {
                    read?;
                    self.handle.touch();
                    let input = self.transport.take_input();
                    self.parser.feed(&input);
                }
            }
        }
    }

    /// Park until the auth daemon link is back. Input is not read while
    /// parked, so pipelined bytes wait in the socket.
    async fn wait_for_auth_daemon(&mut self) -> Result<Flow, TransportError> {
        self.transport
            .send_line("* OK Waiting for authentication process to respond..")
            .await?;
        self.transport.flush().await?;
        let mut watch = self.auth.connection_watch();
        loop {
            if *watch.borrow_and_update() {
                return Ok(Flow::Next);
            }
            tokio::select! {
                notice = self.handle.control.recv() => {
                    let exit = self.notice_exit(notice).await;
                    return Ok(Flow::Exit(exit));
                }
                changed = watch.changed() => {
                    if changed.is_err() {
                        // Broker gone for good; proceed and let the attempt
                        // surface the internal error.
                        return Ok(Flow::Next);
                    }
                }
            }
        }
    }

    // -- replies and errors --

    fn plaintext_blocked(&self) -> bool {
        self.settings.disable_plaintext_auth && !self.secured
    }

    async fn tagged_bad(&mut self, tag: &str, message: &str) -> Result<Flow, TransportError> {
        self.transport
            .send_line(&format!("{tag} BAD {message}"))
            .await?;
        Ok(Flow::Next)
    }

    async fn tagged_no(&mut self, tag: &str, message: &str) -> Result<Flow, TransportError> {
        self.transport
            .send_line(&format!("{tag} NO {message}"))
            .await?;
        Ok(Flow::Next)
    }

    /// Generic invalid-command reply, counted against the flood limit.
    async fn command_error(&mut self, tag: &str) -> Result<Flow, TransportError> {
        self.tagged_bad_counted(tag, "Error in IMAP command received by server.")
            .await
    }

    /// Tagged `BAD` that counts toward the bad-command limit. The limit
    /// firing turns the reply into a disconnect.
    async fn tagged_bad_counted(
        &mut self,
        tag: &str,
        message: &str,
    ) -> Result<Flow, TransportError> {
        self.parser.reset();
        self.transport
            .send_line(&format!("{tag} BAD {message}"))
            .await?;
        self.bad_commands += 1;
        if self.bad_commands >= MAX_BAD_COMMANDS {
            self.transport
                .send_line("* BYE Too many invalid IMAP commands.")
                .await?;
            self.transport.flush().await?;
            return Ok(Flow::Exit(Exit::Closed {
                reason: Some("Disconnected: Too many invalid commands".to_string()),
            }));
        }
        Ok(Flow::Next)
    }

    async fn parse_failure(
        &mut self,
        tag: &str,
        err: &ParseError,
    ) -> Result<Flow, TransportError> {
        if err.fatal {
            self.transport
                .send_line(&format!("* BYE {}", err.message))
                .await?;
            self.transport.flush().await?;
            return Ok(Flow::Exit(Exit::Closed {
                reason: Some(format!("Disconnected: {}", err.message)),
            }));
        }
        self.tagged_bad_counted(tag, &err.message).await
    }

    async fn notice_exit(&mut self, notice: Option<DisconnectNotice>) -> Exit {
        let notice = notice.unwrap_or(DisconnectNotice {
            line: None,
            reason: None,
        });
        if let Some(line) = notice.line {
            let _ = self.transport.send_line(line).await;
            let _ = self.transport.flush().await;
        }
        Exit::Closed {
            reason: notice.reason.map(str::to_string),
        }
    }

    fn finish(&mut self, exit: Exit) -> RunOutcome {
        match exit {
            Exit::Closed { reason } => {
                if let Some(reason) = reason {
                    info!(peer = %self.peer, "{reason}");
                }
                RunOutcome::Closed
            }
            Exit::Upgrade => RunOutcome::Upgrade,
            Exit::Handoff(identity) => RunOutcome::Handoff(identity),
        }
    }

    async fn finish_transport_error(&mut self, err: TransportError) -> RunOutcome {
        match err {
            TransportError::Closed => info!(peer = %self.peer, "Disconnected"),
            TransportError::InputBufferFull => {
                let _ = self
                    .transport
                    .send_line("* BYE Input buffer full, aborting")
                    .await;
                let _ = self.transport.flush().await;
                info!(peer = %self.peer, "Disconnected: Input buffer full");
            }
            TransportError::OutputBufferFull => {
                info!(peer = %self.peer, "Disconnected: Transmit buffer full");
            }
            TransportError::Io(err) => {
                info!(peer = %self.peer, "Disconnected: {err}");
            }
        }
        RunOutcome::Closed
    }
}
