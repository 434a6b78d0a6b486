//! In-process collaborators for integration testing
//!
//! The server under test is real; its two out-of-process collaborators are
//! faked here:
//!
//! - `StubAuth` -- rule-based auth service (password "secret" wins)
//! - the backend master is just the receiver half of `MasterClient`
//!
//! Plus TLS helpers: a self-signed certificate on disk for the server and
//! a permissive rustls client config for the test side of STARTTLS.

#![allow(dead_code)]

use mailgate::auth::{
    AuthAttempt, AuthEvent, AuthRequest, AuthService, AuthVerdict, Mechanism,
};
use mailgate::handoff::{HandoffRequest, MasterClient};
use mailgate::{Server, Settings};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, watch};

/// Rule-based auth service double: PLAIN attempts with password "secret"
/// succeed as the supplied user, everything else fails. The connected flag
/// is test-controlled.
pub struct StubAuth {
    connected_tx: watch::Sender<bool>,
    connected_rx: watch::Receiver<bool>,
    mechs: Vec<Mechanism>,
}

impl StubAuth {
    pub fn new(connected: bool) -> Self {
        let (connected_tx, connected_rx) = watch::channel(connected);
        Self {
            connected_tx,
            connected_rx,
            mechs: vec![Mechanism::new("PLAIN", true)],
        }
    }

    pub fn set_connected(&self, up: bool) {
        let _ = self.connected_tx.send(up);
    }
}

impl AuthService for StubAuth {
    fn is_connected(&self) -> bool {
        *self.connected_rx.borrow()
    }

    fn connection_watch(&self) -> watch::Receiver<bool> {
        self.connected_rx.clone()
    }

    fn mechanisms(&self) -> Vec<Mechanism> {
        self.mechs.clone()
    }

    fn begin(&self, request: AuthRequest) -> AuthAttempt {
        let (events_tx, events_rx) = mpsc::channel(8);
        let (outbound_tx, outbound_rx) = mpsc::channel(8);
        let _ = events_tx.try_send(AuthEvent::Done(evaluate(&request)));
        // Keep both channel ends alive for the attempt's lifetime.
        std::mem::forget(events_tx);
        std::mem::forget(outbound_rx);
        AuthAttempt::from_channels(events_rx, outbound_tx, Duration::from_secs(5))
    }
}

/// PLAIN payload is NUL authzid NUL authcid NUL password.
fn evaluate(request: &AuthRequest) -> AuthVerdict {
    let Some(initial) = &request.initial else {
        return AuthVerdict::Failed("Authentication failed.".to_string());
    };
    let mut parts = initial.split(|&b| b == 0);
    let (Some(_authzid), Some(user), Some(password)) =
        (parts.next(), parts.next(), parts.next())
    else {
        return AuthVerdict::Failed("Authentication failed.".to_string());
    };
    if password == b"secret" {
        AuthVerdict::Success {
            user: String::from_utf8_lossy(user).into_owned(),
            ticket: "ticket-1".to_string(),
        }
    } else {
        AuthVerdict::Failed("Authentication failed.".to_string())
    }
}

/// Start a server on an ephemeral port with the given auth double.
/// Returns the handoff request stream the "backend master" would consume.
pub async fn start_server(
    settings: Settings,
    auth: Arc<dyn AuthService>,
) -> (Arc<Server>, mpsc::Receiver<HandoffRequest>) {
    let (master, handoffs) = MasterClient::new(16);
    let server = Server::start(settings, auth, master)
        .await
        .expect("start server");
    (server, handoffs)
}

/// Settings for a cleartext test server on an ephemeral localhost port.
pub fn test_settings() -> Settings {
    Settings {
        listen: "127.0.0.1:0".parse().unwrap(),
        greeting: "ready".to_string(),
        disable_plaintext_auth: false,
        ..Settings::default()
    }
}

// ── TLS helpers ────────────────────────────────────────────────────

static CERT_SEQ: AtomicU32 = AtomicU32::new(0);

/// Self-signed certificate written to disk for the server to load.
pub struct TestCert {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

impl TestCert {
    pub fn generate() -> Self {
        let cert = rcgen::generate_simple_self_signed(vec!["127.0.0.1".to_string()])
            .expect("generate self-signed cert");
        let dir = std::env::temp_dir().join(format!(
            "mailgate-test-{}-{}",
            std::process::id(),
            CERT_SEQ.fetch_add(1, Ordering::Relaxed)
        ));
        std::fs::create_dir_all(&dir).expect("create cert dir");
        let cert_path = dir.join("cert.pem");
        let key_path = dir.join("key.pem");
        std::fs::write(&cert_path, cert.cert.pem()).expect("write cert");
        std::fs::write(&key_path, cert.key_pair.serialize_pem()).expect("write key");
        Self {
            cert_path,
            key_path,
        }
    }
}

/// Client TLS config that accepts any certificate (the server uses a
/// self-signed one).
pub fn tls_client_connector() -> tokio_rustls::TlsConnector {
    let config = rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyCert))
        .with_no_client_auth();
    tokio_rustls::TlsConnector::from(Arc::new(config))
}

pub fn install_crypto_provider() {
    mailgate::tls::install_crypto_provider();
}

/// Certificate verifier that accepts all certificates
/// (for the test server's self-signed cert).
#[derive(Debug)]
struct AcceptAnyCert;

impl rustls::client::danger::ServerCertVerifier for AcceptAnyCert {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::RSA_PKCS1_SHA384,
            rustls::SignatureScheme::RSA_PKCS1_SHA512,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            rustls::SignatureScheme::ECDSA_NISTP521_SHA512,
            rustls::SignatureScheme::RSA_PSS_SHA256,
            rustls::SignatureScheme::RSA_PSS_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA512,
            rustls::SignatureScheme::ED25519,
        ]
    }
}

// ── Wire helpers ───────────────────────────────────────────────────

/// Read one CRLF-terminated line, without the terminator.
pub async fn read_line<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut BufReader<S>,
) -> Option<String> {
    let mut line = String::new();
    match stream.read_line(&mut line).await {
        Ok(0) | Err(_) => None,
        Ok(_) => Some(line.trim_end_matches(['\r', '\n']).to_string()),
    }
}

/// Write a raw command line, CRLF appended.
pub async fn write_line<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut BufReader<S>,
    line: &str,
) -> std::io::Result<()> {
    stream.get_mut().write_all(line.as_bytes()).await?;
    stream.get_mut().write_all(b"\r\n").await?;
    stream.get_mut().flush().await
}
