//! Server configuration

use crate::error::{Error, Result};
use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Longest command line the parser will accumulate, in bytes.
pub const MAX_IMAP_LINE: usize = 8192;

/// Input buffer ceiling for a single connection.
pub const MAX_INBUF_SIZE: usize = 4096;

/// Output buffer ceiling for a single connection.
pub const MAX_OUTBUF_SIZE: usize = 4096;

/// Invalid commands tolerated before the client is disconnected.
pub const MAX_BAD_COMMANDS: u32 = 10;

/// Sessions culled per eviction pass when the connection table is full.
pub const DESTROY_OLDEST_COUNT: usize = 16;

/// Granularity of the registry's idle sweep.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Process-wide settings snapshot, read once at startup.
///
/// Sessions only ever see a shared reference; nothing here is mutated
/// after `from_env()` returns.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Cleartext listener address.
    pub listen: SocketAddr,
    /// Implicit-TLS listener address, bound only when certificates are
    /// configured.
    pub tls_listen: Option<SocketAddr>,
    /// PEM certificate chain and private key for STARTTLS / imaps.
    pub ssl_cert: Option<PathBuf>,
    pub ssl_key: Option<PathBuf>,
    /// Refuse LOGIN and plaintext SASL mechanisms on unsecured links.
    pub disable_plaintext_auth: bool,
    /// Cap on concurrently connected pre-login sessions. 0 = unlimited.
    pub max_logging_users: usize,
    /// Human text appended to the `* OK` greeting line.
    pub greeting: String,
    /// Embed `[CAPABILITY ...]` in the greeting.
    pub greeting_capability: bool,
    /// Base capability atoms, before STARTTLS/LOGINDISABLED/AUTH= are
    /// appended.
    pub capability_string: String,
    /// Include peer and user detail in per-session log spans.
    pub verbose_proctitle: bool,
    /// Serve a single connection and return instead of looping on accept.
    pub process_per_connection: bool,
    /// Disconnect after this long without client input.
    pub idle_timeout: Duration,
    /// Ceiling on one auth service attempt. Must exceed `idle_timeout` so
    /// the sweep never reaps a session mid-attempt.
    pub auth_timeout: Duration,
    /// Address of the out-of-process auth daemon.
    pub auth_addr: SocketAddr,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:143".parse().unwrap(),
            tls_listen: None,
            ssl_cert: None,
            ssl_key: None,
            disable_plaintext_auth: true,
            max_logging_users: 256,
            greeting: "mailgate ready.".to_string(),
            greeting_capability: true,
            capability_string: "IMAP4rev1".to_string(),
            verbose_proctitle: false,
            process_per_connection: false,
            idle_timeout: Duration::from_secs(60),
            auth_timeout: Duration::from_secs(180),
            auth_addr: "127.0.0.1:12100".parse().unwrap(),
        }
    }
}

impl Settings {
    /// Load settings from environment variables.
    ///
    /// Reads from `.env` if present. All variables are optional:
    /// - `MAILGATE_LISTEN` (default `0.0.0.0:143`)
    /// - `MAILGATE_TLS_LISTEN` (default unset; requires cert + key)
    /// - `MAILGATE_SSL_CERT`, `MAILGATE_SSL_KEY` (PEM paths)
    /// - `MAILGATE_DISABLE_PLAINTEXT_AUTH` (default `true`)
    /// - `MAILGATE_MAX_LOGGING_USERS` (default `256`, `0` = unlimited)
    /// - `MAILGATE_GREETING`, `MAILGATE_GREETING_CAPABILITY`
    /// - `MAILGATE_CAPABILITY_STRING` (default `IMAP4rev1`)
    /// - `MAILGATE_VERBOSE_PROCTITLE`, `MAILGATE_PROCESS_PER_CONNECTION`
    /// - `MAILGATE_AUTH_ADDR` (default `127.0.0.1:12100`)
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        let defaults = Self::default();

        Ok(Self {
            listen: parse_var("MAILGATE_LISTEN", defaults.listen)?,
            tls_listen: opt_var("MAILGATE_TLS_LISTEN")
                .map(|v| parse_value("MAILGATE_TLS_LISTEN", &v))
                .transpose()?,
            ssl_cert: opt_var("MAILGATE_SSL_CERT").map(PathBuf::from),
            ssl_key: opt_var("MAILGATE_SSL_KEY").map(PathBuf::from),
            disable_plaintext_auth: bool_var(
                "MAILGATE_DISABLE_PLAINTEXT_AUTH",
                defaults.disable_plaintext_auth,
            )?,
            max_logging_users: parse_var(
                "MAILGATE_MAX_LOGGING_USERS",
                defaults.max_logging_users,
            )?,
            greeting: opt_var("MAILGATE_GREETING").unwrap_or(defaults.greeting),
            greeting_capability: bool_var(
                "MAILGATE_GREETING_CAPABILITY",
                defaults.greeting_capability,
            )?,
            capability_string: opt_var("MAILGATE_CAPABILITY_STRING")
                .unwrap_or(defaults.capability_string),
            verbose_proctitle: bool_var("MAILGATE_VERBOSE_PROCTITLE", defaults.verbose_proctitle)?,
            process_per_connection: bool_var(
                "MAILGATE_PROCESS_PER_CONNECTION",
                defaults.process_per_connection,
            )?,
            idle_timeout: defaults.idle_timeout,
            auth_timeout: defaults.auth_timeout,
            auth_addr: parse_var("MAILGATE_AUTH_ADDR", defaults.auth_addr)?,
        })
    }

    /// Whether TLS material is configured; gates STARTTLS advertisement.
    #[must_use]
    pub const fn ssl_initialized(&self) -> bool {
        self.ssl_cert.is_some() && self.ssl_key.is_some()
    }
}

fn opt_var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.is_empty())
}

fn parse_var<T: std::str::FromStr>(name: &str, default: T) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    opt_var(name).map_or(Ok(default), |v| parse_value(name, &v))
}

fn parse_value<T: std::str::FromStr>(name: &str, value: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value
        .parse()
        .map_err(|e| Error::Config(format!("Invalid {name}: {e}")))
}

fn bool_var(name: &str, default: bool) -> Result<bool> {
    match opt_var(name).as_deref() {
        None => Ok(default),
        Some("1" | "true" | "yes") => Ok(true),
        Some("0" | "false" | "no") => Ok(false),
        Some(other) => Err(Error::Config(format!("Invalid {name}: {other}"))),
    }
}
