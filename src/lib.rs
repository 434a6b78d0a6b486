#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::missing_errors_doc, clippy::missing_panics_doc)]

//! Pre-authentication IMAP front-end
//!
//! mailgate owns client connections from accept until login: it speaks the
//! pre-login subset of IMAP4rev1, negotiates STARTTLS, brokers SASL and
//! LOGIN exchanges with an out-of-process auth service, and hands each
//! authenticated connection plus its identity to a backend master.

pub mod auth;
pub mod config;
pub mod error;
pub mod handoff;
pub mod listener;
pub mod parser;
pub mod registry;
pub mod session;
pub mod tls;
pub mod transport;

pub use config::Settings;
pub use error::{Error, Result};
pub use listener::Server;
