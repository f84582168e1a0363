//! Server-level error types

use std::io;

use thiserror::Error;

/// Errors fatal to server startup. Anything here maps to a non-zero exit.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to build TLS configuration: {0}")]
    Tls(#[from] rustls::Error),

    #[error("invalid certificate or key material: {0}")]
    Pem(String),

    #[error("failed to listen on port {port}: {source}")]
    Listen { port: u16, source: io::Error },

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Errors fatal to one HTTP/2 session. The owning worker drops the session
/// and all of its streams; other sessions are unaffected.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    #[error("negotiated protocol is not h2")]
    AlpnMismatch,

    #[error("codec error: {0}")]
    Codec(#[from] crate::h2::CodecError),

    #[error("settings acknowledgement timed out")]
    SettingsTimeout,

    #[error("peer closed the connection")]
    Closed,

    #[error(transparent)]
    Io(#[from] io::Error),
}
