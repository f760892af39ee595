//! Error types for the Nexus streamer.

use thiserror::Error;

use super::codec::CodecError;

/// Errors raised while establishing or using the relay connection.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("Failed to connect to {host}:{port}: {source}")]
    Connect {
        host: String,
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("TLS handshake with {host} failed: {source}")]
    Tls {
        host: String,
        #[source]
        source: native_tls::Error,
    },

    #[error("Not connected")]
    NotConnected,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised by the encoder subprocess pipe.
#[derive(Debug, Error)]
pub enum MediaSinkError {
    #[error("Failed to spawn encoder {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Encoder input is closed")]
    Closed,

    #[error("Encoder is not consuming its input")]
    Stalled,
}

/// Errors returned to callers of the streamer handle.
#[derive(Debug, Error)]
pub enum StreamerError {
    #[error("A playback session is already active")]
    SessionActive,

    #[error("No stream has been prepared")]
    NotPrepared,

    #[error("Stream request has no video endpoint")]
    NoVideoEndpoint,

    #[error("Could not determine local address: {0}")]
    LocalAddress(#[source] std::io::Error),

    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("Media sink error: {0}")]
    MediaSink(#[from] MediaSinkError),

    #[error("Frame encoding error: {0}")]
    Codec(#[from] CodecError),

    #[error("Streamer task has shut down")]
    Shutdown,
}
