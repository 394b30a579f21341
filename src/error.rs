use std::path::PathBuf;

use thiserror::Error;

/// Faults that end a single peer connection. They never escape the
/// connection task that hit them.
#[derive(Debug, Error)]
pub enum PeerError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("connection closed")]
    ConnectionClosed,

    /// Wrong length, wrong header, or an id this connection may not claim.
    #[error("invalid handshake")]
    InvalidHandshake,

    #[error("handshake timed out")]
    HandshakeTimeout,

    /// The roster id is already served by another connection.
    #[error("peer {0} is already connected")]
    AlreadyConnected(u32),

    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    #[error("unknown message type {0}")]
    UnknownMessageType(u8),
}

/// Faults in the payload of an otherwise well-framed message. The message
/// is dropped and the connection keeps going.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PayloadError {
    #[error("{kind} payload must be {expected} bytes, got {actual}")]
    BadLength {
        kind: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("piece index {index} out of range for {pieces} pieces")]
    IndexOutOfRange { index: u32, pieces: usize },

    #[error("piece {index} should be {expected} bytes, got {actual}")]
    BadPieceLength {
        index: u32,
        expected: usize,
        actual: usize,
    },

    #[error("requested piece {0} is not held locally")]
    PieceNotHeld(u32),
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("piece index {index} out of range for {size} pieces")]
pub struct PieceIndexError {
    pub index: usize,
    pub size: usize,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{file}:{line}: {message}")]
    Parse {
        file: &'static str,
        line: usize,
        message: String,
    },

    #[error("{file} is missing required key {key}")]
    MissingKey { file: &'static str, key: &'static str },

    #[error("peer {0} is not listed in the roster")]
    UnknownPeer(u32),

    #[error("invalid value for {key}: {message}")]
    InvalidValue { key: &'static str, message: String },
}

/// Startup faults. Any of these stops the process before the swarm starts.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to bind listening socket on port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("backing file {path:?}: {source}")]
    Storage {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}
