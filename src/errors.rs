//! Error types for the connection engine.

use std::io;

use thiserror::Error;

/// Boxed error used at the pluggable seams (codec, framer, handlers).
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Failure to decode an inbound payload, with access to the raw bytes.
///
/// The display form carries only the codec's description; the payload is
/// reachable solely through [`UnpackError::raw`] so it never leaks into
/// logs by accident.
#[derive(Debug, Error)]
#[error("failed to unpack inbound message: {source}")]
pub struct UnpackError {
    /// Underlying codec error.
    #[source]
    pub source: BoxError,
    /// The raw payload that failed to unpack.
    pub raw: Vec<u8>,
}

/// Errors surfaced by connection operations and the error handler.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// The connection is closed or closing.
    #[error("connection closed")]
    Closed,
    /// No reply arrived within the configured send timeout.
    #[error("message send timeout")]
    SendTimeout,
    /// The connection has not been established yet.
    #[error("connection not established")]
    NotConnected,
    /// Dialing the remote address failed.
    #[error("connecting to {addr}")]
    Connect {
        /// Address that was dialed.
        addr: String,
        /// Dial failure.
        #[source]
        source: io::Error,
    },
    /// The TLS handshake failed or the server name was invalid.
    #[error("tls handshake with {addr}")]
    Tls {
        /// Address that was dialed.
        addr: String,
        /// Handshake failure.
        #[source]
        source: io::Error,
    },
    /// Packing the outbound message failed.
    #[error("packing message")]
    Pack(#[source] BoxError),
    /// Encoding the outbound length header failed.
    #[error("writing message length header")]
    Frame(#[source] io::Error),
    /// The correlator field was missing or empty.
    #[error("correlator field {field} is missing or empty")]
    MissingCorrelator {
        /// Field index the correlator was read from.
        field: u32,
    },
    /// The post-connect hook rejected the connection.
    #[error("on-connect callback")]
    OnConnect(#[source] BoxError),
    /// Writing a frame into the transport failed.
    #[error("failed to write message into connection")]
    Write(#[source] io::Error),
    /// Reading an inbound length header failed.
    #[error("failed to read message length")]
    ReadLength(#[source] io::Error),
    /// Reading an inbound payload failed.
    #[error("failed to read message from connection")]
    Read(#[source] io::Error),
    /// An inbound length header exceeded the configured maximum.
    #[error("inbound frame of {length} bytes exceeds limit of {limit}")]
    FrameTooLarge {
        /// Length announced by the header.
        length: usize,
        /// Configured maximum payload size.
        limit: usize,
    },
    /// A response arrived with no pending request to match it.
    #[error("no pending request for correlator {0}")]
    Unmatched(String),
    /// An inbound payload failed to unpack.
    #[error(transparent)]
    Unpack(#[from] UnpackError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unpack_display_omits_payload_bytes() {
        let err = UnpackError {
            source: "field 2 truncated".into(),
            raw: b"\xde\xad\xbe\xef".to_vec(),
        };

        let rendered = err.to_string();
        assert_eq!(rendered, "failed to unpack inbound message: field 2 truncated");
        assert_eq!(err.raw, b"\xde\xad\xbe\xef");
    }

    #[test]
    fn sentinels_render_stable_messages() {
        assert_eq!(ConnectionError::Closed.to_string(), "connection closed");
        assert_eq!(
            ConnectionError::SendTimeout.to_string(),
            "message send timeout"
        );
    }
}
