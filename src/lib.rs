//! Multiplexing connection engine for ISO 8583 endpoints.
//!
//! The crate drives a single length-framed byte stream (TCP or
//! TLS-over-TCP) shared by many concurrent callers. Outbound requests are
//! correlated to inbound responses through a message field (field 11, the
//! Systems Trace Audit Number, by default); unsolicited traffic and
//! lifecycle events are surfaced through user-supplied handlers.
//!
//! Message encoding stays behind the [`MessageCodec`] seam and length
//! headers behind [`LengthFramer`], so the engine carries no opinion about
//! any particular ISO 8583 dialect or header format.

pub mod codec;
pub mod connection;
pub mod errors;
pub mod framing;
mod inflight;
pub mod options;
mod pending;
pub mod transport;

pub use codec::{MessageCodec, is_response};
pub use connection::{Connection, Status};
pub use errors::{BoxError, ConnectionError, UnpackError};
pub use framing::{AsciiFramer, BcdFramer, BinaryFramer, LengthFramer};
pub use options::{
    ConnectionHandler,
    ErrorHandler,
    MessageHandler,
    OnConnect,
    Options,
};
pub use transport::{BoxedTransport, TlsOptions, Transport};
