//! Transport boundary: dialing, TLS, and the byte-duplex trait object.
//!
//! The engine drives any stream that is readable, writable and closable;
//! plain TCP and TLS-over-TCP are dialed here, while adopted streams (for
//! server-side use) enter through `Connection::new_from`.

use std::{io, sync::Arc, time::Duration};

use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpStream,
    time::timeout,
};
use tokio_rustls::{
    TlsConnector,
    rustls::{ClientConfig, pki_types::ServerName},
};
use tracing::debug;

use crate::errors::ConnectionError;

/// Byte-duplex stream the engine can drive.
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> Transport for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

/// Owned transport handle.
pub type BoxedTransport = Box<dyn Transport>;

/// TLS parameters for outbound connections.
#[derive(Clone)]
pub struct TlsOptions {
    /// Client configuration: trust roots, client auth, ALPN.
    pub client_config: Arc<ClientConfig>,
    /// Server name for SNI and certificate validation. Defaults to the
    /// host part of the dial address.
    pub server_name: Option<String>,
}

/// Dial `addr` within `connect_timeout`, wrapping in TLS when configured.
pub(crate) async fn dial(
    addr: &str,
    connect_timeout: Duration,
    tls: Option<&TlsOptions>,
) -> Result<BoxedTransport, ConnectionError> {
    let stream = timeout(connect_timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| connect_error(addr, timed_out("connect timed out")))?
        .map_err(|e| connect_error(addr, e))?;
    stream.set_nodelay(true).map_err(|e| connect_error(addr, e))?;

    let Some(tls) = tls else {
        debug!(addr, "established tcp connection");
        return Ok(Box::new(stream));
    };

    let host = tls
        .server_name
        .clone()
        .unwrap_or_else(|| host_of(addr).to_owned());
    let server_name = ServerName::try_from(host)
        .map_err(|e| tls_error(addr, io::Error::new(io::ErrorKind::InvalidInput, e)))?;
    let connector = TlsConnector::from(Arc::clone(&tls.client_config));
    let stream = timeout(connect_timeout, connector.connect(server_name, stream))
        .await
        .map_err(|_| tls_error(addr, timed_out("tls handshake timed out")))?
        .map_err(|e| tls_error(addr, e))?;
    debug!(addr, "established tls connection");
    Ok(Box::new(stream))
}

/// Split `host:port` into its host part for SNI.
fn host_of(addr: &str) -> &str { addr.rsplit_once(':').map_or(addr, |(host, _)| host) }

fn timed_out(context: &str) -> io::Error {
    io::Error::new(io::ErrorKind::TimedOut, context.to_owned())
}

fn connect_error(addr: &str, source: io::Error) -> ConnectionError {
    ConnectionError::Connect { addr: addr.to_owned(), source }
}

fn tls_error(addr: &str, source: io::Error) -> ConnectionError {
    ConnectionError::Tls { addr: addr.to_owned(), source }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case::host_and_port("acquirer.example.com:8583", "acquirer.example.com")]
    #[case::ip_and_port("127.0.0.1:8583", "127.0.0.1")]
    #[case::bare_host("acquirer.example.com", "acquirer.example.com")]
    fn host_part_feeds_sni(#[case] addr: &str, #[case] expected: &str) {
        assert_eq!(host_of(addr), expected);
    }
}
