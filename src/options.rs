//! Connection configuration and event handlers.
//!
//! Handlers are fire-and-forget: the engine spawns them as background
//! tasks and never joins them, so a handler may block, or even call back
//! into the connection, without wedging the loops. The one exception is
//! the on-connect hook, which is awaited and may veto the connection.

use std::{sync::Arc, time::Duration};

use futures_util::future::BoxFuture;

use crate::{
    codec::MessageCodec,
    connection::Connection,
    errors::{BoxError, ConnectionError},
    transport::TlsOptions,
};

/// Default dial timeout.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Default per-call send timeout.
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(30);
/// Default writer idle period between ping events.
pub const DEFAULT_IDLE_TIME: Duration = Duration::from_secs(5);
/// Default inbound inactivity period before a read-timeout event.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(60);
/// Default maximum accepted inbound payload size.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 1024 * 1024; // 1 MiB
/// Field 11, the Systems Trace Audit Number.
pub const DEFAULT_CORRELATOR_FIELD: u32 = 11;

/// Hook awaited after the transport is established; an error closes the
/// connection and fails the connect call.
pub type OnConnect<C> =
    Arc<dyn Fn(Connection<C>) -> BoxFuture<'static, Result<(), BoxError>> + Send + Sync>;

/// Fire-and-forget hook receiving the connection.
pub type ConnectionHandler<C> =
    Arc<dyn Fn(Connection<C>) -> BoxFuture<'static, ()> + Send + Sync>;

/// Fire-and-forget hook receiving an inbound message.
pub type MessageHandler<C> = Arc<
    dyn Fn(Connection<C>, <C as MessageCodec>::Message) -> BoxFuture<'static, ()>
        + Send
        + Sync,
>;

/// Fire-and-forget hook receiving a connection error.
pub type ErrorHandler =
    Arc<dyn Fn(ConnectionError) -> BoxFuture<'static, ()> + Send + Sync>;

/// Configuration bundle for a connection.
pub struct Options<C: MessageCodec> {
    pub(crate) connect_timeout: Duration,
    pub(crate) send_timeout: Duration,
    pub(crate) idle_time: Duration,
    pub(crate) read_timeout: Duration,
    pub(crate) max_frame_size: usize,
    pub(crate) correlator_field: u32,
    pub(crate) tls: Option<TlsOptions>,
    pub(crate) on_connect: Option<OnConnect<C>>,
    pub(crate) connection_established: Option<ConnectionHandler<C>>,
    pub(crate) connection_closed: Vec<ConnectionHandler<C>>,
    pub(crate) error_handler: Option<ErrorHandler>,
    pub(crate) ping_handler: Option<ConnectionHandler<C>>,
    pub(crate) read_timeout_handler: Option<ConnectionHandler<C>>,
    pub(crate) inbound_message_handler: Option<MessageHandler<C>>,
}

impl<C: MessageCodec> Default for Options<C> {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            send_timeout: DEFAULT_SEND_TIMEOUT,
            idle_time: DEFAULT_IDLE_TIME,
            read_timeout: DEFAULT_READ_TIMEOUT,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            correlator_field: DEFAULT_CORRELATOR_FIELD,
            tls: None,
            on_connect: None,
            connection_established: None,
            connection_closed: Vec::new(),
            error_handler: None,
            ping_handler: None,
            read_timeout_handler: None,
            inbound_message_handler: None,
        }
    }
}

impl<C: MessageCodec> Options<C> {
    /// Create the default configuration.
    #[must_use]
    pub fn new() -> Self { Self::default() }

    /// Override the dial timeout.
    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Override the per-call send timeout.
    #[must_use]
    pub fn with_send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = timeout;
        self
    }

    /// Override the writer idle period between ping events.
    #[must_use]
    pub fn with_idle_time(mut self, idle_time: Duration) -> Self {
        self.idle_time = idle_time;
        self
    }

    /// Override the inbound inactivity period before a read-timeout event.
    #[must_use]
    pub fn with_read_timeout(mut self, read_timeout: Duration) -> Self {
        self.read_timeout = read_timeout;
        self
    }

    /// Override the maximum accepted inbound payload size.
    ///
    /// A length header announcing more than this is treated as a framing
    /// failure and tears the connection down.
    #[must_use]
    pub fn with_max_frame_size(mut self, max_frame_size: usize) -> Self {
        self.max_frame_size = max_frame_size;
        self
    }

    /// Override the field index used to correlate responses to requests.
    #[must_use]
    pub fn with_correlator_field(mut self, field: u32) -> Self {
        self.correlator_field = field;
        self
    }

    /// Wrap the dialed TCP stream in TLS.
    #[must_use]
    pub fn with_tls(mut self, tls: TlsOptions) -> Self {
        self.tls = Some(tls);
        self
    }

    /// Hook awaited after connect; an error closes the connection and is
    /// returned from the connect call.
    #[must_use]
    pub fn with_on_connect<F>(mut self, hook: F) -> Self
    where
        F: Fn(Connection<C>) -> BoxFuture<'static, Result<(), BoxError>>
            + Send
            + Sync
            + 'static,
    {
        self.on_connect = Some(Arc::new(hook));
        self
    }

    /// Handler fired in the background once connect succeeds.
    #[must_use]
    pub fn on_connection_established<F>(mut self, handler: F) -> Self
    where
        F: Fn(Connection<C>) -> BoxFuture<'static, ()> + Send + Sync + 'static,
    {
        self.connection_established = Some(Arc::new(handler));
        self
    }

    /// Add a handler fired in the background when the connection fails
    /// and is torn down.
    #[must_use]
    pub fn on_connection_closed<F>(mut self, handler: F) -> Self
    where
        F: Fn(Connection<C>) -> BoxFuture<'static, ()> + Send + Sync + 'static,
    {
        self.connection_closed.push(Arc::new(handler));
        self
    }

    /// Handler fired in the background for recoverable and fatal errors.
    #[must_use]
    pub fn on_error<F>(mut self, handler: F) -> Self
    where
        F: Fn(ConnectionError) -> BoxFuture<'static, ()> + Send + Sync + 'static,
    {
        self.error_handler = Some(Arc::new(handler));
        self
    }

    /// Handler fired when the writer has been idle for the idle period.
    #[must_use]
    pub fn on_ping<F>(mut self, handler: F) -> Self
    where
        F: Fn(Connection<C>) -> BoxFuture<'static, ()> + Send + Sync + 'static,
    {
        self.ping_handler = Some(Arc::new(handler));
        self
    }

    /// Handler fired when no inbound traffic arrives for the read-timeout
    /// period.
    #[must_use]
    pub fn on_read_timeout<F>(mut self, handler: F) -> Self
    where
        F: Fn(Connection<C>) -> BoxFuture<'static, ()> + Send + Sync + 'static,
    {
        self.read_timeout_handler = Some(Arc::new(handler));
        self
    }

    /// Handler for unsolicited or late inbound messages.
    #[must_use]
    pub fn on_inbound_message<F>(mut self, handler: F) -> Self
    where
        F: Fn(Connection<C>, <C as MessageCodec>::Message) -> BoxFuture<'static, ()>
            + Send
            + Sync
            + 'static,
    {
        self.inbound_message_handler = Some(Arc::new(handler));
        self
    }
}
