//! The connection engine: lifecycle, multiplexing and the three loops.
//!
//! Three cooperating tasks share one transport. The writer drains the
//! request queue and owns the write half; the reader deframes inbound
//! payloads and owns the read half; the dispatcher unpacks and routes.
//! Requests carry a correlator (field 11 by default) and responses are
//! matched back through the pending table, so many callers can have
//! requests in flight over the same stream at once.
//!
//! Lifecycle is coordinated by an internal stop signal and a public done
//! signal, each fired exactly once. Teardown happens either through
//! [`Connection::close`] or through a fatal transport error; the closing
//! flag makes the two paths mutually exclusive.

use std::{
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use tokio::{
    io::{AsyncWriteExt, BufReader, ReadHalf, WriteHalf, split},
    sync::{mpsc, oneshot, watch},
    task::JoinHandle,
    time::{sleep, timeout},
};
use tracing::{info, warn};

use crate::{
    codec::{MessageCodec, is_response},
    errors::{ConnectionError, UnpackError},
    framing::{LengthFramer, read_frame},
    inflight::InFlight,
    options::Options,
    pending::{Delivery, PendingRequests, ReplySlot},
    transport::{BoxedTransport, Transport, dial},
};

/// How long a late reply is still forwarded to the inbound handler after
/// the caller's send timed out.
const SALVAGE_WINDOW: Duration = Duration::from_secs(1);

/// Advisory connection status; the engine neither reads nor reacts to it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Status {
    /// Application-level readiness confirmed.
    Online,
    /// Application-level readiness withdrawn.
    Offline,
    /// Not set.
    #[default]
    Unknown,
}

/// Outbound work handed from a caller to the writer.
enum Outbound<M> {
    /// Correlated request expecting a reply.
    Request {
        frame: Vec<u8>,
        correlator: String,
        reply_tx: oneshot::Sender<M>,
        err_tx: oneshot::Sender<ConnectionError>,
    },
    /// Fire-and-forget message, acknowledged once written.
    Oneway {
        frame: Vec<u8>,
        ack_tx: oneshot::Sender<()>,
    },
}

struct State {
    closing: bool,
    started: bool,
    status: Status,
}

struct Tasks {
    writer: JoinHandle<Result<(), ConnectionError>>,
    reader: JoinHandle<()>,
    dispatcher: JoinHandle<()>,
}

struct Inner<C: MessageCodec> {
    addr: String,
    codec: C,
    framer: Arc<dyn LengthFramer>,
    options: Mutex<Arc<Options<C>>>,
    requests_tx: mpsc::Sender<Outbound<C::Message>>,
    requests_rx: Mutex<Option<mpsc::Receiver<Outbound<C::Message>>>>,
    inbound_tx: mpsc::Sender<Vec<u8>>,
    inbound_rx: Mutex<Option<mpsc::Receiver<Vec<u8>>>>,
    transport: Mutex<Option<BoxedTransport>>,
    tasks: Mutex<Option<Tasks>>,
    pending: PendingRequests<C::Message>,
    inflight: InFlight,
    state: Mutex<State>,
    stop_tx: watch::Sender<bool>,
    done_tx: watch::Sender<bool>,
}

/// A multiplexing ISO 8583 connection.
///
/// The handle is cheaply cloneable and may be shared across tasks; all
/// operations take `&self`.
pub struct Connection<C: MessageCodec> {
    inner: Arc<Inner<C>>,
}

impl<C: MessageCodec> Clone for Connection<C> {
    fn clone(&self) -> Self { Self { inner: Arc::clone(&self.inner) } }
}

impl<C: MessageCodec> Connection<C> {
    /// Create an unconnected engine for `addr`. No I/O happens until
    /// [`connect`](Self::connect) is called.
    #[must_use]
    pub fn new(
        addr: impl Into<String>,
        codec: C,
        framer: impl LengthFramer,
        options: Options<C>,
    ) -> Self {
        // Capacity-one channels give rendezvous behaviour: hand-offs keep
        // call order and wire order aligned under concurrent callers.
        let (requests_tx, requests_rx) = mpsc::channel(1);
        let (inbound_tx, inbound_rx) = mpsc::channel(1);
        let (stop_tx, _) = watch::channel(false);
        let (done_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                addr: addr.into(),
                codec,
                framer: Arc::new(framer),
                options: Mutex::new(Arc::new(options)),
                requests_tx,
                requests_rx: Mutex::new(Some(requests_rx)),
                inbound_tx,
                inbound_rx: Mutex::new(Some(inbound_rx)),
                transport: Mutex::new(None),
                tasks: Mutex::new(None),
                pending: PendingRequests::new(),
                inflight: InFlight::new(),
                state: Mutex::new(State {
                    closing: false,
                    started: false,
                    status: Status::Unknown,
                }),
                stop_tx,
                done_tx,
            }),
        }
    }

    /// Adopt an established transport and start the loops immediately.
    ///
    /// The returned connection is ready for sending and receiving; its
    /// address is empty. Must be called from within a Tokio runtime.
    pub fn new_from(
        transport: impl Transport + 'static,
        codec: C,
        framer: impl LengthFramer,
        options: Options<C>,
    ) -> Self {
        let conn = Self::new(String::new(), codec, framer, options);
        *lock(&conn.inner.transport) = Some(Box::new(transport));
        conn.start();
        conn
    }

    /// Replace the options bundle. Subsequent operations and loop
    /// iterations pick up the new values.
    pub fn set_options(&self, options: Options<C>) {
        *lock(&self.inner.options) = Arc::new(options);
    }

    /// Establish the transport and start the loops.
    ///
    /// Dials TCP (or TLS over TCP when configured) under the connect
    /// timeout, then awaits the on-connect hook if one is set; a hook
    /// error closes the connection and is returned. A no-op when the
    /// loops are already running.
    ///
    /// # Errors
    /// Returns a dial or TLS error, the on-connect hook's error, or
    /// [`ConnectionError::Closed`] after close.
    pub async fn connect(&self) -> Result<(), ConnectionError> {
        {
            let state = lock(&self.inner.state);
            if state.closing {
                return Err(ConnectionError::Closed);
            }
            if state.started {
                return Ok(());
            }
        }

        if lock(&self.inner.transport).is_none() {
            let options = self.opts();
            let transport =
                dial(&self.inner.addr, options.connect_timeout, options.tls.as_ref()).await?;
            *lock(&self.inner.transport) = Some(transport);
        }
        self.start();
        info!(addr = %self.inner.addr, "connection established");

        let options = self.opts();
        if let Some(on_connect) = options.on_connect.clone() {
            if let Err(source) = on_connect(self.clone()).await {
                let _ = self.close().await;
                return Err(ConnectionError::OnConnect(source));
            }
        }
        if let Some(handler) = options.connection_established.clone() {
            tokio::spawn(handler(self.clone()));
        }
        Ok(())
    }

    /// Send a message and wait for its correlated response.
    ///
    /// The wait resolves with the response, a connection error, or
    /// [`ConnectionError::SendTimeout`] after the send timeout. On
    /// timeout, a reply arriving within the next second is forwarded to
    /// the inbound-message handler instead of being dropped.
    ///
    /// # Errors
    /// Pre-flight failures (pack, framing, missing correlator), the
    /// closed sentinel, or the send timeout.
    pub async fn send(&self, message: &C::Message) -> Result<C::Message, ConnectionError> {
        let _guard = self.inner.inflight.enter();
        self.ensure_open()?;

        let frame = self.encode_frame(message)?;
        let correlator = self.correlator_of(message)?;
        let (reply_tx, mut reply_rx) = oneshot::channel();
        let (err_tx, mut err_rx) = oneshot::channel();
        let request = Outbound::Request {
            frame,
            correlator: correlator.clone(),
            reply_tx,
            err_tx,
        };
        if self.inner.requests_tx.send(request).await.is_err() {
            return Err(ConnectionError::Closed);
        }

        let send_timeout = self.opts().send_timeout;
        let result = tokio::select! {
            reply = &mut reply_rx => reply.map_err(|_| ConnectionError::Closed),
            err = &mut err_rx => Err(err.unwrap_or(ConnectionError::Closed)),
            () = sleep(send_timeout) => Err(ConnectionError::SendTimeout),
        };
        if matches!(result, Err(ConnectionError::SendTimeout)) {
            self.salvage_late_reply(reply_rx);
        }

        // The slot outlives the wait so the correlator stays reserved and
        // a late reply still has somewhere to land.
        self.inner.pending.remove(&correlator);
        result
    }

    /// Send a message without expecting a correlated response.
    ///
    /// Used for server-side replies and other traffic where any answer
    /// will arrive as an unsolicited message. Resolves once the frame is
    /// written.
    ///
    /// # Errors
    /// Pre-flight failures, the closed sentinel, or the send timeout.
    pub async fn reply(&self, message: &C::Message) -> Result<(), ConnectionError> {
        let _guard = self.inner.inflight.enter();
        self.ensure_open()?;

        let frame = self.encode_frame(message)?;
        let (ack_tx, ack_rx) = oneshot::channel();
        if self
            .inner
            .requests_tx
            .send(Outbound::Oneway { frame, ack_tx })
            .await
            .is_err()
        {
            return Err(ConnectionError::Closed);
        }

        match timeout(self.opts().send_timeout, ack_rx).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(ConnectionError::Closed),
            Err(_) => Err(ConnectionError::SendTimeout),
        }
    }

    /// Wait for in-flight calls to finish, then shut the transport down.
    ///
    /// Idempotent: concurrent and repeated calls observe a single
    /// teardown, and later calls return immediately.
    ///
    /// # Errors
    /// Returns the transport shutdown error, if any.
    pub async fn close(&self) -> Result<(), ConnectionError> {
        if !self.begin_close() {
            return Ok(());
        }
        self.inner.inflight.idle().await;
        self.shutdown().await
    }

    /// Observable that flips to `true` once teardown has completed.
    #[must_use]
    pub fn done(&self) -> watch::Receiver<bool> { self.inner.done_tx.subscribe() }

    /// Advisory connection status.
    #[must_use]
    pub fn status(&self) -> Status { lock(&self.inner.state).status }

    /// Set the advisory connection status.
    pub fn set_status(&self, status: Status) { lock(&self.inner.state).status = status; }

    /// The configured remote address; empty for adopted transports.
    #[must_use]
    pub fn addr(&self) -> &str { &self.inner.addr }

    fn opts(&self) -> Arc<Options<C>> { Arc::clone(&lock(&self.inner.options)) }

    fn ensure_open(&self) -> Result<(), ConnectionError> {
        let state = lock(&self.inner.state);
        if state.closing {
            return Err(ConnectionError::Closed);
        }
        if !state.started {
            return Err(ConnectionError::NotConnected);
        }
        Ok(())
    }

    fn encode_frame(&self, message: &C::Message) -> Result<Vec<u8>, ConnectionError> {
        let packed = self.inner.codec.pack(message).map_err(ConnectionError::Pack)?;
        let mut frame = Vec::with_capacity(packed.len() + 4);
        self.inner
            .framer
            .write_length(&mut frame, packed.len())
            .map_err(ConnectionError::Frame)?;
        frame.extend_from_slice(&packed);
        Ok(frame)
    }

    fn correlator_of(&self, message: &C::Message) -> Result<String, ConnectionError> {
        let field = self.opts().correlator_field;
        match self.inner.codec.string_field(message, field) {
            Some(value) if !value.is_empty() => Ok(value),
            _ => Err(ConnectionError::MissingCorrelator { field }),
        }
    }

    /// Spawn the three loops over the stored transport. Returns `false`
    /// when they are already running.
    fn start(&self) -> bool {
        {
            let mut state = lock(&self.inner.state);
            if state.started {
                return false;
            }
            state.started = true;
        }
        let Some(transport) = lock(&self.inner.transport).take() else {
            return false;
        };
        let (Some(requests_rx), Some(inbound_rx)) = (
            lock(&self.inner.requests_rx).take(),
            lock(&self.inner.inbound_rx).take(),
        ) else {
            return false;
        };

        let (read_half, write_half) = split(transport);
        let writer = tokio::spawn(Self::write_loop(
            self.clone(),
            requests_rx,
            write_half,
            self.inner.stop_tx.subscribe(),
        ));
        let reader = tokio::spawn(Self::read_loop(
            self.clone(),
            read_half,
            self.inner.stop_tx.subscribe(),
        ));
        let dispatcher = tokio::spawn(Self::dispatch_loop(
            self.clone(),
            inbound_rx,
            self.inner.stop_tx.subscribe(),
        ));
        *lock(&self.inner.tasks) = Some(Tasks { writer, reader, dispatcher });
        true
    }

    /// Flip the closing flag. Returns `false` when teardown already owns
    /// the connection, so racing close paths collapse into one.
    fn begin_close(&self) -> bool {
        let mut state = lock(&self.inner.state);
        if state.closing {
            return false;
        }
        state.closing = true;
        true
    }

    /// Stop the loops, close the transport, and fire the done signal.
    ///
    /// Joining the writer closes the write half; the reader and
    /// dispatcher exit on the stop signal. Dropping the request receiver
    /// with the writer makes any still-arriving request fail fast with
    /// the closed sentinel.
    async fn shutdown(&self) -> Result<(), ConnectionError> {
        let _ = self.inner.stop_tx.send(true);
        let tasks = lock(&self.inner.tasks).take();
        let mut result = Ok(());
        if let Some(tasks) = tasks {
            if let Ok(writer_result) = tasks.writer.await {
                result = writer_result;
            }
            let _ = tasks.reader.await;
            let _ = tasks.dispatcher.await;
        }
        let _ = self.inner.done_tx.send(true);
        result
    }

    /// Tear the connection down after a fatal transport error.
    ///
    /// Every pending caller receives the closed sentinel before the
    /// transport goes away; close handlers fire in the background once
    /// the teardown has fully completed.
    fn fail(&self, error: ConnectionError) {
        warn!(addr = %self.inner.addr, error = %error, "connection failure");
        self.notify_error(error);
        if !self.begin_close() {
            return;
        }
        let conn = self.clone();
        tokio::spawn(async move {
            conn.inner.pending.fail_all(|| ConnectionError::Closed);
            conn.inner.inflight.idle().await;
            let _ = conn.shutdown().await;
            for handler in conn.opts().connection_closed.clone() {
                tokio::spawn(handler(conn.clone()));
            }
        });
    }

    /// Report an error through the error handler, if one is configured.
    fn notify_error(&self, error: ConnectionError) {
        if let Some(handler) = self.opts().error_handler.clone() {
            tokio::spawn(handler(error));
        }
    }

    /// Forward a reply that arrives shortly after its caller gave up.
    fn salvage_late_reply(&self, reply_rx: oneshot::Receiver<C::Message>) {
        let Some(handler) = self.opts().inbound_message_handler.clone() else {
            return;
        };
        let conn = self.clone();
        tokio::spawn(async move {
            if let Ok(Ok(message)) = timeout(SALVAGE_WINDOW, reply_rx).await {
                handler(conn, message).await;
            }
        });
    }

    /// Writer loop: owns the write half and the request queue.
    async fn write_loop(
        conn: Self,
        mut requests_rx: mpsc::Receiver<Outbound<C::Message>>,
        mut write_half: WriteHalf<BoxedTransport>,
        mut stop_rx: watch::Receiver<bool>,
    ) -> Result<(), ConnectionError> {
        let result = loop {
            let idle_time = conn.opts().idle_time;
            tokio::select! {
                outbound = requests_rx.recv() => {
                    let Some(outbound) = outbound else { break Ok(()) };
                    if let Err(error) = conn.write_outbound(&mut write_half, outbound).await {
                        break Err(error);
                    }
                }
                () = sleep(idle_time) => {
                    if let Some(handler) = conn.opts().ping_handler.clone() {
                        tokio::spawn(handler(conn.clone()));
                    }
                }
                _ = stop_rx.changed() => {
                    if *stop_rx.borrow() {
                        break Ok(());
                    }
                }
            }
        };
        let shutdown_result = write_half.shutdown().await.map_err(ConnectionError::Write);
        match result {
            Ok(()) => shutdown_result,
            Err(error) => {
                conn.fail(error);
                Ok(())
            }
        }
    }

    /// Write one outbound item, registering its slot first so a response
    /// can never race ahead of the registration.
    async fn write_outbound(
        &self,
        write_half: &mut WriteHalf<BoxedTransport>,
        outbound: Outbound<C::Message>,
    ) -> Result<(), ConnectionError> {
        match outbound {
            Outbound::Request { frame, correlator, reply_tx, err_tx } => {
                self.inner
                    .pending
                    .register(correlator, ReplySlot::new(reply_tx, err_tx));
                write_half.write_all(&frame).await.map_err(ConnectionError::Write)?;
                write_half.flush().await.map_err(ConnectionError::Write)
            }
            Outbound::Oneway { frame, ack_tx } => {
                write_half.write_all(&frame).await.map_err(ConnectionError::Write)?;
                write_half.flush().await.map_err(ConnectionError::Write)?;
                let _ = ack_tx.send(());
                Ok(())
            }
        }
    }

    /// Reader loop: owns the read half, deframes, and feeds the
    /// dispatcher. Any read error is fatal to the connection.
    async fn read_loop(
        conn: Self,
        read_half: ReadHalf<BoxedTransport>,
        mut stop_rx: watch::Receiver<bool>,
    ) {
        let mut reader = BufReader::new(read_half);
        let framer = Arc::clone(&conn.inner.framer);
        loop {
            let max_frame_size = conn.opts().max_frame_size;
            tokio::select! {
                frame = read_frame(framer.as_ref(), &mut reader, max_frame_size) => {
                    match frame {
                        Ok(raw) => {
                            if conn.inner.inbound_tx.send(raw).await.is_err() {
                                break;
                            }
                        }
                        Err(error) => {
                            conn.fail(error);
                            break;
                        }
                    }
                }
                _ = stop_rx.changed() => {
                    if *stop_rx.borrow() {
                        break;
                    }
                }
            }
        }
    }

    /// Dispatcher loop: routes raw inbound buffers and raises the
    /// read-timeout event during inbound silence.
    async fn dispatch_loop(
        conn: Self,
        mut inbound_rx: mpsc::Receiver<Vec<u8>>,
        mut stop_rx: watch::Receiver<bool>,
    ) {
        loop {
            let read_timeout = conn.opts().read_timeout;
            tokio::select! {
                raw = inbound_rx.recv() => {
                    let Some(raw) = raw else { break };
                    let router = conn.clone();
                    tokio::spawn(async move { router.route_inbound(raw) });
                }
                () = sleep(read_timeout) => {
                    if let Some(handler) = conn.opts().read_timeout_handler.clone() {
                        tokio::spawn(handler(conn.clone()));
                    }
                }
                _ = stop_rx.changed() => {
                    if *stop_rx.borrow() {
                        break;
                    }
                }
            }
        }
    }

    /// Unpack one inbound payload and route it to its consumer.
    ///
    /// Unpack failures and unmatched responses are recoverable: they are
    /// reported through the error handler and never fail the connection.
    fn route_inbound(&self, raw: Vec<u8>) {
        let message = match self.inner.codec.unpack(&raw) {
            Ok(message) => message,
            Err(source) => {
                self.notify_error(UnpackError { source, raw }.into());
                return;
            }
        };

        let mti = self.inner.codec.mti(&message).unwrap_or_default();
        if !is_response(&mti) {
            self.forward_inbound(message);
            return;
        }

        let correlator = match self.correlator_of(&message) {
            Ok(correlator) => correlator,
            Err(error) => {
                self.notify_error(error);
                return;
            }
        };
        match self.inner.pending.deliver(&correlator, message) {
            Delivery::Delivered => {}
            Delivery::NoPending(message) => {
                if self.opts().inbound_message_handler.is_some() {
                    self.forward_inbound(message);
                } else {
                    self.notify_error(ConnectionError::Unmatched(correlator));
                }
            }
        }
    }

    /// Hand an unsolicited message to the inbound handler; without one the
    /// message is dropped.
    fn forward_inbound(&self, message: C::Message) {
        if let Some(handler) = self.opts().inbound_message_handler.clone() {
            tokio::spawn(handler(self.clone(), message));
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{errors::BoxError, framing::BinaryFramer};

    struct NullCodec;

    impl MessageCodec for NullCodec {
        type Message = ();

        fn pack(&self, _message: &()) -> Result<Vec<u8>, BoxError> { Ok(Vec::new()) }

        fn unpack(&self, _raw: &[u8]) -> Result<(), BoxError> { Ok(()) }

        fn mti(&self, _message: &()) -> Option<String> { None }

        fn string_field(&self, _message: &(), _field: u32) -> Option<String> { None }
    }

    fn unconnected() -> Connection<NullCodec> {
        Connection::new(
            "127.0.0.1:8583",
            NullCodec,
            BinaryFramer::u16(),
            Options::new(),
        )
    }

    #[tokio::test]
    async fn send_before_connect_is_rejected() {
        let conn = unconnected();
        let err = conn.send(&()).await.expect_err("no transport yet");
        assert!(matches!(err, ConnectionError::NotConnected));
    }

    #[tokio::test]
    async fn close_is_idempotent_without_a_transport() {
        let conn = unconnected();
        conn.close().await.expect("first close");
        conn.close().await.expect("second close");

        let mut done = conn.done();
        done.wait_for(|closed| *closed).await.expect("done fired");
    }

    #[tokio::test]
    async fn status_defaults_to_unknown_and_is_settable() {
        let conn = unconnected();
        assert_eq!(conn.status(), Status::Unknown);

        conn.set_status(Status::Online);
        assert_eq!(conn.status(), Status::Online);
    }

    #[tokio::test]
    async fn addr_reports_the_configured_endpoint() {
        let conn = unconnected();
        assert_eq!(conn.addr(), "127.0.0.1:8583");
    }
}
