/// Pipelined connection to a single server
///
/// Requests and replies travel independently: a sender task writes queued
/// requests while a receiver task matches replies against the requests that were
/// written, strictly in send order. The two tasks share nothing but the two
/// queues and the lifecycle state.
use super::codec::{Codec, Frame};
use super::envelope::{Envelope, PendingReply, ReplyHandle, ReplySlot, RequestIdGenerator};
use super::queue::{LockType, PendingQueue};
use crate::config::ClientConfig;
use crate::error::{DriverError, DriverResult};
use bytes::BytesMut;
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};

const READ_BUFFER_SIZE: usize = 16 * 1024;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Envelope type carried by a connection using codec `C`
pub type OperationEnvelope<C> = Envelope<<C as Codec>::Request, <C as Codec>::Reply>;

/// Lifecycle of a connection; transitions only move forward
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    Open = 0,
    /// No new work accepted; closes once the last reply arrives
    ShuttingDown = 1,
    Closed = 2,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ConnectionState::Open,
            1 => ConnectionState::ShuttingDown,
            _ => ConnectionState::Closed,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Open => write!(f, "open"),
            ConnectionState::ShuttingDown => write!(f, "shutting down"),
            ConnectionState::Closed => write!(f, "closed"),
        }
    }
}

/// Per-connection tuning
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Depth of both the to-send and the awaiting-reply queue
    pub max_pending_operations: usize,
    pub lock_type: LockType,
    /// Receiver liveness tick
    pub read_timeout: Duration,
    /// Unflushed bytes that force a write
    pub write_buffer_size: usize,
    /// Largest request accepted until the server advertises its own limit
    pub max_message_size: usize,
}

impl From<&ClientConfig> for ConnectionConfig {
    fn from(config: &ClientConfig) -> Self {
        Self {
            max_pending_operations: config.max_pending_operations_per_connection,
            lock_type: config.lock_type,
            read_timeout: config.read_timeout(),
            write_buffer_size: config.write_buffer_size,
            max_message_size: config.max_message_size,
        }
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self::from(&ClientConfig::default())
    }
}

/// State shared by the connection handle and its two tasks
struct Shared<C: Codec> {
    name: String,
    address: String,
    codec: Arc<C>,
    config: ConnectionConfig,
    to_send: PendingQueue<OperationEnvelope<C>>,
    awaiting: PendingQueue<PendingReply<C::Reply>>,
    state: AtomicU8,
    state_tx: watch::Sender<ConnectionState>,
    shutdown_requested: AtomicBool,
    request_ids: RequestIdGenerator,
    max_message_size: AtomicUsize,
}

impl<C: Codec> Shared<C> {
    fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Close the connection and fail everything still queued.
    ///
    /// Only the first caller does the work and gets `true`.
    fn teardown(&self, reason: DriverError) -> bool {
        let previous = self
            .state
            .swap(ConnectionState::Closed as u8, Ordering::AcqRel);
        if previous == ConnectionState::Closed as u8 {
            return false;
        }

        self.state_tx.send_replace(ConnectionState::Closed);
        self.to_send.close();
        self.awaiting.close();

        let failed = self.raise_errors(&reason, true);
        info!("{}: closed ({}), {} operations failed", self.name, reason, failed);
        true
    }

    fn raise_errors(&self, error: &DriverError, notify_to_be_sent: bool) -> usize {
        let mut failed = 0;

        if notify_to_be_sent {
            let mut unsent = Vec::new();
            self.to_send.drain_to(&mut unsent);
            for envelope in &unsent {
                if envelope.fail(error.duplicate()) {
                    failed += 1;
                }
            }
        }

        let mut pending = Vec::new();
        self.awaiting.drain_to(&mut pending);
        for entry in &pending {
            if entry.slot.complete(Err(error.duplicate())) {
                failed += 1;
            }
        }

        failed
    }

    async fn run_sender(self: Arc<Self>, mut writer: OwnedWriteHalf) {
        let mut batch = BytesMut::with_capacity(self.config.write_buffer_size);
        let mut in_flight = Vec::new();

        if let Err(e) = self.send_loop(&mut writer, &mut batch, &mut in_flight).await {
            warn!("{}: write failed: {}", self.name, e);
            for slot in in_flight.drain(..) {
                slot.complete(Err(DriverError::send(e.to_string())));
            }
            self.teardown(DriverError::connection_lost(format!("write failed: {}", e)));
        }

        let _ = writer.shutdown().await;
        debug!("{}: sender stopped", self.name);
    }

    async fn send_loop(
        &self,
        writer: &mut OwnedWriteHalf,
        batch: &mut BytesMut,
        in_flight: &mut Vec<Arc<ReplySlot<C::Reply>>>,
    ) -> io::Result<()> {
        let mut encoded = BytesMut::new();

        loop {
            if self.state() == ConnectionState::Closed {
                return Ok(());
            }

            let envelope = if batch.is_empty() {
                match self.to_send.take().await {
                    Some(envelope) => envelope,
                    None => return Ok(()),
                }
            } else if let Some(envelope) = self.to_send.poll() {
                envelope
            } else {
                flush(writer, batch, in_flight).await?;
                continue;
            };

            encoded.clear();
            if let Err(e) = self
                .codec
                .encode(&envelope.request, envelope.request_id, &mut encoded)
            {
                warn!(
                    "{}: failed to encode request {}: {}",
                    self.name, envelope.request_id, e
                );
                envelope.fail(e);
                continue;
            }

            let max = self.max_message_size.load(Ordering::Relaxed);
            if encoded.len() > max {
                warn!(
                    "{}: request {} is {} bytes, server accepts {}",
                    self.name,
                    envelope.request_id,
                    encoded.len(),
                    max
                );
                envelope.fail(DriverError::MessageTooLarge {
                    size: encoded.len(),
                    max,
                });
                continue;
            }

            // Registered for a reply before any of its bytes can reach the server.
            if let Some(slot) = &envelope.reply {
                let pending = PendingReply {
                    request_id: envelope.request_id,
                    slot: Arc::clone(slot),
                };
                if let Err(pending) = self.awaiting.offer(pending) {
                    if !self.awaiting.is_closed() {
                        flush(writer, batch, in_flight).await?;
                    }
                    if self.awaiting.put(pending).await.is_err() {
                        envelope.fail(DriverError::connection_lost(
                            "connection closed before the request was sent",
                        ));
                        continue;
                    }
                }
                in_flight.push(Arc::clone(slot));
            }

            batch.extend_from_slice(&encoded);
            trace!(
                "{}: queued request {} ({} bytes, {} unflushed)",
                self.name,
                envelope.request_id,
                encoded.len(),
                batch.len()
            );

            if batch.len() >= self.config.write_buffer_size
                || self.state() != ConnectionState::Open
            {
                flush(writer, batch, in_flight).await?;
            }
        }
    }

    async fn run_receiver(self: Arc<Self>, mut reader: OwnedReadHalf) {
        let mut state_rx = self.state_tx.subscribe();
        let mut buffer = BytesMut::with_capacity(READ_BUFFER_SIZE);

        if let Err(error) = self
            .receive_loop(&mut reader, &mut buffer, &mut state_rx)
            .await
        {
            if self.state() != ConnectionState::Closed {
                warn!("{}: {}", self.name, error);
            }
            let reason = match error {
                DriverError::ConnectionLost { message } => message,
                other => other.to_string(),
            };
            self.teardown(DriverError::connection_lost(reason));
        }

        debug!("{}: receiver stopped", self.name);
    }

    async fn receive_loop(
        &self,
        reader: &mut OwnedReadHalf,
        buffer: &mut BytesMut,
        state_rx: &mut watch::Receiver<ConnectionState>,
    ) -> DriverResult<()> {
        loop {
            while let Some(frame) = self.codec.decode(buffer)? {
                self.dispatch(frame);
            }

            if self.state() == ConnectionState::Closed {
                return Ok(());
            }

            tokio::select! {
                read = timeout(self.config.read_timeout, reader.read_buf(buffer)) => match read {
                    Err(_) => trace!("{}: no data within {:?}", self.name, self.config.read_timeout),
                    Ok(Ok(0)) => {
                        return Err(DriverError::connection_lost("server closed the connection"))
                    }
                    Ok(Ok(n)) => trace!("{}: read {} bytes", self.name, n),
                    Ok(Err(e)) => return Err(DriverError::Network(e)),
                },
                changed = state_rx.changed() => {
                    if changed.is_err() {
                        return Ok(());
                    }
                }
            }
        }
    }

    fn dispatch(&self, frame: Frame<C::Reply>) {
        match frame {
            Frame::Reply { response_to, reply } => {
                self.deliver_reply(response_to, reply);

                if self.state() == ConnectionState::ShuttingDown
                    && self.to_send.is_empty()
                    && self.awaiting.is_empty()
                {
                    debug!("{}: last reply received during shutdown", self.name);
                    self.teardown(DriverError::connection_lost("connection shut down"));
                }
            }
            Frame::Other { op_code } => {
                warn!(
                    "{}: ignoring unexpected message with opcode {}",
                    self.name, op_code
                );
            }
        }
    }

    /// Match a reply against the oldest pending requests.
    ///
    /// Replies arrive in send order, so every older request is known to have
    /// been skipped by the server.
    fn deliver_reply(&self, response_to: i32, reply: C::Reply) {
        while let Some(pending) = self.awaiting.poll() {
            if pending.request_id == response_to {
                trace!("{}: reply to request {}", self.name, response_to);
                pending.slot.complete(Ok(reply));
                return;
            }

            debug!(
                "{}: request {} skipped by reply to {}",
                self.name, pending.request_id, response_to
            );
            pending.slot.complete(Err(DriverError::NoReply {
                request_id: pending.request_id,
            }));
        }

        warn!(
            "{}: dropping reply to request {} with nothing pending",
            self.name, response_to
        );
    }
}

async fn flush<Rep>(
    writer: &mut OwnedWriteHalf,
    batch: &mut BytesMut,
    in_flight: &mut Vec<Arc<ReplySlot<Rep>>>,
) -> io::Result<()> {
    if batch.is_empty() {
        return Ok(());
    }
    writer.write_all(batch).await?;
    writer.flush().await?;
    batch.clear();
    in_flight.clear();
    Ok(())
}

/// Handle to one pipelined server connection
pub struct Connection<C: Codec> {
    shared: Arc<Shared<C>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<C: Codec> Connection<C> {
    /// Take ownership of a connected socket and start both loops.
    ///
    /// Must be called from within a tokio runtime.
    pub fn open(
        stream: TcpStream,
        address: impl Into<String>,
        codec: Arc<C>,
        config: ConnectionConfig,
    ) -> Arc<Self> {
        let address = address.into();
        let id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
        let name = match stream.local_addr() {
            Ok(local) => format!("conn#{}({}->{})", id, local.port(), address),
            Err(_) => format!("conn#{}(->{})", id, address),
        };

        let (state_tx, _) = watch::channel(ConnectionState::Open);
        let shared = Arc::new(Shared {
            name,
            address,
            codec,
            to_send: PendingQueue::new(config.max_pending_operations, config.lock_type),
            awaiting: PendingQueue::new(config.max_pending_operations, config.lock_type),
            state: AtomicU8::new(ConnectionState::Open as u8),
            state_tx,
            shutdown_requested: AtomicBool::new(false),
            request_ids: RequestIdGenerator::new(),
            max_message_size: AtomicUsize::new(config.max_message_size),
            config,
        });

        let (reader, writer) = stream.into_split();
        let sender = tokio::spawn(Arc::clone(&shared).run_sender(writer));
        let receiver = tokio::spawn(Arc::clone(&shared).run_receiver(reader));
        info!("{}: opened", shared.name);

        Arc::new(Self {
            shared,
            tasks: Mutex::new(vec![sender, receiver]),
        })
    }

    fn envelope(
        &self,
        request: C::Request,
        reply: Option<ReplySlot<C::Reply>>,
    ) -> OperationEnvelope<C> {
        Envelope::new(self.shared.request_ids.next_id(), request, reply)
    }

    async fn enqueue(&self, envelope: OperationEnvelope<C>) -> DriverResult<()> {
        if self.shared.state() != ConnectionState::Open {
            envelope.disarm();
            return Err(DriverError::ConnectionClosed);
        }

        self.shared.to_send.put(envelope).await.map_err(|rejected| {
            rejected.disarm();
            DriverError::ConnectionClosed
        })
    }

    /// Queue a request and get a future for its reply.
    pub async fn send(&self, request: C::Request) -> DriverResult<ReplyHandle<C::Reply>> {
        let (slot, handle) = ReplySlot::channel();
        self.enqueue(self.envelope(request, Some(slot))).await?;
        Ok(handle)
    }

    /// Queue a request whose result is handed to `callback`.
    ///
    /// The callback runs on the connection's receiver task and must not block.
    pub async fn send_with_callback<F>(&self, request: C::Request, callback: F) -> DriverResult<()>
    where
        F: FnOnce(DriverResult<C::Reply>) + Send + 'static,
    {
        self.enqueue(self.envelope(request, Some(ReplySlot::callback(callback))))
            .await
    }

    /// Queue a request that expects no reply.
    pub async fn send_no_reply(&self, request: C::Request) -> DriverResult<()> {
        self.enqueue(self.envelope(request, None)).await
    }

    /// Queue two requests back to back; only the second expects a reply.
    pub async fn send_pair(
        &self,
        first: C::Request,
        second: C::Request,
    ) -> DriverResult<ReplyHandle<C::Reply>> {
        let (slot, handle) = ReplySlot::channel();
        let pair = vec![self.envelope(first, None), self.envelope(second, Some(slot))];

        if self.shared.state() != ConnectionState::Open {
            pair.iter().for_each(Envelope::disarm);
            return Err(DriverError::ConnectionClosed);
        }

        self.shared.to_send.put_all(pair).await.map_err(|rejected| {
            rejected.iter().for_each(Envelope::disarm);
            DriverError::ConnectionClosed
        })?;
        Ok(handle)
    }

    /// Stop accepting work and close once every outstanding reply has arrived.
    ///
    /// An identity request is queued behind everything already accepted so the
    /// final reply is guaranteed. It goes in while the connection is still open.
    pub async fn shutdown(&self) {
        if self.shared.state() != ConnectionState::Open
            || self.shared.shutdown_requested.swap(true, Ordering::AcqRel)
        {
            return;
        }
        info!("{}: shutting down", self.shared.name);

        let request = match self.shared.codec.identity_request() {
            Ok(request) => request,
            Err(e) => {
                warn!("{}: no shutdown request ({}), closing", self.shared.name, e);
                self.shared
                    .teardown(DriverError::connection_lost("connection shut down"));
                return;
            }
        };
        let sentinel = self.envelope(request, Some(ReplySlot::noop()));
        if self.shared.to_send.put(sentinel).await.is_err() {
            debug!("{}: closed before shutdown completed", self.shared.name);
            return;
        }

        let moved = self.shared.state.compare_exchange(
            ConnectionState::Open as u8,
            ConnectionState::ShuttingDown as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        if moved.is_err() {
            return;
        }
        self.shared
            .state_tx
            .send_replace(ConnectionState::ShuttingDown);

        // The sentinel may already have been answered while still open.
        if self.is_idle() {
            debug!("{}: nothing outstanding at shutdown", self.shared.name);
            self.shared
                .teardown(DriverError::connection_lost("connection shut down"));
        }
    }

    /// Close immediately, failing every outstanding operation.
    ///
    /// Returns `true` for the call that actually closed the connection.
    pub async fn close(&self) -> bool {
        let first = self
            .shared
            .teardown(DriverError::connection_lost("connection closed"));

        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner));
        for task in tasks {
            if let Err(e) = task.await {
                warn!("{}: connection task failed: {}", self.shared.name, e);
            }
        }

        first
    }

    /// Fail every request waiting for a reply, and optionally every unsent one.
    pub fn raise_errors(&self, error: DriverError, notify_to_be_sent: bool) -> usize {
        self.shared.raise_errors(&error, notify_to_be_sent)
    }

    /// Remove the requests that have not been written yet.
    pub fn drain_pending(&self) -> Vec<OperationEnvelope<C>> {
        let mut pending = Vec::new();
        self.shared.to_send.drain_to(&mut pending);
        pending
    }

    /// Adopt requests drained from another connection.
    ///
    /// Each envelope gets a fresh id from this connection. If the connection closes
    /// part way, the remaining envelopes are failed rather than dropped.
    pub async fn add_pending(&self, envelopes: Vec<OperationEnvelope<C>>) -> DriverResult<()> {
        let mut envelopes = envelopes.into_iter();
        while let Some(mut envelope) = envelopes.next() {
            envelope.request_id = self.shared.request_ids.next_id();
            if let Err(rejected) = self.shared.to_send.put(envelope).await {
                let error = DriverError::connection_lost("replacement connection closed");
                rejected.fail(error.duplicate());
                for envelope in envelopes {
                    envelope.fail(error.duplicate());
                }
                return Err(DriverError::ConnectionClosed);
            }
        }
        Ok(())
    }

    /// Wait until the connection is closed, up to `limit`.
    pub async fn wait_for_closed(&self, limit: Duration) -> bool {
        let mut state_rx = self.subscribe();
        let closed = match timeout(limit, state_rx.wait_for(|s| *s == ConnectionState::Closed)).await {
            Ok(result) => result.is_ok(),
            Err(_) => false,
        };
        closed
    }

    /// Observe lifecycle changes
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state_tx.subscribe()
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// Nothing queued and nothing waiting for a reply
    pub fn is_idle(&self) -> bool {
        self.shared.to_send.is_empty() && self.shared.awaiting.is_empty()
    }

    pub fn pending_count(&self) -> usize {
        self.shared.to_send.size() + self.shared.awaiting.size()
    }

    pub fn address(&self) -> &str {
        &self.shared.address
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn codec(&self) -> &Arc<C> {
        &self.shared.codec
    }

    pub fn max_message_size(&self) -> usize {
        self.shared.max_message_size.load(Ordering::Relaxed)
    }

    /// Apply the limit a server advertised during its handshake.
    pub fn set_max_message_size(&self, max: usize) {
        self.shared.max_message_size.store(max, Ordering::Relaxed);
    }
}

impl<C: Codec> Drop for Connection<C> {
    fn drop(&mut self) {
        self.shared
            .teardown(DriverError::connection_lost("connection dropped"));
    }
}

impl<C: Codec> fmt::Debug for Connection<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("name", &self.shared.name)
            .field("state", &self.state())
            .field("pending", &self.pending_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::mock::{read_request, reply_frame};
    use crate::protocol::{Message, WireCodec, OP_MSG, OP_QUERY};
    use tokio::net::TcpListener;
    use std::task::Poll;
    use tokio::sync::mpsc;
    use tokio::time::sleep;
    use tokio_test::{assert_pending, task};

    fn test_config(max_pending: usize) -> ConnectionConfig {
        ConnectionConfig {
            max_pending_operations: max_pending,
            lock_type: LockType::Mutex,
            read_timeout: Duration::from_millis(50),
            write_buffer_size: 8192,
            max_message_size: 1024 * 1024,
        }
    }

    async fn connect_pair(config: ConnectionConfig) -> (Arc<Connection<WireCodec>>, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();

        let connection = Connection::open(
            client,
            addr.to_string(),
            Arc::new(WireCodec::default()),
            config,
        );
        (connection, server)
    }

    fn msg(body: &[u8]) -> Message {
        Message::new(OP_MSG, body.to_vec())
    }

    type Results = mpsc::UnboundedReceiver<DriverResult<Message>>;

    fn recorder() -> (
        mpsc::UnboundedSender<DriverResult<Message>>,
        Results,
    ) {
        mpsc::unbounded_channel()
    }

    async fn collect(rx: &mut Results, count: usize) -> Vec<DriverResult<Message>> {
        let mut results = Vec::with_capacity(count);
        for _ in 0..count {
            let result = timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("notification timed out")
                .expect("recorder closed");
            results.push(result);
        }
        results
    }

    async fn wait_until<F: Fn() -> bool>(condition: F) {
        timeout(Duration::from_secs(5), async {
            while !condition() {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached");
    }

    #[tokio::test]
    async fn test_replies_matched_in_send_order() {
        let (connection, mut server) = connect_pair(test_config(16)).await;

        let server_task = tokio::spawn(async move {
            for _ in 0..50 {
                let (request_id, _, body) = read_request(&mut server).await.unwrap();
                server
                    .write_all(&reply_frame(request_id, &body))
                    .await
                    .unwrap();
            }
            server
        });

        let mut handles = Vec::new();
        for i in 0..50u8 {
            handles.push(connection.send(msg(&[i])).await.unwrap());
        }
        for (i, handle) in handles.into_iter().enumerate() {
            let reply = handle.await.unwrap();
            assert_eq!(&reply.body[..], &[i as u8]);
        }

        let _server = server_task.await.unwrap();
        assert!(connection.is_idle());
        assert!(connection.is_open());
    }

    #[tokio::test]
    async fn test_severed_socket_fails_each_outstanding_once() {
        let (connection, mut server) = connect_pair(test_config(16)).await;
        let (tx, mut rx) = recorder();

        for i in 0..5u8 {
            let tx = tx.clone();
            connection
                .send_with_callback(msg(&[i]), move |result| {
                    let _ = tx.send(result);
                })
                .await
                .unwrap();
        }

        for _ in 0..5 {
            read_request(&mut server).await.unwrap();
        }
        drop(server);

        let results = collect(&mut rx, 5).await;
        assert!(results
            .iter()
            .all(|r| matches!(r, Err(DriverError::ConnectionLost { .. }))));

        assert!(connection.wait_for_closed(Duration::from_secs(5)).await);
        sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_out_of_order_reply_fails_skipped_request() {
        let (connection, mut server) = connect_pair(test_config(16)).await;

        let first = connection.send(msg(b"A")).await.unwrap();
        let second = connection.send(msg(b"B")).await.unwrap();

        let (a_id, _, _) = read_request(&mut server).await.unwrap();
        let (b_id, _, _) = read_request(&mut server).await.unwrap();
        let mut replies = reply_frame(b_id, b"for B");
        replies.extend_from_slice(&reply_frame(a_id, b"for A"));
        server.write_all(&replies).await.unwrap();

        match first.await {
            Err(DriverError::NoReply { request_id }) => assert_eq!(request_id, a_id),
            other => panic!("unexpected result for A: {other:?}"),
        }
        assert_eq!(&second.await.unwrap().body[..], b"for B");

        // The late reply for A is dropped without closing the connection.
        sleep(Duration::from_millis(100)).await;
        assert!(connection.is_open());
        assert_eq!(connection.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_close_notifies_every_outstanding_operation_once() {
        let (connection, mut server) = connect_pair(test_config(2)).await;
        let (tx, mut rx) = recorder();

        for i in 0..5u8 {
            let tx = tx.clone();
            connection
                .send_with_callback(msg(&[i]), move |result| {
                    let _ = tx.send(result);
                })
                .await
                .unwrap();
        }

        // Two written and awaiting replies, one held by the blocked sender, two queued.
        for _ in 0..2 {
            read_request(&mut server).await.unwrap();
        }
        let watched = Arc::clone(&connection);
        wait_until(move || watched.pending_count() == 4).await;

        let closers: Vec<_> = (0..4)
            .map(|_| {
                let connection = Arc::clone(&connection);
                tokio::spawn(async move { connection.close().await })
            })
            .collect();
        let mut first_closes = 0;
        for closer in closers {
            if closer.await.unwrap() {
                first_closes += 1;
            }
        }
        assert_eq!(first_closes, 1);

        let results = collect(&mut rx, 5).await;
        assert!(results
            .iter()
            .all(|r| matches!(r, Err(DriverError::ConnectionLost { .. }))));
        sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());

        // The server sees the socket closed.
        let mut rest = Vec::new();
        let read = timeout(Duration::from_secs(5), server.read_to_end(&mut rest)).await;
        assert!(matches!(read, Ok(Ok(_))));
        assert_eq!(connection.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_submit_on_closed_connection_fails_synchronously() {
        let (connection, _server) = connect_pair(test_config(4)).await;
        assert!(connection.close().await);
        assert!(!connection.close().await);

        assert!(matches!(
            connection.send(msg(b"late")).await,
            Err(DriverError::ConnectionClosed)
        ));

        let (tx, mut rx) = recorder();
        let result = connection
            .send_with_callback(msg(b"late"), move |result| {
                let _ = tx.send(result);
            })
            .await;
        assert!(matches!(result, Err(DriverError::ConnectionClosed)));
        assert!(matches!(
            connection.send_pair(msg(b"w"), msg(b"gle")).await,
            Err(DriverError::ConnectionClosed)
        ));

        // The refused callback is never invoked.
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_send_pair_expects_only_second_reply() {
        let (connection, mut server) = connect_pair(test_config(4)).await;

        let handle = connection
            .send_pair(msg(b"insert"), msg(b"getLastError"))
            .await
            .unwrap();

        let (first_id, _, first_body) = read_request(&mut server).await.unwrap();
        let (second_id, _, second_body) = read_request(&mut server).await.unwrap();
        assert_eq!(first_body, b"insert");
        assert_eq!(second_body, b"getLastError");
        assert_eq!(second_id, first_id + 1);

        server
            .write_all(&reply_frame(second_id, b"ok"))
            .await
            .unwrap();
        assert_eq!(&handle.await.unwrap().body[..], b"ok");
        assert!(connection.is_idle());
    }

    #[tokio::test]
    async fn test_oversized_request_rejected_without_closing() {
        let (connection, mut server) = connect_pair(test_config(4)).await;
        connection.set_max_message_size(64);

        let oversized = connection.send(msg(&[0u8; 100])).await.unwrap();
        match oversized.await {
            Err(DriverError::MessageTooLarge { size, max }) => {
                assert_eq!(size, 116);
                assert_eq!(max, 64);
            }
            other => panic!("unexpected result: {other:?}"),
        }

        let small = connection.send(msg(b"ping")).await.unwrap();
        let (request_id, _, _) = read_request(&mut server).await.unwrap();
        server
            .write_all(&reply_frame(request_id, b"pong"))
            .await
            .unwrap();
        assert_eq!(&small.await.unwrap().body[..], b"pong");
        assert!(connection.is_open());
    }

    #[tokio::test]
    async fn test_shutdown_waits_for_last_reply() {
        let (connection, mut server) = connect_pair(test_config(4)).await;

        let handle = connection.send(msg(b"find")).await.unwrap();
        connection.shutdown().await;
        assert_eq!(connection.state(), ConnectionState::ShuttingDown);
        assert!(matches!(
            connection.send(msg(b"refused")).await,
            Err(DriverError::ConnectionClosed)
        ));

        let (find_id, _, _) = read_request(&mut server).await.unwrap();
        let (sentinel_id, sentinel_op, _) = read_request(&mut server).await.unwrap();
        assert_eq!(sentinel_op, OP_QUERY);

        server
            .write_all(&reply_frame(find_id, b"docs"))
            .await
            .unwrap();
        assert_eq!(&handle.await.unwrap().body[..], b"docs");
        assert!(!connection.is_open());

        server
            .write_all(&reply_frame(sentinel_id, b"ismaster"))
            .await
            .unwrap();
        assert!(connection.wait_for_closed(Duration::from_secs(5)).await);
    }

    #[tokio::test]
    async fn test_shutdown_racing_last_reply_still_closes() {
        for round in 0..20u8 {
            let (connection, mut server) = connect_pair(test_config(4)).await;
            let server_task = tokio::spawn(async move {
                while let Some((request_id, _, body)) = read_request(&mut server).await {
                    if server.write_all(&reply_frame(request_id, &body)).await.is_err() {
                        break;
                    }
                }
            });

            let handle = connection.send(msg(&[round])).await.unwrap();
            if round % 2 == 0 {
                // Let the reply arrive before shutdown is requested.
                assert_eq!(&handle.await.unwrap().body[..], &[round]);
                connection.shutdown().await;
            } else {
                connection.shutdown().await;
                assert_eq!(&handle.await.unwrap().body[..], &[round]);
            }

            assert!(connection.wait_for_closed(Duration::from_secs(5)).await);
            server_task.abort();
        }
    }

    #[tokio::test]
    async fn test_send_blocks_until_server_drains() {
        let (connection, mut server) = connect_pair(test_config(2)).await;

        // Two written and awaiting replies, one held by the blocked sender, two queued.
        let mut handles = Vec::new();
        for i in 0..5u8 {
            handles.push(connection.send(msg(&[i])).await.unwrap());
        }
        let (first_id, _, first_body) = read_request(&mut server).await.unwrap();
        let watched = Arc::clone(&connection);
        wait_until(move || watched.pending_count() == 4).await;

        let mut blocked = task::spawn(connection.send(msg(&[5])));
        assert_pending!(blocked.poll());
        sleep(Duration::from_millis(50)).await;
        assert_pending!(blocked.poll());

        server
            .write_all(&reply_frame(first_id, &first_body))
            .await
            .unwrap();
        let unblocked = timeout(Duration::from_secs(5), async {
            loop {
                if let Poll::Ready(result) = blocked.poll() {
                    return result;
                }
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("send still blocked after a reply");
        handles.push(unblocked.unwrap());
        drop(blocked);

        let server_task = tokio::spawn(async move {
            for _ in 1..6 {
                let (request_id, _, body) = read_request(&mut server).await.unwrap();
                server
                    .write_all(&reply_frame(request_id, &body))
                    .await
                    .unwrap();
            }
            server
        });

        for (i, handle) in handles.into_iter().enumerate() {
            let reply = timeout(Duration::from_secs(5), handle)
                .await
                .expect("reply timed out")
                .unwrap();
            assert_eq!(&reply.body[..], &[i as u8]);
        }
        let _server = server_task.await.unwrap();
        assert!(connection.is_idle());
    }

    #[tokio::test]
    async fn test_pending_hand_off_between_connections() {
        let (stalled, mut stalled_server) = connect_pair(test_config(2)).await;
        let (tx, mut rx) = recorder();

        for i in 0..5u8 {
            let tx = tx.clone();
            stalled
                .send_with_callback(msg(&[i]), move |result| {
                    let _ = tx.send(result);
                })
                .await
                .unwrap();
        }
        for _ in 0..2 {
            read_request(&mut stalled_server).await.unwrap();
        }
        let watched = Arc::clone(&stalled);
        wait_until(move || watched.pending_count() == 4).await;

        let moved = stalled.drain_pending();
        assert_eq!(moved.len(), 2);

        let (replacement, mut server) = connect_pair(test_config(8)).await;
        let server_task = tokio::spawn(async move {
            for _ in 0..2 {
                let (request_id, _, body) = read_request(&mut server).await.unwrap();
                server
                    .write_all(&reply_frame(request_id, &body))
                    .await
                    .unwrap();
            }
            server
        });
        replacement.add_pending(moved).await.unwrap();

        let mut bodies: Vec<u8> = collect(&mut rx, 2)
            .await
            .into_iter()
            .map(|r| r.unwrap().body[0])
            .collect();
        bodies.sort_unstable();
        assert_eq!(bodies, vec![3, 4]);
        let _server = server_task.await.unwrap();

        stalled.close().await;
        let failed = collect(&mut rx, 3).await;
        assert!(failed.iter().all(|r| r.is_err()));
    }

    #[tokio::test]
    async fn test_raise_errors_spares_unsent_when_asked() {
        let (connection, mut server) = connect_pair(test_config(4)).await;

        let handle = connection.send(msg(b"a")).await.unwrap();
        read_request(&mut server).await.unwrap();
        let watched = Arc::clone(&connection);
        wait_until(move || watched.pending_count() == 1).await;

        let failed = connection.raise_errors(DriverError::timeout("reply"), false);
        assert_eq!(failed, 1);
        assert!(matches!(handle.await, Err(DriverError::Timeout { .. })));
        assert!(connection.is_open());
    }
}
