/*!
 * Transport client for the beamflow protocol.
 *
 * One [`Transport`] owns one connection to the remote control server. The
 * underlying socket enforces strict request/reply alternation, so every
 * logical call is funneled through a single dispatcher task that owns the
 * socket: calls queue in FIFO order, at most one request is on the wire at
 * any instant, and replies are matched back to their callers by call id.
 * Unsolicited push frames are fanned out on a broadcast channel.
 *
 * A call deadline covers the wire round trip of that call. A timed-out
 * call degrades to a returned [`CallError::Timeout`]; after a configured
 * number of consecutive timeouts the connection is marked unhealthy and
 * subsequent calls fail fast with [`CallError::Unhealthy`] until an
 * explicit reconnect. Reconnection is never automatic.
 */
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot, Notify};
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use beamflow_core::config::TransportConfig;
use beamflow_core::types::Value;

use crate::error::{CallError, ConnectError};
use crate::wire::{self, Frame, PushEvent, ReplyStatus, Request};

/// Capacity of the push-event broadcast channel
const PUSH_CHANNEL_CAPACITY: usize = 64;

/// A bidirectional, ordered message socket carrying one frame per message
///
/// Implementations must make `recv` cancel-safe: dropping the future
/// between polls must not lose a partially received frame.
#[async_trait]
pub trait MessageSocket: Send {
    /// Send one message frame
    async fn send(&mut self, frame: Bytes) -> io::Result<()>;

    /// Receive the next message frame; `None` when the peer closed
    async fn recv(&mut self) -> io::Result<Option<Bytes>>;
}

/// TCP-backed message socket framing messages with a u32 length prefix
#[derive(Debug)]
pub struct TcpMessageSocket {
    stream: TcpStream,
    buffer: BytesMut,
}

impl TcpMessageSocket {
    /// Connect to `address` within `timeout`
    pub async fn connect(address: &str, timeout: Duration) -> Result<Self, ConnectError> {
        match tokio::time::timeout(timeout, TcpStream::connect(address)).await {
            Err(_) => Err(ConnectError::Timeout(timeout)),
            Ok(Err(e)) if e.kind() == io::ErrorKind::ConnectionRefused => {
                Err(ConnectError::Refused(address.to_string()))
            }
            Ok(Err(e)) => Err(ConnectError::Unreachable(address.to_string(), e.to_string())),
            Ok(Ok(stream)) => Ok(Self {
                stream,
                buffer: BytesMut::with_capacity(4096),
            }),
        }
    }

    /// Pop one complete frame off the read buffer, if present
    fn take_frame(&mut self) -> Option<Bytes> {
        if self.buffer.len() < 4 {
            return None;
        }
        let len = u32::from_be_bytes([self.buffer[0], self.buffer[1], self.buffer[2], self.buffer[3]])
            as usize;
        if self.buffer.len() < 4 + len {
            return None;
        }
        self.buffer.advance(4);
        Some(self.buffer.split_to(len).freeze())
    }
}

#[async_trait]
impl MessageSocket for TcpMessageSocket {
    async fn send(&mut self, frame: Bytes) -> io::Result<()> {
        self.stream.write_u32(frame.len() as u32).await?;
        self.stream.write_all(&frame).await?;
        self.stream.flush().await
    }

    async fn recv(&mut self) -> io::Result<Option<Bytes>> {
        loop {
            if let Some(frame) = self.take_frame() {
                return Ok(Some(frame));
            }
            // Data accumulates in the persistent buffer, so cancelling
            // between reads never loses a partial frame.
            let n = self.stream.read_buf(&mut self.buffer).await?;
            if n == 0 {
                if self.buffer.is_empty() {
                    return Ok(None);
                }
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "peer closed mid-frame",
                ));
            }
        }
    }
}

/// Options governing transport behavior
#[derive(Debug, Clone)]
pub struct TransportOptions {
    /// Connect and handshake timeout
    pub connect_timeout: Duration,
    /// Default per-call timeout
    pub call_timeout: Duration,
    /// Consecutive timeouts before the connection degrades to fail-fast
    pub unhealthy_threshold: u32,
    /// Depth of the pending-call queue
    pub queue_depth: usize,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self::from(&TransportConfig::default())
    }
}

impl From<&TransportConfig> for TransportOptions {
    fn from(config: &TransportConfig) -> Self {
        Self {
            connect_timeout: config.connect_timeout(),
            call_timeout: config.call_timeout(),
            unhealthy_threshold: config.unhealthy_threshold,
            queue_depth: config.queue_depth,
        }
    }
}

/// One queued call waiting for dispatch
#[derive(Debug)]
struct PendingCall {
    request: Request,
    deadline: Duration,
    reply_tx: oneshot::Sender<Result<Value, CallError>>,
}

/// Handle to one connection, shared by every device driver using it
#[derive(Debug, Clone)]
pub struct Transport {
    endpoint: String,
    options: TransportOptions,
    queue: mpsc::Sender<PendingCall>,
    push_tx: broadcast::Sender<PushEvent>,
    shutdown: Arc<Notify>,
    connected: Arc<AtomicBool>,
    healthy: Arc<AtomicBool>,
}

impl Transport {
    /// Connect to the remote server over TCP and perform the liveness
    /// handshake before returning
    pub async fn connect(endpoint: &str, options: TransportOptions) -> Result<Self, ConnectError> {
        let socket = TcpMessageSocket::connect(endpoint, options.connect_timeout).await?;
        Self::with_socket(endpoint, options, Box::new(socket)).await
    }

    /// Build a transport over an already-established message socket and
    /// perform the liveness handshake
    pub async fn with_socket(
        endpoint: &str,
        options: TransportOptions,
        socket: Box<dyn MessageSocket>,
    ) -> Result<Self, ConnectError> {
        let (queue_tx, queue_rx) = mpsc::channel(options.queue_depth);
        let (push_tx, _) = broadcast::channel(PUSH_CHANNEL_CAPACITY);
        let shutdown = Arc::new(Notify::new());
        let connected = Arc::new(AtomicBool::new(true));
        let healthy = Arc::new(AtomicBool::new(true));

        let dispatcher = Dispatcher {
            socket,
            queue: queue_rx,
            push_tx: push_tx.clone(),
            shutdown: shutdown.clone(),
            connected: connected.clone(),
            healthy: healthy.clone(),
            consecutive_timeouts: 0,
            unhealthy_threshold: options.unhealthy_threshold,
        };
        tokio::spawn(dispatcher.run());

        let transport = Self {
            endpoint: endpoint.to_string(),
            options,
            queue: queue_tx,
            push_tx,
            shutdown,
            connected,
            healthy,
        };
        transport.handshake().await?;
        info!(endpoint = %transport.endpoint, "connected to control server");
        Ok(transport)
    }

    /// Confirm liveness with a `test_connection` call, retrying once.
    /// This is the only automatic retry in the client.
    async fn handshake(&self) -> Result<(), ConnectError> {
        let timeout = self.options.connect_timeout;
        match self
            .call_with_timeout("test_connection", Value::Null, timeout)
            .await
        {
            Ok(identity) => {
                debug!(endpoint = %self.endpoint, ?identity, "handshake complete");
                Ok(())
            }
            Err(first) => {
                debug!(endpoint = %self.endpoint, "handshake attempt failed ({}), retrying", first);
                match self
                    .call_with_timeout("test_connection", Value::Null, timeout)
                    .await
                {
                    Ok(identity) => {
                        debug!(endpoint = %self.endpoint, ?identity, "handshake complete");
                        Ok(())
                    }
                    Err(second) => {
                        self.disconnect();
                        Err(ConnectError::Handshake(
                            self.endpoint.clone(),
                            second.to_string(),
                        ))
                    }
                }
            }
        }
    }

    /// The endpoint this transport is connected to
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// The options this transport was created with
    pub fn options(&self) -> &TransportOptions {
        &self.options
    }

    /// Whether the connection is still up
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Whether the connection is below its consecutive-timeout threshold
    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }

    /// Issue a call with the default timeout
    pub async fn call(&self, command: &str, arguments: Value) -> Result<Value, CallError> {
        self.call_with_timeout(command, arguments, self.options.call_timeout)
            .await
    }

    /// Issue a call with an explicit deadline covering the wire round trip
    pub async fn call_with_timeout(
        &self,
        command: &str,
        arguments: Value,
        timeout: Duration,
    ) -> Result<Value, CallError> {
        if !self.is_connected() {
            return Err(CallError::Disconnected);
        }
        if !self.is_healthy() {
            return Err(CallError::Unhealthy);
        }

        let request = Request::new(command, arguments);
        trace!(command, call_id = %request.id, "enqueueing call");

        let (reply_tx, reply_rx) = oneshot::channel();
        let pending = PendingCall {
            request,
            deadline: timeout,
            reply_tx,
        };
        self.queue
            .send(pending)
            .await
            .map_err(|_| CallError::Disconnected)?;

        match reply_rx.await {
            Ok(result) => result,
            // The dispatcher dropped the slot without answering
            Err(_) => Err(CallError::Disconnected),
        }
    }

    /// Subscribe to unsolicited push events
    pub fn subscribe(&self) -> broadcast::Receiver<PushEvent> {
        self.push_tx.subscribe()
    }

    /// Tear the connection down, failing all pending calls with
    /// [`CallError::Disconnected`]. Idempotent.
    pub fn disconnect(&self) {
        if self.connected.swap(false, Ordering::SeqCst) {
            debug!(endpoint = %self.endpoint, "disconnecting transport");
            self.shutdown.notify_one();
        }
    }
}

/// The single serialization point owning raw socket access
struct Dispatcher {
    socket: Box<dyn MessageSocket>,
    queue: mpsc::Receiver<PendingCall>,
    push_tx: broadcast::Sender<PushEvent>,
    shutdown: Arc<Notify>,
    connected: Arc<AtomicBool>,
    healthy: Arc<AtomicBool>,
    consecutive_timeouts: u32,
    unhealthy_threshold: u32,
}

impl Dispatcher {
    async fn run(mut self) {
        loop {
            tokio::select! {
                _ = self.shutdown.notified() => break,
                maybe_pending = self.queue.recv() => match maybe_pending {
                    Some(pending) => {
                        if !self.dispatch(pending).await {
                            break;
                        }
                    }
                    // Every transport handle is gone
                    None => break,
                },
                inbound = self.socket.recv() => match inbound {
                    Ok(Some(frame)) => self.handle_unsolicited(&frame),
                    Ok(None) => {
                        info!("connection closed by peer");
                        break;
                    }
                    Err(e) => {
                        warn!("socket receive failed: {}", e);
                        break;
                    }
                },
            }
        }
        self.fail_remaining().await;
    }

    /// Send one pending call to the wire and wait for its reply.
    /// Returns false when the connection is no longer usable.
    async fn dispatch(&mut self, pending: PendingCall) -> bool {
        if !self.healthy.load(Ordering::SeqCst) {
            let _ = pending.reply_tx.send(Err(CallError::Unhealthy));
            return true;
        }
        if pending.reply_tx.is_closed() {
            // Caller gave up before dispatch; never touches the wire
            trace!(call_id = %pending.request.id, "pending call cancelled before dispatch");
            return true;
        }

        let frame = match wire::encode_request(&pending.request) {
            Ok(frame) => frame,
            Err(e) => {
                let _ = pending.reply_tx.send(Err(e));
                return true;
            }
        };
        if let Err(e) = self.socket.send(frame).await {
            warn!("socket send failed: {}", e);
            let _ = pending.reply_tx.send(Err(CallError::Disconnected));
            return false;
        }

        let deadline = Instant::now() + pending.deadline;
        loop {
            let inbound = tokio::select! {
                _ = self.shutdown.notified() => {
                    let _ = pending.reply_tx.send(Err(CallError::Disconnected));
                    return false;
                }
                inbound = tokio::time::timeout_at(deadline, self.socket.recv()) => inbound,
            };

            let bytes = match inbound {
                Err(_) => {
                    self.consecutive_timeouts += 1;
                    warn!(
                        command = %pending.request.command,
                        consecutive = self.consecutive_timeouts,
                        "call timed out after {:?}",
                        pending.deadline
                    );
                    if self.consecutive_timeouts >= self.unhealthy_threshold {
                        warn!(
                            threshold = self.unhealthy_threshold,
                            "consecutive timeout threshold reached, marking connection unhealthy"
                        );
                        self.healthy.store(false, Ordering::SeqCst);
                    }
                    let _ = pending.reply_tx.send(Err(CallError::Timeout(pending.deadline)));
                    return true;
                }
                Ok(Ok(Some(bytes))) => bytes,
                Ok(Ok(None)) => {
                    info!("connection closed by peer");
                    let _ = pending.reply_tx.send(Err(CallError::Disconnected));
                    return false;
                }
                Ok(Err(e)) => {
                    warn!("socket receive failed: {}", e);
                    let _ = pending.reply_tx.send(Err(CallError::Disconnected));
                    return false;
                }
            };

            match wire::decode_frame(&bytes) {
                Ok(Frame::Reply(reply)) if reply.id == pending.request.id => {
                    self.consecutive_timeouts = 0;
                    let result = match reply.status {
                        ReplyStatus::Ok => Ok(reply.payload),
                        ReplyStatus::Error => Err(CallError::Rejected(
                            reply.error.unwrap_or_else(|| "unspecified error".to_string()),
                        )),
                    };
                    let _ = pending.reply_tx.send(result);
                    return true;
                }
                Ok(Frame::Reply(stale)) => {
                    // Reply to a call that already timed out locally
                    warn!(call_id = %stale.id, "dropping stale reply");
                }
                Ok(Frame::Push(event)) => {
                    trace!(event = %event.event, "push event");
                    let _ = self.push_tx.send(event);
                }
                Err(e) => {
                    let _ = pending.reply_tx.send(Err(e));
                    return true;
                }
            }
        }
    }

    /// Handle a frame that arrived while no call was in flight
    fn handle_unsolicited(&mut self, bytes: &[u8]) {
        match wire::decode_frame(bytes) {
            Ok(Frame::Push(event)) => {
                trace!(event = %event.event, "push event");
                let _ = self.push_tx.send(event);
            }
            Ok(Frame::Reply(stale)) => {
                warn!(call_id = %stale.id, "dropping stale reply");
            }
            Err(e) => {
                warn!("dropping malformed frame: {}", e);
            }
        }
    }

    /// Fail everything still queued and mark the connection down
    async fn fail_remaining(&mut self) {
        self.connected.store(false, Ordering::SeqCst);
        self.queue.close();
        while let Some(pending) = self.queue.recv().await {
            let _ = pending.reply_tx.send(Err(CallError::Disconnected));
        }
        info!("transport dispatcher stopped");
    }
}

#[cfg(test)]
pub(crate) mod testkit {
    //! Scripted in-memory message socket for exercising the dispatcher
    //! and the drivers above it without a real server.

    use std::sync::Mutex as StdMutex;

    use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

    use super::*;
    use crate::wire::Reply;

    /// Scripted behavior for one incoming request
    pub(crate) enum MockBehavior {
        /// Reply ok with this payload
        Ok(Value),
        /// Reply with a server-side error
        Fail(String),
        /// Never reply
        Silent,
        /// Emit these raw frames in order
        Frames(Vec<Frame>),
    }

    /// In-memory message socket driven by a request script
    pub(crate) struct MockSocket {
        script: Box<dyn FnMut(&Request) -> MockBehavior + Send>,
        inbound_tx: UnboundedSender<Bytes>,
        inbound_rx: UnboundedReceiver<Bytes>,
        sent: Arc<StdMutex<Vec<String>>>,
    }

    /// Test-side handle: inject pushes and inspect the send order
    #[derive(Clone)]
    pub(crate) struct MockServer {
        inbound_tx: UnboundedSender<Bytes>,
        sent: Arc<StdMutex<Vec<String>>>,
    }

    impl MockServer {
        /// Inject an unsolicited push frame
        pub(crate) fn push(&self, event: &str, payload: Value) {
            let frame = wire::encode_push(&PushEvent {
                event: event.to_string(),
                payload,
            })
            .expect("encode push");
            let _ = self.inbound_tx.send(frame);
        }

        /// Commands observed on the wire, in transmission order
        pub(crate) fn sent_commands(&self) -> Vec<String> {
            self.sent.lock().unwrap().clone()
        }
    }

    /// Create a scripted socket and its test-side handle
    pub(crate) fn mock_socket<F>(script: F) -> (MockSocket, MockServer)
    where
        F: FnMut(&Request) -> MockBehavior + Send + 'static,
    {
        let (inbound_tx, inbound_rx) = unbounded_channel();
        let sent = Arc::new(StdMutex::new(Vec::new()));
        let socket = MockSocket {
            script: Box::new(script),
            inbound_tx: inbound_tx.clone(),
            inbound_rx,
            sent: sent.clone(),
        };
        let server = MockServer { inbound_tx, sent };
        (socket, server)
    }

    #[async_trait]
    impl MessageSocket for MockSocket {
        async fn send(&mut self, frame: Bytes) -> io::Result<()> {
            let request = wire::decode_request(&frame).expect("mock received malformed request");
            self.sent.lock().unwrap().push(request.command.clone());
            match (self.script)(&request) {
                MockBehavior::Ok(payload) => {
                    let frame =
                        wire::encode_reply(&Reply::ok(request.id, payload)).expect("encode reply");
                    let _ = self.inbound_tx.send(frame);
                }
                MockBehavior::Fail(message) => {
                    let frame = wire::encode_reply(&Reply::error(request.id, message))
                        .expect("encode reply");
                    let _ = self.inbound_tx.send(frame);
                }
                MockBehavior::Silent => {}
                MockBehavior::Frames(frames) => {
                    for frame in frames {
                        let bytes = match &frame {
                            Frame::Reply(reply) => wire::encode_reply(reply),
                            Frame::Push(push) => wire::encode_push(push),
                        }
                        .expect("encode frame");
                        let _ = self.inbound_tx.send(bytes);
                    }
                }
            }
            Ok(())
        }

        async fn recv(&mut self) -> io::Result<Option<Bytes>> {
            Ok(self.inbound_rx.recv().await)
        }
    }

    /// Script fragment answering the handshake and delegating the rest
    pub(crate) fn with_handshake<F>(mut rest: F) -> impl FnMut(&Request) -> MockBehavior + Send
    where
        F: FnMut(&Request) -> MockBehavior + Send + 'static,
    {
        move |request: &Request| {
            if request.command == "test_connection" {
                MockBehavior::Ok(beamflow_core::object! { "server" => "mock" })
            } else {
                rest(request)
            }
        }
    }

    /// Connect a transport over a scripted socket that answers the handshake
    pub(crate) async fn connect_mock<F>(
        options: TransportOptions,
        script: F,
    ) -> (Transport, MockServer)
    where
        F: FnMut(&Request) -> MockBehavior + Send + 'static,
    {
        let (socket, server) = mock_socket(with_handshake(script));
        let transport = Transport::with_socket("mock:0", options, Box::new(socket))
            .await
            .expect("mock handshake");
        (transport, server)
    }
}

#[cfg(test)]
mod tests {
    use super::testkit::*;
    use super::*;
    use beamflow_core::object;

    fn fast_options() -> TransportOptions {
        TransportOptions {
            connect_timeout: Duration::from_millis(500),
            call_timeout: Duration::from_millis(500),
            unhealthy_threshold: 3,
            queue_depth: 32,
        }
    }

    #[test_log::test(tokio::test)]
    async fn test_handshake_confirms_liveness() {
        let (transport, server) =
            connect_mock(fast_options(), |_| MockBehavior::Ok(Value::Null)).await;

        assert!(transport.is_connected());
        assert!(transport.is_healthy());
        assert_eq!(server.sent_commands(), vec!["test_connection"]);
    }

    #[test_log::test(tokio::test)]
    async fn test_handshake_failure_is_retried_once() {
        let (socket, server) = mock_socket(|request| {
            assert_eq!(request.command, "test_connection");
            MockBehavior::Fail("not yet up".to_string())
        });

        let result = Transport::with_socket("mock:0", fast_options(), Box::new(socket)).await;
        match result {
            Err(ConnectError::Handshake(endpoint, _)) => assert_eq!(endpoint, "mock:0"),
            other => panic!("expected handshake error, got {:?}", other),
        }
        assert_eq!(
            server.sent_commands(),
            vec!["test_connection", "test_connection"]
        );
    }

    #[test_log::test(tokio::test)]
    async fn test_call_returns_payload() {
        let (transport, _server) = connect_mock(fast_options(), |request| {
            assert_eq!(request.command, "get_freerun");
            MockBehavior::Ok(object! { "data" => Value::Array(vec![Value::Float(1.25)]) })
        })
        .await;

        let payload = transport
            .call("get_freerun", object! { "names" => Value::Array(vec!["New AI 2".into()]) })
            .await
            .unwrap();
        assert_eq!(
            payload.get("data").and_then(Value::as_array).map(|a| a.len()),
            Some(1)
        );
    }

    #[test_log::test(tokio::test)]
    async fn test_server_rejection_is_typed() {
        let (transport, _server) =
            connect_mock(fast_options(), |_| MockBehavior::Fail("no such motor".into())).await;

        let err = transport.call("move_motor", Value::Null).await.unwrap_err();
        match err {
            CallError::Rejected(message) => assert_eq!(message, "no such motor"),
            other => panic!("expected rejection, got {:?}", other),
        }
    }

    #[test_log::test(tokio::test)]
    async fn test_concurrent_calls_keep_fifo_order() {
        let (transport, server) =
            connect_mock(fast_options(), |_| MockBehavior::Ok(Value::Null)).await;

        let c1 = transport.call("first", Value::Null);
        let c2 = transport.call("second", Value::Null);
        let c3 = transport.call("third", Value::Null);
        let (r1, r2, r3) = tokio::join!(c1, c2, c3);
        r1.unwrap();
        r2.unwrap();
        r3.unwrap();

        assert_eq!(
            server.sent_commands(),
            vec!["test_connection", "first", "second", "third"]
        );
    }

    #[test_log::test(tokio::test)]
    async fn test_timeout_is_isolated() {
        let (transport, _server) = connect_mock(fast_options(), |request| {
            if request.command == "slow" {
                MockBehavior::Silent
            } else {
                MockBehavior::Ok(object! { "answer" => 42 })
            }
        })
        .await;

        let deadline = Duration::from_millis(50);
        let started = std::time::Instant::now();
        let err = transport
            .call_with_timeout("slow", Value::Null, deadline)
            .await
            .unwrap_err();
        let elapsed = started.elapsed();

        assert!(matches!(err, CallError::Timeout(d) if d == deadline));
        assert!(elapsed >= deadline, "resolved before the deadline");
        assert!(elapsed < Duration::from_millis(500), "resolved far past the deadline");

        // The stalled call does not poison the connection
        let payload = transport.call("fast", Value::Null).await.unwrap();
        assert_eq!(payload.get("answer").and_then(Value::as_integer), Some(42));
        assert!(transport.is_healthy());
    }

    #[test_log::test(tokio::test)]
    async fn test_stale_reply_is_dropped() {
        use crate::wire::Reply;

        let mut stalled_id = None;
        let (transport, _server) = connect_mock(fast_options(), move |request| {
            match request.command.as_str() {
                "slow" => {
                    stalled_id = Some(request.id);
                    MockBehavior::Silent
                }
                "fast" => {
                    // The reply to the timed-out call arrives late, right
                    // before the reply the dispatcher is actually waiting on
                    let stale = Reply::ok(stalled_id.take().expect("slow ran first"), Value::Null);
                    let real = Reply::ok(request.id, object! { "answer" => 7 });
                    MockBehavior::Frames(vec![Frame::Reply(stale), Frame::Reply(real)])
                }
                other => panic!("unexpected command {}", other),
            }
        })
        .await;

        let err = transport
            .call_with_timeout("slow", Value::Null, Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, CallError::Timeout(_)));

        let payload = transport.call("fast", Value::Null).await.unwrap();
        assert_eq!(payload.get("answer").and_then(Value::as_integer), Some(7));
    }

    #[test_log::test(tokio::test)]
    async fn test_unhealthy_after_consecutive_timeouts() {
        let mut options = fast_options();
        options.unhealthy_threshold = 2;
        let (transport, _server) = connect_mock(options, |_| MockBehavior::Silent).await;

        let deadline = Duration::from_millis(20);
        for _ in 0..2 {
            let err = transport
                .call_with_timeout("slow", Value::Null, deadline)
                .await
                .unwrap_err();
            assert!(matches!(err, CallError::Timeout(_)));
        }
        assert!(!transport.is_healthy());

        // Fail-fast: no new deadline is awaited
        let started = std::time::Instant::now();
        let err = transport
            .call_with_timeout("slow", Value::Null, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, CallError::Unhealthy));
        assert!(started.elapsed() < Duration::from_millis(100));
    }

    #[test_log::test(tokio::test)]
    async fn test_disconnect_fails_pending_and_is_idempotent() {
        let (transport, _server) = connect_mock(fast_options(), |request| {
            if request.command == "hang" {
                MockBehavior::Silent
            } else {
                MockBehavior::Ok(Value::Null)
            }
        })
        .await;

        let hanging = {
            let transport = transport.clone();
            tokio::spawn(async move {
                transport
                    .call_with_timeout("hang", Value::Null, Duration::from_secs(5))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        transport.disconnect();
        transport.disconnect();

        let result = hanging.await.unwrap();
        assert!(matches!(result, Err(CallError::Disconnected)));
        assert!(!transport.is_connected());

        let err = transport.call("anything", Value::Null).await.unwrap_err();
        assert!(matches!(err, CallError::Disconnected));
    }

    #[test_log::test(tokio::test)]
    async fn test_push_events_are_broadcast() {
        let (transport, server) =
            connect_mock(fast_options(), |_| MockBehavior::Ok(Value::Null)).await;

        let mut updates = transport.subscribe();
        server.push("motor_status", object! { "name" => "Motor 2", "moving" => true });

        let event = tokio::time::timeout(Duration::from_millis(500), updates.recv())
            .await
            .expect("push not delivered")
            .unwrap();
        assert_eq!(event.event, "motor_status");
        assert_eq!(
            event.payload.get("moving").and_then(Value::as_bool),
            Some(true)
        );
    }
}
