//! Transport ownership and the command dispatch worker
//!
//! A [`Transport`] owns the byte stream to one server and knows how to put
//! command frames on the wire and pull decoded replies off it. The
//! [`TransportWorker`] runs on its own task and owns everything stateful
//! about dispatch: the hi/normal priority queues, the FIFO correlation of
//! in-flight commands to replies, automatic `SELECT` insertion, owner-based
//! cancellation and reconnection. The connection talks to the worker
//! exclusively through channels, so the worker never re-enters caller code
//! on its own stack.

use crate::command::Command;
use crate::core::error::{RedisError, RedisResult};
use crate::core::value::RespValue;
use crate::protocol::{RespDecoder, RespEncoder};
use crate::response::Response;
use async_trait::async_trait;
use bytes::{Buf, Bytes, BytesMut};
use std::collections::VecDeque;
use std::io::Cursor;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Events the worker emits toward the connection
#[derive(Debug, Clone)]
pub enum TransporterEvent {
    /// The transport finished connecting (also after a reconnect)
    Connected,
    /// The transport failed; the worker has terminated
    ErrorOccurred(String),
    /// Both queues and the in-flight window drained
    QueueIsEmpty,
    /// Informational message
    Log(String),
}

/// Requests the connection sends to the worker
pub(crate) enum WorkerRequest {
    Enqueue(Command),
    CancelOwner(u64),
    ReconnectTo(String, u16),
    Shutdown,
}

/// Byte-stream ownership: connect, write frames, read decoded replies.
///
/// The default implementation is [`TcpTransport`]; SSH tunnels or TLS wrap
/// the same seam via [`crate::Connection::set_transport`].
#[async_trait]
pub trait Transport: Send {
    /// Establish the stream to `host:port` within `timeout`
    async fn connect(&mut self, host: &str, port: u16, timeout: Duration) -> RedisResult<()>;

    /// Write one encoded command within `timeout`
    async fn send(&mut self, payload: Bytes, timeout: Duration) -> RedisResult<()>;

    /// Read the next complete reply. Must be cancellation safe: dropping the
    /// future leaves partially read bytes buffered for the next call.
    async fn read_reply(&mut self) -> RedisResult<RespValue>;

    /// Tear the stream down
    async fn close(&mut self);
}

/// Plain TCP transport with RESP2 framing
pub struct TcpTransport {
    stream: Option<TcpStream>,
    buffer: BytesMut,
    keepalive: Option<Duration>,
}

impl TcpTransport {
    /// Create an unconnected TCP transport
    #[must_use]
    pub fn new(keepalive: Option<Duration>) -> Self {
        Self {
            stream: None,
            buffer: BytesMut::with_capacity(8192),
            keepalive,
        }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn connect(&mut self, host: &str, port: u16, timeout: Duration) -> RedisResult<()> {
        debug!("Connecting to {}:{}", host, port);

        let stream = tokio::time::timeout(timeout, TcpStream::connect((host, port)))
            .await
            .map_err(|_| RedisError::Timeout)?
            .map_err(|e| {
                RedisError::Transport(format!("Failed to connect to {host}:{port}: {e}"))
            })?;

        let stream = if let Some(keepalive) = self.keepalive {
            let socket = socket2::Socket::from(stream.into_std()?);
            let params = socket2::TcpKeepalive::new().with_time(keepalive);
            socket
                .set_tcp_keepalive(&params)
                .map_err(|e| RedisError::Transport(format!("Failed to set TCP keepalive: {e}")))?;
            TcpStream::from_std(socket.into())?
        } else {
            stream
        };

        self.buffer.clear();
        self.stream = Some(stream);
        Ok(())
    }

    async fn send(&mut self, payload: Bytes, timeout: Duration) -> RedisResult<()> {
        let stream = self.stream.as_mut().ok_or(RedisError::NotConnected)?;

        tokio::time::timeout(timeout, stream.write_all(&payload))
            .await
            .map_err(|_| RedisError::Timeout)??;

        Ok(())
    }

    async fn read_reply(&mut self) -> RedisResult<RespValue> {
        let stream = self.stream.as_mut().ok_or(RedisError::NotConnected)?;

        loop {
            let mut cursor = Cursor::new(&self.buffer[..]);
            if let Some(value) = RespDecoder::decode(&mut cursor)? {
                let consumed = cursor.position() as usize;
                self.buffer.advance(consumed);
                return Ok(value);
            }

            let n = stream.read_buf(&mut self.buffer).await?;
            if n == 0 {
                return Err(RedisError::Transport(
                    "Connection closed by server".to_string(),
                ));
            }
        }
    }

    async fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.shutdown().await;
        }
        self.buffer.clear();
    }
}

const DB_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

/// Current database index shared between the connection and its worker.
/// Writes take a 5-second-bounded lock; a write that cannot acquire it in
/// time is dropped with a warning.
pub(crate) struct DbNumberCell {
    value: AtomicI64,
    guard: tokio::sync::Mutex<()>,
}

impl DbNumberCell {
    pub(crate) fn new() -> Self {
        Self {
            value: AtomicI64::new(0),
            guard: tokio::sync::Mutex::new(()),
        }
    }

    pub(crate) fn get(&self) -> i64 {
        self.value.load(Ordering::SeqCst)
    }

    pub(crate) fn reset(&self) {
        self.value.store(0, Ordering::SeqCst);
    }

    pub(crate) async fn set(&self, db: i64) {
        match tokio::time::timeout(DB_LOCK_TIMEOUT, self.guard.lock()).await {
            Ok(_guard) => self.value.store(db, Ordering::SeqCst),
            Err(_) => warn!("Cannot lock db number mutex, keeping db {}", self.get()),
        }
    }
}

struct InFlight {
    cmd: Command,
    /// Reply must be discarded (owner cancelled while on the wire)
    discard: bool,
    /// Set for worker-inserted SELECT commands; carries the target db
    select_target: Option<i64>,
    sent_at: Instant,
}

enum Flow {
    Continue,
    Stop,
}

enum Wake {
    Request(Option<WorkerRequest>),
    Reply(RedisResult<RespValue>),
    ExecuteTimeout,
}

/// The dispatch worker: owns the transport and all queue state
pub(crate) struct TransportWorker {
    transport: Box<dyn Transport>,
    host: String,
    port: u16,
    connection_timeout: Duration,
    execute_timeout: Duration,
    requests: mpsc::UnboundedReceiver<WorkerRequest>,
    events: mpsc::UnboundedSender<TransporterEvent>,
    db_number: std::sync::Arc<DbNumberCell>,
    hi_queue: VecDeque<Command>,
    queue: VecDeque<Command>,
    in_flight: VecDeque<InFlight>,
    connected: bool,
    current_db: i64,
}

impl TransportWorker {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        transport: Box<dyn Transport>,
        host: String,
        port: u16,
        connection_timeout: Duration,
        execute_timeout: Duration,
        requests: mpsc::UnboundedReceiver<WorkerRequest>,
        events: mpsc::UnboundedSender<TransporterEvent>,
        db_number: std::sync::Arc<DbNumberCell>,
    ) -> Self {
        Self {
            transport,
            host,
            port,
            connection_timeout,
            execute_timeout,
            requests,
            events,
            db_number,
            hi_queue: VecDeque::new(),
            queue: VecDeque::new(),
            in_flight: VecDeque::new(),
            connected: false,
            current_db: 0,
        }
    }

    pub(crate) async fn run(mut self) {
        if let Err(e) = self
            .transport
            .connect(&self.host, self.port, self.connection_timeout)
            .await
        {
            self.fail(&e.to_string()).await;
            return;
        }

        self.connected = true;
        self.emit(TransporterEvent::Log(format!(
            "Connected to {}:{}",
            self.host, self.port
        )));
        self.emit(TransporterEvent::Connected);

        loop {
            if let Err(msg) = self.flush_queues().await {
                self.fail(&msg).await;
                return;
            }

            let deadline = self
                .in_flight
                .front()
                .map(|entry| entry.sent_at + self.execute_timeout);
            let sleep_until = deadline
                .unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));

            let wake = tokio::select! {
                request = self.requests.recv() => Wake::Request(request),
                reply = self.transport.read_reply(), if !self.in_flight.is_empty() => {
                    Wake::Reply(reply)
                }
                () = tokio::time::sleep_until(sleep_until), if deadline.is_some() => {
                    Wake::ExecuteTimeout
                }
            };

            match wake {
                Wake::Request(None) => {
                    self.shutdown().await;
                    return;
                }
                Wake::Request(Some(request)) => {
                    if matches!(self.handle_request(request).await, Flow::Stop) {
                        return;
                    }
                    // drain whatever piled up before touching the wire again,
                    // so hi-priority commands can overtake queued work
                    while let Ok(request) = self.requests.try_recv() {
                        if matches!(self.handle_request(request).await, Flow::Stop) {
                            return;
                        }
                    }
                }
                Wake::Reply(Ok(value)) => {
                    self.dispatch_reply(value).await;
                }
                Wake::Reply(Err(e)) => {
                    self.fail(&e.to_string()).await;
                    return;
                }
                Wake::ExecuteTimeout => {
                    self.fail("Execution timeout").await;
                    return;
                }
            }
        }
    }

    async fn handle_request(&mut self, request: WorkerRequest) -> Flow {
        match request {
            WorkerRequest::Enqueue(cmd) => {
                if cmd.is_hi_priority() {
                    self.hi_queue.push_back(cmd);
                } else {
                    self.queue.push_back(cmd);
                }
                Flow::Continue
            }
            WorkerRequest::CancelOwner(owner_id) => {
                self.cancel_owner(owner_id);
                Flow::Continue
            }
            WorkerRequest::ReconnectTo(host, port) => {
                if let Err(msg) = self.reconnect(host, port).await {
                    self.fail(&msg).await;
                    Flow::Stop
                } else {
                    Flow::Continue
                }
            }
            WorkerRequest::Shutdown => {
                self.shutdown().await;
                Flow::Stop
            }
        }
    }

    /// Put every queued command on the wire, hi-priority class first.
    async fn flush_queues(&mut self) -> Result<(), String> {
        if !self.connected {
            return Ok(());
        }

        loop {
            let cmd = match self.hi_queue.pop_front() {
                Some(cmd) => cmd,
                None => match self.queue.pop_front() {
                    Some(cmd) => cmd,
                    None => return Ok(()),
                },
            };

            let db = cmd.db();
            if db >= 0 && db != self.current_db {
                let select = Command::new([
                    Bytes::from_static(b"SELECT"),
                    Bytes::from(db.to_string()),
                ]);
                self.send_command(select, Some(db)).await?;
            }

            self.send_command(cmd, None).await?;
        }
    }

    async fn send_command(
        &mut self,
        mut cmd: Command,
        select_target: Option<i64>,
    ) -> Result<(), String> {
        let payload = RespEncoder::encode_parts(cmd.parts());

        match self.transport.send(payload, self.execute_timeout).await {
            Ok(()) => {
                self.in_flight.push_back(InFlight {
                    cmd,
                    discard: false,
                    select_target,
                    sent_at: Instant::now(),
                });
                Ok(())
            }
            Err(e) => {
                let msg = e.to_string();
                cmd.complete_with_error(&msg);
                Err(msg)
            }
        }
    }

    async fn dispatch_reply(&mut self, value: RespValue) {
        let Some(mut entry) = self.in_flight.pop_front() else {
            self.emit(TransporterEvent::Log(
                "Dropping unexpected reply with empty dispatch window".to_string(),
            ));
            return;
        };

        if let Some(db) = entry.select_target {
            if !value.is_error() {
                self.current_db = db;
                self.db_number.set(db).await;
            }
        }

        if entry.discard {
            return;
        }

        entry.cmd.complete_with_response(Response::new(value));

        if self.hi_queue.is_empty() && self.queue.is_empty() && self.in_flight.is_empty() {
            self.emit(TransporterEvent::QueueIsEmpty);
        }
    }

    fn cancel_owner(&mut self, owner_id: u64) {
        let matches_owner = |cmd: &Command| cmd.owner_id() == Some(owner_id);

        for queue in [&mut self.hi_queue, &mut self.queue] {
            queue.retain_mut(|cmd| {
                if matches_owner(cmd) {
                    cmd.cancel();
                    false
                } else {
                    true
                }
            });
        }

        for entry in &mut self.in_flight {
            if matches_owner(&entry.cmd) {
                entry.cmd.cancel();
                entry.discard = true;
            }
        }
    }

    async fn reconnect(&mut self, host: String, port: u16) -> Result<(), String> {
        self.emit(TransporterEvent::Log(format!(
            "Reconnecting to {host}:{port}"
        )));

        // replies for commands already on the wire are lost with the stream
        for mut entry in self.in_flight.drain(..) {
            if !entry.discard {
                entry.cmd.complete_with_error("Connection was reconnected");
            }
        }

        self.transport.close().await;
        self.connected = false;

        self.transport
            .connect(&host, port, self.connection_timeout)
            .await
            .map_err(|e| e.to_string())?;

        self.host = host;
        self.port = port;
        self.current_db = 0;
        self.db_number.reset();
        self.connected = true;

        self.emit(TransporterEvent::Connected);
        Ok(())
    }

    async fn fail(&mut self, message: &str) {
        for mut entry in self.in_flight.drain(..) {
            if !entry.discard {
                entry.cmd.complete_with_error(message);
            }
        }
        for mut cmd in self.hi_queue.drain(..).chain(self.queue.drain(..)) {
            cmd.complete_with_error(message);
        }

        self.transport.close().await;
        self.connected = false;
        self.emit(TransporterEvent::ErrorOccurred(message.to_string()));
    }

    async fn shutdown(&mut self) {
        for mut entry in self.in_flight.drain(..) {
            entry.cmd.cancel();
        }
        for mut cmd in self.hi_queue.drain(..).chain(self.queue.drain(..)) {
            cmd.cancel();
        }

        self.transport.close().await;
        self.connected = false;
        self.emit(TransporterEvent::Log("Transporter stopped".to_string()));
    }

    fn emit(&self, event: TransporterEvent) {
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::CommandOwner;
    use std::sync::{Arc, Mutex};

    /// Transport that records sent command lines and answers every command
    /// with +OK once the test releases a send permit. Send attempts are
    /// recorded before the gate so tests can wait until the worker is parked
    /// inside a send.
    struct GatedTransport {
        attempts: Arc<Mutex<Vec<String>>>,
        sent: Arc<Mutex<Vec<String>>>,
        permits: Arc<tokio::sync::Semaphore>,
        replies: Arc<tokio::sync::Semaphore>,
        pending_replies: usize,
    }

    impl GatedTransport {
        fn new(
            attempts: Arc<Mutex<Vec<String>>>,
            sent: Arc<Mutex<Vec<String>>>,
            permits: Arc<tokio::sync::Semaphore>,
            replies: Arc<tokio::sync::Semaphore>,
        ) -> Self {
            Self {
                attempts,
                sent,
                permits,
                replies,
                pending_replies: 0,
            }
        }
    }

    #[async_trait]
    impl Transport for GatedTransport {
        async fn connect(&mut self, _: &str, _: u16, _: Duration) -> RedisResult<()> {
            Ok(())
        }

        async fn send(&mut self, payload: Bytes, _: Duration) -> RedisResult<()> {
            let mut cursor = Cursor::new(&payload[..]);
            let frame = RespDecoder::decode(&mut cursor).unwrap().unwrap();
            let line = frame
                .array()
                .unwrap()
                .iter()
                .map(|part| part.as_string().unwrap())
                .collect::<Vec<_>>()
                .join(" ");

            self.attempts.lock().unwrap().push(line.clone());

            let permit = self.permits.acquire().await.expect("semaphore closed");
            permit.forget();

            self.sent.lock().unwrap().push(line);
            self.pending_replies += 1;
            Ok(())
        }

        async fn read_reply(&mut self) -> RedisResult<RespValue> {
            if self.pending_replies == 0 {
                // nothing outstanding; park until the future is dropped
                std::future::pending::<()>().await;
            }
            let permit = self.replies.acquire().await.expect("semaphore closed");
            permit.forget();
            self.pending_replies -= 1;
            Ok(RespValue::SimpleString("OK".to_string()))
        }

        async fn close(&mut self) {}
    }

    struct Harness {
        requests: mpsc::UnboundedSender<WorkerRequest>,
        events: mpsc::UnboundedReceiver<TransporterEvent>,
        attempts: Arc<Mutex<Vec<String>>>,
        sent: Arc<Mutex<Vec<String>>>,
        permits: Arc<tokio::sync::Semaphore>,
        replies: Arc<tokio::sync::Semaphore>,
        worker: tokio::task::JoinHandle<()>,
    }

    impl Harness {
        /// Spin until the worker is parked inside a send for `line`
        async fn wait_for_attempt(&self, line: &str) {
            loop {
                if self.attempts.lock().unwrap().iter().any(|a| a == line) {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        }
    }

    fn spawn_worker() -> Harness {
        let attempts = Arc::new(Mutex::new(Vec::new()));
        let sent = Arc::new(Mutex::new(Vec::new()));
        let permits = Arc::new(tokio::sync::Semaphore::new(0));
        let replies = Arc::new(tokio::sync::Semaphore::new(0));
        let transport = GatedTransport::new(
            attempts.clone(),
            sent.clone(),
            permits.clone(),
            replies.clone(),
        );

        let (req_tx, req_rx) = mpsc::unbounded_channel();
        let (ev_tx, ev_rx) = mpsc::unbounded_channel();

        let worker = TransportWorker::new(
            Box::new(transport),
            "localhost".to_string(),
            6379,
            Duration::from_secs(1),
            Duration::from_secs(60),
            req_rx,
            ev_tx,
            Arc::new(DbNumberCell::new()),
        );

        Harness {
            requests: req_tx,
            events: ev_rx,
            attempts,
            sent,
            permits,
            replies,
            worker: tokio::spawn(worker.run()),
        }
    }

    async fn wait_for_connected(harness: &mut Harness) {
        loop {
            match harness.events.recv().await.expect("worker died") {
                TransporterEvent::Connected => return,
                TransporterEvent::ErrorOccurred(e) => panic!("connect failed: {e}"),
                _ => {}
            }
        }
    }

    fn enqueue(harness: &Harness, cmd: Command) {
        harness
            .requests
            .send(WorkerRequest::Enqueue(cmd))
            .expect("worker gone");
    }

    #[tokio::test]
    async fn test_hi_priority_overtakes_queued_work() {
        let mut harness = spawn_worker();
        wait_for_connected(&mut harness).await;

        // first command blocks on the send gate, the rest pile up behind it
        let mut first = Command::new(["GET", "a"]);
        let first_future = first.arm();
        enqueue(&harness, first);
        harness.wait_for_attempt("GET a").await;

        let mut normal = Command::new(["GET", "b"]);
        let normal_future = normal.arm();
        enqueue(&harness, normal);

        let mut hi = Command::new(["AUTH", "pw"]);
        hi.mark_as_hi_priority();
        let hi_future = hi.arm();
        enqueue(&harness, hi);

        harness.permits.add_permits(3);
        harness.replies.add_permits(3);

        first_future.await.unwrap();
        hi_future.await.unwrap();
        normal_future.await.unwrap();

        let sent = harness.sent.lock().unwrap().clone();
        assert_eq!(sent, vec!["GET a", "AUTH pw", "GET b"]);
    }

    #[tokio::test]
    async fn test_replies_correlate_in_fifo_order() {
        let mut harness = spawn_worker();
        wait_for_connected(&mut harness).await;
        harness.permits.add_permits(16);
        harness.replies.add_permits(16);

        let completions = Arc::new(Mutex::new(Vec::new()));
        let mut futures = Vec::new();

        for name in ["a", "b", "c", "d"] {
            let log = completions.clone();
            let mut cmd = Command::new(["GET", name]).with_callback(move |_, _| {
                log.lock().unwrap().push(name.to_string());
            });
            futures.push(cmd.arm());
            enqueue(&harness, cmd);
        }

        for future in futures {
            future.await.unwrap();
        }

        assert_eq!(
            completions.lock().unwrap().clone(),
            vec!["a", "b", "c", "d"]
        );
    }

    #[tokio::test]
    async fn test_select_inserted_for_db_switch() {
        let mut harness = spawn_worker();
        wait_for_connected(&mut harness).await;
        harness.permits.add_permits(16);
        harness.replies.add_permits(16);

        let mut cmd = Command::new(["GET", "key"]).with_db(2);
        let future = cmd.arm();
        enqueue(&harness, cmd);
        future.await.unwrap();

        // same db again: no second SELECT
        let mut cmd = Command::new(["GET", "other"]).with_db(2);
        let future = cmd.arm();
        enqueue(&harness, cmd);
        future.await.unwrap();

        let sent = harness.sent.lock().unwrap().clone();
        assert_eq!(sent, vec!["SELECT 2", "GET key", "GET other"]);
    }

    #[tokio::test]
    async fn test_cancel_owner_drops_queued_commands() {
        let mut harness = spawn_worker();
        wait_for_connected(&mut harness).await;

        let owner = CommandOwner::new();

        // gate closed: commands stay queued in the worker
        let mut blocker = Command::new(["PING"]);
        let blocker_future = blocker.arm();
        enqueue(&harness, blocker);
        harness.wait_for_attempt("PING").await;

        let mut owned = Command::new(["GET", "key"]).with_owner(&owner);
        let owned_future = owned.arm();
        enqueue(&harness, owned);

        harness
            .requests
            .send(WorkerRequest::CancelOwner(owner.id()))
            .unwrap();

        harness.permits.add_permits(4);
        harness.replies.add_permits(4);
        blocker_future.await.unwrap();

        assert!(matches!(owned_future.await, Err(RedisError::Cancelled)));
        let sent = harness.sent.lock().unwrap().clone();
        assert_eq!(sent, vec!["PING"]);
    }

    #[tokio::test]
    async fn test_shutdown_cancels_all_pending() {
        let mut harness = spawn_worker();
        wait_for_connected(&mut harness).await;

        // command goes on the wire but its reply is withheld
        harness.permits.add_permits(4);
        let mut cmd = Command::new(["GET", "key"]);
        let future = cmd.arm();
        enqueue(&harness, cmd);
        harness.wait_for_attempt("GET key").await;

        harness.requests.send(WorkerRequest::Shutdown).unwrap();
        harness.worker.await.unwrap();

        assert!(matches!(future.await, Err(RedisError::Cancelled)));
    }

    #[tokio::test]
    async fn test_db_number_cell() {
        let cell = DbNumberCell::new();
        assert_eq!(cell.get(), 0);
        cell.set(3).await;
        assert_eq!(cell.get(), 3);
        cell.reset();
        assert_eq!(cell.get(), 0);
    }
}
