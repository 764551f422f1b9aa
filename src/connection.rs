//! The connection state machine and its command dispatch pipeline
//!
//! A [`Connection`] owns one transport worker, authenticates against the
//! server, detects the deployment mode (standalone, cluster, sentinel) and
//! routes commands accordingly. The user-facing API is callable from any
//! task; commands cross into the worker over a queued channel and complete
//! through per-command promises. Multi-node operations (cluster-wide key
//! scans and flushes) drive the worker through successive reconnects, one
//! master at a time.

use crate::command::{Command, CommandOwner, CommandOutcome, ResponseFuture, ScanCommand};
use crate::core::config::ConnectionConfig;
use crate::core::error::{RedisError, RedisResult};
use crate::response::Response;
use crate::script;
use crate::server_info::{DatabaseList, ServerInfo};
use crate::transporter::{
    DbNumberCell, TcpTransport, Transport, TransporterEvent, WorkerRequest,
    TransportWorker,
};
use bytes::Bytes;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Terminator sentinel used by incremental collection retrieval to mark the
/// final batch of a scan chain.
pub const END_OF_COLLECTION: &str = "end_of_collection";

const DEFAULT_SCAN_LIMIT: u64 = 10_000;
const EVENT_BUS_CAPACITY: usize = 128;

/// Deployment mode detected during authentication
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    /// Standalone server
    #[default]
    Normal,
    /// Sharded cluster deployment
    Cluster,
    /// Sentinel coordinator
    Sentinel,
}

/// Events published on the connection's event bus
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// Transport is up and authentication succeeded
    Connected,
    /// Authentication and mode detection completed
    AuthOk,
    /// Authentication failed
    AuthError(String),
    /// A connection-level error was surfaced
    Error(String),
    /// Informational message
    Log(String),
    /// Teardown started
    ShutdownStart,
    /// The dispatch queue drained
    QueueIsEmpty,
}

/// Namespace aggregation result: top-level namespaces with their key counts,
/// and the keys living outside any namespace.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NamespaceItems {
    /// Namespace prefix → number of keys underneath it
    pub namespaces: Vec<(Bytes, u64)>,
    /// Keys without a namespace separator
    pub root_keys: Vec<Bytes>,
}

struct Link {
    requests: mpsc::UnboundedSender<WorkerRequest>,
    worker: JoinHandle<()>,
}

struct Inner {
    config: RwLock<ConnectionConfig>,
    auto_connect: bool,
    mode: RwLock<Mode>,
    db_number: Arc<DbNumberCell>,
    server_info: RwLock<ServerInfo>,
    link: Mutex<Option<Link>>,
    custom_transport: Mutex<Option<Box<dyn Transport>>>,
    events: broadcast::Sender<ConnectionEvent>,
    stopping: AtomicBool,
}

/// Handle to a connection. Cloning shares the underlying connection; use
/// [`Connection::duplicate`] for a fresh detached connection with the same
/// configuration.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl Connection {
    /// Create a detached connection. Commands issued before [`connect`]
    /// completes are deferred until the connection comes up.
    ///
    /// [`connect`]: Connection::connect
    #[must_use]
    pub fn new(config: ConnectionConfig) -> Self {
        Self::build(config, true)
    }

    /// Create a detached connection that fails commands with
    /// [`RedisError::NotConnected`] instead of connecting on demand.
    #[must_use]
    pub fn new_without_auto_connect(config: ConnectionConfig) -> Self {
        Self::build(config, false)
    }

    fn build(config: ConnectionConfig, auto_connect: bool) -> Self {
        let (events, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                config: RwLock::new(config),
                auto_connect,
                mode: RwLock::new(Mode::Normal),
                db_number: Arc::new(DbNumberCell::new()),
                server_info: RwLock::new(ServerInfo::default()),
                link: Mutex::new(None),
                custom_transport: Mutex::new(None),
                events,
                stopping: AtomicBool::new(false),
            }),
        }
    }

    /// Install a custom transport (SSH tunnel, TLS, test double) to be used
    /// by the next [`connect`].
    ///
    /// [`connect`]: Connection::connect
    pub fn set_transport(&self, transport: Box<dyn Transport>) {
        *self.inner.custom_transport.lock().unwrap() = Some(transport);
    }

    /// Current connection configuration
    #[must_use]
    pub fn config(&self) -> ConnectionConfig {
        self.inner.config.read().unwrap().clone()
    }

    /// Replace the configuration; takes effect on the next connect
    pub fn set_connection_config(&self, config: ConnectionConfig) {
        *self.inner.config.write().unwrap() = config;
    }

    /// Detected deployment mode
    #[must_use]
    pub fn mode(&self) -> Mode {
        *self.inner.mode.read().unwrap()
    }

    /// Database index the connection currently has selected
    #[must_use]
    pub fn db_index(&self) -> i64 {
        self.inner.db_number.get()
    }

    /// Server version from the last `INFO` refresh, as major.minor
    #[must_use]
    pub fn server_version(&self) -> f64 {
        self.inner.server_info.read().unwrap().version
    }

    /// Keyspace statistics from the last `INFO` refresh
    #[must_use]
    pub fn keyspace_info(&self) -> DatabaseList {
        self.inner.server_info.read().unwrap().databases.clone()
    }

    /// A fresh detached connection with the same configuration
    #[must_use]
    pub fn duplicate(&self) -> Self {
        Self::build(self.config(), self.inner.auto_connect)
    }

    /// Subscribe to the connection's event bus
    #[must_use]
    pub fn subscribe_events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.inner.events.subscribe()
    }

    /// True while the transport worker is running and not being torn down
    #[must_use]
    pub fn is_connected(&self) -> bool {
        if self.inner.stopping.load(Ordering::SeqCst) {
            return false;
        }
        self.inner
            .link
            .lock()
            .unwrap()
            .as_ref()
            .is_some_and(|link| !link.worker.is_finished())
    }

    /// Bring the connection up.
    ///
    /// Spawns the transport worker and wires its events; the worker drives
    /// authentication and mode detection once the transport reports
    /// connected. With `wait` the call blocks until authentication resolves
    /// or the connection timeout elapses, returning whether auth succeeded.
    /// Without `wait` it returns `true` immediately; completion is
    /// observable through [`call_after_connect`] or the event bus.
    ///
    /// [`call_after_connect`]: Connection::call_after_connect
    pub async fn connect(&self, wait: bool) -> RedisResult<bool> {
        if self.is_connected() {
            return Ok(true);
        }

        let config = self.config();
        if !config.is_valid() {
            return Err(RedisError::Config(
                "Invalid connection configuration".to_string(),
            ));
        }

        let transport = self.take_or_create_transport(&config)?;

        // subscribe before the worker can emit anything
        let wait_rx = self.inner.events.subscribe();

        let (request_tx, request_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let worker = TransportWorker::new(
            transport,
            config.host.clone(),
            config.port,
            config.connection_timeout,
            config.execute_timeout,
            request_rx,
            event_tx,
            self.inner.db_number.clone(),
        );

        let spawned = {
            let mut link = self.inner.link.lock().unwrap();
            let alive = link.as_ref().is_some_and(|l| !l.worker.is_finished());
            if alive {
                false
            } else {
                let handle = tokio::spawn(worker.run());
                *link = Some(Link {
                    requests: request_tx,
                    worker: handle,
                });
                true
            }
        };

        if spawned {
            info!("Connecting to {}", config.address());
            tokio::spawn(pump_events(Arc::downgrade(&self.inner), event_rx));
        }

        if wait {
            Ok(self
                .wait_for_auth(wait_rx, config.connection_timeout)
                .await)
        } else {
            Ok(true)
        }
    }

    /// Tear the connection down: stops the worker (cancelling all pending
    /// command promises) and resets the current database index.
    pub async fn disconnect(&self) {
        self.emit(ConnectionEvent::ShutdownStart);

        let link = self.inner.link.lock().unwrap().take();
        if let Some(link) = link {
            self.inner.stopping.store(true, Ordering::SeqCst);
            let _ = link.requests.send(WorkerRequest::Shutdown);
            let _ = link.worker.await;
            self.inner.stopping.store(false, Ordering::SeqCst);
        }

        self.inner.db_number.reset();
    }

    /// Submit a command for execution, returning its reply future.
    ///
    /// On a disconnected auto-connect connection the returned future adopts
    /// the result of a re-issued command once the connection comes up, and
    /// resolves cancelled if connecting fails.
    pub fn command(&self, mut cmd: Command) -> RedisResult<ResponseFuture> {
        if !cmd.is_valid() {
            return Err(RedisError::InvalidCommand(
                "command has no name frame".to_string(),
            ));
        }

        if !self.is_connected() {
            if !self.inner.auto_connect {
                return Err(RedisError::NotConnected);
            }
            return Ok(self.deferred_command(cmd));
        }

        let future = cmd.arm();
        let link = self.inner.link.lock().unwrap();
        match link.as_ref() {
            Some(link) => {
                let _ = link.requests.send(WorkerRequest::Enqueue(cmd));
                Ok(future)
            }
            None => Err(RedisError::NotConnected),
        }
    }

    /// Re-enter [`command`] once the connection is up, linking the inner
    /// future into the one handed out now.
    ///
    /// [`command`]: Connection::command
    fn deferred_command(&self, cmd: Command) -> ResponseFuture {
        let (outer_tx, outer_rx) = oneshot::channel::<CommandOutcome>();

        let conn = self.clone();
        self.call_after_connect(move |err| {
            if err.is_some() {
                // dropping the sender cancels the outer future
                return;
            }
            if let Ok(inner) = conn.command(cmd) {
                tokio::spawn(async move {
                    if let Ok(outcome) = inner.rx.await {
                        let _ = outer_tx.send(outcome);
                    }
                });
            }
        });

        let conn = self.clone();
        tokio::spawn(async move {
            let _ = conn.connect(false).await;
        });

        ResponseFuture { rx: outer_rx }
    }

    /// Submit a command and block on its reply. A cancelled promise yields
    /// an empty response. Must not be called from within the worker task.
    pub async fn command_sync(&self, cmd: Command) -> RedisResult<Response> {
        match self.command(cmd)?.await {
            Err(RedisError::Cancelled) => Ok(Response::default()),
            other => other,
        }
    }

    /// Run a bootstrap/control command ahead of any queued user work
    pub async fn internal_command_sync<I, B>(&self, parts: I) -> RedisResult<Response>
    where
        I: IntoIterator<Item = B>,
        B: Into<Bytes>,
    {
        let mut cmd = Command::new(parts);
        cmd.mark_as_hi_priority();
        self.command_sync(cmd).await
    }

    /// Register a one-shot continuation invoked with `None` once
    /// authentication succeeds, or with the error message if the connection
    /// fails first.
    pub fn call_after_connect<F>(&self, callback: F)
    where
        F: FnOnce(Option<String>) + Send + 'static,
    {
        let mut events = self.inner.events.subscribe();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(ConnectionEvent::AuthOk) => {
                        callback(None);
                        return;
                    }
                    Ok(ConnectionEvent::Error(message)) => {
                        callback(Some(message));
                        return;
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => {
                        callback(Some("Connection dropped".to_string()));
                        return;
                    }
                }
            }
        });
    }

    /// Drop queued commands and pending replies belonging to `owner`
    pub fn cancel_commands(&self, owner: &CommandOwner) {
        if let Some(link) = self.inner.link.lock().unwrap().as_ref() {
            let _ = link.requests.send(WorkerRequest::CancelOwner(owner.id()));
        }
    }

    /// Block until the dispatch queue drains or `timeout` elapses
    pub async fn wait_for_idle(&self, timeout: Duration) -> bool {
        let mut events = self.inner.events.subscribe();
        tokio::time::timeout(timeout, async {
            loop {
                match events.recv().await {
                    Ok(ConnectionEvent::QueueIsEmpty) => return true,
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => return false,
                }
            }
        })
        .await
        .unwrap_or(false)
    }

    /// Probe whether the server accepts a command. Disabled and unknown
    /// commands resolve to `false`.
    pub async fn is_command_supported<I, B>(&self, parts: I) -> RedisResult<bool>
    where
        I: IntoIterator<Item = B>,
        B: Into<Bytes>,
    {
        match self.command(Command::new(parts))?.await {
            Ok(reply) => Ok(!reply.is_disabled_command_error_message()),
            Err(RedisError::Transport(message)) => Ok(!message.contains("unknown command")),
            Err(e) => Err(e),
        }
    }

    /// Re-read `INFO ALL` into the cached [`ServerInfo`]
    pub async fn refresh_server_info(&self) -> RedisResult<()> {
        let reply = self
            .internal_command_sync([Bytes::from_static(b"INFO"), Bytes::from_static(b"ALL")])
            .await?;
        let text = reply.value().as_string().unwrap_or_default();
        *self.inner.server_info.write().unwrap() = ServerInfo::from_info_text(&text);
        Ok(())
    }

    /// Update the tracked database index, bounded by the db-number lock
    pub async fn change_current_db_number(&self, db: i64) {
        self.inner.db_number.set(db).await;
    }

    /// Aggregate a whole SCAN-family chain into one list
    pub async fn retrieve_collection(&self, cmd: ScanCommand) -> RedisResult<Vec<Bytes>> {
        if !cmd.is_valid_scan_command() {
            return Err(RedisError::InvalidCommand(
                "not a SCAN-family command".to_string(),
            ));
        }

        let mut collected: Option<Vec<Bytes>> = None;
        let mut failure: Option<String> = None;

        self.process_scan_command(cmd, false, &mut |items, err| {
            if err.is_empty() {
                collected = items;
            } else {
                failure = Some(err.to_string());
            }
        })
        .await?;

        match failure {
            Some(err) => Err(RedisError::Server(err)),
            None => Ok(collected.unwrap_or_default()),
        }
    }

    /// Stream a SCAN-family chain batch by batch. The callback receives
    /// `(items, error, is_last)`: intermediate batches arrive with an empty
    /// error and `is_last == false`, and exactly one terminal call is
    /// delivered with `is_last == true` — with an empty error on normal
    /// completion, or the error text when the chain fails mid-way.
    pub async fn retrieve_collection_incrementally<F>(
        &self,
        cmd: ScanCommand,
        mut callback: F,
    ) -> RedisResult<()>
    where
        F: FnMut(Vec<Bytes>, &str, bool) + Send,
    {
        if !cmd.is_valid_scan_command() {
            return Err(RedisError::InvalidCommand(
                "not a SCAN-family command".to_string(),
            ));
        }

        self.process_scan_command(cmd, true, &mut |items, err| {
            if err == END_OF_COLLECTION {
                callback(items.unwrap_or_default(), "", true);
            } else if err.is_empty() {
                callback(items.unwrap_or_default(), "", false);
            } else {
                callback(items.unwrap_or_default(), err, true);
            }
        })
        .await
    }

    /// Drive one scan chain to termination, delivering batches to `deliver`.
    ///
    /// When the server rejects `SCAN` as disabled, the chain is replayed
    /// once with `ISCAN` for cloud deployments that expose cluster scans
    /// under that name.
    async fn process_scan_command(
        &self,
        mut cmd: ScanCommand,
        incremental: bool,
        deliver: &mut (dyn FnMut(Option<Vec<Bytes>>, &str) + Send),
    ) -> RedisResult<()> {
        let mut buffer: Vec<Bytes> = Vec::new();
        let mut tried_iscan = false;

        loop {
            let reply = match self.command_sync(cmd.to_command()).await {
                Ok(reply) => reply,
                Err(e) => {
                    deliver(None, &e.to_string());
                    return Ok(());
                }
            };

            if reply.is_error_message() {
                if !tried_iscan
                    && cmd.name_lowercase() == "scan"
                    && reply.is_disabled_command_error_message()
                {
                    tried_iscan = true;
                    cmd.replace_name("iscan");
                    continue;
                }

                deliver(None, &reply.error_text());
                return Ok(());
            }

            if incremental {
                buffer.clear();
            }

            if !reply.is_valid_scan_response() {
                if buffer.is_empty() {
                    deliver(None, if incremental { END_OF_COLLECTION } else { "" });
                } else {
                    deliver(Some(std::mem::take(&mut buffer)), "");
                }
                return Ok(());
            }

            buffer.extend(reply.collection());

            if reply.cursor() == 0 {
                deliver(
                    Some(std::mem::take(&mut buffer)),
                    if incremental { END_OF_COLLECTION } else { "" },
                );
                return Ok(());
            }

            if incremental && !buffer.is_empty() {
                deliver(Some(buffer.clone()), "");
            }

            cmd.set_cursor(reply.cursor());
        }
    }

    /// Keys of one database matching `pattern`, via a full SCAN chain
    pub async fn database_keys(&self, pattern: &str, db: i64) -> RedisResult<Vec<Bytes>> {
        let cmd = ScanCommand::new([
            Bytes::from_static(b"scan"),
            Bytes::from_static(b"0"),
            Bytes::from_static(b"MATCH"),
            Bytes::copy_from_slice(pattern.as_bytes()),
            Bytes::from_static(b"COUNT"),
            Bytes::from(DEFAULT_SCAN_LIMIT.to_string()),
        ])
        .with_db(db);

        self.retrieve_collection(cmd)
            .await
            .map_err(|e| RedisError::Server(format!("Cannot load keys: {e}")))
    }

    /// Masters of the cluster in slot-declaration order, from `CLUSTER SLOTS`
    pub async fn master_nodes(&self) -> RedisResult<Vec<(String, u16)>> {
        if self.mode() != Mode::Cluster {
            return Ok(Vec::new());
        }

        let reply = self
            .internal_command_sync([Bytes::from_static(b"CLUSTER"), Bytes::from_static(b"SLOTS")])
            .await
            .map_err(|e| RedisError::Cluster(format!("Cannot retrieve nodes list: {e}")))?;

        let mut masters = Vec::new();
        if let Some(slots) = reply.value().array() {
            for slot in slots {
                let Some(details) = slot.array() else { continue };
                if details.len() < 3 {
                    continue;
                }
                let Some(master) = details[2].array() else { continue };

                let host = master.first().and_then(|h| h.as_string().ok());
                let port = master.get(1).and_then(|p| p.as_int().ok());
                if let (Some(host), Some(port)) = (host, port) {
                    masters.push((host, port as u16));
                }
            }
        }

        Ok(masters)
    }

    /// Union of `SCAN MATCH pattern` over every cluster master, visiting
    /// each master exactly once. Requires cluster mode.
    pub async fn get_cluster_keys(&self, pattern: &str) -> RedisResult<Vec<Bytes>> {
        if self.mode() != Mode::Cluster {
            return Err(RedisError::NotCluster);
        }

        let mut remaining = VecDeque::from(self.master_nodes().await?);
        let mut keys = Vec::new();

        while let Some((host, port)) = remaining.pop_front() {
            self.connect_to_cluster_node(&host, port).await?;
            keys.extend(self.database_keys(pattern, -1).await?);
        }

        Ok(keys)
    }

    /// Flush one database; on a cluster, flushes every master and stops at
    /// the first failure.
    pub async fn flush_db_keys(&self, db_index: i64) -> RedisResult<()> {
        if self.mode() == Mode::Cluster {
            let mut remaining = VecDeque::from(self.master_nodes().await?);

            while let Some((host, port)) = remaining.pop_front() {
                self.connect_to_cluster_node(&host, port).await?;

                let reply = self
                    .command_sync(Command::new([Bytes::from_static(b"FLUSHDB")]))
                    .await
                    .map_err(|e| flush_error(db_index, &e.to_string()))?;
                if reply.is_error_message() {
                    return Err(flush_error(db_index, &reply.error_text()));
                }
            }

            Ok(())
        } else {
            let reply = self
                .command_sync(Command::new([Bytes::from_static(b"FLUSHDB")]).with_db(db_index))
                .await
                .map_err(|e| flush_error(db_index, &e.to_string()))?;
            if reply.is_error_message() {
                return Err(flush_error(db_index, &reply.error_text()));
            }
            Ok(())
        }
    }

    /// Aggregate the keyspace into namespaces with the embedded Lua script
    pub async fn get_namespace_items(
        &self,
        separator: &str,
        filter: &str,
        db_index: i64,
    ) -> RedisResult<NamespaceItems> {
        let script = script::namespace_scan_script();
        let args = [separator, filter];

        let mut reply = self
            .command_sync(Command::new(script.evalsha_frames(&args)).with_db(db_index))
            .await?;

        if reply.is_error_message() && reply.error_text().contains("NOSCRIPT") {
            reply = self
                .command_sync(Command::new(script.eval_frames(&args)).with_db(db_index))
                .await?;
        }

        if reply.is_error_message() {
            return Err(RedisError::Server(reply.error_text()));
        }

        parse_namespace_reply(&reply)
    }

    /// Authentication and mode detection, driven by the worker's
    /// `Connected` event (including after every reconnect).
    async fn auth(&self) {
        self.emit(ConnectionEvent::Log("AUTH".to_string()));

        if let Err(e) = self.try_auth().await {
            self.emit(ConnectionEvent::Error(format!(
                "Connection error on AUTH: {e}"
            )));
            self.emit(ConnectionEvent::AuthError(
                "Connection error on AUTH".to_string(),
            ));
            self.disconnect().await;
        }
    }

    async fn try_auth(&self) -> RedisResult<()> {
        let config = self.config();

        if config.use_auth() {
            let password = config.auth_password.clone().unwrap_or_default();
            self.internal_command_sync([
                Bytes::from_static(b"AUTH"),
                Bytes::from(password.into_bytes()),
            ])
            .await?;
        }

        const PONG: &[u8] = b"PONG";
        let pong = self
            .internal_command_sync([Bytes::from_static(b"PING")])
            .await?;
        let got_pong = pong
            .value()
            .as_bytes()
            .map(|b| b.as_ref() == PONG)
            .unwrap_or(false);

        if !got_pong {
            self.emit(ConnectionEvent::AuthError(
                "Redis server requires password or password is not valid".to_string(),
            ));
            self.emit(ConnectionEvent::Error("AUTH ERROR".to_string()));
            self.disconnect().await;
            return Ok(());
        }

        self.refresh_server_info().await?;
        let info = self.inner.server_info.read().unwrap().clone();

        if info.cluster_mode {
            self.set_mode(Mode::Cluster);
            self.emit(ConnectionEvent::Log("Cluster detected".to_string()));
        } else if info.sentinel_mode {
            self.set_mode(Mode::Sentinel);
            self.emit(ConnectionEvent::Log(
                "Sentinel detected. Requesting master node...".to_string(),
            ));
            return self.redirect_to_sentinel_master(&config).await;
        } else {
            self.set_mode(Mode::Normal);
        }

        self.emit(ConnectionEvent::Log("Connected".to_string()));
        self.emit(ConnectionEvent::AuthOk);
        self.emit(ConnectionEvent::Connected);
        Ok(())
    }

    /// Ask the sentinel for the current master and re-drive the connect
    /// sequence against it. `authOk` is deferred until the master link
    /// authenticates.
    async fn redirect_to_sentinel_master(&self, config: &ConnectionConfig) -> RedisResult<()> {
        let masters = self
            .internal_command_sync([
                Bytes::from_static(b"SENTINEL"),
                Bytes::from_static(b"masters"),
            ])
            .await?;

        if !masters.is_array() {
            self.emit(ConnectionEvent::Error(
                "Connection error: cannot retrieve master node from sentinel".to_string(),
            ));
            return Ok(());
        }

        let fields: Vec<String> = masters
            .value()
            .array()
            .and_then(|entries| entries.first())
            .and_then(|first| first.array())
            .map(|items| {
                items
                    .iter()
                    .filter_map(|item| item.as_string().ok())
                    .collect()
            })
            .unwrap_or_default();

        if fields.len() < 6 {
            self.emit(ConnectionEvent::Error(
                "Connection error: invalid response from sentinel".to_string(),
            ));
            return Ok(());
        }

        let mut host = fields[3].clone();
        let Ok(port) = fields[5].parse::<u16>() else {
            self.emit(ConnectionEvent::Error(
                "Connection error: invalid response from sentinel".to_string(),
            ));
            return Ok(());
        };

        // a loopback address from the sentinel is only meaningful through a
        // tunnel; otherwise the configured host is the reachable one
        if !config.use_ssh_tunnel && (host == "127.0.0.1" || host == "localhost") {
            host = config.host.clone();
        }

        self.reconnect_to(&host, port);
        Ok(())
    }

    /// Point the worker at another node; the connect sequence re-runs there
    fn reconnect_to(&self, host: &str, port: u16) {
        if let Some(link) = self.inner.link.lock().unwrap().as_ref() {
            let _ = link
                .requests
                .send(WorkerRequest::ReconnectTo(host.to_string(), port));
        }
    }

    /// Reconnect to one cluster master and wait for auth to complete there
    async fn connect_to_cluster_node(&self, host: &str, port: u16) -> RedisResult<()> {
        let config = self.config();

        let (done_tx, done_rx) = oneshot::channel();
        self.call_after_connect(move |err| {
            let _ = done_tx.send(err);
        });

        if config.override_cluster_host {
            self.reconnect_to(host, port);
        } else {
            self.reconnect_to(&config.host, port);
        }

        let cannot_connect = || {
            RedisError::Cluster(format!(
                "Cannot connect to cluster node {}:{}",
                config.host, config.port
            ))
        };

        match tokio::time::timeout(config.connection_timeout, done_rx).await {
            Ok(Ok(None)) => Ok(()),
            _ => Err(cannot_connect()),
        }
    }

    async fn wait_for_auth(
        &self,
        mut events: broadcast::Receiver<ConnectionEvent>,
        timeout: Duration,
    ) -> bool {
        tokio::time::timeout(timeout, async {
            loop {
                match events.recv().await {
                    Ok(ConnectionEvent::AuthOk) => return true,
                    Ok(ConnectionEvent::AuthError(_) | ConnectionEvent::Error(_))
                    | Ok(ConnectionEvent::ShutdownStart) => return false,
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => return false,
                }
            }
        })
        .await
        .unwrap_or(false)
    }

    fn take_or_create_transport(
        &self,
        config: &ConnectionConfig,
    ) -> RedisResult<Box<dyn Transport>> {
        if let Some(custom) = self.inner.custom_transport.lock().unwrap().take() {
            return Ok(custom);
        }

        if config.use_ssh_tunnel {
            return Err(RedisError::SshUnsupported);
        }

        Ok(Box::new(TcpTransport::new(config.tcp_keepalive)))
    }

    fn set_mode(&self, mode: Mode) {
        *self.inner.mode.write().unwrap() = mode;
    }

    fn emit(&self, event: ConnectionEvent) {
        let _ = self.inner.events.send(event);
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        // best effort: explicit disconnect() is the orderly path
        if let Some(link) = self.link.lock().unwrap().take() {
            let _ = link.requests.send(WorkerRequest::Shutdown);
        }
    }
}

fn flush_error(db_index: i64, message: &str) -> RedisError {
    RedisError::Server(format!("Cannot flush db ({db_index}): {message}"))
}

fn parse_namespace_reply(reply: &Response) -> RedisResult<NamespaceItems> {
    let invalid = || RedisError::Protocol("Invalid response from LUA script".to_string());

    let items = reply.value().array().ok_or_else(invalid)?;
    if items.len() != 2 {
        return Err(invalid());
    }

    let namespaces_raw = items[0].as_bytes().map_err(|_| invalid())?;
    let root_keys_raw = items[1].as_bytes().map_err(|_| invalid())?;

    let namespaces: serde_json::Map<String, serde_json::Value> =
        serde_json::from_slice(&namespaces_raw).map_err(|_| invalid())?;
    let root_keys: serde_json::Map<String, serde_json::Value> =
        serde_json::from_slice(&root_keys_raw).map_err(|_| invalid())?;

    Ok(NamespaceItems {
        namespaces: namespaces
            .iter()
            .map(|(name, count)| {
                let count = count
                    .as_u64()
                    .or_else(|| count.as_f64().map(|f| f as u64))
                    .unwrap_or(0);
                (Bytes::copy_from_slice(name.as_bytes()), count)
            })
            .collect(),
        root_keys: root_keys
            .keys()
            .map(|key| Bytes::copy_from_slice(key.as_bytes()))
            .collect(),
    })
}

/// Forwards worker events onto the connection's bus and drives
/// authentication. Holds only a weak reference so dropping every user
/// handle tears the whole stack down.
async fn pump_events(
    inner: Weak<Inner>,
    mut events: mpsc::UnboundedReceiver<TransporterEvent>,
) {
    while let Some(event) = events.recv().await {
        let Some(strong) = inner.upgrade() else { return };
        let conn = Connection { inner: strong };

        match event {
            TransporterEvent::Connected => conn.auth().await,
            TransporterEvent::ErrorOccurred(message) => {
                warn!("Transport error: {}", message);
                conn.disconnect().await;
                conn.emit(ConnectionEvent::Error(format!(
                    "Disconnect on error: {message}"
                )));
            }
            TransporterEvent::QueueIsEmpty => conn.emit(ConnectionEvent::QueueIsEmpty),
            TransporterEvent::Log(message) => {
                debug!("{}", message);
                conn.emit(ConnectionEvent::Log(message));
            }
        }
    }
}
