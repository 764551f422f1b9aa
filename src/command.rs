//! Request descriptors and their completion plumbing
//!
//! A [`Command`] is a list of argument frames plus routing metadata: target
//! database, priority class, an optional owner token and an optional
//! completion callback. Submitting a command arms a oneshot promise; the
//! promise is completed exactly once — with the reply, with a transport
//! error, or by cancellation when the sender is dropped.

use crate::core::error::{RedisError, RedisResult};
use crate::response::Response;
use bytes::Bytes;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use tokio::sync::oneshot;

/// Completion callback invoked with the reply and an error string
/// (empty on success)
pub type CommandCallback = Box<dyn FnOnce(&Response, &str) + Send>;

static NEXT_OWNER_ID: AtomicU64 = AtomicU64::new(1);

/// Opaque identity a command can be tied to. Dropping the last clone of an
/// owner cancels delivery of replies for its pending commands.
#[derive(Debug, Clone)]
pub struct CommandOwner {
    core: Arc<OwnerCore>,
}

#[derive(Debug)]
struct OwnerCore {
    id: u64,
}

impl CommandOwner {
    /// Create a fresh owner token
    #[must_use]
    pub fn new() -> Self {
        Self {
            core: Arc::new(OwnerCore {
                id: NEXT_OWNER_ID.fetch_add(1, Ordering::Relaxed),
            }),
        }
    }

    /// Stable identity of this owner
    #[must_use]
    pub fn id(&self) -> u64 {
        self.core.id
    }

    fn downgrade(&self) -> Weak<OwnerCore> {
        Arc::downgrade(&self.core)
    }
}

impl Default for CommandOwner {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) enum CommandOutcome {
    Reply(Response),
    Error(String),
}

/// Future resolving to the command's reply.
///
/// Dropping the submitted command's promise (disconnect, dead owner,
/// explicit cancellation) resolves this future with
/// [`RedisError::Cancelled`].
pub struct ResponseFuture {
    pub(crate) rx: oneshot::Receiver<CommandOutcome>,
}

impl Future for ResponseFuture {
    type Output = RedisResult<Response>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(CommandOutcome::Reply(response))) => Poll::Ready(Ok(response)),
            Poll::Ready(Ok(CommandOutcome::Error(msg))) => {
                Poll::Ready(Err(RedisError::Transport(msg)))
            }
            Poll::Ready(Err(_)) => Poll::Ready(Err(RedisError::Cancelled)),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// A request descriptor: argument frames plus dispatch metadata
pub struct Command {
    parts: Vec<Bytes>,
    db: i64,
    hi_priority: bool,
    owner: Option<Weak<OwnerCore>>,
    owner_id: Option<u64>,
    callback: Option<CommandCallback>,
    outcome_tx: Option<oneshot::Sender<CommandOutcome>>,
}

impl Command {
    /// Build a command from raw argument frames. The first frame is the
    /// command name.
    pub fn new<I, B>(parts: I) -> Self
    where
        I: IntoIterator<Item = B>,
        B: Into<Bytes>,
    {
        Self {
            parts: parts.into_iter().map(Into::into).collect(),
            db: -1,
            hi_priority: false,
            owner: None,
            owner_id: None,
            callback: None,
            outcome_tx: None,
        }
    }

    /// Target database index. −1 leaves the connection's current db alone.
    #[must_use]
    pub fn with_db(mut self, db: i64) -> Self {
        self.db = db;
        self
    }

    /// Tie this command to an owner token
    #[must_use]
    pub fn with_owner(mut self, owner: &CommandOwner) -> Self {
        self.owner = Some(owner.downgrade());
        self.owner_id = Some(owner.id());
        self
    }

    /// Attach a completion callback
    #[must_use]
    pub fn with_callback<F>(mut self, callback: F) -> Self
    where
        F: FnOnce(&Response, &str) + Send + 'static,
    {
        self.callback = Some(Box::new(callback));
        self
    }

    /// Control commands overtake queued user work
    pub fn mark_as_hi_priority(&mut self) {
        self.hi_priority = true;
    }

    /// True for commands in the hi-priority class
    #[must_use]
    pub const fn is_hi_priority(&self) -> bool {
        self.hi_priority
    }

    /// A command needs at least a name frame
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.parts.first().is_some_and(|name| !name.is_empty())
    }

    /// Argument frames
    #[must_use]
    pub fn parts(&self) -> &[Bytes] {
        &self.parts
    }

    /// Target database index
    #[must_use]
    pub const fn db(&self) -> i64 {
        self.db
    }

    /// Command name, lowercased, for dispatch decisions
    #[must_use]
    pub fn name_lowercase(&self) -> String {
        self.parts
            .first()
            .map(|name| String::from_utf8_lossy(name).to_ascii_lowercase())
            .unwrap_or_default()
    }

    /// Owner id, when an owner is attached
    #[must_use]
    pub const fn owner_id(&self) -> Option<u64> {
        self.owner_id
    }

    /// False once the owner token has been dropped
    #[must_use]
    pub fn owner_alive(&self) -> bool {
        self.owner
            .as_ref()
            .is_none_or(|weak| weak.strong_count() > 0)
    }

    /// Arm the completion promise; returns the future side.
    pub(crate) fn arm(&mut self) -> ResponseFuture {
        let (tx, rx) = oneshot::channel();
        self.outcome_tx = Some(tx);
        ResponseFuture { rx }
    }

    /// Deliver a reply: runs the callback and resolves the promise. A dead
    /// owner turns delivery into cancellation.
    pub(crate) fn complete_with_response(&mut self, response: Response) {
        if !self.owner_alive() {
            self.cancel();
            return;
        }
        if let Some(callback) = self.callback.take() {
            callback(&response, "");
        }
        if let Some(tx) = self.outcome_tx.take() {
            let _ = tx.send(CommandOutcome::Reply(response));
        }
    }

    /// Deliver a transport failure
    pub(crate) fn complete_with_error(&mut self, message: &str) {
        if !self.owner_alive() {
            self.cancel();
            return;
        }
        if let Some(callback) = self.callback.take() {
            callback(&Response::default(), message);
        }
        if let Some(tx) = self.outcome_tx.take() {
            let _ = tx.send(CommandOutcome::Error(message.to_string()));
        }
    }

    /// Drop the promise without completing it
    pub(crate) fn cancel(&mut self) {
        self.callback = None;
        self.outcome_tx = None;
    }
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Command")
            .field("name", &self.name_lowercase())
            .field("parts", &self.parts.len())
            .field("db", &self.db)
            .field("hi_priority", &self.hi_priority)
            .field("owner_id", &self.owner_id)
            .finish()
    }
}

const SCAN_COMMANDS: [&str; 5] = ["scan", "hscan", "sscan", "zscan", "iscan"];

/// A SCAN-family command carrying a mutable cursor.
///
/// One `ScanCommand` drives a whole iteration chain; each round trip rebuilds
/// a [`Command`] from the current frames.
#[derive(Debug, Clone)]
pub struct ScanCommand {
    parts: Vec<Bytes>,
    db: i64,
}

impl ScanCommand {
    /// Build a scan command from raw frames
    pub fn new<I, B>(parts: I) -> Self
    where
        I: IntoIterator<Item = B>,
        B: Into<Bytes>,
    {
        Self {
            parts: parts.into_iter().map(Into::into).collect(),
            db: -1,
        }
    }

    /// Target database index
    #[must_use]
    pub fn with_db(mut self, db: i64) -> Self {
        self.db = db;
        self
    }

    /// Command name, lowercased
    #[must_use]
    pub fn name_lowercase(&self) -> String {
        self.parts
            .first()
            .map(|name| String::from_utf8_lossy(name).to_ascii_lowercase())
            .unwrap_or_default()
    }

    /// SCAN and ISCAN carry the cursor as the first argument; the keyed
    /// variants put the key there and the cursor after it.
    fn cursor_position(&self) -> Option<usize> {
        match self.name_lowercase().as_str() {
            "scan" | "iscan" => Some(1),
            "hscan" | "sscan" | "zscan" => Some(2),
            _ => None,
        }
    }

    /// A scan command names a SCAN-family command and holds a numeric cursor
    /// at the position that command expects.
    #[must_use]
    pub fn is_valid_scan_command(&self) -> bool {
        if !SCAN_COMMANDS.contains(&self.name_lowercase().as_str()) {
            return false;
        }

        self.cursor_position()
            .and_then(|pos| self.parts.get(pos))
            .and_then(|frame| std::str::from_utf8(frame).ok())
            .is_some_and(|text| text.parse::<u64>().is_ok())
    }

    /// Current cursor value
    #[must_use]
    pub fn cursor(&self) -> u64 {
        self.cursor_position()
            .and_then(|pos| self.parts.get(pos))
            .and_then(|frame| std::str::from_utf8(frame).ok())
            .and_then(|text| text.parse::<u64>().ok())
            .unwrap_or(0)
    }

    /// Advance the cursor for the next iteration
    pub fn set_cursor(&mut self, cursor: u64) {
        if let Some(pos) = self.cursor_position() {
            if pos < self.parts.len() {
                self.parts[pos] = Bytes::from(cursor.to_string());
            }
        }
    }

    /// Swap the command name, keeping every other frame (ISCAN fallback)
    pub(crate) fn replace_name(&mut self, name: &str) {
        if !self.parts.is_empty() {
            self.parts[0] = Bytes::copy_from_slice(name.as_bytes());
        }
    }

    /// Materialize a dispatchable [`Command`] from the current frames
    #[must_use]
    pub fn to_command(&self) -> Command {
        Command::new(self.parts.iter().cloned()).with_db(self.db)
    }
}
