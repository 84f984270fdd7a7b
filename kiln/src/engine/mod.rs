//! An in-memory document engine.
//!
//! The engine implements the [`driver`](crate::driver) traits on top of
//! persistent maps. Every committed state is an immutable [`Snapshot`];
//! transactions read from the snapshot taken when they started and publish
//! their writes atomically on commit. Committed changes are appended to a
//! bounded operation log that backs change streams.
//!
//! The engine is what [`Store::open`](crate::store::Store::open) binds to,
//! so tests exercise the same manager code paths a networked driver would.

mod collection;
mod cursor;
mod oplog;
mod order;
mod query;
mod state;
mod transaction;
mod update;

use crate::context::Context;
use crate::document::{Document, Value};
use crate::driver::{Client, Database, Session, SessionOptions};
use crate::errors::{ErrorKind, KilnError, KilnResult};
use collection::MemoryDatabase;
use log::info;
use oplog::Oplog;
use parking_lot::Mutex;
use state::{doc_key, Slot, Snapshot};
use std::collections::HashMap;
use std::fmt::{Debug, Formatter};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use transaction::{Direct, MemorySession, Scope};

/// Default number of change events the operation log retains.
pub const DEFAULT_OPLOG_CAPACITY: usize = 65_536;

/// Default interval at which waiting change streams observe cancellation.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Configuration of a [`MemoryEngine`].
///
/// # Examples
///
/// ```rust
/// use kiln::engine::{EngineConfig, MemoryEngine};
/// use std::time::Duration;
///
/// let config = EngineConfig::new()
///     .with_oplog_capacity(1024)
///     .with_poll_interval(Duration::from_millis(10));
/// let engine = MemoryEngine::with_config(config);
/// assert_eq!(engine.config().oplog_capacity(), 1024);
/// ```
#[derive(Debug, Clone)]
pub struct EngineConfig {
    oplog_capacity: usize,
    poll_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig::new()
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        EngineConfig {
            oplog_capacity: DEFAULT_OPLOG_CAPACITY,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// Sets the maximum number of change events retained for change
    /// streams. Streams resuming behind the retained window fail with
    /// `HistoryLost`.
    pub fn with_oplog_capacity(mut self, capacity: usize) -> Self {
        self.oplog_capacity = capacity.max(1);
        self
    }

    /// Sets how often waiting change streams wake up to check their context.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn oplog_capacity(&self) -> usize {
        self.oplog_capacity
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }
}

/// An in-memory document database.
///
/// # Purpose
/// Provides a complete, process local implementation of the driver traits
/// so that stores can run without a database server.
///
/// # Characteristics
/// - **Snapshot isolation**: transactions read a stable point in time view
/// - **First writer wins**: the first transaction to write a document claims
///   it; other writers fail with `WriteConflict`
/// - **Change feed**: committed changes are retained in a bounded log and can
///   be tailed and resumed by token
/// - **Cheap handles**: clones share the same engine
#[derive(Clone)]
pub struct MemoryEngine {
    inner: Arc<EngineInner>,
}

impl MemoryEngine {
    pub fn new() -> Self {
        MemoryEngine::with_config(EngineConfig::new())
    }

    pub fn with_config(config: EngineConfig) -> Self {
        info!(
            "Creating in-memory engine with oplog capacity {}",
            config.oplog_capacity
        );
        MemoryEngine {
            inner: Arc::new(EngineInner {
                oplog: Oplog::new(config.oplog_capacity),
                config,
                state: Mutex::new(EngineState {
                    snapshot: Snapshot::default(),
                    version: 0,
                    claims: HashMap::new(),
                }),
                closed: AtomicBool::new(false),
                next_txn: AtomicU64::new(1),
            }),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Returns a new client connected to the engine.
    pub fn client(&self) -> Arc<dyn Client> {
        Arc::new(MemoryClient {
            engine: self.inner.clone(),
            disconnected: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Closes the engine. Running change streams end with a connection
    /// error and every later call fails.
    pub fn close(&self) {
        if !self.inner.closed.swap(true, Ordering::SeqCst) {
            self.inner.oplog.close();
            info!("Closed in-memory engine");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }
}

impl Default for MemoryEngine {
    fn default() -> Self {
        MemoryEngine::new()
    }
}

impl Debug for MemoryEngine {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryEngine")
            .field("config", &self.inner.config)
            .field("closed", &self.is_closed())
            .finish()
    }
}

pub(crate) struct EngineState {
    snapshot: Snapshot,
    /// The version of the last committed write.
    version: u64,
    /// Documents written by running transactions, with the owning
    /// transaction.
    claims: HashMap<Slot, u64>,
}

pub(crate) struct EngineInner {
    config: EngineConfig,
    state: Mutex<EngineState>,
    oplog: Oplog,
    closed: AtomicBool,
    next_txn: AtomicU64,
}

impl EngineInner {
    fn ensure_open(&self) -> KilnResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(KilnError::new("engine has been closed", ErrorKind::ConnectionError));
        }
        Ok(())
    }

    /// Runs an operation against the committed state while holding the state
    /// lock, then publishes its changes.
    fn run_direct<T>(&self, op: impl FnOnce(&mut dyn Scope) -> KilnResult<T>) -> KilnResult<T> {
        self.ensure_open()?;
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let mut scope = Direct {
            snapshot: &mut state.snapshot,
            version: &mut state.version,
            changes: Vec::new(),
        };

        let result = op(&mut scope);
        self.oplog.append(scope.changes);
        result
    }

    /// Runs an operation in the transaction carried by the context, or
    /// directly against the committed state.
    fn run<T>(self: &Arc<Self>, ctx: &Context, op: impl FnOnce(&mut dyn Scope) -> KilnResult<T>) -> KilnResult<T> {
        ctx.check()?;
        self.ensure_open()?;
        match MemorySession::from_context(ctx, self)? {
            Some(session) => session.run(op),
            None => self.run_direct(op),
        }
    }

    /// Returns the committed version of a document.
    fn lookup(&self, ns: &str, id: &Value) -> Option<Document> {
        let state = self.state.lock();
        state
            .snapshot
            .record(ns, &doc_key(id))
            .map(|record| record.doc.as_ref().clone())
    }
}

struct MemoryClient {
    engine: Arc<EngineInner>,
    disconnected: Arc<AtomicBool>,
}

impl MemoryClient {
    fn ensure_connected(&self) -> KilnResult<()> {
        if self.disconnected.load(Ordering::SeqCst) {
            return Err(KilnError::new("client has been disconnected", ErrorKind::ConnectionError));
        }
        self.engine.ensure_open()
    }
}

impl Client for MemoryClient {
    fn database(&self, name: &str) -> Arc<dyn Database> {
        Arc::new(MemoryDatabase::new(
            self.engine.clone(),
            name,
            self.disconnected.clone(),
        ))
    }

    fn start_session(&self, ctx: &Context, options: SessionOptions) -> KilnResult<Arc<dyn Session>> {
        ctx.check()?;
        self.ensure_connected()?;
        Ok(Arc::new(MemorySession::new(self.engine.clone(), options)))
    }

    fn ping(&self, ctx: &Context) -> KilnResult<()> {
        ctx.check()?;
        self.ensure_connected()
    }

    fn disconnect(&self, _ctx: &Context) -> KilnResult<()> {
        self.disconnected.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Returns a cursor over the given documents.
#[cfg(test)]
pub(crate) fn cursor_of(docs: Vec<Document>) -> Box<dyn crate::driver::RawCursor> {
    Box::new(cursor::MemoryCursor::new(docs))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::doc;
    use crate::driver::{FindOptions, UpdateOptions};
    use crate::context::TransactionMarker;

    fn transaction(client: &Arc<dyn Client>) -> (Context, Arc<dyn Session>) {
        let session = client
            .start_session(&Context::background(), SessionOptions::default())
            .unwrap();
        session.start_transaction().unwrap();
        let ctx = Context::background().with_transaction(TransactionMarker::new(session.clone()));
        (ctx, session)
    }

    #[test]
    fn test_engine_config_defaults() {
        let config = EngineConfig::new();
        assert_eq!(config.oplog_capacity(), DEFAULT_OPLOG_CAPACITY);
        assert_eq!(config.poll_interval(), DEFAULT_POLL_INTERVAL);
        assert_eq!(EngineConfig::new().with_oplog_capacity(0).oplog_capacity(), 1);
    }

    #[test]
    fn test_transaction_reads_stable_snapshot() {
        let engine = MemoryEngine::new();
        let client = engine.client();
        let posts = client.database("db").collection("posts");
        let ctx = Context::background();
        posts.insert_one(&ctx, doc! { "_id": "a", "n": 1 }).unwrap();

        let (txn_ctx, session) = transaction(&client);
        posts
            .update_one(&ctx, &doc! { "_id": "a" }, &doc! { "$set": { "n": 2 } }, UpdateOptions::default())
            .unwrap();

        let seen = posts.find_one(&txn_ctx, &doc! { "_id": "a" }, FindOptions::new()).unwrap().unwrap();
        assert_eq!(seen["n"], 1);
        session.commit_transaction(&Context::background()).unwrap();

        let seen = posts.find_one(&ctx, &doc! { "_id": "a" }, FindOptions::new()).unwrap().unwrap();
        assert_eq!(seen["n"], 2);
    }

    #[test]
    fn test_first_writer_wins() {
        let engine = MemoryEngine::new();
        let client = engine.client();
        let posts = client.database("db").collection("posts");
        posts.insert_one(&Context::background(), doc! { "_id": "a", "n": 1 }).unwrap();

        let (first, first_session) = transaction(&client);
        let (second, second_session) = transaction(&client);
        let update = doc! { "$inc": { "n": 1 } };

        posts.update_one(&first, &doc! { "_id": "a" }, &update, UpdateOptions::default()).unwrap();
        let err = posts
            .update_one(&second, &doc! { "_id": "a" }, &update, UpdateOptions::default())
            .unwrap_err();
        assert_eq!(err.kind(), &ErrorKind::WriteConflict);

        first_session.commit_transaction(&Context::background()).unwrap();
        let err = second_session.commit_transaction(&Context::background()).unwrap_err();
        assert_eq!(err.kind(), &ErrorKind::TransactionAborted);
    }

    #[test]
    fn test_commit_detects_concurrent_commit() {
        let engine = MemoryEngine::new();
        let client = engine.client();
        let posts = client.database("db").collection("posts");
        posts.insert_one(&Context::background(), doc! { "_id": "a", "n": 1 }).unwrap();

        let (txn_ctx, session) = transaction(&client);
        posts
            .update_one(&txn_ctx, &doc! { "_id": "a" }, &doc! { "$set": { "n": 5 } }, UpdateOptions::default())
            .unwrap();
        posts
            .update_one(
                &Context::background(),
                &doc! { "_id": "a" },
                &doc! { "$set": { "n": 9 } },
                UpdateOptions::default(),
            )
            .unwrap();

        let err = session.commit_transaction(&Context::background()).unwrap_err();
        assert_eq!(err.kind(), &ErrorKind::WriteConflict);
        let doc = posts
            .find_one(&Context::background(), &doc! { "_id": "a" }, FindOptions::new())
            .unwrap()
            .unwrap();
        assert_eq!(doc["n"], 9);
    }

    #[test]
    fn test_aborted_transaction_discards_writes() {
        let engine = MemoryEngine::new();
        let client = engine.client();
        let posts = client.database("db").collection("posts");

        let (txn_ctx, session) = transaction(&client);
        posts.insert_one(&txn_ctx, doc! { "_id": "a" }).unwrap();
        assert_eq!(posts.count_documents(&txn_ctx, &doc! {}, FindOptions::new()).unwrap(), 1);
        session.abort_transaction(&Context::background()).unwrap();
        session.end();

        let count = posts
            .count_documents(&Context::background(), &doc! {}, FindOptions::new())
            .unwrap();
        assert_eq!(count, 0);
        assert!(!session.in_transaction());
    }

    #[test]
    fn test_closed_engine_rejects_calls() {
        let engine = MemoryEngine::new();
        let client = engine.client();
        engine.close();
        assert!(engine.is_closed());
        let err = client.ping(&Context::background()).unwrap_err();
        assert_eq!(err.kind(), &ErrorKind::ConnectionError);
        let err = client
            .database("db")
            .collection("posts")
            .insert_one(&Context::background(), doc! {})
            .unwrap_err();
        assert_eq!(err.kind(), &ErrorKind::ConnectionError);
    }

    #[test]
    fn test_disconnected_client_rejects_sessions() {
        let engine = MemoryEngine::new();
        let client = engine.client();
        client.disconnect(&Context::background()).unwrap();
        assert!(client
            .start_session(&Context::background(), SessionOptions::default())
            .is_err());
        assert!(engine.client().ping(&Context::background()).is_ok());
    }
}
