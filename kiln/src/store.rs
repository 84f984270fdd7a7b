use crate::collection::Collection;
use crate::context::{Context, TransactionMarker};
use crate::driver::{Client, Database, Session, SessionOptions};
use crate::engine::{EngineConfig, MemoryEngine};
use crate::errors::{ErrorKind, KilnError, KilnResult};
use crate::manager::Manager;
use crate::model::Model;
use crate::translator::DefaultTranslator;
use dashmap::DashMap;
use log::{error, info, warn};
use std::any::TypeId;
use std::fmt::{Debug, Formatter};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

const MEMORY_SCHEME: &str = "memory";

fn connection_error(message: String) -> KilnError {
    KilnError::new(&message, ErrorKind::ConnectionError)
}

/// Parses the query parameters of a memory URI into an engine
/// configuration.
fn parse_config(query: &str) -> KilnResult<EngineConfig> {
    let mut config = EngineConfig::new();
    for pair in query.split('&').filter(|pair| !pair.is_empty()) {
        let (key, value) = pair
            .split_once('=')
            .ok_or_else(|| connection_error(format!("invalid uri parameter {}", pair)))?;
        match key {
            "oplog_capacity" => {
                let capacity = value
                    .parse::<usize>()
                    .map_err(|_| connection_error(format!("invalid oplog_capacity {}", value)))?;
                config = config.with_oplog_capacity(capacity);
            }
            "poll_interval" => {
                let millis = value
                    .parse::<u64>()
                    .map_err(|_| connection_error(format!("invalid poll_interval {}", value)))?;
                config = config.with_poll_interval(Duration::from_millis(millis));
            }
            other => return Err(connection_error(format!("unknown uri parameter {}", other))),
        }
    }
    Ok(config)
}

/// The entry point for working with a database.
///
/// # Purpose
/// A `Store` owns the database client, hands out the [`Collection`] and
/// [`Manager`] of every model type and defines transaction boundaries with
/// [`Store::with_transaction`].
///
/// # Characteristics
/// - **Isolated caches**: collections and managers are created lazily on
///   first use and cached per store, keyed by model type
/// - **Thread-safe**: clones share the same client and caches
/// - **Pluggable driver**: `connect` and `open` bind to the in-memory engine,
///   `new` accepts any [`Client`] implementation
///
/// # Examples
///
/// ```rust
/// use kiln::store::Store;
/// use kiln::context::Context;
///
/// let store = Store::connect("memory:///blog").unwrap();
/// assert_eq!(store.db_name(), "blog");
///
/// let result = store.with_transaction(&Context::background(), |ctx| {
///     assert!(ctx.has_transaction());
///     Ok(42)
/// });
/// assert_eq!(result.unwrap(), 42);
/// store.close().unwrap();
/// ```
#[derive(Clone)]
pub struct Store {
    inner: Arc<StoreInner>,
}

struct StoreInner {
    client: Arc<dyn Client>,
    db: String,
    engine: Option<MemoryEngine>,
    collections: DashMap<TypeId, Collection>,
    managers: DashMap<TypeId, Manager>,
    closed: Arc<AtomicBool>,
}

impl Store {
    /// Connects to the database identified by the URI.
    ///
    /// Only the `memory` scheme is built in: `memory:///db` binds to a fresh
    /// in-memory engine. The engine accepts the `oplog_capacity` and
    /// `poll_interval` (milliseconds) query parameters, e.g.
    /// `memory:///db?oplog_capacity=1024`.
    ///
    /// # Errors
    ///
    /// Returns a `ConnectionError` if the URI is malformed, names an
    /// unsupported scheme or lacks a database name.
    pub fn connect(uri: &str) -> KilnResult<Store> {
        let (scheme, rest) = uri
            .split_once("://")
            .ok_or_else(|| connection_error(format!("invalid store uri {}", uri)))?;
        if scheme != MEMORY_SCHEME {
            return Err(connection_error(format!("unsupported uri scheme {}", scheme)));
        }

        let (location, query) = rest.split_once('?').unwrap_or((rest, ""));
        let path = location.split_once('/').map(|(_, path)| path).unwrap_or("");
        let db = path.trim_matches('/');
        if db.is_empty() {
            return Err(connection_error(format!("missing database name in {}", uri)));
        }

        let engine = MemoryEngine::with_config(parse_config(query)?);
        let client = engine.client();
        client.ping(&Context::background())?;
        Ok(Store::create(client, db, Some(engine)))
    }

    /// Opens a store on an in-memory engine. Without an engine a new one is
    /// created, which is closed together with the store. A supplied engine
    /// stays open so that several stores can share it.
    pub fn open(engine: Option<MemoryEngine>, db: &str) -> KilnResult<Store> {
        let (engine, owned) = match engine {
            Some(engine) => (engine, false),
            None => (MemoryEngine::new(), true),
        };

        let client = engine.client();
        client.ping(&Context::background())?;
        Ok(Store::create(client, db, if owned { Some(engine) } else { None }))
    }

    /// Creates a store that uses the specified client and database.
    pub fn new(client: Arc<dyn Client>, db: &str) -> Store {
        Store::create(client, db, None)
    }

    fn create(client: Arc<dyn Client>, db: &str, engine: Option<MemoryEngine>) -> Store {
        info!("Opened store for database {}", db);
        Store {
            inner: Arc::new(StoreInner {
                client,
                db: db.to_string(),
                engine,
                collections: DashMap::new(),
                managers: DashMap::new(),
                closed: Arc::new(AtomicBool::new(false)),
            }),
        }
    }

    pub fn client(&self) -> &Arc<dyn Client> {
        &self.inner.client
    }

    /// Returns the database used by the store.
    pub fn db(&self) -> Arc<dyn Database> {
        self.inner.client.database(&self.inner.db)
    }

    pub fn db_name(&self) -> &str {
        &self.inner.db
    }

    /// Returns the collection of the model. The collection performs no
    /// checks; prefer the manager for regular operations.
    pub fn c<M: Model>(&self) -> Collection {
        let meta = M::meta();
        self.inner
            .collections
            .entry(meta.type_id())
            .or_insert_with(|| Collection::new(self.db().collection(meta.collection()), self.inner.closed.clone()))
            .value()
            .clone()
    }

    /// Returns the manager of the model.
    pub fn m<M: Model>(&self) -> Manager {
        let meta = M::meta();
        if let Some(manager) = self.inner.managers.get(&meta.type_id()) {
            return manager.value().clone();
        }

        let collection = self.c::<M>();
        self.inner
            .managers
            .entry(meta.type_id())
            .or_insert_with(|| Manager::new(meta, collection, Arc::new(DefaultTranslator::new(meta))))
            .value()
            .clone()
    }

    /// Runs the callback in a transaction.
    ///
    /// If the context already carries a transaction the callback joins it.
    /// Otherwise a causally consistent session with snapshot reads is
    /// started and the callback runs with a context marked as transactional;
    /// every operation that should be part of the transaction must use that
    /// context. The transaction commits if the callback succeeds and aborts
    /// if it fails, in which case the callback's error is returned.
    ///
    /// Reads inside the transaction observe a stable snapshot but are not
    /// protected against concurrent commits. A document the transaction
    /// depends on without modifying it must be locked, so that conflicting
    /// transactional writes abort.
    pub fn with_transaction<T, F>(&self, ctx: &Context, f: F) -> KilnResult<T>
    where
        F: FnOnce(&Context) -> KilnResult<T>,
    {
        if ctx.has_transaction() {
            return f(ctx);
        }

        self.ensure_open()?;
        log::debug!("Store.with_transaction on {}", self.inner.db);

        let options = SessionOptions {
            causal_consistency: true,
            snapshot: true,
        };
        let session = self.inner.client.start_session(ctx, options)?;
        let result = self.run_transaction(ctx, &session, f);
        session.end();
        result
    }

    fn run_transaction<T, F>(&self, ctx: &Context, session: &Arc<dyn Session>, f: F) -> KilnResult<T>
    where
        F: FnOnce(&Context) -> KilnResult<T>,
    {
        session.start_transaction()?;
        let txn_ctx = ctx.with_transaction(TransactionMarker::new(session.clone()));

        match f(&txn_ctx) {
            Ok(value) => match session.commit_transaction(ctx) {
                Ok(()) => Ok(value),
                Err(err) => {
                    error!("Failed to commit transaction {}: {}", session.id(), err);
                    Err(err)
                }
            },
            Err(err) => {
                warn!("Aborting transaction {}: {}", session.id(), err);
                if let Err(abort_err) = session.abort_transaction(ctx) {
                    warn!("Failed to abort transaction {}: {}", session.id(), abort_err);
                }
                Err(err)
            }
        }
    }

    fn ensure_open(&self) -> KilnResult<()> {
        if self.is_closed() {
            return Err(KilnError::new("store has been closed", ErrorKind::StoreAlreadyClosed));
        }
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Closes the store. Disconnects the client and closes the in-memory
    /// engine if the store created it. Later calls are no-ops.
    pub fn close(&self) -> KilnResult<()> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        self.inner.client.disconnect(&Context::background())?;
        if let Some(engine) = &self.inner.engine {
            engine.close();
        }

        info!("Closed store for database {}", self.inner.db);
        Ok(())
    }
}

impl Debug for Store {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("db", &self.inner.db)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::doc;
    use crate::driver::FindOptions;
    use crate::errors::is_conflict;
    use crate::model::{Base, Validate};
    use crate::Model;
    use serde::{Deserialize, Serialize};

    #[derive(Model, Serialize, Deserialize, Default, Debug)]
    #[model(collection = "posts")]
    struct Post {
        #[serde(flatten)]
        base: Base,
        title: String,
    }

    impl Validate for Post {}

    #[derive(Model, Serialize, Deserialize, Default, Debug)]
    #[model(collection = "comments")]
    struct Comment {
        #[serde(flatten)]
        base: Base,
    }

    impl Validate for Comment {}

    fn count(store: &Store) -> u64 {
        store
            .c::<Post>()
            .count_documents(&Context::background(), &doc! {}, FindOptions::new())
            .unwrap()
    }

    #[test]
    fn test_connect_parses_uri() {
        let store = Store::connect("memory:///blog?oplog_capacity=16&poll_interval=5").unwrap();
        assert_eq!(store.db_name(), "blog");
        assert_eq!(store.db().name(), "blog");

        let store = Store::connect("memory://localhost/blog").unwrap();
        assert_eq!(store.db_name(), "blog");
    }

    #[test]
    fn test_connect_rejects_invalid_uris() {
        for uri in ["mongodb://localhost/blog", "memory:///", "blog", "memory:///blog?foo=1", "memory:///blog?oplog_capacity=x"] {
            let err = Store::connect(uri).unwrap_err();
            assert_eq!(err.kind(), &ErrorKind::ConnectionError, "{}", uri);
        }
    }

    #[test]
    fn test_caches_are_per_type_and_store() {
        let store = Store::open(None, "test").unwrap();
        let first = store.m::<Post>();
        let second = store.m::<Post>();
        store.m::<Comment>();
        assert_eq!(store.inner.managers.len(), 2);
        assert_eq!(store.inner.collections.len(), 2);
        assert_eq!(first.meta(), second.meta());

        let other = Store::open(None, "test").unwrap();
        assert_eq!(other.inner.managers.len(), 0);
    }

    #[test]
    fn test_with_transaction_commits() {
        let store = Store::open(None, "test").unwrap();
        store
            .with_transaction(&Context::background(), |ctx| {
                store.c::<Post>().insert_one(ctx, doc! { "title": "A" })?;
                assert_eq!(count(&store), 0);
                Ok(())
            })
            .unwrap();
        assert_eq!(count(&store), 1);
    }

    #[test]
    fn test_with_transaction_aborts_with_original_error() {
        let store = Store::open(None, "test").unwrap();
        let err = store
            .with_transaction(&Context::background(), |ctx| {
                store.c::<Post>().insert_one(ctx, doc! { "title": "A" })?;
                Err::<(), _>(KilnError::new("boom", ErrorKind::InvalidOperation))
            })
            .unwrap_err();
        assert_eq!(err.message(), "boom");
        assert_eq!(count(&store), 0);
    }

    #[test]
    fn test_with_transaction_is_reentrant() {
        let store = Store::open(None, "test").unwrap();
        store
            .with_transaction(&Context::background(), |outer| {
                let outer_session = outer.session().map(|session| session.id().to_string());
                store.with_transaction(outer, |inner| {
                    let inner_session = inner.session().map(|session| session.id().to_string());
                    assert_eq!(outer_session, inner_session);
                    store.c::<Post>().insert_one(inner, doc! { "title": "A" })?;
                    Ok(())
                })
            })
            .unwrap();
        assert_eq!(count(&store), 1);
    }

    #[test]
    fn test_with_transaction_returns_commit_conflicts() {
        let store = Store::open(None, "test").unwrap();
        let posts = store.c::<Post>();
        let background = Context::background();
        posts.insert_one(&background, doc! { "_id": "a", "title": "A" }).unwrap();

        let err = store
            .with_transaction(&background, |ctx| {
                posts.update_one(ctx, &doc! { "_id": "a" }, &doc! { "$set": { "title": "B" } }, Default::default())?;
                posts.update_one(&background, &doc! { "_id": "a" }, &doc! { "$set": { "title": "C" } }, Default::default())?;
                Ok(())
            })
            .unwrap_err();
        assert!(is_conflict(&err));
    }

    #[test]
    fn test_close_is_idempotent() {
        let store = Store::open(None, "test").unwrap();
        let posts = store.c::<Post>();
        store.close().unwrap();
        store.close().unwrap();
        assert!(store.is_closed());

        let err = posts.insert_one(&Context::background(), doc! { "title": "A" }).unwrap_err();
        assert_eq!(err.kind(), &ErrorKind::StoreAlreadyClosed);

        let err = store.with_transaction(&Context::background(), |_| Ok(())).unwrap_err();
        assert_eq!(err.kind(), &ErrorKind::StoreAlreadyClosed);
    }

    #[test]
    fn test_shared_engine_outlives_store() {
        let engine = MemoryEngine::new();
        let first = Store::open(Some(engine.clone()), "test").unwrap();
        let second = Store::open(Some(engine.clone()), "test").unwrap();
        first.c::<Post>().insert_one(&Context::background(), doc! { "title": "A" }).unwrap();
        first.close().unwrap();

        assert!(!engine.is_closed());
        assert_eq!(count(&second), 1);
    }

    #[test]
    fn test_owned_engine_is_closed() {
        let store = Store::connect("memory:///test").unwrap();
        store.close().unwrap();
        assert!(store.inner.engine.as_ref().unwrap().is_closed());
    }
}
