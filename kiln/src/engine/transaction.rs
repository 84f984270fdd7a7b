use super::oplog::Change;
use super::state::{DocKey, Record, Slot, Snapshot};
use super::EngineInner;
use crate::context::Context;
use crate::document::Document;
use crate::driver::{OperationType, Session, SessionOptions, UpdateDescription};
use crate::errors::{ErrorKind, KilnError, KilnResult};
use crate::model::ID_FIELD;
use indexmap::IndexSet;
use log::debug;
use parking_lot::Mutex;
use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use uuid::Uuid;

/// The view a collection operation reads from and writes to.
///
/// Operations outside a transaction write straight to the committed state;
/// operations inside a transaction write to the transaction's private
/// snapshot and reach the committed state on commit.
pub(crate) trait Scope {
    fn snapshot(&self) -> &Snapshot;

    fn apply(&mut self, ns: &str, key: DocKey, doc: Option<Arc<Document>>, change: Change) -> KilnResult<()>;
}

fn write_conflict(ns: &str, key: &str) -> KilnError {
    KilnError::new(
        &format!("write conflict on {} document {}", ns, key),
        ErrorKind::WriteConflict,
    )
}

/// Describes the top level fields that differ between two versions of a
/// document.
pub(crate) fn describe(previous: &Document, next: &Document) -> UpdateDescription {
    let mut description = UpdateDescription::default();
    for (field, value) in next {
        match previous.get(field) {
            Some(old) if old == value => {}
            _ => {
                description.updated_fields.insert(field.clone(), value.clone());
            }
        }
    }
    for field in previous.keys() {
        if !next.contains_key(field) {
            description.removed_fields.push(field.clone());
        }
    }
    description
}

/// Writes a document version through the scope and records the change.
///
/// `operation` is the kind of write the caller performs: `Insert` fails if
/// the key is taken, `Update` and `Replace` are no-ops when the document did
/// not change, and a `None` document deletes. Returns whether anything was
/// written.
pub(crate) fn put(
    scope: &mut dyn Scope,
    ns: &str,
    key: DocKey,
    doc: Option<Document>,
    operation: OperationType,
) -> KilnResult<bool> {
    let previous = scope.snapshot().record(ns, &key).map(|record| record.doc.clone());

    let (doc, change) = match (previous, doc) {
        (None, None) => return Ok(false),
        (Some(previous), None) => {
            let change = Change {
                ns: ns.to_string(),
                operation: OperationType::Delete,
                document_key: previous.get(ID_FIELD).cloned(),
                full_document: None,
                update_description: None,
            };
            (None, change)
        }
        (None, Some(doc)) => {
            let doc = Arc::new(doc);
            let change = Change {
                ns: ns.to_string(),
                operation: OperationType::Insert,
                document_key: doc.get(ID_FIELD).cloned(),
                full_document: Some(doc.clone()),
                update_description: None,
            };
            (Some(doc), change)
        }
        (Some(previous), Some(doc)) => {
            if operation == OperationType::Insert {
                return Err(KilnError::new(
                    &format!("duplicate key error on _id {}", key),
                    ErrorKind::DuplicateKey,
                ));
            }

            let description = describe(&previous, &doc);
            if description.updated_fields.is_empty() && description.removed_fields.is_empty() {
                return Ok(false);
            }

            let doc = Arc::new(doc);
            let change = if operation == OperationType::Replace {
                Change {
                    ns: ns.to_string(),
                    operation: OperationType::Replace,
                    document_key: doc.get(ID_FIELD).cloned(),
                    full_document: Some(doc.clone()),
                    update_description: None,
                }
            } else {
                Change {
                    ns: ns.to_string(),
                    operation: OperationType::Update,
                    document_key: doc.get(ID_FIELD).cloned(),
                    full_document: None,
                    update_description: Some(description),
                }
            };
            (Some(doc), change)
        }
    };

    if let (Some(doc), Some(namespace)) = (&doc, scope.snapshot().namespace(ns)) {
        namespace.check_unique(&key, doc)?;
    }

    scope.apply(ns, key, doc, change)?;
    Ok(true)
}

/// Writes directly to the committed state. Held for the duration of one
/// operation, which makes every non-transactional operation atomic.
pub(crate) struct Direct<'a> {
    pub snapshot: &'a mut Snapshot,
    pub version: &'a mut u64,
    pub changes: Vec<Change>,
}

impl Scope for Direct<'_> {
    fn snapshot(&self) -> &Snapshot {
        self.snapshot
    }

    fn apply(&mut self, ns: &str, key: DocKey, doc: Option<Arc<Document>>, change: Change) -> KilnResult<()> {
        *self.version += 1;
        let version = *self.version;
        self.snapshot.put(ns, key, doc.map(|doc| Record { doc, version }));
        self.changes.push(change);
        Ok(())
    }
}

/// The private state of a running transaction.
pub(crate) struct TxnState {
    id: u64,
    base: Snapshot,
    working: Snapshot,
    written: IndexSet<Slot>,
    changes: Vec<Change>,
    aborted: bool,
}

impl TxnState {
    fn new(id: u64, base: Snapshot) -> Self {
        TxnState {
            id,
            working: base.clone(),
            base,
            written: IndexSet::new(),
            changes: Vec::new(),
            aborted: false,
        }
    }

    /// Validates the writes against the committed state and applies them
    /// under a single new version.
    fn commit(self, engine: &EngineInner) -> KilnResult<()> {
        if self.aborted {
            return Err(aborted());
        }

        let mut state = engine.state.lock();
        state.claims.retain(|_, owner| *owner != self.id);

        for (ns, key) in &self.written {
            if state.snapshot.version(ns, key) != self.base.version(ns, key) {
                return Err(write_conflict(ns, key));
            }
        }

        if self.written.is_empty() {
            return Ok(());
        }

        let version = state.version + 1;
        let mut next = state.snapshot.clone();
        for (ns, key) in &self.written {
            let record = self.working.record(ns, key).map(|record| Record {
                doc: record.doc.clone(),
                version,
            });
            next.put(ns, key.clone(), record);
        }

        for (ns, key) in &self.written {
            if let (Some(record), Some(namespace)) = (next.record(ns, key), next.namespace(ns)) {
                namespace.check_unique(key, &record.doc)?;
            }
        }

        state.snapshot = next;
        state.version = version;
        engine.oplog.append(self.changes);
        Ok(())
    }
}

fn aborted() -> KilnError {
    KilnError::new(
        "transaction has been aborted",
        ErrorKind::TransactionAborted,
    )
}

/// Writes into a running transaction.
///
/// The first write to a document claims it. A write fails with a
/// `WriteConflict` if another transaction holds the claim or if the
/// document was committed after the transaction started.
struct Transactional<'a> {
    engine: &'a EngineInner,
    txn: &'a mut TxnState,
}

impl Scope for Transactional<'_> {
    fn snapshot(&self) -> &Snapshot {
        &self.txn.working
    }

    fn apply(&mut self, ns: &str, key: DocKey, doc: Option<Arc<Document>>, change: Change) -> KilnResult<()> {
        let slot = (ns.to_string(), key.clone());
        if !self.txn.written.contains(&slot) {
            let mut state = self.engine.state.lock();
            let committed = state.snapshot.version(ns, &key);
            let claimed = state
                .claims
                .get(&slot)
                .map(|owner| *owner != self.txn.id)
                .unwrap_or(false);

            if claimed || committed != self.txn.base.version(ns, &key) {
                let id = self.txn.id;
                state.claims.retain(|_, owner| *owner != id);
                self.txn.aborted = true;
                debug!("Transaction {} aborted on write conflict in {}", id, ns);
                return Err(write_conflict(ns, &key));
            }
            state.claims.insert(slot.clone(), self.txn.id);
        }

        self.txn
            .working
            .put(ns, key, doc.map(|doc| Record { doc, version: 0 }));
        self.txn.written.insert(slot);
        self.txn.changes.push(change);
        Ok(())
    }
}

/// A session of the in-memory engine.
///
/// Transactions read from the snapshot taken when they started, so every
/// read inside a transaction observes the same point in time.
pub(crate) struct MemorySession {
    id: String,
    engine: Arc<EngineInner>,
    options: SessionOptions,
    txn: Mutex<Option<TxnState>>,
    ended: AtomicBool,
}

impl MemorySession {
    pub fn new(engine: Arc<EngineInner>, options: SessionOptions) -> Self {
        MemorySession {
            id: Uuid::new_v4().to_string(),
            engine,
            options,
            txn: Mutex::new(None),
            ended: AtomicBool::new(false),
        }
    }

    /// Returns the session carried by the context, if any.
    pub fn from_context<'a>(ctx: &'a Context, engine: &Arc<EngineInner>) -> KilnResult<Option<&'a MemorySession>> {
        let session = match ctx.session() {
            Some(session) => session,
            None => return Ok(None),
        };

        match session.as_any().downcast_ref::<MemorySession>() {
            Some(session) if Arc::ptr_eq(&session.engine, engine) => Ok(Some(session)),
            Some(_) => Err(KilnError::new(
                "session belongs to a different engine",
                ErrorKind::InvalidOperation,
            )),
            None => Err(KilnError::new(
                "session does not belong to the in-memory engine",
                ErrorKind::InvalidOperation,
            )),
        }
    }

    /// Runs an operation inside the session's transaction, or directly when
    /// no transaction is running.
    pub fn run<T>(&self, op: impl FnOnce(&mut dyn Scope) -> KilnResult<T>) -> KilnResult<T> {
        let mut guard = self.txn.lock();
        match guard.as_mut() {
            Some(txn) if txn.aborted => Err(aborted()),
            Some(txn) => {
                let mut scope = Transactional {
                    engine: &self.engine,
                    txn,
                };
                op(&mut scope)
            }
            None => {
                drop(guard);
                self.engine.run_direct(op)
            }
        }
    }

    fn release(&self, txn: TxnState) {
        let mut state = self.engine.state.lock();
        state.claims.retain(|_, owner| *owner != txn.id);
    }
}

impl Session for MemorySession {
    fn id(&self) -> &str {
        &self.id
    }

    fn start_transaction(&self) -> KilnResult<()> {
        if self.ended.load(Ordering::SeqCst) {
            return Err(KilnError::new("session has ended", ErrorKind::InvalidOperation));
        }
        self.engine.ensure_open()?;

        let mut guard = self.txn.lock();
        if guard.is_some() {
            return Err(KilnError::new(
                "transaction already in progress",
                ErrorKind::InvalidOperation,
            ));
        }

        let id = self.engine.next_txn.fetch_add(1, Ordering::SeqCst);
        let base = self.engine.state.lock().snapshot.clone();
        debug!(
            "Starting transaction {} in session {} (causal consistency: {}, snapshot: {})",
            id, self.id, self.options.causal_consistency, self.options.snapshot
        );
        *guard = Some(TxnState::new(id, base));
        Ok(())
    }

    fn commit_transaction(&self, ctx: &Context) -> KilnResult<()> {
        ctx.check()?;
        self.engine.ensure_open()?;

        let txn = self.txn.lock().take().ok_or_else(|| {
            KilnError::new("no transaction in progress", ErrorKind::InvalidOperation)
        })?;
        let id = txn.id;
        txn.commit(&self.engine)?;
        debug!("Committed transaction {} in session {}", id, self.id);
        Ok(())
    }

    fn abort_transaction(&self, _ctx: &Context) -> KilnResult<()> {
        let txn = self.txn.lock().take().ok_or_else(|| {
            KilnError::new("no transaction in progress", ErrorKind::InvalidOperation)
        })?;
        debug!("Aborted transaction {} in session {}", txn.id, self.id);
        self.release(txn);
        Ok(())
    }

    fn in_transaction(&self) -> bool {
        self.txn.lock().is_some()
    }

    fn end(&self) {
        if self.ended.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(txn) = self.txn.lock().take() {
            self.release(txn);
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl Drop for MemorySession {
    fn drop(&mut self) {
        self.end();
    }
}
