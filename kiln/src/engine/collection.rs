use super::cursor::{MemoryChangeStream, MemoryCursor};
use super::oplog::{decode_token, Change};
use super::order::{needs_score, project, sort_hits, validate_projection, Hit};
use super::query::{values_at, Query};
use super::state::{key_of, Snapshot, UniqueIndex};
use super::transaction::{put, Scope};
use super::update::{apply as apply_update, is_replacement, validate as validate_update};
use super::EngineInner;
use crate::context::Context;
use crate::document::{compare_values, set_path, values_equal, Document, Value};
use crate::driver::{
    ChangeStreamOptions, Database, DeleteResult, FindOneAndUpdateOptions, FindOptions, InsertManyOptions,
    InsertManyResult, InsertOneResult, NativeCollection, OperationType, RawChangeStream, RawCursor, ReturnDocument,
    UpdateOptions, UpdateResult,
};
use crate::errors::{ErrorKind, KilnError, KilnResult};
use crate::id::ID;
use crate::model::ID_FIELD;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

fn invalid(message: &str) -> KilnError {
    KilnError::new(message, ErrorKind::InvalidOperation)
}

/// Checks that the options only ask for text scores when the query can
/// produce them.
fn check_options(query: &Query, options: &FindOptions) -> KilnResult<()> {
    if let Some(projection) = &options.projection {
        validate_projection(projection)?;
    }
    if needs_score(&options.sort, options.projection.as_ref()) && !query.has_text() {
        return Err(invalid("text score metadata requires a $text query"));
    }
    Ok(())
}

/// Returns the matching documents of a namespace, sorted and windowed.
fn select(snapshot: &Snapshot, ns: &str, query: &Query, options: &FindOptions) -> Vec<Hit> {
    let namespace = match snapshot.namespace(ns) {
        Some(namespace) => namespace,
        None => return Vec::new(),
    };

    let mut hits: Vec<Hit> = namespace
        .iter()
        .filter(|(_, record)| query.matches(&record.doc))
        .map(|(_, record)| Hit {
            doc: record.doc.clone(),
            score: query.score(&record.doc),
        })
        .collect();
    sort_hits(&mut hits, &options.sort);

    let skip = usize::try_from(options.skip).unwrap_or(usize::MAX);
    let limit = match options.limit {
        0 => usize::MAX,
        limit => usize::try_from(limit).unwrap_or(usize::MAX),
    };
    hits.into_iter().skip(skip).take(limit).collect()
}

fn ensure_id(doc: &mut Document) {
    if !doc.contains_key(ID_FIELD) {
        doc.insert(ID_FIELD.to_string(), Value::String(ID::new().to_hex()));
    }
}

/// Builds the document an upsert inserts: the equality fields of the
/// filter, then the update applied in insert mode.
fn seed(query: &Query) -> KilnResult<Document> {
    let mut equalities = Vec::new();
    query.equalities(&mut equalities);

    let mut doc = Document::new();
    for (path, value) in equalities {
        set_path(&mut doc, &path, value)?;
    }
    Ok(doc)
}

fn check_id_unchanged(before: &Document, after: &Document) -> KilnResult<()> {
    if before.get(ID_FIELD) != after.get(ID_FIELD) {
        return Err(invalid("the _id field cannot be modified"));
    }
    Ok(())
}

/// A collection of the in-memory engine.
pub(crate) struct MemoryCollection {
    engine: Arc<EngineInner>,
    db: String,
    name: String,
    ns: String,
    disconnected: Arc<AtomicBool>,
}

impl MemoryCollection {
    fn run<T>(&self, ctx: &Context, op: impl FnOnce(&mut dyn Scope) -> KilnResult<T>) -> KilnResult<T> {
        if self.disconnected.load(Ordering::SeqCst) {
            return Err(KilnError::new("client has been disconnected", ErrorKind::ConnectionError));
        }
        self.engine.run(ctx, op)
    }

    fn insert(&self, scope: &mut dyn Scope, mut doc: Document) -> KilnResult<Value> {
        ensure_id(&mut doc);
        let id = doc.get(ID_FIELD).cloned().unwrap_or(Value::Null);
        let key = key_of(&doc)?;
        put(scope, &self.ns, key, Some(doc), OperationType::Insert)?;
        Ok(id)
    }

    /// Applies an update to the first match, or inserts when nothing matched
    /// and `upsert` is set. Returns the document before and after the write.
    fn update_first(
        &self,
        scope: &mut dyn Scope,
        query: &Query,
        update: &Document,
        options: &FindOptions,
        upsert: bool,
    ) -> KilnResult<UpdateOutcome> {
        let found = select(scope.snapshot(), &self.ns, query, options).into_iter().next();
        match found {
            Some(hit) => {
                let before = hit.doc.as_ref().clone();
                let mut after = before.clone();
                apply_update(&mut after, update, false)?;
                check_id_unchanged(&before, &after)?;
                let modified = put(scope, &self.ns, key_of(&before)?, Some(after.clone()), OperationType::Update)?;
                Ok(UpdateOutcome {
                    before: Some(before),
                    after: Some(after),
                    modified,
                    upserted: None,
                })
            }
            None if upsert => {
                let mut doc = seed(query)?;
                apply_update(&mut doc, update, true)?;
                let id = self.insert(scope, doc.clone())?;
                doc.entry(ID_FIELD.to_string()).or_insert(id.clone());
                Ok(UpdateOutcome {
                    before: None,
                    after: Some(doc),
                    modified: false,
                    upserted: Some(id),
                })
            }
            None => Ok(UpdateOutcome::default()),
        }
    }
}

#[derive(Default)]
struct UpdateOutcome {
    before: Option<Document>,
    after: Option<Document>,
    modified: bool,
    upserted: Option<Value>,
}

impl UpdateOutcome {
    fn into_result(self) -> UpdateResult {
        UpdateResult {
            matched_count: if self.before.is_some() { 1 } else { 0 },
            modified_count: if self.modified { 1 } else { 0 },
            upserted_id: self.upserted,
        }
    }
}

impl NativeCollection for MemoryCollection {
    fn name(&self) -> &str {
        &self.name
    }

    fn find(&self, ctx: &Context, filter: &Document, options: FindOptions) -> KilnResult<Box<dyn RawCursor>> {
        let query = Query::parse(filter)?;
        check_options(&query, &options)?;

        let docs = self.run(ctx, |scope| {
            select(scope.snapshot(), &self.ns, &query, &options)
                .iter()
                .map(|hit| project(hit, options.projection.as_ref()))
                .collect::<KilnResult<Vec<Document>>>()
        })?;
        Ok(Box::new(MemoryCursor::new(docs)))
    }

    fn find_one(&self, ctx: &Context, filter: &Document, options: FindOptions) -> KilnResult<Option<Document>> {
        let mut cursor = self.find(ctx, filter, options.limit(1))?;
        let doc = if cursor.next() { cursor.current().cloned() } else { None };
        cursor.close()?;
        Ok(doc)
    }

    fn find_one_and_update(
        &self,
        ctx: &Context,
        filter: &Document,
        update: &Document,
        options: FindOneAndUpdateOptions,
    ) -> KilnResult<Option<Document>> {
        let query = Query::parse(filter)?;
        validate_update(update)?;
        let find = FindOptions::new().sort(options.sort.clone()).limit(1);
        check_options(&query, &find)?;

        let outcome = self.run(ctx, |scope| self.update_first(scope, &query, update, &find, options.upsert))?;
        Ok(match options.return_document {
            ReturnDocument::Before => outcome.before,
            ReturnDocument::After => outcome.after,
        })
    }

    fn find_one_and_delete(&self, ctx: &Context, filter: &Document, options: FindOptions) -> KilnResult<Option<Document>> {
        let query = Query::parse(filter)?;
        let options = options.limit(1);
        check_options(&query, &options)?;

        self.run(ctx, |scope| {
            let hit = match select(scope.snapshot(), &self.ns, &query, &options).into_iter().next() {
                Some(hit) => hit,
                None => return Ok(None),
            };
            put(scope, &self.ns, key_of(&hit.doc)?, None, OperationType::Delete)?;
            project(&hit, options.projection.as_ref()).map(Some)
        })
    }

    fn insert_one(&self, ctx: &Context, document: Document) -> KilnResult<InsertOneResult> {
        let inserted_id = self.run(ctx, |scope| self.insert(scope, document))?;
        Ok(InsertOneResult { inserted_id })
    }

    fn insert_many(
        &self,
        ctx: &Context,
        documents: Vec<Document>,
        options: InsertManyOptions,
    ) -> KilnResult<InsertManyResult> {
        self.run(ctx, |scope| {
            let mut inserted_ids = Vec::with_capacity(documents.len());
            let mut first_error = None;
            for document in documents {
                match self.insert(scope, document) {
                    Ok(id) => inserted_ids.push(id),
                    Err(err) if options.ordered => return Err(err),
                    Err(err) => {
                        first_error.get_or_insert(err);
                    }
                }
            }

            match first_error {
                Some(err) => Err(err),
                None => Ok(InsertManyResult { inserted_ids }),
            }
        })
    }

    fn replace_one(
        &self,
        ctx: &Context,
        filter: &Document,
        replacement: Document,
        options: UpdateOptions,
    ) -> KilnResult<UpdateResult> {
        let query = Query::parse(filter)?;
        if !is_replacement(&replacement) {
            return Err(invalid("replacement document must not contain update operators"));
        }

        self.run(ctx, |scope| {
            let found = select(scope.snapshot(), &self.ns, &query, &FindOptions::new().limit(1))
                .into_iter()
                .next();

            match found {
                Some(hit) => {
                    let mut doc = replacement;
                    if let Some(id) = hit.doc.get(ID_FIELD) {
                        doc.entry(ID_FIELD.to_string()).or_insert(id.clone());
                    }
                    check_id_unchanged(&hit.doc, &doc)?;
                    let modified = put(scope, &self.ns, key_of(&hit.doc)?, Some(doc), OperationType::Replace)?;
                    Ok(UpdateResult {
                        matched_count: 1,
                        modified_count: if modified { 1 } else { 0 },
                        upserted_id: None,
                    })
                }
                None if options.upsert => {
                    let mut doc = replacement;
                    if !doc.contains_key(ID_FIELD) {
                        if let Some(id) = seed(&query)?.remove(ID_FIELD) {
                            doc.insert(ID_FIELD.to_string(), id);
                        }
                    }
                    let id = self.insert(scope, doc)?;
                    Ok(UpdateResult {
                        matched_count: 0,
                        modified_count: 0,
                        upserted_id: Some(id),
                    })
                }
                None => Ok(UpdateResult::default()),
            }
        })
    }

    fn update_one(
        &self,
        ctx: &Context,
        filter: &Document,
        update: &Document,
        options: UpdateOptions,
    ) -> KilnResult<UpdateResult> {
        let query = Query::parse(filter)?;
        validate_update(update)?;

        let outcome = self.run(ctx, |scope| {
            self.update_first(scope, &query, update, &FindOptions::new(), options.upsert)
        })?;
        Ok(outcome.into_result())
    }

    fn update_many(
        &self,
        ctx: &Context,
        filter: &Document,
        update: &Document,
        options: UpdateOptions,
    ) -> KilnResult<UpdateResult> {
        let query = Query::parse(filter)?;
        validate_update(update)?;

        self.run(ctx, |scope| {
            let hits = select(scope.snapshot(), &self.ns, &query, &FindOptions::new());
            if hits.is_empty() {
                return Ok(self
                    .update_first(scope, &query, update, &FindOptions::new(), options.upsert)?
                    .into_result());
            }

            let mut result = UpdateResult::default();
            for hit in hits {
                let mut after = hit.doc.as_ref().clone();
                apply_update(&mut after, update, false)?;
                check_id_unchanged(&hit.doc, &after)?;
                result.matched_count += 1;
                if put(scope, &self.ns, key_of(&hit.doc)?, Some(after), OperationType::Update)? {
                    result.modified_count += 1;
                }
            }
            Ok(result)
        })
    }

    fn delete_one(&self, ctx: &Context, filter: &Document) -> KilnResult<DeleteResult> {
        let deleted = self.find_one_and_delete(ctx, filter, FindOptions::new())?;
        Ok(DeleteResult {
            deleted_count: if deleted.is_some() { 1 } else { 0 },
        })
    }

    fn delete_many(&self, ctx: &Context, filter: &Document) -> KilnResult<DeleteResult> {
        let query = Query::parse(filter)?;

        self.run(ctx, |scope| {
            let hits = select(scope.snapshot(), &self.ns, &query, &FindOptions::new());
            let mut result = DeleteResult::default();
            for hit in hits {
                if put(scope, &self.ns, key_of(&hit.doc)?, None, OperationType::Delete)? {
                    result.deleted_count += 1;
                }
            }
            Ok(result)
        })
    }

    fn count_documents(&self, ctx: &Context, filter: &Document, options: FindOptions) -> KilnResult<u64> {
        let query = Query::parse(filter)?;
        let options = FindOptions::new().skip(options.skip).limit(options.limit);
        self.run(ctx, |scope| Ok(select(scope.snapshot(), &self.ns, &query, &options).len() as u64))
    }

    fn distinct(&self, ctx: &Context, field: &str, filter: &Document) -> KilnResult<Vec<Value>> {
        let query = Query::parse(filter)?;

        self.run(ctx, |scope| {
            let mut values: Vec<Value> = Vec::new();
            for hit in select(scope.snapshot(), &self.ns, &query, &FindOptions::new()) {
                for value in values_at(&hit.doc, field) {
                    let items = match value {
                        Value::Array(items) => items.iter().collect::<Vec<_>>(),
                        other => vec![other],
                    };
                    for item in items {
                        if !values.iter().any(|existing| values_equal(existing, item)) {
                            values.push(item.clone());
                        }
                    }
                }
            }
            values.sort_by(compare_values);
            Ok(values)
        })
    }

    fn watch(&self, ctx: &Context, options: ChangeStreamOptions) -> KilnResult<Box<dyn RawChangeStream>> {
        ctx.check()?;
        self.engine.ensure_open()?;

        let position = match &options.resume_after {
            Some(token) => {
                let seq = decode_token(token)?;
                self.engine.oplog.check_position(seq)?;
                seq
            }
            None => self.engine.oplog.position(),
        };

        Ok(Box::new(MemoryChangeStream::new(
            self.engine.clone(),
            &self.ns,
            &self.db,
            position,
            options,
        )))
    }

    fn create_unique_index(&self, ctx: &Context, fields: &[&str]) -> KilnResult<()> {
        ctx.check()?;
        self.engine.ensure_open()?;
        if fields.is_empty() {
            return Err(invalid("index requires at least one field"));
        }

        let index = UniqueIndex {
            fields: fields.iter().map(|field| field.to_string()).collect(),
        };
        let mut state = self.engine.state.lock();
        let mut candidate = state.snapshot.clone();
        candidate.add_index(&self.ns, index);
        if let Some(namespace) = candidate.namespace(&self.ns) {
            for (key, record) in namespace.iter() {
                namespace.check_unique(key, &record.doc)?;
            }
        }
        state.snapshot = candidate;
        Ok(())
    }

    fn drop_collection(&self, ctx: &Context) -> KilnResult<()> {
        ctx.check()?;
        self.engine.ensure_open()?;

        let mut state = self.engine.state.lock();
        if state.snapshot.drop_namespace(&self.ns) {
            state.version += 1;
            self.engine.oplog.append(vec![
                Change::namespace(&self.ns, OperationType::Drop),
                Change::namespace(&self.ns, OperationType::Invalidate),
            ]);
        }
        Ok(())
    }

    fn rename(&self, ctx: &Context, to: &str) -> KilnResult<()> {
        ctx.check()?;
        self.engine.ensure_open()?;

        let target = format!("{}.{}", self.db, to);
        let mut state = self.engine.state.lock();
        if state.snapshot.namespace(&target).is_some() {
            return Err(invalid(&format!("target namespace {} already exists", target)));
        }
        let namespace = match state.snapshot.namespaces.remove(&self.ns) {
            Some(namespace) => namespace,
            None => return Err(invalid(&format!("source namespace {} does not exist", self.ns))),
        };
        state.snapshot.namespaces.insert(target, namespace);
        state.version += 1;
        self.engine.oplog.append(vec![
            Change::namespace(&self.ns, OperationType::Rename),
            Change::namespace(&self.ns, OperationType::Invalidate),
        ]);
        Ok(())
    }
}

/// A database of the in-memory engine.
pub(crate) struct MemoryDatabase {
    engine: Arc<EngineInner>,
    name: String,
    disconnected: Arc<AtomicBool>,
}

impl MemoryDatabase {
    pub fn new(engine: Arc<EngineInner>, name: &str, disconnected: Arc<AtomicBool>) -> Self {
        MemoryDatabase {
            engine,
            name: name.to_string(),
            disconnected,
        }
    }
}

impl Database for MemoryDatabase {
    fn name(&self) -> &str {
        &self.name
    }

    fn collection(&self, name: &str) -> Arc<dyn NativeCollection> {
        Arc::new(MemoryCollection {
            engine: self.engine.clone(),
            db: self.name.clone(),
            name: name.to_string(),
            ns: format!("{}.{}", self.name, name),
            disconnected: self.disconnected.clone(),
        })
    }

    fn list_collection_names(&self, ctx: &Context) -> KilnResult<Vec<String>> {
        ctx.check()?;
        self.engine.ensure_open()?;

        let prefix = format!("{}.", self.name);
        let state = self.engine.state.lock();
        Ok(state
            .snapshot
            .namespaces_of(&self.name)
            .into_iter()
            .filter_map(|ns| ns.strip_prefix(&prefix).map(str::to_string))
            .collect())
    }

    fn drop_database(&self, ctx: &Context) -> KilnResult<()> {
        ctx.check()?;
        self.engine.ensure_open()?;

        let mut state = self.engine.state.lock();
        let mut changes = Vec::new();
        for ns in state.snapshot.namespaces_of(&self.name) {
            state.snapshot.drop_namespace(&ns);
            changes.push(Change::namespace(&ns, OperationType::Drop));
            changes.push(Change::namespace(&ns, OperationType::Invalidate));
        }
        changes.push(Change::namespace(&self.name, OperationType::DropDatabase));
        state.version += 1;
        self.engine.oplog.append(changes);
        Ok(())
    }
}
