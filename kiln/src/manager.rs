use crate::collection::{Collection, SingleResult};
use crate::context::Context;
use crate::document::{get_path, set_path, to_document, Document, Value};
use crate::driver::{FindOneAndUpdateOptions, FindOptions, InsertManyOptions, Sort, SortKey, UpdateOptions};
use crate::errors::{meta_mismatch, transaction_required, ErrorKind, KilnError, KilnResult};
use crate::flags::Flags;
use crate::id::ID;
use crate::iterator::{decode_model, validate_model, ManagedIterator, ProjectionIterator};
use crate::model::{Meta, Model, ID_FIELD, LOCK_FIELD, SCORE_FIELD, TOKEN_FIELD};
use crate::translator::Translator;
use std::collections::HashMap;
use std::fmt::{Debug, Formatter};
use std::sync::Arc;

/// The amount a locking read or update adds to the lock counter.
pub const LOCK_INCREMENT: i64 = 1;

/// The amount a locking replace adds to the lock counter of the model.
pub const REPLACE_LOCK_INCREMENT: i64 = 1000;

fn invalid(message: &str) -> KilnError {
    KilnError::new(message, ErrorKind::InvalidOperation)
}

fn id_filter(id: ID) -> Document {
    let mut filter = Document::new();
    filter.insert(ID_FIELD.to_string(), Value::from(id));
    filter
}

fn lock_update() -> Document {
    let mut inc = Document::new();
    inc.insert(LOCK_FIELD.to_string(), Value::from(LOCK_INCREMENT));
    let mut update = Document::new();
    update.insert("$inc".to_string(), Value::Object(inc));
    update
}

/// Adds the lock increment to an update document.
fn add_lock(update: &mut Document) -> KilnResult<()> {
    let path = format!("$inc.{}", LOCK_FIELD);
    if get_path(update, &path).is_some() {
        return Err(invalid("unable to add lock, the update already increments the lock"));
    }
    set_path(update, &path, Value::from(LOCK_INCREMENT))
        .map_err(|err| KilnError::new_with_cause("unable to add lock", ErrorKind::InvalidOperation, err))
}

fn score_projection() -> Document {
    let mut meta = Document::new();
    meta.insert("$meta".to_string(), Value::from("textScore"));
    let mut projection = Document::new();
    projection.insert(SCORE_FIELD.to_string(), Value::Object(meta));
    projection
}

/// Returns an error unless a transaction is available when one is needed.
/// Locking always needs one; multi document reads need one unless the
/// caller opted out.
fn require_transaction(ctx: &Context, lock: bool, flags: Flags) -> KilnResult<()> {
    if (lock || !flags.no_transaction()) && !ctx.has_transaction() {
        return Err(transaction_required());
    }
    Ok(())
}

fn require_lock_transaction(ctx: &Context, lock: bool) -> KilnResult<()> {
    if lock && !ctx.has_transaction() {
        return Err(transaction_required());
    }
    Ok(())
}

fn check_bulk_lock(lock: bool, skip: u64, limit: u64) -> KilnResult<()> {
    if lock && (skip > 0 || limit > 0) {
        return Err(invalid("cannot lock with skip and limit"));
    }
    Ok(())
}

/// Performs checked operations on the documents of one model type.
///
/// # Purpose
/// The manager turns the intent of a caller into a correctly shaped driver
/// request. It translates filters, updates, sorts and fields through its
/// [`Translator`], enforces the transaction and locking rules and runs the
/// validation hook of the model on every document it reads or writes.
///
/// # Locking
/// Operations that take a `lock` argument increment the lock counter of the
/// affected documents in the same atomic operation that reads or writes
/// them. A concurrent transaction that depends on such a document then
/// conflicts on commit. Locking always requires a transaction and cannot be
/// combined with skip or limit.
///
/// # Transactions
/// Multi document reads (`find_all`, `find_each`, `project_all`,
/// `project_each`, `count`, `distinct`) require a transaction, since they
/// may otherwise miss documents or return them twice when concurrent writes
/// move them. Pass [`Flags::NO_TRANSACTION`] to accept that risk.
///
/// # Missing documents
/// Single document operations report a missing document as `Ok(None)` or
/// `Ok(false)`, never as an error.
#[derive(Clone)]
pub struct Manager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    meta: &'static Meta,
    collection: Collection,
    translator: Arc<dyn Translator>,
}

impl Manager {
    /// Creates a manager for the model described by `meta`. Stores create
    /// their managers with [`Store::m`](crate::store::Store::m).
    pub fn new(meta: &'static Meta, collection: Collection, translator: Arc<dyn Translator>) -> Self {
        Manager {
            inner: Arc::new(ManagerInner {
                meta,
                collection,
                translator,
            }),
        }
    }

    pub fn meta(&self) -> &'static Meta {
        self.inner.meta
    }

    pub fn collection(&self) -> &Collection {
        &self.inner.collection
    }

    pub fn translator(&self) -> &Arc<dyn Translator> {
        &self.inner.translator
    }

    fn run<T>(&self, operation: &str, op: impl FnOnce() -> KilnResult<T>) -> KilnResult<T> {
        log::debug!("Manager.{} on {}", operation, self.inner.meta.name());
        op().map_err(|err| KilnError::wrap(&format!("Manager.{}", operation), err))
    }

    fn check<M: Model>(&self) -> KilnResult<()> {
        if M::meta() != self.inner.meta {
            return Err(meta_mismatch());
        }
        Ok(())
    }

    fn filter(&self, filter: &Document) -> KilnResult<Document> {
        self.inner.translator.document(filter)
    }

    fn sort(&self, sort: &[&str]) -> KilnResult<Sort> {
        if sort.is_empty() {
            return Ok(Vec::new());
        }
        self.inner.translator.sort(sort)
    }

    fn update_doc(&self, update: &Document, lock: bool) -> KilnResult<Document> {
        let mut update = self.inner.translator.document(update)?;
        if lock {
            add_lock(&mut update)?;
        }
        Ok(update)
    }

    fn find_options(&self, sort: &[&str], skip: u64, limit: u64, flags: Flags) -> KilnResult<FindOptions> {
        let mut sort = self.sort(sort)?;
        let mut options = FindOptions::new().skip(skip).limit(limit);
        if flags.text_score_sort() {
            sort.insert(0, SortKey::text_score(SCORE_FIELD));
            options = options.projection(score_projection());
        }
        Ok(options.sort(sort))
    }

    fn decode<M: Model>(&self, result: SingleResult, flags: Flags) -> KilnResult<Option<M>> {
        match result.into_document() {
            Some(doc) => Ok(Some(decode_model(doc, !flags.no_validation())?)),
            None => Ok(None),
        }
    }

    fn encode<M: Model>(&self, model: &M) -> KilnResult<Document> {
        let mut doc = to_document(model)?;
        doc.remove(SCORE_FIELD);
        Ok(doc)
    }

    fn lock_many(&self, ctx: &Context, filter: &Document) -> KilnResult<u64> {
        let result = self
            .inner
            .collection
            .update_many(ctx, filter, &lock_update(), UpdateOptions::default())?;
        Ok(result.modified_count)
    }

    /// Finds the document with the specified id. With `lock` the lock
    /// counter of the document is incremented and the updated document is
    /// returned.
    ///
    /// A transaction is required for locking.
    pub fn find<M: Model>(&self, ctx: &Context, id: ID, lock: bool, flags: Flags) -> KilnResult<Option<M>> {
        self.run("find", || {
            self.check::<M>()?;
            require_lock_transaction(ctx, lock)?;

            let filter = id_filter(id);
            let result = if lock {
                let options = FindOneAndUpdateOptions::new().return_after();
                self.inner.collection.find_one_and_update(ctx, &filter, &lock_update(), options)?
            } else {
                self.inner.collection.find_one(ctx, &filter, FindOptions::new())?
            };
            self.decode(result, flags)
        })
    }

    /// Finds the first document that matches the filter. Locking cannot be
    /// combined with skip.
    ///
    /// A transaction is required for locking. If the result depends on
    /// concurrent writes not moving documents in or out of the filter, run
    /// the operation in a transaction. With [`Flags::TEXT_SCORE_SORT`] the
    /// best scoring document is returned; only unlocked reads carry the score.
    pub fn find_first<M: Model>(
        &self,
        ctx: &Context,
        filter: &Document,
        sort: &[&str],
        skip: u64,
        lock: bool,
        flags: Flags,
    ) -> KilnResult<Option<M>> {
        self.run("find_first", || {
            self.check::<M>()?;
            require_lock_transaction(ctx, lock)?;
            if lock && skip > 0 {
                return Err(invalid("cannot lock with skip"));
            }

            let filter = self.filter(filter)?;
            let options = self.find_options(sort, skip, 0, flags)?;
            let result = if lock {
                let options = FindOneAndUpdateOptions::new().sort(options.sort).return_after();
                self.inner.collection.find_one_and_update(ctx, &filter, &lock_update(), options)?
            } else {
                self.inner.collection.find_one(ctx, &filter, options)?
            };
            self.decode(result, flags)
        })
    }

    /// Finds all documents that match the filter. With `lock` the lock
    /// counters of all matching documents are incremented first.
    ///
    /// A transaction is required unless [`Flags::NO_TRANSACTION`] is set.
    /// With [`Flags::TEXT_SCORE_SORT`] the results are sorted by text score
    /// first and carry their score.
    #[allow(clippy::too_many_arguments)]
    pub fn find_all<M: Model>(
        &self,
        ctx: &Context,
        filter: &Document,
        sort: &[&str],
        skip: u64,
        limit: u64,
        lock: bool,
        flags: Flags,
    ) -> KilnResult<Vec<M>> {
        self.run("find_all", || {
            self.check::<M>()?;
            let iter = self.open_iterator(ctx, filter, sort, skip, limit, lock, flags)?;
            iter.models::<M>().collect()
        })
    }

    /// Finds all documents that match the filter and returns an iterator
    /// that decodes them. The same rules as for [`Manager::find_all`] apply.
    #[allow(clippy::too_many_arguments)]
    pub fn find_each(
        &self,
        ctx: &Context,
        filter: &Document,
        sort: &[&str],
        skip: u64,
        limit: u64,
        lock: bool,
        flags: Flags,
    ) -> KilnResult<ManagedIterator> {
        self.run("find_each", || self.open_iterator(ctx, filter, sort, skip, limit, lock, flags))
    }

    #[allow(clippy::too_many_arguments)]
    fn open_iterator(
        &self,
        ctx: &Context,
        filter: &Document,
        sort: &[&str],
        skip: u64,
        limit: u64,
        lock: bool,
        flags: Flags,
    ) -> KilnResult<ManagedIterator> {
        require_transaction(ctx, lock, flags)?;
        check_bulk_lock(lock, skip, limit)?;

        let filter = self.filter(filter)?;
        let options = self.find_options(sort, skip, limit, flags)?;
        if lock {
            self.lock_many(ctx, &filter)?;
        }

        let cursor = self.inner.collection.find(ctx, &filter, options)?;
        Ok(ManagedIterator::new(self.inner.meta, cursor, !flags.no_validation()))
    }

    /// Returns the value of a field of the document with the specified id.
    /// Returns `None` if no document has been found and `Some(Value::Null)`
    /// if the document lacks the field.
    ///
    /// A transaction is required for locking.
    pub fn project(&self, ctx: &Context, id: ID, field: &str, lock: bool) -> KilnResult<Option<Value>> {
        self.run("project", || {
            require_lock_transaction(ctx, lock)?;
            let field = self.inner.translator.field(field)?;
            self.project_one(ctx, &id_filter(id), &field, Vec::new(), 0, lock)
        })
    }

    /// Returns the value of a field of the first document that matches the
    /// filter. Locking cannot be combined with skip.
    ///
    /// A transaction is required for locking.
    pub fn project_first(
        &self,
        ctx: &Context,
        filter: &Document,
        field: &str,
        sort: &[&str],
        skip: u64,
        lock: bool,
    ) -> KilnResult<Option<Value>> {
        self.run("project_first", || {
            require_lock_transaction(ctx, lock)?;
            if lock && skip > 0 {
                return Err(invalid("cannot lock with skip"));
            }

            let filter = self.filter(filter)?;
            let field = self.inner.translator.field(field)?;
            let sort = self.sort(sort)?;
            self.project_one(ctx, &filter, &field, sort, skip, lock)
        })
    }

    fn project_one(
        &self,
        ctx: &Context,
        filter: &Document,
        field: &str,
        sort: Sort,
        skip: u64,
        lock: bool,
    ) -> KilnResult<Option<Value>> {
        let result = if lock {
            let options = FindOneAndUpdateOptions::new().sort(sort).return_after();
            self.inner.collection.find_one_and_update(ctx, filter, &lock_update(), options)?
        } else {
            let mut projection = Document::new();
            projection.insert(field.to_string(), Value::from(1));
            let options = FindOptions::new().sort(sort).skip(skip).projection(projection);
            self.inner.collection.find_one(ctx, filter, options)?
        };

        Ok(result
            .document()
            .map(|doc| get_path(doc, field).cloned().unwrap_or(Value::Null)))
    }

    /// Returns the values of a field of all documents that match the filter,
    /// keyed by document id.
    ///
    /// A transaction is required unless [`Flags::NO_TRANSACTION`] is set.
    #[allow(clippy::too_many_arguments)]
    pub fn project_all(
        &self,
        ctx: &Context,
        filter: &Document,
        field: &str,
        sort: &[&str],
        skip: u64,
        limit: u64,
        lock: bool,
        flags: Flags,
    ) -> KilnResult<HashMap<ID, Value>> {
        self.run("project_all", || {
            self.open_projection(ctx, filter, field, sort, skip, limit, lock, flags)?
                .collect()
        })
    }

    /// Returns an iterator over the id and field value of all documents that
    /// match the filter. Stop iterating to end early.
    ///
    /// A transaction is required unless [`Flags::NO_TRANSACTION`] is set.
    #[allow(clippy::too_many_arguments)]
    pub fn project_each(
        &self,
        ctx: &Context,
        filter: &Document,
        field: &str,
        sort: &[&str],
        skip: u64,
        limit: u64,
        lock: bool,
        flags: Flags,
    ) -> KilnResult<ProjectionIterator> {
        self.run("project_each", || {
            self.open_projection(ctx, filter, field, sort, skip, limit, lock, flags)
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn open_projection(
        &self,
        ctx: &Context,
        filter: &Document,
        field: &str,
        sort: &[&str],
        skip: u64,
        limit: u64,
        lock: bool,
        flags: Flags,
    ) -> KilnResult<ProjectionIterator> {
        require_transaction(ctx, lock, flags)?;
        check_bulk_lock(lock, skip, limit)?;

        let filter = self.filter(filter)?;
        let field = self.inner.translator.field(field)?;
        let mut projection = Document::new();
        projection.insert(field.clone(), Value::from(1));
        let options = FindOptions::new()
            .sort(self.sort(sort)?)
            .skip(skip)
            .limit(limit)
            .projection(projection);

        if lock {
            self.lock_many(ctx, &filter)?;
        }

        let cursor = self.inner.collection.find(ctx, &filter, options)?;
        Ok(ProjectionIterator::new(field, cursor))
    }

    /// Counts the documents that match the filter. With `lock` the matching
    /// documents are locked instead and the number of locked documents is
    /// returned.
    ///
    /// A transaction is required unless [`Flags::NO_TRANSACTION`] is set.
    pub fn count(
        &self,
        ctx: &Context,
        filter: &Document,
        skip: u64,
        limit: u64,
        lock: bool,
        flags: Flags,
    ) -> KilnResult<u64> {
        self.run("count", || {
            require_transaction(ctx, lock, flags)?;
            check_bulk_lock(lock, skip, limit)?;

            let filter = self.filter(filter)?;
            if lock {
                return self.lock_many(ctx, &filter);
            }

            let options = FindOptions::new().skip(skip).limit(limit);
            self.inner.collection.count_documents(ctx, &filter, options)
        })
    }

    /// Returns the distinct values of a field across the documents that
    /// match the filter. With `lock` the matching documents are locked
    /// first.
    ///
    /// A transaction is required unless [`Flags::NO_TRANSACTION`] is set.
    pub fn distinct(
        &self,
        ctx: &Context,
        field: &str,
        filter: &Document,
        lock: bool,
        flags: Flags,
    ) -> KilnResult<Vec<Value>> {
        self.run("distinct", || {
            require_transaction(ctx, lock, flags)?;

            let field = self.inner.translator.field(field)?;
            let filter = self.filter(filter)?;
            if lock {
                self.lock_many(ctx, &filter)?;
            }

            self.inner.collection.distinct(ctx, &field, &filter)
        })
    }

    /// Inserts the model. A zero id is replaced with a new id first.
    pub fn insert<M: Model>(&self, ctx: &Context, model: &mut M, flags: Flags) -> KilnResult<()> {
        self.run("insert", || self.insert_models(ctx, std::slice::from_mut(model), flags))
    }

    /// Inserts the models in order, stopping at the first failure. Models
    /// inserted before the failure stay inserted unless the call runs in a
    /// transaction.
    pub fn insert_all<M: Model>(&self, ctx: &Context, models: &mut [M], flags: Flags) -> KilnResult<()> {
        self.run("insert_all", || self.insert_models(ctx, models, flags))
    }

    fn insert_models<M: Model>(&self, ctx: &Context, models: &mut [M], flags: Flags) -> KilnResult<()> {
        self.check::<M>()?;
        if models.is_empty() {
            return Ok(());
        }

        for model in models.iter_mut() {
            if model.id().is_zero() {
                model.base_mut().id = ID::new();
            }
        }

        if !flags.no_validation() {
            for model in models.iter() {
                validate_model(model)?;
            }
        }

        let mut docs = models
            .iter()
            .map(|model| self.encode(model))
            .collect::<KilnResult<Vec<Document>>>()?;

        if docs.len() == 1 {
            if let Some(doc) = docs.pop() {
                self.inner.collection.insert_one(ctx, doc)?;
            }
        } else {
            self.inner.collection.insert_many(ctx, docs, InsertManyOptions::default())?;
        }
        Ok(())
    }

    /// Inserts the model unless a document matches the filter. Returns
    /// whether the model has been inserted. The inserted document combines
    /// the equality fields of the filter with the model. With `lock` the
    /// lock counter of an existing document is incremented.
    ///
    /// A transaction is required for locking. Concurrent calls may insert
    /// duplicates unless the filter is covered by a unique index, even in
    /// transactions.
    pub fn insert_if_missing<M: Model>(
        &self,
        ctx: &Context,
        filter: &Document,
        model: &mut M,
        lock: bool,
        flags: Flags,
    ) -> KilnResult<bool> {
        self.run("insert_if_missing", || {
            require_lock_transaction(ctx, lock)?;
            let filter = self.filter(filter)?;
            self.check::<M>()?;

            if model.id().is_zero() {
                model.base_mut().id = ID::new();
            }
            if !flags.no_validation() {
                validate_model(model)?;
            }

            let mut doc = self.encode(model)?;
            let mut update = Document::new();
            if lock {
                doc.remove(LOCK_FIELD);
                add_lock(&mut update)?;
            }
            update.insert("$setOnInsert".to_string(), Value::Object(doc));

            let result = self
                .inner
                .collection
                .update_one(ctx, &filter, &update, UpdateOptions::upsert())?;
            let inserted = result.upserted_count() == 1;
            if inserted && lock {
                model.base_mut().lock = LOCK_INCREMENT;
            }
            Ok(inserted)
        })
    }

    /// Replaces the document with the id of the model. Returns whether a
    /// document has been found. With `lock` the lock counter of the model is
    /// raised before writing, so the replace also locks an unchanged
    /// document.
    ///
    /// A transaction is required for locking.
    pub fn replace<M: Model>(&self, ctx: &Context, model: &mut M, lock: bool, flags: Flags) -> KilnResult<bool> {
        self.run("replace", || {
            self.check::<M>()?;
            if model.id().is_zero() {
                return Err(invalid("model has a zero id"));
            }
            require_lock_transaction(ctx, lock)?;
            if !flags.no_validation() {
                validate_model(model)?;
            }

            if lock {
                model.base_mut().lock += REPLACE_LOCK_INCREMENT;
            }

            let doc = self.encode(model)?;
            let result = self
                .inner
                .collection
                .replace_one(ctx, &id_filter(model.id()), doc, UpdateOptions::default())?;
            Ok(result.matched_count == 1)
        })
    }

    /// Replaces the first document that matches the filter. Returns whether
    /// a document has been found. A model with a zero id keeps the id of the
    /// replaced document.
    ///
    /// A transaction is required for locking.
    pub fn replace_first<M: Model>(
        &self,
        ctx: &Context,
        filter: &Document,
        model: &mut M,
        lock: bool,
        flags: Flags,
    ) -> KilnResult<bool> {
        self.run("replace_first", || {
            self.check::<M>()?;
            require_lock_transaction(ctx, lock)?;
            if !flags.no_validation() {
                validate_model(model)?;
            }

            if lock {
                model.base_mut().lock += REPLACE_LOCK_INCREMENT;
            }

            let filter = self.filter(filter)?;
            let mut doc = self.encode(model)?;
            if model.id().is_zero() {
                doc.remove(ID_FIELD);
            }

            let result = self
                .inner
                .collection
                .replace_one(ctx, &filter, doc, UpdateOptions::default())?;
            Ok(result.matched_count == 1)
        })
    }

    /// Updates the document with the specified id and returns the updated
    /// document, or `None` if it does not exist. With `lock` the lock
    /// increment is added to the update.
    ///
    /// A transaction is required for locking.
    pub fn update<M: Model>(
        &self,
        ctx: &Context,
        id: ID,
        update: &Document,
        lock: bool,
        flags: Flags,
    ) -> KilnResult<Option<M>> {
        self.run("update", || {
            require_lock_transaction(ctx, lock)?;
            self.check::<M>()?;

            let update = self.update_doc(update, lock)?;
            let options = FindOneAndUpdateOptions::new().return_after();
            let result = self
                .inner
                .collection
                .find_one_and_update(ctx, &id_filter(id), &update, options)?;
            self.decode(result, flags)
        })
    }

    /// Updates the first document that matches the filter and returns the
    /// updated document, or `None` if nothing matched.
    ///
    /// A transaction is required for locking.
    pub fn update_first<M: Model>(
        &self,
        ctx: &Context,
        filter: &Document,
        update: &Document,
        sort: &[&str],
        lock: bool,
        flags: Flags,
    ) -> KilnResult<Option<M>> {
        self.run("update_first", || {
            require_lock_transaction(ctx, lock)?;
            self.check::<M>()?;

            let filter = self.filter(filter)?;
            let update = self.update_doc(update, lock)?;
            let options = FindOneAndUpdateOptions::new().sort(self.sort(sort)?).return_after();
            let result = self.inner.collection.find_one_and_update(ctx, &filter, &update, options)?;
            self.decode(result, flags)
        })
    }

    /// Updates all documents that match the filter and returns the number of
    /// matched documents.
    ///
    /// A transaction is required for locking.
    pub fn update_all(&self, ctx: &Context, filter: &Document, update: &Document, lock: bool) -> KilnResult<u64> {
        self.run("update_all", || {
            require_lock_transaction(ctx, lock)?;

            let filter = self.filter(filter)?;
            let update = self.update_doc(update, lock)?;
            let result = self
                .inner
                .collection
                .update_many(ctx, &filter, &update, UpdateOptions::default())?;
            Ok(result.matched_count)
        })
    }

    /// Updates the first document that matches the filter or inserts a new
    /// document built from the filter and the update. Returns the resulting
    /// document and whether it has been inserted.
    ///
    /// The call sends a fresh token with the insert branch of the update;
    /// the document has been inserted exactly when it carries that token.
    ///
    /// A transaction is required for locking. Concurrent calls may insert
    /// duplicates unless the filter is covered by a unique index.
    pub fn upsert<M: Model>(
        &self,
        ctx: &Context,
        filter: &Document,
        update: &Document,
        sort: &[&str],
        lock: bool,
        flags: Flags,
    ) -> KilnResult<(M, bool)> {
        self.run("upsert", || {
            require_lock_transaction(ctx, lock)?;
            self.check::<M>()?;

            let filter = self.filter(filter)?;
            let mut update = self.update_doc(update, lock)?;
            let options = FindOneAndUpdateOptions::new()
                .sort(self.sort(sort)?)
                .upsert(true)
                .return_after();

            let token = ID::new();
            set_path(&mut update, &format!("$setOnInsert.{}", TOKEN_FIELD), Value::from(token))
                .map_err(|err| KilnError::new_with_cause("unable to set token", ErrorKind::InvalidOperation, err))?;

            let result = self.inner.collection.find_one_and_update(ctx, &filter, &update, options)?;
            let model: M = self
                .decode(result, flags)?
                .ok_or_else(|| KilnError::new("upsert returned no document", ErrorKind::InternalError))?;
            let inserted = model.base().token == Some(token);
            Ok((model, inserted))
        })
    }

    /// Deletes the document with the specified id. Returns whether a
    /// document has been deleted.
    pub fn delete(&self, ctx: &Context, id: ID) -> KilnResult<bool> {
        self.run("delete", || {
            let result = self.inner.collection.delete_one(ctx, &id_filter(id))?;
            Ok(result.deleted_count == 1)
        })
    }

    /// Deletes the document with the specified id and returns it.
    pub fn find_and_delete<M: Model>(&self, ctx: &Context, id: ID, flags: Flags) -> KilnResult<Option<M>> {
        self.run("find_and_delete", || {
            self.check::<M>()?;
            let result = self
                .inner
                .collection
                .find_one_and_delete(ctx, &id_filter(id), FindOptions::new())?;
            self.decode(result, flags)
        })
    }

    /// Deletes the first document that matches the filter and returns it.
    pub fn delete_first<M: Model>(
        &self,
        ctx: &Context,
        filter: &Document,
        sort: &[&str],
        flags: Flags,
    ) -> KilnResult<Option<M>> {
        self.run("delete_first", || {
            let filter = self.filter(filter)?;
            self.check::<M>()?;

            let options = FindOptions::new().sort(self.sort(sort)?);
            let result = self.inner.collection.find_one_and_delete(ctx, &filter, options)?;
            self.decode(result, flags)
        })
    }

    /// Deletes all documents that match the filter and returns their number.
    pub fn delete_all(&self, ctx: &Context, filter: &Document) -> KilnResult<u64> {
        self.run("delete_all", || {
            let filter = self.filter(filter)?;
            let result = self.inner.collection.delete_many(ctx, &filter)?;
            Ok(result.deleted_count)
        })
    }
}

impl Debug for Manager {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Manager")
            .field("model", &self.inner.meta.name())
            .field("collection", &self.inner.meta.collection())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::doc;
    use crate::errors::{is_duplicate, is_missing};
    use crate::model::{Base, Validate};
    use crate::store::Store;
    use crate::Model;
    use serde::{Deserialize, Serialize};

    #[derive(Model, Serialize, Deserialize, Default, Debug, Clone, PartialEq)]
    #[model(collection = "posts")]
    struct Post {
        #[serde(flatten)]
        base: Base,
        title: String,
        #[serde(rename = "textBody", default)]
        text_body: String,
        #[serde(default)]
        tags: Vec<String>,
    }

    impl Validate for Post {
        fn validate(&self) -> anyhow::Result<()> {
            if self.title.is_empty() {
                anyhow::bail!("missing title");
            }
            Ok(())
        }
    }

    #[derive(Model, Serialize, Deserialize, Default, Debug)]
    #[model(collection = "comments")]
    struct Comment {
        #[serde(flatten)]
        base: Base,
    }

    impl Validate for Comment {}

    fn post(title: &str) -> Post {
        Post {
            title: title.to_string(),
            ..Default::default()
        }
    }

    fn setup() -> (Store, Manager, Context) {
        let store = Store::open(None, "test").unwrap();
        let manager = store.m::<Post>();
        (store, manager, Context::background())
    }

    fn insert(manager: &Manager, ctx: &Context, titles: &[&str]) -> Vec<Post> {
        let mut posts: Vec<Post> = titles.iter().map(|title| post(title)).collect();
        manager.insert_all(ctx, &mut posts, Flags::empty()).unwrap();
        posts
    }

    fn stored_lock(store: &Store, id: ID) -> i64 {
        let doc = store
            .c::<Post>()
            .find_one(&Context::background(), &doc! { "_id": id }, FindOptions::new())
            .unwrap()
            .into_document()
            .unwrap();
        doc[LOCK_FIELD].as_i64().unwrap()
    }

    #[test]
    fn test_find_returns_none_when_missing() {
        let (_store, manager, ctx) = setup();
        let found = manager.find::<Post>(&ctx, ID::new(), false, Flags::empty()).unwrap();
        assert!(found.is_none());
    }

    #[test]
    fn test_find_returns_document() {
        let (_store, manager, ctx) = setup();
        let posts = insert(&manager, &ctx, &["A"]);
        let found: Post = manager.find(&ctx, posts[0].id(), false, Flags::empty()).unwrap().unwrap();
        assert_eq!(found, posts[0]);
        assert_eq!(found.base.lock, 0);
    }

    #[test]
    fn test_find_lock_requires_transaction() {
        let (store, manager, ctx) = setup();
        let posts = insert(&manager, &ctx, &["A"]);

        let err = manager.find::<Post>(&ctx, posts[0].id(), true, Flags::empty()).unwrap_err();
        assert_eq!(err.kind(), &ErrorKind::TransactionRequired);
        assert_eq!(stored_lock(&store, posts[0].id()), 0);
    }

    #[test]
    fn test_find_lock_increments_counter() {
        let (store, manager, ctx) = setup();
        let posts = insert(&manager, &ctx, &["A"]);

        let found: Post = store
            .with_transaction(&ctx, |ctx| manager.find(ctx, posts[0].id(), true, Flags::empty()))
            .unwrap()
            .unwrap();
        assert_eq!(found.base.lock, 1);
        assert_eq!(stored_lock(&store, posts[0].id()), 1);
    }

    #[test]
    fn test_rejects_other_models() {
        let (_store, manager, ctx) = setup();
        let err = manager.find::<Comment>(&ctx, ID::new(), false, Flags::empty()).unwrap_err();
        assert_eq!(err.kind(), &ErrorKind::MetaMismatch);

        let err = manager
            .insert(&ctx, &mut Comment::default(), Flags::empty())
            .unwrap_err();
        assert_eq!(err.kind(), &ErrorKind::MetaMismatch);
    }

    #[test]
    fn test_find_validates_unless_disabled() {
        let (store, manager, ctx) = setup();
        let id = ID::new();
        store
            .c::<Post>()
            .insert_one(&ctx, doc! { "_id": id, "_lk": 0, "title": "" })
            .unwrap();

        let err = manager.find::<Post>(&ctx, id, false, Flags::empty()).unwrap_err();
        assert_eq!(err.kind(), &ErrorKind::ValidationError);

        let found = manager.find::<Post>(&ctx, id, false, Flags::NO_VALIDATION).unwrap();
        assert!(found.is_some());
    }

    #[test]
    fn test_find_first() {
        let (store, manager, ctx) = setup();
        insert(&manager, &ctx, &["B", "A", "C"]);

        let first: Post = manager
            .find_first(&ctx, &doc! {}, &["title"], 0, false, Flags::empty())
            .unwrap()
            .unwrap();
        assert_eq!(first.title, "A");

        let second: Post = manager
            .find_first(&ctx, &doc! {}, &["-title"], 1, false, Flags::empty())
            .unwrap()
            .unwrap();
        assert_eq!(second.title, "B");

        let missing = manager
            .find_first::<Post>(&ctx, &doc! { "title": "D" }, &[], 0, false, Flags::empty())
            .unwrap();
        assert!(missing.is_none());

        let err = store
            .with_transaction(&ctx, |ctx| {
                manager.find_first::<Post>(ctx, &doc! {}, &[], 1, true, Flags::empty())
            })
            .unwrap_err();
        assert_eq!(err.kind(), &ErrorKind::InvalidOperation);

        let locked: Post = store
            .with_transaction(&ctx, |ctx| {
                manager.find_first(ctx, &doc! { "title": "C" }, &[], 0, true, Flags::empty())
            })
            .unwrap()
            .unwrap();
        assert_eq!(locked.base.lock, 1);
    }

    #[test]
    fn test_translation_errors_are_not_missing() {
        let (_store, manager, ctx) = setup();
        let err = manager
            .find_first::<Post>(&ctx, &doc! { "body": "A" }, &[], 0, false, Flags::empty())
            .unwrap_err();
        assert_eq!(err.kind(), &ErrorKind::TranslationError);
        assert!(!is_missing(&err));
        assert!(err.message().starts_with("Manager.find_first"));
    }

    #[test]
    fn test_find_all_requires_transaction() {
        let (store, manager, ctx) = setup();
        insert(&manager, &ctx, &["A", "B"]);

        let err = manager
            .find_all::<Post>(&ctx, &doc! {}, &[], 0, 0, false, Flags::empty())
            .unwrap_err();
        assert_eq!(err.kind(), &ErrorKind::TransactionRequired);

        let all: Vec<Post> = manager
            .find_all(&ctx, &doc! {}, &["title"], 0, 0, false, Flags::NO_TRANSACTION)
            .unwrap();
        assert_eq!(all.len(), 2);

        let all: Vec<Post> = store
            .with_transaction(&ctx, |ctx| manager.find_all(ctx, &doc! {}, &["-title"], 1, 1, false, Flags::empty()))
            .unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].title, "A");
    }

    #[test]
    fn test_find_all_with_lock() {
        let (store, manager, ctx) = setup();
        let posts = insert(&manager, &ctx, &["A", "B"]);

        let err = store
            .with_transaction(&ctx, |ctx| {
                manager.find_all::<Post>(ctx, &doc! {}, &[], 0, 1, true, Flags::empty())
            })
            .unwrap_err();
        assert_eq!(err.kind(), &ErrorKind::InvalidOperation);

        let all: Vec<Post> = store
            .with_transaction(&ctx, |ctx| manager.find_all(ctx, &doc! {}, &[], 0, 0, true, Flags::empty()))
            .unwrap();
        assert!(all.iter().all(|post| post.base.lock == 1));
        assert_eq!(stored_lock(&store, posts[1].id()), 1);
    }

    #[test]
    fn test_find_all_text_score_sort() {
        let (_store, manager, ctx) = setup();
        let mut posts = vec![post("rust"), post("rust rust rust"), post("go")];
        manager.insert_all(&ctx, &mut posts, Flags::empty()).unwrap();

        let found: Vec<Post> = manager
            .find_all(
                &ctx,
                &doc! { "$text": { "$search": "rust" } },
                &[],
                0,
                0,
                false,
                Flags::NO_TRANSACTION | Flags::TEXT_SCORE_SORT,
            )
            .unwrap();
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].title, "rust rust rust");
        assert!(found[0].base.score >= found[1].base.score);
        assert!(found[1].base.score > 0.0);
    }

    #[test]
    fn test_find_first_text_score_sort() {
        let (store, manager, ctx) = setup();
        let mut posts = vec![post("rust"), post("rust rust rust"), post("go")];
        manager.insert_all(&ctx, &mut posts, Flags::empty()).unwrap();
        let search = doc! { "$text": { "$search": "rust" } };

        let best: Post = manager
            .find_first(&ctx, &search, &[], 0, false, Flags::TEXT_SCORE_SORT)
            .unwrap()
            .unwrap();
        assert_eq!(best.title, "rust rust rust");
        assert!(best.base.score > 0.0);

        let runner_up: Post = manager
            .find_first(&ctx, &search, &[], 1, false, Flags::TEXT_SCORE_SORT)
            .unwrap()
            .unwrap();
        assert_eq!(runner_up.title, "rust");

        let locked: Post = store
            .with_transaction(&ctx, |ctx| {
                manager.find_first(ctx, &search, &[], 0, true, Flags::TEXT_SCORE_SORT)
            })
            .unwrap()
            .unwrap();
        assert_eq!(locked.title, "rust rust rust");
        assert_eq!(locked.base.lock, 1);
    }

    #[test]
    fn test_find_each() {
        let (_store, manager, ctx) = setup();
        insert(&manager, &ctx, &["A", "B", "C"]);

        let mut iter = manager
            .find_each(&ctx, &doc! {}, &["title"], 0, 0, false, Flags::NO_TRANSACTION)
            .unwrap();
        let mut titles = Vec::new();
        while iter.next() {
            let post: Post = iter.decode().unwrap();
            titles.push(post.title);
        }
        assert!(iter.error().is_none());
        iter.close().unwrap();
        assert_eq!(titles, vec!["A", "B", "C"]);

        let err = manager
            .find_each(&ctx, &doc! {}, &[], 0, 0, false, Flags::empty())
            .unwrap_err();
        assert_eq!(err.kind(), &ErrorKind::TransactionRequired);
    }

    #[test]
    fn test_project() {
        let (store, manager, ctx) = setup();
        let mut posts = vec![Post {
            text_body: "body".to_string(),
            ..post("A")
        }];
        manager.insert_all(&ctx, &mut posts, Flags::empty()).unwrap();
        let id = posts[0].id();

        assert_eq!(manager.project(&ctx, id, "text_body", false).unwrap(), Some(Value::from("body")));
        assert_eq!(manager.project(&ctx, ID::new(), "title", false).unwrap(), None);
        store
            .c::<Post>()
            .update_one(&ctx, &doc! { "_id": id }, &doc! { "$unset": { "textBody": "" } }, UpdateOptions::default())
            .unwrap();
        assert_eq!(manager.project(&ctx, id, "text_body", false).unwrap(), Some(Value::Null));

        let err = manager.project(&ctx, id, "title", true).unwrap_err();
        assert_eq!(err.kind(), &ErrorKind::TransactionRequired);

        let locked = store
            .with_transaction(&ctx, |ctx| manager.project(ctx, id, "_lk", true))
            .unwrap();
        assert_eq!(locked, Some(Value::from(1)));
    }

    #[test]
    fn test_project_first() {
        let (_store, manager, ctx) = setup();
        insert(&manager, &ctx, &["B", "A"]);

        let first = manager.project_first(&ctx, &doc! {}, "title", &["title"], 0, false).unwrap();
        assert_eq!(first, Some(Value::from("A")));
        let missing = manager
            .project_first(&ctx, &doc! { "title": "C" }, "title", &[], 0, false)
            .unwrap();
        assert!(missing.is_none());
    }

    #[test]
    fn test_project_all_and_each() {
        let (_store, manager, ctx) = setup();
        let posts = insert(&manager, &ctx, &["A", "B", "C"]);

        let all = manager
            .project_all(&ctx, &doc! {}, "title", &[], 0, 0, false, Flags::NO_TRANSACTION)
            .unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[&posts[1].id()], Value::from("B"));

        let mut iter = manager
            .project_each(&ctx, &doc! {}, "title", &["-title"], 0, 0, false, Flags::NO_TRANSACTION)
            .unwrap();
        let (id, title) = iter.next().unwrap().unwrap();
        assert_eq!(id, posts[2].id());
        assert_eq!(title, Value::from("C"));
        iter.close().unwrap();
        assert!(iter.next().is_none());
    }

    #[test]
    fn test_count_and_distinct() {
        let (store, manager, ctx) = setup();
        let mut posts = vec![
            Post {
                tags: vec!["a".to_string(), "b".to_string()],
                ..post("A")
            },
            Post {
                tags: vec!["b".to_string()],
                ..post("B")
            },
        ];
        manager.insert_all(&ctx, &mut posts, Flags::empty()).unwrap();

        assert_eq!(manager.count(&ctx, &doc! {}, 0, 0, false, Flags::NO_TRANSACTION).unwrap(), 2);
        assert_eq!(manager.count(&ctx, &doc! {}, 1, 0, false, Flags::NO_TRANSACTION).unwrap(), 1);
        let err = manager.count(&ctx, &doc! {}, 0, 0, false, Flags::empty()).unwrap_err();
        assert_eq!(err.kind(), &ErrorKind::TransactionRequired);

        let locked = store
            .with_transaction(&ctx, |ctx| manager.count(ctx, &doc! { "title": "A" }, 0, 0, true, Flags::empty()))
            .unwrap();
        assert_eq!(locked, 1);
        assert_eq!(stored_lock(&store, posts[0].id()), 1);

        let tags = manager
            .distinct(&ctx, "tags", &doc! {}, false, Flags::NO_TRANSACTION)
            .unwrap();
        assert_eq!(tags, vec![Value::from("a"), Value::from("b")]);
    }

    #[test]
    fn test_insert_assigns_id_and_validates() {
        let (store, manager, ctx) = setup();
        let mut valid = post("A");
        manager.insert(&ctx, &mut valid, Flags::empty()).unwrap();
        assert!(!valid.id().is_zero());

        let mut empty = post("");
        let err = manager.insert(&ctx, &mut empty, Flags::empty()).unwrap_err();
        assert_eq!(err.kind(), &ErrorKind::ValidationError);

        manager.insert(&ctx, &mut empty, Flags::NO_VALIDATION).unwrap();
        let count = store
            .c::<Post>()
            .count_documents(&ctx, &doc! {}, FindOptions::new())
            .unwrap();
        assert_eq!(count, 2);
    }

    #[test]
    fn test_insert_all_stops_at_first_failure() {
        let (store, manager, ctx) = setup();
        let existing = insert(&manager, &ctx, &["A"]);

        let mut posts = vec![post("B"), existing[0].clone(), post("C")];
        let err = manager.insert_all(&ctx, &mut posts, Flags::empty()).unwrap_err();
        assert!(is_duplicate(&err));

        let count = store
            .c::<Post>()
            .count_documents(&ctx, &doc! {}, FindOptions::new())
            .unwrap();
        assert_eq!(count, 2);
        manager.insert_all::<Post>(&ctx, &mut [], Flags::empty()).unwrap();
    }

    #[test]
    fn test_insert_if_missing() {
        let (store, manager, ctx) = setup();
        let mut first = post("A");
        assert!(manager
            .insert_if_missing(&ctx, &doc! { "title": "A" }, &mut first, false, Flags::empty())
            .unwrap());

        let mut second = post("A");
        assert!(!manager
            .insert_if_missing(&ctx, &doc! { "title": "A" }, &mut second, false, Flags::empty())
            .unwrap());

        let err = manager
            .insert_if_missing(&ctx, &doc! { "title": "A" }, &mut second, true, Flags::empty())
            .unwrap_err();
        assert_eq!(err.kind(), &ErrorKind::TransactionRequired);

        let inserted = store
            .with_transaction(&ctx, |ctx| {
                manager.insert_if_missing(ctx, &doc! { "title": "A" }, &mut second, true, Flags::empty())
            })
            .unwrap();
        assert!(!inserted);
        assert_eq!(stored_lock(&store, first.id()), 1);

        let mut third = post("B");
        let inserted = store
            .with_transaction(&ctx, |ctx| {
                manager.insert_if_missing(ctx, &doc! { "title": "B" }, &mut third, true, Flags::empty())
            })
            .unwrap();
        assert!(inserted);
        assert_eq!(third.base.lock, 1);
        assert_eq!(stored_lock(&store, third.id()), 1);
    }

    #[test]
    fn test_replace() {
        let (store, manager, ctx) = setup();
        let mut posts = insert(&manager, &ctx, &["A"]);

        let err = manager.replace(&ctx, &mut post("B"), false, Flags::empty()).unwrap_err();
        assert_eq!(err.kind(), &ErrorKind::InvalidOperation);

        posts[0].title = "B".to_string();
        assert!(manager.replace(&ctx, &mut posts[0], false, Flags::empty()).unwrap());

        let mut missing = post("C");
        missing.base.id = ID::new();
        assert!(!manager.replace(&ctx, &mut missing, false, Flags::empty()).unwrap());

        let replaced = store
            .with_transaction(&ctx, |ctx| manager.replace(ctx, &mut posts[0], true, Flags::empty()))
            .unwrap();
        assert!(replaced);
        assert_eq!(posts[0].base.lock, REPLACE_LOCK_INCREMENT);
        assert_eq!(stored_lock(&store, posts[0].id()), REPLACE_LOCK_INCREMENT);

        let found: Post = manager.find(&ctx, posts[0].id(), false, Flags::empty()).unwrap().unwrap();
        assert_eq!(found.title, "B");
    }

    #[test]
    fn test_replace_first_keeps_id() {
        let (_store, manager, ctx) = setup();
        let posts = insert(&manager, &ctx, &["A"]);

        let mut replacement = post("B");
        assert!(manager
            .replace_first(&ctx, &doc! { "title": "A" }, &mut replacement, false, Flags::empty())
            .unwrap());
        assert!(!manager
            .replace_first(&ctx, &doc! { "title": "A" }, &mut replacement, false, Flags::empty())
            .unwrap());

        let found: Post = manager.find(&ctx, posts[0].id(), false, Flags::empty()).unwrap().unwrap();
        assert_eq!(found.title, "B");
    }

    #[test]
    fn test_update() {
        let (store, manager, ctx) = setup();
        let posts = insert(&manager, &ctx, &["A"]);
        let id = posts[0].id();

        let updated: Post = manager
            .update(&ctx, id, &doc! { "$set": { "title": "B" } }, false, Flags::empty())
            .unwrap()
            .unwrap();
        assert_eq!(updated.title, "B");

        let missing = manager
            .update::<Post>(&ctx, ID::new(), &doc! { "$set": { "title": "B" } }, false, Flags::empty())
            .unwrap();
        assert!(missing.is_none());

        let locked: Post = store
            .with_transaction(&ctx, |ctx| {
                manager.update(ctx, id, &doc! { "$set": { "title": "C" } }, true, Flags::empty())
            })
            .unwrap()
            .unwrap();
        assert_eq!(locked.base.lock, 1);

        let err = store
            .with_transaction(&ctx, |ctx| {
                manager.update::<Post>(ctx, id, &doc! { "$inc": { "_lk": 5 } }, true, Flags::empty())
            })
            .unwrap_err();
        assert_eq!(err.kind(), &ErrorKind::InvalidOperation);
    }

    #[test]
    fn test_update_first_and_all() {
        let (_store, manager, ctx) = setup();
        insert(&manager, &ctx, &["A", "B", "C"]);

        let updated: Post = manager
            .update_first(&ctx, &doc! {}, &doc! { "$push": { "tags": "x" } }, &["-title"], false, Flags::empty())
            .unwrap()
            .unwrap();
        assert_eq!(updated.title, "C");
        assert_eq!(updated.tags, vec!["x"]);

        let matched = manager
            .update_all(&ctx, &doc! { "title": { "$ne": "C" } }, &doc! { "$set": { "text_body": "x" } }, false)
            .unwrap();
        assert_eq!(matched, 2);

        let err = manager
            .update_all(&ctx, &doc! {}, &doc! { "$set": { "title": "D" } }, true)
            .unwrap_err();
        assert_eq!(err.kind(), &ErrorKind::TransactionRequired);
    }

    #[test]
    fn test_upsert_reports_insert() {
        let (_store, manager, ctx) = setup();

        let (created, inserted): (Post, bool) = manager
            .upsert(&ctx, &doc! { "title": "A" }, &doc! { "$set": { "text_body": "x" } }, &[], false, Flags::empty())
            .unwrap();
        assert!(inserted);
        assert_eq!(created.title, "A");
        assert_eq!(created.text_body, "x");
        assert!(created.base.token.is_some());

        let (updated, inserted): (Post, bool) = manager
            .upsert(&ctx, &doc! { "title": "A" }, &doc! { "$set": { "text_body": "y" } }, &[], false, Flags::empty())
            .unwrap();
        assert!(!inserted);
        assert_eq!(updated.id(), created.id());
        assert_eq!(updated.text_body, "y");
    }

    #[test]
    fn test_delete() {
        let (_store, manager, ctx) = setup();
        let posts = insert(&manager, &ctx, &["A", "B", "C", "D"]);

        assert!(manager.delete(&ctx, posts[0].id()).unwrap());
        assert!(!manager.delete(&ctx, posts[0].id()).unwrap());

        let deleted: Post = manager
            .find_and_delete(&ctx, posts[1].id(), Flags::empty())
            .unwrap()
            .unwrap();
        assert_eq!(deleted.title, "B");
        assert!(manager
            .find_and_delete::<Post>(&ctx, posts[1].id(), Flags::empty())
            .unwrap()
            .is_none());

        let first: Post = manager
            .delete_first(&ctx, &doc! {}, &["-title"], Flags::empty())
            .unwrap()
            .unwrap();
        assert_eq!(first.title, "D");

        assert_eq!(manager.delete_all(&ctx, &doc! {}).unwrap(), 1);
        assert_eq!(manager.delete_all(&ctx, &doc! {}).unwrap(), 0);
    }
}
