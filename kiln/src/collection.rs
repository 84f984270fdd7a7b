use crate::context::Context;
use crate::document::{from_document, Document, Value};
use crate::driver::{
    ChangeStreamOptions, DeleteResult, FindOneAndUpdateOptions, FindOptions, InsertManyOptions,
    InsertManyResult, InsertOneResult, NativeCollection, RawChangeStream, RawCursor, UpdateOptions,
    UpdateResult,
};
use crate::errors::{ErrorKind, KilnError, KilnResult};
use serde::de::DeserializeOwned;
use std::fmt::{Debug, Formatter};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// The result of a single document operation.
///
/// Decoding an empty result fails with `NoDocuments`, which callers detect
/// with [`is_missing`](crate::errors::is_missing).
#[derive(Debug, Clone, PartialEq)]
pub struct SingleResult {
    document: Option<Document>,
}

impl SingleResult {
    pub(crate) fn new(document: Option<Document>) -> Self {
        SingleResult { document }
    }

    pub fn document(&self) -> Option<&Document> {
        self.document.as_ref()
    }

    pub fn into_document(self) -> Option<Document> {
        self.document
    }

    pub fn decode<T: DeserializeOwned>(self) -> KilnResult<T> {
        match self.document {
            Some(doc) => from_document(doc),
            None => Err(KilnError::new("no documents in result", ErrorKind::NoDocuments)),
        }
    }
}

/// A thin wrapper around a driver collection.
///
/// # Purpose
/// Exposes the raw collection operations of a model's collection. Every call
/// is logged with the collection name and fails once the owning store has
/// been closed.
///
/// # Characteristics
/// - **Unchecked**: filters and updates are passed to the driver as they are;
///   use the [`Manager`](crate::manager::Manager) for checked operations
/// - **Cheap handles**: clones share the same driver collection
#[derive(Clone)]
pub struct Collection {
    inner: Arc<CollectionInner>,
}

struct CollectionInner {
    native: Arc<dyn NativeCollection>,
    closed: Arc<AtomicBool>,
}

impl Collection {
    pub(crate) fn new(native: Arc<dyn NativeCollection>, closed: Arc<AtomicBool>) -> Self {
        Collection {
            inner: Arc::new(CollectionInner { native, closed }),
        }
    }

    /// Returns the wrapped driver collection.
    pub fn native(&self) -> &Arc<dyn NativeCollection> {
        &self.inner.native
    }

    pub fn name(&self) -> &str {
        self.inner.native.name()
    }

    fn enter(&self, operation: &str) -> KilnResult<()> {
        log::debug!("Collection.{} on {}", operation, self.name());
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(KilnError::new("store has been closed", ErrorKind::StoreAlreadyClosed));
        }
        Ok(())
    }

    pub fn find(&self, ctx: &Context, filter: &Document, options: FindOptions) -> KilnResult<Box<dyn RawCursor>> {
        self.enter("find")?;
        self.inner.native.find(ctx, filter, options)
    }

    /// Finds and decodes all matching documents.
    pub fn find_all<T: DeserializeOwned>(
        &self,
        ctx: &Context,
        filter: &Document,
        options: FindOptions,
    ) -> KilnResult<Vec<T>> {
        let mut cursor = self.find(ctx, filter, options)?;
        let mut out = Vec::new();
        while cursor.next() {
            if let Some(doc) = cursor.current() {
                out.push(from_document(doc.clone())?);
            }
        }
        let error = cursor.error();
        cursor.close()?;
        match error {
            Some(err) => Err(err),
            None => Ok(out),
        }
    }

    pub fn find_one(&self, ctx: &Context, filter: &Document, options: FindOptions) -> KilnResult<SingleResult> {
        self.enter("find_one")?;
        Ok(SingleResult::new(self.inner.native.find_one(ctx, filter, options)?))
    }

    pub fn find_one_and_update(
        &self,
        ctx: &Context,
        filter: &Document,
        update: &Document,
        options: FindOneAndUpdateOptions,
    ) -> KilnResult<SingleResult> {
        self.enter("find_one_and_update")?;
        let doc = self.inner.native.find_one_and_update(ctx, filter, update, options)?;
        Ok(SingleResult::new(doc))
    }

    pub fn find_one_and_delete(&self, ctx: &Context, filter: &Document, options: FindOptions) -> KilnResult<SingleResult> {
        self.enter("find_one_and_delete")?;
        let doc = self.inner.native.find_one_and_delete(ctx, filter, options)?;
        Ok(SingleResult::new(doc))
    }

    pub fn insert_one(&self, ctx: &Context, document: Document) -> KilnResult<InsertOneResult> {
        self.enter("insert_one")?;
        self.inner.native.insert_one(ctx, document)
    }

    pub fn insert_many(
        &self,
        ctx: &Context,
        documents: Vec<Document>,
        options: InsertManyOptions,
    ) -> KilnResult<InsertManyResult> {
        self.enter("insert_many")?;
        self.inner.native.insert_many(ctx, documents, options)
    }

    pub fn replace_one(
        &self,
        ctx: &Context,
        filter: &Document,
        replacement: Document,
        options: UpdateOptions,
    ) -> KilnResult<UpdateResult> {
        self.enter("replace_one")?;
        self.inner.native.replace_one(ctx, filter, replacement, options)
    }

    pub fn update_one(
        &self,
        ctx: &Context,
        filter: &Document,
        update: &Document,
        options: UpdateOptions,
    ) -> KilnResult<UpdateResult> {
        self.enter("update_one")?;
        self.inner.native.update_one(ctx, filter, update, options)
    }

    pub fn update_many(
        &self,
        ctx: &Context,
        filter: &Document,
        update: &Document,
        options: UpdateOptions,
    ) -> KilnResult<UpdateResult> {
        self.enter("update_many")?;
        self.inner.native.update_many(ctx, filter, update, options)
    }

    pub fn delete_one(&self, ctx: &Context, filter: &Document) -> KilnResult<DeleteResult> {
        self.enter("delete_one")?;
        self.inner.native.delete_one(ctx, filter)
    }

    pub fn delete_many(&self, ctx: &Context, filter: &Document) -> KilnResult<DeleteResult> {
        self.enter("delete_many")?;
        self.inner.native.delete_many(ctx, filter)
    }

    pub fn count_documents(&self, ctx: &Context, filter: &Document, options: FindOptions) -> KilnResult<u64> {
        self.enter("count_documents")?;
        self.inner.native.count_documents(ctx, filter, options)
    }

    pub fn distinct(&self, ctx: &Context, field: &str, filter: &Document) -> KilnResult<Vec<Value>> {
        self.enter("distinct")?;
        self.inner.native.distinct(ctx, field, filter)
    }

    pub fn watch(&self, ctx: &Context, options: ChangeStreamOptions) -> KilnResult<Box<dyn RawChangeStream>> {
        self.enter("watch")?;
        self.inner.native.watch(ctx, options)
    }

    pub fn create_unique_index(&self, ctx: &Context, fields: &[&str]) -> KilnResult<()> {
        self.enter("create_unique_index")?;
        self.inner.native.create_unique_index(ctx, fields)
    }

    pub fn drop_collection(&self, ctx: &Context) -> KilnResult<()> {
        self.enter("drop_collection")?;
        self.inner.native.drop_collection(ctx)
    }

    pub fn rename(&self, ctx: &Context, to: &str) -> KilnResult<()> {
        self.enter("rename")?;
        self.inner.native.rename(ctx, to)
    }
}

impl Debug for Collection {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collection").field("name", &self.name()).finish()
    }
}
