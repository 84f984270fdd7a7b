//! The seam between kiln and a document database driver.
//!
//! The store, the manager and the change stream only talk to the database
//! through these traits. The crate ships one implementation, the in-memory
//! [`MemoryEngine`](crate::engine::MemoryEngine); other drivers plug in through
//! [`Store::new`](crate::store::Store::new).
//!
//! Every call takes a [`Context`]. Calls made with a context that carries a
//! transaction run inside the transaction of the context's session.

mod change;
mod options;

pub use change::*;
pub use options::*;

use crate::context::Context;
use crate::document::{Document, Value};
use crate::errors::{KilnError, KilnResult};
use std::any::Any;
use std::sync::Arc;

/// A connected database client.
pub trait Client: Send + Sync {
    /// Returns a handle to the named database.
    fn database(&self, name: &str) -> Arc<dyn Database>;

    /// Starts a new session.
    fn start_session(&self, ctx: &Context, options: SessionOptions) -> KilnResult<Arc<dyn Session>>;

    fn ping(&self, ctx: &Context) -> KilnResult<()>;

    /// Disconnects the client. Later calls fail.
    fn disconnect(&self, ctx: &Context) -> KilnResult<()>;
}

/// A database handle.
pub trait Database: Send + Sync {
    fn name(&self) -> &str;

    /// Returns a handle to the named collection. Collections are created
    /// implicitly by the first write.
    fn collection(&self, name: &str) -> Arc<dyn NativeCollection>;

    fn list_collection_names(&self, ctx: &Context) -> KilnResult<Vec<String>>;

    /// Drops the database with all of its collections.
    fn drop_database(&self, ctx: &Context) -> KilnResult<()>;
}

/// A collection handle exposing the native operations.
///
/// Single document reads return `Ok(None)` when nothing matched.
pub trait NativeCollection: Send + Sync {
    fn name(&self) -> &str;

    fn find(&self, ctx: &Context, filter: &Document, options: FindOptions) -> KilnResult<Box<dyn RawCursor>>;

    fn find_one(&self, ctx: &Context, filter: &Document, options: FindOptions) -> KilnResult<Option<Document>>;

    fn find_one_and_update(
        &self,
        ctx: &Context,
        filter: &Document,
        update: &Document,
        options: FindOneAndUpdateOptions,
    ) -> KilnResult<Option<Document>>;

    fn find_one_and_delete(&self, ctx: &Context, filter: &Document, options: FindOptions) -> KilnResult<Option<Document>>;

    fn insert_one(&self, ctx: &Context, document: Document) -> KilnResult<InsertOneResult>;

    fn insert_many(
        &self,
        ctx: &Context,
        documents: Vec<Document>,
        options: InsertManyOptions,
    ) -> KilnResult<InsertManyResult>;

    fn replace_one(
        &self,
        ctx: &Context,
        filter: &Document,
        replacement: Document,
        options: UpdateOptions,
    ) -> KilnResult<UpdateResult>;

    fn update_one(
        &self,
        ctx: &Context,
        filter: &Document,
        update: &Document,
        options: UpdateOptions,
    ) -> KilnResult<UpdateResult>;

    fn update_many(
        &self,
        ctx: &Context,
        filter: &Document,
        update: &Document,
        options: UpdateOptions,
    ) -> KilnResult<UpdateResult>;

    fn delete_one(&self, ctx: &Context, filter: &Document) -> KilnResult<DeleteResult>;

    fn delete_many(&self, ctx: &Context, filter: &Document) -> KilnResult<DeleteResult>;

    fn count_documents(&self, ctx: &Context, filter: &Document, options: FindOptions) -> KilnResult<u64>;

    fn distinct(&self, ctx: &Context, field: &str, filter: &Document) -> KilnResult<Vec<Value>>;

    /// Opens a change feed for the collection.
    fn watch(&self, ctx: &Context, options: ChangeStreamOptions) -> KilnResult<Box<dyn RawChangeStream>>;

    /// Creates a unique index over the specified fields.
    fn create_unique_index(&self, ctx: &Context, fields: &[&str]) -> KilnResult<()>;

    fn drop_collection(&self, ctx: &Context) -> KilnResult<()>;

    /// Renames the collection within its database.
    fn rename(&self, ctx: &Context, to: &str) -> KilnResult<()>;
}

/// A driver session that runs transactions.
pub trait Session: Send + Sync {
    fn id(&self) -> &str;

    fn start_transaction(&self) -> KilnResult<()>;

    fn commit_transaction(&self, ctx: &Context) -> KilnResult<()>;

    fn abort_transaction(&self, ctx: &Context) -> KilnResult<()>;

    fn in_transaction(&self) -> bool;

    /// Ends the session, aborting a running transaction.
    fn end(&self);

    fn as_any(&self) -> &dyn Any;
}

/// A cursor over the results of a find call.
///
/// `next` returns false once the cursor is exhausted or failed; `error`
/// tells the two apart.
pub trait RawCursor: Send {
    fn next(&mut self) -> bool;

    /// The document loaded by the last successful `next`.
    fn current(&self) -> Option<&Document>;

    fn error(&self) -> Option<KilnError>;

    fn close(&mut self) -> KilnResult<()>;
}

/// A tailable change feed.
pub trait RawChangeStream: Send {
    /// Blocks until the next change is available. Returns `Ok(None)` once the
    /// feed has ended, and an error when the context is done or the feed
    /// failed.
    fn next(&mut self, ctx: &Context) -> KilnResult<Option<ChangeEvent>> {
        loop {
            if let Some(change) = self.try_next(ctx)? {
                return Ok(Some(change));
            }
            if self.is_ended() {
                return Ok(None);
            }
        }
    }

    /// Waits a short, driver defined time for the next change. Returns
    /// `Ok(None)` if no change arrived in time or the feed has ended.
    fn try_next(&mut self, ctx: &Context) -> KilnResult<Option<ChangeEvent>>;

    fn is_ended(&self) -> bool;

    /// The position the feed has read up to. This is the token of the last
    /// returned change, unless the feed has since scanned past changes it
    /// does not report. A fresh feed reports its start position.
    fn resume_token(&self) -> Option<ResumeToken>;

    fn close(&mut self) -> KilnResult<()>;
}
