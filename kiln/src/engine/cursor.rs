use super::oplog::{encode_token, Poll};
use super::EngineInner;
use crate::context::Context;
use crate::document::Document;
use crate::driver::{ChangeEvent, ChangeStreamOptions, OperationType, RawChangeStream, RawCursor, ResumeToken};
use crate::errors::{ErrorKind, KilnError, KilnResult};
use std::sync::Arc;
use std::vec::IntoIter;

/// A cursor over a materialized result set.
pub(crate) struct MemoryCursor {
    docs: IntoIter<Document>,
    current: Option<Document>,
    closed: bool,
}

impl MemoryCursor {
    pub fn new(docs: Vec<Document>) -> Self {
        MemoryCursor {
            docs: docs.into_iter(),
            current: None,
            closed: false,
        }
    }
}

impl RawCursor for MemoryCursor {
    fn next(&mut self) -> bool {
        if self.closed {
            return false;
        }
        self.current = self.docs.next();
        self.current.is_some()
    }

    fn current(&self) -> Option<&Document> {
        self.current.as_ref()
    }

    fn error(&self) -> Option<KilnError> {
        None
    }

    fn close(&mut self) -> KilnResult<()> {
        self.closed = true;
        self.current = None;
        Ok(())
    }
}

/// A change feed over one namespace of the operation log.
pub(crate) struct MemoryChangeStream {
    engine: Arc<EngineInner>,
    ns: String,
    db: String,
    position: u64,
    token: Option<ResumeToken>,
    lookup: bool,
    ended: bool,
    closed: bool,
}

impl MemoryChangeStream {
    pub fn new(engine: Arc<EngineInner>, ns: &str, db: &str, position: u64, options: ChangeStreamOptions) -> Self {
        MemoryChangeStream {
            engine,
            ns: ns.to_string(),
            db: db.to_string(),
            position,
            token: Some(encode_token(position)),
            lookup: options.full_document_lookup,
            ended: false,
            closed: false,
        }
    }
}

impl RawChangeStream for MemoryChangeStream {
    fn try_next(&mut self, ctx: &Context) -> KilnResult<Option<ChangeEvent>> {
        if self.closed {
            return Err(KilnError::new("change stream has been closed", ErrorKind::InvalidOperation));
        }
        if self.ended {
            return Ok(None);
        }
        ctx.check()?;

        let poll = self.engine.oplog.poll(
            self.position,
            &self.ns,
            &self.db,
            self.engine.config.poll_interval,
        )?;

        let entry = match poll {
            Poll::Entry(entry) => entry,
            Poll::Idle(scanned) => {
                if scanned > self.position {
                    self.position = scanned;
                    self.token = Some(encode_token(scanned));
                }
                return Ok(None);
            }
        };

        self.position = entry.seq;
        self.token = Some(entry.token());
        let change = &entry.change;
        if change.operation == OperationType::Invalidate {
            self.ended = true;
        }

        let full_document = match (&change.operation, &change.full_document, &change.document_key) {
            (_, Some(doc), _) => Some(doc.as_ref().clone()),
            (OperationType::Update, None, Some(id)) if self.lookup => self.engine.lookup(&change.ns, id),
            _ => None,
        };

        Ok(Some(ChangeEvent {
            token: entry.token(),
            operation: change.operation.clone(),
            document_key: change.document_key.clone(),
            full_document,
            update_description: change.update_description.clone(),
        }))
    }

    fn is_ended(&self) -> bool {
        self.ended
    }

    fn resume_token(&self) -> Option<ResumeToken> {
        self.token.clone()
    }

    fn close(&mut self) -> KilnResult<()> {
        self.closed = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::doc;
    use crate::driver::{NativeCollection, UpdateOptions};
    use crate::engine::{EngineConfig, MemoryEngine};
    use std::time::Duration;

    fn engine() -> MemoryEngine {
        MemoryEngine::with_config(EngineConfig::new().with_poll_interval(Duration::from_millis(5)))
    }

    fn lookup() -> ChangeStreamOptions {
        ChangeStreamOptions {
            resume_after: None,
            full_document_lookup: true,
        }
    }

    #[test]
    fn test_cursor_iterates_and_closes() {
        let mut cursor = MemoryCursor::new(vec![doc! { "a": 1 }, doc! { "a": 2 }]);
        assert!(cursor.next());
        assert_eq!(cursor.current().unwrap()["a"], 1);
        cursor.close().unwrap();
        assert!(!cursor.next());
        assert!(cursor.current().is_none());
        assert!(cursor.error().is_none());
    }

    #[test]
    fn test_change_stream_reports_changes() {
        let engine = engine();
        let posts = engine.client().database("db").collection("posts");
        let ctx = Context::background();
        let mut stream = posts.watch(&ctx, lookup()).unwrap();

        posts.insert_one(&ctx, doc! { "_id": 1, "n": 1 }).unwrap();
        posts
            .update_one(&ctx, &doc! { "_id": 1 }, &doc! { "$inc": { "n": 1 } }, UpdateOptions::default())
            .unwrap();
        posts.delete_one(&ctx, &doc! { "_id": 1 }).unwrap();

        let insert = stream.next(&ctx).unwrap().unwrap();
        assert_eq!(insert.operation, OperationType::Insert);
        assert_eq!(insert.full_document.unwrap()["n"], 1);

        let update = stream.next(&ctx).unwrap().unwrap();
        assert_eq!(update.operation, OperationType::Update);
        assert_eq!(update.update_description.unwrap().updated_fields, doc! { "n": 2 });
        assert!(update.full_document.is_none());

        let delete = stream.next(&ctx).unwrap().unwrap();
        assert_eq!(delete.operation, OperationType::Delete);
        assert_eq!(stream.resume_token(), Some(delete.token));
    }

    #[test]
    fn test_change_stream_resumes_after_token() {
        let engine = engine();
        let posts = engine.client().database("db").collection("posts");
        let ctx = Context::background();
        let mut stream = posts.watch(&ctx, lookup()).unwrap();

        posts.insert_one(&ctx, doc! { "_id": 1 }).unwrap();
        posts.insert_one(&ctx, doc! { "_id": 2 }).unwrap();
        let first = stream.next(&ctx).unwrap().unwrap();
        stream.close().unwrap();
        assert!(stream.next(&ctx).is_err());

        let options = ChangeStreamOptions {
            resume_after: Some(first.token),
            full_document_lookup: true,
        };
        let mut resumed = posts.watch(&ctx, options).unwrap();
        let second = resumed.next(&ctx).unwrap().unwrap();
        assert_eq!(second.document_key, Some(crate::document::Value::from(2)));
    }

    #[test]
    fn test_fresh_change_stream_reports_start_position() {
        let engine = engine();
        let posts = engine.client().database("db").collection("posts");
        let ctx = Context::background();
        posts.insert_one(&ctx, doc! { "_id": 1 }).unwrap();
        let stream = posts.watch(&ctx, lookup()).unwrap();
        let start = stream.resume_token().unwrap();
        posts.insert_one(&ctx, doc! { "_id": 2 }).unwrap();

        let options = ChangeStreamOptions {
            resume_after: Some(start),
            full_document_lookup: true,
        };
        let mut resumed = posts.watch(&ctx, options).unwrap();
        let change = resumed.next(&ctx).unwrap().unwrap();
        assert_eq!(change.document_key, Some(crate::document::Value::from(2)));
    }

    #[test]
    fn test_change_stream_token_follows_scanned_position() {
        let engine = MemoryEngine::with_config(
            EngineConfig::new()
                .with_oplog_capacity(3)
                .with_poll_interval(Duration::from_millis(5)),
        );
        let db = engine.client().database("db");
        let posts = db.collection("posts");
        let users = db.collection("users");
        let ctx = Context::background();

        posts.insert_one(&ctx, doc! { "_id": 1 }).unwrap();
        let mut stream = posts.watch(&ctx, lookup()).unwrap();
        let start = stream.resume_token().unwrap();

        for id in 0..2 {
            users.insert_one(&ctx, doc! { "_id": id }).unwrap();
        }
        assert!(stream.try_next(&ctx).unwrap().is_none());
        assert!(!stream.is_ended());
        for id in 2..5 {
            users.insert_one(&ctx, doc! { "_id": id }).unwrap();
        }
        assert!(stream.try_next(&ctx).unwrap().is_none());
        let scanned = stream.resume_token().unwrap();
        assert_ne!(scanned, start);

        posts.insert_one(&ctx, doc! { "_id": 2 }).unwrap();
        let options = ChangeStreamOptions {
            resume_after: Some(scanned),
            full_document_lookup: true,
        };
        let mut resumed = posts.watch(&ctx, options).unwrap();
        let change = resumed.next(&ctx).unwrap().unwrap();
        assert_eq!(change.document_key, Some(crate::document::Value::from(2)));

        let stale = ChangeStreamOptions {
            resume_after: Some(start),
            full_document_lookup: true,
        };
        let err = posts.watch(&ctx, stale).err().unwrap();
        assert_eq!(err.kind(), &ErrorKind::HistoryLost);
    }

    #[test]
    fn test_change_stream_ends_after_invalidate() {
        let engine = engine();
        let posts = engine.client().database("db").collection("posts");
        let ctx = Context::background();
        posts.insert_one(&ctx, doc! { "_id": 1 }).unwrap();
        let mut stream = posts.watch(&ctx, lookup()).unwrap();

        posts.drop_collection(&ctx).unwrap();
        assert_eq!(stream.next(&ctx).unwrap().unwrap().operation, OperationType::Drop);
        assert_eq!(stream.next(&ctx).unwrap().unwrap().operation, OperationType::Invalidate);
        assert!(stream.next(&ctx).unwrap().is_none());
    }

    #[test]
    fn test_change_stream_honors_context() {
        let engine = engine();
        let posts = engine.client().database("db").collection("posts");
        let mut stream = posts.watch(&Context::background(), lookup()).unwrap();

        let ctx = Context::background().with_timeout(Duration::from_millis(20));
        let err = stream.next(&ctx).unwrap_err();
        assert_eq!(err.kind(), &ErrorKind::DeadlineExceeded);
    }

    #[test]
    fn test_change_stream_fails_when_history_is_lost() {
        let engine = MemoryEngine::with_config(EngineConfig::new().with_oplog_capacity(1));
        let posts = engine.client().database("db").collection("posts");
        let ctx = Context::background();
        let mut stream = posts.watch(&ctx, lookup()).unwrap();
        posts.insert_one(&ctx, doc! { "_id": 1 }).unwrap();
        posts.insert_one(&ctx, doc! { "_id": 2 }).unwrap();

        let err = stream.next(&ctx).unwrap_err();
        assert_eq!(err.kind(), &ErrorKind::HistoryLost);
    }
}
