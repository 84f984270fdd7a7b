use crate::document::{from_document, get_path, Document, Value};
use crate::driver::RawCursor;
use crate::errors::{meta_mismatch, ErrorKind, KilnError, KilnResult};
use crate::id::ID;
use crate::model::{Meta, Model, ID_FIELD};
use std::fmt::{Debug, Formatter};
use std::marker::PhantomData;

pub(crate) fn validate_model<M: Model>(model: &M) -> KilnResult<()> {
    model.validate().map_err(|err| {
        KilnError::new_with_cause(
            &format!("{} failed validation", M::meta().name()),
            ErrorKind::ValidationError,
            err.into(),
        )
    })
}

/// Decodes a document into a model, validating it if requested.
pub(crate) fn decode_model<M: Model>(doc: Document, validate: bool) -> KilnResult<M> {
    let model: M = from_document(doc)?;
    if validate {
        validate_model(&model)?;
    }
    Ok(model)
}

/// An iterator over the documents of a find call that decodes them into the
/// managed model.
///
/// # Purpose
/// Guarantees that every decoded document belongs to the model the iterator
/// was created for and, unless validation was disabled, passed its
/// validation hook.
///
/// # Usage
/// `next` returns false both when the cursor is exhausted and when it
/// failed, so `error` must be checked once the loop ends:
///
/// ```rust,ignore
/// let mut iter = store.m::<Post>().find_each(&ctx, &doc! {}, &[], 0, 0, false, Flags::empty())?;
/// while iter.next() {
///     let post: Post = iter.decode()?;
/// }
/// if let Some(err) = iter.error() {
///     return Err(err);
/// }
/// iter.close()?;
/// ```
///
/// The cursor is closed when the iterator is dropped; `close` reports the
/// close error instead of logging it.
pub struct ManagedIterator {
    meta: &'static Meta,
    cursor: Box<dyn RawCursor>,
    validate: bool,
    closed: bool,
}

impl ManagedIterator {
    pub(crate) fn new(meta: &'static Meta, cursor: Box<dyn RawCursor>, validate: bool) -> Self {
        ManagedIterator {
            meta,
            cursor,
            validate,
            closed: false,
        }
    }

    /// Loads the next document. Returns false once the cursor is exhausted
    /// or failed.
    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> bool {
        if self.closed {
            return false;
        }
        self.cursor.next()
    }

    /// Decodes the loaded document into the specified model.
    pub fn decode<M: Model>(&self) -> KilnResult<M> {
        if M::meta() != self.meta {
            return Err(meta_mismatch());
        }

        let doc = match self.cursor.current() {
            Some(doc) if !self.closed => doc.clone(),
            _ => {
                return Err(KilnError::new(
                    "no document has been loaded",
                    ErrorKind::InvalidOperation,
                ))
            }
        };
        decode_model(doc, self.validate)
    }

    /// Returns the error that ended the iteration, if any.
    pub fn error(&self) -> Option<KilnError> {
        self.cursor.error()
    }

    /// Closes the underlying cursor. Closing twice is a no-op.
    pub fn close(&mut self) -> KilnResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.cursor.close()
    }

    /// Adapts the iterator into a standard iterator of decoded models. A
    /// cursor error is yielded as the last item.
    pub fn models<M: Model>(self) -> Models<M> {
        Models {
            iter: self,
            done: false,
            _marker: PhantomData,
        }
    }
}

impl Drop for ManagedIterator {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            log::warn!("Failed to close iterator for {}: {}", self.meta.name(), err);
        }
    }
}

impl Debug for ManagedIterator {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagedIterator")
            .field("model", &self.meta.name())
            .field("validate", &self.validate)
            .field("closed", &self.closed)
            .finish()
    }
}

/// A standard iterator over the models of a [`ManagedIterator`].
pub struct Models<M: Model> {
    iter: ManagedIterator,
    done: bool,
    _marker: PhantomData<M>,
}

impl<M: Model> Models<M> {
    pub fn close(&mut self) -> KilnResult<()> {
        self.done = true;
        self.iter.close()
    }
}

impl<M: Model> Iterator for Models<M> {
    type Item = KilnResult<M>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        if self.iter.next() {
            let item = self.iter.decode::<M>();
            if item.is_err() {
                self.done = true;
            }
            return Some(item);
        }

        self.done = true;
        self.iter.error().map(Err)
    }
}

/// An iterator over the id and the value of one field of every document of
/// a find call.
///
/// Missing fields are yielded as `Value::Null`. Iteration stops at the first
/// error; dropping the iterator early closes the cursor.
pub struct ProjectionIterator {
    field: String,
    cursor: Box<dyn RawCursor>,
    done: bool,
    closed: bool,
}

impl ProjectionIterator {
    pub(crate) fn new(field: String, cursor: Box<dyn RawCursor>) -> Self {
        ProjectionIterator {
            field,
            cursor,
            done: false,
            closed: false,
        }
    }

    /// The stored name of the projected field.
    pub fn field(&self) -> &str {
        &self.field
    }

    pub fn close(&mut self) -> KilnResult<()> {
        self.done = true;
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.cursor.close()
    }

    fn pair(&self, doc: &Document) -> KilnResult<(ID, Value)> {
        let id = match doc.get(ID_FIELD) {
            Some(id) => serde_json::from_value::<ID>(id.clone())?,
            None => {
                return Err(KilnError::new(
                    "projected document is missing its id",
                    ErrorKind::EncodingError,
                ))
            }
        };
        let value = get_path(doc, &self.field).cloned().unwrap_or(Value::Null);
        Ok((id, value))
    }
}

impl Debug for ProjectionIterator {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProjectionIterator")
            .field("field", &self.field)
            .field("closed", &self.closed)
            .finish()
    }
}

impl Iterator for ProjectionIterator {
    type Item = KilnResult<(ID, Value)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        if self.cursor.next() {
            let item = match self.cursor.current() {
                Some(doc) => self.pair(doc),
                None => Err(KilnError::new("cursor returned no document", ErrorKind::InternalError)),
            };
            if item.is_err() {
                self.done = true;
            }
            return Some(item);
        }

        self.done = true;
        self.cursor.error().map(Err)
    }
}

impl Drop for ProjectionIterator {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            log::warn!("Failed to close projection of {}: {}", self.field, err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::doc;
    use crate::model::{Base, Validate};
    use crate::Model;
    use serde::{Deserialize, Serialize};

    #[derive(Model, Serialize, Deserialize, Default, Debug, Clone)]
    #[model(collection = "notes")]
    struct Note {
        #[serde(flatten)]
        base: Base,
        text: String,
    }

    impl Validate for Note {
        fn validate(&self) -> anyhow::Result<()> {
            if self.text.is_empty() {
                anyhow::bail!("missing text");
            }
            Ok(())
        }
    }

    #[derive(Model, Serialize, Deserialize, Default, Debug)]
    #[model(collection = "others")]
    struct Other {
        #[serde(flatten)]
        base: Base,
    }

    impl Validate for Other {}

    /// A cursor that fails after yielding its documents.
    struct FailingCursor {
        docs: Vec<Document>,
        current: Option<Document>,
        closes: usize,
    }

    impl RawCursor for FailingCursor {
        fn next(&mut self) -> bool {
            self.current = if self.docs.is_empty() { None } else { Some(self.docs.remove(0)) };
            self.current.is_some()
        }

        fn current(&self) -> Option<&Document> {
            self.current.as_ref()
        }

        fn error(&self) -> Option<KilnError> {
            Some(KilnError::new("cursor failed", ErrorKind::ConnectionError))
        }

        fn close(&mut self) -> KilnResult<()> {
            self.closes += 1;
            Ok(())
        }
    }

    fn note(text: &str) -> Document {
        doc! { "_id": ID::new().to_hex(), "_lk": 0, "text": text }
    }

    fn iterator(docs: Vec<Document>, validate: bool) -> ManagedIterator {
        let cursor = crate::engine::cursor_of(docs);
        ManagedIterator::new(Note::meta(), cursor, validate)
    }

    #[test]
    fn test_decodes_and_validates() {
        let mut iter = iterator(vec![note("a"), note("")], true);
        assert!(iter.next());
        assert_eq!(iter.decode::<Note>().unwrap().text, "a");
        assert!(iter.next());
        let err = iter.decode::<Note>().unwrap_err();
        assert_eq!(err.kind(), &ErrorKind::ValidationError);
        assert!(!iter.next());
        assert!(iter.error().is_none());
        iter.close().unwrap();
        iter.close().unwrap();
    }

    #[test]
    fn test_skips_validation_when_disabled() {
        let mut iter = iterator(vec![note("")], false);
        assert!(iter.next());
        assert_eq!(iter.decode::<Note>().unwrap().text, "");
    }

    #[test]
    fn test_rejects_other_models() {
        let mut iter = iterator(vec![note("a")], true);
        assert!(iter.next());
        let err = iter.decode::<Other>().unwrap_err();
        assert_eq!(err.kind(), &ErrorKind::MetaMismatch);
    }

    #[test]
    fn test_decode_without_document_fails() {
        let iter = iterator(vec![note("a")], true);
        let err = iter.decode::<Note>().unwrap_err();
        assert_eq!(err.kind(), &ErrorKind::InvalidOperation);
    }

    #[test]
    fn test_models_yields_cursor_error_last() {
        let cursor = FailingCursor {
            docs: vec![note("a")],
            current: None,
            closes: 0,
        };
        let iter = ManagedIterator::new(Note::meta(), Box::new(cursor), true);
        let items: Vec<KilnResult<Note>> = iter.models::<Note>().collect();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].as_ref().unwrap().text, "a");
        assert_eq!(items[1].as_ref().unwrap_err().kind(), &ErrorKind::ConnectionError);
    }

    #[test]
    fn test_projection_yields_pairs() {
        let id = ID::new();
        let docs = vec![
            doc! { "_id": id.to_hex(), "meta": { "views": 3 } },
            doc! { "_id": ID::new().to_hex() },
        ];
        let mut iter = ProjectionIterator::new("meta.views".to_string(), crate::engine::cursor_of(docs));
        assert_eq!(iter.next().unwrap().unwrap(), (id, Value::from(3)));
        assert_eq!(iter.next().unwrap().unwrap().1, Value::Null);
        assert!(iter.next().is_none());
        iter.close().unwrap();
    }

    #[test]
    fn test_projection_fails_without_id() {
        let mut iter = ProjectionIterator::new("text".to_string(), crate::engine::cursor_of(vec![doc! { "text": "a" }]));
        assert_eq!(iter.next().unwrap().unwrap_err().kind(), &ErrorKind::EncodingError);
        assert!(iter.next().is_none());
    }
}
