use crate::document::{Document, Value};
use crate::driver::change::ResumeToken;

/// Sort direction of a single sort key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Ascending,
    Descending,
    /// Orders by descending text score.
    TextScore,
}

/// A single key of a sort specification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortKey {
    pub field: String,
    pub order: SortOrder,
}

impl SortKey {
    pub fn asc(field: &str) -> Self {
        SortKey {
            field: field.to_string(),
            order: SortOrder::Ascending,
        }
    }

    pub fn desc(field: &str) -> Self {
        SortKey {
            field: field.to_string(),
            order: SortOrder::Descending,
        }
    }

    pub fn text_score(field: &str) -> Self {
        SortKey {
            field: field.to_string(),
            order: SortOrder::TextScore,
        }
    }
}

/// An ordered sort specification. Earlier keys take precedence.
pub type Sort = Vec<SortKey>;

/// Options of find, count and find-and-delete calls.
///
/// A zero `limit` means no limit.
///
/// # Examples
///
/// ```rust
/// use kiln::driver::{FindOptions, SortKey};
///
/// let options = FindOptions::new()
///     .sort(vec![SortKey::desc("created")])
///     .skip(10)
///     .limit(5);
/// assert_eq!(options.skip, 10);
/// ```
#[derive(Debug, Clone, Default)]
pub struct FindOptions {
    pub sort: Sort,
    pub skip: u64,
    pub limit: u64,
    pub projection: Option<Document>,
}

impl FindOptions {
    pub fn new() -> Self {
        FindOptions::default()
    }

    pub fn sort(mut self, sort: Sort) -> Self {
        self.sort = sort;
        self
    }

    pub fn skip(mut self, skip: u64) -> Self {
        self.skip = skip;
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = limit;
        self
    }

    pub fn projection(mut self, projection: Document) -> Self {
        self.projection = Some(projection);
        self
    }
}

/// Which version of a document a find-and-modify call returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReturnDocument {
    #[default]
    Before,
    After,
}

/// Options of find-and-update calls.
#[derive(Debug, Clone, Default)]
pub struct FindOneAndUpdateOptions {
    pub sort: Sort,
    pub upsert: bool,
    pub return_document: ReturnDocument,
}

impl FindOneAndUpdateOptions {
    pub fn new() -> Self {
        FindOneAndUpdateOptions::default()
    }

    pub fn sort(mut self, sort: Sort) -> Self {
        self.sort = sort;
        self
    }

    pub fn upsert(mut self, upsert: bool) -> Self {
        self.upsert = upsert;
        self
    }

    pub fn return_after(mut self) -> Self {
        self.return_document = ReturnDocument::After;
        self
    }
}

/// Options of update and replace calls.
#[derive(Debug, Clone, Copy, Default)]
pub struct UpdateOptions {
    pub upsert: bool,
}

impl UpdateOptions {
    pub fn upsert() -> Self {
        UpdateOptions { upsert: true }
    }
}

/// Options of bulk inserts. Ordered inserts stop at the first failure.
#[derive(Debug, Clone, Copy)]
pub struct InsertManyOptions {
    pub ordered: bool,
}

impl Default for InsertManyOptions {
    fn default() -> Self {
        InsertManyOptions { ordered: true }
    }
}

/// Options of a started session.
#[derive(Debug, Clone, Copy, Default)]
pub struct SessionOptions {
    pub causal_consistency: bool,
    /// Transactions read from a single point in time snapshot.
    pub snapshot: bool,
}

/// Options of a change stream.
#[derive(Debug, Clone, Default)]
pub struct ChangeStreamOptions {
    /// Resume after the change identified by the token.
    pub resume_after: Option<ResumeToken>,
    /// Look up the current document for update changes.
    pub full_document_lookup: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InsertOneResult {
    pub inserted_id: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InsertManyResult {
    pub inserted_ids: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct UpdateResult {
    pub matched_count: u64,
    pub modified_count: u64,
    pub upserted_id: Option<Value>,
}

impl UpdateResult {
    pub fn upserted_count(&self) -> u64 {
        if self.upserted_id.is_some() {
            1
        } else {
            0
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct DeleteResult {
    pub deleted_count: u64,
}
