use crate::document::{Document, Value};
use std::fmt::{Debug, Formatter};

/// An opaque position in a change feed.
///
/// Tokens are produced by the driver and handed back to it unchanged to
/// resume a feed after the change they identify. Callers may persist the raw
/// bytes and restore them with [`ResumeToken::from_bytes`].
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct ResumeToken {
    bytes: Vec<u8>,
}

impl ResumeToken {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        ResumeToken { bytes }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}

impl Debug for ResumeToken {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "ResumeToken(")?;
        for byte in &self.bytes {
            write!(f, "{:02x}", byte)?;
        }
        write!(f, ")")
    }
}

/// The operation a change describes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationType {
    Insert,
    Update,
    Replace,
    Delete,
    Drop,
    Rename,
    DropDatabase,
    Invalidate,
}

impl OperationType {
    pub fn name(&self) -> &'static str {
        match self {
            OperationType::Insert => "insert",
            OperationType::Update => "update",
            OperationType::Replace => "replace",
            OperationType::Delete => "delete",
            OperationType::Drop => "drop",
            OperationType::Rename => "rename",
            OperationType::DropDatabase => "dropDatabase",
            OperationType::Invalidate => "invalidate",
        }
    }
}

/// The top level fields an update changed or removed.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct UpdateDescription {
    pub updated_fields: Document,
    pub removed_fields: Vec<String>,
}

/// A single raw change read from a change feed.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    pub token: ResumeToken,
    pub operation: OperationType,
    /// The `_id` of the changed document, if the change concerns a document.
    pub document_key: Option<Value>,
    /// The inserted or replaced document, or the looked up current document
    /// of an update. Missing if the document has been deleted since.
    pub full_document: Option<Document>,
    pub update_description: Option<UpdateDescription>,
}
