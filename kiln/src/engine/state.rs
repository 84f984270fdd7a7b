use crate::document::{get_path, Document, Value};
use crate::errors::{ErrorKind, KilnError, KilnResult};
use crate::model::ID_FIELD;
use std::sync::Arc;

/// The key a document is stored under: the canonical JSON of its `_id`.
pub(crate) type DocKey = String;

/// A `(namespace, key)` pair identifying one document across the engine.
pub(crate) type Slot = (String, DocKey);

/// Returns the storage key of a document `_id`.
pub(crate) fn doc_key(id: &Value) -> DocKey {
    id.to_string()
}

/// Returns the storage key of a document, failing if it has no `_id`.
pub(crate) fn key_of(doc: &Document) -> KilnResult<DocKey> {
    match doc.get(ID_FIELD) {
        Some(id) => Ok(doc_key(id)),
        None => Err(KilnError::new(
            "document is missing an _id",
            ErrorKind::InternalError,
        )),
    }
}

/// A committed version of a document.
#[derive(Clone, Debug)]
pub(crate) struct Record {
    pub doc: Arc<Document>,
    pub version: u64,
}

/// A unique constraint over one or more fields.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct UniqueIndex {
    pub fields: Vec<String>,
}

impl UniqueIndex {
    /// Returns the indexed values of a document. Documents missing all indexed
    /// fields are not constrained.
    fn values(&self, doc: &Document) -> Option<Vec<Value>> {
        let values: Vec<Value> = self
            .fields
            .iter()
            .map(|field| get_path(doc, field).cloned().unwrap_or(Value::Null))
            .collect();
        if values.iter().all(|value| value.is_null()) {
            None
        } else {
            Some(values)
        }
    }
}

/// The documents and indexes of one collection.
#[derive(Clone, Debug, Default)]
pub(crate) struct Namespace {
    pub documents: im::OrdMap<DocKey, Record>,
    pub indexes: im::Vector<UniqueIndex>,
}

impl Namespace {
    pub fn get(&self, key: &str) -> Option<&Record> {
        self.documents.get(key)
    }

    /// Returns the documents in storage order.
    pub fn iter(&self) -> impl Iterator<Item = (&DocKey, &Record)> {
        self.documents.iter()
    }

    /// Checks the unique indexes for a document about to be stored under the
    /// key.
    pub fn check_unique(&self, key: &str, doc: &Document) -> KilnResult<()> {
        for index in self.indexes.iter() {
            let values = match index.values(doc) {
                Some(values) => values,
                None => continue,
            };

            let duplicate = self.documents.iter().any(|(other_key, record)| {
                other_key != key && index.values(&record.doc).as_ref() == Some(&values)
            });
            if duplicate {
                return Err(KilnError::new(
                    &format!("duplicate key error on index {:?}", index.fields),
                    ErrorKind::DuplicateKey,
                ));
            }
        }
        Ok(())
    }
}

/// A point in time view of all collections.
///
/// Snapshots are persistent maps; cloning one is cheap and never copies
/// documents.
#[derive(Clone, Debug, Default)]
pub(crate) struct Snapshot {
    pub namespaces: im::HashMap<String, Namespace>,
}

impl Snapshot {
    pub fn namespace(&self, ns: &str) -> Option<&Namespace> {
        self.namespaces.get(ns)
    }

    pub fn record(&self, ns: &str, key: &str) -> Option<&Record> {
        self.namespaces.get(ns).and_then(|namespace| namespace.get(key))
    }

    /// Returns the version of a document, or `None` if it does not exist.
    pub fn version(&self, ns: &str, key: &str) -> Option<u64> {
        self.record(ns, key).map(|record| record.version)
    }

    /// Stores or removes a document.
    pub fn put(&mut self, ns: &str, key: DocKey, record: Option<Record>) {
        let namespace = self.namespaces.entry(ns.to_string()).or_insert_with(Namespace::default);
        match record {
            Some(record) => {
                namespace.documents.insert(key, record);
            }
            None => {
                namespace.documents.remove(&key);
            }
        }
    }

    pub fn add_index(&mut self, ns: &str, index: UniqueIndex) {
        let namespace = self.namespaces.entry(ns.to_string()).or_insert_with(Namespace::default);
        if !namespace.indexes.contains(&index) {
            namespace.indexes.push_back(index);
        }
    }

    pub fn drop_namespace(&mut self, ns: &str) -> bool {
        self.namespaces.remove(ns).is_some()
    }

    /// Returns the names of the namespaces of a database.
    pub fn namespaces_of(&self, db: &str) -> Vec<String> {
        let prefix = format!("{}.", db);
        let mut names: Vec<String> = self
            .namespaces
            .keys()
            .filter(|ns| ns.starts_with(&prefix))
            .cloned()
            .collect();
        names.sort();
        names
    }
}
