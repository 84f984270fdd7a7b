use crate::id::ID;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::any::TypeId;
use std::fmt::{Debug, Formatter};

/// Stored name of the document id field.
pub const ID_FIELD: &str = "_id";
/// Stored name of the lock counter field.
pub const LOCK_FIELD: &str = "_lk";
/// Stored name of the upsert token field.
pub const TOKEN_FIELD: &str = "_tk";
/// Name of the text score exposed by text score sorted queries.
pub const SCORE_FIELD: &str = "_sc";

/// The fields every model carries.
///
/// Models embed the base with `#[serde(flatten)]`:
///
/// ```rust
/// use kiln::model::{Base, Validate};
/// use kiln::Model;
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Model, Serialize, Deserialize, Default, Debug, Clone)]
/// #[model(collection = "posts")]
/// struct Post {
///     #[serde(flatten)]
///     base: Base,
///     title: String,
/// }
///
/// impl Validate for Post {}
/// ```
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct Base {
    /// The document id, zero until the model has been inserted.
    #[serde(rename = "_id", default)]
    pub id: ID,

    /// The lock counter, incremented by locking operations.
    #[serde(rename = "_lk", default)]
    pub lock: i64,

    /// The token set by the insert branch of an upsert.
    #[serde(rename = "_tk", default, skip_serializing_if = "Option::is_none")]
    pub token: Option<ID>,

    /// The text score, only populated by text score sorted queries.
    #[serde(rename = "_sc", default, skip_serializing)]
    pub score: f64,
}

impl Base {
    pub fn new(id: ID) -> Self {
        Base {
            id,
            ..Default::default()
        }
    }
}

/// A single field of a model: its Rust name and its stored name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Field {
    pub name: &'static str,
    pub stored: &'static str,
}

impl Field {
    pub const fn new(name: &'static str, stored: &'static str) -> Self {
        Field { name, stored }
    }
}

/// The static descriptor of a model type.
///
/// A `Meta` is created once per model type (by `#[derive(Model)]`) and
/// identifies the type for the store caches and the manager type checks.
/// Two metas are equal only if they describe the same Rust type.
pub struct Meta {
    name: &'static str,
    collection: &'static str,
    fields: Vec<Field>,
    type_id: TypeId,
}

impl Meta {
    pub fn new<M: 'static>(name: &'static str, collection: &'static str, fields: Vec<Field>) -> Self {
        Meta {
            name,
            collection,
            fields,
            type_id: TypeId::of::<M>(),
        }
    }

    /// The model type name, e.g. "Post".
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// The collection the model is stored in, e.g. "posts".
    pub fn collection(&self) -> &'static str {
        self.collection
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    /// Looks up a field by its Rust name or stored name.
    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields
            .iter()
            .find(|field| field.name == name)
            .or_else(|| self.fields.iter().find(|field| field.stored == name))
    }
}

impl PartialEq for Meta {
    fn eq(&self, other: &Self) -> bool {
        self.type_id == other.type_id
    }
}

impl Eq for Meta {}

impl Debug for Meta {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Meta")
            .field("name", &self.name)
            .field("collection", &self.collection)
            .field("fields", &self.fields)
            .finish()
    }
}

/// The validation hook run before writes and after reads.
pub trait Validate {
    fn validate(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// A persistable model.
///
/// Implemented by `#[derive(Model)]`. The model is serialized with serde; its
/// embedded [`Base`] carries the id, lock counter, upsert token and text
/// score.
pub trait Model: Serialize + DeserializeOwned + Validate + Send + Sync + 'static {
    /// Returns the static descriptor of the model type.
    fn meta() -> &'static Meta
    where
        Self: Sized;

    fn base(&self) -> &Base;

    fn base_mut(&mut self) -> &mut Base;

    fn id(&self) -> ID {
        self.base().id
    }
}
