use crate::errors::{ErrorKind, KilnError, KilnResult};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::cmp::Ordering;

pub use serde_json::Value;

/// A document as stored in a collection: an ordered map from field names to
/// JSON values. Filters, updates and projections use the same
/// representation.
pub type Document = serde_json::Map<String, Value>;

/// Creates a [`Document`] from JSON-like key value pairs.
///
/// # Examples
///
/// ```rust
/// use kiln::doc;
///
/// let doc = doc! {
///     "title": "Hello",
///     "tags": ["a", "b"],
///     "meta": { "views": 1 }
/// };
/// assert_eq!(doc["title"], "Hello");
/// assert!(doc!{}.is_empty());
/// ```
#[macro_export]
macro_rules! doc {
    () => {
        $crate::document::Document::new()
    };

    ($($tt:tt)+) => {
        match $crate::serde_json::json!({ $($tt)+ }) {
            $crate::serde_json::Value::Object(map) => map,
            _ => $crate::document::Document::new(),
        }
    };
}

/// Converts a serializable value into a document.
pub fn to_document<T: Serialize>(value: &T) -> KilnResult<Document> {
    match serde_json::to_value(value)? {
        Value::Object(map) => Ok(map),
        other => Err(KilnError::new(
            &format!("expected value to serialize to a document, got {}", type_name(&other)),
            ErrorKind::EncodingError,
        )),
    }
}

/// Decodes a document into a deserializable value.
pub fn from_document<T: DeserializeOwned>(doc: Document) -> KilnResult<T> {
    Ok(serde_json::from_value(Value::Object(doc))?)
}

/// Returns the value at a dotted path. Numeric segments index into arrays.
pub fn get_path<'a>(doc: &'a Document, path: &str) -> Option<&'a Value> {
    let mut segments = path.split('.');
    let mut current = doc.get(segments.next()?)?;
    for segment in segments {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Sets the value at a dotted path, creating intermediate documents.
pub fn set_path(doc: &mut Document, path: &str, value: Value) -> KilnResult<()> {
    let segments: Vec<&str> = path.split('.').collect();
    let (last, parents) = match segments.split_last() {
        Some(split) => split,
        None => return Err(invalid_path(path)),
    };

    let mut current = doc;
    for segment in parents {
        let entry = current
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Document::new()));
        current = match entry {
            Value::Object(map) => map,
            _ => {
                return Err(KilnError::new(
                    &format!("cannot create field \"{}\" in non-document value at \"{}\"", last, segment),
                    ErrorKind::InvalidOperation,
                ))
            }
        };
    }

    current.insert(last.to_string(), value);
    Ok(())
}

/// Removes and returns the value at a dotted path.
pub fn remove_path(doc: &mut Document, path: &str) -> Option<Value> {
    match path.rsplit_once('.') {
        None => doc.remove(path),
        Some((parent, last)) => {
            let mut current = doc;
            for segment in parent.split('.') {
                current = match current.get_mut(segment)? {
                    Value::Object(map) => map,
                    _ => return None,
                };
            }
            current.remove(last)
        }
    }
}

fn invalid_path(path: &str) -> KilnError {
    KilnError::new(&format!("invalid field path \"{}\"", path), ErrorKind::InvalidOperation)
}

fn type_rank(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Number(_) => 1,
        Value::String(_) => 2,
        Value::Object(_) => 3,
        Value::Array(_) => 4,
        Value::Bool(_) => 5,
    }
}

pub(crate) fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Object(_) => "document",
        Value::Array(_) => "array",
        Value::Bool(_) => "bool",
    }
}

/// Compares two values using a total order: null, numbers, strings,
/// documents, arrays and booleans. Integers and floats compare numerically.
pub fn compare_values(a: &Value, b: &Value) -> Ordering {
    let rank = type_rank(a).cmp(&type_rank(b));
    if rank != Ordering::Equal {
        return rank;
    }

    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_i64(), y.as_i64()) {
            (Some(x), Some(y)) => x.cmp(&y),
            _ => {
                let x = x.as_f64().unwrap_or(f64::NAN);
                let y = y.as_f64().unwrap_or(f64::NAN);
                x.partial_cmp(&y).unwrap_or(Ordering::Equal)
            }
        },
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Array(x), Value::Array(y)) => {
            for (left, right) in x.iter().zip(y.iter()) {
                let ord = compare_values(left, right);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            x.len().cmp(&y.len())
        }
        (Value::Object(x), Value::Object(y)) => {
            for ((lk, lv), (rk, rv)) in x.iter().zip(y.iter()) {
                let ord = lk.cmp(rk).then_with(|| compare_values(lv, rv));
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            x.len().cmp(&y.len())
        }
        _ => Ordering::Equal,
    }
}

/// Returns whether two values are equal, comparing numbers numerically.
pub fn values_equal(a: &Value, b: &Value) -> bool {
    compare_values(a, b) == Ordering::Equal
}
