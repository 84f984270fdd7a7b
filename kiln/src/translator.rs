use crate::document::{Document, Value};
use crate::driver::{Sort, SortKey};
use crate::errors::{ErrorKind, KilnError, KilnResult};
use crate::model::{Meta, ID_FIELD, LOCK_FIELD, SCORE_FIELD, TOKEN_FIELD};

const QUERY_OPERATORS: [&str; 21] = [
    "$eq", "$ne", "$gt", "$gte", "$lt", "$lte", "$in", "$nin", "$exists", "$not", "$and", "$or", "$nor",
    "$size", "$all", "$elemMatch", "$regex", "$options", "$text", "$search", "$meta",
];

const UPDATE_OPERATORS: [&str; 10] = [
    "$set",
    "$unset",
    "$inc",
    "$mul",
    "$min",
    "$max",
    "$push",
    "$pull",
    "$addToSet",
    "$setOnInsert",
];

const MODIFIERS: [&str; 1] = ["$each"];

const INTERNAL_FIELDS: [&str; 4] = [ID_FIELD, LOCK_FIELD, TOKEN_FIELD, SCORE_FIELD];

fn translation_error(message: String) -> KilnError {
    KilnError::new(&message, ErrorKind::TranslationError)
}

/// Converts generic filters, updates and sort lists into the representation
/// the driver understands.
///
/// The manager never interprets filters itself; it hands them to the
/// translator of its model and forwards the result. Implementations report
/// anything they cannot translate as a `TranslationError`.
pub trait Translator: Send + Sync {
    /// Translates a filter or update document.
    fn document(&self, doc: &Document) -> KilnResult<Document>;

    /// Translates a list of sort fields. A leading `-` sorts descending.
    fn sort(&self, fields: &[&str]) -> KilnResult<Sort>;

    /// Translates a single, possibly dotted, field name.
    fn field(&self, name: &str) -> KilnResult<String>;
}

/// Translates model field names to stored names using the model's [`Meta`].
///
/// Only the first segment of a dotted path is mapped; the rest is passed
/// through. Operators are checked against the operators the in-memory engine
/// understands.
///
/// # Examples
///
/// ```rust
/// use kiln::doc;
/// use kiln::model::{Field, Meta};
/// use kiln::translator::{DefaultTranslator, Translator};
/// use once_cell::sync::Lazy;
///
/// struct Post;
/// static META: Lazy<Meta> = Lazy::new(|| {
///     Meta::new::<Post>("Post", "posts", vec![Field::new("title", "t")])
/// });
///
/// let translator = DefaultTranslator::new(&META);
/// let filter = translator.document(&doc! { "title": { "$ne": "A" } }).unwrap();
/// assert_eq!(filter, doc! { "t": { "$ne": "A" } });
/// assert!(translator.field("missing").is_err());
/// ```
#[derive(Debug, Clone, Copy)]
pub struct DefaultTranslator {
    meta: &'static Meta,
}

impl DefaultTranslator {
    pub fn new(meta: &'static Meta) -> Self {
        DefaultTranslator { meta }
    }

    fn check_operator(&self, operator: &str) -> KilnResult<()> {
        if QUERY_OPERATORS.contains(&operator)
            || UPDATE_OPERATORS.contains(&operator)
            || MODIFIERS.contains(&operator)
        {
            Ok(())
        } else {
            Err(translation_error(format!(
                "unknown operator {} in {} query",
                operator,
                self.meta.name()
            )))
        }
    }

    /// Checks the operators of a value without mapping its field names.
    /// Nested documents below an operator address array elements or literal
    /// values, not model fields.
    fn check_value(&self, value: &Value) -> KilnResult<()> {
        match value {
            Value::Object(doc) => {
                for (key, item) in doc {
                    if key.starts_with('$') {
                        self.check_operator(key)?;
                    }
                    self.check_value(item)?;
                }
                Ok(())
            }
            Value::Array(items) => items.iter().try_for_each(|item| self.check_value(item)),
            _ => Ok(()),
        }
    }

    fn logical(&self, operator: &str, value: &Value) -> KilnResult<Value> {
        let items = match value {
            Value::Array(items) => items,
            _ => {
                return Err(translation_error(format!(
                    "{} expects an array of documents",
                    operator
                )))
            }
        };

        let mut out = Vec::with_capacity(items.len());
        for item in items {
            match item {
                Value::Object(doc) => out.push(Value::Object(self.document(doc)?)),
                _ => {
                    return Err(translation_error(format!(
                        "{} expects an array of documents",
                        operator
                    )))
                }
            }
        }
        Ok(Value::Array(out))
    }

    fn update_fields(&self, operator: &str, value: &Value) -> KilnResult<Value> {
        let fields = match value {
            Value::Object(fields) => fields,
            _ => {
                return Err(translation_error(format!(
                    "{} expects a document of fields",
                    operator
                )))
            }
        };

        let mut out = Document::new();
        for (name, item) in fields {
            self.check_value(item)?;
            out.insert(self.field(name)?, item.clone());
        }
        Ok(Value::Object(out))
    }
}

impl Translator for DefaultTranslator {
    fn document(&self, doc: &Document) -> KilnResult<Document> {
        let mut out = Document::new();
        for (key, value) in doc {
            if key.starts_with('$') {
                self.check_operator(key)?;
                let value = match key.as_str() {
                    "$and" | "$or" | "$nor" => self.logical(key, value)?,
                    operator if UPDATE_OPERATORS.contains(&operator) => self.update_fields(key, value)?,
                    _ => {
                        self.check_value(value)?;
                        value.clone()
                    }
                };
                out.insert(key.clone(), value);
            } else {
                self.check_value(value)?;
                out.insert(self.field(key)?, value.clone());
            }
        }
        Ok(out)
    }

    fn sort(&self, fields: &[&str]) -> KilnResult<Sort> {
        fields
            .iter()
            .map(|field| match field.strip_prefix('-') {
                Some(name) => Ok(SortKey::desc(&self.field(name)?)),
                None => Ok(SortKey::asc(&self.field(field)?)),
            })
            .collect()
    }

    fn field(&self, name: &str) -> KilnResult<String> {
        let (head, rest) = match name.split_once('.') {
            Some((head, rest)) => (head, Some(rest)),
            None => (name, None),
        };

        let stored = if INTERNAL_FIELDS.contains(&head) {
            head
        } else {
            match self.meta.field(head) {
                Some(field) => field.stored,
                None => {
                    return Err(translation_error(format!(
                        "unknown field {} on {}",
                        head,
                        self.meta.name()
                    )))
                }
            }
        };

        Ok(match rest {
            Some(rest) => format!("{}.{}", stored, rest),
            None => stored.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::doc;
    use crate::model::Field;
    use once_cell::sync::Lazy;

    struct Post;

    static META: Lazy<Meta> = Lazy::new(|| {
        Meta::new::<Post>(
            "Post",
            "posts",
            vec![Field::new("title", "title"), Field::new("created_at", "createdAt"), Field::new("tags", "tags")],
        )
    });

    fn translator() -> DefaultTranslator {
        DefaultTranslator::new(&META)
    }

    #[test]
    fn test_translates_field_names() {
        let translator = translator();
        assert_eq!(translator.field("created_at").unwrap(), "createdAt");
        assert_eq!(translator.field("createdAt").unwrap(), "createdAt");
        assert_eq!(translator.field("created_at.day").unwrap(), "createdAt.day");
        assert_eq!(translator.field("_lk").unwrap(), "_lk");

        let err = translator.field("body").unwrap_err();
        assert_eq!(err.kind(), &ErrorKind::TranslationError);
    }

    #[test]
    fn test_translates_filters() {
        let filter = translator()
            .document(&doc! {
                "$or": [{ "created_at": { "$gt": 1 } }, { "tags": { "$in": ["a"] } }],
                "title": "A"
            })
            .unwrap();
        assert_eq!(
            filter,
            doc! {
                "$or": [{ "createdAt": { "$gt": 1 } }, { "tags": { "$in": ["a"] } }],
                "title": "A"
            }
        );

        assert!(translator().document(&doc! { "title": { "$where": "x" } }).is_err());
        assert!(translator().document(&doc! { "$or": { "title": "A" } }).is_err());
        assert!(translator().document(&doc! { "body": "A" }).is_err());
    }

    #[test]
    fn test_translates_updates() {
        let update = translator()
            .document(&doc! {
                "$set": { "created_at": 5 },
                "$push": { "tags": { "$each": ["a", "b"] } },
                "$inc": { "_lk": 1 }
            })
            .unwrap();
        assert_eq!(
            update,
            doc! {
                "$set": { "createdAt": 5 },
                "$push": { "tags": { "$each": ["a", "b"] } },
                "$inc": { "_lk": 1 }
            }
        );
        assert!(translator().document(&doc! { "$rename": { "title": "x" } }).is_err());
    }

    #[test]
    fn test_translates_sort() {
        let sort = translator().sort(&["-created_at", "title"]).unwrap();
        assert_eq!(sort, vec![SortKey::desc("createdAt"), SortKey::asc("title")]);
        assert!(translator().sort(&["-body"]).is_err());
    }
}
