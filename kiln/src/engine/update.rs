use crate::document::{compare_values, get_path, remove_path, set_path, type_name, values_equal, Document, Value};
use crate::engine::query::ElemMatch;
use crate::errors::{ErrorKind, KilnError, KilnResult};
use std::cmp::Ordering;

const OPERATORS: [&str; 10] = [
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

fn invalid(message: String) -> KilnError {
    KilnError::new(&message, ErrorKind::InvalidOperation)
}

/// Returns whether the document is a replacement rather than an update.
pub(crate) fn is_replacement(update: &Document) -> bool {
    !update.keys().any(|key| key.starts_with('$'))
}

/// Checks that an update only uses known operators and that no two
/// operators touch the same path.
pub(crate) fn validate(update: &Document) -> KilnResult<()> {
    if update.is_empty() {
        return Err(invalid("update document must not be empty".to_string()));
    }

    let mut paths: Vec<&str> = Vec::new();
    for (op, fields) in update {
        if !OPERATORS.contains(&op.as_str()) {
            if op.starts_with('$') {
                return Err(invalid(format!("unknown update operator {}", op)));
            }
            return Err(invalid(format!(
                "update document requires atomic operators, found field {}",
                op
            )));
        }

        let fields = match fields {
            Value::Object(fields) => fields,
            other => {
                return Err(invalid(format!(
                    "{} requires a document, got {}",
                    op,
                    type_name(other)
                )))
            }
        };

        for path in fields.keys() {
            if let Some(existing) = paths.iter().find(|existing| conflicts(existing, path)) {
                return Err(invalid(format!(
                    "updating the path '{}' would create a conflict at '{}'",
                    path, existing
                )));
            }
            paths.push(path);
        }
    }
    Ok(())
}

fn conflicts(a: &str, b: &str) -> bool {
    a == b
        || b.strip_prefix(a).map(|rest| rest.starts_with('.')).unwrap_or(false)
        || a.strip_prefix(b).map(|rest| rest.starts_with('.')).unwrap_or(false)
}

/// Applies a validated update to a document. `$setOnInsert` only applies when
/// the update inserts a new document.
pub(crate) fn apply(doc: &mut Document, update: &Document, inserting: bool) -> KilnResult<()> {
    for (op, fields) in update {
        let fields = match fields {
            Value::Object(fields) => fields,
            _ => continue,
        };

        for (path, arg) in fields {
            match op.as_str() {
                "$set" => set_path(doc, path, arg.clone())?,
                "$setOnInsert" => {
                    if inserting {
                        set_path(doc, path, arg.clone())?
                    }
                }
                "$unset" => {
                    remove_path(doc, path);
                }
                "$inc" => {
                    let current = get_path(doc, path).cloned();
                    let value = arithmetic(op, current, arg, |a, b| a.checked_add(b), |a, b| a + b)?;
                    set_path(doc, path, value)?;
                }
                "$mul" => {
                    let current = get_path(doc, path).cloned().or_else(|| Some(zero_like(arg)));
                    let value = arithmetic(op, current, arg, |a, b| a.checked_mul(b), |a, b| a * b)?;
                    set_path(doc, path, value)?;
                }
                "$min" | "$max" => {
                    let wanted = if op == "$min" { Ordering::Less } else { Ordering::Greater };
                    let replace = match get_path(doc, path) {
                        None => true,
                        Some(current) => compare_values(arg, current) == wanted,
                    };
                    if replace {
                        set_path(doc, path, arg.clone())?;
                    }
                }
                "$push" | "$addToSet" => {
                    let mut items = array_at(doc, op, path)?;
                    for item in each(arg) {
                        if op == "$addToSet" && items.iter().any(|existing| values_equal(existing, &item)) {
                            continue;
                        }
                        items.push(item);
                    }
                    set_path(doc, path, Value::Array(items))?;
                }
                "$pull" => {
                    if get_path(doc, path).is_none() {
                        continue;
                    }
                    let matcher = ElemMatch::parse(arg)?;
                    let mut items = array_at(doc, op, path)?;
                    items.retain(|item| !matcher.matches(item));
                    set_path(doc, path, Value::Array(items))?;
                }
                _ => return Err(invalid(format!("unknown update operator {}", op))),
            }
        }
    }
    Ok(())
}

fn array_at(doc: &Document, op: &str, path: &str) -> KilnResult<Vec<Value>> {
    match get_path(doc, path) {
        None => Ok(Vec::new()),
        Some(Value::Array(items)) => Ok(items.clone()),
        Some(other) => Err(invalid(format!(
            "{} requires an array at '{}', found {}",
            op,
            path,
            type_name(other)
        ))),
    }
}

/// Expands `{$each: [...]}` into its items.
fn each(arg: &Value) -> Vec<Value> {
    match arg {
        Value::Object(doc) if doc.len() == 1 => match doc.get("$each") {
            Some(Value::Array(items)) => items.clone(),
            _ => vec![arg.clone()],
        },
        _ => vec![arg.clone()],
    }
}

fn zero_like(arg: &Value) -> Value {
    if arg.is_i64() || arg.is_u64() {
        Value::from(0)
    } else {
        Value::from(0.0)
    }
}

fn arithmetic(
    op: &str,
    current: Option<Value>,
    operand: &Value,
    int_op: impl Fn(i64, i64) -> Option<i64>,
    float_op: impl Fn(f64, f64) -> f64,
) -> KilnResult<Value> {
    let operand = match operand {
        Value::Number(number) => number,
        other => {
            return Err(invalid(format!(
                "{} requires a numeric argument, got {}",
                op,
                type_name(other)
            )))
        }
    };

    let current = match current {
        None => return Ok(Value::Number(operand.clone())),
        Some(Value::Number(number)) => number,
        Some(other) => {
            return Err(invalid(format!(
                "cannot apply {} to a value of type {}",
                op,
                type_name(&other)
            )))
        }
    };

    if let (Some(a), Some(b)) = (current.as_i64(), operand.as_i64()) {
        if let Some(result) = int_op(a, b) {
            return Ok(Value::from(result));
        }
    }

    let a = current.as_f64().unwrap_or(0.0);
    let b = operand.as_f64().unwrap_or(0.0);
    serde_json::Number::from_f64(float_op(a, b))
        .map(Value::Number)
        .ok_or_else(|| invalid(format!("{} produced a non finite number", op)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::doc;

    fn updated(mut doc: Document, update: Document) -> Document {
        validate(&update).unwrap();
        apply(&mut doc, &update, false).unwrap();
        doc
    }

    #[test]
    fn test_set_unset_and_inc() {
        let doc = updated(
            doc! { "a": 1, "b": 2, "n": 1 },
            doc! { "$set": { "a": 5, "c.d": true }, "$unset": { "b": "" }, "$inc": { "n": 2, "m": 1 } },
        );
        assert_eq!(doc, doc! { "a": 5, "c": { "d": true }, "n": 3, "m": 1 });
    }

    #[test]
    fn test_inc_mixes_integers_and_floats() {
        let doc = updated(doc! { "n": 1 }, doc! { "$inc": { "n": 0.5 } });
        assert_eq!(doc["n"], 1.5);

        let doc = updated(doc! { "n": 3 }, doc! { "$mul": { "n": 2, "m": 4 } });
        assert_eq!(doc, doc! { "n": 6, "m": 0 });
    }

    #[test]
    fn test_min_and_max() {
        let doc = updated(doc! { "lo": 5, "hi": 5 }, doc! { "$min": { "lo": 3 }, "$max": { "hi": 4 } });
        assert_eq!(doc, doc! { "lo": 3, "hi": 5 });
    }

    #[test]
    fn test_array_operators() {
        let doc = updated(
            doc! { "tags": ["a"], "set": ["x"], "nums": [1, 2, 3, 4] },
            doc! {
                "$push": { "tags": { "$each": ["b", "c"] } },
                "$addToSet": { "set": { "$each": ["x", "y"] } },
                "$pull": { "nums": { "$gte": 3 } }
            },
        );
        assert_eq!(doc, doc! { "tags": ["a", "b", "c"], "set": ["x", "y"], "nums": [1, 2] });
    }

    #[test]
    fn test_set_on_insert_only_when_inserting() {
        let update = doc! { "$setOnInsert": { "token": 1 }, "$set": { "a": 1 } };
        let mut doc = doc! {};
        apply(&mut doc, &update, false).unwrap();
        assert_eq!(doc, doc! { "a": 1 });

        let mut doc = doc! {};
        apply(&mut doc, &update, true).unwrap();
        assert_eq!(doc, doc! { "a": 1, "token": 1 });
    }

    #[test]
    fn test_rejects_invalid_updates() {
        assert!(validate(&doc! {}).is_err());
        assert!(validate(&doc! { "a": 1 }).is_err());
        assert!(validate(&doc! { "$foo": { "a": 1 } }).is_err());
        assert!(validate(&doc! { "$set": 1 }).is_err());
        assert!(validate(&doc! { "$set": { "a": 1 }, "$inc": { "a": 1 } }).is_err());
        assert!(validate(&doc! { "$set": { "a": 1 }, "$inc": { "a.b": 1 } }).is_err());
        assert!(validate(&doc! { "$set": { "a": 1 }, "$inc": { "ab": 1 } }).is_ok());

        let mut doc = doc! { "a": "x" };
        let err = apply(&mut doc, &doc! { "$inc": { "a": 1 } }, false).unwrap_err();
        assert_eq!(err.kind(), &ErrorKind::InvalidOperation);
    }

    #[test]
    fn test_detects_replacements() {
        assert!(is_replacement(&doc! { "a": 1 }));
        assert!(!is_replacement(&doc! { "$set": { "a": 1 } }));
    }
}
