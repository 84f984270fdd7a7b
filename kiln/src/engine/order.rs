use crate::document::{compare_values, get_path, remove_path, set_path, Document, Value};
use crate::driver::{Sort, SortOrder};
use crate::errors::{ErrorKind, KilnError, KilnResult};
use crate::model::ID_FIELD;
use std::cmp::Ordering;
use std::sync::Arc;

/// A matched document together with its text score.
#[derive(Debug, Clone)]
pub(crate) struct Hit {
    pub doc: Arc<Document>,
    pub score: Option<f64>,
}

fn sort_value(doc: &Document, field: &str) -> Value {
    get_path(doc, field).cloned().unwrap_or(Value::Null)
}

/// Orders hits by the sort specification. The sort is stable, so hits equal
/// under the sort keep their storage order.
pub(crate) fn sort_hits(hits: &mut [Hit], sort: &Sort) {
    if sort.is_empty() {
        return;
    }

    hits.sort_by(|a, b| {
        for key in sort {
            let ord = match key.order {
                SortOrder::Ascending => compare_values(&sort_value(&a.doc, &key.field), &sort_value(&b.doc, &key.field)),
                SortOrder::Descending => compare_values(&sort_value(&b.doc, &key.field), &sort_value(&a.doc, &key.field)),
                SortOrder::TextScore => {
                    let left = a.score.unwrap_or(0.0);
                    let right = b.score.unwrap_or(0.0);
                    right.partial_cmp(&left).unwrap_or(Ordering::Equal)
                }
            };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    });
}

/// Returns whether the sort or projection asks for text score metadata.
pub(crate) fn needs_score(sort: &Sort, projection: Option<&Document>) -> bool {
    sort.iter().any(|key| key.order == SortOrder::TextScore)
        || projection
            .map(|projection| projection.values().any(is_meta_score))
            .unwrap_or(false)
}

fn is_meta_score(value: &Value) -> bool {
    match value {
        Value::Object(doc) => doc.get("$meta").and_then(Value::as_str) == Some("textScore"),
        _ => false,
    }
}

fn is_included(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(flag) => Some(*flag),
        Value::Number(number) => Some(number.as_f64().map(|n| n != 0.0).unwrap_or(false)),
        _ => None,
    }
}

/// Checks a projection for unsupported or mixed entries.
pub(crate) fn validate_projection(projection: &Document) -> KilnResult<()> {
    let mut inclusion = None;
    for (field, value) in projection {
        if is_meta_score(value) {
            continue;
        }

        let included = match is_included(value) {
            Some(included) => included,
            None => {
                return Err(KilnError::new(
                    &format!("unsupported projection value for '{}'", field),
                    ErrorKind::InvalidOperation,
                ))
            }
        };

        if field == ID_FIELD {
            continue;
        }

        match inclusion {
            None => inclusion = Some(included),
            Some(previous) if previous != included => {
                return Err(KilnError::new(
                    "projection cannot mix inclusion and exclusion",
                    ErrorKind::InvalidOperation,
                ))
            }
            _ => {}
        }
    }
    Ok(())
}

/// Applies a validated projection to a hit.
pub(crate) fn project(hit: &Hit, projection: Option<&Document>) -> KilnResult<Document> {
    let projection = match projection {
        Some(projection) if !projection.is_empty() => projection,
        _ => return Ok(hit.doc.as_ref().clone()),
    };

    let inclusion = projection
        .iter()
        .filter(|(field, value)| field.as_str() != ID_FIELD && !is_meta_score(value))
        .find_map(|(_, value)| is_included(value));
    let keep_id = projection.get(ID_FIELD).and_then(is_included).unwrap_or(true);

    let mut out = match inclusion {
        Some(true) => {
            let mut out = Document::new();
            if keep_id {
                if let Some(id) = hit.doc.get(ID_FIELD) {
                    out.insert(ID_FIELD.to_string(), id.clone());
                }
            }
            for (field, value) in projection {
                if field == ID_FIELD || is_meta_score(value) {
                    continue;
                }
                if let Some(found) = get_path(&hit.doc, field) {
                    set_path(&mut out, field, found.clone())?;
                }
            }
            out
        }
        _ => {
            let mut out = hit.doc.as_ref().clone();
            for (field, value) in projection {
                if is_included(value) == Some(false) && field != ID_FIELD {
                    remove_path(&mut out, field);
                }
            }
            if !keep_id {
                out.remove(ID_FIELD);
            }
            out
        }
    };

    for (field, value) in projection {
        if is_meta_score(value) {
            set_path(&mut out, field, Value::from(hit.score.unwrap_or(0.0)))?;
        }
    }
    Ok(out)
}
