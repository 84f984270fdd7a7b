use crate::document::{compare_values, type_name, values_equal, Document, Value};
use crate::errors::{ErrorKind, KilnError, KilnResult};
use regex::{Regex, RegexBuilder};
use std::cmp::Ordering;

/// A compiled filter document.
#[derive(Debug, Clone)]
pub(crate) enum Query {
    And(Vec<Query>),
    Or(Vec<Query>),
    Nor(Vec<Query>),
    Field(String, Vec<Condition>),
    Text(Vec<String>),
}

/// A condition on the values of a single field.
#[derive(Debug, Clone)]
pub(crate) enum Condition {
    Eq(Value),
    Ne(Value),
    Gt(Value),
    Gte(Value),
    Lt(Value),
    Lte(Value),
    In(Vec<Value>),
    Nin(Vec<Value>),
    Exists(bool),
    Not(Vec<Condition>),
    Size(usize),
    All(Vec<Value>),
    ElemMatch(ElemMatch),
    Regex(Regex),
}

#[derive(Debug, Clone)]
pub(crate) enum ElemMatch {
    /// Conditions on array elements that are documents.
    Document(Box<Query>),
    /// Conditions on the array elements themselves.
    Value(Vec<Condition>),
}

fn invalid(message: String) -> KilnError {
    KilnError::new(&message, ErrorKind::InvalidOperation)
}

impl Query {
    /// Compiles a filter document.
    pub fn parse(filter: &Document) -> KilnResult<Query> {
        let mut clauses = Vec::with_capacity(filter.len());
        for (key, value) in filter {
            clauses.push(Query::parse_clause(key, value)?);
        }
        Ok(Query::And(clauses))
    }

    fn parse_clause(key: &str, value: &Value) -> KilnResult<Query> {
        match key {
            "$and" | "$or" | "$nor" => {
                let items = match value {
                    Value::Array(items) if !items.is_empty() => items,
                    _ => return Err(invalid(format!("{} requires a non-empty array", key))),
                };

                let mut queries = Vec::with_capacity(items.len());
                for item in items {
                    match item {
                        Value::Object(doc) => queries.push(Query::parse(doc)?),
                        _ => return Err(invalid(format!("{} entries must be documents", key))),
                    }
                }

                Ok(match key {
                    "$and" => Query::And(queries),
                    "$or" => Query::Or(queries),
                    _ => Query::Nor(queries),
                })
            }
            "$text" => {
                let search = match value {
                    Value::Object(doc) => doc.get("$search").and_then(Value::as_str),
                    _ => None,
                };
                match search {
                    Some(search) => Ok(Query::Text(tokenize(search))),
                    None => Err(invalid("$text requires a $search string".to_string())),
                }
            }
            _ if key.starts_with('$') => Err(invalid(format!("unknown top level operator {}", key))),
            _ => Ok(Query::Field(key.to_string(), parse_conditions(value)?)),
        }
    }

    /// Returns whether the document matches.
    pub fn matches(&self, doc: &Document) -> bool {
        match self {
            Query::And(queries) => queries.iter().all(|query| query.matches(doc)),
            Query::Or(queries) => queries.iter().any(|query| query.matches(doc)),
            Query::Nor(queries) => !queries.iter().any(|query| query.matches(doc)),
            Query::Field(path, conditions) => {
                let values = values_at(doc, path);
                conditions.iter().all(|condition| condition.matches(&values))
            }
            Query::Text(terms) => text_score(doc, terms) > 0.0,
        }
    }

    /// Returns the text score of the document if the query has a text clause.
    pub fn score(&self, doc: &Document) -> Option<f64> {
        self.text_terms().map(|terms| text_score(doc, terms))
    }

    pub fn has_text(&self) -> bool {
        self.text_terms().is_some()
    }

    fn text_terms(&self) -> Option<&Vec<String>> {
        match self {
            Query::Text(terms) => Some(terms),
            Query::And(queries) => queries.iter().find_map(|query| query.text_terms()),
            _ => None,
        }
    }

    /// Collects the fields fixed by top level equality clauses. Used to seed
    /// the document inserted by an upsert.
    pub fn equalities(&self, out: &mut Vec<(String, Value)>) {
        match self {
            Query::And(queries) => queries.iter().for_each(|query| query.equalities(out)),
            Query::Field(path, conditions) => {
                for condition in conditions {
                    if let Condition::Eq(value) = condition {
                        out.push((path.clone(), value.clone()));
                    }
                }
            }
            _ => {}
        }
    }
}

fn is_operator_document(value: &Value) -> bool {
    match value {
        Value::Object(doc) => !doc.is_empty() && doc.keys().all(|key| key.starts_with('$')),
        _ => false,
    }
}

fn parse_conditions(value: &Value) -> KilnResult<Vec<Condition>> {
    let doc = match value {
        Value::Object(doc) if is_operator_document(value) => doc,
        Value::Object(doc) if doc.keys().any(|key| key.starts_with('$')) => {
            return Err(invalid(
                "operators cannot be mixed with plain fields".to_string(),
            ))
        }
        _ => return Ok(vec![Condition::Eq(value.clone())]),
    };

    let mut conditions = Vec::with_capacity(doc.len());
    for (op, arg) in doc {
        let condition = match op.as_str() {
            "$eq" => Condition::Eq(arg.clone()),
            "$ne" => Condition::Ne(arg.clone()),
            "$gt" => Condition::Gt(arg.clone()),
            "$gte" => Condition::Gte(arg.clone()),
            "$lt" => Condition::Lt(arg.clone()),
            "$lte" => Condition::Lte(arg.clone()),
            "$in" => Condition::In(array_arg(op, arg)?),
            "$nin" => Condition::Nin(array_arg(op, arg)?),
            "$all" => Condition::All(array_arg(op, arg)?),
            "$exists" => Condition::Exists(truthy(arg)),
            "$size" => match arg.as_u64() {
                Some(size) => Condition::Size(size as usize),
                None => return Err(invalid("$size requires a non-negative integer".to_string())),
            },
            "$not" => match arg {
                Value::Object(_) if is_operator_document(arg) => Condition::Not(parse_conditions(arg)?),
                Value::String(pattern) => Condition::Not(vec![Condition::Regex(compile_regex(pattern, "")?)]),
                _ => return Err(invalid("$not requires an operator document".to_string())),
            },
            "$elemMatch" => match arg {
                Value::Object(_) if is_operator_document(arg) => {
                    Condition::ElemMatch(ElemMatch::Value(parse_conditions(arg)?))
                }
                Value::Object(sub) => Condition::ElemMatch(ElemMatch::Document(Box::new(Query::parse(sub)?))),
                _ => return Err(invalid("$elemMatch requires a document".to_string())),
            },
            "$regex" => {
                let pattern = match arg {
                    Value::String(pattern) => pattern,
                    _ => return Err(invalid("$regex requires a string".to_string())),
                };
                let options = doc.get("$options").and_then(Value::as_str).unwrap_or("");
                Condition::Regex(compile_regex(pattern, options)?)
            }
            "$options" => {
                if !doc.contains_key("$regex") {
                    return Err(invalid("$options requires $regex".to_string()));
                }
                continue;
            }
            _ => return Err(invalid(format!("unknown operator {}", op))),
        };
        conditions.push(condition);
    }
    Ok(conditions)
}

fn array_arg(op: &str, arg: &Value) -> KilnResult<Vec<Value>> {
    match arg {
        Value::Array(items) => Ok(items.clone()),
        other => Err(invalid(format!("{} requires an array, got {}", op, type_name(other)))),
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Bool(flag) => *flag,
        Value::Number(number) => number.as_f64().map(|n| n != 0.0).unwrap_or(false),
        Value::Null => false,
        _ => true,
    }
}

fn compile_regex(pattern: &str, options: &str) -> KilnResult<Regex> {
    let mut builder = RegexBuilder::new(pattern);
    for option in options.chars() {
        match option {
            'i' => builder.case_insensitive(true),
            'm' => builder.multi_line(true),
            's' => builder.dot_matches_new_line(true),
            'x' => builder.ignore_whitespace(true),
            _ => return Err(invalid(format!("unknown regex option {}", option))),
        };
    }
    Ok(builder.build()?)
}

impl Condition {
    /// Evaluates the condition against the values found at a field path.
    fn matches(&self, values: &[&Value]) -> bool {
        match self {
            Condition::Eq(expected) => equals_any(values, expected),
            Condition::Ne(expected) => !equals_any(values, expected),
            Condition::Gt(bound) => compares_any(values, bound, |ord| ord == Ordering::Greater),
            Condition::Gte(bound) => compares_any(values, bound, |ord| ord != Ordering::Less),
            Condition::Lt(bound) => compares_any(values, bound, |ord| ord == Ordering::Less),
            Condition::Lte(bound) => compares_any(values, bound, |ord| ord != Ordering::Greater),
            Condition::In(candidates) => candidates.iter().any(|expected| equals_any(values, expected)),
            Condition::Nin(candidates) => !candidates.iter().any(|expected| equals_any(values, expected)),
            Condition::Exists(exists) => !values.is_empty() == *exists,
            Condition::Not(conditions) => !conditions.iter().all(|condition| condition.matches(values)),
            Condition::Size(size) => values
                .iter()
                .any(|value| matches!(value, Value::Array(items) if items.len() == *size)),
            Condition::All(expected) => {
                !expected.is_empty() && expected.iter().all(|item| equals_any(values, item))
            }
            Condition::ElemMatch(elem_match) => values.iter().any(|value| match value {
                Value::Array(items) => items.iter().any(|item| elem_match.matches(item)),
                _ => false,
            }),
            Condition::Regex(regex) => expand(values)
                .iter()
                .any(|value| matches!(value, Value::String(text) if regex.is_match(text))),
        }
    }
}

impl ElemMatch {
    /// Compiles a matcher for single array elements: an operator document,
    /// a document query or a plain value to compare with.
    pub fn parse(arg: &Value) -> KilnResult<ElemMatch> {
        match arg {
            Value::Object(_) if is_operator_document(arg) => Ok(ElemMatch::Value(parse_conditions(arg)?)),
            Value::Object(doc) => Ok(ElemMatch::Document(Box::new(Query::parse(doc)?))),
            _ => Ok(ElemMatch::Value(vec![Condition::Eq(arg.clone())])),
        }
    }

    pub fn matches(&self, item: &Value) -> bool {
        match self {
            ElemMatch::Document(query) => match item {
                Value::Object(doc) => query.matches(doc),
                _ => false,
            },
            ElemMatch::Value(conditions) => conditions.iter().all(|condition| condition.matches(&[item])),
        }
    }
}

/// Returns the values plus the elements of array values.
fn expand<'a>(values: &[&'a Value]) -> Vec<&'a Value> {
    let mut out = Vec::with_capacity(values.len());
    for value in values {
        out.push(*value);
        if let Value::Array(items) = value {
            out.extend(items.iter());
        }
    }
    out
}

fn equals_any(values: &[&Value], expected: &Value) -> bool {
    if values.is_empty() {
        return expected.is_null();
    }
    expand(values).iter().any(|value| values_equal(value, expected))
}

fn same_bracket(a: &Value, b: &Value) -> bool {
    matches!(
        (a, b),
        (Value::Number(_), Value::Number(_))
            | (Value::String(_), Value::String(_))
            | (Value::Bool(_), Value::Bool(_))
            | (Value::Null, Value::Null)
            | (Value::Object(_), Value::Object(_))
            | (Value::Array(_), Value::Array(_))
    )
}

fn compares_any(values: &[&Value], bound: &Value, accept: impl Fn(Ordering) -> bool) -> bool {
    expand(values)
        .iter()
        .any(|value| same_bracket(value, bound) && accept(compare_values(value, bound)))
}

/// Resolves a dotted path to all values it reaches. Arrays on the way are
/// traversed element wise; numeric segments also index into them.
pub(crate) fn values_at<'a>(doc: &'a Document, path: &str) -> Vec<&'a Value> {
    let segments: Vec<&str> = path.split('.').collect();
    let mut out = Vec::new();
    if let Some((head, rest)) = segments.split_first() {
        if let Some(value) = doc.get(*head) {
            resolve(value, rest, &mut out);
        }
    }
    out
}

fn resolve<'a>(current: &'a Value, segments: &[&str], out: &mut Vec<&'a Value>) {
    let (head, rest) = match segments.split_first() {
        Some(split) => split,
        None => {
            out.push(current);
            return;
        }
    };

    match current {
        Value::Object(map) => {
            if let Some(next) = map.get(*head) {
                resolve(next, rest, out);
            }
        }
        Value::Array(items) => {
            if let Ok(index) = head.parse::<usize>() {
                if let Some(item) = items.get(index) {
                    resolve(item, rest, out);
                }
            }
            for item in items {
                if item.is_object() {
                    resolve(item, segments, out);
                }
            }
        }
        _ => {}
    }
}

/// Splits text into lower case alphanumeric terms.
pub(crate) fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|term| !term.is_empty())
        .map(|term| term.to_lowercase())
        .collect()
}

fn collect_terms(value: &Value, out: &mut Vec<String>) {
    match value {
        Value::String(text) => out.extend(tokenize(text)),
        Value::Array(items) => items.iter().for_each(|item| collect_terms(item, out)),
        Value::Object(map) => map.values().for_each(|item| collect_terms(item, out)),
        _ => {}
    }
}

/// Scores a document against search terms: every occurrence of a term in a
/// string field adds one, normalized by the number of terms in the document.
pub(crate) fn text_score(doc: &Document, terms: &[String]) -> f64 {
    let mut words = Vec::new();
    for value in doc.values() {
        collect_terms(value, &mut words);
    }
    if words.is_empty() {
        return 0.0;
    }

    let hits = words.iter().filter(|word| terms.contains(word)).count();
    if hits == 0 {
        return 0.0;
    }
    hits as f64 * (1.0 + 1.0 / words.len() as f64)
}
