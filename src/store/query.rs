//! Filter matching, update operators, and document validation.
//!
//! Filters select documents by field path:
//!
//! - `{"name": "X"}` equality (an array field matches if any element is equal,
//!   a missing field equals `null`);
//! - `{"age": {"$gt": 3}}` with `$eq $ne $gt $gte $lt $lte $in $nin $exists`;
//! - `{"$or": [..]}` with `$and $or $nor` at the top level of a filter.
//!
//! Dotted paths (`info.foo`, `steps.3.state`) descend into nested objects and
//! array elements.
//!
//! Updates use `$set $unset $inc $push`. Plain keys in an update are treated
//! as `$set` fields, so `{"name": "Y", "$inc": {"age": 1}}` sets `name` and
//! increments `age`.

use std::cmp::Ordering;

use serde_json::{Map, Number, Value};

use crate::codec::{OPERATOR_MARKER, PATH_SEPARATOR};
use crate::document::{Document, ID_FIELD};
use crate::error::{Error, Result};

/// Checks that `name` can be used as a collection name.
pub fn validate_collection_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::invalid_argument("collection name cannot be empty"));
    }
    if name.contains(OPERATOR_MARKER) || name.contains('\0') {
        return Err(Error::invalid_argument(format!(
            "collection name {:?} contains a reserved character",
            name
        )));
    }
    Ok(())
}

/// Checks that a document can be stored as-is.
///
/// Stored keys may not start with `$` or contain `.`, and an identity may
/// not be an array.
pub fn validate_document(document: &Document) -> Result<()> {
    if let Some(Value::Array(_)) = document.get(ID_FIELD) {
        return Err(Error::invalid_document("can't use an array for _id"));
    }
    validate_keys(document)
}

fn validate_keys(map: &Map<String, Value>) -> Result<()> {
    for (key, value) in map {
        if key.starts_with(OPERATOR_MARKER) {
            return Err(Error::invalid_document(format!("key {:?} must not start with '$'", key)));
        }
        if key.contains(PATH_SEPARATOR) {
            return Err(Error::invalid_document(format!("key {:?} must not contain '.'", key)));
        }
        validate_nested(value)?;
    }
    Ok(())
}

fn validate_nested(value: &Value) -> Result<()> {
    match value {
        Value::Object(map) => validate_keys(map),
        Value::Array(items) => items.iter().try_for_each(validate_nested),
        _ => Ok(()),
    }
}

/// Returns true if `value` is an object whose keys are all operators.
pub fn is_operator_document(value: &Value) -> bool {
    match value {
        Value::Object(map) => !map.is_empty() && map.keys().all(|k| k.starts_with(OPERATOR_MARKER)),
        _ => false,
    }
}

/// Collects every value reachable at `path` inside `document`.
pub fn lookup<'a>(document: &'a Document, path: &str) -> Vec<&'a Value> {
    let segments: Vec<&str> = path.split(PATH_SEPARATOR).collect();
    let mut out = Vec::new();
    if let Some((head, rest)) = segments.split_first() {
        if let Some(value) = document.get(*head) {
            resolve(value, rest, &mut out);
        }
    }
    out
}

fn resolve<'a>(value: &'a Value, segments: &[&str], out: &mut Vec<&'a Value>) {
    let Some((head, rest)) = segments.split_first() else {
        out.push(value);
        return;
    };
    match value {
        Value::Object(map) => {
            if let Some(next) = map.get(*head) {
                resolve(next, rest, out);
            }
        }
        Value::Array(items) => {
            if let Ok(index) = head.parse::<usize>() {
                if let Some(next) = items.get(index) {
                    resolve(next, rest, out);
                }
            }
            for item in items.iter().filter(|item| item.is_object()) {
                resolve(item, segments, out);
            }
        }
        _ => {}
    }
}

/// Evaluates `filter` against `document`.
pub fn matches(document: &Document, filter: &Document) -> Result<bool> {
    for (key, condition) in filter {
        let matched = if key.starts_with(OPERATOR_MARKER) {
            match_logical(document, key, condition)?
        } else {
            match_field(&lookup(document, key), condition)?
        };
        if !matched {
            return Ok(false);
        }
    }
    Ok(true)
}

fn match_logical(document: &Document, operator: &str, operand: &Value) -> Result<bool> {
    let Value::Array(clauses) = operand else {
        return Err(Error::invalid_query(format!("{} expects an array", operator)));
    };
    let mut results = Vec::with_capacity(clauses.len());
    for clause in clauses {
        let Value::Object(clause) = clause else {
            return Err(Error::invalid_query(format!("{} clauses must be objects", operator)));
        };
        results.push(matches(document, clause)?);
    }
    match operator {
        "$and" => Ok(results.iter().all(|r| *r)),
        "$or" => Ok(results.iter().any(|r| *r)),
        "$nor" => Ok(!results.iter().any(|r| *r)),
        other => Err(Error::invalid_query(format!("unknown top-level operator {}", other))),
    }
}

fn match_field(values: &[&Value], condition: &Value) -> Result<bool> {
    if !is_operator_document(condition) {
        return Ok(equals_any(values, condition));
    }
    let Value::Object(operators) = condition else {
        return Ok(false);
    };
    for (operator, operand) in operators {
        let matched = match operator.as_str() {
            "$eq" => equals_any(values, operand),
            "$ne" => !equals_any(values, operand),
            "$gt" => compare_any(values, operand, |o| o == Ordering::Greater),
            "$gte" => compare_any(values, operand, |o| o != Ordering::Less),
            "$lt" => compare_any(values, operand, |o| o == Ordering::Less),
            "$lte" => compare_any(values, operand, |o| o != Ordering::Greater),
            "$in" => in_list(values, operand, "$in")?,
            "$nin" => !in_list(values, operand, "$nin")?,
            "$exists" => {
                let expected = operand.as_bool().ok_or_else(|| {
                    Error::invalid_query("$exists expects a boolean".to_string())
                })?;
                values.is_empty() != expected
            }
            other => return Err(Error::invalid_query(format!("unknown operator {}", other))),
        };
        if !matched {
            return Ok(false);
        }
    }
    Ok(true)
}

fn in_list(values: &[&Value], operand: &Value, operator: &str) -> Result<bool> {
    let Value::Array(candidates) = operand else {
        return Err(Error::invalid_query(format!("{} expects an array", operator)));
    };
    Ok(candidates.iter().any(|candidate| equals_any(values, candidate)))
}

fn equals_any(values: &[&Value], expected: &Value) -> bool {
    if values.is_empty() {
        return expected.is_null();
    }
    values.iter().any(|value| {
        values_equal(value, expected)
            || matches!(value, Value::Array(items) if items.iter().any(|i| values_equal(i, expected)))
    })
}

fn compare_any(values: &[&Value], operand: &Value, accept: impl Fn(Ordering) -> bool) -> bool {
    values.iter().any(|value| match value {
        Value::Array(items) if !operand.is_array() => {
            items.iter().any(|item| compare(item, operand).is_some_and(&accept))
        }
        _ => compare(value, operand).is_some_and(&accept),
    })
}

/// Structural equality that treats `1` and `1.0` as the same number.
pub fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => number_cmp(x, y) == Some(Ordering::Equal),
        (Value::Array(xs), Value::Array(ys)) => {
            xs.len() == ys.len() && xs.iter().zip(ys).all(|(x, y)| values_equal(x, y))
        }
        (Value::Object(xs), Value::Object(ys)) => {
            xs.len() == ys.len()
                && xs.iter().all(|(k, x)| ys.get(k).is_some_and(|y| values_equal(x, y)))
        }
        _ => a == b,
    }
}

/// Orders two values of the same kind. Values of different kinds are unordered.
pub fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => number_cmp(x, y),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        _ => None,
    }
}

fn number_cmp(x: &Number, y: &Number) -> Option<Ordering> {
    if let (Some(a), Some(b)) = (x.as_i64(), y.as_i64()) {
        return Some(a.cmp(&b));
    }
    x.as_f64()?.partial_cmp(&y.as_f64()?)
}

/// Folds plain keys of an update into `$set`.
///
/// `{"name": "Y", "$inc": {"age": 1}}` becomes
/// `{"$set": {"name": "Y"}, "$inc": {"age": 1}}`.
pub fn format_update(update: Document) -> Document {
    let mut formatted = Document::new();
    let mut set = Document::new();
    for (key, value) in update {
        if key.starts_with(OPERATOR_MARKER) {
            if key == "$set" {
                if let Value::Object(fields) = value {
                    set.extend(fields);
                    continue;
                }
            }
            formatted.insert(key, value);
        } else {
            set.insert(key, value);
        }
    }
    if !set.is_empty() {
        formatted.insert("$set".to_string(), Value::Object(set));
    }
    formatted
}

/// Applies an update to `document`, returning whether anything changed.
pub fn apply_update(document: &mut Document, update: &Document) -> Result<bool> {
    let before = document.clone();
    for (operator, fields) in format_update(update.clone()) {
        let Value::Object(fields) = fields else {
            return Err(Error::invalid_query(format!("{} expects an object", operator)));
        };
        for (path, operand) in fields {
            guard_identity(&before, &path, &operator, &operand)?;
            match operator.as_str() {
                "$set" => set_path(document, &path, operand)?,
                "$unset" => unset_path(document, &path),
                "$inc" => inc_path(document, &path, &operand)?,
                "$push" => push_path(document, &path, operand)?,
                other => {
                    return Err(Error::invalid_query(format!("unknown update operator {}", other)))
                }
            }
        }
    }
    Ok(!values_equal(&Value::Object(before), &Value::Object(document.clone())))
}

fn guard_identity(before: &Document, path: &str, operator: &str, operand: &Value) -> Result<()> {
    let touches_id = path == ID_FIELD || path.starts_with(&format!("{}{}", ID_FIELD, PATH_SEPARATOR));
    if !touches_id {
        return Ok(());
    }
    let unchanged = operator == "$set" && before.get(ID_FIELD).is_some_and(|id| values_equal(id, operand));
    if unchanged {
        Ok(())
    } else {
        Err(Error::invalid_document(format!(
            "update on path '{}' would modify the immutable field '_id'",
            path
        )))
    }
}

fn set_path(document: &mut Document, path: &str, value: Value) -> Result<()> {
    *slot_mut(document, path, true)?.ok_or_else(|| missing_path(path))? = value;
    Ok(())
}

fn unset_path(document: &mut Document, path: &str) {
    let (parent, leaf) = match path.rsplit_once(PATH_SEPARATOR) {
        Some((parent, leaf)) => (Some(parent), leaf),
        None => (None, path),
    };
    let container = match parent {
        None => {
            document.remove(leaf);
            return;
        }
        Some(parent) => match slot_mut(document, parent, false) {
            Ok(Some(container)) => container,
            _ => return,
        },
    };
    match container {
        Value::Object(map) => {
            map.remove(leaf);
        }
        Value::Array(items) => {
            if let Some(item) = leaf.parse::<usize>().ok().and_then(|i| items.get_mut(i)) {
                *item = Value::Null;
            }
        }
        _ => {}
    }
}

fn inc_path(document: &mut Document, path: &str, amount: &Value) -> Result<()> {
    let Value::Number(amount) = amount else {
        return Err(Error::invalid_query(format!("$inc on '{}' needs a numeric amount", path)));
    };
    let slot = slot_mut(document, path, true)?.ok_or_else(|| missing_path(path))?;
    let sum = match slot {
        Value::Null => Value::Number(amount.clone()),
        Value::Number(current) => add_numbers(current, amount)?,
        other => {
            return Err(Error::invalid_document(format!(
                "cannot apply $inc to '{}' of non-numeric type {}",
                path,
                crate::document::kind_name(other)
            )))
        }
    };
    *slot = sum;
    Ok(())
}

fn add_numbers(a: &Number, b: &Number) -> Result<Value> {
    if let (Some(x), Some(y)) = (a.as_i64(), b.as_i64()) {
        if let Some(sum) = x.checked_add(y) {
            return Ok(Value::from(sum));
        }
    }
    let sum = a.as_f64().unwrap_or_default() + b.as_f64().unwrap_or_default();
    Number::from_f64(sum)
        .map(Value::Number)
        .ok_or_else(|| Error::invalid_document("$inc produced a non-finite number"))
}

fn push_path(document: &mut Document, path: &str, value: Value) -> Result<()> {
    let slot = slot_mut(document, path, true)?.ok_or_else(|| missing_path(path))?;
    match slot {
        Value::Null => *slot = Value::Array(vec![value]),
        Value::Array(items) => items.push(value),
        other => {
            return Err(Error::invalid_document(format!(
                "cannot $push to '{}' of type {}",
                path,
                crate::document::kind_name(other)
            )))
        }
    }
    Ok(())
}

fn missing_path(path: &str) -> Error {
    Error::invalid_document(format!("cannot create field at path '{}'", path))
}

/// Finds the value slot at `path`. With `create`, missing object fields are
/// created as `null` and missing intermediate objects are created empty.
fn slot_mut<'a>(document: &'a mut Document, path: &str, create: bool) -> Result<Option<&'a mut Value>> {
    let mut segments = path.split(PATH_SEPARATOR);
    let head = segments.next().unwrap_or(path);
    if head.is_empty() {
        return Err(Error::invalid_query("empty field path".to_string()));
    }
    let mut current = if create {
        document.entry(head.to_string()).or_insert(Value::Null)
    } else {
        match document.get_mut(head) {
            Some(value) => value,
            None => return Ok(None),
        }
    };
    for segment in segments {
        if segment.is_empty() {
            return Err(Error::invalid_query(format!("empty segment in path '{}'", path)));
        }
        if create && current.is_null() {
            *current = Value::Object(Map::new());
        }
        current = match current {
            Value::Object(map) => {
                if create {
                    map.entry(segment.to_string()).or_insert(Value::Null)
                } else {
                    match map.get_mut(segment) {
                        Some(value) => value,
                        None => return Ok(None),
                    }
                }
            }
            Value::Array(items) => {
                let index = segment.parse::<usize>().map_err(|_| {
                    Error::invalid_document(format!("'{}' is not an array index in '{}'", segment, path))
                })?;
                if create && index == items.len() {
                    items.push(Value::Null);
                }
                match items.get_mut(index) {
                    Some(value) => value,
                    None if create => {
                        return Err(Error::invalid_document(format!(
                            "array index {} out of range in '{}'",
                            index, path
                        )))
                    }
                    None => return Ok(None),
                }
            }
            _ if create => {
                return Err(Error::invalid_document(format!(
                    "cannot create field '{}' inside a scalar in '{}'",
                    segment, path
                )))
            }
            _ => return Ok(None),
        };
    }
    Ok(Some(current))
}
