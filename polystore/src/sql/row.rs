//! Bridge between entities and dynamically-typed rows.
//!
//! Entities serialize to a JSON object whose keys are the column names;
//! rows decode back into a JSON object driven by the column's declared
//! type. Nested objects/arrays are stored as JSON text and re-parsed on
//! the way out.

use serde_json::{Map, Value};
use sqlx::any::{AnyArguments, AnyRow};
use sqlx::query::Query;
use sqlx::{Any, Column, Row, TypeInfo};

use polystore_core::{DalResult, DataAccessError, Entity};

/// Serialize an entity into its column map.
pub fn entity_row<E: Entity>(entity: &E) -> DalResult<Map<String, Value>> {
    match serde_json::to_value(entity) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err(DataAccessError::validation(format!(
            "{} does not serialize to a flat record",
            E::type_name()
        ))),
        Err(err) => Err(DataAccessError::validation(format!(
            "{} failed to serialize: {err}",
            E::type_name()
        ))),
    }
}

/// Serialize a key to the value bound for the identity column.
pub fn key_value<E: Entity>(id: &E::Key) -> DalResult<Value> {
    serde_json::to_value(id)
        .map_err(|err| DataAccessError::validation(format!("key failed to serialize: {err}")))
}

/// Bind one JSON value onto a query. Scalars bind natively; anything
/// nested binds as JSON text.
pub fn bind_value<'q>(
    query: Query<'q, Any, AnyArguments<'q>>,
    value: &Value,
) -> Query<'q, Any, AnyArguments<'q>> {
    match value {
        Value::Null => query.bind(Option::<String>::None),
        Value::Bool(b) => query.bind(*b),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                query.bind(i)
            } else {
                query.bind(n.as_f64().unwrap_or(f64::NAN))
            }
        }
        Value::String(s) => query.bind(s.clone()),
        nested => query.bind(nested.to_string()),
    }
}

/// Bind a parameter list in order.
pub fn bind_values<'q>(
    mut query: Query<'q, Any, AnyArguments<'q>>,
    values: &[Value],
) -> Query<'q, Any, AnyArguments<'q>> {
    for value in values {
        query = bind_value(query, value);
    }
    query
}

/// Decode a row into a JSON object keyed by column name.
pub fn row_to_json(row: &AnyRow) -> DalResult<Map<String, Value>> {
    let mut map = Map::with_capacity(row.columns().len());
    for (index, column) in row.columns().iter().enumerate() {
        let value = decode_column(row, index, column.type_info().name())?;
        map.insert(column.name().to_string(), value);
    }
    Ok(map)
}

fn decode_column(row: &AnyRow, index: usize, type_name: &str) -> DalResult<Value> {
    let upper = type_name.to_uppercase();

    if upper.contains("BOOL") {
        // SQLite reports BOOLEAN but stores integers; fall through the
        // likely representations.
        if let Ok(v) = row.try_get::<Option<bool>, _>(index) {
            return Ok(v.map(Value::Bool).unwrap_or(Value::Null));
        }
        if let Ok(v) = row.try_get::<Option<i64>, _>(index) {
            return Ok(v.map(|i| Value::Bool(i != 0)).unwrap_or(Value::Null));
        }
    }

    if upper.contains("INT") {
        if let Ok(v) = row.try_get::<Option<i64>, _>(index) {
            return Ok(v.map(Value::from).unwrap_or(Value::Null));
        }
    }

    if ["REAL", "DOUBLE", "FLOAT", "NUMERIC", "DECIMAL"]
        .iter()
        .any(|t| upper.contains(t))
    {
        if let Ok(v) = row.try_get::<Option<f64>, _>(index) {
            return Ok(v.map(Value::from).unwrap_or(Value::Null));
        }
    }

    if ["BLOB", "BYTEA", "BINARY"].iter().any(|t| upper.contains(t)) {
        if let Ok(v) = row.try_get::<Option<Vec<u8>>, _>(index) {
            return Ok(v
                .map(|bytes| Value::Array(bytes.into_iter().map(Value::from).collect()))
                .unwrap_or(Value::Null));
        }
    }

    // Text and anything the checks above did not claim.
    if let Ok(v) = row.try_get::<Option<String>, _>(index) {
        return Ok(v.map(Value::String).unwrap_or(Value::Null));
    }
    if let Ok(v) = row.try_get::<Option<i64>, _>(index) {
        return Ok(v.map(Value::from).unwrap_or(Value::Null));
    }
    if let Ok(v) = row.try_get::<Option<f64>, _>(index) {
        return Ok(v.map(Value::from).unwrap_or(Value::Null));
    }

    Err(DataAccessError::backend_msg(
        "decode_row",
        format!("unsupported column type '{type_name}' at index {index}"),
    ))
}

/// Decode a row into an entity, tolerating nested values stored as JSON
/// text.
pub fn entity_from_row<E: Entity>(row: &AnyRow) -> DalResult<E> {
    let map = row_to_json(row)?;
    match serde_json::from_value::<E>(Value::Object(map.clone())) {
        Ok(entity) => Ok(entity),
        Err(first_err) => {
            let coerced = reparse_embedded_json(map);
            serde_json::from_value::<E>(Value::Object(coerced)).map_err(|_| {
                DataAccessError::backend_msg(
                    "decode_row",
                    format!("row does not match {}: {first_err}", E::type_name()),
                )
            })
        }
    }
}

/// Re-parse string cells that hold serialized JSON objects/arrays.
fn reparse_embedded_json(map: Map<String, Value>) -> Map<String, Value> {
    map.into_iter()
        .map(|(key, value)| {
            let value = match &value {
                Value::String(s)
                    if (s.starts_with('{') && s.ends_with('}'))
                        || (s.starts_with('[') && s.ends_with(']')) =>
                {
                    serde_json::from_str(s).unwrap_or(value)
                }
                _ => value,
            };
            (key, value)
        })
        .collect()
}
