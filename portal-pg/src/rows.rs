//! Conversion between entity JSON and table rows.

use crate::model::{Column, ColumnKind, Entity};
use crate::sql::SqlParam;
use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use portal_core::{stamp_change, DaoError, DaoResult, JsonMap};
use serde_json::Value as JsonValue;
use tokio_postgres::types::Type;
use tokio_postgres::Row;

/// Entity data split into `id`, promoted column values and the `data` blob.
#[derive(Debug, Clone, PartialEq)]
pub struct PgRow {
    pub id: String,
    pub columns: Vec<SqlParam>,
    pub data: JsonMap,
}

impl PgRow {
    /// Parameters in the order expected by the upsert statement.
    pub fn into_params(self) -> Vec<SqlParam> {
        let mut params = Vec::with_capacity(self.columns.len() + 2);
        params.push(SqlParam::Text(self.id));
        params.extend(self.columns);
        params.push(SqlParam::Json(JsonValue::Object(self.data)));
        params
    }
}

fn is_missing(value: Option<&JsonValue>) -> bool {
    match value {
        None | Some(JsonValue::Null) => true,
        Some(JsonValue::String(s)) => s.is_empty(),
        Some(_) => false,
    }
}

fn column_param(column: &Column, value: Option<&JsonValue>) -> SqlParam {
    let value = value.filter(|v| !v.is_null());
    match column.kind {
        ColumnKind::Text => SqlParam::OptText(value.map(|v| match v {
            JsonValue::String(s) => s.clone(),
            other => other.to_string(),
        })),
        ColumnKind::BigInt => SqlParam::OptLong(value.and_then(|v| match v {
            JsonValue::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
            JsonValue::String(s) => s.trim().parse().ok(),
            _ => None,
        })),
    }
}

/// Split entity JSON into a table row.
///
/// Stamps `changedDate`, sets or removes `changedBy` and moves promoted
/// properties out of `data` into their columns.
pub fn postgresize_row(
    entity: Entity,
    mut data: JsonMap,
    upserting_user_id: Option<&str>,
) -> DaoResult<PgRow> {
    let id = match data.remove("id") {
        Some(JsonValue::String(id)) if !id.is_empty() => id,
        Some(JsonValue::Number(n)) => n.to_string(),
        _ => {
            return Err(DaoError::internal(format!(
                "Missing unique index \"id\" for entity {}.",
                entity
            )))
        }
    };
    stamp_change(&mut data, upserting_user_id);

    let mut columns = Vec::with_capacity(entity.columns().len());
    for column in entity.columns() {
        let value = data.remove(column.property);
        if !column.optional && is_missing(value.as_ref()) {
            return Err(DaoError::internal(format!(
                "Missing mandatory property {} for entity {}",
                column.property, entity
            )));
        }
        columns.push(column_param(column, value.as_ref()));
    }

    Ok(PgRow { id, columns, data })
}

/// Merge raw row values back into entity JSON.
///
/// `data` is the base; `id` and promoted columns are added under their
/// property names, and any further columns (from joins) under their column
/// names. Null values are left out.
pub fn normalize_values(
    entity: Entity,
    values: Vec<(String, JsonValue)>,
) -> DaoResult<JsonMap> {
    let mut out = JsonMap::new();
    let mut rest = Vec::with_capacity(values.len());
    for (name, value) in values {
        if name == "data" {
            if let JsonValue::Object(map) = value {
                for (k, v) in map {
                    out.insert(k, v);
                }
            }
        } else {
            rest.push((name, value));
        }
    }

    let id = rest
        .iter()
        .find(|(name, _)| name == "id")
        .map(|(_, v)| v.clone())
        .unwrap_or(JsonValue::Null);
    let id_text = match &id {
        JsonValue::String(s) => s.clone(),
        other => other.to_string(),
    };

    for (name, value) in rest {
        if name == "id" {
            out.insert("id".to_string(), value);
            continue;
        }
        match entity.column(&name) {
            Some(column) => {
                if !column.optional && is_missing(Some(&value)) {
                    return Err(DaoError::internal(format!(
                        "Row with id {} of entity {} is empty but is not optional.",
                        id_text, entity
                    )));
                }
                if !value.is_null() {
                    out.insert(column.property.to_string(), value);
                }
            }
            None => {
                if !value.is_null() {
                    out.insert(name, value);
                }
            }
        }
    }
    Ok(out)
}

fn format_timestamp(ts: DateTime<Utc>) -> JsonValue {
    JsonValue::String(ts.to_rfc3339_opts(SecondsFormat::Millis, true))
}

/// Read one column of a result row as JSON.
fn column_value(row: &Row, idx: usize) -> DaoResult<JsonValue> {
    let ty = row.columns()[idx].type_().clone();
    let value = if ty == Type::TEXT || ty == Type::VARCHAR || ty == Type::BPCHAR || ty == Type::NAME
    {
        row.try_get::<_, Option<String>>(idx)
            .map(|v| v.map(JsonValue::String))
    } else if ty == Type::INT8 {
        row.try_get::<_, Option<i64>>(idx).map(|v| v.map(JsonValue::from))
    } else if ty == Type::INT4 {
        row.try_get::<_, Option<i32>>(idx).map(|v| v.map(JsonValue::from))
    } else if ty == Type::INT2 {
        row.try_get::<_, Option<i16>>(idx).map(|v| v.map(JsonValue::from))
    } else if ty == Type::BOOL {
        row.try_get::<_, Option<bool>>(idx).map(|v| v.map(JsonValue::Bool))
    } else if ty == Type::FLOAT8 {
        row.try_get::<_, Option<f64>>(idx).map(|v| v.map(JsonValue::from))
    } else if ty == Type::JSONB || ty == Type::JSON {
        row.try_get::<_, Option<JsonValue>>(idx)
    } else if ty == Type::TIMESTAMPTZ {
        row.try_get::<_, Option<DateTime<Utc>>>(idx)
            .map(|v| v.map(format_timestamp))
    } else if ty == Type::TIMESTAMP {
        row.try_get::<_, Option<NaiveDateTime>>(idx)
            .map(|v| v.map(|ts| format_timestamp(ts.and_utc())))
    } else {
        return Err(DaoError::internal(format!(
            "Unsupported column type {} of column {}",
            ty,
            row.columns()[idx].name()
        )));
    };
    value
        .map(|v| v.unwrap_or(JsonValue::Null))
        .map_err(|e| DaoError::internal(format!("normalizeResult failed: {}", e)))
}

/// Turn a result row into entity JSON.
pub fn normalize_row(entity: Entity, row: &Row) -> DaoResult<JsonMap> {
    let mut values = Vec::with_capacity(row.len());
    for (idx, column) in row.columns().iter().enumerate() {
        values.push((column.name().to_string(), column_value(row, idx)?));
    }
    normalize_values(entity, values)
}
