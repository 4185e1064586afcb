//! SQL construction for the generic query engine.
//!
//! Everything here is pure: statements are assembled from the entity model,
//! a list of criteria and the paging options, with all values bound as
//! positional parameters. Names that end up in statement text are checked
//! against a strict identifier pattern first.

use crate::model::Entity;
use chrono::{DateTime, NaiveDate, Utc};
use once_cell::sync::Lazy;
use portal_core::{DaoError, DaoResult, FilterValue, OrderBy};
use regex::Regex;
use serde_json::{json, Value as JsonValue};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use tokio_postgres::types::ToSql;

/// Schema holding every portal table.
pub const SCHEMA: &str = "wicked";

static IDENTIFIER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("static identifier pattern")
});

static QUALIFIED_IDENTIFIER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*\.[A-Za-z_][A-Za-z0-9_]*$")
        .expect("static qualified identifier pattern")
});

/// True for plain SQL identifiers such as table, column or channel names.
pub fn is_identifier(name: &str) -> bool {
    IDENTIFIER.is_match(name)
}

fn check_identifier(name: &str) -> DaoResult<()> {
    if is_identifier(name) || QUALIFIED_IDENTIFIER.is_match(name) {
        Ok(())
    } else {
        Err(DaoError::config(format!("Invalid field name '{}'", name)))
    }
}

// ============================================================================
// PARAMETERS
// ============================================================================

/// A bound statement parameter.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlParam {
    Text(String),
    OptText(Option<String>),
    Int(i32),
    Long(i64),
    OptLong(Option<i64>),
    Json(JsonValue),
    Timestamp(DateTime<Utc>),
}

impl SqlParam {
    /// Reference usable as a tokio_postgres statement parameter.
    pub fn as_to_sql(&self) -> &(dyn ToSql + Sync) {
        match self {
            SqlParam::Text(v) => v,
            SqlParam::OptText(v) => v,
            SqlParam::Int(v) => v,
            SqlParam::Long(v) => v,
            SqlParam::OptLong(v) => v,
            SqlParam::Json(v) => v,
            SqlParam::Timestamp(v) => v,
        }
    }

    /// JSON rendering, used to key the count cache.
    pub fn to_json(&self) -> JsonValue {
        match self {
            SqlParam::Text(v) => json!(v),
            SqlParam::OptText(v) => json!(v),
            SqlParam::Int(v) => json!(v),
            SqlParam::Long(v) => json!(v),
            SqlParam::OptLong(v) => json!(v),
            SqlParam::Json(v) => v.clone(),
            SqlParam::Timestamp(v) => json!(v.to_rfc3339()),
        }
    }
}

impl From<&str> for SqlParam {
    fn from(v: &str) -> Self {
        SqlParam::Text(v.to_string())
    }
}

impl From<String> for SqlParam {
    fn from(v: String) -> Self {
        SqlParam::Text(v)
    }
}

impl From<&String> for SqlParam {
    fn from(v: &String) -> Self {
        SqlParam::Text(v.clone())
    }
}

impl From<i64> for SqlParam {
    fn from(v: i64) -> Self {
        SqlParam::Long(v)
    }
}

impl From<DateTime<Utc>> for SqlParam {
    fn from(v: DateTime<Utc>) -> Self {
        SqlParam::Timestamp(v)
    }
}

/// Parameter references for a statement call.
pub fn param_refs(params: &[SqlParam]) -> Vec<&(dyn ToSql + Sync)> {
    params.iter().map(SqlParam::as_to_sql).collect()
}

// ============================================================================
// CRITERIA
// ============================================================================

/// Comparison operator of a criterion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Eq,
    NotEq,
    Lt,
    Le,
    Gt,
    Ge,
    Like,
    ILike,
    SimilarTo,
}

impl Op {
    pub fn as_sql(&self) -> &'static str {
        match self {
            Op::Eq => "=",
            Op::NotEq => "!=",
            Op::Lt => "<",
            Op::Le => "<=",
            Op::Gt => ">",
            Op::Ge => ">=",
            Op::Like => "LIKE",
            Op::ILike => "ILIKE",
            Op::SimilarTo => "SIMILAR TO",
        }
    }
}

/// Conditions of a query, joined with `AND`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Criteria {
    pub fields: Vec<String>,
    pub ops: Vec<Op>,
    pub values: Vec<SqlParam>,
}

impl Criteria {
    pub fn new() -> Self {
        Self::default()
    }

    /// Single equality criterion.
    pub fn by(field: &str, value: impl Into<SqlParam>) -> Self {
        Self::new().and(field, Op::Eq, value)
    }

    pub fn and(mut self, field: &str, op: Op, value: impl Into<SqlParam>) -> Self {
        self.push(field, op, value.into());
        self
    }

    pub fn and_eq(self, field: &str, value: impl Into<SqlParam>) -> Self {
        self.and(field, Op::Eq, value)
    }

    pub fn push(&mut self, field: &str, op: Op, value: SqlParam) {
        self.fields.push(field.to_string());
        self.ops.push(op);
        self.values.push(value);
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// List filters: alternatives become `SIMILAR TO '(a|b)'`, plain text an
    /// `ILIKE '%v%'` match. Empty filter values are skipped.
    pub fn add_filter_options(&mut self, filter: &BTreeMap<String, FilterValue>) {
        for (field, value) in filter {
            match value {
                FilterValue::AnyOf(alternatives) => {
                    let alternatives: Vec<&str> = alternatives
                        .iter()
                        .map(String::as_str)
                        .filter(|a| !a.is_empty())
                        .collect();
                    if alternatives.is_empty() {
                        continue;
                    }
                    let pattern = format!("({})", alternatives.join("|"));
                    self.push(field, Op::SimilarTo, SqlParam::Text(pattern));
                }
                FilterValue::Text(text) => {
                    if text.is_empty() {
                        continue;
                    }
                    self.push(field, Op::ILike, SqlParam::Text(format!("%{}%", text)));
                }
            }
        }
    }

    /// Take `startdate` and `enddate` out of `filter` and bound `field` by
    /// them: `>= startdate`, `< enddate`.
    pub fn add_date_time_filter_options(
        &mut self,
        field: &str,
        filter: &mut BTreeMap<String, FilterValue>,
    ) -> DaoResult<()> {
        if let Some(start) = filter.remove("startdate") {
            if let Some(ts) = parse_filter_date(&start)? {
                self.push(field, Op::Ge, SqlParam::Timestamp(ts));
            }
        }
        if let Some(end) = filter.remove("enddate") {
            if let Some(ts) = parse_filter_date(&end)? {
                self.push(field, Op::Lt, SqlParam::Timestamp(ts));
            }
        }
        Ok(())
    }
}

/// Accepts RFC 3339 timestamps and plain `YYYY-MM-DD` dates (midnight UTC).
fn parse_filter_date(value: &FilterValue) -> DaoResult<Option<DateTime<Utc>>> {
    let text = match value {
        FilterValue::Text(t) => t.trim(),
        FilterValue::AnyOf(_) => {
            return Err(DaoError::config("date filters take a single value"));
        }
    };
    if text.is_empty() {
        return Ok(None);
    }
    if let Ok(ts) = DateTime::parse_from_rfc3339(text) {
        return Ok(Some(ts.with_timezone(&Utc)));
    }
    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| Some(dt.and_utc()))
        .ok_or_else(|| DaoError::config(format!("Invalid date filter value '{}'", text)))
}

// ============================================================================
// JOINS
// ============================================================================

/// Column pulled in from a joined table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JoinedField {
    /// Expression selected, e.g. `b.users_id` or `b.data->>'email'`.
    pub source: &'static str,
    /// Output column name.
    pub as_name: Option<&'static str>,
    /// JSON name callers may filter and order by.
    pub alias: Option<&'static str>,
}

impl JoinedField {
    pub const fn new(source: &'static str, as_name: &'static str, alias: &'static str) -> Self {
        Self {
            source,
            as_name: Some(as_name),
            alias: Some(alias),
        }
    }
}

/// Extra columns of an entity listing, optionally from joined tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Join {
    /// Clause following `FROM wicked.<table> a`. With a clause the main
    /// table is aliased `a`; without one the fields are computed from the
    /// main table alone.
    pub clause: Option<&'static str>,
    pub fields: &'static [JoinedField],
}

// ============================================================================
// FIELD RESOLUTION
// ============================================================================

/// Map a caller-facing field name onto an SQL expression.
///
/// `id` is always a column. A qualified `x.y` passes through when a join is
/// active. Column names and promoted JSON properties map to their column,
/// joined fields to their source, and anything else is looked up in `data`.
pub fn resolve_field_name(
    entity: Entity,
    prefix: &str,
    field: &str,
    joined: &[JoinedField],
) -> DaoResult<String> {
    check_identifier(field)?;
    if field == "id" {
        return Ok(format!("{}id", prefix));
    }
    if !prefix.is_empty() && field.contains('.') {
        return Ok(field.to_string());
    }
    if let Some(col) = entity.column(field) {
        return Ok(format!("{}{}", prefix, col.name));
    }
    if let Some(col) = entity.column_for_property(field) {
        return Ok(format!("{}{}", prefix, col.name));
    }
    if let Some(jf) = joined
        .iter()
        .find(|jf| jf.source == field || jf.as_name == Some(field) || jf.alias == Some(field))
    {
        return Ok(jf.source.to_string());
    }
    if field.contains('.') {
        return Err(DaoError::config(format!("Invalid field name '{}'", field)));
    }
    Ok(format!("{}data->>'{}'", prefix, field))
}

// ============================================================================
// STATEMENTS
// ============================================================================

/// Row query and its matching count query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqlQuery {
    pub query: String,
    pub count_query: String,
}

/// Shape of a `SELECT` beyond its criteria.
#[derive(Debug, Clone, Copy, Default)]
pub struct SelectShape<'a> {
    pub order_by: Option<&'a str>,
    pub offset: usize,
    /// Zero means no limit.
    pub limit: usize,
    pub join: Option<&'a Join>,
}

pub fn make_sql_query(
    entity: Entity,
    fields: &[String],
    ops: &[Op],
    shape: &SelectShape<'_>,
) -> DaoResult<SqlQuery> {
    if fields.len() != ops.len() {
        return Err(DaoError::internal(format!(
            "Querying {}: Length of operators array does not match field names array.",
            entity
        )));
    }
    let (prefix, alias, join_clause, joined): (&str, &str, &str, &[JoinedField]) = match shape.join
    {
        Some(Join {
            clause: Some(clause),
            fields,
        }) => ("a.", " a", clause, fields),
        Some(Join {
            clause: None,
            fields,
        }) => ("", "", "", fields),
        None => ("", "", "", &[]),
    };

    let mut additional = String::new();
    for jf in joined {
        additional.push_str(", ");
        additional.push_str(jf.source);
        if let Some(as_name) = jf.as_name {
            additional.push_str(" AS ");
            additional.push_str(as_name);
        }
    }

    let from = if join_clause.is_empty() {
        format!("FROM {}.{}{}", SCHEMA, entity.table(), alias)
    } else {
        format!("FROM {}.{}{} {}", SCHEMA, entity.table(), alias, join_clause)
    };

    let mut query = format!("SELECT {}*{} {}", prefix, additional, from);
    let mut count_query = format!("SELECT COUNT(*) AS count {}", from);

    let mut where_clause = String::new();
    for (i, (field, op)) in fields.iter().zip(ops).enumerate() {
        let resolved = resolve_field_name(entity, prefix, field, joined)?;
        let keyword = if i == 0 { "WHERE" } else { "AND" };
        where_clause.push_str(&format!(" {} {} {} ${}", keyword, resolved, op.as_sql(), i + 1));
    }
    count_query.push_str(&where_clause);
    query.push_str(&where_clause);

    if let Some(clause) = shape.order_by.filter(|o| !o.trim().is_empty()) {
        let order = OrderBy::parse(clause)?;
        let field = resolve_field_name(entity, prefix, &order.field, joined)?;
        query.push_str(&format!(" ORDER BY {} {}", field, order.direction()));
    }
    if shape.limit > 0 {
        query.push_str(&format!(" LIMIT {} OFFSET {}", shape.limit, shape.offset));
    }

    Ok(SqlQuery { query, count_query })
}

/// `INSERT .. ON CONFLICT (id) DO UPDATE` over `id`, the promoted columns
/// and `data`, in that parameter order.
pub fn make_upsert(entity: Entity) -> String {
    let mut names = vec!["id"];
    names.extend(entity.columns().iter().map(|c| c.name));
    names.push("data");

    let placeholders: Vec<String> = (1..=names.len()).map(|i| format!("${}", i)).collect();
    let updates: Vec<String> = names
        .iter()
        .enumerate()
        .skip(1)
        .map(|(i, name)| format!("{} = ${}", name, i + 1))
        .collect();

    format!(
        "INSERT INTO {}.{} ({}) VALUES ({}) ON CONFLICT (id) DO UPDATE SET {}",
        SCHEMA,
        entity.table(),
        names.join(", "),
        placeholders.join(", "),
        updates.join(", ")
    )
}

/// `DELETE` matching every field by equality.
pub fn make_delete(entity: Entity, fields: &[String]) -> DaoResult<String> {
    if fields.is_empty() {
        return Err(DaoError::internal(
            "deleteBy: Unconditional DELETE detected, not allowing",
        ));
    }
    let mut sql = format!("DELETE FROM {}.{}", SCHEMA, entity.table());
    for (i, field) in fields.iter().enumerate() {
        let keyword = if i == 0 { "WHERE" } else { "AND" };
        let resolved = resolve_field_name(entity, "", field, &[])?;
        sql.push_str(&format!(" {} {} = ${}", keyword, resolved, i + 1));
    }
    Ok(sql)
}

/// `DELETE` of rows whose `field` lies before `$1`, optionally narrowed by a
/// fixed extra condition.
pub fn make_delete_before(
    entity: Entity,
    field: &str,
    additional_condition: Option<&str>,
) -> DaoResult<String> {
    if field.is_empty() {
        return Err(DaoError::internal(
            "deleteBefore: Unconditional DELETE detected, not allowing",
        ));
    }
    let resolved = resolve_field_name(entity, "", field, &[])?;
    let mut sql = format!(
        "DELETE FROM {}.{} WHERE {} < $1",
        SCHEMA,
        entity.table(),
        resolved
    );
    if let Some(condition) = additional_condition {
        sql.push_str(" AND ");
        sql.push_str(condition);
    }
    Ok(sql)
}

pub fn make_count(entity: Entity) -> String {
    format!("SELECT COUNT(*) AS count FROM {}.{}", SCHEMA, entity.table())
}

/// Count cache key: SHA-256 over `{query, fieldValues}`.
pub fn count_cache_key(count_query: &str, values: &[SqlParam]) -> String {
    let field_values: Vec<JsonValue> = values.iter().map(SqlParam::to_json).collect();
    let key = json!({ "query": count_query, "fieldValues": field_values });
    hex::encode(Sha256::digest(key.to_string().as_bytes()))
}

// ============================================================================
// SCRIPTS
// ============================================================================

/// Split a script into single statements.
///
/// Lines starting with `--` are dropped. A statement ends at a line ending
/// in `;`, except inside a `$$` body, which ends at a line ending in `$$;`.
pub fn split_sql_commands(script: &str) -> Vec<String> {
    let mut commands = Vec::new();
    let mut current = String::new();
    let mut in_dollar_quote = false;

    for line in script.lines() {
        let line = line.trim();
        if line.starts_with("--") {
            continue;
        }
        if !in_dollar_quote && line.contains("$$") {
            in_dollar_quote = true;
        }
        if !current.is_empty() {
            current.push(' ');
        }
        current.push_str(line);

        let done = if in_dollar_quote {
            line.ends_with("$$;")
        } else {
            line.ends_with(';')
        };
        if done {
            in_dollar_quote = false;
            commands.push(std::mem::take(&mut current).trim().to_string());
        }
    }
    commands
}

#[cfg(test)]
mod tests {
    use super::*;

    const OWNER_JOIN: Join = Join {
        clause: Some("LEFT JOIN wicked.owners b ON b.applications_id = a.id"),
        fields: &[
            JoinedField::new("b.users_id", "owner_user_id", "ownerUserId"),
            JoinedField::new("b.data->>'email'", "owner_email", "ownerEmail"),
        ],
    };

    fn fields(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_plain_query() {
        let q = make_sql_query(
            Entity::Users,
            &fields(&["id"]),
            &[Op::Eq],
            &SelectShape::default(),
        )
        .unwrap();
        assert_eq!(q.query, "SELECT * FROM wicked.users WHERE id = $1");
        assert_eq!(q.count_query, "SELECT COUNT(*) AS count FROM wicked.users WHERE id = $1");
    }

    #[test]
    fn test_property_and_data_fields_resolve() {
        let q = make_sql_query(
            Entity::Subscriptions,
            &fields(&["clientId", "application", "trusted"]),
            &[Op::Eq, Op::Eq, Op::ILike],
            &SelectShape::default(),
        )
        .unwrap();
        assert_eq!(
            q.query,
            "SELECT * FROM wicked.subscriptions WHERE client_id = $1 AND applications_id = $2 AND data->>'trusted' ILIKE $3"
        );
    }

    #[test]
    fn test_joined_query_with_order_and_paging() {
        let shape = SelectShape {
            order_by: Some("ownerEmail DESC"),
            offset: 20,
            limit: 10,
            join: Some(&OWNER_JOIN),
        };
        let q = make_sql_query(Entity::Applications, &fields(&["name"]), &[Op::ILike], &shape)
            .unwrap();
        assert_eq!(
            q.query,
            "SELECT a.*, b.users_id AS owner_user_id, b.data->>'email' AS owner_email \
             FROM wicked.applications a LEFT JOIN wicked.owners b ON b.applications_id = a.id \
             WHERE a.data->>'name' ILIKE $1 ORDER BY b.data->>'email' DESC LIMIT 10 OFFSET 20"
        );
        assert_eq!(
            q.count_query,
            "SELECT COUNT(*) AS count FROM wicked.applications a \
             LEFT JOIN wicked.owners b ON b.applications_id = a.id WHERE a.data->>'name' ILIKE $1"
        );
    }

    #[test]
    fn test_qualified_field_passes_through_with_join() {
        let shape = SelectShape {
            join: Some(&OWNER_JOIN),
            ..Default::default()
        };
        let q = make_sql_query(Entity::Applications, &fields(&["b.role"]), &[Op::Eq], &shape)
            .unwrap();
        assert!(q.query.ends_with("WHERE b.role = $1"));
        assert!(resolve_field_name(Entity::Applications, "", "b.role", &[]).is_err());
    }

    #[test]
    fn test_computed_fields_without_join_clause() {
        const COMPUTED: Join = Join {
            clause: None,
            fields: &[
                JoinedField::new("CONCAT(data->>'action', ' ', data->>'entity')", "activity", "activity"),
                JoinedField::new("created_at", "created_at", "created_at"),
            ],
        };
        let shape = SelectShape {
            order_by: Some("created_at DESC"),
            join: Some(&COMPUTED),
            ..Default::default()
        };
        let q = make_sql_query(Entity::AuditLog, &fields(&["activity"]), &[Op::ILike], &shape)
            .unwrap();
        assert_eq!(
            q.query,
            "SELECT *, CONCAT(data->>'action', ' ', data->>'entity') AS activity, created_at AS created_at \
             FROM wicked.audit_log WHERE CONCAT(data->>'action', ' ', data->>'entity') ILIKE $1 \
             ORDER BY created_at DESC"
        );
    }

    #[test]
    fn test_order_without_limit_has_no_paging() {
        let shape = SelectShape {
            order_by: Some("email"),
            offset: 5,
            ..Default::default()
        };
        let q = make_sql_query(Entity::Users, &[], &[], &shape).unwrap();
        assert_eq!(q.query, "SELECT * FROM wicked.users ORDER BY email ASC");
    }

    #[test]
    fn test_operator_count_must_match() {
        let err = make_sql_query(Entity::Users, &fields(&["id"]), &[], &SelectShape::default())
            .unwrap_err();
        assert_eq!(err.status_code(), 500);
    }

    #[test]
    fn test_injection_in_field_name_rejected() {
        let err = resolve_field_name(Entity::Users, "", "x' OR '1'='1", &[]).unwrap_err();
        assert_eq!(err.status_code(), 400);
        assert!(make_sql_query(
            Entity::Users,
            &[],
            &[],
            &SelectShape {
                order_by: Some("email; DROP TABLE x"),
                ..Default::default()
            }
        )
        .is_err());
    }

    #[test]
    fn test_filter_options() {
        let mut filter = BTreeMap::new();
        filter.insert("name".to_string(), FilterValue::Text("shop".into()));
        filter.insert(
            "plan".to_string(),
            FilterValue::AnyOf(vec!["basic".into(), "".into(), "gold".into()]),
        );
        filter.insert("empty".to_string(), FilterValue::Text(String::new()));
        let mut criteria = Criteria::new();
        criteria.add_filter_options(&filter);
        assert_eq!(criteria.fields, fields(&["name", "plan"]));
        assert_eq!(criteria.ops, vec![Op::ILike, Op::SimilarTo]);
        assert_eq!(
            criteria.values,
            vec![
                SqlParam::Text("%shop%".into()),
                SqlParam::Text("(basic|gold)".into())
            ]
        );
    }

    #[test]
    fn test_date_filters_are_removed_and_typed() {
        let mut filter = BTreeMap::new();
        filter.insert("startdate".to_string(), FilterValue::Text("2024-01-01".into()));
        filter.insert(
            "enddate".to_string(),
            FilterValue::Text("2024-02-01T12:00:00Z".into()),
        );
        filter.insert("action".to_string(), FilterValue::Text("add".into()));
        let mut criteria = Criteria::new();
        criteria
            .add_date_time_filter_options("a.created_at", &mut filter)
            .unwrap();
        assert_eq!(filter.len(), 1);
        assert_eq!(criteria.ops, vec![Op::Ge, Op::Lt]);
        match &criteria.values[0] {
            SqlParam::Timestamp(ts) => assert_eq!(ts.to_rfc3339(), "2024-01-01T00:00:00+00:00"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_invalid_date_filter() {
        let mut filter = BTreeMap::new();
        filter.insert("startdate".to_string(), FilterValue::Text("yesterday".into()));
        let err = Criteria::new()
            .add_date_time_filter_options("created_at", &mut filter)
            .unwrap_err();
        assert_eq!(err.status_code(), 400);
    }

    #[test]
    fn test_upsert_statement() {
        assert_eq!(
            make_upsert(Entity::Owners),
            "INSERT INTO wicked.owners (id, users_id, applications_id, data) VALUES ($1, $2, $3, $4) \
             ON CONFLICT (id) DO UPDATE SET users_id = $2, applications_id = $3, data = $4"
        );
        assert_eq!(
            make_upsert(Entity::Applications),
            "INSERT INTO wicked.applications (id, data) VALUES ($1, $2) ON CONFLICT (id) DO UPDATE SET data = $2"
        );
    }

    #[test]
    fn test_delete_statements() {
        assert!(make_delete(Entity::Users, &[]).is_err());
        assert_eq!(
            make_delete(Entity::Grants, &fields(&["userId", "apiId"])).unwrap(),
            "DELETE FROM wicked.grants WHERE users_id = $1 AND api_id = $2"
        );
        assert_eq!(
            make_delete_before(Entity::AccessTokens, "expires", Some("refresh_token IS NULL"))
                .unwrap(),
            "DELETE FROM wicked.access_tokens WHERE expires < $1 AND refresh_token IS NULL"
        );
        assert!(make_delete_before(Entity::AuditLog, "", None).is_err());
    }

    #[test]
    fn test_count_cache_key_depends_on_values() {
        let a = count_cache_key("SELECT 1", &[SqlParam::from("x")]);
        let b = count_cache_key("SELECT 1", &[SqlParam::from("y")]);
        assert_ne!(a, b);
        assert_eq!(a, count_cache_key("SELECT 1", &[SqlParam::from("x")]));
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_split_sql_commands_keeps_dollar_bodies() {
        let script = "-- comment\n\
            CREATE SCHEMA wicked;\n\
            CREATE TABLE wicked.meta (\n  id bigint,\n  data jsonb\n);\n\
            CREATE FUNCTION wicked.notify() RETURNS trigger LANGUAGE plpgsql AS $$\n\
            BEGIN\n  PERFORM pg_notify('x', '{}');\n  RETURN NEW;\nEND;\n\
            $$;\n\
            SELECT 1;\n";
        let commands = split_sql_commands(script);
        assert_eq!(commands.len(), 4);
        assert_eq!(commands[0], "CREATE SCHEMA wicked;");
        assert_eq!(commands[1], "CREATE TABLE wicked.meta ( id bigint, data jsonb );");
        assert!(commands[2].starts_with("CREATE FUNCTION"));
        assert!(commands[2].contains("RETURN NEW; END;"));
        assert!(commands[2].ends_with("$$;"));
        assert_eq!(commands[3], "SELECT 1;");
    }

    #[test]
    fn test_identifier_check() {
        assert!(is_identifier("webhook_insert"));
        assert!(!is_identifier("drop table"));
        assert!(!is_identifier("1abc"));
    }
}
