//! List queries, paging results and in-memory filtering.
//!
//! Both backends accept the same [`ListQuery`]. The relational backend
//! turns it into SQL; the document store applies [`filter_and_page`] to rows
//! it has loaded from disk.

use crate::error::{DaoError, DaoResult};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::cmp::Ordering;
use std::collections::BTreeMap;

// ============================================================================
// QUERY TYPES
// ============================================================================

/// Filter value for a single field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FilterValue {
    /// Case-insensitive substring match.
    Text(String),
    /// Matches if any alternative matches.
    AnyOf(Vec<String>),
}

impl FilterValue {
    fn is_empty(&self) -> bool {
        match self {
            FilterValue::Text(s) => s.is_empty(),
            FilterValue::AnyOf(v) => v.iter().all(String::is_empty),
        }
    }
}

impl From<&str> for FilterValue {
    fn from(s: &str) -> Self {
        FilterValue::Text(s.to_string())
    }
}

/// Filter, order and paging options of a list call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListQuery {
    #[serde(default)]
    pub filter: BTreeMap<String, FilterValue>,
    /// `"<field> ASC|DESC"`; each entity has its own default.
    #[serde(default)]
    pub order_by: Option<String>,
    #[serde(default)]
    pub offset: usize,
    /// Zero means no limit.
    #[serde(default)]
    pub limit: usize,
    #[serde(default)]
    pub no_count_cache: bool,
}

impl ListQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn paged(offset: usize, limit: usize) -> Self {
        Self {
            offset,
            limit,
            ..Self::default()
        }
    }

    pub fn with_filter(mut self, field: impl Into<String>, value: impl Into<FilterValue>) -> Self {
        self.filter.insert(field.into(), value.into());
        self
    }

    pub fn with_order(mut self, order_by: impl Into<String>) -> Self {
        self.order_by = Some(order_by.into());
        self
    }

    /// Order clause to apply, falling back to the entity default.
    pub fn order_or<'a>(&'a self, default: &'a str) -> &'a str {
        match self.order_by.as_deref() {
            Some(o) if !o.trim().is_empty() => o,
            _ => default,
        }
    }
}

/// Parsed `"<field> ASC|DESC"` clause.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderBy {
    pub field: String,
    pub descending: bool,
}

impl OrderBy {
    pub fn parse(clause: &str) -> DaoResult<Self> {
        let mut parts = clause.split_whitespace();
        let field = parts
            .next()
            .ok_or_else(|| DaoError::config("orderBy: missing field name"))?
            .to_string();
        let descending = match parts.next().map(str::to_ascii_uppercase).as_deref() {
            None | Some("ASC") => false,
            Some("DESC") => true,
            Some(other) => {
                return Err(DaoError::config(format!(
                    "orderBy: invalid direction '{}'",
                    other
                )))
            }
        };
        Ok(Self { field, descending })
    }

    pub fn direction(&self) -> &'static str {
        if self.descending {
            "DESC"
        } else {
            "ASC"
        }
    }
}

// ============================================================================
// RESULT TYPES
// ============================================================================

/// Total row count of a list call, before paging.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountResult {
    pub count: i64,
    /// True if the count was served from the count cache.
    pub cached: bool,
}

/// One page of a list call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page<T> {
    pub rows: Vec<T>,
    pub count: CountResult,
}

impl<T> Page<T> {
    pub fn new(rows: Vec<T>, count: i64, cached: bool) -> Self {
        Self {
            rows,
            count: CountResult { count, cached },
        }
    }

    /// Page whose count is simply its row count.
    pub fn complete(rows: Vec<T>) -> Self {
        let count = rows.len() as i64;
        Self::new(rows, count, false)
    }

    pub fn map<U>(self, f: impl FnMut(T) -> U) -> Page<U> {
        Page {
            rows: self.rows.into_iter().map(f).collect(),
            count: self.count,
        }
    }
}

// ============================================================================
// IN-MEMORY FILTER / SORT / PAGE
// ============================================================================

/// Slice `rows` by offset and limit; a limit of zero keeps everything from
/// the offset on.
pub fn page_slice<T>(rows: Vec<T>, offset: usize, limit: usize) -> Vec<T> {
    let iter = rows.into_iter().skip(offset);
    if limit == 0 {
        iter.collect()
    } else {
        iter.take(limit).collect()
    }
}

fn scalar_text(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) if !s.is_empty() => Some(s.to_lowercase()),
        JsonValue::Number(n) => Some(n.to_string()),
        JsonValue::Bool(true) => Some("true".to_string()),
        _ => None,
    }
}

fn row_matches(row: &JsonValue, filter: &BTreeMap<String, FilterValue>) -> bool {
    for (field, wanted) in filter {
        if wanted.is_empty() {
            continue;
        }
        let Some(have) = row.get(field).and_then(scalar_text) else {
            return false;
        };
        let hit = match wanted {
            FilterValue::Text(s) => have.contains(&s.to_lowercase()),
            FilterValue::AnyOf(alts) => alts
                .iter()
                .filter(|a| !a.is_empty())
                .any(|a| have.contains(&a.to_lowercase())),
        };
        if !hit {
            return false;
        }
    }
    true
}

fn compare_values(a: &JsonValue, b: &JsonValue) -> Ordering {
    match (a, b) {
        (JsonValue::Number(x), JsonValue::Number(y)) => x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .unwrap_or(Ordering::Equal),
        (JsonValue::String(x), JsonValue::String(y)) => x.cmp(y),
        (JsonValue::Bool(x), JsonValue::Bool(y)) => x.cmp(y),
        _ => a.to_string().cmp(&b.to_string()),
    }
}

fn compare_rows(a: &JsonValue, b: &JsonValue, order: &OrderBy) -> Ordering {
    let av = a.get(&order.field).filter(|v| !v.is_null());
    let bv = b.get(&order.field).filter(|v| !v.is_null());
    match (av, bv) {
        (None, None) => Ordering::Equal,
        // Undefined sorts first in either direction.
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(x), Some(y)) => {
            let ord = compare_values(x, y);
            if order.descending {
                ord.reverse()
            } else {
                ord
            }
        }
    }
}

/// Filter, sort and page rows in memory.
///
/// The returned count is the number of rows that passed the filter, before
/// paging. `default_order` applies when the query carries no order clause.
pub fn filter_and_page<T>(
    rows: Vec<T>,
    query: &ListQuery,
    default_order: Option<&str>,
) -> DaoResult<Page<T>>
where
    T: Serialize + DeserializeOwned,
{
    let mut keyed = Vec::with_capacity(rows.len());
    for row in rows {
        let value = serde_json::to_value(&row)?;
        if row_matches(&value, &query.filter) {
            keyed.push((value, row));
        }
    }

    let clause = match (query.order_by.as_deref(), default_order) {
        (Some(o), _) if !o.trim().is_empty() => Some(o),
        (_, d) => d,
    };
    if let Some(clause) = clause {
        let order = OrderBy::parse(clause)?;
        keyed.sort_by(|(a, _), (b, _)| compare_rows(a, b, &order));
    }

    let count = keyed.len() as i64;
    let rows = page_slice(keyed, query.offset, query.limit)
        .into_iter()
        .map(|(_, row)| row)
        .collect();
    Ok(Page::new(rows, count, false))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn people() -> Vec<JsonValue> {
        (0..10)
            .map(|i| json!({"id": format!("p{}", i), "name": format!("Name {}", 9 - i), "n": i}))
            .collect()
    }

    #[test]
    fn test_filter_sort_page_window() {
        let query = ListQuery::paged(2, 3).with_order("n ASC");
        let page = filter_and_page(people(), &query, None).unwrap();
        assert_eq!(page.count.count, 10);
        assert!(!page.count.cached);
        let ns: Vec<i64> = page.rows.iter().map(|r| r["n"].as_i64().unwrap()).collect();
        assert_eq!(ns, vec![2, 3, 4]);
    }

    #[test]
    fn test_filter_is_case_insensitive_substring() {
        let query = ListQuery::new().with_filter("name", "NAME 3");
        let page = filter_and_page(people(), &query, None).unwrap();
        assert_eq!(page.count.count, 1);
        assert_eq!(page.rows[0]["id"], json!("p6"));
    }

    #[test]
    fn test_empty_filter_value_is_skipped() {
        let query = ListQuery::new().with_filter("name", "");
        let page = filter_and_page(people(), &query, None).unwrap();
        assert_eq!(page.count.count, 10);
    }

    #[test]
    fn test_missing_field_does_not_match() {
        let rows = vec![json!({"id": "a"}), json!({"id": "b", "email": ""})];
        let query = ListQuery::new().with_filter("email", "x");
        let page = filter_and_page(rows, &query, None).unwrap();
        assert!(page.rows.is_empty());
    }

    #[test]
    fn test_any_of_filter() {
        let mut query = ListQuery::new();
        query.filter.insert(
            "id".into(),
            FilterValue::AnyOf(vec!["p1".into(), "p7".into()]),
        );
        let page = filter_and_page(people(), &query, Some("id ASC")).unwrap();
        let ids: Vec<&str> = page.rows.iter().map(|r| r["id"].as_str().unwrap()).collect();
        assert_eq!(ids, vec!["p1", "p7"]);
    }

    #[test]
    fn test_undefined_sorts_first_in_both_directions() {
        let rows = vec![json!({"id": "b", "k": "2"}), json!({"id": "a"}), json!({"id": "c", "k": "1"})];
        let asc = filter_and_page(rows.clone(), &ListQuery::new(), Some("k ASC")).unwrap();
        let desc = filter_and_page(rows, &ListQuery::new(), Some("k DESC")).unwrap();
        let asc_ids: Vec<&str> = asc.rows.iter().map(|r| r["id"].as_str().unwrap()).collect();
        let desc_ids: Vec<&str> = desc.rows.iter().map(|r| r["id"].as_str().unwrap()).collect();
        assert_eq!(asc_ids, vec!["a", "c", "b"]);
        assert_eq!(desc_ids, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_query_order_overrides_default() {
        let query = ListQuery::new().with_order("n DESC");
        let page = filter_and_page(people(), &query, Some("n ASC")).unwrap();
        assert_eq!(page.rows[0]["n"], json!(9));
    }

    #[test]
    fn test_order_by_parse() {
        assert_eq!(
            OrderBy::parse("name DESC").unwrap(),
            OrderBy { field: "name".into(), descending: true }
        );
        assert!(!OrderBy::parse("name").unwrap().descending);
        assert!(OrderBy::parse("name SIDEWAYS").is_err());
        assert!(OrderBy::parse("  ").is_err());
    }

    #[test]
    fn test_filter_value_untagged_serde() {
        let v: FilterValue = serde_json::from_value(json!(["a", "b"])).unwrap();
        assert_eq!(v, FilterValue::AnyOf(vec!["a".into(), "b".into()]));
        let v: FilterValue = serde_json::from_value(json!("a")).unwrap();
        assert_eq!(v, FilterValue::Text("a".into()));
    }

    proptest! {
        #[test]
        fn prop_page_never_exceeds_limit(len in 0usize..40, offset in 0usize..50, limit in 0usize..20) {
            let rows: Vec<JsonValue> = (0..len).map(|i| json!({"id": i})).collect();
            let page = filter_and_page(rows, &ListQuery::paged(offset, limit), Some("id ASC")).unwrap();
            prop_assert_eq!(page.count.count, len as i64);
            let expected = if limit == 0 {
                len.saturating_sub(offset)
            } else {
                len.saturating_sub(offset).min(limit)
            };
            prop_assert_eq!(page.rows.len(), expected);
        }

        #[test]
        fn prop_sorted_output_is_ordered(values in proptest::collection::vec(0i64..1000, 0..30)) {
            let rows: Vec<JsonValue> = values.iter().map(|v| json!({"v": v})).collect();
            let page = filter_and_page(rows, &ListQuery::new(), Some("v ASC")).unwrap();
            let out: Vec<i64> = page.rows.iter().map(|r| r["v"].as_i64().unwrap()).collect();
            let mut sorted = values.clone();
            sorted.sort();
            prop_assert_eq!(out, sorted);
        }
    }
}
