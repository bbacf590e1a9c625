//! Query specifications shared by every backend
//!
//! A [`QuerySpec`] is the compiled, backend-facing form of a query: table,
//! AND-ed filters, a single sort key, and pagination. The in-memory evaluator
//! here defines the reference semantics that the SQLite backend mirrors.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::backend::Row;

/// Comparison operators supported by filters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterOp {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    /// `value` is a JSON array of candidates
    In,
    IsNull,
    IsNotNull,
}

/// A single field condition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    pub field: String,
    pub op: FilterOp,
    pub value: Value,
}

impl Filter {
    pub fn new(field: impl Into<String>, op: FilterOp, value: impl Into<Value>) -> Self {
        Self {
            field: field.into(),
            op,
            value: value.into(),
        }
    }

    /// Equality; a null value is treated as `IS NULL`
    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        let value = value.into();
        if value.is_null() {
            return Self::is_null(field);
        }
        Self::new(field, FilterOp::Eq, value)
    }

    pub fn is_null(field: impl Into<String>) -> Self {
        Self::new(field, FilterOp::IsNull, Value::Null)
    }

    pub fn is_not_null(field: impl Into<String>) -> Self {
        Self::new(field, FilterOp::IsNotNull, Value::Null)
    }

    pub fn any_of(field: impl Into<String>, values: Vec<Value>) -> Self {
        Self::new(field, FilterOp::In, Value::Array(values))
    }

    /// Evaluate against a row; a missing field reads as null
    pub fn matches(&self, row: &Row) -> bool {
        let actual = row.get(&self.field).unwrap_or(&Value::Null);
        match self.op {
            FilterOp::IsNull => actual.is_null(),
            FilterOp::IsNotNull => !actual.is_null(),
            FilterOp::Eq => values_equal(actual, &self.value),
            FilterOp::Ne => !values_equal(actual, &self.value),
            FilterOp::In => match &self.value {
                Value::Array(candidates) => candidates.iter().any(|c| values_equal(actual, c)),
                _ => false,
            },
            FilterOp::Gt => compare_values(actual, &self.value) == Some(Ordering::Greater),
            FilterOp::Gte => matches!(
                compare_values(actual, &self.value),
                Some(Ordering::Greater | Ordering::Equal)
            ),
            FilterOp::Lt => compare_values(actual, &self.value) == Some(Ordering::Less),
            FilterOp::Lte => matches!(
                compare_values(actual, &self.value),
                Some(Ordering::Less | Ordering::Equal)
            ),
        }
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    if a.is_null() || b.is_null() {
        return false;
    }
    compare_values(a, b) == Some(Ordering::Equal)
}

/// Order two JSON scalars; `None` when they are not comparable
///
/// Numbers compare numerically (so `1` equals `1.0`), strings lexically,
/// booleans false-before-true. Null compares below everything for sorting
/// but never satisfies a range filter.
pub fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

fn sort_key_cmp(a: &Value, b: &Value) -> Ordering {
    match (a.is_null(), b.is_null()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Less,
        (false, true) => Ordering::Greater,
        (false, false) => compare_values(a, b).unwrap_or(Ordering::Equal),
    }
}

/// Sort direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    #[default]
    Asc,
    Desc,
}

impl Direction {
    pub fn as_sql(&self) -> &'static str {
        match self {
            Self::Asc => "ASC",
            Self::Desc => "DESC",
        }
    }
}

/// Sort key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    pub field: String,
    pub direction: Direction,
}

impl Order {
    pub fn new(field: impl Into<String>, direction: Direction) -> Self {
        Self {
            field: field.into(),
            direction,
        }
    }
}

/// Backend-facing query
///
/// Rows without an explicit order come back in `created_at` order. Ties on
/// the sort key are broken by primary key so results are deterministic
/// across backends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuerySpec {
    pub table: String,
    pub primary_key: String,
    pub filters: Vec<Filter>,
    pub order: Option<Order>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

impl QuerySpec {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            primary_key: "id".to_string(),
            filters: Vec::new(),
            order: None,
            limit: None,
            offset: None,
        }
    }

    pub fn with_primary_key(mut self, primary_key: impl Into<String>) -> Self {
        self.primary_key = primary_key.into();
        self
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn order_by(mut self, field: impl Into<String>, direction: Direction) -> Self {
        self.order = Some(Order::new(field, direction));
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = Some(offset);
        self
    }

    /// The effective sort key
    pub fn effective_order(&self) -> Order {
        self.order
            .clone()
            .unwrap_or_else(|| Order::new("created_at", Direction::Asc))
    }

    /// Whether a row passes every filter
    pub fn matches(&self, row: &Row) -> bool {
        self.filters.iter().all(|f| f.matches(row))
    }

    /// Evaluate the full query over a set of candidate rows
    pub fn apply<I>(&self, rows: I) -> Vec<Row>
    where
        I: IntoIterator<Item = Row>,
    {
        let mut selected: Vec<Row> = rows.into_iter().filter(|r| self.matches(r)).collect();

        let order = self.effective_order();
        let pk = self.primary_key.as_str();
        selected.sort_by(|a, b| {
            let primary = sort_key_cmp(
                a.get(&order.field).unwrap_or(&Value::Null),
                b.get(&order.field).unwrap_or(&Value::Null),
            );
            let primary = match order.direction {
                Direction::Asc => primary,
                Direction::Desc => primary.reverse(),
            };
            primary.then_with(|| {
                sort_key_cmp(a.get(pk).unwrap_or(&Value::Null), b.get(pk).unwrap_or(&Value::Null))
            })
        });

        let offset = self.offset.unwrap_or(0);
        let limit = self.limit.unwrap_or(usize::MAX);
        selected.into_iter().skip(offset).take(limit).collect()
    }

    /// Number of rows passing the filters, ignoring pagination
    pub fn count<'a, I>(&self, rows: I) -> u64
    where
        I: IntoIterator<Item = &'a Row>,
    {
        rows.into_iter().filter(|r| self.matches(r)).count() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(v: Value) -> Row {
        v.as_object().cloned().unwrap()
    }

    fn sample() -> Vec<Row> {
        vec![
            row(json!({"id": "a", "title": "Fix sink", "status": "open", "created_at": 3, "position": 200.0})),
            row(json!({"id": "b", "title": "Paint", "status": "done", "created_at": 1, "position": 100.0})),
            row(json!({"id": "c", "title": "Roof", "status": "open", "created_at": 2, "discarded_at": 5})),
        ]
    }

    #[test]
    fn test_eq_filter() {
        let spec = QuerySpec::new("jobs").filter(Filter::eq("status", "open"));
        let ids: Vec<_> = spec.apply(sample()).iter().map(|r| r["id"].clone()).collect();
        assert_eq!(ids, vec![json!("c"), json!("a")]);
    }

    #[test]
    fn test_null_filters_treat_missing_as_null() {
        let kept = QuerySpec::new("jobs").filter(Filter::is_null("discarded_at"));
        assert_eq!(kept.apply(sample()).len(), 2);

        let discarded = QuerySpec::new("jobs").filter(Filter::is_not_null("discarded_at"));
        let rows = discarded.apply(sample());
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["id"], json!("c"));
    }

    #[test]
    fn test_eq_null_becomes_is_null() {
        let f = Filter::eq("discarded_at", Value::Null);
        assert_eq!(f.op, FilterOp::IsNull);
    }

    #[test]
    fn test_numeric_equality_across_representations() {
        let f = Filter::eq("position", 100);
        assert!(f.matches(&sample()[1]));
    }

    #[test]
    fn test_range_filters_skip_nulls() {
        let f = Filter::new("position", FilterOp::Lt, 150.0);
        let matched: Vec<_> = sample().into_iter().filter(|r| f.matches(r)).collect();
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0]["id"], json!("b"));
    }

    #[test]
    fn test_in_filter() {
        let f = Filter::any_of("id", vec![json!("a"), json!("c")]);
        let spec = QuerySpec::new("jobs").filter(f);
        assert_eq!(spec.apply(sample()).len(), 2);
    }

    #[test]
    fn test_order_desc_and_pagination() {
        let spec = QuerySpec::new("jobs")
            .order_by("created_at", Direction::Desc)
            .offset(1)
            .limit(1);
        let rows = spec.apply(sample());
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["id"], json!("c"));
    }

    #[test]
    fn test_nulls_sort_first_ascending() {
        let spec = QuerySpec::new("jobs").order_by("position", Direction::Asc);
        let ids: Vec<_> = spec.apply(sample()).iter().map(|r| r["id"].clone()).collect();
        assert_eq!(ids, vec![json!("c"), json!("b"), json!("a")]);
    }

    #[test]
    fn test_count_ignores_pagination() {
        let rows = sample();
        let spec = QuerySpec::new("jobs").filter(Filter::eq("status", "open")).limit(1);
        assert_eq!(spec.count(rows.iter()), 2);
    }
}
