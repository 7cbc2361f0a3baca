//! Table queries: column selection, filters, ordering and pagination.
//!
//! A `TableQuery` is evaluated in two places that must agree:
//!
//! - rendered to PostgREST query parameters for the remote API
//! - applied in memory to a local table snapshot when the remote is unreachable
//!
//! Comparison rules follow what the remote does for the common column types:
//! numbers compare numerically (a numeric string literal matches a number
//! column), strings compare lexically, and NULLs sort last ascending and
//! first descending.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;

use crate::row::Row;

/// A single column predicate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Filter {
  Eq { column: String, value: Value },
  Neq { column: String, value: Value },
  In { column: String, values: Vec<Value> },
  Gt { column: String, value: Value },
  Gte { column: String, value: Value },
  Lt { column: String, value: Value },
  Lte { column: String, value: Value },
  IsNull { column: String },
}

impl Filter {
  pub fn column(&self) -> &str {
    match self {
      Filter::Eq { column, .. }
      | Filter::Neq { column, .. }
      | Filter::In { column, .. }
      | Filter::Gt { column, .. }
      | Filter::Gte { column, .. }
      | Filter::Lt { column, .. }
      | Filter::Lte { column, .. }
      | Filter::IsNull { column } => column,
    }
  }

  /// Evaluate the predicate against a row.
  pub fn matches(&self, row: &Row) -> bool {
    let field = row.get(self.column()).unwrap_or(&Value::Null);
    match self {
      Filter::Eq { value, .. } => !field.is_null() && loose_eq(field, value),
      Filter::Neq { value, .. } => !field.is_null() && !loose_eq(field, value),
      Filter::In { values, .. } => !field.is_null() && values.iter().any(|v| loose_eq(field, v)),
      Filter::Gt { value, .. } => compare(field, value) == Some(Ordering::Greater),
      Filter::Gte { value, .. } => matches!(
        compare(field, value),
        Some(Ordering::Greater | Ordering::Equal)
      ),
      Filter::Lt { value, .. } => compare(field, value) == Some(Ordering::Less),
      Filter::Lte { value, .. } => {
        matches!(compare(field, value), Some(Ordering::Less | Ordering::Equal))
      }
      Filter::IsNull { .. } => field.is_null(),
    }
  }

  /// PostgREST query parameter for this predicate.
  fn to_param(&self) -> (String, String) {
    let rendered = match self {
      Filter::Eq { value, .. } => format!("eq.{}", render_value(value)),
      Filter::Neq { value, .. } => format!("neq.{}", render_value(value)),
      Filter::In { values, .. } => {
        let items: Vec<String> = values.iter().map(render_list_item).collect();
        format!("in.({})", items.join(","))
      }
      Filter::Gt { value, .. } => format!("gt.{}", render_value(value)),
      Filter::Gte { value, .. } => format!("gte.{}", render_value(value)),
      Filter::Lt { value, .. } => format!("lt.{}", render_value(value)),
      Filter::Lte { value, .. } => format!("lte.{}", render_value(value)),
      Filter::IsNull { .. } => "is.null".to_string(),
    };
    (self.column().to_string(), rendered)
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderBy {
  pub column: String,
  pub descending: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Range {
  pub offset: usize,
  pub limit: usize,
}

/// A read against one table. The default value selects every row and column.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TableQuery {
  /// Columns to return; empty means all columns
  pub columns: Vec<String>,
  pub filters: Vec<Filter>,
  pub order: Vec<OrderBy>,
  pub range: Option<Range>,
}

impl TableQuery {
  pub fn all() -> Self {
    Self::default()
  }

  /// Restrict the returned columns. A `*` among them selects every column.
  pub fn select<I, S>(mut self, columns: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    self.columns = columns
      .into_iter()
      .map(|c| c.into().trim().to_string())
      .filter(|c| !c.is_empty())
      .collect();
    if self.columns.iter().any(|c| c == "*") {
      self.columns.clear();
    }
    self
  }

  /// True when only some columns are returned.
  pub fn is_projected(&self) -> bool {
    !self.columns.is_empty() && self.columns.iter().all(|c| c.trim() != "*")
  }

  pub fn filter(mut self, filter: Filter) -> Self {
    self.filters.push(filter);
    self
  }

  pub fn eq(self, column: &str, value: impl Into<Value>) -> Self {
    self.filter(Filter::Eq {
      column: column.to_string(),
      value: value.into(),
    })
  }

  pub fn neq(self, column: &str, value: impl Into<Value>) -> Self {
    self.filter(Filter::Neq {
      column: column.to_string(),
      value: value.into(),
    })
  }

  pub fn is_in<I, V>(self, column: &str, values: I) -> Self
  where
    I: IntoIterator<Item = V>,
    V: Into<Value>,
  {
    self.filter(Filter::In {
      column: column.to_string(),
      values: values.into_iter().map(Into::into).collect(),
    })
  }

  pub fn gt(self, column: &str, value: impl Into<Value>) -> Self {
    self.filter(Filter::Gt {
      column: column.to_string(),
      value: value.into(),
    })
  }

  pub fn gte(self, column: &str, value: impl Into<Value>) -> Self {
    self.filter(Filter::Gte {
      column: column.to_string(),
      value: value.into(),
    })
  }

  pub fn lt(self, column: &str, value: impl Into<Value>) -> Self {
    self.filter(Filter::Lt {
      column: column.to_string(),
      value: value.into(),
    })
  }

  pub fn lte(self, column: &str, value: impl Into<Value>) -> Self {
    self.filter(Filter::Lte {
      column: column.to_string(),
      value: value.into(),
    })
  }

  pub fn is_null(self, column: &str) -> Self {
    self.filter(Filter::IsNull {
      column: column.to_string(),
    })
  }

  pub fn order(mut self, column: &str, descending: bool) -> Self {
    self.order.push(OrderBy {
      column: column.to_string(),
      descending,
    });
    self
  }

  pub fn range(mut self, offset: usize, limit: usize) -> Self {
    self.range = Some(Range { offset, limit });
    self
  }

  /// True when the query returns every row with every column, so its result
  /// can replace a whole local table.
  pub fn is_full_table(&self) -> bool {
    !self.is_projected() && self.filters.is_empty() && self.range.is_none()
  }

  pub fn matches(&self, row: &Row) -> bool {
    self.filters.iter().all(|f| f.matches(row))
  }

  /// Evaluate the query over a table snapshot: filter, stable sort, paginate, project.
  pub fn apply(&self, rows: Vec<Row>) -> Vec<Row> {
    let mut rows: Vec<Row> = rows.into_iter().filter(|r| self.matches(r)).collect();

    if !self.order.is_empty() {
      rows.sort_by(|a, b| {
        for order in &self.order {
          let left = a.get(&order.column).unwrap_or(&Value::Null);
          let right = b.get(&order.column).unwrap_or(&Value::Null);
          let mut ord = sort_cmp(left, right);
          if order.descending {
            ord = ord.reverse();
          }
          if ord != Ordering::Equal {
            return ord;
          }
        }
        Ordering::Equal
      });
    }

    if let Some(range) = self.range {
      rows = rows
        .into_iter()
        .skip(range.offset)
        .take(range.limit)
        .collect();
    }

    if !self.is_projected() {
      return rows;
    }

    rows
      .into_iter()
      .map(|row| {
        self
          .columns
          .iter()
          .filter_map(|c| row.get(c).map(|v| (c.clone(), v.clone())))
          .collect()
      })
      .collect()
  }

  /// Render as PostgREST query parameters.
  pub fn to_params(&self) -> Vec<(String, String)> {
    let mut params = Vec::new();
    let select = if !self.is_projected() {
      "*".to_string()
    } else {
      self.columns.join(",")
    };
    params.push(("select".to_string(), select));

    params.extend(self.filters.iter().map(Filter::to_param));

    if !self.order.is_empty() {
      let order: Vec<String> = self
        .order
        .iter()
        .map(|o| {
          let dir = if o.descending {
            "desc.nullsfirst"
          } else {
            "asc.nullslast"
          };
          format!("{}.{}", o.column, dir)
        })
        .collect();
      params.push(("order".to_string(), order.join(",")));
    }

    if let Some(range) = self.range {
      params.push(("offset".to_string(), range.offset.to_string()));
      params.push(("limit".to_string(), range.limit.to_string()));
    }

    params
  }
}

fn as_number(value: &Value) -> Option<f64> {
  match value {
    Value::Number(n) => n.as_f64(),
    Value::String(s) => s.trim().parse().ok(),
    _ => None,
  }
}

fn loose_eq(field: &Value, literal: &Value) -> bool {
  match (field, literal) {
    (Value::Number(_), _) | (_, Value::Number(_)) => {
      matches!((as_number(field), as_number(literal)), (Some(a), Some(b)) if a == b)
    }
    (Value::Bool(b), Value::String(s)) | (Value::String(s), Value::Bool(b)) => {
      s.parse::<bool>().ok() == Some(*b)
    }
    _ => field == literal,
  }
}

/// Comparison for range filters. Mismatched types and NULLs never compare.
fn compare(field: &Value, literal: &Value) -> Option<Ordering> {
  match (field, literal) {
    (Value::Null, _) | (_, Value::Null) => None,
    (Value::Number(_), _) | (_, Value::Number(_)) => {
      as_number(field)?.partial_cmp(&as_number(literal)?)
    }
    (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
    (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
    _ => None,
  }
}

fn type_rank(value: &Value) -> u8 {
  match value {
    Value::Bool(_) => 0,
    Value::Number(_) => 1,
    Value::String(_) => 2,
    Value::Array(_) => 3,
    Value::Object(_) => 4,
    Value::Null => 5,
  }
}

/// Total order used for sorting: NULL is greater than everything.
fn sort_cmp(a: &Value, b: &Value) -> Ordering {
  match (a, b) {
    (Value::Number(x), Value::Number(y)) => {
      let (x, y) = (x.as_f64().unwrap_or(0.0), y.as_f64().unwrap_or(0.0));
      x.partial_cmp(&y).unwrap_or(Ordering::Equal)
    }
    (Value::String(x), Value::String(y)) => x.cmp(y),
    (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
    _ => type_rank(a).cmp(&type_rank(b)),
  }
}

fn render_value(value: &Value) -> String {
  match value {
    Value::String(s) => s.clone(),
    Value::Null => "null".to_string(),
    other => other.to_string(),
  }
}

fn render_list_item(value: &Value) -> String {
  let raw = render_value(value);
  if raw.contains([',', '(', ')', '"', ' ']) {
    format!("\"{}\"", raw.replace('\\', "\\\\").replace('"', "\\\""))
  } else {
    raw
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::row::row_from_value;
  use serde_json::json;

  fn students() -> Vec<Row> {
    vec![
      row_from_value(json!({"id": 1, "name": "Ana", "grade": 3, "school_id": 10})),
      row_from_value(json!({"id": 2, "name": "Ben", "grade": 5, "school_id": 11})),
      row_from_value(json!({"id": 3, "name": "Cleo", "grade": null, "school_id": 10})),
      row_from_value(json!({"id": 4, "name": "Dan", "grade": 4, "school_id": 12})),
    ]
  }

  fn ids(rows: &[Row]) -> Vec<i64> {
    rows.iter().map(|r| r["id"].as_i64().unwrap()).collect()
  }

  #[test]
  fn test_all_returns_everything_in_order() {
    let rows = TableQuery::all().apply(students());
    assert_eq!(ids(&rows), vec![1, 2, 3, 4]);
    assert!(TableQuery::all().is_full_table());
  }

  #[test]
  fn test_eq_matches_numeric_string_literal() {
    let rows = TableQuery::all().eq("school_id", "10").apply(students());
    assert_eq!(ids(&rows), vec![1, 3]);
  }

  #[test]
  fn test_in_and_neq() {
    let rows = TableQuery::all()
      .is_in("school_id", [json!(10), json!(12)])
      .neq("name", "Ana")
      .apply(students());
    assert_eq!(ids(&rows), vec![3, 4]);
  }

  #[test]
  fn test_range_filters_skip_nulls() {
    let rows = TableQuery::all().gte("grade", 4).apply(students());
    assert_eq!(ids(&rows), vec![2, 4]);

    let rows = TableQuery::all().lt("grade", 4).apply(students());
    assert_eq!(ids(&rows), vec![1]);

    let rows = TableQuery::all().is_null("grade").apply(students());
    assert_eq!(ids(&rows), vec![3]);
  }

  #[test]
  fn test_order_puts_nulls_last_ascending_first_descending() {
    let asc = TableQuery::all().order("grade", false).apply(students());
    assert_eq!(ids(&asc), vec![1, 4, 2, 3]);

    let desc = TableQuery::all().order("grade", true).apply(students());
    assert_eq!(ids(&desc), vec![3, 2, 4, 1]);
  }

  #[test]
  fn test_range_and_projection() {
    let rows = TableQuery::all()
      .select(["name"])
      .order("id", true)
      .range(1, 2)
      .apply(students());
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0], row_from_value(json!({"name": "Cleo"})));
    assert_eq!(rows[1], row_from_value(json!({"name": "Ben"})));
  }

  #[test]
  fn test_to_params() {
    let params = TableQuery::all()
      .select(["id", "name"])
      .eq("school_id", 10)
      .is_in("name", ["Ana", "Van Der Berg"])
      .is_null("grade")
      .order("name", false)
      .range(20, 10)
      .to_params();

    assert_eq!(
      params,
      vec![
        ("select".to_string(), "id,name".to_string()),
        ("school_id".to_string(), "eq.10".to_string()),
        ("name".to_string(), "in.(Ana,\"Van Der Berg\")".to_string()),
        ("grade".to_string(), "is.null".to_string()),
        ("order".to_string(), "name.asc.nullslast".to_string()),
        ("offset".to_string(), "20".to_string()),
        ("limit".to_string(), "10".to_string()),
      ]
    );
  }

  #[test]
  fn test_filtered_query_is_not_full_table() {
    assert!(!TableQuery::all().eq("id", 1).is_full_table());
    assert!(!TableQuery::all().select(["id"]).is_full_table());
    assert!(!TableQuery::all().range(0, 10).is_full_table());
    assert!(TableQuery::all().order("id", false).is_full_table());
  }

  #[test]
  fn test_star_selects_all_columns() {
    let star = TableQuery::all().select(["*"]);
    assert!(star.columns.is_empty());
    assert!(!star.is_projected());
    assert!(star.is_full_table());
    assert!(TableQuery::all().select(["id", "*"]).is_full_table());

    let mut direct = TableQuery::all();
    direct.columns = vec!["*".to_string()];
    assert!(direct.is_full_table());
    assert_eq!(direct.apply(students()), students());
  }
}
