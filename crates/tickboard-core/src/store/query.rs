//! Query model shared by every [`DocumentStore`](super::DocumentStore).
//!
//! A query is a conjunction of field filters, an optional single-field sort
//! and an optional limit. Validation mirrors the hosted store's rules so
//! that the in-process stores reject the same queries the real one does,
//! with the same messages:
//!
//! - all inequality filters (`<`, `<=`, `>`, `>=`, `!=`, `not-in`) must be
//!   on one field,
//! - when an inequality filter is present, the sort field must be that
//!   field,
//! - `in`, `not-in` and `array-contains-any` take a non-empty array,
//! - `limit` must be positive.
//!
//! Ordering follows the store's type ranking: null < bool < number <
//! string < array < object. Documents missing the sort field are excluded
//! from sorted results; ties break on document id ascending.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use super::{Collection, Document, StoreError};
use crate::model::ParseEnumError;

/// Comparison operator of a [`Filter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FilterOp {
    #[serde(rename = "==")]
    Eq,
    #[serde(rename = "!=")]
    NotEq,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "<=")]
    Lte,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = ">=")]
    Gte,
    #[serde(rename = "in")]
    In,
    #[serde(rename = "not-in")]
    NotIn,
    #[serde(rename = "array-contains")]
    ArrayContains,
    #[serde(rename = "array-contains-any")]
    ArrayContainsAny,
}

impl FilterOp {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Eq => "==",
            Self::NotEq => "!=",
            Self::Lt => "<",
            Self::Lte => "<=",
            Self::Gt => ">",
            Self::Gte => ">=",
            Self::In => "in",
            Self::NotIn => "not-in",
            Self::ArrayContains => "array-contains",
            Self::ArrayContainsAny => "array-contains-any",
        }
    }

    /// Operators subject to the single-inequality-field rule.
    #[must_use]
    pub const fn is_inequality(self) -> bool {
        matches!(
            self,
            Self::NotEq | Self::Lt | Self::Lte | Self::Gt | Self::Gte | Self::NotIn
        )
    }

    const fn is_range(self) -> bool {
        matches!(self, Self::Lt | Self::Lte | Self::Gt | Self::Gte)
    }

    const fn takes_array(self) -> bool {
        matches!(self, Self::In | Self::NotIn | Self::ArrayContainsAny)
    }
}

impl fmt::Display for FilterOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FilterOp {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "==" => Ok(Self::Eq),
            "!=" => Ok(Self::NotEq),
            "<" => Ok(Self::Lt),
            "<=" => Ok(Self::Lte),
            ">" => Ok(Self::Gt),
            ">=" => Ok(Self::Gte),
            "in" => Ok(Self::In),
            "not-in" => Ok(Self::NotIn),
            "array-contains" => Ok(Self::ArrayContains),
            "array-contains-any" => Ok(Self::ArrayContainsAny),
            _ => Err(ParseEnumError {
                expected: "filter operator",
                got: s.to_string(),
            }),
        }
    }
}

/// A `{field, operator, value}` constraint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    pub field: String,
    pub op: FilterOp,
    /// `None` means "no constraint" to the pagination engine.
    pub value: Option<Value>,
}

impl Filter {
    pub fn new(field: impl Into<String>, op: FilterOp, value: impl Into<Value>) -> Self {
        Self {
            field: field.into(),
            op,
            value: Some(value.into()),
        }
    }

    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(field, FilterOp::Eq, value)
    }

    /// A filter without a value, as produced by an unset UI filter.
    pub fn unset(field: impl Into<String>, op: FilterOp) -> Self {
        Self {
            field: field.into(),
            op,
            value: None,
        }
    }

    /// Whether this filter actually constrains anything. Missing, null and
    /// empty-string values do not.
    #[must_use]
    pub fn is_constraint(&self) -> bool {
        match &self.value {
            None | Some(Value::Null) => false,
            Some(Value::String(text)) => !text.is_empty(),
            Some(_) => true,
        }
    }

    /// Evaluate against a document. A document missing the field never
    /// matches, whatever the operator.
    #[must_use]
    pub fn matches(&self, doc: &Document) -> bool {
        let (Some(actual), Some(expected)) = (doc.get(&self.field), self.value.as_ref()) else {
            return false;
        };
        match self.op {
            FilterOp::Eq => values_equal(actual, expected),
            FilterOp::NotEq => !actual.is_null() && !values_equal(actual, expected),
            FilterOp::Lt => range_matches(actual, expected, Ordering::is_lt),
            FilterOp::Lte => range_matches(actual, expected, Ordering::is_le),
            FilterOp::Gt => range_matches(actual, expected, Ordering::is_gt),
            FilterOp::Gte => range_matches(actual, expected, Ordering::is_ge),
            FilterOp::In => array_items(expected).any(|item| values_equal(actual, item)),
            FilterOp::NotIn => {
                !actual.is_null() && !array_items(expected).any(|item| values_equal(actual, item))
            }
            FilterOp::ArrayContains => array_items(actual).any(|item| values_equal(item, expected)),
            FilterOp::ArrayContainsAny => array_items(actual)
                .any(|item| array_items(expected).any(|wanted| values_equal(item, wanted))),
        }
    }
}

fn array_items(value: &Value) -> impl Iterator<Item = &Value> {
    value.as_array().into_iter().flatten()
}

fn range_matches(actual: &Value, expected: &Value, accept: fn(Ordering) -> bool) -> bool {
    type_rank(actual) == type_rank(expected) && accept(compare_values(actual, expected))
}

/// Drop filters that do not constrain anything.
#[must_use]
pub fn normalize_filters(filters: &[Filter]) -> Vec<Filter> {
    filters.iter().filter(|f| f.is_constraint()).cloned().collect()
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Asc,
    #[default]
    Desc,
}

impl Direction {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Asc => "asc",
            Self::Desc => "desc",
        }
    }
}

impl FromStr for Direction {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "asc" => Ok(Self::Asc),
            "desc" => Ok(Self::Desc),
            _ => Err(ParseEnumError {
                expected: "sort direction",
                got: s.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OrderBy {
    pub field: String,
    pub direction: Direction,
}

impl OrderBy {
    pub fn new(field: impl Into<String>, direction: Direction) -> Self {
        Self {
            field: field.into(),
            direction,
        }
    }

    pub fn asc(field: impl Into<String>) -> Self {
        Self::new(field, Direction::Asc)
    }

    pub fn desc(field: impl Into<String>) -> Self {
        Self::new(field, Direction::Desc)
    }
}

impl Default for OrderBy {
    /// Newest first.
    fn default() -> Self {
        Self::desc("createdAt")
    }
}

/// A filtered, ordered, size-bounded query over one collection.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub collection: Collection,
    pub filters: Vec<Filter>,
    pub order_by: Option<OrderBy>,
    pub limit: Option<usize>,
}

impl Query {
    #[must_use]
    pub const fn new(collection: Collection) -> Self {
        Self {
            collection,
            filters: Vec::new(),
            order_by: None,
            limit: None,
        }
    }

    #[must_use]
    pub fn filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    #[must_use]
    pub fn filters(mut self, filters: impl IntoIterator<Item = Filter>) -> Self {
        self.filters.extend(filters);
        self
    }

    #[must_use]
    pub fn order_by(mut self, order: OrderBy) -> Self {
        self.order_by = Some(order);
        self
    }

    #[must_use]
    pub const fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Whether a document passes every filter (and carries the sort field).
    #[must_use]
    pub fn admits(&self, doc: &Document) -> bool {
        let has_sort_field = self
            .order_by
            .as_ref()
            .is_none_or(|order| doc.get(&order.field).is_some());
        has_sort_field && self.filters.iter().all(|f| f.matches(doc))
    }

    /// Filter, sort and truncate an in-memory candidate set.
    #[must_use]
    pub fn apply(&self, candidates: impl IntoIterator<Item = Document>) -> Vec<Document> {
        let mut docs: Vec<Document> = candidates.into_iter().filter(|d| self.admits(d)).collect();
        sort_documents(&mut docs, self.order_by.as_ref());
        if let Some(limit) = self.limit {
            docs.truncate(limit);
        }
        docs
    }
}

/// Sort by the order field (type rank first), then by id ascending.
pub fn sort_documents(docs: &mut [Document], order: Option<&OrderBy>) {
    docs.sort_by(|a, b| {
        let primary = order.map_or(Ordering::Equal, |order| {
            let ord = match (a.get(&order.field), b.get(&order.field)) {
                (Some(x), Some(y)) => compare_values(x, y),
                (Some(_), None) => Ordering::Greater,
                (None, Some(_)) => Ordering::Less,
                (None, None) => Ordering::Equal,
            };
            match order.direction {
                Direction::Asc => ord,
                Direction::Desc => ord.reverse(),
            }
        });
        primary.then_with(|| a.id.cmp(&b.id))
    });
}

/// Check a field path: dot-separated, non-empty segments.
///
/// # Errors
///
/// Returns [`StoreError::Rejected`] for malformed paths.
pub fn validate_field_path(path: &str) -> Result<(), StoreError> {
    let valid = !path.is_empty()
        && path.split('.').all(|segment| {
            !segment.is_empty() && !segment.contains(['~', '*', '/', '[', ']', '"', '\\'])
        });
    if valid {
        Ok(())
    } else {
        Err(StoreError::Rejected(format!(
            "Invalid field path ({path}). Paths must not be empty, begin with '.', end with '.', or contain '..', '~', '*', '/', '[', ']', '\"' or '\\'"
        )))
    }
}

/// Validate filters on their own (for count queries).
///
/// # Errors
///
/// Returns [`StoreError::Rejected`] with the store's message.
pub fn validate_filters(filters: &[Filter]) -> Result<Option<&str>, StoreError> {
    let mut inequality_fields = BTreeSet::new();
    for filter in filters {
        validate_field_path(&filter.field)?;
        let Some(value) = filter.value.as_ref() else {
            return Err(StoreError::Rejected(format!(
                "Function where() called with invalid data. Unsupported field value: undefined (found in field {})",
                filter.field
            )));
        };
        if filter.op.takes_array() {
            let non_empty = value.as_array().is_some_and(|items| !items.is_empty());
            if !non_empty {
                return Err(StoreError::Rejected(format!(
                    "Invalid Query. A non-empty array is required for '{}' filters.",
                    filter.op
                )));
            }
        }
        if filter.op.is_range() && !matches!(value, Value::Bool(_) | Value::Number(_) | Value::String(_))
        {
            return Err(StoreError::Rejected(format!(
                "Invalid Query. Range filters ('{}') on '{}' require a boolean, number or string value.",
                filter.op, filter.field
            )));
        }
        if filter.op.is_inequality() {
            inequality_fields.insert(filter.field.as_str());
        }
    }

    let mut fields = inequality_fields.into_iter();
    match (fields.next(), fields.next()) {
        (Some(first), Some(second)) => Err(StoreError::Rejected(format!(
            "Invalid query. All where filters with an inequality (<, <=, !=, not-in, >, or >=) must be on the same field. But you have inequality filters on '{first}' and '{second}'"
        ))),
        (first, _) => Ok(first),
    }
}

/// Validate a full query.
///
/// # Errors
///
/// Returns [`StoreError::Rejected`] with the store's message.
pub fn validate(query: &Query) -> Result<(), StoreError> {
    let inequality_field = validate_filters(&query.filters)?;
    if let Some(order) = &query.order_by {
        validate_field_path(&order.field)?;
        if let Some(field) = inequality_field.filter(|field| *field != order.field) {
            return Err(StoreError::Rejected(format!(
                "Invalid query. You have a where filter with an inequality (<, <=, !=, not-in, >, or >=) on field '{field}' and so you must also use '{field}' as your first argument to orderBy(), but your first orderBy() is on field '{}' instead.",
                order.field
            )));
        }
    }
    if query.limit == Some(0) {
        return Err(StoreError::Rejected(
            "Invalid Query. Function limit() requires a positive number, but it was: 0.".to_string(),
        ));
    }
    Ok(())
}

/// Position of a value's type in the store's cross-type ordering.
#[must_use]
pub const fn type_rank(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Number(_) => 2,
        Value::String(_) => 3,
        Value::Array(_) => 4,
        Value::Object(_) => 5,
    }
}

/// Total order over JSON values: type rank, then value.
#[must_use]
pub fn compare_values(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Number(x), Value::Number(y)) => {
            let x = x.as_f64().unwrap_or(f64::NAN);
            let y = y.as_f64().unwrap_or(f64::NAN);
            x.total_cmp(&y)
        }
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Array(x), Value::Array(y)) => x
            .iter()
            .zip(y)
            .map(|(l, r)| compare_values(l, r))
            .find(|ord| ord.is_ne())
            .unwrap_or_else(|| x.len().cmp(&y.len())),
        (Value::Object(x), Value::Object(y)) => x
            .iter()
            .zip(y)
            .map(|((lk, lv), (rk, rv))| lk.cmp(rk).then_with(|| compare_values(lv, rv)))
            .find(|ord| ord.is_ne())
            .unwrap_or_else(|| x.len().cmp(&y.len())),
        _ => type_rank(a).cmp(&type_rank(b)),
    }
}

/// Equality under the store's rules (`1 == 1.0`, no cross-type matches).
#[must_use]
pub fn values_equal(a: &Value, b: &Value) -> bool {
    type_rank(a) == type_rank(b) && compare_values(a, b).is_eq()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(id: &str, body: Value) -> Document {
        let Value::Object(fields) = body else {
            panic!("test documents are objects");
        };
        Document::new(id, fields)
    }

    #[test]
    fn missing_fields_never_match() {
        let d = doc("t1", json!({"status": "todo"}));
        assert!(!Filter::new("priority", FilterOp::NotEq, "high").matches(&d));
        assert!(!Filter::new("priority", FilterOp::NotIn, json!(["high"])).matches(&d));
        assert!(Filter::eq("status", "todo").matches(&d));
    }

    #[test]
    fn range_filters_do_not_cross_types() {
        let d = doc("t1", json!({"createdAt": 10}));
        assert!(Filter::new("createdAt", FilterOp::Gt, 5).matches(&d));
        assert!(!Filter::new("createdAt", FilterOp::Gt, "5").matches(&d));
        assert!(Filter::new("createdAt", FilterOp::Lte, 10.0).matches(&d));
    }

    #[test]
    fn array_operators() {
        let d = doc("b1", json!({"assignedUsers": ["u1", "u2"]}));
        assert!(Filter::new("assignedUsers", FilterOp::ArrayContains, "u2").matches(&d));
        assert!(!Filter::new("assignedUsers", FilterOp::ArrayContains, "u3").matches(&d));
        assert!(
            Filter::new("assignedUsers", FilterOp::ArrayContainsAny, json!(["u3", "u1"])).matches(&d)
        );
    }

    #[test]
    fn empty_values_are_not_constraints() {
        let filters = vec![
            Filter::unset("status", FilterOp::Eq),
            Filter::new("assigneeId", FilterOp::Eq, Value::Null),
            Filter::eq("priority", ""),
            Filter::eq("type", "bug"),
        ];
        let kept = normalize_filters(&filters);
        assert_eq!(kept, vec![Filter::eq("type", "bug")]);
    }

    #[test]
    fn two_inequality_fields_are_rejected() {
        let q = Query::new(Collection::Tickets)
            .filter(Filter::new("priority", FilterOp::NotEq, "low"))
            .filter(Filter::new("createdAt", FilterOp::Gt, 0));
        let err = validate(&q).unwrap_err();
        assert!(matches!(err, StoreError::Rejected(_)));
        assert!(err.to_string().contains("must be on the same field"));
    }

    #[test]
    fn inequality_must_match_sort_field() {
        let q = Query::new(Collection::Tickets)
            .filter(Filter::new("status", FilterOp::NotEq, "deleted"))
            .order_by(OrderBy::default());
        let err = validate(&q).unwrap_err();
        assert!(err.to_string().contains("first argument to orderBy()"));

        let ok = Query::new(Collection::Tickets)
            .filter(Filter::new("createdAt", FilterOp::Gte, 0))
            .order_by(OrderBy::default());
        assert!(validate(&ok).is_ok());
    }

    #[test]
    fn zero_limit_and_empty_in_are_rejected() {
        assert!(validate(&Query::new(Collection::Users).limit(0)).is_err());
        let q = Query::new(Collection::Users).filter(Filter::new("role", FilterOp::In, json!([])));
        assert!(validate(&q).is_err());
        assert!(validate(&Query::new(Collection::Users).filter(Filter::eq("a..b", 1))).is_err());
    }

    #[test]
    fn sorting_ranks_types_and_breaks_ties_on_id() {
        let mut docs = vec![
            doc("c", json!({"k": 2})),
            doc("a", json!({"k": "x"})),
            doc("b", json!({"k": 2})),
            doc("d", json!({"k": null})),
        ];
        sort_documents(&mut docs, Some(&OrderBy::asc("k")));
        let ids: Vec<&str> = docs.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["d", "b", "c", "a"]);

        sort_documents(&mut docs, Some(&OrderBy::desc("k")));
        let ids: Vec<&str> = docs.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c", "d"]);
    }

    #[test]
    fn sorted_queries_skip_documents_without_the_field() {
        let q = Query::new(Collection::Tickets).order_by(OrderBy::asc("createdAt"));
        let out = q.apply(vec![doc("a", json!({"createdAt": 1})), doc("b", json!({}))]);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].id, "a");
    }

    #[test]
    fn operators_parse_from_wire_names() {
        assert_eq!("not-in".parse::<FilterOp>().unwrap(), FilterOp::NotIn);
        assert_eq!(
            serde_json::to_value(FilterOp::ArrayContainsAny).unwrap(),
            json!("array-contains-any")
        );
        assert!("~=".parse::<FilterOp>().is_err());
    }
}
