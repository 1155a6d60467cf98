use std::cmp::Ordering;
use std::ops::Bound;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::{DbError, DbResult};

/// Single-field comparator. Conditions never combine more than one field or
/// more than one comparator — anything richer is out of scope (§1 Non-goals).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Comparator {
    Eq,
    Lt,
    Lte,
    Gt,
    Gte,
}

/// Half-open/closed bounds over a single field, suitable for driving a
/// secondary-index range scan.
#[derive(Debug, Clone)]
pub struct RangeDescriptor {
    pub field: String,
    pub lower: Bound<Value>,
    pub upper: Bound<Value>,
}

impl RangeDescriptor {
    pub fn contains(&self, value: &Value) -> bool {
        let above_lower = match &self.lower {
            Bound::Unbounded => true,
            Bound::Included(v) => cmp_values(value, v).is_some_and(|o| o != Ordering::Less),
            Bound::Excluded(v) => cmp_values(value, v).is_some_and(|o| o == Ordering::Greater),
        };
        let below_upper = match &self.upper {
            Bound::Unbounded => true,
            Bound::Included(v) => cmp_values(value, v).is_some_and(|o| o != Ordering::Greater),
            Bound::Excluded(v) => cmp_values(value, v).is_some_and(|o| o == Ordering::Less),
        };
        above_lower && below_upper
    }
}

/// A filter `{ field, comparator, value }` over a single top-level scalar field.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Condition {
    pub field: String,
    pub comparator: Comparator,
    pub value: Value,
}

impl Condition {
    pub fn new(field: impl Into<String>, comparator: Comparator, value: Value) -> DbResult<Self> {
        let field = field.into();
        if field.is_empty() {
            return Err(DbError::InvalidCondition("field must not be empty".into()));
        }
        if !matches!(value, Value::String(_) | Value::Number(_)) {
            return Err(DbError::InvalidCondition(
                "condition value must be a string or number".into(),
            ));
        }
        Ok(Self { field, comparator, value })
    }

    /// Parses a `{ field: { comparator: value } }` where-clause shape, failing
    /// unless it names exactly one field and exactly one comparator.
    pub fn from_where(clause: &serde_json::Map<String, Value>) -> DbResult<Self> {
        let mut fields = clause.iter();
        let (field, inner) = fields
            .next()
            .ok_or_else(|| DbError::InvalidCondition("where clause is empty".into()))?;
        if fields.next().is_some() {
            return Err(DbError::InvalidCondition(
                "where clause must name exactly one field".into(),
            ));
        }
        let inner = inner
            .as_object()
            .ok_or_else(|| DbError::InvalidCondition("comparator object expected".into()))?;
        let mut comparators = inner.iter();
        let (comparator, value) = comparators
            .next()
            .ok_or_else(|| DbError::InvalidCondition("no comparator given".into()))?;
        if comparators.next().is_some() {
            return Err(DbError::InvalidCondition(
                "where clause must name exactly one comparator".into(),
            ));
        }
        let comparator = match comparator.as_str() {
            "eq" => Comparator::Eq,
            "lt" => Comparator::Lt,
            "lte" => Comparator::Lte,
            "gt" => Comparator::Gt,
            "gte" => Comparator::Gte,
            other => {
                return Err(DbError::InvalidCondition(format!("unknown comparator {other}")))
            }
        };
        Self::new(field.clone(), comparator, value.clone())
    }

    /// In-memory predicate, used against overlay-merged documents.
    pub fn satisfies(&self, document: &Value) -> bool {
        let Some(field_value) = document.get(&self.field) else {
            return false;
        };
        let Some(ordering) = cmp_values(field_value, &self.value) else {
            return false;
        };
        match self.comparator {
            Comparator::Eq => ordering == Ordering::Equal,
            Comparator::Lt => ordering == Ordering::Less,
            Comparator::Lte => ordering != Ordering::Greater,
            Comparator::Gt => ordering == Ordering::Greater,
            Comparator::Gte => ordering != Ordering::Less,
        }
    }

    /// Range descriptor driving a secondary-index scan; must agree bit-for-bit
    /// with `satisfies` for equivalent inputs (§8 invariant 3).
    pub fn range(&self) -> RangeDescriptor {
        let (lower, upper) = match self.comparator {
            Comparator::Eq => (
                Bound::Included(self.value.clone()),
                Bound::Included(self.value.clone()),
            ),
            Comparator::Lt => (Bound::Unbounded, Bound::Excluded(self.value.clone())),
            Comparator::Lte => (Bound::Unbounded, Bound::Included(self.value.clone())),
            Comparator::Gt => (Bound::Excluded(self.value.clone()), Bound::Unbounded),
            Comparator::Gte => (Bound::Included(self.value.clone()), Bound::Unbounded),
        };
        RangeDescriptor { field: self.field.clone(), lower, upper }
    }
}

/// Orders two JSON scalars. Numbers compare numerically, strings lexically;
/// anything else (including a type mismatch) is incomparable.
pub fn cmp_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(a), Value::Number(b)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn condition_requires_single_field_and_comparator() {
        let empty = serde_json::Map::new();
        assert!(Condition::from_where(&empty).is_err());

        let mut two_fields = serde_json::Map::new();
        two_fields.insert("a".into(), json!({"eq": 1}));
        two_fields.insert("b".into(), json!({"eq": 2}));
        assert!(Condition::from_where(&two_fields).is_err());

        let mut two_comparators = serde_json::Map::new();
        two_comparators.insert("a".into(), json!({"eq": 1, "gt": 0}));
        assert!(Condition::from_where(&two_comparators).is_err());

        let mut ok = serde_json::Map::new();
        ok.insert("status".into(), json!({"eq": "incomplete"}));
        assert!(Condition::from_where(&ok).is_ok());
    }

    #[test]
    fn predicate_agrees_with_range_for_eq() {
        let c = Condition::new("status", Comparator::Eq, json!("incomplete")).unwrap();
        let range = c.range();
        assert!(c.satisfies(&json!({"status": "incomplete"})));
        assert!(range.contains(&json!("incomplete")));
        assert!(!c.satisfies(&json!({"status": "done"})));
        assert!(!range.contains(&json!("done")));
    }

    #[test]
    fn predicate_agrees_with_range_for_numeric_bounds() {
        for comparator in [Comparator::Lt, Comparator::Lte, Comparator::Gt, Comparator::Gte] {
            let c = Condition::new("age", comparator, json!(10)).unwrap();
            let range = c.range();
            for candidate in [0, 5, 10, 15, 20] {
                let doc = json!({"age": candidate});
                assert_eq!(
                    c.satisfies(&doc),
                    range.contains(&json!(candidate)),
                    "mismatch for comparator {:?} candidate {}",
                    comparator,
                    candidate
                );
            }
        }
    }

    #[test]
    fn missing_field_never_satisfies() {
        let c = Condition::new("status", Comparator::Eq, json!("x")).unwrap();
        assert!(!c.satisfies(&json!({"other": "x"})));
    }
}
