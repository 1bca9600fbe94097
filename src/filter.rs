//! Query filter evaluation.
//!
//! A [`Filter`] is a closed AST matched against a [`MatchedObject`] snapshot.
//! [`matches`] is pure, total and never panics: every node kind has a defined
//! outcome, and the evaluator carries no state.

use std::{cmp::Ordering, collections::BTreeMap};

use serde::{Deserialize, Serialize};

use crate::keys::{DocumentId, SpaceId};

/// A scalar value stored in a document property.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    /// Explicit null.
    Null,
    /// Boolean.
    Bool(bool),
    /// Integer.
    Int(i64),
    /// Floating point number.
    Float(f64),
    /// Text.
    Text(String),
}

impl Value {
    /// Ordering between two values, where one exists.
    ///
    /// Integers and floats compare numerically against each other; all other
    /// cross-kind comparisons are unordered.
    fn compare(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Value::Int(a), Value::Int(b)) => Some(a.cmp(b)),
            (Value::Float(a), Value::Float(b)) => a.partial_cmp(b),
            (Value::Int(a), Value::Float(b)) => (*a as f64).partial_cmp(b),
            (Value::Float(a), Value::Int(b)) => a.partial_cmp(&(*b as f64)),
            (Value::Text(a), Value::Text(b)) => Some(a.cmp(b)),
            (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

/// A `(source, id)` reference from a document into an external system.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForeignKey {
    /// Name of the referenced system.
    pub source: String,
    /// Id within the referenced system.
    pub id: String,
}

/// Snapshot of a stored document, as seen by the evaluator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchedObject {
    /// Document id.
    pub id: DocumentId,
    /// The space the document belongs to.
    pub space_id: SpaceId,
    /// Stored type reference, if the document carries one.
    pub type_name: Option<String>,
    /// Document data.
    pub props: BTreeMap<String, Value>,
    /// Stored foreign key pairs.
    pub foreign_keys: Vec<ForeignKey>,
}

/// Object-level filter node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Filter {
    /// Conjunction of per-field checks; absent fields are vacuous.
    Object(ObjectFilter),
    /// Full-text search. Not implemented: always evaluates to `false`.
    TextSearch(String),
    /// Negation.
    Not(Box<Filter>),
    /// Conjunction; vacuously `true` when empty.
    And(Vec<Filter>),
    /// Disjunction; vacuously `false` when empty.
    Or(Vec<Filter>),
}

/// Field checks of a [`Filter::Object`] node. Every field is optional; an
/// absent field passes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ObjectFilter {
    /// If set, the document's type reference must equal this exactly.
    pub type_name: Option<String>,
    /// If non-empty, the document id must be a member.
    pub ids: Vec<DocumentId>,
    /// Per-property value filters; every listed property must satisfy its
    /// filter.
    pub props: BTreeMap<String, ValueFilter>,
    /// If non-empty, at least one stored foreign key must equal at least one
    /// listed key.
    pub foreign_keys: Vec<ForeignKey>,
}

/// Value-level filter node, applied to a single extracted property.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ValueFilter {
    /// Comparison against a constant.
    Compare {
        /// Comparison operator.
        op: CompareOp,
        /// Right-hand side of the comparison.
        value: Value,
    },
    /// Set membership.
    In(Vec<Value>),
    /// Inclusive range `[from, to]`.
    Range {
        /// Lower bound, inclusive.
        from: Value,
        /// Upper bound, inclusive.
        to: Value,
    },
    /// Matches only when the property is absent.
    Missing,
    /// Negation.
    Not(Box<ValueFilter>),
    /// Conjunction; vacuously `true` when empty.
    And(Vec<ValueFilter>),
    /// Disjunction; vacuously `false` when empty.
    Or(Vec<ValueFilter>),
}

/// Comparison operators for [`ValueFilter::Compare`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[allow(missing_docs)]
pub enum CompareOp {
    Eq,
    Neq,
    Gt,
    Gte,
    Lt,
    Lte,
}

/// Evaluate `filter` against a document snapshot.
pub fn matches(filter: &Filter, object: &MatchedObject) -> bool {
    match filter {
        Filter::Object(f) => matches_object(f, object),
        // Explicitly unimplemented; a text-search node never matches.
        Filter::TextSearch(_) => false,
        Filter::Not(f) => !matches(f, object),
        Filter::And(fs) => fs.iter().all(|f| matches(f, object)),
        Filter::Or(fs) => fs.iter().any(|f| matches(f, object)),
    }
}

fn matches_object(filter: &ObjectFilter, object: &MatchedObject) -> bool {
    if let Some(type_name) = &filter.type_name {
        if object.type_name.as_ref() != Some(type_name) {
            return false;
        }
    }
    if !filter.ids.is_empty() && !filter.ids.contains(&object.id) {
        return false;
    }
    for (prop, value_filter) in &filter.props {
        if !matches_value(value_filter, object.props.get(prop)) {
            return false;
        }
    }
    if !filter.foreign_keys.is_empty() {
        // Disjunction: one stored key matching one listed key suffices.
        let any = filter
            .foreign_keys
            .iter()
            .any(|fk| object.foreign_keys.contains(fk));
        if !any {
            return false;
        }
    }
    true
}

fn matches_value(filter: &ValueFilter, value: Option<&Value>) -> bool {
    match filter {
        ValueFilter::Missing => value.is_none(),
        ValueFilter::Not(f) => !matches_value(f, value),
        ValueFilter::And(fs) => fs.iter().all(|f| matches_value(f, value)),
        ValueFilter::Or(fs) => fs.iter().any(|f| matches_value(f, value)),
        ValueFilter::Compare { op, value: rhs } => {
            let Some(lhs) = value else { return false };
            match op {
                CompareOp::Eq => lhs == rhs,
                CompareOp::Neq => lhs != rhs,
                CompareOp::Gt => lhs.compare(rhs) == Some(Ordering::Greater),
                CompareOp::Gte => {
                    matches!(lhs.compare(rhs), Some(Ordering::Greater | Ordering::Equal))
                }
                CompareOp::Lt => lhs.compare(rhs) == Some(Ordering::Less),
                CompareOp::Lte => {
                    matches!(lhs.compare(rhs), Some(Ordering::Less | Ordering::Equal))
                }
            }
        }
        ValueFilter::In(set) => value.is_some_and(|v| set.contains(v)),
        ValueFilter::Range { from, to } => value.is_some_and(|v| {
            matches!(v.compare(from), Some(Ordering::Greater | Ordering::Equal))
                && matches!(v.compare(to), Some(Ordering::Less | Ordering::Equal))
        }),
    }
}

#[cfg(test)]
mod tests {
    use rand_chacha::ChaCha12Rng;
    use rand_core::SeedableRng;

    use super::*;

    fn doc(rng: &mut ChaCha12Rng, type_name: &str, props: &[(&str, Value)]) -> MatchedObject {
        MatchedObject {
            id: DocumentId::random(rng),
            space_id: SpaceId::random(rng),
            type_name: Some(type_name.to_string()),
            props: props
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect(),
            foreign_keys: vec![],
        }
    }

    fn type_with_props(type_name: &str, props: &[(&str, ValueFilter)]) -> Filter {
        Filter::Object(ObjectFilter {
            type_name: Some(type_name.to_string()),
            props: props
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect(),
            ..Default::default()
        })
    }

    fn eq(value: impl Into<Value>) -> ValueFilter {
        ValueFilter::Compare {
            op: CompareOp::Eq,
            value: value.into(),
        }
    }

    #[test]
    fn vacuous_truth() {
        let mut rng = ChaCha12Rng::seed_from_u64(10);
        let d = doc(&mut rng, "task", &[("title", "test".into())]);
        assert!(matches(&Filter::And(vec![]), &d));
        assert!(!matches(&Filter::Or(vec![]), &d));
        // An empty object filter checks nothing and passes.
        assert!(matches(&Filter::Object(ObjectFilter::default()), &d));
    }

    #[test]
    fn de_morgan_composition() {
        let mut rng = ChaCha12Rng::seed_from_u64(11);
        let f1 = type_with_props("task", &[("title", eq("test"))]);
        let f2 = type_with_props("task", &[("value", eq(100i64))]);

        let samples = [
            doc(&mut rng, "task", &[("title", "test".into())]),
            doc(&mut rng, "task", &[("value", 100i64.into())]),
            doc(&mut rng, "task", &[("other", Value::Null)]),
            doc(
                &mut rng,
                "task",
                &[("title", "test".into()), ("value", 100i64.into())],
            ),
        ];
        for d in &samples {
            let composed = Filter::Not(Box::new(Filter::Or(vec![f1.clone(), f2.clone()])));
            assert_eq!(
                matches(&composed, d),
                !(matches(&f1, d) || matches(&f2, d)),
            );
        }
    }

    #[test]
    fn end_to_end_scenario() {
        let mut rng = ChaCha12Rng::seed_from_u64(12);
        let d1 = doc(
            &mut rng,
            "task",
            &[
                ("title", "test".into()),
                ("value", 100i64.into()),
                ("complete", true.into()),
            ],
        );
        let d2 = doc(&mut rng, "task", &[("title", "other".into())]);

        let both = Filter::And(vec![
            type_with_props("task", &[("title", eq("test"))]),
            type_with_props("task", &[("value", eq(100i64))]),
        ]);
        assert!(matches(&both, &d1));

        let incomplete = type_with_props("task", &[("complete", eq(false))]);
        assert!(!matches(&incomplete, &d1));

        let by_id = Filter::Object(ObjectFilter {
            ids: vec![d1.id],
            ..Default::default()
        });
        assert!(matches(&by_id, &d1));
        assert!(!matches(&by_id, &d2));
    }

    #[test]
    fn missing_and_range() {
        let mut rng = ChaCha12Rng::seed_from_u64(13);
        let d = doc(&mut rng, "task", &[("value", 100i64.into())]);

        let missing = type_with_props("task", &[("deleted_at", ValueFilter::Missing)]);
        assert!(matches(&missing, &d));
        let present = type_with_props("task", &[("value", ValueFilter::Missing)]);
        assert!(!matches(&present, &d));

        let in_range = type_with_props(
            "task",
            &[(
                "value",
                ValueFilter::Range {
                    from: 50i64.into(),
                    to: 100i64.into(),
                },
            )],
        );
        assert!(matches(&in_range, &d));
        let out_of_range = type_with_props(
            "task",
            &[(
                "value",
                ValueFilter::Range {
                    from: 101i64.into(),
                    to: 200i64.into(),
                },
            )],
        );
        assert!(!matches(&out_of_range, &d));
    }

    #[test]
    fn foreign_keys_disjunction() {
        let mut rng = ChaCha12Rng::seed_from_u64(14);
        let mut d = doc(&mut rng, "task", &[]);
        d.foreign_keys = vec![ForeignKey {
            source: "tracker".to_string(),
            id: "42".to_string(),
        }];

        let hit = Filter::Object(ObjectFilter {
            foreign_keys: vec![
                ForeignKey {
                    source: "other".to_string(),
                    id: "1".to_string(),
                },
                ForeignKey {
                    source: "tracker".to_string(),
                    id: "42".to_string(),
                },
            ],
            ..Default::default()
        });
        assert!(matches(&hit, &d));

        let miss = Filter::Object(ObjectFilter {
            foreign_keys: vec![ForeignKey {
                source: "tracker".to_string(),
                id: "43".to_string(),
            }],
            ..Default::default()
        });
        assert!(!matches(&miss, &d));
    }

    #[test]
    fn text_search_is_a_stub() {
        let mut rng = ChaCha12Rng::seed_from_u64(15);
        let d = doc(&mut rng, "task", &[("title", "needle".into())]);
        assert!(!matches(&Filter::TextSearch("needle".to_string()), &d));
    }

    #[test]
    fn cross_kind_comparisons_are_unordered() {
        let mut rng = ChaCha12Rng::seed_from_u64(16);
        let d = doc(&mut rng, "task", &[("title", "test".into())]);
        let gt = type_with_props(
            "task",
            &[(
                "title",
                ValueFilter::Compare {
                    op: CompareOp::Gt,
                    value: 1i64.into(),
                },
            )],
        );
        assert!(!matches(&gt, &d));
        // Int/float compare numerically.
        let d2 = doc(&mut rng, "task", &[("value", 2i64.into())]);
        let lt = type_with_props(
            "task",
            &[(
                "value",
                ValueFilter::Compare {
                    op: CompareOp::Lt,
                    value: 2.5f64.into(),
                },
            )],
        );
        assert!(matches(&lt, &d2));
    }
}
