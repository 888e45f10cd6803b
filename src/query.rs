//! Query model: filters, orderings, paging.
//!
//! A [`Query`] is the client-side description of a subscription or fetch:
//! an optional filter tree, an ordered list of ordering descriptors, and
//! optional paging. Queries serialize to the wire shape used by `sub`/`ftc`
//! frames and hash to a canonical string used to deduplicate subscriptions.

use serde_json::{json, Map, Value};
use std::fmt;

/// Hard upper bound for `take`; larger values fail validation.
pub const MAX_TAKE: u32 = 500;

/// Key path addressing the document id.
pub const KEY_PATH_ID: &str = "$id";
/// Key path addressing the creation timestamp.
pub const KEY_PATH_CREATED: &str = "$created";
/// Key path addressing the modification timestamp.
pub const KEY_PATH_MODIFIED: &str = "$modified";

/// Sort direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Asc,
    Desc,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Asc => write!(f, "asc"),
            Direction::Desc => write!(f, "desc"),
        }
    }
}

/// One ordering descriptor: a key path and a direction.
#[derive(Debug, Clone, PartialEq)]
pub struct Ordering {
    pub key_path: String,
    pub direction: Direction,
}

impl Ordering {
    pub fn new(key_path: impl Into<String>, direction: Direction) -> Self {
        Self { key_path: key_path.into(), direction }
    }
}

/// Result-window paging.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Paging {
    pub skip: Option<u32>,
    pub take: Option<u32>,
}

/// Filter condition over documents.
///
/// Simple filters pair a key path with a relation; compound filters combine
/// operands with `and`/`or`/`not`.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    Eq(String, Value),
    Gt(String, Value),
    Gte(String, Value),
    Lt(String, Value),
    Lte(String, Value),
    Contains(String, String),
    StartsWith(String, String),
    EndsWith(String, String),
    ArrayContains(String, Value),
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Not(Box<Filter>),
}

impl Filter {
    /// Wire shape: `{key: value}` for equality, `{key: {op: value}}` for the
    /// other simple relations, `{and|or: [..]}` / `{not: ..}` for compounds.
    pub fn to_json(&self) -> Value {
        match self {
            Filter::Eq(key, value) => json!({ key: value }),
            Filter::Gt(key, value) => json!({ key: { "gt": value } }),
            Filter::Gte(key, value) => json!({ key: { "gte": value } }),
            Filter::Lt(key, value) => json!({ key: { "lt": value } }),
            Filter::Lte(key, value) => json!({ key: { "lte": value } }),
            Filter::Contains(key, value) => json!({ key: { "cnt": value } }),
            Filter::StartsWith(key, value) => json!({ key: { "pref": value } }),
            Filter::EndsWith(key, value) => json!({ key: { "suf": value } }),
            Filter::ArrayContains(key, value) => json!({ key: { "arr-cnt": value } }),
            Filter::And(operands) => {
                json!({ "and": operands.iter().map(Filter::to_json).collect::<Vec<_>>() })
            }
            Filter::Or(operands) => {
                json!({ "or": operands.iter().map(Filter::to_json).collect::<Vec<_>>() })
            }
            Filter::Not(operand) => json!({ "not": operand.to_json() }),
        }
    }

    /// Canonical string for subscription hashing.
    ///
    /// Commutative operators sort their operands by canonical string so that
    /// `and(a, b)` and `and(b, a)` hash identically.
    pub fn canonical(&self) -> String {
        match self {
            Filter::Eq(key, value) => format!("{}:eq:{}", key, canonical_json(value)),
            Filter::Gt(key, value) => format!("{}:gt:{}", key, canonical_json(value)),
            Filter::Gte(key, value) => format!("{}:gte:{}", key, canonical_json(value)),
            Filter::Lt(key, value) => format!("{}:lt:{}", key, canonical_json(value)),
            Filter::Lte(key, value) => format!("{}:lte:{}", key, canonical_json(value)),
            Filter::Contains(key, value) => format!("{}:cnt:{}", key, value),
            Filter::StartsWith(key, value) => format!("{}:pref:{}", key, value),
            Filter::EndsWith(key, value) => format!("{}:suf:{}", key, value),
            Filter::ArrayContains(key, value) => {
                format!("{}:arr-cnt:{}", key, canonical_json(value))
            }
            Filter::And(operands) => format!("and({})", canonical_operands(operands)),
            Filter::Or(operands) => format!("or({})", canonical_operands(operands)),
            Filter::Not(operand) => format!("not({})", operand.canonical()),
        }
    }

    /// All key paths referenced by this filter, for validation.
    pub(crate) fn key_paths(&self) -> Vec<&str> {
        match self {
            Filter::Eq(key, _)
            | Filter::Gt(key, _)
            | Filter::Gte(key, _)
            | Filter::Lt(key, _)
            | Filter::Lte(key, _)
            | Filter::Contains(key, _)
            | Filter::StartsWith(key, _)
            | Filter::EndsWith(key, _)
            | Filter::ArrayContains(key, _) => vec![key.as_str()],
            Filter::And(operands) | Filter::Or(operands) => {
                operands.iter().flat_map(Filter::key_paths).collect()
            }
            Filter::Not(operand) => operand.key_paths(),
        }
    }
}

fn canonical_operands(operands: &[Filter]) -> String {
    let mut parts: Vec<String> = operands.iter().map(Filter::canonical).collect();
    parts.sort();
    parts.join("|")
}

/// JSON rendering with object keys sorted recursively, so canonical strings
/// do not depend on user map insertion order.
fn canonical_json(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let fields: Vec<String> = keys
                .into_iter()
                .map(|k| format!("{}:{}", k, canonical_json(&map[k])))
                .collect();
            format!("{{{}}}", fields.join(","))
        }
        Value::Array(items) => {
            let parts: Vec<String> = items.iter().map(canonical_json).collect();
            format!("[{}]", parts.join(","))
        }
        other => other.to_string(),
    }
}

/// Field expression builder for fluent filter construction.
pub struct Field {
    name: String,
}

impl Field {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    pub fn eq(self, value: impl Into<Value>) -> Filter {
        Filter::Eq(self.name, value.into())
    }

    pub fn gt(self, value: impl Into<Value>) -> Filter {
        Filter::Gt(self.name, value.into())
    }

    pub fn gte(self, value: impl Into<Value>) -> Filter {
        Filter::Gte(self.name, value.into())
    }

    pub fn lt(self, value: impl Into<Value>) -> Filter {
        Filter::Lt(self.name, value.into())
    }

    pub fn lte(self, value: impl Into<Value>) -> Filter {
        Filter::Lte(self.name, value.into())
    }

    pub fn contains(self, value: impl Into<String>) -> Filter {
        Filter::Contains(self.name, value.into())
    }

    pub fn starts_with(self, value: impl Into<String>) -> Filter {
        Filter::StartsWith(self.name, value.into())
    }

    pub fn ends_with(self, value: impl Into<String>) -> Filter {
        Filter::EndsWith(self.name, value.into())
    }

    pub fn array_contains(self, value: impl Into<Value>) -> Filter {
        Filter::ArrayContains(self.name, value.into())
    }
}

/// Create a field expression.
pub fn field(name: impl Into<String>) -> Field {
    Field::new(name)
}

/// Combine filters with AND.
pub fn and(filters: Vec<Filter>) -> Filter {
    Filter::And(filters)
}

/// Combine filters with OR.
pub fn or(filters: Vec<Filter>) -> Filter {
    Filter::Or(filters)
}

/// Negate a filter.
pub fn not(filter: Filter) -> Filter {
    Filter::Not(Box::new(filter))
}

/// A complete query: filter, ordering, paging.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Query {
    pub filter: Option<Filter>,
    pub ordering: Vec<Ordering>,
    pub paging: Paging,
}

impl Query {
    /// ANDs a new filter onto the existing one.
    pub(crate) fn add_filter(&mut self, filter: Filter) {
        self.filter = Some(match self.filter.take() {
            Some(existing) => Filter::And(vec![existing, filter]),
            None => filter,
        });
    }

    /// Appends an ordering descriptor. Earlier descriptors stay primary.
    pub(crate) fn add_ordering(&mut self, ordering: Ordering) {
        self.ordering.push(ordering);
    }

    /// Ordering wire shape: a sequence of single-key `{keyPath: direction}`
    /// objects, or `None` when no ordering is set.
    pub fn ordering_json(&self) -> Option<Value> {
        if self.ordering.is_empty() {
            return None;
        }
        let items: Vec<Value> = self
            .ordering
            .iter()
            .map(|o| {
                let mut obj = Map::new();
                obj.insert(o.key_path.clone(), Value::String(o.direction.to_string()));
                Value::Object(obj)
            })
            .collect();
        Some(Value::Array(items))
    }

    /// Deterministic canonical key over (collection, filter, ordering,
    /// paging). Two subscriptions with equal hashes share one server-side
    /// registration.
    pub fn subscription_hash(&self, collection_id: &str) -> String {
        let filter = self
            .filter
            .as_ref()
            .map(Filter::canonical)
            .unwrap_or_default();
        let ordering = self
            .ordering
            .iter()
            .map(|o| format!("{}:{}", o.key_path, o.direction))
            .collect::<Vec<_>>()
            .join(",");
        let skip = self.paging.skip.map(|n| n.to_string()).unwrap_or_default();
        let take = self.paging.take.map(|n| n.to_string()).unwrap_or_default();
        format!("{}#{}#{}#{}#{}", collection_id, filter, ordering, skip, take)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_equality_filter_json() {
        let f = field("name").eq("alice");
        assert_eq!(f.to_json(), json!({ "name": "alice" }));
    }

    #[test]
    fn test_relation_filter_json() {
        assert_eq!(field("age").gt(21).to_json(), json!({ "age": { "gt": 21 } }));
        assert_eq!(
            field("title").starts_with("re:").to_json(),
            json!({ "title": { "pref": "re:" } })
        );
        assert_eq!(
            field("tags").array_contains("urgent").to_json(),
            json!({ "tags": { "arr-cnt": "urgent" } })
        );
    }

    #[test]
    fn test_compound_filter_json() {
        let f = and(vec![field("age").gt(21), field("active").eq(true)]);
        assert_eq!(
            f.to_json(),
            json!({ "and": [ { "age": { "gt": 21 } }, { "active": true } ] })
        );

        let f = not(field("name").eq("bob"));
        assert_eq!(f.to_json(), json!({ "not": { "name": "bob" } }));
    }

    #[test]
    fn test_commutative_operands_hash_stably() {
        let ab = and(vec![field("a").eq(1), field("b").eq(2)]);
        let ba = and(vec![field("b").eq(2), field("a").eq(1)]);
        assert_eq!(ab.canonical(), ba.canonical());

        let ab = or(vec![field("a").eq(1), field("b").eq(2)]);
        let ba = or(vec![field("b").eq(2), field("a").eq(1)]);
        assert_eq!(ab.canonical(), ba.canonical());
    }

    #[test]
    fn test_canonical_json_sorts_object_keys() {
        let v1: Value = serde_json::from_str(r#"{"b":2,"a":1}"#).unwrap();
        let v2: Value = serde_json::from_str(r#"{"a":1,"b":2}"#).unwrap();
        assert_eq!(canonical_json(&v1), canonical_json(&v2));
    }

    #[test]
    fn test_subscription_hash_distinguishes_queries() {
        let mut q1 = Query::default();
        q1.add_filter(field("name").eq("alice"));
        let mut q2 = q1.clone();
        q2.paging.take = Some(10);

        assert_eq!(q1.subscription_hash("msg"), q1.subscription_hash("msg"));
        assert_ne!(q1.subscription_hash("msg"), q2.subscription_hash("msg"));
        assert_ne!(q1.subscription_hash("msg"), q1.subscription_hash("posts"));
    }

    #[test]
    fn test_ordering_appends() {
        let mut q = Query::default();
        q.add_ordering(Ordering::new("priority", Direction::Desc));
        q.add_ordering(Ordering::new("$created", Direction::Asc));
        assert_eq!(q.ordering.len(), 2);
        assert_eq!(q.ordering[0].key_path, "priority");
        assert_eq!(
            q.ordering_json().unwrap(),
            json!([ { "priority": "desc" }, { "$created": "asc" } ])
        );
    }
}
