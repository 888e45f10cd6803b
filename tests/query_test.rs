//! LarkDB Rust SDK - query builder and subscription hash tests.

use larkdb::{and, field, not, or, Direction, Filter, Ordering, Query};
use serde_json::json;

#[test]
fn test_field_eq() {
    let f = field("age").eq(25);
    assert_eq!(f.to_json(), json!({ "age": 25 }));
}

#[test]
fn test_field_relations() {
    assert_eq!(field("price").gt(100).to_json(), json!({ "price": { "gt": 100 } }));
    assert_eq!(field("count").gte(10).to_json(), json!({ "count": { "gte": 10 } }));
    assert_eq!(field("age").lt(18).to_json(), json!({ "age": { "lt": 18 } }));
    assert_eq!(field("age").lte(65).to_json(), json!({ "age": { "lte": 65 } }));
}

#[test]
fn test_string_relations() {
    assert_eq!(
        field("name").contains("li").to_json(),
        json!({ "name": { "cnt": "li" } })
    );
    assert_eq!(
        field("name").starts_with("a").to_json(),
        json!({ "name": { "pref": "a" } })
    );
    assert_eq!(
        field("name").ends_with("e").to_json(),
        json!({ "name": { "suf": "e" } })
    );
    assert_eq!(
        field("tags").array_contains("rust").to_json(),
        json!({ "tags": { "arr-cnt": "rust" } })
    );
}

#[test]
fn test_compound_combinators() {
    let f = and(vec![field("a").eq(1), or(vec![field("b").eq(2), not(field("c").eq(3))])]);
    assert_eq!(
        f.to_json(),
        json!({ "and": [
            { "a": 1 },
            { "or": [ { "b": 2 }, { "not": { "c": 3 } } ] }
        ] })
    );
}

#[test]
fn test_filters_on_nested_key_paths() {
    let f = field("user.address.city").eq("zurich");
    assert_eq!(f.to_json(), json!({ "user.address.city": "zurich" }));
}

#[test]
fn test_equal_queries_share_a_hash() {
    let mut q1 = Query::default();
    q1.filter = Some(and(vec![field("a").eq(1), field("b").eq(2)]));
    q1.ordering.push(Ordering::new("$created", Direction::Asc));
    q1.paging.take = Some(20);

    let mut q2 = Query::default();
    // operand order flipped on a commutative operator
    q2.filter = Some(and(vec![field("b").eq(2), field("a").eq(1)]));
    q2.ordering.push(Ordering::new("$created", Direction::Asc));
    q2.paging.take = Some(20);

    assert_eq!(q1.subscription_hash("msg"), q2.subscription_hash("msg"));
}

#[test]
fn test_hash_separates_every_query_dimension() {
    let base = Query::default();
    let hash = |q: &Query| q.subscription_hash("msg");

    let mut filtered = base.clone();
    filtered.filter = Some(field("a").eq(1));

    let mut ordered = base.clone();
    ordered.ordering.push(Ordering::new("a", Direction::Asc));

    let mut ordered_desc = ordered.clone();
    ordered_desc.ordering[0].direction = Direction::Desc;

    let mut paged = base.clone();
    paged.paging.skip = Some(1);

    let hashes = [hash(&base), hash(&filtered), hash(&ordered), hash(&ordered_desc), hash(&paged)];
    for (i, a) in hashes.iter().enumerate() {
        for (j, b) in hashes.iter().enumerate() {
            if i != j {
                assert_ne!(a, b, "hash collision between variants {} and {}", i, j);
            }
        }
    }
}

#[test]
fn test_not_is_not_commutative_in_hash() {
    let f1 = not(and(vec![field("a").eq(1), field("b").eq(2)]));
    let f2 = and(vec![not(field("a").eq(1)), field("b").eq(2)]);
    assert_ne!(f1.canonical(), f2.canonical());
}

#[test]
fn test_filter_clone_and_eq() {
    let f = and(vec![field("a").eq(1), field("b").contains("x")]);
    let g: Filter = f.clone();
    assert_eq!(f, g);
}
