use super::*;
use crypto::Cipher;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use tempfile::tempdir;

struct MemSource {
    collections: Mutex<HashMap<String, HashMap<String, Value>>>,
}

impl MemSource {
    fn new() -> Arc<Self> {
        Arc::new(MemSource {
            collections: Mutex::new(HashMap::new()),
        })
    }

    fn insert(&self, collection: &str, doc_id: &str, doc: Value) {
        self.collections
            .lock()
            .entry(collection.to_string())
            .or_default()
            .insert(doc_id.to_string(), doc);
    }
}

impl DocumentSource for MemSource {
    fn get_document(&self, collection: &str, doc_id: &str) -> Option<Value> {
        self.collections.lock().get(collection)?.get(doc_id).cloned()
    }

    fn scan_collection(&self, collection: &str) -> Vec<(String, Value)> {
        self.collections
            .lock()
            .get(collection)
            .map(|docs| docs.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default()
    }
}

fn doc(pairs: &[(&str, Value)]) -> Value {
    let mut map = BTreeMap::new();
    for (k, v) in pairs {
        map.insert(k.to_string(), v.clone());
    }
    Value::Map(map)
}

fn harness() -> (tempfile::TempDir, Arc<MemSource>, Arc<IndexManager>) {
    let dir = tempdir().unwrap();
    let source = MemSource::new();
    let indexes = Arc::new(IndexManager::new(dir.path(), 4096, Arc::new(Cipher::none())));
    (dir, source, indexes)
}

fn user(name: &str, age: i64, email: &str) -> Value {
    doc(&[
        ("name", Value::String(name.to_string())),
        ("age", Value::Int(age)),
        ("email", Value::String(email.to_string())),
    ])
}

#[test]
fn full_scan_filters_by_residual_condition() {
    let (_dir, source, indexes) = harness();
    source.insert("users", "1", user("Alice", 30, "a@x.com"));
    source.insert("users", "2", user("Bob", 25, "b@x.com"));
    let exec = QueryExecutor::new(source, indexes);

    let query = Query::new("users").where_equals("age", Value::Int(30));
    let outcome = exec.execute(&query).unwrap();
    match outcome {
        QueryOutcome::Documents(docs) => {
            assert_eq!(docs.len(), 1);
            assert_eq!(docs[0].0, "1");
        }
        _ => panic!("expected Documents"),
    }
}

#[test]
fn indexed_equality_uses_the_index() {
    let (_dir, source, indexes) = harness();
    source.insert("users", "1", user("Alice", 30, "a@x.com"));
    source.insert("users", "2", user("Bob", 25, "b@x.com"));
    indexes
        .create_index(
            "users",
            "age",
            [("1", &Value::Int(30)), ("2", &Value::Int(25))],
        )
        .unwrap();
    let exec = QueryExecutor::new(source, indexes);

    let query = Query::new("users").where_equals("age", Value::Int(30));
    let outcome = exec.execute(&query).unwrap();
    match outcome {
        QueryOutcome::Documents(docs) => {
            assert_eq!(docs.len(), 1);
            assert_eq!(docs[0].0, "1");
        }
        _ => panic!("expected Documents"),
    }
}

#[test]
fn between_condition_on_index_intersects_range() {
    let (_dir, source, indexes) = harness();
    for (id, age) in [("1", 20), ("2", 30), ("3", 40)] {
        source.insert("users", id, user("x", age, "x@x.com"));
    }
    indexes
        .create_index(
            "users",
            "age",
            [("1", &Value::Int(20)), ("2", &Value::Int(30)), ("3", &Value::Int(40))],
        )
        .unwrap();
    let exec = QueryExecutor::new(source, indexes);

    let query = Query::new("users").where_cond(Condition::new(
        "age",
        CompareOp::Between,
        Value::List(vec![Value::Int(25), Value::Int(40)]),
    ));
    let outcome = exec.execute(&query).unwrap();
    match outcome {
        QueryOutcome::Documents(mut docs) => {
            docs.sort_by(|a, b| a.0.cmp(&b.0));
            let ids: Vec<&str> = docs.iter().map(|(id, _)| id.as_str()).collect();
            assert_eq!(ids, vec!["2", "3"]);
        }
        _ => panic!("expected Documents"),
    }
}

#[test]
fn order_by_and_limit_offset() {
    let (_dir, source, indexes) = harness();
    for (id, age) in [("1", 20), ("2", 30), ("3", 40)] {
        source.insert("users", id, user("x", age, "x@x.com"));
    }
    let exec = QueryExecutor::new(source, indexes);

    let query = Query::new("users").order_by("age", true).offset(1).limit(1);
    let outcome = exec.execute(&query).unwrap();
    match outcome {
        QueryOutcome::Documents(docs) => {
            assert_eq!(docs.len(), 1);
            assert_eq!(docs[0].0, "2");
        }
        _ => panic!("expected Documents"),
    }
}

#[test]
fn text_search_on_named_field_is_case_insensitive() {
    let (_dir, source, indexes) = harness();
    source.insert("users", "1", user("Alice", 30, "alice@example.com"));
    source.insert("users", "2", user("Bob", 25, "bob@example.com"));
    let exec = QueryExecutor::new(source, indexes);

    let query = Query::new("users").text_search("ALICE", Some("name".to_string()));
    let outcome = exec.execute(&query).unwrap();
    match outcome {
        QueryOutcome::Documents(docs) => assert_eq!(docs.len(), 1),
        _ => panic!("expected Documents"),
    }
}

#[test]
fn text_search_without_field_walks_all_string_leaves() {
    let (_dir, source, indexes) = harness();
    source.insert(
        "users",
        "1",
        doc(&[(
            "profile",
            doc(&[("bio", Value::String("loves RUST programming".to_string()))]),
        )]),
    );
    let exec = QueryExecutor::new(source, indexes);

    let query = Query::new("users").text_search("rust", None);
    let outcome = exec.execute(&query).unwrap();
    match outcome {
        QueryOutcome::Documents(docs) => assert_eq!(docs.len(), 1),
        _ => panic!("expected Documents"),
    }
}

#[test]
fn join_attaches_matching_documents_from_other_collection() {
    let (_dir, source, indexes) = harness();
    source.insert("orders", "o1", doc(&[("user_id", Value::Int(1))]));
    source.insert("users", "1", doc(&[("id", Value::Int(1)), ("name", Value::String("Alice".into()))]));
    indexes.create_index("users", "id", [("1", &Value::Int(1))]).unwrap();
    let exec = QueryExecutor::new(source, indexes);

    let query = Query::new("orders").join("users", "user_id", "id");
    let outcome = exec.execute(&query).unwrap();
    match outcome {
        QueryOutcome::Documents(docs) => {
            let (_, order) = &docs[0];
            if let Value::Map(fields) = order {
                let joined = fields.get("_joined_users").unwrap();
                assert!(matches!(joined, Value::List(v) if v.len() == 1));
            } else {
                panic!("expected map");
            }
        }
        _ => panic!("expected Documents"),
    }
}

#[test]
fn aggregate_sum_over_matching_documents() {
    let (_dir, source, indexes) = harness();
    source.insert("products", "1", doc(&[("category", Value::String("a".into())), ("price", Value::Int(10))]));
    source.insert("products", "2", doc(&[("category", Value::String("a".into())), ("price", Value::Int(20))]));
    source.insert("products", "3", doc(&[("category", Value::String("b".into())), ("price", Value::Int(5))]));
    let exec = QueryExecutor::new(source, indexes);

    let query = Query::new("products").aggregate(AggregateOp::Sum("price".to_string()));
    let outcome = exec.execute(&query).unwrap();
    match outcome {
        QueryOutcome::Aggregate(out) => assert_eq!(out.sum, Some(35.0)),
        _ => panic!("expected Aggregate"),
    }
}

#[test]
fn group_by_buckets_documents_and_aggregates_each() {
    let (_dir, source, indexes) = harness();
    source.insert("products", "1", doc(&[("category", Value::String("a".into())), ("price", Value::Int(10))]));
    source.insert("products", "2", doc(&[("category", Value::String("a".into())), ("price", Value::Int(20))]));
    source.insert("products", "3", doc(&[("category", Value::String("b".into())), ("price", Value::Int(5))]));
    let exec = QueryExecutor::new(source, indexes);

    let query = Query::new("products")
        .group_by("category")
        .aggregate(AggregateOp::Sum("price".to_string()));
    let outcome = exec.execute(&query).unwrap();
    match outcome {
        QueryOutcome::Grouped(mut buckets) => {
            buckets.sort_by(|a, b| a.key.as_comparison_string().cmp(&b.key.as_comparison_string()));
            assert_eq!(buckets.len(), 2);
            assert_eq!(buckets[0].key, Value::String("a".to_string()));
            assert_eq!(buckets[0].aggregate.as_ref().unwrap().sum, Some(30.0));
            assert_eq!(buckets[1].aggregate.as_ref().unwrap().sum, Some(5.0));
        }
        _ => panic!("expected Grouped"),
    }
}

#[test]
fn distinct_aggregate_deduplicates_values() {
    let (_dir, source, indexes) = harness();
    source.insert("products", "1", doc(&[("category", Value::String("a".into()))]));
    source.insert("products", "2", doc(&[("category", Value::String("a".into()))]));
    source.insert("products", "3", doc(&[("category", Value::String("b".into()))]));
    let exec = QueryExecutor::new(source, indexes);

    let query = Query::new("products").aggregate(AggregateOp::Distinct("category".to_string()));
    let outcome = exec.execute(&query).unwrap();
    match outcome {
        QueryOutcome::Aggregate(out) => assert_eq!(out.distinct_count, Some(2)),
        _ => panic!("expected Aggregate"),
    }
}

#[test]
fn in_condition_matches_membership() {
    let (_dir, source, indexes) = harness();
    source.insert("products", "1", doc(&[("category", Value::String("a".into()))]));
    source.insert("products", "2", doc(&[("category", Value::String("b".into()))]));
    source.insert("products", "3", doc(&[("category", Value::String("c".into()))]));
    let exec = QueryExecutor::new(source, indexes);

    let query = Query::new("products").where_cond(Condition::new(
        "category",
        CompareOp::In,
        Value::List(vec![Value::String("a".into()), Value::String("c".into())]),
    ));
    let outcome = exec.execute(&query).unwrap();
    match outcome {
        QueryOutcome::Documents(docs) => assert_eq!(docs.len(), 2),
        _ => panic!("expected Documents"),
    }
}
