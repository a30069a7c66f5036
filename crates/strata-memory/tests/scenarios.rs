//! End-to-end scenarios over the memory driver: relation includes, cascaded
//! mutations, relation predicates and transaction behavior.

use serde_json::json;
use strata_core::database::Database;
use strata_core::eval::Eval;
use strata_core::field::Field;
use strata_core::model::ModelConfig;
use strata_core::query::Query;
use strata_core::relation::{Relation, RelationKind};
use strata_core::resolver::{Include, lower_relations};
use strata_core::value::Value;
use strata_core::{Error, object};
use strata_memory::MemoryDriver;

async fn blog() -> Database {
    let db = MemoryDriver::database();
    db.start().await.unwrap();
    db.extend(
        "user",
        [
            ("id".to_string(), Field::parse("unsigned").unwrap()),
            ("value".to_string(), Field::parse("integer").unwrap()),
            ("flags".to_string(), Field::parse("integer").unwrap()),
            (
                "successor_id".to_string(),
                Field::parse("unsigned").unwrap().nullable(),
            ),
            (
                "predecessor_id".to_string(),
                Field::parse("unsigned").unwrap().nullable(),
            ),
        ],
        ModelConfig::auto_primary("id"),
    )
    .await
    .unwrap();
    db.extend(
        "post",
        [
            ("id2".to_string(), Field::parse("unsigned").unwrap()),
            ("title".to_string(), Field::parse("string").unwrap()),
            (
                "owner_id".to_string(),
                Field::parse("unsigned").unwrap().nullable(),
            ),
            (
                "author_id".to_string(),
                Field::parse("unsigned").unwrap().nullable(),
            ),
        ],
        ModelConfig::auto_primary("id2"),
    )
    .await
    .unwrap();
    db.extend(
        "tag",
        [
            ("id".to_string(), Field::parse("unsigned").unwrap()),
            ("name".to_string(), Field::parse("string").unwrap()),
        ],
        ModelConfig::auto_primary("id").unique(&["name"]),
    )
    .await
    .unwrap();

    db.relate(
        "user",
        "successor",
        Relation::new(RelationKind::OneToOne, "user", "predecessor")
            .local_fields(&["successor_id"]),
    )
    .unwrap();
    db.relate(
        "user",
        "predecessor",
        Relation::new(RelationKind::OneToOne, "user", "successor")
            .local_fields(&["predecessor_id"]),
    )
    .unwrap();
    db.relate(
        "user",
        "posts",
        Relation::new(RelationKind::OneToMany, "post", "owner").remote_fields(&["owner_id"]),
    )
    .unwrap();
    db.relate(
        "post",
        "owner",
        Relation::new(RelationKind::ManyToOne, "user", "posts").local_fields(&["owner_id"]),
    )
    .unwrap();
    db.relate(
        "post",
        "author",
        Relation::new(RelationKind::ManyToOne, "user", "authored").local_fields(&["author_id"]),
    )
    .unwrap();
    db.relate(
        "post",
        "tags",
        Relation::new(RelationKind::ManyToMany, "tag", "posts"),
    )
    .unwrap();
    db.relate(
        "tag",
        "posts",
        Relation::new(RelationKind::ManyToMany, "post", "tags"),
    )
    .unwrap();
    db
}

async fn seed_users(db: &Database) {
    db.create("user", Value::from_json(&json!({"id": 1, "value": 0, "flags": 5})))
        .await
        .unwrap();
    db.create(
        "user",
        Value::from_json(&json!({"id": 2, "value": 1, "flags": 2, "successor_id": 1})),
    )
    .await
    .unwrap();
    db.create("user", Value::from_json(&json!({"id": 3, "value": 2, "flags": 0})))
        .await
        .unwrap();
}

fn ids(rows: &[Value], key: &str) -> Vec<i64> {
    rows.iter()
        .map(|row| row.get_path(key).and_then(Value::as_int).unwrap())
        .collect()
}

#[tokio::test]
async fn test_nested_include_attaches_to_one() {
    let db = blog().await;
    seed_users(&db).await;

    let include = Include::from_json(&json!({"successor": true}));
    let rows = db.get("user", Query::all(), &include).await.unwrap();

    assert_eq!(rows.len(), 3);
    assert_eq!(rows[0].get_path("successor"), Some(&Value::Null));
    assert_eq!(rows[2].get_path("successor"), Some(&Value::Null));
    let successor = rows[1].get_path("successor").unwrap();
    assert_eq!(successor.get_path("id"), Some(&Value::Int(1)));
    assert_eq!(successor.get_path("value"), Some(&Value::Int(0)));
}

#[tokio::test]
async fn test_bitwise_and_logical_polymorphism() {
    let db = blog().await;
    seed_users(&db).await;

    let selection = db.select("user").filter(Query::eq("id", 1_i64));
    let term = Eval::array(Eval::col("flags").and(Eval::literal(6_i64)));
    let value = db.eval(&selection, &term).await.unwrap();
    assert_eq!(value, Value::List(vec![Value::Int(4)]));
}

#[tokio::test]
async fn test_empty_logical_combinators() {
    let db = blog().await;
    seed_users(&db).await;

    let none = db
        .get("user", Query::from_json(&json!({"$or": []})).unwrap(), &Include::new())
        .await
        .unwrap();
    assert!(none.is_empty());

    let all = db
        .get("user", Query::from_json(&json!({"$and": []})).unwrap(), &Include::new())
        .await
        .unwrap();
    assert_eq!(all.len(), 3);
}

#[tokio::test]
async fn test_many_to_many_cascade_and_idempotent_connect() {
    let db = blog().await;

    db.create(
        "post",
        Value::from_json(&json!({
            "id2": 1,
            "title": "first",
            "tags": {"$create": [{"name": "t1"}, {"name": "t2"}]},
        })),
    )
    .await
    .unwrap();
    db.create(
        "post",
        Value::from_json(&json!({
            "id2": 2,
            "title": "second",
            "tags": {"$connect": {"name": "t1"}},
        })),
    )
    .await
    .unwrap();

    let include = Include::from_json(&json!({"tags": true}));
    let posts = db.get("post", Query::all(), &include).await.unwrap();
    let tags_of = |row: &Value| -> Vec<String> {
        row.get_path("tags")
            .and_then(Value::as_list)
            .unwrap()
            .iter()
            .map(|tag| tag.get_path("name").and_then(Value::as_str).unwrap().to_string())
            .collect()
    };
    assert_eq!(tags_of(&posts[0]), vec!["t1", "t2"]);
    assert_eq!(tags_of(&posts[1]), vec!["t1"]);

    let include = Include::from_json(&json!({"posts": true}));
    let tags = db.get("tag", Query::all(), &include).await.unwrap();
    let t1 = tags
        .iter()
        .find(|tag| tag.get_path("name") == Some(&Value::String("t1".into())))
        .unwrap();
    assert_eq!(
        ids(t1.get_path("posts").and_then(Value::as_list).unwrap(), "id2"),
        vec![1, 2]
    );

    // A duplicate connect must not create a duplicate association row.
    db.set(
        "post",
        Query::eq("id2", 2_i64),
        Value::from_json(&json!({"tags": {"$connect": {"name": "t1"}}})),
    )
    .await
    .unwrap();
    let tags = db.get("tag", Query::all(), &include).await.unwrap();
    let t1 = tags
        .iter()
        .find(|tag| tag.get_path("name") == Some(&Value::String("t1".into())))
        .unwrap();
    assert_eq!(
        ids(t1.get_path("posts").and_then(Value::as_list).unwrap(), "id2"),
        vec![1, 2]
    );
}

#[tokio::test]
async fn test_every_is_vacuous_on_empty_child_set() {
    let db = blog().await;
    seed_users(&db).await;
    // User 2 owns a post with an author; user 3 owns one without.
    db.create(
        "post",
        Value::from_json(&json!({"title": "a", "owner_id": 2, "author_id": 1})),
    )
    .await
    .unwrap();
    db.create(
        "post",
        Value::from_json(&json!({"title": "b", "owner_id": 3, "author_id": null})),
    )
    .await
    .unwrap();

    let query = Query::from_json(&json!({"posts": {"$every": {"author": null}}})).unwrap();
    let rows = db.get("user", query, &Include::new()).await.unwrap();
    assert_eq!(ids(&rows, "id"), vec![1, 3]);
}

#[tokio::test]
async fn test_some_none_relation_predicates() {
    let db = blog().await;
    seed_users(&db).await;
    db.create(
        "post",
        Value::from_json(&json!({"title": "a", "owner_id": 2, "author_id": 1})),
    )
    .await
    .unwrap();

    let some = Query::from_json(&json!({"posts": {"$some": {"title": "a"}}})).unwrap();
    let rows = db.get("user", some.clone(), &Include::new()).await.unwrap();
    assert_eq!(ids(&rows, "id"), vec![2]);

    // `$none(q)` is the complement of `$some(q)`.
    let none = Query::from_json(&json!({"posts": {"$none": {"title": "a"}}})).unwrap();
    let complement = db.get("user", none, &Include::new()).await.unwrap();
    assert_eq!(ids(&complement, "id"), vec![1, 3]);

    let not_some = Query::Not(Box::new(some));
    let negated = db.get("user", not_some, &Include::new()).await.unwrap();
    assert_eq!(ids(&negated, "id"), vec![1, 3]);

    // `$some` with an always-false predicate matches nothing.
    let never = Query::from_json(&json!({"posts": {"$some": {"$or": []}}})).unwrap();
    let rows = db.get("user", never, &Include::new()).await.unwrap();
    assert!(rows.is_empty());
}

#[tokio::test]
async fn test_relation_existence_query() {
    let db = blog().await;
    seed_users(&db).await;
    db.create(
        "post",
        Value::from_json(&json!({"title": "a", "owner_id": 2})),
    )
    .await
    .unwrap();

    let query = Query::from_json(&json!({"posts": null})).unwrap();
    let rows = db.get("user", query, &Include::new()).await.unwrap();
    assert_eq!(ids(&rows, "id"), vec![1, 3]);
}

#[tokio::test]
async fn test_one_to_one_reciprocal_connect() {
    let db = blog().await;
    seed_users(&db).await;

    db.set(
        "user",
        Query::eq("id", 2_i64),
        Value::from_json(&json!({"successor": {"$connect": {"id": 1}}})),
    )
    .await
    .unwrap();

    let rows = db.get("user", Query::all(), &Include::new()).await.unwrap();
    assert_eq!(rows[1].get_path("successor_id"), Some(&Value::Int(1)));
    assert_eq!(rows[0].get_path("predecessor_id"), Some(&Value::Int(2)));

    // Re-pointing the successor elsewhere clears the previous holder.
    db.set(
        "user",
        Query::eq("id", 3_i64),
        Value::from_json(&json!({"successor": {"$connect": {"id": 1}}})),
    )
    .await
    .unwrap();
    let rows = db.get("user", Query::all(), &Include::new()).await.unwrap();
    assert_eq!(rows[2].get_path("successor_id"), Some(&Value::Int(1)));
    assert_eq!(rows[0].get_path("predecessor_id"), Some(&Value::Int(3)));
    assert_eq!(rows[1].get_path("successor_id"), Some(&Value::Null));
}

#[tokio::test]
async fn test_one_to_many_cascade_lifecycle() {
    let db = blog().await;
    seed_users(&db).await;

    db.set(
        "user",
        Query::eq("id", 2_i64),
        Value::from_json(&json!({
            "posts": {"$create": [{"title": "a"}, {"title": "b"}]},
        })),
    )
    .await
    .unwrap();
    let posts = db.get("post", Query::all(), &Include::new()).await.unwrap();
    assert_eq!(posts.len(), 2);
    assert!(posts
        .iter()
        .all(|post| post.get_path("owner_id") == Some(&Value::Int(2))));

    // Nested update targets only linked children.
    db.set(
        "user",
        Query::eq("id", 2_i64),
        Value::from_json(&json!({
            "posts": {"$set": {"where": {"title": "a"}, "update": {"title": "a2"}}},
        })),
    )
    .await
    .unwrap();
    let posts = db.get("post", Query::all(), &Include::new()).await.unwrap();
    let titles: Vec<String> = posts
        .iter()
        .map(|post| {
            post.get_path("title")
                .and_then(Value::as_str)
                .unwrap()
                .to_string()
        })
        .collect();
    assert!(titles.iter().any(|title| title == "a2"));

    db.set(
        "user",
        Query::eq("id", 2_i64),
        Value::from_json(&json!({"posts": {"$disconnect": {"title": "a2"}}})),
    )
    .await
    .unwrap();
    let orphaned = db
        .get("post", Query::eq("title", "a2"), &Include::new())
        .await
        .unwrap();
    assert_eq!(orphaned[0].get_path("owner_id"), Some(&Value::Null));

    db.set(
        "user",
        Query::eq("id", 2_i64),
        Value::from_json(&json!({"posts": {"$remove": {"title": "b"}}})),
    )
    .await
    .unwrap();
    let remaining = db.get("post", Query::all(), &Include::new()).await.unwrap();
    assert_eq!(remaining.len(), 1);
}

#[tokio::test]
async fn test_transaction_rolls_back_on_error() {
    let db = blog().await;
    seed_users(&db).await;

    let result: Result<(), Error> = db
        .with_transaction(|db| {
            Box::pin(async move {
                db.create("user", object! { "id" => 9_i64, "value" => 9_i64 })
                    .await?;
                Err(Error::Cancelled)
            })
        })
        .await;
    assert!(matches!(result, Err(Error::Cancelled)));

    let rows = db.get("user", Query::all(), &Include::new()).await.unwrap();
    assert_eq!(rows.len(), 3);
}

#[tokio::test]
async fn test_lowered_predicates_match_native_semantics() {
    let db = blog().await;
    seed_users(&db).await;
    db.create(
        "post",
        Value::from_json(&json!({"title": "a", "owner_id": 2, "author_id": 1})),
    )
    .await
    .unwrap();

    let query = Query::from_json(&json!({"posts": {"$some": {"title": "a"}}})).unwrap();
    let native = db.get("user", query.clone(), &Include::new()).await.unwrap();

    let selection = db.select("user").filter(query);
    let lowered = lower_relations(&mut db.registry_mut(), &selection).unwrap();
    let via_subquery = db.execute(&lowered).await.unwrap();

    assert_eq!(ids(&native, "id"), ids(&via_subquery, "id"));
}

#[tokio::test]
async fn test_time_values_round_trip_on_epoch_date() {
    let db = blog().await;
    db.extend(
        "shift",
        [
            ("id".to_string(), Field::parse("unsigned").unwrap()),
            ("starts".to_string(), Field::parse("time").unwrap().nullable()),
        ],
        ModelConfig::auto_primary("id"),
    )
    .await
    .unwrap();

    let stamp = chrono::NaiveDate::from_ymd_opt(2024, 5, 1)
        .unwrap()
        .and_hms_opt(9, 30, 0)
        .unwrap();
    db.create("shift", object! { "starts" => Value::DateTime(stamp) })
        .await
        .unwrap();
    let rows = db.get("shift", Query::all(), &Include::new()).await.unwrap();
    assert_eq!(rows[0].get_path("starts"), Some(&Value::Time(stamp.time())));
}

#[tokio::test]
async fn test_empty_json_values_are_preserved() {
    let db = blog().await;
    db.extend(
        "doc",
        [
            ("id".to_string(), Field::parse("unsigned").unwrap()),
            ("meta".to_string(), Field::parse("json").unwrap()),
            ("items".to_string(), Field::parse("list").unwrap()),
        ],
        ModelConfig::auto_primary("id"),
    )
    .await
    .unwrap();

    db.create("doc", Value::from_json(&json!({}))).await.unwrap();
    let rows = db.get("doc", Query::all(), &Include::new()).await.unwrap();
    assert_eq!(
        rows[0].get_path("meta"),
        Some(&Value::Object(strata_core::Object::new()))
    );
    assert_eq!(rows[0].get_path("items"), Some(&Value::List(Vec::new())));
}
