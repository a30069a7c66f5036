//! End-to-end tests over an in-memory SQLite database: pushdown and
//! evaluator fallback, cascades through the resolver, transactions and
//! legacy-field migration.

use serde_json::json;
use strata_core::database::Database;
use strata_core::error::Error;
use strata_core::eval::Eval;
use strata_core::field::Field;
use strata_core::model::ModelConfig;
use strata_core::query::Query;
use strata_core::relation::{Relation, RelationKind};
use strata_core::resolver::Include;
use strata_core::value::Value;
use strata_core::object;
use strata_sqlite::SqliteDriver;

async fn database() -> Database {
    let db = Database::new(Box::new(SqliteDriver::in_memory()));
    db.start().await.unwrap();
    db.extend(
        "user",
        [
            ("id".to_string(), Field::parse("unsigned").unwrap()),
            ("name".to_string(), Field::parse("string(64)").unwrap()),
            ("age".to_string(), Field::parse("integer").unwrap()),
            ("profile".to_string(), Field::parse("json").unwrap()),
            ("admin".to_string(), Field::parse("boolean").unwrap()),
        ],
        ModelConfig::auto_primary("id").unique(&["name"]),
    )
    .await
    .unwrap();
    db
}

async fn seed(db: &Database) {
    for (name, age, admin) in [("flo", 30_i64, true), ("ada", 20, false), ("bob", 40, false)] {
        db.create(
            "user",
            object! { "name" => name, "age" => age, "admin" => admin },
        )
        .await
        .unwrap();
    }
}

#[tokio::test]
async fn test_create_get_round_trip() {
    let db = database().await;
    seed(&db).await;

    let rows = db
        .get("user", Query::eq("name", "flo"), &Include::new())
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get_path("id"), Some(&Value::Int(1)));
    assert_eq!(rows[0].get_path("age"), Some(&Value::Int(30)));
    assert_eq!(rows[0].get_path("admin"), Some(&Value::Bool(true)));
}

#[tokio::test]
async fn test_pushdown_and_fallback_agree() {
    let db = database().await;
    seed(&db).await;

    // Comparison pushes down to SQL.
    let pushed = db
        .get(
            "user",
            Query::from_json(&json!({"age": {"$gte": 30}})).unwrap(),
            &Include::new(),
        )
        .await
        .unwrap();
    // Regex runs through the evaluator fallback.
    let fallback = db
        .get(
            "user",
            Query::from_json(&json!({"age": {"$gte": 30}, "name": {"$regex": "."}})).unwrap(),
            &Include::new(),
        )
        .await
        .unwrap();
    let ids = |rows: &[Value]| -> Vec<i64> {
        rows.iter()
            .map(|row| row.get_path("id").and_then(Value::as_int).unwrap())
            .collect()
    };
    assert_eq!(ids(&pushed), ids(&fallback));
}

#[tokio::test]
async fn test_json_round_trip_preserves_empty_structures() {
    let db = database().await;
    db.create(
        "user",
        Value::from_json(&json!({"name": "flo", "profile": {}})),
    )
    .await
    .unwrap();
    let rows = db.get("user", Query::all(), &Include::new()).await.unwrap();
    assert_eq!(
        rows[0].get_path("profile"),
        Some(&Value::Object(strata_core::Object::new()))
    );
}

#[tokio::test]
async fn test_unique_violation_maps_to_duplicate_entry() {
    let db = database().await;
    seed(&db).await;
    let result = db.create("user", object! { "name" => "flo" }).await;
    assert!(matches!(result, Err(Error::DuplicateEntry(_))));
}

#[tokio::test]
async fn test_set_with_expression_term() {
    let db = database().await;
    seed(&db).await;
    db.set(
        "user",
        Query::eq("name", "ada"),
        object! { "age" => Value::Expr(Box::new(Eval::col("age").add(Eval::literal(1_i64)))) },
    )
    .await
    .unwrap();
    let rows = db
        .get("user", Query::eq("name", "ada"), &Include::new())
        .await
        .unwrap();
    assert_eq!(
        rows[0].get_path("age").and_then(Value::as_int),
        Some(21)
    );
}

#[tokio::test]
async fn test_relation_predicate_through_resolver() {
    let db = database().await;
    seed(&db).await;
    db.extend(
        "post",
        [
            ("id".to_string(), Field::parse("unsigned").unwrap()),
            ("title".to_string(), Field::parse("string").unwrap()),
            (
                "owner_id".to_string(),
                Field::parse("unsigned").unwrap().nullable(),
            ),
        ],
        ModelConfig::auto_primary("id"),
    )
    .await
    .unwrap();
    db.relate(
        "user",
        "posts",
        Relation::new(RelationKind::OneToMany, "post", "owner").remote_fields(&["owner_id"]),
    )
    .unwrap();
    db.create("post", Value::from_json(&json!({"title": "a", "owner_id": 2})))
        .await
        .unwrap();

    let query = Query::from_json(&json!({"posts": {"$some": {"title": "a"}}})).unwrap();
    let rows = db.get("user", query, &Include::new()).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get_path("name"), Some(&Value::String("ada".into())));

    let include = Include::from_json(&json!({"posts": true}));
    let rows = db.get("user", Query::eq("id", 2_i64), &include).await.unwrap();
    let posts = rows[0].get_path("posts").and_then(Value::as_list).unwrap();
    assert_eq!(posts.len(), 1);
}

#[tokio::test]
async fn test_transaction_rolls_back() {
    let db = database().await;
    seed(&db).await;

    let result: Result<(), Error> = db
        .with_transaction(|db| {
            Box::pin(async move {
                db.create("user", object! { "name" => "zoe" }).await?;
                Err(Error::Cancelled)
            })
        })
        .await;
    assert!(result.is_err());

    let rows = db.get("user", Query::all(), &Include::new()).await.unwrap();
    assert_eq!(rows.len(), 3);
}

#[tokio::test]
async fn test_legacy_field_migration() {
    let db = database().await;
    // Version 1 carries a `tag` column.
    db.extend(
        "item",
        [
            ("id".to_string(), Field::parse("unsigned").unwrap()),
            ("tag".to_string(), Field::parse("string").unwrap()),
        ],
        ModelConfig::auto_primary("id"),
    )
    .await
    .unwrap();
    db.create("item", object! { "tag" => "legacy" }).await.unwrap();

    // Version 2 renames it to `label`; the old column stays addressable as
    // a deprecated field while the hook copies it over.
    fn copy_tag_to_label(db: &Database) -> futures::future::BoxFuture<'_, Result<(), Error>> {
        Box::pin(async move {
            db.set(
                "item",
                Query::all(),
                object! { "label" => Value::Expr(Box::new(Eval::col("tag"))) },
            )
            .await?;
            Ok(())
        })
    }
    {
        let mut registry = db.registry_mut();
        let model = registry.get_mut("item").unwrap();
        model.migrate(&["label"], copy_tag_to_label);
    }
    db.extend(
        "item",
        [
            (
                "label".to_string(),
                Field::parse("string").unwrap().legacy(&["tag"]),
            ),
            (
                "tag".to_string(),
                Field::parse("string").unwrap().deprecated(),
            ),
        ],
        ModelConfig::default(),
    )
    .await
    .unwrap();

    let rows = db.get("item", Query::all(), &Include::new()).await.unwrap();
    assert_eq!(
        rows[0].get_path("label"),
        Some(&Value::String("legacy".into()))
    );
    // The legacy column was dropped after the hook completed.
    assert_eq!(rows[0].get_path("tag"), None);
}
