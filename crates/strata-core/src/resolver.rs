//! The relation resolver.
//!
//! Rewrites relation-bearing selections into relation-free plans: relation
//! predicates lower to correlated subqueries, nested mutation directives
//! split into an ordered cascade plan, and implicit many-to-many association
//! tables are synthesized and registered on first use.

use std::collections::BTreeMap;

use crate::error::{Error, Result};
use crate::eval::Eval;
use crate::field::Field;
use crate::model::{Model, ModelConfig, Registry};
use crate::query::{FieldCond, FieldOp, Query};
use crate::relation::{Relation, RelationKind, link_column};
use crate::selection::{SelTable, Selection};
use crate::value::Value;

/// Which relations a read descends into, recursively.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Include {
    /// Included relations by declaring field name.
    pub relations: BTreeMap<String, Include>,
}

impl Include {
    /// An empty include.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Includes a relation without descending further.
    #[must_use]
    pub fn relation(mut self, name: &str) -> Self {
        self.relations.insert(name.to_string(), Self::new());
        self
    }

    /// Includes a relation and descends into it.
    #[must_use]
    pub fn nested(mut self, name: &str, inner: Include) -> Self {
        self.relations.insert(name.to_string(), inner);
        self
    }

    /// Whether nothing is included.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.relations.is_empty()
    }

    /// Parses the JSON include shape: `{"successor": true}` or nested
    /// records. A `false` value excludes the relation.
    #[must_use]
    pub fn from_json(json: &serde_json::Value) -> Self {
        let mut include = Self::new();
        if let serde_json::Value::Object(map) = json {
            for (name, member) in map {
                match member {
                    serde_json::Value::Bool(true) => {
                        include.relations.insert(name.clone(), Self::new());
                    }
                    serde_json::Value::Object(_) => {
                        include
                            .relations
                            .insert(name.clone(), Self::from_json(member));
                    }
                    _ => {}
                }
            }
        }
        include
    }
}

/// A nested mutation directive on one relation slot, in execution order.
#[derive(Debug, Clone, PartialEq)]
pub enum CascadeOp {
    /// Clear the association with matching related rows.
    Disconnect(Query),
    /// Delete matching related rows outright.
    Remove(Query),
    /// Update matching related rows; all linked rows when the filter is
    /// absent. The update may itself carry cascades.
    Set {
        /// Filter over the related rows.
        filter: Option<Query>,
        /// The nested update payload.
        update: Value,
    },
    /// Insert related rows linked to the parent.
    Create(Vec<Value>),
    /// Insert-or-update related rows, linking on success.
    Upsert(Vec<Value>),
    /// Rebind existing related rows matching the query to this parent.
    Connect(Query),
}

impl CascadeOp {
    /// Position in the mandatory cascade order: disconnects, removes,
    /// updates, creates and upserts, connects.
    #[must_use]
    pub fn rank(&self) -> u8 {
        match self {
            Self::Disconnect(_) => 0,
            Self::Remove(_) => 1,
            Self::Set { .. } => 2,
            Self::Create(_) | Self::Upsert(_) => 3,
            Self::Connect(_) => 4,
        }
    }
}

/// One step of a mutation's flat cascade plan: a single directive on one
/// relation slot.
#[derive(Debug, Clone, PartialEq)]
pub struct Cascade {
    /// The declaring field name.
    pub field: String,
    /// The resolved relation.
    pub relation: Relation,
    /// The directive to apply.
    pub op: CascadeOp,
}

/// Splits a mutation payload into the plain-field part and a flat cascade
/// plan.
///
/// Directive keys (`$create`, `$upsert`, `$connect`, `$disconnect`, `$set`,
/// `$remove`) are parsed per relation slot. A plain value on a relation slot
/// is an implicit `$create` when `creating`, an implicit `$set` otherwise.
/// The plan is ordered across every relation slot of the payload:
/// disconnects, removes, updates, creates and upserts, connects.
///
/// # Errors
///
/// Returns [`Error::RelationUnresolved`] for malformed directives.
pub fn split_payload(model: &Model, payload: &Value, creating: bool) -> Result<(Value, Vec<Cascade>)> {
    let Value::Object(map) = payload else {
        return Ok((payload.clone(), Vec::new()));
    };
    let mut base = crate::value::Object::new();
    let mut plan = Vec::new();
    for (key, value) in map {
        let Some(relation) = model.relation(key) else {
            base.insert(key.clone(), value.clone());
            continue;
        };
        for op in parse_cascade(key, value, creating)? {
            plan.push(Cascade {
                field: key.clone(),
                relation: relation.clone(),
                op,
            });
        }
    }
    plan.sort_by_key(|cascade| cascade.op.rank());
    Ok((Value::Object(base), plan))
}

fn parse_cascade(field: &str, value: &Value, creating: bool) -> Result<Vec<CascadeOp>> {
    let directive = |key: &str| -> bool {
        matches!(
            key,
            "$create" | "$upsert" | "$connect" | "$disconnect" | "$set" | "$remove"
        )
    };
    match value {
        Value::Object(map) if map.keys().any(|key| directive(key)) => {
            let mut ops = Vec::new();
            for (key, operand) in map {
                ops.push(match key.as_str() {
                    "$create" => CascadeOp::Create(rows_of(operand)),
                    "$upsert" => CascadeOp::Upsert(rows_of(operand)),
                    "$connect" => CascadeOp::Connect(Query::parse(operand)?),
                    "$disconnect" => CascadeOp::Disconnect(Query::parse(operand)?),
                    "$remove" => CascadeOp::Remove(Query::parse(operand)?),
                    "$set" => parse_set(operand)?,
                    key => {
                        return Err(Error::unresolved(format!(
                            "unknown directive {key} on {field}"
                        )));
                    }
                });
            }
            Ok(ops)
        }
        // Plain values: nested create on insertion, nested update otherwise.
        Value::Null => Ok(vec![CascadeOp::Disconnect(Query::all())]),
        value if creating => Ok(vec![CascadeOp::Create(rows_of(value))]),
        value => Ok(vec![CascadeOp::Set {
            filter: None,
            update: value.clone(),
        }]),
    }
}

fn parse_set(operand: &Value) -> Result<CascadeOp> {
    if let Value::Object(map) = operand {
        if map.len() == 2 && map.contains_key("where") && map.contains_key("update") {
            let filter = map
                .get("where")
                .map(Query::parse)
                .transpose()?
                .unwrap_or_default();
            let update = map.get("update").cloned().unwrap_or(Value::Null);
            return Ok(CascadeOp::Set {
                filter: Some(filter),
                update,
            });
        }
    }
    Ok(CascadeOp::Set {
        filter: None,
        update: operand.clone(),
    })
}

fn rows_of(value: &Value) -> Vec<Value> {
    match value {
        Value::List(items) => items.clone(),
        value => vec![value.clone()],
    }
}

/// Replaces empty field paths — the primary-key placeholder left by scalar
/// relation shorthands — with the model's primary key field.
#[must_use]
pub fn fill_primary(query: &Query, model: &Model) -> Query {
    match query {
        Query::And(branches) => {
            Query::And(branches.iter().map(|b| fill_primary(b, model)).collect())
        }
        Query::Or(branches) => {
            Query::Or(branches.iter().map(|b| fill_primary(b, model)).collect())
        }
        Query::Not(branch) => Query::Not(Box::new(fill_primary(branch, model))),
        Query::Expr(_) => query.clone(),
        Query::Field { path, cond } => Query::Field {
            path: if path.is_empty() {
                model.primary.first().cloned().unwrap_or_default()
            } else {
                path.clone()
            },
            cond: cond.clone(),
        },
    }
}

/// The fields a cascading upsert matches existing rows on: the first unique
/// constraint when one is declared, the primary key otherwise.
#[must_use]
pub fn natural_keys(model: &Model) -> Vec<String> {
    model
        .unique
        .first()
        .cloned()
        .unwrap_or_else(|| model.primary.clone())
}

/// Registers the implicit association model for a many-to-many relation on
/// first use and returns the link table name.
///
/// The table's columns are exactly the composite primaries of both sides,
/// named `{table}_{field}`, and its primary key is their concatenation.
///
/// # Errors
///
/// Returns [`Error::RelationUnresolved`] when either endpoint is unknown.
pub fn ensure_link_model(registry: &mut Registry, owner: &str, relation: &Relation) -> Result<String> {
    let link_table = relation.link_table(owner);
    if registry.contains(&link_table) {
        return Ok(link_table);
    }
    let mut fields = Vec::new();
    let mut primary = Vec::new();
    for (table, shared) in [
        (owner, None),
        (relation.target.as_str(), Some(&relation.shared)),
    ] {
        let model = registry.expect(table)?;
        for key in model.primary.clone() {
            let column = link_column(table, &key);
            // A shared field aliases the link key of the other endpoint
            // rather than adding a second column.
            if let Some(shared) = shared {
                if shared.values().any(|remote| *remote == key) {
                    continue;
                }
            }
            let field = model
                .field(&key)
                .cloned()
                .unwrap_or_else(|| Field::new(crate::types::TypeKind::Unsigned));
            fields.push((column.clone(), field));
            primary.push(column);
        }
    }
    registry.extend(
        &link_table,
        fields,
        ModelConfig {
            primary,
            ..ModelConfig::default()
        },
    )?;
    tracing::debug!(table = %link_table, "registered implicit association table");
    Ok(link_table)
}

/// Rewrites every relation predicate in a selection into a correlated
/// subquery, leaving a plan any driver can execute without relation
/// knowledge.
///
/// # Errors
///
/// Returns [`Error::RelationUnresolved`] for predicates on undeclared
/// relations.
pub fn lower_relations(registry: &mut Registry, selection: &Selection) -> Result<Selection> {
    let mut lowered = selection.clone();
    if let SelTable::Join(parts) = &selection.table {
        let mut lowered_parts = Vec::with_capacity(parts.len());
        for (name, part) in parts {
            lowered_parts.push((name.clone(), lower_relations(registry, part)?));
        }
        lowered.table = SelTable::Join(lowered_parts);
        return Ok(lowered);
    }
    let model = registry.expect(&selection.model)?.clone();
    lowered.query = lower_query(registry, &model, &selection.query, &selection.ref_name)?;
    Ok(lowered)
}

fn lower_query(
    registry: &mut Registry,
    model: &Model,
    query: &Query,
    parent_ref: &str,
) -> Result<Query> {
    match query {
        Query::And(branches) => Ok(Query::And(
            branches
                .iter()
                .map(|branch| lower_query(registry, model, branch, parent_ref))
                .collect::<Result<_>>()?,
        )),
        Query::Or(branches) => Ok(Query::Or(
            branches
                .iter()
                .map(|branch| lower_query(registry, model, branch, parent_ref))
                .collect::<Result<_>>()?,
        )),
        Query::Not(branch) => Ok(Query::Not(Box::new(lower_query(
            registry, model, branch, parent_ref,
        )?))),
        Query::Expr(_) => Ok(query.clone()),
        Query::Field { path, cond } => {
            let path = if path.is_empty() {
                model.primary.first().cloned().unwrap_or_default()
            } else {
                path.clone()
            };
            match model.relation(&path) {
                Some(relation) => {
                    let relation = relation.clone();
                    lower_relation_cond(registry, model, &path, &relation, cond, parent_ref)
                }
                None => Ok(Query::Field {
                    path,
                    cond: cond.clone(),
                }),
            }
        }
    }
}

/// Builds the correlated child selection for one relation: the child table
/// filtered down to the rows associated with the parent scope.
fn correlated_child(
    registry: &mut Registry,
    model: &Model,
    field: &str,
    relation: &Relation,
    parent_ref: &str,
) -> Result<Selection> {
    let child_ref = format!("{parent_ref}.{field}");
    let mut child = Selection::new(&relation.target, &child_ref);
    match relation.kind {
        RelationKind::OneToOne | RelationKind::ManyToOne | RelationKind::OneToMany => {
            for (local, remote) in relation.local.iter().zip(&relation.remote) {
                child = child.filter(Query::field(
                    remote,
                    FieldOp::Eq(Value::Expr(Box::new(Eval::scoped(parent_ref, local)))),
                ));
            }
        }
        RelationKind::ManyToMany => {
            let link_table = ensure_link_model(registry, &model.name, relation)?;
            let link_ref = format!("{child_ref}#link");
            let mut link = Selection::new(&link_table, &link_ref);
            for key in &model.primary {
                link = link.filter(Query::field(
                    &link_column(&model.name, key),
                    FieldOp::Eq(Value::Expr(Box::new(Eval::scoped(parent_ref, key)))),
                ));
            }
            let target = registry.expect(&relation.target)?;
            for key in target.primary.clone() {
                link = link.filter(Query::field(
                    &link_column(&relation.target, &key),
                    FieldOp::Eq(Value::Expr(Box::new(Eval::scoped(&child_ref, &key)))),
                ));
            }
            child = child.filter(Query::Expr(
                Eval::length(Eval::exec(link)).gt(Eval::literal(0_i64)),
            ));
        }
    }
    Ok(child)
}

fn exists(child: Selection) -> Query {
    Query::Expr(Eval::length(Eval::exec(child)).gt(Eval::literal(0_i64)))
}

fn not_exists(child: Selection) -> Query {
    Query::Expr(Eval::length(Eval::exec(child)).eq(Eval::literal(0_i64)))
}

fn lower_relation_cond(
    registry: &mut Registry,
    model: &Model,
    field: &str,
    relation: &Relation,
    cond: &FieldCond,
    parent_ref: &str,
) -> Result<Query> {
    let child_model = registry.expect(&relation.target)?.clone();
    let mut branches = Vec::new();
    for op in &cond.ops {
        let child = correlated_child(registry, model, field, relation, parent_ref)?;
        let child_ref = child.ref_name.clone();
        let lowered = |registry: &mut Registry, query: &Query| -> Result<Query> {
            lower_query(registry, &child_model, query, &child_ref)
        };
        branches.push(match op {
            FieldOp::Eq(Value::Null) => not_exists(child),
            FieldOp::Ne(Value::Null) => exists(child),
            FieldOp::Some(query) => exists(child.filter(lowered(registry, query)?)),
            FieldOp::None(query) => not_exists(child.filter(lowered(registry, query)?)),
            // `$every(q)` holds when no related row violates `q`; vacuously
            // true on the empty set.
            FieldOp::Every(query) => {
                not_exists(child.filter(Query::Not(Box::new(lowered(registry, query)?))))
            }
            FieldOp::Eq(value) => {
                let query = Query::eq("", value.clone());
                exists(child.filter(lowered(registry, &query)?))
            }
            FieldOp::In(values) => {
                let query = Query::within("", values.clone());
                exists(child.filter(lowered(registry, &query)?))
            }
            _ => {
                return Err(Error::unresolved(format!(
                    "unsupported operator on relation {}.{field}",
                    model.name
                )));
            }
        });
    }
    Ok(Query::And(branches))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ModelConfig;
    use crate::object;
    use serde_json::json;

    fn registry() -> Registry {
        let mut registry = Registry::new();
        registry
            .extend(
                "user",
                [
                    ("id".to_string(), Field::parse("unsigned").unwrap()),
                    ("name".to_string(), Field::parse("string").unwrap()),
                ],
                ModelConfig::primary("id"),
            )
            .unwrap();
        registry
            .extend(
                "post",
                [
                    ("id".to_string(), Field::parse("unsigned").unwrap()),
                    (
                        "author_id".to_string(),
                        Field::parse("unsigned").unwrap().nullable(),
                    ),
                ],
                ModelConfig::primary("id"),
            )
            .unwrap();
        registry
            .relate(
                "user",
                "posts",
                Relation::new(RelationKind::OneToMany, "post", "author")
                    .remote_fields(&["author_id"]),
            )
            .unwrap();
        registry
            .relate(
                "post",
                "author",
                Relation::new(RelationKind::ManyToOne, "user", "posts")
                    .local_fields(&["author_id"]),
            )
            .unwrap();
        registry
            .extend(
                "tag",
                [
                    ("id".to_string(), Field::parse("unsigned").unwrap()),
                    ("name".to_string(), Field::parse("string").unwrap()),
                ],
                ModelConfig::primary("id"),
            )
            .unwrap();
        registry
            .relate(
                "post",
                "tags",
                Relation::new(RelationKind::ManyToMany, "tag", "posts"),
            )
            .unwrap();
        registry
    }

    #[test]
    fn test_include_from_json() {
        let include = Include::from_json(&json!({
            "successor": true,
            "posts": {"author": true},
            "skipped": false,
        }));
        assert!(include.relations.contains_key("successor"));
        assert!(include.relations["posts"].relations.contains_key("author"));
        assert!(!include.relations.contains_key("skipped"));
    }

    #[test]
    fn test_split_payload_orders_cascade() {
        let registry = registry();
        let model = registry.get("user").unwrap();
        let payload = Value::from_json(&json!({
            "name": "flo",
            "posts": {
                "$connect": {"id": 1},
                "$create": [{"id": 9}],
                "$disconnect": {"id": 2},
            },
        }));
        let (base, plan) = split_payload(model, &payload, false).unwrap();
        assert_eq!(base, object! { "name" => "flo" });
        assert_eq!(plan.len(), 3);
        assert!(plan.iter().all(|cascade| cascade.field == "posts"));
        let ranks: Vec<u8> = plan.iter().map(|cascade| cascade.op.rank()).collect();
        assert_eq!(ranks, vec![0, 3, 4]);
    }

    #[test]
    fn test_plan_is_ordered_across_relations() {
        let registry = registry();
        let model = registry.get("post").unwrap();
        let payload = Value::from_json(&json!({
            "tags": {"$connect": {"name": "t1"}},
            "author": {"$disconnect": {}},
        }));
        let (_, plan) = split_payload(model, &payload, false).unwrap();
        let steps: Vec<(&str, u8)> = plan
            .iter()
            .map(|cascade| (cascade.field.as_str(), cascade.op.rank()))
            .collect();
        // The disconnect runs before the connect even though it belongs to
        // a different relation slot.
        assert_eq!(steps, vec![("author", 0), ("tags", 4)]);
    }

    #[test]
    fn test_plain_value_is_create_when_creating() {
        let registry = registry();
        let model = registry.get("user").unwrap();
        let payload = Value::from_json(&json!({"posts": [{"id": 1}]}));
        let (_, plan) = split_payload(model, &payload, true).unwrap();
        assert!(matches!(plan[0].op, CascadeOp::Create(ref rows) if rows.len() == 1));

        let (_, plan) = split_payload(model, &payload, false).unwrap();
        assert!(matches!(plan[0].op, CascadeOp::Set { .. }));
    }

    #[test]
    fn test_set_with_where_keeps_filter() {
        let registry = registry();
        let model = registry.get("user").unwrap();
        let payload = Value::from_json(&json!({
            "posts": {"$set": {"where": {"id": 1}, "update": {"author_id": 2}}},
        }));
        let (_, plan) = split_payload(model, &payload, false).unwrap();
        match &plan[0].op {
            CascadeOp::Set { filter, .. } => assert!(filter.is_some()),
            other => panic!("expected set, got {other:?}"),
        }
    }

    #[test]
    fn test_link_model_registration() {
        let mut registry = registry();
        let relation = registry.get("post").unwrap().relation("tags").unwrap().clone();
        let link = ensure_link_model(&mut registry, "post", &relation).unwrap();
        assert_eq!(link, "post_tag");
        let model = registry.get("post_tag").unwrap();
        assert_eq!(model.primary, vec!["post_id".to_string(), "tag_id".to_string()]);
        // Registration is idempotent.
        ensure_link_model(&mut registry, "post", &relation).unwrap();
    }

    #[test]
    fn test_lower_some_to_correlated_subquery() {
        let mut registry = registry();
        let selection = Selection::of("user").filter(
            Query::from_json(&json!({"posts": {"$some": {"id": 1}}})).unwrap(),
        );
        let lowered = lower_relations(&mut registry, &selection).unwrap();
        // The relation predicate is gone; an Exec-based existence check
        // replaced it.
        fn has_relation_ops(query: &Query) -> bool {
            match query {
                Query::And(branches) | Query::Or(branches) => {
                    branches.iter().any(has_relation_ops)
                }
                Query::Not(branch) => has_relation_ops(branch),
                Query::Expr(_) => false,
                Query::Field { cond, .. } => cond.ops.iter().any(|op| {
                    matches!(op, FieldOp::Some(_) | FieldOp::None(_) | FieldOp::Every(_))
                }),
            }
        }
        assert!(!has_relation_ops(&lowered.query));
    }

    #[test]
    fn test_lower_unknown_relation_op_fails() {
        let mut registry = registry();
        let selection = Selection::of("user").filter(Query::field(
            "posts",
            FieldOp::Gt(Value::Int(3)),
        ));
        assert!(matches!(
            lower_relations(&mut registry, &selection),
            Err(Error::RelationUnresolved(_))
        ));
    }
}
