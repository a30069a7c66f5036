//! Model declarations and the registry.
//!
//! A [`Model`] is the runtime description of one table: its fields in
//! declared order, keys, relations and migration hooks. Models are held by a
//! [`Registry`] owned by the database instance — there is no process-global
//! registry, so tests can instantiate fresh ones freely.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use futures::future::BoxFuture;

use crate::database::Database;
use crate::error::{Error, Result};
use crate::field::Field;
use crate::relation::{Relation, RelationKind, link_column};
use crate::types::{Type, TypeKind};
use crate::value::{Object, Value};

/// Configuration accepted by `extend` alongside the field list.
#[derive(Debug, Clone, Default)]
pub struct ModelConfig {
    /// Primary key fields in declared order.
    pub primary: Vec<String>,
    /// Whether the primary key autoincrements.
    pub autoinc: bool,
    /// Unique constraints; each entry may be composite.
    pub unique: Vec<Vec<String>>,
    /// Outgoing foreign keys: local field to `(table, field)`.
    pub foreign: BTreeMap<String, (String, String)>,
}

impl ModelConfig {
    /// A config with a single primary key field.
    #[must_use]
    pub fn primary(field: &str) -> Self {
        Self {
            primary: vec![field.to_string()],
            ..Self::default()
        }
    }

    /// A config with a single autoincrementing primary key field.
    #[must_use]
    pub fn auto_primary(field: &str) -> Self {
        Self {
            primary: vec![field.to_string()],
            autoinc: true,
            ..Self::default()
        }
    }

    /// Adds a unique constraint.
    #[must_use]
    pub fn unique(mut self, fields: &[&str]) -> Self {
        self.unique
            .push(fields.iter().map(ToString::to_string).collect());
        self
    }

    /// Adds an outgoing foreign key.
    #[must_use]
    pub fn foreign(mut self, field: &str, table: &str, target: &str) -> Self {
        self.foreign
            .insert(field.to_string(), (table.to_string(), target.to_string()));
        self
    }
}

/// A data-migration callback registered on a model.
///
/// The callback receives the owning database and may run any query against
/// it; the hosting driver decides eligibility and cleanup through
/// [`MigrationHost`].
#[derive(Clone)]
pub struct MigrationHook {
    /// Fields this callback introduces.
    pub fields: Vec<String>,
    /// The migration body.
    pub run: Arc<dyn for<'a> Fn(&'a Database) -> BoxFuture<'a, Result<()>> + Send + Sync>,
}

impl std::fmt::Debug for MigrationHook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MigrationHook")
            .field("fields", &self.fields)
            .finish_non_exhaustive()
    }
}

/// Driver-side protocol for running a model's migration hooks at prepare
/// time.
///
/// For every hook the driver calls `before` with the governed legacy field
/// set to decide eligibility, runs the callback, then `after` to record
/// fields safe to drop. `finalize` runs once per table. A failing callback
/// is reported through `error` and does not advance the migration.
pub trait MigrationHost: Send {
    /// Whether the hook's governed fields still need migrating.
    fn before(&mut self, legacy: &[String]) -> bool;
    /// Records the fields a completed hook leaves safe to drop.
    fn after(&mut self, legacy: &[String]);
    /// Called once per table after all hooks ran.
    fn finalize(&mut self) -> Result<()>;
    /// Reports a failed hook.
    fn error(&mut self, error: &Error);
}

/// The runtime description of one table.
#[derive(Debug, Clone, Default)]
pub struct Model {
    /// The table name.
    pub name: String,
    /// Fields in declared order.
    pub fields: Vec<(String, Field)>,
    /// Primary key fields in declared order.
    pub primary: Vec<String>,
    /// Whether the primary key autoincrements.
    pub autoinc: bool,
    /// Unique constraints.
    pub unique: Vec<Vec<String>>,
    /// Outgoing foreign keys.
    pub foreign: BTreeMap<String, (String, String)>,
    /// Relations keyed by the declaring field name.
    pub relations: BTreeMap<String, Relation>,
    /// Migration hooks in registration order.
    pub migrations: Vec<MigrationHook>,
}

impl Model {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Self::default()
        }
    }

    /// Looks up a declared field by name.
    #[must_use]
    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields
            .iter()
            .find(|(field, _)| field == name)
            .map(|(_, field)| field)
    }

    /// Looks up a relation by the declaring field name.
    #[must_use]
    pub fn relation(&self, name: &str) -> Option<&Relation> {
        self.relations.get(name)
    }

    /// The declared type of the whole row.
    #[must_use]
    pub fn row_type(&self) -> Type {
        let members = self
            .fields
            .iter()
            .map(|(name, field)| (name.clone(), Type::from_field(field)))
            .collect();
        Type::record(members)
    }

    /// Whether `name` is part of the primary key.
    #[must_use]
    pub fn is_primary(&self, name: &str) -> bool {
        self.primary.iter().any(|field| field == name)
    }

    /// Reads the primary key of a row, in declared key order.
    #[must_use]
    pub fn primary_key_of(&self, row: &Value) -> Vec<Value> {
        self.primary
            .iter()
            .map(|field| row.get_path(field).cloned().unwrap_or(Value::Null))
            .collect()
    }

    /// Flattens a nested record into dotted field keys, restricted to the
    /// declared fields.
    ///
    /// Nested objects descend until a declared field name matches; expression
    /// terms pass through verbatim. A key matching no declared field is
    /// rejected under `strict` and silently dropped otherwise.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidField`] for unknown fields under `strict`.
    pub fn format(&self, record: &Object, strict: bool) -> Result<Object> {
        let mut flat = Object::new();
        for (key, value) in record {
            self.format_into(key, value, strict, &mut flat)?;
        }
        Ok(flat)
    }

    fn format_into(&self, path: &str, value: &Value, strict: bool, out: &mut Object) -> Result<()> {
        if self.field(path).is_some() {
            out.insert(path.to_string(), value.clone());
            return Ok(());
        }
        if let Value::Object(map) = value {
            if !map.is_empty() {
                for (key, member) in map {
                    self.format_into(&format!("{path}.{key}"), member, strict, out)?;
                }
                return Ok(());
            }
        }
        if strict {
            return Err(Error::invalid_field(format!("{}.{path}", self.name)));
        }
        Ok(())
    }

    /// Reverses [`Model::format`]: regroups dotted keys into a nested record.
    #[must_use]
    pub fn parse(&self, flat: &Object) -> Value {
        let mut record = Value::Object(Object::new());
        for (key, value) in flat {
            record.set_path(key, value.clone());
        }
        record
    }

    /// Seeds a new record with field defaults, then overlays caller data.
    ///
    /// Exactly the declared fields with a non-null `initial` are seeded,
    /// excluding primary key members and deprecated fields. The overlay goes
    /// through [`Model::parse`] so dotted caller keys regroup.
    #[must_use]
    pub fn create(&self, data: &Object) -> Value {
        let mut record = Value::Object(Object::new());
        for (name, field) in &self.fields {
            if self.is_primary(name) || field.deprecated {
                continue;
            }
            if let Some(initial) = &field.initial {
                record.set_path(name, initial.clone());
            }
        }
        merge(&mut record, &self.parse(data));
        record
    }

    /// Normalizes a value for the named field.
    ///
    /// Time-of-day values have their date component reset to the epoch, so
    /// they round-trip identically across backends.
    #[must_use]
    pub fn resolve_value(&self, key: &str, value: Value) -> Value {
        let kind = self.field(key).map(|field| field.kind);
        match (kind, value) {
            (Some(TypeKind::Time), Value::DateTime(dt)) => Value::Time(dt.time()),
            (_, value) => value,
        }
    }

    /// Registers a migration callback governing the given fields.
    pub fn migrate(
        &mut self,
        fields: &[&str],
        run: impl for<'a> Fn(&'a Database) -> BoxFuture<'a, Result<()>> + Send + Sync + 'static,
    ) {
        self.migrations.push(MigrationHook {
            fields: fields.iter().map(ToString::to_string).collect(),
            run: Arc::new(run),
        });
    }

    /// All legacy names a field was known under, for migration resolution.
    #[must_use]
    pub fn legacy_names(&self, name: &str) -> &[String] {
        self.field(name).map_or(&[], |field| &field.legacy)
    }

    fn validate(&self) -> Result<()> {
        let declared: BTreeSet<&str> = self.fields.iter().map(|(name, _)| name.as_str()).collect();
        for key in self
            .primary
            .iter()
            .chain(self.unique.iter().flatten())
            .chain(self.foreign.keys())
        {
            if !declared.contains(key.as_str()) {
                return Err(Error::IndexMissing(format!("{}.{key}", self.name)));
            }
        }
        for (name, field) in &self.fields {
            if field.kind == TypeKind::Primary && !self.autoinc {
                return Err(Error::PrimaryAutoIncMismatch(format!(
                    "{}.{name}",
                    self.name
                )));
            }
        }
        Ok(())
    }
}

/// Deep-merges `patch` into `target`: objects merge member-wise, everything
/// else replaces.
pub fn merge(target: &mut Value, patch: &Value) {
    match (target, patch) {
        (Value::Object(target), Value::Object(patch)) => {
            for (key, value) in patch {
                match target.get_mut(key) {
                    Some(existing) => merge(existing, value),
                    None => {
                        target.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (target, patch) => *target = patch.clone(),
    }
}

/// The set of models owned by one database instance.
#[derive(Debug, Default)]
pub struct Registry {
    models: BTreeMap<String, Model>,
}

impl Registry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            models: BTreeMap::new(),
        }
    }

    /// Declares a table or merges fields into an existing declaration.
    ///
    /// A composite primary key disables autoincrement. All primary, unique
    /// and foreign key references must name declared fields. The declaration
    /// is validated before it is committed to the registry.
    ///
    /// # Errors
    ///
    /// Returns [`Error::IndexMissing`] for key references to unknown fields
    /// and [`Error::PrimaryAutoIncMismatch`] for `primary`-typed fields on a
    /// model without autoincrement.
    pub fn extend(
        &mut self,
        name: &str,
        fields: impl IntoIterator<Item = (String, Field)>,
        config: ModelConfig,
    ) -> Result<()> {
        let mut model = self.models.get(name).cloned().unwrap_or_else(|| Model::new(name));
        for (field_name, field) in fields {
            match model.fields.iter_mut().find(|(name, _)| *name == field_name) {
                Some((_, existing)) => *existing = field,
                None => model.fields.push((field_name, field)),
            }
        }
        if !config.primary.is_empty() {
            model.primary = config.primary;
        }
        model.autoinc = config.autoinc && model.primary.len() <= 1;
        model.unique.extend(config.unique);
        model.foreign.extend(config.foreign);
        model.validate()?;
        self.models.insert(name.to_string(), model);
        Ok(())
    }

    /// Declares a relation on `table.field`, filling key-column defaults.
    ///
    /// Owning kinds default their local columns to derived foreign-key names
    /// and their remote columns to the target primary key; parent kinds the
    /// other way around.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RelationUnresolved`] when the table is unknown.
    pub fn relate(&mut self, table: &str, field: &str, mut relation: Relation) -> Result<()> {
        let target_primary = self
            .models
            .get(&relation.target)
            .map(|model| model.primary.clone())
            .unwrap_or_default();
        let model = self
            .models
            .get_mut(table)
            .ok_or_else(|| Error::unresolved(format!("{table}.{field}")))?;
        if relation.local.is_empty() {
            relation.local = match relation.kind {
                RelationKind::OneToOne | RelationKind::ManyToOne => target_primary
                    .iter()
                    .map(|key| link_column(field, key))
                    .collect(),
                RelationKind::OneToMany | RelationKind::ManyToMany => model.primary.clone(),
            };
        }
        if relation.remote.is_empty() {
            relation.remote = match relation.kind {
                RelationKind::OneToOne | RelationKind::ManyToOne | RelationKind::ManyToMany => {
                    target_primary
                }
                RelationKind::OneToMany => model
                    .primary
                    .iter()
                    .map(|key| link_column(&relation.inverse, key))
                    .collect(),
            };
        }
        model.relations.insert(field.to_string(), relation);
        Ok(())
    }

    /// Looks up a model by table name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Model> {
        self.models.get(name)
    }

    /// Looks up a model by table name, mutably.
    pub fn get_mut(&mut self, name: &str) -> Option<&mut Model> {
        self.models.get_mut(name)
    }

    /// Looks up a model or fails with [`Error::RelationUnresolved`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::RelationUnresolved`] when the table is unknown.
    pub fn expect(&self, name: &str) -> Result<&Model> {
        self.get(name)
            .ok_or_else(|| Error::unresolved(name.to_string()))
    }

    /// Whether a table is declared.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.models.contains_key(name)
    }

    /// Iterates all declared models in name order.
    pub fn iter(&self) -> impl Iterator<Item = &Model> {
        self.models.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object;

    fn user_registry() -> Registry {
        let mut registry = Registry::new();
        registry
            .extend(
                "user",
                [
                    ("id".to_string(), Field::parse("unsigned").unwrap()),
                    ("name".to_string(), Field::parse("string").unwrap()),
                    ("meta".to_string(), Field::parse("json").unwrap()),
                ],
                ModelConfig::primary("id"),
            )
            .unwrap();
        registry
    }

    #[test]
    fn test_format_flattens_to_declared_fields() {
        let registry = user_registry();
        let model = registry.get("user").unwrap();
        let flat = model
            .format(
                object! {
                    "name" => "flo",
                    "meta" => object! { "nick" => "f" },
                }
                .as_object()
                .unwrap(),
                true,
            )
            .unwrap();
        assert_eq!(flat.get("name"), Some(&Value::String("flo".into())));
        assert_eq!(flat.get("meta"), Some(&object! { "nick" => "f" }));
    }

    #[test]
    fn test_format_matches_dotted_field_names() {
        let mut registry = Registry::new();
        registry
            .extend(
                "profile",
                [("meta.depth".to_string(), Field::parse("integer").unwrap())],
                ModelConfig::default(),
            )
            .unwrap();
        let model = registry.get("profile").unwrap();
        let flat = model
            .format(
                object! { "meta" => object! { "depth" => 3_i64 } }
                    .as_object()
                    .unwrap(),
                true,
            )
            .unwrap();
        assert_eq!(flat.get("meta.depth"), Some(&Value::Int(3)));
    }

    #[test]
    fn test_format_strict_rejects_unknown() {
        let registry = user_registry();
        let model = registry.get("user").unwrap();
        let result = model.format(object! { "bogus" => 1_i64 }.as_object().unwrap(), true);
        assert!(matches!(result, Err(Error::InvalidField(_))));
    }

    #[test]
    fn test_format_drops_unknown_without_strict() {
        let registry = user_registry();
        let model = registry.get("user").unwrap();
        let flat = model
            .format(
                object! { "name" => "flo", "bogus" => 1_i64 }.as_object().unwrap(),
                false,
            )
            .unwrap();
        assert_eq!(flat.get("name"), Some(&Value::String("flo".into())));
        assert_eq!(flat.get("bogus"), None);
    }

    #[test]
    fn test_format_preserves_expression_terms() {
        use crate::eval::Eval;
        let registry = user_registry();
        let model = registry.get("user").unwrap();
        let term = Value::Expr(Box::new(Eval::literal(Value::Int(1))));
        let flat = model
            .format(
                &Object::from([("name".to_string(), term.clone())]),
                true,
            )
            .unwrap();
        assert_eq!(flat.get("name"), Some(&term));
    }

    #[test]
    fn test_parse_reverses_format() {
        let mut registry = Registry::new();
        registry
            .extend(
                "profile",
                [
                    ("id".to_string(), Field::parse("unsigned").unwrap()),
                    ("meta.depth".to_string(), Field::parse("integer").unwrap()),
                ],
                ModelConfig::primary("id"),
            )
            .unwrap();
        let model = registry.get("profile").unwrap();
        let record = object! { "id" => 1_i64, "meta" => object! { "depth" => 3_i64 } };
        let flat = model.format(record.as_object().unwrap(), false).unwrap();
        assert_eq!(model.parse(&flat), record);
    }

    #[test]
    fn test_create_seeds_defaults_without_primary() {
        let registry = user_registry();
        let model = registry.get("user").unwrap();
        let record = model.create(object! { "name" => "flo" }.as_object().unwrap());
        assert_eq!(record.get_path("id"), None);
        assert_eq!(record.get_path("name"), Some(&Value::String("flo".into())));
        assert_eq!(record.get_path("meta"), Some(&Value::Object(Object::new())));
    }

    #[test]
    fn test_create_skips_deprecated_fields() {
        let mut registry = Registry::new();
        registry
            .extend(
                "log",
                [
                    ("id".to_string(), Field::parse("unsigned").unwrap()),
                    (
                        "old_tag".to_string(),
                        Field::parse("string").unwrap().deprecated(),
                    ),
                ],
                ModelConfig::primary("id"),
            )
            .unwrap();
        let record = registry.get("log").unwrap().create(&Object::new());
        assert_eq!(record.get_path("old_tag"), None);
    }

    #[test]
    fn test_extend_validates_key_references() {
        let mut registry = Registry::new();
        let result = registry.extend(
            "user",
            [("id".to_string(), Field::parse("unsigned").unwrap())],
            ModelConfig::primary("uid"),
        );
        assert!(matches!(result, Err(Error::IndexMissing(_))));
        assert!(!registry.contains("user"));
    }

    #[test]
    fn test_primary_type_requires_autoinc() {
        let mut registry = Registry::new();
        let result = registry.extend(
            "user",
            [("id".to_string(), Field::parse("primary").unwrap())],
            ModelConfig::primary("id"),
        );
        assert!(matches!(result, Err(Error::PrimaryAutoIncMismatch(_))));
    }

    #[test]
    fn test_composite_primary_disables_autoinc() {
        let mut registry = Registry::new();
        registry
            .extend(
                "member",
                [
                    ("guild".to_string(), Field::parse("unsigned").unwrap()),
                    ("user".to_string(), Field::parse("unsigned").unwrap()),
                ],
                ModelConfig {
                    primary: vec!["guild".into(), "user".into()],
                    autoinc: true,
                    ..ModelConfig::default()
                },
            )
            .unwrap();
        assert!(!registry.get("member").unwrap().autoinc);
    }

    #[test]
    fn test_extend_merges_fields() {
        let mut registry = user_registry();
        registry
            .extend(
                "user",
                [("age".to_string(), Field::parse("integer").unwrap())],
                ModelConfig::default(),
            )
            .unwrap();
        let model = registry.get("user").unwrap();
        assert!(model.field("age").is_some());
        assert!(model.field("name").is_some());
        assert_eq!(model.primary, vec!["id".to_string()]);
    }

    #[test]
    fn test_relate_fills_key_defaults() {
        let mut registry = user_registry();
        registry
            .extend(
                "post",
                [
                    ("id".to_string(), Field::parse("unsigned").unwrap()),
                    ("author_id".to_string(), Field::parse("unsigned").unwrap()),
                ],
                ModelConfig::primary("id"),
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
            .relate(
                "user",
                "posts",
                Relation::new(RelationKind::OneToMany, "post", "author")
                    .remote_fields(&["author_id"]),
            )
            .unwrap();
        let post = registry.get("post").unwrap().relation("author").unwrap().clone();
        assert_eq!(post.remote, vec!["id".to_string()]);
        let user = registry.get("user").unwrap().relation("posts").unwrap().clone();
        assert_eq!(user.local, vec!["id".to_string()]);
    }

    #[test]
    fn test_resolve_value_normalizes_time() {
        let mut registry = Registry::new();
        registry
            .extend(
                "shift",
                [("starts".to_string(), Field::parse("time").unwrap())],
                ModelConfig::default(),
            )
            .unwrap();
        let model = registry.get("shift").unwrap();
        let dt = chrono::NaiveDate::from_ymd_opt(2024, 5, 1)
            .unwrap()
            .and_hms_opt(9, 30, 0)
            .unwrap();
        assert_eq!(
            model.resolve_value("starts", Value::DateTime(dt)),
            Value::Time(dt.time())
        );
    }
}
