//! The backend driver contract.
//!
//! A driver implements the narrow interface below over flat tables; relation
//! handling happens above it. Whatever a driver cannot push down to its
//! backend it completes by delegating to the portable evaluator over
//! retrieved rows, so the observable semantics never depend on the backend.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::database::Database;
use crate::error::{Error, Result};
use crate::eval::Eval;
use crate::model::{MigrationHost, Model};
use crate::selection::Selection;
use crate::types::{Type, TypeKind};
use crate::value::Value;

/// Row count and payload estimate of one table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct TableStats {
    /// Number of rows.
    pub count: u64,
    /// Estimated stored size in bytes.
    pub size: u64,
}

/// Aggregate statistics reported by a driver.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Stats {
    /// Per-table statistics.
    pub tables: BTreeMap<String, TableStats>,
    /// Estimated total stored size in bytes.
    pub size: u64,
}

/// A conversion pair between logical values and a driver's physical
/// representation of one type.
#[derive(Clone)]
pub struct Converter {
    /// Logical value to physical value.
    pub dump: Arc<dyn Fn(Value) -> Value + Send + Sync>,
    /// Physical value to logical value.
    pub load: Arc<dyn Fn(Value) -> Value + Send + Sync>,
}

impl Converter {
    /// A converter from a pair of functions.
    #[must_use]
    pub fn new(
        dump: impl Fn(Value) -> Value + Send + Sync + 'static,
        load: impl Fn(Value) -> Value + Send + Sync + 'static,
    ) -> Self {
        Self {
            dump: Arc::new(dump),
            load: Arc::new(load),
        }
    }
}

impl std::fmt::Debug for Converter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Converter")
    }
}

/// The per-type converter table of a driver, with `ancestor` fallback
/// chains for logical types the backend has no physical type for.
#[derive(Debug, Clone, Default)]
pub struct Converters {
    converters: BTreeMap<TypeKind, Converter>,
    ancestors: BTreeMap<TypeKind, TypeKind>,
}

impl Converters {
    /// An empty converter table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a converter pair for a logical type.
    pub fn register(&mut self, kind: TypeKind, converter: Converter) {
        self.converters.insert(kind, converter);
    }

    /// Declares that a type falls back to another type's converter.
    pub fn ancestor(&mut self, kind: TypeKind, ancestor: TypeKind) {
        self.ancestors.insert(kind, ancestor);
    }

    /// The converter for a type, following the ancestor chain.
    #[must_use]
    pub fn resolve(&self, kind: TypeKind) -> Option<&Converter> {
        let mut current = kind;
        loop {
            if let Some(converter) = self.converters.get(&current) {
                return Some(converter);
            }
            current = *self.ancestors.get(&current)?;
        }
    }

    /// Converts one field value through its type tree.
    #[must_use]
    pub fn dump_field(&self, ty: &Type, value: Value) -> Value {
        ty.transform(value, &|value, ty| match self.resolve(ty.kind) {
            Some(converter) => (converter.dump)(value),
            None => value,
        })
    }

    /// Reverses [`Converters::dump_field`].
    #[must_use]
    pub fn load_field(&self, ty: &Type, value: Value) -> Value {
        ty.transform(value, &|value, ty| match self.resolve(ty.kind) {
            Some(converter) => (converter.load)(value),
            None => value,
        })
    }

    /// Converts a logical row to its physical shape. The row record itself
    /// is structural; converters apply from its fields down.
    #[must_use]
    pub fn dump(&self, row_type: &Type, row: Value) -> Value {
        self.convert_row(row_type, row, true)
    }

    /// Converts a physical row back to its logical shape.
    #[must_use]
    pub fn load(&self, row_type: &Type, row: Value) -> Value {
        self.convert_row(row_type, row, false)
    }

    fn convert_row(&self, row_type: &Type, row: Value, dumping: bool) -> Value {
        let crate::types::Inner::Record(members) = &row_type.inner else {
            return row;
        };
        let Value::Object(map) = row else {
            return row;
        };
        Value::Object(
            map.into_iter()
                .map(|(key, value)| {
                    let converted = match members.get(&key) {
                        Some(ty) if dumping => self.dump_field(ty, value),
                        Some(ty) => self.load_field(ty, value),
                        None => value,
                    };
                    (key, converted)
                })
                .collect(),
        )
    }
}

/// The interface every backend implements.
///
/// All operations may fail with [`Error::Cancelled`] when an external
/// cancellation aborts in-flight work; transactional resources are released
/// on every exit path.
#[async_trait]
pub trait Driver: Send + Sync {
    /// A short identifier for logging.
    fn name(&self) -> &'static str;

    /// Opens connections and prepares the driver for use.
    async fn start(&self, db: &Database) -> Result<()>;

    /// Flushes and releases all resources.
    async fn stop(&self, db: &Database) -> Result<()>;

    /// Synchronizes the physical schema of one table with its model and
    /// runs eligible migration hooks.
    async fn prepare(&self, db: &Database, table: &str) -> Result<()>;

    /// Drops one table.
    async fn drop_table(&self, db: &Database, table: &str) -> Result<()>;

    /// Drops every table owned by the database.
    async fn drop_all(&self, db: &Database) -> Result<()>;

    /// Reports per-table statistics.
    async fn stats(&self, db: &Database) -> Result<Stats>;

    /// Reads the rows of a selection.
    async fn get(&self, db: &Database, selection: &Selection) -> Result<Vec<Value>>;

    /// Evaluates an expression over a selection.
    async fn eval(&self, db: &Database, selection: &Selection, term: &Eval) -> Result<Value>;

    /// Updates matching rows with the payload; returns the number of rows
    /// written.
    async fn set(&self, db: &Database, selection: &Selection, update: &Value) -> Result<u64>;

    /// Inserts one row and returns it with generated keys filled in.
    async fn create(&self, db: &Database, selection: &Selection, row: &Value) -> Result<Value>;

    /// Inserts or updates rows, matching existing rows on the key fields.
    async fn upsert(
        &self,
        db: &Database,
        selection: &Selection,
        rows: &[Value],
        keys: &[String],
    ) -> Result<()>;

    /// Deletes matching rows; returns the number of rows removed.
    async fn remove(&self, db: &Database, selection: &Selection) -> Result<u64>;

    /// Starts a transaction on a dedicated connection.
    async fn begin(&self, db: &Database) -> Result<()>;

    /// Commits the current transaction.
    async fn commit(&self, db: &Database) -> Result<()>;

    /// Rolls back the current transaction.
    async fn rollback(&self, db: &Database) -> Result<()>;

    /// The driver's physical type conversions.
    fn converters(&self) -> &Converters;
}

/// Runs a model's migration hooks against a host.
///
/// For every hook: `before` decides eligibility from the governed legacy
/// field set, the callback runs, `after` records the fields now safe to
/// drop. A failing callback is reported through `error` and does not stop
/// the remaining hooks. `finalize` runs once at the end.
///
/// # Errors
///
/// Propagates only `finalize` failures; callback errors are routed to the
/// host.
pub async fn run_migrations(
    db: &Database,
    model: &Model,
    host: &mut dyn MigrationHost,
) -> Result<()> {
    for hook in &model.migrations {
        let legacy: Vec<String> = hook
            .fields
            .iter()
            .flat_map(|field| model.legacy_names(field).to_vec())
            .collect();
        if !host.before(&legacy) {
            continue;
        }
        match (hook.run)(db).await {
            Ok(()) => host.after(&legacy),
            Err(error) => {
                tracing::warn!(
                    table = %model.name,
                    fields = ?hook.fields,
                    %error,
                    "migration hook failed"
                );
                host.error(&error);
            }
        }
    }
    host.finalize()
}

/// Translates a backend unique-violation message into the layer's error.
#[must_use]
pub fn duplicate_entry(detail: impl Into<String>) -> Error {
    Error::DuplicateEntry(detail.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_converter_ancestor_chain() {
        let mut converters = Converters::new();
        converters.register(
            TypeKind::String,
            Converter::new(|v| v, |v| v),
        );
        converters.ancestor(TypeKind::Time, TypeKind::String);
        assert!(converters.resolve(TypeKind::Time).is_some());
        assert!(converters.resolve(TypeKind::Binary).is_none());
    }

    #[test]
    fn test_dump_routes_through_type_tree() {
        let mut converters = Converters::new();
        converters.register(
            TypeKind::Boolean,
            Converter::new(
                |v| match v {
                    Value::Bool(b) => Value::Int(i64::from(b)),
                    other => other,
                },
                |v| match v {
                    Value::Int(n) => Value::Bool(n != 0),
                    other => other,
                },
            ),
        );
        let row_type = Type::record(
            [("ok".to_string(), Type::new(TypeKind::Boolean))]
                .into_iter()
                .collect(),
        );
        let dumped = converters.dump(&row_type, crate::object! { "ok" => true });
        assert_eq!(dumped.get_path("ok"), Some(&Value::Int(1)));
        let loaded = converters.load(&row_type, dumped);
        assert_eq!(loaded.get_path("ok"), Some(&Value::Bool(true)));
    }
}
