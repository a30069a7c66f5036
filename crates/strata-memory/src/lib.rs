//! # strata-memory
//!
//! An in-memory document driver. Every operation delegates to the portable
//! evaluator, which makes this driver the executable statement of operator
//! semantics and the backend the scenario suites run against. Transactions
//! snapshot the whole store and restore it on rollback.

use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;

use strata_core::database::Database;
use strata_core::driver::{Converters, Driver, Stats, TableStats, run_migrations};
use strata_core::error::{Error, Result};
use strata_core::eval::Eval;
use strata_core::evaluator::{Executor, Scope};
use strata_core::model::{MigrationHost, Model};
use strata_core::selection::{Selection, SelectionKind};
use strata_core::value::{Object, Value};

type Tables = BTreeMap<String, Vec<Value>>;

/// An in-memory driver holding every table as a vector of rows.
#[derive(Debug, Default)]
pub struct MemoryDriver {
    tables: Mutex<Tables>,
    snapshot: Mutex<Option<Tables>>,
    converters: Converters,
}

impl MemoryDriver {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A database backed by a fresh store.
    #[must_use]
    pub fn database() -> Database {
        Database::new(Box::new(Self::new()))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn snapshot_lock(&self) -> std::sync::MutexGuard<'_, Option<Tables>> {
        self.snapshot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The read-only view mutations test and paginate against.
    fn view(&self) -> Tables {
        self.lock().clone()
    }

    /// Rows the mutating selection targets, honoring filter, sort, offset
    /// and limit.
    fn targets(exec: &Executor<'_>, selection: &Selection) -> Result<Vec<Value>> {
        let mut read = selection.clone();
        read.kind = SelectionKind::Get;
        read.args.fields = None;
        exec.execute(&read)
    }

    /// Applies an update payload to one row in place.
    fn apply_update(
        exec: &Executor<'_>,
        model: &Model,
        ref_name: &str,
        row: &mut Value,
        update: &Value,
    ) -> Result<()> {
        let flat = model.format(update.as_object().unwrap_or(&Object::new()), false)?;
        for (path, value) in &flat {
            let resolved = match value {
                Value::Expr(term) => {
                    let scope = Scope::new().push(ref_name, row.clone());
                    exec.eval(term, &scope, None)?
                }
                value => value.clone(),
            };
            row.set_path(path, model.resolve_value(path, resolved));
        }
        Ok(())
    }

    /// Seeds, checks and inserts one row; returns it with generated keys.
    fn insert_row(
        exec: &Executor<'_>,
        model: &Model,
        rows: &mut Vec<Value>,
        data: &Value,
    ) -> Result<Value> {
        let mut record = model.create(data.as_object().unwrap_or(&Object::new()));

        // Expression terms in an insert evaluate against the seeded record.
        let paths: Vec<String> = record
            .as_object()
            .map(|map| map.keys().cloned().collect())
            .unwrap_or_default();
        for path in paths {
            if let Some(Value::Expr(term)) = record.get_path(&path).cloned() {
                let scope = Scope::new().push(&model.name, record.clone());
                let resolved = exec.eval(&term, &scope, None)?;
                record.set_path(&path, resolved);
            }
        }

        if model.autoinc {
            if let Some(key) = model.primary.first() {
                if record.get_path(key).is_none_or(Value::is_null) {
                    let next = rows
                        .iter()
                        .filter_map(|row| row.get_path(key).and_then(Value::as_int))
                        .max()
                        .unwrap_or(0)
                        + 1;
                    record.set_path(key, Value::Int(next));
                }
            }
        }

        let mut constraints: Vec<Vec<String>> = vec![model.primary.clone()];
        constraints.extend(model.unique.clone());
        for constraint in constraints {
            if constraint.is_empty() {
                continue;
            }
            let tuple: Vec<Value> = constraint
                .iter()
                .map(|key| record.get_path(key).cloned().unwrap_or(Value::Null))
                .collect();
            if tuple.iter().any(Value::is_null) {
                continue;
            }
            let clash = rows.iter().any(|row| {
                constraint
                    .iter()
                    .zip(&tuple)
                    .all(|(key, value)| {
                        row.get_path(key).is_some_and(|existing| existing.loose_eq(value))
                    })
            });
            if clash {
                return Err(Error::DuplicateEntry(format!(
                    "{}.{}",
                    model.name,
                    constraint.join("+")
                )));
            }
        }

        rows.push(record.clone());
        Ok(record)
    }
}

/// Hooks are eligible only when stored rows still carry a governed legacy
/// field.
struct MemoryHost<'a> {
    rows: &'a [Value],
    dropped: Vec<String>,
}

impl MigrationHost for MemoryHost<'_> {
    fn before(&mut self, legacy: &[String]) -> bool {
        !legacy.is_empty()
            && self
                .rows
                .iter()
                .any(|row| legacy.iter().any(|field| row.get_path(field).is_some()))
    }

    fn after(&mut self, legacy: &[String]) {
        self.dropped.extend(legacy.iter().cloned());
    }

    fn finalize(&mut self) -> Result<()> {
        Ok(())
    }

    fn error(&mut self, error: &Error) {
        tracing::warn!(%error, "memory migration hook failed");
    }
}

#[async_trait]
impl Driver for MemoryDriver {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn start(&self, _db: &Database) -> Result<()> {
        Ok(())
    }

    async fn stop(&self, _db: &Database) -> Result<()> {
        self.lock().clear();
        Ok(())
    }

    async fn prepare(&self, db: &Database, table: &str) -> Result<()> {
        let model = db.model(table)?;
        let rows = self.view().get(table).cloned().unwrap_or_default();
        let mut host = MemoryHost {
            rows: &rows,
            dropped: Vec::new(),
        };
        run_migrations(db, &model, &mut host).await?;
        if host.dropped.is_empty() {
            return Ok(());
        }
        let mut guard = self.lock();
        if let Some(rows) = guard.get_mut(table) {
            for row in rows {
                if let Some(map) = row.as_object_mut() {
                    for field in &host.dropped {
                        map.remove(field);
                    }
                }
            }
        }
        Ok(())
    }

    async fn drop_table(&self, _db: &Database, table: &str) -> Result<()> {
        self.lock().remove(table);
        Ok(())
    }

    async fn drop_all(&self, _db: &Database) -> Result<()> {
        self.lock().clear();
        Ok(())
    }

    async fn stats(&self, _db: &Database) -> Result<Stats> {
        let tables = self.view();
        let mut stats = Stats::default();
        for (name, rows) in &tables {
            let size: usize = rows
                .iter()
                .map(|row| row.to_json().to_string().len())
                .sum();
            stats.tables.insert(
                name.clone(),
                TableStats {
                    count: rows.len() as u64,
                    size: size as u64,
                },
            );
            stats.size += size as u64;
        }
        Ok(stats)
    }

    async fn get(&self, db: &Database, selection: &Selection) -> Result<Vec<Value>> {
        let store = self.view();
        let registry = db.registry();
        let exec = Executor::new(&registry, &store);
        exec.execute(selection)
    }

    async fn eval(&self, db: &Database, selection: &Selection, term: &Eval) -> Result<Value> {
        let store = self.view();
        let registry = db.registry();
        let exec = Executor::new(&registry, &store);
        exec.evaluate(selection, term)
    }

    async fn set(&self, db: &Database, selection: &Selection, update: &Value) -> Result<u64> {
        let store = self.view();
        let registry = db.registry();
        let exec = Executor::new(&registry, &store);
        let model = registry.expect(&selection.model)?.clone();
        let mut targets = Self::targets(&exec, selection)?;

        let mut guard = self.lock();
        let rows = guard.entry(selection.model.clone()).or_default();
        let mut written = 0;
        for row in rows.iter_mut() {
            let Some(position) = targets.iter().position(|target| target == &*row) else {
                continue;
            };
            targets.remove(position);
            Self::apply_update(&exec, &model, &selection.ref_name, row, update)?;
            written += 1;
        }
        Ok(written)
    }

    async fn create(&self, db: &Database, selection: &Selection, row: &Value) -> Result<Value> {
        let store = self.view();
        let registry = db.registry();
        let exec = Executor::new(&registry, &store);
        let model = registry.expect(&selection.model)?.clone();
        let mut guard = self.lock();
        let rows = guard.entry(selection.model.clone()).or_default();
        Self::insert_row(&exec, &model, rows, row)
    }

    async fn upsert(
        &self,
        db: &Database,
        selection: &Selection,
        rows: &[Value],
        keys: &[String],
    ) -> Result<()> {
        let store = self.view();
        let registry = db.registry();
        let exec = Executor::new(&registry, &store);
        let model = registry.expect(&selection.model)?.clone();
        let mut guard = self.lock();
        let stored = guard.entry(selection.model.clone()).or_default();
        for row in rows {
            let tuple: Vec<Value> = keys
                .iter()
                .map(|key| row.get_path(key).cloned().unwrap_or(Value::Null))
                .collect();
            let existing = stored.iter_mut().find(|candidate| {
                keys.iter().zip(&tuple).all(|(key, value)| {
                    candidate
                        .get_path(key)
                        .is_some_and(|stored| stored.loose_eq(value))
                })
            });
            match existing {
                Some(existing) => {
                    Self::apply_update(&exec, &model, &selection.ref_name, existing, row)?;
                }
                None => {
                    Self::insert_row(&exec, &model, stored, row)?;
                }
            }
        }
        Ok(())
    }

    async fn remove(&self, db: &Database, selection: &Selection) -> Result<u64> {
        let store = self.view();
        let registry = db.registry();
        let exec = Executor::new(&registry, &store);
        let mut targets = Self::targets(&exec, selection)?;

        let mut guard = self.lock();
        let rows = guard.entry(selection.model.clone()).or_default();
        let before = rows.len();
        rows.retain(|row| {
            match targets.iter().position(|target| target == row) {
                Some(position) => {
                    targets.remove(position);
                    false
                }
                None => true,
            }
        });
        Ok((before - rows.len()) as u64)
    }

    async fn begin(&self, _db: &Database) -> Result<()> {
        let current = self.view();
        *self.snapshot_lock() = Some(current);
        Ok(())
    }

    async fn commit(&self, _db: &Database) -> Result<()> {
        *self.snapshot_lock() = None;
        Ok(())
    }

    async fn rollback(&self, _db: &Database) -> Result<()> {
        let restored = self
            .snapshot_lock()
            .take()
            .ok_or_else(|| Error::TransactionAborted("no open transaction".into()))?;
        *self.lock() = restored;
        Ok(())
    }

    fn converters(&self) -> &Converters {
        &self.converters
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_core::field::Field;
    use strata_core::model::ModelConfig;
    use strata_core::query::Query;

    async fn database() -> Database {
        let db = MemoryDriver::database();
        db.start().await.unwrap();
        db.extend(
            "user",
            [
                ("id".to_string(), Field::parse("unsigned").unwrap()),
                ("name".to_string(), Field::parse("string").unwrap()),
            ],
            ModelConfig::auto_primary("id"),
        )
        .await
        .unwrap();
        db
    }

    #[tokio::test]
    async fn test_create_returns_generated_key() {
        let db = database().await;
        let created = db
            .create("user", strata_core::object! { "name" => "flo" })
            .await
            .unwrap();
        assert_eq!(created.get_path("id"), Some(&Value::Int(1)));
        let created = db
            .create("user", strata_core::object! { "name" => "ada" })
            .await
            .unwrap();
        assert_eq!(created.get_path("id"), Some(&Value::Int(2)));
    }

    #[tokio::test]
    async fn test_duplicate_primary_is_rejected() {
        let db = database().await;
        db.create("user", strata_core::object! { "id" => 1_i64, "name" => "flo" })
            .await
            .unwrap();
        let result = db
            .create("user", strata_core::object! { "id" => 1_i64, "name" => "ada" })
            .await;
        assert!(matches!(result, Err(Error::DuplicateEntry(_))));
    }

    #[tokio::test]
    async fn test_upsert_updates_or_inserts() {
        let db = database().await;
        db.create("user", strata_core::object! { "id" => 1_i64, "name" => "flo" })
            .await
            .unwrap();
        db.upsert(
            "user",
            vec![
                strata_core::object! { "id" => 1_i64, "name" => "florence" },
                strata_core::object! { "id" => 2_i64, "name" => "ada" },
            ],
            &["id"],
        )
        .await
        .unwrap();
        let rows = db
            .get("user", Query::all(), &strata_core::Include::new())
            .await
            .unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(
            rows[0].get_path("name"),
            Some(&Value::String("florence".into()))
        );
    }

    #[tokio::test]
    async fn test_remove_returns_count() {
        let db = database().await;
        for name in ["a", "b"] {
            db.create("user", strata_core::object! { "name" => name })
                .await
                .unwrap();
        }
        let removed = db.remove("user", Query::eq("name", "a")).await.unwrap();
        assert_eq!(removed, 1);
        let rows = db
            .get("user", Query::all(), &strata_core::Include::new())
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[tokio::test]
    async fn test_stats_counts_rows() {
        let db = database().await;
        db.create("user", strata_core::object! { "name" => "flo" })
            .await
            .unwrap();
        let stats = db.stats().await.unwrap();
        assert_eq!(stats.tables["user"].count, 1);
        assert!(stats.size > 0);
    }
}
