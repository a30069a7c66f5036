//! # strata-sqlite
//!
//! A SQLite driver backed by `sqlx`. Simple filters, sorts and pagination
//! push down to parameterized SQL; relation predicates are first rewritten
//! by the resolver into correlated subqueries, and whatever still has no SQL
//! translation is completed by the portable evaluator over fetched rows.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use async_trait::async_trait;
use sqlx::Row;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};

use strata_core::database::Database;
use strata_core::driver::{Converters, Driver, Stats, TableStats, run_migrations};
use strata_core::error::{Error, Result};
use strata_core::eval::Eval;
use strata_core::evaluator::{Executor, Scope};
use strata_core::model::{MigrationHost, Model};
use strata_core::query::Query;
use strata_core::resolver::lower_relations;
use strata_core::selection::{Selection, SelectionKind};
use strata_core::types::Type;
use strata_core::value::{Object, Value};

pub mod builder;
pub mod convert;

use builder::{physical, plan_select, quote, where_clause};
use convert::{column_type, decode_row, is_stored};

type SqliteTx = sqlx::Transaction<'static, sqlx::Sqlite>;

/// A SQLite driver over a connection pool.
pub struct SqliteDriver {
    url: String,
    pool: OnceLock<SqlitePool>,
    transaction: tokio::sync::Mutex<Option<SqliteTx>>,
    converters: Converters,
}

impl std::fmt::Debug for SqliteDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteDriver")
            .field("url", &self.url)
            .finish_non_exhaustive()
    }
}

impl SqliteDriver {
    /// A driver for the given connection URL, e.g. `sqlite://data.db`.
    #[must_use]
    pub fn new(url: &str) -> Self {
        Self {
            url: url.to_string(),
            pool: OnceLock::new(),
            transaction: tokio::sync::Mutex::new(None),
            converters: convert::converters(),
        }
    }

    /// A driver over an in-memory database.
    #[must_use]
    pub fn in_memory() -> Self {
        Self::new("sqlite::memory:")
    }

    /// A database backed by this driver.
    #[must_use]
    pub fn database(url: &str) -> Database {
        Database::new(Box::new(Self::new(url)))
    }

    fn pool(&self) -> Result<&SqlitePool> {
        self.pool.get().ok_or_else(not_started)
    }

    async fn fetch(&self, sql: &str, params: &[Value]) -> Result<Vec<SqliteRow>> {
        tracing::debug!(%sql, "sqlite fetch");
        let mut query = sqlx::query(sql);
        for param in params {
            query = bind_value(query, param.clone());
        }
        let mut guard = self.transaction.lock().await;
        match guard.as_mut() {
            Some(tx) => query.fetch_all(&mut **tx).await.map_err(translate),
            None => query.fetch_all(self.pool()?).await.map_err(translate),
        }
    }

    async fn execute(&self, sql: &str, params: &[Value]) -> Result<sqlx::sqlite::SqliteQueryResult> {
        tracing::debug!(%sql, "sqlite execute");
        let mut query = sqlx::query(sql);
        for param in params {
            query = bind_value(query, param.clone());
        }
        let mut guard = self.transaction.lock().await;
        match guard.as_mut() {
            Some(tx) => query.execute(&mut **tx).await.map_err(translate),
            None => query.execute(self.pool()?).await.map_err(translate),
        }
    }

    /// Rewrites relation predicates into correlated subqueries.
    fn lower(db: &Database, selection: &Selection) -> Result<Selection> {
        let mut registry = db.registry_mut();
        lower_relations(&mut registry, selection)
    }

    /// Fetches every table the selection references into an in-memory store
    /// for the portable evaluator. Tables with no physical counterpart yet
    /// read as empty.
    async fn load_store(
        &self,
        db: &Database,
        selection: &Selection,
    ) -> Result<BTreeMap<String, Vec<Value>>> {
        let mut store = BTreeMap::new();
        for table in selection.referenced_tables() {
            let model = db.model(&table)?;
            let sql = format!("SELECT * FROM {}", quote(&table));
            let rows = match self.fetch(&sql, &[]).await {
                Ok(rows) => rows,
                Err(error) if is_missing_table(&error) => Vec::new(),
                Err(error) => return Err(error),
            };
            let rows = rows
                .iter()
                .map(|row| decode_row(&model, &self.converters, row))
                .collect::<Result<Vec<_>>>()?;
            store.insert(table, rows);
        }
        Ok(store)
    }

    /// Flattens and converts an update payload; `None` when a value has no
    /// physical form and the evaluator must take over.
    fn plan_update(&self, model: &Model, update: &Value) -> Result<Option<(String, Vec<Value>)>> {
        let flat = model.format(update.as_object().unwrap_or(&Object::new()), false)?;
        let mut assignments = Vec::new();
        let mut params = Vec::new();
        for (path, value) in &flat {
            let Some(field) = model.field(path) else {
                return Ok(None);
            };
            let value = model.resolve_value(path, value.clone());
            let dumped = self
                .converters
                .dump_field(&Type::from_field(field), value);
            let Some(bound) = physical(&dumped) else {
                return Ok(None);
            };
            assignments.push(format!("{} = ?", quote(path)));
            params.push(bound);
        }
        if assignments.is_empty() {
            return Ok(None);
        }
        Ok(Some((assignments.join(", "), params)))
    }

    /// Inserts one logical record, returning it with generated keys.
    async fn insert_record(&self, db: &Database, model: &Model, record: &Value) -> Result<Value> {
        let mut record = record.clone();
        let (columns, params) = {
            let registry = db.registry();
            let empty: BTreeMap<String, Vec<Value>> = BTreeMap::new();
            let exec = Executor::new(&registry, &empty);

            let flat = model.format(record.as_object().unwrap_or(&Object::new()), false)?;
            let mut columns = Vec::new();
            let mut params = Vec::new();
            for (path, value) in &flat {
                let Some(field) = model.field(path) else {
                    continue;
                };
                if !is_stored(field) {
                    continue;
                }
                let value = match value {
                    Value::Expr(term) => {
                        let scope = Scope::new().push(&model.name, record.clone());
                        let resolved = exec.eval(term, &scope, None)?;
                        record.set_path(path, resolved.clone());
                        resolved
                    }
                    value => value.clone(),
                };
                let value = model.resolve_value(path, value);
                let dumped = self
                    .converters
                    .dump_field(&Type::from_field(field), value);
                let bound = physical(&dumped)
                    .ok_or_else(|| Error::unlowerable(format!("unbindable value for {path}")))?;
                columns.push(quote(path));
                params.push(bound);
            }
            (columns, params)
        };

        let placeholders = vec!["?"; params.len()].join(", ");
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({placeholders})",
            quote(&model.name),
            columns.join(", ")
        );
        let result = self.execute(&sql, &params).await?;
        if model.autoinc {
            if let Some(key) = model.primary.first() {
                if record.get_path(key).is_none_or(Value::is_null) {
                    record.set_path(key, Value::Int(result.last_insert_rowid()));
                }
            }
        }
        Ok(record)
    }

    /// Updates one row addressed by its primary key.
    async fn update_by_key(
        &self,
        model: &Model,
        target: &Value,
        assignments: &str,
        params: &[Value],
    ) -> Result<()> {
        let mut sql = format!("UPDATE {} SET {assignments} WHERE ", quote(&model.name));
        let mut all_params = params.to_vec();
        let mut clauses = Vec::new();
        for key in &model.primary {
            clauses.push(format!("{} = ?", quote(key)));
            let value = target.get_path(key).cloned().unwrap_or(Value::Null);
            let field_type = model.field(key).map(Type::from_field).unwrap_or_else(Type::expr);
            let dumped = self.converters.dump_field(&field_type, value);
            all_params.push(physical(&dumped).unwrap_or(Value::Null));
        }
        sql.push_str(&clauses.join(" AND "));
        self.execute(&sql, &all_params).await?;
        Ok(())
    }
}

#[async_trait]
impl Driver for SqliteDriver {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    async fn start(&self, _db: &Database) -> Result<()> {
        // A single connection keeps in-memory databases coherent and gives
        // transactions a dedicated connection semantics.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect(&self.url)
            .await
            .map_err(Error::driver)?;
        let _ = self.pool.set(pool);
        Ok(())
    }

    async fn stop(&self, _db: &Database) -> Result<()> {
        if let Some(pool) = self.pool.get() {
            pool.close().await;
        }
        Ok(())
    }

    async fn prepare(&self, db: &Database, table: &str) -> Result<()> {
        let model = db.model(table)?;
        let mut defs = Vec::new();
        for (name, field) in &model.fields {
            if !is_stored(field) {
                continue;
            }
            let auto = model.autoinc && model.primary.len() == 1 && model.primary[0] == *name;
            let def = if auto {
                format!("{} INTEGER PRIMARY KEY AUTOINCREMENT", quote(name))
            } else {
                format!("{} {}", quote(name), column_type(field))
            };
            defs.push(def);
        }
        if !model.autoinc && !model.primary.is_empty() {
            let keys: Vec<String> = model.primary.iter().map(|k| quote(k)).collect();
            defs.push(format!("PRIMARY KEY ({})", keys.join(", ")));
        }
        for unique in &model.unique {
            let keys: Vec<String> = unique.iter().map(|k| quote(k)).collect();
            defs.push(format!("UNIQUE ({})", keys.join(", ")));
        }
        let sql = format!(
            "CREATE TABLE IF NOT EXISTS {} ({})",
            quote(table),
            defs.join(", ")
        );
        self.execute(&sql, &[]).await?;

        let existing: Vec<String> = self
            .fetch(&format!("PRAGMA table_info({})", quote(table)), &[])
            .await?
            .iter()
            .filter_map(|row| row.try_get::<String, _>("name").ok())
            .collect();
        for (name, field) in &model.fields {
            if !is_stored(field) || existing.iter().any(|col| col == name) {
                continue;
            }
            let sql = format!(
                "ALTER TABLE {} ADD COLUMN {} {}",
                quote(table),
                quote(name),
                column_type(field)
            );
            self.execute(&sql, &[]).await?;
        }

        let mut host = SqliteHost {
            existing,
            drops: Vec::new(),
        };
        run_migrations(db, &model, &mut host).await?;
        for column in host.drops {
            let sql = format!("ALTER TABLE {} DROP COLUMN {}", quote(table), quote(&column));
            if let Err(error) = self.execute(&sql, &[]).await {
                tracing::warn!(%error, %column, "failed to drop migrated column");
            }
        }
        Ok(())
    }

    async fn drop_table(&self, _db: &Database, table: &str) -> Result<()> {
        self.execute(&format!("DROP TABLE IF EXISTS {}", quote(table)), &[])
            .await?;
        Ok(())
    }

    async fn drop_all(&self, _db: &Database) -> Result<()> {
        let names: Vec<String> = self
            .fetch(
                "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%'",
                &[],
            )
            .await?
            .iter()
            .filter_map(|row| row.try_get::<String, _>("name").ok())
            .collect();
        for name in names {
            self.execute(&format!("DROP TABLE IF EXISTS {}", quote(&name)), &[])
                .await?;
        }
        Ok(())
    }

    async fn stats(&self, db: &Database) -> Result<Stats> {
        let mut stats = Stats::default();
        let tables: Vec<String> = db.registry().iter().map(|model| model.name.clone()).collect();
        for table in tables {
            let sql = format!("SELECT COUNT(*) AS count FROM {}", quote(&table));
            let count = match self.fetch(&sql, &[]).await {
                Ok(rows) => rows
                    .first()
                    .and_then(|row| row.try_get::<i64, _>("count").ok())
                    .unwrap_or(0),
                Err(error) if is_missing_table(&error) => 0,
                Err(error) => return Err(error),
            };
            stats.tables.insert(
                table,
                TableStats {
                    count: count as u64,
                    size: 0,
                },
            );
        }
        let pages = self
            .fetch("SELECT page_count * page_size AS size FROM pragma_page_count(), pragma_page_size()", &[])
            .await?;
        stats.size = pages
            .first()
            .and_then(|row| row.try_get::<i64, _>("size").ok())
            .unwrap_or(0) as u64;
        Ok(stats)
    }

    async fn get(&self, db: &Database, selection: &Selection) -> Result<Vec<Value>> {
        let lowered = Self::lower(db, selection)?;
        if let Some((sql, params)) = plan_select(&lowered) {
            let model = db.model(&lowered.model)?;
            return self
                .fetch(&sql, &params)
                .await?
                .iter()
                .map(|row| decode_row(&model, &self.converters, row))
                .collect();
        }
        let store = self.load_store(db, &lowered).await?;
        let registry = db.registry();
        Executor::new(&registry, &store).execute(&lowered)
    }

    async fn eval(&self, db: &Database, selection: &Selection, term: &Eval) -> Result<Value> {
        let lowered = Self::lower(db, selection)?;
        let store = self.load_store(db, &lowered).await?;
        let registry = db.registry();
        Executor::new(&registry, &store).evaluate(&lowered, term)
    }

    async fn set(&self, db: &Database, selection: &Selection, update: &Value) -> Result<u64> {
        let lowered = Self::lower(db, selection)?;
        let model = db.model(&lowered.model)?;

        // Full pushdown: plain assignments over a pushable filter.
        if lowered.args.sort.is_empty() && lowered.args.limit.is_none() && lowered.args.offset == 0
        {
            if let (Some((assignments, mut params)), Some((where_sql, mut where_params))) = (
                self.plan_update(&model, update)?,
                where_clause(&lowered.query),
            ) {
                let sql = format!(
                    "UPDATE {} SET {assignments} WHERE {where_sql}",
                    quote(&model.name)
                );
                params.append(&mut where_params);
                let result = self.execute(&sql, &params).await?;
                return Ok(result.rows_affected());
            }
        }

        // Evaluator path: fetch the targets, compute each row's new values,
        // write back by primary key.
        let mut read = lowered.clone();
        read.kind = SelectionKind::Get;
        let targets = self.get(db, &read).await?;
        let store = self.load_store(db, &lowered).await?;
        let updates = {
            let registry = db.registry();
            let exec = Executor::new(&registry, &store);
            let flat = model.format(update.as_object().unwrap_or(&Object::new()), false)?;
            let mut updates = Vec::new();
            for target in &targets {
                let mut assignments = Vec::new();
                let mut params = Vec::new();
                for (path, value) in &flat {
                    let resolved = match value {
                        Value::Expr(term) => {
                            let scope = Scope::new().push(&lowered.ref_name, target.clone());
                            exec.eval(term, &scope, None)?
                        }
                        value => value.clone(),
                    };
                    let resolved = model.resolve_value(path, resolved);
                    let field_type = model
                        .field(path)
                        .map(Type::from_field)
                        .unwrap_or_else(Type::expr);
                    let dumped = self.converters.dump_field(&field_type, resolved);
                    assignments.push(format!("{} = ?", quote(path)));
                    params.push(physical(&dumped).unwrap_or(Value::Null));
                }
                updates.push((assignments.join(", "), params));
            }
            updates
        };
        let written = updates.len() as u64;
        for (target, (assignments, params)) in targets.iter().zip(updates) {
            self.update_by_key(&model, target, &assignments, &params).await?;
        }
        Ok(written)
    }

    async fn create(&self, db: &Database, selection: &Selection, row: &Value) -> Result<Value> {
        let model = db.model(&selection.model)?;
        self.insert_record(db, &model, row).await
    }

    async fn upsert(
        &self,
        db: &Database,
        selection: &Selection,
        rows: &[Value],
        keys: &[String],
    ) -> Result<()> {
        let model = db.model(&selection.model)?;
        for row in rows {
            let mut key_query = Query::all();
            for key in keys {
                let value = row.get_path(key).cloned().unwrap_or(Value::Null);
                key_query = key_query.and(Query::eq(key, value));
            }
            let mut read = selection.clone();
            read.kind = SelectionKind::Get;
            read.query = key_query.clone();
            let existing = self.get(db, &read).await?;
            if existing.is_empty() {
                let record = model.create(row.as_object().unwrap_or(&Object::new()));
                self.insert_record(db, &model, &record).await?;
            } else {
                let mut write = selection.clone();
                write.query = key_query;
                self.set(db, &write, row).await?;
            }
        }
        Ok(())
    }

    async fn remove(&self, db: &Database, selection: &Selection) -> Result<u64> {
        let lowered = Self::lower(db, selection)?;
        if lowered.args.sort.is_empty() && lowered.args.limit.is_none() && lowered.args.offset == 0
        {
            if let Some((where_sql, params)) = where_clause(&lowered.query) {
                let sql = format!("DELETE FROM {} WHERE {where_sql}", quote(&lowered.model));
                let result = self.execute(&sql, &params).await?;
                return Ok(result.rows_affected());
            }
        }
        let model = db.model(&lowered.model)?;
        let mut read = lowered.clone();
        read.kind = SelectionKind::Get;
        let targets = self.get(db, &read).await?;
        for target in &targets {
            let mut clauses = Vec::new();
            let mut params = Vec::new();
            for key in &model.primary {
                clauses.push(format!("{} = ?", quote(key)));
                params.push(
                    physical(&target.get_path(key).cloned().unwrap_or(Value::Null))
                        .unwrap_or(Value::Null),
                );
            }
            let sql = format!(
                "DELETE FROM {} WHERE {}",
                quote(&model.name),
                clauses.join(" AND ")
            );
            self.execute(&sql, &params).await?;
        }
        Ok(targets.len() as u64)
    }

    async fn begin(&self, _db: &Database) -> Result<()> {
        let tx = self.pool()?.begin().await.map_err(translate)?;
        *self.transaction.lock().await = Some(tx);
        Ok(())
    }

    async fn commit(&self, _db: &Database) -> Result<()> {
        match self.transaction.lock().await.take() {
            Some(tx) => tx.commit().await.map_err(translate),
            None => Err(Error::TransactionAborted("no open transaction".into())),
        }
    }

    async fn rollback(&self, _db: &Database) -> Result<()> {
        match self.transaction.lock().await.take() {
            Some(tx) => tx.rollback().await.map_err(translate),
            None => Err(Error::TransactionAborted("no open transaction".into())),
        }
    }

    fn converters(&self) -> &Converters {
        &self.converters
    }
}

/// Tracks which physical columns exist so hooks run only while their legacy
/// columns are still present.
struct SqliteHost {
    existing: Vec<String>,
    drops: Vec<String>,
}

impl MigrationHost for SqliteHost {
    fn before(&mut self, legacy: &[String]) -> bool {
        !legacy.is_empty() && legacy.iter().any(|col| self.existing.contains(col))
    }

    fn after(&mut self, legacy: &[String]) {
        for col in legacy {
            if self.existing.contains(col) && !self.drops.contains(col) {
                self.drops.push(col.clone());
            }
        }
    }

    fn finalize(&mut self) -> Result<()> {
        Ok(())
    }

    fn error(&mut self, error: &Error) {
        tracing::warn!(%error, "sqlite migration hook failed");
    }
}

fn bind_value<'q>(
    query: sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>>,
    value: Value,
) -> sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>> {
    match value {
        Value::Null => query.bind(Option::<i64>::None),
        Value::Bool(b) => query.bind(i64::from(b)),
        Value::Int(n) => query.bind(n),
        Value::Uint(n) => query.bind(i64::try_from(n).unwrap_or(i64::MAX)),
        Value::Float(f) => query.bind(f),
        Value::String(s) => query.bind(s),
        Value::Bytes(b) => query.bind(b),
        other => query.bind(other.to_json().to_string()),
    }
}

/// Maps backend errors onto the layer's error kinds: unique violations
/// become duplicate entries, everything else stays a driver error.
fn translate(error: sqlx::Error) -> Error {
    let message = error.to_string();
    if message.contains("UNIQUE constraint failed") {
        return strata_core::driver::duplicate_entry(message);
    }
    Error::driver(error)
}

fn is_missing_table(error: &Error) -> bool {
    error.to_string().contains("no such table")
}

fn not_started() -> Error {
    Error::driver(std::io::Error::new(
        std::io::ErrorKind::NotConnected,
        "sqlite driver not started",
    ))
}
