//! The database facade.
//!
//! A [`Database`] is the scoped owner of a model registry and one backend
//! driver. It exposes the public query API, attaches relation includes to
//! read results, and decomposes cascaded mutations into the ordered
//! operation plan the resolver defines. There is no global state; tests
//! instantiate as many databases as they need.

use std::sync::RwLock;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use futures::future::BoxFuture;

use crate::driver::{Driver, Stats};
use crate::error::{Error, Result};
use crate::eval::Eval;
use crate::field::Field;
use crate::model::{Model, ModelConfig, Registry};
use crate::query::Query;
use crate::relation::{Relation, RelationKind, link_column};
use crate::resolver::{Cascade, CascadeOp, Include, ensure_link_model, fill_primary, natural_keys, split_payload};
use crate::selection::Selection;
use crate::value::{Object, Value};

/// A scoped owner of models and one backend driver.
pub struct Database {
    registry: RwLock<Registry>,
    driver: Box<dyn Driver>,
    refs: AtomicU64,
    in_transaction: AtomicBool,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("driver", &self.driver.name())
            .finish_non_exhaustive()
    }
}

impl Database {
    /// Creates a database over a driver. Call [`Database::start`] before
    /// issuing queries.
    #[must_use]
    pub fn new(driver: Box<dyn Driver>) -> Self {
        Self {
            registry: RwLock::new(Registry::new()),
            driver,
            refs: AtomicU64::new(0),
            in_transaction: AtomicBool::new(false),
        }
    }

    /// Starts the driver.
    ///
    /// # Errors
    ///
    /// Propagates driver connection failures.
    pub async fn start(&self) -> Result<()> {
        self.driver.start(self).await
    }

    /// Stops the driver, releasing its resources.
    ///
    /// # Errors
    ///
    /// Propagates driver failures.
    pub async fn stop(&self) -> Result<()> {
        self.driver.stop(self).await
    }

    /// Read access to the model registry.
    #[must_use]
    pub fn registry(&self) -> std::sync::RwLockReadGuard<'_, Registry> {
        self.registry.read().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Write access to the model registry.
    #[must_use]
    pub fn registry_mut(&self) -> std::sync::RwLockWriteGuard<'_, Registry> {
        self.registry.write().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// A clone of the named model.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RelationUnresolved`] when the table is unknown.
    pub fn model(&self, table: &str) -> Result<Model> {
        self.registry().expect(table).cloned()
    }

    /// Declares a table and synchronizes its physical schema.
    ///
    /// # Errors
    ///
    /// Propagates registration and driver preparation failures.
    pub async fn extend(
        &self,
        table: &str,
        fields: impl IntoIterator<Item = (String, Field)> + Send,
        config: ModelConfig,
    ) -> Result<()> {
        self.registry_mut().extend(table, fields, config)?;
        self.driver.prepare(self, table).await
    }

    /// Declares a relation on `table.field`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RelationUnresolved`] when the table is unknown.
    pub fn relate(&self, table: &str, field: &str, relation: Relation) -> Result<()> {
        self.registry_mut().relate(table, field, relation)
    }

    /// A fresh selection over a table, with a ref no other selection of
    /// this database shares.
    #[must_use]
    pub fn select(&self, table: &str) -> Selection {
        let id = self.refs.fetch_add(1, Ordering::Relaxed);
        Selection::new(table, &format!("{table}#{id}"))
    }

    /// Reads rows matching a query, optionally descending into relations.
    ///
    /// # Errors
    ///
    /// Propagates driver and resolution failures.
    pub async fn get(&self, table: &str, query: Query, include: &Include) -> Result<Vec<Value>> {
        let selection = self.select(table).filter(query);
        let mut rows = self.driver.get(self, &selection).await?;
        if !include.is_empty() {
            let model = self.model(table)?;
            self.attach(&model, &mut rows, include).await?;
        }
        Ok(rows)
    }

    /// Executes an arbitrary read selection.
    ///
    /// # Errors
    ///
    /// Propagates driver failures.
    pub async fn execute(&self, selection: &Selection) -> Result<Vec<Value>> {
        self.driver.get(self, selection).await
    }

    /// Evaluates an expression over a selection.
    ///
    /// # Errors
    ///
    /// Propagates driver failures.
    pub async fn eval(&self, selection: &Selection, term: &Eval) -> Result<Value> {
        self.driver.eval(self, selection, term).await
    }

    /// Inserts one record, seeding field defaults and running any relation
    /// cascades in the payload. Returns the created row with generated keys
    /// filled in.
    ///
    /// # Errors
    ///
    /// Propagates driver, validation and cascade failures.
    pub async fn create(&self, table: &str, data: Value) -> Result<Value> {
        self.create_boxed(table, data).await
    }

    fn create_boxed<'a>(&'a self, table: &'a str, data: Value) -> BoxFuture<'a, Result<Value>> {
        Box::pin(async move {
            let model = self.model(table)?;
            let (base, cascades) = split_payload(&model, &data, true)?;
            let record = self.normalize(&model, model.create(base.as_object().unwrap_or(&Object::new())));
            let selection = self.select(table);
            if cascades.is_empty() {
                return self.driver.create(self, &selection, &record).await;
            }
            self.with_transaction(move |db| {
                Box::pin(async move {
                    let created = db.driver.create(db, &selection, &record).await?;
                    db.apply_cascades(&model, &created, cascades).await?;
                    Ok(created)
                })
            })
            .await
        })
    }

    /// Updates rows matching a query. The payload may contain expression
    /// terms and relation cascade directives.
    ///
    /// # Errors
    ///
    /// Propagates driver and cascade failures.
    pub async fn set(&self, table: &str, query: Query, update: Value) -> Result<u64> {
        self.set_boxed(table, query, update).await
    }

    fn set_boxed<'a>(
        &'a self,
        table: &'a str,
        query: Query,
        update: Value,
    ) -> BoxFuture<'a, Result<u64>> {
        Box::pin(async move {
            let model = self.model(table)?;
            let (base, cascades) = split_payload(&model, &update, false)?;
            let base = self.normalize(&model, base);
            let has_base = base.as_object().is_some_and(|map| !map.is_empty());
            let selection = self.select(table).filter(query);
            if cascades.is_empty() {
                if !has_base {
                    return Ok(0);
                }
                return self.driver.set(self, &selection, &base).await;
            }
            self.with_transaction(move |db| {
                Box::pin(async move {
                    let parents = db.driver.get(db, &selection).await?;
                    let mut written = 0;
                    if has_base {
                        written = db.driver.set(db, &selection, &base).await?;
                    }
                    for parent in &parents {
                        db.apply_cascades(&model, parent, cascades.clone()).await?;
                    }
                    Ok(written.max(parents.len() as u64))
                })
            })
            .await
        })
    }

    /// Inserts or updates rows, matching existing rows on the key fields
    /// (the primary key when empty).
    ///
    /// # Errors
    ///
    /// Propagates driver failures.
    pub async fn upsert(&self, table: &str, rows: Vec<Value>, keys: &[&str]) -> Result<()> {
        let model = self.model(table)?;
        let keys: Vec<String> = if keys.is_empty() {
            model.primary.clone()
        } else {
            keys.iter().map(ToString::to_string).collect()
        };
        let rows: Vec<Value> = rows
            .into_iter()
            .map(|row| self.normalize(&model, row))
            .collect();
        let selection = self.select(table);
        self.driver.upsert(self, &selection, &rows, &keys).await
    }

    /// Deletes rows matching a query; returns the number of rows removed.
    ///
    /// # Errors
    ///
    /// Propagates driver failures.
    pub async fn remove(&self, table: &str, query: Query) -> Result<u64> {
        let selection = self.select(table).filter(query);
        self.driver.remove(self, &selection).await
    }

    /// Driver statistics.
    ///
    /// # Errors
    ///
    /// Propagates driver failures.
    pub async fn stats(&self) -> Result<Stats> {
        self.driver.stats(self).await
    }

    /// Drops one table.
    ///
    /// # Errors
    ///
    /// Propagates driver failures.
    pub async fn drop_table(&self, table: &str) -> Result<()> {
        self.driver.drop_table(self, table).await
    }

    /// Drops every table.
    ///
    /// # Errors
    ///
    /// Propagates driver failures.
    pub async fn drop_all(&self) -> Result<()> {
        self.driver.drop_all(self).await
    }

    /// Runs `action` inside a transaction: every operation it performs goes
    /// through a dedicated driver connection, committed on normal return and
    /// rolled back on error. Nested calls reuse the open transaction.
    ///
    /// # Errors
    ///
    /// Propagates the action's error after rolling back, and commit
    /// failures as [`Error::TransactionAborted`].
    pub async fn with_transaction<'s, T, F>(&'s self, action: F) -> Result<T>
    where
        T: Send,
        F: FnOnce(&'s Database) -> BoxFuture<'s, Result<T>> + Send,
    {
        if self.in_transaction.swap(true, Ordering::SeqCst) {
            return action(self).await;
        }
        let result = async {
            self.driver.begin(self).await?;
            match action(self).await {
                Ok(value) => match self.driver.commit(self).await {
                    Ok(()) => Ok(value),
                    Err(error) => Err(Error::TransactionAborted(error.to_string())),
                },
                Err(error) => {
                    if let Err(rollback) = self.driver.rollback(self).await {
                        tracing::warn!(%rollback, "rollback failed");
                    }
                    Err(error)
                }
            }
        }
        .await;
        self.in_transaction.store(false, Ordering::SeqCst);
        result
    }

    /// Applies per-field value normalization over the top level of a
    /// record.
    fn normalize(&self, model: &Model, record: Value) -> Value {
        let Value::Object(map) = record else {
            return record;
        };
        Value::Object(
            map.into_iter()
                .map(|(key, value)| {
                    let value = model.resolve_value(&key, value);
                    (key, value)
                })
                .collect(),
        )
    }

    // ------------------------------------------------------------------
    // Relation includes
    // ------------------------------------------------------------------

    fn attach<'a>(
        &'a self,
        model: &'a Model,
        rows: &'a mut [Value],
        include: &'a Include,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            for (field, nested) in &include.relations {
                let relation = model
                    .relation(field)
                    .cloned()
                    .ok_or_else(|| Error::unresolved(format!("{}.{field}", model.name)))?;
                match relation.kind {
                    RelationKind::OneToOne | RelationKind::ManyToOne | RelationKind::OneToMany => {
                        self.attach_keyed(rows, field, &relation, nested).await?;
                    }
                    RelationKind::ManyToMany => {
                        self.attach_linked(model, rows, field, &relation, nested).await?;
                    }
                }
            }
            Ok(())
        })
    }

    /// Secondary fetch keyed on the relation columns, stitched back onto
    /// the parent rows.
    async fn attach_keyed(
        &self,
        rows: &mut [Value],
        field: &str,
        relation: &Relation,
        nested: &Include,
    ) -> Result<()> {
        let child_model = self.model(&relation.target)?;
        let tuples = distinct_tuples(rows, &relation.local);
        let mut children = if tuples.is_empty() {
            Vec::new()
        } else {
            self.driver
                .get(
                    self,
                    &self
                        .select(&relation.target)
                        .filter(tuples_query(&relation.remote, &tuples)),
                )
                .await?
        };
        if !nested.is_empty() {
            self.attach(&child_model, &mut children, nested).await?;
        }
        for row in rows.iter_mut() {
            let own = values_at(row, &relation.local);
            let matches: Vec<Value> = children
                .iter()
                .filter(|child| {
                    !own.iter().any(Value::is_null) && values_at(child, &relation.remote) == own
                })
                .cloned()
                .collect();
            let attached = if relation.kind.is_to_many() {
                Value::List(matches)
            } else {
                matches.into_iter().next().unwrap_or(Value::Null)
            };
            row.set_path(field, attached);
        }
        Ok(())
    }

    /// Fetch through the association table, stitched back onto the parent
    /// rows.
    async fn attach_linked(
        &self,
        model: &Model,
        rows: &mut [Value],
        field: &str,
        relation: &Relation,
        nested: &Include,
    ) -> Result<()> {
        let link_table = self.ensure_link(model, relation).await?;
        let child_model = self.model(&relation.target)?;
        let left_cols: Vec<String> = model
            .primary
            .iter()
            .map(|key| link_column(&model.name, key))
            .collect();
        let right_cols: Vec<String> = child_model
            .primary
            .iter()
            .map(|key| link_column(&child_model.name, key))
            .collect();

        let parent_tuples = distinct_tuples(rows, &model.primary);
        let links = if parent_tuples.is_empty() {
            Vec::new()
        } else {
            self.driver
                .get(
                    self,
                    &self
                        .select(&link_table)
                        .filter(tuples_query(&left_cols, &parent_tuples)),
                )
                .await?
        };

        let child_tuples = distinct_tuples(&links, &right_cols);
        let mut children = if child_tuples.is_empty() {
            Vec::new()
        } else {
            self.driver
                .get(
                    self,
                    &self
                        .select(&relation.target)
                        .filter(tuples_query(&child_model.primary, &child_tuples)),
                )
                .await?
        };
        if !nested.is_empty() {
            self.attach(&child_model, &mut children, nested).await?;
        }

        for row in rows.iter_mut() {
            let own = values_at(row, &model.primary);
            let linked: Vec<Vec<Value>> = links
                .iter()
                .filter(|link| values_at(link, &left_cols) == own)
                .map(|link| values_at(link, &right_cols))
                .collect();
            let matches: Vec<Value> = children
                .iter()
                .filter(|child| linked.contains(&values_at(child, &child_model.primary)))
                .cloned()
                .collect();
            row.set_path(field, Value::List(matches));
        }
        Ok(())
    }

    /// Registers the implicit association model on first use and prepares
    /// its physical table.
    async fn ensure_link(&self, model: &Model, relation: &Relation) -> Result<String> {
        let known = self.registry().contains(&relation.link_table(&model.name));
        let link_table = ensure_link_model(&mut self.registry_mut(), &model.name, relation)?;
        if !known {
            self.driver.prepare(self, &link_table).await?;
        }
        Ok(link_table)
    }

    // ------------------------------------------------------------------
    // Write cascades
    // ------------------------------------------------------------------

    /// Applies one parent row's flat cascade plan. The plan arrives sorted
    /// in the mandatory order across every relation slot of the mutation:
    /// disconnects, removes, updates, creates and upserts, connects.
    fn apply_cascades<'a>(
        &'a self,
        model: &'a Model,
        parent: &'a Value,
        cascades: Vec<Cascade>,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            for cascade in &cascades {
                let child_model = self.model(&cascade.relation.target)?;
                match cascade.relation.kind {
                    RelationKind::OneToMany => {
                        self.cascade_children(model, parent, &cascade.relation, &child_model, &cascade.op)
                            .await?;
                    }
                    RelationKind::OneToOne | RelationKind::ManyToOne => {
                        self.cascade_reference(model, parent, &cascade.relation, &child_model, &cascade.op)
                            .await?;
                    }
                    RelationKind::ManyToMany => {
                        self.cascade_linked(model, parent, &cascade.relation, &child_model, &cascade.op)
                            .await?;
                    }
                }
            }
            Ok(())
        })
    }

    /// Cascade over a one-to-many relation: the foreign key lives on the
    /// child rows.
    async fn cascade_children(
        &self,
        _model: &Model,
        parent: &Value,
        relation: &Relation,
        child_model: &Model,
        op: &CascadeOp,
    ) -> Result<()> {
        let parent_vals = values_at(parent, &relation.local);
        let linked = eq_query(&relation.remote, &parent_vals);
        let child = &child_model.name;
        match op {
            CascadeOp::Disconnect(query) => {
                let query = linked.and(fill_primary(query, child_model));
                let clear = null_record(&relation.remote);
                self.set_boxed(child, query, clear).await?;
            }
            CascadeOp::Remove(query) => {
                let query = linked.and(fill_primary(query, child_model));
                self.remove(child, query).await?;
            }
            CascadeOp::Set { filter, update } => {
                let query = match filter {
                    Some(filter) => linked.and(fill_primary(filter, child_model)),
                    None => linked,
                };
                self.set_boxed(child, query, update.clone()).await?;
            }
            CascadeOp::Create(rows) => {
                for row in rows {
                    let mut row = row.clone();
                    overlay(&mut row, &relation.remote, &parent_vals);
                    self.create_boxed(child, row).await?;
                }
            }
            CascadeOp::Upsert(rows) => {
                let rows: Vec<Value> = rows
                    .iter()
                    .map(|row| {
                        let mut row = row.clone();
                        overlay(&mut row, &relation.remote, &parent_vals);
                        row
                    })
                    .collect();
                let keys = natural_keys(child_model);
                let keys: Vec<&str> = keys.iter().map(String::as_str).collect();
                self.upsert(child, rows, &keys).await?;
            }
            CascadeOp::Connect(query) => {
                let query = fill_primary(query, child_model);
                let rebind = record_of(&relation.remote, &parent_vals);
                self.set_boxed(child, query, rebind).await?;
            }
        }
        Ok(())
    }

    /// Cascade over an owning to-one relation: the foreign key lives on the
    /// parent row. One-to-one relations with a reciprocal pointer update
    /// both endpoints.
    #[allow(clippy::too_many_lines)]
    async fn cascade_reference(
        &self,
        model: &Model,
        parent: &Value,
        relation: &Relation,
        child_model: &Model,
        op: &CascadeOp,
    ) -> Result<()> {
        let parent_pk = pk_query(model, parent);
        let fk_vals = values_at(parent, &relation.local);
        let linked = eq_query(&relation.remote, &fk_vals);
        let child = &child_model.name;
        let reciprocal = (relation.kind == RelationKind::OneToOne)
            .then(|| child_model.relation(&relation.inverse).cloned())
            .flatten()
            .filter(|inverse| inverse.kind.owns_foreign_key());
        match op {
            CascadeOp::Disconnect(_) => {
                if let Some(inverse) = &reciprocal {
                    let pointer = eq_query(&inverse.local, &values_at(parent, &inverse.remote));
                    self.set_boxed(child, pointer, null_record(&inverse.local))
                        .await?;
                }
                self.set_boxed(&model.name, parent_pk, null_record(&relation.local))
                    .await?;
            }
            CascadeOp::Remove(query) => {
                let query = linked.and(fill_primary(query, child_model));
                if self.remove(child, query).await? > 0 {
                    self.set_boxed(&model.name, parent_pk, null_record(&relation.local))
                        .await?;
                }
            }
            CascadeOp::Set { filter, update } => {
                let query = match filter {
                    Some(filter) => linked.and(fill_primary(filter, child_model)),
                    None => linked,
                };
                self.set_boxed(child, query, update.clone()).await?;
            }
            CascadeOp::Create(rows) => {
                let Some(row) = rows.first() else {
                    return Ok(());
                };
                let created = self.create_boxed(child, row.clone()).await?;
                let vals = values_at(&created, &relation.remote);
                self.set_boxed(&model.name, parent_pk, record_of(&relation.local, &vals))
                    .await?;
                if let Some(inverse) = &reciprocal {
                    let target_pk = pk_query(child_model, &created);
                    let pointer = record_of(&inverse.local, &values_at(parent, &inverse.remote));
                    self.set_boxed(child, target_pk, pointer).await?;
                }
            }
            CascadeOp::Upsert(rows) => {
                let Some(row) = rows.first() else {
                    return Ok(());
                };
                let keys = natural_keys(child_model);
                let key_refs: Vec<&str> = keys.iter().map(String::as_str).collect();
                self.upsert(child, vec![row.clone()], &key_refs).await?;
                let key_vals: Vec<Value> = keys
                    .iter()
                    .map(|key| row.get_path(key).cloned().unwrap_or(Value::Null))
                    .collect();
                let matched = self
                    .get(child, eq_query(&keys, &key_vals), &Include::new())
                    .await?;
                let Some(target) = matched.first() else {
                    return Ok(());
                };
                let vals = values_at(target, &relation.remote);
                self.set_boxed(&model.name, parent_pk, record_of(&relation.local, &vals))
                    .await?;
                if let Some(inverse) = &reciprocal {
                    let target_pk = pk_query(child_model, target);
                    let pointer = record_of(&inverse.local, &values_at(parent, &inverse.remote));
                    self.set_boxed(child, target_pk, pointer).await?;
                }
            }
            CascadeOp::Connect(query) => {
                let query = fill_primary(query, child_model);
                let targets = self.get(child, query, &Include::new()).await?;
                let Some(target) = targets.first() else {
                    return Ok(());
                };
                let vals = values_at(target, &relation.remote);
                if relation.kind == RelationKind::OneToOne {
                    // Clear the previous holder of this target.
                    let holder = eq_query(&relation.local, &vals).and(parent_pk.clone().not());
                    self.set_boxed(&model.name, holder, null_record(&relation.local))
                        .await?;
                }
                if let Some(inverse) = &reciprocal {
                    let target_pk = pk_query(child_model, target);
                    let back_vals = values_at(parent, &inverse.remote);
                    // Clear rows previously pointing back at this parent.
                    let stale = eq_query(&inverse.local, &back_vals)
                        .and(target_pk.clone().not());
                    self.set_boxed(child, stale, null_record(&inverse.local))
                        .await?;
                    self.set_boxed(child, target_pk, record_of(&inverse.local, &back_vals))
                        .await?;
                }
                self.set_boxed(&model.name, parent_pk, record_of(&relation.local, &vals))
                    .await?;
            }
        }
        Ok(())
    }

    /// Cascade over a many-to-many relation: membership lives in the
    /// association table, and connect/disconnect are idempotent.
    async fn cascade_linked(
        &self,
        model: &Model,
        parent: &Value,
        relation: &Relation,
        child_model: &Model,
        op: &CascadeOp,
    ) -> Result<()> {
        let link_table = self.ensure_link(model, relation).await?;
        let left_cols: Vec<String> = model
            .primary
            .iter()
            .map(|key| link_column(&model.name, key))
            .collect();
        let right_cols: Vec<String> = child_model
            .primary
            .iter()
            .map(|key| link_column(&child_model.name, key))
            .collect();
        let parent_vals = values_at(parent, &model.primary);
        let child = &child_model.name;

        let link_row = |target: &Value| -> Value {
            let mut row = Value::Object(Object::new());
            overlay(&mut row, &left_cols, &parent_vals);
            overlay(&mut row, &right_cols, &values_at(target, &child_model.primary));
            row
        };
        let link_keys: Vec<String> = left_cols.iter().chain(&right_cols).cloned().collect();
        let link_keys: Vec<&str> = link_keys.iter().map(String::as_str).collect();

        match op {
            CascadeOp::Disconnect(query) => {
                let targets = self
                    .get(child, fill_primary(query, child_model), &Include::new())
                    .await?;
                for target in &targets {
                    let query = eq_query(&left_cols, &parent_vals).and(eq_query(
                        &right_cols,
                        &values_at(target, &child_model.primary),
                    ));
                    self.remove(&link_table, query).await?;
                }
            }
            CascadeOp::Remove(query) => {
                let linked = self.linked_tuples(&link_table, &left_cols, &parent_vals, &right_cols).await?;
                let query = fill_primary(query, child_model)
                    .and(tuples_query(&child_model.primary, &linked));
                let targets = self.get(child, query, &Include::new()).await?;
                for target in &targets {
                    let pk = values_at(target, &child_model.primary);
                    self.remove(
                        &link_table,
                        eq_query(&left_cols, &parent_vals).and(eq_query(&right_cols, &pk)),
                    )
                    .await?;
                    self.remove(child, pk_query(child_model, target)).await?;
                }
            }
            CascadeOp::Set { filter, update } => {
                let linked = self.linked_tuples(&link_table, &left_cols, &parent_vals, &right_cols).await?;
                let mut query = tuples_query(&child_model.primary, &linked);
                if let Some(filter) = filter {
                    query = query.and(fill_primary(filter, child_model));
                }
                self.set_boxed(child, query, update.clone()).await?;
            }
            CascadeOp::Create(rows) => {
                for row in rows {
                    let created = self.create_boxed(child, row.clone()).await?;
                    self.upsert(&link_table, vec![link_row(&created)], &link_keys)
                        .await?;
                }
            }
            CascadeOp::Upsert(rows) => {
                let keys = natural_keys(child_model);
                let keys: Vec<&str> = keys.iter().map(String::as_str).collect();
                self.upsert(child, rows.clone(), &keys).await?;
                for row in rows {
                    let key_vals: Vec<Value> = keys
                        .iter()
                        .map(|key| row.get_path(key).cloned().unwrap_or(Value::Null))
                        .collect();
                    let keys_owned: Vec<String> = keys.iter().map(ToString::to_string).collect();
                    let matched = self
                        .get(child, eq_query(&keys_owned, &key_vals), &Include::new())
                        .await?;
                    if let Some(target) = matched.first() {
                        self.upsert(&link_table, vec![link_row(target)], &link_keys)
                            .await?;
                    }
                }
            }
            CascadeOp::Connect(query) => {
                let targets = self
                    .get(child, fill_primary(query, child_model), &Include::new())
                    .await?;
                for target in &targets {
                    self.upsert(&link_table, vec![link_row(target)], &link_keys)
                        .await?;
                }
            }
        }
        Ok(())
    }

    /// The child primary-key tuples currently linked to a parent.
    async fn linked_tuples(
        &self,
        link_table: &str,
        left_cols: &[String],
        parent_vals: &[Value],
        right_cols: &[String],
    ) -> Result<Vec<Vec<Value>>> {
        let links = self
            .get(link_table, eq_query(left_cols, parent_vals), &Include::new())
            .await?;
        Ok(links
            .iter()
            .map(|link| values_at(link, right_cols))
            .collect())
    }
}

/// The values of a row at the given columns, in order.
fn values_at(row: &Value, cols: &[String]) -> Vec<Value> {
    cols.iter()
        .map(|col| row.get_path(col).cloned().unwrap_or(Value::Null))
        .collect()
}

/// Distinct column tuples across rows, skipping tuples with null members.
fn distinct_tuples(rows: &[Value], cols: &[String]) -> Vec<Vec<Value>> {
    let mut tuples: Vec<Vec<Value>> = Vec::new();
    for row in rows {
        let tuple = values_at(row, cols);
        if tuple.iter().any(Value::is_null) {
            continue;
        }
        if !tuples.contains(&tuple) {
            tuples.push(tuple);
        }
    }
    tuples
}

/// Equality query over a column/value pairing.
fn eq_query(cols: &[String], vals: &[Value]) -> Query {
    let mut query = Query::all();
    for (col, val) in cols.iter().zip(vals) {
        query = query.and(Query::eq(col, val.clone()));
    }
    query
}

/// Membership query over column tuples: `$in` for a single column, a
/// disjunction of conjunctions otherwise. Matches nothing on no tuples.
fn tuples_query(cols: &[String], tuples: &[Vec<Value>]) -> Query {
    if tuples.is_empty() {
        return Query::none();
    }
    if cols.len() == 1 {
        let values: Vec<Value> = tuples.iter().filter_map(|t| t.first().cloned()).collect();
        return Query::within(&cols[0], values);
    }
    Query::Or(tuples.iter().map(|tuple| eq_query(cols, tuple)).collect())
}

/// Primary-key query for one row.
fn pk_query(model: &Model, row: &Value) -> Query {
    eq_query(&model.primary, &model.primary_key_of(row))
}

/// A record setting the given columns to null.
fn null_record(cols: &[String]) -> Value {
    let mut record = Value::Object(Object::new());
    for col in cols {
        record.set_path(col, Value::Null);
    }
    record
}

/// A record setting the given columns to the given values.
fn record_of(cols: &[String], vals: &[Value]) -> Value {
    let mut record = Value::Object(Object::new());
    overlay(&mut record, cols, vals);
    record
}

fn overlay(record: &mut Value, cols: &[String], vals: &[Value]) {
    for (col, val) in cols.iter().zip(vals) {
        record.set_path(col, val.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object;

    #[test]
    fn test_tuples_query_single_column() {
        let query = tuples_query(
            &["id".to_string()],
            &[vec![Value::Int(1)], vec![Value::Int(2)]],
        );
        assert_eq!(query, Query::within("id", vec![Value::Int(1), Value::Int(2)]));
    }

    #[test]
    fn test_tuples_query_empty_matches_nothing() {
        assert_eq!(tuples_query(&["id".to_string()], &[]), Query::none());
    }

    #[test]
    fn test_distinct_tuples_skips_null_members() {
        let rows = [
            object! { "a" => 1_i64, "b" => 2_i64 },
            object! { "a" => 1_i64, "b" => 2_i64 },
            object! { "a" => Value::Null, "b" => 3_i64 },
        ];
        let tuples = distinct_tuples(&rows, &["a".to_string(), "b".to_string()]);
        assert_eq!(tuples, vec![vec![Value::Int(1), Value::Int(2)]]);
    }

    #[test]
    fn test_null_record_uses_dotted_paths() {
        let record = null_record(&["author_id".to_string()]);
        assert_eq!(record.get_path("author_id"), Some(&Value::Null));
    }
}
