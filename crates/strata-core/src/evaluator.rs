//! The portable evaluator.
//!
//! An in-memory interpreter over the query and expression IRs. It is the
//! normative statement of operator semantics: drivers that cannot push a
//! predicate or expression down complete the work by delegating back to this
//! module over retrieved rows, and the test suites run against it directly.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use crate::error::{Error, Result};
use crate::eval::{Eval, is_logical};
use crate::model::{Model, Registry};
use crate::query::{FieldCond, FieldOp, Pattern, Query};
use crate::relation::{Relation, RelationKind, link_column};
use crate::selection::{Direction, SelTable, Selection, SelectionKind};
use crate::types::{Type, TypeKind};
use crate::value::{Object, Value};

/// Read access to raw table rows, provided by the hosting driver.
pub trait RowStore {
    /// All rows of the named table; each row is a `Value::Object`.
    fn rows(&self, table: &str) -> Vec<Value>;
}

impl RowStore for BTreeMap<String, Vec<Value>> {
    fn rows(&self, table: &str) -> Vec<Value> {
        self.get(table).cloned().unwrap_or_default()
    }
}

/// A chain of row scopes, innermost last.
#[derive(Debug, Clone, Default)]
pub struct Scope {
    frames: Vec<(String, Value)>,
}

impl Scope {
    /// An empty scope chain.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Extends the chain with a named row frame.
    #[must_use]
    pub fn push(&self, name: &str, row: Value) -> Self {
        let mut frames = self.frames.clone();
        frames.push((name.to_string(), row));
        Self { frames }
    }

    /// The innermost row.
    #[must_use]
    pub fn current(&self) -> Option<&Value> {
        self.frames.last().map(|(_, row)| row)
    }

    /// Resolves a reference: the innermost frame when no scope is named,
    /// otherwise the nearest frame with that name — looking through join
    /// rows keyed by participant names on the way out.
    fn resolve(&self, scope: Option<&str>, path: &str) -> Result<Value> {
        match scope {
            None => Ok(self
                .current()
                .and_then(|row| row.get_path(path))
                .cloned()
                .unwrap_or(Value::Null)),
            Some(name) => {
                for (frame_name, row) in self.frames.iter().rev() {
                    if frame_name == name {
                        return Ok(row.get_path(path).cloned().unwrap_or(Value::Null));
                    }
                    if let Some(map) = row.as_object() {
                        if let Some(part) = map.get(name) {
                            return Ok(part.get_path(path).cloned().unwrap_or(Value::Null));
                        }
                    }
                }
                Err(Error::unlowerable(format!("unresolved reference {name}.{path}")))
            }
        }
    }
}

/// Row context for aggregate terms: the rows an aggregate binds to.
pub struct Binding<'a> {
    /// The scope name the bound rows are framed under.
    pub ref_name: &'a str,
    /// The bound rows.
    pub rows: &'a [Value],
}

/// The in-memory query engine over a [`RowStore`].
pub struct Executor<'a> {
    /// The model registry of the owning database.
    pub registry: &'a Registry,
    /// Raw row access.
    pub store: &'a dyn RowStore,
}

impl<'a> Executor<'a> {
    /// Creates an executor over a registry and row store.
    #[must_use]
    pub fn new(registry: &'a Registry, store: &'a dyn RowStore) -> Self {
        Self { registry, store }
    }

    /// Executes a read selection, returning its projected rows.
    ///
    /// # Errors
    ///
    /// Fails when a reference cannot be resolved or an operator is applied
    /// to an operand it has no semantics for.
    pub fn execute(&self, selection: &Selection) -> Result<Vec<Value>> {
        self.execute_scoped(selection, &Scope::new())
    }

    /// Evaluates an expression over all rows of a selection.
    ///
    /// # Errors
    ///
    /// Fails when a reference cannot be resolved or an operator is applied
    /// to an operand it has no semantics for.
    pub fn evaluate(&self, selection: &Selection, term: &Eval) -> Result<Value> {
        self.evaluate_scoped(selection, term, &Scope::new())
    }

    fn evaluate_scoped(&self, selection: &Selection, term: &Eval, outer: &Scope) -> Result<Value> {
        let rows = self.matching_rows(selection, outer)?;
        let term = self.annotate(term, selection);
        let binding = Binding {
            ref_name: &selection.ref_name,
            rows: &rows,
        };
        self.eval(&term, outer, Some(&binding))
    }

    /// Tests a query against one row of a model's table.
    ///
    /// # Errors
    ///
    /// Fails on unresolved references or relations.
    pub fn test_row(&self, model: &Model, row: &Value, query: &Query) -> Result<bool> {
        let scope = Scope::new().push(&model.name, row.clone());
        self.test(model, query, &scope)
    }

    /// Rows of the selection that pass its filter, before grouping,
    /// ordering, pagination and projection.
    fn matching_rows(&self, selection: &Selection, outer: &Scope) -> Result<Vec<Value>> {
        let model = self.registry.get(&selection.model).cloned().unwrap_or_default();
        let rows = self.source_rows(selection, outer)?;
        // A join's condition is applied while combining participants, where
        // undecided partial combinations and null padding are handled.
        if matches!(selection.table, SelTable::Join(_)) {
            return Ok(rows);
        }
        let mut matching = Vec::new();
        for row in rows {
            let scope = outer.push(&selection.ref_name, row.clone());
            if self.test(&model, &selection.query, &scope)? {
                matching.push(row);
            }
        }
        Ok(matching)
    }

    fn execute_scoped(&self, selection: &Selection, outer: &Scope) -> Result<Vec<Value>> {
        let mut rows = self.matching_rows(selection, outer)?;

        if let Some(keys) = &selection.args.group {
            rows = self.group_rows(selection, keys, rows, outer)?;
        }

        // Sort keys are computed per row before the sort and never appear in
        // the output rows.
        if !selection.args.sort.is_empty() {
            let mut keyed = Vec::with_capacity(rows.len());
            for row in rows {
                let scope = outer.push(&selection.ref_name, row.clone());
                let mut keys = Vec::new();
                for (term, direction) in &selection.args.sort {
                    let term = self.annotate(term, selection);
                    keys.push((self.eval(&term, &scope, None)?, *direction));
                }
                keyed.push((keys, row));
            }
            keyed.sort_by(|(a, _), (b, _)| {
                for ((lhs, direction), (rhs, _)) in a.iter().zip(b) {
                    let ordering = match direction {
                        Direction::Asc => sort_cmp(lhs, rhs),
                        Direction::Desc => sort_cmp(rhs, lhs),
                    };
                    if ordering != Ordering::Equal {
                        return ordering;
                    }
                }
                Ordering::Equal
            });
            rows = keyed.into_iter().map(|(_, row)| row).collect();
        }

        if selection.args.offset > 0 {
            rows = rows.split_off(selection.args.offset.min(rows.len()));
        }
        if let Some(limit) = selection.args.limit {
            rows.truncate(limit);
        }

        if selection.args.group.is_none() {
            if let Some(fields) = &selection.args.fields {
                let mut projected = Vec::with_capacity(rows.len());
                for row in rows {
                    let scope = outer.push(&selection.ref_name, row);
                    let mut out = Object::new();
                    for (name, term) in fields {
                        let term = self.annotate(term, selection);
                        out.insert(name.clone(), self.eval(&term, &scope, None)?);
                    }
                    projected.push(Value::Object(out));
                }
                rows = projected;
            }
        }
        Ok(rows)
    }

    /// Source rows before filtering: a stored table, a subselection, or the
    /// combination of join participants.
    fn source_rows(&self, selection: &Selection, outer: &Scope) -> Result<Vec<Value>> {
        match &selection.table {
            SelTable::Name(name) => Ok(self.store.rows(name)),
            SelTable::Sub(inner) => self.execute_scoped(inner, outer),
            SelTable::Join(parts) => self.join_rows(selection, parts, outer),
        }
    }

    /// Left-fold nested-loop join. The `on` condition is evaluated on each
    /// partial combination; references into participants not yet joined
    /// count as undecided and keep the combination alive. A participant
    /// marked optional pads with null when nothing matches.
    fn join_rows(
        &self,
        selection: &Selection,
        parts: &[(String, Selection)],
        outer: &Scope,
    ) -> Result<Vec<Value>> {
        let mut acc = vec![Value::Object(Object::new())];
        for (name, part) in parts {
            let part_rows = self.execute_scoped(part, outer)?;
            let optional = selection.args.optional.iter().any(|n| n == name);
            let mut next = Vec::new();
            for base in &acc {
                let mut matched = false;
                for row in &part_rows {
                    let mut combined = base.clone();
                    if let Some(map) = combined.as_object_mut() {
                        map.insert(name.clone(), row.clone());
                    }
                    let scope = outer.push(&selection.ref_name, combined.clone());
                    match self.test_join(&selection.query, &scope) {
                        Some(false) => {}
                        _ => {
                            matched = true;
                            next.push(combined);
                        }
                    }
                }
                if !matched && optional {
                    let mut padded = base.clone();
                    if let Some(map) = padded.as_object_mut() {
                        map.insert(name.clone(), Value::Null);
                    }
                    next.push(padded);
                }
            }
            acc = next;
        }
        Ok(acc)
    }

    /// Join condition check on a possibly partial combination: `None` when
    /// the condition references a participant that is not joined yet.
    fn test_join(&self, on: &Query, scope: &Scope) -> Option<bool> {
        match self.test(&Model::default(), on, scope) {
            Ok(pass) => Some(pass),
            Err(Error::ExpressionUnlowerable(_)) => None,
            Err(_) => Some(false),
        }
    }

    fn group_rows(
        &self,
        selection: &Selection,
        keys: &[String],
        rows: Vec<Value>,
        outer: &Scope,
    ) -> Result<Vec<Value>> {
        let fields = selection.args.fields.clone().unwrap_or_default();
        let mut groups: Vec<(Vec<Value>, Vec<Value>)> = Vec::new();
        for row in rows {
            let tuple: Vec<Value> = keys
                .iter()
                .map(|key| row.get_path(key).cloned().unwrap_or(Value::Null))
                .collect();
            match groups.iter_mut().find(|(existing, _)| *existing == tuple) {
                Some((_, members)) => members.push(row),
                None => groups.push((tuple, vec![row])),
            }
        }

        let model = self.registry.get(&selection.model).cloned().unwrap_or_default();
        let mut output = Vec::new();
        for (_, members) in groups {
            let scope = outer.push(&selection.ref_name, members[0].clone());
            let binding = Binding {
                ref_name: &selection.ref_name,
                rows: &members,
            };
            let mut out = Object::new();
            for (name, term) in &fields {
                let term = self.annotate(term, selection);
                out.insert(name.clone(), self.eval(&term, &scope, Some(&binding))?);
            }
            let out = Value::Object(out);
            // `having` filters the aggregated row, which carries only the
            // grouped keys and aggregates.
            let scope = outer.push(&selection.ref_name, out.clone());
            if self.test(&model, &selection.args.having, &scope)? {
                output.push(out);
            }
        }
        Ok(output)
    }

    /// Tests a query against the innermost row of the scope.
    ///
    /// # Errors
    ///
    /// Fails on unresolved references or relations.
    pub fn test(&self, model: &Model, query: &Query, scope: &Scope) -> Result<bool> {
        match query {
            Query::And(branches) => {
                for branch in branches {
                    if !self.test(model, branch, scope)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            Query::Or(branches) => {
                for branch in branches {
                    if self.test(model, branch, scope)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            Query::Not(branch) => Ok(!self.test(model, branch, scope)?),
            Query::Expr(term) => {
                let term = annotate_term(term, &self.type_env_of(model), self.registry);
                Ok(self.eval(&term, scope, None)?.is_truthy())
            }
            Query::Field { path, cond } => self.test_field(model, path, cond, scope),
        }
    }

    fn test_field(
        &self,
        model: &Model,
        path: &str,
        cond: &FieldCond,
        scope: &Scope,
    ) -> Result<bool> {
        // An empty path stands for the primary key of the tested model.
        let path = if path.is_empty() {
            model.primary.first().cloned().unwrap_or_default()
        } else {
            path.to_string()
        };

        if let Some(relation) = model.relation(&path) {
            return self.test_relation(model, relation, cond, scope);
        }

        let row = scope.current().cloned().unwrap_or(Value::Null);
        let present = row.get_path(&path).is_some();
        let value = row.get_path(&path).cloned().unwrap_or(Value::Null);
        for op in &cond.ops {
            if !self.test_op(&value, present, op, scope)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    #[allow(clippy::too_many_lines)]
    fn test_op(&self, value: &Value, present: bool, op: &FieldOp, scope: &Scope) -> Result<bool> {
        Ok(match op {
            FieldOp::Eq(operand) => value.loose_eq(&self.operand(operand, scope)?),
            FieldOp::Ne(operand) => !value.loose_eq(&self.operand(operand, scope)?),
            FieldOp::Gt(operand) => {
                value.compare(&self.operand(operand, scope)?) == Some(Ordering::Greater)
            }
            FieldOp::Gte(operand) => matches!(
                value.compare(&self.operand(operand, scope)?),
                Some(Ordering::Greater | Ordering::Equal)
            ),
            FieldOp::Lt(operand) => {
                value.compare(&self.operand(operand, scope)?) == Some(Ordering::Less)
            }
            FieldOp::Lte(operand) => matches!(
                value.compare(&self.operand(operand, scope)?),
                Some(Ordering::Less | Ordering::Equal)
            ),
            FieldOp::In(list) => list.iter().any(|item| value.loose_eq(item)),
            FieldOp::Nin(list) => !list.iter().any(|item| value.loose_eq(item)),
            FieldOp::Regex(pattern) => match value.as_str() {
                Some(text) => pattern.is_match(text)?,
                None => false,
            },
            FieldOp::RegexFor(text) => match value.as_str() {
                Some(source) => Pattern::new(source).is_match(text)?,
                None => false,
            },
            FieldOp::Exists(expected) => (present && !value.is_null()) == *expected,
            FieldOp::BitsAllSet(mask) => value.as_int().is_some_and(|v| v & mask == *mask),
            FieldOp::BitsAllClear(mask) => value.as_int().is_some_and(|v| v & mask == 0),
            FieldOp::BitsAnySet(mask) => value.as_int().is_some_and(|v| v & mask != 0),
            FieldOp::BitsAnyClear(mask) => value.as_int().is_some_and(|v| v & mask != *mask),
            FieldOp::El(cond) => match value.as_list() {
                Some(items) => {
                    let mut matched = false;
                    for item in items {
                        let mut pass = true;
                        for op in &cond.ops {
                            if !self.test_op(item, true, op, scope)? {
                                pass = false;
                                break;
                            }
                        }
                        if pass {
                            matched = true;
                            break;
                        }
                    }
                    matched
                }
                None => false,
            },
            FieldOp::Size(expected) => value.as_list().is_some_and(|items| items.len() == *expected),
            FieldOp::Some(_) | FieldOp::None(_) | FieldOp::Every(_) => {
                return Err(Error::unresolved(
                    "relation predicate applied to a plain field",
                ));
            }
        })
    }

    /// Comparison operands may be expression terms; everything else is a
    /// plain value.
    fn operand(&self, operand: &Value, scope: &Scope) -> Result<Value> {
        match operand {
            Value::Expr(term) => self.eval(term, scope, None),
            operand => Ok(operand.clone()),
        }
    }

    fn test_relation(
        &self,
        model: &Model,
        relation: &Relation,
        cond: &FieldCond,
        scope: &Scope,
    ) -> Result<bool> {
        let row = scope.current().cloned().unwrap_or(Value::Null);
        let related = self.related_rows(model, relation, &row)?;
        let child = self.registry.expect(&relation.target)?;
        for op in &cond.ops {
            let pass = match op {
                // Existence: `{relation: null}` matches rows with no
                // associated row.
                FieldOp::Eq(Value::Null) => related.is_empty(),
                FieldOp::Ne(Value::Null) => !related.is_empty(),
                FieldOp::Some(query) => {
                    let mut found = false;
                    for related_row in &related {
                        let scope = scope.push(&child.name, related_row.clone());
                        if self.test(child, query, &scope)? {
                            found = true;
                            break;
                        }
                    }
                    found
                }
                FieldOp::None(query) => {
                    let mut found = false;
                    for related_row in &related {
                        let scope = scope.push(&child.name, related_row.clone());
                        if self.test(child, query, &scope)? {
                            found = true;
                            break;
                        }
                    }
                    !found
                }
                FieldOp::Every(query) => {
                    let mut all = true;
                    for related_row in &related {
                        let scope = scope.push(&child.name, related_row.clone());
                        if !self.test(child, query, &scope)? {
                            all = false;
                            break;
                        }
                    }
                    all
                }
                // Scalar and array shorthands target the child primary key.
                FieldOp::Eq(value) => {
                    let query = Query::eq("", value.clone());
                    return self.test_relation(
                        model,
                        relation,
                        &FieldOp::Some(Box::new(query)).into(),
                        scope,
                    );
                }
                FieldOp::In(values) => {
                    let query = Query::within("", values.clone());
                    return self.test_relation(
                        model,
                        relation,
                        &FieldOp::Some(Box::new(query)).into(),
                        scope,
                    );
                }
                _ => {
                    return Err(Error::unresolved(format!(
                        "unsupported operator on relation {}.{}",
                        model.name, relation.target
                    )));
                }
            };
            if !pass {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// The rows associated with `row` through a relation.
    pub(crate) fn related_rows(
        &self,
        model: &Model,
        relation: &Relation,
        row: &Value,
    ) -> Result<Vec<Value>> {
        let target_rows = self.store.rows(&relation.target);
        match relation.kind {
            RelationKind::OneToOne | RelationKind::ManyToOne | RelationKind::OneToMany => {
                let mut related = Vec::new();
                for candidate in target_rows {
                    let linked = relation.local.iter().zip(&relation.remote).all(
                        |(local, remote)| {
                            let own = row.get_path(local).cloned().unwrap_or(Value::Null);
                            let theirs =
                                candidate.get_path(remote).cloned().unwrap_or(Value::Null);
                            !own.is_null() && own.loose_eq(&theirs)
                        },
                    );
                    if linked {
                        related.push(candidate);
                    }
                }
                Ok(related)
            }
            RelationKind::ManyToMany => {
                let link_table = relation.link_table(&model.name);
                let links = self.store.rows(&link_table);
                let target = self.registry.expect(&relation.target)?;
                let mut related = Vec::new();
                for link in links {
                    let ours = model.primary.iter().all(|key| {
                        let own = row.get_path(key).cloned().unwrap_or(Value::Null);
                        let linked = link
                            .get_path(&link_column(&model.name, key))
                            .cloned()
                            .unwrap_or(Value::Null);
                        !own.is_null() && own.loose_eq(&linked)
                    });
                    if !ours {
                        continue;
                    }
                    for candidate in &target_rows {
                        let theirs = target.primary.iter().all(|key| {
                            let value =
                                candidate.get_path(key).cloned().unwrap_or(Value::Null);
                            let linked = link
                                .get_path(&link_column(&target.name, key))
                                .cloned()
                                .unwrap_or(Value::Null);
                            !value.is_null() && value.loose_eq(&linked)
                        });
                        if theirs {
                            related.push(candidate.clone());
                        }
                    }
                }
                Ok(related)
            }
        }
    }

    /// Evaluates an expression term in a scope. `binding` carries the rows
    /// aggregates bind to; without it, aggregates fold list-valued
    /// arguments.
    #[allow(clippy::too_many_lines)]
    pub fn eval(&self, term: &Eval, scope: &Scope, binding: Option<&Binding<'_>>) -> Result<Value> {
        match term {
            Eval::Literal { value, .. } => Ok(value.clone()),
            Eval::Ref {
                scope: ref_scope,
                path,
                ..
            } => scope.resolve(ref_scope.as_deref(), path),
            Eval::Add(args) => self.fold_numeric(args, scope, binding, |a, b| a + b),
            Eval::Sub(args) => self.fold_numeric(args, scope, binding, |a, b| a - b),
            Eval::Mul(args) => self.fold_numeric(args, scope, binding, |a, b| a * b),
            Eval::Div(args) => {
                let values = self.eval_all(args, scope, binding)?;
                let mut result = values.first().map_or(0.0, Value::to_number);
                for value in values.iter().skip(1) {
                    let divisor = value.to_number();
                    if divisor == 0.0 {
                        return Ok(Value::Null);
                    }
                    result /= divisor;
                }
                Ok(float_value(result))
            }
            Eval::Modulo(args) => {
                let values = self.eval_all(args, scope, binding)?;
                let mut result = values.first().map_or(0.0, Value::to_number);
                for value in values.iter().skip(1) {
                    let divisor = value.to_number();
                    if divisor == 0.0 {
                        return Ok(Value::Null);
                    }
                    result %= divisor;
                }
                Ok(float_value(result))
            }
            Eval::Power(base, exponent) => {
                let base = self.eval(base, scope, binding)?.to_number();
                let exponent = self.eval(exponent, scope, binding)?.to_number();
                Ok(float_value(base.powf(exponent)))
            }
            Eval::Log(value, base) => {
                let value = self.eval(value, scope, binding)?.to_number();
                let result = match base {
                    Some(base) => value.log(self.eval(base, scope, binding)?.to_number()),
                    None => value.ln(),
                };
                Ok(float_value(result))
            }
            Eval::Eq(lhs, rhs) => self.compare_terms(lhs, rhs, scope, binding, |ordering| {
                ordering == Some(Ordering::Equal)
            }),
            Eval::Ne(lhs, rhs) => self.compare_terms(lhs, rhs, scope, binding, |ordering| {
                ordering.is_some() && ordering != Some(Ordering::Equal)
            }),
            Eval::Gt(lhs, rhs) => self.compare_terms(lhs, rhs, scope, binding, |ordering| {
                ordering == Some(Ordering::Greater)
            }),
            Eval::Gte(lhs, rhs) => self.compare_terms(lhs, rhs, scope, binding, |ordering| {
                matches!(ordering, Some(Ordering::Greater | Ordering::Equal))
            }),
            Eval::Lt(lhs, rhs) => self.compare_terms(lhs, rhs, scope, binding, |ordering| {
                ordering == Some(Ordering::Less)
            }),
            Eval::Lte(lhs, rhs) => self.compare_terms(lhs, rhs, scope, binding, |ordering| {
                matches!(ordering, Some(Ordering::Less | Ordering::Equal))
            }),
            Eval::And(args) => {
                if is_logical(args) {
                    for arg in args {
                        if !self.eval(arg, scope, binding)?.is_truthy() {
                            return Ok(Value::Bool(false));
                        }
                    }
                    Ok(Value::Bool(true))
                } else {
                    self.fold_bits(args, scope, binding, !0, |a, b| a & b)
                }
            }
            Eval::Or(args) => {
                if is_logical(args) {
                    for arg in args {
                        if self.eval(arg, scope, binding)?.is_truthy() {
                            return Ok(Value::Bool(true));
                        }
                    }
                    Ok(Value::Bool(false))
                } else {
                    self.fold_bits(args, scope, binding, 0, |a, b| a | b)
                }
            }
            Eval::Xor(args) => {
                if is_logical(args) {
                    let mut result = false;
                    for arg in args {
                        result ^= self.eval(arg, scope, binding)?.is_truthy();
                    }
                    Ok(Value::Bool(result))
                } else {
                    self.fold_bits(args, scope, binding, 0, |a, b| a ^ b)
                }
            }
            Eval::Not(arg) => {
                if arg.return_type().kind == TypeKind::Boolean {
                    Ok(Value::Bool(!self.eval(arg, scope, binding)?.is_truthy()))
                } else {
                    let value = self.eval(arg, scope, binding)?.as_int().unwrap_or(0);
                    Ok(Value::Int(!value))
                }
            }
            Eval::Sum(arg) => {
                let values = self.aggregate_values(arg, scope, binding)?;
                Ok(numeric_sum(&values))
            }
            Eval::Avg(arg) => {
                let values = self.aggregate_values(arg, scope, binding)?;
                if values.is_empty() {
                    return Ok(Value::Int(0));
                }
                let total: f64 = values.iter().map(Value::to_number).sum();
                Ok(float_value(total / values.len() as f64))
            }
            Eval::Min(arg) => {
                let values = self.aggregate_values(arg, scope, binding)?;
                Ok(fold_extreme(values, Ordering::Less))
            }
            Eval::Max(arg) => {
                let values = self.aggregate_values(arg, scope, binding)?;
                Ok(fold_extreme(values, Ordering::Greater))
            }
            Eval::Count(arg) => {
                let values = self.aggregate_values(arg, scope, binding)?;
                let mut distinct: Vec<&Value> = Vec::new();
                for value in values.iter().filter(|value| !value.is_null()) {
                    if !distinct.iter().any(|seen| seen.loose_eq(value)) {
                        distinct.push(value);
                    }
                }
                Ok(Value::Int(distinct.len() as i64))
            }
            Eval::Length(arg) => {
                let values = self.aggregate_values(arg, scope, binding)?;
                Ok(Value::Int(values.len() as i64))
            }
            Eval::ArrayAgg(arg) => {
                let values = self.aggregate_values(arg, scope, binding)?;
                Ok(Value::List(values))
            }
            Eval::Get(arg, path) => {
                let value = self.eval(arg, scope, binding)?;
                if let Ok(index) = path.parse::<usize>() {
                    if let Some(items) = value.as_list() {
                        return Ok(items.get(index).cloned().unwrap_or(Value::Null));
                    }
                }
                Ok(value.get_path(path).cloned().unwrap_or(Value::Null))
            }
            Eval::Size(arg) => {
                let value = self.eval(arg, scope, binding)?;
                match &value {
                    Value::List(items) => Ok(Value::Int(items.len() as i64)),
                    Value::String(text) => Ok(Value::Int(text.chars().count() as i64)),
                    _ => Ok(Value::Int(0)),
                }
            }
            Eval::Concat(args) => {
                let mut out = String::new();
                for arg in args {
                    let value = self.eval(arg, scope, binding)?;
                    match value {
                        Value::String(text) => out.push_str(&text),
                        Value::Null => {}
                        other => out.push_str(&other.to_json().to_string().trim_matches('"')),
                    }
                }
                Ok(Value::String(out))
            }
            Eval::Object(members) => {
                let mut out = Object::new();
                for (name, member) in members {
                    out.insert(name.clone(), self.eval(member, scope, binding)?);
                }
                Ok(Value::Object(out))
            }
            Eval::If {
                cond,
                then,
                otherwise,
            } => {
                if self.eval(cond, scope, binding)?.is_truthy() {
                    self.eval(then, scope, binding)
                } else {
                    self.eval(otherwise, scope, binding)
                }
            }
            Eval::Switch { branches, default } => {
                for (cond, result) in branches {
                    if self.eval(cond, scope, binding)?.is_truthy() {
                        return self.eval(result, scope, binding);
                    }
                }
                self.eval(default, scope, binding)
            }
            Eval::Number(arg) => Ok(float_value(self.eval(arg, scope, binding)?.to_number())),
            Eval::Exec(selection) => {
                if let SelectionKind::Eval(term) = &selection.kind {
                    self.evaluate_scoped(selection, term, scope)
                } else {
                    Ok(Value::List(self.execute_scoped(selection, scope)?))
                }
            }
        }
    }

    /// The values an aggregate operates on: one per bound row when a binding
    /// is present, the elements of a list-valued argument otherwise.
    fn aggregate_values(
        &self,
        arg: &Eval,
        scope: &Scope,
        binding: Option<&Binding<'_>>,
    ) -> Result<Vec<Value>> {
        match binding {
            Some(binding) => {
                let mut values = Vec::with_capacity(binding.rows.len());
                for row in binding.rows {
                    let scope = scope.push(binding.ref_name, row.clone());
                    values.push(self.eval(arg, &scope, None)?);
                }
                Ok(values)
            }
            None => match self.eval(arg, scope, None)? {
                Value::List(items) => Ok(items),
                Value::Null => Ok(Vec::new()),
                value => Ok(vec![value]),
            },
        }
    }

    fn eval_all(
        &self,
        args: &[Eval],
        scope: &Scope,
        binding: Option<&Binding<'_>>,
    ) -> Result<Vec<Value>> {
        args.iter()
            .map(|arg| self.eval(arg, scope, binding))
            .collect()
    }

    fn fold_numeric(
        &self,
        args: &[Eval],
        scope: &Scope,
        binding: Option<&Binding<'_>>,
        fold: impl Fn(f64, f64) -> f64,
    ) -> Result<Value> {
        let values = self.eval_all(args, scope, binding)?;
        let integral = values.iter().all(is_integral);
        let mut iter = values.iter();
        let mut result = iter.next().map_or(0.0, Value::to_number);
        for value in iter {
            result = fold(result, value.to_number());
        }
        if integral && result.fract() == 0.0 {
            Ok(Value::Int(result as i64))
        } else {
            Ok(Value::Float(result))
        }
    }

    fn fold_bits(
        &self,
        args: &[Eval],
        scope: &Scope,
        binding: Option<&Binding<'_>>,
        empty: i64,
        fold: impl Fn(i64, i64) -> i64,
    ) -> Result<Value> {
        let mut result = None;
        for arg in args {
            let value = self.eval(arg, scope, binding)?.as_int().unwrap_or(0);
            result = Some(match result {
                None => value,
                Some(acc) => fold(acc, value),
            });
        }
        Ok(Value::Int(result.unwrap_or(empty)))
    }

    fn compare_terms(
        &self,
        lhs: &Eval,
        rhs: &Eval,
        scope: &Scope,
        binding: Option<&Binding<'_>>,
        check: impl Fn(Option<Ordering>) -> bool,
    ) -> Result<Value> {
        let lhs = self.eval(lhs, scope, binding)?;
        let rhs = self.eval(rhs, scope, binding)?;
        Ok(Value::Bool(check(lhs.compare(&rhs))))
    }

    /// Fills untyped references in a term with types from the registry, so
    /// the polymorphic operators dispatch on declared types.
    fn annotate(&self, term: &Eval, selection: &Selection) -> Eval {
        let env = self.selection_type_env(selection);
        annotate_term(term, &env, self.registry)
    }

    fn selection_type_env(&self, selection: &Selection) -> TypeEnv {
        let mut env = TypeEnv::default();
        match &selection.table {
            SelTable::Join(parts) => {
                let mut members = BTreeMap::new();
                for (name, part) in parts {
                    if let Some(model) = self.registry.get(&part.model) {
                        members.insert(name.clone(), model.row_type());
                    }
                }
                env.default = Some(Type::record(members));
            }
            _ => {
                if let Some(model) = self.registry.get(&selection.model) {
                    env.default = Some(model.row_type());
                }
            }
        }
        env.named.insert(selection.ref_name.clone(), env.default.clone().unwrap_or_else(Type::expr));
        env
    }

    fn type_env_of(&self, model: &Model) -> TypeEnv {
        let mut env = TypeEnv::default();
        if !model.name.is_empty() {
            env.default = Some(model.row_type());
            env.named.insert(model.name.clone(), model.row_type());
        }
        env
    }
}

/// Reference-type environment used by annotation.
#[derive(Debug, Clone, Default)]
pub struct TypeEnv {
    /// Row type of the innermost scope.
    pub default: Option<Type>,
    /// Row types keyed by scope name.
    pub named: BTreeMap<String, Type>,
}

/// Returns a copy of the term with untyped references annotated from the
/// environment. Paths that do not resolve keep the opaque type.
#[must_use]
pub fn annotate_term(term: &Eval, env: &TypeEnv, registry: &Registry) -> Eval {
    let mut term = term.clone();
    annotate_in_place(&mut term, env, registry);
    term
}

fn annotate_in_place(term: &mut Eval, env: &TypeEnv, registry: &Registry) {
    match term {
        Eval::Ref { scope, path, typ } if typ.kind == TypeKind::Expr => {
            let row_type = match scope {
                None => env.default.clone(),
                Some(name) => env
                    .named
                    .get(name)
                    .cloned()
                    .or_else(|| registry.get(name).map(Model::row_type)),
            };
            if let Some(row_type) = row_type {
                if let Some(found) = row_type.inner_at(path) {
                    *typ = found.clone();
                }
            }
        }
        Eval::Ref { .. } | Eval::Literal { .. } | Eval::Exec(_) => {}
        Eval::Add(args)
        | Eval::Sub(args)
        | Eval::Mul(args)
        | Eval::Div(args)
        | Eval::Modulo(args)
        | Eval::And(args)
        | Eval::Or(args)
        | Eval::Xor(args)
        | Eval::Concat(args) => {
            for arg in args {
                annotate_in_place(arg, env, registry);
            }
        }
        Eval::Power(lhs, rhs)
        | Eval::Eq(lhs, rhs)
        | Eval::Ne(lhs, rhs)
        | Eval::Gt(lhs, rhs)
        | Eval::Gte(lhs, rhs)
        | Eval::Lt(lhs, rhs)
        | Eval::Lte(lhs, rhs) => {
            annotate_in_place(lhs, env, registry);
            annotate_in_place(rhs, env, registry);
        }
        Eval::Log(arg, base) => {
            annotate_in_place(arg, env, registry);
            if let Some(base) = base {
                annotate_in_place(base, env, registry);
            }
        }
        Eval::Not(arg)
        | Eval::Sum(arg)
        | Eval::Avg(arg)
        | Eval::Min(arg)
        | Eval::Max(arg)
        | Eval::Count(arg)
        | Eval::Length(arg)
        | Eval::ArrayAgg(arg)
        | Eval::Size(arg)
        | Eval::Number(arg)
        | Eval::Get(arg, _) => annotate_in_place(arg, env, registry),
        Eval::Object(members) => {
            for member in members.values_mut() {
                annotate_in_place(member, env, registry);
            }
        }
        Eval::If {
            cond,
            then,
            otherwise,
        } => {
            annotate_in_place(cond, env, registry);
            annotate_in_place(then, env, registry);
            annotate_in_place(otherwise, env, registry);
        }
        Eval::Switch { branches, default } => {
            for (cond, result) in branches {
                annotate_in_place(cond, env, registry);
                annotate_in_place(result, env, registry);
            }
            annotate_in_place(default, env, registry);
        }
    }
}

fn is_integral(value: &Value) -> bool {
    matches!(value, Value::Int(_) | Value::Uint(_) | Value::Bool(_))
}

fn float_value(value: f64) -> Value {
    Value::Float(value)
}

fn numeric_sum(values: &[Value]) -> Value {
    let integral = values.iter().all(is_integral);
    let total: f64 = values.iter().map(Value::to_number).sum();
    if integral && total.fract() == 0.0 {
        Value::Int(total as i64)
    } else {
        Value::Float(total)
    }
}

fn fold_extreme(values: Vec<Value>, keep: Ordering) -> Value {
    let mut result: Option<Value> = None;
    for value in values {
        if value.is_null() {
            continue;
        }
        result = Some(match result {
            None => value,
            Some(best) => {
                if value.compare(&best) == Some(keep) {
                    value
                } else {
                    best
                }
            }
        });
    }
    result.unwrap_or(Value::Int(0))
}

/// Null values sort before everything else; incomparable pairs keep their
/// relative order.
fn sort_cmp(a: &Value, b: &Value) -> Ordering {
    match (a.is_null(), b.is_null()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Less,
        (false, true) => Ordering::Greater,
        (false, false) => a.compare(b).unwrap_or(Ordering::Equal),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field::Field;
    use crate::model::ModelConfig;
    use crate::object;
    use serde_json::json;

    fn fixture() -> (Registry, BTreeMap<String, Vec<Value>>) {
        let mut registry = Registry::new();
        registry
            .extend(
                "user",
                [
                    ("id".to_string(), Field::parse("unsigned").unwrap()),
                    ("name".to_string(), Field::parse("string").unwrap()),
                    ("age".to_string(), Field::parse("integer").unwrap()),
                    ("flags".to_string(), Field::parse("integer").unwrap()),
                    ("admin".to_string(), Field::parse("boolean").unwrap()),
                    ("tags".to_string(), Field::parse("list").unwrap()),
                ],
                ModelConfig::primary("id"),
            )
            .unwrap();
        let mut store = BTreeMap::new();
        store.insert(
            "user".to_string(),
            vec![
                object! { "id" => 1_i64, "name" => "flo", "age" => 30_i64, "flags" => 5_i64,
                          "admin" => true, "tags" => vec!["a", "b"] },
                object! { "id" => 2_i64, "name" => "ada", "age" => 20_i64, "flags" => 2_i64,
                          "admin" => false, "tags" => Vec::<&str>::new() },
                object! { "id" => 3_i64, "name" => "bob", "age" => 40_i64, "flags" => 0_i64,
                          "admin" => false, "tags" => vec!["b"] },
            ],
        );
        (registry, store)
    }

    fn run(query: serde_json::Value) -> Vec<i64> {
        let (registry, store) = fixture();
        let executor = Executor::new(&registry, &store);
        let selection = Selection::of("user").filter(Query::from_json(&query).unwrap());
        executor
            .execute(&selection)
            .unwrap()
            .iter()
            .map(|row| row.get_path("id").and_then(Value::as_int).unwrap())
            .collect()
    }

    #[test]
    fn test_comparison_operators() {
        assert_eq!(run(json!({"age": {"$gt": 25}})), vec![1, 3]);
        assert_eq!(run(json!({"age": {"$lte": 30}})), vec![1, 2]);
        assert_eq!(run(json!({"name": "ada"})), vec![2]);
        assert_eq!(run(json!({"age": {"$ne": 30}})), vec![2, 3]);
    }

    #[test]
    fn test_in_operators() {
        assert_eq!(run(json!({"id": {"$in": [1, 3]}})), vec![1, 3]);
        assert_eq!(run(json!({"id": {"$in": []}})), Vec::<i64>::new());
        assert_eq!(run(json!({"id": {"$nin": []}})), vec![1, 2, 3]);
        assert_eq!(run(json!({"id": {"$nin": [2]}})), vec![1, 3]);
    }

    #[test]
    fn test_empty_logical_shortcuts() {
        assert_eq!(run(json!({"$or": []})), Vec::<i64>::new());
        assert_eq!(run(json!({"$and": []})), vec![1, 2, 3]);
    }

    #[test]
    fn test_regex_operators() {
        assert_eq!(run(json!({"name": {"$regex": "^[fa]"}})), vec![1, 2]);
    }

    #[test]
    fn test_bit_operators() {
        assert_eq!(run(json!({"flags": {"$bitsAllSet": 5}})), vec![1]);
        assert_eq!(run(json!({"flags": {"$bitsAnySet": 4}})), vec![1]);
        assert_eq!(run(json!({"flags": {"$bitsAllClear": 5}})), vec![3]);
        assert_eq!(run(json!({"flags": {"$bitsAnyClear": 2}})), vec![1, 3]);
    }

    #[test]
    fn test_list_operators() {
        assert_eq!(run(json!({"tags": {"$el": "a"}})), vec![1]);
        assert_eq!(run(json!({"tags": {"$size": 0}})), vec![2]);
        assert_eq!(run(json!({"tags": {"$size": 2}})), vec![1]);
    }

    #[test]
    fn test_exists_operator() {
        assert_eq!(run(json!({"missing": {"$exists": false}})), vec![1, 2, 3]);
        assert_eq!(run(json!({"age": {"$exists": true}})), vec![1, 2, 3]);
    }

    #[test]
    fn test_expr_predicate() {
        assert_eq!(
            run(json!({"$expr": {"$gt": [{"$": "age"}, {"$add": [{"$": "flags"}, 25]}]}})),
            vec![3]
        );
    }

    #[test]
    fn test_bitwise_polymorphism() {
        let (registry, store) = fixture();
        let executor = Executor::new(&registry, &store);
        let selection = Selection::of("user").filter(Query::eq("id", 1_i64));

        // Integer-typed argument: bitwise.
        let term = Eval::col("flags").and(Eval::literal(6_i64));
        let selection_eval = selection.clone().evaluate(Eval::max(term));
        let SelectionKind::Eval(term) = &selection_eval.kind else {
            unreachable!()
        };
        assert_eq!(executor.evaluate(&selection_eval, term).unwrap(), Value::Int(4));

        // Boolean-typed arguments: logical.
        let term = Eval::col("admin").and(Eval::literal(false));
        let logical = selection.evaluate(Eval::min(term));
        let SelectionKind::Eval(term) = &logical.kind else {
            unreachable!()
        };
        assert_eq!(
            executor.evaluate(&logical, term).unwrap(),
            Value::Bool(false)
        );
    }

    #[test]
    fn test_aggregate_evaluation() {
        let (registry, store) = fixture();
        let executor = Executor::new(&registry, &store);
        let selection = Selection::of("user");
        assert_eq!(
            executor
                .evaluate(&selection, &Eval::sum(Eval::col("age")))
                .unwrap(),
            Value::Int(90)
        );
        assert_eq!(
            executor
                .evaluate(&selection, &Eval::length(Eval::col("id")))
                .unwrap(),
            Value::Int(3)
        );
        assert_eq!(
            executor
                .evaluate(&selection, &Eval::avg(Eval::col("age")))
                .unwrap(),
            Value::Float(30.0)
        );
    }

    #[test]
    fn test_scalar_subquery_defaults_on_empty() {
        let (registry, store) = fixture();
        let executor = Executor::new(&registry, &store);
        let empty = Selection::of("user")
            .filter(Query::none())
            .evaluate(Eval::sum(Eval::col("age")));
        let term = Eval::exec(empty);
        assert_eq!(
            executor.eval(&term, &Scope::new(), None).unwrap(),
            Value::Int(0)
        );

        let empty = Selection::of("user")
            .filter(Query::none())
            .evaluate(Eval::array(Eval::col("id")));
        let term = Eval::exec(empty);
        assert_eq!(
            executor.eval(&term, &Scope::new(), None).unwrap(),
            Value::List(Vec::new())
        );
    }

    #[test]
    fn test_sort_limit_offset() {
        let (registry, store) = fixture();
        let executor = Executor::new(&registry, &store);
        let selection = Selection::of("user")
            .order_by(Eval::col("age"), Direction::Desc)
            .limit(2)
            .offset(1);
        let rows = executor.execute(&selection).unwrap();
        let ids: Vec<i64> = rows
            .iter()
            .map(|row| row.get_path("id").and_then(Value::as_int).unwrap())
            .collect();
        assert_eq!(ids, vec![1, 2]);
    }

    #[test]
    fn test_sort_by_computed_term() {
        let (registry, store) = fixture();
        let executor = Executor::new(&registry, &store);
        let selection = Selection::of("user").order_by(
            Eval::col("age").sub(Eval::col("flags")),
            Direction::Asc,
        );
        let rows = executor.execute(&selection).unwrap();
        let ids: Vec<i64> = rows
            .iter()
            .map(|row| row.get_path("id").and_then(Value::as_int).unwrap())
            .collect();
        // Computed keys: 25, 18, 40 — and they are not present in the rows.
        assert_eq!(ids, vec![2, 1, 3]);
        assert!(rows[0].as_object().unwrap().len() == 6);
    }

    #[test]
    fn test_group_by_with_having() {
        let (registry, mut store) = fixture();
        store.insert(
            "post".to_string(),
            vec![
                object! { "id" => 1_i64, "author" => 1_i64 },
                object! { "id" => 2_i64, "author" => 1_i64 },
                object! { "id" => 3_i64, "author" => 2_i64 },
            ],
        );
        let executor = Executor::new(&registry, &store);
        let selection = Selection::of("post")
            .group_by(
                &["author"],
                vec![("total".to_string(), Eval::length(Eval::col("id")))],
            )
            .having(Query::field("total", FieldOp::Gt(Value::Int(1))));
        let rows = executor.execute(&selection).unwrap();
        assert_eq!(rows, vec![object! { "author" => 1_i64, "total" => 2_i64 }]);
    }

    #[test]
    fn test_projection() {
        let (registry, store) = fixture();
        let executor = Executor::new(&registry, &store);
        let selection = Selection::of("user")
            .filter(Query::eq("id", 1_i64))
            .project(vec![
                ("name".to_string(), Eval::col("name")),
                ("next".to_string(), Eval::col("age").add(Eval::literal(1_i64))),
            ]);
        let rows = executor.execute(&selection).unwrap();
        assert_eq!(rows, vec![object! { "name" => "flo", "next" => 31_i64 }]);
    }

    #[test]
    fn test_join_rows() {
        let (registry, mut store) = fixture();
        store.insert(
            "post".to_string(),
            vec![
                object! { "id" => 1_i64, "author" => 1_i64 },
                object! { "id" => 2_i64, "author" => 9_i64 },
            ],
        );
        let executor = Executor::new(&registry, &store);
        let join = Selection::join(
            vec![
                ("u".to_string(), Selection::of("user")),
                ("p".to_string(), Selection::of("post")),
            ],
            Eval::scoped("u", "id").eq(Eval::scoped("p", "author")),
            &[],
        );
        let rows = executor.execute(&join).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get_path("u.id"), Some(&Value::Int(1)));
        assert_eq!(rows[0].get_path("p.id"), Some(&Value::Int(1)));
    }

    #[test]
    fn test_left_outer_join_pads_with_null() {
        let (registry, mut store) = fixture();
        store.insert(
            "post".to_string(),
            vec![object! { "id" => 1_i64, "author" => 1_i64 }],
        );
        let executor = Executor::new(&registry, &store);
        let join = Selection::join(
            vec![
                ("u".to_string(), Selection::of("user")),
                ("p".to_string(), Selection::of("post")),
            ],
            Eval::scoped("u", "id").eq(Eval::scoped("p", "author")),
            &["p"],
        );
        let rows = executor.execute(&join).unwrap();
        assert_eq!(rows.len(), 3);
        let padded = rows
            .iter()
            .filter(|row| row.get_path("p") == Some(&Value::Null))
            .count();
        assert_eq!(padded, 2);
    }
}
