//! The selection algebra.
//!
//! A [`Selection`] is an immutable value denoting a logical table: a base
//! table, a subselection or a named join map, refined by filters, ordering,
//! pagination, grouping and projection. Every method returns a new selection;
//! existing values are never mutated, so selections can be shared freely.

use crate::eval::Eval;
use crate::query::Query;
use crate::types::Type;
use crate::value::Value;

/// What a selection ranges over.
#[derive(Debug, Clone, PartialEq)]
pub enum SelTable {
    /// A named base table.
    Name(String),
    /// A nested subselection.
    Sub(Box<Selection>),
    /// Named participants of a join; the produced row is a record keyed by
    /// these names.
    Join(Vec<(String, Selection)>),
}

/// Sort direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Direction {
    /// Ascending.
    #[default]
    Asc,
    /// Descending.
    Desc,
}

/// Modifiers attached to a selection.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Args {
    /// Projection mapping; the whole row when absent.
    pub fields: Option<Vec<(String, Eval)>>,
    /// Grouping keys.
    pub group: Option<Vec<String>>,
    /// Filter over the aggregated row.
    pub having: Query,
    /// Sort terms, applied in order.
    pub sort: Vec<(Eval, Direction)>,
    /// Maximum number of rows.
    pub limit: Option<usize>,
    /// Number of rows skipped.
    pub offset: usize,
    /// Join participants resolved with a left-outer join.
    pub optional: Vec<String>,
}

/// The terminal form of a selection.
#[derive(Debug, Clone, PartialEq)]
pub enum SelectionKind {
    /// Read matching rows.
    Get,
    /// Evaluate one expression over the selection.
    Eval(Eval),
    /// Update matching rows with the payload.
    Set(Value),
    /// Delete matching rows.
    Remove,
    /// Insert-or-update the given rows, matching on the key fields.
    Upsert {
        /// The rows to merge.
        rows: Vec<Value>,
        /// Fields that identify an existing row.
        keys: Vec<String>,
    },
    /// Insert one row.
    Create(Value),
}

/// An immutable logical-table value.
#[derive(Debug, Clone, PartialEq)]
pub struct Selection {
    /// What the selection ranges over.
    pub table: SelTable,
    /// Stable alias for this scope, used by column references.
    pub ref_name: String,
    /// The row filter.
    pub query: Query,
    /// Modifiers.
    pub args: Args,
    /// The terminal form.
    pub kind: SelectionKind,
    /// The resolved target model name; empty for joins.
    pub model: String,
}

impl Selection {
    /// A selection over a base table with an explicit scope alias.
    #[must_use]
    pub fn new(table: &str, ref_name: &str) -> Self {
        Self {
            table: SelTable::Name(table.to_string()),
            ref_name: ref_name.to_string(),
            query: Query::all(),
            args: Args::default(),
            kind: SelectionKind::Get,
            model: table.to_string(),
        }
    }

    /// A selection over a base table, aliased after the table itself.
    #[must_use]
    pub fn of(table: &str) -> Self {
        Self::new(table, table)
    }

    /// A selection over a subselection.
    #[must_use]
    pub fn subselect(inner: Selection, ref_name: &str) -> Self {
        let model = inner.model.clone();
        Self {
            table: SelTable::Sub(Box::new(inner)),
            ref_name: ref_name.to_string(),
            query: Query::all(),
            args: Args::default(),
            kind: SelectionKind::Get,
            model,
        }
    }

    /// A join over named participants with an `on` condition. Participants
    /// named in `optional` are resolved with a left-outer join.
    #[must_use]
    pub fn join(parts: Vec<(String, Selection)>, on: Eval, optional: &[&str]) -> Self {
        Self {
            table: SelTable::Join(parts),
            ref_name: String::new(),
            query: Query::Expr(on),
            args: Args {
                optional: optional.iter().map(ToString::to_string).collect(),
                ..Args::default()
            },
            kind: SelectionKind::Get,
            model: String::new(),
        }
    }

    /// Restricts the selection with a filter; filters compose conjunctively.
    #[must_use]
    pub fn filter(mut self, query: Query) -> Self {
        self.query = self.query.and(query);
        self
    }

    /// Appends a sort term.
    ///
    /// Sorting by a computed term is supported: drivers introduce a
    /// transient named key, compute it before the sort and strip it after.
    #[must_use]
    pub fn order_by(mut self, term: Eval, direction: Direction) -> Self {
        self.args.sort.push((term, direction));
        self
    }

    /// Caps the number of rows.
    #[must_use]
    pub fn limit(mut self, n: usize) -> Self {
        self.args.limit = Some(n);
        self
    }

    /// Skips leading rows.
    #[must_use]
    pub fn offset(mut self, n: usize) -> Self {
        self.args.offset = n;
        self
    }

    /// Projects named expression terms instead of the whole row.
    #[must_use]
    pub fn project(mut self, fields: Vec<(String, Eval)>) -> Self {
        debug_assert!(matches!(self.kind, SelectionKind::Get));
        self.args.fields = Some(fields);
        self
    }

    /// Groups by the given keys, projecting exactly the keys and the given
    /// aggregates.
    #[must_use]
    pub fn group_by(mut self, keys: &[&str], aggregates: Vec<(String, Eval)>) -> Self {
        debug_assert!(matches!(self.kind, SelectionKind::Get));
        let mut fields: Vec<(String, Eval)> = keys
            .iter()
            .map(|key| ((*key).to_string(), Eval::col(key)))
            .collect();
        fields.extend(aggregates);
        self.args.group = Some(keys.iter().map(ToString::to_string).collect());
        self.args.fields = Some(fields);
        self
    }

    /// Filters the aggregated rows of a grouped selection.
    #[must_use]
    pub fn having(mut self, query: Query) -> Self {
        debug_assert!(self.args.group.is_some());
        self.args.having = self.args.having.and(query);
        self
    }

    /// Turns the selection into an expression evaluation.
    #[must_use]
    pub fn evaluate(mut self, term: Eval) -> Self {
        self.kind = SelectionKind::Eval(term);
        self
    }

    /// Turns the selection into an update of the matching rows.
    #[must_use]
    pub fn set(mut self, update: Value) -> Self {
        self.kind = SelectionKind::Set(update);
        self
    }

    /// Turns the selection into a deletion of the matching rows.
    #[must_use]
    pub fn remove(mut self) -> Self {
        self.kind = SelectionKind::Remove;
        self
    }

    /// Turns the selection into an upsert of the given rows, matching on the
    /// key fields (the primary key when empty).
    #[must_use]
    pub fn upsert(mut self, rows: Vec<Value>, keys: &[&str]) -> Self {
        self.kind = SelectionKind::Upsert {
            rows,
            keys: keys.iter().map(ToString::to_string).collect(),
        };
        self
    }

    /// Turns the selection into an insertion of one row.
    #[must_use]
    pub fn create(mut self, row: Value) -> Self {
        self.kind = SelectionKind::Create(row);
        self
    }

    /// The projected result type of this selection when used as a subquery.
    ///
    /// Expression terminals type as their term; projected reads type as an
    /// array of the projected record; everything else is opaque.
    #[must_use]
    pub fn projected_type(&self) -> Type {
        match &self.kind {
            SelectionKind::Eval(term) => term.return_type(),
            _ => match &self.args.fields {
                Some(fields) => Type::array(Type::record(
                    fields
                        .iter()
                        .map(|(name, term)| (name.clone(), term.return_type()))
                        .collect(),
                )),
                None => Type::expr(),
            },
        }
    }

    /// Base table names this selection and its subselections range over.
    #[must_use]
    pub fn referenced_tables(&self) -> Vec<String> {
        let mut tables = Vec::new();
        self.collect_tables(&mut tables);
        tables.sort();
        tables.dedup();
        tables
    }

    fn collect_tables(&self, out: &mut Vec<String>) {
        match &self.table {
            SelTable::Name(name) => out.push(name.clone()),
            SelTable::Sub(inner) => inner.collect_tables(out),
            SelTable::Join(parts) => {
                for (_, part) in parts {
                    part.collect_tables(out);
                }
            }
        }
        collect_query_tables(&self.query, out);
        collect_query_tables(&self.args.having, out);
    }
}

fn collect_query_tables(query: &Query, out: &mut Vec<String>) {
    match query {
        Query::And(branches) | Query::Or(branches) => {
            for branch in branches {
                collect_query_tables(branch, out);
            }
        }
        Query::Not(branch) => collect_query_tables(branch, out),
        Query::Expr(term) => collect_eval_tables(term, out),
        Query::Field { cond, .. } => {
            for op in &cond.ops {
                use crate::query::FieldOp;
                match op {
                    FieldOp::Some(query) | FieldOp::None(query) | FieldOp::Every(query) => {
                        collect_query_tables(query, out);
                    }
                    _ => {}
                }
            }
        }
    }
}

fn collect_eval_tables(term: &Eval, out: &mut Vec<String>) {
    match term {
        Eval::Exec(selection) => selection.collect_tables(out),
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
                collect_eval_tables(arg, out);
            }
        }
        Eval::Power(lhs, rhs)
        | Eval::Eq(lhs, rhs)
        | Eval::Ne(lhs, rhs)
        | Eval::Gt(lhs, rhs)
        | Eval::Gte(lhs, rhs)
        | Eval::Lt(lhs, rhs)
        | Eval::Lte(lhs, rhs) => {
            collect_eval_tables(lhs, out);
            collect_eval_tables(rhs, out);
        }
        Eval::Log(arg, base) => {
            collect_eval_tables(arg, out);
            if let Some(base) = base {
                collect_eval_tables(base, out);
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
        | Eval::Get(arg, _) => collect_eval_tables(arg, out),
        Eval::Object(members) => {
            for member in members.values() {
                collect_eval_tables(member, out);
            }
        }
        Eval::If {
            cond,
            then,
            otherwise,
        } => {
            collect_eval_tables(cond, out);
            collect_eval_tables(then, out);
            collect_eval_tables(otherwise, out);
        }
        Eval::Switch { branches, default } => {
            for (cond, result) in branches {
                collect_eval_tables(cond, out);
                collect_eval_tables(result, out);
            }
            collect_eval_tables(default, out);
        }
        Eval::Literal { .. } | Eval::Ref { .. } => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::FieldOp;
    use crate::value::Value;

    #[test]
    fn test_filters_compose_conjunctively() {
        let selection = Selection::of("user")
            .filter(Query::eq("name", "flo"))
            .filter(Query::field("age", FieldOp::Gt(Value::Int(18))));
        match selection.query {
            Query::And(branches) => assert_eq!(branches.len(), 2),
            other => panic!("expected conjunction, got {other:?}"),
        }
    }

    #[test]
    fn test_composition_does_not_mutate() {
        let base = Selection::of("user");
        let limited = base.clone().limit(5);
        assert_eq!(base.args.limit, None);
        assert_eq!(limited.args.limit, Some(5));
    }

    #[test]
    fn test_group_by_projects_keys_and_aggregates() {
        let selection = Selection::of("post").group_by(
            &["author"],
            vec![("total".to_string(), Eval::count(Eval::col("id")))],
        );
        let fields = selection.args.fields.unwrap();
        assert_eq!(fields[0].0, "author");
        assert_eq!(fields[1].0, "total");
        assert_eq!(selection.args.group, Some(vec!["author".to_string()]));
    }

    #[test]
    fn test_join_names_participants() {
        let join = Selection::join(
            vec![
                ("u".to_string(), Selection::of("user")),
                ("p".to_string(), Selection::of("post")),
            ],
            Eval::scoped("u", "id").eq(Eval::scoped("p", "author_id")),
            &["p"],
        );
        assert!(matches!(join.table, SelTable::Join(ref parts) if parts.len() == 2));
        assert_eq!(join.args.optional, vec!["p".to_string()]);
    }

    #[test]
    fn test_referenced_tables_sees_subqueries() {
        let subquery = Selection::of("post").evaluate(Eval::count(Eval::col("id")));
        let selection = Selection::of("user").filter(Query::Expr(
            Eval::exec(subquery).gt(Eval::literal(0_i64)),
        ));
        assert_eq!(selection.referenced_tables(), vec!["post", "user"]);
    }
}
