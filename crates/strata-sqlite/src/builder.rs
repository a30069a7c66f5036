//! SQL fragment emission.
//!
//! Builds `(sql, params)` pairs for the parts of the IR that push down to
//! SQLite. Anything this module refuses is completed by the portable
//! evaluator over fetched rows, so refusing is always safe.

use strata_core::eval::Eval;
use strata_core::query::{FieldOp, Query};
use strata_core::selection::{Args, Direction, SelTable, Selection, SelectionKind};
use strata_core::value::Value;

/// Quotes an identifier with double quotes.
#[must_use]
pub fn quote(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// The physical shape of a parameter value: `None` when the value cannot be
/// bound (expression terms).
#[must_use]
pub fn physical(value: &Value) -> Option<Value> {
    Some(match value {
        Value::Null => Value::Null,
        Value::Bool(b) => Value::Int(i64::from(*b)),
        Value::Int(n) => Value::Int(*n),
        Value::Uint(n) => Value::Int(i64::try_from(*n).ok()?),
        Value::Float(f) => Value::Float(*f),
        Value::String(s) => Value::String(s.clone()),
        Value::Bytes(b) => Value::Bytes(b.clone()),
        Value::Date(d) => Value::String(d.format("%Y-%m-%d").to_string()),
        Value::Time(t) => Value::String(t.format("%H:%M:%S%.f").to_string()),
        Value::DateTime(dt) => Value::String(dt.format("%Y-%m-%d %H:%M:%S%.f").to_string()),
        Value::List(_) | Value::Object(_) => Value::String(value.to_json().to_string()),
        Value::Expr(_) => return None,
    })
}

/// Emits a WHERE clause for a query, or `None` when any part of it has no
/// SQL translation.
#[must_use]
pub fn where_clause(query: &Query) -> Option<(String, Vec<Value>)> {
    match query {
        Query::And(branches) => combine(branches, " AND ", "1=1"),
        Query::Or(branches) => combine(branches, " OR ", "1=0"),
        Query::Not(branch) => {
            let (sql, params) = where_clause(branch)?;
            Some((format!("NOT ({sql})"), params))
        }
        Query::Expr(_) => None,
        Query::Field { path, cond } => {
            let mut sql = Vec::new();
            let mut params = Vec::new();
            for op in &cond.ops {
                let (fragment, mut values) = field_op(path, op)?;
                sql.push(fragment);
                params.append(&mut values);
            }
            match sql.len() {
                0 => Some(("1=1".to_string(), params)),
                _ => Some((sql.join(" AND "), params)),
            }
        }
    }
}

fn combine(branches: &[Query], joiner: &str, empty: &str) -> Option<(String, Vec<Value>)> {
    if branches.is_empty() {
        return Some((empty.to_string(), Vec::new()));
    }
    let mut sql = Vec::new();
    let mut params = Vec::new();
    for branch in branches {
        let (fragment, mut values) = where_clause(branch)?;
        sql.push(format!("({fragment})"));
        params.append(&mut values);
    }
    Some((sql.join(joiner), params))
}

fn field_op(path: &str, op: &FieldOp) -> Option<(String, Vec<Value>)> {
    let column = quote(path);
    Some(match op {
        FieldOp::Eq(Value::Null) => (format!("{column} IS NULL"), Vec::new()),
        FieldOp::Ne(Value::Null) => (format!("{column} IS NOT NULL"), Vec::new()),
        FieldOp::Eq(value) => (format!("{column} = ?"), vec![physical(value)?]),
        FieldOp::Ne(value) => (format!("{column} != ?"), vec![physical(value)?]),
        FieldOp::Gt(value) => (format!("{column} > ?"), vec![physical(value)?]),
        FieldOp::Gte(value) => (format!("{column} >= ?"), vec![physical(value)?]),
        FieldOp::Lt(value) => (format!("{column} < ?"), vec![physical(value)?]),
        FieldOp::Lte(value) => (format!("{column} <= ?"), vec![physical(value)?]),
        FieldOp::In(values) => {
            if values.is_empty() {
                return Some(("1=0".to_string(), Vec::new()));
            }
            let params = values.iter().map(physical).collect::<Option<Vec<_>>>()?;
            let placeholders = vec!["?"; params.len()].join(", ");
            (format!("{column} IN ({placeholders})"), params)
        }
        FieldOp::Nin(values) => {
            if values.is_empty() {
                return Some(("1=1".to_string(), Vec::new()));
            }
            let params = values.iter().map(physical).collect::<Option<Vec<_>>>()?;
            let placeholders = vec!["?"; params.len()].join(", ");
            (format!("{column} NOT IN ({placeholders})"), params)
        }
        FieldOp::Exists(true) => (format!("{column} IS NOT NULL"), Vec::new()),
        FieldOp::Exists(false) => (format!("{column} IS NULL"), Vec::new()),
        FieldOp::BitsAllSet(mask) => (format!("({column} & ?) = ?"), vec![
            Value::Int(*mask),
            Value::Int(*mask),
        ]),
        FieldOp::BitsAllClear(mask) => (format!("({column} & ?) = 0"), vec![Value::Int(*mask)]),
        FieldOp::BitsAnySet(mask) => (format!("({column} & ?) != 0"), vec![Value::Int(*mask)]),
        FieldOp::BitsAnyClear(mask) => (format!("({column} & ?) != ?"), vec![
            Value::Int(*mask),
            Value::Int(*mask),
        ]),
        _ => return None,
    })
}

/// Emits a full SELECT for the selection, or `None` when any part needs the
/// evaluator: subselects, joins, projection, grouping, computed sort keys.
#[must_use]
pub fn plan_select(selection: &Selection) -> Option<(String, Vec<Value>)> {
    let SelTable::Name(table) = &selection.table else {
        return None;
    };
    if !matches!(selection.kind, SelectionKind::Get) {
        return None;
    }
    let Args {
        fields,
        group,
        having,
        sort,
        limit,
        offset,
        optional,
    } = &selection.args;
    if fields.is_some() || group.is_some() || !having.is_all() || !optional.is_empty() {
        return None;
    }

    let (where_sql, params) = where_clause(&selection.query)?;
    let mut sql = format!("SELECT * FROM {}", quote(table));
    if where_sql != "1=1" {
        sql.push_str(" WHERE ");
        sql.push_str(&where_sql);
    }

    if !sort.is_empty() {
        let mut terms = Vec::new();
        for (term, direction) in sort {
            let Eval::Ref { scope: None, path, .. } = term else {
                return None;
            };
            let direction = match direction {
                Direction::Asc => "ASC",
                Direction::Desc => "DESC",
            };
            terms.push(format!("{} {direction}", quote(path)));
        }
        sql.push_str(" ORDER BY ");
        sql.push_str(&terms.join(", "));
    }

    match (limit, offset) {
        (Some(limit), offset) => {
            sql.push_str(&format!(" LIMIT {limit}"));
            if *offset > 0 {
                sql.push_str(&format!(" OFFSET {offset}"));
            }
        }
        (None, offset) if *offset > 0 => {
            sql.push_str(&format!(" LIMIT -1 OFFSET {offset}"));
        }
        _ => {}
    }
    Some((sql, params))
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_core::query::Pattern;

    #[test]
    fn test_simple_where_clause() {
        let query = Query::eq("name", "flo").and(Query::field("age", FieldOp::Gt(Value::Int(18))));
        let (sql, params) = where_clause(&query).unwrap();
        assert_eq!(sql, "(\"name\" = ?) AND (\"age\" > ?)");
        assert_eq!(params.len(), 2);
    }

    #[test]
    fn test_null_comparisons_use_is_null() {
        let (sql, params) = where_clause(&Query::eq("tag", Value::Null)).unwrap();
        assert_eq!(sql, "\"tag\" IS NULL");
        assert!(params.is_empty());
    }

    #[test]
    fn test_empty_in_lists() {
        let (sql, _) = where_clause(&Query::within("id", vec![])).unwrap();
        assert_eq!(sql, "1=0");
        let (sql, _) = where_clause(&Query::field("id", FieldOp::Nin(vec![]))).unwrap();
        assert_eq!(sql, "1=1");
    }

    #[test]
    fn test_regex_is_not_pushable() {
        let query = Query::field("name", FieldOp::Regex(Pattern::new("^f")));
        assert!(where_clause(&query).is_none());
    }

    #[test]
    fn test_plan_select_with_sort_and_limit() {
        let selection = Selection::of("user")
            .filter(Query::eq("age", 30_i64))
            .order_by(Eval::col("name"), Direction::Desc)
            .limit(5)
            .offset(2);
        let (sql, params) = plan_select(&selection).unwrap();
        assert_eq!(
            sql,
            "SELECT * FROM \"user\" WHERE \"age\" = ? ORDER BY \"name\" DESC LIMIT 5 OFFSET 2"
        );
        assert_eq!(params, vec![Value::Int(30)]);
    }

    #[test]
    fn test_plan_select_refuses_computed_sort() {
        let selection = Selection::of("user").order_by(
            Eval::col("a").add(Eval::col("b")),
            Direction::Asc,
        );
        assert!(plan_select(&selection).is_none());
    }

    #[test]
    fn test_identifier_quoting() {
        assert_eq!(quote("meta.nick"), "\"meta.nick\"");
        assert_eq!(quote("a\"b"), "\"a\"\"b\"");
    }
}
