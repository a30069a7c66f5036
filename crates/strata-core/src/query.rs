//! The declarative filter AST.
//!
//! [`Query`] mirrors the JSON filter language accepted by the public API:
//! per-field operator sets combined with logical operators, plus `$expr` for
//! arbitrary boolean [`Eval`] terms. The JSON shorthands — bare comparable
//! for `$eq`, array for `$in`, plain nested records auto-flattening to
//! dotted paths — are normalized away at parse time.

use crate::error::{Error, Result};
use crate::eval::Eval;
use crate::value::Value;

/// A regular expression pattern carried by `$regex`.
///
/// The pattern compiles lazily so queries stay plain data until matched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pattern {
    /// The pattern source.
    pub source: String,
    /// Flag characters; `i`, `m` and `s` are honored.
    pub flags: String,
}

impl Pattern {
    /// Creates a pattern without flags.
    #[must_use]
    pub fn new(source: &str) -> Self {
        Self {
            source: source.to_string(),
            flags: String::new(),
        }
    }

    /// Creates a pattern with flags.
    #[must_use]
    pub fn with_flags(source: &str, flags: &str) -> Self {
        Self {
            source: source.to_string(),
            flags: flags.to_string(),
        }
    }

    /// Compiles the pattern.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ExpressionUnlowerable`] when the source does not
    /// compile.
    pub fn compile(&self) -> Result<regex::Regex> {
        let mut builder = regex::RegexBuilder::new(&self.source);
        builder
            .case_insensitive(self.flags.contains('i'))
            .multi_line(self.flags.contains('m'))
            .dot_matches_new_line(self.flags.contains('s'));
        builder
            .build()
            .map_err(|e| Error::unlowerable(format!("invalid pattern {:?}: {e}", self.source)))
    }

    /// Whether the pattern matches the given text.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ExpressionUnlowerable`] when the source does not
    /// compile.
    pub fn is_match(&self, text: &str) -> Result<bool> {
        Ok(self.compile()?.is_match(text))
    }
}

/// A single operator applied to one field.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldOp {
    /// Equal by value-of coercion.
    Eq(Value),
    /// Not equal by value-of coercion.
    Ne(Value),
    /// Strictly greater.
    Gt(Value),
    /// Greater or equal.
    Gte(Value),
    /// Strictly less.
    Lt(Value),
    /// Less or equal.
    Lte(Value),
    /// Member of the list; the empty list matches nothing.
    In(Vec<Value>),
    /// Not a member of the list; the empty list matches everything.
    Nin(Vec<Value>),
    /// The field value matches the pattern.
    Regex(Pattern),
    /// Inverted regex: the field value is the pattern, the operand the text.
    RegexFor(String),
    /// `true` matches non-null values, `false` matches null or missing ones.
    Exists(bool),
    /// Every mask bit is set in the integer field.
    BitsAllSet(i64),
    /// Every mask bit is clear in the integer field.
    BitsAllClear(i64),
    /// At least one mask bit is set in the integer field.
    BitsAnySet(i64),
    /// At least one mask bit is clear in the integer field.
    BitsAnyClear(i64),
    /// Existentially pushes the condition into list elements.
    El(Box<FieldCond>),
    /// Matches the list length.
    Size(usize),
    /// Some related row satisfies the query.
    Some(Box<Query>),
    /// No related row satisfies the query.
    None(Box<Query>),
    /// Every related row satisfies the query; vacuously true when the
    /// related set is empty.
    Every(Box<Query>),
}

/// A conjunction of operators on one field.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FieldCond {
    /// The operators, all of which must hold.
    pub ops: Vec<FieldOp>,
}

impl FieldCond {
    /// A condition from a single operator.
    #[must_use]
    pub fn op(op: FieldOp) -> Self {
        Self { ops: vec![op] }
    }
}

impl From<FieldOp> for FieldCond {
    fn from(op: FieldOp) -> Self {
        Self::op(op)
    }
}

/// A declarative filter over one logical table.
#[derive(Debug, Clone, PartialEq)]
pub enum Query {
    /// All branches hold; the empty conjunction matches every row.
    And(Vec<Query>),
    /// Some branch holds; the empty disjunction matches no row.
    Or(Vec<Query>),
    /// The branch does not hold.
    Not(Box<Query>),
    /// An arbitrary boolean expression term.
    Expr(Eval),
    /// Operators applied to one dotted field path. An empty path stands for
    /// the target's primary key and is filled in during relation resolution.
    Field {
        /// Dotted path of the field.
        path: String,
        /// Operators on the field.
        cond: FieldCond,
    },
}

impl Default for Query {
    fn default() -> Self {
        Self::all()
    }
}

impl Query {
    /// The query matching every row.
    #[must_use]
    pub fn all() -> Self {
        Self::And(Vec::new())
    }

    /// The query matching no row.
    #[must_use]
    pub fn none() -> Self {
        Self::Or(Vec::new())
    }

    /// Whether this is the trivial match-all query.
    #[must_use]
    pub fn is_all(&self) -> bool {
        matches!(self, Self::And(branches) if branches.is_empty())
    }

    /// A single-operator field query.
    #[must_use]
    pub fn field(path: &str, op: FieldOp) -> Self {
        Self::Field {
            path: path.to_string(),
            cond: op.into(),
        }
    }

    /// Equality on a field.
    #[must_use]
    pub fn eq(path: &str, value: impl Into<Value>) -> Self {
        Self::field(path, FieldOp::Eq(value.into()))
    }

    /// Membership on a field.
    #[must_use]
    pub fn within(path: &str, values: Vec<Value>) -> Self {
        Self::field(path, FieldOp::In(values))
    }

    /// Conjunction with another query; trivial branches collapse.
    #[must_use]
    pub fn and(self, other: Query) -> Self {
        match (self, other) {
            (lhs, rhs) if rhs.is_all() => lhs,
            (lhs, rhs) if lhs.is_all() => rhs,
            (Self::And(mut branches), rhs) => {
                branches.push(rhs);
                Self::And(branches)
            }
            (lhs, rhs) => Self::And(vec![lhs, rhs]),
        }
    }

    /// Disjunction with another query.
    #[must_use]
    pub fn or(self, other: Query) -> Self {
        match self {
            Self::Or(mut branches) if !branches.is_empty() => {
                branches.push(other);
                Self::Or(branches)
            }
            lhs => Self::Or(vec![lhs, other]),
        }
    }

    /// Negation.
    #[must_use]
    #[allow(clippy::should_implement_trait)]
    pub fn not(self) -> Self {
        Self::Not(Box::new(self))
    }

    /// Parses the JSON filter language.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ExpressionUnlowerable`] on unknown operators or
    /// malformed operands.
    pub fn from_json(json: &serde_json::Value) -> Result<Self> {
        Self::parse(&Value::from_json(json))
    }

    /// Parses a query from its [`Value`] shape, normalizing shorthands.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ExpressionUnlowerable`] on unknown operators or
    /// malformed operands.
    pub fn parse(value: &Value) -> Result<Self> {
        let Value::Object(map) = value else {
            return Err(Error::unlowerable("query root must be an object"));
        };
        let mut branches = Vec::new();
        for (key, value) in map {
            branches.push(match key.as_str() {
                "$and" => Self::And(parse_list(value)?),
                "$or" => Self::Or(parse_list(value)?),
                "$not" => Self::Not(Box::new(Self::parse(value)?)),
                "$expr" => Self::Expr(parse_eval(value)?),
                key if key.starts_with('$') => {
                    return Err(Error::unlowerable(format!("unknown operator {key}")));
                }
                key => parse_field(key, value)?,
            });
        }
        Ok(match branches.len() {
            1 => branches.into_iter().next().unwrap_or_else(Self::all),
            _ => Self::And(branches),
        })
    }
}

fn parse_list(value: &Value) -> Result<Vec<Query>> {
    let Value::List(items) = value else {
        return Err(Error::unlowerable("logical operator expects a list"));
    };
    items.iter().map(Query::parse).collect()
}

/// Parses one field entry, applying the shorthand coercions.
fn parse_field(path: &str, value: &Value) -> Result<Query> {
    match value {
        Value::Object(map) if map.keys().any(|key| key.starts_with('$')) => Ok(Query::Field {
            path: path.to_string(),
            cond: parse_cond(value)?,
        }),
        // A plain nested record auto-flattens to dotted paths.
        Value::Object(map) if !map.is_empty() => {
            let mut branches = Vec::new();
            for (key, member) in map {
                branches.push(parse_field(&format!("{path}.{key}"), member)?);
            }
            Ok(Query::And(branches))
        }
        Value::List(items) => Ok(Query::field(path, FieldOp::In(items.clone()))),
        value => Ok(Query::field(path, FieldOp::Eq(value.clone()))),
    }
}

fn parse_cond(value: &Value) -> Result<FieldCond> {
    let Value::Object(map) = value else {
        return Ok(FieldOp::Eq(value.clone()).into());
    };
    let mut ops = Vec::new();
    for (key, operand) in map {
        ops.push(match key.as_str() {
            "$eq" => FieldOp::Eq(operand.clone()),
            "$ne" => FieldOp::Ne(operand.clone()),
            "$gt" => FieldOp::Gt(operand.clone()),
            "$gte" => FieldOp::Gte(operand.clone()),
            "$lt" => FieldOp::Lt(operand.clone()),
            "$lte" => FieldOp::Lte(operand.clone()),
            "$in" => FieldOp::In(expect_list(operand)?),
            "$nin" => FieldOp::Nin(expect_list(operand)?),
            "$regex" => FieldOp::Regex(parse_pattern(operand)?),
            "$regexFor" => match operand {
                Value::String(text) => FieldOp::RegexFor(text.clone()),
                _ => return Err(Error::unlowerable("$regexFor expects a string")),
            },
            "$exists" => match operand {
                Value::Bool(present) => FieldOp::Exists(*present),
                _ => return Err(Error::unlowerable("$exists expects a boolean")),
            },
            "$bitsAllSet" => FieldOp::BitsAllSet(expect_int(operand)?),
            "$bitsAllClear" => FieldOp::BitsAllClear(expect_int(operand)?),
            "$bitsAnySet" => FieldOp::BitsAnySet(expect_int(operand)?),
            "$bitsAnyClear" => FieldOp::BitsAnyClear(expect_int(operand)?),
            "$el" => FieldOp::El(Box::new(parse_cond(operand)?)),
            "$size" => FieldOp::Size(usize::try_from(expect_int(operand)?).unwrap_or(0)),
            "$some" => FieldOp::Some(Box::new(parse_relation_operand(operand)?)),
            "$none" => FieldOp::None(Box::new(parse_relation_operand(operand)?)),
            "$every" => FieldOp::Every(Box::new(parse_relation_operand(operand)?)),
            key => return Err(Error::unlowerable(format!("unknown operator {key}"))),
        });
    }
    Ok(FieldCond { ops })
}

/// Relation predicates accept a full query, or scalar and array shorthands
/// that target the child's primary key. The primary-key path is unknown
/// until relation resolution and is left empty here.
fn parse_relation_operand(operand: &Value) -> Result<Query> {
    match operand {
        Value::Object(_) => Query::parse(operand),
        Value::List(items) => Ok(Query::field("", FieldOp::In(items.clone()))),
        value => Ok(Query::field("", FieldOp::Eq(value.clone()))),
    }
}

fn parse_pattern(operand: &Value) -> Result<Pattern> {
    match operand {
        Value::String(source) => Ok(Pattern::new(source)),
        Value::Object(map) => {
            let source = map
                .get("source")
                .and_then(Value::as_str)
                .ok_or_else(|| Error::unlowerable("$regex expects source"))?;
            let flags = map.get("flags").and_then(Value::as_str).unwrap_or("");
            Ok(Pattern::with_flags(source, flags))
        }
        _ => Err(Error::unlowerable("$regex expects a pattern")),
    }
}

fn expect_list(value: &Value) -> Result<Vec<Value>> {
    value
        .as_list()
        .map(<[Value]>::to_vec)
        .ok_or_else(|| Error::unlowerable("operator expects a list"))
}

fn expect_int(value: &Value) -> Result<i64> {
    value
        .as_int()
        .ok_or_else(|| Error::unlowerable("operator expects an integer"))
}

/// Parses an [`Eval`] term from its JSON shape.
///
/// # Errors
///
/// Returns [`Error::ExpressionUnlowerable`] on unknown operators.
pub fn parse_eval(value: &Value) -> Result<Eval> {
    let Value::Object(map) = value else {
        return Ok(Eval::literal(value.clone()));
    };
    if map.len() != 1 || !map.keys().any(|key| key.starts_with('$')) {
        return Ok(Eval::literal(value.clone()));
    }
    let Some((key, operand)) = map.iter().next() else {
        return Ok(Eval::literal(value.clone()));
    };
    let key = key.clone();
    let operand = operand.clone();
    let unary = |operand: &Value| -> Result<Box<Eval>> { Ok(Box::new(parse_eval(operand)?)) };
    let list = |operand: &Value| -> Result<Vec<Eval>> {
        operand
            .as_list()
            .ok_or_else(|| Error::unlowerable(format!("{key} expects a list")))?
            .iter()
            .map(parse_eval)
            .collect()
    };
    let binary = |operand: &Value| -> Result<(Box<Eval>, Box<Eval>)> {
        let args = list(operand)?;
        let mut args = args.into_iter();
        match (args.next(), args.next()) {
            (Some(lhs), Some(rhs)) => Ok((Box::new(lhs), Box::new(rhs))),
            _ => Err(Error::unlowerable(format!("{key} expects two arguments"))),
        }
    };
    Ok(match key.as_str() {
        "$" => match &operand {
            Value::String(path) => Eval::col(path),
            Value::List(parts) => match parts.as_slice() {
                [Value::String(scope), Value::String(path)] => Eval::scoped(scope, path),
                _ => return Err(Error::unlowerable("$ expects [ref, path]")),
            },
            _ => return Err(Error::unlowerable("$ expects a path")),
        },
        "$literal" => Eval::literal(operand.clone()),
        "$add" => Eval::Add(list(&operand)?),
        "$sub" | "$subtract" => Eval::Sub(list(&operand)?),
        "$mul" | "$multiply" => Eval::Mul(list(&operand)?),
        "$div" | "$divide" => Eval::Div(list(&operand)?),
        "$mod" | "$modulo" => Eval::Modulo(list(&operand)?),
        "$power" => {
            let (base, exponent) = binary(&operand)?;
            Eval::Power(base, exponent)
        }
        "$log" => match operand.as_list() {
            Some([value]) => Eval::Log(Box::new(parse_eval(value)?), None),
            Some([value, base]) => Eval::Log(
                Box::new(parse_eval(value)?),
                Some(Box::new(parse_eval(base)?)),
            ),
            _ => Eval::Log(unary(&operand)?, None),
        },
        "$eq" => {
            let (lhs, rhs) = binary(&operand)?;
            Eval::Eq(lhs, rhs)
        }
        "$ne" => {
            let (lhs, rhs) = binary(&operand)?;
            Eval::Ne(lhs, rhs)
        }
        "$gt" => {
            let (lhs, rhs) = binary(&operand)?;
            Eval::Gt(lhs, rhs)
        }
        "$gte" => {
            let (lhs, rhs) = binary(&operand)?;
            Eval::Gte(lhs, rhs)
        }
        "$lt" => {
            let (lhs, rhs) = binary(&operand)?;
            Eval::Lt(lhs, rhs)
        }
        "$lte" => {
            let (lhs, rhs) = binary(&operand)?;
            Eval::Lte(lhs, rhs)
        }
        "$and" => Eval::And(list(&operand)?),
        "$or" => Eval::Or(list(&operand)?),
        "$not" => Eval::Not(unary(&operand)?),
        "$xor" => Eval::Xor(list(&operand)?),
        "$sum" => Eval::Sum(unary(&operand)?),
        "$avg" => Eval::Avg(unary(&operand)?),
        "$min" => Eval::Min(unary(&operand)?),
        "$max" => Eval::Max(unary(&operand)?),
        "$count" => Eval::Count(unary(&operand)?),
        "$length" => Eval::Length(unary(&operand)?),
        "$array" => Eval::ArrayAgg(unary(&operand)?),
        "$size" => Eval::Size(unary(&operand)?),
        "$concat" => Eval::Concat(list(&operand)?),
        "$number" => Eval::Number(unary(&operand)?),
        "$get" => match operand.as_list() {
            Some([target, Value::String(path)]) => {
                Eval::Get(Box::new(parse_eval(target)?), path.clone())
            }
            _ => return Err(Error::unlowerable("$get expects [target, path]")),
        },
        // Element access into a list value.
        "$el" => match operand.as_list() {
            Some([target, Value::Int(index)]) => {
                Eval::Get(Box::new(parse_eval(target)?), index.to_string())
            }
            _ => return Err(Error::unlowerable("$el expects [list, index]")),
        },
        "$object" => {
            let members = operand
                .as_object()
                .ok_or_else(|| Error::unlowerable("$object expects a record"))?
                .iter()
                .map(|(name, member)| Ok((name.clone(), parse_eval(member)?)))
                .collect::<Result<_>>()?;
            Eval::Object(members)
        }
        "$if" => match operand.as_list() {
            Some([cond, then, otherwise]) => Eval::If {
                cond: Box::new(parse_eval(cond)?),
                then: Box::new(parse_eval(then)?),
                otherwise: Box::new(parse_eval(otherwise)?),
            },
            _ => return Err(Error::unlowerable("$if expects [cond, then, else]")),
        },
        "$switch" => {
            let map = operand
                .as_object()
                .ok_or_else(|| Error::unlowerable("$switch expects branches and default"))?;
            let branches = map
                .get("branches")
                .and_then(Value::as_list)
                .ok_or_else(|| Error::unlowerable("$switch expects branches"))?
                .iter()
                .map(|branch| match branch.as_list() {
                    Some([cond, result]) => Ok((parse_eval(cond)?, parse_eval(result)?)),
                    _ => Err(Error::unlowerable("$switch branch expects [cond, result]")),
                })
                .collect::<Result<Vec<_>>>()?;
            let default = map.get("default").cloned().unwrap_or(Value::Null);
            Eval::Switch {
                branches,
                default: Box::new(parse_eval(&default)?),
            }
        }
        key => return Err(Error::unlowerable(format!("unknown operator {key}"))),
    })
}
