//! The evaluation expression tree.
//!
//! [`Eval`] is a tagged expression IR. Every node has a result type derived
//! from its operator and argument types, which drives SQL casting and the
//! polymorphic operators: `and`, `or`, `not` and `xor` are logical when every
//! argument is boolean-typed and bitwise otherwise. The dispatch looks only
//! at the argument-type tuple, never at runtime values.

use std::collections::BTreeMap;

use crate::selection::Selection;
use crate::types::{Type, TypeKind};
use crate::value::Value;

/// A typed expression node.
#[derive(Debug, Clone, PartialEq)]
pub enum Eval {
    /// A literal value with an optional declared type.
    Literal {
        /// The literal value.
        value: Value,
        /// Declared result type; inferred from the value when absent.
        typ: Option<Type>,
    },
    /// A column reference `$(ref, path)`.
    Ref {
        /// The selection scope to resolve against; the innermost scope when
        /// absent.
        scope: Option<String>,
        /// Dotted path of the column inside the scope's row.
        path: String,
        /// The declared type of the referenced column.
        typ: Type,
    },

    // Arithmetic.
    /// Numeric sum of the arguments.
    Add(Vec<Eval>),
    /// Left-to-right subtraction.
    Sub(Vec<Eval>),
    /// Numeric product of the arguments.
    Mul(Vec<Eval>),
    /// Left-to-right division.
    Div(Vec<Eval>),
    /// Left-to-right remainder.
    Modulo(Vec<Eval>),
    /// Exponentiation.
    Power(Box<Eval>, Box<Eval>),
    /// Logarithm of the first argument in the base of the second, natural
    /// when the base is absent.
    Log(Box<Eval>, Option<Box<Eval>>),

    // Comparison.
    /// Equality by value-of coercion.
    Eq(Box<Eval>, Box<Eval>),
    /// Inequality by value-of coercion.
    Ne(Box<Eval>, Box<Eval>),
    /// Strictly greater.
    Gt(Box<Eval>, Box<Eval>),
    /// Greater or equal.
    Gte(Box<Eval>, Box<Eval>),
    /// Strictly less.
    Lt(Box<Eval>, Box<Eval>),
    /// Less or equal.
    Lte(Box<Eval>, Box<Eval>),

    // Logical on boolean arguments, bitwise on integer arguments.
    /// Conjunction, or bitwise AND.
    And(Vec<Eval>),
    /// Disjunction, or bitwise OR.
    Or(Vec<Eval>),
    /// Negation, or bitwise complement.
    Not(Box<Eval>),
    /// Exclusive disjunction, or bitwise XOR.
    Xor(Vec<Eval>),

    // Aggregates. Inside a grouping context they bind to the group;
    // otherwise they span all rows of the selection.
    /// Sum of the argument over the bound rows.
    Sum(Box<Eval>),
    /// Average of the argument over the bound rows.
    Avg(Box<Eval>),
    /// Minimum of the argument over the bound rows.
    Min(Box<Eval>),
    /// Maximum of the argument over the bound rows.
    Max(Box<Eval>),
    /// Number of distinct non-null argument values over the bound rows.
    Count(Box<Eval>),
    /// Number of bound rows, or length of a list argument.
    Length(Box<Eval>),
    /// Collects the argument over the bound rows into a list.
    ArrayAgg(Box<Eval>),

    // Collection.
    /// Member access into a json value.
    Get(Box<Eval>, String),
    /// Length of a list or string value.
    Size(Box<Eval>),
    /// String concatenation.
    Concat(Vec<Eval>),
    /// Builds a nested json object from named terms.
    Object(BTreeMap<String, Eval>),

    // Conditional.
    /// Two-way branch on a boolean condition.
    If {
        /// The condition.
        cond: Box<Eval>,
        /// Result when the condition holds.
        then: Box<Eval>,
        /// Result otherwise.
        otherwise: Box<Eval>,
    },
    /// First-match multi-way branch.
    Switch {
        /// `(condition, result)` pairs tried in order.
        branches: Vec<(Eval, Eval)>,
        /// Result when no branch matches.
        default: Box<Eval>,
    },

    /// Numeric coercion: dates become seconds since the epoch, null becomes
    /// zero.
    Number(Box<Eval>),

    /// A subquery over a full selection. Scalar aggregates default to their
    /// neutral value on empty row sets.
    Exec(Box<Selection>),
}

impl Eval {
    /// A literal with its type inferred from the value.
    #[must_use]
    pub fn literal(value: impl Into<Value>) -> Self {
        Self::Literal {
            value: value.into(),
            typ: None,
        }
    }

    /// A literal with a declared result type.
    #[must_use]
    pub fn typed_literal(value: impl Into<Value>, typ: Type) -> Self {
        Self::Literal {
            value: value.into(),
            typ: Some(typ),
        }
    }

    /// A column reference in the innermost scope.
    #[must_use]
    pub fn col(path: &str) -> Self {
        Self::Ref {
            scope: None,
            path: path.to_string(),
            typ: Type::expr(),
        }
    }

    /// A column reference in a named scope.
    #[must_use]
    pub fn scoped(scope: &str, path: &str) -> Self {
        Self::Ref {
            scope: Some(scope.to_string()),
            path: path.to_string(),
            typ: Type::expr(),
        }
    }

    /// A typed column reference in a named scope.
    #[must_use]
    pub fn scoped_typed(scope: &str, path: &str, typ: Type) -> Self {
        Self::Ref {
            scope: Some(scope.to_string()),
            path: path.to_string(),
            typ,
        }
    }

    /// Equality with another term.
    #[must_use]
    pub fn eq(self, other: Eval) -> Self {
        Self::Eq(Box::new(self), Box::new(other))
    }

    /// Inequality with another term.
    #[must_use]
    pub fn ne(self, other: Eval) -> Self {
        Self::Ne(Box::new(self), Box::new(other))
    }

    /// Strictly greater than another term.
    #[must_use]
    pub fn gt(self, other: Eval) -> Self {
        Self::Gt(Box::new(self), Box::new(other))
    }

    /// Greater than or equal to another term.
    #[must_use]
    pub fn gte(self, other: Eval) -> Self {
        Self::Gte(Box::new(self), Box::new(other))
    }

    /// Strictly less than another term.
    #[must_use]
    pub fn lt(self, other: Eval) -> Self {
        Self::Lt(Box::new(self), Box::new(other))
    }

    /// Less than or equal to another term.
    #[must_use]
    pub fn lte(self, other: Eval) -> Self {
        Self::Lte(Box::new(self), Box::new(other))
    }

    /// Conjunction (or bitwise AND) with another term.
    #[must_use]
    pub fn and(self, other: Eval) -> Self {
        Self::And(vec![self, other])
    }

    /// Disjunction (or bitwise OR) with another term.
    #[must_use]
    pub fn or(self, other: Eval) -> Self {
        Self::Or(vec![self, other])
    }

    /// Numeric sum with another term.
    #[must_use]
    pub fn add(self, other: Eval) -> Self {
        Self::Add(vec![self, other])
    }

    /// Numeric difference with another term.
    #[must_use]
    pub fn sub(self, other: Eval) -> Self {
        Self::Sub(vec![self, other])
    }

    /// Numeric product with another term.
    #[must_use]
    pub fn mul(self, other: Eval) -> Self {
        Self::Mul(vec![self, other])
    }

    /// Numeric quotient with another term.
    #[must_use]
    pub fn div(self, other: Eval) -> Self {
        Self::Div(vec![self, other])
    }

    /// Member access into this term.
    #[must_use]
    pub fn get(self, path: &str) -> Self {
        Self::Get(Box::new(self), path.to_string())
    }

    /// Sum aggregate over the bound rows.
    #[must_use]
    pub fn sum(term: Eval) -> Self {
        Self::Sum(Box::new(term))
    }

    /// Average aggregate over the bound rows.
    #[must_use]
    pub fn avg(term: Eval) -> Self {
        Self::Avg(Box::new(term))
    }

    /// Minimum aggregate over the bound rows.
    #[must_use]
    pub fn min(term: Eval) -> Self {
        Self::Min(Box::new(term))
    }

    /// Maximum aggregate over the bound rows.
    #[must_use]
    pub fn max(term: Eval) -> Self {
        Self::Max(Box::new(term))
    }

    /// Distinct-count aggregate.
    #[must_use]
    pub fn count(term: Eval) -> Self {
        Self::Count(Box::new(term))
    }

    /// Row-count aggregate.
    #[must_use]
    pub fn length(term: Eval) -> Self {
        Self::Length(Box::new(term))
    }

    /// List-collecting aggregate.
    #[must_use]
    pub fn array(term: Eval) -> Self {
        Self::ArrayAgg(Box::new(term))
    }

    /// A subquery over a selection.
    #[must_use]
    pub fn exec(selection: Selection) -> Self {
        Self::Exec(Box::new(selection))
    }

    /// The result type of this node.
    ///
    /// Untypeable nodes degrade to the opaque [`TypeKind::Expr`] type rather
    /// than failing; lowering treats those as uncastable.
    #[must_use]
    pub fn return_type(&self) -> Type {
        match self {
            Self::Literal { value, typ } => {
                typ.clone().unwrap_or_else(|| Type::from_value(value))
            }
            Self::Ref { typ, .. } => typ.clone(),
            Self::Add(_)
            | Self::Sub(_)
            | Self::Mul(_)
            | Self::Div(_)
            | Self::Modulo(_)
            | Self::Power(..)
            | Self::Log(..)
            | Self::Number(_)
            | Self::Avg(_)
            | Self::Sum(_) => Type::new(TypeKind::Double),
            Self::Eq(..) | Self::Ne(..) | Self::Gt(..) | Self::Gte(..) | Self::Lt(..)
            | Self::Lte(..) => Type::new(TypeKind::Boolean),
            Self::And(args) | Self::Or(args) | Self::Xor(args) => polymorphic_type(args),
            Self::Not(arg) => {
                if arg.return_type().kind == TypeKind::Boolean {
                    Type::new(TypeKind::Boolean)
                } else {
                    Type::new(TypeKind::Integer)
                }
            }
            Self::Min(arg) | Self::Max(arg) => arg.return_type(),
            Self::Count(_) | Self::Length(_) | Self::Size(_) => Type::new(TypeKind::Integer),
            Self::ArrayAgg(arg) => Type::array(arg.return_type()),
            Self::Get(arg, path) => arg
                .return_type()
                .inner_at(path)
                .cloned()
                .unwrap_or_else(Type::expr),
            Self::Concat(_) => Type::new(TypeKind::String),
            Self::Object(members) => Type::record(
                members
                    .iter()
                    .map(|(name, term)| (name.clone(), term.return_type()))
                    .collect(),
            ),
            Self::If { then, .. } => then.return_type(),
            Self::Switch { branches, default } => branches
                .first()
                .map_or_else(|| default.return_type(), |(_, result)| result.return_type()),
            Self::Exec(selection) => selection.projected_type(),
        }
    }

    /// Whether this node is an aggregate at its root.
    #[must_use]
    pub fn is_aggregate(&self) -> bool {
        matches!(
            self,
            Self::Sum(_)
                | Self::Avg(_)
                | Self::Min(_)
                | Self::Max(_)
                | Self::Count(_)
                | Self::Length(_)
                | Self::ArrayAgg(_)
        )
    }
}

/// Result type of the polymorphic logical operators: boolean when every
/// argument's type is boolean, the widest integer otherwise.
fn polymorphic_type(args: &[Eval]) -> Type {
    let all_boolean = args
        .iter()
        .all(|arg| arg.return_type().kind == TypeKind::Boolean);
    if all_boolean {
        Type::new(TypeKind::Boolean)
    } else {
        Type::new(TypeKind::Integer)
    }
}

/// Whether the polymorphic operators treat these arguments logically.
#[must_use]
pub fn is_logical(args: &[Eval]) -> bool {
    args.iter()
        .all(|arg| arg.return_type().kind == TypeKind::Boolean)
}
