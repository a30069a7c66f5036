//! The semantic type system.
//!
//! Field declarations and expression nodes share one type vocabulary so that
//! grouping, sorting and casting can be dispatched without inspecting runtime
//! values. Json-typed columns carry their substructure in [`Inner`].

use std::collections::BTreeMap;

use crate::field::Field;
use crate::value::Value;

/// Semantic type tags shared by field definitions and expressions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TypeKind {
    /// Signed integer.
    Integer,
    /// Unsigned integer.
    Unsigned,
    /// Single precision floating point.
    Float,
    /// Double precision floating point.
    Double,
    /// Fixed precision decimal.
    Decimal,
    /// Fixed length character string.
    Char,
    /// Variable length string.
    String,
    /// Unbounded text.
    Text,
    /// Boolean.
    Boolean,
    /// Date and time.
    Timestamp,
    /// Calendar date.
    Date,
    /// Time of day.
    Time,
    /// List of scalar values.
    List,
    /// Nested json structure.
    Json,
    /// Autoincrement primary key.
    Primary,
    /// Binary blob.
    Binary,
    /// Opaque expression result.
    Expr,
}

impl TypeKind {
    /// Whether values of this type are numeric.
    #[must_use]
    pub fn is_numeric(self) -> bool {
        matches!(
            self,
            Self::Integer | Self::Unsigned | Self::Float | Self::Double | Self::Decimal | Self::Primary
        )
    }

    /// Whether values of this type are temporal.
    #[must_use]
    pub fn is_temporal(self) -> bool {
        matches!(self, Self::Timestamp | Self::Date | Self::Time)
    }
}

/// Substructure of a [`Type`].
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Inner {
    /// No substructure.
    #[default]
    None,
    /// Element type of a homogeneous array.
    Element(Box<Type>),
    /// Member types of a json object.
    Record(BTreeMap<String, Type>),
}

/// The evaluated type of a field or expression.
#[derive(Debug, Clone, PartialEq)]
pub struct Type {
    /// The type tag.
    pub kind: TypeKind,
    /// Json substructure, if any.
    pub inner: Inner,
}

impl Type {
    /// A plain type with no substructure.
    #[must_use]
    pub fn new(kind: TypeKind) -> Self {
        Self {
            kind,
            inner: Inner::None,
        }
    }

    /// The opaque expression type.
    #[must_use]
    pub fn expr() -> Self {
        Self::new(TypeKind::Expr)
    }

    /// A json array type with the given element type.
    #[must_use]
    pub fn array(element: Type) -> Self {
        Self {
            kind: TypeKind::Json,
            inner: Inner::Element(Box::new(element)),
        }
    }

    /// A json object type with the given member types.
    #[must_use]
    pub fn record(members: BTreeMap<String, Type>) -> Self {
        Self {
            kind: TypeKind::Json,
            inner: Inner::Record(members),
        }
    }

    /// Derives the evaluated type from a field declaration.
    ///
    /// Only json fields carry substructure: declared members produce a
    /// record type, an array flag produces an element type.
    #[must_use]
    pub fn from_field(field: &Field) -> Self {
        if field.kind != TypeKind::Json {
            return Self::new(field.kind);
        }
        if !field.members.is_empty() {
            let members = field
                .members
                .iter()
                .map(|(name, member)| (name.clone(), Self::from_field(member)))
                .collect();
            return Self::record(members);
        }
        if field.array {
            let element = field
                .element
                .as_deref()
                .map_or_else(Self::expr, Self::from_field);
            return Self::array(element);
        }
        Self::new(TypeKind::Json)
    }

    /// Infers a concrete type from a runtime value shape.
    ///
    /// Arrays infer a homogeneous element type from their first element and
    /// stay untyped when empty.
    #[must_use]
    pub fn from_value(value: &Value) -> Self {
        match value {
            Value::Null | Value::Expr(_) => Self::expr(),
            Value::Bool(_) => Self::new(TypeKind::Boolean),
            Value::Int(_) => Self::new(TypeKind::Integer),
            Value::Uint(_) => Self::new(TypeKind::Unsigned),
            Value::Float(_) => Self::new(TypeKind::Double),
            Value::String(_) => Self::new(TypeKind::String),
            Value::Bytes(_) => Self::new(TypeKind::Binary),
            Value::Date(_) => Self::new(TypeKind::Date),
            Value::Time(_) => Self::new(TypeKind::Time),
            Value::DateTime(_) => Self::new(TypeKind::Timestamp),
            Value::List(items) => {
                let element = items.first().map_or_else(Self::expr, Self::from_value);
                Self::array(element)
            }
            Value::Object(map) => {
                let members = map
                    .iter()
                    .map(|(name, member)| (name.clone(), Self::from_value(member)))
                    .collect();
                Self::record(members)
            }
        }
    }

    /// The type at a dotted path inside this type.
    ///
    /// Record members match by segment; a record key that itself contains
    /// dots matches as a prefix, with the matched part stripped from the
    /// remaining path. Array types answer any key with their element type.
    #[must_use]
    pub fn inner_at(&self, path: &str) -> Option<&Type> {
        if path.is_empty() {
            return Some(self);
        }
        match &self.inner {
            Inner::Record(members) => {
                if let Some(member) = members.get(path) {
                    return Some(member);
                }
                for (key, member) in members {
                    if let Some(rest) = path.strip_prefix(key.as_str()) {
                        if let Some(rest) = rest.strip_prefix('.') {
                            return member.inner_at(rest);
                        }
                    }
                }
                None
            }
            Inner::Element(element) => element.inner_at(path).or(Some(element)),
            Inner::None => None,
        }
    }

    /// Recursively re-coerces a value through this type tree, applying
    /// `visit` at every scalar position. Drivers route their load and dump
    /// converters through this.
    pub fn transform(&self, value: Value, visit: &dyn Fn(Value, &Type) -> Value) -> Value {
        match (&self.inner, value) {
            (Inner::Record(members), Value::Object(map)) => {
                let map = map
                    .into_iter()
                    .map(|(key, member)| {
                        let transformed = match members.get(&key) {
                            Some(ty) => ty.transform(member, visit),
                            None => member,
                        };
                        (key, transformed)
                    })
                    .collect();
                visit(Value::Object(map), self)
            }
            (Inner::Element(element), Value::List(items)) => {
                let items = items
                    .into_iter()
                    .map(|item| element.transform(item, visit))
                    .collect();
                visit(Value::List(items), self)
            }
            (_, value) => visit(value, self),
        }
    }
}

impl From<TypeKind> for Type {
    fn from(kind: TypeKind) -> Self {
        Self::new(kind)
    }
}
