//! Normalized field definitions.
//!
//! Schemas are declared at runtime, so every accepted field shape — the
//! `"unsigned(8)"` shorthand or a full record — is parsed eagerly into one
//! normalized [`Field`] at registration time.

use std::collections::BTreeMap;

use crate::error::{Error, Result};
use crate::eval::Eval;
use crate::types::TypeKind;
use crate::value::{Object, Value};

/// A normalized column definition.
#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    /// The semantic type of the column.
    pub kind: TypeKind,
    /// Maximum length for string and binary types.
    pub length: Option<u32>,
    /// Total digits for decimal types.
    pub precision: Option<u32>,
    /// Fractional digits for decimal types.
    pub scale: Option<u32>,
    /// Whether the column accepts NULL.
    pub nullable: bool,
    /// Default value seeded by `create`.
    pub initial: Option<Value>,
    /// Computing expression for derived columns.
    pub expr: Option<Eval>,
    /// Former names this column was known under, newest first.
    pub legacy: Vec<String>,
    /// Deprecated columns stay addressable for migration but never receive
    /// defaults on `create`.
    pub deprecated: bool,
    /// Member fields of a json object column.
    pub members: BTreeMap<String, Field>,
    /// Whether a json column holds an array.
    pub array: bool,
    /// Element field of a json array column.
    pub element: Option<Box<Field>>,
}

impl Field {
    /// Creates a field of the given type with type-appropriate defaults.
    #[must_use]
    pub fn new(kind: TypeKind) -> Self {
        let mut field = Self {
            kind,
            length: None,
            precision: None,
            scale: None,
            nullable: false,
            initial: None,
            expr: None,
            legacy: Vec::new(),
            deprecated: false,
            members: BTreeMap::new(),
            array: false,
            element: None,
        };
        field.initial = field.default_initial();
        field
    }

    /// Parses the `TYPE`, `TYPE(arg)` or `TYPE(precision,scale)` shorthand.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidField`] when the shorthand does not match the
    /// grammar or names an unknown type.
    pub fn parse(shorthand: &str) -> Result<Self> {
        let shorthand = shorthand.trim();
        let (name, args) = match shorthand.split_once('(') {
            Some((name, rest)) => {
                let inner = rest
                    .strip_suffix(')')
                    .ok_or_else(|| Error::invalid_field(shorthand))?;
                (name.trim(), Some(inner))
            }
            None => (shorthand, None),
        };

        let kind = type_kind_from_name(name).ok_or_else(|| Error::invalid_field(shorthand))?;
        let mut field = Self::new(kind);

        let Some(args) = args else {
            return Ok(field);
        };
        let parts: Vec<&str> = args.split(',').map(str::trim).collect();
        let parse_arg = |part: &str| -> Result<u32> {
            part.parse().map_err(|_| Error::invalid_field(shorthand))
        };
        match (kind, parts.as_slice()) {
            (TypeKind::Decimal, [precision]) => {
                field.precision = Some(parse_arg(precision)?);
            }
            (TypeKind::Decimal, [precision, scale]) => {
                field.precision = Some(parse_arg(precision)?);
                field.scale = Some(parse_arg(scale)?);
            }
            (_, [length]) => {
                // Length is meaningless on temporal and boolean columns.
                if !kind.is_temporal() && kind != TypeKind::Boolean {
                    field.length = Some(parse_arg(length)?);
                }
            }
            _ => return Err(Error::invalid_field(shorthand)),
        }
        Ok(field)
    }

    /// Marks the field nullable and clears its implicit default.
    #[must_use]
    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self.initial = None;
        self
    }

    /// Sets the default value seeded by `create`.
    #[must_use]
    pub fn initial(mut self, value: impl Into<Value>) -> Self {
        self.initial = Some(value.into());
        self
    }

    /// Records former names of this column for migration resolution.
    #[must_use]
    pub fn legacy(mut self, names: &[&str]) -> Self {
        self.legacy = names.iter().map(ToString::to_string).collect();
        self
    }

    /// Marks the field deprecated.
    #[must_use]
    pub fn deprecated(mut self) -> Self {
        self.deprecated = true;
        self
    }

    /// Sets the computing expression for a derived column.
    #[must_use]
    pub fn computed(mut self, expr: Eval) -> Self {
        self.expr = Some(expr);
        self
    }

    /// Declares typed members for a json object column.
    #[must_use]
    pub fn members(mut self, members: BTreeMap<String, Field>) -> Self {
        self.members = members;
        self
    }

    /// Declares a json column as an array of the given element field.
    #[must_use]
    pub fn array_of(mut self, element: Field) -> Self {
        self.array = true;
        self.element = Some(Box::new(element));
        self.initial = Some(Value::List(Vec::new()));
        self
    }

    /// The implicit default for this field's type, or `None` when nullable.
    #[must_use]
    pub fn default_initial(&self) -> Option<Value> {
        if self.nullable {
            return None;
        }
        match self.kind {
            kind if kind.is_numeric() && kind != TypeKind::Primary => Some(Value::Int(0)),
            TypeKind::Char | TypeKind::String | TypeKind::Text => {
                Some(Value::String(String::new()))
            }
            TypeKind::List => Some(Value::List(Vec::new())),
            TypeKind::Json => {
                if self.array {
                    Some(Value::List(Vec::new()))
                } else {
                    Some(Value::Object(Object::new()))
                }
            }
            _ => None,
        }
    }
}

fn type_kind_from_name(name: &str) -> Option<TypeKind> {
    Some(match name {
        "integer" => TypeKind::Integer,
        "unsigned" => TypeKind::Unsigned,
        "float" => TypeKind::Float,
        "double" => TypeKind::Double,
        "decimal" => TypeKind::Decimal,
        "char" => TypeKind::Char,
        "string" => TypeKind::String,
        "text" => TypeKind::Text,
        "boolean" => TypeKind::Boolean,
        "timestamp" => TypeKind::Timestamp,
        "date" => TypeKind::Date,
        "time" => TypeKind::Time,
        "list" => TypeKind::List,
        "json" => TypeKind::Json,
        "primary" => TypeKind::Primary,
        "binary" => TypeKind::Binary,
        "expr" => TypeKind::Expr,
        _ => return None,
    })
}
