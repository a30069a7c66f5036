//! Physical type mapping between logical values and SQLite storage classes.

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use sqlx::Row;
use sqlx::sqlite::SqliteRow;

use strata_core::driver::{Converter, Converters};
use strata_core::error::{Error, Result};
use strata_core::field::Field;
use strata_core::model::Model;
use strata_core::types::{Type, TypeKind};
use strata_core::value::{Object, Value};

/// The SQLite column type for a field declaration.
#[must_use]
pub fn column_type(field: &Field) -> &'static str {
    match field.kind {
        TypeKind::Integer
        | TypeKind::Unsigned
        | TypeKind::Primary
        | TypeKind::Boolean => "INTEGER",
        TypeKind::Float | TypeKind::Double => "REAL",
        TypeKind::Binary => "BLOB",
        _ => "TEXT",
    }
}

/// The converter table of the SQLite driver.
///
/// Booleans store as integers, temporal values as ISO text with `time`
/// descending from `string`, decimals as text, json and lists as serialized
/// text.
#[must_use]
pub fn converters() -> Converters {
    let mut table = Converters::new();
    table.register(
        TypeKind::Boolean,
        Converter::new(
            |value| match value {
                Value::Bool(b) => Value::Int(i64::from(b)),
                other => other,
            },
            |value| match value {
                Value::Int(n) => Value::Bool(n != 0),
                other => other,
            },
        ),
    );
    table.register(
        TypeKind::Unsigned,
        Converter::new(
            |value| match value {
                Value::Uint(n) => Value::Int(i64::try_from(n).unwrap_or(i64::MAX)),
                other => other,
            },
            |value| value,
        ),
    );
    table.register(
        TypeKind::Timestamp,
        Converter::new(
            |value| match value {
                Value::DateTime(dt) => {
                    Value::String(dt.format("%Y-%m-%d %H:%M:%S%.f").to_string())
                }
                other => other,
            },
            |value| match value {
                Value::String(text) => NaiveDateTime::parse_from_str(&text, "%Y-%m-%d %H:%M:%S%.f")
                    .map_or(Value::String(text), Value::DateTime),
                other => other,
            },
        ),
    );
    table.register(
        TypeKind::Date,
        Converter::new(
            |value| match value {
                Value::Date(d) => Value::String(d.format("%Y-%m-%d").to_string()),
                other => other,
            },
            |value| match value {
                Value::String(text) => NaiveDate::parse_from_str(&text, "%Y-%m-%d")
                    .map_or(Value::String(text), Value::Date),
                other => other,
            },
        ),
    );
    table.register(
        TypeKind::Time,
        Converter::new(
            |value| match value {
                Value::Time(t) => Value::String(t.format("%H:%M:%S%.f").to_string()),
                other => other,
            },
            |value| match value {
                Value::String(text) => NaiveTime::parse_from_str(&text, "%H:%M:%S%.f")
                    .map_or(Value::String(text), Value::Time),
                other => other,
            },
        ),
    );
    table.register(
        TypeKind::Json,
        Converter::new(json_dump, json_load),
    );
    table.register(
        TypeKind::List,
        Converter::new(json_dump, json_load),
    );
    // SQLite has no decimal type; decimals ride on text.
    table.ancestor(TypeKind::Decimal, TypeKind::String);
    table
}

fn json_dump(value: Value) -> Value {
    match value {
        Value::Object(_) | Value::List(_) => Value::String(value.to_json().to_string()),
        other => other,
    }
}

fn json_load(value: Value) -> Value {
    match value {
        Value::String(text) => serde_json::from_str::<serde_json::Value>(&text)
            .map_or(Value::String(text), |json| Value::from_json(&json)),
        other => other,
    }
}

/// Whether a field occupies a physical column.
#[must_use]
pub fn is_stored(field: &Field) -> bool {
    field.expr.is_none() && field.kind != TypeKind::Expr
}

/// Decodes one fetched row into a logical record, regrouping dotted column
/// names into nested values.
///
/// # Errors
///
/// Fails when a column's storage class does not match its declaration.
pub fn decode_row(model: &Model, converters: &Converters, row: &SqliteRow) -> Result<Value> {
    let mut record = Value::Object(Object::new());
    for (name, field) in &model.fields {
        if !is_stored(field) {
            continue;
        }
        let physical = match column_type(field) {
            "INTEGER" => read::<i64>(row, name)?.map(Value::Int),
            "REAL" => read::<f64>(row, name)?.map(Value::Float),
            "BLOB" => read::<Vec<u8>>(row, name)?.map(Value::Bytes),
            _ => read::<String>(row, name)?.map(Value::String),
        };
        let Some(physical) = physical else {
            if !field.nullable {
                continue;
            }
            record.set_path(name, Value::Null);
            continue;
        };
        let logical = converters.load_field(&Type::from_field(field), physical);
        record.set_path(name, logical);
    }
    Ok(record)
}

fn read<'r, T>(row: &'r SqliteRow, column: &str) -> Result<Option<T>>
where
    T: sqlx::Decode<'r, sqlx::Sqlite> + sqlx::Type<sqlx::Sqlite>,
{
    match row.try_get::<Option<T>, _>(column) {
        Ok(value) => Ok(value),
        Err(sqlx::Error::ColumnNotFound(_)) => Ok(None),
        Err(error) => Err(Error::driver(error)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_round_trip() {
        let value = strata_core::object! { "a" => 1_i64, "b" => vec!["x"] };
        let dumped = json_dump(value.clone());
        assert!(matches!(dumped, Value::String(_)));
        assert_eq!(json_load(dumped), value);
    }

    #[test]
    fn test_time_converter_keeps_epoch_anchoring() {
        let table = converters();
        let time = NaiveTime::from_hms_opt(9, 30, 0).unwrap();
        let dumped = table
            .resolve(TypeKind::Time)
            .map(|c| (c.dump)(Value::Time(time)))
            .unwrap();
        assert_eq!(dumped, Value::String("09:30:00".to_string()));
        let loaded = table
            .resolve(TypeKind::Time)
            .map(|c| (c.load)(dumped))
            .unwrap();
        assert_eq!(loaded, Value::Time(time));
    }

    #[test]
    fn test_decimal_rides_on_text() {
        let table = converters();
        assert!(table.resolve(TypeKind::Decimal).is_none());
        let mut with_string = table;
        with_string.register(
            TypeKind::String,
            Converter::new(|v| v, |v| v),
        );
        assert!(with_string.resolve(TypeKind::Decimal).is_some());
    }

    #[test]
    fn test_column_types() {
        assert_eq!(column_type(&Field::parse("unsigned").unwrap()), "INTEGER");
        assert_eq!(column_type(&Field::parse("double").unwrap()), "REAL");
        assert_eq!(column_type(&Field::parse("json").unwrap()), "TEXT");
        assert_eq!(column_type(&Field::parse("binary").unwrap()), "BLOB");
    }
}
