//! # strata-core
//!
//! A backend-agnostic database abstraction layer: a typed query and
//! expression IR with a relational algebra over it, compiled by backend
//! drivers into their native dialects.
//!
//! The crate provides:
//! - A semantic type system bridging field declarations and expressions
//! - A runtime model registry with dotted-path formatting and migrations
//! - The [`query::Query`] filter AST and [`eval::Eval`] expression tree
//! - The immutable [`selection::Selection`] algebra
//! - A relation resolver covering includes, predicates and write cascades
//! - The portable evaluator drivers fall back to
//! - The narrow [`driver::Driver`] contract every backend implements
//!
//! ## Declaring models
//!
//! ```rust
//! use strata_core::field::Field;
//! use strata_core::model::{ModelConfig, Registry};
//!
//! let mut registry = Registry::new();
//! registry
//!     .extend(
//!         "user",
//!         [
//!             ("id".to_string(), Field::parse("unsigned").unwrap()),
//!             ("name".to_string(), Field::parse("string(64)").unwrap()),
//!         ],
//!         ModelConfig::auto_primary("id"),
//!     )
//!     .unwrap();
//! ```
//!
//! ## Querying
//!
//! ```rust
//! use serde_json::json;
//! use strata_core::query::Query;
//! use strata_core::selection::Selection;
//!
//! let query = Query::from_json(&json!({
//!     "age": {"$gte": 18},
//!     "$or": [{"name": {"$regex": "^f"}}, {"admin": true}],
//! }))
//! .unwrap();
//! let selection = Selection::of("user").filter(query).limit(10);
//! # let _ = selection;
//! ```

pub mod database;
pub mod driver;
pub mod error;
pub mod eval;
pub mod evaluator;
pub mod field;
pub mod model;
pub mod query;
pub mod relation;
pub mod resolver;
pub mod selection;
pub mod types;
pub mod value;

pub use database::Database;
pub use driver::{Converter, Converters, Driver, Stats, TableStats};
pub use error::{Error, Result};
pub use eval::Eval;
pub use field::Field;
pub use model::{Model, ModelConfig, Registry};
pub use query::{FieldOp, Pattern, Query};
pub use relation::{Relation, RelationKind};
pub use resolver::Include;
pub use selection::{Direction, Selection, SelectionKind};
pub use types::{Type, TypeKind};
pub use value::{Object, Value};
