//! Schema metadata.
//!
//! A [`SchemaReflector`] answers catalog queries (tables, columns, primary and
//! foreign keys) from shadow tables kept in the session's TEMP schema.

mod reflector;
mod types;

pub use reflector::{SchemaReflector, DEFAULT_NAMESPACE};
pub use types::{
    classify_type, ConstraintType, DataTypeMean, MetaTable, SchemaRow, ShadowColumnRow,
    ShadowConstraintRow, TableRow, TypeClass,
};
