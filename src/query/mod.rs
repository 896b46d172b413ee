//! Query execution for the gateway.
//!
//! This module binds parameters, gates and runs statements, normalizes
//! metadata results and keeps secrets out of query logs.

mod executor;
mod params;
mod redact;
mod shape;

pub use executor::{DatabaseInfo, QueryExecutor};
pub use params::QueryParams;
pub use redact::{redact_sql, truncate};
pub use shape::shape_result;
