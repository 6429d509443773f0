pub mod db_pool;
pub mod executor;
pub mod schema;

pub use db_pool::{build_pool, DbPool, DuckDBConnectionManager};
pub use executor::{BoundedExecutor, ExecutionResult, ResultTable};
pub use schema::SchemaContext;
