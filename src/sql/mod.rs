pub mod extract;
pub mod lexer;
pub mod safety;

pub use extract::{extract_sql, statement_region};
pub use safety::{is_safe, validate, Rejection, ValidatedSql};
