//! Runs validated statements under a row cap and a deadline.

use crate::db::db_pool::DbPool;
use crate::error::{status_of, ErrorKind};
use crate::sql::lexer;
use crate::sql::{validate, Rejection, ValidatedSql};
use duckdb::arrow::array::Array;
use duckdb::arrow::error::ArrowError;
use duckdb::arrow::util::display::array_value_to_string;
use duckdb::{Connection, InterruptHandle};
use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Alias of the outer query that caps the result size.
const BOUNDED_ALIAS: &str = "bounded_result";

const INTERRUPT_RETRY: Duration = Duration::from_millis(100);
const INTERRUPT_ATTEMPTS: u32 = 50;

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("statement rejected: {0}")]
    Unsafe(#[from] Rejection),
    #[error("statement has unbalanced parentheses")]
    UnbalancedParens,
    #[error("no database connection available: {0}")]
    Pool(#[from] r2d2::Error),
    #[error("database error: {0}")]
    Database(#[from] duckdb::Error),
    #[error("could not render result value: {0}")]
    Render(#[from] ArrowError),
    #[error("execution exceeded {0:?}")]
    Timeout(Duration),
    #[error("execution worker failed: {0}")]
    Worker(String),
}

impl ExecError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ExecError::Unsafe(_) | ExecError::UnbalancedParens => ErrorKind::UnsafeStatement,
            _ => ErrorKind::ExecutionFailed,
        }
    }
}

/// Snapshot of a result set: column labels plus rows in order.
///
/// Cells are JSON `null` or the database's display string for the value.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ResultTable {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

impl ResultTable {
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ExecutionResult {
    pub table: ResultTable,
    pub error: Option<ErrorKind>,
}

impl ExecutionResult {
    pub fn success(table: ResultTable) -> Self {
        Self { table, error: None }
    }

    pub fn failure(error: ErrorKind) -> Self {
        Self {
            table: ResultTable::default(),
            error: Some(error),
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    pub fn status(&self) -> &'static str {
        status_of(self.error)
    }

    pub fn message(&self) -> String {
        match self.error {
            Some(kind) => kind.to_string(),
            None => format!("{} rows returned.", self.table.row_count()),
        }
    }
}

/// Wraps a validated statement so at most `cap` rows come back.
///
/// The inner text is comment-free, so a trailing line comment cannot
/// swallow the closing parenthesis. Parentheses must balance outside
/// literals or the statement could close the wrapper early.
pub fn bounding_query(validated: &ValidatedSql, cap: usize) -> Result<String, ExecError> {
    let tokens = lexer::tokenize(validated.as_str()).map_err(Rejection::Malformed)?;
    if !lexer::parens_balanced(&tokens) {
        return Err(ExecError::UnbalancedParens);
    }
    Ok(format!(
        "SELECT * FROM (\n{}\n) AS {} LIMIT {}",
        validated, BOUNDED_ALIAS, cap
    ))
}

pub struct BoundedExecutor {
    pool: DbPool,
    max_rows: usize,
    timeout: Duration,
}

impl BoundedExecutor {
    pub fn new(pool: DbPool, max_rows: usize, timeout: Duration) -> Self {
        Self {
            pool,
            max_rows,
            timeout,
        }
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    /// Validates, bounds and runs `sql`. Details of any failure are logged;
    /// the result only carries the classification.
    pub async fn execute(&self, sql: &str) -> ExecutionResult {
        let started = Instant::now();
        match self.run(sql).await {
            Ok(table) => {
                info!(
                    "Query returned {} rows in {}ms",
                    table.row_count(),
                    started.elapsed().as_millis()
                );
                ExecutionResult::success(table)
            }
            Err(e) => {
                match e.kind() {
                    ErrorKind::UnsafeStatement => warn!("Refused to execute statement: {}", e),
                    _ => error!("Query execution failed: {}", e),
                }
                ExecutionResult::failure(e.kind())
            }
        }
    }

    pub async fn run(&self, sql: &str) -> Result<ResultTable, ExecError> {
        // Re-checked here whatever the caller already did.
        let validated = validate(sql)?;
        let query = bounding_query(&validated, self.max_rows)?;
        debug!("Executing bounded query: {}", query);

        let pool = self.pool.clone();
        let cancelled = Arc::new(AtomicBool::new(false));
        let worker_cancelled = Arc::clone(&cancelled);
        let (handle_tx, handle_rx) = oneshot::channel::<Arc<InterruptHandle>>();

        let mut worker = tokio::task::spawn_blocking(move || -> Result<ResultTable, ExecError> {
            let conn = pool.get()?;
            let _ = handle_tx.send(conn.interrupt_handle());
            if worker_cancelled.load(Ordering::SeqCst) {
                return Err(ExecError::Worker("cancelled before start".to_string()));
            }
            read_table(&conn, &query)
        });

        match tokio::time::timeout(self.timeout, &mut worker).await {
            Ok(joined) => joined.map_err(|e| ExecError::Worker(e.to_string()))?,
            Err(_) => {
                cancelled.store(true, Ordering::SeqCst);
                interrupt_until_stopped(&mut worker, handle_rx).await;
                Err(ExecError::Timeout(self.timeout))
            }
        }
    }
}

/// Interrupts the worker's connection until the worker finishes.
///
/// DuckDB clears a pending interrupt when a statement starts, so an
/// interrupt landing between the cancellation check and the query start
/// is lost; it is repeated until the worker has actually stopped.
async fn interrupt_until_stopped(
    worker: &mut JoinHandle<Result<ResultTable, ExecError>>,
    handle_rx: oneshot::Receiver<Arc<InterruptHandle>>,
) {
    let mut handle: Option<Arc<InterruptHandle>> = None;
    for _ in 0..INTERRUPT_ATTEMPTS {
        if handle.is_none() {
            handle = handle_rx.try_recv().ok();
        }
        if let Some(handle) = &handle {
            handle.interrupt();
        }
        if tokio::time::timeout(INTERRUPT_RETRY, &mut *worker).await.is_ok() {
            return;
        }
    }
    warn!(
        "Query worker still running after {} interrupts, leaving it detached",
        INTERRUPT_ATTEMPTS
    );
}

pub(crate) fn read_table(conn: &Connection, query: &str) -> Result<ResultTable, ExecError> {
    let mut stmt = conn.prepare(query)?;
    let arrow = stmt.query_arrow([])?;

    let schema = arrow.get_schema();
    let columns = schema
        .fields()
        .iter()
        .map(|field| field.name().clone())
        .collect::<Vec<String>>();

    let mut rows = Vec::new();
    for batch in arrow {
        for row in 0..batch.num_rows() {
            let mut record = Vec::with_capacity(batch.num_columns());
            for column in batch.columns() {
                if column.is_null(row) {
                    record.push(Value::Null);
                } else {
                    record.push(Value::String(array_value_to_string(column.as_ref(), row)?));
                }
            }
            rows.push(record);
        }
    }

    Ok(ResultTable { columns, rows })
}
