use crate::db::db_pool::DbPool;
use crate::db::executor::{read_table, ExecError, ResultTable};
use duckdb::Connection;
use serde_json::Value;
use tracing::{info, warn};

const SAMPLE_ROWS: usize = 3;

/// Markdown description of the queryable tables, built once at startup and
/// placed in every generation prompt.
#[derive(Debug, Clone, Default)]
pub struct SchemaContext {
    text: String,
}

impl SchemaContext {
    pub fn from_text(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }

    /// Describes `tables`, or every table in the main schema when empty.
    ///
    /// A table that cannot be described gets an inline note instead of
    /// failing the whole load.
    pub async fn load(pool: &DbPool, tables: &[String]) -> Result<Self, ExecError> {
        let pool = pool.clone();
        let requested = tables.to_vec();

        let text = tokio::task::spawn_blocking(move || -> Result<String, ExecError> {
            let conn = pool.get()?;
            let tables = if requested.is_empty() {
                list_tables(&conn)?
            } else {
                requested
            };

            let mut metadata = String::from("# DATABASE SCHEMA\n\n");
            if tables.is_empty() {
                metadata.push_str("No tables found in this database.\n");
                return Ok(metadata);
            }

            for table in &tables {
                metadata.push_str(&describe_table(&conn, table));
            }
            info!("Described {} tables for the generation prompt", tables.len());
            Ok(metadata)
        })
        .await
        .map_err(|e| ExecError::Worker(e.to_string()))??;

        Ok(Self { text })
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }
}

fn list_tables(conn: &Connection) -> Result<Vec<String>, ExecError> {
    let mut stmt = conn.prepare(
        "SELECT table_name FROM information_schema.tables \
         WHERE table_schema = 'main' ORDER BY table_name",
    )?;
    let tables = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .filter_map(Result::ok)
        .collect();
    Ok(tables)
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn describe_table(conn: &Connection, table: &str) -> String {
    let mut section = format!("### Table: {}\n\n", table);

    let columns = match table_columns(conn, table) {
        Ok(columns) if !columns.is_empty() => columns,
        Ok(_) => {
            section.push_str("Table has no columns.\n\n");
            return section;
        }
        Err(e) => {
            warn!("Could not describe table {}: {}", table, e);
            section.push_str("Could not retrieve column information.\n\n");
            return section;
        }
    };

    section.push_str("| Column Name | Data Type | Nullable |\n");
    section.push_str("|------------|-----------|----------|\n");
    for (name, data_type, nullable) in columns {
        section.push_str(&format!(
            "| {} | {} | {} |\n",
            name,
            data_type,
            if nullable { "YES" } else { "NO" }
        ));
    }
    section.push('\n');

    section.push_str("#### Sample Data:\n\n");
    let sample_query = format!("SELECT * FROM {} LIMIT {}", quote_ident(table), SAMPLE_ROWS);
    match read_table(conn, &sample_query) {
        Ok(sample) => section.push_str(&markdown_table(&sample)),
        Err(e) => {
            warn!("Could not sample table {}: {}", table, e);
            section.push_str("Could not retrieve sample data.\n");
        }
    }
    section.push('\n');
    section
}

fn table_columns(conn: &Connection, table: &str) -> Result<Vec<(String, String, bool)>, ExecError> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", quote_ident(table)))?;
    let columns = stmt
        .query_map([], |row| {
            Ok((
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                !row.get::<_, bool>(3)?,
            ))
        })?
        .filter_map(Result::ok)
        .collect();
    Ok(columns)
}

fn markdown_table(table: &ResultTable) -> String {
    let mut out = format!("| {} |\n", table.columns.join(" | "));
    out.push_str(&format!("|{}\n", " --- |".repeat(table.columns.len())));
    for row in &table.rows {
        let cells: Vec<&str> = row
            .iter()
            .map(|v| match v {
                Value::String(s) => s.as_str(),
                _ => "NULL",
            })
            .collect();
        out.push_str(&format!("| {} |\n", cells.join(" | ")));
    }
    out
}
