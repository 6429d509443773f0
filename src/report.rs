//! Narrative summaries of result sets.
//!
//! The model only ever sees a bounded preview of the rows and a truncated,
//! delimited copy of the question. Any failure degrades to a fallback built
//! from the row and column counts.

use crate::db::ResultTable;
use crate::error::ErrorKind;
use crate::llm::prompts::PromptLibrary;
use crate::llm::{ChatClient, LlmError};
use regex::Regex;
use serde::Serialize;
use serde_json::Value;
use std::sync::{Arc, LazyLock};
use thiserror::Error;
use tracing::{debug, warn};

const PREVIEW_ROWS: usize = 20;
const SHORT_PREVIEW_ROWS: usize = 5;
const PREVIEW_CHAR_LIMIT: usize = 3000;
const QUESTION_CHAR_LIMIT: usize = 500;
const REASONING_CHAR_LIMIT: usize = 1000;

static DELIMITER_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)<\s*/?\s*user_input\s*>").expect("valid tag regex"));

static TABLE_REFERENCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)\b(?:FROM|JOIN)\s+("[^"]+"|[A-Za-z_][A-Za-z0-9_.$]*)"#)
        .expect("valid table regex")
});

#[derive(Debug, Error)]
enum ReportError {
    #[error(transparent)]
    Backend(#[from] LlmError),
    #[error("prompt rendering failed: {0}")]
    Prompt(#[from] minijinja::Error),
    #[error("backend returned an empty summary")]
    EmptyReply,
}

/// Inputs for one summary. Borrowed from the caller's request.
pub struct ReportRequest<'a> {
    pub question: &'a str,
    pub sql: &'a str,
    pub table: &'a ResultTable,
    pub reasoning: &'a str,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct NarrativeReport {
    pub text: String,
    /// `ReportUnavailable` when the fallback was used. Never fails a request.
    pub error: Option<ErrorKind>,
}

/// Writes the full markdown report for a result set.
///
/// Empty results produce an empty report without calling the backend.
pub async fn summarize(
    client: Result<Arc<dyn ChatClient>, LlmError>,
    prompts: &PromptLibrary,
    request: &ReportRequest<'_>,
) -> NarrativeReport {
    if request.table.is_empty() {
        return NarrativeReport::default();
    }

    let (summary, error) = match narrate(client, prompts, request).await {
        Ok(summary) => (summary, None),
        Err(e) => {
            warn!("Report generation failed: {}", e);
            (
                fallback_summary(request.table),
                Some(ErrorKind::ReportUnavailable),
            )
        }
    };

    NarrativeReport {
        text: assemble_report(request, &summary),
        error,
    }
}

async fn narrate(
    client: Result<Arc<dyn ChatClient>, LlmError>,
    prompts: &PromptLibrary,
    request: &ReportRequest<'_>,
) -> Result<String, ReportError> {
    let client = client?;
    let system = prompts.report_system()?;
    let user = prompts.report_user(
        &delimit_question(request.question),
        request.sql,
        request.table.row_count(),
        &request.table.columns.join(", "),
        &bounded_preview(request.table),
    )?;
    debug!("Report prompt is {} chars", user.chars().count());

    let reply = client.complete(&system, &user).await?;
    let summary = reply.content.trim();
    if summary.is_empty() {
        return Err(ReportError::EmptyReply);
    }
    Ok(summary.to_string())
}

/// Question with delimiter tags removed, capped in length.
///
/// Removal repeats until no tag is left, since dropping one tag can join
/// its neighbours into a new one.
pub fn delimit_question(question: &str) -> String {
    let mut cleaned = question.to_string();
    while DELIMITER_TAG.is_match(&cleaned) {
        cleaned = DELIMITER_TAG.replace_all(&cleaned, "").into_owned();
    }
    truncate_chars(&cleaned, QUESTION_CHAR_LIMIT).to_string()
}

/// Up to 20 rows as aligned text; 5 rows if that is too long; then cut.
pub fn bounded_preview(table: &ResultTable) -> String {
    let mut preview = render_rows(table, PREVIEW_ROWS);
    if preview.chars().count() > PREVIEW_CHAR_LIMIT {
        preview = render_rows(table, SHORT_PREVIEW_ROWS);
    }
    truncate_chars(&preview, PREVIEW_CHAR_LIMIT).to_string()
}

fn cell_text(value: &Value) -> &str {
    match value {
        Value::String(s) => s.as_str(),
        Value::Null => "NULL",
        _ => "?",
    }
}

fn render_rows(table: &ResultTable, limit: usize) -> String {
    let rows = &table.rows[..table.rows.len().min(limit)];

    let mut widths: Vec<usize> = table.columns.iter().map(|c| c.chars().count()).collect();
    for row in rows {
        for (width, value) in widths.iter_mut().zip(row) {
            *width = (*width).max(cell_text(value).chars().count());
        }
    }

    let line = |cells: Vec<&str>| -> String {
        cells
            .iter()
            .zip(&widths)
            .map(|(cell, width)| format!("{:>width$}", cell, width = width))
            .collect::<Vec<_>>()
            .join("  ")
    };

    let mut lines = vec![line(table.columns.iter().map(String::as_str).collect())];
    lines.extend(rows.iter().map(|row| line(row.iter().map(cell_text).collect())));
    lines.join("\n")
}

/// Identifiers after FROM/JOIN, de-duplicated in order of appearance.
pub fn referenced_tables(sql: &str) -> Vec<String> {
    let mut tables: Vec<String> = Vec::new();
    for caps in TABLE_REFERENCE.captures_iter(sql) {
        let name = caps[1].trim_matches('"').to_string();
        if !tables.contains(&name) {
            tables.push(name);
        }
    }
    tables
}

fn fallback_summary(table: &ResultTable) -> String {
    format!(
        "_(Automatic summary unavailable.)_ The query returned {} rows across {} columns.",
        table.row_count(),
        table.columns.len()
    )
}

fn assemble_report(request: &ReportRequest<'_>, summary: &str) -> String {
    let tables = referenced_tables(request.sql);
    let mut parts = vec![
        "## Query analysis\n".to_string(),
        format!(
            "- **Tables used**: {}",
            if tables.is_empty() {
                "(could not determine)".to_string()
            } else {
                tables.join(", ")
            }
        ),
        format!("- **Rows returned**: {}", request.table.row_count()),
        format!("- **Result columns**: {}\n", request.table.columns.join(", ")),
    ];

    if !request.reasoning.is_empty() {
        let mut reasoning = truncate_chars(request.reasoning, REASONING_CHAR_LIMIT).to_string();
        if reasoning.len() < request.reasoning.len() {
            reasoning.push_str("...");
        }
        parts.push(format!(
            "<details><summary>Model reasoning (expand)</summary>\n\n{}\n\n</details>\n",
            reasoning
        ));
    }

    parts.push("## Summary\n".to_string());
    parts.push(summary.to_string());
    parts.join("\n")
}

fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
