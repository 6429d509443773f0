//! Turns free-form model output into a single candidate statement.

use regex::Regex;
use std::sync::LazyLock;
use tracing::debug;

/// A fenced block: optional language tag on the opening line, then content.
static FENCED_BLOCK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)```(?:([A-Za-z0-9_+-]+)?[ \t]*\r?\n)?(.*?)```").expect("valid fence regex")
});

static STATEMENT_START: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(?:WITH|SELECT)\b").expect("valid keyword regex"));

/// Extracts a SQL candidate, or `None` when no statement keyword is present.
pub fn extract_sql(raw: &str) -> Option<String> {
    let sql = statement_region(raw);

    // Drop conversational preamble before the statement.
    let start = STATEMENT_START.find(sql)?.start();
    let sql = sql[start..].trim_end_matches(|c: char| c == ';' || c.is_whitespace());

    debug!("Extracted SQL candidate: {}", sql);
    Some(sql.to_string())
}

/// The part of `raw` a statement is looked for in: the chosen fenced block
/// (or the whole text), trimmed, minus one trailing terminator.
///
/// Callers use it to classify output that had no read-statement opener.
pub fn statement_region(raw: &str) -> &str {
    let sql = select_fenced_block(raw).unwrap_or(raw).trim();
    sql.strip_suffix(';').unwrap_or(sql).trim()
}

/// A block tagged `sql`, else the first block mentioning SELECT.
fn select_fenced_block(raw: &str) -> Option<&str> {
    let blocks: Vec<(Option<&str>, &str)> = FENCED_BLOCK
        .captures_iter(raw)
        .filter_map(|caps| {
            let content = caps.get(2)?.as_str();
            Some((caps.get(1).map(|m| m.as_str()), content))
        })
        .collect();

    blocks
        .iter()
        .find(|(tag, _)| tag.is_some_and(|t| t.eq_ignore_ascii_case("sql")))
        .or_else(|| {
            blocks
                .iter()
                .find(|(_, content)| content.to_ascii_uppercase().contains("SELECT"))
        })
        .map(|(_, content)| *content)
}
