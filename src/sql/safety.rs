//! Read-only statement validation.
//!
//! A statement is accepted only if it is a single SELECT/WITH query with no
//! data- or schema-mutating keyword anywhere outside comments. The check is
//! pure and cheap; it runs after extraction and again before execution.

use std::fmt;
use tracing::debug;

use super::lexer::{self, LexError, Token, TokenKind};

/// Keywords that mark a statement unsafe wherever they appear as a whole word.
pub const DENIED_KEYWORDS: &[&str] = &[
    "INSERT", "UPDATE", "DELETE", "DROP", "ALTER", "CREATE", "TRUNCATE", "MERGE", "EXEC",
    "EXECUTE", "GRANT", "REVOKE", "CALL", "COMMENT", "RENAME",
];

/// Keywords a read-only statement may start with.
pub const READ_OPENERS: &[&str] = &["SELECT", "WITH"];

pub const STATEMENT_SEPARATOR: char = ';';

/// Why a statement was rejected. Logged only; callers see a generic message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    Empty,
    Malformed(LexError),
    StatementSeparator,
    DeniedKeyword(&'static str),
    NotReadOnly,
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rejection::Empty => write!(f, "statement is empty"),
            Rejection::Malformed(e) => write!(f, "statement is malformed: {}", e),
            Rejection::StatementSeparator => write!(f, "statement separator present"),
            Rejection::DeniedKeyword(kw) => write!(f, "denied keyword {}", kw),
            Rejection::NotReadOnly => write!(f, "statement does not start with SELECT or WITH"),
        }
    }
}

impl std::error::Error for Rejection {}

/// A statement that passed validation, held in comment-stripped form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedSql(String);

impl ValidatedSql {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ValidatedSql {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

pub fn is_safe(sql: &str) -> bool {
    match validate(sql) {
        Ok(_) => true,
        Err(rejection) => {
            debug!("SQL rejected: {}", rejection);
            false
        }
    }
}

/// Runs every check and returns the comment-stripped statement on success.
pub fn validate(sql: &str) -> Result<ValidatedSql, Rejection> {
    // Anywhere in the raw text, comments included.
    if sql.contains(STATEMENT_SEPARATOR) {
        return Err(Rejection::StatementSeparator);
    }

    let tokens = lexer::tokenize(sql).map_err(Rejection::Malformed)?;
    let code: Vec<&Token<'_>> = tokens.iter().filter(|t| !t.is_comment()).collect();

    if let Some(keyword) = code.iter().find_map(|t| denied_keyword_in(t)) {
        return Err(Rejection::DeniedKeyword(keyword));
    }

    let leading = code.iter().find(|t| !t.is_trivia()).ok_or(Rejection::Empty)?;
    let opens_read = leading.kind == TokenKind::Word
        && READ_OPENERS
            .iter()
            .any(|kw| leading.text.eq_ignore_ascii_case(kw));
    if !opens_read {
        return Err(Rejection::NotReadOnly);
    }

    let stripped = lexer::strip_comments(sql).map_err(Rejection::Malformed)?;
    Ok(ValidatedSql(stripped))
}

/// Denied keyword carried by a token, checking inside literals and
/// quoted identifiers too.
fn denied_keyword_in(token: &Token<'_>) -> Option<&'static str> {
    match token.kind {
        TokenKind::Word => denied_word(token.text),
        _ => token
            .content()
            .split(|c: char| !lexer::is_word_char(c))
            .find_map(denied_word),
    }
}

fn denied_word(word: &str) -> Option<&'static str> {
    DENIED_KEYWORDS
        .iter()
        .copied()
        .find(|kw| word.eq_ignore_ascii_case(kw))
}
