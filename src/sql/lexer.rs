//! SQL tokenization for the safety checks.
//!
//! Built on sqlparser's tokenizer with the PostgreSQL dialect, whose lexical
//! rules DuckDB follows: `--` and nested `/* */` comments, `'..'`, `E'..'`
//! and `$$..$$` strings, `".."` identifiers. Each token keeps the exact
//! slice of the input it came from. Anything the tokenizer cannot close is
//! an error, so callers fail closed instead of guessing where it ends.

use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::tokenizer::{Token as SqlToken, TokenWithLocation, Tokenizer, Whitespace};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    Whitespace,
    LineComment,
    BlockComment,
    /// `'...'`, `E'...'` or dollar-quoted.
    StringLiteral,
    /// `"..."`.
    QuotedIdent,
    /// Keywords, bare identifiers and numbers.
    Word,
    Symbol,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token<'a> {
    pub kind: TokenKind,
    /// Exact source text, delimiters and escapes included.
    pub text: &'a str,
    value: Option<String>,
}

impl Token<'_> {
    pub fn is_comment(&self) -> bool {
        matches!(self.kind, TokenKind::LineComment | TokenKind::BlockComment)
    }

    pub fn is_trivia(&self) -> bool {
        self.is_comment() || self.kind == TokenKind::Whitespace
    }

    /// Unescaped inner text of a literal or quoted identifier; the source
    /// text for everything else.
    pub fn content(&self) -> &str {
        self.value.as_deref().unwrap_or(self.text)
    }
}

/// The tokenizer could not make sense of the input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LexError {
    message: String,
}

impl LexError {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl fmt::Display for LexError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for LexError {}

pub fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

/// Splits `sql` into tokens. Concatenating every token's text yields `sql`.
pub fn tokenize(sql: &str) -> Result<Vec<Token<'_>>, LexError> {
    let dialect = PostgreSqlDialect {};
    let located = Tokenizer::new(&dialect, sql)
        .tokenize_with_location()
        .map_err(|e| LexError::new(e.to_string()))?;

    let located: Vec<TokenWithLocation> = located
        .into_iter()
        .filter(|t| t.token != SqlToken::EOF)
        .collect();

    let line_starts = line_starts(sql);
    let mut starts = Vec::with_capacity(located.len());
    for token in &located {
        let start = byte_offset(sql, &line_starts, token.location.line, token.location.column)
            .ok_or_else(|| LexError::new(format!("token outside input at {:?}", token.location)))?;
        starts.push(start);
    }

    if starts.first().is_some_and(|&start| start != 0) {
        return Err(LexError::new("tokenizer skipped leading input"));
    }

    let mut tokens = Vec::with_capacity(located.len());
    for (i, token) in located.into_iter().enumerate() {
        let start = starts[i];
        let end = starts.get(i + 1).copied().unwrap_or(sql.len());
        let text = sql
            .get(start..end)
            .filter(|text| !text.is_empty())
            .ok_or_else(|| LexError::new(format!("token out of order at {:?}", token.location)))?;

        let (kind, value) = classify(token.token);
        tokens.push(Token { kind, text, value });
    }

    Ok(tokens)
}

fn classify(token: SqlToken) -> (TokenKind, Option<String>) {
    match token {
        SqlToken::Whitespace(Whitespace::SingleLineComment { .. }) => (TokenKind::LineComment, None),
        SqlToken::Whitespace(Whitespace::MultiLineComment(_)) => (TokenKind::BlockComment, None),
        SqlToken::Whitespace(_) => (TokenKind::Whitespace, None),
        SqlToken::SingleQuotedString(s)
        | SqlToken::EscapedStringLiteral(s)
        | SqlToken::NationalStringLiteral(s)
        | SqlToken::DoubleQuotedString(s) => (TokenKind::StringLiteral, Some(s)),
        SqlToken::DollarQuotedString(s) => (TokenKind::StringLiteral, Some(s.value)),
        SqlToken::Word(word) if word.quote_style.is_some() => {
            (TokenKind::QuotedIdent, Some(word.value))
        }
        SqlToken::Word(_) | SqlToken::Number(..) => (TokenKind::Word, None),
        _ => (TokenKind::Symbol, None),
    }
}

/// Byte offset where each line starts. Line breaks are `\n` only, as in the tokenizer.
fn line_starts(sql: &str) -> Vec<usize> {
    std::iter::once(0)
        .chain(sql.match_indices('\n').map(|(i, _)| i + 1))
        .collect()
}

/// Byte offset of a 1-based (line, column) position; columns count chars.
fn byte_offset(sql: &str, line_starts: &[usize], line: u64, column: u64) -> Option<usize> {
    let line_start = *line_starts.get(usize::try_from(line).ok()?.checked_sub(1)?)?;
    let skip = usize::try_from(column).ok()?.checked_sub(1)?;
    let rest = &sql[line_start..];
    match rest.char_indices().nth(skip) {
        Some((i, _)) => Some(line_start + i),
        None if rest.chars().count() == skip => Some(sql.len()),
        None => None,
    }
}

/// Text with every comment removed, trimmed. A line comment becomes a line
/// break, a block comment a space.
pub fn strip_comments(sql: &str) -> Result<String, LexError> {
    let tokens = tokenize(sql)?;
    let mut out = String::with_capacity(sql.len());
    for token in tokens {
        match token.kind {
            TokenKind::LineComment if token.text.ends_with('\n') => out.push('\n'),
            TokenKind::LineComment | TokenKind::BlockComment => out.push(' '),
            _ => out.push_str(token.text),
        }
    }
    Ok(out.trim().to_string())
}

/// Whether parentheses outside literals and comments balance.
pub fn parens_balanced(tokens: &[Token<'_>]) -> bool {
    let mut depth: i64 = 0;
    for token in tokens.iter().filter(|t| t.kind == TokenKind::Symbol) {
        match token.text {
            "(" => depth += 1,
            ")" => {
                depth -= 1;
                if depth < 0 {
                    return false;
                }
            }
            _ => {}
        }
    }
    depth == 0
}
