// lexer.rs — Tokens for label subscripts and memory sizes
//
// One logos token set serves both the subscript parser (`ij,jk->ik`) and
// size literals in configuration (`100MB`, `2GB`, `4096`).
//
// Preconditions: none.
// Postconditions: every byte of the input is covered by a token, an error,
//                 or skipped whitespace.
// Failure modes: unmatched characters become `LexError`s; lexing continues.
// Side effects: none.

use logos::Logos;
use std::fmt;

use crate::error::PlanError;

/// Byte range of a token in its source string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

/// Text no token matches.
#[derive(Debug, Clone, PartialEq)]
pub struct LexError {
    pub span: Span,
    pub text: String,
}

impl fmt::Display for LexError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unexpected {:?} at offset {}", self.text, self.span.start)
    }
}

/// Tokens in source order, with the unmatched text alongside.
#[derive(Debug, Default)]
pub struct LexResult {
    pub tokens: Vec<(Token, Span)>,
    pub errors: Vec<LexError>,
}

#[derive(Logos, Debug, Clone, PartialEq)]
#[logos(skip r"[ \t\n]+")]
pub enum Token {
    // ── Symbols ──
    #[token("->")]
    Arrow,
    #[token(",")]
    Comma,

    // ── Literals ──
    //
    // The size regex must appear before Number so the longer match
    // (number + unit suffix) wins over a bare number.
    /// Size literal (e.g. `64KB`). Value stored in bytes (binary: 1 KB = 1024).
    #[regex(r"[0-9]+(KB|MB|GB|TB)", size_literal)]
    Size(u64),

    /// Bare integer, interpreted as bytes where a size is expected.
    #[regex(r"[0-9]+", parse_number)]
    Number(u64),

    /// A single dimension label.
    #[regex(r"[a-zA-Z]", parse_label)]
    Label(char),
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Arrow => write!(f, "->"),
            Token::Comma => write!(f, ","),
            Token::Size(v) => write!(f, "{v}B"),
            Token::Number(v) => write!(f, "{v}"),
            Token::Label(c) => write!(f, "{c}"),
        }
    }
}

// ── Callbacks ──

const UNITS: [(&str, u32); 4] = [("KB", 10), ("MB", 20), ("GB", 30), ("TB", 40)];

fn parse_number(lex: &mut logos::Lexer<'_, Token>) -> Option<u64> {
    lex.slice().parse().ok()
}

fn parse_label(lex: &mut logos::Lexer<'_, Token>) -> Option<char> {
    lex.slice().chars().next()
}

/// `<digits><unit>` in binary multiples.
fn size_literal(lex: &mut logos::Lexer<'_, Token>) -> Option<u64> {
    let slice = lex.slice();
    UNITS.iter().find_map(|&(unit, shift)| {
        let digits: u64 = slice.strip_suffix(unit)?.parse().ok()?;
        digits.checked_mul(1u64 << shift)
    })
}

// ── Public API ──

/// Tokenize `source`. Unmatched characters are collected as errors and
/// skipped.
pub fn lex(source: &str) -> LexResult {
    let mut out = LexResult::default();
    for (result, range) in Token::lexer(source).spanned() {
        let span = Span {
            start: range.start,
            end: range.end,
        };
        match result {
            Ok(token) => out.tokens.push((token, span)),
            Err(()) => out.errors.push(LexError {
                span,
                text: source[range].to_string(),
            }),
        }
    }
    out
}

/// Bytes named by a size such as `100MB` or `4096`.
pub fn parse_size(source: &str) -> Result<u64, PlanError> {
    let LexResult { tokens, errors } = lex(source);
    match (errors.is_empty(), tokens.as_slice()) {
        (true, [(Token::Size(n) | Token::Number(n), _)]) => Ok(*n),
        _ => Err(PlanError::InvalidSize(source.to_string())),
    }
}
