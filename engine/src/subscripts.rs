// subscripts.rs — Einsum-style label subscripts for blockwise operations
//
// `ij,jk->ik` becomes one label sequence per operand plus the output
// sequence; chumsky combinators run over the token stream from `lexer::lex()`.
//
// Preconditions: none.
// Postconditions: returns `Subscripts` with one label list per operand.
// Failure modes: lex or syntax errors become `PlanError::InvalidSubscripts`.
// Side effects: none.

use std::collections::BTreeMap;

use chumsky::input::{Stream, ValueInput};
use chumsky::prelude::*;
use chumsky::span::SimpleSpan;

use crate::error::PlanError;
use crate::index::Label;
use crate::lexer::Token;

/// Parsed subscripts: one label sequence per input, plus the output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscripts {
    pub inputs: Vec<Vec<Label>>,
    pub output: Vec<Label>,
}

/// Parse a subscript string.
///
/// When the `->` clause is omitted the output is implicit: every label that
/// occurs exactly once across the inputs, in sorted order.
pub fn parse_subscripts(source: &str) -> Result<Subscripts, PlanError> {
    let lex_result = crate::lexer::lex(source);
    if let Some(err) = lex_result.errors.first() {
        return Err(PlanError::InvalidSubscripts(err.to_string()));
    }
    let len = source.len();

    let token_iter = lex_result.tokens.into_iter().map(|(tok, span)| {
        let cspan: SimpleSpan = (span.start..span.end).into();
        (tok, cspan)
    });
    let eoi: SimpleSpan = (len..len).into();
    let stream = Stream::from_iter(token_iter).map(eoi, |(t, s): (_, _)| (t, s));

    let (parsed, errors) = subscripts_parser().parse(stream).into_output_errors();
    if let Some(err) = errors.first() {
        return Err(PlanError::InvalidSubscripts(format!("{source:?}: {err}")));
    }
    let (inputs, output) =
        parsed.ok_or_else(|| PlanError::InvalidSubscripts(source.to_string()))?;
    let output = output.unwrap_or_else(|| implicit_output(&inputs));
    Ok(Subscripts { inputs, output })
}

type Parsed = (Vec<Vec<Label>>, Option<Vec<Label>>);

fn subscripts_parser<'tokens, I>(
) -> impl Parser<'tokens, I, Parsed, extra::Err<Rich<'tokens, Token, SimpleSpan>>>
where
    I: ValueInput<'tokens, Token = Token, Span = SimpleSpan>,
{
    let label = select! { Token::Label(c) => c };

    // A term may be empty: `""` is a zero-dimensional operand.
    let term = label.repeated().collect::<Vec<Label>>();

    let inputs = term
        .clone()
        .separated_by(just(Token::Comma))
        .at_least(1)
        .collect::<Vec<_>>();

    let output = just(Token::Arrow).ignore_then(term).or_not();

    inputs.then(output).then_ignore(end())
}

fn implicit_output(inputs: &[Vec<Label>]) -> Vec<Label> {
    let mut counts: BTreeMap<Label, usize> = BTreeMap::new();
    for label in inputs.iter().flatten() {
        *counts.entry(*label).or_default() += 1;
    }
    counts
        .into_iter()
        .filter(|&(_, n)| n == 1)
        .map(|(label, _)| label)
        .collect()
}
