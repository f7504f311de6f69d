#![allow(clippy::module_name_repetitions)]

//! Lexer and parser for the sequencer REPL.
//!
//! The lexer uses `regal` to produce a bounded token stream, while the parser
//! composes `winnow` combinators over those tokens and walks the
//! [`catalog`] AST to build structured command values.

use super::catalog::{
    self, ChoiceBranch, ChoiceTag, CommandTag, DefaultChoice, FieldSpec, FieldTag, FieldValue,
    HelpTopics, Node, SubcommandBranch, SubcommandTag, ValueSpec,
};
use crate::executor::{PolarityConvention, RechargeMode};
use crate::recording::SideEffectKind;
use core::fmt;
use core::ops::Range;
use core::time::Duration;

use heapless::Vec as HeaplessVec;
use regal::IncrementalError;
use regal::TokenCache;
use regal_macros::RegalLexer;
#[allow(deprecated)]
use winnow::error::ErrorKind;
use winnow::error::{ErrMode, ParserError};
use winnow::prelude::*;
use winnow::stream::Stream;

/// Maximum number of tokens produced per REPL line. Commands remain short and bounded.
pub const MAX_TOKENS: usize = 64;

/// Most contacts a single `stimulate` command may list.
pub const MAX_CONTACTS: usize = 16;
const MAX_CACHE_RECORDS: usize = MAX_TOKENS * 2;

/// Lexical token kinds recognized by the REPL grammar.
#[derive(RegalLexer, Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum TokenKind {
    /// Duration literal ending in `ms` or `s`.
    #[regex(r"[0-9]+(?:ms|s)", priority = 2)]
    Duration,
    /// Decimal literal such as `2.5`.
    #[regex(r"[0-9]+\.[0-9]+", priority = 2)]
    Decimal,
    /// Unsuffixed integer literal.
    #[regex(r"[0-9]+")]
    Integer,
    /// Keyword, sequence name, or recording label (case-insensitive match performed later).
    #[regex(r"[A-Za-z_][A-Za-z0-9_.-]*")]
    Ident,
    /// Equals sign for key/value assignments.
    #[token("=")]
    Equals,
    /// Comma separator.
    #[token(",")]
    Comma,
    /// Inline whitespace is ignored.
    #[regex(r"[ \t]+", skip)]
    Whitespace,
    /// End-of-line token (`\r`, `\n`, or `\r\n`).
    #[token("\r\n")]
    #[token("\n")]
    #[token("\r")]
    Eol,
    /// Pseudo variant used when the lexer encounters unsupported input.
    #[default]
    #[regex(r".", priority = 1024)]
    Error,
}

/// Token emitted by the lexer with a byte span back into the source line.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Token<'a> {
    pub kind: TokenKind,
    pub lexeme: &'a str,
    pub span: Range<usize>,
}

/// Bounded token buffer to avoid dynamic allocation in `no_std` environments.
pub type TokenBuffer<'a> = HeaplessVec<Token<'a>, MAX_TOKENS>;

/// Lexer errors.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LexError {
    /// Input produced more tokens than the static buffer allows.
    TooManyTokens { processed: usize },
    /// Underlying lexer reported an unrecoverable error.
    Engine,
}

impl fmt::Display for LexError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LexError::TooManyTokens { processed } => {
                write!(f, "token buffer exhausted after {processed} items")
            }
            LexError::Engine => write!(f, "lexer engine error"),
        }
    }
}

/// Grammar errors emitted by the parser.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GrammarErrorKind<'a> {
    UnexpectedToken {
        expected: &'static str,
        found: Option<TokenKind>,
        span: Range<usize>,
    },
    UnexpectedEnd {
        expected: &'static str,
    },
    InvalidDuration {
        span: Range<usize>,
    },
    InvalidToken {
        span: Range<usize>,
        lexeme: &'a str,
    },
    InvalidNumber {
        span: Range<usize>,
    },
    DuplicateField {
        key: &'static str,
        span: Range<usize>,
    },
}

impl<'a> fmt::Display for GrammarErrorKind<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GrammarErrorKind::UnexpectedToken {
                expected,
                found,
                span,
            } => write!(f, "expected {expected}, found {found:?} at {span:?}"),
            GrammarErrorKind::UnexpectedEnd { expected } => {
                write!(f, "unexpected end of input, expected {expected}")
            }
            GrammarErrorKind::InvalidDuration { span } => {
                write!(f, "invalid duration literal at {span:?}")
            }
            GrammarErrorKind::InvalidToken { span, lexeme } => {
                write!(f, "unsupported token `{lexeme}` at {span:?}")
            }
            GrammarErrorKind::InvalidNumber { span } => {
                write!(f, "invalid number at {span:?}")
            }
            GrammarErrorKind::DuplicateField { key, span } => {
                write!(f, "field `{key}` given twice at {span:?}")
            }
        }
    }
}

/// Wrapper type enabling a consistent error surface for consumers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GrammarError<'a> {
    pub kind: GrammarErrorKind<'a>,
}

impl<'a> fmt::Display for GrammarError<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.kind.fmt(f)
    }
}

impl<'a> GrammarError<'a> {
    fn unexpected(expected: &'static str, token: Option<&Token<'a>>) -> Self {
        GrammarError {
            kind: match token {
                Some(tok) => GrammarErrorKind::UnexpectedToken {
                    expected,
                    found: Some(tok.kind),
                    span: tok.span.clone(),
                },
                None => GrammarErrorKind::UnexpectedEnd { expected },
            },
        }
    }

    fn invalid_duration(token: &Token<'a>) -> Self {
        GrammarError {
            kind: GrammarErrorKind::InvalidDuration {
                span: token.span.clone(),
            },
        }
    }

    fn invalid_token(token: &Token<'a>) -> Self {
        GrammarError {
            kind: GrammarErrorKind::InvalidToken {
                span: token.span.clone(),
                lexeme: token.lexeme,
            },
        }
    }

    fn invalid_number(token: &Token<'a>) -> Self {
        GrammarError {
            kind: GrammarErrorKind::InvalidNumber {
                span: token.span.clone(),
            },
        }
    }

    fn duplicate_field(key: &'static str, token: &Token<'a>) -> Self {
        GrammarError {
            kind: GrammarErrorKind::DuplicateField {
                key,
                span: token.span.clone(),
            },
        }
    }
}

type Input<'src, 'slice> = &'slice [Token<'src>];

#[allow(deprecated)]
impl<'src, 'slice> ParserError<Input<'src, 'slice>> for GrammarError<'src>
where
    'src: 'slice,
{
    fn from_error_kind(input: &Input<'src, 'slice>, _kind: ErrorKind) -> Self {
        GrammarError::unexpected("token", input.first())
    }

    fn append(
        self,
        _input: &Input<'src, 'slice>,
        _token_start: &<Input<'src, 'slice> as Stream>::Checkpoint,
        _kind: ErrorKind,
    ) -> Self {
        self
    }

    fn or(self, other: Self) -> Self {
        other
    }
}

/// Combined lex/parse error.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ParseError<'a> {
    Lex(LexError),
    Grammar(GrammarError<'a>),
}

impl<'a> fmt::Display for ParseError<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseError::Lex(err) => err.fmt(f),
            ParseError::Grammar(err) => err.fmt(f),
        }
    }
}

/// Structured commands produced by the parser.
#[derive(Clone, Debug, PartialEq)]
pub enum Command<'a> {
    Load(LoadCommand<'a>),
    Start(StartCommand),
    Stop,
    Show,
    Status,
    Stimulate(StimulateCommand),
    Record(RecordCommand<'a>),
    /// Free-text annotation, taken verbatim from the line.
    Label(&'a str),
    SideEffect(SideEffectKind),
    /// `None` reports the current convention.
    Polarity(Option<PolarityConvention>),
    Recharge(Option<RechargeMode>),
    Help(HelpCommand<'a>),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LoadCommand<'a> {
    pub name: &'a str,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StartCommand {
    pub retry_window: Option<Duration>,
}

/// Contact indices listed by `stimulate`.
pub type ContactList = HeaplessVec<usize, MAX_CONTACTS>;

/// One-off stimulation typed at the console.
#[derive(Clone, Debug, PartialEq)]
pub struct StimulateCommand {
    pub lead: usize,
    pub contacts: ContactList,
    /// `None` returns through the global can.
    pub return_contact: Option<usize>,
    pub amplitude_ma: f64,
    pub pulse_width_us: f64,
    pub frequency_hz: f64,
    pub duration: Duration,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RecordCommand<'a> {
    Start { label: Option<&'a str> },
    Stop,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HelpCommand<'a> {
    pub topic: Option<&'a str>,
}

/// Parses a command from `tokens`, which must have been lexed from `source`.
pub(crate) fn parse_tokens_partial<'src, 'slice>(
    source: &'src str,
    tokens: &'slice [Token<'src>],
) -> Result<(Command<'src>, &'slice [Token<'src>]), GrammarError<'src>>
where
    'src: 'slice,
{
    let mut input = tokens;
    match command(source).parse_next(&mut input) {
        Ok(cmd) => Ok((cmd, input)),
        Err(ErrMode::Backtrack(err)) | Err(ErrMode::Cut(err)) => Err(err),
        Err(ErrMode::Incomplete(_)) => Err(GrammarError::unexpected("token", input.first())),
    }
}

/// Tokenize the provided line.
pub fn lex(line: &str) -> Result<TokenBuffer<'_>, LexError> {
    let compiled = TokenKind::lexer();
    let mut cache: TokenCache<TokenKind, MAX_CACHE_RECORDS> = TokenCache::new();
    let partial = cache
        .rebuild(compiled, line)
        .map_err(map_incremental_error)?;
    let mut buffer = TokenBuffer::new();

    for record in cache.tokens() {
        if record.skipped {
            continue;
        }

        let span = record.start..record.end;
        let lexeme = &line[span.clone()];
        if buffer
            .push(Token {
                kind: record.token,
                lexeme,
                span,
            })
            .is_err()
        {
            return Err(LexError::TooManyTokens {
                processed: buffer.len() + 1,
            });
        }
    }

    if let Some(partial) = partial.filter(|partial| !partial.fragment.is_empty()) {
        let start = partial.start;
        let end = start + partial.fragment.len();
        let span = start..end;
        if buffer
            .push(Token {
                kind: TokenKind::Error,
                lexeme: partial.fragment,
                span,
            })
            .is_err()
        {
            return Err(LexError::TooManyTokens {
                processed: buffer.len() + 1,
            });
        }
    }

    Ok(buffer)
}

fn map_incremental_error(error: IncrementalError) -> LexError {
    match error {
        IncrementalError::TokenOverflow => LexError::TooManyTokens {
            processed: MAX_TOKENS,
        },
        _ => LexError::Engine,
    }
}

/// Parse a REPL command from the provided line.
pub fn parse(line: &str) -> Result<Command<'_>, ParseError<'_>> {
    let tokens = lex(line).map_err(ParseError::Lex)?;

    // Free text may carry any punctuation; only its keyword is checked.
    let checked = match tokens.first() {
        Some(first)
            if catalog::find(first.lexeme).is_some_and(|spec| spec.grammar.takes_text()) =>
        {
            &tokens[..1]
        }
        _ => tokens.as_slice(),
    };
    for token in checked {
        if token.kind == TokenKind::Error {
            return Err(ParseError::Grammar(GrammarError::invalid_token(token)));
        }
    }

    let (command, mut rest) =
        parse_tokens_partial(line, tokens.as_slice()).map_err(ParseError::Grammar)?;

    while let Some((token, remaining)) = rest.split_first() {
        if token.kind == TokenKind::Eol {
            rest = remaining;
        } else {
            return Err(ParseError::Grammar(GrammarError::unexpected(
                "end of command",
                Some(token),
            )));
        }
    }

    Ok(command)
}

fn command<'src, 'slice>(
    source: &'src str,
) -> impl Parser<Input<'src, 'slice>, Command<'src>, GrammarError<'src>>
where
    'src: 'slice,
{
    move |input: &mut Input<'src, 'slice>| {
        let snapshot = *input;
        let command_token = expect_kind(TokenKind::Ident, "command keyword").parse_next(input)?;

        match catalog::find(command_token.lexeme) {
            Some(spec) => {
                let mut state = CommandState::new(spec.tag);
                parse_node(spec.grammar, source, input, &mut state)?;
                state.finish()
            }
            None => {
                *input = snapshot;
                Err(ErrMode::Backtrack(GrammarError::unexpected(
                    "command keyword",
                    Some(&command_token),
                )))
            }
        }
    }
}

fn parse_node<'src, 'slice>(
    node: &'static Node,
    source: &'src str,
    input: &mut Input<'src, 'slice>,
    state: &mut CommandState<'src>,
) -> Result<(), ErrMode<GrammarError<'src>>>
where
    'src: 'slice,
{
    match node {
        Node::End => Ok(()),
        Node::OptionalChoice { choices, default } => {
            parse_optional_choice(source, input, choices, *default, state)
        }
        Node::Subcommands(branches) => parse_subcommands(source, input, branches, state),
        Node::Topic { topics, next } => {
            parse_topic(*topics, input, state)?;
            parse_node(next, source, input, state)
        }
        Node::Argument {
            label,
            required,
            next,
        } => {
            parse_argument(input, label, *required, state)?;
            parse_node(next, source, input, state)
        }
        Node::Fields { fields, next } => {
            parse_fields(input, fields, state)?;
            parse_node(next, source, input, state)
        }
        Node::Text { label, next } => {
            parse_text(source, input, label, state)?;
            parse_node(next, source, input, state)
        }
    }
}

fn parse_optional_choice<'src, 'slice>(
    source: &'src str,
    input: &mut Input<'src, 'slice>,
    choices: &'static [ChoiceBranch],
    default: Option<DefaultChoice>,
    state: &mut CommandState<'src>,
) -> Result<(), ErrMode<GrammarError<'src>>>
where
    'src: 'slice,
{
    match input.split_first() {
        Some((token, rest)) if token.kind == TokenKind::Ident => {
            if let Some(branch) = find_choice(choices, token.lexeme) {
                *input = rest;
                parse_choice_branch(source, input, branch, state)
            } else {
                Err(ErrMode::Backtrack(GrammarError::unexpected(
                    choice_expected_label(choices),
                    Some(token),
                )))
            }
        }
        Some((token, _)) if token.kind == TokenKind::Eol => {
            apply_default(source, default, input, state)
        }
        Some((token, _)) => Err(ErrMode::Backtrack(GrammarError::unexpected(
            choice_expected_label(choices),
            Some(token),
        ))),
        None => apply_default(source, default, input, state),
    }
}

fn apply_default<'src, 'slice>(
    source: &'src str,
    default: Option<DefaultChoice>,
    input: &mut Input<'src, 'slice>,
    state: &mut CommandState<'src>,
) -> Result<(), ErrMode<GrammarError<'src>>>
where
    'src: 'slice,
{
    match default {
        Some(default_choice) => {
            state.apply_choice(default_choice.tag, ChoiceValue::None)?;
            parse_node(default_choice.next, source, input, state)
        }
        None => Ok(()),
    }
}

fn parse_choice_branch<'src, 'slice>(
    source: &'src str,
    input: &mut Input<'src, 'slice>,
    branch: &'static ChoiceBranch,
    state: &mut CommandState<'src>,
) -> Result<(), ErrMode<GrammarError<'src>>>
where
    'src: 'slice,
{
    let value = parse_value(input, branch.value)?;
    state.apply_choice(branch.tag, value)?;
    parse_node(branch.next, source, input, state)
}

fn parse_subcommands<'src, 'slice>(
    source: &'src str,
    input: &mut Input<'src, 'slice>,
    branches: &'static [SubcommandBranch],
    state: &mut CommandState<'src>,
) -> Result<(), ErrMode<GrammarError<'src>>>
where
    'src: 'slice,
{
    let expected = branches
        .first()
        .map(|branch| branch.name)
        .unwrap_or("subcommand");

    match input.split_first() {
        Some((token, rest)) if token.kind == TokenKind::Ident => {
            if let Some(branch) = branches
                .iter()
                .find(|candidate| candidate.name.eq_ignore_ascii_case(token.lexeme))
            {
                *input = rest;
                state.set_subcommand(branch.tag);
                parse_node(branch.grammar, source, input, state)
            } else {
                Err(ErrMode::Backtrack(GrammarError::unexpected(
                    expected,
                    Some(token),
                )))
            }
        }
        Some((token, _)) => Err(ErrMode::Backtrack(GrammarError::unexpected(
            expected,
            Some(token),
        ))),
        None => Err(ErrMode::Backtrack(GrammarError::unexpected(expected, None))),
    }
}

fn parse_topic<'src, 'slice>(
    _topics: HelpTopics,
    input: &mut Input<'src, 'slice>,
    state: &mut CommandState<'src>,
) -> Result<(), ErrMode<GrammarError<'src>>>
where
    'src: 'slice,
{
    state.set_argument(None);

    match input.split_first() {
        Some((token, rest)) if token.kind == TokenKind::Ident => {
            state.set_argument(Some(token.lexeme));
            *input = rest;
            Ok(())
        }
        Some((token, _)) if token.kind == TokenKind::Eol => Ok(()),
        Some((token, _)) => Err(ErrMode::Backtrack(GrammarError::unexpected(
            "identifier",
            Some(token),
        ))),
        None => Ok(()),
    }
}

fn parse_argument<'src, 'slice>(
    input: &mut Input<'src, 'slice>,
    label: &'static str,
    required: bool,
    state: &mut CommandState<'src>,
) -> Result<(), ErrMode<GrammarError<'src>>>
where
    'src: 'slice,
{
    match input.split_first() {
        Some((token, rest))
            if matches!(
                token.kind,
                TokenKind::Ident | TokenKind::Integer | TokenKind::Duration
            ) =>
        {
            state.set_argument(Some(token.lexeme));
            *input = rest;
            Ok(())
        }
        Some((token, _)) if token.kind == TokenKind::Eol && !required => Ok(()),
        None if !required => Ok(()),
        other => Err(ErrMode::Backtrack(GrammarError::unexpected(
            label,
            other.map(|(token, _)| token),
        ))),
    }
}

fn parse_fields<'src, 'slice>(
    input: &mut Input<'src, 'slice>,
    fields: &'static [FieldSpec],
    state: &mut CommandState<'src>,
) -> Result<(), ErrMode<GrammarError<'src>>>
where
    'src: 'slice,
{
    let expected = fields.first().map_or("field", |field| field.key);
    let mut seen: u32 = 0;

    while let Some((token, rest)) = input.split_first() {
        if token.kind == TokenKind::Eol {
            break;
        }
        let Some((index, field)) = fields.iter().enumerate().find(|(_, field)| {
            token.kind == TokenKind::Ident && field.key.eq_ignore_ascii_case(token.lexeme)
        }) else {
            return Err(ErrMode::Backtrack(GrammarError::unexpected(
                expected,
                Some(token),
            )));
        };
        let bit = 1_u32 << index;
        if seen & bit != 0 {
            return Err(ErrMode::Cut(GrammarError::duplicate_field(field.key, token)));
        }
        seen |= bit;
        *input = rest;

        let _ = expect_kind(TokenKind::Equals, "=").parse_next(input)?;
        let content = parse_field_value(input, field.value)?;
        state.apply_field(field.tag, content);
    }

    match fields
        .iter()
        .enumerate()
        .find(|(index, _)| seen & (1_u32 << index) == 0)
    {
        Some((_, missing)) => Err(ErrMode::Backtrack(GrammarError::unexpected(
            missing.key,
            None,
        ))),
        None => Ok(()),
    }
}

fn parse_field_value<'src, 'slice>(
    input: &mut Input<'src, 'slice>,
    value: FieldValue,
) -> Result<FieldContent, ErrMode<GrammarError<'src>>>
where
    'src: 'slice,
{
    match value {
        FieldValue::Index => {
            let token = expect_kind(TokenKind::Integer, "index").parse_next(input)?;
            Ok(FieldContent::Index(parse_index(&token)?))
        }
        FieldValue::IndexList => {
            let mut contacts = ContactList::new();
            loop {
                let token = expect_kind(TokenKind::Integer, "contact index").parse_next(input)?;
                if contacts.push(parse_index(&token)?).is_err() {
                    return Err(ErrMode::Cut(GrammarError::invalid_number(&token)));
                }
                match input.split_first() {
                    Some((comma, rest)) if comma.kind == TokenKind::Comma => *input = rest,
                    _ => break,
                }
            }
            Ok(FieldContent::Contacts(contacts))
        }
        FieldValue::ReturnContact => match input.split_first() {
            Some((token, rest))
                if token.kind == TokenKind::Ident && token.lexeme.eq_ignore_ascii_case("can") =>
            {
                *input = rest;
                Ok(FieldContent::Return(None))
            }
            _ => {
                let token =
                    expect_kind(TokenKind::Integer, "return contact or can").parse_next(input)?;
                Ok(FieldContent::Return(Some(parse_index(&token)?)))
            }
        },
        FieldValue::Number => match input.split_first() {
            Some((token, rest))
                if matches!(token.kind, TokenKind::Integer | TokenKind::Decimal) =>
            {
                let number = token
                    .lexeme
                    .parse::<f64>()
                    .map_err(|_| ErrMode::Cut(GrammarError::invalid_number(token)))?;
                *input = rest;
                Ok(FieldContent::Number(number))
            }
            other => Err(ErrMode::Backtrack(GrammarError::unexpected(
                "number",
                other.map(|(token, _)| token),
            ))),
        },
        FieldValue::Duration => {
            let token = expect_kind(TokenKind::Duration, "duration").parse_next(input)?;
            let duration = parse_duration(&token).map_err(ErrMode::Cut)?;
            Ok(FieldContent::Duration(duration))
        }
    }
}

fn parse_index<'a>(token: &Token<'a>) -> Result<usize, ErrMode<GrammarError<'a>>> {
    token
        .lexeme
        .parse::<usize>()
        .map_err(|_| ErrMode::Cut(GrammarError::invalid_number(token)))
}

/// Takes every token up to the end of the line and keeps the source text they cover.
fn parse_text<'src, 'slice>(
    source: &'src str,
    input: &mut Input<'src, 'slice>,
    label: &'static str,
    state: &mut CommandState<'src>,
) -> Result<(), ErrMode<GrammarError<'src>>>
where
    'src: 'slice,
{
    let tokens: &'slice [Token<'src>] = *input;
    let end = tokens
        .iter()
        .position(|token| token.kind == TokenKind::Eol)
        .unwrap_or(tokens.len());
    let (words, rest) = tokens.split_at(end);

    let (Some(first), Some(last)) = (words.first(), words.last()) else {
        return Err(ErrMode::Backtrack(GrammarError::unexpected(
            label,
            tokens.first(),
        )));
    };
    let Some(text) = source.get(first.span.start..last.span.end) else {
        return Err(ErrMode::Cut(GrammarError::unexpected(label, Some(first))));
    };

    state.set_text(text);
    *input = rest;
    Ok(())
}

fn parse_value<'src, 'slice>(
    input: &mut Input<'src, 'slice>,
    spec: ValueSpec,
) -> Result<ChoiceValue, ErrMode<GrammarError<'src>>>
where
    'src: 'slice,
{
    match spec {
        ValueSpec::None => Ok(ChoiceValue::None),
        ValueSpec::DurationAssignment { .. } => {
            let _ = expect_kind(TokenKind::Equals, "=").parse_next(input)?;
            let duration_token = expect_kind(TokenKind::Duration, "duration").parse_next(input)?;
            let duration = parse_duration(&duration_token).map_err(ErrMode::Cut)?;
            Ok(ChoiceValue::Duration(duration))
        }
    }
}

fn find_choice(choices: &'static [ChoiceBranch], lexeme: &str) -> Option<&'static ChoiceBranch> {
    choices
        .iter()
        .find(|choice| choice.keyword.eq_ignore_ascii_case(lexeme))
}

fn choice_expected_label(choices: &'static [ChoiceBranch]) -> &'static str {
    choices
        .first()
        .map(|choice| choice.keyword)
        .unwrap_or("keyword")
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ChoiceValue {
    None,
    Duration(Duration),
}

#[derive(Clone, Debug, PartialEq)]
enum FieldContent {
    Index(usize),
    Contacts(ContactList),
    Return(Option<usize>),
    Number(f64),
    Duration(Duration),
}

/// `stimulate` fields collected so far.
#[derive(Default)]
struct StimulateDraft {
    lead: Option<usize>,
    contacts: Option<ContactList>,
    return_contact: Option<Option<usize>>,
    amplitude_ma: Option<f64>,
    pulse_width_us: Option<f64>,
    frequency_hz: Option<f64>,
    duration: Option<Duration>,
}

impl StimulateDraft {
    fn finish(self) -> Option<StimulateCommand> {
        Some(StimulateCommand {
            lead: self.lead?,
            contacts: self.contacts?,
            return_contact: self.return_contact?,
            amplitude_ma: self.amplitude_ma?,
            pulse_width_us: self.pulse_width_us?,
            frequency_hz: self.frequency_hz?,
            duration: self.duration?,
        })
    }
}

enum CommandState<'a> {
    Load {
        name: Option<&'a str>,
    },
    Start {
        retry_window: Option<Duration>,
    },
    Stop,
    Show,
    Status,
    Stimulate(StimulateDraft),
    Record {
        subcommand: Option<SubcommandTag>,
        label: Option<&'a str>,
    },
    Label {
        text: Option<&'a str>,
    },
    SideEffect {
        kind: Option<SideEffectKind>,
    },
    Polarity {
        value: Option<PolarityConvention>,
    },
    Recharge {
        value: Option<RechargeMode>,
    },
    Help {
        topic: Option<&'a str>,
    },
}

impl<'a> CommandState<'a> {
    fn new(tag: CommandTag) -> Self {
        match tag {
            CommandTag::Load => CommandState::Load { name: None },
            CommandTag::Start => CommandState::Start { retry_window: None },
            CommandTag::Stop => CommandState::Stop,
            CommandTag::Show => CommandState::Show,
            CommandTag::Status => CommandState::Status,
            CommandTag::Stimulate => CommandState::Stimulate(StimulateDraft::default()),
            CommandTag::Record => CommandState::Record {
                subcommand: None,
                label: None,
            },
            CommandTag::Label => CommandState::Label { text: None },
            CommandTag::SideEffect => CommandState::SideEffect { kind: None },
            CommandTag::Polarity => CommandState::Polarity { value: None },
            CommandTag::Recharge => CommandState::Recharge { value: None },
            CommandTag::Help => CommandState::Help { topic: None },
        }
    }

    fn apply_choice(
        &mut self,
        tag: ChoiceTag,
        value: ChoiceValue,
    ) -> Result<(), ErrMode<GrammarError<'a>>> {
        match (self, tag, value) {
            (
                CommandState::Start { retry_window },
                ChoiceTag::StartRetryWindow,
                ChoiceValue::Duration(duration),
            ) => {
                *retry_window = Some(duration);
                Ok(())
            }
            (CommandState::Polarity { value }, ChoiceTag::PolarityNormal, _) => {
                *value = Some(PolarityConvention::Normal);
                Ok(())
            }
            (CommandState::Polarity { value }, ChoiceTag::PolarityInverted, _) => {
                *value = Some(PolarityConvention::Inverted);
                Ok(())
            }
            (CommandState::Recharge { value }, ChoiceTag::RechargeActive, _) => {
                *value = Some(RechargeMode::Active);
                Ok(())
            }
            (CommandState::Recharge { value }, ChoiceTag::RechargePassive, _) => {
                *value = Some(RechargeMode::Passive);
                Ok(())
            }
            (CommandState::SideEffect { kind }, ChoiceTag::SideEffectPersistent, _) => {
                *kind = Some(SideEffectKind::Persistent);
                Ok(())
            }
            (CommandState::SideEffect { kind }, ChoiceTag::SideEffectTransient, _) => {
                *kind = Some(SideEffectKind::Transient);
                Ok(())
            }
            _ => Err(ErrMode::Backtrack(GrammarError::unexpected("choice", None))),
        }
    }

    fn apply_field(&mut self, tag: FieldTag, content: FieldContent) {
        let CommandState::Stimulate(draft) = self else {
            return;
        };
        match (tag, content) {
            (FieldTag::Lead, FieldContent::Index(lead)) => draft.lead = Some(lead),
            (FieldTag::Contacts, FieldContent::Contacts(contacts)) => {
                draft.contacts = Some(contacts);
            }
            (FieldTag::Return, FieldContent::Return(contact)) => {
                draft.return_contact = Some(contact);
            }
            (FieldTag::Amplitude, FieldContent::Number(value)) => draft.amplitude_ma = Some(value),
            (FieldTag::PulseWidth, FieldContent::Number(value)) => {
                draft.pulse_width_us = Some(value);
            }
            (FieldTag::Frequency, FieldContent::Number(value)) => draft.frequency_hz = Some(value),
            (FieldTag::Duration, FieldContent::Duration(value)) => draft.duration = Some(value),
            _ => {}
        }
    }

    fn set_text(&mut self, value: &'a str) {
        if let CommandState::Label { text } = self {
            *text = Some(value);
        }
    }

    fn set_subcommand(&mut self, tag: SubcommandTag) {
        if let CommandState::Record { subcommand, .. } = self {
            *subcommand = Some(tag);
        }
    }

    fn set_argument(&mut self, argument: Option<&'a str>) {
        match self {
            CommandState::Load { name } => *name = argument,
            CommandState::Record { label, .. } => *label = argument,
            CommandState::Help { topic } => *topic = argument,
            _ => {}
        }
    }

    fn finish(self) -> Result<Command<'a>, ErrMode<GrammarError<'a>>> {
        match self {
            CommandState::Load { name: Some(name) } => Ok(Command::Load(LoadCommand { name })),
            CommandState::Load { name: None } => Err(ErrMode::Backtrack(
                GrammarError::unexpected("sequence name", None),
            )),
            CommandState::Start { retry_window } => {
                Ok(Command::Start(StartCommand { retry_window }))
            }
            CommandState::Stop => Ok(Command::Stop),
            CommandState::Show => Ok(Command::Show),
            CommandState::Status => Ok(Command::Status),
            CommandState::Stimulate(draft) => draft.finish().map(Command::Stimulate).ok_or(
                ErrMode::Backtrack(GrammarError::unexpected("stimulation settings", None)),
            ),
            CommandState::Label { text: Some(text) } => Ok(Command::Label(text)),
            CommandState::Label { text: None } => Err(ErrMode::Backtrack(
                GrammarError::unexpected("label text", None),
            )),
            CommandState::SideEffect { kind: Some(kind) } => Ok(Command::SideEffect(kind)),
            CommandState::SideEffect { kind: None } => Err(ErrMode::Backtrack(
                GrammarError::unexpected("persistent or transient", None),
            )),
            CommandState::Record {
                subcommand: Some(SubcommandTag::RecordStart),
                label,
            } => Ok(Command::Record(RecordCommand::Start { label })),
            CommandState::Record {
                subcommand: Some(SubcommandTag::RecordStop),
                ..
            } => Ok(Command::Record(RecordCommand::Stop)),
            CommandState::Record {
                subcommand: None, ..
            } => Err(ErrMode::Backtrack(GrammarError::unexpected(
                "record subcommand",
                None,
            ))),
            CommandState::Polarity { value } => Ok(Command::Polarity(value)),
            CommandState::Recharge { value } => Ok(Command::Recharge(value)),
            CommandState::Help { topic } => Ok(Command::Help(HelpCommand { topic })),
        }
    }
}

fn expect_kind<'src, 'slice>(
    kind: TokenKind,
    label: &'static str,
) -> impl Parser<Input<'src, 'slice>, Token<'src>, GrammarError<'src>>
where
    'src: 'slice,
{
    move |input: &mut Input<'src, 'slice>| match input.split_first() {
        Some((token, rest)) if token.kind == kind => {
            *input = rest;
            Ok(token.clone())
        }
        Some((token, _)) => Err(ErrMode::Backtrack(GrammarError::unexpected(
            label,
            Some(token),
        ))),
        None => Err(ErrMode::Backtrack(GrammarError::unexpected(label, None))),
    }
}

fn parse_duration<'a>(token: &Token<'a>) -> Result<Duration, GrammarError<'a>> {
    let text = token.lexeme;
    if let Some(rest) = text.strip_suffix("ms") {
        let millis = rest
            .parse::<u32>()
            .map_err(|_| GrammarError::invalid_duration(token))?;
        Ok(Duration::from_millis(millis.into()))
    } else if let Some(rest) = text.strip_suffix('s') {
        let seconds = rest
            .parse::<u32>()
            .map_err(|_| GrammarError::invalid_duration(token))?;
        Ok(Duration::from_secs(seconds.into()))
    } else {
        Err(GrammarError::invalid_duration(token))
    }
}
