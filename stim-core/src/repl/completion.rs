//! Grammar-aware completion engine for the sequencer REPL.
//!
//! The line editor can invoke this module to look up suggestions based on the
//! current buffer contents and cursor position without pulling in `std`.

use super::grammar::{self, Command, GrammarErrorKind, Token, TokenKind};
use heapless::Vec as HeaplessVec;

const MAX_SUGGESTIONS: usize = 16;

const ROOT_COMMANDS: &[&str] = &[
    "load",
    "start",
    "stop",
    "show",
    "status",
    "stimulate",
    "record",
    "label",
    "side-effect",
    "polarity",
    "recharge",
    "help",
];
const START_ARGS: &[&str] = &["retry-window=0s", "retry-window=2s", "retry-window=5s"];
const RECORD_SUBCOMMANDS: &[&str] = &["start", "stop"];
const POLARITY_ARGS: &[&str] = &["normal", "inverted"];
const RECHARGE_ARGS: &[&str] = &["active", "passive"];
const SIDE_EFFECT_ARGS: &[&str] = &["persistent", "transient"];
const STIMULATE_FIELDS: &[&str] = &[
    "lead=", "contacts=", "return=", "amp=", "pw=", "freq=", "dur=",
];
const NO_CANDIDATES: &[&str] = &[];

/// Completion result returned to the caller.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompletionResult {
    /// Replacement metadata to apply automatically when only one candidate
    /// matches or when a longer shared prefix exists across candidates.
    pub replacement: Option<Replacement>,
    /// Candidate list corresponding to the current cursor position. An empty
    /// list indicates that no completions were found.
    pub options: HeaplessVec<&'static str, MAX_SUGGESTIONS>,
}

/// Replacement metadata describing which portion of the buffer should be
/// substituted by the completion string.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Replacement {
    pub start: usize,
    pub end: usize,
    pub value: &'static str,
    pub append_space: bool,
}

/// Stateless completion engine that mirrors the REPL grammar.
#[derive(Default)]
pub struct CompletionEngine;

impl CompletionEngine {
    /// Creates a new completion engine.
    pub const fn new() -> Self {
        Self
    }

    /// Computes completions for the provided buffer at the supplied cursor
    /// position.
    ///
    /// The cursor must be positioned at a valid UTF-8 boundary; the caller is
    /// expected to enforce ASCII-only input.
    pub fn complete(&self, buffer: &str, cursor: usize) -> CompletionResult {
        if cursor > buffer.len() {
            return CompletionResult {
                replacement: None,
                options: HeaplessVec::new(),
            };
        }

        let upto_cursor = &buffer[..cursor];
        let prefix_start = token_start(upto_cursor);
        let prefix = &upto_cursor[prefix_start..];
        let leading = &upto_cursor[..prefix_start];

        let leading_tokens = match grammar::lex(leading) {
            Ok(tokens) => tokens,
            Err(_) => {
                return CompletionResult {
                    replacement: None,
                    options: HeaplessVec::new(),
                };
            }
        };

        if leading_tokens
            .iter()
            .any(|token| token.kind == TokenKind::Error)
        {
            return CompletionResult {
                replacement: None,
                options: HeaplessVec::new(),
            };
        }

        let context = determine_context(leading, leading_tokens.as_slice());
        let candidates = match context {
            CompletionContext::Root | CompletionContext::HelpTopic => ROOT_COMMANDS,
            CompletionContext::StartArg => START_ARGS,
            CompletionContext::RecordKeyword => RECORD_SUBCOMMANDS,
            CompletionContext::PolarityArg => POLARITY_ARGS,
            CompletionContext::RechargeArg => RECHARGE_ARGS,
            CompletionContext::SideEffectArg => SIDE_EFFECT_ARGS,
            CompletionContext::StimulateField => STIMULATE_FIELDS,
            CompletionContext::Argument => NO_CANDIDATES,
            CompletionContext::None => {
                return CompletionResult {
                    replacement: None,
                    options: HeaplessVec::new(),
                };
            }
        };

        let mut matches: HeaplessVec<&'static str, MAX_SUGGESTIONS> = HeaplessVec::new();
        for candidate in candidates {
            if context == CompletionContext::StimulateField
                && field_already_given(leading_tokens.as_slice(), candidate)
            {
                continue;
            }
            if starts_with_ignore_ascii_case(candidate, prefix) {
                let _ = matches.push(*candidate);
            }
        }

        if matches.is_empty() {
            return CompletionResult {
                replacement: None,
                options: matches,
            };
        }

        let matches_slice = matches.as_slice();
        let mut append_space = false;
        let replacement_value = if matches_slice.len() == 1 {
            let candidate = matches_slice[0];
            append_space = should_append_space(context, candidate);
            Some(candidate)
        } else {
            let lcp = longest_common_prefix(matches_slice);
            let shared = common_prefix_len_ignore_case(prefix, lcp);
            if lcp.len() > shared { Some(lcp) } else { None }
        };

        let replacement = replacement_value.map(|value| Replacement {
            start: prefix_start,
            end: cursor,
            value,
            append_space,
        });

        CompletionResult {
            replacement,
            options: matches,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum CompletionContext {
    Root,
    StartArg,
    RecordKeyword,
    PolarityArg,
    RechargeArg,
    SideEffectArg,
    /// Next `key=` of a `stimulate` command.
    StimulateField,
    HelpTopic,
    /// Free-form word with no fixed vocabulary.
    Argument,
    None,
}

fn determine_context(source: &str, tokens: &[Token<'_>]) -> CompletionContext {
    if tokens.is_empty() {
        return CompletionContext::Root;
    }

    if tokens.iter().any(|token| token.kind == TokenKind::Error) {
        return CompletionContext::None;
    }

    match grammar::parse_tokens_partial(source, tokens) {
        Ok((command, _)) => classify_success(tokens, &command),
        Err(err) => classify_error(tokens, &err.kind),
    }
}

fn classify_success(tokens: &[Token<'_>], command: &Command<'_>) -> CompletionContext {
    match command {
        Command::Start(_) if tokens.len() == 1 => CompletionContext::StartArg,
        Command::Polarity(_) if tokens.len() == 1 => CompletionContext::PolarityArg,
        Command::Recharge(_) if tokens.len() == 1 => CompletionContext::RechargeArg,
        Command::Help(_) if tokens.len() == 1 => CompletionContext::HelpTopic,
        Command::Label(_) => CompletionContext::Argument,
        Command::Record(_)
            if tokens.len() == 2 && equals_ignore_ascii_case(tokens[1].lexeme, "start") =>
        {
            CompletionContext::Argument
        }
        _ => infer_from_tokens(tokens),
    }
}

fn classify_error(tokens: &[Token<'_>], error: &GrammarErrorKind<'_>) -> CompletionContext {
    match error {
        GrammarErrorKind::UnexpectedEnd { expected }
        | GrammarErrorKind::UnexpectedToken { expected, .. }
            if *expected == "identifier" && first_token_is(tokens, "help") =>
        {
            CompletionContext::HelpTopic
        }
        _ => infer_from_tokens(tokens),
    }
}

fn infer_from_tokens(tokens: &[Token<'_>]) -> CompletionContext {
    match tokens {
        [] => CompletionContext::Root,
        [first] if equals_ignore_ascii_case(first.lexeme, "load") => CompletionContext::Argument,
        [first] if equals_ignore_ascii_case(first.lexeme, "start") => CompletionContext::StartArg,
        [first] if equals_ignore_ascii_case(first.lexeme, "record") => {
            CompletionContext::RecordKeyword
        }
        [first] if equals_ignore_ascii_case(first.lexeme, "polarity") => {
            CompletionContext::PolarityArg
        }
        [first] if equals_ignore_ascii_case(first.lexeme, "recharge") => {
            CompletionContext::RechargeArg
        }
        [first] if equals_ignore_ascii_case(first.lexeme, "help") => CompletionContext::HelpTopic,
        [first] if equals_ignore_ascii_case(first.lexeme, "side-effect") => {
            CompletionContext::SideEffectArg
        }
        [first, ..] if equals_ignore_ascii_case(first.lexeme, "label") => {
            CompletionContext::Argument
        }
        [first, .., last]
            if equals_ignore_ascii_case(first.lexeme, "stimulate") && last.kind == TokenKind::Equals =>
        {
            CompletionContext::None
        }
        [first, ..] if equals_ignore_ascii_case(first.lexeme, "stimulate") => {
            CompletionContext::StimulateField
        }
        _ => CompletionContext::None,
    }
}

/// Returns `true` when `candidate` (`key=`) already appears among the tokens.
fn field_already_given(tokens: &[Token<'_>], candidate: &str) -> bool {
    let key = candidate.trim_end_matches('=');
    tokens.windows(2).any(|pair| {
        pair[1].kind == TokenKind::Equals && equals_ignore_ascii_case(pair[0].lexeme, key)
    })
}

fn first_token_is(tokens: &[Token<'_>], expected: &str) -> bool {
    tokens
        .first()
        .map(|token| equals_ignore_ascii_case(token.lexeme, expected))
        .unwrap_or(false)
}

fn token_start(buffer: &str) -> usize {
    let mut index = buffer.len();
    let bytes = buffer.as_bytes();
    while index > 0 {
        let byte = bytes[index - 1];
        if byte == b' ' || byte == b'\t' {
            break;
        }
        index -= 1;
    }
    index
}

fn equals_ignore_ascii_case(lhs: &str, rhs: &str) -> bool {
    lhs.eq_ignore_ascii_case(rhs)
}

fn starts_with_ignore_ascii_case(candidate: &str, prefix: &str) -> bool {
    if prefix.is_empty() {
        return true;
    }

    if prefix.len() > candidate.len() {
        return false;
    }

    candidate[..prefix.len()].eq_ignore_ascii_case(prefix)
}

fn common_prefix_len_ignore_case(lhs: &str, rhs: &str) -> usize {
    lhs.as_bytes()
        .iter()
        .zip(rhs.as_bytes())
        .take_while(|(l, r)| l.eq_ignore_ascii_case(r))
        .count()
}

fn longest_common_prefix(candidates: &[&'static str]) -> &'static str {
    if let Some((first, rest)) = candidates.split_first() {
        let mut prefix = *first;
        for candidate in rest {
            let len = common_prefix_len_ignore_case(prefix, candidate);
            prefix = &prefix[..len];
            if prefix.is_empty() {
                break;
            }
        }
        prefix
    } else {
        ""
    }
}

fn should_append_space(context: CompletionContext, candidate: &'static str) -> bool {
    if !matches!(context, CompletionContext::Root) {
        return false;
    }

    let tokens = match grammar::lex(candidate) {
        Ok(tokens) => tokens,
        Err(_) => return false,
    };

    !matches!(
        determine_context(candidate, tokens.as_slice()),
        CompletionContext::Root | CompletionContext::None
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn expect_options(
        result: CompletionResult,
    ) -> (
        Option<Replacement>,
        HeaplessVec<&'static str, MAX_SUGGESTIONS>,
    ) {
        assert!(
            !result.options.is_empty(),
            "expected suggestions but got no match"
        );
        (result.replacement, result.options)
    }

    #[test]
    fn offers_root_commands_from_empty_buffer() {
        let engine = CompletionEngine::new();
        let (replacement, options) = expect_options(engine.complete("", 0));
        assert!(replacement.is_none());
        assert_eq!(options.as_slice(), ROOT_COMMANDS);
    }

    #[test]
    fn filters_root_commands_by_prefix() {
        let engine = CompletionEngine::new();
        let (replacement, options) = expect_options(engine.complete("st", 2));
        assert!(replacement.is_none());
        assert_eq!(options.as_slice(), ["start", "stop", "status", "stimulate"]);
    }

    #[test]
    fn extends_shared_prefix() {
        let engine = CompletionEngine::new();
        let (replacement, options) = expect_options(engine.complete("r", 1));
        let replacement = replacement.expect("expected shared prefix");
        assert_eq!(replacement.value, "rec");
        assert_eq!(options.as_slice(), ["record", "recharge"]);
    }

    #[test]
    fn expands_unique_root_command() {
        let engine = CompletionEngine::new();
        let (replacement, options) = expect_options(engine.complete("pol", 3));
        let replacement = replacement.expect("expected replacement");
        assert_eq!(replacement.start, 0);
        assert_eq!(replacement.end, 3);
        assert_eq!(replacement.value, "polarity");
        assert!(replacement.append_space);
        assert_eq!(options.as_slice(), ["polarity"]);
    }

    #[test]
    fn does_not_append_space_for_bare_commands() {
        let engine = CompletionEngine::new();
        let (replacement, _) = expect_options(engine.complete("sho", 3));
        let replacement = replacement.expect("expected replacement");
        assert_eq!(replacement.value, "show");
        assert!(!replacement.append_space);
    }

    #[test]
    fn appends_space_after_load() {
        let engine = CompletionEngine::new();
        let (replacement, _) = expect_options(engine.complete("lo", 2));
        let replacement = replacement.expect("expected replacement");
        assert_eq!(replacement.value, "load");
        assert!(replacement.append_space);
    }

    #[test]
    fn suggests_record_subcommands() {
        let engine = CompletionEngine::new();
        let (replacement, options) = expect_options(engine.complete("record ", 7));
        let replacement = replacement.expect("expected shared prefix");
        assert_eq!(replacement.value, "st");
        assert_eq!(options.as_slice(), RECORD_SUBCOMMANDS);
    }

    #[test]
    fn suggests_retry_window_values() {
        let engine = CompletionEngine::new();
        let (replacement, options) = expect_options(engine.complete("start ", 6));
        let replacement = replacement.expect("expected retry-window= prefix");
        assert_eq!(replacement.start, 6);
        assert_eq!(replacement.end, 6);
        assert_eq!(replacement.value, "retry-window=");
        assert_eq!(options.as_slice(), START_ARGS);
    }

    #[test]
    fn applies_case_insensitive_matching() {
        let engine = CompletionEngine::new();
        let (replacement, options) = expect_options(engine.complete("ReChArGe P", 10));
        let replacement = replacement.expect("expected replacement");
        assert_eq!(replacement.start, 9);
        assert_eq!(replacement.end, 10);
        assert_eq!(replacement.value, "passive");
        assert_eq!(options.as_slice(), ["passive"]);
    }

    #[test]
    fn provides_help_topics() {
        let engine = CompletionEngine::new();
        let (replacement, options) = expect_options(engine.complete("help po", 7));
        let replacement = replacement.expect("expected replacement");
        assert_eq!(replacement.start, 5);
        assert_eq!(replacement.end, 7);
        assert_eq!(replacement.value, "polarity");
        assert!(!replacement.append_space);
        assert_eq!(options.as_slice(), ["polarity"]);
    }

    #[test]
    fn suggests_side_effect_kinds() {
        let engine = CompletionEngine::new();
        let (replacement, options) = expect_options(engine.complete("side-effect t", 13));
        let replacement = replacement.expect("expected replacement");
        assert_eq!(replacement.value, "transient");
        assert_eq!(options.as_slice(), ["transient"]);
    }

    #[test]
    fn stimulate_suggests_the_fields_still_missing() {
        let engine = CompletionEngine::new();
        let (_, options) = expect_options(engine.complete("stimulate ", 10));
        assert_eq!(options.as_slice(), STIMULATE_FIELDS);

        let line = "stimulate lead=0 contacts=1,2 ";
        let (_, options) = expect_options(engine.complete(line, line.len()));
        assert_eq!(options.as_slice(), ["return=", "amp=", "pw=", "freq=", "dur="]);
    }

    #[test]
    fn stimulate_root_gains_a_space() {
        let engine = CompletionEngine::new();
        let (replacement, _) = expect_options(engine.complete("stim", 4));
        let replacement = replacement.expect("expected replacement");
        assert_eq!(replacement.value, "stimulate");
        assert!(replacement.append_space);
    }

    #[test]
    fn label_text_has_no_suggestions() {
        let engine = CompletionEngine::new();
        let result = engine.complete("label tremor o", 14);
        assert!(result.options.is_empty());
        assert!(result.replacement.is_none());
    }

    #[test]
    fn names_have_no_suggestions() {
        let engine = CompletionEngine::new();
        let result = engine.complete("load sc", 7);
        assert!(result.options.is_empty());
        assert!(result.replacement.is_none());
    }
}
