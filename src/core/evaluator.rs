//! Condition and success-criteria evaluation.
//!
//! Expressions are conjunctions-of-disjunctions over atoms: `&` binds
//! tighter than `|`, parentheses group, evaluation short-circuits. Atoms
//! cover exit codes (`exit_0`), stream predicates (`stdout`, `!stdout`,
//! `stdout~regex`, `stderr!~regex`), aggregate quorums (`all_success`,
//! `any_success`, `min_success=K`, `max_failed=K`, `majority_success[=P]`),
//! and post-expansion variable comparisons (`left=right`, `left!=right`,
//! `left~regex`).
//!
//! Variable tokens are expanded by the variable engine before an
//! expression reaches this module, so comparisons here are plain string
//! operations. Regexes are compiled once and cached process-wide.
use crate::Result;
use crate::core::output::{INLINE_READ_BUDGET, OutputHandle};
use crate::core::results::{Aggregate, TaskResult};
use crate::error::TaskerError;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;
use std::sync::Mutex;

/// Default percentage for `majority_success` with no explicit threshold.
pub const DEFAULT_MAJORITY_PERCENT: f64 = 51.0;

static REGEX_CACHE: Lazy<Mutex<HashMap<String, Regex>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

fn compile_cached(pattern: &str) -> Result<Regex> {
    let mut cache = REGEX_CACHE.lock().unwrap();
    if let Some(re) = cache.get(pattern) {
        return Ok(re.clone());
    }
    let re = Regex::new(pattern)
        .map_err(|e| TaskerError::expression(format!("invalid regex '{}': {}", pattern, e)))?;
    cache.insert(pattern.to_string(), re.clone());
    Ok(re)
}

/// Which captured stream an atom inspects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Stdout,
    Stderr,
}

/// A single predicate of an expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Atom {
    /// `exit_N`
    ExitEquals(i32),
    /// `stdout` / `!stdout` / `stderr` / `!stderr`
    StreamNonEmpty { stream: Stream, negated: bool },
    /// `stdout~re` / `stdout!~re` and the stderr forms
    StreamMatches {
        stream: Stream,
        pattern: String,
        negated: bool,
    },
    /// `all_success`
    AllSuccess,
    /// `any_success`
    AnySuccess,
    /// `min_success=K`
    MinSuccess(u32),
    /// `max_failed=K`
    MaxFailed(u32),
    /// `majority_success[=P]`
    MajoritySuccess(f64),
    /// Post-expansion `left=right` / `left!=right`
    Equals {
        left: String,
        right: String,
        negated: bool,
    },
    /// Post-expansion `left~regex`
    Matches { left: String, pattern: String },
    /// Literal `true` / `false`, the residue of expanded boolean tokens
    /// such as `@N_success@`.
    Literal(bool),
}

/// A parsed boolean expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Atom(Atom),
    And(Vec<Expr>),
    Or(Vec<Expr>),
}

/// Everything an expression may be evaluated against.
///
/// Fields are optional: a decision predicate over variables carries no
/// stream context, and an atom that needs missing context is an
/// evaluation error rather than silently false.
#[derive(Debug, Clone, Copy, Default)]
pub struct EvalContext<'a> {
    pub exit_code: Option<i32>,
    pub stdout: Option<&'a OutputHandle>,
    pub stderr: Option<&'a OutputHandle>,
    pub aggregate: Option<&'a Aggregate>,
}

impl<'a> EvalContext<'a> {
    /// Context with no task result behind it.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Context over a completed task's result.
    pub fn for_result(result: &'a TaskResult) -> Self {
        Self {
            exit_code: Some(result.exit_code),
            stdout: Some(&result.stdout),
            stderr: Some(&result.stderr),
            aggregate: result.aggregate.as_ref(),
        }
    }
}

// --- parsing ---------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Token {
    LParen,
    RParen,
    And,
    Or,
    Atom(String),
}

/// Tokenize an expression. Parentheses that open inside an atom (regex
/// groups like `stdout~(OK|PASS)`) stay part of the atom; only
/// parentheses in expression position group.
fn tokenize(text: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = text.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '&' => {
                tokens.push(Token::And);
                i += 1;
            }
            '|' => {
                tokens.push(Token::Or);
                i += 1;
            }
            _ => {
                let mut atom = String::new();
                let mut depth = 0usize;
                while i < chars.len() {
                    let c = chars[i];
                    if depth == 0 && matches!(c, '&' | '|' | ')') {
                        break;
                    }
                    if c == '(' {
                        depth += 1;
                    } else if c == ')' {
                        depth -= 1;
                    }
                    atom.push(c);
                    i += 1;
                }
                tokens.push(Token::Atom(atom.trim().to_string()));
            }
        }
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    // or := and ('|' and)*
    fn parse_or(&mut self) -> Result<Expr> {
        let mut terms = vec![self.parse_and()?];
        while self.peek() == Some(&Token::Or) {
            self.advance();
            terms.push(self.parse_and()?);
        }
        if terms.len() == 1 {
            Ok(terms.pop().unwrap())
        } else {
            Ok(Expr::Or(terms))
        }
    }

    // and := primary ('&' primary)*
    fn parse_and(&mut self) -> Result<Expr> {
        let mut terms = vec![self.parse_primary()?];
        while self.peek() == Some(&Token::And) {
            self.advance();
            terms.push(self.parse_primary()?);
        }
        if terms.len() == 1 {
            Ok(terms.pop().unwrap())
        } else {
            Ok(Expr::And(terms))
        }
    }

    fn parse_primary(&mut self) -> Result<Expr> {
        match self.advance() {
            Some(Token::LParen) => {
                let inner = self.parse_or()?;
                match self.advance() {
                    Some(Token::RParen) => Ok(inner),
                    _ => Err(TaskerError::expression("unbalanced parenthesis")),
                }
            }
            Some(Token::Atom(text)) => Ok(Expr::Atom(parse_atom(&text)?)),
            other => Err(TaskerError::expression(format!(
                "expected an atom, found {:?}",
                other
            ))),
        }
    }
}

fn parse_atom(text: &str) -> Result<Atom> {
    if text.is_empty() {
        return Err(TaskerError::expression("empty atom"));
    }

    // Exit-code predicate.
    if let Some(value) = text.strip_prefix("exit_") {
        let code: i32 = value
            .parse()
            .map_err(|_| TaskerError::expression(format!("invalid exit atom '{}'", text)))?;
        return Ok(Atom::ExitEquals(code));
    }

    // Stream predicates, including the negated forms.
    for (name, stream) in [("stdout", Stream::Stdout), ("stderr", Stream::Stderr)] {
        if text == name {
            return Ok(Atom::StreamNonEmpty {
                stream,
                negated: false,
            });
        }
        if text.strip_prefix('!') == Some(name) {
            return Ok(Atom::StreamNonEmpty {
                stream,
                negated: true,
            });
        }
        if let Some(pattern) = text.strip_prefix(&format!("{}!~", name)) {
            compile_cached(pattern)?;
            return Ok(Atom::StreamMatches {
                stream,
                pattern: pattern.to_string(),
                negated: true,
            });
        }
        if let Some(pattern) = text.strip_prefix(&format!("{}~", name)) {
            compile_cached(pattern)?;
            return Ok(Atom::StreamMatches {
                stream,
                pattern: pattern.to_string(),
                negated: false,
            });
        }
    }

    // Aggregate quorums.
    match text {
        "all_success" => return Ok(Atom::AllSuccess),
        "any_success" => return Ok(Atom::AnySuccess),
        "majority_success" => return Ok(Atom::MajoritySuccess(DEFAULT_MAJORITY_PERCENT)),
        "true" => return Ok(Atom::Literal(true)),
        "false" => return Ok(Atom::Literal(false)),
        _ => {}
    }
    if let Some(value) = text.strip_prefix("min_success=") {
        let k: u32 = value
            .parse()
            .map_err(|_| TaskerError::expression(format!("invalid min_success '{}'", text)))?;
        return Ok(Atom::MinSuccess(k));
    }
    if let Some(value) = text.strip_prefix("max_failed=") {
        let k: u32 = value
            .parse()
            .map_err(|_| TaskerError::expression(format!("invalid max_failed '{}'", text)))?;
        return Ok(Atom::MaxFailed(k));
    }
    if let Some(value) = text.strip_prefix("majority_success=") {
        let p: f64 = value
            .parse()
            .map_err(|_| TaskerError::expression(format!("invalid majority percent '{}'", text)))?;
        if !(0.0..=100.0).contains(&p) {
            return Err(TaskerError::expression(format!(
                "majority percent out of range: '{}'",
                text
            )));
        }
        return Ok(Atom::MajoritySuccess(p));
    }

    // Variable comparisons. Tokens were already expanded, so both sides
    // are literal strings here.
    if let Some((left, right)) = text.split_once("!=") {
        return Ok(Atom::Equals {
            left: left.to_string(),
            right: right.to_string(),
            negated: true,
        });
    }
    if let Some((left, pattern)) = text.split_once('~') {
        compile_cached(pattern)?;
        return Ok(Atom::Matches {
            left: left.to_string(),
            pattern: pattern.to_string(),
        });
    }
    if let Some((left, right)) = text.split_once('=') {
        return Ok(Atom::Equals {
            left: left.to_string(),
            right: right.to_string(),
            negated: false,
        });
    }

    Err(TaskerError::expression(format!(
        "unrecognized atom '{}'",
        text
    )))
}

/// Parse an expression into its AST.
pub fn parse_expression(text: &str) -> Result<Expr> {
    let tokens = tokenize(text)?;
    if tokens.is_empty() {
        return Err(TaskerError::expression("empty expression"));
    }
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.parse_or()?;
    if parser.pos != parser.tokens.len() {
        return Err(TaskerError::expression(format!(
            "trailing input in expression '{}'",
            text
        )));
    }
    Ok(expr)
}

// --- evaluation ------------------------------------------------------------

/// Evaluate a parsed expression against a context. Short-circuits.
pub fn evaluate(expr: &Expr, ctx: &EvalContext<'_>) -> Result<bool> {
    match expr {
        Expr::Atom(atom) => evaluate_atom(atom, ctx),
        Expr::And(terms) => {
            for term in terms {
                if !evaluate(term, ctx)? {
                    return Ok(false);
                }
            }
            Ok(true)
        }
        Expr::Or(terms) => {
            for term in terms {
                if evaluate(term, ctx)? {
                    return Ok(true);
                }
            }
            Ok(false)
        }
    }
}

/// Parse and evaluate in one step.
pub fn evaluate_str(text: &str, ctx: &EvalContext<'_>) -> Result<bool> {
    evaluate(&parse_expression(text)?, ctx)
}

fn evaluate_atom(atom: &Atom, ctx: &EvalContext<'_>) -> Result<bool> {
    match atom {
        Atom::ExitEquals(code) => {
            let exit = ctx
                .exit_code
                .ok_or_else(|| TaskerError::expression("exit atom without a task result"))?;
            Ok(exit == *code)
        }
        Atom::StreamNonEmpty { stream, negated } => {
            let handle = stream_handle(ctx, *stream)?;
            let non_empty = handle.size_bytes() > 0;
            Ok(non_empty != *negated)
        }
        Atom::StreamMatches {
            stream,
            pattern,
            negated,
        } => {
            let handle = stream_handle(ctx, *stream)?;
            let (bytes, _) = handle.read_all(INLINE_READ_BUDGET)?;
            let text = String::from_utf8_lossy(&bytes);
            let matched = compile_cached(pattern)?.is_match(&text);
            Ok(matched != *negated)
        }
        Atom::AllSuccess => {
            let agg = aggregate(ctx)?;
            Ok(agg.total > 0 && agg.succeeded == agg.total)
        }
        Atom::AnySuccess => Ok(aggregate(ctx)?.succeeded > 0),
        Atom::MinSuccess(k) => Ok(aggregate(ctx)?.succeeded >= *k as usize),
        Atom::MaxFailed(k) => Ok(aggregate(ctx)?.failed <= *k as usize),
        Atom::MajoritySuccess(percent) => Ok(aggregate(ctx)?.percent_succeeded() >= *percent),
        Atom::Equals {
            left,
            right,
            negated,
        } => Ok((left == right) != *negated),
        Atom::Matches { left, pattern } => Ok(compile_cached(pattern)?.is_match(left)),
        Atom::Literal(value) => Ok(*value),
    }
}

fn stream_handle<'a>(ctx: &EvalContext<'a>, stream: Stream) -> Result<&'a OutputHandle> {
    let handle = match stream {
        Stream::Stdout => ctx.stdout,
        Stream::Stderr => ctx.stderr,
    };
    handle.ok_or_else(|| TaskerError::expression("stream atom without a task result"))
}

fn aggregate<'a>(ctx: &EvalContext<'a>) -> Result<&'a Aggregate> {
    ctx.aggregate
        .ok_or_else(|| TaskerError::expression("aggregate atom without a multi-task result"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::results::TaskResult;

    fn result(exit: i32, stdout: &str, stderr: &str) -> TaskResult {
        let mut r = TaskResult::new(0, exit);
        r.stdout = OutputHandle::from_bytes(stdout.as_bytes().to_vec());
        r.stderr = OutputHandle::from_bytes(stderr.as_bytes().to_vec());
        r
    }

    fn agg_result(total: usize, succeeded: usize, timed_out: usize) -> TaskResult {
        TaskResult::aggregate(
            0,
            Vec::new(),
            Aggregate {
                total,
                succeeded,
                failed: total - succeeded,
                timed_out,
            },
            succeeded == total,
            0.0,
        )
    }

    #[test]
    fn test_exit_atoms() {
        let ok = result(0, "", "");
        let ctx = EvalContext::for_result(&ok);
        assert!(evaluate_str("exit_0", &ctx).unwrap());
        assert!(!evaluate_str("exit_1", &ctx).unwrap());

        let failed = result(3, "", "");
        let ctx = EvalContext::for_result(&failed);
        assert!(evaluate_str("exit_3", &ctx).unwrap());
    }

    #[test]
    fn test_stream_atoms() {
        let r = result(0, "deployed OK\n", "");
        let ctx = EvalContext::for_result(&r);
        assert!(evaluate_str("stdout", &ctx).unwrap());
        assert!(evaluate_str("!stderr", &ctx).unwrap());
        assert!(evaluate_str("stdout~OK", &ctx).unwrap());
        assert!(evaluate_str("stdout!~FAIL", &ctx).unwrap());
        assert!(!evaluate_str("stderr~.", &ctx).unwrap());
    }

    #[test]
    fn test_regex_group_with_alternation_stays_one_atom() {
        let r = result(0, "status: PASS\n", "");
        let ctx = EvalContext::for_result(&r);
        assert!(evaluate_str("stdout~(OK|PASS)", &ctx).unwrap());
        assert!(evaluate_str("stdout~(OK|PASS)&exit_0", &ctx).unwrap());
        assert!(!evaluate_str("stdout~(OK|GOOD)&exit_1", &ctx).unwrap());
    }

    #[test]
    fn test_precedence_and_binds_tighter_than_or() {
        // exit_1 | exit_0 & stdout  ==  exit_1 | (exit_0 & stdout)
        let with_output = result(0, "x", "");
        let ctx = EvalContext::for_result(&with_output);
        assert!(evaluate_str("exit_1|exit_0&stdout", &ctx).unwrap());

        let no_output = result(0, "", "");
        let ctx = EvalContext::for_result(&no_output);
        assert!(!evaluate_str("exit_1|exit_0&stdout", &ctx).unwrap());
        // Parentheses override.
        assert!(!evaluate_str("(exit_1|exit_0)&stdout", &ctx).unwrap());
    }

    #[test]
    fn test_aggregate_atoms() {
        let all = agg_result(3, 3, 0);
        let ctx = EvalContext::for_result(&all);
        assert!(evaluate_str("all_success", &ctx).unwrap());
        assert!(evaluate_str("any_success", &ctx).unwrap());

        let partial = agg_result(3, 2, 0);
        let ctx = EvalContext::for_result(&partial);
        assert!(!evaluate_str("all_success", &ctx).unwrap());
        assert!(evaluate_str("min_success=2", &ctx).unwrap());
        assert!(!evaluate_str("min_success=3", &ctx).unwrap());
        assert!(evaluate_str("max_failed=1", &ctx).unwrap());
        assert!(!evaluate_str("max_failed=0", &ctx).unwrap());
        assert!(evaluate_str("majority_success", &ctx).unwrap());
        assert!(evaluate_str("majority_success=66", &ctx).unwrap());
        assert!(!evaluate_str("majority_success=67", &ctx).unwrap());

        let half = agg_result(2, 1, 0);
        let ctx = EvalContext::for_result(&half);
        assert!(!evaluate_str("majority_success", &ctx).unwrap());
        assert!(evaluate_str("majority_success=50", &ctx).unwrap());
    }

    #[test]
    fn test_variable_comparisons_post_expansion() {
        let ctx = EvalContext::empty();
        assert!(evaluate_str("yes=yes", &ctx).unwrap());
        assert!(!evaluate_str("yes=no", &ctx).unwrap());
        assert!(evaluate_str("yes!=no", &ctx).unwrap());
        assert!(evaluate_str("web01~^web", &ctx).unwrap());
        assert!(evaluate_str("true", &ctx).unwrap());
        assert!(!evaluate_str("false", &ctx).unwrap());
    }

    #[test]
    fn test_missing_context_is_error_not_false() {
        let ctx = EvalContext::empty();
        assert!(evaluate_str("exit_0", &ctx).is_err());
        assert!(evaluate_str("stdout", &ctx).is_err());
        assert!(evaluate_str("all_success", &ctx).is_err());
    }

    #[test]
    fn test_parse_errors() {
        assert!(parse_expression("").is_err());
        assert!(parse_expression("exit_x").is_err());
        assert!(parse_expression("(exit_0").is_err());
        assert!(parse_expression("exit_0)").is_err());
        assert!(parse_expression("min_success=two").is_err());
        assert!(parse_expression("majority_success=150").is_err());
        assert!(parse_expression("stdout~(unclosed").is_err());
        assert!(parse_expression("&exit_0").is_err());
    }

    #[test]
    fn test_short_circuit_skips_invalid_context() {
        // The OR's left side is true; the right side would error on the
        // empty context but is never reached.
        let ctx = EvalContext::empty();
        assert!(evaluate_str("true|exit_0", &ctx).unwrap());
        assert!(!evaluate_str("false&exit_0", &ctx).unwrap());
    }

    #[test]
    fn test_determinism() {
        let r = agg_result(5, 3, 1);
        let ctx = EvalContext::for_result(&r);
        let expr = parse_expression("min_success=3&max_failed=2|all_success").unwrap();
        let first = evaluate(&expr, &ctx).unwrap();
        for _ in 0..10 {
            assert_eq!(evaluate(&expr, &ctx).unwrap(), first);
        }
    }
}
