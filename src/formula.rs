// used for decimal arithmetic and banker's rounding
use bigdecimal::rounding::RoundingMode;
use bigdecimal::{BigDecimal, ToPrimitive, Zero};

// used by the date and time functions
use chrono::format::{Item, StrftimeItems};
use chrono::{Months, NaiveDateTime, NaiveTime, Utc};

// so regular expressions don't have to be recompiled
use lazy_static::lazy_static;
use regex::Regex;

use std::cmp::Ordering;
use std::collections::HashMap;
use std::str::FromStr;
use std::time::{Duration, Instant};

use crate::error::{FormcalcError, Result};
use crate::settings::Settings;
use crate::value::{Snapshot, Value, ValueKind};

/// Execution budget applied when a context does not set its own.
pub const DEFAULT_BUDGET: Duration = Duration::from_secs(5);

/// Nesting limit applied when settings do not set their own.
pub const DEFAULT_MAX_DEPTH: usize = 64;

// Operator tokens in the order the legacy scan tries them. The scan takes
// the first token that occurs anywhere in the text, so this order is part
// of the observable contract, not an implementation detail.
const OPERATOR_SCAN: [&str; 14] = [
    "==", "!=", ">=", "<=", ">", "<", "+", "-", "*", "/", "&&", "||", "&", "|",
];

// Markup and template fragments rejected by plain substring match.
const DENIED_FRAGMENTS: [&str; 7] = [
    "${", "<%", "%>", "<script", "javascript:", "vbscript:", "data:",
];

lazy_static! {
    // Keyword tokens are word bounded so that field names such as
    // $process_fee or $profile_url pass while bare tokens are caught.
    static ref DENIED_PATTERNS: Vec<Regex> = [
        r"\beval\b",
        r"\bexec\b",
        r"\bexecute\b",
        r"\bsystem\b",
        r"\bprocess\b",
        r"\bshell\b",
        r"\bcmd\b",
        r"\bspawn\b",
        r"\bfork\b",
        r"\bfile\b",
        r"\bdirectory\b",
        r"\bregistry\b",
        r"\bnetwork\b",
        r"\bsocket\b",
        r"\bhttps?\b",
        r"\burl\b",
        r"\bftp\b",
        r"\breflection\b",
        r"\bassembly\b",
        r"\binvoke\b",
        r"\bconstructor\b",
        r"\btypeof\b",
        r"\benvironment\b",
        r"\bthread\b",
        r"\bparallel\b",
        r"\bimport\b",
        r"\brequire\b",
        r"\binclude\b",
        r"\bwhile\s*\(",
        r"\bfor\s*\(",
        r"\bforeach\b",
        r"\bgoto\b",
        r"\bthrow\b",
        r"\btry\b",
        r"\bcatch\b",
        r"\bfinally\b",
    ]
    .iter()
    .map(|pattern| Regex::new(&format!("(?i){}", pattern)).unwrap())
    .collect();

    // Whole-text function call: NAME(args). Anchored on both ends; text that
    // merely contains a call falls through to the operator scan.
    static ref FUNCTION_CALL: Regex = Regex::new(r"^(\w+)\((.*)\)$").unwrap();

    // Whole-text variable reference.
    static ref VARIABLE: Regex = Regex::new(r"^\$([A-Za-z_][A-Za-z0-9_]*)$").unwrap();

    // Every variable reference inside a formula, for graph seeding.
    static ref VARIABLE_REFERENCE: Regex = Regex::new(r"\$([A-Za-z_][A-Za-z0-9_]*)").unwrap();
}

// ------------- Function table -------------
/// The fixed set of builtin functions. Formulas can call nothing else.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Func {
    If,
    And,
    Or,
    Not,
    Equals,
    GreaterThan,
    LessThan,
    Contains,
    Length,
    Upper,
    Lower,
    Trim,
    Substring,
    Concat,
    Add,
    Subtract,
    Multiply,
    Divide,
    Round,
    Abs,
    Min,
    Max,
    Now,
    Today,
    DateAdd,
    DateDiff,
    FormatDate,
    IsNull,
    IsEmpty,
    Coalesce,
}

#[derive(Debug, Clone, Copy)]
struct FuncEntry {
    name: &'static str,
    func: Func,
    arity: usize,
}

static FUNCTION_TABLE: [FuncEntry; 30] = [
    FuncEntry { name: "IF", func: Func::If, arity: 3 },
    FuncEntry { name: "AND", func: Func::And, arity: 2 },
    FuncEntry { name: "OR", func: Func::Or, arity: 2 },
    FuncEntry { name: "NOT", func: Func::Not, arity: 1 },
    FuncEntry { name: "EQUALS", func: Func::Equals, arity: 2 },
    FuncEntry { name: "GREATER_THAN", func: Func::GreaterThan, arity: 2 },
    FuncEntry { name: "LESS_THAN", func: Func::LessThan, arity: 2 },
    FuncEntry { name: "CONTAINS", func: Func::Contains, arity: 2 },
    FuncEntry { name: "LENGTH", func: Func::Length, arity: 1 },
    FuncEntry { name: "UPPER", func: Func::Upper, arity: 1 },
    FuncEntry { name: "LOWER", func: Func::Lower, arity: 1 },
    FuncEntry { name: "TRIM", func: Func::Trim, arity: 1 },
    FuncEntry { name: "SUBSTRING", func: Func::Substring, arity: 3 },
    FuncEntry { name: "CONCAT", func: Func::Concat, arity: 2 },
    FuncEntry { name: "ADD", func: Func::Add, arity: 2 },
    FuncEntry { name: "SUBTRACT", func: Func::Subtract, arity: 2 },
    FuncEntry { name: "MULTIPLY", func: Func::Multiply, arity: 2 },
    FuncEntry { name: "DIVIDE", func: Func::Divide, arity: 2 },
    FuncEntry { name: "ROUND", func: Func::Round, arity: 2 },
    FuncEntry { name: "ABS", func: Func::Abs, arity: 1 },
    FuncEntry { name: "MIN", func: Func::Min, arity: 2 },
    FuncEntry { name: "MAX", func: Func::Max, arity: 2 },
    FuncEntry { name: "NOW", func: Func::Now, arity: 0 },
    FuncEntry { name: "TODAY", func: Func::Today, arity: 0 },
    FuncEntry { name: "DATE_ADD", func: Func::DateAdd, arity: 3 },
    FuncEntry { name: "DATE_DIFF", func: Func::DateDiff, arity: 3 },
    FuncEntry { name: "FORMAT_DATE", func: Func::FormatDate, arity: 2 },
    FuncEntry { name: "IS_NULL", func: Func::IsNull, arity: 1 },
    FuncEntry { name: "IS_EMPTY", func: Func::IsEmpty, arity: 1 },
    FuncEntry { name: "COALESCE", func: Func::Coalesce, arity: 2 },
];

/// Name and argument count of one builtin, for authoring tools.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FunctionSignature {
    pub name: &'static str,
    pub arity: usize,
}

// ------------- Context and results -------------
/// The variable bindings and execution budget visible to one evaluation
/// call. Constructed fresh per call; never mutated by the evaluator.
#[derive(Debug)]
pub struct EvaluationContext<'a> {
    variables: &'a Snapshot,
    budget: Duration,
}

impl<'a> EvaluationContext<'a> {
    pub fn new(variables: &'a Snapshot) -> Self {
        Self {
            variables,
            budget: DEFAULT_BUDGET,
        }
    }

    pub fn with_budget(mut self, budget: Duration) -> Self {
        self.budget = budget;
        self
    }

    pub fn budget(&self) -> Duration {
        self.budget
    }
}

/// A successful evaluation: the value, its inferred kind, and how long the
/// call took.
#[derive(Debug, Clone)]
pub struct Evaluation {
    pub value: Value,
    pub kind: ValueKind,
    pub elapsed: Duration,
}

/// Static findings about one expression, without evaluating it.
#[derive(Debug, Clone, Default)]
pub struct ValidationReport {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub security_issues: Vec<String>,
}

impl ValidationReport {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }
}

// Per-call bookkeeping threaded through the recursion.
struct Frame<'a> {
    variables: &'a Snapshot,
    deadline: Instant,
    budget: Duration,
    max_depth: usize,
}

impl Frame<'_> {
    fn guard(&self, depth: usize) -> Result<()> {
        if depth > self.max_depth {
            return Err(FormcalcError::Syntax(
                "expression nested too deeply".to_owned(),
            ));
        }
        if Instant::now() >= self.deadline {
            return Err(FormcalcError::Timeout {
                budget: self.budget,
            });
        }
        Ok(())
    }
}

// ------------- Evaluator -------------
/// Evaluates author-written formulas against a variable snapshot.
///
/// The evaluator is immutable after construction (function table, operator
/// list, and compiled deny-list) and safe to share across threads. Each call
/// is bounded by the context's cooperative execution budget.
pub struct Evaluator {
    functions: HashMap<&'static str, FuncEntry>,
    precedence: bool,
    max_depth: usize,
}

impl Evaluator {
    pub fn new() -> Self {
        Self::with_settings(&Settings::default())
    }

    pub fn with_settings(settings: &Settings) -> Self {
        Self {
            functions: FUNCTION_TABLE.iter().map(|e| (e.name, *e)).collect(),
            precedence: settings.operator_precedence,
            max_depth: settings.max_nesting_depth,
        }
    }

    /// Evaluate one formula. The deny-list gate runs first; a rejected
    /// expression is never executed. Exceeding the context's budget aborts
    /// with a timeout, discarding any partial result.
    pub fn evaluate(&self, expression: &str, context: &EvaluationContext) -> Result<Evaluation> {
        let started = Instant::now();
        if expression.trim().is_empty() {
            return Err(FormcalcError::Syntax("expression is empty".to_owned()));
        }
        if let Some(token) = self.denied_tokens(expression).into_iter().next() {
            return Err(FormcalcError::SecurityViolation(format!(
                "expression contains denied token '{}'",
                token
            )));
        }
        // budgets beyond what the clock can represent cap at a day
        let deadline = started
            .checked_add(context.budget)
            .unwrap_or_else(|| started + Duration::from_secs(86_400));
        let frame = Frame {
            variables: context.variables,
            deadline,
            budget: context.budget,
            max_depth: self.max_depth,
        };
        let value = if self.precedence {
            self.eval_precedence(expression, &frame)?
        } else {
            self.eval_text(expression, &frame, 0)?
        };
        Ok(Evaluation {
            kind: value.kind(),
            value,
            elapsed: started.elapsed(),
        })
    }

    /// True when the expression passes the deny-list gate. Blank
    /// expressions are not safe, mirroring the evaluation contract.
    pub fn is_safe(&self, expression: &str) -> bool {
        !expression.trim().is_empty() && self.denied_tokens(expression).is_empty()
    }

    /// Static checks without evaluation: deny-list hits, parenthesis and
    /// quote balance, stray variable sigils.
    pub fn validate(&self, expression: &str) -> ValidationReport {
        let mut report = ValidationReport::default();
        if expression.trim().is_empty() {
            report.errors.push("expression is empty".to_owned());
            return report;
        }
        for token in self.denied_tokens(expression) {
            report
                .errors
                .push(format!("denied token '{}'", token));
            report.security_issues.push(token);
        }
        let opening = expression.matches('(').count();
        let closing = expression.matches(')').count();
        if opening != closing {
            report.errors.push(format!(
                "unbalanced parentheses: {} opening, {} closing",
                opening, closing
            ));
        }
        if expression.matches('\'').count() % 2 != 0 {
            report
                .errors
                .push("unbalanced single quotes".to_owned());
        }
        if expression.matches('"').count() % 2 != 0 {
            report
                .errors
                .push("unbalanced double quotes".to_owned());
        }
        for (at, c) in expression.char_indices() {
            if c != '$' {
                continue;
            }
            let follows = expression[at + 1..].chars().next();
            if !matches!(follows, Some(n) if n.is_ascii_alphabetic() || n == '_') {
                report
                    .warnings
                    .push("'$' is not followed by a field name".to_owned());
            }
        }
        report
    }

    /// The operator tokens in legacy scan order.
    pub fn supported_operators(&self) -> &'static [&'static str] {
        &OPERATOR_SCAN
    }

    /// The builtin functions with their argument counts.
    pub fn available_functions(&self) -> Vec<FunctionSignature> {
        FUNCTION_TABLE
            .iter()
            .map(|e| FunctionSignature {
                name: e.name,
                arity: e.arity,
            })
            .collect()
    }

    fn denied_tokens(&self, expression: &str) -> Vec<String> {
        let lowered = expression.to_lowercase();
        let mut tokens = Vec::new();
        for fragment in DENIED_FRAGMENTS {
            if lowered.contains(fragment) {
                tokens.push(fragment.to_string());
            }
        }
        for pattern in DENIED_PATTERNS.iter() {
            if let Some(found) = pattern.find(expression) {
                tokens.push(found.as_str().to_lowercase());
            }
        }
        tokens
    }

    // The faithful mode: recursive string-region evaluation. No syntax tree
    // is built; each region is classified and split in place.
    fn eval_text(&self, text: &str, frame: &Frame, depth: usize) -> Result<Value> {
        frame.guard(depth)?;
        let text = text.trim();
        if text.is_empty() {
            return Err(FormcalcError::Syntax("empty operand".to_owned()));
        }

        // whole-text function call
        if let Some(caps) = FUNCTION_CALL.captures(text) {
            let name = caps.get(1).map(|m| m.as_str()).unwrap_or_default();
            let body = caps.get(2).map(|m| m.as_str()).unwrap_or_default();
            let mut args = Vec::new();
            for segment in split_arguments(body) {
                args.push(self.eval_text(&segment, frame, depth + 1)?);
            }
            return self.call_by_name(name, &args);
        }

        // whole-text variable reference; an absent variable is null
        if let Some(caps) = VARIABLE.captures(text) {
            let name = caps.get(1).map(|m| m.as_str()).unwrap_or_default();
            return Ok(frame.variables.get(name).cloned().unwrap_or(Value::Null));
        }

        // literals
        if text.eq_ignore_ascii_case("true") {
            return Ok(Value::Boolean(true));
        }
        if text.eq_ignore_ascii_case("false") {
            return Ok(Value::Boolean(false));
        }
        if let Ok(number) = BigDecimal::from_str(text) {
            return Ok(Value::Number(number));
        }
        if let Some(literal) = quoted_literal(text) {
            return Ok(Value::Text(literal.to_owned()));
        }

        // first textual occurrence of an operator, in fixed priority order;
        // position 0 is never a split point, which protects a leading sign
        for op in OPERATOR_SCAN {
            if let Some(index) = text.find(op) {
                if index > 0 {
                    let left = self.eval_text(&text[..index], frame, depth + 1)?;
                    let right = self.eval_text(&text[index + op.len()..], frame, depth + 1)?;
                    return apply_operator(op, &left, &right);
                }
            }
        }
        Err(FormcalcError::Syntax(format!(
            "unable to evaluate: {}",
            text
        )))
    }

    fn call_by_name(&self, name: &str, args: &[Value]) -> Result<Value> {
        let entry = self
            .functions
            .get(name.to_uppercase().as_str())
            .copied()
            .ok_or_else(|| FormcalcError::Syntax(format!("unknown function: {}", name)))?;
        if args.len() != entry.arity {
            return Err(FormcalcError::Evaluation(format!(
                "{} expects {} argument(s), got {}",
                entry.name,
                entry.arity,
                args.len()
            )));
        }
        call(entry.func, args)
    }

    // The redesigned mode behind the compatibility flag: tokenize once, then
    // precedence climbing with left associativity and grouping parentheses.
    fn eval_precedence(&self, text: &str, frame: &Frame) -> Result<Value> {
        let tokens = tokenize(text)?;
        if tokens.is_empty() {
            return Err(FormcalcError::Syntax("expression is empty".to_owned()));
        }
        let mut parser = Parser {
            tokens,
            at: 0,
            evaluator: self,
            frame,
        };
        let value = parser.expression(0, 0)?;
        if parser.at != parser.tokens.len() {
            return Err(FormcalcError::Syntax(format!(
                "unexpected trailing input near token {}",
                parser.at + 1
            )));
        }
        Ok(value)
    }
}

impl Default for Evaluator {
    fn default() -> Self {
        Self::new()
    }
}

/// Every `$name` reference in a formula, first-appearance order, deduplicated
/// case-insensitively. Used to seed dependency edges at schema load.
pub fn extract_variables(expression: &str) -> Vec<String> {
    let mut names: Vec<String> = Vec::new();
    for caps in VARIABLE_REFERENCE.captures_iter(expression) {
        if let Some(name) = caps.get(1).map(|m| m.as_str()) {
            if !names.iter().any(|n| n.eq_ignore_ascii_case(name)) {
                names.push(name.to_owned());
            }
        }
    }
    names
}

// ------------- Shared pieces -------------

// Splits a function call body at top-level commas. A single left-to-right
// scan tracks parenthesis depth and quote state so commas inside nested
// calls or string literals are not split points.
fn split_arguments(body: &str) -> Vec<String> {
    let mut arguments = Vec::new();
    let mut current = String::new();
    let mut depth: i32 = 0;
    let mut in_string = false;
    let mut string_char = '\0';
    for c in body.chars() {
        if !in_string && (c == '\'' || c == '"') {
            in_string = true;
            string_char = c;
        } else if in_string && c == string_char {
            in_string = false;
        }
        if !in_string {
            match c {
                '(' => depth += 1,
                ')' => depth -= 1,
                ',' if depth == 0 => {
                    arguments.push(current.trim().to_owned());
                    current.clear();
                    continue;
                }
                _ => {}
            }
        }
        current.push(c);
    }
    if !current.trim().is_empty() {
        arguments.push(current.trim().to_owned());
    }
    arguments
}

// A literal only when the quote wraps the whole text. No escape sequences.
fn quoted_literal(text: &str) -> Option<&str> {
    let bytes = text.as_bytes();
    if bytes.len() >= 2 {
        let (first, last) = (bytes[0], bytes[bytes.len() - 1]);
        if (first == b'\'' && last == b'\'') || (first == b'"' && last == b'"') {
            return Some(&text[1..text.len() - 1]);
        }
    }
    None
}

fn apply_operator(op: &str, left: &Value, right: &Value) -> Result<Value> {
    match op {
        "==" => Ok(Value::Boolean(left == right)),
        "!=" => Ok(Value::Boolean(left != right)),
        ">" => Ok(Value::Boolean(left.compare(right) == Ordering::Greater)),
        "<" => Ok(Value::Boolean(left.compare(right) == Ordering::Less)),
        ">=" => Ok(Value::Boolean(left.compare(right) != Ordering::Less)),
        "<=" => Ok(Value::Boolean(left.compare(right) != Ordering::Greater)),
        "+" => Ok(Value::Number(left.to_decimal()? + right.to_decimal()?)),
        "-" => Ok(Value::Number(left.to_decimal()? - right.to_decimal()?)),
        "*" => Ok(Value::Number(left.to_decimal()? * right.to_decimal()?)),
        "/" => divide(left, right),
        "&&" | "&" => Ok(Value::Boolean(left.truthy()? && right.truthy()?)),
        "||" | "|" => Ok(Value::Boolean(left.truthy()? || right.truthy()?)),
        _ => Err(FormcalcError::Syntax(format!("unknown operator: {}", op))),
    }
}

fn divide(left: &Value, right: &Value) -> Result<Value> {
    let divisor = right.to_decimal()?;
    if divisor.is_zero() {
        return Err(FormcalcError::Evaluation("division by zero".to_owned()));
    }
    Ok(Value::Number(left.to_decimal()? / divisor))
}

// ------------- Builtin dispatch -------------

fn call(func: Func, args: &[Value]) -> Result<Value> {
    match func {
        Func::If => Ok(if args[0].truthy()? {
            args[1].clone()
        } else {
            args[2].clone()
        }),
        Func::And => Ok(Value::Boolean(args[0].truthy()? && args[1].truthy()?)),
        Func::Or => Ok(Value::Boolean(args[0].truthy()? || args[1].truthy()?)),
        Func::Not => Ok(Value::Boolean(!args[0].truthy()?)),
        Func::Equals => Ok(Value::Boolean(args[0] == args[1])),
        Func::GreaterThan => Ok(Value::Boolean(args[0].to_decimal()? > args[1].to_decimal()?)),
        Func::LessThan => Ok(Value::Boolean(args[0].to_decimal()? < args[1].to_decimal()?)),
        Func::Contains => Ok(Value::Boolean(if args[0].is_null() {
            false
        } else {
            args[0].to_text().contains(&args[1].to_text())
        })),
        Func::Length => Ok(Value::Number(BigDecimal::from(
            args[0].to_text().chars().count() as i64,
        ))),
        Func::Upper => Ok(Value::Text(args[0].to_text().to_uppercase())),
        Func::Lower => Ok(Value::Text(args[0].to_text().to_lowercase())),
        Func::Trim => Ok(Value::Text(args[0].to_text().trim().to_owned())),
        Func::Substring => substring(args),
        Func::Concat => Ok(Value::Text(args[0].to_text() + &args[1].to_text())),
        Func::Add => Ok(Value::Number(args[0].to_decimal()? + args[1].to_decimal()?)),
        Func::Subtract => Ok(Value::Number(args[0].to_decimal()? - args[1].to_decimal()?)),
        Func::Multiply => Ok(Value::Number(args[0].to_decimal()? * args[1].to_decimal()?)),
        Func::Divide => divide(&args[0], &args[1]),
        Func::Round => round(args),
        Func::Abs => Ok(Value::Number(args[0].to_decimal()?.abs())),
        Func::Min => Ok(Value::Number(
            args[0].to_decimal()?.min(args[1].to_decimal()?),
        )),
        Func::Max => Ok(Value::Number(
            args[0].to_decimal()?.max(args[1].to_decimal()?),
        )),
        Func::Now => Ok(Value::DateTime(Utc::now().naive_utc())),
        Func::Today => Ok(Value::DateTime(NaiveDateTime::new(
            Utc::now().date_naive(),
            NaiveTime::MIN,
        ))),
        Func::DateAdd => date_add(args),
        Func::DateDiff => date_diff(args),
        Func::FormatDate => format_date(args),
        Func::IsNull => Ok(Value::Boolean(args[0].is_null())),
        Func::IsEmpty => Ok(Value::Boolean(
            args[0].is_null() || args[0].to_text().is_empty(),
        )),
        Func::Coalesce => Ok(if args[0].is_null() {
            args[1].clone()
        } else {
            args[0].clone()
        }),
    }
}

fn substring(args: &[Value]) -> Result<Value> {
    if args[0].is_null() {
        return Ok(Value::Text(String::new()));
    }
    let text = args[0].to_text();
    let start = to_index(&args[1])?;
    let length = to_index(&args[2])?;
    let total = text.chars().count();
    if start > total || length > total - start {
        return Err(FormcalcError::Evaluation(format!(
            "substring range {}..{} is outside a text of length {}",
            start,
            start + length,
            total
        )));
    }
    Ok(Value::Text(text.chars().skip(start).take(length).collect()))
}

fn round(args: &[Value]) -> Result<Value> {
    let digits = to_integer(&args[1])?;
    if digits < 0 {
        return Err(FormcalcError::Evaluation(format!(
            "ROUND digit count must not be negative, got {}",
            digits
        )));
    }
    Ok(Value::Number(
        args[0]
            .to_decimal()?
            .with_scale_round(digits, RoundingMode::HalfEven),
    ))
}

// Whole-number coercion rounds half to even, like the surrounding decimal
// arithmetic.
fn to_integer(value: &Value) -> Result<i64> {
    value
        .to_decimal()?
        .with_scale_round(0, RoundingMode::HalfEven)
        .to_i64()
        .ok_or_else(|| {
            FormcalcError::Evaluation("number is too large for a whole-number argument".to_owned())
        })
}

fn to_index(value: &Value) -> Result<usize> {
    let n = to_integer(value)?;
    usize::try_from(n).map_err(|_| {
        FormcalcError::Evaluation(format!("index must not be negative, got {}", n))
    })
}

fn date_add(args: &[Value]) -> Result<Value> {
    let date = args[0].to_datetime()?;
    let amount = to_integer(&args[1])?;
    let unit = args[2].to_text().to_lowercase();
    let out_of_range =
        || FormcalcError::Evaluation("date arithmetic out of range".to_owned());
    let shifted = match unit.as_str() {
        "days" | "day" | "d" => date.checked_add_signed(
            chrono::Duration::try_days(amount).ok_or_else(out_of_range)?,
        ),
        "months" | "month" | "m" => shift_months(date, amount)?,
        "years" | "year" | "y" => {
            shift_months(date, amount.checked_mul(12).ok_or_else(out_of_range)?)?
        }
        "hours" | "hour" | "h" => date.checked_add_signed(
            chrono::Duration::try_hours(amount).ok_or_else(out_of_range)?,
        ),
        "minutes" | "minute" | "min" => date.checked_add_signed(
            chrono::Duration::try_minutes(amount).ok_or_else(out_of_range)?,
        ),
        "seconds" | "second" | "s" => date.checked_add_signed(
            chrono::Duration::try_seconds(amount).ok_or_else(out_of_range)?,
        ),
        // an unknown unit leaves the date unchanged
        _ => Some(date),
    };
    Ok(Value::DateTime(shifted.ok_or_else(out_of_range)?))
}

fn shift_months(date: NaiveDateTime, amount: i64) -> Result<Option<NaiveDateTime>> {
    let months = u32::try_from(amount.unsigned_abs()).map_err(|_| {
        FormcalcError::Evaluation("date arithmetic out of range".to_owned())
    })?;
    Ok(if amount >= 0 {
        date.checked_add_months(Months::new(months))
    } else {
        date.checked_sub_months(Months::new(months))
    })
}

fn date_diff(args: &[Value]) -> Result<Value> {
    use chrono::Datelike;
    let from = args[0].to_datetime()?;
    let to = args[1].to_datetime()?;
    let unit = args[2].to_text().to_lowercase();
    let delta = to - from;
    let amount = match unit.as_str() {
        "days" | "day" | "d" => BigDecimal::from(delta.num_days()),
        "hours" | "hour" | "h" => BigDecimal::from(delta.num_hours()),
        "minutes" | "minute" | "min" => BigDecimal::from(delta.num_minutes()),
        "seconds" | "second" | "s" => BigDecimal::from(delta.num_seconds()),
        "months" | "month" | "m" => BigDecimal::from(
            i64::from(to.year() - from.year()) * 12
                + (i64::from(to.month()) - i64::from(from.month())),
        ),
        "years" | "year" | "y" => BigDecimal::from(i64::from(to.year() - from.year())),
        // an unknown unit means fractional days
        _ => BigDecimal::from(delta.num_seconds()) / BigDecimal::from(86_400),
    };
    Ok(Value::Number(amount))
}

fn format_date(args: &[Value]) -> Result<Value> {
    let date = args[0].to_datetime()?;
    let pattern = args[1].to_text();
    let items: Vec<Item> = StrftimeItems::new(&pattern).collect();
    if items.iter().any(|item| matches!(item, Item::Error)) {
        return Err(FormcalcError::Evaluation(format!(
            "invalid date format pattern '{}'",
            pattern
        )));
    }
    Ok(Value::Text(
        date.format_with_items(items.into_iter()).to_string(),
    ))
}

// ------------- Precedence mode -------------

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(BigDecimal),
    Text(String),
    Boolean(bool),
    Variable(String),
    Ident(String),
    Open,
    Close,
    Comma,
    Op(&'static str),
}

fn tokenize(text: &str) -> Result<Vec<Token>> {
    let chars: Vec<char> = text.chars().collect();
    let mut tokens = Vec::new();
    let mut at = 0;
    while at < chars.len() {
        let c = chars[at];
        if c.is_whitespace() {
            at += 1;
            continue;
        }
        match c {
            '(' => {
                tokens.push(Token::Open);
                at += 1;
            }
            ')' => {
                tokens.push(Token::Close);
                at += 1;
            }
            ',' => {
                tokens.push(Token::Comma);
                at += 1;
            }
            '\'' | '"' => {
                let quote = c;
                let mut literal = String::new();
                at += 1;
                loop {
                    match chars.get(at) {
                        Some(&n) if n == quote => {
                            at += 1;
                            break;
                        }
                        Some(&n) => {
                            literal.push(n);
                            at += 1;
                        }
                        None => {
                            return Err(FormcalcError::Syntax(
                                "unterminated string literal".to_owned(),
                            ));
                        }
                    }
                }
                tokens.push(Token::Text(literal));
            }
            '$' => {
                let mut name = String::new();
                at += 1;
                while let Some(&n) = chars.get(at) {
                    if n.is_ascii_alphanumeric() || n == '_' {
                        name.push(n);
                        at += 1;
                    } else {
                        break;
                    }
                }
                if name.is_empty() || name.starts_with(|n: char| n.is_ascii_digit()) {
                    return Err(FormcalcError::Syntax(
                        "'$' must be followed by a field name".to_owned(),
                    ));
                }
                tokens.push(Token::Variable(name));
            }
            '&' => {
                if chars.get(at + 1) == Some(&'&') {
                    tokens.push(Token::Op("&&"));
                    at += 2;
                } else {
                    tokens.push(Token::Op("&"));
                    at += 1;
                }
            }
            '|' => {
                if chars.get(at + 1) == Some(&'|') {
                    tokens.push(Token::Op("||"));
                    at += 2;
                } else {
                    tokens.push(Token::Op("|"));
                    at += 1;
                }
            }
            '=' => {
                if chars.get(at + 1) == Some(&'=') {
                    tokens.push(Token::Op("=="));
                    at += 2;
                } else {
                    return Err(FormcalcError::Syntax(
                        "unexpected '='; did you mean '=='?".to_owned(),
                    ));
                }
            }
            '!' => {
                if chars.get(at + 1) == Some(&'=') {
                    tokens.push(Token::Op("!="));
                    at += 2;
                } else {
                    return Err(FormcalcError::Syntax("unexpected '!'".to_owned()));
                }
            }
            '>' => {
                if chars.get(at + 1) == Some(&'=') {
                    tokens.push(Token::Op(">="));
                    at += 2;
                } else {
                    tokens.push(Token::Op(">"));
                    at += 1;
                }
            }
            '<' => {
                if chars.get(at + 1) == Some(&'=') {
                    tokens.push(Token::Op("<="));
                    at += 2;
                } else {
                    tokens.push(Token::Op("<"));
                    at += 1;
                }
            }
            '+' => {
                tokens.push(Token::Op("+"));
                at += 1;
            }
            '-' => {
                tokens.push(Token::Op("-"));
                at += 1;
            }
            '*' => {
                tokens.push(Token::Op("*"));
                at += 1;
            }
            '/' => {
                tokens.push(Token::Op("/"));
                at += 1;
            }
            _ if c.is_ascii_digit() || c == '.' => {
                let mut number = String::new();
                while let Some(&n) = chars.get(at) {
                    if n.is_ascii_digit() || n == '.' {
                        number.push(n);
                        at += 1;
                    } else {
                        break;
                    }
                }
                // scientific notation: e or E, optional sign, digits
                if matches!(chars.get(at), Some(&'e') | Some(&'E')) {
                    let mut peek = at + 1;
                    if matches!(chars.get(peek), Some(&'+') | Some(&'-')) {
                        peek += 1;
                    }
                    if matches!(chars.get(peek), Some(n) if n.is_ascii_digit()) {
                        while at < peek {
                            number.push(chars[at]);
                            at += 1;
                        }
                        while let Some(&n) = chars.get(at) {
                            if n.is_ascii_digit() {
                                number.push(n);
                                at += 1;
                            } else {
                                break;
                            }
                        }
                    }
                }
                let parsed = BigDecimal::from_str(&number).map_err(|_| {
                    FormcalcError::Syntax(format!("malformed number '{}'", number))
                })?;
                tokens.push(Token::Number(parsed));
            }
            _ if c.is_alphabetic() || c == '_' => {
                let mut word = String::new();
                while let Some(&n) = chars.get(at) {
                    if n.is_alphanumeric() || n == '_' {
                        word.push(n);
                        at += 1;
                    } else {
                        break;
                    }
                }
                if word.eq_ignore_ascii_case("true") {
                    tokens.push(Token::Boolean(true));
                } else if word.eq_ignore_ascii_case("false") {
                    tokens.push(Token::Boolean(false));
                } else {
                    tokens.push(Token::Ident(word));
                }
            }
            other => {
                return Err(FormcalcError::Syntax(format!(
                    "unexpected character '{}'",
                    other
                )));
            }
        }
    }
    Ok(tokens)
}

fn binding_power(op: &str) -> u8 {
    match op {
        "||" | "|" => 1,
        "&&" | "&" => 2,
        "==" | "!=" => 3,
        ">" | "<" | ">=" | "<=" => 4,
        "+" | "-" => 5,
        "*" | "/" => 6,
        _ => 0,
    }
}

// Evaluates while climbing; the grammar is small enough that no tree is
// worth keeping. Function arguments are evaluated eagerly, exactly as the
// legacy scan does.
struct Parser<'a, 'f> {
    tokens: Vec<Token>,
    at: usize,
    evaluator: &'a Evaluator,
    frame: &'a Frame<'f>,
}

impl Parser<'_, '_> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.at)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.at).cloned();
        if token.is_some() {
            self.at += 1;
        }
        token
    }

    fn expression(&mut self, min_bp: u8, depth: usize) -> Result<Value> {
        self.frame.guard(depth)?;
        let mut left = self.primary(depth)?;
        while let Some(Token::Op(op)) = self.peek() {
            let op = *op;
            let bp = binding_power(op);
            if bp < min_bp {
                break;
            }
            self.at += 1;
            let right = self.expression(bp + 1, depth + 1)?;
            left = apply_operator(op, &left, &right)?;
        }
        Ok(left)
    }

    fn primary(&mut self, depth: usize) -> Result<Value> {
        self.frame.guard(depth)?;
        match self.next() {
            Some(Token::Number(n)) => Ok(Value::Number(n)),
            Some(Token::Text(s)) => Ok(Value::Text(s)),
            Some(Token::Boolean(b)) => Ok(Value::Boolean(b)),
            Some(Token::Variable(name)) => Ok(self
                .frame
                .variables
                .get(&name)
                .cloned()
                .unwrap_or(Value::Null)),
            Some(Token::Ident(name)) => {
                if self.next() != Some(Token::Open) {
                    return Err(FormcalcError::Syntax(format!(
                        "expected '(' after function name '{}'",
                        name
                    )));
                }
                let mut args = Vec::new();
                if self.peek() == Some(&Token::Close) {
                    self.at += 1;
                } else {
                    loop {
                        args.push(self.expression(0, depth + 1)?);
                        match self.next() {
                            Some(Token::Comma) => continue,
                            Some(Token::Close) => break,
                            _ => {
                                return Err(FormcalcError::Syntax(format!(
                                    "unterminated argument list for '{}'",
                                    name
                                )));
                            }
                        }
                    }
                }
                self.evaluator.call_by_name(&name, &args)
            }
            Some(Token::Open) => {
                let value = self.expression(0, depth + 1)?;
                if self.next() != Some(Token::Close) {
                    return Err(FormcalcError::Syntax(
                        "expected closing parenthesis".to_owned(),
                    ));
                }
                Ok(value)
            }
            Some(Token::Op("-")) => {
                let operand = self.primary(depth + 1)?;
                Ok(Value::Number(-operand.to_decimal()?))
            }
            Some(Token::Op("+")) => {
                let operand = self.primary(depth + 1)?;
                Ok(Value::Number(operand.to_decimal()?))
            }
            Some(other) => Err(FormcalcError::Syntax(format!(
                "unexpected token {:?}",
                other
            ))),
            None => Err(FormcalcError::Syntax(
                "unexpected end of expression".to_owned(),
            )),
        }
    }
}
