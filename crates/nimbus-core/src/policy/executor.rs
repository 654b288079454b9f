//! Pipeline executor
//!
//! Evaluates an attribute's pipeline against one incoming value. Stages run
//! strictly in declared order; each may pass the value through, transform
//! it, suppress propagation, raise a side effect, or defer to the windowed
//! scheduler. Suppression is an outcome, not an error.

use super::function::{FunctionKind, PipelineFunction};
use crate::message::AlertSeverity;
use crate::time::Timestamp;
use crate::window::{WindowKey, WindowRequest};
use serde_json::{json, Map, Value};
use tracing::warn;

/// Alert raised by an `alert` stage, independent of the attribute's own
/// emission.
#[derive(Debug, Clone)]
pub struct AlertEvent {
    pub urn: String,
    pub severity: AlertSeverity,
    pub fields: Map<String, Value>,
}

/// Device action requested by an `action` stage.
#[derive(Debug, Clone)]
pub struct ActionRequest {
    pub name: String,
    pub arguments: Vec<Value>,
}

/// Terminal outcome of one pipeline evaluation.
#[derive(Debug, Clone)]
pub enum StageOutcome {
    /// Value passed the whole pipeline and should be emitted
    Emit(Value),
    /// An event filter stopped propagation
    Suppressed,
    /// A windowed stage stored the sample; the result arrives later
    /// through the window-fire path
    Deferred(WindowRequest),
}

/// Result of [`apply`]: the outcome plus any side effects raised along the
/// way. Side effects are produced even when the value itself is suppressed
/// downstream.
#[derive(Debug, Clone)]
pub struct PipelineRun {
    pub outcome: StageOutcome,
    pub alerts: Vec<AlertEvent>,
    pub actions: Vec<ActionRequest>,
}

impl PipelineRun {
    fn emit(value: Value, alerts: Vec<AlertEvent>, actions: Vec<ActionRequest>) -> Self {
        Self {
            outcome: StageOutcome::Emit(value),
            alerts,
            actions,
        }
    }
}

/// Evaluate a full pipeline against an incoming value.
pub fn apply(
    pipeline: &[PipelineFunction],
    attribute: &str,
    current: &Value,
    prior: Option<&Value>,
    now: Timestamp,
) -> PipelineRun {
    apply_from(pipeline, attribute, current, prior, now, 0)
}

/// Evaluate a pipeline starting at `from_stage`. The window-fire path uses
/// this to resume downstream of a windowed stage with the aggregate as the
/// current value.
pub fn apply_from(
    pipeline: &[PipelineFunction],
    attribute: &str,
    current: &Value,
    prior: Option<&Value>,
    now: Timestamp,
    from_stage: usize,
) -> PipelineRun {
    let _ = now;
    let mut value = current.clone();
    let mut alerts = Vec::new();
    let mut actions = Vec::new();

    for (index, stage) in pipeline.iter().enumerate().skip(from_stage) {
        match &stage.kind {
            FunctionKind::EventFilter => {
                if filter_suppresses(stage, &value, prior) {
                    return PipelineRun {
                        outcome: StageOutcome::Suppressed,
                        alerts,
                        actions,
                    };
                }
            }
            FunctionKind::ComputedMetric => {
                value = compute_metric(stage, attribute, &value, prior);
            }
            FunctionKind::Alert => {
                if let Some(alert) = build_alert(stage, attribute, &value) {
                    alerts.push(alert);
                }
            }
            FunctionKind::Action => {
                if let Some(action) = build_action(stage) {
                    actions.push(action);
                }
            }
            kind if kind.is_windowed() => {
                match window_key(stage) {
                    Some(key) => {
                        return PipelineRun {
                            outcome: StageOutcome::Deferred(WindowRequest {
                                key,
                                kind: kind.clone(),
                                attribute: attribute.to_string(),
                                resume_from: index + 1,
                                sample: value,
                            }),
                            alerts,
                            actions,
                        };
                    }
                    None => {
                        warn!(
                            attribute,
                            stage = kind.as_str(),
                            "Windowed stage without a window parameter, passing through"
                        );
                    }
                }
            }
            FunctionKind::Opaque(id) => {
                // Forward-compatibility stage: pass through untouched.
                let _ = id;
            }
            _ => unreachable!("windowed kinds handled above"),
        }
    }

    PipelineRun::emit(value, alerts, actions)
}

/// Whether an event filter stage suppresses this update.
fn filter_suppresses(stage: &PipelineFunction, value: &Value, prior: Option<&Value>) -> bool {
    match stage.str_param("condition") {
        Some("noChange") => prior == Some(value),
        Some("lessThan") => match (value.as_f64(), stage.f64_param("threshold")) {
            (Some(v), Some(threshold)) => v < threshold,
            _ => false,
        },
        Some("greaterThan") => match (value.as_f64(), stage.f64_param("threshold")) {
            (Some(v), Some(threshold)) => v > threshold,
            _ => false,
        },
        Some(other) => {
            warn!(condition = other, "Unknown event filter condition, passing through");
            false
        }
        None => false,
    }
}

/// Apply a computed-metric formula; a bad formula passes the value through
/// unchanged (reported, not retried).
fn compute_metric(
    stage: &PipelineFunction,
    attribute: &str,
    value: &Value,
    prior: Option<&Value>,
) -> Value {
    let Some(formula) = stage.str_param("formula") else {
        warn!(attribute, "computedMetric without a formula, passing through");
        return value.clone();
    };
    let Some(current) = value.as_f64() else {
        warn!(attribute, "computedMetric over non-numeric value, passing through");
        return value.clone();
    };

    match formula::eval(formula, current, prior.and_then(Value::as_f64)) {
        Ok(result) => json!(result),
        Err(e) => {
            warn!(attribute, formula, error = %e, "Formula evaluation failed, passing through");
            value.clone()
        }
    }
}

fn build_alert(stage: &PipelineFunction, attribute: &str, value: &Value) -> Option<AlertEvent> {
    let Some(urn) = stage.str_param("urn") else {
        warn!(attribute, "alert stage without a urn, skipping");
        return None;
    };

    let severity = match stage.str_param("severity") {
        Some("low") => AlertSeverity::Low,
        Some("normal") => AlertSeverity::Normal,
        Some("critical") => AlertSeverity::Critical,
        _ => AlertSeverity::Significant,
    };

    // Field values equal to "$(value)" are replaced with the current value.
    let mut fields = Map::new();
    if let Some(declared) = stage.object_param("fields") {
        for (key, field) in declared {
            let resolved = match field.as_str() {
                Some("$(value)") => value.clone(),
                _ => field.clone(),
            };
            fields.insert(key.clone(), resolved);
        }
    } else {
        fields.insert(attribute.to_string(), value.clone());
    }

    Some(AlertEvent {
        urn: urn.to_string(),
        severity,
        fields,
    })
}

fn build_action(stage: &PipelineFunction) -> Option<ActionRequest> {
    let Some(name) = stage.str_param("name") else {
        warn!("action stage without a name, skipping");
        return None;
    };

    let arguments = stage
        .parameters
        .get("arguments")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    Some(ActionRequest {
        name: name.to_string(),
        arguments,
    })
}

fn window_key(stage: &PipelineFunction) -> Option<WindowKey> {
    let window_ms = stage.duration_ms_param("window").filter(|w| *w > 0)?;
    let slide_ms = stage
        .duration_ms_param("slide")
        .filter(|s| *s > 0)
        .unwrap_or(window_ms);
    Some(WindowKey::new(window_ms, slide_ms))
}

mod formula {
    //! Arithmetic over `value` and `prior`: `+ - * /`, parentheses, unary
    //! minus, numeric literals. Small recursive descent, no allocation
    //! beyond the token list.

    use std::fmt;

    #[derive(Debug, Clone, Copy, PartialEq)]
    enum Token {
        Number(f64),
        Value,
        Prior,
        Plus,
        Minus,
        Star,
        Slash,
        Open,
        Close,
    }

    #[derive(Debug, PartialEq)]
    pub enum FormulaError {
        UnexpectedChar(char),
        UnexpectedEnd,
        TrailingInput,
        PriorUnavailable,
        DivisionByZero,
    }

    impl fmt::Display for FormulaError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            match self {
                Self::UnexpectedChar(c) => write!(f, "unexpected character {c:?}"),
                Self::UnexpectedEnd => write!(f, "unexpected end of formula"),
                Self::TrailingInput => write!(f, "trailing input after expression"),
                Self::PriorUnavailable => write!(f, "formula references prior but no prior value exists"),
                Self::DivisionByZero => write!(f, "division by zero"),
            }
        }
    }

    pub fn eval(src: &str, value: f64, prior: Option<f64>) -> Result<f64, FormulaError> {
        let tokens = tokenize(src)?;
        let mut parser = Parser {
            tokens: &tokens,
            pos: 0,
            value,
            prior,
        };
        let result = parser.expr()?;
        if parser.pos != tokens.len() {
            return Err(FormulaError::TrailingInput);
        }
        Ok(result)
    }

    fn tokenize(src: &str) -> Result<Vec<Token>, FormulaError> {
        let mut tokens = Vec::new();
        let mut chars = src.char_indices().peekable();

        while let Some(&(start, c)) = chars.peek() {
            match c {
                ' ' | '\t' => {
                    chars.next();
                }
                '+' => {
                    chars.next();
                    tokens.push(Token::Plus);
                }
                '-' => {
                    chars.next();
                    tokens.push(Token::Minus);
                }
                '*' => {
                    chars.next();
                    tokens.push(Token::Star);
                }
                '/' => {
                    chars.next();
                    tokens.push(Token::Slash);
                }
                '(' => {
                    chars.next();
                    tokens.push(Token::Open);
                }
                ')' => {
                    chars.next();
                    tokens.push(Token::Close);
                }
                c if c.is_ascii_digit() || c == '.' => {
                    let mut end = start;
                    while let Some(&(i, c)) = chars.peek() {
                        if c.is_ascii_digit() || c == '.' {
                            end = i + c.len_utf8();
                            chars.next();
                        } else {
                            break;
                        }
                    }
                    let literal = &src[start..end];
                    let number = literal
                        .parse::<f64>()
                        .map_err(|_| FormulaError::UnexpectedChar(c))?;
                    tokens.push(Token::Number(number));
                }
                c if c.is_ascii_alphabetic() => {
                    let mut end = start;
                    while let Some(&(i, c)) = chars.peek() {
                        if c.is_ascii_alphanumeric() || c == '_' {
                            end = i + c.len_utf8();
                            chars.next();
                        } else {
                            break;
                        }
                    }
                    match &src[start..end] {
                        "value" => tokens.push(Token::Value),
                        "prior" => tokens.push(Token::Prior),
                        _ => return Err(FormulaError::UnexpectedChar(c)),
                    }
                }
                c => return Err(FormulaError::UnexpectedChar(c)),
            }
        }

        Ok(tokens)
    }

    struct Parser<'a> {
        tokens: &'a [Token],
        pos: usize,
        value: f64,
        prior: Option<f64>,
    }

    impl Parser<'_> {
        fn peek(&self) -> Option<Token> {
            self.tokens.get(self.pos).copied()
        }

        fn next(&mut self) -> Result<Token, FormulaError> {
            let token = self.peek().ok_or(FormulaError::UnexpectedEnd)?;
            self.pos += 1;
            Ok(token)
        }

        fn expr(&mut self) -> Result<f64, FormulaError> {
            let mut left = self.term()?;
            while let Some(op @ (Token::Plus | Token::Minus)) = self.peek() {
                self.pos += 1;
                let right = self.term()?;
                left = match op {
                    Token::Plus => left + right,
                    _ => left - right,
                };
            }
            Ok(left)
        }

        fn term(&mut self) -> Result<f64, FormulaError> {
            let mut left = self.factor()?;
            while let Some(op @ (Token::Star | Token::Slash)) = self.peek() {
                self.pos += 1;
                let right = self.factor()?;
                left = match op {
                    Token::Star => left * right,
                    _ => {
                        if right == 0.0 {
                            return Err(FormulaError::DivisionByZero);
                        }
                        left / right
                    }
                };
            }
            Ok(left)
        }

        fn factor(&mut self) -> Result<f64, FormulaError> {
            match self.next()? {
                Token::Number(n) => Ok(n),
                Token::Value => Ok(self.value),
                Token::Prior => self.prior.ok_or(FormulaError::PriorUnavailable),
                Token::Minus => Ok(-self.factor()?),
                Token::Open => {
                    let inner = self.expr()?;
                    match self.next()? {
                        Token::Close => Ok(inner),
                        _ => Err(FormulaError::UnexpectedEnd),
                    }
                }
                _ => Err(FormulaError::UnexpectedEnd),
            }
        }
    }

}
