//! Expression evaluation over the in-memory row model.
//!
//! Evaluation never yields: everything here is synchronous. User-code
//! calls (`functionCall`) are rejected on this path.

use std::cmp::Ordering;
use std::collections::HashMap;

use chrono::{SecondsFormat, Utc};
use serde_json::Value;

use avaast_core::expr::{ArithmeticOp, ComparisonOp, Expression, LogicalOp};

use crate::error::{QueryError, QueryResult};
use crate::value::{
    as_number, compare_values, is_truthy, lookup_field, number_value, to_display_string,
    values_equal, Row,
};

/// Everything an expression can see: the current row, the group bag when
/// evaluating downstream of a `group` step, and the query parameters.
pub struct EvalContext<'a> {
    pub row: &'a Row,
    pub bag: Option<&'a [Row]>,
    pub params: &'a HashMap<String, String>,
}

impl<'a> EvalContext<'a> {
    pub fn new(row: &'a Row, params: &'a HashMap<String, String>) -> Self {
        Self {
            row,
            bag: None,
            params,
        }
    }

    pub fn with_bag(mut self, bag: Option<&'a [Row]>) -> Self {
        self.bag = bag;
        self
    }

    fn member<'b>(&'b self, row: &'b Row) -> EvalContext<'b> {
        EvalContext {
            row,
            bag: None,
            params: self.params,
        }
    }
}

/// Evaluate one expression.
pub fn evaluate(expr: &Expression, ctx: &EvalContext) -> QueryResult<Value> {
    match expr {
        Expression::FieldRef {
            source_alias,
            field_path,
        } => {
            if source_alias == "$params" {
                Ok(ctx
                    .params
                    .get(field_path)
                    .map(|v| Value::String(v.clone()))
                    .unwrap_or(Value::Null))
            } else {
                Ok(lookup_field(ctx.row, source_alias, field_path))
            }
        }

        Expression::Literal {
            string_value,
            integer_value,
            boolean_value,
        } => Ok(if let Some(s) = string_value {
            Value::String(s.clone())
        } else if let Some(i) = integer_value {
            Value::Number((*i).into())
        } else if let Some(b) = boolean_value {
            Value::Bool(*b)
        } else {
            Value::Null
        }),

        Expression::Comparison { op, left, right } => compare(*op, left, right.as_deref(), ctx),

        Expression::LogicalOp { op, operands } => logical(*op, operands, ctx),

        Expression::ArithmeticOp { op, left, right } => {
            let l = evaluate(left, ctx)?;
            let r = evaluate(right, ctx)?;
            Ok(arithmetic(*op, &l, &r))
        }

        Expression::BuiltinCall { name, args } => builtin(name, args, ctx),

        Expression::FunctionCall { function, .. } => Err(QueryError::UnsupportedExpression(
            format!("user function {function} cannot run in synchronous evaluation"),
        )),

        Expression::CaseExpression {
            branches,
            else_value,
        } => {
            for branch in branches {
                if is_truthy(&evaluate(&branch.when, ctx)?) {
                    return evaluate(&branch.then, ctx);
                }
            }
            match else_value {
                Some(e) => evaluate(e, ctx),
                None => Ok(Value::Null),
            }
        }
    }
}

fn compare(
    op: ComparisonOp,
    left: &Expression,
    right: Option<&Expression>,
    ctx: &EvalContext,
) -> QueryResult<Value> {
    let l = evaluate(left, ctx)?;

    // The two null-predicates are the only operators without a right side.
    match op {
        ComparisonOp::IsNull => return Ok(Value::Bool(l.is_null())),
        ComparisonOp::IsNotNull => return Ok(Value::Bool(!l.is_null())),
        _ => {}
    }
    let right = right.ok_or_else(|| {
        QueryError::Eval(format!("comparison {op:?} requires a right operand"))
    })?;
    let r = evaluate(right, ctx)?;

    let result = match op {
        ComparisonOp::Eq => values_equal(&l, &r),
        ComparisonOp::Neq => !values_equal(&l, &r),
        ComparisonOp::Gt => matches!(compare_values(&l, &r), Some(Ordering::Greater)),
        ComparisonOp::Gte => matches!(
            compare_values(&l, &r),
            Some(Ordering::Greater) | Some(Ordering::Equal)
        ),
        ComparisonOp::Lt => matches!(compare_values(&l, &r), Some(Ordering::Less)),
        ComparisonOp::Lte => matches!(
            compare_values(&l, &r),
            Some(Ordering::Less) | Some(Ordering::Equal)
        ),
        ComparisonOp::Like => like_matches(&l, &r)?,
        ComparisonOp::In => in_array(&l, &r)?,
        ComparisonOp::NotIn => !in_array(&l, &r)?,
        ComparisonOp::Between => between(&l, &r)?,
        ComparisonOp::IsNull | ComparisonOp::IsNotNull => unreachable!(),
    };
    Ok(Value::Bool(result))
}

/// `%` matches any run, `_` matches one character; anchored at both ends.
fn like_matches(left: &Value, pattern: &Value) -> QueryResult<bool> {
    let (Value::String(text), Value::String(pattern)) = (left, pattern) else {
        return Ok(false);
    };
    let mut re = String::with_capacity(pattern.len() + 2);
    re.push('^');
    for ch in pattern.chars() {
        match ch {
            '%' => re.push_str(".*"),
            '_' => re.push('.'),
            other => re.push_str(&regex::escape(&other.to_string())),
        }
    }
    re.push('$');
    let regex = regex::Regex::new(&re)
        .map_err(|e| QueryError::Eval(format!("bad like pattern: {e}")))?;
    Ok(regex.is_match(text))
}

fn in_array(left: &Value, right: &Value) -> QueryResult<bool> {
    let Value::Array(items) = right else {
        return Err(QueryError::Eval(
            "in/notIn require an array right operand".to_string(),
        ));
    };
    Ok(items.iter().any(|item| values_equal(left, item)))
}

/// Inclusive range check against `[lo, hi]`.
fn between(left: &Value, right: &Value) -> QueryResult<bool> {
    let Value::Array(bounds) = right else {
        return Err(QueryError::Eval(
            "between requires an array right operand".to_string(),
        ));
    };
    let [lo, hi] = bounds.as_slice() else {
        return Err(QueryError::Eval(
            "between requires exactly [lo, hi]".to_string(),
        ));
    };
    let ge_lo = matches!(
        compare_values(left, lo),
        Some(Ordering::Greater) | Some(Ordering::Equal)
    );
    let le_hi = matches!(
        compare_values(left, hi),
        Some(Ordering::Less) | Some(Ordering::Equal)
    );
    Ok(ge_lo && le_hi)
}

fn logical(op: LogicalOp, operands: &[Expression], ctx: &EvalContext) -> QueryResult<Value> {
    match op {
        LogicalOp::And => {
            for operand in operands {
                if !is_truthy(&evaluate(operand, ctx)?) {
                    return Ok(Value::Bool(false));
                }
            }
            Ok(Value::Bool(true))
        }
        LogicalOp::Or => {
            for operand in operands {
                if is_truthy(&evaluate(operand, ctx)?) {
                    return Ok(Value::Bool(true));
                }
            }
            Ok(Value::Bool(false))
        }
        LogicalOp::Not => {
            let [operand] = operands else {
                return Err(QueryError::Eval("not takes exactly one operand".to_string()));
            };
            Ok(Value::Bool(!is_truthy(&evaluate(operand, ctx)?)))
        }
    }
}

fn arithmetic(op: ArithmeticOp, left: &Value, right: &Value) -> Value {
    let (Some(l), Some(r)) = (as_number(left), as_number(right)) else {
        return Value::Null;
    };
    match op {
        ArithmeticOp::Add => number_value(l + r),
        ArithmeticOp::Subtract => number_value(l - r),
        ArithmeticOp::Multiply => number_value(l * r),
        // Division and modulus by zero evaluate to 0, kept for
        // compatibility with existing published views.
        ArithmeticOp::Divide => {
            if r == 0.0 {
                Value::Number(0.into())
            } else {
                number_value(l / r)
            }
        }
        ArithmeticOp::Modulo => {
            if r == 0.0 {
                Value::Number(0.into())
            } else {
                number_value(l % r)
            }
        }
    }
}

fn builtin(name: &str, args: &[Expression], ctx: &EvalContext) -> QueryResult<Value> {
    match name {
        "count" | "sum" | "avg" | "min" | "max" => aggregate(name, args, ctx),

        "concat" => {
            let mut out = String::new();
            for arg in args {
                out.push_str(&to_display_string(&evaluate(arg, ctx)?));
            }
            Ok(Value::String(out))
        }
        "lower" => string_fn(args, ctx, |s| Value::String(s.to_lowercase())),
        "upper" => string_fn(args, ctx, |s| Value::String(s.to_uppercase())),
        "trim" => string_fn(args, ctx, |s| Value::String(s.trim().to_string())),
        "length" => {
            let v = eval_single(args, ctx, "length")?;
            Ok(match v {
                Value::String(s) => Value::Number((s.chars().count() as i64).into()),
                Value::Array(items) => Value::Number((items.len() as i64).into()),
                Value::Null => Value::Null,
                _ => Value::Null,
            })
        }
        "substring" => substring(args, ctx),

        "abs" => math_fn(args, ctx, f64::abs),
        "round" => math_fn(args, ctx, f64::round),
        "floor" => math_fn(args, ctx, f64::floor),
        "ceil" => math_fn(args, ctx, f64::ceil),

        "coalesce" => {
            for arg in args {
                let v = evaluate(arg, ctx)?;
                if !v.is_null() {
                    return Ok(v);
                }
            }
            Ok(Value::Null)
        }
        "now" => Ok(Value::String(
            Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        )),

        other => Err(QueryError::Eval(format!("unknown builtin: {other}"))),
    }
}

/// Aggregates consult the group bag. Without a bag, a single argument
/// that evaluates to a collection is aggregated; anything else passes
/// through unchanged.
fn aggregate(name: &str, args: &[Expression], ctx: &EvalContext) -> QueryResult<Value> {
    if let Some(bag) = ctx.bag {
        let mut values = Vec::with_capacity(bag.len());
        for member in bag {
            let value = match args.first() {
                Some(arg) => evaluate(arg, &ctx.member(member))?,
                // Bare count() counts group members.
                None => Value::Bool(true),
            };
            if !value.is_null() {
                values.push(value);
            }
        }
        return Ok(fold_aggregate(name, &values));
    }

    let value = eval_single(args, ctx, name)?;
    match value {
        Value::Array(items) => {
            let non_null: Vec<Value> = items.into_iter().filter(|v| !v.is_null()).collect();
            Ok(fold_aggregate(name, &non_null))
        }
        other => Ok(other),
    }
}

fn fold_aggregate(name: &str, values: &[Value]) -> Value {
    match name {
        "count" => Value::Number((values.len() as i64).into()),
        "sum" => number_value(values.iter().filter_map(as_number).sum()),
        "avg" => {
            let nums: Vec<f64> = values.iter().filter_map(as_number).collect();
            if nums.is_empty() {
                Value::Null
            } else {
                number_value(nums.iter().sum::<f64>() / nums.len() as f64)
            }
        }
        "min" => extremum(values, Ordering::Less),
        "max" => extremum(values, Ordering::Greater),
        _ => Value::Null,
    }
}

fn extremum(values: &[Value], wanted: Ordering) -> Value {
    let mut best: Option<&Value> = None;
    for value in values {
        match best {
            None => best = Some(value),
            Some(current) => {
                if compare_values(value, current) == Some(wanted) {
                    best = Some(value);
                }
            }
        }
    }
    best.cloned().unwrap_or(Value::Null)
}

fn eval_single(args: &[Expression], ctx: &EvalContext, name: &str) -> QueryResult<Value> {
    let [arg] = args else {
        return Err(QueryError::Eval(format!("{name} takes exactly one argument")));
    };
    evaluate(arg, ctx)
}

fn string_fn(
    args: &[Expression],
    ctx: &EvalContext,
    f: impl Fn(&str) -> Value,
) -> QueryResult<Value> {
    let v = eval_single(args, ctx, "string builtin")?;
    Ok(match v {
        Value::String(s) => f(&s),
        Value::Null => Value::Null,
        other => f(&to_display_string(&other)),
    })
}

fn math_fn(args: &[Expression], ctx: &EvalContext, f: impl Fn(f64) -> f64) -> QueryResult<Value> {
    let v = eval_single(args, ctx, "math builtin")?;
    Ok(match as_number(&v) {
        Some(n) => number_value(f(n)),
        None => Value::Null,
    })
}

/// `substring(text, start, length?)` — zero-based, clamped, by character.
fn substring(args: &[Expression], ctx: &EvalContext) -> QueryResult<Value> {
    if args.len() < 2 || args.len() > 3 {
        return Err(QueryError::Eval(
            "substring takes (text, start, length?)".to_string(),
        ));
    }
    let text = evaluate(&args[0], ctx)?;
    let Value::String(text) = text else {
        return Ok(Value::Null);
    };
    let start = as_number(&evaluate(&args[1], ctx)?).unwrap_or(0.0).max(0.0) as usize;
    let chars: Vec<char> = text.chars().collect();
    let start = start.min(chars.len());
    let end = match args.get(2) {
        Some(len_expr) => {
            let len = as_number(&evaluate(len_expr, ctx)?).unwrap_or(0.0).max(0.0) as usize;
            (start + len).min(chars.len())
        }
        None => chars.len(),
    };
    Ok(Value::String(chars[start..end].iter().collect()))
}
