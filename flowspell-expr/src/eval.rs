// ABOUTME: Evaluator for the transform expression sub-language over JSON values
// ABOUTME: Pure and deterministic; absent references resolve to null

use crate::ast::{BinaryOp, Expr, UnaryOp};
use crate::parser::parse;
use crate::template::render;
use crate::{ExprError, ExprResult};
use serde_json::{Map, Value};

/// Parse and evaluate `src` against a scope object.
pub fn evaluate(src: &str, scope: &Map<String, Value>) -> ExprResult<Value> {
    let expr = parse(src)?;
    Evaluator::new(scope).eval(&expr)
}

/// JS-like truthiness: null, false, 0, NaN, and "" are falsy; everything
/// else (including empty arrays and objects) is truthy.
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0 && !f.is_nan()).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// Expression evaluator. Lambda parameters shadow scope names while a
/// `.filter`/`.map` body runs.
pub struct Evaluator<'a> {
    scope: &'a Map<String, Value>,
    bindings: Vec<(String, Value)>,
}

impl<'a> Evaluator<'a> {
    pub fn new(scope: &'a Map<String, Value>) -> Self {
        Self {
            scope,
            bindings: Vec::new(),
        }
    }

    pub fn eval(&mut self, expr: &Expr) -> ExprResult<Value> {
        match expr {
            Expr::Null => Ok(Value::Null),
            Expr::Bool(b) => Ok(Value::Bool(*b)),
            Expr::Int(n) => Ok(Value::from(*n)),
            Expr::Float(f) => Ok(number_from_f64(*f)),
            Expr::Str(s) => Ok(Value::String(s.clone())),
            Expr::Ident(name) => Ok(self.lookup(name)),
            Expr::Array(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    out.push(self.eval(item)?);
                }
                Ok(Value::Array(out))
            }
            Expr::Member { object, property } => self.eval_member(object, property),
            Expr::Index { object, index } => self.eval_index(object, index),
            Expr::Call { callee, args } => self.eval_call(callee, args),
            Expr::Unary { op, operand } => {
                let value = self.eval(operand)?;
                match op {
                    UnaryOp::Not => Ok(Value::Bool(!truthy(&value))),
                    UnaryOp::Neg => {
                        let n = as_number(&value).ok_or_else(|| {
                            ExprError::Eval("unary '-' requires a number".into())
                        })?;
                        Ok(number_from_f64(-n))
                    }
                }
            }
            Expr::Binary { op, left, right } => self.eval_binary(*op, left, right),
            Expr::Ternary {
                condition,
                then,
                otherwise,
            } => {
                let cond = self.eval(condition)?;
                if truthy(&cond) {
                    self.eval(then)
                } else {
                    self.eval(otherwise)
                }
            }
            Expr::Lambda { .. } => Err(ExprError::Eval(
                "lambdas are only valid as filter/map arguments".into(),
            )),
        }
    }

    fn lookup(&self, name: &str) -> Value {
        for (param, value) in self.bindings.iter().rev() {
            if param == name {
                return value.clone();
            }
        }
        self.scope.get(name).cloned().unwrap_or(Value::Null)
    }

    fn eval_member(&mut self, object: &Expr, property: &str) -> ExprResult<Value> {
        if is_namespace(object) {
            return Err(ExprError::Eval(format!(
                "'{property}' must be called as a function"
            )));
        }
        let value = self.eval(object)?;
        if property == "length" {
            return length_of(&value);
        }
        match value {
            Value::Null => Err(ExprError::Eval(format!(
                "cannot read property '{property}' of undefined"
            ))),
            Value::Object(map) => Ok(map.get(property).cloned().unwrap_or(Value::Null)),
            _ => Ok(Value::Null),
        }
    }

    fn eval_index(&mut self, object: &Expr, index: &Expr) -> ExprResult<Value> {
        let target = self.eval(object)?;
        let key = self.eval(index)?;
        match (&target, &key) {
            (Value::Null, _) => Err(ExprError::Eval("cannot index undefined".into())),
            (Value::Array(items), Value::Number(n)) => {
                let idx = n.as_i64().unwrap_or(-1);
                if idx >= 0 {
                    Ok(items.get(idx as usize).cloned().unwrap_or(Value::Null))
                } else {
                    Ok(Value::Null)
                }
            }
            (Value::Object(map), Value::String(name)) => {
                Ok(map.get(name).cloned().unwrap_or(Value::Null))
            }
            (Value::String(s), Value::Number(n)) => {
                let idx = n.as_i64().unwrap_or(-1);
                if idx >= 0 {
                    Ok(s.chars()
                        .nth(idx as usize)
                        .map(|c| Value::String(c.to_string()))
                        .unwrap_or(Value::Null))
                } else {
                    Ok(Value::Null)
                }
            }
            _ => Ok(Value::Null),
        }
    }

    fn eval_call(&mut self, callee: &Expr, args: &[Expr]) -> ExprResult<Value> {
        let Expr::Member { object, property } = callee else {
            return Err(ExprError::Eval("only method calls are supported".into()));
        };

        if let Expr::Ident(ns) = object.as_ref() {
            if ns == "Math" {
                let values = self.eval_args(args)?;
                return math_call(property, &values);
            }
            if ns == "Object" {
                let values = self.eval_args(args)?;
                return object_call(property, &values);
            }
        }

        let receiver = self.eval(object)?;

        // filter/map take an unevaluated lambda argument
        if property == "filter" || property == "map" {
            let Some(Expr::Lambda { param, body }) = args.first() else {
                return Err(ExprError::Eval(format!(
                    ".{property} expects a lambda argument"
                )));
            };
            let Value::Array(items) = receiver else {
                return Err(ExprError::Eval(format!(".{property} requires an array")));
            };
            let mut out = Vec::new();
            for item in items {
                self.bindings.push((param.clone(), item.clone()));
                let result = self.eval(body);
                self.bindings.pop();
                let result = result?;
                if property == "map" {
                    out.push(result);
                } else if truthy(&result) {
                    out.push(item);
                }
            }
            return Ok(Value::Array(out));
        }

        let values = self.eval_args(args)?;
        method_call(&receiver, property, &values)
    }

    fn eval_args(&mut self, args: &[Expr]) -> ExprResult<Vec<Value>> {
        let mut out = Vec::with_capacity(args.len());
        for arg in args {
            out.push(self.eval(arg)?);
        }
        Ok(out)
    }

    fn eval_binary(&mut self, op: BinaryOp, left: &Expr, right: &Expr) -> ExprResult<Value> {
        // Short-circuit logical operators return the deciding operand.
        match op {
            BinaryOp::And => {
                let lhs = self.eval(left)?;
                if !truthy(&lhs) {
                    return Ok(lhs);
                }
                return self.eval(right);
            }
            BinaryOp::Or => {
                let lhs = self.eval(left)?;
                if truthy(&lhs) {
                    return Ok(lhs);
                }
                return self.eval(right);
            }
            _ => {}
        }

        let lhs = self.eval(left)?;
        let rhs = self.eval(right)?;
        match op {
            BinaryOp::Add => add_values(&lhs, &rhs),
            BinaryOp::Sub => arith(&lhs, &rhs, "-"),
            BinaryOp::Mul => arith(&lhs, &rhs, "*"),
            BinaryOp::Div => arith(&lhs, &rhs, "/"),
            BinaryOp::Rem => arith(&lhs, &rhs, "%"),
            BinaryOp::Eq => Ok(Value::Bool(loose_eq(&lhs, &rhs))),
            BinaryOp::NotEq => Ok(Value::Bool(!loose_eq(&lhs, &rhs))),
            BinaryOp::StrictEq => Ok(Value::Bool(strict_eq(&lhs, &rhs))),
            BinaryOp::StrictNotEq => Ok(Value::Bool(!strict_eq(&lhs, &rhs))),
            BinaryOp::Lt => compare(&lhs, &rhs).map(|ord| Value::Bool(ord.is_lt())),
            BinaryOp::Le => compare(&lhs, &rhs).map(|ord| Value::Bool(ord.is_le())),
            BinaryOp::Gt => compare(&lhs, &rhs).map(|ord| Value::Bool(ord.is_gt())),
            BinaryOp::Ge => compare(&lhs, &rhs).map(|ord| Value::Bool(ord.is_ge())),
            BinaryOp::And | BinaryOp::Or => unreachable!("handled above"),
        }
    }
}

fn is_namespace(expr: &Expr) -> bool {
    matches!(expr, Expr::Ident(name) if name == "Math" || name == "Object")
}

fn length_of(value: &Value) -> ExprResult<Value> {
    match value {
        Value::String(s) => Ok(Value::from(s.chars().count() as i64)),
        Value::Array(items) => Ok(Value::from(items.len() as i64)),
        Value::Object(map) => Ok(Value::from(map.len() as i64)),
        Value::Null => Err(ExprError::Eval(
            "cannot read property 'length' of undefined".into(),
        )),
        _ => Ok(Value::Null),
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        _ => None,
    }
}

/// Keep integral results as JSON integers so state values round-trip without
/// a trailing `.0`.
fn number_from_f64(f: f64) -> Value {
    if f.fract() == 0.0 && f.is_finite() && f.abs() < (i64::MAX as f64) {
        Value::from(f as i64)
    } else {
        serde_json::Number::from_f64(f)
            .map(Value::Number)
            .unwrap_or(Value::Null)
    }
}

fn add_values(lhs: &Value, rhs: &Value) -> ExprResult<Value> {
    // String concatenation wins when either side is a string.
    if lhs.is_string() || rhs.is_string() {
        return Ok(Value::String(format!("{}{}", render(lhs), render(rhs))));
    }
    arith(lhs, rhs, "+")
}

fn arith(lhs: &Value, rhs: &Value, op: &str) -> ExprResult<Value> {
    let (a, b) = match (as_number(lhs), as_number(rhs)) {
        (Some(a), Some(b)) => (a, b),
        _ => {
            return Err(ExprError::Eval(format!(
                "'{op}' requires numeric operands"
            )))
        }
    };
    if op == "/" && b == 0.0 {
        return Err(ExprError::Eval("division by zero".into()));
    }
    if op == "%" && b == 0.0 {
        return Err(ExprError::Eval("modulo by zero".into()));
    }
    let result = match op {
        "+" => a + b,
        "-" => a - b,
        "*" => a * b,
        "/" => a / b,
        "%" => a % b,
        _ => unreachable!(),
    };
    Ok(number_from_f64(result))
}

fn loose_eq(lhs: &Value, rhs: &Value) -> bool {
    match (lhs, rhs) {
        (Value::Number(a), Value::Number(b)) => a.as_f64() == b.as_f64(),
        (Value::Number(n), Value::String(s)) | (Value::String(s), Value::Number(n)) => {
            s.parse::<f64>().ok() == n.as_f64()
        }
        (Value::Bool(b), other) | (other, Value::Bool(b)) if !other.is_boolean() => {
            let as_num = if *b { 1.0 } else { 0.0 };
            as_number(other).map(|n| n == as_num).unwrap_or(false)
        }
        _ => strict_eq(lhs, rhs),
    }
}

fn strict_eq(lhs: &Value, rhs: &Value) -> bool {
    match (lhs, rhs) {
        (Value::Number(a), Value::Number(b)) => a.as_f64() == b.as_f64(),
        _ => lhs == rhs,
    }
}

fn compare(lhs: &Value, rhs: &Value) -> ExprResult<std::cmp::Ordering> {
    match (lhs, rhs) {
        (Value::Number(a), Value::Number(b)) => {
            let (a, b) = (a.as_f64().unwrap_or(f64::NAN), b.as_f64().unwrap_or(f64::NAN));
            a.partial_cmp(&b)
                .ok_or_else(|| ExprError::Eval("cannot compare NaN".into()))
        }
        (Value::String(a), Value::String(b)) => Ok(a.cmp(b)),
        _ => Err(ExprError::Eval(
            "comparison requires two numbers or two strings".into(),
        )),
    }
}

fn math_call(name: &str, args: &[Value]) -> ExprResult<Value> {
    let numbers: Vec<f64> = args
        .iter()
        .map(|v| as_number(v).ok_or_else(|| ExprError::Eval(format!("Math.{name} requires numbers"))))
        .collect::<ExprResult<_>>()?;
    if numbers.is_empty() {
        return Err(ExprError::Eval(format!(
            "Math.{name} requires at least one argument"
        )));
    }
    match name {
        "min" => Ok(number_from_f64(
            numbers.iter().cloned().fold(f64::INFINITY, f64::min),
        )),
        "max" => Ok(number_from_f64(
            numbers.iter().cloned().fold(f64::NEG_INFINITY, f64::max),
        )),
        "round" => Ok(number_from_f64(numbers[0].round())),
        "floor" => Ok(number_from_f64(numbers[0].floor())),
        "ceil" => Ok(number_from_f64(numbers[0].ceil())),
        other => Err(ExprError::Eval(format!("unknown function Math.{other}"))),
    }
}

fn object_call(name: &str, args: &[Value]) -> ExprResult<Value> {
    let Some(Value::Object(map)) = args.first() else {
        return Err(ExprError::Eval(format!("Object.{name} requires an object")));
    };
    match name {
        "keys" => Ok(Value::Array(
            map.keys().map(|k| Value::String(k.clone())).collect(),
        )),
        "values" => Ok(Value::Array(map.values().cloned().collect())),
        "entries" => Ok(Value::Array(
            map.iter()
                .map(|(k, v)| Value::Array(vec![Value::String(k.clone()), v.clone()]))
                .collect(),
        )),
        other => Err(ExprError::Eval(format!("unknown function Object.{other}"))),
    }
}

fn method_call(receiver: &Value, name: &str, args: &[Value]) -> ExprResult<Value> {
    match (receiver, name) {
        (Value::Array(items), "join") => {
            let sep = match args.first() {
                Some(Value::String(s)) => s.clone(),
                Some(other) => render(other),
                None => ",".to_string(),
            };
            Ok(Value::String(
                items.iter().map(render).collect::<Vec<_>>().join(&sep),
            ))
        }
        (Value::Array(items), "slice") => {
            let (start, end) = slice_bounds(items.len(), args)?;
            Ok(Value::Array(items[start..end].to_vec()))
        }
        (Value::Array(items), "concat") => {
            let mut out = items.clone();
            for arg in args {
                match arg {
                    Value::Array(more) => out.extend(more.iter().cloned()),
                    other => out.push(other.clone()),
                }
            }
            Ok(Value::Array(out))
        }
        (Value::Array(items), "includes") => {
            let needle = args
                .first()
                .ok_or_else(|| ExprError::Eval(".includes requires an argument".into()))?;
            Ok(Value::Bool(items.iter().any(|item| strict_eq(item, needle))))
        }
        (Value::String(s), "slice") => {
            let chars: Vec<char> = s.chars().collect();
            let (start, end) = slice_bounds(chars.len(), args)?;
            Ok(Value::String(chars[start..end].iter().collect()))
        }
        (Value::String(s), "concat") => {
            let mut out = s.clone();
            for arg in args {
                out.push_str(&render(arg));
            }
            Ok(Value::String(out))
        }
        (Value::String(s), "includes") => {
            let needle = string_arg(name, args)?;
            Ok(Value::Bool(s.contains(&needle)))
        }
        (Value::String(s), "endsWith") => {
            let needle = string_arg(name, args)?;
            Ok(Value::Bool(s.ends_with(&needle)))
        }
        (Value::String(s), "startsWith") => {
            let needle = string_arg(name, args)?;
            Ok(Value::Bool(s.starts_with(&needle)))
        }
        (Value::String(s), "toUpperCase") => Ok(Value::String(s.to_uppercase())),
        (Value::String(s), "toLowerCase") => Ok(Value::String(s.to_lowercase())),
        (Value::String(s), "trim") => Ok(Value::String(s.trim().to_string())),
        (Value::String(s), "split") => {
            let sep = string_arg(name, args)?;
            let parts: Vec<Value> = if sep.is_empty() {
                s.chars().map(|c| Value::String(c.to_string())).collect()
            } else {
                s.split(&sep)
                    .map(|p| Value::String(p.to_string()))
                    .collect()
            };
            Ok(Value::Array(parts))
        }
        (Value::Null, _) => Err(ExprError::Eval(format!(
            "cannot call '{name}' on undefined"
        ))),
        (_, other) => Err(ExprError::Eval(format!(
            "unknown method '.{other}' for this value"
        ))),
    }
}

fn string_arg(method: &str, args: &[Value]) -> ExprResult<String> {
    match args.first() {
        Some(Value::String(s)) => Ok(s.clone()),
        Some(other) => Ok(render(other)),
        None => Err(ExprError::Eval(format!(
            ".{method} requires a string argument"
        ))),
    }
}

/// Normalise JS-style slice arguments (negative indices count from the end).
fn slice_bounds(len: usize, args: &[Value]) -> ExprResult<(usize, usize)> {
    let norm = |v: Option<&Value>, default: i64| -> ExprResult<i64> {
        match v {
            None => Ok(default),
            Some(value) => as_number(value)
                .map(|f| f as i64)
                .ok_or_else(|| ExprError::Eval(".slice requires numeric bounds".into())),
        }
    };
    let len_i = len as i64;
    let clamp = |idx: i64| -> usize {
        let idx = if idx < 0 { len_i + idx } else { idx };
        idx.clamp(0, len_i) as usize
    };
    let start = clamp(norm(args.first(), 0)?);
    let end = clamp(norm(args.get(1), len_i)?);
    Ok((start, start.max(end)))
}
