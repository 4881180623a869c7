//! Rhai expression engine used by every mapping.
//!
//! Expressions are compiled once when a mapper is built and evaluated per
//! frame against a typed [`Env`]. Results are converted to JSON values;
//! a non-finite number is an evaluation error, so a division by zero or an
//! overflow never reaches the bus.
//!
//! ## Helpers
//!
//! - `interpolate(x, xs, ys)` - piecewise-linear lookup, clamped at the ends
//! - `clamp(x, lo, hi)`, `min(a, b)`, `max(a, b)`, `abs(x)`
//! - `sqrt(x)`, `pow(x, y)`, `sin`/`cos`/`tan`/`asin`/`acos`/`atan`/`atan2`
//! - `deg_to_rad(d)`, `knots_to_ms(k)`, `kelvin(celsius)`
//! - `to_int(x)`, `to_float(x)`

use rhai::{Array, Dynamic, Engine, EvalAltResult, Position, Scope, AST};
use serde_json::Value;

#[derive(Debug, thiserror::Error)]
pub enum ExprError {
    #[error("compile: {0}")]
    Compile(String),

    #[error("evaluate: {0}")]
    Eval(String),

    #[error("result is not finite: {0}")]
    NonFinite(f64),

    #[error("unsupported result type {0}")]
    Unsupported(String),
}

/// A compiled expression together with its source text.
#[derive(Debug, Clone)]
pub struct Expr {
    source: String,
    ast: AST,
}

impl Expr {
    pub fn source(&self) -> &str {
        &self.source
    }
}

/// Variables visible to one evaluation.
#[derive(Debug, Default)]
pub struct Env {
    scope: Scope<'static>,
}

impl Env {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn number(mut self, name: &str, value: f64) -> Self {
        self.scope.push_dynamic(name.to_string(), Dynamic::from_float(value));
        self
    }

    pub fn int(mut self, name: &str, value: i64) -> Self {
        self.scope.push_dynamic(name.to_string(), Dynamic::from_int(value));
        self
    }

    pub fn string(mut self, name: &str, value: &str) -> Self {
        self.scope.push_dynamic(name.to_string(), Dynamic::from(value.to_string()));
        self
    }

    /// Register words as an array of integers.
    pub fn registers(mut self, name: &str, values: &[u16]) -> Self {
        let array: Array = values
            .iter()
            .map(|v| Dynamic::from_int(i64::from(*v)))
            .collect();
        self.scope.push_dynamic(name.to_string(), Dynamic::from_array(array));
        self
    }

    pub fn strings(mut self, name: &str, values: &[&str]) -> Self {
        let array: Array = values.iter().map(|s| Dynamic::from(s.to_string())).collect();
        self.scope.push_dynamic(name.to_string(), Dynamic::from_array(array));
        self
    }

    /// Any JSON value, exposed as Rhai maps, arrays and scalars.
    pub fn json(mut self, name: &str, value: &Value) -> Self {
        self.scope.push_dynamic(name.to_string(), json_to_dynamic(value));
        self
    }
}

pub struct ExprEngine {
    engine: Engine,
}

impl Default for ExprEngine {
    fn default() -> Self {
        Self::new()
    }
}

fn number(d: &Dynamic) -> Option<f64> {
    d.as_float()
        .ok()
        .or_else(|| d.as_int().ok().map(|i| i as f64))
}

fn eval_error(msg: impl Into<String>) -> Box<EvalAltResult> {
    Box::new(EvalAltResult::ErrorRuntime(
        Dynamic::from(msg.into()),
        Position::NONE,
    ))
}

/// Piecewise-linear interpolation of `x` over the `(xs, ys)` table.
pub fn interpolate(x: f64, xs: &[f64], ys: &[f64]) -> Option<f64> {
    if xs.len() != ys.len() || xs.is_empty() {
        return None;
    }
    if x <= xs[0] {
        return Some(ys[0]);
    }
    for i in 1..xs.len() {
        if x <= xs[i] {
            let span = xs[i] - xs[i - 1];
            if span <= 0.0 {
                return None;
            }
            let t = (x - xs[i - 1]) / span;
            return Some(ys[i - 1] + t * (ys[i] - ys[i - 1]));
        }
    }
    ys.last().copied()
}

macro_rules! unary {
    ($engine:expr, $name:literal, $f:expr) => {{
        let f: fn(f64) -> f64 = $f;
        $engine.register_fn($name, move |x: f64| f(x));
        $engine.register_fn($name, move |x: i64| f(x as f64));
    }};
}

impl ExprEngine {
    pub fn new() -> Self {
        let mut engine = Engine::new();
        engine.set_max_expr_depths(64, 64);
        engine.set_max_call_levels(32);
        engine.set_max_operations(100_000);
        engine.set_max_string_size(10_000);
        engine.set_max_array_size(10_000);
        engine.set_max_map_size(1_000);
        Self::register_helpers(&mut engine);
        Self { engine }
    }

    fn register_helpers(engine: &mut Engine) {
        engine.register_fn(
            "interpolate",
            |x: Dynamic, xs: Array, ys: Array| -> Result<f64, Box<EvalAltResult>> {
                let x = number(&x).ok_or_else(|| eval_error("interpolate: x is not a number"))?;
                let xs: Option<Vec<f64>> = xs.iter().map(number).collect();
                let ys: Option<Vec<f64>> = ys.iter().map(number).collect();
                match (xs, ys) {
                    (Some(xs), Some(ys)) => interpolate(x, &xs, &ys)
                        .ok_or_else(|| eval_error("interpolate: table must be sorted and equal length")),
                    _ => Err(eval_error("interpolate: table holds a non-number")),
                }
            },
        );

        engine.register_fn("clamp", |x: f64, lo: f64, hi: f64| x.max(lo).min(hi));
        engine.register_fn("clamp", |x: i64, lo: i64, hi: i64| x.max(lo).min(hi));
        engine.register_fn("min", |a: f64, b: f64| a.min(b));
        engine.register_fn("max", |a: f64, b: f64| a.max(b));
        engine.register_fn("min", |a: i64, b: i64| a.min(b));
        engine.register_fn("max", |a: i64, b: i64| a.max(b));
        engine.register_fn("abs", |x: f64| x.abs());
        engine.register_fn("abs", |x: i64| x.saturating_abs());
        engine.register_fn("pow", |x: f64, y: f64| x.powf(y));
        engine.register_fn("pow", |x: i64, y: i64| (x as f64).powf(y as f64));
        engine.register_fn("atan2", |y: f64, x: f64| y.atan2(x));

        unary!(engine, "sqrt", f64::sqrt);
        unary!(engine, "sin", f64::sin);
        unary!(engine, "cos", f64::cos);
        unary!(engine, "tan", f64::tan);
        unary!(engine, "asin", f64::asin);
        unary!(engine, "acos", f64::acos);
        unary!(engine, "atan", f64::atan);
        unary!(engine, "deg_to_rad", f64::to_radians);
        unary!(engine, "knots_to_ms", |k| k * 1852.0 / 3600.0);
        unary!(engine, "kelvin", |c| c + 273.15);
        unary!(engine, "to_float", |x| x);

        engine.register_fn("to_int", |x: f64| -> Result<i64, Box<EvalAltResult>> {
            if x.is_finite() && x.abs() < i64::MAX as f64 {
                Ok(x as i64)
            } else {
                Err(eval_error(format!("to_int: {x} out of range")))
            }
        });
        engine.register_fn("to_int", |x: i64| x);
    }

    pub fn compile(&self, source: &str) -> Result<Expr, ExprError> {
        let ast = self
            .engine
            .compile_expression(source)
            .map_err(|e| ExprError::Compile(e.to_string()))?;
        Ok(Expr {
            source: source.to_string(),
            ast,
        })
    }

    pub fn eval(&self, expr: &Expr, env: Env) -> Result<Value, ExprError> {
        let mut scope = env.scope;
        let result = self
            .engine
            .eval_ast_with_scope::<Dynamic>(&mut scope, &expr.ast)
            .map_err(|e| ExprError::Eval(e.to_string()))?;
        dynamic_to_json(result)
    }
}

pub fn json_to_dynamic(value: &Value) -> Dynamic {
    match value {
        Value::Null => Dynamic::UNIT,
        Value::Bool(b) => Dynamic::from_bool(*b),
        Value::Number(n) => match n.as_i64() {
            Some(i) => Dynamic::from_int(i),
            None => Dynamic::from_float(n.as_f64().unwrap_or(f64::NAN)),
        },
        Value::String(s) => Dynamic::from(s.clone()),
        Value::Array(items) => Dynamic::from_array(items.iter().map(json_to_dynamic).collect()),
        Value::Object(fields) => {
            let mut map = rhai::Map::new();
            for (k, v) in fields {
                map.insert(k.as_str().into(), json_to_dynamic(v));
            }
            Dynamic::from_map(map)
        }
    }
}

pub fn dynamic_to_json(value: Dynamic) -> Result<Value, ExprError> {
    if value.is_unit() {
        return Ok(Value::Null);
    }
    if let Ok(f) = value.as_float() {
        return serde_json::Number::from_f64(f)
            .map(Value::Number)
            .ok_or(ExprError::NonFinite(f));
    }
    if let Ok(i) = value.as_int() {
        return Ok(Value::from(i));
    }
    if let Ok(b) = value.as_bool() {
        return Ok(Value::Bool(b));
    }
    if value.is_string() {
        return value
            .into_string()
            .map(Value::String)
            .map_err(|t| ExprError::Unsupported(t.to_string()));
    }
    if value.is_array() {
        let items = value
            .into_array()
            .map_err(|t| ExprError::Unsupported(t.to_string()))?;
        return items
            .into_iter()
            .map(dynamic_to_json)
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array);
    }
    if value.is_map() {
        let type_name = value.type_name().to_string();
        let map = value
            .try_cast::<rhai::Map>()
            .ok_or(ExprError::Unsupported(type_name))?;
        let mut object = serde_json::Map::new();
        for (k, v) in map {
            object.insert(k.to_string(), dynamic_to_json(v)?);
        }
        return Ok(Value::Object(object));
    }
    Err(ExprError::Unsupported(value.type_name().to_string()))
}
