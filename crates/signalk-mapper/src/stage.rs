//! Expression stage: paths computed from the latest values of other paths.
//!
//! Rules run in configuration order after every mapped delta, so a rule
//! may consume the output of an earlier one. A rule fires when one of its
//! sources was updated by the delta (or by an earlier rule), every source
//! has a value, and no source is older than `retentionMs` relative to the
//! newest one. With `overwrite: false` a rule stays silent until at least
//! one input differs from the inputs of its previous emission.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use tracing::{debug, warn};

use signalk_core::{Delta, PathValue, Source, Update};

use crate::config::ExpressionRule;
use crate::expr::{Env, Expr, ExprEngine};

struct CompiledRule {
    rule: ExpressionRule,
    context: String,
    expr: Expr,
    retention: Duration,
    last_inputs: Option<Vec<Value>>,
}

pub struct ExpressionStage {
    label: String,
    engine: ExprEngine,
    rules: Vec<CompiledRule>,
    latest: HashMap<(String, String), (Value, DateTime<Utc>)>,
    failures: u64,
}

impl ExpressionStage {
    /// Compile `rules`. A rule that fails to compile is logged and skipped.
    pub fn new(label: &str, default_context: &str, rules: &[ExpressionRule]) -> Self {
        let engine = ExprEngine::new();
        let mut compiled = Vec::with_capacity(rules.len());
        for rule in rules {
            match engine.compile(&rule.expression) {
                Ok(expr) => compiled.push(CompiledRule {
                    context: rule
                        .context
                        .clone()
                        .unwrap_or_else(|| default_context.to_string()),
                    retention: Duration::milliseconds(
                        i64::try_from(rule.retention_ms).unwrap_or(i64::MAX),
                    ),
                    rule: rule.clone(),
                    expr,
                    last_inputs: None,
                }),
                Err(e) => warn!(path = %rule.path, error = %e, "skipping expression rule"),
            }
        }
        Self {
            label: label.to_string(),
            engine,
            rules: compiled,
            latest: HashMap::new(),
            failures: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn failures(&self) -> u64 {
        self.failures
    }

    /// Record `delta` and return the derived delta, if any rule fired.
    pub fn process(&mut self, delta: &Delta) -> Option<Delta> {
        let mut touched = HashSet::new();
        for update in &delta.updates {
            for pv in &update.values {
                self.latest.insert(
                    (delta.context.clone(), pv.path.clone()),
                    (pv.value.clone(), update.timestamp),
                );
                touched.insert(pv.path.clone());
            }
        }

        let mut values = Vec::new();
        let mut newest_output: Option<DateTime<Utc>> = None;
        for i in 0..self.rules.len() {
            let Some((value, at)) = self.fire(i, &delta.context, &touched) else {
                continue;
            };
            let path = self.rules[i].rule.path.clone();
            self.latest
                .insert((delta.context.clone(), path.clone()), (value.clone(), at));
            touched.insert(path.clone());
            newest_output = newest_output.max(Some(at));
            values.push(PathValue { path, value });
        }

        let timestamp = newest_output?;
        Some(Delta::single(
            delta.context.clone(),
            Update {
                source: Source::new(self.label.clone(), "expression"),
                timestamp,
                values,
            },
        ))
    }

    fn fire(
        &mut self,
        index: usize,
        context: &str,
        touched: &HashSet<String>,
    ) -> Option<(Value, DateTime<Utc>)> {
        let rule = &self.rules[index];
        if rule.context != context || !rule.rule.sources.iter().any(|s| touched.contains(s)) {
            return None;
        }

        let mut inputs = Vec::with_capacity(rule.rule.sources.len());
        let mut stamps = Vec::with_capacity(rule.rule.sources.len());
        for source in &rule.rule.sources {
            let (value, at) = self.latest.get(&(context.to_string(), source.clone()))?;
            inputs.push(value.clone());
            stamps.push(*at);
        }
        let newest = stamps.iter().max().copied()?;
        if stamps.iter().any(|at| newest - *at > rule.retention) {
            debug!(path = %rule.rule.path, "expression inputs outside retention");
            return None;
        }
        if !rule.rule.overwrite && rule.last_inputs.as_ref() == Some(&inputs) {
            return None;
        }

        let env = Env::new().json("values", &Value::Array(inputs.clone()));
        match self.engine.eval(&rule.expr, env) {
            Ok(Value::Null) => None,
            Ok(value) => {
                self.rules[index].last_inputs = Some(inputs);
                Some((value, newest))
            }
            Err(e) => {
                self.failures += 1;
                warn!(path = %rule.rule.path, error = %e, "expression rule failed");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rule(path: &str, sources: &[&str], expression: &str) -> ExpressionRule {
        ExpressionRule {
            path: path.to_string(),
            sources: sources.iter().map(|s| s.to_string()).collect(),
            expression: expression.to_string(),
            retention_ms: 10_000,
            overwrite: true,
            context: None,
        }
    }

    fn delta(path: &str, value: Value, at: DateTime<Utc>) -> Delta {
        Delta::single(
            "vessels.self",
            Update {
                source: Source::new("tank", "modbus"),
                timestamp: at,
                values: vec![PathValue {
                    path: path.to_string(),
                    value,
                }],
            },
        )
    }

    fn value_of(delta: &Delta, path: &str) -> f64 {
        delta.updates[0]
            .values
            .iter()
            .find(|pv| pv.path == path)
            .and_then(|pv| pv.value.as_f64())
            .unwrap_or_else(|| panic!("no {path}"))
    }

    #[test]
    fn test_pressure_to_volume_chain() {
        let rules = vec![
            rule(
                "tanks.fuel.0.pressure",
                &["tanks.fuel.0.sensorCurrent"],
                "(values[0] - 4.0) / 16.0 * 30000.0",
            ),
            rule(
                "tanks.fuel.0.currentLevel",
                &["tanks.fuel.0.pressure"],
                "values[0] / (840.0 * 9.81)",
            ),
            rule(
                "tanks.fuel.0.currentVolume",
                &["tanks.fuel.0.currentLevel"],
                "interpolate(values[0], [0.0, 0.25, 0.5, 0.75, 1.0], [0.0, 8.0, 16.5, 25.0, 33.0])",
            ),
        ];
        let mut stage = ExpressionStage::new("tank", "vessels.self", &rules);
        let out = stage
            .process(&delta("tanks.fuel.0.sensorCurrent", json!(6.408), Utc::now()))
            .unwrap();

        assert!((value_of(&out, "tanks.fuel.0.pressure") - 4515.0).abs() < 1e-6);
        assert!((value_of(&out, "tanks.fuel.0.currentLevel") - 0.5479).abs() < 1e-3);
        assert!((value_of(&out, "tanks.fuel.0.currentVolume") - 18.0).abs() < 0.5);
        assert_eq!(out.updates[0].source.source_type, "expression");
    }

    #[test]
    fn test_waits_for_every_source_within_retention() {
        let rules = vec![rule(
            "electrical.batteries.0.power",
            &["electrical.batteries.0.voltage", "electrical.batteries.0.current"],
            "values[0] * values[1]",
        )];
        let mut stage = ExpressionStage::new("bms", "vessels.self", &rules);
        let t0 = Utc::now();
        assert!(stage
            .process(&delta("electrical.batteries.0.voltage", json!(12.0), t0))
            .is_none());

        let later = t0 + Duration::seconds(11);
        assert!(stage
            .process(&delta("electrical.batteries.0.current", json!(2.0), later))
            .is_none());

        let out = stage
            .process(&delta("electrical.batteries.0.voltage", json!(12.5), later))
            .unwrap();
        assert_eq!(out.updates[0].values[0].value, json!(25.0));
        assert_eq!(out.updates[0].timestamp, later);
    }

    #[test]
    fn test_overwrite_false_suppresses_repeats() {
        let mut r = rule("a.doubled", &["a.value"], "values[0] * 2");
        r.overwrite = false;
        let mut stage = ExpressionStage::new("x", "vessels.self", &[r]);
        let t = Utc::now();
        assert!(stage.process(&delta("a.value", json!(1), t)).is_some());
        assert!(stage.process(&delta("a.value", json!(1), t)).is_none());
        assert!(stage.process(&delta("a.value", json!(2), t)).is_some());
    }

    #[test]
    fn test_other_context_and_bad_rules() {
        let rules = vec![
            rule("a.broken", &["a.value"], "values[0] +"),
            rule("a.inverse", &["a.value"], "1 / values[0]"),
        ];
        let mut stage = ExpressionStage::new("x", "vessels.self", &rules);
        let mut other = delta("a.value", json!(0), Utc::now());
        other.context = "vessels.other".to_string();
        assert!(stage.process(&other).is_none());

        assert!(stage.process(&delta("a.value", json!(0), Utc::now())).is_none());
        assert_eq!(stage.failures(), 1);
    }
}
