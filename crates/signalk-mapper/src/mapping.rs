//! Compiled mapping tables shared by the expression-driven mappers.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, warn};

use signalk_core::{Delta, PathValue, Source, Update};
use signalk_protocol::RawMessage;

use crate::config::Mapping;
use crate::expr::{Env, Expr, ExprEngine};

pub struct CompiledMapping {
    pub mapping: Mapping,
    pub expr: Expr,
}

/// A mapping table compiled once, with a shared failure counter.
pub struct MappingSet {
    engine: ExprEngine,
    items: Vec<CompiledMapping>,
    failures: Arc<AtomicU64>,
}

impl MappingSet {
    /// Compile every mapping. A mapping whose expression does not compile is
    /// logged and left out; the others still run.
    pub fn compile(mappings: &[Mapping], default_expression: &str) -> Self {
        let engine = ExprEngine::new();
        let mut items = Vec::with_capacity(mappings.len());
        for mapping in mappings {
            let source = mapping.expression.as_deref().unwrap_or(default_expression);
            match engine.compile(source) {
                Ok(expr) => items.push(CompiledMapping {
                    mapping: mapping.clone(),
                    expr,
                }),
                Err(e) => warn!(
                    path = %mapping.path,
                    expression = %source,
                    error = %e,
                    "skipping mapping"
                ),
            }
        }
        Self {
            engine,
            items,
            failures: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn items(&self) -> &[CompiledMapping] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Evaluate mapping `index`. Failures are counted and yield `None`, as
    /// does a null result.
    pub fn eval(&self, index: usize, env: Env) -> Option<PathValue> {
        let item = self.items.get(index)?;
        match self.engine.eval(&item.expr, env) {
            Ok(Value::Null) => {
                debug!(path = %item.mapping.path, "expression produced no value");
                None
            }
            Ok(value) => Some(PathValue {
                path: item.mapping.path.clone(),
                value,
            }),
            Err(e) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                warn!(
                    path = %item.mapping.path,
                    expression = %item.expr.source(),
                    error = %e,
                    "mapping evaluation failed"
                );
                None
            }
        }
    }

    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }
}

/// Source attribution for a frame: connector label and protocol tag.
pub fn raw_source(raw: &RawMessage) -> Source {
    Source::new(raw.connector.clone(), raw.protocol.clone())
}

/// Wrap values from one frame into a delta, or nothing when no value
/// survived.
pub fn frame_delta(
    context: &str,
    source: Source,
    raw: &RawMessage,
    values: Vec<PathValue>,
) -> Option<Delta> {
    if values.is_empty() {
        return None;
    }
    Some(Delta::single(
        context,
        Update {
            source,
            timestamp: raw.timestamp,
            values,
        },
    ))
}
