//! Line-oriented CSV mapper.
//!
//! A mapping applies to a line when it starts with `beginsWith` (if set)
//! and matches `regex` (if set). The expression sees:
//! - `line`: the whole line
//! - `fields`: regex groups when a regex is set, else the split columns
//! - `captures`: named regex groups as a map

use regex::Regex;
use serde_json::{Map, Value};
use tracing::warn;

use signalk_core::{Delta, PathValue};
use signalk_protocol::RawMessage;

use crate::config::Mapping;
use crate::expr::Env;
use crate::mapping::{frame_delta, raw_source, MappingSet};
use crate::{MapError, ProtocolMapper};

const DEFAULT_EXPRESSION: &str = "parse_float(fields[0])";

pub struct CsvMapper {
    context: String,
    mappings: MappingSet,
    /// Compiled regex per mapping, aligned with `mappings.items()`.
    patterns: Vec<Option<Regex>>,
}

impl CsvMapper {
    pub fn new(context: &str, mappings: &[Mapping]) -> Self {
        let valid: Vec<Mapping> = mappings
            .iter()
            .filter(|m| match m.regex.as_deref().map(Regex::new) {
                Some(Err(e)) => {
                    warn!(path = %m.path, error = %e, "skipping mapping with bad regex");
                    false
                }
                _ => true,
            })
            .cloned()
            .collect();
        let mappings = MappingSet::compile(&valid, DEFAULT_EXPRESSION);
        let patterns = mappings
            .items()
            .iter()
            .map(|item| item.mapping.regex.as_deref().and_then(|r| Regex::new(r).ok()))
            .collect();
        Self {
            context: context.to_string(),
            mappings,
            patterns,
        }
    }

    fn map_line(&self, line: &str) -> Vec<PathValue> {
        let mut values = Vec::new();
        for (i, item) in self.mappings.items().iter().enumerate() {
            let m = &item.mapping;
            if let Some(prefix) = &m.begins_with {
                if !line.starts_with(prefix.as_str()) {
                    continue;
                }
            }
            let env = match self.patterns.get(i).and_then(Option::as_ref) {
                Some(re) => {
                    let Some(caps) = re.captures(line) else {
                        continue;
                    };
                    let groups: Vec<&str> = caps
                        .iter()
                        .skip(1)
                        .map(|g| g.map_or("", |g| g.as_str()))
                        .collect();
                    let mut named = Map::new();
                    for name in re.capture_names().flatten() {
                        if let Some(g) = caps.name(name) {
                            named.insert(name.to_string(), Value::String(g.as_str().to_string()));
                        }
                    }
                    Env::new()
                        .string("line", line)
                        .strings("fields", &groups)
                        .json("captures", &Value::Object(named))
                }
                None => {
                    let separator = m.separator.as_deref().unwrap_or(",");
                    let columns: Vec<&str> = line.split(separator).map(str::trim).collect();
                    Env::new()
                        .string("line", line)
                        .strings("fields", &columns)
                        .json("captures", &Value::Object(Map::new()))
                }
            };
            if let Some(pv) = self.mappings.eval(i, env) {
                values.push(pv);
            }
        }
        values
    }
}

impl ProtocolMapper for CsvMapper {
    fn protocol(&self) -> &str {
        "csv"
    }

    fn map(&mut self, raw: &RawMessage) -> Result<Vec<Delta>, MapError> {
        let text = std::str::from_utf8(&raw.payload).map_err(|_| MapError::Utf8)?;
        let values: Vec<PathValue> = text
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .flat_map(|line| self.map_line(line))
            .collect();
        Ok(frame_delta(&self.context, raw_source(raw), raw, values)
            .into_iter()
            .collect())
    }

    fn expression_failures(&self) -> u64 {
        self.mappings.failures()
    }
}
