//! JSON payload mapper. Each mapping expression sees the parsed document
//! as `json`.

use serde_json::Value;

use signalk_core::{Delta, PathValue};
use signalk_protocol::RawMessage;

use crate::config::Mapping;
use crate::expr::Env;
use crate::mapping::{frame_delta, raw_source, MappingSet};
use crate::{MapError, ProtocolMapper};

pub struct JsonMapper {
    context: String,
    mappings: MappingSet,
}

impl JsonMapper {
    pub fn new(context: &str, mappings: &[Mapping]) -> Self {
        // config validation rejects a json mapping without an expression
        Self {
            context: context.to_string(),
            mappings: MappingSet::compile(mappings, "()"),
        }
    }
}

impl ProtocolMapper for JsonMapper {
    fn protocol(&self) -> &str {
        "json"
    }

    fn map(&mut self, raw: &RawMessage) -> Result<Vec<Delta>, MapError> {
        let doc: Value = serde_json::from_slice(&raw.payload)?;
        let values: Vec<PathValue> = (0..self.mappings.len())
            .filter_map(|i| self.mappings.eval(i, Env::new().json("json", &doc)))
            .collect();
        Ok(frame_delta(&self.context, raw_source(raw), raw, values)
            .into_iter()
            .collect())
    }

    fn expression_failures(&self) -> u64 {
        self.mappings.failures()
    }
}
