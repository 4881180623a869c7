//! Register-based mappers: Modbus group reads and Manner-Ethernet frames.
//!
//! Both expose the decoded items to the expression as `registers`, a slice
//! of `size` integers starting at the mapping's `address`. Coils and
//! discrete inputs show up as 0/1.

use signalk_core::Delta;
use signalk_protocol::manner::payload_to_values;
use signalk_protocol::modbus::{decode_items, extract_header};
use signalk_protocol::RawMessage;

use crate::config::Mapping;
use crate::expr::Env;
use crate::mapping::{frame_delta, raw_source, MappingSet};
use crate::{MapError, ProtocolMapper};

const DEFAULT_EXPRESSION: &str = "registers[0]";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterKind {
    Modbus,
    Manner,
}

pub struct RegisterMapper {
    kind: RegisterKind,
    context: String,
    mappings: MappingSet,
}

impl RegisterMapper {
    pub fn new(kind: RegisterKind, context: &str, mappings: &[Mapping]) -> Self {
        Self {
            kind,
            context: context.to_string(),
            mappings: MappingSet::compile(mappings, DEFAULT_EXPRESSION),
        }
    }

    fn evaluate(&self, slave: u8, function: Option<u16>, base: u16, items: &[u16]) -> Vec<signalk_core::PathValue> {
        let mut values = Vec::new();
        for (i, item) in self.mappings.items().iter().enumerate() {
            let m = &item.mapping;
            if let (Some(want), Some(got)) = (m.function_code, function) {
                if want.code() != got {
                    continue;
                }
            }
            if m.slave.is_some_and(|s| s != slave) {
                continue;
            }
            let Some(address) = m.address else {
                continue;
            };
            let Some(offset) = address.checked_sub(base).map(usize::from) else {
                continue;
            };
            let Some(slice) = items.get(offset..offset + usize::from(m.size)) else {
                continue;
            };
            let env = Env::new()
                .registers("registers", slice)
                .int("address", i64::from(address))
                .int("slave", i64::from(slave));
            if let Some(pv) = self.mappings.eval(i, env) {
                values.push(pv);
            }
        }
        values
    }
}

impl ProtocolMapper for RegisterMapper {
    fn protocol(&self) -> &str {
        match self.kind {
            RegisterKind::Modbus => "modbus",
            RegisterKind::Manner => "manner",
        }
    }

    fn map(&mut self, raw: &RawMessage) -> Result<Vec<Delta>, MapError> {
        let values = match self.kind {
            RegisterKind::Modbus => {
                let (header, data) = extract_header(&raw.payload)?;
                let items = decode_items(&header, data)?;
                self.evaluate(header.slave, Some(header.function.code()), header.address, &items)
            }
            RegisterKind::Manner => {
                let items = payload_to_values(&raw.payload)
                    .ok_or(MapError::Manner(raw.payload.len()))?;
                self.evaluate(0, None, 0, &items)
            }
        };
        Ok(frame_delta(&self.context, raw_source(raw), raw, values)
            .into_iter()
            .collect())
    }

    fn expression_failures(&self) -> u64 {
        self.mappings.failures()
    }
}
