//! CAN bus mapper. Frames are decoded against a DBC database and only the
//! signals named in the mapping table are published. The expression sees
//! the scaled signal as `value`, the integer before scaling as `raw`, and
//! the DBC unit as `unit`.

pub mod dbc;

use tracing::trace;

use signalk_core::Delta;
use signalk_protocol::can::CanFrame;
use signalk_protocol::RawMessage;

use crate::config::Mapping;
use crate::expr::Env;
use crate::mapping::{frame_delta, raw_source, MappingSet};
use crate::{MapError, ProtocolMapper};
pub use dbc::{parse_dbc, DbcDatabase, DbcMessage, DbcSignal};

const DEFAULT_EXPRESSION: &str = "value";

pub struct CanMapper {
    context: String,
    database: DbcDatabase,
    mappings: MappingSet,
}

impl CanMapper {
    pub fn new(context: &str, database: DbcDatabase, mappings: &[Mapping]) -> Self {
        Self {
            context: context.to_string(),
            database,
            mappings: MappingSet::compile(mappings, DEFAULT_EXPRESSION),
        }
    }
}

impl ProtocolMapper for CanMapper {
    fn protocol(&self) -> &str {
        "canbus"
    }

    fn map(&mut self, raw: &RawMessage) -> Result<Vec<Delta>, MapError> {
        let frame = CanFrame::decode(&raw.payload)?;
        if frame.flags & (signalk_protocol::can::FLAG_RTR | signalk_protocol::can::FLAG_ERROR) != 0 {
            return Ok(Vec::new());
        }
        let Some(message) = self.database.message_for_frame(frame.id, frame.is_extended()) else {
            trace!(id = frame.id, "frame not in DBC");
            return Ok(Vec::new());
        };

        let mut values = Vec::new();
        for (i, item) in self.mappings.items().iter().enumerate() {
            let Some(signal) = item
                .mapping
                .signal
                .as_deref()
                .and_then(|name| message.get_signal(name))
            else {
                continue;
            };
            let Some(decoded) = signal.decode(&frame.data) else {
                continue;
            };
            let env = Env::new()
                .number("value", decoded.physical)
                .int("raw", decoded.raw)
                .string("unit", &signal.unit);
            if let Some(pv) = self.mappings.eval(i, env) {
                values.push(pv);
            }
        }
        Ok(frame_delta(&self.context, raw_source(raw), raw, values)
            .into_iter()
            .collect())
    }

    fn expression_failures(&self) -> u64 {
        self.mappings.failures()
    }
}
