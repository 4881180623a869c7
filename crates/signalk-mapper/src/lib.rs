//! # signalk-mapper
//!
//! Turns Raw frames into SignalK deltas. One mapper instance handles one
//! protocol; frames tagged with any other protocol are ignored. Per-path
//! conversions are Rhai expressions compiled once at start-up, and an
//! optional [`stage::ExpressionStage`] derives further paths from the
//! mapped values.

pub mod can;
pub mod config;
pub mod csv;
pub mod expr;
pub mod json;
pub mod mapping;
pub mod nmea;
pub mod registers;
pub mod runner;
pub mod stage;

use signalk_core::Delta;
use signalk_protocol::can::CanError;
use signalk_protocol::modbus::ModbusError;
use signalk_protocol::RawMessage;

pub use config::{ExpressionRule, Mapping, MapperConfig, ProtocolOptions, PROTOCOLS};
pub use expr::{Env, Expr, ExprEngine, ExprError};
pub use runner::{run_mapper, MapperStats};
pub use stage::ExpressionStage;

#[derive(Debug, thiserror::Error)]
pub enum MapError {
    #[error("payload is not UTF-8")]
    Utf8,

    #[error("checksum mismatch: computed {expected:02X}, sentence says {got:02X}")]
    Checksum { expected: u8, got: u8 },

    #[error("sentence has no checksum")]
    MissingChecksum,

    #[error("malformed frame: {0}")]
    Malformed(String),

    #[error("field {index} is not a number: {text:?}")]
    Field { index: usize, text: String },

    #[error("AIS: {0}")]
    Ais(String),

    #[error(transparent)]
    Modbus(#[from] ModbusError),

    #[error(transparent)]
    Can(#[from] CanError),

    #[error("JSON payload: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Manner payload of {0} bytes")]
    Manner(usize),

    #[error("DBC: {0}")]
    Dbc(String),

    #[error(transparent)]
    Expr(#[from] ExprError),

    #[error("mapper config: {0}")]
    Config(String),
}

/// A protocol-specific Raw-to-delta converter.
pub trait ProtocolMapper: Send {
    /// The Raw protocol tag this mapper accepts.
    fn protocol(&self) -> &str;

    /// Convert one frame. An empty result is normal: the frame carried
    /// nothing the mapping table asks for.
    fn map(&mut self, raw: &RawMessage) -> Result<Vec<Delta>, MapError>;

    /// Expression evaluations that failed so far.
    fn expression_failures(&self) -> u64 {
        0
    }
}

/// Build the mapper for `config.protocol`.
pub fn build(config: &MapperConfig) -> Result<Box<dyn ProtocolMapper>, MapError> {
    let context = config.context.as_str();
    let mappings = config.mappings.as_slice();
    let mapper: Box<dyn ProtocolMapper> = match config.protocol.as_str() {
        "nmea0183" => Box::new(nmea::NmeaMapper::new(
            context,
            &config.protocol_options.nmeaparse,
            config.protocol_options.skipfaultdetection,
        )),
        "modbus" => Box::new(registers::RegisterMapper::new(
            registers::RegisterKind::Modbus,
            context,
            mappings,
        )),
        "manner" => Box::new(registers::RegisterMapper::new(
            registers::RegisterKind::Manner,
            context,
            mappings,
        )),
        "csv" => Box::new(csv::CsvMapper::new(context, mappings)),
        "json" => Box::new(json::JsonMapper::new(context, mappings)),
        "canbus" => {
            let path = config
                .protocol_options
                .dbc
                .as_deref()
                .ok_or_else(|| MapError::Config("canbus needs protocolOptions.dbc".to_string()))?;
            let text = std::fs::read_to_string(path)
                .map_err(|e| MapError::Dbc(format!("{path}: {e}")))?;
            let database = can::parse_dbc(&text)?;
            Box::new(can::CanMapper::new(context, database, mappings))
        }
        other => return Err(MapError::Config(format!("unknown protocol {other}"))),
    };
    Ok(mapper)
}
