//! NMEA 0183 mapper, AIS included.
//!
//! Each Raw payload holds one sentence (several newline-separated sentences
//! are also accepted). The checksum is verified unless `skipfaultdetection`
//! is set, and `nmeaparse` restricts which sentence types are decoded.
//! AIS reports are published under the reporting vessel's MMSI context;
//! every other sentence goes to the configured context.

pub mod ais;
pub mod sentences;

use std::collections::HashSet;

use tracing::{trace, warn};

use signalk_core::{Delta, Source};
use signalk_protocol::RawMessage;

use crate::mapping::frame_delta;
use crate::{MapError, ProtocolMapper};
use ais::AisAssembler;

/// A sentence split into its parts. `fields` excludes the address field.
#[derive(Debug, Clone, PartialEq)]
pub struct Sentence<'a> {
    pub talker: &'a str,
    pub kind: &'a str,
    pub fields: Vec<&'a str>,
}

/// XOR of every byte between the start delimiter and `*`.
pub fn checksum(body: &str) -> u8 {
    body.bytes().fold(0, |acc, b| acc ^ b)
}

/// Split a sentence and verify its checksum when `verify` is set.
pub fn parse_sentence(line: &str, verify: bool) -> Result<Sentence<'_>, MapError> {
    let line = line.trim();
    let rest = line
        .strip_prefix('$')
        .or_else(|| line.strip_prefix('!'))
        .ok_or_else(|| MapError::Malformed("missing $ or ! start".to_string()))?;

    let (body, sum) = match rest.split_once('*') {
        Some((body, sum)) => (body, Some(sum)),
        None => (rest, None),
    };
    if verify {
        let sum = sum.ok_or(MapError::MissingChecksum)?;
        let got = sum
            .get(..2)
            .and_then(|hex| u8::from_str_radix(hex, 16).ok())
            .ok_or_else(|| MapError::Malformed(format!("bad checksum field {sum:?}")))?;
        let expected = checksum(body);
        if expected != got {
            return Err(MapError::Checksum { expected, got });
        }
    }

    let mut parts = body.split(',');
    let address = parts.next().unwrap_or_default();
    let (talker, kind) = if let Some(kind) = address.strip_prefix('P') {
        ("P", kind)
    } else if address.len() >= 5 && address.is_ascii() {
        address.split_at(2)
    } else {
        return Err(MapError::Malformed(format!("bad address {address:?}")));
    };
    Ok(Sentence {
        talker,
        kind,
        fields: parts.collect(),
    })
}

pub struct NmeaMapper {
    context: String,
    enabled: HashSet<String>,
    verify: bool,
    ais: AisAssembler,
}

impl NmeaMapper {
    pub fn new(context: &str, nmeaparse: &[String], skip_fault_detection: bool) -> Self {
        Self {
            context: context.to_string(),
            enabled: nmeaparse.iter().map(|s| s.to_ascii_uppercase()).collect(),
            verify: !skip_fault_detection,
            ais: AisAssembler::default(),
        }
    }

    fn is_enabled(&self, kind: &str) -> bool {
        self.enabled.is_empty() || self.enabled.contains(kind)
    }

    fn map_line(&mut self, line: &str, raw: &RawMessage) -> Result<Option<Delta>, MapError> {
        let sentence = parse_sentence(line, self.verify)?;
        if !self.is_enabled(sentence.kind) {
            trace!(sentence = %sentence.kind, "sentence type disabled");
            return Ok(None);
        }

        let mut source = Source::new(raw.connector.clone(), raw.protocol.clone());
        source.talker = Some(sentence.talker.to_string());
        source.sentence = Some(sentence.kind.to_string());

        if matches!(sentence.kind, "VDM" | "VDO") {
            let Some(bits) = self.ais.push(&sentence.fields)? else {
                return Ok(None);
            };
            let report = ais::decode(&bits)?;
            source.ais_type = Some(report.msg_type);
            let context = format!("vessels.urn:mrn:imo:mmsi:{:09}", report.mmsi);
            return Ok(frame_delta(&context, source, raw, report.values));
        }

        let Some(values) = sentences::decode(sentence.kind, &sentence.fields)? else {
            trace!(sentence = %sentence.kind, "unsupported sentence");
            return Ok(None);
        };
        Ok(frame_delta(&self.context, source, raw, values))
    }
}

impl ProtocolMapper for NmeaMapper {
    fn protocol(&self) -> &str {
        "nmea0183"
    }

    fn map(&mut self, raw: &RawMessage) -> Result<Vec<Delta>, MapError> {
        let text = std::str::from_utf8(&raw.payload).map_err(|_| MapError::Utf8)?;
        let mut deltas = Vec::new();
        let mut first_error = None;
        for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
            match self.map_line(line, raw) {
                Ok(Some(delta)) => deltas.push(delta),
                Ok(None) => {}
                Err(e) => {
                    warn!(connector = %raw.connector, sentence = %line, error = %e, "dropping sentence");
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) if deltas.is_empty() => Err(e),
            _ => Ok(deltas),
        }
    }
}

#[cfg(test)]
pub(crate) fn with_checksum(body: &str) -> String {
    format!("${body}*{:02X}", checksum(body))
}
