//! AIS (VDM/VDO) payload decoding.
//!
//! Supported message types: 1, 2, 3 (class A position), 5 (static and
//! voyage data), 18 (class B position), 19 (extended class B) and 24
//! (class B static, parts A and B). Other types decode to no values.

use std::collections::HashMap;

use serde_json::json;

use signalk_core::PathValue;

use super::sentences::KNOTS;
use crate::MapError;

const MAX_PENDING: usize = 32;

/// Payload bits after 6-bit de-armoring.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bits(Vec<bool>);

impl Bits {
    pub fn from_armor(payload: &str, fill: u8) -> Result<Self, MapError> {
        let mut bits = Vec::with_capacity(payload.len() * 6);
        for c in payload.bytes() {
            let v = match c {
                48..=87 => c - 48,
                96..=119 => c - 56,
                _ => return Err(MapError::Ais(format!("invalid payload character {:?}", c as char))),
            };
            bits.extend((0..6).rev().map(|i| (v >> i) & 1 == 1));
        }
        let keep = bits.len().saturating_sub(usize::from(fill));
        bits.truncate(keep);
        Ok(Bits(bits))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn uint(&self, start: usize, len: usize) -> Option<u64> {
        let bits = self.0.get(start..start + len)?;
        Some(bits.iter().fold(0u64, |acc, b| (acc << 1) | u64::from(*b)))
    }

    pub fn int(&self, start: usize, len: usize) -> Option<i64> {
        let raw = self.uint(start, len)?;
        let shift = 64 - len as u32;
        Some(((raw << shift) as i64) >> shift)
    }

    /// Six-bit text, trailing `@` padding and spaces removed.
    pub fn text(&self, start: usize, len: usize) -> Option<String> {
        let mut s = String::with_capacity(len / 6);
        for i in 0..len / 6 {
            let v = self.uint(start + i * 6, 6)? as u8;
            s.push(if v < 32 { (v + 64) as char } else { v as char });
        }
        let trimmed = s.trim_end_matches(&['@', ' '][..]).trim();
        Some(trimmed.to_string())
    }
}

#[derive(Debug)]
struct Pending {
    total: usize,
    parts: Vec<Option<String>>,
}

/// Reassembles multi-fragment VDM/VDO messages.
#[derive(Debug, Default)]
pub struct AisAssembler {
    pending: HashMap<String, Pending>,
}

fn count(fields: &[&str], i: usize) -> Result<usize, MapError> {
    fields
        .get(i)
        .and_then(|s| s.trim().parse::<usize>().ok())
        .ok_or_else(|| MapError::Ais(format!("bad fragment field {i}")))
}

impl AisAssembler {
    /// Feed the fields of one VDM/VDO sentence (after the address). Returns
    /// the message bits once every fragment has arrived.
    pub fn push(&mut self, fields: &[&str]) -> Result<Option<Bits>, MapError> {
        let total = count(fields, 0)?;
        let number = count(fields, 1)?;
        if total == 0 || number == 0 || number > total || total > 9 {
            return Err(MapError::Ais(format!("fragment {number} of {total}")));
        }
        let payload = fields.get(4).copied().unwrap_or_default();
        let fill = fields
            .get(5)
            .and_then(|s| s.trim().parse::<u8>().ok())
            .unwrap_or(0);

        if total == 1 {
            return Bits::from_armor(payload, fill).map(Some);
        }

        let key = format!(
            "{}:{}",
            fields.get(2).copied().unwrap_or_default(),
            fields.get(3).copied().unwrap_or_default()
        );
        if number == 1 {
            if self.pending.len() >= MAX_PENDING {
                self.pending.clear();
            }
            self.pending.insert(
                key.clone(),
                Pending {
                    total,
                    parts: vec![None; total],
                },
            );
        }
        let Some(pending) = self.pending.get_mut(&key) else {
            return Ok(None);
        };
        if pending.total != total {
            self.pending.remove(&key);
            return Ok(None);
        }
        pending.parts[number - 1] = Some(payload.to_string());
        if number < total || pending.parts.iter().any(Option::is_none) {
            return Ok(None);
        }

        let joined: String = self
            .pending
            .remove(&key)
            .map(|p| p.parts.into_iter().flatten().collect())
            .unwrap_or_default();
        Bits::from_armor(&joined, fill).map(Some)
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AisReport {
    pub msg_type: u8,
    pub mmsi: u32,
    pub values: Vec<PathValue>,
}

fn push(values: &mut Vec<PathValue>, path: &str, value: serde_json::Value) {
    values.push(PathValue {
        path: path.to_string(),
        value,
    });
}

fn nav_state(code: u64) -> Option<&'static str> {
    Some(match code {
        0 => "motoring",
        1 => "anchored",
        2 => "not under command",
        3 => "restricted manouverability",
        4 => "constrained by draft",
        5 => "moored",
        6 => "aground",
        7 => "fishing",
        8 => "sailing",
        14 => "ais-sart",
        _ => return None,
    })
}

fn ship_type_name(id: u64) -> &'static str {
    match id {
        20..=29 => "Wing In Ground",
        30 => "Fishing",
        31 | 32 => "Towing",
        33 => "Dredging",
        34 => "Diving",
        35 => "Military",
        36 => "Sailing",
        37 => "Pleasure",
        40..=49 => "High speed craft",
        50 => "Pilot vessel",
        51 => "SAR",
        52 => "Tug",
        53 => "Port tender",
        54 => "Anti-pollution",
        55 => "Law enforcement",
        58 => "Medical",
        60..=69 => "Passenger",
        70..=79 => "Cargo",
        80..=89 => "Tanker",
        _ => "Other",
    }
}

/// Position, SOG, COG and heading at the given bit offsets.
fn movement(
    bits: &Bits,
    out: &mut Vec<PathValue>,
    sog: usize,
    lon: usize,
    lat: usize,
    cog: usize,
    hdg: usize,
) {
    if let Some(v) = bits.uint(sog, 10).filter(|v| *v != 1023) {
        push(out, "navigation.speedOverGround", json!(v as f64 / 10.0 * KNOTS));
    }
    let longitude = bits.int(lon, 28).map(|v| v as f64 / 600_000.0);
    let latitude = bits.int(lat, 27).map(|v| v as f64 / 600_000.0);
    if let (Some(longitude), Some(latitude)) = (longitude, latitude) {
        if longitude.abs() <= 180.0 && latitude.abs() <= 90.0 {
            push(
                out,
                "navigation.position",
                json!({"longitude": longitude, "latitude": latitude}),
            );
        }
    }
    if let Some(v) = bits.uint(cog, 12).filter(|v| *v < 3600) {
        push(out, "navigation.courseOverGroundTrue", json!((v as f64 / 10.0).to_radians()));
    }
    if let Some(v) = bits.uint(hdg, 9).filter(|v| *v < 360) {
        push(out, "navigation.headingTrue", json!((v as f64).to_radians()));
    }
}

/// Bow/stern/port/starboard antenna offsets starting at `at`.
fn dimensions(bits: &Bits, out: &mut Vec<PathValue>, at: usize) {
    let (Some(bow), Some(stern), Some(port), Some(starboard)) = (
        bits.uint(at, 9),
        bits.uint(at + 9, 9),
        bits.uint(at + 18, 6),
        bits.uint(at + 24, 6),
    ) else {
        return;
    };
    if bow + stern > 0 {
        push(out, "design.length", json!({"overall": (bow + stern) as f64}));
        push(out, "sensors.ais.fromBow", json!(bow as f64));
    }
    if port + starboard > 0 {
        push(out, "design.beam", json!((port + starboard) as f64));
        push(
            out,
            "sensors.ais.fromCenter",
            json!((port as f64 - starboard as f64) / 2.0),
        );
    }
}

fn name(bits: &Bits, out: &mut Vec<PathValue>, at: usize) {
    if let Some(name) = bits.text(at, 120).filter(|s| !s.is_empty()) {
        push(out, "name", json!(name));
    }
}

fn ship_type(bits: &Bits, out: &mut Vec<PathValue>, at: usize) {
    if let Some(id) = bits.uint(at, 8).filter(|v| *v > 0) {
        push(
            out,
            "design.aisShipType",
            json!({"id": id, "name": ship_type_name(id)}),
        );
    }
}

fn callsign(bits: &Bits, out: &mut Vec<PathValue>, at: usize) {
    if let Some(cs) = bits.text(at, 42).filter(|s| !s.is_empty()) {
        push(out, "communication.callsignVhf", json!(cs));
    }
}

pub fn decode(bits: &Bits) -> Result<AisReport, MapError> {
    let msg_type = bits
        .uint(0, 6)
        .ok_or_else(|| MapError::Ais("empty payload".to_string()))? as u8;
    let mmsi = bits
        .uint(8, 30)
        .ok_or_else(|| MapError::Ais(format!("type {msg_type} payload too short")))?
        as u32;

    let mut out = Vec::new();
    match msg_type {
        1..=3 => {
            if let Some(state) = bits.uint(38, 4).and_then(nav_state) {
                push(&mut out, "navigation.state", json!(state));
            }
            if let Some(rot) = bits.int(42, 8).filter(|r| r.abs() < 127) {
                let deg_per_min = (rot as f64 / 4.733).powi(2) * (rot as f64).signum();
                push(
                    &mut out,
                    "navigation.rateOfTurn",
                    json!(deg_per_min.to_radians() / 60.0),
                );
            }
            movement(bits, &mut out, 50, 61, 89, 116, 128);
        }
        5 => {
            if let Some(imo) = bits.uint(40, 30).filter(|v| *v > 0) {
                push(&mut out, "registrations.imo", json!(format!("IMO {imo}")));
            }
            callsign(bits, &mut out, 70);
            name(bits, &mut out, 112);
            ship_type(bits, &mut out, 232);
            dimensions(bits, &mut out, 240);
            if let Some(d) = bits.uint(294, 8).filter(|v| *v > 0) {
                push(&mut out, "design.draft", json!({"current": d as f64 / 10.0}));
            }
            if let Some(dest) = bits.text(302, 120).filter(|s| !s.is_empty()) {
                push(&mut out, "navigation.destination.commonName", json!(dest));
            }
        }
        18 => movement(bits, &mut out, 46, 57, 85, 112, 124),
        19 => {
            movement(bits, &mut out, 46, 57, 85, 112, 124);
            name(bits, &mut out, 143);
            ship_type(bits, &mut out, 263);
            dimensions(bits, &mut out, 271);
        }
        24 => match bits.uint(38, 2) {
            Some(0) => name(bits, &mut out, 40),
            Some(1) => {
                ship_type(bits, &mut out, 40);
                callsign(bits, &mut out, 90);
                dimensions(bits, &mut out, 132);
            }
            _ => {}
        },
        _ => {}
    }
    Ok(AisReport {
        msg_type,
        mmsi,
        values: out,
    })
}
