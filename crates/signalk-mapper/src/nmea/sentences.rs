//! Field tables for the supported NMEA 0183 sentences.
//!
//! Values are converted to SI units: m/s, radians, Kelvin, Pascal, metres.
//! Sentences carrying a validity flag emit nothing when it is not `A`.

use serde_json::{json, Value};

use signalk_core::PathValue;

use crate::MapError;

pub const KNOTS: f64 = 1852.0 / 3600.0;
pub const KPH: f64 = 1.0 / 3.6;
const FEET: f64 = 0.3048;
const FATHOMS: f64 = 1.8288;
const MPH: f64 = 0.44704;

/// Sentence types with a decoder here; AIS is handled separately.
pub const SUPPORTED: &[&str] = &[
    "RMC", "GGA", "GLL", "VTG", "VHW", "HDT", "HDG", "HDM", "DBT", "DPT", "MTW", "MWV", "MWD",
    "ROT", "RSA", "XDR",
];

fn text<'a>(fields: &[&'a str], i: usize) -> Option<&'a str> {
    fields.get(i).map(|s| s.trim()).filter(|s| !s.is_empty())
}

fn number(fields: &[&str], i: usize) -> Result<Option<f64>, MapError> {
    match text(fields, i) {
        None => Ok(None),
        Some(s) => s.parse::<f64>().map(Some).map_err(|_| MapError::Field {
            index: i,
            text: s.to_string(),
        }),
    }
}

fn flag(fields: &[&str], i: usize) -> bool {
    text(fields, i) == Some("A")
}

/// `ddmm.mmmm` / `dddmm.mmmm` plus hemisphere to signed degrees.
fn coordinate(fields: &[&str], i: usize) -> Result<Option<f64>, MapError> {
    let Some(raw) = number(fields, i)? else {
        return Ok(None);
    };
    let degrees = (raw / 100.0).trunc();
    let value = degrees + (raw - degrees * 100.0) / 60.0;
    Ok(match text(fields, i + 1) {
        Some("S") | Some("W") => Some(-value),
        Some(_) => Some(value),
        None => None,
    })
}

fn position(fields: &[&str], lat: usize, lon: usize) -> Result<Option<Value>, MapError> {
    match (coordinate(fields, lat)?, coordinate(fields, lon)?) {
        (Some(latitude), Some(longitude)) => {
            Ok(Some(json!({"latitude": latitude, "longitude": longitude})))
        }
        _ => Ok(None),
    }
}

fn radians(deg: f64) -> f64 {
    deg.to_radians()
}

/// km/h when present, knots otherwise.
fn speed(kn: Option<f64>, kph: Option<f64>) -> Option<f64> {
    kph.map(|v| v * KPH).or(kn.map(|v| v * KNOTS))
}

struct Values(Vec<PathValue>);

impl Values {
    fn new() -> Self {
        Values(Vec::new())
    }

    fn put(&mut self, path: &str, value: Option<f64>) {
        if let Some(v) = value.filter(|v| v.is_finite()) {
            self.0.push(PathValue {
                path: path.to_string(),
                value: json!(v),
            });
        }
    }

    fn put_value(&mut self, path: &str, value: Option<Value>) {
        if let Some(value) = value {
            self.0.push(PathValue {
                path: path.to_string(),
                value,
            });
        }
    }
}

/// Decode one sentence. `None` means the type is not supported; an empty
/// list means the sentence was valid but carried nothing usable.
pub fn decode(kind: &str, f: &[&str]) -> Result<Option<Vec<PathValue>>, MapError> {
    let mut out = Values::new();
    match kind {
        "RMC" => {
            if flag(f, 1) && text(f, 11) != Some("N") {
                out.put_value("navigation.position", position(f, 2, 4)?);
                out.put("navigation.speedOverGround", number(f, 6)?.map(|v| v * KNOTS));
                out.put("navigation.courseOverGroundTrue", number(f, 7)?.map(radians));
                let variation = number(f, 9)?.map(|v| match text(f, 10) {
                    Some("W") => -v,
                    _ => v,
                });
                out.put("navigation.magneticVariation", variation.map(radians));
            }
        }
        "GGA" => {
            let quality = number(f, 5)?.unwrap_or(0.0);
            if quality > 0.0 {
                out.put_value("navigation.position", position(f, 1, 3)?);
                out.put("navigation.gnss.satellites", number(f, 6)?);
                out.put("navigation.gnss.horizontalDilution", number(f, 7)?);
                out.put("navigation.gnss.antennaAltitude", number(f, 8)?);
                out.put("navigation.gnss.geoidalSeparation", number(f, 10)?);
            }
        }
        "GLL" => {
            if flag(f, 5) {
                out.put_value("navigation.position", position(f, 0, 2)?);
            }
        }
        "VTG" => {
            if text(f, 8) != Some("N") {
                out.put("navigation.courseOverGroundTrue", number(f, 0)?.map(radians));
                out.put("navigation.courseOverGroundMagnetic", number(f, 2)?.map(radians));
                out.put("navigation.speedOverGround", speed(number(f, 4)?, number(f, 6)?));
            }
        }
        "VHW" => {
            out.put("navigation.headingTrue", number(f, 0)?.map(radians));
            out.put("navigation.headingMagnetic", number(f, 2)?.map(radians));
            out.put("navigation.speedThroughWater", speed(number(f, 4)?, number(f, 6)?));
        }
        "HDT" => {
            out.put("navigation.headingTrue", number(f, 0)?.map(radians));
        }
        "HDG" => {
            out.put("navigation.headingMagnetic", number(f, 0)?.map(radians));
            let signed = |v: f64, i: usize| if text(f, i) == Some("W") { -v } else { v };
            out.put(
                "navigation.magneticDeviation",
                number(f, 1)?.map(|v| radians(signed(v, 2))),
            );
            out.put(
                "navigation.magneticVariation",
                number(f, 3)?.map(|v| radians(signed(v, 4))),
            );
        }
        "HDM" => {
            out.put("navigation.headingMagnetic", number(f, 0)?.map(radians));
        }
        "DBT" => {
            let depth = number(f, 2)?
                .or(number(f, 0)?.map(|v| v * FEET))
                .or(number(f, 4)?.map(|v| v * FATHOMS));
            out.put("environment.depth.belowTransducer", depth);
        }
        "DPT" => {
            let depth = number(f, 0)?;
            out.put("environment.depth.belowTransducer", depth);
            if let (Some(depth), Some(offset)) = (depth, number(f, 1)?) {
                if offset > 0.0 {
                    out.put("environment.depth.surfaceToTransducer", Some(offset));
                    out.put("environment.depth.belowSurface", Some(depth + offset));
                } else if offset < 0.0 {
                    out.put("environment.depth.transducerToKeel", Some(-offset));
                    out.put("environment.depth.belowKeel", Some(depth + offset));
                }
            }
        }
        "MTW" => {
            if text(f, 1).map_or(true, |u| u == "C") {
                out.put("environment.water.temperature", number(f, 0)?.map(|c| c + 273.15));
            }
        }
        "MWV" => {
            if flag(f, 4) {
                let unit = match text(f, 3) {
                    Some("K") => KPH,
                    Some("M") => 1.0,
                    Some("S") => MPH,
                    _ => KNOTS,
                };
                let angle = number(f, 0)?.map(|a| radians(if a > 180.0 { a - 360.0 } else { a }));
                let spd = number(f, 2)?.map(|v| v * unit);
                match text(f, 1) {
                    Some("R") => {
                        out.put("environment.wind.angleApparent", angle);
                        out.put("environment.wind.speedApparent", spd);
                    }
                    Some("T") => {
                        out.put("environment.wind.angleTrueWater", angle);
                        out.put("environment.wind.speedTrue", spd);
                    }
                    _ => {}
                }
            }
        }
        "MWD" => {
            out.put("environment.wind.directionTrue", number(f, 0)?.map(radians));
            out.put("environment.wind.directionMagnetic", number(f, 2)?.map(radians));
            let spd = number(f, 6)?.or(number(f, 4)?.map(|v| v * KNOTS));
            out.put("environment.wind.speedOverGround", spd);
        }
        "ROT" => {
            if flag(f, 1) {
                let rate = number(f, 0)?.map(|deg_per_min| radians(deg_per_min) / 60.0);
                out.put("navigation.rateOfTurn", rate);
            }
        }
        "RSA" => {
            if flag(f, 1) {
                out.put("steering.rudderAngle", number(f, 0)?.map(radians));
            }
        }
        "XDR" => {
            for base in (0..f.len()).step_by(4) {
                let name = text(f, base + 3).unwrap_or("");
                let value = number(f, base + 1)?;
                match (text(f, base), text(f, base + 2)) {
                    (Some("C"), Some("C")) => {
                        out.put(&xdr_path(name, "temperature"), value.map(|c| c + 273.15));
                    }
                    (Some("P"), Some("B")) => {
                        out.put(&xdr_path(name, "pressure"), value.map(|b| b * 100_000.0));
                    }
                    (Some("P"), Some("P")) => {
                        out.put(&xdr_path(name, "pressure"), value);
                    }
                    _ => {}
                }
            }
        }
        _ => return Ok(None),
    }
    Ok(Some(out.0))
}

/// Well-known transducer names go to the outside environment; anything else
/// is published under `sensors.xdr.<name>`.
fn xdr_path(name: &str, quantity: &str) -> String {
    const OUTSIDE: &[&str] = &[
        "",
        "AIRTEMP",
        "ENV_OUTSIDE_T",
        "TEMPAIR",
        "AIR",
        "BARO",
        "BAROMETER",
        "ENV_ATMOS_P",
    ];
    if OUTSIDE.contains(&name.to_ascii_uppercase().as_str()) {
        format!("environment.outside.{quantity}")
    } else {
        format!("sensors.xdr.{name}.{quantity}")
    }
}
