//! Device payloads and the small amount of logic derived from them.
//!
//! `status.json` carries the current settings under `curvals` and, with
//! `show_avail=1`, the legal values under `avail`.  `sensors.json` maps each
//! sensor name to a series whose `data` is a list of `[timestamp_ms, [x, y, z]]`.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::Deserialize;
use serde_json::{Map, Value};

use crate::error::{CamError, Result};

/// Accelerometer threshold (m/s²) beyond which an axis counts as "down".
const TILT_THRESHOLD: f64 = 5.0;

// ── Enumerations ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Orientation {
    Landscape,
    Portrait,
    AntiLandscape,
    AntiPortrait,
}

impl Orientation {
    /// Value understood by `settings/orientation?set=`.
    pub fn as_str(self) -> &'static str {
        match self {
            Orientation::Landscape     => "landscape",
            Orientation::Portrait      => "portrait",
            Orientation::AntiLandscape => "upsidedown",
            Orientation::AntiPortrait  => "upsidedown_portrait",
        }
    }
}

impl fmt::Display for Orientation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Orientation {
    type Err = CamError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "landscape"                                => Ok(Orientation::Landscape),
            "portrait"                                 => Ok(Orientation::Portrait),
            "upsidedown" | "anti-landscape"            => Ok(Orientation::AntiLandscape),
            "upsidedown_portrait" | "anti-portrait"    => Ok(Orientation::AntiPortrait),
            other => Err(CamError::InvalidArgument(format!("unknown orientation: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerState {
    On,
    Off,
}

impl FromStr for PowerState {
    type Err = CamError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "on"  => Ok(PowerState::On),
            "off" => Ok(PowerState::Off),
            other => Err(CamError::InvalidArgument(format!("unknown power state: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZoomDirection {
    In,
    Out,
}

// ── Status ────────────────────────────────────────────────────────────────────

/// Current settings (`curvals`).
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(transparent)]
pub struct StatusSnapshot(pub Map<String, Value>);

impl StatusSnapshot {
    pub fn get(&self, setting: &str) -> Option<&Value> {
        self.0.get(setting)
    }
}

/// Legal values per setting (`avail`), in device order.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(transparent)]
pub struct AvailableValues(pub BTreeMap<String, Vec<Value>>);

impl AvailableValues {
    pub fn get(&self, setting: &str) -> Option<&[Value]> {
        self.0.get(setting).map(Vec::as_slice)
    }

    /// Index of `value` in the available list for `setting`.
    pub fn index_of(&self, setting: &str, value: &Value) -> Option<usize> {
        self.get(setting)?.iter().position(|v| values_match(v, value))
    }
}

/// Pull `field` out of a `status.json` document.
pub(crate) fn status_field<T: serde::de::DeserializeOwned>(doc: Value, field: &str) -> Result<T> {
    let Value::Object(mut obj) = doc else {
        return Err(CamError::Parse("status.json is not an object".into()));
    };
    let inner = obj
        .remove(field)
        .ok_or_else(|| CamError::Parse(format!("status.json has no `{field}` field")))?;
    serde_json::from_value(inner)
        .map_err(|e| CamError::Parse(format!("status.json `{field}`: {e}")))
}

/// Equal JSON values, or equal text once string quoting is ignored.
/// The device reports zoom levels as strings in some versions and numbers in
/// others.
pub fn values_match(a: &Value, b: &Value) -> bool {
    a == b || value_text(a) == value_text(b)
}

pub fn value_text(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Next zoom index from the current zoom setting.
///
/// `Err(InvalidState)` when the current zoom is not in the available list,
/// `Ok(None)` when stepping would leave the list (no wraparound).
pub fn next_zoom_index(
    avail:     &AvailableValues,
    current:   &StatusSnapshot,
    direction: ZoomDirection,
) -> Result<Option<usize>> {
    let levels = avail
        .get("zoom")
        .ok_or_else(|| CamError::InvalidState("device reports no available zoom levels".into()))?;
    let cur = current
        .get("zoom")
        .ok_or_else(|| CamError::InvalidState("device reports no current zoom".into()))?;
    let idx = levels
        .iter()
        .position(|v| values_match(v, cur))
        .ok_or_else(|| CamError::InvalidState(format!("zoom {} not in available levels", value_text(cur))))?;

    Ok(match direction {
        ZoomDirection::In if idx + 1 < levels.len() => Some(idx + 1),
        ZoomDirection::Out if idx > 0               => Some(idx - 1),
        _ => None,
    })
}

// ── Sensors ───────────────────────────────────────────────────────────────────

/// One `sensors.json` document.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(transparent)]
pub struct SensorReadings(pub Map<String, Value>);

#[derive(Debug, Deserialize)]
struct SensorSeries {
    data: Vec<(f64, Vec<f64>)>,
}

/// Timestamped accelerometer reading.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SensorSample {
    pub timestamp_ms: i64,
    pub ax: f64,
    pub ay: f64,
    pub az: f64,
}

impl SensorReadings {
    /// Latest entry of the `accel` series.
    pub fn latest_accel(&self) -> Result<SensorSample> {
        let accel = self
            .0
            .get("accel")
            .ok_or_else(|| CamError::Parse("sensors.json has no `accel` series".into()))?;
        let series: SensorSeries = serde_json::from_value(accel.clone())
            .map_err(|e| CamError::Parse(format!("sensors.json `accel`: {e}")))?;
        let (ts, axes) = series
            .data
            .last()
            .ok_or_else(|| CamError::Parse("`accel` series is empty".into()))?;
        let [ax, ay, rest @ ..] = axes.as_slice() else {
            return Err(CamError::Parse(format!("accel sample has {} axes", axes.len())));
        };
        Ok(SensorSample {
            timestamp_ms: *ts as i64,
            ax: *ax,
            ay: *ay,
            az: rest.first().copied().unwrap_or(0.0),
        })
    }
}

/// Classify which way the device is mounted.
///
/// The y axis wins over the x axis.  When neither axis exceeds the threshold
/// (device lying flat, or mid-rotation) the result is `None`.
pub fn classify_orientation(sample: &SensorSample) -> Option<Orientation> {
    if sample.ay > TILT_THRESHOLD {
        Some(Orientation::Portrait)
    } else if sample.ay < -TILT_THRESHOLD {
        Some(Orientation::AntiPortrait)
    } else if sample.ax > TILT_THRESHOLD {
        Some(Orientation::Landscape)
    } else if sample.ax < -TILT_THRESHOLD {
        Some(Orientation::AntiLandscape)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn sample(ax: f64, ay: f64) -> SensorSample {
        SensorSample { timestamp_ms: 0, ax, ay, az: 0.0 }
    }

    fn zoom_state(levels: Value, current: Value) -> (AvailableValues, StatusSnapshot) {
        let avail = serde_json::from_value(json!({ "zoom": levels })).unwrap();
        let status = serde_json::from_value(json!({ "zoom": current })).unwrap();
        (avail, status)
    }

    #[test]
    fn positive_y_is_portrait_regardless_of_x() {
        for ax in [-9.8, -5.0, 0.0, 5.0, 9.8] {
            assert_eq!(classify_orientation(&sample(ax, 9.0)), Some(Orientation::Portrait));
            assert_eq!(classify_orientation(&sample(ax, 5.1)), Some(Orientation::Portrait));
        }
    }

    #[test]
    fn negative_y_is_anti_portrait() {
        for ax in [-9.8, 0.0, 9.8] {
            assert_eq!(classify_orientation(&sample(ax, -7.5)), Some(Orientation::AntiPortrait));
        }
    }

    #[test]
    fn x_axis_decides_when_y_is_level() {
        assert_eq!(classify_orientation(&sample(9.0, 0.0)), Some(Orientation::Landscape));
        assert_eq!(classify_orientation(&sample(-9.0, 5.0)), Some(Orientation::AntiLandscape));
        assert_eq!(classify_orientation(&sample(0.0, 0.0)), None);
        assert_eq!(classify_orientation(&sample(5.0, -5.0)), None);
        assert_eq!(classify_orientation(&sample(-5.0, 2.0)), None);
    }

    #[test]
    fn orientation_wire_names() {
        assert_eq!(Orientation::AntiLandscape.to_string(), "upsidedown");
        assert_eq!("upsidedown_portrait".parse::<Orientation>().unwrap(), Orientation::AntiPortrait);
        assert!(matches!("sideways".parse::<Orientation>(), Err(CamError::InvalidArgument(_))));
        assert!(matches!("dim".parse::<PowerState>(), Err(CamError::InvalidArgument(_))));
        assert_eq!("ON".parse::<PowerState>().unwrap(), PowerState::On);
    }

    #[test]
    fn zoom_steps_within_bounds() {
        let (avail, status) = zoom_state(json!([0, 1, 2, 3]), json!(2));
        assert_eq!(next_zoom_index(&avail, &status, ZoomDirection::In).unwrap(), Some(3));
        assert_eq!(next_zoom_index(&avail, &status, ZoomDirection::Out).unwrap(), Some(1));
    }

    #[test]
    fn zoom_does_not_wrap() {
        let (avail, top) = zoom_state(json!([0, 1, 2, 3]), json!(3));
        assert_eq!(next_zoom_index(&avail, &top, ZoomDirection::In).unwrap(), None);

        let (avail, bottom) = zoom_state(json!([0, 1, 2, 3]), json!(0));
        assert_eq!(next_zoom_index(&avail, &bottom, ZoomDirection::Out).unwrap(), None);
    }

    #[test]
    fn zoom_matches_string_and_number_forms() {
        let (avail, status) = zoom_state(json!(["0", "10", "20"]), json!(10));
        assert_eq!(next_zoom_index(&avail, &status, ZoomDirection::In).unwrap(), Some(2));
    }

    #[test]
    fn unknown_current_zoom_is_invalid_state() {
        let (avail, status) = zoom_state(json!([0, 1]), json!(7));
        let err = next_zoom_index(&avail, &status, ZoomDirection::In).unwrap_err();
        assert!(matches!(err, CamError::InvalidState(_)));

        let empty = StatusSnapshot::default();
        assert!(matches!(
            next_zoom_index(&avail, &empty, ZoomDirection::In),
            Err(CamError::InvalidState(_))
        ));
    }

    #[test]
    fn latest_accel_takes_last_entry() {
        let readings: SensorReadings = serde_json::from_value(json!({
            "accel": {
                "desc": ["Ax", "Ay", "Az"],
                "unit": "m/s²",
                "data": [
                    [1700000000000u64, [0.1, 9.7, 0.3]],
                    [1700000000050u64, [9.6, 0.2, 0.4]]
                ]
            },
            "light": { "data": [[1700000000000u64, [120.0]]] }
        }))
        .unwrap();

        let s = readings.latest_accel().unwrap();
        assert_eq!(s.timestamp_ms, 1_700_000_000_050);
        assert_eq!((s.ax, s.ay, s.az), (9.6, 0.2, 0.4));
        assert_eq!(classify_orientation(&s), Some(Orientation::Landscape));
    }

    #[test]
    fn missing_or_empty_accel_is_parse_error() {
        let none: SensorReadings = serde_json::from_value(json!({ "light": {} })).unwrap();
        assert!(matches!(none.latest_accel(), Err(CamError::Parse(_))));

        let empty: SensorReadings =
            serde_json::from_value(json!({ "accel": { "data": [] } })).unwrap();
        assert!(matches!(empty.latest_accel(), Err(CamError::Parse(_))));
    }

    #[test]
    fn status_field_requires_field() {
        let snap: StatusSnapshot =
            status_field(json!({ "curvals": { "zoom": "0" } }), "curvals").unwrap();
        assert_eq!(snap.get("zoom"), Some(&json!("0")));

        let err = status_field::<AvailableValues>(json!({ "curvals": {} }), "avail").unwrap_err();
        assert!(matches!(err, CamError::Parse(_)));
    }
}
