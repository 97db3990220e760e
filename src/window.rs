//! Completed integration windows and their on-disk record layout.
//!
//! A capture file is a JSON object whose keys appear in this order:
//!
//! ```text
//! prefactor, unit, rate, points, dropped, channels
//! ```
//!
//! `channels` maps device labels (`AIN0`, ...) to sample arrays in channel
//! order. Earlier captures rely on that order, so the writer emits it
//! explicitly rather than leaving it to map iteration.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};

use crate::config::ChannelId;
use crate::device::ChannelSamples;
use crate::errors::StoreError;

const DEFAULT_PREFACTOR: f64 = 1.0;
const DEFAULT_UNIT: &str = "V";

/// One integration window, decoded. Immutable once handed to the consumer.
///
/// Channel lengths may differ by a sample or so because packet boundaries do
/// not line up with scans; use [`Window::common_len`] or
/// [`Window::truncated`] when equal lengths matter.
#[derive(Debug, Clone, PartialEq)]
pub struct Window {
    /// Per-channel rate the run was configured with.
    pub rate: u32,
    pub channels: ChannelSamples,
    /// Samples the device reported as dropped during the window.
    pub dropped: u64,
}

impl Window {
    pub fn n_channels(&self) -> usize {
        self.channels.len()
    }

    pub fn channel(&self, id: ChannelId) -> Option<&[f64]> {
        self.channels.get(&id).map(Vec::as_slice)
    }

    /// Longest channel length.
    pub fn points(&self) -> usize {
        self.channels.values().map(Vec::len).max().unwrap_or(0)
    }

    /// Shortest channel length.
    pub fn common_len(&self) -> usize {
        self.channels.values().map(Vec::len).min().unwrap_or(0)
    }

    /// Copy with every channel cut to [`Window::common_len`].
    pub fn truncated(&self) -> Window {
        let len = self.common_len();
        Window {
            rate: self.rate,
            channels: self
                .channels
                .iter()
                .map(|(id, v)| (*id, v[..len].to_vec()))
                .collect(),
            dropped: self.dropped,
        }
    }

    /// Nominal sample count the window covers across all channels.
    pub fn total_points(&self) -> usize {
        self.points() * self.n_channels()
    }

    pub fn duration(&self) -> Duration {
        if self.rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.points() as f64 / f64::from(self.rate))
    }

    /// Human-readable drop report, e.g. `Dropped 3 of 20000 points.`
    pub fn dropped_summary(&self) -> String {
        format!("Dropped {} of {} points.", self.dropped, self.total_points())
    }
}

/// Display scaling stored alongside a window: `value × prefactor` in `unit`.
#[derive(Debug, Clone, PartialEq)]
pub struct Scaling {
    pub prefactor: f64,
    pub unit: String,
}

impl Default for Scaling {
    fn default() -> Self {
        Self {
            prefactor: DEFAULT_PREFACTOR,
            unit: DEFAULT_UNIT.to_string(),
        }
    }
}

/// A window plus the scaling it was captured with; the unit of persistence.
#[derive(Debug, Clone, PartialEq)]
pub struct Capture {
    pub scaling: Scaling,
    pub window: Window,
}

impl Capture {
    pub fn new(window: Window) -> Self {
        Self {
            scaling: Scaling::default(),
            window,
        }
    }

    pub fn with_scaling(mut self, scaling: Scaling) -> Self {
        self.scaling = scaling;
        self
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_json(text: &str) -> Result<Self, StoreError> {
        let record: CaptureRecord = serde_json::from_str(text)?;
        Capture::try_from(record)
    }
}

// ============================================================================
// Record layout
// ============================================================================

struct LabeledChannels<'a>(&'a ChannelSamples);

impl Serialize for LabeledChannels<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (id, samples) in self.0 {
            map.serialize_entry(&id.to_string(), samples)?;
        }
        map.end()
    }
}

// Field order here is the file's key order.
#[derive(Serialize)]
struct RecordRef<'a> {
    prefactor: f64,
    unit: &'a str,
    rate: u32,
    points: usize,
    dropped: u64,
    channels: LabeledChannels<'a>,
}

impl Serialize for Capture {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        RecordRef {
            prefactor: self.scaling.prefactor,
            unit: &self.scaling.unit,
            rate: self.window.rate,
            points: self.window.points(),
            dropped: self.window.dropped,
            channels: LabeledChannels(&self.window.channels),
        }
        .serialize(serializer)
    }
}

fn default_prefactor() -> f64 {
    DEFAULT_PREFACTOR
}

fn default_unit() -> String {
    DEFAULT_UNIT.to_string()
}

/// Owned form of the record as read back. `points` is recomputed, not trusted.
#[derive(Debug, Deserialize)]
struct CaptureRecord {
    #[serde(default = "default_prefactor")]
    prefactor: f64,
    #[serde(default = "default_unit")]
    unit: String,
    rate: u32,
    #[serde(default)]
    #[allow(dead_code)]
    points: Option<usize>,
    dropped: u64,
    channels: BTreeMap<String, Vec<f64>>,
}

impl TryFrom<CaptureRecord> for Capture {
    type Error = StoreError;

    fn try_from(record: CaptureRecord) -> Result<Self, Self::Error> {
        let mut channels = ChannelSamples::new();
        for (label, samples) in record.channels {
            let id: ChannelId = label
                .parse()
                .map_err(|_| StoreError::BadChannelLabel(label.clone()))?;
            channels.insert(id, samples);
        }
        Ok(Capture {
            scaling: Scaling {
                prefactor: record.prefactor,
                unit: record.unit,
            },
            window: Window {
                rate: record.rate,
                channels,
                dropped: record.dropped,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn window() -> Window {
        let mut channels = ChannelSamples::new();
        channels.insert(ChannelId(0), vec![0.5, -0.25, 1.0]);
        channels.insert(ChannelId(2), vec![0.125, 0.0]);
        Window {
            rate: 5000,
            channels,
            dropped: 7,
        }
    }

    #[test]
    fn lengths_and_summary() {
        let w = window();
        assert_eq!(w.points(), 3);
        assert_eq!(w.common_len(), 2);
        assert_eq!(w.total_points(), 6);
        assert_eq!(w.dropped_summary(), "Dropped 7 of 6 points.");
        let t = w.truncated();
        assert!(t.channels.values().all(|v| v.len() == 2));
        assert_eq!(t.dropped, 7);
    }

    #[test]
    fn record_keys_in_fixed_order() {
        let json = Capture::new(window()).to_json().unwrap();
        let keys = ["\"prefactor\"", "\"unit\"", "\"rate\"", "\"points\"", "\"dropped\"", "\"channels\""];
        let positions: Vec<usize> = keys.iter().map(|k| json.find(k).unwrap()).collect();
        assert!(positions.windows(2).all(|w| w[0] < w[1]), "{json}");
        assert!(json.find("\"AIN0\"").unwrap() < json.find("\"AIN2\"").unwrap());
    }

    #[test]
    fn record_reads_back() {
        let saved = Capture::new(window()).with_scaling(Scaling {
            prefactor: 1e-3,
            unit: "mV".into(),
        });
        let restored = Capture::from_json(&saved.to_json().unwrap()).unwrap();
        assert_eq!(restored.window.rate, 5000);
        assert_eq!(restored.window.dropped, 7);
        assert_eq!(restored.scaling.unit, "mV");
        for (id, samples) in &saved.window.channels {
            let back = restored.window.channel(*id).unwrap();
            assert_eq!(back.len(), samples.len());
            for (a, b) in samples.iter().zip(back) {
                assert!((a - b).abs() < 1e-12);
            }
        }
    }

    #[test]
    fn missing_scaling_falls_back_to_defaults() {
        let json = r#"{"rate": 100, "points": 1, "dropped": 0, "channels": {"AIN1": [0.5]}}"#;
        let capture = Capture::from_json(json).unwrap();
        assert_eq!(capture.scaling, Scaling::default());
        assert_eq!(capture.window.channel(ChannelId(1)), Some(&[0.5][..]));
    }

    #[test]
    fn rejects_unknown_label_and_missing_fields() {
        let bad_label = r#"{"rate": 100, "dropped": 0, "channels": {"X": [1.0]}}"#;
        assert!(matches!(
            Capture::from_json(bad_label),
            Err(StoreError::BadChannelLabel(_))
        ));
        let no_rate = r#"{"dropped": 0, "channels": {}}"#;
        assert!(matches!(Capture::from_json(no_rate), Err(StoreError::Json(_))));
    }
}
