use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SensorKind {
    Eeg,
    Ppg,
    Accelerometer,
    Gyroscope,
}

impl SensorKind {
    pub const ALL: [SensorKind; 4] = [
        SensorKind::Eeg,
        SensorKind::Ppg,
        SensorKind::Accelerometer,
        SensorKind::Gyroscope,
    ];
}

impl fmt::Display for SensorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SensorKind::Eeg => write!(f, "eeg"),
            SensorKind::Ppg => write!(f, "ppg"),
            SensorKind::Accelerometer => write!(f, "accelerometer"),
            SensorKind::Gyroscope => write!(f, "gyroscope"),
        }
    }
}

/// One telemetry sample as it appears on the wire: a unix timestamp in
/// seconds plus whatever per-channel fields the sensor emits (EEG channel
/// voltages, accelerometer axes, ...).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub timestamp: f64,
    #[serde(flatten)]
    pub fields: BTreeMap<String, f64>,
}

impl Sample {
    pub fn new(timestamp: f64) -> Self {
        Self {
            timestamp,
            fields: BTreeMap::new(),
        }
    }

    pub fn with_field(mut self, name: &str, value: f64) -> Self {
        self.fields.insert(name.to_string(), value);
        self
    }
}

/// JSON frames exchanged with the backend over the stream, discriminated by
/// the `type` field.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamMessage {
    RawData {
        sensor_type: SensorKind,
        data: Vec<Sample>,
    },
    ProcessedData {
        sensor_type: SensorKind,
        data: Vec<Sample>,
    },
    Event {
        name: String,
        #[serde(default)]
        detail: serde_json::Value,
    },
    Handshake {
        client: String,
    },
    HealthCheck,
    HealthCheckResponse {
        status: String,
    },
}

impl StreamMessage {
    pub fn sensor_batch(&self) -> Option<(SensorKind, &[Sample])> {
        match self {
            StreamMessage::RawData { sensor_type, data }
            | StreamMessage::ProcessedData { sensor_type, data } => {
                Some((*sensor_type, data.as_slice()))
            }
            _ => None,
        }
    }
}
