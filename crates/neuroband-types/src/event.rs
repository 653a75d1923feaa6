use crate::telemetry::{Sample, SensorKind, StreamMessage};
use serde::{Deserialize, Serialize};

/// Events fanned out by the stream client to its subscribers. Presentation
/// code consumes these; nothing in the core depends on who is listening.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum StreamEvent {
    Connectivity(bool),
    Batch {
        sensor: SensorKind,
        samples: Vec<Sample>,
    },
    Message(StreamMessage),
}
