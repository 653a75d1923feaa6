#![forbid(unsafe_code)]
#![warn(clippy::all)]

pub mod api;
pub mod bridge;
pub mod config;
pub mod polling;
pub mod stream;
pub mod supervisor;
pub mod telemetry;

pub use api::StatusApi;
pub use bridge::Bridge;
pub use config::BridgeConfig;
pub use polling::{callback, AdaptivePoller, PollCallback, PollPhase, PollSpec};
pub use stream::StreamClient;
pub use supervisor::{BackendSupervisor, StopOutcome};
pub use telemetry::TelemetryBuffers;
