use chrono::{DateTime, Utc};
use neuroband_types::{Sample, SensorKind};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};
use tracing::trace;

pub const DEFAULT_CAPACITY: usize = 1000;

/// Rates are refreshed at most once per second across all channels; a
/// single shared cooldown bounds the recomputation cost at high sample
/// rates.
const RATE_REFRESH_INTERVAL: Duration = Duration::from_secs(1);

struct ChannelBuffer {
    samples: VecDeque<Sample>,
    rate: f64,
    last_update: Option<DateTime<Utc>>,
}

impl ChannelBuffer {
    fn new(capacity: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity),
            rate: 0.0,
            last_update: None,
        }
    }
}

/// Bounded per-channel sample storage with derived sampling rates. Appends
/// evict the oldest entries past capacity; reads are snapshots.
pub struct TelemetryBuffers {
    channels: RwLock<HashMap<SensorKind, ChannelBuffer>>,
    capacity: usize,
    last_rate_calc: Mutex<Option<Instant>>,
}

impl TelemetryBuffers {
    pub fn new(capacity: usize) -> Self {
        let mut channels = HashMap::new();
        for kind in SensorKind::ALL {
            channels.insert(kind, ChannelBuffer::new(capacity));
        }

        Self {
            channels: RwLock::new(channels),
            capacity,
            last_rate_calc: Mutex::new(None),
        }
    }

    pub fn append(&self, kind: SensorKind, samples: Vec<Sample>) {
        if !samples.is_empty() {
            let mut channels = self.channels.write();
            let buffer = channels
                .entry(kind)
                .or_insert_with(|| ChannelBuffer::new(self.capacity));

            trace!("Appending {} {} samples", samples.len(), kind);
            for sample in samples {
                if buffer.samples.len() >= self.capacity {
                    buffer.samples.pop_front();
                }
                buffer.samples.push_back(sample);
            }
            buffer.last_update = Some(Utc::now());
        }

        self.maybe_refresh_rates();
    }

    pub fn rate(&self, kind: SensorKind) -> f64 {
        self.channels
            .read()
            .get(&kind)
            .map(|buffer| buffer.rate)
            .unwrap_or(0.0)
    }

    pub fn len(&self, kind: SensorKind) -> usize {
        self.channels
            .read()
            .get(&kind)
            .map(|buffer| buffer.samples.len())
            .unwrap_or(0)
    }

    pub fn is_empty(&self, kind: SensorKind) -> bool {
        self.len(kind) == 0
    }

    pub fn snapshot(&self, kind: SensorKind) -> Vec<Sample> {
        self.channels
            .read()
            .get(&kind)
            .map(|buffer| buffer.samples.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn last_update(&self, kind: SensorKind) -> Option<DateTime<Utc>> {
        self.channels.read().get(&kind).and_then(|buffer| buffer.last_update)
    }

    /// Empties every channel. Rates keep their last values until the next
    /// append recomputes them.
    pub fn clear(&self) {
        let mut channels = self.channels.write();
        for buffer in channels.values_mut() {
            buffer.samples.clear();
        }
        *self.last_rate_calc.lock() = None;
    }

    fn maybe_refresh_rates(&self) {
        {
            let mut last = self.last_rate_calc.lock();
            if let Some(at) = *last {
                if at.elapsed() < RATE_REFRESH_INTERVAL {
                    return;
                }
            }
            *last = Some(Instant::now());
        }

        let mut channels = self.channels.write();
        for buffer in channels.values_mut() {
            buffer.rate = estimate_rate(&buffer.samples);
        }
    }
}

impl Default for TelemetryBuffers {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

/// Samples-per-second from the mean inter-arrival interval of the buffered
/// timestamps. Zero with fewer than two samples or a degenerate spread.
fn estimate_rate(samples: &VecDeque<Sample>) -> f64 {
    if samples.len() < 2 {
        return 0.0;
    }

    let mut timestamps: Vec<f64> = samples.iter().map(|s| s.timestamp).collect();
    timestamps.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

    let deltas: Vec<f64> = timestamps.windows(2).map(|pair| pair[1] - pair[0]).collect();
    let mean = deltas.iter().sum::<f64>() / deltas.len() as f64;
    if mean <= 0.0 || !mean.is_finite() {
        return 0.0;
    }
    1.0 / mean
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn samples_at(start: f64, spacing: f64, count: usize) -> Vec<Sample> {
        (0..count)
            .map(|i| Sample::new(start + spacing * i as f64))
            .collect()
    }

    #[test]
    fn test_append_bounded_by_capacity() {
        let buffers = TelemetryBuffers::new(10);
        buffers.append(SensorKind::Eeg, samples_at(0.0, 0.01, 25));

        assert_eq!(buffers.len(SensorKind::Eeg), 10);
        let snapshot = buffers.snapshot(SensorKind::Eeg);
        // only the most recent samples survive, in arrival order
        assert_eq!(snapshot.first().unwrap().timestamp, 0.15);
        assert_eq!(snapshot.last().unwrap().timestamp, 0.24);
    }

    #[test]
    fn test_rate_converges_at_fixed_spacing() {
        let buffers = TelemetryBuffers::new(100);
        buffers.append(SensorKind::Ppg, samples_at(100.0, 0.1, 20));

        let rate = buffers.rate(SensorKind::Ppg);
        assert!((rate - 10.0).abs() < 0.1, "rate was {}", rate);
    }

    #[test]
    fn test_rate_zero_below_two_samples() {
        let buffers = TelemetryBuffers::new(100);
        assert_eq!(buffers.rate(SensorKind::Eeg), 0.0);

        buffers.append(SensorKind::Eeg, samples_at(0.0, 0.1, 1));
        assert_eq!(buffers.rate(SensorKind::Eeg), 0.0);
    }

    #[test]
    fn test_rate_refresh_shares_one_cooldown() {
        let buffers = TelemetryBuffers::new(100);
        buffers.append(SensorKind::Eeg, samples_at(0.0, 0.1, 10));
        let first = buffers.rate(SensorKind::Eeg);
        assert!(first > 0.0);

        // inside the cooldown window: new data, rate unchanged
        buffers.append(SensorKind::Eeg, samples_at(10.0, 0.01, 10));
        assert_eq!(buffers.rate(SensorKind::Eeg), first);
    }

    #[test]
    fn test_empty_append_keeps_last_update() {
        let buffers = TelemetryBuffers::new(100);
        buffers.append(SensorKind::Gyroscope, samples_at(0.0, 0.1, 3));
        let stamped = buffers.last_update(SensorKind::Gyroscope);
        assert!(stamped.is_some());

        buffers.append(SensorKind::Gyroscope, Vec::new());
        assert_eq!(buffers.last_update(SensorKind::Gyroscope), stamped);
        assert_eq!(buffers.len(SensorKind::Gyroscope), 3);
    }

    #[test]
    fn test_clear_empties_channels_but_not_rates() {
        let buffers = TelemetryBuffers::new(100);
        buffers.append(SensorKind::Accelerometer, samples_at(0.0, 0.02, 50));
        let rate = buffers.rate(SensorKind::Accelerometer);
        assert!(rate > 0.0);

        buffers.clear();
        assert_eq!(buffers.len(SensorKind::Accelerometer), 0);
        assert_eq!(buffers.rate(SensorKind::Accelerometer), rate);

        // the next append recomputes from the emptied buffer
        buffers.append(SensorKind::Accelerometer, samples_at(0.0, 0.02, 1));
        assert_eq!(buffers.rate(SensorKind::Accelerometer), 0.0);
    }

    #[test]
    fn test_unordered_timestamps_are_sorted_for_rate() {
        let buffers = TelemetryBuffers::new(100);
        let mut samples = samples_at(0.0, 0.1, 10);
        samples.reverse();
        buffers.append(SensorKind::Eeg, samples);

        let rate = buffers.rate(SensorKind::Eeg);
        assert!((rate - 10.0).abs() < 0.1, "rate was {}", rate);
    }

    proptest! {
        #[test]
        fn prop_length_never_exceeds_capacity_and_keeps_tail(
            batch_sizes in proptest::collection::vec(0usize..40, 0..20)
        ) {
            let capacity = 50;
            let buffers = TelemetryBuffers::new(capacity);
            let mut expected: Vec<f64> = Vec::new();
            let mut next_ts = 0.0;

            for size in batch_sizes {
                let batch = samples_at(next_ts, 0.01, size);
                next_ts += 0.01 * size as f64;
                expected.extend(batch.iter().map(|s| s.timestamp));
                buffers.append(SensorKind::Eeg, batch);

                prop_assert!(buffers.len(SensorKind::Eeg) <= capacity);
            }

            let tail_start = expected.len().saturating_sub(capacity);
            let snapshot: Vec<f64> = buffers
                .snapshot(SensorKind::Eeg)
                .iter()
                .map(|s| s.timestamp)
                .collect();
            prop_assert_eq!(snapshot, &expected[tail_start..]);
        }
    }
}
