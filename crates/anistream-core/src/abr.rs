//! Adaptive Bitrate (ABR) selection
//!
//! Throughput-based level selection for the headless HLS engine:
//! - EWMA bandwidth estimate over download measurements
//! - Safety factor applied before fitting a level
//! - Stability filter so a single noisy sample doesn't flip the level

use crate::types::QualityLevel;
use std::time::Duration;
use tracing::{debug, instrument};

/// Estimate used before the first measurement (bits per second)
pub const DEFAULT_ESTIMATE_BPS: u64 = 500_000;

/// Bandwidth measurement sample
#[derive(Debug, Clone)]
pub struct BandwidthMeasurement {
    /// Bytes downloaded
    pub bytes: usize,
    /// Time taken
    pub duration: Duration,
}

impl BandwidthMeasurement {
    /// Calculate throughput in bits per second
    pub fn throughput_bps(&self) -> u64 {
        if self.duration.as_secs_f64() > 0.0 {
            ((self.bytes as f64 * 8.0) / self.duration.as_secs_f64()) as u64
        } else {
            0
        }
    }
}

/// Throughput-driven level selection
pub struct ThroughputAbr {
    /// Share of the estimate a level may use (0.0-1.0)
    safety_factor: f64,
    /// Current bandwidth estimate
    estimate: Option<u64>,
    /// Last selected level index
    last_selection: Option<usize>,
    /// Consecutive picks disagreeing with the last selection
    stability_counter: u32,
}

impl ThroughputAbr {
    pub fn new() -> Self {
        Self {
            safety_factor: 0.8,
            estimate: None,
            last_selection: None,
            stability_counter: 0,
        }
    }

    /// Record a bandwidth measurement
    #[instrument(skip(self))]
    pub fn record_measurement(&mut self, bytes: usize, duration: Duration) {
        let measurement = BandwidthMeasurement { bytes, duration };
        let sample = measurement.throughput_bps();
        if sample == 0 {
            return;
        }

        // EWMA with alpha = 0.2
        let estimate = match self.estimate {
            None => sample,
            Some(previous) => ((previous as f64 * 0.8) + (sample as f64 * 0.2)) as u64,
        };
        self.estimate = Some(estimate);

        debug!(
            bytes = bytes,
            duration_ms = duration.as_millis(),
            throughput_mbps = sample as f64 / 1_000_000.0,
            estimate_mbps = estimate as f64 / 1_000_000.0,
            "Bandwidth measurement recorded"
        );
    }

    /// Current bandwidth estimate
    pub fn bandwidth_estimate(&self) -> u64 {
        self.estimate.unwrap_or(DEFAULT_ESTIMATE_BPS)
    }

    /// Highest-bandwidth level that fits the discounted estimate, else the
    /// cheapest one. Returns the level's index.
    pub fn select_level(&mut self, levels: &[QualityLevel]) -> Option<usize> {
        let available = (self.bandwidth_estimate() as f64 * self.safety_factor) as u64;

        let pick = levels
            .iter()
            .filter(|l| l.bandwidth <= available)
            .max_by_key(|l| l.bandwidth)
            .or_else(|| levels.iter().min_by_key(|l| l.bandwidth))?
            .index;

        // Apply stability filter to prevent oscillation
        if let Some(last) = self.last_selection {
            if pick != last && levels.iter().any(|l| l.index == last) {
                self.stability_counter += 1;
                if self.stability_counter < 3 {
                    return Some(last);
                }
            }
            self.stability_counter = 0;
        }

        self.last_selection = Some(pick);
        debug!(level = pick, available_bps = available, "Level selected");
        Some(pick)
    }

    /// Forget the last selection (new manifest)
    pub fn reset_selection(&mut self) {
        self.last_selection = None;
        self.stability_counter = 0;
    }
}

impl Default for ThroughputAbr {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn levels() -> Vec<QualityLevel> {
        vec![
            QualityLevel::new(0, 360, 800_000),
            QualityLevel::new(1, 720, 2_800_000),
            QualityLevel::new(2, 1080, 5_000_000),
        ]
    }

    #[test]
    fn test_throughput_selection() {
        let levels = levels();

        // 10 Mbps sample
        let mut abr = ThroughputAbr::new();
        abr.record_measurement(1_250_000, Duration::from_secs(1));
        assert_eq!(abr.select_level(&levels), Some(2));

        // 1 Mbps sample
        let mut abr = ThroughputAbr::new();
        abr.record_measurement(125_000, Duration::from_secs(1));
        assert_eq!(abr.select_level(&levels), Some(0));
    }

    #[test]
    fn test_default_estimate_picks_lowest() {
        let mut abr = ThroughputAbr::new();
        assert_eq!(abr.select_level(&levels()), Some(0));
        assert!(abr.select_level(&[]).is_none());
    }

    #[test]
    fn test_stability_filter() {
        let levels = levels();
        let mut abr = ThroughputAbr::new();
        abr.record_measurement(125_000, Duration::from_secs(1));
        assert_eq!(abr.select_level(&levels), Some(0));

        // Bandwidth jumps; the switch only lands on the third disagreeing pick
        for _ in 0..10 {
            abr.record_measurement(2_500_000, Duration::from_secs(1));
        }
        assert_eq!(abr.select_level(&levels), Some(0));
        assert_eq!(abr.select_level(&levels), Some(0));
        assert_eq!(abr.select_level(&levels), Some(2));
    }

    #[test]
    fn test_zero_duration_sample_ignored() {
        let mut abr = ThroughputAbr::new();
        abr.record_measurement(1_000, Duration::ZERO);
        assert_eq!(abr.bandwidth_estimate(), DEFAULT_ESTIMATE_BPS);
    }
}
