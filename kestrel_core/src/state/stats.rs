use serde::{Deserialize, Serialize};

/// Running statistics over state table advances, in seconds.
///
/// `period` is the interval between consecutive `advance` calls; `compute` is the time between a
/// cycle's `start` and its `advance`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PeriodStatistics {
    pub samples: u64,
    pub period_min: f64,
    pub period_max: f64,
    pub period_avg: f64,
    pub last_period: f64,
    pub compute_min: f64,
    pub compute_max: f64,
    pub compute_avg: f64,
    pub last_compute: f64,
}

impl PeriodStatistics {
    pub(crate) fn update(&mut self, period: Option<f64>, compute: f64) {
        let compute_samples = self.samples as f64;
        if self.samples == 0 {
            self.compute_min = compute;
            self.compute_max = compute;
        } else {
            self.compute_min = self.compute_min.min(compute);
            self.compute_max = self.compute_max.max(compute);
        }
        self.compute_avg = (self.compute_avg * compute_samples + compute) / (compute_samples + 1.0);
        self.last_compute = compute;

        // The first advance has no previous row to measure a period against
        if let Some(period) = period {
            let period_samples = self.samples.saturating_sub(1) as f64;
            if period_samples == 0.0 {
                self.period_min = period;
                self.period_max = period;
            } else {
                self.period_min = self.period_min.min(period);
                self.period_max = self.period_max.max(period);
            }
            self.period_avg = (self.period_avg * period_samples + period) / (period_samples + 1.0);
            self.last_period = period;
        }

        self.samples += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_running_statistics() {
        let mut stats = PeriodStatistics::default();
        stats.update(None, 0.002);
        stats.update(Some(0.010), 0.004);
        stats.update(Some(0.020), 0.003);

        assert_eq!(stats.samples, 3);
        assert_eq!(stats.period_min, 0.010);
        assert_eq!(stats.period_max, 0.020);
        assert!((stats.period_avg - 0.015).abs() < 1e-12);
        assert_eq!(stats.compute_min, 0.002);
        assert_eq!(stats.compute_max, 0.004);
        assert!((stats.compute_avg - 0.003).abs() < 1e-12);
        assert_eq!(stats.last_period, 0.020);
    }
}
