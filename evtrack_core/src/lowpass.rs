//! First-order low-pass filter keyed by event timestamps.

/// Exponential smoother whose gain depends on the elapsed time between
/// samples: `value += (sample - value) * min(dt / tau, 1)`.
///
/// The first sample initializes the output directly.
#[derive(Debug, Clone)]
pub struct LowpassFilter {
    /// Time constant in microseconds
    tau_us: f64,
    value: f64,
    last_time: Option<i64>,
}

impl LowpassFilter {
    pub fn new(tau_ms: f64) -> Self {
        Self {
            tau_us: tau_ms * 1000.0,
            value: 0.0,
            last_time: None,
        }
    }

    /// Feed a sample observed at `time` (µs) and return the filtered value.
    pub fn filter(&mut self, sample: f64, time: i64) -> f64 {
        let Some(last) = self.last_time else {
            self.value = sample;
            self.last_time = Some(time);
            return self.value;
        };

        let dt = time.saturating_sub(last) as f64;
        if dt < 0.0 {
            // Clock went backwards: restart from this sample.
            self.value = sample;
        } else if self.tau_us > 0.0 && self.tau_us.is_finite() {
            let fac = (dt / self.tau_us).min(1.0);
            self.value += (sample - self.value) * fac;
        } else {
            self.value = sample;
        }
        self.last_time = Some(time);
        self.value
    }

    /// Overwrite the internal state (used when seeding a new cluster).
    pub fn set_internal_value(&mut self, value: f64) {
        self.value = value;
    }
}
