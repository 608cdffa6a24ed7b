//! Exponential smoothing filter
//!
//! `smoothed = alpha * raw + (1 - alpha) * previous`, seeded with the first
//! observation so there is no start-up ramp from zero.

/// Single-channel exponential moving average
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExponentialSmoother {
    alpha: f64,
    value: Option<f64>,
}

impl ExponentialSmoother {
    /// Create a filter with the given factor, clamped into (0, 1]
    pub fn new(alpha: f64) -> Self {
        let alpha = if alpha.is_finite() {
            alpha.clamp(f64::EPSILON, 1.0)
        } else {
            1.0
        };

        Self { alpha, value: None }
    }

    /// Feed one observation and return the smoothed value
    pub fn update(&mut self, raw: f64) -> f64 {
        let next = match self.value {
            None => raw,
            Some(previous) => self.alpha * raw + (1.0 - self.alpha) * previous,
        };
        self.value = Some(next);
        next
    }

    /// Current smoothed value, `None` before the first observation
    pub fn value(&self) -> Option<f64> {
        self.value
    }

    pub fn alpha(&self) -> f64 {
        self.alpha
    }

    /// Forget history; the next observation seeds the filter again
    pub fn clear(&mut self) {
        self.value = None;
    }
}
