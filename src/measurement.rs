//! Measurement processing
//!
//! Turns one raw `(voltage_rms, real_power)` observation into a de-noised
//! reading and integrates it into the accumulated totals. Persistence and
//! output live in [`crate::meter`]; this module is pure state.

use crate::config;
use crate::energy::EnergyState;
use crate::smoothing::ExponentialSmoother;

/// One observation window as reported by the sampler
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct RawSample {
    pub voltage_rms: f64,
    pub real_power: f64,
}

impl RawSample {
    pub fn new(voltage_rms: f64, real_power: f64) -> Self {
        Self {
            voltage_rms,
            real_power,
        }
    }

    /// Apply the noise floor and sign clamps. Non-finite values become 0.
    pub fn sanitized(self, noise_floor_v: f64) -> Self {
        let voltage_rms = if self.voltage_rms.is_finite() && self.voltage_rms >= noise_floor_v {
            self.voltage_rms
        } else {
            0.0
        };
        let real_power = if self.real_power.is_finite() && self.real_power > 0.0 {
            self.real_power
        } else {
            0.0
        };

        Self {
            voltage_rms,
            real_power,
        }
    }
}

/// Current implied by real power at the given voltage, 0 without voltage
pub fn derive_current(voltage: f64, real_power: f64) -> f64 {
    if voltage > 0.0 {
        real_power / voltage
    } else {
        0.0
    }
}

/// Smoothed instantaneous values
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct SmoothedReading {
    pub voltage: f64,
    pub current: f64,
    pub power: f64,
}

/// Smoothing and integration state for the measurement cycle
#[derive(Debug, Clone)]
pub struct MeasurementProcessor {
    voltage: ExponentialSmoother,
    current: ExponentialSmoother,
    power: ExponentialSmoother,
    noise_floor_v: f64,
    rate_per_kwh: f64,
    state: EnergyState,
    reading: Option<SmoothedReading>,
}

impl MeasurementProcessor {
    /// Processor with the compile-time smoothing factor, noise floor and tariff
    pub fn new(state: EnergyState) -> Self {
        Self::with_parameters(
            state,
            config::SMOOTHING_ALPHA,
            config::VOLTAGE_NOISE_FLOOR_V,
            config::RATE_PER_KWH,
        )
    }

    pub fn with_parameters(
        state: EnergyState,
        alpha: f64,
        noise_floor_v: f64,
        rate_per_kwh: f64,
    ) -> Self {
        let mut state = state;
        state.recompute_cost(rate_per_kwh);

        Self {
            voltage: ExponentialSmoother::new(alpha),
            current: ExponentialSmoother::new(alpha),
            power: ExponentialSmoother::new(alpha),
            noise_floor_v,
            rate_per_kwh,
            state,
            reading: None,
        }
    }

    /// Run one measurement step over `elapsed_ms` of wall-clock time.
    ///
    /// The first call after construction seeds all three filters with the
    /// (clamped) raw values.
    pub fn update(&mut self, elapsed_ms: u64, raw: RawSample) -> (SmoothedReading, EnergyState) {
        let raw = raw.sanitized(self.noise_floor_v);
        let raw_current = derive_current(raw.voltage_rms, raw.real_power);

        let reading = SmoothedReading {
            voltage: self.voltage.update(raw.voltage_rms),
            current: self.current.update(raw_current),
            power: self.power.update(raw.real_power),
        };

        self.state.integrate(reading.power, elapsed_ms, self.rate_per_kwh);
        self.reading = Some(reading);

        (reading, self.state)
    }

    /// Zero the accumulated totals. Smoothing history is kept.
    pub fn reset(&mut self) -> EnergyState {
        self.state.clear();
        self.state.recompute_cost(self.rate_per_kwh);
        self.state
    }

    pub fn state(&self) -> EnergyState {
        self.state
    }

    /// Latest smoothed reading, `None` before the first cycle
    pub fn reading(&self) -> Option<SmoothedReading> {
        self.reading
    }
}
