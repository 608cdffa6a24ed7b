//! Accumulated energy and cost
//!
//! Power is integrated over the measured wall-clock interval:
//! `kWh += W * ms / 3_600_000_000`.

/// Watt-milliseconds in one kilowatt-hour
pub const WATT_MS_PER_KWH: f64 = 3_600_000_000.0;

/// Convert a constant power held for `elapsed_ms` into kWh
pub fn energy_kwh(power_w: f64, elapsed_ms: u64) -> f64 {
    power_w * elapsed_ms as f64 / WATT_MS_PER_KWH
}

/// Persistent meter totals
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct EnergyState {
    /// Accumulated energy in kWh, never negative
    pub energy_kwh: f64,
    /// `energy_kwh * rate`, recomputed on every change
    pub cost: f64,
    /// Boot-relative time of the last integration step
    pub last_update_ms: u64,
}

impl EnergyState {
    /// Zero totals anchored at `now_ms`
    pub fn zero(now_ms: u64) -> Self {
        Self {
            energy_kwh: 0.0,
            cost: 0.0,
            last_update_ms: now_ms,
        }
    }

    /// Totals restored from storage, cost derived from the current rate
    pub fn restored(energy_kwh: f64, rate_per_kwh: f64, now_ms: u64) -> Self {
        let mut state = Self {
            energy_kwh: if energy_kwh.is_finite() && energy_kwh > 0.0 {
                energy_kwh
            } else {
                0.0
            },
            cost: 0.0,
            last_update_ms: now_ms,
        };
        state.recompute_cost(rate_per_kwh);
        state
    }

    /// Milliseconds since the last integration step
    pub fn elapsed_since(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.last_update_ms)
    }

    /// Add `power_w` held for `elapsed_ms` and advance the timestamp.
    ///
    /// Negative or non-finite power contributes nothing.
    pub fn integrate(&mut self, power_w: f64, elapsed_ms: u64, rate_per_kwh: f64) {
        if power_w.is_finite() && power_w > 0.0 {
            self.energy_kwh += energy_kwh(power_w, elapsed_ms);
        }
        self.last_update_ms = self.last_update_ms.saturating_add(elapsed_ms);
        self.recompute_cost(rate_per_kwh);
    }

    pub fn recompute_cost(&mut self, rate_per_kwh: f64) {
        self.cost = self.energy_kwh * rate_per_kwh;
    }

    /// Zero energy and cost, keeping the integration timestamp
    pub fn clear(&mut self) {
        self.energy_kwh = 0.0;
        self.cost = 0.0;
    }

    /// True when the persisted fields differ
    pub fn totals_differ(&self, other: &EnergyState) -> bool {
        self.energy_kwh.to_bits() != other.energy_kwh.to_bits()
            || self.cost.to_bits() != other.cost.to_bits()
    }
}
