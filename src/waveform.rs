//! Waveform analysis for the voltage and current sense channels
//!
//! Raw 12-bit ADC pairs go in, RMS voltage, RMS current and real power come
//! out. The DC bias of each channel is tracked with a slow low-pass filter and
//! the voltage channel is phase-shifted towards the current channel before the
//! instantaneous power product is taken.

use crate::config;
use crate::measurement::RawSample;

/// Low-pass divisor for the DC offset trackers
const OFFSET_FILTER_DIVISOR: f64 = 4096.0;

/// Calibration of one analog front end
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Calibration {
    pub voltage: f64,
    pub current: f64,
    pub phase: f64,
    pub supply_mv: f64,
    pub adc_counts: u16,
}

impl Default for Calibration {
    fn default() -> Self {
        Self {
            voltage: config::VOLTAGE_CALIBRATION,
            current: config::CURRENT_CALIBRATION,
            phase: config::PHASE_CALIBRATION,
            supply_mv: config::ADC_SUPPLY_MV,
            adc_counts: config::ADC_COUNTS,
        }
    }
}

impl Calibration {
    /// Volts per ADC count
    pub fn voltage_ratio(&self) -> f64 {
        self.voltage * (self.supply_mv / 1000.0) / self.adc_counts as f64
    }

    /// Amps per ADC count
    pub fn current_ratio(&self) -> f64 {
        self.current * (self.supply_mv / 1000.0) / self.adc_counts as f64
    }

    /// Mid-scale ADC count, the expected DC bias
    pub fn midpoint(&self) -> f64 {
        self.adc_counts as f64 / 2.0
    }

    /// True when a raw voltage count is within 45-55% of full scale
    pub fn near_midpoint(&self, raw: u16) -> bool {
        let full = self.adc_counts as f64;
        let raw = raw as f64;
        raw > full * 0.45 && raw < full * 0.55
    }
}

/// Full result of one observation window
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct WaveformReading {
    pub voltage_rms: f64,
    pub current_rms: f64,
    pub real_power: f64,
    pub apparent_power: f64,
    pub power_factor: f64,
    pub samples: u32,
    pub crossings: u32,
}

impl WaveformReading {
    pub fn raw_sample(&self) -> RawSample {
        RawSample::new(self.voltage_rms, self.real_power)
    }
}

/// Accumulator for one observation window
#[derive(Debug, Clone)]
pub struct WaveformAnalyzer {
    calibration: Calibration,
    offset_v: f64,
    offset_i: f64,
    last_filtered_v: f64,
    last_above_mid: Option<bool>,
    sum_v: f64,
    sum_i: f64,
    sum_p: f64,
    samples: u32,
    crossings: u32,
}

impl WaveformAnalyzer {
    pub fn new(calibration: Calibration) -> Self {
        let mid = calibration.midpoint();
        Self {
            calibration,
            offset_v: mid,
            offset_i: mid,
            last_filtered_v: 0.0,
            last_above_mid: None,
            sum_v: 0.0,
            sum_i: 0.0,
            sum_p: 0.0,
            samples: 0,
            crossings: 0,
        }
    }

    /// Start a new window. Offset trackers keep their learned bias.
    pub fn begin_window(&mut self) {
        self.last_filtered_v = 0.0;
        self.last_above_mid = None;
        self.sum_v = 0.0;
        self.sum_i = 0.0;
        self.sum_p = 0.0;
        self.samples = 0;
        self.crossings = 0;
    }

    /// Accumulate one simultaneous voltage/current ADC pair
    pub fn push(&mut self, raw_v: u16, raw_i: u16) {
        let sample_v = raw_v as f64;
        let sample_i = raw_i as f64;

        self.offset_v += (sample_v - self.offset_v) / OFFSET_FILTER_DIVISOR;
        self.offset_i += (sample_i - self.offset_i) / OFFSET_FILTER_DIVISOR;
        let filtered_v = sample_v - self.offset_v;
        let filtered_i = sample_i - self.offset_i;

        // First sample of a window has no predecessor to interpolate from
        let shifted_v = if self.samples == 0 {
            filtered_v
        } else {
            self.last_filtered_v + self.calibration.phase * (filtered_v - self.last_filtered_v)
        };

        self.sum_v += filtered_v * filtered_v;
        self.sum_i += filtered_i * filtered_i;
        self.sum_p += shifted_v * filtered_i;
        self.samples += 1;
        self.last_filtered_v = filtered_v;

        let above_mid = sample_v > self.offset_v;
        if let Some(previous) = self.last_above_mid {
            if previous != above_mid {
                self.crossings += 1;
            }
        }
        self.last_above_mid = Some(above_mid);
    }

    /// Half-cycle crossings seen in the current window
    pub fn crossings(&self) -> u32 {
        self.crossings
    }

    pub fn samples(&self) -> u32 {
        self.samples
    }

    /// Reduce the window to RMS and power figures
    pub fn finish(&self) -> WaveformReading {
        if self.samples == 0 {
            return WaveformReading::default();
        }

        let n = self.samples as f64;
        let v_ratio = self.calibration.voltage_ratio();
        let i_ratio = self.calibration.current_ratio();

        let voltage_rms = v_ratio * libm::sqrt(self.sum_v / n);
        let current_rms = i_ratio * libm::sqrt(self.sum_i / n);
        let real_power = v_ratio * i_ratio * self.sum_p / n;
        let apparent_power = voltage_rms * current_rms;
        let power_factor = if apparent_power > 0.0 {
            real_power / apparent_power
        } else {
            0.0
        };

        WaveformReading {
            voltage_rms,
            current_rms,
            real_power,
            apparent_power,
            power_factor,
            samples: self.samples,
            crossings: self.crossings,
        }
    }
}

/// Source of one observation window per measurement cycle
pub trait Sampler {
    fn sample(&mut self) -> RawSample;
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::f64::consts::PI;

    const SAMPLES_PER_CYCLE: usize = 100;

    fn calibration() -> Calibration {
        Calibration {
            voltage: 100.0,
            current: 10.0,
            phase: 1.0,
            supply_mv: 3300.0,
            adc_counts: 4096,
        }
    }

    /// Feed `cycles` of sine waves with the given peak counts and phase lag
    fn feed(analyzer: &mut WaveformAnalyzer, peak_v: f64, peak_i: f64, lag: f64, cycles: usize) {
        for k in 0..cycles * SAMPLES_PER_CYCLE {
            let angle = 2.0 * PI * k as f64 / SAMPLES_PER_CYCLE as f64;
            let v = 2048.0 + peak_v * angle.sin();
            let i = 2048.0 + peak_i * (angle - lag).sin();
            analyzer.push(v.round() as u16, i.round() as u16);
        }
    }

    #[test]
    fn empty_window_reads_zero() {
        let analyzer = WaveformAnalyzer::new(calibration());
        let reading = analyzer.finish();
        assert_eq!(reading, WaveformReading::default());
        assert!(!reading.real_power.is_nan());
    }

    #[test]
    fn sine_rms_matches_calibrated_peak() {
        let cal = calibration();
        let mut analyzer = WaveformAnalyzer::new(cal);
        feed(&mut analyzer, 1000.0, 500.0, 0.0, 10);
        let reading = analyzer.finish();

        let expected_v = cal.voltage_ratio() * 1000.0 / 2f64.sqrt();
        let expected_i = cal.current_ratio() * 500.0 / 2f64.sqrt();
        assert!((reading.voltage_rms - expected_v).abs() / expected_v < 0.01);
        assert!((reading.current_rms - expected_i).abs() / expected_i < 0.01);
    }

    #[test]
    fn in_phase_load_has_unity_power_factor() {
        let mut analyzer = WaveformAnalyzer::new(calibration());
        feed(&mut analyzer, 1000.0, 500.0, 0.0, 10);
        let reading = analyzer.finish();
        assert!(reading.real_power > 0.0);
        assert!((reading.power_factor - 1.0).abs() < 0.02);
    }

    #[test]
    fn lagging_load_reduces_real_power() {
        let mut analyzer = WaveformAnalyzer::new(calibration());
        feed(&mut analyzer, 1000.0, 500.0, PI / 3.0, 10);
        let reading = analyzer.finish();
        assert!((reading.power_factor - 0.5).abs() < 0.03);
    }

    #[test]
    fn crossings_count_half_cycles() {
        let mut analyzer = WaveformAnalyzer::new(calibration());
        feed(&mut analyzer, 1000.0, 0.0, 0.0, 10);
        let crossings = analyzer.crossings();
        assert!((19..=21).contains(&crossings), "crossings = {crossings}");

        analyzer.begin_window();
        assert_eq!(analyzer.crossings(), 0);
        assert_eq!(analyzer.samples(), 0);
    }

    #[test]
    fn near_midpoint_window() {
        let cal = calibration();
        assert!(cal.near_midpoint(2048));
        assert!(!cal.near_midpoint(100));
        assert!(!cal.near_midpoint(4000));
    }
}
