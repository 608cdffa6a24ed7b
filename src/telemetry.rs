//! Cloud dashboard telemetry
//!
//! Five virtual channels are pushed as one batch-update request per frame.

use crate::MeterError;
use crate::meter::MeterSnapshot;
use core::fmt::Write;
use heapless::String;

/// Upper bound for a batch update URL
pub const URL_CAPACITY: usize = 256;

/// Dashboard channels, in publishing order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TelemetryChannel {
    Voltage,
    Current,
    Power,
    Energy,
    Cost,
}

impl TelemetryChannel {
    pub const ALL: [TelemetryChannel; 5] = [
        TelemetryChannel::Voltage,
        TelemetryChannel::Current,
        TelemetryChannel::Power,
        TelemetryChannel::Energy,
        TelemetryChannel::Cost,
    ];

    /// Virtual pin the dashboard widget is bound to
    pub fn pin(self) -> &'static str {
        match self {
            TelemetryChannel::Voltage => "V0",
            TelemetryChannel::Current => "V1",
            TelemetryChannel::Power => "V2",
            TelemetryChannel::Energy => "V3",
            TelemetryChannel::Cost => "V4",
        }
    }

    /// Decimal places sent for this channel
    fn precision(self) -> usize {
        match self {
            TelemetryChannel::Current | TelemetryChannel::Cost => 2,
            TelemetryChannel::Energy => 3,
            TelemetryChannel::Voltage | TelemetryChannel::Power => 1,
        }
    }
}

/// One set of channel values
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TelemetryFrame {
    values: [f64; 5],
}

impl TelemetryFrame {
    pub fn from_snapshot(snapshot: &MeterSnapshot) -> Self {
        Self {
            values: [
                snapshot.reading.voltage,
                snapshot.reading.current,
                snapshot.reading.power,
                snapshot.energy.energy_kwh,
                snapshot.energy.cost,
            ],
        }
    }

    pub fn value(&self, channel: TelemetryChannel) -> f64 {
        let index = TelemetryChannel::ALL
            .iter()
            .position(|&c| c == channel)
            .unwrap_or(0);
        self.values[index]
    }

    /// `(channel, value)` pairs in publishing order
    pub fn entries(&self) -> impl Iterator<Item = (TelemetryChannel, f64)> + '_ {
        TelemetryChannel::ALL.iter().copied().zip(self.values.iter().copied())
    }

    /// Batch update URL carrying every channel of this frame
    pub fn batch_url(&self, host: &str, token: &str) -> Result<String<URL_CAPACITY>, MeterError> {
        let mut url = String::new();
        write!(url, "https://{}/external/api/batch/update?token={}", host, token)
            .map_err(|_| MeterError::FormatError)?;

        for (channel, value) in self.entries() {
            write!(url, "&{}={:.*}", channel.pin(), channel.precision(), value)
                .map_err(|_| MeterError::FormatError)?;
        }

        Ok(url)
    }
}

/// Destination for telemetry frames
pub trait TelemetrySink {
    fn publish(&mut self, frame: &TelemetryFrame) -> Result<(), MeterError>;
}
