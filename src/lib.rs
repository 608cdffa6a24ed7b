#![cfg_attr(not(test), no_std)]

//! ESP32-C3 Energy Meter Library
//!
//! This library provides the modules for a WiFi-enabled single-phase energy meter
//! that samples voltage/current waveforms, integrates energy and cost, persists
//! totals to flash, and reports readings to a display, a cloud dashboard and a
//! messaging bot.

extern crate alloc;

pub mod button;
pub mod display;
pub mod energy;
pub mod measurement;
pub mod meter;
pub mod notifier;
pub mod smoothing;
pub mod state_machine;
pub mod storage;
pub mod telemetry;
pub mod waveform;

#[cfg(target_arch = "riscv32")]
pub mod http;
#[cfg(target_arch = "riscv32")]
pub mod oled;
#[cfg(target_arch = "riscv32")]
pub mod wifi;

/// Project version information
pub const VERSION: &str = "0.1.0";

/// Default configuration constants
pub mod config {
    /// Measurement cycle period in milliseconds
    pub const MEASUREMENT_PERIOD_MS: u64 = 1_000;

    /// Bot notification period in milliseconds
    pub const NOTIFICATION_PERIOD_MS: u64 = 60_000;

    /// Button hold time that triggers an energy reset
    pub const LONG_PRESS_MS: u64 = 3_000;

    /// Button level must be stable this long before it is accepted
    pub const BUTTON_DEBOUNCE_MS: u64 = 30;

    /// Button polling interval
    pub const BUTTON_POLL_MS: u64 = 10;

    /// Exponential smoothing factor applied to voltage, current and power
    pub const SMOOTHING_ALPHA: f64 = 0.15;

    /// Raw RMS voltage below this is treated as no mains present
    pub const VOLTAGE_NOISE_FLOOR_V: f64 = 5.0;

    /// Tariff used to derive the accumulated cost
    pub const RATE_PER_KWH: f64 = 6.5;

    /// Voltage channel calibration (transformer ratio and divider)
    pub const VOLTAGE_CALIBRATION: f64 = 86.5;

    /// Current channel calibration (CT ratio / burden resistor)
    pub const CURRENT_CALIBRATION: f64 = 9.0;

    /// Phase-shift correction between the voltage and current channels
    pub const PHASE_CALIBRATION: f64 = 1.7;

    /// ADC supply voltage in millivolts
    pub const ADC_SUPPLY_MV: f64 = 3_300.0;

    /// Full-scale count of the 12-bit ADC
    pub const ADC_COUNTS: u16 = 4_096;

    /// Voltage sense GPIO (ADC1 channel 2)
    pub const VOLTAGE_ADC_PIN: u8 = 2;

    /// Current sense GPIO (ADC1 channel 3)
    pub const CURRENT_ADC_PIN: u8 = 3;

    /// Page / reset button GPIO (active low, internal pull-up)
    pub const BUTTON_PIN: u8 = 9;

    /// OLED I2C data GPIO
    pub const DISPLAY_SDA_PIN: u8 = 5;

    /// OLED I2C clock GPIO
    pub const DISPLAY_SCL_PIN: u8 = 6;

    /// Half-cycles of the mains waveform per observation window
    pub const SAMPLE_CROSSINGS: u32 = 20;

    /// Upper bound on one observation window
    pub const SAMPLE_TIMEOUT_MS: u64 = 2_000;

    /// Flash offset of the energy log (the NVS partition on the default table)
    pub const STORAGE_FLASH_OFFSET: u32 = 0x9000;

    /// Bytes from `STORAGE_FLASH_OFFSET` given over to the energy log
    pub const STORAGE_REGION_SIZE: u32 = 0x6000;

    /// Cloud dashboard API host
    pub const DASHBOARD_HOST: &str = "blynk.cloud";

    /// Messaging bot API host
    pub const TELEGRAM_HOST: &str = "api.telegram.org";

    /// WiFi configuration
    /// Read from environment variables at compile time
    pub const WIFI_SSID: &str = env!("WIFI_SSID");
    pub const WIFI_PASSWORD: &str = env!("WIFI_PASSWORD");

    /// Cloud dashboard device token
    pub const DASHBOARD_TOKEN: &str = env!("DASHBOARD_TOKEN");

    /// Messaging bot credentials
    pub const TELEGRAM_BOT_TOKEN: &str = env!("TELEGRAM_BOT_TOKEN");
    pub const TELEGRAM_CHAT_ID: &str = env!("TELEGRAM_CHAT_ID");

    /// WiFi connection timeout in milliseconds
    pub const WIFI_CONNECT_TIMEOUT_MS: u32 = 10000;

    /// WiFi reconnection interval in milliseconds
    pub const WIFI_RECONNECT_INTERVAL_MS: u32 = 5000;
}

/// Error types for the energy meter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeterError {
    /// WiFi connection error
    WiFiError,
    /// Network stack not ready or DNS/TCP failure
    NetworkError,
    /// HTTP request failed or returned a non-success status
    HttpError,
    /// Flash read or write error
    StorageError,
    /// Display bus or driver error
    DisplayError,
    /// ADC read error
    SamplingError,
    /// Text did not fit its fixed-capacity buffer
    FormatError,
}
