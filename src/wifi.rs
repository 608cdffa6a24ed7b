//! WiFi station management
//!
//! Association through esp-wifi 0.14.1; the IPv4 lease comes from the
//! embassy-net DHCP client.

use crate::{MeterError, config};
use embassy_net::Stack;
use embassy_time::{Duration, Instant, Timer};
use esp_wifi::wifi::{AuthMethod, ClientConfiguration, Configuration, WifiController};
use log::{info, warn};

/// Poll interval while waiting for association
const CONNECT_POLL_MS: u64 = 100;

pub struct WiFiManager<'a> {
    controller: WifiController<'a>,
    is_connected: bool,
    started: bool,
    stack: Option<Stack<'a>>,
}

impl<'a> WiFiManager<'a> {
    pub fn new(controller: WifiController<'a>) -> Self {
        Self {
            controller,
            is_connected: false,
            started: false,
            stack: None,
        }
    }

    /// Attach the network stack that owns the DHCP lease
    pub fn set_stack(&mut self, stack: Stack<'a>) {
        self.stack = Some(stack);
    }

    /// Associate with `ssid`, waiting at most the configured connect timeout
    pub async fn connect(&mut self, ssid: &str, password: &str) -> Result<(), MeterError> {
        info!("[WIFI] Connecting to WiFi network: {}", ssid);

        if !self.started {
            let auth_method = if password.is_empty() {
                AuthMethod::None
            } else {
                AuthMethod::WPA2Personal
            };
            let client_config = ClientConfiguration {
                ssid: ssid.try_into().map_err(|_| MeterError::WiFiError)?,
                password: password.try_into().map_err(|_| MeterError::WiFiError)?,
                auth_method,
                ..Default::default()
            };

            self.controller
                .set_configuration(&Configuration::Client(client_config))
                .map_err(|_| MeterError::WiFiError)?;
            self.controller.start().map_err(|_| MeterError::WiFiError)?;
            self.started = true;
        }

        self.controller.connect().map_err(|_| MeterError::WiFiError)?;

        let deadline =
            Instant::now() + Duration::from_millis(config::WIFI_CONNECT_TIMEOUT_MS as u64);
        while !self.controller.is_connected().unwrap_or(false) {
            if Instant::now() >= deadline {
                warn!("[WIFI] Association timed out");
                self.is_connected = false;
                return Err(MeterError::WiFiError);
            }
            Timer::after(Duration::from_millis(CONNECT_POLL_MS)).await;
        }

        self.is_connected = true;
        info!("[WIFI] Successfully connected to WiFi network");
        Ok(())
    }

    /// Leased IPv4 address, if DHCP has completed
    pub fn get_ip_address(&self) -> Option<[u8; 4]> {
        if !self.is_connected {
            return None;
        }

        let stack = self.stack.as_ref()?;
        match stack.config_v4() {
            Some(config) => Some(config.address.address().octets()),
            None => None,
        }
    }

    /// Refresh the cached link state and report the change, if any
    pub fn monitor_connection(&mut self) -> Result<bool, MeterError> {
        let current_status = self
            .controller
            .is_connected()
            .map_err(|_| MeterError::WiFiError)?;

        if self.is_connected && !current_status {
            warn!("[WIFI] WiFi connection lost!");
        } else if !self.is_connected && current_status {
            info!("[WIFI] WiFi connection restored!");
        }
        self.is_connected = current_status;

        Ok(current_status)
    }
}
