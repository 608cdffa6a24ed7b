//! Board bring-up and task wiring for the ESP32-C3

use core::cell::Cell;

use embassy_futures::select::{Either, select};
use embassy_net::{Config, Stack, StackResources};
use embassy_sync::blocking_mutex::Mutex as BlockingMutex;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Channel;
use embassy_sync::mutex::Mutex;
use embassy_sync::signal::Signal;
use embassy_time::{Duration, Instant, Ticker, Timer};
use esp_hal::Blocking;
use esp_hal::analog::adc::{Adc, AdcConfig, AdcPin, Attenuation};
use esp_hal::clock::CpuClock;
use esp_hal::gpio::{Input, InputConfig, Pull};
use esp_hal::i2c::master::{Config as I2cConfig, I2c};
use esp_hal::peripherals::{ADC1, GPIO2, GPIO3};
use esp_hal::rng::Rng;
use esp_hal::time::Rate;
use esp_hal::timer::timg::TimerGroup;
use esp_hal_embassy::Executor;
use esp_println::println;
use esp_storage::FlashStorage;
use esp_wifi::wifi;
use log::{debug, info, warn};
use static_cell::StaticCell;

use meter_rs::MeterError;
use meter_rs::button::{ButtonDetector, ButtonEvent};
use meter_rs::config;
use meter_rs::http::HttpsClient;
use meter_rs::measurement::RawSample;
use meter_rs::meter::{Meter, MeterSnapshot};
use meter_rs::notifier;
use meter_rs::oled::Oled;
use meter_rs::state_machine::{Action, ConnectivityStateMachine, SystemEvent, SystemState};
use meter_rs::storage::EnergyStore;
use meter_rs::telemetry::{TelemetryFrame, TelemetrySink};
use meter_rs::waveform::{Calibration, Sampler, WaveformAnalyzer, WaveformReading};
use meter_rs::wifi::WiFiManager;

esp_bootloader_esp_idf::esp_app_desc!();

type SharedStateMachine = Mutex<CriticalSectionRawMutex, ConnectivityStateMachine>;
type SharedHttp = Mutex<CriticalSectionRawMutex, HttpsClient>;
type MeterDisplay = Option<Oled<I2c<'static, Blocking>>>;
type FirmwareMeter = Meter<FlashStorage, MeterDisplay, SignalTelemetry>;

static WIFI_INIT_CELL: StaticCell<esp_wifi::EspWifiController<'static>> = StaticCell::new();
static STACK_RESOURCES: StaticCell<StackResources<3>> = StaticCell::new();
static WIFI_MANAGER_CELL: StaticCell<WiFiManager<'static>> = StaticCell::new();
static STATE_MACHINE_CELL: StaticCell<SharedStateMachine> = StaticCell::new();
static HTTP_CELL: StaticCell<SharedHttp> = StaticCell::new();
static EXECUTOR: StaticCell<Executor> = StaticCell::new();

/// Button events for the measurement task
static COMMANDS: Channel<CriticalSectionRawMutex, ButtonEvent, 4> = Channel::new();

/// Latest telemetry frame; an unsent frame is overwritten by the next one
static TELEMETRY: Signal<CriticalSectionRawMutex, TelemetryFrame> = Signal::new();

/// Snapshot after the most recent cycle, read by the notifier
static LATEST_SNAPSHOT: BlockingMutex<CriticalSectionRawMutex, Cell<Option<MeterSnapshot>>> =
    BlockingMutex::new(Cell::new(None));

#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    println!("[PANIC] {}", info);
    loop {}
}

/// Hands frames to the telemetry task without waiting on the network
struct SignalTelemetry;

impl TelemetrySink for SignalTelemetry {
    fn publish(&mut self, frame: &TelemetryFrame) -> Result<(), MeterError> {
        TELEMETRY.signal(*frame);
        Ok(())
    }
}

/// Two-channel ADC sampler synchronised to the mains voltage
struct AdcSampler {
    adc: Adc<'static, ADC1<'static>, Blocking>,
    voltage_pin: AdcPin<GPIO2<'static>, ADC1<'static>>,
    current_pin: AdcPin<GPIO3<'static>, ADC1<'static>>,
    calibration: Calibration,
    analyzer: WaveformAnalyzer,
}

impl AdcSampler {
    fn read_pair(&mut self) -> Result<(u16, u16), MeterError> {
        let voltage = nb::block!(self.adc.read_oneshot(&mut self.voltage_pin))
            .map_err(|_| MeterError::SamplingError)?;
        let current = nb::block!(self.adc.read_oneshot(&mut self.current_pin))
            .map_err(|_| MeterError::SamplingError)?;
        Ok((voltage, current))
    }

    fn observe(&mut self) -> Result<WaveformReading, MeterError> {
        let start = Instant::now();
        let timeout = Duration::from_millis(config::SAMPLE_TIMEOUT_MS);

        // Start the window close to a zero crossing
        loop {
            let (voltage, _) = self.read_pair()?;
            if self.calibration.near_midpoint(voltage) || start.elapsed() > timeout {
                break;
            }
        }

        self.analyzer.begin_window();
        while self.analyzer.crossings() < config::SAMPLE_CROSSINGS && start.elapsed() <= timeout {
            let (voltage, current) = self.read_pair()?;
            self.analyzer.push(voltage, current);
        }

        let reading = self.analyzer.finish();
        debug!(
            "[ADC] {} samples, {} crossings, pf {:.2}",
            reading.samples, reading.crossings, reading.power_factor
        );
        Ok(reading)
    }
}

impl Sampler for AdcSampler {
    fn sample(&mut self) -> RawSample {
        match self.observe() {
            Ok(reading) => reading.raw_sample(),
            Err(e) => {
                warn!("[ADC] Sampling failed: {:?}", e);
                RawSample::default()
            }
        }
    }
}

fn store_snapshot(snapshot: MeterSnapshot) {
    LATEST_SNAPSHOT.lock(|cell| cell.set(Some(snapshot)));
}

/// How long a connectivity state may last before it times out
fn state_timeout_ms(state: SystemState) -> u64 {
    let connect = config::WIFI_CONNECT_TIMEOUT_MS as u64;
    match state {
        SystemState::WiFiConnecting | SystemState::Reconnecting => connect * 4,
        SystemState::DHCPRequesting => connect * 3,
        SystemState::WiFiError | SystemState::DHCPError => {
            config::WIFI_RECONNECT_INTERVAL_MS as u64
        }
        SystemState::SystemInit | SystemState::Online => u64::MAX,
    }
}

#[embassy_executor::task]
async fn net_task(
    mut runner: embassy_net::Runner<'static, esp_wifi::wifi::WifiDevice<'static>>,
) -> ! {
    runner.run().await
}

/// Drives WiFi and DHCP from the connectivity state machine
#[embassy_executor::task]
async fn connectivity_task(
    wifi_manager: &'static mut WiFiManager<'static>,
    state_machine: &'static SharedStateMachine,
) -> ! {
    info!("[STATE] Starting connectivity task");

    state_machine
        .lock()
        .await
        .handle_event(SystemEvent::SystemStarted);

    let mut logged_error: Option<SystemState> = None;

    loop {
        let actions = {
            let mut sm = state_machine.lock().await;
            let timeout = state_timeout_ms(sm.get_current_state());
            if let Some(transition) = sm.tick(Instant::now().as_millis(), timeout) {
                debug!("[STATE] Timeout: {:?}", transition);
            }
            if !sm.is_error_state() {
                logged_error = None;
            }
            sm.update()
        };

        for action in actions {
            match action {
                Action::StartWiFiConnection => {
                    let event = match wifi_manager
                        .connect(config::WIFI_SSID, config::WIFI_PASSWORD)
                        .await
                    {
                        Ok(()) => SystemEvent::WiFiConnected,
                        Err(_) => SystemEvent::WiFiConnectionFailed,
                    };
                    state_machine.lock().await.handle_event(event);
                }
                Action::StartDHCPRequest => {
                    if let Some(ip) = wifi_manager.get_ip_address() {
                        info!(
                            "[DHCP] IP address obtained: {}.{}.{}.{}",
                            ip[0], ip[1], ip[2], ip[3]
                        );
                        state_machine
                            .lock()
                            .await
                            .handle_event(SystemEvent::DHCPSuccess);
                    } else {
                        Timer::after(Duration::from_millis(1000)).await;
                    }
                }
                Action::MonitorConnection => {
                    if !matches!(wifi_manager.monitor_connection(), Ok(true)) {
                        state_machine
                            .lock()
                            .await
                            .handle_event(SystemEvent::WiFiDisconnected);
                    }
                }
                Action::SystemRecover => {
                    info!("[STATE] Initiating recovery...");
                    state_machine
                        .lock()
                        .await
                        .handle_event(SystemEvent::RecoveryRequested);
                }
                Action::LogError(error_state) => {
                    if logged_error != Some(error_state) {
                        warn!("[STATE] Error logged: {:?}", error_state);
                        logged_error = Some(error_state);
                    }
                }
            }
        }

        Timer::after(Duration::from_millis(100)).await;
    }
}

/// Samples, integrates and renders once per period; applies button commands
#[embassy_executor::task]
async fn measurement_task(mut meter: FirmwareMeter, mut sampler: AdcSampler) -> ! {
    info!("[METER] Measurement task started");
    store_snapshot(meter.snapshot());

    let mut ticker = Ticker::every(Duration::from_millis(config::MEASUREMENT_PERIOD_MS));
    loop {
        match select(ticker.next(), COMMANDS.receive()).await {
            Either::First(()) => {
                let raw = sampler.sample();
                let snapshot = meter.tick(Instant::now().as_millis(), raw);
                store_snapshot(snapshot);
            }
            Either::Second(event) => {
                info!("[BUTTON] {:?}", event);
                meter.handle_button(event);
                store_snapshot(meter.snapshot());
            }
        }
    }
}

#[embassy_executor::task]
async fn button_task(button: Input<'static>) -> ! {
    let mut detector = ButtonDetector::default();
    loop {
        // Active low with the internal pull-up
        let pressed = button.is_low();
        if let Some(event) = detector.update(pressed, Instant::now().as_millis()) {
            COMMANDS.send(event).await;
        }
        Timer::after(Duration::from_millis(config::BUTTON_POLL_MS)).await;
    }
}

/// Uploads the newest frame whenever the network is online
#[embassy_executor::task]
async fn telemetry_task(http: &'static SharedHttp, state_machine: &'static SharedStateMachine) -> ! {
    if config::DASHBOARD_TOKEN.is_empty() {
        warn!("[HTTP] DASHBOARD_TOKEN not set, telemetry disabled");
    }

    loop {
        let frame = TELEMETRY.wait().await;
        if config::DASHBOARD_TOKEN.is_empty() || !state_machine.lock().await.is_online() {
            continue;
        }

        let url = match frame.batch_url(config::DASHBOARD_HOST, config::DASHBOARD_TOKEN) {
            Ok(url) => url,
            Err(e) => {
                warn!("[HTTP] Telemetry URL: {:?}", e);
                continue;
            }
        };

        if let Err(e) = http.lock().await.get(&url).await {
            warn!("[HTTP] Telemetry upload failed: {:?}", e);
        }
    }
}

/// Sends a report to the bot chat every notification period
#[embassy_executor::task]
async fn notification_task(
    http: &'static SharedHttp,
    state_machine: &'static SharedStateMachine,
) -> ! {
    let enabled = !config::TELEGRAM_BOT_TOKEN.is_empty() && !config::TELEGRAM_CHAT_ID.is_empty();
    if !enabled {
        warn!("[HTTP] Bot credentials not set, notifications disabled");
    }

    let mut ticker = Ticker::every(Duration::from_millis(config::NOTIFICATION_PERIOD_MS));
    loop {
        ticker.next().await;
        if !enabled || !state_machine.lock().await.is_online() {
            continue;
        }
        let Some(snapshot) = LATEST_SNAPSHOT.lock(|cell| cell.get()) else {
            continue;
        };

        let request = notifier::compose_report(&snapshot).and_then(|text| {
            let body = notifier::message_body(config::TELEGRAM_CHAT_ID, &text)?;
            let url = notifier::send_message_url(config::TELEGRAM_HOST, config::TELEGRAM_BOT_TOKEN)?;
            Ok((url, body))
        });

        match request {
            Ok((url, body)) => match http.lock().await.post_json(&url, &body).await {
                Ok(_) => info!("[HTTP] Notification sent"),
                Err(e) => warn!("[HTTP] Notification failed: {:?}", e),
            },
            Err(e) => warn!("[HTTP] Notification not built: {:?}", e),
        }
    }
}

pub fn run() -> ! {
    let peripherals = esp_hal::init(esp_hal::Config::default().with_cpu_clock(CpuClock::max()));

    // Heap for the WiFi driver
    esp_alloc::heap_allocator!(size: 72 * 1024);

    esp_println::logger::init_logger_from_env();
    println!("=== meter-rs {} ===", meter_rs::VERSION);

    let timer_group0 = TimerGroup::new(peripherals.TIMG0);
    esp_hal_embassy::init(timer_group0.timer0);

    let timer_group1 = TimerGroup::new(peripherals.TIMG1);
    let mut rng = Rng::new(peripherals.RNG);
    let net_seed = (rng.random() as u64) << 32 | rng.random() as u64;
    let tls_seed = (rng.random() as u64) << 32 | rng.random() as u64;
    let wifi_init = esp_wifi::init(timer_group1.timer0, rng, peripherals.RADIO_CLK).unwrap();
    let wifi_init = WIFI_INIT_CELL.init(wifi_init);
    let (wifi_controller, wifi_interfaces) = wifi::new(wifi_init, peripherals.WIFI).unwrap();
    info!("[WIFI] WiFi driver initialized");

    let (stack, runner) = embassy_net::new(
        wifi_interfaces.sta,
        Config::dhcpv4(Default::default()),
        STACK_RESOURCES.init(StackResources::new()),
        net_seed,
    );
    let stack: Stack<'static> = stack;

    let mut wifi_manager = WiFiManager::new(wifi_controller);
    wifi_manager.set_stack(stack);
    let wifi_manager = WIFI_MANAGER_CELL.init(wifi_manager);

    let http = HTTP_CELL.init(Mutex::new(HttpsClient::new(stack, tls_seed)));
    let state_machine = STATE_MACHINE_CELL.init(Mutex::new(ConnectivityStateMachine::new()));

    // Voltage on GPIO2, current on GPIO3, both ADC1
    let mut adc_config = AdcConfig::new();
    let voltage_pin = adc_config.enable_pin(peripherals.GPIO2, Attenuation::_11dB);
    let current_pin = adc_config.enable_pin(peripherals.GPIO3, Attenuation::_11dB);
    let adc = Adc::new(peripherals.ADC1, adc_config);
    let calibration = Calibration::default();
    let sampler = AdcSampler {
        adc,
        voltage_pin,
        current_pin,
        calibration,
        analyzer: WaveformAnalyzer::new(calibration),
    };

    // OLED on GPIO5 (SDA) / GPIO6 (SCL); the meter keeps running without it
    let display: MeterDisplay = I2c::new(
        peripherals.I2C0,
        I2cConfig::default().with_frequency(Rate::from_khz(400)),
    )
    .map_err(|_| MeterError::DisplayError)
    .and_then(|i2c| Oled::new(i2c.with_sda(peripherals.GPIO5).with_scl(peripherals.GPIO6)))
    .map_err(|e| warn!("[OLED] Display unavailable: {:?}", e))
    .ok();

    let button = Input::new(peripherals.GPIO9, InputConfig::default().with_pull(Pull::Up));

    let store = EnergyStore::new(
        FlashStorage::new(),
        config::STORAGE_FLASH_OFFSET,
        config::STORAGE_REGION_SIZE,
        config::RATE_PER_KWH,
    );
    let meter = Meter::new(store, display, SignalTelemetry, Instant::now().as_millis());

    let executor = EXECUTOR.init(Executor::new());
    executor.run(|spawner| {
        info!("[MAIN] Spawning tasks...");
        spawner.spawn(net_task(runner)).ok();
        spawner
            .spawn(connectivity_task(wifi_manager, state_machine))
            .ok();
        spawner.spawn(measurement_task(meter, sampler)).ok();
        spawner.spawn(button_task(button)).ok();
        spawner.spawn(telemetry_task(http, state_machine)).ok();
        spawner.spawn(notification_task(http, state_machine)).ok();
    });
}
