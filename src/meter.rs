//! Measurement cycle orchestration
//!
//! [`Meter`] owns the processor and the collaborators it reports to. One call
//! to [`Meter::process_cycle`] smooths and integrates a sample, persists the
//! totals, redraws the display and hands a frame to telemetry. Collaborator
//! failures are logged and otherwise ignored.

use crate::button::ButtonEvent;
use crate::display::{DisplayFrame, DisplaySink, PageController};
use crate::energy::EnergyState;
use crate::measurement::{MeasurementProcessor, RawSample, SmoothedReading};
use crate::storage::EnergyStore;
use crate::telemetry::{TelemetryFrame, TelemetrySink};
use embedded_storage::nor_flash::NorFlash;
use log::{debug, info, warn};

/// Reading and totals after a cycle
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct MeterSnapshot {
    pub reading: SmoothedReading,
    pub energy: EnergyState,
}

pub struct Meter<F, D, T> {
    processor: MeasurementProcessor,
    store: EnergyStore<F>,
    pages: PageController,
    display: D,
    telemetry: T,
    persisted: EnergyState,
}

impl<F, D, T> Meter<F, D, T>
where
    F: NorFlash,
    D: DisplaySink,
    T: TelemetrySink,
{
    /// Restore totals from `store` and start integrating at `now_ms`
    pub fn new(store: EnergyStore<F>, display: D, telemetry: T, now_ms: u64) -> Self {
        Self::with_processor(store, display, telemetry, now_ms, MeasurementProcessor::new)
    }

    /// Like [`Meter::new`] with a custom processor built from the loaded totals
    pub fn with_processor(
        mut store: EnergyStore<F>,
        display: D,
        telemetry: T,
        now_ms: u64,
        build: impl FnOnce(EnergyState) -> MeasurementProcessor,
    ) -> Self {
        let loaded = store.load(now_ms);
        let processor = build(loaded);

        Self {
            persisted: processor.state(),
            processor,
            store,
            pages: PageController::new(),
            display,
            telemetry,
        }
    }

    /// One measurement cycle over `elapsed_ms` of wall-clock time
    pub fn process_cycle(&mut self, elapsed_ms: u64, raw: RawSample) -> MeterSnapshot {
        let (reading, energy) = self.processor.update(elapsed_ms, raw);
        debug!(
            "[METER] {:.1} V {:.2} A {:.1} W, {:.4} kWh",
            reading.voltage, reading.current, reading.power, energy.energy_kwh
        );

        self.persist(energy);

        let snapshot = MeterSnapshot { reading, energy };
        self.render(&snapshot);

        if let Err(e) = self.telemetry.publish(&TelemetryFrame::from_snapshot(&snapshot)) {
            warn!("[METER] Telemetry publish failed: {:?}", e);
        }

        snapshot
    }

    /// Cycle timed from the last integration step to `now_ms`
    pub fn tick(&mut self, now_ms: u64, raw: RawSample) -> MeterSnapshot {
        let elapsed_ms = self.processor.state().elapsed_since(now_ms);
        self.process_cycle(elapsed_ms, raw)
    }

    /// Zero the totals, persist immediately and acknowledge on the display
    pub fn reset(&mut self) -> EnergyState {
        let state = self.processor.reset();
        info!("[METER] Energy totals reset");

        match self.store.save(&state) {
            Ok(()) => self.persisted = state,
            Err(e) => warn!("[METER] Failed to persist reset: {:?}", e),
        }

        if let Err(e) = self
            .display
            .show(&DisplayFrame::notice("Energy reset", "0.000 kWh"))
        {
            warn!("[METER] Display update failed: {:?}", e);
        }

        state
    }

    /// Apply a button event: press pages, long press resets
    pub fn handle_button(&mut self, event: ButtonEvent) {
        match event {
            ButtonEvent::Press => {
                let page = self.pages.advance();
                debug!("[METER] Display page {}", page.index());
                let snapshot = self.snapshot();
                self.render(&snapshot);
            }
            ButtonEvent::LongPress => {
                self.reset();
            }
        }
    }

    /// Latest reading (zero before the first cycle) and current totals
    pub fn snapshot(&self) -> MeterSnapshot {
        MeterSnapshot {
            reading: self.processor.reading().unwrap_or_default(),
            energy: self.processor.state(),
        }
    }

    pub fn pages(&self) -> &PageController {
        &self.pages
    }

    pub fn display(&self) -> &D {
        &self.display
    }

    pub fn telemetry(&self) -> &T {
        &self.telemetry
    }

    fn persist(&mut self, energy: EnergyState) {
        // No mutation, no flash write
        if !energy.totals_differ(&self.persisted) {
            return;
        }

        match self.store.save(&energy) {
            Ok(()) => self.persisted = energy,
            Err(e) => warn!("[METER] Failed to persist totals: {:?}", e),
        }
    }

    fn render(&mut self, snapshot: &MeterSnapshot) {
        let frame = DisplayFrame::render(self.pages.page(), snapshot);
        if let Err(e) = self.display.show(&frame) {
            warn!("[METER] Display update failed: {:?}", e);
        }
    }
}
