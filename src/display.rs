//! Display pages
//!
//! Two text pages rendered into fixed-size line buffers. The driver behind
//! [`DisplaySink`] only has to draw lines; see `oled.rs` for the SSD1306 one.

use crate::MeterError;
use crate::meter::MeterSnapshot;
use core::fmt::Write;
use heapless::String;

/// Characters per display line
pub const LINE_CAPACITY: usize = 21;

/// Lines per frame
pub const LINE_COUNT: usize = 3;

pub type Line = String<LINE_CAPACITY>;

/// Display pages in paging order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Page {
    /// Voltage, current and power
    #[default]
    Instant,
    /// Accumulated energy and cost
    Totals,
}

impl Page {
    pub fn index(self) -> u8 {
        match self {
            Page::Instant => 0,
            Page::Totals => 1,
        }
    }

    pub fn next(self) -> Self {
        match self {
            Page::Instant => Page::Totals,
            Page::Totals => Page::Instant,
        }
    }
}

/// Current page with circular advance
#[derive(Debug, Clone, Copy, Default)]
pub struct PageController {
    page: Page,
}

impl PageController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn page(&self) -> Page {
        self.page
    }

    /// Move to the next page, wrapping around
    pub fn advance(&mut self) -> Page {
        self.page = self.page.next();
        self.page
    }
}

/// Text content for one screen refresh
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DisplayFrame {
    pub lines: [Line; LINE_COUNT],
}

impl DisplayFrame {
    /// Render a meter snapshot on the given page
    pub fn render(page: Page, snapshot: &MeterSnapshot) -> Self {
        let mut frame = Self::default();
        let reading = snapshot.reading;
        let energy = snapshot.energy;

        // Overflow only truncates the line; the rest of the frame still renders
        match page {
            Page::Instant => {
                let _ = write!(frame.lines[0], "V: {:.1} V", reading.voltage);
                let _ = write!(frame.lines[1], "I: {:.2} A", reading.current);
                let _ = write!(frame.lines[2], "P: {:.1} W", reading.power);
            }
            Page::Totals => {
                let _ = write!(frame.lines[0], "E: {:.3} kWh", energy.energy_kwh);
                let _ = write!(frame.lines[1], "Cost: {:.2}", energy.cost);
                let _ = write!(frame.lines[2], "Page 2/2");
            }
        }

        frame
    }

    /// Short acknowledgement shown after an energy reset
    pub fn notice(title: &str, detail: &str) -> Self {
        let mut frame = Self::default();
        let _ = frame.lines[0].push_str(truncate(title, LINE_CAPACITY));
        let _ = frame.lines[1].push_str(truncate(detail, LINE_CAPACITY));
        frame
    }
}

fn truncate(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

/// Anything that can show a [`DisplayFrame`]
pub trait DisplaySink {
    fn show(&mut self, frame: &DisplayFrame) -> Result<(), MeterError>;
}

/// Missing panel: frames are dropped
impl<D: DisplaySink> DisplaySink for Option<D> {
    fn show(&mut self, frame: &DisplayFrame) -> Result<(), MeterError> {
        match self {
            Some(display) => display.show(frame),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::energy::EnergyState;
    use crate::measurement::SmoothedReading;

    fn snapshot() -> MeterSnapshot {
        MeterSnapshot {
            reading: SmoothedReading {
                voltage: 229.64,
                current: 1.234,
                power: 283.36,
            },
            energy: EnergyState {
                energy_kwh: 12.3456,
                cost: 80.2464,
                last_update_ms: 0,
            },
        }
    }

    #[test]
    fn pages_wrap_around() {
        let mut pages = PageController::new();
        assert_eq!(pages.page(), Page::Instant);
        assert_eq!(pages.advance(), Page::Totals);
        assert_eq!(pages.advance(), Page::Instant);
        assert_eq!(pages.page().index(), 0);
    }

    #[test]
    fn instant_page_shows_live_values() {
        let frame = DisplayFrame::render(Page::Instant, &snapshot());
        assert_eq!(frame.lines[0].as_str(), "V: 229.6 V");
        assert_eq!(frame.lines[1].as_str(), "I: 1.23 A");
        assert_eq!(frame.lines[2].as_str(), "P: 283.4 W");
    }

    #[test]
    fn totals_page_shows_energy_and_cost() {
        let frame = DisplayFrame::render(Page::Totals, &snapshot());
        assert_eq!(frame.lines[0].as_str(), "E: 12.346 kWh");
        assert_eq!(frame.lines[1].as_str(), "Cost: 80.25");
    }

    struct FailingPanel;

    impl DisplaySink for FailingPanel {
        fn show(&mut self, _frame: &DisplayFrame) -> Result<(), MeterError> {
            Err(MeterError::DisplayError)
        }
    }

    #[test]
    fn absent_panel_accepts_frames() {
        let frame = DisplayFrame::render(Page::Instant, &snapshot());
        assert_eq!(None::<FailingPanel>.show(&frame), Ok(()));
        assert_eq!(Some(FailingPanel).show(&frame), Err(MeterError::DisplayError));
    }

    #[test]
    fn notice_is_truncated_to_line_width() {
        let frame = DisplayFrame::notice("Energy reset", "a very long detail line that overflows");
        assert_eq!(frame.lines[0].as_str(), "Energy reset");
        assert_eq!(frame.lines[1].len(), LINE_CAPACITY);
        assert!(frame.lines[2].is_empty());
    }
}
