//! Button debounce and long-press detection
//!
//! A debounced press always produces [`ButtonEvent::Press`]. Holding the
//! button past the long-press threshold produces [`ButtonEvent::LongPress`]
//! once; it re-arms only after release.

use crate::config;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ButtonEvent {
    /// Debounced transition to pressed
    Press,
    /// Held continuously past the long-press threshold
    LongPress,
}

#[derive(Debug, Clone)]
pub struct ButtonDetector {
    debounce_ms: u64,
    long_press_ms: u64,
    raw_level: bool,
    raw_changed_at: u64,
    stable_level: bool,
    pressed_since: Option<u64>,
    long_fired: bool,
}

impl Default for ButtonDetector {
    fn default() -> Self {
        Self::new(config::BUTTON_DEBOUNCE_MS, config::LONG_PRESS_MS)
    }
}

impl ButtonDetector {
    pub fn new(debounce_ms: u64, long_press_ms: u64) -> Self {
        Self {
            debounce_ms,
            long_press_ms,
            raw_level: false,
            raw_changed_at: 0,
            stable_level: false,
            pressed_since: None,
            long_fired: false,
        }
    }

    /// Feed the current input level (`true` = pressed) sampled at `now_ms`
    pub fn update(&mut self, pressed: bool, now_ms: u64) -> Option<ButtonEvent> {
        if pressed != self.raw_level {
            self.raw_level = pressed;
            self.raw_changed_at = now_ms;
        }

        let settled = now_ms.saturating_sub(self.raw_changed_at) >= self.debounce_ms;
        if self.raw_level != self.stable_level && settled {
            self.stable_level = self.raw_level;
            self.long_fired = false;

            if self.stable_level {
                self.pressed_since = Some(now_ms);
                return Some(ButtonEvent::Press);
            }

            self.pressed_since = None;
            return None;
        }

        match self.pressed_since {
            Some(since)
                if !self.long_fired && now_ms.saturating_sub(since) >= self.long_press_ms =>
            {
                self.long_fired = true;
                Some(ButtonEvent::LongPress)
            }
            _ => None,
        }
    }

    /// Debounced level
    pub fn is_pressed(&self) -> bool {
        self.stable_level
    }
}
