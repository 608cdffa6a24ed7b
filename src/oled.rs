//! SSD1306 128x32 OLED over I2C

use crate::MeterError;
use crate::display::{DisplayFrame, DisplaySink};
use embedded_graphics::{
    mono_font::{MonoTextStyle, ascii::FONT_6X10},
    pixelcolor::BinaryColor,
    prelude::*,
    text::{Baseline, Text},
};
use embedded_hal::i2c::I2c;
use log::info;
use ssd1306::mode::BufferedGraphicsMode;
use ssd1306::{I2CDisplayInterface, Ssd1306, prelude::*};

/// Pixel pitch between text lines
const LINE_HEIGHT: i32 = 11;

pub struct Oled<I2C> {
    display: Ssd1306<I2CInterface<I2C>, DisplaySize128x32, BufferedGraphicsMode<DisplaySize128x32>>,
    text_style: MonoTextStyle<'static, BinaryColor>,
}

impl<I2C: I2c> Oled<I2C> {
    /// Initialise the panel and clear it
    pub fn new(i2c: I2C) -> Result<Self, MeterError> {
        let interface = I2CDisplayInterface::new(i2c);
        let mut display = Ssd1306::new(interface, DisplaySize128x32, DisplayRotation::Rotate0)
            .into_buffered_graphics_mode();
        display.init().map_err(|_| MeterError::DisplayError)?;
        display.clear(BinaryColor::Off).map_err(|_| MeterError::DisplayError)?;
        display.flush().map_err(|_| MeterError::DisplayError)?;
        info!("[OLED] Display initialized");

        Ok(Self {
            display,
            text_style: MonoTextStyle::new(&FONT_6X10, BinaryColor::On),
        })
    }
}

impl<I2C: I2c> DisplaySink for Oled<I2C> {
    fn show(&mut self, frame: &DisplayFrame) -> Result<(), MeterError> {
        self.display
            .clear(BinaryColor::Off)
            .map_err(|_| MeterError::DisplayError)?;

        for (row, line) in frame.lines.iter().enumerate() {
            if line.is_empty() {
                continue;
            }
            Text::with_baseline(
                line.as_str(),
                Point::new(0, row as i32 * LINE_HEIGHT),
                self.text_style,
                Baseline::Top,
            )
            .draw(&mut self.display)
            .map_err(|_| MeterError::DisplayError)?;
        }

        self.display.flush().map_err(|_| MeterError::DisplayError)
    }
}
