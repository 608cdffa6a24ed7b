//! Periodic bot notifications
//!
//! Builds the report text and the `sendMessage` request for the messaging
//! bot. Transport lives in the firmware; failures are logged and dropped.

use crate::MeterError;
use crate::meter::MeterSnapshot;
use core::fmt::Write;
use heapless::String;

pub const MESSAGE_CAPACITY: usize = 256;
pub const BODY_CAPACITY: usize = 512;
pub const URL_CAPACITY: usize = 128;

/// Human-readable report of the current snapshot
pub fn compose_report(snapshot: &MeterSnapshot) -> Result<String<MESSAGE_CAPACITY>, MeterError> {
    let reading = snapshot.reading;
    let energy = snapshot.energy;

    let mut text = String::new();
    write!(
        text,
        "Energy meter report\n\
         Voltage: {:.1} V\n\
         Current: {:.2} A\n\
         Power: {:.1} W\n\
         Energy: {:.3} kWh\n\
         Cost: {:.2}",
        reading.voltage, reading.current, reading.power, energy.energy_kwh, energy.cost
    )
    .map_err(|_| MeterError::FormatError)?;

    Ok(text)
}

/// `sendMessage` endpoint for the given bot token
pub fn send_message_url(host: &str, bot_token: &str) -> Result<String<URL_CAPACITY>, MeterError> {
    let mut url = String::new();
    write!(url, "https://{}/bot{}/sendMessage", host, bot_token)
        .map_err(|_| MeterError::FormatError)?;
    Ok(url)
}

/// JSON request body `{"chat_id":...,"text":...}`
pub fn message_body(chat_id: &str, text: &str) -> Result<String<BODY_CAPACITY>, MeterError> {
    let mut body = String::new();
    body.push_str(r#"{"chat_id":""#)
        .map_err(|_| MeterError::FormatError)?;
    push_json_escaped(&mut body, chat_id)?;
    body.push_str(r#"","text":""#)
        .map_err(|_| MeterError::FormatError)?;
    push_json_escaped(&mut body, text)?;
    body.push_str(r#""}"#).map_err(|_| MeterError::FormatError)?;
    Ok(body)
}

fn push_json_escaped<const N: usize>(out: &mut String<N>, text: &str) -> Result<(), MeterError> {
    for c in text.chars() {
        let pushed = match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if (c as u32) < 0x20 => write!(out, "\\u{:04x}", c as u32).map_err(|_| ()),
            c => out.push(c).map_err(|_| ()),
        };
        pushed.map_err(|_| MeterError::FormatError)?;
    }
    Ok(())
}
