//! Serial transport: a reconnecting byte sink wrapping one of two wire
//! encodings (NMEA 0183 or MSP binary), owned exclusively by the frame loop.

pub mod msp;
pub mod nmea;
mod time;

use std::io::Write;
use std::time::Duration;

use serialport::SerialPort;

use crate::error::{LocatorError, Result};
use crate::fusion::FusionOutput;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Nmea,
    Msp,
}

#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub port: String,
    pub baud_rate: u32,
    pub protocol: Protocol,
    pub max_retries: u32,
    pub backoff: Duration,
    pub write_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            port: "/dev/ttyAMA0".to_string(),
            baud_rate: 9600,
            protocol: Protocol::Nmea,
            max_retries: 3,
            backoff: Duration::from_secs(1),
            write_timeout: Duration::from_secs(1),
        }
    }
}

impl TransportConfig {
    /// Picks the conventional default baud rate for a protocol, unless the
    /// caller has already set one explicitly.
    pub fn with_protocol_defaults(mut self, protocol: Protocol) -> Self {
        self.protocol = protocol;
        self.baud_rate = match protocol {
            Protocol::Nmea => 9600,
            Protocol::Msp => 115_200,
        };
        self
    }
}

/// Encodes a [`FusionOutput`] into the wire bytes for `protocol`. Returns
/// `None` when there is no position to emit (callers should not write a
/// "no-fix" frame on the wire; the flight controller already times out
/// gracefully on silence).
pub fn encode(protocol: Protocol, out: &FusionOutput, timestamp: f64) -> Option<Vec<u8>> {
    let pos = out.position?;
    match protocol {
        Protocol::Nmea => {
            let mut buf = Vec::new();
            buf.extend_from_slice(nmea::encode_gga(pos, out.hdop, timestamp).as_bytes());
            buf.extend_from_slice(
                nmea::encode_rmc(pos, out.speed_mps, out.heading_deg, timestamp).as_bytes(),
            );
            Some(buf)
        }
        Protocol::Msp => {
            let fix_type = match out.fix_quality {
                1 => 3,
                2 | 3 => 2,
                _ => 0,
            };
            let speed_cm = (out.speed_mps * 100.0).round().clamp(0.0, u16::MAX as f64) as u16;
            let course = ((out.heading_deg * 10.0).round() as i64).rem_euclid(3600) as u16;
            let frame = msp::encode_set_raw_gps(pos, fix_type, 10, 0, speed_cm, course, out.hdop);
            Some(frame.to_vec())
        }
    }
}

/// Reconnecting serial writer. `send` retries up to `max_retries + 1` times;
/// on any write failure it closes and reopens the port before the next
/// attempt, logging but never propagating the reconnect itself as fatal.
pub struct Transport {
    config: TransportConfig,
    port: Option<Box<dyn SerialPort>>,
    reconnects: u64,
}

impl Transport {
    pub fn new(config: TransportConfig) -> Self {
        Self {
            config,
            port: None,
            reconnects: 0,
        }
    }

    pub fn reconnect_count(&self) -> u64 {
        self.reconnects
    }

    fn open(&mut self) -> Result<()> {
        let port = serialport::new(&self.config.port, self.config.baud_rate)
            .timeout(self.config.write_timeout)
            .open()
            .map_err(|e| LocatorError::ResourceUnavailable(format!("serial open {}: {e}", self.config.port)))?;
        self.port = Some(port);
        Ok(())
    }

    fn close(&mut self) {
        self.port = None;
    }

    /// Opens the port for the first time; callers typically call this once
    /// at start-up so a bad port fails fast rather than on the first write.
    pub fn connect(&mut self) -> Result<()> {
        self.open()
    }

    /// Writes `bytes` to the port, retrying with reconnects on failure.
    pub fn send(&mut self, bytes: &[u8]) -> Result<()> {
        let attempts = self.config.max_retries + 1;
        let mut last_err = None;

        for attempt in 0..attempts {
            if self.port.is_none() {
                if let Err(e) = self.open() {
                    last_err = Some(e);
                    std::thread::sleep(self.config.backoff);
                    continue;
                }
            }

            let result = self
                .port
                .as_mut()
                .expect("port opened above")
                .write_all(bytes);

            match result {
                Ok(()) => return Ok(()),
                Err(e) => {
                    tracing::warn!(error = %e, attempt, "serial write failed; reconnecting");
                    self.close();
                    self.reconnects += 1;
                    last_err = Some(LocatorError::Transient(format!("serial write: {e}")));
                    if attempt + 1 < attempts {
                        std::thread::sleep(self.config.backoff);
                    }
                }
            }
        }

        Err(last_err.unwrap_or(LocatorError::Transient("serial write failed".into())))
    }

    /// Encodes and sends a fusion output, if it carries a position.
    pub fn send_fix(&mut self, out: &FusionOutput, timestamp: f64) -> Result<()> {
        match encode(self.config.protocol, out, timestamp) {
            Some(bytes) => self.send(&bytes),
            None => Ok(()),
        }
    }
}
