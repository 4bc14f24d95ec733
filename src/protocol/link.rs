use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::{
    io::{ErrorKind, Read, Write},
    time::Duration,
};

use serialport::{DataBits, Parity, StopBits};

/// Longest reply accepted before a line is considered garbage.
const MAX_LINE_LEN: usize = 256;

/// Anything a gateway can talk through: a serial port, or an in-memory
/// stand-in under test.
pub trait Link: Read + Write + Send {}

impl<T: Read + Write + Send + ?Sized> Link for T {}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    pub port: String,
    pub baud_rate: u32,
    pub data_bits: u8,
    pub stop_bits: u8,
    pub timeout_ms: u64,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: String::new(),
            baud_rate: 9600,
            data_bits: 8,
            stop_bits: 1,
            timeout_ms: 500,
        }
    }
}

impl SerialConfig {
    pub fn new(port: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            port: port.into(),
            baud_rate,
            ..Self::default()
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn apply_builder(&self, b: serialport::SerialPortBuilder) -> serialport::SerialPortBuilder {
        let b = b.data_bits(match self.data_bits {
            5 => DataBits::Five,
            6 => DataBits::Six,
            7 => DataBits::Seven,
            _ => DataBits::Eight,
        });
        let b = b.stop_bits(match self.stop_bits {
            2 => StopBits::Two,
            _ => StopBits::One,
        });
        b.parity(Parity::None)
    }

    /// Open the configured port.
    pub fn open(&self) -> Result<Box<dyn Link>> {
        if self.port.is_empty() {
            bail!("No serial port configured");
        }
        let builder = serialport::new(self.port.clone(), self.baud_rate).timeout(self.timeout());
        let handle = self
            .apply_builder(builder)
            .open()
            .with_context(|| format!("Failed to open serial port {}", self.port))?;
        log::info!("Opened {} at {} baud", self.port, self.baud_rate);
        Ok(Box::new(handle))
    }
}

/// Text framing over a [`Link`].
pub struct LineLink {
    inner: Box<dyn Link>,
    terminator: &'static str,
}

impl LineLink {
    pub fn new(inner: Box<dyn Link>, terminator: &'static str) -> Self {
        Self { inner, terminator }
    }

    /// Write `text` followed by the terminator.
    pub fn send(&mut self, text: &str) -> Result<()> {
        log::debug!("> {text}");
        self.inner
            .write_all(text.as_bytes())
            .and_then(|_| self.inner.write_all(self.terminator.as_bytes()))
            .and_then(|_| self.inner.flush())
            .with_context(|| format!("Failed to write {text:?}"))
    }

    /// Read one `\n` terminated line, without the line ending.
    pub fn read_line(&mut self) -> Result<String> {
        let mut line = Vec::with_capacity(32);
        let mut byte = [0u8; 1];
        loop {
            match self.inner.read(&mut byte) {
                Ok(0) => bail!("Link closed while waiting for a reply"),
                Ok(_) if byte[0] == b'\n' => break,
                Ok(_) => {
                    line.push(byte[0]);
                    if line.len() > MAX_LINE_LEN {
                        bail!("Reply exceeded {MAX_LINE_LEN} bytes without a line ending");
                    }
                }
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) if err.kind() == ErrorKind::TimedOut => {
                    return Err(anyhow!("Timed out waiting for a reply"));
                }
                Err(err) => return Err(err).context("Failed to read reply"),
            }
        }
        let text = String::from_utf8_lossy(&line).trim().to_string();
        log::debug!("< {text}");
        Ok(text)
    }

    /// Send `text` and wait for its one-line reply.
    pub fn query(&mut self, text: &str) -> Result<String> {
        self.send(text)?;
        self.read_line()
    }
}


#[cfg(test)]
mod tests {
    use super::{testing::ScriptedLink, *};

    #[test]
    fn query_writes_terminated_command_and_trims_reply() -> Result<()> {
        let link = ScriptedLink::default();
        link.push_reply(" 11.998 \r\n");
        let mut line = LineLink::new(Box::new(link.clone()), "\n");

        assert_eq!(line.query("MEAS:VOLT?")?, "11.998");
        assert_eq!(link.written_text(), "MEAS:VOLT?\n");
        Ok(())
    }

    #[test]
    fn missing_reply_is_an_error() {
        let link = ScriptedLink::default();
        let mut line = LineLink::new(Box::new(link), "\n");
        assert!(line.read_line().is_err());
    }

    #[test]
    fn open_without_port_fails() {
        assert!(SerialConfig::default().open().is_err());
    }
}
