use anyhow::{anyhow, Result};
use std::{fmt, str::FromStr};

/// Exclusive upper bound of an 8-digit serial number.
const SERIAL_LIMIT: u32 = 100_000_000;

/// Unit serial number, always rendered as 8 zero-padded decimal digits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct SerialNumber(u32);

impl SerialNumber {
    pub fn new(value: u32) -> Result<Self> {
        if value >= SERIAL_LIMIT {
            return Err(anyhow!("Serial number {value} does not fit in 8 digits"));
        }
        Ok(Self(value))
    }

    pub fn value(self) -> u32 {
        self.0
    }

    /// The following serial number; `99999999` wraps to `00000000`.
    pub fn next(self) -> Self {
        Self((self.0 + 1) % SERIAL_LIMIT)
    }

    /// Advance an optional serial number; an empty one starts at `00000001`.
    pub fn advance(current: Option<Self>) -> Self {
        current.unwrap_or_default().next()
    }
}

impl fmt::Display for SerialNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08}", self.0)
    }
}

impl FromStr for SerialNumber {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let trimmed = s.trim();
        if trimmed.is_empty() || !trimmed.chars().all(|c| c.is_ascii_digit()) {
            return Err(anyhow!("Serial number must be numeric, got {s:?}"));
        }
        let value: u32 = trimmed
            .parse()
            .map_err(|err| anyhow!("Invalid serial number {s:?}: {err}"))?;
        Self::new(value)
    }
}
