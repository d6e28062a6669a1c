//! Spacecraft clock and ground time helpers.
//!
//! SCLK values travel as a single "exact" tick count: `coarse * 2^fine_bits + fine`.
//! Ground times (ERT, SCET, event time) are milliseconds since the Unix epoch, with
//! any sub-millisecond digits tracked separately as a nano field.

use crate::utils::error::{MtakError, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SclkFormat {
    pub fine_bits: u32,
    pub ticks_separator: char,
    pub fractional_separator: char,
}

impl Default for SclkFormat {
    fn default() -> Self {
        Self {
            fine_bits: 16,
            ticks_separator: '-',
            fractional_separator: '.',
        }
    }
}

impl SclkFormat {
    pub fn fine_modulus(&self) -> u64 {
        1u64 << self.fine_bits
    }

    /// Parse `ticks`, `coarse-fine` or `coarse.fraction` into exact ticks.
    pub fn parse(&self, sclk: &str) -> Result<u64> {
        let s = sclk.trim();
        let invalid = |reason: &str| MtakError::TimeFormatError {
            value: sclk.to_string(),
            reason: reason.to_string(),
        };

        if s.is_empty() {
            return Err(invalid("empty SCLK"));
        }
        let separators = s
            .chars()
            .filter(|c| *c == self.ticks_separator || *c == self.fractional_separator)
            .count();
        if separators > 1
            || !s.chars().all(|c| {
                c.is_ascii_digit() || c == self.ticks_separator || c == self.fractional_separator
            })
        {
            return Err(invalid("expected ticks, coarse-fine or coarse.fraction"));
        }

        let modulus = self.fine_modulus();

        if let Some(idx) = s.find(self.fractional_separator) {
            if idx == 0 {
                return Err(invalid("missing coarse ticks"));
            }
            let coarse = parse_ticks(&s[..idx]).map_err(|_| invalid("bad coarse ticks"))?;
            let fraction = &s[idx + 1..];
            let fine = if fraction.is_empty() {
                0
            } else {
                let value: f64 = format!("0.{}", fraction)
                    .parse()
                    .map_err(|_| invalid("bad fractional ticks"))?;
                (value * modulus as f64).round() as u64
            };
            return self.combine(coarse, fine).ok_or_else(|| invalid("SCLK out of range"));
        }

        if let Some(idx) = s.find(self.ticks_separator) {
            if idx == 0 {
                return Err(invalid("missing coarse ticks"));
            }
            let coarse = parse_ticks(&s[..idx]).map_err(|_| invalid("bad coarse ticks"))?;
            let fine = parse_ticks(&s[idx + 1..]).map_err(|_| invalid("bad fine ticks"))?;
            return self.combine(coarse, fine).ok_or_else(|| invalid("SCLK out of range"));
        }

        let coarse = parse_ticks(s).map_err(|_| invalid("bad ticks"))?;
        self.combine(coarse, 0).ok_or_else(|| invalid("SCLK out of range"))
    }

    fn combine(&self, coarse: u64, fine: u64) -> Option<u64> {
        coarse.checked_mul(self.fine_modulus())?.checked_add(fine)
    }

    pub fn coarse(&self, exact: u64) -> u64 {
        exact >> self.fine_bits
    }

    pub fn fine(&self, exact: u64) -> u64 {
        exact & (self.fine_modulus() - 1)
    }

    /// Seconds.subseconds view of an exact SCLK.
    pub fn to_float(&self, exact: u64) -> f64 {
        self.coarse(exact) as f64 + self.fine(exact) as f64 / self.fine_modulus() as f64
    }

    /// Saturates at `u64::MAX` for values past the representable range.
    pub fn from_float(&self, value: f64) -> u64 {
        if value.is_nan() || value <= 0.0 {
            return 0;
        }
        let coarse = value.trunc() as u64;
        let fine = (value.fract() * self.fine_modulus() as f64).round() as u64;
        coarse
            .saturating_mul(self.fine_modulus())
            .saturating_add(fine)
    }

    pub fn format(&self, exact: u64) -> String {
        format!(
            "{:010}{}{:05}",
            self.coarse(exact),
            self.ticks_separator,
            self.fine(exact)
        )
    }
}

fn parse_ticks(value: &str) -> std::result::Result<u64, std::num::ParseIntError> {
    let trimmed = value.trim_start_matches('0');
    if trimmed.is_empty() {
        Ok(0)
    } else {
        trimmed.parse()
    }
}

const ISO_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";
const DOY_FORMAT: &str = "%Y-%jT%H:%M:%S";

/// Parse an ISO (`YYYY-MM-DDTHH:MM:SS[.fff]`), DOY (`YYYY-DDDTHH:MM:SS[.fff]`)
/// or bare millisecond string into milliseconds since the epoch (UTC).
pub fn parse_time_string(value: &str) -> Result<i64> {
    let s = value.trim();
    let (main, subseconds) = match s.split_once('.') {
        Some((main, sub)) => (main.trim(), sub),
        None => (s, ""),
    };

    if !main.is_empty() && main.chars().all(|c| c.is_ascii_digit()) && subseconds.is_empty() {
        return main.parse::<i64>().map_err(|e| MtakError::TimeFormatError {
            value: value.to_string(),
            reason: e.to_string(),
        });
    }

    let datetime = NaiveDateTime::parse_from_str(main, ISO_FORMAT)
        .or_else(|_| NaiveDateTime::parse_from_str(main, DOY_FORMAT))
        .map_err(|_| MtakError::TimeFormatError {
            value: value.to_string(),
            reason: "not a valid ISO or DOY time".to_string(),
        })?;

    let millis_digits: String = subseconds
        .chars()
        .take(3)
        .chain(std::iter::repeat('0'))
        .take(3)
        .collect();
    let millis: i64 = millis_digits
        .parse()
        .map_err(|_| MtakError::TimeFormatError {
            value: value.to_string(),
            reason: "bad subseconds".to_string(),
        })?;

    Ok(datetime.and_utc().timestamp_millis() + millis)
}

/// Sub-millisecond digits of a time string, i.e. everything after the third
/// fractional digit. Returns 0 when there are none.
pub fn time_string_nanos(value: &str) -> u64 {
    match value.split_once('.') {
        Some((_, fraction)) if fraction.len() > 3 => fraction[3..].trim().parse().unwrap_or(0),
        _ => 0,
    }
}

/// Format milliseconds since the epoch as an ISO or DOY time string.
pub fn format_time(ms: i64, doy: bool) -> String {
    match DateTime::<Utc>::from_timestamp_millis(ms) {
        Some(dt) if doy => dt.format("%Y-%jT%H:%M:%S%.3f").to_string(),
        Some(dt) => dt.format("%Y-%m-%dT%H:%M:%S%.3f").to_string(),
        None => ms.to_string(),
    }
}

/// Seconds from now until `value`. Negative when the time is in the past.
pub fn sleep_time_until(value: &str) -> Result<f64> {
    let target = parse_time_string(value)?;
    Ok((target - now_ms()) as f64 / 1000.0)
}

pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}
