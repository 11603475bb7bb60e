//! Human-readable wait durations (`"500ms"`, `"30s"`, `"5m"`, `"1h"`, `"2d"`).

use std::time::Duration;

use super::error::FlowError;

/// Parse a duration string. A bare number is milliseconds.
pub fn parse_duration(input: &str) -> Result<Duration, String> {
    let s = input.trim();
    if s.is_empty() {
        return Err("empty duration".to_string());
    }
    let split = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    let (digits, unit) = s.split_at(split);
    let value: u64 = digits
        .parse()
        .map_err(|_| format!("invalid duration '{input}'"))?;
    let secs = |mult: u64| {
        value
            .checked_mul(mult)
            .map(Duration::from_secs)
            .ok_or_else(|| format!("duration '{input}' overflows"))
    };
    match unit.trim() {
        "" | "ms" => Ok(Duration::from_millis(value)),
        "s" => secs(1),
        "m" => secs(60),
        "h" => secs(3_600),
        "d" => secs(86_400),
        other => Err(format!("unknown duration unit '{other}' in '{input}'")),
    }
}

/// Anything accepted where the workflow API takes a duration.
pub trait IntoWaitDuration {
    fn into_wait_duration(self) -> Result<Duration, FlowError>;
}

impl IntoWaitDuration for Duration {
    fn into_wait_duration(self) -> Result<Duration, FlowError> {
        Ok(self)
    }
}

/// Milliseconds.
impl IntoWaitDuration for u64 {
    fn into_wait_duration(self) -> Result<Duration, FlowError> {
        Ok(Duration::from_millis(self))
    }
}

impl IntoWaitDuration for &str {
    fn into_wait_duration(self) -> Result<Duration, FlowError> {
        parse_duration(self).map_err(FlowError::Failed)
    }
}

impl IntoWaitDuration for String {
    fn into_wait_duration(self) -> Result<Duration, FlowError> {
        self.as_str().into_wait_duration()
    }
}
