use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TimecodeError {
    #[error("malformed timecode '{0}'")]
    Malformed(String),
    #[error("timecode '{value}' has out of range {field}")]
    OutOfRange { value: String, field: &'static str },
}

fn timecode_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^(?:(?:(\d{1,3}):)?(\d{1,2}):)?(\d{1,5})(?:\.(\d{1,3}))?$")
            .expect("valid regex")
    })
}

/// Parses `HH:MM:SS`, `MM:SS` or bare seconds, with optional millisecond
/// fraction. Minutes and seconds must be below 60 unless they are the
/// leading component.
pub fn parse_timecode(value: &str) -> Result<Duration, TimecodeError> {
    let trimmed = value.trim();
    let captures = timecode_pattern()
        .captures(trimmed)
        .ok_or_else(|| TimecodeError::Malformed(value.to_string()))?;

    let number = |index: usize| -> u64 {
        captures
            .get(index)
            .and_then(|m| m.as_str().parse::<u64>().ok())
            .unwrap_or(0)
    };
    let hours_present = captures.get(1).is_some();
    let minutes_present = captures.get(2).is_some();
    let hours = number(1);
    let minutes = number(2);
    let seconds = number(3);

    if hours_present && minutes >= 60 {
        return Err(TimecodeError::OutOfRange {
            value: value.to_string(),
            field: "minutes",
        });
    }
    if minutes_present && seconds >= 60 {
        return Err(TimecodeError::OutOfRange {
            value: value.to_string(),
            field: "seconds",
        });
    }

    let millis = captures
        .get(4)
        .map(|m| {
            let digits = m.as_str();
            let raw = digits.parse::<u64>().unwrap_or(0);
            raw * 10u64.pow(3 - digits.len() as u32)
        })
        .unwrap_or(0);

    Ok(Duration::from_secs(hours * 3600 + minutes * 60 + seconds) + Duration::from_millis(millis))
}

/// Renders a duration as `HH:MM:SS`, dropping sub-second precision.
pub fn format_hms(duration: Duration) -> String {
    let total = duration.as_secs();
    format!(
        "{:02}:{:02}:{:02}",
        total / 3600,
        (total % 3600) / 60,
        total % 60
    )
}

/// Seconds with millisecond precision, as ffmpeg expects on the command line.
pub fn format_seconds(duration: Duration) -> String {
    format!("{:.3}", duration.as_secs_f64())
}
