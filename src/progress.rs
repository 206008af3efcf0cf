// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Progress parsing for download utility output.
//!
//! The utility writes free-form text, rewriting its progress line with `\r`
//! and mixing informational chatter with the markers we care about. Parsing
//! happens in two stages:
//!
//! 1. [`LineSplitter`] turns raw byte chunks into complete lines, holding a
//!    partial line until its terminator arrives.
//! 2. [`ProgressParser`] turns each line into an optional [`ProgressEvent`],
//!    merging fields seen on earlier lines so every event carries the latest
//!    known percent, rate and ETA.
//!
//! ## Recognized markers
//!
//! | Marker | Example |
//! |--------|---------|
//! | Native update line | `Update state (0x61) downloading, progress: 45.32 (1024 / 2048)` |
//! | Percent | `Progress: 45.0%`, `45%` |
//! | Rate | `rate 3.2MB/s`, `speed: 700 KB/s`, `3.2 MiB/s` |
//! | ETA | `ETA 00:02:10`, `ETA: 02:10`, `ETA 130s` |
//! | Success | `Success! App '740' fully installed.` |
//! | Error | `ERROR! Failed to install app '740' (No subscription)` |
//!
//! Parsing never fails: anything unrecognized, negative or non-numeric yields
//! `None` and leaves the merged state untouched.

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;

// =============================================================================
// PATTERNS
// =============================================================================

static RE_STEAM_UPDATE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)update state \(0x[0-9a-f]+\)[^,]*,\s*progress:\s*(\S+)(?:\s*\((\d+)\s*/\s*(\d+)\))?")
        .unwrap()
});
static RE_PERCENT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(-?\d+(?:\.\d+)?)\s*%").unwrap());
static RE_RATE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)(-?\d+(?:\.\d+)?)\s*(b|kb|kib|mb|mib|gb|gib)/s").unwrap());
static RE_ETA: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\beta\b\s*[:=]?\s*(-?[\d:]+)").unwrap());
static RE_SUCCESS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)success!\s+app\s+'?[^' ]+'?\s+fully installed").unwrap());
static RE_ERROR: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?:ERROR!|^\s*(?i:error)\b|\bFAILED\b|(?i:login failure))").unwrap()
});

/// Longest partial line kept before it is flushed as-is.
const MAX_PENDING_BYTES: usize = 64 * 1024;

// =============================================================================
// EVENTS
// =============================================================================

/// One parsed progress fact, with earlier fields merged in.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressEvent {
    pub percent: Option<f64>,
    pub rate_bps: Option<f64>,
    pub rate_text: Option<String>,
    pub eta_secs: Option<u64>,
    pub bytes_transferred: Option<u64>,
    pub bytes_total: Option<u64>,
    pub at: DateTime<Utc>,
}

impl ProgressEvent {
    pub fn empty() -> Self {
        Self {
            percent: None,
            rate_bps: None,
            rate_text: None,
            eta_secs: None,
            bytes_transferred: None,
            bytes_total: None,
            at: Utc::now(),
        }
    }

    fn has_any(&self) -> bool {
        self.percent.is_some()
            || self.rate_bps.is_some()
            || self.eta_secs.is_some()
            || self.bytes_transferred.is_some()
            || self.bytes_total.is_some()
    }
}

/// Fields found on a single line.
#[derive(Default)]
struct LineFields {
    percent: Option<f64>,
    rate: Option<(f64, String)>,
    eta: Option<u64>,
    bytes: Option<(u64, u64)>,
}

// =============================================================================
// PARSER
// =============================================================================

/// Stateful line parser. One per running job.
#[derive(Debug, Default)]
pub struct ProgressParser {
    merged: Option<ProgressEvent>,
    last_error: Option<String>,
}

impl ProgressParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse one complete line.
    ///
    /// Returns the merged event when the line carried at least one usable
    /// progress field, `None` otherwise.
    pub fn parse_line(&mut self, text: &str) -> Option<ProgressEvent> {
        let line = text.trim();
        if line.is_empty() {
            return None;
        }

        if RE_ERROR.is_match(line) {
            self.last_error = Some(line.to_string());
            return None;
        }

        let fields = extract_fields(line).ok()?;
        if fields.percent.is_none() && fields.rate.is_none() && fields.eta.is_none() && fields.bytes.is_none() {
            return None;
        }

        let merged = self.merged.get_or_insert_with(ProgressEvent::empty);
        if let Some(percent) = fields.percent {
            merged.percent = Some(percent);
        }
        if let Some((bps, text)) = fields.rate {
            merged.rate_bps = Some(bps);
            merged.rate_text = Some(text);
        }
        if let Some(eta) = fields.eta {
            merged.eta_secs = Some(eta);
        }
        if let Some((done, total)) = fields.bytes {
            merged.bytes_transferred = Some(done);
            merged.bytes_total = Some(total);
        }
        merged.at = Utc::now();

        merged.has_any().then(|| merged.clone())
    }

    /// Last line that looked like an error report.
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }
}

/// `Err(())` means a marker was present but its value was unusable, which
/// discards the whole line.
fn extract_fields(line: &str) -> Result<LineFields, ()> {
    let mut fields = LineFields::default();

    if let Some(caps) = RE_STEAM_UPDATE.captures(line) {
        fields.percent = Some(parse_percent(&caps[1])?);
        if let (Some(done), Some(total)) = (caps.get(2), caps.get(3)) {
            let done = done.as_str().parse::<u64>().map_err(|_| ())?;
            let total = total.as_str().parse::<u64>().map_err(|_| ())?;
            fields.bytes = Some((done, total));
        }
    } else if RE_SUCCESS.is_match(line) {
        fields.percent = Some(100.0);
    } else if let Some(caps) = RE_PERCENT.captures(line) {
        fields.percent = Some(parse_percent(&caps[1])?);
    }

    if let Some(caps) = RE_RATE.captures(line) {
        let value = parse_non_negative(&caps[1])?;
        let unit = &caps[2];
        let bps = value * unit_multiplier(unit);
        fields.rate = Some((bps, format!("{}{}/s", &caps[1], unit)));
    }

    if let Some(caps) = RE_ETA.captures(line) {
        fields.eta = Some(parse_clock(&caps[1])?);
    }

    Ok(fields)
}

fn parse_non_negative(raw: &str) -> Result<f64, ()> {
    match raw.parse::<f64>() {
        Ok(v) if v.is_finite() && v >= 0.0 => Ok(v),
        _ => Err(()),
    }
}

fn parse_percent(raw: &str) -> Result<f64, ()> {
    parse_non_negative(raw).map(|v| v.min(100.0))
}

/// `130`, `02:10` and `00:02:10` all mean 130 seconds.
fn parse_clock(raw: &str) -> Result<u64, ()> {
    let parts: Vec<&str> = raw.split(':').collect();
    if parts.is_empty() || parts.len() > 3 || parts.iter().any(|p| p.is_empty()) {
        return Err(());
    }
    parts.iter().try_fold(0u64, |acc, part| {
        let value = part.parse::<u64>().map_err(|_| ())?;
        acc.checked_mul(60).and_then(|v| v.checked_add(value)).ok_or(())
    })
}

fn unit_multiplier(unit: &str) -> f64 {
    match unit.to_ascii_lowercase().as_str() {
        "kb" | "kib" => 1024.0,
        "mb" | "mib" => 1024.0 * 1024.0,
        "gb" | "gib" => 1024.0 * 1024.0 * 1024.0,
        _ => 1.0,
    }
}

// =============================================================================
// LINE SPLITTER
// =============================================================================

/// Reassembles lines from arbitrary output chunks.
///
/// Both `\n` and `\r` terminate a line, so carriage-return progress redraws
/// arrive as separate lines. Blank lines are dropped.
#[derive(Debug, Default)]
pub struct LineSplitter {
    pending: Vec<u8>,
}

impl LineSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk; returns every line it completed.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        for &byte in chunk {
            match byte {
                b'\r' | b'\n' => {
                    if let Some(line) = self.take_pending() {
                        lines.push(line);
                    }
                }
                other => {
                    self.pending.push(other);
                    if self.pending.len() >= MAX_PENDING_BYTES {
                        if let Some(line) = self.take_pending() {
                            lines.push(line);
                        }
                    }
                }
            }
        }
        lines
    }

    /// Flush whatever is left once the stream has ended.
    pub fn finish(&mut self) -> Option<String> {
        self.take_pending()
    }

    fn take_pending(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let line = String::from_utf8_lossy(&self.pending).trim_end().to_string();
        self.pending.clear();
        (!line.trim().is_empty()).then_some(line)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fields_persist_across_lines() {
        let mut parser = ProgressParser::new();

        let first = parser.parse_line("Progress: 45.0%, rate 3.2MB/s").unwrap();
        assert_eq!(first.percent, Some(45.0));
        assert_eq!(first.rate_text.as_deref(), Some("3.2MB/s"));
        assert!(first.eta_secs.is_none());

        assert!(parser.parse_line("Loading Steam API...OK").is_none());

        let merged = parser.parse_line("ETA 00:02:10").unwrap();
        assert_eq!(merged.percent, Some(45.0));
        assert_eq!(merged.rate_text.as_deref(), Some("3.2MB/s"));
        assert_eq!(merged.rate_bps, Some(3.2 * 1024.0 * 1024.0));
        assert_eq!(merged.eta_secs, Some(130));
    }

    #[test]
    fn test_native_update_line() {
        let mut parser = ProgressParser::new();
        let event = parser
            .parse_line(" Update state (0x61) downloading, progress: 45.32 (1048576 / 2313682)")
            .unwrap();
        assert_eq!(event.percent, Some(45.32));
        assert_eq!(event.bytes_transferred, Some(1_048_576));
        assert_eq!(event.bytes_total, Some(2_313_682));

        let event = parser
            .parse_line("Update state (0x5) verifying install, progress: 99.10 (2313000 / 2313682)")
            .unwrap();
        assert_eq!(event.percent, Some(99.10));
    }

    #[test]
    fn test_success_line_completes_percent() {
        let mut parser = ProgressParser::new();
        let event = parser.parse_line("Success! App '740' fully installed.").unwrap();
        assert_eq!(event.percent, Some(100.0));
    }

    #[test]
    fn test_eta_forms() {
        assert_eq!(parse_clock("00:02:10"), Ok(130));
        assert_eq!(parse_clock("02:10"), Ok(130));
        assert_eq!(parse_clock("130"), Ok(130));
        assert!(parse_clock("1:2:3:4").is_err());
        assert!(parse_clock("::").is_err());

        let mut parser = ProgressParser::new();
        assert_eq!(parser.parse_line("ETA: 130s").unwrap().eta_secs, Some(130));
    }

    #[test]
    fn test_rate_units() {
        let mut parser = ProgressParser::new();
        let event = parser.parse_line("speed: 700 KB/s").unwrap();
        assert_eq!(event.rate_bps, Some(700.0 * 1024.0));
        assert_eq!(event.rate_text.as_deref(), Some("700KB/s"));

        let event = parser.parse_line("3 MiB/s").unwrap();
        assert_eq!(event.rate_bps, Some(3.0 * 1024.0 * 1024.0));
    }

    #[test]
    fn test_bad_numbers_yield_nothing() {
        let mut parser = ProgressParser::new();
        assert!(parser.parse_line("Progress: -5%").is_none());
        assert!(parser.parse_line("Update state (0x61) downloading, progress: abc").is_none());
        assert!(parser.parse_line("rate -1MB/s").is_none());

        let clamped = parser.parse_line("Progress: 140%").unwrap();
        assert_eq!(clamped.percent, Some(100.0));
    }

    #[test]
    fn test_arbitrary_text_never_panics() {
        let mut parser = ProgressParser::new();
        let noise = [
            "",
            "   ",
            "%%%%",
            "ETA",
            "ETA :",
            "rate MB/s",
            "Update state (0x) , progress:",
            "\u{fffd}\u{fffd} 12",
            "99999999999999999999999999%",
            "ETA 99999999999999999999999",
        ];
        for line in noise {
            let _ = parser.parse_line(line);
        }
    }

    #[test]
    fn test_error_lines_are_remembered() {
        let mut parser = ProgressParser::new();
        assert!(parser.parse_line("ERROR! Failed to install app '500' (No subscription)").is_none());
        assert_eq!(
            parser.last_error(),
            Some("ERROR! Failed to install app '500' (No subscription)")
        );

        parser.parse_line("Logging in user 'someone' to Steam Public...FAILED (Invalid Password)");
        assert!(parser.last_error().unwrap().contains("Invalid Password"));

        parser.parse_line("Progress: 10%");
        assert!(parser.last_error().unwrap().contains("Invalid Password"));
    }

    #[test]
    fn test_splitter_buffers_partial_lines() {
        let mut splitter = LineSplitter::new();
        assert!(splitter.push(b"Progress: 4").is_empty());
        assert_eq!(splitter.push(b"5.0%\rETA 00:0"), vec!["Progress: 45.0%".to_string()]);
        assert_eq!(splitter.push(b"2:10\r\n\n"), vec!["ETA 00:02:10".to_string()]);
        assert!(splitter.finish().is_none());

        splitter.push(b"trailing without newline");
        assert_eq!(splitter.finish().as_deref(), Some("trailing without newline"));
    }

    #[test]
    fn test_splitter_caps_runaway_lines() {
        let mut splitter = LineSplitter::new();
        let chunk = vec![b'x'; MAX_PENDING_BYTES + 10];
        let lines = splitter.push(&chunk);
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].len(), MAX_PENDING_BYTES);
        assert_eq!(splitter.finish().map(|l| l.len()), Some(10));
    }
}
