//! Parsing of the copy tool's streaming progress output.
//!
//! rsync rewrites its progress line in place with `\r`, so output is split on
//! both `\r` and `\n` before parsing. Lines that match none of the patterns
//! are ignored.

use chrono::Duration;
use lazy_static::lazy_static;
use regex::Regex;

const MAX_HOURS: i64 = 100_000;

lazy_static! {
    /// `to-chk=95/100` (or `ir-chk=` while the file list is still growing).
    static ref REMAINING: Regex = Regex::new(r"(?:to|ir)-chk=(\d+)/(\d+)").expect("remaining regex");
    /// Time stamp such as `0:01:23` or `12:00:05`.
    static ref TIME_LEFT: Regex = Regex::new(r"\b(\d+):([0-5]\d):([0-5]\d)\b").expect("time regex");
    /// Leading byte counter of a progress2 line: `  1,234,567  45%`.
    static ref TRANSFERRED: Regex = Regex::new(r"^\s*([\d,]+)\s+\d{1,3}%").expect("bytes regex");
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressEvent {
    /// Files finished so far, `total - remaining` as reported by the tool.
    FilesDone { done: u64, total: u64 },
    /// Cumulative bytes transferred.
    BytesDone(u64),
    /// Tool's own estimate of the time left.
    TimeRemaining(Duration),
}

/// Turns copy-tool lines into progress events.
///
/// The remaining-file counter only ever moves forward: a line reporting
/// more work left than an earlier one is stale and dropped.
#[derive(Debug, Default)]
pub struct ProgressParser {
    last_remaining: Option<u64>,
}

impl ProgressParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn parse_line(&mut self, line: &str) -> Vec<ProgressEvent> {
        let mut events = Vec::new();

        if let Some(caps) = TRANSFERRED.captures(line) {
            let digits: String = caps[1].chars().filter(|c| c.is_ascii_digit()).collect();
            if let Ok(bytes) = digits.parse::<u64>() {
                events.push(ProgressEvent::BytesDone(bytes));
            }
        }

        if let Some(caps) = REMAINING.captures(line) {
            if let (Ok(remaining), Ok(total)) = (caps[1].parse::<u64>(), caps[2].parse::<u64>()) {
                let stale = self.last_remaining.map_or(false, |last| remaining > last);
                if !stale && remaining <= total {
                    self.last_remaining = Some(remaining);
                    events.push(ProgressEvent::FilesDone {
                        done: total - remaining,
                        total,
                    });
                }
            }
        }

        if let Some(caps) = TIME_LEFT.captures(line) {
            let hours: i64 = caps[1].parse::<i64>().unwrap_or(0).min(MAX_HOURS);
            let minutes: i64 = caps[2].parse().unwrap_or(0);
            let seconds: i64 = caps[3].parse().unwrap_or(0);
            events.push(ProgressEvent::TimeRemaining(
                Duration::hours(hours) + Duration::minutes(minutes) + Duration::seconds(seconds),
            ));
        }

        events
    }
}

/// Accumulates raw output bytes and yields complete lines, treating both
/// `\r` and `\n` as terminators.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        for &byte in bytes {
            if byte == b'\r' || byte == b'\n' {
                if !self.pending.is_empty() {
                    lines.push(String::from_utf8_lossy(&self.pending).into_owned());
                    self.pending.clear();
                }
            } else {
                self.pending.push(byte);
            }
        }
        lines
    }

    /// Whatever is left once the stream has ended.
    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            None
        } else {
            let line = String::from_utf8_lossy(&self.pending).into_owned();
            self.pending.clear();
            Some(line)
        }
    }
}
