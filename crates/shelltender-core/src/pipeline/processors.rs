//! Built-in processors
//!
//! Redaction, rate limiting and byte shaping. All operate on raw bytes via
//! `regex::bytes` so non-UTF-8 PTY output passes through unharmed.

use super::{ProcessedDataEvent, Processor, ProcessorOutcome};
use once_cell::sync::Lazy;
use regex::bytes::Regex;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

const REDACTED: &[u8] = b"[REDACTED]";

/// Replaces every match of the configured regexes with `[REDACTED]`.
/// Priority band: security (10).
pub struct SecurityFilter {
    patterns: Vec<Regex>,
}

impl SecurityFilter {
    pub fn new(patterns: Vec<Regex>) -> Self {
        Self { patterns }
    }
}

impl Processor for SecurityFilter {
    fn name(&self) -> &str {
        "security"
    }

    fn priority(&self) -> u8 {
        10
    }

    fn apply(&self, event: &ProcessedDataEvent) -> anyhow::Result<ProcessorOutcome> {
        let mut data = event.processed_data.to_vec();
        let mut changed = false;
        for pattern in &self.patterns {
            if pattern.is_match(&data) {
                data = pattern.replace_all(&data, REDACTED).into_owned();
                changed = true;
            }
        }
        Ok(if changed {
            ProcessorOutcome::Replaced(data)
        } else {
            ProcessorOutcome::Unchanged
        })
    }
}

static CARD_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        // Visa, MasterCard, Amex, Discover
        r"\b4[0-9]{12}(?:[0-9]{3})?\b",
        r"\b5[1-5][0-9]{14}\b",
        r"\b3[47][0-9]{13}\b",
        r"\b6(?:011|5[0-9]{2})[0-9]{12}\b",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("static card regex"))
    .collect()
});

/// Redacts primary account numbers of the major card networks.
/// Priority band: compliance (20).
pub struct CreditCardRedactor;

impl CreditCardRedactor {
    pub fn new() -> Self {
        Self
    }
}

impl Default for CreditCardRedactor {
    fn default() -> Self {
        Self::new()
    }
}

impl Processor for CreditCardRedactor {
    fn name(&self) -> &str {
        "credit-card"
    }

    fn priority(&self) -> u8 {
        20
    }

    fn apply(&self, event: &ProcessedDataEvent) -> anyhow::Result<ProcessorOutcome> {
        let mut data = event.processed_data.to_vec();
        let mut changed = false;
        for pattern in CARD_PATTERNS.iter() {
            if pattern.is_match(&data) {
                data = pattern.replace_all(&data, REDACTED).into_owned();
                changed = true;
            }
        }
        Ok(if changed {
            ProcessorOutcome::Replaced(data)
        } else {
            ProcessorOutcome::Unchanged
        })
    }
}

struct Window {
    entries: VecDeque<(Instant, usize)>,
    total: usize,
}

/// Per-session sliding one-second window; chunks that would exceed the
/// budget are dropped. Priority band: shaping (30).
pub struct RateLimiter {
    max_bytes_per_second: usize,
    windows: Mutex<HashMap<String, Window>>,
}

impl RateLimiter {
    pub fn new(max_bytes_per_second: usize) -> Self {
        Self {
            max_bytes_per_second,
            windows: Mutex::new(HashMap::new()),
        }
    }
}

impl Processor for RateLimiter {
    fn name(&self) -> &str {
        "rate-limit"
    }

    fn priority(&self) -> u8 {
        30
    }

    fn apply(&self, event: &ProcessedDataEvent) -> anyhow::Result<ProcessorOutcome> {
        let now = Instant::now();
        let mut windows = self.windows.lock().unwrap();
        let window = windows
            .entry(event.session_id.clone())
            .or_insert_with(|| Window {
                entries: VecDeque::new(),
                total: 0,
            });

        while let Some(&(at, len)) = window.entries.front() {
            if now.duration_since(at) > Duration::from_secs(1) {
                window.entries.pop_front();
                window.total -= len;
            } else {
                break;
            }
        }

        let len = event.processed_data.len();
        if window.total + len > self.max_bytes_per_second {
            return Ok(ProcessorOutcome::Drop);
        }
        window.entries.push_back((now, len));
        window.total += len;
        Ok(ProcessorOutcome::Unchanged)
    }
}

static ANSI_SEQUENCES: Lazy<Regex> = Lazy::new(|| {
    // CSI, OSC (BEL or ST terminated) and lone two-byte escapes.
    Regex::new(r"\x1b\[[0-9;?]*[ -/]*[@-~]|\x1b\][^\x07\x1b]*(?:\x07|\x1b\\)|\x1b[@-Z\\^_]")
        .expect("static ansi regex")
});

/// Strips ANSI escape sequences. Priority band: shaping (40).
pub struct AnsiStripper;

impl AnsiStripper {
    pub fn new() -> Self {
        Self
    }
}

impl Default for AnsiStripper {
    fn default() -> Self {
        Self::new()
    }
}

impl Processor for AnsiStripper {
    fn name(&self) -> &str {
        "ansi-strip"
    }

    fn priority(&self) -> u8 {
        40
    }

    fn apply(&self, event: &ProcessedDataEvent) -> anyhow::Result<ProcessorOutcome> {
        let data = &event.processed_data;
        if !ANSI_SEQUENCES.is_match(data) {
            return Ok(ProcessorOutcome::Unchanged);
        }
        Ok(ProcessorOutcome::Replaced(
            ANSI_SEQUENCES.replace_all(data, &b""[..]).into_owned(),
        ))
    }
}

static LINE_ENDINGS: Lazy<Regex> = Lazy::new(|| Regex::new(r"\r\n?").expect("static crlf regex"));

/// Normalizes CRLF and lone CR to LF. Priority band: shaping (41).
pub struct LineEndingNormalizer;

impl LineEndingNormalizer {
    pub fn new() -> Self {
        Self
    }
}

impl Default for LineEndingNormalizer {
    fn default() -> Self {
        Self::new()
    }
}

impl Processor for LineEndingNormalizer {
    fn name(&self) -> &str {
        "line-endings"
    }

    fn priority(&self) -> u8 {
        41
    }

    fn apply(&self, event: &ProcessedDataEvent) -> anyhow::Result<ProcessorOutcome> {
        let data = &event.processed_data;
        if !data.contains(&b'\r') {
            return Ok(ProcessorOutcome::Unchanged);
        }
        Ok(ProcessorOutcome::Replaced(
            LINE_ENDINGS.replace_all(data, &b"\n"[..]).into_owned(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::ChunkMetadata;
    use bytes::Bytes;
    use chrono::Utc;
    use shelltender_types::DataSource;

    fn event(data: &[u8]) -> ProcessedDataEvent {
        ProcessedDataEvent {
            session_id: "s1".to_string(),
            timestamp: Utc::now(),
            original_data: Bytes::copy_from_slice(data),
            processed_data: Bytes::copy_from_slice(data),
            transformations: Vec::new(),
            metadata: ChunkMetadata::from_source(DataSource::Pty),
        }
    }

    fn replaced(outcome: ProcessorOutcome) -> Vec<u8> {
        match outcome {
            ProcessorOutcome::Replaced(data) => data,
            ProcessorOutcome::Unchanged => panic!("expected replacement, got unchanged"),
            ProcessorOutcome::Drop => panic!("expected replacement, got drop"),
        }
    }

    #[test]
    fn security_filter_redacts_each_match_once() {
        let filter = SecurityFilter::new(vec![Regex::new(r"password=\S+").unwrap()]);
        let out = replaced(filter.apply(&event(b"echo password=hunter2\n")).unwrap());
        assert_eq!(out, b"echo [REDACTED]\n");
    }

    #[test]
    fn credit_card_redactor_handles_major_networks() {
        let redactor = CreditCardRedactor::new();
        for pan in [
            "4111111111111111",    // Visa
            "5500005555555559",    // MasterCard
            "340000000000009",     // Amex
            "6011000000000004",    // Discover
        ] {
            let input = format!("card {pan} ok");
            let out = replaced(redactor.apply(&event(input.as_bytes())).unwrap());
            assert_eq!(out, b"card [REDACTED] ok");
        }
    }

    #[test]
    fn credit_card_redactor_leaves_short_numbers_alone() {
        let redactor = CreditCardRedactor::new();
        assert!(matches!(
            redactor.apply(&event(b"order 12345 total 678")).unwrap(),
            ProcessorOutcome::Unchanged
        ));
    }

    #[test]
    fn rate_limiter_drops_excess_within_window() {
        let limiter = RateLimiter::new(10);
        assert!(matches!(
            limiter.apply(&event(b"12345678")).unwrap(),
            ProcessorOutcome::Unchanged
        ));
        // 8 + 8 > 10: over budget within the same second.
        assert!(matches!(
            limiter.apply(&event(b"12345678")).unwrap(),
            ProcessorOutcome::Drop
        ));
        // A different session has its own window.
        let mut other = event(b"12345678");
        other.session_id = "s2".to_string();
        assert!(matches!(
            limiter.apply(&other).unwrap(),
            ProcessorOutcome::Unchanged
        ));
    }

    #[test]
    fn ansi_stripper_removes_csi_and_osc() {
        let stripper = AnsiStripper::new();
        let out = replaced(
            stripper
                .apply(&event(b"\x1b[31mred\x1b[0m \x1b]0;title\x07done"))
                .unwrap(),
        );
        assert_eq!(out, b"red done");
    }

    #[test]
    fn line_endings_normalize_crlf_and_cr() {
        let normalizer = LineEndingNormalizer::new();
        let out = replaced(normalizer.apply(&event(b"a\r\nb\rc\n")).unwrap());
        assert_eq!(out, b"a\nb\nc\n");
    }
}
