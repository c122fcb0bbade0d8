//! Transfer progress parsing.
//!
//! adb's textual progress format is undocumented and varies by platform and
//! version, so the tracker runs three recognition strategies in priority
//! order over a rolling buffer: an explicit `NN%` token, a `(current/total)`
//! byte ratio, and a bare `(N bytes` report that only ever means completion.

use std::sync::OnceLock;

use regex::Regex;

use crate::event::TransferDirection;

/// One deduplicated progress observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressUpdate {
    pub download: bool,
    pub percent: u8,
}

#[derive(Debug, Default)]
pub struct TransferTracker {
    direction: TransferDirection,
    buffer: String,
    last_percent: Option<u8>,
    total_bytes: u64,
    current_bytes: Option<u64>,
}

static PERCENT_REGEX: OnceLock<Regex> = OnceLock::new();
static RATIO_REGEX: OnceLock<Regex> = OnceLock::new();
static BYTES_DONE_REGEX: OnceLock<Regex> = OnceLock::new();

fn percent_regex() -> &'static Regex {
    PERCENT_REGEX.get_or_init(|| Regex::new(r"(\d+)%").expect("invalid percent regex"))
}

fn ratio_regex() -> &'static Regex {
    RATIO_REGEX.get_or_init(|| Regex::new(r"\((\d+)\s*/\s*(\d+)\)").expect("invalid ratio regex"))
}

fn bytes_done_regex() -> &'static Regex {
    BYTES_DONE_REGEX.get_or_init(|| Regex::new(r"\((\d+)\s+bytes").expect("invalid bytes regex"))
}

/// Most recent parseable `NN%` token in the buffer.
fn last_percent_token(buffer: &str) -> Option<u64> {
    let mut last = None;
    for caps in percent_regex().captures_iter(buffer) {
        if let Ok(value) = caps[1].parse::<u64>() {
            last = Some(value);
        }
    }
    last
}

struct ByteRatio {
    current: u64,
    total: u64,
    percent: u64,
}

/// Most recent `(current/total)` pair with total > 0. adb's default output
/// has no percentage at all, only "xx MB/s (sent/total)".
fn last_byte_ratio(buffer: &str) -> Option<ByteRatio> {
    let mut last = None;
    for caps in ratio_regex().captures_iter(buffer) {
        let (Ok(current), Ok(total)) = (caps[1].parse::<u64>(), caps[2].parse::<u64>()) else {
            continue;
        };
        if total == 0 {
            continue;
        }
        let percent = ((current as u128 * 100) / total as u128) as u64;
        last = Some(ByteRatio {
            current,
            total,
            percent,
        });
    }
    last
}

/// A lone `(N bytes` report with no ratio is only ever printed once the
/// transfer finished.
fn bytes_only_done(buffer: &str) -> bool {
    bytes_done_regex().is_match(buffer)
}

impl TransferTracker {
    pub fn new(direction: TransferDirection) -> Self {
        Self {
            direction,
            ..Self::default()
        }
    }

    pub fn direction(&self) -> TransferDirection {
        self.direction
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    pub fn current_bytes(&self) -> Option<u64> {
        self.current_bytes
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Consume one output increment and return at most one deduplicated
    /// update. Returns `None` outside a transfer, on unparseable text, and
    /// on out-of-range or repeated values.
    pub fn push_chunk(&mut self, text: &str) -> Option<ProgressUpdate> {
        if !self.direction.is_transfer() {
            return None;
        }

        // Progress lines are overwritten in place with carriage returns;
        // normalize so the match always sees complete numbers.
        self.buffer.push_str(text);
        if self.buffer.contains('\r') {
            self.buffer = self.buffer.replace('\r', "\n");
        }

        // Strategy order matters: an explicit percentage masks the ratio
        // fallback, and both mask the bytes-only completion pattern.
        let candidate = match last_percent_token(&self.buffer) {
            Some(value) => Some(value),
            None => match last_byte_ratio(&self.buffer) {
                Some(ratio) => {
                    self.total_bytes = ratio.total;
                    self.current_bytes = Some(ratio.current);
                    Some(ratio.percent)
                }
                None => bytes_only_done(&self.buffer).then_some(100),
            },
        };

        // Out-of-range values are malformed tool output; dropped, not
        // clamped.
        let percent = match candidate {
            Some(value) if value <= 100 => value as u8,
            _ => return None,
        };

        let update = if self.last_percent != Some(percent) {
            self.last_percent = Some(percent);
            Some(ProgressUpdate {
                download: self.direction.is_download(),
                percent,
            })
        } else {
            None
        };

        if percent == 100 {
            self.reset();
        }

        update
    }
}
