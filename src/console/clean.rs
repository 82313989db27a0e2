//! Incremental console-stream cleaner.
//!
//! Transforms raw SOL bytes into log-ready text: ANSI/cursor stripping that
//! is safe across chunk boundaries, carriage-return overwrite semantics
//! (collapses BIOS spinners), control-byte scrubbing, blank-line clamping
//! and two layers of duplicate suppression.
//!
//! The pipeline is a per-server state machine with no I/O; `LogWriter`
//! feeds it one received chunk at a time and appends whatever survives.
//!
//! Output guarantees, regardless of input:
//! - no ESC byte, every byte in `{\n, \t} ∪ [0x20, 0x7E]`
//! - never three consecutive newlines, within or across chunks
//! - a chunk split inside an ANSI escape cleans identically to the
//!   unsplit stream

use std::collections::HashMap;
use std::sync::LazyLock;
use std::time::{Duration, Instant};

use regex::bytes::Regex;

use crate::constants::LINE_DEDUP_TTL;

/// Cursor-position sequences `ESC[row;colH`, `ESC[rowH`, `ESC[H` (and the
/// `f` variants). Column ≤ 1 is a line start and becomes `\n`; anything
/// further right is mid-row cursor motion and is dropped so it cannot
/// split a logical line.
static CURSOR_POSITION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?-u)\x1b\[(?:\d+)?(?:;(\d+))?[Hf]").unwrap());

/// CSI sequences other than cursor positioning.
static CSI: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?-u)\x1b\[[0-9;?=<>]*[@-~]").unwrap());

/// OSC sequences, BEL- or ST-terminated.
static OSC: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s-u)\x1b\].*?(?:\x07|\x1b\\)").unwrap());

/// Two-character escapes (charset selection, keypad modes, ESC 7/8, …).
static TWO_CHAR_ESC: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?-u)\x1b[^\[\]]").unwrap());

/// Bracket fragments that lost their ESC to a dropped datagram: `[=3h`,
/// `[01;00H` and the like. Requires a digit, `=` or `?` after the bracket
/// so prose such as `[OK]` survives.
static ORPHAN_FRAGMENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?-u)\[[=?]?\d[0-9;]*[A-Za-z]").unwrap());

/// Characters a spinner animation cycles through, stripped before the
/// single-line comparison.
const SPINNER_CHARS: &[char] = &['/', '-', '\\', '|', '.'];

/// Per-server cleaning state. One instance per log stream, owned by the
/// writer's `LogState`.
#[derive(Debug, Default)]
pub struct CleanState {
    /// Unterminated escape prefix stashed from the previous chunk.
    pending_escape: Vec<u8>,
    /// Last written line, spinner-normalised.
    last_line: String,
    /// Newlines the previous accepted write ended with.
    trailing_newlines: usize,
    /// line → last-seen time, for the TTL duplicate suppression.
    recent: HashMap<String, Instant>,
    /// Suppressed-line count awaiting a banner.
    duplicates: u64,
}

impl CleanState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reset everything except the TTL map's allocation. Called on log
    /// rotation so a fresh file does not inherit dedup state.
    pub fn reset(&mut self) {
        self.pending_escape.clear();
        self.last_line.clear();
        self.trailing_newlines = 0;
        self.recent.clear();
        self.duplicates = 0;
    }

    /// Run the full pipeline over one received chunk; returns the bytes to
    /// append (possibly empty).
    pub fn process(&mut self, chunk: &[u8]) -> Vec<u8> {
        self.process_at(chunk, Instant::now())
    }

    /// As [`CleanState::process`], with an explicit clock for tests.
    pub fn process_at(&mut self, chunk: &[u8], now: Instant) -> Vec<u8> {
        // 1. Escape-safety: splice the stashed tail in front, stash any new
        //    unterminated suffix.
        let mut data = std::mem::take(&mut self.pending_escape);
        data.extend_from_slice(chunk);
        if let Some(pos) = incomplete_escape_suffix(&data) {
            self.pending_escape = data.split_off(pos);
        }
        if data.is_empty() {
            return Vec::new();
        }

        // 2–3. Cursor motion, then everything ANSI that is left.
        let data = rewrite_cursor_positions(&data);
        let data = strip_ansi(&data);

        // 4. CR overwrite semantics.
        let data = collapse_carriage_returns(&data);

        // 5. Printable 7-bit plus newline and tab.
        let data: Vec<u8> = data
            .into_iter()
            .filter(|b| *b == b'\n' || *b == b'\t' || (0x20..=0x7E).contains(b))
            .collect();

        // 6. Right-trim lines, cap newline runs at two.
        let data = trim_and_collapse(&data);
        if data.is_empty() {
            return Vec::new();
        }

        // Scrubbed to ASCII above, so this cannot fail.
        let text = String::from_utf8(data).expect("cleaned bytes are ASCII");

        // 7. Spinner dedup on single-line chunks.
        let text = match self.dedup_spinner(text) {
            Some(text) => text,
            None => return Vec::new(),
        };

        // 8. Cross-chunk blank-line clamp.
        let text = self.clamp_blank_lines(text);
        if text.is_empty() {
            return Vec::new();
        }

        // 9. TTL line dedup with the "(Duplicated N lines)" banner.
        let out = self.dedup_recent_lines(&text, now);
        if !out.is_empty() {
            self.trailing_newlines = trailing_newline_run(&out);
        }
        out.into_bytes()
    }

    fn dedup_spinner(&mut self, text: String) -> Option<String> {
        let stripped = text.trim_start_matches('\n');
        if !stripped.is_empty() && !stripped.contains('\n') {
            let normalised = stripped.trim_end_matches(SPINNER_CHARS);
            if !normalised.is_empty() {
                if normalised == self.last_line {
                    return None;
                }
                self.last_line = normalised.to_string();
            }
        } else if let Some(last) = stripped.lines().filter(|l| !l.is_empty()).next_back() {
            self.last_line = last.trim_end_matches(SPINNER_CHARS).to_string();
        }
        Some(text)
    }

    fn clamp_blank_lines(&mut self, text: String) -> String {
        let leading = text.len() - text.trim_start_matches('\n').len();
        let total = self.trailing_newlines + leading;
        if total <= 2 {
            return text;
        }
        let excess = (total - 2).min(leading);
        text[excess..].to_string()
    }

    fn dedup_recent_lines(&mut self, text: &str, now: Instant) -> String {
        self.evict_expired(now, LINE_DEDUP_TTL);

        let mut out = String::with_capacity(text.len());
        let mut rest = text;
        while let Some(pos) = rest.find('\n') {
            let (line, tail) = rest.split_at(pos + 1);
            rest = tail;
            let content = &line[..line.len() - 1];
            if content.is_empty() {
                // Suppressed lines between blanks must not let a run of
                // three newlines through.
                let run = if out.is_empty() {
                    self.trailing_newlines
                } else {
                    trailing_newline_run(&out)
                };
                if run < 2 {
                    out.push('\n');
                }
                continue;
            }
            if self.recent.insert(content.to_string(), now).is_some() {
                self.duplicates += 1;
                continue;
            }
            if self.duplicates > 0 {
                out.push_str(&format!("(Duplicated {} lines)\n", self.duplicates));
                self.duplicates = 0;
            }
            out.push_str(line);
        }
        // Trailing partial line passes through untouched; dedup only ever
        // judges complete lines.
        if !rest.is_empty() {
            if self.duplicates > 0 {
                out.push_str(&format!("(Duplicated {} lines)\n", self.duplicates));
                self.duplicates = 0;
            }
            out.push_str(rest);
        }
        out
    }

    fn evict_expired(&mut self, now: Instant, ttl: Duration) {
        self.recent
            .retain(|_, seen| now.duration_since(*seen) < ttl);
    }
}

/// Position of an unterminated escape suffix worth stashing: a trailing
/// ESC, or ESC plus an unfinished CSI/OSC prefix of at most 6 bytes.
fn incomplete_escape_suffix(data: &[u8]) -> Option<usize> {
    let esc = data.iter().rposition(|b| *b == 0x1B)?;
    let tail = &data[esc..];
    if tail.len() > 7 {
        // Too long to be a prefix we would ever complete; let the
        // stripper deal with whatever it is.
        return None;
    }
    if tail.len() == 1 {
        return Some(esc);
    }
    match tail[1] {
        // CSI: complete once a final byte 0x40..=0x7E follows the params.
        b'[' => {
            if tail[2..].iter().any(|b| (0x40..=0x7E).contains(b)) {
                None
            } else {
                Some(esc)
            }
        }
        // OSC: BEL-terminated (the ESC-\ form re-enters this function as a
        // fresh trailing ESC and stashes correctly on its own).
        b']' => {
            if tail[2..].contains(&0x07) {
                None
            } else {
                Some(esc)
            }
        }
        // Two-character escape, already complete.
        _ => None,
    }
}

fn rewrite_cursor_positions(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    let mut last = 0;
    for caps in CURSOR_POSITION.captures_iter(data) {
        let m = caps.get(0).unwrap();
        out.extend_from_slice(&data[last..m.start()]);
        let column = caps
            .get(1)
            .and_then(|c| std::str::from_utf8(c.as_bytes()).ok())
            .and_then(|c| c.parse::<u32>().ok())
            .unwrap_or(1);
        if column <= 1 {
            out.push(b'\n');
        }
        last = m.end();
    }
    out.extend_from_slice(&data[last..]);
    out
}

fn strip_ansi(data: &[u8]) -> Vec<u8> {
    let data = OSC.replace_all(data, &b""[..]);
    let data = CSI.replace_all(&data, &b""[..]);
    let data = TWO_CHAR_ESC.replace_all(&data, &b""[..]);
    let data = ORPHAN_FRAGMENT.replace_all(&data, &b""[..]);
    data.into_owned()
}

/// `\r\n` → `\n`; within each remaining line, text before the last `\r`
/// is overwritten by the text after it.
fn collapse_carriage_returns(data: &[u8]) -> Vec<u8> {
    let mut normalised = Vec::with_capacity(data.len());
    let mut i = 0;
    while i < data.len() {
        if data[i] == b'\r' && data.get(i + 1) == Some(&b'\n') {
            normalised.push(b'\n');
            i += 2;
        } else {
            normalised.push(data[i]);
            i += 1;
        }
    }

    let mut out = Vec::with_capacity(normalised.len());
    for segment in normalised.split_inclusive(|b| *b == b'\n') {
        let (line, newline) = match segment.last() {
            Some(&b'\n') => (&segment[..segment.len() - 1], true),
            _ => (segment, false),
        };
        let kept = match line.iter().rposition(|b| *b == b'\r') {
            Some(pos) => &line[pos + 1..],
            None => line,
        };
        out.extend_from_slice(kept);
        if newline {
            out.push(b'\n');
        }
    }
    out
}

/// Right-trim every line and collapse runs of three or more newlines down
/// to exactly two.
fn trim_and_collapse(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    let mut newline_run = 0;
    for segment in data.split_inclusive(|b| *b == b'\n') {
        let (line, newline) = match segment.last() {
            Some(&b'\n') => (&segment[..segment.len() - 1], true),
            _ => (segment, false),
        };
        let trimmed = match line.iter().rposition(|b| *b != b' ' && *b != b'\t') {
            Some(pos) => &line[..=pos],
            None => &[],
        };
        out.extend_from_slice(trimmed);
        if newline {
            if trimmed.is_empty() {
                newline_run += 1;
            } else {
                newline_run = 1;
            }
            if newline_run <= 2 {
                out.push(b'\n');
            }
        }
    }
    out
}

fn trailing_newline_run(text: &str) -> usize {
    text.len() - text.trim_end_matches('\n').len()
}

// ─── Tests ──────────────────────────────────────────────────────────────────
