//! Marker-delimited output protocol.
//!
//! Every command is bracketed by a start and an end token printed by the
//! debugger itself. The text between the first start token and the first end
//! token after it is the command's output.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

const TOKEN_PREFIX: &str = "<<<GDB";
const START_TAG: &str = "OUTPUT_START";
const END_TAG: &str = "OUTPUT_END";
const PROBE_TAG: &str = "PROBE";
const INTERRUPTED_TAG: &str = "INTERRUPTED";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarkerPair {
    pub start_token: String,
    pub end_token: String,
}

/// Result of matching a captured buffer against a [`MarkerPair`].
///
/// `Incomplete` and `Complete(String::new())` are different outcomes: the
/// first means the end token has not been printed yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Extraction {
    StartMissing,
    Incomplete,
    Complete(String),
}

impl Extraction {
    pub fn into_output(self) -> Option<String> {
        match self {
            Extraction::Complete(text) => Some(text),
            _ => None,
        }
    }
}

/// Source of unique marker values. Combines wall-clock milliseconds with a
/// per-generator counter so two pairs made within the same tick still differ.
#[derive(Debug)]
pub struct MarkerGenerator {
    sequence: AtomicU64,
}

impl MarkerGenerator {
    pub fn new() -> Self {
        Self {
            sequence: AtomicU64::new(1),
        }
    }

    fn next_stamp(&self) -> String {
        let seq = self.sequence.fetch_add(1, Ordering::Relaxed);
        format!("{}_{}", timestamp_millis(), seq)
    }

    pub fn make_markers(&self) -> MarkerPair {
        let stamp = self.next_stamp();
        MarkerPair {
            start_token: token(START_TAG, &stamp),
            end_token: token(END_TAG, &stamp),
        }
    }

    /// Disposable token used to check that a transport still echoes input.
    pub fn make_probe(&self) -> String {
        token(PROBE_TAG, &self.next_stamp())
    }

    /// Sentinel written after an interrupt to bring the prompt back.
    pub fn make_interrupt_sentinel(&self) -> String {
        token(INTERRUPTED_TAG, &self.next_stamp())
    }
}

impl Default for MarkerGenerator {
    fn default() -> Self {
        Self::new()
    }
}

fn token(tag: &str, stamp: &str) -> String {
    format!("{TOKEN_PREFIX}_{tag}_{stamp}>>>")
}

fn timestamp_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0)
}

/// Debugger input line that prints `token` followed by a newline.
///
/// The first underscore is escaped so the typed line, which the terminal
/// echoes back, never contains the literal token. The debugger's `echo`
/// drops the backslash when printing.
pub fn echo_line(token: &str) -> String {
    format!("echo {}\\n", token.replacen('_', "\\_", 1))
}

/// Returns the text strictly between the first `start_token` and the first
/// `end_token` after it, with one leading echo of `command` removed.
pub fn extract(buffer: &str, pair: &MarkerPair, command: &str) -> Extraction {
    let Some(start) = buffer.find(&pair.start_token) else {
        return Extraction::StartMissing;
    };
    let after_start = &buffer[start + pair.start_token.len()..];
    let Some(end) = after_start.find(&pair.end_token) else {
        return Extraction::Incomplete;
    };
    Extraction::Complete(strip_command_echo(&after_start[..end], command).to_string())
}

/// Everything printed after `start_token`, for commands that never reached
/// their end token. `None` when the start token is not visible.
pub fn partial_after_start<'a>(buffer: &'a str, pair: &MarkerPair, command: &str) -> Option<&'a str> {
    let start = buffer.find(&pair.start_token)?;
    let after_start = &buffer[start + pair.start_token.len()..];
    Some(strip_command_echo(after_start, command))
}

/// Drops the first non-blank line when it ends with the command text, which
/// is how a terminal shows typed input after the prompt.
fn strip_command_echo<'a>(text: &'a str, command: &str) -> &'a str {
    let command = command.trim();
    if command.is_empty() {
        return text;
    }

    let mut offset = 0;
    for line in text.split_inclusive('\n') {
        let content = line.trim_end_matches(&['\r', '\n'][..]);
        if content.trim().is_empty() {
            offset += line.len();
            continue;
        }
        if content.trim_end().ends_with(command) {
            return &text[offset + line.len()..];
        }
        break;
    }
    text
}
