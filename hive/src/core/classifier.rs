//! Deterministic classification of messenger responses into lifecycle signals.

use regex::{Regex, RegexBuilder};

use crate::core::types::Signal;

pub const DEFAULT_DONE_PATTERNS: &[&str] = &[r"^\s*(DONE|COMPLETED)\b"];
pub const DEFAULT_WAITING_PATTERNS: &[&str] = &[r"^\s*(WAITING|NEEDS_INPUT)\b"];

/// Maps response text to a [`Signal`].
///
/// Implementations must be pure: the same text always yields the same signal.
pub trait SignalClassifier: Send + Sync {
    fn classify(&self, response: &str) -> Signal;
}

/// Keyword classifier driven by per-line regular expressions.
///
/// - `Waiting` if any waiting pattern matches.
/// - `Done` if any done pattern matches.
/// - `None` otherwise, including empty responses.
#[derive(Debug, Clone)]
pub struct KeywordClassifier {
    done: Vec<Regex>,
    waiting: Vec<Regex>,
}

impl KeywordClassifier {
    pub fn new<S: AsRef<str>>(done: &[S], waiting: &[S]) -> Result<Self, regex::Error> {
        Ok(Self {
            done: compile_all(done)?,
            waiting: compile_all(waiting)?,
        })
    }
}

impl Default for KeywordClassifier {
    fn default() -> Self {
        Self::new(DEFAULT_DONE_PATTERNS, DEFAULT_WAITING_PATTERNS)
            .expect("default classifier patterns should be valid")
    }
}

impl SignalClassifier for KeywordClassifier {
    fn classify(&self, response: &str) -> Signal {
        if self.waiting.iter().any(|re| re.is_match(response)) {
            Signal::Waiting
        } else if self.done.iter().any(|re| re.is_match(response)) {
            Signal::Done
        } else {
            Signal::None
        }
    }
}

fn compile_all<S: AsRef<str>>(patterns: &[S]) -> Result<Vec<Regex>, regex::Error> {
    patterns
        .iter()
        .map(|pattern| RegexBuilder::new(pattern.as_ref()).multi_line(true).build())
        .collect()
}
