//! Spin detection: an agent repeating itself instead of making progress.

/// Flags `threshold` consecutive responses that are identical after
/// whitespace and case normalization. A threshold below 2 disables detection.
#[derive(Debug, Clone)]
pub struct SpinDetector {
    threshold: usize,
    last: Option<String>,
    repeats: usize,
}

impl SpinDetector {
    pub fn new(threshold: usize) -> Self {
        Self {
            threshold,
            last: None,
            repeats: 0,
        }
    }

    /// Record a response; returns true once the agent is spinning.
    pub fn observe(&mut self, response: &str) -> bool {
        let normalized = normalize(response);
        if self.last.as_deref() == Some(normalized.as_str()) {
            self.repeats += 1;
        } else {
            self.last = Some(normalized);
            self.repeats = 1;
        }
        self.threshold >= 2 && self.repeats >= self.threshold
    }
}

fn normalize(response: &str) -> String {
    response
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}
