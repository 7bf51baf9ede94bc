//! Token budget accounting.

/// Rough token estimate used when the messenger does not report usage.
pub fn estimate_tokens(prompt: &str, response: &str) -> u64 {
    ((prompt.len() + response.len()) as u64).div_ceil(4)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BudgetStatus {
    Within,
    Exceeded { used: u64, ceiling: u64 },
}

/// Token ceiling for one agent. `None` means unbounded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TokenBudget {
    ceiling: Option<u64>,
    used: u64,
}

impl TokenBudget {
    pub fn new(ceiling: Option<u64>) -> Self {
        Self { ceiling, used: 0 }
    }

    pub fn restore(ceiling: Option<u64>, used: u64) -> Self {
        Self { ceiling, used }
    }

    pub fn ceiling(&self) -> Option<u64> {
        self.ceiling
    }

    pub fn used(&self) -> u64 {
        self.used
    }

    pub fn charge(&mut self, tokens: u64) -> BudgetStatus {
        self.used = self.used.saturating_add(tokens);
        match self.ceiling {
            Some(ceiling) if self.used > ceiling => BudgetStatus::Exceeded {
                used: self.used,
                ceiling,
            },
            _ => BudgetStatus::Within,
        }
    }
}
