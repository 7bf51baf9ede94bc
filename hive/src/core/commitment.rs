//! Commitments: machine-checkable assertions that gate completion.
//!
//! A commitment's status is owned by the verifier. Everything outside the
//! crate can declare and read commitments but never set their status.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CommitmentStatus {
    #[default]
    Pending,
    Verifying,
    Passed,
    Failed,
}

impl fmt::Display for CommitmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            CommitmentStatus::Pending => "pending",
            CommitmentStatus::Verifying => "verifying",
            CommitmentStatus::Passed => "passed",
            CommitmentStatus::Failed => "failed",
        };
        f.write_str(label)
    }
}

/// An externally executable check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Check {
    /// Shell command; exit status 0 passes.
    Shell { command: String },
    /// Passes when the path exists relative to the verification workdir.
    PathExists { path: PathBuf },
}

impl Check {
    pub fn shell(command: impl Into<String>) -> Self {
        Check::Shell {
            command: command.into(),
        }
    }
}

impl fmt::Display for Check {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Check::Shell { command } => write!(f, "`{command}`"),
            Check::PathExists { path } => write!(f, "exists {}", path.display()),
        }
    }
}

/// Who declared a commitment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommitmentOrigin {
    #[default]
    Parent,
    Agent,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commitment {
    description: String,
    check: Check,
    #[serde(default)]
    origin: CommitmentOrigin,
    #[serde(default)]
    status: CommitmentStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    detail: Option<String>,
}

impl Commitment {
    pub fn new(description: impl Into<String>, check: Check) -> Self {
        Self {
            description: description.into(),
            check,
            origin: CommitmentOrigin::Parent,
            status: CommitmentStatus::Pending,
            detail: None,
        }
    }

    pub fn declared_by_agent(mut self) -> Self {
        self.origin = CommitmentOrigin::Agent;
        self
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn check(&self) -> &Check {
        &self.check
    }

    pub fn origin(&self) -> CommitmentOrigin {
        self.origin
    }

    pub fn status(&self) -> CommitmentStatus {
        self.status
    }

    /// Output excerpt or failure reason from the last verification.
    pub fn detail(&self) -> Option<&str> {
        self.detail.as_deref()
    }

    pub(crate) fn record(&mut self, status: CommitmentStatus, detail: Option<String>) {
        self.status = status;
        self.detail = detail;
    }
}

/// Ordered commitments owned by one agent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommitmentList {
    items: Vec<Commitment>,
}

impl CommitmentList {
    pub fn new(items: Vec<Commitment>) -> Self {
        Self { items }
    }

    pub fn push(&mut self, commitment: Commitment) {
        self.items.push(commitment);
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Commitment> {
        self.items.iter()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn statuses(&self) -> Vec<CommitmentStatus> {
        self.items.iter().map(Commitment::status).collect()
    }

    /// Vacuously true for an empty list.
    pub fn all_passed(&self) -> bool {
        self.items
            .iter()
            .all(|item| item.status == CommitmentStatus::Passed)
    }

    pub fn failed(&self) -> impl Iterator<Item = &Commitment> {
        self.items
            .iter()
            .filter(|item| item.status == CommitmentStatus::Failed)
    }

    pub(crate) fn items_mut(&mut self) -> &mut [Commitment] {
        &mut self.items
    }
}

impl<'a> IntoIterator for &'a CommitmentList {
    type Item = &'a Commitment;
    type IntoIter = std::slice::Iter<'a, Commitment>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.iter()
    }
}

/// Outcome of verifying a whole list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationResult {
    pub all_passed: bool,
    pub per_commitment: Vec<CommitmentStatus>,
}

impl VerificationResult {
    pub fn from_list(list: &CommitmentList) -> Self {
        Self {
            all_passed: list.all_passed(),
            per_commitment: list.statuses(),
        }
    }
}

/// Commitments an agent declared in one response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeclaredCommitments {
    pub accepted: Vec<Commitment>,
    /// Lines that used the prefix but had no check.
    pub rejected: Vec<String>,
}

/// Extract `<prefix> <description> :: <shell command>` lines.
pub fn parse_declared(response: &str, prefix: &str) -> DeclaredCommitments {
    let mut declared = DeclaredCommitments::default();
    if prefix.is_empty() {
        return declared;
    }
    for line in response.lines() {
        let Some(rest) = line.trim_start().strip_prefix(prefix) else {
            continue;
        };
        match rest.split_once("::") {
            Some((description, command))
                if !description.trim().is_empty() && !command.trim().is_empty() =>
            {
                declared.accepted.push(
                    Commitment::new(description.trim(), Check::shell(command.trim()))
                        .declared_by_agent(),
                );
            }
            _ => declared.rejected.push(line.trim().to_string()),
        }
    }
    declared
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_list_passes_vacuously() {
        let list = CommitmentList::default();
        assert!(list.all_passed());
        assert_eq!(VerificationResult::from_list(&list).per_commitment, vec![]);
    }

    #[test]
    fn single_failure_blocks_all_passed() {
        let mut list = CommitmentList::new(vec![
            Commitment::new("a", Check::shell("true")),
            Commitment::new("b", Check::shell("false")),
        ]);
        list.items_mut()[0].record(CommitmentStatus::Passed, None);
        list.items_mut()[1].record(CommitmentStatus::Failed, Some("exit 1".into()));

        let result = VerificationResult::from_list(&list);
        assert!(!result.all_passed);
        assert_eq!(
            result.per_commitment,
            vec![CommitmentStatus::Passed, CommitmentStatus::Failed]
        );
        let failed: Vec<_> = list.failed().map(Commitment::description).collect();
        assert_eq!(failed, vec!["b"]);
    }

    #[test]
    fn parse_declared_accepts_described_checks() {
        let response = "working on it\nCOMMITMENT: tests pass :: cargo test -q\n  COMMITMENT: no check\nDONE";
        let declared = parse_declared(response, "COMMITMENT:");
        assert_eq!(declared.accepted.len(), 1);
        let commitment = &declared.accepted[0];
        assert_eq!(commitment.description(), "tests pass");
        assert_eq!(commitment.check(), &Check::shell("cargo test -q"));
        assert_eq!(commitment.origin(), CommitmentOrigin::Agent);
        assert_eq!(declared.rejected, vec!["COMMITMENT: no check".to_string()]);
    }

    #[test]
    fn check_serializes_with_kind_tag() {
        let json = serde_json::to_value(Check::shell("true")).expect("serialize");
        assert_eq!(json["kind"], "shell");
        assert_eq!(json["command"], "true");
    }
}
