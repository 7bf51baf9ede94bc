//! Hive configuration stored under `.hive/config.toml`.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::classifier::{DEFAULT_DONE_PATTERNS, DEFAULT_WAITING_PATTERNS, KeywordClassifier};
use crate::core::naming::DEFAULT_TIERS;

/// Hive configuration (TOML).
///
/// Intended to be edited by humans. Missing fields default to conservative
/// values.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct HiveConfig {
    /// Ceiling on live agents (root included).
    pub max_agents: usize,

    pub messenger: MessengerConfig,
    pub verifier: VerifierConfig,
    pub lifecycle: LifecycleConfig,
    pub classifier: ClassifierConfig,
    pub naming: NamingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct MessengerConfig {
    /// Command invoked per call; the prompt is written to stdin.
    pub command: Vec<String>,
    /// Flag placed before the continuation token when resuming.
    pub resume_flag: String,
    /// Per-attempt timeout in seconds.
    pub timeout_secs: u64,
    /// Attempts per call before the failure is surfaced to the agent.
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    /// Process-wide ceiling on concurrent messenger calls.
    pub max_in_flight: usize,
    pub output_limit_bytes: usize,
}

impl Default for MessengerConfig {
    fn default() -> Self {
        Self {
            command: vec![
                "claude".to_string(),
                "-p".to_string(),
                "--output-format".to_string(),
                "json".to_string(),
            ],
            resume_flag: "--resume".to_string(),
            timeout_secs: 10 * 60,
            max_attempts: 3,
            backoff_base_ms: 500,
            backoff_max_ms: 10_000,
            max_in_flight: 10,
            output_limit_bytes: 1_000_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct VerifierConfig {
    /// Per-check timeout in seconds. A timed-out check fails.
    pub timeout_secs: u64,
    /// Shell prefix for `shell` checks (e.g. `["sh","-c"]`).
    pub shell: Vec<String>,
    pub output_limit_bytes: usize,
}

impl Default for VerifierConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 5 * 60,
            shell: vec!["sh".to_string(), "-c".to_string()],
            output_limit_bytes: 100_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LifecycleConfig {
    /// Seconds an agent may wait for input before it is reaped.
    pub input_timeout_secs: u64,
    /// Identical consecutive responses that count as spinning.
    pub spin_threshold: usize,
    /// Token ceiling for agents spawned without one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_token_budget: Option<u64>,
    /// Re-prompt assigned agents whose reply carries no signal.
    pub auto_continue: bool,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            input_timeout_secs: 60 * 60,
            spin_threshold: 3,
            default_token_budget: None,
            auto_continue: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ClassifierConfig {
    pub done_patterns: Vec<String>,
    pub waiting_patterns: Vec<String>,
    /// Line prefix for commitments an agent declares itself.
    pub commitment_prefix: String,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            done_patterns: DEFAULT_DONE_PATTERNS.iter().map(|p| p.to_string()).collect(),
            waiting_patterns: DEFAULT_WAITING_PATTERNS
                .iter()
                .map(|p| p.to_string())
                .collect(),
            commitment_prefix: "COMMITMENT:".to_string(),
        }
    }
}

impl ClassifierConfig {
    pub fn build(&self) -> Result<KeywordClassifier> {
        KeywordClassifier::new(&self.done_patterns, &self.waiting_patterns)
            .context("compile classifier patterns")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct NamingConfig {
    /// Name tiers, cheapest first.
    pub tiers: Vec<Vec<String>>,
    /// Name given to the root agent.
    pub root_name: String,
}

impl Default for NamingConfig {
    fn default() -> Self {
        Self {
            tiers: DEFAULT_TIERS
                .iter()
                .map(|tier| tier.iter().map(|name| name.to_string()).collect())
                .collect(),
            root_name: "hive".to_string(),
        }
    }
}

impl Default for HiveConfig {
    fn default() -> Self {
        Self {
            max_agents: 64,
            messenger: MessengerConfig::default(),
            verifier: VerifierConfig::default(),
            lifecycle: LifecycleConfig::default(),
            classifier: ClassifierConfig::default(),
            naming: NamingConfig::default(),
        }
    }
}

impl HiveConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_agents < 2 {
            return Err(anyhow!("max_agents must be >= 2 (root plus one worker)"));
        }
        if self.messenger.command.is_empty() || self.messenger.command[0].trim().is_empty() {
            return Err(anyhow!("messenger.command must be a non-empty array"));
        }
        if self.messenger.timeout_secs == 0 {
            return Err(anyhow!("messenger.timeout_secs must be > 0"));
        }
        if self.messenger.max_attempts == 0 {
            return Err(anyhow!("messenger.max_attempts must be > 0"));
        }
        if self.messenger.max_in_flight == 0 {
            return Err(anyhow!("messenger.max_in_flight must be > 0"));
        }
        if self.messenger.backoff_base_ms > self.messenger.backoff_max_ms {
            return Err(anyhow!(
                "messenger.backoff_base_ms must be <= messenger.backoff_max_ms"
            ));
        }
        if self.verifier.timeout_secs == 0 {
            return Err(anyhow!("verifier.timeout_secs must be > 0"));
        }
        if self.verifier.shell.is_empty() || self.verifier.shell[0].trim().is_empty() {
            return Err(anyhow!("verifier.shell must be a non-empty array"));
        }
        if self.lifecycle.input_timeout_secs == 0 {
            return Err(anyhow!("lifecycle.input_timeout_secs must be > 0"));
        }
        if self.naming.root_name.trim().is_empty() {
            return Err(anyhow!("naming.root_name must not be empty"));
        }
        self.classifier.build()?;
        Ok(())
    }

    pub fn messenger_timeout(&self) -> Duration {
        Duration::from_secs(self.messenger.timeout_secs)
    }

    pub fn verifier_timeout(&self) -> Duration {
        Duration::from_secs(self.verifier.timeout_secs)
    }

    pub fn input_timeout(&self) -> Duration {
        Duration::from_secs(self.lifecycle.input_timeout_secs)
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `HiveConfig::default()`.
pub fn load_config(path: &Path) -> Result<HiveConfig> {
    if !path.exists() {
        let cfg = HiveConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: HiveConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &HiveConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, HiveConfig::default());
        assert_eq!(cfg.messenger.max_in_flight, 10);
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        let mut cfg = HiveConfig::default();
        cfg.lifecycle.default_token_budget = Some(50_000);
        write_config(&path, &cfg).expect("write");
        let loaded = load_config(&path).expect("load");
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn partial_file_fills_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        fs::write(&path, "[messenger]\nmax_in_flight = 2\n").expect("write");
        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.messenger.max_in_flight, 2);
        assert_eq!(cfg.messenger.max_attempts, 3);
        assert_eq!(cfg.verifier, VerifierConfig::default());
    }

    #[test]
    fn validate_rejects_zero_capacity_and_bad_patterns() {
        let mut cfg = HiveConfig::default();
        cfg.messenger.max_in_flight = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = HiveConfig::default();
        cfg.classifier.done_patterns = vec!["(".to_string()];
        assert!(cfg.validate().is_err());
    }
}
