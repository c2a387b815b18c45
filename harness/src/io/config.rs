//! Harness configuration stored in `harness.toml`.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::arena::ArenaSettings;
use crate::baseline::RecoveryPolicy;
use crate::core::settle::SettleRule;
use crate::io::coordinator::WaitSettings;

/// Default config file name, resolved against the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "harness.toml";

/// Harness configuration (TOML).
///
/// Every field has a default so a partial file (or no file) is valid.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct HarnessConfig {
    pub run: RunConfig,
    pub timeouts: TimeoutConfig,
    pub recovery: RecoveryConfig,
    pub protocol: ProtocolConfig,
    pub arena: ArenaSettings,
    pub artifacts: ArtifactConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RunConfig {
    /// Action budget per generated run.
    pub steps: u32,
    /// Number of generated runs.
    pub runs: u32,
    /// Base seed; run `i` uses `seed + i`. Random when unset.
    pub seed: Option<u64>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            steps: 8,
            runs: 20,
            seed: None,
        }
    }
}

/// Wait budgets in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TimeoutConfig {
    pub ready: u64,
    pub poll_interval: u64,
    pub state_update: u64,
    pub visual_stable: u64,
    pub session_change: u64,
    pub first_ready: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            ready: 60_000,
            poll_interval: 1_000,
            state_update: 5_000,
            visual_stable: 10_000,
            session_change: 60_000,
            first_ready: 60_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RecoveryConfig {
    /// Baseline attempts before giving up. Delays double after each failure.
    pub attempts: u32,
    pub initial_delay_ms: u64,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            attempts: 3,
            initial_delay_ms: 500,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ProtocolConfig {
    pub stability_timeout_marker: String,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            stability_timeout_marker: "timed out".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ArtifactConfig {
    pub dir: String,
}

impl Default for ArtifactConfig {
    fn default() -> Self {
        Self {
            dir: "target/harness".to_string(),
        }
    }
}

impl HarnessConfig {
    pub fn validate(&self) -> Result<()> {
        if self.run.steps == 0 {
            return Err(anyhow!("run.steps must be > 0"));
        }
        if self.run.runs == 0 {
            return Err(anyhow!("run.runs must be > 0"));
        }
        let t = &self.timeouts;
        for (name, value) in [
            ("ready", t.ready),
            ("poll_interval", t.poll_interval),
            ("state_update", t.state_update),
            ("visual_stable", t.visual_stable),
            ("session_change", t.session_change),
            ("first_ready", t.first_ready),
        ] {
            if value == 0 {
                return Err(anyhow!("timeouts.{name} must be > 0"));
            }
        }
        if t.poll_interval > t.ready {
            return Err(anyhow!("timeouts.poll_interval must not exceed timeouts.ready"));
        }
        if self.recovery.attempts == 0 {
            return Err(anyhow!("recovery.attempts must be > 0"));
        }
        if self.artifacts.dir.trim().is_empty() {
            return Err(anyhow!("artifacts.dir must be non-empty"));
        }
        validate_arena(&self.arena)
    }

    pub fn wait_settings(&self) -> WaitSettings {
        let t = &self.timeouts;
        WaitSettings {
            ready: Duration::from_millis(t.ready),
            poll_interval: Duration::from_millis(t.poll_interval),
            state_update: Duration::from_millis(t.state_update),
            visual_stable: Duration::from_millis(t.visual_stable),
            session_change: Duration::from_millis(t.session_change),
            first_ready: Duration::from_millis(t.first_ready),
            stability_marker: self.protocol.stability_timeout_marker.clone(),
        }
    }

    pub fn recovery_policy(&self) -> RecoveryPolicy {
        RecoveryPolicy {
            attempts: self.recovery.attempts,
            initial_delay: Duration::from_millis(self.recovery.initial_delay_ms),
        }
    }
}

fn validate_arena(arena: &ArenaSettings) -> Result<()> {
    if arena.characters.is_empty() || arena.characters.iter().any(|c| c.trim().is_empty()) {
        return Err(anyhow!("arena.characters must be a non-empty list of names"));
    }
    if arena.characters.iter().any(|c| c.contains(char::is_whitespace)) {
        return Err(anyhow!("arena.characters entries must not contain whitespace"));
    }
    if arena.encounters.is_empty() || arena.encounters.iter().any(|e| e.trim().is_empty()) {
        return Err(anyhow!("arena.encounters must be a non-empty list of names"));
    }
    if arena.max_hand_size == 0 {
        return Err(anyhow!("arena.max_hand_size must be > 0"));
    }
    if arena.reward_screen.trim().is_empty() || arena.defeat_screen.trim().is_empty() {
        return Err(anyhow!("arena.reward_screen and arena.defeat_screen must be non-empty"));
    }
    if !arena
        .after_outcome
        .iter()
        .any(|rule| matches!(rule, SettleRule::Baseline))
    {
        return Err(anyhow!("arena.after_outcome must contain a baseline rule"));
    }
    for rule in &arena.after_outcome {
        if let SettleRule::Dismiss { screen, command } = rule
            && (screen.trim().is_empty() || command.trim().is_empty())
        {
            return Err(anyhow!("arena.after_outcome dismiss rules need a screen and a command"));
        }
    }
    Ok(())
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `HarnessConfig::default()`.
pub fn load_config(path: &Path) -> Result<HarnessConfig> {
    if !path.exists() {
        let cfg = HarnessConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: HarnessConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &HarnessConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

pub(crate) fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let mut tmp_name = path.file_name().unwrap_or_default().to_os_string();
    tmp_name.push(".tmp");
    let tmp_path = path.with_file_name(tmp_name);
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp file {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::protocol::DelegatedCondition;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, HarnessConfig::default());
        assert_eq!(cfg.wait_settings(), WaitSettings::default());
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("nested").join("harness.toml");
        let mut cfg = HarnessConfig::default();
        cfg.run.seed = Some(42);
        cfg.arena.after_outcome = vec![
            SettleRule::Baseline,
            SettleRule::Delegate {
                condition: DelegatedCondition::InGame(false),
            },
        ];
        write_config(&path, &cfg).expect("write");
        let loaded = load_config(&path).expect("load");
        assert_eq!(loaded, cfg);
        assert!(!temp.path().join("nested").join("harness.toml.tmp").exists());
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("harness.toml");
        fs::write(
            &path,
            "[run]\nsteps = 3\n\n[timeouts]\npoll_interval = 50\n\n[arena]\ncharacters = [\"WATCHER\"]\n",
        )
        .expect("write");
        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.run.steps, 3);
        assert_eq!(cfg.run.runs, 20);
        assert_eq!(cfg.arena.characters, vec!["WATCHER".to_string()]);
        assert_eq!(cfg.arena.max_hand_size, 10);
        assert_eq!(cfg.arena.forbidden_monsters, vec!["Apology Slime".to_string()]);
        assert_eq!(cfg.wait_settings().poll_interval, Duration::from_millis(50));
        assert_eq!(cfg.recovery_policy().initial_delay, Duration::from_millis(500));
    }

    #[test]
    fn validation_rejects_bad_values() {
        let mut cfg = HarnessConfig::default();
        cfg.timeouts.ready = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = HarnessConfig::default();
        cfg.arena.after_outcome = vec![SettleRule::Delegate {
            condition: DelegatedCondition::MainMenu,
        }];
        let err = cfg.validate().expect_err("no baseline rule");
        assert!(err.to_string().contains("baseline"), "{err}");

        let mut cfg = HarnessConfig::default();
        cfg.arena.characters = vec!["THE SILENT".to_string()];
        assert!(cfg.validate().is_err());

        let mut cfg = HarnessConfig::default();
        cfg.arena.defeat_screen = " ".to_string();
        let err = cfg.validate().expect_err("blank defeat screen");
        assert!(err.to_string().contains("defeat_screen"), "{err}");
    }
}
