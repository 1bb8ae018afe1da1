// Consensus configuration
//
// Passed explicitly at construction; nothing here is process-global.

use crate::roster::{CommitteePolicy, RosterError};
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Base timeout must be non-zero")]
    ZeroTimeout,
    #[error("Max timeout {max_ms}ms is below base timeout {base_ms}ms")]
    TimeoutOrder { base_ms: u64, max_ms: u64 },
    #[error("Vote window must be non-zero")]
    ZeroVoteWindow,
    #[error(transparent)]
    Committee(#[from] RosterError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsensusConfig {
    /// Shard whose committee this node serves in
    pub shard_id: u32,

    /// Round timeout before the first view change (ms)
    pub base_timeout_ms: u64,

    /// Backoff cap (ms)
    pub max_timeout_ms: u64,

    /// Quorum rule and leader selection
    pub committee: CommitteePolicy,

    /// Consecutive view changes without a commit before raising the liveness alarm
    pub liveness_alarm_threshold: u32,

    /// How many views ahead of the current one votes are still tallied
    pub vote_window: u64,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            shard_id: 0,
            base_timeout_ms: 2_000,
            max_timeout_ms: 60_000,
            committee: CommitteePolicy::default(),
            liveness_alarm_threshold: 5,
            vote_window: 16,
        }
    }
}

impl ConsensusConfig {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Read and validate a JSON config file
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("reading consensus config {}", path.display()))?;
        Self::from_json(&json).with_context(|| format!("parsing consensus config {}", path.display()))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.base_timeout_ms == 0 {
            return Err(ConfigError::ZeroTimeout);
        }
        if self.max_timeout_ms < self.base_timeout_ms {
            return Err(ConfigError::TimeoutOrder {
                base_ms: self.base_timeout_ms,
                max_ms: self.max_timeout_ms,
            });
        }
        if self.vote_window == 0 {
            return Err(ConfigError::ZeroVoteWindow);
        }
        self.committee.quorum.validate()?;
        Ok(())
    }

    pub fn base_timeout(&self) -> Duration {
        Duration::from_millis(self.base_timeout_ms)
    }

    pub fn max_timeout(&self) -> Duration {
        Duration::from_millis(self.max_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::roster::LeaderPolicy;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = ConsensusConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.base_timeout(), Duration::from_secs(2));
        assert_eq!(config.max_timeout(), Duration::from_secs(60));
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config = ConsensusConfig::from_json(
            r#"{
                "shard_id": 3,
                "base_timeout_ms": 500,
                "committee": { "leader": { "kind": "round_robin", "offset": 1 } }
            }"#,
        )
        .unwrap();

        assert_eq!(config.shard_id, 3);
        assert_eq!(config.base_timeout(), Duration::from_millis(500));
        assert_eq!(config.committee.leader, LeaderPolicy::RoundRobin { offset: 1 });
        assert_eq!(config.committee.quorum.numerator, 2);
        assert_eq!(config.vote_window, 16);
    }

    #[test]
    fn test_rejects_invalid_values() {
        assert!(matches!(
            ConsensusConfig::from_json(r#"{"base_timeout_ms": 0}"#),
            Err(ConfigError::ZeroTimeout)
        ));
        assert!(matches!(
            ConsensusConfig::from_json(r#"{"base_timeout_ms": 5000, "max_timeout_ms": 100}"#),
            Err(ConfigError::TimeoutOrder { .. })
        ));
        assert!(matches!(
            ConsensusConfig::from_json(r#"{"committee": {"quorum": {"numerator": 0, "denominator": 3}}}"#),
            Err(ConfigError::Committee(_))
        ));
        assert!(matches!(
            ConsensusConfig::from_json(r#"{"committee": {"quorum": {"numerator": 1, "denominator": 2}}}"#),
            Err(ConfigError::Committee(_))
        ));
        assert!(matches!(
            ConsensusConfig::from_json("not json"),
            Err(ConfigError::Json(_))
        ));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"shard_id": 7, "liveness_alarm_threshold": 2}}"#).unwrap();

        let config = ConsensusConfig::load(file.path()).unwrap();
        assert_eq!(config.shard_id, 7);
        assert_eq!(config.liveness_alarm_threshold, 2);

        let missing = ConsensusConfig::load("/nonexistent/fbft.json").unwrap_err();
        assert!(missing.to_string().contains("reading consensus config"));
    }
}
