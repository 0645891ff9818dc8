// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! Runtime configuration shared by the resolver, dispatcher and executors.
//! Constructed once at startup and passed around by reference.

use crate::Error;
use serde::{Deserialize, Serialize};
use std::{path::Path, time::Duration};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Number of data-owning nodes; valid node ids are `0..cluster_size`.
    pub cluster_size: u32,
    /// How long the dispatcher waits for one hop's ack before retrying (ms).
    pub hop_timeout_ms: u64,
    /// How many times a hop message is re-sent after a transport fault.
    pub retry_budget: u32,
    /// First retry delay (ms); doubled on every further retry.
    pub backoff_base_ms: u64,
    /// Ceiling for the retry delay (ms).
    pub backoff_max_ms: u64,
    /// Row-lock table is garbage-collected once per this many acquisitions.
    pub lock_gc_frequency: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            cluster_size: 4,
            hop_timeout_ms: 5_000,
            retry_budget: 5,
            backoff_base_ms: 10,
            backoff_max_ms: 1_000,
            lock_gc_frequency: 128,
        }
    }
}

impl RuntimeConfig {
    pub fn with_cluster_size(cluster_size: u32) -> Self {
        Self {
            cluster_size,
            ..Self::default()
        }
    }

    pub fn from_json_str(json: &str) -> Result<Self, Error> {
        let cfg: RuntimeConfig =
            serde_json::from_str(json).map_err(|e| Error::Config(format!("parse: {}", e)))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn load(path: &Path) -> Result<Self, Error> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("read {}: {}", path.display(), e)))?;
        Self::from_json_str(&text)
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.cluster_size == 0 {
            return Err(Error::Config("cluster_size must be at least 1".into()));
        }
        if self.hop_timeout_ms == 0 {
            return Err(Error::Config("hop_timeout_ms must be positive".into()));
        }
        if self.backoff_base_ms > self.backoff_max_ms {
            return Err(Error::Config(format!(
                "backoff_base_ms {} exceeds backoff_max_ms {}",
                self.backoff_base_ms, self.backoff_max_ms
            )));
        }
        if self.lock_gc_frequency == 0 {
            return Err(Error::Config("lock_gc_frequency must be positive".into()));
        }
        Ok(())
    }

    pub fn hop_timeout(&self) -> Duration {
        Duration::from_millis(self.hop_timeout_ms)
    }

    /// Delay before retry number `attempt` (0-based): exponential, capped.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        let ms = self
            .backoff_base_ms
            .saturating_mul(factor)
            .min(self.backoff_max_ms);
        Duration::from_millis(ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let cfg = RuntimeConfig::default();
        assert_eq!(cfg.cluster_size, 4);
        assert_eq!(cfg.retry_budget, 5);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_config_serialization() {
        let cfg = RuntimeConfig::with_cluster_size(7);
        let json = serde_json::to_string(&cfg).unwrap();
        let decoded = RuntimeConfig::from_json_str(&json).unwrap();
        assert_eq!(decoded, cfg);
    }

    #[test]
    fn missing_fields_take_defaults() {
        let cfg = RuntimeConfig::from_json_str(r#"{"cluster_size": 2}"#).unwrap();
        assert_eq!(cfg.cluster_size, 2);
        assert_eq!(cfg.hop_timeout_ms, RuntimeConfig::default().hop_timeout_ms);
    }

    #[test]
    fn invalid_configs_are_rejected() {
        assert!(matches!(
            RuntimeConfig::from_json_str(r#"{"cluster_size": 0}"#),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            RuntimeConfig::from_json_str(r#"{"backoff_base_ms": 50, "backoff_max_ms": 10}"#),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            RuntimeConfig::from_json_str("not json"),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn backoff_doubles_then_caps() {
        let cfg = RuntimeConfig {
            backoff_base_ms: 10,
            backoff_max_ms: 75,
            ..RuntimeConfig::default()
        };
        assert_eq!(cfg.backoff(0), Duration::from_millis(10));
        assert_eq!(cfg.backoff(1), Duration::from_millis(20));
        assert_eq!(cfg.backoff(2), Duration::from_millis(40));
        assert_eq!(cfg.backoff(3), Duration::from_millis(75));
        assert_eq!(cfg.backoff(80), Duration::from_millis(75));
    }

    #[test]
    fn load_reads_a_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hopchain.json");
        std::fs::write(&path, r#"{"cluster_size": 3, "retry_budget": 1}"#).unwrap();
        let cfg = RuntimeConfig::load(&path).unwrap();
        assert_eq!(cfg.cluster_size, 3);
        assert_eq!(cfg.retry_budget, 1);
    }
}
