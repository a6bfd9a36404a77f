//! Engine configuration.
//!
//! Only options that affect core behaviour live here. Unknown keys fail
//! closed with a configuration error; environment overrides (the inference
//! mode variable) are resolved in a dedicated pass before validation, never
//! re-read per call.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};
use crate::ids::{self, HashAlgo};
use crate::processing::UnitOptions;
use crate::retry::RetryPolicy;
use crate::template::DEFAULT_JOIN_MAX_CHARS;

/// Executor options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ExecutorConfig {
    /// Concurrent unit-step invocations.
    pub concurrency: usize,
    /// Convert per-unit failures into records instead of halting.
    pub continue_on_error: bool,
    /// Optional wall-clock deadline for the whole run, in seconds.
    pub run_deadline_s: Option<u64>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            continue_on_error: true,
            run_deadline_s: None,
        }
    }
}

/// Retry options, in seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct RetryConfig {
    /// Delay before the first retry.
    pub initial_delay_s: f64,
    /// Multiplier applied per retry.
    pub multiplier: f64,
    /// Jitter fraction in `[0, 1)`.
    pub jitter: f64,
    /// Absolute cap on a single sleep.
    pub cap_s: f64,
    /// Hard wall-clock deadline for the whole call.
    pub max_elapsed_s: f64,
    /// Maximum attempts including the first.
    pub max_attempts: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_delay_s: 0.2,
            multiplier: 2.0,
            jitter: 0.25,
            cap_s: 5.0,
            max_elapsed_s: 30.0,
            max_attempts: 5,
        }
    }
}

impl RetryConfig {
    /// Convert to the runtime policy, validating ranges.
    pub fn to_policy(&self) -> Result<RetryPolicy> {
        if !(0.0..1.0).contains(&self.jitter) {
            return Err(EngineError::Config(format!(
                "retry jitter must be in [0, 1), got {}",
                self.jitter
            )));
        }
        if self.multiplier < 1.0 {
            return Err(EngineError::Config(format!(
                "retry multiplier must be >= 1, got {}",
                self.multiplier
            )));
        }
        Ok(RetryPolicy {
            initial_delay: Duration::from_secs_f64(self.initial_delay_s.max(0.0)),
            multiplier: self.multiplier,
            jitter: self.jitter,
            cap: Duration::from_secs_f64(self.cap_s.max(0.0)),
            max_elapsed: Duration::from_secs_f64(self.max_elapsed_s.max(0.0)),
            max_attempts: self.max_attempts.max(1),
        })
    }
}

/// Interpolation payload caps.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct InterpolationConfig {
    /// Cap on `join(all.*)` payloads, in characters.
    pub all_join_max_chars: usize,
}

impl Default for InterpolationConfig {
    fn default() -> Self {
        Self {
            all_join_max_chars: DEFAULT_JOIN_MAX_CHARS,
        }
    }
}

/// Top-level engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields, default)]
pub struct EngineConfig {
    /// Root directory for run artefacts.
    pub artefacts_dir: Option<PathBuf>,
    /// Content-hash algorithm name (`blake2b` or `xxh64`).
    pub hash_algo: Option<String>,
    /// Executor options.
    pub executor: ExecutorConfig,
    /// Retry options.
    pub retry: RetryConfig,
    /// Unit iterator options.
    pub processing: UnitOptions,
    /// Interpolation caps.
    pub interpolation: InterpolationConfig,
}

impl EngineConfig {
    /// Parse from YAML, failing closed on unknown keys.
    pub fn from_yaml(text: &str) -> Result<Self> {
        serde_yaml::from_str(text).map_err(|e| EngineError::Config(e.to_string()))
    }

    /// The effective artefacts directory.
    pub fn artefacts_dir(&self) -> PathBuf {
        self.artefacts_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from("artefacts"))
    }

    /// Parse the configured hash algorithm.
    pub fn hash_algo(&self) -> Result<HashAlgo> {
        match &self.hash_algo {
            Some(name) => HashAlgo::parse(name),
            None => Ok(HashAlgo::default()),
        }
    }

    /// Stable hash of the effective configuration, for the run record.
    pub fn config_hash(&self) -> String {
        let canonical = serde_json::to_string(self).unwrap_or_default();
        ids::hash_bytes(canonical.as_bytes(), "config")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.executor.concurrency, 4);
        assert!(config.executor.continue_on_error);
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.artefacts_dir(), PathBuf::from("artefacts"));
        assert_eq!(config.hash_algo().unwrap(), HashAlgo::Blake2b);
    }

    #[test]
    fn test_yaml_roundtrip() {
        let config = EngineConfig::from_yaml(
            "executor:\n  concurrency: 8\nretry:\n  max_elapsed_s: 10.0\n",
        )
        .unwrap();
        assert_eq!(config.executor.concurrency, 8);
        assert_eq!(config.retry.max_elapsed_s, 10.0);
    }

    #[test]
    fn test_unknown_key_fails_closed() {
        let err = EngineConfig::from_yaml("turbo_mode: true\n").unwrap_err();
        assert!(matches!(err, EngineError::Config(_)));
    }

    #[test]
    fn test_unknown_nested_key_fails_closed() {
        let err = EngineConfig::from_yaml("executor:\n  workers: 3\n").unwrap_err();
        assert!(matches!(err, EngineError::Config(_)));
    }

    #[test]
    fn test_bad_jitter_rejected() {
        let config = EngineConfig::from_yaml("retry:\n  jitter: 1.5\n").unwrap();
        assert!(config.retry.to_policy().is_err());
    }

    #[test]
    fn test_unknown_hash_algo_rejected() {
        let config = EngineConfig::from_yaml("hash_algo: md5\n").unwrap();
        assert!(matches!(
            config.hash_algo().unwrap_err(),
            EngineError::Config(_)
        ));
    }

    #[test]
    fn test_config_hash_stable() {
        let a = EngineConfig::default();
        let b = EngineConfig::default();
        assert_eq!(a.config_hash(), b.config_hash());
    }
}
