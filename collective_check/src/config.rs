/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Configuration for the harness.
//!
//! A [`HarnessConfig`] is a layer of optional settings. Layers come from the
//! built-in defaults, a YAML file, `COLLECTIVE_CHECK_*` environment variables
//! and the command line, and are combined with [`HarnessConfig::merge`].
//! Getters fall back to the default for any key no layer has set.

use std::env;
use std::fmt;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use collectives::DataType;
use collectives::ReduceOp;
use serde::Deserialize;
use serde::Serialize;

use crate::HarnessError;

pub const DEFAULT_WORLD_SIZE: usize = 2;
pub const DEFAULT_DEVICE_COUNT: usize = 8;
pub const DEFAULT_ELEMENT_COUNT: usize = 1024;
pub const DEFAULT_ROUNDS: usize = 1;
pub const DEFAULT_TOLERANCE: f64 = 1e-5;
pub const DEFAULT_BROADCAST_ROOT: usize = 0;
pub const DEFAULT_BROADCAST_VALUE: f64 = 42.0;
pub const DEFAULT_BROADCAST_COUNT: usize = 1;
pub const DEFAULT_INIT_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_REPORT_PREVIEW: usize = 5;

/// Element type of the buffers the harness exchanges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ElementType {
    Float32,
    Float64,
}

impl ElementType {
    pub fn data_type(self) -> DataType {
        match self {
            ElementType::Float32 => DataType::Float32,
            ElementType::Float64 => DataType::Float64,
        }
    }
}

impl fmt::Display for ElementType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.data_type().fmt(f)
    }
}

impl FromStr for ElementType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "float32" | "f32" => Ok(ElementType::Float32),
            "float64" | "f64" => Ok(ElementType::Float64),
            other => Err(format!("unknown element type {other:?}")),
        }
    }
}

/// What a recorded verification mismatch means for the exit status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum MismatchPolicy {
    /// Log mismatches; they do not affect the exit status.
    #[default]
    Report,
    /// Exit non-zero if any participant recorded a mismatch.
    Fail,
}

impl FromStr for MismatchPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "report" => Ok(MismatchPolicy::Report),
            "fail" => Ok(MismatchPolicy::Fail),
            other => Err(format!("unknown mismatch policy {other:?}")),
        }
    }
}

/// One layer of harness settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HarnessConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub world_size: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_count: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub element_count: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rounds: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub element_type: Option<ElementType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reduce_op: Option<ReduceOp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tolerance: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub broadcast_root: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub broadcast_value: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub broadcast_count: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mismatch_policy: Option<MismatchPolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub init_timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub report_preview: Option<usize>,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            world_size: Some(DEFAULT_WORLD_SIZE),
            device_count: Some(DEFAULT_DEVICE_COUNT),
            element_count: Some(DEFAULT_ELEMENT_COUNT),
            rounds: Some(DEFAULT_ROUNDS),
            element_type: Some(ElementType::Float32),
            reduce_op: Some(ReduceOp::Sum),
            tolerance: Some(DEFAULT_TOLERANCE),
            broadcast_root: Some(DEFAULT_BROADCAST_ROOT),
            broadcast_value: Some(DEFAULT_BROADCAST_VALUE),
            broadcast_count: Some(DEFAULT_BROADCAST_COUNT),
            mismatch_policy: Some(MismatchPolicy::Report),
            init_timeout_ms: Some(DEFAULT_INIT_TIMEOUT.as_millis() as u64),
            report_preview: Some(DEFAULT_REPORT_PREVIEW),
        }
    }
}

/// Parse `COLLECTIVE_CHECK_<name>`, warning about values that do not parse.
fn env_value<T: FromStr>(name: &str) -> Option<T> {
    let key = format!("COLLECTIVE_CHECK_{name}");
    let value = env::var(&key).ok()?;
    match value.parse() {
        Ok(parsed) => Some(parsed),
        Err(_) => {
            tracing::warn!("ignoring {}={:?}: not a valid value", key, value);
            None
        }
    }
}

impl HarnessConfig {
    /// Create a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// A layer with no keys set.
    pub fn empty() -> Self {
        Self {
            world_size: None,
            device_count: None,
            element_count: None,
            rounds: None,
            element_type: None,
            reduce_op: None,
            tolerance: None,
            broadcast_root: None,
            broadcast_value: None,
            broadcast_count: None,
            mismatch_policy: None,
            init_timeout_ms: None,
            report_preview: None,
        }
    }

    /// Load the keys set through `COLLECTIVE_CHECK_*` environment variables.
    pub fn from_env() -> Self {
        Self {
            world_size: env_value("WORLD_SIZE"),
            device_count: env_value("DEVICE_COUNT"),
            element_count: env_value("ELEMENT_COUNT"),
            rounds: env_value("ROUNDS"),
            element_type: env_value("ELEMENT_TYPE"),
            reduce_op: env_value("REDUCE_OP"),
            tolerance: env_value("TOLERANCE"),
            broadcast_root: env_value("BROADCAST_ROOT"),
            broadcast_value: env_value("BROADCAST_VALUE"),
            broadcast_count: env_value("BROADCAST_COUNT"),
            mismatch_policy: env_value("MISMATCH_POLICY"),
            init_timeout_ms: env_value("INIT_TIMEOUT_MS"),
            report_preview: env_value("REPORT_PREVIEW"),
        }
    }

    /// Load configuration from a YAML file. Keys the file omits stay unset.
    pub fn from_yaml<P: AsRef<Path>>(path: P) -> Result<Self, anyhow::Error> {
        let mut file = File::open(path)?;
        let mut contents = String::new();
        file.read_to_string(&mut contents)?;

        let config: HarnessConfig = serde_yaml::from_str(&contents)?;
        Ok(config)
    }

    /// Merge with another configuration, with the other taking precedence.
    pub fn merge(&mut self, other: &Self) {
        fn take<T: Clone>(mine: &mut Option<T>, theirs: &Option<T>) {
            if let Some(value) = theirs {
                *mine = Some(value.clone());
            }
        }
        take(&mut self.world_size, &other.world_size);
        take(&mut self.device_count, &other.device_count);
        take(&mut self.element_count, &other.element_count);
        take(&mut self.rounds, &other.rounds);
        take(&mut self.element_type, &other.element_type);
        take(&mut self.reduce_op, &other.reduce_op);
        take(&mut self.tolerance, &other.tolerance);
        take(&mut self.broadcast_root, &other.broadcast_root);
        take(&mut self.broadcast_value, &other.broadcast_value);
        take(&mut self.broadcast_count, &other.broadcast_count);
        take(&mut self.mismatch_policy, &other.mismatch_policy);
        take(&mut self.init_timeout_ms, &other.init_timeout_ms);
        take(&mut self.report_preview, &other.report_preview);
    }

    /// Save configuration to a YAML file.
    pub fn to_yaml<P: AsRef<Path>>(&self, path: P) -> Result<(), anyhow::Error> {
        let yaml = serde_yaml::to_string(self)?;
        std::fs::write(path, yaml)?;
        Ok(())
    }

    /// Check that the settings describe a runnable configuration.
    pub fn validate(&self) -> Result<(), HarnessError> {
        let invalid = |message: String| Err(HarnessError::InvalidConfig(message));
        if self.world_size() == 0 {
            return invalid("world size must be at least 1".to_string());
        }
        if self.broadcast_root() >= self.world_size() {
            return invalid(format!(
                "broadcast root {} is outside of a world of size {}",
                self.broadcast_root(),
                self.world_size()
            ));
        }
        let element_size = self.element_type().data_type().size();
        let gathered = self
            .element_count()
            .checked_mul(self.world_size())
            .and_then(|count| count.checked_mul(element_size));
        if gathered.is_none() {
            return invalid(format!(
                "element count {} is too large for a world of size {}",
                self.element_count(),
                self.world_size()
            ));
        }
        if self.broadcast_count().checked_mul(element_size).is_none() {
            return invalid(format!(
                "broadcast count {} is too large",
                self.broadcast_count()
            ));
        }
        if !self.tolerance().is_finite() || self.tolerance() < 0.0 {
            return invalid(format!(
                "tolerance must be a non-negative number, got {}",
                self.tolerance()
            ));
        }
        Ok(())
    }

    pub fn world_size(&self) -> usize {
        self.world_size.unwrap_or(DEFAULT_WORLD_SIZE)
    }

    pub fn device_count(&self) -> usize {
        self.device_count.unwrap_or(DEFAULT_DEVICE_COUNT)
    }

    /// Elements per participant for all-reduce and all-gather.
    pub fn element_count(&self) -> usize {
        self.element_count.unwrap_or(DEFAULT_ELEMENT_COUNT)
    }

    pub fn rounds(&self) -> usize {
        self.rounds.unwrap_or(DEFAULT_ROUNDS)
    }

    pub fn element_type(&self) -> ElementType {
        self.element_type.unwrap_or(ElementType::Float32)
    }

    pub fn reduce_op(&self) -> ReduceOp {
        self.reduce_op.unwrap_or(ReduceOp::Sum)
    }

    /// Largest accepted absolute difference for all-reduce results.
    pub fn tolerance(&self) -> f64 {
        self.tolerance.unwrap_or(DEFAULT_TOLERANCE)
    }

    pub fn broadcast_root(&self) -> usize {
        self.broadcast_root.unwrap_or(DEFAULT_BROADCAST_ROOT)
    }

    pub fn broadcast_value(&self) -> f64 {
        self.broadcast_value.unwrap_or(DEFAULT_BROADCAST_VALUE)
    }

    pub fn broadcast_count(&self) -> usize {
        self.broadcast_count.unwrap_or(DEFAULT_BROADCAST_COUNT)
    }

    pub fn mismatch_policy(&self) -> MismatchPolicy {
        self.mismatch_policy.unwrap_or_default()
    }

    /// How long communicator creation waits for the whole group.
    pub fn init_timeout(&self) -> Duration {
        self.init_timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_INIT_TIMEOUT)
    }

    /// Number of all-reduce elements rank 0 prints.
    pub fn report_preview(&self) -> usize {
        self.report_preview.unwrap_or(DEFAULT_REPORT_PREVIEW)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = HarnessConfig::default();
        assert_eq!(config.element_count(), 1024);
        assert_eq!(config.tolerance(), 1e-5);
        assert_eq!(config.broadcast_value(), 42.0);
        assert_eq!(config.broadcast_count(), 1);
        assert_eq!(config.init_timeout(), Duration::from_secs(60));
        assert_eq!(config.mismatch_policy(), MismatchPolicy::Report);
        assert_eq!(config.reduce_op(), ReduceOp::Sum);
        assert_eq!(config.element_type().data_type(), DataType::Float32);

        // An empty layer answers with the same defaults.
        let empty = HarnessConfig::empty();
        assert_eq!(empty.world_size(), config.world_size());
        assert_eq!(empty.report_preview(), config.report_preview());
    }

    #[test]
    fn merge_prefers_other() {
        let mut config = HarnessConfig::default();
        let mut overrides = HarnessConfig::empty();
        overrides.world_size = Some(4);
        overrides.mismatch_policy = Some(MismatchPolicy::Fail);
        config.merge(&overrides);
        assert_eq!(config.world_size(), 4);
        assert_eq!(config.mismatch_policy(), MismatchPolicy::Fail);
        // Keys the other layer leaves unset are kept.
        assert_eq!(config.element_count(), DEFAULT_ELEMENT_COUNT);
    }

    #[test]
    fn yaml_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("harness.yaml");
        let mut config = HarnessConfig::empty();
        config.world_size = Some(3);
        config.element_type = Some(ElementType::Float64);
        config.reduce_op = Some(ReduceOp::Max);
        config.to_yaml(&path).unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains("world_size: 3"));
        assert!(contents.contains("element_type: float64"));
        assert!(!contents.contains("rounds"));

        let loaded = HarnessConfig::from_yaml(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn yaml_rejects_unknown_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("harness.yaml");
        std::fs::write(&path, "world_sise: 3\n").unwrap();
        assert!(HarnessConfig::from_yaml(&path).is_err());
    }

    #[test]
    fn from_env() {
        // No other test in this crate reads these variables.
        env::set_var("COLLECTIVE_CHECK_ROUNDS", "3");
        env::set_var("COLLECTIVE_CHECK_MISMATCH_POLICY", "fail");
        env::set_var("COLLECTIVE_CHECK_REDUCE_OP", "avg");
        env::set_var("COLLECTIVE_CHECK_BROADCAST_COUNT", "lots");
        let config = HarnessConfig::from_env();
        env::remove_var("COLLECTIVE_CHECK_ROUNDS");
        env::remove_var("COLLECTIVE_CHECK_MISMATCH_POLICY");
        env::remove_var("COLLECTIVE_CHECK_REDUCE_OP");
        env::remove_var("COLLECTIVE_CHECK_BROADCAST_COUNT");
        assert_eq!(config.rounds, Some(3));
        assert_eq!(config.mismatch_policy, Some(MismatchPolicy::Fail));
        assert_eq!(config.reduce_op, Some(ReduceOp::Avg));
        assert_eq!(config.broadcast_count, None);
        assert_eq!(config.world_size, None);
    }

    #[test]
    fn validate() {
        assert!(HarnessConfig::default().validate().is_ok());

        let mut config = HarnessConfig::default();
        config.world_size = Some(0);
        assert!(matches!(
            config.validate(),
            Err(HarnessError::InvalidConfig(_))
        ));

        let mut config = HarnessConfig::default();
        config.world_size = Some(2);
        config.broadcast_root = Some(2);
        assert!(config.validate().is_err());

        let mut config = HarnessConfig::default();
        config.tolerance = Some(f64::NAN);
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_overflowing_counts() {
        let mut config = HarnessConfig::default();
        config.world_size = Some(4);
        config.element_count = Some(usize::MAX / 8);
        assert!(matches!(
            config.validate(),
            Err(HarnessError::InvalidConfig(message)) if message.contains("too large")
        ));

        let mut config = HarnessConfig::default();
        config.element_type = Some(ElementType::Float64);
        config.broadcast_count = Some(usize::MAX / 4);
        assert!(matches!(
            config.validate(),
            Err(HarnessError::InvalidConfig(message)) if message.contains("broadcast count")
        ));
    }
}
