//! Configuration for the total-order layer

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::error;

use crate::error::{Result, TotalError};

/// Total-order layer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TotalConfig {
    /// Average retransmission intervals for broadcast requests
    pub retransmit_intervals: Vec<Duration>,

    /// Average retransmission intervals for multicast requests
    pub mcast_retransmit_intervals: Vec<Duration>,

    /// How long a delivery gap is waited on before it is skipped
    pub op_timeout: Duration,

    /// Period of the gap sweeper
    pub gap_check_interval: Duration,

    /// Bound on acquiring the state lock for a transition
    pub lock_timeout: Duration,

    /// Subgroup this member joins
    pub subgroup: Option<String>,
}

impl Default for TotalConfig {
    fn default() -> Self {
        Self {
            retransmit_intervals: millis(&[55_000, 65_000, 70_000, 75_000]),
            mcast_retransmit_intervals: millis(&[60_000, 65_000, 70_000, 75_000]),
            op_timeout: Duration::from_millis(60_000),
            gap_check_interval: Duration::from_secs(1),
            lock_timeout: Duration::from_secs(30),
            subgroup: None,
        }
    }
}

impl TotalConfig {
    /// Build a configuration from the legacy property names
    ///
    /// Recognized keys are `timeout`, `mcast_timeout` (comma-delimited
    /// milliseconds), `op_timeout`, `gap_check_interval` (milliseconds) and
    /// `subgroup`. Anything else is logged and ignored.
    pub fn from_properties(properties: &HashMap<String, String>) -> Result<Self> {
        let mut config = Self::default();

        for (key, value) in properties {
            match key.as_str() {
                "timeout" => config.retransmit_intervals = parse_intervals(key, value)?,
                "mcast_timeout" => config.mcast_retransmit_intervals = parse_intervals(key, value)?,
                "op_timeout" => config.op_timeout = parse_millis(key, value)?,
                "gap_check_interval" => config.gap_check_interval = parse_millis(key, value)?,
                "subgroup" => {
                    let name = value.trim();
                    config.subgroup = (!name.is_empty()).then(|| name.to_string());
                }
                _ => error!("TotalConfig: unrecognized property {key}={value}"),
            }
        }

        config.validate()?;
        Ok(config)
    }

    /// Check the configuration for values the layer cannot run with
    pub fn validate(&self) -> Result<()> {
        check_intervals("retransmit_intervals", &self.retransmit_intervals)?;
        check_intervals("mcast_retransmit_intervals", &self.mcast_retransmit_intervals)?;

        if self.gap_check_interval.is_zero() {
            return Err(TotalError::Config(
                "gap_check_interval must be greater than zero".to_string(),
            ));
        }

        Ok(())
    }
}

fn millis(values: &[u64]) -> Vec<Duration> {
    values.iter().copied().map(Duration::from_millis).collect()
}

fn parse_millis(key: &str, value: &str) -> Result<Duration> {
    value
        .trim()
        .parse::<u64>()
        .map(Duration::from_millis)
        .map_err(|e| TotalError::Config(format!("{key}: invalid milliseconds '{value}': {e}")))
}

fn parse_intervals(key: &str, value: &str) -> Result<Vec<Duration>> {
    value
        .split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| parse_millis(key, part))
        .collect()
}

fn check_intervals(name: &str, intervals: &[Duration]) -> Result<()> {
    if intervals.is_empty() {
        return Err(TotalError::Config(format!("{name} must not be empty")));
    }
    if intervals.iter().any(Duration::is_zero) {
        return Err(TotalError::Config(format!("{name} must not contain zero")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn props(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_defaults() {
        let config = TotalConfig::default();
        assert_eq!(config.retransmit_intervals[0], Duration::from_secs(55));
        assert_eq!(config.mcast_retransmit_intervals[0], Duration::from_secs(60));
        assert_eq!(config.op_timeout, Duration::from_secs(60));
        assert!(config.subgroup.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_properties() {
        let config = TotalConfig::from_properties(&props(&[
            ("timeout", "100, 200,300"),
            ("mcast_timeout", "400"),
            ("op_timeout", "5000"),
            ("gap_check_interval", "250"),
            ("subgroup", "replicas"),
        ]))
        .unwrap();

        assert_eq!(config.retransmit_intervals, millis(&[100, 200, 300]));
        assert_eq!(config.mcast_retransmit_intervals, millis(&[400]));
        assert_eq!(config.op_timeout, Duration::from_millis(5000));
        assert_eq!(config.gap_check_interval, Duration::from_millis(250));
        assert_eq!(config.subgroup.as_deref(), Some("replicas"));
    }

    #[test]
    fn test_unknown_property_is_ignored() {
        let config = TotalConfig::from_properties(&props(&[("window_size", "10")])).unwrap();
        assert_eq!(config.op_timeout, Duration::from_secs(60));
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let err = TotalConfig::from_properties(&props(&[("op_timeout", "soon")])).unwrap_err();
        assert!(matches!(err, TotalError::Config(_)));

        let err = TotalConfig::from_properties(&props(&[("timeout", "")])).unwrap_err();
        assert!(err.to_string().contains("must not be empty"));

        let err = TotalConfig::from_properties(&props(&[("mcast_timeout", "10,0")])).unwrap_err();
        assert!(err.to_string().contains("zero"));

        let config = TotalConfig {
            gap_check_interval: Duration::ZERO,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_serde_roundtrip() {
        let config = TotalConfig {
            subgroup: Some("east".to_string()),
            ..Default::default()
        };
        let json = serde_json::to_string(&config).unwrap();
        let back: TotalConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.subgroup, config.subgroup);
        assert_eq!(back.retransmit_intervals, config.retransmit_intervals);
    }
}
