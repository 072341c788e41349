//! Run-time configuration of a chain.

use serde::{Deserialize, Serialize};

use cyanea_core::{CyaneaError, Result};

/// Chain length, thinning and the debug switches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ChainConfig {
    /// Number of post-burn-in samples.
    pub chain_length: u64,
    /// Samples discarded before `chain_length` starts counting.
    pub burn_in: u64,
    pub seed: u64,
    /// Log every n-th sample.
    pub log_every: u64,
    /// Checkpoint cadence; `None` disables checkpoints.
    pub store_every: Option<u64>,
    /// Full recomputation cadence; the result must match the cached
    /// posterior within 1e-6.
    pub debug_check_every: Option<u64>,
    /// Capture a state checksum before every proposal and compare it after
    /// rollback. Debug builds only.
    pub checksums: bool,
    /// Target the prior instead of the posterior.
    pub sample_from_prior: bool,
    pub auto_optimize: bool,
    /// Selections before adaptation starts.
    pub optimize_delay: u64,
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            chain_length: 10_000,
            burn_in: 0,
            seed: 1,
            log_every: 1_000,
            store_every: None,
            debug_check_every: None,
            checksums: false,
            sample_from_prior: false,
            auto_optimize: true,
            optimize_delay: 0,
        }
    }
}

impl ChainConfig {
    pub fn from_json(text: &str) -> Result<Self> {
        let config: ChainConfig = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.chain_length == 0 {
            return Err(CyaneaError::config("ChainConfig", "chain_length must be positive"));
        }
        if self.log_every == 0 {
            return Err(CyaneaError::config("ChainConfig", "log_every must be positive"));
        }
        if self.store_every == Some(0) {
            return Err(CyaneaError::config("ChainConfig", "store_every must be positive"));
        }
        if self.debug_check_every == Some(0) {
            return Err(CyaneaError::config(
                "ChainConfig",
                "debug_check_every must be positive",
            ));
        }
        if i64::try_from(self.burn_in).is_err() || i64::try_from(self.chain_length).is_err() {
            return Err(CyaneaError::config("ChainConfig", "chain is too long"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let c = ChainConfig::default();
        assert!(c.validate().is_ok());
        assert!(c.auto_optimize);
        assert_eq!(c.store_every, None);
    }

    #[test]
    fn partial_json_fills_defaults() {
        let c = ChainConfig::from_json(r#"{"chain_length": 500, "seed": 42}"#).unwrap();
        assert_eq!(c.chain_length, 500);
        assert_eq!(c.seed, 42);
        assert_eq!(c.log_every, 1_000);
    }

    #[test]
    fn zero_cadences_rejected() {
        let err = ChainConfig::from_json(r#"{"log_every": 0}"#).unwrap_err();
        assert!(err.to_string().contains("ChainConfig"));
        assert!(ChainConfig::from_json(r#"{"store_every": 0}"#).is_err());
        assert!(ChainConfig::from_json(r#"{"chain_length": 0}"#).is_err());
    }

    #[test]
    fn unknown_fields_rejected() {
        let err = ChainConfig::from_json(r#"{"chainLength": 10}"#).unwrap_err();
        assert!(matches!(err, CyaneaError::Serialization(_)));
    }
}
