use crate::error::{ApgError, Result};

use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

/// How the latent blocks are grouped within one sweep
#[derive(ValueEnum, Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum BlockStrategy {
    /// update one block at a time and resample after each block
    #[default]
    Small,
    /// propose all blocks jointly and resample once per sweep
    Large,
}

/// Policy for drawing ancestor indices from importance weights
#[derive(ValueEnum, Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ResamplingStrategy {
    /// independent categorical draws
    Multinomial,
    /// one uniform offset shared by `S` evenly spaced positions
    #[default]
    Systematic,
    /// one uniform draw inside each of `S` equal strata
    Stratified,
}

impl FromStr for BlockStrategy {
    type Err = ApgError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "small" => Ok(Self::Small),
            "large" => Ok(Self::Large),
            other => Err(ApgError::config(format!(
                "unknown block strategy `{}` (expected `small` or `large`)",
                other
            ))),
        }
    }
}

impl fmt::Display for BlockStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Small => write!(f, "small"),
            Self::Large => write!(f, "large"),
        }
    }
}

impl FromStr for ResamplingStrategy {
    type Err = ApgError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "multinomial" => Ok(Self::Multinomial),
            "systematic" => Ok(Self::Systematic),
            "stratified" => Ok(Self::Stratified),
            other => Err(ApgError::config(format!(
                "unknown resampling strategy `{}`",
                other
            ))),
        }
    }
}

impl fmt::Display for ResamplingStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Multinomial => write!(f, "multinomial"),
            Self::Systematic => write!(f, "systematic"),
            Self::Stratified => write!(f, "stratified"),
        }
    }
}

macro_rules! string_conversions {
    ($t:ty) => {
        impl TryFrom<String> for $t {
            type Error = ApgError;
            fn try_from(s: String) -> Result<Self> {
                s.parse()
            }
        }

        impl From<$t> for String {
            fn from(v: $t) -> String {
                v.to_string()
            }
        }
    };
}

string_conversions!(BlockStrategy);
string_conversions!(ResamplingStrategy);

/// Sampler configuration
///
/// Defaults follow the usual APG setting: 10 particles, 20 instances
/// per batch, 7 sweeps, `small` blocks and systematic resampling.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApgConfig {
    pub num_particles: usize,
    pub batch_size: usize,
    pub num_sweeps: usize,
    pub block_strategy: BlockStrategy,
    pub resampling_strategy: ResamplingStrategy,
    pub show_progress: bool,
}

impl Default for ApgConfig {
    fn default() -> Self {
        Self {
            num_particles: 10,
            batch_size: 20,
            num_sweeps: 7,
            block_strategy: BlockStrategy::Small,
            resampling_strategy: ResamplingStrategy::Systematic,
            show_progress: false,
        }
    }
}

impl ApgConfig {
    pub fn validate(&self) -> Result<()> {
        if self.num_particles == 0 {
            return Err(ApgError::config("number of particles must be positive"));
        }
        if self.batch_size == 0 {
            return Err(ApgError::config("batch size must be positive"));
        }
        Ok(())
    }

    /// Parse and validate a JSON configuration.
    ///
    /// Missing fields take their default values. Unknown strategy
    /// names and ill-typed values are configuration errors.
    pub fn from_json_str(text: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(text).map_err(|e| match e.classify() {
            serde_json::error::Category::Data => ApgError::Configuration(e.to_string()),
            _ => ApgError::Json(e),
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    pub fn to_json_string(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strategies_parse() {
        assert_eq!("small".parse::<BlockStrategy>().unwrap(), BlockStrategy::Small);
        assert_eq!(" Large ".parse::<BlockStrategy>().unwrap(), BlockStrategy::Large);
        assert!(matches!(
            "medium".parse::<BlockStrategy>(),
            Err(ApgError::Configuration(_))
        ));
        assert_eq!(
            "systematic".parse::<ResamplingStrategy>().unwrap(),
            ResamplingStrategy::Systematic
        );
    }

    #[test]
    fn json_defaults_and_overrides() -> Result<()> {
        let config = ApgConfig::from_json_str(r#"{ "num_sweeps": 0, "block_strategy": "large" }"#)?;
        assert_eq!(config.num_sweeps, 0);
        assert_eq!(config.block_strategy, BlockStrategy::Large);
        assert_eq!(config.num_particles, 10);
        assert_eq!(config.resampling_strategy, ResamplingStrategy::Systematic);
        Ok(())
    }

    #[test]
    fn unknown_block_strategy_is_a_configuration_error() {
        let res = ApgConfig::from_json_str(r#"{ "block_strategy": "huge" }"#);
        assert!(matches!(res, Err(ApgError::Configuration(_))));
    }

    #[test]
    fn zero_particles_fail_fast() {
        let res = ApgConfig::from_json_str(r#"{ "num_particles": 0 }"#);
        assert!(matches!(res, Err(ApgError::Configuration(_))));
    }

    #[test]
    fn round_trip_through_json() -> Result<()> {
        let config = ApgConfig {
            num_particles: 4,
            resampling_strategy: ResamplingStrategy::Stratified,
            ..Default::default()
        };
        let back = ApgConfig::from_json_str(&config.to_json_string()?)?;
        assert_eq!(config, back);
        Ok(())
    }
}
