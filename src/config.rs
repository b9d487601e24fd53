use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::classifier::ThresholdPolicy;
use crate::error::{EngineError, Result};

/// What to do with a score that is missing or not a finite number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ScorePolicy {
    /// Treat the attempt as scoring zero.
    #[default]
    Zero,
    /// Leave the attempt out of every computation.
    Drop,
}

/// Which observed score counts as the starting point of a completed course.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BaselinePolicy {
    /// First attempt when every attempt is timestamped, lowest score otherwise.
    #[default]
    Auto,
    LowestScore,
    FirstAttempt,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompatibilityBand {
    pub base: f64,
    pub gap_weight: f64,
    pub min: f64,
    pub max: f64,
}

impl Default for CompatibilityBand {
    fn default() -> Self {
        Self {
            base: 70.0,
            gap_weight: 0.5,
            min: 50.0,
            max: 100.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub thresholds: ThresholdPolicy,
    pub score_policy: ScorePolicy,
    pub baseline_policy: BaselinePolicy,
    pub default_max_score: f64,

    /// Latest-attempt percentage at or above which a course is a strength.
    pub strength_percentage: f64,
    /// Latest-attempt percentage below which a course is a weakness.
    pub weakness_percentage: f64,
    /// Score drop between first and last attempt that flags a course as declining.
    pub decline_margin: f64,
    /// Score change between a student's first and last attempt that counts as a trend.
    pub trend_margin: f64,

    pub cluster_count: usize,
    pub cluster_seed: u64,

    pub peer_neighbors: usize,
    /// Best percentage a peer needs in a course to be considered strong in it.
    pub peer_strong_percentage: f64,
    pub max_peer_recommendations: usize,

    pub mentor_candidates: usize,
    pub max_mentor_matches: usize,
    pub mentor_pool_size: usize,
    pub mentors_per_course: usize,
    pub strong_average: f64,
    pub weak_average: f64,
    pub compatibility: CompatibilityBand,

    pub most_improved_limit: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            thresholds: ThresholdPolicy::default(),
            score_policy: ScorePolicy::default(),
            baseline_policy: BaselinePolicy::default(),
            default_max_score: 100.0,
            strength_percentage: 75.0,
            weakness_percentage: 60.0,
            decline_margin: 10.0,
            trend_margin: 10.0,
            cluster_count: 3,
            cluster_seed: 42,
            peer_neighbors: 5,
            peer_strong_percentage: 75.0,
            max_peer_recommendations: 5,
            mentor_candidates: 10,
            max_mentor_matches: 5,
            mentor_pool_size: 5,
            mentors_per_course: 2,
            strong_average: 75.0,
            weak_average: 60.0,
            compatibility: CompatibilityBand::default(),
            most_improved_limit: 5,
        }
    }
}

impl EngineConfig {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        let config: EngineConfig = serde_json::from_str(&raw)?;
        config.validate()?;
        info!(path = %path.display(), "loaded engine configuration");
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.thresholds.low > self.thresholds.high {
            return Err(EngineError::Config(format!(
                "low threshold {} is above high threshold {}",
                self.thresholds.low, self.thresholds.high
            )));
        }
        if self.weakness_percentage > self.strength_percentage {
            return Err(EngineError::Config(
                "weakness percentage must not exceed strength percentage".to_string(),
            ));
        }
        if self.cluster_count == 0 || self.peer_neighbors == 0 || self.mentor_candidates == 0 {
            return Err(EngineError::Config(
                "cluster, neighbor and candidate counts must be positive".to_string(),
            ));
        }
        let band = &self.compatibility;
        if band.min > band.max {
            return Err(EngineError::Config(format!(
                "compatibility band [{}, {}] is empty",
                band.min, band.max
            )));
        }
        if self.default_max_score <= 0.0 {
            return Err(EngineError::Config(
                "default max score must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert!(EngineConfig::default().validate().is_ok());
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let json = r#"{"thresholds": {"low": 50.0, "high": 70.0}, "score_policy": "drop"}"#;
        let config: EngineConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.thresholds.low, 50.0);
        assert_eq!(config.thresholds.high, 70.0);
        assert!(!config.thresholds.high_inclusive);
        assert_eq!(config.score_policy, ScorePolicy::Drop);
        assert_eq!(config.mentors_per_course, 2);
    }

    #[test]
    fn inverted_thresholds_are_rejected() {
        let mut config = EngineConfig::default();
        config.thresholds.low = 90.0;
        assert!(matches!(config.validate(), Err(EngineError::Config(_))));
    }

    #[test]
    fn zero_clusters_are_rejected() {
        let config = EngineConfig {
            cluster_count: 0,
            ..EngineConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
