//! Performance classification: fixed thresholds or k-means over score profiles.

use std::collections::HashSet;

use linfa::prelude::*;
use linfa_clustering::KMeans;
use ndarray::{Array1, Array2, ArrayView2};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::aggregate::AttemptSet;
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::model::{ClassifiedSummary, CourseSummary, PerformanceLabel, StudentClassification};
use crate::similarity::{standardize, ScoreMatrix};

/// Score bands: below `low` is Low, above `high` is High (or at `high` when
/// `high_inclusive`), everything in between is Medium.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThresholdPolicy {
    pub low: f64,
    pub high: f64,
    pub high_inclusive: bool,
}

impl Default for ThresholdPolicy {
    fn default() -> Self {
        Self {
            low: 60.0,
            high: 80.0,
            high_inclusive: false,
        }
    }
}

impl ThresholdPolicy {
    /// `< 60` Low, `< 75` Medium, otherwise High.
    pub const HIGH_AT_75: ThresholdPolicy = ThresholdPolicy {
        low: 60.0,
        high: 75.0,
        high_inclusive: true,
    };

    pub fn label(&self, score: f64) -> PerformanceLabel {
        let score = if score.is_nan() { 0.0 } else { score };
        let high = if self.high_inclusive {
            score >= self.high
        } else {
            score > self.high
        };

        if score < self.low {
            PerformanceLabel::Low
        } else if high {
            PerformanceLabel::High
        } else {
            PerformanceLabel::Medium
        }
    }
}

/// Labels every row of a feature matrix.
pub trait Classify {
    fn classify_rows(&self, features: ArrayView2<f64>) -> Result<Vec<PerformanceLabel>>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RuleClassifier {
    pub policy: ThresholdPolicy,
}

impl RuleClassifier {
    pub fn new(policy: ThresholdPolicy) -> Self {
        Self { policy }
    }

    pub fn classify(&self, score: f64) -> PerformanceLabel {
        self.policy.label(score)
    }
}

impl Classify for RuleClassifier {
    /// Multi-feature rows are judged on their mean.
    fn classify_rows(&self, features: ArrayView2<f64>) -> Result<Vec<PerformanceLabel>> {
        Ok(features
            .rows()
            .into_iter()
            .map(|row| self.classify(row.mean().unwrap_or(0.0)))
            .collect())
    }
}

#[derive(Debug, Clone)]
pub struct ClusterClassifier {
    pub clusters: usize,
    pub seed: u64,
    pub fallback: RuleClassifier,
}

impl ClusterClassifier {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            clusters: config.cluster_count,
            seed: config.cluster_seed,
            fallback: RuleClassifier::new(config.thresholds),
        }
    }
}

fn distinct_rows(features: ArrayView2<f64>) -> usize {
    features
        .rows()
        .into_iter()
        .map(|row| row.iter().map(|v| v.to_bits()).collect::<Vec<u64>>())
        .collect::<HashSet<_>>()
        .len()
}

/// Maps the `rank`-th lowest of `k` centroids onto the three labels.
fn label_for_rank(rank: usize, k: usize) -> PerformanceLabel {
    if k <= 1 {
        return PerformanceLabel::Medium;
    }
    let position = (rank * 2 + (k - 1) / 2) / (k - 1);
    PerformanceLabel::ASCENDING[position.min(2)]
}

/// Label per cluster index, ordering centroids by their mean coordinate.
fn rank_centroids(centroids: &Array2<f64>) -> Vec<PerformanceLabel> {
    let k = centroids.nrows();
    let means: Vec<f64> = centroids
        .rows()
        .into_iter()
        .map(|c| c.mean().unwrap_or(0.0))
        .collect();

    let mut order: Vec<usize> = (0..k).collect();
    order.sort_by(|&a, &b| means[a].total_cmp(&means[b]).then(a.cmp(&b)));

    let mut labels = vec![PerformanceLabel::Medium; k];
    for (rank, cluster) in order.into_iter().enumerate() {
        labels[cluster] = label_for_rank(rank, k);
    }
    labels
}

impl Classify for ClusterClassifier {
    fn classify_rows(&self, features: ArrayView2<f64>) -> Result<Vec<PerformanceLabel>> {
        let samples = features.nrows();
        if samples < self.clusters || distinct_rows(features) < self.clusters {
            debug!(
                samples,
                clusters = self.clusters,
                "too few samples to cluster, using thresholds"
            );
            return self.fallback.classify_rows(features);
        }

        let scaled = standardize(features);
        let observations = DatasetBase::from(scaled.clone());
        let model = KMeans::params_with_rng(self.clusters, StdRng::seed_from_u64(self.seed))
            .max_n_iterations(300)
            .tolerance(1e-4)
            .fit(&observations)
            .map_err(|e| EngineError::Clustering(e.to_string()))?;

        let memberships: Array1<usize> = model.predict(&scaled);
        let labels = rank_centroids(model.centroids());
        debug!(samples, clusters = self.clusters, "clustered score profiles");

        Ok(memberships
            .iter()
            .map(|&cluster| labels.get(cluster).copied().unwrap_or(PerformanceLabel::Medium))
            .collect())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ClassificationStrategy {
    #[default]
    Rule,
    Cluster,
}

pub fn classifier_for(
    strategy: ClassificationStrategy,
    config: &EngineConfig,
) -> Box<dyn Classify + Send + Sync> {
    match strategy {
        ClassificationStrategy::Rule => Box::new(RuleClassifier::new(config.thresholds)),
        ClassificationStrategy::Cluster => Box::new(ClusterClassifier::from_config(config)),
    }
}

/// Labels each summary on its best score.
pub fn classify_summaries(
    summaries: &[CourseSummary],
    rule: &RuleClassifier,
) -> Vec<ClassifiedSummary> {
    summaries
        .iter()
        .map(|summary| ClassifiedSummary {
            label: rule.classify(summary.best_score),
            summary: summary.clone(),
        })
        .collect()
}

/// Labels every student on their zero-filled per-course mean scores.
pub fn classify_students(
    set: &AttemptSet,
    classifier: &dyn Classify,
) -> Result<Vec<StudentClassification>> {
    let matrix = ScoreMatrix::from_attempts(set);
    let labels = classifier.classify_rows(matrix.scores())?;

    Ok(matrix
        .students()
        .iter()
        .zip(labels)
        .map(|(student_id, label)| {
            let attempts = set.for_student(student_id);
            let average_score = if attempts.is_empty() {
                0.0
            } else {
                attempts.iter().map(|a| a.score).sum::<f64>() / attempts.len() as f64
            };
            StudentClassification {
                student_id: student_id.clone(),
                student_name: set.student_name(student_id).unwrap_or(student_id).to_string(),
                average_score,
                label,
            }
        })
        .collect())
}
