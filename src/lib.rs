//! Performance analytics over course attempts: per-course summaries,
//! performance tiers, strengths and weaknesses, course recommendations,
//! mentor matching and improvement tracking.

pub mod aggregate;
pub mod analytics;
pub mod api;
pub mod classifier;
pub mod config;
pub mod data;
pub mod database;
pub mod error;
pub mod improvement;
pub mod mentor;
pub mod model;
pub mod recommend;
pub mod similarity;

pub use aggregate::AttemptSet;
pub use analytics::{ClassOverview, PerformanceAnalyzer};
pub use classifier::{
    ClassificationStrategy, Classify, ClusterClassifier, RuleClassifier, ThresholdPolicy,
};
pub use config::EngineConfig;
pub use data::{
    attach_feedback, load_attempts, load_attempts_from_path, load_feedback_from_path, AttemptRow,
};
pub use database::{Database, InMemoryRepository, Repository};
pub use error::{EngineError, Result};
pub use improvement::{CompletionStatus, CourseProgress, ImprovementTracker, ScoreForecast};
pub use mentor::MentorMatcher;
pub use model::*;
pub use recommend::{CourseCatalog, RecommendationEngine};
