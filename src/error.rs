//! Error types for the performance engine.

use thiserror::Error;

use crate::improvement::CompletionStatus;

#[derive(Error, Debug)]
pub enum EngineError {
    /// Required identity or score fields are absent from every record
    #[error("missing required fields: {}", .fields.join(", "))]
    MissingFields { fields: Vec<&'static str> },

    /// Input columns could not be mapped onto the attempt schema
    #[error(
        "unrecognized schema, missing {} (headers: {})",
        .missing.join(", "),
        .headers.join(", ")
    )]
    UnrecognizedSchema {
        missing: Vec<&'static str>,
        headers: Vec<String>,
    },

    #[error("no attempts recorded for student {0}")]
    UnknownStudent(String),

    #[error("no attempts recorded for student {student_id} in course {course_id}")]
    NoAttempts {
        student_id: String,
        course_id: String,
    },

    #[error("cannot move course progress from {from:?} to {to:?}")]
    InvalidTransition {
        from: CompletionStatus,
        to: CompletionStatus,
    },

    #[error("clustering failed: {0}")]
    Clustering(String),

    #[error("regression failed: {0}")]
    Regression(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, EngineError>;
