//! Reduces raw attempts to one summary per (student, course).

use std::collections::{BTreeMap, BTreeSet};

use ndarray::Array1;
use tracing::{debug, warn};

use crate::config::{EngineConfig, ScorePolicy};
use crate::data::AttemptRow;
use crate::error::{EngineError, Result};
use crate::model::{Attempt, CourseSummary};

/// Validated in-memory snapshot of attempts, in input order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AttemptSet {
    attempts: Vec<Attempt>,
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

/// student_id, then email, then name.
fn student_key(row: &AttemptRow) -> Option<&str> {
    non_empty(&row.student_id)
        .or_else(|| non_empty(&row.email))
        .or_else(|| non_empty(&row.student_name))
}

fn course_key(row: &AttemptRow) -> Option<&str> {
    non_empty(&row.course_id).or_else(|| non_empty(&row.course_name))
}

impl AttemptSet {
    pub fn new(attempts: Vec<Attempt>) -> Self {
        Self { attempts }
    }

    pub fn from_rows(rows: Vec<AttemptRow>, config: &EngineConfig) -> Result<Self> {
        if rows.is_empty() {
            return Ok(Self::default());
        }

        let mut missing = Vec::new();
        if !rows.iter().any(|row| student_key(row).is_some()) {
            missing.push("student identifier");
        }
        if !rows.iter().any(|row| course_key(row).is_some()) {
            missing.push("course identifier");
        }
        if rows.iter().all(|row| row.score.is_none()) {
            missing.push("score");
        }
        if !missing.is_empty() {
            return Err(EngineError::MissingFields { fields: missing });
        }

        let mut attempts = Vec::with_capacity(rows.len());
        let (mut unidentified, mut coerced, mut dropped) = (0usize, 0usize, 0usize);

        for row in &rows {
            let (Some(student_id), Some(course_id)) = (student_key(row), course_key(row)) else {
                unidentified += 1;
                continue;
            };

            let parsed = row.score.flatten().filter(|s| s.is_finite());
            let score = match (parsed, config.score_policy) {
                (Some(score), _) => score,
                (None, ScorePolicy::Zero) => {
                    coerced += 1;
                    0.0
                }
                (None, ScorePolicy::Drop) => {
                    dropped += 1;
                    continue;
                }
            };

            attempts.push(Attempt {
                student_id: student_id.to_string(),
                student_name: non_empty(&row.student_name)
                    .unwrap_or(student_id)
                    .to_string(),
                email: non_empty(&row.email).unwrap_or_default().to_string(),
                course_id: course_id.to_string(),
                course_name: non_empty(&row.course_name)
                    .unwrap_or(course_id)
                    .to_string(),
                attempted_at: row.attempt_timestamp,
                attempt_number: row.attempt_number,
                score,
                max_score: row
                    .max_score
                    .filter(|m| m.is_finite())
                    .unwrap_or(config.default_max_score),
                grade: row.grade.clone(),
                topic_tags: non_empty(&row.topic_tags).map(str::to_string),
                feedback: non_empty(&row.feedback).map(str::to_string),
            });
        }

        if unidentified > 0 {
            warn!(unidentified, "skipped rows without a student or course identifier");
        }
        if coerced > 0 {
            warn!(coerced, "coerced missing or malformed scores to zero");
        }
        if dropped > 0 {
            warn!(dropped, "dropped rows with missing or malformed scores");
        }
        debug!(attempts = attempts.len(), "built attempt set");

        Ok(Self { attempts })
    }

    pub fn attempts(&self) -> &[Attempt] {
        &self.attempts
    }

    pub fn len(&self) -> usize {
        self.attempts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.attempts.is_empty()
    }

    pub fn student_ids(&self) -> Vec<&str> {
        let ids: BTreeSet<&str> = self.attempts.iter().map(|a| a.student_id.as_str()).collect();
        ids.into_iter().collect()
    }

    pub fn student_name(&self, student_id: &str) -> Option<&str> {
        self.attempts
            .iter()
            .find(|a| a.student_id == student_id)
            .map(|a| a.student_name.as_str())
    }

    pub fn for_student(&self, student_id: &str) -> Vec<&Attempt> {
        self.attempts
            .iter()
            .filter(|a| a.student_id == student_id)
            .collect()
    }

    pub fn for_student_course(&self, student_id: &str, course_id: &str) -> Vec<&Attempt> {
        self.attempts
            .iter()
            .filter(|a| a.student_id == student_id && a.course_id == course_id)
            .collect()
    }

    /// Attempts grouped by (student_id, course_id), each group in input order.
    pub fn groups(&self) -> BTreeMap<(&str, &str), Vec<&Attempt>> {
        let mut groups: BTreeMap<(&str, &str), Vec<&Attempt>> = BTreeMap::new();
        for attempt in &self.attempts {
            groups
                .entry((attempt.student_id.as_str(), attempt.course_id.as_str()))
                .or_default()
                .push(attempt);
        }
        groups
    }

    pub fn summaries(&self) -> Vec<CourseSummary> {
        self.groups()
            .into_values()
            .filter_map(|group| summarize(&chronological(group)))
            .collect()
    }
}

/// Orders attempts by timestamp when every attempt has one, else by attempt
/// number when every attempt has one, else keeps input order.
pub fn chronological(mut attempts: Vec<&Attempt>) -> Vec<&Attempt> {
    if attempts.iter().all(|a| a.attempted_at.is_some()) {
        attempts.sort_by_key(|a| a.attempted_at);
    } else if attempts.iter().all(|a| a.attempt_number.is_some()) {
        attempts.sort_by_key(|a| a.attempt_number);
    }
    attempts
}

/// Orders a student's attempts across courses. Attempt numbers restart per
/// course, so only timestamps are trusted here.
pub fn timeline(mut attempts: Vec<&Attempt>) -> Vec<&Attempt> {
    if attempts.iter().all(|a| a.attempted_at.is_some()) {
        attempts.sort_by_key(|a| a.attempted_at);
    }
    attempts
}

/// Summarizes one chronologically ordered group.
pub fn summarize(group: &[&Attempt]) -> Option<CourseSummary> {
    let first = group.first()?;
    let last = group.last()?;
    let scores = Array1::from_iter(group.iter().map(|a| a.score));

    let best_score = scores.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let average_score = scores.mean().unwrap_or(0.0);
    let score_stddev = if scores.len() > 1 { scores.std(1.0) } else { 0.0 };

    Some(CourseSummary {
        student_id: first.student_id.clone(),
        student_name: first.student_name.clone(),
        email: first.email.clone(),
        course_id: first.course_id.clone(),
        course_name: first.course_name.clone(),
        best_score,
        average_score,
        attempt_count: group.len(),
        score_stddev,
        latest_score: last.score,
        baseline_score: first.score,
        topic_tags: group.iter().find_map(|a| a.topic_tags.clone()),
        feedback: group.iter().find_map(|a| a.feedback.clone()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::load_attempts;
    use approx::assert_relative_eq;
    use chrono::NaiveDate;

    fn row(student: &str, course: &str, score: Option<f64>) -> AttemptRow {
        AttemptRow {
            student_id: Some(student.to_string()),
            course_id: Some(course.to_string()),
            score: Some(score),
            ..Default::default()
        }
    }

    #[test]
    fn two_attempts_summarize_best_average_baseline_latest() {
        let set = AttemptSet::new(vec![
            Attempt::new("S1", "C1", 50.0),
            Attempt::new("S1", "C1", 90.0),
        ]);
        let summaries = set.summaries();
        assert_eq!(summaries.len(), 1);
        let s = &summaries[0];
        assert_eq!(s.best_score, 90.0);
        assert_eq!(s.average_score, 70.0);
        assert_eq!(s.attempt_count, 2);
        assert_eq!(s.baseline_score, 50.0);
        assert_eq!(s.latest_score, 90.0);
        assert_relative_eq!(s.score_stddev, 28.284271247461902, epsilon = 1e-9);
    }

    #[test]
    fn identical_scores_have_zero_stddev() {
        let set = AttemptSet::new(vec![
            Attempt::new("S1", "C1", 72.0),
            Attempt::new("S1", "C1", 72.0),
            Attempt::new("S1", "C1", 72.0),
        ]);
        assert_eq!(set.summaries()[0].score_stddev, 0.0);
    }

    #[test]
    fn single_attempt_has_zero_stddev() {
        let set = AttemptSet::new(vec![Attempt::new("S1", "C1", 64.0)]);
        assert_eq!(set.summaries()[0].score_stddev, 0.0);
    }

    #[test]
    fn timestamps_override_input_order() {
        let day = |d| NaiveDate::from_ymd_opt(2024, 3, d).and_then(|x| x.and_hms_opt(8, 0, 0));
        let mut late = Attempt::new("S1", "C1", 40.0);
        late.attempted_at = day(20);
        let mut early = Attempt::new("S1", "C1", 80.0);
        early.attempted_at = day(1);
        let set = AttemptSet::new(vec![late, early]);
        let summary = &set.summaries()[0];
        assert_eq!(summary.baseline_score, 80.0);
        assert_eq!(summary.latest_score, 40.0);
    }

    #[test]
    fn partial_timestamps_keep_input_order() {
        let mut stamped = Attempt::new("S1", "C1", 40.0);
        stamped.attempted_at =
            NaiveDate::from_ymd_opt(2024, 5, 1).and_then(|d| d.and_hms_opt(0, 0, 0));
        let set = AttemptSet::new(vec![stamped, Attempt::new("S1", "C1", 80.0)]);
        assert_eq!(set.summaries()[0].latest_score, 80.0);
    }

    #[test]
    fn malformed_scores_are_coerced_to_zero() {
        let set = AttemptSet::from_rows(
            vec![row("S1", "C1", Some(80.0)), row("S1", "C1", None)],
            &EngineConfig::default(),
        )
        .unwrap();
        let summary = &set.summaries()[0];
        assert_eq!(summary.attempt_count, 2);
        assert_eq!(summary.latest_score, 0.0);
        assert_eq!(summary.average_score, 40.0);
    }

    #[test]
    fn drop_policy_skips_malformed_scores() {
        let config = EngineConfig {
            score_policy: ScorePolicy::Drop,
            ..EngineConfig::default()
        };
        let set = AttemptSet::from_rows(
            vec![row("S1", "C1", Some(80.0)), row("S1", "C1", Some(f64::NAN))],
            &config,
        )
        .unwrap();
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn identity_falls_back_to_email_then_name() {
        let rows = vec![
            AttemptRow {
                email: Some("ada@example.com".into()),
                course_name: Some("Python".into()),
                score: Some(Some(70.0)),
                ..Default::default()
            },
            AttemptRow {
                student_name: Some("Grace".into()),
                course_name: Some("Python".into()),
                score: Some(Some(65.0)),
                ..Default::default()
            },
        ];
        let set = AttemptSet::from_rows(rows, &EngineConfig::default()).unwrap();
        assert_eq!(set.student_ids(), vec!["Grace", "ada@example.com"]);
        assert_eq!(set.attempts()[0].course_id, "Python");
    }

    #[test]
    fn missing_columns_everywhere_fail_validation() {
        let rows = vec![AttemptRow {
            student_name: Some("Ada".into()),
            ..Default::default()
        }];
        let err = AttemptSet::from_rows(rows, &EngineConfig::default()).unwrap_err();
        match err {
            EngineError::MissingFields { fields } => {
                assert_eq!(fields, vec!["course identifier", "score"]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn csv_column_with_only_bad_scores_is_coerced() {
        let csv = "student_id,course_id,score\nS1,C1,absent\nS2,C1,n/a\n";
        let rows = load_attempts(csv.as_bytes()).unwrap();
        let set = AttemptSet::from_rows(rows, &EngineConfig::default()).unwrap();
        assert_eq!(set.len(), 2);
        assert!(set.attempts().iter().all(|a| a.score == 0.0));
    }

    #[test]
    fn json_rows_with_text_scores_are_coerced() {
        let json = r#"[
            {"student_id": "S1", "course_id": "C1", "score": "abc"},
            {"student_id": "S2", "course_id": "C1", "score": 80},
            {"student_id": "S3", "course_id": "C1", "score": " 72.5 ", "max_score": "n/a"}
        ]"#;
        let rows: Vec<AttemptRow> = serde_json::from_str(json).unwrap();
        assert_eq!(rows[0].score, Some(None));
        let set = AttemptSet::from_rows(rows, &EngineConfig::default()).unwrap();
        let scores: Vec<f64> = set.attempts().iter().map(|a| a.score).collect();
        assert_eq!(scores, vec![0.0, 80.0, 72.5]);
        assert_eq!(set.attempts()[2].max_score, 100.0);
    }

    #[test]
    fn empty_input_is_an_empty_set() {
        let set = AttemptSet::from_rows(Vec::new(), &EngineConfig::default()).unwrap();
        assert!(set.is_empty());
        assert!(set.summaries().is_empty());
    }
}
