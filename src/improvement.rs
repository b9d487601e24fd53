//! Course completion lifecycle and improvement measurement.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use chrono::NaiveDateTime;
use linfa::traits::{Fit, Predict};
use linfa::Dataset;
use linfa_linear::LinearRegression;
use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::aggregate::{chronological, timeline, AttemptSet};
use crate::config::{BaselinePolicy, EngineConfig};
use crate::database::Repository;
use crate::error::{EngineError, Result};
use crate::model::{Attempt, ImprovementRecord, Trend};

/// Mean per-course change beyond which a student counts as improving overall.
const OVERALL_TREND_MARGIN: f64 = 5.0;

/// Slopes closer to zero than this are treated as flat.
const FLAT_SLOPE: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionStatus {
    Recommended,
    InProgress,
    Completed,
    Abandoned,
}

impl CompletionStatus {
    /// Abandoned is terminal and a completed course never goes back to
    /// being worked on. Completing again is allowed.
    pub fn can_move_to(self, next: CompletionStatus) -> bool {
        use CompletionStatus::*;
        match (self, next) {
            (Abandoned, Abandoned) => true,
            (Abandoned, _) => false,
            (Completed, Recommended | InProgress) => false,
            _ => true,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct CourseProgress {
    pub student_id: String,
    pub course_id: String,
    pub status: CompletionStatus,
    pub completion_percentage: f64,
    pub estimated_completion: Option<String>,
    pub completed_at: Option<NaiveDateTime>,
}

/// Baseline against current score for a course attempted more than once.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ProgressSnapshot {
    pub student_id: String,
    pub student_name: String,
    pub course_id: String,
    pub course_name: String,
    pub baseline_score: f64,
    pub current_score: f64,
    pub improvement: f64,
    pub attempt_count: usize,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct CourseChange {
    pub course_id: String,
    pub course_name: String,
    pub first_score: f64,
    pub last_score: f64,
    pub change: f64,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct OverallImprovement {
    pub student_id: String,
    pub courses: Vec<CourseChange>,
    pub total_change: f64,
    pub average_change: f64,
    pub improved_courses: usize,
    pub declined_courses: usize,
    pub trend: Trend,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct StudentImprovement {
    pub student_id: String,
    pub average_improvement: f64,
    pub completed_courses: usize,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ScoreForecast {
    Insufficient {
        attempts: usize,
    },
    Forecast {
        predicted_score: f64,
        slope: f64,
        intercept: f64,
        r_squared: f64,
        trend: Trend,
    },
}

fn max_score(attempts: &[&Attempt]) -> f64 {
    attempts.iter().map(|a| a.score).fold(f64::NEG_INFINITY, f64::max)
}

fn min_score(attempts: &[&Attempt]) -> f64 {
    attempts.iter().map(|a| a.score).fold(f64::INFINITY, f64::min)
}

pub fn improvement_percentage(initial: f64, final_score: f64) -> f64 {
    if initial == 0.0 {
        0.0
    } else {
        (final_score - initial) / initial * 100.0
    }
}

pub struct ImprovementTracker {
    baseline_policy: BaselinePolicy,
}

impl ImprovementTracker {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            baseline_policy: config.baseline_policy,
        }
    }

    /// Initial score of a chronologically ordered group.
    fn baseline(&self, attempts: &[&Attempt]) -> f64 {
        let first = attempts.first().map(|a| a.score).unwrap_or(0.0);
        match self.baseline_policy {
            BaselinePolicy::FirstAttempt => first,
            BaselinePolicy::LowestScore => min_score(attempts),
            BaselinePolicy::Auto if attempts.iter().all(|a| a.attempted_at.is_some()) => first,
            BaselinePolicy::Auto => min_score(attempts),
        }
    }

    fn current<P: Repository<CourseProgress>>(
        repo: &P,
        student_id: &str,
        course_id: &str,
    ) -> Option<CourseProgress> {
        repo.load(&(student_id.to_string(), course_id.to_string()))
    }

    fn check(current: Option<&CourseProgress>, next: CompletionStatus) -> Result<()> {
        match current {
            Some(progress) if !progress.status.can_move_to(next) => {
                Err(EngineError::InvalidTransition {
                    from: progress.status,
                    to: next,
                })
            }
            _ => Ok(()),
        }
    }

    /// Creates or updates the progress row for a course.
    pub fn track<P: Repository<CourseProgress>>(
        &self,
        repo: &mut P,
        student_id: &str,
        course_id: &str,
        status: CompletionStatus,
        completion_percentage: f64,
        estimated_completion: Option<String>,
    ) -> Result<CourseProgress> {
        let existing = Self::current(repo, student_id, course_id);
        Self::check(existing.as_ref(), status)?;

        let progress = CourseProgress {
            student_id: student_id.to_string(),
            course_id: course_id.to_string(),
            status,
            completion_percentage: completion_percentage.clamp(0.0, 100.0),
            estimated_completion,
            completed_at: existing.and_then(|p| p.completed_at),
        };
        repo.replace(progress.clone());
        debug!(student_id, course_id, ?status, "tracked course progress");
        Ok(progress)
    }

    /// Marks the course completed and records how far the student came.
    pub fn complete<P, I>(
        &self,
        progress: &mut P,
        improvements: &mut I,
        set: &AttemptSet,
        student_id: &str,
        course_id: &str,
        completed_at: NaiveDateTime,
    ) -> Result<ImprovementRecord>
    where
        P: Repository<CourseProgress>,
        I: Repository<ImprovementRecord>,
    {
        let attempts = chronological(set.for_student_course(student_id, course_id));
        if attempts.is_empty() {
            return Err(EngineError::NoAttempts {
                student_id: student_id.to_string(),
                course_id: course_id.to_string(),
            });
        }
        let existing = Self::current(progress, student_id, course_id);
        Self::check(existing.as_ref(), CompletionStatus::Completed)?;

        let initial_score = self.baseline(&attempts);
        let final_score = max_score(&attempts);
        let record = ImprovementRecord {
            record_id: Uuid::new_v4(),
            student_id: student_id.to_string(),
            course_id: course_id.to_string(),
            initial_score,
            final_score,
            improvement_percentage: improvement_percentage(initial_score, final_score),
            completion_date: completed_at,
        };
        improvements.save(record.clone());
        progress.replace(CourseProgress {
            student_id: student_id.to_string(),
            course_id: course_id.to_string(),
            status: CompletionStatus::Completed,
            completion_percentage: 100.0,
            estimated_completion: existing.and_then(|p| p.estimated_completion),
            completed_at: Some(completed_at),
        });

        info!(
            student_id,
            course_id,
            improvement = record.improvement_percentage,
            "course completed"
        );
        Ok(record)
    }

    pub fn abandon<P: Repository<CourseProgress>>(
        &self,
        repo: &mut P,
        student_id: &str,
        course_id: &str,
    ) -> Result<CourseProgress> {
        let existing = Self::current(repo, student_id, course_id);
        Self::check(existing.as_ref(), CompletionStatus::Abandoned)?;

        let progress = CourseProgress {
            student_id: student_id.to_string(),
            course_id: course_id.to_string(),
            status: CompletionStatus::Abandoned,
            completion_percentage: existing.as_ref().map_or(0.0, |p| p.completion_percentage),
            estimated_completion: None,
            completed_at: None,
        };
        repo.replace(progress.clone());
        Ok(progress)
    }
}

/// Students ranked by their mean improvement over completed courses.
pub fn most_improved(records: &[ImprovementRecord], limit: usize) -> Vec<StudentImprovement> {
    let mut per_student: BTreeMap<&str, Vec<f64>> = BTreeMap::new();
    for record in records {
        per_student
            .entry(record.student_id.as_str())
            .or_default()
            .push(record.improvement_percentage);
    }

    let mut ranked: Vec<StudentImprovement> = per_student
        .into_iter()
        .map(|(student_id, values)| StudentImprovement {
            student_id: student_id.to_string(),
            average_improvement: values.iter().sum::<f64>() / values.len() as f64,
            completed_courses: values.len(),
        })
        .collect();
    // Stable sort keeps id order among ties.
    ranked.sort_by(|a, b| {
        b.average_improvement
            .partial_cmp(&a.average_improvement)
            .unwrap_or(Ordering::Equal)
    });
    ranked.truncate(limit);
    ranked
}

/// A student's completion records, newest completion first.
pub fn improvements_for_student<I: Repository<ImprovementRecord>>(
    repo: &I,
    student_id: &str,
) -> Vec<ImprovementRecord> {
    let mut records = repo.query(&|r| r.student_id == student_id);
    records.sort_by(|a, b| b.completion_date.cmp(&a.completion_date));
    records
}

/// Tracked courses for a student, ordered by course id.
pub fn progress_for_student<P: Repository<CourseProgress>>(
    repo: &P,
    student_id: &str,
) -> Vec<CourseProgress> {
    repo.query(&|p| p.student_id == student_id)
}

pub fn course_progress(set: &AttemptSet) -> Vec<ProgressSnapshot> {
    set.groups()
        .into_values()
        .filter(|group| group.len() > 1)
        .filter_map(|group| {
            let ordered = chronological(group);
            let first = ordered.first()?;
            let last = ordered.last()?;
            Some(ProgressSnapshot {
                student_id: first.student_id.clone(),
                student_name: first.student_name.clone(),
                course_id: first.course_id.clone(),
                course_name: first.course_name.clone(),
                baseline_score: first.score,
                current_score: last.score,
                improvement: last.score - first.score,
                attempt_count: ordered.len(),
            })
        })
        .collect()
}

pub fn overall_improvement(set: &AttemptSet, student_id: &str) -> Result<OverallImprovement> {
    let groups = set.groups();
    let owned: Vec<_> = groups
        .into_iter()
        .filter(|((student, _), _)| *student == student_id)
        .collect();
    if owned.is_empty() {
        return Err(EngineError::UnknownStudent(student_id.to_string()));
    }

    let courses: Vec<CourseChange> = owned
        .into_iter()
        .filter(|(_, group)| group.len() > 1)
        .filter_map(|(_, group)| {
            let ordered = chronological(group);
            let first = ordered.first()?;
            let last = ordered.last()?;
            Some(CourseChange {
                course_id: first.course_id.clone(),
                course_name: first.course_name.clone(),
                first_score: first.score,
                last_score: last.score,
                change: last.score - first.score,
            })
        })
        .collect();

    let total_change: f64 = courses.iter().map(|c| c.change).sum();
    let average_change = if courses.is_empty() {
        0.0
    } else {
        total_change / courses.len() as f64
    };

    Ok(OverallImprovement {
        student_id: student_id.to_string(),
        improved_courses: courses.iter().filter(|c| c.change > 0.0).count(),
        declined_courses: courses.iter().filter(|c| c.change < 0.0).count(),
        total_change,
        average_change,
        trend: Trend::from_change(average_change, OVERALL_TREND_MARGIN),
        courses,
    })
}

/// Least-squares line through the student's scores in attempt order,
/// extrapolated one attempt ahead.
pub fn forecast_next_score(set: &AttemptSet, student_id: &str) -> Result<ScoreForecast> {
    let attempts = timeline(set.for_student(student_id));
    let n = attempts.len();
    if n < 2 {
        return Ok(ScoreForecast::Insufficient { attempts: n });
    }

    let x = Array2::from_shape_fn((n, 1), |(i, _)| i as f64);
    let y = Array1::from_iter(attempts.iter().map(|a| a.score));
    let dataset = Dataset::new(x.clone(), y.clone());

    let model = LinearRegression::new()
        .fit(&dataset)
        .map_err(|e| EngineError::Regression(e.to_string()))?;
    let slope = model.params()[0];
    let intercept = model.intercept();

    let fitted: Array1<f64> = model.predict(&x);
    let mean = y.mean().unwrap_or(0.0);
    let ss_res: f64 = (&y - &fitted).mapv(|r| r * r).sum();
    let ss_tot: f64 = y.mapv(|v| (v - mean).powi(2)).sum();
    let r_squared = 1.0 - ss_res / ss_tot;

    Ok(ScoreForecast::Forecast {
        predicted_score: intercept + slope * n as f64,
        slope,
        intercept,
        r_squared: if r_squared.is_finite() { r_squared } else { 0.0 },
        trend: Trend::from_change(slope, FLAT_SLOPE),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::InMemoryRepository;
    use approx::assert_relative_eq;
    use chrono::NaiveDate;

    fn when(day: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 6, day)
            .and_then(|d| d.and_hms_opt(12, 0, 0))
            .unwrap()
    }

    fn three_attempts() -> AttemptSet {
        AttemptSet::new(vec![
            Attempt::new("S1", "C1", 70.0),
            Attempt::new("S1", "C1", 40.0),
            Attempt::new("S1", "C1", 90.0),
        ])
    }

    fn tracker() -> ImprovementTracker {
        ImprovementTracker::new(&EngineConfig::default())
    }

    #[test]
    fn completion_uses_lowest_and_highest_without_timestamps() {
        let mut progress = InMemoryRepository::default();
        let mut improvements = InMemoryRepository::default();
        let record = tracker()
            .complete(&mut progress, &mut improvements, &three_attempts(), "S1", "C1", when(1))
            .unwrap();

        assert_eq!(record.initial_score, 40.0);
        assert_eq!(record.final_score, 90.0);
        assert_relative_eq!(record.improvement_percentage, 125.0);
        assert_eq!(improvements.len(), 1);
        let key = ("S1".to_string(), "C1".to_string());
        assert_eq!(progress.load(&key).unwrap().status, CompletionStatus::Completed);
    }

    #[test]
    fn completion_with_timestamps_starts_from_first_attempt() {
        let mut first = Attempt::new("S1", "C1", 70.0);
        first.attempted_at = Some(when(1));
        let mut dip = Attempt::new("S1", "C1", 40.0);
        dip.attempted_at = Some(when(2));
        let mut last = Attempt::new("S1", "C1", 84.0);
        last.attempted_at = Some(when(3));
        let set = AttemptSet::new(vec![last, dip, first]);

        let record = tracker()
            .complete(
                &mut InMemoryRepository::default(),
                &mut InMemoryRepository::default(),
                &set,
                "S1",
                "C1",
                when(4),
            )
            .unwrap();
        assert_eq!(record.initial_score, 70.0);
        assert_relative_eq!(record.improvement_percentage, 20.0);
    }

    #[test]
    fn zero_initial_score_reports_zero_improvement() {
        let set = AttemptSet::new(vec![
            Attempt::new("S1", "C1", 0.0),
            Attempt::new("S1", "C1", 50.0),
        ]);
        let record = tracker()
            .complete(
                &mut InMemoryRepository::default(),
                &mut InMemoryRepository::default(),
                &set,
                "S1",
                "C1",
                when(1),
            )
            .unwrap();
        assert_eq!(record.improvement_percentage, 0.0);
    }

    #[test]
    fn completing_without_attempts_fails() {
        let err = tracker()
            .complete(
                &mut InMemoryRepository::default(),
                &mut InMemoryRepository::default(),
                &three_attempts(),
                "S1",
                "C9",
                when(1),
            )
            .unwrap_err();
        assert!(matches!(err, EngineError::NoAttempts { .. }));
    }

    #[test]
    fn recompletion_adds_another_record() {
        let tracker = tracker();
        let set = three_attempts();
        let mut progress = InMemoryRepository::default();
        let mut improvements = InMemoryRepository::default();
        tracker
            .complete(&mut progress, &mut improvements, &set, "S1", "C1", when(1))
            .unwrap();
        tracker
            .complete(&mut progress, &mut improvements, &set, "S1", "C1", when(2))
            .unwrap();
        assert_eq!(improvements.len(), 2);
        assert_eq!(progress.len(), 1);
    }

    #[test]
    fn abandoned_courses_cannot_be_completed() {
        let tracker = tracker();
        let mut progress = InMemoryRepository::default();
        tracker
            .track(&mut progress, "S1", "C1", CompletionStatus::InProgress, 30.0, None)
            .unwrap();
        tracker.abandon(&mut progress, "S1", "C1").unwrap();

        let err = tracker
            .complete(
                &mut progress,
                &mut InMemoryRepository::default(),
                &three_attempts(),
                "S1",
                "C1",
                when(1),
            )
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::InvalidTransition {
                from: CompletionStatus::Abandoned,
                to: CompletionStatus::Completed
            }
        ));
    }

    #[test]
    fn completed_courses_do_not_return_to_progress() {
        let tracker = tracker();
        let mut progress = InMemoryRepository::default();
        tracker
            .complete(
                &mut progress,
                &mut InMemoryRepository::default(),
                &three_attempts(),
                "S1",
                "C1",
                when(1),
            )
            .unwrap();
        let result =
            tracker.track(&mut progress, "S1", "C1", CompletionStatus::InProgress, 50.0, None);
        assert!(result.is_err());
    }

    #[test]
    fn tracking_upserts_and_clamps() {
        let tracker = tracker();
        let mut progress = InMemoryRepository::default();
        tracker
            .track(&mut progress, "S1", "C1", CompletionStatus::Recommended, 0.0, None)
            .unwrap();
        let updated = tracker
            .track(
                &mut progress,
                "S1",
                "C1",
                CompletionStatus::InProgress,
                140.0,
                Some("2024-09-01".to_string()),
            )
            .unwrap();
        assert_eq!(progress.len(), 1);
        assert_eq!(updated.completion_percentage, 100.0);
    }

    fn record(student: &str, pct: f64) -> ImprovementRecord {
        ImprovementRecord {
            record_id: Uuid::new_v4(),
            student_id: student.to_string(),
            course_id: "C1".to_string(),
            initial_score: 50.0,
            final_score: 50.0 * (1.0 + pct / 100.0),
            improvement_percentage: pct,
            completion_date: when(1),
        }
    }

    #[test]
    fn most_improved_orders_by_mean_improvement() {
        let records = vec![
            record("S2", 10.0),
            record("S1", 40.0),
            record("S3", 20.0),
            record("S3", 60.0),
        ];
        let ranked = most_improved(&records, 5);
        let ids: Vec<&str> = ranked.iter().map(|r| r.student_id.as_str()).collect();
        assert_eq!(ids, vec!["S1", "S3", "S2"]);
        assert_eq!(ranked[1].completed_courses, 2);
        assert_eq!(most_improved(&records, 1).len(), 1);
    }

    #[test]
    fn student_records_come_newest_first() {
        let tracker = tracker();
        let mut attempts = three_attempts().attempts().to_vec();
        attempts.push(Attempt::new("S1", "C2", 60.0));
        attempts.push(Attempt::new("S2", "C1", 80.0));
        let set = AttemptSet::new(attempts);
        let mut progress = InMemoryRepository::default();
        let mut improvements = InMemoryRepository::default();

        tracker
            .complete(&mut progress, &mut improvements, &set, "S1", "C1", when(3))
            .unwrap();
        tracker
            .complete(&mut progress, &mut improvements, &set, "S1", "C2", when(9))
            .unwrap();
        tracker
            .complete(&mut progress, &mut improvements, &set, "S2", "C1", when(5))
            .unwrap();
        tracker
            .track(&mut progress, "S1", "C3", CompletionStatus::InProgress, 40.0, None)
            .unwrap();

        let records = improvements_for_student(&improvements, "S1");
        let courses: Vec<&str> = records.iter().map(|r| r.course_id.as_str()).collect();
        assert_eq!(courses, vec!["C2", "C1"]);

        let tracked = progress_for_student(&progress, "S1");
        let statuses: Vec<(&str, CompletionStatus)> =
            tracked.iter().map(|p| (p.course_id.as_str(), p.status)).collect();
        assert_eq!(
            statuses,
            vec![
                ("C1", CompletionStatus::Completed),
                ("C2", CompletionStatus::Completed),
                ("C3", CompletionStatus::InProgress),
            ]
        );
        assert!(improvements_for_student(&improvements, "S9").is_empty());
    }

    #[test]
    fn progress_only_covers_repeated_courses() {
        let mut attempts = three_attempts().attempts().to_vec();
        attempts.push(Attempt::new("S1", "C2", 55.0));
        let snapshots = course_progress(&AttemptSet::new(attempts));
        assert_eq!(snapshots.len(), 1);
        assert_eq!(snapshots[0].baseline_score, 70.0);
        assert_eq!(snapshots[0].current_score, 90.0);
        assert_eq!(snapshots[0].improvement, 20.0);
    }

    #[test]
    fn overall_improvement_counts_courses() {
        let set = AttemptSet::new(vec![
            Attempt::new("S1", "C1", 50.0),
            Attempt::new("S1", "C1", 70.0),
            Attempt::new("S1", "C2", 80.0),
            Attempt::new("S1", "C2", 74.0),
            Attempt::new("S1", "C3", 60.0),
        ]);
        let overall = overall_improvement(&set, "S1").unwrap();
        assert_eq!(overall.courses.len(), 2);
        assert_eq!(overall.improved_courses, 1);
        assert_eq!(overall.declined_courses, 1);
        assert_eq!(overall.average_change, 7.0);
        assert_eq!(overall.trend, Trend::Increasing);
        assert!(overall_improvement(&set, "nobody").is_err());
    }

    #[test]
    fn forecast_extends_a_straight_line() {
        let set = AttemptSet::new(vec![
            Attempt::new("S1", "C1", 50.0),
            Attempt::new("S1", "C1", 60.0),
            Attempt::new("S1", "C2", 70.0),
        ]);
        match forecast_next_score(&set, "S1").unwrap() {
            ScoreForecast::Forecast {
                predicted_score,
                slope,
                r_squared,
                trend,
                ..
            } => {
                assert_relative_eq!(predicted_score, 80.0, epsilon = 1e-6);
                assert_relative_eq!(slope, 10.0, epsilon = 1e-6);
                assert_relative_eq!(r_squared, 1.0, epsilon = 1e-6);
                assert_eq!(trend, Trend::Increasing);
            }
            other => panic!("unexpected forecast: {other:?}"),
        }
    }

    #[test]
    fn forecast_needs_two_attempts() {
        let set = AttemptSet::new(vec![Attempt::new("S1", "C1", 50.0)]);
        assert_eq!(
            forecast_next_score(&set, "S1").unwrap(),
            ScoreForecast::Insufficient { attempts: 1 }
        );
    }

    #[test]
    fn transitions_out_of_abandoned_are_rejected() {
        use CompletionStatus::*;
        assert!(!Abandoned.can_move_to(InProgress));
        assert!(!Completed.can_move_to(InProgress));
        assert!(Completed.can_move_to(Completed));
        assert!(Recommended.can_move_to(InProgress));
    }
}
