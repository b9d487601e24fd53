use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;
use tracing::debug;

use crate::aggregate::{chronological, timeline, AttemptSet};
use crate::classifier::ThresholdPolicy;
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::model::{
    Attempt, CourseStanding, ImprovementArea, PerformanceLabel, Trend, WeaknessAnalysis,
};

#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct ClassOverview {
    pub total_students: usize,
    pub total_courses: usize,
    pub total_attempts: usize,
    pub average_score: f64,
    pub min_score: f64,
    pub max_score: f64,
    pub performance_distribution: Vec<LabelCount>,
    pub top_performers: Vec<StudentAverage>,
    pub course_performance: Vec<CoursePerformance>,
}

#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct LabelCount {
    pub label: PerformanceLabel,
    pub count: usize,
}

#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct StudentAverage {
    pub student_id: String,
    pub student_name: String,
    pub average_score: f64,
}

#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct CoursePerformance {
    pub course_id: String,
    pub course_name: String,
    pub average_score: f64,
    pub min_score: f64,
    pub max_score: f64,
    pub attempt_count: usize,
    pub student_count: usize,
}

const TOP_PERFORMERS: usize = 5;

pub struct PerformanceAnalyzer {
    strength_percentage: f64,
    weakness_percentage: f64,
    decline_margin: f64,
    trend_margin: f64,
    thresholds: ThresholdPolicy,
}

impl PerformanceAnalyzer {
    pub fn new(config: &EngineConfig) -> Self {
        PerformanceAnalyzer {
            strength_percentage: config.strength_percentage,
            weakness_percentage: config.weakness_percentage,
            decline_margin: config.decline_margin,
            trend_margin: config.trend_margin,
            thresholds: config.thresholds,
        }
    }

    /// Strengths and weaknesses come from each course's latest attempt, not
    /// its average.
    pub fn analyze_student(&self, set: &AttemptSet, student_id: &str) -> Result<WeaknessAnalysis> {
        let attempts = set.for_student(student_id);
        if attempts.is_empty() {
            return Err(EngineError::UnknownStudent(student_id.to_string()));
        }

        let mut by_course: BTreeMap<&str, Vec<&Attempt>> = BTreeMap::new();
        for attempt in attempts.iter().copied() {
            by_course.entry(attempt.course_id.as_str()).or_default().push(attempt);
        }

        let mut strengths = Vec::new();
        let mut weaknesses = Vec::new();
        let mut improvement_areas = Vec::new();
        let mut course_average_total = 0.0;
        let mut courses = 0usize;

        for group in by_course.into_values() {
            let ordered = chronological(group);
            let (Some(first), Some(latest)) = (ordered.first(), ordered.last()) else {
                continue;
            };

            let percentage = latest.percentage();
            let standing = CourseStanding {
                course_id: latest.course_id.clone(),
                course_name: latest.course_name.clone(),
                percentage,
                latest_score: latest.score,
            };
            if percentage >= self.strength_percentage {
                strengths.push(standing);
            } else if percentage < self.weakness_percentage {
                weaknesses.push(standing);
            }

            if ordered.len() >= 2 {
                let change = latest.score - first.score;
                if change < -self.decline_margin {
                    improvement_areas.push(ImprovementArea {
                        course_id: latest.course_id.clone(),
                        course_name: latest.course_name.clone(),
                        first_score: first.score,
                        last_score: latest.score,
                        change,
                    });
                }
            }

            let total: f64 = ordered.iter().map(|a| a.score).sum();
            course_average_total += total / ordered.len() as f64;
            courses += 1;
        }

        let overall_performance = if courses == 0 {
            0.0
        } else {
            course_average_total / courses as f64
        };

        let ordered = timeline(attempts);
        let change = match (ordered.first(), ordered.last()) {
            (Some(first), Some(last)) => last.score - first.score,
            _ => 0.0,
        };

        debug!(
            student_id,
            strengths = strengths.len(),
            weaknesses = weaknesses.len(),
            "analyzed student"
        );

        Ok(WeaknessAnalysis {
            student_id: student_id.to_string(),
            strengths,
            weaknesses,
            improvement_areas,
            overall_performance,
            performance_trend: Trend::from_change(change, self.trend_margin),
        })
    }

    pub fn class_overview(&self, set: &AttemptSet) -> ClassOverview {
        let scores: Vec<f64> = set.attempts().iter().map(|a| a.score).collect();
        let (average_score, min_score, max_score) = if scores.is_empty() {
            (0.0, 0.0, 0.0)
        } else {
            (
                scores.iter().sum::<f64>() / scores.len() as f64,
                scores.iter().copied().fold(f64::INFINITY, f64::min),
                scores.iter().copied().fold(f64::NEG_INFINITY, f64::max),
            )
        };

        let mut students: Vec<StudentAverage> = set
            .student_ids()
            .into_iter()
            .map(|student_id| {
                let attempts = set.for_student(student_id);
                StudentAverage {
                    student_id: student_id.to_string(),
                    student_name: set.student_name(student_id).unwrap_or(student_id).to_string(),
                    average_score: attempts.iter().map(|a| a.score).sum::<f64>()
                        / attempts.len() as f64,
                }
            })
            .collect();

        let performance_distribution = PerformanceLabel::ASCENDING
            .iter()
            .map(|&label| LabelCount {
                label,
                count: students
                    .iter()
                    .filter(|s| self.thresholds.label(s.average_score) == label)
                    .count(),
            })
            .collect();

        students.sort_by(|a, b| {
            b.average_score
                .partial_cmp(&a.average_score)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.student_id.cmp(&b.student_id))
        });
        let total_students = students.len();
        students.truncate(TOP_PERFORMERS);

        let course_performance = course_performance(set);

        ClassOverview {
            total_students,
            total_courses: course_performance.len(),
            total_attempts: set.len(),
            average_score,
            min_score,
            max_score,
            performance_distribution,
            top_performers: students,
            course_performance,
        }
    }
}

/// Per-course statistics, best average first.
pub fn course_performance(set: &AttemptSet) -> Vec<CoursePerformance> {
    let mut by_course: BTreeMap<&str, Vec<&Attempt>> = BTreeMap::new();
    for attempt in set.attempts() {
        by_course.entry(attempt.course_id.as_str()).or_default().push(attempt);
    }

    let mut courses: Vec<CoursePerformance> = by_course
        .into_iter()
        .map(|(course_id, attempts)| {
            let scores = attempts.iter().map(|a| a.score);
            let student_count = attempts
                .iter()
                .map(|a| a.student_id.as_str())
                .collect::<BTreeSet<_>>()
                .len();
            CoursePerformance {
                course_id: course_id.to_string(),
                course_name: attempts[0].course_name.clone(),
                average_score: scores.clone().sum::<f64>() / attempts.len() as f64,
                min_score: scores.clone().fold(f64::INFINITY, f64::min),
                max_score: scores.fold(f64::NEG_INFINITY, f64::max),
                attempt_count: attempts.len(),
                student_count,
            }
        })
        .collect();

    courses.sort_by(|a, b| {
        b.average_score
            .partial_cmp(&a.average_score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.course_id.cmp(&b.course_id))
    });
    courses
}
