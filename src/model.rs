use std::fmt;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum PerformanceLabel {
    #[serde(alias = "Poor")]
    Low,
    Medium,
    High,
}

impl PerformanceLabel {
    /// Labels ordered from the lowest tier up.
    pub const ASCENDING: [PerformanceLabel; 3] = [Self::Low, Self::Medium, Self::High];
}

impl fmt::Display for PerformanceLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Low => "Low",
            Self::Medium => "Medium",
            Self::High => "High",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Priority {
    High,
    Medium,
    Low,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Trend {
    Increasing,
    Decreasing,
    Stable,
}

impl Trend {
    /// Classifies a score change against a symmetric margin.
    pub fn from_change(change: f64, margin: f64) -> Self {
        if change > margin {
            Self::Increasing
        } else if change < -margin {
            Self::Decreasing
        } else {
            Self::Stable
        }
    }
}

/// One scored submission, after identity resolution and score coercion.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Attempt {
    pub student_id: String,
    pub student_name: String,
    pub email: String,
    pub course_id: String,
    pub course_name: String,
    pub attempted_at: Option<NaiveDateTime>,
    pub attempt_number: Option<u32>,
    pub score: f64,
    pub max_score: f64,
    pub grade: Option<String>,
    pub topic_tags: Option<String>,
    pub feedback: Option<String>,
}

impl Attempt {
    pub fn new(student_id: &str, course_id: &str, score: f64) -> Self {
        Self {
            student_id: student_id.to_string(),
            student_name: student_id.to_string(),
            email: String::new(),
            course_id: course_id.to_string(),
            course_name: course_id.to_string(),
            attempted_at: None,
            attempt_number: None,
            score,
            max_score: 100.0,
            grade: None,
            topic_tags: None,
            feedback: None,
        }
    }

    pub fn percentage(&self) -> f64 {
        if self.max_score > 0.0 {
            self.score / self.max_score * 100.0
        } else {
            0.0
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct CourseSummary {
    pub student_id: String,
    pub student_name: String,
    pub email: String,
    pub course_id: String,
    pub course_name: String,
    pub best_score: f64,
    pub average_score: f64,
    pub attempt_count: usize,
    pub score_stddev: f64,
    pub latest_score: f64,
    pub baseline_score: f64,
    pub topic_tags: Option<String>,
    pub feedback: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ClassifiedSummary {
    pub summary: CourseSummary,
    pub label: PerformanceLabel,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct StudentClassification {
    pub student_id: String,
    pub student_name: String,
    pub average_score: f64,
    pub label: PerformanceLabel,
}

/// A course judged on the student's latest attempt.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct CourseStanding {
    pub course_id: String,
    pub course_name: String,
    pub percentage: f64,
    pub latest_score: f64,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ImprovementArea {
    pub course_id: String,
    pub course_name: String,
    pub first_score: f64,
    pub last_score: f64,
    pub change: f64,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct WeaknessAnalysis {
    pub student_id: String,
    pub strengths: Vec<CourseStanding>,
    pub weaknesses: Vec<CourseStanding>,
    pub improvement_areas: Vec<ImprovementArea>,
    pub overall_performance: f64,
    pub performance_trend: Trend,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Recommendation {
    pub student_id: String,
    pub course_id: String,
    pub course_name: String,
    pub recommendation_text: String,
    pub priority: Priority,
    pub suggested_courses: Vec<String>,
    pub current_percentage: f64,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct PeerRecommendation {
    pub course_id: String,
    pub course_name: String,
    pub peer_id: String,
    pub similarity_score: f64,
    pub recommended_because: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Pairing {
    pub course_id: String,
    pub weak_student_id: String,
    pub mentor_id: String,
    pub compatibility_score: f64,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum MentorSlot {
    Assigned { student_id: String, name: String },
    Waitlist,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct CoursePairing {
    pub course_id: String,
    pub course_name: String,
    pub mentee_id: String,
    pub mentee_name: String,
    pub mentor: MentorSlot,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct MentorMatch {
    pub mentor_id: String,
    pub mentor_name: String,
    pub similarity_score: f64,
    pub courses_mentored: usize,
    pub match_quality: f64,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ImprovementRecord {
    pub record_id: Uuid,
    pub student_id: String,
    pub course_id: String,
    pub initial_score: f64,
    pub final_score: f64,
    pub improvement_percentage: f64,
    pub completion_date: NaiveDateTime,
}
