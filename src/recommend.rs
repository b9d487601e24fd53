//! Course recommendations derived from a student's weak courses.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::aggregate::AttemptSet;
use crate::analytics::{course_performance, PerformanceAnalyzer};
use crate::config::EngineConfig;
use crate::database::Repository;
use crate::error::Result;
use crate::model::{PeerRecommendation, PerformanceLabel, Priority, Recommendation};
use crate::similarity::ScoreMatrix;

pub const FALLBACK_COURSE: &str = "General Study Skills Workshop";

/// Subject keyword → suggested course titles. Matching is a loose,
/// case-insensitive substring test in both directions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CourseCatalog {
    entries: Vec<(String, Vec<String>)>,
}

impl Default for CourseCatalog {
    fn default() -> Self {
        let entries = [
            ("Python", ["Python Fundamentals", "Data Structures in Python"]),
            ("Java", ["Java Programming I", "Object Oriented Programming"]),
            ("SQL", ["Database Design", "SQL Masterclass"]),
            ("Data Science", ["Statistics for DS", "Intro to ML"]),
            ("Computer Networks", ["Networking Basics", "TCP/IP Protocols"]),
            ("Math", ["Linear Algebra", "Calculus Refresher"]),
            ("Web Development", ["HTML/CSS Bootcamp", "JavaScript Essentials"]),
            ("Algorithms", ["Algorithms I", "Competitive Programming"]),
            ("Operating Systems", ["OS Concepts", "Linux Admin"]),
            ("Security", ["Cybersecurity Basics", "Ethical Hacking"]),
        ];
        Self::new(
            entries
                .into_iter()
                .map(|(key, courses)| (key.to_string(), courses.map(str::to_string).to_vec()))
                .collect(),
        )
    }
}

impl CourseCatalog {
    pub fn new(entries: Vec<(String, Vec<String>)>) -> Self {
        Self { entries }
    }

    fn matching(&self, subject: &str) -> impl Iterator<Item = &String> {
        let subject = subject.trim().to_lowercase();
        self.entries
            .iter()
            .filter(move |(key, _)| {
                let key = key.to_lowercase();
                !subject.is_empty() && (subject.contains(&key) || key.contains(&subject))
            })
            .flat_map(|(_, courses)| courses.iter())
    }

    /// Suggested titles for a list of weak subjects, without duplicates. A
    /// non-empty list with no catalog match gets the generic workshop.
    pub fn suggest<S: AsRef<str>>(&self, weaknesses: &[S]) -> Vec<String> {
        let mut seen = HashSet::new();
        let mut suggestions = Vec::new();
        for subject in weaknesses {
            for course in self.matching(subject.as_ref()) {
                if seen.insert(course.as_str()) {
                    suggestions.push(course.clone());
                }
            }
        }

        if suggestions.is_empty() && !weaknesses.is_empty() {
            suggestions.push(FALLBACK_COURSE.to_string());
        }
        suggestions
    }
}

/// Weakness in a course whose name mentions `trigger` suggests the best
/// attended courses mentioning any of `foundations`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrerequisiteRule {
    pub trigger: String,
    pub foundations: Vec<String>,
    pub limit: usize,
}

impl PrerequisiteRule {
    pub fn defaults() -> Vec<PrerequisiteRule> {
        vec![PrerequisiteRule {
            trigger: "Machine Learning".to_string(),
            foundations: vec!["Math".to_string(), "Statistics".to_string(), "Data".to_string()],
            limit: 2,
        }]
    }

    fn applies_to(&self, course_name: &str) -> bool {
        course_name.to_lowercase().contains(&self.trigger.to_lowercase())
    }

    fn is_foundation(&self, course_name: &str) -> bool {
        let name = course_name.to_lowercase();
        self.foundations.iter().any(|f| name.contains(&f.to_lowercase()))
    }
}

/// Per-summary action text.
pub fn summary_action(label: PerformanceLabel, course_name: &str) -> String {
    match label {
        PerformanceLabel::Low => format!("Remedial: {course_name} Refresher"),
        PerformanceLabel::Medium => format!("Advanced: {course_name} Plus"),
        PerformanceLabel::High => "Mentorship Program (Become a Mentor)".to_string(),
    }
}

pub struct RecommendationEngine {
    catalog: CourseCatalog,
    prerequisites: Vec<PrerequisiteRule>,
    analyzer: PerformanceAnalyzer,
    peer_neighbors: usize,
    peer_strong_percentage: f64,
    max_peer_recommendations: usize,
}

impl RecommendationEngine {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            catalog: CourseCatalog::default(),
            prerequisites: PrerequisiteRule::defaults(),
            analyzer: PerformanceAnalyzer::new(config),
            peer_neighbors: config.peer_neighbors,
            peer_strong_percentage: config.peer_strong_percentage,
            max_peer_recommendations: config.max_peer_recommendations,
        }
    }

    /// High priority for every weak course, Medium for foundation courses
    /// inferred from prerequisite rules. At most one recommendation per course.
    pub fn recommend(&self, set: &AttemptSet, student_id: &str) -> Result<Vec<Recommendation>> {
        let analysis = self.analyzer.analyze_student(set, student_id)?;
        let mut recommendations = Vec::new();

        for weakness in &analysis.weaknesses {
            let mut text = format!(
                "Study foundational topics in {} to improve performance",
                weakness.course_name
            );
            let tags = set
                .for_student_course(student_id, &weakness.course_id)
                .into_iter()
                .find_map(|a| a.topic_tags.clone());
            if let Some(tags) = tags {
                text.push_str(&format!("; review topics: {tags}"));
            }

            recommendations.push(Recommendation {
                student_id: student_id.to_string(),
                course_id: weakness.course_id.clone(),
                course_name: weakness.course_name.clone(),
                recommendation_text: text,
                priority: Priority::High,
                suggested_courses: self.catalog.suggest(&[weakness.course_name.as_str()]),
                current_percentage: weakness.percentage,
            });
        }

        let courses = course_performance(set);
        for weakness in &analysis.weaknesses {
            for rule in self.prerequisites.iter().filter(|r| r.applies_to(&weakness.course_name)) {
                let foundations = courses
                    .iter()
                    .filter(|c| {
                        c.course_id != weakness.course_id && rule.is_foundation(&c.course_name)
                    })
                    .take(rule.limit);
                for course in foundations {
                    recommendations.push(Recommendation {
                        student_id: student_id.to_string(),
                        course_id: course.course_id.clone(),
                        course_name: course.course_name.clone(),
                        recommendation_text: format!(
                            "Build foundational skills in {} to support {} learning",
                            course.course_name, weakness.course_name
                        ),
                        priority: Priority::Medium,
                        suggested_courses: Vec::new(),
                        current_percentage: weakness.percentage,
                    });
                }
            }
        }

        let mut seen = HashSet::new();
        recommendations.retain(|r| seen.insert(r.course_id.clone()));
        debug!(student_id, count = recommendations.len(), "built recommendations");
        Ok(recommendations)
    }

    /// Courses the student is weak in where one of their most similar peers
    /// is strong, most similar peer first.
    pub fn peer_recommendations(
        &self,
        set: &AttemptSet,
        student_id: &str,
    ) -> Result<Vec<PeerRecommendation>> {
        let analysis = self.analyzer.analyze_student(set, student_id)?;
        if analysis.weaknesses.is_empty() {
            return Ok(Vec::new());
        }

        let matrix = ScoreMatrix::from_attempts(set);
        let mut seen = HashSet::new();
        let mut recommendations = Vec::new();

        for peer in matrix.nearest(student_id, self.peer_neighbors) {
            for weakness in &analysis.weaknesses {
                let peer_best = set
                    .for_student_course(&peer.student_id, &weakness.course_id)
                    .iter()
                    .map(|a| a.percentage())
                    .fold(None, |best: Option<f64>, p| Some(best.map_or(p, |b| b.max(p))));
                let strong = peer_best.is_some_and(|p| p > self.peer_strong_percentage);

                if strong && seen.insert(weakness.course_id.clone()) {
                    recommendations.push(PeerRecommendation {
                        course_id: weakness.course_id.clone(),
                        course_name: weakness.course_name.clone(),
                        peer_id: peer.student_id.clone(),
                        similarity_score: peer.similarity,
                        recommended_because: "Similar students performed well in this course"
                            .to_string(),
                    });
                }
            }
        }

        recommendations.truncate(self.max_peer_recommendations);
        Ok(recommendations)
    }

    /// Replaces every stored recommendation for the student with a fresh set.
    pub fn regenerate<R: Repository<Recommendation>>(
        &self,
        repo: &mut R,
        set: &AttemptSet,
        student_id: &str,
    ) -> Result<Vec<Recommendation>> {
        let fresh = self.recommend(set, student_id)?;
        let cleared = repo.delete(&|r| r.student_id == student_id);
        let stored: Vec<Recommendation> =
            fresh.into_iter().filter(|r| repo.save(r.clone())).collect();
        debug!(student_id, cleared, stored = stored.len(), "regenerated recommendations");
        Ok(stored)
    }

    pub fn regenerate_all<R: Repository<Recommendation>>(
        &self,
        repo: &mut R,
        set: &AttemptSet,
    ) -> Result<usize> {
        let mut total = 0;
        for student_id in set.student_ids() {
            total += self.regenerate(repo, set, student_id)?.len();
        }
        info!(total, "regenerated recommendations for every student");
        Ok(total)
    }
}
