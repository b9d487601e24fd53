//! Pairs struggling students with strong performers.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};

use tracing::{debug, info};

use crate::aggregate::AttemptSet;
use crate::analytics::PerformanceAnalyzer;
use crate::config::{CompatibilityBand, EngineConfig};
use crate::database::Repository;
use crate::error::Result;
use crate::model::{
    ClassifiedSummary, CoursePairing, CourseSummary, MentorMatch, MentorSlot, Pairing,
    PerformanceLabel,
};
use crate::similarity::ScoreMatrix;

/// `base + gap_weight × (mentor_avg − weak_avg)`, kept inside the band.
pub fn compatibility(mentor_avg: f64, weak_avg: f64, band: &CompatibilityBand) -> f64 {
    let raw = band.base + band.gap_weight * (mentor_avg - weak_avg);
    raw.max(band.min).min(band.max)
}

fn descending(a: f64, b: f64) -> Ordering {
    b.partial_cmp(&a).unwrap_or(Ordering::Equal)
}

/// Index-wise pairing inside each course: the i-th Low summary gets the i-th
/// High summary, leftovers go on the waitlist.
pub fn pair_within_courses(classified: &[ClassifiedSummary]) -> Vec<CoursePairing> {
    let mut courses: BTreeMap<&str, (Vec<&CourseSummary>, Vec<&CourseSummary>)> = BTreeMap::new();
    for entry in classified {
        let (mentors, mentees) = courses.entry(entry.summary.course_id.as_str()).or_default();
        match entry.label {
            PerformanceLabel::High => mentors.push(&entry.summary),
            PerformanceLabel::Low => mentees.push(&entry.summary),
            PerformanceLabel::Medium => {}
        }
    }

    let mut pairings = Vec::new();
    for (course_id, (mentors, mentees)) in courses {
        for (i, mentee) in mentees.iter().enumerate() {
            let mentor = match mentors.get(i) {
                Some(mentor) => MentorSlot::Assigned {
                    student_id: mentor.student_id.clone(),
                    name: mentor.student_name.clone(),
                },
                None => MentorSlot::Waitlist,
            };
            pairings.push(CoursePairing {
                course_id: course_id.to_string(),
                course_name: mentee.course_name.clone(),
                mentee_id: mentee.student_id.clone(),
                mentee_name: mentee.student_name.clone(),
                mentor,
            });
        }
    }
    pairings
}

pub struct MentorMatcher {
    analyzer: PerformanceAnalyzer,
    strong_average: f64,
    weak_average: f64,
    peer_strong_percentage: f64,
    mentor_candidates: usize,
    max_mentor_matches: usize,
    mentor_pool_size: usize,
    mentors_per_course: usize,
    band: CompatibilityBand,
}

impl MentorMatcher {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            analyzer: PerformanceAnalyzer::new(config),
            strong_average: config.strong_average,
            weak_average: config.weak_average,
            peer_strong_percentage: config.peer_strong_percentage,
            mentor_candidates: config.mentor_candidates,
            max_mentor_matches: config.max_mentor_matches,
            mentor_pool_size: config.mentor_pool_size,
            mentors_per_course: config.mentors_per_course,
            band: config.compatibility,
        }
    }

    /// Mentors ranked by `similarity × courses_mentored` among the weak
    /// student's most similar peers. Ties go to the lower mentor id.
    pub fn match_by_similarity(
        &self,
        set: &AttemptSet,
        weak_student_id: &str,
    ) -> Result<Vec<MentorMatch>> {
        let analysis = self.analyzer.analyze_student(set, weak_student_id)?;
        if analysis.weaknesses.is_empty() {
            return Ok(Vec::new());
        }

        let matrix = ScoreMatrix::from_attempts(set);
        let mut matches: Vec<MentorMatch> = matrix
            .nearest(weak_student_id, self.mentor_candidates)
            .into_iter()
            .filter_map(|peer| {
                let courses_mentored = analysis
                    .weaknesses
                    .iter()
                    .filter(|w| {
                        set.for_student_course(&peer.student_id, &w.course_id)
                            .iter()
                            .any(|a| a.percentage() > self.peer_strong_percentage)
                    })
                    .count();
                if courses_mentored == 0 {
                    return None;
                }
                Some(MentorMatch {
                    mentor_name: set
                        .student_name(&peer.student_id)
                        .unwrap_or(&peer.student_id)
                        .to_string(),
                    mentor_id: peer.student_id,
                    similarity_score: peer.similarity,
                    courses_mentored,
                    match_quality: peer.similarity * courses_mentored as f64,
                })
            })
            .collect();

        matches.sort_by(|a, b| {
            descending(a.match_quality, b.match_quality).then_with(|| a.mentor_id.cmp(&b.mentor_id))
        });
        matches.truncate(self.max_mentor_matches);
        Ok(matches)
    }

    /// Stores a pairing unless the triple exists or the weak student already
    /// has a full set of mentors for the course.
    pub fn assign<R: Repository<Pairing>>(&self, repo: &mut R, pairing: Pairing) -> bool {
        let assigned = repo
            .query(&|p| {
                p.course_id == pairing.course_id && p.weak_student_id == pairing.weak_student_id
            })
            .len();
        if assigned >= self.mentors_per_course {
            return false;
        }
        repo.save(pairing)
    }

    /// Per-course pairings for every student whose overall average is weak.
    /// Returns the pairings stored by this run.
    pub fn generate_pairings<R: Repository<Pairing>>(
        &self,
        repo: &mut R,
        set: &AttemptSet,
    ) -> Vec<Pairing> {
        let summaries = set.summaries();
        let mut by_course: HashMap<&str, Vec<&CourseSummary>> = HashMap::new();
        for summary in &summaries {
            by_course.entry(summary.course_id.as_str()).or_default().push(summary);
        }

        let mut stored = Vec::new();
        for student_id in set.student_ids() {
            let attempts = set.for_student(student_id);
            let overall = attempts.iter().map(|a| a.score).sum::<f64>() / attempts.len() as f64;
            if overall >= self.weak_average {
                continue;
            }

            let mut weak_courses: Vec<&CourseSummary> = summaries
                .iter()
                .filter(|s| s.student_id == student_id && s.average_score < self.weak_average)
                .collect();
            weak_courses.sort_by(|a, b| {
                a.average_score
                    .partial_cmp(&b.average_score)
                    .unwrap_or(Ordering::Equal)
                    .then_with(|| a.course_id.cmp(&b.course_id))
            });

            for course in weak_courses {
                let mut mentors: Vec<&CourseSummary> = by_course
                    .get(course.course_id.as_str())
                    .map(|all| {
                        all.iter()
                            .copied()
                            .filter(|s| {
                                s.student_id != student_id
                                    && s.average_score >= self.strong_average
                            })
                            .collect()
                    })
                    .unwrap_or_default();
                mentors.sort_by(|a, b| {
                    descending(a.average_score, b.average_score)
                        .then_with(|| a.student_id.cmp(&b.student_id))
                });

                for mentor in mentors.into_iter().take(self.mentor_pool_size) {
                    let pairing = Pairing {
                        course_id: course.course_id.clone(),
                        weak_student_id: student_id.to_string(),
                        mentor_id: mentor.student_id.clone(),
                        compatibility_score: compatibility(
                            mentor.average_score,
                            course.average_score,
                            &self.band,
                        ),
                    };
                    if self.assign(repo, pairing.clone()) {
                        stored.push(pairing);
                    }
                }
            }
            debug!(student_id, overall, "paired weak student");
        }

        info!(stored = stored.len(), "generated mentor pairings");
        stored
    }
}

/// Pairings where the student is the mentee, best compatibility first.
pub fn pairings_for_mentee<R: Repository<Pairing>>(repo: &R, student_id: &str) -> Vec<Pairing> {
    let mut pairings = repo.query(&|p| p.weak_student_id == student_id);
    pairings.sort_by(|a, b| descending(a.compatibility_score, b.compatibility_score));
    pairings
}

pub fn mentees_for_mentor<R: Repository<Pairing>>(repo: &R, mentor_id: &str) -> Vec<Pairing> {
    let mut pairings = repo.query(&|p| p.mentor_id == mentor_id);
    pairings.sort_by(|a, b| descending(a.compatibility_score, b.compatibility_score));
    pairings
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::{classify_summaries, RuleClassifier};
    use crate::database::InMemoryRepository;
    use crate::model::Attempt;
    use proptest::prelude::*;

    fn matcher() -> MentorMatcher {
        MentorMatcher::new(&EngineConfig::default())
    }

    #[test]
    fn compatibility_is_clamped() {
        let band = CompatibilityBand::default();
        assert_eq!(compatibility(100.0, 0.0, &band), 100.0);
        assert_eq!(compatibility(0.0, 100.0, &band), 50.0);
        assert_eq!(compatibility(80.0, 50.0, &band), 85.0);
    }

    #[test]
    fn three_weak_one_strong_gives_one_pair_and_two_waitlisted() {
        let set = AttemptSet::new(vec![
            Attempt::new("S1", "C1", 40.0),
            Attempt::new("S2", "C1", 35.0),
            Attempt::new("S3", "C1", 20.0),
            Attempt::new("S4", "C1", 95.0),
            Attempt::new("S5", "C1", 70.0),
        ]);
        let classified = classify_summaries(&set.summaries(), &RuleClassifier::default());
        let pairings = pair_within_courses(&classified);

        assert_eq!(pairings.len(), 3);
        assert_eq!(
            pairings[0].mentor,
            MentorSlot::Assigned {
                student_id: "S4".to_string(),
                name: "S4".to_string()
            }
        );
        assert_eq!(pairings[0].mentee_id, "S1");
        assert!(pairings[1..].iter().all(|p| p.mentor == MentorSlot::Waitlist));
    }

    #[test]
    fn similarity_matches_rank_by_quality_then_id() {
        let set = AttemptSet::new(vec![
            Attempt::new("W", "C1", 40.0),
            Attempt::new("W", "C2", 45.0),
            Attempt::new("M2", "C1", 80.0),
            Attempt::new("M2", "C2", 90.0),
            Attempt::new("M1", "C1", 80.0),
            Attempt::new("M1", "C2", 90.0),
            Attempt::new("M3", "C1", 90.0),
            Attempt::new("M3", "C2", 50.0),
            Attempt::new("X", "C1", 30.0),
        ]);
        let matches = matcher().match_by_similarity(&set, "W").unwrap();
        let ids: Vec<&str> = matches.iter().map(|m| m.mentor_id.as_str()).collect();
        assert_eq!(ids, vec!["M1", "M2", "M3"]);
        assert_eq!(matches[0].courses_mentored, 2);
        assert_eq!(matches[2].courses_mentored, 1);
        assert!(matches[0].match_quality > matches[2].match_quality);
    }

    #[test]
    fn similarity_matches_are_truncated_to_five() {
        let mut attempts = vec![Attempt::new("W", "C1", 40.0), Attempt::new("W", "C2", 40.0)];
        for i in 1..=7 {
            let mentor = format!("M{i}");
            attempts.push(Attempt::new(&mentor, "C1", 90.0));
            attempts.push(Attempt::new(&mentor, "C2", 90.0));
        }
        let matches = matcher().match_by_similarity(&AttemptSet::new(attempts), "W").unwrap();
        let ids: Vec<&str> = matches.iter().map(|m| m.mentor_id.as_str()).collect();
        assert_eq!(ids, vec!["M1", "M2", "M3", "M4", "M5"]);
    }

    #[test]
    fn only_the_ten_most_similar_students_are_considered() {
        // Ten exact profile matches who are not strong anywhere crowd out a
        // slightly less similar student who is strong in every weak course.
        let mut attempts = Vec::new();
        for course in ["C1", "C2", "C3"] {
            attempts.push(Attempt::new("W", course, 40.0));
            for i in 0..10 {
                attempts.push(Attempt::new(&format!("A{i:02}"), course, 70.0));
            }
        }
        attempts.push(Attempt::new("B", "C1", 100.0));
        attempts.push(Attempt::new("B", "C2", 80.0));
        attempts.push(Attempt::new("B", "C3", 80.0));
        let set = AttemptSet::new(attempts);

        assert!(matcher().match_by_similarity(&set, "W").unwrap().is_empty());

        let wider = MentorMatcher::new(&EngineConfig {
            mentor_candidates: 11,
            ..EngineConfig::default()
        });
        let matches = wider.match_by_similarity(&set, "W").unwrap();
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].mentor_id, "B");
        assert_eq!(matches[0].courses_mentored, 3);
    }

    #[test]
    fn pairings_are_capped_and_idempotent() {
        let set = AttemptSet::new(vec![
            Attempt::new("W", "C1", 40.0),
            Attempt::new("M1", "C1", 95.0),
            Attempt::new("M2", "C1", 85.0),
            Attempt::new("M3", "C1", 80.0),
            Attempt::new("N", "C1", 65.0),
        ]);
        let matcher = matcher();
        let mut repo = InMemoryRepository::default();

        let first = matcher.generate_pairings(&mut repo, &set);
        assert_eq!(first.len(), 2);
        assert_eq!(first[0].mentor_id, "M1");
        assert_eq!(first[0].compatibility_score, 97.5);
        assert_eq!(first[1].mentor_id, "M2");

        let second = matcher.generate_pairings(&mut repo, &set);
        assert!(second.is_empty());
        assert_eq!(repo.len(), 2);
        assert_eq!(pairings_for_mentee(&repo, "W")[0].mentor_id, "M1");
        assert_eq!(mentees_for_mentor(&repo, "M2").len(), 1);
    }

    #[test]
    fn third_mentor_is_ignored() {
        let matcher = matcher();
        let mut repo = InMemoryRepository::default();
        for mentor in ["M1", "M2", "M3"] {
            matcher.assign(
                &mut repo,
                Pairing {
                    course_id: "C1".to_string(),
                    weak_student_id: "W".to_string(),
                    mentor_id: mentor.to_string(),
                    compatibility_score: 80.0,
                },
            );
        }
        assert_eq!(repo.len(), 2);
    }

    proptest! {
        #[test]
        fn compatibility_stays_in_band(mentor in -1000.0f64..1000.0, weak in -1000.0f64..1000.0) {
            let score = compatibility(mentor, weak, &CompatibilityBand::default());
            prop_assert!((50.0..=100.0).contains(&score));
        }
    }
}
