//! Student × course score matrix and cosine similarity between students.

use std::cmp::Ordering;
use std::collections::BTreeSet;

use ndarray::{Array2, ArrayView1, ArrayView2, Axis};
use serde::Serialize;

use crate::aggregate::AttemptSet;

/// Calculate cosine similarity between two score vectors
pub fn cosine_similarity(a: ArrayView1<f64>, b: ArrayView1<f64>) -> f64 {
    if a.len() != b.len() {
        return 0.0;
    }

    let dot_product = a.dot(&b);
    let magnitude_a = a.dot(&a).sqrt();
    let magnitude_b = b.dot(&b).sqrt();

    if magnitude_a == 0.0 || magnitude_b == 0.0 {
        0.0
    } else {
        dot_product / (magnitude_a * magnitude_b)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Peer {
    pub student_id: String,
    pub similarity: f64,
}

/// Rows are students, columns are courses, both sorted by id. A cell holds
/// the student's mean score in that course, 0 when they never attempted it.
#[derive(Debug, Clone)]
pub struct ScoreMatrix {
    students: Vec<String>,
    scores: Array2<f64>,
}

impl ScoreMatrix {
    pub fn from_attempts(set: &AttemptSet) -> Self {
        let students: Vec<String> = set.student_ids().into_iter().map(str::to_string).collect();
        let courses: Vec<&str> = set
            .attempts()
            .iter()
            .map(|a| a.course_id.as_str())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        let mut scores = Array2::zeros((students.len(), courses.len()));
        for ((student_id, course_id), group) in set.groups() {
            let (Ok(row), Ok(col)) = (
                students.binary_search_by(|s| s.as_str().cmp(student_id)),
                courses.binary_search(&course_id),
            ) else {
                continue;
            };
            let total: f64 = group.iter().map(|a| a.score).sum();
            scores[[row, col]] = total / group.len() as f64;
        }

        Self { students, scores }
    }

    pub fn students(&self) -> &[String] {
        &self.students
    }

    pub fn scores(&self) -> ArrayView2<f64> {
        self.scores.view()
    }

    pub fn row_index(&self, student_id: &str) -> Option<usize> {
        self.students
            .binary_search_by(|s| s.as_str().cmp(student_id))
            .ok()
    }

    pub fn row(&self, student_id: &str) -> Option<ArrayView1<f64>> {
        self.row_index(student_id).map(|i| self.scores.row(i))
    }

    /// The `k` students most similar to `student_id`, excluding the student
    /// itself, most similar first with ties broken by student id.
    pub fn nearest(&self, student_id: &str, k: usize) -> Vec<Peer> {
        let Some(target) = self.row(student_id) else {
            return Vec::new();
        };

        let mut peers: Vec<Peer> = self
            .students
            .iter()
            .enumerate()
            .filter(|(_, id)| id.as_str() != student_id)
            .map(|(i, id)| Peer {
                student_id: id.clone(),
                similarity: cosine_similarity(target, self.scores.row(i)),
            })
            .collect();

        peers.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.student_id.cmp(&b.student_id))
        });
        peers.truncate(k);
        peers
    }
}

/// Column-wise z-scores; constant columns are centred but not scaled.
pub fn standardize(features: ArrayView2<f64>) -> Array2<f64> {
    let Some(means) = features.mean_axis(Axis(0)) else {
        return features.to_owned();
    };
    let stds = features
        .std_axis(Axis(0), 0.0)
        .mapv(|s| if s > 0.0 { s } else { 1.0 });
    (&features - &means) / &stds
}
