//! Storage boundary. The engine only talks to [`Repository`]; callers choose
//! where entities actually live.

use std::collections::BTreeMap;
use std::fmt::Debug;

use uuid::Uuid;

use crate::improvement::CourseProgress;
use crate::model::{ImprovementRecord, Pairing, Recommendation};

pub trait Entity: Clone {
    type Key: Ord + Clone + Debug;

    fn key(&self) -> Self::Key;
}

impl Entity for Recommendation {
    type Key = (String, String);

    fn key(&self) -> Self::Key {
        (self.student_id.clone(), self.course_id.clone())
    }
}

impl Entity for Pairing {
    /// (course, weak student, mentor)
    type Key = (String, String, String);

    fn key(&self) -> Self::Key {
        (
            self.course_id.clone(),
            self.weak_student_id.clone(),
            self.mentor_id.clone(),
        )
    }
}

impl Entity for ImprovementRecord {
    type Key = Uuid;

    fn key(&self) -> Self::Key {
        self.record_id
    }
}

impl Entity for CourseProgress {
    type Key = (String, String);

    fn key(&self) -> Self::Key {
        (self.student_id.clone(), self.course_id.clone())
    }
}

pub trait Repository<E: Entity> {
    fn load(&self, key: &E::Key) -> Option<E>;

    /// Inserts unless an entity with the same key exists. Returns whether the
    /// entity was stored.
    fn save(&mut self, entity: E) -> bool;

    /// Inserts or overwrites.
    fn replace(&mut self, entity: E);

    fn query(&self, predicate: &dyn Fn(&E) -> bool) -> Vec<E>;

    /// Removes every matching entity and returns how many were removed.
    fn delete(&mut self, predicate: &dyn Fn(&E) -> bool) -> usize;
}

#[derive(Debug, Clone)]
pub struct InMemoryRepository<E: Entity> {
    rows: BTreeMap<E::Key, E>,
}

impl<E: Entity> Default for InMemoryRepository<E> {
    fn default() -> Self {
        Self {
            rows: BTreeMap::new(),
        }
    }
}

impl<E: Entity> InMemoryRepository<E> {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn all(&self) -> Vec<E> {
        self.rows.values().cloned().collect()
    }
}

impl<E: Entity> Repository<E> for InMemoryRepository<E> {
    fn load(&self, key: &E::Key) -> Option<E> {
        self.rows.get(key).cloned()
    }

    fn save(&mut self, entity: E) -> bool {
        let key = entity.key();
        if self.rows.contains_key(&key) {
            return false;
        }
        self.rows.insert(key, entity);
        true
    }

    fn replace(&mut self, entity: E) {
        self.rows.insert(entity.key(), entity);
    }

    fn query(&self, predicate: &dyn Fn(&E) -> bool) -> Vec<E> {
        self.rows.values().filter(|e| predicate(e)).cloned().collect()
    }

    fn delete(&mut self, predicate: &dyn Fn(&E) -> bool) -> usize {
        let before = self.rows.len();
        self.rows.retain(|_, e| !predicate(e));
        before - self.rows.len()
    }
}

/// Every table the engine writes to.
#[derive(Debug, Clone, Default)]
pub struct Database {
    pub recommendations: InMemoryRepository<Recommendation>,
    pub pairings: InMemoryRepository<Pairing>,
    pub improvements: InMemoryRepository<ImprovementRecord>,
    pub progress: InMemoryRepository<CourseProgress>,
}

impl Database {
    pub fn new() -> Self {
        Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pairing(mentor: &str, score: f64) -> Pairing {
        Pairing {
            course_id: "C1".to_string(),
            weak_student_id: "S1".to_string(),
            mentor_id: mentor.to_string(),
            compatibility_score: score,
        }
    }

    #[test]
    fn duplicate_saves_are_ignored() {
        let mut repo = InMemoryRepository::default();
        assert!(repo.save(pairing("M1", 80.0)));
        assert!(!repo.save(pairing("M1", 95.0)));
        assert_eq!(repo.len(), 1);
        let key = ("C1".to_string(), "S1".to_string(), "M1".to_string());
        assert_eq!(repo.load(&key).unwrap().compatibility_score, 80.0);
    }

    #[test]
    fn replace_overwrites() {
        let mut repo = InMemoryRepository::default();
        repo.replace(pairing("M1", 80.0));
        repo.replace(pairing("M1", 95.0));
        assert_eq!(repo.all()[0].compatibility_score, 95.0);
    }

    #[test]
    fn query_and_delete_by_predicate() {
        let mut repo = InMemoryRepository::default();
        repo.save(pairing("M1", 80.0));
        repo.save(pairing("M2", 60.0));
        repo.save(pairing("M3", 90.0));
        assert_eq!(repo.query(&|p| p.compatibility_score > 70.0).len(), 2);
        assert_eq!(repo.delete(&|p| p.mentor_id == "M2"), 1);
        assert_eq!(repo.len(), 2);
    }
}
