use std::collections::HashMap;
use std::io::Read;
use std::path::Path;

use chrono::{NaiveDate, NaiveDateTime};
use csv::{ReaderBuilder, StringRecord};
use serde::de::IgnoredAny;
use serde::{Deserialize, Deserializer, Serialize};
use tracing::{debug, info, warn};

use crate::error::{EngineError, Result};

pub const DEFAULT_FEEDBACK: &str = "No feedback available.";

/// An attempt as it arrives from an upload, before validation.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
#[serde(default)]
pub struct AttemptRow {
    pub student_id: Option<String>,
    pub student_name: Option<String>,
    pub email: Option<String>,
    pub course_id: Option<String>,
    pub course_name: Option<String>,
    pub attempt_timestamp: Option<NaiveDateTime>,
    pub attempt_number: Option<u32>,
    /// `None` when the field is absent, `Some(None)` when it is present but
    /// empty or not a number.
    #[serde(deserialize_with = "present_number")]
    pub score: Option<Option<f64>>,
    #[serde(deserialize_with = "lenient_number")]
    pub max_score: Option<f64>,
    pub grade: Option<String>,
    pub topic_tags: Option<String>,
    pub feedback: Option<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawNumber {
    Number(f64),
    Text(String),
    Other(IgnoredAny),
}

/// Accepts numbers and numeric strings; anything else reads as `None`.
fn lenient_number<'de, D>(deserializer: D) -> std::result::Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = match RawNumber::deserialize(deserializer)? {
        RawNumber::Number(value) => Some(value),
        RawNumber::Text(text) => text.trim().parse::<f64>().ok(),
        RawNumber::Other(_) => None,
    };
    Ok(value.filter(|v| v.is_finite()))
}

fn present_number<'de, D>(deserializer: D) -> std::result::Result<Option<Option<f64>>, D::Error>
where
    D: Deserializer<'de>,
{
    lenient_number(deserializer).map(Some)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Column {
    StudentId,
    StudentName,
    Email,
    CourseId,
    CourseName,
    Timestamp,
    AttemptNumber,
    Score,
    MaxScore,
    Grade,
    TopicTags,
    Feedback,
}

const ALIASES: &[(&str, Column)] = &[
    ("student_id", Column::StudentId),
    ("candidate_id", Column::StudentId),
    ("name", Column::StudentName),
    ("student_name", Column::StudentName),
    ("candidate_name", Column::StudentName),
    ("email", Column::Email),
    ("student_email", Column::Email),
    ("candidate_email", Column::Email),
    ("course_id", Column::CourseId),
    ("course_code", Column::CourseId),
    ("course_name", Column::CourseName),
    ("course", Column::CourseName),
    ("subject", Column::CourseName),
    ("attempt_timestamp", Column::Timestamp),
    ("attempt_date", Column::Timestamp),
    ("timestamp", Column::Timestamp),
    ("attempt_id", Column::AttemptNumber),
    ("attempt_number", Column::AttemptNumber),
    ("attempt", Column::AttemptNumber),
    ("score", Column::Score),
    ("mark", Column::Score),
    ("marks", Column::Score),
    ("max_score", Column::MaxScore),
    ("total_marks", Column::MaxScore),
    ("out_of", Column::MaxScore),
    ("grade", Column::Grade),
    ("topic_tags", Column::TopicTags),
    ("topics", Column::TopicTags),
    ("feedback", Column::Feedback),
];

pub fn normalize_header(header: &str) -> String {
    header.trim().to_lowercase().replace(' ', "_")
}

/// Maps CSV headers onto attempt columns.
#[derive(Debug, Clone)]
pub struct ColumnMap {
    positions: HashMap<Column, usize>,
}

impl ColumnMap {
    pub fn from_headers(headers: &StringRecord) -> Result<Self> {
        let mut positions = HashMap::new();

        for (index, raw) in headers.iter().enumerate() {
            let header = normalize_header(raw);
            match ALIASES.iter().find(|(alias, _)| *alias == header) {
                Some((_, column)) => {
                    if positions.contains_key(column) {
                        warn!(
                            header = %raw,
                            "duplicate column for the same field, keeping the first"
                        );
                    } else {
                        positions.insert(*column, index);
                    }
                }
                None => debug!(header = %raw, "ignoring unrecognized column"),
            }
        }

        let mut missing = Vec::new();
        let has = |c: Column| positions.contains_key(&c);
        if !(has(Column::StudentId) || has(Column::Email) || has(Column::StudentName)) {
            missing.push("student identifier");
        }
        if !(has(Column::CourseId) || has(Column::CourseName)) {
            missing.push("course identifier");
        }
        if !has(Column::Score) {
            missing.push("score");
        }

        if !missing.is_empty() {
            return Err(EngineError::UnrecognizedSchema {
                missing,
                headers: headers.iter().map(str::to_string).collect(),
            });
        }

        Ok(Self { positions })
    }

    fn text(&self, record: &StringRecord, column: Column) -> Option<String> {
        let index = *self.positions.get(&column)?;
        let value = record.get(index)?.trim();
        if value.is_empty() {
            None
        } else {
            Some(value.to_string())
        }
    }

    fn number(&self, record: &StringRecord, column: Column) -> Option<f64> {
        self.text(record, column)?
            .parse::<f64>()
            .ok()
            .filter(|value| value.is_finite())
    }

    pub fn row(&self, record: &StringRecord) -> AttemptRow {
        AttemptRow {
            student_id: self.text(record, Column::StudentId),
            student_name: self.text(record, Column::StudentName),
            email: self.text(record, Column::Email),
            course_id: self.text(record, Column::CourseId),
            course_name: self.text(record, Column::CourseName),
            attempt_timestamp: self
                .text(record, Column::Timestamp)
                .and_then(|value| parse_timestamp(&value)),
            attempt_number: self
                .text(record, Column::AttemptNumber)
                .and_then(|value| parse_attempt_number(&value)),
            score: Some(self.number(record, Column::Score)),
            max_score: self.number(record, Column::MaxScore),
            grade: self.text(record, Column::Grade),
            topic_tags: self.text(record, Column::TopicTags),
            feedback: self.text(record, Column::Feedback),
        }
    }
}

pub fn parse_timestamp(value: &str) -> Option<NaiveDateTime> {
    const FORMATS: [&str; 4] = [
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%dT%H:%M:%S",
        "%Y-%m-%d %H:%M",
        "%Y-%m-%dT%H:%M:%S%.f",
    ];
    FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(value, format).ok())
        .or_else(|| {
            NaiveDate::parse_from_str(value, "%Y-%m-%d")
                .ok()
                .and_then(|date| date.and_hms_opt(0, 0, 0))
        })
}

/// Attempt ids such as `A3` or `attempt-2` carry their sequence in the trailing digits.
fn parse_attempt_number(value: &str) -> Option<u32> {
    let digits: String = value
        .chars()
        .rev()
        .take_while(|c| c.is_ascii_digit())
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    digits.parse().ok()
}

pub fn load_attempts<R: Read>(reader: R) -> Result<Vec<AttemptRow>> {
    let mut rdr = ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(reader);
    let columns = ColumnMap::from_headers(rdr.headers()?)?;
    let mut rows = Vec::new();

    for result in rdr.records() {
        let record = result?;
        rows.push(columns.row(&record));
    }

    let malformed = rows.iter().filter(|row| row.score.flatten().is_none()).count();
    if malformed > 0 {
        warn!(malformed, "rows with a missing or non-numeric score");
    }
    info!(rows = rows.len(), "loaded attempt rows");
    Ok(rows)
}

pub fn load_attempts_from_path(path: impl AsRef<Path>) -> Result<Vec<AttemptRow>> {
    let file = std::fs::File::open(path)?;
    load_attempts(file)
}

/// Reads a student id to feedback table, keeping the last entry per student.
pub fn load_feedback<R: Read>(reader: R) -> Result<HashMap<String, String>> {
    let mut rdr = ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(reader);
    let headers = rdr.headers()?.clone();
    let position = |wanted: Column| {
        headers.iter().position(|raw| {
            let header = normalize_header(raw);
            ALIASES
                .iter()
                .any(|(alias, column)| *column == wanted && *alias == header)
        })
    };

    let (Some(student), Some(text)) = (position(Column::StudentId), position(Column::Feedback))
    else {
        let mut missing = Vec::new();
        if position(Column::StudentId).is_none() {
            missing.push("student identifier");
        }
        if position(Column::Feedback).is_none() {
            missing.push("feedback");
        }
        return Err(EngineError::UnrecognizedSchema {
            missing,
            headers: headers.iter().map(str::to_string).collect(),
        });
    };

    let mut feedback = HashMap::new();
    for result in rdr.records() {
        let record = result?;
        let id = record.get(student).unwrap_or_default();
        let note = record.get(text).unwrap_or_default();
        if !id.is_empty() && !note.is_empty() {
            feedback.insert(id.to_string(), note.to_string());
        }
    }
    info!(students = feedback.len(), "loaded feedback");
    Ok(feedback)
}

pub fn load_feedback_from_path(path: impl AsRef<Path>) -> Result<HashMap<String, String>> {
    let file = std::fs::File::open(path)?;
    load_feedback(file)
}

/// Left-joins feedback onto rows by student id.
pub fn attach_feedback(rows: &mut [AttemptRow], feedback_by_student: &HashMap<String, String>) {
    for row in rows.iter_mut() {
        if row.feedback.is_some() {
            continue;
        }
        let found = row
            .student_id
            .as_ref()
            .and_then(|id| feedback_by_student.get(id));
        row.feedback = Some(
            found
                .cloned()
                .unwrap_or_else(|| DEFAULT_FEEDBACK.to_string()),
        );
    }
}
