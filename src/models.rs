use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const UNKNOWN: &str = "Unknown";
pub const DELETED_STUDENT: &str = "Deleted student";
pub const NOT_AVAILABLE: &str = "N/A";
pub const RECORD_KEY_PREFIX: &str = "record:";

/// Headcounts keyed by faculty or group name.
pub type PopulationMap = HashMap<String, u32>;

/// One normalized test submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRecord {
    pub id: String,
    /// `None` once the student has been deleted and only the snapshot remains.
    pub student_id: Option<String>,
    pub student_name: String,
    pub student_id_number: Option<String>,
    pub department_name: String,
    pub group_name: String,
    pub total_score: f64,
    pub completed_at: Option<DateTime<Utc>>,
    pub needs_attention: bool,
    pub is_reviewed: bool,
    pub interpretation_level: Option<String>,
}

impl ResultRecord {
    pub fn identity(&self) -> StudentIdentity<'_> {
        match &self.student_id {
            Some(student_id) => StudentIdentity::Student(student_id),
            None => StudentIdentity::Record(&self.id),
        }
    }

    /// Key of the student bucket this record lands in.
    pub fn student_key(&self) -> String {
        self.identity().to_string()
    }

    pub fn has_unresolved_attention(&self) -> bool {
        self.needs_attention && !self.is_reviewed
    }
}

/// Records without a student id cannot be deduplicated, so each one is its
/// own identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StudentIdentity<'a> {
    Student(&'a str),
    Record(&'a str),
}

/// Record-keyed identities carry a prefix so they never collide with a
/// student id.
impl fmt::Display for StudentIdentity<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StudentIdentity::Student(id) => write!(f, "{id}"),
            StudentIdentity::Record(id) => write!(f, "{RECORD_KEY_PREFIX}{id}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Level {
    Faculty,
    Group,
    Student,
}

impl std::fmt::Display for Level {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Level::Faculty => "faculty",
            Level::Group => "group",
            Level::Student => "student",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AggregationNode {
    pub level: Level,
    pub key: String,
    /// Display name; the student's resolved name at the student level.
    pub label: String,
    pub total_population: u32,
    pub unique_completed_count: usize,
    pub record_count: usize,
    pub needs_attention_count: usize,
    pub completion_rate: f64,
    pub children: Vec<AggregationNode>,
    pub records: Vec<ResultRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StudentProfile {
    pub id: String,
    pub full_name: String,
    #[serde(default)]
    pub student_id_number: Option<String>,
    #[serde(default)]
    pub department_name: Option<String>,
    #[serde(default)]
    pub group_name: Option<String>,
    #[serde(default)]
    pub course: Option<i32>,
    #[serde(default)]
    pub semester: Option<i32>,
    #[serde(default)]
    pub avg_gpa: Option<f64>,
    #[serde(default)]
    pub image: Option<String>,
}

impl StudentProfile {
    /// Profile rebuilt from the denormalized fields of a deleted student's record.
    pub fn from_snapshot(record: &ResultRecord) -> Self {
        Self {
            id: record.student_key(),
            full_name: record.student_name.clone(),
            student_id_number: record.student_id_number.clone(),
            department_name: Some(record.department_name.clone()),
            group_name: Some(record.group_name.clone()),
            course: None,
            semester: None,
            avg_gpa: None,
            image: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StudentDetail {
    pub key: String,
    pub profile: StudentProfile,
    /// The student's results for the selected test, newest first.
    pub results: Vec<ResultRecord>,
    pub completed_count: usize,
    pub last_completed_at: Option<DateTime<Utc>>,
    pub dropped: usize,
}

impl StudentDetail {
    pub fn new(key: String, profile: StudentProfile, mut results: Vec<ResultRecord>, dropped: usize) -> Self {
        results.sort_by(|a, b| b.completed_at.cmp(&a.completed_at));
        let last_completed_at = results.iter().filter_map(|r| r.completed_at).max();
        Self {
            key,
            profile,
            completed_count: results.len(),
            last_completed_at,
            results,
            dropped,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestSummary {
    pub id: String,
    pub name: String,
    pub result_count: usize,
    pub student_count: usize,
    pub needs_attention_count: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn record(id: &str, student_id: Option<&str>, completed_hour: u32) -> ResultRecord {
        ResultRecord {
            id: id.to_string(),
            student_id: student_id.map(str::to_string),
            student_name: "Ali Valiyev".to_string(),
            student_id_number: None,
            department_name: "Medicine".to_string(),
            group_name: "M1".to_string(),
            total_score: 12.0,
            completed_at: Some(Utc.with_ymd_and_hms(2026, 2, 2, completed_hour, 0, 0).unwrap()),
            needs_attention: false,
            is_reviewed: false,
            interpretation_level: None,
        }
    }

    #[test]
    fn deleted_students_are_keyed_by_record() {
        let kept = record("r1", Some("s1"), 9);
        let deleted = record("r2", None, 9);
        assert_eq!(kept.identity(), StudentIdentity::Student("s1"));
        assert_eq!(deleted.identity(), StudentIdentity::Record("r2"));
        assert_eq!(kept.student_key(), "s1");
        assert_eq!(deleted.student_key(), "record:r2");
    }

    #[test]
    fn record_keys_never_collide_with_student_ids() {
        let kept = record("r7", Some("r2"), 9);
        let deleted = record("r2", None, 9);
        assert_ne!(kept.student_key(), deleted.student_key());
    }

    #[test]
    fn student_detail_orders_newest_first() {
        let detail = StudentDetail::new(
            "s1".to_string(),
            StudentProfile::from_snapshot(&record("r1", Some("s1"), 8)),
            vec![record("r1", Some("s1"), 8), record("r2", Some("s1"), 11)],
            0,
        );
        assert_eq!(detail.results[0].id, "r2");
        assert_eq!(detail.completed_count, 2);
        assert_eq!(detail.last_completed_at, detail.results[0].completed_at);
    }
}
