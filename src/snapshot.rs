use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::FetchError;
use crate::models::{PopulationMap, StudentProfile, TestSummary};
use crate::normalize::{normalize, normalize_batch};
use crate::rates;
use crate::source::ResultSource;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotTest {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct SnapshotData {
    #[serde(default)]
    tests: Vec<SnapshotTest>,
    /// Raw result payloads keyed by test id.
    #[serde(default)]
    results: HashMap<String, Vec<Value>>,
    #[serde(default)]
    faculties: PopulationMap,
    /// Group headcounts keyed by faculty name.
    #[serde(default)]
    groups: HashMap<String, PopulationMap>,
    #[serde(default)]
    students: Vec<StudentProfile>,
}

impl SnapshotData {
    fn raw_results(&self, test_id: &str) -> Result<&[Value], FetchError> {
        if !self.tests.iter().any(|test| test.id == test_id) {
            return Err(FetchError::NotFound {
                what: "test",
                id: test_id.to_string(),
            });
        }
        Ok(self.results.get(test_id).map(Vec::as_slice).unwrap_or_default())
    }
}

/// Offline result service backed by a JSON export of the platform. Reviews
/// are applied in memory; `save` writes them back.
#[derive(Debug, Default)]
pub struct SnapshotSource {
    data: RwLock<SnapshotData>,
}

impl SnapshotSource {
    pub fn load(path: &Path) -> Result<Self, FetchError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self, FetchError> {
        Ok(Self {
            data: RwLock::new(serde_json::from_str(text)?),
        })
    }

    pub fn save(&self, path: &Path) -> Result<(), FetchError> {
        let text = serde_json::to_string_pretty(&*self.data.read())?;
        std::fs::write(path, text)?;
        Ok(())
    }
}

#[async_trait]
impl ResultSource for SnapshotSource {
    async fn test_summaries(&self) -> Result<Vec<TestSummary>, FetchError> {
        let data = self.data.read();
        data.tests
            .iter()
            .map(|test| {
                let batch = normalize_batch(data.raw_results(&test.id)?);
                Ok(TestSummary {
                    id: test.id.clone(),
                    name: test.name.clone(),
                    result_count: batch.records.len(),
                    student_count: rates::unique_completed(&batch.records),
                    needs_attention_count: rates::attention_count(&batch.records),
                })
            })
            .collect()
    }

    async fn results_for_test(&self, test_id: &str) -> Result<Vec<Value>, FetchError> {
        Ok(self.data.read().raw_results(test_id)?.to_vec())
    }

    async fn results_for_student_in_test(
        &self,
        student_id: &str,
        test_id: &str,
    ) -> Result<Vec<Value>, FetchError> {
        Ok(self
            .data
            .read()
            .raw_results(test_id)?
            .iter()
            .filter(|raw| {
                normalize(raw)
                    .map(|record| record.student_id.as_deref() == Some(student_id))
                    .unwrap_or(false)
            })
            .cloned()
            .collect())
    }

    async fn faculty_populations(&self) -> Result<PopulationMap, FetchError> {
        Ok(self.data.read().faculties.clone())
    }

    async fn group_populations(&self, faculty: &str) -> Result<PopulationMap, FetchError> {
        Ok(self.data.read().groups.get(faculty).cloned().unwrap_or_default())
    }

    async fn student_profile(&self, student_id: &str) -> Result<StudentProfile, FetchError> {
        self.data
            .read()
            .students
            .iter()
            .find(|student| student.id == student_id)
            .cloned()
            .ok_or_else(|| FetchError::NotFound {
                what: "student",
                id: student_id.to_string(),
            })
    }

    async fn review_result(&self, result_id: &str) -> Result<(), FetchError> {
        let mut data = self.data.write();
        let mut found = false;
        for raw in data.results.values_mut().flatten() {
            let matches = normalize(raw).is_ok_and(|record| record.id == result_id);
            if let (true, Some(object)) = (matches, raw.as_object_mut()) {
                object.insert("isReviewed".to_string(), Value::Bool(true));
                found = true;
            }
        }
        if !found {
            return Err(FetchError::NotFound {
                what: "result",
                id: result_id.to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    const SNAPSHOT: &str = r#"{
        "tests": [{ "id": "t1", "name": "Stress screening" }, { "id": "t2", "name": "Sleep quality" }],
        "results": {
            "t1": [
                { "id": "r1", "student": { "id": "s1", "full_name": "Avery Lee" },
                  "department": { "name": "Medicine" }, "group": { "name": "M1" },
                  "needsAttention": true, "isReviewed": false },
                { "id": "r2", "student": { "id": "s1", "full_name": "Avery Lee" },
                  "department": { "name": "Medicine" }, "group": { "name": "M1" } },
                { "id": "r3", "studentSnapshot": { "full_name": "Ali Valiyev" } },
                "broken"
            ]
        },
        "faculties": { "Medicine": 10 },
        "groups": { "Medicine": { "M1": 4 } },
        "students": [{ "id": "s1", "full_name": "Avery Lee", "student_id_number": "2026001" }]
    }"#;

    #[tokio::test]
    async fn summaries_count_students_and_attention() {
        let source = SnapshotSource::from_json(SNAPSHOT).unwrap();
        let summaries = source.test_summaries().await.unwrap();

        assert_eq!(summaries.len(), 2);
        assert_eq!(summaries[0].result_count, 3);
        assert_eq!(summaries[0].student_count, 2);
        assert_eq!(summaries[0].needs_attention_count, 1);
        assert_eq!(summaries[1].result_count, 0);
    }

    #[tokio::test]
    async fn student_history_is_filtered_by_student() {
        let source = SnapshotSource::from_json(SNAPSHOT).unwrap();
        let history = source.results_for_student_in_test("s1", "t1").await.unwrap();
        assert_eq!(history.len(), 2);

        let profile = source.student_profile("s1").await.unwrap();
        assert_eq!(profile.student_id_number.as_deref(), Some("2026001"));
        assert!(matches!(
            source.student_profile("s404").await,
            Err(FetchError::NotFound { what: "student", .. })
        ));
    }

    #[tokio::test]
    async fn unknown_tests_are_errors_not_empty_results() {
        let source = SnapshotSource::from_json(SNAPSHOT).unwrap();
        assert!(matches!(
            source.results_for_test("t9").await,
            Err(FetchError::NotFound { what: "test", .. })
        ));
    }

    #[tokio::test]
    async fn demo_snapshot_drills_down_to_a_student() {
        use crate::session::DrillSession;
        use std::sync::Arc;
        use std::time::Duration;

        let source = SnapshotSource::from_json(include_str!("../demos/snapshot.json")).unwrap();
        let session = DrillSession::new(Arc::new(source), Duration::from_secs(1));

        session.select_test("stress-2026").await.unwrap();
        let faculties = session.current_tree().unwrap();
        assert_eq!(faculties[0].key, "Medicine");
        assert_eq!(faculties[0].unique_completed_count, 2);
        assert_eq!(faculties[0].completion_rate, 5.0);

        session.select_faculty("Medicine").await.unwrap();
        session.select_group("M1").unwrap();
        session.select_student("s-001").await.unwrap();

        let detail = session.detail().unwrap();
        assert_eq!(detail.completed_count, 2);
        assert_eq!(detail.results[0].id, "r-004");
        assert_eq!(detail.profile.avg_gpa, Some(4.2));
    }

    #[tokio::test]
    async fn reviews_resolve_attention_and_survive_a_save() {
        let source = SnapshotSource::from_json(SNAPSHOT).unwrap();
        source.review_result("r1").await.unwrap();
        assert_eq!(source.test_summaries().await.unwrap()[0].needs_attention_count, 0);
        assert!(matches!(
            source.review_result("r404").await,
            Err(FetchError::NotFound { what: "result", .. })
        ));

        let file = tempfile::NamedTempFile::new().unwrap();
        source.save(file.path()).unwrap();
        let reloaded = SnapshotSource::load(file.path()).unwrap();
        let raw = reloaded.results_for_test("t1").await.unwrap();
        assert_eq!(raw[0]["isReviewed"], Value::Bool(true));
        assert_eq!(reloaded.test_summaries().await.unwrap()[0].needs_attention_count, 0);
    }

    #[tokio::test]
    async fn loads_from_disk() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SNAPSHOT.as_bytes()).unwrap();

        let source = SnapshotSource::load(file.path()).unwrap();
        let populations = source.group_populations("Medicine").await.unwrap();
        assert_eq!(populations.get("M1"), Some(&4));
        assert!(SnapshotSource::load(Path::new("/nonexistent/snapshot.json")).is_err());
    }
}
