use async_trait::async_trait;
use serde_json::Value;

use crate::error::FetchError;
use crate::models::{PopulationMap, StudentProfile, TestSummary};

/// The result/query service the drill-down reads from.
///
/// Result fetches hand back raw payloads; shaping them into records is the
/// normalizer's job so every backend gets the same fallbacks.
#[async_trait]
pub trait ResultSource: Send + Sync {
    async fn test_summaries(&self) -> Result<Vec<TestSummary>, FetchError>;

    async fn results_for_test(&self, test_id: &str) -> Result<Vec<Value>, FetchError>;

    async fn results_for_student_in_test(
        &self,
        student_id: &str,
        test_id: &str,
    ) -> Result<Vec<Value>, FetchError>;

    async fn faculty_populations(&self) -> Result<PopulationMap, FetchError>;

    async fn group_populations(&self, faculty: &str) -> Result<PopulationMap, FetchError>;

    async fn student_profile(&self, student_id: &str) -> Result<StudentProfile, FetchError>;

    /// Marks a result reviewed, resolving its attention flag.
    async fn review_result(&self, result_id: &str) -> Result<(), FetchError>;
}
