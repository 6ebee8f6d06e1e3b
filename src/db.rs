use std::collections::HashMap;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde_json::{json, Value};
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::error::FetchError;
use crate::models::{PopulationMap, StudentProfile, TestSummary};
use crate::source::ResultSource;

/// Builds the same nested payload the admin API serves, so deleted students
/// and missing departments reach the normalizer as nulls.
const RESULT_PAYLOAD: &str = r#"
    SELECT json_build_object(
        'id', r.id,
        'student', CASE WHEN s.id IS NULL THEN NULL ELSE json_build_object(
            'id', s.id,
            'full_name', s.full_name,
            'student_id_number', s.student_id_number
        ) END,
        'studentSnapshot', r.student_snapshot,
        'department', CASE WHEN d.id IS NULL THEN NULL ELSE json_build_object('name', d.name) END,
        'group', CASE WHEN g.id IS NULL THEN NULL ELSE json_build_object('name', g.name) END,
        'scores', json_build_object('total', r.total_score),
        'interpretation', CASE WHEN r.interpretation_level IS NULL THEN NULL ELSE json_build_object(
            'level', r.interpretation_level,
            'description', r.interpretation_description
        ) END,
        'completedAt', r.completed_at,
        'needsAttention', r.needs_attention,
        'isReviewed', r.is_reviewed
    ) AS payload
    FROM assessment_drilldown.test_results r
    LEFT JOIN assessment_drilldown.students s ON s.id = r.student_id
    LEFT JOIN assessment_drilldown.departments d ON d.id = r.department_id
    LEFT JOIN assessment_drilldown.groups g ON g.id = r.group_id
"#;

pub async fn init_db(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

pub struct PgSource {
    pool: PgPool,
}

impl PgSource {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ResultSource for PgSource {
    async fn test_summaries(&self) -> Result<Vec<TestSummary>, FetchError> {
        let rows = sqlx::query(
            r#"
            SELECT t.id::text AS id, t.name,
                   COUNT(r.id) AS result_count,
                   COUNT(DISTINCT COALESCE(r.student_id::text, 'record:' || r.id::text)) AS student_count,
                   COUNT(r.id) FILTER (WHERE r.needs_attention AND NOT r.is_reviewed) AS needs_attention_count
            FROM assessment_drilldown.tests t
            LEFT JOIN assessment_drilldown.test_results r ON r.test_id = t.id
            WHERE t.is_active
            GROUP BY t.id, t.name
            ORDER BY t.name
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut summaries = Vec::new();
        for row in rows {
            summaries.push(TestSummary {
                id: row.try_get("id")?,
                name: row.try_get("name")?,
                result_count: count(row.try_get("result_count")?),
                student_count: count(row.try_get("student_count")?),
                needs_attention_count: count(row.try_get("needs_attention_count")?),
            });
        }
        Ok(summaries)
    }

    async fn results_for_test(&self, test_id: &str) -> Result<Vec<Value>, FetchError> {
        let test_id = parse_id("test", test_id)?;
        let query = format!(
            "{RESULT_PAYLOAD} WHERE r.test_id = $1 ORDER BY r.completed_at DESC NULLS LAST, r.id"
        );
        let rows = sqlx::query(&query).bind(test_id).fetch_all(&self.pool).await?;
        tracing::debug!(%test_id, rows = rows.len(), "loaded test results");
        payloads(rows)
    }

    async fn results_for_student_in_test(
        &self,
        student_id: &str,
        test_id: &str,
    ) -> Result<Vec<Value>, FetchError> {
        let student_id = parse_id("student", student_id)?;
        let test_id = parse_id("test", test_id)?;
        let query = format!(
            "{RESULT_PAYLOAD} WHERE r.test_id = $1 AND r.student_id = $2 \
             ORDER BY r.completed_at DESC NULLS LAST, r.id"
        );
        let rows = sqlx::query(&query)
            .bind(test_id)
            .bind(student_id)
            .fetch_all(&self.pool)
            .await?;
        payloads(rows)
    }

    async fn faculty_populations(&self) -> Result<PopulationMap, FetchError> {
        let rows = sqlx::query(
            r#"
            SELECT d.name, COUNT(s.id) AS headcount
            FROM assessment_drilldown.departments d
            LEFT JOIN assessment_drilldown.students s ON s.department_id = d.id
            GROUP BY d.name
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        headcounts(rows)
    }

    async fn group_populations(&self, faculty: &str) -> Result<PopulationMap, FetchError> {
        let rows = sqlx::query(
            r#"
            SELECT g.name, COUNT(s.id) AS headcount
            FROM assessment_drilldown.groups g
            JOIN assessment_drilldown.departments d ON d.id = g.department_id
            LEFT JOIN assessment_drilldown.students s ON s.group_id = g.id
            WHERE d.name = $1
            GROUP BY g.name
            "#,
        )
        .bind(faculty)
        .fetch_all(&self.pool)
        .await?;
        headcounts(rows)
    }

    async fn student_profile(&self, student_id: &str) -> Result<StudentProfile, FetchError> {
        let id = parse_id("student", student_id)?;
        let row = sqlx::query(
            r#"
            SELECT s.id::text AS id, s.full_name, s.student_id_number,
                   d.name AS department_name, g.name AS group_name,
                   s.course, s.semester, s.avg_gpa, s.image
            FROM assessment_drilldown.students s
            LEFT JOIN assessment_drilldown.departments d ON d.id = s.department_id
            LEFT JOIN assessment_drilldown.groups g ON g.id = s.group_id
            WHERE s.id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| FetchError::NotFound {
            what: "student",
            id: student_id.to_string(),
        })?;

        Ok(StudentProfile {
            id: row.try_get("id")?,
            full_name: row.try_get("full_name")?,
            student_id_number: row.try_get("student_id_number")?,
            department_name: row.try_get("department_name")?,
            group_name: row.try_get("group_name")?,
            course: row.try_get("course")?,
            semester: row.try_get("semester")?,
            avg_gpa: row.try_get("avg_gpa")?,
            image: row.try_get("image")?,
        })
    }

    async fn review_result(&self, result_id: &str) -> Result<(), FetchError> {
        let id = parse_id("result", result_id)?;
        let updated = sqlx::query("UPDATE assessment_drilldown.test_results SET is_reviewed = TRUE WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?
            .rows_affected();
        if updated == 0 {
            return Err(FetchError::NotFound {
                what: "result",
                id: result_id.to_string(),
            });
        }
        tracing::info!(%id, "result marked reviewed");
        Ok(())
    }
}

fn parse_id(what: &'static str, id: &str) -> Result<Uuid, FetchError> {
    Uuid::parse_str(id).map_err(|_| FetchError::InvalidId {
        what,
        id: id.to_string(),
    })
}

fn count(value: i64) -> usize {
    usize::try_from(value).unwrap_or(0)
}

fn payloads(rows: Vec<sqlx::postgres::PgRow>) -> Result<Vec<Value>, FetchError> {
    rows.iter()
        .map(|row| row.try_get::<Value, _>("payload").map_err(FetchError::from))
        .collect()
}

fn headcounts(rows: Vec<sqlx::postgres::PgRow>) -> Result<PopulationMap, FetchError> {
    let mut populations = PopulationMap::new();
    for row in rows {
        let name: String = row.try_get("name")?;
        let headcount: i64 = row.try_get("headcount")?;
        populations.insert(name, u32::try_from(headcount).unwrap_or(u32::MAX));
    }
    Ok(populations)
}

fn timestamp(year: i32, month: u32, day: u32, hour: u32, minute: u32) -> anyhow::Result<DateTime<Utc>> {
    Ok(NaiveDate::from_ymd_opt(year, month, day)
        .and_then(|date| date.and_hms_opt(hour, minute, 0))
        .context("invalid timestamp")?
        .and_utc())
}

pub async fn seed(pool: &PgPool) -> anyhow::Result<()> {
    let structure = [
        ("Medicine", "M1"),
        ("Medicine", "M2"),
        ("Pedagogy", "P1"),
        ("Pedagogy", "P2"),
    ];

    let mut departments: HashMap<&str, Uuid> = HashMap::new();
    let mut groups: HashMap<(&str, &str), Uuid> = HashMap::new();
    for (department, group) in structure {
        let department_id = match departments.get(department).copied() {
            Some(id) => id,
            None => {
                let id: Uuid = sqlx::query(
                    r#"
                    INSERT INTO assessment_drilldown.departments (id, name)
                    VALUES ($1, $2)
                    ON CONFLICT (name) DO UPDATE SET name = EXCLUDED.name
                    RETURNING id
                    "#,
                )
                .bind(Uuid::new_v4())
                .bind(department)
                .fetch_one(pool)
                .await?
                .try_get("id")?;
                departments.insert(department, id);
                id
            }
        };

        let group_id: Uuid = sqlx::query(
            r#"
            INSERT INTO assessment_drilldown.groups (id, department_id, name)
            VALUES ($1, $2, $3)
            ON CONFLICT (department_id, name) DO UPDATE SET name = EXCLUDED.name
            RETURNING id
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(department_id)
        .bind(group)
        .fetch_one(pool)
        .await?
        .try_get("id")?;
        groups.insert((department, group), group_id);
    }

    let students = [
        ("Avery Lee", "2026001", "Medicine", "M1", 2, 3, 4.2),
        ("Jules Moreno", "2026002", "Medicine", "M1", 2, 3, 3.6),
        ("Kiara Patel", "2026003", "Medicine", "M2", 1, 1, 3.9),
        ("Malika Yusupova", "2026004", "Medicine", "M2", 1, 2, 4.0),
        ("Dilnoza Karimova", "2026005", "Pedagogy", "P1", 3, 5, 4.5),
        ("Sardor Tursunov", "2026006", "Pedagogy", "P1", 3, 5, 3.1),
        ("Bekzod Rahimov", "2026007", "Pedagogy", "P2", 4, 7, 3.4),
    ];

    let mut student_ids: HashMap<&str, Uuid> = HashMap::new();
    for (full_name, id_number, department, group, course, semester, gpa) in students {
        let id: Uuid = sqlx::query(
            r#"
            INSERT INTO assessment_drilldown.students
            (id, full_name, student_id_number, department_id, group_id, course, semester, avg_gpa)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (student_id_number) DO UPDATE
            SET full_name = EXCLUDED.full_name,
                department_id = EXCLUDED.department_id,
                group_id = EXCLUDED.group_id
            RETURNING id
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(full_name)
        .bind(id_number)
        .bind(departments.get(department).copied())
        .bind(groups.get(&(department, group)).copied())
        .bind(course)
        .bind(semester)
        .bind(gpa)
        .fetch_one(pool)
        .await?
        .try_get("id")?;
        student_ids.insert(id_number, id);
    }

    let mut tests: HashMap<&str, Uuid> = HashMap::new();
    for name in ["Stress screening", "Sleep quality"] {
        let id: Uuid = sqlx::query(
            r#"
            INSERT INTO assessment_drilldown.tests (id, name)
            VALUES ($1, $2)
            ON CONFLICT (name) DO UPDATE SET name = EXCLUDED.name
            RETURNING id
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(name)
        .fetch_one(pool)
        .await?
        .try_get("id")?;
        tests.insert(name, id);
    }

    // Ali Valiyev (2025017) was deleted; only the snapshot on the result remains.
    let results = [
        ("seed-001", "Stress screening", Some("2026001"), "Medicine", "M1", 42.0, "High", true, false, timestamp(2026, 2, 2, 9, 30)?),
        ("seed-002", "Stress screening", Some("2026001"), "Medicine", "M1", 35.0, "Moderate", false, false, timestamp(2026, 2, 5, 11, 0)?),
        ("seed-003", "Stress screening", Some("2026002"), "Medicine", "M1", 18.0, "Low", false, false, timestamp(2026, 2, 3, 14, 15)?),
        ("seed-004", "Stress screening", Some("2026003"), "Medicine", "M2", 40.0, "High", true, true, timestamp(2026, 1, 30, 10, 0)?),
        ("seed-005", "Stress screening", Some("2026005"), "Pedagogy", "P1", 22.0, "Low", false, false, timestamp(2026, 1, 28, 16, 45)?),
        ("seed-006", "Stress screening", None, "Pedagogy", "P1", 45.0, "High", true, false, timestamp(2026, 1, 27, 8, 20)?),
        ("seed-007", "Sleep quality", Some("2026006"), "Pedagogy", "P1", 12.0, "Low", false, false, timestamp(2026, 2, 1, 19, 10)?),
    ];

    for (source_key, test, id_number, department, group, score, level, needs_attention, is_reviewed, completed_at) in results {
        let student_id = id_number.and_then(|number| student_ids.get(number).copied());
        let snapshot = match id_number {
            Some(_) => Value::Null,
            None => json!({ "full_name": "Ali Valiyev", "student_id_number": "2025017" }),
        };

        sqlx::query(
            r#"
            INSERT INTO assessment_drilldown.test_results
            (id, test_id, student_id, student_snapshot, department_id, group_id, total_score,
             interpretation_level, needs_attention, is_reviewed, completed_at, source_key)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ON CONFLICT (source_key) DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(tests.get(test).copied().context("seed test missing")?)
        .bind(student_id)
        .bind(Some(snapshot).filter(|value| !value.is_null()))
        .bind(departments.get(department).copied())
        .bind(groups.get(&(department, group)).copied())
        .bind(score)
        .bind(level)
        .bind(needs_attention)
        .bind(is_reviewed)
        .bind(completed_at)
        .bind(source_key)
        .execute(pool)
        .await?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_must_be_uuids() {
        assert!(parse_id("test", "3d7f5d6f-24f7-4e8e-8b4b-3e7e44b4a7b2").is_ok());
        assert!(matches!(
            parse_id("test", "stress"),
            Err(FetchError::InvalidId { what: "test", .. })
        ));
    }

    #[test]
    fn negative_counts_clamp_to_zero() {
        assert_eq!(count(-1), 0);
        assert_eq!(count(12), 12);
    }

    #[test]
    fn seed_timestamps_are_utc() {
        let ts = timestamp(2026, 2, 2, 9, 30).unwrap();
        assert_eq!(ts.to_rfc3339(), "2026-02-02T09:30:00+00:00");
        assert!(timestamp(2026, 2, 30, 9, 30).is_err());
    }
}
