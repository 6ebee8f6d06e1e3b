use chrono::{DateTime, Utc};
use serde_json::Value;
use thiserror::Error;

use crate::models::{ResultRecord, DELETED_STUDENT, UNKNOWN};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NormalizeError {
    #[error("result payload is not a JSON object")]
    NotAnObject,
    #[error("result payload has no usable id")]
    MissingId,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct NormalizedBatch {
    pub records: Vec<ResultRecord>,
    /// Payloads that failed normalization and were left out of `records`.
    pub dropped: usize,
}

pub fn normalize(raw: &Value) -> Result<ResultRecord, NormalizeError> {
    if !raw.is_object() {
        return Err(NormalizeError::NotAnObject);
    }
    let id = identifier(raw).ok_or(NormalizeError::MissingId)?;
    let student = nested(raw, "student");
    let snapshot = nested(raw, "studentSnapshot");

    let student_name = text(student, "full_name")
        .or_else(|| text(snapshot, "full_name"))
        .unwrap_or_else(|| DELETED_STUDENT.to_string());
    let student_id = student
        .and_then(identifier)
        .or_else(|| snapshot.and_then(identifier));
    let student_id_number =
        text(student, "student_id_number").or_else(|| text(snapshot, "student_id_number"));

    let total_score = nested(raw, "scores")
        .and_then(|scores| scores.get("total"))
        .or_else(|| raw.get("totalScore"))
        .and_then(Value::as_f64)
        .unwrap_or(0.0);

    Ok(ResultRecord {
        id,
        student_id,
        student_name,
        student_id_number,
        department_name: text(nested(raw, "department"), "name").unwrap_or_else(|| UNKNOWN.to_string()),
        group_name: text(nested(raw, "group"), "name").unwrap_or_else(|| UNKNOWN.to_string()),
        total_score,
        completed_at: raw
            .get("completedAt")
            .and_then(Value::as_str)
            .and_then(parse_timestamp),
        needs_attention: flag(raw, "needsAttention"),
        is_reviewed: flag(raw, "isReviewed"),
        interpretation_level: text(nested(raw, "interpretation"), "level"),
    })
}

pub fn normalize_batch(raws: &[Value]) -> NormalizedBatch {
    let mut batch = NormalizedBatch::default();
    for raw in raws {
        match normalize(raw) {
            Ok(record) => batch.records.push(record),
            Err(_) => batch.dropped += 1,
        }
    }
    if batch.dropped > 0 {
        tracing::warn!(
            dropped = batch.dropped,
            kept = batch.records.len(),
            "dropped malformed result payloads"
        );
    }
    batch
}

fn nested<'a>(raw: &'a Value, key: &str) -> Option<&'a Value> {
    raw.get(key).filter(|value| value.is_object())
}

fn identifier(value: &Value) -> Option<String> {
    let id = value.get("id").or_else(|| value.get("_id"))?;
    match id {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn text(value: Option<&Value>, key: &str) -> Option<String> {
    value?
        .get(key)?
        .as_str()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn flag(raw: &Value, key: &str) -> bool {
    raw.get(key).and_then(Value::as_bool).unwrap_or(false)
}

fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|ts| ts.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn full_payload_is_carried_over() {
        let record = normalize(&json!({
            "_id": "r1",
            "student": { "_id": "s1", "full_name": "Avery Lee", "student_id_number": "2026001" },
            "department": { "name": "Medicine" },
            "group": { "name": "M1" },
            "scores": { "total": 42 },
            "interpretation": { "level": "High", "description": "Follow up" },
            "completedAt": "2026-02-02T09:30:00Z",
            "needsAttention": true,
            "isReviewed": false
        }))
        .unwrap();

        assert_eq!(record.id, "r1");
        assert_eq!(record.student_id.as_deref(), Some("s1"));
        assert_eq!(record.student_name, "Avery Lee");
        assert_eq!(record.student_id_number.as_deref(), Some("2026001"));
        assert_eq!(record.department_name, "Medicine");
        assert_eq!(record.group_name, "M1");
        assert_eq!(record.total_score, 42.0);
        assert_eq!(record.interpretation_level.as_deref(), Some("High"));
        assert!(record.completed_at.is_some());
        assert!(record.has_unresolved_attention());
    }

    #[test]
    fn snapshot_is_preferred_over_placeholder() {
        let record = normalize(&json!({
            "id": "r2",
            "student": null,
            "studentSnapshot": { "full_name": "Ali Valiyev", "student_id_number": "2025017" }
        }))
        .unwrap();

        assert_eq!(record.student_name, "Ali Valiyev");
        assert_eq!(record.student_id, None);
        assert_eq!(record.student_id_number.as_deref(), Some("2025017"));
    }

    #[test]
    fn snapshot_id_is_used_when_student_is_gone() {
        let record = normalize(&json!({
            "id": "r3",
            "studentSnapshot": { "id": "s9", "full_name": "Jules Moreno" }
        }))
        .unwrap();
        assert_eq!(record.student_id.as_deref(), Some("s9"));
    }

    #[test]
    fn missing_fields_fall_back_to_sentinels() {
        let record = normalize(&json!({ "id": 7, "department": {}, "group": null })).unwrap();
        assert_eq!(record.id, "7");
        assert_eq!(record.student_name, DELETED_STUDENT);
        assert_eq!(record.department_name, UNKNOWN);
        assert_eq!(record.group_name, UNKNOWN);
        assert_eq!(record.total_score, 0.0);
        assert_eq!(record.completed_at, None);
        assert!(!record.needs_attention);
    }

    #[test]
    fn malformed_payloads_are_counted_not_lost() {
        let batch = normalize_batch(&[
            json!({ "id": "r1" }),
            json!("not a record"),
            json!({ "department": { "name": "Law" } }),
            json!({ "id": "r2" }),
        ]);
        assert_eq!(batch.records.len(), 2);
        assert_eq!(batch.dropped, 2);
        assert_eq!(normalize(&json!([1, 2])), Err(NormalizeError::NotAnObject));
        assert_eq!(normalize(&json!({ "id": "  " })), Err(NormalizeError::MissingId));
    }
}
