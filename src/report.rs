use std::fmt::Write;

use serde::Serialize;

use crate::models::{AggregationNode, ResultRecord, StudentDetail, TestSummary, NOT_AVAILABLE};
use crate::rates;

/// Figures for a dashboard summary card, computed with the same rate
/// functions the drill-down tree uses.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScopeSummary {
    pub record_count: usize,
    pub unique_students: usize,
    pub needs_attention_count: usize,
    pub total_population: u32,
    pub completion_rate: f64,
}

pub fn summarize(records: &[ResultRecord], total_population: u32) -> ScopeSummary {
    let unique_students = rates::unique_completed(records);
    ScopeSummary {
        record_count: records.len(),
        unique_students,
        needs_attention_count: rates::attention_count(records),
        total_population,
        completion_rate: rates::completion_rate(unique_students, total_population),
    }
}

pub fn render_tests(tests: &[TestSummary]) -> String {
    let mut output = String::new();
    if tests.is_empty() {
        let _ = writeln!(output, "No tests found.");
        return output;
    }
    for test in tests {
        let _ = writeln!(
            output,
            "- {} [{}]: {} results from {} students, {} need attention",
            test.name, test.id, test.result_count, test.student_count, test.needs_attention_count
        );
    }
    output
}

pub fn render_nodes(nodes: &[AggregationNode]) -> String {
    let mut output = String::new();
    if nodes.is_empty() {
        let _ = writeln!(output, "No results in this scope.");
        return output;
    }
    for node in nodes {
        let _ = writeln!(
            output,
            "- {} ({} {}): {} / {} students completed ({:.1}%), {} results, {} need attention",
            node.label,
            node.level,
            node.key,
            node.unique_completed_count,
            node.total_population,
            node.completion_rate,
            node.record_count,
            node.needs_attention_count
        );
    }
    output
}

pub fn render_detail(detail: &StudentDetail) -> String {
    let mut output = String::new();
    let profile = &detail.profile;
    let _ = writeln!(
        output,
        "{} ({})",
        profile.full_name,
        profile.student_id_number.as_deref().unwrap_or(NOT_AVAILABLE)
    );
    let _ = writeln!(
        output,
        "{} - {}",
        profile.department_name.as_deref().unwrap_or(NOT_AVAILABLE),
        profile.group_name.as_deref().unwrap_or(NOT_AVAILABLE)
    );
    if let Some(gpa) = profile.avg_gpa {
        let _ = writeln!(output, "GPA {gpa:.2}");
    }
    let _ = writeln!(output, "{} results for this test", detail.completed_count);
    for result in &detail.results {
        let _ = writeln!(
            output,
            "- {}: score {} ({}){}",
            result
                .completed_at
                .map(|ts| ts.format("%d.%m.%Y %H:%M").to_string())
                .unwrap_or_else(|| NOT_AVAILABLE.to_string()),
            result.total_score,
            result.interpretation_level.as_deref().unwrap_or(NOT_AVAILABLE),
            if result.has_unresolved_attention() { ", needs attention" } else { "" }
        );
    }
    output
}

/// Flagged results not yet reviewed, newest first.
pub fn unresolved(records: &[ResultRecord]) -> Vec<&ResultRecord> {
    let mut flagged: Vec<&ResultRecord> = records
        .iter()
        .filter(|record| record.has_unresolved_attention())
        .collect();
    flagged.sort_by(|a, b| b.completed_at.cmp(&a.completed_at));
    flagged
}

pub fn render_attention(flagged: &[&ResultRecord]) -> String {
    let mut output = String::new();
    if flagged.is_empty() {
        let _ = writeln!(output, "No unresolved results in this scope.");
        return output;
    }
    for record in flagged {
        let _ = writeln!(
            output,
            "- {} ({}, {}) score {} level {} [result {}]",
            record.student_name,
            record.department_name,
            record.group_name,
            record.total_score,
            record.interpretation_level.as_deref().unwrap_or(NOT_AVAILABLE),
            record.id
        );
    }
    output
}

pub fn build_report(
    scope_label: &str,
    summary: &ScopeSummary,
    nodes: &[AggregationNode],
    records: &[ResultRecord],
    dropped: usize,
) -> String {
    let mut output = String::new();

    let _ = writeln!(output, "# Assessment Drill-Down Report");
    let _ = writeln!(output, "Generated for {scope_label}");
    let _ = writeln!(output);
    let _ = writeln!(output, "## Summary");
    let _ = writeln!(
        output,
        "- {} results from {} students",
        summary.record_count, summary.unique_students
    );
    let _ = writeln!(
        output,
        "- Completion {:.1}% of {} students",
        summary.completion_rate, summary.total_population
    );
    let _ = writeln!(output, "- {} results need attention", summary.needs_attention_count);
    if dropped > 0 {
        let _ = writeln!(output, "- {dropped} malformed results dropped");
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Breakdown");
    output.push_str(&render_nodes(nodes));

    let flagged = unresolved(records);
    let _ = writeln!(output);
    let _ = writeln!(output, "## Needs Attention");
    output.push_str(&render_attention(&flagged[..flagged.len().min(10)]));

    output
}
