use std::collections::HashSet;

use crate::models::ResultRecord;

/// Share of a population with at least one result, as a percentage in `[0, 100]`.
///
/// A population of zero means the headcount is unknown and yields `0`.
pub fn completion_rate(unique: usize, total: u32) -> f64 {
    if total == 0 {
        return 0.0;
    }
    let rate = unique as f64 / f64::from(total) * 100.0;
    rate.clamp(0.0, 100.0)
}

pub fn attention_count(records: &[ResultRecord]) -> usize {
    records
        .iter()
        .filter(|record| record.has_unresolved_attention())
        .count()
}

/// Distinct students among `records`; each identity-less record counts once.
pub fn unique_completed(records: &[ResultRecord]) -> usize {
    records
        .iter()
        .map(ResultRecord::identity)
        .collect::<HashSet<_>>()
        .len()
}
