use std::collections::HashMap;
use std::hash::Hash;

use crate::models::{AggregationNode, Level, PopulationMap, ResultRecord};
use crate::rates;

/// Headcounts used as completion-rate denominators.
pub trait PopulationLookup {
    fn faculty(&self, faculty: &str) -> Option<u32>;
    fn group(&self, faculty: &str, group: &str) -> Option<u32>;
    /// Headcount across all faculties.
    fn total(&self) -> Option<u32>;
}

/// Headcounts collected over a session. Faculty figures arrive in one piece;
/// group figures arrive per faculty.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Populations {
    faculties: Option<PopulationMap>,
    groups: HashMap<String, PopulationMap>,
}

impl Populations {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_faculties(faculties: PopulationMap) -> Self {
        Self {
            faculties: Some(faculties),
            groups: HashMap::new(),
        }
    }

    pub fn set_faculties(&mut self, faculties: PopulationMap) {
        self.faculties = Some(faculties);
    }

    pub fn groups_loaded(&self, faculty: &str) -> bool {
        self.groups.contains_key(faculty)
    }

    pub fn set_groups(&mut self, faculty: &str, groups: PopulationMap) {
        self.groups.insert(faculty.to_string(), groups);
    }
}

impl PopulationLookup for Populations {
    fn faculty(&self, faculty: &str) -> Option<u32> {
        self.faculties.as_ref()?.get(faculty).copied()
    }

    fn group(&self, faculty: &str, group: &str) -> Option<u32> {
        self.groups.get(faculty)?.get(group).copied()
    }

    fn total(&self) -> Option<u32> {
        Some(self.faculties.as_ref()?.values().sum())
    }
}

/// Folds records into one faculty node per department, with group and student
/// levels below. Siblings keep first-seen order.
pub fn aggregate(records: &[ResultRecord], populations: &impl PopulationLookup) -> Vec<AggregationNode> {
    partition(records, |record| record.department_name.as_str())
        .into_iter()
        .map(|(faculty, bucket)| {
            let children = group_nodes(faculty, &bucket, populations);
            let total = populations.faculty(faculty).unwrap_or(0);
            build_node(Level::Faculty, faculty.to_string(), faculty.to_string(), total, bucket, children)
        })
        .collect()
}

/// Group level of one faculty, re-derived from records already in memory.
pub fn group_nodes(
    faculty: &str,
    records: &[ResultRecord],
    populations: &impl PopulationLookup,
) -> Vec<AggregationNode> {
    partition(records, |record| record.group_name.as_str())
        .into_iter()
        .map(|(group, bucket)| {
            let children = student_nodes(&bucket);
            let total = populations.group(faculty, group).unwrap_or(0);
            build_node(Level::Group, group.to_string(), group.to_string(), total, bucket, children)
        })
        .collect()
}

/// A student is a population of one, so a student node always reports 100%.
pub fn student_nodes(records: &[ResultRecord]) -> Vec<AggregationNode> {
    partition(records, ResultRecord::identity)
        .into_iter()
        .map(|(identity, bucket)| {
            let key = identity.to_string();
            let label = bucket
                .first()
                .map(|record| record.student_name.clone())
                .unwrap_or_else(|| key.clone());
            build_node(Level::Student, key, label, 1, bucket, Vec::new())
        })
        .collect()
}

/// Explicit post-sort for views that want alphabetical siblings.
pub fn sort_alphabetically(nodes: &mut [AggregationNode]) {
    nodes.sort_by(|a, b| a.label.to_lowercase().cmp(&b.label.to_lowercase()));
    for node in nodes.iter_mut() {
        sort_alphabetically(&mut node.children);
    }
}

/// Marks a result reviewed in every node holding it and refreshes the attention
/// counts on the way down. Returns whether any node held it.
pub fn mark_reviewed(nodes: &mut [AggregationNode], result_id: &str) -> bool {
    let mut found = false;
    for node in nodes.iter_mut() {
        if mark_records_reviewed(&mut node.records, result_id) {
            mark_reviewed(&mut node.children, result_id);
            node.needs_attention_count = rates::attention_count(&node.records);
            found = true;
        }
    }
    found
}

pub fn mark_records_reviewed(records: &mut [ResultRecord], result_id: &str) -> bool {
    let mut found = false;
    for record in records.iter_mut().filter(|record| record.id == result_id) {
        record.is_reviewed = true;
        found = true;
    }
    found
}

fn partition<'a, K, F>(records: &'a [ResultRecord], key_of: F) -> Vec<(K, Vec<ResultRecord>)>
where
    K: Eq + Hash + Copy,
    F: Fn(&'a ResultRecord) -> K,
{
    let mut index: HashMap<K, usize> = HashMap::new();
    let mut buckets: Vec<(K, Vec<ResultRecord>)> = Vec::new();

    for record in records {
        let key = key_of(record);
        let slot = *index.entry(key).or_insert_with(|| {
            buckets.push((key, Vec::new()));
            buckets.len() - 1
        });
        buckets[slot].1.push(record.clone());
    }

    buckets
}

fn build_node(
    level: Level,
    key: String,
    label: String,
    total_population: u32,
    records: Vec<ResultRecord>,
    children: Vec<AggregationNode>,
) -> AggregationNode {
    let unique_completed_count = rates::unique_completed(&records);
    AggregationNode {
        level,
        key,
        label,
        total_population,
        unique_completed_count,
        record_count: records.len(),
        needs_attention_count: rates::attention_count(&records),
        completion_rate: rates::completion_rate(unique_completed_count, total_population),
        children,
        records,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    fn record(id: &str, dept: &str, group: &str, student: Option<&str>, attention: bool, reviewed: bool) -> ResultRecord {
        ResultRecord {
            id: id.to_string(),
            student_id: student.map(str::to_string),
            student_name: student.unwrap_or("Deleted student").to_string(),
            student_id_number: None,
            department_name: dept.to_string(),
            group_name: group.to_string(),
            total_score: 10.0,
            completed_at: None,
            needs_attention: attention,
            is_reviewed: reviewed,
            interpretation_level: None,
        }
    }

    fn populations(faculties: &[(&str, u32)]) -> Populations {
        Populations::with_faculties(
            faculties
                .iter()
                .map(|(name, count)| (name.to_string(), *count))
                .collect(),
        )
    }

    fn leaf_ids(nodes: &[AggregationNode]) -> Vec<String> {
        nodes
            .iter()
            .flat_map(|node| {
                if node.children.is_empty() {
                    node.records.iter().map(|r| r.id.clone()).collect()
                } else {
                    leaf_ids(&node.children)
                }
            })
            .collect()
    }

    #[test]
    fn medicine_scenario() {
        let records = vec![
            record("r1", "Medicine", "M1", Some("S1"), true, false),
            record("r2", "Medicine", "M1", Some("S2"), false, false),
        ];
        let tree = aggregate(&records, &populations(&[("Medicine", 10)]));

        assert_eq!(tree.len(), 1);
        let medicine = &tree[0];
        assert_eq!(medicine.key, "Medicine");
        assert_eq!(medicine.unique_completed_count, 2);
        assert_eq!(medicine.needs_attention_count, 1);
        assert_eq!(medicine.completion_rate, 20.0);
        assert_eq!(medicine.children[0].children.len(), 2);
    }

    #[test]
    fn missing_group_population_yields_zero_rate() {
        let records = vec![record("r1", "Law", "L2", Some("S1"), false, false)];
        let tree = aggregate(&records, &populations(&[("Law", 4)]));
        let group = &tree[0].children[0];
        assert_eq!(group.total_population, 0);
        assert_eq!(group.completion_rate, 0.0);
        assert_eq!(tree[0].completion_rate, 25.0);
    }

    #[test]
    fn siblings_keep_first_seen_order() {
        let records = vec![
            record("r1", "Pedagogy", "P2", Some("S1"), false, false),
            record("r2", "Medicine", "M1", Some("S2"), false, false),
            record("r3", "Pedagogy", "P1", Some("S3"), false, false),
            record("r4", "Pedagogy", "P2", Some("S4"), false, false),
        ];
        let tree = aggregate(&records, &Populations::new());
        let faculties: Vec<_> = tree.iter().map(|n| n.key.as_str()).collect();
        assert_eq!(faculties, vec!["Pedagogy", "Medicine"]);
        let groups: Vec<_> = tree[0].children.iter().map(|n| n.key.as_str()).collect();
        assert_eq!(groups, vec!["P2", "P1"]);
    }

    #[test]
    fn alphabetical_order_is_an_explicit_step() {
        let records = vec![
            record("r1", "pedagogy", "P2", Some("S1"), false, false),
            record("r2", "Medicine", "M1", Some("S2"), false, false),
        ];
        let mut tree = aggregate(&records, &Populations::new());
        sort_alphabetically(&mut tree);
        assert_eq!(tree[0].key, "Medicine");
        assert_eq!(tree[1].key, "pedagogy");
    }

    #[test]
    fn repeat_submissions_and_deleted_students() {
        let records = vec![
            record("r1", "Medicine", "M1", Some("S1"), false, false),
            record("r2", "Medicine", "M1", Some("S1"), true, false),
            record("r3", "Medicine", "M1", None, false, false),
            record("r4", "Medicine", "M1", None, false, false),
        ];
        let tree = aggregate(&records, &Populations::new());
        let group = &tree[0].children[0];
        assert_eq!(group.record_count, 4);
        assert_eq!(group.unique_completed_count, 3);
        let students: Vec<_> = group.children.iter().map(|n| n.key.as_str()).collect();
        assert_eq!(students, vec!["S1", "record:r3", "record:r4"]);
        assert_eq!(group.children[0].record_count, 2);
        assert_eq!(group.children[0].completion_rate, 100.0);
    }

    #[test]
    fn deleted_record_sharing_a_student_id_gets_its_own_node() {
        let records = vec![
            record("r1", "Medicine", "M1", Some("r2"), false, false),
            record("r2", "Medicine", "M1", None, true, false),
        ];
        let students = student_nodes(&records);
        assert_eq!(students.len(), 2);
        assert_eq!(students[0].key, "r2");
        assert_eq!(students[1].key, "record:r2");
        assert_eq!(students[1].needs_attention_count, 1);
    }

    #[test]
    fn reviewing_a_result_clears_attention_up_the_tree() {
        let records = vec![
            record("r1", "Medicine", "M1", Some("S1"), true, false),
            record("r2", "Medicine", "M2", Some("S2"), true, false),
        ];
        let mut tree = aggregate(&records, &Populations::new());
        assert_eq!(tree[0].needs_attention_count, 2);

        assert!(mark_reviewed(&mut tree, "r1"));
        assert_eq!(tree[0].needs_attention_count, 1);
        assert_eq!(tree[0].children[0].needs_attention_count, 0);
        assert_eq!(tree[0].children[0].children[0].needs_attention_count, 0);
        assert_eq!(tree[0].children[1].needs_attention_count, 1);
        assert!(!mark_reviewed(&mut tree, "r404"));
    }

    #[test]
    fn empty_input_yields_no_nodes() {
        assert!(aggregate(&[], &Populations::new()).is_empty());
    }

    fn arb_record() -> impl Strategy<Value = ResultRecord> {
        (
            0u32..10_000,
            prop::sample::select(vec!["Medicine", "Law", "Unknown"]),
            prop::sample::select(vec!["G1", "G2", "G3"]),
            prop::option::of(0u8..6),
            any::<bool>(),
            any::<bool>(),
        )
            .prop_map(|(id, dept, group, student, attention, reviewed)| {
                let student = student.map(|s| format!("S{s}"));
                record(&format!("r{id}"), dept, group, student.as_deref(), attention, reviewed)
            })
    }

    proptest! {
        #[test]
        fn every_record_lands_in_exactly_one_leaf(records in prop::collection::vec(arb_record(), 0..60)) {
            let tree = aggregate(&records, &Populations::new());
            let mut leaves = leaf_ids(&tree);
            let mut input: Vec<String> = records.iter().map(|r| r.id.clone()).collect();
            leaves.sort();
            input.sort();
            prop_assert_eq!(leaves, input);
        }

        #[test]
        fn aggregation_is_idempotent(records in prop::collection::vec(arb_record(), 0..60)) {
            let pops = populations(&[("Medicine", 12), ("Law", 3)]);
            prop_assert_eq!(aggregate(&records, &pops), aggregate(&records, &pops));
        }

        #[test]
        fn attention_sums_through_children(records in prop::collection::vec(arb_record(), 0..60)) {
            fn check(node: &AggregationNode) -> bool {
                if node.children.is_empty() {
                    return true;
                }
                let sum: usize = node.children.iter().map(|c| c.needs_attention_count).sum();
                sum == node.needs_attention_count && node.children.iter().all(check)
            }
            let tree = aggregate(&records, &Populations::new());
            prop_assert!(tree.iter().all(check));
        }

        #[test]
        fn rates_stay_finite(records in prop::collection::vec(arb_record(), 0..60), total in 0u32..5) {
            let pops = populations(&[("Medicine", total), ("Law", total)]);
            for node in aggregate(&records, &pops) {
                prop_assert!(node.completion_rate.is_finite());
                prop_assert!((0.0..=100.0).contains(&node.completion_rate));
            }
        }
    }
}
