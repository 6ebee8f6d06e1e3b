//! Drill-down state machine.
//!
//! Every view below the test list is derived from the record batch fetched
//! when the test was selected. Deeper views keep their parent by value so
//! going back never needs the network, and every transition bumps a
//! generation counter so a fetch issued for an abandoned view can be
//! recognised when it lands.

use serde::Serialize;

use crate::aggregate::{self, PopulationLookup};
use crate::error::{DrillError, ScopeError};
use crate::models::{AggregationNode, Level, ResultRecord, StudentDetail};
use crate::normalize::NormalizedBatch;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ViewKind {
    TestSelection,
    FacultyView,
    GroupView,
    StudentView,
}

/// Token handed out before a fetch and checked when its result arrives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ticket(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Applied,
    /// A later navigation won; the result was discarded.
    Superseded,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FacultyScope {
    pub test_id: String,
    /// The whole batch in fetch order.
    pub records: Vec<ResultRecord>,
    pub faculties: Vec<AggregationNode>,
    /// Headcount of every faculty, not only those with results.
    pub population: u32,
    pub dropped: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GroupScope {
    pub parent: FacultyScope,
    pub faculty_key: String,
    pub groups: Vec<AggregationNode>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StudentScope {
    pub parent: GroupScope,
    pub group_key: String,
    pub students: Vec<AggregationNode>,
    pub detail: Option<StudentDetail>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub enum DrillState {
    #[default]
    TestSelection,
    Faculty(FacultyScope),
    Group(GroupScope),
    Student(StudentScope),
}

impl DrillState {
    pub fn kind(&self) -> ViewKind {
        match self {
            DrillState::TestSelection => ViewKind::TestSelection,
            DrillState::Faculty(_) => ViewKind::FacultyView,
            DrillState::Group(_) => ViewKind::GroupView,
            DrillState::Student(_) => ViewKind::StudentView,
        }
    }

    fn faculty_scope(&self) -> Option<&FacultyScope> {
        match self {
            DrillState::TestSelection => None,
            DrillState::Faculty(scope) => Some(scope),
            DrillState::Group(scope) => Some(&scope.parent),
            DrillState::Student(scope) => Some(&scope.parent.parent),
        }
    }

    fn group_scope(&self) -> Option<&GroupScope> {
        match self {
            DrillState::Group(scope) => Some(scope),
            DrillState::Student(scope) => Some(&scope.parent),
            _ => None,
        }
    }
}

#[derive(Debug, Default)]
pub struct Navigator {
    state: DrillState,
    generation: u64,
    last_error: Option<ScopeError>,
}

impl Navigator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> &DrillState {
        &self.state
    }

    pub fn view(&self) -> ViewKind {
        self.state.kind()
    }

    pub fn last_error(&self) -> Option<&ScopeError> {
        self.last_error.as_ref()
    }

    pub fn issue(&mut self) -> Ticket {
        self.generation += 1;
        Ticket(self.generation)
    }

    pub fn is_current(&self, ticket: Ticket) -> bool {
        ticket.0 == self.generation
    }

    pub fn test_id(&self) -> Option<&str> {
        self.state.faculty_scope().map(|scope| scope.test_id.as_str())
    }

    /// Faculty node of the loaded test, reachable from any view below it.
    pub fn faculty(&self, key: &str) -> Result<&AggregationNode, DrillError> {
        let scope = self.state.faculty_scope().ok_or(DrillError::InvalidTransition {
            action: "select a faculty",
            from: self.view(),
        })?;
        find(&scope.faculties, Level::Faculty, key)
    }

    pub fn group(&self, key: &str) -> Result<&AggregationNode, DrillError> {
        let scope = self.state.group_scope().ok_or(DrillError::InvalidTransition {
            action: "select a group",
            from: self.view(),
        })?;
        find(&scope.groups, Level::Group, key)
    }

    pub fn student(&self, key: &str) -> Result<&AggregationNode, DrillError> {
        let DrillState::Student(scope) = &self.state else {
            return Err(DrillError::InvalidTransition {
                action: "select a student",
                from: self.view(),
            });
        };
        find(&scope.students, Level::Student, key)
    }

    pub fn enter_test(
        &mut self,
        ticket: Ticket,
        test_id: &str,
        batch: NormalizedBatch,
        populations: &impl PopulationLookup,
    ) -> Outcome {
        if !self.is_current(ticket) {
            return Outcome::Superseded;
        }
        let faculties = aggregate::aggregate(&batch.records, populations);
        self.state = DrillState::Faculty(FacultyScope {
            test_id: test_id.to_string(),
            records: batch.records,
            faculties,
            population: populations.total().unwrap_or(0),
            dropped: batch.dropped,
        });
        self.last_error = None;
        Outcome::Applied
    }

    /// Re-partitions the faculty's in-memory records into groups.
    pub fn enter_faculty(
        &mut self,
        ticket: Ticket,
        faculty_key: &str,
        populations: &impl PopulationLookup,
    ) -> Result<Outcome, DrillError> {
        if !self.is_current(ticket) {
            return Ok(Outcome::Superseded);
        }
        let node = self.faculty(faculty_key)?;
        let groups = aggregate::group_nodes(&node.key, &node.records, populations);
        if let Some(parent) = self.unwind_to_faculty() {
            self.state = DrillState::Group(GroupScope {
                parent,
                faculty_key: faculty_key.to_string(),
                groups,
            });
        }
        self.last_error = None;
        Ok(Outcome::Applied)
    }

    /// Needs no fetch, so it takes no ticket but still invalidates pending ones.
    pub fn enter_group(&mut self, group_key: &str) -> Result<Outcome, DrillError> {
        let students = aggregate::student_nodes(&self.group(group_key)?.records);
        self.issue();
        if let Some(parent) = self.unwind_to_group() {
            self.state = DrillState::Student(StudentScope {
                parent,
                group_key: group_key.to_string(),
                students,
                detail: None,
            });
        }
        self.last_error = None;
        Ok(Outcome::Applied)
    }

    pub fn open_student(&mut self, ticket: Ticket, detail: StudentDetail) -> Result<Outcome, DrillError> {
        if !self.is_current(ticket) {
            return Ok(Outcome::Superseded);
        }
        self.student(&detail.key)?;
        if let DrillState::Student(scope) = &mut self.state {
            scope.detail = Some(detail);
        }
        self.last_error = None;
        Ok(Outcome::Applied)
    }

    /// Keeps the current view and records the failure if the ticket still counts.
    pub fn record_error(&mut self, ticket: Ticket, error: ScopeError) -> Outcome {
        if !self.is_current(ticket) {
            return Outcome::Superseded;
        }
        self.last_error = Some(error);
        Outcome::Applied
    }

    /// Applies a review to every copy of the result the current view holds.
    /// The view itself does not change.
    pub fn mark_reviewed(&mut self, result_id: &str) -> bool {
        match &mut self.state {
            DrillState::TestSelection => false,
            DrillState::Faculty(scope) => review_faculty_scope(scope, result_id),
            DrillState::Group(scope) => review_group_scope(scope, result_id),
            DrillState::Student(scope) => {
                let in_detail = scope
                    .detail
                    .as_mut()
                    .is_some_and(|detail| aggregate::mark_records_reviewed(&mut detail.results, result_id));
                let in_students = aggregate::mark_reviewed(&mut scope.students, result_id);
                let in_parent = review_group_scope(&mut scope.parent, result_id);
                in_detail || in_students || in_parent
            }
        }
    }

    pub fn back(&mut self) {
        self.issue();
        self.last_error = None;
        self.state = match std::mem::take(&mut self.state) {
            DrillState::TestSelection | DrillState::Faculty(_) => DrillState::TestSelection,
            DrillState::Group(scope) => DrillState::Faculty(scope.parent),
            DrillState::Student(mut scope) if scope.detail.is_some() => {
                scope.detail = None;
                DrillState::Student(scope)
            }
            DrillState::Student(scope) => DrillState::Group(scope.parent),
        };
    }

    pub fn close(&mut self) {
        self.issue();
        self.last_error = None;
        self.state = DrillState::TestSelection;
    }

    pub fn current_tree(&self) -> Option<&[AggregationNode]> {
        match &self.state {
            DrillState::TestSelection => None,
            DrillState::Faculty(scope) => Some(&scope.faculties),
            DrillState::Group(scope) => Some(&scope.groups),
            DrillState::Student(scope) => Some(&scope.students),
        }
    }

    /// Records of the innermost selection, in fetch order.
    pub fn scope_records(&self) -> Option<&[ResultRecord]> {
        match &self.state {
            DrillState::TestSelection => None,
            DrillState::Faculty(scope) => Some(&scope.records),
            DrillState::Group(scope) => self.faculty(&scope.faculty_key).ok().map(|n| n.records.as_slice()),
            DrillState::Student(scope) => {
                let node = match &scope.detail {
                    Some(detail) => self.student(&detail.key).ok(),
                    None => self.group(&scope.group_key).ok(),
                };
                node.map(|n| n.records.as_slice())
            }
        }
    }

    /// Headcount of the innermost selection, the denominator its summary
    /// rate shares with the node it was selected from.
    pub fn scope_population(&self) -> Option<u32> {
        match &self.state {
            DrillState::TestSelection => None,
            DrillState::Faculty(scope) => Some(scope.population),
            DrillState::Group(scope) => self.faculty(&scope.faculty_key).ok().map(|n| n.total_population),
            DrillState::Student(scope) => {
                let node = match &scope.detail {
                    Some(detail) => self.student(&detail.key).ok(),
                    None => self.group(&scope.group_key).ok(),
                };
                node.map(|n| n.total_population)
            }
        }
    }

    pub fn detail(&self) -> Option<&StudentDetail> {
        match &self.state {
            DrillState::Student(scope) => scope.detail.as_ref(),
            _ => None,
        }
    }

    pub fn dropped_records(&self) -> usize {
        let batch = self.state.faculty_scope().map_or(0, |scope| scope.dropped);
        batch + self.detail().map_or(0, |detail| detail.dropped)
    }

    fn unwind_to_faculty(&mut self) -> Option<FacultyScope> {
        match std::mem::take(&mut self.state) {
            DrillState::TestSelection => None,
            DrillState::Faculty(scope) => Some(scope),
            DrillState::Group(scope) => Some(scope.parent),
            DrillState::Student(scope) => Some(scope.parent.parent),
        }
    }

    fn unwind_to_group(&mut self) -> Option<GroupScope> {
        match std::mem::take(&mut self.state) {
            DrillState::Group(scope) => Some(scope),
            DrillState::Student(scope) => Some(scope.parent),
            other => {
                self.state = other;
                None
            }
        }
    }
}

fn review_faculty_scope(scope: &mut FacultyScope, result_id: &str) -> bool {
    let in_batch = aggregate::mark_records_reviewed(&mut scope.records, result_id);
    let in_tree = aggregate::mark_reviewed(&mut scope.faculties, result_id);
    in_batch || in_tree
}

fn review_group_scope(scope: &mut GroupScope, result_id: &str) -> bool {
    let in_groups = aggregate::mark_reviewed(&mut scope.groups, result_id);
    let in_parent = review_faculty_scope(&mut scope.parent, result_id);
    in_groups || in_parent
}

fn find<'a>(nodes: &'a [AggregationNode], level: Level, key: &str) -> Result<&'a AggregationNode, DrillError> {
    nodes
        .iter()
        .find(|node| node.key == key)
        .ok_or_else(|| DrillError::UnknownKey {
            level,
            key: key.to_string(),
        })
}
