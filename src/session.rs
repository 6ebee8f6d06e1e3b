use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::OnceCell;
use tracing::{debug, warn};

use crate::aggregate::Populations;
use crate::error::{DrillError, FetchError, Scope, ScopeError};
use crate::export::{self, ExportRow};
use crate::models::{AggregationNode, PopulationMap, ResultRecord, StudentDetail, StudentProfile, TestSummary};
use crate::navigator::{DrillState, Navigator, Outcome, Ticket, ViewKind};
use crate::normalize::normalize_batch;
use crate::report::{self, ScopeSummary};
use crate::source::ResultSource;

/// Drives the navigator against a result source.
///
/// Transitions take `&self` so a newer navigation can start while an older
/// fetch is still in flight; whichever was issued last wins. Locks are never
/// held across a fetch.
pub struct DrillSession {
    source: Arc<dyn ResultSource>,
    navigator: Mutex<Navigator>,
    populations: Mutex<Populations>,
    faculties: OnceCell<PopulationMap>,
    fetch_timeout: Duration,
}

impl DrillSession {
    pub fn new(source: Arc<dyn ResultSource>, fetch_timeout: Duration) -> Self {
        Self {
            source,
            navigator: Mutex::new(Navigator::new()),
            populations: Mutex::new(Populations::new()),
            faculties: OnceCell::new(),
            fetch_timeout,
        }
    }

    pub async fn tests(&self) -> Result<Vec<TestSummary>, DrillError> {
        self.timed(self.source.test_summaries())
            .await
            .map_err(|source| DrillError::Fetch {
                scope: Scope::Tests,
                source,
            })
    }

    pub async fn select_test(&self, test_id: &str) -> Result<Outcome, DrillError> {
        let ticket = self.navigator.lock().issue();
        let scope = Scope::Test(test_id.to_string());
        debug!(test_id, "fetching results for test");

        let fetched = tokio::try_join!(
            self.timed(self.source.results_for_test(test_id)),
            self.faculty_populations(),
        );
        let (raw, faculties) = match fetched {
            Ok(fetched) => fetched,
            Err(source) => return self.fail(ticket, scope, source),
        };

        let batch = normalize_batch(&raw);
        let populations = {
            let mut cache = self.populations.lock();
            cache.set_faculties(faculties);
            cache.clone()
        };
        let outcome = self
            .navigator
            .lock()
            .enter_test(ticket, test_id, batch, &populations);
        log_outcome(outcome, &scope);
        Ok(outcome)
    }

    pub async fn select_faculty(&self, faculty_key: &str) -> Result<Outcome, DrillError> {
        let ticket = {
            let mut navigator = self.navigator.lock();
            navigator.faculty(faculty_key)?;
            navigator.issue()
        };
        let scope = Scope::Faculty(faculty_key.to_string());

        let cached = self.populations.lock().groups_loaded(faculty_key);
        if !cached {
            debug!(faculty = faculty_key, "fetching group headcounts");
            let fetched = self.timed(self.source.group_populations(faculty_key)).await;
            match fetched {
                Ok(groups) => {
                    self.populations.lock().set_groups(faculty_key, groups);
                }
                Err(source) => return self.fail(ticket, scope, source),
            }
        }

        let populations = self.populations.lock().clone();
        let outcome = self
            .navigator
            .lock()
            .enter_faculty(ticket, faculty_key, &populations)?;
        log_outcome(outcome, &scope);
        Ok(outcome)
    }

    pub fn select_group(&self, group_key: &str) -> Result<Outcome, DrillError> {
        self.navigator.lock().enter_group(group_key)
    }

    /// Loads the student's profile and history for the selected test. A
    /// deleted student has nothing left to fetch, so the detail is built from
    /// the snapshot fields of the records already held.
    pub async fn select_student(&self, student_key: &str) -> Result<Outcome, DrillError> {
        let (ticket, test_id, records) = {
            let mut navigator = self.navigator.lock();
            let records = navigator.student(student_key)?.records.clone();
            let test_id = navigator.test_id().unwrap_or_default().to_string();
            (navigator.issue(), test_id, records)
        };
        let scope = Scope::Student(student_key.to_string());

        let detail = match records.first() {
            Some(first) if first.student_id.is_none() => StudentDetail::new(
                student_key.to_string(),
                StudentProfile::from_snapshot(first),
                records.clone(),
                0,
            ),
            _ => {
                debug!(student = student_key, test_id, "fetching student profile and history");
                let fetched = tokio::try_join!(
                    self.timed(self.source.student_profile(student_key)),
                    self.timed(self.source.results_for_student_in_test(student_key, &test_id)),
                );
                match fetched {
                    Ok((profile, raw)) => {
                        let batch = normalize_batch(&raw);
                        StudentDetail::new(student_key.to_string(), profile, batch.records, batch.dropped)
                    }
                    Err(source) => return self.fail(ticket, scope, source),
                }
            }
        };

        let outcome = self.navigator.lock().open_student(ticket, detail)?;
        log_outcome(outcome, &scope);
        Ok(outcome)
    }

    /// Resolves a flagged result at the source, then updates every copy the
    /// current view holds so its attention counts drop without a refetch.
    pub async fn review_result(&self, result_id: &str) -> Result<(), DrillError> {
        let scope = Scope::Result(result_id.to_string());
        if let Err(source) = self.timed(self.source.review_result(result_id)).await {
            warn!(%scope, error = %source, "review failed");
            return Err(DrillError::Fetch { scope, source });
        }
        let held = self.navigator.lock().mark_reviewed(result_id);
        debug!(result_id, held, "result reviewed");
        Ok(())
    }

    pub fn back(&self) {
        self.navigator.lock().back();
    }

    pub fn close_drill_down(&self) {
        self.navigator.lock().close();
    }

    pub fn view(&self) -> ViewKind {
        self.navigator.lock().view()
    }

    pub fn state(&self) -> DrillState {
        self.navigator.lock().state().clone()
    }

    pub fn current_tree(&self) -> Option<Vec<AggregationNode>> {
        self.navigator.lock().current_tree().map(<[_]>::to_vec)
    }

    pub fn detail(&self) -> Option<StudentDetail> {
        self.navigator.lock().detail().cloned()
    }

    pub fn last_error(&self) -> Option<ScopeError> {
        self.navigator.lock().last_error().cloned()
    }

    pub fn dropped_records(&self) -> usize {
        self.navigator.lock().dropped_records()
    }

    pub fn scope_records(&self) -> Vec<ResultRecord> {
        self.navigator
            .lock()
            .scope_records()
            .map(<[_]>::to_vec)
            .unwrap_or_default()
    }

    /// Summary card of the innermost selection. Its rate uses the headcount of
    /// the selected node, so it always equals that node's rate in the tree.
    pub fn summary(&self) -> ScopeSummary {
        let navigator = self.navigator.lock();
        let records = navigator.scope_records().unwrap_or_default();
        report::summarize(records, navigator.scope_population().unwrap_or(0))
    }

    pub fn export_rows(&self) -> Vec<ExportRow> {
        self.navigator
            .lock()
            .scope_records()
            .map(export::export_rows)
            .unwrap_or_default()
    }

    /// Faculty headcounts are fetched once per session; overlapping first
    /// selections wait on the same fetch. A failed fetch leaves the cell empty.
    async fn faculty_populations(&self) -> Result<PopulationMap, FetchError> {
        self.faculties
            .get_or_try_init(|| self.timed(self.source.faculty_populations()))
            .await
            .cloned()
    }

    async fn timed<T>(
        &self,
        fetch: impl Future<Output = Result<T, FetchError>>,
    ) -> Result<T, FetchError> {
        tokio::time::timeout(self.fetch_timeout, fetch)
            .await
            .map_err(|_| FetchError::TimedOut {
                after: self.fetch_timeout,
            })?
    }

    fn fail(&self, ticket: Ticket, scope: Scope, source: FetchError) -> Result<Outcome, DrillError> {
        let error = ScopeError::new(&scope, &source);
        match self.navigator.lock().record_error(ticket, error) {
            Outcome::Applied => {
                warn!(%scope, error = %source, "fetch failed");
                Err(DrillError::Fetch { scope, source })
            }
            Outcome::Superseded => {
                debug!(%scope, error = %source, "ignoring failure of superseded fetch");
                Ok(Outcome::Superseded)
            }
        }
    }
}

fn log_outcome(outcome: Outcome, scope: &Scope) {
    if outcome == Outcome::Superseded {
        debug!(%scope, "discarding response for superseded navigation");
    }
}
