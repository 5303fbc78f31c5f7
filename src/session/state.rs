//! The session state machine.
//!
//! [`SessionState`] is the single writer of job results and resource
//! records. Everything the orchestrator does to a session goes through it:
//!
//! | Operation | Effect |
//! |-----------|--------|
//! | [`SessionState::select`] | Computes desired, mandatory and bootstrap lists |
//! | [`SessionState::resolve`] | One resolution pass: flush deferred units, reselect, order, recompute readiness |
//! | [`SessionState::add_job_result`] | Records an outcome and feeds resource/local output back into the catalogue |
//! | [`SessionState::to_document`] / [`SessionState::resume`] | Checkpoint and restore |
//!
//! Units discovered at run time are appended to a discovery log that is
//! part of the checkpoint. Resuming replays that log instead of running
//! generator jobs again, so the catalogue after resume is the one the
//! session had when it was saved.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::iolog::{IoLogRecord, stdout_text};
use super::storage::SessionStorage;
use super::suspend::{DiscoveredUnit, SESSION_DOCUMENT_VERSION, SessionDocument, SessionSnapshot};
use super::{ResumeError, SessionError, SessionResult};
use crate::provider::parse_units;
use crate::qualifier::{Selection, SelectionRules, SelectionSource};
use crate::resolver::{self, InhibitionCause, Inhibitor, PassBudget, compute_inhibitors};
use crate::resource::{ResourceMap, parse_resource_output};
use crate::template;
use crate::unit::{Addition, JobDefinition, Plugin, Unit, UnitCatalogue};

/// Set from creation until the session is finalized.
pub const FLAG_INCOMPLETE: &str = "incomplete";
/// Set once results were handed off for export.
pub const FLAG_SUBMITTED: &str = "submitted";

/// Terminal (or absent) outcome of a job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Outcome {
    /// The job has not run.
    #[default]
    None,
    Pass,
    Fail,
    Skip,
    NotSupported,
    /// The job ran but the operator still has to decide.
    Undecided,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::None => "none",
            Outcome::Pass => "pass",
            Outcome::Fail => "fail",
            Outcome::Skip => "skip",
            Outcome::NotSupported => "not-supported",
            Outcome::Undecided => "undecided",
        }
    }

    /// Pass and fail may only be replaced through an explicit re-run.
    pub fn is_final(&self) -> bool {
        matches!(self, Outcome::Pass | Outcome::Fail)
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Outcome {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(Outcome::None),
            "pass" => Ok(Outcome::Pass),
            "fail" => Ok(Outcome::Fail),
            "skip" => Ok(Outcome::Skip),
            "not-supported" => Ok(Outcome::NotSupported),
            "undecided" => Ok(Outcome::Undecided),
            other => Err(format!("unknown outcome '{}'", other)),
        }
    }
}

/// One recorded result of a job.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobResult {
    pub outcome: Outcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comments: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub return_code: Option<i32>,
    /// File name of the I/O log inside the session's `io-logs` directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub io_log_filename: Option<String>,
    /// Wall-clock seconds the command ran.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_duration: Option<f64>,
}

impl JobResult {
    pub fn new(outcome: Outcome) -> Self {
        Self {
            outcome,
            ..Default::default()
        }
    }

    pub fn with_comments(mut self, comments: impl Into<String>) -> Self {
        self.comments = Some(comments.into());
        self
    }

    pub fn with_return_code(mut self, code: i32) -> Self {
        self.return_code = Some(code);
        self
    }

    pub fn with_io_log(mut self, filename: impl Into<String>) -> Self {
        self.io_log_filename = Some(filename.into());
        self
    }

    pub fn with_duration(mut self, seconds: f64) -> Self {
        self.execution_duration = Some(seconds);
        self
    }
}

/// Everything the session knows about one job.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobState {
    /// The latest result; outcome `none` until the job runs.
    pub result: JobResult,
    pub history: Vec<JobResult>,
    pub inhibitors: Vec<Inhibitor>,
    /// The generator job whose output defined (or re-emitted) this job.
    pub via: Option<String>,
    pub effective_category: Option<String>,
    rerun_requested: bool,
}

impl JobState {
    pub fn outcome(&self) -> Outcome {
        self.result.outcome
    }

    pub fn is_runnable(&self) -> bool {
        self.inhibitors.is_empty()
    }

    /// The result to record for a job that cannot run, if it is inhibited.
    ///
    /// A `requires` expression that does not hold makes the job
    /// not-supported on this system; any other inhibitor skips it.
    pub fn inhibited_result(&self) -> Option<JobResult> {
        if self.inhibitors.is_empty() {
            return None;
        }
        let outcome = if self
            .inhibitors
            .iter()
            .any(|i| i.cause == InhibitionCause::FailedResource)
        {
            Outcome::NotSupported
        } else {
            Outcome::Skip
        };
        let reasons: Vec<String> = self.inhibitors.iter().map(ToString::to_string).collect();
        Some(
            JobResult::new(outcome)
                .with_comments(format!("job cannot be started: {}", reasons.join(", "))),
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionPhase {
    New,
    Selecting,
    Resolving,
    Running,
    Complete,
}

impl fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SessionPhase::New => "new",
            SessionPhase::Selecting => "selecting",
            SessionPhase::Resolving => "resolving",
            SessionPhase::Running => "running",
            SessionPhase::Complete => "complete",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionMetadata {
    pub title: Option<String>,
    pub flags: BTreeSet<String>,
    /// The job dispatched last and not yet recorded.
    pub running_job_name: Option<String>,
    /// Opaque data owned by the application driving the session.
    #[serde(default)]
    pub app_blob: Option<String>,
    #[serde(default)]
    pub app_id: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub selection: Option<SelectionSource>,
}

impl SessionMetadata {
    pub fn new(title: Option<String>) -> Self {
        Self {
            title,
            flags: [FLAG_INCOMPLETE.to_string()].into_iter().collect(),
            running_job_name: None,
            app_blob: None,
            app_id: None,
            created_at: Utc::now(),
            selection: None,
        }
    }

    pub fn is_incomplete(&self) -> bool {
        self.flags.contains(FLAG_INCOMPLETE)
    }
}

/// What recording a result changed beyond the result itself.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResultEffect {
    /// Units added to the catalogue (or queued for the next pass).
    pub new_units: usize,
    pub resources_updated: bool,
}

impl ResultEffect {
    /// The run list is stale and another resolution pass is needed.
    pub fn needs_resolution(&self) -> bool {
        self.new_units > 0
    }
}

pub struct SessionState {
    catalogue: UnitCatalogue,
    rules: Option<SelectionRules>,
    metadata: SessionMetadata,
    phase: SessionPhase,
    job_states: BTreeMap<String, JobState>,
    resource_map: ResourceMap,
    desired_job_list: Vec<String>,
    mandatory_job_list: Vec<String>,
    bootstrap_job_list: Vec<String>,
    run_list: Vec<String>,
    discoveries: Vec<DiscoveredUnit>,
    deferred: Vec<(String, Unit)>,
    /// Discovery generation of run-time units; catalogue units are 0.
    generations: HashMap<String, usize>,
    /// Deepest generation added since the last pass.
    pending_depth: usize,
    budget: PassBudget,
}

impl SessionState {
    pub fn new(catalogue: UnitCatalogue, metadata: SessionMetadata) -> Self {
        let job_states = catalogue
            .jobs()
            .map(|job| (job.id.clone(), JobState::default()))
            .collect();
        Self {
            catalogue,
            rules: None,
            metadata,
            phase: SessionPhase::New,
            job_states,
            resource_map: ResourceMap::new(),
            desired_job_list: Vec::new(),
            mandatory_job_list: Vec::new(),
            bootstrap_job_list: Vec::new(),
            run_list: Vec::new(),
            discoveries: Vec::new(),
            deferred: Vec::new(),
            generations: HashMap::new(),
            pending_depth: 0,
            budget: PassBudget::default(),
        }
    }

    pub fn with_max_passes(mut self, max: usize) -> Self {
        self.budget = PassBudget::new(max);
        self
    }

    pub fn catalogue(&self) -> &UnitCatalogue {
        &self.catalogue
    }

    pub fn metadata(&self) -> &SessionMetadata {
        &self.metadata
    }

    pub fn metadata_mut(&mut self) -> &mut SessionMetadata {
        &mut self.metadata
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    pub fn job(&self, id: &str) -> Option<&JobDefinition> {
        self.catalogue.job(id)
    }

    pub fn job_state(&self, id: &str) -> Option<&JobState> {
        self.job_states.get(id)
    }

    pub fn job_states(&self) -> impl Iterator<Item = (&String, &JobState)> {
        self.job_states.iter()
    }

    pub fn outcome_of(&self, id: &str) -> Outcome {
        self.job_states
            .get(id)
            .map(JobState::outcome)
            .unwrap_or_default()
    }

    pub fn resource_map(&self) -> &ResourceMap {
        &self.resource_map
    }

    pub fn desired_job_list(&self) -> &[String] {
        &self.desired_job_list
    }

    pub fn mandatory_job_list(&self) -> &[String] {
        &self.mandatory_job_list
    }

    pub fn bootstrap_job_list(&self) -> &[String] {
        &self.bootstrap_job_list
    }

    pub fn run_list(&self) -> &[String] {
        &self.run_list
    }

    pub fn discoveries(&self) -> &[DiscoveredUnit] {
        &self.discoveries
    }

    /// Resolution passes performed since this state was created or resumed.
    pub fn resolution_passes(&self) -> usize {
        self.budget.passes()
    }

    /// Selects jobs through test-plan or whitelist rules.
    ///
    /// The rules are kept and reapplied on every resolution pass, so
    /// patterns also pick up jobs discovered later.
    pub fn select(&mut self, source: SelectionSource) -> SessionResult<()> {
        let rules = SelectionRules::from_source(&source, &self.catalogue)?;
        self.phase = SessionPhase::Selecting;
        let selection = rules.select(&self.catalogue);
        self.apply_selection(selection);
        self.rules = Some(rules);
        self.metadata.selection = Some(source);
        info!(
            "Selected {} jobs ({} mandatory, {} bootstrap)",
            self.desired_job_list.len(),
            self.mandatory_job_list.len(),
            self.bootstrap_job_list.len()
        );
        Ok(())
    }

    /// Uses fixed job lists instead of selection rules.
    pub fn set_selection(&mut self, selection: Selection) {
        self.phase = SessionPhase::Selecting;
        self.rules = None;
        self.metadata.selection = None;
        self.apply_selection(selection);
    }

    fn apply_selection(&mut self, selection: Selection) {
        self.desired_job_list = selection.desired;
        self.mandatory_job_list = selection.mandatory;
        self.bootstrap_job_list = selection.bootstrap;
    }

    /// Runs one resolution pass and returns its number.
    ///
    /// Results already recorded are kept; only the run list and readiness
    /// are recomputed. Fails when generated units chain deeper than the
    /// pass ceiling.
    pub fn resolve(&mut self) -> SessionResult<usize> {
        let pass = self.budget.next_pass(self.pending_depth)?;
        self.phase = SessionPhase::Resolving;

        for (via, unit) in std::mem::take(&mut self.deferred) {
            self.insert_unit(unit, &via);
        }
        self.pending_depth = 0;
        if let Some(rules) = &self.rules {
            let selection = rules.select(&self.catalogue);
            self.apply_selection(selection);
        }

        self.run_list = resolver::resolve(
            &self.catalogue,
            &self.bootstrap_job_list,
            &self.desired_job_list,
        )?;
        self.update_readiness();
        self.phase = SessionPhase::Running;
        info!(
            "Resolution pass {}: {} jobs in run list",
            pass,
            self.run_list.len()
        );
        Ok(pass)
    }

    /// Recomputes inhibitors and effective categories of every job.
    pub fn update_readiness(&mut self) {
        let on_run_list: HashSet<&str> = self.run_list.iter().map(String::as_str).collect();
        let updates: Vec<(String, Vec<Inhibitor>, Option<String>)> = self
            .catalogue
            .jobs()
            .map(|job| {
                let inhibitors = compute_inhibitors(
                    job,
                    on_run_list.contains(job.id.as_str()),
                    |id| self.outcome_of(id),
                    &self.resource_map,
                );
                let category = match &self.rules {
                    Some(rules) => rules.effective_category(job),
                    None => job.category_id.clone(),
                };
                (job.id.clone(), inhibitors, category)
            })
            .collect();

        for (id, inhibitors, category) in updates {
            let state = self.job_states.entry(id).or_default();
            state.inhibitors = inhibitors;
            state.effective_category = category;
        }
    }

    /// The first run-list job still waiting to run.
    pub fn next_pending_job(&self) -> Option<&str> {
        self.run_list
            .iter()
            .find(|id| {
                self.job_states
                    .get(id.as_str())
                    .is_none_or(|s| s.outcome() == Outcome::None || s.rerun_requested)
            })
            .map(String::as_str)
    }

    /// Allows the next result of `job_id` to replace a pass or fail.
    pub fn request_rerun(&mut self, job_id: &str) -> SessionResult<()> {
        let state = self
            .job_states
            .get_mut(job_id)
            .ok_or_else(|| SessionError::UnknownJob(job_id.to_string()))?;
        state.rerun_requested = true;
        Ok(())
    }

    pub fn set_running(&mut self, job_id: &str) {
        self.metadata.running_job_name = Some(job_id.to_string());
    }

    /// The job dispatched before the last checkpoint that has no result.
    pub fn in_flight_job(&self) -> Option<&str> {
        self.metadata.running_job_name.as_deref()
    }

    /// Records a result for `job_id`.
    ///
    /// Writing the same result again is a no-op. Replacing a pass or fail
    /// requires [`request_rerun`](Self::request_rerun) first. Resource and
    /// local job output in `io_log` is fed back into the session.
    pub fn add_job_result(
        &mut self,
        job_id: &str,
        result: JobResult,
        io_log: &[IoLogRecord],
    ) -> SessionResult<ResultEffect> {
        let job = self
            .catalogue
            .job(job_id)
            .cloned()
            .ok_or_else(|| SessionError::UnknownJob(job_id.to_string()))?;

        let state = self.job_states.entry(job_id.to_string()).or_default();
        if !state.rerun_requested {
            if state.history.last() == Some(&result) {
                debug!("Result for {} already recorded", job_id);
                return Ok(ResultEffect::default());
            }
            if state.outcome().is_final() {
                return Err(SessionError::ResultOverwrite {
                    job: job_id.to_string(),
                    outcome: state.outcome(),
                });
            }
        }
        let outcome = result.outcome;
        state.history.push(result.clone());
        state.result = result;
        state.rerun_requested = false;

        if self.metadata.running_job_name.as_deref() == Some(job_id) {
            self.metadata.running_job_name = None;
        }
        info!("Recorded {} for {}", outcome, job_id);

        let mut effect = ResultEffect::default();
        if outcome != Outcome::None {
            match job.plugin {
                Plugin::Resource => effect = self.record_resources(&job, io_log),
                Plugin::Local => effect.new_units = self.record_local_units(&job, io_log),
                _ => {}
            }
        }
        self.update_readiness();
        Ok(effect)
    }

    fn record_resources(&mut self, job: &JobDefinition, io_log: &[IoLogRecord]) -> ResultEffect {
        let records = match parse_resource_output(&stdout_text(io_log)) {
            Ok(records) => records,
            Err(e) => {
                warn!("Ignoring malformed output of resource job {}: {}", job.id, e);
                Vec::new()
            }
        };
        debug!("Resource job {} produced {} records", job.id, records.len());
        self.resource_map.insert(job.id.clone(), records.clone());

        let (units, _) = template::expand_for_resource(&self.catalogue, &job.id, &records);
        let new_units = units
            .into_iter()
            .map(|unit| self.discover(unit, &job.id))
            .filter(|added| *added)
            .count();
        ResultEffect {
            new_units,
            resources_updated: true,
        }
    }

    fn record_local_units(&mut self, job: &JobDefinition, io_log: &[IoLogRecord]) -> usize {
        let report = parse_units(&job.namespace, &job.id, &stdout_text(io_log));
        let mut privileged_in_pass = self.run_list.iter().any(|id| {
            self.catalogue
                .job(id)
                .is_some_and(|j| j.user.is_some())
        });

        let mut new_units = 0;
        for unit in report.units {
            let privileged = unit.as_job().is_some_and(|j| j.user.is_some());
            if privileged && privileged_in_pass && !self.catalogue.contains(unit.id()) {
                info!(
                    "Deferring {} from {} to the next resolution pass",
                    unit.id(),
                    job.id
                );
                self.discoveries.push(discovered(&unit, &job.id));
                self.pending_depth = self.pending_depth.max(self.generation_of(&job.id) + 1);
                self.deferred.push((job.id.clone(), unit));
                new_units += 1;
                continue;
            }
            privileged_in_pass |= privileged;
            if self.discover(unit, &job.id) {
                new_units += 1;
            }
        }
        new_units
    }

    /// Adds a run-time unit and logs it for replay.
    fn discover(&mut self, unit: Unit, via: &str) -> bool {
        let entry = discovered(&unit, via);
        if self.insert_unit(unit, via) {
            self.discoveries.push(entry);
            true
        } else {
            false
        }
    }

    fn generation_of(&self, id: &str) -> usize {
        self.generations.get(id).copied().unwrap_or(0)
    }

    /// Adds a unit to the catalogue; returns whether it was new.
    ///
    /// A verbatim re-emission of a known job only records `via`. A
    /// conflicting redefinition is dropped.
    fn insert_unit(&mut self, unit: Unit, via: &str) -> bool {
        let id = unit.id().to_string();
        let new_template = match &unit {
            Unit::Template(t) => Some(t.clone()),
            _ => None,
        };
        let is_job = unit.as_job().is_some();

        match self.catalogue.add(unit) {
            Ok(Addition::Added) => {
                let generation = self.generation_of(via) + 1;
                self.generations.insert(id.clone(), generation);
                self.pending_depth = self.pending_depth.max(generation);
                if is_job {
                    self.job_states.entry(id.clone()).or_default().via = Some(via.to_string());
                }
                debug!("Discovered {} via {}", id, via);
                if let Some(template) = new_template
                    && let Some(records) = self.resource_map.get(&template.template_resource).cloned()
                {
                    match template::expand(&template, &records) {
                        Ok(units) => {
                            for unit in units {
                                self.discover(unit, &template.template_resource);
                            }
                        }
                        Err(e) => warn!("{}", e),
                    }
                }
                true
            }
            Ok(Addition::AlreadyPresent) => {
                if is_job {
                    let state = self.job_states.entry(id).or_default();
                    if state.via.is_none() {
                        state.via = Some(via.to_string());
                    }
                }
                false
            }
            Err(e) => {
                warn!("Dropping unit emitted by {}: {}", via, e);
                false
            }
        }
    }

    /// Marks the session complete.
    pub fn finalize(&mut self) {
        self.phase = SessionPhase::Complete;
        self.metadata.flags.remove(FLAG_INCOMPLETE);
        self.metadata.running_job_name = None;
        info!("Session finalized");
    }

    pub fn mark_submitted(&mut self) {
        self.metadata.flags.insert(FLAG_SUBMITTED.to_string());
    }

    /// Captures the full session state.
    pub fn to_document(&self) -> SessionDocument {
        let results: BTreeMap<String, Vec<_>> = self
            .job_states
            .iter()
            .filter(|(_, s)| !s.history.is_empty())
            .map(|(id, s)| (id.clone(), s.history.clone()))
            .collect();

        let jobs = self
            .run_list
            .iter()
            .chain(results.keys())
            .filter_map(|id| {
                self.catalogue
                    .get(id)
                    .map(|unit| (id.clone(), unit.checksum().to_string()))
            })
            .collect();

        let via = self
            .job_states
            .iter()
            .filter_map(|(id, s)| s.via.clone().map(|v| (id.clone(), v)))
            .collect();

        SessionDocument::new(SessionSnapshot {
            jobs,
            results,
            resource_map: self.resource_map.clone(),
            desired_job_list: self.desired_job_list.clone(),
            mandatory_job_list: self.mandatory_job_list.clone(),
            bootstrap_job_list: self.bootstrap_job_list.clone(),
            run_list: self.run_list.clone(),
            via,
            discoveries: self.discoveries.clone(),
            metadata: self.metadata.clone(),
        })
    }

    /// Writes a checkpoint to `storage`.
    pub fn checkpoint(&self, storage: &SessionStorage) -> SessionResult<()> {
        let data = self.to_document().encode()?;
        storage.save_checkpoint(&data)
    }

    /// Restores a session saved with [`to_document`](Self::to_document).
    ///
    /// Fails when a job the session recorded or scheduled is gone from
    /// `catalogue` or has a different definition. The job in flight at save
    /// time keeps outcome `none` and stays in
    /// [`in_flight_job`](Self::in_flight_job) for the caller to settle.
    pub fn resume(document: SessionDocument, catalogue: UnitCatalogue) -> SessionResult<Self> {
        if document.version != SESSION_DOCUMENT_VERSION {
            return Err(ResumeError::UnsupportedVersion(document.version).into());
        }
        let snapshot = document.session;
        let mut state = SessionState::new(catalogue, snapshot.metadata);
        state.resource_map = snapshot.resource_map;

        for entry in &snapshot.discoveries {
            let unit = Unit::from_fields(&entry.namespace, entry.fields.clone()).map_err(|e| {
                ResumeError::Corrupted(format!("discovered unit is invalid: {}", e))
            })?;
            state.insert_unit(unit, &entry.via);
        }
        state.discoveries = snapshot.discoveries;

        for (id, checksum) in &snapshot.jobs {
            let unit = state
                .catalogue
                .get(id)
                .ok_or_else(|| ResumeError::UnknownJob(id.clone()))?;
            if unit.checksum() != checksum {
                return Err(ResumeError::ChecksumMismatch { job: id.clone() }.into());
            }
        }

        for (id, history) in snapshot.results {
            let job_state = state.job_states.entry(id).or_default();
            job_state.result = history.last().cloned().unwrap_or_default();
            job_state.history = history;
        }
        for (id, via) in snapshot.via {
            state.job_states.entry(id).or_default().via = Some(via);
        }

        state.desired_job_list = snapshot.desired_job_list;
        state.mandatory_job_list = snapshot.mandatory_job_list;
        state.bootstrap_job_list = snapshot.bootstrap_job_list;
        state.run_list = snapshot.run_list;

        if let Some(source) = &state.metadata.selection {
            let rules = SelectionRules::from_source(source, &state.catalogue)
                .map_err(|e| ResumeError::Corrupted(e.to_string()))?;
            state.rules = Some(rules);
        }

        state.update_readiness();
        state.phase = if state.metadata.is_incomplete() {
            SessionPhase::Running
        } else {
            SessionPhase::Complete
        };
        info!(
            "Resumed session with {} results and {} jobs in run list",
            state.job_states.values().filter(|s| !s.history.is_empty()).count(),
            state.run_list.len()
        );
        Ok(state)
    }

    /// Loads the checkpoint in `storage`; `None` if there is none yet.
    pub fn load(storage: &SessionStorage, catalogue: UnitCatalogue) -> SessionResult<Option<Self>> {
        match storage.load_checkpoint()? {
            Some(data) => {
                let document = SessionDocument::decode(&data)?;
                Ok(Some(Self::resume(document, catalogue)?))
            }
            None => Ok(None),
        }
    }
}

fn discovered(unit: &Unit, via: &str) -> DiscoveredUnit {
    DiscoveredUnit {
        via: via.to_string(),
        namespace: unit.namespace().to_string(),
        fields: unit.fields().clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{IoStream, SessionRepository};
    use tempfile::TempDir;

    fn catalogue(text: &str) -> UnitCatalogue {
        let report = parse_units("ns", "test", text);
        assert!(report.problems.is_empty(), "{:?}", report.problems);
        let mut catalogue = UnitCatalogue::new();
        assert!(catalogue.extend(report.units).is_empty());
        catalogue
    }

    fn stdout(text: &str) -> Vec<IoLogRecord> {
        vec![IoLogRecord::new(0.0, IoStream::Stdout, text)]
    }

    fn ids(list: &[&str]) -> Vec<String> {
        list.iter().map(|id| format!("ns::{}", id)).collect()
    }

    fn session(text: &str, desired: &[&str]) -> SessionState {
        let mut state = SessionState::new(catalogue(text), SessionMetadata::new(None));
        state.set_selection(Selection {
            desired: ids(desired),
            ..Default::default()
        });
        state
    }

    fn whitelist(pattern: &str) -> SelectionSource {
        SelectionSource::Whitelist {
            namespace: "ns".into(),
            include: pattern.into(),
            exclude: String::new(),
        }
    }

    const PKG: &str = "\
id: pkg
plugin: resource
command: list-packages

id: t
plugin: shell
command: fwts
requires: pkg.name == \"fwts\"
";

    #[test]
    fn test_resource_job_unblocks_requirement() {
        let mut state = session(PKG, &["t"]);
        state.resolve().unwrap();
        assert_eq!(state.run_list(), ids(&["pkg", "t"]).as_slice());
        assert_eq!(state.next_pending_job(), Some("ns::pkg"));

        let t = state.job_state("ns::t").unwrap();
        assert_eq!(t.inhibitors[0].cause, InhibitionCause::PendingResource);

        let effect = state
            .add_job_result(
                "ns::pkg",
                JobResult::new(Outcome::Pass),
                &stdout("name: fwts\n\nname: foo\n"),
            )
            .unwrap();
        assert!(effect.resources_updated);
        assert!(!effect.needs_resolution());
        assert_eq!(state.resource_map()["ns::pkg"].len(), 2);
        assert!(state.job_state("ns::t").unwrap().is_runnable());
        assert_eq!(state.next_pending_job(), Some("ns::t"));
    }

    #[test]
    fn test_unsatisfied_requirement_is_not_supported() {
        let mut state = session(PKG, &["t"]);
        state.resolve().unwrap();
        state
            .add_job_result("ns::pkg", JobResult::new(Outcome::Pass), &stdout("name: foo\n"))
            .unwrap();
        let t = state.job_state("ns::t").unwrap();
        let result = t.inhibited_result().unwrap();
        assert_eq!(result.outcome, Outcome::NotSupported);
        assert!(result.comments.unwrap().contains("failed-resource"));
    }

    #[test]
    fn test_failed_dependency_is_skipped() {
        let mut state = session(
            "id: a\nplugin: shell\ncommand: false\n\nid: b\nplugin: shell\ncommand: true\ndepends: a\n",
            &["b"],
        );
        state.resolve().unwrap();
        state
            .add_job_result("ns::a", JobResult::new(Outcome::Fail), &[])
            .unwrap();
        let result = state.job_state("ns::b").unwrap().inhibited_result().unwrap();
        assert_eq!(result.outcome, Outcome::Skip);
    }

    #[test]
    fn test_resolve_is_idempotent() {
        let mut state = session(PKG, &["t"]);
        state.resolve().unwrap();
        let first = state.run_list().to_vec();
        state.resolve().unwrap();
        assert_eq!(state.run_list(), first.as_slice());
        assert_eq!(state.resolution_passes(), 2);
    }

    #[test]
    fn test_pass_ceiling_bounds_generation_chains() {
        let mut state = SessionState::new(
            catalogue("id: gen\nplugin: local\ncommand: emit\n"),
            SessionMetadata::new(None),
        )
        .with_max_passes(1);
        state.select(whitelist(".*")).unwrap();
        state.resolve().unwrap();
        // Passes without new units are free.
        state.resolve().unwrap();

        state
            .add_job_result(
                "ns::gen",
                JobResult::new(Outcome::Pass),
                &stdout("id: gen2\nplugin: local\ncommand: emit\n"),
            )
            .unwrap();
        state.resolve().unwrap();

        state
            .add_job_result(
                "ns::gen2",
                JobResult::new(Outcome::Pass),
                &stdout("id: gen3\nplugin: shell\ncommand: true\n"),
            )
            .unwrap();
        assert!(matches!(
            state.resolve(),
            Err(SessionError::Resolve(resolver::ResolveError::Diverged(1)))
        ));
    }

    #[test]
    fn test_independent_generators_do_not_exhaust_ceiling() {
        let text: String = (0..5)
            .map(|i| format!("id: gen{}\nplugin: local\ncommand: emit\n\n", i))
            .collect();
        let mut state = SessionState::new(catalogue(&text), SessionMetadata::new(None))
            .with_max_passes(1);
        state.select(whitelist(".*")).unwrap();
        state.resolve().unwrap();

        for i in 0..5 {
            let emitted = format!("id: out{}\nplugin: shell\ncommand: true\n", i);
            let effect = state
                .add_job_result(
                    &format!("ns::gen{}", i),
                    JobResult::new(Outcome::Pass),
                    &stdout(&emitted),
                )
                .unwrap();
            assert_eq!(effect.new_units, 1);
            state.resolve().unwrap();
        }
        assert_eq!(state.resolution_passes(), 6);
        assert_eq!(state.run_list().len(), 10);
    }

    #[test]
    fn test_local_job_adds_one_pass() {
        let mut state =
            SessionState::new(catalogue("id: gen\nplugin: local\ncommand: emit\n"), SessionMetadata::new(None));
        state.select(whitelist(".*")).unwrap();
        state.resolve().unwrap();
        assert_eq!(state.run_list(), ids(&["gen"]).as_slice());

        let effect = state
            .add_job_result(
                "ns::gen",
                JobResult::new(Outcome::Pass),
                &stdout("id: generated\nplugin: shell\ncommand: true\n"),
            )
            .unwrap();
        assert_eq!(effect.new_units, 1);
        state.resolve().unwrap();

        assert_eq!(state.resolution_passes(), 2);
        assert_eq!(state.run_list(), ids(&["gen", "generated"]).as_slice());
        assert_eq!(
            state.job_state("ns::generated").unwrap().via.as_deref(),
            Some("ns::gen")
        );
        assert_eq!(state.discoveries().len(), 1);
        assert_eq!(state.next_pending_job(), Some("ns::generated"));
    }

    #[test]
    fn test_verbatim_reemission_sets_via_and_conflicts_are_dropped() {
        let text = "id: gen\nplugin: local\ncommand: emit\n\nid: known\nplugin: shell\ncommand: true\n";
        let mut state = session(text, &["gen"]);
        state.resolve().unwrap();
        let effect = state
            .add_job_result(
                "ns::gen",
                JobResult::new(Outcome::Pass),
                &stdout("id: known\nplugin: shell\ncommand: true\n\nid: gen\nplugin: shell\n"),
            )
            .unwrap();
        assert_eq!(effect.new_units, 0);
        assert_eq!(
            state.job_state("ns::known").unwrap().via.as_deref(),
            Some("ns::gen")
        );
        assert_eq!(state.job("ns::gen").unwrap().plugin, Plugin::Local);
    }

    #[test]
    fn test_template_instantiation_from_resource() {
        let text = "\
id: device
plugin: resource
command: list-devices

unit: template
template-resource: device
template-filter: device.physical == 'yes'
id: disk/read_{name}
plugin: shell
command: read /dev/{name}
";
        let mut state = SessionState::new(catalogue(text), SessionMetadata::new(None));
        state
            .select(SelectionSource::Whitelist {
                namespace: "ns".into(),
                include: "device\ndisk/.*".into(),
                exclude: String::new(),
            })
            .unwrap();
        state.resolve().unwrap();
        let effect = state
            .add_job_result(
                "ns::device",
                JobResult::new(Outcome::Pass),
                &stdout(
                    "name: sda\nphysical: yes\n\nname: loop0\nphysical: no\n\nname: sdb\nphysical: yes\n",
                ),
            )
            .unwrap();
        assert_eq!(effect.new_units, 2);
        state.resolve().unwrap();
        assert_eq!(
            state.run_list(),
            ids(&["device", "disk/read_sda", "disk/read_sdb"]).as_slice()
        );
        assert_eq!(
            state.job_state("ns::disk/read_sdb").unwrap().via.as_deref(),
            Some("ns::device")
        );
    }

    #[test]
    fn test_privileged_units_are_deferred() {
        let text = "\
id: gen
plugin: local
command: emit

id: root-job
plugin: shell
command: true
user: root
";
        let mut state = session(text, &["gen", "root-job"]);
        state.resolve().unwrap();
        let effect = state
            .add_job_result(
                "ns::gen",
                JobResult::new(Outcome::Pass),
                &stdout("id: more-root\nplugin: shell\ncommand: true\nuser: root\n"),
            )
            .unwrap();
        assert_eq!(effect.new_units, 1);
        assert!(state.job("ns::more-root").is_none());

        state.resolve().unwrap();
        assert!(state.job("ns::more-root").is_some());
        assert_eq!(
            state.job_state("ns::more-root").unwrap().via.as_deref(),
            Some("ns::gen")
        );
    }

    #[test]
    fn test_result_overwrite_rules() {
        let mut state = session(PKG, &["t"]);
        state.resolve().unwrap();
        state
            .add_job_result("ns::t", JobResult::new(Outcome::Pass), &[])
            .unwrap();
        // Same result again is a no-op.
        state
            .add_job_result("ns::t", JobResult::new(Outcome::Pass), &[])
            .unwrap();
        assert!(matches!(
            state.add_job_result("ns::t", JobResult::new(Outcome::Fail), &[]),
            Err(SessionError::ResultOverwrite { .. })
        ));

        state.request_rerun("ns::t").unwrap();
        assert_eq!(state.next_pending_job(), Some("ns::pkg"));
        state
            .add_job_result("ns::t", JobResult::new(Outcome::Fail), &[])
            .unwrap();
        let t = state.job_state("ns::t").unwrap();
        assert_eq!(t.outcome(), Outcome::Fail);
        assert_eq!(t.history.len(), 2);
    }

    #[test]
    fn test_unknown_job_result() {
        let mut state = session(PKG, &["t"]);
        assert!(matches!(
            state.add_job_result("ns::ghost", JobResult::new(Outcome::Pass), &[]),
            Err(SessionError::UnknownJob(_))
        ));
    }

    #[test]
    fn test_checkpoint_resume_round_trip() {
        let text = "id: gen\nplugin: local\ncommand: emit\n\nid: pkg\nplugin: resource\ncommand: list\n";
        let mut state = SessionState::new(catalogue(text), SessionMetadata::new(Some("t".into())));
        state.select(whitelist(".*")).unwrap();
        state.resolve().unwrap();
        state
            .add_job_result(
                "ns::gen",
                JobResult::new(Outcome::Pass),
                &stdout("id: generated\nplugin: shell\ncommand: true\n"),
            )
            .unwrap();
        state.resolve().unwrap();
        state
            .add_job_result("ns::pkg", JobResult::new(Outcome::Pass), &stdout("a: 1\n"))
            .unwrap();
        state.set_running("ns::generated");

        let dir = TempDir::new().unwrap();
        let storage = SessionRepository::new(dir.path()).create().unwrap();
        state.checkpoint(&storage).unwrap();

        let resumed = SessionState::load(&storage, catalogue(text))
            .unwrap()
            .unwrap();
        assert_eq!(resumed.run_list(), state.run_list());
        assert_eq!(resumed.desired_job_list(), state.desired_job_list());
        assert_eq!(resumed.resource_map(), state.resource_map());
        assert_eq!(
            resumed.job_states().collect::<Vec<_>>(),
            state.job_states().collect::<Vec<_>>()
        );
        assert_eq!(resumed.in_flight_job(), Some("ns::generated"));
        assert_eq!(resumed.next_pending_job(), Some("ns::generated"));
        assert_eq!(resumed.phase(), SessionPhase::Running);
    }

    #[test]
    fn test_resume_detects_changed_definitions() {
        let mut state = session(PKG, &["t"]);
        state.resolve().unwrap();
        let document = state.to_document();

        let changed = PKG.replace("command: fwts", "command: fwts --all");
        assert!(matches!(
            SessionState::resume(document.clone(), catalogue(&changed)),
            Err(SessionError::Resume(ResumeError::ChecksumMismatch { .. }))
        ));

        let missing = catalogue("id: pkg\nplugin: resource\ncommand: list-packages\n");
        assert!(matches!(
            SessionState::resume(document, missing),
            Err(SessionError::Resume(ResumeError::UnknownJob(_)))
        ));
    }

    #[test]
    fn test_finalize_clears_incomplete() {
        let mut state = session(PKG, &["t"]);
        assert!(state.metadata().is_incomplete());
        state.finalize();
        state.mark_submitted();
        assert_eq!(state.phase(), SessionPhase::Complete);
        assert!(!state.metadata().is_incomplete());
        assert!(state.metadata().flags.contains(FLAG_SUBMITTED));
    }
}
