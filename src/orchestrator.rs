//! The run loop.
//!
//! The orchestrator drives one session from its current state to
//! completion, one job at a time, in run-list order:
//!
//! ```text
//!        checkpoint ──► resolve ──► checkpoint
//!                                      │
//!            ┌─────────────────────────┘
//!            ▼
//!   next pending job? ── no ──► finalize ──► checkpoint ──► RunSummary
//!            │ yes
//!            ▼
//!   inhibited? ── yes ──► record skip / not-supported ─────────┐
//!            │ no                                              │
//!            ▼                                                 │
//!   set running ──► checkpoint ──► controller.run_job()        │
//!                                        │                     │
//!                                        ▼                     │
//!                               record result ◄────────────────┘
//!                                        │
//!                                   checkpoint
//!                                        │
//!                         new units? ── yes ──► resolve ──► checkpoint
//! ```
//!
//! Only checkpoint failures and resolution errors stop a run with an error.
//! Anything that goes wrong while running a job becomes that job's `fail`
//! outcome. Cancelling the token stops the loop before the next job; the
//! job already running is allowed to finish and its result is recorded.
//!
//! A `noreturn` job ends the run right after dispatch. Its result is
//! settled when the session is resumed, see
//! [`Orchestrator::settle_in_flight`].

use std::fmt;
use std::str::FromStr;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::execution::{ExecutionContext, ExecutionController, JobOutput};
use crate::report::Reporter;
use crate::session::{
    IoLogRecord, JobResult, Outcome, SessionError, SessionPhase, SessionResult, SessionState,
    SessionStorage,
};
use crate::unit::JobDefinition;

/// Totals over the run list of a session.
///
/// # Exit Codes
///
/// | Code | Meaning |
/// |------|---------|
/// | 0 | Every job ran and none failed |
/// | 1 | Some jobs failed |
/// | 2 | The run stopped early (abort or `noreturn` job); resume to continue |
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub session_id: String,
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub not_supported: usize,
    pub undecided: usize,
    /// Run-list jobs without an outcome.
    pub not_run: usize,
    pub duration: Duration,
    pub aborted: bool,
    /// The `noreturn` job dispatched last, if the run stopped for one.
    pub awaiting_return: Option<String>,
    /// Failed jobs with their comments.
    pub failures: Vec<(String, Option<String>)>,
}

impl RunSummary {
    pub fn from_session(session_id: &str, state: &SessionState, duration: Duration) -> Self {
        let mut summary = RunSummary {
            session_id: session_id.to_string(),
            total: state.run_list().len(),
            duration,
            ..Default::default()
        };
        for id in state.run_list() {
            let result = state
                .job_state(id)
                .map(|s| s.result.clone())
                .unwrap_or_default();
            match result.outcome {
                Outcome::Pass => summary.passed += 1,
                Outcome::Fail => {
                    summary.failed += 1;
                    summary.failures.push((id.clone(), result.comments));
                }
                Outcome::Skip => summary.skipped += 1,
                Outcome::NotSupported => summary.not_supported += 1,
                Outcome::Undecided => summary.undecided += 1,
                Outcome::None => summary.not_run += 1,
            }
        }
        summary
    }

    pub fn success(&self) -> bool {
        self.failed == 0 && self.not_run == 0
    }

    pub fn exit_code(&self) -> i32 {
        if self.failed > 0 {
            1
        } else if self.not_run > 0 {
            2
        } else {
            0
        }
    }
}

/// How to settle the job that was running when a session was saved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InFlightPolicy {
    Pass,
    Fail,
    Skip,
    /// Leave it pending so it runs again.
    Rerun,
}

impl fmt::Display for InFlightPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            InFlightPolicy::Pass => "pass",
            InFlightPolicy::Fail => "fail",
            InFlightPolicy::Skip => "skip",
            InFlightPolicy::Rerun => "rerun",
        })
    }
}

impl FromStr for InFlightPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pass" => Ok(InFlightPolicy::Pass),
            "fail" => Ok(InFlightPolicy::Fail),
            "skip" => Ok(InFlightPolicy::Skip),
            "rerun" => Ok(InFlightPolicy::Rerun),
            other => Err(format!("unknown in-flight policy '{}'", other)),
        }
    }
}

pub struct Orchestrator<C, R> {
    session: SessionState,
    storage: SessionStorage,
    controller: C,
    reporter: R,
    ctx: ExecutionContext,
    cancel: CancellationToken,
}

impl<C, R> Orchestrator<C, R>
where
    C: ExecutionController,
    R: Reporter,
{
    pub fn new(
        session: SessionState,
        storage: SessionStorage,
        controller: C,
        reporter: R,
        ctx: ExecutionContext,
    ) -> Self {
        Self {
            session,
            storage,
            controller,
            reporter,
            ctx,
            cancel: CancellationToken::new(),
        }
    }

    /// Token that aborts the run before the next job when cancelled.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn session(&self) -> &SessionState {
        &self.session
    }

    pub fn into_session(self) -> SessionState {
        self.session
    }

    /// Records a result for the job that was in flight when the session was
    /// saved.
    ///
    /// Without an explicit policy a `noreturn` job passes (its dispatch was
    /// expected to end the previous run) and any other job fails.
    pub async fn settle_in_flight(&mut self, policy: Option<InFlightPolicy>) -> SessionResult<()> {
        let Some(job_id) = self.session.in_flight_job().map(str::to_string) else {
            return Ok(());
        };
        let job = self
            .session
            .job(&job_id)
            .cloned()
            .ok_or_else(|| SessionError::UnknownJob(job_id.clone()))?;
        let policy = policy.unwrap_or(if job.is_noreturn() {
            InFlightPolicy::Pass
        } else {
            InFlightPolicy::Fail
        });
        info!("Settling in-flight job {} as {}", job_id, policy);

        let outcome = match policy {
            InFlightPolicy::Pass => Outcome::Pass,
            InFlightPolicy::Fail => Outcome::Fail,
            InFlightPolicy::Skip => Outcome::Skip,
            InFlightPolicy::Rerun => {
                self.session.metadata_mut().running_job_name = None;
                if self.session.outcome_of(&job_id).is_final() {
                    self.session.request_rerun(&job_id)?;
                }
                return self.checkpoint();
            }
        };
        let result = JobResult::new(outcome).with_comments("outcome set when resuming the session");
        self.record(&job, result, &[]).await
    }

    /// Runs the session until no job is pending, the token is cancelled or a
    /// `noreturn` job was dispatched.
    pub async fn run(&mut self) -> SessionResult<RunSummary> {
        let start = Instant::now();
        let mut aborted = false;
        let mut awaiting_return = None;

        if self.session.phase() != SessionPhase::Complete {
            self.checkpoint()?;
            self.resolve().await?;

            loop {
                if self.cancel.is_cancelled() {
                    warn!(
                        "Run aborted; resume session {} to continue",
                        self.storage.id()
                    );
                    aborted = true;
                    break;
                }
                let Some(job_id) = self.session.next_pending_job().map(str::to_string) else {
                    break;
                };
                let job = self
                    .session
                    .job(&job_id)
                    .cloned()
                    .ok_or_else(|| SessionError::UnknownJob(job_id.clone()))?;

                let inhibited = self
                    .session
                    .job_state(&job_id)
                    .and_then(|state| state.inhibited_result());
                if let Some(result) = inhibited {
                    info!("Not running {}: {}", job_id, result.comments.as_deref().unwrap_or(""));
                    self.record(&job, result, &[]).await?;
                    continue;
                }

                self.reporter.on_job_start(&job).await;
                self.session.set_running(&job_id);
                self.checkpoint()?;

                let output = self.dispatch(&job).await;
                if job.is_noreturn() {
                    info!(
                        "Dispatched noreturn job {}; its result is settled on resume",
                        job_id
                    );
                    awaiting_return = Some(job_id);
                    break;
                }
                self.record(&job, output.result, &output.io_log).await?;
            }

            if !aborted && awaiting_return.is_none() {
                self.session.finalize();
                self.checkpoint()?;
            }
        }

        let mut summary = RunSummary::from_session(self.storage.id(), &self.session, start.elapsed());
        summary.aborted = aborted;
        summary.awaiting_return = awaiting_return;
        self.reporter.on_run_complete(&summary).await;
        Ok(summary)
    }

    async fn dispatch(&self, job: &JobDefinition) -> JobOutput {
        let mut output = match self.controller.run_job(job, &self.ctx).await {
            Ok(output) => output,
            Err(e) => {
                error!("Could not run {}: {}", job.id, e);
                JobOutput::new(JobResult::new(Outcome::Fail).with_comments(e.to_string()))
            }
        };
        if output.result.outcome == Outcome::None {
            warn!("Controller returned no outcome for {}", job.id);
            output.result.outcome = Outcome::Fail;
        }
        output
    }

    async fn record(
        &mut self,
        job: &JobDefinition,
        result: JobResult,
        io_log: &[IoLogRecord],
    ) -> SessionResult<()> {
        let effect = self.session.add_job_result(&job.id, result.clone(), io_log)?;
        self.reporter.on_job_complete(job, &result).await;
        self.checkpoint()?;
        if effect.needs_resolution() {
            info!("{} added {} units", job.id, effect.new_units);
            self.resolve().await?;
        }
        Ok(())
    }

    async fn resolve(&mut self) -> SessionResult<()> {
        if let Err(e) = self.session.resolve() {
            error!("Resolution failed: {}", e);
            return Err(e);
        }
        self.checkpoint()?;
        self.reporter.on_run_list(self.session.run_list().len()).await;
        Ok(())
    }

    fn checkpoint(&self) -> SessionResult<()> {
        self.session.checkpoint(&self.storage).inspect_err(|e| {
            error!("Failed to checkpoint session {}: {}", self.storage.id(), e);
        })
    }
}
