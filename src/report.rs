//! Run reporting.

use async_trait::async_trait;
use console::StyledObject;

use crate::orchestrator::RunSummary;
use crate::session::{JobResult, Outcome};
use crate::unit::JobDefinition;

/// Receives events while a session runs.
#[async_trait]
pub trait Reporter: Send + Sync {
    /// Called after every resolution pass with the length of the run list.
    async fn on_run_list(&self, total: usize);

    async fn on_job_start(&self, job: &JobDefinition);

    /// Called for every recorded result, including skipped jobs.
    async fn on_job_complete(&self, job: &JobDefinition, result: &JobResult);

    async fn on_run_complete(&self, summary: &RunSummary);
}

/// A reporter that does nothing.
pub struct NullReporter;

#[async_trait]
impl Reporter for NullReporter {
    async fn on_run_list(&self, _total: usize) {}
    async fn on_job_start(&self, _job: &JobDefinition) {}
    async fn on_job_complete(&self, _job: &JobDefinition, _result: &JobResult) {}
    async fn on_run_complete(&self, _summary: &RunSummary) {}
}

/// Styled label of an outcome.
pub fn outcome_label(outcome: Outcome) -> StyledObject<&'static str> {
    match outcome {
        Outcome::Pass => console::style("PASS").green(),
        Outcome::Fail => console::style("FAIL").red(),
        Outcome::Skip => console::style("SKIP").yellow(),
        Outcome::NotSupported => console::style("N/S ").yellow(),
        Outcome::Undecided => console::style("UND ").cyan(),
        Outcome::None => console::style("----").dim(),
    }
}

/// Console reporter with a progress bar over the run list.
pub struct ConsoleReporter {
    progress: std::sync::Mutex<Option<indicatif::ProgressBar>>,
    verbose: bool,
}

impl ConsoleReporter {
    pub fn new(verbose: bool) -> Self {
        Self {
            progress: std::sync::Mutex::new(None),
            verbose,
        }
    }

    fn with_progress(&self, f: impl FnOnce(&indicatif::ProgressBar)) {
        if let Ok(progress) = self.progress.lock()
            && let Some(pb) = progress.as_ref()
        {
            f(pb);
        }
    }
}

#[async_trait]
impl Reporter for ConsoleReporter {
    async fn on_run_list(&self, total: usize) {
        let Ok(mut progress) = self.progress.lock() else {
            return;
        };
        match progress.as_ref() {
            Some(pb) => pb.set_length(total as u64),
            None => {
                let pb = indicatif::ProgressBar::new(total as u64);
                if let Ok(style) = indicatif::ProgressStyle::default_bar().template(
                    "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}",
                ) {
                    pb.set_style(style.progress_chars("#>-"));
                }
                *progress = Some(pb);
            }
        }
    }

    async fn on_job_start(&self, job: &JobDefinition) {
        let name = job.display_name().to_string();
        self.with_progress(|pb| pb.set_message(name));
    }

    async fn on_job_complete(&self, job: &JobDefinition, result: &JobResult) {
        let verbose = self.verbose;
        self.with_progress(|pb| {
            pb.inc(1);
            if verbose || result.outcome != Outcome::Pass {
                pb.println(format!("{} {}", outcome_label(result.outcome), job.id));
            }
        });
    }

    async fn on_run_complete(&self, summary: &RunSummary) {
        if let Ok(mut progress) = self.progress.lock()
            && let Some(pb) = progress.take()
        {
            pb.finish_and_clear();
        }
        print_summary(summary);
    }
}

/// Prints the totals of a run.
pub fn print_summary(summary: &RunSummary) {
    println!();
    println!("Session {}:", summary.session_id);
    println!("  Total:         {}", summary.total);
    println!("  Passed:        {}", console::style(summary.passed).green());
    println!("  Failed:        {}", console::style(summary.failed).red());
    println!("  Skipped:       {}", console::style(summary.skipped).yellow());
    println!(
        "  Not supported: {}",
        console::style(summary.not_supported).yellow()
    );
    if summary.undecided > 0 {
        println!("  Undecided:     {}", console::style(summary.undecided).cyan());
    }
    if summary.not_run > 0 {
        println!("  Not run:       {}", console::style(summary.not_run).red().bold());
    }
    println!("  Duration:      {:?}", summary.duration);
    println!();

    if let Some(job) = &summary.awaiting_return {
        println!(
            "{}",
            console::style(format!(
                "Dispatched {}; resume session {} once it returns.",
                job, summary.session_id
            ))
            .yellow()
            .bold()
        );
    } else if summary.aborted {
        println!(
            "{}",
            console::style(format!(
                "Run aborted; resume session {} to continue.",
                summary.session_id
            ))
            .yellow()
            .bold()
        );
    } else if summary.failed == 0 {
        println!("{}", console::style("No failures.").green().bold());
    } else {
        println!("{}", console::style("Some jobs failed:").red().bold());
        for (id, comments) in &summary.failures {
            println!("  - {}", id);
            if let Some(comments) = comments {
                println!("    {}", console::style(comments).dim());
            }
        }
    }
}
