//! Run-list resolution.
//!
//! Turns a selection into an ordered run list: every prerequisite named by
//! `depends`, by the resources read in `requires`, and by `after` is pulled
//! in, and each job appears after all of its prerequisites.
//!
//! ```text
//! bootstrap ++ desired          depth-first visit             run list
//!   [t]            ──►   t ─depends─► a ─after─► b    ──►   [b, a, pkg, t]
//!                        t ─requires─► pkg
//! ```
//!
//! Prerequisites are visited in declaration order (`depends`, then
//! resources, then `after`) before the job itself, so independent jobs keep
//! their selection order. A job whose `requires` does not hold is still
//! placed in the run list; [`inhibitor`] explains at run time why it cannot
//! run.
//!
//! Resolution is a pure function of the catalogue and the seed lists. The
//! fixed-point loop that re-resolves after local and resource jobs add
//! units lives in the session and is bounded by a [`PassBudget`] on how
//! deep generated units may chain.

pub mod inhibitor;

use std::collections::HashMap;

use tracing::debug;

use crate::unit::job::DependencyKind;
use crate::unit::{Plugin, UnitCatalogue};

pub use inhibitor::{InhibitionCause, Inhibitor, compute_inhibitors};

/// Default ceiling on chained resolution passes.
pub const DEFAULT_MAX_PASSES: usize = 64;

/// Result type for resolution.
pub type ResolveResult<T> = Result<T, ResolveError>;

/// Errors that abort a run request; no partial run list is produced.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ResolveError {
    #[error("{job} has a {kind} dependency on unknown job {missing}")]
    Dependency {
        job: String,
        missing: String,
        kind: DependencyKind,
    },

    #[error("cyclic dependency: {}", .0.join(" -> "))]
    CyclicDependency(Vec<String>),

    #[error("resolution did not settle after {0} chained passes")]
    Diverged(usize),

    #[error("bootstrap job {job} must be a local or resource job, not {plugin}")]
    InvalidBootstrap { job: String, plugin: Plugin },

    #[error("unknown job: {0}")]
    UnknownJob(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mark {
    Visiting,
    Done,
}

struct Solver<'a> {
    catalogue: &'a UnitCatalogue,
    marks: HashMap<String, Mark>,
    path: Vec<String>,
    order: Vec<String>,
}

impl<'a> Solver<'a> {
    fn visit(&mut self, id: &str) -> ResolveResult<()> {
        match self.marks.get(id) {
            Some(Mark::Done) => return Ok(()),
            Some(Mark::Visiting) => {
                let start = self.path.iter().position(|p| p == id).unwrap_or(0);
                let mut cycle = self.path[start..].to_vec();
                cycle.push(id.to_string());
                return Err(ResolveError::CyclicDependency(cycle));
            }
            None => {}
        }

        let job = self
            .catalogue
            .job(id)
            .ok_or_else(|| ResolveError::UnknownJob(id.to_string()))?;

        self.marks.insert(id.to_string(), Mark::Visiting);
        self.path.push(id.to_string());
        for (kind, dep) in job.dependencies() {
            if self.catalogue.job(&dep).is_none() {
                return Err(ResolveError::Dependency {
                    job: id.to_string(),
                    missing: dep,
                    kind,
                });
            }
            self.visit(&dep)?;
        }
        self.path.pop();
        self.marks.insert(id.to_string(), Mark::Done);
        self.order.push(id.to_string());
        Ok(())
    }
}

/// Orders `seeds` and all their prerequisites.
pub fn solve(catalogue: &UnitCatalogue, seeds: &[String]) -> ResolveResult<Vec<String>> {
    let mut solver = Solver {
        catalogue,
        marks: HashMap::new(),
        path: Vec::new(),
        order: Vec::new(),
    };
    for id in seeds {
        solver.visit(id)?;
    }
    Ok(solver.order)
}

/// Resolves a run list from bootstrap and desired jobs.
///
/// Bootstrap jobs must produce data for resolution (local or resource) and
/// are placed first.
pub fn resolve(
    catalogue: &UnitCatalogue,
    bootstrap: &[String],
    desired: &[String],
) -> ResolveResult<Vec<String>> {
    for id in bootstrap {
        let job = catalogue
            .job(id)
            .ok_or_else(|| ResolveError::UnknownJob(id.clone()))?;
        if !job.plugin.is_generator() {
            return Err(ResolveError::InvalidBootstrap {
                job: id.clone(),
                plugin: job.plugin,
            });
        }
    }

    let seeds: Vec<String> = bootstrap.iter().chain(desired).cloned().collect();
    let run_list = solve(catalogue, &seeds)?;
    debug!(
        "Resolved {} seed jobs into a run list of {}",
        seeds.len(),
        run_list.len()
    );
    Ok(run_list)
}

/// Ceiling on chained resolution passes.
///
/// Catalogue units are generation 0; a unit found in the output of a job of
/// generation `n` is generation `n + 1`. Every generation needs its own pass,
/// so a pass taking in units deeper than the ceiling means generated jobs
/// keep generating and the loop would never settle. Passes caused by
/// independent generator jobs do not add up.
#[derive(Debug, Clone)]
pub struct PassBudget {
    max: usize,
    passes: usize,
}

impl PassBudget {
    pub fn new(max: usize) -> Self {
        Self { max, passes: 0 }
    }

    /// Accounts for one more pass over units up to generation `depth`.
    pub fn next_pass(&mut self, depth: usize) -> ResolveResult<usize> {
        if depth > self.max {
            return Err(ResolveError::Diverged(self.max));
        }
        self.passes += 1;
        Ok(self.passes)
    }

    /// Passes performed so far.
    pub fn passes(&self) -> usize {
        self.passes
    }
}

impl Default for PassBudget {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PASSES)
    }
}
