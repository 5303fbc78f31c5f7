//! Readiness of run-list entries.
//!
//! A job is runnable only when nothing inhibits it. Inhibitors are
//! recomputed from the current outcomes and resource records every time the
//! session changes; they are never persisted as truth.
//!
//! | Cause | Raised when |
//! |-------|-------------|
//! | `undesired` | The job is not on the run list |
//! | `pending-dep` | A `depends` or `after` job has not run yet |
//! | `failed-dep` | A `depends` job ran but did not pass |
//! | `pending-resource` | A resource job read by `requires` has not run yet |
//! | `failed-resource` | A `requires` expression does not hold |

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::resource::ResourceMap;
use crate::session::Outcome;
use crate::unit::JobDefinition;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InhibitionCause {
    Undesired,
    PendingDep,
    FailedDep,
    PendingResource,
    FailedResource,
}

impl InhibitionCause {
    pub fn as_str(&self) -> &'static str {
        match self {
            InhibitionCause::Undesired => "undesired",
            InhibitionCause::PendingDep => "pending-dep",
            InhibitionCause::FailedDep => "failed-dep",
            InhibitionCause::PendingResource => "pending-resource",
            InhibitionCause::FailedResource => "failed-resource",
        }
    }
}

/// One reason a job cannot run right now.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Inhibitor {
    pub cause: InhibitionCause,
    pub related_job: Option<String>,
    pub related_expression: Option<String>,
}

impl Inhibitor {
    fn new(cause: InhibitionCause) -> Self {
        Self {
            cause,
            related_job: None,
            related_expression: None,
        }
    }

    fn with_job(mut self, job: &str) -> Self {
        self.related_job = Some(job.to_string());
        self
    }

    fn with_expression(mut self, expression: &str) -> Self {
        self.related_expression = Some(expression.to_string());
        self
    }
}

impl fmt::Display for Inhibitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.cause.as_str())?;
        if let Some(job) = &self.related_job {
            write!(f, " ({})", job)?;
        }
        if let Some(expression) = &self.related_expression {
            write!(f, ": {}", expression)?;
        }
        Ok(())
    }
}

/// Computes what currently keeps `job` from running.
///
/// `outcome_of` returns [`Outcome::None`] for jobs that have not run.
pub fn compute_inhibitors(
    job: &JobDefinition,
    on_run_list: bool,
    outcome_of: impl Fn(&str) -> Outcome,
    resources: &ResourceMap,
) -> Vec<Inhibitor> {
    let mut inhibitors = Vec::new();
    if !on_run_list {
        inhibitors.push(Inhibitor::new(InhibitionCause::Undesired));
    }

    for dep in &job.depends {
        match outcome_of(dep) {
            Outcome::None => {
                inhibitors.push(Inhibitor::new(InhibitionCause::PendingDep).with_job(dep))
            }
            Outcome::Pass => {}
            _ => inhibitors.push(Inhibitor::new(InhibitionCause::FailedDep).with_job(dep)),
        }
    }

    for dep in &job.after {
        if outcome_of(dep) == Outcome::None {
            inhibitors.push(Inhibitor::new(InhibitionCause::PendingDep).with_job(dep));
        }
    }

    if let Some(requires) = &job.requires {
        let pending: Vec<String> = requires
            .required_resources()
            .into_iter()
            .filter(|id| outcome_of(id) == Outcome::None)
            .collect();
        for id in &pending {
            inhibitors.push(Inhibitor::new(InhibitionCause::PendingResource).with_job(id));
        }

        for expression in requires.expressions() {
            if pending.iter().any(|id| id == expression.resource_id()) {
                continue;
            }
            let group = resources
                .get(expression.resource_id())
                .map(Vec::as_slice)
                .unwrap_or(&[]);
            if !expression.evaluate(group) {
                inhibitors.push(
                    Inhibitor::new(InhibitionCause::FailedResource)
                        .with_job(expression.resource_id())
                        .with_expression(expression.text()),
                );
            }
        }
    }

    inhibitors
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use crate::resource::Resource;
    use crate::unit::FieldMap;

    fn job(pairs: &[(&str, &str)]) -> JobDefinition {
        let mut fields: FieldMap = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        fields.insert("id".into(), "t".into());
        fields.insert("plugin".into(), "shell".into());
        JobDefinition::from_fields("ns", fields).unwrap()
    }

    fn outcomes(pairs: &[(&str, Outcome)]) -> impl Fn(&str) -> Outcome {
        let map: HashMap<String, Outcome> = pairs
            .iter()
            .map(|(id, outcome)| (id.to_string(), *outcome))
            .collect();
        move |id| map.get(id).copied().unwrap_or(Outcome::None)
    }

    fn causes(inhibitors: &[Inhibitor]) -> Vec<InhibitionCause> {
        inhibitors.iter().map(|i| i.cause).collect()
    }

    #[test]
    fn test_ready_job_has_no_inhibitors() {
        let job = job(&[]);
        assert!(compute_inhibitors(&job, true, outcomes(&[]), &ResourceMap::new()).is_empty());
    }

    #[test]
    fn test_undesired() {
        let job = job(&[]);
        let inhibitors = compute_inhibitors(&job, false, outcomes(&[]), &ResourceMap::new());
        assert_eq!(causes(&inhibitors), vec![InhibitionCause::Undesired]);
    }

    #[test]
    fn test_dependency_states() {
        let gated = job(&[("depends", "a b"), ("after", "c")]);
        let inhibitors = compute_inhibitors(
            &gated,
            true,
            outcomes(&[("ns::a", Outcome::Pass), ("ns::b", Outcome::Fail)]),
            &ResourceMap::new(),
        );
        assert_eq!(
            causes(&inhibitors),
            vec![InhibitionCause::FailedDep, InhibitionCause::PendingDep]
        );
        assert_eq!(inhibitors[0].related_job.as_deref(), Some("ns::b"));

        // A failed `after` job does not inhibit.
        let after_only = job(&[("after", "c")]);
        assert!(
            compute_inhibitors(
                &after_only,
                true,
                outcomes(&[("ns::c", Outcome::Fail)]),
                &ResourceMap::new()
            )
            .is_empty()
        );
    }

    #[test]
    fn test_resource_states() {
        let job = job(&[("requires", "pkg.name == 'fwts'")]);

        let pending = compute_inhibitors(&job, true, outcomes(&[]), &ResourceMap::new());
        assert_eq!(causes(&pending), vec![InhibitionCause::PendingResource]);

        let mut resources = ResourceMap::new();
        let record = |name: &str| {
            Resource::new([("name".to_string(), name.to_string())].into_iter().collect())
        };
        resources.insert("ns::pkg".into(), vec![record("foo")]);
        let failed = compute_inhibitors(
            &job,
            true,
            outcomes(&[("ns::pkg", Outcome::Pass)]),
            &resources,
        );
        assert_eq!(causes(&failed), vec![InhibitionCause::FailedResource]);
        assert_eq!(
            failed[0].to_string(),
            "failed-resource (ns::pkg): pkg.name == 'fwts'"
        );

        resources.insert("ns::pkg".into(), vec![record("fwts"), record("foo")]);
        assert!(
            compute_inhibitors(
                &job,
                true,
                outcomes(&[("ns::pkg", Outcome::Pass)]),
                &resources
            )
            .is_empty()
        );
    }
}
