//! Job selection.
//!
//! Test plans and whitelists name jobs through id patterns. A pattern is a
//! regular expression anchored at both ends and qualified with the
//! namespace of the unit that wrote it; a pattern without regex
//! metacharacters is an exact id match.
//!
//! Selection proceeds as follows:
//!
//! 1. `include` patterns are applied in order. Each pattern appends the jobs
//!    it matches in catalogue order, skipping jobs already selected.
//! 2. Jobs matched by any `exclude` pattern are removed, regardless of where
//!    the patterns appear.
//! 3. `mandatory_include` jobs are put in front. Exclusion does not apply
//!    to them.
//!
//! A pattern matching nothing is not an error: the jobs it names may only
//! appear after bootstrap jobs have run.

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::unit::testplan::pattern_lines;
use crate::unit::{JobDefinition, NAMESPACE_SEPARATOR, TestPlan, UnitCatalogue};

/// Result type for qualifier construction.
pub type QualifierResult<T> = Result<T, QualifierError>;

#[derive(Debug, thiserror::Error)]
pub enum QualifierError {
    #[error("invalid job pattern '{pattern}': {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("unknown test plan: {0}")]
    UnknownTestPlan(String),
}

/// How a qualifier rules on one job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Vote {
    Include,
    Exclude,
    Ignore,
}

#[derive(Debug, Clone)]
enum Matcher {
    Exact(String),
    Pattern(Regex),
}

/// One namespace-qualified id pattern.
#[derive(Debug, Clone)]
pub struct PatternQualifier {
    text: String,
    matcher: Matcher,
    inclusive: bool,
}

impl PatternQualifier {
    pub fn new(pattern: &str, namespace: &str, inclusive: bool) -> QualifierResult<Self> {
        let qualified = pattern.contains(NAMESPACE_SEPARATOR);
        let matcher = if regex::escape(pattern) == pattern {
            let id = if qualified {
                pattern.to_string()
            } else {
                format!("{}{}{}", namespace, NAMESPACE_SEPARATOR, pattern)
            };
            Matcher::Exact(id)
        } else {
            let source = if qualified {
                format!("^(?:{})$", pattern)
            } else {
                format!(
                    "^{}{}(?:{})$",
                    regex::escape(namespace),
                    NAMESPACE_SEPARATOR,
                    pattern
                )
            };
            let regex = Regex::new(&source).map_err(|source| QualifierError::InvalidPattern {
                pattern: pattern.to_string(),
                source,
            })?;
            Matcher::Pattern(regex)
        };
        Ok(Self {
            text: pattern.to_string(),
            matcher,
            inclusive,
        })
    }

    /// The pattern as written.
    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn matches(&self, id: &str) -> bool {
        match &self.matcher {
            Matcher::Exact(exact) => exact == id,
            Matcher::Pattern(regex) => regex.is_match(id),
        }
    }

    pub fn vote(&self, job: &JobDefinition) -> Vote {
        match (self.matches(&job.id), self.inclusive) {
            (false, _) => Vote::Ignore,
            (true, true) => Vote::Include,
            (true, false) => Vote::Exclude,
        }
    }
}

/// Where a session's selection rules come from.
///
/// Stored with the session so the same rules can be rebuilt on resume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SelectionSource {
    TestPlan {
        id: String,
    },
    Whitelist {
        namespace: String,
        include: String,
        #[serde(default)]
        exclude: String,
    },
}

/// The job lists produced by selection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Selection {
    /// Mandatory jobs first, then included jobs.
    pub desired: Vec<String>,
    pub mandatory: Vec<String>,
    pub bootstrap: Vec<String>,
}

#[derive(Debug, Clone)]
struct CategoryRule {
    category_id: String,
    qualifier: PatternQualifier,
}

/// Compiled selection rules of a test plan or whitelist.
#[derive(Debug, Clone, Default)]
pub struct SelectionRules {
    include: Vec<PatternQualifier>,
    exclude: Vec<PatternQualifier>,
    mandatory: Vec<PatternQualifier>,
    bootstrap: Vec<PatternQualifier>,
    category_rules: Vec<CategoryRule>,
}

fn compile_all(
    patterns: &[String],
    namespace: &str,
    inclusive: bool,
) -> QualifierResult<Vec<PatternQualifier>> {
    patterns
        .iter()
        .map(|p| PatternQualifier::new(p, namespace, inclusive))
        .collect()
}

impl SelectionRules {
    pub fn from_test_plan(plan: &TestPlan) -> QualifierResult<Self> {
        let ns = plan.namespace.as_str();
        let category_rules = plan
            .category_overrides
            .iter()
            .map(|o| {
                Ok(CategoryRule {
                    category_id: o.category_id.clone(),
                    qualifier: PatternQualifier::new(&o.pattern, ns, true)?,
                })
            })
            .collect::<QualifierResult<Vec<_>>>()?;
        Ok(Self {
            include: compile_all(&plan.include, ns, true)?,
            exclude: compile_all(&plan.exclude, ns, false)?,
            mandatory: compile_all(&plan.mandatory_include, ns, true)?,
            bootstrap: compile_all(&plan.bootstrap_include, ns, true)?,
            category_rules,
        })
    }

    /// Builds rules from whitelist file contents.
    pub fn from_whitelist(namespace: &str, include: &str, exclude: &str) -> QualifierResult<Self> {
        Ok(Self {
            include: compile_all(&pattern_lines(include), namespace, true)?,
            exclude: compile_all(&pattern_lines(exclude), namespace, false)?,
            ..Default::default()
        })
    }

    pub fn from_source(source: &SelectionSource, catalogue: &UnitCatalogue) -> QualifierResult<Self> {
        match source {
            SelectionSource::TestPlan { id } => {
                let plan = catalogue
                    .test_plan(id)
                    .ok_or_else(|| QualifierError::UnknownTestPlan(id.clone()))?;
                Self::from_test_plan(plan)
            }
            SelectionSource::Whitelist {
                namespace,
                include,
                exclude,
            } => Self::from_whitelist(namespace, include, exclude),
        }
    }

    /// Computes the job lists against the current catalogue.
    pub fn select(&self, catalogue: &UnitCatalogue) -> Selection {
        let mandatory = matching_jobs(&self.mandatory, catalogue);
        let bootstrap = matching_jobs(&self.bootstrap, catalogue);

        let mut desired = mandatory.clone();
        for id in matching_jobs(&self.include, catalogue) {
            let excluded = self.exclude.iter().any(|q| q.matches(&id));
            if !excluded && !desired.contains(&id) {
                desired.push(id);
            }
        }

        Selection {
            desired,
            mandatory,
            bootstrap,
        }
    }

    /// The category a job is presented under: the last matching
    /// `category-overrides` statement wins, then the job's own category.
    pub fn effective_category(&self, job: &JobDefinition) -> Option<String> {
        self.category_rules
            .iter()
            .rev()
            .find(|rule| rule.qualifier.matches(&job.id))
            .map(|rule| rule.category_id.clone())
            .or_else(|| job.category_id.clone())
    }
}

/// Jobs matched by `qualifiers`, pattern by pattern, in catalogue order
/// within a pattern, without repeats.
fn matching_jobs(qualifiers: &[PatternQualifier], catalogue: &UnitCatalogue) -> Vec<String> {
    let mut selected: Vec<String> = Vec::new();
    for qualifier in qualifiers {
        for job in catalogue.jobs() {
            if qualifier.vote(job) == Vote::Include && !selected.contains(&job.id) {
                selected.push(job.id.clone());
            }
        }
    }
    selected
}
