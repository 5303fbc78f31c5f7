//! Job execution.
//!
//! The orchestrator hands one runnable job at a time to an
//! [`ExecutionController`] and records the [`JobOutput`] it returns. A
//! controller never fails because the job's command failed: crashes,
//! non-zero exits and timeouts all become a `fail` outcome. An
//! [`ExecutionError`] means the controller itself could not do its work
//! (for example the I/O log could not be written).
//!
//! # Environment
//!
//! | Variable | Value |
//! |----------|-------|
//! | `LANG` | `C.UTF-8` unless the job has the `preserve-locale` flag (`LANGUAGE` and `LC_*` are removed too) |
//! | `PATH` | provider `bin_dir`s, then the inherited `PATH` |
//! | `CHECKPLAN_SESSION_SHARE` | the session's shared scratch directory |
//! | names in `environ` | the process environment, else the `[environment]` config table |
//!
//! Jobs running as another user only get the `bin_dir` of their own
//! namespace on `PATH`.

pub mod local;

use std::collections::BTreeMap;
use std::path::PathBuf;

use async_trait::async_trait;

use crate::provider::Provider;
use crate::session::{IoLogRecord, JobResult, SessionStorage};
use crate::unit::{FLAG_PRESERVE_LOCALE, JobDefinition};

pub use local::LocalController;

/// Variable pointing jobs at the session's shared directory.
pub const SESSION_SHARE_VAR: &str = "CHECKPLAN_SESSION_SHARE";

const DEFAULT_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// Result type for controller operations.
pub type ExecutionResult<T> = Result<T, ExecutionError>;

#[derive(Debug, thiserror::Error)]
pub enum ExecutionError {
    #[error("Invalid launcher command '{launcher}': {reason}")]
    InvalidLauncher { launcher: String, reason: String },

    #[error("Output of {0} was not captured")]
    NotCaptured(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

/// Where a job runs and what it gets to see.
#[derive(Debug, Clone, Default)]
pub struct ExecutionContext {
    pub io_log_dir: PathBuf,
    pub share_dir: PathBuf,
    /// `(namespace, bin_dir)` of every provider that ships executables.
    pub provider_bin_dirs: Vec<(String, PathBuf)>,
    /// Fallback values for `environ` names missing from the process environment.
    pub site_environment: BTreeMap<String, String>,
}

impl ExecutionContext {
    pub fn for_session(storage: &SessionStorage) -> Self {
        Self {
            io_log_dir: storage.io_log_dir(),
            share_dir: storage.share_dir(),
            ..Default::default()
        }
    }

    pub fn with_providers(mut self, providers: &[Provider]) -> Self {
        self.provider_bin_dirs = providers
            .iter()
            .filter_map(|p| {
                p.bin_dir()
                    .map(|dir| (p.namespace().to_string(), dir.to_path_buf()))
            })
            .collect();
        self
    }

    pub fn with_site_environment(mut self, environment: BTreeMap<String, String>) -> Self {
        self.site_environment = environment;
        self
    }
}

/// What a controller reports back for one job.
#[derive(Debug, Clone)]
pub struct JobOutput {
    pub result: JobResult,
    pub io_log: Vec<IoLogRecord>,
}

impl JobOutput {
    pub fn new(result: JobResult) -> Self {
        Self {
            result,
            io_log: Vec::new(),
        }
    }

    pub fn with_io_log(mut self, io_log: Vec<IoLogRecord>) -> Self {
        self.io_log = io_log;
        self
    }
}

/// Runs a single job to completion.
#[async_trait]
pub trait ExecutionController: Send + Sync {
    async fn run_job(
        &self,
        job: &JobDefinition,
        ctx: &ExecutionContext,
    ) -> ExecutionResult<JobOutput>;
}

/// Builds the environment of `job` from the inherited variables in `base`.
pub fn job_environment(
    job: &JobDefinition,
    ctx: &ExecutionContext,
    base: impl IntoIterator<Item = (String, String)>,
) -> BTreeMap<String, String> {
    let mut env: BTreeMap<String, String> = base.into_iter().collect();

    if !job.has_flag(FLAG_PRESERVE_LOCALE) {
        env.retain(|key, _| key != "LANGUAGE" && !key.starts_with("LC_"));
        env.insert("LANG".to_string(), "C.UTF-8".to_string());
    }

    for name in &job.environ {
        if !env.contains_key(name)
            && let Some(value) = ctx.site_environment.get(name)
        {
            env.insert(name.clone(), value.clone());
        }
    }

    let mut path: Vec<String> = ctx
        .provider_bin_dirs
        .iter()
        .filter(|(namespace, _)| job.user.is_none() || *namespace == job.namespace)
        .map(|(_, dir)| dir.display().to_string())
        .collect();
    path.push(
        env.get("PATH")
            .cloned()
            .unwrap_or_else(|| DEFAULT_PATH.to_string()),
    );
    env.insert("PATH".to_string(), path.join(":"));

    env.insert(
        SESSION_SHARE_VAR.to_string(),
        ctx.share_dir.display().to_string(),
    );
    env
}

/// The variables passed explicitly when switching to another user.
///
/// The privilege launcher resets the environment, so only the job's
/// `environ` names and the variables set by [`job_environment`] survive.
pub fn forwarded_environment(
    job: &JobDefinition,
    env: &BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    env.iter()
        .filter(|(key, _)| {
            matches!(key.as_str(), "LANG" | "PATH" | SESSION_SHARE_VAR)
                || job.environ.iter().any(|name| name == *key)
        })
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::unit::{FieldMap, Unit};

    fn job(pairs: &[(&str, &str)]) -> JobDefinition {
        let mut fields: FieldMap = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        fields.entry("plugin".to_string()).or_insert("shell".to_string());
        match Unit::from_fields("ns", fields).unwrap() {
            Unit::Job(job) => job,
            other => panic!("not a job: {:?}", other),
        }
    }

    fn ctx() -> ExecutionContext {
        ExecutionContext {
            io_log_dir: PathBuf::from("/tmp/logs"),
            share_dir: PathBuf::from("/tmp/share"),
            provider_bin_dirs: vec![
                ("ns".to_string(), PathBuf::from("/opt/ns/bin")),
                ("other".to_string(), PathBuf::from("/opt/other/bin")),
            ],
            site_environment: [("SERVER".to_string(), "site.example".to_string())]
                .into_iter()
                .collect(),
        }
    }

    fn base() -> Vec<(String, String)> {
        vec![
            ("PATH".to_string(), "/usr/bin".to_string()),
            ("LANG".to_string(), "de_DE.UTF-8".to_string()),
            ("LC_ALL".to_string(), "de_DE.UTF-8".to_string()),
            ("HOME".to_string(), "/root".to_string()),
        ]
    }

    #[test]
    fn test_locale_is_forced() {
        let env = job_environment(&job(&[("id", "a")]), &ctx(), base());
        assert_eq!(env["LANG"], "C.UTF-8");
        assert!(!env.contains_key("LC_ALL"));
        assert_eq!(env["HOME"], "/root");
        assert_eq!(env[SESSION_SHARE_VAR], "/tmp/share");
    }

    #[test]
    fn test_preserve_locale() {
        let env = job_environment(
            &job(&[("id", "a"), ("flags", "preserve-locale")]),
            &ctx(),
            base(),
        );
        assert_eq!(env["LANG"], "de_DE.UTF-8");
        assert_eq!(env["LC_ALL"], "de_DE.UTF-8");
    }

    #[test]
    fn test_path_includes_provider_bin_dirs() {
        let env = job_environment(&job(&[("id", "a")]), &ctx(), base());
        assert_eq!(env["PATH"], "/opt/ns/bin:/opt/other/bin:/usr/bin");

        let privileged = job(&[("id", "a"), ("user", "root")]);
        let env = job_environment(&privileged, &ctx(), base());
        assert_eq!(env["PATH"], "/opt/ns/bin:/usr/bin");
    }

    #[test]
    fn test_environ_falls_back_to_site_config() {
        let job = job(&[("id", "a"), ("environ", "SERVER HOME MISSING")]);
        let env = job_environment(&job, &ctx(), base());
        assert_eq!(env["SERVER"], "site.example");
        assert_eq!(env["HOME"], "/root");
        assert!(!env.contains_key("MISSING"));

        let forwarded = forwarded_environment(&job, &env);
        let keys: Vec<&str> = forwarded.keys().map(String::as_str).collect();
        assert_eq!(
            keys,
            vec!["CHECKPLAN_SESSION_SHARE", "HOME", "LANG", "PATH", "SERVER"]
        );
    }
}
