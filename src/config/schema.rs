//! Configuration schema.
//!
//! ```text
//! Config (root)
//! ├── SessionConfig      - Where sessions live, pass ceiling, default title
//! ├── ExecutionConfig    - Shell, privilege launcher, per-job timeout
//! ├── environment        - Fallback values for job `environ` names
//! ├── ProviderConfig[]   - Unit providers (namespace, units, executables)
//! └── SelectionConfig    - Default test plan or whitelist
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::provider::Provider;
use crate::resolver::DEFAULT_MAX_PASSES;

/// Root configuration.
///
/// ```toml
/// [session]
/// storage_dir = "~/.local/share/checkplan/sessions"
/// max_resolution_passes = 64
///
/// [execution]
/// shell = "/bin/sh"
/// sudo = "sudo -n"
/// job_timeout_secs = 600
///
/// [environment]
/// TRANSFER_SERVER = "files.example.com"
///
/// [[providers]]
/// namespace = "com.example.base"
/// units_dir = "providers/base/units"
/// bin_dir = "providers/base/bin"
///
/// [selection]
/// test_plan = "com.example.base::smoke"
/// ```
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub session: SessionConfig,

    #[serde(default)]
    pub execution: ExecutionConfig,

    /// Site values for `environ` names missing from the process environment.
    #[serde(default)]
    pub environment: BTreeMap<String, String>,

    #[serde(default)]
    pub providers: Vec<ProviderConfig>,

    #[serde(default)]
    pub selection: SelectionConfig,
}

impl Config {
    /// Providers with paths resolved against `base_dir`.
    pub fn providers(&self, base_dir: &Path) -> Vec<Provider> {
        self.providers
            .iter()
            .map(|p| {
                let provider = Provider::new(&p.namespace, resolve_path(base_dir, &p.units_dir));
                match &p.bin_dir {
                    Some(bin_dir) => provider.with_bin_dir(resolve_path(base_dir, bin_dir)),
                    None => provider,
                }
            })
            .collect()
    }
}

/// Session settings.
///
/// | Field | Default |
/// |-------|---------|
/// | `storage_dir` | `~/.local/share/checkplan/sessions` |
/// | `max_resolution_passes` | 64 |
/// | `title` | None |
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SessionConfig {
    /// Directory holding `<id>.session` directories; `~` and `$VARS` expand.
    #[serde(default = "default_storage_dir")]
    pub storage_dir: String,

    /// Ceiling on resolution passes in one run.
    #[serde(default = "default_max_passes")]
    pub max_resolution_passes: usize,

    #[serde(default)]
    pub title: Option<String>,
}

impl SessionConfig {
    pub fn storage_dir(&self) -> anyhow::Result<PathBuf> {
        let expanded = shellexpand::full(&self.storage_dir)?;
        Ok(PathBuf::from(expanded.as_ref()))
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            storage_dir: default_storage_dir(),
            max_resolution_passes: default_max_passes(),
            title: None,
        }
    }
}

fn default_storage_dir() -> String {
    "~/.local/share/checkplan/sessions".to_string()
}

fn default_max_passes() -> usize {
    DEFAULT_MAX_PASSES
}

/// Job execution settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ExecutionConfig {
    #[serde(default = "default_shell")]
    pub shell: String,

    /// Launcher used for jobs with a `user`; may carry arguments.
    #[serde(default = "default_sudo")]
    pub sudo: String,

    /// Kill jobs running longer than this and record `fail`.
    #[serde(default)]
    pub job_timeout_secs: Option<u64>,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            shell: default_shell(),
            sudo: default_sudo(),
            job_timeout_secs: None,
        }
    }
}

fn default_shell() -> String {
    "/bin/sh".to_string()
}

fn default_sudo() -> String {
    "sudo".to_string()
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProviderConfig {
    pub namespace: String,
    pub units_dir: PathBuf,
    #[serde(default)]
    pub bin_dir: Option<PathBuf>,
}

/// Default selection when `run` gets no `--test-plan`.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct SelectionConfig {
    #[serde(default)]
    pub test_plan: Option<String>,

    /// Whitelist file with one pattern per line.
    #[serde(default)]
    pub whitelist: Option<PathBuf>,

    /// Exclude patterns applied with `whitelist`.
    #[serde(default)]
    pub exclude: Option<PathBuf>,

    /// Namespace of unqualified whitelist patterns.
    #[serde(default)]
    pub namespace: Option<String>,
}

fn resolve_path(base_dir: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base_dir.join(path)
    }
}
