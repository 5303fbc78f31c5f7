//! Unit providers.
//!
//! A provider is an independently versioned collection of unit definitions
//! sharing one namespace. On disk it is a directory of `*.pxu` files, each
//! holding one or more RFC822-style records, plus an optional directory of
//! executables that job commands may call by name.
//!
//! ```text
//! providers/disk/
//! ├── units/
//! │   ├── jobs.pxu        ──► Job, Template, ... (namespace "com.example.disk")
//! │   └── plans.pxu       ──► TestPlan, Category
//! └── bin/
//!     └── read-test       ──► on PATH while jobs run
//! ```
//!
//! Loading never stops at the first bad unit: every record that fails
//! validation is reported in [`LoadReport::problems`] and left out, while
//! the rest of the provider loads.

use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::rfc822;
use crate::unit::{Unit, UnitCatalogue, UnitError};

/// File extension of unit definition files.
pub const UNIT_FILE_EXTENSION: &str = "pxu";

/// Result type for provider operations.
pub type ProviderResult<T> = Result<T, ProviderError>;

/// Errors that prevent a provider from loading at all.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("Units directory not found for {namespace}: {path}")]
    MissingUnitsDir { namespace: String, path: PathBuf },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Units loaded from one or more providers, with per-unit problems.
#[derive(Debug, Default)]
pub struct LoadReport {
    pub units: Vec<Unit>,
    pub problems: Vec<UnitError>,
}

impl LoadReport {
    fn merge(&mut self, other: LoadReport) {
        self.units.extend(other.units);
        self.problems.extend(other.problems);
    }
}

/// A namespace with a units directory and optional executables.
#[derive(Debug, Clone)]
pub struct Provider {
    namespace: String,
    units_dir: PathBuf,
    bin_dir: Option<PathBuf>,
}

impl Provider {
    pub fn new(namespace: impl Into<String>, units_dir: impl Into<PathBuf>) -> Self {
        Self {
            namespace: namespace.into(),
            units_dir: units_dir.into(),
            bin_dir: None,
        }
    }

    pub fn with_bin_dir(mut self, bin_dir: impl Into<PathBuf>) -> Self {
        self.bin_dir = Some(bin_dir.into());
        self
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn units_dir(&self) -> &Path {
        &self.units_dir
    }

    pub fn bin_dir(&self) -> Option<&Path> {
        self.bin_dir.as_deref()
    }

    /// Loads every unit file of the provider in file-name order.
    pub fn load_units(&self) -> ProviderResult<LoadReport> {
        if !self.units_dir.is_dir() {
            return Err(ProviderError::MissingUnitsDir {
                namespace: self.namespace.clone(),
                path: self.units_dir.clone(),
            });
        }

        let mut files: Vec<PathBuf> = std::fs::read_dir(&self.units_dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| {
                path.is_file()
                    && path.extension().and_then(|e| e.to_str()) == Some(UNIT_FILE_EXTENSION)
            })
            .collect();
        files.sort();

        let mut report = LoadReport::default();
        for path in files {
            let text = std::fs::read_to_string(&path)?;
            report.merge(parse_units(&self.namespace, &path.display().to_string(), &text));
        }

        debug!(
            "Loaded {} units from provider {} ({} problems)",
            report.units.len(),
            self.namespace,
            report.problems.len()
        );
        Ok(report)
    }
}

/// Parses unit records from `text` into units of `namespace`.
///
/// Also used for the output of local jobs, with the generating job's
/// namespace.
pub fn parse_units(namespace: &str, origin: &str, text: &str) -> LoadReport {
    let mut report = LoadReport::default();
    let records = match rfc822::parse_records(text) {
        Ok(records) => records,
        Err(source) => {
            let problem = UnitError::Parse {
                origin: origin.to_string(),
                source,
            };
            warn!("{}", problem);
            report.problems.push(problem);
            return report;
        }
    };

    for record in records {
        match Unit::from_fields(namespace, record.fields) {
            Ok(unit) => report.units.push(unit),
            Err(e) => {
                warn!("{}:{}: {}", origin, record.line, e);
                report.problems.push(e);
            }
        }
    }
    report
}

/// Loads all providers into one catalogue.
///
/// Conflicting redefinitions across providers are reported as problems; the
/// first definition wins.
pub fn load_catalogue(providers: &[Provider]) -> ProviderResult<(UnitCatalogue, Vec<UnitError>)> {
    let mut catalogue = UnitCatalogue::new();
    let mut problems = Vec::new();
    for provider in providers {
        let report = provider.load_units()?;
        problems.extend(report.problems);
        for error in catalogue.extend(report.units) {
            warn!("{}", error);
            problems.push(error);
        }
    }
    Ok((catalogue, problems))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write(dir: &Path, name: &str, text: &str) {
        std::fs::write(dir.join(name), text).unwrap();
    }

    #[test]
    fn test_load_units_skips_bad_records() {
        let dir = TempDir::new().unwrap();
        write(
            dir.path(),
            "b.pxu",
            "id: second\nplugin: shell\ncommand: true\n\nid: broken\nplugin: nope\n",
        );
        write(dir.path(), "a.pxu", "id: first\nplugin: manual\n");
        write(dir.path(), "notes.txt", "id: ignored\nplugin: manual\n");

        let provider = Provider::new("com.example", dir.path());
        let report = provider.load_units().unwrap();
        let ids: Vec<_> = report.units.iter().map(|u| u.id()).collect();
        assert_eq!(ids, vec!["com.example::first", "com.example::second"]);
        assert_eq!(report.problems.len(), 1);
    }

    #[test]
    fn test_parse_error_is_a_problem() {
        let report = parse_units("ns", "inline", "id: a\nid: b\n");
        assert!(report.units.is_empty());
        assert!(matches!(report.problems[0], UnitError::Parse { .. }));
    }

    #[test]
    fn test_missing_units_dir() {
        let provider = Provider::new("ns", "/nonexistent/checkplan/units");
        assert!(matches!(
            provider.load_units(),
            Err(ProviderError::MissingUnitsDir { .. })
        ));
    }

    #[test]
    fn test_load_catalogue_reports_cross_provider_conflicts() {
        let one = TempDir::new().unwrap();
        let two = TempDir::new().unwrap();
        write(one.path(), "u.pxu", "id: other::shared\nplugin: manual\n");
        write(two.path(), "u.pxu", "id: other::shared\nplugin: shell\n");

        let providers = vec![
            Provider::new("one", one.path()),
            Provider::new("two", two.path()).with_bin_dir(two.path().join("bin")),
        ];
        let (catalogue, problems) = load_catalogue(&providers).unwrap();
        assert_eq!(catalogue.len(), 1);
        assert_eq!(problems, vec![UnitError::Duplicate("other::shared".into())]);
        assert_eq!(
            catalogue.job("other::shared").unwrap().plugin,
            crate::unit::Plugin::Manual
        );
    }
}
