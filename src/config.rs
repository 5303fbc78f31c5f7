//! Configuration loading.
//!
//! The file format is described in [`schema::Config`]. Every section is
//! optional; an empty file gives a configuration without providers.

pub mod schema;

pub use schema::*;

use std::path::Path;

use anyhow::{Context, Result};

/// Loads configuration from a TOML file.
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

    Ok(config)
}

/// Loads configuration from a TOML string.
pub fn load_config_str(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).context("Failed to parse config")?;

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = load_config_str("").unwrap();
        assert_eq!(config.session.max_resolution_passes, 64);
        assert_eq!(config.execution.shell, "/bin/sh");
        assert_eq!(config.execution.sudo, "sudo");
        assert!(config.execution.job_timeout_secs.is_none());
        assert!(config.providers.is_empty());
        assert!(config.session.storage_dir().unwrap().ends_with("checkplan/sessions"));
    }

    #[test]
    fn test_full_config() {
        let config = load_config_str(
            r#"
            [session]
            storage_dir = "/var/lib/checkplan"
            max_resolution_passes = 8
            title = "nightly"

            [execution]
            sudo = "sudo -n"
            job_timeout_secs = 30

            [environment]
            SERVER = "files.example.com"

            [[providers]]
            namespace = "com.example"
            units_dir = "units"
            bin_dir = "/opt/example/bin"

            [selection]
            test_plan = "com.example::smoke"
            "#,
        )
        .unwrap();

        assert_eq!(config.session.storage_dir().unwrap(), PathBuf::from("/var/lib/checkplan"));
        assert_eq!(config.session.max_resolution_passes, 8);
        assert_eq!(config.execution.job_timeout_secs, Some(30));
        assert_eq!(config.environment["SERVER"], "files.example.com");
        assert_eq!(config.selection.test_plan.as_deref(), Some("com.example::smoke"));

        let providers = config.providers(Path::new("/etc/checkplan"));
        assert_eq!(providers[0].namespace(), "com.example");
        assert_eq!(providers[0].units_dir(), Path::new("/etc/checkplan/units"));
        assert_eq!(providers[0].bin_dir(), Some(Path::new("/opt/example/bin")));
    }

    #[test]
    fn test_unknown_types_are_rejected() {
        assert!(load_config_str("[session]\nmax_resolution_passes = \"many\"").is_err());
    }

    #[test]
    fn test_missing_file() {
        let err = load_config(Path::new("/nonexistent/checkplan.toml")).unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
    }
}
