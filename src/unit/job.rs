//! Job definitions.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::{FieldMap, UnitError, UnitResult, compute_checksum, qualify, split_list, unit_identity};
use crate::resource::{ResourceImport, ResourceProgram, parse_imports};

/// Keep the caller's locale instead of forcing `C.UTF-8`.
pub const FLAG_PRESERVE_LOCALE: &str = "preserve-locale";
/// Dispatching the job is terminal; it is expected not to return (e.g. reboot).
pub const FLAG_NORETURN: &str = "noreturn";
/// Files left behind by the job are expected and not reported.
pub const FLAG_HAS_LEFTOVERS: &str = "has-leftovers";

/// How a job is executed and how its result is decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Plugin {
    /// Fully automated; the return code decides the outcome.
    Shell,
    /// No command; the operator decides the outcome.
    Manual,
    /// The operator interacts while the command runs.
    UserInteract,
    /// The command runs, then the operator decides the outcome.
    UserInteractVerify,
    /// The command's output is attached to the results.
    Attachment,
    /// The command's output defines further units.
    Local,
    /// The command's output is a set of resource records.
    Resource,
    /// A QML application; not runnable by the local controller.
    Qml,
}

impl Plugin {
    pub fn as_str(&self) -> &'static str {
        match self {
            Plugin::Shell => "shell",
            Plugin::Manual => "manual",
            Plugin::UserInteract => "user-interact",
            Plugin::UserInteractVerify => "user-interact-verify",
            Plugin::Attachment => "attachment",
            Plugin::Local => "local",
            Plugin::Resource => "resource",
            Plugin::Qml => "qml",
        }
    }

    /// Local and resource jobs feed data back into resolution.
    pub fn is_generator(&self) -> bool {
        matches!(self, Plugin::Local | Plugin::Resource)
    }

    fn requires_command(&self) -> bool {
        matches!(self, Plugin::Local | Plugin::Resource | Plugin::Attachment)
    }
}

impl fmt::Display for Plugin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Plugin {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "shell" => Ok(Plugin::Shell),
            "manual" => Ok(Plugin::Manual),
            "user-interact" => Ok(Plugin::UserInteract),
            "user-interact-verify" => Ok(Plugin::UserInteractVerify),
            "attachment" => Ok(Plugin::Attachment),
            "local" => Ok(Plugin::Local),
            "resource" => Ok(Plugin::Resource),
            "qml" => Ok(Plugin::Qml),
            other => Err(format!("unknown plugin '{}'", other)),
        }
    }
}

/// Which relationship a dependency comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DependencyKind {
    /// `depends`: must have run and passed.
    Direct,
    /// A resource job read by `requires`.
    Resource,
    /// `after`: must have run, whatever the outcome.
    Ordering,
}

impl fmt::Display for DependencyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DependencyKind::Direct => "direct",
            DependencyKind::Resource => "resource",
            DependencyKind::Ordering => "ordering",
        })
    }
}

/// A single unit of testing work.
#[derive(Debug, Clone, PartialEq)]
pub struct JobDefinition {
    pub id: String,
    pub namespace: String,
    pub partial_id: String,
    pub plugin: Plugin,
    pub summary: Option<String>,
    pub command: Option<String>,
    pub requires: Option<ResourceProgram>,
    pub depends: Vec<String>,
    pub after: Vec<String>,
    pub estimated_duration: Option<f64>,
    pub user: Option<String>,
    pub environ: Vec<String>,
    pub flags: BTreeSet<String>,
    pub imports: Vec<ResourceImport>,
    pub category_id: Option<String>,
    /// Id of the template this job was instantiated from, if any.
    pub template_id: Option<String>,
    pub fields: FieldMap,
    pub checksum: String,
}

impl JobDefinition {
    /// Builds and validates a job from normalized fields.
    pub fn from_fields(namespace: &str, fields: FieldMap) -> UnitResult<Self> {
        let (id, namespace, partial_id) = unit_identity(namespace, &fields, "id")?;

        let text = |key: &str| {
            fields
                .get(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let invalid = |field: &str, reason: String| UnitError::InvalidField {
            unit: id.clone(),
            field: field.to_string(),
            reason,
        };

        let plugin: Plugin = text("plugin")
            .ok_or_else(|| UnitError::MissingField {
                unit: id.clone(),
                field: "plugin".to_string(),
            })?
            .parse()
            .map_err(|reason| invalid("plugin", reason))?;

        let command = fields
            .get("command")
            .filter(|c| !c.trim().is_empty())
            .cloned();
        if plugin.requires_command() && command.is_none() {
            return Err(UnitError::MissingField {
                unit: id.clone(),
                field: "command".to_string(),
            });
        }

        let imports = match fields.get("imports") {
            Some(text) => parse_imports(text).map_err(|source| UnitError::Expression {
                unit: id.clone(),
                field: "imports".to_string(),
                source,
            })?,
            None => Vec::new(),
        };

        let requires = match text("requires") {
            Some(source) => Some(
                ResourceProgram::compile(&source, Some(&namespace), &imports).map_err(
                    |source| UnitError::Expression {
                        unit: id.clone(),
                        field: "requires".to_string(),
                        source,
                    },
                )?,
            ),
            None => None,
        };

        let estimated_duration = match text("estimated_duration") {
            Some(value) => {
                let seconds: f64 = value
                    .parse()
                    .map_err(|_| invalid("estimated_duration", format!("not a number: {}", value)))?;
                if !seconds.is_finite() || seconds < 0.0 {
                    return Err(invalid(
                        "estimated_duration",
                        format!("must be a non-negative number: {}", value),
                    ));
                }
                Some(seconds)
            }
            None => None,
        };

        let qualified_list = |key: &str| -> Vec<String> {
            let mut ids: Vec<String> = Vec::new();
            for item in split_list(fields.get(key).map(String::as_str).unwrap_or("")) {
                let qualified = qualify(&namespace, &item);
                if !ids.contains(&qualified) {
                    ids.push(qualified);
                }
            }
            ids
        };
        let depends = qualified_list("depends");
        let after = qualified_list("after");
        if depends.contains(&id) || after.contains(&id) {
            return Err(invalid("depends", "job depends on itself".to_string()));
        }

        let flags = split_list(fields.get("flags").map(String::as_str).unwrap_or(""))
            .into_iter()
            .collect();
        let environ = split_list(fields.get("environ").map(String::as_str).unwrap_or(""));

        let checksum = compute_checksum(&fields);
        Ok(Self {
            summary: text("summary"),
            user: text("user"),
            category_id: text("category_id").map(|c| qualify(&namespace, &c)),
            template_id: text("template-origin"),
            command,
            requires,
            depends,
            after,
            estimated_duration,
            environ,
            flags,
            imports,
            plugin,
            checksum,
            fields,
            id,
            namespace,
            partial_id,
        })
    }

    pub fn has_flag(&self, flag: &str) -> bool {
        self.flags.contains(flag)
    }

    /// Dispatch is terminal for this job.
    pub fn is_noreturn(&self) -> bool {
        self.has_flag(FLAG_NORETURN)
    }

    pub fn has_leftovers(&self) -> bool {
        self.has_flag(FLAG_HAS_LEFTOVERS)
    }

    /// Resource job ids read by `requires`.
    pub fn resource_dependencies(&self) -> BTreeSet<String> {
        self.requires
            .as_ref()
            .map(ResourceProgram::required_resources)
            .unwrap_or_default()
    }

    /// Every job this one must follow, in resolution order: `depends`, then
    /// resources read by `requires`, then `after`.
    pub fn dependencies(&self) -> Vec<(DependencyKind, String)> {
        let mut deps: Vec<(DependencyKind, String)> = Vec::new();
        let mut push = |kind, id: &String| {
            if !deps.iter().any(|(_, d)| d == id) {
                deps.push((kind, id.clone()));
            }
        };
        for id in &self.depends {
            push(DependencyKind::Direct, id);
        }
        for id in &self.resource_dependencies() {
            push(DependencyKind::Resource, id);
        }
        for id in &self.after {
            push(DependencyKind::Ordering, id);
        }
        deps
    }

    /// A human readable name for progress output.
    pub fn display_name(&self) -> &str {
        self.summary.as_deref().unwrap_or(&self.partial_id)
    }
}
