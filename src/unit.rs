//! Unit data model.
//!
//! A unit is one parsed definition record, addressed by a namespace-qualified
//! id such as `com.example::disk/read`. Units are immutable once built; the
//! SHA-256 checksum of their normalized fields detects definition drift when
//! a stored session is resumed against a newer catalogue.
//!
//! # Variants
//!
//! | `unit:` field | Type | Module |
//! |---------------|------|--------|
//! | `job` (default) | [`JobDefinition`] | [`job`] |
//! | `template` | [`TemplateUnit`] | [`template`] |
//! | `test plan` | [`TestPlan`] | [`testplan`] |
//! | `category` | [`Category`] | [`category`] |
//!
//! Resource-producing jobs are ordinary jobs with `plugin: resource`.

pub mod catalogue;
pub mod category;
pub mod job;
pub mod template;
pub mod testplan;

use std::collections::BTreeMap;

use sha2::{Digest, Sha256};

use crate::resource::ResourceError;
use crate::rfc822::Rfc822Error;

pub use catalogue::{Addition, UnitCatalogue};
pub use category::Category;
pub use job::{
    DependencyKind, FLAG_HAS_LEFTOVERS, FLAG_NORETURN, FLAG_PRESERVE_LOCALE, JobDefinition, Plugin,
};
pub use template::TemplateUnit;
pub use testplan::{CategoryOverride, TestPlan};

/// Separator between the namespace and the partial id.
pub const NAMESPACE_SEPARATOR: &str = "::";

/// Field name to value mapping of one unit record.
pub type FieldMap = BTreeMap<String, String>;

/// Result type for unit construction.
pub type UnitResult<T> = Result<T, UnitError>;

/// Validation errors for unit definitions.
///
/// These are reported per unit; the offending unit is left out of the
/// catalogue while the rest of its provider still loads.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum UnitError {
    #[error("unit has no 'id' field")]
    MissingId,

    #[error("{unit}: missing required field '{field}'")]
    MissingField { unit: String, field: String },

    #[error("{unit}: invalid value for '{field}': {reason}")]
    InvalidField {
        unit: String,
        field: String,
        reason: String,
    },

    #[error("{unit}: unknown unit type '{kind}'")]
    UnknownKind { unit: String, kind: String },

    #[error("{unit}: bad resource expression in '{field}': {source}")]
    Expression {
        unit: String,
        field: String,
        #[source]
        source: ResourceError,
    },

    #[error("unit {0} is already defined with different content")]
    Duplicate(String),

    #[error("{origin}: {source}")]
    Parse {
        origin: String,
        #[source]
        source: Rfc822Error,
    },
}

/// Qualifies `id` with `namespace` unless it already carries one.
pub fn qualify(namespace: &str, id: &str) -> String {
    if id.contains(NAMESPACE_SEPARATOR) {
        id.to_string()
    } else {
        format!("{}{}{}", namespace, NAMESPACE_SEPARATOR, id)
    }
}

/// Splits a qualified id into `(namespace, partial_id)`.
///
/// Unqualified ids yield an empty namespace.
pub fn split_id(id: &str) -> (&str, &str) {
    id.split_once(NAMESPACE_SEPARATOR).unwrap_or(("", id))
}

/// Splits a list-valued field on whitespace and commas.
pub fn split_list(value: &str) -> Vec<String> {
    let mut items: Vec<String> = Vec::new();
    for item in value.split(|c: char| c.is_whitespace() || c == ',') {
        if !item.is_empty() && !items.iter().any(|i| i == item) {
            items.push(item.to_string());
        }
    }
    items
}

/// Drops the translatable-field marker (`_summary` → `summary`).
pub fn normalize_fields(fields: FieldMap) -> FieldMap {
    let mut normalized = FieldMap::new();
    for (key, value) in fields {
        match key.strip_prefix('_') {
            Some(stripped) if !stripped.is_empty() => {
                normalized.entry(stripped.to_string()).or_insert(value);
            }
            _ => {
                normalized.insert(key, value);
            }
        }
    }
    normalized
}

/// Hex SHA-256 of the compact JSON encoding of the sorted field map.
pub fn compute_checksum(fields: &FieldMap) -> String {
    let mut hasher = Sha256::new();
    // A BTreeMap always serializes with sorted keys.
    let encoded = serde_json::to_string(fields).unwrap_or_default();
    hasher.update(encoded.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Resolves the qualified id and its parts from a record's `id` field.
pub(crate) fn unit_identity(
    namespace: &str,
    fields: &FieldMap,
    key: &str,
) -> UnitResult<(String, String, String)> {
    let raw = fields
        .get(key)
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .ok_or(UnitError::MissingId)?;
    let id = qualify(namespace, raw);
    let (ns, partial) = split_id(&id);
    let (ns, partial) = (ns.to_string(), partial.to_string());
    Ok((id, ns, partial))
}

/// What kind of unit a [`Unit`] is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitKind {
    Job,
    Template,
    TestPlan,
    Category,
}

impl std::fmt::Display for UnitKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            UnitKind::Job => "job",
            UnitKind::Template => "template",
            UnitKind::TestPlan => "test plan",
            UnitKind::Category => "category",
        };
        f.pad(name)
    }
}

/// A loaded unit of any kind.
#[derive(Debug, Clone, PartialEq)]
pub enum Unit {
    Job(JobDefinition),
    Template(TemplateUnit),
    TestPlan(TestPlan),
    Category(Category),
}

impl Unit {
    /// Builds a unit from a parsed record, dispatching on the `unit` field.
    pub fn from_fields(namespace: &str, fields: FieldMap) -> UnitResult<Unit> {
        let fields = normalize_fields(fields);
        let kind = fields
            .get("unit")
            .map(|s| s.trim().to_string())
            .unwrap_or_else(|| "job".to_string());
        match kind.as_str() {
            "job" => JobDefinition::from_fields(namespace, fields).map(Unit::Job),
            "template" => TemplateUnit::from_fields(namespace, fields).map(Unit::Template),
            "test plan" | "testplan" => TestPlan::from_fields(namespace, fields).map(Unit::TestPlan),
            "category" => Category::from_fields(namespace, fields).map(Unit::Category),
            other => Err(UnitError::UnknownKind {
                unit: fields
                    .get("id")
                    .cloned()
                    .unwrap_or_else(|| "<unnamed>".to_string()),
                kind: other.to_string(),
            }),
        }
    }

    pub fn id(&self) -> &str {
        match self {
            Unit::Job(u) => &u.id,
            Unit::Template(u) => &u.id,
            Unit::TestPlan(u) => &u.id,
            Unit::Category(u) => &u.id,
        }
    }

    pub fn namespace(&self) -> &str {
        match self {
            Unit::Job(u) => &u.namespace,
            Unit::Template(u) => &u.namespace,
            Unit::TestPlan(u) => &u.namespace,
            Unit::Category(u) => &u.namespace,
        }
    }

    pub fn partial_id(&self) -> &str {
        match self {
            Unit::Job(u) => &u.partial_id,
            Unit::Template(u) => &u.partial_id,
            Unit::TestPlan(u) => &u.partial_id,
            Unit::Category(u) => &u.partial_id,
        }
    }

    pub fn checksum(&self) -> &str {
        match self {
            Unit::Job(u) => &u.checksum,
            Unit::Template(u) => &u.checksum,
            Unit::TestPlan(u) => &u.checksum,
            Unit::Category(u) => &u.checksum,
        }
    }

    /// The normalized fields the unit was built from.
    pub fn fields(&self) -> &FieldMap {
        match self {
            Unit::Job(u) => &u.fields,
            Unit::Template(u) => &u.fields,
            Unit::TestPlan(u) => &u.fields,
            Unit::Category(u) => &u.fields,
        }
    }

    pub fn kind(&self) -> UnitKind {
        match self {
            Unit::Job(_) => UnitKind::Job,
            Unit::Template(_) => UnitKind::Template,
            Unit::TestPlan(_) => UnitKind::TestPlan,
            Unit::Category(_) => UnitKind::Category,
        }
    }

    pub fn as_job(&self) -> Option<&JobDefinition> {
        match self {
            Unit::Job(job) => Some(job),
            _ => None,
        }
    }
}
