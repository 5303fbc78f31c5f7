//! Resource records and the restricted resource-expression language.
//!
//! Resource jobs print key/value records; other jobs gate themselves on those
//! records through `requires` expressions such as
//! `package.name == "fwts"`. This module compiles such expressions into a
//! typed tree (see [`parser`]) and evaluates them with [`eval`]. No general
//! interpreter is involved.
//!
//! # Evaluation contract
//!
//! ```text
//! requires:                          ResourceProgram
//!   package.name == "fwts"     ──►   expression 1 ─┐
//!   int(memory.size) > 1024    ──►   expression 2 ─┴─ all() must hold
//!
//! expression N over group G    ──►   any(record in G satisfies N)
//! ```
//!
//! - Every line of a program is an independent expression; the program
//!   holds only when every expression holds.
//! - One expression holds when at least one record of the group it names
//!   makes it truthy. A record that fails to evaluate counts as false.
//! - An empty or missing group never satisfies an expression.
//!
//! Because every expression is tested record by record, two conditions on
//! the same group joined with `and` inside one expression must be met by a
//! single record, while the same conditions on two lines may be met by two
//! different records. That asymmetry is long-standing behaviour that
//! existing job definitions rely on and is kept as is.

pub mod eval;
pub mod lexer;
pub mod parser;

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::rfc822::{self, Rfc822Result};
use crate::unit::qualify;

pub use eval::{EvalError, Value};
pub use parser::Expr;

/// Result type for expression compilation.
pub type ResourceResult<T> = Result<T, ResourceError>;

/// Compile-time errors for resource expressions.
///
/// Every variant is a syntax error from the job author's point of view and
/// is reported when the owning unit is loaded, never at run time.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResourceError {
    /// The text is not a well-formed expression.
    #[error("syntax error at offset {offset}: {message}")]
    Syntax { offset: usize, message: String },

    /// The expression is well formed but uses a construct outside the language.
    #[error("unsupported construct: {0}")]
    Unsupported(String),

    /// The expression reads no resource at all.
    #[error("expression does not reference any resource")]
    NoResourcesReferenced,

    /// The expression reads more than one resource.
    #[error("expression references more than one resource: {}", .0.join(", "))]
    MultipleResourcesReferenced(Vec<String>),

    /// An `imports` line is malformed.
    #[error("invalid import statement: {0}")]
    BadImport(String),
}

/// One resource record: a flat mapping from key to string value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Resource(BTreeMap<String, String>);

impl Resource {
    pub fn new(fields: BTreeMap<String, String>) -> Self {
        Self(fields)
    }

    /// Returns the attribute value, or the empty string when absent.
    pub fn get(&self, key: &str) -> &str {
        self.0.get(key).map(String::as_str).unwrap_or("")
    }

    pub fn fields(&self) -> &BTreeMap<String, String> {
        &self.0
    }
}

/// Resource records grouped by the id of the job that produced them.
pub type ResourceMap = BTreeMap<String, Vec<Resource>>;

/// Parses the stdout of a resource job into records.
///
/// Output with no records yields an empty group.
pub fn parse_resource_output(text: &str) -> Rfc822Result<Vec<Resource>> {
    Ok(rfc822::parse_records(text)?
        .into_iter()
        .map(|record| Resource::new(record.fields))
        .collect())
}

/// An `imports` entry binding a local alias to a fully qualified resource id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceImport {
    pub resource_id: String,
    pub alias: String,
}

/// Parses an `imports` field.
///
/// Each non-empty line must read `from <namespace> import <partial_id>`,
/// optionally followed by `as <alias>`.
pub fn parse_imports(text: &str) -> ResourceResult<Vec<ResourceImport>> {
    let mut imports = Vec::new();
    for line in text.lines().map(str::trim) {
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let words: Vec<&str> = line.split_whitespace().collect();
        let (namespace, partial_id, alias) = match words.as_slice() {
            ["from", ns, "import", id] => (*ns, *id, *id),
            ["from", ns, "import", id, "as", alias] => (*ns, *id, *alias),
            _ => return Err(ResourceError::BadImport(line.to_string())),
        };
        if partial_id.contains("::") || namespace.contains("::") {
            return Err(ResourceError::BadImport(line.to_string()));
        }
        imports.push(ResourceImport {
            resource_id: format!("{}::{}", namespace, partial_id),
            alias: alias.to_string(),
        });
    }
    Ok(imports)
}

/// A single compiled expression bound to exactly one resource group.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceExpression {
    text: String,
    variable: String,
    resource_id: String,
    expr: Expr,
}

impl ResourceExpression {
    /// Compiles one expression.
    ///
    /// The free variable is resolved through `imports` first and is
    /// otherwise qualified with `namespace`.
    pub fn compile(
        text: &str,
        namespace: Option<&str>,
        imports: &[ResourceImport],
    ) -> ResourceResult<Self> {
        let expr = parser::parse(text)?;
        let mut variables = expr.variables();
        let variable = match variables.len() {
            0 => return Err(ResourceError::NoResourcesReferenced),
            1 => variables.remove(0),
            _ => return Err(ResourceError::MultipleResourcesReferenced(variables)),
        };
        let resource_id = match imports.iter().find(|i| i.alias == variable) {
            Some(import) => import.resource_id.clone(),
            None => match namespace {
                Some(ns) => qualify(ns, &variable),
                None => variable.clone(),
            },
        };
        Ok(Self {
            text: text.to_string(),
            variable,
            resource_id,
            expr,
        })
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    /// Name used for the resource inside the expression.
    pub fn variable(&self) -> &str {
        &self.variable
    }

    /// Fully qualified id of the resource job whose records are read.
    pub fn resource_id(&self) -> &str {
        &self.resource_id
    }

    /// Evaluates the expression against one record.
    pub fn evaluate_record(&self, record: &Resource) -> Result<bool, EvalError> {
        eval::evaluate(&self.expr, record).map(|v| v.truthy())
    }

    /// Evaluates the expression against a whole group: true when any record
    /// satisfies it. Records failing to evaluate count as false.
    pub fn evaluate(&self, group: &[Resource]) -> bool {
        group.iter().any(|record| match self.evaluate_record(record) {
            Ok(result) => result,
            Err(e) => {
                tracing::debug!(
                    "Expression {:?} failed on a record of {}: {}",
                    self.text,
                    self.resource_id,
                    e
                );
                false
            }
        })
    }
}

/// A multi-line `requires` or `template-filter` program.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceProgram {
    text: String,
    expressions: Vec<ResourceExpression>,
}

impl ResourceProgram {
    /// Compiles every non-empty line of `text` as its own expression.
    pub fn compile(
        text: &str,
        namespace: Option<&str>,
        imports: &[ResourceImport],
    ) -> ResourceResult<Self> {
        let expressions = text
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(|line| ResourceExpression::compile(line, namespace, imports))
            .collect::<ResourceResult<Vec<_>>>()?;
        Ok(Self {
            text: text.to_string(),
            expressions,
        })
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn expressions(&self) -> &[ResourceExpression] {
        &self.expressions
    }

    /// Ids of every resource job the program reads, sorted and de-duplicated.
    pub fn required_resources(&self) -> BTreeSet<String> {
        self.expressions
            .iter()
            .map(|e| e.resource_id.clone())
            .collect()
    }

    /// Group semantics: every expression must be satisfied by some record of
    /// its group.
    pub fn evaluate(&self, resources: &ResourceMap) -> bool {
        self.first_unsatisfied(resources).is_none()
    }

    /// Returns the first expression not satisfied by `resources`.
    pub fn first_unsatisfied(&self, resources: &ResourceMap) -> Option<&ResourceExpression> {
        self.expressions.iter().find(|expr| {
            let group = resources
                .get(&expr.resource_id)
                .map(Vec::as_slice)
                .unwrap_or(&[]);
            !expr.evaluate(group)
        })
    }

    /// Single-record semantics: every expression must hold for `record`
    /// itself.
    pub fn matches_record(&self, record: &Resource) -> bool {
        self.expressions
            .iter()
            .all(|expr| expr.evaluate_record(record).unwrap_or(false))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(pairs: &[(&str, &str)]) -> Resource {
        Resource::new(
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }

    fn map(id: &str, records: Vec<Resource>) -> ResourceMap {
        let mut map = ResourceMap::new();
        map.insert(id.to_string(), records);
        map
    }

    #[test]
    fn test_compile_qualifies_variable() {
        let expr = ResourceExpression::compile("package.name == 'fwts'", Some("ns"), &[]).unwrap();
        assert_eq!(expr.variable(), "package");
        assert_eq!(expr.resource_id(), "ns::package");
    }

    #[test]
    fn test_compile_uses_import_alias() {
        let imports = parse_imports("from com.example import cpuinfo as cpu").unwrap();
        let expr = ResourceExpression::compile("cpu.count == '4'", Some("ns"), &imports).unwrap();
        assert_eq!(expr.resource_id(), "com.example::cpuinfo");
    }

    #[test]
    fn test_compile_rejects_zero_variables() {
        assert_eq!(
            ResourceExpression::compile("1 == 1", None, &[]),
            Err(ResourceError::NoResourcesReferenced)
        );
    }

    #[test]
    fn test_compile_rejects_two_variables() {
        let err = ResourceExpression::compile("a.x == b.y", None, &[]).unwrap_err();
        assert_eq!(
            err,
            ResourceError::MultipleResourcesReferenced(vec!["a".into(), "b".into()])
        );
    }

    #[test]
    fn test_empty_group_is_false() {
        for source in [
            "p.name == 'x'",
            "p.name != 'x'",
            "p.name == ''",
            "not p.name",
            "True or p.name",
        ] {
            let expr = ResourceExpression::compile(source, None, &[]).unwrap();
            assert!(!expr.evaluate(&[]), "{} should be false", source);
        }
    }

    #[test]
    fn test_any_semantics_over_group() {
        let expr = ResourceExpression::compile("package.name == 'fwts'", None, &[]).unwrap();
        let group = vec![record(&[("name", "foo")]), record(&[("name", "fwts")])];
        assert!(expr.evaluate(&group));
        assert!(!expr.evaluate(&group[..1]));
    }

    #[test]
    fn test_failing_record_counts_as_false() {
        let expr = ResourceExpression::compile("int(m.size) > 10", None, &[]).unwrap();
        let group = vec![record(&[("size", "lots")]), record(&[("size", "20")])];
        assert!(expr.evaluate(&group));
        assert!(!expr.evaluate(&group[..1]));
    }

    #[test]
    fn test_program_ands_lines_and_anys_records() {
        // Each line is met by a different record; no single record meets both.
        let program = ResourceProgram::compile(
            "device.category == 'DISK'\ndevice.category != 'DISK'",
            None,
            &[],
        )
        .unwrap();
        let resources = map(
            "device",
            vec![
                record(&[("category", "DISK")]),
                record(&[("category", "NETWORK")]),
                record(&[("category", "AUDIO")]),
            ],
        );
        assert!(program.evaluate(&resources));

        // The same two conditions inside one expression need a single record.
        let single = ResourceProgram::compile(
            "device.category == 'DISK' and device.category != 'DISK'",
            None,
            &[],
        )
        .unwrap();
        assert!(!single.evaluate(&resources));
    }

    #[test]
    fn test_program_missing_group_is_unsatisfied() {
        let program = ResourceProgram::compile("a.x == '1'\nb.y == '2'", Some("ns"), &[]).unwrap();
        let resources = map("ns::a", vec![record(&[("x", "1")])]);
        let failed = program.first_unsatisfied(&resources).unwrap();
        assert_eq!(failed.resource_id(), "ns::b");
    }

    #[test]
    fn test_program_required_resources() {
        let program =
            ResourceProgram::compile("a.x == '1'\n\n  b.y == '2'\na.z == '3'", Some("ns"), &[])
                .unwrap();
        let ids: Vec<_> = program.required_resources().into_iter().collect();
        assert_eq!(ids, vec!["ns::a".to_string(), "ns::b".to_string()]);
        assert_eq!(program.expressions().len(), 3);
    }

    #[test]
    fn test_program_compile_error_propagates() {
        assert!(ResourceProgram::compile("a.x == '1'\na.x not in 'b'", None, &[]).is_err());
    }

    #[test]
    fn test_matches_record() {
        let program = ResourceProgram::compile("d.physical == 'yes'", None, &[]).unwrap();
        assert!(program.matches_record(&record(&[("physical", "yes")])));
        assert!(!program.matches_record(&record(&[("physical", "no")])));
    }

    #[test]
    fn test_parse_imports() {
        let imports =
            parse_imports("from com.a import x\n\nfrom com.b import y as z\n").unwrap();
        assert_eq!(
            imports,
            vec![
                ResourceImport {
                    resource_id: "com.a::x".into(),
                    alias: "x".into()
                },
                ResourceImport {
                    resource_id: "com.b::y".into(),
                    alias: "z".into()
                },
            ]
        );
        assert!(parse_imports("import x").is_err());
        assert!(parse_imports("from com.a import ns::x").is_err());
    }

    #[test]
    fn test_parse_resource_output() {
        let records = parse_resource_output("name: fwts\n\nname: foo\n").unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].get("name"), "foo");
        assert!(parse_resource_output("\n").unwrap().is_empty());
    }
}
