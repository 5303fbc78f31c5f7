//! Test plan units.

use super::{FieldMap, UnitError, UnitResult, compute_checksum, qualify, unit_identity};

/// One `apply <category> to <pattern>` statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CategoryOverride {
    /// Fully qualified category id.
    pub category_id: String,
    /// Job id pattern, as written.
    pub pattern: String,
}

/// A named selection of jobs.
///
/// The pattern lists are kept as written (one pattern per entry, comments
/// and annotations stripped); [`crate::qualifier`] turns them into matchers.
#[derive(Debug, Clone, PartialEq)]
pub struct TestPlan {
    pub id: String,
    pub namespace: String,
    pub partial_id: String,
    pub name: Option<String>,
    pub include: Vec<String>,
    pub exclude: Vec<String>,
    pub mandatory_include: Vec<String>,
    pub bootstrap_include: Vec<String>,
    pub category_overrides: Vec<CategoryOverride>,
    pub fields: FieldMap,
    pub checksum: String,
}

impl TestPlan {
    pub fn from_fields(namespace: &str, fields: FieldMap) -> UnitResult<Self> {
        let (id, namespace, partial_id) = unit_identity(namespace, &fields, "id")?;

        let lookup = |key: &str| {
            fields
                .get(key)
                .or_else(|| fields.get(&key.replace('_', "-")))
                .map(String::as_str)
                .unwrap_or("")
        };

        let category_overrides = parse_category_overrides(&namespace, lookup("category_overrides"))
            .map_err(|reason| UnitError::InvalidField {
                unit: id.clone(),
                field: "category_overrides".to_string(),
                reason,
            })?;

        Ok(Self {
            name: fields.get("name").map(|n| n.trim().to_string()),
            include: pattern_lines(lookup("include")),
            exclude: pattern_lines(lookup("exclude")),
            mandatory_include: pattern_lines(lookup("mandatory_include")),
            bootstrap_include: pattern_lines(lookup("bootstrap_include")),
            category_overrides,
            checksum: compute_checksum(&fields),
            fields,
            id,
            namespace,
            partial_id,
        })
    }
}

/// Extracts one pattern per line, dropping comments and trailing
/// annotations such as `certification-status=blocker`.
pub fn pattern_lines(text: &str) -> Vec<String> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| line.split_whitespace().next())
        .map(str::to_string)
        .collect()
}

fn parse_category_overrides(namespace: &str, text: &str) -> Result<Vec<CategoryOverride>, String> {
    let mut overrides = Vec::new();
    for line in text.lines().map(str::trim) {
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let words: Vec<&str> = line.split_whitespace().collect();
        match words.as_slice() {
            ["apply", category, "to", pattern] => overrides.push(CategoryOverride {
                category_id: qualify(namespace, category),
                pattern: pattern.to_string(),
            }),
            _ => return Err(format!("expected 'apply <category> to <pattern>', got '{}'", line)),
        }
    }
    Ok(overrides)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(pairs: &[(&str, &str)]) -> FieldMap {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_test_plan_fields() {
        let plan = TestPlan::from_fields(
            "ns",
            fields(&[
                ("unit", "test plan"),
                ("id", "smoke"),
                ("name", "Smoke tests"),
                ("include", "disk/.*\n# comment\nnet/ping certification-status=blocker\n"),
                ("exclude", "disk/slow"),
                ("mandatory_include", "info/system"),
                ("bootstrap_include", "device"),
                ("category-overrides", "apply fast to disk/.*\napply other::slow to net/.*"),
            ]),
        )
        .unwrap();
        assert_eq!(plan.id, "ns::smoke");
        assert_eq!(plan.name.as_deref(), Some("Smoke tests"));
        assert_eq!(plan.include, vec!["disk/.*", "net/ping"]);
        assert_eq!(plan.exclude, vec!["disk/slow"]);
        assert_eq!(plan.mandatory_include, vec!["info/system"]);
        assert_eq!(plan.bootstrap_include, vec!["device"]);
        assert_eq!(
            plan.category_overrides,
            vec![
                CategoryOverride {
                    category_id: "ns::fast".into(),
                    pattern: "disk/.*".into()
                },
                CategoryOverride {
                    category_id: "other::slow".into(),
                    pattern: "net/.*".into()
                },
            ]
        );
    }

    #[test]
    fn test_bad_category_override() {
        let err = TestPlan::from_fields(
            "ns",
            fields(&[("id", "p"), ("category_overrides", "use fast for disk")]),
        )
        .unwrap_err();
        assert!(matches!(err, UnitError::InvalidField { .. }));
    }

    #[test]
    fn test_empty_plan_is_valid() {
        let plan = TestPlan::from_fields("ns", fields(&[("id", "p")])).unwrap();
        assert!(plan.include.is_empty());
        assert!(plan.category_overrides.is_empty());
    }
}
