//! Template expansion.
//!
//! A template unit carries format patterns such as `disk/read_{name}` in
//! every field that does not start with `template-`. Expansion walks the
//! records of the template's resource group in order, keeps those accepted by
//! `template-filter`, and renders one concrete unit per kept record.
//!
//! # Filtering
//!
//! The filter is evaluated against each record on its own: every filter line
//! must hold for that one record. This differs from `requires`, where each
//! line may be satisfied by a different record of the group.
//!
//! # Substitution
//!
//! | Pattern | Renders as |
//! |---------|------------|
//! | `{attr}` | Value of `attr` in the current record |
//! | `{__index__}` | Count of records accepted by the filter so far, the current one included (first is 1) |
//! | `{{` / `}}` | A literal brace |
//!
//! A missing attribute aborts the expansion of that template only.

use tracing::warn;

use crate::resource::Resource;
use crate::unit::{FieldMap, TemplateUnit, Unit, UnitCatalogue, UnitError};

/// Name of the synthetic counter available to every pattern.
pub const INDEX_FIELD: &str = "__index__";

/// Field added to instantiated units naming the template they came from.
pub const TEMPLATE_ORIGIN_FIELD: &str = "template-origin";

/// Result type for template expansion.
pub type TemplateResult<T> = Result<T, TemplateError>;

/// Per-template failures during expansion.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TemplateError {
    #[error("template {template}: field '{field}' references missing attribute '{attribute}'")]
    MissingAttribute {
        template: String,
        field: String,
        attribute: String,
    },

    #[error("template {template}: instantiated unit is invalid: {source}")]
    InvalidUnit {
        template: String,
        #[source]
        source: UnitError,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Field(String),
}

/// A parsed format pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pattern {
    segments: Vec<Segment>,
}

impl Pattern {
    /// Parses a pattern, rejecting unbalanced braces, empty or non-identifier
    /// field names and format specifications.
    pub fn parse(text: &str) -> Result<Self, String> {
        let mut segments = Vec::new();
        let mut literal = String::new();
        let mut chars = text.chars().peekable();

        while let Some(c) = chars.next() {
            match c {
                '{' if chars.peek() == Some(&'{') => {
                    chars.next();
                    literal.push('{');
                }
                '}' if chars.peek() == Some(&'}') => {
                    chars.next();
                    literal.push('}');
                }
                '}' => return Err("single '}' encountered in pattern".to_string()),
                '{' => {
                    let mut name = String::new();
                    loop {
                        match chars.next() {
                            Some('}') => break,
                            Some(c) if c.is_ascii_alphanumeric() || c == '_' => name.push(c),
                            Some(c) => {
                                return Err(format!(
                                    "unexpected {:?} in replacement field '{{{}'",
                                    c, name
                                ));
                            }
                            None => return Err("unterminated replacement field".to_string()),
                        }
                    }
                    if name.is_empty() {
                        return Err("empty replacement field '{}'".to_string());
                    }
                    if !literal.is_empty() {
                        segments.push(Segment::Literal(std::mem::take(&mut literal)));
                    }
                    segments.push(Segment::Field(name));
                }
                c => literal.push(c),
            }
        }
        if !literal.is_empty() {
            segments.push(Segment::Literal(literal));
        }
        Ok(Self { segments })
    }

    /// Attribute names the pattern substitutes.
    pub fn attributes(&self) -> impl Iterator<Item = &str> {
        self.segments.iter().filter_map(|s| match s {
            Segment::Field(name) => Some(name.as_str()),
            Segment::Literal(_) => None,
        })
    }

    /// Renders the pattern, returning the first missing attribute on failure.
    pub fn render(&self, record: &Resource, index: usize) -> Result<String, String> {
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Field(name) if name == INDEX_FIELD => out.push_str(&index.to_string()),
                Segment::Field(name) => match record.fields().get(name) {
                    Some(value) => out.push_str(value),
                    None => return Err(name.clone()),
                },
            }
        }
        Ok(out)
    }
}

/// Instantiates `template` once per accepted record.
///
/// The output is deterministic for a given record sequence.
pub fn expand(template: &TemplateUnit, records: &[Resource]) -> TemplateResult<Vec<Unit>> {
    let mut units = Vec::new();
    let accepted = records.iter().filter(|record| {
        template
            .template_filter
            .as_ref()
            .is_none_or(|filter| filter.matches_record(record))
    });

    for (position, record) in accepted.enumerate() {
        let index = position + 1;
        let mut fields = FieldMap::new();
        for (key, pattern) in &template.body {
            let value = pattern
                .render(record, index)
                .map_err(|attribute| TemplateError::MissingAttribute {
                    template: template.id.clone(),
                    field: key.clone(),
                    attribute,
                })?;
            fields.insert(key.clone(), value);
        }
        fields.insert("unit".to_string(), template.template_unit.clone());
        fields.insert(TEMPLATE_ORIGIN_FIELD.to_string(), template.id.clone());

        let unit = Unit::from_fields(&template.namespace, fields).map_err(|source| {
            TemplateError::InvalidUnit {
                template: template.id.clone(),
                source,
            }
        })?;
        units.push(unit);
    }

    Ok(units)
}

/// Expands every template in `catalogue` bound to `resource_id`.
///
/// A failing template is logged and contributes nothing; the others are
/// unaffected.
pub fn expand_for_resource(
    catalogue: &UnitCatalogue,
    resource_id: &str,
    records: &[Resource],
) -> (Vec<Unit>, Vec<TemplateError>) {
    let mut units = Vec::new();
    let mut errors = Vec::new();
    for template in catalogue
        .templates()
        .filter(|t| t.template_resource == resource_id)
    {
        match expand(template, records) {
            Ok(expanded) => units.extend(expanded),
            Err(e) => {
                warn!("Skipping template {}: {}", template.id, e);
                errors.push(e);
            }
        }
    }
    (units, errors)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::unit::UnitKind;

    fn fields(pairs: &[(&str, &str)]) -> FieldMap {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn record(pairs: &[(&str, &str)]) -> Resource {
        Resource::new(fields(pairs))
    }

    fn disk_template() -> TemplateUnit {
        TemplateUnit::from_fields(
            "ns",
            fields(&[
                ("unit", "template"),
                ("template-resource", "device"),
                ("template-filter", "device.physical == 'yes'"),
                ("id", "disk/read_{name}"),
                ("plugin", "shell"),
                ("command", "read-test /dev/{name} --slot {__index__}"),
            ]),
        )
        .unwrap()
    }

    #[test]
    fn test_pattern_parse_and_render() {
        let pattern = Pattern::parse("a {x} {{literal}} {__index__}").unwrap();
        assert_eq!(pattern.attributes().collect::<Vec<_>>(), vec!["x", "__index__"]);
        assert_eq!(
            pattern.render(&record(&[("x", "1")]), 3).unwrap(),
            "a 1 {literal} 3"
        );
    }

    #[test]
    fn test_pattern_missing_attribute() {
        let pattern = Pattern::parse("{missing}").unwrap();
        assert_eq!(pattern.render(&record(&[]), 0), Err("missing".to_string()));
    }

    #[test]
    fn test_pattern_rejects_malformed() {
        for bad in ["{", "}", "{}", "{a", "{a:>5}", "{a.b}", "{ a }"] {
            assert!(Pattern::parse(bad).is_err(), "{:?} should be rejected", bad);
        }
    }

    #[test]
    fn test_expand_filters_and_indexes() {
        let template = disk_template();
        let records = vec![
            record(&[("name", "sda"), ("physical", "yes")]),
            record(&[("name", "loop0"), ("physical", "no")]),
            record(&[("name", "sdb"), ("physical", "yes")]),
        ];
        let units = expand(&template, &records).unwrap();
        assert_eq!(units.len(), 2);
        assert_eq!(units[0].id(), "ns::disk/read_sda");
        assert_eq!(units[1].id(), "ns::disk/read_sdb");
        assert_eq!(units[0].kind(), UnitKind::Job);

        let second = units[1].as_job().unwrap();
        assert_eq!(
            second.command.as_deref(),
            Some("read-test /dev/sdb --slot 2")
        );
        assert_eq!(second.template_id.as_deref(), Some("ns::disk/read_{name}"));
    }

    #[test]
    fn test_expand_is_deterministic() {
        let template = disk_template();
        let records = vec![
            record(&[("name", "sda"), ("physical", "yes")]),
            record(&[("name", "sdb"), ("physical", "yes")]),
        ];
        assert_eq!(
            expand(&template, &records).unwrap(),
            expand(&template, &records).unwrap()
        );
    }

    #[test]
    fn test_expand_without_filter_takes_all() {
        let template = TemplateUnit::from_fields(
            "ns",
            fields(&[
                ("template-resource", "device"),
                ("id", "slot_{__index__}"),
                ("plugin", "manual"),
            ]),
        )
        .unwrap();
        let units = expand(&template, &[record(&[]), record(&[])]).unwrap();
        let ids: Vec<_> = units.iter().map(|u| u.id()).collect();
        assert_eq!(ids, vec!["ns::slot_1", "ns::slot_2"]);
    }

    #[test]
    fn test_index_counts_from_one() {
        let template = TemplateUnit::from_fields(
            "ns",
            fields(&[
                ("template-resource", "device"),
                ("id", "x_{__index__}"),
                ("plugin", "manual"),
            ]),
        )
        .unwrap();
        let units = expand(&template, &[record(&[])]).unwrap();
        assert_eq!(units[0].id(), "ns::x_1");
    }

    #[test]
    fn test_expand_missing_attribute_aborts_template() {
        let template = disk_template();
        let records = vec![record(&[("physical", "yes")])];
        let err = expand(&template, &records).unwrap_err();
        assert!(matches!(err, TemplateError::MissingAttribute { ref attribute, .. } if attribute == "name"));
    }

    #[test]
    fn test_expand_for_resource_isolates_failures() {
        let mut catalogue = UnitCatalogue::new();
        catalogue.add(Unit::Template(disk_template())).unwrap();
        let broken = TemplateUnit::from_fields(
            "ns",
            fields(&[
                ("template-id", "broken"),
                ("template-resource", "device"),
                ("id", "broken_{serial}"),
                ("plugin", "shell"),
                ("command", "true"),
            ]),
        )
        .unwrap();
        catalogue.add(Unit::Template(broken)).unwrap();

        let records = vec![record(&[("name", "sda"), ("physical", "yes")])];
        let (units, errors) = expand_for_resource(&catalogue, "ns::device", &records);
        assert_eq!(units.len(), 1);
        assert_eq!(errors.len(), 1);

        let (none, _) = expand_for_resource(&catalogue, "ns::other", &records);
        assert!(none.is_empty());
    }

    #[test]
    fn test_expand_invalid_instantiation() {
        let template = TemplateUnit::from_fields(
            "ns",
            fields(&[
                ("template-resource", "device"),
                ("id", "x_{name}"),
                ("plugin", "{kind}"),
            ]),
        )
        .unwrap();
        let err = expand(&template, &[record(&[("name", "a"), ("kind", "bogus")])]).unwrap_err();
        assert!(matches!(err, TemplateError::InvalidUnit { .. }));
    }
}
