//! Template units: parametric definitions instantiated once per resource record.

use super::{FieldMap, UnitError, UnitResult, compute_checksum, qualify, unit_identity};
use crate::resource::{ResourceImport, ResourceProgram, parse_imports};
use crate::template::Pattern;

/// A parametric unit definition.
///
/// Every field that does not start with `template-` is a format pattern
/// over the attributes of one resource record.
#[derive(Debug, Clone, PartialEq)]
pub struct TemplateUnit {
    pub id: String,
    pub namespace: String,
    pub partial_id: String,
    /// Kind of unit produced by instantiation (default `job`).
    pub template_unit: String,
    /// Fully qualified id of the resource job providing records.
    pub template_resource: String,
    pub template_filter: Option<ResourceProgram>,
    pub imports: Vec<ResourceImport>,
    /// Patterns for the instantiated unit's fields.
    pub body: Vec<(String, Pattern)>,
    pub fields: FieldMap,
    pub checksum: String,
}

impl TemplateUnit {
    pub fn from_fields(namespace: &str, fields: FieldMap) -> UnitResult<Self> {
        let id_key = if fields.contains_key("template-id") {
            "template-id"
        } else {
            "id"
        };
        let (id, namespace, partial_id) = unit_identity(namespace, &fields, id_key)?;

        let invalid = |field: &str, reason: String| UnitError::InvalidField {
            unit: id.clone(),
            field: field.to_string(),
            reason,
        };

        if let Some(engine) = fields.get("template-engine").map(|e| e.trim())
            && !engine.is_empty()
            && engine != "default"
        {
            return Err(invalid(
                "template-engine",
                format!("unsupported template engine '{}'", engine),
            ));
        }

        let imports = match fields.get("imports") {
            Some(text) => parse_imports(text).map_err(|source| UnitError::Expression {
                unit: id.clone(),
                field: "imports".to_string(),
                source,
            })?,
            None => Vec::new(),
        };

        let resource = fields
            .get("template-resource")
            .map(|r| r.trim())
            .filter(|r| !r.is_empty())
            .ok_or_else(|| UnitError::MissingField {
                unit: id.clone(),
                field: "template-resource".to_string(),
            })?;
        let template_resource = match imports.iter().find(|i| i.alias == resource) {
            Some(import) => import.resource_id.clone(),
            None => qualify(&namespace, resource),
        };

        let template_filter = match fields.get("template-filter").filter(|f| !f.trim().is_empty()) {
            Some(source) => Some(
                ResourceProgram::compile(source, Some(&namespace), &imports).map_err(|source| {
                    UnitError::Expression {
                        unit: id.clone(),
                        field: "template-filter".to_string(),
                        source,
                    }
                })?,
            ),
            None => None,
        };

        let template_unit = fields
            .get("template-unit")
            .map(|u| u.trim().to_string())
            .filter(|u| !u.is_empty())
            .unwrap_or_else(|| "job".to_string());

        let mut body = Vec::new();
        for (key, value) in &fields {
            if key.starts_with("template-") || key == "unit" {
                continue;
            }
            let pattern = Pattern::parse(value).map_err(|reason| invalid(key.as_str(), reason))?;
            body.push((key.clone(), pattern));
        }
        if !body.iter().any(|(key, _)| key == "id") {
            return Err(UnitError::MissingField {
                unit: id.clone(),
                field: "id".to_string(),
            });
        }

        let checksum = compute_checksum(&fields);
        Ok(Self {
            template_unit,
            template_resource,
            template_filter,
            imports,
            body,
            checksum,
            fields,
            id,
            namespace,
            partial_id,
        })
    }
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
    fn test_template_from_fields() {
        let template = TemplateUnit::from_fields(
            "ns",
            fields(&[
                ("unit", "template"),
                ("template-resource", "device"),
                ("template-filter", "device.physical == 'yes'"),
                ("id", "disk/{name}"),
                ("plugin", "shell"),
                ("command", "check {path}"),
            ]),
        )
        .unwrap();
        assert_eq!(template.id, "ns::disk/{name}");
        assert_eq!(template.template_unit, "job");
        assert_eq!(template.template_resource, "ns::device");
        assert!(template.template_filter.is_some());
        let keys: Vec<_> = template.body.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["command", "id", "plugin"]);
    }

    #[test]
    fn test_template_id_field_names_the_template() {
        let template = TemplateUnit::from_fields(
            "ns",
            fields(&[
                ("template-id", "disk-tests"),
                ("template-resource", "other::device"),
                ("id", "disk/{name}"),
                ("plugin", "shell"),
            ]),
        )
        .unwrap();
        assert_eq!(template.id, "ns::disk-tests");
        assert_eq!(template.template_resource, "other::device");
    }

    #[test]
    fn test_template_requires_resource() {
        let err = TemplateUnit::from_fields("ns", fields(&[("id", "x/{a}"), ("plugin", "shell")]))
            .unwrap_err();
        assert!(matches!(err, UnitError::MissingField { ref field, .. } if field == "template-resource"));
    }

    #[test]
    fn test_template_rejects_foreign_engine() {
        let err = TemplateUnit::from_fields(
            "ns",
            fields(&[
                ("template-engine", "jinja2"),
                ("template-resource", "device"),
                ("id", "x/{{ name }}"),
            ]),
        )
        .unwrap_err();
        assert!(matches!(err, UnitError::InvalidField { ref field, .. } if field == "template-engine"));
    }

    #[test]
    fn test_template_rejects_malformed_pattern() {
        let err = TemplateUnit::from_fields(
            "ns",
            fields(&[
                ("template-resource", "device"),
                ("id", "x/{name"),
                ("plugin", "shell"),
            ]),
        )
        .unwrap_err();
        assert!(matches!(err, UnitError::InvalidField { ref field, .. } if field == "id"));
    }
}
