//! Category units, used only to group jobs for presentation.

use super::{FieldMap, UnitResult, compute_checksum, unit_identity};

#[derive(Debug, Clone, PartialEq)]
pub struct Category {
    pub id: String,
    pub namespace: String,
    pub partial_id: String,
    pub name: String,
    pub fields: FieldMap,
    pub checksum: String,
}

impl Category {
    pub fn from_fields(namespace: &str, fields: FieldMap) -> UnitResult<Self> {
        let (id, namespace, partial_id) = unit_identity(namespace, &fields, "id")?;
        let name = fields
            .get("name")
            .map(|n| n.trim().to_string())
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| partial_id.clone());
        Ok(Self {
            checksum: compute_checksum(&fields),
            fields,
            name,
            id,
            namespace,
            partial_id,
        })
    }
}
