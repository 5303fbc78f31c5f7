//! The unit catalogue: an arena of units with an id index.
//!
//! The catalogue is an explicitly constructed value handed to the qualifier,
//! the resolver and the session; there is no process-wide registry, so
//! independent sessions (and tests) can work on independent catalogues.
//!
//! Iteration order is insertion order, which the qualifier relies on when a
//! pattern selects several jobs.

use std::collections::HashMap;

use super::{Category, JobDefinition, TemplateUnit, TestPlan, Unit, UnitError, UnitResult};

/// Outcome of [`UnitCatalogue::add`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Addition {
    /// The unit was new and has been stored.
    Added,
    /// An identical unit (same id and checksum) was already present.
    AlreadyPresent,
}

#[derive(Debug, Clone, Default)]
pub struct UnitCatalogue {
    units: Vec<Unit>,
    index: HashMap<String, usize>,
}

impl UnitCatalogue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a unit.
    ///
    /// Re-adding a unit with identical content is not an error; a different
    /// definition under an existing id is.
    pub fn add(&mut self, unit: Unit) -> UnitResult<Addition> {
        if let Some(&existing) = self.index.get(unit.id()) {
            if self.units[existing].checksum() == unit.checksum() {
                return Ok(Addition::AlreadyPresent);
            }
            return Err(UnitError::Duplicate(unit.id().to_string()));
        }
        self.index.insert(unit.id().to_string(), self.units.len());
        self.units.push(unit);
        Ok(Addition::Added)
    }

    /// Adds every unit, collecting the errors of those that were rejected.
    pub fn extend(&mut self, units: impl IntoIterator<Item = Unit>) -> Vec<UnitError> {
        units
            .into_iter()
            .filter_map(|unit| self.add(unit).err())
            .collect()
    }

    pub fn get(&self, id: &str) -> Option<&Unit> {
        self.index.get(id).map(|&i| &self.units[i])
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    pub fn job(&self, id: &str) -> Option<&JobDefinition> {
        self.get(id).and_then(Unit::as_job)
    }

    pub fn template(&self, id: &str) -> Option<&TemplateUnit> {
        match self.get(id) {
            Some(Unit::Template(t)) => Some(t),
            _ => None,
        }
    }

    pub fn test_plan(&self, id: &str) -> Option<&TestPlan> {
        match self.get(id) {
            Some(Unit::TestPlan(p)) => Some(p),
            _ => None,
        }
    }

    pub fn category(&self, id: &str) -> Option<&Category> {
        match self.get(id) {
            Some(Unit::Category(c)) => Some(c),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Unit> {
        self.units.iter()
    }

    pub fn jobs(&self) -> impl Iterator<Item = &JobDefinition> {
        self.units.iter().filter_map(Unit::as_job)
    }

    pub fn templates(&self) -> impl Iterator<Item = &TemplateUnit> {
        self.units.iter().filter_map(|u| match u {
            Unit::Template(t) => Some(t),
            _ => None,
        })
    }

    pub fn test_plans(&self) -> impl Iterator<Item = &TestPlan> {
        self.units.iter().filter_map(|u| match u {
            Unit::TestPlan(p) => Some(p),
            _ => None,
        })
    }

    pub fn categories(&self) -> impl Iterator<Item = &Category> {
        self.units.iter().filter_map(|u| match u {
            Unit::Category(c) => Some(c),
            _ => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::unit::FieldMap;

    fn job(id: &str, command: &str) -> Unit {
        let fields: FieldMap = [("id", id), ("plugin", "shell"), ("command", command)]
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Unit::from_fields("ns", fields).unwrap()
    }

    #[test]
    fn test_add_and_lookup() {
        let mut catalogue = UnitCatalogue::new();
        assert_eq!(catalogue.add(job("a", "true")), Ok(Addition::Added));
        assert_eq!(catalogue.add(job("b", "true")), Ok(Addition::Added));
        assert_eq!(catalogue.len(), 2);
        assert!(catalogue.job("ns::a").is_some());
        assert!(catalogue.template("ns::a").is_none());
        let ids: Vec<_> = catalogue.jobs().map(|j| j.id.as_str()).collect();
        assert_eq!(ids, vec!["ns::a", "ns::b"]);
    }

    #[test]
    fn test_identical_readd_is_accepted() {
        let mut catalogue = UnitCatalogue::new();
        catalogue.add(job("a", "true")).unwrap();
        assert_eq!(catalogue.add(job("a", "true")), Ok(Addition::AlreadyPresent));
        assert_eq!(catalogue.len(), 1);
    }

    #[test]
    fn test_conflicting_redefinition_is_rejected() {
        let mut catalogue = UnitCatalogue::new();
        catalogue.add(job("a", "true")).unwrap();
        assert_eq!(
            catalogue.add(job("a", "false")),
            Err(UnitError::Duplicate("ns::a".to_string()))
        );
        assert_eq!(
            catalogue.job("ns::a").unwrap().command.as_deref(),
            Some("true")
        );
    }

    #[test]
    fn test_extend_collects_errors() {
        let mut catalogue = UnitCatalogue::new();
        let errors = catalogue.extend(vec![job("a", "1"), job("a", "2"), job("b", "3")]);
        assert_eq!(errors.len(), 1);
        assert_eq!(catalogue.len(), 2);
    }
}
