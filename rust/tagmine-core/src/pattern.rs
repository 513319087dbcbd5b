//! Equipment pattern archetypes and their roles

use crate::error::{TagmineError, TagmineResult};
use crate::ids::PatternId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// One role within a pattern, e.g. "Supply Air Temperature" in an
/// air-handling-unit pattern.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternRole {
    pub name: String,
    /// Case-insensitive regexes matched against a point's name, address and
    /// description. Empty means the role has no naming expectation.
    pub name_patterns: Vec<String>,
    pub typical_unit: Option<String>,
    pub typical_min: Option<f64>,
    pub typical_max: Option<f64>,
    /// Expected update interval in milliseconds
    pub typical_update_ms: Option<f64>,
    pub required: bool,
    pub sort_order: u32,
}

impl PatternRole {
    pub fn typical_range(&self) -> Option<f64> {
        match (self.typical_min, self.typical_max) {
            (Some(min), Some(max)) if max > min => Some(max - min),
            _ => None,
        }
    }
}

/// A named archetype of points playing specific roles
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pattern {
    pub id: PatternId,
    pub name: String,
    pub description: Option<String>,
    /// Belief that this pattern produces correct suggestions, in [floor, 1]
    pub confidence: f64,
    pub active: bool,
    /// System-shipped patterns versus ones learned from operator feedback
    pub system_defined: bool,
    pub roles: Vec<PatternRole>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Pattern {
    /// Roles must be unique by name within a pattern
    pub fn validate(&self) -> TagmineResult<()> {
        if self.name.is_empty() {
            return Err(TagmineError::ContractViolation(
                "pattern name must not be empty".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.confidence) {
            return Err(TagmineError::ContractViolation(format!(
                "pattern {} confidence {} outside [0, 1]",
                self.name, self.confidence
            )));
        }
        let mut seen = HashSet::new();
        for role in &self.roles {
            if !seen.insert(role.name.as_str()) {
                return Err(TagmineError::ContractViolation(format!(
                    "pattern {} declares role {} more than once",
                    self.name, role.name
                )));
            }
        }
        Ok(())
    }

    pub fn required_roles(&self) -> impl Iterator<Item = &PatternRole> {
        self.roles.iter().filter(|r| r.required)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn role(name: &str) -> PatternRole {
        PatternRole {
            name: name.to_string(),
            name_patterns: vec![],
            typical_unit: None,
            typical_min: None,
            typical_max: None,
            typical_update_ms: None,
            required: false,
            sort_order: 0,
        }
    }

    fn pattern(roles: Vec<PatternRole>) -> Pattern {
        Pattern {
            id: PatternId::new(),
            name: "Chiller".to_string(),
            description: None,
            confidence: 0.75,
            active: true,
            system_defined: true,
            roles,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_duplicate_role_names_rejected() {
        let p = pattern(vec![role("Supply Temp"), role("Supply Temp")]);
        assert!(p.validate().is_err());
    }

    #[test]
    fn test_unique_role_names_accepted() {
        let p = pattern(vec![role("Supply Temp"), role("Return Temp")]);
        assert!(p.validate().is_ok());
    }

    #[test]
    fn test_confidence_bounds_checked() {
        let mut p = pattern(vec![]);
        p.confidence = 1.2;
        assert!(p.validate().is_err());
    }

    #[test]
    fn test_typical_range_requires_both_bounds() {
        let mut r = role("Power");
        assert_eq!(r.typical_range(), None);
        r.typical_min = Some(0.0);
        r.typical_max = Some(500.0);
        assert_eq!(r.typical_range(), Some(500.0));
        r.typical_max = Some(-1.0);
        assert_eq!(r.typical_range(), None);
    }
}
