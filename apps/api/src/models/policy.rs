use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Per-field access flags for one transformation run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldAccess {
    /// Sent as context in the payload.
    #[serde(default)]
    pub readable: bool,
    /// May receive a generated value while currently empty.
    #[serde(default)]
    pub writable: bool,
    /// May receive a generated value even when non-empty. Implies `writable`.
    #[serde(default)]
    pub overwritable: bool,
}

impl FieldAccess {
    pub const fn read_only() -> Self {
        Self {
            readable: true,
            writable: false,
            overwritable: false,
        }
    }

    pub const fn fill_empty() -> Self {
        Self {
            readable: true,
            writable: true,
            overwritable: false,
        }
    }

    pub const fn overwrite() -> Self {
        Self {
            readable: true,
            writable: true,
            overwritable: true,
        }
    }
}

/// One entry of a field policy as supplied by callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldRule {
    pub name: String,
    #[serde(flatten)]
    pub access: FieldAccess,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PolicyError {
    #[error("no fields selected")]
    NoFieldsSelected,

    #[error("field '{0}' is selected more than once")]
    DuplicateField(String),

    #[error("field '{0}' is overwritable but not writable")]
    OverwritableNotWritable(String),

    #[error("no writable fields selected")]
    NothingToFill,
}

/// Selected fields with their access flags, in caller order.
///
/// Immutable once built; construction enforces `overwritable ⇒ writable`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldPolicy {
    rules: Vec<FieldRule>,
}

impl FieldPolicy {
    pub fn new(rules: Vec<FieldRule>) -> Result<Self, PolicyError> {
        if rules.is_empty() {
            return Err(PolicyError::NoFieldsSelected);
        }
        for (idx, rule) in rules.iter().enumerate() {
            if rules[..idx].iter().any(|r| r.name == rule.name) {
                return Err(PolicyError::DuplicateField(rule.name.clone()));
            }
            if rule.access.overwritable && !rule.access.writable {
                return Err(PolicyError::OverwritableNotWritable(rule.name.clone()));
            }
        }
        if !rules.iter().any(|r| r.access.writable) {
            return Err(PolicyError::NothingToFill);
        }
        Ok(Self { rules })
    }

    pub fn get(&self, name: &str) -> Option<FieldAccess> {
        self.rules.iter().find(|r| r.name == name).map(|r| r.access)
    }

    pub fn is_selected(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn rules(&self) -> &[FieldRule] {
        &self.rules
    }

    pub fn selected(&self) -> impl Iterator<Item = &str> {
        self.rules.iter().map(|r| r.name.as_str())
    }

    pub fn readable(&self) -> impl Iterator<Item = &str> {
        self.rules
            .iter()
            .filter(|r| r.access.readable)
            .map(|r| r.name.as_str())
    }

    pub fn writable(&self) -> impl Iterator<Item = &str> {
        self.rules
            .iter()
            .filter(|r| r.access.writable)
            .map(|r| r.name.as_str())
    }

    /// Fields the service is asked to produce values for.
    pub fn fields_to_fill(&self) -> Vec<&str> {
        self.writable().collect()
    }
}

/// Optional free-text guidance keyed by field name.
pub type FieldInstructions = BTreeMap<String, String>;
