use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Opaque, collection-unique record identifier.
pub type RecordId = i64;

/// A single named field of a record. Field order follows the record type's schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    pub content: String,
}

impl Field {
    pub fn new(name: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            content: content.into(),
        }
    }
}

/// One structured user record (a note) as held by the record store.
///
/// The field key set is fixed per `record_type`. The core only mutates field
/// contents through [`Record::set_field`]; the key set is never extended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: RecordId,
    pub record_type: String,
    /// Grouping label, e.g. a deck path like `Languages::Spanish`.
    pub container: String,
    pub fields: Vec<Field>,
    /// Optimistic-concurrency token; bumped by the store on every persist.
    #[serde(default)]
    pub revision: i64,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Record {
    pub fn new(
        id: RecordId,
        record_type: impl Into<String>,
        container: impl Into<String>,
        fields: Vec<Field>,
    ) -> Self {
        Self {
            id,
            record_type: record_type.into(),
            container: container.into(),
            fields,
            revision: 0,
            updated_at: None,
        }
    }

    /// Returns the content of `name`, or `None` if the record type has no such field.
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|f| f.name == name)
            .map(|f| f.content.as_str())
    }

    pub fn has_field(&self, name: &str) -> bool {
        self.fields.iter().any(|f| f.name == name)
    }

    /// Replaces the content of an existing field. Returns false when the field
    /// is not part of this record's type.
    pub fn set_field(&mut self, name: &str, content: impl Into<String>) -> bool {
        match self.fields.iter_mut().find(|f| f.name == name) {
            Some(field) => {
                field.content = content.into();
                true
            }
            None => false,
        }
    }
}
