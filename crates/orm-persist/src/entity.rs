//! Entity access for the persistence core.
//!
//! The executor never sees concrete entity types. It reads and writes
//! properties by name through the [`Entity`] trait and follows relations
//! through [`Related`] handles.

use crate::subject::SubjectId;
use orm_persist_core::{IdMap, Value};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Property-level access to an in-memory entity.
pub trait Entity: fmt::Debug + Send + Sync {
    /// Read a property. `None` means the entity does not carry it at all,
    /// as opposed to carrying `Value::Null`.
    fn value(&self, property: &str) -> Option<Value>;

    /// Write a property (generated ids, timestamps, versions, tree levels).
    fn set_value(&mut self, property: &str, value: Value);

    /// The current state of a relation property.
    fn related(&self, relation: &str) -> Related {
        let _ = relation;
        Related::Unset
    }
}

/// A reference to a related entity.
#[derive(Debug, Clone, PartialEq)]
pub enum RelatedRef {
    /// An entity taking part in the current batch.
    Subject(SubjectId),
    /// An entity outside the batch with a known identity.
    Persisted(IdMap),
}

impl RelatedRef {
    /// Reference a stored row with a single-column primary key.
    pub fn persisted(property: &'static str, id: impl Into<Value>) -> Self {
        let mut ids = IdMap::new();
        ids.insert(property, id.into());
        RelatedRef::Persisted(ids)
    }

    pub fn subject_id(&self) -> Option<SubjectId> {
        match self {
            RelatedRef::Subject(id) => Some(*id),
            RelatedRef::Persisted(_) => None,
        }
    }
}

impl From<SubjectId> for RelatedRef {
    fn from(id: SubjectId) -> Self {
        RelatedRef::Subject(id)
    }
}

/// The state of a relation property on an entity.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum Related {
    /// The relation was never loaded or assigned; leave it alone.
    #[default]
    Unset,
    /// Explicitly empty: the foreign key is NULL.
    Null,
    /// A single related entity.
    One(RelatedRef),
    /// A collection of related entities.
    Many(Vec<RelatedRef>),
}

impl Related {
    pub fn is_unset(&self) -> bool {
        matches!(self, Related::Unset)
    }

    /// The single related entity, if any.
    pub fn one(&self) -> Option<&RelatedRef> {
        match self {
            Related::One(r) => Some(r),
            _ => None,
        }
    }

    /// Every related entity, whatever the cardinality.
    pub fn refs(&self) -> Vec<&RelatedRef> {
        match self {
            Related::Unset | Related::Null => Vec::new(),
            Related::One(r) => vec![r],
            Related::Many(refs) => refs.iter().collect(),
        }
    }
}

/// A dynamically-typed entity backed by a property map.
///
/// Property values serialize with serde; relation handles are only
/// meaningful within one batch and are skipped.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DynamicEntity {
    values: BTreeMap<String, Value>,
    #[serde(skip)]
    relations: BTreeMap<String, Related>,
}

impl DynamicEntity {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder: set a property.
    #[must_use]
    pub fn with(mut self, property: &str, value: impl Into<Value>) -> Self {
        self.values.insert(property.to_string(), value.into());
        self
    }

    /// Builder: set a relation.
    #[must_use]
    pub fn with_related(mut self, relation: &str, related: Related) -> Self {
        self.relations.insert(relation.to_string(), related);
        self
    }

    pub fn get(&self, property: &str) -> Option<&Value> {
        self.values.get(property)
    }

    pub fn set_related(&mut self, relation: &str, related: Related) {
        self.relations.insert(relation.to_string(), related);
    }

    /// Drop a property so the entity no longer carries it.
    pub fn remove(&mut self, property: &str) -> Option<Value> {
        self.values.remove(property)
    }
}

impl Entity for DynamicEntity {
    fn value(&self, property: &str) -> Option<Value> {
        self.values.get(property).cloned()
    }

    fn set_value(&mut self, property: &str, value: Value) {
        self.values.insert(property.to_string(), value);
    }

    fn related(&self, relation: &str) -> Related {
        self.relations.get(relation).cloned().unwrap_or_default()
    }
}
