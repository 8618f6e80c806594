//! Subjects: one per entity touched by a persist operation.

use crate::entity::{Entity, Related, RelatedRef};
use orm_persist_core::{EntityMetadata, IdMap, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Stable handle of a subject within one [`SubjectCollection`].
///
/// [`SubjectCollection`]: crate::SubjectCollection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubjectId(usize);

impl SubjectId {
    /// Handle of a subject that was never pushed into a collection.
    pub(crate) const UNASSIGNED: SubjectId = SubjectId(usize::MAX);

    /// The handle the subject at `index` of a collection gets. Lets a
    /// relation point at a subject that is pushed later.
    pub const fn new(index: usize) -> Self {
        SubjectId(index)
    }

    /// Position of the subject in its collection.
    pub const fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for SubjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Last persisted state of an entity, used to compute diffs.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Snapshot {
    values: BTreeMap<&'static str, Value>,
    relations: BTreeMap<&'static str, Option<IdMap>>,
}

impl Snapshot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Capture the current column values and persisted relation targets of
    /// `entity`.
    pub fn capture(metadata: &EntityMetadata, entity: &dyn Entity) -> Self {
        let mut snapshot = Self::new();
        for table in metadata.tables() {
            for column in &table.columns {
                if let Some(value) = entity.value(column.property_name) {
                    snapshot.values.insert(column.property_name, value);
                }
            }
            for relation in table.relations.iter().filter(|r| r.kind.is_owning()) {
                match entity.related(relation.property_name) {
                    Related::Null => {
                        snapshot.relations.insert(relation.property_name, None);
                    }
                    Related::One(RelatedRef::Persisted(ids)) => {
                        snapshot.relations.insert(relation.property_name, Some(ids));
                    }
                    _ => {}
                }
            }
        }
        tracing::trace!(
            target_entity = metadata.target,
            values = snapshot.values.len(),
            relations = snapshot.relations.len(),
            "Captured subject snapshot"
        );
        snapshot
    }

    /// Builder: record a persisted property value.
    #[must_use]
    pub fn value(mut self, property: &'static str, value: impl Into<Value>) -> Self {
        self.values.insert(property, value.into());
        self
    }

    /// Builder: record the persisted target of an owning relation.
    #[must_use]
    pub fn relation(mut self, relation: &'static str, target: Option<IdMap>) -> Self {
        self.relations.insert(relation, target);
        self
    }

    pub fn get_value(&self, property: &str) -> Option<&Value> {
        self.values.get(property)
    }

    /// `None` if the relation was not captured, `Some(None)` if it was NULL.
    pub fn get_relation(&self, relation: &str) -> Option<Option<&IdMap>> {
        self.relations.get(relation).map(Option::as_ref)
    }
}

/// The execution-time record of one entity's pending insert, update or
/// remove.
#[derive(Debug)]
pub struct Subject {
    pub(crate) id: SubjectId,
    metadata: Arc<EntityMetadata>,
    entity: Box<dyn Entity>,
    pub(crate) entity_id: Option<IdMap>,
    pub(crate) newly_generated_id: Option<Value>,
    snapshot: Option<Snapshot>,
    pub(crate) diff_columns: Vec<&'static str>,
    pub(crate) diff_relations: Vec<&'static str>,
    explicit_diff: bool,
    pub(crate) tree_level: Option<i64>,
    pub(crate) date: Option<i64>,
    must_be_inserted: bool,
    must_be_updated: bool,
    must_be_removed: bool,
}

impl Subject {
    /// Create a subject with no operation scheduled.
    pub fn new(metadata: Arc<EntityMetadata>, entity: impl Entity + 'static) -> Self {
        Self {
            id: SubjectId::UNASSIGNED,
            metadata,
            entity: Box::new(entity),
            entity_id: None,
            newly_generated_id: None,
            snapshot: None,
            diff_columns: Vec::new(),
            diff_relations: Vec::new(),
            explicit_diff: false,
            tree_level: None,
            date: None,
            must_be_inserted: false,
            must_be_updated: false,
            must_be_removed: false,
        }
    }

    /// A subject to insert.
    pub fn for_insert(metadata: Arc<EntityMetadata>, entity: impl Entity + 'static) -> Self {
        Self::new(metadata, entity).schedule_insert()
    }

    /// A subject to update.
    pub fn for_update(metadata: Arc<EntityMetadata>, entity: impl Entity + 'static) -> Self {
        Self::new(metadata, entity).schedule_update()
    }

    /// A subject to remove.
    pub fn for_remove(metadata: Arc<EntityMetadata>, entity: impl Entity + 'static) -> Self {
        Self::new(metadata, entity).schedule_remove()
    }

    #[must_use]
    pub fn schedule_insert(mut self) -> Self {
        self.must_be_inserted = true;
        self
    }

    #[must_use]
    pub fn schedule_update(mut self) -> Self {
        self.must_be_updated = true;
        self
    }

    #[must_use]
    pub fn schedule_remove(mut self) -> Self {
        self.must_be_removed = true;
        self
    }

    /// Builder: the identity the entity already has in storage.
    #[must_use]
    pub fn with_id(mut self, ids: IdMap) -> Self {
        self.entity_id = Some(ids);
        self
    }

    /// Builder: the last persisted state, used to compute diffs.
    #[must_use]
    pub fn with_snapshot(mut self, snapshot: Snapshot) -> Self {
        self.snapshot = Some(snapshot);
        self
    }

    /// Builder: explicit changed columns, bypassing snapshot comparison.
    #[must_use]
    pub fn with_changed_columns(mut self, properties: &[&'static str]) -> Self {
        self.diff_columns = properties.to_vec();
        self.explicit_diff = true;
        self
    }

    /// Builder: explicit changed owning relations.
    #[must_use]
    pub fn with_changed_relations(mut self, relations: &[&'static str]) -> Self {
        self.diff_relations = relations.to_vec();
        self.explicit_diff = true;
        self
    }

    pub fn id(&self) -> SubjectId {
        self.id
    }

    pub fn metadata(&self) -> &Arc<EntityMetadata> {
        &self.metadata
    }

    pub fn entity(&self) -> &dyn Entity {
        self.entity.as_ref()
    }

    pub fn entity_mut(&mut self) -> &mut dyn Entity {
        self.entity.as_mut()
    }

    /// The identity the subject has in storage, once known.
    pub fn entity_id(&self) -> Option<&IdMap> {
        self.entity_id.as_ref()
    }

    /// The storage-assigned key returned by this subject's insert.
    pub fn newly_generated_id(&self) -> Option<&Value> {
        self.newly_generated_id.as_ref()
    }

    pub fn snapshot(&self) -> Option<&Snapshot> {
        self.snapshot.as_ref()
    }

    pub fn diff_columns(&self) -> &[&'static str] {
        &self.diff_columns
    }

    pub fn diff_relations(&self) -> &[&'static str] {
        &self.diff_relations
    }

    pub(crate) fn has_explicit_diff(&self) -> bool {
        self.explicit_diff
    }

    pub fn tree_level(&self) -> Option<i64> {
        self.tree_level
    }

    /// The batch timestamp written to date columns, in microseconds.
    pub fn date(&self) -> Option<i64> {
        self.date
    }

    pub fn must_be_inserted(&self) -> bool {
        self.must_be_inserted
    }

    pub fn must_be_updated(&self) -> bool {
        self.must_be_updated
    }

    pub fn must_be_removed(&self) -> bool {
        self.must_be_removed
    }

    /// Does the subject have anything to write in an UPDATE?
    pub fn has_changes(&self) -> bool {
        !self.diff_columns.is_empty() || !self.diff_relations.is_empty()
    }

    /// The identity as currently known: the recorded id map, else the
    /// primary properties carried by the entity.
    pub fn known_id(&self) -> Option<IdMap> {
        if let Some(ids) = &self.entity_id {
            return Some(ids.clone());
        }
        let primary = self.metadata.primary_columns();
        if primary.is_empty() {
            return None;
        }
        primary
            .into_iter()
            .map(|column| {
                self.entity
                    .value(column.property_name)
                    .and_then(Value::non_null)
                    .map(|value| (column.property_name, value))
            })
            .collect()
    }

    /// Human readable `Target#id` description for errors and logs.
    pub fn describe(&self) -> String {
        match self.known_id() {
            Some(ids) if ids.len() == 1 => {
                let value = ids.values().next().map_or(String::new(), describe_value);
                format!("{}#{}", self.metadata.target, value)
            }
            Some(ids) => format!("{}{:?}", self.metadata.target, ids),
            None => format!("{}{}", self.metadata.target, self.id),
        }
    }
}

fn describe_value(value: &Value) -> String {
    match value {
        Value::Text(s) | Value::Decimal(s) => s.clone(),
        other => other
            .as_i64()
            .map_or_else(|| format!("{other:?}"), |v| v.to_string()),
    }
}
