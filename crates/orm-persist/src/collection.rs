//! The set of subjects taking part in one persist operation.

use crate::entity::{Related, RelatedRef};
use crate::subject::{Subject, SubjectId};
use crate::values;
use orm_persist_core::IdMap;

/// All subjects discovered for one top-level save or remove.
///
/// Subjects are addressed by the [`SubjectId`] handed out by [`push`];
/// relations between entities of the batch use these handles instead of
/// object identity.
///
/// [`push`]: SubjectCollection::push
#[derive(Debug, Default)]
pub struct SubjectCollection {
    subjects: Vec<Subject>,
}

impl SubjectCollection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a subject and return its stable handle.
    pub fn push(&mut self, mut subject: Subject) -> SubjectId {
        let id = self.next_id();
        subject.id = id;
        self.subjects.push(subject);
        id
    }

    /// The handle the next [`push`](Self::push) will return. Lets callers
    /// wire references between subjects before adding them.
    pub fn next_id(&self) -> SubjectId {
        SubjectId::new(self.subjects.len())
    }

    pub fn get(&self, id: SubjectId) -> Option<&Subject> {
        self.subjects.get(id.index())
    }

    pub fn get_mut(&mut self, id: SubjectId) -> Option<&mut Subject> {
        self.subjects.get_mut(id.index())
    }

    pub fn len(&self) -> usize {
        self.subjects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subjects.is_empty()
    }

    /// Subjects in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &Subject> {
        self.subjects.iter()
    }

    pub fn ids(&self) -> impl Iterator<Item = SubjectId> + '_ {
        self.subjects.iter().map(Subject::id)
    }

    /// Find the subject for `target` with identity `ids`.
    pub fn find_by_identity(&self, target: &str, ids: &IdMap) -> Option<SubjectId> {
        self.subjects
            .iter()
            .find(|s| s.metadata().target == target && s.known_id().as_ref() == Some(ids))
            .map(Subject::id)
    }

    pub fn inserts(&self) -> Vec<SubjectId> {
        self.filter_ids(Subject::must_be_inserted)
    }

    pub fn updates(&self) -> Vec<SubjectId> {
        self.filter_ids(Subject::must_be_updated)
    }

    pub fn removes(&self) -> Vec<SubjectId> {
        self.filter_ids(Subject::must_be_removed)
    }

    fn filter_ids(&self, pred: impl Fn(&Subject) -> bool) -> Vec<SubjectId> {
        self.subjects
            .iter()
            .filter(|s| pred(s))
            .map(Subject::id)
            .collect()
    }

    /// The identity `reference` resolves to right now, if any.
    pub fn resolve_ref(&self, reference: &RelatedRef) -> Option<IdMap> {
        match reference {
            RelatedRef::Persisted(ids) => Some(ids.clone()),
            RelatedRef::Subject(id) => self.get(*id).and_then(Subject::known_id),
        }
    }

    /// Compute `diff_columns` / `diff_relations` for every update subject
    /// that did not receive explicit diffs.
    ///
    /// With a snapshot, a column is changed when the entity carries a value
    /// different from the snapshot's. Without one, every updatable column
    /// the entity carries counts as changed.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn compute_diffs(&mut self) {
        let mut computed = Vec::new();
        for subject in &self.subjects {
            if !subject.must_be_updated() || subject.has_explicit_diff() {
                continue;
            }
            let columns = self.changed_columns(subject);
            let relations = self.changed_relations(subject);
            tracing::trace!(
                subject = %subject.describe(),
                columns = columns.len(),
                relations = relations.len(),
                "Computed subject diff"
            );
            computed.push((subject.id(), columns, relations));
        }

        for (id, columns, relations) in computed {
            if let Some(subject) = self.get_mut(id) {
                subject.diff_columns = columns;
                subject.diff_relations = relations;
            }
        }
    }

    fn changed_columns(&self, subject: &Subject) -> Vec<&'static str> {
        let entity = subject.entity();
        let mut changed = Vec::new();
        for table in subject.metadata().tables() {
            for column in table.columns.iter().filter(|c| c.is_updatable()) {
                let Some(current) = entity.value(column.property_name) else {
                    continue;
                };
                let differs = match subject.snapshot() {
                    Some(snapshot) => !snapshot
                        .get_value(column.property_name)
                        .is_some_and(|previous| values::same_value(previous, &current)),
                    None => true,
                };
                if differs {
                    changed.push(column.property_name);
                }
            }
        }
        changed
    }

    fn changed_relations(&self, subject: &Subject) -> Vec<&'static str> {
        let entity = subject.entity();
        let mut changed = Vec::new();
        for (_, relation) in subject.metadata().relations_with_table() {
            if !relation.kind.is_owning() {
                continue;
            }
            let current = entity.related(relation.property_name);
            let current_ids = match &current {
                Related::Unset | Related::Many(_) => continue,
                Related::Null => None,
                Related::One(reference) => match self.resolve_ref(reference) {
                    Some(ids) => Some(ids),
                    None => {
                        // target not stored yet, so it cannot match the snapshot
                        changed.push(relation.property_name);
                        continue;
                    }
                },
            };
            let differs = match subject.snapshot() {
                Some(snapshot) => match snapshot.get_relation(relation.property_name) {
                    Some(previous) => !same_identity(previous, current_ids.as_ref()),
                    None => true,
                },
                None => true,
            };
            if differs {
                changed.push(relation.property_name);
            }
        }
        changed
    }
}

/// Compare identities, treating integer keys of different widths as equal.
fn same_identity(a: Option<&IdMap>, b: Option<&IdMap>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(a), Some(b)) => {
            a.len() == b.len()
                && a.iter().all(|(k, v)| b.get(k).is_some_and(|w| values::same_value(v, w)))
        }
        _ => false,
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::DynamicEntity;
    use crate::subject::Snapshot;
    use orm_persist_core::{
        ColumnMetadata, ColumnRole, EntityMetadata, JoinColumn, RelationMetadata, Value,
    };
    use std::sync::Arc;

    fn hero_meta() -> Arc<EntityMetadata> {
        Arc::new(
            EntityMetadata::new("Hero", "heroes")
                .column(ColumnMetadata::new("id", "id").primary().generated())
                .column(ColumnMetadata::new("name", "name"))
                .column(ColumnMetadata::new("age", "age").nullable())
                .column(ColumnMetadata::new("updatedAt", "updated_at").role(ColumnRole::UpdateDate))
                .relation(RelationMetadata::many_to_one(
                    "team",
                    "Team",
                    JoinColumn::new("team_id", "id"),
                )),
        )
    }

    fn team_ref(id: i64) -> Related {
        Related::One(RelatedRef::persisted("id", id))
    }

    #[test]
    fn test_push_assigns_sequential_ids() {
        let mut subjects = SubjectCollection::new();
        assert_eq!(subjects.next_id().index(), 0);
        let a = subjects.push(Subject::for_insert(hero_meta(), DynamicEntity::new()));
        let b = subjects.push(Subject::for_remove(hero_meta(), DynamicEntity::new()));
        assert_eq!(a.index(), 0);
        assert_eq!(b.index(), 1);
        assert_eq!(subjects.get(b).map(Subject::id), Some(b));
        assert_eq!(subjects.inserts(), vec![a]);
        assert_eq!(subjects.removes(), vec![b]);
        assert!(subjects.updates().is_empty());
    }

    #[test]
    fn test_find_by_identity() {
        let mut subjects = SubjectCollection::new();
        let id = subjects.push(Subject::for_update(
            hero_meta(),
            DynamicEntity::new().with("id", 5_i64),
        ));
        let mut ids = IdMap::new();
        ids.insert("id", Value::BigInt(5));
        assert_eq!(subjects.find_by_identity("Hero", &ids), Some(id));
        assert_eq!(subjects.find_by_identity("Team", &ids), None);
    }

    #[test]
    fn test_diff_without_snapshot_marks_present_columns() {
        let mut subjects = SubjectCollection::new();
        let id = subjects.push(Subject::for_update(
            hero_meta(),
            DynamicEntity::new()
                .with("id", 1_i64)
                .with("name", "Dr. Weird")
                .with("updatedAt", Value::Timestamp(0)),
        ));
        subjects.compute_diffs();
        let subject = subjects.get(id).unwrap();
        assert_eq!(subject.diff_columns(), &["name"]);
        assert!(subject.diff_relations().is_empty());
    }

    #[test]
    fn test_diff_with_snapshot_only_changed() {
        let mut subjects = SubjectCollection::new();
        let id = subjects.push(
            Subject::for_update(
                hero_meta(),
                DynamicEntity::new()
                    .with("id", 1_i64)
                    .with("name", "Dr. Weird")
                    .with("age", 37_i64)
                    .with_related("team", team_ref(2)),
            )
            .with_snapshot(
                Snapshot::new()
                    .value("name", "Dr. Weird")
                    .value("age", 36_i64)
                    .relation("team", Some(IdMap::from([("id", Value::Int(2))]))),
            ),
        );
        subjects.compute_diffs();
        let subject = subjects.get(id).unwrap();
        assert_eq!(subject.diff_columns(), &["age"]);
        assert!(subject.diff_relations().is_empty());
    }

    #[test]
    fn test_diff_ignores_integer_width() {
        let mut subjects = SubjectCollection::new();
        let id = subjects.push(
            Subject::for_update(
                hero_meta(),
                DynamicEntity::new()
                    .with("id", 1_i64)
                    .with("name", "Dr. Weird")
                    .with("age", 36_i64),
            )
            .with_snapshot(
                Snapshot::new()
                    .value("name", "Dr. Weird")
                    .value("age", Value::Int(36)),
            ),
        );
        subjects.compute_diffs();
        assert!(subjects.get(id).unwrap().diff_columns().is_empty());
    }

    #[test]
    fn test_diff_relation_cleared() {
        let mut subjects = SubjectCollection::new();
        let id = subjects.push(
            Subject::for_update(
                hero_meta(),
                DynamicEntity::new()
                    .with("id", 1_i64)
                    .with_related("team", Related::Null),
            )
            .with_snapshot(Snapshot::new().relation("team", Some(IdMap::new()))),
        );
        subjects.compute_diffs();
        assert_eq!(subjects.get(id).unwrap().diff_relations(), &["team"]);
    }

    #[test]
    fn test_explicit_diff_is_kept() {
        let mut subjects = SubjectCollection::new();
        let id = subjects.push(
            Subject::for_update(
                hero_meta(),
                DynamicEntity::new().with("id", 1_i64).with("name", "x").with("age", 1_i64),
            )
            .with_changed_columns(&["age"]),
        );
        subjects.compute_diffs();
        assert_eq!(subjects.get(id).unwrap().diff_columns(), &["age"]);
    }

    #[test]
    fn test_same_identity_is_numeric() {
        let mut a = IdMap::new();
        a.insert("id", Value::Int(3));
        let mut b = IdMap::new();
        b.insert("id", Value::BigInt(3));
        assert!(same_identity(Some(&a), Some(&b)));
        assert!(!same_identity(Some(&a), None));
        assert!(same_identity(None, None));
    }
}
