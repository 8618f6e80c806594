//! Dependency-ordered insert scheduling.
//!
//! Pending inserts form a graph whose edges are mandatory foreign keys to
//! other pending inserts (plus tree-parent links of entities that track
//! depth or keep a closure table). The graph is peeled level by level:
//! level 0 holds subjects with no pending dependency, level 1 those whose
//! dependencies are all in level 0, and so on. Whatever cannot be peeled is
//! a cycle and is reported before any statement runs.

use crate::collection::SubjectCollection;
use crate::entity::RelatedRef;
use crate::subject::{Subject, SubjectId};
use orm_persist_core::{Error, PersistErrorKind, RelationMetadata};
use std::collections::{BTreeMap, BTreeSet, HashSet};

/// Insert subjects grouped into dependency levels.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InsertSchedule {
    levels: Vec<Vec<SubjectId>>,
}

impl InsertSchedule {
    /// Build the schedule for the insert subjects of `subjects`.
    ///
    /// # Errors
    ///
    /// Returns a `DependencyCycle` error naming the subjects on the cycle.
    #[tracing::instrument(level = "debug", skip(subjects))]
    pub fn build(subjects: &SubjectCollection) -> Result<Self, Error> {
        let inserts: BTreeSet<SubjectId> = subjects.inserts().into_iter().collect();

        // subject -> subjects it waits for
        let mut dependencies: BTreeMap<SubjectId, BTreeSet<SubjectId>> = BTreeMap::new();
        for &id in &inserts {
            let deps = subjects
                .get(id)
                .map(|subject| insert_dependencies(subject, &inserts))
                .unwrap_or_default();
            dependencies.insert(id, deps);
        }

        let mut levels = Vec::new();
        let mut placed: HashSet<SubjectId> = HashSet::new();
        while placed.len() < inserts.len() {
            let ready: Vec<SubjectId> = dependencies
                .iter()
                .filter(|(id, deps)| {
                    !placed.contains(*id) && deps.iter().all(|dep| placed.contains(dep))
                })
                .map(|(id, _)| *id)
                .collect();

            if ready.is_empty() {
                let remaining: Vec<SubjectId> = inserts
                    .iter()
                    .copied()
                    .filter(|id| !placed.contains(id))
                    .collect();
                return Err(cycle_error(subjects, &dependencies, &remaining));
            }

            tracing::debug!(level = levels.len(), size = ready.len(), "Scheduled insert level");
            placed.extend(ready.iter().copied());
            levels.push(ready);
        }

        Ok(Self { levels })
    }

    /// Levels in execution order.
    pub fn levels(&self) -> &[Vec<SubjectId>] {
        &self.levels
    }

    /// The level `id` was placed in.
    pub fn level_of(&self, id: SubjectId) -> Option<usize> {
        self.levels.iter().position(|level| level.contains(&id))
    }

    pub fn len(&self) -> usize {
        self.levels.iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.levels.is_empty()
    }
}

/// Order the remove subjects so that an entity is deleted before any
/// removed entity its foreign keys point at.
///
/// Foreign keys between removed entities that loop back on themselves keep
/// the batch order for the entities involved.
pub fn removal_order(subjects: &SubjectCollection) -> Vec<SubjectId> {
    let removes: BTreeSet<SubjectId> = subjects.removes().into_iter().collect();

    // subject -> removed subjects it references
    let references: BTreeMap<SubjectId, BTreeSet<SubjectId>> = removes
        .iter()
        .map(|&id| {
            let refs = subjects
                .get(id)
                .map(|subject| remove_references(subjects, subject, &removes))
                .unwrap_or_default();
            (id, refs)
        })
        .collect();

    let mut order = Vec::with_capacity(removes.len());
    let mut placed: HashSet<SubjectId> = HashSet::new();
    while order.len() < removes.len() {
        let ready: Vec<SubjectId> = removes
            .iter()
            .copied()
            .filter(|id| {
                !placed.contains(id)
                    && !references
                        .iter()
                        .any(|(other, refs)| !placed.contains(other) && refs.contains(id))
            })
            .collect();

        if ready.is_empty() {
            tracing::debug!("Removed entities reference each other in a loop, keeping batch order");
            order.extend(removes.iter().copied().filter(|id| !placed.contains(id)));
            break;
        }
        placed.extend(ready.iter().copied());
        order.extend(ready);
    }
    order
}

fn remove_references(
    subjects: &SubjectCollection,
    subject: &Subject,
    removes: &BTreeSet<SubjectId>,
) -> BTreeSet<SubjectId> {
    let mut refs = BTreeSet::new();
    for (_, relation) in subject.metadata().relations_with_table() {
        if !relation.kind.is_owning() {
            continue;
        }
        let target = match subject.entity().related(relation.property_name).one() {
            Some(RelatedRef::Subject(target)) => Some(*target),
            Some(RelatedRef::Persisted(ids)) => subjects.find_by_identity(relation.target, ids),
            None => None,
        };
        if let Some(target) = target {
            if target != subject.id() && removes.contains(&target) {
                refs.insert(target);
            }
        }
    }
    refs
}

/// Does this relation force the related insert to run first?
pub(crate) fn is_insert_dependency(subject: &Subject, relation: &RelationMetadata) -> bool {
    if relation.tree_parent {
        let metadata = subject.metadata();
        if metadata.has_tree_level() || metadata.closure_table.is_some() {
            return true;
        }
    }
    relation.kind.is_owning() && !relation.nullable
}

fn insert_dependencies(subject: &Subject, inserts: &BTreeSet<SubjectId>) -> BTreeSet<SubjectId> {
    let mut deps = BTreeSet::new();
    for (_, relation) in subject.metadata().relations_with_table() {
        if !is_insert_dependency(subject, relation) {
            continue;
        }
        if let Some(RelatedRef::Subject(target)) = subject.entity().related(relation.property_name).one() {
            if *target != subject.id() && inserts.contains(target) {
                deps.insert(*target);
            }
        }
    }
    deps
}

fn cycle_error(
    subjects: &SubjectCollection,
    dependencies: &BTreeMap<SubjectId, BTreeSet<SubjectId>>,
    remaining: &[SubjectId],
) -> Error {
    let mut visited = HashSet::new();
    let mut rec_stack = HashSet::new();
    let mut path = Vec::new();

    let found = remaining.iter().any(|start| {
        !visited.contains(start)
            && detect_cycle_dfs(*start, dependencies, &mut visited, &mut rec_stack, &mut path)
    });
    if !found {
        path = remaining.to_vec();
    } else if let Some(&closing) = path.last() {
        // drop the prefix leading into the cycle
        if let Some(start) = path.iter().position(|id| *id == closing) {
            path.drain(..start);
        }
    }

    let names: Vec<String> = path
        .iter()
        .map(|id| subjects.get(*id).map_or_else(|| id.to_string(), Subject::describe))
        .collect();
    tracing::debug!(cycle = ?names, "Dependency cycle between pending inserts");
    Error::persist(
        PersistErrorKind::DependencyCycle,
        format!(
            "mandatory foreign keys form a cycle between pending inserts: {}",
            names.join(" -> ")
        ),
    )
}

fn detect_cycle_dfs(
    node: SubjectId,
    dependencies: &BTreeMap<SubjectId, BTreeSet<SubjectId>>,
    visited: &mut HashSet<SubjectId>,
    rec_stack: &mut HashSet<SubjectId>,
    path: &mut Vec<SubjectId>,
) -> bool {
    visited.insert(node);
    rec_stack.insert(node);
    path.push(node);

    if let Some(deps) = dependencies.get(&node) {
        for dep in deps {
            if !visited.contains(dep) {
                if detect_cycle_dfs(*dep, dependencies, visited, rec_stack, path) {
                    return true;
                }
            } else if rec_stack.contains(dep) {
                path.push(*dep);
                return true;
            }
        }
    }

    rec_stack.remove(&node);
    path.pop();
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{DynamicEntity, Related};
    use orm_persist_core::{ColumnMetadata, ColumnRole, EntityMetadata, JoinColumn};
    use std::sync::Arc;

    fn team_meta() -> Arc<EntityMetadata> {
        Arc::new(
            EntityMetadata::new("Team", "teams")
                .column(ColumnMetadata::new("id", "id").primary().generated())
                .column(ColumnMetadata::new("name", "name")),
        )
    }

    fn hero_meta(required: bool) -> Arc<EntityMetadata> {
        let team = RelationMetadata::many_to_one("team", "Team", JoinColumn::new("team_id", "id"));
        Arc::new(
            EntityMetadata::new("Hero", "heroes")
                .column(ColumnMetadata::new("id", "id").primary().generated())
                .relation(if required { team.required() } else { team }),
        )
    }

    fn mission_meta() -> Arc<EntityMetadata> {
        Arc::new(
            EntityMetadata::new("Mission", "missions")
                .column(ColumnMetadata::new("id", "id").primary().generated())
                .relation(
                    RelationMetadata::many_to_one("hero", "Hero", JoinColumn::new("hero_id", "id"))
                        .required(),
                ),
        )
    }

    fn linked(relation: &str, target: SubjectId) -> DynamicEntity {
        DynamicEntity::new().with_related(relation, Related::One(target.into()))
    }

    #[test]
    fn test_independent_inserts_share_level_zero() {
        let mut subjects = SubjectCollection::new();
        let a = subjects.push(Subject::for_insert(team_meta(), DynamicEntity::new()));
        let b = subjects.push(Subject::for_insert(team_meta(), DynamicEntity::new()));
        let schedule = InsertSchedule::build(&subjects).unwrap();
        assert_eq!(schedule.levels(), &[vec![a, b]]);
        assert_eq!(schedule.len(), 2);
    }

    #[test]
    fn test_mandatory_fk_goes_to_second_level() {
        let mut subjects = SubjectCollection::new();
        let hero_id = subjects.next_id();
        let team_id = SubjectId::new(hero_id.index() + 1);
        subjects.push(Subject::for_insert(hero_meta(true), linked("team", team_id)));
        subjects.push(Subject::for_insert(team_meta(), DynamicEntity::new()));

        let schedule = InsertSchedule::build(&subjects).unwrap();
        assert_eq!(schedule.levels(), &[vec![team_id], vec![hero_id]]);
        assert_eq!(schedule.level_of(hero_id), Some(1));
    }

    #[test]
    fn test_nullable_fk_does_not_order() {
        let mut subjects = SubjectCollection::new();
        let team_id = SubjectId::new(1);
        let hero_id = subjects.push(Subject::for_insert(hero_meta(false), linked("team", team_id)));
        subjects.push(Subject::for_insert(team_meta(), DynamicEntity::new()));

        let schedule = InsertSchedule::build(&subjects).unwrap();
        assert_eq!(schedule.levels().len(), 1);
        assert_eq!(schedule.level_of(hero_id), Some(0));
    }

    #[test]
    fn test_multi_level_chain() {
        let mut subjects = SubjectCollection::new();
        let mission = subjects.push(Subject::for_insert(mission_meta(), linked("hero", SubjectId::new(1))));
        let hero = subjects.push(Subject::for_insert(hero_meta(true), linked("team", SubjectId::new(2))));
        let team = subjects.push(Subject::for_insert(team_meta(), DynamicEntity::new()));

        let schedule = InsertSchedule::build(&subjects).unwrap();
        assert_eq!(schedule.levels(), &[vec![team], vec![hero], vec![mission]]);
    }

    #[test]
    fn test_dependency_on_non_insert_is_ignored() {
        let mut subjects = SubjectCollection::new();
        let team = subjects.push(Subject::for_update(team_meta(), DynamicEntity::new().with("id", 1_i64)));
        let hero = subjects.push(Subject::for_insert(hero_meta(true), linked("team", team)));
        let schedule = InsertSchedule::build(&subjects).unwrap();
        assert_eq!(schedule.levels(), &[vec![hero]]);
    }

    #[test]
    fn test_cycle_is_reported() {
        let node = Arc::new(
            EntityMetadata::new("Node", "nodes")
                .column(ColumnMetadata::new("id", "id").primary().generated())
                .relation(
                    RelationMetadata::many_to_one("next", "Node", JoinColumn::new("next_id", "id"))
                        .required(),
                ),
        );
        let mut subjects = SubjectCollection::new();
        subjects.push(Subject::for_insert(Arc::clone(&node), linked("next", SubjectId::new(1))));
        subjects.push(Subject::for_insert(Arc::clone(&node), linked("next", SubjectId::new(0))));
        subjects.push(Subject::for_insert(team_meta(), DynamicEntity::new()));

        let err = InsertSchedule::build(&subjects).unwrap_err();
        assert_eq!(err.persist_kind(), Some(PersistErrorKind::DependencyCycle));
        assert!(err.to_string().contains("Node#0 -> Node#1 -> Node#0"));
    }

    #[test]
    fn test_tree_parent_orders_inserts() {
        let category = Arc::new(
            EntityMetadata::new("Category", "categories")
                .column(ColumnMetadata::new("id", "id").primary().generated())
                .column(ColumnMetadata::new("level", "level").role(ColumnRole::TreeLevel))
                .relation(
                    RelationMetadata::many_to_one("parent", "Category", JoinColumn::new("parent_id", "id"))
                        .tree_parent(),
                ),
        );
        let mut subjects = SubjectCollection::new();
        let child = subjects.push(Subject::for_insert(Arc::clone(&category), linked("parent", SubjectId::new(1))));
        let root = subjects.push(Subject::for_insert(category, DynamicEntity::new()));

        let schedule = InsertSchedule::build(&subjects).unwrap();
        assert_eq!(schedule.levels(), &[vec![root], vec![child]]);
    }

    #[test]
    fn test_removal_order_deletes_referencing_rows_first() {
        let mut subjects = SubjectCollection::new();
        let team = subjects.push(Subject::for_remove(team_meta(), DynamicEntity::new().with("id", 1_i64)));
        let hero = subjects.push(Subject::for_remove(
            hero_meta(false),
            DynamicEntity::new()
                .with("id", 2_i64)
                .with_related("team", Related::One(RelatedRef::persisted("id", 1_i64))),
        ));
        let mission = subjects.push(Subject::for_remove(
            mission_meta(),
            DynamicEntity::new().with("id", 3_i64).with_related("hero", Related::One(hero.into())),
        ));

        assert_eq!(removal_order(&subjects), vec![mission, hero, team]);
    }
}
