//! Relation fix-up updates.
//!
//! A fix-up rewrites foreign key columns after the inserts of a batch have
//! run: nullable keys that were inserted as NULL, the far side of inverse
//! relations of freshly inserted entities, and relation changes requested
//! by the caller. Which table and which columns are touched depends only
//! on the relation kind, so every kind maps to one handler in
//! [`FIX_UP_HANDLERS`].

use crate::collection::SubjectCollection;
use crate::entity::RelatedRef;
use crate::operations::RelationAction;
use crate::values::{self, BatchState, Lookup};
use orm_persist_core::{
    ColumnValues, EntityMetadata, Error, MetadataProvider, PersistError, PersistErrorKind,
    RelationKind, RelationMetadata, Value,
};
use std::sync::Arc;

/// One UPDATE produced by a fix-up.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct FixUp {
    pub table: &'static str,
    pub values: ColumnValues,
    pub conditions: ColumnValues,
}

/// Everything a handler may read.
pub(crate) struct FixUpContext<'a> {
    pub subjects: &'a SubjectCollection,
    pub state: &'a BatchState,
    pub provider: &'a dyn MetadataProvider,
}

/// A relation change to turn into foreign key writes.
pub(crate) struct FixUpRequest<'a> {
    pub owner_metadata: &'a EntityMetadata,
    pub owner: &'a RelatedRef,
    pub relation: &'a RelationMetadata,
    pub related: Option<&'a RelatedRef>,
    pub action: RelationAction,
}

type FixUpHandler = fn(&FixUpContext<'_>, &FixUpRequest<'_>) -> Result<FixUp, Error>;

/// Handlers indexed by [`RelationKind::index`].
const FIX_UP_HANDLERS: [FixUpHandler; 5] = [
    fix_inverse_side,         // OneToMany
    fix_owner_side,           // ManyToOne
    fix_owner_side,           // OneToOneOwner
    fix_inverse_side,         // OneToOneNotOwner
    reject_junction_relation, // ManyToMany
];

/// Build the UPDATE a relation change needs.
pub(crate) fn fix_up(ctx: &FixUpContext<'_>, request: &FixUpRequest<'_>) -> Result<FixUp, Error> {
    let handler = FIX_UP_HANDLERS[request.relation.kind.index()];
    handler(ctx, request)
}

/// The foreign key lives on the owner's table.
fn fix_owner_side(ctx: &FixUpContext<'_>, request: &FixUpRequest<'_>) -> Result<FixUp, Error> {
    let relation = request.relation;
    let table = request
        .owner_metadata
        .table_for_relation(relation.property_name)
        .ok_or_else(|| unknown_relation(request))?;
    let owner_ids = values::resolve_identity(
        ctx.subjects,
        ctx.state,
        request.owner,
        request.owner_metadata,
    )
    .ok_or_else(|| unresolved(ctx, request.owner, relation))?;
    let conditions = table
        .key_conditions(&owner_ids)
        .ok_or_else(|| unresolved(ctx, request.owner, relation))?;

    let values = match (request.action, request.related) {
        (RelationAction::Set, Some(related)) => values::resolve_join_columns(
            ctx.subjects,
            ctx.state,
            related,
            &relation.join_columns,
            Lookup::Settled,
        )
        .ok_or_else(|| unresolved(ctx, related, relation))?,
        (RelationAction::Set, None) => return Err(missing_related(relation)),
        (RelationAction::Clear, _) => {
            null_columns(relation.join_columns.iter().map(|jc| jc.column_name))
        }
    };

    Ok(FixUp {
        table: table.table_name,
        values,
        conditions,
    })
}

/// The foreign key lives on the related entity's table and points back at
/// the owner.
fn fix_inverse_side(ctx: &FixUpContext<'_>, request: &FixUpRequest<'_>) -> Result<FixUp, Error> {
    let relation = request.relation;
    let related = request.related.ok_or_else(|| missing_related(relation))?;
    let target = target_metadata(ctx, related, relation.target)?;
    let target_ids = values::resolve_identity(ctx.subjects, ctx.state, related, &target)
        .ok_or_else(|| unresolved(ctx, related, relation))?;
    let conditions = target
        .key_conditions(&target_ids)
        .ok_or_else(|| unresolved(ctx, related, relation))?;

    let values = match request.action {
        RelationAction::Set => relation
            .inverse_join_columns
            .iter()
            .map(|jc| {
                values::resolve_property(
                    ctx.subjects,
                    ctx.state,
                    request.owner,
                    jc.referenced_property,
                    Lookup::Settled,
                )
                .map(|value| (jc.column_name, value))
            })
            .collect::<Option<ColumnValues>>()
            .ok_or_else(|| unresolved(ctx, request.owner, relation))?,
        RelationAction::Clear => {
            null_columns(relation.inverse_join_columns.iter().map(|jc| jc.column_name))
        }
    };

    Ok(FixUp {
        table: target.table_name,
        values,
        conditions,
    })
}

fn reject_junction_relation(
    _ctx: &FixUpContext<'_>,
    request: &FixUpRequest<'_>,
) -> Result<FixUp, Error> {
    Err(PersistError::new(
        PersistErrorKind::InvalidRelation,
        format!(
            "relation '{}' is many-to-many; use junction operations",
            request.relation.property_name
        ),
    )
    .into())
}

/// Metadata of the entity behind `reference`.
pub(crate) fn target_metadata(
    ctx: &FixUpContext<'_>,
    reference: &RelatedRef,
    target: &str,
) -> Result<Arc<EntityMetadata>, Error> {
    match reference {
        RelatedRef::Subject(id) => ctx
            .subjects
            .get(*id)
            .map(|subject| Arc::clone(subject.metadata()))
            .ok_or_else(|| {
                Error::persist(
                    PersistErrorKind::InvalidRelation,
                    format!("unknown subject {id}"),
                )
            }),
        RelatedRef::Persisted(_) => ctx.provider.find(target).ok_or_else(|| {
            Error::persist(
                PersistErrorKind::MissingMetadata,
                format!("no metadata registered for '{target}'"),
            )
        }),
    }
}

/// Merge fix-ups addressing the same row of the same table. A later write
/// to a column replaces an earlier one.
pub(crate) fn merge(fix_ups: Vec<FixUp>) -> Vec<FixUp> {
    let mut merged: Vec<FixUp> = Vec::new();
    for fix_up in fix_ups {
        let existing = merged.iter_mut().find(|m| {
            m.table == fix_up.table
                && m.conditions.len() == fix_up.conditions.len()
                && m.conditions
                    .iter()
                    .zip(&fix_up.conditions)
                    .all(|((c1, v1), (c2, v2))| c1 == c2 && values::same_value(v1, v2))
        });
        let Some(existing) = existing else {
            merged.push(fix_up);
            continue;
        };
        for (column, value) in fix_up.values {
            match existing.values.iter_mut().find(|(c, _)| *c == column) {
                Some(slot) => slot.1 = value,
                None => existing.values.push((column, value)),
            }
        }
    }
    merged
}

fn null_columns(columns: impl Iterator<Item = &'static str>) -> ColumnValues {
    columns.map(|column| (column, Value::Null)).collect()
}

fn unknown_relation(request: &FixUpRequest<'_>) -> Error {
    Error::persist(
        PersistErrorKind::InvalidRelation,
        format!(
            "'{}' has no relation '{}'",
            request.owner_metadata.target, request.relation.property_name
        ),
    )
}

fn missing_related(relation: &RelationMetadata) -> Error {
    Error::persist(
        PersistErrorKind::InvalidRelation,
        format!(
            "relation '{}' update needs the related entity",
            relation.property_name
        ),
    )
}

fn unresolved(ctx: &FixUpContext<'_>, reference: &RelatedRef, relation: &RelationMetadata) -> Error {
    PersistError::new(
        PersistErrorKind::MissingIdentity,
        format!(
            "cannot update relation '{}': entity has no identity",
            relation.property_name
        ),
    )
    .entity(values::describe_ref(ctx.subjects, reference))
    .into()
}

/// Fix-up kinds handled per relation kind, for logging.
pub(crate) fn describe_kind(kind: RelationKind) -> &'static str {
    if kind.is_owning() {
        "owner-side"
    } else if kind.is_inverse() {
        "inverse-side"
    } else {
        "junction"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{DynamicEntity, Related};
    use crate::subject::Subject;
    use orm_persist_core::{ColumnMetadata, JoinColumn, MetadataRegistry};

    fn registry() -> MetadataRegistry {
        let mut registry = MetadataRegistry::new();
        registry.register(
            EntityMetadata::new("Team", "teams")
                .column(ColumnMetadata::new("id", "id").primary().generated())
                .relation(RelationMetadata::one_to_many(
                    "heroes",
                    "Hero",
                    JoinColumn::new("team_id", "id"),
                )),
        );
        registry.register(
            EntityMetadata::new("Hero", "heroes")
                .column(ColumnMetadata::new("id", "id").primary().generated())
                .relation(RelationMetadata::many_to_one(
                    "team",
                    "Team",
                    JoinColumn::new("team_id", "id"),
                )),
        );
        registry
    }

    #[allow(clippy::too_many_arguments)]
    fn run(
        subjects: &SubjectCollection,
        state: &BatchState,
        registry: &MetadataRegistry,
        owner_target: &str,
        owner: &RelatedRef,
        relation: &str,
        related: Option<&RelatedRef>,
        action: RelationAction,
    ) -> Result<FixUp, Error> {
        let owner_metadata = registry.find(owner_target).unwrap();
        let relation = owner_metadata.find_relation(relation).unwrap();
        let ctx = FixUpContext {
            subjects,
            state,
            provider: registry,
        };
        fix_up(
            &ctx,
            &FixUpRequest {
                owner_metadata: &owner_metadata,
                owner,
                relation,
                related,
                action,
            },
        )
    }

    #[test]
    fn test_owner_side_set_and_clear() {
        let registry = registry();
        let subjects = SubjectCollection::new();
        let state = BatchState::new(0);
        let hero = RelatedRef::persisted("id", 1_i64);
        let team = RelatedRef::persisted("id", 2_i64);

        let set = run(&subjects, &state, &registry, "Hero", &hero, "team", Some(&team), RelationAction::Set)
            .unwrap();
        assert_eq!(set.table, "heroes");
        assert_eq!(set.values, vec![("team_id", Value::BigInt(2))]);
        assert_eq!(set.conditions, vec![("id", Value::BigInt(1))]);

        let clear = run(&subjects, &state, &registry, "Hero", &hero, "team", None, RelationAction::Clear)
            .unwrap();
        assert_eq!(clear.values, vec![("team_id", Value::Null)]);
    }

    #[test]
    fn test_inverse_side_points_related_at_owner() {
        let registry = registry();
        let mut subjects = SubjectCollection::new();
        let team = subjects.push(Subject::for_insert(
            registry.find("Team").unwrap(),
            DynamicEntity::new(),
        ));
        let mut state = BatchState::new(0);
        state
            .inserted
            .insert(team, [("id", Value::BigInt(10))].into_iter().collect());
        let hero = RelatedRef::persisted("id", 3_i64);

        let fix = run(
            &subjects,
            &state,
            &registry,
            "Team",
            &RelatedRef::Subject(team),
            "heroes",
            Some(&hero),
            RelationAction::Set,
        )
        .unwrap();
        assert_eq!(fix.table, "heroes");
        assert_eq!(fix.values, vec![("team_id", Value::BigInt(10))]);
        assert_eq!(fix.conditions, vec![("id", Value::BigInt(3))]);
    }

    #[test]
    fn test_unresolved_owner_is_missing_identity() {
        let registry = registry();
        let mut subjects = SubjectCollection::new();
        let hero = subjects.push(Subject::for_insert(
            registry.find("Hero").unwrap(),
            DynamicEntity::new().with_related("team", Related::Null),
        ));
        let state = BatchState::new(0);
        let err = run(
            &subjects,
            &state,
            &registry,
            "Hero",
            &RelatedRef::Subject(hero),
            "team",
            Some(&RelatedRef::persisted("id", 1_i64)),
            RelationAction::Set,
        )
        .unwrap_err();
        assert_eq!(err.persist_kind(), Some(PersistErrorKind::MissingIdentity));
    }

    #[test]
    fn test_merge_last_write_wins() {
        let row = vec![("id", Value::BigInt(1))];
        let merged = merge(vec![
            FixUp {
                table: "heroes",
                values: vec![("team_id", Value::BigInt(1))],
                conditions: row.clone(),
            },
            FixUp {
                table: "heroes",
                values: vec![("team_id", Value::BigInt(2)), ("mentor_id", Value::Null)],
                conditions: vec![("id", Value::Int(1))],
            },
            FixUp {
                table: "teams",
                values: vec![("captain_id", Value::Null)],
                conditions: row,
            },
        ]);
        assert_eq!(merged.len(), 2);
        assert_eq!(
            merged[0].values,
            vec![("team_id", Value::BigInt(2)), ("mentor_id", Value::Null)]
        );
    }

    #[test]
    fn test_merge_keeps_rows_with_distinct_text_keys() {
        let merged = merge(vec![
            FixUp {
                table: "agents",
                values: vec![("team_id", Value::BigInt(1))],
                conditions: vec![("code", Value::Text("007".into()))],
            },
            FixUp {
                table: "agents",
                values: vec![("team_id", Value::BigInt(2))],
                conditions: vec![("code", Value::Text("7".into()))],
            },
        ]);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].values, vec![("team_id", Value::BigInt(1))]);
        assert_eq!(merged[1].values, vec![("team_id", Value::BigInt(2))]);
    }

    #[test]
    fn test_handler_table_matches_kinds() {
        assert_eq!(FIX_UP_HANDLERS.len(), RelationKind::ALL.len());
        assert_eq!(describe_kind(RelationKind::ManyToOne), "owner-side");
        assert_eq!(describe_kind(RelationKind::OneToMany), "inverse-side");
        assert_eq!(describe_kind(RelationKind::ManyToMany), "junction");
    }
}
