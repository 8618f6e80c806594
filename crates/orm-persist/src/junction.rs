//! Junction (many-to-many link table) rows.

use crate::collection::SubjectCollection;
use crate::entity::RelatedRef;
use crate::operations::JunctionOperation;
use crate::values::{self, BatchState, Lookup};
use orm_persist_core::{ColumnValues, Error, JoinColumn, PersistError, PersistErrorKind};

/// Whether a junction row is being linked or unlinked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum JunctionMode {
    Insert,
    Remove,
}

/// Resolve the table and column values of the link row for `op`.
///
/// Values are laid out in the junction's declared order: owner-side
/// columns first, then inverse-side columns. An operation coming from the
/// inverse side of the relation is flipped to match.
pub(crate) fn junction_row(
    subjects: &SubjectCollection,
    state: &BatchState,
    op: &JunctionOperation,
    mode: JunctionMode,
) -> Result<(&'static str, ColumnValues), Error> {
    let junction = op.junction().ok_or_else(|| {
        Error::persist(
            PersistErrorKind::InvalidRelation,
            format!(
                "relation '{}' has no junction table",
                op.relation.property_name
            ),
        )
    })?;

    let (owner_columns, related_columns) = if op.relation.junction_owner {
        (&junction.owner.columns, &junction.inverse.columns)
    } else {
        (&junction.inverse.columns, &junction.owner.columns)
    };
    let owner = endpoint(subjects, state, &op.owner, owner_columns, mode)?;
    let related = endpoint(subjects, state, &op.related, related_columns, mode)?;

    let mut row = ColumnValues::with_capacity(owner.len() + related.len());
    if op.relation.junction_owner {
        row.extend(owner);
        row.extend(related);
    } else {
        row.extend(related);
        row.extend(owner);
    }
    Ok((junction.table_name, row))
}

fn endpoint(
    subjects: &SubjectCollection,
    state: &BatchState,
    reference: &RelatedRef,
    columns: &[JoinColumn],
    mode: JunctionMode,
) -> Result<ColumnValues, Error> {
    values::resolve_join_columns(subjects, state, reference, columns, Lookup::Settled).ok_or_else(
        || {
            let entity = values::describe_ref(subjects, reference);
            match mode {
                JunctionMode::Insert => PersistError::new(
                    PersistErrorKind::EntityNotPersisted,
                    "cannot link an entity that is not persisted",
                )
                .entity(entity)
                .into(),
                JunctionMode::Remove => PersistError::new(
                    PersistErrorKind::MissingIdentity,
                    "cannot unlink an entity without a known identity",
                )
                .entity(entity)
                .into(),
            }
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::DynamicEntity;
    use crate::subject::Subject;
    use orm_persist_core::{
        ColumnMetadata, EntityMetadata, JunctionMetadata, RelationMetadata, Value,
    };
    use std::sync::Arc;

    fn hero_powers() -> JunctionMetadata {
        JunctionMetadata::new(
            "hero_powers",
            ("Hero", JoinColumn::new("hero_id", "id")),
            ("Power", JoinColumn::new("power_id", "id")),
        )
    }

    fn power_meta() -> Arc<EntityMetadata> {
        Arc::new(
            EntityMetadata::new("Power", "powers")
                .column(ColumnMetadata::new("id", "id").primary().generated()),
        )
    }

    #[test]
    fn test_owner_side_order() {
        let relation = RelationMetadata::many_to_many("powers", "Power", hero_powers());
        let op = JunctionOperation::new(
            &relation,
            RelatedRef::persisted("id", 1_i64),
            RelatedRef::persisted("id", 2_i64),
        )
        .unwrap();
        let (table, row) = junction_row(
            &SubjectCollection::new(),
            &BatchState::new(0),
            &op,
            JunctionMode::Insert,
        )
        .unwrap();
        assert_eq!(table, "hero_powers");
        assert_eq!(
            row,
            vec![("hero_id", Value::BigInt(1)), ("power_id", Value::BigInt(2))]
        );
    }

    #[test]
    fn test_inverse_side_is_flipped() {
        let relation =
            RelationMetadata::many_to_many("heroes", "Hero", hero_powers()).junction_inverse();
        let power = RelatedRef::persisted("id", 2_i64);
        let hero = RelatedRef::persisted("id", 1_i64);
        let op = JunctionOperation::new(&relation, power, hero).unwrap();
        let (_, row) = junction_row(
            &SubjectCollection::new(),
            &BatchState::new(0),
            &op,
            JunctionMode::Remove,
        )
        .unwrap();
        assert_eq!(
            row,
            vec![("hero_id", Value::BigInt(1)), ("power_id", Value::BigInt(2))]
        );
    }

    #[test]
    fn test_unpersisted_endpoint() {
        let mut subjects = SubjectCollection::new();
        let power = subjects.push(Subject::for_insert(power_meta(), DynamicEntity::new()));
        let relation = RelationMetadata::many_to_many("powers", "Power", hero_powers());
        let op = JunctionOperation::new(&relation, RelatedRef::persisted("id", 1_i64), power)
            .unwrap();

        let err = junction_row(&subjects, &BatchState::new(0), &op, JunctionMode::Insert)
            .unwrap_err();
        assert!(err.is_not_persisted());
        assert!(err.to_string().contains("Power#"));

        let err = junction_row(&subjects, &BatchState::new(0), &op, JunctionMode::Remove)
            .unwrap_err();
        assert_eq!(err.persist_kind(), Some(PersistErrorKind::MissingIdentity));
    }

    #[test]
    fn test_batch_generated_id_is_used() {
        let mut subjects = SubjectCollection::new();
        let power = subjects.push(Subject::for_insert(power_meta(), DynamicEntity::new()));
        let mut state = BatchState::new(0);
        state
            .inserted
            .insert(power, [("id", Value::BigInt(8))].into_iter().collect());
        let relation = RelationMetadata::many_to_many("powers", "Power", hero_powers());
        let op = JunctionOperation::new(&relation, RelatedRef::persisted("id", 1_i64), power)
            .unwrap();
        let (_, row) = junction_row(&subjects, &state, &op, JunctionMode::Insert).unwrap();
        assert_eq!(row[1], ("power_id", Value::BigInt(8)));
    }
}
