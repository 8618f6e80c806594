//! Column/value collection and identity resolution for one batch.

use crate::collection::SubjectCollection;
use crate::entity::{Related, RelatedRef};
use crate::subject::{Subject, SubjectId};
use orm_persist_core::{
    ColumnRole, ColumnValues, EntityMetadata, Error, IdMap, JoinColumn, PersistError,
    PersistErrorKind, RelationMetadata, Value,
};
use std::collections::{BTreeMap, HashMap, HashSet};

/// Property values written by this batch, per subject.
pub(crate) type WrittenValues = BTreeMap<&'static str, Value>;

/// A nullable foreign key inserted as NULL because its target had no
/// identity yet; rewritten once all inserts are done.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct DeferredFixUp {
    pub owner: SubjectId,
    pub relation: &'static str,
    pub related: RelatedRef,
}

/// Working state of one `execute` call.
#[derive(Debug, Default)]
pub(crate) struct BatchState {
    /// Timestamp (microseconds) used for every date column of the batch.
    pub now: i64,
    /// Values the batch inserted, including generated ids.
    pub inserted: HashMap<SubjectId, WrittenValues>,
    /// Raw rows inserted per subject, by table.
    pub inserted_rows: HashMap<SubjectId, Vec<(&'static str, ColumnValues)>>,
    /// Subjects whose insert level has fully completed.
    pub settled: HashSet<SubjectId>,
    /// Values the batch wrote while updating (update dates, versions).
    pub updated: HashMap<SubjectId, WrittenValues>,
    pub deferred: Vec<DeferredFixUp>,
}

impl BatchState {
    pub fn new(now: i64) -> Self {
        Self {
            now,
            ..Self::default()
        }
    }

    /// Was `id` inserted by an earlier insert level?
    pub fn is_settled(&self, id: SubjectId) -> bool {
        self.settled.contains(&id)
    }

    /// Did `id`'s insert already write `value` into `column` of `table`?
    pub fn inserted_column_holds(
        &self,
        id: SubjectId,
        table: &str,
        column: &str,
        value: &Value,
    ) -> bool {
        self.inserted_rows.get(&id).is_some_and(|rows| {
            rows.iter().filter(|(t, _)| *t == table).any(|(_, values)| {
                values
                    .iter()
                    .any(|(c, v)| *c == column && same_value(v, value))
            })
        })
    }
}

/// How strictly a reference to a pending insert is treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Lookup {
    /// Building an insert row: a subject not inserted by an earlier level
    /// has no usable identity, whatever its entity carries.
    Insert,
    /// All inserts have run.
    Settled,
}

/// Resolve `property` of the entity behind `reference`.
///
/// A value already on the target entity (or its recorded identity) wins
/// over a value produced by this batch's insert of the target.
pub(crate) fn resolve_property(
    subjects: &SubjectCollection,
    state: &BatchState,
    reference: &RelatedRef,
    property: &str,
    lookup: Lookup,
) -> Option<Value> {
    match reference {
        RelatedRef::Persisted(ids) => ids.get(property).cloned().and_then(Value::non_null),
        RelatedRef::Subject(id) => {
            let subject = subjects.get(*id)?;
            if lookup == Lookup::Insert && subject.must_be_inserted() && !state.is_settled(*id) {
                return None;
            }
            subject
                .entity()
                .value(property)
                .and_then(Value::non_null)
                .or_else(|| {
                    subject
                        .entity_id()
                        .and_then(|ids| ids.get(property).cloned())
                        .and_then(Value::non_null)
                })
                .or_else(|| {
                    state
                        .inserted
                        .get(id)
                        .and_then(|written| written.get(property).cloned())
                        .and_then(Value::non_null)
                })
        }
    }
}

/// Resolve the values of `join_columns` against the entity behind
/// `reference`, in column order.
pub(crate) fn resolve_join_columns(
    subjects: &SubjectCollection,
    state: &BatchState,
    reference: &RelatedRef,
    join_columns: &[JoinColumn],
    lookup: Lookup,
) -> Option<ColumnValues> {
    join_columns
        .iter()
        .map(|jc| {
            resolve_property(subjects, state, reference, jc.referenced_property, lookup)
                .map(|value| (jc.column_name, value))
        })
        .collect()
}

/// The full primary identity of the entity behind `reference`.
pub(crate) fn resolve_identity(
    subjects: &SubjectCollection,
    state: &BatchState,
    reference: &RelatedRef,
    metadata: &EntityMetadata,
) -> Option<IdMap> {
    let primary = metadata.primary_columns();
    if primary.is_empty() {
        return None;
    }
    primary
        .into_iter()
        .map(|column| {
            resolve_property(subjects, state, reference, column.property_name, Lookup::Settled)
                .map(|value| (column.property_name, value))
        })
        .collect()
}

/// Describe the entity behind `reference` for error messages.
pub(crate) fn describe_ref(subjects: &SubjectCollection, reference: &RelatedRef) -> String {
    match reference {
        RelatedRef::Subject(id) => subjects
            .get(*id)
            .map_or_else(|| format!("subject {id}"), Subject::describe),
        RelatedRef::Persisted(ids) => format!("{ids:?}"),
    }
}

/// One row to insert into one table of an entity's inheritance chain.
#[derive(Debug, Clone)]
pub(crate) struct InsertRow {
    pub table: &'static str,
    pub values: ColumnValues,
    /// Column the storage engine assigns, and the property it maps to.
    pub generated: Option<(&'static str, &'static str)>,
    /// Property values the row writes, for resolution and write-back.
    pub written: WrittenValues,
    pub deferred: Vec<DeferredFixUp>,
}

/// Depth of a tree entity: its parent's level plus one, with a missing
/// parent level counting as 0.
pub(crate) fn tree_level(
    subject: &Subject,
    subjects: &SubjectCollection,
    state: &BatchState,
) -> Option<i64> {
    let metadata = subject.metadata();
    let level_column = metadata.find_column_by_role(ColumnRole::TreeLevel)?;
    let parent_level = metadata
        .tree_parent_relation()
        .and_then(|relation| match subject.entity().related(relation.property_name) {
            Related::One(parent) => resolve_property(
                subjects,
                state,
                &parent,
                level_column.property_name,
                Lookup::Settled,
            ),
            _ => None,
        })
        .and_then(|value| value.as_i64())
        .unwrap_or(0);
    Some(parent_level + 1)
}

/// Collect the row `subject` writes into `level`'s table.
///
/// `ids` holds the identity values known so far for the entity, including
/// values generated by inserts into tables higher in the chain.
pub(crate) fn collect_insert_row(
    level: &EntityMetadata,
    subject: &Subject,
    subjects: &SubjectCollection,
    state: &BatchState,
    ids: &IdMap,
    tree_level: Option<i64>,
) -> Result<InsertRow, Error> {
    let entity = subject.entity();
    let mut values: ColumnValues = Vec::new();
    let mut written = WrittenValues::new();
    let mut generated = None;

    for column in &level.columns {
        let value = match column.role {
            ColumnRole::Virtual => None,
            ColumnRole::ParentId => column
                .referenced_property
                .and_then(|property| ids.get(property).cloned()),
            ColumnRole::Discriminator => subject
                .metadata()
                .discriminator_value
                .map(Value::from)
                .or_else(|| entity.value(column.property_name)),
            ColumnRole::CreateDate | ColumnRole::UpdateDate => Some(Value::Timestamp(state.now)),
            ColumnRole::Version => Some(Value::BigInt(1)),
            ColumnRole::TreeLevel => tree_level.map(Value::BigInt),
            ColumnRole::Regular => {
                let current = entity.value(column.property_name);
                if column.generated && current.as_ref().is_none_or(Value::is_null) {
                    generated = Some((column.column_name, column.property_name));
                    None
                } else {
                    current
                }
            }
        };
        if let Some(value) = value {
            written.insert(column.property_name, value.clone());
            values.push((column.column_name, value));
        }
    }

    let mut deferred = Vec::new();
    for relation in level.relations.iter().filter(|r| r.kind.is_owning()) {
        match entity.related(relation.property_name) {
            Related::Unset | Related::Many(_) => {}
            Related::Null => {
                for jc in &relation.join_columns {
                    values.push((jc.column_name, Value::Null));
                }
            }
            Related::One(reference) => {
                match resolve_join_columns(
                    subjects,
                    state,
                    &reference,
                    &relation.join_columns,
                    Lookup::Insert,
                ) {
                    Some(resolved) => values.extend(resolved),
                    None if relation.nullable => {
                        tracing::debug!(
                            subject = %subject.describe(),
                            relation = relation.property_name,
                            "Foreign key target has no identity yet, deferring"
                        );
                        for jc in &relation.join_columns {
                            values.push((jc.column_name, Value::Null));
                        }
                        deferred.push(DeferredFixUp {
                            owner: subject.id(),
                            relation: relation.property_name,
                            related: reference,
                        });
                    }
                    None => {
                        return Err(missing_fk(subject, relation, subjects, &reference));
                    }
                }
            }
        }
    }

    Ok(InsertRow {
        table: level.table_name,
        values,
        generated,
        written,
        deferred,
    })
}

fn missing_fk(
    subject: &Subject,
    relation: &RelationMetadata,
    subjects: &SubjectCollection,
    reference: &RelatedRef,
) -> Error {
    PersistError::new(
        PersistErrorKind::MissingIdentity,
        format!(
            "mandatory relation '{}' references {} which has no identity",
            relation.property_name,
            describe_ref(subjects, reference)
        ),
    )
    .entity(subject.describe())
    .into()
}

/// One UPDATE against one table of an entity's inheritance chain.
#[derive(Debug, Clone)]
pub(crate) struct UpdateRow {
    pub table: &'static str,
    pub values: ColumnValues,
    pub conditions: ColumnValues,
    pub written: WrittenValues,
}

/// Collect the per-table updates of `subject`. Tables without a changed
/// column or relation produce no row.
pub(crate) fn collect_update_rows(
    subject: &Subject,
    subjects: &SubjectCollection,
    state: &BatchState,
) -> Result<Vec<UpdateRow>, Error> {
    let metadata = subject.metadata();
    let entity = subject.entity();
    let ids = subject.known_id();
    let mut rows = Vec::new();

    for level in metadata.tables() {
        let mut values: ColumnValues = Vec::new();
        let mut written = WrittenValues::new();

        for column in level.columns.iter().filter(|c| c.is_updatable()) {
            if subject.diff_columns().contains(&column.property_name) {
                let value = entity.value(column.property_name).unwrap_or(Value::Null);
                values.push((column.column_name, value));
            }
        }

        for relation in &level.relations {
            if !relation.kind.is_owning() || !subject.diff_relations().contains(&relation.property_name)
            {
                continue;
            }
            match entity.related(relation.property_name) {
                Related::One(reference) => {
                    let resolved = resolve_join_columns(
                        subjects,
                        state,
                        &reference,
                        &relation.join_columns,
                        Lookup::Settled,
                    )
                    .ok_or_else(|| missing_fk(subject, relation, subjects, &reference))?;
                    values.extend(resolved);
                }
                Related::Null => {
                    for jc in &relation.join_columns {
                        values.push((jc.column_name, Value::Null));
                    }
                }
                Related::Unset | Related::Many(_) => {}
            }
        }

        if values.is_empty() {
            tracing::trace!(
                subject = %subject.describe(),
                table = level.table_name,
                "No changes for table, skipping update"
            );
            continue;
        }

        for column in &level.columns {
            match column.role {
                ColumnRole::UpdateDate => {
                    let value = Value::Timestamp(state.now);
                    written.insert(column.property_name, value.clone());
                    values.push((column.column_name, value));
                }
                ColumnRole::Version => {
                    let value = Value::next_version(entity.value(column.property_name).as_ref());
                    written.insert(column.property_name, value.clone());
                    values.push((column.column_name, value));
                }
                _ => {}
            }
        }

        let conditions = ids
            .as_ref()
            .and_then(|ids| level.key_conditions(ids))
            .ok_or_else(|| missing_identity(subject, "update"))?;

        rows.push(UpdateRow {
            table: level.table_name,
            values,
            conditions,
            written,
        });
    }

    Ok(rows)
}

/// The DELETE conditions of `subject`, one per table, leaf table first.
pub(crate) fn collect_remove_rows(
    subject: &Subject,
) -> Result<Vec<(&'static str, ColumnValues)>, Error> {
    let ids = subject
        .known_id()
        .ok_or_else(|| missing_identity(subject, "remove"))?;
    let mut rows = Vec::new();
    for level in subject.metadata().tables().into_iter().rev() {
        let conditions = level
            .key_conditions(&ids)
            .ok_or_else(|| missing_identity(subject, "remove"))?;
        rows.push((level.table_name, conditions));
    }
    Ok(rows)
}

pub(crate) fn missing_identity(subject: &Subject, action: &str) -> Error {
    PersistError::new(
        PersistErrorKind::MissingIdentity,
        format!("cannot {} an entity without a known identity", action),
    )
    .entity(subject.describe())
    .into()
}

/// Compare values. Only integer variants of different widths are
/// coerced; every other pair must be equal as is.
pub(crate) fn same_value(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Int(x), Value::BigInt(y)) | (Value::BigInt(y), Value::Int(x)) => {
            i64::from(*x) == *y
        }
        _ => a == b,
    }
}
