//! Junction row and relation update descriptors handed to the executor.

use crate::entity::RelatedRef;
use orm_persist_core::{Error, JunctionMetadata, PersistErrorKind, RelationKind, RelationMetadata};

/// A many-to-many link row to insert or remove.
#[derive(Debug, Clone)]
pub struct JunctionOperation {
    /// The many-to-many relation, seen from `owner`.
    pub relation: RelationMetadata,
    /// The entity declaring `relation`.
    pub owner: RelatedRef,
    /// The entity on the other end.
    pub related: RelatedRef,
}

impl JunctionOperation {
    /// Build a junction operation for a many-to-many `relation`.
    pub fn new(
        relation: &RelationMetadata,
        owner: impl Into<RelatedRef>,
        related: impl Into<RelatedRef>,
    ) -> Result<Self, Error> {
        if relation.kind != RelationKind::ManyToMany || relation.junction.is_none() {
            return Err(Error::persist(
                PersistErrorKind::InvalidRelation,
                format!(
                    "relation '{}' is not a many-to-many relation with a junction table",
                    relation.property_name
                ),
            ));
        }
        Ok(Self {
            relation: relation.clone(),
            owner: owner.into(),
            related: related.into(),
        })
    }

    /// The junction table metadata.
    pub fn junction(&self) -> Option<&JunctionMetadata> {
        self.relation.junction.as_ref()
    }
}

/// What a [`RelationUpdate`] does to the foreign key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelationAction {
    /// Point the foreign key at the related entity.
    Set,
    /// Set the foreign key to NULL.
    Clear,
}

/// A relation change applied independently of inserts.
///
/// For owning relations the foreign key on the owner's table is rewritten;
/// for inverse relations the foreign key on the related entity's table is.
#[derive(Debug, Clone)]
pub struct RelationUpdate {
    /// Entity target declaring the relation.
    pub owner_target: &'static str,
    /// The entity declaring the relation.
    pub owner: RelatedRef,
    /// Relation property name.
    pub relation: &'static str,
    /// The related entity. Required except when clearing an owning
    /// relation.
    pub related: Option<RelatedRef>,
    pub action: RelationAction,
}

impl RelationUpdate {
    /// Point `relation` of `owner` at `related`.
    pub fn set(
        owner_target: &'static str,
        owner: impl Into<RelatedRef>,
        relation: &'static str,
        related: impl Into<RelatedRef>,
    ) -> Self {
        Self {
            owner_target,
            owner: owner.into(),
            relation,
            related: Some(related.into()),
            action: RelationAction::Set,
        }
    }

    /// Clear an owning relation of `owner`.
    pub fn clear(
        owner_target: &'static str,
        owner: impl Into<RelatedRef>,
        relation: &'static str,
    ) -> Self {
        Self {
            owner_target,
            owner: owner.into(),
            relation,
            related: None,
            action: RelationAction::Clear,
        }
    }

    /// Detach `related` from an inverse relation of `owner` by nulling its
    /// foreign key.
    pub fn clear_related(
        owner_target: &'static str,
        owner: impl Into<RelatedRef>,
        relation: &'static str,
        related: impl Into<RelatedRef>,
    ) -> Self {
        Self {
            owner_target,
            owner: owner.into(),
            relation,
            related: Some(related.into()),
            action: RelationAction::Clear,
        }
    }
}

/// Junction and relation operations of one batch, next to the subjects.
#[derive(Debug, Clone, Default)]
pub struct BatchOperations {
    pub junction_inserts: Vec<JunctionOperation>,
    pub junction_removes: Vec<JunctionOperation>,
    pub relation_updates: Vec<RelationUpdate>,
}

impl BatchOperations {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a junction row to insert (builder pattern).
    #[must_use]
    pub fn insert_junction(mut self, op: JunctionOperation) -> Self {
        self.junction_inserts.push(op);
        self
    }

    /// Queue a junction row to remove (builder pattern).
    #[must_use]
    pub fn remove_junction(mut self, op: JunctionOperation) -> Self {
        self.junction_removes.push(op);
        self
    }

    /// Queue a relation update (builder pattern).
    #[must_use]
    pub fn update_relation(mut self, update: RelationUpdate) -> Self {
        self.relation_updates.push(update);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.junction_inserts.is_empty()
            && self.junction_removes.is_empty()
            && self.relation_updates.is_empty()
    }
}
