//! Entity mapping metadata.
//!
//! Metadata is resolved before the persistence core runs: every entity target
//! is described by an [`EntityMetadata`] carrying its table, columns,
//! relations, inheritance parent and optional closure table. The core only
//! reads these descriptors through a [`MetadataProvider`].

use crate::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Identity of a stored row: primary property name -> value.
pub type IdMap = BTreeMap<&'static str, Value>;

/// Column name -> value pairs, in statement order.
pub type ColumnValues = Vec<(&'static str, Value)>;

/// The special meaning a column has for the persistence core.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ColumnRole {
    /// Plain data column.
    #[default]
    Regular,
    /// Computed on read, never written.
    Virtual,
    /// Set once to the batch timestamp on insert.
    CreateDate,
    /// Set to the batch timestamp on insert and on every update.
    UpdateDate,
    /// Optimistic version counter, seeded with 1 and bumped on update.
    Version,
    /// Single-table inheritance discriminator.
    Discriminator,
    /// Class-table inheritance link to the parent table row.
    ParentId,
    /// Depth of the row in a self-referencing tree.
    TreeLevel,
}

/// Metadata about a mapped column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnMetadata {
    /// Property name on the entity
    pub property_name: &'static str,
    /// Database column name
    pub column_name: &'static str,
    /// Special role, if any
    pub role: ColumnRole,
    /// Whether this column is part of the primary key
    pub primary: bool,
    /// Whether the storage engine assigns this column on insert
    pub generated: bool,
    /// Whether this column accepts NULL
    pub nullable: bool,
    /// For [`ColumnRole::ParentId`] columns: the primary property of the
    /// parent table this column mirrors.
    pub referenced_property: Option<&'static str>,
}

impl ColumnMetadata {
    /// Create a regular, non-null column.
    pub const fn new(property_name: &'static str, column_name: &'static str) -> Self {
        Self {
            property_name,
            column_name,
            role: ColumnRole::Regular,
            primary: false,
            generated: false,
            nullable: false,
            referenced_property: None,
        }
    }

    /// Create a class-table inheritance link column.
    pub const fn parent_id(
        property_name: &'static str,
        column_name: &'static str,
        referenced_property: &'static str,
    ) -> Self {
        Self::new(property_name, column_name)
            .role(ColumnRole::ParentId)
            .primary()
            .references(referenced_property)
    }

    /// Set the column role.
    pub const fn role(mut self, role: ColumnRole) -> Self {
        self.role = role;
        self
    }

    /// Mark as part of the primary key.
    pub const fn primary(mut self) -> Self {
        self.primary = true;
        self
    }

    /// Mark as generated by the storage engine.
    pub const fn generated(mut self) -> Self {
        self.generated = true;
        self
    }

    /// Mark as nullable.
    pub const fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    /// Set the parent property mirrored by a parent-id column.
    pub const fn references(mut self, property: &'static str) -> Self {
        self.referenced_property = Some(property);
        self
    }

    /// Whether the column carries a value the core never writes directly
    /// from the entity.
    pub const fn is_skipped_on_insert(&self) -> bool {
        matches!(
            self.role,
            ColumnRole::Virtual | ColumnRole::ParentId | ColumnRole::Discriminator
        )
    }

    /// Whether a caller-side change to this column produces an UPDATE.
    pub const fn is_updatable(&self) -> bool {
        matches!(self.role, ColumnRole::Regular) && !self.primary && !self.generated
    }
}

/// The kind of a relation, seen from the entity declaring it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RelationKind {
    /// Inverse side: the foreign key lives on the target table.
    OneToMany,
    /// Owning side: the foreign key lives on this table.
    ManyToOne,
    /// One-to-one, foreign key on this table.
    OneToOneOwner,
    /// One-to-one, foreign key on the target table.
    OneToOneNotOwner,
    /// Rows are linked through a junction table.
    ManyToMany,
}

impl RelationKind {
    /// All kinds, in discriminant order.
    pub const ALL: [RelationKind; 5] = [
        RelationKind::OneToMany,
        RelationKind::ManyToOne,
        RelationKind::OneToOneOwner,
        RelationKind::OneToOneNotOwner,
        RelationKind::ManyToMany,
    ];

    /// Does this side hold the foreign key columns?
    pub const fn is_owning(self) -> bool {
        matches!(self, RelationKind::ManyToOne | RelationKind::OneToOneOwner)
    }

    /// Is the foreign key on the target table?
    pub const fn is_inverse(self) -> bool {
        matches!(self, RelationKind::OneToMany | RelationKind::OneToOneNotOwner)
    }

    /// Position in [`RelationKind::ALL`].
    pub const fn index(self) -> usize {
        self as usize
    }
}

/// A foreign key column and the target property it references.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JoinColumn {
    /// Foreign key column name
    pub column_name: &'static str,
    /// Property on the referenced entity (usually its primary key)
    pub referenced_property: &'static str,
}

impl JoinColumn {
    pub const fn new(column_name: &'static str, referenced_property: &'static str) -> Self {
        Self {
            column_name,
            referenced_property,
        }
    }
}

/// One side of a junction table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JunctionSide {
    /// Entity target this side references
    pub target: &'static str,
    /// Junction columns pointing at that entity
    pub columns: Vec<JoinColumn>,
}

/// The link table behind a many-to-many relation.
///
/// Columns are written owner side first, then inverse side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JunctionMetadata {
    /// The junction table name (e.g., `"hero_powers"`).
    pub table_name: &'static str,
    /// Side referencing the owning entity
    pub owner: JunctionSide,
    /// Side referencing the inverse entity
    pub inverse: JunctionSide,
}

impl JunctionMetadata {
    /// Single-column junction between two targets.
    pub fn new(
        table_name: &'static str,
        owner: (&'static str, JoinColumn),
        inverse: (&'static str, JoinColumn),
    ) -> Self {
        Self {
            table_name,
            owner: JunctionSide {
                target: owner.0,
                columns: vec![owner.1],
            },
            inverse: JunctionSide {
                target: inverse.0,
                columns: vec![inverse.1],
            },
        }
    }
}

/// Metadata about a relation between two entities.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationMetadata {
    /// Name of the relation property.
    pub property_name: &'static str,
    /// Kind of relation.
    pub kind: RelationKind,
    /// Target entity name.
    pub target: &'static str,
    /// Whether the foreign key accepts NULL.
    pub nullable: bool,
    /// Owning side: foreign key columns on this entity's table.
    pub join_columns: Vec<JoinColumn>,
    /// Inverse side: foreign key columns on the target table pointing at
    /// this entity.
    pub inverse_join_columns: Vec<JoinColumn>,
    /// Link table for many-to-many relations.
    pub junction: Option<JunctionMetadata>,
    /// For many-to-many: whether this entity is the junction's owner side.
    pub junction_owner: bool,
    /// Marks the self-reference to the parent node of a tree entity.
    pub tree_parent: bool,
}

impl RelationMetadata {
    fn new(property_name: &'static str, kind: RelationKind, target: &'static str) -> Self {
        Self {
            property_name,
            kind,
            target,
            nullable: true,
            join_columns: Vec::new(),
            inverse_join_columns: Vec::new(),
            junction: None,
            junction_owner: true,
            tree_parent: false,
        }
    }

    /// Many-to-one relation with a single foreign key column.
    pub fn many_to_one(
        property_name: &'static str,
        target: &'static str,
        join_column: JoinColumn,
    ) -> Self {
        let mut relation = Self::new(property_name, RelationKind::ManyToOne, target);
        relation.join_columns.push(join_column);
        relation
    }

    /// Owning one-to-one relation with a single foreign key column.
    pub fn one_to_one_owner(
        property_name: &'static str,
        target: &'static str,
        join_column: JoinColumn,
    ) -> Self {
        let mut relation = Self::new(property_name, RelationKind::OneToOneOwner, target);
        relation.join_columns.push(join_column);
        relation
    }

    /// One-to-many relation; `inverse_join_column` lives on the target table.
    pub fn one_to_many(
        property_name: &'static str,
        target: &'static str,
        inverse_join_column: JoinColumn,
    ) -> Self {
        let mut relation = Self::new(property_name, RelationKind::OneToMany, target);
        relation.inverse_join_columns.push(inverse_join_column);
        relation
    }

    /// Non-owning one-to-one relation; the foreign key lives on the target.
    pub fn one_to_one_not_owner(
        property_name: &'static str,
        target: &'static str,
        inverse_join_column: JoinColumn,
    ) -> Self {
        let mut relation = Self::new(property_name, RelationKind::OneToOneNotOwner, target);
        relation.inverse_join_columns.push(inverse_join_column);
        relation
    }

    /// Many-to-many relation through `junction`.
    pub fn many_to_many(
        property_name: &'static str,
        target: &'static str,
        junction: JunctionMetadata,
    ) -> Self {
        let mut relation = Self::new(property_name, RelationKind::ManyToMany, target);
        relation.junction = Some(junction);
        relation
    }

    /// Mark the foreign key as NOT NULL.
    pub fn required(mut self) -> Self {
        self.nullable = false;
        self
    }

    /// Declare this many-to-many side as the junction's inverse side.
    pub fn junction_inverse(mut self) -> Self {
        self.junction_owner = false;
        self
    }

    /// Mark as the parent link of a tree entity.
    pub fn tree_parent(mut self) -> Self {
        self.tree_parent = true;
        self
    }

    /// Add another foreign key column (composite keys).
    pub fn join_column(mut self, join_column: JoinColumn) -> Self {
        if self.kind.is_inverse() {
            self.inverse_join_columns.push(join_column);
        } else {
            self.join_columns.push(join_column);
        }
        self
    }
}

/// The closure table of a tree entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClosureTableMetadata {
    pub table_name: &'static str,
    pub ancestor_column: &'static str,
    pub descendant_column: &'static str,
    /// Optional depth column (`descendant level - ancestor level`).
    pub level_column: Option<&'static str>,
}

impl ClosureTableMetadata {
    pub const fn new(
        table_name: &'static str,
        ancestor_column: &'static str,
        descendant_column: &'static str,
    ) -> Self {
        Self {
            table_name,
            ancestor_column,
            descendant_column,
            level_column: None,
        }
    }

    /// Track depth in `column`.
    pub const fn level(mut self, column: &'static str) -> Self {
        self.level_column = Some(column);
        self
    }
}

/// Metadata for one entity target.
///
/// Under class-table inheritance each level of the hierarchy has its own
/// `EntityMetadata` with the columns and relations stored in that level's
/// table; `parent` links to the level above.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityMetadata {
    /// Entity target name (e.g., `"Hero"`).
    pub target: &'static str,
    /// Table name for this level.
    pub table_name: &'static str,
    /// Columns stored in this level's table.
    pub columns: Vec<ColumnMetadata>,
    /// Relations whose foreign keys (if owning) live in this level's table.
    pub relations: Vec<RelationMetadata>,
    /// Discriminator written for single-table inheritance children.
    pub discriminator_value: Option<&'static str>,
    /// Parent level under class-table inheritance.
    pub parent: Option<Arc<EntityMetadata>>,
    /// Closure table for tree entities.
    pub closure_table: Option<ClosureTableMetadata>,
}

impl EntityMetadata {
    pub fn new(target: &'static str, table_name: &'static str) -> Self {
        Self {
            target,
            table_name,
            columns: Vec::new(),
            relations: Vec::new(),
            discriminator_value: None,
            parent: None,
            closure_table: None,
        }
    }

    #[must_use]
    pub fn column(mut self, column: ColumnMetadata) -> Self {
        self.columns.push(column);
        self
    }

    #[must_use]
    pub fn relation(mut self, relation: RelationMetadata) -> Self {
        self.relations.push(relation);
        self
    }

    #[must_use]
    pub fn discriminator(mut self, value: &'static str) -> Self {
        self.discriminator_value = Some(value);
        self
    }

    #[must_use]
    pub fn inherits(mut self, parent: Arc<EntityMetadata>) -> Self {
        self.parent = Some(parent);
        self
    }

    #[must_use]
    pub fn closure_table(mut self, closure: ClosureTableMetadata) -> Self {
        self.closure_table = Some(closure);
        self
    }

    /// The inheritance chain, root table first, ending with `self`.
    pub fn tables(&self) -> Vec<&EntityMetadata> {
        let mut chain = vec![self];
        let mut current = self;
        while let Some(parent) = current.parent.as_deref() {
            chain.push(parent);
            current = parent;
        }
        chain.reverse();
        chain
    }

    /// The topmost level of the inheritance chain.
    pub fn root(&self) -> &EntityMetadata {
        let mut current = self;
        while let Some(parent) = current.parent.as_deref() {
            current = parent;
        }
        current
    }

    /// Does this entity span more than one table?
    pub fn has_parent_table(&self) -> bool {
        self.parent.is_some()
    }

    /// Primary key columns of the entity (declared on the root table).
    pub fn primary_columns(&self) -> Vec<&ColumnMetadata> {
        self.root().columns.iter().filter(|c| c.primary).collect()
    }

    /// The column assigned by the storage engine, if any.
    pub fn generated_column(&self) -> Option<&ColumnMetadata> {
        self.tables()
            .into_iter()
            .flat_map(|table| table.columns.iter())
            .find(|c| c.generated)
    }

    /// Find a column anywhere in the chain by property name.
    pub fn find_column(&self, property: &str) -> Option<&ColumnMetadata> {
        self.tables()
            .into_iter()
            .flat_map(|table| table.columns.iter())
            .find(|c| c.property_name == property)
    }

    /// Find a column anywhere in the chain by role.
    pub fn find_column_by_role(&self, role: ColumnRole) -> Option<&ColumnMetadata> {
        self.tables()
            .into_iter()
            .flat_map(|table| table.columns.iter())
            .find(|c| c.role == role)
    }

    /// Find a relation anywhere in the chain by property name.
    pub fn find_relation(&self, property: &str) -> Option<&RelationMetadata> {
        self.relations_with_table()
            .into_iter()
            .map(|(_, relation)| relation)
            .find(|r| r.property_name == property)
    }

    /// Every relation in the chain with the level that declares it.
    pub fn relations_with_table(&self) -> Vec<(&EntityMetadata, &RelationMetadata)> {
        self.tables()
            .into_iter()
            .flat_map(|table| table.relations.iter().map(move |r| (table, r)))
            .collect()
    }

    /// The level whose table holds the foreign keys of `relation`.
    pub fn table_for_relation(&self, relation: &str) -> Option<&EntityMetadata> {
        self.relations_with_table()
            .into_iter()
            .find(|(_, r)| r.property_name == relation)
            .map(|(table, _)| table)
    }

    /// Does this entity record its depth in a tree?
    pub fn has_tree_level(&self) -> bool {
        self.find_column_by_role(ColumnRole::TreeLevel).is_some()
    }

    /// The relation marking the parent node of a tree entity.
    pub fn tree_parent_relation(&self) -> Option<&RelationMetadata> {
        self.relations_with_table()
            .into_iter()
            .map(|(_, r)| r)
            .find(|r| r.tree_parent)
    }

    /// Parent-id columns of this level.
    pub fn parent_id_columns(&self) -> Vec<&ColumnMetadata> {
        self.columns
            .iter()
            .filter(|c| c.role == ColumnRole::ParentId)
            .collect()
    }

    /// WHERE conditions addressing this level's row for an entity identity.
    ///
    /// Child levels are keyed by their parent-id columns, the root level by
    /// its primary columns. Returns `None` if part of the identity is
    /// missing.
    pub fn key_conditions(&self, ids: &IdMap) -> Option<ColumnValues> {
        let parent_ids = self.parent_id_columns();
        let keyed: Vec<(&'static str, &'static str)> = if parent_ids.is_empty() {
            self.columns
                .iter()
                .filter(|c| c.primary)
                .map(|c| (c.column_name, c.property_name))
                .collect()
        } else {
            parent_ids
                .iter()
                .map(|c| {
                    (
                        c.column_name,
                        c.referenced_property.unwrap_or(c.property_name),
                    )
                })
                .collect()
        };

        if keyed.is_empty() {
            return None;
        }

        keyed
            .into_iter()
            .map(|(column, property)| {
                ids.get(property)
                    .filter(|v| !v.is_null())
                    .map(|v| (column, v.clone()))
            })
            .collect()
    }
}

/// Lookup of entity metadata by target name.
pub trait MetadataProvider: Send + Sync {
    fn find(&self, target: &str) -> Option<Arc<EntityMetadata>>;
}

/// A [`MetadataProvider`] backed by a map of registered targets.
#[derive(Debug, Default, Clone)]
pub struct MetadataRegistry {
    entities: HashMap<&'static str, Arc<EntityMetadata>>,
}

impl MetadataRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `metadata`, replacing any previous entry for its target.
    pub fn register(&mut self, metadata: EntityMetadata) -> Arc<EntityMetadata> {
        let metadata = Arc::new(metadata);
        self.entities.insert(metadata.target, Arc::clone(&metadata));
        metadata
    }

    /// Register already-shared metadata.
    pub fn register_arc(&mut self, metadata: Arc<EntityMetadata>) {
        self.entities.insert(metadata.target, metadata);
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }
}

impl MetadataProvider for MetadataRegistry {
    fn find(&self, target: &str) -> Option<Arc<EntityMetadata>> {
        self.entities.get(target).cloned()
    }
}
