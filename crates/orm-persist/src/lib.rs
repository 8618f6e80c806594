//! Subject-graph persistence for ORM Persist.
//!
//! `orm-persist` is the **write side** of the ORM. A caller hands it a
//! [`SubjectCollection`] (one [`Subject`] per entity, each flagged for
//! insert, update and/or remove) plus the junction and relation operations
//! of the batch, and [`PersistExecutor`] turns that into ordered SQL inside
//! one transaction.
//!
//! # Role In The Architecture
//!
//! - **Scheduling**: pending inserts are ordered by mandatory foreign keys
//!   ([`InsertSchedule`]); cycles are rejected before anything is written.
//! - **Identity flow**: ids generated by one insert level feed the foreign
//!   keys of the next, and nullable keys to not-yet-inserted rows are
//!   fixed up once all inserts ran.
//! - **Transactional safety**: the executor opens, commits and rolls back
//!   its own transaction unless the caller already holds one.
//! - **Lifecycle events**: listeners run once before and once after a
//!   batch through a [`Broadcaster`].
//!
//! # Example
//!
//! ```ignore
//! let runner = SqlQueryRunner::new(conn);
//! let mut subjects = SubjectCollection::new();
//! let team = subjects.push(Subject::for_insert(team_meta, team));
//! subjects.push(Subject::for_insert(
//!     hero_meta,
//!     DynamicEntity::new()
//!         .with("name", "Deadpond")
//!         .with_related("team", Related::One(team.into())),
//! ));
//!
//! let result = PersistExecutor::new(&runner, &registry)
//!     .execute(&cx, &mut subjects, &BatchOperations::new())
//!     .await;
//! ```

pub mod broadcast;
pub mod collection;
pub mod config;
pub mod entity;
pub mod executor;
pub(crate) mod fixup;
pub(crate) mod junction;
pub mod operations;
pub mod schedule;
pub mod sql_runner;
pub mod subject;
pub(crate) mod values;

pub use broadcast::{Broadcaster, ListenerBroadcaster, NoopBroadcaster, PersistEvent};
pub use collection::SubjectCollection;
pub use config::{PersistConfig, system_clock};
pub use entity::{DynamicEntity, Entity, Related, RelatedRef};
pub use executor::{PersistExecutor, PersistResult};
pub use operations::{BatchOperations, JunctionOperation, RelationAction, RelationUpdate};
pub use schedule::{InsertSchedule, removal_order};
pub use sql_runner::SqlQueryRunner;
pub use subject::{Snapshot, Subject, SubjectId};

pub use orm_persist_core::{
    ClosureTableMetadata, ColumnMetadata, ColumnRole, ColumnValues, Connection, Cx, Dialect,
    EntityMetadata, Error, IdMap, JoinColumn, JunctionMetadata, MetadataProvider,
    MetadataRegistry, Outcome, PersistError, PersistErrorKind, QueryRunner, RelationKind,
    RelationMetadata, Value,
};
