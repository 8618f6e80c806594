//! Batch execution.
//!
//! [`PersistExecutor::execute`] writes one prepared batch of subjects in a
//! fixed phase order:
//!
//! 1. diffs are computed, conflicts rejected and inserts scheduled
//! 2. before-broadcast
//! 3. transaction opened (when allowed and none is active)
//! 4. inserts, level by level
//! 5. closure table rows for inserted tree entities
//! 6. relation fix-ups
//! 7. junction inserts, then junction removes
//! 8. updates
//! 9. removes
//! 10. commit, write-back, after-broadcast
//!
//! Nothing is written before phase 3. A failure after the executor opened
//! its own transaction rolls it back once and returns the original error.

use crate::broadcast::{Broadcaster, NoopBroadcaster};
use crate::collection::SubjectCollection;
use crate::config::PersistConfig;
use crate::entity::{Related, RelatedRef};
use crate::fixup::{self, FixUp, FixUpContext, FixUpRequest};
use crate::junction::{self, JunctionMode};
use crate::operations::{BatchOperations, JunctionOperation, RelationAction};
use crate::schedule::{self, InsertSchedule};
use crate::subject::{Subject, SubjectId};
use crate::values::{self, BatchState, Lookup, WrittenValues};
use asupersync::{Cx, Outcome};
use orm_persist_core::{
    ColumnRole, ColumnValues, Error, IdMap, MetadataProvider, PersistError, PersistErrorKind,
    QueryRunner, RelationMetadata, Value,
};
use std::sync::Arc;
use std::time::Instant;

/// Counts of what a batch wrote.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PersistResult {
    /// Entities inserted.
    pub inserted: usize,
    /// Entities updated (entities without changes are not counted).
    pub updated: usize,
    /// Entities removed.
    pub removed: usize,
    /// Entities recorded in a closure table.
    pub closure_inserts: usize,
    /// Foreign key fix-up statements.
    pub relation_updates: usize,
    /// Junction rows inserted.
    pub junction_inserted: usize,
    /// Junction rows removed.
    pub junction_removed: usize,
}

impl PersistResult {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of write operations.
    pub fn total(&self) -> usize {
        self.inserted
            + self.updated
            + self.removed
            + self.closure_inserts
            + self.relation_updates
            + self.junction_inserted
            + self.junction_removed
    }
}

/// Executes persist batches against a [`QueryRunner`].
pub struct PersistExecutor<'a, R> {
    runner: &'a R,
    metadata: &'a dyn MetadataProvider,
    broadcaster: Box<dyn Broadcaster + 'a>,
    config: PersistConfig,
}

impl<R> std::fmt::Debug for PersistExecutor<'_, R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistExecutor")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<'a, R: QueryRunner> PersistExecutor<'a, R> {
    /// Create an executor with the default configuration and no listeners.
    pub fn new(runner: &'a R, metadata: &'a dyn MetadataProvider) -> Self {
        Self {
            runner,
            metadata,
            broadcaster: Box::new(NoopBroadcaster),
            config: PersistConfig::default(),
        }
    }

    /// Use `broadcaster` for lifecycle events (builder pattern).
    #[must_use]
    pub fn with_broadcaster(mut self, broadcaster: impl Broadcaster + 'a) -> Self {
        self.broadcaster = Box::new(broadcaster);
        self
    }

    /// Use `config` (builder pattern).
    #[must_use]
    pub fn with_config(mut self, config: PersistConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &PersistConfig {
        &self.config
    }

    /// Execute one batch.
    ///
    /// On success the subjects carry their identities, generated ids,
    /// tree levels and batch date, and (when `reload` is set) their
    /// entities carry every value the batch generated.
    ///
    /// After-event listeners run once the transaction has committed. An
    /// error from one of them is returned as this call's error, but the
    /// batch stays committed and the write-back has already happened.
    #[tracing::instrument(level = "info", skip_all, fields(subjects = subjects.len()))]
    pub async fn execute(
        &self,
        cx: &Cx,
        subjects: &mut SubjectCollection,
        operations: &BatchOperations,
    ) -> Outcome<PersistResult, Error> {
        let started = Instant::now();

        subjects.compute_diffs();
        if let Err(e) = validate_operations(subjects) {
            return Outcome::Err(e);
        }
        let schedule = match InsertSchedule::build(subjects) {
            Ok(schedule) => schedule,
            Err(e) => return Outcome::Err(e),
        };
        let removal_order = schedule::removal_order(subjects);

        let inserts: Vec<SubjectId> = schedule.levels().iter().flatten().copied().collect();
        let updates = subjects.updates();
        tracing::info!(
            inserts = inserts.len(),
            insert_levels = schedule.levels().len(),
            updates = updates.len(),
            removes = removal_order.len(),
            junction_inserts = operations.junction_inserts.len(),
            junction_removes = operations.junction_removes.len(),
            relation_updates = operations.relation_updates.len(),
            "Executing persist batch"
        );

        if self.config.listeners {
            if let Err(e) = self.broadcast(subjects, &inserts, &updates, &removal_order, false) {
                return Outcome::Err(e);
            }
        }

        let mut state = BatchState::new(self.config.now());
        let owns_transaction = self.config.transaction && !self.runner.is_transaction_active();
        if owns_transaction {
            tracing::debug!("Beginning persist transaction");
            match self.runner.begin_transaction(cx).await {
                Outcome::Ok(()) => {}
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        }

        let body = self
            .execute_phases(cx, subjects, operations, &schedule, &removal_order, &mut state)
            .await;
        let result = match body {
            Outcome::Ok(result) => result,
            failed => {
                if owns_transaction {
                    self.rollback_quietly(cx).await;
                }
                return failed;
            }
        };

        if owns_transaction {
            tracing::debug!("Committing persist transaction");
            let commit = self.runner.commit_transaction(cx).await;
            if !matches!(commit, Outcome::Ok(())) && self.runner.is_transaction_active() {
                self.rollback_quietly(cx).await;
            }
            match commit {
                Outcome::Ok(()) => {}
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        }

        if self.config.reload {
            write_back(subjects, &state);
        }

        if self.config.listeners {
            if let Err(e) = self.broadcast(subjects, &inserts, &updates, &removal_order, true) {
                tracing::warn!(error = %e, "After-event listener failed on a committed batch");
                return Outcome::Err(e);
            }
        }

        tracing::info!(
            inserted = result.inserted,
            updated = result.updated,
            removed = result.removed,
            relation_updates = result.relation_updates,
            junction_inserted = result.junction_inserted,
            junction_removed = result.junction_removed,
            elapsed_ms = started.elapsed().as_millis(),
            "Persist batch complete"
        );
        Outcome::Ok(result)
    }

    async fn execute_phases(
        &self,
        cx: &Cx,
        subjects: &mut SubjectCollection,
        operations: &BatchOperations,
        schedule: &InsertSchedule,
        removal_order: &[SubjectId],
        state: &mut BatchState,
    ) -> Outcome<PersistResult, Error> {
        let mut result = PersistResult::new();

        match self.execute_inserts(cx, subjects, schedule, state).await {
            Outcome::Ok(count) => result.inserted = count,
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        }

        match self.execute_closure_inserts(cx, subjects, schedule, state).await {
            Outcome::Ok(count) => result.closure_inserts = count,
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        }

        match self
            .execute_fix_ups(cx, subjects, schedule, operations, state)
            .await
        {
            Outcome::Ok(count) => result.relation_updates = count,
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        }

        match self
            .execute_junction_ops(cx, subjects, &operations.junction_inserts, state, JunctionMode::Insert)
            .await
        {
            Outcome::Ok(count) => result.junction_inserted = count,
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        }

        match self
            .execute_junction_ops(cx, subjects, &operations.junction_removes, state, JunctionMode::Remove)
            .await
        {
            Outcome::Ok(count) => result.junction_removed = count,
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        }

        match self.execute_updates(cx, subjects, state).await {
            Outcome::Ok(count) => result.updated = count,
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        }

        match self.execute_removes(cx, subjects, removal_order).await {
            Outcome::Ok(count) => result.removed = count,
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        }

        Outcome::Ok(result)
    }

    /// Insert level by level. A level's subjects only see identities
    /// produced by earlier levels.
    #[tracing::instrument(level = "debug", skip_all)]
    async fn execute_inserts(
        &self,
        cx: &Cx,
        subjects: &mut SubjectCollection,
        schedule: &InsertSchedule,
        state: &mut BatchState,
    ) -> Outcome<usize, Error> {
        let mut count = 0;
        for (level, ids) in schedule.levels().iter().enumerate() {
            tracing::debug!(level, size = ids.len(), "Executing insert level");
            for &id in ids {
                match self.insert_subject(cx, subjects, state, id).await {
                    Outcome::Ok(()) => count += 1,
                    Outcome::Err(e) => return Outcome::Err(e),
                    Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                    Outcome::Panicked(p) => return Outcome::Panicked(p),
                }
            }
            state.settled.extend(ids.iter().copied());
        }
        Outcome::Ok(count)
    }

    /// Insert one subject into every table of its inheritance chain, root
    /// table first.
    async fn insert_subject(
        &self,
        cx: &Cx,
        subjects: &mut SubjectCollection,
        state: &mut BatchState,
        id: SubjectId,
    ) -> Outcome<(), Error> {
        let Some(subject) = subjects.get(id) else {
            return Outcome::Ok(());
        };
        let metadata = Arc::clone(subject.metadata());
        let primary = metadata.primary_columns();
        let tree_level = values::tree_level(subject, subjects, state);

        let mut ids: IdMap = primary
            .iter()
            .filter_map(|column| {
                subject
                    .entity()
                    .value(column.property_name)
                    .and_then(Value::non_null)
                    .map(|value| (column.property_name, value))
            })
            .collect();
        let mut written = WrittenValues::new();
        let mut generated_id = None;

        for level in metadata.tables() {
            let row = match values::collect_insert_row(level, subject, subjects, state, &ids, tree_level)
            {
                Ok(row) => row,
                Err(e) => return Outcome::Err(e),
            };
            let prepared = self.prepare(&row.values);
            tracing::trace!(
                subject = %subject.describe(),
                table = row.table,
                columns = prepared.len(),
                "Inserting row"
            );

            let returned = match self
                .runner
                .insert(cx, row.table, &prepared, row.generated.map(|(column, _)| column))
                .await
            {
                Outcome::Ok(returned) => returned,
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            };
            if let (Some(value), Some((_, property))) = (returned, row.generated) {
                if primary.iter().any(|c| c.property_name == property) {
                    ids.insert(property, value.clone());
                    generated_id = Some(value.clone());
                }
                written.insert(property, value);
            }

            written.extend(row.written);
            state.deferred.extend(row.deferred);
            state
                .inserted_rows
                .entry(id)
                .or_default()
                .push((row.table, row.values));
        }

        let entity_id: Option<IdMap> = if primary.is_empty() {
            None
        } else {
            primary
                .iter()
                .map(|c| ids.get(c.property_name).map(|v| (c.property_name, v.clone())))
                .collect()
        };
        for (property, value) in entity_id.iter().flatten() {
            written.entry(*property).or_insert_with(|| value.clone());
        }
        state.inserted.insert(id, written);

        if let Some(subject) = subjects.get_mut(id) {
            if entity_id.is_some() {
                subject.entity_id = entity_id;
            }
            subject.newly_generated_id = generated_id;
            subject.tree_level = tree_level;
            subject.date = Some(state.now);
        }
        Outcome::Ok(())
    }

    /// Record inserted tree entities in their closure tables, in insert
    /// order so a parent's ancestor rows exist before its children's.
    #[tracing::instrument(level = "debug", skip_all)]
    async fn execute_closure_inserts(
        &self,
        cx: &Cx,
        subjects: &SubjectCollection,
        schedule: &InsertSchedule,
        state: &BatchState,
    ) -> Outcome<usize, Error> {
        let mut count = 0;
        for &id in schedule.levels().iter().flatten() {
            let Some(subject) = subjects.get(id) else {
                continue;
            };
            let metadata = subject.metadata();
            let Some(closure) = &metadata.closure_table else {
                continue;
            };
            let (child, parent) = match closure_ids(subject, subjects, state) {
                Ok(ids) => ids,
                Err(e) => return Outcome::Err(e),
            };
            let child = self.runner.prepare_value(child);
            let parent = parent.map(|value| self.runner.prepare_value(value));
            tracing::trace!(
                subject = %subject.describe(),
                table = closure.table_name,
                "Recording closure rows"
            );
            match self
                .runner
                .insert_into_closure_table(cx, closure, &child, parent.as_ref())
                .await
            {
                Outcome::Ok(()) => count += 1,
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        }
        Outcome::Ok(count)
    }

    /// Rewrite foreign keys that could not be written by the inserts,
    /// plus the caller's relation updates.
    #[tracing::instrument(level = "debug", skip_all)]
    async fn execute_fix_ups(
        &self,
        cx: &Cx,
        subjects: &SubjectCollection,
        schedule: &InsertSchedule,
        operations: &BatchOperations,
        state: &BatchState,
    ) -> Outcome<usize, Error> {
        let fix_ups = match self.collect_fix_ups(subjects, schedule, operations, state) {
            Ok(fix_ups) => fixup::merge(fix_ups),
            Err(e) => return Outcome::Err(e),
        };
        if fix_ups.is_empty() {
            return Outcome::Ok(0);
        }

        tracing::debug!(count = fix_ups.len(), "Executing relation fix-ups");
        for fix_up in &fix_ups {
            let values = self.prepare(&fix_up.values);
            let conditions = self.prepare(&fix_up.conditions);
            match self.runner.update(cx, fix_up.table, &values, &conditions).await {
                Outcome::Ok(_) => {}
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        }
        Outcome::Ok(fix_ups.len())
    }

    fn collect_fix_ups(
        &self,
        subjects: &SubjectCollection,
        schedule: &InsertSchedule,
        operations: &BatchOperations,
        state: &BatchState,
    ) -> Result<Vec<FixUp>, Error> {
        let ctx = FixUpContext {
            subjects,
            state,
            provider: self.metadata,
        };
        let mut fix_ups = Vec::new();

        // nullable keys inserted as NULL
        for deferred in &state.deferred {
            let Some(owner) = subjects.get(deferred.owner) else {
                continue;
            };
            let metadata = owner.metadata();
            let relation = metadata
                .find_relation(deferred.relation)
                .ok_or_else(|| invalid_relation(metadata.target, deferred.relation))?;
            let owner_ref = RelatedRef::Subject(deferred.owner);
            fix_ups.push(fixup::fix_up(
                &ctx,
                &FixUpRequest {
                    owner_metadata: metadata,
                    owner: &owner_ref,
                    relation,
                    related: Some(&deferred.related),
                    action: RelationAction::Set,
                },
            )?);
        }

        // inverse relations of inserted entities
        for &id in schedule.levels().iter().flatten() {
            let Some(subject) = subjects.get(id) else {
                continue;
            };
            let metadata = subject.metadata();
            let owner_ref = RelatedRef::Subject(id);
            for (_, relation) in metadata.relations_with_table() {
                if !relation.kind.is_inverse() {
                    continue;
                }
                let related = subject.entity().related(relation.property_name);
                for reference in related.refs() {
                    if is_fix_up_redundant(&ctx, &owner_ref, relation, reference) {
                        continue;
                    }
                    tracing::trace!(
                        subject = %subject.describe(),
                        relation = relation.property_name,
                        kind = fixup::describe_kind(relation.kind),
                        "Fixing up inverse relation"
                    );
                    fix_ups.push(fixup::fix_up(
                        &ctx,
                        &FixUpRequest {
                            owner_metadata: metadata,
                            owner: &owner_ref,
                            relation,
                            related: Some(reference),
                            action: RelationAction::Set,
                        },
                    )?);
                }
            }
        }

        for update in &operations.relation_updates {
            let metadata = fixup::target_metadata(&ctx, &update.owner, update.owner_target)?;
            let relation = metadata
                .find_relation(update.relation)
                .ok_or_else(|| invalid_relation(metadata.target, update.relation))?;
            fix_ups.push(fixup::fix_up(
                &ctx,
                &FixUpRequest {
                    owner_metadata: &metadata,
                    owner: &update.owner,
                    relation,
                    related: update.related.as_ref(),
                    action: update.action,
                },
            )?);
        }

        Ok(fix_ups)
    }

    #[tracing::instrument(level = "debug", skip_all, fields(mode = ?mode))]
    async fn execute_junction_ops(
        &self,
        cx: &Cx,
        subjects: &SubjectCollection,
        ops: &[JunctionOperation],
        state: &BatchState,
        mode: JunctionMode,
    ) -> Outcome<usize, Error> {
        if ops.is_empty() {
            return Outcome::Ok(0);
        }

        tracing::debug!(count = ops.len(), "Executing junction operations");
        let mut count = 0;
        for op in ops {
            let (table, row) = match junction::junction_row(subjects, state, op, mode) {
                Ok(row) => row,
                Err(e) => return Outcome::Err(e),
            };
            let row = self.prepare(&row);
            let outcome = match mode {
                JunctionMode::Insert => match self.runner.insert(cx, table, &row, None).await {
                    Outcome::Ok(_) => Outcome::Ok(()),
                    Outcome::Err(e) => Outcome::Err(e),
                    Outcome::Cancelled(r) => Outcome::Cancelled(r),
                    Outcome::Panicked(p) => Outcome::Panicked(p),
                },
                JunctionMode::Remove => match self.runner.delete(cx, table, &row).await {
                    Outcome::Ok(_) => Outcome::Ok(()),
                    Outcome::Err(e) => Outcome::Err(e),
                    Outcome::Cancelled(r) => Outcome::Cancelled(r),
                    Outcome::Panicked(p) => Outcome::Panicked(p),
                },
            };
            match outcome {
                Outcome::Ok(()) => count += 1,
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        }
        Outcome::Ok(count)
    }

    #[tracing::instrument(level = "debug", skip_all)]
    async fn execute_updates(
        &self,
        cx: &Cx,
        subjects: &mut SubjectCollection,
        state: &mut BatchState,
    ) -> Outcome<usize, Error> {
        let mut count = 0;
        for id in subjects.updates() {
            let Some(subject) = subjects.get(id) else {
                continue;
            };
            let rows = match values::collect_update_rows(subject, subjects, state) {
                Ok(rows) => rows,
                Err(e) => return Outcome::Err(e),
            };
            if rows.is_empty() {
                tracing::debug!(subject = %subject.describe(), "No changes, skipping update");
                continue;
            }

            let mut written = WrittenValues::new();
            for row in rows {
                let values = self.prepare(&row.values);
                let conditions = self.prepare(&row.conditions);
                tracing::trace!(table = row.table, columns = values.len(), "Updating row");
                match self.runner.update(cx, row.table, &values, &conditions).await {
                    Outcome::Ok(_) => {}
                    Outcome::Err(e) => return Outcome::Err(e),
                    Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                    Outcome::Panicked(p) => return Outcome::Panicked(p),
                }
                written.extend(row.written);
            }

            state.updated.insert(id, written);
            if let Some(subject) = subjects.get_mut(id) {
                subject.date = Some(state.now);
            }
            count += 1;
        }
        Outcome::Ok(count)
    }

    /// Delete removed entities, leaf table first within each entity.
    #[tracing::instrument(level = "debug", skip_all)]
    async fn execute_removes(
        &self,
        cx: &Cx,
        subjects: &SubjectCollection,
        removal_order: &[SubjectId],
    ) -> Outcome<usize, Error> {
        let mut count = 0;
        for &id in removal_order {
            let Some(subject) = subjects.get(id) else {
                continue;
            };
            let rows = match values::collect_remove_rows(subject) {
                Ok(rows) => rows,
                Err(e) => return Outcome::Err(e),
            };
            for (table, conditions) in rows {
                let conditions = self.prepare(&conditions);
                tracing::trace!(subject = %subject.describe(), table, "Deleting row");
                match self.runner.delete(cx, table, &conditions).await {
                    Outcome::Ok(_) => {}
                    Outcome::Err(e) => return Outcome::Err(e),
                    Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                    Outcome::Panicked(p) => return Outcome::Panicked(p),
                }
            }
            count += 1;
        }
        Outcome::Ok(count)
    }

    async fn rollback_quietly(&self, cx: &Cx) {
        tracing::debug!("Rolling back persist transaction");
        match self.runner.rollback_transaction(cx).await {
            Outcome::Ok(()) => {}
            Outcome::Err(e) => {
                tracing::warn!(error = %e, "Rollback failed, returning the original error");
            }
            Outcome::Cancelled(r) => {
                tracing::warn!(reason = ?r, "Rollback cancelled, returning the original error");
            }
            Outcome::Panicked(p) => {
                tracing::warn!(panic = ?p, "Rollback panicked, returning the original error");
            }
        }
    }

    fn broadcast(
        &self,
        subjects: &SubjectCollection,
        inserts: &[SubjectId],
        updates: &[SubjectId],
        removes: &[SubjectId],
        after: bool,
    ) -> Result<(), Error> {
        let inserts = pick(subjects, inserts);
        let updates = pick(subjects, updates);
        let removes = pick(subjects, removes);
        if after {
            self.broadcaster
                .broadcast_after_events_for_all(&inserts, &updates, &removes)
        } else {
            self.broadcaster
                .broadcast_before_events_for_all(&inserts, &updates, &removes)
        }
    }

    fn prepare(&self, values: &ColumnValues) -> ColumnValues {
        values
            .iter()
            .map(|(column, value)| (*column, self.runner.prepare_value(value.clone())))
            .collect()
    }
}

/// Reject batches asking for contradictory operations on one row.
///
/// A subject carries exactly one operation. A removed row must not also be
/// inserted or updated through another subject with the same identity.
fn validate_operations(subjects: &SubjectCollection) -> Result<(), Error> {
    if let Some(subject) = subjects
        .iter()
        .find(|s| s.must_be_inserted() && s.must_be_updated())
    {
        return Err(conflict(subject, "inserted", "updated"));
    }

    let mut removed: Vec<(&'static str, IdMap)> = Vec::new();
    for subject in subjects.iter().filter(|s| s.must_be_removed()) {
        if subject.must_be_inserted() || subject.must_be_updated() {
            let other = if subject.must_be_inserted() { "inserted" } else { "updated" };
            return Err(conflict(subject, "removed", other));
        }
        if let Some(ids) = subject.known_id() {
            removed.push((subject.metadata().root().table_name, ids));
        }
    }
    if removed.is_empty() {
        return Ok(());
    }

    for subject in subjects
        .iter()
        .filter(|s| s.must_be_inserted() || s.must_be_updated())
    {
        let Some(ids) = subject.known_id() else {
            continue;
        };
        let table = subject.metadata().root().table_name;
        if removed.iter().any(|(t, r)| *t == table && *r == ids) {
            let other = if subject.must_be_inserted() { "inserted" } else { "updated" };
            return Err(conflict(subject, "removed", other));
        }
    }
    Ok(())
}

fn conflict(subject: &Subject, first: &str, second: &str) -> Error {
    PersistError::new(
        PersistErrorKind::ConflictingOperation,
        format!("entity is both {first} and {second} in the same batch"),
    )
    .entity(subject.describe())
    .into()
}

fn invalid_relation(target: &str, relation: &str) -> Error {
    Error::persist(
        PersistErrorKind::InvalidRelation,
        format!("'{target}' has no relation '{relation}'"),
    )
}

/// The closure table ids of an inserted tree entity: its own id and its
/// parent's, if any.
fn closure_ids(
    subject: &Subject,
    subjects: &SubjectCollection,
    state: &BatchState,
) -> Result<(Value, Option<Value>), Error> {
    let metadata = subject.metadata();
    let reference = RelatedRef::Subject(subject.id());
    let child = metadata
        .primary_columns()
        .first()
        .and_then(|column| {
            values::resolve_property(subjects, state, &reference, column.property_name, Lookup::Settled)
        })
        .ok_or_else(|| values::missing_identity(subject, "record in a closure table"))?;

    let Some(relation) = metadata.tree_parent_relation() else {
        return Ok((child, None));
    };
    let parent = match subject.entity().related(relation.property_name) {
        Related::One(parent) => {
            let column = relation.join_columns.first().ok_or_else(|| {
                invalid_relation(metadata.target, relation.property_name)
            })?;
            let value = values::resolve_property(
                subjects,
                state,
                &parent,
                column.referenced_property,
                Lookup::Settled,
            )
            .ok_or_else(|| {
                PersistError::new(
                    PersistErrorKind::MissingIdentity,
                    "tree parent has no identity",
                )
                .entity(subject.describe())
            })?;
            Some(value)
        }
        _ => None,
    };
    Ok((child, parent))
}

/// Is the foreign key an inverse fix-up would write already in place?
///
/// True when the related entity is being removed, or when its own insert
/// in this batch already wrote the owner's key.
fn is_fix_up_redundant(
    ctx: &FixUpContext<'_>,
    owner: &RelatedRef,
    relation: &RelationMetadata,
    reference: &RelatedRef,
) -> bool {
    let RelatedRef::Subject(related) = reference else {
        return false;
    };
    let Some(target) = ctx.subjects.get(*related) else {
        return false;
    };
    if target.must_be_removed() {
        return true;
    }
    if !ctx.state.inserted.contains_key(related) {
        return false;
    }
    let table = target.metadata().table_name;
    !relation.inverse_join_columns.is_empty()
        && relation.inverse_join_columns.iter().all(|jc| {
            values::resolve_property(
                ctx.subjects,
                ctx.state,
                owner,
                jc.referenced_property,
                Lookup::Settled,
            )
            .is_some_and(|value| {
                ctx.state
                    .inserted_column_holds(*related, table, jc.column_name, &value)
            })
        })
}

/// Write values the batch generated back onto the entities.
fn write_back(subjects: &mut SubjectCollection, state: &BatchState) {
    for (id, written) in state.inserted.iter().chain(&state.updated) {
        let Some(subject) = subjects.get_mut(*id) else {
            continue;
        };
        let metadata = Arc::clone(subject.metadata());
        for level in metadata.tables() {
            for column in &level.columns {
                let reload = column.generated
                    || matches!(
                        column.role,
                        ColumnRole::CreateDate
                            | ColumnRole::UpdateDate
                            | ColumnRole::Version
                            | ColumnRole::TreeLevel
                    );
                if !reload {
                    continue;
                }
                if let Some(value) = written.get(column.property_name) {
                    subject
                        .entity_mut()
                        .set_value(column.property_name, value.clone());
                }
            }
        }
    }
}

fn pick<'s>(subjects: &'s SubjectCollection, ids: &[SubjectId]) -> Vec<&'s Subject> {
    ids.iter().filter_map(|id| subjects.get(*id)).collect()
}
