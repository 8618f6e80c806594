//! Lifecycle broadcasts around a persist batch.

use crate::subject::Subject;
use orm_persist_core::Error;

/// Receives lifecycle notifications once before and once after a batch.
///
/// An `Err` from either method aborts the batch like any other failure.
pub trait Broadcaster: Send + Sync {
    fn broadcast_before_events_for_all(
        &self,
        inserts: &[&Subject],
        updates: &[&Subject],
        removes: &[&Subject],
    ) -> Result<(), Error>;

    fn broadcast_after_events_for_all(
        &self,
        inserts: &[&Subject],
        updates: &[&Subject],
        removes: &[&Subject],
    ) -> Result<(), Error>;
}

/// A broadcaster that does nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopBroadcaster;

impl Broadcaster for NoopBroadcaster {
    fn broadcast_before_events_for_all(
        &self,
        _inserts: &[&Subject],
        _updates: &[&Subject],
        _removes: &[&Subject],
    ) -> Result<(), Error> {
        Ok(())
    }

    fn broadcast_after_events_for_all(
        &self,
        _inserts: &[&Subject],
        _updates: &[&Subject],
        _removes: &[&Subject],
    ) -> Result<(), Error> {
        Ok(())
    }
}

/// Entity lifecycle events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistEvent {
    BeforeInsert,
    AfterInsert,
    BeforeUpdate,
    AfterUpdate,
    BeforeRemove,
    AfterRemove,
}

type ListenerFn = Box<dyn Fn(&Subject) -> Result<(), Error> + Send + Sync>;

/// A broadcaster dispatching each subject to registered per-event
/// callbacks.
#[derive(Default)]
pub struct ListenerBroadcaster {
    before_insert: Vec<ListenerFn>,
    after_insert: Vec<ListenerFn>,
    before_update: Vec<ListenerFn>,
    after_update: Vec<ListenerFn>,
    before_remove: Vec<ListenerFn>,
    after_remove: Vec<ListenerFn>,
}

impl std::fmt::Debug for ListenerBroadcaster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerBroadcaster")
            .field("before_insert", &self.before_insert.len())
            .field("after_insert", &self.after_insert.len())
            .field("before_update", &self.before_update.len())
            .field("after_update", &self.after_update.len())
            .field("before_remove", &self.before_remove.len())
            .field("after_remove", &self.after_remove.len())
            .finish()
    }
}

impl ListenerBroadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callback for `event`.
    pub fn on(
        &mut self,
        event: PersistEvent,
        f: impl Fn(&Subject) -> Result<(), Error> + Send + Sync + 'static,
    ) {
        self.listeners_mut(event).push(Box::new(f));
    }

    /// Builder form of [`on`](Self::on).
    #[must_use]
    pub fn with(
        mut self,
        event: PersistEvent,
        f: impl Fn(&Subject) -> Result<(), Error> + Send + Sync + 'static,
    ) -> Self {
        self.on(event, f);
        self
    }

    fn listeners(&self, event: PersistEvent) -> &[ListenerFn] {
        match event {
            PersistEvent::BeforeInsert => &self.before_insert,
            PersistEvent::AfterInsert => &self.after_insert,
            PersistEvent::BeforeUpdate => &self.before_update,
            PersistEvent::AfterUpdate => &self.after_update,
            PersistEvent::BeforeRemove => &self.before_remove,
            PersistEvent::AfterRemove => &self.after_remove,
        }
    }

    fn listeners_mut(&mut self, event: PersistEvent) -> &mut Vec<ListenerFn> {
        match event {
            PersistEvent::BeforeInsert => &mut self.before_insert,
            PersistEvent::AfterInsert => &mut self.after_insert,
            PersistEvent::BeforeUpdate => &mut self.before_update,
            PersistEvent::AfterUpdate => &mut self.after_update,
            PersistEvent::BeforeRemove => &mut self.before_remove,
            PersistEvent::AfterRemove => &mut self.after_remove,
        }
    }

    fn fire(&self, event: PersistEvent, subjects: &[&Subject]) -> Result<(), Error> {
        let listeners = self.listeners(event);
        if listeners.is_empty() {
            return Ok(());
        }
        tracing::trace!(event = ?event, subjects = subjects.len(), "Firing listeners");
        for &subject in subjects {
            for listener in listeners {
                listener(subject)?;
            }
        }
        Ok(())
    }
}

impl Broadcaster for ListenerBroadcaster {
    fn broadcast_before_events_for_all(
        &self,
        inserts: &[&Subject],
        updates: &[&Subject],
        removes: &[&Subject],
    ) -> Result<(), Error> {
        self.fire(PersistEvent::BeforeInsert, inserts)?;
        self.fire(PersistEvent::BeforeUpdate, updates)?;
        self.fire(PersistEvent::BeforeRemove, removes)
    }

    fn broadcast_after_events_for_all(
        &self,
        inserts: &[&Subject],
        updates: &[&Subject],
        removes: &[&Subject],
    ) -> Result<(), Error> {
        self.fire(PersistEvent::AfterInsert, inserts)?;
        self.fire(PersistEvent::AfterUpdate, updates)?;
        self.fire(PersistEvent::AfterRemove, removes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::DynamicEntity;
    use orm_persist_core::{ColumnMetadata, EntityMetadata};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn subject() -> Subject {
        let meta = Arc::new(
            EntityMetadata::new("Hero", "heroes")
                .column(ColumnMetadata::new("id", "id").primary().generated()),
        );
        Subject::for_insert(meta, DynamicEntity::new())
    }

    #[test]
    fn test_listeners_fire_per_subject() {
        let count = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&count);
        let broadcaster = ListenerBroadcaster::new().with(PersistEvent::BeforeInsert, move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let a = subject();
        let b = subject();
        broadcaster
            .broadcast_before_events_for_all(&[&a, &b], &[], &[])
            .unwrap();
        broadcaster
            .broadcast_after_events_for_all(&[&a, &b], &[], &[])
            .unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_failing_listener_stops_broadcast() {
        let broadcaster = ListenerBroadcaster::new()
            .with(PersistEvent::BeforeRemove, |_| {
                Err(Error::Listener("refused".to_string()))
            });
        let a = subject();
        let err = broadcaster
            .broadcast_before_events_for_all(&[], &[], &[&a])
            .unwrap_err();
        assert!(matches!(err, Error::Listener(_)));
        assert!(
            broadcaster
                .broadcast_before_events_for_all(&[&a], &[], &[])
                .is_ok()
        );
    }

    #[test]
    fn test_noop_broadcaster() {
        let a = subject();
        assert!(NoopBroadcaster.broadcast_before_events_for_all(&[&a], &[&a], &[&a]).is_ok());
        assert!(NoopBroadcaster.broadcast_after_events_for_all(&[], &[], &[]).is_ok());
        assert!(format!("{:?}", ListenerBroadcaster::new()).contains("before_insert"));
    }
}
