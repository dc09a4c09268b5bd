// Pending Event Map
//
// Holds at most one pending mutation per row key for one table and
// hands them back in an order that is safe to replay.

use std::collections::HashMap;

use tracing::{debug, warn};

use super::{MergedEvent, Transition};
use crate::log::EventKind;

/// Two live rows ended up under the same key.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("key conflict in `{schema}`.`{table}`: two live rows share key `{key}`")]
pub struct KeyConflict {
    pub schema: String,
    pub table: String,
    pub key: String,
}

#[derive(Debug, Default)]
pub struct EventMap {
    entries: HashMap<String, MergedEvent>,
    /// Deletes pushed out of their slot by a re-keyed row. Replayed first.
    tombstones: Vec<MergedEvent>,
    invalid: u64,
}

impl EventMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one event into the map.
    pub fn apply(&mut self, event: MergedEvent) -> Result<Transition, KeyConflict> {
        let Some(mut pending) = self.entries.remove(&event.old_key) else {
            self.insert(event)?;
            return Ok(Transition::Added);
        };

        let incoming_kind = event.kind;
        let key = event.old_key.clone();
        let transition = pending.merge(event);
        match transition {
            Transition::Invalid => {
                self.invalid += 1;
                warn!(
                    schema = %pending.schema,
                    table = %pending.table,
                    key = %key,
                    pending = ?pending.kind,
                    incoming = ?incoming_kind,
                    "invalid merge transition, event ignored"
                );
            }
            transition => {
                debug!(key = %key, ?transition, kind = ?pending.kind, "merged event");
            }
        }

        if !pending.deleted {
            self.insert(pending)?;
        }
        Ok(transition)
    }

    /// Store an event under its map key, resolving collisions.
    fn insert(&mut self, event: MergedEvent) -> Result<(), KeyConflict> {
        let key = event.map_key().to_owned();
        match self.entries.remove(&key) {
            None => {}
            Some(occupant) if occupant.kind == EventKind::Delete => {
                self.tombstones.push(occupant);
            }
            Some(occupant) if event.kind == EventKind::Delete => {
                self.entries.insert(key, occupant);
                self.tombstones.push(event);
                return Ok(());
            }
            Some(occupant) => {
                let conflict = KeyConflict {
                    schema: event.schema.clone(),
                    table: event.table.clone(),
                    key: key.clone(),
                };
                self.entries.insert(key, occupant);
                return Err(conflict);
            }
        }
        self.entries.insert(key, event);
        Ok(())
    }

    /// Take every pending event: displaced deletes, then deletes, updates
    /// and inserts, each group ordered by key.
    pub fn drain(&mut self) -> Vec<MergedEvent> {
        let mut pending: Vec<_> = self.entries.drain().map(|(_, event)| event).collect();
        pending.sort_by(|a, b| {
            kind_rank(a.kind)
                .cmp(&kind_rank(b.kind))
                .then_with(|| a.map_key().cmp(b.map_key()))
        });

        let mut events = std::mem::take(&mut self.tombstones);
        events.extend(pending);
        events
    }

    #[cfg(test)]
    fn get(&self, key: &str) -> Option<&MergedEvent> {
        self.entries.get(key)
    }

    /// Pending events, displaced deletes included.
    pub fn len(&self) -> usize {
        self.entries.len() + self.tombstones.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Invalid transitions seen since the map was created.
    pub fn invalid_transitions(&self) -> u64 {
        self.invalid
    }
}

fn kind_rank(kind: EventKind) -> u8 {
    match kind {
        EventKind::Delete => 0,
        EventKind::Update => 1,
        EventKind::Insert => 2,
    }
}
