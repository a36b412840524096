//! In-memory mapping of container identity to last-known state.
//!
//! The store has a single writer (the reconciler) and hands out cloned
//! records to everyone else, so it needs no locking of its own.

use chrono::{DateTime, Duration as TimeDelta, Utc};
use std::collections::HashMap;

use super::model::{Container, ContainerEvent, ContainerState, StateRecord, Transition};

/// Outcome of applying one event against the store.
#[derive(Debug)]
pub enum Upsert {
    /// The event moved the record forward. `gap` is set when the sequence
    /// number skipped past the expected next value for a tracked container,
    /// meaning events were lost and a resync is due.
    Accepted { transition: Transition, gap: bool },
    /// Sequence number not beyond the stored one; dropped without side effects.
    Duplicate,
}

#[derive(Debug, thiserror::Error)]
#[error("container {container_id} transitioned to exited without an exit code")]
pub struct IntegrityError {
    pub container_id: String,
}

pub struct SnapshotStore {
    records: HashMap<String, StateRecord>,
    restart_window: TimeDelta,
    removed_grace: TimeDelta,
    integrity_errors: u64,
}

impl SnapshotStore {
    pub fn new(restart_window: std::time::Duration, removed_grace: std::time::Duration) -> Self {
        Self {
            records: HashMap::new(),
            restart_window: TimeDelta::from_std(restart_window).unwrap_or(TimeDelta::MAX),
            removed_grace: TimeDelta::from_std(removed_grace).unwrap_or(TimeDelta::MAX),
            integrity_errors: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Running tally of malformed events seen (§ data integrity). These are
    /// logged by the caller and never mutate a record.
    pub fn integrity_errors(&self) -> u64 {
        self.integrity_errors
    }

    /// Point-in-time copy of a record, never a live reference.
    pub fn get(&self, id: &str) -> Option<StateRecord> {
        self.records.get(id).cloned()
    }

    /// Apply one event. Enforces per-container sequence monotonicity and the
    /// exit-code invariant before any mutation happens.
    pub fn upsert(&mut self, event: &ContainerEvent) -> Result<Upsert, IntegrityError> {
        let target = event.kind.target_state();

        if target == Some(ContainerState::Exited) && event.exit_code.is_none() {
            self.integrity_errors += 1;
            return Err(IntegrityError {
                container_id: event.container_id.clone(),
            });
        }

        let mut gap = false;
        if let Some(record) = self.records.get(&event.container_id) {
            if event.seq <= record.seq {
                return Ok(Upsert::Duplicate);
            }
            gap = event.seq > record.seq + 1;
        }

        let record = self
            .records
            .entry(event.container_id.clone())
            .or_insert_with(|| {
                // First sighting through the stream rather than a snapshot.
                let container = Container {
                    id: event.container_id.clone(),
                    name: event.name.clone(),
                    image: event.image.clone(),
                    created_at: event.at,
                };
                StateRecord::seeded(container, ContainerState::Unknown, event.at)
            });

        let from = record.state;
        let to = target.unwrap_or(from);
        record.seq = event.seq;
        // Targetless events (stop, oom, health pings) report on a container
        // without moving it; they must not disturb the transition time or
        // the exit code the preceding die recorded.
        if let Some(to) = target {
            record.state = to;
            record.last_transition = event.at;
            match to {
                ContainerState::Exited => record.exit_code = event.exit_code,
                ContainerState::Running => record.exit_code = None,
                _ => {}
            }
            if to == ContainerState::Removed {
                record.removed_at = Some(event.at);
            }
            if to == ContainerState::Restarting {
                record.restart_times.push_back(event.at);
            }
        }
        let window_start = event.at - self.restart_window;
        while record
            .restart_times
            .front()
            .is_some_and(|t| *t < window_start)
        {
            record.restart_times.pop_front();
        }

        let transition = Transition {
            container_id: event.container_id.clone(),
            name: record.container.name.clone(),
            from,
            to,
            kind: event.kind,
            exit_code: event.exit_code,
            health: event.health.clone(),
            at: event.at,
            restarts_in_window: record.restart_times.len(),
        };

        Ok(Upsert::Accepted { transition, gap })
    }

    /// Wholesale resync after stream loss. Restart windows survive for
    /// containers present in both the old and new sets; sequence numbers are
    /// reset to the fresh subscription's baseline. Containers the snapshot no
    /// longer lists are marked removed and kept for the grace period.
    pub fn replace_all(
        &mut self,
        snapshot: Vec<(Container, ContainerState)>,
        now: DateTime<Utc>,
    ) {
        self.merge_snapshot(snapshot, now, true);
    }

    /// Periodic reconciliation pass while the stream is still live. Same
    /// merge as `replace_all` but sequence numbers are preserved so the
    /// ongoing subscription keeps lining up with the store.
    pub fn reconcile(&mut self, snapshot: Vec<(Container, ContainerState)>, now: DateTime<Utc>) {
        self.merge_snapshot(snapshot, now, false);
    }

    fn merge_snapshot(
        &mut self,
        snapshot: Vec<(Container, ContainerState)>,
        now: DateTime<Utc>,
        reset_seq: bool,
    ) {
        let mut merged = HashMap::with_capacity(snapshot.len());
        for (container, state) in snapshot {
            let id = container.id.clone();
            let record = match self.records.remove(&id) {
                Some(old) => {
                    let changed = old.state != state;
                    StateRecord {
                        container,
                        state,
                        exit_code: if state == ContainerState::Exited {
                            old.exit_code
                        } else {
                            None
                        },
                        last_transition: if changed { now } else { old.last_transition },
                        seq: if reset_seq { 0 } else { old.seq },
                        restart_times: old.restart_times,
                        removed_at: None,
                    }
                }
                None => StateRecord::seeded(container, state, now),
            };
            merged.insert(id, record);
        }

        // Anything only the old set knew about disappeared while we were not
        // watching; keep it around as removed until the grace period ends so
        // late events still match a record.
        for (id, mut old) in self.records.drain() {
            if old.removed_at.is_none() {
                old.state = ContainerState::Removed;
                old.removed_at = Some(now);
                old.last_transition = now;
            }
            if reset_seq {
                old.seq = 0;
            }
            merged.insert(id, old);
        }

        self.records = merged;
        self.purge(now);
    }

    /// Drop removed records whose grace period has elapsed.
    pub fn purge(&mut self, now: DateTime<Utc>) {
        let grace = self.removed_grace;
        self.records.retain(|_, record| match record.removed_at {
            Some(removed_at) => now - removed_at <= grace,
            None => true,
        });
    }
}
