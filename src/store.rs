//! The event-store contract the group engine replays from, and an
//! in-memory implementation of it.

use std::{fs, path::Path};

use anyhow::{Context, Result};
use parking_lot::RwLock;
use tracing::warn;

use crate::event::Event;

/// Queries the group engine needs from an event store.
pub trait EventSource {
    /// Every stored event of `kind`, lazily.
    fn events_of_kind(&self, kind: u32) -> Result<Box<dyn Iterator<Item = Event> + '_>>;

    /// Events of any of `kinds` tagged `["h", group_id]`, newest first,
    /// at most `limit` of them.
    fn group_events(&self, kinds: &[u32], group_id: &str, limit: usize) -> Result<Vec<Event>>;
}

/// Event store held in memory. Duplicate ids are ignored on ingest.
#[derive(Default)]
pub struct MemoryStore {
    events: RwLock<Vec<Event>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `ev` unless an event with the same id is already present.
    /// Returns whether it was added.
    pub fn ingest(&self, ev: Event) -> bool {
        let mut events = self.events.write();
        if events.iter().any(|e| e.id == ev.id) {
            return false;
        }
        events.push(ev);
        true
    }

    /// Ingest every `*.json` event file directly under `dir`. Files that
    /// do not parse as events are skipped with a warning. With `verify_sig`
    /// set, events failing signature verification are skipped too.
    pub fn load_dir(&self, dir: &Path, verify_sig: bool) -> Result<usize> {
        let mut paths = fs::read_dir(dir)
            .with_context(|| format!("reading {}", dir.display()))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
            .collect::<Vec<_>>();
        paths.sort();
        let mut added = 0;
        for path in paths {
            let data = fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            let ev: Event = match serde_json::from_str(&data) {
                Ok(ev) => ev,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping unparseable event file");
                    continue;
                }
            };
            if verify_sig {
                if let Err(e) = ev.verify() {
                    warn!(id = %ev.id, error = %e, "skipping event with bad signature");
                    continue;
                }
            }
            if self.ingest(ev) {
                added += 1;
            }
        }
        Ok(added)
    }

    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.read().is_empty()
    }
}

impl EventSource for MemoryStore {
    fn events_of_kind(&self, kind: u32) -> Result<Box<dyn Iterator<Item = Event> + '_>> {
        let matching: Vec<Event> = self
            .events
            .read()
            .iter()
            .filter(|e| e.kind == kind)
            .cloned()
            .collect();
        Ok(Box::new(matching.into_iter()))
    }

    fn group_events(&self, kinds: &[u32], group_id: &str, limit: usize) -> Result<Vec<Event>> {
        let mut matching: Vec<Event> = self
            .events
            .read()
            .iter()
            .filter(|e| kinds.contains(&e.kind) && e.tags_named("h").any(|t| t.value() == Some(group_id)))
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        matching.truncate(limit);
        Ok(matching)
    }
}
