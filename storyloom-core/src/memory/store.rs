//! The story memory store and its mutators.

use super::records::{
    CharacterState, CharacterUpdate, ItemRecord, LocationRecord, LocationUpdate, PlotThread,
    ThreadStatus, ThreadUpdate, TimelineEntry,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// The running record of what the manuscript has established.
///
/// One instance per open project. All mutators are pure bookkeeping; the
/// store never calls the oracle.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StoryMemory {
    timeline: Vec<TimelineEntry>,
    character_states: BTreeMap<String, CharacterState>,
    established_facts: Vec<String>,
    plot_threads: BTreeMap<String, PlotThread>,
    locations: BTreeMap<String, LocationRecord>,
    items: BTreeMap<String, ItemRecord>,
}

/// Collection sizes, for logs and reports.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryStats {
    pub timeline: usize,
    pub characters: usize,
    pub facts: usize,
    pub plot_threads: usize,
    pub locations: usize,
    pub items: usize,
}

impl StoryMemory {
    /// Create a new empty story memory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Clear every collection (used when switching projects).
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Restore invariants on data that did not come through the mutators.
    pub(crate) fn normalized(mut self) -> Self {
        self.established_facts = dedup_preserving_order(self.established_facts);
        self
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn timeline(&self) -> &[TimelineEntry] {
        &self.timeline
    }

    pub fn character_states(&self) -> &BTreeMap<String, CharacterState> {
        &self.character_states
    }

    pub fn character(&self, name: &str) -> Option<&CharacterState> {
        self.character_states.get(name)
    }

    pub fn established_facts(&self) -> &[String] {
        &self.established_facts
    }

    pub fn plot_threads(&self) -> &BTreeMap<String, PlotThread> {
        &self.plot_threads
    }

    /// Threads whose status is `open`.
    pub fn open_threads(&self) -> impl Iterator<Item = (&String, &PlotThread)> {
        self.plot_threads.iter().filter(|(_, t)| t.status.is_open())
    }

    pub fn locations(&self) -> &BTreeMap<String, LocationRecord> {
        &self.locations
    }

    pub fn items(&self) -> &BTreeMap<String, ItemRecord> {
        &self.items
    }

    pub fn is_empty(&self) -> bool {
        self.stats() == MemoryStats::default()
    }

    pub fn stats(&self) -> MemoryStats {
        MemoryStats {
            timeline: self.timeline.len(),
            characters: self.character_states.len(),
            facts: self.established_facts.len(),
            plot_threads: self.plot_threads.len(),
            locations: self.locations.len(),
            items: self.items.len(),
        }
    }

    // =========================================================================
    // Mutators
    // =========================================================================

    /// Create or update a character.
    ///
    /// Knowledge and notes are unioned by exact match, a new location
    /// overwrites the old one, relationships are shallow-merged and
    /// `last_seen` only ever moves forward.
    pub fn upsert_character_state(
        &mut self,
        name: &str,
        update: CharacterUpdate,
        chapter: Option<u32>,
    ) {
        let name = name.trim();
        if name.is_empty() {
            return;
        }

        let state = self.character_states.entry(name.to_string()).or_default();
        union_into(&mut state.knowledge, update.knowledge);
        union_into(&mut state.notes, update.notes);

        if let Some(location) = update.location.filter(|l| !l.trim().is_empty()) {
            state.location = Some(location);
        }

        for (other, relation) in update.relationships {
            state.relationships.insert(other, relation);
        }

        state.last_seen = state.last_seen.max(chapter);
    }

    /// Append one timeline entry holding `events`. Returns false when there
    /// was nothing to record.
    pub fn append_timeline_events(&mut self, chapter: Option<u32>, events: Vec<String>) -> bool {
        let events: Vec<String> = events.into_iter().filter(|e| !e.trim().is_empty()).collect();
        if events.is_empty() {
            return false;
        }

        self.timeline.push(TimelineEntry::new(chapter, events));
        true
    }

    /// Register facts not already known (exact string match). Returns how many were added.
    pub fn register_established_facts(
        &mut self,
        facts: impl IntoIterator<Item = impl Into<String>>,
    ) -> usize {
        let before = self.established_facts.len();
        for fact in facts {
            let fact = fact.into();
            if fact.trim().is_empty() || self.established_facts.contains(&fact) {
                continue;
            }
            self.established_facts.push(fact);
        }
        self.established_facts.len() - before
    }

    /// Merge plot thread changes.
    ///
    /// Unseen threads are created as open. A transition to `resolved` stamps
    /// the resolving chapter; moving away from `resolved` clears it.
    pub fn merge_plot_threads(
        &mut self,
        updates: BTreeMap<String, ThreadUpdate>,
        chapter: Option<u32>,
    ) {
        for (name, update) in updates {
            let name = name.trim();
            if name.is_empty() {
                continue;
            }

            let thread = self
                .plot_threads
                .entry(name.to_string())
                .or_insert_with(|| PlotThread {
                    introduced: chapter,
                    ..PlotThread::default()
                });

            let (state, note, importance) = match update {
                ThreadUpdate::Status(status) => (Some(status), None, None),
                ThreadUpdate::Detailed {
                    state,
                    note,
                    importance,
                } => (state, note, importance),
            };

            if let Some(state) = state.filter(|s| !s.trim().is_empty()) {
                set_thread_status(thread, ThreadStatus::from(state.as_str()), chapter);
            }

            if let Some(note) = note {
                union_into(&mut thread.notes, [note]);
            }

            if importance.is_some() {
                thread.importance = importance;
            }
        }
    }

    /// Merge location details, creating locations on first sight.
    pub fn merge_locations(
        &mut self,
        locations: BTreeMap<String, LocationUpdate>,
        chapter: Option<u32>,
    ) {
        for (name, update) in locations {
            let name = name.trim();
            if name.is_empty() {
                continue;
            }

            let record = self
                .locations
                .entry(name.to_string())
                .or_insert_with(|| LocationRecord {
                    introduced: chapter,
                    details: Vec::new(),
                });
            union_into(&mut record.details, update.details);
        }
    }

    /// Merge item metadata, last write wins per key.
    pub fn merge_items(
        &mut self,
        items: BTreeMap<String, Map<String, Value>>,
        chapter: Option<u32>,
    ) {
        for (name, attributes) in items {
            let name = name.trim();
            if name.is_empty() {
                continue;
            }

            let record = self.items.entry(name.to_string()).or_default();
            for (key, value) in attributes {
                record.attributes.insert(key, value);
            }
            record.last_seen = record.last_seen.max(chapter);
        }
    }

    /// Backdate a thread's introduction (seeding knows the opening chapter).
    pub(crate) fn set_thread_introduced(&mut self, name: &str, chapter: u32) {
        if let Some(thread) = self.plot_threads.get_mut(name) {
            thread.introduced = Some(chapter);
        }
    }

    // =========================================================================
    // Wholesale replacement (compression)
    // =========================================================================

    pub(crate) fn replace_timeline(&mut self, timeline: Vec<TimelineEntry>) {
        self.timeline = timeline;
    }

    pub(crate) fn replace_character_states(&mut self, states: BTreeMap<String, CharacterState>) {
        self.character_states = states;
    }

    pub(crate) fn replace_established_facts(&mut self, facts: Vec<String>) {
        self.established_facts = dedup_preserving_order(facts);
    }

    pub(crate) fn replace_plot_threads(&mut self, threads: BTreeMap<String, PlotThread>) {
        self.plot_threads = threads;
    }

    pub(crate) fn replace_locations(&mut self, locations: BTreeMap<String, LocationRecord>) {
        self.locations = locations;
    }

    pub(crate) fn replace_items(&mut self, items: BTreeMap<String, ItemRecord>) {
        self.items = items;
    }
}

fn set_thread_status(thread: &mut PlotThread, status: ThreadStatus, chapter: Option<u32>) {
    if status.is_resolved() {
        if !thread.status.is_resolved() {
            thread.resolved = chapter;
        }
    } else {
        thread.resolved = None;
    }
    thread.status = status;
}

/// Append items not already present (exact match), skipping blanks.
fn union_into(target: &mut Vec<String>, items: impl IntoIterator<Item = String>) {
    for item in items {
        if !item.trim().is_empty() && !target.contains(&item) {
            target.push(item);
        }
    }
}

fn dedup_preserving_order(items: Vec<String>) -> Vec<String> {
    let mut out = Vec::with_capacity(items.len());
    union_into(&mut out, items);
    out
}
