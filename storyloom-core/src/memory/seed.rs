//! Bulk seeding of story memory from an existing project.

use super::records::{CharacterUpdate, LocationUpdate, ThreadStatus, ThreadUpdate};
use super::store::StoryMemory;
use crate::project::{OutlineEntry, Project, ProjectEvent};
use std::collections::BTreeMap;
use tracing::debug;

impl StoryMemory {
    /// Reset, then import whatever the project already establishes.
    ///
    /// Outline summaries and events become timeline entries (chapter
    /// ordered, untagged rows last), events also update the characters they
    /// involve, immutable facts are registered, and threads, characters and
    /// locations are seeded. Missing fields are skipped.
    pub fn initialize_from_project(&mut self, project: &Project) {
        self.reset();

        let mut outline: Vec<&OutlineEntry> = project.outline.iter().collect();
        outline.sort_by_key(|entry| chapter_order(entry.chapter));
        for entry in outline {
            if let Some(summary) = entry.summary.clone() {
                self.append_timeline_events(entry.chapter, vec![summary]);
            }
        }

        let mut events: Vec<&ProjectEvent> = project.events.iter().collect();
        events.sort_by_key(|event| chapter_order(event.chapter));
        for event in events {
            let Some(description) = event.description.clone() else {
                continue;
            };
            self.append_timeline_events(event.chapter, vec![description.clone()]);

            for reference in &event.characters {
                let name = project.character_name(reference).unwrap_or(reference.as_str());
                let mut update = CharacterUpdate::knowing([description.clone()]);
                update.location = event.location.clone();
                self.upsert_character_state(name, update, event.chapter);
            }
        }

        self.register_established_facts(project.immutable_facts.iter().cloned());

        for thread in &project.threads {
            let Some(name) = thread.name() else {
                continue;
            };
            let mut updates = BTreeMap::new();
            updates.insert(
                name.to_string(),
                ThreadUpdate::Detailed {
                    state: thread.status.clone(),
                    note: None,
                    importance: thread.importance.clone(),
                },
            );
            // Stamp the opening chapter, then the closing one for resolved threads.
            let resolved = thread
                .status
                .as_deref()
                .is_some_and(|s| ThreadStatus::from(s).is_resolved());
            let stamp = if resolved {
                thread.closed_chapter.or(thread.opened_chapter)
            } else {
                thread.opened_chapter
            };
            self.merge_plot_threads(updates, stamp);
            if let Some(opened) = thread.opened_chapter {
                self.set_thread_introduced(name, opened);
            }
        }

        for character in &project.characters {
            let Some(name) = character.name.as_deref() else {
                continue;
            };
            let update = CharacterUpdate {
                knowledge: character.knowledge.clone(),
                location: character.location.clone(),
                relationships: character.relationships.clone(),
                notes: character.notes.clone(),
            };
            self.upsert_character_state(name, update, None);
        }

        for location in &project.locations {
            let Some(name) = location.name.clone() else {
                continue;
            };
            let mut updates = BTreeMap::new();
            updates.insert(name, LocationUpdate::new(location.details.clone()));
            self.merge_locations(updates, location.first_appearance);
        }

        debug!(stats = ?self.stats(), "story memory seeded from project");
    }
}

/// Sort key placing untagged rows after every chapter.
fn chapter_order(chapter: Option<u32>) -> (bool, u32) {
    (chapter.is_none(), chapter.unwrap_or(0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::project::{ProjectCharacter, ProjectLocation, ProjectThread};

    fn sample_project() -> Project {
        serde_json::from_str(
            r#"{
                "outline": [
                    {"chapter": 2, "summary": "The heist goes wrong"},
                    {"chapter": 1, "summary": "Mara returns home"},
                    {"chapter": 3}
                ],
                "events": [
                    {"chapter": 2, "description": "Ilya betrays the crew",
                     "significance": "major", "characters": ["c2", "Sen"], "location": "Vault"},
                    {"description": "Undated rumour"},
                    {"chapter": 1}
                ],
                "immutableFacts": ["Mara is left-handed", "Mara is left-handed"],
                "threads": [
                    {"title": "The missing ledger", "openedChapter": 1, "status": "open", "importance": "high"},
                    {"id": "debt", "openedChapter": 1, "closedChapter": 3, "status": "resolved"},
                    {"status": "open"}
                ],
                "characters": [
                    {"id": "c1", "name": "Mara", "knowledge": ["lockpicking"], "location": "Harbor"},
                    {"id": "c2", "name": "Ilya"},
                    {"id": "c3"}
                ],
                "locations": [
                    {"name": "Harbor", "firstAppearance": 1, "details": ["foggy"]},
                    {"details": ["nameless"]}
                ]
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn test_empty_project_yields_empty_memory() {
        let mut memory = StoryMemory::new();
        memory.register_established_facts(["stale"]);

        memory.initialize_from_project(&Project::default());

        assert!(memory.timeline().is_empty());
        assert!(memory.character_states().is_empty());
        assert!(memory.established_facts().is_empty());
        assert!(memory.plot_threads().is_empty());
        assert!(memory.locations().is_empty());
    }

    #[test]
    fn test_seeding_orders_timeline_by_chapter() {
        let mut memory = StoryMemory::new();
        memory.initialize_from_project(&sample_project());

        let rows: Vec<_> = memory
            .timeline()
            .iter()
            .map(|e| (e.chapter_number, e.events[0].as_str()))
            .collect();
        assert_eq!(
            rows,
            vec![
                (Some(1), "Mara returns home"),
                (Some(2), "The heist goes wrong"),
                (Some(2), "Ilya betrays the crew"),
                (None, "Undated rumour"),
            ]
        );
    }

    #[test]
    fn test_events_update_involved_characters() {
        let mut memory = StoryMemory::new();
        memory.initialize_from_project(&sample_project());

        let ilya = memory.character("Ilya").unwrap();
        assert_eq!(ilya.knowledge, vec!["Ilya betrays the crew"]);
        assert_eq!(ilya.location.as_deref(), Some("Vault"));
        assert_eq!(ilya.last_seen, Some(2));

        // Unknown references are used as names.
        assert!(memory.character("Sen").is_some());

        let mara = memory.character("Mara").unwrap();
        assert_eq!(mara.knowledge, vec!["lockpicking"]);
        assert_eq!(mara.last_seen, None);
    }

    #[test]
    fn test_seeded_threads_facts_locations() {
        let mut memory = StoryMemory::new();
        memory.initialize_from_project(&sample_project());

        assert_eq!(memory.established_facts(), &["Mara is left-handed"]);

        let ledger = &memory.plot_threads()["The missing ledger"];
        assert!(ledger.status.is_open());
        assert_eq!(ledger.importance.as_deref(), Some("high"));
        assert_eq!(ledger.introduced, Some(1));

        let debt = &memory.plot_threads()["debt"];
        assert_eq!(debt.status, ThreadStatus::Resolved);
        assert_eq!(debt.resolved, Some(3));
        assert_eq!(debt.introduced, Some(1));
        assert_eq!(memory.plot_threads().len(), 2);

        assert_eq!(memory.locations().len(), 1);
        assert_eq!(memory.locations()["Harbor"].introduced, Some(1));
    }

    #[test]
    fn test_seeding_replaces_previous_memory() {
        let mut memory = StoryMemory::new();
        memory.initialize_from_project(&sample_project());

        let project = Project {
            characters: vec![ProjectCharacter { name: Some("Solo".into()), ..Default::default() }],
            locations: vec![ProjectLocation { name: Some("Moon".into()), ..Default::default() }],
            threads: vec![ProjectThread { title: Some("Quiet".into()), ..Default::default() }],
            ..Default::default()
        };
        memory.initialize_from_project(&project);

        assert_eq!(memory.character_states().len(), 1);
        assert!(memory.timeline().is_empty());
        assert!(memory.plot_threads()["Quiet"].status.is_open());
    }
}
