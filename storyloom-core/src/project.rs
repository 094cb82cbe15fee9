//! Project snapshot consumed by the orchestrator.
//!
//! The editor hands over its project as JSON. Every field is optional and
//! unknown fields are ignored. Malformed fields fall back to their defaults.

use crate::parse::{lenient_chapter, lenient_list, lenient_object, lenient_string, lenient_strings};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::Path;

/// Everything the orchestrator reads from an open project.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Project {
    #[serde(deserialize_with = "lenient_string")]
    pub title: Option<String>,
    #[serde(deserialize_with = "lenient_string")]
    pub genre: Option<String>,
    #[serde(deserialize_with = "lenient_string")]
    pub tone: Option<String>,
    #[serde(deserialize_with = "lenient_list")]
    pub outline: Vec<OutlineEntry>,
    #[serde(deserialize_with = "lenient_list")]
    pub events: Vec<ProjectEvent>,
    #[serde(deserialize_with = "lenient_strings")]
    pub immutable_facts: Vec<String>,
    #[serde(deserialize_with = "lenient_list")]
    pub threads: Vec<ProjectThread>,
    #[serde(deserialize_with = "lenient_list")]
    pub characters: Vec<ProjectCharacter>,
    #[serde(deserialize_with = "lenient_list")]
    pub locations: Vec<ProjectLocation>,
    pub manuscript: ManuscriptNode,
}

impl Project {
    /// Read a project snapshot from a JSON file.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, crate::SessionError> {
        let content = tokio::fs::read_to_string(path).await?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Write the project snapshot as pretty JSON.
    pub async fn save(&self, path: impl AsRef<Path>) -> Result<(), crate::SessionError> {
        let content = serde_json::to_string_pretty(self)?;
        tokio::fs::write(path, content).await?;
        Ok(())
    }

    /// Resolve a character reference (id or name) to a display name.
    pub fn character_name(&self, reference: &str) -> Option<&str> {
        self.characters
            .iter()
            .find(|c| c.id.as_deref() == Some(reference) || c.name.as_deref() == Some(reference))
            .and_then(|c| c.name.as_deref())
    }

    /// The manuscript's chapters in reading order, numbered from 1.
    pub fn chapters(&self) -> Vec<ChapterRef> {
        self.manuscript.flatten_chapters()
    }
}

/// One outline row: a chapter and its planned summary.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OutlineEntry {
    #[serde(deserialize_with = "lenient_chapter")]
    pub chapter: Option<u32>,
    #[serde(deserialize_with = "lenient_string")]
    pub title: Option<String>,
    #[serde(deserialize_with = "lenient_string")]
    pub summary: Option<String>,
}

/// A story event planned or recorded by the author.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProjectEvent {
    #[serde(deserialize_with = "lenient_chapter")]
    pub chapter: Option<u32>,
    #[serde(deserialize_with = "lenient_string")]
    pub description: Option<String>,
    #[serde(deserialize_with = "lenient_string")]
    pub significance: Option<String>,
    /// Ids (or names) of the characters involved.
    #[serde(deserialize_with = "lenient_strings")]
    pub characters: Vec<String>,
    #[serde(deserialize_with = "lenient_string")]
    pub location: Option<String>,
}

impl ProjectEvent {
    pub fn is_major(&self) -> bool {
        self.significance
            .as_deref()
            .is_some_and(|s| s.trim().eq_ignore_ascii_case("major"))
    }
}

/// A plot thread as tracked in the editor.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProjectThread {
    #[serde(deserialize_with = "lenient_string")]
    pub id: Option<String>,
    #[serde(deserialize_with = "lenient_string")]
    pub title: Option<String>,
    #[serde(deserialize_with = "lenient_chapter")]
    pub opened_chapter: Option<u32>,
    #[serde(deserialize_with = "lenient_chapter")]
    pub closed_chapter: Option<u32>,
    #[serde(deserialize_with = "lenient_string")]
    pub status: Option<String>,
    #[serde(deserialize_with = "lenient_string")]
    pub importance: Option<String>,
}

impl ProjectThread {
    /// Title when present, else id.
    pub fn name(&self) -> Option<&str> {
        self.title.as_deref().or(self.id.as_deref())
    }
}

/// A character sheet.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProjectCharacter {
    #[serde(deserialize_with = "lenient_string")]
    pub id: Option<String>,
    #[serde(deserialize_with = "lenient_string")]
    pub name: Option<String>,
    #[serde(deserialize_with = "lenient_strings")]
    pub knowledge: Vec<String>,
    #[serde(deserialize_with = "lenient_string")]
    pub location: Option<String>,
    #[serde(deserialize_with = "lenient_object")]
    pub relationships: Map<String, Value>,
    #[serde(deserialize_with = "lenient_strings")]
    pub notes: Vec<String>,
}

/// A setting.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProjectLocation {
    #[serde(deserialize_with = "lenient_string")]
    pub name: Option<String>,
    #[serde(deserialize_with = "lenient_chapter")]
    pub first_appearance: Option<u32>,
    #[serde(deserialize_with = "lenient_strings")]
    pub details: Vec<String>,
}

/// Kind of node in the manuscript tree.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    Part,
    Chapter,
    Scene,
    #[default]
    #[serde(other)]
    Other,
}

/// A node of the manuscript tree (parts contain chapters, chapters may hold scenes).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ManuscriptNode {
    #[serde(deserialize_with = "lenient_string")]
    pub title: Option<String>,
    pub kind: NodeKind,
    #[serde(deserialize_with = "lenient_string")]
    pub content: Option<String>,
    #[serde(deserialize_with = "lenient_list")]
    pub children: Vec<ManuscriptNode>,
}

/// A chapter located in the manuscript tree.
#[derive(Debug, Clone, PartialEq)]
pub struct ChapterRef {
    /// 1-based position in reading order.
    pub number: u32,
    pub title: String,
    pub content: String,
    /// Child indices from the root to this node.
    pub path: Vec<usize>,
}

impl ManuscriptNode {
    /// Convenience constructor for a chapter leaf.
    pub fn chapter(title: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            title: Some(title.into()),
            kind: NodeKind::Chapter,
            content: Some(content.into()),
            children: Vec::new(),
        }
    }

    /// Convenience constructor for a container node.
    pub fn part(title: impl Into<String>, children: Vec<ManuscriptNode>) -> Self {
        Self {
            title: Some(title.into()),
            kind: NodeKind::Part,
            content: None,
            children,
        }
    }

    /// Collect chapter nodes depth-first, numbering them in reading order.
    ///
    /// A chapter's text is its own content followed by that of its scenes.
    pub fn flatten_chapters(&self) -> Vec<ChapterRef> {
        let mut chapters = Vec::new();
        let mut path = Vec::new();
        self.collect_chapters(&mut path, &mut chapters);
        chapters
    }

    fn collect_chapters(&self, path: &mut Vec<usize>, out: &mut Vec<ChapterRef>) {
        if self.kind == NodeKind::Chapter {
            let number = out.len() as u32 + 1;
            out.push(ChapterRef {
                number,
                title: self
                    .title
                    .clone()
                    .unwrap_or_else(|| format!("Chapter {number}")),
                content: self.full_text(),
                path: path.clone(),
            });
            return;
        }

        for (i, child) in self.children.iter().enumerate() {
            path.push(i);
            child.collect_chapters(path, out);
            path.pop();
        }
    }

    fn full_text(&self) -> String {
        let mut text = self.content.clone().unwrap_or_default();
        for child in &self.children {
            let child_text = child.full_text();
            if child_text.is_empty() {
                continue;
            }
            if !text.is_empty() {
                text.push_str("\n\n");
            }
            text.push_str(&child_text);
        }
        text
    }

    /// Find a node by child-index path.
    pub fn node_at_mut(&mut self, path: &[usize]) -> Option<&mut ManuscriptNode> {
        let mut node = self;
        for &i in path {
            node = node.children.get_mut(i)?;
        }
        Some(node)
    }

    /// Replace a chapter's text, dropping its scene children.
    pub fn replace_content(&mut self, path: &[usize], content: impl Into<String>) -> bool {
        match self.node_at_mut(path) {
            Some(node) => {
                node.content = Some(content.into());
                node.children.clear();
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_tree() -> ManuscriptNode {
        ManuscriptNode::part(
            "Book",
            vec![
                ManuscriptNode::part(
                    "Part One",
                    vec![
                        ManuscriptNode::chapter("Arrival", "The train was late."),
                        ManuscriptNode::chapter("The House", "Dust everywhere."),
                    ],
                ),
                ManuscriptNode::part(
                    "Part Two",
                    vec![ManuscriptNode::chapter("Departure", "She left at dawn.")],
                ),
            ],
        )
    }

    #[test]
    fn test_flatten_numbers_in_reading_order() {
        let chapters = sample_tree().flatten_chapters();
        assert_eq!(chapters.len(), 3);
        assert_eq!(chapters[0].number, 1);
        assert_eq!(chapters[2].title, "Departure");
        assert_eq!(chapters[2].path, vec![1, 0]);
    }

    #[test]
    fn test_chapter_text_includes_scenes() {
        let mut chapter = ManuscriptNode::chapter("One", "Opening.");
        chapter.children.push(ManuscriptNode {
            kind: NodeKind::Scene,
            content: Some("Scene text.".into()),
            ..Default::default()
        });
        let root = ManuscriptNode::part("Book", vec![chapter]);

        let chapters = root.flatten_chapters();
        assert_eq!(chapters[0].content, "Opening.\n\nScene text.");
    }

    #[test]
    fn test_replace_content_by_path() {
        let mut tree = sample_tree();
        let path = tree.flatten_chapters()[1].path.clone();
        assert!(tree.replace_content(&path, "Clean floors."));
        assert_eq!(tree.flatten_chapters()[1].content, "Clean floors.");
        assert!(!tree.replace_content(&[9, 9], "nowhere"));
    }

    #[test]
    fn test_tolerant_project_decoding() {
        let raw = r#"{
            "title": "Night Train",
            "outline": [{"chapter": "1", "summary": "Arrival"}, "garbage"],
            "events": {"not": "a list"},
            "characters": [{"id": "c1", "name": "Mara", "knowledge": "the code"}],
            "manuscript": {"kind": "mystery", "children": [{"kind": "chapter", "content": "x"}]}
        }"#;
        let project: Project = serde_json::from_str(raw).unwrap();

        assert_eq!(project.outline.len(), 1);
        assert_eq!(project.outline[0].chapter, Some(1));
        assert!(project.events.is_empty());
        assert_eq!(project.characters[0].knowledge, vec!["the code"]);
        assert_eq!(project.character_name("c1"), Some("Mara"));
        assert_eq!(project.manuscript.kind, NodeKind::Other);
        assert_eq!(project.chapters().len(), 1);
    }

    #[test]
    fn test_empty_project() {
        let project: Project = serde_json::from_str("{}").unwrap();
        assert!(project.chapters().is_empty());
        assert!(project.title.is_none());
    }
}
