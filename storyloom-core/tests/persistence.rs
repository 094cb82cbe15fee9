//! Saving and restoring memory exports and projects.

use std::sync::Arc;
use storyloom_core::{
    NovelSession, OracleClient, Project, ScriptedOracle, SessionConfig, SessionError,
    UpdateOptions,
};
use tempfile::tempdir;

fn scripted_session(responses: Vec<&str>) -> NovelSession {
    let oracle = ScriptedOracle::new(responses.into_iter().map(String::from).collect());
    NovelSession::new(OracleClient::new(Arc::new(oracle)), SessionConfig::default())
}

#[tokio::test]
async fn memory_export_round_trip() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("memory.json");

    let mut session = scripted_session(vec![
        r#"{"newEvents": ["Mara lands"], "newFacts": ["The island has no trees"], "characterUpdates": {"Mara": {"location": "Beach"}}}"#,
    ]);
    session.update_memory(1, "text", UpdateOptions::default()).await;
    session.save_memory(&path).await.unwrap();

    let mut restored = scripted_session(vec![]);
    restored.load_memory(&path).await.unwrap();

    assert_eq!(restored.memory(), session.memory());
    assert_eq!(restored.costs().check_count, 1);

    let raw: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
    assert!(raw.get("generatedAt").is_some());
    assert!(raw.get("timeline").is_some());
    assert!(raw.get("costs").is_some());
}

#[tokio::test]
async fn loading_a_hand_edited_export_drops_duplicate_facts() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("memory.json");
    std::fs::write(&path, r#"{"establishedFacts": ["A", "A", "B"]}"#).unwrap();

    let mut session = scripted_session(vec![]);
    session.load_memory(&path).await.unwrap();

    assert_eq!(session.memory().established_facts(), &["A", "B"]);
}

#[tokio::test]
async fn missing_or_corrupt_files_are_errors() {
    let dir = tempdir().unwrap();
    let mut session = scripted_session(vec![]);

    let missing = session.load_memory(dir.path().join("nope.json")).await;
    assert!(matches!(missing, Err(SessionError::Io(_))));

    let corrupt = dir.path().join("corrupt.json");
    std::fs::write(&corrupt, "{ not json").unwrap();
    let result = session.load_memory(&corrupt).await;
    assert!(matches!(result, Err(SessionError::Serialization(_))));
}

#[tokio::test]
async fn project_round_trip() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("project.json");

    let project: Project = serde_json::from_str(
        r#"{
            "title": "Salt",
            "genre": "mystery",
            "outline": [{"chapter": 1, "summary": "Arrival"}],
            "manuscript": {"kind": "part", "children": [{"kind": "chapter", "title": "One", "content": "Fog."}]}
        }"#,
    )
    .unwrap();
    project.save(&path).await.unwrap();

    let loaded = Project::load(&path).await.unwrap();
    assert_eq!(loaded.title.as_deref(), Some("Salt"));
    assert_eq!(loaded.chapters()[0].content, "Fog.");
    assert_eq!(loaded.outline.len(), 1);
}
