mod helpers;

use chrono::Duration;
use serde_json::json;
use std::sync::Arc;

use helpers::{test_config, test_engine, test_engine_with, total_rows, vector_rows, FlakyVectorStore};
use strata::db::{open_memory_database, Database};
use strata::memory::classify::Classifier;
use strata::memory::types::{MemoryUpdate, NewMemory, Sector, SectorVector};
use strata::memory::vector_store::sqlite::SqliteVectorStore;
use strata::memory::waypoints;
use strata::MemoryError;

// ── Update ───────────────────────────────────────────────────────────────────

#[tokio::test]
async fn tag_only_update_keeps_version_and_vectors() {
    let t = test_engine();
    let r = t
        .engine
        .add_memory(NewMemory::new("Yesterday I went to the park"))
        .await
        .unwrap();
    t.clock.advance(Duration::minutes(1));

    let updated = t
        .engine
        .update_memory(
            &r.id,
            MemoryUpdate {
                tags: Some(vec!["outdoors".into()]),
                metadata: Some(json!({ "mood": "calm" })),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(updated.version, 1);
    assert!(!updated.reembedded);

    let m = t.engine.get_memory(&r.id).await.unwrap();
    assert_eq!(m.tags, vec!["outdoors".to_string()]);
    assert_eq!(m.metadata["mood"], "calm");
    assert_eq!(m.updated_at, t.clock_millis());
    assert_eq!(m.primary_sector, Sector::Episodic);
}

#[tokio::test]
async fn content_update_reclassifies_and_reembeds() {
    let t = test_engine();
    let r = t
        .engine
        .add_memory(NewMemory::new("Yesterday I went to the park"))
        .await
        .unwrap();
    let before = t.engine.get_memory(&r.id).await.unwrap();

    let updated = t
        .engine
        .update_memory(
            &r.id,
            MemoryUpdate {
                content: Some("First install the toolchain, then run the build step by step".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(updated.version, 2);
    assert!(updated.reembedded);

    let after = t.engine.get_memory(&r.id).await.unwrap();
    assert_eq!(after.primary_sector, Sector::Procedural);
    assert_eq!(after.decay_lambda, 0.008);
    assert_ne!(after.simhash, before.simhash);
    assert_ne!(after.mean_vector, before.mean_vector);

    let vectors = t.engine.vector_store().get_all(&r.id).await.unwrap();
    assert_eq!(vectors.len() as i64, vector_rows(&t.engine, &r.id));
    assert!(vectors.iter().any(|v| v.sector == Sector::Procedural));
    assert!(vectors.iter().all(|v| v.sector != Sector::Episodic));
}

#[tokio::test]
async fn same_content_update_does_not_bump_version() {
    let t = test_engine();
    let r = t.engine.add_memory(NewMemory::new("Deploys happen on Fridays")).await.unwrap();
    let updated = t
        .engine
        .update_memory(
            &r.id,
            MemoryUpdate {
                content: Some("Deploys happen on Fridays".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(updated.version, 1);
    assert!(!updated.reembedded);
}

#[tokio::test]
async fn update_of_missing_memory_is_not_found() {
    let t = test_engine();
    let err = t
        .engine
        .update_memory("missing", MemoryUpdate::default())
        .await
        .unwrap_err();
    assert!(matches!(err, MemoryError::NotFound(id) if id == "missing"));
}

#[tokio::test]
async fn update_to_empty_content_is_rejected() {
    let t = test_engine();
    let r = t.engine.add_memory(NewMemory::new("keep me")).await.unwrap();
    let err = t
        .engine
        .update_memory(
            &r.id,
            MemoryUpdate {
                content: Some("  ".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, MemoryError::Validation(_)));
}

#[tokio::test]
async fn content_update_failure_restores_previous_vectors() {
    let content = "Python is a high-level language known for readability";
    let db = Database::new(open_memory_database().unwrap());
    let inner = Arc::new(SqliteVectorStore::new(db.clone()).unwrap());
    let sectors = Classifier::new(&test_config().sectors)
        .unwrap()
        .classify(content, None)
        .sectors()
        .len();
    // Every ingest upsert lands; the first upsert of the rewrite fails
    let flaky = Arc::new(FlakyVectorStore::failing_once(inner, sectors));
    let t = test_engine_with(test_config(), |b| b.database(db).vector_store(flaky));

    let r = t.engine.add_memory(NewMemory::new(content)).await.unwrap();
    let sorted = |mut v: Vec<SectorVector>| {
        v.sort_by_key(|s| s.sector);
        v
    };
    let before = sorted(t.engine.vector_store().get_all(&r.id).await.unwrap());
    assert_eq!(before.len(), sectors);

    let err = t
        .engine
        .update_memory(
            &r.id,
            MemoryUpdate {
                content: Some("First install the toolchain, then run the build step by step".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, MemoryError::Transaction(_)), "got {err:?}");

    let after = sorted(t.engine.vector_store().get_all(&r.id).await.unwrap());
    assert_eq!(after, before);
    let m = t.engine.get_memory(&r.id).await.unwrap();
    assert_eq!(m.content, content);
    assert_eq!(m.version, 1);
}

// ── Reinforce ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn reinforce_adds_default_boost() {
    let t = test_engine();
    let r = t.engine.add_memory(NewMemory::new("Rust is a language")).await.unwrap();
    let salience = t.engine.reinforce(&r.id, None).await.unwrap();
    assert!((salience - 0.5).abs() < 1e-9);
    assert_eq!(t.engine.get_memory(&r.id).await.unwrap().salience, salience);
}

#[tokio::test]
async fn reinforce_caps_at_one_and_logs_consolidation_once() {
    let t = test_engine();
    let r = t.engine.add_memory(NewMemory::new("Rust is a language")).await.unwrap();

    assert!((t.engine.reinforce(&r.id, Some(0.5)).await.unwrap() - 0.9).abs() < 1e-9);
    assert_eq!(t.engine.reinforce(&r.id, Some(1.0)).await.unwrap(), 1.0);

    let logged: i64 = t
        .engine
        .database()
        .lock()
        .unwrap()
        .query_row(
            "SELECT COUNT(*) FROM maintenance_log WHERE operation = 'consolidate'",
            [],
            |r| r.get(0),
        )
        .unwrap();
    assert_eq!(logged, 1);
}

#[tokio::test]
async fn reinforce_rejects_out_of_range_boost() {
    let t = test_engine();
    let r = t.engine.add_memory(NewMemory::new("Rust is a language")).await.unwrap();
    for boost in [0.0, -0.2, 1.5, f64::NAN] {
        let err = t.engine.reinforce(&r.id, Some(boost)).await.unwrap_err();
        assert!(matches!(err, MemoryError::Validation(_)), "boost {boost}");
    }
    let err = t.engine.reinforce("missing", None).await.unwrap_err();
    assert!(matches!(err, MemoryError::NotFound(_)));
}

// ── Delete ───────────────────────────────────────────────────────────────────

#[tokio::test]
async fn delete_removes_row_vectors_and_edges() {
    let t = test_engine();
    let a = t.engine.add_memory(NewMemory::new("Rust is a language")).await.unwrap();
    t.clock.advance(Duration::seconds(1));
    let b = t
        .engine
        .add_memory(NewMemory::new("Rust is a language with a borrow checker"))
        .await
        .unwrap();
    t.engine.link_sectors(&b.id).await.unwrap();

    t.engine.delete_memory(&b.id).await.unwrap();

    assert!(matches!(
        t.engine.get_memory(&b.id).await.unwrap_err(),
        MemoryError::NotFound(_)
    ));
    assert_eq!(vector_rows(&t.engine, &b.id), 0);
    assert_eq!(vector_rows(&t.engine, &a.id), 1);
    {
        let conn = t.engine.database().lock().unwrap();
        assert!(waypoints::outgoing(&conn, &b.id).unwrap().is_empty());
        assert!(waypoints::get_waypoint(&conn, &a.id, &a.id).unwrap().is_some());
    }
    assert_eq!(total_rows(&t.engine, "memories"), 1);

    let err = t.engine.delete_memory(&b.id).await.unwrap_err();
    assert!(matches!(err, MemoryError::NotFound(_)));
}

// ── Explicit links ───────────────────────────────────────────────────────────

#[tokio::test]
async fn link_similar_connects_close_memories_both_ways() {
    let mut config = test_config();
    config.waypoints.same_sector_threshold = 0.5;
    let t = test_engine_with(config, |b| b);
    let a = t
        .engine
        .add_memory(NewMemory::new("The build server runs on port 8080"))
        .await
        .unwrap();
    let b = t
        .engine
        .add_memory(NewMemory::new("The build server runs on port 8080 internally"))
        .await
        .unwrap();
    let c = t
        .engine
        .add_memory(NewMemory::new("Bananas ripen faster next to apples"))
        .await
        .unwrap();

    let linked = t.engine.link_similar(&a.id).await.unwrap();
    assert!(linked >= 1);

    let conn = t.engine.database().lock().unwrap();
    let ab = waypoints::get_waypoint(&conn, &a.id, &b.id).unwrap().unwrap();
    let ba = waypoints::get_waypoint(&conn, &b.id, &a.id).unwrap().unwrap();
    assert_eq!(ab.weight, 0.5);
    assert_eq!(ba.weight, 0.5);
    assert!(waypoints::get_waypoint(&conn, &a.id, &c.id).unwrap().is_none());
}

#[tokio::test]
async fn link_contextual_creates_then_strengthens() {
    let t = test_engine();
    let a = t.engine.add_memory(NewMemory::new("alpha notes")).await.unwrap();
    let b = t.engine.add_memory(NewMemory::new("beta notes")).await.unwrap();

    assert_eq!(t.engine.link_contextual(&a.id, &[b.id.clone()], None).await.unwrap(), 1);
    assert_eq!(t.engine.link_contextual(&a.id, &[b.id.clone(), a.id.clone()], None).await.unwrap(), 1);

    let conn = t.engine.database().lock().unwrap();
    let wp = waypoints::get_waypoint(&conn, &a.id, &b.id).unwrap().unwrap();
    assert!((wp.weight - 0.4).abs() < 1e-9);
}

#[tokio::test]
async fn link_operations_require_existing_memory() {
    let t = test_engine();
    assert!(matches!(
        t.engine.link_similar("ghost").await.unwrap_err(),
        MemoryError::NotFound(_)
    ));
    assert!(matches!(
        t.engine.link_contextual("ghost", &[], None).await.unwrap_err(),
        MemoryError::NotFound(_)
    ));
}
