mod helpers;

use chrono::Duration;
use std::sync::Arc;

use helpers::{synthetic, test_config, test_engine, test_engine_with, CountingEmbedder};
use strata::memory::types::{NewMemory, QueryFilter, Sector};
use strata::MemoryError;

async fn seed_pair(t: &helpers::TestEngine) -> (String, String) {
    let episodic = t
        .engine
        .add_memory(NewMemory::new("Yesterday I went to the park at 4pm"))
        .await
        .unwrap();
    t.clock.advance(Duration::seconds(1));
    let semantic = t
        .engine
        .add_memory(NewMemory::new("Python is a high-level language known for readability"))
        .await
        .unwrap();
    assert_eq!(episodic.primary_sector, Sector::Episodic);
    assert_eq!(semantic.primary_sector, Sector::Semantic);
    (episodic.id, semantic.id)
}

#[tokio::test]
async fn relevant_memory_ranks_first() {
    let t = test_engine();
    let (_, semantic) = seed_pair(&t).await;

    let results = t
        .engine
        .query("what language is known for readability", 2, QueryFilter::default())
        .await
        .unwrap();
    assert!(!results.is_empty());
    assert_eq!(results[0].id, semantic);
    assert_eq!(results[0].primary_sector, Sector::Semantic);
    assert!(results.windows(2).all(|w| w[0].score >= w[1].score));
}

#[tokio::test]
async fn k_caps_the_result_count() {
    let t = test_engine();
    seed_pair(&t).await;
    let results = t.engine.query("park language", 1, QueryFilter::default()).await.unwrap();
    assert_eq!(results.len(), 1);
}

#[tokio::test]
async fn zero_k_is_rejected_and_releases_its_slot() {
    let t = test_engine();
    let err = t.engine.query("anything", 0, QueryFilter::default()).await.unwrap_err();
    assert!(matches!(err, MemoryError::Validation(_)));
    assert_eq!(t.engine.active_queries(), 0);
}

#[tokio::test]
async fn empty_store_returns_no_results() {
    let t = test_engine();
    let results = t.engine.query("anything at all", 5, QueryFilter::default()).await.unwrap();
    assert!(results.is_empty());
}

#[tokio::test]
async fn owner_filter_excludes_other_owners() {
    let t = test_engine();
    t.engine
        .add_memory(NewMemory::new("The cache server restarts nightly").with_owner("alice"))
        .await
        .unwrap();
    t.engine
        .add_memory(NewMemory::new("The cache server restarts weekly").with_owner("bob"))
        .await
        .unwrap();

    let filter = QueryFilter {
        owner_id: Some("alice".into()),
        ..Default::default()
    };
    let results = t.engine.query("cache server restarts", 5, filter).await.unwrap();
    assert!(!results.is_empty());
    for r in &results {
        let m = t.engine.get_memory(&r.id).await.unwrap();
        assert_eq!(m.owner_id, "alice");
    }
}

#[tokio::test]
async fn min_salience_filter_drops_weak_memories() {
    let t = test_engine();
    let (episodic, semantic) = seed_pair(&t).await;
    t.engine.reinforce(&semantic, Some(0.5)).await.unwrap();

    let filter = QueryFilter {
        min_salience: Some(0.8),
        ..Default::default()
    };
    let results = t.engine.query("park language readability", 5, filter).await.unwrap();
    assert!(results.iter().any(|r| r.id == semantic));
    assert!(results.iter().all(|r| r.id != episodic));
}

#[tokio::test]
async fn recall_reinforces_returned_memories() {
    let t = test_engine();
    let (_, semantic) = seed_pair(&t).await;
    let before = t.engine.get_memory(&semantic).await.unwrap();

    t.clock.advance(Duration::minutes(10));
    let results = t
        .engine
        .query("language known for readability", 1, QueryFilter::default())
        .await
        .unwrap();
    assert_eq!(results[0].id, semantic);

    let after = t.engine.get_memory(&semantic).await.unwrap();
    assert!(after.salience > before.salience);
    assert_eq!(after.last_seen_at, t.clock_millis());
    assert_ne!(after.feedback_score, 0.0);
}

#[tokio::test]
async fn cache_hit_skips_embedding_and_side_effects() {
    let config = test_config();
    let embedder = Arc::new(CountingEmbedder::new(synthetic(&config)));
    let t = test_engine_with(config, |b| b.embedder(embedder.clone()));
    let (_, semantic) = seed_pair(&t).await;

    let first = t
        .engine
        .query("language known for readability", 2, QueryFilter::default())
        .await
        .unwrap();
    let calls = embedder.calls();
    let seen = t.engine.get_memory(&semantic).await.unwrap();

    t.clock.advance(Duration::seconds(10));
    let cached = t
        .engine
        .query("language known for readability", 2, QueryFilter::default())
        .await
        .unwrap();
    assert_eq!(cached, first);
    assert_eq!(embedder.calls(), calls, "cache hit must not embed");
    let unchanged = t.engine.get_memory(&semantic).await.unwrap();
    assert_eq!(unchanged.salience, seen.salience);
    assert_eq!(unchanged.last_seen_at, seen.last_seen_at);

    // Past the TTL the query runs again
    t.clock.advance(Duration::seconds(61));
    t.engine
        .query("language known for readability", 2, QueryFilter::default())
        .await
        .unwrap();
    assert!(embedder.calls() > calls);
    let refreshed = t.engine.get_memory(&semantic).await.unwrap();
    assert_eq!(refreshed.last_seen_at, t.clock_millis());
}

#[tokio::test]
async fn different_filters_do_not_share_cache_entries() {
    let config = test_config();
    let embedder = Arc::new(CountingEmbedder::new(synthetic(&config)));
    let t = test_engine_with(config, |b| b.embedder(embedder.clone()));
    seed_pair(&t).await;

    t.engine.query("park", 3, QueryFilter::default()).await.unwrap();
    let calls = embedder.calls();
    let filter = QueryFilter {
        sectors: vec![Sector::Episodic],
        ..Default::default()
    };
    t.engine.query("park", 3, filter).await.unwrap();
    assert!(embedder.calls() > calls);
}

#[tokio::test]
async fn sector_filter_limits_the_searched_sectors() {
    let t = test_engine();
    let (episodic, _) = seed_pair(&t).await;
    let filter = QueryFilter {
        sectors: vec![Sector::Episodic],
        ..Default::default()
    };
    let results = t.engine.query("went to the park", 5, filter).await.unwrap();
    assert!(!results.is_empty());
    assert_eq!(results[0].id, episodic);
    assert!(results[0].sectors.contains(&Sector::Episodic));
}

#[tokio::test]
async fn co_recalled_memories_get_linked_on_flush() {
    let t = test_engine();
    let (episodic, semantic) = seed_pair(&t).await;

    let results = t
        .engine
        .query("park language readability", 2, QueryFilter::default())
        .await
        .unwrap();
    assert_eq!(results.len(), 2);
    assert!(t.engine.pending_coactivations() > 0);

    let applied = t.engine.flush_coactivations().await.unwrap();
    assert!(applied > 0);
    assert_eq!(t.engine.pending_coactivations(), 0);

    let conn = t.engine.database().lock().unwrap();
    let linked = strata::memory::waypoints::get_waypoint(&conn, &episodic, &semantic).unwrap().is_some()
        || strata::memory::waypoints::get_waypoint(&conn, &semantic, &episodic).unwrap().is_some();
    assert!(linked);
}

#[tokio::test]
async fn sqlite_vec_backend_answers_queries() {
    let mut config = test_config();
    config.storage.vector_backend = "sqlite-vec".into();
    let t = test_engine_with(config, |b| b);
    let (_, semantic) = seed_pair(&t).await;
    assert_eq!(t.engine.vector_store().name(), "sqlite-vec");

    let results = t
        .engine
        .query("what language is known for readability", 2, QueryFilter::default())
        .await
        .unwrap();
    assert_eq!(results[0].id, semantic);
}

#[tokio::test]
async fn pending_coactivations_stay_bounded() {
    let mut config = test_config();
    config.retrieval.max_active = 2;
    config.waypoints.coactivation_batch = 1;
    let t = test_engine_with(config, |b| b);
    seed_pair(&t).await;

    for q in ["park language", "readability park", "language at the park", "went to the park", "high-level park"] {
        t.engine.query(q, 2, QueryFilter::default()).await.unwrap();
        assert!(t.engine.pending_coactivations() <= 2);
    }
    assert!(t.engine.pending_coactivations() > 0);
}
