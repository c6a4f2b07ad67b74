//! Background upkeep: decay, graph pruning, co-activation, reflection and the job scheduler.

use rusqlite::{params, Connection};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use super::store::{log_maintenance_op, MaintenanceOp};
use crate::clock::days_between;
use crate::config::{MaintenanceConfig, WaypointConfig};
use crate::engine::MemoryEngine;
use crate::error::Result;
use crate::memory::dynamics::{clamp_unit, SalienceDynamics, SegmentPosition};
use crate::memory::types::{Memory, Sector};
use crate::memory::waypoints::{self, CoactivationBuffer};

// ── Result types ─────────────────────────────────────────────────────────────

#[derive(Debug, Default, Clone, Serialize)]
pub struct DecayReport {
    pub processed: usize,
    pub changed: usize,
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct ReflectionReport {
    pub created: usize,
    pub clusters: usize,
    /// Set when the run was skipped.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skipped: Option<String>,
}

/// Everything one `maintain` pass did.
#[derive(Debug, Default, Clone, Serialize)]
pub struct MaintenanceReport {
    pub decay: DecayReport,
    pub pruned: usize,
    pub coactivated: usize,
    pub reflection: ReflectionReport,
    pub profiles: usize,
}

// ── Decay sweep ──────────────────────────────────────────────────────────────

struct DecayRow {
    id: String,
    sector: Sector,
    salience: f64,
    last_seen_at: i64,
    segment: i64,
}

/// Recompute salience from idle time for up to `batch` memories, oldest-seen
/// first, and persist the ones that moved.
///
/// With `segment_aware` set, memories in later segments decay slower.
/// Writes one `decay` row to the maintenance log when any salience moved.
pub fn run_decay_sweep(
    conn: &mut Connection,
    dynamics: &SalienceDynamics,
    batch: usize,
    segment_aware: bool,
    now: i64,
) -> Result<DecayReport> {
    let rows: Vec<DecayRow> = {
        let mut stmt = conn.prepare(
            "SELECT id, primary_sector, salience, last_seen_at, segment FROM memories \
             ORDER BY last_seen_at, id LIMIT ?1",
        )?;
        let collected = stmt
            .query_map([batch as i64], |row| {
                let sector: String = row.get(1)?;
                Ok((row.get::<_, String>(0)?, sector, row.get(2)?, row.get(3)?, row.get(4)?))
            })?
            .collect::<rusqlite::Result<Vec<(String, String, f64, i64, i64)>>>()?;
        collected
            .into_iter()
            .filter_map(|(id, sector, salience, last_seen_at, segment)| {
                Some(DecayRow {
                    id,
                    sector: sector.parse().ok()?,
                    salience,
                    last_seen_at,
                    segment,
                })
            })
            .collect()
    };

    let max_segment: i64 = conn.query_row("SELECT COALESCE(MAX(segment), 0) FROM memories", [], |r| r.get(0))?;

    let tx = conn.transaction()?;
    let mut report = DecayReport {
        processed: rows.len(),
        changed: 0,
    };
    for row in &rows {
        let position = segment_aware.then_some(SegmentPosition {
            index: row.segment,
            max: max_segment,
        });
        let days = days_between(row.last_seen_at, now);
        let next = dynamics.calc_decay(row.sector, row.salience, days, position);
        if (next - row.salience).abs() > f64::EPSILON {
            tx.execute(
                "UPDATE memories SET salience = ?1, updated_at = ?2 WHERE id = ?3",
                params![next, now, row.id],
            )?;
            report.changed += 1;
        }
    }
    if report.changed > 0 {
        log_maintenance_op(
            &tx,
            MaintenanceOp::Decay,
            report.changed,
            Some(&serde_json::json!({ "processed": report.processed })),
            now,
        )?;
    }
    tx.commit()?;

    tracing::info!(processed = report.processed, changed = report.changed, "decay sweep complete");
    Ok(report)
}

// ── Waypoint upkeep ──────────────────────────────────────────────────────────

/// Delete weak waypoints and record a `prune` row.
pub fn prune_graph(conn: &Connection, cfg: &WaypointConfig, now: i64) -> Result<usize> {
    let pruned = waypoints::prune_waypoints(conn, cfg.prune_threshold)?;
    log_maintenance_op(conn, MaintenanceOp::Prune, pruned, None, now)?;
    tracing::info!(pruned, threshold = cfg.prune_threshold, "waypoints pruned");
    Ok(pruned)
}

/// Apply up to `coactivation_batch` buffered pairs. Returns how many edges
/// were updated; pairs whose memories are gone are dropped.
pub fn flush_coactivations(
    conn: &mut Connection,
    buffer: &CoactivationBuffer,
    cfg: &WaypointConfig,
    now: i64,
) -> Result<usize> {
    let pairs = buffer.drain(cfg.coactivation_batch);
    if pairs.is_empty() {
        return Ok(0);
    }
    let tx = conn.transaction()?;
    let mut applied = 0;
    for (a, b) in &pairs {
        if waypoints::coactivate(&tx, a, b, cfg, now)?.is_some() {
            applied += 1;
        }
    }
    tx.commit()?;
    tracing::debug!(pairs = pairs.len(), applied, "co-activation flush");
    Ok(applied)
}

// ── Reflection ───────────────────────────────────────────────────────────────

/// Similar memories of one sector, gathered for a reflection.
#[derive(Debug, Clone)]
pub struct Cluster {
    pub members: Vec<Memory>,
}

impl Cluster {
    pub fn sector(&self) -> Sector {
        self.members[0].primary_sector
    }

    pub fn ids(&self) -> Vec<String> {
        self.members.iter().map(|m| m.id.clone()).collect()
    }
}

/// Jaccard overlap of lowercase whitespace-separated words.
pub fn word_jaccard(a: &str, b: &str) -> f64 {
    let words = |s: &str| -> HashSet<String> { s.split_whitespace().map(str::to_lowercase).collect() };
    let (sa, sb) = (words(a), words(b));
    if sa.is_empty() || sb.is_empty() {
        return 0.0;
    }
    let inter = sa.intersection(&sb).count();
    let union = sa.union(&sb).count();
    inter as f64 / union as f64
}

fn is_consolidated(m: &Memory) -> bool {
    m.metadata.get("consolidated").and_then(|v| v.as_bool()).unwrap_or(false)
}

/// Greedy single-pass clustering: each unused memory collects every later
/// unused memory of the same sector and owner whose word overlap exceeds
/// `threshold`.
/// Reflective and already consolidated memories are skipped. Only clusters
/// of two or more are returned.
pub fn cluster_memories(memories: &[Memory], threshold: f64) -> Vec<Cluster> {
    let eligible: Vec<&Memory> = memories
        .iter()
        .filter(|m| m.primary_sector != Sector::Reflective && !is_consolidated(m))
        .collect();
    let mut used: HashSet<&str> = HashSet::new();
    let mut clusters = Vec::new();

    for m in &eligible {
        if used.contains(m.id.as_str()) {
            continue;
        }
        used.insert(&m.id);
        let mut members = vec![(*m).clone()];
        for o in &eligible {
            if used.contains(o.id.as_str())
                || o.primary_sector != m.primary_sector
                || o.owner_id != m.owner_id
            {
                continue;
            }
            if word_jaccard(&m.content, &o.content) > threshold {
                members.push((*o).clone());
                used.insert(&o.id);
            }
        }
        if members.len() >= 2 {
            clusters.push(Cluster { members });
        }
    }
    clusters
}

/// `"{n} {sector} pattern: ..."` with the first 60 characters of each member,
/// capped at 200 characters.
pub fn reflection_text(cluster: &Cluster) -> String {
    let joined = cluster
        .members
        .iter()
        .map(|m| m.content.chars().take(60).collect::<String>())
        .collect::<Vec<_>>()
        .join("; ");
    let capped: String = joined.chars().take(200).collect();
    format!("{} {} pattern: {}", cluster.members.len(), cluster.sector(), capped)
}

/// `0.6 × n/10 + 0.3 × mean recency + 0.1 × emotional`, capped at 1.
/// Recency is `e^(-age / 12h)` on each member's creation time.
pub fn reflection_salience(cluster: &Cluster, now: i64) -> f64 {
    const HALF_DAY_MS: f64 = 43_200_000.0;
    let n = cluster.members.len() as f64;
    let recency = cluster
        .members
        .iter()
        .map(|m| (-((now - m.created_at).max(0) as f64) / HALF_DAY_MS).exp())
        .sum::<f64>()
        / n;
    let emotional = if cluster.members.iter().any(|m| m.primary_sector == Sector::Emotional) {
        1.0
    } else {
        0.0
    };
    clamp_unit(0.6 * (n / 10.0) + 0.3 * recency + 0.1 * emotional)
}

/// Flag sources as consolidated and raise their salience by 10%.
pub fn mark_consolidated(conn: &mut Connection, ids: &[String], now: i64) -> Result<usize> {
    let tx = conn.transaction()?;
    let mut marked = 0;
    for id in ids {
        let Some(mut m) = super::store::get_memory(&tx, id)? else {
            continue;
        };
        if let Some(obj) = m.metadata.as_object_mut() {
            obj.insert("consolidated".into(), serde_json::Value::Bool(true));
        } else {
            m.metadata = serde_json::json!({ "consolidated": true });
        }
        tx.execute(
            "UPDATE memories SET metadata = ?1, salience = ?2, updated_at = ?3 WHERE id = ?4",
            params![
                serde_json::to_string(&m.metadata)?,
                clamp_unit(m.salience * 1.1),
                now,
                id
            ],
        )?;
        marked += 1;
    }
    tx.commit()?;
    Ok(marked)
}

// ── Scheduler ────────────────────────────────────────────────────────────────

/// Running background jobs. Dropping the handle stops them.
pub struct MaintenanceHandle {
    cancel: CancellationToken,
    tasks: Vec<tokio::task::JoinHandle<()>>,
}

impl MaintenanceHandle {
    /// Cancel every job and wait for the tasks to exit.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
    }

    pub fn job_count(&self) -> usize {
        self.tasks.len()
    }
}

impl Drop for MaintenanceHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn spawn_job<F, Fut>(
    name: &'static str,
    first_delay: Duration,
    period: Duration,
    cancel: CancellationToken,
    engine: Arc<MemoryEngine>,
    job: F,
) -> tokio::task::JoinHandle<()>
where
    F: Fn(Arc<MemoryEngine>) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = Result<()>> + Send,
{
    tokio::spawn(async move {
        let start = tokio::time::Instant::now() + first_delay;
        let mut ticker = tokio::time::interval_at(start, period.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = job(Arc::clone(&engine)).await {
                        tracing::error!(job = name, error = %e, "maintenance job failed");
                    }
                }
            }
        }
        tracing::debug!(job = name, "maintenance job stopped");
    })
}

/// Spawn every configured job on its own interval.
pub fn start(engine: Arc<MemoryEngine>, cfg: &MaintenanceConfig) -> MaintenanceHandle {
    let cancel = CancellationToken::new();
    let mut tasks = Vec::new();

    let decay_period = Duration::from_secs(cfg.decay_interval_minutes * 60);
    tasks.push(spawn_job(
        "decay",
        Duration::from_secs(cfg.initial_decay_delay_secs),
        decay_period,
        cancel.clone(),
        Arc::clone(&engine),
        |e| async move { e.run_decay().await.map(|_| ()) },
    ));

    let prune_period = Duration::from_secs(cfg.prune_interval_hours * 3600);
    tasks.push(spawn_job(
        "prune",
        prune_period,
        prune_period,
        cancel.clone(),
        Arc::clone(&engine),
        |e| async move { e.prune().await.map(|_| ()) },
    ));

    let coact_period = Duration::from_millis(cfg.coactivation_interval_ms);
    tasks.push(spawn_job(
        "coactivation",
        coact_period,
        coact_period,
        cancel.clone(),
        Arc::clone(&engine),
        |e| async move { e.flush_coactivations().await.map(|_| ()) },
    ));

    if cfg.auto_reflect {
        let reflect_period = Duration::from_secs(cfg.reflect_interval_minutes * 60);
        tasks.push(spawn_job(
            "reflect",
            reflect_period,
            reflect_period,
            cancel.clone(),
            Arc::clone(&engine),
            |e| async move { e.run_reflection().await.map(|_| ()) },
        ));
    }

    let profile_period = Duration::from_secs(cfg.profile_interval_minutes * 60);
    tasks.push(spawn_job(
        "profiles",
        profile_period,
        profile_period,
        cancel.clone(),
        engine,
        |e| async move { e.refresh_profiles().await.map(|_| ()) },
    ));

    tracing::info!(jobs = tasks.len(), auto_reflect = cfg.auto_reflect, "maintenance scheduler started");
    MaintenanceHandle { cancel, tasks }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DynamicsConfig, IngestionConfig, SectorsConfig};
    use crate::db::open_memory_database;

    const DAY: i64 = 86_400_000;

    fn dynamics() -> SalienceDynamics {
        SalienceDynamics::new(
            &SectorsConfig::default(),
            &DynamicsConfig::default(),
            &IngestionConfig::default(),
        )
    }

    fn insert(conn: &Connection, id: &str, sector: &str, content: &str, salience: f64, seen: i64) {
        conn.execute(
            "INSERT INTO memories (id, owner_id, content, simhash, primary_sector, created_at, updated_at, last_seen_at, salience, decay_lambda) \
             VALUES (?1, 'o', ?2, '0', ?3, ?4, ?4, ?4, ?5, 0.005)",
            params![id, content, sector, seen, salience],
        )
        .unwrap();
    }

    fn mem(id: &str, sector: Sector, content: &str, created: i64) -> Memory {
        Memory {
            id: id.into(),
            owner_id: "o".into(),
            segment: 0,
            content: content.into(),
            simhash: 0,
            primary_sector: sector,
            tags: vec![],
            metadata: serde_json::json!({}),
            created_at: created,
            updated_at: created,
            last_seen_at: created,
            salience: 0.5,
            decay_lambda: 0.005,
            version: 1,
            mean_dim: 0,
            mean_vector: vec![],
            compressed_vector: None,
            feedback_score: 0.0,
        }
    }

    #[test]
    fn decay_sweep_lowers_idle_memories() {
        let mut conn = open_memory_database().unwrap();
        insert(&conn, "old", "episodic", "x", 0.9, 0);
        insert(&conn, "fresh", "episodic", "y", 0.9, 30 * DAY);

        let report = run_decay_sweep(&mut conn, &dynamics(), 10_000, false, 30 * DAY).unwrap();
        assert_eq!(report.processed, 2);
        assert_eq!(report.changed, 1);

        let old: f64 = conn.query_row("SELECT salience FROM memories WHERE id = 'old'", [], |r| r.get(0)).unwrap();
        let fresh: f64 = conn.query_row("SELECT salience FROM memories WHERE id = 'fresh'", [], |r| r.get(0)).unwrap();
        assert!(old < 0.9 && old >= 0.0);
        assert_eq!(fresh, 0.9);

        let logged: i64 = conn
            .query_row("SELECT count FROM maintenance_log WHERE operation = 'decay'", [], |r| r.get(0))
            .unwrap();
        assert_eq!(logged, 1);
    }

    #[test]
    fn decay_sweep_without_changes_writes_no_log() {
        let mut conn = open_memory_database().unwrap();
        insert(&conn, "fresh", "semantic", "x", 0.9, 5 * DAY);

        let report = run_decay_sweep(&mut conn, &dynamics(), 10_000, false, 5 * DAY).unwrap();
        assert_eq!(report.changed, 0);
        let logged: i64 = conn
            .query_row("SELECT COUNT(*) FROM maintenance_log WHERE operation = 'decay'", [], |r| r.get(0))
            .unwrap();
        assert_eq!(logged, 0);
    }

    #[test]
    fn decay_sweep_respects_batch() {
        let mut conn = open_memory_database().unwrap();
        for i in 0..5 {
            insert(&conn, &format!("m{i}"), "semantic", "x", 0.9, i);
        }
        let report = run_decay_sweep(&mut conn, &dynamics(), 2, false, 90 * DAY).unwrap();
        assert_eq!(report.processed, 2);
    }

    #[test]
    fn prune_logs_and_removes() {
        let conn = open_memory_database().unwrap();
        waypoints::upsert_waypoint(&conn, "a", "b", "o", 0.01, 0).unwrap();
        waypoints::upsert_waypoint(&conn, "a", "c", "o", 0.5, 0).unwrap();
        assert_eq!(prune_graph(&conn, &WaypointConfig::default(), 1).unwrap(), 1);
        let min: f64 = conn.query_row("SELECT MIN(weight) FROM waypoints", [], |r| r.get(0)).unwrap();
        assert!(min >= 0.05);
    }

    #[test]
    fn flush_respects_batch_limit() {
        let mut conn = open_memory_database().unwrap();
        for i in 0..4 {
            insert(&conn, &format!("m{i}"), "semantic", "x", 0.5, 0);
        }
        let buffer = CoactivationBuffer::new();
        let cfg = WaypointConfig {
            coactivation_batch: 2,
            ..Default::default()
        };
        buffer.push_all(vec![
            ("m0".to_string(), "m1".to_string()),
            ("m0".to_string(), "m2".to_string()),
            ("m0".to_string(), "ghost".to_string()),
        ]);
        assert_eq!(flush_coactivations(&mut conn, &buffer, &cfg, 1).unwrap(), 2);
        assert_eq!(buffer.len(), 1);
        assert_eq!(flush_coactivations(&mut conn, &buffer, &cfg, 2).unwrap(), 0);
        assert!(buffer.is_empty());
    }

    #[test]
    fn jaccard_on_words() {
        assert_eq!(word_jaccard("a b c", "a b c"), 1.0);
        assert_eq!(word_jaccard("a b", "c d"), 0.0);
        assert_eq!(word_jaccard("", "a"), 0.0);
        assert!((word_jaccard("A b c d", "a b c e") - 3.0 / 5.0).abs() < 1e-12);
    }

    #[test]
    fn clusters_need_same_sector_and_high_overlap() {
        let text = "went for a long morning run along the river today";
        let mems = vec![
            mem("a", Sector::Episodic, text, 0),
            mem("b", Sector::Episodic, text, 1),
            mem("c", Sector::Semantic, text, 2),
            mem("d", Sector::Episodic, "completely different words here", 3),
            mem("e", Sector::Reflective, text, 4),
        ];
        let clusters = cluster_memories(&mems, 0.8);
        assert_eq!(clusters.len(), 1);
        assert_eq!(clusters[0].ids(), vec!["a", "b"]);

        let text_out = reflection_text(&clusters[0]);
        assert!(text_out.starts_with("2 episodic pattern: "));
    }

    #[test]
    fn consolidated_memories_are_not_reclustered() {
        let mut a = mem("a", Sector::Episodic, "same words", 0);
        a.metadata = serde_json::json!({"consolidated": true});
        let b = mem("b", Sector::Episodic, "same words", 1);
        assert!(cluster_memories(&[a, b], 0.8).is_empty());
    }

    #[test]
    fn reflection_salience_formula() {
        let cluster = Cluster {
            members: vec![mem("a", Sector::Emotional, "x", 0), mem("b", Sector::Emotional, "x", 0)],
        };
        // 0.6 * 0.2 + 0.3 * 1.0 + 0.1
        assert!((reflection_salience(&cluster, 0) - 0.52).abs() < 1e-12);
    }

    #[test]
    fn marking_sets_flag_and_boosts() {
        let mut conn = open_memory_database().unwrap();
        insert(&conn, "a", "episodic", "x", 0.5, 0);
        assert_eq!(mark_consolidated(&mut conn, &["a".into(), "missing".into()], 5).unwrap(), 1);
        let m = super::super::store::get_memory(&conn, "a").unwrap().unwrap();
        assert!(is_consolidated(&m));
        assert!((m.salience - 0.55).abs() < 1e-12);
    }
}
