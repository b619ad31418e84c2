//! LoadCoordinator: the stateful half of the dispatch layer used by the
//! `autoscale` routing strategy. A single logical instance per process;
//! state is kept behind a `tokio::sync::Mutex` (single-writer) and mirrored
//! to a `sled` tree so a restart doesn't forget which workers exist.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{info, warn};

const STATE_KEY: &[u8] = b"state";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WorkerRecord {
    id: String,
    active_connections: u32,
    last_activity: SystemTime,
    created_at: SystemTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct CoordinatorState {
    workers: HashMap<String, WorkerRecord>,
    session_to_worker: HashMap<String, String>,
    next_worker_seq: u64,
}

impl CoordinatorState {
    fn create_worker(&mut self) -> String {
        let id = format!("worker-{}", self.next_worker_seq);
        self.next_worker_seq += 1;
        let now = SystemTime::now();
        self.workers.insert(
            id.clone(),
            WorkerRecord {
                id: id.clone(),
                active_connections: 0,
                last_activity: now,
                created_at: now,
            },
        );
        id
    }
}

fn persist_state(db: &sled::Db, state: &CoordinatorState) -> anyhow::Result<()> {
    let bytes = serde_json::to_vec(state)?;
    db.insert(STATE_KEY, bytes)?;
    db.flush()?;
    Ok(())
}

/// A point-in-time snapshot of one worker, for observability/tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSnapshot {
    pub id: String,
    pub active_connections: u32,
}

pub struct LoadCoordinator {
    state: Mutex<CoordinatorState>,
    db: sled::Db,
    max_connections_per_container: u32,
    min_containers: usize,
    scale_down_idle_time: Duration,
}

impl LoadCoordinator {
    pub fn open(
        db_path: &std::path::Path,
        max_connections_per_container: u32,
        min_containers: usize,
        scale_down_idle_time: Duration,
    ) -> anyhow::Result<Arc<Self>> {
        let db = sled::open(db_path)?;
        let mut state: CoordinatorState = match db.get(STATE_KEY)? {
            Some(bytes) => serde_json::from_slice(&bytes).unwrap_or_default(),
            None => CoordinatorState::default(),
        };

        if state.workers.is_empty() {
            info!("bootstrapping load coordinator with {min_containers} workers");
            for _ in 0..min_containers {
                state.create_worker();
            }
        }

        persist_state(&db, &state)?;

        let coordinator = Self {
            state: Mutex::new(state),
            db,
            max_connections_per_container,
            min_containers,
            scale_down_idle_time,
        };
        Ok(Arc::new(coordinator))
    }

    fn persist(&self, state: &CoordinatorState) -> anyhow::Result<()> {
        persist_state(&self.db, state)
    }

    /// Returns the worker already assigned to `session_id`, or assigns the
    /// least-loaded worker under capacity (creating a new one if none has
    /// room).
    pub async fn assign(&self, session_id: &str) -> anyhow::Result<String> {
        let mut guard = self.state.lock().await;
        if let Some(existing) = guard.session_to_worker.get(session_id) {
            return Ok(existing.clone());
        }

        let cap = self.max_connections_per_container;
        let candidate = guard
            .workers
            .values()
            .filter(|w| w.active_connections < cap)
            .min_by_key(|w| w.active_connections)
            .map(|w| w.id.clone());

        let worker_id = candidate.unwrap_or_else(|| guard.create_worker());
        self.persist(&guard)?;
        Ok(worker_id)
    }

    pub async fn connection_opened(&self, session_id: &str, worker_id: &str) -> anyhow::Result<()> {
        let mut guard = self.state.lock().await;
        let now = SystemTime::now();
        if let Some(worker) = guard.workers.get_mut(worker_id) {
            worker.active_connections += 1;
            worker.last_activity = now;
        } else {
            warn!("connectionOpened for unknown worker {worker_id}");
        }
        guard.session_to_worker.insert(session_id.to_string(), worker_id.to_string());
        self.persist(&guard)?;
        Ok(())
    }

    pub async fn connection_closed(&self, session_id: &str, worker_id: &str) -> anyhow::Result<()> {
        let mut guard = self.state.lock().await;
        let now = SystemTime::now();
        if let Some(worker) = guard.workers.get_mut(worker_id) {
            worker.active_connections = worker.active_connections.saturating_sub(1);
            worker.last_activity = now;
        }
        guard.session_to_worker.remove(session_id);

        while guard.workers.len() > self.min_containers {
            let victim = guard.workers.values().find_map(|w| {
                let idle_long_enough = now
                    .duration_since(w.last_activity)
                    .map(|idle| idle > self.scale_down_idle_time)
                    .unwrap_or(false);
                (w.active_connections == 0 && idle_long_enough).then(|| w.id.clone())
            });
            match victim {
                Some(id) => {
                    guard.workers.remove(&id);
                    info!("scaled down idle worker {id}");
                }
                None => break,
            }
        }

        self.persist(&guard)?;
        Ok(())
    }

    pub async fn worker_snapshots(&self) -> Vec<WorkerSnapshot> {
        let guard = self.state.lock().await;
        guard
            .workers
            .values()
            .map(|w| WorkerSnapshot { id: w.id.clone(), active_connections: w.active_connections })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_db_path(name: &str) -> std::path::PathBuf {
        let mut path = std::env::temp_dir();
        path.push(format!("translate-proxy-coordinator-test-{name}-{}", std::process::id()));
        path
    }

    #[tokio::test]
    async fn bootstrap_allocates_min_containers() {
        let path = temp_db_path("bootstrap");
        let _ = std::fs::remove_dir_all(&path);
        let coordinator = LoadCoordinator::open(&path, 10, 2, Duration::from_secs(600)).unwrap();
        assert_eq!(coordinator.worker_snapshots().await.len(), 2);
        let _ = std::fs::remove_dir_all(&path);
    }

    #[tokio::test]
    async fn repeated_assign_for_same_session_returns_same_worker() {
        let path = temp_db_path("repeat-assign");
        let _ = std::fs::remove_dir_all(&path);
        let coordinator = LoadCoordinator::open(&path, 10, 2, Duration::from_secs(600)).unwrap();
        // The mapping is upserted by `connection_opened`, not `assign` itself
        // (spec.md §4.7) - a caller is expected to report the connection as
        // opened right after assigning it, as the edge does.
        let first = coordinator.assign("s1").await.unwrap();
        coordinator.connection_opened("s1", &first).await.unwrap();
        let second = coordinator.assign("s1").await.unwrap();
        assert_eq!(first, second);
        let _ = std::fs::remove_dir_all(&path);
    }

    #[tokio::test]
    async fn autoscale_fill_and_spill() {
        let path = temp_db_path("fill-and-spill");
        let _ = std::fs::remove_dir_all(&path);
        let coordinator = LoadCoordinator::open(&path, 2, 2, Duration::from_secs(600)).unwrap();

        for session in ["s1", "s2", "s3", "s4", "s5"] {
            let worker = coordinator.assign(session).await.unwrap();
            coordinator.connection_opened(session, &worker).await.unwrap();
        }

        let snapshots = coordinator.worker_snapshots().await;
        assert_eq!(snapshots.len(), 3, "expected exactly 3 workers after the fifth assignment");
        let mut counts: Vec<u32> = snapshots.iter().map(|w| w.active_connections).collect();
        counts.sort_unstable();
        assert_eq!(counts, vec![1, 2, 2]);

        let _ = std::fs::remove_dir_all(&path);
    }

    #[tokio::test]
    async fn scale_down_removes_idle_worker_above_min_containers() {
        let path = temp_db_path("scale-down");
        let _ = std::fs::remove_dir_all(&path);
        let coordinator = LoadCoordinator::open(&path, 2, 1, Duration::from_millis(0)).unwrap();

        let w1 = coordinator.assign("s1").await.unwrap();
        coordinator.connection_opened("s1", &w1).await.unwrap();
        let w2 = coordinator.assign("s2").await.unwrap();
        coordinator.connection_opened("s2", &w2).await.unwrap();
        assert_eq!(coordinator.worker_snapshots().await.len(), 2);

        coordinator.connection_closed("s2", &w2).await.unwrap();
        let snapshots = coordinator.worker_snapshots().await;
        assert_eq!(snapshots.len(), 1, "idle worker above min_containers should scale down");
        assert_eq!(snapshots[0].id, w1);

        let _ = std::fs::remove_dir_all(&path);
    }
}
