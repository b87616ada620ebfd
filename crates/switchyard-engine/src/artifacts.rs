//! Retention-scoped structured outputs produced by node runs.
//!
//! The store keeps its own lock, separate from the run store, so the
//! retention sweeper never contends with the coordinator. Artifacts past
//! their retention are hidden from reads immediately and physically removed
//! by [`ArtifactStore::prune`].

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use switchyard_types::{
    ArtifactId, FlowchartId, NodeId, Result, RunId, RunNodeId, SwitchyardError,
};
use tokio::task::JoinHandle;

use crate::clock::Clock;
use crate::events::{EventEmitter, RunEvent};

pub const PAYLOAD_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum RetentionPolicy {
    #[default]
    Forever,
    Ttl { ttl_seconds: u64 },
    MaxCount { max_count: u32 },
    TtlMaxCount { ttl_seconds: u64, max_count: u32 },
}

impl RetentionPolicy {
    pub fn ttl_seconds(&self) -> Option<u64> {
        match *self {
            RetentionPolicy::Ttl { ttl_seconds } | RetentionPolicy::TtlMaxCount { ttl_seconds, .. } => {
                Some(ttl_seconds)
            }
            _ => None,
        }
    }

    pub fn max_count(&self) -> Option<u32> {
        match *self {
            RetentionPolicy::MaxCount { max_count }
            | RetentionPolicy::TtlMaxCount { max_count, .. } => Some(max_count),
            _ => None,
        }
    }

    pub fn expires_at(&self, created_at: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let ttl = i64::try_from(self.ttl_seconds()?).unwrap_or(i64::MAX);
        created_at.checked_add_signed(chrono::Duration::seconds(ttl))
    }
}

/// Versioned structured blob: `{"version": n, "data": ...}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactPayload {
    pub version: u32,
    pub data: serde_json::Value,
}

impl ArtifactPayload {
    pub fn new(data: serde_json::Value) -> Self {
        Self {
            version: PAYLOAD_VERSION,
            data,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeArtifact {
    pub id: ArtifactId,
    pub flowchart_id: FlowchartId,
    pub flowchart_node_id: NodeId,
    pub flowchart_run_id: RunId,
    pub flowchart_run_node_id: RunNodeId,
    pub artifact_type: String,
    pub ref_id: Option<i64>,
    pub payload: ArtifactPayload,
    pub retention: RetentionPolicy,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub idempotency_key: String,
}

/// Everything needed to store one artifact.
#[derive(Debug, Clone)]
pub struct NewArtifact {
    pub flowchart_id: FlowchartId,
    pub flowchart_node_id: NodeId,
    pub flowchart_run_id: RunId,
    pub flowchart_run_node_id: RunNodeId,
    pub artifact_type: String,
    pub ref_id: Option<i64>,
    pub payload: ArtifactPayload,
    pub retention: RetentionPolicy,
    pub idempotency_key: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ArtifactFilter {
    #[serde(default)]
    pub flowchart_id: Option<FlowchartId>,
    #[serde(default)]
    pub flowchart_node_id: Option<NodeId>,
    #[serde(default)]
    pub flowchart_run_id: Option<RunId>,
    #[serde(default)]
    pub flowchart_run_node_id: Option<RunNodeId>,
    #[serde(default)]
    pub artifact_type: Option<String>,
    #[serde(default)]
    pub limit: Option<usize>,
}

impl ArtifactFilter {
    fn matches(&self, a: &NodeArtifact) -> bool {
        self.flowchart_id.map_or(true, |v| v == a.flowchart_id)
            && self.flowchart_node_id.map_or(true, |v| v == a.flowchart_node_id)
            && self.flowchart_run_id.map_or(true, |v| v == a.flowchart_run_id)
            && self
                .flowchart_run_node_id
                .map_or(true, |v| v == a.flowchart_run_node_id)
            && self
                .artifact_type
                .as_deref()
                .map_or(true, |t| t == a.artifact_type)
    }
}

#[derive(Debug, Default)]
struct ArtifactInner {
    next_id: ArtifactId,
    artifacts: BTreeMap<ArtifactId, NodeArtifact>,
}

impl ArtifactInner {
    /// Ids of every artifact past its retention at `now`.
    ///
    /// Count limits rank artifacts newest-first within their (flowchart,
    /// node) scope, each artifact judged by its own policy.
    fn prunable(&self, now: DateTime<Utc>) -> Vec<ArtifactId> {
        let mut scopes: HashMap<(FlowchartId, NodeId), Vec<&NodeArtifact>> = HashMap::new();
        for artifact in self.artifacts.values() {
            scopes
                .entry((artifact.flowchart_id, artifact.flowchart_node_id))
                .or_default()
                .push(artifact);
        }

        let mut doomed = Vec::new();
        for mut members in scopes.into_values() {
            members.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
            for (rank, artifact) in members.into_iter().enumerate() {
                let expired = artifact.expires_at.map_or(false, |at| at <= now);
                let over_count = artifact
                    .retention
                    .max_count()
                    .map_or(false, |max| rank >= max as usize);
                if expired || over_count {
                    doomed.push(artifact.id);
                }
            }
        }
        doomed.sort_unstable();
        doomed
    }
}

/// In-process artifact storage with retention enforcement.
#[derive(Debug, Default)]
pub struct ArtifactStore {
    inner: Mutex<ArtifactInner>,
}

impl ArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, ArtifactInner>> {
        self.inner.lock().map_err(|_| SwitchyardError::LockPoisoned)
    }

    /// Store an artifact, or return the existing one when the same run node
    /// already stored this idempotency key.
    pub fn store(&self, new: NewArtifact, now: DateTime<Utc>) -> Result<NodeArtifact> {
        let mut inner = self.lock()?;
        if let Some(existing) = inner.artifacts.values().find(|a| {
            a.flowchart_run_node_id == new.flowchart_run_node_id
                && a.idempotency_key == new.idempotency_key
        }) {
            return Ok(existing.clone());
        }

        inner.next_id += 1;
        let artifact = NodeArtifact {
            id: inner.next_id,
            flowchart_id: new.flowchart_id,
            flowchart_node_id: new.flowchart_node_id,
            flowchart_run_id: new.flowchart_run_id,
            flowchart_run_node_id: new.flowchart_run_node_id,
            artifact_type: new.artifact_type,
            ref_id: new.ref_id,
            payload: new.payload,
            retention: new.retention,
            created_at: now,
            expires_at: new.retention.expires_at(now),
            idempotency_key: new.idempotency_key,
        };
        inner.artifacts.insert(artifact.id, artifact.clone());
        tracing::debug!(
            artifact_id = artifact.id,
            run_node_id = artifact.flowchart_run_node_id,
            artifact_type = %artifact.artifact_type,
            "Artifact stored"
        );
        Ok(artifact)
    }

    /// Matching artifacts, newest first, excluding anything past retention.
    pub fn list(&self, filter: &ArtifactFilter, now: DateTime<Utc>) -> Result<Vec<NodeArtifact>> {
        let inner = self.lock()?;
        let hidden = inner.prunable(now);
        let mut out: Vec<NodeArtifact> = inner
            .artifacts
            .values()
            .filter(|a| filter.matches(a) && hidden.binary_search(&a.id).is_err())
            .cloned()
            .collect();
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        if let Some(limit) = filter.limit {
            out.truncate(limit);
        }
        Ok(out)
    }

    /// The newest retained artifact a node produced, across all runs.
    pub fn latest_for_node(
        &self,
        flowchart_id: FlowchartId,
        node_id: NodeId,
        now: DateTime<Utc>,
    ) -> Result<Option<NodeArtifact>> {
        let filter = ArtifactFilter {
            flowchart_id: Some(flowchart_id),
            flowchart_node_id: Some(node_id),
            limit: Some(1),
            ..Default::default()
        };
        Ok(self.list(&filter, now)?.into_iter().next())
    }

    /// Delete every artifact past retention. Returns how many were removed.
    pub fn prune(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut inner = self.lock()?;
        let doomed = inner.prunable(now);
        for id in &doomed {
            inner.artifacts.remove(id);
        }
        Ok(doomed.len())
    }

    pub fn export(&self) -> Result<Vec<NodeArtifact>> {
        Ok(self.lock()?.artifacts.values().cloned().collect())
    }

    /// Replace the store's contents, e.g. from a persisted snapshot.
    pub fn import(&self, artifacts: Vec<NodeArtifact>) -> Result<()> {
        let mut inner = self.lock()?;
        inner.next_id = artifacts.iter().map(|a| a.id).max().unwrap_or(0);
        inner.artifacts = artifacts.into_iter().map(|a| (a.id, a)).collect();
        Ok(())
    }
}

/// Periodically prune expired artifacts on a dedicated task.
pub fn spawn_retention_sweeper(
    store: Arc<ArtifactStore>,
    clock: Arc<dyn Clock>,
    interval: Duration,
    events: EventEmitter,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match store.prune(clock.now()) {
                Ok(0) => {}
                Ok(count) => {
                    tracing::info!(count, "Pruned expired artifacts");
                    events.emit(RunEvent::ArtifactsPruned { count });
                }
                Err(e) => tracing::warn!(error = %e, "Artifact retention sweep failed"),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use serde_json::json;

    fn artifact(run_node: RunNodeId, key: &str, retention: RetentionPolicy) -> NewArtifact {
        NewArtifact {
            flowchart_id: 1,
            flowchart_node_id: 7,
            flowchart_run_id: 1,
            flowchart_run_node_id: run_node,
            artifact_type: "output".into(),
            ref_id: None,
            payload: ArtifactPayload::new(json!({"n": run_node})),
            retention,
            idempotency_key: key.into(),
        }
    }

    #[test]
    fn store_is_idempotent_per_run_node_and_key() {
        let store = ArtifactStore::new();
        let now = Utc::now();
        let a = store.store(artifact(1, "k", RetentionPolicy::Forever), now).unwrap();
        let b = store.store(artifact(1, "k", RetentionPolicy::Forever), now).unwrap();
        let c = store.store(artifact(2, "k", RetentionPolicy::Forever), now).unwrap();
        assert_eq!(a.id, b.id);
        assert_ne!(a.id, c.id);
        assert_eq!(store.export().unwrap().len(), 2);
    }

    #[test]
    fn payload_serializes_versioned() {
        let payload = ArtifactPayload::new(json!({"answer": 42}));
        assert_eq!(
            serde_json::to_value(&payload).unwrap(),
            json!({"version": 1, "data": {"answer": 42}})
        );
    }

    #[test]
    fn ttl_hides_then_prunes() {
        let store = ArtifactStore::new();
        let t0 = Utc::now();
        store
            .store(artifact(1, "k", RetentionPolicy::Ttl { ttl_seconds: 60 }), t0)
            .unwrap();

        let filter = ArtifactFilter::default();
        assert_eq!(store.list(&filter, t0 + chrono::Duration::seconds(59)).unwrap().len(), 1);
        assert!(store.list(&filter, t0 + chrono::Duration::seconds(60)).unwrap().is_empty());
        assert_eq!(store.prune(t0 + chrono::Duration::seconds(61)).unwrap(), 1);
        assert!(store.export().unwrap().is_empty());
    }

    #[test]
    fn ttl_max_count_prunes_on_either_condition() {
        let store = ArtifactStore::new();
        let policy = RetentionPolicy::TtlMaxCount {
            ttl_seconds: 100,
            max_count: 2,
        };
        let t0 = Utc::now();
        store.store(artifact(1, "a", policy), t0).unwrap();

        // Past TTL while still under the count limit.
        assert_eq!(store.prune(t0 + chrono::Duration::seconds(150)).unwrap(), 1);

        let t1 = t0 + chrono::Duration::seconds(200);
        let first = store.store(artifact(2, "b", policy), t1).unwrap();
        store.store(artifact(3, "c", policy), t1 + chrono::Duration::seconds(1)).unwrap();
        store.store(artifact(4, "d", policy), t1 + chrono::Duration::seconds(2)).unwrap();

        // Third artifact pushes the oldest out before any expiry.
        let now = t1 + chrono::Duration::seconds(3);
        let listed = store.list(&ArtifactFilter::default(), now).unwrap();
        assert_eq!(listed.len(), 2);
        assert!(listed.iter().all(|a| a.id != first.id));
        assert_eq!(store.prune(now).unwrap(), 1);
    }

    #[test]
    fn max_count_scoped_per_node() {
        let store = ArtifactStore::new();
        let policy = RetentionPolicy::MaxCount { max_count: 1 };
        let now = Utc::now();
        store.store(artifact(1, "a", policy), now).unwrap();
        let mut other = artifact(2, "b", policy);
        other.flowchart_node_id = 8;
        store.store(other, now).unwrap();
        assert_eq!(store.prune(now).unwrap(), 0);
    }

    #[test]
    fn list_newest_first_and_latest_for_node() {
        let store = ArtifactStore::new();
        let t0 = Utc::now();
        store.store(artifact(1, "a", RetentionPolicy::Forever), t0).unwrap();
        let newer = store
            .store(artifact(2, "b", RetentionPolicy::Forever), t0 + chrono::Duration::seconds(5))
            .unwrap();
        let listed = store.list(&ArtifactFilter::default(), t0).unwrap();
        assert_eq!(listed[0].id, newer.id);

        let latest = store.latest_for_node(1, 7, t0).unwrap().unwrap();
        assert_eq!(latest.id, newer.id);
        assert!(store.latest_for_node(1, 99, t0).unwrap().is_none());
    }

    #[tokio::test]
    async fn sweeper_prunes_on_interval() {
        let store = Arc::new(ArtifactStore::new());
        let clock = Arc::new(ManualClock::default());
        store
            .store(artifact(1, "k", RetentionPolicy::Ttl { ttl_seconds: 1 }), clock.now())
            .unwrap();
        clock.advance(chrono::Duration::seconds(5));

        let events = EventEmitter::new(8);
        let mut rx = events.subscribe();
        let handle = spawn_retention_sweeper(
            store.clone(),
            clock.clone(),
            Duration::from_millis(10),
            events,
        );

        let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(event, RunEvent::ArtifactsPruned { count: 1 }));
        assert!(store.export().unwrap().is_empty());
        handle.abort();
    }
}
