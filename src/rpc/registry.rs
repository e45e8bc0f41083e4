//! Request registry
//!
//! Maps request id to in-flight request bookkeeping: method, params,
//! submission time, a per-request timeout task and the responder that
//! settles the caller's future. Each entry is settled exactly once, by
//! whichever of response, timeout, removal or bulk clear reaches it first.

use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::rpc::error::RpcError;

/// Outcome delivered to the caller of a request
pub type RpcResult = Result<Value, RpcError>;

/// One in-flight request
struct PendingRequest {
    method: String,
    params: Value,
    submitted_at: Instant,
    timeout_task: JoinHandle<()>,
    responder: oneshot::Sender<RpcResult>,
}

impl PendingRequest {
    fn settle(self, outcome: RpcResult) {
        self.timeout_task.abort();
        // Receiver may already be gone if the caller stopped waiting
        let _ = self.responder.send(outcome);
    }
}

type PendingMap = HashMap<String, PendingRequest>;

/// Registry of pending requests, cheap to clone
#[derive(Clone)]
pub struct RequestRegistry {
    pending: Arc<Mutex<PendingMap>>,
    default_timeout: Duration,
}

/// Read-only view of a pending entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingInfo {
    pub id: String,
    pub method: String,
    pub age_ms: u64,
}

impl RequestRegistry {
    /// Create a registry whose entries time out after `default_timeout`
    pub fn new(default_timeout: Duration) -> Self {
        Self {
            pending: Arc::new(Mutex::new(HashMap::new())),
            default_timeout,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PendingMap> {
        // Intentional .unwrap() - poisoned mutex indicates serious bug, panic is appropriate
        self.pending.lock().unwrap()
    }

    /// Register a request using the default timeout
    pub fn register(
        &self,
        id: String,
        method: &str,
        params: Value,
    ) -> Result<oneshot::Receiver<RpcResult>, RpcError> {
        self.register_with_timeout(id, method, params, self.default_timeout)
    }

    /// Register a request with an explicit timeout
    ///
    /// Fails with `DuplicateId` if `id` is already pending; ids are never
    /// reused while in flight.
    pub fn register_with_timeout(
        &self,
        id: String,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<oneshot::Receiver<RpcResult>, RpcError> {
        let mut pending = self.lock();
        if pending.contains_key(&id) {
            return Err(RpcError::DuplicateId(id));
        }

        let (responder, receiver) = oneshot::channel();

        // Spawned under the lock so the timer can never observe a missing entry
        let timeout_task = tokio::spawn(Self::expire_after(
            Arc::downgrade(&self.pending),
            id.clone(),
            timeout,
        ));

        pending.insert(
            id.clone(),
            PendingRequest {
                method: method.to_string(),
                params,
                submitted_at: Instant::now(),
                timeout_task,
                responder,
            },
        );

        debug!(
            "Added request to queue: {} ({}), queue size: {}",
            method,
            id,
            pending.len()
        );
        Ok(receiver)
    }

    async fn expire_after(pending: Weak<Mutex<PendingMap>>, id: String, timeout: Duration) {
        tokio::time::sleep(timeout).await;

        let Some(pending) = pending.upgrade() else {
            return;
        };
        let entry = match pending.lock() {
            Ok(mut map) => map.remove(&id),
            Err(_) => None,
        };

        if let Some(entry) = entry {
            warn!(
                "Request timed out: {} with id {} after {:?} (params: {})",
                entry.method, id, timeout, entry.params
            );
            let error = RpcError::Timeout {
                method: entry.method.clone(),
                id,
                timeout,
            };
            // Do not abort our own task; just deliver
            let _ = entry.responder.send(Err(error));
        }
    }

    /// Remove an entry without settling it (used when the write itself failed)
    pub fn remove(&self, id: &str) -> bool {
        let entry = self.lock().remove(id);
        match entry {
            Some(entry) => {
                entry.timeout_task.abort();
                debug!("Removed request from queue: {} ({})", entry.method, id);
                true
            }
            None => false,
        }
    }

    /// Resolve a pending request with a result
    pub fn resolve(&self, id: &str, value: Value) -> bool {
        let entry = self.lock().remove(id);
        match entry {
            Some(entry) => {
                debug!(
                    "Request {} ({}) resolved after {:?}",
                    entry.method,
                    id,
                    entry.submitted_at.elapsed()
                );
                entry.settle(Ok(value));
                true
            }
            None => false,
        }
    }

    /// Reject a pending request with an error
    pub fn reject(&self, id: &str, error: RpcError) -> bool {
        let entry = self.lock().remove(id);
        match entry {
            Some(entry) => {
                debug!("Request {} ({}) rejected: {}", entry.method, id, error);
                entry.settle(Err(error));
                true
            }
            None => false,
        }
    }

    /// Reject every pending request with `error`, returning how many were cleared
    pub fn clear(&self, error: RpcError) -> usize {
        let drained: Vec<(String, PendingRequest)> = self.lock().drain().collect();
        let count = drained.len();

        if count > 0 {
            warn!(
                "Clearing {} pending request(s) with error: {}",
                count, error
            );
        }
        for (_, entry) in drained {
            entry.settle(Err(error.clone()));
        }
        count
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Snapshot of pending entries, oldest first
    pub fn snapshot(&self) -> Vec<PendingInfo> {
        let mut entries: Vec<PendingInfo> = self
            .lock()
            .iter()
            .map(|(id, entry)| PendingInfo {
                id: id.clone(),
                method: entry.method.clone(),
                age_ms: entry.submitted_at.elapsed().as_millis() as u64,
            })
            .collect();
        entries.sort_by(|a, b| b.age_ms.cmp(&a.age_ms).then_with(|| a.id.cmp(&b.id)));
        entries
    }
}

impl std::fmt::Debug for RequestRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestRegistry")
            .field("pending", &self.len())
            .field("default_timeout", &self.default_timeout)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_resolve_settles_once() {
        let registry = RequestRegistry::new(Duration::from_secs(5));
        let rx = registry.register("a".to_string(), "m", json!({})).unwrap();

        assert_eq!(registry.len(), 1);
        assert!(registry.resolve("a", json!(1)));
        assert!(!registry.resolve("a", json!(2)));
        assert!(!registry.reject("a", RpcError::ShuttingDown));

        assert_eq!(rx.await.unwrap().unwrap(), json!(1));
        assert_eq!(registry.len(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_id_rejected() {
        let registry = RequestRegistry::new(Duration::from_secs(5));
        let _rx = registry.register("dup".to_string(), "m", json!({})).unwrap();
        let second = registry.register("dup".to_string(), "m", json!({}));
        assert!(matches!(second, Err(RpcError::DuplicateId(id)) if id == "dup"));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_timeout_rejects_exactly_once_and_late_response_is_dropped() {
        let registry = RequestRegistry::new(Duration::from_millis(30));
        let rx = registry
            .register("slow".to_string(), "tools/call", json!({}))
            .unwrap();

        let outcome = tokio::time::timeout(Duration::from_secs(2), rx)
            .await
            .expect("timeout should fire")
            .unwrap();
        match outcome {
            Err(RpcError::Timeout { method, id, .. }) => {
                assert_eq!(method, "tools/call");
                assert_eq!(id, "slow");
            }
            other => panic!("expected timeout, got {other:?}"),
        }

        assert_eq!(registry.len(), 0);
        assert!(!registry.resolve("slow", json!("late")));
    }

    #[tokio::test]
    async fn test_remove_cancels_without_settling() {
        let registry = RequestRegistry::new(Duration::from_millis(20));
        let rx = registry.register("w".to_string(), "m", json!({})).unwrap();

        assert!(registry.remove("w"));
        assert!(!registry.remove("w"));

        // Responder dropped without a value; the timer must not fire either
        assert!(rx.await.is_err());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(registry.len(), 0);
    }

    #[tokio::test]
    async fn test_clear_rejects_everything() {
        let registry = RequestRegistry::new(Duration::from_secs(5));
        let receivers: Vec<_> = (0..3)
            .map(|i| registry.register(format!("id-{i}"), "m", json!({})).unwrap())
            .collect();

        assert_eq!(registry.clear(RpcError::ShuttingDown), 3);
        assert_eq!(registry.len(), 0);

        for rx in receivers {
            assert!(matches!(rx.await.unwrap(), Err(RpcError::ShuttingDown)));
        }
        assert_eq!(registry.clear(RpcError::ShuttingDown), 0);
    }

    #[tokio::test]
    async fn test_snapshot_orders_oldest_first() {
        let registry = RequestRegistry::new(Duration::from_secs(5));
        let _a = registry.register("old".to_string(), "first", json!({})).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        let _b = registry.register("new".to_string(), "second", json!({})).unwrap();

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].id, "old");
        assert_eq!(snapshot[1].method, "second");
    }
}
