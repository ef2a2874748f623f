//! The production memory-based node registry.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use torii_api::*;

/// Settings keys read by [MemRegistry].
mod keys {
    /// Seconds of silence before a node is reaped.
    pub const SILENCE_SECS: &str = "security.node_silence_secs";
    /// Seconds between reaper sweeps.
    pub const REAP_INTERVAL_SECS: &str = "registry.reap_interval_secs";
}

const DEFAULT_SILENCE_SECS: u64 = 30;
const DEFAULT_REAP_INTERVAL_SECS: u64 = 1;

/// The production memory-based node registry factory.
///
/// The membership table lives in a hash map guarded by one mutex; all
/// mutation happens under it, so readers always see a consistent
/// snapshot. Nothing here persists: the registry is rebuilt from live
/// connections after a restart.
#[derive(Debug)]
pub struct MemRegistryFactory {}

impl MemRegistryFactory {
    /// Construct a new MemRegistryFactory.
    pub fn create() -> DynNodeRegistryFactory {
        let out: DynNodeRegistryFactory = Arc::new(Self {});
        out
    }
}

impl NodeRegistryFactory for MemRegistryFactory {
    fn default_config(&self, settings: &SettingsStore) -> ToriiResult<()> {
        settings.seed_default(
            keys::SILENCE_SECS,
            serde_json::json!(DEFAULT_SILENCE_SECS),
        )?;
        settings.seed_default(
            keys::REAP_INTERVAL_SECS,
            serde_json::json!(DEFAULT_REAP_INTERVAL_SECS),
        )
    }

    fn validate_config(&self, settings: &SettingsStore) -> ToriiResult<()> {
        if settings.get_or(keys::SILENCE_SECS, DEFAULT_SILENCE_SECS) == 0 {
            return Err(ToriiError::other(format!(
                "{} must be non-zero",
                keys::SILENCE_SECS
            )));
        }
        Ok(())
    }

    fn create(
        &self,
        builder: Arc<Builder>,
    ) -> BoxFut<'static, ToriiResult<DynNodeRegistry>> {
        Box::pin(async move {
            let out: DynNodeRegistry =
                Arc::new(MemRegistry::new(builder.settings.clone()));
            Ok(out)
        })
    }
}

struct MemRegistry {
    inner: Arc<Mutex<Inner>>,
    reap_task: tokio::task::JoinHandle<()>,
}

impl std::fmt::Debug for MemRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemRegistry").finish()
    }
}

impl Drop for MemRegistry {
    fn drop(&mut self) {
        self.reap_task.abort();
    }
}

impl MemRegistry {
    pub fn new(settings: SettingsStore) -> Self {
        let inner = Arc::new(Mutex::new(Inner::new()));

        let reap_inner = inner.clone();
        let reap_task =
            tokio::task::spawn(reap_task(settings, reap_inner));

        Self { inner, reap_task }
    }
}

async fn reap_task(settings: SettingsStore, inner: Arc<Mutex<Inner>>) {
    loop {
        let interval = settings.get_or(
            keys::REAP_INTERVAL_SECS,
            DEFAULT_REAP_INTERVAL_SECS,
        );
        tokio::time::sleep(std::time::Duration::from_secs(interval.max(1)))
            .await;

        // the threshold is re-read every sweep so a settings update
        // applies without a restart
        let silence = std::time::Duration::from_secs(
            settings.get_or(keys::SILENCE_SECS, DEFAULT_SILENCE_SECS),
        );

        let (reaped, listeners) = {
            let mut guard = inner.lock().unwrap();
            let expired: Vec<NodeId> = guard
                .by_uuid
                .values()
                .filter(|n| {
                    !n.forced_never_silent
                        && n.last_heartbeat.elapsed() > silence
                })
                .map(|n| n.id)
                .collect();
            let reaped: Vec<Arc<NodeInfo>> = expired
                .into_iter()
                .filter_map(|id| guard.remove(id))
                .collect();
            (reaped, guard.listeners.clone())
        };

        for node in reaped {
            tracing::info!(id = %node.id, node_type = ?node.node_type,
                "reaping silent node");
            for l in listeners.iter() {
                l(NodeEvent::Removed(node.clone()));
            }
        }
    }
}

impl NodeRegistry for MemRegistry {
    fn add(
        &self,
        new_node: NewNode,
    ) -> BoxFut<'_, ToriiResult<Arc<NodeInfo>>> {
        Box::pin(async move {
            let (node, listeners) = {
                let mut guard = self.inner.lock().unwrap();
                let node = guard.add(new_node)?;
                (node, guard.listeners.clone())
            };
            for l in listeners.iter() {
                l(NodeEvent::Added(node.clone()));
            }
            Ok(node)
        })
    }

    fn remove(
        &self,
        id: NodeId,
    ) -> BoxFut<'_, ToriiResult<Option<Arc<NodeInfo>>>> {
        Box::pin(async move {
            let (node, listeners) = {
                let mut guard = self.inner.lock().unwrap();
                (guard.remove(id), guard.listeners.clone())
            };
            if let Some(node) = node.as_ref() {
                for l in listeners.iter() {
                    l(NodeEvent::Removed(node.clone()));
                }
            }
            Ok(node)
        })
    }

    fn get(
        &self,
        id: NodeId,
    ) -> BoxFut<'_, ToriiResult<Option<Arc<NodeInfo>>>> {
        Box::pin(async move {
            Ok(self.inner.lock().unwrap().by_uuid.get(&id).cloned())
        })
    }

    fn get_by_local_id(
        &self,
        id: LocalId,
    ) -> BoxFut<'_, ToriiResult<Option<Arc<NodeInfo>>>> {
        Box::pin(async move {
            let guard = self.inner.lock().unwrap();
            Ok(guard
                .by_local
                .get(&id)
                .and_then(|uuid| guard.by_uuid.get(uuid))
                .cloned())
        })
    }

    fn get_all(&self) -> BoxFut<'_, ToriiResult<Vec<Arc<NodeInfo>>>> {
        Box::pin(async move {
            Ok(self
                .inner
                .lock()
                .unwrap()
                .by_uuid
                .values()
                .cloned()
                .collect())
        })
    }

    fn for_each<'a>(
        &'a self,
        mut visit: Box<dyn FnMut(&NodeInfo) + Send + 'a>,
    ) -> BoxFut<'a, ToriiResult<()>> {
        Box::pin(async move {
            // visit a snapshot, not the live table, so the callback can
            // call back into the registry without deadlocking
            let all: Vec<Arc<NodeInfo>> = self
                .inner
                .lock()
                .unwrap()
                .by_uuid
                .values()
                .cloned()
                .collect();
            for node in all {
                visit(&node);
            }
            Ok(())
        })
    }

    fn set_interest_set(
        &self,
        id: NodeId,
        interest_set: InterestSet,
    ) -> BoxFut<'_, ToriiResult<()>> {
        Box::pin(async move {
            self.inner
                .lock()
                .unwrap()
                .mutate(id, |n| n.interest_set = interest_set)
        })
    }

    fn set_permissions(
        &self,
        id: NodeId,
        permissions: Permissions,
    ) -> BoxFut<'_, ToriiResult<()>> {
        Box::pin(async move {
            self.inner
                .lock()
                .unwrap()
                .mutate(id, |n| n.permissions = permissions)
        })
    }

    fn touch(
        &self,
        id: NodeId,
        now: Timestamp,
    ) -> BoxFut<'_, ToriiResult<()>> {
        Box::pin(async move {
            self.inner
                .lock()
                .unwrap()
                .mutate(id, |n| n.last_heartbeat = now)
        })
    }

    fn set_stats(
        &self,
        id: NodeId,
        stats: serde_json::Value,
    ) -> BoxFut<'_, ToriiResult<()>> {
        Box::pin(async move {
            let mut guard = self.inner.lock().unwrap();
            if !guard.by_uuid.contains_key(&id) {
                return Err(ToriiError::other("node not live"));
            }
            guard.stats.insert(id, stats);
            Ok(())
        })
    }

    fn get_stats(
        &self,
        id: NodeId,
    ) -> BoxFut<'_, ToriiResult<Option<serde_json::Value>>> {
        Box::pin(async move {
            Ok(self.inner.lock().unwrap().stats.get(&id).cloned())
        })
    }

    fn connection_secret(
        &self,
        a: NodeId,
        b: NodeId,
    ) -> BoxFut<'_, ToriiResult<SessionSecret>> {
        Box::pin(async move {
            let mut guard = self.inner.lock().unwrap();
            Ok(*guard
                .secrets
                .entry(secret_key(a, b))
                .or_insert_with(SessionSecret::generate))
        })
    }

    fn count_agents(&self) -> BoxFut<'_, ToriiResult<usize>> {
        Box::pin(async move {
            Ok(self
                .inner
                .lock()
                .unwrap()
                .by_uuid
                .values()
                .filter(|n| n.node_type.is_agent())
                .count())
        })
    }

    fn register_event_listener(
        &self,
        listener: NodeEventListener,
    ) -> ToriiResult<()> {
        self.inner.lock().unwrap().listeners.push(listener);
        Ok(())
    }
}

/// The secret table is keyed by the unordered node-id pair; both nodes
/// dereference through the registry rather than holding each other.
fn secret_key(a: NodeId, b: NodeId) -> (NodeId, NodeId) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

struct Inner {
    by_uuid: HashMap<NodeId, Arc<NodeInfo>>,
    by_local: HashMap<LocalId, NodeId>,
    free_local_ids: Vec<LocalId>,
    next_local_id: u16,
    secrets: HashMap<(NodeId, NodeId), SessionSecret>,
    stats: HashMap<NodeId, serde_json::Value>,
    listeners: Vec<NodeEventListener>,
}

impl Inner {
    pub fn new() -> Self {
        Self {
            by_uuid: HashMap::new(),
            by_local: HashMap::new(),
            free_local_ids: Vec::new(),
            // zero is reserved as the never-assigned handle
            next_local_id: 1,
            secrets: HashMap::new(),
            stats: HashMap::new(),
            listeners: Vec::new(),
        }
    }

    fn allocate_local_id(&mut self) -> ToriiResult<LocalId> {
        if let Some(id) = self.free_local_ids.pop() {
            return Ok(id);
        }
        if self.next_local_id == u16::MAX {
            return Err(ToriiError::other("local id space exhausted"));
        }
        let id = LocalId(self.next_local_id);
        self.next_local_id += 1;
        Ok(id)
    }

    pub fn add(&mut self, new_node: NewNode) -> ToriiResult<Arc<NodeInfo>> {
        // a re-admission under the same uuid keeps its local id and
        // its controller secret
        let (local_id, connection_secret) =
            match self.by_uuid.get(&new_node.id) {
                Some(prev) => (prev.local_id, prev.connection_secret),
                None => {
                    (self.allocate_local_id()?, SessionSecret::generate())
                }
            };

        let now = Timestamp::now();
        let node = Arc::new(NodeInfo {
            id: new_node.id,
            local_id,
            node_type: new_node.node_type,
            sockets: new_node.sockets,
            active_socket: new_node.active_socket,
            permissions: new_node.permissions,
            connection_secret,
            interest_set: new_node.interest_set,
            place_name: new_node.place_name,
            version: new_node.version,
            wake_timestamp: now,
            last_heartbeat: now,
            assignment_id: new_node.assignment_id,
            identity: new_node.identity,
            forced_never_silent: new_node.node_type.is_replication(),
        });

        self.by_uuid.insert(node.id, node.clone());
        self.by_local.insert(local_id, node.id);
        Ok(node)
    }

    pub fn remove(&mut self, id: NodeId) -> Option<Arc<NodeInfo>> {
        let node = self.by_uuid.remove(&id)?;
        self.by_local.remove(&node.local_id);
        self.free_local_ids.push(node.local_id);
        self.stats.remove(&id);
        self.secrets.retain(|(a, b), _| *a != id && *b != id);
        Some(node)
    }

    fn mutate(
        &mut self,
        id: NodeId,
        f: impl FnOnce(&mut NodeInfo),
    ) -> ToriiResult<()> {
        match self.by_uuid.get_mut(&id) {
            None => Err(ToriiError::other("node not live")),
            Some(node) => {
                let mut updated = (**node).clone();
                f(&mut updated);
                *node = Arc::new(updated);
                Ok(())
            }
        }
    }
}
