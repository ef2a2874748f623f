//! The static-assignment queue: keeps worker processes respawned and
//! deploys uploaded scripts.
//!
//! Unfulfilled assignments live in an ordered list, FIFO within equal
//! priority, with non-agent types sorting before agent types so mixers
//! come up first. Deployment hands out a clone with a freshly generated
//! uuid; the original static assignment stays queued (rotated to the
//! back) until the worker actually connects and binds it. When a bound
//! worker dies, the assignment's uuid is rotated again and it re-enters
//! the queue at the front of its type class, so no stale worker can
//! reconnect under a consumed id.

use crate::dispatch::*;
use std::collections::{HashMap, VecDeque};
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};
use torii_api::protocol as proto;
use torii_api::*;

/// Settings keys read by [AssignmentQueue].
mod keys {
    /// Extra subnets allowed to request assignments, as `a.b.c.d/len`.
    pub const ALLOWED_SUBNETS: &str = "assignment.allowed_subnets";
}

struct Inner {
    /// Unfulfilled worker-type assignments, FIFO.
    workers: VecDeque<Assignment>,
    /// Unfulfilled agent-type (script) assignments, FIFO.
    agents: VecDeque<Assignment>,
    /// Handed-out deployments: clone uuid → the original assignment.
    pending_assigned: HashMap<AssignmentId, Assignment>,
    /// Assignments bound to a live worker node.
    fulfilled: HashMap<NodeId, Assignment>,
}

impl Inner {
    fn class_of(
        &mut self,
        node_type: NodeType,
    ) -> &mut VecDeque<Assignment> {
        if node_type.is_agent() {
            &mut self.agents
        } else {
            &mut self.workers
        }
    }
}

/// The assignment queue.
pub struct AssignmentQueue {
    settings: SettingsStore,
    scripts_dir: Option<std::path::PathBuf>,
    inner: Mutex<Inner>,
}

impl std::fmt::Debug for AssignmentQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AssignmentQueue").finish()
    }
}

impl AssignmentQueue {
    /// Construct an assignment queue. `scripts_dir` holds uploaded
    /// script payloads keyed by assignment uuid; `None` disables the
    /// on-disk mirror (tests).
    pub fn new(
        settings: SettingsStore,
        scripts_dir: Option<std::path::PathBuf>,
    ) -> Arc<Self> {
        Arc::new(Self {
            settings,
            scripts_dir,
            inner: Mutex::new(Inner {
                workers: VecDeque::new(),
                agents: VecDeque::new(),
                pending_assigned: HashMap::new(),
                fulfilled: HashMap::new(),
            }),
        })
    }

    /// Hook this queue into the packet dispatch and the registry's
    /// death notifications.
    pub fn register(
        self: Arc<Self>,
        dispatch: &PacketDispatch,
        datagrams: DynDatagrams,
        registry: &DynNodeRegistry,
    ) -> ToriiResult<()> {
        let this = self.clone();
        let dg = datagrams.clone();
        dispatch.register_handler(
            proto::PacketType::RequestAssignment,
            Arc::new(move |packet: InboundPacket| {
                let this = this.clone();
                let dg = dg.clone();
                tokio::task::spawn(async move {
                    this.handle_request(packet, dg).await;
                });
            }),
        );

        let this = self.clone();
        registry.register_event_listener(Arc::new(move |event| {
            if let NodeEvent::Removed(node) = event {
                this.handle_node_death(&node);
            }
        }))
    }

    /// Seed the queue with the statically configured assignments.
    pub fn seed_static(&self, assignments: Vec<Assignment>) {
        let mut inner = self.inner.lock().unwrap();
        for a in assignments {
            tracing::info!(id = %a.id, node_type = ?a.node_type, pool = %a.pool,
                "queueing static assignment");
            inner.class_of(a.node_type).push_back(a);
        }
    }

    /// Create `count` ephemeral script assignments in `pool`, mirroring
    /// the script bytes to disk keyed by each assignment uuid.
    pub fn create_scripted(
        &self,
        count: usize,
        pool: impl Into<String>,
        script: bytes::Bytes,
    ) -> ToriiResult<Vec<AssignmentId>> {
        let pool = pool.into();
        let mut out = Vec::with_capacity(count);
        let mut created = Vec::with_capacity(count);
        for _ in 0..count {
            let a = Assignment::new_script(pool.clone(), script.clone());
            if let Some(dir) = self.scripts_dir.as_ref() {
                std::fs::create_dir_all(dir).map_err(|e| {
                    ToriiError::other_src("create scripts dir", e)
                })?;
                std::fs::write(dir.join(a.id.to_string()), &script)
                    .map_err(|e| {
                        ToriiError::other_src("write script payload", e)
                    })?;
            }
            out.push(a.id);
            created.push(a);
        }
        let mut inner = self.inner.lock().unwrap();
        for a in created {
            inner.agents.push_back(a);
        }
        Ok(out)
    }

    /// `true` if `id` is a handed-out deployment awaiting its worker.
    pub fn is_pending(&self, id: AssignmentId) -> bool {
        self.inner.lock().unwrap().pending_assigned.contains_key(&id)
    }

    /// Resolve a handed-out deployment to its original assignment and
    /// bind it to the admitted worker node.
    pub fn bind(
        &self,
        deployment: AssignmentId,
        node: NodeId,
    ) -> Option<Assignment> {
        let mut inner = self.inner.lock().unwrap();
        let original = inner.pending_assigned.remove(&deployment)?;
        // two deployments of one static assignment can race; only the
        // first worker to connect binds it
        if inner.fulfilled.values().any(|a| a.id == original.id) {
            return None;
        }
        // the static original was left queued while the deployment was
        // in flight; it is fulfilled now
        inner
            .class_of(original.node_type)
            .retain(|a| a.id != original.id);
        inner.fulfilled.insert(node, original.clone());
        Some(original)
    }

    /// Queue + pending state for the admin surface.
    pub fn snapshot(&self) -> serde_json::Value {
        let inner = self.inner.lock().unwrap();
        let queued: Vec<&Assignment> =
            inner.workers.iter().chain(inner.agents.iter()).collect();
        let pending: HashMap<String, &Assignment> = inner
            .pending_assigned
            .iter()
            .map(|(id, a)| (id.to_string(), a))
            .collect();
        serde_json::json!({
            "queued": queued,
            "pending": pending,
        })
    }

    async fn handle_request(
        &self,
        packet: InboundPacket,
        datagrams: DynDatagrams,
    ) {
        if !self.sender_allowed(&packet.sender) {
            tracing::debug!(sender = %packet.sender,
                "refusing assignment request from outside allowed subnets");
            return;
        }

        let req = match proto::RequestAssignment::decode(packet.payload) {
            Ok(req) => req,
            Err(err) => {
                tracing::debug!(?err, "undecodable assignment request");
                return;
            }
        };

        let deployed = match self.deploy(req.node_type, &req.pool) {
            Some(deployed) => deployed,
            None => return,
        };

        let wire = proto::encode_unsourced(
            proto::PacketType::CreateAssignment,
            packet.header.sequence,
            &proto::CreateAssignment {
                id: deployed.id,
                node_type: deployed.node_type,
                pool: deployed.pool.clone(),
                payload: deployed.payload.clone().unwrap_or_default(),
            }
            .encode(),
        );
        if let Err(err) = datagrams.send(packet.sender, wire).await {
            tracing::debug!(?err, sender = %packet.sender,
                "failed to send assignment deployment");
        }
    }

    /// Walk the queue for the first entry matching `node_type` (`None`
    /// for all-types) and `pool`, and hand out a fresh-uuid clone,
    /// recording it as a pending deployment.
    pub fn deploy(
        &self,
        node_type: Option<NodeType>,
        pool: &str,
    ) -> Option<Assignment> {
        let mut guard = self.inner.lock().unwrap();
        let inner = &mut *guard;

        for class in [&mut inner.workers, &mut inner.agents] {
            let idx =
                class.iter().position(|a| a.matches(node_type, pool));
            if let Some(idx) = idx {
                let original = class.remove(idx).expect("index just found");
                let clone = Assignment {
                    id: AssignmentId::generate(),
                    ..original.clone()
                };
                if original.is_static {
                    // stays deployable if this worker never shows up
                    class.push_back(original.clone());
                }
                tracing::info!(deployment = %clone.id, original = %original.id,
                    node_type = ?clone.node_type, "deploying assignment");
                inner.pending_assigned.insert(clone.id, original);
                return Some(clone);
            }
        }
        None
    }

    /// A dead worker's static assignment re-enters the queue at the
    /// front of its class under a rotated uuid.
    fn handle_node_death(&self, node: &NodeInfo) {
        let mut inner = self.inner.lock().unwrap();
        let mut assignment = match inner.fulfilled.remove(&node.id) {
            Some(a) => a,
            None => return,
        };
        if !assignment.is_static {
            tracing::debug!(id = %assignment.id,
                "retiring ephemeral assignment with its node");
            return;
        }

        let old_id = assignment.rotate_id();
        self.rename_script(old_id, assignment.id);
        tracing::info!(node = %node.id, old = %old_id, new = %assignment.id,
            "requeueing static assignment after node death");
        inner.class_of(assignment.node_type).push_front(assignment);
    }

    fn rename_script(&self, old: AssignmentId, new: AssignmentId) {
        let dir = match self.scripts_dir.as_ref() {
            Some(dir) => dir,
            None => return,
        };
        let from = dir.join(old.to_string());
        if !from.exists() {
            return;
        }
        if let Err(err) = std::fs::rename(&from, dir.join(new.to_string()))
        {
            tracing::warn!(?err, ?from, "failed to rename script payload");
        }
    }

    fn sender_allowed(&self, sender: &SocketAddr) -> bool {
        if sender.ip() == IpAddr::from([127, 0, 0, 1]) {
            return true;
        }
        let subnets: Vec<String> =
            self.settings.get_or(keys::ALLOWED_SUBNETS, Vec::new());
        subnets
            .iter()
            .any(|subnet| addr_in_subnet(sender.ip(), subnet))
    }
}

/// `true` if a v4 address falls inside an `a.b.c.d/len` subnet string.
fn addr_in_subnet(addr: IpAddr, subnet: &str) -> bool {
    let addr = match addr {
        IpAddr::V4(addr) => u32::from(addr),
        IpAddr::V6(_) => return false,
    };
    let (net, len) = match subnet.split_once('/') {
        Some((net, len)) => (net, len),
        None => (subnet, "32"),
    };
    let net: std::net::Ipv4Addr = match net.parse() {
        Ok(net) => net,
        Err(_) => return false,
    };
    let len: u32 = match len.parse() {
        Ok(len) if len <= 32 => len,
        _ => return false,
    };
    let mask = if len == 0 { 0 } else { u32::MAX << (32 - len) };
    (addr & mask) == (u32::from(net) & mask)
}
