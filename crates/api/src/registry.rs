//! Node-registry related types.

use crate::*;
use std::net::SocketAddr;
use std::sync::Arc;

/// The fields the gatekeeper supplies when committing an admission.
/// The registry fills in the rest (local id, timestamps).
#[derive(Debug, Clone)]
pub struct NewNode {
    /// The node uuid.
    pub id: NodeId,
    /// The node's role.
    pub node_type: NodeType,
    /// The sockets offered at admission.
    pub sockets: SocketPair,
    /// The socket the node is actually reached at.
    pub active_socket: SocketAddr,
    /// The permissions vector computed at admission.
    pub permissions: Permissions,
    /// The node's declared interest set.
    pub interest_set: InterestSet,
    /// The place name the node asked to enter.
    pub place_name: String,
    /// The node's reported build version.
    pub version: String,
    /// The assignment this node fulfills, for workers.
    pub assignment_id: Option<AssignmentId>,
    /// The identity facts captured at admission.
    pub identity: settings::ConnectIdentity,
}

/// A membership change fanned out to registry listeners.
#[derive(Debug, Clone)]
pub enum NodeEvent {
    /// A node was admitted.
    Added(Arc<NodeInfo>),
    /// A node was evicted (disconnect, silence, revocation, or kick).
    Removed(Arc<NodeInfo>),
}

/// A registry event listener.
pub type NodeEventListener = Arc<dyn Fn(NodeEvent) + 'static + Send + Sync>;

/// Represents the ability to track domain membership.
///
/// The registry is the sole owner of the membership table and the sole
/// source of truth for who is in the domain. All mutation goes through
/// these operations; readers get consistent snapshots.
pub trait NodeRegistry: 'static + Send + Sync + std::fmt::Debug {
    /// Admit a node: assign (or reuse) a local id, insert, and emit
    /// [NodeEvent::Added].
    ///
    /// Admitting an id that is already live replaces the previous
    /// record but keeps its local id.
    fn add(&self, new_node: NewNode) -> BoxFut<'_, ToriiResult<Arc<NodeInfo>>>;

    /// Evict a node: free its local id, clean every peer's secret
    /// pairing with it, and emit [NodeEvent::Removed]. Returns the
    /// evicted snapshot, `None` if the id was not live.
    fn remove(
        &self,
        id: NodeId,
    ) -> BoxFut<'_, ToriiResult<Option<Arc<NodeInfo>>>>;

    /// Get a node snapshot by uuid.
    fn get(&self, id: NodeId)
        -> BoxFut<'_, ToriiResult<Option<Arc<NodeInfo>>>>;

    /// Get a node snapshot by compact local id.
    fn get_by_local_id(
        &self,
        id: LocalId,
    ) -> BoxFut<'_, ToriiResult<Option<Arc<NodeInfo>>>>;

    /// Get snapshots of every live node.
    fn get_all(&self) -> BoxFut<'_, ToriiResult<Vec<Arc<NodeInfo>>>>;

    /// Visit a snapshot of every live node.
    fn for_each<'a>(
        &'a self,
        visit: Box<dyn FnMut(&NodeInfo) + Send + 'a>,
    ) -> BoxFut<'a, ToriiResult<()>>;

    /// Replace a node's interest set.
    fn set_interest_set(
        &self,
        id: NodeId,
        interest_set: InterestSet,
    ) -> BoxFut<'_, ToriiResult<()>>;

    /// Replace a node's permissions vector (settings changed).
    fn set_permissions(
        &self,
        id: NodeId,
        permissions: Permissions,
    ) -> BoxFut<'_, ToriiResult<()>>;

    /// Record that we heard from a node.
    fn touch(&self, id: NodeId, now: Timestamp)
        -> BoxFut<'_, ToriiResult<()>>;

    /// Record a node's latest stats blob.
    fn set_stats(
        &self,
        id: NodeId,
        stats: serde_json::Value,
    ) -> BoxFut<'_, ToriiResult<()>>;

    /// Get a node's latest stats blob.
    fn get_stats(
        &self,
        id: NodeId,
    ) -> BoxFut<'_, ToriiResult<Option<serde_json::Value>>>;

    /// The session secret for the unordered pair `(a, b)`: lazily
    /// generated on first request, stored symmetrically, stable until
    /// either node is evicted.
    fn connection_secret(
        &self,
        a: NodeId,
        b: NodeId,
    ) -> BoxFut<'_, ToriiResult<SessionSecret>>;

    /// How many live nodes count against user capacity.
    fn count_agents(&self) -> BoxFut<'_, ToriiResult<usize>>;

    /// Register a listener for membership changes. Listeners are
    /// called in the order the registry processed each change.
    fn register_event_listener(
        &self,
        listener: NodeEventListener,
    ) -> ToriiResult<()>;
}

/// Trait-object [NodeRegistry].
pub type DynNodeRegistry = Arc<dyn NodeRegistry>;

/// A factory for constructing [NodeRegistry] instances.
pub trait NodeRegistryFactory: 'static + Send + Sync + std::fmt::Debug {
    /// Help the builder seed default settings for this module.
    fn default_config(&self, settings: &SettingsStore) -> ToriiResult<()>;

    /// Validate settings for this module.
    fn validate_config(&self, settings: &SettingsStore) -> ToriiResult<()>;

    /// Construct a registry instance.
    fn create(
        &self,
        builder: Arc<Builder>,
    ) -> BoxFut<'static, ToriiResult<DynNodeRegistry>>;
}

/// Trait-object [NodeRegistryFactory].
pub type DynNodeRegistryFactory = Arc<dyn NodeRegistryFactory>;
