//! Types dealing with node metadata.

use crate::*;
use std::collections::HashSet;
use std::net::SocketAddr;

/// The closed set of node roles a domain can host.
///
/// Workers (mixers and servers) are spawned through the assignment queue;
/// agents are interactive users; the upstream/downstream variants are
/// replication peers that mirror traffic between domains.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    serde::Serialize,
    serde::Deserialize,
)]
#[serde(rename_all = "kebab-case")]
pub enum NodeType {
    /// An interactive client.
    Agent,
    /// The audio mixing worker.
    AudioMixer,
    /// The avatar mixing worker.
    AvatarMixer,
    /// The spatial entity state worker.
    EntityServer,
    /// The asset serving worker.
    AssetServer,
    /// The messaging worker.
    MessagesMixer,
    /// The entity script host worker.
    EntityScriptServer,
    /// Upstream audio replication peer.
    UpstreamAudio,
    /// Upstream avatar replication peer.
    UpstreamAvatar,
    /// Downstream audio replication peer.
    DownstreamAudio,
    /// Downstream avatar replication peer.
    DownstreamAvatar,
}

impl NodeType {
    /// All node types, in wire-value order.
    pub const ALL: [NodeType; 11] = [
        NodeType::Agent,
        NodeType::AudioMixer,
        NodeType::AvatarMixer,
        NodeType::EntityServer,
        NodeType::AssetServer,
        NodeType::MessagesMixer,
        NodeType::EntityScriptServer,
        NodeType::UpstreamAudio,
        NodeType::UpstreamAvatar,
        NodeType::DownstreamAudio,
        NodeType::DownstreamAvatar,
    ];

    /// The wire byte for this node type.
    pub fn wire_value(&self) -> u8 {
        match self {
            NodeType::Agent => b'I',
            NodeType::AudioMixer => b'M',
            NodeType::AvatarMixer => b'W',
            NodeType::EntityServer => b'o',
            NodeType::AssetServer => b'A',
            NodeType::MessagesMixer => b'm',
            NodeType::EntityScriptServer => b'S',
            NodeType::UpstreamAudio => b'B',
            NodeType::UpstreamAvatar => b'C',
            NodeType::DownstreamAudio => b'a',
            NodeType::DownstreamAvatar => b'w',
        }
    }

    /// Reconstruct a node type from its wire byte.
    pub fn from_wire_value(b: u8) -> Option<NodeType> {
        NodeType::ALL.iter().copied().find(|t| t.wire_value() == b)
    }

    /// `true` for replication peers that mirror traffic into this domain.
    pub fn is_upstream(&self) -> bool {
        matches!(self, NodeType::UpstreamAudio | NodeType::UpstreamAvatar)
    }

    /// `true` for replication peers that mirror traffic out of this domain.
    pub fn is_downstream(&self) -> bool {
        matches!(
            self,
            NodeType::DownstreamAudio | NodeType::DownstreamAvatar
        )
    }

    /// `true` for any replication peer. Replication peers are flagged
    /// forced-never-silent in the registry.
    pub fn is_replication(&self) -> bool {
        self.is_upstream() || self.is_downstream()
    }

    /// `true` if this type counts against the domain's user capacity.
    pub fn is_agent(&self) -> bool {
        matches!(self, NodeType::Agent)
    }

    /// A lowercase hyphenated name, used in stats output and settings.
    pub fn name(&self) -> &'static str {
        match self {
            NodeType::Agent => "agent",
            NodeType::AudioMixer => "audio-mixer",
            NodeType::AvatarMixer => "avatar-mixer",
            NodeType::EntityServer => "entity-server",
            NodeType::AssetServer => "asset-server",
            NodeType::MessagesMixer => "messages-mixer",
            NodeType::EntityScriptServer => "entity-script-server",
            NodeType::UpstreamAudio => "upstream-audio-mixer",
            NodeType::UpstreamAvatar => "upstream-avatar-mixer",
            NodeType::DownstreamAudio => "downstream-audio-mixer",
            NodeType::DownstreamAvatar => "downstream-avatar-mixer",
        }
    }
}

bitflags::bitflags! {
    /// The permissions vector computed for a node at admission time and
    /// recomputed on every settings change.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Permissions: u32 {
        /// May connect to the domain at all.
        const CONNECT = 1 << 0;
        /// May rez persistent entities.
        const REZ = 1 << 1;
        /// May rez temporary entities.
        const REZ_TMP = 1 << 2;
        /// May rez certified entities.
        const REZ_CERTIFIED = 1 << 3;
        /// May kick other users.
        const KICK = 1 << 4;
        /// May replace domain content wholesale.
        const REPLACE_CONTENT = 1 << 5;
        /// May write to the asset server.
        const WRITE_ASSETS = 1 << 6;
        /// May connect even when the domain is at capacity.
        const IGNORE_MAX_CAP = 1 << 7;
    }
}

impl Default for Permissions {
    fn default() -> Self {
        Permissions::empty()
    }
}

impl serde::Serialize for Permissions {
    fn serialize<S: serde::Serializer>(
        &self,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.serialize_u32(self.bits())
    }
}

impl<'de> serde::Deserialize<'de> for Permissions {
    fn deserialize<D: serde::Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Self, D::Error> {
        let bits: u32 = serde::Deserialize::deserialize(deserializer)?;
        Ok(Permissions::from_bits_truncate(bits))
    }
}

/// The pair of socket addresses a node offers at admission: the address
/// it is reachable at publicly, and the one on its local network.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    serde::Serialize,
    serde::Deserialize,
)]
pub struct SocketPair {
    /// The public (NAT-external) socket address.
    pub public: SocketAddr,
    /// The local-network socket address.
    pub local: SocketAddr,
}

/// The set of node types a node wants membership updates about.
pub type InterestSet = HashSet<NodeType>;

/// Metadata for a node admitted to the domain.
///
/// This is a snapshot: the registry owns the live record and hands out
/// clones. Mutations go through registry operations only.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct NodeInfo {
    /// The stable node uuid.
    pub id: NodeId,

    /// The compact controller-assigned handle.
    pub local_id: LocalId,

    /// The node's role.
    pub node_type: NodeType,

    /// The public/local sockets offered at admission. The sender address
    /// the registry records for sourced-packet checks is
    /// [NodeInfo::active_socket].
    pub sockets: SocketPair,

    /// The socket this node is actually reached at (chosen during ICE
    /// rendezvous, or the public socket when directly reachable).
    pub active_socket: SocketAddr,

    /// The permissions vector.
    pub permissions: Permissions,

    /// The session secret this node shares with the controller itself,
    /// verifying the HMAC trailer on its sourced packets.
    pub connection_secret: SessionSecret,

    /// The node types this node wants membership updates about.
    pub interest_set: InterestSet,

    /// The place name the node asked to enter.
    pub place_name: String,

    /// The node's reported build version.
    pub version: String,

    /// When the node was admitted.
    pub wake_timestamp: Timestamp,

    /// Last time we heard anything from this node.
    pub last_heartbeat: Timestamp,

    /// The assignment this node fulfills, for workers.
    pub assignment_id: Option<AssignmentId>,

    /// The identity facts captured at admission, input to permission
    /// resolution.
    pub identity: crate::settings::ConnectIdentity,

    /// Replication peers never expire on silence.
    pub forced_never_silent: bool,
}

impl NodeInfo {
    /// `true` if this node currently holds the given permission.
    pub fn can(&self, p: Permissions) -> bool {
        self.permissions.contains(p)
    }

    /// The metaverse-verified username, for logged-in users.
    pub fn verified_username(&self) -> Option<&str> {
        self.identity.verified_username.as_deref()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn node_type_wire_roundtrip() {
        for t in NodeType::ALL {
            assert_eq!(Some(t), NodeType::from_wire_value(t.wire_value()));
        }
        assert_eq!(None, NodeType::from_wire_value(0));
    }

    #[test]
    fn replication_types_flagged() {
        assert!(NodeType::UpstreamAudio.is_replication());
        assert!(NodeType::DownstreamAvatar.is_replication());
        assert!(!NodeType::AudioMixer.is_replication());
        assert!(NodeType::UpstreamAvatar.is_upstream());
        assert!(!NodeType::UpstreamAvatar.is_downstream());
    }

    #[test]
    fn permissions_serde_as_bits() {
        let p = Permissions::CONNECT | Permissions::KICK;
        let enc = serde_json::to_string(&p).unwrap();
        assert_eq!("17", enc);
        let dec: Permissions = serde_json::from_str(&enc).unwrap();
        assert_eq!(p, dec);
    }

    #[test]
    fn unknown_permission_bits_dropped() {
        let dec: Permissions = serde_json::from_str("4294967295").unwrap();
        assert_eq!(Permissions::all(), dec);
    }
}
