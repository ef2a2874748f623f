//! Torii wire protocol types.
//!
//! Every datagram begins with `{type:u8, version:u8, sequence:u32}`.
//! Sourced packets append `{source_local_id:u16}` and end with an
//! HMAC-SHA256 trailer keyed by the session secret the sender shares
//! with the controller. UUIDs travel as their raw 16 bytes; socket
//! addresses as `{family:u8, addr:(4|16 bytes), port:u16}`. All integers
//! are little-endian.

use crate::*;
use bytes::{Buf, BufMut};
use std::net::{IpAddr, SocketAddr};

/// Length of the fixed packet header.
pub const HEADER_LEN: usize = 6;

/// Length of the sourced-packet HMAC trailer.
pub const MAC_LEN: usize = 32;

/// The typed packet header every datagram carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    /// The packet type.
    pub packet_type: PacketType,
    /// The protocol version of this packet type.
    pub version: u8,
    /// Per-sender sequence number.
    pub sequence: u32,
}

macro_rules! packet_types {
    ($($(#[doc = $doc:expr])* $n:ident = $v:literal,)*) => {
        /// The typed packet set the controller speaks.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(u8)]
        pub enum PacketType {
            $($(#[doc = $doc])* $n = $v,)*
        }

        impl PacketType {
            /// Reconstruct a packet type from its wire byte.
            pub fn from_wire_value(b: u8) -> Option<PacketType> {
                match b {
                    $($v => Some(PacketType::$n),)*
                    _ => None,
                }
            }
        }
    };
}

packet_types! {
    /// A candidate asks to join the domain.
    DomainConnectRequest = 1,
    /// The controller's membership snapshot for an admitted node.
    DomainList = 2,
    /// An admitted node asks for a fresh membership snapshot.
    DomainListRequest = 3,
    /// Admission was refused; carries a [DenialReason].
    DomainConnectionDenied = 4,
    /// Fan-out: a node of interest joined.
    DomainServerAddedNode = 5,
    /// Fan-out: a node of interest left.
    DomainServerRemovedNode = 6,
    /// An admitted node announces it is leaving.
    DomainDisconnectRequest = 7,
    /// Resolve a named path to a viewpoint.
    DomainServerPathQuery = 8,
    /// Reply to a path query.
    DomainServerPathResponse = 9,
    /// An assignment client polls for deployable work.
    RequestAssignment = 10,
    /// The controller deploys an assignment to a requester.
    CreateAssignment = 11,
    /// Signed presence announcement to the ice-server.
    ICEServerHeartbeat = 12,
    /// The ice-server acknowledged our heartbeat.
    ICEServerHeartbeatACK = 13,
    /// The ice-server rejected our heartbeat signature.
    ICEServerHeartbeatDenied = 14,
    /// Symmetric-ICE probe.
    ICEPing = 15,
    /// Symmetric-ICE probe answer.
    ICEPingReply = 16,
    /// The ice-server forwards a peer's candidate sockets.
    ICEServerPeerInformation = 17,
    /// A node pushes its periodic stats blob.
    NodeJsonStats = 18,
    /// A privileged node asks for another node to be kicked.
    NodeKickRequest = 19,
    /// Resolve a node id to its verified username.
    UsernameFromIDRequest = 20,
    /// Reply with a node's verified username.
    UsernameFromIDReply = 21,
    /// A worker asks for its settings subset.
    DomainSettingsRequest = 22,
    /// Reply carrying a settings subset.
    DomainSettings = 23,
    /// The entity server asks for the current scene file.
    OctreeDataFileRequest = 24,
    /// Reply carrying the scene file (or confirming the requester is
    /// current).
    OctreeDataFileReply = 25,
    /// The entity server persists the scene file through the controller.
    OctreeDataPersist = 26,
    /// Wholesale scene replacement content.
    OctreeFileReplacement = 27,
    /// Fetch replacement content from a URL.
    DomainContentReplacementFromUrl = 28,
}

impl PacketType {
    /// The protocol version the controller expects for this type. A
    /// connect request carrying any other version is answered with a
    /// single [DenialReason::ProtocolMismatch] denial.
    pub fn expected_version(&self) -> u8 {
        match self {
            PacketType::DomainConnectRequest | PacketType::DomainList => 2,
            _ => 1,
        }
    }

    /// Sourced types require a live source-local-id, a matching sender
    /// address, and a valid HMAC trailer. Non-sourced types bypass
    /// source lookup entirely.
    pub fn is_sourced(&self) -> bool {
        matches!(
            self,
            PacketType::DomainListRequest
                | PacketType::DomainDisconnectRequest
                | PacketType::DomainServerPathQuery
                | PacketType::NodeJsonStats
                | PacketType::NodeKickRequest
                | PacketType::UsernameFromIDRequest
                | PacketType::DomainSettingsRequest
                | PacketType::OctreeDataFileRequest
                | PacketType::OctreeDataPersist
                | PacketType::OctreeFileReplacement
                | PacketType::DomainContentReplacementFromUrl
        )
    }
}

/// Machine-readable admission denial reasons.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DenialReason {
    /// The candidate speaks a different protocol version.
    ProtocolMismatch = 0,
    /// The username signature did not verify.
    LoginError = 1,
    /// The computed permissions do not include connect.
    NotAuthorized = 2,
    /// The domain is at user capacity.
    TooManyUsers = 3,
    /// Admission did not complete within its deadline.
    TimedOut = 4,
    /// The candidate is banned.
    Banned = 5,
}

impl DenialReason {
    /// Reconstruct a denial reason from its wire byte.
    pub fn from_wire_value(b: u8) -> Option<DenialReason> {
        match b {
            0 => Some(DenialReason::ProtocolMismatch),
            1 => Some(DenialReason::LoginError),
            2 => Some(DenialReason::NotAuthorized),
            3 => Some(DenialReason::TooManyUsers),
            4 => Some(DenialReason::TimedOut),
            5 => Some(DenialReason::Banned),
            _ => None,
        }
    }
}

/// A decoded inbound frame: header, optional source handle, payload.
///
/// Decoding does NOT verify the HMAC trailer; dispatch does that once it
/// has resolved the source node's session secret. The trailer is already
/// split off `payload`.
#[derive(Debug, Clone)]
pub struct Frame {
    /// The packet header.
    pub header: PacketHeader,
    /// The source local id, for sourced types.
    pub source_local_id: Option<LocalId>,
    /// The packet payload (HMAC trailer excluded).
    pub payload: bytes::Bytes,
    /// Everything covered by the HMAC (header through payload).
    pub mac_covered: bytes::Bytes,
    /// The HMAC trailer, for sourced types.
    pub mac: Option<bytes::Bytes>,
}

/// Encode a non-sourced packet.
pub fn encode_unsourced(
    packet_type: PacketType,
    sequence: u32,
    payload: &[u8],
) -> bytes::Bytes {
    let mut buf =
        bytes::BytesMut::with_capacity(HEADER_LEN + payload.len());
    buf.put_u8(packet_type as u8);
    buf.put_u8(packet_type.expected_version());
    buf.put_u32_le(sequence);
    buf.put_slice(payload);
    buf.freeze()
}

/// Encode a sourced packet, appending the HMAC trailer keyed by the
/// session secret shared with the receiver.
pub fn encode_sourced(
    packet_type: PacketType,
    sequence: u32,
    source_local_id: LocalId,
    payload: &[u8],
    secret: &id::SessionSecret,
) -> bytes::Bytes {
    let mut buf = bytes::BytesMut::with_capacity(
        HEADER_LEN + 2 + payload.len() + MAC_LEN,
    );
    buf.put_u8(packet_type as u8);
    buf.put_u8(packet_type.expected_version());
    buf.put_u32_le(sequence);
    buf.put_u16_le(source_local_id.0);
    buf.put_slice(payload);
    let mac = compute_mac(&buf, secret);
    buf.put_slice(&mac);
    buf.freeze()
}

/// Split an inbound datagram into a [Frame].
pub fn decode_frame(data: bytes::Bytes) -> ToriiResult<Frame> {
    if data.len() < HEADER_LEN {
        return Err(ToriiError::other("datagram shorter than header"));
    }
    let packet_type = PacketType::from_wire_value(data[0])
        .ok_or_else(|| ToriiError::other("unknown packet type"))?;
    let header = PacketHeader {
        packet_type,
        version: data[1],
        sequence: u32::from_le_bytes([data[2], data[3], data[4], data[5]]),
    };

    if !packet_type.is_sourced() {
        return Ok(Frame {
            header,
            source_local_id: None,
            payload: data.slice(HEADER_LEN..),
            mac_covered: data,
            mac: None,
        });
    }

    if data.len() < HEADER_LEN + 2 + MAC_LEN {
        return Err(ToriiError::other("sourced datagram too short"));
    }
    let local_id = LocalId(u16::from_le_bytes([data[6], data[7]]));
    let mac_start = data.len() - MAC_LEN;
    Ok(Frame {
        header,
        source_local_id: Some(local_id),
        payload: data.slice(HEADER_LEN + 2..mac_start),
        mac_covered: data.slice(..mac_start),
        mac: Some(data.slice(mac_start..)),
    })
}

/// Compute the HMAC-SHA256 trailer over a frame prefix.
pub fn compute_mac(
    covered: &[u8],
    secret: &id::SessionSecret,
) -> [u8; MAC_LEN] {
    use hmac::Mac;
    let mut mac =
        hmac::Hmac::<sha2::Sha256>::new_from_slice(secret.as_bytes())
            .expect("hmac accepts any key length");
    mac.update(covered);
    mac.finalize().into_bytes().into()
}

/// Constant-time verification of a sourced frame's trailer.
pub fn verify_mac(frame: &Frame, secret: &id::SessionSecret) -> bool {
    use hmac::Mac;
    let tag = match frame.mac.as_ref() {
        Some(tag) => tag,
        None => return false,
    };
    let mut mac =
        hmac::Hmac::<sha2::Sha256>::new_from_slice(secret.as_bytes())
            .expect("hmac accepts any key length");
    mac.update(&frame.mac_covered);
    mac.verify_slice(tag).is_ok()
}

/// A compact signature over the full `{type, version}` table, sent in
/// metaverse heartbeats so the registry can group domains by protocol
/// compatibility.
pub fn protocol_signature() -> String {
    use base64::prelude::*;
    use sha2::Digest;
    let mut hasher = sha2::Sha256::new();
    for ty in 1_u8..=u8::MAX {
        if let Some(ty) = PacketType::from_wire_value(ty) {
            hasher.update([ty as u8, ty.expected_version()]);
        }
    }
    BASE64_STANDARD.encode(hasher.finalize())
}

/// `true` if the address is in an RFC-1918 private range.
///
/// Sourced packets from a new address are accepted when both the
/// recorded and the new address are private, covering a reconnect from
/// a different local interface.
pub fn is_rfc1918(addr: &SocketAddr) -> bool {
    match addr.ip() {
        IpAddr::V4(ip) => ip.is_private(),
        IpAddr::V6(_) => false,
    }
}

// small codec helpers

fn need(buf: &impl Buf, n: usize, what: &str) -> ToriiResult<()> {
    if buf.remaining() < n {
        Err(ToriiError::other(format!("truncated {what}")))
    } else {
        Ok(())
    }
}

fn put_uuid(buf: &mut bytes::BytesMut, b: &[u8; 16]) {
    buf.put_slice(b);
}

fn get_uuid(buf: &mut bytes::Bytes) -> ToriiResult<[u8; 16]> {
    need(buf, 16, "uuid")?;
    let mut out = [0_u8; 16];
    buf.copy_to_slice(&mut out);
    Ok(out)
}

fn put_string(buf: &mut bytes::BytesMut, s: &str) {
    buf.put_u16_le(s.len() as u16);
    buf.put_slice(s.as_bytes());
}

fn get_string(buf: &mut bytes::Bytes) -> ToriiResult<String> {
    need(buf, 2, "string length")?;
    let len = buf.get_u16_le() as usize;
    need(buf, len, "string body")?;
    String::from_utf8(buf.copy_to_bytes(len).to_vec())
        .map_err(|e| ToriiError::other_src("string not utf8", e))
}

fn put_blob(buf: &mut bytes::BytesMut, b: &[u8]) {
    buf.put_u32_le(b.len() as u32);
    buf.put_slice(b);
}

fn get_blob(buf: &mut bytes::Bytes) -> ToriiResult<bytes::Bytes> {
    need(buf, 4, "blob length")?;
    let len = buf.get_u32_le() as usize;
    need(buf, len, "blob body")?;
    Ok(buf.copy_to_bytes(len))
}

/// Write a socket address as `{family:u8, addr, port:u16}`.
pub fn put_sock_addr(buf: &mut bytes::BytesMut, addr: &SocketAddr) {
    match addr.ip() {
        IpAddr::V4(ip) => {
            buf.put_u8(4);
            buf.put_slice(&ip.octets());
        }
        IpAddr::V6(ip) => {
            buf.put_u8(6);
            buf.put_slice(&ip.octets());
        }
    }
    buf.put_u16_le(addr.port());
}

/// Read a socket address written by [put_sock_addr].
pub fn get_sock_addr(buf: &mut bytes::Bytes) -> ToriiResult<SocketAddr> {
    need(buf, 1, "sock addr family")?;
    let ip: IpAddr = match buf.get_u8() {
        4 => {
            need(buf, 4, "ipv4 addr")?;
            let mut o = [0_u8; 4];
            buf.copy_to_slice(&mut o);
            std::net::Ipv4Addr::from(o).into()
        }
        6 => {
            need(buf, 16, "ipv6 addr")?;
            let mut o = [0_u8; 16];
            buf.copy_to_slice(&mut o);
            std::net::Ipv6Addr::from(o).into()
        }
        _ => return Err(ToriiError::other("unknown sock addr family")),
    };
    need(buf, 2, "sock addr port")?;
    Ok(SocketAddr::new(ip, buf.get_u16_le()))
}

fn put_sockets(buf: &mut bytes::BytesMut, s: &SocketPair) {
    put_sock_addr(buf, &s.public);
    put_sock_addr(buf, &s.local);
}

fn get_sockets(buf: &mut bytes::Bytes) -> ToriiResult<SocketPair> {
    Ok(SocketPair {
        public: get_sock_addr(buf)?,
        local: get_sock_addr(buf)?,
    })
}

fn get_node_type(buf: &mut bytes::Bytes) -> ToriiResult<NodeType> {
    need(buf, 1, "node type")?;
    NodeType::from_wire_value(buf.get_u8())
        .ok_or_else(|| ToriiError::other("unknown node type"))
}

/// Payload of a [PacketType::DomainConnectRequest].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRequest {
    /// The uuid the candidate claims for itself. The controller adopts
    /// it when free, and answers symmetric-ICE probes against it.
    pub claimed_id: NodeId,
    /// The role the candidate wants.
    pub node_type: NodeType,
    /// The handed-out deployment id, for workers. Nil on the wire for
    /// users.
    pub assignment_id: Option<AssignmentId>,
    /// The candidate's offered sockets.
    pub sockets: SocketPair,
    /// The node types the candidate wants membership updates about.
    pub interest_set: Vec<NodeType>,
    /// The place name the candidate asked to enter.
    pub place_name: String,
    /// The candidate's build version.
    pub version: String,
    /// The claimed username, empty for anonymous candidates.
    pub username: String,
    /// Signature over the username, made with the user's metaverse key.
    pub username_signature: bytes::Bytes,
}

impl ConnectRequest {
    /// Encode this payload.
    pub fn encode(&self) -> bytes::Bytes {
        let mut buf = bytes::BytesMut::new();
        put_uuid(&mut buf, self.claimed_id.as_bytes());
        buf.put_u8(self.node_type.wire_value());
        put_uuid(
            &mut buf,
            self.assignment_id.unwrap_or(AssignmentId::nil()).as_bytes(),
        );
        put_sockets(&mut buf, &self.sockets);
        buf.put_u8(self.interest_set.len() as u8);
        for t in &self.interest_set {
            buf.put_u8(t.wire_value());
        }
        put_string(&mut buf, &self.place_name);
        put_string(&mut buf, &self.version);
        put_string(&mut buf, &self.username);
        put_blob(&mut buf, &self.username_signature);
        buf.freeze()
    }

    /// Decode this payload.
    pub fn decode(mut buf: bytes::Bytes) -> ToriiResult<Self> {
        let claimed_id = NodeId::from_bytes(get_uuid(&mut buf)?);
        let node_type = get_node_type(&mut buf)?;
        let assignment_id = AssignmentId::from_bytes(get_uuid(&mut buf)?);
        let sockets = get_sockets(&mut buf)?;
        need(&buf, 1, "interest count")?;
        let count = buf.get_u8() as usize;
        let mut interest_set = Vec::with_capacity(count);
        for _ in 0..count {
            interest_set.push(get_node_type(&mut buf)?);
        }
        Ok(Self {
            claimed_id,
            node_type,
            assignment_id: (!assignment_id.is_nil()).then_some(assignment_id),
            sockets,
            interest_set,
            place_name: get_string(&mut buf)?,
            version: get_string(&mut buf)?,
            username: get_string(&mut buf)?,
            username_signature: get_blob(&mut buf)?,
        })
    }
}

/// One peer entry in a [DomainList] or a
/// [PacketType::DomainServerAddedNode] payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerEntry {
    /// The peer uuid.
    pub id: NodeId,
    /// The peer's role.
    pub node_type: NodeType,
    /// The peer's sockets.
    pub sockets: SocketPair,
    /// The peer's compact handle.
    pub local_id: LocalId,
    /// The peer's permissions.
    pub permissions: Permissions,
    /// The session secret the receiver shares with this peer.
    pub secret: id::SessionSecret,
}

impl PeerEntry {
    fn put(&self, buf: &mut bytes::BytesMut) {
        put_uuid(buf, self.id.as_bytes());
        buf.put_u8(self.node_type.wire_value());
        put_sockets(buf, &self.sockets);
        buf.put_u16_le(self.local_id.0);
        buf.put_u32_le(self.permissions.bits());
        put_uuid(buf, self.secret.as_bytes());
    }

    fn get(buf: &mut bytes::Bytes) -> ToriiResult<Self> {
        let id = NodeId::from_bytes(get_uuid(buf)?);
        let node_type = get_node_type(buf)?;
        let sockets = get_sockets(buf)?;
        need(buf, 6, "peer entry tail")?;
        let local_id = LocalId(buf.get_u16_le());
        let permissions = Permissions::from_bits_truncate(buf.get_u32_le());
        let secret = id::SessionSecret::from_bytes(get_uuid(buf)?);
        Ok(Self {
            id,
            node_type,
            sockets,
            local_id,
            permissions,
            secret,
        })
    }

    /// Encode a single entry as a full payload
    /// (for [PacketType::DomainServerAddedNode]).
    pub fn encode(&self) -> bytes::Bytes {
        let mut buf = bytes::BytesMut::new();
        self.put(&mut buf);
        buf.freeze()
    }

    /// Decode a single-entry payload.
    pub fn decode(mut buf: bytes::Bytes) -> ToriiResult<Self> {
        Self::get(&mut buf)
    }
}

/// Payload of a [PacketType::DomainList].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainList {
    /// The domain uuid.
    pub domain_id: DomainId,
    /// The receiver's node uuid.
    pub your_id: NodeId,
    /// The receiver's compact handle.
    pub your_local_id: LocalId,
    /// The secret the receiver shares with the controller, keying the
    /// HMAC trailer on its sourced packets.
    pub your_secret: id::SessionSecret,
    /// The receiver's permissions.
    pub permissions: Permissions,
    /// Peers of interest, each with the pairwise session secret.
    pub peers: Vec<PeerEntry>,
}

impl DomainList {
    /// Encode this payload.
    pub fn encode(&self) -> bytes::Bytes {
        let mut buf = bytes::BytesMut::new();
        put_uuid(&mut buf, self.domain_id.as_bytes());
        put_uuid(&mut buf, self.your_id.as_bytes());
        buf.put_u16_le(self.your_local_id.0);
        put_uuid(&mut buf, self.your_secret.as_bytes());
        buf.put_u32_le(self.permissions.bits());
        buf.put_u16_le(self.peers.len() as u16);
        for p in &self.peers {
            p.put(&mut buf);
        }
        buf.freeze()
    }

    /// Decode this payload.
    pub fn decode(mut buf: bytes::Bytes) -> ToriiResult<Self> {
        let domain_id = DomainId::from_bytes(get_uuid(&mut buf)?);
        let your_id = NodeId::from_bytes(get_uuid(&mut buf)?);
        need(&buf, 2, "domain list local id")?;
        let your_local_id = LocalId(buf.get_u16_le());
        let your_secret = id::SessionSecret::from_bytes(get_uuid(&mut buf)?);
        need(&buf, 6, "domain list tail")?;
        let permissions =
            Permissions::from_bits_truncate(buf.get_u32_le());
        let count = buf.get_u16_le() as usize;
        let mut peers = Vec::with_capacity(count);
        for _ in 0..count {
            peers.push(PeerEntry::get(&mut buf)?);
        }
        Ok(Self {
            domain_id,
            your_id,
            your_local_id,
            your_secret,
            permissions,
            peers,
        })
    }
}

/// Payload of a [PacketType::DomainConnectionDenied].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectDenied {
    /// Machine-readable reason.
    pub reason: DenialReason,
    /// Human-readable explanation.
    pub message: String,
}

impl ConnectDenied {
    /// Encode this payload.
    pub fn encode(&self) -> bytes::Bytes {
        let mut buf = bytes::BytesMut::new();
        buf.put_u8(self.reason as u8);
        put_string(&mut buf, &self.message);
        buf.freeze()
    }

    /// Decode this payload.
    pub fn decode(mut buf: bytes::Bytes) -> ToriiResult<Self> {
        need(&buf, 1, "denial reason")?;
        let reason = DenialReason::from_wire_value(buf.get_u8())
            .ok_or_else(|| ToriiError::other("unknown denial reason"))?;
        Ok(Self {
            reason,
            message: get_string(&mut buf)?,
        })
    }
}

/// Payload of a [PacketType::RequestAssignment].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestAssignment {
    /// The worker type requested; `None` asks for any type.
    pub node_type: Option<NodeType>,
    /// The pool tag the requester serves.
    pub pool: String,
}

impl RequestAssignment {
    /// Encode this payload. All-types is the zero byte.
    pub fn encode(&self) -> bytes::Bytes {
        let mut buf = bytes::BytesMut::new();
        buf.put_u8(self.node_type.map(|t| t.wire_value()).unwrap_or(0));
        put_string(&mut buf, &self.pool);
        buf.freeze()
    }

    /// Decode this payload.
    pub fn decode(mut buf: bytes::Bytes) -> ToriiResult<Self> {
        need(&buf, 1, "assignment type")?;
        let b = buf.get_u8();
        let node_type = if b == 0 {
            None
        } else {
            Some(
                NodeType::from_wire_value(b)
                    .ok_or_else(|| ToriiError::other("unknown node type"))?,
            )
        };
        Ok(Self {
            node_type,
            pool: get_string(&mut buf)?,
        })
    }
}

/// Payload of a [PacketType::CreateAssignment].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateAssignment {
    /// The deployment id the worker must echo in its connect request.
    pub id: AssignmentId,
    /// The worker type to spawn.
    pub node_type: NodeType,
    /// The pool tag.
    pub pool: String,
    /// Literal payload bytes.
    pub payload: bytes::Bytes,
}

impl CreateAssignment {
    /// Encode this payload.
    pub fn encode(&self) -> bytes::Bytes {
        let mut buf = bytes::BytesMut::new();
        put_uuid(&mut buf, self.id.as_bytes());
        buf.put_u8(self.node_type.wire_value());
        put_string(&mut buf, &self.pool);
        put_blob(&mut buf, &self.payload);
        buf.freeze()
    }

    /// Decode this payload.
    pub fn decode(mut buf: bytes::Bytes) -> ToriiResult<Self> {
        Ok(Self {
            id: AssignmentId::from_bytes(get_uuid(&mut buf)?),
            node_type: get_node_type(&mut buf)?,
            pool: get_string(&mut buf)?,
            payload: get_blob(&mut buf)?,
        })
    }
}

/// Which of a candidate's offered sockets a symmetric-ICE probe targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PingTarget {
    /// The local-network socket.
    Local = 1,
    /// The public socket.
    Public = 2,
}

/// Payload of [PacketType::ICEPing] and [PacketType::ICEPingReply].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IcePing {
    /// The sender's id (the controller's domain id, or the peer's node
    /// id in a reply).
    pub sender_id: NodeId,
    /// Which socket this probe targets.
    pub target: PingTarget,
}

impl IcePing {
    /// Encode this payload.
    pub fn encode(&self) -> bytes::Bytes {
        let mut buf = bytes::BytesMut::new();
        put_uuid(&mut buf, self.sender_id.as_bytes());
        buf.put_u8(self.target as u8);
        buf.freeze()
    }

    /// Decode this payload.
    pub fn decode(mut buf: bytes::Bytes) -> ToriiResult<Self> {
        let sender_id = NodeId::from_bytes(get_uuid(&mut buf)?);
        need(&buf, 1, "ping target")?;
        let target = match buf.get_u8() {
            1 => PingTarget::Local,
            2 => PingTarget::Public,
            _ => return Err(ToriiError::other("unknown ping target")),
        };
        Ok(Self { sender_id, target })
    }
}

/// Payload of a [PacketType::ICEServerHeartbeat].
///
/// The signature covers the preceding plaintext bytes (domain id and
/// both sockets), made with the domain's private key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceHeartbeat {
    /// The domain uuid.
    pub domain_id: DomainId,
    /// The controller's own sockets.
    pub sockets: SocketPair,
    /// Detached signature over the plaintext prefix.
    pub signature: bytes::Bytes,
}

impl IceHeartbeat {
    /// The plaintext prefix the signature covers.
    pub fn plaintext(domain_id: &DomainId, sockets: &SocketPair) -> bytes::Bytes {
        let mut buf = bytes::BytesMut::new();
        put_uuid(&mut buf, domain_id.as_bytes());
        put_sockets(&mut buf, sockets);
        buf.freeze()
    }

    /// Encode this payload.
    pub fn encode(&self) -> bytes::Bytes {
        let mut buf = bytes::BytesMut::from(
            &Self::plaintext(&self.domain_id, &self.sockets)[..],
        );
        put_blob(&mut buf, &self.signature);
        buf.freeze()
    }

    /// Decode this payload.
    pub fn decode(mut buf: bytes::Bytes) -> ToriiResult<Self> {
        Ok(Self {
            domain_id: DomainId::from_bytes(get_uuid(&mut buf)?),
            sockets: get_sockets(&mut buf)?,
            signature: get_blob(&mut buf)?,
        })
    }
}

/// Payload of a [PacketType::ICEServerPeerInformation]: the ice-server
/// forwards a candidate's offered sockets so the controller can start
/// punching toward them before the connect request lands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerInformation {
    /// The candidate's claimed id.
    pub peer_id: NodeId,
    /// The candidate's offered sockets.
    pub sockets: SocketPair,
}

impl PeerInformation {
    /// Encode this payload.
    pub fn encode(&self) -> bytes::Bytes {
        let mut buf = bytes::BytesMut::new();
        put_uuid(&mut buf, self.peer_id.as_bytes());
        put_sockets(&mut buf, &self.sockets);
        buf.freeze()
    }

    /// Decode this payload.
    pub fn decode(mut buf: bytes::Bytes) -> ToriiResult<Self> {
        Ok(Self {
            peer_id: NodeId::from_bytes(get_uuid(&mut buf)?),
            sockets: get_sockets(&mut buf)?,
        })
    }
}

/// Encode an interest-set payload (for
/// [PacketType::DomainListRequest]): a count byte followed by type
/// bytes. An empty payload means "keep the current interest set".
pub fn encode_interest_set(interest_set: &[NodeType]) -> bytes::Bytes {
    let mut buf = bytes::BytesMut::new();
    buf.put_u8(interest_set.len() as u8);
    for t in interest_set {
        buf.put_u8(t.wire_value());
    }
    buf.freeze()
}

/// Decode an interest-set payload. `None` for an empty payload.
pub fn decode_interest_set(
    mut buf: bytes::Bytes,
) -> ToriiResult<Option<Vec<NodeType>>> {
    if buf.is_empty() {
        return Ok(None);
    }
    let count = buf.get_u8() as usize;
    let mut out = Vec::with_capacity(count);
    for _ in 0..count {
        out.push(get_node_type(&mut buf)?);
    }
    Ok(Some(out))
}

/// Payload of a [PacketType::DomainServerPathQuery].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathQuery {
    /// The named path to resolve, e.g. `/` or `/spawn`.
    pub path: String,
}

impl PathQuery {
    /// Encode this payload.
    pub fn encode(&self) -> bytes::Bytes {
        let mut buf = bytes::BytesMut::new();
        put_string(&mut buf, &self.path);
        buf.freeze()
    }

    /// Decode this payload.
    pub fn decode(mut buf: bytes::Bytes) -> ToriiResult<Self> {
        Ok(Self {
            path: get_string(&mut buf)?,
        })
    }
}

/// Payload of a [PacketType::DomainServerPathResponse].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathResponse {
    /// The queried path.
    pub path: String,
    /// The resolved viewpoint string.
    pub viewpoint: String,
}

impl PathResponse {
    /// Encode this payload.
    pub fn encode(&self) -> bytes::Bytes {
        let mut buf = bytes::BytesMut::new();
        put_string(&mut buf, &self.path);
        put_string(&mut buf, &self.viewpoint);
        buf.freeze()
    }

    /// Decode this payload.
    pub fn decode(mut buf: bytes::Bytes) -> ToriiResult<Self> {
        Ok(Self {
            path: get_string(&mut buf)?,
            viewpoint: get_string(&mut buf)?,
        })
    }
}

/// Payload of a [PacketType::UsernameFromIDReply].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsernameFromIdReply {
    /// The queried node id.
    pub node_id: NodeId,
    /// The node's username, empty when anonymous.
    pub username: String,
    /// `true` when the username was metaverse-verified at admission.
    pub verified: bool,
}

impl UsernameFromIdReply {
    /// Encode this payload.
    pub fn encode(&self) -> bytes::Bytes {
        let mut buf = bytes::BytesMut::new();
        put_uuid(&mut buf, self.node_id.as_bytes());
        put_string(&mut buf, &self.username);
        buf.put_u8(self.verified as u8);
        buf.freeze()
    }

    /// Decode this payload.
    pub fn decode(mut buf: bytes::Bytes) -> ToriiResult<Self> {
        let node_id = NodeId::from_bytes(get_uuid(&mut buf)?);
        let username = get_string(&mut buf)?;
        need(&buf, 1, "verified flag")?;
        Ok(Self {
            node_id,
            username,
            verified: buf.get_u8() != 0,
        })
    }
}

/// Payload of [PacketType::NodeKickRequest] and
/// [PacketType::UsernameFromIDRequest]: a bare node id.
pub fn encode_node_id(id: &NodeId) -> bytes::Bytes {
    let mut buf = bytes::BytesMut::new();
    put_uuid(&mut buf, id.as_bytes());
    buf.freeze()
}

/// Decode a bare node-id payload.
pub fn decode_node_id(mut buf: bytes::Bytes) -> ToriiResult<NodeId> {
    Ok(NodeId::from_bytes(get_uuid(&mut buf)?))
}

/// Payload of a [PacketType::OctreeDataFileRequest]: the scene version
/// the requester already holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SceneVersionQuery {
    /// The scene id the requester holds, nil for none.
    pub have_id: DomainId,
    /// The scene version the requester holds.
    pub have_version: u64,
}

impl SceneVersionQuery {
    /// Encode this payload.
    pub fn encode(&self) -> bytes::Bytes {
        let mut buf = bytes::BytesMut::new();
        put_uuid(&mut buf, self.have_id.as_bytes());
        buf.put_u64_le(self.have_version);
        buf.freeze()
    }

    /// Decode this payload.
    pub fn decode(mut buf: bytes::Bytes) -> ToriiResult<Self> {
        let have_id = DomainId::from_bytes(get_uuid(&mut buf)?);
        need(&buf, 8, "scene version")?;
        Ok(Self {
            have_id,
            have_version: buf.get_u64_le(),
        })
    }
}

/// Payload of a [PacketType::OctreeDataFileReply].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SceneFileReply {
    /// `false` when the requester is already current (no data follows).
    pub fresh: bool,
    /// The gzipped scene file when `fresh`.
    pub data: bytes::Bytes,
}

impl SceneFileReply {
    /// Encode this payload.
    pub fn encode(&self) -> bytes::Bytes {
        let mut buf = bytes::BytesMut::new();
        buf.put_u8(self.fresh as u8);
        put_blob(&mut buf, &self.data);
        buf.freeze()
    }

    /// Decode this payload.
    pub fn decode(mut buf: bytes::Bytes) -> ToriiResult<Self> {
        need(&buf, 1, "fresh flag")?;
        Ok(Self {
            fresh: buf.get_u8() != 0,
            data: get_blob(&mut buf)?,
        })
    }
}

/// Payload of a [PacketType::DomainContentReplacementFromUrl].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentFromUrl {
    /// The URL to fetch replacement content from.
    pub url: String,
}

impl ContentFromUrl {
    /// Encode this payload.
    pub fn encode(&self) -> bytes::Bytes {
        let mut buf = bytes::BytesMut::new();
        put_string(&mut buf, &self.url);
        buf.freeze()
    }

    /// Decode this payload.
    pub fn decode(mut buf: bytes::Bytes) -> ToriiResult<Self> {
        Ok(Self {
            url: get_string(&mut buf)?,
        })
    }
}

#[cfg(test)]
mod test;
