//! The gatekeeper: decides whether a connect request becomes a node.
//!
//! Admission runs through a fixed sequence: source classification
//! (worker vs user), identity resolution, permission computation,
//! capacity and ban checks, optional symmetric-ICE rendezvous, then the
//! registry commit that produces the `DomainList` reply. Group and
//! identity lookups suspend on the metaverse with explicit deadlines;
//! an expired deadline denies with `TimedOut`. Denials are packets,
//! never faults: no candidate can crash the controller.

use crate::assignment_queue::AssignmentQueue;
use crate::dispatch::*;
use crate::identity::{verify_signature, DomainIdentity};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use torii_api::protocol as proto;
use torii_api::settings::{ConnectIdentity, PermissionsCatalog};
use torii_api::*;

/// Settings keys read by [Gatekeeper].
mod keys {
    /// Maximum concurrent agent count, zero for unlimited.
    pub const MAX_CAPACITY: &str = "security.maximum_user_capacity";
    /// Seconds granted to metaverse identity/group lookups.
    pub const LOOKUP_SECS: &str = "gatekeeper.lookup_timeout_secs";
    /// Seconds granted to the symmetric-ICE rendezvous.
    pub const ICE_RENDEZVOUS_SECS: &str = "gatekeeper.ice_rendezvous_secs";
    /// Usernames refused outright.
    pub const BANNED_USERNAMES: &str = "security.banned_usernames";
}

const DEFAULT_LOOKUP_SECS: u64 = 2;
const DEFAULT_ICE_RENDEZVOUS_SECS: u64 = 2;

/// The gatekeeper.
pub struct Gatekeeper {
    settings: SettingsStore,
    registry: DynNodeRegistry,
    datagrams: DynDatagrams,
    dispatch: Arc<PacketDispatch>,
    metaverse: DynMetaverseClient,
    identity: Arc<DomainIdentity>,
    queue: Arc<AssignmentQueue>,
    ice_pending:
        Mutex<HashMap<NodeId, tokio::sync::oneshot::Sender<SocketAddr>>>,
}

impl std::fmt::Debug for Gatekeeper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gatekeeper").finish()
    }
}

impl Gatekeeper {
    /// Construct a gatekeeper over its collaborators.
    #[allow(clippy::too_many_arguments)]
    pub fn create(
        settings: SettingsStore,
        registry: DynNodeRegistry,
        datagrams: DynDatagrams,
        dispatch: Arc<PacketDispatch>,
        metaverse: DynMetaverseClient,
        identity: Arc<DomainIdentity>,
        queue: Arc<AssignmentQueue>,
    ) -> Arc<Self> {
        Arc::new(Self {
            settings,
            registry,
            datagrams,
            dispatch,
            metaverse,
            identity,
            queue,
            ice_pending: Mutex::new(HashMap::new()),
        })
    }

    /// Register the gatekeeper's packet handlers.
    pub fn register(self: Arc<Self>) {
        let gk = self.clone();
        self.dispatch.register_handler(
            proto::PacketType::DomainConnectRequest,
            Arc::new(move |packet: InboundPacket| {
                let gk = gk.clone();
                tokio::task::spawn(async move {
                    gk.handle_connect_request(packet).await;
                });
            }),
        );

        let gk = self.clone();
        self.dispatch.register_handler(
            proto::PacketType::ICEPingReply,
            Arc::new(move |packet: InboundPacket| {
                gk.handle_ice_ping_reply(packet);
            }),
        );

        let gk = self.clone();
        self.dispatch.register_handler(
            proto::PacketType::DomainDisconnectRequest,
            Arc::new(move |packet: InboundPacket| {
                let gk = gk.clone();
                tokio::task::spawn(async move {
                    if let Some(source) = packet.source {
                        tracing::info!(id = %source.id,
                            "node requested disconnect");
                        let _ = gk.registry.remove(source.id).await;
                    }
                });
            }),
        );

        let gk = self.clone();
        self.dispatch.register_handler(
            proto::PacketType::DomainListRequest,
            Arc::new(move |packet: InboundPacket| {
                let gk = gk.clone();
                tokio::task::spawn(async move {
                    gk.handle_domain_list_request(packet).await;
                });
            }),
        );

        let gk = self.clone();
        self.dispatch.register_handler(
            proto::PacketType::ICEServerPeerInformation,
            Arc::new(move |packet: InboundPacket| {
                let gk = gk.clone();
                tokio::task::spawn(async move {
                    gk.handle_peer_information(packet).await;
                });
            }),
        );
    }

    /// A list request may carry a refreshed interest set; apply it,
    /// then answer with the membership snapshot it selects.
    async fn handle_domain_list_request(&self, packet: InboundPacket) {
        let source = match packet.source.as_ref() {
            Some(source) => source,
            None => return,
        };

        let interest = match proto::decode_interest_set(packet.payload) {
            Ok(interest) => interest,
            Err(err) => {
                tracing::debug!(?err, id = %source.id,
                    "undecodable interest set");
                return;
            }
        };
        if let Some(interest) = interest {
            let _ = self
                .registry
                .set_interest_set(
                    source.id,
                    interest.into_iter().collect(),
                )
                .await;
        }

        match self.registry.get(source.id).await {
            Ok(Some(node)) => {
                self.send_domain_list(&node, packet.sender).await;
            }
            _ => {
                tracing::debug!(id = %source.id,
                    "list request from node no longer live");
            }
        }
    }

    /// The ice-server forwarded a candidate's sockets: start punching
    /// toward both so the candidate's connect request finds an open
    /// path.
    async fn handle_peer_information(&self, packet: InboundPacket) {
        let info = match proto::PeerInformation::decode(packet.payload) {
            Ok(info) => info,
            Err(err) => {
                tracing::debug!(?err, "undecodable peer information");
                return;
            }
        };

        let our_id = NodeId(self.identity.id().0);
        for (target, addr) in [
            (proto::PingTarget::Public, info.sockets.public),
            (proto::PingTarget::Local, info.sockets.local),
        ] {
            let wire = proto::encode_unsourced(
                proto::PacketType::ICEPing,
                self.dispatch.next_sequence(),
                &proto::IcePing {
                    sender_id: our_id,
                    target,
                }
                .encode(),
            );
            if let Err(err) = self.datagrams.send(addr, wire).await {
                tracing::debug!(?err, %addr,
                    "peer information ping send failed");
            }
        }
    }

    /// Subscribe to settings updates: permission resolution is re-run
    /// on every change, updated nodes get a fresh `DomainList`, and any
    /// node losing connect is killed via the registry.
    pub fn watch_settings(self: Arc<Self>) {
        let gk = self.clone();
        self.settings.register_update_listener(Arc::new(move |_| {
            let gk = gk.clone();
            tokio::task::spawn(async move {
                gk.reapply_permissions().await;
            });
        }));
    }

    async fn handle_connect_request(&self, packet: InboundPacket) {
        let sender = packet.sender;
        let req = match proto::ConnectRequest::decode(packet.payload) {
            Ok(req) => req,
            Err(err) => {
                tracing::debug!(?err, %sender,
                    "dropping undecodable connect request");
                return;
            }
        };

        match self.admit(&req, sender).await {
            Ok(node) => {
                tracing::info!(id = %node.id, node_type = ?node.node_type,
                    username = ?node.verified_username(), "connected node");
                self.send_domain_list(&node, sender).await;
            }
            Err((reason, message)) => {
                tracing::info!(?reason, %message, %sender,
                    "denied connect request");
                self.send_denial(reason, message, sender).await;
            }
        }
    }

    /// The admission algorithm. Returns the committed node, or a
    /// denial.
    async fn admit(
        &self,
        req: &proto::ConnectRequest,
        sender: SocketAddr,
    ) -> Result<Arc<NodeInfo>, (proto::DenialReason, String)> {
        // source check: a known pending deployment makes this a worker
        let assignment = match req.assignment_id {
            Some(deployment) => {
                if !self.queue.is_pending(deployment) {
                    return Err((
                        proto::DenialReason::NotAuthorized,
                        "unknown assignment deployment".into(),
                    ));
                }
                Some(deployment)
            }
            None => None,
        };

        // identity resolution
        let identity = if assignment.is_some() {
            ConnectIdentity {
                is_localhost: sender.ip().is_loopback(),
                ..Default::default()
            }
        } else {
            self.resolve_user_identity(req, sender).await?
        };

        // permission computation
        let permissions = if assignment.is_some() {
            // workers are ours: they hold every permission
            Permissions::all()
        } else {
            PermissionsCatalog::from_snapshot(&self.settings.snapshot())
                .resolve(&identity)
        };

        if !permissions.contains(Permissions::CONNECT) {
            return Err((
                proto::DenialReason::NotAuthorized,
                "you do not have permission to connect to this domain"
                    .into(),
            ));
        }

        // capacity check
        if req.node_type.is_agent()
            && !permissions.contains(Permissions::IGNORE_MAX_CAP)
        {
            let capacity: usize = self.settings.get_or(keys::MAX_CAPACITY, 0);
            let count = self
                .registry
                .count_agents()
                .await
                .map_err(internal_denial)?;
            if capacity != 0 && count >= capacity {
                return Err((
                    proto::DenialReason::TooManyUsers,
                    "domain is at user capacity".into(),
                ));
            }
        }

        // ICE rendezvous when the sender address matches neither
        // offered socket
        let active_socket = if sender == req.sockets.public {
            req.sockets.public
        } else if sender == req.sockets.local {
            req.sockets.local
        } else {
            self.ice_rendezvous(req).await?
        };

        // commit
        let node_id = match self.registry.get(req.claimed_id).await {
            Ok(None) if !req.claimed_id.is_nil() => req.claimed_id,
            _ => NodeId::generate(),
        };

        let node = self
            .registry
            .add(NewNode {
                id: node_id,
                node_type: req.node_type,
                sockets: req.sockets,
                active_socket,
                permissions,
                interest_set: req.interest_set.iter().copied().collect(),
                place_name: req.place_name.clone(),
                version: req.version.clone(),
                assignment_id: assignment,
                identity,
            })
            .await
            .map_err(internal_denial)?;

        // bind the deployment so the static original leaves the queue
        if let Some(deployment) = assignment {
            let _ = self.queue.bind(deployment, node.id);
        }

        Ok(node)
    }

    /// Verify a claimed username and gather group membership, each
    /// bounded by the lookup deadline.
    async fn resolve_user_identity(
        &self,
        req: &proto::ConnectRequest,
        sender: SocketAddr,
    ) -> Result<ConnectIdentity, (proto::DenialReason, String)> {
        let mut identity = ConnectIdentity {
            is_localhost: sender.ip().is_loopback(),
            ..Default::default()
        };

        if req.username.is_empty() {
            return Ok(identity);
        }

        let banned: Vec<String> =
            self.settings.get_or(keys::BANNED_USERNAMES, Vec::new());
        if banned
            .iter()
            .any(|b| b.eq_ignore_ascii_case(&req.username))
        {
            return Err((
                proto::DenialReason::Banned,
                "you are banned from this domain".into(),
            ));
        }

        if req.username_signature.is_empty() {
            // unverified claim: treated as anonymous
            return Ok(identity);
        }

        let lookup = self.lookup_window();
        let key = tokio::time::timeout(
            lookup,
            self.metaverse.user_public_key(req.username.clone()),
        )
        .await;

        match key {
            Ok(Ok(Some(key))) => {
                let verified = verify_signature(
                    &key,
                    req.username.to_lowercase().as_bytes(),
                    &req.username_signature,
                );
                if !verified {
                    return Err((
                        proto::DenialReason::LoginError,
                        "username signature did not verify".into(),
                    ));
                }
                identity.verified_username = Some(req.username.clone());
            }
            Ok(Ok(None)) => {
                tracing::debug!(username = %req.username,
                    "metaverse has no public key for user, \
                     continuing anonymously");
                return Ok(identity);
            }
            Ok(Err(err)) => {
                tracing::warn!(?err, username = %req.username,
                    "public key fetch failed, continuing anonymously");
                return Ok(identity);
            }
            Err(_) => {
                tracing::warn!(username = %req.username,
                    "public key fetch hit deadline, \
                     continuing anonymously");
                return Ok(identity);
            }
        }

        // group membership: proceed with whatever is known when the
        // window closes
        match tokio::time::timeout(
            lookup,
            self.metaverse.user_groups(req.username.clone()),
        )
        .await
        {
            Ok(Ok(groups)) => {
                identity.groups = groups.groups;
                identity.is_friend = groups.is_friend;
            }
            Ok(Err(err)) => {
                tracing::debug!(?err, "group lookup failed");
            }
            Err(_) => {
                tracing::debug!("group lookup hit deadline");
            }
        }

        Ok(identity)
    }

    /// Symmetric ICE: probe both offered sockets and take whichever
    /// answers first, up to the rendezvous deadline.
    async fn ice_rendezvous(
        &self,
        req: &proto::ConnectRequest,
    ) -> Result<SocketAddr, (proto::DenialReason, String)> {
        let (reply_send, reply_recv) = tokio::sync::oneshot::channel();
        self.ice_pending
            .lock()
            .unwrap()
            .insert(req.claimed_id, reply_send);

        let our_id = NodeId(self.identity.id().0);
        for (target, addr) in [
            (proto::PingTarget::Public, req.sockets.public),
            (proto::PingTarget::Local, req.sockets.local),
        ] {
            let wire = proto::encode_unsourced(
                proto::PacketType::ICEPing,
                self.dispatch.next_sequence(),
                &proto::IcePing {
                    sender_id: our_id,
                    target,
                }
                .encode(),
            );
            if let Err(err) = self.datagrams.send(addr, wire).await {
                tracing::debug!(?err, %addr, "ice ping send failed");
            }
        }

        let window = std::time::Duration::from_secs(
            self.settings
                .get_or(keys::ICE_RENDEZVOUS_SECS, DEFAULT_ICE_RENDEZVOUS_SECS),
        );
        let answered = tokio::time::timeout(window, reply_recv).await;
        self.ice_pending.lock().unwrap().remove(&req.claimed_id);

        match answered {
            Ok(Ok(addr)) => Ok(addr),
            _ => Err((
                proto::DenialReason::TimedOut,
                "no answer on either offered socket".into(),
            )),
        }
    }

    fn handle_ice_ping_reply(&self, packet: InboundPacket) {
        let reply = match proto::IcePing::decode(packet.payload) {
            Ok(reply) => reply,
            Err(err) => {
                tracing::debug!(?err, "undecodable ice ping reply");
                return;
            }
        };
        if let Some(waiter) = self
            .ice_pending
            .lock()
            .unwrap()
            .remove(&reply.sender_id)
        {
            // first answer wins; the loser was already removed
            let _ = waiter.send(packet.sender);
        }
    }

    /// Build and send the membership snapshot a node is interested in,
    /// with the pairwise secret for every listed peer.
    pub async fn send_domain_list(&self, node: &NodeInfo, to: SocketAddr) {
        let list = match self.build_domain_list(node).await {
            Ok(list) => list,
            Err(err) => {
                tracing::warn!(?err, id = %node.id,
                    "could not build domain list");
                return;
            }
        };
        let wire = proto::encode_unsourced(
            proto::PacketType::DomainList,
            self.dispatch.next_sequence(),
            &list.encode(),
        );
        if let Err(err) = self.datagrams.send(to, wire).await {
            tracing::debug!(?err, id = %node.id,
                "dropping domain list send failure");
        }
    }

    async fn build_domain_list(
        &self,
        node: &NodeInfo,
    ) -> ToriiResult<proto::DomainList> {
        let mut peers = Vec::new();
        for peer in self.registry.get_all().await? {
            if peer.id == node.id
                || !node.interest_set.contains(&peer.node_type)
            {
                continue;
            }
            let secret =
                self.registry.connection_secret(node.id, peer.id).await?;
            peers.push(proto::PeerEntry {
                id: peer.id,
                node_type: peer.node_type,
                sockets: peer.sockets,
                local_id: peer.local_id,
                permissions: peer.permissions,
                secret,
            });
        }
        Ok(proto::DomainList {
            domain_id: self.identity.id(),
            your_id: node.id,
            your_local_id: node.local_id,
            your_secret: node.connection_secret,
            permissions: node.permissions,
            peers,
        })
    }

    async fn send_denial(
        &self,
        reason: proto::DenialReason,
        message: String,
        to: SocketAddr,
    ) {
        let wire = proto::encode_unsourced(
            proto::PacketType::DomainConnectionDenied,
            self.dispatch.next_sequence(),
            &proto::ConnectDenied { reason, message }.encode(),
        );
        if let Err(err) = self.datagrams.send(to, wire).await {
            tracing::debug!(?err, %to, "dropping denial send failure");
        }
    }

    /// Re-run permission resolution for every live node against the
    /// current settings snapshot.
    pub async fn reapply_permissions(&self) {
        let catalog =
            PermissionsCatalog::from_snapshot(&self.settings.snapshot());

        let nodes = match self.registry.get_all().await {
            Ok(nodes) => nodes,
            Err(err) => {
                tracing::warn!(?err, "could not snapshot registry");
                return;
            }
        };

        for node in nodes {
            if node.assignment_id.is_some() {
                // workers keep their full vector
                continue;
            }
            let permissions = catalog.resolve(&node.identity);
            if permissions == node.permissions {
                continue;
            }

            if !permissions.contains(Permissions::CONNECT) {
                tracing::info!(id = %node.id,
                    "connect permission revoked, killing node");
                let _ = self.registry.remove(node.id).await;
                self.send_denial(
                    proto::DenialReason::NotAuthorized,
                    "your connect permission was revoked".into(),
                    node.active_socket,
                )
                .await;
                continue;
            }

            if let Err(err) =
                self.registry.set_permissions(node.id, permissions).await
            {
                tracing::warn!(?err, id = %node.id,
                    "could not update permissions");
                continue;
            }
            if let Ok(Some(updated)) = self.registry.get(node.id).await {
                self.send_domain_list(&updated, updated.active_socket)
                    .await;
            }
        }
    }

    fn lookup_window(&self) -> std::time::Duration {
        std::time::Duration::from_secs(
            self.settings
                .get_or(keys::LOOKUP_SECS, DEFAULT_LOOKUP_SECS),
        )
    }
}

fn internal_denial(err: ToriiError) -> (proto::DenialReason, String) {
    (proto::DenialReason::NotAuthorized, err.to_string())
}
