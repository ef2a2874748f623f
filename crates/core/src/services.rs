//! Per-node service handlers: the small request/response packets an
//! admitted node can send the controller outside the admission flow.

use crate::dispatch::*;
use crate::identity::DomainIdentity;
use std::sync::Arc;
use torii_api::protocol as proto;
use torii_api::*;

/// Settings keys read by [NodeServices].
mod keys {
    /// The named-path table, mapping `/name` to a viewpoint string.
    pub const PATHS: &str = "paths";
}

const DEFAULT_VIEWPOINT: &str = "/0,0,0/0,0,0,1";

/// The per-node service handlers.
pub struct NodeServices {
    settings: SettingsStore,
    registry: DynNodeRegistry,
    datagrams: DynDatagrams,
    dispatch: Arc<PacketDispatch>,
    identity: Arc<DomainIdentity>,
}

impl std::fmt::Debug for NodeServices {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeServices").finish()
    }
}

impl NodeServices {
    /// Construct the services over their collaborators.
    pub fn create(
        settings: SettingsStore,
        registry: DynNodeRegistry,
        datagrams: DynDatagrams,
        dispatch: Arc<PacketDispatch>,
        identity: Arc<DomainIdentity>,
    ) -> Arc<Self> {
        Arc::new(Self {
            settings,
            registry,
            datagrams,
            dispatch,
            identity,
        })
    }

    /// Register every service handler.
    pub fn register(self: Arc<Self>) {
        let svc = self.clone();
        self.dispatch.register_handler(
            proto::PacketType::DomainServerPathQuery,
            Arc::new(move |packet: InboundPacket| {
                let svc = svc.clone();
                tokio::task::spawn(async move {
                    svc.handle_path_query(packet).await;
                });
            }),
        );

        let svc = self.clone();
        self.dispatch.register_handler(
            proto::PacketType::NodeJsonStats,
            Arc::new(move |packet: InboundPacket| {
                let svc = svc.clone();
                tokio::task::spawn(async move {
                    svc.handle_stats(packet).await;
                });
            }),
        );

        let svc = self.clone();
        self.dispatch.register_handler(
            proto::PacketType::NodeKickRequest,
            Arc::new(move |packet: InboundPacket| {
                let svc = svc.clone();
                tokio::task::spawn(async move {
                    svc.handle_kick(packet).await;
                });
            }),
        );

        let svc = self.clone();
        self.dispatch.register_handler(
            proto::PacketType::UsernameFromIDRequest,
            Arc::new(move |packet: InboundPacket| {
                let svc = svc.clone();
                tokio::task::spawn(async move {
                    svc.handle_username_from_id(packet).await;
                });
            }),
        );

        let svc = self.clone();
        self.dispatch.register_handler(
            proto::PacketType::DomainSettingsRequest,
            Arc::new(move |packet: InboundPacket| {
                let svc = svc.clone();
                tokio::task::spawn(async move {
                    svc.handle_settings_request(packet).await;
                });
            }),
        );

        let svc = self.clone();
        self.dispatch.register_handler(
            proto::PacketType::ICEPing,
            Arc::new(move |packet: InboundPacket| {
                let svc = svc.clone();
                tokio::task::spawn(async move {
                    svc.handle_ice_ping(packet).await;
                });
            }),
        );
    }

    async fn handle_path_query(&self, packet: InboundPacket) {
        let query = match proto::PathQuery::decode(packet.payload) {
            Ok(query) => query,
            Err(err) => {
                tracing::debug!(?err, "undecodable path query");
                return;
            }
        };

        let key = query.path.trim_start_matches('/');
        let viewpoint = if key.is_empty() {
            self.settings
                .get_or(&format!("{}.root", keys::PATHS), String::new())
        } else {
            self.settings
                .get_or(&format!("{}.{key}", keys::PATHS), String::new())
        };
        let viewpoint = if viewpoint.is_empty() {
            if key.is_empty() {
                DEFAULT_VIEWPOINT.to_string()
            } else {
                // unknown named path: no response
                return;
            }
        } else {
            viewpoint
        };

        let wire = proto::encode_unsourced(
            proto::PacketType::DomainServerPathResponse,
            self.dispatch.next_sequence(),
            &proto::PathResponse {
                path: query.path,
                viewpoint,
            }
            .encode(),
        );
        if let Err(err) = self.datagrams.send(packet.sender, wire).await {
            tracing::debug!(?err, "path response send failed");
        }
    }

    async fn handle_stats(&self, packet: InboundPacket) {
        let source = match packet.source.as_ref() {
            Some(source) => source,
            None => return,
        };
        match serde_json::from_slice(&packet.payload) {
            Ok(stats) => {
                let _ = self.registry.set_stats(source.id, stats).await;
            }
            Err(err) => {
                tracing::debug!(?err, id = %source.id,
                    "undecodable stats blob");
            }
        }
    }

    async fn handle_kick(&self, packet: InboundPacket) {
        let source = match packet.source.as_ref() {
            Some(source) => source,
            None => return,
        };
        if !source.can(Permissions::KICK) {
            tracing::warn!(id = %source.id,
                "kick request from node without kick permission");
            return;
        }

        let target_id = match proto::decode_node_id(packet.payload) {
            Ok(id) => id,
            Err(err) => {
                tracing::debug!(?err, "undecodable kick request");
                return;
            }
        };
        if target_id == source.id {
            tracing::warn!(id = %source.id, "node tried to kick itself");
            return;
        }

        let target = match self.registry.get(target_id).await {
            Ok(Some(target)) => target,
            _ => return,
        };
        if !target.node_type.is_agent() {
            tracing::warn!(id = %target.id,
                "refusing to kick a worker node");
            return;
        }

        tracing::info!(target = %target.id, by = %source.id, "kicking node");

        // a kick is a standing ban, not just an eviction
        if let Some(username) = target.verified_username() {
            let mut banned: Vec<String> = self
                .settings
                .get_or("security.banned_usernames", Vec::new());
            if !banned.iter().any(|b| b.eq_ignore_ascii_case(username)) {
                banned.push(username.to_string());
                let _ = self.settings.recurse_and_overwrite(
                    serde_json::json!({
                        "security": { "banned_usernames": banned }
                    }),
                );
            }
        }

        let _ = self.registry.remove(target.id).await;
    }

    async fn handle_username_from_id(&self, packet: InboundPacket) {
        if packet.source.is_none() {
            return;
        }
        let target_id = match proto::decode_node_id(packet.payload) {
            Ok(id) => id,
            Err(_) => return,
        };

        let (username, verified) =
            match self.registry.get(target_id).await {
                Ok(Some(target)) => (
                    target.verified_username().unwrap_or("").to_string(),
                    target.verified_username().is_some(),
                ),
                _ => (String::new(), false),
            };

        let wire = proto::encode_unsourced(
            proto::PacketType::UsernameFromIDReply,
            self.dispatch.next_sequence(),
            &proto::UsernameFromIdReply {
                node_id: target_id,
                username,
                verified,
            }
            .encode(),
        );
        if let Err(err) = self.datagrams.send(packet.sender, wire).await {
            tracing::debug!(?err, "username reply send failed");
        }
    }

    /// Workers fetch their settings subset at spawn; everything except
    /// the security tree is theirs to read.
    async fn handle_settings_request(&self, packet: InboundPacket) {
        if packet.source.is_none() {
            return;
        }
        let mut snapshot = self.settings.snapshot();
        if let Some(map) = snapshot.as_object_mut() {
            map.remove("security");
        }
        let payload = match serde_json::to_vec(&snapshot) {
            Ok(payload) => payload,
            Err(err) => {
                tracing::warn!(?err, "could not encode settings subset");
                return;
            }
        };

        let wire = proto::encode_unsourced(
            proto::PacketType::DomainSettings,
            self.dispatch.next_sequence(),
            &payload,
        );
        if let Err(err) = self.datagrams.send(packet.sender, wire).await {
            tracing::debug!(?err, "settings reply send failed");
        }
    }

    async fn handle_ice_ping(&self, packet: InboundPacket) {
        let ping = match proto::IcePing::decode(packet.payload) {
            Ok(ping) => ping,
            Err(_) => return,
        };
        let wire = proto::encode_unsourced(
            proto::PacketType::ICEPingReply,
            self.dispatch.next_sequence(),
            &proto::IcePing {
                sender_id: NodeId(self.identity.id().0),
                target: ping.target,
            }
            .encode(),
        );
        if let Err(err) = self.datagrams.send(packet.sender, wire).await {
            tracing::debug!(?err, "ice ping reply send failed");
        }
    }
}

#[cfg(test)]
mod test;
