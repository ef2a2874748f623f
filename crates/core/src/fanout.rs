//! Membership fan-out: turns registry events into
//! `DomainServerAddedNode` / `DomainServerRemovedNode` packets for
//! every live peer whose interest set contains the changed node's type.

use crate::dispatch::PacketDispatch;
use std::sync::Arc;
use torii_api::protocol as proto;
use torii_api::*;

/// The membership fan-out task holder.
pub struct MembershipFanout {
    registry: DynNodeRegistry,
    datagrams: DynDatagrams,
    dispatch: Arc<PacketDispatch>,
}

impl std::fmt::Debug for MembershipFanout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MembershipFanout").finish()
    }
}

impl MembershipFanout {
    /// Construct the fan-out and subscribe it to registry events.
    pub fn register(
        registry: DynNodeRegistry,
        datagrams: DynDatagrams,
        dispatch: Arc<PacketDispatch>,
    ) -> ToriiResult<Arc<Self>> {
        let out = Arc::new(Self {
            registry: registry.clone(),
            datagrams,
            dispatch,
        });

        let fanout = out.clone();
        registry.register_event_listener(Arc::new(move |event| {
            let fanout = fanout.clone();
            // events arrive in registry order; a task per event keeps
            // the registry's listener callback non-blocking while the
            // sends themselves go out in spawn order
            tokio::task::spawn(async move {
                fanout.fan_out(event).await;
            });
        }))?;

        Ok(out)
    }

    async fn fan_out(&self, event: NodeEvent) {
        let (changed, is_added) = match &event {
            NodeEvent::Added(node) => (node.clone(), true),
            NodeEvent::Removed(node) => (node.clone(), false),
        };

        let peers = match self.registry.get_all().await {
            Ok(peers) => peers,
            Err(err) => {
                tracing::warn!(?err, "fan-out could not snapshot registry");
                return;
            }
        };

        for peer in peers {
            if peer.id == changed.id
                || !peer.interest_set.contains(&changed.node_type)
            {
                continue;
            }

            let wire = if is_added {
                let secret = match self
                    .registry
                    .connection_secret(changed.id, peer.id)
                    .await
                {
                    Ok(secret) => secret,
                    Err(err) => {
                        tracing::warn!(?err, peer = %peer.id,
                            "no pair secret for fan-out, skipping peer");
                        continue;
                    }
                };
                proto::encode_unsourced(
                    proto::PacketType::DomainServerAddedNode,
                    self.dispatch.next_sequence(),
                    &proto::PeerEntry {
                        id: changed.id,
                        node_type: changed.node_type,
                        sockets: changed.sockets,
                        local_id: changed.local_id,
                        permissions: changed.permissions,
                        secret,
                    }
                    .encode(),
                )
            } else {
                proto::encode_unsourced(
                    proto::PacketType::DomainServerRemovedNode,
                    self.dispatch.next_sequence(),
                    &proto::encode_node_id(&changed.id),
                )
            };

            // a failed send must never compromise registry integrity:
            // log and drop
            if let Err(err) =
                self.datagrams.send(peer.active_socket, wire).await
            {
                tracing::debug!(?err, peer = %peer.id,
                    "dropping membership fan-out send failure");
            }
        }
    }
}
