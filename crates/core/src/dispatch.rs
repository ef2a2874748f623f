//! Typed packet routing.
//!
//! Inbound frames are classified by the typed header and routed through
//! a static `{type → handler}` table registered at startup. Sourced
//! types require that the source-local-id resolves to a live node, that
//! the sender address equals that node's recorded address (with the
//! RFC-1918 relaxation), and that the HMAC trailer verifies against the
//! node's controller secret. Packets failing any check are dropped
//! silently; a connect request with a version mismatch is answered with
//! a single denial before being dropped.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use torii_api::protocol::*;
use torii_api::*;

/// A verified inbound packet handed to a registered handler.
#[derive(Debug, Clone)]
pub struct InboundPacket {
    /// The packet header.
    pub header: PacketHeader,
    /// The packet payload (HMAC trailer excluded).
    pub payload: bytes::Bytes,
    /// The sender address.
    pub sender: SocketAddr,
    /// The resolved live source node, for sourced types.
    pub source: Option<Arc<NodeInfo>>,
}

/// Receives verified packets of one registered type.
pub trait PacketHandler: 'static + Send + Sync {
    /// Handle one verified packet.
    fn handle(&self, packet: InboundPacket);
}

/// Trait-object [PacketHandler].
pub type DynPacketHandler = Arc<dyn PacketHandler>;

impl<F: Fn(InboundPacket) + 'static + Send + Sync> PacketHandler for F {
    fn handle(&self, packet: InboundPacket) {
        self(packet)
    }
}

type HandlerTable = Arc<Mutex<HashMap<PacketType, DynPacketHandler>>>;

/// The packet dispatch: one ingest task demultiplexing verified frames
/// to per-type handlers, preserving arrival order up to each handler.
pub struct PacketDispatch {
    handlers: HandlerTable,
    ingest_send: tokio::sync::mpsc::UnboundedSender<(
        SocketAddr,
        bytes::Bytes,
    )>,
    ingest_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
    seq: Arc<AtomicU32>,
}

impl std::fmt::Debug for PacketDispatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketDispatch").finish()
    }
}

impl Drop for PacketDispatch {
    fn drop(&mut self) {
        if let Some(task) = self.ingest_task.lock().unwrap().take() {
            task.abort();
        }
    }
}

impl PacketDispatch {
    /// Construct a dispatch over a registry and a transport, and hook
    /// it in as the transport's frame handler.
    pub fn create(
        registry: DynNodeRegistry,
        datagrams: DynDatagrams,
    ) -> Arc<Self> {
        let (ingest_send, ingest_recv) =
            tokio::sync::mpsc::unbounded_channel();

        let handlers: HandlerTable =
            Arc::new(Mutex::new(HashMap::new()));
        let seq = Arc::new(AtomicU32::new(0));

        let task = tokio::task::spawn(ingest_task(
            handlers.clone(),
            seq.clone(),
            registry,
            datagrams.clone(),
            ingest_recv,
        ));

        let out = Arc::new(Self {
            handlers,
            ingest_send,
            ingest_task: Mutex::new(Some(task)),
            seq,
        });

        datagrams.register_handler(out.clone());
        out
    }

    /// Register the handler for a packet type.
    ///
    /// Panics if you attempt to register a duplicate handler for a
    /// type; the table is meant to be filled once at startup.
    pub fn register_handler(
        &self,
        packet_type: PacketType,
        handler: DynPacketHandler,
    ) {
        if self
            .handlers
            .lock()
            .unwrap()
            .insert(packet_type, handler)
            .is_some()
        {
            panic!("duplicate packet handler for {packet_type:?}");
        }
    }

    /// The next outbound sequence number.
    pub fn next_sequence(&self) -> u32 {
        self.seq.fetch_add(1, Ordering::Relaxed)
    }
}

impl FrameHandler for PacketDispatch {
    fn recv_frame(&self, from: SocketAddr, data: bytes::Bytes) {
        // queue to the ingest task; per-sender arrival order is
        // preserved through the channel
        let _ = self.ingest_send.send((from, data));
    }
}

async fn ingest_task(
    handlers: HandlerTable,
    seq: Arc<AtomicU32>,
    registry: DynNodeRegistry,
    datagrams: DynDatagrams,
    mut ingest_recv: tokio::sync::mpsc::UnboundedReceiver<(
        SocketAddr,
        bytes::Bytes,
    )>,
) {
    while let Some((sender, data)) = ingest_recv.recv().await {
        let frame = match decode_frame(data) {
            Ok(frame) => frame,
            Err(err) => {
                tracing::trace!(?err, %sender, "dropping undecodable frame");
                continue;
            }
        };

        let ty = frame.header.packet_type;

        if frame.header.version != ty.expected_version() {
            if ty == PacketType::DomainConnectRequest {
                let denial = ConnectDenied {
                    reason: DenialReason::ProtocolMismatch,
                    message: format!(
                        "domain speaks protocol version {}",
                        ty.expected_version()
                    ),
                };
                let wire = encode_unsourced(
                    PacketType::DomainConnectionDenied,
                    seq.fetch_add(1, Ordering::Relaxed),
                    &denial.encode(),
                );
                if let Err(err) = datagrams.send(sender, wire).await {
                    tracing::debug!(?err, %sender,
                        "failed to send protocol mismatch denial");
                }
            }
            tracing::trace!(?ty, %sender, "dropping version mismatch");
            continue;
        }

        let source = if ty.is_sourced() {
            match verify_source(&registry, &frame, sender).await {
                Some(node) => {
                    let _ = registry.touch(node.id, Timestamp::now()).await;
                    Some(node)
                }
                None => continue,
            }
        } else {
            None
        };

        let handler = handlers.lock().unwrap().get(&ty).cloned();
        match handler {
            Some(handler) => handler.handle(InboundPacket {
                header: frame.header,
                payload: frame.payload,
                sender,
                source,
            }),
            None => {
                tracing::trace!(?ty, "no handler registered, dropping");
            }
        }
    }
}

async fn verify_source(
    registry: &DynNodeRegistry,
    frame: &Frame,
    sender: SocketAddr,
) -> Option<Arc<NodeInfo>> {
    let local_id = frame.source_local_id?;

    let node = match registry.get_by_local_id(local_id).await {
        Ok(Some(node)) => node,
        _ => {
            tracing::trace!(%local_id, "dropping packet from unknown source");
            return None;
        }
    };

    // a reconnect from a different local interface is fine as long as
    // both addresses are private
    let addr_ok = node.active_socket == sender
        || (is_rfc1918(&node.active_socket) && is_rfc1918(&sender));
    if !addr_ok {
        tracing::trace!(
            id = %node.id,
            recorded = %node.active_socket,
            %sender,
            "dropping packet from mismatched address"
        );
        return None;
    }

    if !verify_mac(frame, &node.connection_secret) {
        tracing::trace!(id = %node.id, "dropping packet with bad mac");
        return None;
    }

    Some(node)
}

#[cfg(test)]
mod test;
