use super::*;
use crate::factories::MemDatagrams;

struct Harness {
    registry: DynNodeRegistry,
    dispatch: Arc<PacketDispatch>,
    server: Arc<MemDatagrams>,
    seen: Arc<Mutex<Vec<InboundPacket>>>,
}

async fn harness() -> Harness {
    let mut builder = crate::default_builder();
    builder.set_default_config().unwrap();
    let builder = builder.build();

    let registry = builder
        .registry
        .create(builder.clone())
        .await
        .unwrap();

    let server = MemDatagrams::create();
    let dispatch =
        PacketDispatch::create(registry.clone(), server.clone());

    let seen = Arc::new(Mutex::new(Vec::new()));
    for ty in [
        PacketType::ICEPing,
        PacketType::DomainListRequest,
        PacketType::NodeJsonStats,
    ] {
        let seen2 = seen.clone();
        dispatch.register_handler(
            ty,
            Arc::new(move |p: InboundPacket| {
                seen2.lock().unwrap().push(p);
            }),
        );
    }

    Harness {
        registry,
        dispatch,
        server,
        seen,
    }
}

async fn settle() {
    // let the ingest task drain
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
}

async fn admit(
    h: &Harness,
    active_socket: std::net::SocketAddr,
) -> Arc<NodeInfo> {
    h.registry
        .add(NewNode {
            id: NodeId::generate(),
            node_type: NodeType::Agent,
            sockets: SocketPair {
                public: active_socket,
                local: "192.168.1.2:1000".parse().unwrap(),
            },
            active_socket,
            permissions: Permissions::CONNECT,
            interest_set: Default::default(),
            place_name: String::new(),
            version: String::new(),
            assignment_id: None,
            identity: Default::default(),
        })
        .await
        .unwrap()
}

#[tokio::test]
async fn unsourced_packets_route_without_a_source() {
    let h = harness().await;
    let client = MemDatagrams::create();

    let ping = IcePing {
        sender_id: NodeId::generate(),
        target: PingTarget::Public,
    };
    client
        .send(
            h.server.local_addr().unwrap(),
            encode_unsourced(PacketType::ICEPing, 0, &ping.encode()),
        )
        .await
        .unwrap();
    settle().await;

    let seen = h.seen.lock().unwrap();
    assert_eq!(1, seen.len());
    assert!(seen[0].source.is_none());
    assert_eq!(client.local_addr().unwrap(), seen[0].sender);
}

#[tokio::test]
async fn sourced_packet_verifies_and_touches() {
    let h = harness().await;
    let client = MemDatagrams::create();
    let addr = client.local_addr().unwrap();
    let node = admit(&h, addr).await;

    let before =
        h.registry.get(node.id).await.unwrap().unwrap().last_heartbeat;
    tokio::time::sleep(std::time::Duration::from_millis(10)).await;

    client
        .send(
            h.server.local_addr().unwrap(),
            encode_sourced(
                PacketType::DomainListRequest,
                0,
                node.local_id,
                b"",
                &node.connection_secret,
            ),
        )
        .await
        .unwrap();
    settle().await;

    let seen = h.seen.lock().unwrap();
    assert_eq!(1, seen.len());
    assert_eq!(
        node.id,
        seen[0].source.as_ref().unwrap().id,
    );

    let after =
        h.registry.get(node.id).await.unwrap().unwrap().last_heartbeat;
    assert!(after > before);
}

#[tokio::test]
async fn sourced_packet_with_bad_mac_dropped() {
    let h = harness().await;
    let client = MemDatagrams::create();
    let node = admit(&h, client.local_addr().unwrap()).await;

    client
        .send(
            h.server.local_addr().unwrap(),
            encode_sourced(
                PacketType::DomainListRequest,
                0,
                node.local_id,
                b"",
                &SessionSecret::generate(),
            ),
        )
        .await
        .unwrap();
    settle().await;

    assert!(h.seen.lock().unwrap().is_empty());
}

#[tokio::test]
async fn sourced_packet_from_unknown_local_id_dropped() {
    let h = harness().await;
    let client = MemDatagrams::create();

    client
        .send(
            h.server.local_addr().unwrap(),
            encode_sourced(
                PacketType::NodeJsonStats,
                0,
                LocalId(999),
                b"{}",
                &SessionSecret::generate(),
            ),
        )
        .await
        .unwrap();
    settle().await;

    assert!(h.seen.lock().unwrap().is_empty());
}

#[tokio::test]
async fn sender_address_mismatch_dropped_unless_both_private() {
    let h = harness().await;

    // recorded at a public address; packets from elsewhere are dropped
    let public_client =
        MemDatagrams::create_at("203.0.113.9:7000".parse().unwrap());
    let node = admit(&h, "203.0.113.10:7000".parse().unwrap()).await;

    public_client
        .send(
            h.server.local_addr().unwrap(),
            encode_sourced(
                PacketType::DomainListRequest,
                0,
                node.local_id,
                b"",
                &node.connection_secret,
            ),
        )
        .await
        .unwrap();
    settle().await;
    assert!(h.seen.lock().unwrap().is_empty());

    // recorded at a private address; a different private interface is
    // accepted
    let private_client =
        MemDatagrams::create_at("10.0.0.9:7000".parse().unwrap());
    let node = admit(&h, "192.168.1.44:7000".parse().unwrap()).await;

    private_client
        .send(
            h.server.local_addr().unwrap(),
            encode_sourced(
                PacketType::DomainListRequest,
                0,
                node.local_id,
                b"",
                &node.connection_secret,
            ),
        )
        .await
        .unwrap();
    settle().await;
    assert_eq!(1, h.seen.lock().unwrap().len());
}

#[tokio::test]
async fn version_mismatched_connect_request_answered_with_denial() {
    let h = harness().await;
    let client = MemDatagrams::create();

    let denials = Arc::new(Mutex::new(Vec::new()));
    struct Collect(Arc<Mutex<Vec<bytes::Bytes>>>);
    impl FrameHandler for Collect {
        fn recv_frame(&self, _from: std::net::SocketAddr, data: bytes::Bytes) {
            self.0.lock().unwrap().push(data);
        }
    }
    client.register_handler(Arc::new(Collect(denials.clone())));

    // hand-build a connect request frame with a stale version byte
    let mut wire = encode_unsourced(
        PacketType::DomainConnectRequest,
        0,
        b"irrelevant",
    )
    .to_vec();
    wire[1] = 1; // expected version is 2
    client
        .send(h.server.local_addr().unwrap(), wire.into())
        .await
        .unwrap();
    settle().await;

    let denials = denials.lock().unwrap();
    assert_eq!(1, denials.len());
    let frame = decode_frame(denials[0].clone()).unwrap();
    assert_eq!(
        PacketType::DomainConnectionDenied,
        frame.header.packet_type,
    );
    let denied = ConnectDenied::decode(frame.payload).unwrap();
    assert_eq!(DenialReason::ProtocolMismatch, denied.reason);
}
