use super::*;
use crate::factories::MemDatagrams;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Mutex;

struct Client {
    dg: Arc<MemDatagrams>,
    frames: Arc<Mutex<Vec<bytes::Bytes>>>,
}

struct Collect(Arc<Mutex<Vec<bytes::Bytes>>>);

impl FrameHandler for Collect {
    fn recv_frame(&self, _from: SocketAddr, data: bytes::Bytes) {
        self.0.lock().unwrap().push(data);
    }
}

impl Client {
    fn new() -> Self {
        let dg = MemDatagrams::create();
        let frames = Arc::new(Mutex::new(Vec::new()));
        dg.register_handler(Arc::new(Collect(frames.clone())));
        Self { dg, frames }
    }

    fn addr(&self) -> SocketAddr {
        self.dg.local_addr().unwrap()
    }

    async fn recv(&self) -> proto::Frame {
        for _ in 0..100 {
            {
                let mut frames = self.frames.lock().unwrap();
                if !frames.is_empty() {
                    return proto::decode_frame(frames.remove(0)).unwrap();
                }
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        panic!("no frame arrived");
    }
}

struct Harness {
    settings: SettingsStore,
    registry: DynNodeRegistry,
    server: Arc<MemDatagrams>,
    identity: Arc<DomainIdentity>,
}

async fn harness() -> Harness {
    let mut builder = crate::default_builder();
    builder.set_default_config().unwrap();
    let settings = builder.settings.clone();
    let builder = builder.build();
    let registry =
        builder.registry.create(builder.clone()).await.unwrap();

    let server = MemDatagrams::create();
    let dispatch =
        PacketDispatch::create(registry.clone(), server.clone());
    let identity =
        Arc::new(DomainIdentity::new(DomainId::generate(), "home"));

    let services = NodeServices::create(
        settings.clone(),
        registry.clone(),
        server.clone(),
        dispatch,
        identity.clone(),
    );
    services.clone().register();

    Harness {
        settings,
        registry,
        server,
        identity,
    }
}

async fn admit(
    h: &Harness,
    client: &Client,
    node_type: NodeType,
    permissions: Permissions,
    username: Option<&str>,
) -> Arc<NodeInfo> {
    h.registry
        .add(NewNode {
            id: NodeId::generate(),
            node_type,
            sockets: SocketPair {
                public: client.addr(),
                local: "192.168.1.9:1".parse().unwrap(),
            },
            active_socket: client.addr(),
            permissions,
            interest_set: Default::default(),
            place_name: String::new(),
            version: String::new(),
            assignment_id: None,
            identity: torii_api::settings::ConnectIdentity {
                verified_username: username.map(str::to_string),
                ..Default::default()
            },
        })
        .await
        .unwrap()
}

async fn send_sourced(
    h: &Harness,
    client: &Client,
    node: &NodeInfo,
    ty: proto::PacketType,
    payload: &[u8],
) {
    client
        .dg
        .send(
            h.server.local_addr().unwrap(),
            proto::encode_sourced(
                ty,
                0,
                node.local_id,
                payload,
                &node.connection_secret,
            ),
        )
        .await
        .unwrap();
}

#[tokio::test]
async fn root_path_query_answers_default_viewpoint() {
    let h = harness().await;
    let client = Client::new();
    let node =
        admit(&h, &client, NodeType::Agent, Permissions::CONNECT, None)
            .await;

    send_sourced(
        &h,
        &client,
        &node,
        proto::PacketType::DomainServerPathQuery,
        &proto::PathQuery { path: "/".into() }.encode(),
    )
    .await;

    let frame = client.recv().await;
    assert_eq!(
        proto::PacketType::DomainServerPathResponse,
        frame.header.packet_type,
    );
    let resp = proto::PathResponse::decode(frame.payload).unwrap();
    assert_eq!("/", resp.path);
    assert_eq!(DEFAULT_VIEWPOINT, resp.viewpoint);
}

#[tokio::test]
async fn configured_path_query_answers_its_viewpoint() {
    let h = harness().await;
    h.settings
        .set_override("paths.spawn", json!("/10,0,10/0,0,0,1"));

    let client = Client::new();
    let node =
        admit(&h, &client, NodeType::Agent, Permissions::CONNECT, None)
            .await;

    send_sourced(
        &h,
        &client,
        &node,
        proto::PacketType::DomainServerPathQuery,
        &proto::PathQuery {
            path: "/spawn".into(),
        }
        .encode(),
    )
    .await;

    let resp =
        proto::PathResponse::decode(client.recv().await.payload).unwrap();
    assert_eq!("/10,0,10/0,0,0,1", resp.viewpoint);
}

#[tokio::test]
async fn stats_blobs_are_stored_per_node() {
    let h = harness().await;
    let client = Client::new();
    let node =
        admit(&h, &client, NodeType::AudioMixer, Permissions::all(), None)
            .await;

    send_sourced(
        &h,
        &client,
        &node,
        proto::PacketType::NodeJsonStats,
        br#"{"mix_rate": 59.9}"#,
    )
    .await;

    for _ in 0..100 {
        if let Some(stats) = h.registry.get_stats(node.id).await.unwrap()
        {
            assert_eq!(json!({"mix_rate": 59.9}), stats);
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    panic!("stats never stored");
}

#[tokio::test]
async fn kick_requires_permission_and_bans_the_username() {
    let h = harness().await;

    let kicker_client = Client::new();
    let kicker = admit(
        &h,
        &kicker_client,
        NodeType::Agent,
        Permissions::CONNECT | Permissions::KICK,
        Some("admin"),
    )
    .await;

    let victim_client = Client::new();
    let victim = admit(
        &h,
        &victim_client,
        NodeType::Agent,
        Permissions::CONNECT,
        Some("mallory"),
    )
    .await;

    send_sourced(
        &h,
        &kicker_client,
        &kicker,
        proto::PacketType::NodeKickRequest,
        &proto::encode_node_id(&victim.id),
    )
    .await;

    for _ in 0..100 {
        if h.registry.get(victim.id).await.unwrap().is_none() {
            let banned: Vec<String> = h
                .settings
                .get_or("security.banned_usernames", Vec::new());
            assert_eq!(vec!["mallory".to_string()], banned);
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    panic!("victim never kicked");
}

#[tokio::test]
async fn kick_without_permission_is_ignored() {
    let h = harness().await;

    let kicker_client = Client::new();
    let kicker = admit(
        &h,
        &kicker_client,
        NodeType::Agent,
        Permissions::CONNECT,
        None,
    )
    .await;
    let victim_client = Client::new();
    let victim = admit(
        &h,
        &victim_client,
        NodeType::Agent,
        Permissions::CONNECT,
        None,
    )
    .await;

    send_sourced(
        &h,
        &kicker_client,
        &kicker,
        proto::PacketType::NodeKickRequest,
        &proto::encode_node_id(&victim.id),
    )
    .await;

    tokio::time::sleep(std::time::Duration::from_millis(150)).await;
    assert!(h.registry.get(victim.id).await.unwrap().is_some());
}

#[tokio::test]
async fn workers_cannot_be_kicked() {
    let h = harness().await;

    let kicker_client = Client::new();
    let kicker = admit(
        &h,
        &kicker_client,
        NodeType::Agent,
        Permissions::all(),
        Some("admin"),
    )
    .await;
    let mixer_client = Client::new();
    let mixer = admit(
        &h,
        &mixer_client,
        NodeType::AudioMixer,
        Permissions::all(),
        None,
    )
    .await;

    send_sourced(
        &h,
        &kicker_client,
        &kicker,
        proto::PacketType::NodeKickRequest,
        &proto::encode_node_id(&mixer.id),
    )
    .await;

    tokio::time::sleep(std::time::Duration::from_millis(150)).await;
    assert!(h.registry.get(mixer.id).await.unwrap().is_some());
}

#[tokio::test]
async fn username_from_id_reports_verification() {
    let h = harness().await;
    let client = Client::new();
    let node = admit(
        &h,
        &client,
        NodeType::Agent,
        Permissions::CONNECT,
        Some("alice"),
    )
    .await;

    send_sourced(
        &h,
        &client,
        &node,
        proto::PacketType::UsernameFromIDRequest,
        &proto::encode_node_id(&node.id),
    )
    .await;

    let reply = proto::UsernameFromIdReply::decode(
        client.recv().await.payload,
    )
    .unwrap();
    assert_eq!(node.id, reply.node_id);
    assert_eq!("alice", reply.username);
    assert!(reply.verified);
}

#[tokio::test]
async fn settings_reply_strips_the_security_tree() {
    let h = harness().await;
    h.settings
        .set_override("descriptors.world_name", json!("sandbox"));
    h.settings
        .set_override("security.http_password", json!("hash"));

    let client = Client::new();
    let node = admit(
        &h,
        &client,
        NodeType::EntityServer,
        Permissions::all(),
        None,
    )
    .await;

    send_sourced(
        &h,
        &client,
        &node,
        proto::PacketType::DomainSettingsRequest,
        b"",
    )
    .await;

    let frame = client.recv().await;
    assert_eq!(proto::PacketType::DomainSettings, frame.header.packet_type);
    let settings: serde_json::Value =
        serde_json::from_slice(&frame.payload).unwrap();
    assert_eq!(json!("sandbox"), settings["descriptors"]["world_name"]);
    assert!(settings.get("security").is_none());
}

#[tokio::test]
async fn ice_ping_answered_with_domain_id() {
    let h = harness().await;
    let client = Client::new();

    client
        .dg
        .send(
            h.server.local_addr().unwrap(),
            proto::encode_unsourced(
                proto::PacketType::ICEPing,
                0,
                &proto::IcePing {
                    sender_id: NodeId::generate(),
                    target: proto::PingTarget::Local,
                }
                .encode(),
            ),
        )
        .await
        .unwrap();

    let frame = client.recv().await;
    assert_eq!(proto::PacketType::ICEPingReply, frame.header.packet_type);
    let reply = proto::IcePing::decode(frame.payload).unwrap();
    assert_eq!(h.identity.id().0, reply.sender_id.0);
    assert_eq!(proto::PingTarget::Local, reply.target);
}
