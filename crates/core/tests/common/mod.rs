//! Shared wiring for the control-plane scenario tests: a full stack of
//! registry, dispatch, gatekeeper, fan-out, and assignment queue over
//! the in-memory datagram transport.
#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use torii_api::protocol as proto;
use torii_api::*;
use torii_core::factories::MemDatagrams;
use torii_core::gatekeeper::Gatekeeper;
use torii_core::*;

#[derive(Debug, Default)]
pub struct StubMetaverse {
    pub user_keys: Mutex<HashMap<String, bytes::Bytes>>,
}

impl MetaverseClient for StubMetaverse {
    fn domain_heartbeat(
        &self,
        _domain_id: DomainId,
        _body: serde_json::Value,
    ) -> BoxFut<'_, Result<(), MetaverseError>> {
        Box::pin(async move { Ok(()) })
    }

    fn update_ice_address(
        &self,
        _domain_id: DomainId,
        _address: String,
    ) -> BoxFut<'_, Result<(), MetaverseError>> {
        Box::pin(async move { Ok(()) })
    }

    fn request_temporary_name(
        &self,
    ) -> BoxFut<'_, Result<TemporaryDomain, MetaverseError>> {
        Box::pin(async move {
            Err(MetaverseError::Unreachable { msg: "stub".into() })
        })
    }

    fn upload_public_key(
        &self,
        _domain_id: DomainId,
        _public_key: bytes::Bytes,
    ) -> BoxFut<'_, Result<(), MetaverseError>> {
        Box::pin(async move { Ok(()) })
    }

    fn user_public_key(
        &self,
        username: String,
    ) -> BoxFut<'_, Result<Option<bytes::Bytes>, MetaverseError>> {
        Box::pin(async move {
            Ok(self.user_keys.lock().unwrap().get(&username).cloned())
        })
    }

    fn user_groups(
        &self,
        _username: String,
    ) -> BoxFut<'_, Result<UserGroups, MetaverseError>> {
        Box::pin(async move { Ok(UserGroups::default()) })
    }

    fn proxy(
        &self,
        _method: String,
        _path: String,
        _body: Option<serde_json::Value>,
    ) -> BoxFut<'_, Result<(u16, bytes::Bytes), MetaverseError>> {
        Box::pin(async move { Ok((200, bytes::Bytes::new())) })
    }
}

/// A scripted peer endpoint collecting every frame it is sent.
pub struct Client {
    pub dg: Arc<MemDatagrams>,
    frames: Arc<Mutex<Vec<bytes::Bytes>>>,
}

struct Collect(Arc<Mutex<Vec<bytes::Bytes>>>);

impl FrameHandler for Collect {
    fn recv_frame(&self, _from: SocketAddr, data: bytes::Bytes) {
        self.0.lock().unwrap().push(data);
    }
}

impl Client {
    pub fn new() -> Self {
        Self::wrap(MemDatagrams::create())
    }

    pub fn at(addr: SocketAddr) -> Self {
        Self::wrap(MemDatagrams::create_at(addr))
    }

    fn wrap(dg: Arc<MemDatagrams>) -> Self {
        let frames = Arc::new(Mutex::new(Vec::new()));
        dg.register_handler(Arc::new(Collect(frames.clone())));
        Self { dg, frames }
    }

    pub fn addr(&self) -> SocketAddr {
        self.dg.local_addr().unwrap()
    }

    /// Wait for the next frame of the wanted type, discarding others.
    pub async fn recv(&self, want: proto::PacketType) -> proto::Frame {
        for _ in 0..150 {
            loop {
                let data = {
                    let mut frames = self.frames.lock().unwrap();
                    if frames.is_empty() {
                        break;
                    }
                    frames.remove(0)
                };
                let frame = proto::decode_frame(data).unwrap();
                if frame.header.packet_type == want {
                    return frame;
                }
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        panic!("no {want:?} frame arrived");
    }
}

/// The wired control plane under test.
pub struct Stack {
    pub settings: SettingsStore,
    pub registry: DynNodeRegistry,
    pub server: Arc<MemDatagrams>,
    pub queue: Arc<AssignmentQueue>,
    pub gatekeeper: Arc<Gatekeeper>,
    pub metaverse: Arc<StubMetaverse>,
}

pub async fn stack() -> Stack {
    let mut builder = default_builder();
    builder.set_default_config().unwrap();
    let settings = builder.settings.clone();
    let builder = builder.build();

    let registry =
        builder.registry.create(builder.clone()).await.unwrap();
    let server = MemDatagrams::create();
    let dispatch =
        PacketDispatch::create(registry.clone(), server.clone());
    let queue = AssignmentQueue::new(settings.clone(), None);
    let metaverse = Arc::new(StubMetaverse::default());
    let identity = Arc::new(DomainIdentity::new(
        DomainId::generate(),
        "scenario-domain",
    ));

    let gatekeeper = Gatekeeper::create(
        settings.clone(),
        registry.clone(),
        server.clone(),
        dispatch.clone(),
        metaverse.clone(),
        identity,
        queue.clone(),
    );
    gatekeeper.clone().register();
    gatekeeper.clone().watch_settings();

    queue
        .clone()
        .register(&dispatch, server.clone(), &registry)
        .unwrap();

    MembershipFanout::register(
        registry.clone(),
        server.clone(),
        dispatch,
    )
    .unwrap();

    settings
        .recurse_and_overwrite(serde_json::json!({
            "security": {
                "standard_permissions": {
                    "anonymous": Permissions::CONNECT.bits(),
                }
            }
        }))
        .unwrap();

    Stack {
        settings,
        registry,
        server,
        queue,
        gatekeeper,
        metaverse,
    }
}

pub fn agent_connect_request(client: &Client) -> proto::ConnectRequest {
    proto::ConnectRequest {
        claimed_id: NodeId::generate(),
        node_type: NodeType::Agent,
        assignment_id: None,
        sockets: SocketPair {
            public: client.addr(),
            local: "192.168.44.2:40102".parse().unwrap(),
        },
        interest_set: vec![NodeType::AvatarMixer, NodeType::Agent],
        place_name: "scenario".into(),
        version: "1.0".into(),
        username: String::new(),
        username_signature: bytes::Bytes::new(),
    }
}

pub async fn send_connect(
    stack: &Stack,
    client: &Client,
    req: &proto::ConnectRequest,
) {
    client
        .dg
        .send(
            stack.server.local_addr().unwrap(),
            proto::encode_unsourced(
                proto::PacketType::DomainConnectRequest,
                0,
                &req.encode(),
            ),
        )
        .await
        .unwrap();
}
