use super::*;

fn test_sockets() -> SocketPair {
    SocketPair {
        public: "203.0.113.7:40102".parse().unwrap(),
        local: "192.168.1.20:40102".parse().unwrap(),
    }
}

#[test]
fn unsourced_frame_roundtrip() {
    let payload = IcePing {
        sender_id: NodeId::generate(),
        target: PingTarget::Public,
    };
    let wire =
        encode_unsourced(PacketType::ICEPing, 7, &payload.encode());

    let frame = decode_frame(wire).unwrap();
    assert_eq!(PacketType::ICEPing, frame.header.packet_type);
    assert_eq!(7, frame.header.sequence);
    assert_eq!(None, frame.source_local_id);
    assert_eq!(None, frame.mac);
    assert_eq!(payload, IcePing::decode(frame.payload).unwrap());
}

#[test]
fn sourced_frame_carries_local_id_and_mac() {
    let secret = SessionSecret::generate();
    let wire = encode_sourced(
        PacketType::DomainListRequest,
        3,
        LocalId(42),
        b"",
        &secret,
    );

    let frame = decode_frame(wire).unwrap();
    assert_eq!(Some(LocalId(42)), frame.source_local_id);
    assert!(verify_mac(&frame, &secret));
    assert!(!verify_mac(&frame, &SessionSecret::generate()));
}

#[test]
fn tampered_sourced_frame_fails_mac() {
    let secret = SessionSecret::generate();
    let wire = encode_sourced(
        PacketType::NodeJsonStats,
        1,
        LocalId(9),
        b"{\"fps\":60}",
        &secret,
    );

    let mut tampered = wire.to_vec();
    // flip a payload byte, leave the trailer alone
    tampered[HEADER_LEN + 3] ^= 0xff;

    let frame = decode_frame(bytes::Bytes::from(tampered)).unwrap();
    assert!(!verify_mac(&frame, &secret));
}

#[test]
fn short_datagrams_rejected() {
    assert!(decode_frame(bytes::Bytes::from_static(b"\x01")).is_err());
    // sourced type with no room for local id + trailer
    assert!(decode_frame(bytes::Bytes::from_static(
        b"\x03\x01\x00\x00\x00\x00"
    ))
    .is_err());
    // unknown type byte
    assert!(decode_frame(bytes::Bytes::from_static(
        b"\xf0\x01\x00\x00\x00\x00"
    ))
    .is_err());
}

#[test]
fn connect_request_roundtrip() {
    let req = ConnectRequest {
        claimed_id: NodeId::generate(),
        node_type: NodeType::Agent,
        assignment_id: None,
        sockets: test_sockets(),
        interest_set: vec![NodeType::AvatarMixer, NodeType::Agent],
        place_name: "sandbox".into(),
        version: "1.4.2".into(),
        username: "alice".into(),
        username_signature: bytes::Bytes::from_static(b"sig-bytes"),
    };
    assert_eq!(req, ConnectRequest::decode(req.encode()).unwrap());

    let worker = ConnectRequest {
        assignment_id: Some(AssignmentId::generate()),
        username: String::new(),
        username_signature: bytes::Bytes::new(),
        ..req
    };
    assert_eq!(worker, ConnectRequest::decode(worker.encode()).unwrap());
}

#[test]
fn nil_assignment_id_means_user() {
    let req = ConnectRequest {
        claimed_id: NodeId::generate(),
        node_type: NodeType::Agent,
        assignment_id: None,
        sockets: test_sockets(),
        interest_set: vec![],
        place_name: String::new(),
        version: String::new(),
        username: String::new(),
        username_signature: bytes::Bytes::new(),
    };
    let dec = ConnectRequest::decode(req.encode()).unwrap();
    assert_eq!(None, dec.assignment_id);
}

#[test]
fn domain_list_roundtrip() {
    let list = DomainList {
        domain_id: DomainId::generate(),
        your_id: NodeId::generate(),
        your_local_id: LocalId(2),
        your_secret: SessionSecret::generate(),
        permissions: Permissions::CONNECT | Permissions::REZ,
        peers: vec![
            PeerEntry {
                id: NodeId::generate(),
                node_type: NodeType::AudioMixer,
                sockets: test_sockets(),
                local_id: LocalId(1),
                permissions: Permissions::all(),
                secret: SessionSecret::generate(),
            },
            PeerEntry {
                id: NodeId::generate(),
                node_type: NodeType::Agent,
                sockets: test_sockets(),
                local_id: LocalId(3),
                permissions: Permissions::CONNECT,
                secret: SessionSecret::generate(),
            },
        ],
    };
    assert_eq!(list, DomainList::decode(list.encode()).unwrap());
}

#[test]
fn denial_roundtrip() {
    let d = ConnectDenied {
        reason: DenialReason::TooManyUsers,
        message: "Domain is at user capacity".into(),
    };
    assert_eq!(d, ConnectDenied::decode(d.encode()).unwrap());
}

#[test]
fn all_types_assignment_request_is_zero_byte() {
    let r = RequestAssignment {
        node_type: None,
        pool: String::new(),
    };
    let enc = r.encode();
    assert_eq!(0, enc[0]);
    assert_eq!(r, RequestAssignment::decode(enc).unwrap());
}

#[test]
fn ice_heartbeat_signature_covers_plaintext_prefix() {
    let hb = IceHeartbeat {
        domain_id: DomainId::generate(),
        sockets: test_sockets(),
        signature: bytes::Bytes::from_static(b"detached"),
    };
    let enc = hb.encode();
    let plaintext = IceHeartbeat::plaintext(&hb.domain_id, &hb.sockets);
    assert_eq!(&enc[..plaintext.len()], &plaintext[..]);
    assert_eq!(hb, IceHeartbeat::decode(enc).unwrap());
}

#[test]
fn sock_addr_v6_roundtrip() {
    let addr: SocketAddr = "[2001:db8::1]:9000".parse().unwrap();
    let mut buf = bytes::BytesMut::new();
    put_sock_addr(&mut buf, &addr);
    assert_eq!(addr, get_sock_addr(&mut buf.freeze()).unwrap());
}

#[test]
fn rfc1918_classification() {
    let private: SocketAddr = "10.0.0.5:1".parse().unwrap();
    let private2: SocketAddr = "172.20.1.1:1".parse().unwrap();
    let public: SocketAddr = "203.0.113.7:1".parse().unwrap();
    let loopback: SocketAddr = "127.0.0.1:1".parse().unwrap();
    assert!(is_rfc1918(&private));
    assert!(is_rfc1918(&private2));
    assert!(!is_rfc1918(&public));
    assert!(!is_rfc1918(&loopback));
}

#[test]
fn sourced_classification() {
    assert!(!PacketType::DomainConnectRequest.is_sourced());
    assert!(!PacketType::ICEPing.is_sourced());
    assert!(!PacketType::RequestAssignment.is_sourced());
    assert!(PacketType::DomainListRequest.is_sourced());
    assert!(PacketType::DomainDisconnectRequest.is_sourced());
    assert!(PacketType::OctreeDataPersist.is_sourced());
}
