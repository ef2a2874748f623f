mod common;

use common::*;
use torii_api::protocol as proto;
use torii_api::*;

/// Two agents with overlapping interest sets join the same domain:
/// each must be able to find the other, and both ends of the pair must
/// hold the same session secret.
#[tokio::test]
async fn two_agents_meet() {
    let stack = stack().await;

    let a = Client::new();
    let req_a = agent_connect_request(&a);
    send_connect(&stack, &a, &req_a).await;
    let list_a = proto::DomainList::decode(
        a.recv(proto::PacketType::DomainList).await.payload,
    )
    .unwrap();
    assert!(list_a.peers.is_empty());

    let b = Client::new();
    let req_b = agent_connect_request(&b);
    send_connect(&stack, &b, &req_b).await;
    let list_b = proto::DomainList::decode(
        b.recv(proto::PacketType::DomainList).await.payload,
    )
    .unwrap();

    // B's snapshot carries A with their pairwise secret
    assert_eq!(1, list_b.peers.len());
    assert_eq!(list_a.your_id, list_b.peers[0].id);
    let secret_for_b = list_b.peers[0].secret;

    // A hears about B through the fan-out, with the same secret
    let added = proto::PeerEntry::decode(
        a.recv(proto::PacketType::DomainServerAddedNode)
            .await
            .payload,
    )
    .unwrap();
    assert_eq!(list_b.your_id, added.id);
    assert_eq!(secret_for_b, added.secret);
}

/// Removing the anonymous connect permission kills the anonymous
/// agent, and a surviving peer interested in agents hears the removal.
#[tokio::test]
async fn permission_revocation_kills_and_fans_out() {
    let stack = stack().await;

    // an anonymous agent
    let anon = Client::new();
    let req_anon = agent_connect_request(&anon);
    send_connect(&stack, &anon, &req_anon).await;
    let list_anon = proto::DomainList::decode(
        anon.recv(proto::PacketType::DomainList).await.payload,
    )
    .unwrap();

    // a verified agent whose username carries its own connect grant
    use ed25519_dalek::Signer;
    use rand::RngCore;
    let mut seed = [0_u8; 32];
    rand::thread_rng().fill_bytes(&mut seed);
    let key = ed25519_dalek::SigningKey::from_bytes(&seed);
    stack.metaverse.user_keys.lock().unwrap().insert(
        "bob".into(),
        bytes::Bytes::copy_from_slice(key.verifying_key().as_bytes()),
    );
    stack
        .settings
        .recurse_and_overwrite(serde_json::json!({
            "security": {
                "permissions": {
                    "bob": Permissions::CONNECT.bits(),
                }
            }
        }))
        .unwrap();

    let bob = Client::new();
    let mut req_bob = agent_connect_request(&bob);
    req_bob.username = "bob".into();
    req_bob.username_signature =
        bytes::Bytes::copy_from_slice(&key.sign(b"bob").to_bytes());
    send_connect(&stack, &bob, &req_bob).await;
    let list_bob = proto::DomainList::decode(
        bob.recv(proto::PacketType::DomainList).await.payload,
    )
    .unwrap();
    assert_eq!(1, list_bob.peers.len());

    // drop anonymous connect: only the anonymous agent loses it
    stack
        .settings
        .recurse_and_overwrite(serde_json::json!({
            "security": { "standard_permissions": { "anonymous": 0 }}
        }))
        .unwrap();

    // bob has Agent in his interest set and hears about the removal
    let removed = proto::decode_node_id(
        bob.recv(proto::PacketType::DomainServerRemovedNode)
            .await
            .payload,
    )
    .unwrap();
    assert_eq!(list_anon.your_id, removed);

    assert!(stack
        .registry
        .get(list_anon.your_id)
        .await
        .unwrap()
        .is_none());
    assert!(stack
        .registry
        .get(list_bob.your_id)
        .await
        .unwrap()
        .is_some());
}
