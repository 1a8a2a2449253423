//! End-to-end connection establishment over an in-memory transport.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use proxy_mediator::{
    connection::ReturnRoute,
    connections::{ConnectionBlock, ConnectionResponse, Connections, Invitation},
    crypto,
    error::AgentError,
    message::{message_type, Message},
    state::ConnectionState,
    transport::{MessageTransport, TransportError},
};

fn test_init() {
    env_logger::builder().is_test(true).try_init().ok();
}

/// Routes packed messages between registries by endpoint, mirroring the
/// HTTP front-end: the handled reply (when any) travels back as the
/// transport's returned body.
#[derive(Default)]
struct Network {
    peers: Mutex<HashMap<String, Arc<Connections>>>,
}

impl Network {
    fn add_peer(&self, endpoint: &str, connections: &Arc<Connections>) {
        self.peers
            .lock()
            .expect("unpoisoned mutex")
            .insert(endpoint.to_owned(), Arc::clone(connections));
    }
}

struct NetworkTransport {
    network: Arc<Network>,
}

#[async_trait]
impl MessageTransport for NetworkTransport {
    async fn send_message(
        &self,
        endpoint: &str,
        packed: Vec<u8>,
    ) -> Result<Option<Vec<u8>>, TransportError> {
        let peer = self
            .network
            .peers
            .lock()
            .expect("unpoisoned mutex")
            .get(endpoint)
            .cloned();
        match peer {
            Some(peer) => Ok(peer.handle_message(&packed).await.ok().flatten()),
            None => Ok(None),
        }
    }
}

fn registry(network: &Arc<Network>, endpoint: &str) -> Arc<Connections> {
    let connections = Connections::new(
        endpoint,
        Arc::new(NetworkTransport {
            network: Arc::clone(network),
        }),
    );
    network.add_peer(endpoint, &connections);
    connections
}

#[tokio::test]
async fn pairwise_handshake_completes_both_sides() {
    test_init();
    let network = Arc::new(Network::default());
    let inviter = registry(&network, "http://inviter.example");
    let invitee = registry(&network, "http://invitee.example");

    let (invite_connection, url) = inviter.create_invitation(false).unwrap();
    let invitation_key = invite_connection.verkey_b58().to_owned();

    let invitee_connection = invitee.receive_invite_url(&url, None).await.unwrap();

    // Both completion signals resolve.
    let inviter_resolved = invite_connection.completion().await;
    let invitee_resolved = invitee_connection.completion().await;

    // The inviter's resolved connection is the relationship connection,
    // not the original invite connection.
    assert_ne!(inviter_resolved.id(), invite_connection.id());
    assert!(Arc::ptr_eq(&invitee_resolved, &invitee_connection));

    assert_eq!(inviter_resolved.state(), ConnectionState::Complete);
    assert_eq!(invitee_connection.state(), ConnectionState::Complete);

    // Completed connections have a usable target.
    assert!(!inviter_resolved.target().unwrap().recipients.is_empty());
    assert!(!invitee_connection.target().unwrap().recipients.is_empty());

    // The relationship verkey is indexed; the consumed invitation key is
    // not.
    assert!(inviter.has_connection_for(inviter_resolved.verkey_b58()));
    assert!(!inviter.has_connection_for(&invitation_key));
}

#[tokio::test]
async fn multiuse_invitation_serves_several_requesters() {
    test_init();
    let network = Arc::new(Network::default());
    let inviter = registry(&network, "http://inviter.example");
    let first = registry(&network, "http://first.example");
    let second = registry(&network, "http://second.example");

    let (invite_connection, url) = inviter.create_invitation(true).unwrap();
    let invitation_key = invite_connection.verkey_b58().to_owned();

    let first_connection = first.receive_invite_url(&url, None).await.unwrap();
    assert_eq!(first_connection.state(), ConnectionState::Complete);
    // The invitation key survives consumption.
    assert!(inviter.has_connection_for(&invitation_key));

    let second_connection = second.receive_invite_url(&url, None).await.unwrap();
    assert_eq!(second_connection.state(), ConnectionState::Complete);
    assert!(inviter.has_connection_for(&invitation_key));

    // Invite connection plus one relationship per requester.
    assert_eq!(inviter.connection_count(), 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_multiuse_requests_both_complete() {
    test_init();
    let network = Arc::new(Network::default());
    let inviter = registry(&network, "http://inviter.example");
    let first = registry(&network, "http://first.example");
    let second = registry(&network, "http://second.example");

    let (invite_connection, url) = inviter.create_invitation(true).unwrap();
    let invitation_key = invite_connection.verkey_b58().to_owned();

    // Both requesters race the same invitation from separate worker
    // threads; consuming it must serialize so each request finds the
    // invite back in its advertised state.
    let first_task = tokio::spawn({
        let first = Arc::clone(&first);
        let url = url.clone();
        async move { first.receive_invite_url(&url, None).await }
    });
    let second_task = tokio::spawn({
        let second = Arc::clone(&second);
        let url = url.clone();
        async move { second.receive_invite_url(&url, None).await }
    });

    let first_connection = first_task.await.unwrap().unwrap();
    let second_connection = second_task.await.unwrap().unwrap();

    assert_eq!(first_connection.state(), ConnectionState::Complete);
    assert_eq!(second_connection.state(), ConnectionState::Complete);
    assert!(inviter.has_connection_for(&invitation_key));
    assert_eq!(inviter.connection_count(), 3);
}

#[tokio::test]
async fn unknown_recipient_changes_nothing() {
    test_init();
    let network = Arc::new(Network::default());
    let connections = registry(&network, "http://proxy.example");
    let _ = connections.create_invitation(false).unwrap();
    let before = connections.connection_count();

    let (stranger_vk, _) = crypto::create_keypair();
    let packed = crypto::pack_message(b"{}", &[stranger_vk], None).unwrap();

    let err = connections.handle_message(&packed).await.unwrap_err();
    assert!(matches!(err, AgentError::ConnectionNotFound(_)));
    assert_eq!(connections.connection_count(), before);
}

#[tokio::test]
async fn failed_signature_leaves_completion_unfulfilled() {
    test_init();
    let network = Arc::new(Network::default());
    let requester = registry(&network, "http://requester.example");

    // Hand-rolled invitation: there is no inviter on the network, so the
    // request disappears into the void and the connection stays pending.
    let (invitation_vk, _) = crypto::create_keypair();
    let invitation_key = crypto::b58_encode(invitation_vk.as_bytes());
    let pending = requester
        .receive_invite(
            &Invitation {
                label: "imposter".to_owned(),
                recipient_keys: vec![invitation_key.clone()],
                service_endpoint: "http://nowhere.example".to_owned(),
                routing_keys: vec![],
            },
            None,
        )
        .await
        .unwrap();
    assert!(requester.has_connection_for(&invitation_key));

    // A response claiming the invitation key as signer but signed by a
    // different key.
    let (_, wrong_sigkey) = crypto::create_keypair();
    let block = ConnectionBlock::new("did:sov:imposter", "key", "http://nowhere.example");
    let response = Message::build(
        message_type("connections", "1.0", "response"),
        &ConnectionResponse {
            thread: None,
            connection_sig: crypto::sign_message_field(&block, &invitation_key, &wrong_sigkey)
                .unwrap(),
        },
    )
    .unwrap();
    let packed =
        crypto::pack_message(&response.to_bytes().unwrap(), &[*pending.verkey()], None).unwrap();

    let err = requester.handle_message(&packed).await.unwrap_err();
    assert!(matches!(err, AgentError::SignatureVerification));

    // The pending connection was popped before verification and its
    // completion signal never fires.
    assert!(!requester.has_connection_for(&invitation_key));
    assert!(!pending.is_completed());
}

#[tokio::test]
async fn trust_pings_after_completion_are_idempotent() {
    test_init();
    let network = Arc::new(Network::default());
    let inviter = registry(&network, "http://inviter.example");
    let invitee = registry(&network, "http://invitee.example");

    let (invite_connection, url) = inviter.create_invitation(false).unwrap();
    let invitee_connection = invitee.receive_invite_url(&url, None).await.unwrap();
    let inviter_connection = invite_connection.completion().await;

    for _ in 0..2 {
        let ping = Message::new(message_type("trust_ping", "1.0", "ping"));
        invitee_connection
            .send_async(ping, ReturnRoute::All)
            .await
            .unwrap();
        assert_eq!(invitee_connection.state(), ConnectionState::Complete);
        assert_eq!(inviter_connection.state(), ConnectionState::Complete);
    }
}

#[tokio::test]
async fn mediator_invite_sets_slot_and_requests_with_empty_endpoint() {
    test_init();
    let network = Arc::new(Network::default());
    let mediator = registry(&network, "http://mediator.example");
    let proxy = registry(&network, "http://proxy.example");

    let (_, url) = mediator.create_invitation(false).unwrap();
    let connection = proxy.receive_mediator_invite(&url).await.unwrap();

    // Tasks waiting on the mediator slot observe the pending connection.
    let slot = proxy.mediator_invite_received().await;
    assert!(Arc::ptr_eq(&slot, &connection));
    assert!(Arc::ptr_eq(
        &proxy.mediator_connection().unwrap(),
        &connection
    ));

    // The request advertised no endpoint, so the peer's answer rides the
    // return route; until it arrives the connection is pending.
    assert_eq!(connection.state(), ConnectionState::RequestSent);
    // The peer consumed the invitation and minted its relationship side.
    assert_eq!(mediator.connection_count(), 2);
}
