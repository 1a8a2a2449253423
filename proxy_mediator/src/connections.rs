//! Connection registry and the connections/trust-ping protocol handlers.
//!
//! The registry owns a keyed index over every pairwise connection. The
//! index is an alias map over an arena: one connection is reachable under
//! its own verkey and, while an invitation is outstanding, under the
//! invitation key as well. The connections-protocol handlers mutate the
//! index mid-handshake — consuming an invitation pops its alias and mints
//! a relationship connection that adopts the invitation's state and
//! completion signal.

use std::{
    collections::HashMap,
    future::Future,
    sync::{Arc, Mutex},
};

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use url::Url;
use uuid::Uuid;

use crate::{
    connection::{Connection, ReturnRoute, Target},
    crypto::{self, CryptoError, SignedField},
    dispatch::{Dispatcher, Handler, HandlerFuture, ProtocolModule},
    envelope,
    error::AgentError,
    message::{message_type, Message},
    state::ConnectionEvent,
    transport::MessageTransport,
};

/// Label advertised in invitations and requests.
pub const LABEL: &str = "proxy-mediator";

fn connections_type(name: &str) -> String {
    message_type("connections", "1.0", name)
}

fn trust_ping_type(name: &str) -> String {
    message_type("trust_ping", "1.0", name)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Invitation {
    pub label: String,
    #[serde(rename = "recipientKeys")]
    pub recipient_keys: Vec<String>,
    #[serde(rename = "serviceEndpoint")]
    pub service_endpoint: String,
    #[serde(rename = "routingKeys", default)]
    pub routing_keys: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionRequest {
    #[serde(default)]
    pub label: String,
    pub connection: ConnectionBlock,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionResponse {
    #[serde(rename = "~thread", skip_serializing_if = "Option::is_none")]
    pub thread: Option<Thread>,
    #[serde(rename = "connection~sig")]
    pub connection_sig: SignedField,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Thread {
    pub thid: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sender_order: Option<u32>,
}

/// The DID-Document-bearing payload exchanged in requests and responses.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConnectionBlock {
    #[serde(rename = "DID")]
    pub did: String,
    #[serde(rename = "DIDDoc")]
    pub did_doc: DidDoc,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DidDoc {
    #[serde(rename = "@context")]
    pub context: String,
    pub id: String,
    #[serde(rename = "publicKey")]
    pub public_key: Vec<PublicKeyEntry>,
    pub service: Vec<ServiceEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PublicKeyEntry {
    pub id: String,
    #[serde(rename = "type")]
    pub key_type: String,
    pub controller: String,
    #[serde(rename = "publicKeyBase58")]
    pub public_key_base58: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServiceEntry {
    pub id: String,
    #[serde(rename = "type")]
    pub service_type: String,
    #[serde(rename = "recipientKeys")]
    pub recipient_keys: Vec<String>,
    #[serde(rename = "routingKeys")]
    pub routing_keys: Vec<String>,
    #[serde(rename = "serviceEndpoint")]
    pub service_endpoint: String,
}

impl ConnectionBlock {
    /// The one-publicKey, one-service document form for a local connection.
    pub fn new(did: &str, verkey_b58: &str, endpoint: &str) -> Self {
        Self {
            did: did.to_owned(),
            did_doc: DidDoc {
                context: "https://w3id.org/did/v1".to_owned(),
                id: did.to_owned(),
                public_key: vec![PublicKeyEntry {
                    id: format!("{did}#keys-1"),
                    key_type: "Ed25519VerificationKey2018".to_owned(),
                    controller: did.to_owned(),
                    public_key_base58: verkey_b58.to_owned(),
                }],
                service: vec![ServiceEntry {
                    id: format!("{did}#indy"),
                    service_type: "IndyAgent".to_owned(),
                    recipient_keys: vec![verkey_b58.to_owned()],
                    routing_keys: vec![],
                    service_endpoint: endpoint.to_owned(),
                }],
            },
        }
    }

    pub fn first_service(&self) -> Option<&ServiceEntry> {
        self.did_doc.service.first()
    }
}

/// Alias map over an arena of connections.
#[derive(Default)]
struct ConnectionStore {
    aliases: HashMap<String, Uuid>,
    connections: HashMap<Uuid, Arc<Connection>>,
}

impl ConnectionStore {
    /// Insert a connection, aliased under its own verkey.
    fn insert(&mut self, connection: &Arc<Connection>) {
        self.connections
            .insert(connection.id(), Arc::clone(connection));
        self.aliases
            .insert(connection.verkey_b58().to_owned(), connection.id());
    }

    fn add_alias(&mut self, key: impl Into<String>, connection: &Arc<Connection>) {
        self.connections
            .entry(connection.id())
            .or_insert_with(|| Arc::clone(connection));
        self.aliases.insert(key.into(), connection.id());
    }

    fn remove_alias(&mut self, key: &str) -> Option<Arc<Connection>> {
        let id = self.aliases.remove(key)?;
        self.connections.get(&id).cloned()
    }

    fn get(&self, key: &str) -> Option<Arc<Connection>> {
        self.aliases
            .get(key)
            .and_then(|id| self.connections.get(id))
            .cloned()
    }

    fn contains_key(&self, key: &str) -> bool {
        self.aliases.contains_key(key)
    }

    fn connections_for(&self, recipients: &[String]) -> Vec<Arc<Connection>> {
        let mut found: Vec<Arc<Connection>> = Vec::new();
        for recipient in recipients {
            if let Some(connection) = self.get(recipient) {
                if !found.iter().any(|c| c.id() == connection.id()) {
                    found.push(connection);
                }
            }
        }
        found
    }

    fn len(&self) -> usize {
        self.connections.len()
    }
}

/// Wrap an async registry method as a dispatcher handler.
fn registry_handler<F, Fut>(registry: &Arc<Connections>, f: F) -> Handler
where
    F: Fn(Arc<Connections>, Message, Arc<Connection>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), AgentError>> + Send + 'static,
{
    let registry = Arc::downgrade(registry);
    Arc::new(move |message, connection| -> HandlerFuture {
        let pending = registry
            .upgrade()
            .map(|registry| f(registry, message, connection));
        Box::pin(async move {
            match pending {
                Some(handling) => handling.await,
                None => Ok(()),
            }
        })
    })
}

pub struct Connections {
    endpoint: String,
    store: Mutex<ConnectionStore>,
    dispatcher: Arc<Dispatcher>,
    transport: Arc<dyn MessageTransport>,
    mediator_slot: watch::Sender<Option<Arc<Connection>>>,
    agent_connection: Mutex<Option<Arc<Connection>>>,
    agent_invitation: Mutex<Option<String>>,
}

impl Connections {
    pub fn new(endpoint: impl Into<String>, transport: Arc<dyn MessageTransport>) -> Arc<Self> {
        let this = Arc::new(Self {
            endpoint: endpoint.into(),
            store: Mutex::new(ConnectionStore::default()),
            dispatcher: Arc::new(Dispatcher::new()),
            transport,
            mediator_slot: watch::Sender::new(None),
            agent_connection: Mutex::new(None),
            agent_invitation: Mutex::new(None),
        });
        this.register_handlers();
        this
    }

    fn register_handlers(self: &Arc<Self>) {
        self.dispatcher.add_handler(
            connections_type("request"),
            registry_handler(self, Connections::handle_request),
        );
        self.dispatcher.add_handler(
            connections_type("response"),
            registry_handler(self, Connections::handle_response),
        );
        self.dispatcher.add_handler(
            trust_ping_type("ping"),
            registry_handler(self, Connections::handle_ping),
        );
        self.dispatcher.add_handler(
            trust_ping_type("ping_response"),
            registry_handler(self, Connections::handle_ping_response),
        );
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Register a protocol module's routes on the shared dispatcher.
    pub fn route_module(&self, module: &dyn ProtocolModule) {
        self.dispatcher.add_module(module);
    }

    /// Whether any connection is currently reachable under `key`.
    pub fn has_connection_for(&self, key: &str) -> bool {
        self.store.lock().expect("unpoisoned mutex").contains_key(key)
    }

    pub fn connection_count(&self) -> usize {
        self.store.lock().expect("unpoisoned mutex").len()
    }

    /// Handle an inbound packed message, returning the captured reply when
    /// a handler produced one over the same session.
    pub async fn handle_message(&self, packed: &[u8]) -> Result<Option<Vec<u8>>, AgentError> {
        let recipients = envelope::recipients_of(packed)?;
        let connections = {
            self.store
                .lock()
                .expect("unpoisoned mutex")
                .connections_for(&recipients)
        };
        if connections.is_empty() {
            return Err(AgentError::ConnectionNotFound(recipients));
        }

        let mut replies = Vec::new();
        for connection in connections {
            debug!(
                "handling message with connection using verkey: {}",
                connection.verkey_b58()
            );
            let session = connection.session();
            session.handle(packed).await?;
            replies.append(&mut session.take_replies());
        }
        Ok(replies.pop())
    }

    /// Create an invitation and return the pending connection along with
    /// the invitation URL. Await the connection's completion to observe
    /// the relationship connection the handshake produces.
    pub fn create_invitation(
        &self,
        multiuse: bool,
    ) -> Result<(Arc<Connection>, String), AgentError> {
        let connection = Connection::random(
            None,
            Arc::clone(&self.dispatcher),
            Arc::clone(&self.transport),
            multiuse,
        );
        self.store
            .lock()
            .expect("unpoisoned mutex")
            .insert(&connection);
        connection.transition(ConnectionEvent::SendInvite)?;

        let invitation = Message::build(
            connections_type("invitation"),
            &Invitation {
                label: LABEL.to_owned(),
                recipient_keys: vec![connection.verkey_b58().to_owned()],
                service_endpoint: self.endpoint.clone(),
                routing_keys: vec![],
            },
        )?;
        let invitation_url = format!(
            "{}?c_i={}",
            self.endpoint,
            crypto::b64_encode(invitation.to_bytes()?)
        );
        debug!("created invitation: {invitation_url}");
        Ok((connection, invitation_url))
    }

    /// Process an invitation from a URL.
    pub async fn receive_invite_url(
        self: &Arc<Self>,
        invite: &str,
        endpoint: Option<&str>,
    ) -> Result<Arc<Connection>, AgentError> {
        let url = Url::parse(invite)
            .map_err(|_| AgentError::MalformedInvitation("invitation is not a valid URL"))?;
        let encoded = url
            .query_pairs()
            .find_map(|(key, value)| (key == "c_i").then(|| value.into_owned()))
            .ok_or(AgentError::MalformedInvitation("missing c_i parameter"))?;
        let message = Message::from_bytes(&crypto::b64_decode(&encoded)?)?;
        let invitation: Invitation = message.decode()?;
        self.receive_invite(&invitation, endpoint).await
    }

    /// Process an invitation: mint a requester connection, index it under
    /// its own verkey and the invitation key, and send the connection
    /// request. `endpoint` overrides the advertised service endpoint; pass
    /// an empty string when no public endpoint exists yet.
    pub async fn receive_invite(
        self: &Arc<Self>,
        invite: &Invitation,
        endpoint: Option<&str>,
    ) -> Result<Arc<Connection>, AgentError> {
        let invitation_key = invite
            .recipient_keys
            .first()
            .cloned()
            .ok_or(AgentError::MalformedInvitation("no recipient keys"))?;
        debug!("received invitation with key {invitation_key}");

        let connection = Connection::random(
            Some(Target::new(&invitation_key, &invite.service_endpoint)),
            Arc::clone(&self.dispatcher),
            Arc::clone(&self.transport),
            false,
        );
        connection.transition(ConnectionEvent::ReceiveInvite)?;
        {
            let mut store = self.store.lock().expect("unpoisoned mutex");
            store.insert(&connection);
            store.add_alias(invitation_key, &connection);
        }

        let request = Message::build(
            connections_type("request"),
            &ConnectionRequest {
                label: LABEL.to_owned(),
                connection: ConnectionBlock::new(
                    connection.did(),
                    connection.verkey_b58(),
                    endpoint.unwrap_or(&self.endpoint),
                ),
            },
        )?;
        debug!("sending connection request {}", request.id());
        connection.transition(ConnectionEvent::SendRequest)?;
        connection.send_async(request, ReturnRoute::All).await?;
        Ok(connection)
    }

    /// Process a connection request addressed to an invitation key.
    async fn handle_request(
        self: Arc<Self>,
        message: Message,
        _connection: Arc<Connection>,
    ) -> Result<(), AgentError> {
        debug!("received connection request {}", message.id());
        let recipient = message
            .meta
            .recipient
            .clone()
            .ok_or(AgentError::MissingRecipient)?;
        let request: ConnectionRequest = message.decode()?;

        let service = request
            .connection
            .first_service()
            .ok_or(AgentError::MalformedConnectionBlock("no service entry"))?;

        // Consuming the invitation is one atomic step under the store
        // lock: pop the alias, drive the invite machine, and seat the
        // relationship connection. A concurrent request to the same
        // multi-use invitation must observe the invite already back in
        // its advertised state.
        let (invite_connection, connection) = {
            let mut store = self.store.lock().expect("unpoisoned mutex");
            let invite_connection = store
                .remove_alias(&recipient)
                .ok_or_else(|| AgentError::ConnectionNotFound(vec![recipient.clone()]))?;
            // A multi-use invitation stays reachable under its verkey for
            // further requests.
            if invite_connection.multiuse() {
                store.add_alias(
                    invite_connection.verkey_b58().to_owned(),
                    &invite_connection,
                );
            }
            invite_connection.transition(ConnectionEvent::ReceiveRequest)?;

            let connection = Connection::random(
                Some(Target::with_recipients(
                    &service.service_endpoint,
                    service.recipient_keys.clone(),
                )),
                Arc::clone(&self.dispatcher),
                Arc::clone(&self.transport),
                false,
            );
            store.insert(&connection);
            connection.from_invite(&invite_connection);
            (invite_connection, connection)
        };

        // The peer verifies the response against the invitation key, so
        // the block is signed with the invite connection's keys.
        let block = ConnectionBlock::new(connection.did(), connection.verkey_b58(), &self.endpoint);
        connection.transition(ConnectionEvent::SendResponse)?;
        let response = Message::build(
            connections_type("response"),
            &ConnectionResponse {
                thread: Some(Thread {
                    thid: message.id().to_owned(),
                    sender_order: Some(0),
                }),
                connection_sig: crypto::sign_message_field(
                    &block,
                    invite_connection.verkey_b58(),
                    invite_connection.sigkey(),
                )?,
            },
        )?;
        debug!("sending connection response {}", response.id());
        connection.send_async(response, ReturnRoute::None).await?;
        connection.complete()?;
        Ok(())
    }

    /// Process a connection response for a pending request.
    async fn handle_response(
        self: Arc<Self>,
        message: Message,
        _connection: Arc<Connection>,
    ) -> Result<(), AgentError> {
        debug!("received connection response {}", message.id());
        let response: ConnectionResponse = message.decode()?;
        let their_conn_key = response.connection_sig.signer.clone();

        let connection = self
            .store
            .lock()
            .expect("unpoisoned mutex")
            .remove_alias(&their_conn_key)
            .ok_or_else(|| AgentError::ConnectionNotFound(vec![their_conn_key.clone()]))?;
        connection.transition(ConnectionEvent::ReceiveResponse)?;

        let (_, block) =
            crypto::verify_signed_message_field(&response.connection_sig).map_err(|err| {
                match err {
                    CryptoError::Verification => AgentError::SignatureVerification,
                    other => AgentError::Crypto(other),
                }
            })?;
        let block: ConnectionBlock = serde_json::from_value(block)
            .map_err(|_| AgentError::MalformedConnectionBlock("signed payload"))?;
        let service = block
            .first_service()
            .ok_or(AgentError::MalformedConnectionBlock("no service entry"))?;

        connection.update_target(service.recipient_keys.clone(), &service.service_endpoint);
        connection.complete()?;

        let ping = Message::new(trust_ping_type("ping")).with_thread(message.id());
        debug!("sending trust ping {}", ping.id());
        connection.transition(ConnectionEvent::SendPing)?;
        connection.send_async(ping, ReturnRoute::All).await?;
        Ok(())
    }

    async fn handle_ping(
        self: Arc<Self>,
        message: Message,
        connection: Arc<Connection>,
    ) -> Result<(), AgentError> {
        debug!("received trust ping {}", message.id());
        connection.transition(ConnectionEvent::ReceivePing)?;

        let response = Message::new(trust_ping_type("ping_response")).with_thread(message.id());
        debug!("sending trust ping response {}", response.id());
        connection.transition(ConnectionEvent::SendPingResponse)?;
        connection.send_async(response, ReturnRoute::None).await?;
        Ok(())
    }

    async fn handle_ping_response(
        self: Arc<Self>,
        message: Message,
        connection: Arc<Connection>,
    ) -> Result<(), AgentError> {
        debug!("received trust ping response {}", message.id());
        connection.transition(ConnectionEvent::ReceivePingResponse)?;
        Ok(())
    }

    /// The connection to the upstream mediator, once an invite was
    /// received.
    pub fn mediator_connection(&self) -> Option<Arc<Connection>> {
        self.mediator_slot.borrow().clone()
    }

    pub fn set_mediator_connection(&self, connection: Arc<Connection>) {
        self.mediator_slot.send_replace(Some(connection));
    }

    /// Await the mediator invitation having been received.
    pub async fn mediator_invite_received(&self) -> Arc<Connection> {
        let mut rx = self.mediator_slot.subscribe();
        let slot = rx
            .wait_for(Option::is_some)
            .await
            .expect("mediator slot sender alive");
        slot.as_ref().map(Arc::clone).expect("mediator slot set")
    }

    /// Receive the upstream mediator's invitation. The request advertises
    /// an empty endpoint: at this point the proxy has no public address.
    pub async fn receive_mediator_invite(
        self: &Arc<Self>,
        invite: &str,
    ) -> Result<Arc<Connection>, AgentError> {
        let connection = self.receive_invite_url(invite, Some("")).await?;
        self.mediator_slot.send_replace(Some(Arc::clone(&connection)));
        Ok(connection)
    }

    pub fn agent_connection(&self) -> Option<Arc<Connection>> {
        self.agent_connection
            .lock()
            .expect("unpoisoned mutex")
            .clone()
    }

    pub fn set_agent_connection(&self, connection: Arc<Connection>) {
        *self.agent_connection.lock().expect("unpoisoned mutex") = Some(connection);
    }

    pub fn agent_invitation(&self) -> Option<String> {
        self.agent_invitation
            .lock()
            .expect("unpoisoned mutex")
            .clone()
    }

    pub fn set_agent_invitation(&self, invitation_url: String) {
        *self.agent_invitation.lock().expect("unpoisoned mutex") = Some(invitation_url);
    }
}
