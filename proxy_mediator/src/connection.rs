//! Pairwise connections.
//!
//! A [`Connection`] owns one side of a pairwise relationship: the local
//! keypair, the peer's transport target once known, the lifecycle state,
//! and a one-shot completion signal that any number of tasks may await.
//! Completion is fulfilled at most once over a connection's lifetime; when
//! an invitation connection is superseded by a relationship connection the
//! signal is transferred, so tasks awaiting the invitation observe the
//! relationship connection instead.

use std::sync::{Arc, Mutex};

use ed25519_dalek::{SigningKey, VerifyingKey};
use tokio::sync::watch;
use uuid::Uuid;

use crate::{
    crypto,
    dispatch::Dispatcher,
    error::AgentError,
    message::{Message, MessageMeta},
    state::{ConnectionEvent, ConnectionState, StateError},
    transport::MessageTransport,
};

/// Whether an outbound message asks the peer to reply over the same
/// transport connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReturnRoute {
    None,
    All,
}

/// Remote endpoint descriptor: where to deliver and for whom to encrypt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub endpoint: String,
    pub recipients: Vec<String>,
}

impl Target {
    pub fn new(their_verkey: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            recipients: vec![their_verkey.into()],
        }
    }

    pub fn with_recipients(endpoint: impl Into<String>, recipients: Vec<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            recipients,
        }
    }

    pub fn update(&mut self, recipients: Vec<String>, endpoint: impl Into<String>) {
        self.recipients = recipients;
        self.endpoint = endpoint.into();
    }
}

/// One-shot, multi-awaiter completion signal, shared between a connection
/// and everything awaiting it so it can be reseated on replacement.
struct CompletionHandle {
    tx: watch::Sender<Option<Arc<Connection>>>,
}

impl CompletionHandle {
    fn new() -> Self {
        Self {
            tx: watch::Sender::new(None),
        }
    }

    /// Returns false when the signal was already fulfilled; the original
    /// resolution is never overwritten.
    fn fulfill(&self, connection: Arc<Connection>) -> bool {
        if self.tx.borrow().is_some() {
            return false;
        }
        self.tx.send_replace(Some(connection));
        true
    }

    fn is_fulfilled(&self) -> bool {
        self.tx.borrow().is_some()
    }

    async fn wait(&self) -> Arc<Connection> {
        let mut rx = self.tx.subscribe();
        let resolved = rx
            .wait_for(Option::is_some)
            .await
            .expect("completion sender alive while waiting");
        resolved
            .as_ref()
            .map(Arc::clone)
            .expect("completion slot set")
    }
}

pub struct Connection {
    id: Uuid,
    did: String,
    verkey: VerifyingKey,
    verkey_b58: String,
    sigkey: SigningKey,
    multiuse: bool,
    state: Mutex<ConnectionState>,
    target: Mutex<Option<Target>>,
    completion: Mutex<Arc<CompletionHandle>>,
    reply_sink: Mutex<Option<Vec<Vec<u8>>>>,
    dispatcher: Arc<Dispatcher>,
    transport: Arc<dyn MessageTransport>,
}

impl Connection {
    /// Create a connection with a fresh keypair.
    pub fn random(
        target: Option<Target>,
        dispatcher: Arc<Dispatcher>,
        transport: Arc<dyn MessageTransport>,
        multiuse: bool,
    ) -> Arc<Self> {
        let (verkey, sigkey) = crypto::create_keypair();
        Arc::new(Self {
            id: Uuid::new_v4(),
            did: crypto::did_from_verkey(&verkey),
            verkey_b58: crypto::b58_encode(verkey.as_bytes()),
            verkey,
            sigkey,
            multiuse,
            state: Mutex::new(ConnectionState::Null),
            target: Mutex::new(target),
            completion: Mutex::new(Arc::new(CompletionHandle::new())),
            reply_sink: Mutex::new(None),
            dispatcher,
            transport,
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn did(&self) -> &str {
        &self.did
    }

    pub fn verkey(&self) -> &VerifyingKey {
        &self.verkey
    }

    pub fn verkey_b58(&self) -> &str {
        &self.verkey_b58
    }

    pub(crate) fn sigkey(&self) -> &SigningKey {
        &self.sigkey
    }

    pub fn multiuse(&self) -> bool {
        self.multiuse
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock().expect("unpoisoned mutex")
    }

    pub fn target(&self) -> Option<Target> {
        self.target.lock().expect("unpoisoned mutex").clone()
    }

    pub fn update_target(&self, recipients: Vec<String>, endpoint: impl Into<String>) {
        let mut target = self.target.lock().expect("unpoisoned mutex");
        match target.as_mut() {
            Some(target) => target.update(recipients, endpoint),
            None => *target = Some(Target::with_recipients(endpoint, recipients)),
        }
    }

    /// Drive the lifecycle state machine. The state is left untouched when
    /// the transition is illegal.
    pub fn transition(&self, event: ConnectionEvent) -> Result<(), StateError> {
        let mut state = self.state.lock().expect("unpoisoned mutex");
        let next = state.transition(event)?;
        trace!(
            "connection {}: {:?} -> {:?} on {:?}",
            self.verkey_b58,
            *state,
            next,
            event
        );
        *state = next;
        Ok(())
    }

    /// Fulfil the completion signal with this connection.
    ///
    /// Fulfilling twice is a programming error; the second call leaves the
    /// original resolution in place and errors so callers surface it.
    pub fn complete(self: &Arc<Self>) -> Result<(), AgentError> {
        let handle = Arc::clone(&self.completion.lock().expect("unpoisoned mutex"));
        if handle.fulfill(Arc::clone(self)) {
            Ok(())
        } else {
            error!(
                "completion signal for connection {} fulfilled more than once",
                self.verkey_b58
            );
            Err(AgentError::AlreadyCompleted)
        }
    }

    pub fn is_completed(&self) -> bool {
        self.completion
            .lock()
            .expect("unpoisoned mutex")
            .is_fulfilled()
    }

    /// Await completion. For invitation connections the resolved value is
    /// the relationship connection that superseded the invitation.
    pub async fn completion(&self) -> Arc<Connection> {
        let handle = Arc::clone(&self.completion.lock().expect("unpoisoned mutex"));
        handle.wait().await
    }

    /// Adopt the state and completion signal of the invitation connection
    /// this connection supersedes. Both are moved, not copied: tasks
    /// awaiting the invitation observe exactly one fulfilment, and the
    /// invitation reverts to its advertised state with a fresh signal so a
    /// multi-use invitation can serve the next request.
    pub fn from_invite(&self, invite: &Connection) {
        {
            let mut invite_state = invite.state.lock().expect("unpoisoned mutex");
            *self.state.lock().expect("unpoisoned mutex") = *invite_state;
            *invite_state = ConnectionState::InviteSent;
        }
        let mut invite_completion = invite.completion.lock().expect("unpoisoned mutex");
        *self.completion.lock().expect("unpoisoned mutex") = Arc::clone(&invite_completion);
        *invite_completion = Arc::new(CompletionHandle::new());
    }

    /// Pack and send a message to this connection's target. Inside a
    /// response-capturing session the packed message lands in the session
    /// sink instead of going out over the transport; a body returned by
    /// the transport is processed as an inbound message on this
    /// connection.
    pub async fn send_async(
        self: &Arc<Self>,
        mut message: Message,
        return_route: ReturnRoute,
    ) -> Result<(), AgentError> {
        if return_route == ReturnRoute::All {
            message.set_return_route_all();
        }

        let target = self.target().ok_or(AgentError::NoTarget)?;
        let mut to_keys = Vec::with_capacity(target.recipients.len());
        for recipient in &target.recipients {
            to_keys.push(crypto::verkey_from_b58(recipient)?);
        }
        let packed = crypto::pack_message(
            &message.to_bytes()?,
            &to_keys,
            Some((&self.verkey, &self.sigkey)),
        )?;

        if self.capture_reply(&packed) {
            debug!(
                "captured {} for same-connection reply",
                message.msg_type()
            );
            return Ok(());
        }

        debug!("sending {} to `{}`", message.msg_type(), target.endpoint);
        if let Some(returned) = self
            .transport
            .send_message(&target.endpoint, packed)
            .await?
        {
            debug!("transport returned a message; processing inbound");
            self.handle_inbound(&returned).await?;
        }
        Ok(())
    }

    /// Send pre-packed bytes unchanged. Used when relaying an envelope
    /// packed for somebody else, so any returned body is dropped.
    pub async fn send_raw(&self, packed: Vec<u8>) -> Result<(), AgentError> {
        let target = self.target().ok_or(AgentError::NoTarget)?;
        if self.capture_reply(&packed) {
            debug!("captured raw message for same-connection reply");
            return Ok(());
        }
        if self
            .transport
            .send_message(&target.endpoint, packed)
            .await?
            .is_some()
        {
            debug!("ignoring message returned in response to a raw send");
        }
        Ok(())
    }

    fn capture_reply(&self, packed: &[u8]) -> bool {
        let mut sink = self.reply_sink.lock().expect("unpoisoned mutex");
        match sink.as_mut() {
            Some(sink) => {
                sink.push(packed.to_vec());
                true
            }
            None => false,
        }
    }

    /// Unpack an inbound envelope with this connection's keys and dispatch
    /// it.
    pub(crate) async fn handle_inbound(
        self: &Arc<Self>,
        packed: &[u8],
    ) -> Result<(), AgentError> {
        let (payload, sender, recipient) =
            crypto::unpack_message(packed, &self.verkey, &self.sigkey)?;
        let mut message = Message::from_bytes(&payload)?;
        message.meta = MessageMeta {
            recipient: Some(recipient),
            sender,
        };
        debug!(
            "handling {} on connection {}",
            message.msg_type(),
            self.verkey_b58
        );
        let dispatcher = Arc::clone(&self.dispatcher);
        dispatcher.dispatch(message, Arc::clone(self)).await
    }

    /// Open a response-capturing session on this connection. Messages sent
    /// through the connection while the session is open are collected
    /// instead of transmitted; the sink is released when the session is
    /// dropped.
    pub fn session(self: &Arc<Self>) -> Session {
        *self.reply_sink.lock().expect("unpoisoned mutex") = Some(Vec::new());
        Session {
            connection: Arc::clone(self),
        }
    }
}

pub struct Session {
    connection: Arc<Connection>,
}

impl Session {
    pub async fn handle(&self, packed: &[u8]) -> Result<(), AgentError> {
        self.connection.handle_inbound(packed).await
    }

    /// Drain the replies captured so far.
    pub fn take_replies(&self) -> Vec<Vec<u8>> {
        self.connection
            .reply_sink
            .lock()
            .expect("unpoisoned mutex")
            .as_mut()
            .map(std::mem::take)
            .unwrap_or_default()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        *self
            .connection
            .reply_sink
            .lock()
            .expect("unpoisoned mutex") = None;
    }
}
