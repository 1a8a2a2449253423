//! Coordinate-Mediation protocol against the upstream mediator.
//!
//! The proxy requests routing service once its mediator connection
//! completes, then keeps the mediator's recipient-key allow-list in sync
//! with keylist updates.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::{
    connection::{Connection, ReturnRoute},
    dispatch::{module_handler, Handler, ProtocolModule},
    error::AgentError,
    message::{message_type, Message},
};

fn coordinate_mediation_type(name: &str) -> String {
    message_type("coordinate-mediation", "1.0", name)
}

/// Routing service granted by the mediator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MediationGrant {
    pub endpoint: String,
    #[serde(default)]
    pub routing_keys: Vec<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum KeylistUpdateAction {
    Add,
    Remove,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeylistUpdate {
    pub updates: Vec<KeylistUpdateEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeylistUpdateEntry {
    pub recipient_key: String,
    pub action: KeylistUpdateAction,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeylistUpdateResponse {
    pub updated: Vec<KeylistUpdated>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeylistUpdated {
    pub recipient_key: String,
    pub action: KeylistUpdateAction,
    pub result: KeylistUpdateResult,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum KeylistUpdateResult {
    ClientError,
    ServerError,
    NoChange,
    Success,
}

pub struct CoordinateMediation {
    grant: watch::Sender<Option<MediationGrant>>,
}

impl CoordinateMediation {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            grant: watch::Sender::new(None),
        })
    }

    /// The grant received from the mediator, when mediation was granted.
    pub fn mediation_grant(&self) -> Option<MediationGrant> {
        self.grant.borrow().clone()
    }

    /// Await mediation having been granted.
    pub async fn granted(&self) -> MediationGrant {
        let mut rx = self.grant.subscribe();
        let grant = rx
            .wait_for(Option::is_some)
            .await
            .expect("grant sender alive");
        grant.as_ref().cloned().expect("grant slot set")
    }

    /// Request mediation over an established mediator connection and await
    /// the grant.
    pub async fn request_mediation_from_external(
        &self,
        connection: &Arc<Connection>,
    ) -> Result<MediationGrant, AgentError> {
        info!(
            "requesting mediation from connection {}",
            connection.verkey_b58()
        );
        let request = Message::new(coordinate_mediation_type("mediate-request"));
        connection.send_async(request, ReturnRoute::All).await?;
        Ok(self.granted().await)
    }

    /// Ask the mediator to add or remove a recipient key from its routing
    /// allow-list.
    pub async fn send_keylist_update(
        &self,
        connection: &Arc<Connection>,
        action: KeylistUpdateAction,
        recipient_key: &str,
    ) -> Result<(), AgentError> {
        debug!("sending keylist update: {action:?} {recipient_key}");
        let update = Message::build(
            coordinate_mediation_type("keylist-update"),
            &KeylistUpdate {
                updates: vec![KeylistUpdateEntry {
                    recipient_key: recipient_key.to_owned(),
                    action,
                }],
            },
        )?;
        connection.send_async(update, ReturnRoute::All).await
    }

    async fn handle_mediate_grant(
        self: Arc<Self>,
        message: Message,
        _connection: Arc<Connection>,
    ) -> Result<(), AgentError> {
        let grant: MediationGrant = message.decode()?;
        info!(
            "mediation granted with endpoint `{}` and {} routing keys",
            grant.endpoint,
            grant.routing_keys.len()
        );
        self.grant.send_replace(Some(grant));
        Ok(())
    }

    async fn handle_mediate_deny(
        self: Arc<Self>,
        message: Message,
        _connection: Arc<Connection>,
    ) -> Result<(), AgentError> {
        error!("mediation denied by mediator: {}", message.id());
        Ok(())
    }

    async fn handle_keylist_update_response(
        self: Arc<Self>,
        message: Message,
        _connection: Arc<Connection>,
    ) -> Result<(), AgentError> {
        let response: KeylistUpdateResponse = message.decode()?;
        for updated in response.updated {
            match updated.result {
                KeylistUpdateResult::Success | KeylistUpdateResult::NoChange => debug!(
                    "keylist update {:?} {} -> {:?}",
                    updated.action, updated.recipient_key, updated.result
                ),
                failure => error!(
                    "keylist update {:?} {} failed: {:?}",
                    updated.action, updated.recipient_key, failure
                ),
            }
        }
        Ok(())
    }

    async fn handle_keylist(
        self: Arc<Self>,
        message: Message,
        _connection: Arc<Connection>,
    ) -> Result<(), AgentError> {
        debug!("received keylist: {}", message.id());
        Ok(())
    }
}

impl ProtocolModule for Arc<CoordinateMediation> {
    fn routes(&self) -> Vec<(String, Handler)> {
        vec![
            (
                coordinate_mediation_type("mediate-grant"),
                module_handler(self, CoordinateMediation::handle_mediate_grant),
            ),
            (
                coordinate_mediation_type("mediate-deny"),
                module_handler(self, CoordinateMediation::handle_mediate_deny),
            ),
            (
                coordinate_mediation_type("keylist-update-response"),
                module_handler(self, CoordinateMediation::handle_keylist_update_response),
            ),
            (
                coordinate_mediation_type("keylist"),
                module_handler(self, CoordinateMediation::handle_keylist),
            ),
        ]
    }
}
