//! Routing protocol: unwrap forwarded envelopes and relay the inner
//! payload to the downstream agent.
//!
//! Forwards are only honored when both distinguished connections exist and
//! the forward arrived over the mediator connection; anything else is a
//! reportable protocol error.

use std::sync::{Arc, Weak};

use serde::{Deserialize, Serialize};

use crate::{
    connection::Connection,
    connections::Connections,
    dispatch::{module_handler, Handler, ProtocolModule},
    error::{AgentError, ReportableError},
    message::{message_type, Message},
};

fn routing_type(name: &str) -> String {
    message_type("routing", "1.0", name)
}

fn agent_connection_not_established() -> ReportableError {
    ReportableError::new(
        "agent-connection-not-established",
        "connection to the agent has not yet been established",
    )
}

fn mediator_connection_not_established() -> ReportableError {
    ReportableError::new(
        "mediator-connection-not-established",
        "connection to the mediator has not yet been established; \
         forward messages may only be received from the mediator connection",
    )
}

fn forward_from_unauthorized_connection() -> ReportableError {
    ReportableError::new(
        "forward-from-unauthorized-connection",
        "forward messages may only be received from the mediator connection",
    )
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Forward {
    pub to: String,
    pub msg: serde_json::Value,
}

pub struct Routing {
    connections: Weak<Connections>,
}

impl Routing {
    pub fn new(connections: &Arc<Connections>) -> Arc<Self> {
        Arc::new(Self {
            connections: Arc::downgrade(connections),
        })
    }

    async fn handle_forward(
        self: Arc<Self>,
        message: Message,
        connection: Arc<Connection>,
    ) -> Result<(), AgentError> {
        let forward: Forward = message.decode()?;
        let Some(registry) = self.connections.upgrade() else {
            return Ok(());
        };

        let agent = registry
            .agent_connection()
            .ok_or_else(agent_connection_not_established)?;
        let mediator = registry
            .mediator_connection()
            .ok_or_else(mediator_connection_not_established)?;
        if connection.id() != mediator.id() {
            return Err(forward_from_unauthorized_connection().into());
        }

        trace!("forwarding message for {}", forward.to);
        // The inner message is already packed for the agent; relay it
        // without re-wrapping.
        let inner = serde_json::to_vec(&forward.msg).map_err(crate::message::MessageError::Serialize)?;
        agent.send_raw(inner).await
    }
}

impl ProtocolModule for Arc<Routing> {
    fn routes(&self) -> Vec<(String, Handler)> {
        vec![(
            routing_type("forward"),
            module_handler(self, Routing::handle_forward),
        )]
    }
}
