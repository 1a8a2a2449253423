//! Admin HTTP surface: connection status and invitation retrieval.

use std::sync::Arc;

use axum::{extract::State, routing::get, Json, Router};
use serde::Serialize;

use crate::{
    connections::Connections, protocols::coordinate_mediation::CoordinateMediation,
    state::ConnectionState,
};

#[derive(Clone)]
pub struct AppState {
    pub connections: Arc<Connections>,
    pub coordinate_mediation: Arc<CoordinateMediation>,
}

#[derive(Debug, Serialize)]
struct Status {
    mediator_connected: bool,
    agent_connected: bool,
    mediation_endpoint: Option<String>,
}

#[derive(Debug, Serialize)]
struct AgentInvitation {
    invitation_url: Option<String>,
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/status", get(status))
        .route("/retrieve_agent_invitation", get(retrieve_agent_invitation))
}

async fn status(State(state): State<AppState>) -> Json<Status> {
    let completed =
        |connection: &crate::connection::Connection| connection.state() == ConnectionState::Complete;
    Json(Status {
        mediator_connected: state
            .connections
            .mediator_connection()
            .is_some_and(|connection| completed(&connection)),
        agent_connected: state
            .connections
            .agent_connection()
            .is_some_and(|connection| completed(&connection)),
        mediation_endpoint: state
            .coordinate_mediation
            .mediation_grant()
            .map(|grant| grant.endpoint),
    })
}

async fn retrieve_agent_invitation(State(state): State<AppState>) -> Json<AgentInvitation> {
    Json(AgentInvitation {
        invitation_url: state.connections.agent_invitation(),
    })
}
