//! Proxy mediator binary: HTTP front-end plus the startup sequence that
//! connects upstream to the mediator and downstream to the agent.

#[macro_use]
extern crate log;

use std::sync::Arc;

use anyhow::Context;
use axum::{
    body::Bytes,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::post,
    Router,
};
use proxy_mediator::{
    admin::{self, AppState},
    connections::Connections,
    protocols::{
        coordinate_mediation::KeylistUpdateAction, BasicMessage, CoordinateMediation, Routing,
    },
    transport::HttpTransport,
};
use tower_http::catch_panic::CatchPanicLayer;

struct Config {
    port: u16,
    endpoint: String,
    mediator_invite: String,
}

impl Config {
    fn from_env() -> anyhow::Result<Self> {
        let port = std::env::var("PORT")
            .context("PORT is required")?
            .parse()
            .context("PORT must be a port number")?;
        let endpoint = std::env::var("ENDPOINT").context("ENDPOINT is required")?;
        let mediator_invite =
            std::env::var("MEDIATOR_INVITE").context("MEDIATOR_INVITE is required")?;
        Ok(Self {
            port,
            endpoint,
            mediator_invite,
        })
    }
}

/// Inbound DIDComm endpoint. A captured reply becomes the response body;
/// everything else, including handler failures, is 202 Accepted so a peer
/// learns nothing from the error shape.
async fn handle_didcomm(State(state): State<AppState>, body: Bytes) -> Response {
    match state.connections.handle_message(&body).await {
        Ok(Some(reply)) => (StatusCode::OK, reply).into_response(),
        Ok(None) => StatusCode::ACCEPTED.into_response(),
        Err(err) => {
            error!("failed to handle message: {err:?}");
            StatusCode::ACCEPTED.into_response()
        }
    }
}

/// Connect to the mediator, request mediation, then publish an invitation
/// for the agent and wait for it to connect.
async fn bootstrap(
    mediator_invite: String,
    connections: Arc<Connections>,
    coordinate_mediation: Arc<CoordinateMediation>,
) -> anyhow::Result<()> {
    info!("connecting to mediator");
    let mediator = connections
        .receive_mediator_invite(&mediator_invite)
        .await?;
    let mediator = mediator.completion().await;
    connections.set_mediator_connection(Arc::clone(&mediator));
    info!("mediator connection established");

    let grant = coordinate_mediation
        .request_mediation_from_external(&mediator)
        .await?;
    info!("mediation granted; routing through {}", grant.endpoint);
    coordinate_mediation
        .send_keylist_update(&mediator, KeylistUpdateAction::Add, mediator.verkey_b58())
        .await?;

    let (agent_invite, invitation_url) = connections.create_invitation(false)?;
    connections.set_agent_invitation(invitation_url.clone());
    println!("Invitation URL: {invitation_url}");

    let agent = agent_invite.completion().await;
    connections.set_agent_connection(agent);
    println!("Agent connection completed successfully");
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    env_logger::init();

    let config = Config::from_env()?;
    println!("Starting proxy with endpoint: {}", config.endpoint);

    let connections = Connections::new(config.endpoint.clone(), Arc::new(HttpTransport::new()));
    let coordinate_mediation = CoordinateMediation::new();
    connections.route_module(&coordinate_mediation);
    connections.route_module(&Routing::new(&connections));
    connections.route_module(&BasicMessage::new());

    let state = AppState {
        connections: Arc::clone(&connections),
        coordinate_mediation: Arc::clone(&coordinate_mediation),
    };
    let app = Router::new()
        .route("/", post(handle_didcomm))
        .merge(admin::routes())
        .layer(CatchPanicLayer::new())
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.port))
        .await
        .context("binding server port")?;
    info!("listening on port {}", config.port);

    tokio::spawn(async move {
        if let Err(err) = bootstrap(config.mediator_invite, connections, coordinate_mediation).await
        {
            error!("startup sequence failed: {err:?}");
        }
    });

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
            println!("Closing server...");
        })
        .await
        .context("serving")?;
    Ok(())
}
