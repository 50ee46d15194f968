//! HTTP surface of the broker.
//!
//! `/command` turns a query word into a command and dispatches it to one
//! connected agent, `/subscribe` upgrades an agent connection and hands it to
//! the connection loop, `/health` answers liveness probes.

use std::{future::Future, net::SocketAddr};

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing, Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use tokio::{net::TcpListener, sync::mpsc};

use crate::{
    connection::serve_connection,
    dispatcher::Dispatcher,
    error::RegistryError,
    protocol::{CommandDefinition, ResultEnvelope},
};

const WORD_PLACEHOLDER: &str = "{word}";

/// How `/command` builds the command it dispatches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandTemplate {
    pub endpoint: String,
    pub timeout: String,
}

impl CommandTemplate {
    pub fn new(endpoint: impl Into<String>, timeout: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            timeout: timeout.into(),
        }
    }

    pub fn definition_for(&self, word: &str) -> CommandDefinition {
        let endpoint = self
            .endpoint
            .replace(WORD_PLACEHOLDER, &urlencoding::encode(word));
        CommandDefinition::get(endpoint, self.timeout.clone())
            .with_header("Accept", "application/json")
    }
}

#[derive(Debug, Clone)]
pub struct BrokerState {
    dispatcher: Dispatcher,
    commands: CommandTemplate,
    results_tx: mpsc::Sender<ResultEnvelope>,
}

impl BrokerState {
    pub fn new(
        dispatcher: Dispatcher,
        commands: CommandTemplate,
        results_tx: mpsc::Sender<ResultEnvelope>,
    ) -> Self {
        Self {
            dispatcher,
            commands,
            results_tx,
        }
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }
}

#[derive(Debug, Deserialize, Default)]
struct SubscribeQuery {
    agent_id: Option<String>,
    host: Option<String>,
}

pub fn broker_router(state: BrokerState) -> Router {
    Router::new()
        .route("/command", routing::get(publish_command))
        .route("/subscribe", routing::get(subscribe))
        .route("/health", routing::get(health))
        .with_state(state)
}

/// Serves the broker on `listener` until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, state: BrokerState, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    axum::serve(
        listener,
        broker_router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
}

async fn health() -> &'static str {
    "OK"
}

async fn publish_command(
    State(state): State<BrokerState>,
    Query(params): Query<Vec<(String, String)>>,
) -> Response {
    // Repeated `word` parameters resolve to the first one.
    let word = params
        .iter()
        .find(|(key, _)| key == "word")
        .map(|(_, value)| value.as_str())
        .unwrap_or_default();
    if word.is_empty() {
        return unprocessable("missing required query parameter: word");
    }

    let definition = state.commands.definition_for(word);
    match state.dispatcher.dispatch(definition).await {
        Ok(outcome) => {
            tracing::info!(
                target = "agent_dispatch::broker",
                word = %word,
                identity = %outcome.identity,
                request_id = %outcome.result.request_id,
                status_code = outcome.result.status_code,
                err = %outcome.result.err,
                "command completed"
            );
            let results_tx = state.results_tx.clone();
            let forwarded = outcome.result.clone();
            tokio::spawn(async move {
                if results_tx.send(forwarded).await.is_err() {
                    tracing::warn!(
                        target = "agent_dispatch::broker",
                        "result pump is gone, result not stored"
                    );
                }
            });
            (StatusCode::OK, Json(outcome.result)).into_response()
        }
        Err(error) => {
            tracing::warn!(
                target = "agent_dispatch::broker",
                word = %word,
                error = %error,
                "dispatch failed"
            );
            unprocessable(&error.to_string())
        }
    }
}

fn unprocessable(message: &str) -> Response {
    (
        StatusCode::UNPROCESSABLE_ENTITY,
        Json(json!({ "error": message })),
    )
        .into_response()
}

async fn subscribe(
    ws: WebSocketUpgrade,
    State(state): State<BrokerState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Query(query): Query<SubscribeQuery>,
) -> impl IntoResponse {
    let identity = connection_identity(query.agent_id.as_deref(), addr);
    let host = query.host.unwrap_or_default();
    ws.on_upgrade(move |socket| accept_agent(socket, identity, host, state))
}

fn connection_identity(agent_id: Option<&str>, addr: SocketAddr) -> String {
    match agent_id.map(str::trim).filter(|id| !id.is_empty()) {
        Some(id) => format!("{id}@{addr}"),
        None => addr.to_string(),
    }
}

async fn accept_agent(mut socket: WebSocket, identity: String, host: String, state: BrokerState) {
    let registry = state.dispatcher.registry().clone();
    let inbound = match registry.register(identity.clone()) {
        Ok(inbound) => inbound,
        Err(RegistryError::AlreadyRegistered(identity)) => {
            tracing::warn!(
                target = "agent_dispatch::broker",
                identity = %identity,
                "identity already connected, rejecting"
            );
            let _ = socket.send(Message::Close(None)).await;
            return;
        }
    };

    tracing::info!(
        target = "agent_dispatch::broker",
        identity = %identity,
        host = %host,
        connected = registry.len(),
        "agent subscribed"
    );
    serve_connection(socket, identity, inbound, registry).await;
}
