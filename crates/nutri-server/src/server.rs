use std::convert::Infallible;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use futures::{Stream, StreamExt};
use nutri_core::{ChangeNotification, SessionId};
use nutri_notify::{groups, wire, Broadcaster, ConnectionState, Dispatcher, GroupManager, SessionRelay};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::auth::{self, Principal, PrincipalResolver, TokenQuery};
use crate::client;
use crate::config::ServerConfig;
use crate::error::ServerError;

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Dispatcher,
    pub broadcaster: Arc<Broadcaster>,
    pub groups: Arc<GroupManager>,
    pub resolver: Arc<dyn PrincipalResolver>,
    pub config: Arc<ServerConfig>,
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(config: ServerConfig, resolver: Arc<dyn PrincipalResolver>) -> Self {
        let broadcaster = Arc::new(Broadcaster::new());
        let groups = Arc::new(GroupManager::new(config.max_send_queue));
        Self {
            dispatcher: Dispatcher::new(Arc::clone(&broadcaster), Arc::clone(&groups)),
            broadcaster,
            groups,
            resolver,
            config: Arc::new(config),
            shutdown: CancellationToken::new(),
        }
    }
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/hub", get(ws_handler))
        .route("/events", get(events_handler))
        .route("/health", get(health_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Bind the listener and start serving. Returns a handle to reach the
/// dispatcher and shut the server down.
pub async fn start(
    config: ServerConfig,
    resolver: Arc<dyn PrincipalResolver>,
) -> Result<ServerHandle, ServerError> {
    let addr = config.bind_addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|source| ServerError::Bind {
            addr: addr.clone(),
            source,
        })?;
    let local_addr = listener.local_addr()?;

    let state = AppState::new(config, resolver);
    let cleanup = groups::start_cleanup_task(
        Arc::clone(&state.groups),
        state.config.cleanup_interval,
        state.config.client_timeout,
    );

    let router = build_router(state.clone());
    let token = state.shutdown.clone();
    let server = tokio::spawn(async move {
        let result = axum::serve(listener, router)
            .with_graceful_shutdown(async move { token.cancelled().await })
            .await;
        if let Err(error) = result {
            tracing::error!(%error, "server terminated");
        }
    });

    tracing::info!(port = local_addr.port(), "notification hub started");

    Ok(ServerHandle {
        port: local_addr.port(),
        state,
        server,
        cleanup,
    })
}

/// Handle returned by `start()`; keeps background tasks alive.
pub struct ServerHandle {
    pub port: u16,
    state: AppState,
    server: tokio::task::JoinHandle<()>,
    cleanup: tokio::task::JoinHandle<()>,
}

impl ServerHandle {
    /// Ingress for domain services.
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.state.dispatcher
    }

    pub fn broadcaster(&self) -> &Arc<Broadcaster> {
        &self.state.broadcaster
    }

    pub fn groups(&self) -> &Arc<GroupManager> {
        &self.state.groups
    }

    /// Close every connection and stream, drop all subscribers and wait for
    /// the listener to stop.
    pub async fn shutdown(self) {
        self.state.shutdown.cancel();
        self.state.broadcaster.shutdown();
        self.cleanup.abort();
        if tokio::time::timeout(Duration::from_secs(5), self.server)
            .await
            .is_err()
        {
            tracing::warn!("server did not stop within timeout");
        }
        tracing::info!("notification hub stopped");
    }
}

/// WebSocket upgrade handler. The caller must present a valid token.
async fn ws_handler(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    Query(query): Query<TokenQuery>,
    State(state): State<AppState>,
) -> Response {
    let principal = match auth::authenticate(state.resolver.as_ref(), &headers, &query).await {
        Ok(principal) => principal,
        Err(err) => {
            tracing::info!(error = %err, "rejected hub connection");
            return err.into_response();
        }
    };
    ws.on_upgrade(move |socket| handle_socket(socket, state, principal))
}

async fn handle_socket(socket: WebSocket, state: AppState, principal: Principal) {
    let (lease, rx) = state.groups.connect();
    let practitioner = principal.practitioner_id(&state.config.practitioner_claim);
    let connection_state = state.groups.authenticate(lease.id(), practitioner.as_ref());
    tracing::info!(
        connection_id = %lease.id(),
        subject = %principal.subject,
        grouped = matches!(connection_state, ConnectionState::Joined(_)),
        "client connected"
    );

    match wire::connection_established(lease.id(), connection_state.group()) {
        Ok(greeting) => {
            let _ = state.groups.send_to(lease.id(), greeting);
        }
        Err(err) => tracing::warn!(error = %err, "failed to encode greeting"),
    }

    client::handle_ws_connection(
        socket,
        lease,
        rx,
        state.config.heartbeat_interval,
        state.shutdown.child_token(),
    )
    .await;
}

/// Server-sent events bound to one session relay. Dropping the stream (the
/// client went away) stops the relay.
struct SessionEventStream {
    _relay: SessionRelay,
    rx: ReceiverStream<Arc<ChangeNotification>>,
}

impl Stream for SessionEventStream {
    type Item = Arc<ChangeNotification>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.rx).poll_next(cx)
    }
}

/// Per-session change stream for the caller's practitioner.
async fn events_handler(
    headers: HeaderMap,
    Query(query): Query<TokenQuery>,
    State(state): State<AppState>,
) -> Response {
    let principal = match auth::authenticate(state.resolver.as_ref(), &headers, &query).await {
        Ok(principal) => principal,
        Err(err) => return err.into_response(),
    };
    let practitioner = principal.practitioner_id(&state.config.practitioner_claim);

    let session_id = SessionId::new();
    let relay = SessionRelay::new(session_id.clone(), Arc::clone(&state.broadcaster));
    let (tx, rx) = mpsc::channel(state.config.session_queue);
    let relay_session = session_id.clone();
    relay.on_change(move |notification| {
        if practitioner.as_ref() != Some(notification.practitioner_id()) {
            return;
        }
        if tx.try_send(Arc::clone(notification)).is_err() {
            tracing::warn!(session_id = %relay_session, "session queue full, dropping change");
        }
    });
    let _ = relay.start();
    tracing::info!(session_id = %session_id, subject = %principal.subject, "session stream opened");

    let stream = SessionEventStream {
        _relay: relay,
        rx: ReceiverStream::new(rx),
    }
    .take_until(state.shutdown.clone().cancelled_owned())
    .map(|notification| {
        let event = Event::default()
            .event(wire::ENTITY_CHANGED)
            .json_data(&*notification)
            .unwrap_or_else(|_| Event::default().event(wire::ENTITY_CHANGED));
        Ok::<_, Infallible>(event)
    });

    Sse::new(stream)
        .keep_alive(KeepAlive::default())
        .into_response()
}

/// Health check HTTP endpoint.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    axum::Json(serde_json::json!({
        "status": "healthy",
        "connections": state.groups.connection_count(),
        "groups": state.groups.group_count(),
        "subscribers": state.broadcaster.subscriber_count(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::StaticTokenResolver;

    fn test_config() -> ServerConfig {
        ServerConfig {
            host: "127.0.0.1".into(),
            port: 0,
            ..Default::default()
        }
    }

    #[test]
    fn build_router_creates_routes() {
        let state = AppState::new(test_config(), Arc::new(StaticTokenResolver::new()));
        let _router = build_router(state);
    }

    #[test]
    fn app_state_wires_both_sinks() {
        let state = AppState::new(test_config(), Arc::new(StaticTokenResolver::new()));
        assert_eq!(state.dispatcher.sink_names(), vec!["remote", "local"]);
    }

    #[tokio::test]
    async fn server_starts_and_serves_health() {
        let handle = start(test_config(), Arc::new(StaticTokenResolver::new()))
            .await
            .unwrap();
        assert!(handle.port > 0);

        let url = format!("http://127.0.0.1:{}/health", handle.port);
        let resp = reqwest::get(&url).await.unwrap();
        assert_eq!(resp.status(), 200);

        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["connections"], 0);

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn bind_failure_reports_address() {
        let first = start(test_config(), Arc::new(StaticTokenResolver::new()))
            .await
            .unwrap();
        let config = ServerConfig {
            port: first.port,
            ..test_config()
        };
        let err = start(config, Arc::new(StaticTokenResolver::new()))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ServerError::Bind { .. }));
        first.shutdown().await;
    }
}
