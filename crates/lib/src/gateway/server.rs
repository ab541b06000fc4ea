//! Gateway HTTP + WebSocket server (single port).

use crate::bot::BotPath;
use crate::config::{self, Config};
use crate::conversation::ConversationKey;
use crate::credentials::CredentialResolver;
use crate::error::ConversationError;
use crate::gateway::protocol::{
    ConnectParams, ConversationParams, HelloOk, JoinParams, SendParams, TypingParams, WsRequest,
    WsResponse,
};
use crate::gateway::signature::{self, SIGNATURE_HEADER};
use crate::inbound::{InboundEvent, WebhookPayload};
use crate::init;
use crate::live_agent::{DeskEvent, LiveAgentDesk, LiveAgentTransport};
use crate::messaging::{BusinessMessagesClient, MessageSender};
use crate::nlu::{DialogflowClient, NluBackend};
use crate::routing::{self, Dispatcher};
use crate::store::ConversationStore;
use crate::survey::InactivitySurvey;
use anyhow::{Context, Result};
use async_trait::async_trait;
use axum::{
    body::Bytes,
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

const PROTOCOL_VERSION: u32 = 1;

const SHUTDOWN_EVENT_JSON: &str = r#"{"type":"event","event":"shutdown","payload":{}}"#;

/// Live-agent transport that broadcasts desk events to every connected WebSocket client.
pub struct BroadcastTransport {
    event_tx: broadcast::Sender<String>,
}

impl BroadcastTransport {
    pub fn new(event_tx: broadcast::Sender<String>) -> Self {
        Self { event_tx }
    }
}

#[async_trait]
impl LiveAgentTransport for BroadcastTransport {
    async fn forward(&self, event: DeskEvent) {
        let frame = json!({
            "type": "event",
            "event": "desk",
            "payload": event,
        });
        if let Ok(text) = serde_json::to_string(&frame) {
            if self.event_tx.send(text).is_err() {
                log::debug!("gateway: no live-agent client connected, desk event dropped");
            }
        }
    }
}

/// Shared state for the gateway handlers.
#[derive(Clone)]
pub struct GatewayState {
    pub config: Arc<Config>,
    /// When Some, live-agent REST and WebSocket connect must present this token.
    pub required_token: Option<String>,
    /// Secret for X-Goog-Signature. When None every signed webhook is rejected.
    pub verification_secret: Option<String>,
    /// Broadcasts events to connected live-agent clients (desk events, shutdown).
    pub event_tx: broadcast::Sender<String>,
    /// Accepted webhook events waiting to be routed.
    pub inbound_tx: mpsc::Sender<InboundEvent>,
    pub store: Arc<ConversationStore>,
    pub desk: Arc<LiveAgentDesk>,
}

/// When auth mode is token and a token is configured, returns it for request validation.
fn require_connect_token(config: &Config) -> Option<String> {
    if config.gateway.auth.mode == config::GatewayAuthMode::Token {
        config::resolve_gateway_token(config)
    } else {
        None
    }
}

/// Run the gateway server; binds to config.gateway.bind:config.gateway.port.
/// When bind is not loopback, a gateway token must be configured or startup fails.
/// Blocks until shutdown (e.g. Ctrl+C).
/// `config_path` is the path to the config file (used to resolve the store snapshot path).
pub async fn run_gateway(config: Config, config_path: PathBuf) -> Result<()> {
    init::require_initialized(&config_path)?;
    let bind = config.gateway.bind.trim().to_string();
    if !config::is_loopback_bind(&bind) {
        let token = config::resolve_gateway_token(&config);
        if token.is_none() || config.gateway.auth.mode != config::GatewayAuthMode::Token {
            anyhow::bail!(
                "refusing to bind gateway to {} without auth (set gateway.auth.mode to \"token\" and gateway.auth.token or HANDOFF_GATEWAY_TOKEN)",
                bind
            );
        }
    }
    let verification_secret = config::resolve_verification_secret(&config);
    if verification_secret.is_none() {
        log::warn!("no webhook verification secret configured; inbound messages will be rejected");
    }

    let store_path = config::resolve_store_path(&config, &config_path);
    let store = Arc::new(
        ConversationStore::load(&store_path)
            .await
            .with_context(|| format!("loading conversation store from {}", store_path.display()))?,
    );
    let credentials = Arc::new(CredentialResolver::new(
        config.nlu.credential_source,
        store.clone(),
        config.nlu.agents.clone(),
    ));
    let sender: Arc<dyn MessageSender> = Arc::new(BusinessMessagesClient::new(
        config.messaging.base_url.clone(),
        config::resolve_messaging_token(&config),
    ));
    let nlu: Arc<dyn NluBackend> = Arc::new(DialogflowClient::new(
        config.nlu.base_url.clone(),
        config.nlu.language_code.clone(),
    ));

    let (event_tx, _) = broadcast::channel(64);
    let transport: Arc<dyn LiveAgentTransport> = Arc::new(BroadcastTransport::new(event_tx.clone()));
    let desk = Arc::new(LiveAgentDesk::new(
        store.clone(),
        sender.clone(),
        transport.clone(),
    ));
    let bot = BotPath::new(
        store.clone(),
        credentials.clone(),
        sender.clone(),
        nlu,
        transport,
    );
    let dispatcher = Arc::new(Dispatcher::new(
        store.clone(),
        credentials.clone(),
        bot,
        desk.clone(),
    ));

    let (inbound_tx, mut inbound_rx) = mpsc::channel::<InboundEvent>(256);
    tokio::spawn(async move {
        while let Some(event) = inbound_rx.recv().await {
            let dispatcher = dispatcher.clone();
            tokio::spawn(async move {
                let key = event.key.clone();
                match dispatcher.route(event).await {
                    Ok(dispatch) => log::debug!("gateway: {} routed to {:?}", key, dispatch),
                    Err(e) => log::warn!("gateway: routing {} failed: {}", key, e),
                }
            });
        }
    });

    let survey = Arc::new(InactivitySurvey::new(
        store.clone(),
        credentials,
        sender,
        config.survey.default_threshold_minutes,
    ));
    let survey_task = survey.spawn(Duration::from_secs(config.survey.sweep_interval_secs.max(1)));
    let flush_task = store
        .clone()
        .spawn_flush(Duration::from_secs(config.store.flush_interval_secs.max(1)));

    let state = GatewayState {
        required_token: require_connect_token(&config),
        config: Arc::new(config.clone()),
        verification_secret,
        event_tx: event_tx.clone(),
        inbound_tx,
        store: store.clone(),
        desk,
    };

    let app = Router::new()
        .route("/", get(health_http))
        .route("/callback", post(callback))
        .route("/ws", get(ws_handler))
        .route(
            "/agents/:agent_id/conversations/:conversation_id",
            get(conversation_http),
        )
        .route(
            "/agents/:agent_id/conversations/:conversation_id/join",
            post(join_http),
        )
        .route(
            "/agents/:agent_id/conversations/:conversation_id/leave",
            post(leave_http),
        )
        .route(
            "/agents/:agent_id/conversations/:conversation_id/typing",
            post(typing_http),
        )
        .route(
            "/agents/:agent_id/conversations/:conversation_id/messages",
            post(send_http),
        )
        .with_state(state);

    let bind_addr = format!("{}:{}", bind, config.gateway.port);
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("binding to {}", bind_addr))?;
    log::info!("gateway listening on {}", bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(event_tx, vec![survey_task, flush_task], store))
        .await
        .context("gateway server exited")?;
    log::info!("gateway stopped");
    Ok(())
}

/// Future that completes when the process should shut down (SIGINT or SIGTERM).
/// Broadcasts a shutdown event to WebSocket clients, stops the background tasks (survey sweep,
/// snapshot flush) and writes a final snapshot.
async fn shutdown_signal(
    event_tx: broadcast::Sender<String>,
    tasks: Vec<JoinHandle<()>>,
    store: Arc<ConversationStore>,
) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::warn!("failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut s) => {
                s.recv().await;
            }
            Err(e) => {
                log::warn!("failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    log::info!("shutdown signal received, broadcasting shutdown and draining connections");

    let _ = event_tx.send(SHUTDOWN_EVENT_JSON.to_string());
    for task in tasks {
        task.abort();
    }
    if let Err(e) = store.save().await {
        log::warn!("final store snapshot failed: {}", e);
    }
}

/// Map a conversation error to an HTTP response.
fn error_response(e: ConversationError) -> Response {
    let status = StatusCode::from_u16(e.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(json!({ "error": e.to_string() }))).into_response()
}

/// Bearer check for live-agent endpoints when a token is required.
fn authorized(state: &GatewayState, headers: &HeaderMap) -> bool {
    let Some(ref required) = state.required_token else {
        return true;
    };
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map_or(false, |t| t.trim() == required)
}

/// POST /callback: webhook from the messaging platform.
///
/// Verification handshakes are answered with the secret. Everything else must carry a valid
/// signature; accepted events are queued and acknowledged before they are routed.
async fn callback(State(state): State<GatewayState>, headers: HeaderMap, body: Bytes) -> Response {
    let payload: WebhookPayload = match serde_json::from_slice(&body) {
        Ok(p) => p,
        Err(_) => return StatusCode::BAD_REQUEST.into_response(),
    };
    if payload.is_verification() {
        return verify_webhook(&state, payload);
    }

    let Some(ref secret) = state.verification_secret else {
        return StatusCode::FORBIDDEN.into_response();
    };
    let provided = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if !signature::verify(secret, &body, provided) {
        log::debug!("gateway: webhook signature mismatch");
        return StatusCode::FORBIDDEN.into_response();
    }

    let event = match payload.into_event() {
        Ok(Some(event)) => event,
        Ok(None) => return StatusCode::OK.into_response(),
        Err(e) => {
            log::debug!("gateway: rejecting webhook payload: {}", e);
            return error_response(e);
        }
    };
    if state.inbound_tx.send(event).await.is_err() {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }
    StatusCode::OK.into_response()
}

/// One-time webhook verification: echo the secret when the client token matches.
fn verify_webhook(state: &GatewayState, payload: WebhookPayload) -> Response {
    let expected = state
        .config
        .messaging
        .client_token
        .as_deref()
        .map(str::trim)
        .filter(|t| !t.is_empty());
    match (expected, payload.client_token.as_deref(), payload.secret) {
        (Some(expected), Some(provided), Some(secret)) if provided.trim() == expected => {
            log::info!("gateway: webhook verification accepted");
            (StatusCode::OK, secret).into_response()
        }
        _ => {
            log::warn!("gateway: webhook verification rejected");
            StatusCode::FORBIDDEN.into_response()
        }
    }
}

/// GET / returns a simple health JSON (for probes).
async fn health_http(State(state): State<GatewayState>) -> Json<serde_json::Value> {
    Json(json!({
        "runtime": "running",
        "protocol": PROTOCOL_VERSION,
        "port": state.config.gateway.port,
    }))
}

#[derive(Debug, Deserialize)]
struct JoinBody {
    #[serde(default)]
    name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TypingBody {
    is_typing: bool,
}

#[derive(Debug, Deserialize)]
struct SendBody {
    #[serde(default)]
    text: String,
}

/// GET /agents/:agent_id/conversations/:conversation_id returns the stored record.
async fn conversation_http(
    State(state): State<GatewayState>,
    headers: HeaderMap,
    Path((agent_id, conversation_id)): Path<(String, String)>,
) -> Response {
    if !authorized(&state, &headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    let key = ConversationKey::new(agent_id, conversation_id);
    match state.store.get(&key).await {
        Some(record) => Json(record).into_response(),
        None => error_response(ConversationError::ConversationNotFound(key.to_string())),
    }
}

async fn join_http(
    State(state): State<GatewayState>,
    headers: HeaderMap,
    Path((agent_id, conversation_id)): Path<(String, String)>,
    Json(body): Json<JoinBody>,
) -> Response {
    if !authorized(&state, &headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    let key = ConversationKey::new(agent_id, conversation_id);
    match state.desk.join(&key, &body.name).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => error_response(e),
    }
}

async fn leave_http(
    State(state): State<GatewayState>,
    headers: HeaderMap,
    Path((agent_id, conversation_id)): Path<(String, String)>,
) -> Response {
    if !authorized(&state, &headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    let key = ConversationKey::new(agent_id, conversation_id);
    match state.desk.leave(&key).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => error_response(e),
    }
}

async fn typing_http(
    State(state): State<GatewayState>,
    headers: HeaderMap,
    Path((agent_id, conversation_id)): Path<(String, String)>,
    Json(body): Json<TypingBody>,
) -> Response {
    if !authorized(&state, &headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    let key = ConversationKey::new(agent_id, conversation_id);
    match state.desk.typing(&key, body.is_typing).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => error_response(e),
    }
}

async fn send_http(
    State(state): State<GatewayState>,
    headers: HeaderMap,
    Path((agent_id, conversation_id)): Path<(String, String)>,
    Json(body): Json<SendBody>,
) -> Response {
    if !authorized(&state, &headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    let key = ConversationKey::new(agent_id, conversation_id);
    match state.desk.send(&key, &body.text, routing::now()).await {
        Ok(message) => Json(json!({ "messageId": message.message_id })).into_response(),
        Err(e) => error_response(e),
    }
}

/// GET /ws upgrades to WebSocket. First frame must be connect; we reply with hello-ok.
async fn ws_handler(State(state): State<GatewayState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn send_response(socket: &mut WebSocket, res: WsResponse) -> bool {
    let text = serde_json::to_string(&res).unwrap_or_default();
    socket.send(Message::Text(text)).await.is_ok()
}

/// Run one live-agent control method; the payload on success is method-specific.
async fn handle_method(
    state: &GatewayState,
    method: &str,
    params: serde_json::Value,
) -> Result<serde_json::Value, String> {
    fn parse<T: serde::de::DeserializeOwned>(params: serde_json::Value) -> Result<T, String> {
        serde_json::from_value(params).map_err(|e| format!("invalid params: {}", e))
    }
    match method {
        "join" => {
            let p: JoinParams = parse(params)?;
            state
                .desk
                .join(&p.conversation.key(), &p.name)
                .await
                .map_err(|e| e.to_string())?;
            Ok(json!({}))
        }
        "leave" => {
            let p: ConversationParams = parse(params)?;
            state.desk.leave(&p.key()).await.map_err(|e| e.to_string())?;
            Ok(json!({}))
        }
        "typing" => {
            let p: TypingParams = parse(params)?;
            state
                .desk
                .typing(&p.conversation.key(), p.is_typing)
                .await
                .map_err(|e| e.to_string())?;
            Ok(json!({}))
        }
        "send" => {
            let p: SendParams = parse(params)?;
            let message = state
                .desk
                .send(&p.conversation.key(), &p.text, routing::now())
                .await
                .map_err(|e| e.to_string())?;
            Ok(json!({ "messageId": message.message_id }))
        }
        "conversation" => {
            let p: ConversationParams = parse(params)?;
            let key = p.key();
            let record = state
                .store
                .get(&key)
                .await
                .ok_or_else(|| ConversationError::ConversationNotFound(key.to_string()).to_string())?;
            serde_json::to_value(record).map_err(|e| e.to_string())
        }
        other => Err(format!("unknown method: {}", other)),
    }
}

async fn handle_socket(mut socket: WebSocket, state: GatewayState) {
    let mut connected = false;
    let mut event_rx = state.event_tx.subscribe();

    loop {
        tokio::select! {
            biased;

            event = event_rx.recv(), if connected => {
                match event {
                    Ok(text) => {
                        let is_shutdown = text == SHUTDOWN_EVENT_JSON;
                        let _ = socket.send(Message::Text(text)).await;
                        if is_shutdown {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        log::debug!("ws client lagged {} broadcast messages", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            msg = socket.recv() => {
                let Some(Ok(msg)) = msg else { break };
                let Message::Text(text) = msg else { continue };
                let Ok(req) = serde_json::from_str::<WsRequest>(&text) else { continue };
                if req.typ != "req" {
                    continue;
                }

                if req.method == "connect" {
                    let params: ConnectParams = serde_json::from_value(req.params.clone()).unwrap_or_default();
                    if let Some(ref required) = state.required_token {
                        let provided = params.auth.token.as_deref().unwrap_or("").trim();
                        if provided != required {
                            let _ = send_response(&mut socket, WsResponse::err(&req.id, "unauthorized: gateway token missing or mismatched")).await;
                            continue;
                        }
                    }
                    let hello = HelloOk {
                        typ: "hello-ok".to_string(),
                        protocol: params.max_protocol.unwrap_or(PROTOCOL_VERSION).min(PROTOCOL_VERSION),
                    };
                    let payload = serde_json::to_value(hello).unwrap_or_default();
                    if !send_response(&mut socket, WsResponse::ok(&req.id, payload)).await {
                        break;
                    }
                    log::debug!(
                        "ws client connected: {}",
                        params.client.id.as_deref().unwrap_or("unknown")
                    );
                    connected = true;
                    continue;
                }

                if !connected {
                    let _ = send_response(&mut socket, WsResponse::err(&req.id, "first request must be connect")).await;
                    continue;
                }

                let res = match handle_method(&state, &req.method, req.params).await {
                    Ok(payload) => WsResponse::ok(&req.id, payload),
                    Err(e) => WsResponse::err(&req.id, e),
                };
                if !send_response(&mut socket, res).await {
                    break;
                }
            }
        }
    }

    if !connected {
        log::debug!("ws client disconnected before sending connect");
    }
}
