use crate::{
    auth::{self, TokenVerifier},
    config::Config,
    conversations::{self, NewConversation},
    db::Store,
    error::{ChatError, Result},
    fanout::{Fanout, RedisBus},
    gateway::Gateway,
    hub::Hub,
    messages, reads,
};
use anyhow::Context;
use axum::{
    extract::{
        rejection::{JsonRejection, QueryRejection},
        ws::WebSocketUpgrade,
        Extension, Path, Query, State,
    },
    http::{Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, put},
    Json, Router,
};
use chat_protocol::{ConversationId, ConversationView, Message, MessageId, Page, ReadState, UserId};
use serde::Deserialize;
use std::{net::SocketAddr, sync::Arc};

/// Authenticated caller, inserted by the auth middleware.
#[derive(Clone, Debug)]
pub struct AuthUser(pub UserId);

#[derive(Clone)]
pub struct AppState {
    pub store: Store,
    pub gateway: Arc<Gateway>,
    pub verifier: Arc<TokenVerifier>,
}

impl AppState {
    /// Open storage and, when configured, connect the Redis room bus.
    pub async fn new(config: &Config) -> anyhow::Result<Self> {
        let store = Store::open(&config.database_path)
            .with_context(|| format!("opening database {}", config.database_path.display()))?;
        let hub = Arc::new(Hub::new());
        let fanout = match &config.scale_out {
            Some(settings) => {
                let bus = Arc::new(
                    RedisBus::connect(settings)
                        .await
                        .context("connecting to redis")?,
                );
                let fanout = Arc::new(Fanout::with_bus(hub, bus.clone()));
                bus.spawn_subscriber(fanout.clone());
                tracing::info!(channel = %settings.channel, node = %fanout.node_id(), "scale-out enabled");
                fanout
            }
            None => {
                tracing::warn!(
                    "no redis_url configured; realtime delivery is limited to this process, \
                     run a single instance"
                );
                Arc::new(Fanout::local(hub))
            }
        };
        let gateway = Arc::new(Gateway::new(store.clone(), fanout, config.typing_debounce));
        Ok(Self {
            store,
            gateway,
            verifier: Arc::new(TokenVerifier::new(config.jwt_secret.as_bytes())),
        })
    }
}

/// Build the HTTP application router.
pub fn build_router(state: AppState) -> Router {
    let protected = Router::new()
        .route(
            "/api/conversations",
            get(list_conversations).post(create_conversation),
        )
        .route("/api/conversations/:id", get(get_conversation))
        .route("/api/conversations/:id/messages", get(list_messages))
        .route("/api/conversations/:id/read", put(update_read).get(list_reads))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ));
    Router::new()
        .route("/api/health", get(health))
        .route("/ws", get(ws_handler))
        .merge(protected)
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}

async fn auth_middleware<B>(
    State(state): State<AppState>,
    mut req: Request<B>,
    next: Next<B>,
) -> Result<Response> {
    let token = auth::bearer_token(req.headers()).ok_or(ChatError::Unauthorized)?;
    let user = state.verifier.verify(token)?;
    req.extensions_mut().insert(AuthUser(user));
    Ok(next.run(req).await)
}

/// Malformed ids cannot name an existing conversation.
fn conversation_id(raw: &str) -> Result<ConversationId> {
    ConversationId::parse(raw).map_err(|_| ChatError::NotFound("conversation"))
}

fn json_body<T>(body: std::result::Result<Json<T>, JsonRejection>) -> Result<T> {
    body.map(|Json(v)| v)
        .map_err(|e| ChatError::invalid(e.body_text()))
}

fn query<T>(q: std::result::Result<Query<T>, QueryRejection>) -> Result<T> {
    q.map(|Query(v)| v)
        .map_err(|e| ChatError::invalid(e.body_text()))
}

async fn create_conversation(
    State(state): State<AppState>,
    Extension(AuthUser(user)): Extension<AuthUser>,
    body: std::result::Result<Json<NewConversation>, JsonRejection>,
) -> Result<(StatusCode, Json<ConversationView>)> {
    let new = json_body(body)?;
    let (view, created) = state
        .store
        .run(move |conn| {
            let (conversation, created) = conversations::create_conversation(conn, &user, new)?;
            Ok((conversations::enrich(conn, &user, conversation), created))
        })
        .await?;
    if created {
        tracing::info!(id = %view.conversation.id, kind = view.conversation.kind.as_str(), "conversation created");
    }
    let status = if created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(view)))
}

#[derive(Deserialize)]
struct InboxQuery {
    cursor: Option<i64>,
    limit: Option<i64>,
}

async fn list_conversations(
    State(state): State<AppState>,
    Extension(AuthUser(user)): Extension<AuthUser>,
    q: std::result::Result<Query<InboxQuery>, QueryRejection>,
) -> Result<Json<Page<ConversationView>>> {
    let InboxQuery { cursor, limit } = query(q)?;
    let page = state
        .store
        .run(move |conn| conversations::list_inbox(conn, &user, cursor, limit))
        .await?;
    Ok(Json(page))
}

async fn get_conversation(
    State(state): State<AppState>,
    Extension(AuthUser(user)): Extension<AuthUser>,
    Path(id): Path<String>,
) -> Result<Json<ConversationView>> {
    let id = conversation_id(&id)?;
    let view = state
        .store
        .run(move |conn| conversations::get_conversation(conn, &user, &id))
        .await?;
    Ok(Json(view))
}

#[derive(Deserialize)]
struct HistoryQuery {
    #[serde(alias = "cursor")]
    before: Option<i64>,
    limit: Option<i64>,
}

async fn list_messages(
    State(state): State<AppState>,
    Extension(AuthUser(user)): Extension<AuthUser>,
    Path(id): Path<String>,
    q: std::result::Result<Query<HistoryQuery>, QueryRejection>,
) -> Result<Json<Page<Message>>> {
    let id = conversation_id(&id)?;
    let HistoryQuery { before, limit } = query(q)?;
    let page = state
        .store
        .run(move |conn| messages::list_messages(conn, &user, &id, before, limit))
        .await?;
    Ok(Json(page))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReadReq {
    last_read_message_id: MessageId,
}

async fn update_read(
    State(state): State<AppState>,
    Extension(AuthUser(user)): Extension<AuthUser>,
    Path(id): Path<String>,
    body: std::result::Result<Json<ReadReq>, JsonRejection>,
) -> Result<Json<ReadState>> {
    let id = conversation_id(&id)?;
    let ReadReq {
        last_read_message_id,
    } = json_body(body)?;
    let state = state
        .store
        .run(move |conn| reads::update_read(conn, &user, &id, &last_read_message_id))
        .await?;
    Ok(Json(state))
}

async fn list_reads(
    State(state): State<AppState>,
    Extension(AuthUser(user)): Extension<AuthUser>,
    Path(id): Path<String>,
) -> Result<Json<Vec<ReadState>>> {
    let id = conversation_id(&id)?;
    let states = state
        .store
        .run(move |conn| reads::list_read_states(conn, &user, &id))
        .await?;
    Ok(Json(states))
}

#[derive(Deserialize)]
struct WsQuery {
    token: Option<String>,
}

/// Authenticate the handshake before upgrading. Browsers cannot set headers
/// on a WebSocket request, so `?token=` is accepted as well.
async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(q): Query<WsQuery>,
    req_headers: axum::http::HeaderMap,
) -> Result<Response> {
    let token = auth::bearer_token(&req_headers)
        .map(str::to_owned)
        .or(q.token)
        .ok_or(ChatError::Unauthorized)?;
    let user = state.verifier.verify(&token).map_err(|e| {
        tracing::warn!("websocket handshake rejected");
        e
    })?;
    let gateway = state.gateway.clone();
    Ok(ws
        .on_upgrade(move |socket| gateway.serve(socket, user))
        .into_response())
}

/// Run the HTTP server bound to the configured address.
pub async fn run_http_server(config: Config) -> anyhow::Result<()> {
    let state = AppState::new(&config).await?;
    let addr: SocketAddr = config.bind.parse().context("invalid bind address")?;
    tracing::info!(%addr, "listening");
    axum::Server::bind(&addr)
        .serve(build_router(state).into_make_service())
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;
    Ok(())
}

// Integration tests live in tests/ directory
