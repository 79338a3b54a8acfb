use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use movie_game_core::{
    LobbyState, MoveKind, MoveRecord, NewPlayer, Player, ProposedMove, RosterError, Session,
    SubjectId, Uuid,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, warn};

pub mod auth;
pub mod config;
pub mod fact_check;
pub mod hub;
pub mod store;

use auth::{bearer_token, AuthError, Authenticator, StaticTokens};
use config::Config;
use fact_check::{FactCheckError, FactChecker, Subject, TmdbClient};
use hub::{session_path, system_clock, EngineConfig, SessionError, SessionHub};
use store::{DocumentStore, MemoryStore};

#[derive(Clone)]
pub struct AppState {
    hub: SessionHub,
    facts: Arc<dyn FactChecker>,
    auth: Arc<dyn Authenticator>,
}

impl AppState {
    pub fn new(hub: SessionHub, facts: Arc<dyn FactChecker>, auth: Arc<dyn Authenticator>) -> Self {
        Self { hub, facts, auth }
    }

    pub async fn from_config(config: &Config) -> Self {
        let store: Arc<dyn DocumentStore> = match &config.persist_path {
            Some(path) => Arc::new(MemoryStore::with_persistence(path.clone()).await),
            None => Arc::new(MemoryStore::default()),
        };
        let engine = EngineConfig {
            store_timeout: config.store_timeout,
            ..EngineConfig::default()
        };
        let tokens = StaticTokens::parse(&config.auth_tokens);
        if tokens.is_empty() {
            warn!("no AUTH_TOKENS configured; every request will be rejected");
        }

        Self::new(
            SessionHub::new(store, system_clock(), engine),
            Arc::new(TmdbClient::new(config.tmdb.clone())),
            Arc::new(tokens),
        )
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/session", post(create_session))
        .route("/session/:id", get(get_session))
        .route("/session/:id/join", post(join_session))
        .route("/session/:id/ready", post(set_ready))
        .route("/session/:id/move", post(submit_move))
        .route("/session/:id/heartbeat", post(heartbeat))
        .route("/search/movie", get(search_movies))
        .route("/search/person", get(search_people))
        .route("/movie/:id", get(lookup_movie))
        .route("/person/:id", get(lookup_person))
        .route("/ws/:id", get(ws_handler))
        .with_state(state)
}

#[derive(Debug, thiserror::Error)]
enum ApiError {
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    FactCheck(#[from] FactCheckError),
    #[error("{0}")]
    BadRequest(&'static str),
    #[error("{0} not found")]
    Missing(&'static str),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::Auth(_) => StatusCode::UNAUTHORIZED,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Missing(_) => StatusCode::NOT_FOUND,
            ApiError::FactCheck(_) => StatusCode::BAD_GATEWAY,
            ApiError::Session(err) => match err {
                SessionError::NotFound => StatusCode::NOT_FOUND,
                SessionError::Roster(RosterError::JoinRejected(_)) => StatusCode::UNPROCESSABLE_ENTITY,
                SessionError::Roster(RosterError::PlayerNotFound) | SessionError::Move(_) => {
                    StatusCode::FORBIDDEN
                }
                SessionError::Store(_) | SessionError::WorkerGone => {
                    StatusCode::INTERNAL_SERVER_ERROR
                }
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            warn!(error = %self, %status, "request failed");
        } else {
            debug!(error = %self, %status, "request refused");
        }
        (status, self.to_string()).into_response()
    }
}

async fn caller(state: &AppState, headers: &HeaderMap) -> Result<Uuid, ApiError> {
    let token = bearer_token(headers)?;
    Ok(state.auth.authenticate(token).await?)
}

fn display_name(name: &str) -> Result<String, ApiError> {
    let name = name.trim();
    if name.is_empty() {
        return Err(ApiError::BadRequest("name required"));
    }
    Ok(name.to_string())
}

#[derive(Deserialize)]
struct CreateSessionRequest {
    player_name: String,
    name: Option<String>,
}

#[derive(Deserialize)]
struct JoinRequest {
    name: String,
}

#[derive(Deserialize)]
struct ReadyRequest {
    #[serde(default = "ready_default")]
    ready: bool,
}

fn ready_default() -> bool {
    true
}

#[derive(Deserialize)]
struct MoveRequest {
    kind: MoveKind,
    movie_id: Option<SubjectId>,
    person_id: Option<SubjectId>,
}

#[derive(Deserialize)]
struct SearchParams {
    q: String,
}

#[derive(Deserialize)]
struct StreamParams {
    token: Option<String>,
}

#[derive(Serialize)]
struct PlayerView<'a> {
    #[serde(flatten)]
    player: &'a Player,
    letters: &'static str,
    eliminated: bool,
}

#[derive(Serialize)]
struct SessionView<'a> {
    id: &'a str,
    name: &'a str,
    created_at: u64,
    players: Vec<PlayerView<'a>>,
    current_player: &'a str,
    history: &'a [MoveRecord],
    lobby: LobbyState,
    winner: Option<&'a str>,
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ServerMessage<'a> {
    State(SessionView<'a>),
    Closed,
}

fn to_view(session: &Session) -> SessionView<'_> {
    SessionView {
        id: &session.id,
        name: &session.name,
        created_at: session.created_at,
        players: session
            .players
            .iter()
            .map(|player| PlayerView {
                player,
                letters: player.score_letters(),
                eliminated: player.is_eliminated(),
            })
            .collect(),
        current_player: &session.current_player,
        history: &session.history,
        lobby: session.lobby_state(),
        winner: session.winner().map(|p| p.uuid.as_str()),
    }
}

async fn create_session(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<CreateSessionRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let uuid = caller(&state, &headers).await?;
    let first = NewPlayer {
        uuid,
        name: display_name(&payload.player_name)?,
    };
    let session = state.hub.create(first, payload.name).await?;
    Ok((StatusCode::OK, session.id))
}

async fn get_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    caller(&state, &headers).await?;
    let session = state.hub.get(&id).await?;
    Ok(Json(to_view(&session)).into_response())
}

async fn join_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(payload): Json<JoinRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let uuid = caller(&state, &headers).await?;
    let player = NewPlayer {
        uuid,
        name: display_name(&payload.name)?,
    };
    let key = state.hub.join(&id, player).await?;
    Ok((StatusCode::OK, key))
}

async fn set_ready(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    payload: Option<Json<ReadyRequest>>,
) -> Result<impl IntoResponse, ApiError> {
    let uuid = caller(&state, &headers).await?;
    let ready = payload.map_or(true, |Json(body)| body.ready);
    state.hub.set_ready(&id, &uuid, ready).await?;
    Ok(StatusCode::OK)
}

async fn submit_move(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(payload): Json<MoveRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let uuid = caller(&state, &headers).await?;
    let session = state.hub.get(&id).await?;

    let proposal = session.complete_from_chain(ProposedMove {
        kind: payload.kind,
        movie_id: payload.movie_id,
        person_id: payload.person_id,
        display_name: String::new(),
        photo: None,
    });
    if proposal.subject_id().is_none() {
        return Err(ApiError::BadRequest("the guessed movie_id or person_id is required"));
    }
    // Turn checks first so an out-of-turn guess never reaches the fact-checker.
    session
        .validate_move(&uuid, false, &proposal)
        .map_err(SessionError::from)?;

    let verdict = fact_check::judge(state.facts.as_ref(), &proposal).await?;
    let proposal = ProposedMove {
        display_name: verdict.display_name,
        photo: verdict.photo,
        ..proposal
    };
    let record = state
        .hub
        .submit_move(&id, &uuid, verdict.correct, proposal)
        .await?;
    Ok(Json(record))
}

async fn heartbeat(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let uuid = caller(&state, &headers).await?;
    let forfeited = state.hub.heartbeat(&id, &uuid).await?;
    Ok(Json(forfeited))
}

async fn search_movies(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<SearchParams>,
) -> Result<Json<Vec<Subject>>, ApiError> {
    caller(&state, &headers).await?;
    Ok(Json(state.facts.search_movies(&params.q).await?))
}

async fn search_people(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<SearchParams>,
) -> Result<Json<Vec<Subject>>, ApiError> {
    caller(&state, &headers).await?;
    Ok(Json(state.facts.search_people(&params.q).await?))
}

async fn lookup_movie(
    State(state): State<AppState>,
    Path(id): Path<SubjectId>,
    headers: HeaderMap,
) -> Result<Json<Subject>, ApiError> {
    caller(&state, &headers).await?;
    let movie = state.facts.movie(id).await?.ok_or(ApiError::Missing("movie"))?;
    Ok(Json(movie))
}

async fn lookup_person(
    State(state): State<AppState>,
    Path(id): Path<SubjectId>,
    headers: HeaderMap,
) -> Result<Json<Subject>, ApiError> {
    caller(&state, &headers).await?;
    let person = state.facts.person(id).await?.ok_or(ApiError::Missing("person"))?;
    Ok(Json(person))
}

// Browsers cannot set headers on a websocket handshake, so `?token=` is accepted too.
async fn ws_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<StreamParams>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Result<impl IntoResponse, ApiError> {
    match params.token.as_deref() {
        Some(token) => state.auth.authenticate(token).await?,
        None => caller(&state, &headers).await?,
    };
    let session = state.hub.get(&id).await?;
    let feed = state.hub.store().subscribe(&session_path(&id));
    Ok(ws.on_upgrade(move |socket| forward_updates(socket, session, feed)))
}

async fn forward_updates(
    stream: WebSocket,
    session: Session,
    mut feed: broadcast::Receiver<Option<Value>>,
) {
    let (mut sender, mut receiver) = stream.split();
    if send_state(&mut sender, Some(&session)).await.is_err() {
        return;
    }

    loop {
        tokio::select! {
            update = feed.recv() => match update {
                Ok(doc) => {
                    let next = doc
                        .and_then(|doc| serde_json::from_value::<Session>(doc).ok())
                        .map(|mut next| {
                            next.id = session.id.clone();
                            next
                        });
                    if send_state(&mut sender, next.as_ref()).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(session_id = %session.id, skipped, "live feed lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            incoming = receiver.next() => match incoming {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }
}

async fn send_state(
    sender: &mut SplitSink<WebSocket, Message>,
    session: Option<&Session>,
) -> Result<(), axum::Error> {
    let message = match session {
        Some(session) => ServerMessage::State(to_view(session)),
        None => ServerMessage::Closed,
    };
    match serde_json::to_string(&message) {
        Ok(text) => sender.send(Message::Text(text)).await,
        Err(err) => {
            warn!(error = %err, "could not encode session update");
            Ok(())
        }
    }
}
