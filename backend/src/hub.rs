use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use movie_game_core::{
    MoveError, MoveRecord, NewPlayer, PlayerKey, ProposedMove, RosterError, Session, Uuid,
    HEARTBEAT_INTERVAL_MS,
};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::store::{bounded, DocumentStore, StoreError};

pub const SESSIONS_ROOT: &str = "games";

pub fn session_path(id: &str) -> String {
    format!("{SESSIONS_ROOT}/{id}")
}

/// Milliseconds since the Unix epoch.
pub type Clock = Arc<dyn Fn() -> u64 + Send + Sync>;

pub fn system_clock() -> Clock {
    Arc::new(|| {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    })
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub store_timeout: Duration,
    pub sweep_interval: Duration,
    pub inbox_capacity: usize,
    /// A worker with no requests for this long and no armed sweep exits.
    pub idle_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            store_timeout: Duration::from_secs(5),
            sweep_interval: Duration::from_millis(HEARTBEAT_INTERVAL_MS),
            inbox_capacity: 32,
            idle_timeout: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("session not found")]
    NotFound,
    #[error(transparent)]
    Roster(#[from] RosterError),
    #[error(transparent)]
    Move(#[from] MoveError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("session worker stopped")]
    WorkerGone,
}

type Reply<T> = oneshot::Sender<Result<T, SessionError>>;

enum Command {
    Snapshot {
        reply: Reply<Session>,
    },
    Join {
        player: NewPlayer,
        reply: Reply<PlayerKey>,
    },
    SetReady {
        uuid: Uuid,
        ready: bool,
        reply: Reply<()>,
    },
    Move {
        uuid: Uuid,
        is_correct: bool,
        proposal: ProposedMove,
        reply: Reply<MoveRecord>,
    },
    Heartbeat {
        uuid: Uuid,
        reply: Reply<Vec<Uuid>>,
    },
}

#[derive(Clone)]
pub struct SessionHub {
    inner: Arc<HubInner>,
}

struct HubInner {
    store: Arc<dyn DocumentStore>,
    clock: Clock,
    config: EngineConfig,
    workers: Arc<Mutex<Registry>>,
}

#[derive(Default)]
struct Registry {
    inboxes: HashMap<String, mpsc::Sender<Command>>,
    retired: u64,
}

impl Registry {
    fn live(&self, id: &str) -> Option<mpsc::Sender<Command>> {
        self.inboxes.get(id).filter(|tx| !tx.is_closed()).cloned()
    }
}

impl SessionHub {
    pub fn new(store: Arc<dyn DocumentStore>, clock: Clock, config: EngineConfig) -> Self {
        Self {
            inner: Arc::new(HubInner {
                store,
                clock,
                config,
                workers: Arc::default(),
            }),
        }
    }

    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.inner.store
    }

    pub async fn create(
        &self,
        first: NewPlayer,
        name: Option<String>,
    ) -> Result<Session, SessionError> {
        let inner = &self.inner;
        let now = (inner.clock)();
        let mut session = Session::new(String::new(), first, inner.store.new_key(), name, now);
        let doc = serde_json::to_value(&session).map_err(StoreError::from)?;
        session.id = bounded(inner.config.store_timeout, inner.store.push(SESSIONS_ROOT, doc)).await?;

        info!(session_id = %session.id, uuid = %session.current_player, "session created");
        Ok(session)
    }

    pub async fn get(&self, id: &str) -> Result<Session, SessionError> {
        self.call(id, |reply| Command::Snapshot { reply }).await
    }

    pub async fn join(&self, id: &str, player: NewPlayer) -> Result<PlayerKey, SessionError> {
        self.call(id, |reply| Command::Join { player, reply }).await
    }

    pub async fn set_ready(&self, id: &str, uuid: &str, ready: bool) -> Result<(), SessionError> {
        let uuid = uuid.to_string();
        self.call(id, |reply| Command::SetReady { uuid, ready, reply })
            .await
    }

    pub async fn submit_move(
        &self,
        id: &str,
        uuid: &str,
        is_correct: bool,
        proposal: ProposedMove,
    ) -> Result<MoveRecord, SessionError> {
        let uuid = uuid.to_string();
        self.call(id, |reply| Command::Move {
            uuid,
            is_correct,
            proposal,
            reply,
        })
        .await
    }

    pub async fn heartbeat(&self, id: &str, uuid: &str) -> Result<Vec<Uuid>, SessionError> {
        let uuid = uuid.to_string();
        self.call(id, |reply| Command::Heartbeat { uuid, reply })
            .await
    }

    async fn call<T>(
        &self,
        id: &str,
        command: impl FnOnce(Reply<T>) -> Command,
    ) -> Result<T, SessionError> {
        let (reply, response) = oneshot::channel();
        let mut command = command(reply);
        for _ in 0..2 {
            let inbox = self.worker(id).await?;
            match inbox.send(command).await {
                Ok(()) => return response.await.map_err(|_| SessionError::WorkerGone)?,
                // The worker retired after the lookup; hand the request to a fresh one.
                Err(mpsc::error::SendError(returned)) => command = returned,
            }
        }
        Err(SessionError::WorkerGone)
    }

    async fn worker(&self, id: &str) -> Result<mpsc::Sender<Command>, SessionError> {
        if id.trim().is_empty() || id.contains('/') {
            return Err(SessionError::NotFound);
        }

        let inner = &self.inner;
        loop {
            let retired = {
                let workers = inner.workers.lock().await;
                if let Some(inbox) = workers.live(id) {
                    return Ok(inbox);
                }
                workers.retired
            };

            // Loaded without the registry lock; a copy that lost a race is dropped.
            let session = load_session(inner.store.as_ref(), id, inner.config.store_timeout)
                .await?
                .ok_or(SessionError::NotFound)?;

            let mut workers = inner.workers.lock().await;
            if let Some(inbox) = workers.live(id) {
                return Ok(inbox);
            }
            // A worker retired while we loaded, so the copy may predate its last write.
            if workers.retired != retired {
                continue;
            }

            let (inbox, commands) = mpsc::channel(inner.config.inbox_capacity);
            let worker = SessionWorker {
                session,
                store: Arc::clone(&inner.store),
                clock: Arc::clone(&inner.clock),
                config: inner.config.clone(),
                registry: Arc::clone(&inner.workers),
                commands,
                sweeping: false,
            };
            tokio::spawn(worker.run());
            debug!(session_id = %id, "session worker started");

            workers.inboxes.insert(id.to_string(), inbox.clone());
            return Ok(inbox);
        }
    }
}

pub async fn load_session(
    store: &dyn DocumentStore,
    id: &str,
    limit: Duration,
) -> Result<Option<Session>, SessionError> {
    let Some(doc) = bounded(limit, store.get(&session_path(id))).await? else {
        return Ok(None);
    };
    let mut session: Session = serde_json::from_value(doc).map_err(StoreError::from)?;
    session.id = id.to_string();
    Ok(Some(session))
}

struct SessionWorker {
    session: Session,
    store: Arc<dyn DocumentStore>,
    clock: Clock,
    config: EngineConfig,
    registry: Arc<Mutex<Registry>>,
    commands: mpsc::Receiver<Command>,
    sweeping: bool,
}

impl SessionWorker {
    async fn run(mut self) {
        let mut sweep = tokio::time::interval(self.config.sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let idle = tokio::time::sleep(self.config.idle_timeout);
        tokio::pin!(idle);

        loop {
            tokio::select! {
                biased;
                _ = sweep.tick(), if self.sweeping => self.scheduled_sweep().await,
                command = self.commands.recv() => match command {
                    Some(command) => {
                        self.handle(command).await;
                        idle.as_mut().reset(Instant::now() + self.config.idle_timeout);
                    }
                    None => break,
                },
                _ = &mut idle, if !self.sweeping => break,
            }
        }
        self.retire().await;
    }

    async fn retire(mut self) {
        let registry = Arc::clone(&self.registry);
        let mut workers = registry.lock().await;
        self.commands.close();
        // Requests queued before the close are still answered.
        while let Ok(command) = self.commands.try_recv() {
            self.handle(command).await;
        }
        let id = &self.session.id;
        if workers.inboxes.get(id).is_some_and(|tx| tx.is_closed()) {
            workers.inboxes.remove(id);
            workers.retired += 1;
        }
        debug!(session_id = %id, "session worker stopped");
    }

    async fn handle(&mut self, command: Command) {
        match command {
            Command::Snapshot { reply } => {
                let _ = reply.send(Ok(self.session.clone()));
            }
            Command::Join { player, reply } => {
                let key = self.store.new_key();
                let uuid = player.uuid.clone();
                let result = self
                    .commit(|session, now| {
                        session.join(player, key.clone(), now)?;
                        Ok(key)
                    })
                    .await;
                match &result {
                    Ok(key) => info!(session_id = %self.session.id, %uuid, player_key = %key, "player joined"),
                    Err(err) => debug!(session_id = %self.session.id, %uuid, error = %err, "join refused"),
                }
                let _ = reply.send(result);
            }
            Command::SetReady { uuid, ready, reply } => {
                let result = self
                    .commit(|session, _| Ok(session.set_ready(&uuid, ready)?))
                    .await;
                let _ = reply.send(result);
            }
            Command::Move {
                uuid,
                is_correct,
                proposal,
                reply,
            } => {
                let result = self
                    .commit(|session, now| Ok(session.apply_move(&uuid, is_correct, proposal, now)?))
                    .await;
                if let Ok(record) = &result {
                    info!(
                        session_id = %self.session.id,
                        %uuid,
                        correct = record.correct,
                        score = record.player.score,
                        next = %self.session.current_player,
                        "move recorded"
                    );
                }
                self.check_game_over();
                let _ = reply.send(result);
            }
            Command::Heartbeat { uuid, reply } => {
                let result = self
                    .commit(|session, now| Ok(session.heartbeat(&uuid, now)?))
                    .await;
                if let Ok(forfeited) = &result {
                    for player in forfeited {
                        warn!(session_id = %self.session.id, uuid = %player, "player forfeited for inactivity");
                    }
                    if !self.sweeping && self.session.eligible_count() > 1 {
                        self.sweeping = true;
                        debug!(session_id = %self.session.id, "liveness sweep armed");
                    }
                }
                self.check_game_over();
                let _ = reply.send(result);
            }
        }
    }

    async fn scheduled_sweep(&mut self) {
        let now = (self.clock)();
        let mut next = self.session.clone();
        let forfeited = next.sweep_stale(now);
        if forfeited.is_empty() {
            return;
        }

        match self.persist(&next).await {
            Ok(()) => {
                self.session = next;
                for player in &forfeited {
                    warn!(session_id = %self.session.id, uuid = %player, "player forfeited for inactivity");
                }
            }
            Err(err) => warn!(session_id = %self.session.id, error = %err, "liveness sweep not saved"),
        }
        self.check_game_over();
    }

    fn check_game_over(&mut self) {
        if self.sweeping && self.session.eligible_count() <= 1 {
            self.sweeping = false;
            match self.session.winner() {
                Some(winner) => info!(session_id = %self.session.id, winner = %winner.uuid, "game over"),
                None => debug!(session_id = %self.session.id, "liveness sweep disarmed"),
            }
        }
    }

    async fn commit<T>(
        &mut self,
        op: impl FnOnce(&mut Session, u64) -> Result<T, SessionError>,
    ) -> Result<T, SessionError> {
        let now = (self.clock)();
        let mut next = self.session.clone();
        let out = op(&mut next, now)?;
        self.persist(&next).await?;
        self.session = next;
        Ok(out)
    }

    async fn persist(&self, session: &Session) -> Result<(), StoreError> {
        let doc = serde_json::to_value(session)?;
        bounded(
            self.config.store_timeout,
            self.store.set(&session_path(&session.id), doc),
        )
        .await
    }
}
