use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type Uuid = String;
pub type PlayerKey = String;
pub type SubjectId = u64;

pub const SCORE_WORD: &str = "MOVIE";
pub const MAX_SCORE: u8 = SCORE_WORD.len() as u8;

pub const HEARTBEAT_INTERVAL_MS: u64 = 10_000;
pub const STALE_AFTER_MS: u64 = 3 * HEARTBEAT_INTERVAL_MS;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Player {
    pub key: PlayerKey,
    pub uuid: Uuid,
    pub name: String,
    pub score: u8,
    pub ready: bool,
    pub heartbeat_at: u64,
}

impl Player {
    pub fn is_eliminated(&self) -> bool {
        self.score >= MAX_SCORE
    }

    pub fn score_letters(&self) -> &'static str {
        &SCORE_WORD[..usize::from(self.score.min(MAX_SCORE))]
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NewPlayer {
    pub uuid: Uuid,
    pub name: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MoveKind {
    Movie,
    Person,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProposedMove {
    pub kind: MoveKind,
    pub movie_id: Option<SubjectId>,
    pub person_id: Option<SubjectId>,
    pub display_name: String,
    pub photo: Option<String>,
}

impl ProposedMove {
    pub fn subject_id(&self) -> Option<SubjectId> {
        match self.kind {
            MoveKind::Movie => self.movie_id,
            MoveKind::Person => self.person_id,
        }
    }

    pub fn continuation_id(&self) -> Option<SubjectId> {
        match self.kind {
            MoveKind::Movie => self.person_id,
            MoveKind::Person => self.movie_id,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MoveRecord {
    pub kind: MoveKind,
    pub movie_id: Option<SubjectId>,
    pub person_id: Option<SubjectId>,
    pub display_name: String,
    pub photo: Option<String>,
    pub correct: bool,
    pub player: Player,
    pub made_at: u64,
}

impl MoveRecord {
    fn subject_id(&self) -> Option<SubjectId> {
        match self.kind {
            MoveKind::Movie => self.movie_id,
            MoveKind::Person => self.person_id,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LobbyState {
    Open,
    Launching,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Session {
    /// Assigned by the store; not part of the stored document.
    #[serde(skip)]
    pub id: String,
    pub name: String,
    pub created_at: u64,
    pub players: Vec<Player>,
    pub current_player: Uuid,
    #[serde(default)]
    pub history: Vec<MoveRecord>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MoveError {
    #[error("player not found")]
    PlayerNotFound,
    #[error("player has been eliminated")]
    EliminatedPlayer,
    #[error("not your turn")]
    NotCurrentPlayer,
    #[error("that choice has already been used")]
    DuplicateChoice,
    #[error("previous person doesn't match")]
    ChainMismatchPerson,
    #[error("previous movie doesn't match")]
    ChainMismatchMovie,
    #[error("the guessed movie or person id is missing")]
    MissingSubject,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinRejection {
    DuplicateIdentity,
    LobbyLaunching,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RosterError {
    #[error("player not found")]
    PlayerNotFound,
    #[error("join rejected: {0:?}")]
    JoinRejected(JoinRejection),
}

impl Session {
    pub fn new(
        id: impl Into<String>,
        first: NewPlayer,
        first_key: PlayerKey,
        name: Option<String>,
        now: u64,
    ) -> Self {
        let name = name
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(|| format!("{}'s game", first.name));
        let current_player = first.uuid.clone();

        Self {
            id: id.into(),
            name,
            created_at: now,
            players: vec![Player {
                key: first_key,
                uuid: first.uuid,
                name: first.name,
                score: 0,
                ready: false,
                heartbeat_at: now,
            }],
            current_player,
            history: Vec::new(),
        }
    }

    pub fn player(&self, uuid: &str) -> Option<&Player> {
        self.players.iter().find(|p| p.uuid == uuid)
    }

    fn player_index(&self, uuid: &str) -> Option<usize> {
        self.players.iter().position(|p| p.uuid == uuid)
    }

    pub fn eligible_count(&self) -> usize {
        self.players.iter().filter(|p| !p.is_eliminated()).count()
    }

    pub fn lobby_state(&self) -> LobbyState {
        if self.players.len() > 1 && self.players.iter().all(|p| p.ready) {
            LobbyState::Launching
        } else {
            LobbyState::Open
        }
    }

    pub fn winner(&self) -> Option<&Player> {
        if self.players.len() < 2 || self.eligible_count() != 1 {
            return None;
        }
        self.players.iter().find(|p| !p.is_eliminated())
    }

    pub fn last_move(&self) -> Option<&MoveRecord> {
        self.history.last()
    }

    pub fn check_join(&self, uuid: &str) -> Result<(), RosterError> {
        if self.player(uuid).is_some() {
            return Err(RosterError::JoinRejected(JoinRejection::DuplicateIdentity));
        }
        // A lone ready player cannot launch, so the gate needs two.
        if matches!(self.lobby_state(), LobbyState::Launching) {
            return Err(RosterError::JoinRejected(JoinRejection::LobbyLaunching));
        }
        Ok(())
    }

    pub fn join(&mut self, newcomer: NewPlayer, key: PlayerKey, now: u64) -> Result<(), RosterError> {
        self.check_join(&newcomer.uuid)?;
        self.players.push(Player {
            key,
            uuid: newcomer.uuid,
            name: newcomer.name,
            score: 0,
            ready: false,
            heartbeat_at: now,
        });
        Ok(())
    }

    pub fn set_ready(&mut self, uuid: &str, ready: bool) -> Result<(), RosterError> {
        let player = self
            .players
            .iter_mut()
            .find(|p| p.uuid == uuid)
            .ok_or(RosterError::PlayerNotFound)?;
        player.ready = ready;
        Ok(())
    }

    /// Next non-eliminated player after `after_key` in roster order, wrapping.
    /// `None` only when every player is eliminated.
    pub fn next_player(&self, after_key: &str) -> Option<&Uuid> {
        let len = self.players.len();
        let start = self.players.iter().position(|p| p.key == after_key)?;
        (1..=len)
            .map(|step| &self.players[(start + step) % len])
            .find(|p| !p.is_eliminated())
            .map(|p| &p.uuid)
    }

    pub fn complete_from_chain(&self, mut proposal: ProposedMove) -> ProposedMove {
        let Some(last) = self.last_move().filter(|m| m.correct) else {
            return proposal;
        };
        match proposal.kind {
            MoveKind::Person if proposal.movie_id.is_none() => proposal.movie_id = last.movie_id,
            MoveKind::Movie if proposal.person_id.is_none() => proposal.person_id = last.person_id,
            _ => {}
        }
        proposal
    }

    pub fn validate_move(
        &self,
        uuid: &str,
        is_correct: bool,
        proposal: &ProposedMove,
    ) -> Result<usize, MoveError> {
        let index = self.player_index(uuid).ok_or(MoveError::PlayerNotFound)?;
        if self.players[index].is_eliminated() {
            return Err(MoveError::EliminatedPlayer);
        }
        if self.current_player != uuid {
            return Err(MoveError::NotCurrentPlayer);
        }
        let subject = proposal.subject_id().ok_or(MoveError::MissingSubject)?;
        // A wrong guess does not continue the chain.
        if !is_correct {
            return Ok(index);
        }

        let last = self.last_move();
        if last.is_some_and(|m| !m.correct) {
            return Ok(index);
        }

        let reused = self
            .history
            .iter()
            .any(|m| m.kind == proposal.kind && m.subject_id() == Some(subject));
        if reused {
            return Err(MoveError::DuplicateChoice);
        }

        if let Some(last) = last {
            match proposal.kind {
                MoveKind::Person if proposal.movie_id != last.movie_id => {
                    return Err(MoveError::ChainMismatchMovie)
                }
                MoveKind::Movie if proposal.person_id != last.person_id => {
                    return Err(MoveError::ChainMismatchPerson)
                }
                _ => {}
            }
        }

        Ok(index)
    }

    pub fn apply_move(
        &mut self,
        uuid: &str,
        is_correct: bool,
        proposal: ProposedMove,
        now: u64,
    ) -> Result<MoveRecord, MoveError> {
        let index = self.validate_move(uuid, is_correct, &proposal)?;

        if !is_correct {
            self.players[index].score += 1;
        }
        let snapshot = self.players[index].clone();

        let record = MoveRecord {
            kind: proposal.kind,
            movie_id: proposal.movie_id,
            person_id: proposal.person_id,
            display_name: proposal.display_name,
            photo: proposal.photo,
            correct: is_correct,
            player: snapshot,
            made_at: now,
        };
        self.history.push(record.clone());
        self.advance_turn_from(index);

        Ok(record)
    }

    fn advance_turn_from(&mut self, index: usize) {
        let key = self.players[index].key.clone();
        if let Some(next) = self.next_player(&key).cloned() {
            self.current_player = next;
        }
    }

    pub fn heartbeat(&mut self, uuid: &str, now: u64) -> Result<Vec<Uuid>, RosterError> {
        let player = self
            .players
            .iter_mut()
            .find(|p| p.uuid == uuid)
            .ok_or(RosterError::PlayerNotFound)?;
        player.heartbeat_at = now;
        Ok(self.sweep_stale(now))
    }

    pub fn sweep_stale(&mut self, now: u64) -> Vec<Uuid> {
        if self.eligible_count() <= 1 {
            return Vec::new();
        }

        let cutoff = now.saturating_sub(STALE_AFTER_MS);
        let is_stale = |p: &Player| !p.is_eliminated() && p.heartbeat_at < cutoff;

        let mut forfeited = Vec::new();
        for player in self.players.iter_mut().filter(|p| is_stale(&**p)) {
            player.score = MAX_SCORE;
            forfeited.push(player.uuid.clone());
        }

        let current = self.current_player.clone();
        if forfeited.contains(&current) {
            if let Some(index) = self.player_index(&current) {
                self.advance_turn_from(index);
            }
        }
        forfeited
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn newcomer(uuid: &str) -> NewPlayer {
        NewPlayer {
            uuid: uuid.to_string(),
            name: format!("name-{uuid}"),
        }
    }

    fn session_with(uuids: &[&str]) -> Session {
        let mut session = Session::new("s1", newcomer(uuids[0]), "k0".into(), None, 0);
        for (i, uuid) in uuids.iter().enumerate().skip(1) {
            session.join(newcomer(uuid), format!("k{i}"), 0).unwrap();
        }
        session
    }

    fn guess(kind: MoveKind, movie_id: Option<u64>, person_id: Option<u64>) -> ProposedMove {
        ProposedMove {
            kind,
            movie_id,
            person_id,
            display_name: "someone".into(),
            photo: None,
        }
    }

    #[test]
    fn create_defaults_name_and_current_player() {
        let session = Session::new("s1", newcomer("a"), "k0".into(), None, 42);
        assert_eq!(session.name, "name-a's game");
        assert_eq!(session.current_player, "a");
        assert_eq!(session.created_at, 42);
        assert_eq!(session.players.len(), 1);
        assert_eq!(session.players[0].score, 0);
        assert_eq!(session.players[0].heartbeat_at, 42);
        assert!(!session.players[0].ready);

        let named = Session::new("s2", newcomer("a"), "k0".into(), Some("Friday".into()), 0);
        assert_eq!(named.name, "Friday");
    }

    #[test]
    fn join_rejects_duplicate_identity() {
        let mut session = session_with(&["a", "b"]);
        let err = session.join(newcomer("b"), "k9".into(), 0).unwrap_err();
        assert_eq!(err, RosterError::JoinRejected(JoinRejection::DuplicateIdentity));
        assert_eq!(session.players.len(), 2);
    }

    #[test]
    fn join_closed_once_two_players_are_ready() {
        let mut session = session_with(&["a", "b"]);
        session.set_ready("a", true).unwrap();
        session.set_ready("b", true).unwrap();
        assert_eq!(session.lobby_state(), LobbyState::Launching);

        let err = session.join(newcomer("c"), "k2".into(), 0).unwrap_err();
        assert_eq!(err, RosterError::JoinRejected(JoinRejection::LobbyLaunching));
        assert_eq!(session.players.len(), 2);
    }

    #[test]
    fn single_ready_player_lobby_still_joinable() {
        let mut session = session_with(&["a"]);
        session.set_ready("a", true).unwrap();
        assert_eq!(session.lobby_state(), LobbyState::Open);
        session.join(newcomer("b"), "k1".into(), 0).unwrap();
        assert_eq!(session.players.len(), 2);
    }

    #[test]
    fn set_ready_toggles_and_requires_membership() {
        let mut session = session_with(&["a"]);
        session.set_ready("a", true).unwrap();
        assert!(session.players[0].ready);
        session.set_ready("a", false).unwrap();
        assert!(!session.players[0].ready);
        assert_eq!(session.set_ready("zz", true), Err(RosterError::PlayerNotFound));
    }

    #[test]
    fn rotation_wraps_and_skips_eliminated() {
        let mut session = session_with(&["a", "b", "c"]);
        assert_eq!(session.next_player("k0").map(String::as_str), Some("b"));
        assert_eq!(session.next_player("k2").map(String::as_str), Some("a"));

        session.players[1].score = MAX_SCORE;
        assert_eq!(session.next_player("k0").map(String::as_str), Some("c"));

        session.players[2].score = MAX_SCORE;
        // Only a remains, so rotation comes back around to a.
        assert_eq!(session.next_player("k0").map(String::as_str), Some("a"));

        session.players[0].score = MAX_SCORE;
        assert_eq!(session.next_player("k0"), None);
    }

    #[test]
    fn incorrect_move_costs_a_point_and_passes_turn() {
        let mut session = session_with(&["a", "b"]);
        session.set_ready("a", true).unwrap();
        session.set_ready("b", true).unwrap();

        let record = session
            .apply_move("a", false, guess(MoveKind::Movie, Some(1), None), 5)
            .unwrap();

        assert_eq!(session.history.len(), 1);
        assert_eq!(session.players[0].score, 1);
        assert_eq!(session.current_player, "b");
        assert!(!record.correct);
        assert_eq!(record.player.score, 1);
        assert_eq!(record.made_at, 5);
    }

    #[test]
    fn correct_move_keeps_score_and_passes_turn() {
        let mut session = session_with(&["a", "b", "c"]);
        session
            .apply_move("a", true, guess(MoveKind::Person, None, Some(7)), 0)
            .unwrap();
        assert_eq!(session.players[0].score, 0);
        assert_eq!(session.current_player, "b");
    }

    #[test]
    fn eliminated_player_cannot_move() {
        let mut session = session_with(&["a", "b", "c"]);
        session.players[0].score = MAX_SCORE;
        session.current_player = "a".into();

        let err = session
            .apply_move("a", false, guess(MoveKind::Movie, Some(1), None), 0)
            .unwrap_err();
        assert_eq!(err, MoveError::EliminatedPlayer);
        assert_eq!(session.players[0].score, MAX_SCORE);
        assert!(session.history.is_empty());
        assert_eq!(session.current_player, "a");
    }

    #[test]
    fn rejects_out_of_turn_and_unknown_players() {
        let mut session = session_with(&["a", "b"]);
        let err = session
            .apply_move("b", true, guess(MoveKind::Person, None, Some(1)), 0)
            .unwrap_err();
        assert_eq!(err, MoveError::NotCurrentPlayer);

        let err = session
            .apply_move("zz", true, guess(MoveKind::Person, None, Some(1)), 0)
            .unwrap_err();
        assert_eq!(err, MoveError::PlayerNotFound);
        assert!(session.history.is_empty());
    }

    #[test]
    fn reusing_a_person_is_a_duplicate() {
        let mut session = session_with(&["a", "b", "c"]);
        session
            .apply_move("a", true, guess(MoveKind::Person, None, Some(7)), 0)
            .unwrap();
        session
            .apply_move("b", true, guess(MoveKind::Movie, Some(99), Some(7)), 0)
            .unwrap();

        let err = session
            .apply_move("c", true, guess(MoveKind::Person, Some(99), Some(7)), 0)
            .unwrap_err();
        assert_eq!(err, MoveError::DuplicateChoice);
        assert_eq!(session.history.len(), 2);
        assert_eq!(session.current_player, "c");
    }

    #[test]
    fn duplicate_check_counts_incorrect_moves_of_same_kind() {
        let mut session = session_with(&["a", "b"]);
        session
            .apply_move("a", false, guess(MoveKind::Person, None, Some(7)), 0)
            .unwrap();
        session
            .apply_move("b", true, guess(MoveKind::Person, None, Some(8)), 0)
            .unwrap();
        session
            .apply_move("a", true, guess(MoveKind::Movie, Some(99), Some(8)), 0)
            .unwrap();

        let err = session
            .apply_move("b", true, guess(MoveKind::Person, Some(99), Some(7)), 0)
            .unwrap_err();
        assert_eq!(err, MoveError::DuplicateChoice);
    }

    #[test]
    fn chain_must_continue_from_last_correct_move() {
        let mut session = session_with(&["a", "b", "c"]);
        session
            .apply_move("a", true, guess(MoveKind::Person, None, Some(7)), 0)
            .unwrap();

        let err = session
            .apply_move("b", true, guess(MoveKind::Movie, Some(99), Some(8)), 0)
            .unwrap_err();
        assert_eq!(err, MoveError::ChainMismatchPerson);

        session
            .apply_move("b", true, guess(MoveKind::Movie, Some(99), Some(7)), 0)
            .unwrap();

        let err = session
            .apply_move("c", true, guess(MoveKind::Person, Some(100), Some(3)), 0)
            .unwrap_err();
        assert_eq!(err, MoveError::ChainMismatchMovie);
        assert_eq!(err.to_string(), "previous movie doesn't match");
    }

    #[test]
    fn incorrect_move_resets_the_chain() {
        let mut session = session_with(&["a", "b", "c"]);
        session
            .apply_move("a", true, guess(MoveKind::Person, None, Some(7)), 0)
            .unwrap();
        session
            .apply_move("b", false, guess(MoveKind::Movie, Some(5), Some(7)), 0)
            .unwrap();

        // Reuses person 7 and ignores the chain: allowed after a miss.
        session
            .apply_move("c", true, guess(MoveKind::Person, None, Some(7)), 0)
            .unwrap();
        assert_eq!(session.history.len(), 3);
        assert_eq!(session.current_player, "a");
    }

    #[test]
    fn incorrect_move_skips_chain_checks() {
        let mut session = session_with(&["a", "b"]);
        session
            .apply_move("a", true, guess(MoveKind::Person, None, Some(7)), 0)
            .unwrap();
        session
            .apply_move("b", false, guess(MoveKind::Person, Some(1), Some(7)), 0)
            .unwrap();
        assert_eq!(session.players[1].score, 1);
    }

    #[test]
    fn turn_skips_eliminated_after_move() {
        let mut session = session_with(&["a", "b", "c"]);
        session.players[1].score = MAX_SCORE;
        session
            .apply_move("a", false, guess(MoveKind::Person, None, Some(1)), 0)
            .unwrap();
        assert_eq!(session.current_player, "c");
    }

    #[test]
    fn final_miss_eliminates_and_crowns_winner() {
        let mut session = session_with(&["a", "b"]);
        session.players[0].score = MAX_SCORE - 1;
        assert!(session.winner().is_none());

        session
            .apply_move("a", false, guess(MoveKind::Person, None, Some(1)), 0)
            .unwrap();
        assert_eq!(session.players[0].score_letters(), "MOVIE");
        assert_eq!(session.winner().map(|p| p.uuid.as_str()), Some("b"));
        assert_eq!(session.current_player, "b");
    }

    #[test]
    fn score_letters_fill_left_to_right() {
        let mut session = session_with(&["a"]);
        assert_eq!(session.players[0].score_letters(), "");
        session.players[0].score = 2;
        assert_eq!(session.players[0].score_letters(), "MO");
    }

    #[test]
    fn complete_from_chain_inherits_other_side() {
        let mut session = session_with(&["a", "b"]);
        let first = guess(MoveKind::Person, None, Some(7));
        assert_eq!(session.complete_from_chain(first.clone()), first);

        session.apply_move("a", true, first, 0).unwrap();
        let filled = session.complete_from_chain(guess(MoveKind::Movie, Some(99), None));
        assert_eq!(filled.person_id, Some(7));

        session
            .apply_move("b", false, guess(MoveKind::Movie, Some(99), Some(7)), 0)
            .unwrap();
        let fresh = session.complete_from_chain(guess(MoveKind::Person, None, Some(3)));
        assert_eq!(fresh.movie_id, None);
    }

    #[test]
    fn heartbeat_forfeits_stale_players() {
        let mut session = session_with(&["a", "b", "c"]);
        let now = STALE_AFTER_MS + 1_000;
        session.players[2].heartbeat_at = now - 5_000;

        let forfeited = session.heartbeat("a", now).unwrap();

        assert_eq!(forfeited, vec!["b".to_string()]);
        assert_eq!(session.players[0].heartbeat_at, now);
        assert_eq!(session.players[0].score, 0);
        assert_eq!(session.players[1].score, MAX_SCORE);
        assert_eq!(session.players[2].score, 0);
    }

    #[test]
    fn heartbeat_guard_spares_last_eligible_player() {
        let mut session = session_with(&["a", "b", "c"]);
        session.players[0].score = MAX_SCORE;
        session.players[1].score = MAX_SCORE;

        let forfeited = session.heartbeat("a", STALE_AFTER_MS * 10).unwrap();

        assert!(forfeited.is_empty());
        assert_eq!(session.players[2].score, 0);
    }

    #[test]
    fn forfeiting_current_player_advances_turn() {
        let mut session = session_with(&["a", "b", "c"]);
        let now = STALE_AFTER_MS * 2;
        session.players[2].heartbeat_at = now;

        session.heartbeat("b", now).unwrap();

        assert_eq!(session.players[0].score, MAX_SCORE);
        assert_eq!(session.current_player, "b");
    }

    #[test]
    fn spectator_heartbeat_forfeits_every_silent_player() {
        let mut session = session_with(&["a", "b", "c"]);
        session.players[0].score = MAX_SCORE;

        // a is already out; b and c have both gone quiet.
        let forfeited = session.heartbeat("a", STALE_AFTER_MS * 10).unwrap();

        assert_eq!(forfeited, vec!["b".to_string(), "c".to_string()]);
        assert!(session.players.iter().all(|p| p.score == MAX_SCORE));
        assert_eq!(session.eligible_count(), 0);
        assert!(session.winner().is_none());
        assert_eq!(session.current_player, "a");
    }

    #[test]
    fn move_without_guessed_id_is_rejected() {
        let mut session = session_with(&["a", "b"]);
        session
            .apply_move("a", true, guess(MoveKind::Person, None, Some(7)), 1)
            .unwrap();

        // Only the person side is named, so the movie guess has no subject.
        let err = session
            .apply_move("b", true, guess(MoveKind::Movie, None, Some(7)), 2)
            .unwrap_err();
        assert_eq!(err, MoveError::MissingSubject);
        let err = session
            .validate_move("b", false, &guess(MoveKind::Movie, None, Some(7)))
            .unwrap_err();
        assert_eq!(err, MoveError::MissingSubject);
        assert_eq!(session.history.len(), 1);
        assert_eq!(session.players[1].score, 0);
    }

    #[test]
    fn heartbeat_requires_membership() {
        let mut session = session_with(&["a"]);
        assert_eq!(session.heartbeat("zz", 0), Err(RosterError::PlayerNotFound));
    }
}
