//! Player commands: session membership, game control and round actions
//!
//! Every flow that reads and then writes a session holds the session lock for
//! its whole read-modify-write, and re-reads the session after taking it.

use super::AppState;
use crate::engine::result_infos;
use crate::error::{GameError, GameResult};
use crate::protocol::{
    AnonymizedEntry, FinishReason, PlayerInfo, RejoinSnapshot, ServerMessage, SessionInfo,
};
use crate::scoring::score_round;
use crate::types::*;
use rand::Rng;
use std::sync::Arc;

const CODE_CHARS: &[u8] = b"ABCDEFGHJKMNPQRSTUVWXYZ23456789";
const CODE_LENGTH: usize = 5;

/// Generate a random short join code (5 characters)
fn generate_session_code() -> String {
    let mut rng = rand::rng();
    (0..CODE_LENGTH)
        .map(|_| CODE_CHARS[rng.random_range(0..CODE_CHARS.len())] as char)
        .collect()
}

/// Who is on the other end of a connection
#[derive(Debug, Clone)]
pub struct ConnectionContext {
    pub connection_id: ConnectionId,
    pub user_id: UserId,
    pub username: String,
}

impl AppState {
    /// Session the user currently belongs to
    async fn current_session_of(&self, user_id: &str) -> GameResult<Session> {
        let session_id = self
            .repo
            .get_user(user_id)
            .await?
            .and_then(|u| u.current_session)
            .ok_or_else(|| GameError::not_found("Current session"))?;
        self.repo
            .get_session(&session_id)
            .await?
            .ok_or_else(|| GameError::not_found("Session"))
    }

    async fn load_session(&self, session_id: &str) -> GameResult<Session> {
        self.repo
            .get_session(session_id)
            .await?
            .ok_or_else(|| GameError::not_found("Session"))
    }

    /// Reject users who are still part of another active session
    async fn check_not_in_other_session(&self, user_id: &str, except: Option<&str>) -> GameResult<()> {
        let Some(current) = self
            .repo
            .get_user(user_id)
            .await?
            .and_then(|u| u.current_session)
        else {
            return Ok(());
        };
        if Some(current.as_str()) == except {
            return Ok(());
        }
        // Live sessions answer from the registry snapshot
        let session = match self.registry.get(&current).await {
            Some(entry) => Some(entry.snapshot),
            None => self.repo.get_session(&current).await?,
        };
        if let Some(session) = session {
            if session.state.is_active() && session.has_player(user_id) {
                return Err(GameError::invalid_state(format!(
                    "You are already in session {}",
                    session.code
                )));
            }
        }
        Ok(())
    }

    async fn unique_session_code(&self) -> GameResult<String> {
        loop {
            let code = generate_session_code();
            if self.repo.find_session_by_code(&code).await?.is_none() {
                return Ok(code);
            }
            // Collision - try again
        }
    }

    /// Attach a connection to a session's channel and registry entry
    async fn attach(&self, session: &Session, connection_id: &str) {
        self.transport().join_channel(&session.id, connection_id).await;
        self.registry
            .join(&session.id, connection_id, session.clone())
            .await;
    }

    async fn detach(&self, session_id: &str, connection_id: &str) {
        self.transport().leave_channel(session_id, connection_id).await;
        self.registry.leave(session_id, connection_id).await;
    }

    pub async fn create_session(&self, ctx: &ConnectionContext) -> GameResult<Session> {
        self.check_not_in_other_session(&ctx.user_id, None).await?;

        let now = chrono::Utc::now().to_rfc3339();
        let session = Session {
            id: ulid::Ulid::new().to_string(),
            code: self.unique_session_code().await?,
            host_id: ctx.user_id.clone(),
            players: vec![SessionPlayer {
                user_id: ctx.user_id.clone(),
                username: ctx.username.clone(),
                connection_id: ctx.connection_id.clone(),
            }],
            state: SessionState::Waiting,
            current_round_number: 0,
            settings: self.config.session_defaults.clone(),
            round_ids: Vec::new(),
            leaderboard: Vec::new(),
            created_at: now.clone(),
            updated_at: now,
        };

        self.repo.insert_session(session.clone()).await?;
        self.set_current_session(&ctx.user_id, &ctx.username, &session.id)
            .await?;
        self.attach(&session, &ctx.connection_id).await;

        tracing::info!(
            "Session {} created by {} with code {}",
            session.id,
            ctx.username,
            session.code
        );
        Ok(session)
    }

    pub async fn join_session(&self, ctx: &ConnectionContext, code: &str) -> GameResult<Session> {
        let found = self
            .repo
            .find_session_by_code(code)
            .await?
            .ok_or_else(|| GameError::not_found("Session"))?;

        let _guard = self.registry.lock(&found.id).await;
        let mut session = self.load_session(&found.id).await?;

        if session.state == SessionState::Finished {
            return Err(GameError::invalid_state("Game has already finished"));
        }
        if session.has_player(&ctx.user_id) {
            // Joining twice just re-attaches the connection
            if let Some(p) = session.players.iter_mut().find(|p| p.user_id == ctx.user_id) {
                p.connection_id = ctx.connection_id.clone();
            }
            self.repo.save_session(&session).await?;
            self.attach(&session, &ctx.connection_id).await;
            return Ok(session);
        }

        if session.state != SessionState::Waiting {
            return Err(GameError::invalid_state("Game has already started"));
        }
        if session.is_full(self.config.max_players) {
            return Err(GameError::invalid_state("Session is full"));
        }
        self.check_not_in_other_session(&ctx.user_id, Some(&session.id))
            .await?;

        session.players.push(SessionPlayer {
            user_id: ctx.user_id.clone(),
            username: ctx.username.clone(),
            connection_id: ctx.connection_id.clone(),
        });
        self.repo.save_session(&session).await?;
        self.set_current_session(&ctx.user_id, &ctx.username, &session.id)
            .await?;
        self.attach(&session, &ctx.connection_id).await;

        self.transport()
            .send_to_channel_except(
                &session.id,
                &ctx.connection_id,
                ServerMessage::PlayerJoined {
                    user_id: ctx.user_id.clone(),
                    username: ctx.username.clone(),
                    players: session.players.iter().map(PlayerInfo::from).collect(),
                },
            )
            .await;

        tracing::info!(
            "{} joined session {} ({}/{})",
            ctx.username,
            session.code,
            session.players.len(),
            self.config.max_players
        );
        Ok(session)
    }

    pub async fn leave_session(self: &Arc<Self>, ctx: &ConnectionContext) -> GameResult<SessionId> {
        let found = self.current_session_of(&ctx.user_id).await?;
        let _guard = self.registry.lock(&found.id).await;
        let mut session = self.load_session(&found.id).await?;

        let Some(index) = session.players.iter().position(|p| p.user_id == ctx.user_id) else {
            self.repo
                .clear_current_session(&ctx.user_id, &session.id)
                .await?;
            return Err(GameError::invalid_state("You are not in this session"));
        };
        let leaving = session.players.remove(index);

        self.repo
            .clear_current_session(&ctx.user_id, &session.id)
            .await?;
        self.detach(&session.id, &leaving.connection_id).await;
        if leaving.connection_id != ctx.connection_id {
            self.detach(&session.id, &ctx.connection_id).await;
        }

        tracing::info!("{} left session {}", leaving.username, session.code);

        if session.players.is_empty() {
            match session.state {
                SessionState::Waiting => self.delete_session(&session).await?,
                SessionState::Playing => {
                    self.finish_session(session.clone(), FinishReason::Abandoned, None)
                        .await?
                }
                SessionState::Finished => self.repo.save_session(&session).await?,
            }
            return Ok(session.id);
        }

        if session.is_host(&leaving.user_id) {
            session.host_id = session.players[0].user_id.clone();
            tracing::info!(
                "Host of session {} handed to {}",
                session.code,
                session.players[0].username
            );
        }
        self.repo.save_session(&session).await?;
        self.registry.refresh(&session).await;

        self.broadcast(
            &session.id,
            ServerMessage::PlayerLeft {
                user_id: leaving.user_id.clone(),
                username: leaving.username.clone(),
                host_id: session.host_id.clone(),
            },
        )
        .await;

        if session.state == SessionState::Playing {
            if let Some(engine) = self.existing_engine(&session.id).await {
                engine.players_changed(self, &session).await;
            }
        }
        Ok(session.id)
    }

    pub async fn remove_player(self: &Arc<Self>, ctx: &ConnectionContext, target_username: &str) -> GameResult<()> {
        let found = self.current_session_of(&ctx.user_id).await?;
        let _guard = self.registry.lock(&found.id).await;
        let mut session = self.load_session(&found.id).await?;

        if !session.is_host(&ctx.user_id) {
            return Err(GameError::Unauthorized(
                "Only the host can remove players".to_string(),
            ));
        }
        let index = session
            .players
            .iter()
            .position(|p| p.username == target_username)
            .ok_or_else(|| GameError::not_found("Player"))?;
        if session.players[index].user_id == ctx.user_id {
            return Err(GameError::invalid_input("The host cannot remove themselves"));
        }

        let removed = session.players.remove(index);
        self.repo.save_session(&session).await?;
        self.registry.refresh(&session).await;
        self.repo
            .clear_current_session(&removed.user_id, &session.id)
            .await?;

        self.transport()
            .send_to(
                &removed.connection_id,
                ServerMessage::RemovedFromSession {
                    session_id: session.id.clone(),
                },
            )
            .await;
        self.detach(&session.id, &removed.connection_id).await;
        self.broadcast(
            &session.id,
            ServerMessage::PlayerRemoved {
                user_id: removed.user_id.clone(),
                username: removed.username.clone(),
            },
        )
        .await;

        tracing::info!("{} removed from session {}", removed.username, session.code);

        if session.state == SessionState::Playing {
            if let Some(engine) = self.existing_engine(&session.id).await {
                engine.players_changed(self, &session).await;
            }
        }
        Ok(())
    }

    pub async fn rejoin_session(&self, ctx: &ConnectionContext) -> GameResult<RejoinSnapshot> {
        let session_id = self
            .repo
            .get_user(&ctx.user_id)
            .await?
            .and_then(|u| u.current_session)
            .ok_or_else(|| GameError::not_found("Session to rejoin"))?;

        let _guard = self.registry.lock(&session_id).await;
        let Some(mut session) = self.repo.get_session(&session_id).await? else {
            self.repo
                .clear_current_session(&ctx.user_id, &session_id)
                .await?;
            return Err(GameError::not_found("Session"));
        };

        if session.state == SessionState::Finished {
            self.repo
                .clear_current_session(&ctx.user_id, &session_id)
                .await?;
            return Err(GameError::invalid_state("Game has already finished"));
        }
        let Some(player) = session
            .players
            .iter_mut()
            .find(|p| p.user_id == ctx.user_id)
        else {
            self.repo
                .clear_current_session(&ctx.user_id, &session_id)
                .await?;
            return Err(GameError::invalid_state("You are no longer in this session"));
        };

        let previous = std::mem::replace(&mut player.connection_id, ctx.connection_id.clone());
        self.repo.save_session(&session).await?;
        if previous != ctx.connection_id {
            self.detach(&session.id, &previous).await;
        }
        self.attach(&session, &ctx.connection_id).await;

        tracing::info!("{} rejoined session {}", ctx.username, session.code);
        self.rejoin_snapshot(&session, &ctx.user_id).await
    }

    async fn rejoin_snapshot(&self, session: &Session, user_id: &str) -> GameResult<RejoinSnapshot> {
        let info = SessionInfo::from(session);
        let round = match session.current_round_id() {
            Some(round_id) => self.repo.get_round(round_id).await?,
            None => None,
        };

        let Some(round) = round.filter(|_| session.state == SessionState::Playing) else {
            return Ok(RejoinSnapshot::Lobby { session: info });
        };

        Ok(match round.status {
            RoundStatus::Submitting => RejoinSnapshot::Submitting {
                session: info,
                round_number: round.round_number,
                prompts: round.prompts_for(user_id),
                deadline: round.submission_deadline.clone(),
                has_submitted: round.submission_by(user_id).is_some(),
            },
            RoundStatus::Judging => RejoinSnapshot::Judging {
                session: info,
                round_number: round.round_number,
                entries: AnonymizedEntry::shuffled(&round),
                deadline: round.judging_deadline.clone(),
                has_judged: round.judgement_by(user_id).is_some(),
            },
            RoundStatus::Completed => {
                let results = score_round(&round);
                let username_of = |uid: &str| {
                    session
                        .player(uid)
                        .map(|p| p.username.clone())
                        .or_else(|| {
                            session
                                .leaderboard
                                .iter()
                                .find(|e| e.user_id == uid)
                                .map(|e| e.username.clone())
                        })
                        .unwrap_or_else(|| uid.to_string())
                };
                RejoinSnapshot::Intermission {
                    session: info,
                    round_number: round.round_number,
                    results: result_infos(&round, &results, username_of),
                }
            }
        })
    }

    pub async fn start_game(self: &Arc<Self>, ctx: &ConnectionContext) -> GameResult<Round> {
        let found = self.current_session_of(&ctx.user_id).await?;
        let _guard = self.registry.lock(&found.id).await;
        let mut session = self.load_session(&found.id).await?;

        if !session.is_host(&ctx.user_id) {
            return Err(GameError::Unauthorized(
                "Only the host can start the game".to_string(),
            ));
        }
        if !session.state.can_transition_to(SessionState::Playing) {
            return Err(GameError::invalid_state("Game has already started"));
        }
        if session.players.len() < 2 {
            return Err(GameError::invalid_state(
                "At least one other player is needed to start",
            ));
        }

        session.state = SessionState::Playing;
        self.repo.save_session(&session).await?;
        self.registry.refresh(&session).await;
        self.broadcast(
            &session.id,
            ServerMessage::GameStarted {
                session: SessionInfo::from(&session),
            },
        )
        .await;
        tracing::info!(
            "Session {} started with {} players",
            session.code,
            session.players.len()
        );

        let engine = self.engine_for(&session.id).await;
        engine.start_round(self).await
    }

    pub async fn advance_round(self: &Arc<Self>, ctx: &ConnectionContext) -> GameResult<Round> {
        let found = self.current_session_of(&ctx.user_id).await?;
        let _guard = self.registry.lock(&found.id).await;
        let session = self.load_session(&found.id).await?;

        if !session.is_host(&ctx.user_id) {
            return Err(GameError::Unauthorized(
                "Only the host can advance rounds".to_string(),
            ));
        }
        if session.state != SessionState::Playing {
            return Err(GameError::invalid_state("Game is not in progress"));
        }
        if !session.rounds_remaining() {
            return Err(GameError::invalid_state("All rounds have been played"));
        }

        let engine = self.engine_for(&session.id).await;
        engine.start_round(self).await
    }

    pub async fn end_game(&self, ctx: &ConnectionContext) -> GameResult<()> {
        let found = self.current_session_of(&ctx.user_id).await?;
        let _guard = self.registry.lock(&found.id).await;
        let session = self.load_session(&found.id).await?;

        if !session.is_host(&ctx.user_id) {
            return Err(GameError::Unauthorized(
                "Only the host can end the game".to_string(),
            ));
        }

        match session.state {
            SessionState::Finished => Err(GameError::invalid_state("Game has already finished")),
            SessionState::Waiting if session.round_ids.is_empty() => {
                self.delete_session(&session).await
            }
            _ => {
                tracing::info!("Host ended session {}", session.code);
                self.finish_session(session, FinishReason::EndedByHost, None)
                    .await
            }
        }
    }

    pub async fn submit_entry(
        self: &Arc<Self>,
        ctx: &ConnectionContext,
        chosen_prompt_ref: PromptId,
        captions: Vec<String>,
    ) -> GameResult<Submission> {
        let found = self.current_session_of(&ctx.user_id).await?;
        let _guard = self.registry.lock(&found.id).await;
        let engine = self
            .existing_engine(&found.id)
            .await
            .ok_or_else(|| GameError::invalid_state("Game is not in progress"))?;
        engine
            .submit_entry(self, &ctx.user_id, chosen_prompt_ref, captions)
            .await
    }

    pub async fn submit_ranking(
        self: &Arc<Self>,
        ctx: &ConnectionContext,
        ranked_submission_ids: Vec<SubmissionId>,
    ) -> GameResult<()> {
        let found = self.current_session_of(&ctx.user_id).await?;
        let _guard = self.registry.lock(&found.id).await;
        let engine = self
            .existing_engine(&found.id)
            .await
            .ok_or_else(|| GameError::invalid_state("Game is not in progress"))?;
        engine
            .submit_ranking(self, &ctx.user_id, ranked_submission_ids)
            .await
    }

    /// Drop a closed connection. The player stays in their session and can rejoin.
    pub async fn disconnect(&self, connection_id: &str) {
        let sessions = self.registry.leave_all(connection_id).await;
        self.hub.unregister(connection_id).await;
        for session_id in sessions {
            tracing::debug!("Connection {} detached from session {}", connection_id, session_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::transport::Outbound;
    use std::time::Duration;

    fn ctx(n: usize) -> ConnectionContext {
        ConnectionContext {
            connection_id: format!("conn{}", n),
            user_id: format!("user{}", n),
            username: format!("Player{}", n),
        }
    }

    async fn connect(state: &AppState, n: usize) -> (ConnectionContext, Outbound) {
        let c = ctx(n);
        let rx = state.hub.register(&c.connection_id).await;
        state.ensure_user(&c.user_id, &c.username).await.unwrap();
        (c, rx)
    }

    fn drain(rx: &mut Outbound) -> Vec<ServerMessage> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            out.push(msg);
        }
        out
    }

    #[test]
    fn test_session_code_alphabet() {
        let code = generate_session_code();
        assert_eq!(code.len(), CODE_LENGTH);
        assert!(code.bytes().all(|b| CODE_CHARS.contains(&b)));
    }

    #[tokio::test]
    async fn test_create_and_join() {
        let state = Arc::new(AppState::in_memory(AppConfig::default()));
        let (host, mut host_rx) = connect(&state, 0).await;
        let (guest, _guest_rx) = connect(&state, 1).await;

        let session = state.create_session(&host).await.unwrap();
        let joined = state.join_session(&guest, &session.code.to_lowercase()).await.unwrap();

        assert_eq!(joined.players.len(), 2);
        assert!(matches!(
            drain(&mut host_rx).as_slice(),
            [ServerMessage::PlayerJoined { username, .. }] if username == "Player1"
        ));
        let entry = state.registry.get(&session.id).await.unwrap();
        assert_eq!(entry.connections.len(), 2);
    }

    #[tokio::test]
    async fn test_cannot_create_while_in_active_session() {
        let state = Arc::new(AppState::in_memory(AppConfig::default()));
        let (host, _rx) = connect(&state, 0).await;
        state.create_session(&host).await.unwrap();

        let second = state.create_session(&host).await;
        assert!(matches!(second, Err(GameError::InvalidState(_))));
    }

    #[tokio::test]
    async fn test_active_session_check_survives_disconnect() {
        let state = Arc::new(AppState::in_memory(AppConfig::default()));
        let (host, _a) = connect(&state, 0).await;
        let (guest, _b) = connect(&state, 1).await;
        let session = state.create_session(&host).await.unwrap();
        state.join_session(&guest, &session.code).await.unwrap();

        // Answered from the live registry snapshot
        assert!(state.registry.get(&session.id).await.is_some());
        assert!(matches!(
            state.create_session(&guest).await,
            Err(GameError::InvalidState(_))
        ));

        // No live entry left: answered from the store
        state.disconnect(&host.connection_id).await;
        state.disconnect(&guest.connection_id).await;
        assert!(state.registry.get(&session.id).await.is_none());
        assert!(matches!(
            state.create_session(&guest).await,
            Err(GameError::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn test_join_unknown_code() {
        let state = Arc::new(AppState::in_memory(AppConfig::default()));
        let (guest, _rx) = connect(&state, 1).await;
        let result = state.join_session(&guest, "ZZZZZ").await;
        assert!(matches!(result, Err(GameError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_join_full_session() {
        let config = AppConfig {
            max_players: 2,
            ..AppConfig::default()
        };
        let state = Arc::new(AppState::in_memory(config));
        let (host, _a) = connect(&state, 0).await;
        let (p1, _b) = connect(&state, 1).await;
        let (p2, _c) = connect(&state, 2).await;

        let session = state.create_session(&host).await.unwrap();
        state.join_session(&p1, &session.code).await.unwrap();
        let result = state.join_session(&p2, &session.code).await;
        assert!(matches!(result, Err(GameError::InvalidState(msg)) if msg.contains("full")));
    }

    #[tokio::test]
    async fn test_last_player_leaving_waiting_session_deletes_it() {
        let state = Arc::new(AppState::in_memory(AppConfig::default()));
        let (host, _rx) = connect(&state, 0).await;
        let session = state.create_session(&host).await.unwrap();

        state.leave_session(&host).await.unwrap();

        assert!(state.repo.get_session(&session.id).await.unwrap().is_none());
        assert!(state.registry.get(&session.id).await.is_none());
        let user = state.repo.get_user(&host.user_id).await.unwrap().unwrap();
        assert!(user.current_session.is_none());
    }

    #[tokio::test]
    async fn test_host_leaving_hands_over() {
        let state = Arc::new(AppState::in_memory(AppConfig::default()));
        let (host, _a) = connect(&state, 0).await;
        let (guest, mut guest_rx) = connect(&state, 1).await;
        let session = state.create_session(&host).await.unwrap();
        state.join_session(&guest, &session.code).await.unwrap();

        state.leave_session(&host).await.unwrap();

        let stored = state.repo.get_session(&session.id).await.unwrap().unwrap();
        assert_eq!(stored.host_id, guest.user_id);
        assert!(drain(&mut guest_rx).iter().any(|m| matches!(
            m,
            ServerMessage::PlayerLeft { host_id, .. } if *host_id == guest.user_id
        )));
    }

    #[tokio::test]
    async fn test_remove_player_is_host_only() {
        let state = Arc::new(AppState::in_memory(AppConfig::default()));
        let (host, _a) = connect(&state, 0).await;
        let (guest, mut guest_rx) = connect(&state, 1).await;
        let session = state.create_session(&host).await.unwrap();
        state.join_session(&guest, &session.code).await.unwrap();

        let by_guest = state.remove_player(&guest, "Player0").await;
        assert!(matches!(by_guest, Err(GameError::Unauthorized(_))));
        let self_removal = state.remove_player(&host, "Player0").await;
        assert!(matches!(self_removal, Err(GameError::InvalidInput(_))));

        state.remove_player(&host, "Player1").await.unwrap();
        let stored = state.repo.get_session(&session.id).await.unwrap().unwrap();
        assert_eq!(stored.players.len(), 1);
        assert!(drain(&mut guest_rx)
            .iter()
            .any(|m| matches!(m, ServerMessage::RemovedFromSession { .. })));
    }

    #[tokio::test]
    async fn test_start_game_needs_two_players() {
        let state = Arc::new(AppState::in_memory(AppConfig::default()));
        let (host, _a) = connect(&state, 0).await;
        state.create_session(&host).await.unwrap();

        let result = state.start_game(&host).await;
        assert!(matches!(result, Err(GameError::InvalidState(_))));
    }

    #[tokio::test]
    async fn test_rejoin_replays_submission_phase() {
        let state = Arc::new(AppState::in_memory(AppConfig::default()));
        let (host, _a) = connect(&state, 0).await;
        let (guest, _b) = connect(&state, 1).await;
        let session = state.create_session(&host).await.unwrap();
        state.join_session(&guest, &session.code).await.unwrap();
        state.start_game(&host).await.unwrap();

        state.disconnect(&guest.connection_id).await;
        let reconnected = ConnectionContext {
            connection_id: "conn-new".to_string(),
            ..guest.clone()
        };
        let _new_rx = state.hub.register(&reconnected.connection_id).await;
        let snapshot = state.rejoin_session(&reconnected).await.unwrap();

        match snapshot {
            RejoinSnapshot::Submitting {
                prompts,
                has_submitted,
                ..
            } => {
                assert_eq!(prompts.len(), 6);
                assert!(!has_submitted);
            }
            other => panic!("unexpected snapshot {:?}", other),
        }
        let stored = state.repo.get_session(&session.id).await.unwrap().unwrap();
        assert_eq!(
            stored.player(&guest.user_id).unwrap().connection_id,
            "conn-new"
        );
        state.end_game(&host).await.unwrap();
    }

    #[tokio::test]
    async fn test_rejoin_during_judging_keeps_entry_order() {
        let state = Arc::new(AppState::in_memory(AppConfig::default()));
        let mut players = Vec::new();
        for n in 0..4 {
            players.push(connect(&state, n).await);
        }
        let session = state.create_session(&players[0].0).await.unwrap();
        for (ctx, _) in &players[1..] {
            state.join_session(ctx, &session.code).await.unwrap();
        }
        let round = state.start_game(&players[0].0).await.unwrap();
        for (ctx, _) in &players {
            let prompt = round.player_prompts[&ctx.user_id][0].clone();
            state
                .submit_entry(ctx, prompt, vec![format!("by {}", ctx.username)])
                .await
                .unwrap();
        }

        let (guest, guest_rx) = &mut players[3];
        let broadcast_order = loop {
            let msg = tokio::time::timeout(Duration::from_secs(2), guest_rx.recv())
                .await
                .expect("judging_started")
                .unwrap();
            if let ServerMessage::JudgingStarted { entries, .. } = msg {
                break entries.into_iter().map(|e| e.id).collect::<Vec<_>>();
            }
        };

        let reconnected = ConnectionContext {
            connection_id: "conn-new".to_string(),
            ..guest.clone()
        };
        let _new_rx = state.hub.register(&reconnected.connection_id).await;
        match state.rejoin_session(&reconnected).await.unwrap() {
            RejoinSnapshot::Judging {
                entries,
                has_judged,
                ..
            } => {
                let rejoin_order: Vec<_> = entries.into_iter().map(|e| e.id).collect();
                assert_eq!(rejoin_order, broadcast_order);
                assert!(!has_judged);
            }
            other => panic!("unexpected snapshot {:?}", other),
        }
        state.end_game(&players[0].0).await.unwrap();
    }

    #[tokio::test]
    async fn test_rejoin_finished_game_clears_reference() {
        let state = Arc::new(AppState::in_memory(AppConfig::default()));
        let (host, _a) = connect(&state, 0).await;
        let (guest, _b) = connect(&state, 1).await;
        let session = state.create_session(&host).await.unwrap();
        state.join_session(&guest, &session.code).await.unwrap();
        state.start_game(&host).await.unwrap();
        state.end_game(&host).await.unwrap();

        // Simulate a stale reference left behind
        state
            .set_current_session(&guest.user_id, &guest.username, &session.id)
            .await
            .unwrap();
        let result = state.rejoin_session(&guest).await;
        assert!(matches!(result, Err(GameError::InvalidState(_))));
        let user = state.repo.get_user(&guest.user_id).await.unwrap().unwrap();
        assert!(user.current_session.is_none());
    }

    #[tokio::test]
    async fn test_end_game_in_lobby_deletes_session() {
        let state = Arc::new(AppState::in_memory(AppConfig::default()));
        let (host, _a) = connect(&state, 0).await;
        let (guest, mut guest_rx) = connect(&state, 1).await;
        let session = state.create_session(&host).await.unwrap();
        state.join_session(&guest, &session.code).await.unwrap();

        state.end_game(&host).await.unwrap();

        assert!(state.repo.get_session(&session.id).await.unwrap().is_none());
        assert!(drain(&mut guest_rx)
            .iter()
            .any(|m| matches!(m, ServerMessage::SessionDeleted { .. })));
    }

    #[tokio::test]
    async fn test_end_game_mid_round_cancels_engine() {
        let state = Arc::new(AppState::in_memory(AppConfig::default()));
        let (host, _a) = connect(&state, 0).await;
        let (guest, _b) = connect(&state, 1).await;
        let session = state.create_session(&host).await.unwrap();
        state.join_session(&guest, &session.code).await.unwrap();
        let round = state.start_game(&host).await.unwrap();

        state.end_game(&host).await.unwrap();

        let stored = state.repo.get_session(&session.id).await.unwrap().unwrap();
        assert_eq!(stored.state, SessionState::Finished);
        assert!(state.existing_engine(&session.id).await.is_none());
        // The in-flight round keeps its status
        let round = state.repo.get_round(&round.id).await.unwrap().unwrap();
        assert_eq!(round.status, RoundStatus::Submitting);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timers_stay_quiet_after_end_game() {
        let mut config = AppConfig::default();
        config.session_defaults.submission_window_ms = 1_000;
        config.judging_window = Duration::from_millis(1_000);
        let state = Arc::new(AppState::in_memory(config));
        let (host, mut host_rx) = connect(&state, 0).await;
        let (guest, mut guest_rx) = connect(&state, 1).await;
        let session = state.create_session(&host).await.unwrap();
        state.join_session(&guest, &session.code).await.unwrap();
        let round = state.start_game(&host).await.unwrap();

        state.end_game(&host).await.unwrap();
        drain(&mut host_rx);
        drain(&mut guest_rx);

        tokio::time::sleep(Duration::from_secs(10)).await;
        tokio::task::yield_now().await;

        let round = state.repo.get_round(&round.id).await.unwrap().unwrap();
        assert_eq!(round.status, RoundStatus::Submitting);
        let stored = state.repo.get_session(&session.id).await.unwrap().unwrap();
        assert_eq!(stored.state, SessionState::Finished);

        let host_msgs = drain(&mut host_rx);
        let guest_msgs = drain(&mut guest_rx);
        for msg in host_msgs.iter().chain(guest_msgs.iter()) {
            assert!(
                !matches!(
                    msg,
                    ServerMessage::JudgingStarted { .. }
                        | ServerMessage::MissedSubmission { .. }
                        | ServerMessage::RoundError { .. }
                ),
                "unexpected {:?} after end_game",
                msg
            );
        }
    }

    #[tokio::test]
    async fn test_join_finished_session_by_code_is_rejected() {
        let state = Arc::new(AppState::in_memory(AppConfig::default()));
        let (host, _a) = connect(&state, 0).await;
        let (guest, _b) = connect(&state, 1).await;
        let session = state.create_session(&host).await.unwrap();
        state.join_session(&guest, &session.code).await.unwrap();
        state.start_game(&host).await.unwrap();
        state.end_game(&host).await.unwrap();

        let returning = ConnectionContext {
            connection_id: "conn1-new".to_string(),
            ..guest.clone()
        };
        let result = state.join_session(&returning, &session.code).await;
        assert!(matches!(result, Err(GameError::InvalidState(msg)) if msg.contains("finished")));

        assert!(state.registry.get(&session.id).await.is_none());
        let stored = state.repo.get_session(&session.id).await.unwrap().unwrap();
        assert_eq!(stored.player(&guest.user_id).unwrap().connection_id, guest.connection_id);
    }

    #[tokio::test]
    async fn test_disconnect_keeps_player() {
        let state = Arc::new(AppState::in_memory(AppConfig::default()));
        let (host, _a) = connect(&state, 0).await;
        let session = state.create_session(&host).await.unwrap();

        state.disconnect(&host.connection_id).await;

        let stored = state.repo.get_session(&session.id).await.unwrap().unwrap();
        assert!(stored.has_player(&host.user_id));
        assert!(state.registry.get(&session.id).await.is_none());
    }
}
