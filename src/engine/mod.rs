//! Round engine
//!
//! Drives one playing session through its rounds. Each round goes
//! `submitting -> judging -> completed`; every phase ends either when its
//! timer fires or when the matching early-completion signal is published,
//! whichever gets there first. The loser finds the round already moved on and
//! does nothing.
//!
//! Command-side operations (`start_round`, `submit_entry`, `submit_ranking`)
//! expect the caller to hold the session lock. Phase resolutions run from
//! timer and listener tasks and take the lock themselves.

mod judge;
mod submit;

pub(crate) use judge::result_infos;

use crate::clock::TimerHandle;
use crate::error::{GameError, GameResult};
use crate::events::Signal;
use crate::protocol::ServerMessage;
use crate::state::AppState;
use crate::types::*;
use rand::seq::SliceRandom;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// What ended a phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Timeout,
    Early,
}

pub struct RoundEngine {
    session_id: SessionId,
    /// Timer of the phase currently running, if any
    timer: Mutex<Option<TimerHandle>>,
}

impl RoundEngine {
    pub fn new(session_id: SessionId) -> Self {
        Self {
            session_id,
            timer: Mutex::new(None),
        }
    }

    /// Start the next round. Caller holds the session lock.
    pub async fn start_round(self: &Arc<Self>, state: &Arc<AppState>) -> GameResult<Round> {
        let mut session = self.playing_session(state).await?;

        if !session.rounds_remaining() {
            return Err(GameError::invalid_state("All rounds have been played"));
        }
        if let Some(round_id) = session.current_round_id() {
            if let Some(current) = state.repo.get_round(round_id).await? {
                if current.status.is_in_flight() {
                    return Err(GameError::invalid_state(format!(
                        "Round {} is still in progress",
                        current.round_number
                    )));
                }
            }
        }

        let pool_size = state.config.pool_size_for(session.players.len());
        let prompt_set = state.catalog.random_prompts(pool_size).await?;

        session.current_round_number += 1;
        let now = chrono::Utc::now();
        let window = Duration::from_millis(session.settings.submission_window_ms);
        let deadline = now + chrono::Duration::milliseconds(session.settings.submission_window_ms as i64);

        let player_prompts = deal_prompts(&session, &prompt_set, state.config.prompts_per_player);
        let round = Round {
            id: ulid::Ulid::new().to_string(),
            session_id: session.id.clone(),
            round_number: session.current_round_number,
            prompt_set,
            player_prompts,
            submissions: Vec::new(),
            judgements: Vec::new(),
            status: RoundStatus::Submitting,
            start_time: now.to_rfc3339(),
            submission_deadline: deadline.to_rfc3339(),
            judging_deadline: None,
        };

        state.repo.insert_round(round.clone()).await?;
        session.round_ids.push(round.id.clone());
        state.repo.save_session(&session).await?;
        state.registry.refresh(&session).await;

        tracing::info!(
            "Session {} started round {}/{} with {} prompts",
            session.id,
            round.round_number,
            session.settings.round_count,
            round.prompt_set.len()
        );

        for player in &session.players {
            state
                .transport()
                .send_to(
                    &player.connection_id,
                    ServerMessage::RoundStarted {
                        round_number: round.round_number,
                        prompts: round.prompts_for(&player.user_id),
                        deadline: round.submission_deadline.clone(),
                    },
                )
                .await;
        }

        self.arm_submission_phase(state, &round.id, window).await;
        Ok(round)
    }

    /// Stop all pending work. Later resolutions are no-ops because the
    /// session is no longer playing.
    pub async fn cancel(&self, state: &AppState) {
        self.clear_timer().await;
        state.bus.unsubscribe_all(&self.session_id).await;
        tracing::debug!("Engine for session {} cancelled", self.session_id);
    }

    async fn set_timer(&self, handle: TimerHandle) {
        if let Some(previous) = self.timer.lock().await.replace(handle) {
            previous.cancel();
        }
    }

    async fn clear_timer(&self) {
        if let Some(handle) = self.timer.lock().await.take() {
            handle.cancel();
        }
    }

    /// Race the phase timer against the early-completion signal
    async fn arm_phase<F, Fut>(
        self: &Arc<Self>,
        state: &Arc<AppState>,
        round_id: &RoundId,
        signal: Signal,
        window: Duration,
        resolve: F,
    ) where
        F: Fn(Arc<Self>, Arc<AppState>, RoundId, Trigger) -> Fut + Send + Sync + Copy + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let early = state.bus.subscribe_once(&self.session_id, signal).await;

        let timer = state.clock.schedule(
            window,
            resolve(self.clone(), state.clone(), round_id.clone(), Trigger::Timeout),
        );
        self.set_timer(timer).await;

        let engine = self.clone();
        let state = state.clone();
        let round_id = round_id.clone();
        tokio::spawn(async move {
            match early.await {
                Ok(published) if published == round_id => {
                    resolve(engine, state, round_id, Trigger::Early).await;
                }
                Ok(published) => {
                    tracing::debug!(
                        "Ignoring {:?} for stale round {} (expected {})",
                        signal,
                        published,
                        round_id
                    );
                }
                // Unsubscribed: the timer won or the game ended
                Err(_) => {}
            }
        });
    }

    async fn arm_submission_phase(self: &Arc<Self>, state: &Arc<AppState>, round_id: &RoundId, window: Duration) {
        self.arm_phase(
            state,
            round_id,
            Signal::AllSubmitted,
            window,
            |engine, state, round_id, trigger| async move {
                engine
                    .resolve_submission_phase(&state, &round_id, trigger)
                    .await;
            },
        )
        .await;
    }

    async fn arm_judging_phase(self: &Arc<Self>, state: &Arc<AppState>, round_id: &RoundId, window: Duration) {
        self.arm_phase(
            state,
            round_id,
            Signal::AllJudged,
            window,
            |engine, state, round_id, trigger| async move {
                engine.resolve_judging_phase(&state, &round_id, trigger).await;
            },
        )
        .await;
    }

    async fn playing_session(&self, state: &AppState) -> GameResult<Session> {
        let session = state
            .repo
            .get_session(&self.session_id)
            .await?
            .ok_or_else(|| GameError::not_found("Session"))?;
        if session.state != SessionState::Playing {
            return Err(GameError::invalid_state("Game is not in progress"));
        }
        Ok(session)
    }

    async fn current_round(&self, state: &AppState, session: &Session) -> GameResult<Round> {
        let round_id = session
            .current_round_id()
            .ok_or_else(|| GameError::invalid_state("No round has started yet"))?;
        state
            .repo
            .get_round(round_id)
            .await?
            .ok_or_else(|| GameError::not_found("Round"))
    }

    /// Log a failed resolution and tell the room
    async fn report_failure(&self, state: &AppState, phase: &str, err: GameError) {
        tracing::error!(
            "Failed to resolve {} phase for session {}: {}",
            phase,
            self.session_id,
            err
        );
        state
            .broadcast(
                &self.session_id,
                ServerMessage::RoundError {
                    msg: format!("Error processing {}", phase),
                },
            )
            .await;
    }
}

/// Hand each player a private random subset of the round's prompts
fn deal_prompts(
    session: &Session,
    prompt_set: &[PromptDescriptor],
    per_player: usize,
) -> HashMap<UserId, Vec<PromptId>> {
    let ids: Vec<PromptId> = prompt_set.iter().map(|p| p.id.clone()).collect();
    let take = per_player.min(ids.len());
    let mut rng = rand::rng();

    session
        .players
        .iter()
        .map(|player| {
            let mut mine = ids.clone();
            mine.shuffle(&mut rng);
            mine.truncate(take);
            (player.user_id.clone(), mine)
        })
        .collect()
}

fn deadline_passed(deadline: &str) -> bool {
    chrono::DateTime::parse_from_rfc3339(deadline)
        .map(|d| chrono::Utc::now() > d)
        .unwrap_or(false)
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::config::AppConfig;
    use crate::transport::Outbound;

    pub struct Table {
        pub state: Arc<AppState>,
        pub session: Session,
        pub engine: Arc<RoundEngine>,
        pub inboxes: HashMap<UserId, Outbound>,
    }

    /// A playing session with `players` members, all connected to the hub
    pub async fn playing_table(config: AppConfig, players: usize) -> Table {
        let state = Arc::new(AppState::in_memory(config));
        let session_id = ulid::Ulid::new().to_string();
        let mut session = Session {
            id: session_id.clone(),
            code: "TESTS".to_string(),
            host_id: "p0".to_string(),
            players: Vec::new(),
            state: SessionState::Playing,
            current_round_number: 0,
            settings: state.config.session_defaults.clone(),
            round_ids: Vec::new(),
            leaderboard: Vec::new(),
            created_at: chrono::Utc::now().to_rfc3339(),
            updated_at: chrono::Utc::now().to_rfc3339(),
        };

        let mut inboxes = HashMap::new();
        for i in 0..players {
            let user_id = format!("p{}", i);
            let connection_id = format!("c{}", i);
            inboxes.insert(user_id.clone(), state.hub.register(&connection_id).await);
            state.transport().join_channel(&session_id, &connection_id).await;
            session.players.push(SessionPlayer {
                user_id: user_id.clone(),
                username: format!("Player {}", i),
                connection_id: connection_id.clone(),
            });
            state
                .registry
                .join(&session_id, &connection_id, session.clone())
                .await;
        }
        state.repo.insert_session(session.clone()).await.unwrap();
        let engine = state.engine_for(&session_id).await;

        Table {
            state,
            session,
            engine,
            inboxes,
        }
    }

    pub fn drain(rx: &mut Outbound) -> Vec<ServerMessage> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            out.push(msg);
        }
        out
    }

    impl Table {
        pub async fn round(&self, id: &str) -> Round {
            self.state.repo.get_round(id).await.unwrap().unwrap()
        }

        pub async fn session(&self) -> Session {
            self.state
                .repo
                .get_session(&self.session.id)
                .await
                .unwrap()
                .unwrap()
        }

        pub async fn start_round(&self) -> Round {
            let _guard = self.state.registry.lock(&self.session.id).await;
            self.engine.start_round(&self.state).await.unwrap()
        }

        pub async fn submit(&self, user: &str, round: &Round) -> GameResult<Submission> {
            let _guard = self.state.registry.lock(&self.session.id).await;
            let prompt = round.player_prompts[user][0].clone();
            self.engine
                .submit_entry(&self.state, user, prompt, vec![format!("caption by {}", user)])
                .await
        }

        pub async fn rank(&self, user: &str, order: Vec<SubmissionId>) -> GameResult<()> {
            let _guard = self.state.registry.lock(&self.session.id).await;
            self.engine.submit_ranking(&self.state, user, order).await
        }

        /// Wait until background resolution moved the round to `status`
        pub async fn wait_for_status(&self, round_id: &str, status: RoundStatus) -> Round {
            for _ in 0..200 {
                let round = self.round(round_id).await;
                if round.status == status {
                    return round;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            panic!("round {} never reached {:?}", round_id, status);
        }

        pub fn messages(&mut self, user: &str) -> Vec<ServerMessage> {
            drain(self.inboxes.get_mut(user).unwrap())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use crate::config::AppConfig;

    #[tokio::test]
    async fn test_start_round_deals_private_prompts() {
        let mut table = playing_table(AppConfig::default(), 3).await;
        let round = table.start_round().await;

        assert_eq!(round.round_number, 1);
        assert_eq!(round.status, RoundStatus::Submitting);
        assert_eq!(round.prompt_set.len(), 12);
        for user in ["p0", "p1", "p2"] {
            let mine = &round.player_prompts[user];
            assert_eq!(mine.len(), 6);
            assert!(mine.iter().all(|id| round.prompt(id).is_some()));

            let msgs = table.messages(user);
            assert!(matches!(
                msgs.as_slice(),
                [ServerMessage::RoundStarted { round_number: 1, prompts, .. }] if prompts.len() == 6
            ));
        }

        let session = table.session().await;
        assert_eq!(session.current_round_number, 1);
        assert_eq!(session.round_ids, vec![round.id.clone()]);
    }

    #[tokio::test]
    async fn test_start_round_rejects_round_in_flight() {
        let table = playing_table(AppConfig::default(), 2).await;
        table.start_round().await;

        let _guard = table.state.registry.lock(&table.session.id).await;
        let result = table.engine.start_round(&table.state).await;
        assert!(matches!(result, Err(GameError::InvalidState(_))));
        assert_eq!(table.session().await.current_round_number, 1);
    }

    #[tokio::test]
    async fn test_round_number_never_exceeds_round_count() {
        let mut config = AppConfig::default();
        config.session_defaults.round_count = 1;
        let table = playing_table(config, 2).await;
        let round = table.start_round().await;

        // Nobody submits: resolve both phases by hand
        table
            .engine
            .resolve_submission_phase(&table.state, &round.id, Trigger::Timeout)
            .await;
        let session = table.session().await;
        assert_eq!(session.state, SessionState::Finished);

        let _guard = table.state.registry.lock(&table.session.id).await;
        assert!(table.engine.start_round(&table.state).await.is_err());
        assert_eq!(table.session().await.current_round_number, 1);
    }

    #[tokio::test]
    async fn test_start_round_requires_playing_session() {
        let table = playing_table(AppConfig::default(), 2).await;
        let mut session = table.session().await;
        session.state = SessionState::Finished;
        table.state.repo.save_session(&session).await.unwrap();

        let _guard = table.state.registry.lock(&table.session.id).await;
        let result = table.engine.start_round(&table.state).await;
        assert!(matches!(result, Err(GameError::InvalidState(_))));
    }

    #[tokio::test]
    async fn test_pool_grows_with_player_count() {
        let table = playing_table(AppConfig::default(), 8).await;
        let round = table.start_round().await;
        assert_eq!(round.prompt_set.len(), 16);
    }

    #[test]
    fn test_deadline_passed() {
        let past = (chrono::Utc::now() - chrono::Duration::seconds(5)).to_rfc3339();
        let future = (chrono::Utc::now() + chrono::Duration::seconds(5)).to_rfc3339();
        assert!(deadline_passed(&past));
        assert!(!deadline_passed(&future));
        assert!(!deadline_passed("garbage"));
    }
}
