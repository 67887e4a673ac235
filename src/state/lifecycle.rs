use super::AppState;
use crate::error::GameResult;
use crate::protocol::{FinishReason, RoundResultInfo, ServerMessage};
use crate::types::*;

impl AppState {
    /// Load a user's profile, creating it on first sight and keeping the
    /// username current
    pub async fn ensure_user(&self, user_id: &str, username: &str) -> GameResult<UserProfile> {
        match self.repo.get_user(user_id).await? {
            Some(mut user) => {
                if user.username != username {
                    user.username = username.to_string();
                    self.repo.save_user(&user).await?;
                }
                Ok(user)
            }
            None => {
                let user = UserProfile {
                    user_id: user_id.to_string(),
                    username: username.to_string(),
                    current_session: None,
                };
                self.repo.save_user(&user).await?;
                tracing::info!("New user {} ({})", username, user_id);
                Ok(user)
            }
        }
    }

    pub(crate) async fn set_current_session(&self, user_id: &str, username: &str, session_id: &str) -> GameResult<()> {
        let mut user = self.ensure_user(user_id, username).await?;
        user.current_session = Some(session_id.to_string());
        self.repo.save_user(&user).await?;
        Ok(())
    }

    /// Mark a session finished, announce it and release everything attached
    /// to it. Caller holds the session lock.
    pub async fn finish_session(
        &self,
        mut session: Session,
        reason: FinishReason,
        round_results: Option<Vec<RoundResultInfo>>,
    ) -> GameResult<()> {
        session.state = SessionState::Finished;
        self.repo.save_session(&session).await?;

        tracing::info!(
            "Session {} finished ({:?}) after {} round(s)",
            session.id,
            reason,
            session.current_round_number
        );

        self.broadcast(
            &session.id,
            ServerMessage::GameFinished {
                leaderboard: session.leaderboard.clone(),
                round_results,
                reason,
            },
        )
        .await;

        for player in &session.players {
            self.repo
                .clear_current_session(&player.user_id, &session.id)
                .await?;
        }
        self.teardown(&session.id).await;
        Ok(())
    }

    /// Delete a session that never got going. Caller holds the session lock.
    pub async fn delete_session(&self, session: &Session) -> GameResult<()> {
        self.broadcast(
            &session.id,
            ServerMessage::SessionDeleted {
                session_id: session.id.clone(),
            },
        )
        .await;

        for player in &session.players {
            self.repo
                .clear_current_session(&player.user_id, &session.id)
                .await?;
        }
        self.repo.delete_session(&session.id).await?;
        self.teardown(&session.id).await;
        tracing::info!("Session {} ({}) deleted", session.id, session.code);
        Ok(())
    }

    /// Drop the registry entry, channel memberships and engine of a session
    async fn teardown(&self, session_id: &str) {
        if let Some(entry) = self.registry.remove(session_id).await {
            for connection_id in &entry.connections {
                self.transport()
                    .leave_channel(session_id, connection_id)
                    .await;
            }
        }
        self.drop_engine(session_id).await;
        self.bus.unsubscribe_all(&session_id.to_string()).await;
    }

    /// Reconcile persisted sessions after a restart. Timers do not survive a
    /// restart, so games that were running are finished as interrupted.
    pub async fn recover(&self) -> GameResult<usize> {
        let mut interrupted = 0;
        for session in self.repo.list_sessions().await? {
            if session.state != SessionState::Playing {
                continue;
            }
            let _guard = self.registry.lock(&session.id).await;
            self.finish_session(session, FinishReason::Interrupted, None)
                .await?;
            interrupted += 1;
        }
        if interrupted > 0 {
            tracing::warn!("Finished {} session(s) interrupted by restart", interrupted);
        }
        Ok(interrupted)
    }
}
