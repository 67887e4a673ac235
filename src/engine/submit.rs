use super::*;
use crate::protocol::AnonymizedEntry;
use crate::repository::{Guarded, RoundUpdate};

impl RoundEngine {
    /// Accept a player's entry for the current round. Caller holds the session lock.
    pub async fn submit_entry(
        &self,
        state: &Arc<AppState>,
        user_id: &str,
        chosen_prompt_ref: PromptId,
        captions: Vec<String>,
    ) -> GameResult<Submission> {
        let session = self.playing_session(state).await?;
        if !session.has_player(user_id) {
            return Err(GameError::Unauthorized(
                "You are not a player in this session".to_string(),
            ));
        }

        let round = self.current_round(state, &session).await?;
        if round.status != RoundStatus::Submitting {
            return Err(GameError::invalid_state("Submissions are closed for this round"));
        }
        if deadline_passed(&round.submission_deadline) {
            return Err(GameError::invalid_state("The submission window has ended"));
        }

        let offered = round
            .player_prompts
            .get(user_id)
            .is_some_and(|ids| ids.contains(&chosen_prompt_ref));
        if !offered {
            return Err(GameError::invalid_input(
                "Chosen prompt was not offered to you this round",
            ));
        }

        let captions = validate_captions(captions)?;

        if round.submission_by(user_id).is_some() {
            return Err(GameError::DuplicateAction(
                "You already submitted an entry this round".to_string(),
            ));
        }

        let submission = Submission {
            id: ulid::Ulid::new().to_string(),
            user_id: user_id.to_string(),
            chosen_prompt_ref,
            captions,
            score: 0,
            status: SubmissionStatus::Pending,
            submitted_at: chrono::Utc::now().to_rfc3339(),
        };

        let updated = match state
            .repo
            .update_round(&round.id, RoundUpdate::AddSubmission(submission.clone()))
            .await?
        {
            Some(Guarded::Applied(updated)) => updated,
            Some(Guarded::Duplicate) => {
                return Err(GameError::DuplicateAction(
                    "You already submitted an entry this round".to_string(),
                ))
            }
            Some(Guarded::StatusMismatch(_)) => {
                return Err(GameError::invalid_state("Submissions are closed for this round"))
            }
            None => return Err(GameError::not_found("Round")),
        };

        tracing::info!(
            "Session {} round {}: entry from {} ({}/{})",
            session.id,
            updated.round_number,
            user_id,
            updated.submissions.len(),
            session.players.len()
        );

        self.check_all_submitted(state, &session, &updated).await;
        Ok(submission)
    }

    /// Publish the early signal once every current player has an entry
    pub(crate) async fn check_all_submitted(&self, state: &AppState, session: &Session, round: &Round) {
        if round.status != RoundStatus::Submitting || session.players.is_empty() {
            return;
        }
        let everyone_in = session
            .players
            .iter()
            .all(|p| round.submission_by(&p.user_id).is_some());
        if everyone_in {
            state
                .bus
                .publish(&self.session_id, Signal::AllSubmitted, &round.id)
                .await;
        }
    }

    /// End the submission phase. Safe to call more than once: only the first
    /// call that finds the round still submitting has any effect.
    pub async fn resolve_submission_phase(self: &Arc<Self>, state: &Arc<AppState>, round_id: &RoundId, trigger: Trigger) {
        let _guard = state.registry.lock(&self.session_id).await;
        if let Err(e) = self.resolve_submission_locked(state, round_id, trigger).await {
            self.report_failure(state, "submissions", e).await;
        }
    }

    async fn resolve_submission_locked(
        self: &Arc<Self>,
        state: &Arc<AppState>,
        round_id: &RoundId,
        trigger: Trigger,
    ) -> GameResult<()> {
        let Some(session) = state.repo.get_session(&self.session_id).await? else {
            return Ok(());
        };
        if session.state != SessionState::Playing {
            tracing::debug!("Session {} no longer playing, skipping resolution", session.id);
            return Ok(());
        }

        let judging_window = state.config.judging_window;
        let judging_deadline = chrono::Utc::now()
            + chrono::Duration::milliseconds(judging_window.as_millis() as i64);

        let round = match state
            .repo
            .update_round(
                round_id,
                RoundUpdate::BeginJudging {
                    judging_deadline: judging_deadline.to_rfc3339(),
                },
            )
            .await?
        {
            Some(Guarded::Applied(round)) => round,
            Some(Guarded::StatusMismatch(status)) => {
                tracing::debug!(
                    "Round {} already {:?}, {:?} resolution is a no-op",
                    round_id,
                    status,
                    trigger
                );
                return Ok(());
            }
            Some(Guarded::Duplicate) => return Ok(()),
            None => return Err(GameError::not_found("Round")),
        };

        self.clear_timer().await;
        state.bus.unsubscribe(&self.session_id, Signal::AllSubmitted).await;

        tracing::info!(
            "Session {} round {} moved to judging ({:?}) with {} entries",
            session.id,
            round.round_number,
            trigger,
            round.submissions.len()
        );

        for player in &session.players {
            if round.submission_by(&player.user_id).is_none() {
                state
                    .transport()
                    .send_to(
                        &player.connection_id,
                        ServerMessage::MissedSubmission {
                            round_number: round.round_number,
                        },
                    )
                    .await;
            }
        }

        if round.submissions.is_empty() {
            tracing::info!("No entries in round {}, skipping judging", round.round_number);
            return self.resolve_judging_locked(state, round_id, Trigger::Early).await;
        }

        let entries = AnonymizedEntry::shuffled(&round);

        state
            .broadcast(
                &self.session_id,
                ServerMessage::JudgingStarted {
                    round_number: round.round_number,
                    entries,
                    deadline: judging_deadline.to_rfc3339(),
                    judging_window_ms: judging_window.as_millis() as u64,
                },
            )
            .await;

        self.arm_judging_phase(state, round_id, judging_window).await;
        Ok(())
    }
}

/// Trim captions and check count and length
fn validate_captions(captions: Vec<String>) -> GameResult<Vec<String>> {
    let captions: Vec<String> = captions.into_iter().map(|c| c.trim().to_string()).collect();

    if captions.len() < MIN_CAPTIONS || captions.len() > MAX_CAPTIONS {
        return Err(GameError::invalid_input(format!(
            "An entry needs between {} and {} captions",
            MIN_CAPTIONS, MAX_CAPTIONS
        )));
    }
    if captions.iter().any(|c| c.is_empty()) {
        return Err(GameError::invalid_input("Captions cannot be empty"));
    }
    if captions.iter().any(|c| c.chars().count() > MAX_CAPTION_CHARS) {
        return Err(GameError::invalid_input(format!(
            "Captions are limited to {} characters",
            MAX_CAPTION_CHARS
        )));
    }
    Ok(captions)
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;
    use crate::config::AppConfig;

    #[test]
    fn test_validate_captions() {
        assert_eq!(
            validate_captions(vec!["  hi ".to_string()]).unwrap(),
            vec!["hi".to_string()]
        );
        assert!(validate_captions(Vec::new()).is_err());
        assert!(validate_captions(vec!["a".to_string(); 7]).is_err());
        assert!(validate_captions(vec!["ok".to_string(), "   ".to_string()]).is_err());
        assert!(validate_captions(vec!["x".repeat(201)]).is_err());
        assert!(validate_captions(vec!["x".repeat(200)]).is_ok());
    }

    #[tokio::test]
    async fn test_duplicate_submission_is_rejected() {
        let table = playing_table(AppConfig::default(), 3).await;
        let round = table.start_round().await;

        table.submit("p0", &round).await.unwrap();
        let second = table.submit("p0", &round).await;
        assert!(matches!(second, Err(GameError::DuplicateAction(_))));

        let stored = table.round(&round.id).await;
        assert_eq!(stored.submissions.len(), 1);
    }

    #[tokio::test]
    async fn test_prompt_must_come_from_own_subset() {
        let table = playing_table(AppConfig::default(), 2).await;
        let round = table.start_round().await;

        let foreign = round
            .prompt_set
            .iter()
            .find(|p| !round.player_prompts["p0"].contains(&p.id))
            .map(|p| p.id.clone())
            .unwrap();

        let _guard = table.state.registry.lock(&table.session.id).await;
        let result = table
            .engine
            .submit_entry(&table.state, "p0", foreign, vec!["x".to_string()])
            .await;
        assert!(matches!(result, Err(GameError::InvalidInput(_))));
    }

    #[tokio::test]
    async fn test_non_member_cannot_submit() {
        let table = playing_table(AppConfig::default(), 2).await;
        let round = table.start_round().await;
        let prompt = round.player_prompts["p0"][0].clone();

        let _guard = table.state.registry.lock(&table.session.id).await;
        let result = table
            .engine
            .submit_entry(&table.state, "stranger", prompt, vec!["x".to_string()])
            .await;
        assert!(matches!(result, Err(GameError::Unauthorized(_))));
    }

    #[tokio::test]
    async fn test_all_submitted_moves_to_judging_early() {
        let mut table = playing_table(AppConfig::default(), 2).await;
        let round = table.start_round().await;
        table.messages("p0");
        table.messages("p1");

        table.submit("p0", &round).await.unwrap();
        table.submit("p1", &round).await.unwrap();

        let judged = table.wait_for_status(&round.id, RoundStatus::Judging).await;
        assert!(judged.judging_deadline.is_some());

        let msgs = table.messages("p1");
        let started: Vec<_> = msgs
            .iter()
            .filter(|m| matches!(m, ServerMessage::JudgingStarted { .. }))
            .collect();
        assert_eq!(started.len(), 1);
        if let ServerMessage::JudgingStarted { entries, judging_window_ms, .. } = started[0] {
            assert_eq!(entries.len(), 2);
            assert_eq!(*judging_window_ms, 60_000);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_notifies_only_non_submitters() {
        let mut table = playing_table(AppConfig::default(), 3).await;
        let round = table.start_round().await;
        table.submit("p0", &round).await.unwrap();
        for user in ["p0", "p1", "p2"] {
            table.messages(user);
        }

        tokio::time::sleep(Duration::from_millis(90_001)).await;
        table.wait_for_status(&round.id, RoundStatus::Judging).await;

        assert!(!table
            .messages("p0")
            .iter()
            .any(|m| matches!(m, ServerMessage::MissedSubmission { .. })));
        for user in ["p1", "p2"] {
            assert!(table
                .messages(user)
                .iter()
                .any(|m| matches!(m, ServerMessage::MissedSubmission { round_number: 1 })));
        }
    }

    #[tokio::test]
    async fn test_resolution_is_idempotent() {
        let mut table = playing_table(AppConfig::default(), 2).await;
        let round = table.start_round().await;
        table.submit("p0", &round).await.unwrap();
        table.messages("p0");

        // Timeout and early completion racing: both run, one transition
        tokio::join!(
            table
                .engine
                .resolve_submission_phase(&table.state, &round.id, Trigger::Timeout),
            table
                .engine
                .resolve_submission_phase(&table.state, &round.id, Trigger::Early),
        );

        let stored = table.round(&round.id).await;
        assert_eq!(stored.status, RoundStatus::Judging);
        let started = table
            .messages("p0")
            .into_iter()
            .filter(|m| matches!(m, ServerMessage::JudgingStarted { .. }))
            .count();
        assert_eq!(started, 1);
    }

    #[tokio::test]
    async fn test_submission_rejected_after_judging_started() {
        let table = playing_table(AppConfig::default(), 3).await;
        let round = table.start_round().await;
        table.submit("p0", &round).await.unwrap();
        table
            .engine
            .resolve_submission_phase(&table.state, &round.id, Trigger::Timeout)
            .await;

        let late = table.submit("p1", &round).await;
        assert!(matches!(late, Err(GameError::InvalidState(_))));
        assert_eq!(table.round(&round.id).await.submissions.len(), 1);
    }
}
