use super::*;
use crate::protocol::{FinishReason, RoundResultInfo};
use crate::repository::{Guarded, RoundUpdate};
use crate::scoring::{merge_into_leaderboard, score_round, SubmissionResult};
use std::collections::HashSet;

impl RoundEngine {
    /// Record a judge's ranking. A later ranking by the same judge replaces
    /// the earlier one. Caller holds the session lock.
    pub async fn submit_ranking(
        &self,
        state: &Arc<AppState>,
        judge_id: &str,
        ranked_submission_ids: Vec<SubmissionId>,
    ) -> GameResult<()> {
        let session = self.playing_session(state).await?;
        let round = self.current_round(state, &session).await?;
        if round.status != RoundStatus::Judging {
            return Err(GameError::invalid_state("This round is not being judged"));
        }
        if !session.has_player(judge_id) {
            return Err(GameError::Unauthorized(
                "Only players of this session can judge".to_string(),
            ));
        }
        if round
            .judging_deadline
            .as_deref()
            .is_some_and(deadline_passed)
        {
            return Err(GameError::invalid_state("The judging window has ended"));
        }
        if !is_permutation(&round, &ranked_submission_ids) {
            return Err(GameError::invalid_input(
                "Ranking must list every entry of the round exactly once",
            ));
        }

        let judgement = Judgement {
            judge_user_id: judge_id.to_string(),
            ranked_submission_ids,
        };
        let updated = match state
            .repo
            .update_round(&round.id, RoundUpdate::UpsertJudgement(judgement))
            .await?
        {
            Some(Guarded::Applied(updated)) => updated,
            Some(_) => return Err(GameError::invalid_state("This round is not being judged")),
            None => return Err(GameError::not_found("Round")),
        };

        tracing::info!(
            "Session {} round {}: ranking from {} ({} judgement(s))",
            session.id,
            updated.round_number,
            judge_id,
            updated.judgements.len()
        );

        self.check_all_judged(state, &session, &updated).await;
        Ok(())
    }

    /// Publish the early signal once every submitter still in the session has ranked
    pub(crate) async fn check_all_judged(&self, state: &AppState, session: &Session, round: &Round) {
        if round.status != RoundStatus::Judging {
            return;
        }
        if pending_judges(session, round).is_empty() {
            state
                .bus
                .publish(&self.session_id, Signal::AllJudged, &round.id)
                .await;
        }
    }

    /// Re-evaluate early completion after the player list shrank
    pub async fn players_changed(&self, state: &AppState, session: &Session) {
        let Ok(round) = self.current_round(state, session).await else {
            return;
        };
        match round.status {
            RoundStatus::Submitting => self.check_all_submitted(state, session, &round).await,
            RoundStatus::Judging => self.check_all_judged(state, session, &round).await,
            RoundStatus::Completed => {}
        }
    }

    /// End the judging phase. Safe to call more than once.
    pub async fn resolve_judging_phase(self: &Arc<Self>, state: &Arc<AppState>, round_id: &RoundId, trigger: Trigger) {
        let _guard = state.registry.lock(&self.session_id).await;
        if let Err(e) = self.resolve_judging_locked(state, round_id, trigger).await {
            self.report_failure(state, "judgements", e).await;
        }
    }

    pub(super) async fn resolve_judging_locked(
        &self,
        state: &Arc<AppState>,
        round_id: &RoundId,
        trigger: Trigger,
    ) -> GameResult<()> {
        let Some(mut session) = state.repo.get_session(&self.session_id).await? else {
            return Ok(());
        };
        if session.state != SessionState::Playing {
            tracing::debug!("Session {} no longer playing, skipping resolution", session.id);
            return Ok(());
        }

        let round = state
            .repo
            .get_round(round_id)
            .await?
            .ok_or_else(|| GameError::not_found("Round"))?;
        if round.status != RoundStatus::Judging {
            tracing::debug!(
                "Round {} already {:?}, {:?} resolution is a no-op",
                round_id,
                round.status,
                trigger
            );
            return Ok(());
        }

        let results = score_round(&round);
        let scores = results
            .iter()
            .map(|r| (r.submission_id.clone(), r.score))
            .collect();
        let round = match state
            .repo
            .update_round(round_id, RoundUpdate::Complete { scores })
            .await?
        {
            Some(Guarded::Applied(round)) => round,
            Some(_) => return Ok(()),
            None => return Err(GameError::not_found("Round")),
        };

        self.clear_timer().await;
        state.bus.unsubscribe(&self.session_id, Signal::AllJudged).await;

        for judge in pending_judges(&session, &round) {
            if let Some(player) = session.player(&judge) {
                state
                    .transport()
                    .send_to(
                        &player.connection_id,
                        ServerMessage::MissedJudging {
                            round_number: round.round_number,
                        },
                    )
                    .await;
            }
        }

        let mut usernames: HashMap<UserId, String> = session
            .players
            .iter()
            .map(|p| (p.user_id.clone(), p.username.clone()))
            .collect();
        // Submitters who left since keep the name from their profile
        for result in &results {
            if usernames.contains_key(&result.user_id) {
                continue;
            }
            if let Some(user) = state.repo.get_user(&result.user_id).await? {
                usernames.insert(result.user_id.clone(), user.username);
            }
        }
        let username_of = |user_id: &str| {
            usernames
                .get(user_id)
                .cloned()
                .unwrap_or_else(|| user_id.to_string())
        };
        merge_into_leaderboard(&mut session.leaderboard, &results, username_of);
        let result_infos = result_infos(&round, &results, username_of);

        tracing::info!(
            "Session {} round {} completed ({:?}), {} entries scored",
            session.id,
            round.round_number,
            trigger,
            results.len()
        );

        if session.current_round_number >= session.settings.round_count {
            state
                .finish_session(session, FinishReason::Completed, Some(result_infos))
                .await?;
        } else {
            state.repo.save_session(&session).await?;
            state.registry.refresh(&session).await;
            state
                .broadcast(
                    &session.id,
                    ServerMessage::RoundResults {
                        round_number: round.round_number,
                        results: result_infos,
                        leaderboard: session.leaderboard.clone(),
                    },
                )
                .await;
        }
        Ok(())
    }
}

/// Submitters still in the session who have not ranked yet
fn pending_judges(session: &Session, round: &Round) -> Vec<UserId> {
    round
        .eligible_judges()
        .into_iter()
        .filter(|judge| session.has_player(judge) && round.judgement_by(judge).is_none())
        .collect()
}

fn is_permutation(round: &Round, ranked: &[SubmissionId]) -> bool {
    if ranked.len() != round.submissions.len() {
        return false;
    }
    let expected: HashSet<&str> = round.submissions.iter().map(|s| s.id.as_str()).collect();
    let given: HashSet<&str> = ranked.iter().map(String::as_str).collect();
    given.len() == ranked.len() && given == expected
}

/// Scored entries in finishing order, with authors revealed
pub(crate) fn result_infos<F>(
    round: &Round,
    results: &[SubmissionResult],
    username_of: F,
) -> Vec<RoundResultInfo>
where
    F: Fn(&str) -> String,
{
    results
        .iter()
        .filter_map(|r| {
            let submission = round.submissions.iter().find(|s| s.id == r.submission_id)?;
            Some(RoundResultInfo {
                submission_id: r.submission_id.clone(),
                user_id: r.user_id.clone(),
                username: username_of(&r.user_id),
                image_url: round
                    .prompt(&submission.chosen_prompt_ref)
                    .map(|p| p.image_url.clone())
                    .unwrap_or_default(),
                captions: submission.captions.clone(),
                position: r.position + 1,
                score: r.score,
            })
        })
        .collect()
}
