//! Rank aggregation and the position score curve
//!
//! Everything here is pure: the engine feeds in a judged round and writes the
//! results back itself.

use crate::types::*;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub const MIN_SCORE: f64 = 500.0;
pub const MAX_SCORE: f64 = 1500.0;

/// Multipliers for first, second and third place
const PODIUM_BONUS: [f64; 3] = [1.5, 1.25, 1.1];

/// Outcome of one submission after judging
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SubmissionResult {
    pub submission_id: SubmissionId,
    pub user_id: UserId,
    /// Sum of the 0-based positions assigned by every judge
    pub total_rank: u64,
    pub average_rank: f64,
    /// 0-based final placement
    pub position: usize,
    pub score: u64,
}

/// Points for finishing at `position` (0-based) out of `total_players`.
///
/// The curve is quadratic in the share of the field beaten, so smaller fields
/// produce larger gaps between neighbours. Scores are rounded to the nearest 10.
pub fn position_score(position: usize, total_players: usize) -> u64 {
    if total_players == 0 {
        return 0;
    }
    let total = total_players as f64;
    let remaining = total_players.saturating_sub(position) as f64;
    let factor = (remaining / total).powi(2);

    let mut score = MIN_SCORE + (MAX_SCORE - MIN_SCORE) * factor;
    if let Some(bonus) = PODIUM_BONUS.get(position) {
        score *= bonus;
    }

    ((score / 10.0).round() as u64) * 10
}

/// Aggregate the judgements of a round into placements and scores.
///
/// Lower average rank is better. Ties keep submission order, which makes the
/// outcome deterministic.
pub fn score_round(round: &Round) -> Vec<SubmissionResult> {
    let mut totals: HashMap<&str, u64> = round
        .submissions
        .iter()
        .map(|s| (s.id.as_str(), 0))
        .collect();

    for judgement in &round.judgements {
        for (rank, submission_id) in judgement.ranked_submission_ids.iter().enumerate() {
            if let Some(total) = totals.get_mut(submission_id.as_str()) {
                *total += rank as u64;
            }
        }
    }

    let judges = round.judgements.len().max(1) as f64;
    let mut ranked: Vec<(&Submission, u64, f64)> = round
        .submissions
        .iter()
        .map(|s| {
            let total = totals.get(s.id.as_str()).copied().unwrap_or(0);
            (s, total, total as f64 / judges)
        })
        .collect();

    // sort_by is stable: equal averages keep insertion order
    ranked.sort_by(|a, b| a.2.total_cmp(&b.2));

    let field = ranked.len();
    ranked
        .into_iter()
        .enumerate()
        .map(|(position, (submission, total_rank, average_rank))| SubmissionResult {
            submission_id: submission.id.clone(),
            user_id: submission.user_id.clone(),
            total_rank,
            average_rank,
            position,
            score: position_score(position, field),
        })
        .collect()
}

/// Add round results to a leaderboard and keep it sorted by score, descending.
///
/// `username_of` resolves the display name for players without an entry yet.
pub fn merge_into_leaderboard<F>(
    leaderboard: &mut Vec<LeaderboardEntry>,
    results: &[SubmissionResult],
    username_of: F,
) where
    F: Fn(&str) -> String,
{
    for result in results {
        match leaderboard
            .iter_mut()
            .find(|entry| entry.user_id == result.user_id)
        {
            Some(entry) => entry.score += result.score,
            None => leaderboard.push(LeaderboardEntry {
                user_id: result.user_id.clone(),
                username: username_of(&result.user_id),
                score: result.score,
            }),
        }
    }

    leaderboard.sort_by(|a, b| b.score.cmp(&a.score));
}
