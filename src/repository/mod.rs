//! Persistence boundary for sessions, rounds and user profiles
//!
//! The store is the single source of truth for game content. It offers plain
//! last-write-wins saves plus status-conditional round updates: a
//! [`RoundUpdate`] is applied only if the round is still in the status the
//! update expects, which is how competing phase resolutions are decided.

mod file;
mod memory;

pub use file::FileRepository;
pub use memory::MemoryRepository;

use crate::types::*;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub type RepoResult<T> = Result<T, RepositoryError>;

#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    #[error("I/O error: {0}")]
    Io(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<std::io::Error> for RepositoryError {
    fn from(e: std::io::Error) -> Self {
        RepositoryError::Io(e.to_string())
    }
}

impl From<serde_json::Error> for RepositoryError {
    fn from(e: serde_json::Error) -> Self {
        RepositoryError::Serialization(e.to_string())
    }
}

/// A mutation of a round that is only valid in one status
#[derive(Debug, Clone)]
pub enum RoundUpdate {
    AddSubmission(Submission),
    /// Replaces an earlier judgement by the same judge
    UpsertJudgement(Judgement),
    BeginJudging { judging_deadline: String },
    Complete { scores: Vec<(SubmissionId, u64)> },
}

/// Result of a conditional round update
#[derive(Debug, Clone)]
pub enum Guarded<T> {
    Applied(T),
    /// The round was no longer in the expected status; nothing was written
    StatusMismatch(RoundStatus),
    /// The participant already has an entry in this round; nothing was written
    Duplicate,
}

impl RoundUpdate {
    pub fn expected_status(&self) -> RoundStatus {
        match self {
            RoundUpdate::AddSubmission(_) | RoundUpdate::BeginJudging { .. } => {
                RoundStatus::Submitting
            }
            RoundUpdate::UpsertJudgement(_) | RoundUpdate::Complete { .. } => RoundStatus::Judging,
        }
    }

    /// Apply to `round` if its status matches. Shared by every backend so the
    /// guard is evaluated inside the store's own critical section.
    pub(crate) fn apply(self, round: &mut Round) -> Guarded<()> {
        if round.status != self.expected_status() {
            return Guarded::StatusMismatch(round.status);
        }

        match self {
            RoundUpdate::AddSubmission(submission) => {
                if round.submission_by(&submission.user_id).is_some() {
                    return Guarded::Duplicate;
                }
                round.submissions.push(submission);
            }
            RoundUpdate::UpsertJudgement(judgement) => {
                match round
                    .judgements
                    .iter_mut()
                    .find(|j| j.judge_user_id == judgement.judge_user_id)
                {
                    Some(existing) => *existing = judgement,
                    None => round.judgements.push(judgement),
                }
            }
            RoundUpdate::BeginJudging { judging_deadline } => {
                round.advance();
                round.judging_deadline = Some(judging_deadline);
            }
            RoundUpdate::Complete { scores } => {
                for (submission_id, score) in scores {
                    if let Some(s) = round.submissions.iter_mut().find(|s| s.id == submission_id) {
                        s.score = score;
                        s.status = SubmissionStatus::Judged;
                    }
                }
                round.advance();
            }
        }
        Guarded::Applied(())
    }
}

#[async_trait]
pub trait Repository: Send + Sync {
    async fn insert_session(&self, session: Session) -> RepoResult<()>;
    async fn get_session(&self, id: &str) -> RepoResult<Option<Session>>;
    async fn find_session_by_code(&self, code: &str) -> RepoResult<Option<Session>>;
    async fn list_sessions(&self) -> RepoResult<Vec<Session>>;
    /// Last write wins
    async fn save_session(&self, session: &Session) -> RepoResult<()>;
    /// Removes the session and its rounds. Returns false if it did not exist.
    async fn delete_session(&self, id: &str) -> RepoResult<bool>;

    async fn insert_round(&self, round: Round) -> RepoResult<()>;
    async fn get_round(&self, id: &str) -> RepoResult<Option<Round>>;
    /// Conditional update, see [`RoundUpdate`]
    async fn update_round(&self, id: &str, update: RoundUpdate) -> RepoResult<Option<Guarded<Round>>>;

    async fn get_user(&self, user_id: &str) -> RepoResult<Option<UserProfile>>;
    async fn save_user(&self, user: &UserProfile) -> RepoResult<()>;
    /// Clear the user's current session reference if it still points at `session_id`
    async fn clear_current_session(&self, user_id: &str, session_id: &str) -> RepoResult<()>;
}

/// Serializable image of a whole store
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreSnapshot {
    pub schema_version: u32,
    pub exported_at: String,
    pub sessions: HashMap<SessionId, Session>,
    pub rounds: HashMap<RoundId, Round>,
    pub users: HashMap<UserId, UserProfile>,
}

pub const SNAPSHOT_SCHEMA_VERSION: u32 = 1;
