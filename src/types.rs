use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Opaque ID types for type safety
pub type SessionId = String;
pub type RoundId = String;
pub type SubmissionId = String;
pub type UserId = String;
pub type ConnectionId = String;
pub type PromptId = String;

/// Minimum and maximum number of captions on a single entry
pub const MIN_CAPTIONS: usize = 1;
pub const MAX_CAPTIONS: usize = 6;
pub const MAX_CAPTION_CHARS: usize = 200;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Waiting,
    Playing,
    Finished,
}

impl SessionState {
    /// Sessions only ever move forward: waiting -> playing -> finished.
    /// Waiting may also jump straight to finished (host ends an unstarted game).
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Waiting, Playing) | (Waiting, Finished) | (Playing, Finished)
        )
    }

    pub fn is_active(self) -> bool {
        self != SessionState::Finished
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RoundStatus {
    Submitting,
    Judging,
    Completed,
}

impl RoundStatus {
    /// The single forward successor of this status, if any
    pub fn next(self) -> Option<RoundStatus> {
        match self {
            RoundStatus::Submitting => Some(RoundStatus::Judging),
            RoundStatus::Judging => Some(RoundStatus::Completed),
            RoundStatus::Completed => None,
        }
    }

    pub fn is_in_flight(self) -> bool {
        self != RoundStatus::Completed
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SubmissionStatus {
    Pending,
    Judged,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionSettings {
    pub round_count: u32,
    pub submission_window_ms: u64,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            round_count: 3,
            submission_window_ms: 90_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionPlayer {
    pub user_id: UserId,
    pub username: String,
    pub connection_id: ConnectionId,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LeaderboardEntry {
    pub user_id: UserId,
    pub username: String,
    pub score: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    /// Short join code shown to the host
    pub code: String,
    pub host_id: UserId,
    pub players: Vec<SessionPlayer>,
    pub state: SessionState,
    pub current_round_number: u32,
    pub settings: SessionSettings,
    pub round_ids: Vec<RoundId>,
    pub leaderboard: Vec<LeaderboardEntry>,
    pub created_at: String,
    pub updated_at: String,
}

impl Session {
    pub fn has_player(&self, user_id: &str) -> bool {
        self.players.iter().any(|p| p.user_id == user_id)
    }

    pub fn player(&self, user_id: &str) -> Option<&SessionPlayer> {
        self.players.iter().find(|p| p.user_id == user_id)
    }

    pub fn is_host(&self, user_id: &str) -> bool {
        self.host_id == user_id
    }

    pub fn is_full(&self, max_players: usize) -> bool {
        self.players.len() >= max_players
    }

    pub fn current_round_id(&self) -> Option<&RoundId> {
        self.round_ids.last()
    }

    pub fn rounds_remaining(&self) -> bool {
        self.current_round_number < self.settings.round_count
    }
}

/// A template offered to players as the base of their entry
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PromptDescriptor {
    pub id: PromptId,
    pub name: String,
    pub image_url: String,
    /// Number of caption lines the template is designed for
    #[serde(default = "default_lines")]
    pub lines: u32,
}

fn default_lines() -> u32 {
    2
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Submission {
    pub id: SubmissionId,
    pub user_id: UserId,
    pub chosen_prompt_ref: PromptId,
    pub captions: Vec<String>,
    pub score: u64,
    pub status: SubmissionStatus,
    pub submitted_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Judgement {
    pub judge_user_id: UserId,
    /// Best first
    pub ranked_submission_ids: Vec<SubmissionId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Round {
    pub id: RoundId,
    pub session_id: SessionId,
    pub round_number: u32,
    pub prompt_set: Vec<PromptDescriptor>,
    /// The private subset of `prompt_set` handed to each player
    pub player_prompts: HashMap<UserId, Vec<PromptId>>,
    pub submissions: Vec<Submission>,
    pub judgements: Vec<Judgement>,
    pub status: RoundStatus,
    pub start_time: String,
    pub submission_deadline: String,
    pub judging_deadline: Option<String>,
}

impl Round {
    pub fn submission_by(&self, user_id: &str) -> Option<&Submission> {
        self.submissions.iter().find(|s| s.user_id == user_id)
    }

    pub fn judgement_by(&self, user_id: &str) -> Option<&Judgement> {
        self.judgements.iter().find(|j| j.judge_user_id == user_id)
    }

    pub fn prompt(&self, prompt_id: &str) -> Option<&PromptDescriptor> {
        self.prompt_set.iter().find(|p| p.id == prompt_id)
    }

    pub fn prompts_for(&self, user_id: &str) -> Vec<PromptDescriptor> {
        self.player_prompts
            .get(user_id)
            .map(|ids| ids.iter().filter_map(|id| self.prompt(id).cloned()).collect())
            .unwrap_or_default()
    }

    /// Move to the next status; completed rounds stay completed
    pub fn advance(&mut self) {
        if let Some(next) = self.status.next() {
            self.status = next;
        }
    }

    /// Players who submitted are the judges whose rankings end the phase early
    pub fn eligible_judges(&self) -> Vec<UserId> {
        self.submissions.iter().map(|s| s.user_id.clone()).collect()
    }
}

/// The persisted "current session" reference of a user
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UserProfile {
    pub user_id: UserId,
    pub username: String,
    pub current_session: Option<SessionId>,
}
