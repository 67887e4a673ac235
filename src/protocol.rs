use crate::types::*;
use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};
use serde::{Deserialize, Serialize};
use std::hash::{DefaultHasher, Hash, Hasher};

pub const PROTOCOL_VERSION: &str = "1.0";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "t", rename_all = "snake_case")]
pub enum ClientMessage {
    CreateSession,
    JoinSession {
        code: String,
    },
    LeaveSession,
    /// Re-attach this connection to the user's current session
    RejoinSession,
    // Host-only messages
    RemovePlayer {
        target_username: String,
    },
    StartGame,
    AdvanceRound,
    EndGame,
    // Round messages
    SubmitEntry {
        chosen_prompt_ref: PromptId,
        captions: Vec<String>,
    },
    SubmitRanking {
        /// Best first; must contain every entry of the round exactly once
        ranked_submission_ids: Vec<SubmissionId>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "t", rename_all = "snake_case")]
pub enum ServerMessage {
    Welcome {
        protocol: String,
        user_id: UserId,
        username: String,
        server_now: String,
        /// Session the user can rejoin, if any
        current_session: Option<SessionId>,
    },
    SessionCreated {
        session_id: SessionId,
        code: String,
    },
    SessionJoined {
        session: SessionInfo,
    },
    /// Broadcast to the other members when someone joins
    PlayerJoined {
        user_id: UserId,
        username: String,
        players: Vec<PlayerInfo>,
    },
    LeftSession {
        session_id: SessionId,
    },
    PlayerLeft {
        user_id: UserId,
        username: String,
        /// Host after the departure (changes if the host left)
        host_id: UserId,
    },
    SessionRejoined {
        snapshot: RejoinSnapshot,
    },
    PlayerRemoved {
        user_id: UserId,
        username: String,
    },
    /// Sent to the removed player only
    RemovedFromSession {
        session_id: SessionId,
    },
    GameStarted {
        session: SessionInfo,
    },
    /// Sent to each player with their private prompt subset
    RoundStarted {
        round_number: u32,
        prompts: Vec<PromptDescriptor>,
        deadline: String,
    },
    SubmissionAck,
    MissedSubmission {
        round_number: u32,
    },
    JudgingStarted {
        round_number: u32,
        entries: Vec<AnonymizedEntry>,
        deadline: String,
        judging_window_ms: u64,
    },
    RankingAck,
    MissedJudging {
        round_number: u32,
    },
    RoundResults {
        round_number: u32,
        results: Vec<RoundResultInfo>,
        leaderboard: Vec<LeaderboardEntry>,
    },
    GameFinished {
        leaderboard: Vec<LeaderboardEntry>,
        #[serde(skip_serializing_if = "Option::is_none")]
        round_results: Option<Vec<RoundResultInfo>>,
        reason: FinishReason,
    },
    SessionDeleted {
        session_id: SessionId,
    },
    /// A phase resolution failed; the round may need the host to end the game
    RoundError {
        msg: String,
    },
    Error {
        code: String,
        msg: String,
    },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    /// The configured number of rounds was played
    Completed,
    EndedByHost,
    /// Every player left mid-game
    Abandoned,
    /// The server restarted while the game was running
    Interrupted,
}

/// Public player info (no connection ids)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlayerInfo {
    pub user_id: UserId,
    pub username: String,
}

impl From<&SessionPlayer> for PlayerInfo {
    fn from(p: &SessionPlayer) -> Self {
        Self {
            user_id: p.user_id.clone(),
            username: p.username.clone(),
        }
    }
}

/// Public session info shared with members and the lobby API
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInfo {
    pub id: SessionId,
    pub code: String,
    pub host_id: UserId,
    pub players: Vec<PlayerInfo>,
    pub state: SessionState,
    pub current_round_number: u32,
    pub round_count: u32,
    pub leaderboard: Vec<LeaderboardEntry>,
}

impl From<&Session> for SessionInfo {
    fn from(s: &Session) -> Self {
        Self {
            id: s.id.clone(),
            code: s.code.clone(),
            host_id: s.host_id.clone(),
            players: s.players.iter().map(PlayerInfo::from).collect(),
            state: s.state,
            current_round_number: s.current_round_number,
            round_count: s.settings.round_count,
            leaderboard: s.leaderboard.clone(),
        }
    }
}

/// An entry as shown to judges: no author
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AnonymizedEntry {
    pub id: SubmissionId,
    pub image_url: String,
    pub prompt_name: String,
    pub captions: Vec<String>,
}

impl AnonymizedEntry {
    pub fn from_submission(round: &Round, submission: &Submission) -> Self {
        let prompt = round.prompt(&submission.chosen_prompt_ref);
        Self {
            id: submission.id.clone(),
            image_url: prompt.map(|p| p.image_url.clone()).unwrap_or_default(),
            prompt_name: prompt.map(|p| p.name.clone()).unwrap_or_default(),
            captions: submission.captions.clone(),
        }
    }

    /// Every entry of the round in judging order.
    ///
    /// The order is shuffled once per round, so it hides who submitted when
    /// and stays the same for judges who rejoin mid-phase.
    pub fn shuffled(round: &Round) -> Vec<Self> {
        let mut entries: Vec<Self> = round
            .submissions
            .iter()
            .map(|s| Self::from_submission(round, s))
            .collect();

        let mut hasher = DefaultHasher::new();
        round.id.hash(&mut hasher);
        entries.shuffle(&mut StdRng::seed_from_u64(hasher.finish()));
        entries
    }
}

/// One scored entry, revealed with its author after judging
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RoundResultInfo {
    pub submission_id: SubmissionId,
    pub user_id: UserId,
    pub username: String,
    pub image_url: String,
    pub captions: Vec<String>,
    /// 1-based finishing place
    pub position: usize,
    pub score: u64,
}

/// Phase-appropriate state replayed to a reconnecting player
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum RejoinSnapshot {
    Lobby {
        session: SessionInfo,
    },
    Submitting {
        session: SessionInfo,
        round_number: u32,
        prompts: Vec<PromptDescriptor>,
        deadline: String,
        has_submitted: bool,
    },
    Judging {
        session: SessionInfo,
        round_number: u32,
        entries: Vec<AnonymizedEntry>,
        deadline: Option<String>,
        has_judged: bool,
    },
    /// Between rounds, waiting for the host to advance
    Intermission {
        session: SessionInfo,
        round_number: u32,
        results: Vec<RoundResultInfo>,
    },
}
