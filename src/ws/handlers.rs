//! WebSocket message dispatch
//!
//! Translates client messages into session commands. Failures are answered
//! to the sending connection only.

use crate::error::GameResult;
use crate::protocol::{ClientMessage, ServerMessage, SessionInfo};
use crate::state::{AppState, ConnectionContext};
use std::sync::Arc;

/// Turn a command result into the reply for the sender
fn reply<T>(
    result: GameResult<T>,
    action: &str,
    ctx: &ConnectionContext,
    ok: impl FnOnce(T) -> Option<ServerMessage>,
) -> Option<ServerMessage> {
    match result {
        Ok(value) => ok(value),
        Err(e) => {
            tracing::warn!("{} by {} rejected: {}", action, ctx.user_id, e);
            Some(e.into())
        }
    }
}

/// Handle client messages and return optional response
pub async fn handle_message(
    msg: ClientMessage,
    ctx: &ConnectionContext,
    state: &Arc<AppState>,
) -> Option<ServerMessage> {
    match msg {
        // Session membership
        ClientMessage::CreateSession => {
            reply(state.create_session(ctx).await, "create_session", ctx, |s| {
                Some(ServerMessage::SessionCreated {
                    session_id: s.id,
                    code: s.code,
                })
            })
        }

        ClientMessage::JoinSession { code } => {
            reply(state.join_session(ctx, &code).await, "join_session", ctx, |s| {
                Some(ServerMessage::SessionJoined {
                    session: SessionInfo::from(&s),
                })
            })
        }

        ClientMessage::LeaveSession => {
            reply(state.leave_session(ctx).await, "leave_session", ctx, |session_id| {
                Some(ServerMessage::LeftSession { session_id })
            })
        }

        ClientMessage::RejoinSession => {
            reply(state.rejoin_session(ctx).await, "rejoin_session", ctx, |snapshot| {
                Some(ServerMessage::SessionRejoined { snapshot })
            })
        }

        // Host commands (authorization checked by the command itself)
        ClientMessage::RemovePlayer { target_username } => reply(
            state.remove_player(ctx, &target_username).await,
            "remove_player",
            ctx,
            // The host sees the player_removed broadcast
            |_| None,
        ),

        ClientMessage::StartGame => {
            // Everyone, the host included, gets game_started and round_started
            reply(state.start_game(ctx).await, "start_game", ctx, |_| None)
        }

        ClientMessage::AdvanceRound => {
            reply(state.advance_round(ctx).await, "advance_round", ctx, |_| None)
        }

        ClientMessage::EndGame => reply(state.end_game(ctx).await, "end_game", ctx, |_| None),

        // Round actions
        ClientMessage::SubmitEntry {
            chosen_prompt_ref,
            captions,
        } => reply(
            state.submit_entry(ctx, chosen_prompt_ref, captions).await,
            "submit_entry",
            ctx,
            |_| Some(ServerMessage::SubmissionAck),
        ),

        ClientMessage::SubmitRanking {
            ranked_submission_ids,
        } => reply(
            state.submit_ranking(ctx, ranked_submission_ids).await,
            "submit_ranking",
            ctx,
            |_| Some(ServerMessage::RankingAck),
        ),
    }
}
