//! History replay for vendors without native continuity.
//!
//! Replayed history is truncated keep-newest under a character ceiling:
//! walk from the newest message backwards and stop before the budget
//! would overflow. Vendors that require the first turn to be from the
//! user get a synthetic `"[continuing conversation]"` turn when
//! truncation left an assistant message in front.

use crate::providers::ChatTurn;

/// Character ceiling for replayed history.
pub const HISTORY_CHAR_BUDGET: usize = 50_000;

/// Synthetic turn prepended when a vendor needs a leading user message.
const CONTINUATION_MARKER: &str = "[continuing conversation]";

/// Keep the newest messages whose cumulative size fits `budget_chars`.
pub fn truncate_keep_newest(history: &[ChatTurn], budget_chars: usize) -> Vec<ChatTurn> {
    let mut kept = Vec::new();
    let mut used = 0usize;
    for turn in history.iter().rev() {
        let len = turn.content.chars().count();
        if used + len > budget_chars {
            break;
        }
        used += len;
        kept.push(turn.clone());
    }
    kept.reverse();
    kept
}

/// Build the message list replayed to a vendor: truncated history, an
/// optional synthetic leading user turn, and the current user input last.
pub fn replay_history(
    history: &[ChatTurn],
    user_input: &str,
    needs_leading_user: bool,
) -> Vec<ChatTurn> {
    let mut messages = truncate_keep_newest(history, HISTORY_CHAR_BUDGET);
    if needs_leading_user && messages.first().is_some_and(|t| t.role == "assistant") {
        messages.insert(0, ChatTurn::user(CONTINUATION_MARKER));
    }
    messages.push(ChatTurn::user(user_input));
    messages
}
