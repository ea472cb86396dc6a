//! Structural rules for the conversation record.
//!
//! Every assistant turn that requests actions must be answered, in the very
//! next turn, by exactly one result per request id. Truncation drops whole
//! leading turns and never leaves the record starting on a results turn or an
//! assistant turn.

use crate::session::{ContentBlock, Role, Turn};
use std::collections::HashSet;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PairingViolation {
    #[error("turn {turn}: action request `{id}` has no result in the following turn")]
    Unanswered { turn: usize, id: String },
    #[error("turn {turn}: result for `{id}` does not answer the preceding turn")]
    Stray { turn: usize, id: String },
    #[error("turn {turn}: request `{id}` answered {count} times")]
    Duplicate { turn: usize, id: String, count: usize },
}

/// A user turn made up only of action results.
pub fn is_orphan_result_turn(turn: &Turn) -> bool {
    turn.role == Role::User
        && !turn.content.is_empty()
        && turn
            .content
            .iter()
            .all(|b| matches!(b, ContentBlock::ActionResult(_)))
}

/// Keeps the most recent `max_pairs` turn-pairs, then advances to the first
/// ordinary user turn. If nothing survives, the final pair is retained.
pub fn truncate(messages: Vec<Turn>, max_pairs: usize) -> Vec<Turn> {
    let keep = max_pairs.saturating_mul(2);
    if messages.len() <= keep {
        return messages;
    }

    let start = messages.len() - keep;
    let safe = messages[start..]
        .iter()
        .position(|t| !(is_orphan_result_turn(t) || t.role == Role::Assistant))
        .map(|offset| start + offset);

    let from = safe.unwrap_or_else(|| messages.len().saturating_sub(2));
    messages.into_iter().skip(from).collect()
}

/// Drops a trailing assistant turn whose action requests were never answered.
/// Returns true if a turn was removed.
pub fn repair_trailing_orphan(messages: &mut Vec<Turn>) -> bool {
    let dangling = matches!(
        messages.last(),
        Some(last) if last.role == Role::Assistant && last.has_action_requests()
    );
    if dangling {
        messages.pop();
    }
    dangling
}

/// Removes every action request from `turn`, returning how many were dropped.
pub fn strip_action_requests(turn: &mut Turn) -> usize {
    let before = turn.content.len();
    turn.content
        .retain(|b| !matches!(b, ContentBlock::ActionRequest(_)));
    before - turn.content.len()
}

/// Checks request/result pairing across the whole record.
pub fn validate(messages: &[Turn]) -> Result<(), Vec<PairingViolation>> {
    let mut violations = Vec::new();

    for (i, turn) in messages.iter().enumerate() {
        if turn.role == Role::Assistant {
            let requested: Vec<&str> = turn.action_requests().map(|r| r.id.as_str()).collect();
            if requested.is_empty() {
                continue;
            }
            let answers: Vec<&str> = messages
                .get(i + 1)
                .map(|next| next.action_results().map(|r| r.tool_use_id.as_str()).collect())
                .unwrap_or_default();
            for id in &requested {
                let count = answers.iter().filter(|a| *a == id).count();
                match count {
                    0 => violations.push(PairingViolation::Unanswered {
                        turn: i,
                        id: id.to_string(),
                    }),
                    1 => {}
                    n => violations.push(PairingViolation::Duplicate {
                        turn: i,
                        id: id.to_string(),
                        count: n,
                    }),
                }
            }
        }

        let results: Vec<&str> = turn.action_results().map(|r| r.tool_use_id.as_str()).collect();
        if results.is_empty() {
            continue;
        }
        let expected: HashSet<&str> = i
            .checked_sub(1)
            .and_then(|p| messages.get(p))
            .filter(|prev| prev.role == Role::Assistant)
            .map(|prev| prev.action_requests().map(|r| r.id.as_str()).collect())
            .unwrap_or_default();
        for id in results {
            if !expected.contains(id) {
                violations.push(PairingViolation::Stray {
                    turn: i,
                    id: id.to_string(),
                });
            }
        }
    }

    if violations.is_empty() {
        Ok(())
    } else {
        Err(violations)
    }
}

/// True when the record ends on an assistant turn with unanswered requests.
pub fn has_pending_requests(messages: &[Turn]) -> bool {
    messages
        .last()
        .map(|t| t.role == Role::Assistant && t.has_action_requests())
        .unwrap_or(false)
}
