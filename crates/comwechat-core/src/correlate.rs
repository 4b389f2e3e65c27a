use tracing::warn;

use crate::dedup::DeliveryCache;
use crate::pending::{CorrelationKey, PendingSends};
use crate::types::InboundEvent;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchOutcome {
    /// A waiting send was resolved with the callback's msgid.
    Resolved(CorrelationKey),
    /// The msgid was already delivered inbound; the client re-announced it.
    UpstreamEcho,
    /// No pending send matches; the sender will time out.
    Unmatched,
    /// The callback lacks a destination or msgid.
    Incomplete,
}

/// Candidate keys for a `sent_msg` callback, most specific first.
pub fn candidate_keys(event: &InboundEvent) -> Vec<CorrelationKey> {
    let mut keys = Vec::with_capacity(2);
    if !event.message.is_empty() {
        keys.push(CorrelationKey::content(&event.sender, &event.message));
    }
    if !event.filepath.is_empty() {
        keys.push(CorrelationKey::file_op(&event.sender));
    }
    keys
}

/// Resolves the pending send a `sent_msg` callback confirms.
///
/// Content keys are tried before the per-chat file key. Nothing here
/// reports back to the event source.
pub fn correlate_sent(
    pending: &PendingSends,
    seen: &DeliveryCache,
    event: &InboundEvent,
) -> MatchOutcome {
    if event.sender.is_empty() || event.msgid.is_empty() {
        warn!("sent_msg callback missing sender or msgid");
        return MatchOutcome::Incomplete;
    }
    if seen.contains(&event.msgid) {
        warn!(
            "sent_msg {} already seen inbound, ignoring upstream echo",
            event.msgid
        );
        return MatchOutcome::UpstreamEcho;
    }

    match pending.resolve_first(&candidate_keys(event), &event.msgid) {
        Some(key) => MatchOutcome::Resolved(key),
        None => {
            warn!(
                "no pending send matches sender {} (msgid {})",
                event.sender, event.msgid
            );
            MatchOutcome::Unmatched
        }
    }
}
