/// Retry sweep policy for stalled outbox entries.
///
/// Pure decision logic — the runtime drives the timer, feeds in the
/// current outbox snapshot, and executes the returned actions. Apart
/// from the first attempt made inside `send`, this is the only place
/// that schedules delivery attempts.
use crate::store::OutboxEntry;
use crate::types::SendStatus;

/// What to do with one outbox entry during a sweep.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SweepAction {
    /// Re-attempt delivery: bump attempts, mark in-flight, send once.
    Retry(String),
    /// Attempts exhausted: mark failed and report it.
    Fail(String),
}

/// Plan one sweep over the outbox.
///
/// Per entry: failed is terminal and skipped; an in-flight entry
/// younger than `retry_after_ms` may still have an attempt outstanding
/// and is skipped; an entry at the attempt cap fails; everything else
/// (pending, or in-flight long enough to be presumed lost) is retried.
pub fn plan_sweep(
    entries: &[OutboxEntry],
    now_ms: u64,
    retry_after_ms: u64,
    max_attempts: u32,
) -> Vec<SweepAction> {
    let mut actions = Vec::new();

    for entry in entries {
        if entry.status == SendStatus::Failed {
            continue;
        }

        if entry.status == SendStatus::InFlight {
            let age = now_ms.saturating_sub(entry.last_attempt_at.unwrap_or(entry.created_at));
            if age < retry_after_ms {
                continue;
            }
        }

        if entry.attempts >= max_attempts {
            actions.push(SweepAction::Fail(entry.id.clone()));
        } else {
            actions.push(SweepAction::Retry(entry.id.clone()));
        }
    }

    actions
}
