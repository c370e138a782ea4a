//! Delivery status and feedback transition rules
//!
//! Pure functions over in-memory record sets; the repository applies them
//! inside locked read-modify-write spans.

use chrono::{DateTime, Utc};

use crate::error::{AppError, Result};
use crate::ids::{IdGenerator, DRAFT_PREFIX, FEEDBACK_PREFIX};
use crate::models::{DeliveryStatus, DraftItem, FeedbackInput, FeedbackItem, FeedbackKind};

/// `pending_feedback` iff at least one feedback item is unhandled
pub fn derive_status(feedback: &[FeedbackItem]) -> DeliveryStatus {
    if pending_count(feedback) > 0 {
        DeliveryStatus::PendingFeedback
    } else {
        DeliveryStatus::Normal
    }
}

pub fn pending_count(feedback: &[FeedbackItem]) -> usize {
    feedback.iter().filter(|item| !item.handled).count()
}

pub fn pending(feedback: &[FeedbackItem]) -> Vec<FeedbackItem> {
    feedback.iter().filter(|item| !item.handled).cloned().collect()
}

/// `updated_at` never moves backwards
pub fn touch(previous: DateTime<Utc>, now: DateTime<Utc>) -> DateTime<Utc> {
    previous.max(now)
}

/// Build draft items, optionally forcing every item's kind. New ids never
/// repeat one in `existing`.
pub fn make_drafts(
    ids: &IdGenerator,
    existing: &[DraftItem],
    inputs: Vec<FeedbackInput>,
    force_kind: Option<FeedbackKind>,
    now: DateTime<Utc>,
) -> Vec<DraftItem> {
    inputs
        .into_iter()
        .map(|input| DraftItem {
            id: ids.next_unused(DRAFT_PREFIX, |c| existing.iter().any(|d| d.id == c)),
            kind: force_kind.unwrap_or(input.kind),
            payload: input.payload,
            target: input.target,
            created_at: now,
        })
        .collect()
}

/// Turn drafts into unhandled feedback items, with ids not already in `existing`
pub fn commit_drafts(
    ids: &IdGenerator,
    existing: &[FeedbackItem],
    drafts: Vec<DraftItem>,
    now: DateTime<Utc>,
) -> Result<Vec<FeedbackItem>> {
    if drafts.is_empty() {
        return Err(AppError::validation(
            "empty_commit",
            "no feedback items to commit",
        ));
    }

    Ok(drafts
        .into_iter()
        .map(|draft| FeedbackItem {
            id: ids.next_unused(FEEDBACK_PREFIX, |c| existing.iter().any(|f| f.id == c)),
            kind: draft.kind,
            payload: draft.payload,
            target: draft.target,
            handled: false,
            handled_at: None,
            handled_by: None,
            created_at: now,
        })
        .collect())
}

/// Mark the listed unhandled items handled. Returns how many changed.
pub fn resolve(
    feedback: &mut [FeedbackItem],
    ids: &[String],
    handled_by: Option<&str>,
    now: DateTime<Utc>,
) -> usize {
    let mut resolved = 0;
    for item in feedback.iter_mut() {
        if !item.handled && ids.contains(&item.id) {
            item.handled = true;
            item.handled_at = Some(now);
            item.handled_by = handled_by.map(str::to_string);
            resolved += 1;
        }
    }
    resolved
}

/// Remove the listed items if they are still unhandled. Handled items stay.
pub fn revoke(feedback: &mut Vec<FeedbackItem>, ids: &[String]) -> usize {
    let before = feedback.len();
    feedback.retain(|item| item.handled || !ids.contains(&item.id));
    before - feedback.len()
}
