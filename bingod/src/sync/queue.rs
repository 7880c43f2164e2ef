use std::collections::BTreeMap;

use bingo_core::{MutationKind, Payload};
use rand::Rng;
use rand::distributions::Alphanumeric;
use serde::Serialize;
use thiserror::Error;
use time::OffsetDateTime;

#[derive(Debug, Error)]
#[error("invalid item state: {0}")]
pub struct InvalidState(pub String);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemState {
    Pending,
    Synced,
    Failed,
}

impl ItemState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemState::Pending => "pending",
            ItemState::Synced => "synced",
            ItemState::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Result<Self, InvalidState> {
        match value {
            "pending" => Ok(ItemState::Pending),
            "synced" => Ok(ItemState::Synced),
            "failed" => Ok(ItemState::Failed),
            other => Err(InvalidState(other.to_string())),
        }
    }
}

/// One queued mutation. Timestamps are unix milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueueItem {
    pub id: String,
    pub kind: MutationKind,
    pub payload: Payload,
    pub created_at: i64,
    pub attempts: u32,
    pub last_attempt_at: Option<i64>,
    pub state: ItemState,
    pub domain_key: Option<String>,
    pub next_attempt_at: Option<i64>,
    pub last_error: Option<String>,
    pub revision: i64,
}

impl QueueItem {
    pub fn new(kind: MutationKind, payload: Payload, now: i64) -> Self {
        Self {
            id: generate_id(kind, now),
            kind,
            domain_key: kind.domain_key(&payload),
            payload,
            created_at: now,
            attempts: 0,
            last_attempt_at: None,
            state: ItemState::Pending,
            next_attempt_at: None,
            last_error: None,
            revision: 0,
        }
    }

    pub fn is_due(&self, now: i64) -> bool {
        self.next_attempt_at.is_none_or(|at| at <= now)
    }
}

/// A mutation that will not be retried automatically. The payload is kept so
/// it can be inspected and resubmitted once corrected.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailedItem {
    pub id: String,
    pub kind: MutationKind,
    pub domain_key: Option<String>,
    pub payload: Payload,
    pub revision: i64,
    pub created_at: i64,
    pub attempts: u32,
    pub last_attempt_at: Option<i64>,
    pub failed_at: i64,
    pub reason: String,
}

impl FailedItem {
    pub fn into_queue_item(self) -> QueueItem {
        QueueItem {
            id: self.id,
            kind: self.kind,
            domain_key: self.domain_key,
            payload: self.payload,
            created_at: self.created_at,
            attempts: self.attempts,
            last_attempt_at: self.last_attempt_at,
            state: ItemState::Failed,
            next_attempt_at: None,
            last_error: Some(self.reason),
            revision: self.revision,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueStatusItem {
    pub id: String,
    pub kind: MutationKind,
    pub attempts: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStatus {
    pub pending_count: usize,
    pub items: Vec<QueueStatusItem>,
    pub failed_count: usize,
    pub draining: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct KindTally {
    pub synced: usize,
    pub retried: usize,
    pub failed: usize,
}

/// Outcome counts of one drain pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DrainReport {
    pub attempted: usize,
    pub synced: usize,
    pub retried: usize,
    pub failed: usize,
    /// Still backing off; not attempted in this pass.
    pub deferred: usize,
    /// Left pending because connectivity dropped before their attempt.
    pub interrupted: usize,
    /// Delivered, but re-saved while in flight; the newer payload stays queued.
    pub superseded: usize,
    pub by_kind: BTreeMap<MutationKind, KindTally>,
}

impl DrainReport {
    pub fn is_empty(&self) -> bool {
        self.attempted == 0 && self.deferred == 0 && self.interrupted == 0
    }

    pub(crate) fn tally(&mut self, kind: MutationKind) -> &mut KindTally {
        self.by_kind.entry(kind).or_default()
    }
}

pub fn now_millis() -> i64 {
    (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}

fn generate_id(kind: MutationKind, now: i64) -> String {
    format!("{}_{}_{}", kind.as_str(), now, random_suffix())
}

/// Identifies one queue manager when it claims the shared drain lease.
pub fn lease_owner_id() -> String {
    format!("pid{}_{}", std::process::id(), random_suffix())
}

fn random_suffix() -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(6)
        .map(char::from)
        .collect();
    suffix.to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload(value: serde_json::Value) -> Payload {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn new_item_starts_pending_with_zero_attempts() {
        let item = QueueItem::new(
            MutationKind::Occasion,
            payload(json!({"id": "OCC_1", "date": "2025-09-24"})),
            1_700_000_000_000,
        );
        assert_eq!(item.state, ItemState::Pending);
        assert_eq!(item.attempts, 0);
        assert_eq!(item.last_attempt_at, None);
        assert_eq!(item.domain_key.as_deref(), Some("OCC_1"));
        assert!(item.id.starts_with("occasion_1700000000000_"));
    }

    #[test]
    fn generated_ids_are_unique() {
        let a = generate_id(MutationKind::Photo, 1);
        let b = generate_id(MutationKind::Photo, 1);
        assert_ne!(a, b);
        assert_eq!(a.len(), "photo_1_".len() + 6);
    }

    #[test]
    fn lease_owners_are_distinct_within_a_process() {
        let a = lease_owner_id();
        let b = lease_owner_id();
        assert_ne!(a, b);
        assert!(a.starts_with(&format!("pid{}_", std::process::id())));
    }

    #[test]
    fn due_when_no_backoff_or_backoff_elapsed() {
        let mut item = QueueItem::new(MutationKind::Games, Payload::new(), 0);
        assert!(item.is_due(10));
        item.next_attempt_at = Some(20);
        assert!(!item.is_due(10));
        assert!(item.is_due(20));
    }

    #[test]
    fn state_round_trips_through_storage_names() {
        for state in [ItemState::Pending, ItemState::Synced, ItemState::Failed] {
            assert_eq!(ItemState::parse(state.as_str()).unwrap(), state);
        }
        assert!(ItemState::parse("syncing").is_err());
    }
}
