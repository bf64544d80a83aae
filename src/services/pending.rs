use chrono::Utc;
use std::sync::atomic::{AtomicI64, Ordering};
use tokio::task::JoinHandle;

use crate::models::bookmark::{Bookmark, TEMP_ID_PREFIX};

/// Local undo for an optimistic mutation, applied if the backend rejects it.
#[derive(Debug, Clone, PartialEq)]
pub enum Inverse {
    /// Take an optimistically inserted record back out.
    Withdraw(String),
    /// Put an optimistically removed record back at its sorted position.
    Restore(Bookmark),
    /// Accept the divergence until the next reload.
    Nothing,
}

impl Inverse {
    /// The list with this inverse applied, or `None` when it changes nothing.
    pub fn apply(&self, list: &[Bookmark]) -> Option<Vec<Bookmark>> {
        match self {
            Inverse::Withdraw(id) => {
                if !list.iter().any(|b| &b.id == id) {
                    return None;
                }
                Some(list.iter().filter(|b| &b.id != id).cloned().collect())
            }
            Inverse::Restore(record) => {
                if list.iter().any(|b| b.id == record.id) {
                    return None;
                }
                let index = list
                    .iter()
                    .position(|b| b.created_at < record.created_at)
                    .unwrap_or(list.len());
                let mut next = list.to_vec();
                next.insert(index, record.clone());
                Some(next)
            }
            Inverse::Nothing => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingKind {
    Insert,
    Delete,
}

/// An optimistic mutation awaiting the backend's answer.
#[derive(Debug, Clone)]
pub struct PendingOp {
    pub kind: PendingKind,
    pub target_id: String,
    pub inverse: Inverse,
}

impl PendingOp {
    pub fn insert(temp_id: &str) -> Self {
        Self {
            kind: PendingKind::Insert,
            target_id: temp_id.to_string(),
            inverse: Inverse::Withdraw(temp_id.to_string()),
        }
    }

    /// `removed` is the record taken out of the list, if any; it is only
    /// restored on failure when `restore_on_failure` is set.
    pub fn delete(id: &str, removed: Option<Bookmark>, restore_on_failure: bool) -> Self {
        let inverse = match removed {
            Some(record) if restore_on_failure => Inverse::Restore(record),
            _ => Inverse::Nothing,
        };
        Self {
            kind: PendingKind::Delete,
            target_id: id.to_string(),
            inverse,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// The backend accepted the write.
    Confirmed,
    /// The backend rejected it and the local change was undone.
    RolledBack,
    /// The backend rejected it and the local change was left in place.
    Kept,
    /// The answer arrived after the session ended and was ignored.
    Stale,
}

/// Handle on a background write. Dropping it does not cancel the request.
#[derive(Debug)]
pub struct PendingWrite {
    id: String,
    handle: JoinHandle<WriteOutcome>,
}

impl PendingWrite {
    pub fn new(id: String, handle: JoinHandle<WriteOutcome>) -> Self {
        Self { id, handle }
    }

    /// Id of the affected record (the temporary id for inserts).
    pub fn id(&self) -> &str {
        &self.id
    }

    pub async fn settled(self) -> WriteOutcome {
        self.handle.await.unwrap_or(WriteOutcome::Stale)
    }
}

/// Temporary ids from a millisecond clock that never repeats a reading.
#[derive(Debug, Default)]
pub struct TempIdGenerator {
    last: AtomicI64,
}

impl TempIdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&self) -> String {
        let mut prev = self.last.load(Ordering::SeqCst);
        loop {
            let candidate = Utc::now().timestamp_millis().max(prev + 1);
            match self.last.compare_exchange(prev, candidate, Ordering::SeqCst, Ordering::SeqCst) {
                Ok(_) => return format!("{}{}", TEMP_ID_PREFIX, candidate),
                Err(actual) => prev = actual,
            }
        }
    }
}
