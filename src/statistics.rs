//! `GetUserStatistics`: a read-only rollup of a user's queued and recent
//! upload activity, computed from the Transfer Store and Queue rather
//! than tracked separately.

use chrono::{Duration as ChronoDuration, Utc};
use serde::Serialize;

use crate::transfer::{Transfer, TransferFilter, TransferState, TransferStore};

#[derive(Debug, Clone, Serialize)]
pub struct UserStatistics {
    pub username: String,
    pub queued_files: u64,
    pub queued_bytes: u64,
    pub succeeded_last_day: u64,
    pub failed_last_day: u64,
    pub succeeded_last_week: u64,
    pub failed_last_week: u64,
}

fn is_failure(state: TransferState) -> bool {
    state.intersects(
        TransferState::CANCELLED | TransferState::TIMED_OUT | TransferState::ERRORED | TransferState::REJECTED | TransferState::ABORTED,
    )
}

pub async fn compute(
    store: &dyn TransferStore,
    username: &str,
) -> Result<UserStatistics, crate::transfer::TransferError> {
    let rows = store.list(TransferFilter::for_username(username), true).await?;
    let now = Utc::now();
    let one_day_ago = now - ChronoDuration::days(1);
    let one_week_ago = now - ChronoDuration::weeks(1);

    let mut stats = UserStatistics {
        username: username.to_string(),
        queued_files: 0,
        queued_bytes: 0,
        succeeded_last_day: 0,
        failed_last_day: 0,
        succeeded_last_week: 0,
        failed_last_week: 0,
    };

    for row in &rows {
        accumulate(&mut stats, row, one_day_ago, one_week_ago);
    }

    Ok(stats)
}

fn accumulate(
    stats: &mut UserStatistics,
    row: &Transfer,
    one_day_ago: chrono::DateTime<Utc>,
    one_week_ago: chrono::DateTime<Utc>,
) {
    if row.state.is_queued() && !row.removed {
        stats.queued_files += 1;
        stats.queued_bytes += row.size;
        return;
    }

    let Some(ended_at) = row.ended_at else {
        return;
    };
    let succeeded = row.state.contains(TransferState::SUCCEEDED);
    let failed = is_failure(row.state);

    if ended_at >= one_week_ago {
        if succeeded {
            stats.succeeded_last_week += 1;
        } else if failed {
            stats.failed_last_week += 1;
        }
    }
    if ended_at >= one_day_ago {
        if succeeded {
            stats.succeeded_last_day += 1;
        } else if failed {
            stats.failed_last_day += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfer::InMemoryTransferStore;

    #[tokio::test]
    async fn counts_queued_files_and_bytes() {
        let store = InMemoryTransferStore::new();
        let mut a = Transfer::new_upload("1".into(), "alice", "a.bin", "/tmp/a".into(), 100);
        a.transition_to_queued_locally();
        store.add_or_supersede(a).await.unwrap();

        let stats = compute(&store, "alice").await.unwrap();
        assert_eq!(stats.queued_files, 1);
        assert_eq!(stats.queued_bytes, 100);
    }

    #[tokio::test]
    async fn counts_recent_successes_and_failures() {
        let store = InMemoryTransferStore::new();
        let mut ok = Transfer::new_upload("1".into(), "alice", "a.bin", "/tmp/a".into(), 10);
        ok.mark_completed(TransferState::SUCCEEDED, None);
        store.add_or_supersede(ok).await.unwrap();

        let mut failed = Transfer::new_upload("2".into(), "alice", "b.bin", "/tmp/b".into(), 10);
        failed.mark_completed(TransferState::ERRORED, Some("boom".into()));
        store.add_or_supersede(failed).await.unwrap();

        let stats = compute(&store, "alice").await.unwrap();
        assert_eq!(stats.succeeded_last_day, 1);
        assert_eq!(stats.failed_last_day, 1);
        assert_eq!(stats.succeeded_last_week, 1);
        assert_eq!(stats.failed_last_week, 1);
    }
}
