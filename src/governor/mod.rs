//! The Upload Governor: resolves a user's effective group and throttles
//! byte grants through that group's `TokenBucket`.
//!
//! The group->bucket map uses the same "clone the `Arc` snapshot, drop the
//! map lock, then `.await`" discipline `rate_limiter.rs` uses for its
//! per-domain state map, so no lock is ever held across a suspension
//! point.

mod bucket;

pub use bucket::{TokenBucket, TokenBucketSnapshot};

use std::collections::HashMap;
use std::sync::{Arc, RwLock as StdRwLock};
use std::time::Duration;

use tracing::instrument;

use crate::options::{GroupOptions, Options, DEFAULT_GROUP, LEECHERS_GROUP, PRIVILEGED_GROUP};
use crate::sync_support::CancellationToken;
use crate::user_service::UserService;

/// One byte grant handed out by the governor, tied to the specific bucket
/// instance it was drawn from. `Governor::give_back` always targets that
/// exact instance, never a fresh group lookup — if a `Reconfigure` has
/// since replaced the group's bucket, this handle still points at the old,
/// now-orphaned one, so unused bytes are effectively discarded rather than
/// rerouted to an unrelated bucket that happens to share the group's name.
#[derive(Debug)]
pub struct Grant {
    pub bytes: u64,
    bucket: Arc<TokenBucket>,
}

fn interval_for(speed_limit: Option<u64>) -> (u64, Duration) {
    match speed_limit {
        Some(limit) => (limit, Duration::from_secs(1)),
        None => (u64::MAX, Duration::from_secs(1)),
    }
}

fn build_buckets(options: &Options) -> HashMap<String, Arc<TokenBucket>> {
    let mut buckets = HashMap::new();
    let upload = &options.upload;

    let mut insert = |name: &str, group: &GroupOptions| {
        let (capacity, interval) = interval_for(group.speed_limit);
        buckets.insert(name.to_string(), Arc::new(TokenBucket::new(capacity, interval)));
    };
    insert(DEFAULT_GROUP, &upload.default);
    insert(LEECHERS_GROUP, &upload.leechers);
    for (name, group) in &upload.user_defined {
        insert(name, group);
    }

    let (priv_capacity, priv_interval) = interval_for(upload.global_speed_limit);
    buckets.insert(
        PRIVILEGED_GROUP.to_string(),
        Arc::new(TokenBucket::new(priv_capacity, priv_interval)),
    );

    buckets
}

pub struct Governor {
    user_service: Arc<dyn UserService>,
    buckets: StdRwLock<Arc<HashMap<String, Arc<TokenBucket>>>>,
}

impl Governor {
    #[must_use]
    pub fn new(options: &Options, user_service: Arc<dyn UserService>) -> Self {
        Self {
            user_service,
            buckets: StdRwLock::new(Arc::new(build_buckets(options))),
        }
    }

    #[allow(clippy::expect_used)]
    fn bucket_for(&self, group: &str) -> Arc<TokenBucket> {
        let snapshot = self
            .buckets
            .read()
            .expect("governor bucket map lock poisoned")
            .clone();
        snapshot
            .get(group)
            .or_else(|| snapshot.get(DEFAULT_GROUP))
            .cloned()
            .expect("default group bucket always exists")
    }

    #[instrument(skip(self, cancel), fields(username))]
    pub async fn acquire(&self, username: &str, requested: u64, cancel: &CancellationToken) -> Grant {
        let group = self.user_service.effective_group(username).await;
        let bucket = self.bucket_for(&group);
        let bytes = bucket.acquire(requested, cancel).await;
        Grant { bytes, bucket }
    }

    /// Returns the unused portion of a grant (`grant.bytes - actual`) to
    /// the bucket it was drawn from. `attempted` is accepted purely for
    /// parity with the external contract's logging shape; it does not
    /// affect how many bytes are returned.
    pub async fn give_back(&self, grant: Grant, attempted: u64, actual: u64) {
        let _ = attempted;
        let unused = grant.bytes.saturating_sub(actual);
        if unused > 0 {
            grant.bucket.give_back(unused).await;
        }
    }

    #[allow(clippy::expect_used)]
    pub async fn reconfigure(&self, options: &Options) {
        let new_buckets = build_buckets(options);
        let mut guard = self.buckets.write().expect("governor bucket map lock poisoned");
        *guard = Arc::new(new_buckets);
    }

    #[allow(clippy::expect_used)]
    pub async fn group_snapshot(&self) -> Vec<(String, TokenBucketSnapshot)> {
        let snapshot = self.buckets.read().expect("governor bucket map lock poisoned").clone();
        let mut out = Vec::with_capacity(snapshot.len());
        for (name, bucket) in snapshot.iter() {
            out.push((name.clone(), bucket.snapshot().await));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::{Strategy, UploadOptions};
    use crate::user_service::InMemoryUserService;
    use std::collections::HashMap as StdHashMap;

    fn options() -> Options {
        Options {
            upload: UploadOptions {
                global_slots: 10,
                global_speed_limit: None,
                default: GroupOptions {
                    slots: 5,
                    priority: 10,
                    strategy: Strategy::FirstInFirstOut,
                    speed_limit: Some(1000),
                    members: Vec::new(),
                },
                leechers: GroupOptions {
                    slots: 1,
                    priority: 100,
                    strategy: Strategy::FirstInFirstOut,
                    speed_limit: Some(10),
                    members: Vec::new(),
                },
                user_defined: StdHashMap::new(),
            },
        }
    }

    #[tokio::test]
    async fn acquire_routes_through_the_users_effective_group() {
        let user_service = Arc::new(InMemoryUserService::new());
        user_service.set_group("alice", "leechers");
        let governor = Governor::new(&options(), user_service);
        let cancel = CancellationToken::new();

        let grant = governor.acquire("alice", 100, &cancel).await;
        assert_eq!(grant.bytes, 10, "leechers bucket caps at 10 bytes/sec");
    }

    #[tokio::test]
    async fn returned_bytes_go_back_to_the_original_bucket_not_a_reconfigured_one() {
        let user_service = Arc::new(InMemoryUserService::new());
        let governor = Governor::new(&options(), user_service);
        let cancel = CancellationToken::new();

        let grant = governor.acquire("alice", 500, &cancel).await;
        assert_eq!(grant.bytes, 500);

        governor.reconfigure(&options()).await;
        governor.give_back(grant, 500, 100).await;

        let cancel2 = CancellationToken::new();
        let next = governor.acquire("alice", 1000, &cancel2).await;
        assert_eq!(next.bytes, 1000, "new bucket starts fresh; old grant's leftovers are discarded");
    }
}
