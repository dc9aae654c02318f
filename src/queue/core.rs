//! The Upload Queue: per-user enqueued files, per-group slot accounting,
//! and the candidate-selection algorithm the Scheduler drives.
//!
//! `SyncRoot` is a plain `std::sync::Mutex`, not `tokio::sync::Mutex` —
//! every critical section below is synchronous (no `.await` while held),
//! so the cheaper, simpler std primitive is the right tool — `std::sync`
//! mutexes around purely in-memory bookkeeping, `tokio::sync::Mutex`
//! reserved for sections that actually suspend.

use std::collections::{HashMap, VecDeque};

use rand::Rng;
use tracing::instrument;

use crate::options::{GroupOptions, Options, DEFAULT_GROUP, LEECHERS_GROUP, PRIVILEGED_GROUP, Strategy};

use super::entry::{SlotAwait, SlotOutcome, UploadEntry};
use super::error::QueueError;
use super::group::Group;

/// One transfer the Scheduler is considering, with its group already
/// resolved (the Scheduler looks this up via `UserService` before calling
/// in, since resolving it here would mean awaiting while `SyncRoot` is
/// held).
#[derive(Debug, Clone)]
pub struct ResolvedCandidate {
    pub username: String,
    pub filename: String,
    pub group: String,
}

#[derive(Debug, Clone)]
pub struct SelectedUpload {
    pub username: String,
    pub filename: String,
    pub group: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompleteOutcome {
    Removed,
    NotFound,
}

fn priority_group(name: &str, options: &GroupOptions) -> Group {
    Group {
        name: name.to_string(),
        priority: options.priority,
        slots: options.slots,
        used_slots: 0,
        strategy: options.strategy,
    }
}

fn build_groups(options: &Options) -> HashMap<String, Group> {
    let upload = &options.upload;
    let mut groups = HashMap::new();
    groups.insert(DEFAULT_GROUP.to_string(), priority_group(DEFAULT_GROUP, &upload.default));
    groups.insert(LEECHERS_GROUP.to_string(), priority_group(LEECHERS_GROUP, &upload.leechers));
    for (name, group) in &upload.user_defined {
        groups.insert(name.clone(), priority_group(name, group));
    }
    groups.insert(
        PRIVILEGED_GROUP.to_string(),
        Group {
            name: PRIVILEGED_GROUP.to_string(),
            priority: 0,
            slots: upload.global_slots,
            used_slots: 0,
            strategy: Strategy::FirstInFirstOut,
        },
    );
    groups
}

struct QueueState {
    uploads: HashMap<String, VecDeque<UploadEntry>>,
    groups: HashMap<String, Group>,
}

pub struct UploadQueue {
    inner: std::sync::Mutex<QueueState>,
}

impl UploadQueue {
    #[must_use]
    pub fn new(options: &Options) -> Self {
        Self {
            inner: std::sync::Mutex::new(QueueState {
                uploads: HashMap::new(),
                groups: build_groups(options),
            }),
        }
    }

    #[allow(clippy::expect_used)]
    fn lock(&self) -> std::sync::MutexGuard<'_, QueueState> {
        self.inner.lock().expect("upload queue lock poisoned")
    }

    /// Registers a file as queued for `username`. Returns `false` without
    /// effect if the pair is already present — Enqueue is idempotent.
    #[instrument(skip(self))]
    pub fn enqueue(&self, username: &str, filename: &str) -> bool {
        let mut state = self.lock();
        let deque = state.uploads.entry(username.to_string()).or_default();
        if deque.iter().any(|e| e.filename == filename) {
            return false;
        }
        deque.push_back(UploadEntry::new(username, filename));
        true
    }

    /// Hands back the one-shot awaitable for an enqueued entry. `None` if
    /// the entry doesn't exist, or its awaitable was already taken (the
    /// ordering guarantee is that this is called at most once per entry).
    pub fn await_start(&self, username: &str, filename: &str) -> Option<SlotAwait> {
        let mut state = self.lock();
        let entry = state
            .uploads
            .get_mut(username)?
            .iter_mut()
            .find(|e| e.filename == filename)?;
        entry.take_await()
    }

    /// Cancels an entry that has not yet been granted a slot. A no-op
    /// (returns `false`) if the entry doesn't exist or has already been
    /// granted — cancellation past that point is the Scheduler's
    /// `TryCancel` path, not this one.
    pub fn cancel(&self, username: &str, filename: &str) -> bool {
        let mut state = self.lock();
        let Some(deque) = state.uploads.get_mut(username) else {
            return false;
        };
        let Some(entry) = deque.iter_mut().find(|e| e.filename == filename && !e.ready) else {
            return false;
        };
        entry.resolve(SlotOutcome::Cancelled);
        let filename = filename.to_string();
        deque.retain(|e| !(e.filename == filename && !e.ready));
        if deque.is_empty() {
            state.uploads.remove(username);
        }
        true
    }

    /// Read-only: picks the next candidate to dispatch without mutating
    /// any state. Exposed mainly for tests; `select_and_grant` is the
    /// atomic operation the Scheduler actually drives.
    #[must_use]
    pub fn select_next(&self, candidates: &[ResolvedCandidate]) -> Option<SelectedUpload> {
        let state = self.lock();
        Self::select_locked(&state, candidates)
    }

    fn select_locked(state: &QueueState, candidates: &[ResolvedCandidate]) -> Option<SelectedUpload> {
        let mut group_order: Vec<&Group> = state.groups.values().collect();
        group_order.sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.name.cmp(&b.name)));

        for group in group_order {
            if !group.has_free_slot() {
                continue;
            }

            let mut members: Vec<(&str, &str, tokio::time::Instant)> = Vec::new();
            for candidate in candidates.iter().filter(|c| c.group == group.name) {
                if let Some(deque) = state.uploads.get(candidate.username.as_str()) {
                    if let Some(entry) = deque.iter().find(|e| e.filename == candidate.filename && !e.ready) {
                        members.push((&candidate.username, &candidate.filename, entry.enqueued_at));
                    }
                }
            }
            if members.is_empty() {
                continue;
            }

            let picked = match group.strategy {
                Strategy::FirstInFirstOut => members.iter().min_by_key(|(_, _, t)| *t).copied(),
                Strategy::RoundRobin => {
                    let mut users: Vec<&str> = members.iter().map(|(u, _, _)| *u).collect();
                    users.sort_unstable();
                    users.dedup();
                    let chosen = users[rand::thread_rng().gen_range(0..users.len())];
                    members
                        .iter()
                        .filter(|(u, _, _)| *u == chosen)
                        .min_by_key(|(_, _, t)| *t)
                        .copied()
                }
            };

            if let Some((username, filename, _)) = picked {
                return Some(SelectedUpload {
                    username: username.to_string(),
                    filename: filename.to_string(),
                    group: group.name.clone(),
                });
            }
        }
        None
    }

    /// Marks an entry Ready, increments `group`'s `UsedSlots`, and fires
    /// its one-shot signal. `group` is the group the selection algorithm
    /// resolved the candidate against, which may differ from whatever
    /// `UserService` reports at `Complete` time — the slot is always
    /// released against the group it was taken from.
    #[instrument(skip(self))]
    pub fn grant(&self, username: &str, filename: &str, group: &str) -> Result<(), QueueError> {
        let mut state = self.lock();
        Self::grant_locked(&mut state, username, filename, group)
    }

    fn grant_locked(state: &mut QueueState, username: &str, filename: &str, group: &str) -> Result<(), QueueError> {
        let entry = state
            .uploads
            .get_mut(username)
            .and_then(|deque| deque.iter_mut().find(|e| e.filename == filename))
            .ok_or_else(|| QueueError::NotFound {
                username: username.to_string(),
                filename: filename.to_string(),
            })?;
        entry.ready = true;
        entry.granted_group = Some(group.to_string());
        entry.resolve(SlotOutcome::Granted);
        if let Some(g) = state.groups.get_mut(group) {
            g.used_slots += 1;
        }
        Ok(())
    }

    /// Atomically selects a candidate and grants it, so a concurrent
    /// selection pass can never observe (or re-pick) the slot in between.
    pub fn select_and_grant(&self, candidates: &[ResolvedCandidate]) -> Option<SelectedUpload> {
        let mut state = self.lock();
        let selected = Self::select_locked(&state, candidates)?;
        #[allow(clippy::expect_used)]
        Self::grant_locked(&mut state, &selected.username, &selected.filename, &selected.group)
            .expect("selection always targets an entry that exists");
        Some(selected)
    }

    /// Removes a granted entry, decrementing `UsedSlots` for the group it
    /// was granted under.
    #[instrument(skip(self))]
    pub fn complete(&self, username: &str, filename: &str) -> CompleteOutcome {
        let mut state = self.lock();
        let Some(deque) = state.uploads.get_mut(username) else {
            return CompleteOutcome::NotFound;
        };
        let Some(pos) = deque.iter().position(|e| e.filename == filename) else {
            return CompleteOutcome::NotFound;
        };
        #[allow(clippy::expect_used)]
        let entry = deque.remove(pos).expect("position was just found");
        if deque.is_empty() {
            state.uploads.remove(username);
        }
        if let Some(group_name) = &entry.granted_group {
            if let Some(group) = state.groups.get_mut(group_name) {
                group.used_slots = group.used_slots.saturating_sub(1);
            }
        }
        CompleteOutcome::Removed
    }

    /// Rebuilds the group table from a new `Options` snapshot, preserving
    /// `UsedSlots` for any group whose name survives the reconfigure.
    pub fn reconfigure(&self, options: &Options) {
        let mut state = self.lock();
        let mut new_groups = build_groups(options);
        for (name, group) in &mut new_groups {
            if let Some(old) = state.groups.get(name) {
                group.used_slots = old.used_slots;
            }
        }
        state.groups = new_groups;
    }

    /// Sum of `UsedSlots` across every group — the number of transfers
    /// currently holding a granted slot, regardless of group. This is the
    /// figure the Scheduler's global-slot admission check needs: entries
    /// still waiting in `await_start` haven't incremented any group's
    /// `UsedSlots` yet, so they're correctly excluded.
    #[must_use]
    pub fn total_used_slots(&self) -> u32 {
        let state = self.lock();
        state.groups.values().map(|g| g.used_slots).sum()
    }

    /// Number of entries currently occupying a slot in `group`.
    #[must_use]
    pub fn depth(&self, group: &str) -> usize {
        let state = self.lock();
        state
            .uploads
            .values()
            .flat_map(|d| d.iter())
            .filter(|e| e.granted_group.as_deref() == Some(group))
            .count()
    }

    #[must_use]
    pub fn snapshot(&self) -> Vec<(String, String, bool)> {
        let state = self.lock();
        state
            .uploads
            .values()
            .flat_map(|d| d.iter())
            .map(|e| (e.username.clone(), e.filename.clone(), e.ready))
            .collect()
    }
}
