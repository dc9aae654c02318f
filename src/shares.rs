//! Resolves a `(username, filename)` pair to a local path. The real share
//! scanner/index is out of scope here (see Non-goals); this is the thin
//! seam `UploadManager::enqueue` needs to validate a request before it
//! ever writes a `Transfer` row.

use std::path::PathBuf;

use async_trait::async_trait;
use dashmap::DashMap;

#[async_trait]
pub trait ShareResolver: Send + Sync {
    /// `None` means the file is not shared with this user (or not shared
    /// at all) — `UploadManager::enqueue` rejects the request before
    /// writing anything.
    async fn resolve(&self, username: &str, filename: &str) -> Option<PathBuf>;
}

#[derive(Debug, Default)]
pub struct InMemoryShareResolver {
    files: DashMap<String, PathBuf>,
}

impl InMemoryShareResolver {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn share(&self, filename: &str, local_path: impl Into<PathBuf>) {
        self.files.insert(filename.to_string(), local_path.into());
    }
}

#[async_trait]
impl ShareResolver for InMemoryShareResolver {
    async fn resolve(&self, _username: &str, filename: &str) -> Option<PathBuf> {
        self.files.get(filename).map(|p| p.clone())
    }
}
