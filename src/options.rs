//! The configuration snapshot the core consumes.
//!
//! Parsing a config file into this shape is out of scope here (that's the
//! outer layer's job); this module only defines the recognized shape,
//! validates it, and computes a content hash used to detect whether a new
//! snapshot is meaningfully different from the last one Reconfigure saw.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Reserved group name for peers the network flags as privileged. Always
/// present, always highest priority, regardless of what the operator
/// configures.
pub const PRIVILEGED_GROUP: &str = "privileged";
pub const DEFAULT_GROUP: &str = "default";
pub const LEECHERS_GROUP: &str = "leechers";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    FirstInFirstOut,
    RoundRobin,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupOptions {
    pub slots: u32,
    pub priority: u32,
    pub strategy: Strategy,
    pub speed_limit: Option<u64>,
    #[serde(default)]
    pub members: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadOptions {
    pub global_slots: u32,
    pub global_speed_limit: Option<u64>,
    pub default: GroupOptions,
    pub leechers: GroupOptions,
    #[serde(default)]
    pub user_defined: HashMap<String, GroupOptions>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Options {
    pub upload: UploadOptions,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum OptionsError {
    #[error("group '{name}' priority must be at least 1, got {priority}")]
    InvalidPriority { name: String, priority: u32 },
    #[error("group '{name}' slots ({slots}) exceed global slots ({global_slots})")]
    SlotsExceedGlobal {
        name: String,
        slots: u32,
        global_slots: u32,
    },
}

impl Options {
    /// Checks the invariants spec'd for group priority (>= 1) and slot
    /// counts (a group can never reserve more slots than exist globally).
    pub fn validate(&self) -> Result<(), OptionsError> {
        let upload = &self.upload;
        for (name, group) in self.named_groups() {
            if group.priority < 1 {
                return Err(OptionsError::InvalidPriority {
                    name: name.to_string(),
                    priority: group.priority,
                });
            }
            if group.slots > upload.global_slots {
                return Err(OptionsError::SlotsExceedGlobal {
                    name: name.to_string(),
                    slots: group.slots,
                    global_slots: upload.global_slots,
                });
            }
        }
        Ok(())
    }

    fn named_groups(&self) -> Vec<(&str, &GroupOptions)> {
        let mut groups: Vec<(&str, &GroupOptions)> = vec![
            (DEFAULT_GROUP, &self.upload.default),
            (LEECHERS_GROUP, &self.upload.leechers),
        ];
        groups.extend(
            self.upload
                .user_defined
                .iter()
                .map(|(name, g)| (name.as_str(), g)),
        );
        groups
    }

    /// A content hash over the upload subtree, used by callers to decide
    /// whether a newly observed `Options` is worth a `Reconfigure` call.
    #[must_use]
    pub fn content_hash(&self) -> [u8; 32] {
        // Serialization failure here would mean the type itself is
        // malformed (non-string map keys, etc.), which `Options` never is.
        let bytes = serde_json::to_vec(&self.upload).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        hasher.finalize().into()
    }
}
