//! Retention engine - decides which remote archives to delete.
//!
//! Pure function of its inputs: no network, no filesystem. Each tier is
//! bounded independently; the oldest excess objects of the requested tier
//! are selected, oldest first.

use crate::store::RemoteObject;
use crate::tier::BackupTier;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// How many archives of each tier survive a prune pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionPolicy {
    pub max_keep_daily: usize,
    pub max_keep_generational: usize,
}

impl RetentionPolicy {
    pub fn max_keep(&self, tier: BackupTier) -> usize {
        match tier {
            BackupTier::Daily => self.max_keep_daily,
            BackupTier::Generational => self.max_keep_generational,
        }
    }
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            max_keep_daily: 10,
            max_keep_generational: 10,
        }
    }
}

/// Age order: missing modification time first, then oldest, ties by id.
fn oldest_first(a: &RemoteObject, b: &RemoteObject) -> Ordering {
    a.modified_at
        .cmp(&b.modified_at)
        .then_with(|| a.id.cmp(&b.id))
}

/// Select the objects of `tier` that exceed the policy, oldest first.
///
/// Objects of the other tier are never selected. Returns an empty vector
/// when the tier is within its limit.
pub fn select_for_deletion(
    objects: &[RemoteObject],
    tier: BackupTier,
    policy: &RetentionPolicy,
) -> Vec<RemoteObject> {
    let max_keep = policy.max_keep(tier);
    let mut subset: Vec<&RemoteObject> = objects.iter().filter(|o| o.tier() == tier).collect();

    if subset.len() <= max_keep {
        return Vec::new();
    }

    subset.sort_by(|a, b| oldest_first(a, b));
    let excess = subset.len() - max_keep;
    subset.into_iter().take(excess).cloned().collect()
}
