//! Content fingerprint of what a branch commit is generated from.

use crate::config::{BranchConfig, PostUpgradeTasks, Upgrade};
use serde::Serialize;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct FingerprintMaterial<'a> {
    upgrades: &'a [Upgrade],
    post_upgrade_tasks: Option<&'a PostUpgradeTasks>,
}

/// Hex `blake3` over the upgrade set and the task configuration.
pub fn commit_fingerprint(config: &BranchConfig) -> String {
    let material = FingerprintMaterial {
        upgrades: &config.upgrades,
        post_upgrade_tasks: config.post_upgrade_tasks.as_ref(),
    };
    // Serializing plain data structs cannot fail.
    let bytes = serde_json::to_vec(&material).unwrap_or_default();
    blake3::hash(&bytes).to_hex().to_string()
}
