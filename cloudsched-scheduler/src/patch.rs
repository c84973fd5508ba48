//! One-shot patch files
//!
//! The only control plane of a running scheduler: an operator drops
//! `<tasklist>.patch` beside the task list and the producer consumes
//! it on its next tick. The file is deleted as soon as it is read, so
//! a patch can never be replayed.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Requested transition for a patched task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PatchAction {
    /// Re-queue a task that is not currently scheduled
    Schedule,
    /// Pull a queued task out before it runs
    Withdraw,
}

/// One patch entry, keyed by flavor in the patch file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PatchRecord {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action: Option<PatchAction>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remaining_retries_testcase: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remaining_retries_resource: Option<u32>,
}

/// All entries of one patch file.
pub type PatchSet = BTreeMap<String, PatchRecord>;

/// Path of the patch file beside a task list.
pub fn patch_path(tasklist: &Path) -> PathBuf {
    let mut path = tasklist.as_os_str().to_os_string();
    path.push(".patch");
    PathBuf::from(path)
}

/// Consume the patch file beside the task list, if present.
///
/// The file is removed before its content is interpreted; a malformed
/// patch is logged and dropped rather than retried forever.
pub fn take_patch(tasklist: &Path) -> Option<PatchSet> {
    let path = patch_path(tasklist);
    if !path.exists() {
        return None;
    }

    info!("found patch file: {}", path.display());
    let content = std::fs::read_to_string(&path);

    info!("remove patch file: {}", path.display());
    if let Err(e) = std::fs::remove_file(&path) {
        warn!("failed to remove patch file {}: {e}", path.display());
    }

    let content = match content {
        Ok(content) => content,
        Err(e) => {
            warn!("failed to read patch file {}: {e}", path.display());
            return None;
        }
    };

    match toml::from_str::<PatchSet>(&content) {
        Ok(patches) => {
            debug!("got patch(es): {patches:?}");
            Some(patches)
        }
        Err(e) => {
            warn!("errors while applying the patch: {e}");
            None
        }
    }
}
