//! Patch worker contract
//!
//! The patcher itself runs elsewhere; this module describes how it reports back
//! and the one automatic retry policy of the system: when the worker runs out of
//! memory, the memory ceiling is lowered by a fixed step and the whole patch job
//! may be retried. The install step itself is never retried.

use std::path::PathBuf;

/// Prefix the worker puts in front of the name of a patch it could not find.
pub const MISSING_PATCH_MARKER: &str = "MISSING_PATCH:";

/// How a patch job ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatchWorkerOutcome {
    Success {
        patched_apk: PathBuf,
        /// Free-form output metadata, passed through untouched
        metadata: Option<String>,
    },
    Failed {
        message: String,
        missing_patch: Option<String>,
    },
    OutOfMemory,
}

impl PatchWorkerOutcome {
    /// Failure from a raw worker message, extracting a missing-patch marker.
    pub fn failed(message: impl Into<String>) -> Self {
        let message = message.into();
        Self::Failed {
            missing_patch: parse_missing_patch(&message),
            message,
        }
    }
}

/// Name following `MISSING_PATCH:` in a worker message, if any.
pub fn parse_missing_patch(message: &str) -> Option<String> {
    let start = message.find(MISSING_PATCH_MARKER)? + MISSING_PATCH_MARKER.len();
    let name = message[start..]
        .lines()
        .next()
        .unwrap_or_default()
        .trim();
    (!name.is_empty()).then(|| name.to_string())
}

/// Memory ceiling of the worker process, stepped down after OOM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryLimit {
    pub current_mb: u32,
    pub step_mb: u32,
    pub floor_mb: u32,
}

impl MemoryLimit {
    pub const fn new(current_mb: u32, step_mb: u32, floor_mb: u32) -> Self {
        Self {
            current_mb,
            step_mb,
            floor_mb,
        }
    }

    /// Lower the limit by one step. `None` once the floor would be crossed.
    pub fn step_down(&mut self) -> Option<u32> {
        let next = self.current_mb.checked_sub(self.step_mb)?;
        if self.step_mb == 0 || next < self.floor_mb {
            return None;
        }
        self.current_mb = next;
        Some(next)
    }
}

/// What the caller should do after an out-of-memory worker exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    RetryWithMemoryLimit(u32),
    GiveUp,
}

impl RetryDecision {
    pub fn after_out_of_memory(limit: &mut MemoryLimit) -> Self {
        match limit.step_down() {
            Some(mb) => {
                log::warn!("Patcher ran out of memory, retry with a {} MB limit", mb);
                Self::RetryWithMemoryLimit(mb)
            }
            None => {
                log::error!(
                    "Patcher ran out of memory at the {} MB floor",
                    limit.current_mb
                );
                Self::GiveUp
            }
        }
    }
}
