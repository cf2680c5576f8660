//! Local disk headroom check run before every transfer.
//!
//! The remote size comes from `du -sk` on the target; the local numbers come
//! from the volume holding the staging directory. A transfer is approved only
//! when `(remote_kb + used_kb) * 100 / total_kb` stays strictly under
//! [`SPACE_THRESHOLD_PCT`]. When either side cannot be measured the check is
//! unverified and [`UnverifiedPolicy`] decides.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::ValueEnum;

use crate::remote::RemoteExec;
use crate::remote::command;

/// Projected usage, in percent, at which transfers are refused.
pub const SPACE_THRESHOLD_PCT: u64 = 85;

/// What to do with a transfer whose size check could not run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum UnverifiedPolicy {
    /// Report it as skipped and move on.
    #[default]
    Skip,
    /// Transfer anyway.
    Proceed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiskUsage {
    pub total_kb: u64,
    pub used_kb: u64,
}

/// Source of local volume statistics.
pub trait VolumeStats: Send + Sync {
    fn usage(&self, path: &Path) -> std::io::Result<DiskUsage>;
}

/// Statistics of the real volume containing a path.
pub struct LocalVolume;

impl VolumeStats for LocalVolume {
    fn usage(&self, path: &Path) -> std::io::Result<DiskUsage> {
        let total = fs2::total_space(path)?;
        let free = fs2::free_space(path)?;
        Ok(DiskUsage {
            total_kb: total / 1024,
            used_kb: total.saturating_sub(free) / 1024,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Approved { ratio: u64 },
    Rejected { ratio: u64 },
    Unverified(String),
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Approved { ratio } => write!(f, "projected usage {ratio}%"),
            Self::Rejected { ratio } => write!(
                f,
                "projected usage {ratio}% is not under {SPACE_THRESHOLD_PCT}%"
            ),
            Self::Unverified(reason) => write!(f, "unverified: {reason}"),
        }
    }
}

/// Projected usage in percent, or `None` for an empty volume.
pub fn projected_ratio(remote_kb: u64, usage: DiskUsage) -> Option<u64> {
    if usage.total_kb == 0 {
        return None;
    }
    Some(remote_kb.saturating_add(usage.used_kb).saturating_mul(100) / usage.total_kb)
}

pub fn evaluate(remote_kb: u64, usage: DiskUsage) -> Verdict {
    match projected_ratio(remote_kb, usage) {
        Some(ratio) if ratio < SPACE_THRESHOLD_PCT => Verdict::Approved { ratio },
        Some(ratio) => Verdict::Rejected { ratio },
        None => Verdict::Unverified("local volume reports zero capacity".to_string()),
    }
}

#[derive(Clone)]
pub struct SpaceGuard {
    policy: UnverifiedPolicy,
    volume: Arc<dyn VolumeStats>,
    staging: PathBuf,
}

impl SpaceGuard {
    pub fn new(policy: UnverifiedPolicy, staging: impl Into<PathBuf>) -> Self {
        Self::with_volume(policy, staging, Arc::new(LocalVolume))
    }

    pub fn with_volume(
        policy: UnverifiedPolicy,
        staging: impl Into<PathBuf>,
        volume: Arc<dyn VolumeStats>,
    ) -> Self {
        Self {
            policy,
            volume,
            staging: staging.into(),
        }
    }

    pub fn policy(&self) -> UnverifiedPolicy {
        self.policy
    }

    /// Check one remote path against the staging volume.
    pub async fn check(&self, remote: &dyn RemoteExec, path: &str) -> Verdict {
        let remote_kb = match remote.run_command(&command::disk_usage_kb(path)).await {
            Ok(output) => match parse_kb(&output) {
                Some(kb) => kb,
                None => {
                    return Verdict::Unverified(format!(
                        "cannot parse size of {path} from `{}`",
                        output.trim()
                    ));
                }
            },
            Err(e) => return Verdict::Unverified(format!("size query failed: {e}")),
        };

        let usage = match self.volume.usage(&self.staging) {
            Ok(usage) => usage,
            Err(e) => {
                return Verdict::Unverified(format!(
                    "cannot stat {}: {e}",
                    self.staging.display()
                ));
            }
        };

        let verdict = evaluate(remote_kb, usage);
        tracing::debug!(
            remote = %remote.target(),
            remote_path = %path,
            remote_kb,
            used_kb = usage.used_kb,
            total_kb = usage.total_kb,
            %verdict,
            "space check"
        );
        verdict
    }
}

/// Size from the last non-empty line of the `du` output.
fn parse_kb(output: &str) -> Option<u64> {
    output
        .lines()
        .rev()
        .map(str::trim)
        .find(|line| !line.is_empty())?
        .split_whitespace()
        .next()?
        .parse()
        .ok()
}
