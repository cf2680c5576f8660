//! Pattern-to-path resolution against a live target filesystem.
//!
//! A directory pattern such as `/var/log/app-[0-9]+/current` is resolved one
//! segment at a time: each segment is matched against a listing of the
//! prefix resolved so far. Literal segments must match an entry exactly;
//! regex segments are matched with a trailing anchor and, when several
//! entries match, the last line of the listing wins. The file pattern is then
//! matched against the final directory and every matching entry becomes its
//! own [`ResolvedPath`]. Finally each file is probed once for a symlink.

use thiserror::Error;

use crate::model::ResolvedPath;
use crate::remote::RemoteExec;
use crate::remote::command::{self, sanitize_segment};

#[derive(Error, Debug)]
pub enum ResolveError {
    #[error("no entry under {prefix} matches `{pattern}`: {detail}")]
    NoMatch {
        prefix: String,
        pattern: String,
        detail: String,
    },

    #[error("file pattern is empty after sanitizing `{0}`")]
    EmptyFilePattern(String),
}

/// Characters that make a segment a regex rather than a literal name. A bare
/// `.` does not count, so `access.log` is literal.
const REGEX_META: &[char] = &[
    '\\', '+', '*', '?', '(', ')', '|', '[', ']', '{', '}', '^', '$',
];

/// Whether `segment` names an entry literally.
pub fn is_literal(segment: &str) -> bool {
    !segment.contains(REGEX_META)
}

/// Resolves patterns through one target's [`RemoteExec`].
pub struct PathResolver<'a> {
    remote: &'a dyn RemoteExec,
}

impl<'a> PathResolver<'a> {
    pub fn new(remote: &'a dyn RemoteExec) -> Self {
        Self { remote }
    }

    /// Resolve `dir_pattern` and `file_pattern` into the concrete files to
    /// transfer, with symlinks followed one level.
    pub async fn resolve(
        &self,
        dir_pattern: &str,
        file_pattern: &str,
    ) -> Result<Vec<ResolvedPath>, ResolveError> {
        let dir = self.resolve_dir(dir_pattern).await?;
        let names = self.resolve_files(&dir, file_pattern).await?;

        let mut paths = Vec::with_capacity(names.len());
        for name in names {
            paths.push(self.follow_link(&format!("{dir}{name}")).await);
        }
        Ok(paths)
    }

    /// Resolve a directory pattern to an absolute path ending in `/`.
    ///
    /// Every pattern is taken as absolute; `/` resolves to itself without
    /// touching the target.
    pub async fn resolve_dir(&self, dir_pattern: &str) -> Result<String, ResolveError> {
        let mut prefix = String::from("/");
        if dir_pattern.trim() == "/" {
            return Ok(prefix);
        }

        for raw in dir_pattern.split('/') {
            let segment = sanitize_segment(raw);
            if segment.is_empty() {
                continue;
            }
            let matched = self.match_segment(&prefix, &segment).await?;
            let entry = matched.last().map(String::as_str).unwrap_or_default();
            prefix.push_str(entry);
            prefix.push('/');
        }

        tracing::debug!(remote = %self.remote.target(), pattern = %dir_pattern, dir = %prefix, "resolved directory");
        Ok(prefix)
    }

    /// Every entry of `dir` matching `file_pattern`, in listing order.
    pub async fn resolve_files(
        &self,
        dir: &str,
        file_pattern: &str,
    ) -> Result<Vec<String>, ResolveError> {
        let pattern = sanitize_segment(file_pattern.trim_matches('/'));
        if pattern.is_empty() {
            return Err(ResolveError::EmptyFilePattern(file_pattern.to_string()));
        }
        self.match_segment(dir, &pattern).await
    }

    /// Run the listing for one segment. An error from the remote side
    /// (including a malformed regex) counts as no match.
    async fn match_segment(&self, prefix: &str, segment: &str) -> Result<Vec<String>, ResolveError> {
        let cmd = if is_literal(segment) {
            command::list_exact(prefix, segment)
        } else {
            command::list_matching(prefix, segment)
        };

        let output = self
            .remote
            .run_command(&cmd)
            .await
            .map_err(|e| ResolveError::NoMatch {
                prefix: prefix.to_string(),
                pattern: segment.to_string(),
                detail: e.to_string(),
            })?;

        let lines: Vec<String> = output
            .lines()
            .map(str::trim_end)
            .filter(|line| !line.is_empty())
            .map(String::from)
            .collect();

        if lines.is_empty() {
            return Err(ResolveError::NoMatch {
                prefix: prefix.to_string(),
                pattern: segment.to_string(),
                detail: "listing returned nothing".to_string(),
            });
        }
        Ok(lines)
    }

    /// Replace `path` with its link target when it is a symlink.
    ///
    /// Relative link targets are taken relative to the containing directory
    /// and the result is normalized lexically, so `..` never reaches a
    /// command. Link text that cannot be quoted leaves `path` as it is. The
    /// rewritten path is not probed again.
    pub async fn follow_link(&self, path: &str) -> ResolvedPath {
        let resolved = ResolvedPath::new(path);
        let output = match self.remote.run_command(&command::symlink_probe(path)).await {
            Ok(output) => output,
            // grep exits non-zero when the entry is not a link.
            Err(_) => return resolved,
        };

        let Some(link) = link_target(&output) else {
            return resolved;
        };
        if link.contains('\'') {
            tracing::warn!(remote = %self.remote.target(), path = %path, link = %link, "symlink target contains a quote, not following");
            return resolved;
        }

        let rewritten = if link.starts_with('/') {
            normalize_absolute(link)
        } else {
            normalize_absolute(&format!("{}/{link}", resolved.parent()))
        };

        tracing::debug!(remote = %self.remote.target(), from = %path, to = %rewritten, "following symlink");
        ResolvedPath {
            path: rewritten,
            followed_from: Some(path.to_string()),
        }
    }
}

/// Lexically normalize an absolute path: `.` and empty components vanish and
/// `..` pops one component, never climbing above `/`.
fn normalize_absolute(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }
    format!("/{}", parts.join("/"))
}

/// Link target text from an `ls -ld` line: whatever follows ` -> `.
fn link_target(listing: &str) -> Option<&str> {
    let line = listing.lines().rev().find(|l| !l.trim().is_empty())?;
    let (_, target) = line.split_once(" -> ")?;
    let target = target.trim();
    (!target.is_empty()).then_some(target)
}
