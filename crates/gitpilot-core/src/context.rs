//! Repository facts gathered for prompt composition.
//!
//! Builders are read-only and hold no permit. Each call reflects the
//! repository as it is at call time.

use std::fmt::Write as _;
use std::path::Path;

use serde::Serialize;

use crate::error::Result;
use crate::git::{CommitInfo, GitClient, StagedFile};
use crate::types::OperationOptions;

pub const RECENT_COMMITS: usize = 10;
pub const PREVIEW_DIFF_LIMIT: usize = 500;
pub const TRUNCATION_MARKER: &str = "\n... (diff truncated)";
pub const DIFF_HEADING: &str = "Diff:\n";
pub const DEFAULT_REMOTE: &str = "origin";

// ---------------------------------------------------------------------------
// Commit context
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitContext {
    pub branch: String,
    pub staged_files: Vec<StagedFile>,
    pub diff: String,
    pub recent_commits: Vec<CommitInfo>,
}

/// Fetch staged files, the staged diff, the branch and recent history in
/// parallel. Any failure fails the whole build.
pub async fn build_commit_context(git: &dyn GitClient, cwd: &Path) -> Result<CommitContext> {
    let (staged_files, diff, branch, recent_commits) = tokio::try_join!(
        git.staged_files(cwd),
        git.staged_diff(cwd),
        git.current_branch(cwd),
        git.log(cwd, RECENT_COMMITS, 0),
    )?;
    Ok(CommitContext {
        branch,
        staged_files,
        diff,
        recent_commits,
    })
}

impl CommitContext {
    pub fn total_additions(&self) -> u32 {
        self.staged_files.iter().map(|f| f.additions).sum()
    }

    pub fn total_deletions(&self) -> u32 {
        self.staged_files.iter().map(|f| f.deletions).sum()
    }

    /// The staged-file section: a count line, then every staged path exactly
    /// once with its status and line counts.
    pub fn file_list(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "Staged files ({}, +{} -{}):",
            self.staged_files.len(),
            self.total_additions(),
            self.total_deletions()
        );
        for f in &self.staged_files {
            let _ = writeln!(
                out,
                "  {:<8} {} (+{} -{})",
                status_label(f),
                f.path,
                f.additions,
                f.deletions
            );
        }
        out
    }

    /// The staged diff clipped to [`PREVIEW_DIFF_LIMIT`] characters.
    pub fn diff_excerpt(&self) -> String {
        truncate_diff(&self.diff, PREVIEW_DIFF_LIMIT)
    }

    /// Human-readable summary: branch, [`file_list`](Self::file_list), recent
    /// commits, then the [`diff_excerpt`](Self::diff_excerpt) under a
    /// [`DIFF_HEADING`] line. Paths repeat inside the diff itself.
    pub fn preview(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "Branch: {}", self.branch);
        out.push_str(&self.file_list());
        if !self.recent_commits.is_empty() {
            let _ = writeln!(out, "Recent commits:");
            for c in &self.recent_commits {
                let _ = writeln!(out, "  {} {}", c.short_hash, c.subject);
            }
        }
        out.push_str(DIFF_HEADING);
        out.push_str(&self.diff_excerpt());
        out
    }
}

fn status_label(file: &StagedFile) -> &'static str {
    match file.status {
        crate::git::FileStatus::Added => "added",
        crate::git::FileStatus::Modified => "modified",
        crate::git::FileStatus::Deleted => "deleted",
    }
}

/// Clip `diff` to `limit` characters, appending [`TRUNCATION_MARKER`] when
/// anything was cut.
pub fn truncate_diff(diff: &str, limit: usize) -> String {
    match diff.char_indices().nth(limit) {
        Some((idx, _)) => format!("{}{}", &diff[..idx], TRUNCATION_MARKER),
        None => diff.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Push context
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PushContext {
    pub branch: String,
    /// Remote the push will target.
    pub remote: String,
    /// Branch the push will publish; the current branch unless overridden.
    pub push_branch: String,
    pub remotes: Vec<String>,
    pub has_upstream: bool,
    pub upstream: Option<String>,
    pub ahead_count: u32,
    pub behind_count: u32,
    pub unpushed_commits: Vec<CommitInfo>,
}

pub async fn build_push_context(
    git: &dyn GitClient,
    cwd: &Path,
    options: &OperationOptions,
) -> Result<PushContext> {
    let (status, unpushed_commits, remotes) = tokio::try_join!(
        git.push_status(cwd),
        git.unpushed_commits(cwd),
        git.remotes(cwd),
    )?;

    let upstream_remote = status.upstream.as_ref().map(|u| u.remote.as_str());
    let remote = resolve_remote(options.remote.as_deref(), upstream_remote, &remotes);

    let push_branch = options
        .branch
        .clone()
        .unwrap_or_else(|| status.branch.clone());

    Ok(PushContext {
        remote,
        push_branch,
        remotes,
        has_upstream: status.upstream.is_some(),
        upstream: status
            .upstream
            .as_ref()
            .map(|u| format!("{}/{}", u.remote, u.branch)),
        ahead_count: status.ahead,
        behind_count: status.behind,
        branch: status.branch,
        unpushed_commits,
    })
}

/// Pick the push remote: explicit option, then the upstream's remote, then a
/// remote named `origin`, then the first remote. With no remotes at all the
/// answer is `origin`.
pub fn resolve_remote(explicit: Option<&str>, upstream: Option<&str>, remotes: &[String]) -> String {
    if let Some(r) = explicit {
        return r.to_string();
    }
    if let Some(r) = upstream {
        return r.to_string();
    }
    if remotes.iter().any(|r| r == DEFAULT_REMOTE) {
        return DEFAULT_REMOTE.to_string();
    }
    remotes
        .first()
        .cloned()
        .unwrap_or_else(|| DEFAULT_REMOTE.to_string())
}

impl PushContext {
    pub fn preview(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "Push {} to {} (current branch {})",
            self.push_branch, self.remote, self.branch
        );
        match &self.upstream {
            Some(u) => {
                let _ = writeln!(
                    out,
                    "Upstream: {u} (ahead {}, behind {})",
                    self.ahead_count, self.behind_count
                );
            }
            None => {
                let _ = writeln!(out, "No upstream ({} local commits)", self.ahead_count);
            }
        }
        let _ = writeln!(out, "Unpushed commits ({}):", self.unpushed_commits.len());
        for c in &self.unpushed_commits {
            let _ = writeln!(out, "  {} {}", c.short_hash, c.subject);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::git::FileStatus;

    fn remotes(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn resolve_prefers_origin_over_order() {
        assert_eq!(resolve_remote(None, None, &remotes(&["origin", "upstream"])), "origin");
        assert_eq!(resolve_remote(None, None, &remotes(&["upstream", "origin"])), "origin");
    }

    #[test]
    fn resolve_falls_back_to_first_remote() {
        assert_eq!(resolve_remote(None, None, &remotes(&["upstream"])), "upstream");
    }

    #[test]
    fn resolve_explicit_option_always_wins() {
        for configured in [vec![], remotes(&["origin"]), remotes(&["a", "b"])] {
            assert_eq!(resolve_remote(Some("custom"), Some("origin"), &configured), "custom");
        }
    }

    #[test]
    fn resolve_upstream_beats_origin() {
        assert_eq!(
            resolve_remote(None, Some("fork"), &remotes(&["origin", "fork"])),
            "fork"
        );
    }

    #[test]
    fn resolve_without_remotes_defaults_to_origin() {
        assert_eq!(resolve_remote(None, None, &[]), "origin");
    }

    fn file(path: &str, status: FileStatus) -> StagedFile {
        StagedFile {
            path: path.into(),
            status,
            additions: 2,
            deletions: 1,
        }
    }

    #[test]
    fn file_list_names_each_path_once_and_preview_clips_diff() {
        let paths = ["src/lib.rs", "src/queue.rs", "old.txt"];
        let mut diff: String = paths
            .iter()
            .map(|p| format!("diff --git a/{p} b/{p}\n--- a/{p}\n+++ b/{p}\n"))
            .collect();
        diff.push_str(&"x".repeat(800));
        let ctx = CommitContext {
            branch: "main".into(),
            staged_files: vec![
                file(paths[0], FileStatus::Modified),
                file(paths[1], FileStatus::Added),
                file(paths[2], FileStatus::Deleted),
            ],
            diff,
            recent_commits: vec![],
        };
        let files = ctx.file_list();
        for path in paths {
            assert_eq!(files.matches(path).count(), 1, "{path}");
        }
        assert!(files.starts_with("Staged files (3, +6 -3):"));

        let preview = ctx.preview();
        let (head, excerpt) = preview.split_once(DIFF_HEADING).unwrap();
        assert!(head.ends_with(&files));
        assert_eq!(excerpt, ctx.diff_excerpt());
        assert!(excerpt.ends_with(TRUNCATION_MARKER));
        assert_eq!(excerpt.chars().count(), PREVIEW_DIFF_LIMIT + TRUNCATION_MARKER.len());
    }

    #[test]
    fn short_diff_is_not_marked() {
        assert_eq!(truncate_diff("short", PREVIEW_DIFF_LIMIT), "short");
        assert_eq!(truncate_diff(&"y".repeat(500), 500), "y".repeat(500));
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        let diff = "é".repeat(600);
        let clipped = truncate_diff(&diff, 500);
        assert!(clipped.starts_with(&"é".repeat(500)));
        assert!(clipped.ends_with(TRUNCATION_MARKER));
    }
}
