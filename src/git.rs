use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::GitCacheConfig;
use crate::error::SourceError;
use crate::process;
use crate::store::{CacheBackend, CacheStore, FileBackend, TtlRule};
use crate::util::canonical_key;

pub const GIT_CACHE_VERSION: &str = "1";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct GitStatus {
    pub branch: String,
    pub has_changes: bool,
    pub staged: u32,
    pub unstaged: u32,
    pub untracked: u32,
    pub ahead: Option<u32>,
    pub behind: Option<u32>,
}

impl GitStatus {
    /// `main (S:1,U:2,?:3,↑1)` style summary.
    pub fn summary(&self) -> String {
        let mut details = Vec::new();
        if self.staged > 0 {
            details.push(format!("S:{}", self.staged));
        }
        if self.unstaged > 0 {
            details.push(format!("U:{}", self.unstaged));
        }
        if self.untracked > 0 {
            details.push(format!("?:{}", self.untracked));
        }
        if let Some(ahead) = self.ahead.filter(|n| *n > 0) {
            details.push(format!("↑{ahead}"));
        }
        if let Some(behind) = self.behind.filter(|n| *n > 0) {
            details.push(format!("↓{behind}"));
        }

        if !details.is_empty() {
            format!("{} ({})", self.branch, details.join(","))
        } else if self.has_changes {
            format!("{} *", self.branch)
        } else {
            self.branch.clone()
        }
    }
}

/// Where a status comes from. Implemented by the git CLI and by test fakes.
pub trait GitSource {
    fn status(&self, dir: &Path) -> Result<Option<GitStatus>, SourceError>;
}

pub struct GitCli;

impl GitSource for GitCli {
    fn status(&self, dir: &Path) -> Result<Option<GitStatus>, SourceError> {
        fetch_git_status(dir)
    }
}

/// `Ok(None)` means `dir` is not inside a work tree.
pub fn fetch_git_status(dir: &Path) -> Result<Option<GitStatus>, SourceError> {
    match process::git(dir, &["rev-parse", "--git-dir"]) {
        Ok(_) => {}
        Err(SourceError::Exit { .. }) => return Ok(None),
        Err(err) => return Err(err),
    }

    let branch = fetch_git_branch(dir)?;
    let porcelain = process::git(dir, &["status", "--porcelain"])?;
    let (staged, unstaged, untracked) = count_porcelain(&porcelain);
    let (behind, ahead) = fetch_ahead_behind(dir).unzip();

    Ok(Some(GitStatus {
        branch,
        has_changes: staged > 0 || unstaged > 0 || untracked > 0,
        staged,
        unstaged,
        untracked,
        ahead,
        behind,
    }))
}

fn fetch_git_branch(dir: &Path) -> Result<String, SourceError> {
    let branch = match process::git(dir, &["rev-parse", "--abbrev-ref", "HEAD"]) {
        Ok(out) => out.trim().to_string(),
        // unborn branch: HEAD names a ref with no commit yet
        Err(SourceError::Exit { .. }) => {
            return Ok(process::git(dir, &["symbolic-ref", "--short", "HEAD"])?
                .trim()
                .to_string());
        }
        Err(err) => return Err(err),
    };
    if branch == "HEAD" {
        let short = process::git(dir, &["rev-parse", "--short", "HEAD"])?
            .trim()
            .to_string();
        if !short.is_empty() {
            return Ok(short);
        }
    }
    Ok(branch)
}

/// `(behind, ahead)` relative to `origin/main`, else `origin/master`.
fn fetch_ahead_behind(dir: &Path) -> Option<(u32, u32)> {
    ["origin/main...HEAD", "origin/master...HEAD"]
        .into_iter()
        .find_map(|range| {
            process::git(dir, &["rev-list", "--left-right", "--count", range])
                .ok()
                .and_then(|out| parse_left_right(&out))
        })
}

fn parse_left_right(output: &str) -> Option<(u32, u32)> {
    let mut parts = output.split_whitespace();
    let behind = parts.next()?.parse().ok()?;
    let ahead = parts.next()?.parse().ok()?;
    parts.next().is_none().then_some((behind, ahead))
}

/// `(staged, unstaged, untracked)` from `git status --porcelain` v1 output.
fn count_porcelain(output: &str) -> (u32, u32, u32) {
    let mut staged = 0;
    let mut unstaged = 0;
    let mut untracked = 0;
    for line in output.lines() {
        let mut chars = line.chars();
        let (Some(index), Some(worktree)) = (chars.next(), chars.next()) else {
            continue;
        };
        if index == '?' {
            untracked += 1;
            continue;
        }
        if index != ' ' {
            staged += 1;
        }
        if worktree != ' ' {
            unstaged += 1;
        }
    }
    (staged, unstaged, untracked)
}

/// Read-through cache of git status keyed by canonical repository path.
///
/// A directory outside any repository is cached as `None`.
pub struct GitStatusCache<B = FileBackend> {
    store: CacheStore<Option<GitStatus>, B>,
}

impl GitStatusCache {
    pub fn open(path: PathBuf, config: &GitCacheConfig) -> Self {
        Self::with_backend(FileBackend::new(path), config)
    }
}

impl<B: CacheBackend> GitStatusCache<B> {
    pub fn with_backend(backend: B, config: &GitCacheConfig) -> Self {
        Self {
            store: CacheStore::new(
                backend,
                GIT_CACHE_VERSION,
                TtlRule::Fixed(Duration::from_millis(config.ttl_ms)),
                config.max_repositories,
            ),
        }
    }

    pub fn status(&self, cwd: &Path, source: &impl GitSource) -> Option<GitStatus> {
        self.status_at(cwd, source, Utc::now())
    }

    pub fn status_at(
        &self,
        cwd: &Path,
        source: &impl GitSource,
        now: DateTime<Utc>,
    ) -> Option<GitStatus> {
        let key = canonical_key(cwd);
        if let Some(cached) = self.store.get_at(&key, now) {
            return cached;
        }

        match source.status(cwd) {
            Ok(status) => {
                self.store.put_at(&key, status.clone(), now);
                status
            }
            Err(err) => {
                debug!(cwd = %cwd.display(), error = %err, "git status unavailable");
                None
            }
        }
    }

    pub fn store(&self) -> &CacheStore<Option<GitStatus>, B> {
        &self.store
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::fs;
    use std::process::Command;

    use crate::store::{MemoryBackend, millis_to_datetime};
    use tempfile::TempDir;

    struct CountingSource {
        calls: Cell<u32>,
        result: Option<GitStatus>,
    }

    impl GitSource for CountingSource {
        fn status(&self, _dir: &Path) -> Result<Option<GitStatus>, SourceError> {
            self.calls.set(self.calls.get() + 1);
            Ok(self.result.clone())
        }
    }

    struct FailingSource;

    impl GitSource for FailingSource {
        fn status(&self, _dir: &Path) -> Result<Option<GitStatus>, SourceError> {
            Err(SourceError::Timeout {
                program: "git".to_string(),
                timeout: Duration::from_secs(3),
            })
        }
    }

    fn at(ms: i64) -> DateTime<Utc> {
        millis_to_datetime(ms).expect("valid millis")
    }

    fn sample() -> GitStatus {
        GitStatus {
            branch: "main".to_string(),
            has_changes: true,
            staged: 1,
            unstaged: 2,
            untracked: 0,
            ahead: Some(3),
            behind: Some(0),
        }
    }

    #[test]
    fn porcelain_counts() {
        let output = "M  staged.rs\n M unstaged.rs\nMM both.rs\n?? new.rs\n?? other.rs\n";
        assert_eq!(count_porcelain(output), (2, 2, 2));
        assert_eq!(count_porcelain(""), (0, 0, 0));
        // untracked files are not also counted as unstaged
        assert_eq!(count_porcelain("?? only.rs\n"), (0, 0, 1));
    }

    #[test]
    fn left_right_output_parses_behind_then_ahead() {
        assert_eq!(parse_left_right("4\t7\n"), Some((4, 7)));
        assert_eq!(parse_left_right("fatal"), None);
        assert_eq!(parse_left_right(""), None);
    }

    #[test]
    fn summary_formatting() {
        assert_eq!(sample().summary(), "main (S:1,U:2,↑3)");
        let clean = GitStatus {
            branch: "dev".to_string(),
            ..GitStatus::default()
        };
        assert_eq!(clean.summary(), "dev");
    }

    #[test]
    fn cache_serves_within_ttl_and_refreshes_after() {
        let tmp = TempDir::new().expect("temp dir");
        let backend = MemoryBackend::new();
        let cache = GitStatusCache::with_backend(&backend, &GitCacheConfig::default());
        let source = CountingSource {
            calls: Cell::new(0),
            result: Some(sample()),
        };

        assert_eq!(cache.status_at(tmp.path(), &source, at(0)), Some(sample()));
        assert_eq!(cache.status_at(tmp.path(), &source, at(4_999)), Some(sample()));
        assert_eq!(source.calls.get(), 1);

        cache.status_at(tmp.path(), &source, at(5_000));
        assert_eq!(source.calls.get(), 2);
    }

    #[test]
    fn non_repository_is_cached_as_absent() {
        let tmp = TempDir::new().expect("temp dir");
        let backend = MemoryBackend::new();
        let cache = GitStatusCache::with_backend(&backend, &GitCacheConfig::default());
        let source = CountingSource {
            calls: Cell::new(0),
            result: None,
        };

        assert_eq!(cache.status_at(tmp.path(), &source, at(0)), None);
        assert_eq!(cache.status_at(tmp.path(), &source, at(1)), None);
        assert_eq!(source.calls.get(), 1);
    }

    #[test]
    fn source_failure_is_not_cached() {
        let tmp = TempDir::new().expect("temp dir");
        let backend = MemoryBackend::new();
        let cache = GitStatusCache::with_backend(&backend, &GitCacheConfig::default());

        assert_eq!(cache.status_at(tmp.path(), &FailingSource, at(0)), None);
        assert!(cache.store().keys().is_empty());
    }

    #[test]
    fn real_repository_reports_branch_and_untracked() {
        if Command::new("git").arg("--version").output().is_err() {
            return;
        }
        let tmp = TempDir::new().expect("temp dir");
        let init = Command::new("git")
            .args(["init", "-q", "-b", "trunk"])
            .current_dir(tmp.path())
            .status()
            .expect("git init");
        if !init.success() {
            return;
        }
        fs::write(tmp.path().join("notes.txt"), "hi").expect("write file");

        let status = fetch_git_status(tmp.path())
            .expect("git status")
            .expect("inside repository");
        assert_eq!(status.untracked, 1);
        assert!(status.has_changes);
        assert_eq!(status.branch, "trunk");
        assert_eq!(status.ahead, None);
    }
}
