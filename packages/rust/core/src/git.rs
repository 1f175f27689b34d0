//! Git checkouts for repositories indexed from a URL.
//!
//! The first sync clones. Later syncs fetch the checked-out branch from
//! `origin` and hard-reset the working tree onto it, reporting which paths
//! changed between the two commits.

use std::path::Path;

use git2::{Oid, Repository, ResetType};
use tracing::{debug, info, instrument};

use repoqa_shared::{RepoQaError, Result};

/// What a sync did to the checkout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    Cloned {
        head: String,
    },
    Updated {
        from: String,
        to: String,
        /// Paths added, modified or deleted upstream, sorted.
        changed: Vec<String>,
    },
    UpToDate {
        head: String,
    },
}

impl SyncOutcome {
    /// Commit the checkout is at after the sync.
    pub fn head(&self) -> &str {
        match self {
            Self::Cloned { head } | Self::UpToDate { head } => head,
            Self::Updated { to, .. } => to,
        }
    }
}

fn git_err(e: git2::Error) -> RepoQaError {
    RepoQaError::Git(e.message().to_string())
}

/// Clone `url` into `dest`, or bring an existing checkout at `dest` up to date.
#[instrument(skip_all, fields(url = %url, dest = %dest.display()))]
pub async fn sync_checkout(url: &str, dest: &Path) -> Result<SyncOutcome> {
    let url = url.to_string();
    let dest = dest.to_path_buf();
    tokio::task::spawn_blocking(move || sync_blocking(&url, &dest))
        .await
        .map_err(|e| RepoQaError::Git(format!("sync task failed: {e}")))?
}

fn sync_blocking(url: &str, dest: &Path) -> Result<SyncOutcome> {
    if dest.join(".git").exists() {
        return update(dest);
    }

    if dest.exists() {
        let mut entries = dest.read_dir().map_err(|e| RepoQaError::io(dest, e))?;
        if entries.next().is_some() {
            return Err(RepoQaError::validation(format!(
                "{} exists and is not a git checkout",
                dest.display()
            )));
        }
    } else if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent).map_err(|e| RepoQaError::io(parent, e))?;
    }

    info!("cloning repository");
    let repo = Repository::clone(url, dest).map_err(git_err)?;
    let head = head_commit(&repo)?;
    Ok(SyncOutcome::Cloned {
        head: head.to_string(),
    })
}

fn update(dest: &Path) -> Result<SyncOutcome> {
    let repo = Repository::open(dest).map_err(git_err)?;
    let before = head_commit(&repo)?;

    let branch = {
        let head = repo.head().map_err(git_err)?;
        if !head.is_branch() {
            return Err(RepoQaError::Git(format!(
                "{} has a detached HEAD",
                dest.display()
            )));
        }
        head.shorthand()
            .map(str::to_string)
            .ok_or_else(|| RepoQaError::Git("branch name is not valid UTF-8".into()))?
    };

    let tracking = format!("refs/remotes/origin/{branch}");
    let refspec = format!("+refs/heads/{branch}:{tracking}");
    debug!(branch = %branch, "fetching origin");
    let mut remote = repo.find_remote("origin").map_err(git_err)?;
    remote
        .fetch(&[refspec.as_str()], None, None)
        .map_err(git_err)?;

    let after = repo.refname_to_id(&tracking).map_err(git_err)?;
    if after == before {
        debug!(head = %before, "checkout already up to date");
        return Ok(SyncOutcome::UpToDate {
            head: before.to_string(),
        });
    }

    let target = repo.find_object(after, None).map_err(git_err)?;
    repo.reset(&target, ResetType::Hard, None).map_err(git_err)?;
    let changed = changed_files(&repo, before, after)?;
    info!(from = %before, to = %after, changed = changed.len(), "checkout updated");

    Ok(SyncOutcome::Updated {
        from: before.to_string(),
        to: after.to_string(),
        changed,
    })
}

fn head_commit(repo: &Repository) -> Result<Oid> {
    let commit = repo
        .head()
        .and_then(|h| h.peel_to_commit())
        .map_err(git_err)?;
    Ok(commit.id())
}

fn changed_files(repo: &Repository, from: Oid, to: Oid) -> Result<Vec<String>> {
    let old = repo
        .find_commit(from)
        .and_then(|c| c.tree())
        .map_err(git_err)?;
    let new = repo
        .find_commit(to)
        .and_then(|c| c.tree())
        .map_err(git_err)?;
    let diff = repo
        .diff_tree_to_tree(Some(&old), Some(&new), None)
        .map_err(git_err)?;

    let mut paths = Vec::new();
    for delta in diff.deltas() {
        let file = delta.new_file();
        let path = file.path().or_else(|| delta.old_file().path());
        if let Some(path) = path {
            paths.push(path.to_string_lossy().replace('\\', "/"));
        }
    }
    paths.sort();
    paths.dedup();
    Ok(paths)
}
