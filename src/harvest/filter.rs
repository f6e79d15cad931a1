//! Repository allow/deny filtering.

use std::collections::BTreeSet;
use std::path::Path;
use tracing::{debug, info};

use crate::model::RepoId;

/// Repositories that are never collected, whatever the allow-list says.
const DENIED_REPOS: &[&str] = &[];

/// Allow-list snapshot for one iteration, with the deny-list applied on top.
#[derive(Debug, Clone, Default)]
pub struct RepoFilter {
    allowed: BTreeSet<RepoId>,
    denied: BTreeSet<RepoId>,
}

impl RepoFilter {
    /// Filter that allows every repository not on the built-in deny-list.
    pub fn allow_all() -> Self {
        Self::new(std::iter::empty())
    }

    pub fn new(allowed: impl IntoIterator<Item = RepoId>) -> Self {
        Self {
            allowed: allowed.into_iter().collect(),
            denied: DENIED_REPOS.iter().map(|r| RepoId::from(*r)).collect(),
        }
    }

    pub fn with_denied(mut self, denied: impl IntoIterator<Item = RepoId>) -> Self {
        self.denied.extend(denied);
        self
    }

    /// Builds the filter from the command-line repositories and the repo
    /// list file. An unreadable file contributes no entries.
    pub async fn load(cli_repos: &[RepoId], repo_list: &Path) -> Self {
        let mut allowed: BTreeSet<RepoId> = cli_repos.iter().cloned().collect();

        match tokio::fs::read_to_string(repo_list).await {
            Ok(content) => allowed.extend(parse_repo_list(&content)),
            Err(e) => info!(
                path = %repo_list.display(),
                error = %e,
                "Repo list not readable, using command-line repos only"
            ),
        }

        let filter = Self::new(allowed);
        if filter.is_active() {
            info!(
                repos = ?filter.allowed.iter().map(RepoId::as_str).collect::<Vec<_>>(),
                "Limiting collection to listed repos"
            );
        }
        filter
    }

    /// Whether an allow-list is in effect.
    pub fn is_active(&self) -> bool {
        !self.allowed.is_empty()
    }

    pub fn allowed(&self) -> impl Iterator<Item = &RepoId> {
        self.allowed.iter()
    }

    pub fn allows(&self, repo: &RepoId) -> bool {
        if self.denied.contains(repo) {
            debug!(repo = %repo, "Repo is on the deny-list");
            return false;
        }
        !self.is_active() || self.allowed.contains(repo)
    }
}

/// One repository per line; `#` starts a comment; blank lines are ignored.
pub fn parse_repo_list(content: &str) -> Vec<RepoId> {
    content
        .lines()
        .filter_map(|line| {
            let repo = line.split('#').next().unwrap_or("").trim();
            (!repo.is_empty()).then(|| RepoId::from(repo))
        })
        .collect()
}
