//! In-memory state of one working copy.

use regex::Regex;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::LazyLock;
use upkeep_common::GlobalConfig;

/// Name of the remote pointing at the upstream repository in fork mode.
pub const FORK_UPSTREAM_REMOTE: &str = "upkeep-fork-upstream";

/// Commit identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitAuthor {
    pub name: Option<String>,
    pub email: String,
}

static NAMED_AUTHOR_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"^\s*"?([^"<>]*?)"?\s*<([^<>\s]+@[^<>\s]+)>\s*$"#)
        .expect("Invalid git author regex")
});

static BARE_EMAIL_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*([^<>\s@]+@[^<>\s@]+)\s*$").expect("Invalid email regex"));

impl GitAuthor {
    /// Parse `Name <email>`, `"Name" <email>`, `<email>` or a bare email.
    pub fn parse(input: &str) -> Option<Self> {
        if let Some(caps) = NAMED_AUTHOR_REGEX.captures(input) {
            let name = caps[1].trim();
            return Some(Self {
                name: (!name.is_empty()).then(|| name.to_string()),
                email: caps[2].to_string(),
            });
        }
        BARE_EMAIL_REGEX.captures(input).map(|caps| Self {
            name: None,
            email: caps[1].to_string(),
        })
    }
}

/// Where and how the working copy is bound to its remote.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StorageConfig {
    pub url: String,
    /// Set in fork mode.
    pub upstream_url: Option<String>,
    pub default_branch: Option<String>,
    pub full_clone: bool,
    pub extra_clone_opts: BTreeMap<String, String>,
    pub clone_submodules: bool,
    pub clone_submodules_filter: Vec<String>,
}

impl StorageConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    /// Storage settings for `url` taken from the global configuration.
    pub fn from_global(url: impl Into<String>, config: &GlobalConfig) -> Self {
        Self {
            url: url.into(),
            upstream_url: config.fork_upstream_url.clone(),
            default_branch: None,
            full_clone: config.full_clone,
            extra_clone_opts: config.extra_clone_opts.clone(),
            clone_submodules: config.clone_submodules,
            clone_submodules_filter: config.clone_submodules_filter.clone(),
        }
    }

    pub fn is_fork(&self) -> bool {
        self.upstream_url.is_some()
    }

    /// `extra_clone_opts` flattened into arguments.
    pub fn extra_clone_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        for (key, value) in &self.extra_clone_opts {
            args.push(key.clone());
            if !value.is_empty() {
                args.push(value.clone());
            }
        }
        args
    }
}

#[derive(Debug, Clone, Default)]
pub struct RepositoryState {
    pub storage: StorageConfig,
    pub current_branch: Option<String>,
    pub current_branch_sha: Option<String>,
    /// Remote branch heads.
    pub branch_commits: BTreeMap<String, String>,
    pub branch_is_modified: HashMap<String, bool>,
    pub ignored_authors: BTreeSet<String>,
    pub git_author: Option<GitAuthor>,
    pub synced: bool,
    pub submodules_initialized: bool,
    pub author_written: bool,
    pub bookkeeping_refs_pushed: bool,
    pub commits_pushed: u32,
}

impl RepositoryState {
    /// Fresh state for `storage`, keeping only the configured identity.
    pub fn reset(&mut self, storage: StorageConfig) {
        let git_author = self.git_author.take();
        *self = Self {
            storage,
            git_author,
            ..Default::default()
        };
    }

    pub fn branch_exists(&self, branch: &str) -> bool {
        self.branch_commits.contains_key(branch)
    }

    pub fn branch_commit(&self, branch: &str) -> Option<&str> {
        self.branch_commits.get(branch).map(String::as_str)
    }

    pub fn record_branch_commit(&mut self, branch: &str, sha: &str) {
        self.branch_commits
            .insert(branch.to_string(), sha.trim().to_string());
    }

    pub fn forget_branch(&mut self, branch: &str) {
        self.branch_commits.remove(branch);
        self.branch_is_modified.remove(branch);
    }

    pub fn author_email(&self) -> Option<&str> {
        self.git_author.as_ref().map(|a| a.email.as_str())
    }

    /// Whether commits by `email` leave a branch "unmodified".
    pub fn is_bot_author(&self, email: &str) -> bool {
        self.author_email() == Some(email) || self.ignored_authors.contains(email)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_git_author() {
        assert_eq!(
            GitAuthor::parse("Upkeep Bot <bot@upkeep.invalid>"),
            Some(GitAuthor {
                name: Some("Upkeep Bot".into()),
                email: "bot@upkeep.invalid".into()
            })
        );
        assert_eq!(
            GitAuthor::parse("\"Some, Name\" <a@b.c>").and_then(|a| a.name),
            Some("Some, Name".into())
        );
        assert_eq!(
            GitAuthor::parse("<a@b.c>"),
            Some(GitAuthor { name: None, email: "a@b.c".into() })
        );
        assert_eq!(
            GitAuthor::parse("a@b.c"),
            Some(GitAuthor { name: None, email: "a@b.c".into() })
        );
        assert_eq!(GitAuthor::parse("not an author"), None);
        assert_eq!(GitAuthor::parse("Name <missing-at>"), None);
    }

    #[test]
    fn test_reset_keeps_identity_only() {
        let mut state = RepositoryState::default();
        state.git_author = GitAuthor::parse("bot@x.y");
        state.record_branch_commit("main", "abc\n");
        state.synced = true;
        state.ignored_authors.insert("me@x.y".into());

        state.reset(StorageConfig::new("https://example.com/o/r.git"));
        assert!(state.branch_commits.is_empty());
        assert!(!state.synced);
        assert!(state.ignored_authors.is_empty());
        assert_eq!(state.author_email(), Some("bot@x.y"));
        assert_eq!(state.storage.url, "https://example.com/o/r.git");
    }

    #[test]
    fn test_bot_author() {
        let mut state = RepositoryState::default();
        state.git_author = GitAuthor::parse("Bot <bot@x.y>");
        state.ignored_authors.insert("ci@x.y".into());
        assert!(state.is_bot_author("bot@x.y"));
        assert!(state.is_bot_author("ci@x.y"));
        assert!(!state.is_bot_author("human@x.y"));
    }

    #[test]
    fn test_extra_clone_args() {
        let mut storage = StorageConfig::new("u");
        storage
            .extra_clone_opts
            .insert("--depth".into(), "50".into());
        storage
            .extra_clone_opts
            .insert("--single-branch".into(), String::new());
        assert_eq!(storage.extra_clone_args(), vec!["--depth", "50", "--single-branch"]);
    }
}
