//! Parsers for git's machine-readable output.

use chrono::{DateTime, Utc};
use regex::Regex;
use std::collections::BTreeMap;
use std::sync::LazyLock;
use upkeep_common::{RenamedFile, RepoStatus, TreeItem, TreeItemKind};

static COMMIT_TREE_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"tree\s+([0-9a-f]{40})").expect("Invalid commit tree regex"));

static TREE_ENTRY_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\d{6})\s+(blob|tree|commit)\s+([0-9a-f]{40})\s+(.*)$")
        .expect("Invalid tree entry regex")
});

/// `ls-remote --heads` output into branch name to sha.
pub fn parse_ls_remote_heads(output: &str) -> BTreeMap<String, String> {
    output
        .lines()
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            let sha = parts.next()?;
            let reference = parts.next()?;
            let branch = reference.strip_prefix("refs/heads/")?;
            Some((branch.to_string(), sha.to_string()))
        })
        .collect()
}

/// `status --porcelain=v1 -z`.
pub fn parse_porcelain_status(output: &str) -> RepoStatus {
    let mut status = RepoStatus::default();
    let mut entries = output.split('\0').filter(|e| !e.is_empty());

    while let Some(entry) = entries.next() {
        if entry.len() < 4 {
            continue;
        }
        let (code, path) = entry.split_at(3);
        let mut flags = code.chars();
        let index = flags.next().unwrap_or(' ');
        let worktree = flags.next().unwrap_or(' ');
        let path = path.to_string();

        match (index, worktree) {
            ('?', '?') => status.not_added.push(path),
            ('!', '!') => {}
            ('R', _) => {
                let from = entries.next().unwrap_or_default().to_string();
                status.renamed.push(RenamedFile { from, to: path });
            }
            ('C', _) => {
                entries.next();
                status.modified.push(path);
            }
            ('D', _) | (_, 'D') => status.deleted.push(path),
            _ => status.modified.push(path),
        }
    }
    status
}

/// Regular file paths from `ls-tree -r`.
pub fn parse_ls_tree_files(output: &str) -> Vec<String> {
    output
        .lines()
        .filter(|line| line.starts_with("100"))
        .filter_map(|line| line.split_once('\t').map(|(_, path)| path.to_string()))
        .collect()
}

/// The tree sha from `cat-file -p <commit>`.
pub fn parse_commit_tree_sha(output: &str) -> Option<String> {
    COMMIT_TREE_REGEX
        .captures(output)
        .map(|caps| caps[1].to_string())
}

/// Entries of `cat-file -p <tree>`.
pub fn parse_tree_entries(output: &str) -> Vec<TreeItem> {
    output
        .lines()
        .filter_map(|line| {
            let caps = TREE_ENTRY_REGEX.captures(line)?;
            let kind = match &caps[2] {
                "blob" => TreeItemKind::Blob,
                "tree" => TreeItemKind::Tree,
                _ => TreeItemKind::Commit,
            };
            Some(TreeItem {
                path: caps[4].to_string(),
                mode: caps[1].to_string(),
                kind,
                sha: caps[3].to_string(),
            })
        })
        .collect()
}

/// Local branches from `git branch`, excluding the checked out one.
pub fn parse_other_local_branches(output: &str) -> Vec<String> {
    output
        .lines()
        .filter(|line| !line.starts_with("* "))
        .map(str::trim)
        .filter(|name| !name.is_empty() && !name.starts_with('('))
        .map(ToString::to_string)
        .collect()
}

/// Paths from `config --file .gitmodules --get-regexp \.path`.
pub fn parse_submodule_paths(output: &str) -> Vec<String> {
    output
        .split_whitespace()
        .skip(1)
        .step_by(2)
        .map(ToString::to_string)
        .collect()
}

/// `%ai` timestamps such as `2024-05-01 10:20:30 +0200`.
pub fn parse_commit_time(output: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_str(output.trim(), "%Y-%m-%d %H:%M:%S %z")
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SHA_A: &str = "1111111111111111111111111111111111111111";
    const SHA_B: &str = "2222222222222222222222222222222222222222";

    #[test]
    fn test_parse_ls_remote_heads() {
        let output = format!(
            "{SHA_A}\trefs/heads/main\n{SHA_B}\trefs/heads/upkeep/lodash-4.x\n{SHA_B}\trefs/tags/v1\n"
        );
        let heads = parse_ls_remote_heads(&output);
        assert_eq!(heads.len(), 2);
        assert_eq!(heads["main"], SHA_A);
        assert_eq!(heads["upkeep/lodash-4.x"], SHA_B);
    }

    #[test]
    fn test_parse_porcelain_status() {
        let output = " M package.json\0?? new.lock\0 D gone.txt\0D  staged-gone.txt\0R  to.txt\0from.txt\0A  added.txt\0";
        let status = parse_porcelain_status(output);
        assert_eq!(status.modified, vec!["package.json", "added.txt"]);
        assert_eq!(status.not_added, vec!["new.lock"]);
        assert_eq!(status.deleted, vec!["gone.txt", "staged-gone.txt"]);
        assert_eq!(
            status.renamed,
            vec![RenamedFile { from: "from.txt".into(), to: "to.txt".into() }]
        );
    }

    #[test]
    fn test_parse_porcelain_status_paths_with_spaces() {
        let status = parse_porcelain_status("?? dir/with space.txt\0");
        assert_eq!(status.not_added, vec!["dir/with space.txt"]);
    }

    #[test]
    fn test_parse_ls_tree_files() {
        let output = format!(
            "100644 blob {SHA_A}\tpackage.json\n160000 commit {SHA_B}\tvendor/lib\n100755 blob {SHA_B}\tbin/run\n"
        );
        assert_eq!(parse_ls_tree_files(&output), vec!["package.json", "bin/run"]);
    }

    #[test]
    fn test_parse_commit_tree() {
        let commit = format!("tree {SHA_A}\nparent {SHA_B}\nauthor A <a@b> 1 +0000\n\nmsg\n");
        assert_eq!(parse_commit_tree_sha(&commit).as_deref(), Some(SHA_A));
        assert_eq!(parse_commit_tree_sha("garbage"), None);

        let tree = format!(
            "100644 blob {SHA_A}\tREADME.md\n040000 tree {SHA_B}\tsrc\n160000 commit {SHA_B}\tdeps\nnot an entry\n"
        );
        let entries = parse_tree_entries(&tree);
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].path, "README.md");
        assert_eq!(entries[0].kind, TreeItemKind::Blob);
        assert_eq!(entries[1].mode, "040000");
        assert_eq!(entries[1].kind, TreeItemKind::Tree);
        assert_eq!(entries[2].kind, TreeItemKind::Commit);
    }

    #[test]
    fn test_parse_other_local_branches() {
        let output = "  upkeep/a\n* main\n  upkeep/b\n";
        assert_eq!(parse_other_local_branches(output), vec!["upkeep/a", "upkeep/b"]);
        assert!(parse_other_local_branches("* (HEAD detached at 1234)\n").is_empty());
    }

    #[test]
    fn test_parse_submodule_paths() {
        let output = "submodule.a.path deps/a\nsubmodule.b.path deps/b\n";
        assert_eq!(parse_submodule_paths(output), vec!["deps/a", "deps/b"]);
        assert!(parse_submodule_paths("").is_empty());
    }

    #[test]
    fn test_parse_commit_time() {
        let time = parse_commit_time("2024-05-01 10:20:30 +0200\n").unwrap();
        assert_eq!(time.to_rfc3339(), "2024-05-01T08:20:30+00:00");
        assert!(parse_commit_time("yesterday").is_none());
    }
}
