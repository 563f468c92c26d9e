//! Data types shared between the git layer and the branch worker.

use serde::{Deserialize, Serialize};

/// File body; text stays readable in JSON output, anything else is kept as
/// raw bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FileContents {
    Text(String),
    Binary(Vec<u8>),
}

impl FileContents {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        match String::from_utf8(bytes) {
            Ok(text) => Self::Text(text),
            Err(e) => Self::Binary(e.into_bytes()),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Self::Text(text) => text.as_bytes(),
            Self::Binary(bytes) => bytes,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            Self::Binary(_) => None,
        }
    }
}

impl From<&str> for FileContents {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for FileContents {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

/// One file operation applied by a commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum FileChange {
    Addition {
        path: String,
        /// For symlinks, the link target.
        contents: FileContents,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        is_executable: bool,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        is_symlink: bool,
    },
    Deletion {
        path: String,
    },
}

impl FileChange {
    pub fn addition(path: impl Into<String>, contents: impl Into<FileContents>) -> Self {
        Self::Addition {
            path: path.into(),
            contents: contents.into(),
            is_executable: false,
            is_symlink: false,
        }
    }

    pub fn deletion(path: impl Into<String>) -> Self {
        Self::Deletion { path: path.into() }
    }

    pub fn path(&self) -> &str {
        match self {
            Self::Addition { path, .. } | Self::Deletion { path } => path,
        }
    }

    pub fn is_deletion(&self) -> bool {
        matches!(self, Self::Deletion { .. })
    }

    pub fn contents(&self) -> Option<&FileContents> {
        match self {
            Self::Addition { contents, .. } => Some(contents),
            Self::Deletion { .. } => None,
        }
    }
}

/// Replace or append `change`, keeping only the latest state per path.
pub fn upsert_file_change(changes: &mut Vec<FileChange>, change: FileChange) {
    changes.retain(|existing| existing.path() != change.path());
    changes.push(change);
}

/// Outcome of preparing a commit that actually changed something.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitResult {
    pub parent_sha: String,
    pub sha: String,
    pub files: Vec<FileChange>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenamedFile {
    pub from: String,
    pub to: String,
}

/// Parsed `git status --porcelain`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoStatus {
    pub modified: Vec<String>,
    /// Untracked paths.
    pub not_added: Vec<String>,
    pub deleted: Vec<String>,
    pub renamed: Vec<RenamedFile>,
}

impl RepoStatus {
    pub fn is_clean(&self) -> bool {
        self.modified.is_empty()
            && self.not_added.is_empty()
            && self.deleted.is_empty()
            && self.renamed.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TreeItemKind {
    Blob,
    Tree,
    Commit,
}

/// One entry of a top-level commit tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeItem {
    pub path: String,
    pub mode: String,
    #[serde(rename = "type")]
    pub kind: TreeItemKind,
    pub sha: String,
}
