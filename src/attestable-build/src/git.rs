// SPDX-FileCopyrightText: 2025 Caution SEZC
// SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-Commercial

//! Source revision lookup straight from a `.git` directory, without a git
//! binary in the enclave.

use std::io;
use std::path::Path;

use tokio::fs;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RevisionInfo {
    pub commit: Option<String>,
    pub repo: Option<String>,
}

#[derive(Debug, thiserror::Error)]
#[error("could not read git metadata from {path:?}")]
pub struct RevisionError {
    path: std::path::PathBuf,
    #[source]
    source: io::Error,
}

/// Read the checked-out commit and `origin` URL of the repository at `dir`.
///
/// A directory without `.git` yields empty info.
pub async fn read_revision(dir: &Path) -> Result<RevisionInfo, RevisionError> {
    let git_dir = dir.join(".git");
    if !fs::try_exists(&git_dir).await.unwrap_or(false) {
        return Ok(RevisionInfo::default());
    }

    let head_path = git_dir.join("HEAD");
    let head = read_optional(&head_path).await?;
    let commit = match head.as_deref().map(str::trim) {
        Some(head) => match head.strip_prefix("ref:") {
            Some(reference) => resolve_ref(&git_dir, reference.trim()).await?,
            None if !head.is_empty() => Some(head.to_string()),
            None => None,
        },
        None => None,
    };

    let config = read_optional(&git_dir.join("config")).await?;
    let repo = config.as_deref().and_then(origin_url);

    Ok(RevisionInfo { commit, repo })
}

async fn resolve_ref(git_dir: &Path, reference: &str) -> Result<Option<String>, RevisionError> {
    if let Some(loose) = read_optional(&git_dir.join(reference)).await? {
        let loose = loose.trim();
        if !loose.is_empty() {
            return Ok(Some(loose.to_string()));
        }
    }

    let packed = read_optional(&git_dir.join("packed-refs")).await?;
    Ok(packed.as_deref().and_then(|packed| packed_ref(packed, reference)))
}

fn packed_ref(packed: &str, reference: &str) -> Option<String> {
    packed
        .lines()
        .filter(|line| !line.starts_with('#') && !line.starts_with('^'))
        .filter_map(|line| line.split_once(' '))
        .find(|(_, name)| name.trim() == reference)
        .map(|(hash, _)| hash.to_string())
}

/// `url` of `[remote "origin"]` in a git config file.
fn origin_url(config: &str) -> Option<String> {
    let mut in_origin = false;
    for line in config.lines().map(str::trim) {
        if line.starts_with('[') {
            in_origin = line == r#"[remote "origin"]"#;
            continue;
        }
        if in_origin {
            if let Some((key, value)) = line.split_once('=') {
                if key.trim() == "url" {
                    return Some(value.trim().to_string());
                }
            }
        }
    }
    None
}

async fn read_optional(path: &Path) -> Result<Option<String>, RevisionError> {
    match fs::read_to_string(path).await {
        Ok(contents) => Ok(Some(contents)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(source) => Err(RevisionError {
            path: path.to_path_buf(),
            source,
        }),
    }
}
