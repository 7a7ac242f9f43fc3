// SPDX-FileCopyrightText: 2025 Caution SEZC
// SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-Commercial

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;

/// Name of the build configuration file in the working directory.
pub const MANIFEST_FILE: &str = "build.json";

#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    #[error("could not read build configuration {path:?}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("could not parse build configuration")]
    Parse(#[source] serde_json::Error),

    #[error("build configuration has an empty input.cmd")]
    EmptyCommand,

    #[error("build configuration declares no output.files")]
    NoOutputs,

    #[error("build configuration env entry {entry:?} is not KEY=VALUE")]
    BadEnv { entry: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildManifest {
    pub language: String,
    pub input: ManifestInput,
    pub output: ManifestOutput,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestInput {
    pub cmd: String,
    /// Command run inside the vendor container to warm dependency caches.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vendor: Option<String>,
    #[serde(default)]
    pub env: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestOutput {
    pub files: Vec<String>,
}

impl BuildManifest {
    pub fn from_json(json: &str) -> Result<Self, ManifestError> {
        let manifest: Self = serde_json::from_str(json).map_err(ManifestError::Parse)?;
        manifest.validate()?;
        Ok(manifest)
    }

    pub async fn read_from_dir(dir: &Path) -> Result<Self, ManifestError> {
        let path = dir.join(MANIFEST_FILE);
        let json = fs::read_to_string(&path)
            .await
            .map_err(|source| ManifestError::Read { path, source })?;
        Self::from_json(&json)
    }

    pub fn validate(&self) -> Result<(), ManifestError> {
        if self.input.cmd.trim().is_empty() {
            return Err(ManifestError::EmptyCommand);
        }
        if self.output.files.is_empty() {
            return Err(ManifestError::NoOutputs);
        }
        self.env_pairs()?;
        Ok(())
    }

    /// `input.env` split into `(key, value)` pairs.
    pub fn env_pairs(&self) -> Result<Vec<(String, String)>, ManifestError> {
        self.input
            .env
            .iter()
            .map(|entry| match entry.split_once('=') {
                Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
                _ => Err(ManifestError::BadEnv { entry: entry.clone() }),
            })
            .collect()
    }

    /// The command the vendor container runs: `input.vendor` if set,
    /// otherwise the build command itself.
    pub fn vendor_command(&self) -> &str {
        self.input
            .vendor
            .as_deref()
            .filter(|cmd| !cmd.trim().is_empty())
            .unwrap_or(&self.input.cmd)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "language": "rust",
        "input": {
            "cmd": "cargo build --release --offline",
            "vendor": "cargo fetch",
            "env": ["RUSTFLAGS=-C target-cpu=generic", "EMPTY="]
        },
        "output": { "files": ["target/release/app"] }
    }"#;

    #[test]
    fn test_parse_sample() {
        let manifest = BuildManifest::from_json(SAMPLE).unwrap();
        assert_eq!(manifest.language, "rust");
        assert_eq!(manifest.vendor_command(), "cargo fetch");
        assert_eq!(
            manifest.env_pairs().unwrap(),
            vec![
                ("RUSTFLAGS".to_string(), "-C target-cpu=generic".to_string()),
                ("EMPTY".to_string(), String::new()),
            ]
        );
    }

    #[test]
    fn test_optional_fields_default() {
        let manifest =
            BuildManifest::from_json(r#"{"language":"go","input":{"cmd":"make"},"output":{"files":["bin/*"]}}"#)
                .unwrap();
        assert!(manifest.input.env.is_empty());
        assert_eq!(manifest.vendor_command(), "make");
    }

    #[test]
    fn test_empty_command_rejected() {
        let err = BuildManifest::from_json(r#"{"language":"rust","input":{"cmd":"  "},"output":{"files":["a"]}}"#)
            .unwrap_err();
        assert!(matches!(err, ManifestError::EmptyCommand));
    }

    #[test]
    fn test_missing_outputs_rejected() {
        let err = BuildManifest::from_json(r#"{"language":"rust","input":{"cmd":"true"},"output":{"files":[]}}"#)
            .unwrap_err();
        assert!(matches!(err, ManifestError::NoOutputs));
    }

    #[test]
    fn test_bad_env_rejected() {
        let err = BuildManifest::from_json(
            r#"{"language":"rust","input":{"cmd":"true","env":["NOEQUALS"]},"output":{"files":["a"]}}"#,
        )
        .unwrap_err();
        assert!(matches!(err, ManifestError::BadEnv { .. }));
    }

    #[tokio::test]
    async fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = BuildManifest::read_from_dir(dir.path()).await.unwrap_err();
        assert!(matches!(err, ManifestError::Read { .. }));
    }
}
