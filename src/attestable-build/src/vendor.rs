// SPDX-FileCopyrightText: 2025 Caution SEZC
// SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-Commercial

//! Dependency vendoring per language ecosystem.
//!
//! Vendoring runs inside the builder image before the enclave boots. After the
//! manifest's vendor command has warmed the toolchain caches, the language's
//! [`VendorStrategy`] packs those caches into archives and records where each
//! one has to be unpacked inside the worker. The index is written next to the
//! archives as `vendor.json`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::archive::{self, ArchiveError};
use crate::exec::{self, ExecError};
use crate::manifest::{BuildManifest, ManifestError};

pub const VENDOR_INDEX_FILE: &str = "vendor.json";

/// One vendor archive and the directory it unpacks into.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VendorArchive {
    pub archive: PathBuf,
    pub target: PathBuf,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VendorIndex {
    pub archives: Vec<VendorArchive>,
}

#[derive(Debug, thiserror::Error)]
pub enum VendorError {
    #[error("no vendor strategy for language {language:?}")]
    UnknownLanguage { language: String },

    #[error("invalid vendor environment")]
    Manifest(#[from] ManifestError),

    #[error("vendor command failed")]
    Command(#[from] ExecError),

    #[error("could not pack vendored dependencies")]
    Archive(#[from] ArchiveError),

    #[error("could not access vendor index {path:?}")]
    Index {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("vendor index {path:?} is malformed")]
    IndexFormat {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Packs an ecosystem's dependency caches.
pub trait VendorStrategy: Send + Sync {
    /// Directory the caches live in, both in the vendor image and in the
    /// worker.
    fn vendor_root(&self) -> &Path;

    /// Root-relative cache directories to ship.
    fn cache_dirs(&self) -> &[&str];

    fn vendor(&self, out_dir: &Path, name: &str) -> Result<VendorArchive, VendorError> {
        let root = self.vendor_root();
        let entries: Vec<String> = self
            .cache_dirs()
            .iter()
            .filter(|dir| root.join(dir).exists())
            .map(|dir| dir.to_string())
            .collect();

        let archive = out_dir.join(format!("{name}.tar"));
        archive::pack_entries(root, &entries, &archive)?;
        info!(?archive, ?entries, target = ?root, "Vendored dependencies");

        Ok(VendorArchive {
            archive,
            target: root.to_path_buf(),
        })
    }
}

/// Cargo registry, git checkouts and installed binaries under `/root/.cargo`.
pub struct RustVendor {
    root: PathBuf,
}

impl Default for RustVendor {
    fn default() -> Self {
        Self {
            root: PathBuf::from("/root"),
        }
    }
}

impl VendorStrategy for RustVendor {
    fn vendor_root(&self) -> &Path {
        &self.root
    }

    fn cache_dirs(&self) -> &[&str] {
        &[".cargo/registry", ".cargo/git", ".cargo/bin"]
    }
}

/// Whole cargo and rustup installations under `/usr/local`.
pub struct PhalaVendor {
    root: PathBuf,
}

impl Default for PhalaVendor {
    fn default() -> Self {
        Self {
            root: PathBuf::from("/usr/local"),
        }
    }
}

impl VendorStrategy for PhalaVendor {
    fn vendor_root(&self) -> &Path {
        &self.root
    }

    fn cache_dirs(&self) -> &[&str] {
        &["cargo", "rustup"]
    }
}

/// Language name to strategy lookup.
pub struct VendorRegistry {
    strategies: BTreeMap<String, Box<dyn VendorStrategy>>,
}

impl VendorRegistry {
    pub fn empty() -> Self {
        Self {
            strategies: BTreeMap::new(),
        }
    }

    pub fn builtin() -> Self {
        let mut registry = Self::empty();
        registry.register("rust", Box::<RustVendor>::default());
        registry.register("phala", Box::<PhalaVendor>::default());
        registry
    }

    pub fn register(&mut self, language: &str, strategy: Box<dyn VendorStrategy>) {
        self.strategies.insert(language.to_lowercase(), strategy);
    }

    pub fn get(&self, language: &str) -> Result<&dyn VendorStrategy, VendorError> {
        self.strategies
            .get(&language.to_lowercase())
            .map(|strategy| &**strategy)
            .ok_or_else(|| VendorError::UnknownLanguage {
                language: language.to_string(),
            })
    }
}

/// Run the manifest's vendor command in `workdir`, then pack the caches of
/// the manifest's language into `out_dir` and write the index.
#[tracing::instrument(skip_all, fields(language = %manifest.language))]
pub async fn vendor_dependencies(
    registry: &VendorRegistry,
    manifest: &BuildManifest,
    workdir: &Path,
    out_dir: &Path,
) -> Result<VendorIndex, VendorError> {
    let strategy = registry.get(&manifest.language)?;
    let env = manifest.env_pairs()?;

    exec::run_shell(manifest.vendor_command(), workdir, &env).await?;

    let archive = strategy.vendor(out_dir, "vendor")?;
    let index = VendorIndex {
        archives: vec![archive],
    };
    index.write(out_dir).await?;
    Ok(index)
}

impl VendorIndex {
    pub async fn write(&self, dir: &Path) -> Result<(), VendorError> {
        let path = dir.join(VENDOR_INDEX_FILE);
        let json = serde_json::to_vec_pretty(self).map_err(|source| VendorError::IndexFormat {
            path: path.clone(),
            source,
        })?;
        tokio::fs::write(&path, json)
            .await
            .map_err(|source| VendorError::Index { path, source })
    }

    /// Read `vendor.json` from `dir`. Archive paths are resolved against
    /// `dir`, since the index is written from inside the vendor container
    /// where the directory is mounted elsewhere.
    pub async fn read(dir: &Path) -> Result<Self, VendorError> {
        let path = dir.join(VENDOR_INDEX_FILE);
        let json = tokio::fs::read(&path).await.map_err(|source| VendorError::Index {
            path: path.clone(),
            source,
        })?;
        let mut index: Self =
            serde_json::from_slice(&json).map_err(|source| VendorError::IndexFormat { path, source })?;
        for entry in &mut index.archives {
            if let Some(name) = entry.archive.file_name() {
                entry.archive = dir.join(name);
            }
        }
        Ok(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct TestVendor {
        root: PathBuf,
    }

    impl VendorStrategy for TestVendor {
        fn vendor_root(&self) -> &Path {
            &self.root
        }

        fn cache_dirs(&self) -> &[&str] {
            &["cache", "missing"]
        }
    }

    #[test]
    fn test_registry_lookup() {
        let registry = VendorRegistry::builtin();
        assert_eq!(registry.get("rust").unwrap().vendor_root(), Path::new("/root"));
        assert_eq!(registry.get("Phala").unwrap().vendor_root(), Path::new("/usr/local"));
        assert!(matches!(
            registry.get("haskell"),
            Err(VendorError::UnknownLanguage { .. })
        ));
    }

    #[tokio::test]
    async fn test_malformed_env_stops_vendoring() {
        let mut manifest =
            BuildManifest::from_json(r#"{"language":"rust","input":{"cmd":"touch ran"},"output":{"files":["a"]}}"#)
                .unwrap();
        manifest.input.env.push("NO_EQUALS_SIGN".to_string());
        let workdir = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();

        let err = vendor_dependencies(&VendorRegistry::builtin(), &manifest, workdir.path(), out.path())
            .await
            .unwrap_err();
        assert!(matches!(err, VendorError::Manifest(ManifestError::BadEnv { .. })), "{err}");
        assert!(!workdir.path().join("ran").exists());
    }

    #[tokio::test]
    async fn test_vendor_and_index_round_trip() {
        let root = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(root.path().join("cache/pkgs")).unwrap();
        std::fs::write(root.path().join("cache/pkgs/dep.crate"), "bytes").unwrap();
        let out = tempfile::tempdir().unwrap();

        let strategy = TestVendor {
            root: root.path().to_path_buf(),
        };
        let archive = strategy.vendor(out.path(), "vendor").unwrap();
        assert_eq!(archive.target, root.path());
        assert_eq!(
            crate::archive::list_files(&archive.archive).unwrap(),
            vec!["cache/pkgs/dep.crate"]
        );

        let index = VendorIndex {
            archives: vec![VendorArchive {
                archive: PathBuf::from("/tmp/vendor/vendor.tar"),
                target: PathBuf::from("/root"),
            }],
        };
        index.write(out.path()).await.unwrap();
        let read = VendorIndex::read(out.path()).await.unwrap();
        assert_eq!(read.archives[0].archive, out.path().join("vendor.tar"));
        assert_eq!(read.archives[0].target, PathBuf::from("/root"));
    }
}
