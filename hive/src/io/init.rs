//! Initialization helpers for `.hive/` scaffolding.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};

use super::config::{HiveConfig, write_config};

/// All canonical paths within `.hive/` for a project root.
#[derive(Debug, Clone)]
pub struct HivePaths {
    pub root: PathBuf,
    pub hive_dir: PathBuf,
    pub store_dir: PathBuf,
    pub config_path: PathBuf,
    pub gitignore_path: PathBuf,
}

impl HivePaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let hive_dir = root.join(".hive");
        Self {
            root: root.clone(),
            store_dir: hive_dir.join("store"),
            config_path: hive_dir.join("config.toml"),
            gitignore_path: hive_dir.join(".gitignore"),
            hive_dir,
        }
    }
}

/// Options for `init_hive`.
#[derive(Debug, Clone)]
pub struct InitOptions {
    /// If true, overwrite the existing config and gitignore.
    pub force: bool,
}

/// Create `.hive/` scaffolding in `root`.
///
/// Fails if `.hive/` already exists unless `options.force` is set. The store
/// directory is never cleared.
pub fn init_hive(root: &Path, options: &InitOptions) -> Result<HivePaths> {
    let paths = HivePaths::new(root);
    if paths.hive_dir.exists() && !options.force {
        return Err(anyhow!(
            "hive init: .hive already exists (use --force to overwrite)"
        ));
    }
    if paths.hive_dir.exists() && !paths.hive_dir.is_dir() {
        return Err(anyhow!("hive init: .hive exists but is not a directory"));
    }

    create_dir(&paths.hive_dir)?;
    create_dir(&paths.store_dir)?;
    write_config(&paths.config_path, &HiveConfig::default())?;
    fs::write(&paths.gitignore_path, HIVE_GITIGNORE)
        .with_context(|| format!("write file {}", paths.gitignore_path.display()))?;

    Ok(paths)
}

fn create_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path).with_context(|| format!("create directory {}", path.display()))
}

const HIVE_GITIGNORE: &str = "store/\n";
