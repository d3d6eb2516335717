use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// depot metadata directory under the prefix
pub const DEPOT_DIR: &str = ".DarwinDepot";
/// catalog file inside the depot directory
pub const DATABASE_FILE: &str = "Database-V100";
/// per-layer backing stores inside the depot directory
pub const ARCHIVES_DIR: &str = "Archives";
/// mode for the depot directories
pub const DEPOT_MODE: u32 = 0o750;

/// process-wide settings, passed explicitly into the depot
///
/// there is deliberately no module-level state: verbosity and the
/// force/dry-run switches travel with this value.
#[derive(Clone, Debug)]
pub struct Config {
    prefix: PathBuf,
    /// 0 = quiet, 1 = verbose, 2+ = debug
    pub verbosity: u8,
    /// push past non-fatal errors (conflicts, live-tree io)
    pub force: bool,
    /// report actions without touching the tree or the catalog
    pub dry_run: bool,
}

impl Config {
    /// configuration for a destination prefix; the prefix must be absolute
    pub fn new(prefix: impl Into<PathBuf>) -> Result<Self> {
        let prefix = prefix.into();
        if !prefix.is_absolute() {
            return Err(Error::BadPrefix(prefix));
        }
        Ok(Self {
            prefix,
            verbosity: 0,
            force: false,
            dry_run: false,
        })
    }

    /// destination prefix the depot operates on
    pub fn prefix(&self) -> &Path {
        &self.prefix
    }

    /// path to the depot metadata directory
    pub fn depot_path(&self) -> PathBuf {
        self.prefix.join(DEPOT_DIR)
    }

    /// path to the catalog file
    pub fn database_path(&self) -> PathBuf {
        self.depot_path().join(DATABASE_FILE)
    }

    /// path to the per-layer backing stores
    pub fn archives_path(&self) -> PathBuf {
        self.depot_path().join(ARCHIVES_DIR)
    }

    pub fn verbose(&self) -> bool {
        self.verbosity >= 1
    }

    pub fn debug(&self) -> bool {
        self.verbosity >= 2
    }
}
