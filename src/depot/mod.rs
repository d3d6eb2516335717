use std::fs::{self, File};
use std::io::{self, BufRead, Write};
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};

use nix::libc;

use crate::catalog::Catalog;
use crate::config::{Config, DEPOT_MODE};
use crate::error::{Error, Result};
use crate::extract;
use crate::fsutil;
use crate::layer::{Layer, Selector};

mod analyze;
mod inspect;
mod install;
mod uninstall;

/// the engine: catalog + backing stores + whole-depot lock under one prefix
///
/// opening the depot takes a shared lock; install and uninstall upgrade it
/// to exclusive for their duration and drop back down afterwards. the lock
/// descriptor dies with the process, so crashes can never leave the depot
/// wedged.
pub struct Depot {
    config: Config,
    catalog: Catalog,
    lock: DepotLock,
}

impl Depot {
    /// open (creating on first use) the depot under the configured prefix
    pub fn open(config: Config) -> Result<Self> {
        // the prefix itself must already exist; only the depot's own
        // directories are created here
        let depot_path = config.depot_path();
        fsutil::mkdir_mode(&depot_path, DEPOT_MODE).map_err(|source| Error::DepotUnreadable {
            path: depot_path.clone(),
            source,
        })?;
        let archives = config.archives_path();
        fsutil::mkdir_mode(&archives, DEPOT_MODE).map_err(|source| Error::DepotUnreadable {
            path: archives,
            source,
        })?;

        let lock = DepotLock::shared(&depot_path)?;
        let catalog = Catalog::open(&config.database_path())?;

        Ok(Self {
            config,
            catalog,
            lock,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    #[cfg(test)]
    pub(crate) fn config_mut(&mut self) -> &mut Config {
        &mut self.config
    }

    /// expanded backing directory of a layer
    pub(crate) fn layer_dir(&self, layer: &Layer) -> PathBuf {
        self.config.archives_path().join(layer.store_name())
    }

    /// snapshot tarball of a layer
    pub(crate) fn layer_snapshot(&self, layer: &Layer) -> PathBuf {
        self.config
            .archives_path()
            .join(format!("{}.tar.gz", layer.store_name()))
    }

    /// make sure a layer's backing directory is expanded on disk,
    /// re-inflating the snapshot when the expanded tree was pruned
    pub(crate) fn ensure_expanded(&self, layer: &Layer) -> Result<PathBuf> {
        let dir = self.layer_dir(layer);
        if dir.is_dir() {
            return Ok(dir);
        }
        let snap = self.layer_snapshot(layer);
        if !snap.is_file() {
            return Err(Error::StageIo {
                path: snap,
                source: io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("backing store for layer '{}' is gone", layer.name),
                ),
            });
        }
        if self.config.debug() {
            eprintln!("expanding {} into {}", snap.display(), dir.display());
        }
        extract::expand_snapshot(&snap, &dir)?;
        Ok(dir)
    }

    /// drop every expanded backing directory and any snapshot whose layer
    /// is no longer in the catalog
    pub(crate) fn prune_store(&self) -> Result<()> {
        let archives = self.config.archives_path();
        let live: Vec<String> = self
            .catalog
            .layers(true)?
            .iter()
            .map(|l| l.store_name())
            .collect();

        let entries = match fs::read_dir(&archives) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(source) => {
                return Err(Error::Io {
                    path: archives,
                    source,
                })
            }
        };
        for entry in entries {
            let entry = entry.map_err(|source| Error::Io {
                path: archives.clone(),
                source,
            })?;
            let path = entry.path();
            let name = entry.file_name().to_string_lossy().into_owned();
            if path.is_dir() {
                fsutil::remove_tree(&path).map_err(|source| Error::Io {
                    path: path.clone(),
                    source,
                })?;
            } else if let Some(stem) = name.strip_suffix(".tar.gz") {
                if !live.iter().any(|uuid| uuid == stem) {
                    fs::remove_file(&path).map_err(|source| Error::Io {
                        path: path.clone(),
                        source,
                    })?;
                }
            }
        }
        Ok(())
    }

    /// resolve a selector to concrete layers, newest first
    ///
    /// `superseded` and `all` may legitimately match nothing; the other
    /// forms fail with `SelectorNotFound`.
    pub fn resolve(&self, selector: &Selector) -> Result<Vec<Layer>> {
        let missing = || Error::SelectorNotFound(selector.to_string());
        match selector {
            Selector::Uuid(uuid) => {
                Ok(vec![self.catalog.layer_by_uuid(uuid)?.ok_or_else(missing)?])
            }
            Selector::Serial(serial) => Ok(vec![self
                .catalog
                .layer_by_serial(*serial)?
                .ok_or_else(missing)?]),
            Selector::Name(name) => {
                Ok(vec![self.catalog.layer_by_name(name)?.ok_or_else(missing)?])
            }
            Selector::Newest => Ok(vec![self.catalog.newest()?.ok_or_else(missing)?]),
            Selector::Oldest => Ok(vec![self.catalog.oldest()?.ok_or_else(missing)?]),
            Selector::Superseded => self.catalog.superseded_layers(),
            Selector::All => self.catalog.layers(false),
        }
    }

    /// scan for layers left inactive by an interrupted operation and offer
    /// to unwind them; force mode proceeds without asking
    pub fn check_consistency(&mut self) -> Result<()> {
        let inactive = self.catalog.inactive_layers()?;
        if inactive.is_empty() {
            return Ok(());
        }

        eprintln!(
            "The following layer{} in an inconsistent state and must be uninstalled before proceeding:",
            if inactive.len() > 1 { "s are" } else { " is" }
        );
        eprintln!();
        inspect::print_header_stderr();
        for layer in &inactive {
            eprintln!("{}", inspect::layer_row(layer));
        }
        eprintln!();

        if self.config.dry_run {
            eprintln!("(dry run, leaving them alone)");
            return Ok(());
        }
        if !self.config.force && !prompt_yes("Uninstall them now? [y/n] ") {
            return Err(Error::Inconsistent(inactive.len()));
        }
        self.unwind_inactive()
    }

    /// uninstall every inactive visible layer; their rollback twins vanish
    /// with them
    pub fn unwind_inactive(&mut self) -> Result<()> {
        for layer in self.catalog.inactive_layers()? {
            if layer.is_rollback() {
                continue;
            }
            self.uninstall(&layer)?;
        }
        Ok(())
    }
}

fn prompt_yes(question: &str) -> bool {
    eprint!("{question}");
    let _ = io::stderr().flush();
    let mut line = String::new();
    match io::stdin().lock().read_line(&mut line) {
        Ok(_) => matches!(line.trim_start().chars().next(), Some('y') | Some('Y')),
        Err(_) => false,
    }
}

/// advisory whole-depot lock: flock(2) on the depot directory itself
///
/// non-blocking on purpose: a second rootup racing for the depot should
/// fail fast with LockBusy, not queue up behind a long install.
pub(crate) struct DepotLock {
    file: File,
    path: PathBuf,
}

impl DepotLock {
    /// open the depot directory and take a shared lock
    fn shared(depot_path: &Path) -> Result<Self> {
        let file = File::open(depot_path).map_err(|source| Error::DepotUnreadable {
            path: depot_path.to_path_buf(),
            source,
        })?;
        let lock = Self {
            file,
            path: depot_path.to_path_buf(),
        };
        lock.flock(libc::LOCK_SH)?;
        Ok(lock)
    }

    /// upgrade to an exclusive lock
    pub(crate) fn exclusive(&self) -> Result<()> {
        self.flock(libc::LOCK_EX)
    }

    /// drop back down to a shared lock
    pub(crate) fn downgrade(&self) -> Result<()> {
        self.flock(libc::LOCK_SH)
    }

    fn flock(&self, op: i32) -> Result<()> {
        let ret = unsafe { libc::flock(self.file.as_raw_fd(), op | libc::LOCK_NB) };
        if ret == 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::EWOULDBLOCK) {
            Err(Error::LockBusy(self.path.clone()))
        } else {
            Err(Error::Io {
                path: self.path.clone(),
                source: err,
            })
        }
    }
}
// the kernel releases the lock when the descriptor closes
