use crate::error::{Error, Result};
use crate::layer::Layer;
use crate::record::{Diff, FileRecord, Info};

use super::Depot;

impl Depot {
    /// uninstall one layer, restoring what the stack says came before it
    ///
    /// rollback layers cannot be removed directly; they vanish with their
    /// visible twin once its uninstall has pulled their bytes back out.
    pub fn uninstall(&mut self, layer: &Layer) -> Result<()> {
        if layer.is_rollback() {
            return Err(Error::RollbackUninstall);
        }
        self.lock.exclusive()?;
        let res = self.uninstall_locked(layer);
        let downgraded = self.lock.downgrade();
        res?;
        downgraded
    }

    fn uninstall_locked(&mut self, layer: &Layer) -> Result<()> {
        let prefix = self.config.prefix().to_path_buf();
        let dry = self.config.dry_run;

        if !dry {
            // sentinel against a crash in the middle of the mutation below
            self.catalog.begin()?;
            self.catalog.set_active(layer.serial, false)?;
            self.catalog.commit()?;
        }

        // predecessor rows whose bytes went back to the live tree; their
        // catalog entries are no longer needed once we're done
        let mut doomed: Vec<i64> = Vec::new();
        // directory removals run after the walk, children before parents
        let mut dir_removals: Vec<FileRecord> = Vec::new();

        for rec in self.catalog.files_of(layer.serial)? {
            // the baseline predates the depot, never un-install it
            if rec.info.contains(Info::BASE_SYSTEM) {
                continue;
            }

            if self.catalog.file_superseded_by(&rec)?.is_some() {
                // a later layer owns this path now
                println!("  {}", rec.path);
                continue;
            }

            let actual = FileRecord::from_live(&prefix, &rec.path)?;
            if let Some(live) = &actual {
                if !FileRecord::compare(&rec, live).is_identical() && !self.config.force {
                    // user data now; leave their version alone
                    eprintln!(
                        "warning: {}",
                        Error::Conflict(self.config.prefix().join(rec.path.trim_start_matches('/')))
                    );
                    continue;
                }
            }

            let mut state = ' ';
            let preceding = match self.catalog.file_preceded_by(&rec)? {
                Some(p) => p,
                None => {
                    // every install records a predecessor, even if it is
                    // only a no-entry marker
                    eprintln!(
                        "{}:{}: no predecessor recorded for {}; leaving in place",
                        file!(),
                        line!(),
                        rec.path
                    );
                    continue;
                }
            };

            if preceding.info.contains(Info::NO_ENTRY) {
                state = 'R';
                if !dry {
                    if let Some(live) = &actual {
                        if live.kind.is_directory() {
                            dir_removals.push(live.clone());
                        } else {
                            let removed = live.remove(&prefix);
                            self.tolerate(removed)?;
                        }
                    }
                }
            } else {
                let d = FileRecord::compare(&rec, &preceding);
                if d.contains(Diff::DATA) || d.contains(Diff::TYPE) {
                    state = 'U';
                    if !dry {
                        let owner = self
                            .catalog
                            .layer_by_serial(preceding.layer)?
                            .ok_or_else(|| {
                                Error::CatalogCorrupt(format!(
                                    "file row for {} references missing layer {}",
                                    preceding.path, preceding.layer
                                ))
                            })?;
                        let backing = self.ensure_expanded(&owner)?;
                        let restored = preceding.install_data(&backing, &prefix);
                        self.tolerate(restored)?;
                    }
                } else if d.contains(Diff::MODE)
                    || d.contains(Diff::UID)
                    || d.contains(Diff::GID)
                {
                    state = 'U';
                    if !dry {
                        let repaired = preceding.install_meta(&prefix);
                        self.tolerate(repaired)?;
                    }
                }
                // else: byte-identical, leave the live file in place
            }

            // rollback bytes are back in the live tree (or were never
            // there); baseline records stay forever
            if preceding.info.contains(Info::NO_ENTRY | Info::ROLLBACK_DATA)
                && !preceding.info.contains(Info::BASE_SYSTEM)
            {
                doomed.push(preceding.serial);
            }

            println!("{state} {}", rec.path);
        }

        if dry {
            return Ok(());
        }

        for rec in dir_removals.iter().rev() {
            let removed = rec.remove(&prefix);
            self.tolerate(removed)?;
        }

        self.catalog.begin()?;
        for serial in doomed {
            self.catalog.delete_file(serial)?;
        }
        self.catalog.delete_files_of(layer.serial)?;
        self.catalog.delete_layer(layer.serial)?;
        self.catalog.prune_orphan_layers()?;
        // a surviving twin only holds baseline knowledge now; make sure it
        // cannot be mistaken for a half-finished install
        if let Some(twin) = self.catalog.layer_by_serial(layer.serial - 1)? {
            if twin.is_rollback() {
                self.catalog.set_active(twin.serial, true)?;
            }
        }
        self.catalog.commit()?;

        self.prune_store()
    }
}
