use std::path::Path;

use crate::config::DEPOT_MODE;
use crate::error::{Error, IoResultExt, Result};
use crate::extract;
use crate::fsutil;
use crate::layer::Layer;
use crate::record::Info;

use super::Depot;

impl Depot {
    /// install an archive or directory as a new layer
    ///
    /// creates the paired rollback layer first so its serial sits
    /// immediately below the visible layer's, analyzes the staged tree,
    /// then moves bytes in backup-before-install order. both layers stay
    /// active=false until every byte is in place, which is what the
    /// consistency scan keys on after a crash.
    pub fn install(&mut self, source: &Path) -> Result<Layer> {
        self.lock.exclusive()?;
        let res = self.install_locked(source);
        let downgraded = self.lock.downgrade();
        let layer = res?;
        downgraded?;
        Ok(layer)
    }

    fn install_locked(&mut self, source: &Path) -> Result<Layer> {
        let name = source
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "root".to_string());

        let mut rollback = Layer::rollback();
        let mut visible = Layer::new(name);

        self.catalog.begin()?;
        let rollback_files =
            match self.stage_and_analyze(source, &mut rollback, &mut visible) {
                Ok(count) => count,
                Err(e) => {
                    let _ = self.catalog.rollback();
                    let _ = fsutil::remove_tree(&self.layer_dir(&rollback));
                    let _ = fsutil::remove_tree(&self.layer_dir(&visible));
                    return Err(e);
                }
            };
        let have_rollback = rollback_files > 0;
        if !have_rollback {
            // the install displaces nothing worth saving
            self.catalog.delete_layer(rollback.serial)?;
        }

        if self.config.dry_run {
            self.catalog.rollback()?;
            let _ = fsutil::remove_tree(&self.layer_dir(&rollback));
            let _ = fsutil::remove_tree(&self.layer_dir(&visible));
            return Ok(visible);
        }
        self.catalog.commit()?;

        // from here on a failure leaves both layers inactive for the next
        // run's consistency scan; no partial cleanup is attempted
        let visible_dir = self.layer_dir(&visible);
        extract::snapshot(&visible_dir, &self.layer_snapshot(&visible))?;

        if have_rollback {
            self.backup_phase(&rollback)?;
        }
        self.install_phase(&visible)?;

        self.catalog.begin()?;
        if have_rollback {
            self.catalog.set_active(rollback.serial, true)?;
        }
        self.catalog.set_active(visible.serial, true)?;
        self.catalog.commit()?;
        visible.active = true;

        let _ = fsutil::remove_tree(&visible_dir);
        let _ = fsutil::remove_tree(&self.layer_dir(&rollback));

        Ok(visible)
    }

    /// transactional first half: layer rows, extraction, analysis
    fn stage_and_analyze(
        &mut self,
        source: &Path,
        rollback: &mut Layer,
        visible: &mut Layer,
    ) -> Result<u64> {
        self.catalog.insert_layer(rollback)?;
        self.catalog.insert_layer(visible)?;

        let rollback_dir = self.layer_dir(rollback);
        let visible_dir = self.layer_dir(visible);
        fsutil::mkdir_p(&rollback_dir, DEPOT_MODE).with_stage(&rollback_dir)?;
        fsutil::mkdir_p(&visible_dir, DEPOT_MODE).with_stage(&visible_dir)?;

        extract::stage(source, &visible_dir)?;
        self.analyze_stage(&visible_dir, visible, rollback)
    }

    /// save every displaced live file into the rollback backing store,
    /// then freeze it into a snapshot
    fn backup_phase(&self, rollback: &Layer) -> Result<()> {
        let prefix = self.config.prefix();
        let rollback_dir = self.layer_dir(rollback);
        for rec in self.catalog.files_of(rollback.serial)? {
            if !rec.info.contains(Info::ROLLBACK_DATA) {
                continue;
            }
            let live = fsutil::join_rel(prefix, &rec.path);
            let saved = fsutil::join_rel(&rollback_dir, &rec.path);
            let copied = fsutil::copy_preserving(&live, &saved).with_live(&live);
            self.tolerate(copied)?;
        }
        extract::snapshot(&rollback_dir, &self.layer_snapshot(rollback))
    }

    /// lay the staged bytes onto the live tree in path order; records
    /// without INSTALL_DATA only get their metadata adjusted
    fn install_phase(&self, visible: &Layer) -> Result<()> {
        let prefix = self.config.prefix();
        let visible_dir = self.layer_dir(visible);
        for rec in self.catalog.files_of(visible.serial)? {
            let res = if rec.info.contains(Info::INSTALL_DATA) {
                rec.install_data(&visible_dir, prefix)
            } else {
                rec.install_meta(prefix)
            };
            self.tolerate(res)?;
        }
        Ok(())
    }

    /// install a new copy of a root, then retire the ones it replaces
    ///
    /// the layer to replace is matched by the archive's basename; repeated
    /// upgrades therefore always leave exactly one layer with that name.
    pub fn upgrade(&mut self, source: &Path) -> Result<Layer> {
        let name = source
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "root".to_string());
        let previous = self.catalog.layers_named(&name)?;
        if previous.is_empty() {
            return Err(Error::SelectorNotFound(name));
        }

        let installed = self.install(source)?;
        if self.config.dry_run {
            return Ok(installed);
        }
        for old in previous {
            if old.serial != installed.serial {
                self.uninstall(&old)?;
            }
        }
        Ok(installed)
    }

    /// with --force, live-tree trouble and conflicts demote to warnings
    pub(crate) fn tolerate(&self, res: Result<()>) -> Result<()> {
        match res {
            Err(e @ (Error::LiveIo { .. } | Error::Conflict(_))) if self.config.force => {
                eprintln!("warning (forced past): {e}");
                Ok(())
            }
            other => other,
        }
    }
}
