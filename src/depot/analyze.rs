use std::fs;
use std::path::Path;

use walkdir::WalkDir;

use crate::error::{Error, IoResultExt, Result};
use crate::fsutil;
use crate::layer::Layer;
use crate::record::{Diff, FileRecord, Info};

use super::Depot;

impl Depot {
    /// three-way diff of a staged tree against the live tree and the catalog
    ///
    /// for every staged entry this compares the file to be installed, the
    /// file actually on the live tree, and the catalog's record of what the
    /// depot last put there. the outcome decides which records carry
    /// INSTALL_DATA, which live files must be saved into the rollback layer
    /// first, and what state letter the user sees. returns the number of
    /// records given to the rollback layer.
    pub(crate) fn analyze_stage(
        &self,
        stage: &Path,
        visible: &Layer,
        rollback: &Layer,
    ) -> Result<u64> {
        let prefix = self.config.prefix();
        let rollback_dir = self.layer_dir(rollback);
        let mut rollback_files = 0u64;

        for entry in WalkDir::new(stage).min_depth(1).sort_by_file_name() {
            let entry = entry.map_err(|e| Error::StageIo {
                path: stage.to_path_buf(),
                source: e.into(),
            })?;
            let rel = fsutil::rel_path(stage, entry.path());

            let mut file = FileRecord::from_staged(stage, &rel)?;
            file.layer = visible.serial;

            let mut actual = FileRecord::from_live(prefix, &rel)?
                .unwrap_or_else(|| FileRecord::no_entry(rel.clone()));

            let preceding = self.catalog.file_preceded_by(&file)?;
            if preceding.is_none() {
                // the depot has never touched this path: whatever is live
                // is the baseline. save its bytes unless there is nothing
                // to save (absence and directories need no backup).
                actual.info.insert(Info::BASE_SYSTEM);
                if !actual.kind.is_directory() && !actual.kind.is_no_entry() {
                    actual.info.insert(Info::ROLLBACK_DATA);
                    file.info.insert(Info::INSTALL_DATA);
                }
            }

            let d_fa = FileRecord::compare(&file, &actual);
            let d_ap = match &preceding {
                Some(p) => FileRecord::compare(&actual, p),
                None => Diff::IDENTICAL,
            };

            let mut state = ' ';
            if !d_fa.is_identical() {
                state = if actual.kind.is_no_entry() { 'A' } else { 'U' };
                if d_fa.contains(Diff::TYPE) || d_fa.contains(Diff::DATA) {
                    file.info.insert(Info::INSTALL_DATA);
                    // the live file drifted from what the depot last
                    // installed: that's user data, save it
                    if (d_ap.contains(Diff::TYPE) || d_ap.contains(Diff::DATA))
                        && !actual.kind.is_no_entry()
                    {
                        actual.info.insert(Info::ROLLBACK_DATA);
                    }
                }
            }

            if actual.info.contains(Info::ROLLBACK_DATA) {
                // carve out the destination hierarchy for the backup copy
                let backup = fsutil::join_rel(&rollback_dir, &rel);
                if let Some(parent) = backup.parent() {
                    fs::create_dir_all(parent).with_stage(parent)?;
                }
            }

            let keeps_baseline =
                actual.info.contains(Info::BASE_SYSTEM | Info::ROLLBACK_DATA);
            if (state != ' ' && !d_ap.is_identical()) || keeps_baseline {
                rollback_files += 1;
                if self.config.debug() {
                    eprintln!("[analyze] rollback record for {rel}");
                }
                let mut saved = actual.clone();
                saved.layer = rollback.serial;
                self.catalog.insert_file(rollback.serial, &saved)?;
                self.record_parents(&rel, rollback)?;
            }

            println!("{state} {rel}");
            self.catalog.insert_file(visible.serial, &file)?;
        }

        Ok(rollback_files)
    }

    /// record the live parent directories of a saved path in the rollback
    /// layer, so a deep restore can rebuild the hierarchy; stops at the
    /// first parent that does not exist (a pure baseline-of-absence)
    fn record_parents(&self, rel: &str, rollback: &Layer) -> Result<()> {
        let prefix = self.config.prefix();
        let mut cursor = fsutil::rel_parent(rel);
        while let Some(parent_rel) = cursor {
            // never clobber a row the walk already produced (the directory
            // itself sorts before its children and may carry baseline flags)
            if !self.catalog.has_file(rollback.serial, parent_rel)? {
                match FileRecord::from_live(prefix, parent_rel)? {
                    None => break,
                    Some(mut parent) => {
                        parent.layer = rollback.serial;
                        self.catalog.insert_file(rollback.serial, &parent)?;
                    }
                }
            }
            cursor = fsutil::rel_parent(parent_rel);
        }
        Ok(())
    }
}
