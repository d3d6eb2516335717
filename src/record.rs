use std::fmt;
use std::fs::{self, Metadata};
use std::io;
use std::ops::BitOr;
use std::os::unix::fs::{symlink, MetadataExt};
use std::path::Path;

use nix::libc;

use crate::digest::Digest;
use crate::error::{Error, IoResultExt, Result};
use crate::fsutil;

/// info bits stored on every catalog row (the values are part of the
/// on-disk catalog format)
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct Info(u32);

impl Info {
    /// the record describes a file that predates any install
    pub const BASE_SYSTEM: Info = Info(0x0001);
    /// sentinel: no filesystem object exists at this path
    pub const NO_ENTRY: Info = Info(0x0002);
    /// bytes must be laid down from the staging directory
    pub const INSTALL_DATA: Info = Info(0x0010);
    /// bytes must be saved into the layer's backing directory
    pub const ROLLBACK_DATA: Info = Info(0x0020);

    pub fn contains(self, other: Info) -> bool {
        self.0 & other.0 != 0
    }

    pub fn insert(&mut self, other: Info) {
        self.0 |= other.0;
    }

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn from_bits(bits: u32) -> Self {
        Self(bits)
    }
}

impl BitOr for Info {
    type Output = Info;
    fn bitor(self, rhs: Info) -> Info {
        Info(self.0 | rhs.0)
    }
}

impl fmt::Debug for Info {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Info({:#06x})", self.0)
    }
}

/// difference bits returned by [`FileRecord::compare`]; empty means identical
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct Diff(u32);

impl Diff {
    pub const IDENTICAL: Diff = Diff(0);
    pub const UID: Diff = Diff(0x0001);
    pub const GID: Diff = Diff(0x0002);
    pub const MODE: Diff = Diff(0x0004);
    pub const TYPE: Diff = Diff(0x0008);
    pub const DATA: Diff = Diff(0x0010);

    pub fn is_identical(self) -> bool {
        self.0 == 0
    }

    pub fn contains(self, other: Diff) -> bool {
        self.0 & other.0 != 0
    }
}

impl BitOr for Diff {
    type Output = Diff;
    fn bitor(self, rhs: Diff) -> Diff {
        Diff(self.0 | rhs.0)
    }
}

impl fmt::Debug for Diff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Diff({:#06x})", self.0)
    }
}

/// kind of filesystem object, with kind-specific payload
///
/// regular files digest their bytes, symlinks digest the target string,
/// directories carry no digest (their contents belong to other records),
/// and no-entry is the synthetic "nothing here" placeholder that drives
/// removal on uninstall.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RecordKind {
    Regular { digest: Digest },
    Symlink { digest: Digest },
    Directory,
    NoEntry,
}

impl RecordKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            RecordKind::Regular { .. } => "regular",
            RecordKind::Symlink { .. } => "symlink",
            RecordKind::Directory => "directory",
            RecordKind::NoEntry => "no entry",
        }
    }

    pub fn is_directory(&self) -> bool {
        matches!(self, RecordKind::Directory)
    }

    pub fn is_no_entry(&self) -> bool {
        matches!(self, RecordKind::NoEntry)
    }

    /// content digest, if this kind carries one
    pub fn digest(&self) -> Option<&Digest> {
        match self {
            RecordKind::Regular { digest } => Some(digest),
            RecordKind::Symlink { digest } => Some(digest),
            _ => None,
        }
    }
}

/// one catalog row: a filesystem object as some layer saw it
#[derive(Clone, Debug)]
pub struct FileRecord {
    /// row serial, 0 until inserted
    pub serial: i64,
    /// owning layer serial
    pub layer: i64,
    pub info: Info,
    pub kind: RecordKind,
    /// full st_mode including the type bits; 0 for no-entry
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    /// path relative to the prefix, leading slash retained
    pub path: String,
}

impl FileRecord {
    /// synthetic record for a path with no filesystem object behind it
    pub fn no_entry(path: impl Into<String>) -> Self {
        Self {
            serial: 0,
            layer: 0,
            info: Info::NO_ENTRY,
            kind: RecordKind::NoEntry,
            mode: 0,
            uid: 0,
            gid: 0,
            size: 0,
            path: path.into(),
        }
    }

    /// build a record for a staged entry rooted at `stage_root`
    pub fn from_staged(stage_root: &Path, rel: &str) -> Result<Self> {
        let full = fsutil::join_rel(stage_root, rel);
        let meta = fs::symlink_metadata(&full).with_stage(&full)?;
        let kind = kind_of(&full, &meta).with_stage(&full)?;
        Ok(Self::from_parts(rel, &meta, kind))
    }

    /// read the live object at `prefix`/`rel`, if one exists
    pub fn from_live(prefix: &Path, rel: &str) -> Result<Option<Self>> {
        let full = fsutil::join_rel(prefix, rel);
        let meta = match fs::symlink_metadata(&full) {
            Ok(meta) => meta,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Error::LiveIo {
                path: full,
                source: e,
            }),
        };
        let kind = kind_of(&full, &meta).with_live(&full)?;
        Ok(Some(Self::from_parts(rel, &meta, kind)))
    }

    fn from_parts(rel: &str, meta: &Metadata, kind: RecordKind) -> Self {
        Self {
            serial: 0,
            layer: 0,
            info: Info::default(),
            kind,
            mode: meta.mode(),
            uid: meta.uid(),
            gid: meta.gid(),
            size: meta.len(),
            path: rel.to_string(),
        }
    }

    /// compare two records, returning the union of difference bits
    ///
    /// two directories with matching mode/uid/gid are identical regardless
    /// of contents; two no-entry records are identical; everything else
    /// differs from no-entry at least on TYPE.
    pub fn compare(a: &FileRecord, b: &FileRecord) -> Diff {
        let mut d = Diff::IDENTICAL;
        if a.uid != b.uid {
            d = d | Diff::UID;
        }
        if a.gid != b.gid {
            d = d | Diff::GID;
        }
        if a.mode & 0o7777 != b.mode & 0o7777 {
            d = d | Diff::MODE;
        }
        if a.mode & libc::S_IFMT as u32 != b.mode & libc::S_IFMT as u32 {
            d = d | Diff::TYPE;
        }
        if a.kind.digest() != b.kind.digest() {
            d = d | Diff::DATA;
        }
        d
    }

    /// lay this record's bytes down on the live tree from a backing directory
    ///
    /// regular files move into place with an atomic rename (copy fallback
    /// across filesystems), symlinks are recreated, directories are created
    /// with the recorded mode or, when already present, only adjusted. a
    /// non-directory squatting where a directory must go is an error.
    pub fn install_data(&self, backing: &Path, prefix: &Path) -> Result<()> {
        let src = fsutil::join_rel(backing, &self.path);
        let dst = fsutil::join_rel(prefix, &self.path);
        match &self.kind {
            RecordKind::Regular { .. } => {
                fsutil::rename_or_copy(&src, &dst).with_live(&dst)?;
                fsutil::apply_owner_mode(&dst, self.uid, self.gid, self.mode).with_live(&dst)?;
            }
            RecordKind::Symlink { .. } => {
                let target = fs::read_link(&src).with_stage(&src)?;
                if fs::symlink_metadata(&dst).is_ok() {
                    fs::remove_file(&dst).with_live(&dst)?;
                }
                symlink(&target, &dst).with_live(&dst)?;
                fsutil::lchown_if_needed(&dst, self.uid, self.gid).with_live(&dst)?;
            }
            RecordKind::Directory => match fs::symlink_metadata(&dst) {
                Ok(meta) if meta.is_dir() => {
                    fsutil::apply_owner_mode(&dst, self.uid, self.gid, self.mode)
                        .with_live(&dst)?;
                }
                Ok(_) => {
                    return Err(Error::LiveIo {
                        path: dst,
                        source: io::Error::new(
                            io::ErrorKind::AlreadyExists,
                            "a non-directory is in the way of a directory",
                        ),
                    });
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    fs::create_dir(&dst).with_live(&dst)?;
                    fsutil::apply_owner_mode(&dst, self.uid, self.gid, self.mode)
                        .with_live(&dst)?;
                }
                Err(e) => {
                    return Err(Error::LiveIo {
                        path: dst,
                        source: e,
                    });
                }
            },
            RecordKind::NoEntry => {}
        }
        Ok(())
    }

    /// adjust mode/uid/gid on the live object, no byte movement
    pub fn install_meta(&self, prefix: &Path) -> Result<()> {
        let dst = fsutil::join_rel(prefix, &self.path);
        match &self.kind {
            RecordKind::NoEntry => Ok(()),
            // mode is meaningless on a symlink, ownership isn't
            RecordKind::Symlink { .. } => {
                fsutil::lchown_if_needed(&dst, self.uid, self.gid).with_live(&dst)
            }
            _ => fsutil::apply_owner_mode(&dst, self.uid, self.gid, self.mode).with_live(&dst),
        }
    }

    /// remove the live object
    ///
    /// a missing object is benign (we were going to delete it anyway), and
    /// so is a non-empty directory: another layer may still own files there.
    pub fn remove(&self, prefix: &Path) -> Result<()> {
        let dst = fsutil::join_rel(prefix, &self.path);
        match &self.kind {
            RecordKind::NoEntry => Ok(()),
            RecordKind::Directory => match fs::remove_dir(&dst) {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
                Err(e) if e.raw_os_error() == Some(libc::ENOTEMPTY) => Ok(()),
                Err(e) => Err(Error::LiveIo {
                    path: dst,
                    source: e,
                }),
            },
            _ => match fs::remove_file(&dst) {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(Error::LiveIo {
                    path: dst,
                    source: e,
                }),
            },
        }
    }

    /// ls-style mode string for the files/verify listings
    pub fn mode_string(&self) -> String {
        let type_ch = match &self.kind {
            RecordKind::Regular { .. } => '-',
            RecordKind::Symlink { .. } => 'l',
            RecordKind::Directory => 'd',
            RecordKind::NoEntry => '?',
        };
        let m = self.mode;
        let mut s = String::with_capacity(10);
        s.push(type_ch);
        for (shift, special, lower, upper) in
            [(6, 0o4000, 's', 'S'), (3, 0o2000, 's', 'S'), (0, 0o1000, 't', 'T')]
        {
            s.push(if m >> shift & 0o4 != 0 { 'r' } else { '-' });
            s.push(if m >> shift & 0o2 != 0 { 'w' } else { '-' });
            let x = m >> shift & 0o1 != 0;
            s.push(match (m & special != 0, x) {
                (true, true) => lower,
                (true, false) => upper,
                (false, true) => 'x',
                (false, false) => '-',
            });
        }
        s
    }
}

/// kind of the filesystem object behind `meta`, digesting content as needed
fn kind_of(full: &Path, meta: &Metadata) -> io::Result<RecordKind> {
    let ft = meta.file_type();
    if ft.is_dir() {
        Ok(RecordKind::Directory)
    } else if ft.is_symlink() {
        Ok(RecordKind::Symlink {
            digest: Digest::of_symlink(full)?,
        })
    } else if ft.is_file() {
        Ok(RecordKind::Regular {
            digest: Digest::of_file(full)?,
        })
    } else {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            format!("unsupported file type: {}", full.display()),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::Permissions;
    use std::os::unix::fs::{symlink, PermissionsExt};
    use tempfile::tempdir;

    fn staged(dir: &Path, rel: &str) -> FileRecord {
        FileRecord::from_staged(dir, rel).unwrap()
    }

    #[test]
    fn test_compare_identical_files() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("a"), b"same").unwrap();
        fs::write(dir.path().join("b"), b"same").unwrap();

        let a = staged(dir.path(), "/a");
        let b = staged(dir.path(), "/b");
        assert!(FileRecord::compare(&a, &b).is_identical());
    }

    #[test]
    fn test_compare_data_differs() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("a"), b"one").unwrap();
        fs::write(dir.path().join("b"), b"two").unwrap();

        let d = FileRecord::compare(&staged(dir.path(), "/a"), &staged(dir.path(), "/b"));
        assert!(d.contains(Diff::DATA));
        assert!(!d.contains(Diff::TYPE));
    }

    #[test]
    fn test_compare_mode_differs() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("a"), b"same").unwrap();
        fs::write(dir.path().join("b"), b"same").unwrap();
        fs::set_permissions(dir.path().join("b"), Permissions::from_mode(0o600)).unwrap();
        fs::set_permissions(dir.path().join("a"), Permissions::from_mode(0o644)).unwrap();

        let d = FileRecord::compare(&staged(dir.path(), "/a"), &staged(dir.path(), "/b"));
        assert!(d.contains(Diff::MODE));
        assert!(!d.contains(Diff::DATA));
    }

    #[test]
    fn test_compare_type_differs_even_with_same_content() {
        let dir = tempdir().unwrap();
        // a symlink whose target string equals a file's content still
        // differs on TYPE
        fs::write(dir.path().join("file"), b"/t").unwrap();
        symlink("/t", dir.path().join("link")).unwrap();

        let d = FileRecord::compare(&staged(dir.path(), "/file"), &staged(dir.path(), "/link"));
        assert!(d.contains(Diff::TYPE));
    }

    #[test]
    fn test_compare_directories_ignore_contents() {
        let dir = tempdir().unwrap();
        fs::create_dir(dir.path().join("a")).unwrap();
        fs::create_dir(dir.path().join("b")).unwrap();
        fs::write(dir.path().join("a/inner"), b"something").unwrap();

        assert!(FileRecord::compare(&staged(dir.path(), "/a"), &staged(dir.path(), "/b"))
            .is_identical());
    }

    #[test]
    fn test_compare_no_entry() {
        let a = FileRecord::no_entry("/x");
        let b = FileRecord::no_entry("/x");
        assert!(FileRecord::compare(&a, &b).is_identical());

        let dir = tempdir().unwrap();
        fs::write(dir.path().join("f"), b"data").unwrap();
        let f = staged(dir.path(), "/f");
        let d = FileRecord::compare(&f, &a);
        assert!(d.contains(Diff::TYPE));
        assert!(d.contains(Diff::DATA));
    }

    #[test]
    fn test_from_live_missing_is_none() {
        let dir = tempdir().unwrap();
        assert!(FileRecord::from_live(dir.path(), "/absent").unwrap().is_none());
    }

    #[test]
    fn test_install_data_regular() {
        let backing = tempdir().unwrap();
        let prefix = tempdir().unwrap();
        fs::create_dir(backing.path().join("d")).unwrap();
        fs::write(backing.path().join("d/f"), b"bytes").unwrap();
        fs::create_dir(prefix.path().join("d")).unwrap();

        let rec = staged(backing.path(), "/d/f");
        rec.install_data(backing.path(), prefix.path()).unwrap();

        assert_eq!(fs::read(prefix.path().join("d/f")).unwrap(), b"bytes");
    }

    #[test]
    fn test_install_data_replaces_existing_file() {
        let backing = tempdir().unwrap();
        let prefix = tempdir().unwrap();
        fs::write(backing.path().join("f"), b"new").unwrap();
        fs::write(prefix.path().join("f"), b"old").unwrap();

        let rec = staged(backing.path(), "/f");
        rec.install_data(backing.path(), prefix.path()).unwrap();

        assert_eq!(fs::read(prefix.path().join("f")).unwrap(), b"new");
    }

    #[test]
    fn test_install_data_symlink() {
        let backing = tempdir().unwrap();
        let prefix = tempdir().unwrap();
        symlink("/elsewhere", backing.path().join("l")).unwrap();

        let rec = staged(backing.path(), "/l");
        rec.install_data(backing.path(), prefix.path()).unwrap();

        assert_eq!(
            fs::read_link(prefix.path().join("l")).unwrap(),
            std::path::PathBuf::from("/elsewhere")
        );
    }

    #[test]
    fn test_install_data_directory_over_file_is_refused() {
        let backing = tempdir().unwrap();
        let prefix = tempdir().unwrap();
        fs::create_dir(backing.path().join("d")).unwrap();
        fs::write(prefix.path().join("d"), b"i am a file").unwrap();

        let rec = staged(backing.path(), "/d");
        assert!(rec.install_data(backing.path(), prefix.path()).is_err());
    }

    #[test]
    fn test_install_data_directory_adjusts_existing() {
        let backing = tempdir().unwrap();
        let prefix = tempdir().unwrap();
        fs::create_dir(backing.path().join("d")).unwrap();
        fs::set_permissions(backing.path().join("d"), Permissions::from_mode(0o700)).unwrap();
        fs::create_dir(prefix.path().join("d")).unwrap();
        fs::set_permissions(prefix.path().join("d"), Permissions::from_mode(0o755)).unwrap();

        let rec = staged(backing.path(), "/d");
        rec.install_data(backing.path(), prefix.path()).unwrap();

        let mode = fs::metadata(prefix.path().join("d")).unwrap().mode();
        assert_eq!(mode & 0o777, 0o700);
    }

    #[test]
    fn test_remove_tolerates_missing_and_nonempty() {
        let prefix = tempdir().unwrap();
        let gone = FileRecord::no_entry("/gone");
        gone.remove(prefix.path()).unwrap();

        // a populated directory survives its own removal
        fs::create_dir(prefix.path().join("d")).unwrap();
        fs::write(prefix.path().join("d/keep"), b"keep").unwrap();
        let backing = tempdir().unwrap();
        fs::create_dir(backing.path().join("d")).unwrap();
        let rec = staged(backing.path(), "/d");
        rec.remove(prefix.path()).unwrap();
        assert!(prefix.path().join("d/keep").exists());

        // an empty one goes away
        fs::remove_file(prefix.path().join("d/keep")).unwrap();
        rec.remove(prefix.path()).unwrap();
        assert!(!prefix.path().join("d").exists());
    }

    #[test]
    fn test_mode_string() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("f"), b"x").unwrap();
        fs::set_permissions(dir.path().join("f"), Permissions::from_mode(0o644)).unwrap();
        assert_eq!(staged(dir.path(), "/f").mode_string(), "-rw-r--r--");

        fs::create_dir(dir.path().join("d")).unwrap();
        fs::set_permissions(dir.path().join("d"), Permissions::from_mode(0o755)).unwrap();
        assert_eq!(staged(dir.path(), "/d").mode_string(), "drwxr-xr-x");

        assert_eq!(FileRecord::no_entry("/x").mode_string(), "?---------");
    }
}
