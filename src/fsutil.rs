use std::ffi::CString;
use std::fs::{self, Permissions};
use std::io;
use std::os::unix::fs::{symlink, MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};

use nix::libc;
use nix::unistd::{chown, Gid, Uid};

/// join a prefix-relative path (leading slash retained) onto a root
pub fn join_rel(root: &Path, rel: &str) -> PathBuf {
    root.join(rel.trim_start_matches('/'))
}

/// prefix-relative form (with leading slash) of a path under a walk root
pub fn rel_path(root: &Path, path: &Path) -> String {
    let rel = path.strip_prefix(root).unwrap_or(path);
    format!("/{}", rel.to_string_lossy())
}

/// parent of a prefix-relative path, or None at the root
pub fn rel_parent(rel: &str) -> Option<&str> {
    let trimmed = rel.trim_end_matches('/');
    let idx = trimmed.rfind('/')?;
    if idx == 0 {
        None
    } else {
        Some(&trimmed[..idx])
    }
}

/// create a single directory with the given mode; existing is fine,
/// a missing parent is not
pub fn mkdir_mode(path: &Path, mode: u32) -> io::Result<()> {
    match fs::create_dir(path) {
        Ok(()) => fs::set_permissions(path, Permissions::from_mode(mode)),
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(()),
        Err(e) => Err(e),
    }
}

/// create a directory and any missing parents with the given mode
pub fn mkdir_p(path: &Path, mode: u32) -> io::Result<()> {
    if path.is_dir() {
        return Ok(());
    }
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            mkdir_p(parent, mode)?;
        }
    }
    match fs::create_dir(path) {
        Ok(()) => fs::set_permissions(path, Permissions::from_mode(mode)),
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(()),
        Err(e) => Err(e),
    }
}

/// remove a directory tree; a missing root is not an error
pub fn remove_tree(path: &Path) -> io::Result<()> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// rename src over dst, falling back to a metadata-preserving copy when the
/// two sit on different filesystems
pub fn rename_or_copy(src: &Path, dst: &Path) -> io::Result<()> {
    match fs::rename(src, dst) {
        Ok(()) => Ok(()),
        Err(e) if e.raw_os_error() == Some(libc::EXDEV) => copy_preserving(src, dst),
        Err(e) => Err(e),
    }
}

/// copy one filesystem object preserving mode and ownership
///
/// symlinks are recreated (replacing any existing non-directory), directories
/// are created empty with the source's metadata, regular files are copied
/// byte for byte. ownership is only adjusted when it actually differs, so
/// unprivileged runs don't trip over no-op chowns.
pub fn copy_preserving(src: &Path, dst: &Path) -> io::Result<()> {
    let meta = fs::symlink_metadata(src)?;
    let ft = meta.file_type();

    if ft.is_symlink() {
        let target = fs::read_link(src)?;
        if fs::symlink_metadata(dst).is_ok() {
            fs::remove_file(dst)?;
        }
        symlink(&target, dst)?;
        lchown_if_needed(dst, meta.uid(), meta.gid())
    } else if ft.is_dir() {
        match fs::create_dir(dst) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
            Err(e) => return Err(e),
        }
        apply_owner_mode(dst, meta.uid(), meta.gid(), meta.mode())
    } else if ft.is_file() {
        fs::copy(src, dst)?;
        apply_owner_mode(dst, meta.uid(), meta.gid(), meta.mode())
    } else {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            format!("unsupported file type: {}", src.display()),
        ))
    }
}

/// adjust ownership and permission bits on an existing path, applying only
/// the deltas
pub fn apply_owner_mode(path: &Path, uid: u32, gid: u32, mode: u32) -> io::Result<()> {
    let meta = fs::symlink_metadata(path)?;
    if meta.uid() != uid || meta.gid() != gid {
        chown(path, Some(Uid::from_raw(uid)), Some(Gid::from_raw(gid)))
            .map_err(io::Error::from)?;
    }
    if meta.mode() & 0o7777 != mode & 0o7777 {
        fs::set_permissions(path, Permissions::from_mode(mode & 0o7777))?;
    }
    Ok(())
}

/// adjust ownership on a symlink itself (lchown), applying only the deltas
pub fn lchown_if_needed(path: &Path, uid: u32, gid: u32) -> io::Result<()> {
    let meta = fs::symlink_metadata(path)?;
    if meta.uid() == uid && meta.gid() == gid {
        return Ok(());
    }
    let c_path = CString::new(path.as_os_str().as_encoded_bytes())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "invalid path"))?;
    let ret = unsafe { libc::lchown(c_path.as_ptr(), uid, gid) };
    if ret != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_join_rel() {
        assert_eq!(
            join_rel(Path::new("/dest"), "/a/b"),
            PathBuf::from("/dest/a/b")
        );
        assert_eq!(join_rel(Path::new("/dest"), "a/b"), PathBuf::from("/dest/a/b"));
    }

    #[test]
    fn test_rel_path() {
        assert_eq!(
            rel_path(Path::new("/stage"), Path::new("/stage/a/b")),
            "/a/b"
        );
    }

    #[test]
    fn test_rel_parent() {
        assert_eq!(rel_parent("/a/b/c"), Some("/a/b"));
        assert_eq!(rel_parent("/a/b"), Some("/a"));
        assert_eq!(rel_parent("/a"), None);
        assert_eq!(rel_parent("/"), None);
    }

    #[test]
    fn test_mkdir_p_sets_mode() {
        let dir = tempdir().unwrap();
        let deep = dir.path().join("a/b/c");

        mkdir_p(&deep, 0o750).unwrap();

        assert!(deep.is_dir());
        let mode = fs::metadata(&deep).unwrap().mode();
        assert_eq!(mode & 0o777, 0o750);

        // second call is a no-op
        mkdir_p(&deep, 0o750).unwrap();
    }

    #[test]
    fn test_remove_tree_missing_is_ok() {
        let dir = tempdir().unwrap();
        remove_tree(&dir.path().join("nope")).unwrap();
    }

    #[test]
    fn test_copy_preserving_file_mode() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("src");
        let dst = dir.path().join("dst");
        fs::write(&src, b"payload").unwrap();
        fs::set_permissions(&src, Permissions::from_mode(0o640)).unwrap();

        copy_preserving(&src, &dst).unwrap();

        assert_eq!(fs::read(&dst).unwrap(), b"payload");
        assert_eq!(fs::metadata(&dst).unwrap().mode() & 0o777, 0o640);
    }

    #[test]
    fn test_copy_preserving_symlink() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("src");
        let dst = dir.path().join("dst");
        symlink("/some/target", &src).unwrap();

        copy_preserving(&src, &dst).unwrap();

        assert_eq!(fs::read_link(&dst).unwrap(), PathBuf::from("/some/target"));
    }

    #[test]
    fn test_copy_preserving_directory() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("src");
        let dst = dir.path().join("dst");
        fs::create_dir(&src).unwrap();
        fs::set_permissions(&src, Permissions::from_mode(0o711)).unwrap();

        copy_preserving(&src, &dst).unwrap();

        assert!(dst.is_dir());
        assert_eq!(fs::metadata(&dst).unwrap().mode() & 0o777, 0o711);
    }

    #[test]
    fn test_rename_or_copy_same_fs() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("src");
        let dst = dir.path().join("dst");
        fs::write(&src, b"moved").unwrap();

        rename_or_copy(&src, &dst).unwrap();

        assert!(!src.exists());
        assert_eq!(fs::read(&dst).unwrap(), b"moved");
    }
}
