use std::fs::{self, File};
use std::io::Read;
use std::path::Path;

use bzip2::read::BzDecoder;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use walkdir::WalkDir;

use crate::error::{Error, IoResultExt, Result};
use crate::fsutil;

/// stage an archive or directory into `dest`, preserving metadata
///
/// accepts a plain directory (copied), or a tar stream: `.tar`,
/// `.tar.gz`/`.tgz`, `.tar.bz2`/`.tbz2` (pax-format tars included).
pub fn stage(source: &Path, dest: &Path) -> Result<()> {
    let meta = fs::metadata(source).map_err(|e| decode_err(source, e.to_string()))?;
    if meta.is_dir() {
        return copy_tree(source, dest);
    }

    let name = source
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let fh = File::open(source).map_err(|e| decode_err(source, e.to_string()))?;

    if name.ends_with(".tar") {
        unpack(fh, source, dest)
    } else if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
        unpack(GzDecoder::new(fh), source, dest)
    } else if name.ends_with(".tar.bz2") || name.ends_with(".tbz2") {
        unpack(BzDecoder::new(fh), source, dest)
    } else {
        Err(decode_err(source, "unknown archive format".to_string()))
    }
}

/// pack an expanded layer directory into its snapshot tarball
///
/// the snapshot is what survives once the expanded tree has been consumed
/// by the install phase.
pub fn snapshot(dir: &Path, tarball: &Path) -> Result<()> {
    let fh = File::create(tarball).with_stage(tarball)?;
    let enc = GzEncoder::new(fh, Compression::default());
    let mut builder = tar::Builder::new(enc);
    builder.follow_symlinks(false);
    builder.append_dir_all(".", dir).with_stage(dir)?;
    let enc = builder.into_inner().with_stage(tarball)?;
    enc.finish().with_stage(tarball)?;
    Ok(())
}

/// re-expand a snapshot tarball into its layer directory
pub fn expand_snapshot(tarball: &Path, dir: &Path) -> Result<()> {
    fs::create_dir_all(dir).with_stage(dir)?;
    let fh = File::open(tarball).with_stage(tarball)?;
    let mut archive = tar::Archive::new(GzDecoder::new(fh));
    archive.set_preserve_permissions(true);
    archive.unpack(dir).with_stage(dir)?;
    Ok(())
}

fn unpack<R: Read>(reader: R, source: &Path, dest: &Path) -> Result<()> {
    let mut archive = tar::Archive::new(reader);
    archive.set_preserve_permissions(true);
    archive
        .unpack(dest)
        .map_err(|e| decode_err(source, e.to_string()))
}

fn copy_tree(source: &Path, dest: &Path) -> Result<()> {
    for entry in WalkDir::new(source).min_depth(1).sort_by_file_name() {
        let entry = entry.map_err(|e| Error::StageIo {
            path: source.to_path_buf(),
            source: e.into(),
        })?;
        let rel = fsutil::rel_path(source, entry.path());
        let target = fsutil::join_rel(dest, &rel);
        fsutil::copy_preserving(entry.path(), &target).with_stage(entry.path())?;
    }
    Ok(())
}

fn decode_err(path: &Path, message: String) -> Error {
    Error::ArchiveDecode {
        path: path.to_path_buf(),
        message,
    }
}
