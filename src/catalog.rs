use std::path::Path;

use nix::libc;
use rusqlite::{params, Connection, OptionalExtension, Row};
use uuid::Uuid;

use crate::digest::Digest;
use crate::error::{Error, Result};
use crate::layer::{Layer, LAYER_ROLLBACK};
use crate::record::{FileRecord, Info, RecordKind};

/// durable catalog of layers and their file records
///
/// accessed only under the depot lock, so a single connection with WAL
/// journaling is all the crash consistency we need.
pub struct Catalog {
    conn: Connection,
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS layers (
    serial INTEGER PRIMARY KEY AUTOINCREMENT,
    uuid TEXT UNIQUE,
    name TEXT NOT NULL,
    installed INTEGER NOT NULL,
    active INTEGER NOT NULL DEFAULT 0,
    info INTEGER NOT NULL DEFAULT 0
);
CREATE TABLE IF NOT EXISTS files (
    serial INTEGER PRIMARY KEY AUTOINCREMENT,
    layer INTEGER NOT NULL,
    info INTEGER NOT NULL,
    mode INTEGER NOT NULL,
    uid INTEGER NOT NULL,
    gid INTEGER NOT NULL,
    size INTEGER NOT NULL,
    digest BLOB,
    path TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS layers_uuid ON layers (uuid);
CREATE INDEX IF NOT EXISTS files_path ON files (path);
"#;

const LAYER_COLS: &str = "serial, uuid, name, installed, active, info";
const FILE_COLS: &str = "serial, layer, info, mode, uid, gid, size, digest, path";

impl Catalog {
    /// open the catalog, creating the schema on first use
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn })
    }

    pub fn begin(&self) -> Result<()> {
        self.conn.execute_batch("BEGIN IMMEDIATE")?;
        Ok(())
    }

    pub fn commit(&self) -> Result<()> {
        self.conn.execute_batch("COMMIT")?;
        Ok(())
    }

    pub fn rollback(&self) -> Result<()> {
        self.conn.execute_batch("ROLLBACK")?;
        Ok(())
    }

    /// insert a layer row, assigning its serial
    pub fn insert_layer(&self, layer: &mut Layer) -> Result<()> {
        self.conn.execute(
            "INSERT INTO layers (uuid, name, installed, active, info) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                layer.store_name(),
                layer.name,
                layer.installed,
                layer.active as i64,
                layer.info as i64
            ],
        )?;
        layer.serial = self.conn.last_insert_rowid();
        Ok(())
    }

    /// insert or update one file record under a layer
    ///
    /// keyed on (layer, path): the analysis pass revisits parent directories
    /// and must never produce two rows for the same path in one layer.
    pub fn insert_file(&self, layer: i64, rec: &FileRecord) -> Result<i64> {
        let digest = rec.kind.digest().map(|d| d.as_bytes().to_vec());
        let existing: Option<i64> = self
            .conn
            .query_row(
                "SELECT serial FROM files WHERE layer = ?1 AND path = ?2",
                params![layer, rec.path],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(serial) = existing {
            self.conn.execute(
                "UPDATE files SET info = ?1, mode = ?2, uid = ?3, gid = ?4, size = ?5, \
                 digest = ?6 WHERE serial = ?7",
                params![
                    rec.info.bits() as i64,
                    rec.mode as i64,
                    rec.uid as i64,
                    rec.gid as i64,
                    rec.size as i64,
                    digest,
                    serial
                ],
            )?;
            return Ok(serial);
        }
        self.conn.execute(
            "INSERT INTO files (layer, info, mode, uid, gid, size, digest, path) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                layer,
                rec.info.bits() as i64,
                rec.mode as i64,
                rec.uid as i64,
                rec.gid as i64,
                rec.size as i64,
                digest,
                rec.path
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// does a layer already hold a record for this path?
    pub fn has_file(&self, layer: i64, path: &str) -> Result<bool> {
        let existing: Option<i64> = self
            .conn
            .query_row(
                "SELECT serial FROM files WHERE layer = ?1 AND path = ?2",
                params![layer, path],
                |row| row.get(0),
            )
            .optional()?;
        Ok(existing.is_some())
    }

    pub fn set_active(&self, serial: i64, active: bool) -> Result<()> {
        self.conn.execute(
            "UPDATE layers SET active = ?1 WHERE serial = ?2",
            params![active as i64, serial],
        )?;
        Ok(())
    }

    pub fn delete_layer(&self, serial: i64) -> Result<()> {
        self.conn
            .execute("DELETE FROM layers WHERE serial = ?1", params![serial])?;
        Ok(())
    }

    pub fn delete_files_of(&self, serial: i64) -> Result<()> {
        self.conn
            .execute("DELETE FROM files WHERE layer = ?1", params![serial])?;
        Ok(())
    }

    pub fn delete_file(&self, serial: i64) -> Result<()> {
        self.conn
            .execute("DELETE FROM files WHERE serial = ?1", params![serial])?;
        Ok(())
    }

    /// drop layer rows that no longer own any file rows
    pub fn prune_orphan_layers(&self) -> Result<()> {
        self.conn.execute(
            "DELETE FROM layers WHERE serial NOT IN (SELECT DISTINCT layer FROM files)",
            [],
        )?;
        Ok(())
    }

    /// every file record of a layer, ordered by path ascending
    pub fn files_of(&self, layer: i64) -> Result<Vec<FileRecord>> {
        let sql = format!(
            "SELECT {FILE_COLS} FROM files WHERE layer = ?1 ORDER BY path ASC"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let mut rows = stmt.query(params![layer])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(file_from_row(row)?);
        }
        Ok(out)
    }

    /// all layers, newest first; rollback twins only on request
    pub fn layers(&self, include_rollback: bool) -> Result<Vec<Layer>> {
        let sql = if include_rollback {
            format!("SELECT {LAYER_COLS} FROM layers ORDER BY serial DESC")
        } else {
            format!(
                "SELECT {LAYER_COLS} FROM layers WHERE (info & ?1) = 0 ORDER BY serial DESC"
            )
        };
        let mut stmt = self.conn.prepare(&sql)?;
        let mut out = Vec::new();
        if include_rollback {
            let mut rows = stmt.query([])?;
            while let Some(row) = rows.next()? {
                out.push(layer_from_row(row)?);
            }
        } else {
            let mut rows = stmt.query(params![LAYER_ROLLBACK as i64])?;
            while let Some(row) = rows.next()? {
                out.push(layer_from_row(row)?);
            }
        }
        Ok(out)
    }

    pub fn layer_by_serial(&self, serial: i64) -> Result<Option<Layer>> {
        self.layer_query(
            &format!("SELECT {LAYER_COLS} FROM layers WHERE serial = ?1"),
            params![serial],
        )
    }

    pub fn layer_by_uuid(&self, uuid: &Uuid) -> Result<Option<Layer>> {
        self.layer_query(
            &format!("SELECT {LAYER_COLS} FROM layers WHERE uuid = ?1"),
            params![uuid.to_string().to_uppercase()],
        )
    }

    /// the most recently installed layer with this display name
    pub fn layer_by_name(&self, name: &str) -> Result<Option<Layer>> {
        self.layer_query(
            &format!(
                "SELECT {LAYER_COLS} FROM layers WHERE name = ?1 ORDER BY serial DESC LIMIT 1"
            ),
            params![name],
        )
    }

    /// every non-rollback layer with this display name, newest first
    pub fn layers_named(&self, name: &str) -> Result<Vec<Layer>> {
        let sql = format!(
            "SELECT {LAYER_COLS} FROM layers WHERE name = ?1 AND (info & ?2) = 0 \
             ORDER BY serial DESC"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let mut rows = stmt.query(params![name, LAYER_ROLLBACK as i64])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(layer_from_row(row)?);
        }
        Ok(out)
    }

    /// highest-serial non-rollback layer
    pub fn newest(&self) -> Result<Option<Layer>> {
        self.layer_query(
            &format!(
                "SELECT {LAYER_COLS} FROM layers WHERE (info & ?1) = 0 \
                 ORDER BY serial DESC LIMIT 1"
            ),
            params![LAYER_ROLLBACK as i64],
        )
    }

    /// lowest-serial non-rollback layer
    pub fn oldest(&self) -> Result<Option<Layer>> {
        self.layer_query(
            &format!(
                "SELECT {LAYER_COLS} FROM layers WHERE (info & ?1) = 0 \
                 ORDER BY serial ASC LIMIT 1"
            ),
            params![LAYER_ROLLBACK as i64],
        )
    }

    /// non-rollback layers whose every file record is shadowed by a record
    /// of the same path in some newer layer
    pub fn superseded_layers(&self) -> Result<Vec<Layer>> {
        let sql = format!(
            "SELECT {LAYER_COLS} FROM layers AS l \
             WHERE (l.info & ?1) = 0 \
               AND EXISTS (SELECT 1 FROM files f WHERE f.layer = l.serial) \
               AND NOT EXISTS ( \
                   SELECT 1 FROM files f WHERE f.layer = l.serial AND NOT EXISTS ( \
                       SELECT 1 FROM files g WHERE g.path = f.path AND g.layer > f.layer)) \
             ORDER BY l.serial DESC"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let mut rows = stmt.query(params![LAYER_ROLLBACK as i64])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(layer_from_row(row)?);
        }
        Ok(out)
    }

    /// layers left inactive by an interrupted operation, newest first
    pub fn inactive_layers(&self) -> Result<Vec<Layer>> {
        let sql =
            format!("SELECT {LAYER_COLS} FROM layers WHERE active = 0 ORDER BY serial DESC");
        let mut stmt = self.conn.prepare(&sql)?;
        let mut rows = stmt.query([])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(layer_from_row(row)?);
        }
        Ok(out)
    }

    /// the record at the same path from the nearest older layer
    pub fn file_preceded_by(&self, rec: &FileRecord) -> Result<Option<FileRecord>> {
        self.file_query(
            &format!(
                "SELECT {FILE_COLS} FROM files WHERE layer < ?1 AND path = ?2 \
                 ORDER BY layer DESC LIMIT 1"
            ),
            rec,
        )
    }

    /// the record at the same path from the nearest newer layer
    pub fn file_superseded_by(&self, rec: &FileRecord) -> Result<Option<FileRecord>> {
        self.file_query(
            &format!(
                "SELECT {FILE_COLS} FROM files WHERE layer > ?1 AND path = ?2 \
                 ORDER BY layer ASC LIMIT 1"
            ),
            rec,
        )
    }

    fn layer_query(&self, sql: &str, params: impl rusqlite::Params) -> Result<Option<Layer>> {
        let mut stmt = self.conn.prepare(sql)?;
        let mut rows = stmt.query(params)?;
        match rows.next()? {
            Some(row) => Ok(Some(layer_from_row(row)?)),
            None => Ok(None),
        }
    }

    fn file_query(&self, sql: &str, rec: &FileRecord) -> Result<Option<FileRecord>> {
        let mut stmt = self.conn.prepare(sql)?;
        let mut rows = stmt.query(params![rec.layer, rec.path])?;
        match rows.next()? {
            Some(row) => Ok(Some(file_from_row(row)?)),
            None => Ok(None),
        }
    }
}

fn layer_from_row(row: &Row<'_>) -> Result<Layer> {
    let uuid_text: String = row.get(1)?;
    let uuid = Uuid::parse_str(&uuid_text)
        .map_err(|_| Error::CatalogCorrupt(format!("bad layer uuid '{uuid_text}'")))?;
    Ok(Layer {
        serial: row.get(0)?,
        uuid,
        name: row.get(2)?,
        installed: row.get(3)?,
        active: row.get::<_, i64>(4)? != 0,
        info: row.get::<_, i64>(5)? as u32,
    })
}

fn file_from_row(row: &Row<'_>) -> Result<FileRecord> {
    let path: String = row.get(8)?;
    let info = Info::from_bits(row.get::<_, i64>(2)? as u32);
    let mode = row.get::<_, i64>(3)? as u32;
    let digest = match row.get::<_, Option<Vec<u8>>>(7)? {
        Some(blob) => Some(Digest::from_blob(&blob).ok_or_else(|| {
            Error::CatalogCorrupt(format!("bad digest blob for '{path}'"))
        })?),
        None => None,
    };
    let kind = if info.contains(Info::NO_ENTRY) {
        RecordKind::NoEntry
    } else {
        match mode & libc::S_IFMT as u32 {
            m if m == libc::S_IFDIR as u32 => RecordKind::Directory,
            m if m == libc::S_IFLNK as u32 => RecordKind::Symlink {
                digest: digest.ok_or_else(|| {
                    Error::CatalogCorrupt(format!("symlink without digest at '{path}'"))
                })?,
            },
            m if m == libc::S_IFREG as u32 => RecordKind::Regular {
                digest: digest.ok_or_else(|| {
                    Error::CatalogCorrupt(format!("file without digest at '{path}'"))
                })?,
            },
            m => {
                return Err(Error::CatalogCorrupt(format!(
                    "unexpected mode {m:o} at '{path}'"
                )))
            }
        }
    };
    Ok(FileRecord {
        serial: row.get(0)?,
        layer: row.get(1)?,
        info,
        kind,
        mode,
        uid: row.get::<_, i64>(4)? as u32,
        gid: row.get::<_, i64>(5)? as u32,
        size: row.get::<_, i64>(6)? as u64,
        path,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn open_catalog(dir: &Path) -> Catalog {
        Catalog::open(&dir.join("Database-V100")).unwrap()
    }

    fn record(layer: i64, path: &str, content: &[u8]) -> FileRecord {
        FileRecord {
            serial: 0,
            layer,
            info: Info::default(),
            kind: RecordKind::Regular {
                digest: Digest::of_bytes(content),
            },
            mode: 0o100644,
            uid: 0,
            gid: 0,
            size: content.len() as u64,
            path: path.to_string(),
        }
    }

    #[test]
    fn test_layer_serials_are_monotonic() {
        let dir = tempdir().unwrap();
        let catalog = open_catalog(dir.path());

        let mut a = Layer::rollback();
        let mut b = Layer::new("root");
        catalog.insert_layer(&mut a).unwrap();
        catalog.insert_layer(&mut b).unwrap();

        assert!(a.serial > 0);
        assert!(b.serial > a.serial);
    }

    #[test]
    fn test_layer_roundtrip() {
        let dir = tempdir().unwrap();
        let catalog = open_catalog(dir.path());

        let mut layer = Layer::new("root.tar.gz");
        catalog.insert_layer(&mut layer).unwrap();

        let loaded = catalog.layer_by_serial(layer.serial).unwrap().unwrap();
        assert_eq!(loaded.uuid, layer.uuid);
        assert_eq!(loaded.name, "root.tar.gz");
        assert!(!loaded.active);

        let by_uuid = catalog.layer_by_uuid(&layer.uuid).unwrap().unwrap();
        assert_eq!(by_uuid.serial, layer.serial);

        let by_name = catalog.layer_by_name("root.tar.gz").unwrap().unwrap();
        assert_eq!(by_name.serial, layer.serial);
    }

    #[test]
    fn test_file_roundtrip() {
        let dir = tempdir().unwrap();
        let catalog = open_catalog(dir.path());

        let mut layer = Layer::new("root");
        catalog.insert_layer(&mut layer).unwrap();

        let mut rec = record(layer.serial, "/a/b", b"payload");
        rec.info.insert(Info::INSTALL_DATA);
        let serial = catalog.insert_file(layer.serial, &rec).unwrap();
        assert!(serial > 0);

        let files = catalog.files_of(layer.serial).unwrap();
        assert_eq!(files.len(), 1);
        let loaded = &files[0];
        assert_eq!(loaded.path, "/a/b");
        assert_eq!(loaded.mode, 0o100644);
        assert!(loaded.info.contains(Info::INSTALL_DATA));
        assert_eq!(loaded.kind, rec.kind);
    }

    #[test]
    fn test_insert_file_upserts_on_layer_and_path() {
        let dir = tempdir().unwrap();
        let catalog = open_catalog(dir.path());

        let mut layer = Layer::new("root");
        catalog.insert_layer(&mut layer).unwrap();

        let first = catalog
            .insert_file(layer.serial, &record(layer.serial, "/p", b"one"))
            .unwrap();
        let second = catalog
            .insert_file(layer.serial, &record(layer.serial, "/p", b"two"))
            .unwrap();

        assert_eq!(first, second);
        let files = catalog.files_of(layer.serial).unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(
            files[0].kind.digest().copied(),
            Some(Digest::of_bytes(b"two"))
        );
    }

    #[test]
    fn test_files_of_orders_by_path() {
        let dir = tempdir().unwrap();
        let catalog = open_catalog(dir.path());

        let mut layer = Layer::new("root");
        catalog.insert_layer(&mut layer).unwrap();
        for path in ["/z", "/a/b", "/a", "/m"] {
            catalog
                .insert_file(layer.serial, &record(layer.serial, path, b"x"))
                .unwrap();
        }

        let paths: Vec<_> = catalog
            .files_of(layer.serial)
            .unwrap()
            .into_iter()
            .map(|f| f.path)
            .collect();
        assert_eq!(paths, vec!["/a", "/a/b", "/m", "/z"]);
    }

    #[test]
    fn test_preceded_and_superseded() {
        let dir = tempdir().unwrap();
        let catalog = open_catalog(dir.path());

        let mut one = Layer::new("one");
        let mut two = Layer::new("two");
        let mut three = Layer::new("three");
        catalog.insert_layer(&mut one).unwrap();
        catalog.insert_layer(&mut two).unwrap();
        catalog.insert_layer(&mut three).unwrap();

        catalog
            .insert_file(one.serial, &record(one.serial, "/f", b"v1"))
            .unwrap();
        catalog
            .insert_file(three.serial, &record(three.serial, "/f", b"v3"))
            .unwrap();

        // from the middle layer's point of view
        let probe = record(two.serial, "/f", b"v2");
        let before = catalog.file_preceded_by(&probe).unwrap().unwrap();
        assert_eq!(before.layer, one.serial);
        let after = catalog.file_superseded_by(&probe).unwrap().unwrap();
        assert_eq!(after.layer, three.serial);

        // the newest record has no successor
        let top = record(three.serial, "/f", b"v3");
        assert!(catalog.file_superseded_by(&top).unwrap().is_none());

        // unrelated paths see nothing
        let other = record(two.serial, "/other", b"x");
        assert!(catalog.file_preceded_by(&other).unwrap().is_none());
    }

    #[test]
    fn test_newest_oldest_skip_rollback() {
        let dir = tempdir().unwrap();
        let catalog = open_catalog(dir.path());

        let mut rb = Layer::rollback();
        let mut vis = Layer::new("root");
        let mut rb2 = Layer::rollback();
        let mut vis2 = Layer::new("root2");
        for layer in [&mut rb, &mut vis, &mut rb2, &mut vis2] {
            catalog.insert_layer(layer).unwrap();
        }

        assert_eq!(catalog.newest().unwrap().unwrap().serial, vis2.serial);
        assert_eq!(catalog.oldest().unwrap().unwrap().serial, vis.serial);

        let visible = catalog.layers(false).unwrap();
        assert_eq!(visible.len(), 2);
        let all = catalog.layers(true).unwrap();
        assert_eq!(all.len(), 4);
    }

    #[test]
    fn test_superseded_layers() {
        let dir = tempdir().unwrap();
        let catalog = open_catalog(dir.path());

        let mut one = Layer::new("one");
        let mut two = Layer::new("two");
        catalog.insert_layer(&mut one).unwrap();
        catalog.insert_layer(&mut two).unwrap();

        catalog
            .insert_file(one.serial, &record(one.serial, "/a", b"1"))
            .unwrap();
        catalog
            .insert_file(one.serial, &record(one.serial, "/b", b"1"))
            .unwrap();
        catalog
            .insert_file(two.serial, &record(two.serial, "/a", b"2"))
            .unwrap();

        // only /a is shadowed, so layer one is not superseded yet
        assert!(catalog.superseded_layers().unwrap().is_empty());

        catalog
            .insert_file(two.serial, &record(two.serial, "/b", b"2"))
            .unwrap();
        let superseded = catalog.superseded_layers().unwrap();
        assert_eq!(superseded.len(), 1);
        assert_eq!(superseded[0].serial, one.serial);
    }

    #[test]
    fn test_prune_orphan_layers() {
        let dir = tempdir().unwrap();
        let catalog = open_catalog(dir.path());

        let mut empty = Layer::new("empty");
        let mut full = Layer::new("full");
        catalog.insert_layer(&mut empty).unwrap();
        catalog.insert_layer(&mut full).unwrap();
        catalog
            .insert_file(full.serial, &record(full.serial, "/f", b"x"))
            .unwrap();

        catalog.prune_orphan_layers().unwrap();

        assert!(catalog.layer_by_serial(empty.serial).unwrap().is_none());
        assert!(catalog.layer_by_serial(full.serial).unwrap().is_some());
    }

    #[test]
    fn test_inactive_layers_and_activation() {
        let dir = tempdir().unwrap();
        let catalog = open_catalog(dir.path());

        let mut layer = Layer::new("root");
        catalog.insert_layer(&mut layer).unwrap();
        assert_eq!(catalog.inactive_layers().unwrap().len(), 1);

        catalog.set_active(layer.serial, true).unwrap();
        assert!(catalog.inactive_layers().unwrap().is_empty());
        assert!(catalog.layer_by_serial(layer.serial).unwrap().unwrap().active);
    }

    #[test]
    fn test_transaction_rollback_discards_rows() {
        let dir = tempdir().unwrap();
        let catalog = open_catalog(dir.path());

        catalog.begin().unwrap();
        let mut layer = Layer::new("doomed");
        catalog.insert_layer(&mut layer).unwrap();
        catalog.rollback().unwrap();

        assert!(catalog.layer_by_serial(layer.serial).unwrap().is_none());
    }

    #[test]
    fn test_no_entry_roundtrip() {
        let dir = tempdir().unwrap();
        let catalog = open_catalog(dir.path());

        let mut layer = Layer::rollback();
        catalog.insert_layer(&mut layer).unwrap();

        let mut marker = FileRecord::no_entry("/gone");
        marker.info.insert(Info::BASE_SYSTEM);
        marker.layer = layer.serial;
        catalog.insert_file(layer.serial, &marker).unwrap();

        let files = catalog.files_of(layer.serial).unwrap();
        assert_eq!(files.len(), 1);
        assert!(files[0].kind.is_no_entry());
        assert!(files[0].info.contains(Info::BASE_SYSTEM));
        assert!(files[0].info.contains(Info::NO_ENTRY));
    }
}
