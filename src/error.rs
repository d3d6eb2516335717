use std::path::PathBuf;

/// error type for depot operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("depot is locked by another process: {0}")]
    LockBusy(PathBuf),

    #[error("depot unreadable at {path}: {source}")]
    DepotUnreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("catalog corrupt: {0}")]
    CatalogCorrupt(String),

    #[error("catalog error: {0}")]
    Catalog(#[from] rusqlite::Error),

    #[error("cannot decode archive {path}: {message}")]
    ArchiveDecode { path: PathBuf, message: String },

    #[error("staging error at {path}: {source}")]
    StageIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("live tree error at {path}: {source}")]
    LiveIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{0} changed since install; refusing to overwrite")]
    Conflict(PathBuf),

    #[error("no layer matches '{0}'")]
    SelectorNotFound(String),

    #[error("{0} layer(s) left inactive by an interrupted operation; uninstall them before proceeding")]
    Inconsistent(usize),

    #[error("rollback layers cannot be uninstalled directly")]
    RollbackUninstall,

    #[error("prefix must be an absolute path: {0}")]
    BadPrefix(PathBuf),

    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

/// helpers to wrap io errors with path context
pub trait IoResultExt<T> {
    fn with_path(self, path: impl Into<PathBuf>) -> Result<T>;
    /// the error happened inside a staging or backing directory
    fn with_stage(self, path: impl Into<PathBuf>) -> Result<T>;
    /// the error happened on the live destination tree
    fn with_live(self, path: impl Into<PathBuf>) -> Result<T>;
}

impl<T> IoResultExt<T> for std::io::Result<T> {
    fn with_path(self, path: impl Into<PathBuf>) -> Result<T> {
        self.map_err(|source| Error::Io {
            path: path.into(),
            source,
        })
    }

    fn with_stage(self, path: impl Into<PathBuf>) -> Result<T> {
        self.map_err(|source| Error::StageIo {
            path: path.into(),
            source,
        })
    }

    fn with_live(self, path: impl Into<PathBuf>) -> Result<T> {
        self.map_err(|source| Error::LiveIo {
            path: path.into(),
            source,
        })
    }
}
