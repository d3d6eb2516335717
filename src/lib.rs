//! rootup - root overlay installer
//!
//! applies tarball-style archives ("roots") on top of a destination tree,
//! recording everything it displaces so a later uninstall restores the tree
//! bit-for-bit. installs stack: a newer root shadows an older one, and
//! uninstalling any layer brings back the nearest surviving predecessor of
//! each path, or deletes the path when the predecessor is a no-entry marker.
//!
//! # Core pieces
//!
//! - **Catalog**: sqlite store of layers and file records, the source of
//!   truth for what the depot has done to the tree
//! - **Three-way diff**: staged file vs live file vs catalog predecessor,
//!   deciding per path what to install and what to save
//! - **Rollback twin**: every install is paired with a hidden layer holding
//!   the displaced bytes; it lives exactly as long as its visible sibling
//!
//! # Example
//!
//! ```no_run
//! use std::path::Path;
//! use rootup::{Config, Depot};
//!
//! let config = Config::new("/opt/dest").unwrap();
//! let mut depot = Depot::open(config).unwrap();
//! let layer = depot.install(Path::new("root.tar.gz")).unwrap();
//! depot.uninstall(&layer).unwrap();
//! ```

mod catalog;
mod config;
mod depot;
mod digest;
mod error;
mod extract;
mod fsutil;
mod layer;
mod record;

pub use catalog::Catalog;
pub use config::Config;
pub use depot::Depot;
pub use digest::Digest;
pub use error::{Error, Result};
pub use layer::{Layer, Selector};
pub use record::{Diff, FileRecord, Info, RecordKind};
