use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::TimeZone;
use uuid::Uuid;

/// display name of the hidden rollback twin every install creates
pub const ROLLBACK_NAME: &str = "<Rollback>";

/// layer info bit: this layer holds bytes displaced by its visible twin
pub const LAYER_ROLLBACK: u32 = 0x0001;

/// one installed layer, or its paired rollback twin
///
/// serials are assigned by the catalog in insertion order; "newer" is
/// strictly a higher serial. a rollback layer always sits at the serial
/// immediately below its visible twin and shares its active flag.
#[derive(Clone, Debug)]
pub struct Layer {
    /// catalog serial, 0 until inserted
    pub serial: i64,
    pub uuid: Uuid,
    pub name: String,
    /// unix seconds at install time
    pub installed: i64,
    /// false while an install or uninstall is mid-flight
    pub active: bool,
    pub info: u32,
}

impl Layer {
    /// fresh user-visible layer, not yet in the catalog
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            serial: 0,
            uuid: Uuid::new_v4(),
            name: name.into(),
            installed: unix_now(),
            active: false,
            info: 0,
        }
    }

    /// fresh rollback twin
    pub fn rollback() -> Self {
        let mut layer = Self::new(ROLLBACK_NAME);
        layer.info |= LAYER_ROLLBACK;
        layer
    }

    pub fn is_rollback(&self) -> bool {
        self.info & LAYER_ROLLBACK != 0
    }

    /// basename of this layer's backing store and snapshot (canonical
    /// uppercase uuid, as the catalog stores it)
    pub fn store_name(&self) -> String {
        self.uuid.to_string().to_uppercase()
    }

    /// install timestamp rendered in local time for listings
    pub fn installed_local(&self) -> String {
        match chrono::Local.timestamp_opt(self.installed, 0) {
            chrono::LocalResult::Single(dt) => dt.format("%Y-%m-%d %H:%M:%S").to_string(),
            _ => self.installed.to_string(),
        }
    }
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// how layers are named on the command line
///
/// tried in order: canonical uuid, decimal serial, keyword, bare name
/// (newest layer with that name wins).
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Selector {
    Uuid(Uuid),
    Serial(i64),
    Name(String),
    Newest,
    Oldest,
    Superseded,
    All,
}

impl FromStr for Selector {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Ok(uuid) = Uuid::parse_str(s) {
            return Ok(Selector::Uuid(uuid));
        }
        if let Ok(serial) = s.parse::<i64>() {
            if serial > 0 {
                return Ok(Selector::Serial(serial));
            }
        }
        Ok(match s.to_ascii_lowercase().as_str() {
            "newest" => Selector::Newest,
            "oldest" => Selector::Oldest,
            "superseded" => Selector::Superseded,
            "all" => Selector::All,
            _ => Selector::Name(s.to_string()),
        })
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Selector::Uuid(uuid) => write!(f, "{}", uuid.to_string().to_uppercase()),
            Selector::Serial(serial) => write!(f, "{}", serial),
            Selector::Name(name) => write!(f, "{}", name),
            Selector::Newest => write!(f, "newest"),
            Selector::Oldest => write!(f, "oldest"),
            Selector::Superseded => write!(f, "superseded"),
            Selector::All => write!(f, "all"),
        }
    }
}
