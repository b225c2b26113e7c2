use std::{fs, io, path::Path};

use serde::{Deserialize, Serialize};

use crate::encoding::FormatVersion;

pub const DEFAULT_MAX_DEPTH: u32 = 1000;

/// Knobs that shape an encoded file. Both travel with the builder from
/// creation to finalize.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Options {
    pub version: FormatVersion,
    // bound on nesting for the hashability check, hashing and cycle marking
    pub max_depth: u32,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            version: FormatVersion::default(),
            max_depth: DEFAULT_MAX_DEPTH,
        }
    }
}

impl Options {
    pub fn from_json(s: &str) -> anyhow::Result<Self> {
        Ok(serde_json::from_str(s)?)
    }

    pub fn to_json(&self) -> anyhow::Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Reads options from a JSON file. A missing file means defaults.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        match fs::read_to_string(path.as_ref()) {
            Ok(contents) => Self::from_json(&contents),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }
}
