//! Tube ↔ extruder mapping store
//!
//! The cabinet administers which extruder each of its two tubes feeds; this
//! store is the printer-side authority for that assignment. The in-memory
//! copy is the runtime source of truth, the YAML configuration file the
//! persistent one, and both must agree after every accepted mutation. Only
//! the `extruders.mapping` subtree of the file is rewritten; every other key
//! round-trips untouched.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use thiserror::Error;
use tracing::{info, warn};

use crate::config::Config;

#[derive(Error, Debug)]
pub enum MappingError {
    #[error("mapping out of range: left={left}, right={right}")]
    OutOfRange { left: u8, right: u8 },

    #[error("failed to persist mapping: {0}")]
    Persist(#[from] std::io::Error),

    #[error("failed to rewrite config YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("config file is malformed: {0}")]
    Malformed(&'static str),

    #[error("no config file path, mapping cannot be persisted")]
    NoPath,
}

/// Which extruder each tube feeds (`left` is tube 0, `right` tube 1)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TubeMapping {
    pub left: u8,
    pub right: u8,
}

impl Default for TubeMapping {
    fn default() -> Self {
        Self { left: 0, right: 1 }
    }
}

impl TubeMapping {
    pub fn new(left: u8, right: u8) -> Result<Self, MappingError> {
        if left < 2 && right < 2 && left != right {
            Ok(Self { left, right })
        } else {
            Err(MappingError::OutOfRange { left, right })
        }
    }

    /// Tube that feeds `extruder`
    pub fn tube_for_extruder(&self, extruder: u8) -> Option<u8> {
        if self.left == extruder {
            Some(0)
        } else if self.right == extruder {
            Some(1)
        } else {
            None
        }
    }

    /// Extruder fed by `tube`
    pub fn extruder_for_tube(&self, tube: u8) -> Option<u8> {
        match tube {
            0 => Some(self.left),
            1 => Some(self.right),
            _ => None,
        }
    }

    /// Build from the config-file form (`extruder index → tube index`)
    pub fn from_extruder_map(map: &BTreeMap<u8, u8>) -> Self {
        let mut mapping = TubeMapping::default();
        for (&extruder, &tube) in map {
            match tube {
                0 => mapping.left = extruder,
                1 => mapping.right = extruder,
                _ => {}
            }
        }
        mapping
    }

    /// Config-file form (`extruder index → tube index`)
    pub fn to_extruder_map(&self) -> BTreeMap<u8, u8> {
        BTreeMap::from([(self.left, 0), (self.right, 1)])
    }
}

impl std::fmt::Display for TubeMapping {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "left_tube→extruder{}, right_tube→extruder{}",
            self.left, self.right
        )
    }
}

/// Mapping store: single writer, snapshot readers.
pub struct MappingStore {
    current: Mutex<TubeMapping>,
    config_path: Option<PathBuf>,
}

impl MappingStore {
    pub fn new(mapping: TubeMapping, config_path: Option<PathBuf>) -> Self {
        Self {
            current: Mutex::new(mapping),
            config_path,
        }
    }

    pub fn from_config(config: &Config, config_path: Option<PathBuf>) -> Self {
        Self::new(
            TubeMapping::from_extruder_map(&config.extruders.mapping),
            config_path,
        )
    }

    /// Cheap snapshot of the current mapping
    pub fn get(&self) -> TubeMapping {
        *self.current.lock().expect("mapping lock poisoned")
    }

    /// Apply a `SET_FEEDER_MAPPING` from the cabinet: validate, update the
    /// in-memory copy, persist. On persistence failure the in-memory copy is
    /// rolled back so memory and disk never diverge.
    pub fn set_from_remote(&self, left: u8, right: u8) -> Result<TubeMapping, MappingError> {
        let mapping = TubeMapping::new(left, right)?;

        let previous = {
            let mut current = self.current.lock().expect("mapping lock poisoned");
            let previous = *current;
            *current = mapping;
            previous
        };

        if let Err(err) = self.persist(mapping) {
            warn!(error = %err, "mapping persistence failed, rolling back");
            *self.current.lock().expect("mapping lock poisoned") = previous;
            return Err(err);
        }

        info!(%mapping, "feeder mapping updated from cabinet");
        Ok(mapping)
    }

    /// Rewrite `extruders.mapping` in the config file, leaving every other
    /// key untouched. The file is replaced atomically (temp file + rename).
    fn persist(&self, mapping: TubeMapping) -> Result<(), MappingError> {
        let path = self.config_path.as_deref().ok_or(MappingError::NoPath)?;

        let mut doc: serde_yaml::Value = match std::fs::read_to_string(path) {
            Ok(content) => serde_yaml::from_str(&content)?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                serde_yaml::Value::Mapping(serde_yaml::Mapping::new())
            }
            Err(err) => return Err(err.into()),
        };

        let root = doc
            .as_mapping_mut()
            .ok_or(MappingError::Malformed("config root is not a mapping"))?;
        let extruders = root
            .entry("extruders".into())
            .or_insert_with(|| serde_yaml::Value::Mapping(serde_yaml::Mapping::new()));
        let extruders = extruders
            .as_mapping_mut()
            .ok_or(MappingError::Malformed("extruders is not a mapping"))?;

        let mut map = serde_yaml::Mapping::new();
        for (extruder, tube) in mapping.to_extruder_map() {
            map.insert(
                serde_yaml::Value::Number(extruder.into()),
                serde_yaml::Value::Number(tube.into()),
            );
        }
        extruders.insert("mapping".into(), serde_yaml::Value::Mapping(map));

        write_atomically(path, &serde_yaml::to_string(&doc)?)?;
        Ok(())
    }
}

fn write_atomically(path: &Path, content: &str) -> std::io::Result<()> {
    let tmp = path.with_extension("yaml.tmp");
    std::fs::write(&tmp, content)?;
    std::fs::rename(&tmp, path)
}
