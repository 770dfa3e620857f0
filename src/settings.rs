//! Settings file: which modules run, in what order, with what configuration
//!
//! ```yaml
//! dont-chroot: false
//! root-mount-point: /mnt/target
//! global-storage: preset.yaml
//! sequence:
//!   - name: prepare
//!     module: shellprocess
//!     weight: 2
//!     config:
//!       script: ["mkdir -p ${ROOT}/etc"]
//! ```
//!
//! Relative paths resolve against the settings file's directory.

use crate::module::ModuleKind;
use crate::value::{Mapping, StoredValue};
use anyhow::{bail, Context, Result};
use indexmap::IndexMap;
use serde::Deserialize;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Settings {
    #[serde(default)]
    pub dont_chroot: bool,

    /// Published to global storage as `rootMountPoint`.
    #[serde(default)]
    pub root_mount_point: Option<PathBuf>,

    /// JSON or YAML file preloaded into global storage (chosen by extension).
    #[serde(default)]
    pub global_storage: Option<PathBuf>,

    #[serde(default)]
    pub sequence: Vec<InstanceEntry>,

    #[serde(flatten)]
    unknown: IndexMap<String, StoredValue>,

    #[serde(skip)]
    base_dir: PathBuf,
}

/// One module instance in the sequence.
#[derive(Debug, Clone, Deserialize)]
pub struct InstanceEntry {
    pub name: String,
    pub module: String,
    /// Share of overall progress; defaults to 1.
    #[serde(default)]
    pub weight: Option<f64>,
    #[serde(default, deserialize_with = "mapping_with_scalar_keys")]
    pub config: Mapping,
}

/// Accept `true:` or `1:` style keys, as contextual process values use them.
fn mapping_with_scalar_keys<'de, D: serde::Deserializer<'de>>(
    deserializer: D,
) -> std::result::Result<Mapping, D::Error> {
    match StoredValue::deserialize(deserializer)? {
        StoredValue::Mapping(map) => Ok(map),
        StoredValue::Null => Ok(Mapping::new()),
        other => Err(serde::de::Error::custom(format!(
            "module config must be a mapping, found a {}",
            other.type_name()
        ))),
    }
}

impl InstanceEntry {
    pub fn kind(&self) -> crate::Result<ModuleKind> {
        ModuleKind::parse(&self.module)
    }

    pub fn weight(&self) -> f64 {
        self.weight.unwrap_or(1.0)
    }
}

impl Settings {
    /// Load settings from a YAML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read settings from {:?}", path))?;
        let base_dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        Self::from_yaml_str(&content, base_dir)
            .with_context(|| format!("Failed to load settings from {:?}", path))
    }

    /// Parse settings; relative paths will resolve against `base_dir`.
    pub fn from_yaml_str(content: &str, base_dir: impl Into<PathBuf>) -> Result<Self> {
        let mut settings: Self =
            serde_yaml::from_str(content).context("Failed to parse settings YAML")?;
        settings.base_dir = base_dir.into();
        for key in settings.unknown.keys() {
            warn!("Ignoring unknown settings key '{}'", key);
        }
        Ok(settings)
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// `path` as-is if absolute, else relative to the settings directory.
    pub fn resolve(&self, path: &Path) -> PathBuf {
        self.base_dir.join(path)
    }

    /// Validate the settings
    pub fn validate(&self) -> Result<()> {
        if self.sequence.is_empty() {
            bail!("The sequence must contain at least one module instance");
        }

        let mut seen = HashSet::new();
        for entry in &self.sequence {
            if entry.name.trim().is_empty() {
                bail!("Every sequence entry needs a name (module '{}')", entry.module);
            }
            if !seen.insert(entry.name.as_str()) {
                bail!("Instance name '{}' is used more than once", entry.name);
            }
            entry
                .kind()
                .with_context(|| format!("Invalid sequence entry '{}'", entry.name))?;
            if let Some(weight) = entry.weight {
                if !weight.is_finite() || weight <= 0.0 {
                    bail!(
                        "Instance '{}' has weight {}; weights must be positive",
                        entry.name,
                        weight
                    );
                }
            }
        }

        if let Some(root) = &self.root_mount_point {
            if !root.is_absolute() {
                bail!("root-mount-point must be an absolute path, got {:?}", root);
            }
        }
        Ok(())
    }
}
