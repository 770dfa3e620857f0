//! `script`: a job written in Rhai
//!
//! ```yaml
//! script: bootloader.rhai   # relative to the settings file
//! name: "Install bootloader"
//! dontChroot: false
//! # every other key is visible to the script as job.configuration
//! efiDirectory: /boot/efi
//! ```

use super::configured_name;
use crate::error::{InstallerError, Result};
use crate::job::JobList;
use crate::module::{Module, ModuleEnvironment, ModuleKind};
use crate::script::ScriptJob;
use crate::value::{get_bool, Mapping, StoredValue};
use std::path::PathBuf;
use tracing::warn;

pub struct ScriptModule {
    env: ModuleEnvironment,
    script: Option<PathBuf>,
    name: Option<String>,
    dont_chroot: bool,
    configuration: Mapping,
}

impl ScriptModule {
    pub fn new(env: ModuleEnvironment) -> Self {
        Self {
            env,
            script: None,
            name: None,
            dont_chroot: false,
            configuration: Mapping::new(),
        }
    }
}

impl Module for ScriptModule {
    fn instance_name(&self) -> &str {
        &self.env.instance
    }

    fn kind(&self) -> ModuleKind {
        ModuleKind::Script
    }

    fn set_configuration_map(&mut self, config: &Mapping) -> Result<()> {
        let script = config
            .get("script")
            .and_then(StoredValue::as_str)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| {
                InstallerError::config(format!(
                    "{}: 'script' must name a script file",
                    self.env.instance
                ))
            })?;

        let path = self.env.base_dir.join(script);
        if !path.is_file() {
            warn!("{}: script {} does not exist (yet)", self.env.instance, path.display());
        }

        self.script = Some(path);
        self.name = configured_name(config);
        self.dont_chroot = get_bool(config, "dontChroot", false);
        self.configuration = config.clone();
        Ok(())
    }

    fn create_jobs(&self) -> JobList {
        let Some(script) = &self.script else {
            return Vec::new();
        };
        let mut job = ScriptJob::new(script, self.env.instance.as_str())
            .with_configuration(self.configuration.clone())
            .with_target_location(self.env.target_location(self.dont_chroot));
        if let Some(name) = &self.name {
            job = job.with_pretty_name(name.as_str());
        }
        vec![Box::new(job)]
    }
}
