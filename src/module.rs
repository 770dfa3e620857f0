//! Module contract
//!
//! A module is a configurable producer of jobs. The orchestrator creates one
//! instance per `sequence` entry of the settings file, hands it that entry's
//! configuration map, then asks it for its jobs.
//!
//! # Contract
//!
//! - `set_configuration_map()` is called exactly once, before `create_jobs()`.
//! - Unknown configuration keys are logged and ignored, never fatal.
//! - `create_jobs()` may be called more than once and returns fresh jobs.

use crate::error::{InstallerError, Result};
use crate::job::JobList;
use crate::modules::{ContextualProcessModule, ScriptModule, ShellProcessModule};
use crate::runner::RunLocation;
use crate::value::Mapping;
use std::path::PathBuf;
use std::str::FromStr;
use strum::{Display, EnumIter, EnumString, IntoEnumIterator};

pub trait Module: Send {
    /// Instance name from the settings file.
    fn instance_name(&self) -> &str;

    fn kind(&self) -> ModuleKind;

    fn set_configuration_map(&mut self, config: &Mapping) -> Result<()>;

    fn create_jobs(&self) -> JobList;
}

/// Built-in module types, named as in the settings file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, EnumIter)]
#[strum(serialize_all = "lowercase")]
pub enum ModuleKind {
    /// Fixed list of shell commands.
    ShellProcess,
    /// Shell commands chosen by the value of a global storage key.
    ContextualProcess,
    /// Rhai script.
    Script,
}

impl ModuleKind {
    pub fn parse(name: &str) -> Result<Self> {
        Self::from_str(name).map_err(|_| {
            let known: Vec<String> = Self::iter().map(|k| k.to_string()).collect();
            InstallerError::module(format!(
                "unknown module type '{}' (expected one of: {})",
                name,
                known.join(", ")
            ))
        })
    }
}

/// Installation-wide facts a module instance is created with.
#[derive(Debug, Clone)]
pub struct ModuleEnvironment {
    pub instance: String,
    /// Directory relative paths in the configuration resolve against.
    pub base_dir: PathBuf,
    /// Run "target" commands on the host instead of chrooting.
    pub dont_chroot: bool,
}

impl ModuleEnvironment {
    pub fn new(instance: impl Into<String>, base_dir: impl Into<PathBuf>) -> Self {
        Self {
            instance: instance.into(),
            base_dir: base_dir.into(),
            dont_chroot: false,
        }
    }

    /// Where target commands run, given a module's own `dontChroot` flag.
    pub fn target_location(&self, module_dont_chroot: bool) -> RunLocation {
        if self.dont_chroot || module_dont_chroot {
            RunLocation::Host
        } else {
            RunLocation::Target
        }
    }
}

/// Create an unconfigured module of `kind`.
pub fn create_module(kind: ModuleKind, env: ModuleEnvironment) -> Box<dyn Module> {
    match kind {
        ModuleKind::ShellProcess => Box::new(ShellProcessModule::new(env)),
        ModuleKind::ContextualProcess => Box::new(ContextualProcessModule::new(env)),
        ModuleKind::Script => Box::new(ScriptModule::new(env)),
    }
}
