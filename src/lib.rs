//! installer-core
//!
//! The job execution and shared-state core of a distribution installer: a
//! thread-safe global store, a fail-fast job queue, an external command
//! runner, a Rhai scripting bridge and the module types built on them.

pub mod cli;
pub mod commands;
pub mod error;
pub mod installer;
pub mod job;
pub mod job_queue;
pub mod module;
pub mod modules;
pub mod process_guard;
pub mod runner;
pub mod script;
pub mod settings;
pub mod storage;
pub mod value;

// Re-export main types for convenience
pub use commands::{CommandLine, CommandList};
pub use error::{InstallerError, Result, StoreError};
pub use installer::Installer;
pub use job::{FnJob, Job, JobContext, JobList, JobResult};
pub use job_queue::{JobQueue, QueueEvent, QueueHandle, QueueOutcome};
pub use module::{create_module, Module, ModuleEnvironment, ModuleKind};
pub use process_guard::{ChildRegistry, CommandProcessGroup, TrackedChild};
pub use runner::{CommandResult, RunLocation, Runner};
pub use script::ScriptJob;
pub use settings::{InstanceEntry, Settings};
pub use storage::GlobalStore;
pub use value::{Mapping, StoredValue};
