//! Installer module
//!
//! Wires settings, global storage, modules and the job queue together for one
//! installation run.

use crate::error::{InstallerError, Result};
use crate::job_queue::{JobQueue, QueueEvent, QueueOutcome};
use crate::module::{create_module, ModuleEnvironment};
use crate::runner::ROOT_MOUNT_POINT_KEY;
use crate::settings::Settings;
use crate::storage::GlobalStore;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// Installer instance
pub struct Installer {
    settings: Settings,
    storage: Arc<GlobalStore>,
}

impl Installer {
    /// Create a new installer with an empty global store
    pub fn new(settings: Settings) -> Self {
        Self::with_storage(settings, Arc::new(GlobalStore::new()))
    }

    pub fn with_storage(settings: Settings, storage: Arc<GlobalStore>) -> Self {
        Self { settings, storage }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn storage(&self) -> &Arc<GlobalStore> {
        &self.storage
    }

    /// Preload the configured store file and publish the target root.
    pub fn prepare_storage(&self) -> Result<()> {
        if let Some(file) = &self.settings.global_storage {
            let path = self.settings.resolve(file);
            let loaded = if is_yaml(&path) {
                self.storage.load_yaml(&path)?
            } else {
                self.storage.load_json(&path)?
            };
            info!("Preloaded {} key(s) from {}", loaded, path.display());
        }
        if let Some(root) = &self.settings.root_mount_point {
            self.storage
                .insert(ROOT_MOUNT_POINT_KEY, root.display().to_string());
        }
        Ok(())
    }

    /// Instantiate and configure every module, in sequence order, and queue
    /// their jobs. Each module's jobs share that module's weight.
    pub fn build_queue(&self) -> Result<JobQueue> {
        let mut queue = JobQueue::new(Arc::clone(&self.storage));
        for entry in &self.settings.sequence {
            let kind = entry.kind()?;
            let mut env = ModuleEnvironment::new(entry.name.as_str(), self.settings.base_dir());
            env.dont_chroot = self.settings.dont_chroot;

            let mut module = create_module(kind, env);
            module.set_configuration_map(&entry.config).map_err(|e| {
                InstallerError::module(format!("{} ({}): {}", entry.name, kind, e))
            })?;

            let jobs = module.create_jobs();
            debug!("{} ({}) contributes {} job(s)", entry.name, kind, jobs.len());
            queue.enqueue_group(entry.weight(), jobs);
        }
        Ok(queue)
    }

    /// Run the whole installation, handing every queue event to `on_event`.
    pub fn run(&self, mut on_event: impl FnMut(&QueueEvent)) -> Result<QueueOutcome> {
        self.prepare_storage()?;
        let queue = self.build_queue()?;
        info!("Starting installation with {} job(s)", queue.len());

        let handle = queue.start()?;
        for event in handle.events().iter() {
            on_event(&event);
        }
        Ok(handle.wait())
    }
}

/// True for `.yaml` and `.yml` files; anything else is read as JSON.
pub fn is_yaml(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml" | "yml")
    )
}
