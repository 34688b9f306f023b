//! Folder placement and custom metadata

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::controller::VirtualMachineHandle;
use crate::error::PlatformError;
use crate::locator::InventoryLocator;
use crate::models::Metadata;
use crate::platform::{wait_for_task, ConfigSpec, ObjectKind, ObjectRef, Platform, PollSettings};
use crate::{Error, Result};

/// A folder path managed as its own resource.
///
/// Remembers which leading part of the path existed before creation so that
/// destroying it only removes what it created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FolderHandle {
    pub datacenter: String,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub existing_path: Option<String>,
}

impl FolderHandle {
    fn created_depth(&self) -> (usize, usize) {
        let total = segments(&self.path).count();
        let existing = self.existing_path.as_deref().map_or(0, |p| segments(p).count());
        (existing, total)
    }
}

fn segments(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|s| !s.is_empty())
}

pub struct PlacementManager {
    platform: Arc<dyn Platform>,
    locator: InventoryLocator,
    task: PollSettings,
}

impl PlacementManager {
    pub fn new(platform: Arc<dyn Platform>, task: PollSettings) -> Self {
        Self {
            locator: InventoryLocator::new(platform.clone()),
            platform,
            task,
        }
    }

    /// Make sure the folder chain `path` exists below the datacenter's VM
    /// folder and return its innermost folder.
    ///
    /// Losing a creation race to another client counts as success.
    pub fn ensure_folder(&self, datacenter: &ObjectRef, path: &str) -> Result<ObjectRef> {
        let mut current = self
            .platform
            .vm_folder(datacenter)
            .map_err(|e| Error::PlacementFailed(e.to_string()))?;

        for segment in segments(path) {
            current = match self.child_folder(&current, segment)? {
                Some(folder) => folder,
                None => match self.platform.create_folder(&current, segment) {
                    Ok(folder) => {
                        tracing::info!(folder = %path, created = %segment, "Created folder");
                        folder
                    }
                    Err(PlatformError::AlreadyExists(_)) => {
                        tracing::warn!(folder = %path, segment, "Folder appeared concurrently");
                        self.child_folder(&current, segment)?.ok_or_else(|| {
                            Error::PlacementFailed(format!(
                                "folder '{}' reported as existing but cannot be found",
                                segment
                            ))
                        })?
                    }
                    Err(err) => {
                        tracing::error!(folder = %path, segment, error = %err, "Folder creation failed");
                        return Err(Error::PlacementFailed(err.to_string()));
                    }
                },
            };
        }
        Ok(current)
    }

    fn child_folder(&self, parent: &ObjectRef, name: &str) -> Result<Option<ObjectRef>> {
        match self.platform.find_child(parent, name) {
            Ok(Some(child)) if child.kind == ObjectKind::Folder => Ok(Some(child)),
            Ok(Some(child)) => Err(Error::PlacementFailed(format!(
                "'{}' exists but is a {}",
                name, child.kind
            ))),
            Ok(None) => Ok(None),
            Err(err) => Err(Error::PlacementFailed(err.to_string())),
        }
    }

    /// Write metadata as extra configuration on the handle's virtual machine.
    ///
    /// Values are stored as strings.
    pub fn apply_metadata(&self, handle: &VirtualMachineHandle, metadata: &Metadata) -> Result<()> {
        let vm = self.locator.locate(handle)?.ok_or_else(|| Error::NotFound {
            kind: ObjectKind::VirtualMachine,
            path: handle.to_string(),
        })?;
        let mut spec = ConfigSpec::default();
        for (key, value) in metadata {
            spec.extra_config.insert(key.clone(), value.to_extra_config());
        }
        self.write_extra_config(&vm, spec)
    }

    /// Remove extra configuration keys no longer declared
    pub fn remove_metadata(&self, vm: &ObjectRef, keys: &[String]) -> Result<()> {
        let mut spec = ConfigSpec::default();
        for key in keys {
            spec.extra_config.insert(key.clone(), String::new());
        }
        self.write_extra_config(vm, spec)
    }

    fn write_extra_config(&self, vm: &ObjectRef, spec: ConfigSpec) -> Result<()> {
        if spec.is_empty() {
            return Ok(());
        }
        tracing::debug!(vm = %vm.name, keys = spec.extra_config.len(), "Writing extra configuration");
        let task = self.platform.reconfigure_vm(vm, &spec)?;
        wait_for_task(self.platform.as_ref(), &task, "write extra configuration", self.task)?;
        Ok(())
    }

    /// Create a folder path as a standalone resource
    pub fn create_folder_resource(&self, datacenter: Option<&str>, path: &str) -> Result<FolderHandle> {
        let dc = self.locator.datacenter(datacenter)?;
        let path = path.trim_matches('/');
        if path.is_empty() {
            return Err(Error::Config("folder path cannot be empty".into()));
        }

        let mut existing = Vec::new();
        let mut current = self.platform.vm_folder(&dc)?;
        for segment in segments(path) {
            match self.child_folder(&current, segment)? {
                Some(folder) => {
                    existing.push(segment);
                    current = folder;
                }
                None => break,
            }
        }

        self.ensure_folder(&dc, path)?;
        Ok(FolderHandle {
            datacenter: dc.name,
            path: path.to_string(),
            existing_path: (!existing.is_empty()).then(|| existing.join("/")),
        })
    }

    /// Remove the folders a [`FolderHandle`] created, innermost first.
    ///
    /// Stops at the first folder that still has children. Folders that are
    /// already gone count as removed.
    pub fn destroy_folder_resource(&self, handle: &FolderHandle) -> Result<()> {
        let dc = match self.locator.datacenter(Some(handle.datacenter.as_str())) {
            Ok(dc) => dc,
            Err(Error::NotFound { .. }) => return Ok(()),
            Err(other) => return Err(other),
        };
        let all: Vec<&str> = segments(&handle.path).collect();
        let (existing, total) = handle.created_depth();

        for depth in (existing + 1..=total).rev() {
            let path = all[..depth].join("/");
            let folder = match self.locator.folder(&dc, Some(path.as_str())) {
                Ok(folder) => folder,
                Err(Error::NotFound { .. }) => continue,
                Err(other) => return Err(other),
            };
            if !self.platform.folder_children(&folder)?.is_empty() {
                tracing::warn!(folder = %path, "Folder not empty, leaving it in place");
                return Ok(());
            }
            match self.platform.destroy_folder(&folder) {
                Ok(()) | Err(PlatformError::NotFound(_)) => {
                    tracing::info!(folder = %path, "Removed folder");
                }
                Err(err) => return Err(Error::PlacementFailed(err.to_string())),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::memory::{DatacenterSeed, InventorySeed, Operation};
    use crate::platform::{InMemoryPlatform, MockPlatform};
    use std::time::Duration;

    fn fast() -> PollSettings {
        PollSettings::new(Duration::from_millis(100), Duration::from_millis(1))
    }

    fn setup() -> (Arc<InMemoryPlatform>, PlacementManager, ObjectRef) {
        let seed = InventorySeed::default()
            .datacenter(DatacenterSeed::new("dc1").datastore("ds1").folder("shared"));
        let platform = Arc::new(InMemoryPlatform::from_seed(&seed));
        let manager = PlacementManager::new(platform.clone(), fast());
        let dc = platform.find_datacenters("dc1").unwrap().remove(0);
        (platform, manager, dc)
    }

    #[test]
    fn test_ensure_folder_idempotent() {
        let (platform, manager, dc) = setup();
        let first = manager.ensure_folder(&dc, "team/app").unwrap();
        let count = platform.folder_count();
        let second = manager.ensure_folder(&dc, "/team/app/").unwrap();

        assert_eq!(first, second);
        assert_eq!(platform.folder_count(), count);
        assert!(platform.folder_exists("dc1", "team/app"));
    }

    #[test]
    fn test_ensure_folder_tolerates_race() {
        let (platform, manager, dc) = setup();
        platform.race_next_folder_creation();

        let folder = manager.ensure_folder(&dc, "raced").unwrap();
        assert_eq!(folder.name, "raced");
        assert!(platform.folder_exists("dc1", "raced"));
    }

    #[test]
    fn test_ensure_folder_failure() {
        let (platform, manager, dc) = setup();
        platform.fail_next(Operation::CreateFolder, PlatformError::Fault("permission denied".into()));

        assert!(matches!(
            manager.ensure_folder(&dc, "team"),
            Err(Error::PlacementFailed(ref m)) if m.contains("permission denied")
        ));
    }

    #[test]
    fn test_folder_resource_removes_only_what_it_created() {
        let (platform, manager, _) = setup();
        let handle = manager.create_folder_resource(Some("dc1"), "shared/team/app").unwrap();
        assert_eq!(handle.existing_path.as_deref(), Some("shared"));

        manager.destroy_folder_resource(&handle).unwrap();
        assert!(!platform.folder_exists("dc1", "shared/team"));
        assert!(platform.folder_exists("dc1", "shared"));

        // second destroy finds nothing to do
        manager.destroy_folder_resource(&handle).unwrap();
    }

    #[test]
    fn test_folder_resource_keeps_non_empty() {
        let (platform, manager, dc) = setup();
        let handle = manager.create_folder_resource(None, "team").unwrap();
        manager.ensure_folder(&dc, "team/other").unwrap();

        manager.destroy_folder_resource(&handle).unwrap();
        assert!(platform.folder_exists("dc1", "team"));
    }

    #[test]
    fn test_remove_metadata_noop_without_keys() {
        let mut platform = MockPlatform::new();
        platform.expect_reconfigure_vm().never();
        let manager = PlacementManager::new(Arc::new(platform), fast());
        let vm = ObjectRef::new(ObjectKind::VirtualMachine, "vm-1", "web");
        manager.remove_metadata(&vm, &[]).unwrap();
    }
}
