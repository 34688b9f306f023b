//! Inventory path resolution
//!
//! Turns human-readable paths into [`ObjectRef`]s. Every lookup goes to the
//! platform; nothing is cached between calls since the remote inventory can
//! change underneath us.

use std::sync::Arc;

use crate::controller::VirtualMachineHandle;
use crate::models::SnapshotRef;
use crate::platform::{ObjectKind, ObjectRef, Platform, VmProperties};
use crate::{Error, Result};

/// Read-only resolver over a platform client
#[derive(Clone)]
pub struct InventoryLocator {
    platform: Arc<dyn Platform>,
}

impl InventoryLocator {
    pub fn new(platform: Arc<dyn Platform>) -> Self {
        Self { platform }
    }

    pub fn platform(&self) -> &dyn Platform {
        self.platform.as_ref()
    }

    /// Resolve a datacenter; `None` requires the inventory to hold exactly one
    pub fn datacenter(&self, path: Option<&str>) -> Result<ObjectRef> {
        let path = path.unwrap_or("*");
        let found = self
            .platform
            .find_datacenters(path)
            .map_err(|e| Error::lookup(ObjectKind::Datacenter, path, e))?;
        unique(ObjectKind::Datacenter, path, found)
    }

    /// Resolve any object kind by path within a datacenter
    pub fn resolve(&self, datacenter: &ObjectRef, kind: ObjectKind, path: &str) -> Result<ObjectRef> {
        tracing::debug!(datacenter = %datacenter.name, %kind, path, "Resolving inventory path");
        let found = self
            .platform
            .find(datacenter, kind, path)
            .map_err(|e| Error::lookup(kind, path, e))?;
        unique(kind, path, found)
    }

    /// Resolve the resource pool for a cluster/pool pair.
    ///
    /// A cluster alone means its root pool; neither means the datacenter's
    /// only root pool.
    pub fn resource_pool(
        &self,
        datacenter: &ObjectRef,
        cluster: Option<&str>,
        pool: Option<&str>,
    ) -> Result<ObjectRef> {
        let path = match (cluster, pool) {
            (Some(cluster), Some(pool)) => format!("{}/Resources/{}", cluster, pool.trim_matches('/')),
            (Some(cluster), None) => format!("{}/Resources", cluster),
            (None, Some(pool)) => pool.trim_matches('/').to_string(),
            (None, None) => "*/Resources".to_string(),
        };
        if let Some(cluster) = cluster {
            self.resolve(datacenter, ObjectKind::Cluster, cluster)?;
        }
        self.resolve(datacenter, ObjectKind::ResourcePool, &path)
    }

    /// Resolve a datastore; `None` requires the datacenter to hold exactly one
    pub fn datastore(&self, datacenter: &ObjectRef, name: Option<&str>) -> Result<ObjectRef> {
        self.resolve(datacenter, ObjectKind::Datastore, name.unwrap_or("*"))
    }

    /// Resolve the port group a network interface attaches to
    pub fn network(&self, datacenter: &ObjectRef, label: &str) -> Result<ObjectRef> {
        self.resolve(datacenter, ObjectKind::Network, label)
    }

    /// Resolve a template by inventory path. Plain virtual machines never match.
    pub fn template(&self, datacenter: &ObjectRef, label: &str) -> Result<ObjectRef> {
        self.resolve(datacenter, ObjectKind::Template, label)
    }

    /// Resolve a folder below the VM root; `None` is the root itself
    pub fn folder(&self, datacenter: &ObjectRef, path: Option<&str>) -> Result<ObjectRef> {
        match path.map(|p| p.trim_matches('/')).filter(|p| !p.is_empty()) {
            Some(path) => self.resolve(datacenter, ObjectKind::Folder, path),
            None => self
                .platform
                .vm_folder(datacenter)
                .map_err(|e| Error::lookup(ObjectKind::Folder, "/", e)),
        }
    }

    /// Resolve a template snapshot by name, or the template's current one
    pub fn snapshot(&self, template: &ObjectRef, snapshot: &SnapshotRef) -> Result<ObjectRef> {
        match snapshot {
            SnapshotRef::Current => {
                let path = format!("{}/current", template.name);
                self.platform
                    .current_snapshot(template)
                    .map_err(|e| Error::lookup(ObjectKind::Snapshot, &path, e))?
                    .ok_or(Error::NotFound {
                        kind: ObjectKind::Snapshot,
                        path,
                    })
            }
            SnapshotRef::Named(name) => {
                let path = format!("{}/{}", template.name, name);
                let found = self
                    .platform
                    .snapshots(template)
                    .map_err(|e| Error::lookup(ObjectKind::Snapshot, &path, e))?
                    .into_iter()
                    .filter(|s| &s.name == name)
                    .collect();
                unique(ObjectKind::Snapshot, &path, found)
            }
        }
    }

    /// Search a single folder for a virtual machine by name
    pub fn find_vm(&self, folder: &ObjectRef, name: &str) -> Result<Option<ObjectRef>> {
        let child = self
            .platform
            .find_child(folder, name)
            .map_err(|e| Error::lookup(ObjectKind::Folder, &folder.name, e))?;
        Ok(child.filter(|c| c.kind == ObjectKind::VirtualMachine))
    }

    /// Locate the virtual machine behind a handle.
    ///
    /// A missing datacenter, folder or machine all mean the same thing here:
    /// there is nothing to act on.
    pub fn locate(&self, handle: &VirtualMachineHandle) -> Result<Option<ObjectRef>> {
        let datacenter = match self.datacenter(Some(handle.datacenter.as_str())) {
            Ok(dc) => dc,
            Err(Error::NotFound { .. }) => return Ok(None),
            Err(other) => return Err(other),
        };
        let folder = match self.folder(&datacenter, handle.folder.as_deref()) {
            Ok(folder) => folder,
            Err(Error::NotFound { .. }) => return Ok(None),
            Err(other) => return Err(other),
        };
        match self.find_vm(&folder, &handle.name) {
            Err(Error::NotFound { .. }) => Ok(None),
            found => found,
        }
    }

    pub fn properties(&self, vm: &ObjectRef) -> Result<VmProperties> {
        self.platform
            .vm_properties(vm)
            .map_err(|e| Error::lookup(ObjectKind::VirtualMachine, &vm.name, e))
    }
}

fn unique(kind: ObjectKind, path: &str, mut found: Vec<ObjectRef>) -> Result<ObjectRef> {
    match found.len() {
        0 => Err(Error::NotFound {
            kind,
            path: path.to_string(),
        }),
        1 => Ok(found.remove(0)),
        count => Err(Error::Ambiguous {
            kind,
            path: path.to_string(),
            count,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PlatformError;
    use crate::platform::memory::{DatacenterSeed, InventorySeed, TemplateSeed};
    use crate::platform::{InMemoryPlatform, MockPlatform, PlatformResult};

    fn locator() -> InventoryLocator {
        let seed = InventorySeed::default().datacenter(
            DatacenterSeed::new("dc1")
                .cluster("cluster1", &["pool1"])
                .cluster("cluster2", &[])
                .datastore("ds1")
                .datastore("ds2")
                .network("LAN")
                .folder("team/app")
                .template(TemplateSeed::new("tmpl").snapshot("snap1"))
                .template(TemplateSeed::new("bare")),
        );
        InventoryLocator::new(Arc::new(InMemoryPlatform::from_seed(&seed)))
    }

    #[test]
    fn test_resolve_each_kind() {
        let locator = locator();
        let dc = locator.datacenter(None).unwrap();
        assert_eq!(dc.name, "dc1");

        assert_eq!(locator.datastore(&dc, Some("ds2")).unwrap().name, "ds2");
        assert_eq!(locator.network(&dc, "LAN").unwrap().kind, ObjectKind::Network);
        assert_eq!(locator.folder(&dc, Some("/team/app/")).unwrap().name, "app");
        assert_eq!(locator.folder(&dc, None).unwrap().name, "vm");
        assert_eq!(
            locator.resource_pool(&dc, Some("cluster1"), Some("pool1")).unwrap().name,
            "pool1"
        );
        assert_eq!(
            locator.resource_pool(&dc, Some("cluster2"), None).unwrap().name,
            "Resources"
        );
    }

    #[test]
    fn test_missing_and_ambiguous() {
        let locator = locator();
        let dc = locator.datacenter(Some("dc1")).unwrap();

        assert!(matches!(
            locator.network(&dc, "WAN"),
            Err(Error::NotFound { kind: ObjectKind::Network, .. })
        ));
        assert!(matches!(
            locator.datastore(&dc, None),
            Err(Error::Ambiguous { kind: ObjectKind::Datastore, count: 2, .. })
        ));
        assert!(matches!(
            locator.resource_pool(&dc, None, None),
            Err(Error::Ambiguous { count: 2, .. })
        ));
        assert!(matches!(
            locator.resource_pool(&dc, Some("cluster9"), None),
            Err(Error::NotFound { kind: ObjectKind::Cluster, .. })
        ));
        assert!(matches!(
            locator.datacenter(Some("dc9")),
            Err(Error::NotFound { kind: ObjectKind::Datacenter, .. })
        ));
    }

    #[test]
    fn test_snapshot_lookup() {
        let locator = locator();
        let dc = locator.datacenter(None).unwrap();
        let tmpl = locator.template(&dc, "tmpl").unwrap();

        assert_eq!(
            locator.snapshot(&tmpl, &SnapshotRef::Named("snap1".into())).unwrap().name,
            "snap1"
        );
        assert_eq!(locator.snapshot(&tmpl, &SnapshotRef::Current).unwrap().name, "snap1");
        assert!(locator.snapshot(&tmpl, &SnapshotRef::Named("snap9".into())).is_err());

        let bare = locator.template(&dc, "bare").unwrap();
        assert!(matches!(
            locator.snapshot(&bare, &SnapshotRef::Current),
            Err(Error::NotFound { kind: ObjectKind::Snapshot, .. })
        ));
    }

    #[test]
    fn test_lookups_never_mutate() {
        let mut platform = MockPlatform::new();
        platform
            .expect_find_datacenters()
            .returning(|_| Ok(vec![ObjectRef::new(ObjectKind::Datacenter, "datacenter-1", "dc1")]));
        platform.expect_find().returning(|_, kind, path| {
            Ok(vec![
                ObjectRef::new(kind, "a", path),
                ObjectRef::new(kind, "b", path),
            ])
        });
        platform.expect_create_folder().never();
        platform.expect_clone_vm().never();

        let locator = InventoryLocator::new(Arc::new(platform));
        let dc = locator.datacenter(None).unwrap();
        assert!(matches!(
            locator.template(&dc, "tmpl"),
            Err(Error::Ambiguous { count: 2, .. })
        ));
    }

    fn folder_platform(child: PlatformResult<Option<ObjectRef>>) -> MockPlatform {
        let mut platform = MockPlatform::new();
        platform
            .expect_find_datacenters()
            .returning(|_| Ok(vec![ObjectRef::new(ObjectKind::Datacenter, "datacenter-1", "dc1")]));
        platform
            .expect_vm_folder()
            .returning(|_| Ok(ObjectRef::new(ObjectKind::Folder, "group-1", "vm")));
        platform.expect_find_child().return_once(move |_, _| child);
        platform
    }

    #[test]
    fn test_locate_folder_vanished_during_search() {
        let handle = VirtualMachineHandle::new("web", "dc1", None);
        let platform = folder_platform(Err(PlatformError::NotFound("group-1".into())));
        let locator = InventoryLocator::new(Arc::new(platform));
        assert_eq!(locator.locate(&handle).unwrap(), None);
    }

    #[test]
    fn test_locate_propagates_faults() {
        let handle = VirtualMachineHandle::new("web", "dc1", None);
        let platform = folder_platform(Err(PlatformError::Fault("session expired".into())));
        let locator = InventoryLocator::new(Arc::new(platform));
        assert!(matches!(locator.locate(&handle), Err(Error::Platform(_))));
    }
}
