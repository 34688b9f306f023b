//! Clone/create planning
//!
//! [`Planner::plan`] resolves everything a [`VirtualMachineSpec`] refers to
//! and produces a [`ProvisionRequest`]. Planning only reads the inventory, so
//! a plan that fails leaves the platform untouched.

use serde::Serialize;

use crate::config::VirtualMachineSpec;
use crate::locator::InventoryLocator;
use crate::models::{
    kb_to_gb, next_unit_number, DiskType, Ipv4Config, Ipv6Config, Metadata, SnapshotRef,
};
use crate::platform::{AdapterMapping, GuestCustomization, ObjectKind, ObjectRef};
use crate::{Error, Result};

/// Target folder of a plan
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FolderTarget {
    Resolved(ObjectRef),
    /// Path below the VM root that has to be created first
    Missing(String),
}

/// Where the virtual machine will live. Derived from the spec on every plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlacementResult {
    pub datacenter: ObjectRef,
    pub resource_pool: ObjectRef,
    pub datastore: ObjectRef,
    pub folder: FolderTarget,
    /// Folder path as declared, `None` for the VM root
    pub folder_path: Option<String>,
}

impl PlacementResult {
    pub fn resolved_folder(&self) -> Option<&ObjectRef> {
        match self.folder {
            FolderTarget::Resolved(ref folder) => Some(folder),
            FolderTarget::Missing(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum ProvisionSource {
    Clone {
        template: ObjectRef,
        label: String,
        linked: bool,
        snapshot: Option<ObjectRef>,
    },
    Create,
}

impl ProvisionSource {
    pub fn is_clone(&self) -> bool {
        matches!(self, ProvisionSource::Clone { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlannedDisk {
    pub unit_number: i32,
    pub size_gb: u64,
    pub disk_type: DiskType,
    pub iops: Option<u32>,
    pub datastore: Option<ObjectRef>,
    pub from_template: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlannedNic {
    pub label: String,
    pub network: ObjectRef,
    pub ipv4: Option<Ipv4Config>,
    pub ipv6: Option<Ipv6Config>,
}

/// Fully resolved provisioning request
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProvisionRequest {
    pub name: String,
    pub placement: PlacementResult,
    pub source: ProvisionSource,
    pub vcpu: u32,
    pub memory_mb: u64,
    pub disks: Vec<PlannedDisk>,
    pub network_interfaces: Vec<PlannedNic>,
    pub customization: Option<GuestCustomization>,
    pub metadata: Metadata,
}

impl ProvisionRequest {
    /// Record the folder created for a plan whose folder was missing
    pub fn resolve_folder(&mut self, folder: ObjectRef) {
        self.placement.folder = FolderTarget::Resolved(folder);
    }
}

pub struct Planner {
    locator: InventoryLocator,
    default_datacenter: Option<String>,
}

impl Planner {
    pub fn new(locator: InventoryLocator) -> Self {
        Self {
            locator,
            default_datacenter: None,
        }
    }

    /// Datacenter used by specs that name none
    pub fn with_default_datacenter(mut self, datacenter: Option<String>) -> Self {
        self.default_datacenter = datacenter;
        self
    }

    pub fn plan(&self, spec: &VirtualMachineSpec) -> Result<ProvisionRequest> {
        tracing::debug!(vm = %spec.name, "Planning virtual machine");
        let datacenter = self
            .locator
            .datacenter(spec.datacenter.as_deref().or(self.default_datacenter.as_deref()))?;
        let placement = self.placement(&datacenter, spec)?;

        let (source, template_disks) = match spec.source {
            Some(ref source) => {
                let template = self.locator.template(&datacenter, &source.template)?;
                let snapshot = match source.effective_snapshot() {
                    Some(wanted) => Some(self.snapshot(&template, &wanted, source.is_linked())?),
                    None => None,
                };
                let disks = self.locator.properties(&template)?.disks;
                if disks.len() > 1 {
                    return Err(Error::Config(format!(
                        "template '{}' has {} disks; only single-disk templates can be cloned",
                        source.template,
                        disks.len()
                    )));
                }
                let source = ProvisionSource::Clone {
                    template,
                    label: source.template.clone(),
                    linked: source.is_linked(),
                    snapshot,
                };
                (source, disks)
            }
            None => (ProvisionSource::Create, Vec::new()),
        };

        let mut disks = Vec::with_capacity(spec.disks.len());
        let mut last_unit = template_disks.iter().map(|d| d.unit_number).max();
        for (index, disk) in spec.disks.iter().enumerate() {
            let datastore = match disk.datastore {
                Some(ref name) => Some(self.locator.datastore(&datacenter, Some(name))?),
                None => None,
            };
            let planned = if disk.is_template() {
                let inherited = template_disks.first().ok_or_else(|| {
                    Error::Config(format!("template '{}' has no disk to inherit", spec_template(spec)))
                })?;
                PlannedDisk {
                    unit_number: inherited.unit_number,
                    size_gb: kb_to_gb(inherited.capacity_kb),
                    disk_type: DiskType::from_backing(inherited.thin, inherited.eager_scrub),
                    iops: disk.iops,
                    datastore,
                    from_template: true,
                }
            } else {
                let unit_number = next_unit_number(last_unit)?;
                last_unit = Some(unit_number);
                PlannedDisk {
                    unit_number,
                    size_gb: disk.size_gb().unwrap_or_default(),
                    disk_type: disk.disk_type,
                    iops: disk.iops,
                    datastore,
                    from_template: false,
                }
            };
            tracing::debug!(vm = %spec.name, index, unit = planned.unit_number, "Planned disk");
            disks.push(planned);
        }

        let interfaces = spec.resolved_interfaces();
        let mut network_interfaces = Vec::with_capacity(interfaces.len());
        for nic in interfaces {
            network_interfaces.push(PlannedNic {
                network: self.locator.network(&datacenter, &nic.label)?,
                label: nic.label,
                ipv4: nic.ipv4,
                ipv6: nic.ipv6,
            });
        }

        let customization = spec.needs_customization().then(|| GuestCustomization {
            host_name: spec.name.clone(),
            domain: spec.customization.domain.clone(),
            time_zone: spec.customization.time_zone.clone(),
            dns_servers: spec.customization.dns_servers.clone(),
            dns_suffixes: spec.customization.dns_suffixes.clone(),
            adapters: network_interfaces
                .iter()
                .map(|nic| AdapterMapping {
                    ipv4: nic.ipv4.clone(),
                    ipv6: nic.ipv6.clone(),
                })
                .collect(),
        });

        Ok(ProvisionRequest {
            name: spec.name.clone(),
            placement,
            source,
            vcpu: spec.vcpu,
            memory_mb: spec.memory_mb,
            disks,
            network_interfaces,
            customization,
            metadata: spec.metadata.clone(),
        })
    }

    fn placement(&self, datacenter: &ObjectRef, spec: &VirtualMachineSpec) -> Result<PlacementResult> {
        let resource_pool = self.locator.resource_pool(
            datacenter,
            spec.cluster.as_deref(),
            spec.resource_pool.as_deref(),
        )?;
        let datastore_name = spec
            .datastore
            .as_deref()
            .or_else(|| spec.disks.first().and_then(|d| d.datastore.as_deref()));
        let datastore = self.locator.datastore(datacenter, datastore_name)?;

        let folder_path = spec.folder_path().map(str::to_string);
        let folder = match self.locator.folder(datacenter, folder_path.as_deref()) {
            Ok(folder) => FolderTarget::Resolved(folder),
            Err(Error::NotFound {
                kind: ObjectKind::Folder,
                path,
            }) => FolderTarget::Missing(path),
            Err(other) => return Err(other),
        };

        Ok(PlacementResult {
            datacenter: datacenter.clone(),
            resource_pool,
            datastore,
            folder,
            folder_path,
        })
    }

    fn snapshot(&self, template: &ObjectRef, wanted: &SnapshotRef, linked: bool) -> Result<ObjectRef> {
        match self.locator.snapshot(template, wanted) {
            Err(Error::NotFound {
                kind: ObjectKind::Snapshot,
                ..
            }) if linked => Err(Error::SnapshotRequired {
                template: template.name.clone(),
                snapshot: wanted.name().map(str::to_string),
            }),
            other => other,
        }
    }
}

fn spec_template(spec: &VirtualMachineSpec) -> &str {
    spec.source.as_ref().map(|s| s.template.as_str()).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DiskSpec, NetworkInterfaceSpec, SourceSpec};
    use crate::platform::memory::{DatacenterSeed, InventorySeed, TemplateSeed};
    use crate::platform::{InMemoryPlatform, MockPlatform, Platform};
    use std::net::Ipv4Addr;
    use std::sync::Arc;

    fn inventory() -> Arc<InMemoryPlatform> {
        let seed = InventorySeed::default().datacenter(
            DatacenterSeed::new("dc1")
                .cluster("cluster1", &[])
                .datastore("ds1")
                .network("LAN")
                .folder("existing")
                .template(TemplateSeed::new("tmpl").disks_gb(vec![16]).snapshot("snap1"))
                .template(TemplateSeed::new("nosnap").disks_gb(vec![8]))
                .template(TemplateSeed::new("multi").disks_gb(vec![16, 8]).snapshot("snap1")),
        );
        Arc::new(InMemoryPlatform::from_seed(&seed))
    }

    fn planner(platform: Arc<InMemoryPlatform>) -> Planner {
        Planner::new(InventoryLocator::new(platform))
    }

    fn cloned(template: SourceSpec) -> VirtualMachineSpec {
        VirtualMachineSpec::builder()
            .name("terraform-test")
            .source(template)
            .disk(DiskSpec::from_template())
            .disk(DiskSpec::sized(30).disk_type(DiskType::Thin))
            .network_interface(NetworkInterfaceSpec::dhcp("LAN").ipv4(Ipv4Addr::new(10, 0, 0, 5), 24))
            .build()
    }

    #[test]
    fn test_plan_clone() {
        let platform = inventory();
        let request = planner(platform.clone())
            .plan(&cloned(SourceSpec::linked("tmpl").with_snapshot("snap1")))
            .unwrap();

        match request.source {
            ProvisionSource::Clone { ref label, linked, ref snapshot, .. } => {
                assert_eq!(label, "tmpl");
                assert!(linked);
                assert_eq!(snapshot.as_ref().unwrap().name, "snap1");
            }
            ProvisionSource::Create => panic!("expected a clone"),
        }
        assert_eq!(request.disks[0].size_gb, 16);
        assert!(request.disks[0].from_template);
        assert_eq!(request.disks[1].unit_number, 1);
        assert_eq!(request.disks[1].size_gb, 30);
        assert_eq!(request.network_interfaces[0].network.name, "LAN");
        let customization = request.customization.unwrap();
        assert_eq!(customization.host_name, "terraform-test");
        assert_eq!(customization.adapters.len(), 1);
        assert_eq!(platform.mutation_count(), 0);
    }

    #[test]
    fn test_linked_clone_uses_current_snapshot() {
        let request = planner(inventory()).plan(&cloned(SourceSpec::linked("tmpl"))).unwrap();
        assert!(matches!(
            request.source,
            ProvisionSource::Clone { snapshot: Some(ref s), .. } if s.name == "snap1"
        ));
    }

    #[test]
    fn test_snapshot_required() {
        let platform = inventory();
        let planner = planner(platform.clone());

        let err = planner
            .plan(&cloned(SourceSpec::linked("tmpl").with_snapshot("snap9")))
            .unwrap_err();
        assert!(matches!(
            err,
            Error::SnapshotRequired { ref template, snapshot: Some(ref s) } if template == "tmpl" && s == "snap9"
        ));

        let err = planner.plan(&cloned(SourceSpec::linked("nosnap"))).unwrap_err();
        assert!(matches!(err, Error::SnapshotRequired { snapshot: None, .. }));

        // full clone from a missing snapshot is an ordinary lookup miss
        let err = planner
            .plan(&cloned(SourceSpec::full("tmpl").with_snapshot("snap9")))
            .unwrap_err();
        assert!(matches!(err, Error::NotFound { kind: ObjectKind::Snapshot, .. }));
        assert_eq!(platform.mutation_count(), 0);
    }

    #[test]
    fn test_extra_disks_follow_template_units() {
        let request = planner(inventory()).plan(&cloned(SourceSpec::full("nosnap"))).unwrap();
        assert_eq!(request.disks[0].size_gb, 8);
        assert_eq!(request.disks[0].unit_number, 0);
        assert_eq!(request.disks[1].unit_number, 1);
    }

    #[test]
    fn test_multi_disk_template_rejected() {
        let platform = inventory();
        let planner = planner(platform.clone());

        for source in [SourceSpec::full("multi"), SourceSpec::linked("multi")] {
            let err = planner.plan(&cloned(source)).unwrap_err();
            assert!(
                matches!(err, Error::Config(ref m) if m.contains("'multi' has 2 disks")),
                "{:?}",
                err
            );
        }
        // extra disks alone do not make it acceptable
        let spec = VirtualMachineSpec::builder()
            .name("vm")
            .source(SourceSpec::full("multi"))
            .disk(DiskSpec::sized(10))
            .build();
        assert!(matches!(planner.plan(&spec), Err(Error::Config(_))));
        assert_eq!(platform.mutation_count(), 0);
    }

    #[test]
    fn test_plan_bare_create_and_missing_folder() {
        let spec = VirtualMachineSpec::builder()
            .name("bare")
            .folder("team/new")
            .disk(DiskSpec::sized(10))
            .network_interface(NetworkInterfaceSpec::dhcp("LAN"))
            .build();
        let request = planner(inventory()).plan(&spec).unwrap();

        assert_eq!(request.source, ProvisionSource::Create);
        assert_eq!(request.disks[0].unit_number, 0);
        assert!(request.customization.is_none());
        assert_eq!(request.placement.folder, FolderTarget::Missing("team/new".into()));
        assert!(request.placement.resolved_folder().is_none());
    }

    #[test]
    fn test_unit_seven_is_skipped() {
        let mut builder = VirtualMachineSpec::builder().name("many");
        for _ in 0..9 {
            builder = builder.disk(DiskSpec::sized(1));
        }
        let request = planner(inventory()).plan(&builder.build()).unwrap();
        let units: Vec<_> = request.disks.iter().map(|d| d.unit_number).collect();
        assert_eq!(units, vec![0, 1, 2, 3, 4, 5, 6, 8, 9]);
    }

    #[test]
    fn test_plan_missing_network() {
        let spec = VirtualMachineSpec::builder()
            .name("vm")
            .network_interface(NetworkInterfaceSpec::dhcp("WAN"))
            .build();
        assert!(matches!(
            planner(inventory()).plan(&spec),
            Err(Error::NotFound { kind: ObjectKind::Network, .. })
        ));
    }

    #[test]
    fn test_plan_with_mock_never_mutates() {
        let mut platform = MockPlatform::new();
        platform
            .expect_find_datacenters()
            .returning(|_| Ok(vec![ObjectRef::new(ObjectKind::Datacenter, "datacenter-1", "dc1")]));
        platform.expect_find().returning(|_, kind, path| match kind {
            ObjectKind::Template => Ok(vec![ObjectRef::new(kind, "vm-1", path)]),
            ObjectKind::Snapshot => Ok(Vec::new()),
            _ => Ok(vec![ObjectRef::new(kind, format!("{}-1", kind.moref_prefix()), path)]),
        });
        platform
            .expect_vm_folder()
            .returning(|_| Ok(ObjectRef::new(ObjectKind::Folder, "group-1", "vm")));
        platform
            .expect_snapshots()
            .returning(|_| Ok(vec![ObjectRef::new(ObjectKind::Snapshot, "snapshot-1", "base")]));
        platform.expect_clone_vm().never();
        platform.expect_create_vm().never();
        platform.expect_reconfigure_vm().never();
        platform.expect_create_folder().never();

        let platform: Arc<dyn Platform> = Arc::new(platform);
        let err = Planner::new(InventoryLocator::new(platform))
            .plan(&cloned(SourceSpec::linked("tmpl").with_snapshot("snap1")))
            .unwrap_err();
        assert!(matches!(err, Error::SnapshotRequired { .. }));
    }
}
