//! Hardware reconciliation
//!
//! Drives the platform from a [`ProvisionRequest`] to a configured virtual
//! machine: clone or create, then CPU/memory, disks, interfaces, guest
//! customization and power. Once the virtual machine exists a failing step
//! is reported as [`Error::PartialFailure`] and the machine is left in place.

use std::sync::Arc;

use crate::controller::VirtualMachineHandle;
use crate::error::PlatformError;
use crate::models::{gb_to_kb, VirtualMachineState};
use crate::planner::{PlannedDisk, ProvisionRequest, ProvisionSource};
use crate::platform::{
    poll_until, wait_for_task, CloneSpec, ConfigSpec, CreateSpec, CustomizationStatus, DeviceChange,
    DiskChange, DiskMoveType, ObjectRef, Platform, PlatformResult, PollSettings, PowerState,
    RelocateSpec, TaskRef,
};
use crate::{Error, Result};

pub struct Reconciler {
    platform: Arc<dyn Platform>,
    task: PollSettings,
    customization: PollSettings,
}

impl Reconciler {
    pub fn new(platform: Arc<dyn Platform>, task: PollSettings, customization: PollSettings) -> Self {
        Self {
            platform,
            task,
            customization,
        }
    }

    /// Provision and configure the virtual machine described by `request`
    pub fn apply(&self, request: &ProvisionRequest) -> Result<VirtualMachineHandle> {
        let folder = request.placement.resolved_folder().ok_or_else(|| {
            Error::PlacementFailed(format!(
                "folder '{}' does not exist",
                request.placement.folder_path.as_deref().unwrap_or("/")
            ))
        })?;
        let handle = VirtualMachineHandle::new(
            request.name.as_str(),
            request.placement.datacenter.name.as_str(),
            request.placement.folder_path.clone(),
        );

        tracing::info!(vm = %handle, clone = request.source.is_clone(), "Provisioning virtual machine");
        let vm = self.provision(request, folder)?;
        self.configure(&handle, &vm, request)?;
        tracing::info!(vm = %handle, "Virtual machine configured");
        Ok(handle)
    }

    fn provision(&self, request: &ProvisionRequest, folder: &ObjectRef) -> Result<ObjectRef> {
        let placement = &request.placement;
        let (task, operation) = match request.source {
            ProvisionSource::Clone {
                ref template,
                linked,
                ref snapshot,
                ..
            } => {
                let spec = CloneSpec {
                    name: request.name.clone(),
                    folder: folder.clone(),
                    location: RelocateSpec {
                        resource_pool: placement.resource_pool.clone(),
                        datastore: placement.datastore.clone(),
                        disk_move_type: if linked {
                            DiskMoveType::CreateNewChildDiskBacking
                        } else {
                            DiskMoveType::MoveAllDiskBackingsAndDisallowSharing
                        },
                    },
                    snapshot: snapshot.clone(),
                    power_on: false,
                };
                (self.platform.clone_vm(template, &spec), "clone")
            }
            ProvisionSource::Create => {
                let spec = CreateSpec {
                    name: request.name.clone(),
                    folder: folder.clone(),
                    resource_pool: placement.resource_pool.clone(),
                    datastore: placement.datastore.clone(),
                    config: creation_config(request)?,
                };
                (self.platform.create_vm(&spec), "create")
            }
        };

        let task = task.map_err(|e| Error::ProvisionFailed(e.to_string()))?;
        match wait_for_task(self.platform.as_ref(), &task, operation, self.task) {
            Ok(Some(vm)) => Ok(vm),
            Ok(None) => Err(Error::ProvisionFailed(format!(
                "{} of '{}' returned no virtual machine",
                operation, request.name
            ))),
            Err(Error::Platform(e)) => Err(Error::ProvisionFailed(e.to_string())),
            Err(other) => Err(other),
        }
    }

    /// Bring an existing virtual machine in line with `request`.
    ///
    /// Every step compares against the current properties first, so running
    /// this again after a partial failure only redoes what is missing.
    pub fn configure(&self, handle: &VirtualMachineHandle, vm: &ObjectRef, request: &ProvisionRequest) -> Result<()> {
        self.step(handle, "cpu and memory", || self.reconcile_compute(vm, request))?;
        self.step(handle, "disk configuration", || self.reconcile_disks(vm, &request.disks))?;
        self.step(handle, "network configuration", || self.reconcile_network(vm, request))?;
        self.step(handle, "guest customization", || self.customize(vm, request))?;
        self.step(handle, "power on", || self.power_on(vm))
    }

    fn step<F>(&self, handle: &VirtualMachineHandle, step: &str, f: F) -> Result<()>
    where
        F: FnOnce() -> Result<()>,
    {
        tracing::debug!(vm = %handle, step, "Configuring");
        f().map_err(|err| {
            tracing::error!(vm = %handle, step, error = %err, "Configuration step failed");
            Error::PartialFailure {
                handle: handle.clone(),
                step: step.to_string(),
                message: err.to_string(),
            }
        })
    }

    fn run(&self, task: PlatformResult<TaskRef>, operation: &str) -> Result<Option<ObjectRef>> {
        let task = task?;
        wait_for_task(self.platform.as_ref(), &task, operation, self.task)
    }

    fn reconfigure(&self, vm: &ObjectRef, spec: &ConfigSpec, operation: &str) -> Result<()> {
        if spec.is_empty() {
            return Ok(());
        }
        self.run(self.platform.reconfigure_vm(vm, spec), operation)?;
        Ok(())
    }

    fn reconcile_compute(&self, vm: &ObjectRef, request: &ProvisionRequest) -> Result<()> {
        let props = self.platform.vm_properties(vm)?;
        if props.num_cpus == request.vcpu && props.memory_mb == request.memory_mb {
            return Ok(());
        }
        if props.power_state == PowerState::PoweredOn {
            tracing::info!(vm = %vm.name, "Powering off to change CPU and memory");
            self.run(self.platform.power_off(vm), "power off")?;
        }
        let spec = ConfigSpec {
            num_cpus: Some(request.vcpu),
            memory_mb: Some(request.memory_mb),
            ..Default::default()
        };
        self.reconfigure(vm, &spec, "reconfigure cpu and memory")
    }

    fn reconcile_disks(&self, vm: &ObjectRef, disks: &[PlannedDisk]) -> Result<()> {
        let props = self.platform.vm_properties(vm)?;
        let mut spec = ConfigSpec::default();

        for disk in disks {
            let iops_limit = disk.iops.map(i64::from);
            match props.disks.iter().find(|d| d.unit_number == disk.unit_number) {
                Some(existing) => {
                    let capacity_kb = if disk.from_template {
                        gb_to_kb(disk.size_gb)?.max(existing.capacity_kb)
                    } else {
                        gb_to_kb(disk.size_gb)?
                    };
                    if capacity_kb != existing.capacity_kb || iops_limit != existing.iops_limit {
                        spec.device_changes.push(DeviceChange::EditDisk(DiskChange {
                            unit_number: disk.unit_number,
                            capacity_kb,
                            thin: existing.thin,
                            eager_scrub: existing.eager_scrub,
                            iops_limit,
                            datastore: None,
                        }));
                    }
                }
                None => spec.device_changes.push(DeviceChange::AddDisk(disk_change(disk)?)),
            }
        }

        self.reconfigure(vm, &spec, "reconfigure disks")
    }

    fn reconcile_network(&self, vm: &ObjectRef, request: &ProvisionRequest) -> Result<()> {
        let props = self.platform.vm_properties(vm)?;
        let wanted = &request.network_interfaces;

        let keep = props
            .nics
            .iter()
            .zip(wanted.iter())
            .take_while(|(existing, planned)| existing.network == planned.network.name)
            .count();

        let mut spec = ConfigSpec::default();
        for nic in &props.nics[keep..] {
            spec.device_changes.push(DeviceChange::RemoveNic { key: nic.key });
        }
        for nic in &wanted[keep..] {
            spec.device_changes.push(DeviceChange::AddNic {
                network: nic.network.clone(),
            });
        }
        self.reconfigure(vm, &spec, "reconfigure network interfaces")
    }

    fn customize(&self, vm: &ObjectRef, request: &ProvisionRequest) -> Result<()> {
        let Some(ref customization) = request.customization else {
            return Ok(());
        };
        match self.platform.customization_status(vm)? {
            CustomizationStatus::Idle | CustomizationStatus::Failed(_) => {}
            CustomizationStatus::Pending | CustomizationStatus::Succeeded => return Ok(()),
        }
        if self.platform.vm_properties(vm)?.power_state == PowerState::PoweredOn {
            self.run(self.platform.power_off(vm), "power off")?;
        }
        tracing::info!(vm = %vm.name, adapters = customization.adapters.len(), "Issuing guest customization");
        self.run(self.platform.customize_vm(vm, customization), "customize")?;
        Ok(())
    }

    fn power_on(&self, vm: &ObjectRef) -> Result<()> {
        if self.platform.vm_properties(vm)?.power_state == PowerState::PoweredOn {
            return Ok(());
        }
        self.run(self.platform.power_on(vm), "power on")?;
        Ok(())
    }

    /// Power off, treating a virtual machine that is already off as success
    pub fn power_off(&self, vm: &ObjectRef) -> Result<()> {
        match self.run(self.platform.power_off(vm), "power off") {
            Ok(_) => Ok(()),
            Err(Error::Platform(PlatformError::InvalidPowerState(message))) => {
                tracing::warn!(vm = %vm.name, %message, "Already powered off");
                Ok(())
            }
            Err(other) => Err(other),
        }
    }

    pub fn destroy(&self, vm: &ObjectRef) -> Result<()> {
        self.run(self.platform.destroy_vm(vm), "destroy")?;
        Ok(())
    }

    /// Wait for in-guest customization issued during configuration
    pub fn await_customization(&self, vm: &ObjectRef) -> Result<()> {
        poll_until("guest customization", self.customization, || {
            match self.platform.customization_status(vm)? {
                CustomizationStatus::Idle | CustomizationStatus::Succeeded => Ok(Some(())),
                CustomizationStatus::Pending => Ok(None),
                CustomizationStatus::Failed(message) => Err(Error::ProvisionFailed(format!(
                    "guest customization of '{}' failed: {}",
                    vm.name, message
                ))),
            }
        })
    }

    /// Wait until every interface reports an address
    pub fn await_guest_network(
        &self,
        handle: &VirtualMachineHandle,
        vm: &ObjectRef,
        settings: PollSettings,
    ) -> Result<VirtualMachineState> {
        poll_until("guest network", settings, || {
            let props = self.platform.vm_properties(vm)?;
            let state = VirtualMachineState::from_properties(handle.clone(), &props);
            Ok(state.network_ready().then_some(state))
        })
    }
}

fn disk_change(disk: &PlannedDisk) -> Result<DiskChange> {
    Ok(DiskChange {
        unit_number: disk.unit_number,
        capacity_kb: gb_to_kb(disk.size_gb)?,
        thin: disk.disk_type.is_thin(),
        eager_scrub: disk.disk_type.is_eager_scrub(),
        iops_limit: disk.iops.map(i64::from),
        datastore: disk.datastore.clone(),
    })
}

/// Hardware for a bare create is set in the create call itself
fn creation_config(request: &ProvisionRequest) -> Result<ConfigSpec> {
    let mut device_changes = request
        .disks
        .iter()
        .map(|disk| disk_change(disk).map(DeviceChange::AddDisk))
        .collect::<Result<Vec<_>>>()?;
    device_changes.extend(request.network_interfaces.iter().map(|nic| DeviceChange::AddNic {
        network: nic.network.clone(),
    }));
    Ok(ConfigSpec {
        num_cpus: Some(request.vcpu),
        memory_mb: Some(request.memory_mb),
        device_changes,
        extra_config: Default::default(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VirtualMachineSpec;
    use crate::locator::InventoryLocator;
    use crate::models::{DiskSpec, DiskType, NetworkInterfaceSpec, SourceSpec};
    use crate::planner::Planner;
    use crate::platform::memory::{DatacenterSeed, InventorySeed, Operation, TemplateSeed};
    use crate::platform::InMemoryPlatform;
    use std::net::Ipv4Addr;
    use std::time::Duration;

    fn fast() -> PollSettings {
        PollSettings::new(Duration::from_millis(200), Duration::from_millis(1))
    }

    fn inventory() -> Arc<InMemoryPlatform> {
        let seed = InventorySeed::default().datacenter(
            DatacenterSeed::new("dc1")
                .cluster("cluster1", &[])
                .datastore("ds1")
                .network("LAN")
                .network("MGMT")
                .template(TemplateSeed::new("tmpl").network("MGMT").snapshot("snap1")),
        );
        Arc::new(InMemoryPlatform::from_seed(&seed).with_task_polls(2))
    }

    fn request(platform: &Arc<InMemoryPlatform>, spec: &VirtualMachineSpec) -> ProvisionRequest {
        Planner::new(InventoryLocator::new(platform.clone())).plan(spec).unwrap()
    }

    fn reconciler(platform: &Arc<InMemoryPlatform>) -> Reconciler {
        Reconciler::new(platform.clone(), fast(), fast())
    }

    fn clone_spec() -> VirtualMachineSpec {
        VirtualMachineSpec::builder()
            .name("terraform-test")
            .vcpu(2)
            .memory_mb(4096)
            .source(SourceSpec::full("tmpl"))
            .disk(DiskSpec::from_template())
            .disk(DiskSpec::sized(1).iops(500))
            .network_interface(NetworkInterfaceSpec::dhcp("LAN").ipv4(Ipv4Addr::new(10, 0, 0, 5), 24))
            .build()
    }

    #[test]
    fn test_apply_clone() {
        let platform = inventory();
        let reconciler = reconciler(&platform);
        let handle = reconciler.apply(&request(&platform, &clone_spec())).unwrap();
        assert_eq!(handle.name, "terraform-test");

        let props = platform.vm_by_name("terraform-test").unwrap();
        assert_eq!(props.num_cpus, 2);
        assert_eq!(props.memory_mb, 4096);
        assert_eq!(props.power_state, PowerState::PoweredOn);
        assert_eq!(props.disks.len(), 2);
        assert_eq!(props.disks[1].iops_limit, Some(500));
        // template interface replaced by the declared one
        assert_eq!(props.nics.len(), 1);
        assert_eq!(props.nics[0].network, "LAN");
        assert_eq!(props.nics[0].ip_addresses, vec!["10.0.0.5".to_string()]);
    }

    #[test]
    fn test_apply_bare_create() {
        let platform = inventory();
        let spec = VirtualMachineSpec::builder()
            .name("bare")
            .vcpu(4)
            .memory_mb(2048)
            .disk(DiskSpec::sized(10).disk_type(DiskType::Thin))
            .network_interface(NetworkInterfaceSpec::dhcp("LAN"))
            .network_interface(NetworkInterfaceSpec::dhcp("MGMT"))
            .build();
        reconciler(&platform).apply(&request(&platform, &spec)).unwrap();

        let props = platform.vm_by_name("bare").unwrap();
        assert_eq!(props.num_cpus, 4);
        assert_eq!(props.disks.len(), 1);
        assert!(props.disks[0].thin);
        assert_eq!(props.nics.len(), 2);
        assert_eq!(props.power_state, PowerState::PoweredOn);
    }

    #[test]
    fn test_clone_failure_is_provision_failed() {
        let platform = inventory();
        platform.fail_next_task(Operation::Clone, "insufficient disk space");

        let err = reconciler(&platform).apply(&request(&platform, &clone_spec())).unwrap_err();
        assert!(matches!(err, Error::ProvisionFailed(ref m) if m.contains("insufficient disk space")));
        assert_eq!(platform.vm_count(), 0);
    }

    #[test]
    fn test_post_create_failure_leaves_vm() {
        let platform = inventory();
        platform.fail_next_task(Operation::Reconfigure, "device busy");

        let err = reconciler(&platform).apply(&request(&platform, &clone_spec())).unwrap_err();
        match err {
            Error::PartialFailure { ref handle, ref step, ref message } => {
                assert_eq!(handle.name, "terraform-test");
                assert_eq!(step, "cpu and memory");
                assert!(message.contains("device busy"));
            }
            other => panic!("expected partial failure, got {:?}", other),
        }
        assert_eq!(platform.vm_count(), 1);
    }

    #[test]
    fn test_configure_is_resumable() {
        let platform = inventory();
        let req = request(&platform, &clone_spec());
        platform.fail_next(Operation::PowerOn, PlatformError::Fault("host in maintenance".into()));

        let reconciler = reconciler(&platform);
        let err = reconciler.apply(&req).unwrap_err();
        let handle = err.handle().cloned().unwrap();

        let vm = InventoryLocator::new(platform.clone())
            .find_vm(req.placement.resolved_folder().unwrap(), "terraform-test")
            .unwrap()
            .unwrap();
        reconciler.configure(&handle, &vm, &req).unwrap();

        let props = platform.vm_by_name("terraform-test").unwrap();
        assert_eq!(props.power_state, PowerState::PoweredOn);
        assert_eq!(props.disks.len(), 2);
        assert_eq!(props.nics.len(), 1);
    }

    #[test]
    fn test_customization_timeout() {
        let platform = inventory();
        platform.stall_customization(true);
        let req = request(&platform, &clone_spec());
        let reconciler = reconciler(&platform);
        reconciler.apply(&req).unwrap();

        let vm = InventoryLocator::new(platform.clone())
            .find_vm(req.placement.resolved_folder().unwrap(), "terraform-test")
            .unwrap()
            .unwrap();
        assert!(matches!(
            reconciler.await_customization(&vm),
            Err(Error::Timeout { ref operation, .. }) if operation == "guest customization"
        ));
    }

    #[test]
    fn test_oversized_disk_rejected_before_create() {
        let platform = inventory();
        let spec = VirtualMachineSpec::builder()
            .name("huge")
            .disk(DiskSpec::sized(1 << 50))
            .build();
        let err = reconciler(&platform).apply(&request(&platform, &spec)).unwrap_err();
        assert!(matches!(err, Error::Config(_)), "{:?}", err);
        assert_eq!(platform.vm_count(), 0);
        assert_eq!(platform.mutation_count(), 0);
    }

    #[test]
    fn test_missing_folder_is_placement_failure() {
        let platform = inventory();
        let spec = VirtualMachineSpec::builder()
            .name("vm")
            .folder("nowhere")
            .network_interface(NetworkInterfaceSpec::dhcp("LAN"))
            .build();
        assert!(matches!(
            reconciler(&platform).apply(&request(&platform, &spec)),
            Err(Error::PlacementFailed(_))
        ));
    }
}
