//! Lifecycle controller
//!
//! Entry point used by a declarative engine. Each virtual machine resource
//! moves through `Absent -> Creating -> Configuring -> Ready -> Destroying ->
//! Absent`; the controller tracks that state per handle and only hands out
//! complete attributes for machines that reached `Ready`.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use crate::attributes::{self, AttributeMap};
use crate::config::VirtualMachineSpec;
use crate::error::PlatformError;
use crate::locator::InventoryLocator;
use crate::models::VirtualMachineState;
use crate::placement::{FolderHandle, PlacementManager};
use crate::planner::{FolderTarget, Planner, ProvisionRequest};
use crate::platform::{ObjectKind, ObjectRef, Platform, PollSettings, PowerState};
use crate::reconciler::Reconciler;
use crate::{Error, Result};

/// Identifies a virtual machine for later reads and destroys.
///
/// Held by the caller for the lifetime of the resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VirtualMachineHandle {
    pub name: String,
    pub datacenter: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub folder: Option<String>,
}

impl VirtualMachineHandle {
    pub fn new(name: impl Into<String>, datacenter: impl Into<String>, folder: Option<String>) -> Self {
        Self {
            name: name.into(),
            datacenter: datacenter.into(),
            folder: folder
                .map(|f| f.trim_matches('/').to_string())
                .filter(|f| !f.is_empty()),
        }
    }
}

impl std::fmt::Display for VirtualMachineHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.folder {
            Some(ref folder) => write!(f, "/{}/vm/{}/{}", self.datacenter, folder, self.name),
            None => write!(f, "/{}/vm/{}", self.datacenter, self.name),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LifecycleState {
    Absent,
    Creating,
    Configuring,
    Ready,
    Destroying,
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LifecycleState::Absent => write!(f, "Absent"),
            LifecycleState::Creating => write!(f, "Creating"),
            LifecycleState::Configuring => write!(f, "Configuring"),
            LifecycleState::Ready => write!(f, "Ready"),
            LifecycleState::Destroying => write!(f, "Destroying"),
        }
    }
}

/// Timeouts and defaults for a [`LifecycleController`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerConfig {
    /// Bound on each remote task (clone, reconfigure, power, destroy)
    pub task_timeout: Duration,
    pub customization_timeout: Duration,
    pub guest_net_timeout: Duration,
    pub poll_interval: Duration,
    /// Wait for every interface to report an address before `Ready`
    pub wait_for_guest_net: bool,
    /// Datacenter for specs and lookups that name none
    pub default_datacenter: Option<String>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            task_timeout: Duration::from_secs(600),
            customization_timeout: Duration::from_secs(600),
            guest_net_timeout: Duration::from_secs(300),
            poll_interval: Duration::from_secs(1),
            wait_for_guest_net: true,
            default_datacenter: None,
        }
    }
}

impl ControllerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read overrides from `VSPHERE_*` environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let parse = |key: &str| -> Result<Option<u64>> {
            match lookup(key) {
                Some(raw) => raw
                    .trim()
                    .parse()
                    .map(Some)
                    .map_err(|_| Error::Config(format!("{} must be a whole number, got '{}'", key, raw))),
                None => Ok(None),
            }
        };

        let mut config = Self::default();
        if let Some(dc) = lookup("VSPHERE_DATACENTER").filter(|v| !v.is_empty()) {
            config.default_datacenter = Some(dc);
        }
        if let Some(secs) = parse("VSPHERE_TASK_TIMEOUT_SECS")? {
            config.task_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = parse("VSPHERE_CUSTOMIZATION_TIMEOUT_SECS")? {
            config.customization_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = parse("VSPHERE_GUEST_NET_TIMEOUT_SECS")? {
            config.guest_net_timeout = Duration::from_secs(secs);
        }
        if let Some(ms) = parse("VSPHERE_POLL_INTERVAL_MS")? {
            config.poll_interval = Duration::from_millis(ms);
        }
        if let Some(raw) = lookup("VSPHERE_WAIT_FOR_GUEST_NET") {
            config.wait_for_guest_net = match raw.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" => true,
                "0" | "false" | "no" => false,
                _ => {
                    return Err(Error::Config(format!(
                        "VSPHERE_WAIT_FOR_GUEST_NET must be a boolean, got '{}'",
                        raw
                    )))
                }
            };
        }
        Ok(config)
    }

    /// Upper bound for any single platform task
    pub fn task_timeout(mut self, timeout: Duration) -> Self {
        self.task_timeout = timeout;
        self
    }

    /// How long to wait for in-guest customization after power on
    pub fn customization_timeout(mut self, timeout: Duration) -> Self {
        self.customization_timeout = timeout;
        self
    }

    /// How long to wait for every interface to report an address
    pub fn guest_net_timeout(mut self, timeout: Duration) -> Self {
        self.guest_net_timeout = timeout;
        self
    }

    /// Delay between status polls
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Skip the guest network wait when `false`. Customization waits still apply.
    pub fn wait_for_guest_net(mut self, wait: bool) -> Self {
        self.wait_for_guest_net = wait;
        self
    }

    /// Datacenter used when a spec or folder request names none
    pub fn default_datacenter(mut self, datacenter: impl Into<String>) -> Self {
        self.default_datacenter = Some(datacenter.into());
        self
    }

    fn task_settings(&self) -> PollSettings {
        PollSettings::new(self.task_timeout, self.poll_interval)
    }
}

/// A difference between declared and observed configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "field")]
pub enum Drift {
    Vcpu { expected: u32, actual: u32 },
    Memory { expected: u64, actual: u64 },
    DiskCount { expected: usize, actual: usize },
    DiskSize { index: usize, expected: u64, actual: u64 },
    DiskIops { index: usize, expected: Option<u32>, actual: Option<u32> },
    InterfaceCount { expected: usize, actual: usize },
    InterfaceLabel { index: usize, expected: String, actual: String },
    MetadataMissing { key: String },
    MetadataValue { key: String, expected: String, actual: String },
}

impl std::fmt::Display for Drift {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Drift::Vcpu { expected, actual } => write!(f, "vcpu: {} -> {}", actual, expected),
            Drift::Memory { expected, actual } => write!(f, "memory: {} -> {}", actual, expected),
            Drift::DiskCount { expected, actual } => write!(f, "disk.#: {} -> {}", actual, expected),
            Drift::DiskSize { index, expected, actual } => {
                write!(f, "disk.{}.size: {} -> {}", index, actual, expected)
            }
            Drift::DiskIops { index, expected, actual } => {
                write!(f, "disk.{}.iops: {:?} -> {:?}", index, actual, expected)
            }
            Drift::InterfaceCount { expected, actual } => {
                write!(f, "network_interface.#: {} -> {}", actual, expected)
            }
            Drift::InterfaceLabel { index, expected, actual } => {
                write!(f, "network_interface.{}.label: {} -> {}", index, actual, expected)
            }
            Drift::MetadataMissing { key } => write!(f, "custom_configuration_parameters.{}: missing", key),
            Drift::MetadataValue { key, expected, actual } => {
                write!(f, "custom_configuration_parameters.{}: {} -> {}", key, actual, expected)
            }
        }
    }
}

struct Tracked {
    state: LifecycleState,
    spec: Option<VirtualMachineSpec>,
}

/// Drives virtual machine resources through their lifecycle.
///
/// Calls for one handle are expected to be serialized by the caller;
/// distinct handles may be driven from different threads.
pub struct LifecycleController {
    config: ControllerConfig,
    locator: InventoryLocator,
    planner: Planner,
    reconciler: Reconciler,
    placement: PlacementManager,
    resources: Arc<RwLock<HashMap<VirtualMachineHandle, Tracked>>>,
}

impl LifecycleController {
    pub fn new(platform: Arc<dyn Platform>, config: ControllerConfig) -> Self {
        let task = config.task_settings();
        let customization = PollSettings::new(config.customization_timeout, config.poll_interval);
        let locator = InventoryLocator::new(platform.clone());
        Self {
            planner: Planner::new(locator.clone()).with_default_datacenter(config.default_datacenter.clone()),
            reconciler: Reconciler::new(platform.clone(), task, customization),
            placement: PlacementManager::new(platform, task),
            locator,
            config,
            resources: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    /// Tracked lifecycle state; untracked handles are `Absent`
    pub fn state(&self, handle: &VirtualMachineHandle) -> LifecycleState {
        self.resources
            .read()
            .get(handle)
            .map(|t| t.state)
            .unwrap_or(LifecycleState::Absent)
    }

    fn transition(&self, handle: &VirtualMachineHandle, state: LifecycleState, spec: Option<&VirtualMachineSpec>) {
        tracing::debug!(vm = %handle, %state, "Lifecycle transition");
        let mut resources = self.resources.write();
        let entry = resources.entry(handle.clone()).or_insert(Tracked { state, spec: None });
        entry.state = state;
        if let Some(spec) = spec {
            entry.spec = Some(spec.clone());
        }
    }

    fn untrack(&self, handle: &VirtualMachineHandle) {
        self.resources.write().remove(handle);
    }

    fn tracked_spec(&self, handle: &VirtualMachineHandle) -> Option<VirtualMachineSpec> {
        self.resources.read().get(handle).and_then(|t| t.spec.clone())
    }

    fn ensure_state(&self, handle: &VirtualMachineHandle, allowed: &[LifecycleState], expected: &str) -> Result<()> {
        let current = self.state(handle);
        if allowed.contains(&current) {
            Ok(())
        } else {
            Err(Error::InvalidState {
                current: current.to_string(),
                expected: expected.into(),
            })
        }
    }

    /// Plan a spec without touching the platform
    pub fn plan(&self, spec: &VirtualMachineSpec) -> Result<ProvisionRequest> {
        spec.validate()?;
        self.planner.plan(spec)
    }

    /// Create the virtual machine described by `spec` and wait until it is
    /// ready.
    ///
    /// A failure after the machine exists is reported as
    /// [`Error::PartialFailure`] carrying the handle; the machine is kept and
    /// [`LifecycleController::resume`] can finish the job.
    pub fn create(&self, spec: &VirtualMachineSpec) -> Result<VirtualMachineHandle> {
        spec.validate()?;
        let span = tracing::info_span!("create", op = %uuid::Uuid::new_v4(), vm = %spec.name);
        let _enter = span.enter();

        let mut request = self.planner.plan(spec)?;
        let handle = VirtualMachineHandle::new(
            spec.name.as_str(),
            request.placement.datacenter.name.as_str(),
            request.placement.folder_path.clone(),
        );
        self.ensure_state(&handle, &[LifecycleState::Absent], "Absent")?;
        self.transition(&handle, LifecycleState::Creating, Some(spec));

        if let Err(err) = self.place(&mut request, &handle) {
            self.untrack(&handle);
            return Err(err);
        }

        if let Err(err) = self.reconciler.apply(&request) {
            if err.handle().is_some() {
                self.transition(&handle, LifecycleState::Configuring, None);
            } else {
                self.untrack(&handle);
            }
            return Err(err);
        }

        self.finish(&handle, spec, &[])?;
        tracing::info!(vm = %handle, "Virtual machine ready");
        Ok(handle)
    }

    fn place(&self, request: &mut ProvisionRequest, handle: &VirtualMachineHandle) -> Result<()> {
        let folder = match request.placement.folder {
            FolderTarget::Resolved(ref folder) => folder.clone(),
            FolderTarget::Missing(ref path) => {
                let folder = self.placement.ensure_folder(&request.placement.datacenter, path)?;
                request.resolve_folder(folder.clone());
                folder
            }
        };
        if self.locator.find_vm(&folder, &handle.name)?.is_some() {
            return Err(Error::Config(format!("virtual machine {} already exists", handle)));
        }
        Ok(())
    }

    /// Configuring phase: metadata, customization and guest network waits
    fn finish(&self, handle: &VirtualMachineHandle, spec: &VirtualMachineSpec, stale_keys: &[String]) -> Result<()> {
        self.transition(handle, LifecycleState::Configuring, Some(spec));
        let vm = self.require(handle)?;

        let partial = |step: &str, err: Error| Error::PartialFailure {
            handle: handle.clone(),
            step: step.to_string(),
            message: err.to_string(),
        };
        self.placement
            .apply_metadata(handle, &spec.metadata)
            .map_err(|e| partial("metadata", e))?;
        self.placement
            .remove_metadata(&vm, stale_keys)
            .map_err(|e| partial("metadata", e))?;

        if spec.needs_customization() {
            match self.reconciler.await_customization(&vm) {
                Ok(()) => {}
                Err(err @ Error::Timeout { .. }) => return Err(err.with_handle(handle)),
                Err(err) => return Err(partial("guest customization", err)),
            }
        }
        if self.config.wait_for_guest_net && !spec.network_interfaces.is_empty() {
            let settings = PollSettings::new(self.config.guest_net_timeout, self.config.poll_interval);
            match self.reconciler.await_guest_network(handle, &vm, settings) {
                Ok(_) => {}
                Err(err @ Error::Timeout { .. }) => return Err(err.with_handle(handle)),
                Err(err) => return Err(partial("guest network", err)),
            }
        }

        self.transition(handle, LifecycleState::Ready, None);
        Ok(())
    }

    fn require(&self, handle: &VirtualMachineHandle) -> Result<ObjectRef> {
        self.locator.locate(handle)?.ok_or_else(|| Error::NotFound {
            kind: ObjectKind::VirtualMachine,
            path: handle.to_string(),
        })
    }

    /// Refresh observed state. `None` means the machine no longer exists.
    pub fn read(&self, handle: &VirtualMachineHandle) -> Result<Option<VirtualMachineState>> {
        self.ensure_state(handle, &[LifecycleState::Absent, LifecycleState::Ready], "Ready")?;
        let Some(vm) = self.locator.locate(handle)? else {
            self.untrack(handle);
            return Ok(None);
        };
        let props = match self.locator.properties(&vm) {
            Ok(props) => props,
            Err(Error::NotFound { .. }) => {
                self.untrack(handle);
                return Ok(None);
            }
            Err(other) => return Err(other),
        };
        Ok(Some(VirtualMachineState::from_properties(handle.clone(), &props)))
    }

    /// Flat attributes of a ready machine, using the spec it was created with
    pub fn attributes(&self, handle: &VirtualMachineHandle) -> Result<Option<AttributeMap>> {
        let spec = self.tracked_spec(handle);
        Ok(self
            .read(handle)?
            .map(|state| attributes::from_state(&state, spec.as_ref())))
    }

    /// Look up a virtual machine by name within one folder
    pub fn find(&self, datacenter: Option<&str>, folder: Option<&str>, name: &str) -> Result<Option<VirtualMachineHandle>> {
        let dc = self
            .locator
            .datacenter(datacenter.or(self.config.default_datacenter.as_deref()))?;
        let parent = self.locator.folder(&dc, folder)?;
        Ok(self.locator.find_vm(&parent, name)?.map(|_| {
            VirtualMachineHandle::new(name, dc.name.as_str(), folder.map(str::to_string))
        }))
    }

    /// Verification check: does the handle's machine exist right now
    pub fn exists(&self, handle: &VirtualMachineHandle) -> Result<bool> {
        Ok(self.locator.locate(handle)?.is_some())
    }

    /// Power off and delete. Destroying something that is already gone
    /// succeeds.
    pub fn destroy(&self, handle: &VirtualMachineHandle) -> Result<()> {
        let span = tracing::info_span!("destroy", op = %uuid::Uuid::new_v4(), vm = %handle);
        let _enter = span.enter();
        self.ensure_state(
            handle,
            &[
                LifecycleState::Absent,
                LifecycleState::Ready,
                LifecycleState::Configuring,
                LifecycleState::Destroying,
            ],
            "not Creating",
        )?;

        let Some(vm) = self.locator.locate(handle)? else {
            tracing::info!(vm = %handle, "Nothing to destroy");
            self.untrack(handle);
            return Ok(());
        };
        self.transition(handle, LifecycleState::Destroying, None);

        let power_state = match self.locator.properties(&vm) {
            Ok(props) => props.power_state,
            Err(Error::NotFound { .. }) => {
                self.untrack(handle);
                return Ok(());
            }
            Err(other) => return Err(other),
        };
        if power_state != PowerState::PoweredOff {
            self.reconciler.power_off(&vm)?;
        }
        match self.reconciler.destroy(&vm) {
            Ok(()) | Err(Error::Platform(PlatformError::NotFound(_))) => {}
            Err(err) => return Err(err),
        }

        self.untrack(handle);
        tracing::info!(vm = %handle, "Virtual machine destroyed");
        Ok(())
    }

    /// Differences between `spec` and the machine as it is now
    pub fn drift(&self, handle: &VirtualMachineHandle, spec: &VirtualMachineSpec) -> Result<Vec<Drift>> {
        let request = self.plan(spec)?;
        let state = self.read(handle)?.ok_or_else(|| Error::NotFound {
            kind: ObjectKind::VirtualMachine,
            path: handle.to_string(),
        })?;
        Ok(compare(&request, spec, &state))
    }

    /// Apply a changed spec to an existing machine.
    ///
    /// CPU or memory changes power the machine off first. Name and folder
    /// changes are not supported.
    pub fn update(&self, handle: &VirtualMachineHandle, spec: &VirtualMachineSpec) -> Result<()> {
        spec.validate()?;
        let span = tracing::info_span!("update", op = %uuid::Uuid::new_v4(), vm = %handle);
        let _enter = span.enter();
        self.ensure_state(handle, &[LifecycleState::Absent, LifecycleState::Ready], "Ready")?;

        if spec.name != handle.name {
            return Err(Error::Config(format!(
                "cannot rename {} to '{}'",
                handle, spec.name
            )));
        }
        if spec.folder_path() != handle.folder.as_deref() {
            return Err(Error::Config(format!("cannot move {} to another folder", handle)));
        }

        let request = self.planner.plan(spec)?;
        let vm = self.require(handle)?;
        let stale: Vec<String> = self
            .tracked_spec(handle)
            .map(|old| {
                old.metadata
                    .keys()
                    .filter(|k| !spec.metadata.contains_key(*k))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        self.transition(handle, LifecycleState::Configuring, Some(spec));
        self.reconciler.configure(handle, &vm, &request)?;
        self.finish(handle, spec, &stale)?;
        tracing::info!(vm = %handle, "Virtual machine updated");
        Ok(())
    }

    /// Re-run configuration for a machine left behind by a partial failure
    pub fn resume(&self, handle: &VirtualMachineHandle, spec: &VirtualMachineSpec) -> Result<()> {
        spec.validate()?;
        let span = tracing::info_span!("resume", op = %uuid::Uuid::new_v4(), vm = %handle);
        let _enter = span.enter();
        self.ensure_state(
            handle,
            &[LifecycleState::Absent, LifecycleState::Configuring],
            "Configuring",
        )?;

        let request = self.planner.plan(spec)?;
        let vm = self.require(handle)?;
        self.transition(handle, LifecycleState::Configuring, Some(spec));
        self.reconciler.configure(handle, &vm, &request)?;
        self.finish(handle, spec, &[])?;
        tracing::info!(vm = %handle, "Virtual machine ready after resume");
        Ok(())
    }

    /// Create a folder path managed as its own resource
    pub fn create_folder(&self, datacenter: Option<&str>, path: &str) -> Result<FolderHandle> {
        self.placement
            .create_folder_resource(datacenter.or(self.config.default_datacenter.as_deref()), path)
    }

    /// Teardown hook for a folder resource, run after its machines are gone
    pub fn destroy_folder(&self, handle: &FolderHandle) -> Result<()> {
        self.placement.destroy_folder_resource(handle)
    }

    /// Handles and states of every tracked resource
    pub fn list(&self) -> Vec<(VirtualMachineHandle, LifecycleState)> {
        self.resources
            .read()
            .iter()
            .map(|(handle, tracked)| (handle.clone(), tracked.state))
            .collect()
    }
}

fn compare(request: &ProvisionRequest, spec: &VirtualMachineSpec, state: &VirtualMachineState) -> Vec<Drift> {
    let mut drift = Vec::new();
    if state.vcpu != request.vcpu {
        drift.push(Drift::Vcpu {
            expected: request.vcpu,
            actual: state.vcpu,
        });
    }
    if state.memory_mb != request.memory_mb {
        drift.push(Drift::Memory {
            expected: request.memory_mb,
            actual: state.memory_mb,
        });
    }

    if state.disks.len() != request.disks.len() {
        drift.push(Drift::DiskCount {
            expected: request.disks.len(),
            actual: state.disks.len(),
        });
    }
    for (index, planned) in request.disks.iter().enumerate() {
        let Some(actual) = state.disks.iter().find(|d| d.unit_number == planned.unit_number) else {
            continue;
        };
        if !planned.from_template && actual.size_gb != planned.size_gb {
            drift.push(Drift::DiskSize {
                index,
                expected: planned.size_gb,
                actual: actual.size_gb,
            });
        }
        if actual.iops != planned.iops {
            drift.push(Drift::DiskIops {
                index,
                expected: planned.iops,
                actual: actual.iops,
            });
        }
    }

    if state.network_interfaces.len() != request.network_interfaces.len() {
        drift.push(Drift::InterfaceCount {
            expected: request.network_interfaces.len(),
            actual: state.network_interfaces.len(),
        });
    }
    for (index, (planned, actual)) in request
        .network_interfaces
        .iter()
        .zip(state.network_interfaces.iter())
        .enumerate()
    {
        if planned.label != actual.label {
            drift.push(Drift::InterfaceLabel {
                index,
                expected: planned.label.clone(),
                actual: actual.label.clone(),
            });
        }
    }

    let observed: &BTreeMap<String, String> = &state.extra_config;
    for (key, value) in &spec.metadata {
        match observed.get(key) {
            None => drift.push(Drift::MetadataMissing { key: key.clone() }),
            Some(actual) if !value.matches_read_back(actual) => drift.push(Drift::MetadataValue {
                key: key.clone(),
                expected: value.to_extra_config(),
                actual: actual.clone(),
            }),
            Some(_) => {}
        }
    }
    drift
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DiskSpec, NetworkInterfaceSpec, SourceSpec};
    use crate::platform::memory::{DatacenterSeed, InventorySeed, Operation, TemplateSeed};
    use crate::platform::InMemoryPlatform;

    fn fast() -> ControllerConfig {
        ControllerConfig::new()
            .task_timeout(Duration::from_millis(200))
            .customization_timeout(Duration::from_millis(200))
            .guest_net_timeout(Duration::from_millis(200))
            .poll_interval(Duration::from_millis(1))
    }

    fn setup() -> (Arc<InMemoryPlatform>, LifecycleController) {
        let seed = InventorySeed::default().datacenter(
            DatacenterSeed::new("dc1")
                .cluster("cluster1", &[])
                .datastore("ds1")
                .network("LAN")
                .template(TemplateSeed::new("tmpl").network("LAN").snapshot("snap1")),
        );
        let platform = Arc::new(InMemoryPlatform::from_seed(&seed).with_task_polls(1));
        let controller = LifecycleController::new(platform.clone(), fast());
        (platform, controller)
    }

    fn spec() -> VirtualMachineSpec {
        VirtualMachineSpec::builder()
            .name("web")
            .folder("team")
            .source(SourceSpec::full("tmpl"))
            .disk(DiskSpec::from_template())
            .network_interface(NetworkInterfaceSpec::dhcp("LAN"))
            .metadata("role", "frontend")
            .build()
    }

    #[test]
    fn test_handle_display() {
        assert_eq!(
            VirtualMachineHandle::new("web", "dc1", Some("/team/".into())).to_string(),
            "/dc1/vm/team/web"
        );
        assert_eq!(VirtualMachineHandle::new("web", "dc1", None).to_string(), "/dc1/vm/web");
    }

    #[test]
    fn test_config_from_lookup() {
        let mut env = HashMap::new();
        env.insert("VSPHERE_DATACENTER", "dc1");
        env.insert("VSPHERE_TASK_TIMEOUT_SECS", "30");
        env.insert("VSPHERE_POLL_INTERVAL_MS", "250");
        env.insert("VSPHERE_WAIT_FOR_GUEST_NET", "false");
        let config = ControllerConfig::from_lookup(|k| env.get(k).map(|v| v.to_string())).unwrap();

        assert_eq!(config.default_datacenter.as_deref(), Some("dc1"));
        assert_eq!(config.task_timeout, Duration::from_secs(30));
        assert_eq!(config.poll_interval, Duration::from_millis(250));
        assert_eq!(config.customization_timeout, Duration::from_secs(600));
        assert!(!config.wait_for_guest_net);

        env.insert("VSPHERE_GUEST_NET_TIMEOUT_SECS", "soon");
        assert!(matches!(
            ControllerConfig::from_lookup(|k| env.get(k).map(|v| v.to_string())),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_create_read_destroy() {
        let (platform, controller) = setup();
        let handle = controller.create(&spec()).unwrap();
        assert_eq!(controller.state(&handle), LifecycleState::Ready);
        assert!(controller.exists(&handle).unwrap());

        let state = controller.read(&handle).unwrap().unwrap();
        assert_eq!(state.vcpu, 2);
        assert!(state.network_ready());
        let attrs = controller.attributes(&handle).unwrap().unwrap();
        assert_eq!(attrs["folder"], "team");
        assert_eq!(attrs["custom_configuration_parameters.role"], "frontend");

        controller.destroy(&handle).unwrap();
        assert_eq!(controller.state(&handle), LifecycleState::Absent);
        assert!(!controller.exists(&handle).unwrap());
        assert!(controller.read(&handle).unwrap().is_none());
        assert_eq!(platform.vm_count(), 0);
        // folders are never removed implicitly
        assert!(platform.folder_exists("dc1", "team"));
    }

    #[test]
    fn test_create_rejects_existing_name() {
        let (platform, controller) = setup();
        let handle = controller.create(&spec()).unwrap();
        assert!(matches!(controller.create(&spec()), Err(Error::InvalidState { .. })));

        // a second controller has no tracked state but still sees the machine
        let other = LifecycleController::new(platform, fast());
        assert!(matches!(other.create(&spec()), Err(Error::Config(_))));
        controller.destroy(&handle).unwrap();
    }

    #[test]
    fn test_find_versus_exists() {
        let (_, controller) = setup();
        controller.create(&spec()).unwrap();

        assert!(controller.find(None, Some("team"), "web").unwrap().is_some());
        assert!(controller.find(None, None, "web").unwrap().is_none());
        assert!(matches!(
            controller.find(None, Some("missing"), "web"),
            Err(Error::NotFound { kind: ObjectKind::Folder, .. })
        ));
        let stray = VirtualMachineHandle::new("web", "dc1", Some("missing".into()));
        assert!(!controller.exists(&stray).unwrap());
    }

    #[test]
    fn test_partial_failure_then_resume() {
        let (platform, controller) = setup();
        platform.fail_next_task(Operation::PowerOn, "no compatible host");

        let err = controller.create(&spec()).unwrap_err();
        let handle = err.handle().cloned().unwrap();
        assert_eq!(controller.state(&handle), LifecycleState::Configuring);
        assert!(matches!(controller.read(&handle), Err(Error::InvalidState { .. })));

        controller.resume(&handle, &spec()).unwrap();
        assert_eq!(controller.state(&handle), LifecycleState::Ready);
        assert_eq!(platform.vm_count(), 1);
    }

    #[test]
    fn test_drift_and_update() {
        let (platform, controller) = setup();
        let handle = controller.create(&spec()).unwrap();
        assert!(controller.drift(&handle, &spec()).unwrap().is_empty());

        let mut changed = spec();
        changed.vcpu = 4;
        changed.disks.push(DiskSpec::sized(5));
        changed.metadata.clear();
        changed.metadata.insert("tier".into(), "web".into());

        let drift = controller.drift(&handle, &changed).unwrap();
        assert!(drift.contains(&Drift::Vcpu { expected: 4, actual: 2 }));
        assert!(drift.contains(&Drift::DiskCount { expected: 2, actual: 1 }));
        assert!(drift.contains(&Drift::MetadataMissing { key: "tier".into() }));

        controller.update(&handle, &changed).unwrap();
        assert!(controller.drift(&handle, &changed).unwrap().is_empty());
        let props = platform.vm_by_name("web").unwrap();
        assert_eq!(props.num_cpus, 4);
        assert_eq!(props.power_state, PowerState::PoweredOn);
        assert!(!props.extra_config.contains_key("role"));
    }

    #[test]
    fn test_update_rejects_rename() {
        let (_, controller) = setup();
        let handle = controller.create(&spec()).unwrap();
        let mut renamed = spec();
        renamed.name = "api".into();
        assert!(matches!(controller.update(&handle, &renamed), Err(Error::Config(_))));
    }
}
