//! In-process inventory implementing [`Platform`]
//!
//! Models just enough vSphere behaviour to drive the engine end to end:
//! folder trees, templates with snapshots, clone/create/reconfigure tasks,
//! power state rules and guest customization. Faults can be injected per
//! operation to exercise error paths.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

use super::{
    CloneSpec, ConfigSpec, CreateSpec, CustomizationStatus, DeviceChange, DiskInfo, DiskMoveType,
    GuestCustomization, NicInfo, ObjectKind, ObjectRef, Platform, PlatformResult, PowerState,
    TaskRef, TaskState, VmProperties,
};
use crate::error::PlatformError;
use crate::models::gb_to_kb;

/// Operations that can be made to fail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Clone,
    Create,
    Reconfigure,
    Customize,
    PowerOn,
    PowerOff,
    Destroy,
    CreateFolder,
    DestroyFolder,
}

#[derive(Debug, Clone)]
enum Fault {
    /// The call itself returns an error
    Immediate(PlatformError),
    /// The call returns a task that ends in error, with no effect
    Task(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateSeed {
    pub name: String,
    #[serde(default)]
    pub folder: Option<String>,
    #[serde(default = "default_cpus")]
    pub num_cpus: u32,
    #[serde(default = "default_memory")]
    pub memory_mb: u64,
    /// Disk sizes in GB, in unit order
    #[serde(default = "default_disks")]
    pub disks_gb: Vec<u64>,
    #[serde(default)]
    pub thin: bool,
    #[serde(default)]
    pub networks: Vec<String>,
    /// Snapshot names in creation order; the last one is current
    #[serde(default)]
    pub snapshots: Vec<String>,
}

fn default_cpus() -> u32 {
    1
}

fn default_memory() -> u64 {
    1024
}

fn default_disks() -> Vec<u64> {
    vec![20]
}

impl TemplateSeed {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            folder: None,
            num_cpus: default_cpus(),
            memory_mb: default_memory(),
            disks_gb: default_disks(),
            thin: false,
            networks: Vec::new(),
            snapshots: Vec::new(),
        }
    }

    pub fn snapshot(mut self, name: impl Into<String>) -> Self {
        self.snapshots.push(name.into());
        self
    }

    pub fn network(mut self, name: impl Into<String>) -> Self {
        self.networks.push(name.into());
        self
    }

    pub fn disks_gb(mut self, disks: Vec<u64>) -> Self {
        self.disks_gb = disks;
        self
    }

    pub fn in_folder(mut self, folder: impl Into<String>) -> Self {
        self.folder = Some(folder.into());
        self
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClusterSeed {
    pub name: String,
    #[serde(default)]
    pub resource_pools: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DatacenterSeed {
    pub name: String,
    #[serde(default)]
    pub clusters: Vec<ClusterSeed>,
    #[serde(default)]
    pub datastores: Vec<String>,
    #[serde(default)]
    pub networks: Vec<String>,
    #[serde(default)]
    pub folders: Vec<String>,
    #[serde(default)]
    pub templates: Vec<TemplateSeed>,
}

impl DatacenterSeed {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn cluster(mut self, name: impl Into<String>, pools: &[&str]) -> Self {
        self.clusters.push(ClusterSeed {
            name: name.into(),
            resource_pools: pools.iter().map(|p| p.to_string()).collect(),
        });
        self
    }

    pub fn datastore(mut self, name: impl Into<String>) -> Self {
        self.datastores.push(name.into());
        self
    }

    pub fn network(mut self, name: impl Into<String>) -> Self {
        self.networks.push(name.into());
        self
    }

    pub fn folder(mut self, path: impl Into<String>) -> Self {
        self.folders.push(path.into());
        self
    }

    pub fn template(mut self, template: TemplateSeed) -> Self {
        self.templates.push(template);
        self
    }
}

/// Serializable description of a starting inventory
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InventorySeed {
    pub datacenters: Vec<DatacenterSeed>,
}

impl InventorySeed {
    pub fn datacenter(mut self, datacenter: DatacenterSeed) -> Self {
        self.datacenters.push(datacenter);
        self
    }
}

#[derive(Debug, Clone)]
struct Node {
    kind: ObjectKind,
    name: String,
    parent: Option<String>,
    datacenter: Option<String>,
}

#[derive(Debug, Clone)]
struct VmState {
    num_cpus: u32,
    memory_mb: u64,
    power: PowerState,
    template: bool,
    disks: Vec<DiskInfo>,
    nics: Vec<NicInfo>,
    extra_config: BTreeMap<String, String>,
    snapshots: Vec<String>,
    current_snapshot: Option<String>,
    customization: CustomizationStatus,
    pending_customization: Option<GuestCustomization>,
    /// Device keys are never reused after a NIC is removed
    next_nic_key: i32,
}

#[derive(Debug, Clone)]
struct TaskEntry {
    polls_remaining: u32,
    outcome: TaskState,
}

#[derive(Default)]
struct State {
    nodes: HashMap<String, Node>,
    vms: HashMap<String, VmState>,
    vm_folders: HashMap<String, String>,
    tasks: HashMap<String, TaskEntry>,
    faults: HashMap<Operation, Fault>,
    counter: u64,
    task_polls: u32,
    stall_customization: bool,
    folder_race: bool,
    mutations: u64,
}

impl State {
    fn next_id(&mut self, kind: ObjectKind) -> String {
        self.counter += 1;
        format!("{}-{}", kind.moref_prefix(), self.counter)
    }

    fn add_node(&mut self, kind: ObjectKind, name: &str, parent: Option<&str>, datacenter: Option<&str>) -> String {
        let id = self.next_id(kind);
        self.nodes.insert(
            id.clone(),
            Node {
                kind,
                name: name.to_string(),
                parent: parent.map(str::to_string),
                datacenter: datacenter.map(str::to_string),
            },
        );
        id
    }

    fn object_ref(&self, id: &str) -> PlatformResult<ObjectRef> {
        self.nodes
            .get(id)
            .map(|n| ObjectRef::new(n.kind, id, n.name.clone()))
            .ok_or_else(|| PlatformError::NotFound(id.to_string()))
    }

    fn child(&self, parent: &str, name: &str) -> Option<String> {
        self.nodes
            .iter()
            .find(|(_, n)| n.parent.as_deref() == Some(parent) && n.name == name)
            .map(|(id, _)| id.clone())
    }

    /// Path of `id` below its datacenter's VM folder, or below the datacenter
    fn relative_path(&self, id: &str) -> String {
        let mut segments = Vec::new();
        let mut current = Some(id.to_string());
        while let Some(cur) = current {
            let Some(node) = self.nodes.get(&cur) else { break };
            if node.kind == ObjectKind::Datacenter || self.vm_folders.values().any(|f| *f == cur) {
                break;
            }
            segments.push(node.name.clone());
            current = node.parent.clone();
        }
        segments.reverse();
        segments.join("/")
    }

    /// Ensure folder chain under a datacenter's VM folder (seeding only)
    fn seed_folder(&mut self, datacenter: &str, path: &str) -> String {
        let mut parent = self.vm_folders[datacenter].clone();
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            parent = match self.child(&parent, segment) {
                Some(id) => id,
                None => self.add_node(ObjectKind::Folder, segment, Some(&parent), Some(datacenter)),
            };
        }
        parent
    }

    fn vm(&self, id: &str) -> PlatformResult<&VmState> {
        self.vms.get(id).ok_or_else(|| PlatformError::NotFound(id.to_string()))
    }

    fn vm_mut(&mut self, id: &str) -> PlatformResult<&mut VmState> {
        self.vms.get_mut(id).ok_or_else(|| PlatformError::NotFound(id.to_string()))
    }

    fn next_mac(&mut self) -> String {
        self.counter += 1;
        format!("00:50:56:00:{:02x}:{:02x}", (self.counter >> 8) & 0xff, self.counter & 0xff)
    }

    fn network_name(&self, network: &ObjectRef) -> PlatformResult<String> {
        self.nodes
            .get(&network.id)
            .filter(|n| n.kind == ObjectKind::Network)
            .map(|n| n.name.clone())
            .ok_or_else(|| PlatformError::NotFound(network.name.clone()))
    }

    fn datastore_name(&self, datastore: &ObjectRef) -> PlatformResult<String> {
        self.nodes
            .get(&datastore.id)
            .filter(|n| n.kind == ObjectKind::Datastore)
            .map(|n| n.name.clone())
            .ok_or_else(|| PlatformError::NotFound(datastore.name.clone()))
    }

    fn take_fault(&mut self, op: Operation) -> Option<Fault> {
        self.faults.remove(&op)
    }

    fn task(&mut self, outcome: TaskState) -> TaskRef {
        self.counter += 1;
        let id = format!("task-{}", self.counter);
        self.tasks.insert(
            id.clone(),
            TaskEntry {
                polls_remaining: self.task_polls,
                outcome,
            },
        );
        TaskRef(id)
    }

    /// Run `effect` unless a fault is armed for `op`
    fn mutate<F>(&mut self, op: Operation, effect: F) -> PlatformResult<TaskRef>
    where
        F: FnOnce(&mut State) -> PlatformResult<Option<ObjectRef>>,
    {
        match self.take_fault(op) {
            Some(Fault::Immediate(err)) => return Err(err),
            Some(Fault::Task(message)) => return Ok(self.task(TaskState::Error(message))),
            None => {}
        }
        self.mutations += 1;
        let outcome = match effect(self) {
            Ok(result) => TaskState::Success(result),
            Err(PlatformError::Fault(message)) => TaskState::Error(message),
            Err(other) => return Err(other),
        };
        Ok(self.task(outcome))
    }

    fn unique_in_folder(&self, folder: &str, name: &str) -> PlatformResult<()> {
        if self.child(folder, name).is_some() {
            return Err(PlatformError::Fault(format!(
                "The name '{}' already exists.",
                name
            )));
        }
        Ok(())
    }

    fn apply_config(&mut self, vm_id: &str, spec: &ConfigSpec) -> PlatformResult<()> {
        let mut devices = Vec::new();
        for change in &spec.device_changes {
            devices.push(match change {
                DeviceChange::AddDisk(disk) | DeviceChange::EditDisk(disk) => {
                    let datastore = match disk.datastore {
                        Some(ref ds) => Some(self.datastore_name(ds)?),
                        None => None,
                    };
                    (change.clone(), datastore, None)
                }
                DeviceChange::AddNic { network } => (change.clone(), None, Some(self.network_name(network)?)),
                DeviceChange::RemoveNic { .. } => (change.clone(), None, None),
            });
        }
        let macs: Vec<String> = devices
            .iter()
            .filter(|(c, _, _)| matches!(c, DeviceChange::AddNic { .. }))
            .map(|_| self.next_mac())
            .collect();
        let mut macs = macs.into_iter();

        let vm = self.vm_mut(vm_id)?;
        let changes_hardware = spec.num_cpus.map_or(false, |c| c != vm.num_cpus)
            || spec.memory_mb.map_or(false, |m| m != vm.memory_mb);
        if changes_hardware && vm.power == PowerState::PoweredOn {
            return Err(PlatformError::Fault(
                "CPU and memory hot add are not enabled for this virtual machine".into(),
            ));
        }
        if let Some(cpus) = spec.num_cpus {
            vm.num_cpus = cpus;
        }
        if let Some(memory) = spec.memory_mb {
            vm.memory_mb = memory;
        }

        for (change, datastore, network) in devices {
            match change {
                DeviceChange::AddDisk(disk) => {
                    if vm.disks.iter().any(|d| d.unit_number == disk.unit_number) {
                        return Err(PlatformError::Fault(format!(
                            "SCSI unit {} is already in use",
                            disk.unit_number
                        )));
                    }
                    let key = 2000 + disk.unit_number;
                    let fallback = vm.disks.first().map(|d| d.datastore.clone()).unwrap_or_default();
                    vm.disks.push(DiskInfo {
                        key,
                        unit_number: disk.unit_number,
                        capacity_kb: disk.capacity_kb,
                        thin: disk.thin,
                        eager_scrub: disk.eager_scrub,
                        iops_limit: disk.iops_limit,
                        datastore: datastore.unwrap_or(fallback),
                    });
                    vm.disks.sort_by_key(|d| d.unit_number);
                }
                DeviceChange::EditDisk(disk) => {
                    let existing = vm
                        .disks
                        .iter_mut()
                        .find(|d| d.unit_number == disk.unit_number)
                        .ok_or_else(|| PlatformError::Fault(format!("no disk at SCSI unit {}", disk.unit_number)))?;
                    if disk.capacity_kb < existing.capacity_kb {
                        return Err(PlatformError::Fault("virtual disks cannot be shrunk".into()));
                    }
                    existing.capacity_kb = disk.capacity_kb;
                    existing.iops_limit = disk.iops_limit;
                }
                DeviceChange::AddNic { .. } => {
                    let key = vm.next_nic_key;
                    vm.next_nic_key += 1;
                    vm.nics.push(NicInfo {
                        key,
                        network: network.unwrap_or_default(),
                        mac_address: macs.next().unwrap_or_default(),
                        ip_addresses: Vec::new(),
                    });
                }
                DeviceChange::RemoveNic { key } => {
                    vm.nics.retain(|n| n.key != key);
                }
            }
        }

        for (key, value) in &spec.extra_config {
            if value.is_empty() {
                vm.extra_config.remove(key);
            } else {
                vm.extra_config.insert(key.clone(), value.clone());
            }
        }
        Ok(())
    }

    fn assign_guest_addresses(&mut self, vm_id: &str) {
        let base = self.counter;
        let stall = self.stall_customization;
        let Some(vm) = self.vms.get_mut(vm_id) else { return };

        if let Some(custom) = vm.pending_customization.take() {
            if stall {
                vm.pending_customization = Some(custom);
                vm.customization = CustomizationStatus::Pending;
                return;
            }
            for (nic, adapter) in vm.nics.iter_mut().zip(custom.adapters.iter()) {
                nic.ip_addresses.clear();
                if let Some(ref ipv4) = adapter.ipv4 {
                    nic.ip_addresses.push(ipv4.address.to_string());
                }
                if let Some(ref ipv6) = adapter.ipv6 {
                    nic.ip_addresses.push(ipv6.address.to_string());
                }
            }
            vm.customization = CustomizationStatus::Succeeded;
        }

        for (offset, nic) in vm.nics.iter_mut().enumerate() {
            if nic.ip_addresses.is_empty() {
                let host = 10 + (base + offset as u64) % 240;
                nic.ip_addresses.push(format!("192.168.100.{}", host));
            }
        }
    }
}

/// Thread-safe in-memory platform
pub struct InMemoryPlatform {
    state: RwLock<State>,
}

impl Default for InMemoryPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryPlatform {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(State::default()),
        }
    }

    pub fn from_seed(seed: &InventorySeed) -> Self {
        let platform = Self::new();
        {
            let mut state = platform.state.write();
            for dc in &seed.datacenters {
                let dc_id = state.add_node(ObjectKind::Datacenter, &dc.name, None, None);
                let vm_folder = state.add_node(ObjectKind::Folder, "vm", Some(&dc_id), Some(&dc_id));
                state.vm_folders.insert(dc_id.clone(), vm_folder);

                for cluster in &dc.clusters {
                    let cluster_id = state.add_node(ObjectKind::Cluster, &cluster.name, Some(&dc_id), Some(&dc_id));
                    let root = state.add_node(ObjectKind::ResourcePool, "Resources", Some(&cluster_id), Some(&dc_id));
                    for pool in &cluster.resource_pools {
                        state.add_node(ObjectKind::ResourcePool, pool, Some(&root), Some(&dc_id));
                    }
                }
                for ds in &dc.datastores {
                    state.add_node(ObjectKind::Datastore, ds, Some(&dc_id), Some(&dc_id));
                }
                for net in &dc.networks {
                    state.add_node(ObjectKind::Network, net, Some(&dc_id), Some(&dc_id));
                }
                for folder in &dc.folders {
                    state.seed_folder(&dc_id, folder);
                }
                for template in &dc.templates {
                    seed_template(&mut state, &dc_id, dc.datastores.first(), template);
                }
            }
        }
        platform
    }

    /// Make every task report `Running` this many times before finishing
    pub fn with_task_polls(self, polls: u32) -> Self {
        self.state.write().task_polls = polls;
        self
    }

    /// Fail the next call of `op` with `err`
    pub fn fail_next(&self, op: Operation, err: PlatformError) {
        self.state.write().faults.insert(op, Fault::Immediate(err));
    }

    /// Make the next task of `op` end in error
    pub fn fail_next_task(&self, op: Operation, message: impl Into<String>) {
        self.state.write().faults.insert(op, Fault::Task(message.into()));
    }

    /// Leave guest customization pending until stalling is turned off again.
    ///
    /// Turning it off finishes customizations pending on powered-on machines.
    pub fn stall_customization(&self, stall: bool) {
        let mut state = self.state.write();
        state.stall_customization = stall;
        if stall {
            return;
        }
        let pending: Vec<String> = state
            .vms
            .iter()
            .filter(|(_, vm)| vm.pending_customization.is_some() && vm.power == PowerState::PoweredOn)
            .map(|(id, _)| id.clone())
            .collect();
        for id in pending {
            state.assign_guest_addresses(&id);
        }
    }

    /// Tasks still waiting to be observed in a terminal state
    pub fn task_count(&self) -> usize {
        self.state.read().tasks.len()
    }

    /// The next folder creation loses a race against another client
    pub fn race_next_folder_creation(&self) {
        self.state.write().folder_race = true;
    }

    /// Number of successful mutating calls so far
    pub fn mutation_count(&self) -> u64 {
        self.state.read().mutations
    }

    pub fn vm_count(&self) -> usize {
        self.state.read().vms.values().filter(|vm| !vm.template).count()
    }

    /// Number of folders below every datacenter's VM folder
    pub fn folder_count(&self) -> usize {
        let state = self.state.read();
        state
            .nodes
            .iter()
            .filter(|(id, n)| n.kind == ObjectKind::Folder && !state.vm_folders.values().any(|f| f == *id))
            .count()
    }

    pub fn folder_exists(&self, datacenter: &str, path: &str) -> bool {
        let state = self.state.read();
        state.nodes.iter().any(|(id, n)| {
            n.kind == ObjectKind::Folder
                && n.datacenter
                    .as_ref()
                    .and_then(|dc| state.nodes.get(dc))
                    .map_or(false, |dc| dc.name == datacenter)
                && state.relative_path(id) == path.trim_matches('/')
        })
    }

    /// Properties of a non-template VM by name, anywhere in the inventory
    pub fn vm_by_name(&self, name: &str) -> Option<VmProperties> {
        let state = self.state.read();
        let id = state
            .nodes
            .iter()
            .find(|(id, n)| {
                n.kind == ObjectKind::VirtualMachine
                    && n.name == name
                    && state.vms.get(*id).map_or(false, |vm| !vm.template)
            })
            .map(|(id, _)| id.clone())?;
        properties(&state, &id).ok()
    }
}

fn seed_template(state: &mut State, dc_id: &str, datastore: Option<&String>, seed: &TemplateSeed) {
    let folder = state.seed_folder(dc_id, seed.folder.as_deref().unwrap_or(""));
    let vm_id = state.add_node(ObjectKind::VirtualMachine, &seed.name, Some(&folder), Some(dc_id));

    let mut snapshots = Vec::new();
    let mut parent = vm_id.clone();
    for name in &seed.snapshots {
        let snap = state.add_node(ObjectKind::Snapshot, name, Some(&parent), Some(dc_id));
        snapshots.push(snap.clone());
        parent = snap;
    }

    let mut unit = 0;
    let mut disks = Vec::new();
    for size in &seed.disks_gb {
        if unit == crate::models::SCSI_CONTROLLER_UNIT {
            unit += 1;
        }
        disks.push(DiskInfo {
            key: 2000 + unit,
            unit_number: unit,
            capacity_kb: gb_to_kb(*size).unwrap_or(u64::MAX),
            thin: seed.thin,
            eager_scrub: !seed.thin,
            iops_limit: None,
            datastore: datastore.cloned().unwrap_or_default(),
        });
        unit += 1;
    }

    let mut nics = Vec::new();
    for (i, network) in seed.networks.iter().enumerate() {
        let mac_address = state.next_mac();
        nics.push(NicInfo {
            key: 4000 + i as i32,
            network: network.clone(),
            mac_address,
            ip_addresses: Vec::new(),
        });
    }

    let next_nic_key = next_nic_key(&nics);
    state.vms.insert(
        vm_id,
        VmState {
            num_cpus: seed.num_cpus,
            memory_mb: seed.memory_mb,
            power: PowerState::PoweredOff,
            template: true,
            disks,
            nics,
            extra_config: BTreeMap::new(),
            current_snapshot: snapshots.last().cloned(),
            snapshots,
            customization: CustomizationStatus::Idle,
            pending_customization: None,
            next_nic_key,
        },
    );
}

fn next_nic_key(nics: &[NicInfo]) -> i32 {
    nics.iter().map(|n| n.key + 1).max().unwrap_or(4000)
}

fn properties(state: &State, id: &str) -> PlatformResult<VmProperties> {
    let node = state.nodes.get(id).ok_or_else(|| PlatformError::NotFound(id.to_string()))?;
    let vm = state.vm(id)?;
    Ok(VmProperties {
        name: node.name.clone(),
        num_cpus: vm.num_cpus,
        memory_mb: vm.memory_mb,
        power_state: vm.power,
        template: vm.template,
        disks: vm.disks.clone(),
        nics: vm.nics.clone(),
        extra_config: vm.extra_config.clone(),
    })
}

fn matches_path(path: &str, candidate: &str) -> bool {
    path == "*" || path == candidate
}

impl Platform for InMemoryPlatform {
    fn find_datacenters(&self, path: &str) -> PlatformResult<Vec<ObjectRef>> {
        let state = self.state.read();
        Ok(state
            .nodes
            .iter()
            .filter(|(_, n)| n.kind == ObjectKind::Datacenter && matches_path(path, &n.name))
            .map(|(id, n)| ObjectRef::new(n.kind, id.clone(), n.name.clone()))
            .collect())
    }

    fn find(&self, datacenter: &ObjectRef, kind: ObjectKind, path: &str) -> PlatformResult<Vec<ObjectRef>> {
        let state = self.state.read();
        if !state.nodes.contains_key(&datacenter.id) {
            return Err(PlatformError::NotFound(datacenter.name.clone()));
        }
        let path = path.trim_matches('/');
        let node_kind = match kind {
            ObjectKind::Template => ObjectKind::VirtualMachine,
            other => other,
        };

        let mut found: Vec<ObjectRef> = state
            .nodes
            .iter()
            .filter(|(_, n)| n.kind == node_kind && n.datacenter.as_deref() == Some(datacenter.id.as_str()))
            .filter(|(id, n)| match node_kind {
                ObjectKind::Folder => {
                    !state.vm_folders.values().any(|f| f == *id) && matches_path(path, &state.relative_path(id))
                }
                ObjectKind::VirtualMachine => {
                    matches_path(path, &n.name) || path == state.relative_path(id)
                }
                ObjectKind::ResourcePool => {
                    let full = state.relative_path(id);
                    match path.strip_prefix("*/") {
                        Some(rest) => full.split_once('/').map_or(false, |(_, tail)| tail == rest),
                        None => path == full || path == n.name,
                    }
                }
                _ => matches_path(path, &n.name),
            })
            .map(|(id, n)| ObjectRef::new(kind, id.clone(), n.name.clone()))
            .collect();
        found.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(found)
    }

    fn vm_folder(&self, datacenter: &ObjectRef) -> PlatformResult<ObjectRef> {
        let state = self.state.read();
        let id = state
            .vm_folders
            .get(&datacenter.id)
            .ok_or_else(|| PlatformError::NotFound(datacenter.name.clone()))?;
        state.object_ref(id)
    }

    fn find_child(&self, folder: &ObjectRef, name: &str) -> PlatformResult<Option<ObjectRef>> {
        let state = self.state.read();
        if !state.nodes.contains_key(&folder.id) {
            return Err(PlatformError::NotFound(folder.name.clone()));
        }
        match state.child(&folder.id, name) {
            Some(id) => Ok(Some(state.object_ref(&id)?)),
            None => Ok(None),
        }
    }

    fn folder_children(&self, folder: &ObjectRef) -> PlatformResult<Vec<ObjectRef>> {
        let state = self.state.read();
        if !state.nodes.contains_key(&folder.id) {
            return Err(PlatformError::NotFound(folder.name.clone()));
        }
        Ok(state
            .nodes
            .iter()
            .filter(|(_, n)| n.parent.as_deref() == Some(folder.id.as_str()))
            .map(|(id, n)| ObjectRef::new(n.kind, id.clone(), n.name.clone()))
            .collect())
    }

    fn create_folder(&self, parent: &ObjectRef, name: &str) -> PlatformResult<ObjectRef> {
        let mut state = self.state.write();
        let parent_node = state
            .nodes
            .get(&parent.id)
            .cloned()
            .ok_or_else(|| PlatformError::NotFound(parent.name.clone()))?;

        if state.folder_race {
            state.folder_race = false;
            if state.child(&parent.id, name).is_none() {
                state.add_node(ObjectKind::Folder, name, Some(&parent.id), parent_node.datacenter.as_deref());
            }
            return Err(PlatformError::AlreadyExists(name.to_string()));
        }
        if let Some(Fault::Immediate(err)) = state.take_fault(Operation::CreateFolder) {
            return Err(err);
        }
        if state.child(&parent.id, name).is_some() {
            return Err(PlatformError::AlreadyExists(name.to_string()));
        }

        state.mutations += 1;
        let id = state.add_node(ObjectKind::Folder, name, Some(&parent.id), parent_node.datacenter.as_deref());
        state.object_ref(&id)
    }

    fn destroy_folder(&self, folder: &ObjectRef) -> PlatformResult<()> {
        let mut state = self.state.write();
        if let Some(Fault::Immediate(err)) = state.take_fault(Operation::DestroyFolder) {
            return Err(err);
        }
        if !state.nodes.contains_key(&folder.id) {
            return Err(PlatformError::NotFound(folder.name.clone()));
        }
        if state.nodes.values().any(|n| n.parent.as_deref() == Some(folder.id.as_str())) {
            return Err(PlatformError::Fault(format!("folder '{}' is not empty", folder.name)));
        }
        state.mutations += 1;
        state.nodes.remove(&folder.id);
        Ok(())
    }

    fn snapshots(&self, vm: &ObjectRef) -> PlatformResult<Vec<ObjectRef>> {
        let state = self.state.read();
        let vm_state = state.vm(&vm.id)?;
        vm_state.snapshots.iter().map(|id| state.object_ref(id)).collect()
    }

    fn current_snapshot(&self, vm: &ObjectRef) -> PlatformResult<Option<ObjectRef>> {
        let state = self.state.read();
        let vm_state = state.vm(&vm.id)?;
        match vm_state.current_snapshot {
            Some(ref id) => Ok(Some(state.object_ref(id)?)),
            None => Ok(None),
        }
    }

    fn vm_properties(&self, vm: &ObjectRef) -> PlatformResult<VmProperties> {
        properties(&self.state.read(), &vm.id)
    }

    fn clone_vm(&self, template: &ObjectRef, spec: &CloneSpec) -> PlatformResult<TaskRef> {
        let mut state = self.state.write();
        let source = state.vm(&template.id)?.clone();
        let datastore = state.datastore_name(&spec.location.datastore)?;
        if !state.nodes.contains_key(&spec.location.resource_pool.id) {
            return Err(PlatformError::NotFound(spec.location.resource_pool.name.clone()));
        }
        let folder_node = state
            .nodes
            .get(&spec.folder.id)
            .cloned()
            .ok_or_else(|| PlatformError::NotFound(spec.folder.name.clone()))?;

        state.mutate(Operation::Clone, |state| {
            if let Some(ref snapshot) = spec.snapshot {
                if !source.snapshots.contains(&snapshot.id) {
                    return Err(PlatformError::Fault(format!(
                        "snapshot '{}' does not belong to '{}'",
                        snapshot.name, template.name
                    )));
                }
            }
            let linked = spec.location.disk_move_type == DiskMoveType::CreateNewChildDiskBacking;
            if linked && spec.snapshot.is_none() {
                return Err(PlatformError::Fault("linked clones require a snapshot".into()));
            }
            state.unique_in_folder(&spec.folder.id, &spec.name)?;

            let vm_id = state.add_node(
                ObjectKind::VirtualMachine,
                &spec.name,
                Some(&spec.folder.id),
                folder_node.datacenter.as_deref(),
            );
            let mut nics = source.nics.clone();
            for nic in nics.iter_mut() {
                nic.mac_address = state.next_mac();
                nic.ip_addresses.clear();
            }
            let disks = source
                .disks
                .iter()
                .cloned()
                .map(|mut d| {
                    d.datastore = datastore.clone();
                    d.thin = d.thin || linked;
                    d
                })
                .collect();
            state.vms.insert(
                vm_id.clone(),
                VmState {
                    num_cpus: source.num_cpus,
                    memory_mb: source.memory_mb,
                    power: PowerState::PoweredOff,
                    template: false,
                    disks,
                    nics,
                    extra_config: source.extra_config.clone(),
                    snapshots: Vec::new(),
                    current_snapshot: None,
                    customization: CustomizationStatus::Idle,
                    pending_customization: None,
                    next_nic_key: source.next_nic_key,
                },
            );
            if spec.power_on {
                if let Some(vm) = state.vms.get_mut(&vm_id) {
                    vm.power = PowerState::PoweredOn;
                }
                state.assign_guest_addresses(&vm_id);
            }
            Ok(Some(state.object_ref(&vm_id)?))
        })
    }

    fn create_vm(&self, spec: &CreateSpec) -> PlatformResult<TaskRef> {
        let mut state = self.state.write();
        let folder_node = state
            .nodes
            .get(&spec.folder.id)
            .cloned()
            .ok_or_else(|| PlatformError::NotFound(spec.folder.name.clone()))?;
        let datastore = state.datastore_name(&spec.datastore)?;
        if !state.nodes.contains_key(&spec.resource_pool.id) {
            return Err(PlatformError::NotFound(spec.resource_pool.name.clone()));
        }

        state.mutate(Operation::Create, |state| {
            state.unique_in_folder(&spec.folder.id, &spec.name)?;
            let vm_id = state.add_node(
                ObjectKind::VirtualMachine,
                &spec.name,
                Some(&spec.folder.id),
                folder_node.datacenter.as_deref(),
            );
            state.vms.insert(
                vm_id.clone(),
                VmState {
                    num_cpus: 1,
                    memory_mb: 1024,
                    power: PowerState::PoweredOff,
                    template: false,
                    disks: Vec::new(),
                    nics: Vec::new(),
                    extra_config: BTreeMap::new(),
                    snapshots: Vec::new(),
                    current_snapshot: None,
                    customization: CustomizationStatus::Idle,
                    pending_customization: None,
                    next_nic_key: 4000,
                },
            );
            if let Err(err) = state.apply_config(&vm_id, &spec.config) {
                state.vms.remove(&vm_id);
                state.nodes.remove(&vm_id);
                return Err(err);
            }
            if let Some(vm) = state.vms.get_mut(&vm_id) {
                for disk in vm.disks.iter_mut().filter(|d| d.datastore.is_empty()) {
                    disk.datastore = datastore.clone();
                }
            }
            Ok(Some(state.object_ref(&vm_id)?))
        })
    }

    fn reconfigure_vm(&self, vm: &ObjectRef, spec: &ConfigSpec) -> PlatformResult<TaskRef> {
        let mut state = self.state.write();
        state.vm(&vm.id)?;
        state.mutate(Operation::Reconfigure, |state| {
            state.apply_config(&vm.id, spec)?;
            Ok(None)
        })
    }

    fn customize_vm(&self, vm: &ObjectRef, spec: &GuestCustomization) -> PlatformResult<TaskRef> {
        let mut state = self.state.write();
        if state.vm(&vm.id)?.power != PowerState::PoweredOff {
            return Err(PlatformError::InvalidPowerState(
                "customization requires the virtual machine to be powered off".into(),
            ));
        }
        state.mutate(Operation::Customize, |state| {
            let target = state.vm_mut(&vm.id)?;
            if spec.adapters.len() != target.nics.len() {
                return Err(PlatformError::Fault(format!(
                    "customization lists {} adapters but the virtual machine has {}",
                    spec.adapters.len(),
                    target.nics.len()
                )));
            }
            target.pending_customization = Some(spec.clone());
            target.customization = CustomizationStatus::Pending;
            Ok(None)
        })
    }

    fn customization_status(&self, vm: &ObjectRef) -> PlatformResult<CustomizationStatus> {
        Ok(self.state.read().vm(&vm.id)?.customization.clone())
    }

    fn power_on(&self, vm: &ObjectRef) -> PlatformResult<TaskRef> {
        let mut state = self.state.write();
        let current = state.vm(&vm.id)?;
        if current.template {
            return Err(PlatformError::Fault("templates cannot be powered on".into()));
        }
        if current.power == PowerState::PoweredOn {
            return Err(PlatformError::InvalidPowerState("already powered on".into()));
        }
        state.mutate(Operation::PowerOn, |state| {
            state.vm_mut(&vm.id)?.power = PowerState::PoweredOn;
            state.assign_guest_addresses(&vm.id);
            Ok(None)
        })
    }

    fn power_off(&self, vm: &ObjectRef) -> PlatformResult<TaskRef> {
        let mut state = self.state.write();
        if state.vm(&vm.id)?.power == PowerState::PoweredOff {
            return Err(PlatformError::InvalidPowerState("already powered off".into()));
        }
        state.mutate(Operation::PowerOff, |state| {
            state.vm_mut(&vm.id)?.power = PowerState::PoweredOff;
            Ok(None)
        })
    }

    fn destroy_vm(&self, vm: &ObjectRef) -> PlatformResult<TaskRef> {
        let mut state = self.state.write();
        if state.vm(&vm.id)?.power == PowerState::PoweredOn {
            return Err(PlatformError::InvalidPowerState(
                "virtual machine must be powered off before it is destroyed".into(),
            ));
        }
        state.mutate(Operation::Destroy, |state| {
            state.vms.remove(&vm.id);
            state.nodes.remove(&vm.id);
            Ok(None)
        })
    }

    fn task_state(&self, task: &TaskRef) -> PlatformResult<TaskState> {
        let mut state = self.state.write();
        let entry = state
            .tasks
            .get_mut(&task.0)
            .ok_or_else(|| PlatformError::NotFound(task.0.clone()))?;
        if entry.polls_remaining > 0 {
            entry.polls_remaining -= 1;
            return Ok(TaskState::Running);
        }
        let outcome = entry.outcome.clone();
        if matches!(outcome, TaskState::Success(_) | TaskState::Error(_)) {
            state.tasks.remove(&task.0);
        }
        Ok(outcome)
    }
}
