//! Remote virtualization platform seam
//!
//! Everything the provisioning engine needs from a vSphere client is expressed
//! by the [`Platform`] trait: finder-style lookups, folder and VM mutations,
//! power operations and task polling. Long-running operations return a
//! [`TaskRef`] that callers await with [`task::wait_for_task`].

pub mod memory;
pub mod task;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::PlatformError;
use crate::models::{Ipv4Config, Ipv6Config};

pub use memory::InMemoryPlatform;
pub use task::{poll_until, wait_for_task, PollSettings};

pub type PlatformResult<T> = std::result::Result<T, PlatformError>;

/// Inventory object types the engine resolves
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectKind {
    Datacenter,
    Folder,
    Cluster,
    ResourcePool,
    Datastore,
    Network,
    Template,
    VirtualMachine,
    Snapshot,
}

impl ObjectKind {
    /// Managed object id prefix, as vSphere prints them
    pub fn moref_prefix(&self) -> &'static str {
        match self {
            ObjectKind::Datacenter => "datacenter",
            ObjectKind::Folder => "group",
            ObjectKind::Cluster => "domain",
            ObjectKind::ResourcePool => "resgroup",
            ObjectKind::Datastore => "datastore",
            ObjectKind::Network => "network",
            ObjectKind::Template | ObjectKind::VirtualMachine => "vm",
            ObjectKind::Snapshot => "snapshot",
        }
    }
}

impl std::fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ObjectKind::Datacenter => write!(f, "datacenter"),
            ObjectKind::Folder => write!(f, "folder"),
            ObjectKind::Cluster => write!(f, "cluster"),
            ObjectKind::ResourcePool => write!(f, "resource pool"),
            ObjectKind::Datastore => write!(f, "datastore"),
            ObjectKind::Network => write!(f, "network"),
            ObjectKind::Template => write!(f, "template"),
            ObjectKind::VirtualMachine => write!(f, "virtual machine"),
            ObjectKind::Snapshot => write!(f, "snapshot"),
        }
    }
}

/// Reference to a remote inventory object
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectRef {
    pub kind: ObjectKind,
    pub id: String,
    pub name: String,
}

impl ObjectRef {
    pub fn new(kind: ObjectKind, id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
            name: name.into(),
        }
    }
}

impl std::fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} '{}' ({})", self.kind, self.name, self.id)
    }
}

/// Handle to a long-running remote task
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskRef(pub String);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskState {
    Queued,
    Running,
    /// Finished; carries the created object when the task produces one
    Success(Option<ObjectRef>),
    Error(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PowerState {
    PoweredOn,
    PoweredOff,
    Suspended,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CustomizationStatus {
    /// No customization was issued for this VM
    Idle,
    Pending,
    Succeeded,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskInfo {
    pub key: i32,
    pub unit_number: i32,
    pub capacity_kb: u64,
    pub thin: bool,
    pub eager_scrub: bool,
    pub iops_limit: Option<i64>,
    pub datastore: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NicInfo {
    pub key: i32,
    pub network: String,
    pub mac_address: String,
    pub ip_addresses: Vec<String>,
}

/// Properties collected from a virtual machine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmProperties {
    pub name: String,
    pub num_cpus: u32,
    pub memory_mb: u64,
    pub power_state: PowerState,
    pub template: bool,
    pub disks: Vec<DiskInfo>,
    pub nics: Vec<NicInfo>,
    pub extra_config: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskChange {
    pub unit_number: i32,
    pub capacity_kb: u64,
    pub thin: bool,
    pub eager_scrub: bool,
    pub iops_limit: Option<i64>,
    pub datastore: Option<ObjectRef>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceChange {
    AddDisk(DiskChange),
    EditDisk(DiskChange),
    AddNic { network: ObjectRef },
    RemoveNic { key: i32 },
}

/// Reconfigure request. Unset fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigSpec {
    pub num_cpus: Option<u32>,
    pub memory_mb: Option<u64>,
    pub device_changes: Vec<DeviceChange>,
    /// An empty value removes the key
    pub extra_config: BTreeMap<String, String>,
}

impl ConfigSpec {
    pub fn is_empty(&self) -> bool {
        self.num_cpus.is_none()
            && self.memory_mb.is_none()
            && self.device_changes.is_empty()
            && self.extra_config.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DiskMoveType {
    MoveAllDiskBackingsAndDisallowSharing,
    CreateNewChildDiskBacking,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelocateSpec {
    pub resource_pool: ObjectRef,
    pub datastore: ObjectRef,
    pub disk_move_type: DiskMoveType,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloneSpec {
    pub name: String,
    pub folder: ObjectRef,
    pub location: RelocateSpec,
    pub snapshot: Option<ObjectRef>,
    pub power_on: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateSpec {
    pub name: String,
    pub folder: ObjectRef,
    pub resource_pool: ObjectRef,
    pub datastore: ObjectRef,
    pub config: ConfigSpec,
}

/// Per-adapter static settings; `None` on both sides means DHCP
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterMapping {
    pub ipv4: Option<Ipv4Config>,
    pub ipv6: Option<Ipv6Config>,
}

/// In-guest customization request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuestCustomization {
    pub host_name: String,
    pub domain: String,
    pub time_zone: String,
    pub dns_servers: Vec<String>,
    pub dns_suffixes: Vec<String>,
    pub adapters: Vec<AdapterMapping>,
}

/// Client of the remote virtualization platform.
///
/// Lookups never mutate the inventory. Paths passed to [`Platform::find`] are
/// relative to the datacenter; `"*"` matches every object of the kind, and
/// folder paths are relative to the datacenter's VM folder.
#[cfg_attr(test, mockall::automock)]
pub trait Platform: Send + Sync {
    fn find_datacenters(&self, path: &str) -> PlatformResult<Vec<ObjectRef>>;

    fn find(&self, datacenter: &ObjectRef, kind: ObjectKind, path: &str) -> PlatformResult<Vec<ObjectRef>>;

    /// Root folder for virtual machines in a datacenter
    fn vm_folder(&self, datacenter: &ObjectRef) -> PlatformResult<ObjectRef>;

    /// Direct child of `folder` named `name`, if any
    fn find_child(&self, folder: &ObjectRef, name: &str) -> PlatformResult<Option<ObjectRef>>;

    fn folder_children(&self, folder: &ObjectRef) -> PlatformResult<Vec<ObjectRef>>;

    fn create_folder(&self, parent: &ObjectRef, name: &str) -> PlatformResult<ObjectRef>;

    fn destroy_folder(&self, folder: &ObjectRef) -> PlatformResult<()>;

    fn snapshots(&self, vm: &ObjectRef) -> PlatformResult<Vec<ObjectRef>>;

    fn current_snapshot(&self, vm: &ObjectRef) -> PlatformResult<Option<ObjectRef>>;

    fn vm_properties(&self, vm: &ObjectRef) -> PlatformResult<VmProperties>;

    fn clone_vm(&self, template: &ObjectRef, spec: &CloneSpec) -> PlatformResult<TaskRef>;

    fn create_vm(&self, spec: &CreateSpec) -> PlatformResult<TaskRef>;

    fn reconfigure_vm(&self, vm: &ObjectRef, spec: &ConfigSpec) -> PlatformResult<TaskRef>;

    fn customize_vm(&self, vm: &ObjectRef, spec: &GuestCustomization) -> PlatformResult<TaskRef>;

    fn customization_status(&self, vm: &ObjectRef) -> PlatformResult<CustomizationStatus>;

    fn power_on(&self, vm: &ObjectRef) -> PlatformResult<TaskRef>;

    fn power_off(&self, vm: &ObjectRef) -> PlatformResult<TaskRef>;

    fn destroy_vm(&self, vm: &ObjectRef) -> PlatformResult<TaskRef>;

    fn task_state(&self, task: &TaskRef) -> PlatformResult<TaskState>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_kind_display() {
        assert_eq!(ObjectKind::ResourcePool.to_string(), "resource pool");
        assert_eq!(ObjectKind::Template.moref_prefix(), "vm");
    }

    #[test]
    fn test_config_spec_is_empty() {
        let mut spec = ConfigSpec::default();
        assert!(spec.is_empty());
        spec.extra_config.insert("foo".into(), "bar".into());
        assert!(!spec.is_empty());
    }
}
