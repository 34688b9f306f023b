//! Virtual machine specification with builder pattern

use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;

use crate::models::{
    CustomizationSettings, DiskSpec, Metadata, MetadataValue, NetworkInterfaceSpec, SourceSpec,
    MAX_DISK_SIZE_GB,
};

/// Desired state of one virtual machine resource
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VirtualMachineSpec {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub datacenter: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_pool: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub datastore: Option<String>,
    /// Folder path below the datacenter's VM folder; root when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub folder: Option<String>,
    pub vcpu: u32,
    pub memory_mb: u64,
    /// Legacy IPv4 gateway for static interfaces that declare none
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway: Option<Ipv4Addr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<SourceSpec>,
    #[serde(default)]
    pub disks: Vec<DiskSpec>,
    #[serde(default)]
    pub network_interfaces: Vec<NetworkInterfaceSpec>,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default)]
    pub customization: CustomizationSettings,
}

impl Default for VirtualMachineSpec {
    fn default() -> Self {
        Self {
            name: String::new(),
            datacenter: None,
            cluster: None,
            resource_pool: None,
            datastore: None,
            folder: None,
            vcpu: 2,
            memory_mb: 4096,
            gateway: None,
            source: None,
            disks: Vec::new(),
            network_interfaces: Vec::new(),
            metadata: Metadata::new(),
            customization: CustomizationSettings::default(),
        }
    }
}

impl VirtualMachineSpec {
    pub fn builder() -> VirtualMachineSpecBuilder {
        VirtualMachineSpecBuilder::default()
    }

    pub fn validate(&self) -> crate::Result<()> {
        if self.name.is_empty() {
            return Err(crate::Error::Config("name cannot be empty".into()));
        }
        if self.vcpu < 1 {
            return Err(crate::Error::Config("vcpu must be at least 1".into()));
        }
        if self.memory_mb < 1 {
            return Err(crate::Error::Config("memory must be at least 1MB".into()));
        }
        if let Some(ref folder) = self.folder {
            let trimmed = folder.trim_matches('/');
            if !trimmed.is_empty() && trimmed.split('/').any(|segment| segment.is_empty()) {
                return Err(crate::Error::Config(format!("invalid folder path '{}'", folder)));
            }
        }

        let template_disk = self.disks.first().map(|d| d.is_template()).unwrap_or(false);
        match (&self.source, template_disk) {
            (Some(source), true) => {
                if source.template.is_empty() {
                    return Err(crate::Error::Config("template label cannot be empty".into()));
                }
                if let Some(name) = source.snapshot.as_ref().and_then(|s| s.name()) {
                    if name.is_empty() {
                        return Err(crate::Error::Config("snapshot name cannot be empty".into()));
                    }
                }
            }
            (Some(_), false) => {
                return Err(crate::Error::Config(
                    "a cloned virtual machine needs a template disk at index 0".into(),
                ));
            }
            (None, true) => {
                return Err(crate::Error::Config(
                    "disk 0 is a template disk but no template is declared".into(),
                ));
            }
            (None, false) => {}
        }

        for (index, disk) in self.disks.iter().enumerate() {
            if index > 0 && disk.is_template() {
                return Err(crate::Error::Config(format!(
                    "disk {} cannot come from a template, only disk 0 can",
                    index
                )));
            }
            if disk.size_gb() == Some(0) {
                return Err(crate::Error::Config(format!("disk {} size must be at least 1GB", index)));
            }
            if disk.size_gb().map_or(false, |size| size > MAX_DISK_SIZE_GB) {
                return Err(crate::Error::Config(format!(
                    "disk {} size exceeds the {}GB maximum",
                    index, MAX_DISK_SIZE_GB
                )));
            }
            if disk.iops == Some(0) {
                return Err(crate::Error::Config(format!("disk {} iops must be positive", index)));
            }
        }

        for nic in &self.network_interfaces {
            nic.validate()?;
        }

        if self.metadata.keys().any(|k| k.is_empty()) {
            return Err(crate::Error::Config("custom configuration keys cannot be empty".into()));
        }

        Ok(())
    }

    /// Folder path with surrounding slashes removed
    pub fn folder_path(&self) -> Option<&str> {
        self.folder
            .as_deref()
            .map(|f| f.trim_matches('/'))
            .filter(|f| !f.is_empty())
    }

    /// Interfaces with the legacy top-level gateway folded in
    pub fn resolved_interfaces(&self) -> Vec<NetworkInterfaceSpec> {
        self.network_interfaces
            .iter()
            .cloned()
            .map(|mut nic| {
                if let (Some(gateway), Some(ipv4)) = (self.gateway, nic.ipv4.as_mut()) {
                    if ipv4.gateway.is_none() {
                        ipv4.gateway = Some(gateway);
                    }
                }
                nic
            })
            .collect()
    }

    /// Whether creation needs an in-guest customization pass
    pub fn needs_customization(&self) -> bool {
        !self.customization.skip
            && self
                .network_interfaces
                .iter()
                .any(|nic| nic.addressing_mode().is_static())
    }
}

#[derive(Default)]
pub struct VirtualMachineSpecBuilder {
    spec: VirtualMachineSpec,
}

impl VirtualMachineSpecBuilder {
    /// Virtual machine name, unique within its folder
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.spec.name = name.into();
        self
    }

    /// Datacenter to place the machine in. Falls back to the controller default.
    pub fn datacenter(mut self, datacenter: impl Into<String>) -> Self {
        self.spec.datacenter = Some(datacenter.into());
        self
    }

    /// Compute cluster whose root resource pool hosts the machine
    pub fn cluster(mut self, cluster: impl Into<String>) -> Self {
        self.spec.cluster = Some(cluster.into());
        self
    }

    /// Resource pool path, relative to the cluster when one is set
    pub fn resource_pool(mut self, pool: impl Into<String>) -> Self {
        self.spec.resource_pool = Some(pool.into());
        self
    }

    /// Datastore for the machine files and any disk that does not name its own
    pub fn datastore(mut self, datastore: impl Into<String>) -> Self {
        self.spec.datastore = Some(datastore.into());
        self
    }

    /// VM folder path; missing segments are created on first use
    pub fn folder(mut self, folder: impl Into<String>) -> Self {
        self.spec.folder = Some(folder.into());
        self
    }

    pub fn vcpu(mut self, count: u32) -> Self {
        self.spec.vcpu = count;
        self
    }

    /// Memory in megabytes
    pub fn memory_mb(mut self, mb: u64) -> Self {
        self.spec.memory_mb = mb;
        self
    }

    /// Legacy top-level IPv4 gateway.
    ///
    /// Applies to every static IPv4 interface that does not set its own.
    pub fn gateway(mut self, gateway: Ipv4Addr) -> Self {
        self.spec.gateway = Some(gateway);
        self
    }

    /// Clone from a template instead of creating a bare machine
    pub fn source(mut self, source: SourceSpec) -> Self {
        self.spec.source = Some(source);
        self
    }

    /// Append a disk. Only the first may come from the template.
    pub fn disk(mut self, disk: DiskSpec) -> Self {
        self.spec.disks.push(disk);
        self
    }

    /// Append a network interface; order matches device order on the machine
    pub fn network_interface(mut self, nic: NetworkInterfaceSpec) -> Self {
        self.spec.network_interfaces.push(nic);
        self
    }

    /// Set a custom configuration key. Values are stored as strings.
    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<MetadataValue>) -> Self {
        self.spec.metadata.insert(key.into(), value.into());
        self
    }

    pub fn customization(mut self, settings: CustomizationSettings) -> Self {
        self.spec.customization = settings;
        self
    }

    /// Finish without validating; [`VirtualMachineSpec::validate`] runs on create
    pub fn build(self) -> VirtualMachineSpec {
        self.spec
    }

    /// Finish and validate in one step
    pub fn build_validated(self) -> crate::Result<VirtualMachineSpec> {
        let spec = self.build();
        spec.validate()?;
        Ok(spec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DiskType;

    fn cloned() -> VirtualMachineSpecBuilder {
        VirtualMachineSpec::builder()
            .name("terraform-test")
            .source(SourceSpec::full("tmpl"))
            .disk(DiskSpec::from_template())
    }

    #[test]
    fn test_spec_builder() {
        let spec = cloned()
            .vcpu(4)
            .memory_mb(8192)
            .folder("team/app")
            .disk(DiskSpec::sized(30).disk_type(DiskType::Thin))
            .metadata("num", 42)
            .build();

        assert_eq!(spec.name, "terraform-test");
        assert_eq!(spec.vcpu, 4);
        assert_eq!(spec.memory_mb, 8192);
        assert_eq!(spec.disks.len(), 2);
        assert_eq!(spec.folder_path(), Some("team/app"));
        assert_eq!(spec.metadata["num"], MetadataValue::Integer(42));
    }

    #[test]
    fn test_spec_validation() {
        assert!(VirtualMachineSpec::builder().build().validate().is_err());
        assert!(cloned().vcpu(0).build().validate().is_err());
        assert!(cloned().memory_mb(0).build().validate().is_err());
        assert!(cloned().build().validate().is_ok());

        // template disk without a template
        let spec = VirtualMachineSpec::builder()
            .name("vm")
            .disk(DiskSpec::from_template())
            .build();
        assert!(spec.validate().is_err());

        // template declared but disk 0 is explicit
        let spec = VirtualMachineSpec::builder()
            .name("vm")
            .source(SourceSpec::full("tmpl"))
            .disk(DiskSpec::sized(10))
            .build();
        assert!(spec.validate().is_err());

        // template disk past index 0
        assert!(cloned().disk(DiskSpec::from_template()).build().validate().is_err());
        assert!(cloned().disk(DiskSpec::sized(0)).build().validate().is_err());
        assert!(cloned().disk(DiskSpec::sized(MAX_DISK_SIZE_GB)).build().validate().is_ok());
        assert!(matches!(
            cloned().disk(DiskSpec::sized(1 << 50)).build().validate(),
            Err(crate::Error::Config(_))
        ));
        assert!(cloned().folder("a//b").build().validate().is_err());
    }

    #[test]
    fn test_legacy_gateway_fills_missing() {
        let spec = cloned()
            .gateway(Ipv4Addr::new(10, 0, 0, 1))
            .network_interface(NetworkInterfaceSpec::dhcp("LAN").ipv4(Ipv4Addr::new(10, 0, 0, 5), 24))
            .network_interface(
                NetworkInterfaceSpec::dhcp("MGMT")
                    .ipv4(Ipv4Addr::new(10, 1, 0, 5), 24)
                    .ipv4_gateway(Ipv4Addr::new(10, 1, 0, 254)),
            )
            .network_interface(NetworkInterfaceSpec::dhcp("DHCP"))
            .build();

        let nics = spec.resolved_interfaces();
        assert_eq!(nics[0].ipv4.as_ref().unwrap().gateway, Some(Ipv4Addr::new(10, 0, 0, 1)));
        assert_eq!(nics[1].ipv4.as_ref().unwrap().gateway, Some(Ipv4Addr::new(10, 1, 0, 254)));
        assert!(nics[2].ipv4.is_none());
        assert!(spec.needs_customization());
    }

    #[test]
    fn test_spec_serialization() {
        let spec = cloned()
            .network_interface(NetworkInterfaceSpec::dhcp("LAN"))
            .metadata("foo", "bar")
            .build();

        let json = serde_json::to_string(&spec).unwrap();
        let deserialized: VirtualMachineSpec = serde_json::from_str(&json).unwrap();

        assert_eq!(deserialized, spec);
        assert!(!deserialized.needs_customization());
    }
}
