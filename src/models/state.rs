//! Observed state of a provisioned virtual machine

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use super::{kb_to_gb, DiskType};
use crate::controller::VirtualMachineHandle;
use crate::platform::{PowerState, VmProperties};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskState {
    pub unit_number: i32,
    pub size_gb: u64,
    pub disk_type: DiskType,
    pub iops: Option<u32>,
    pub datastore: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkInterfaceState {
    pub label: String,
    pub mac_address: String,
    pub ipv4_addresses: Vec<Ipv4Addr>,
    pub ipv6_addresses: Vec<Ipv6Addr>,
}

impl NetworkInterfaceState {
    pub fn has_address(&self) -> bool {
        !self.ipv4_addresses.is_empty() || !self.ipv6_addresses.is_empty()
    }
}

/// What a read returns for a virtual machine in the `Ready` state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VirtualMachineState {
    pub handle: VirtualMachineHandle,
    pub vcpu: u32,
    pub memory_mb: u64,
    pub power_state: PowerState,
    pub disks: Vec<DiskState>,
    pub network_interfaces: Vec<NetworkInterfaceState>,
    /// Extra configuration as stored, always string-valued
    pub extra_config: BTreeMap<String, String>,
}

impl VirtualMachineState {
    pub fn from_properties(handle: VirtualMachineHandle, props: &VmProperties) -> Self {
        let disks = props
            .disks
            .iter()
            .map(|disk| DiskState {
                unit_number: disk.unit_number,
                size_gb: kb_to_gb(disk.capacity_kb),
                disk_type: DiskType::from_backing(disk.thin, disk.eager_scrub),
                iops: disk.iops_limit.and_then(|limit| u32::try_from(limit).ok()),
                datastore: disk.datastore.clone(),
            })
            .collect();

        let network_interfaces = props
            .nics
            .iter()
            .map(|nic| {
                let mut state = NetworkInterfaceState {
                    label: nic.network.clone(),
                    mac_address: nic.mac_address.clone(),
                    ipv4_addresses: Vec::new(),
                    ipv6_addresses: Vec::new(),
                };
                // guest tools report addresses as text; skip anything unparseable
                for address in nic.ip_addresses.iter().filter_map(|a| a.parse::<IpAddr>().ok()) {
                    match address {
                        IpAddr::V4(v4) => state.ipv4_addresses.push(v4),
                        IpAddr::V6(v6) => state.ipv6_addresses.push(v6),
                    }
                }
                state
            })
            .collect();

        Self {
            handle,
            vcpu: props.num_cpus,
            memory_mb: props.memory_mb,
            power_state: props.power_state,
            disks,
            network_interfaces,
            extra_config: props.extra_config.clone(),
        }
    }

    /// Whether every interface reports at least one address
    pub fn network_ready(&self) -> bool {
        self.network_interfaces.iter().all(NetworkInterfaceState::has_address)
    }
}
