//! Flat attribute surface
//!
//! Existing configurations address the resource through dotted string keys
//! such as `disk.0.template.label` or `network_interface.1.ipv4_address`.
//! This module maps between those keys and the typed spec/state structures.
//! Counts use the `.#` suffix (`disk.#`), metadata lives under
//! `custom_configuration_parameters.<key>`.

use std::collections::BTreeMap;
use std::str::FromStr;

use crate::config::VirtualMachineSpec;
use crate::models::{
    CustomizationSettings, DiskSpec, DiskType, MetadataValue, NetworkInterfaceSpec, SnapshotRef,
    SourceSpec, VirtualMachineState,
};
use crate::{Error, Result};

pub type AttributeMap = BTreeMap<String, String>;

const METADATA_PREFIX: &str = "custom_configuration_parameters.";
const DEFAULT_IPV4_PREFIX: u8 = 24;
const DEFAULT_IPV6_PREFIX: u8 = 64;

/// Flatten a declared spec
pub fn to_attributes(spec: &VirtualMachineSpec) -> AttributeMap {
    let mut attrs = AttributeMap::new();
    attrs.insert("name".into(), spec.name.clone());
    attrs.insert("vcpu".into(), spec.vcpu.to_string());
    attrs.insert("memory".into(), spec.memory_mb.to_string());
    placement_attributes(&mut attrs, spec);
    if let Some(folder) = spec.folder_path() {
        attrs.insert("folder".into(), folder.to_string());
    }
    if let Some(ref datacenter) = spec.datacenter {
        attrs.insert("datacenter".into(), datacenter.clone());
    }

    attrs.insert("disk.#".into(), spec.disks.len().to_string());
    for (i, disk) in spec.disks.iter().enumerate() {
        let prefix = format!("disk.{}", i);
        if disk.is_template() {
            if let Some(ref source) = spec.source {
                template_attributes(&mut attrs, &prefix, source);
            }
        }
        if let Some(size) = disk.size_gb() {
            attrs.insert(format!("{}.size", prefix), size.to_string());
        }
        attrs.insert(format!("{}.type", prefix), disk.disk_type.to_string());
        if let Some(iops) = disk.iops {
            attrs.insert(format!("{}.iops", prefix), iops.to_string());
        }
        if let Some(ref datastore) = disk.datastore {
            attrs.insert(format!("{}.datastore", prefix), datastore.clone());
        }
    }

    attrs.insert("network_interface.#".into(), spec.network_interfaces.len().to_string());
    for (i, nic) in spec.network_interfaces.iter().enumerate() {
        let prefix = format!("network_interface.{}", i);
        attrs.insert(format!("{}.label", prefix), nic.label.clone());
        static_attributes(&mut attrs, &prefix, nic);
        if let Some(ref ipv4) = nic.ipv4 {
            attrs.insert(format!("{}.ipv4_address", prefix), ipv4.address.to_string());
        }
        if let Some(ref ipv6) = nic.ipv6 {
            attrs.insert(format!("{}.ipv6_address", prefix), ipv6.address.to_string());
        }
    }

    customization_attributes(&mut attrs, &spec.customization);
    for (key, value) in &spec.metadata {
        attrs.insert(format!("{}{}", METADATA_PREFIX, key), value.to_extra_config());
    }
    attrs
}

/// Flatten observed state.
///
/// Template provenance and static prefix/gateway settings are not observable
/// on the virtual machine, so they come from `spec` when one is known. With a
/// spec, only declared metadata keys are reported.
pub fn from_state(state: &VirtualMachineState, spec: Option<&VirtualMachineSpec>) -> AttributeMap {
    let mut attrs = AttributeMap::new();
    attrs.insert("name".into(), state.handle.name.clone());
    attrs.insert("datacenter".into(), state.handle.datacenter.clone());
    if let Some(ref folder) = state.handle.folder {
        attrs.insert("folder".into(), folder.clone());
    }
    attrs.insert("vcpu".into(), state.vcpu.to_string());
    attrs.insert("memory".into(), state.memory_mb.to_string());
    if let Some(spec) = spec {
        placement_attributes(&mut attrs, spec);
        customization_attributes(&mut attrs, &spec.customization);
    }

    attrs.insert("disk.#".into(), state.disks.len().to_string());
    for (i, disk) in state.disks.iter().enumerate() {
        let prefix = format!("disk.{}", i);
        attrs.insert(format!("{}.size", prefix), disk.size_gb.to_string());
        attrs.insert(format!("{}.type", prefix), disk.disk_type.to_string());
        if let Some(iops) = disk.iops {
            attrs.insert(format!("{}.iops", prefix), iops.to_string());
        }
        if !disk.datastore.is_empty() {
            attrs.insert(format!("{}.datastore", prefix), disk.datastore.clone());
        }
        let declared = spec.and_then(|s| s.disks.get(i).map(|d| (s, d)));
        if let Some((spec, declared)) = declared {
            if let (true, Some(source)) = (declared.is_template(), spec.source.as_ref()) {
                template_attributes(&mut attrs, &prefix, source);
            }
        }
    }

    attrs.insert("network_interface.#".into(), state.network_interfaces.len().to_string());
    for (i, nic) in state.network_interfaces.iter().enumerate() {
        let prefix = format!("network_interface.{}", i);
        attrs.insert(format!("{}.label", prefix), nic.label.clone());
        if let Some(address) = nic.ipv4_addresses.first() {
            attrs.insert(format!("{}.ipv4_address", prefix), address.to_string());
        }
        if let Some(address) = nic.ipv6_addresses.first() {
            attrs.insert(format!("{}.ipv6_address", prefix), address.to_string());
        }
        if let Some(declared) = spec.and_then(|s| s.resolved_interfaces().into_iter().nth(i)) {
            static_attributes(&mut attrs, &prefix, &declared);
        }
    }

    for (key, value) in &state.extra_config {
        let declared = spec.map_or(true, |s| s.metadata.contains_key(key));
        if declared {
            attrs.insert(format!("{}{}", METADATA_PREFIX, key), value.clone());
        }
    }
    attrs
}

fn placement_attributes(attrs: &mut AttributeMap, spec: &VirtualMachineSpec) {
    let optional = [
        ("cluster", &spec.cluster),
        ("resource_pool", &spec.resource_pool),
        ("datastore", &spec.datastore),
    ];
    for (key, value) in optional {
        if let Some(value) = value {
            attrs.insert(key.to_string(), value.clone());
        }
    }
    if let Some(gateway) = spec.gateway {
        attrs.insert("gateway".into(), gateway.to_string());
    }
}

fn template_attributes(attrs: &mut AttributeMap, prefix: &str, source: &SourceSpec) {
    attrs.insert(format!("{}.template.label", prefix), source.template.clone());
    attrs.insert(format!("{}.template.linked", prefix), source.is_linked().to_string());
    if let Some(name) = source.snapshot.as_ref().and_then(SnapshotRef::name) {
        attrs.insert(format!("{}.template.snapshot", prefix), name.to_string());
    }
}

fn static_attributes(attrs: &mut AttributeMap, prefix: &str, nic: &NetworkInterfaceSpec) {
    if let Some(ref ipv4) = nic.ipv4 {
        attrs.insert(format!("{}.ipv4_prefix_length", prefix), ipv4.prefix_length.to_string());
        if let Some(gateway) = ipv4.gateway {
            attrs.insert(format!("{}.ipv4_gateway", prefix), gateway.to_string());
        }
    }
    if let Some(ref ipv6) = nic.ipv6 {
        attrs.insert(format!("{}.ipv6_prefix_length", prefix), ipv6.prefix_length.to_string());
        if let Some(gateway) = ipv6.gateway {
            attrs.insert(format!("{}.ipv6_gateway", prefix), gateway.to_string());
        }
    }
}

fn customization_attributes(attrs: &mut AttributeMap, settings: &CustomizationSettings) {
    attrs.insert("domain".into(), settings.domain.clone());
    attrs.insert("time_zone".into(), settings.time_zone.clone());
    attrs.insert("skip_customization".into(), settings.skip.to_string());
    for (name, values) in [("dns_servers", &settings.dns_servers), ("dns_suffixes", &settings.dns_suffixes)] {
        attrs.insert(format!("{}.#", name), values.len().to_string());
        for (i, value) in values.iter().enumerate() {
            attrs.insert(format!("{}.{}", name, i), value.clone());
        }
    }
}

/// Build a spec from flat attributes.
///
/// Accepts the legacy `disk.N.template = "<label>"` form and `1`/`0` for
/// `template.linked`.
pub fn from_attributes(attrs: &AttributeMap) -> Result<VirtualMachineSpec> {
    let name = attrs
        .get("name")
        .cloned()
        .ok_or_else(|| Error::Attribute("missing required attribute 'name'".into()))?;
    let defaults = VirtualMachineSpec::default();

    let mut spec = VirtualMachineSpec {
        name,
        datacenter: attrs.get("datacenter").cloned(),
        cluster: attrs.get("cluster").cloned(),
        resource_pool: attrs.get("resource_pool").cloned(),
        datastore: attrs.get("datastore").cloned(),
        folder: attrs.get("folder").cloned(),
        vcpu: parse(attrs, "vcpu")?.unwrap_or(defaults.vcpu),
        memory_mb: parse(attrs, "memory")?.unwrap_or(defaults.memory_mb),
        gateway: parse(attrs, "gateway")?,
        ..defaults
    };

    let disk_count: usize = parse(attrs, "disk.#")?.unwrap_or(0);
    for i in 0..disk_count {
        let prefix = format!("disk.{}", i);
        let label = attrs
            .get(&format!("{}.template.label", prefix))
            .or_else(|| attrs.get(&format!("{}.template", prefix)));

        let mut disk = match label {
            Some(label) if i == 0 => {
                let mut source = match attrs.get(&format!("{}.template.linked", prefix)) {
                    Some(linked) if parse_bool(linked)? => SourceSpec::linked(label.as_str()),
                    _ => SourceSpec::full(label.as_str()),
                };
                if let Some(snapshot) = attrs.get(&format!("{}.template.snapshot", prefix)) {
                    source = source.with_snapshot(snapshot.as_str());
                }
                spec.source = Some(source);
                DiskSpec::from_template()
            }
            Some(_) => {
                return Err(Error::Attribute(format!(
                    "{}: only disk 0 can come from a template",
                    prefix
                )));
            }
            None => {
                let size = parse(attrs, &format!("{}.size", prefix))?.ok_or_else(|| {
                    Error::Attribute(format!("{}: either template or size is required", prefix))
                })?;
                DiskSpec::sized(size)
            }
        };
        if let Some(ty) = attrs.get(&format!("{}.type", prefix)) {
            disk = disk.disk_type(DiskType::parse(ty).map_err(|e| Error::Attribute(e.to_string()))?);
        }
        if let Some(iops) = parse(attrs, &format!("{}.iops", prefix))? {
            disk = disk.iops(iops);
        }
        if let Some(datastore) = attrs.get(&format!("{}.datastore", prefix)) {
            disk = disk.datastore(datastore.as_str());
        }
        spec.disks.push(disk);
    }

    let nic_count: usize = parse(attrs, "network_interface.#")?.unwrap_or(0);
    for i in 0..nic_count {
        let prefix = format!("network_interface.{}", i);
        let label = attrs
            .get(&format!("{}.label", prefix))
            .ok_or_else(|| Error::Attribute(format!("{}: missing label", prefix)))?;
        let mut nic = NetworkInterfaceSpec::dhcp(label.as_str());

        if let Some(address) = parse(attrs, &format!("{}.ipv4_address", prefix))? {
            let prefix_length = parse(attrs, &format!("{}.ipv4_prefix_length", prefix))?;
            nic = nic.ipv4(address, prefix_length.unwrap_or(DEFAULT_IPV4_PREFIX));
            if let Some(gateway) = parse(attrs, &format!("{}.ipv4_gateway", prefix))? {
                nic = nic.ipv4_gateway(gateway);
            }
        } else if attrs.contains_key(&format!("{}.ipv4_gateway", prefix)) {
            return Err(Error::Attribute(format!("{}: ipv4_gateway without ipv4_address", prefix)));
        }

        if let Some(address) = parse(attrs, &format!("{}.ipv6_address", prefix))? {
            let prefix_length = parse(attrs, &format!("{}.ipv6_prefix_length", prefix))?;
            nic = nic.ipv6(address, prefix_length.unwrap_or(DEFAULT_IPV6_PREFIX));
            if let Some(gateway) = parse(attrs, &format!("{}.ipv6_gateway", prefix))? {
                nic = nic.ipv6_gateway(gateway);
            }
        } else if attrs.contains_key(&format!("{}.ipv6_gateway", prefix)) {
            return Err(Error::Attribute(format!("{}: ipv6_gateway without ipv6_address", prefix)));
        }
        spec.network_interfaces.push(nic);
    }

    if let Some(domain) = attrs.get("domain") {
        spec.customization.domain = domain.clone();
    }
    if let Some(time_zone) = attrs.get("time_zone") {
        spec.customization.time_zone = time_zone.clone();
    }
    if let Some(skip) = attrs.get("skip_customization") {
        spec.customization.skip = parse_bool(skip)?;
    }
    if let Some(servers) = parse_list(attrs, "dns_servers")? {
        spec.customization.dns_servers = servers;
    }
    if let Some(suffixes) = parse_list(attrs, "dns_suffixes")? {
        spec.customization.dns_suffixes = suffixes;
    }

    for (key, value) in attrs {
        if let Some(name) = key.strip_prefix(METADATA_PREFIX) {
            spec.metadata.insert(name.to_string(), MetadataValue::String(value.clone()));
        }
    }

    Ok(spec)
}

fn parse<T: FromStr>(attrs: &AttributeMap, key: &str) -> Result<Option<T>> {
    match attrs.get(key) {
        Some(raw) => raw
            .parse()
            .map(Some)
            .map_err(|_| Error::Attribute(format!("invalid value for '{}': '{}'", key, raw))),
        None => Ok(None),
    }
}

fn parse_bool(raw: &str) -> Result<bool> {
    match raw {
        "true" | "1" => Ok(true),
        "false" | "0" => Ok(false),
        other => Err(Error::Attribute(format!("invalid boolean '{}'", other))),
    }
}

fn parse_list(attrs: &AttributeMap, name: &str) -> Result<Option<Vec<String>>> {
    let Some(count) = parse::<usize>(attrs, &format!("{}.#", name))? else {
        return Ok(None);
    };
    (0..count)
        .map(|i| {
            let key = format!("{}.{}", name, i);
            attrs
                .get(&key)
                .cloned()
                .ok_or_else(|| Error::Attribute(format!("missing attribute '{}'", key)))
        })
        .collect::<Result<Vec<_>>>()
        .map(Some)
}
