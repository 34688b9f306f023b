//! vSphere virtual machine provisioning engine
//!
//! Takes a declared [`VirtualMachineSpec`] (template or bare create, CPU,
//! memory, disks, network interfaces, folder, custom metadata) and drives a
//! vSphere-like platform to match it: resolve inventory paths, clone or
//! create, reconfigure hardware, wait for guest customization, read state
//! back and tear it down again.
//!
//! The remote platform sits behind the [`Platform`] trait and is handed to
//! the [`LifecycleController`] at construction. [`InMemoryPlatform`] is an
//! in-process implementation for tests and dry runs.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use vsphere_vm::models::{DiskSpec, NetworkInterfaceSpec, SourceSpec};
//! use vsphere_vm::platform::memory::{DatacenterSeed, InventorySeed, TemplateSeed};
//! use vsphere_vm::{ControllerConfig, InMemoryPlatform, LifecycleController, VirtualMachineSpec};
//!
//! let seed = InventorySeed::default().datacenter(
//!     DatacenterSeed::new("dc1")
//!         .cluster("cluster1", &[])
//!         .datastore("ds1")
//!         .network("LAN")
//!         .template(TemplateSeed::new("tmpl").snapshot("base")),
//! );
//! let controller = LifecycleController::new(
//!     Arc::new(InMemoryPlatform::from_seed(&seed)),
//!     ControllerConfig::from_env()?,
//! );
//!
//! let spec = VirtualMachineSpec::builder()
//!     .name("web")
//!     .folder("team")
//!     .source(SourceSpec::linked("tmpl"))
//!     .disk(DiskSpec::from_template())
//!     .network_interface(NetworkInterfaceSpec::dhcp("LAN"))
//!     .metadata("role", "frontend")
//!     .build_validated()?;
//!
//! let handle = controller.create(&spec)?;
//! let attributes = controller.attributes(&handle)?;
//! controller.destroy(&handle)?;
//! # Ok::<(), vsphere_vm::Error>(())
//! ```

pub mod attributes;
pub mod config;
pub mod controller;
pub mod error;
pub mod locator;
pub mod models;
pub mod placement;
pub mod planner;
pub mod platform;
pub mod reconciler;

pub use attributes::AttributeMap;
pub use config::VirtualMachineSpec;
pub use controller::{ControllerConfig, LifecycleController, LifecycleState, VirtualMachineHandle};
pub use error::{Error, PlatformError, Result};
pub use platform::{InMemoryPlatform, Platform};
