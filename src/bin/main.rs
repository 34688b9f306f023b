//! vSphere VM provisioning CLI

use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use vsphere_vm::attributes::{self, AttributeMap};
use vsphere_vm::platform::memory::InventorySeed;
use vsphere_vm::{ControllerConfig, InMemoryPlatform, LifecycleController, VirtualMachineSpec};

#[derive(Parser)]
#[command(name = "vsphere-vm")]
#[command(about = "Plan and simulate vSphere virtual machine provisioning", long_about = None)]
struct Cli {
    /// Spec files hold flat attributes (`disk.0.template.label` style)
    #[arg(long, global = true)]
    flat: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check a spec file
    Validate {
        /// Spec file (JSON)
        spec: PathBuf,
    },
    /// Print the flat attribute form of a spec
    Attributes {
        /// Spec file (JSON)
        spec: PathBuf,
    },
    /// Resolve a spec against an inventory without changing anything
    Plan {
        #[arg(short, long)]
        spec: PathBuf,
        /// Inventory seed file (JSON)
        #[arg(short, long)]
        inventory: PathBuf,
    },
    /// Create the virtual machine in an in-memory inventory and read it back
    Simulate {
        #[arg(short, long)]
        spec: PathBuf,
        #[arg(short, long)]
        inventory: PathBuf,
        /// Skip the destroy step
        #[arg(long)]
        keep: bool,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("vsphere_vm=info".parse()?),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Validate { spec } => {
            let spec = load_spec(&spec, cli.flat)?;
            spec.validate()?;
            println!("{}: ok", spec.name);
        }
        Commands::Attributes { spec } => {
            let spec = load_spec(&spec, cli.flat)?;
            println!("{}", serde_json::to_string_pretty(&attributes::to_attributes(&spec))?);
        }
        Commands::Plan { spec, inventory } => {
            let spec = load_spec(&spec, cli.flat)?;
            let controller = controller(&inventory)?;
            let request = controller.plan(&spec)?;
            println!("{}", serde_json::to_string_pretty(&request)?);
        }
        Commands::Simulate { spec, inventory, keep } => {
            let spec = load_spec(&spec, cli.flat)?;
            cmd_simulate(&spec, &inventory, keep)?;
        }
    }

    Ok(())
}

fn load_spec(path: &Path, flat: bool) -> vsphere_vm::Result<VirtualMachineSpec> {
    let raw = std::fs::read_to_string(path)?;
    if flat {
        let attrs: AttributeMap = serde_json::from_str(&raw)?;
        attributes::from_attributes(&attrs)
    } else {
        Ok(serde_json::from_str(&raw)?)
    }
}

fn controller(inventory: &Path) -> vsphere_vm::Result<LifecycleController> {
    let seed: InventorySeed = serde_json::from_str(&std::fs::read_to_string(inventory)?)?;
    Ok(LifecycleController::new(
        Arc::new(InMemoryPlatform::from_seed(&seed)),
        ControllerConfig::from_env()?,
    ))
}

fn cmd_simulate(spec: &VirtualMachineSpec, inventory: &Path, keep: bool) -> vsphere_vm::Result<()> {
    let controller = controller(inventory)?;
    let handle = controller.create(spec)?;
    println!("Created {}", handle);

    if let Some(attrs) = controller.attributes(&handle)? {
        println!("{}", serde_json::to_string_pretty(&attrs)?);
    }

    if !keep {
        controller.destroy(&handle)?;
        println!("Destroyed {}", handle);
    }
    Ok(())
}
