//! Lab provisioning: dependency allow-set, lifecycle records, the
//! schema-adaptive writer, compute launchers and the orchestrator that
//! composes them.

pub mod dependencies;
pub mod docker;
pub mod launcher;
pub mod lxd;
pub mod orchestrator;
pub mod record;
pub mod writer;

pub use dependencies::{Dependency, validate_dependencies};
pub use launcher::{
    BackendLauncher, ComputeBackend, ComputeLauncher, LaunchOutcome, LaunchSpec, ReportedAddress,
    SIMULATED_ADDRESS, ShellConnection, SimulatedLauncher, build_launcher, select_address,
};
pub use orchestrator::{
    ConnectionDescriptor, LaunchRequest, LaunchResult, ProvisioningOrchestrator, generate_name,
};
pub use record::{
    ContainerRecord, ContainerRef, ContainerStatus, LogicalRecord, Metadata, RecordPatch,
    ResourceShape,
};
pub use writer::{LogicalField, RecordWriter, map_columns};
