pub mod config;
pub mod document;
pub mod image;
pub mod quantity;
pub mod report;
pub mod spec;
pub mod state;

pub use config::EngineConfig;
pub use image::ImageRef;
pub use quantity::{CpuQuantity, MemoryQuantity};
pub use report::{FailureChain, RunReport, ServiceOutcome, TeardownReport};
pub use spec::{
    DependencyCondition, HealthCheck, Model, NetworkSpec, PortBinding, ProbeKind, Protocol,
    Reservation, ResourceRequest, ServiceSpec, VolumeBinding, VolumeSource, VolumeSpec,
};
pub use state::{
    EnvironmentState, ImageHandle, ProcessHandle, ServiceRuntimeState, ServiceState,
};
