pub mod allocator;
pub mod docker;
pub mod graph;
pub mod host;
pub mod interpolate;
pub mod loader;
pub mod logs;
pub mod orchestrator;
pub mod ports;
pub mod reconciler;
pub mod registry;
pub mod runtime;
pub mod simulated;
pub mod state;
