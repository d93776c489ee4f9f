//! Kernel infrastructure: job queue, batch manager, publish pipeline,
//! service registry, and plugin/startup orchestration.
//!
//! Everything here is constructor-injected; the [`Shell`] is the assembly
//! root that wires the pieces together and enforces the startup gate
//! (background workers do not start before `system:plugins:ready`
//! handlers have completed).

pub mod jobs;
pub mod plugin;
pub mod publish;
pub mod registry;
mod shell;
pub mod topics;

pub use plugin::{Plugin, PluginCapabilities, PluginContext};
pub use registry::ServiceRegistry;
pub use shell::Shell;
