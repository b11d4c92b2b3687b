//! Docker sandbox — run untrusted code in locked-down containers
//!
//! The runner talks to the container runtime only through
//! [`ContainerEngine`]; [`DockerCli`] is the production implementation.

pub mod docker;
pub mod engine;
pub mod policy;

#[cfg(test)]
pub(crate) mod fake;

pub use docker::DockerCli;
pub use engine::{ContainerEngine, ContainerSpec, StatsProbe};
pub use policy::ResourceLimits;
