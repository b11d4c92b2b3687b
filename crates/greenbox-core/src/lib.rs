//! greenbox-core — run untrusted Python code in a sandbox and estimate its energy use
//!
//! Downloads a repository, runs it in a locked-down Docker container, samples
//! the container's CPU and memory while it runs and turns the samples into a
//! power, energy and CO2 estimate.

pub mod config;
pub mod doctor;
pub mod energy;
pub mod fetch;
pub mod image;
pub mod runner;
pub mod sandbox;
pub mod stats;
pub mod workspace;

pub use config::{Config, ConfigError, PowerPatch, ResolvedRun, RunPatch};
pub use energy::{PowerAssumptions, StatsError};
pub use fetch::{CodeFetcher, FetchError, GithubFetcher};
pub use image::{ImageError, ImageManager, ImageRecipe};
pub use runner::{RunError, RunJob, RunReport, Runner};
pub use sandbox::{ContainerEngine, DockerCli};
