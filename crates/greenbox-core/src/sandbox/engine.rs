//! Container engine seam — what the runner needs from a container runtime

use anyhow::Result;
use async_trait::async_trait;
use std::path::{Path, PathBuf};

use super::policy::ResourceLimits;

/// Result of a single stats probe
#[derive(Debug, Clone, PartialEq)]
pub enum StatsProbe {
    /// Raw CPU and memory-usage columns
    Sample { cpu: String, mem: String },
    /// The container exists but has nothing to report yet
    NotReady,
    /// The container has stopped or been removed
    Gone,
}

/// Everything needed to start one sandbox container
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub user: String,
    pub command: Vec<String>,
    /// Host directory mounted read-only at `workdir`
    pub code_dir: PathBuf,
    pub workdir: String,
    pub limits: ResourceLimits,
}

impl ContainerSpec {
    /// Arguments for `docker` that start this container detached
    pub fn docker_args(&self) -> Vec<String> {
        let memory = self.limits.memory_arg();
        let mut args = vec![
            "run".to_string(),
            "-d".to_string(),
            "--name".to_string(),
            self.name.clone(),
            "--user".to_string(),
            self.user.clone(),
        ];

        if !self.limits.network_enabled {
            args.push("--network".to_string());
            args.push("none".to_string());
        }

        // Swap equal to memory means no swap at all
        args.extend([
            "--memory".to_string(),
            memory.clone(),
            "--memory-swap".to_string(),
            memory,
            "--cpu-period".to_string(),
            self.limits.cpu_period.to_string(),
            "--cpu-quota".to_string(),
            self.limits.cpu_quota.to_string(),
            "--pids-limit".to_string(),
            self.limits.max_pids.to_string(),
            "--security-opt".to_string(),
            "no-new-privileges".to_string(),
            "--cap-drop".to_string(),
            "ALL".to_string(),
        ]);

        if self.limits.read_only_root {
            args.push("--read-only".to_string());
            args.push("--tmpfs".to_string());
            args.push(self.limits.tmpfs_arg());
        }

        args.extend([
            "-v".to_string(),
            format!("{}:{}:ro", self.code_dir.display(), self.workdir),
            "-w".to_string(),
            self.workdir.clone(),
            self.image.clone(),
        ]);

        args.extend(self.command.iter().cloned());
        args
    }
}

/// Operations the runner performs against a container runtime
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    /// Fail if the runtime daemon cannot be reached
    async fn ping(&self) -> Result<()>;

    async fn image_exists(&self, tag: &str) -> Result<bool>;

    /// Build `context/Dockerfile` and tag it
    async fn build_image(&self, context: &Path, tag: &str) -> Result<()>;

    /// Start a container detached, returning its ID
    async fn run_detached(&self, spec: &ContainerSpec) -> Result<String>;

    async fn stats(&self, name: &str) -> Result<StatsProbe>;

    /// Block until the container exits, returning its exit code
    async fn wait(&self, name: &str) -> Result<i64>;

    /// Current state (`running`, `exited`, ...) or `None` if unknown
    async fn status(&self, name: &str) -> Result<Option<String>>;

    async fn stop(&self, name: &str, timeout_secs: u64) -> Result<()>;

    /// Combined stdout and stderr
    async fn logs(&self, name: &str) -> Result<String>;

    async fn remove(&self, name: &str) -> Result<()>;
}
