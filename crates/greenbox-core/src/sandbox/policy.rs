//! Execution policy — resource limits and command constraints for sandboxed runs

use serde::{Deserialize, Serialize};

use crate::energy::allocated_cores;

/// Resource limits applied to every sandbox container
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceLimits {
    pub cpu_period: u64,
    pub cpu_quota: u64,
    pub memory_mb: u64,
    pub max_pids: u64,
    pub network_enabled: bool,
    /// Mount the root filesystem read-only with a small writable /tmp
    pub read_only_root: bool,
    pub tmpfs_size_mb: u64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            cpu_period: 100_000,
            cpu_quota: 50_000,
            memory_mb: 256,
            max_pids: 128,
            network_enabled: false,
            read_only_root: true,
            tmpfs_size_mb: 64,
        }
    }
}

impl ResourceLimits {
    /// Cores granted by the CFS quota
    pub fn allocated_cores(&self) -> f64 {
        allocated_cores(self.cpu_quota, self.cpu_period)
    }

    /// Memory limit in docker's `--memory` syntax
    pub fn memory_arg(&self) -> String {
        format!("{}m", self.memory_mb)
    }

    /// `--tmpfs` value for the writable /tmp of a read-only container
    pub fn tmpfs_arg(&self) -> String {
        format!("/tmp:rw,noexec,nosuid,size={}m", self.tmpfs_size_mb)
    }
}

/// Check that an entrypoint stays inside the mounted code directory.
pub fn validate_entrypoint(entrypoint: &str) -> Result<(), String> {
    let trimmed = entrypoint.trim();
    if trimmed.is_empty() {
        return Err("Entrypoint cannot be empty".to_string());
    }
    if trimmed.starts_with('/') || trimmed.starts_with('\\') {
        return Err(format!("Entrypoint '{}' must be a relative path", trimmed));
    }
    if trimmed.split(['/', '\\']).any(|part| part == "..") {
        return Err(format!("Entrypoint '{}' must not contain '..'", trimmed));
    }
    if trimmed.chars().any(|c| c.is_control()) {
        return Err("Entrypoint contains control characters".to_string());
    }
    Ok(())
}

/// Command that runs the entrypoint inside the sandbox image
pub fn python_command(entrypoint: &str) -> Vec<String> {
    vec!["python".to_string(), entrypoint.trim().to_string()]
}
