//! Doctor — environment checks before serving or running
//!
//! Checks configuration, the container engine, the sandbox image and the
//! directories a run needs to write to.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::Config;
use crate::image::ImageRecipe;
use crate::sandbox::ContainerEngine;

/// Result of a single health check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckResult {
    pub name: String,
    pub status: CheckStatus,
    pub message: String,
    pub fix_hint: Option<String>,
}

/// Status of a health check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    Pass,
    Warn,
    Fail,
    Skip,
}

impl std::fmt::Display for CheckStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CheckStatus::Pass => write!(f, "PASS"),
            CheckStatus::Warn => write!(f, "WARN"),
            CheckStatus::Fail => write!(f, "FAIL"),
            CheckStatus::Skip => write!(f, "SKIP"),
        }
    }
}

impl CheckResult {
    fn new(name: &str, status: CheckStatus, message: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            status,
            message: message.into(),
            fix_hint: None,
        }
    }

    fn hint(mut self, hint: impl Into<String>) -> Self {
        self.fix_hint = Some(hint.into());
        self
    }
}

/// Full doctor report
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DoctorReport {
    pub checks: Vec<CheckResult>,
    pub pass_count: usize,
    pub warn_count: usize,
    pub fail_count: usize,
    pub skip_count: usize,
}

impl DoctorReport {
    fn from_checks(checks: Vec<CheckResult>) -> Self {
        let count = |s: CheckStatus| checks.iter().filter(|c| c.status == s).count();
        Self {
            pass_count: count(CheckStatus::Pass),
            warn_count: count(CheckStatus::Warn),
            fail_count: count(CheckStatus::Fail),
            skip_count: count(CheckStatus::Skip),
            checks,
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.fail_count == 0
    }

    pub fn summary(&self) -> String {
        format!(
            "{} passed, {} warnings, {} failed, {} skipped",
            self.pass_count, self.warn_count, self.fail_count, self.skip_count
        )
    }
}

/// Run all doctor checks
pub async fn run_doctor(
    config_path: &Path,
    config: &Config,
    engine: Arc<dyn ContainerEngine>,
) -> DoctorReport {
    info!("Running doctor checks...");

    let mut checks = vec![
        check_config_file(config_path),
        check_power_model(config),
        check_build_manifest(config),
    ];

    let docker = check_docker(engine.as_ref()).await;
    let docker_ok = docker.status == CheckStatus::Pass;
    checks.push(docker);

    if docker_ok {
        checks.push(check_image(engine.as_ref(), &config.runner.image).await);
    } else {
        checks.push(CheckResult::new(
            "sandbox_image",
            CheckStatus::Skip,
            "Docker unavailable, image not checked",
        ));
    }

    checks.push(check_writable_dir("workspace_root", &config.fetch.workspace_root));
    checks.push(check_writable_dir("temp_dir", &std::env::temp_dir()));

    let report = DoctorReport::from_checks(checks);
    if report.is_healthy() {
        info!("Doctor: all checks passed ({})", report.summary());
    } else {
        warn!("Doctor: issues found ({})", report.summary());
    }
    report
}

fn check_config_file(path: &Path) -> CheckResult {
    if path.exists() {
        CheckResult::new(
            "config_file",
            CheckStatus::Pass,
            format!("Config file found: {}", path.display()),
        )
    } else {
        CheckResult::new(
            "config_file",
            CheckStatus::Warn,
            format!("Config file not found: {} (using defaults)", path.display()),
        )
        .hint("Create the file or pass --config")
    }
}

fn check_power_model(config: &Config) -> CheckResult {
    match &config.power {
        Some(power) => CheckResult::new(
            "power_model",
            CheckStatus::Pass,
            format!(
                "cpu {} W/core, ram {} W/GB, baseline {} W",
                power.cpu_per_core_watt, power.ram_per_gb_watt, power.baseline_container_watt
            ),
        ),
        None => CheckResult::new(
            "power_model",
            CheckStatus::Warn,
            "No [power] section; every request must supply power_assumptions",
        )
        .hint("Add cpu_per_core_watt, ram_per_gb_watt and baseline_container_watt under [power]"),
    }
}

fn check_build_manifest(config: &Config) -> CheckResult {
    if config.image.recipe == ImageRecipe::Minimal {
        return CheckResult::new(
            "build_manifest",
            CheckStatus::Skip,
            "Minimal recipe needs no dependency manifest",
        );
    }

    let manifest = config.image.build_context.join(&config.image.manifest);
    if manifest.is_file() {
        CheckResult::new(
            "build_manifest",
            CheckStatus::Pass,
            format!("Dependency manifest found: {}", manifest.display()),
        )
    } else {
        CheckResult::new(
            "build_manifest",
            CheckStatus::Fail,
            format!("Dependency manifest not found: {}", manifest.display()),
        )
        .hint("Create it, or set image.recipe = \"minimal\"")
    }
}

async fn check_docker(engine: &dyn ContainerEngine) -> CheckResult {
    match engine.ping().await {
        Ok(()) => CheckResult::new("docker", CheckStatus::Pass, "Docker is available"),
        Err(e) => CheckResult::new("docker", CheckStatus::Fail, e.to_string())
            .hint("Install Docker (https://docs.docker.com/get-docker/) and make sure the daemon is running"),
    }
}

async fn check_image(engine: &dyn ContainerEngine, tag: &str) -> CheckResult {
    match engine.image_exists(tag).await {
        Ok(true) => CheckResult::new(
            "sandbox_image",
            CheckStatus::Pass,
            format!("Image '{}' present", tag),
        ),
        Ok(false) => CheckResult::new(
            "sandbox_image",
            CheckStatus::Warn,
            format!("Image '{}' missing; it will be built on the first run", tag),
        )
        .hint("Run `greenbox build-image` ahead of time"),
        Err(e) => CheckResult::new("sandbox_image", CheckStatus::Fail, e.to_string()),
    }
}

fn check_writable_dir(name: &str, dir: &Path) -> CheckResult {
    if let Err(e) = std::fs::create_dir_all(dir) {
        return CheckResult::new(
            name,
            CheckStatus::Fail,
            format!("Cannot create {}: {}", dir.display(), e),
        )
        .hint(format!("mkdir -p {}", dir.display()));
    }

    let probe = dir.join(".greenbox_doctor_test");
    match std::fs::write(&probe, "test") {
        Ok(()) => {
            let _ = std::fs::remove_file(&probe);
            CheckResult::new(
                name,
                CheckStatus::Pass,
                format!("Writable: {}", dir.display()),
            )
        }
        Err(e) => CheckResult::new(
            name,
            CheckStatus::Fail,
            format!("{} not writable: {}", dir.display(), e),
        )
        .hint("Check permissions"),
    }
}
