//! Runner — execute one code directory in the sandbox and measure it
//!
//! A run validates its inputs, makes sure the sandbox image exists, starts a
//! detached container with the code mounted read-only, samples its usage
//! until it exits (or the wait times out), collects logs, turns the samples
//! into an energy estimate and finally removes the container whatever
//! happened in between.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::{Config, RunnerConfig};
use crate::energy::{PowerAssumptions, StatsError, co2_grams, round_to, summarize};
use crate::image::{ImageError, ImageManager};
use crate::sandbox::policy::{python_command, validate_entrypoint};
use crate::sandbox::{ContainerEngine, ContainerSpec};
use crate::stats::{Monitor, Sample};

/// Exit code reported when waiting for the container failed or timed out
pub const WAIT_FAILED_EXIT_CODE: i64 = -99;

/// One unit of work for the runner
#[derive(Debug, Clone)]
pub struct RunJob {
    pub code_dir: PathBuf,
    pub entrypoint: String,
    pub power: PowerAssumptions,
    pub co2_rate: Option<f64>,
    /// Overrides `runner.wait_timeout_secs`
    pub timeout: Option<Duration>,
}

/// Measurements from a finished run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub container: String,
    pub exit_code: i64,
    pub timed_out: bool,
    pub runtime_seconds: f64,
    pub samples_collected: usize,
    pub avg_cpu_percent: f64,
    pub avg_mem_mib: f64,
    pub peak_mem_mib: f64,
    pub avg_power_watt: f64,
    pub energy_kwh: f64,
    pub co2_grams: Option<f64>,
    pub power_assumptions: PowerAssumptions,
    pub logs: String,
    pub raw_stats: Vec<Sample>,
}

#[derive(Debug, Error)]
pub enum RunError {
    #[error("User code directory not found: {}", .0.display())]
    CodeDirMissing(PathBuf),
    #[error("Invalid entrypoint: {0}")]
    InvalidEntrypoint(String),
    #[error("Docker Connection Error: {0}")]
    EngineUnavailable(String),
    #[error(transparent)]
    Image(#[from] ImageError),
    #[error("Failed to start container: {0}")]
    Launch(String),
    /// The container ran but its usage could not be summarized
    #[error("{source}")]
    Stats {
        #[source]
        source: StatsError,
        exit_code: i64,
        logs: String,
    },
}

pub struct Runner {
    engine: Arc<dyn ContainerEngine>,
    images: ImageManager,
    config: RunnerConfig,
}

impl Runner {
    pub fn new(engine: Arc<dyn ContainerEngine>, config: &Config) -> Self {
        Self {
            images: ImageManager::new(engine.clone(), config.image.clone()),
            engine,
            config: config.runner.clone(),
        }
    }

    pub fn images(&self) -> &ImageManager {
        &self.images
    }

    pub async fn run(&self, job: &RunJob) -> Result<RunReport, RunError> {
        if !job.code_dir.is_dir() {
            return Err(RunError::CodeDirMissing(job.code_dir.clone()));
        }
        // Docker reads a relative -v source as a volume name
        let code_dir = tokio::fs::canonicalize(&job.code_dir)
            .await
            .map_err(|_| RunError::CodeDirMissing(job.code_dir.clone()))?;
        validate_entrypoint(&job.entrypoint).map_err(RunError::InvalidEntrypoint)?;

        self.engine
            .ping()
            .await
            .map_err(|e| RunError::EngineUnavailable(e.to_string()))?;

        self.images.ensure(&self.config.image).await?;

        let spec = ContainerSpec {
            name: format!(
                "{}{}",
                self.config.container_prefix,
                uuid::Uuid::new_v4().simple()
            ),
            image: self.config.image.clone(),
            user: self.config.user.clone(),
            command: python_command(&job.entrypoint),
            code_dir,
            workdir: self.config.workdir.clone(),
            limits: self.config.limits.clone(),
        };

        info!(
            "Runner: starting '{}' for {} ({})",
            spec.name,
            spec.code_dir.display(),
            job.entrypoint
        );
        let guard = ContainerGuard::new(self.engine.clone(), &spec.name);
        let started = Instant::now();
        if let Err(e) = self.engine.run_detached(&spec).await {
            // `docker run` may have created the container before failing to start it
            self.remove_container(&spec.name).await;
            guard.disarm();
            return Err(RunError::Launch(e.to_string()));
        }

        let result = self.supervise(&spec.name, job, started).await;
        self.cleanup(&spec.name).await;
        guard.disarm();
        result
    }

    async fn supervise(
        &self,
        name: &str,
        job: &RunJob,
        started: Instant,
    ) -> Result<RunReport, RunError> {
        let monitor = Monitor::spawn(
            self.engine.clone(),
            name.to_string(),
            Duration::from_millis(self.config.sample_interval_ms),
        );

        let timeout = job
            .timeout
            .unwrap_or(Duration::from_secs(self.config.wait_timeout_secs));
        let (exit_code, timed_out) = self.wait_for_exit(name, timeout).await;

        let duration = started.elapsed().as_secs_f64();
        info!(
            "Runner: '{}' finished with exit code {} after {:.2}s",
            name, exit_code, duration
        );

        let samples = monitor.finish().await;
        let logs = self.collect_logs(name).await;

        let summary = match summarize(
            &samples,
            duration,
            self.config.limits.allocated_cores(),
            &job.power,
        ) {
            Ok(summary) => summary,
            Err(source) => {
                warn!("Runner: stats error for '{}': {}", name, source);
                return Err(RunError::Stats {
                    source,
                    exit_code,
                    logs,
                });
            }
        };

        info!(
            "Runner: samples={}, avg_cpu={}%, avg_mem={} MiB, power={} W, energy={:.9} kWh",
            summary.samples_collected,
            summary.avg_cpu_percent,
            summary.avg_mem_mib,
            summary.avg_power_watt,
            summary.energy_kwh
        );

        Ok(RunReport {
            container: name.to_string(),
            exit_code,
            timed_out,
            runtime_seconds: round_to(duration, 2),
            samples_collected: summary.samples_collected,
            avg_cpu_percent: summary.avg_cpu_percent,
            avg_mem_mib: summary.avg_mem_mib,
            peak_mem_mib: summary.peak_mem_mib,
            avg_power_watt: summary.avg_power_watt,
            energy_kwh: summary.energy_kwh,
            co2_grams: job.co2_rate.map(|rate| co2_grams(summary.energy_kwh, rate)),
            power_assumptions: job.power.clone(),
            logs,
            raw_stats: samples,
        })
    }

    /// Returns the exit code and whether the wait timed out
    async fn wait_for_exit(&self, name: &str, timeout: Duration) -> (i64, bool) {
        debug!("Runner: waiting for '{}' (timeout {:?})", name, timeout);

        match tokio::time::timeout(timeout, self.engine.wait(name)).await {
            Ok(Ok(code)) => (code, false),
            Ok(Err(e)) => {
                warn!("Runner: error waiting for '{}': {}", name, e);
                self.stop_if_running(name).await;
                (WAIT_FAILED_EXIT_CODE, false)
            }
            Err(_) => {
                warn!("Runner: '{}' timed out after {:?}", name, timeout);
                self.stop_if_running(name).await;
                (WAIT_FAILED_EXIT_CODE, true)
            }
        }
    }

    async fn stop_if_running(&self, name: &str) {
        match self.engine.status(name).await {
            Ok(Some(status)) if status == "running" => {
                info!("Runner: stopping '{}'", name);
                if let Err(e) = self.engine.stop(name, self.config.stop_timeout_secs).await {
                    warn!("Runner: failed to stop '{}': {}", name, e);
                }
            }
            Ok(status) => debug!("Runner: '{}' status after wait: {:?}", name, status),
            Err(e) => warn!("Runner: could not check '{}': {}", name, e),
        }
    }

    async fn collect_logs(&self, name: &str) -> String {
        match self.engine.logs(name).await {
            Ok(logs) => truncate_output(logs, self.config.max_log_bytes),
            Err(e) => format!("[Error retrieving logs: {}]", e),
        }
    }

    async fn cleanup(&self, name: &str) {
        self.stop_if_running(name).await;
        self.remove_container(name).await;
    }

    async fn remove_container(&self, name: &str) {
        match self.engine.remove(name).await {
            Ok(()) => debug!("Runner: removed '{}'", name),
            Err(e) => warn!("Runner: error during container cleanup of '{}': {}", name, e),
        }
    }
}

/// Force-removes the container if the run is dropped before its own cleanup
struct ContainerGuard {
    engine: Arc<dyn ContainerEngine>,
    name: Option<String>,
}

impl ContainerGuard {
    fn new(engine: Arc<dyn ContainerEngine>, name: &str) -> Self {
        Self {
            engine,
            name: Some(name.to_string()),
        }
    }

    fn disarm(mut self) {
        self.name = None;
    }
}

impl Drop for ContainerGuard {
    fn drop(&mut self) {
        let Some(name) = self.name.take() else {
            return;
        };
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!("Runner: no runtime left to remove '{}'", name);
            return;
        };
        warn!("Runner: run of '{}' was cancelled, removing container", name);
        let engine = self.engine.clone();
        handle.spawn(async move {
            if let Err(e) = engine.remove(&name).await {
                warn!("Runner: error during container cleanup of '{}': {}", name, e);
            }
        });
    }
}

/// Cut `text` to at most `max_bytes` on a character boundary
fn truncate_output(mut text: String, max_bytes: usize) -> String {
    if text.len() <= max_bytes {
        return text;
    }
    let mut cut = max_bytes;
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    text.truncate(cut);
    text.push_str("\n... [output truncated]");
    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::ImageRecipe;
    use crate::sandbox::StatsProbe;
    use crate::sandbox::fake::{FakeEngine, WaitBehavior};
    use std::sync::atomic::Ordering;

    fn config() -> Config {
        let mut config = Config::default();
        config.runner.sample_interval_ms = 5;
        config.image.recipe = ImageRecipe::Minimal;
        config
    }

    fn power() -> PowerAssumptions {
        PowerAssumptions {
            notes: "test".to_string(),
            cpu_per_core_watt: 10.0,
            ram_per_gb_watt: 0.5,
            baseline_container_watt: 1.0,
        }
    }

    fn job(dir: &std::path::Path) -> RunJob {
        RunJob {
            code_dir: dir.to_path_buf(),
            entrypoint: "main.py".to_string(),
            power: power(),
            co2_rate: Some(400.0),
            timeout: None,
        }
    }

    fn sample(cpu: &str, mem: &str) -> StatsProbe {
        StatsProbe::Sample {
            cpu: cpu.to_string(),
            mem: mem.to_string(),
        }
    }

    #[tokio::test]
    async fn test_run_success() {
        let engine = Arc::new(FakeEngine {
            logs: "hello from sandbox\n".to_string(),
            wait: WaitBehavior::Exit(3),
            ..FakeEngine::with_stats(vec![sample("40%", "100MiB"), sample("60%", "300MiB")])
        });
        let runner = Runner::new(engine.clone(), &config());
        let code = tempfile::tempdir().unwrap();

        let report = runner.run(&job(code.path())).await.unwrap();

        assert_eq!(report.exit_code, 3);
        assert!(!report.timed_out);
        assert_eq!(report.samples_collected, 2);
        assert_eq!(report.avg_cpu_percent, 50.0);
        assert_eq!(report.avg_mem_mib, 200.0);
        assert_eq!(report.peak_mem_mib, 300.0);
        assert_eq!(report.logs, "hello from sandbox\n");
        assert!(report.energy_kwh > 0.0);
        assert_eq!(report.co2_grams, Some(report.energy_kwh * 400.0));
        assert_eq!(report.raw_stats.len(), 2);

        let specs = engine.specs();
        assert_eq!(specs.len(), 1);
        assert!(specs[0].name.starts_with("greenbox-run-"));
        assert_eq!(specs[0].command, vec!["python", "main.py"]);
        assert_eq!(
            specs[0].code_dir,
            std::fs::canonicalize(code.path()).unwrap()
        );

        let calls = engine.calls();
        assert!(calls.iter().any(|c| c.starts_with("remove greenbox-run-")));
    }

    #[tokio::test]
    async fn test_run_timeout_stops_container() {
        let engine = Arc::new(FakeEngine {
            wait: WaitBehavior::Hang,
            ..FakeEngine::with_stats(vec![sample("100%", "50MiB")])
        });
        let runner = Runner::new(engine.clone(), &config());
        let code = tempfile::tempdir().unwrap();
        let mut job = job(code.path());
        job.timeout = Some(Duration::from_millis(100));

        let report = runner.run(&job).await.unwrap();

        assert_eq!(report.exit_code, WAIT_FAILED_EXIT_CODE);
        assert!(report.timed_out);
        let calls = engine.calls();
        assert!(calls.iter().any(|c| c.starts_with("stop ")));
        assert!(calls.iter().any(|c| c.starts_with("remove ")));
    }

    #[tokio::test]
    async fn test_run_wait_failure() {
        let engine = Arc::new(FakeEngine {
            wait: WaitBehavior::Fail,
            ..FakeEngine::with_stats(vec![sample("5%", "10MiB")])
        });
        let runner = Runner::new(engine.clone(), &config());
        let code = tempfile::tempdir().unwrap();

        // The stats sample may or may not land before the wait fails
        match runner.run(&job(code.path())).await {
            Ok(report) => {
                assert_eq!(report.exit_code, WAIT_FAILED_EXIT_CODE);
                assert!(!report.timed_out);
            }
            Err(RunError::Stats { exit_code, .. }) => {
                assert_eq!(exit_code, WAIT_FAILED_EXIT_CODE);
            }
            Err(e) => panic!("unexpected error: {}", e),
        }
        assert!(engine.calls().iter().any(|c| c.starts_with("remove ")));
    }

    #[tokio::test]
    async fn test_run_without_samples_is_stats_error() {
        let engine = Arc::new(FakeEngine {
            logs: "done".to_string(),
            ..FakeEngine::default()
        });
        let runner = Runner::new(engine.clone(), &config());
        let code = tempfile::tempdir().unwrap();

        let err = runner.run(&job(code.path())).await.unwrap_err();
        match err {
            RunError::Stats {
                source,
                exit_code,
                logs,
            } => {
                assert_eq!(source, StatsError::NoSamples);
                assert_eq!(exit_code, 0);
                assert_eq!(logs, "done");
            }
            other => panic!("unexpected error: {}", other),
        }
        assert!(engine.calls().iter().any(|c| c.starts_with("remove ")));
    }

    #[tokio::test]
    async fn test_run_missing_code_dir() {
        let engine = Arc::new(FakeEngine::default());
        let runner = Runner::new(engine.clone(), &config());
        let code = tempfile::tempdir().unwrap();

        let err = runner
            .run(&job(&code.path().join("nope")))
            .await
            .unwrap_err();
        assert!(matches!(err, RunError::CodeDirMissing(_)));
        assert!(engine.calls().is_empty());
    }

    #[tokio::test]
    async fn test_run_rejects_escaping_entrypoint() {
        let engine = Arc::new(FakeEngine::default());
        let runner = Runner::new(engine, &config());
        let code = tempfile::tempdir().unwrap();
        let mut job = job(code.path());
        job.entrypoint = "../host.py".to_string();

        let err = runner.run(&job).await.unwrap_err();
        assert!(matches!(err, RunError::InvalidEntrypoint(_)));
    }

    #[tokio::test]
    async fn test_run_engine_unavailable() {
        let engine = Arc::new(FakeEngine {
            reachable: false,
            ..FakeEngine::default()
        });
        let runner = Runner::new(engine, &config());
        let code = tempfile::tempdir().unwrap();

        let err = runner.run(&job(code.path())).await.unwrap_err();
        assert!(matches!(err, RunError::EngineUnavailable(_)));
        assert!(err.to_string().contains("Is Docker running?"));
    }

    #[tokio::test]
    async fn test_run_builds_missing_image_first() {
        let engine = Arc::new(FakeEngine::with_stats(vec![sample("1%", "1MiB")]));
        engine.image_present.store(false, Ordering::SeqCst);
        let runner = Runner::new(engine.clone(), &config());
        let code = tempfile::tempdir().unwrap();

        runner.run(&job(code.path())).await.unwrap();

        let calls = engine.calls();
        let build = calls.iter().position(|c| c.starts_with("build ")).unwrap();
        let run = calls.iter().position(|c| c.starts_with("run ")).unwrap();
        assert!(build < run);
    }

    #[tokio::test]
    async fn test_run_launch_failure_removes_created_container() {
        let engine = Arc::new(FakeEngine {
            run_fails: true,
            ..FakeEngine::default()
        });
        let runner = Runner::new(engine.clone(), &config());
        let code = tempfile::tempdir().unwrap();

        let err = runner.run(&job(code.path())).await.unwrap_err();
        assert!(matches!(err, RunError::Launch(_)));

        let calls = engine.calls();
        let run = calls.iter().find(|c| c.starts_with("run ")).unwrap();
        let name = run.trim_start_matches("run ");
        assert!(calls.contains(&format!("remove {}", name)));
        assert!(!calls.iter().any(|c| c.starts_with("wait ")));
    }

    #[tokio::test]
    async fn test_run_mounts_relative_dir_as_absolute() {
        let engine = Arc::new(FakeEngine::with_stats(vec![sample("1%", "1MiB")]));
        let runner = Runner::new(engine.clone(), &config());
        let code = tempfile::tempdir_in(".").unwrap();
        let relative = PathBuf::from(".").join(code.path().file_name().unwrap());
        assert!(relative.is_relative());

        runner.run(&job(&relative)).await.unwrap();

        let spec = engine.specs().remove(0);
        assert!(spec.code_dir.is_absolute());
        let args = spec.docker_args();
        let mount = args
            .iter()
            .position(|a| a == "-v")
            .map(|i| args[i + 1].clone())
            .unwrap();
        assert!(mount.starts_with('/'));
        assert!(mount.ends_with(":/app:ro"));
    }

    #[tokio::test]
    async fn test_run_cancelled_still_removes_container() {
        let engine = Arc::new(FakeEngine {
            wait: WaitBehavior::Hang,
            ..FakeEngine::default()
        });
        let runner = Runner::new(engine.clone(), &config());
        let code = tempfile::tempdir().unwrap();
        let job = job(code.path());

        let task = tokio::spawn(async move { runner.run(&job).await });
        tokio::time::sleep(Duration::from_millis(100)).await;
        task.abort();
        assert!(task.await.unwrap_err().is_cancelled());

        tokio::time::sleep(Duration::from_millis(50)).await;
        let calls = engine.calls();
        let run = calls.iter().find(|c| c.starts_with("run ")).unwrap();
        let name = run.trim_start_matches("run ");
        assert!(calls.contains(&format!("remove {}", name)));
    }

    #[tokio::test]
    async fn test_run_truncates_logs() {
        let engine = Arc::new(FakeEngine {
            logs: "é".repeat(100),
            ..FakeEngine::with_stats(vec![sample("1%", "1MiB")])
        });
        let mut config = config();
        config.runner.max_log_bytes = 5;
        let runner = Runner::new(engine, &config);
        let code = tempfile::tempdir().unwrap();

        let report = runner.run(&job(code.path())).await.unwrap();
        assert!(report.logs.starts_with("éé\n... [output truncated]"));
    }

    #[test]
    fn test_truncate_output_short_text_untouched() {
        assert_eq!(truncate_output("abc".to_string(), 10), "abc");
    }
}
