//! In-memory engine for exercising the runner without Docker

use anyhow::{Result, bail};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::path::Path;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use super::engine::{ContainerEngine, ContainerSpec, StatsProbe};

#[derive(Debug, Clone, Copy)]
pub enum WaitBehavior {
    Exit(i64),
    /// Never returns within any test timeout
    Hang,
    Fail,
}

pub struct FakeEngine {
    pub reachable: bool,
    pub image_present: AtomicBool,
    pub build_fails: bool,
    pub run_fails: bool,
    pub wait: WaitBehavior,
    pub logs: String,
    pub stats: Mutex<VecDeque<StatsProbe>>,
    pub running: AtomicBool,
    pub calls: Mutex<Vec<String>>,
    pub specs: Mutex<Vec<ContainerSpec>>,
}

impl Default for FakeEngine {
    fn default() -> Self {
        Self {
            reachable: true,
            image_present: AtomicBool::new(true),
            build_fails: false,
            run_fails: false,
            wait: WaitBehavior::Exit(0),
            logs: String::new(),
            stats: Mutex::new(VecDeque::new()),
            running: AtomicBool::new(false),
            calls: Mutex::new(Vec::new()),
            specs: Mutex::new(Vec::new()),
        }
    }
}

impl FakeEngine {
    pub fn with_stats(stats: Vec<StatsProbe>) -> Self {
        Self {
            stats: Mutex::new(stats.into()),
            ..Self::default()
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn specs(&self) -> Vec<ContainerSpec> {
        self.specs.lock().unwrap().clone()
    }

    fn record(&self, call: impl Into<String>) {
        self.calls.lock().unwrap().push(call.into());
    }
}

#[async_trait]
impl ContainerEngine for FakeEngine {
    async fn ping(&self) -> Result<()> {
        self.record("ping");
        if !self.reachable {
            bail!("Docker daemon is not reachable. Is Docker running?");
        }
        Ok(())
    }

    async fn image_exists(&self, tag: &str) -> Result<bool> {
        self.record(format!("image_exists {}", tag));
        Ok(self.image_present.load(Ordering::SeqCst))
    }

    async fn build_image(&self, context: &Path, tag: &str) -> Result<()> {
        self.record(format!("build {}", tag));
        if !context.join("Dockerfile").is_file() {
            bail!("no Dockerfile in {}", context.display());
        }
        if self.build_fails {
            bail!("pip install failed");
        }
        self.image_present.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn run_detached(&self, spec: &ContainerSpec) -> Result<String> {
        self.record(format!("run {}", spec.name));
        if self.run_fails {
            bail!("docker run failed: no such image");
        }
        self.specs.lock().unwrap().push(spec.clone());
        self.running.store(true, Ordering::SeqCst);
        Ok("0123456789abcdef".to_string())
    }

    async fn stats(&self, _name: &str) -> Result<StatsProbe> {
        let next = self.stats.lock().unwrap().pop_front();
        Ok(next.unwrap_or(StatsProbe::NotReady))
    }

    async fn wait(&self, name: &str) -> Result<i64> {
        self.record(format!("wait {}", name));
        match self.wait {
            WaitBehavior::Exit(code) => {
                // Give the monitor a chance to sample
                tokio::time::sleep(Duration::from_millis(50)).await;
                self.running.store(false, Ordering::SeqCst);
                Ok(code)
            }
            WaitBehavior::Hang => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(0)
            }
            WaitBehavior::Fail => bail!("connection reset"),
        }
    }

    async fn status(&self, _name: &str) -> Result<Option<String>> {
        let status = if self.running.load(Ordering::SeqCst) {
            "running"
        } else {
            "exited"
        };
        Ok(Some(status.to_string()))
    }

    async fn stop(&self, name: &str, _timeout_secs: u64) -> Result<()> {
        self.record(format!("stop {}", name));
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn logs(&self, name: &str) -> Result<String> {
        self.record(format!("logs {}", name));
        Ok(self.logs.clone())
    }

    async fn remove(&self, name: &str) -> Result<()> {
        self.record(format!("remove {}", name));
        Ok(())
    }
}
